//! Utility functions for common operations.
//!
//! - **URL validation**: only absolute http(s) URLs reach the HTTP client
//! - **Text processing**: terminal-safe, Unicode-aware rendering of feed text
//!
//! # Examples
//!
//! ```
//! use feedsnap::util::{truncate_to_width, validate_url};
//!
//! let url = validate_url("https://example.com/feed.xml").unwrap();
//! assert_eq!(url.scheme(), "https");
//!
//! assert_eq!(truncate_to_width("Long article title", 10), "Long arti…");
//! ```

mod text;
mod url_validator;

pub use text::{single_line, strip_control_chars, strip_tags, truncate_to_width};
pub use url_validator::{validate_url, UrlValidationError};
