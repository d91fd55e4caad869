//! Feed ingestion: download, tokenize, parse and normalize RSS items.
//!
//! - [`fetcher`] - HTTP client setup and the streaming feed download
//! - [`tokens`] - Pull tokenizer over the response body (`quick-xml`)
//! - [`parser`] - RSS state machine that turns tokens into stored items
//! - [`normalize`] - Date parsing and image URL inference
//! - [`image`] - Capped, best-effort image download
//!
//! # Example
//!
//! ```ignore
//! use feedsnap::feed::{build_client, fetch_feed, parse_feed, ImageFetcher, XmlTokens};
//!
//! let client = build_client()?;
//! let body = fetch_feed(&client, "https://example.com/rss").await?;
//! let mut tokens = XmlTokens::new(body);
//! let summary = parse_feed(&mut tokens, &ImageFetcher::new(client), &mut db).await?;
//! ```

pub mod fetcher;
pub mod image;
pub mod normalize;
pub mod parser;
pub mod tokens;

pub use fetcher::{build_client, fetch_feed, FetchError, CONNECT_TIMEOUT, READ_TIMEOUT};
pub use image::{ImageError, ImageFetcher, ImageSource, MAX_IMAGE_SIZE};
pub use normalize::{infer_image_url, parse_pub_date};
pub use parser::{parse_feed, ParseError, ParseSummary};
pub use tokens::{Token, TokenSource, XmlTokens};
