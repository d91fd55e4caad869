//! SQLite-backed item store.
//!
//! Holds the items of the most recent ingestion run plus a small key-value
//! preference table. The ingestion pipeline only writes through [`ItemSink`];
//! the read side (`query_items`, `get_item`) serves the CLI.

mod items;
mod preferences;
mod schema;
mod types;

pub use items::{ItemSink, StagedItems};
pub use preferences::LAST_LOADED_URL;
pub use schema::Database;
pub use types::{DatabaseError, FeedItem};
