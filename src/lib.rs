//! Snapshot an RSS feed into a local SQLite store.
//!
//! A refresh downloads the feed, stream-parses its items, fetches one image
//! per item where available and writes every item as soon as it is parsed.
//! Each refresh replaces the previous snapshot entirely.
//!
//! ```ignore
//! use feedsnap::{feed::build_client, ingest::Ingestor, storage::Database};
//!
//! let db = Database::open("items.db").await?;
//! let ingestor = Ingestor::new(db.clone(), build_client()?);
//! let ok = ingestor.refresh("https://example.com/rss").await?.wait().await;
//! ```

pub mod config;
pub mod feed;
pub mod ingest;
pub mod storage;
pub mod util;
