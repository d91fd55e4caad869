use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The item store is locked by another feedsnap process. Please wait for it to finish.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as
/// one of these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Data Structures
// ============================================================================

/// One feed entry as persisted in the `items` table.
///
/// Built once per ingestion run and never updated: the next run deletes every
/// row before (or, in staged mode, while) repopulating the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedItem {
    /// Position of the item in the source feed, starting at 0 for each run.
    pub id: i64,
    pub title: String,
    pub link: String,
    /// Raw HTML/text body exactly as the feed provided it.
    pub description: String,
    /// Explicit `<image><url>` value, or the URL inferred from `description`.
    pub image_url: Option<String>,
    /// Downloaded image bytes, never more than [`crate::feed::MAX_IMAGE_SIZE`].
    pub image_content: Option<Vec<u8>>,
    /// Milliseconds since the Unix epoch; 0 when `pubDate` was missing or unparsable.
    pub published_at: i64,
}

/// Internal row type for item queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub id: i64,
    pub pub_date: i64,
    pub title: String,
    pub link: String,
    pub description: String,
    pub image_url: Option<String>,
    pub image_content: Option<Vec<u8>>,
}

impl ItemDbRow {
    pub(crate) fn into_item(self) -> FeedItem {
        FeedItem {
            id: self.id,
            title: self.title,
            link: self.link,
            description: self.description,
            image_url: self.image_url,
            image_content: self.image_content,
            published_at: self.pub_date,
        }
    }
}
