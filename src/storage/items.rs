use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};

use super::schema::Database;
use super::types::{FeedItem, ItemDbRow};

/// Maximum number of items returned by a single listing query (OOM protection)
const MAX_ITEMS: i64 = 2000;

/// Write side of the item store as seen by the feed parser.
///
/// Every parsed item is handed over as soon as it is complete; implementations
/// must not reorder or buffer them across calls.
#[async_trait]
pub trait ItemSink: Send {
    async fn insert(&mut self, item: &FeedItem) -> Result<()>;
}

async fn insert_row<'e, E>(executor: E, item: &FeedItem) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO items (id, pub_date, title, link, description, image_url, image_content)
        VALUES (?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    .bind(item.id)
    .bind(item.published_at)
    .bind(&item.title)
    .bind(&item.link)
    .bind(&item.description)
    .bind(&item.image_url)
    .bind(&item.image_content)
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Escape `%`, `_` and the escape character itself so a search term matches literally.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl Database {
    // ========================================================================
    // Item Writes
    // ========================================================================

    /// Delete every stored item. Returns the number of rows removed.
    pub async fn delete_all_items(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM items").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Insert one item (autocommit) and return its id.
    pub async fn insert_item(&self, item: &FeedItem) -> Result<i64> {
        insert_row(&self.pool, item).await
    }

    /// Start a replacement that only becomes visible on [`StagedItems::commit`].
    ///
    /// The delete of the current content runs inside the same transaction, so a
    /// rollback (or drop) leaves the previous items untouched.
    pub async fn stage_replacement(&self) -> Result<StagedItems> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM items").execute(&mut *tx).await?;
        tracing::debug!(
            removed = removed.rows_affected(),
            "Staged replacement started"
        );
        Ok(StagedItems { tx, inserted: 0 })
    }

    // ========================================================================
    // Item Queries
    // ========================================================================

    /// List items, most recently published first.
    ///
    /// `filter` is a case-insensitive substring of the title; `None` or an
    /// empty string returns everything. Items sharing a publication date keep
    /// their feed order.
    pub async fn query_items(&self, filter: Option<&str>) -> Result<Vec<FeedItem>> {
        let rows = match filter.filter(|f| !f.is_empty()) {
            Some(term) => {
                sqlx::query_as::<_, ItemDbRow>(
                    r#"
                    SELECT id, pub_date, title, link, description, image_url, image_content
                    FROM items
                    WHERE title LIKE ? ESCAPE '\'
                    ORDER BY pub_date DESC, id ASC
                    LIMIT ?
                "#,
                )
                .bind(like_pattern(term))
                .bind(MAX_ITEMS)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ItemDbRow>(
                    r#"
                    SELECT id, pub_date, title, link, description, image_url, image_content
                    FROM items
                    ORDER BY pub_date DESC, id ASC
                    LIMIT ?
                "#,
                )
                .bind(MAX_ITEMS)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }

    /// Get a single item by its id.
    pub async fn get_item(&self, id: i64) -> Result<Option<FeedItem>> {
        let row = sqlx::query_as::<_, ItemDbRow>(
            r#"
            SELECT id, pub_date, title, link, description, image_url, image_content
            FROM items
            WHERE id = ?
        "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ItemDbRow::into_item))
    }

    pub async fn count_items(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Write-through: each item is committed as soon as it is parsed.
#[async_trait]
impl ItemSink for Database {
    async fn insert(&mut self, item: &FeedItem) -> Result<()> {
        self.insert_item(item).await?;
        Ok(())
    }
}

/// An open replacement transaction created by [`Database::stage_replacement`].
pub struct StagedItems {
    tx: Transaction<'static, Sqlite>,
    inserted: usize,
}

impl StagedItems {
    /// Publish the staged items, replacing the previous content.
    pub async fn commit(self) -> Result<usize> {
        self.tx.commit().await?;
        Ok(self.inserted)
    }

    /// Discard the staged items and keep the previous content.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl ItemSink for StagedItems {
    async fn insert(&mut self, item: &FeedItem) -> Result<()> {
        insert_row(&mut *self.tx, item).await?;
        self.inserted += 1;
        Ok(())
    }
}
