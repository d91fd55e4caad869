//! Refresh orchestration.
//!
//! [`Ingestor::refresh`] prepares the store, then runs fetch → parse → persist
//! on a background task and hands back a [`RefreshHandle`] that resolves once
//! with the outcome. Only one run may be in flight per `Ingestor` (and its
//! clones); a second `refresh` is rejected with [`IngestError::Busy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::feed::{
    fetch_feed, parse_feed, FetchError, ImageFetcher, ParseError, ParseSummary, XmlTokens,
};
use crate::storage::Database;

/// How a refresh replaces the previous items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    /// Delete everything before the run starts, then write each item as it
    /// is parsed. A failed run leaves the store empty or partially filled.
    #[default]
    ClearFirst,
    /// Replace inside one transaction opened after the feed responds. A failed
    /// run leaves the previous items untouched.
    Staged,
}

/// Errors that end a refresh run.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Unreachable host, timeout, bad status or URL, or the body broke mid-read
    #[error("Feed fetch failed: {0}")]
    FetchFailed(#[from] FetchError),
    /// Not RSS, or not well-formed XML
    #[error("Malformed feed: {0}")]
    MalformedFeed(String),
    /// Clearing, staging or writing items failed
    #[error("Store error: {0:#}")]
    Store(anyhow::Error),
    /// Another refresh is still running
    #[error("A refresh is already in progress")]
    Busy,
    /// The background task ended without reporting (panic or runtime shutdown)
    #[error("Refresh task ended unexpectedly")]
    Aborted,
}

impl From<ParseError> for IngestError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Malformed(msg) => IngestError::MalformedFeed(msg),
            ParseError::Io(e) => IngestError::FetchFailed(FetchError::Stream(e)),
            ParseError::Store(e) => IngestError::Store(e),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub url: String,
    pub items: usize,
    pub images: usize,
    pub undated: usize,
}

/// Completion of one refresh. Resolves exactly once.
#[must_use = "a refresh handle does nothing unless awaited"]
pub struct RefreshHandle {
    rx: oneshot::Receiver<Result<RefreshSummary, IngestError>>,
}

impl RefreshHandle {
    /// `true` iff the run fetched, parsed and stored the whole feed.
    ///
    /// Missing images and unparsable dates still count as success.
    pub async fn wait(self) -> bool {
        self.wait_detailed().await.is_ok()
    }

    pub async fn wait_detailed(self) -> Result<RefreshSummary, IngestError> {
        self.rx.await.unwrap_or(Err(IngestError::Aborted))
    }
}

/// Clears the busy flag when the run ends, including by panic.
struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Runs refreshes of a feed into a [`Database`].
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    client: reqwest::Client,
    mode: ReplaceMode,
    busy: Arc<AtomicBool>,
}

impl Ingestor {
    /// `client` is used for the feed and all image downloads; build it with
    /// [`crate::feed::build_client`] to get the standard timeouts.
    pub fn new(db: Database, client: reqwest::Client) -> Self {
        Self {
            db,
            client,
            mode: ReplaceMode::default(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_mode(mut self, mode: ReplaceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> ReplaceMode {
        self.mode
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Starts a refresh of `url`.
    ///
    /// In [`ReplaceMode::ClearFirst`] the store is already empty when this
    /// returns. The fetch itself happens on a spawned task; await the handle
    /// for the result. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`IngestError::Busy`] if a previous run has not finished; the store
    ///   is not touched
    /// - [`IngestError::Store`] if clearing the store failed; nothing is spawned
    pub async fn refresh(&self, url: &str) -> Result<RefreshHandle, IngestError> {
        let guard = BusyGuard::acquire(&self.busy).ok_or(IngestError::Busy)?;

        if self.mode == ReplaceMode::ClearFirst {
            let removed = self
                .db
                .delete_all_items()
                .await
                .map_err(IngestError::Store)?;
            tracing::debug!(removed = removed, "Cleared item store");
        }

        let ctx = RunContext {
            db: self.db.clone(),
            client: self.client.clone(),
            mode: self.mode,
            url: url.to_string(),
            _busy: guard,
        };

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let url = ctx.url.clone();
            let result = ctx.run().await;
            match &result {
                Ok(summary) => tracing::info!(
                    url = %url,
                    items = summary.items,
                    images = summary.images,
                    undated = summary.undated,
                    "Refresh complete"
                ),
                Err(e) => tracing::warn!(url = %url, error = %e, "Refresh failed"),
            }
            // The receiver may be gone; the result is already logged
            let _ = tx.send(result);
        });

        Ok(RefreshHandle { rx })
    }
}

/// Everything one run owns. Dropping it releases the busy flag.
struct RunContext {
    db: Database,
    client: reqwest::Client,
    mode: ReplaceMode,
    url: String,
    _busy: BusyGuard,
}

impl RunContext {
    async fn run(self) -> Result<RefreshSummary, IngestError> {
        tracing::info!(url = %self.url, mode = ?self.mode, "Refresh started");

        let body = fetch_feed(&self.client, &self.url).await?;
        let mut tokens = XmlTokens::new(body);
        let images = ImageFetcher::new(self.client.clone());

        let parsed = match self.mode {
            ReplaceMode::ClearFirst => {
                let mut sink = self.db.clone();
                parse_feed(&mut tokens, &images, &mut sink).await?
            }
            ReplaceMode::Staged => {
                let mut staged = self
                    .db
                    .stage_replacement()
                    .await
                    .map_err(IngestError::Store)?;
                match parse_feed(&mut tokens, &images, &mut staged).await {
                    Ok(summary) => {
                        staged.commit().await.map_err(IngestError::Store)?;
                        summary
                    }
                    Err(e) => {
                        if let Err(rollback) = staged.rollback().await {
                            tracing::warn!(error = %rollback, "Rollback of staged items failed");
                        }
                        return Err(e.into());
                    }
                }
            }
        };
        // Release the connection before reporting
        drop(tokens);

        let ParseSummary {
            items,
            images,
            undated,
        } = parsed;
        Ok(RefreshSummary {
            url: self.url,
            items,
            images,
            undated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::build_client;
    use crate::storage::FeedItem;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ONE_ITEM: &str = r#"<rss version="2.0"><channel>
        <item><title>Only</title><link>https://example.com/only</link></item>
    </channel></rss>"#;

    async fn serve_feed(body: &str, delay: Duration) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .set_delay(delay),
            )
            .mount(&mock_server)
            .await;
        mock_server
    }

    async fn ingestor(mode: ReplaceMode) -> (Ingestor, Database) {
        let db = Database::open(":memory:").await.unwrap();
        let ingestor = Ingestor::new(db.clone(), build_client().unwrap()).with_mode(mode);
        (ingestor, db)
    }

    fn old_item() -> FeedItem {
        FeedItem {
            id: 0,
            title: "Old".to_string(),
            ..FeedItem::default()
        }
    }

    #[test]
    fn test_parse_error_mapping() {
        assert!(matches!(
            IngestError::from(ParseError::Malformed("x".into())),
            IngestError::MalformedFeed(_)
        ));
        assert!(matches!(
            IngestError::from(ParseError::Io(std::io::Error::other("reset"))),
            IngestError::FetchFailed(FetchError::Stream(_))
        ));
        assert!(matches!(
            IngestError::from(ParseError::Store(anyhow::anyhow!("full"))),
            IngestError::Store(_)
        ));
    }

    #[test]
    fn test_replace_mode_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: ReplaceMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"staged\"").unwrap();
        assert_eq!(parsed.mode, ReplaceMode::Staged);
        let parsed: Wrapper = toml::from_str("mode = \"clear_first\"").unwrap();
        assert_eq!(parsed.mode, ReplaceMode::ClearFirst);
        assert!(toml::from_str::<Wrapper>("mode = \"merge\"").is_err());
    }

    #[tokio::test]
    async fn test_refresh_reports_summary() {
        let server = serve_feed(ONE_ITEM, Duration::ZERO).await;
        let (ingestor, db) = ingestor(ReplaceMode::ClearFirst).await;
        let url = format!("{}/feed", server.uri());

        let summary = ingestor.refresh(&url).await.unwrap().wait_detailed().await.unwrap();
        assert_eq!(
            summary,
            RefreshSummary {
                url,
                items: 1,
                images: 0,
                undated: 1,
            }
        );
        assert_eq!(db.count_items().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_first_empties_store_before_returning() {
        let server = serve_feed(ONE_ITEM, Duration::from_millis(300)).await;
        let (ingestor, db) = ingestor(ReplaceMode::ClearFirst).await;
        db.insert_item(&old_item()).await.unwrap();

        let handle = ingestor
            .refresh(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(db.count_items().await.unwrap(), 0);
        assert!(handle.wait().await);
    }

    #[tokio::test]
    async fn test_overlapping_refresh_is_rejected() {
        let server = serve_feed(ONE_ITEM, Duration::from_millis(300)).await;
        let (ingestor, _db) = ingestor(ReplaceMode::ClearFirst).await;
        let url = format!("{}/feed", server.uri());

        let first = ingestor.refresh(&url).await.unwrap();
        assert!(ingestor.is_busy());
        assert!(matches!(
            ingestor.clone().refresh(&url).await,
            Err(IngestError::Busy)
        ));

        assert!(first.wait().await);
        assert!(!ingestor.is_busy());

        // Free again once the first run reported
        assert!(ingestor.refresh(&url).await.unwrap().wait().await);
    }

    #[tokio::test]
    async fn test_rejected_refresh_leaves_store_alone() {
        let server = serve_feed(ONE_ITEM, Duration::from_millis(300)).await;
        let (ingestor, db) = ingestor(ReplaceMode::Staged).await;
        db.insert_item(&old_item()).await.unwrap();
        let url = format!("{}/feed", server.uri());

        let first = ingestor.refresh(&url).await.unwrap();
        assert!(matches!(ingestor.refresh(&url).await, Err(IngestError::Busy)));
        assert_eq!(db.count_items().await.unwrap(), 1);
        assert!(first.wait().await);
    }

    #[tokio::test]
    async fn test_busy_flag_released_after_failure() {
        let (ingestor, _db) = ingestor(ReplaceMode::ClearFirst).await;

        let result = ingestor.refresh("not a url").await.unwrap().wait_detailed().await;
        assert!(matches!(
            result,
            Err(IngestError::FetchFailed(FetchError::InvalidUrl(_)))
        ));
        assert!(!ingestor.is_busy());
    }

    #[tokio::test]
    async fn test_staged_failure_keeps_previous_items() {
        let server = serve_feed(
            "<rss><channel><item><title>New</title></item><item><title>Cut",
            Duration::ZERO,
        )
        .await;
        let (ingestor, db) = ingestor(ReplaceMode::Staged).await;
        db.insert_item(&old_item()).await.unwrap();

        let result = ingestor
            .refresh(&format!("{}/feed", server.uri()))
            .await
            .unwrap()
            .wait_detailed()
            .await;
        assert!(matches!(result, Err(IngestError::MalformedFeed(_))));

        let items = db.query_items(None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Old");
    }

    #[tokio::test]
    async fn test_staged_success_replaces_items() {
        let server = serve_feed(ONE_ITEM, Duration::ZERO).await;
        let (ingestor, db) = ingestor(ReplaceMode::Staged).await;
        db.insert_item(&old_item()).await.unwrap();

        assert!(ingestor
            .refresh(&format!("{}/feed", server.uri()))
            .await
            .unwrap()
            .wait()
            .await);

        let items = db.query_items(None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Only");
    }
}
