use std::io;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::redirect::Policy;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;

use crate::util::{validate_url, UrlValidationError};

/// Time allowed to establish a connection (feed and images).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Time allowed between two successful reads of a response body.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_REDIRECTS: usize = 3;
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while opening a feed for reading.
///
/// Failures after the body starts streaming surface later as I/O errors from
/// the returned reader.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The feed URL is not an absolute http(s) URL
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// Network-level error (DNS, connection, TLS, timeout, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The body stream broke or stalled after the response started
    #[error("Feed stream failed: {0}")]
    Stream(std::io::Error),
}

/// Create a redirect policy with loop detection and limited hops.
fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// Builds the HTTP client shared by the feed and image downloads.
///
/// No overall request timeout: a body may stream for as long as each read
/// completes within [`READ_TIMEOUT`].
pub fn build_client() -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .redirect(create_redirect_policy())
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;
    Ok(client)
}

/// Opens `url` and returns a buffered reader over the response body.
///
/// Only the status line and headers have been received when this returns;
/// the body is pulled from the network as the reader is consumed. Dropping
/// the reader releases the connection.
///
/// # Errors
///
/// - [`FetchError::InvalidUrl`] for anything but an absolute http(s) URL
/// - [`FetchError::Network`] if the connection cannot be established in time
/// - [`FetchError::HttpStatus`] for a non-2xx response
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
) -> Result<impl AsyncBufRead + Unpin + Send, FetchError> {
    let url = validate_url(url)?;

    let response = client.get(url.clone()).send().await?;
    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    tracing::debug!(
        url = %url,
        status = response.status().as_u16(),
        content_length = ?response.content_length(),
        "Feed response received"
    );

    let body = response.bytes_stream().map_err(io::Error::other);
    Ok(StreamReader::new(Box::pin(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_feed_streams_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string("<rss></rss>"))
            .mount(&mock_server)
            .await;

        let client = build_client().unwrap();
        let url = format!("{}/feed", mock_server.uri());
        let mut reader = fetch_feed(&client, &url).await.unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "<rss></rss>");
    }

    #[tokio::test]
    async fn test_fetch_feed_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = build_client().unwrap();
        let url = format!("{}/feed", mock_server.uri());
        let result = fetch_feed(&client, &url).await;
        match result {
            Err(FetchError::HttpStatus(404)) => {}
            Err(e) => panic!("Expected HttpStatus(404), got {:?}", e),
            Ok(_) => panic!("Expected HttpStatus(404), got a body"),
        }
    }

    #[tokio::test]
    async fn test_fetch_feed_does_not_retry_server_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = build_client().unwrap();
        let url = format!("{}/feed", mock_server.uri());
        let result = fetch_feed(&client, &url).await;
        assert!(matches!(result, Err(FetchError::HttpStatus(503))));
    }

    #[tokio::test]
    async fn test_fetch_feed_rejects_bad_urls() {
        let client = build_client().unwrap();
        for url in ["", "not a url", "file:///etc/passwd", "ftp://example.com/rss"] {
            let result = fetch_feed(&client, url).await;
            assert!(
                matches!(result, Err(FetchError::InvalidUrl(_))),
                "{:?} should be rejected",
                url
            );
        }
    }

    #[tokio::test]
    async fn test_fetch_feed_connection_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = build_client().unwrap();
        let url = format!("http://{}/feed", addr);
        let result = fetch_feed(&client, &url).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
    }

    #[tokio::test]
    async fn test_redirect_loop_is_an_error() {
        let mock_server = MockServer::start().await;
        let uri = mock_server.uri();
        Mock::given(path("/a"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", format!("{}/b", uri)))
            .mount(&mock_server)
            .await;
        Mock::given(path("/b"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", format!("{}/a", uri)))
            .mount(&mock_server)
            .await;

        let client = build_client().unwrap();
        let start = format!("{}/a", uri);
        let result = fetch_feed(&client, &start).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
    }

    #[tokio::test]
    async fn test_single_redirect_is_followed() {
        let mock_server = MockServer::start().await;
        let uri = mock_server.uri();
        Mock::given(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("Location", format!("{}/new", uri)),
            )
            .mount(&mock_server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<rss/>"))
            .mount(&mock_server)
            .await;

        let client = build_client().unwrap();
        let start = format!("{}/old", uri);
        let mut reader = fetch_feed(&client, &start).await.unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "<rss/>");
    }
}
