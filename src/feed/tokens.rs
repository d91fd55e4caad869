//! Pull tokenizer: one XML token at a time from any async byte reader.
//!
//! Wraps `quick-xml`'s async reader and flattens its event model into the four
//! tokens the feed parser cares about. Comments, processing instructions, the
//! XML declaration and DOCTYPE are dropped. Consecutive text and CDATA
//! sections are coalesced into a single [`Token::Text`].

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::AsyncBufRead;

use super::parser::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Opening tag; self-closing elements arrive as `Start` followed by `End`.
    Start(String),
    End(String),
    /// Character data with entities and CDATA already decoded.
    Text(String),
    Eof,
}

/// Anything that can hand the parser its next token.
#[async_trait]
pub trait TokenSource: Send {
    async fn next_token(&mut self) -> Result<Token, ParseError>;
}

pub struct XmlTokens<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    /// Token read while coalescing text, returned on the next call.
    pending: Option<Token>,
}

impl<R> XmlTokens<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(input: R) -> Self {
        let mut reader = Reader::from_reader(input);
        let config = reader.config_mut();
        config.trim_text(false);
        config.expand_empty_elements = true;
        config.check_end_names = true;

        Self {
            reader,
            buf: Vec::new(),
            pending: None,
        }
    }

    /// Reads the next raw event and maps it to a token. `None` means the event
    /// carries nothing the parser needs.
    async fn read_raw(&mut self) -> Result<Option<Token>, ParseError> {
        self.buf.clear();
        let event = self
            .reader
            .read_event_into_async(&mut self.buf)
            .await
            .map_err(ParseError::from_xml)?;

        let token = match event {
            Event::Start(e) => Some(Token::Start(
                String::from_utf8_lossy(e.name().as_ref()).into_owned(),
            )),
            Event::End(e) => Some(Token::End(
                String::from_utf8_lossy(e.name().as_ref()).into_owned(),
            )),
            Event::Text(e) => {
                let text = match e.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(err) => {
                        // Undeclared HTML entities (&nbsp; and friends) are common in
                        // feeds; keep the raw text rather than failing the whole run.
                        tracing::debug!(error = %err, "Keeping undecodable text as-is");
                        String::from_utf8_lossy(&e).into_owned()
                    }
                };
                Some(Token::Text(text))
            }
            Event::CData(e) => Some(Token::Text(String::from_utf8_lossy(&e).into_owned())),
            Event::Eof => Some(Token::Eof),
            // Empty never arrives with expand_empty_elements
            Event::Empty(_)
            | Event::Comment(_)
            | Event::Decl(_)
            | Event::PI(_)
            | Event::DocType(_) => None,
        };

        Ok(token)
    }
}

#[async_trait]
impl<R> TokenSource for XmlTokens<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_token(&mut self) -> Result<Token, ParseError> {
        if let Some(token) = self.pending.take() {
            return Ok(token);
        }

        let mut text: Option<String> = None;
        loop {
            match self.read_raw().await? {
                None => continue,
                Some(Token::Text(chunk)) => match text.as_mut() {
                    Some(acc) => acc.push_str(&chunk),
                    None => text = Some(chunk),
                },
                Some(token) => {
                    return Ok(match text {
                        Some(acc) => {
                            self.pending = Some(token);
                            Token::Text(acc)
                        }
                        None => token,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn collect(xml: &str) -> Result<Vec<Token>, ParseError> {
        let mut tokens = XmlTokens::new(xml.as_bytes());
        let mut out = Vec::new();
        loop {
            let token = tokens.next_token().await?;
            let done = token == Token::Eof;
            out.push(token);
            if done {
                return Ok(out);
            }
        }
    }

    fn start(name: &str) -> Token {
        Token::Start(name.to_string())
    }

    fn end(name: &str) -> Token {
        Token::End(name.to_string())
    }

    fn text(value: &str) -> Token {
        Token::Text(value.to_string())
    }

    #[tokio::test]
    async fn test_basic_tokens() {
        let tokens = collect(r#"<?xml version="1.0"?><rss><title>Hi</title></rss>"#)
            .await
            .unwrap();
        assert_eq!(
            tokens,
            vec![
                start("rss"),
                start("title"),
                text("Hi"),
                end("title"),
                end("rss"),
                Token::Eof
            ]
        );
    }

    #[tokio::test]
    async fn test_self_closing_expands() {
        let tokens = collect("<a><b/></a>").await.unwrap();
        assert_eq!(
            tokens,
            vec![start("a"), start("b"), end("b"), end("a"), Token::Eof]
        );
    }

    #[tokio::test]
    async fn test_entities_are_decoded() {
        let tokens = collect("<t>Fish &amp; Chips &lt;3</t>").await.unwrap();
        assert_eq!(tokens[1], text("Fish & Chips <3"));
    }

    #[tokio::test]
    async fn test_cdata_and_text_coalesce() {
        let tokens = collect("<d>\n  <![CDATA[<p>Hello</p>]]>\n</d>").await.unwrap();
        assert_eq!(
            tokens,
            vec![start("d"), text("\n  <p>Hello</p>\n"), end("d"), Token::Eof]
        );
    }

    #[tokio::test]
    async fn test_whitespace_is_not_trimmed() {
        let tokens = collect("<t>  padded  </t>").await.unwrap();
        assert_eq!(tokens[1], text("  padded  "));
    }

    #[tokio::test]
    async fn test_comments_are_dropped() {
        let tokens = collect("<a><!-- note --><b>x</b></a>").await.unwrap();
        assert_eq!(
            tokens,
            vec![start("a"), start("b"), text("x"), end("b"), end("a"), Token::Eof]
        );
    }

    #[tokio::test]
    async fn test_prefixed_names_are_kept() {
        let tokens = collect(r#"<a xmlns:media="m"><media:content/></a>"#)
            .await
            .unwrap();
        assert_eq!(tokens[1], start("media:content"));
    }

    #[tokio::test]
    async fn test_unknown_entity_keeps_raw_text() {
        let tokens = collect("<t>a&nbsp;b</t>").await.unwrap();
        assert_eq!(tokens[1], text("a&nbsp;b"));
    }

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct Reset;

    #[tokio::test]
    async fn test_read_failure_keeps_source_error() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(&b"<rss><channel>"[..]),
            Err(std::io::Error::other(Reset)),
        ];
        let reader = tokio_util::io::StreamReader::new(futures::stream::iter(chunks));
        let mut tokens = XmlTokens::new(reader);

        let err = loop {
            match tokens.next_token().await {
                Ok(Token::Eof) => panic!("stream error was swallowed"),
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        match err {
            ParseError::Io(io) => {
                assert!(io.get_ref().is_some_and(|inner| inner.is::<Reset>()));
            }
            other => panic!("Expected Io, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatched_end_tag_is_malformed() {
        let result = collect("<a><b></a>").await;
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }
}
