//! Streaming RSS parser.
//!
//! Walks the token stream with an explicit stack of [`State`]s. Each item is
//! normalized and handed to the [`ItemSink`] the moment its `</item>` arrives,
//! so memory use does not grow with the feed length. Unknown elements at any
//! level are skipped as whole subtrees.

use std::sync::Arc;

use thiserror::Error;

use super::image::ImageSource;
use super::normalize::{infer_image_url, parse_pub_date};
use super::tokens::{Token, TokenSource};
use crate::storage::{FeedItem, ItemSink};

/// Fatal parse failures. Anything recoverable (bad date, missing image) is
/// logged and defaulted instead.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not an RSS document, or the token sequence broke the expected shape
    #[error("Malformed feed: {0}")]
    Malformed(String),
    /// The underlying byte stream failed mid-read
    #[error("Read failed: {0}")]
    Io(#[from] std::io::Error),
    /// The item store rejected a write
    #[error("Store write failed: {0}")]
    Store(anyhow::Error),
}

impl ParseError {
    pub(crate) fn from_xml(err: quick_xml::Error) -> Self {
        match err {
            quick_xml::Error::Io(shared) => ParseError::Io(
                Arc::try_unwrap(shared)
                    .unwrap_or_else(|shared| std::io::Error::new(shared.kind(), shared)),
            ),
            other => ParseError::Malformed(other.to_string()),
        }
    }
}

/// Counters for one parse pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    /// Items handed to the sink
    pub items: usize,
    /// Items stored with downloaded image bytes
    pub images: usize,
    /// Items whose `pubDate` was missing or unparsable
    pub undated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leaf {
    Title,
    Link,
    Description,
    PubDate,
    ImageUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Document,
    Rss,
    Channel,
    Item,
    Image,
    Leaf(Leaf),
}

/// What to do with a start tag seen directly inside `<item>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemChild {
    Leaf(Leaf),
    Image,
    Skip,
}

impl ItemChild {
    fn classify(name: &str) -> Self {
        match name {
            "title" => ItemChild::Leaf(Leaf::Title),
            "link" => ItemChild::Leaf(Leaf::Link),
            "description" => ItemChild::Leaf(Leaf::Description),
            "pubDate" => ItemChild::Leaf(Leaf::PubDate),
            "image" => ItemChild::Image,
            _ => ItemChild::Skip,
        }
    }
}

/// Raw field values of the item currently being read.
#[derive(Debug, Default)]
struct ItemDraft {
    title: String,
    link: String,
    description: String,
    pub_date: String,
    image_url: Option<String>,
}

impl ItemDraft {
    fn set(&mut self, leaf: Leaf, value: String) {
        match leaf {
            Leaf::Title => self.title = value,
            Leaf::Link => self.link = value,
            Leaf::Description => self.description = value,
            Leaf::PubDate => self.pub_date = value,
            // Kept verbatim, even when blank; an empty `<url>` still counts as explicit
            Leaf::ImageUrl => self.image_url = Some(value),
        }
    }
}

struct FeedParser<'a, T: ?Sized, I: ?Sized, S: ?Sized> {
    tokens: &'a mut T,
    images: &'a I,
    sink: &'a mut S,
    next_id: i64,
    summary: ParseSummary,
}

/// Parses an RSS document from `tokens`, storing every `<item>` in `sink`.
///
/// Items get ids `0, 1, 2, …` in document order. Images (explicit
/// `<image><url>` or inferred from the description) are fetched through
/// `images` before the item is stored. Parsing stops at `</rss>`; anything
/// after it is never read.
///
/// # Errors
///
/// - [`ParseError::Malformed`] if the root element is not `rss`, the document
///   ends early, or a leaf field contains markup
/// - [`ParseError::Io`] if the byte stream fails
/// - [`ParseError::Store`] if the sink rejects an item
///
/// Items stored before the error stay stored.
pub async fn parse_feed<T, I, S>(
    tokens: &mut T,
    images: &I,
    sink: &mut S,
) -> Result<ParseSummary, ParseError>
where
    T: TokenSource + ?Sized,
    I: ImageSource + ?Sized,
    S: ItemSink + ?Sized,
{
    FeedParser {
        tokens,
        images,
        sink,
        next_id: 0,
        summary: ParseSummary::default(),
    }
    .run()
    .await
}

impl<T, I, S> FeedParser<'_, T, I, S>
where
    T: TokenSource + ?Sized,
    I: ImageSource + ?Sized,
    S: ItemSink + ?Sized,
{
    async fn run(mut self) -> Result<ParseSummary, ParseError> {
        let mut stack = vec![State::Document];
        let mut draft = ItemDraft::default();
        let mut leaf_text: Option<String> = None;

        loop {
            let state = match stack.last() {
                Some(state) => *state,
                None => return Err(ParseError::Malformed("parser state underflow".to_string())),
            };
            let token = self.tokens.next_token().await?;

            match (state, token) {
                (_, Token::Eof) => {
                    return Err(ParseError::Malformed(match state {
                        State::Document => "no root element".to_string(),
                        _ => "document ended before </rss>".to_string(),
                    }));
                }

                (State::Document, Token::Start(name)) => {
                    if name != "rss" {
                        return Err(ParseError::Malformed(format!(
                            "expected <rss> root, found <{}>",
                            name
                        )));
                    }
                    stack.push(State::Rss);
                }
                (State::Rss, Token::End(_)) => return Ok(self.summary),

                (State::Rss, Token::Start(name)) if name == "channel" => {
                    stack.push(State::Channel);
                }
                (State::Channel, Token::Start(name)) if name == "item" => {
                    draft = ItemDraft::default();
                    stack.push(State::Item);
                }
                (State::Rss | State::Channel, Token::Start(_)) => self.skip().await?,

                (State::Item, Token::Start(name)) => match ItemChild::classify(&name) {
                    ItemChild::Leaf(leaf) => stack.push(State::Leaf(leaf)),
                    ItemChild::Image => {
                        draft.image_url = None;
                        stack.push(State::Image);
                    }
                    ItemChild::Skip => self.skip().await?,
                },
                (State::Item, Token::End(_)) => {
                    stack.pop();
                    self.finish_item(std::mem::take(&mut draft)).await?;
                }

                (State::Image, Token::Start(name)) if name == "url" => {
                    stack.push(State::Leaf(Leaf::ImageUrl));
                }
                (State::Image, Token::Start(_)) => self.skip().await?,

                (State::Leaf(_), Token::Text(text)) => match leaf_text.as_mut() {
                    Some(acc) => acc.push_str(&text),
                    None => leaf_text = Some(text),
                },
                (State::Leaf(leaf), Token::End(_)) => {
                    draft.set(leaf, leaf_text.take().unwrap_or_default());
                    stack.pop();
                }
                (State::Leaf(_), Token::Start(name)) => {
                    return Err(ParseError::Malformed(format!(
                        "unexpected <{}> inside a text field",
                        name
                    )));
                }

                (State::Channel | State::Image, Token::End(_)) => {
                    stack.pop();
                }

                // Whitespace and stray character data between elements
                (_, Token::Text(_)) => {}

                // The tokenizer checks end names, so an end tag with nothing
                // open can only come from a broken token source.
                (State::Document, Token::End(name)) => {
                    return Err(ParseError::Malformed(format!("unexpected </{}>", name)));
                }
            }
        }
    }

    /// Discards the subtree whose start tag was just consumed.
    async fn skip(&mut self) -> Result<(), ParseError> {
        let mut depth: usize = 1;
        while depth > 0 {
            match self.tokens.next_token().await? {
                Token::Start(_) => depth += 1,
                Token::End(_) => depth -= 1,
                Token::Text(_) => {}
                Token::Eof => {
                    return Err(ParseError::Malformed(
                        "document ended inside an unclosed element".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn finish_item(&mut self, draft: ItemDraft) -> Result<(), ParseError> {
        let id = self.next_id;

        let image_url = match draft.image_url {
            Some(url) => Some(url),
            None if !draft.description.is_empty() => infer_image_url(&draft.description),
            None => None,
        };

        let image_content = match image_url.as_deref() {
            Some(url) => self.images.fetch(url).await,
            None => None,
        };

        let published_at = match parse_pub_date(&draft.pub_date) {
            Some(ms) => ms,
            None => {
                if !draft.pub_date.trim().is_empty() {
                    tracing::debug!(id = id, pub_date = %draft.pub_date, "Unparsable pubDate, using 0");
                }
                self.summary.undated += 1;
                0
            }
        };

        if image_content.is_some() {
            self.summary.images += 1;
        }

        let item = FeedItem {
            id,
            title: draft.title,
            link: draft.link,
            description: draft.description,
            image_url,
            image_content,
            published_at,
        };

        self.sink.insert(&item).await.map_err(ParseError::Store)?;
        tracing::trace!(id = id, title = %item.title, "Item stored");

        self.next_id += 1;
        self.summary.items += 1;
        Ok(())
    }
}
