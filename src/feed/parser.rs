//! Feed parsing.
//!
//! [`FeedParser`] is the seam between the refresh loop and whatever turns a
//! feed document into stored articles. [`FeedRsParser`] is the production
//! implementation on top of `feed-rs`.

use async_trait::async_trait;
use encoding_rs::Encoding;
use feed_rs::model::Entry;
use futures::stream::{BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use std::io;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::body::{ByteStream, CharStream};
use super::charset;
use crate::storage::{Database, ParsedArticle};
use crate::util::clean_title;

/// A feed document on its way into a parser.
pub enum FeedInput {
    /// Raw bytes in a known character set
    Bytes {
        body: ByteStream,
        encoding: &'static Encoding,
    },
    /// Already decoded text
    Chars(CharStream),
}

impl std::fmt::Debug for FeedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedInput::Bytes { encoding, .. } => {
                f.debug_struct("Bytes").field("encoding", &encoding.name()).finish()
            }
            FeedInput::Chars(_) => f.write_str("Chars"),
        }
    }
}

/// Errors raised while parsing and storing a feed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is not RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Malformed(String),
    /// Reading the body failed part way
    #[error("Read error: {0}")]
    Io(#[from] io::Error),
    /// The document exceeded `max_feed_bytes`
    #[error("Feed larger than {0} bytes")]
    TooLarge(usize),
    /// Storing parsed entries failed
    #[error("Database error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("Parse cancelled")]
    Cancelled,
}

/// Turns one feed document at a time into stored articles.
///
/// A single instance is reused for every feed in a batch: `init` is called
/// before each feed and resets the per-feed state.
#[async_trait]
pub trait FeedParser: Send {
    /// Batch-wide behaviour: stop at the first already-seen entry, and
    /// whether to record an image URL per entry. `token` is the running
    /// batch's cancellation token; `cancel` and `is_cancelled` act on it.
    fn configure(&mut self, efficient_parsing: bool, fetch_images: bool, token: CancellationToken);

    fn init(&mut self, last_update: Option<i64>, feed_id: i64, title: &str, url: &str);

    /// Base for resolving relative links, when the document moved.
    fn set_base_url(&mut self, url: &str);

    async fn feed(&mut self, input: FeedInput) -> Result<(), ParseError>;

    /// Whether the current feed was fully parsed and stored.
    fn is_done(&self) -> bool;

    fn is_cancelled(&self) -> bool;

    fn cancel(&self);

    /// Entries stored for the current feed.
    fn new_entry_count(&self) -> usize;
}

#[derive(Debug, Default)]
struct FeedState {
    feed_id: i64,
    title: String,
    base_url: Option<Url>,
    last_update: Option<i64>,
    done: bool,
    new_entries: usize,
}

/// [`FeedParser`] backed by `feed-rs` and the article store.
pub struct FeedRsParser {
    db: Database,
    token: CancellationToken,
    max_bytes: usize,
    efficient_parsing: bool,
    fetch_images: bool,
    state: FeedState,
}

impl FeedRsParser {
    pub fn new(db: Database, max_bytes: usize) -> Self {
        Self {
            db,
            token: CancellationToken::new(),
            max_bytes,
            efficient_parsing: true,
            fetch_images: false,
            state: FeedState::default(),
        }
    }

    async fn next_chunk<T: Send>(
        &self,
        stream: &mut BoxStream<'static, io::Result<T>>,
    ) -> Result<Option<T>, ParseError> {
        let item = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(ParseError::Cancelled),
            item = stream.next() => item,
        };
        match item.transpose() {
            Ok(chunk) => Ok(chunk),
            Err(_) if self.token.is_cancelled() => Err(ParseError::Cancelled),
            Err(e) => Err(ParseError::Io(e)),
        }
    }

    async fn read_text(&self, input: FeedInput) -> Result<String, ParseError> {
        match input {
            FeedInput::Bytes { mut body, encoding } => {
                let mut bytes = Vec::new();
                while let Some(chunk) = self.next_chunk(&mut body).await? {
                    bytes.extend_from_slice(&chunk);
                    if bytes.len() > self.max_bytes {
                        return Err(ParseError::TooLarge(self.max_bytes));
                    }
                }
                Ok(charset::decode_all(encoding, &bytes))
            }
            FeedInput::Chars(mut chars) => {
                let mut text = String::new();
                while let Some(chunk) = self.next_chunk(&mut chars).await? {
                    text.push_str(&chunk);
                    if text.len() > self.max_bytes {
                        return Err(ParseError::TooLarge(self.max_bytes));
                    }
                }
                Ok(text)
            }
        }
    }

    /// Drop entries at or below the watermark.
    ///
    /// Feeds list newest first, so efficient parsing stops at the first old
    /// entry instead of checking every one.
    fn unseen(&self, articles: Vec<ParsedArticle>) -> Vec<ParsedArticle> {
        let Some(watermark) = self.state.last_update else {
            return articles;
        };
        let is_new = |a: &ParsedArticle| a.published.map_or(true, |p| p > watermark);
        if self.efficient_parsing {
            articles.into_iter().take_while(is_new).collect()
        } else {
            articles.into_iter().filter(is_new).collect()
        }
    }
}

#[async_trait]
impl FeedParser for FeedRsParser {
    fn configure(&mut self, efficient_parsing: bool, fetch_images: bool, token: CancellationToken) {
        self.token = token;
        self.efficient_parsing = efficient_parsing;
        self.fetch_images = fetch_images;
    }

    fn init(&mut self, last_update: Option<i64>, feed_id: i64, title: &str, url: &str) {
        self.state = FeedState {
            feed_id,
            title: title.to_string(),
            base_url: Url::parse(url).ok(),
            last_update,
            done: false,
            new_entries: 0,
        };
    }

    fn set_base_url(&mut self, url: &str) {
        self.state.base_url = Url::parse(url).ok();
    }

    async fn feed(&mut self, input: FeedInput) -> Result<(), ParseError> {
        let text = self.read_text(input).await?;
        let text = charset::declare_utf8(&text);

        let parsed = feed_rs::parser::parse(text.as_bytes())
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        let articles = to_articles(parsed.entries, self.state.base_url.as_ref(), self.fetch_images);
        let total = articles.len();
        let articles = self.unseen(articles);

        if self.token.is_cancelled() {
            return Err(ParseError::Cancelled);
        }

        let inserted = self.db.store_entries(self.state.feed_id, &articles).await?;
        if let Some(newest) = articles.iter().filter_map(|a| a.published).max() {
            self.db.set_last_update(self.state.feed_id, newest).await?;
        }

        tracing::debug!(
            feed_id = self.state.feed_id,
            title = %self.state.title,
            entries = total,
            unseen = articles.len(),
            inserted,
            "Parsed feed"
        );
        self.state.new_entries = inserted;
        self.state.done = true;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.state.done
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn new_entry_count(&self) -> usize {
        self.state.new_entries
    }
}

fn to_articles(entries: Vec<Entry>, base: Option<&Url>, fetch_images: bool) -> Vec<ParsedArticle> {
    entries
        .into_iter()
        .map(|entry| {
            let url = entry.links.first().map(|l| absolutize(&l.href, base));
            let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let image_url = if fetch_images {
                entry_image(&entry, base)
            } else {
                None
            };
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry
                .title
                .map(|t| clean_title(&t.content).into_owned())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Untitled".to_string());

            let existing_id = (!entry.id.is_empty()).then_some(entry.id.as_str());
            let guid = generate_guid(existing_id, url.as_deref(), &title, published);

            ParsedArticle {
                guid,
                title,
                url,
                published,
                summary,
                image_url,
            }
        })
        .collect()
}

fn absolutize(href: &str, base: Option<&Url>) -> String {
    if Url::parse(href).is_ok() {
        return href.to_string();
    }
    base.and_then(|b| b.join(href).ok())
        .map(String::from)
        .unwrap_or_else(|| href.to_string())
}

/// First image attached to an entry: media content typed `image/*`, then a
/// media thumbnail.
fn entry_image(entry: &Entry, base: Option<&Url>) -> Option<String> {
    let content = entry.media.iter().flat_map(|m| &m.content).find_map(|c| {
        let is_image = c
            .content_type
            .as_ref()
            .is_some_and(|t| t.ty().as_str().eq_ignore_ascii_case("image"));
        is_image.then(|| c.url.as_ref().map(|u| u.to_string())).flatten()
    });
    content
        .or_else(|| {
            entry
                .media
                .iter()
                .flat_map(|m| &m.thumbnails)
                .map(|t| t.image.uri.clone())
                .find(|uri| !uri.is_empty())
        })
        .map(|uri| absolutize(&uri, base))
}

fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use pretty_assertions::assert_eq;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>T</title>
<item><title>Three</title><link>/posts/3</link><guid>g3</guid><pubDate>Wed, 03 Jan 2024 00:00:00 GMT</pubDate></item>
<item><title>Two</title><link>https://example.com/posts/2</link><guid>g2</guid><pubDate>Tue, 02 Jan 2024 00:00:00 GMT</pubDate></item>
<item><title>Old</title><guid>g0</guid><pubDate>Sun, 31 Dec 2023 00:00:00 GMT</pubDate></item>
<item><title>One</title><guid>g1</guid><pubDate>Mon, 01 Jan 2024 12:00:00 GMT</pubDate></item>
</channel></rss>"#;

    // 2024-01-01T00:00:00Z
    const NEW_YEAR: i64 = 1_704_067_200;

    async fn setup() -> (FeedRsParser, Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db.insert_feed("https://example.com/rss", "T").await.unwrap();
        let parser = FeedRsParser::new(db.clone(), 1024 * 1024);
        (parser, db, feed_id)
    }

    fn chars(text: &str) -> FeedInput {
        FeedInput::Chars(stream::iter([Ok(text.to_string())]).boxed())
    }

    #[tokio::test]
    async fn test_stores_all_entries_without_watermark() {
        let (mut parser, db, feed_id) = setup().await;
        parser.init(None, feed_id, "T", "https://example.com/rss");
        parser.feed(chars(RSS)).await.unwrap();

        assert!(parser.is_done());
        assert_eq!(parser.new_entry_count(), 4);
        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.last_update, Some(1_704_240_000));
    }

    #[tokio::test]
    async fn test_efficient_parsing_stops_at_first_seen_entry() {
        let (mut parser, _db, feed_id) = setup().await;
        parser.configure(true, false, CancellationToken::new());
        parser.init(Some(NEW_YEAR), feed_id, "T", "https://example.com/rss");
        parser.feed(chars(RSS)).await.unwrap();
        assert_eq!(parser.new_entry_count(), 2);
    }

    #[tokio::test]
    async fn test_full_parsing_checks_every_entry() {
        let (mut parser, _db, feed_id) = setup().await;
        parser.configure(false, false, CancellationToken::new());
        parser.init(Some(NEW_YEAR), feed_id, "T", "https://example.com/rss");
        parser.feed(chars(RSS)).await.unwrap();
        assert_eq!(parser.new_entry_count(), 3);
    }

    #[tokio::test]
    async fn test_relative_links_use_base_url() {
        let (mut parser, db, feed_id) = setup().await;
        parser.init(None, feed_id, "T", "https://old.example.com/rss");
        parser.set_base_url("https://new.example.com/feed/");
        parser.feed(chars(RSS)).await.unwrap();

        let articles = db.get_articles_for_feed(feed_id).await.unwrap();
        let three = articles.iter().find(|a| a.guid == "g3").unwrap();
        assert_eq!(three.url.as_deref(), Some("https://new.example.com/posts/3"));
    }

    #[tokio::test]
    async fn test_bytes_input_decoded_with_declared_encoding() {
        let (mut parser, db, feed_id) = setup().await;
        let mut doc = br#"<?xml version="1.0" encoding="ISO-8859-1"?><rss version="2.0"><channel><title>T</title><item><title>Caf"#.to_vec();
        doc.push(0xe9);
        doc.extend_from_slice(b"</title><guid>c</guid></item></channel></rss>");

        parser.init(None, feed_id, "T", "https://example.com/rss");
        parser
            .feed(FeedInput::Bytes {
                body: stream::iter([Ok(Bytes::from(doc))]).boxed(),
                encoding: encoding_rs::WINDOWS_1252,
            })
            .await
            .unwrap();

        let articles = db.get_articles_for_feed(feed_id).await.unwrap();
        assert_eq!(articles[0].title, "Café");
    }

    #[tokio::test]
    async fn test_malformed_document_is_not_done() {
        let (mut parser, _db, feed_id) = setup().await;
        parser.init(None, feed_id, "T", "https://example.com/rss");
        let err = parser.feed(chars("<html>not a feed")).await.unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
        assert!(!parser.is_done());
    }

    #[tokio::test]
    async fn test_oversized_document_rejected() {
        let db = Database::open(":memory:").await.unwrap();
        let mut parser = FeedRsParser::new(db, 16);
        parser.init(None, 1, "T", "https://example.com/rss");
        let err = parser.feed(chars(RSS)).await.unwrap_err();
        assert!(matches!(err, ParseError::TooLarge(16)));
    }

    #[tokio::test]
    async fn test_cancel_stops_parse() {
        let (mut parser, _db, feed_id) = setup().await;
        parser.init(None, feed_id, "T", "https://example.com/rss");
        parser.cancel();
        assert!(parser.is_cancelled());
        let err = parser.feed(chars(RSS)).await.unwrap_err();
        assert!(matches!(err, ParseError::Cancelled));
        assert_eq!(parser.new_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_configure_replaces_cancelled_token() {
        let (mut parser, _db, feed_id) = setup().await;
        let stopped = CancellationToken::new();
        parser.configure(true, false, stopped.clone());
        parser.cancel();
        assert!(stopped.is_cancelled());

        parser.configure(true, false, CancellationToken::new());
        assert!(!parser.is_cancelled());
        parser.init(None, feed_id, "T", "https://example.com/rss");
        parser.feed(chars(RSS)).await.unwrap();
        assert_eq!(parser.new_entry_count(), 4);
    }

    #[tokio::test]
    async fn test_init_resets_feed_state() {
        let (mut parser, _db, feed_id) = setup().await;
        parser.init(None, feed_id, "T", "https://example.com/rss");
        parser.feed(chars(RSS)).await.unwrap();
        parser.init(None, feed_id, "T", "https://example.com/rss");
        assert!(!parser.is_done());
        assert_eq!(parser.new_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_image_url_only_when_enabled() {
        let doc = r#"<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/"><channel><title>T</title>
<item><title>Pic</title><guid>p</guid><media:thumbnail url="https://img.example.com/t.jpg"/></item>
</channel></rss>"#;

        let (mut parser, db, feed_id) = setup().await;
        parser.configure(true, true, CancellationToken::new());
        parser.init(None, feed_id, "T", "https://example.com/rss");
        parser.feed(chars(doc)).await.unwrap();
        let articles = db.get_articles_for_feed(feed_id).await.unwrap();
        assert_eq!(
            articles[0].image_url.as_deref(),
            Some("https://img.example.com/t.jpg")
        );

        let (mut parser, db, feed_id) = setup().await;
        parser.configure(true, false, CancellationToken::new());
        parser.init(None, feed_id, "T", "https://example.com/rss");
        parser.feed(chars(doc)).await.unwrap();
        let articles = db.get_articles_for_feed(feed_id).await.unwrap();
        assert_eq!(articles[0].image_url, None);
    }

    #[tokio::test]
    async fn test_image_media_content_preferred_over_thumbnail() {
        let doc = r#"<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/"><channel><title>T</title>
<item><title>Pic</title><guid>p</guid>
<media:content url="https://img.example.com/audio.mp3" type="audio/mpeg"/>
<media:content url="https://img.example.com/full.jpg" type="image/jpeg"/>
<media:thumbnail url="https://img.example.com/t.jpg"/></item>
</channel></rss>"#;

        let (mut parser, db, feed_id) = setup().await;
        parser.configure(true, true, CancellationToken::new());
        parser.init(None, feed_id, "T", "https://example.com/rss");
        parser.feed(chars(doc)).await.unwrap();
        let articles = db.get_articles_for_feed(feed_id).await.unwrap();
        assert_eq!(
            articles[0].image_url.as_deref(),
            Some("https://img.example.com/full.jpg")
        );
    }

    #[test]
    fn test_generate_guid_prefers_existing() {
        assert_eq!(generate_guid(Some("  abc "), None, "t", None), "abc");
        let a = generate_guid(None, Some("https://e.com/1"), "t", Some(1));
        let b = generate_guid(Some(""), Some("https://e.com/1"), "t", Some(1));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
