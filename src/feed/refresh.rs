//! Refresh batches.
//!
//! A batch selects feeds, then runs each one through
//! fetch, sniff, optional URL rewrite, fetch-mode decision, optional favicon
//! resolution and parse, strictly one after another. Per-feed failures are
//! persisted on the feed and never abort the batch.

use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionError, ConnectionFactory, ConnectionSettings};
use super::dispatch::dispatch;
use super::favicon;
use super::parser::{FeedParser, FeedRsParser, ParseError};
use super::sniff;
use crate::config::Config;
use crate::network::NetworkState;
use crate::storage::{Database, Feed, FeedSelection, FeedUpdate, FetchMode};

/// Error text stored for feeds whose URL answers 404 or 410.
pub const FEED_ERROR_MESSAGE: &str = "Error while fetching feed";

/// Errors that end a feed's refresh, or the whole batch.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// No network; the batch did not start
    #[error("No active network connection")]
    NetworkUnavailable,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Reading a body during sniffing failed
    #[error("Read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl RefreshError {
    /// Text persisted as the feed's error.
    pub fn feed_message(&self) -> String {
        match self {
            RefreshError::Connection(ConnectionError::ResourceNotFound(_)) => {
                FEED_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

/// What to refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshRequest {
    /// A single feed, or every feed when `None`
    pub feed_id: Option<i64>,
    /// Include wifi-only feeds even when not on Wi-Fi
    pub override_wifi_only: bool,
    /// Triggered by a schedule rather than by hand
    pub scheduled: bool,
}

impl RefreshRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn feed(feed_id: i64) -> Self {
        Self {
            feed_id: Some(feed_id),
            ..Self::default()
        }
    }
}

/// Completion signal, sent only when a batch stored new entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    Completed {
        new_entries: usize,
        /// Unread entries across all feeds, when notifications are enabled
        unread: Option<i64>,
    },
}

/// Result of one feed within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOutcome {
    pub feed_id: i64,
    pub new_entries: usize,
    /// The message persisted on the feed, if it failed
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct RefreshSummary {
    pub outcomes: Vec<FeedOutcome>,
    pub new_entries: usize,
    /// The batch stopped early because it was cancelled
    pub cancelled: bool,
}

impl RefreshSummary {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Runs refresh batches, one at a time.
///
/// The parser is shared by every feed of a batch and lives behind a mutex,
/// so concurrent `refresh` calls queue up instead of interleaving.
///
/// Every batch gets its own cancellation token, a child of the refresher's
/// shutdown token, so stopping one batch leaves later ones alone.
pub struct Refresher<P = FeedRsParser> {
    db: Database,
    config: Arc<Config>,
    parser: Mutex<P>,
    shutdown: CancellationToken,
    running: SyncMutex<Option<CancellationToken>>,
    events: Option<mpsc::Sender<RefreshEvent>>,
}

impl Refresher<FeedRsParser> {
    pub fn new(db: Database, config: Arc<Config>) -> Self {
        let parser = FeedRsParser::new(db.clone(), config.max_feed_bytes);
        Self::with_parser(db, config, parser)
    }
}

impl<P: FeedParser> Refresher<P> {
    pub fn with_parser(db: Database, config: Arc<Config>, parser: P) -> Self {
        Self {
            db,
            config,
            parser: Mutex::new(parser),
            shutdown: CancellationToken::new(),
            running: SyncMutex::new(None),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<RefreshEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shutdown token. Cancelling it stops the running batch and every
    /// batch started afterwards.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the running batch after the current network wait. Feeds already
    /// processed keep their state. Batches queued behind it still run.
    pub fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = running.as_ref() {
            token.cancel();
        }
    }

    fn begin_batch(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    fn end_batch(&self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub async fn refresh(
        &self,
        request: RefreshRequest,
        network: NetworkState,
    ) -> Result<RefreshSummary, RefreshError> {
        // A scheduled run counts even when it finds no network.
        if request.scheduled {
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = self.db.record_scheduled_refresh(now).await {
                tracing::warn!(error = %e, "Failed to record scheduled refresh time");
            }
        }

        if !network.is_connected() {
            tracing::info!("Skipping refresh: no active network");
            return Err(RefreshError::NetworkUnavailable);
        }

        let mut parser = self.parser.lock().await;
        let token = self.begin_batch();
        let result = self.run_batch(&mut *parser, request, network, token).await;
        self.end_batch();
        result
    }

    async fn run_batch(
        &self,
        parser: &mut P,
        request: RefreshRequest,
        network: NetworkState,
        token: CancellationToken,
    ) -> Result<RefreshSummary, RefreshError> {
        let factory = ConnectionFactory::new(
            ConnectionSettings::from_config(&self.config, network.is_wifi()),
            token.clone(),
        )?;
        let selection = FeedSelection {
            feed_id: request.feed_id,
            exclude_wifi_only: !request.override_wifi_only && !network.is_wifi(),
        };
        let feeds = self.db.select_feeds(selection).await?;
        tracing::debug!(feeds = feeds.len(), %network, ?selection, "Starting refresh");

        parser.configure(
            self.config.efficient_feed_parsing,
            self.config.fetch_images,
            token.clone(),
        );

        let mut summary = RefreshSummary::default();
        for feed in &feeds {
            if token.is_cancelled() {
                parser.cancel();
                summary.cancelled = true;
                tracing::info!(feed_id = feed.id, "Refresh cancelled before feed");
                break;
            }

            let result = self.refresh_feed(&factory, parser, feed).await;
            let error = match result {
                Ok(()) => {
                    self.persist(feed.id, FeedUpdate::clear_error()).await;
                    None
                }
                Err(e) if parser.is_done() || parser.is_cancelled() => {
                    tracing::debug!(feed_id = feed.id, error = %e, "Ignoring error after parse outcome");
                    None
                }
                Err(e) => {
                    let message = e.feed_message();
                    tracing::warn!(feed_id = feed.id, url = %feed.url, error = %e, "Feed refresh failed");
                    self.persist(feed.id, FeedUpdate::failure(message.clone())).await;
                    Some(message)
                }
            };

            let new_entries = parser.new_entry_count();
            summary.new_entries += new_entries;
            summary.outcomes.push(FeedOutcome {
                feed_id: feed.id,
                new_entries,
                error,
            });
        }
        summary.cancelled |= token.is_cancelled();

        tracing::info!(
            feeds = summary.outcomes.len(),
            failed = summary.failed(),
            new_entries = summary.new_entries,
            cancelled = summary.cancelled,
            "Refresh finished"
        );

        if summary.new_entries > 0 {
            self.signal(summary.new_entries).await;
        }
        Ok(summary)
    }

    async fn refresh_feed(
        &self,
        factory: &ConnectionFactory,
        parser: &mut P,
        feed: &Feed,
    ) -> Result<(), RefreshError> {
        let ua = feed.impose_user_agent;
        parser.init(feed.last_update, feed.id, &feed.title, &feed.url);

        let mut connection = factory.open(&feed.url, ua).await?;
        let site = connection.url().clone();
        let mut mode = feed.fetch_mode;
        let mut icon_url = None;

        if mode == FetchMode::Undetermined {
            if connection.is_html() {
                let links = sniff::scan_html(connection.body_mut(), &site, true).await?;
                icon_url = links.icon_url;
                if let Some(feed_url) = links.feed_url {
                    tracing::debug!(feed_id = feed.id, from = %feed.url, to = %feed_url, "Found feed link in HTML page");
                    connection = factory.open(&feed_url, ua).await?;
                    parser.set_base_url(&feed_url);
                    self.db.update_feed(feed.id, &FeedUpdate::url(feed_url)).await?;
                }
            }

            let prelude = if sniff::needs_prelude(connection.content_type()) {
                connection.body_mut().peek(sniff::PRELUDE_LEN).await?.to_vec()
            } else {
                Vec::new()
            };
            mode = sniff::decide_fetch_mode(connection.content_type(), &prelude);
            tracing::debug!(feed_id = feed.id, %mode, content_type = ?connection.content_type(), "Decided fetch mode");
            self.db.update_feed(feed.id, &FeedUpdate::fetch_mode(mode)).await?;
        }

        if feed.icon.is_none() {
            let icon = favicon::resolve(factory, &site, icon_url, ua).await;
            if !factory.token().is_cancelled() {
                self.db.update_feed(feed.id, &FeedUpdate::icon(icon)).await?;
            }
        }

        dispatch(connection, mode, parser, self.config.max_feed_bytes).await?;
        Ok(())
    }

    /// Write feed state; a failure here is logged and the batch goes on.
    async fn persist(&self, feed_id: i64, update: FeedUpdate) {
        if let Err(e) = self.db.update_feed(feed_id, &update).await {
            tracing::warn!(feed_id, error = %e, "Failed to persist feed state");
        }
    }

    async fn signal(&self, new_entries: usize) {
        let Some(events) = &self.events else {
            return;
        };
        let unread = if self.config.notifications_enabled {
            match self.db.count_unread().await {
                Ok(count) => Some(count),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to count unread entries");
                    None
                }
            }
        } else {
            None
        };
        if let Err(e) = events
            .send(RefreshEvent::Completed {
                new_entries,
                unread,
            })
            .await
        {
            tracing::warn!(error = %e, "Completion channel send failed (receiver dropped)");
        }
    }
}
