use std::fmt;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has locked the database
    #[error("Another feedsweep process appears to be running. Please wait and try again.")]
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
        let message = err.to_string();
        if is_lock_message(&message) || message.contains("unable to open database file") {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6) in their textual forms
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
}

// ============================================================================
// Fetch Mode
// ============================================================================

/// Cached decision of how a feed's bytes are decoded.
///
/// Persisted as an integer: 0 = undetermined, 1 = direct, 2 = re-encode.
/// `Undetermined` forces the next refresh to sniff the feed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    #[default]
    Undetermined,
    /// Stream the body straight into the parser with a known charset.
    Direct,
    /// Buffer the whole body and re-decode it from a discovered charset.
    Reencode,
}

impl FetchMode {
    pub fn as_i64(self) -> i64 {
        match self {
            FetchMode::Undetermined => 0,
            FetchMode::Direct => 1,
            FetchMode::Reencode => 2,
        }
    }

    /// Unknown stored values read back as `Undetermined`, which only costs a re-sniff.
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => FetchMode::Direct,
            2 => FetchMode::Reencode,
            _ => FetchMode::Undetermined,
        }
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchMode::Undetermined => "undetermined",
            FetchMode::Direct => "direct",
            FetchMode::Reencode => "reencode",
        })
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Represents a parsed article from a feed
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArticle {
    pub guid: String,
    pub title: String,
    pub url: Option<String>,
    pub published: Option<i64>,
    pub summary: Option<String>,
    pub image_url: Option<String>,
}

/// Which feeds a batch reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSelection {
    /// Restrict to a single feed.
    pub feed_id: Option<i64>,
    /// Leave out feeds flagged Wi-Fi only.
    pub exclude_wifi_only: bool,
}

/// Partial update of a feed row, keyed by id.
///
/// Only fields that are `Some` are written. `error: Some(None)` clears the error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedUpdate {
    pub url: Option<String>,
    pub fetch_mode: Option<FetchMode>,
    pub icon: Option<Vec<u8>>,
    pub error: Option<Option<String>>,
}

impl FeedUpdate {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn fetch_mode(mode: FetchMode) -> Self {
        Self {
            fetch_mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn icon(bytes: Vec<u8>) -> Self {
        Self {
            icon: Some(bytes),
            ..Self::default()
        }
    }

    /// Record a failed fetch: store the message and force re-sniffing.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            fetch_mode: Some(FetchMode::Undetermined),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn clear_error() -> Self {
        Self {
            error: Some(None),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.fetch_mode.is_none() && self.icon.is_none() && self.error.is_none()
    }
}

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub last_update: Option<i64>,
    pub fetch_mode: i64,
    pub icon: Option<Vec<u8>>,
    pub wifi_only: bool,
    pub impose_user_agent: bool,
    pub error: Option<String>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            title: self.title,
            url: self.url,
            last_update: self.last_update,
            fetch_mode: FetchMode::from_i64(self.fetch_mode),
            icon: self.icon,
            wifi_only: self.wifi_only,
            impose_user_agent: self.impose_user_agent,
            error: self.error,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub id: i64,
    pub title: String,
    pub url: String,
    /// Unix timestamp of the newest stored entry, handed to the parser as a watermark.
    pub last_update: Option<i64>,
    pub fetch_mode: FetchMode,
    /// `None` means discovery has not run, an empty blob means nothing was found.
    pub icon: Option<Vec<u8>>,
    pub wifi_only: bool,
    pub impose_user_agent: bool,
    pub error: Option<String>,
}

/// Article data from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub url: Option<String>,
    pub published: Option<i64>,
    pub summary: Option<String>,
    pub image_url: Option<String>,
    pub read: bool,
    pub fetched_at: i64,
}
