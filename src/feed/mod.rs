//! The feed refresh pipeline.
//!
//! - [`connection`] - HTTP connections with proxy, timeouts and the
//!   cross-protocol redirect policy
//! - [`body`] - cancellable bodies with a replayable lookahead
//! - [`charset`] - charset labels, XML declarations and decoding
//! - [`sniff`] - feed and icon links in HTML heads, fetch mode detection
//! - [`favicon`] - best-effort icon resolution
//! - [`dispatch`] - direct or re-encoded hand-off of a body to the parser
//! - [`parser`] - the [`FeedParser`] seam and its `feed-rs` implementation
//! - [`refresh`] - the batch loop tying it together
//!
//! # Example
//!
//! ```ignore
//! let refresher = Refresher::new(db, Arc::new(config)).with_events(tx);
//! let summary = refresher
//!     .refresh(RefreshRequest::all(), NetworkState::Connected(NetworkClass::Wifi))
//!     .await?;
//! ```

pub mod body;
pub mod charset;
pub mod connection;
pub mod dispatch;
pub mod favicon;
pub mod parser;
pub mod refresh;
pub mod sniff;

pub use connection::{Connection, ConnectionError, ConnectionFactory, ConnectionSettings};
pub use dispatch::FetchPlan;
pub use parser::{FeedInput, FeedParser, FeedRsParser, ParseError};
pub use refresh::{
    FeedOutcome, RefreshError, RefreshEvent, RefreshRequest, RefreshSummary, Refresher,
    FEED_ERROR_MESSAGE,
};
