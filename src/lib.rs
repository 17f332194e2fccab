//! Batch refresher for syndication feeds.
//!
//! Fetches RSS/Atom feeds, works out how each one must be decoded, follows
//! feed links embedded in HTML landing pages, resolves favicons, and stores
//! new entries, isolating per-feed failures from the rest of the batch.

pub mod config;
pub mod feed;
pub mod network;
pub mod storage;
pub mod util;
