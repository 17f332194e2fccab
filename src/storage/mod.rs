mod articles;
mod feeds;
mod preferences;
mod schema;
mod types;

pub use preferences::LAST_SCHEDULED_REFRESH;
pub use schema::Database;
pub use types::{
    Article, DatabaseError, Feed, FeedSelection, FeedUpdate, FetchMode, ParsedArticle,
};
