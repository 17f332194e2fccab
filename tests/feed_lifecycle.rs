//! Integration tests for the stored side of a feed's life: subscribe, set
//! policy, record refresh state, store entries, reset the icon.
//!
//! Each test creates its own in-memory SQLite database for isolation.

use feedsweep::storage::{Database, FeedSelection, FeedUpdate, FetchMode, ParsedArticle};
use pretty_assertions::assert_eq;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn test_parsed_article(guid: &str, published: i64) -> ParsedArticle {
    ParsedArticle {
        guid: guid.to_string(),
        title: format!("Entry {guid}"),
        url: Some(format!("https://example.com/{guid}")),
        published: Some(published),
        summary: None,
        image_url: None,
    }
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_new_feed_starts_undetermined_without_icon() {
    let db = test_db().await;
    let id = db
        .insert_feed("https://example.com/feed.xml", "Example")
        .await
        .unwrap();

    let feed = db.get_feed(id).await.unwrap().unwrap();
    assert_eq!(feed.fetch_mode, FetchMode::Undetermined);
    assert_eq!(feed.icon, None);
    assert_eq!(feed.error, None);
    assert_eq!(feed.last_update, None);
    assert!(!feed.wifi_only);
    assert!(!feed.impose_user_agent);
}

#[tokio::test]
async fn test_resubscribe_keeps_id_and_retitles() {
    let db = test_db().await;
    let first = db.insert_feed("https://example.com/rss", "Old").await.unwrap();
    let second = db.insert_feed("https://example.com/rss", "New").await.unwrap();

    assert_eq!(first, second);
    let feeds = db.select_feeds(FeedSelection::default()).await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].title, "New");
}

// ============================================================================
// Selection
// ============================================================================

#[tokio::test]
async fn test_selection_filters_wifi_only_and_single_feed() {
    let db = test_db().await;
    let a = db.insert_feed("https://a.example/feed", "A").await.unwrap();
    let b = db.insert_feed("https://b.example/feed", "B").await.unwrap();
    db.set_feed_policy(b, true, false).await.unwrap();

    let all = db.select_feeds(FeedSelection::default()).await.unwrap();
    assert_eq!(all.iter().map(|f| f.id).collect::<Vec<_>>(), vec![a, b]);

    let mobile = db
        .select_feeds(FeedSelection {
            feed_id: None,
            exclude_wifi_only: true,
        })
        .await
        .unwrap();
    assert_eq!(mobile.iter().map(|f| f.id).collect::<Vec<_>>(), vec![a]);

    let single = db
        .select_feeds(FeedSelection {
            feed_id: Some(b),
            exclude_wifi_only: false,
        })
        .await
        .unwrap();
    assert_eq!(single.len(), 1);
    assert!(single[0].wifi_only);
}

// ============================================================================
// Refresh state
// ============================================================================

#[tokio::test]
async fn test_failure_then_recovery() {
    let db = test_db().await;
    let id = db.insert_feed("https://example.com/feed", "F").await.unwrap();
    db.update_feed(id, &FeedUpdate::fetch_mode(FetchMode::Reencode))
        .await
        .unwrap();

    db.update_feed(id, &FeedUpdate::failure("HTTP error: status 503"))
        .await
        .unwrap();
    let feed = db.get_feed(id).await.unwrap().unwrap();
    assert_eq!(feed.error.as_deref(), Some("HTTP error: status 503"));
    assert_eq!(feed.fetch_mode, FetchMode::Undetermined);

    db.update_feed(id, &FeedUpdate::clear_error()).await.unwrap();
    let feed = db.get_feed(id).await.unwrap().unwrap();
    assert_eq!(feed.error, None);
}

#[tokio::test]
async fn test_url_rewrite_and_icon_persist() {
    let db = test_db().await;
    let id = db.insert_feed("http://example.com/blog", "Blog").await.unwrap();

    db.update_feed(id, &FeedUpdate::url("http://example.com/feed.xml"))
        .await
        .unwrap();
    db.update_feed(id, &FeedUpdate::icon(Vec::new())).await.unwrap();

    let feed = db.get_feed(id).await.unwrap().unwrap();
    assert_eq!(feed.url, "http://example.com/feed.xml");
    assert_eq!(feed.icon, Some(Vec::new()));

    db.reset_icon(id).await.unwrap();
    let feed = db.get_feed(id).await.unwrap().unwrap();
    assert_eq!(feed.icon, None);
}

// ============================================================================
// Entries
// ============================================================================

#[tokio::test]
async fn test_refetched_entries_are_not_duplicated() {
    let db = test_db().await;
    let id = db.insert_feed("https://example.com/feed", "F").await.unwrap();

    let entries = vec![test_parsed_article("a", 100), test_parsed_article("b", 200)];
    assert_eq!(db.store_entries(id, &entries).await.unwrap(), 2);
    assert_eq!(db.count_unread().await.unwrap(), 2);

    // Same guids again plus one new entry
    let entries = vec![
        test_parsed_article("a", 100),
        test_parsed_article("b", 200),
        test_parsed_article("c", 300),
    ];
    assert_eq!(db.store_entries(id, &entries).await.unwrap(), 1);
    assert_eq!(db.count_unread().await.unwrap(), 3);

    let stored = db.get_articles_for_feed(id).await.unwrap();
    assert_eq!(
        stored.iter().map(|a| a.guid.as_str()).collect::<Vec<_>>(),
        vec!["c", "b", "a"]
    );
}

#[tokio::test]
async fn test_watermark_only_moves_forward() {
    let db = test_db().await;
    let id = db.insert_feed("https://example.com/feed", "F").await.unwrap();

    db.set_last_update(id, 500).await.unwrap();
    db.set_last_update(id, 100).await.unwrap();
    assert_eq!(db.get_feed(id).await.unwrap().unwrap().last_update, Some(500));

    db.set_last_update(id, 900).await.unwrap();
    assert_eq!(db.get_feed(id).await.unwrap().unwrap().last_update, Some(900));
}

#[tokio::test]
async fn test_scheduled_refresh_preference() {
    let db = test_db().await;
    assert_eq!(db.last_scheduled_refresh().await.unwrap(), None);

    db.record_scheduled_refresh(1_700_000_000).await.unwrap();
    db.record_scheduled_refresh(1_700_000_600).await.unwrap();
    assert_eq!(
        db.last_scheduled_refresh().await.unwrap(),
        Some(1_700_000_600)
    );
}
