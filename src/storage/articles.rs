use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Article, ParsedArticle};

/// Maximum number of articles returned by a single query
const MAX_ARTICLES: i64 = 2000;

impl Database {
    // ========================================================================
    // Article Operations
    // ========================================================================

    /// Store parsed entries for a feed, returns the number of new articles inserted.
    ///
    /// Entries whose guid is already known for this feed are left untouched,
    /// so read state survives a refresh.
    pub async fn store_entries(&self, feed_id: i64, articles: &[ParsedArticle]) -> Result<usize> {
        if articles.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        const BATCH_SIZE: usize = 50;
        let mut total_inserted: usize = 0;

        for chunk in articles.chunks(BATCH_SIZE) {
            let mut insert_builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO articles (feed_id, guid, title, url, published, summary, image_url, fetched_at) ",
            );

            insert_builder.push_values(chunk, |mut b, article| {
                b.push_bind(feed_id)
                    .push_bind(&article.guid)
                    .push_bind(&article.title)
                    .push_bind(&article.url)
                    .push_bind(article.published)
                    .push_bind(&article.summary)
                    .push_bind(&article.image_url)
                    .push_bind(now);
            });

            let result = insert_builder.build().execute(&mut *tx).await?;
            total_inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(total_inserted)
    }

    /// Get articles for a specific feed, newest first
    pub async fn get_articles_for_feed(&self, feed_id: i64) -> Result<Vec<Article>> {
        let articles = sqlx::query_as::<_, Article>(
            r#"
            SELECT id, feed_id, guid, title, url, published, summary, image_url,
                   read, fetched_at
            FROM articles
            WHERE feed_id = ?
            ORDER BY published DESC, fetched_at DESC
            LIMIT ?
        "#,
        )
        .bind(feed_id)
        .bind(MAX_ARTICLES)
        .fetch_all(&self.pool)
        .await?;

        Ok(articles)
    }

    /// Number of unread articles across all feeds
    pub async fn count_unread(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE read = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
