use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Feed, FeedDbRow, FeedSelection, FeedUpdate};

const FEED_COLUMNS: &str =
    "id, title, url, last_update, fetch_mode, icon, wifi_only, impose_user_agent, error";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Subscribe to a feed, or retitle it if the URL is already known.
    ///
    /// Returns the feed id.
    pub async fn insert_feed(&self, url: &str, title: &str) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url) VALUES (?, ?)
            ON CONFLICT(url) DO UPDATE SET title = excluded.title
            RETURNING id
        "#,
        )
        .bind(title)
        .bind(url)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Set the per-feed fetch policy flags.
    pub async fn set_feed_policy(
        &self,
        feed_id: i64,
        wifi_only: bool,
        impose_user_agent: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE feeds SET wifi_only = ?, impose_user_agent = ? WHERE id = ?")
            .bind(wifi_only)
            .bind(impose_user_agent)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Read the feeds a batch should visit, in id order.
    pub async fn select_feeds(&self, selection: FeedSelection) -> Result<Vec<Feed>> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {FEED_COLUMNS} FROM feeds WHERE 1 = 1"));

        if let Some(feed_id) = selection.feed_id {
            builder.push(" AND id = ");
            builder.push_bind(feed_id);
        }
        if selection.exclude_wifi_only {
            builder.push(" AND (wifi_only = 0 OR wifi_only IS NULL)");
        }
        builder.push(" ORDER BY id");

        let rows = builder
            .build_query_as::<FeedDbRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Apply a partial update to one feed. Empty updates are a no-op.
    pub async fn update_feed(&self, feed_id: i64, update: &FeedUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE feeds SET ");
        {
            let mut fields = builder.separated(", ");
            if let Some(url) = &update.url {
                fields.push("url = ");
                fields.push_bind_unseparated(url.clone());
            }
            if let Some(mode) = update.fetch_mode {
                fields.push("fetch_mode = ");
                fields.push_bind_unseparated(mode.as_i64());
            }
            if let Some(icon) = &update.icon {
                fields.push("icon = ");
                fields.push_bind_unseparated(icon.clone());
            }
            if let Some(error) = &update.error {
                fields.push("error = ");
                fields.push_bind_unseparated(error.clone());
            }
        }
        builder.push(" WHERE id = ");
        builder.push_bind(feed_id);

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Forget the stored icon so the next refresh runs favicon discovery again.
    pub async fn reset_icon(&self, feed_id: i64) -> Result<()> {
        sqlx::query("UPDATE feeds SET icon = NULL WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advance the feed's watermark. Never moves it backwards.
    pub async fn set_last_update(&self, feed_id: i64, timestamp: i64) -> Result<()> {
        sqlx::query(
            "UPDATE feeds SET last_update = MAX(COALESCE(last_update, 0), ?) WHERE id = ?",
        )
        .bind(timestamp)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
