use anyhow::Result;

use super::schema::Database;

/// Preference key holding the Unix time of the last scheduled batch.
pub const LAST_SCHEDULED_REFRESH: &str = "refresh.last_scheduled";

impl Database {
    // ========================================================================
    // Preference Operations
    // ========================================================================

    /// Get a single preference value by key, `None` if unset.
    pub async fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM user_preferences WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Set a preference value (UPSERT).
    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_preferences (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_scheduled_refresh(&self, at: i64) -> Result<()> {
        self.set_preference(LAST_SCHEDULED_REFRESH, &at.to_string())
            .await
    }

    /// A stored value that does not parse reads back as `None`.
    pub async fn last_scheduled_refresh(&self) -> Result<Option<i64>> {
        Ok(self
            .get_preference(LAST_SCHEDULED_REFRESH)
            .await?
            .and_then(|v| v.parse().ok()))
    }
}
