use anyhow::Result;

use super::schema::Database;
use super::types::{FeedMetadata, MetadataRow};

/// Smoothing factor for the rolling average article count: each fetch
/// contributes a fifth of its weight, so the average tracks a feed's
/// typical volume without whipsawing on a single busy day.
const ARTICLE_COUNT_EMA_ALPHA: f64 = 0.2;

/// Backoff window after `failures` consecutive exhausted fetch runs:
/// `min(2^(failures-1) * 5 min, 240 min)`.
pub fn backoff_window_secs(failures: i64) -> i64 {
    const BASE_SECS: i64 = 5 * 60;
    const CAP_SECS: i64 = 240 * 60;
    let exp = (failures - 1).clamp(0, 10) as u32;
    (BASE_SECS << exp).min(CAP_SECS)
}

impl Database {
    // ========================================================================
    // Feed Metadata Operations
    // ========================================================================

    /// Get per-feed fetch bookkeeping. A feed that has never been fetched
    /// yields a zeroed record rather than an error.
    pub async fn get_feed_metadata(&self, feed_id: i64) -> Result<FeedMetadata> {
        let row = sqlx::query_as::<_, MetadataRow>(
            r#"
            SELECT feed_id, last_fetch, last_success, consecutive_failures,
                   etag, last_modified, avg_article_count, next_retry_at
            FROM feed_metadata
            WHERE feed_id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MetadataRow::into_metadata).unwrap_or(FeedMetadata {
            feed_id,
            ..FeedMetadata::default()
        }))
    }

    /// Record a successful fetch: failure and backoff state cleared, success
    /// time stamped, rolling average article count updated, and any new
    /// cache validators persisted (a 304 carries none — the old ones stay).
    pub async fn record_fetch_success(
        &self,
        feed_id: i64,
        article_count: usize,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let count = article_count as f64;

        sqlx::query(
            r#"
            INSERT INTO feed_metadata
                (feed_id, last_fetch, last_success, consecutive_failures,
                 etag, last_modified, avg_article_count, next_retry_at)
            VALUES (?, ?, ?, 0, ?, ?, ?, NULL)
            ON CONFLICT(feed_id) DO UPDATE SET
                last_fetch = excluded.last_fetch,
                last_success = excluded.last_success,
                consecutive_failures = 0,
                etag = coalesce(excluded.etag, feed_metadata.etag),
                last_modified = coalesce(excluded.last_modified, feed_metadata.last_modified),
                avg_article_count = CASE
                    WHEN feed_metadata.last_success IS NULL THEN excluded.avg_article_count
                    ELSE feed_metadata.avg_article_count * (1.0 - ?)
                         + excluded.avg_article_count * ?
                END,
                next_retry_at = NULL
        "#,
        )
        .bind(feed_id)
        .bind(now)
        .bind(now)
        .bind(etag)
        .bind(last_modified)
        .bind(count)
        .bind(ARTICLE_COUNT_EMA_ALPHA)
        .bind(ARTICLE_COUNT_EMA_ALPHA)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record an exhausted fetch run: the failure counter increments and the
    /// next backoff window is persisted, both in one transaction. Returns
    /// the new consecutive-failure count.
    pub async fn record_fetch_failure(&self, feed_id: i64) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let (failures,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feed_metadata (feed_id, last_fetch, consecutive_failures)
            VALUES (?, ?, 1)
            ON CONFLICT(feed_id) DO UPDATE SET
                last_fetch = excluded.last_fetch,
                consecutive_failures = feed_metadata.consecutive_failures + 1
            RETURNING consecutive_failures
        "#,
        )
        .bind(feed_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE feed_metadata SET next_retry_at = ? WHERE feed_id = ?")
            .bind(now + backoff_window_secs(failures))
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(failures)
    }

    /// Operator override: clear a feed's failure state so the next run
    /// fetches it regardless of any backoff window.
    pub async fn clear_feed_failures(&self, feed_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE feed_metadata SET consecutive_failures = 0, next_retry_at = NULL
             WHERE feed_id = ?",
        )
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of feeds currently inside a backoff window.
    pub async fn backed_off_count(&self) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM feed_metadata WHERE next_retry_at > ?")
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::backoff_window_secs;
    use crate::storage::Database;

    async fn test_db_with_feed() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let id = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        (db, id)
    }

    #[test]
    fn test_backoff_window_doubles_from_five_minutes() {
        assert_eq!(backoff_window_secs(1), 5 * 60);
        assert_eq!(backoff_window_secs(2), 10 * 60);
        assert_eq!(backoff_window_secs(3), 20 * 60);
        assert_eq!(backoff_window_secs(7), 240 * 60);
    }

    #[test]
    fn test_backoff_window_caps_at_four_hours() {
        assert_eq!(backoff_window_secs(8), 240 * 60);
        assert_eq!(backoff_window_secs(50), 240 * 60);
    }

    #[tokio::test]
    async fn test_unfetched_feed_yields_zeroed_metadata() {
        let (db, id) = test_db_with_feed().await;
        let meta = db.get_feed_metadata(id).await.unwrap();
        assert_eq!(meta.feed_id, id);
        assert_eq!(meta.consecutive_failures, 0);
        assert!(meta.last_fetch.is_none());
        assert!(meta.etag.is_none());
    }

    #[tokio::test]
    async fn test_success_persists_validators_and_resets_failures() {
        let (db, id) = test_db_with_feed().await;

        db.record_fetch_failure(id).await.unwrap();
        db.record_fetch_success(id, 3, Some("\"v1\""), Some("Mon, 01 Jan 2024 00:00:00 GMT"))
            .await
            .unwrap();

        let meta = db.get_feed_metadata(id).await.unwrap();
        assert_eq!(meta.consecutive_failures, 0);
        assert!(meta.next_retry_at.is_none());
        assert_eq!(meta.etag.as_deref(), Some("\"v1\""));
        assert!(meta.last_success.is_some());
        assert_eq!(meta.avg_article_count, 3.0);
    }

    #[tokio::test]
    async fn test_success_without_validators_keeps_old_ones() {
        let (db, id) = test_db_with_feed().await;

        db.record_fetch_success(id, 3, Some("\"v1\""), None).await.unwrap();
        // A 304 response: success, zero items, no fresh validators
        db.record_fetch_success(id, 0, None, None).await.unwrap();

        let meta = db.get_feed_metadata(id).await.unwrap();
        assert_eq!(meta.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_rolling_average_smooths() {
        let (db, id) = test_db_with_feed().await;

        db.record_fetch_success(id, 10, None, None).await.unwrap();
        db.record_fetch_success(id, 0, None, None).await.unwrap();

        let meta = db.get_feed_metadata(id).await.unwrap();
        // 10 * 0.8 + 0 * 0.2
        assert!((meta.avg_article_count - 8.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failures_increment_and_extend_backoff() {
        let (db, id) = test_db_with_feed().await;

        assert_eq!(db.record_fetch_failure(id).await.unwrap(), 1);
        assert_eq!(db.record_fetch_failure(id).await.unwrap(), 2);

        let meta = db.get_feed_metadata(id).await.unwrap();
        assert_eq!(meta.consecutive_failures, 2);
        let retry_at = meta.next_retry_at.unwrap();
        let now = chrono::Utc::now().timestamp();
        // Second failure: 10 minute window
        assert!(retry_at > now + 9 * 60 && retry_at <= now + 10 * 60);
        assert_eq!(db.backed_off_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_failures_override() {
        let (db, id) = test_db_with_feed().await;
        db.record_fetch_failure(id).await.unwrap();

        db.clear_feed_failures(id).await.unwrap();

        let meta = db.get_feed_metadata(id).await.unwrap();
        assert_eq!(meta.consecutive_failures, 0);
        assert!(meta.next_retry_at.is_none());
        assert_eq!(db.backed_off_count().await.unwrap(), 0);
    }
}
