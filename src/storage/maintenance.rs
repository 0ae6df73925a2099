use anyhow::Result;

use super::schema::Database;
use super::types::StoreStats;

impl Database {
    // ========================================================================
    // Maintenance Operations
    // ========================================================================

    /// Compact the database file and refresh the query planner statistics.
    ///
    /// VACUUM cannot run inside a transaction.
    pub async fn compact(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        tracing::info!("Database compacted");
        Ok(())
    }

    /// Remove bookkeeping rows that reference deleted feeds: stale fetch
    /// metadata and archived articles whose feed is gone. Returns
    /// `(metadata_removed, archived_removed)`.
    pub async fn cleanup_orphans(&self) -> Result<(usize, usize)> {
        let mut tx = self.pool.begin().await?;

        let metadata = sqlx::query(
            "DELETE FROM feed_metadata
             WHERE feed_id NOT IN (SELECT id FROM feeds)",
        )
        .execute(&mut *tx)
        .await?;

        let archived = sqlx::query(
            "DELETE FROM archived_articles
             WHERE feed_id NOT IN (SELECT id FROM feeds)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let removed = (
            metadata.rows_affected() as usize,
            archived.rows_affected() as usize,
        );
        if removed.0 > 0 || removed.1 > 0 {
            tracing::info!(
                metadata = removed.0,
                archived = removed.1,
                "Removed orphaned rows"
            );
        }
        Ok(removed)
    }

    /// Size and row-count snapshot for the statistics/health command.
    pub async fn stats(&self) -> Result<StoreStats> {
        let size: (i64,) = sqlx::query_as(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;

        let feeds: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&self.pool)
            .await?;
        let folders: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM folders")
            .fetch_one(&self.pool)
            .await?;
        let articles: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        let archived: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM archived_articles")
            .fetch_one(&self.pool)
            .await?;

        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM articles GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let count_of = |name: &str| {
            by_status
                .iter()
                .find(|(s, _)| s == name)
                .map(|(_, c)| *c)
                .unwrap_or(0)
        };

        Ok(StoreStats {
            file_size_bytes: size.0,
            feeds: feeds.0,
            folders: folders.0,
            articles: articles.0,
            archived_articles: archived.0,
            articles_new: count_of("new"),
            articles_summarizing: count_of("summarizing"),
            articles_summarized: count_of("summarized"),
            articles_failed: count_of("failed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, NewItem};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn item(link: &str) -> NewItem {
        NewItem {
            link: link.to_string(),
            title: "T".to_string(),
            published: None,
            content: None,
        }
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        db.create_folder("News", None).await.unwrap();
        let arts = db
            .upsert_new(f, &[item("https://a.com/1"), item("https://a.com/2")])
            .await
            .unwrap();
        db.mark_summarizing(arts[0].id).await.unwrap();
        db.complete_summary(arts[0].id, "s").await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.feeds, 1);
        assert_eq!(stats.folders, 1);
        assert_eq!(stats.articles, 2);
        assert_eq!(stats.articles_new, 1);
        assert_eq!(stats.articles_summarized, 1);
        assert_eq!(stats.archived_articles, 0);
        assert!(stats.file_size_bytes > 0);
    }

    #[tokio::test]
    async fn test_cleanup_orphans() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let arts = db.upsert_new(f, &[item("https://a.com/1")]).await.unwrap();
        db.record_fetch_success(f, 1, None, None).await.unwrap();
        db.archive_article(arts[0].id, "manual").await.unwrap();

        db.delete_feed(f).await.unwrap();

        // Metadata cascades with the feed; the archived row is the orphan
        let (metadata, archived) = db.cleanup_orphans().await.unwrap();
        assert_eq!(metadata, 0);
        assert_eq!(archived, 1);
        assert!(db.get_archived(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_orphans_noop_when_clean() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        db.record_fetch_success(f, 1, None, None).await.unwrap();

        let (metadata, archived) = db.cleanup_orphans().await.unwrap();
        assert_eq!((metadata, archived), (0, 0));
    }

    #[tokio::test]
    async fn test_compact_runs() {
        let db = test_db().await;
        db.compact().await.unwrap();
    }
}
