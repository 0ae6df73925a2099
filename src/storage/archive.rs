use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{ArchivedArticle, ArchivedRow};

/// Maximum archived rows returned by listing/search queries.
const MAX_ARCHIVED_RESULTS: i64 = 500;

impl Database {
    // ========================================================================
    // Archive Operations
    // ========================================================================
    //
    // Archiving is move semantics: copy into archived_articles plus delete
    // from articles, in one transaction. An article is in exactly one of the
    // two tables at any instant — never both, never neither.

    /// Move an article into the archive. Returns `false` if the article does
    /// not exist (already archived, or never existed).
    pub async fn archive_article(&self, article_id: i64, reason: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let copied = sqlx::query(
            r#"
            INSERT INTO archived_articles
                (id, feed_id, link, title, published, content, summary, read, status,
                 created_at, reason, archived_at)
            SELECT id, feed_id, link, title, published, content, summary, read, status,
                   created_at, ?, ?
            FROM articles WHERE id = ?
        "#,
        )
        .bind(reason)
        .bind(now)
        .bind(article_id)
        .execute(&mut *tx)
        .await?;

        if copied.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM articles WHERE id = ?")
            .bind(article_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Move an archived article back to the active table, under its original
    /// id (active-table AUTOINCREMENT guarantees the id was never reissued).
    ///
    /// Returns `false` when the id is not in the archive. Errors if the
    /// article's feed has since been deleted, or its link was re-ingested
    /// while archived — restoring either would break an invariant.
    pub async fn restore_article(&self, article_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let restored = sqlx::query(
            r#"
            INSERT INTO articles
                (id, feed_id, link, title, published, content, summary, read, status, created_at)
            SELECT id, feed_id, link, title, published, content, summary, read, status, created_at
            FROM archived_articles WHERE id = ?
        "#,
        )
        .bind(article_id)
        .execute(&mut *tx)
        .await?;

        if restored.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM archived_articles WHERE id = ?")
            .bind(article_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Retention sweep: archive active articles older than `cutoff` that are
    /// read or failed, up to `batch` rows per call. Returns how many moved.
    ///
    /// Unread, still-pending articles are never swept — age alone does not
    /// make an article disposable.
    pub async fn sweep_active(&self, cutoff: i64, batch: usize, reason: &str) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM articles
            WHERE created_at < ? AND (read = 1 OR status = 'failed')
            ORDER BY created_at, id
            LIMIT ?
        "#,
        )
        .bind(cutoff)
        .bind(batch as i64)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let mut copy: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT INTO archived_articles \
                (id, feed_id, link, title, published, content, summary, read, status, \
                 created_at, reason, archived_at) \
             SELECT id, feed_id, link, title, published, content, summary, read, status, \
                    created_at, ",
        );
        copy.push_bind(reason);
        copy.push(", ");
        copy.push_bind(now);
        copy.push(" FROM articles WHERE id IN (");
        let mut separated = copy.separated(", ");
        for (id,) in &ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        copy.build().execute(&mut *tx).await?;

        let mut delete: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("DELETE FROM articles WHERE id IN (");
        let mut separated = delete.separated(", ");
        for (id,) in &ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        delete.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(ids.len())
    }

    /// Permanently delete archived rows older than `cutoff` (the second,
    /// longer retention window). Returns how many rows were removed.
    pub async fn purge_archived(&self, cutoff: i64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM archived_articles WHERE archived_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    // ========================================================================
    // Archive Queries
    // ========================================================================

    /// List archived articles, most recently archived first.
    pub async fn get_archived(&self, limit: Option<i64>) -> Result<Vec<ArchivedArticle>> {
        let limit = limit.unwrap_or(MAX_ARCHIVED_RESULTS).min(MAX_ARCHIVED_RESULTS);
        let rows = sqlx::query_as::<_, ArchivedRow>(
            r#"
            SELECT id, feed_id, link, title, published, content, summary, read, status,
                   created_at, reason, archived_at
            FROM archived_articles
            ORDER BY archived_at DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArchivedRow::into_archived).collect())
    }

    /// Get a single archived article by its original article id.
    pub async fn get_archived_by_id(&self, article_id: i64) -> Result<Option<ArchivedArticle>> {
        let row = sqlx::query_as::<_, ArchivedRow>(
            r#"
            SELECT id, feed_id, link, title, published, content, summary, read, status,
                   created_at, reason, archived_at
            FROM archived_articles WHERE id = ?
        "#,
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ArchivedRow::into_archived))
    }

    /// Substring search over archived articles. Archives are cold storage —
    /// a LIKE scan is enough, they are not in the full-text index.
    pub async fn search_archived(&self, query: &str) -> Result<Vec<ArchivedArticle>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", query);

        let rows = sqlx::query_as::<_, ArchivedRow>(
            r#"
            SELECT id, feed_id, link, title, published, content, summary, read, status,
                   created_at, reason, archived_at
            FROM archived_articles
            WHERE title LIKE ?1 OR content LIKE ?1 OR summary LIKE ?1
            ORDER BY archived_at DESC
            LIMIT ?2
        "#,
        )
        .bind(&pattern)
        .bind(MAX_ARCHIVED_RESULTS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArchivedRow::into_archived).collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{ArticleStatus, Database, NewItem};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn item(link: &str, title: &str) -> NewItem {
        NewItem {
            link: link.to_string(),
            title: title.to_string(),
            published: Some(1704067200),
            content: Some("body".to_string()),
        }
    }

    async fn seed_article(db: &Database) -> (i64, i64) {
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let a = db
            .upsert_new(f, &[item("https://a.com/1", "One")])
            .await
            .unwrap();
        (f, a[0].id)
    }

    #[tokio::test]
    async fn test_archive_moves_not_copies() {
        let db = test_db().await;
        let (f, id) = seed_article(&db).await;

        assert!(db.archive_article(id, "manual").await.unwrap());

        assert!(db.get_article_by_id(id).await.unwrap().is_none());
        let archived = db.get_archived_by_id(id).await.unwrap().unwrap();
        assert_eq!(archived.feed_id, f);
        assert_eq!(archived.reason, "manual");

        // Already archived: a second archive is a no-op
        assert!(!db.archive_article(id, "manual").await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_is_lossless() {
        let db = test_db().await;
        let (_f, id) = seed_article(&db).await;

        db.mark_article_read(id).await.unwrap();
        db.mark_summarizing(id).await.unwrap();
        db.complete_summary(id, "summary text").await.unwrap();
        let before = db.get_article_by_id(id).await.unwrap().unwrap();

        assert!(db.archive_article(id, "manual").await.unwrap());
        assert!(db.restore_article(id).await.unwrap());

        let after = db.get_article_by_id(id).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert!(db.get_archived_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_keeps_original_id_after_new_inserts() {
        let db = test_db().await;
        let (f, id) = seed_article(&db).await;

        db.archive_article(id, "manual").await.unwrap();
        // New insert while archived must not reuse the archived id
        let newer = db
            .upsert_new(f, &[item("https://a.com/2", "Two")])
            .await
            .unwrap();
        assert_ne!(newer[0].id, id);

        assert!(db.restore_article(id).await.unwrap());
        let restored = db.get_article_by_id(id).await.unwrap().unwrap();
        assert_eq!(restored.link, "https://a.com/1");
    }

    #[tokio::test]
    async fn test_restore_missing_id_is_noop() {
        let db = test_db().await;
        assert!(!db.restore_article(42).await.unwrap());
    }

    #[tokio::test]
    async fn test_restored_article_is_searchable_again() {
        let db = test_db().await;
        let (_f, id) = seed_article(&db).await;

        db.archive_article(id, "manual").await.unwrap();
        assert!(db
            .search("One", &Default::default())
            .await
            .unwrap()
            .is_empty());

        db.restore_article(id).await.unwrap();
        let hits = db.search("One", &Default::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_archives_only_eligible() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let arts = db
            .upsert_new(
                f,
                &[
                    item("https://a.com/read", "Read one"),
                    item("https://a.com/failed", "Failed one"),
                    item("https://a.com/pending", "Pending one"),
                ],
            )
            .await
            .unwrap();

        db.mark_article_read(arts[0].id).await.unwrap();
        db.mark_summarizing(arts[1].id).await.unwrap();
        db.fail_summary(arts[1].id).await.unwrap();

        // Cutoff in the future: every article is "old enough"
        let cutoff = chrono::Utc::now().timestamp() + 10;
        let moved = db.sweep_active(cutoff, 100, "retention").await.unwrap();
        assert_eq!(moved, 2);

        // The unread, still-new article survives the sweep
        let remaining = db.get_articles_for_feed(f, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, ArticleStatus::New);

        let archived = db.get_archived(None).await.unwrap();
        assert_eq!(archived.len(), 2);
        assert!(archived.iter().all(|a| a.reason == "retention"));
    }

    #[tokio::test]
    async fn test_sweep_respects_cutoff_and_batch() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let arts = db
            .upsert_new(
                f,
                &[item("https://a.com/1", "One"), item("https://a.com/2", "Two")],
            )
            .await
            .unwrap();
        for a in &arts {
            db.mark_article_read(a.id).await.unwrap();
        }

        // Cutoff in the past: nothing is old enough
        assert_eq!(db.sweep_active(0, 100, "retention").await.unwrap(), 0);

        // Batch cap limits how much one sweep moves
        let cutoff = chrono::Utc::now().timestamp() + 10;
        assert_eq!(db.sweep_active(cutoff, 1, "retention").await.unwrap(), 1);
        assert_eq!(db.sweep_active(cutoff, 1, "retention").await.unwrap(), 1);
        assert_eq!(db.sweep_active(cutoff, 1, "retention").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_archived_by_age() {
        let db = test_db().await;
        let (_f, id) = seed_article(&db).await;
        db.archive_article(id, "manual").await.unwrap();

        // Cutoff before the archive timestamp: nothing purged
        assert_eq!(db.purge_archived(0).await.unwrap(), 0);

        let cutoff = chrono::Utc::now().timestamp() + 10;
        assert_eq!(db.purge_archived(cutoff).await.unwrap(), 1);
        assert!(db.get_archived(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_archived() {
        let db = test_db().await;
        let (_f, id) = seed_article(&db).await;
        db.archive_article(id, "manual").await.unwrap();

        let hits = db.search_archived("One").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!(db.search_archived("nonexistent").await.unwrap().is_empty());
    }
}
