use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StoreError;

// ============================================================================
// Database
// ============================================================================

/// Single source of truth for feeds, folders, articles, fetch metadata, and
/// archives. Cloning is cheap (shared pool); every component receives its
/// handle from `main`, there is no ambient global.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// Initialization is idempotent: tables, indices, the full-text index and
    /// its synchronization triggers all use `IF NOT EXISTS`, and columns added
    /// after the first release are migrated additively.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InstanceLocked` if another instance of gleaner
    /// has the database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `StoreError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY, which absorbs transient contention
        // between the fetch scheduler and the summarize write-back path.
        // journal_mode=WAL: concurrent readers while one writer proceeds.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_sqlx)?
            .pragma("busy_timeout", "5000")
            .pragma("journal_mode", "WAL")
            .pragma("foreign_keys", "ON");

        // SQLite is single-writer; 5 connections covers peak concurrent
        // readers (scheduler metadata reads + search + stats queries).
        // An in-memory database exists per connection, so it must be pinned
        // to exactly one.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            // Migration errors could also be lock-related
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                StoreError::InstanceLocked
            } else {
                StoreError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All schema changes (tables, indexes, triggers) are wrapped in a single
    /// transaction. If any migration step fails (disk full, power loss), the
    /// whole migration rolls back, leaving the database in its previous
    /// consistent state. SQLite supports DDL inside transactions, so this is
    /// safe, and `IF NOT EXISTS` everywhere makes re-running a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                parent_id INTEGER REFERENCES folders(id) ON DELETE SET NULL,
                sort_order INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                folder_id INTEGER REFERENCES folders(id) ON DELETE SET NULL,
                sort_order INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // AUTOINCREMENT: ids of deleted (archived) rows are never reissued,
        // which lets restore reinsert an article under its original id.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                link TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                published INTEGER,
                content TEXT,
                summary TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'new',
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_metadata (
                feed_id INTEGER PRIMARY KEY REFERENCES feeds(id) ON DELETE CASCADE,
                last_fetch INTEGER,
                last_success INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                etag TEXT,
                last_modified TEXT,
                avg_article_count REAL NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Archives deliberately carry no feed FK: an archived article may
        // outlive its feed, and cleanup_orphans() reaps the leftovers.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS archived_articles (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL,
                link TEXT NOT NULL,
                title TEXT NOT NULL,
                published INTEGER,
                content TEXT,
                summary TEXT,
                read INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                reason TEXT NOT NULL,
                archived_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed ON articles(feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_status ON articles(status)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published DESC)",
        )
        .execute(&mut *tx)
        .await?;
        // Retention sweep filters by age and read/failed state
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_created ON articles(created_at, read, status)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feeds_folder ON feeds(folder_id, sort_order)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_archived_at ON archived_articles(archived_at)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_archived_feed ON archived_articles(feed_id)",
        )
        .execute(&mut *tx)
        .await?;

        // Full-text index over title/content/summary/feed name. Standalone
        // table (not external content): archives delete the article row but
        // search must keep working for what remains, and the feed_title
        // column has no source column on articles.
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS article_search
            USING fts5(title, content, summary, feed_title)
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Sync triggers: the index always reflects the latest committed write
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS article_search_insert AFTER INSERT ON articles BEGIN
                INSERT INTO article_search(rowid, title, content, summary, feed_title)
                VALUES (
                    new.id, new.title, coalesce(new.content, ''), coalesce(new.summary, ''),
                    coalesce((SELECT title FROM feeds WHERE id = new.feed_id), '')
                );
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS article_search_delete AFTER DELETE ON articles BEGIN
                DELETE FROM article_search WHERE rowid = old.id;
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS article_search_update AFTER UPDATE ON articles BEGIN
                DELETE FROM article_search WHERE rowid = old.id;
                INSERT INTO article_search(rowid, title, content, summary, feed_title)
                VALUES (
                    new.id, new.title, coalesce(new.content, ''), coalesce(new.summary, ''),
                    coalesce((SELECT title FROM feeds WHERE id = new.feed_id), '')
                );
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Backfill the index once if articles exist but the index is empty
        // (first run after an upgrade that introduced full-text search).
        let index_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM article_search")
            .fetch_one(&mut *tx)
            .await?;

        if index_count.0 == 0 {
            let article_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
                .fetch_one(&mut *tx)
                .await
                .unwrap_or((0,));

            if article_count.0 > 0 {
                sqlx::query(
                    r#"
                    INSERT INTO article_search(rowid, title, content, summary, feed_title)
                    SELECT a.id, a.title, coalesce(a.content, ''), coalesce(a.summary, ''),
                           coalesce(f.title, '')
                    FROM articles a
                    LEFT JOIN feeds f ON f.id = a.feed_id
                "#,
                )
                .execute(&mut *tx)
                .await?;
                tracing::info!(articles = article_count.0, "Backfilled search index");
            }
        }

        // Backoff scheduling column, added after the first release
        // (ignore error if it already exists)
        sqlx::query("ALTER TABLE feed_metadata ADD COLUMN next_retry_at INTEGER")
            .execute(&mut *tx)
            .await
            .ok();

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = Database::open(":memory:").await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gleaner.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).await.unwrap();
        drop(db);
        // Second open re-runs every migration against the populated schema
        let db = Database::open(path).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_schema_has_next_retry_at_column() {
        let db = Database::open(":memory:").await.unwrap();
        // The additive migration must leave the column queryable
        sqlx::query("SELECT next_retry_at FROM feed_metadata")
            .fetch_all(&db.pool)
            .await
            .unwrap();
    }
}
