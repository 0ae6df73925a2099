use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Article, ArticleRow, ArticleStatus, NewItem};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

impl Database {
    // ========================================================================
    // Article Ingestion
    // ========================================================================

    /// Insert items whose link is not already present for *any* feed.
    ///
    /// The link is the article's global identity: re-ingesting the same link
    /// from a second feed inserts nothing, and the row stays attributed to
    /// the feed that saw it first. Returns exactly the newly inserted
    /// articles — `ON CONFLICT DO NOTHING RETURNING` only yields rows that
    /// actually landed, so a duplicate is "nothing to insert", never an
    /// error.
    ///
    /// Batch size of 50 keeps us well under SQLite's parameter limit
    /// (8 columns * 50 = 400). All chunks commit in one transaction.
    pub async fn upsert_new(&self, feed_id: i64, items: &[NewItem]) -> Result<Vec<Article>> {
        let usable: Vec<&NewItem> = items.iter().filter(|i| !i.link.is_empty()).collect();
        let skipped = items.len() - usable.len();
        if skipped > 0 {
            tracing::warn!(feed_id, skipped, "Items without a link skipped");
        }
        if usable.is_empty() {
            return Ok(Vec::new());
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        const BATCH_SIZE: usize = 50;
        let mut inserted: Vec<Article> = Vec::new();

        for chunk in usable.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO articles (feed_id, link, title, published, content, summary, status, created_at) ",
            );

            builder.push_values(chunk, |mut b, item| {
                b.push_bind(feed_id)
                    .push_bind(&item.link)
                    .push_bind(&item.title)
                    .push_bind(item.published)
                    .push_bind(&item.content)
                    .push_bind(Option::<String>::None)
                    .push_bind(ArticleStatus::New.as_str())
                    .push_bind(now);
            });

            builder.push(
                " ON CONFLICT(link) DO NOTHING \
                 RETURNING id, feed_id, link, title, published, content, summary, read, status, created_at",
            );

            let rows: Vec<ArticleRow> = builder
                .build_query_as::<ArticleRow>()
                .fetch_all(&mut *tx)
                .await?;

            inserted.extend(rows.into_iter().map(ArticleRow::into_article));
        }

        tx.commit().await?;
        Ok(inserted)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Get articles for a specific feed with optional pagination limit.
    /// Hard cap at MAX_ARTICLES (2000) to prevent OOM.
    pub async fn get_articles_for_feed(
        &self,
        feed_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Article>> {
        let limit = limit.unwrap_or(500).min(MAX_ARTICLES);

        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, feed_id, link, title, published, content, summary, read, status, created_at
            FROM articles
            WHERE feed_id = ?
            ORDER BY published DESC, created_at DESC
            LIMIT ?
        "#,
        )
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    /// Get a single article by its ID.
    pub async fn get_article_by_id(&self, article_id: i64) -> Result<Option<Article>> {
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, feed_id, link, title, published, content, summary, read, status, created_at
            FROM articles
            WHERE id = ?
        "#,
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ArticleRow::into_article))
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Mark article as read (idempotent), returns whether it was changed.
    ///
    /// Uses `WHERE read = 0` so the operation only writes when it has
    /// something to do.
    pub async fn mark_article_read(&self, article_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE articles SET read = 1 WHERE id = ? AND read = 0")
            .bind(article_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Status Transitions
    // ========================================================================
    //
    // Every transition is a guarded UPDATE: the WHERE clause names the only
    // legal source state, so a request from any other state affects zero
    // rows and reports `false`. There is a single logical writer per
    // article, so a no-op is the correct answer, not a conflict.

    /// `new → summarizing`. Returns whether the transition happened.
    pub async fn mark_summarizing(&self, article_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE articles SET status = 'summarizing' WHERE id = ? AND status = 'new'",
        )
        .bind(article_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `summarizing → summarized`, storing the summary text.
    pub async fn complete_summary(&self, article_id: i64, summary: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE articles SET status = 'summarized', summary = ?
             WHERE id = ? AND status = 'summarizing'",
        )
        .bind(summary)
        .bind(article_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `summarizing → failed`.
    pub async fn fail_summary(&self, article_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE articles SET status = 'failed' WHERE id = ? AND status = 'summarizing'",
        )
        .bind(article_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `failed → new` — the only externally triggered reset (operator retry).
    pub async fn retry_article(&self, article_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE articles SET status = 'new' WHERE id = ? AND status = 'failed'",
        )
        .bind(article_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically claim up to `limit` of the oldest `new` articles for
    /// summarization, transitioning each to `summarizing`.
    ///
    /// A single guarded UPDATE with RETURNING, so two concurrent claimers
    /// can never hand out the same article twice.
    pub async fn claim_for_summary(&self, limit: usize) -> Result<Vec<Article>> {
        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            UPDATE articles SET status = 'summarizing'
            WHERE id IN (
                SELECT id FROM articles WHERE status = 'new'
                ORDER BY created_at, id
                LIMIT ?
            )
            RETURNING id, feed_id, link, title, published, content, summary, read, status, created_at
        "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }
}
