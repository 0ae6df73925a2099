use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{ArticleRow, IndexConsistencyReport, SearchFilters, SearchHit};

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_WILDCARDS: usize = 3;
const MAX_OR_OPERATORS: usize = 5;
const MAX_PARENTHESES: usize = 5;
const MAX_AND_OPERATORS: usize = 10;

/// Maximum number of results returned from any search (OOM protection)
const MAX_RESULTS: i64 = 500;

/// Number of snippet tokens around each match
const SNIPPET_TOKENS: i64 = 12;

/// Validate FTS5 query complexity to prevent DoS via expensive wildcard
/// expansions.
///
/// Limits:
/// - Maximum query length: 256 characters
/// - Maximum wildcards (*): 3
/// - Maximum OR operators: 5
/// - Maximum parentheses: 5
/// - Maximum AND operators: 10
fn validate_fts_query(query: &str) -> Result<()> {
    if query.len() > MAX_QUERY_LENGTH {
        anyhow::bail!(
            "Search query exceeds maximum length of {} characters",
            MAX_QUERY_LENGTH
        );
    }

    let wildcard_count = query.matches('*').count();
    if wildcard_count > MAX_WILDCARDS {
        anyhow::bail!(
            "Search query contains too many wildcards (max {})",
            MAX_WILDCARDS
        );
    }

    let or_count = query.to_uppercase().matches(" OR ").count();
    if or_count > MAX_OR_OPERATORS {
        anyhow::bail!(
            "Search query contains too many OR operators (max {})",
            MAX_OR_OPERATORS
        );
    }

    let open_paren_count = query.chars().filter(|&c| c == '(').count();
    let close_paren_count = query.chars().filter(|&c| c == ')').count();
    if open_paren_count > MAX_PARENTHESES {
        anyhow::bail!(
            "Search query contains too many parentheses (max {})",
            MAX_PARENTHESES
        );
    }

    if open_paren_count != close_paren_count {
        anyhow::bail!("Search query has unbalanced parentheses");
    }

    let and_count = query.to_uppercase().matches(" AND ").count();
    if and_count > MAX_AND_OPERATORS {
        anyhow::bail!(
            "Search query contains too many AND operators (max {})",
            MAX_AND_OPERATORS
        );
    }

    Ok(())
}

/// Row shape for ranked search hits.
#[derive(sqlx::FromRow)]
struct SearchRow {
    id: i64,
    feed_id: i64,
    link: String,
    title: String,
    published: Option<i64>,
    content: Option<String>,
    summary: Option<String>,
    read: bool,
    status: String,
    created_at: i64,
    snippet: String,
}

impl SearchRow {
    fn into_hit(self) -> SearchHit {
        let snippet = self.snippet.clone();
        let row = ArticleRow {
            id: self.id,
            feed_id: self.feed_id,
            link: self.link,
            title: self.title,
            published: self.published,
            content: self.content,
            summary: self.summary,
            read: self.read,
            status: self.status,
            created_at: self.created_at,
        };
        SearchHit {
            article: row.into_article(),
            snippet,
        }
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, sqlx::Sqlite>, filters: &SearchFilters) {
    if let Some(feed_ids) = &filters.feed_ids {
        builder.push(" AND a.feed_id IN (");
        let mut separated = builder.separated(", ");
        for id in feed_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
    }
    if let Some(read) = filters.read {
        builder.push(" AND a.read = ");
        builder.push_bind(read);
    }
    if let Some(status) = filters.status {
        builder.push(" AND a.status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(after) = filters.published_after {
        builder.push(" AND a.published >= ");
        builder.push_bind(after);
    }
    if let Some(before) = filters.published_before {
        builder.push(" AND a.published <= ");
        builder.push_bind(before);
    }
}

impl Database {
    // ========================================================================
    // Search Operations
    // ========================================================================

    /// Ranked full-text search over title/content/summary/feed name with
    /// highlighted snippets, narrowed by the given filters.
    ///
    /// Index updates are synchronous (triggers), so results always reflect
    /// the latest committed write. Falls back to LIKE matching for queries
    /// that fail FTS5 syntax.
    pub async fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        validate_fts_query(query)?;

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT a.id, a.feed_id, a.link, a.title, a.published, a.content, a.summary, \
                    a.read, a.status, a.created_at, \
                    snippet(article_search, -1, '[', ']', '…', {SNIPPET_TOKENS}) AS snippet \
             FROM article_search \
             JOIN articles a ON a.id = article_search.rowid \
             WHERE article_search MATCH ",
        ));
        builder.push_bind(query);
        push_filters(&mut builder, filters);
        builder.push(" ORDER BY bm25(article_search) LIMIT ");
        builder.push_bind(MAX_RESULTS);

        let fts_result = builder.build_query_as::<SearchRow>().fetch_all(&self.pool).await;

        match fts_result {
            Ok(rows) => Ok(rows.into_iter().map(SearchRow::into_hit).collect()),
            Err(e) => {
                tracing::warn!(error = %e, query = %query, "FTS5 search failed, falling back to LIKE");
                self.search_like(query, filters).await
            }
        }
    }

    /// LIKE fallback for queries FTS5 rejects. The snippet degrades to the
    /// article title — there is no match position to highlight.
    async fn search_like(&self, query: &str, filters: &SearchFilters) -> Result<Vec<SearchHit>> {
        let like_pattern = format!("%{}%", query);

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT a.id, a.feed_id, a.link, a.title, a.published, a.content, a.summary, \
                    a.read, a.status, a.created_at, a.title AS snippet \
             FROM articles a \
             WHERE (a.title LIKE ",
        );
        builder.push_bind(&like_pattern);
        builder.push(" OR a.content LIKE ");
        builder.push_bind(&like_pattern);
        builder.push(" OR a.summary LIKE ");
        builder.push_bind(&like_pattern);
        builder.push(")");
        push_filters(&mut builder, filters);
        builder.push(" ORDER BY a.published DESC LIMIT ");
        builder.push_bind(MAX_RESULTS);

        let rows = builder.build_query_as::<SearchRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(SearchRow::into_hit).collect())
    }

    /// Title suggestions for a search-as-you-type prefix.
    pub async fn search_suggestions(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        validate_fts_query(prefix)?;

        // Quoted phrase-prefix query; quotes inside the prefix would close
        // the phrase early, so they are dropped.
        let match_expr = format!("\"{}\"*", prefix.replace('"', ""));

        // DISTINCT cannot be combined with ordering by bm25() in SQLite, so
        // duplicates are dropped after the ranked fetch.
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT a.title
            FROM article_search
            JOIN articles a ON a.id = article_search.rowid
            WHERE article_search MATCH ?
            ORDER BY bm25(article_search)
            LIMIT ?
        "#,
        )
        .bind(&match_expr)
        .bind(limit as i64 * 2)
        .fetch_all(&self.pool)
        .await?;

        let mut titles: Vec<String> = Vec::new();
        for (title,) in rows {
            if !titles.contains(&title) {
                titles.push(title);
            }
            if titles.len() == limit {
                break;
            }
        }
        Ok(titles)
    }

    // ========================================================================
    // Index Maintenance Operations
    // ========================================================================

    /// Check whether the search index mirrors the articles table.
    pub async fn check_index_consistency(&self) -> Result<IndexConsistencyReport> {
        let articles_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;

        let index_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM article_search")
            .fetch_one(&self.pool)
            .await?;

        // Orphaned: in the index but not in articles. Missing: the reverse.
        let orphaned: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM article_search
             LEFT JOIN articles ON article_search.rowid = articles.id
             WHERE articles.id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let missing: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM articles
             LEFT JOIN article_search ON articles.id = article_search.rowid
             WHERE article_search.rowid IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let is_consistent =
            orphaned.0 == 0 && missing.0 == 0 && articles_count.0 == index_count.0;

        tracing::debug!(
            articles = articles_count.0,
            index = index_count.0,
            orphaned = orphaned.0,
            missing = missing.0,
            is_consistent,
            "Search index consistency check"
        );

        Ok(IndexConsistencyReport {
            articles_count: articles_count.0,
            index_count: index_count.0,
            is_consistent,
        })
    }

    /// Rebuild the search index from the articles table.
    ///
    /// Clears and repopulates in one transaction. Use when
    /// `check_index_consistency` reports drift, or after a restore.
    /// Returns the number of articles indexed.
    pub async fn rebuild_search_index(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM article_search")
            .execute(&mut *tx)
            .await?;

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

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{ArticleStatus, Database, NewItem, SearchFilters};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn item(link: &str, title: &str, content: &str) -> NewItem {
        NewItem {
            link: link.to_string(),
            title: title.to_string(),
            published: Some(1704067200),
            content: Some(content.to_string()),
        }
    }

    async fn seed(db: &Database) -> (i64, i64) {
        let f1 = db.add_feed("https://rustblog.com/rss", "Rust Blog", None).await.unwrap();
        let f2 = db.add_feed("https://pynews.com/rss", "Python News", None).await.unwrap();
        db.upsert_new(
            f1,
            &[
                item("https://rustblog.com/1", "Rust Programming Guide", "Ownership and borrowing"),
                item("https://rustblog.com/2", "Async Rust Patterns", "Executors and futures"),
            ],
        )
        .await
        .unwrap();
        db.upsert_new(
            f2,
            &[item("https://pynews.com/1", "Python Tutorial", "Generators and iterators")],
        )
        .await
        .unwrap();
        (f1, f2)
    }

    #[tokio::test]
    async fn test_search_by_title() {
        let db = test_db().await;
        seed(&db).await;

        let hits = db.search("Tutorial", &SearchFilters::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].article.title, "Python Tutorial");
    }

    #[tokio::test]
    async fn test_search_by_content() {
        let db = test_db().await;
        seed(&db).await;

        let hits = db.search("borrowing", &SearchFilters::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].snippet.contains("[borrowing]"));
    }

    #[tokio::test]
    async fn test_search_by_feed_name() {
        let db = test_db().await;
        seed(&db).await;

        // "Blog" only appears in the feed title, mirrored into the index
        let hits = db.search("Blog", &SearchFilters::default()).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_search_feed_filter() {
        let db = test_db().await;
        let (f1, _f2) = seed(&db).await;

        let filters = SearchFilters {
            feed_ids: Some(vec![f1]),
            ..Default::default()
        };
        let hits = db.search("Rust OR Python", &filters).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.article.feed_id == f1));
    }

    #[tokio::test]
    async fn test_search_read_and_status_filters() {
        let db = test_db().await;
        seed(&db).await;

        let all = db.search("Rust", &SearchFilters::default()).await.unwrap();
        db.mark_article_read(all[0].article.id).await.unwrap();

        let filters = SearchFilters {
            read: Some(false),
            status: Some(ArticleStatus::New),
            ..Default::default()
        };
        let hits = db.search("Rust", &filters).await.unwrap();
        assert_eq!(hits.len(), all.len() - 1);
    }

    #[tokio::test]
    async fn test_search_date_range_filter() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        db.upsert_new(
            f,
            &[
                NewItem {
                    link: "https://a.com/old".into(),
                    title: "Kernel update".into(),
                    published: Some(1000),
                    content: None,
                },
                NewItem {
                    link: "https://a.com/new".into(),
                    title: "Kernel release".into(),
                    published: Some(2000),
                    content: None,
                },
            ],
        )
        .await
        .unwrap();

        let filters = SearchFilters {
            published_after: Some(1500),
            ..Default::default()
        };
        let hits = db.search("Kernel", &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].article.link, "https://a.com/new");
    }

    #[tokio::test]
    async fn test_search_reflects_summary_update_immediately() {
        let db = test_db().await;
        let f = db.add_feed("https://a.com/rss", "A", None).await.unwrap();
        let a = db
            .upsert_new(f, &[item("https://a.com/1", "Plain title", "plain body")])
            .await
            .unwrap();

        db.mark_summarizing(a[0].id).await.unwrap();
        db.complete_summary(a[0].id, "a zymurgy digression").await.unwrap();

        let hits = db.search("zymurgy", &SearchFilters::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].article.id, a[0].id);
    }

    #[tokio::test]
    async fn test_search_empty_query() {
        let db = test_db().await;
        let hits = db.search("", &SearchFilters::default()).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_rejects_complex_queries() {
        let db = test_db().await;
        assert!(db
            .search(&"a".repeat(257), &SearchFilters::default())
            .await
            .is_err());
        assert!(db
            .search("a* b* c* d*", &SearchFilters::default())
            .await
            .is_err());
        assert!(db
            .search("a OR b OR c OR d OR e OR f OR g", &SearchFilters::default())
            .await
            .is_err());
        assert!(db.search("(a AND b", &SearchFilters::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_suggestions_prefix_match() {
        let db = test_db().await;
        seed(&db).await;

        let suggestions = db.search_suggestions("Asyn", 10).await.unwrap();
        assert_eq!(suggestions, vec!["Async Rust Patterns".to_string()]);
    }

    #[tokio::test]
    async fn test_suggestions_empty_prefix() {
        let db = test_db().await;
        assert!(db.search_suggestions("  ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_consistency_and_rebuild() {
        let db = test_db().await;
        seed(&db).await;

        let report = db.check_index_consistency().await.unwrap();
        assert!(report.is_consistent);
        assert_eq!(report.articles_count, 3);
        assert_eq!(report.index_count, 3);

        let count = db.rebuild_search_index().await.unwrap();
        assert_eq!(count, 3);
        assert!(db.check_index_consistency().await.unwrap().is_consistent);

        let hits = db.search("Tutorial", &SearchFilters::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_index_follows_deletes() {
        let db = test_db().await;
        let (f1, _) = seed(&db).await;

        db.delete_feed(f1).await.unwrap();

        let report = db.check_index_consistency().await.unwrap();
        assert!(report.is_consistent);
        assert_eq!(report.articles_count, 1);
        let hits = db.search("Rust", &SearchFilters::default()).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_feed_rename_updates_index() {
        let db = test_db().await;
        let (f1, _) = seed(&db).await;

        db.rename_feed(f1, "Crustacean Weekly").await.unwrap();

        let hits = db.search("Crustacean", &SearchFilters::default()).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(db.search("Blog", &SearchFilters::default()).await.unwrap().is_empty());
    }
}
