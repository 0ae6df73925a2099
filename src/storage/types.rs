use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another instance of the application has locked the database
    #[error("Another instance of gleaner appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StoreError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StoreError::InstanceLocked;
        }

        StoreError::Other(err)
    }
}

// ============================================================================
// Article Lifecycle
// ============================================================================

/// Summarization lifecycle state of an article.
///
/// Legal transitions: `new → summarizing → {summarized, failed}` and the
/// operator reset `failed → new`. Everything else is a guarded no-op at the
/// store layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    New,
    Summarizing,
    Summarized,
    Failed,
}

impl ArticleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ArticleStatus::New => "new",
            ArticleStatus::Summarizing => "summarizing",
            ArticleStatus::Summarized => "summarized",
            ArticleStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(ArticleStatus::New),
            "summarizing" => Some(ArticleStatus::Summarizing),
            "summarized" => Some(ArticleStatus::Summarized),
            "failed" => Some(ArticleStatus::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Domain Types
// ============================================================================

/// A subscribed feed source.
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub folder_id: Option<i64>,
    pub sort_order: i64,
}

/// A flat grouping of feeds with an optional parent reference.
#[derive(Debug, Clone)]
pub struct Folder {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub sort_order: i64,
}

/// An active article.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub link: String,
    pub title: String,
    pub published: Option<i64>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub read: bool,
    pub status: ArticleStatus,
    pub created_at: i64,
}

/// An article moved out of the active table by retention or explicit action.
///
/// Carries the full article shape plus why and when it was archived. `id` is
/// the original article id; active-table AUTOINCREMENT guarantees it is
/// never reissued, so restore can reinsert under it.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedArticle {
    pub id: i64,
    pub feed_id: i64,
    pub link: String,
    pub title: String,
    pub published: Option<i64>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub read: bool,
    pub status: ArticleStatus,
    pub created_at: i64,
    pub reason: String,
    pub archived_at: i64,
}

/// Per-feed fetch bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct FeedMetadata {
    pub feed_id: i64,
    pub last_fetch: Option<i64>,
    pub last_success: Option<i64>,
    pub consecutive_failures: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub avg_article_count: f64,
    /// Unix timestamp before which the scheduler skips this feed.
    pub next_retry_at: Option<i64>,
}

/// A parsed feed item handed to `upsert_new`. Items without a link never get
/// this far — the link is the article's identity.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub link: String,
    pub title: String,
    pub published: Option<i64>,
    pub content: Option<String>,
}

// ============================================================================
// Search Types
// ============================================================================

/// Optional filters applied on top of a full-text query.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub feed_ids: Option<Vec<i64>>,
    pub read: Option<bool>,
    pub status: Option<ArticleStatus>,
    pub published_after: Option<i64>,
    pub published_before: Option<i64>,
}

/// One ranked search result with a highlighted snippet.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub article: Article,
    pub snippet: String,
}

// ============================================================================
// Duplicate Detection
// ============================================================================

/// A transitively connected group of similar articles.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    /// Merge target: oldest member, richest content as tiebreak.
    pub primary_id: i64,
    /// The remaining members, candidates for archival on merge.
    pub duplicate_ids: Vec<i64>,
    /// Highest pairwise similarity observed inside the group.
    pub similarity: f64,
}

// ============================================================================
// Statistics
// ============================================================================

/// Size and row-count snapshot for the statistics/health command.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub file_size_bytes: i64,
    pub feeds: i64,
    pub folders: i64,
    pub articles: i64,
    pub archived_articles: i64,
    pub articles_new: i64,
    pub articles_summarizing: i64,
    pub articles_summarized: i64,
    pub articles_failed: i64,
}

/// Search index consistency report.
#[derive(Debug)]
pub struct IndexConsistencyReport {
    pub articles_count: i64,
    pub index_count: i64,
    pub is_consistent: bool,
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for Article queries (used by sqlx FromRow).
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleRow {
    pub id: i64,
    pub feed_id: i64,
    pub link: String,
    pub title: String,
    pub published: Option<i64>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub read: bool,
    pub status: String,
    pub created_at: i64,
}

impl ArticleRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_id: self.feed_id,
            link: self.link,
            title: self.title,
            published: self.published,
            content: self.content,
            summary: self.summary,
            read: self.read,
            // Unknown status text means hand-edited rows; treat as failed so
            // the operator retry path applies.
            status: ArticleStatus::parse(&self.status).unwrap_or(ArticleStatus::Failed),
            created_at: self.created_at,
        }
    }
}

/// Internal row type for ArchivedArticle queries.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArchivedRow {
    pub id: i64,
    pub feed_id: i64,
    pub link: String,
    pub title: String,
    pub published: Option<i64>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub read: bool,
    pub status: String,
    pub created_at: i64,
    pub reason: String,
    pub archived_at: i64,
}

impl ArchivedRow {
    pub(crate) fn into_archived(self) -> ArchivedArticle {
        ArchivedArticle {
            id: self.id,
            feed_id: self.feed_id,
            link: self.link,
            title: self.title,
            published: self.published,
            content: self.content,
            summary: self.summary,
            read: self.read,
            status: ArticleStatus::parse(&self.status).unwrap_or(ArticleStatus::Failed),
            created_at: self.created_at,
            reason: self.reason,
            archived_at: self.archived_at,
        }
    }
}

/// Internal row type for FeedMetadata queries.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MetadataRow {
    pub feed_id: i64,
    pub last_fetch: Option<i64>,
    pub last_success: Option<i64>,
    pub consecutive_failures: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub avg_article_count: f64,
    pub next_retry_at: Option<i64>,
}

impl MetadataRow {
    pub(crate) fn into_metadata(self) -> FeedMetadata {
        FeedMetadata {
            feed_id: self.feed_id,
            last_fetch: self.last_fetch,
            last_success: self.last_success,
            consecutive_failures: self.consecutive_failures,
            etag: self.etag,
            last_modified: self.last_modified,
            avg_article_count: self.avg_article_count,
            next_retry_at: self.next_retry_at,
        }
    }
}
