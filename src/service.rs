use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::config::{Config, RetentionConfig};
use crate::fetch::{FetchOutcome, FetchScheduler, SchedulerStats};
use crate::storage::{
    ArchivedArticle, Article, Database, DuplicateGroup, Feed, FeedMetadata, Folder,
    SearchFilters, SearchHit, StoreStats, AUTO_MERGE_THRESHOLD,
};
use crate::summarize::{EndpointStatus, LoadBalancer, PoolError, PoolStats, SummaryPool, SummaryRequest};

/// Aggregate outcome of one fetch pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FetchPassSummary {
    pub fetched: usize,
    pub not_modified: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_articles: usize,
}

/// Aggregate outcome of one summarize pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SummarizePassSummary {
    pub submitted: usize,
    pub summarized: usize,
    pub failed: usize,
}

/// Aggregate outcome of one retention sweep.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RetentionSummary {
    pub archived: usize,
    pub purged: usize,
}

/// Everything the health/statistics command reports.
#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub store: StoreStats,
    pub scheduler: SchedulerStats,
    pub pool: PoolStats,
    pub endpoints: Vec<EndpointStatus>,
}

/// The command surface the orchestrator and UI layer drive.
///
/// Owns the process singletons — store handle, fetch scheduler, worker pool,
/// load balancer — constructed once in `main` and passed in by handle.
pub struct Service {
    db: Database,
    scheduler: FetchScheduler,
    pool: SummaryPool,
    balancer: Arc<LoadBalancer>,
    retention: Mutex<RetentionConfig>,
    summarize_batch: usize,
}

impl Service {
    pub fn new(
        db: Database,
        scheduler: FetchScheduler,
        pool: SummaryPool,
        balancer: Arc<LoadBalancer>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            scheduler,
            pool,
            balancer,
            retention: Mutex::new(config.retention),
            summarize_batch: config.orchestrator.summarize_batch,
        }
    }

    // ========================================================================
    // Feeds & Folders
    // ========================================================================

    pub async fn add_feed(&self, url: &str, title: &str, folder: Option<i64>) -> Result<i64> {
        self.db.add_feed(url, title, folder).await
    }

    pub async fn get_feeds(&self) -> Result<Vec<Feed>> {
        self.db.get_feeds().await
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        self.db.get_feed(feed_id).await
    }

    pub async fn delete_feed(&self, feed_id: i64) -> Result<()> {
        self.db.delete_feed(feed_id).await
    }

    pub async fn rename_feed(&self, feed_id: i64, title: &str) -> Result<()> {
        self.db.rename_feed(feed_id, title).await
    }

    pub async fn move_feed(&self, feed_id: i64, folder: Option<i64>) -> Result<()> {
        self.db.move_feed_to_folder(feed_id, folder).await
    }

    pub async fn reorder_feed(&self, feed_id: i64, new_index: usize) -> Result<()> {
        self.db.reorder_feed(feed_id, new_index).await
    }

    pub async fn get_feed_metadata(&self, feed_id: i64) -> Result<FeedMetadata> {
        self.db.get_feed_metadata(feed_id).await
    }

    /// Operator override: clear a feed's failure/backoff state.
    pub async fn clear_feed_failures(&self, feed_id: i64) -> Result<()> {
        self.scheduler.clear_feed_failures(feed_id).await
    }

    pub async fn create_folder(&self, name: &str, parent: Option<i64>) -> Result<i64> {
        self.db.create_folder(name, parent).await
    }

    pub async fn get_folders(&self) -> Result<Vec<Folder>> {
        self.db.get_folders().await
    }

    pub async fn rename_folder(&self, folder_id: i64, name: &str) -> Result<()> {
        self.db.rename_folder(folder_id, name).await
    }

    pub async fn delete_folder(&self, folder_id: i64) -> Result<()> {
        self.db.delete_folder(folder_id).await
    }

    pub async fn move_folder(&self, folder_id: i64, parent: Option<i64>) -> Result<()> {
        self.db.move_folder(folder_id, parent).await
    }

    pub async fn reorder_folder(&self, folder_id: i64, new_index: usize) -> Result<()> {
        self.db.reorder_folder(folder_id, new_index).await
    }

    // ========================================================================
    // Articles
    // ========================================================================

    pub async fn get_articles(&self, feed_id: i64, limit: Option<i64>) -> Result<Vec<Article>> {
        self.db.get_articles_for_feed(feed_id, limit).await
    }

    pub async fn get_article(&self, article_id: i64) -> Result<Option<Article>> {
        self.db.get_article_by_id(article_id).await
    }

    pub async fn mark_read(&self, article_id: i64) -> Result<bool> {
        self.db.mark_article_read(article_id).await
    }

    /// Reset a failed article to `new` so the next summarize pass retries it.
    pub async fn retry_article(&self, article_id: i64) -> Result<bool> {
        self.db.retry_article(article_id).await
    }

    pub async fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<SearchHit>> {
        self.db.search(query, filters).await
    }

    pub async fn suggestions(&self, prefix: &str) -> Result<Vec<String>> {
        self.db.search_suggestions(prefix, 10).await
    }

    // ========================================================================
    // Archive & Retention
    // ========================================================================

    pub async fn archive_article(&self, article_id: i64) -> Result<bool> {
        self.db.archive_article(article_id, "manual").await
    }

    pub async fn restore_article(&self, article_id: i64) -> Result<bool> {
        self.db.restore_article(article_id).await
    }

    pub async fn get_archived(&self, limit: Option<i64>) -> Result<Vec<ArchivedArticle>> {
        self.db.get_archived(limit).await
    }

    pub async fn search_archived(&self, query: &str) -> Result<Vec<ArchivedArticle>> {
        self.db.search_archived(query).await
    }

    /// Replace the retention windows at runtime.
    pub fn configure_retention(&self, retention: RetentionConfig) {
        *self.retention.lock().expect("retention lock poisoned") = retention;
        tracing::info!(
            active_days = retention.active_days,
            archive_days = retention.archive_days,
            "Retention configuration updated"
        );
    }

    pub fn retention(&self) -> RetentionConfig {
        *self.retention.lock().expect("retention lock poisoned")
    }

    // ========================================================================
    // Duplicates
    // ========================================================================

    pub async fn find_duplicates(&self, threshold: f64) -> Result<Vec<DuplicateGroup>> {
        self.db.find_duplicates(threshold).await
    }

    /// Manual merge of one group.
    pub async fn merge_duplicates(&self, group: &DuplicateGroup) -> Result<()> {
        self.db.merge_group(group.primary_id, &group.duplicate_ids).await
    }

    /// Merge every group whose similarity clears the high-confidence bar.
    /// Returns how many groups were merged.
    pub async fn auto_merge_duplicates(&self) -> Result<usize> {
        let groups = self.db.find_duplicates(AUTO_MERGE_THRESHOLD).await?;
        let mut merged = 0;
        for group in groups {
            if group.similarity >= AUTO_MERGE_THRESHOLD {
                self.db.merge_group(group.primary_id, &group.duplicate_ids).await?;
                merged += 1;
            }
        }
        Ok(merged)
    }

    // ========================================================================
    // Passes (driven by the orchestrator, or forced by the operator)
    // ========================================================================

    /// Poll every feed once and fold the per-feed reports into totals.
    pub async fn run_fetch_pass(&self) -> FetchPassSummary {
        let reports = self.scheduler.run_once().await;
        let mut summary = FetchPassSummary::default();
        for report in reports {
            match report.outcome {
                FetchOutcome::Fetched { new_articles } => {
                    summary.fetched += 1;
                    summary.new_articles += new_articles;
                }
                FetchOutcome::NotModified => summary.not_modified += 1,
                FetchOutcome::Skipped => summary.skipped += 1,
                FetchOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    /// Claim a batch of `new` articles, push them through the worker pool,
    /// and write each outcome back. Completion order is first-done-first.
    pub async fn run_summarize_pass(&self) -> Result<SummarizePassSummary> {
        let claimed = self.db.claim_for_summary(self.summarize_batch).await?;
        if claimed.is_empty() {
            return Ok(SummarizePassSummary::default());
        }

        let submitted = claimed.len();
        let tasks = claimed.into_iter().map(|article| {
            let db = self.db.clone();
            let pool = &self.pool;
            async move {
                let request = SummaryRequest {
                    article_id: article.id,
                    title: article.title.clone(),
                    // Some feeds publish bare headlines; the title is then
                    // the only material there is.
                    content: article.content.clone().unwrap_or_else(|| article.title.clone()),
                };
                match pool.submit(request).await {
                    Ok(summary) => {
                        if let Err(e) = db.complete_summary(article.id, &summary).await {
                            tracing::error!(article_id = article.id, error = %e, "Failed to store summary");
                            return false;
                        }
                        true
                    }
                    Err(e) => {
                        if matches!(e, PoolError::QueueFull) {
                            tracing::warn!(
                                article_id = article.id,
                                "Summary queue full, marking failed for retry"
                            );
                        } else {
                            tracing::warn!(article_id = article.id, error = %e, "Summarization failed");
                        }
                        if let Err(db_err) = db.fail_summary(article.id).await {
                            tracing::error!(article_id = article.id, error = %db_err, "Failed to record failure");
                        }
                        false
                    }
                }
            }
        });

        let outcomes = futures::future::join_all(tasks).await;
        let summarized = outcomes.iter().filter(|ok| **ok).count();
        Ok(SummarizePassSummary {
            submitted,
            summarized,
            failed: submitted - summarized,
        })
    }

    /// Archive aged read-or-failed articles and purge old archives, per the
    /// configured retention windows.
    pub async fn run_retention_sweep(&self) -> Result<RetentionSummary> {
        let retention = self.retention();
        let now = chrono::Utc::now().timestamp();

        let active_cutoff = now - i64::from(retention.active_days) * 86_400;
        let archived = self
            .db
            .sweep_active(active_cutoff, retention.sweep_batch, "retention")
            .await?;

        let archive_cutoff = now - i64::from(retention.archive_days) * 86_400;
        let purged = self.db.purge_archived(archive_cutoff).await?;

        Ok(RetentionSummary { archived, purged })
    }

    // ========================================================================
    // Maintenance & Health
    // ========================================================================

    /// Compaction plus orphan cleanup, for the operator or a schedule.
    pub async fn run_maintenance(&self) -> Result<()> {
        self.db.cleanup_orphans().await?;
        self.db.compact().await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        Ok(ServiceStats {
            store: self.db.stats().await?,
            scheduler: self.scheduler.stats().await?,
            pool: self.pool.stats(),
            endpoints: self.balancer.snapshot(),
        })
    }

    /// Drain the worker pool and stop. The store needs no teardown beyond
    /// dropping the handle.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
