use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::FetchConfig;
use crate::fetch::parser::parse_feed;
use crate::storage::{Database, Feed, FeedMetadata};

/// Response bodies above this size are rejected while streaming.
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching a single feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Database operation failed during article storage
    #[error("Database error: {0}")]
    Database(String),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
}

impl FetchError {
    /// Transient errors are worth another attempt within the same run;
    /// a malformed payload or a storage failure is not.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_)
                | FetchError::Timeout
                | FetchError::HttpStatus(_)
        )
    }
}

/// Per-feed outcome of one scheduler run.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Fresh payload fetched; `new_articles` rows were genuinely new.
    Fetched { new_articles: usize },
    /// Conditional request answered 304: success with zero new articles.
    NotModified,
    /// The feed sat inside an active backoff window and was not attempted.
    Skipped,
    /// All attempts exhausted; the feed entered (or extended) backoff.
    Failed { error: FetchError, failures: i64 },
}

/// One feed's report, correlated by id.
#[derive(Debug)]
pub struct FetchReport {
    pub feed_id: i64,
    pub outcome: FetchOutcome,
}

/// Operator-facing scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub feeds_tracked: i64,
    pub feeds_backed_off: i64,
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    /// High-water mark of concurrently running fetches since startup.
    pub max_in_flight_observed: usize,
}

/// What a successful attempt produced.
enum Payload {
    NotModified,
    Fetched {
        items: Vec<crate::storage::NewItem>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Concurrency-bounded, retrying, backoff-aware feed poller.
///
/// A counting admission gate caps simultaneous fetches at the configured
/// ceiling; a fetch starts the instant a permit frees up. Permits are held
/// by owned guards, so every exit path — success, error, panic — releases
/// them. Feeds inside a backoff window are skipped without consuming one.
pub struct FetchScheduler {
    db: Database,
    client: reqwest::Client,
    config: FetchConfig,
    gate: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FetchScheduler {
    pub fn new(db: Database, client: reqwest::Client, config: FetchConfig) -> Self {
        let gate = Arc::new(Semaphore::new(config.concurrency));
        Self {
            db,
            client,
            config,
            gate,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Poll every tracked feed once. Per-feed outcomes are independent: one
    /// feed exhausting its attempts never delays or fails the batch, and
    /// results arrive in completion order.
    pub async fn run_once(&self) -> Vec<FetchReport> {
        let feeds = match self.db.get_feeds().await {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load feeds for fetch run");
                return Vec::new();
            }
        };
        if feeds.is_empty() {
            return Vec::new();
        }

        let total = feeds.len();
        let reports: Vec<FetchReport> = stream::iter(feeds)
            .map(|feed| self.poll_feed(feed))
            .buffer_unordered(total)
            .collect()
            .await;

        let fetched = reports
            .iter()
            .filter(|r| matches!(r.outcome, FetchOutcome::Fetched { .. } | FetchOutcome::NotModified))
            .count();
        tracing::info!(total, fetched, "Fetch run complete");
        reports
    }

    /// Operator override: forget a feed's failure state so the next run
    /// attempts it immediately.
    pub async fn clear_feed_failures(&self, feed_id: i64) -> anyhow::Result<()> {
        self.db.clear_feed_failures(feed_id).await
    }

    pub async fn stats(&self) -> anyhow::Result<SchedulerStats> {
        let feeds_tracked = self.db.get_feeds().await?.len() as i64;
        let feeds_backed_off = self.db.backed_off_count().await?;
        Ok(SchedulerStats {
            feeds_tracked,
            feeds_backed_off,
            concurrency: self.config.concurrency,
            request_timeout_secs: self.config.request_timeout_secs,
            max_in_flight_observed: self.max_in_flight.load(Ordering::Relaxed),
        })
    }

    /// Fetch one feed end to end: backoff check, admission gate, attempts,
    /// persistence. Never returns an error — failures become outcomes.
    async fn poll_feed(&self, feed: Feed) -> FetchReport {
        let feed_id = feed.id;
        let meta = match self.db.get_feed_metadata(feed_id).await {
            Ok(meta) => meta,
            Err(e) => {
                return FetchReport {
                    feed_id,
                    outcome: FetchOutcome::Failed {
                        error: FetchError::Database(e.to_string()),
                        failures: 0,
                    },
                }
            }
        };

        // Backoff windows are honored before the gate: a skipped feed must
        // not consume a permit.
        let now = chrono::Utc::now().timestamp();
        if meta.next_retry_at.is_some_and(|t| t > now) {
            tracing::debug!(feed_id, url = %feed.url, "Feed in backoff window, skipped");
            return FetchReport {
                feed_id,
                outcome: FetchOutcome::Skipped,
            };
        }

        let _permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .expect("admission gate is never closed");
        let _gauge = InFlightGauge::enter(&self.in_flight, &self.max_in_flight);

        match self.fetch_with_retries(&feed, &meta).await {
            Ok(Payload::NotModified) => {
                if let Err(e) = self.db.record_fetch_success(feed_id, 0, None, None).await {
                    tracing::warn!(feed_id, error = %e, "Failed to persist fetch metadata");
                }
                FetchReport {
                    feed_id,
                    outcome: FetchOutcome::NotModified,
                }
            }
            Ok(Payload::Fetched {
                items,
                etag,
                last_modified,
            }) => match self.db.upsert_new(feed_id, &items).await {
                Ok(new_articles) => {
                    if let Err(e) = self
                        .db
                        .record_fetch_success(
                            feed_id,
                            items.len(),
                            etag.as_deref(),
                            last_modified.as_deref(),
                        )
                        .await
                    {
                        tracing::warn!(feed_id, error = %e, "Failed to persist fetch metadata");
                    }
                    FetchReport {
                        feed_id,
                        outcome: FetchOutcome::Fetched {
                            new_articles: new_articles.len(),
                        },
                    }
                }
                Err(e) => {
                    self.record_failure(feed_id, FetchError::Database(e.to_string()))
                        .await
                }
            },
            Err(error) => self.record_failure(feed_id, error).await,
        }
    }

    async fn record_failure(&self, feed_id: i64, error: FetchError) -> FetchReport {
        let failures = match self.db.record_fetch_failure(feed_id).await {
            Ok(failures) => failures,
            Err(e) => {
                tracing::warn!(feed_id, error = %e, "Failed to persist fetch failure");
                0
            }
        };
        tracing::warn!(feed_id, failures, error = %error, "Feed fetch failed");
        FetchReport {
            feed_id,
            outcome: FetchOutcome::Failed { error, failures },
        }
    }

    /// Up to `max_attempts` physical attempts with linearly increasing delay
    /// (attempt × base delay). Only transient errors earn another attempt.
    async fn fetch_with_retries(
        &self,
        feed: &Feed,
        meta: &FeedMetadata,
    ) -> Result<Payload, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_fetch(feed, meta).await {
                Ok(payload) => return Ok(payload),
                Err(e) if attempt < self.config.max_attempts && e.is_transient() => {
                    let delay = Duration::from_secs(
                        u64::from(attempt) * self.config.retry_base_delay_secs,
                    );
                    tracing::debug!(
                        feed_id = feed.id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One physical attempt: conditional GET, status triage, size-capped
    /// body read, parse.
    async fn attempt_fetch(
        &self,
        feed: &Feed,
        meta: &FeedMetadata,
    ) -> Result<Payload, FetchError> {
        let mut request = self.client.get(&feed.url);
        if let Some(etag) = &meta.etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &meta.last_modified {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = tokio::time::timeout(
            Duration::from_secs(self.config.request_timeout_secs),
            request.send(),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(FetchError::Network)?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(Payload::NotModified);
        }
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let header_str = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header_str(reqwest::header::ETAG);
        let last_modified = header_str(reqwest::header::LAST_MODIFIED);

        let bytes = read_limited_bytes(response, MAX_FEED_SIZE).await?;

        let outcome = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
        if outcome.skipped > 0 {
            tracing::warn!(
                feed = %feed.url,
                skipped = outcome.skipped,
                "Entries without links skipped"
            );
        }

        Ok(Payload::Fetched {
            items: outcome.items,
            etag,
            last_modified,
        })
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }
}

/// Gauge guard: counts an active fetch in and out, tracking the high-water
/// mark. Drop-based so a panicking task still decrements.
struct InFlightGauge {
    in_flight: Arc<AtomicUsize>,
}

impl InFlightGauge {
    fn enter(in_flight: &Arc<AtomicUsize>, max: &Arc<AtomicUsize>) -> Self {
        let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(current, Ordering::SeqCst);
        Self {
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for InFlightGauge {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
