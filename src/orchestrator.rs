use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::OrchestratorConfig;
use crate::service::Service;

/// Thin control loop over the service: fetch, then summarize, then the
/// retention sweep when due, on a fixed cadence.
///
/// The loop is self-rescheduling — the pause starts only after the current
/// cycle finishes, so a slow cycle (large backlog, slow inference) can never
/// overlap the next one against the same store.
pub struct Orchestrator {
    service: Arc<Service>,
    config: OrchestratorConfig,
    sweep_every_cycles: u32,
}

impl Orchestrator {
    pub fn new(service: Arc<Service>, config: OrchestratorConfig) -> Self {
        let sweep_every_cycles = service.retention().sweep_every_cycles;
        Self {
            service,
            config,
            sweep_every_cycles,
        }
    }

    /// Run cycles until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.cycle_interval_secs);
        let mut cycle: u64 = 0;

        loop {
            cycle += 1;
            self.run_cycle(cycle).await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    tracing::info!("Orchestrator stopping");
                    break;
                }
            }
        }
    }

    /// One fetch → summarize → retention cycle with aggregate logging.
    /// Individual transient errors stay at warn inside the passes; the
    /// cycle reports totals.
    pub async fn run_cycle(&self, cycle: u64) {
        let started = std::time::Instant::now();

        let fetch = self.service.run_fetch_pass().await;

        let summarize = match self.service.run_summarize_pass().await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(cycle, error = %e, "Summarize pass failed");
                Default::default()
            }
        };

        let retention = if self.sweep_every_cycles > 0
            && cycle % u64::from(self.sweep_every_cycles) == 0
        {
            match self.service.run_retention_sweep().await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    tracing::error!(cycle, error = %e, "Retention sweep failed");
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            cycle,
            elapsed_ms = started.elapsed().as_millis() as u64,
            feeds_fetched = fetch.fetched,
            feeds_not_modified = fetch.not_modified,
            feeds_skipped = fetch.skipped,
            feeds_failed = fetch.failed,
            new_articles = fetch.new_articles,
            summarized = summarize.summarized,
            summaries_failed = summarize.failed,
            archived = retention.as_ref().map(|r| r.archived).unwrap_or(0),
            purged = retention.as_ref().map(|r| r.purged).unwrap_or(0),
            "Cycle complete"
        );
    }
}
