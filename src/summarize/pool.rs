use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SummarizeConfig;
use crate::summarize::ollama::{SummarizeError, Summarizer};

/// Pause before a timed-out or crashed worker slot is refilled.
const RESPAWN_DELAY: Duration = Duration::from_millis(500);

/// Supervisor housekeeping cadence: deadline checks and respawns.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// One summarization task.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub article_id: i64,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// The pending queue is at capacity; the task never entered it.
    #[error("Summary queue is full")]
    QueueFull,
    /// The task exceeded its wall-clock deadline; its worker was terminated.
    #[error("Summary task timed out")]
    Timeout,
    /// The assigned worker exited while the task was in flight.
    #[error("Summary worker crashed")]
    WorkerCrashed,
    /// The pool is draining; nothing new is accepted.
    #[error("Worker pool is shutting down")]
    ShuttingDown,
    /// The summarization call itself failed.
    #[error(transparent)]
    Summarize(#[from] SummarizeError),
}

/// Counters exposed through the health command.
#[derive(Debug, Default)]
struct PoolCounters {
    idle_workers: AtomicUsize,
    completed: AtomicU64,
    timed_out: AtomicU64,
    crashed: AtomicU64,
    respawns: AtomicU64,
    rejected_full: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub idle_workers: usize,
    pub queue_capacity: usize,
    pub completed: u64,
    pub timed_out: u64,
    pub crashed: u64,
    pub respawns: u64,
    pub rejected_full: u64,
}

/// A queued task: payload plus the caller's reply channel.
struct Job {
    corr_id: u64,
    request: SummaryRequest,
    respond_to: oneshot::Sender<Result<String, PoolError>>,
}

/// What a worker receives. The reply channel stays with the supervisor so a
/// terminated worker cannot strand its caller.
struct WorkerJob {
    corr_id: u64,
    request: SummaryRequest,
}

type Completion = (usize, u64, Result<String, SummarizeError>);

/// Fixed-size pool of supervised summarization workers.
///
/// Workers are independently spawned tasks that communicate with the
/// supervisor purely by message passing: a job channel in, a completion
/// channel out. Each in-flight task carries a correlation id and a
/// wall-clock deadline; on expiry the worker is aborted — its state after a
/// timeout is never trusted — and the slot respawns under the same id.
/// Submissions beyond the queue capacity are rejected immediately.
pub struct SummaryPool {
    queue_tx: mpsc::Sender<Job>,
    shutdown_tx: watch::Sender<bool>,
    counters: Arc<PoolCounters>,
    next_corr: AtomicU64,
    workers: usize,
    queue_capacity: usize,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SummaryPool {
    pub fn new(config: &SummarizeConfig, summarizer: Arc<Summarizer>) -> Self {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let task_timeout = Duration::from_secs(config.task_timeout_secs);

        let (queue_tx, queue_rx) = mpsc::channel::<Job>(queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(PoolCounters::default());
        counters.idle_workers.store(workers, Ordering::SeqCst);

        let supervisor = tokio::spawn(supervise(
            workers,
            task_timeout,
            summarizer,
            queue_rx,
            shutdown_rx,
            Arc::clone(&counters),
        ));

        Self {
            queue_tx,
            shutdown_tx,
            counters,
            next_corr: AtomicU64::new(1),
            workers,
            queue_capacity,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Submit one task and await its eventual result.
    ///
    /// Rejected immediately — without occupying a queue slot — when the
    /// pending queue is at capacity or the pool is shutting down.
    pub async fn submit(&self, request: SummaryRequest) -> Result<String, PoolError> {
        if *self.shutdown_tx.borrow() {
            return Err(PoolError::ShuttingDown);
        }

        let corr_id = self.next_corr.fetch_add(1, Ordering::Relaxed);
        let (respond_to, response) = oneshot::channel();
        self.queue_tx
            .try_send(Job {
                corr_id,
                request,
                respond_to,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                    PoolError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => PoolError::ShuttingDown,
            })?;

        response.await.unwrap_or(Err(PoolError::ShuttingDown))
    }

    /// Stop accepting work, reject everything queued and in flight with a
    /// shutdown error, and wait for every worker to terminate.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            idle_workers: self.counters.idle_workers.load(Ordering::SeqCst),
            queue_capacity: self.queue_capacity,
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            crashed: self.counters.crashed.load(Ordering::Relaxed),
            respawns: self.counters.respawns.load(Ordering::Relaxed),
            rejected_full: self.counters.rejected_full.load(Ordering::Relaxed),
        }
    }
}

/// One worker slot as the supervisor sees it.
struct WorkerSlot {
    id: usize,
    tx: mpsc::Sender<WorkerJob>,
    join: JoinHandle<()>,
    /// The in-flight task, if any: correlation id and deadline.
    current: Option<(u64, Instant)>,
    /// Set while the slot is dead and waiting to be refilled.
    respawn_at: Option<Instant>,
}

fn spawn_worker(
    id: usize,
    summarizer: Arc<Summarizer>,
    done_tx: mpsc::Sender<Completion>,
) -> (mpsc::Sender<WorkerJob>, JoinHandle<()>) {
    // Capacity 1: a worker ever holds at most its current assignment
    let (tx, mut rx) = mpsc::channel::<WorkerJob>(1);
    let join = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = summarizer
                .summarize(&job.request.title, &job.request.content)
                .await;
            if done_tx.send((id, job.corr_id, result)).await.is_err() {
                break;
            }
        }
    });
    (tx, join)
}

async fn supervise(
    workers: usize,
    task_timeout: Duration,
    summarizer: Arc<Summarizer>,
    mut queue_rx: mpsc::Receiver<Job>,
    mut shutdown_rx: watch::Receiver<bool>,
    counters: Arc<PoolCounters>,
) {
    // The supervisor keeps one completion sender so the channel outlives
    // any individual worker.
    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(workers.max(1) * 2);

    let mut slots: Vec<WorkerSlot> = (0..workers)
        .map(|id| {
            let (tx, join) = spawn_worker(id, Arc::clone(&summarizer), done_tx.clone());
            WorkerSlot {
                id,
                tx,
                join,
                current: None,
                respawn_at: None,
            }
        })
        .collect();

    let mut pending: HashMap<u64, oneshot::Sender<Result<String, PoolError>>> = HashMap::new();
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let has_free = slots
            .iter()
            .any(|s| s.current.is_none() && s.respawn_at.is_none());

        tokio::select! {
            // FIFO dispatch: the oldest queued job goes to the next free
            // worker. The guard stops us draining the queue while every
            // worker is busy — the channel itself is the pending queue.
            job = queue_rx.recv(), if has_free => {
                let Some(job) = job else { break };
                let slot = slots
                    .iter_mut()
                    .find(|s| s.current.is_none() && s.respawn_at.is_none())
                    .expect("guarded by has_free");
                let corr_id = job.corr_id;
                match slot.tx.try_send(WorkerJob { corr_id, request: job.request }) {
                    Ok(()) => {
                        slot.current = Some((corr_id, Instant::now() + task_timeout));
                        pending.insert(corr_id, job.respond_to);
                        counters.idle_workers.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(_) => {
                        // The worker died between the free check and the
                        // send; the tick will respawn it.
                        let _ = job.respond_to.send(Err(PoolError::WorkerCrashed));
                    }
                }
            }

            Some((worker_id, corr_id, result)) = done_rx.recv() => {
                if let Some(slot) = slots.iter_mut().find(|s| s.id == worker_id) {
                    if slot.current.map(|(c, _)| c) == Some(corr_id) {
                        slot.current = None;
                        counters.idle_workers.fetch_add(1, Ordering::SeqCst);
                    }
                }
                if let Some(respond_to) = pending.remove(&corr_id) {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    let _ = respond_to.send(result.map_err(PoolError::Summarize));
                }
            }

            _ = shutdown_rx.changed() => {
                break;
            }

            _ = tick.tick() => {
                reap_and_respawn(
                    &mut slots,
                    &mut pending,
                    &summarizer,
                    &done_tx,
                    &counters,
                );
            }
        }
    }

    // Drain: reject everything queued and in flight, then take the pool down
    queue_rx.close();
    while let Ok(job) = queue_rx.try_recv() {
        let _ = job.respond_to.send(Err(PoolError::ShuttingDown));
    }
    for (_, respond_to) in pending.drain() {
        let _ = respond_to.send(Err(PoolError::ShuttingDown));
    }
    for slot in &mut slots {
        slot.join.abort();
    }
    for slot in slots {
        let _ = slot.join.await;
    }
    tracing::info!("Summary pool shut down");
}

/// Deadline and liveness pass over every slot.
fn reap_and_respawn(
    slots: &mut [WorkerSlot],
    pending: &mut HashMap<u64, oneshot::Sender<Result<String, PoolError>>>,
    summarizer: &Arc<Summarizer>,
    done_tx: &mpsc::Sender<Completion>,
    counters: &Arc<PoolCounters>,
) {
    let now = Instant::now();
    for slot in slots.iter_mut() {
        // Expired deadline: tell the caller, terminate the worker. Whatever
        // state the worker held is gone with it.
        if let Some((corr_id, deadline)) = slot.current {
            if now >= deadline {
                if let Some(respond_to) = pending.remove(&corr_id) {
                    let _ = respond_to.send(Err(PoolError::Timeout));
                }
                slot.join.abort();
                slot.current = None;
                slot.respawn_at = Some(now + RESPAWN_DELAY);
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = slot.id, corr_id, "Task deadline expired, worker terminated");
                continue;
            }
        }

        // A worker that exited on its own: reject its task, schedule respawn
        if slot.respawn_at.is_none() && slot.join.is_finished() {
            if let Some((corr_id, _)) = slot.current.take() {
                if let Some(respond_to) = pending.remove(&corr_id) {
                    let _ = respond_to.send(Err(PoolError::WorkerCrashed));
                }
            } else {
                // Died idle; it was counted as free
                counters.idle_workers.fetch_sub(1, Ordering::SeqCst);
            }
            slot.respawn_at = Some(now + RESPAWN_DELAY);
            counters.crashed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(worker = slot.id, "Worker exited unexpectedly");
        }

        // Refill dead slots once their delay elapses — crashes never shrink
        // the pool
        if let Some(respawn_at) = slot.respawn_at {
            if now >= respawn_at {
                let (tx, join) = spawn_worker(slot.id, Arc::clone(summarizer), done_tx.clone());
                slot.tx = tx;
                slot.join = join;
                slot.respawn_at = None;
                counters.idle_workers.fetch_add(1, Ordering::SeqCst);
                counters.respawns.fetch_add(1, Ordering::Relaxed);
                tracing::info!(worker = slot.id, "Worker respawned");
            }
        }
    }
}
