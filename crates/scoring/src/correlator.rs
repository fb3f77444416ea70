//! Asynchronous scoring with per-submission correlation.
//!
//! Requests go into a bounded queue drained by a fixed pool of worker tasks.
//! Every request carries a [`CorrelationKey`] that is unique per submission
//! event; the pending table maps that key to the challenge and player the
//! result belongs to. A result is routed by removing its key from the table,
//! so each request is answered at most once and never on behalf of another
//! request, even when two submissions share the same audio url.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{ChallengeId, PlayerId};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch, Mutex,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{ScoringClient, ScoringError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(Uuid);

impl CorrelationKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct ScoringRequest {
    pub key: CorrelationKey,
    pub challenge_id: ChallengeId,
    pub player_id: PlayerId,
    pub audio_url: String,
    pub song_id: String,
}

/// Receives the terminal outcome of each scoring request.
#[async_trait]
pub trait ScoreSink: Send + Sync {
    async fn score_ready(&self, challenge_id: &ChallengeId, player_id: &PlayerId, score: f64);

    async fn score_failed(
        &self,
        _key: CorrelationKey,
        _challenge_id: &ChallengeId,
        _player_id: &PlayerId,
        _error: &ScoringError,
    ) {
    }
}

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub call_timeout: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 100,
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub in_flight: usize,
    pub workers: usize,
}

struct ScoringJob {
    key: CorrelationKey,
    audio_url: String,
    song_id: String,
}

struct PendingScoring {
    challenge_id: ChallengeId,
    player_id: PlayerId,
    enqueued_at: Instant,
}

/// Requests awaiting an outcome. `closed` flips under the same lock that
/// admits new requests, so nothing is queued after shutdown drains.
#[derive(Default)]
struct PendingTable {
    requests: HashMap<CorrelationKey, PendingScoring>,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

struct Shared {
    client: Arc<dyn ScoringClient>,
    sink: Arc<dyn ScoreSink>,
    pending: StdMutex<PendingTable>,
    call_timeout: Duration,
    counters: Counters,
}

pub struct ScoringCorrelator {
    queue_tx: mpsc::Sender<ScoringJob>,
    queue_rx: Arc<Mutex<mpsc::Receiver<ScoringJob>>>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

/// A reserved queue slot. Dropping it without dispatching frees the slot.
/// The ticket owns its slot, so it can be handed to another task.
pub struct ScoringTicket {
    permit: mpsc::OwnedPermit<ScoringJob>,
    shared: Arc<Shared>,
}

impl ScoringCorrelator {
    /// Spawns the worker pool on the current tokio runtime.
    pub fn start(
        client: Arc<dyn ScoringClient>,
        sink: Arc<dyn ScoreSink>,
        config: CorrelatorConfig,
    ) -> Self {
        let worker_count = config.worker_count.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            client,
            sink,
            pending: StdMutex::new(PendingTable::default()),
            call_timeout: config.call_timeout,
            counters: Counters::default(),
        });

        let workers = (0..worker_count)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let queue_rx = Arc::clone(&queue_rx);
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(worker_task(worker_id, shared, queue_rx, shutdown_rx))
            })
            .collect();

        info!(
            worker_count,
            queue_capacity = config.queue_capacity,
            timeout_ms = config.call_timeout.as_millis() as u64,
            "scoring correlator started"
        );

        Self {
            queue_tx,
            queue_rx,
            shared,
            shutdown,
            workers: Mutex::new(workers),
            worker_count,
        }
    }

    /// Claims a queue slot without blocking.
    pub fn reserve(&self) -> Result<ScoringTicket, ScoringError> {
        if *self.shutdown.borrow() {
            return Err(ScoringError::Closed);
        }
        match self.queue_tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(ScoringTicket {
                permit,
                shared: Arc::clone(&self.shared),
            }),
            Err(TrySendError::Full(_)) => {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("scoring queue saturated; rejecting request");
                Err(ScoringError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(ScoringError::Closed),
        }
    }

    pub async fn submit(&self, request: ScoringRequest) -> Result<(), ScoringError> {
        self.reserve()?.dispatch(request)
    }

    pub async fn stats(&self) -> ScoringStats {
        let counters = &self.shared.counters;
        ScoringStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            in_flight: self.shared.pending().requests.len(),
            workers: self.worker_count,
        }
    }

    /// Stops the workers. In-flight calls are abandoned and, like anything
    /// still queued, reported to the sink as cancelled.
    pub async fn shutdown(&self) {
        self.shared.pending().closed = true;
        self.shutdown.send_replace(true);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(err) = handle.await {
                error!(%err, "scoring worker panicked");
            }
        }

        let mut queue = self.queue_rx.lock().await;
        queue.close();
        while let Ok(job) = queue.try_recv() {
            self.shared.finish(job.key, Err(ScoringError::Cancelled)).await;
        }
        info!("scoring correlator stopped");
    }
}

impl ScoringTicket {
    /// Registers the request and queues it. Never suspends, so a request is
    /// either fully queued or not queued at all.
    pub fn dispatch(self, request: ScoringRequest) -> Result<(), ScoringError> {
        let Self { permit, shared } = self;
        {
            let mut pending = shared.pending();
            if pending.closed {
                return Err(ScoringError::Closed);
            }
            match pending.requests.entry(request.key) {
                Entry::Occupied(_) => return Err(ScoringError::DuplicateKey(request.key)),
                Entry::Vacant(slot) => {
                    slot.insert(PendingScoring {
                        challenge_id: request.challenge_id.clone(),
                        player_id: request.player_id.clone(),
                        enqueued_at: Instant::now(),
                    });
                }
            }
            permit.send(ScoringJob {
                key: request.key,
                audio_url: request.audio_url,
                song_id: request.song_id,
            });
        }
        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %request.key,
            challenge_id = %request.challenge_id,
            player_id = %request.player_id,
            "scoring request queued"
        );
        Ok(())
    }
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn score(
        &self,
        job: &ScoringJob,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<f64, ScoringError> {
        let call = tokio::time::timeout(
            self.call_timeout,
            self.client.score_audio(&job.audio_url, &job.song_id),
        );
        tokio::select! {
            result = call => match result {
                Ok(Ok(score)) if score.is_finite() => Ok(score),
                Ok(Ok(_)) => Err(ScoringError::InvalidScore),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(ScoringError::Timeout(self.call_timeout)),
            },
            _ = shutdown.changed() => Err(ScoringError::Cancelled),
        }
    }

    async fn finish(&self, key: CorrelationKey, outcome: Result<f64, ScoringError>) {
        let removed = self.pending().requests.remove(&key);
        let Some(pending) = removed else {
            warn!(%key, "scoring outcome has no pending request; dropping it");
            return;
        };
        let elapsed_ms = pending.enqueued_at.elapsed().as_millis() as u64;

        match outcome {
            Ok(score) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    %key,
                    challenge_id = %pending.challenge_id,
                    player_id = %pending.player_id,
                    score,
                    elapsed_ms,
                    "scoring completed"
                );
                self.sink
                    .score_ready(&pending.challenge_id, &pending.player_id, score)
                    .await;
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    %key,
                    challenge_id = %pending.challenge_id,
                    player_id = %pending.player_id,
                    error = %err,
                    elapsed_ms,
                    "scoring failed; challenge stays unscored for this player"
                );
                self.sink
                    .score_failed(key, &pending.challenge_id, &pending.player_id, &err)
                    .await;
            }
        }
    }
}

async fn next_job(queue_rx: &Mutex<mpsc::Receiver<ScoringJob>>) -> Option<ScoringJob> {
    queue_rx.lock().await.recv().await
}

async fn worker_task(
    worker_id: usize,
    shared: Arc<Shared>,
    queue_rx: Arc<Mutex<mpsc::Receiver<ScoringJob>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "scoring worker starting");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = next_job(&queue_rx) => match job {
                Some(job) => job,
                None => break,
            },
        };

        debug!(worker_id, key = %job.key, "scoring worker picked up request");
        let outcome = shared.score(&job, &mut shutdown).await;
        shared.finish(job.key, outcome).await;
    }
    debug!(worker_id, "scoring worker stopped");
}

#[cfg(test)]
#[path = "tests/correlator_tests.rs"]
mod tests;
