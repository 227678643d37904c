// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Worker-pool persister: drain a [`MessageSource`] into a [`Sink`] in batches.
//!
//! # Architecture
//!
//! ```text
//!                        ┌────────────── supervisor ──────────────┐
//!  MessageSource.run()   │  JoinSet of workers (restart on panic) │
//!         │              └────────────────────────────────────────┘
//!         ▼                    │            │            │
//!    next() ◄── RateLimiter ── worker 0   worker 1 ... worker N-1
//!                              │ own batches per partition
//!                              ▼
//!                        Sink.write ──► ack / nack
//! ```
//!
//! # Lifecycle
//!
//! `run()` spawns the source and the supervisor and returns. `stop()` cancels,
//! lets every worker flush what it holds, waits for the source to collect the
//! resulting acks, then returns. `check()` is the health predicate.
//!
//! # Example
//!
//! ```rust,no_run
//! use event_persister::{BusClient, BusConfig, JsonDecoder, MemoryBus, MemorySink, Persister, PersisterConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = BusClient::new(Arc::new(MemoryBus::new()), BusConfig::default());
//! client.topic("usage").await?;
//!
//! let config = PersisterConfig::default();
//! let puller = client.create_puller("usage-persister", "usage", config.puller_config()).await?;
//! let sink = Arc::new(MemorySink::<serde_json::Value>::new("usage"));
//!
//! let persister = Persister::new("usage", config, puller, sink, Arc::new(JsonDecoder::new()));
//! persister.run(&CancellationToken::new())?;
//! assert!(persister.check().is_ok());
//! persister.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod codes;
pub mod rate_limiter;
pub mod sink;
mod worker;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::MessageSource;
use crate::config::PersisterConfig;
use crate::health::HealthCheck;
use crate::metrics;

pub use codec::{CodecError, Decoder, JsonDecoder, RawDecoder};
pub use codes::HandledCode;
pub use rate_limiter::RateLimiter;
pub use sink::{FlushPolicy, Sink, SinkError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersisterError {
    #[error("persister already started")]
    AlreadyStarted,
    #[error("persister not started")]
    NotStarted,
    #[error("persister stopped")]
    Stopped,
    #[error("worker pool exited unexpectedly: {0}")]
    PoolExited(String),
    #[error("{consecutive} consecutive flush failures")]
    FlushFailing { consecutive: u32 },
    #[error("workers restarted {restarts} times after panics")]
    TooManyRestarts { restarts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersisterState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for PersisterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Counters behind `check()`, shared by workers and the supervisor.
#[derive(Debug, Default)]
pub(crate) struct PoolHealth {
    consecutive_flush_failures: AtomicU32,
    restarts: AtomicU32,
    exited: Mutex<Option<String>>,
}

impl PoolHealth {
    pub(crate) fn record_flush_success(&self) {
        self.consecutive_flush_failures.store(0, Ordering::Relaxed);
    }

    /// Returns the new consecutive failure count.
    pub(crate) fn record_flush_failure(&self) -> u32 {
        self.consecutive_flush_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_restart(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn mark_exited(&self, reason: impl Into<String>) {
        self.exited.lock().get_or_insert_with(|| reason.into());
    }
}

pub(crate) struct Inner<T> {
    pub(crate) name: String,
    pub(crate) config: PersisterConfig,
    pub(crate) source: Arc<dyn MessageSource>,
    pub(crate) sink: Arc<dyn Sink<T>>,
    pub(crate) decoder: Arc<dyn Decoder<T>>,
    pub(crate) limiter: RateLimiter,
    pub(crate) health: PoolHealth,
    pub(crate) cancel: CancellationToken,
}

pub struct Persister<T> {
    inner: Arc<Inner<T>>,
    state: watch::Sender<PersisterState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Persister<T> {
    pub fn new(
        name: impl Into<String>,
        config: PersisterConfig,
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn Sink<T>>,
        decoder: Arc<dyn Decoder<T>>,
    ) -> Self {
        let limiter = RateLimiter::new(config.max_mps);
        let (state, _) = watch::channel(PersisterState::Created);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                source,
                sink,
                decoder,
                limiter,
                health: PoolHealth::default(),
                cancel: CancellationToken::new(),
            }),
            state,
            supervisor: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> PersisterState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<PersisterState> {
        self.state.subscribe()
    }

    /// Start the source and the worker pool, then return.
    ///
    /// Cancelling `parent` has the same effect on the pool as [`stop`](Self::stop),
    /// but only `stop` waits for the final flushes.
    #[tracing::instrument(skip(self, parent), fields(persister = %self.inner.name))]
    pub fn run(&self, parent: &CancellationToken) -> Result<(), PersisterError> {
        let mut supervisor = self.supervisor.lock();
        if self.state() != PersisterState::Created {
            return Err(PersisterError::AlreadyStarted);
        }

        let inner = Arc::clone(&self.inner);
        info!(
            workers = inner.config.num_workers,
            max_mps = inner.config.max_mps,
            flush_size = inner.config.flush_size,
            flush_interval_ms = inner.config.flush_interval_ms,
            sink = inner.sink.name(),
            "Starting persister"
        );

        let parent = parent.clone();
        let own = inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => own.cancel(),
                _ = own.cancelled() => {}
            }
        });

        let source = Arc::clone(&inner.source);
        let source_cancel = inner.cancel.clone();
        let source_task = tokio::spawn(async move { source.run(source_cancel).await });

        *supervisor = Some(tokio::spawn(supervise(inner, source_task)));
        let _ = self.state.send(PersisterState::Running);
        Ok(())
    }

    /// Stop pulling, flush what workers hold, and wait for settlement.
    ///
    /// Only the first call does anything; later calls return at once.
    #[tracing::instrument(skip(self), fields(persister = %self.inner.name))]
    pub async fn stop(&self) {
        let Some(handle) = self.supervisor.lock().take() else {
            return;
        };
        info!("Stopping persister");
        let _ = self.state.send(PersisterState::Stopping);
        self.inner.cancel.cancel();

        if let Err(e) = handle.await {
            error!(error = %e, "Persister supervisor failed");
        }
        let _ = self.state.send(PersisterState::Stopped);
        metrics::set_component_healthy(&self.inner.name, false);
        info!("Persister stopped");
    }

    /// Health predicate for readiness probes.
    pub fn check(&self) -> Result<(), PersisterError> {
        match self.state() {
            PersisterState::Created => return Err(PersisterError::NotStarted),
            PersisterState::Stopping | PersisterState::Stopped => return Err(PersisterError::Stopped),
            PersisterState::Running => {}
        }
        if self.inner.cancel.is_cancelled() {
            return Err(PersisterError::Stopped);
        }

        let health = &self.inner.health;
        if let Some(reason) = health.exited.lock().clone() {
            return Err(PersisterError::PoolExited(reason));
        }
        let consecutive = health.consecutive_flush_failures.load(Ordering::Relaxed);
        let threshold = self.inner.config.unhealthy_flush_failures;
        if threshold > 0 && consecutive >= threshold {
            return Err(PersisterError::FlushFailing { consecutive });
        }
        let restarts = health.restarts.load(Ordering::Relaxed);
        if restarts > self.inner.config.max_worker_restarts {
            return Err(PersisterError::TooManyRestarts { restarts });
        }
        Ok(())
    }

    /// Worker panics survived so far.
    pub fn restarts(&self) -> u32 {
        self.inner.health.restarts.load(Ordering::Relaxed)
    }
}

impl<T: Send + Sync + 'static> HealthCheck for Persister<T> {
    fn component(&self) -> &str {
        self.name()
    }

    fn check(&self) -> Result<(), String> {
        Persister::check(self).map_err(|e| e.to_string())
    }
}

/// Start workers (staggered), restart panicked ones, and notice an early exit.
async fn supervise<T: Send + Sync + 'static>(
    inner: Arc<Inner<T>>,
    mut source_task: JoinHandle<Result<(), crate::bus::BusError>>,
) {
    let name = inner.name.clone();
    let cancel = inner.cancel.clone();
    let stagger = inner.config.worker_startup_interval();
    let mut workers = JoinSet::new();
    let mut next_id = 0usize;

    for i in 0..inner.config.num_workers.max(1) {
        if i > 0 && !stagger.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(stagger) => {}
            }
        }
        workers.spawn(worker::run(Arc::clone(&inner), next_id));
        next_id += 1;
    }
    metrics::set_active_workers(&name, workers.len());

    let mut source_done = false;
    while !workers.is_empty() {
        tokio::select! {
            joined = workers.join_next() => {
                match joined {
                    Some(Ok(())) => {
                        if !cancel.is_cancelled() {
                            warn!(persister = %name, "Worker exited while running, message source closed");
                            inner.health.mark_exited("message source closed");
                        }
                    }
                    Some(Err(e)) if e.is_panic() => {
                        let restarts = inner.health.record_restart();
                        metrics::record_worker_restart(&name);
                        error!(persister = %name, restarts, error = %e, "Worker panicked");
                        if !cancel.is_cancelled() {
                            workers.spawn(worker::run(Arc::clone(&inner), next_id));
                            next_id += 1;
                        }
                    }
                    Some(Err(e)) => debug!(persister = %name, error = %e, "Worker task cancelled"),
                    None => break,
                }
                metrics::set_active_workers(&name, workers.len());
            }
            result = &mut source_task, if !source_done => {
                source_done = true;
                if !cancel.is_cancelled() {
                    let reason = match result {
                        Ok(Ok(())) => "message source stopped".to_string(),
                        Ok(Err(e)) => format!("message source failed: {e}"),
                        Err(e) => format!("message source task failed: {e}"),
                    };
                    error!(persister = %name, reason = %reason, "Message source ended unexpectedly");
                    inner.health.mark_exited(reason);
                }
            }
        }
    }

    if !source_done {
        match source_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(persister = %name, error = %e, "Message source ended with error"),
            Err(e) => error!(persister = %name, error = %e, "Message source task failed"),
        }
    }
    debug!(persister = %name, "Supervisor exited");
}
