//! WatchCoordinator - ties a broadcaster's subscriber count to one watch source
//!
//! A single spawned loop consumes the broadcaster's lifecycle signals and is
//! the only place a [`WatchSource`] is created, started, stopped or dropped.
//! Subscribers never touch the source directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fanwatch_core::{ChangeEvent, EventCursor, MonitorOptions, PathSet, WatchError};
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, LifecycleSignal, LifecycleSignals, WeakBroadcaster};
use crate::source::{BatchCallback, WatchBackend, WatchRequest, WatchSource};

/// Whether the platform resource currently exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// No subscribers, no resource
    Idle,
    /// Resource created and started
    Active,
    /// The last activation attempt failed; retried on the next 0 -> 1 transition
    Failed,
}

/// Invoked after the source was released on a 1 -> 0 transition
pub type IdleHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Counters {
    activations: AtomicU64,
    failed_activations: AtomicU64,
    last_sequence_id: AtomicU64,
}

/// Coordinator statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub status: SourceStatus,
    pub activations: u64,
    pub failed_activations: u64,
    pub last_sequence_id: u64,
}

pub struct WatchCoordinator {
    paths: PathSet,
    status: watch::Receiver<SourceStatus>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl WatchCoordinator {
    /// Start observing `broadcaster`'s lifecycle signals on the current tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// If the broadcaster's lifecycle signals are already observed.
    pub fn spawn(
        broadcaster: &Broadcaster,
        backend: Arc<dyn WatchBackend>,
        paths: PathSet,
        options: MonitorOptions,
        on_idle: Option<IdleHook>,
    ) -> Result<Self, WatchError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::NoRuntime)?;

        let Some(signals) = broadcaster.lifecycle_signals() else {
            panic!(
                "lifecycle signals for {} already have an observer",
                paths.key()
            );
        };

        let (status_tx, status) = watch::channel(SourceStatus::Idle);
        let counters = Arc::new(Counters::default());

        let worker = CoordinatorLoop {
            paths: paths.clone(),
            options,
            backend,
            broadcaster: broadcaster.downgrade(),
            source: None,
            status: status_tx,
            counters: Arc::clone(&counters),
            on_idle,
        };
        let task = runtime.spawn(worker.run(signals));

        Ok(Self {
            paths,
            status,
            counters,
            task,
        })
    }

    pub fn paths(&self) -> &PathSet {
        &self.paths
    }

    pub fn status(&self) -> SourceStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<SourceStatus> {
        self.status.clone()
    }

    /// Wait until the coordinator reports `status`. Returns false if the
    /// coordinator exited first.
    pub async fn wait_for(&self, status: SourceStatus) -> bool {
        self.status
            .clone()
            .wait_for(|current| *current == status)
            .await
            .is_ok()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            status: self.status(),
            activations: self.counters.activations.load(Ordering::Relaxed),
            failed_activations: self.counters.failed_activations.load(Ordering::Relaxed),
            last_sequence_id: self.counters.last_sequence_id.load(Ordering::Relaxed),
        }
    }

    /// The loop ends on its own once the broadcaster and every subscription
    /// are gone.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct CoordinatorLoop {
    paths: PathSet,
    options: MonitorOptions,
    backend: Arc<dyn WatchBackend>,
    broadcaster: WeakBroadcaster,
    source: Option<WatchSource>,
    status: watch::Sender<SourceStatus>,
    counters: Arc<Counters>,
    on_idle: Option<IdleHook>,
}

impl CoordinatorLoop {
    async fn run(mut self, mut signals: LifecycleSignals) {
        debug!("Coordinator for {} started", self.paths.key());

        while let Some(signal) = signals.recv().await {
            match signal {
                LifecycleSignal::FirstSubscriberAdded => self.on_first_subscriber().await,
                LifecycleSignal::LastSubscriberRemoved => self.on_last_subscriber().await,
            }
        }

        if let Some(source) = self.source.take() {
            release(source).await;
        }
        debug!("Coordinator for {} exited", self.paths.key());
    }

    async fn on_first_subscriber(&mut self) {
        assert!(
            self.source.is_none(),
            "activation requested for {} while a watch source is held",
            self.paths.key()
        );

        // Signals are queued; the subscriber that caused this one may already
        // be gone, in which case its LastSubscriberRemoved is next in line.
        let still_wanted = self
            .broadcaster
            .upgrade()
            .map(|broadcaster| !broadcaster.is_empty())
            .unwrap_or(false);
        if !still_wanted {
            debug!("Skipping activation for {}: no subscribers left", self.paths.key());
            return;
        }

        // Creating and starting a platform watch may walk the whole tree.
        let backend = Arc::clone(&self.backend);
        let request = WatchRequest {
            paths: self.paths.clone(),
            start_cursor: self.resume_cursor(),
            latency: self.options.latency,
        };
        let on_batch = self.batch_callback();
        let activation =
            task::spawn_blocking(move || activate(backend.as_ref(), request, on_batch)).await;

        match activation {
            Ok(Ok(source)) => {
                self.counters.activations.fetch_add(1, Ordering::Relaxed);
                info!("Watching {}", self.paths.key());
                self.source = Some(source);
                self.status.send_replace(SourceStatus::Active);
            }
            Ok(Err(e)) => {
                self.counters.failed_activations.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to activate watch for {}: {}", self.paths.key(), e);
                self.status.send_replace(SourceStatus::Failed);
            }
            Err(e) => {
                self.counters.failed_activations.fetch_add(1, Ordering::Relaxed);
                warn!("Activation task for {} did not complete: {}", self.paths.key(), e);
                self.status.send_replace(SourceStatus::Failed);
            }
        }
    }

    async fn on_last_subscriber(&mut self) {
        if let Some(source) = self.source.take() {
            release(source).await;
            info!("Stopped watching {}", self.paths.key());
        }
        self.status.send_replace(SourceStatus::Idle);

        if let Some(on_idle) = &self.on_idle {
            on_idle();
        }
    }

    /// Numbering resumes after the last id a previous source delivered, so
    /// ids stay monotonic across activations of one path-set.
    fn resume_cursor(&self) -> EventCursor {
        let last_seen = self.counters.last_sequence_id.load(Ordering::Relaxed);
        if last_seen > self.options.start_cursor.floor() {
            EventCursor::after_event(last_seen)
        } else {
            self.options.start_cursor
        }
    }

    fn batch_callback(&self) -> BatchCallback {
        let target = self.broadcaster.clone();
        let counters = Arc::clone(&self.counters);
        Arc::new(move |batch: Vec<ChangeEvent>| {
            if let Some(last) = batch.last() {
                counters
                    .last_sequence_id
                    .fetch_max(last.sequence_id, Ordering::Relaxed);
            }
            if let Some(broadcaster) = target.upgrade() {
                broadcaster.yield_batch(&batch);
            }
        })
    }
}

/// Runs on the blocking pool. A source that fails to start is dropped here,
/// which releases it.
fn activate(
    backend: &dyn WatchBackend,
    request: WatchRequest,
    on_batch: BatchCallback,
) -> Result<WatchSource, WatchError> {
    let mut source = WatchSource::create(backend, request, on_batch)?;
    source.start()?;
    Ok(source)
}

/// Stop a source on the blocking pool and wait for it, so a following
/// activation never overlaps the release.
async fn release(mut source: WatchSource) {
    if let Err(e) = task::spawn_blocking(move || source.stop()).await {
        warn!("Releasing watch source did not complete: {}", e);
    }
}
