//! WatchSource - RAII ownership of one platform watch resource
//!
//! A backend hands raw notification batches to a sink; the source translates
//! them into [`ChangeEvent`]s in arrival order and forwards them to a single
//! callback. Once [`WatchSource::stop`] returns, the callback is never invoked
//! again, even if the platform still has a batch in flight.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fanwatch_core::{
    BackendError, ChangeEvent, EventCursor, MonitorOptions, PathSet, RawNotification, WatchError,
};
use tracing::{debug, trace, warn};

/// Receives raw notification batches from a backend
pub type RawBatchSink = Arc<dyn Fn(Vec<RawNotification>) + Send + Sync>;

/// Receives translated batches from a [`WatchSource`]
pub type BatchCallback = Arc<dyn Fn(Vec<ChangeEvent>) + Send + Sync>;

/// Everything a backend needs to allocate a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub paths: PathSet,
    pub start_cursor: EventCursor,
    pub latency: Duration,
}

impl WatchRequest {
    pub fn new(paths: PathSet, options: &MonitorOptions) -> Self {
        Self {
            paths,
            start_cursor: options.start_cursor,
            latency: options.latency,
        }
    }
}

/// Platform watch API (FSEvents, inotify, ...)
///
/// The sink must be invoked from one serial delivery context per handle, with
/// non-decreasing sequence ids.
pub trait WatchBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn create(
        &self,
        request: &WatchRequest,
        sink: RawBatchSink,
    ) -> Result<Box<dyn WatchHandle>, WatchError>;
}

/// A live platform resource
pub trait WatchHandle: Send {
    fn start(&mut self) -> Result<(), WatchError>;

    /// Release the resource. Called exactly once by [`WatchSource`].
    fn stop(&mut self) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Stopped,
}

pub struct WatchSource {
    request: WatchRequest,
    handle: Box<dyn WatchHandle>,
    // true while batches may reach the callback
    gate: Arc<Mutex<bool>>,
    state: State,
}

impl WatchSource {
    /// Allocate the platform resource. Nothing is delivered until [`start`](Self::start).
    pub fn create(
        backend: &dyn WatchBackend,
        request: WatchRequest,
        on_batch: BatchCallback,
    ) -> Result<Self, WatchError> {
        let gate = Arc::new(Mutex::new(true));
        let sink_gate = Arc::clone(&gate);

        let sink: RawBatchSink = Arc::new(move |raw: Vec<RawNotification>| {
            if raw.is_empty() {
                return;
            }
            // Held for the whole delivery so stop() waits for an in-flight batch.
            let open = sink_gate.lock().unwrap_or_else(PoisonError::into_inner);
            if !*open {
                trace!("Dropping batch of {} delivered after stop", raw.len());
                return;
            }
            let batch: Vec<ChangeEvent> = raw.into_iter().map(ChangeEvent::from).collect();
            on_batch(batch);
        });

        let handle = backend.create(&request, sink)?;
        debug!(
            "Created {} watch for {}",
            backend.name(),
            request.paths.key()
        );

        Ok(Self {
            request,
            handle,
            gate,
            state: State::Created,
        })
    }

    /// Begin delivery. A second call is a no-op.
    pub fn start(&mut self) -> Result<(), WatchError> {
        match self.state {
            State::Started => Ok(()),
            State::Stopped => Err(WatchError::start("watch source was already stopped")),
            State::Created => {
                self.handle.start()?;
                self.state = State::Started;
                Ok(())
            }
        }
    }

    /// Stop delivery and release the resource. Always succeeds; a backend
    /// failure to release is logged.
    pub fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }

        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = false;

        if let Err(e) = self.handle.stop() {
            warn!(
                "Failed to stop watch for {}: {}",
                self.request.paths.key(),
                e
            );
        }
        self.state = State::Stopped;
        debug!("Stopped watch for {}", self.request.paths.key());
    }

    pub fn is_started(&self) -> bool {
        self.state == State::Started
    }

    pub fn request(&self) -> &WatchRequest {
        &self.request
    }
}

impl Drop for WatchSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSource")
            .field("request", &self.request)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{created, ScriptedBackend};
    use std::sync::Mutex as StdMutex;

    fn collecting_callback() -> (BatchCallback, Arc<StdMutex<Vec<Vec<ChangeEvent>>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: BatchCallback = Arc::new(move |batch| sink.lock().unwrap().push(batch));
        (callback, seen)
    }

    fn request() -> WatchRequest {
        WatchRequest::new(
            PathSet::new(["/watched"]).unwrap(),
            &MonitorOptions::default(),
        )
    }

    #[test]
    fn test_batches_keep_their_order() {
        let backend = ScriptedBackend::new();
        let (callback, seen) = collecting_callback();

        let mut source = WatchSource::create(&backend, request(), callback).unwrap();
        source.start().unwrap();

        backend.emit(vec![created(1, "/watched/a"), created(2, "/watched/b")]);
        backend.emit(vec![created(3, "/watched/c")]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let ids: Vec<u64> = seen.iter().flatten().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(seen[0][0].flags.is_created());
        assert_eq!(seen[0][1].filename(), Some("b"));
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let backend = ScriptedBackend::new();
        let (callback, _) = collecting_callback();

        let mut source = WatchSource::create(&backend, request(), callback).unwrap();
        source.start().unwrap();
        source.start().unwrap();
        assert_eq!(backend.started(), 1);
        assert!(source.is_started());

        source.stop();
        source.stop();
        assert_eq!(backend.stopped(), 1);
        assert!(!source.is_started());
        assert!(source.start().is_err());
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let backend = ScriptedBackend::new();
        let (callback, seen) = collecting_callback();

        let mut source = WatchSource::create(&backend, request(), callback).unwrap();
        source.start().unwrap();
        let sink = backend.last_sink().unwrap();
        source.stop();

        // A batch the platform had already queued when stop() ran.
        sink(vec![created(1, "/watched/late")]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_releases_resource() {
        let backend = ScriptedBackend::new();
        let (callback, _) = collecting_callback();

        {
            let mut source = WatchSource::create(&backend, request(), callback).unwrap();
            source.start().unwrap();
            assert_eq!(backend.running(), 1);
        }

        assert_eq!(backend.running(), 0);
        assert_eq!(backend.stopped(), 1);
    }

    #[test]
    fn test_creation_failure_is_surfaced() {
        let backend = ScriptedBackend::new();
        backend.fail_next_create();
        let (callback, _) = collecting_callback();

        let err = WatchSource::create(&backend, request(), callback).unwrap_err();
        assert!(matches!(err, WatchError::ResourceCreation(_)));
        assert_eq!(backend.created(), 0);
    }

    #[test]
    fn test_stop_failure_is_swallowed() {
        let backend = ScriptedBackend::new();
        backend.fail_next_stop();
        let (callback, _) = collecting_callback();

        let mut source = WatchSource::create(&backend, request(), callback).unwrap();
        source.start().unwrap();
        source.stop();
        assert!(!source.is_started());
    }
}
