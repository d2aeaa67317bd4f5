//! Scripted watch backend for tests
//!
//! Counts resource creations, lets a test push raw batches into the most
//! recently started handle, and can be told to fail the next create, start or
//! stop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fanwatch_core::{BackendError, ChangeFlags, RawNotification, WatchError};
use tokio::sync::watch;

use crate::coordinator::SourceStatus;
use crate::source::{RawBatchSink, WatchBackend, WatchHandle, WatchRequest};

#[derive(Default)]
struct Slot {
    sink: Option<RawBatchSink>,
    running: bool,
}

#[derive(Default)]
struct Inner {
    created: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    fail_create: AtomicUsize,
    fail_start: AtomicUsize,
    fail_stop: AtomicUsize,
    start_delay_ms: AtomicU64,
    slots: Mutex<Vec<Slot>>,
    requests: Mutex<Vec<WatchRequest>>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedBackend {
    inner: Arc<Inner>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    pub(crate) fn started(&self) -> usize {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub(crate) fn stopped(&self) -> usize {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Handles that are started and not yet stopped
    pub(crate) fn running(&self) -> usize {
        let slots = self.inner.slots.lock().unwrap();
        slots.iter().filter(|slot| slot.running).count()
    }

    pub(crate) fn requests(&self) -> Vec<WatchRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub(crate) fn fail_next_create(&self) {
        self.inner.fail_create.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_start(&self) {
        self.inner.fail_start.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_stop(&self) {
        self.inner.fail_stop.fetch_add(1, Ordering::SeqCst);
    }

    /// Make every later `start()` block for `delay`, like a recursive watch
    /// over a large tree
    pub(crate) fn delay_start(&self, delay: Duration) {
        self.inner
            .start_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sink of the most recently created handle, running or not
    pub(crate) fn last_sink(&self) -> Option<RawBatchSink> {
        let slots = self.inner.slots.lock().unwrap();
        slots.last().and_then(|slot| slot.sink.clone())
    }

    /// Deliver a batch through the running handle. Returns false when no
    /// handle is running.
    pub(crate) fn emit(&self, batch: Vec<RawNotification>) -> bool {
        let sink = {
            let slots = self.inner.slots.lock().unwrap();
            slots
                .iter()
                .rev()
                .find(|slot| slot.running)
                .and_then(|slot| slot.sink.clone())
        };
        match sink {
            Some(sink) => {
                sink(batch);
                true
            }
            None => false,
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl WatchBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn create(
        &self,
        request: &WatchRequest,
        sink: RawBatchSink,
    ) -> Result<Box<dyn WatchHandle>, WatchError> {
        if Self::take_failure(&self.inner.fail_create) {
            return Err(WatchError::creation("scripted creation failure"));
        }

        self.inner.requests.lock().unwrap().push(request.clone());
        let index = {
            let mut slots = self.inner.slots.lock().unwrap();
            slots.push(Slot {
                sink: Some(sink),
                running: false,
            });
            slots.len() - 1
        };
        self.inner.created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedHandle {
            index,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct ScriptedHandle {
    index: usize,
    inner: Arc<Inner>,
}

impl WatchHandle for ScriptedHandle {
    fn start(&mut self) -> Result<(), WatchError> {
        let delay = self.inner.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if ScriptedBackend::take_failure(&self.inner.fail_start) {
            return Err(WatchError::start("scripted start failure"));
        }
        self.inner.slots.lock().unwrap()[self.index].running = true;
        self.inner.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.inner.slots.lock().unwrap()[self.index].running = false;
        self.inner.stopped.fetch_add(1, Ordering::SeqCst);
        if ScriptedBackend::take_failure(&self.inner.fail_stop) {
            return Err("scripted stop failure".into());
        }
        Ok(())
    }
}

pub(crate) fn notification(id: u64, path: &str, flags: ChangeFlags) -> RawNotification {
    RawNotification {
        sequence_id: id,
        path: PathBuf::from(path),
        raw_flags: flags.raw(),
    }
}

pub(crate) fn created(id: u64, path: &str) -> RawNotification {
    notification(id, path, ChangeFlags::CREATED | ChangeFlags::IS_FILE)
}

/// Wait until the coordinator publishes `status`, failing the test after 5s
pub(crate) async fn wait_for_status(status: &mut watch::Receiver<SourceStatus>, want: SourceStatus) {
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
        .expect("coordinator exited");
}
