//! Watch backend built on the `notify` crate
//!
//! notify::RecommendedWatcher runs its handler on an internal thread, one per
//! watcher. With zero latency every translated event is handed to the sink on
//! that thread. With a coalescing latency, events go through a crossbeam
//! channel to a single coalescing thread that emits one batch per window.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use fanwatch_core::{BackendError, ChangeFlags, PathSet, RawNotification, WatchError};
use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, trace, warn};

use crate::source::{RawBatchSink, WatchBackend, WatchHandle, WatchRequest};

/// Backend for the platform's recommended notify watcher
#[derive(Debug, Clone, Default)]
pub struct NotifyBackend {
    config: notify::Config,
}

impl NotifyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: notify::Config) -> Self {
        Self { config }
    }
}

impl WatchBackend for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn create(
        &self,
        request: &WatchRequest,
        sink: RawBatchSink,
    ) -> Result<Box<dyn WatchHandle>, WatchError> {
        let mut translator = Translator::new(request.paths.clone(), request.start_cursor.floor());

        let watcher = if request.latency.is_zero() {
            RecommendedWatcher::new(
                move |res: notify::Result<Event>| match res {
                    Ok(event) => {
                        let batch = translator.translate(event);
                        if !batch.is_empty() {
                            sink(batch);
                        }
                    }
                    Err(e) => warn!("File watcher error: {}", e),
                },
                self.config,
            )
        } else {
            let (tx, rx) = channel::unbounded();
            let latency = request.latency;
            thread::Builder::new()
                .name("fanwatch-coalesce".to_string())
                .spawn(move || coalesce(rx, latency, sink))
                .map_err(WatchError::creation)?;

            RecommendedWatcher::new(
                move |res: notify::Result<Event>| match res {
                    Ok(event) => {
                        for notification in translator.translate(event) {
                            // Only fails once the coalescer is gone.
                            let _ = tx.send(notification);
                        }
                    }
                    Err(e) => warn!("File watcher error: {}", e),
                },
                self.config,
            )
        }
        .map_err(WatchError::creation)?;

        Ok(Box::new(NotifyHandle {
            watcher: Some(watcher),
            paths: request.paths.clone(),
            watching: Vec::new(),
        }))
    }
}

struct NotifyHandle {
    watcher: Option<RecommendedWatcher>,
    paths: PathSet,
    watching: Vec<PathBuf>,
}

impl WatchHandle for NotifyHandle {
    fn start(&mut self) -> Result<(), WatchError> {
        let watcher = self
            .watcher
            .as_mut()
            .ok_or_else(|| WatchError::start("watcher already released"))?;

        for path in self.paths.iter() {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(WatchError::start)?;
            self.watching.push(path.to_path_buf());
            debug!("Watching directory: {} (recursive: true)", path.display());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        let Some(mut watcher) = self.watcher.take() else {
            return Ok(());
        };

        let mut first_error = None;
        for path in self.watching.drain(..) {
            if let Err(e) = watcher.unwatch(&path) {
                first_error.get_or_insert(e);
            }
        }
        // Dropping the watcher ends its delivery thread, which in turn
        // disconnects the coalescer.
        drop(watcher);

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Collect notifications for `latency` after the first one of a window, then
/// emit them as one batch. Exits once the watcher side disconnects.
fn coalesce(rx: Receiver<RawNotification>, latency: Duration, sink: RawBatchSink) {
    while let Ok(first) = rx.recv() {
        let deadline = Instant::now() + latency;
        let mut batch = vec![first];

        loop {
            match rx.recv_deadline(deadline) {
                Ok(notification) => batch.push(notification),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    sink(batch);
                    return;
                }
            }
        }

        trace!("Coalesced {} notifications", batch.len());
        sink(batch);
    }
}

/// Turns notify events into FSEvents-style raw notifications and numbers them
struct Translator {
    roots: PathSet,
    next_id: u64,
}

impl Translator {
    fn new(roots: PathSet, floor: u64) -> Self {
        Self {
            roots,
            next_id: floor.saturating_add(1),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    fn translate(&mut self, event: Event) -> Vec<RawNotification> {
        let rescan = event.need_rescan();

        if rescan && event.paths.is_empty() {
            let roots: Vec<PathBuf> = self.roots.iter().map(Path::to_path_buf).collect();
            return roots
                .into_iter()
                .map(|path| RawNotification {
                    sequence_id: self.next_id(),
                    path,
                    raw_flags: ChangeFlags::MUST_SCAN_SUB_DIRS.raw(),
                })
                .collect();
        }

        let Some(mut action) = action_flags(&event.kind) else {
            return Vec::new();
        };
        if rescan {
            action |= ChangeFlags::MUST_SCAN_SUB_DIRS;
        }

        event
            .paths
            .into_iter()
            .map(|path| {
                let flags = action | type_flags(&event.kind, &path);
                RawNotification {
                    sequence_id: self.next_id(),
                    path,
                    raw_flags: flags.raw(),
                }
            })
            .collect()
    }
}

fn action_flags(kind: &EventKind) -> Option<ChangeFlags> {
    match kind {
        EventKind::Create(_) => Some(ChangeFlags::CREATED),
        EventKind::Remove(_) => Some(ChangeFlags::REMOVED),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeFlags::RENAMED),
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)) => {
            Some(ChangeFlags::CHANGE_OWNER)
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)) => {
            Some(ChangeFlags::XATTR_MOD)
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(ChangeFlags::INODE_META_MOD),
        EventKind::Modify(_) => Some(ChangeFlags::MODIFIED),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Type facet from the item on disk, falling back to what the event kind says
/// when the item is already gone.
fn type_flags(kind: &EventKind, path: &Path) -> ChangeFlags {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        let file_type = metadata.file_type();
        return if file_type.is_symlink() {
            ChangeFlags::IS_SYMLINK
        } else if file_type.is_dir() {
            ChangeFlags::IS_DIR
        } else {
            ChangeFlags::IS_FILE
        };
    }

    match kind {
        EventKind::Create(CreateKind::File) | EventKind::Remove(RemoveKind::File) => {
            ChangeFlags::IS_FILE
        }
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
            ChangeFlags::IS_DIR
        }
        _ => ChangeFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, Flag, RenameMode};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn translator(floor: u64) -> Translator {
        Translator::new(PathSet::new(["/watched"]).unwrap(), floor)
    }

    #[test]
    fn test_create_and_remove_use_kind_when_gone() {
        let mut translator = translator(0);

        let created = translator.translate(
            Event::new(EventKind::Create(CreateKind::File)).add_path("/watched/missing.txt".into()),
        );
        let removed = translator.translate(
            Event::new(EventKind::Remove(RemoveKind::Folder)).add_path("/watched/gone".into()),
        );

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].sequence_id, 1);
        let flags = ChangeFlags::from_raw(created[0].raw_flags);
        assert!(flags.is_created() && flags.is_file());

        assert_eq!(removed[0].sequence_id, 2);
        let flags = ChangeFlags::from_raw(removed[0].raw_flags);
        assert!(flags.is_removed() && flags.is_dir());
    }

    #[test]
    fn test_type_from_disk() {
        let dir = tempdir().unwrap();
        let mut translator = translator(0);

        let batch = translator.translate(
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path(dir.path().to_path_buf()),
        );

        let flags = ChangeFlags::from_raw(batch[0].raw_flags);
        assert!(flags.is_modified());
        assert!(flags.is_dir());
    }

    #[test]
    fn test_rename_emits_one_notification_per_path() {
        let mut translator = translator(10);

        let batch = translator.translate(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path("/watched/old".into())
                .add_path("/watched/new".into()),
        );

        let ids: Vec<u64> = batch.iter().map(|n| n.sequence_id).collect();
        assert_eq!(ids, vec![11, 12]);
        assert!(batch
            .iter()
            .all(|n| ChangeFlags::from_raw(n.raw_flags).is_renamed()));
    }

    #[test]
    fn test_metadata_kinds() {
        let cases = [
            (MetadataKind::Ownership, ChangeFlags::CHANGE_OWNER),
            (MetadataKind::Extended, ChangeFlags::XATTR_MOD),
            (MetadataKind::Permissions, ChangeFlags::INODE_META_MOD),
        ];
        for (kind, expected) in cases {
            let flags = action_flags(&EventKind::Modify(ModifyKind::Metadata(kind))).unwrap();
            assert_eq!(flags, expected);
        }
    }

    #[test]
    fn test_access_is_ignored() {
        let mut translator = translator(0);
        let batch = translator.translate(
            Event::new(EventKind::Access(notify::event::AccessKind::Any))
                .add_path("/watched/a".into()),
        );
        assert!(batch.is_empty());
        assert_eq!(translator.next_id, 1);
    }

    #[test]
    fn test_rescan_without_paths_targets_roots() {
        let mut translator = translator(0);
        let batch = translator.translate(Event::new(EventKind::Other).set_flag(Flag::Rescan));

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, PathBuf::from("/watched"));
        assert!(ChangeFlags::from_raw(batch[0].raw_flags).needs_rescan());
    }

    #[test]
    fn test_coalesce_flushes_on_disconnect() {
        let (tx, rx) = channel::unbounded();
        for id in 1..=3 {
            tx.send(RawNotification {
                sequence_id: id,
                path: PathBuf::from("/watched/x"),
                raw_flags: ChangeFlags::MODIFIED.raw(),
            })
            .unwrap();
        }
        drop(tx);

        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&batches);
        let sink: RawBatchSink = Arc::new(move |batch| seen.lock().unwrap().push(batch));

        coalesce(rx, Duration::from_secs(60), sink);

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let ids: Vec<u64> = batches[0].iter().map(|n| n.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_coalesce_splits_windows() {
        let (tx, rx) = channel::unbounded();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&batches);
        let sink: RawBatchSink = Arc::new(move |batch| seen.lock().unwrap().push(batch));

        let worker = thread::spawn(move || coalesce(rx, Duration::from_millis(20), sink));

        let note = |id| RawNotification {
            sequence_id: id,
            path: PathBuf::from("/watched/x"),
            raw_flags: ChangeFlags::MODIFIED.raw(),
        };
        tx.send(note(1)).unwrap();
        thread::sleep(Duration::from_millis(200));
        tx.send(note(2)).unwrap();
        drop(tx);
        worker.join().unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].sequence_id, 1);
        assert_eq!(batches[1][0].sequence_id, 2);
    }
}
