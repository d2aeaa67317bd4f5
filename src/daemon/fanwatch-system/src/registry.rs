//! Registry - one shared broadcaster/coordinator pair per normalized path-set
//!
//! Lookup-and-subscribe runs under the DashMap entry lock for the key, and so
//! does the idle check on release. An entry can therefore only be removed
//! while its broadcaster has no subscribers, and a subscriber can never end
//! up on an entry that was removed underneath it.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use fanwatch_core::{MonitorOptions, PathSet, WatchError};
use tokio::sync::watch;
use tracing::debug;

use crate::broadcast::{Broadcaster, Subscription, WeakBroadcaster};
use crate::coordinator::{CoordinatorStats, IdleHook, SourceStatus, WatchCoordinator};
use crate::notify_backend::NotifyBackend;
use crate::source::WatchBackend;

struct Entry {
    broadcaster: Broadcaster,
    coordinator: WatchCoordinator,
    options: MonitorOptions,
}

struct Inner {
    backend: Arc<dyn WatchBackend>,
    entries: DashMap<PathSet, Entry>,
}

/// Registry statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub path_sets: usize,
    pub subscribers: usize,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(backend: Arc<dyn WatchBackend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                entries: DashMap::new(),
            }),
        }
    }

    /// Process-wide registry backed by the platform's notify watcher
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| Registry::new(Arc::new(NotifyBackend::new())))
    }

    /// Broadcaster shared by every caller of the same path-set. The first
    /// caller's options decide how the watch is created.
    pub fn get_or_create(
        &self,
        paths: &PathSet,
        options: &MonitorOptions,
    ) -> Result<Broadcaster, WatchError> {
        self.with_entry(paths, options, |entry| entry.broadcaster.clone())
    }

    /// Subscribe to a path-set, creating its entry on first use
    pub fn subscribe(
        &self,
        paths: &PathSet,
        options: &MonitorOptions,
    ) -> Result<Subscription, WatchError> {
        self.with_entry(paths, options, |entry| entry.broadcaster.subscribe())
    }

    fn with_entry<T>(
        &self,
        paths: &PathSet,
        options: &MonitorOptions,
        f: impl FnOnce(&Entry) -> T,
    ) -> Result<T, WatchError> {
        match self.inner.entries.entry(paths.clone()) {
            MapEntry::Occupied(occupied) => {
                let entry = occupied.get();
                if entry.options != *options {
                    debug!(
                        "Sharing watch for {} created with {:?}; ignoring {:?}",
                        paths.key(),
                        entry.options,
                        options
                    );
                }
                Ok(f(entry))
            }
            MapEntry::Vacant(vacant) => {
                let entry = self.create_entry(paths, options)?;
                let value = f(&entry);
                vacant.insert(entry);
                debug!("Registered path set {}", paths.key());
                Ok(value)
            }
        }
    }

    fn create_entry(&self, paths: &PathSet, options: &MonitorOptions) -> Result<Entry, WatchError> {
        let broadcaster = Broadcaster::new();
        let on_idle = release_hook(
            Arc::downgrade(&self.inner),
            paths.clone(),
            broadcaster.downgrade(),
        );
        let coordinator = WatchCoordinator::spawn(
            &broadcaster,
            Arc::clone(&self.inner.backend),
            paths.clone(),
            options.clone(),
            Some(on_idle),
        )?;

        Ok(Entry {
            broadcaster,
            coordinator,
            options: options.clone(),
        })
    }

    /// Drop the entry for `paths` if its broadcaster has no subscribers.
    /// Returns true if an entry was removed.
    ///
    /// A removed entry's broadcaster is closed, so handles obtained earlier
    /// from [`get_or_create`](Self::get_or_create) can no longer activate a
    /// second watch for the same paths.
    pub fn release(&self, paths: &PathSet) -> bool {
        Self::remove_idle(&self.inner, paths, None)
    }

    fn remove_idle(inner: &Inner, paths: &PathSet, expected: Option<&WeakBroadcaster>) -> bool {
        let removed = inner.entries.remove_if(paths, |_, entry| {
            let same = expected.map_or(true, |weak| weak.is(&entry.broadcaster));
            same && entry.broadcaster.close_if_empty()
        });
        // The entry is dropped outside the map lock.
        match removed {
            Some(_) => {
                debug!("Released path set {}", paths.key());
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, paths: &PathSet) -> bool {
        self.inner.entries.contains_key(paths)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn status(&self, paths: &PathSet) -> Option<SourceStatus> {
        self.inner
            .entries
            .get(paths)
            .map(|entry| entry.coordinator.status())
    }

    pub fn status_watch(&self, paths: &PathSet) -> Option<watch::Receiver<SourceStatus>> {
        self.inner
            .entries
            .get(paths)
            .map(|entry| entry.coordinator.status_watch())
    }

    pub fn coordinator_stats(&self, paths: &PathSet) -> Option<CoordinatorStats> {
        self.inner
            .entries
            .get(paths)
            .map(|entry| entry.coordinator.stats())
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner
            .entries
            .iter()
            .fold(RegistryStats::default(), |mut stats, entry| {
                stats.path_sets += 1;
                stats.subscribers += entry.broadcaster.subscriber_count();
                stats
            })
    }
}

fn release_hook(inner: Weak<Inner>, paths: PathSet, broadcaster: WeakBroadcaster) -> IdleHook {
    Box::new(move || {
        if let Some(inner) = inner.upgrade() {
            Registry::remove_idle(&inner, &paths, Some(&broadcaster));
        }
    })
}

/// Start monitoring `paths` through the process-wide registry.
///
/// Paths must be absolute; the list is validated before any resource is
/// touched. Callers naming the same set of paths share one watch. Must be
/// called from within a tokio runtime.
pub fn monitor<I, P>(paths: I, options: MonitorOptions) -> Result<Subscription, WatchError>
where
    I: IntoIterator<Item = P>,
    P: Into<std::path::PathBuf>,
{
    let paths = PathSet::new(paths)?;
    Registry::global().subscribe(&paths, &options)
}
