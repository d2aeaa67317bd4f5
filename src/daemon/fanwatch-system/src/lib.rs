//! fanwatch System Integration
//!
//! Turns one platform watch resource per path-set into any number of ordered
//! consumer streams:
//!
//! ```text
//! platform callback -> WatchSource -> Broadcaster::yield_batch -> Subscription queues
//! subscribe/unsubscribe -> lifecycle signal -> WatchCoordinator -> WatchSource start/stop
//! ```
//!
//! The resource exists exactly while at least one subscriber does. Fan-out is
//! performed synchronously on the platform's delivery thread, so every
//! subscriber sees events in the order the platform produced them.

pub mod broadcast;
pub mod coordinator;
pub mod notify_backend;
pub mod registry;
pub mod source;

#[cfg(test)]
mod test_support;

pub use broadcast::{
    Broadcaster, LifecycleSignal, LifecycleSignals, SubscriberId, Subscription, WeakBroadcaster,
};
pub use coordinator::{CoordinatorStats, IdleHook, SourceStatus, WatchCoordinator};
pub use fanwatch_core::{
    ChangeEvent, ChangeFlags, EventCursor, MonitorOptions, PathSet, RawNotification, WatchError,
};
pub use notify_backend::NotifyBackend;
pub use registry::{monitor, Registry, RegistryStats};
pub use source::{
    BatchCallback, RawBatchSink, WatchBackend, WatchHandle, WatchRequest, WatchSource,
};
