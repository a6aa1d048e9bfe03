//! Resource synchronization.
//!
//! A [`SyncCoordinator`] owns one cache, one request coordinator, one channel
//! multiplexer and one invalidation bus, and binds resource keys to fetch
//! functions through [`SyncCoordinator::use_synchronized_resource`].

mod config;
mod coordinator;
mod resource;

pub use config::{ResourceClass, SyncConfig};
pub use coordinator::{ResourceOptions, SyncCoordinator, SyncCoordinatorBuilder};
pub use resource::{ResourceSnapshot, SynchronizedResource};
