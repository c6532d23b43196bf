//! Client-side proxy for heap snapshot objects that live in a worker.
//!
//! This crate exposes a small surface:
//! - an ordered message channel to the worker (in-process, byte stream or child process)
//! - a worker proxy that correlates calls with responses and fans out events
//! - typed handles for loaders, snapshots and paginated item providers

pub mod channel;
pub mod config;
pub mod error;
pub mod loader;
pub mod monitor;
pub mod protocol;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod remote;
pub mod snapshot;
pub mod types;

pub use channel::{WorkerChannel, WorkerEndpoint};
pub use config::{ConfigError, ProxyConfig, WorkerProcessConfig};
pub use error::{ProxyError, Result};
pub use loader::LoaderProxy;
pub use monitor::LongRunningCallMonitor;
pub use protocol::{CallId, ObjectId, RequestBody, WorkerEvent, WorkerRequest, WorkerResponse};
pub use provider::ProviderProxy;
pub use proxy::{HEAP_SNAPSHOT_LOADER_TYPE, ProxyChannels, WorkerProxy};
pub use registry::{CallRegistry, PendingCall};
pub use remote::{RemoteHandle, RemoteObject};
pub use snapshot::SnapshotProxy;

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
