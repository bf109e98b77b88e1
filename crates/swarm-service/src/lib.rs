//! Service runtime on top of the swarm event protocol: a manager
//! process that supervises a pool of worker processes, and the worker
//! side that exposes a service's endpoints with admission control and
//! batching.
//!
//! Built-in events flow between the two sides: workers announce
//! themselves with `_worker_started`, report vitals through
//! `_worker_stats`, and forward logs via `_worker_log`; the manager
//! retunes live workers through `_update_endpoint` and
//! `_update_config`.

pub mod endpoint;
pub mod launcher;
pub mod manager;
pub mod worker;

pub use endpoint::{
    batch_handler_fn, BatchHandler, EndpointInfo, EndpointOptions, ServiceDefinition,
};
pub use launcher::{
    ProcessLauncher, ServiceWorkerInfo, WorkerLauncher, WorkerProcess, WORKER_INFO_FLAG,
};
pub use manager::{ManagerOptions, ServiceManager, ServiceStats, WorkerState};
pub use worker::{ServiceWorker, WorkerStats};

/// Worker -> manager: sent once the worker is connected and serving.
pub const EVENT_WORKER_STARTED: &str = "_worker_started";
/// Worker -> manager: running counters snapshot.
pub const EVENT_WORKER_STATS: &str = "_worker_stats";
/// Worker -> manager: forwarded log record.
pub const EVENT_WORKER_LOG: &str = "_worker_log";
/// Manager -> worker: retune one endpoint at runtime.
pub const EVENT_UPDATE_ENDPOINT: &str = "_update_endpoint";
/// Manager -> worker: apply a service config patch.
pub const EVENT_UPDATE_CONFIG: &str = "_update_config";
