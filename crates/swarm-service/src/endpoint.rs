//! Endpoint metadata and the builder that assembles a service's
//! callable surface.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use swarm_config::ServiceConfigs;
use swarm_rpc::{BoxFuture, Handler};

/// Per-endpoint overrides supplied at registration. `None` inherits the
/// service-wide default; an explicit value always wins, including zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointOptions {
    pub max_task_count: Option<u32>,
    pub worker_max_task_count: Option<u32>,
    pub handle_timeout_secs: Option<f64>,
    pub batch_size: Option<u32>,
    pub batch_interval_ms: Option<u64>,
    pub batch_handle_timeout_secs: Option<f64>,
}

/// Effective endpoint settings after defaults are merged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    /// None means unlimited.
    pub max_task_count: Option<u32>,
    pub worker_max_task_count: Option<u32>,
    /// None means no per-call timeout.
    pub handle_timeout_secs: Option<f64>,
    pub batch_size: u32,
    pub batch_interval_ms: u64,
    pub batch_handle_timeout_secs: Option<f64>,
}

impl EndpointOptions {
    /// Back-fill unset fields from the service defaults, then clamp the
    /// batch size so one batch never exceeds a task-count cap.
    pub fn merge_defaults(&self, name: &str, configs: &ServiceConfigs) -> EndpointInfo {
        let max_task_count = self.max_task_count.or(configs.default_max_task_count);
        let worker_max_task_count = self
            .worker_max_task_count
            .or(configs.default_worker_max_task_count);
        let handle_timeout_secs = self
            .handle_timeout_secs
            .or(configs.default_handle_timeout_secs);

        let mut batch_size = self.batch_size.unwrap_or(configs.default_batch_size).max(1);
        if let Some(cap) = max_task_count {
            batch_size = batch_size.min(cap.max(1));
        }
        if let Some(cap) = worker_max_task_count {
            batch_size = batch_size.min(cap.max(1));
        }

        let batch_handle_timeout_secs = self
            .batch_handle_timeout_secs
            .or(configs.default_batch_handle_timeout_secs)
            .or(handle_timeout_secs.map(|t| t * batch_size as f64));

        EndpointInfo {
            name: name.to_owned(),
            max_task_count,
            worker_max_task_count,
            handle_timeout_secs,
            batch_size,
            batch_interval_ms: self
                .batch_interval_ms
                .unwrap_or(configs.default_batch_interval_ms),
            batch_handle_timeout_secs,
        }
    }
}

/// Handler for a batching endpoint: one call per flushed batch, inputs
/// and outputs aligned by position.
pub type BatchHandler = Arc<
    dyn Fn(Vec<serde_json::Map<String, Value>>) -> BoxFuture<Result<Vec<Value>, String>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`BatchHandler`].
pub fn batch_handler_fn<F, Fut>(f: F) -> BatchHandler
where
    F: Fn(Vec<serde_json::Map<String, Value>>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Vec<Value>, String>> + Send + 'static,
{
    Arc::new(move |batch| Box::pin(f(batch)))
}

pub(crate) enum EndpointKind {
    /// Every invocation reaches the handler directly.
    Call(Handler),
    /// Invocations are grouped and flushed to the handler together.
    Batch(BatchHandler),
}

pub(crate) struct EndpointDef {
    pub name: String,
    pub options: EndpointOptions,
    pub kind: EndpointKind,
}

/// The callable surface of a service, assembled before workers start.
#[derive(Default)]
pub struct ServiceDefinition {
    pub(crate) endpoints: Vec<EndpointDef>,
}

impl ServiceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain endpoint.
    pub fn endpoint(
        mut self,
        name: impl Into<String>,
        options: EndpointOptions,
        handler: Handler,
    ) -> Self {
        self.endpoints.push(EndpointDef {
            name: name.into(),
            options,
            kind: EndpointKind::Call(handler),
        });
        self
    }

    /// Register a batching endpoint. Scalar fields only; each call's
    /// fields arrive as one object in the batch.
    pub fn batch_endpoint(
        mut self,
        name: impl Into<String>,
        options: EndpointOptions,
        handler: BatchHandler,
    ) -> Self {
        self.endpoints.push(EndpointDef {
            name: name.into(),
            options,
            kind: EndpointKind::Batch(handler),
        });
        self
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_inherits_service_defaults() {
        let configs = ServiceConfigs::new("svc");
        let info = EndpointOptions::default().merge_defaults("run", &configs);
        assert_eq!(info.batch_size, configs.default_batch_size);
        assert_eq!(info.handle_timeout_secs, Some(180.0));
        assert_eq!(info.max_task_count, None);
    }

    #[test]
    fn explicit_zero_is_kept_not_treated_as_unset() {
        let configs = ServiceConfigs::new("svc");
        let options = EndpointOptions {
            max_task_count: Some(0),
            ..Default::default()
        };
        let info = options.merge_defaults("run", &configs);
        assert_eq!(info.max_task_count, Some(0));
    }

    #[test]
    fn batch_size_is_clamped_by_task_caps() {
        let mut configs = ServiceConfigs::new("svc");
        configs.default_batch_size = 16;
        let options = EndpointOptions {
            max_task_count: Some(8),
            worker_max_task_count: Some(4),
            ..Default::default()
        };
        let info = options.merge_defaults("run", &configs);
        assert_eq!(info.batch_size, 4);
    }

    #[test]
    fn batch_timeout_falls_back_to_scaled_handle_timeout() {
        let mut configs = ServiceConfigs::new("svc");
        configs.default_batch_size = 5;
        configs.default_handle_timeout_secs = Some(10.0);
        configs.default_batch_handle_timeout_secs = None;
        let info = EndpointOptions::default().merge_defaults("run", &configs);
        assert_eq!(info.batch_handle_timeout_secs, Some(50.0));
    }
}
