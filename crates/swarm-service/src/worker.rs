//! The worker side of a service: connects back to the manager, exposes
//! the service's endpoints with admission control and batching, and
//! reports its vitals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use swarm_config::ServiceConfigs;
use swarm_rpc::{
    handler_fn, ClientConfig, EventClient, EventReply, FieldValue, Handler, InvokeOptions,
    PeerCore, PipeTableConfig,
};

use crate::endpoint::{BatchHandler, EndpointDef, EndpointInfo, EndpointKind, EndpointOptions};
use crate::launcher::ServiceWorkerInfo;
use crate::{EVENT_UPDATE_CONFIG, EVENT_UPDATE_ENDPOINT, EVENT_WORKER_LOG, EVENT_WORKER_STARTED, EVENT_WORKER_STATS};

/// Running totals for one worker, shared by every endpoint wrapper.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub active_tasks: AtomicU32,
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,
    pub total_duration_ms: AtomicU64,
}

impl WorkerStats {
    fn snapshot(&self) -> Value {
        json!({
            "active_tasks": self.active_tasks.load(Ordering::Relaxed),
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_errors": self.total_errors.load(Ordering::Relaxed),
            "total_duration_ms": self.total_duration_ms.load(Ordering::Relaxed),
        })
    }
}

/// Endpoint settings that can move at runtime, keyed by endpoint name.
type EndpointTable = Arc<Mutex<HashMap<String, (EndpointOptions, EndpointInfo)>>>;

struct BatchItem {
    fields: serde_json::Map<String, Value>,
    reply: oneshot::Sender<Result<Value, String>>,
}

pub struct ServiceWorker {
    info: ServiceWorkerInfo,
    client: EventClient,
    stats: Arc<WorkerStats>,
    configs: Arc<Mutex<ServiceConfigs>>,
    endpoints: EndpointTable,
    report_task: tokio::task::JoinHandle<()>,
}

impl ServiceWorker {
    /// Build the endpoint surface, connect back to the manager, and
    /// announce readiness with `_worker_started`.
    pub async fn start(
        info: ServiceWorkerInfo,
        definition: crate::ServiceDefinition,
        configs: ServiceConfigs,
    ) -> anyhow::Result<Self> {
        let core = PeerCore::new(info.worker_id.clone(), PipeTableConfig::default());
        let stats = Arc::new(WorkerStats::default());
        let configs = Arc::new(Mutex::new(configs));
        let endpoints: EndpointTable = Arc::new(Mutex::new(HashMap::new()));

        let endpoint_names: Vec<String> = definition.endpoint_names();
        for def in definition.endpoints {
            install_endpoint(&core, def, &configs, &endpoints, &stats);
        }
        install_builtins(&core, &configs, &endpoints);

        let mut client_config =
            ClientConfig::new(info.worker_id.clone(), info.manager_endpoint());
        client_config.auth = info.auth.clone();
        let client = EventClient::connect(client_config, core)
            .await
            .context("connecting to the service manager")?;

        let started = HashMap::from([
            (
                "worker_id".to_owned(),
                FieldValue::Single(json!(info.worker_id)),
            ),
            (
                "service_id".to_owned(),
                FieldValue::Single(json!(info.service_id)),
            ),
            (
                "endpoints".to_owned(),
                FieldValue::Single(json!(endpoint_names)),
            ),
        ]);
        client
            .invoke(EVENT_WORKER_STARTED, started, InvokeOptions::default())
            .await
            .context("announcing worker start")?;

        let report_task = spawn_stats_reporter(
            client.core().clone(),
            client.server_id(),
            info.worker_id.clone(),
            stats.clone(),
        );

        Ok(Self {
            info,
            client,
            stats,
            configs,
            endpoints,
            report_task,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.info.worker_id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn configs(&self) -> ServiceConfigs {
        lock(&self.configs).clone()
    }

    pub fn endpoint_info(&self, name: &str) -> Option<EndpointInfo> {
        lock(&self.endpoints).get(name).map(|(_, info)| info.clone())
    }

    /// Forward one log record to the manager, best effort.
    pub fn forward_log(&self, level: &str, message: &str) {
        let Some(server) = self.client.server_id() else {
            return;
        };
        let core = self.client.core().clone();
        let fields = HashMap::from([
            (
                "worker_id".to_owned(),
                FieldValue::Single(json!(self.info.worker_id)),
            ),
            ("level".to_owned(), FieldValue::Single(json!(level))),
            ("message".to_owned(), FieldValue::Single(json!(message))),
        ]);
        tokio::spawn(async move {
            let _ = core
                .invoke(&server, EVENT_WORKER_LOG, fields, InvokeOptions::default())
                .await;
        });
    }

    pub async fn shutdown(self) {
        self.report_task.abort();
        self.client.close();
    }
}

/// Wrap one endpoint definition and register it on the core.
fn install_endpoint(
    core: &PeerCore,
    def: EndpointDef,
    configs: &Arc<Mutex<ServiceConfigs>>,
    endpoints: &EndpointTable,
    stats: &Arc<WorkerStats>,
) {
    let info = def.options.merge_defaults(&def.name, &lock(configs));
    let semaphore = info
        .worker_max_task_count
        .map(|cap| Arc::new(Semaphore::new(cap.max(1) as usize)));
    lock(endpoints).insert(def.name.clone(), (def.options, info));

    let handler = match def.kind {
        EndpointKind::Call(inner) => {
            wrap_call(def.name.clone(), inner, endpoints.clone(), stats.clone(), semaphore)
        }
        EndpointKind::Batch(batch) => {
            let queue = spawn_batcher(def.name.clone(), batch, endpoints.clone());
            wrap_batch(def.name.clone(), queue, stats.clone(), semaphore)
        }
    };
    core.register_event(def.name, handler);
}

fn wrap_call(
    name: String,
    inner: Handler,
    endpoints: EndpointTable,
    stats: Arc<WorkerStats>,
    semaphore: Option<Arc<Semaphore>>,
) -> Handler {
    handler_fn(move |args| {
        let name = name.clone();
        let inner = inner.clone();
        let endpoints = endpoints.clone();
        let stats = stats.clone();
        let semaphore = semaphore.clone();
        async move {
            // Queue on the admission semaphore; callers are never rejected.
            let _permit = match semaphore {
                Some(s) => Some(
                    s.acquire_owned()
                        .await
                        .map_err(|_| "worker shutting down".to_owned())?,
                ),
                None => None,
            };
            let timeout = lock(&endpoints)
                .get(&name)
                .and_then(|(_, info)| info.handle_timeout_secs);

            stats.active_tasks.fetch_add(1, Ordering::Relaxed);
            let begun = Instant::now();
            let result = match timeout {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs_f64(secs), inner(args)).await {
                        Ok(r) => r,
                        Err(_) => Err(format!("endpoint `{name}` timed out after {secs}s")),
                    }
                }
                None => inner(args).await,
            };
            record(&stats, begun, result.is_err());
            result
        }
    })
}

fn wrap_batch(
    name: String,
    queue: mpsc::UnboundedSender<BatchItem>,
    stats: Arc<WorkerStats>,
    semaphore: Option<Arc<Semaphore>>,
) -> Handler {
    handler_fn(move |args| {
        let name = name.clone();
        let queue = queue.clone();
        let stats = stats.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = match semaphore {
                Some(s) => Some(
                    s.acquire_owned()
                        .await
                        .map_err(|_| "worker shutting down".to_owned())?,
                ),
                None => None,
            };
            let fields = args.into_scalar_map().map_err(|e| e.to_string())?;

            stats.active_tasks.fetch_add(1, Ordering::Relaxed);
            let begun = Instant::now();
            let (tx, rx) = oneshot::channel();
            let result = if queue.send(BatchItem { fields, reply: tx }).is_err() {
                Err(format!("endpoint `{name}` batcher is gone"))
            } else {
                match rx.await {
                    Ok(r) => r,
                    Err(_) => Err(format!("endpoint `{name}` batch was dropped")),
                }
            };
            record(&stats, begun, result.is_err());
            result.map(EventReply::Single)
        }
    })
}

fn record(stats: &WorkerStats, begun: Instant, failed: bool) {
    stats.active_tasks.fetch_sub(1, Ordering::Relaxed);
    stats.total_requests.fetch_add(1, Ordering::Relaxed);
    if failed {
        stats.total_errors.fetch_add(1, Ordering::Relaxed);
    }
    stats
        .total_duration_ms
        .fetch_add(begun.elapsed().as_millis() as u64, Ordering::Relaxed);
}

/// Group queued calls into batches: flush at `batch_size` items or when
/// `batch_interval_ms` passes since the first one, whichever is first.
/// Results fan back out in input order.
fn spawn_batcher(
    name: String,
    handler: BatchHandler,
    endpoints: EndpointTable,
) -> mpsc::UnboundedSender<BatchItem> {
    let (tx, mut rx) = mpsc::unbounded_channel::<BatchItem>();
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let (batch_size, interval_ms, timeout_secs) = {
                let table = lock(&endpoints);
                match table.get(&name) {
                    Some((_, info)) => (
                        info.batch_size.max(1) as usize,
                        info.batch_interval_ms,
                        info.batch_handle_timeout_secs,
                    ),
                    None => (1, 0, None),
                }
            };

            let mut items = vec![first];
            if batch_size > 1 {
                let deadline = tokio::time::Instant::now() + Duration::from_millis(interval_ms);
                while items.len() < batch_size {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(item)) => items.push(item),
                        Ok(None) | Err(_) => break,
                    }
                }
            }
            debug!(endpoint = %name, size = items.len(), "flushing batch");

            let inputs: Vec<_> = items.iter().map(|i| i.fields.clone()).collect();
            let call = handler(inputs);
            let result = match timeout_secs {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs_f64(secs), call).await {
                        Ok(r) => r,
                        Err(_) => Err(format!("batch on `{name}` timed out after {secs}s")),
                    }
                }
                None => call.await,
            };

            match result {
                Ok(outputs) if outputs.len() == items.len() => {
                    for (item, output) in items.into_iter().zip(outputs) {
                        let _ = item.reply.send(Ok(output));
                    }
                }
                Ok(outputs) => {
                    let msg = format!(
                        "batch on `{name}` returned {} results for {} inputs",
                        outputs.len(),
                        items.len()
                    );
                    for item in items {
                        let _ = item.reply.send(Err(msg.clone()));
                    }
                }
                Err(e) => {
                    for item in items {
                        let _ = item.reply.send(Err(e.clone()));
                    }
                }
            }
        }
    });
    tx
}

/// `_update_endpoint` and `_update_config`, invoked by the manager to
/// reconfigure a live worker.
fn install_builtins(
    core: &PeerCore,
    configs: &Arc<Mutex<ServiceConfigs>>,
    endpoints: &EndpointTable,
) {
    let ep_table = endpoints.clone();
    let cfg = configs.clone();
    core.register_event(
        EVENT_UPDATE_ENDPOINT,
        handler_fn(move |mut args| {
            let ep_table = ep_table.clone();
            let cfg = cfg.clone();
            async move {
                let name: String = args.take_as("name").map_err(|e| e.to_string())?;
                let patch: EndpointOptions =
                    args.take_as("options").map_err(|e| e.to_string())?;
                let configs = lock(&cfg).clone();
                let mut table = lock(&ep_table);
                let Some((options, info)) = table.get_mut(&name) else {
                    return Err(format!("unknown endpoint `{name}`"));
                };
                *options = patch;
                *info = options.merge_defaults(&name, &configs);
                Ok(EventReply::Single(json!(true)))
            }
        }),
    );

    let ep_table = endpoints.clone();
    let cfg = configs.clone();
    core.register_event(
        EVENT_UPDATE_CONFIG,
        handler_fn(move |mut args| {
            let ep_table = ep_table.clone();
            let cfg = cfg.clone();
            async move {
                let patch: serde_json::Map<String, Value> =
                    args.take_as("patch").map_err(|e| e.to_string())?;
                let changed = {
                    let mut configs = lock(&cfg);
                    configs.update(&patch).map_err(|e| e.to_string())?
                };
                // New defaults may shift endpoints that inherit them.
                if changed.iter().any(|f| f.starts_with("default_")) {
                    let configs = lock(&cfg).clone();
                    let mut table = lock(&ep_table);
                    for (name, (options, info)) in table.iter_mut() {
                        *info = options.merge_defaults(name, &configs);
                    }
                }
                Ok(EventReply::Single(json!(changed)))
            }
        }),
    );
}

/// Push a stats snapshot to the manager once a second, when something
/// changed.
fn spawn_stats_reporter(
    core: PeerCore,
    server_id: Option<String>,
    worker_id: String,
    stats: Arc<WorkerStats>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(server) = server_id else { return };
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = Value::Null;
        loop {
            tick.tick().await;
            let snapshot = stats.snapshot();
            if snapshot == last {
                continue;
            }
            let fields = HashMap::from([
                (
                    "worker_id".to_owned(),
                    FieldValue::Single(json!(worker_id)),
                ),
                ("stats".to_owned(), FieldValue::Single(snapshot.clone())),
            ]);
            match core
                .invoke(&server, EVENT_WORKER_STATS, fields, InvokeOptions::default())
                .await
            {
                Ok(_) => last = snapshot,
                Err(e) => {
                    warn!(error = %e, "stats report failed");
                    return;
                }
            }
        }
    })
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
