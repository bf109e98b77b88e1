//! The service manager: binds the server peer, spawns and supervises
//! workers through the launcher seam, routes invocations to the least
//! busy worker, scales lazily, and reaps idle workers per policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use swarm_config::{AutoTerminateStrategy, ServiceConfigs, WorkerCreationStrategy};
use swarm_rpc::{
    handler_fn, Endpoint, EventReply, EventServer, FieldValue, InvokeOptions, PeerCore,
    PipeTableConfig, ServerConfig,
};

use crate::endpoint::EndpointOptions;
use crate::launcher::{ServiceWorkerInfo, WorkerLauncher};
use crate::{
    EVENT_UPDATE_CONFIG, EVENT_UPDATE_ENDPOINT, EVENT_WORKER_LOG, EVENT_WORKER_STARTED,
    EVENT_WORKER_STATS,
};

/// Where the manager listens and what workers must present to connect.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub endpoint: Endpoint,
    pub auth: Option<String>,
}

impl ManagerOptions {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            auth: None,
        }
    }

    /// Platform default for a local service: a unix socket named after
    /// the service where available, loopback TCP elsewhere.
    pub fn local(service_id: &str) -> Self {
        #[cfg(unix)]
        let endpoint = Endpoint::unix(service_id.to_owned());
        #[cfg(not(unix))]
        let endpoint = {
            let _ = service_id;
            Endpoint::tcp("127.0.0.1", 0)
        };
        Self::new(endpoint)
    }
}

/// Externally visible state of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Restarting,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    Restarting,
    Terminated,
}

/// Aggregate service counters folded from worker reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_response_ms: f64,
    pub worker_count: usize,
}

struct WorkerEntry {
    phase: Phase,
    /// Peer id on the server core, set once `_worker_started` arrives.
    peer_id: Option<String>,
    /// Invocations currently routed through this manager.
    dispatching: u32,
    last_busy: Instant,
    reported_requests: u64,
    reported_errors: u64,
    reported_duration_ms: u64,
    stop_tx: watch::Sender<bool>,
}

impl WorkerEntry {
    fn state(&self) -> WorkerState {
        match self.phase {
            Phase::Starting => WorkerState::Starting,
            Phase::Restarting => WorkerState::Restarting,
            Phase::Terminated => WorkerState::Terminated,
            Phase::Running => {
                if self.dispatching > 0 {
                    WorkerState::Busy
                } else {
                    WorkerState::Idle
                }
            }
        }
    }
}

struct Inner {
    configs: Mutex<ServiceConfigs>,
    options: ManagerOptions,
    launcher: Arc<dyn WorkerLauncher>,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    server: Arc<EventServer>,
    worker_seq: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to a running service. Cheap to clone.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

impl ServiceManager {
    /// Validate the config, bind the server peer, and bring up the
    /// initial worker pool. Fails when any initial worker exhausts its
    /// startup attempts.
    pub async fn start(
        configs: ServiceConfigs,
        launcher: Arc<dyn WorkerLauncher>,
        options: ManagerOptions,
    ) -> anyhow::Result<Self> {
        configs.validate().context("service configuration")?;

        let core = PeerCore::new(configs.id.clone(), PipeTableConfig::default());
        let mut server_config = ServerConfig::new(configs.id.clone(), options.endpoint.clone());
        server_config.auth = options.auth.clone();
        let server = EventServer::start(server_config, core)
            .await
            .context("binding the manager endpoint")?;

        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            configs: Mutex::new(configs),
            options,
            launcher,
            workers: Mutex::new(HashMap::new()),
            server,
            worker_seq: AtomicU64::new(0),
            shutdown_tx,
        });
        register_builtins(&inner);

        let manager = Self { inner };
        let initial = {
            let configs = lock(&manager.inner.configs);
            match configs.worker_creation_strategy {
                WorkerCreationStrategy::Eager => configs.max_worker_count,
                WorkerCreationStrategy::Lazy => configs.init_worker_count,
            }
        };
        for _ in 0..initial {
            manager.spawn_worker();
        }
        if initial > 0 {
            manager
                .wait_pool_started(initial as usize)
                .await
                .context("starting the initial worker pool")?;
        }
        manager.spawn_idle_sweeper();

        info!(
            service = %lock(&manager.inner.configs).id,
            workers = initial,
            addr = %manager.inner.server.bound_endpoint().display_addr(),
            "service manager started"
        );
        Ok(manager)
    }

    pub fn bound_endpoint(&self) -> Endpoint {
        self.inner.server.bound_endpoint().clone()
    }

    pub fn configs(&self) -> ServiceConfigs {
        lock(&self.inner.configs).clone()
    }

    pub fn worker_states(&self) -> Vec<(String, WorkerState)> {
        lock(&self.inner.workers)
            .iter()
            .map(|(id, e)| (id.clone(), e.state()))
            .collect()
    }

    /// Fold worker reports into one aggregate.
    pub fn stats(&self) -> ServiceStats {
        let workers = lock(&self.inner.workers);
        let mut stats = ServiceStats {
            worker_count: workers
                .values()
                .filter(|e| e.phase != Phase::Terminated)
                .count(),
            ..Default::default()
        };
        let mut duration = 0u64;
        for entry in workers.values() {
            stats.total_requests += entry.reported_requests;
            stats.total_errors += entry.reported_errors;
            duration += entry.reported_duration_ms;
        }
        if stats.total_requests > 0 {
            stats.avg_response_ms = duration as f64 / stats.total_requests as f64;
        }
        stats
    }

    /// Route one invocation to the least busy started worker, growing
    /// the pool first when lazy scaling allows it.
    pub async fn invoke(
        &self,
        event: &str,
        fields: HashMap<String, FieldValue>,
        opts: InvokeOptions,
    ) -> anyhow::Result<EventReply> {
        let worker_id = match self.pick_worker() {
            Some(id) => id,
            None => {
                self.ensure_capacity().await?;
                self.pick_worker()
                    .context("no worker available after scale up")?
            }
        };

        let peer_id = {
            let mut workers = lock(&self.inner.workers);
            let entry = workers
                .get_mut(&worker_id)
                .context("chosen worker disappeared")?;
            let peer_id = entry.peer_id.clone().context("worker lost its peer")?;
            entry.dispatching += 1;
            entry.last_busy = Instant::now();
            peer_id
        };

        let result = self
            .inner
            .server
            .core()
            .invoke(&peer_id, event, fields, opts)
            .await;

        {
            let mut workers = lock(&self.inner.workers);
            if let Some(entry) = workers.get_mut(&worker_id) {
                entry.dispatching = entry.dispatching.saturating_sub(1);
                entry.last_busy = Instant::now();
            }
        }
        result.with_context(|| format!("invoking `{event}` on worker `{worker_id}`"))
    }

    /// Started worker with the fewest in-flight dispatches.
    fn pick_worker(&self) -> Option<String> {
        let workers = lock(&self.inner.workers);
        workers
            .iter()
            .filter(|(_, e)| e.phase == Phase::Running && e.peer_id.is_some())
            .min_by_key(|(_, e)| e.dispatching)
            .map(|(id, _)| id.clone())
    }

    /// Grow the pool by `worker_scale_up_step` (bounded by
    /// `max_worker_count`) and wait for at least one newcomer.
    pub async fn ensure_capacity(&self) -> anyhow::Result<()> {
        let (step, room) = {
            let configs = lock(&self.inner.configs);
            let workers = lock(&self.inner.workers);
            let live = workers
                .values()
                .filter(|e| e.phase != Phase::Terminated)
                .count() as u32;
            (
                configs.worker_scale_up_step,
                configs.max_worker_count.saturating_sub(live),
            )
        };
        let count = step.min(room);
        if count == 0 {
            anyhow::bail!("worker pool is at max_worker_count and none are available");
        }
        for _ in 0..count {
            self.spawn_worker();
        }
        self.wait_pool_started(1).await
    }

    /// Create a worker slot and its supervisor task.
    pub fn spawn_worker(&self) -> String {
        let seq = self.inner.worker_seq.fetch_add(1, Ordering::Relaxed);
        let worker_id = format!("{}-w{seq}", lock(&self.inner.configs).id);
        let (stop_tx, stop_rx) = watch::channel(false);
        lock(&self.inner.workers).insert(
            worker_id.clone(),
            WorkerEntry {
                phase: Phase::Starting,
                peer_id: None,
                dispatching: 0,
                last_busy: Instant::now(),
                reported_requests: 0,
                reported_errors: 0,
                reported_duration_ms: 0,
                stop_tx,
            },
        );
        tokio::spawn(supervise(self.inner.clone(), worker_id.clone(), stop_rx));
        worker_id
    }

    /// Wait until `min_started` workers are running, or any slot
    /// terminates for good.
    async fn wait_pool_started(&self, min_started: usize) -> anyhow::Result<()> {
        let configs = lock(&self.inner.configs).clone();
        let budget = Duration::from_secs_f64(
            configs.worker_startup_timeout_secs * (configs.worker_startup_try_count + 1) as f64
                + configs.worker_restart_delay_secs * configs.worker_startup_try_count as f64
                + 1.0,
        );
        let deadline = Instant::now() + budget;
        loop {
            {
                let workers = lock(&self.inner.workers);
                let started = workers
                    .values()
                    .filter(|e| e.phase == Phase::Running)
                    .count();
                if started >= min_started {
                    return Ok(());
                }
                if workers.values().any(|e| e.phase == Phase::Terminated) {
                    anyhow::bail!("a worker exhausted its startup attempts");
                }
            }
            if Instant::now() >= deadline {
                anyhow::bail!("worker pool failed to start within {budget:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Apply a config patch and propagate it to every running worker.
    pub async fn update_configs(
        &self,
        patch: &serde_json::Map<String, Value>,
    ) -> anyhow::Result<Vec<&'static str>> {
        let changed = lock(&self.inner.configs).update(patch)?;
        if changed.is_empty() {
            return Ok(changed);
        }
        let fields = HashMap::from([(
            "patch".to_owned(),
            FieldValue::Single(Value::Object(patch.clone())),
        )]);
        self.broadcast(EVENT_UPDATE_CONFIG, fields).await;
        Ok(changed)
    }

    /// Retune one endpoint on every running worker.
    pub async fn update_endpoint(
        &self,
        name: &str,
        options: &EndpointOptions,
    ) -> anyhow::Result<()> {
        let fields = HashMap::from([
            ("name".to_owned(), FieldValue::Single(json!(name))),
            (
                "options".to_owned(),
                FieldValue::Single(serde_json::to_value(options)?),
            ),
        ]);
        self.broadcast(EVENT_UPDATE_ENDPOINT, fields).await;
        Ok(())
    }

    async fn broadcast(&self, event: &str, fields: HashMap<String, FieldValue>) {
        let peers: Vec<String> = {
            let workers = lock(&self.inner.workers);
            workers
                .values()
                .filter(|e| e.phase == Phase::Running)
                .filter_map(|e| e.peer_id.clone())
                .collect()
        };
        for peer in peers {
            let fields = clone_scalar_fields(&fields);
            if let Err(e) = self
                .inner
                .server
                .core()
                .invoke(&peer, event, fields, InvokeOptions::default())
                .await
            {
                warn!(%event, %peer, error = %e, "broadcast failed");
            }
        }
    }

    /// Stop a specific worker for good.
    pub fn terminate_worker(&self, worker_id: &str) {
        if let Some(entry) = lock(&self.inner.workers).get(worker_id) {
            let _ = entry.stop_tx.send(true);
        }
    }

    /// Stop every worker and close the server.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let stops: Vec<_> = lock(&self.inner.workers)
            .values()
            .map(|e| e.stop_tx.clone())
            .collect();
        for stop in stops {
            let _ = stop.send(true);
        }
        // Give supervisors a moment to kill their children.
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let pending = lock(&self.inner.workers)
                .values()
                .any(|e| !matches!(e.phase, Phase::Terminated));
            if !pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.inner.server.shutdown().await;
    }

    /// Periodically apply the auto-terminate strategy to idle workers.
    fn spawn_idle_sweeper(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let (strategy, idle_timeout) = {
                    let configs = lock(&inner.configs);
                    (
                        configs.worker_auto_terminate_strategy,
                        Duration::from_secs_f64(configs.worker_idle_timeout_secs),
                    )
                };
                let tick = (idle_timeout / 4).clamp(
                    Duration::from_millis(50),
                    Duration::from_secs(60),
                );
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
                if strategy != AutoTerminateStrategy::KillIdleImmediately {
                    continue;
                }
                let victims: Vec<_> = {
                    let workers = lock(&inner.workers);
                    let mut idle: Vec<_> = workers
                        .iter()
                        .filter(|(_, e)| {
                            e.phase == Phase::Running
                                && e.dispatching == 0
                                && e.last_busy.elapsed() >= idle_timeout
                        })
                        .map(|(id, e)| (id.clone(), e.last_busy, e.stop_tx.clone()))
                        .collect();
                    idle.sort_by_key(|(_, last_busy, _)| *last_busy);
                    idle
                };
                for (worker_id, _, stop) in victims {
                    info!(worker = %worker_id, "terminating idle worker");
                    let _ = stop.send(true);
                }
            }
        });
    }

    /// Reap the longest-idle worker to free resources for a failed
    /// spawn. Returns whether anything was reaped.
    fn reap_longest_idle(&self) -> bool {
        let configs_timeout = Duration::from_secs_f64(
            lock(&self.inner.configs).worker_idle_timeout_secs,
        );
        let victim = {
            let workers = lock(&self.inner.workers);
            workers
                .iter()
                .filter(|(_, e)| {
                    e.phase == Phase::Running
                        && e.dispatching == 0
                        && e.last_busy.elapsed() >= configs_timeout
                })
                .min_by_key(|(_, e)| e.last_busy)
                .map(|(id, e)| (id.clone(), e.stop_tx.clone()))
        };
        match victim {
            Some((worker_id, stop)) => {
                info!(worker = %worker_id, "reaping idle worker to free resources");
                let _ = stop.send(true);
                true
            }
            None => false,
        }
    }
}

/// Per-worker supervision: launch, wait for `_worker_started`, watch
/// for exit, restart with delay, bounded by the startup try count.
async fn supervise(inner: Arc<Inner>, worker_id: String, mut stop_rx: watch::Receiver<bool>) {
    let manager = ServiceManager {
        inner: inner.clone(),
    };
    let mut attempts_left = lock(&inner.configs).worker_startup_try_count + 1;

    loop {
        if *stop_rx.borrow() {
            set_phase(&inner, &worker_id, Phase::Terminated);
            return;
        }

        let configs = lock(&inner.configs).clone();
        let info = worker_info(&inner, &configs, &worker_id);
        debug!(worker = %worker_id, "launching worker");
        set_phase(&inner, &worker_id, Phase::Starting);

        match inner.launcher.launch(info, configs.clone()).await {
            Ok(mut proc) => {
                let startup =
                    Duration::from_secs_f64(configs.worker_startup_timeout_secs);
                match wait_started(&inner, &worker_id, startup, &mut stop_rx).await {
                    Waited::Started => {
                        attempts_left = configs.worker_startup_try_count + 1;
                        info!(worker = %worker_id, "worker started");
                        let exited = tokio::select! {
                            result = proc.wait() => Some(result),
                            _ = wait_stop(&mut stop_rx) => None,
                        };
                        match exited {
                            Some(result) => {
                                drop_worker_peer(&inner, &worker_id);
                                match result {
                                    Ok(()) => info!(worker = %worker_id, "worker exited"),
                                    Err(e) => warn!(worker = %worker_id, error = %e, "worker crashed"),
                                }
                                set_phase(&inner, &worker_id, Phase::Restarting);
                            }
                            None => {
                                let _ = proc.kill().await;
                                drop_worker_peer(&inner, &worker_id);
                                set_phase(&inner, &worker_id, Phase::Terminated);
                                return;
                            }
                        }
                    }
                    Waited::Stopped => {
                        let _ = proc.kill().await;
                        drop_worker_peer(&inner, &worker_id);
                        set_phase(&inner, &worker_id, Phase::Terminated);
                        return;
                    }
                    Waited::TimedOut => {
                        warn!(worker = %worker_id, "worker missed its startup window");
                        let _ = proc.kill().await;
                        drop_worker_peer(&inner, &worker_id);
                        attempts_left -= 1;
                    }
                }
            }
            Err(e) => {
                error!(worker = %worker_id, error = %e, "worker launch failed");
                // A failed spawn may be a resource shortage; reaping an
                // idle worker buys another attempt for free.
                if configs.worker_auto_terminate_strategy
                    == AutoTerminateStrategy::KillIdleOnResourceShortage
                    && manager.reap_longest_idle()
                {
                    // retry without consuming an attempt
                } else {
                    attempts_left -= 1;
                }
            }
        }

        if attempts_left == 0 {
            error!(worker = %worker_id, "startup attempts exhausted");
            set_phase(&inner, &worker_id, Phase::Terminated);
            return;
        }
        let delay = Duration::from_secs_f64(
            lock(&inner.configs).worker_restart_delay_secs.max(0.0),
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_stop(&mut stop_rx) => {
                set_phase(&inner, &worker_id, Phase::Terminated);
                return;
            }
        }
    }
}

enum Waited {
    Started,
    Stopped,
    TimedOut,
}

/// Poll until the worker announces itself, the slot is stopped, or the
/// startup window elapses.
async fn wait_started(
    inner: &Arc<Inner>,
    worker_id: &str,
    window: Duration,
    stop_rx: &mut watch::Receiver<bool>,
) -> Waited {
    let deadline = Instant::now() + window;
    loop {
        {
            let workers = lock(&inner.workers);
            if let Some(entry) = workers.get(worker_id) {
                if entry.phase == Phase::Running {
                    return Waited::Started;
                }
            } else {
                return Waited::Stopped;
            }
        }
        if Instant::now() >= deadline {
            return Waited::TimedOut;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            _ = wait_stop(stop_rx) => return Waited::Stopped,
        }
    }
}

async fn wait_stop(stop_rx: &mut watch::Receiver<bool>) {
    while stop_rx.changed().await.is_ok() {
        if *stop_rx.borrow() {
            return;
        }
    }
    // Sender gone; treat as stop.
}

fn worker_info(inner: &Inner, configs: &ServiceConfigs, worker_id: &str) -> ServiceWorkerInfo {
    let (manager_host, manager_port, manager_unix) = match inner.server.bound_endpoint() {
        Endpoint::Tcp { host, port } => (host.clone(), Some(*port), None),
        Endpoint::Unix { name } => ("localhost".to_owned(), None, Some(name.clone())),
    };
    ServiceWorkerInfo {
        service_id: configs.id.clone(),
        worker_id: worker_id.to_owned(),
        manager_host,
        manager_port,
        manager_unix,
        auth: inner.options.auth.clone(),
    }
}

fn set_phase(inner: &Inner, worker_id: &str, phase: Phase) {
    if let Some(entry) = lock(&inner.workers).get_mut(worker_id) {
        entry.phase = phase;
        if phase != Phase::Running {
            entry.peer_id = None;
        }
    }
}

/// Close the rpc peer belonging to a gone worker.
fn drop_worker_peer(inner: &Inner, worker_id: &str) {
    let peer = lock(&inner.workers)
        .get(worker_id)
        .and_then(|e| e.peer_id.clone());
    if let Some(peer) = peer {
        inner.server.core().close_peer(&peer);
    }
}

/// `_worker_started`, `_worker_stats` and `_worker_log` handlers on the
/// manager's server core.
fn register_builtins(inner: &Arc<Inner>) {
    let core = inner.server.core().clone();
    let weak = Arc::downgrade(inner);

    let w = weak.clone();
    core.register_event(
        EVENT_WORKER_STARTED,
        handler_fn(move |mut args| {
            let w = w.clone();
            async move {
                let Some(inner) = w.upgrade() else {
                    return Err("manager is gone".to_owned());
                };
                let worker_id: String = args.take_as("worker_id").map_err(|e| e.to_string())?;
                let mut workers = lock(&inner.workers);
                let Some(entry) = workers.get_mut(&worker_id) else {
                    return Err(format!("unknown worker `{worker_id}`"));
                };
                entry.peer_id = Some(args.peer_id.clone());
                entry.phase = Phase::Running;
                entry.last_busy = Instant::now();
                Ok(EventReply::Single(json!(true)))
            }
        }),
    );

    let w = weak.clone();
    core.register_event(
        EVENT_WORKER_STATS,
        handler_fn(move |mut args| {
            let w = w.clone();
            async move {
                let Some(inner) = w.upgrade() else {
                    return Err("manager is gone".to_owned());
                };
                let worker_id: String = args.take_as("worker_id").map_err(|e| e.to_string())?;
                let stats: Value = args.take_as("stats").map_err(|e| e.to_string())?;
                let mut workers = lock(&inner.workers);
                if let Some(entry) = workers.get_mut(&worker_id) {
                    entry.reported_requests =
                        stats["total_requests"].as_u64().unwrap_or(0);
                    entry.reported_errors = stats["total_errors"].as_u64().unwrap_or(0);
                    entry.reported_duration_ms =
                        stats["total_duration_ms"].as_u64().unwrap_or(0);
                    if stats["active_tasks"].as_u64().unwrap_or(0) > 0 {
                        entry.last_busy = Instant::now();
                    }
                }
                Ok(EventReply::Single(json!(true)))
            }
        }),
    );

    // A dropped connection takes the worker out of the routing set
    // before its supervisor notices the exit.
    let w = weak.clone();
    core.set_on_disconnected(Arc::new(move |peer| {
        let Some(inner) = w.upgrade() else { return };
        let mut workers = lock(&inner.workers);
        if let Some(entry) = workers
            .values_mut()
            .find(|e| e.peer_id.as_deref() == Some(peer.id.as_str()))
        {
            entry.peer_id = None;
        }
    }));

    core.register_event(
        EVENT_WORKER_LOG,
        handler_fn(move |mut args| async move {
            let worker_id: String = args.take_as("worker_id").map_err(|e| e.to_string())?;
            let level: String = args.take_as("level").map_err(|e| e.to_string())?;
            let message: String = args.take_as("message").map_err(|e| e.to_string())?;
            match level.to_ascii_lowercase().as_str() {
                "error" => error!(worker = %worker_id, "{message}"),
                "warn" | "warning" => warn!(worker = %worker_id, "{message}"),
                "debug" | "trace" => debug!(worker = %worker_id, "{message}"),
                _ => info!(worker = %worker_id, "{message}"),
            }
            Ok(EventReply::Single(json!(true)))
        }),
    );
}

/// Scalar-only field maps can be cloned; streams cannot.
fn clone_scalar_fields(
    fields: &HashMap<String, FieldValue>,
) -> HashMap<String, FieldValue> {
    fields
        .iter()
        .filter_map(|(k, v)| match v {
            FieldValue::Single(v) => Some((k.clone(), FieldValue::Single(v.clone()))),
            FieldValue::Stream(_) => None,
        })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
