//! Manager/worker integration tests. Workers run in-process through a
//! test launcher so supervision logic is exercised without spawning
//! binaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use swarm_config::{AutoTerminateStrategy, ServiceConfigs, WorkerCreationStrategy};
use swarm_rpc::{
    handler_fn, BoxFuture, Endpoint, EventReply, FieldValue, InvokeOptions,
};
use swarm_service::launcher::BoxFutureRef;
use swarm_service::{
    batch_handler_fn, EndpointOptions, ManagerOptions, ServiceDefinition, ServiceManager,
    ServiceWorker, ServiceWorkerInfo, WorkerLauncher, WorkerProcess, WorkerState,
};

type DefinitionFactory = Arc<dyn Fn() -> ServiceDefinition + Send + Sync>;

/// Runs each worker as a task in this process.
struct InProcessLauncher {
    factory: DefinitionFactory,
    launches: AtomicU32,
    /// Launch attempts that fail before this count is reached.
    fail_first: u32,
    slots: Mutex<Vec<CrashHandle>>,
}

struct CrashHandle {
    dead_tx: watch::Sender<bool>,
    worker: Arc<Mutex<Option<ServiceWorker>>>,
}

impl InProcessLauncher {
    fn new(factory: DefinitionFactory) -> Arc<Self> {
        Self::flaky(factory, 0)
    }

    fn flaky(factory: DefinitionFactory, fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            factory,
            launches: AtomicU32::new(0),
            fail_first,
            slots: Mutex::new(Vec::new()),
        })
    }

    fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Simulate a worker process dying out from under its supervisor.
    async fn crash(&self, index: usize) {
        let (dead_tx, worker) = {
            let slots = self.slots.lock().unwrap();
            let slot = &slots[index];
            (slot.dead_tx.clone(), slot.worker.clone())
        };
        let taken = worker.lock().unwrap().take();
        if let Some(w) = taken {
            w.shutdown().await;
        }
        let _ = dead_tx.send(true);
    }
}

struct TaskWorker {
    dead_rx: watch::Receiver<bool>,
    dead_tx: watch::Sender<bool>,
    worker: Arc<Mutex<Option<ServiceWorker>>>,
}

impl WorkerProcess for TaskWorker {
    fn wait(&mut self) -> BoxFutureRef<'_, anyhow::Result<()>> {
        let mut rx = self.dead_rx.clone();
        Box::pin(async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            Ok(())
        })
    }

    fn kill(&mut self) -> BoxFutureRef<'_, anyhow::Result<()>> {
        let worker = self.worker.clone();
        let dead_tx = self.dead_tx.clone();
        Box::pin(async move {
            let taken = worker.lock().unwrap().take();
            if let Some(w) = taken {
                w.shutdown().await;
            }
            let _ = dead_tx.send(true);
            Ok(())
        })
    }
}

/// Clonable handle so the launcher can be used as a `WorkerLauncher`
/// without running into the orphan rule on `Arc<InProcessLauncher>`.
#[derive(Clone)]
struct LauncherHandle(Arc<InProcessLauncher>);

impl WorkerLauncher for LauncherHandle {
    fn launch(
        &self,
        info: ServiceWorkerInfo,
        configs: ServiceConfigs,
    ) -> BoxFuture<anyhow::Result<Box<dyn WorkerProcess>>> {
        let this = self.0.clone();
        Box::pin(async move {
            let attempt = this.launches.fetch_add(1, Ordering::SeqCst);
            if attempt < this.fail_first {
                anyhow::bail!("simulated launch failure");
            }
            let definition = (this.factory)();
            let worker = ServiceWorker::start(info, definition, configs).await?;
            let (dead_tx, dead_rx) = watch::channel(false);
            let worker = Arc::new(Mutex::new(Some(worker)));
            this.slots.lock().unwrap().push(CrashHandle {
                dead_tx: dead_tx.clone(),
                worker: worker.clone(),
            });
            Ok(Box::new(TaskWorker {
                dead_rx,
                dead_tx,
                worker,
            }) as Box<dyn WorkerProcess>)
        })
    }
}

/// Batch sizes observed by the `double` endpoint, in flush order.
type BatchLog = Arc<Mutex<Vec<usize>>>;

fn test_definition(batch_log: BatchLog) -> DefinitionFactory {
    Arc::new(move || {
        let batch_log = batch_log.clone();
        ServiceDefinition::new()
            .endpoint(
                "echo",
                EndpointOptions::default(),
                handler_fn(|mut args| async move {
                    let x = args.take_as::<i64>("x").map_err(|e| e.to_string())?;
                    Ok(EventReply::Single(json!(x)))
                }),
            )
            .batch_endpoint(
                "double",
                EndpointOptions {
                    batch_size: Some(3),
                    batch_interval_ms: Some(200),
                    ..Default::default()
                },
                batch_handler_fn(move |batch| {
                    let batch_log = batch_log.clone();
                    async move {
                        batch_log.lock().unwrap().push(batch.len());
                        Ok(batch
                            .iter()
                            .map(|m| json!(m["x"].as_i64().unwrap_or(0) * 2))
                            .collect())
                    }
                }),
            )
    })
}

fn base_configs(name: &str) -> ServiceConfigs {
    let mut configs = ServiceConfigs::new(name);
    configs.worker_startup_timeout_secs = 10.0;
    configs
}

fn manager_options() -> ManagerOptions {
    ManagerOptions::new(Endpoint::tcp("127.0.0.1", 0))
}

fn single(v: serde_json::Value) -> FieldValue {
    FieldValue::Single(v)
}

async fn invoke_i64(
    manager: &ServiceManager,
    event: &str,
    fields: HashMap<String, FieldValue>,
) -> i64 {
    match manager
        .invoke(event, fields, InvokeOptions::default())
        .await
        .unwrap()
    {
        EventReply::Single(v) => v.as_i64().unwrap(),
        EventReply::Stream(_) => panic!("expected a single result"),
    }
}

#[tokio::test]
async fn end_to_end_invoke_through_the_manager() {
    let launcher = InProcessLauncher::new(test_definition(Arc::default()));
    let manager = ServiceManager::start(base_configs("e2e"), Arc::new(LauncherHandle(launcher)), manager_options())
        .await
        .unwrap();

    let got = invoke_i64(&manager, "echo", HashMap::from([("x".into(), single(json!(7)))])).await;
    assert_eq!(got, 7);

    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_are_batched_together() {
    let batch_log: BatchLog = Arc::default();
    let launcher = InProcessLauncher::new(test_definition(batch_log.clone()));
    let manager = ServiceManager::start(
        base_configs("batching"),
        Arc::new(LauncherHandle(launcher)),
        manager_options(),
    )
    .await
    .unwrap();

    let fields = |x: i64| HashMap::from([("x".to_owned(), single(json!(x)))]);
    let (a, b, c) = tokio::join!(
        invoke_i64(&manager, "double", fields(1)),
        invoke_i64(&manager, "double", fields(2)),
        invoke_i64(&manager, "double", fields(3)),
    );
    assert_eq!((a, b, c), (2, 4, 6));
    assert_eq!(batch_log.lock().unwrap().as_slice(), &[3]);

    // A lone call flushes as a batch of one after the interval.
    let d = invoke_i64(&manager, "double", fields(10)).await;
    assert_eq!(d, 20);
    assert_eq!(batch_log.lock().unwrap().as_slice(), &[3, 1]);

    manager.shutdown().await;
}

#[tokio::test]
async fn idle_workers_are_terminated_when_the_policy_says_so() {
    let launcher = InProcessLauncher::new(test_definition(Arc::default()));
    let mut configs = base_configs("idle-kill");
    configs.worker_idle_timeout_secs = 0.2;
    configs.worker_auto_terminate_strategy = AutoTerminateStrategy::KillIdleImmediately;
    let manager = ServiceManager::start(configs, Arc::new(LauncherHandle(launcher)), manager_options())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let states = manager.worker_states();
    assert!(
        states.iter().all(|(_, s)| *s == WorkerState::Terminated),
        "expected all terminated, got {states:?}"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn idle_workers_survive_under_the_never_policy() {
    let launcher = InProcessLauncher::new(test_definition(Arc::default()));
    let mut configs = base_configs("idle-never");
    configs.worker_idle_timeout_secs = 0.2;
    configs.worker_auto_terminate_strategy = AutoTerminateStrategy::Never;
    let manager = ServiceManager::start(configs, Arc::new(LauncherHandle(launcher)), manager_options())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let states = manager.worker_states();
    assert!(
        states.iter().all(|(_, s)| *s == WorkerState::Idle),
        "expected all idle, got {states:?}"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn a_failed_launch_is_retried_within_the_try_budget() {
    let launcher = InProcessLauncher::flaky(test_definition(Arc::default()), 1);
    let mut configs = base_configs("retry");
    configs.worker_startup_try_count = 1;
    configs.worker_auto_terminate_strategy = AutoTerminateStrategy::Never;
    let manager = ServiceManager::start(configs, Arc::new(LauncherHandle(launcher.clone())), manager_options())
        .await
        .unwrap();

    assert_eq!(launcher.launch_count(), 2);
    let got = invoke_i64(&manager, "echo", HashMap::from([("x".into(), single(json!(1)))])).await;
    assert_eq!(got, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn exhausted_startup_attempts_fail_service_start() {
    let launcher = InProcessLauncher::flaky(test_definition(Arc::default()), u32::MAX);
    let mut configs = base_configs("exhausted");
    configs.worker_startup_try_count = 1;
    configs.worker_auto_terminate_strategy = AutoTerminateStrategy::Never;
    let err = ServiceManager::start(configs, Arc::new(LauncherHandle(launcher)), manager_options()).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn crashed_workers_are_restarted() {
    let launcher = InProcessLauncher::new(test_definition(Arc::default()));
    let mut configs = base_configs("restart");
    configs.worker_auto_terminate_strategy = AutoTerminateStrategy::Never;
    let manager = ServiceManager::start(configs, Arc::new(LauncherHandle(launcher.clone())), manager_options())
        .await
        .unwrap();
    assert_eq!(launcher.launch_count(), 1);

    launcher.crash(0).await;

    // The supervisor relaunches and the service keeps answering.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if launcher.launch_count() >= 2
            && manager
                .worker_states()
                .iter()
                .any(|(_, s)| *s == WorkerState::Idle)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker never came back");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let got = invoke_i64(&manager, "echo", HashMap::from([("x".into(), single(json!(3)))])).await;
    assert_eq!(got, 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn lazy_services_scale_up_on_demand() {
    let launcher = InProcessLauncher::new(test_definition(Arc::default()));
    let mut configs = base_configs("lazy");
    configs.worker_creation_strategy = WorkerCreationStrategy::Lazy;
    configs.init_worker_count = 0;
    configs.max_worker_count = 2;
    configs.worker_auto_terminate_strategy = AutoTerminateStrategy::Never;
    let manager = ServiceManager::start(configs, Arc::new(LauncherHandle(launcher.clone())), manager_options())
        .await
        .unwrap();
    assert_eq!(launcher.launch_count(), 0);

    // First invocation forces the pool to grow.
    let got = invoke_i64(&manager, "echo", HashMap::from([("x".into(), single(json!(9)))])).await;
    assert_eq!(got, 9);
    assert_eq!(launcher.launch_count(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn config_updates_propagate_to_running_workers() {
    let launcher = InProcessLauncher::new(test_definition(Arc::default()));
    let mut configs = base_configs("reconfig");
    configs.worker_auto_terminate_strategy = AutoTerminateStrategy::Never;
    let manager = ServiceManager::start(configs, Arc::new(LauncherHandle(launcher)), manager_options())
        .await
        .unwrap();

    let patch = json!({ "default_handle_timeout_secs": 30.0 });
    let changed = manager
        .update_configs(patch.as_object().unwrap())
        .await
        .unwrap();
    assert_eq!(changed, vec!["default_handle_timeout_secs"]);

    manager.shutdown().await;
}
