//! How workers come to life: the bootstrap contract handed to a new
//! worker and the launcher seam the manager spawns through.
//!
//! The default launcher runs a worker binary as a child process. Tests
//! swap in an in-process launcher so supervision logic runs without
//! spawning executables.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use swarm_config::ServiceConfigs;
use swarm_rpc::{BoxFuture, Endpoint};

/// Everything a fresh worker needs to call home. Travels to the child
/// process as one JSON argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceWorkerInfo {
    pub service_id: String,
    pub worker_id: String,
    pub manager_host: String,
    /// TCP port of the manager, unless a unix socket is used.
    pub manager_port: Option<u16>,
    /// Unix socket name of the manager, when not using TCP.
    pub manager_unix: Option<String>,
    pub auth: Option<String>,
}

/// Command-line flag carrying the serialized bootstrap info.
pub const WORKER_INFO_FLAG: &str = "--swarm-worker-info";

impl ServiceWorkerInfo {
    pub fn manager_endpoint(&self) -> Endpoint {
        match (&self.manager_unix, self.manager_port) {
            (Some(name), _) => Endpoint::unix(name.clone()),
            (None, Some(port)) => Endpoint::tcp(self.manager_host.clone(), port),
            (None, None) => Endpoint::tcp(self.manager_host.clone(), 0),
        }
    }

    pub fn to_arg(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("serializing worker info")
    }

    pub fn from_arg(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("parsing worker info")
    }

    /// Pull the bootstrap info out of a worker binary's argv.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg == WORKER_INFO_FLAG {
                let raw = args
                    .next()
                    .with_context(|| format!("{WORKER_INFO_FLAG} needs a value"))?;
                return Self::from_arg(&raw);
            }
        }
        anyhow::bail!("{WORKER_INFO_FLAG} not found in arguments");
    }
}

/// Boxed future borrowing from its receiver.
pub type BoxFutureRef<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A launched worker as seen by its supervisor.
pub trait WorkerProcess: Send {
    /// Resolves when the worker exits, however it exits.
    fn wait(&mut self) -> BoxFutureRef<'_, anyhow::Result<()>>;
    /// Force the worker down.
    fn kill(&mut self) -> BoxFutureRef<'_, anyhow::Result<()>>;
}

/// Spawns workers. The manager never cares how.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(
        &self,
        info: ServiceWorkerInfo,
        configs: ServiceConfigs,
    ) -> BoxFuture<anyhow::Result<Box<dyn WorkerProcess>>>;
}

/// Launches a worker binary as a child process. The child dies with the
/// manager through kill-on-drop.
pub struct ProcessLauncher {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        info: ServiceWorkerInfo,
        configs: ServiceConfigs,
    ) -> BoxFuture<anyhow::Result<Box<dyn WorkerProcess>>> {
        let program = self.program.clone();
        let args = self.args.clone();
        Box::pin(async move {
            let mut cmd = tokio::process::Command::new(&program);
            cmd.args(&args)
                .arg(WORKER_INFO_FLAG)
                .arg(info.to_arg()?)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            if let Some(gpus) = &configs.visible_gpus {
                let list = gpus
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                cmd.env("CUDA_VISIBLE_DEVICES", list);
            }
            let child = cmd
                .spawn()
                .with_context(|| format!("spawning worker `{}`", program.display()))?;
            Ok(Box::new(ChildProcess { child }) as Box<dyn WorkerProcess>)
        })
    }
}

struct ChildProcess {
    child: tokio::process::Child,
}

impl WorkerProcess for ChildProcess {
    fn wait(&mut self) -> BoxFutureRef<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let status = self.child.wait().await.context("waiting on worker")?;
            if status.success() {
                Ok(())
            } else {
                anyhow::bail!("worker exited with {status}")
            }
        })
    }

    fn kill(&mut self) -> BoxFutureRef<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.child.kill().await.context("killing worker")?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_info_survives_the_argv_trip() {
        let info = ServiceWorkerInfo {
            service_id: "svc-abc12345".into(),
            worker_id: "w-1".into(),
            manager_host: "localhost".into(),
            manager_port: Some(9394),
            manager_unix: None,
            auth: Some("tok".into()),
        };
        let argv = vec![
            "worker-bin".to_owned(),
            WORKER_INFO_FLAG.to_owned(),
            info.to_arg().unwrap(),
        ];
        let parsed = ServiceWorkerInfo::from_args(argv).unwrap();
        assert_eq!(parsed.worker_id, "w-1");
        assert_eq!(parsed.manager_port, Some(9394));
    }

    #[test]
    fn unix_endpoint_wins_over_tcp() {
        let info = ServiceWorkerInfo {
            service_id: "s".into(),
            worker_id: "w".into(),
            manager_host: "localhost".into(),
            manager_port: Some(9394),
            manager_unix: Some("mgr".into()),
            auth: None,
        };
        assert_eq!(info.manager_endpoint(), Endpoint::unix("mgr"));
    }
}
