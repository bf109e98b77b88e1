//! Service configuration: the worker-pool settings a manager runs
//! under, environment defaults, and tracing setup.
//!
//! Config field names are matched leniently on update: case,
//! underscores, hyphens and spaces are ignored, so `maxWorkerCount`,
//! `max-worker-count` and `max_worker_count` all address the same
//! field.

use std::path::{Path, PathBuf};
use std::sync::Once;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unknown config field `{0}`")]
    UnknownField(String),

    #[error("bad value for `{field}`: {source}")]
    BadValue {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage dir `{path}` is not usable: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerCreationStrategy {
    /// Create all workers when the service starts.
    Eager,
    /// Start small and grow by `worker_scale_up_step` on demand.
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoTerminateStrategy {
    Never,
    KillIdleImmediately,
    /// Reap idle workers only when a needed spawn fails.
    KillIdleOnResourceShortage,
}

/// Worker-pool configuration for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfigs {
    pub name: String,
    /// Unique registration id, `{name}-{random8}` when left empty.
    pub id: String,

    pub init_worker_count: u32,
    pub max_worker_count: u32,
    pub worker_restart_delay_secs: f64,
    /// `eager` ignores `init_worker_count` and starts the full pool.
    pub worker_creation_strategy: WorkerCreationStrategy,
    pub worker_scale_up_step: u32,
    pub worker_startup_timeout_secs: f64,
    /// Additional start attempts after a failed spawn. 0 means one try.
    pub worker_startup_try_count: u32,
    /// A worker with no task for this long counts as idle.
    pub worker_idle_timeout_secs: f64,
    pub worker_auto_terminate_strategy: AutoTerminateStrategy,

    /// Default concurrent task cap per endpoint. None means unlimited.
    pub default_max_task_count: Option<u32>,
    pub default_worker_max_task_count: Option<u32>,
    pub default_handle_timeout_secs: Option<f64>,
    /// Batching kicks in above 1.
    pub default_batch_size: u32,
    pub default_batch_interval_ms: u64,
    /// None falls back to `handle_timeout_secs * batch_size`.
    pub default_batch_handle_timeout_secs: Option<f64>,

    /// GPU ids exported to workers as `CUDA_VISIBLE_DEVICES`. Opaque to
    /// the runtime.
    pub visible_gpus: Option<Vec<u32>>,
}

impl Default for ServiceConfigs {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: String::new(),
            init_worker_count: 1,
            max_worker_count: 1,
            worker_restart_delay_secs: 0.0,
            worker_creation_strategy: WorkerCreationStrategy::Eager,
            worker_scale_up_step: 1,
            worker_startup_timeout_secs: 180.0,
            worker_startup_try_count: 1,
            worker_idle_timeout_secs: 180.0,
            worker_auto_terminate_strategy: AutoTerminateStrategy::KillIdleOnResourceShortage,
            default_max_task_count: None,
            default_worker_max_task_count: None,
            default_handle_timeout_secs: Some(180.0),
            default_batch_size: 10,
            default_batch_interval_ms: 500,
            default_batch_handle_timeout_secs: None,
            visible_gpus: None,
        }
    }
}

impl ServiceConfigs {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("{name}-{}", random_id(8)),
            name,
            ..Self::default()
        }
    }

    /// Fatal-at-startup validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("service name is empty".into()));
        }
        if self.max_worker_count == 0 {
            return Err(ConfigError::Invalid("max_worker_count must be >= 1".into()));
        }
        if self.init_worker_count > self.max_worker_count {
            return Err(ConfigError::Invalid(format!(
                "init_worker_count ({}) exceeds max_worker_count ({})",
                self.init_worker_count, self.max_worker_count
            )));
        }
        if self.worker_scale_up_step == 0 {
            return Err(ConfigError::Invalid("worker_scale_up_step must be >= 1".into()));
        }
        for (field, value) in [
            ("worker_startup_timeout_secs", self.worker_startup_timeout_secs),
            ("worker_idle_timeout_secs", self.worker_idle_timeout_secs),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::Invalid(format!("{field} must be positive")));
            }
        }
        Ok(())
    }

    /// Apply a partial update, returning the names of fields that
    /// actually changed. Keys are matched leniently; `name` and `id`
    /// are fixed at registration and cannot be patched.
    pub fn update(
        &mut self,
        patch: &serde_json::Map<String, Value>,
    ) -> Result<Vec<&'static str>, ConfigError> {
        let mut changed = Vec::new();
        for (key, value) in patch {
            let Some(field) = Self::tidy_field_name(key) else {
                return Err(ConfigError::UnknownField(key.clone()));
            };
            if matches!(field, "name" | "id") {
                continue;
            }
            if self.apply_field(field, value)? {
                changed.push(field);
            }
        }
        Ok(changed)
    }

    /// Resolve a leniently spelled key to the canonical field name.
    pub fn tidy_field_name(key: &str) -> Option<&'static str> {
        let simple = simplify_name(key);
        FIELD_NAMES
            .iter()
            .copied()
            .find(|f| simplify_name(f) == simple)
    }

    fn apply_field(&mut self, field: &'static str, value: &Value) -> Result<bool, ConfigError> {
        macro_rules! set {
            ($slot:expr) => {{
                let new = serde_json::from_value(value.clone())
                    .map_err(|source| ConfigError::BadValue { field, source })?;
                let changed = $slot != new;
                $slot = new;
                Ok(changed)
            }};
        }
        match field {
            "init_worker_count" => set!(self.init_worker_count),
            "max_worker_count" => set!(self.max_worker_count),
            "worker_restart_delay_secs" => set!(self.worker_restart_delay_secs),
            "worker_creation_strategy" => set!(self.worker_creation_strategy),
            "worker_scale_up_step" => set!(self.worker_scale_up_step),
            "worker_startup_timeout_secs" => set!(self.worker_startup_timeout_secs),
            "worker_startup_try_count" => set!(self.worker_startup_try_count),
            "worker_idle_timeout_secs" => set!(self.worker_idle_timeout_secs),
            "worker_auto_terminate_strategy" => set!(self.worker_auto_terminate_strategy),
            "default_max_task_count" => set!(self.default_max_task_count),
            "default_worker_max_task_count" => set!(self.default_worker_max_task_count),
            "default_handle_timeout_secs" => set!(self.default_handle_timeout_secs),
            "default_batch_size" => set!(self.default_batch_size),
            "default_batch_interval_ms" => set!(self.default_batch_interval_ms),
            "default_batch_handle_timeout_secs" => set!(self.default_batch_handle_timeout_secs),
            "visible_gpus" => set!(self.visible_gpus),
            _ => Err(ConfigError::UnknownField(field.to_owned())),
        }
    }
}

const FIELD_NAMES: &[&str] = &[
    "name",
    "id",
    "init_worker_count",
    "max_worker_count",
    "worker_restart_delay_secs",
    "worker_creation_strategy",
    "worker_scale_up_step",
    "worker_startup_timeout_secs",
    "worker_startup_try_count",
    "worker_idle_timeout_secs",
    "worker_auto_terminate_strategy",
    "default_max_task_count",
    "default_worker_max_task_count",
    "default_handle_timeout_secs",
    "default_batch_size",
    "default_batch_interval_ms",
    "default_batch_handle_timeout_secs",
    "visible_gpus",
];

fn simplify_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Random alphanumeric suffix for service ids.
pub fn random_id(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Process-level defaults resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct Environment {
    pub host: String,
    pub port: u16,
    pub auth: Option<String>,
    pub log_directives: String,
    pub storage_dir: PathBuf,
}

impl Environment {
    pub const DEFAULT_PORT: u16 = 9394;

    /// Read `SWARM_HOST`, `SWARM_PORT`, `SWARM_AUTH`, `SWARM_LOG` and
    /// `SWARM_STORAGE_DIR`, falling back to built-in defaults. The
    /// storage dir is created and checked for writability.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("SWARM_HOST").unwrap_or_else(|_| "localhost".to_owned());
        let port = std::env::var("SWARM_PORT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(Self::DEFAULT_PORT);
        let auth = std::env::var("SWARM_AUTH").ok().filter(|v| !v.is_empty());
        let log_directives = std::env::var("SWARM_LOG").unwrap_or_else(|_| "info".to_owned());
        let storage_dir = match std::env::var("SWARM_STORAGE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir()
                .map_err(|source| ConfigError::Storage {
                    path: PathBuf::from("."),
                    source,
                })?
                .join(".swarm_storage"),
        };
        ensure_writable_dir(&storage_dir)?;
        Ok(Self {
            host,
            port,
            auth,
            log_directives,
            storage_dir,
        })
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.storage_dir.join("temp")
    }
}

/// Create the directory when missing and prove it is writable.
pub fn ensure_writable_dir(path: &Path) -> Result<(), ConfigError> {
    let err = |source| ConfigError::Storage {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(path).map_err(err)?;
    let probe = path.join(".write_probe");
    std::fs::write(&probe, b"").map_err(err)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

static INIT_TRACING: Once = Once::new();

/// Install the global subscriber: `RUST_LOG` wins, then the given
/// directives. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(directives: &str) {
    let directives = directives.to_owned();
    INIT_TRACING.call_once(move || {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
