// Channel configuration: defaults, JSON file, environment and launcher arguments.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SHARED_MEMORY_NAME: &str = "WidgetRenderSharedMemory";
pub const DEFAULT_PIPE_NAME: &str = "WidgetRenderPipe";

const APP_DIR: &str = "WidgetRenderChannel";
const CONFIG_FILE: &str = "channel.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which transports a channel end brings up.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    SharedMemory,
    NamedPipe,
    #[default]
    Hybrid,
}

impl TransportMode {
    pub fn uses_shared_memory(self) -> bool {
        matches!(self, TransportMode::SharedMemory | TransportMode::Hybrid)
    }

    pub fn uses_pipe(self) -> bool {
        matches!(self, TransportMode::NamedPipe | TransportMode::Hybrid)
    }
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "sharedmemory" | "shm" => Ok(TransportMode::SharedMemory),
            "namedpipe" | "pipe" | "pipes" | "namedpipes" => Ok(TransportMode::NamedPipe),
            "hybrid" => Ok(TransportMode::Hybrid),
            _ => Err(ConfigError::InvalidValue {
                key: "mode".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    pub shared_memory_name: String,
    pub pipe_name: String,
    pub mode: TransportMode,
    /// Bound on every shared-memory mutex acquisition.
    pub lock_timeout_ms: u64,
    /// How long the listener waits on the command event per iteration.
    pub listen_wait_ms: u64,
    /// How long the dispatch loop waits on the queue signal per iteration.
    pub dispatch_wait_ms: u64,
    pub connect_timeout_ms: u64,
    /// Hard ceiling on stop before handles are released regardless.
    pub stop_timeout_ms: u64,
    /// Default wait for a correlated result on the orchestrator side.
    pub command_timeout_ms: u64,
    pub error_backoff_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            shared_memory_name: DEFAULT_SHARED_MEMORY_NAME.to_string(),
            pipe_name: DEFAULT_PIPE_NAME.to_string(),
            mode: TransportMode::Hybrid,
            lock_timeout_ms: 5000,
            listen_wait_ms: 1000,
            dispatch_wait_ms: 1000,
            connect_timeout_ms: 5000,
            stop_timeout_ms: 5000,
            command_timeout_ms: 5000,
            error_backoff_ms: 100,
            reconnect_backoff_ms: 500,
            queue_capacity: 256,
        }
    }
}

impl ChannelConfig {
    /// Defaults with object names no other channel is using.
    pub fn unique(prefix: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            shared_memory_name: format!("{}Shm{}", prefix, id),
            pipe_name: format!("{}Pipe{}", prefix, id),
            ..Self::default()
        }
    }

    /// `<config_dir>/WidgetRenderChannel/channel.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: ChannelConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Read `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => Self::from_json_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save_json_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Defaults overridden by the `RENDER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = var("RENDER_SHARED_MEMORY") {
            self.shared_memory_name = name;
        }
        if let Some(name) = var("RENDER_PIPE") {
            self.pipe_name = name;
        }
        if let Some(mode) = var("RENDER_TRANSPORT_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(value) = var("RENDER_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = parse_number("RENDER_LOCK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("RENDER_QUEUE_CAPACITY") {
            self.queue_capacity = parse_number("RENDER_QUEUE_CAPACITY", &value)?;
        }
        Ok(())
    }

    /// Apply `--shared-memory=<name>` and `--named-pipe=<name>`; other arguments are ignored.
    pub fn apply_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            let arg = arg.as_ref();
            if let Some(name) = arg.strip_prefix("--shared-memory=") {
                self.shared_memory_name = name.to_string();
            } else if let Some(name) = arg.strip_prefix("--named-pipe=") {
                self.pipe_name = name.to_string();
            }
        }
    }

    /// Arguments that make a launched worker attach to this channel.
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            format!("--shared-memory={}", self.shared_memory_name),
            format!("--named-pipe={}", self.pipe_name),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode.uses_shared_memory() && self.shared_memory_name.trim().is_empty() {
            return Err(ConfigError::Invalid("shared_memory_name is empty".to_string()));
        }
        if self.mode.uses_pipe() && self.pipe_name.trim().is_empty() {
            return Err(ConfigError::Invalid("pipe_name is empty".to_string()));
        }

        let timeouts = [
            ("lock_timeout_ms", self.lock_timeout_ms),
            ("listen_wait_ms", self.listen_wait_ms),
            ("dispatch_wait_ms", self.dispatch_wait_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
        ];
        if let Some((key, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", key)));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn listen_wait(&self) -> Duration {
        Duration::from_millis(self.listen_wait_ms)
    }

    pub fn dispatch_wait(&self) -> Duration {
        Duration::from_millis(self.dispatch_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
