//! Configuration vault – reads/writes `~/.weighbridge/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use weighbridge_kernel::{HostnameMatch, StabilityConfig};
use weighbridge_runtime::{EngineConfig, MonitorConfig};
use weighbridge_types::{NewStation, WeightUnit};

/// Database path that keeps stations in memory only.
pub const IN_MEMORY_DB: &str = ":memory:";

/// Persisted configuration stored in `~/.weighbridge/config.toml`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SQLite file holding registered stations.  Defaults to
    /// `~/.weighbridge/stations.db`; `":memory:"` disables persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub monitor: MonitorSection,

    #[serde(default)]
    pub access: AccessSection,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Stations registered at startup unless one with the same id exists.
    #[serde(default)]
    pub stations: Vec<NewStation>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("engine", &self.engine)
            .field("monitor", &self.monitor)
            .field("access", &self.access)
            .field("db_path", &self.db_path)
            .field("devices", &self.devices)
            .field("stations", &self.stations.len())
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP/WebSocket port of the cockpit.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Required by station registration writes.  Empty disables them.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_token: String,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field(
                "admin_token",
                if self.admin_token.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            admin_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub command_timeout_ms: u64,
    pub sample_interval_ms: u64,
    pub queue_depth: usize,
    /// Events buffered per device before slow subscribers resync.
    pub event_capacity: usize,
    pub stability: StabilityConfig,
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            command_timeout_ms: engine.command_timeout.as_millis() as u64,
            sample_interval_ms: engine.sample_interval.as_millis() as u64,
            queue_depth: engine.queue_depth,
            event_capacity: weighbridge_middleware::DEFAULT_CAPACITY,
            stability: engine.stability,
        }
    }
}

impl EngineSection {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            command_timeout: Duration::from_millis(self.command_timeout_ms.max(1)),
            sample_interval: Duration::from_millis(self.sample_interval_ms.max(1)),
            queue_depth: self.queue_depth.max(1),
            stability: self.stability,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub enabled: bool,
    pub probe_interval_ms: u64,
    pub failure_threshold: u32,
    pub max_backoff_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let monitor = MonitorConfig::default();
        Self {
            enabled: true,
            probe_interval_ms: monitor.probe_interval.as_millis() as u64,
            failure_threshold: monitor.failure_threshold,
            max_backoff_ms: monitor.max_backoff.as_millis() as u64,
        }
    }
}

impl MonitorSection {
    /// `None` when probing is disabled.
    pub fn to_monitor_config(&self) -> Option<MonitorConfig> {
        self.enabled.then(|| MonitorConfig {
            probe_interval: Duration::from_millis(self.probe_interval_ms.max(1)),
            failure_threshold: self.failure_threshold.max(1),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.probe_interval_ms)),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSection {
    pub hostname_match: HostnameMatch,
}

/// Which [`weighbridge_hal::HardwareLink`] drives a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    Sim,
    Tcp,
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Driver::Sim => write!(f, "sim"),
            Driver::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub driver: Driver,
    /// `host:port` of the indicator; required by the `tcp` driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_rated_capacity")]
    pub rated_capacity: f64,
    #[serde(default)]
    pub unit: WeightUnit,
    /// Simulated load on the platform (`sim` only).
    #[serde(default)]
    pub load: f64,
    /// Simulated peak-to-peak jitter (`sim` only).
    #[serde(default)]
    pub noise: f64,
}

impl DeviceConfig {
    pub fn sim(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            driver: Driver::Sim,
            address: None,
            seed: 0,
            rated_capacity: default_rated_capacity(),
            unit: WeightUnit::default(),
            load: 0.0,
            noise: 0.0,
        }
    }
}

fn default_port() -> u16 {
    weighbridge_cockpit::DEFAULT_PORT
}
fn default_rated_capacity() -> f64 {
    60_000.0
}

impl Config {
    /// Configuration written on first run: one simulated scale reachable
    /// from this machine.
    pub fn first_run() -> Self {
        let mut device = DeviceConfig::sim("SIM-01");
        device.seed = 7;
        device.noise = 0.4;
        Self {
            devices: vec![device],
            stations: vec![
                NewStation::new("Simulated scale")
                    .with_id("SIM-01")
                    .with_location("localhost")
                    .allow_ip("127.0.0.1"),
            ],
            ..Self::default()
        }
    }

    /// Where the station database lives, relative to the config directory
    /// unless configured explicitly.
    pub fn resolved_db_path(&self, config_dir: &Path) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| config_dir.join("stations.db"))
    }
}

/// Return the path to `~/.weighbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".weighbridge").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    Ok(load_from(&config_path())?.map(|mut cfg| {
        apply_env_overrides(&mut cfg);
        cfg
    }))
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `WEIGHBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `WEIGHBRIDGE_PORT` | `server.port` |
/// | `WEIGHBRIDGE_ADMIN_TOKEN` | `server.admin_token` |
/// | `WEIGHBRIDGE_DB_PATH` | `db_path` |
/// | `WEIGHBRIDGE_HOSTNAME_MATCH` | `access.hostname_match` (`substring` or `exact`) |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("WEIGHBRIDGE_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.server.port = port;
    }
    if let Ok(v) = std::env::var("WEIGHBRIDGE_ADMIN_TOKEN") {
        cfg.server.admin_token = v;
    }
    if let Ok(v) = std::env::var("WEIGHBRIDGE_DB_PATH")
        && !v.is_empty()
    {
        cfg.db_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("WEIGHBRIDGE_HOSTNAME_MATCH") {
        match v.trim().to_ascii_lowercase().as_str() {
            "exact" => cfg.access.hostname_match = HostnameMatch::Exact,
            "substring" => cfg.access.hostname_match = HostnameMatch::Substring,
            _ => {}
        }
    }
}

/// Save the config to disk, creating `~/.weighbridge/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write; the file may hold the admin token.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
