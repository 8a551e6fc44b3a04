//! Service configuration
//!
//! Loaded with `figment` from a YAML/TOML/JSON file (picked by extension) and
//! merged with `MBSRV_`-prefixed environment variables, using `__` between
//! sections (`MBSRV_SERVER__PORT=5020`). Every field has a default, so an
//! empty or missing file still yields a runnable configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::point_map::DataType;
use crate::store::{Table, MAX_TABLE_SIZE};

/// Default Modbus TCP port
pub const DEFAULT_MODBUS_PORT: u16 = 502;
/// Default HTTP API port
pub const DEFAULT_API_PORT: u16 = 6020;
/// Environment variable prefix
pub const ENV_PREFIX: &str = "MBSRV_";

// ============================================================================
// Sections
// ============================================================================

/// Modbus TCP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Close a connection after this many seconds without bytes (0 = never)
    pub idle_timeout_secs: u64,
    /// Concurrent connection cap, extra connections are closed on accept
    pub max_connections: usize,
    /// Time granted to in-flight transactions when stopping
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_MODBUS_PORT,
            idle_timeout_secs: 300,
            max_connections: 64,
            shutdown_grace_ms: 2000,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::invalid("server.host", format!("{}", e)))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Register memory dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub input_registers: usize,
    pub holding_registers: usize,
    /// Initial value of every address (bit tables store `value != 0`)
    pub default_value: u16,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            coils: MAX_TABLE_SIZE,
            discrete_inputs: MAX_TABLE_SIZE,
            input_registers: MAX_TABLE_SIZE,
            holding_registers: MAX_TABLE_SIZE,
            default_value: 0,
        }
    }
}

impl MemoryConfig {
    pub fn size(&self, table: Table) -> usize {
        match table {
            Table::Coils => self.coils,
            Table::DiscreteInputs => self.discrete_inputs,
            Table::InputRegisters => self.input_registers,
            Table::HoldingRegisters => self.holding_registers,
        }
    }
}

fn default_length() -> u16 {
    1
}

fn default_data_type() -> DataType {
    DataType::U16
}

/// One named point as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    pub name: String,
    pub table: Table,
    #[serde(alias = "address")]
    pub start_address: u16,
    #[serde(default = "default_length")]
    pub length: u16,
    #[serde(default = "default_data_type")]
    pub data_type: DataType,
}

/// HTTP write policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Allow HTTP writes into discrete inputs and input registers
    pub http_write_inputs: bool,
}

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Consecutive restart attempts before giving up (0 = unlimited)
    pub max_retries: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 5,
            max_retries: 3,
        }
    }
}

/// Driver lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Start the Modbus server as soon as the service is up
    pub auto_start: bool,
    /// Reset register memory on restart instead of keeping it
    pub reset_on_restart: bool,
    pub watchdog: WatchdogConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            reset_on_restart: false,
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// HTTP control plane listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_API_PORT,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub memory: MemoryConfig,
    pub points: Vec<PointConfig>,
    pub policy: PolicyConfig,
    pub lifecycle: LifecycleConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from an optional file plus environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Load(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| ConfigError::Load("invalid file extension".to_string()))?;

            figment = match extension {
                "json" => figment.merge(Json::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                other => {
                    return Err(ConfigError::Load(format!(
                        "unsupported config format: {}",
                        other
                    )))
                },
            };
            info!("Loading configuration from {}", path.display());
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;

        debug!(
            "Configuration loaded: modbus={}:{} points={}",
            config.server.host,
            config.server.port,
            config.points.len()
        );
        Ok(config)
    }

    /// Range checks that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        for table in Table::ALL {
            let size = self.memory.size(table);
            if size == 0 || size > MAX_TABLE_SIZE {
                return Err(ConfigError::invalid(
                    format!("memory.{}", table),
                    format!("size {} outside 1..={}", size, MAX_TABLE_SIZE),
                ));
            }
        }
        self.server.socket_addr()?;
        if self.server.max_connections == 0 {
            return Err(ConfigError::invalid(
                "server.max_connections",
                "must be at least 1",
            ));
        }
        if self.lifecycle.watchdog.enabled && self.lifecycle.watchdog.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "lifecycle.watchdog.interval_secs",
                "must be at least 1",
            ));
        }
        if self.api.port == 0 {
            return Err(ConfigError::invalid("api.port", "must not be 0"));
        }
        Ok(())
    }

    /// Render the effective configuration (used by `--validate`)
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Load(e.to_string()))
    }
}
