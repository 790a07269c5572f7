//! gwsrv configuration
//!
//! Loaded from YAML with `GWSRV_` environment overrides, nested keys
//! separated by `__` (e.g. `GWSRV_POLLING__INTERVAL_MS=500`).
//!
//! ```yaml
//! polling:
//!   interval_ms: 1000
//! gateways:
//!   - ip: 192.168.1.100
//!     port: 502
//!     slave_ids: [1, 2]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::logging::{LogConfig, LogFormat};
use common::ServiceArgs;
use ems_modbus::constants::{FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS};
use ems_modbus::Request;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::connection::reconnect::ReconnectPolicy;
use crate::error::{GwError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/gwsrv.yaml";
pub const ENV_PREFIX: &str = "GWSRV_";

const TEMPLATE_HEADER: &str = "\
# gwsrv configuration template
#
# Each gateway is a Modbus TCP endpoint; slave_ids are the unit ids polled
# behind it. register_groups and interval_ms are optional per gateway.
# Edit the gateway list below, then restart the service.
";

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
}

/// One Modbus TCP gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub ip: String,
    pub port: u16,
    pub slave_ids: Vec<u8>,
    /// Blocks read from every slave on each tick
    #[serde(default = "default_register_groups")]
    pub register_groups: Vec<RegisterGroup>,
    /// Overrides `polling.interval_ms` for this gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

impl GatewayConfig {
    pub fn new(ip: impl Into<String>, port: u16, slave_ids: Vec<u8>) -> Self {
        Self {
            ip: ip.into(),
            port,
            slave_ids,
            register_groups: default_register_groups(),
            interval_ms: None,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Contiguous block of registers or bits read on every poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterGroup {
    pub name: String,
    /// FC01-FC04
    pub function_code: u8,
    pub address: u16,
    pub quantity: u16,
}

impl RegisterGroup {
    pub fn new(name: impl Into<String>, function_code: u8, address: u16, quantity: u16) -> Self {
        Self {
            name: name.into(),
            function_code,
            address,
            quantity,
        }
    }

    /// Validated read request for this group
    pub fn to_request(&self) -> Result<Request> {
        Request::read(self.function_code, self.address, self.quantity).map_err(|e| {
            GwError::config(format!("Register group '{}': {}", self.name, e))
        })
    }
}

fn default_register_groups() -> Vec<RegisterGroup> {
    vec![
        RegisterGroup::new("input_registers", FC_READ_INPUT_REGISTERS, 0, 4),
        RegisterGroup::new("holding_registers", FC_READ_HOLDING_REGISTERS, 0, 4),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconnect backoff, attempts are unlimited
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// 0 disables the periodic report
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

fn default_report_interval_secs() -> u64 {
    60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

impl HealthConfig {
    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}

impl AppConfig {
    /// Load from `path` plus environment overrides
    ///
    /// A missing file is replaced by a template and reported as a
    /// configuration error so the operator can fill it in. Emits no log
    /// events; it runs before the subscriber is installed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            write_template(path)?;
            return Err(GwError::config(format!(
                "{} not found; a template was written there, edit the gateway list and restart",
                path.display()
            )));
        }

        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Logger settings; `--log-level`/`RUST_LOG` and `--log-dir` win over the file
    pub fn log_config(&self, args: &ServiceArgs) -> LogConfig {
        LogConfig {
            service_name: "gwsrv".to_string(),
            filter: args.log_filter(&self.logging.level),
            format: self.logging.format,
            log_dir: args.log_dir.clone().or_else(|| self.logging.dir.clone()),
            ansi: !args.no_color,
        }
    }

    /// Check service-level settings; gateway entries are checked by the registry
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            return Err(GwError::config("polling.interval_ms must be > 0"));
        }
        if self.polling.request_timeout_ms == 0 {
            return Err(GwError::config("polling.request_timeout_ms must be > 0"));
        }
        if self.polling.connect_timeout_ms == 0 {
            return Err(GwError::config("polling.connect_timeout_ms must be > 0"));
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(GwError::config("reconnect.initial_delay_ms must be > 0"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(GwError::config(
                "reconnect.max_delay_ms must not be below reconnect.initial_delay_ms",
            ));
        }
        let multiplier = self.reconnect.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(GwError::config("reconnect.backoff_multiplier must be >= 1.0"));
        }
        for gw in &self.gateways {
            if gw.interval_ms == Some(0) {
                return Err(GwError::config(format!(
                    "Gateway {}: interval_ms must be > 0",
                    gw.endpoint()
                )));
            }
        }
        Ok(())
    }

    /// Configuration written when no file exists yet
    pub fn template() -> Self {
        Self {
            gateways: vec![GatewayConfig::new("192.168.1.100", 502, vec![1])],
            ..Default::default()
        }
    }
}

/// Write the template config, creating parent directories
pub fn write_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            GwError::config(format!("Cannot create {}: {}", parent.display(), e))
        })?;
    }

    let body = serde_yaml::to_string(&AppConfig::template())?;
    std::fs::write(path, format!("{}{}", TEMPLATE_HEADER, body))
        .map_err(|e| GwError::config(format!("Cannot write {}: {}", path.display(), e)))?;
    Ok(())
}
