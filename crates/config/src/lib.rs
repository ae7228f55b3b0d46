//! The typed participant configuration model.
//!
//! One configuration data model: [`ParticipantConfiguration`]. Every field
//! has a default matching the documented configuration surface, so an empty
//! document is a valid configuration (apart from the participant name,
//! which the facade requires).
//!
//! Parsing from richer front-ends (YAML) is an external concern; this crate
//! loads JSON documents and validates the result.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Malformed or contradictory configuration. Surfaced at construction,
/// never recoverable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level participant configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct ParticipantConfiguration {
    /// Required at participant construction; may also be supplied there.
    #[serde(default)]
    pub participant_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
    /// Per-controller configuration blocks, keyed by controller name.
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

impl ParticipantConfiguration {
    /// Load and validate a JSON configuration document.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants and normalize out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(hc) = self
            .health_check
            .soft_response_timeout_ms
            .zip(self.health_check.hard_response_timeout_ms)
        {
            if hc.0 > hc.1 {
                return Err(ConfigError::Invalid(format!(
                    "HealthCheck: SoftResponseTimeout ({}) exceeds HardResponseTimeout ({})",
                    hc.0, hc.1
                )));
            }
        }
        for controller in &self.controllers {
            if controller.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "controller with empty Name".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Find the configuration block for a controller by canonical name.
    pub fn controller(&self, name: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.name == name)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct LoggingConfig {
    /// Receive peers' log records over the bus.
    #[serde(default)]
    pub log_from_remotes: bool,
    #[serde(default = "default_flush_level")]
    pub flush_level: LogSinkLevel,
    #[serde(default)]
    pub sinks: Vec<LogSinkConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_from_remotes: false,
            flush_level: default_flush_level(),
            sinks: Vec::new(),
        }
    }
}

fn default_flush_level() -> LogSinkLevel {
    LogSinkLevel::Off
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSinkLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSinkType {
    Stdout,
    File,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct LogSinkConfig {
    #[serde(rename = "Type")]
    pub sink_type: LogSinkType,
    #[serde(default = "default_sink_level")]
    pub level: LogSinkLevel,
    /// Output file name for `File` sinks.
    #[serde(default)]
    pub log_name: Option<String>,
}

fn default_sink_level() -> LogSinkLevel {
    LogSinkLevel::Info
}

/// Hook watchdog thresholds, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct HealthCheckConfig {
    #[serde(rename = "SoftResponseTimeout")]
    #[serde(default)]
    pub soft_response_timeout_ms: Option<u64>,
    #[serde(rename = "HardResponseTimeout")]
    #[serde(default)]
    pub hard_response_timeout_ms: Option<u64>,
}

impl HealthCheckConfig {
    pub fn soft_timeout(&self) -> Option<Duration> {
        self.soft_response_timeout_ms.map(Duration::from_millis)
    }

    pub fn hard_timeout(&self) -> Option<Duration> {
        self.hard_response_timeout_ms.map(Duration::from_millis)
    }
}

/// Trace sink/source declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct TracingConfig {
    #[serde(default)]
    pub trace_sinks: Vec<TraceSinkConfig>,
    #[serde(default)]
    pub trace_sources: Vec<TraceSourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceSinkType {
    Mdf4File,
    PcapFile,
    PcapPipe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct TraceSinkConfig {
    pub name: String,
    #[serde(rename = "Type")]
    pub sink_type: TraceSinkType,
    pub output_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceSourceType {
    Mdf4File,
    PcapFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct TraceSourceConfig {
    pub name: String,
    #[serde(rename = "Type")]
    pub source_type: TraceSourceType,
    pub input_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct ExtensionsConfig {
    #[serde(default)]
    pub search_path_hints: Vec<String>,
}

/// Transport and registry options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub tcp_no_delay: bool,
    #[serde(default)]
    pub tcp_quick_ack: bool,
    #[serde(default)]
    pub tcp_receive_buffer_size: Option<usize>,
    #[serde(default)]
    pub tcp_send_buffer_size: Option<usize>,
    #[serde(default = "default_true")]
    pub enable_domain_sockets: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            tcp_no_delay: false,
            tcp_quick_ack: false,
            tcp_receive_buffer_size: None,
            tcp_send_buffer_size: None,
            enable_domain_sockets: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// How to reach the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct RegistryConfig {
    #[serde(default = "default_registry_hostname")]
    pub hostname: String,
    #[serde(default = "default_registry_port")]
    pub port: u16,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: i32,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl RegistryConfig {
    /// Dial attempts, with out-of-range values clamped to at least one.
    pub fn effective_connect_attempts(&self) -> u32 {
        self.connect_attempts.max(1) as u32
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            hostname: default_registry_hostname(),
            port: default_registry_port(),
            connect_attempts: default_connect_attempts(),
            logging: None,
        }
    }
}

fn default_registry_hostname() -> String {
    "localhost".to_string()
}

fn default_registry_port() -> u16 {
    8500
}

fn default_connect_attempts() -> i32 {
    9
}

/// Replay direction for a controller bound to a trace source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayDirection {
    Send,
    Receive,
    Both,
    #[default]
    Undefined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct ReplayConfig {
    pub use_trace_source: String,
    #[serde(default)]
    pub direction: ReplayDirection,
    #[serde(default)]
    pub mdf_channel: Option<String>,
}

/// Per-controller configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct ControllerConfig {
    pub name: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub use_trace_sinks: Vec<String>,
    #[serde(default)]
    pub replay: Option<ReplayConfig>,
    /// Messages retained for replay to late-joining peers.
    #[serde(default)]
    pub history_length: Option<u32>,
    /// FlexRay only; carried opaquely to the detailed simulator.
    #[serde(default)]
    pub cluster_parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub node_parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub tx_buffer_configurations: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ParticipantConfiguration::from_json("{}").unwrap();
        assert_eq!(config.middleware.registry.hostname, "localhost");
        assert_eq!(config.middleware.registry.port, 8500);
        assert_eq!(config.middleware.registry.connect_attempts, 9);
        assert!(config.middleware.enable_domain_sockets);
        assert!(!config.logging.log_from_remotes);
        assert_eq!(config.logging.flush_level, LogSinkLevel::Off);
    }

    #[test]
    fn full_document_round_trips() {
        let text = r#"{
            "ParticipantName": "EcuA",
            "Description": "demo node",
            "Logging": {
                "LogFromRemotes": true,
                "Sinks": [{"Type": "Stdout", "Level": "Debug"}]
            },
            "HealthCheck": {
                "SoftResponseTimeout": 500,
                "HardResponseTimeout": 5000
            },
            "Middleware": {
                "Registry": {"Hostname": "sim-host", "Port": 9500, "ConnectAttempts": 3},
                "TcpNoDelay": true
            },
            "Controllers": [
                {"Name": "CanCtrl", "Network": "CAN1", "UseTraceSinks": ["mdf"]}
            ]
        }"#;
        let config = ParticipantConfiguration::from_json(text).unwrap();
        assert_eq!(config.participant_name.as_deref(), Some("EcuA"));
        assert_eq!(config.middleware.registry.port, 9500);
        assert!(config.middleware.tcp_no_delay);
        assert_eq!(
            config.health_check.soft_timeout(),
            Some(Duration::from_millis(500))
        );
        let can = config.controller("CanCtrl").unwrap();
        assert_eq!(can.network.as_deref(), Some("CAN1"));
    }

    #[test]
    fn connect_attempts_below_one_clamps_to_one() {
        let text = r#"{"Middleware": {"Registry": {"ConnectAttempts": -2}}}"#;
        let config = ParticipantConfiguration::from_json(text).unwrap();
        assert_eq!(config.middleware.registry.effective_connect_attempts(), 1);
    }

    #[test]
    fn contradictory_health_check_rejected() {
        let text = r#"{"HealthCheck": {"SoftResponseTimeout": 5000, "HardResponseTimeout": 100}}"#;
        assert!(matches!(
            ParticipantConfiguration::from_json(text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(matches!(
            ParticipantConfiguration::from_json(r#"{"Bogus": 1}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
