use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// One remote device to exchange point values with.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    pub protocol: String, // "dnp3", "cip"
    pub id: String,
    pub target: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// One point served by a configured device. The protocol attributes go
/// into the point's attribute map verbatim.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PointConfig {
    pub name: String,
    /// Device id of the owning origin.
    pub origin: String,
    #[serde(default)]
    pub content: Option<crate::content::ContentKind>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl PointConfig {
    pub fn to_point(&self) -> crate::point::Point {
        let mut point = crate::point::Point::new(self.name.clone(), self.origin.clone());
        if let Some(content) = self.content {
            point.content = content;
        }
        point.attributes = self.attributes.clone();
        point
    }
}

/// Data-link layer tuning for framed protocols.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LinkConfig {
    /// Deadline for a link echo (ack, link status).
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Idle period after which a test frame probes the link. None
    /// disables the keepalive.
    #[serde(default, with = "humantime_serde")]
    pub keepalive: Option<Duration>,
    /// Attempts for a confirmed frame before the link is declared down.
    pub retries: u32,
    /// Spacing between confirmed-frame attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            keepalive: None,
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Application layer tuning.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApplicationConfig {
    /// Deadline for a complete response to a request fragment.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Largest application fragment assembled or emitted, in bytes.
    pub max_fragment_size: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            max_fragment_size: 2048,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SerialConfig {
    pub port_name: String,
    pub speed: u32,
    pub data_bits: u8,
    pub parity: String, // "none", "odd", "even"
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: "/dev/ttyS0".to_string(),
            speed: 9600,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
        }
    }
}

/// Global configuration for the field agent.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FieldConfig {
    /// Metadata tags identifying this agent (e.g. env=prod, site=plant-2).
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Interval between polls in daemon mode.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub points: Vec<PointConfig>,

    pub log_level: LogLevel,
}

impl Default for FieldConfig {
    fn default() -> Self {
        let mut tags = HashMap::new();
        tags.insert("env".to_string(), "dev".to_string());

        Self {
            tags,
            poll_interval: Duration::from_secs(5),
            devices: Vec::new(),
            points: Vec::new(),
            log_level: LogLevel::Info,
        }
    }
}

pub fn load_config(path: Option<PathBuf>) -> Result<FieldConfig, config::ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::Config::try_from(&FieldConfig::default())?)
        .add_source(config::Environment::with_prefix("RVPF"));

    if let Some(p) = path {
        // Only add file if it exists, otherwise ignore (optional)
        if p.exists() {
            return builder.add_source(config::File::from(p)).build()?.try_deserialize();
        }
    }

    builder
        .add_source(config::File::with_name("rvpf").required(false))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let link = LinkConfig::default();
        assert_eq!(link.timeout, Duration::from_millis(2000));
        assert_eq!(link.retries, 3);

        let app = ApplicationConfig::default();
        assert_eq!(app.timeout, Duration::from_millis(5000));
        assert_eq!(app.max_fragment_size, 2048);
    }

    #[test]
    fn device_config_deserializes_params() {
        let json = r#"{
            "protocol": "dnp3",
            "id": "rtu-7",
            "target": "10.0.4.20:20000",
            "params": { "local_addr": "1", "remote_addr": "10" }
        }"#;
        let device: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(device.protocol, "dnp3");
        assert_eq!(device.params["remote_addr"], "10");
    }
}
