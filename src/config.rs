//! Sink Server Configuration
//!
//! Configuration is loaded from environment variables, or from a TOML file
//! with the same structure.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | SENSOR_KIND | noise | noise or thermometer |
//! | SINK_LISTEN_ADDR | 0.0.0.0:9321 | Address sensors connect to |
//! | SINK_WINDOW_MS | 30000 | Time budget of a window |
//! | SINK_BATCH_SIZE | 1000 | Count budget of a window |
//! | SINK_OVERFLOW | block | block or drop_newest |
//! | INFLUXDB_URL | http://localhost:8086 | InfluxDB endpoint |
//! | INFLUXDB_ORG | yomo | Organization |
//! | INFLUXDB_BUCKET | noise / thermometer | Bucket (defaults per kind) |
//! | INFLUXDB_TOKEN | - | API token (required) |
//! | LOG_FORMAT | pretty | pretty or json |
//! | RUST_LOG | info | tracing filter |
//!
//! Empty values are treated as unset.

use crate::frame::DEFAULT_OBSERVE_TAG;
use crate::queue::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9321";
pub const DEFAULT_INFLUXDB_URL: &str = "http://localhost:8086";
pub const DEFAULT_INFLUXDB_ORG: &str = "yomo";
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Error type for configuration loading and validation
#[derive(Debug)]
pub enum ConfigError {
    /// INFLUXDB_TOKEN not set; the process must not start
    MissingToken,
    /// A value is present but unusable
    Invalid(String),
    /// TOML could not be parsed
    Parse(String),
    /// Config file could not be read
    Io(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingToken => {
                write!(f, "please set the token in env INFLUXDB_TOKEN")
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
            ConfigError::Parse(msg) => write!(f, "failed to parse configuration: {}", msg),
            ConfigError::Io(e) => write!(f, "failed to read configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Measurement kind served by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[default]
    Noise,
    Thermometer,
}

impl SensorKind {
    /// Bucket used when none is configured
    pub fn default_bucket(&self) -> &'static str {
        match self {
            SensorKind::Noise => "noise",
            SensorKind::Thermometer => "thermometer",
        }
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "noise" => Ok(SensorKind::Noise),
            "thermometer" => Ok(SensorKind::Thermometer),
            other => Err(format!("unknown sensor kind '{}'", other)),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter used when RUST_LOG is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

/// Windowing and queueing for one pipeline instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Time budget of a window (default: 30s)
    #[serde(with = "duration_millis")]
    pub window: Duration,
    /// Count budget of a window (default: 1000)
    pub max_records: usize,
    /// Capacity of the fan-in queue between readers and the aggregator
    pub record_queue_capacity: usize,
    /// Capacity of the queue between the aggregator and the writer
    pub batch_queue_capacity: usize,
    /// What readers do when the fan-in queue is full
    pub overflow: OverflowPolicy,
    /// Frame tag carrying measurements
    pub observe_tag: u8,
    /// Capacity of the write error queue
    pub error_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            window: DEFAULT_WINDOW,
            max_records: DEFAULT_BATCH_SIZE,
            record_queue_capacity: 10_000,
            batch_queue_capacity: 16,
            overflow: OverflowPolicy::Block,
            observe_tag: DEFAULT_OBSERVE_TAG,
            error_queue_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    /// Small windows and queues for tests
    pub fn test() -> Self {
        PipelineConfig {
            window: Duration::from_secs(30),
            max_records: 3,
            record_queue_capacity: 64,
            batch_queue_capacity: 4,
            overflow: OverflowPolicy::Block,
            observe_tag: DEFAULT_OBSERVE_TAG,
            error_queue_capacity: 16,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::Invalid("window must be non-zero".to_string()));
        }
        if self.max_records == 0 {
            return Err(ConfigError::Invalid("max_records must be positive".to_string()));
        }
        if self.record_queue_capacity == 0
            || self.batch_queue_capacity == 0
            || self.error_queue_capacity == 0
        {
            return Err(ConfigError::Invalid("queue capacities must be positive".to_string()));
        }
        Ok(())
    }
}

/// InfluxDB v2 connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    /// Empty means the sensor kind's default bucket
    pub bucket: String,
    pub token: String,
    /// Lines buffered by the sink before it flushes on its own. Unset means
    /// `pipeline.max_records`, so a window never splits across requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_buffered_lines: Option<usize>,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        InfluxConfig {
            url: DEFAULT_INFLUXDB_URL.to_string(),
            org: DEFAULT_INFLUXDB_ORG.to_string(),
            bucket: String::new(),
            token: String::new(),
            max_buffered_lines: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the binary needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkServerConfig {
    pub kind: SensorKind,
    pub listen_addr: String,
    pub influx: InfluxConfig,
    pub pipeline: PipelineConfig,
    pub log: LogConfig,
}

impl Default for SinkServerConfig {
    fn default() -> Self {
        SinkServerConfig {
            kind: SensorKind::Noise,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            influx: InfluxConfig::default(),
            pipeline: PipelineConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SinkServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = SinkServerConfig::default();

        if let Some(kind) = get("SENSOR_KIND") {
            config.kind = kind.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(addr) = get("SINK_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(ms) = get("SINK_WINDOW_MS") {
            config.pipeline.window = Duration::from_millis(parse_number("SINK_WINDOW_MS", &ms)?);
        }
        if let Some(size) = get("SINK_BATCH_SIZE") {
            config.pipeline.max_records = parse_number("SINK_BATCH_SIZE", &size)? as usize;
        }
        if let Some(policy) = get("SINK_OVERFLOW") {
            config.pipeline.overflow = policy.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(url) = get("INFLUXDB_URL") {
            config.influx.url = url;
        }
        if let Some(org) = get("INFLUXDB_ORG") {
            config.influx.org = org;
        }
        if let Some(bucket) = get("INFLUXDB_BUCKET") {
            config.influx.bucket = bucket;
        }
        if let Some(token) = get("INFLUXDB_TOKEN") {
            config.influx.token = token;
        }
        if let Some(format) = get("LOG_FORMAT") {
            config.log.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => {
                    return Err(ConfigError::Invalid(format!("unknown log format '{}'", other)))
                }
            };
        }

        config.apply_defaults();
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let mut config: SinkServerConfig =
            toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_defaults();
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Fatal startup checks. A missing token aborts before anything listens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.influx.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_addr must be set".to_string()));
        }
        if let Some(lines) = self.influx.max_buffered_lines {
            // A smaller sink buffer splits one window into several requests
            if lines < self.pipeline.max_records {
                return Err(ConfigError::Invalid(format!(
                    "influx.max_buffered_lines ({}) is below pipeline.max_records ({})",
                    lines, self.pipeline.max_records
                )));
            }
        }
        self.pipeline.validate()
    }

    fn apply_defaults(&mut self) {
        if self.influx.bucket.trim().is_empty() {
            self.influx.bucket = self.kind.default_bucket().to_string();
        }
        if self.influx.max_buffered_lines.is_none() {
            self.influx.max_buffered_lines = Some(self.pipeline.max_records);
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} must be a number, got '{}'", key, value)))
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
