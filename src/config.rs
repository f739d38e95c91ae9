//! Configuration for the exception reporter
//!
//! [`Config`] is built once at start-up and shared read-only (`Arc<Config>`)
//! between the middleware, the leveled API and the delivery worker. It can be
//! assembled from a free-form argument map, where every key the reporter does
//! not recognize becomes an extra field on each outgoing record, or loaded
//! fail-soft from environment variables.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ReportError;
use crate::utils::local_hostname;

pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_PORT: u16 = 12201;
pub const DEFAULT_FACILITY: &str = "graylog_exceptions";
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
/// Largest delivery queue accepted; larger values are rejected or clamped
pub const MAX_QUEUE_CAPACITY: usize = 1_000_000;

/// Record fields that callers may not override through the argument map.
const RESERVED_RECORD_FIELDS: &[&str] = &["host", "short_message", "full_message", "file", "line"];

/// Severity level, syslog ordinals (lower is more severe)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Informational = 6,
    Debug = 7,
}

impl Level {
    pub fn from_ordinal(n: u8) -> Option<Self> {
        Some(match n {
            0 => Level::Emergency,
            1 => Level::Alert,
            2 => Level::Critical,
            3 => Level::Error,
            4 => Level::Warning,
            5 => Level::Notice,
            6 => Level::Informational,
            7 => Level::Debug,
            _ => return None,
        })
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Emergency => "emergency",
            Level::Alert => "alert",
            Level::Critical => "critical",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Notice => "notice",
            Level::Informational => "info",
            Level::Debug => "debug",
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::Error
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Level::from_ordinal(n)
                .ok_or_else(|| ReportError::InvalidConfig(format!("level out of range: {n}")));
        }
        match s.to_lowercase().as_str() {
            "emergency" | "emerg" => Ok(Level::Emergency),
            "alert" => Ok(Level::Alert),
            "critical" | "crit" | "fatal" => Ok(Level::Critical),
            "error" | "err" => Ok(Level::Error),
            "warning" | "warn" => Ok(Level::Warning),
            "notice" => Ok(Level::Notice),
            "informational" | "info" => Ok(Level::Informational),
            "debug" => Ok(Level::Debug),
            other => Err(ReportError::InvalidConfig(format!("unknown level: {other}"))),
        }
    }
}

impl Serialize for Level {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.ordinal())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u8::deserialize(deserializer)?;
        Level::from_ordinal(n).ok_or_else(|| D::Error::custom(format!("level out of range: {n}")))
    }
}

/// Maximum GELF datagram size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    /// 1420 bytes, safe across the internet
    Wan,
    /// 8154 bytes, for local networks
    Lan,
    Bytes(usize),
}

impl ChunkSize {
    /// Header bytes of every GELF chunk (magic, message id, sequence, count)
    pub const HEADER_LEN: usize = 12;

    pub fn bytes(self) -> usize {
        match self {
            ChunkSize::Wan => 1420,
            ChunkSize::Lan => 8154,
            ChunkSize::Bytes(n) => n,
        }
    }

    /// Payload bytes available in one chunk after the header
    pub fn payload_len(self) -> usize {
        self.bytes().saturating_sub(Self::HEADER_LEN)
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::Lan
    }
}

impl FromStr for ChunkSize {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "WAN" => Ok(ChunkSize::Wan),
            "LAN" => Ok(ChunkSize::Lan),
            other => {
                let n = other
                    .parse::<usize>()
                    .map_err(|_| ReportError::InvalidConfig(format!("unknown chunk size: {s}")))?;
                ChunkSize::try_bytes(n)
            }
        }
    }
}

impl ChunkSize {
    fn try_bytes(n: usize) -> Result<Self, ReportError> {
        if n <= Self::HEADER_LEN {
            return Err(ReportError::InvalidConfig(format!(
                "chunk size must exceed the {}-byte chunk header, got {n}",
                Self::HEADER_LEN
            )));
        }
        Ok(ChunkSize::Bytes(n))
    }
}

/// Wire transport used by the bundled notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Udp,
    Http,
}

impl FromStr for Transport {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "http" => Ok(Transport::Http),
            other => Err(ReportError::InvalidConfig(format!("unknown transport: {other}"))),
        }
    }
}

/// How the `current_user` environment entry is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserFormat {
    /// Only the user's `id`
    #[default]
    Identifier,
    /// The whole value as JSON
    Full,
}

impl FromStr for UserFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "identifier" | "id" => Ok(UserFormat::Identifier),
            "full" => Ok(UserFormat::Full),
            other => Err(ReportError::InvalidConfig(format!("unknown user format: {other}"))),
        }
    }
}

/// Delivery configuration shared by every report
#[derive(Debug, Clone)]
pub struct Config {
    /// Graylog host
    pub hostname: String,

    /// Graylog GELF input port
    pub port: u16,

    /// Value of the `host` field on every record
    pub local_app_name: String,

    pub facility: String,

    pub max_chunk_size: ChunkSize,

    /// Level used when the caller does not pick one
    pub level: Level,

    /// Test mode: leveled calls return the report as an error instead of delivering it
    pub raise_on_report: bool,

    pub transport: Transport,

    /// Records held by the delivery queue before new ones are dropped
    pub queue_capacity: usize,

    pub user_format: UserFormat,

    /// Environment keys copied verbatim into each record's extra fields
    pub passthrough_keys: Vec<String>,

    /// Unrecognized configuration keys, merged into every record
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            local_app_name: local_hostname(),
            facility: DEFAULT_FACILITY.to_string(),
            max_chunk_size: ChunkSize::default(),
            level: Level::default(),
            raise_on_report: false,
            transport: Transport::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            user_format: UserFormat::default(),
            passthrough_keys: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl Config {
    /// Create configuration pointing at an explicit backend
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ..Self::default()
        }
    }

    /// Build configuration from a free-form argument map
    ///
    /// Recognized keys set the typed fields; a `null` value keeps the default.
    /// Every other key is validated as a GELF additional-field name and kept
    /// as an extra field.
    pub fn from_args(args: Map<String, Value>) -> Result<Self, ReportError> {
        let mut config = Self::default();

        for (key, value) in args {
            if value.is_null() {
                continue;
            }
            match key.as_str() {
                "hostname" => config.hostname = expect_string(&key, &value)?,
                "port" => {
                    let port = expect_number(&key, &value)?;
                    config.port = u16::try_from(port)
                        .map_err(|_| ReportError::InvalidConfig(format!("port out of range: {port}")))?;
                }
                "local_app_name" => config.local_app_name = expect_string(&key, &value)?,
                "facility" => config.facility = expect_string(&key, &value)?,
                "max_chunk_size" => {
                    config.max_chunk_size = match &value {
                        Value::Number(_) => ChunkSize::try_bytes(expect_number(&key, &value)? as usize)?,
                        _ => expect_string(&key, &value)?.parse()?,
                    }
                }
                "level" => {
                    config.level = match &value {
                        Value::Number(_) => {
                            let n = expect_number(&key, &value)?;
                            u8::try_from(n)
                                .ok()
                                .and_then(Level::from_ordinal)
                                .ok_or_else(|| ReportError::InvalidConfig(format!("level out of range: {n}")))?
                        }
                        _ => expect_string(&key, &value)?.parse()?,
                    }
                }
                "raise_on_report" => {
                    config.raise_on_report = value.as_bool().ok_or_else(|| {
                        ReportError::InvalidConfig(format!("{key} must be a boolean"))
                    })?
                }
                "transport" => config.transport = expect_string(&key, &value)?.parse()?,
                "queue_capacity" => {
                    let capacity = expect_number(&key, &value)?;
                    if capacity == 0 || capacity > MAX_QUEUE_CAPACITY as u64 {
                        return Err(ReportError::InvalidConfig(format!(
                            "queue_capacity must be between 1 and {MAX_QUEUE_CAPACITY}, got {capacity}"
                        )));
                    }
                    config.queue_capacity = capacity as usize;
                }
                "user_format" => config.user_format = expect_string(&key, &value)?.parse()?,
                "passthrough_keys" => {
                    let keys = value.as_array().ok_or_else(|| {
                        ReportError::InvalidConfig(format!("{key} must be an array of strings"))
                    })?;
                    config.passthrough_keys = keys
                        .iter()
                        .map(|k| expect_string(&key, k))
                        .collect::<Result<_, _>>()?;
                }
                reserved if RESERVED_RECORD_FIELDS.contains(&reserved) => {
                    tracing::warn!(key = reserved, "ignoring configuration key reserved for record fields");
                }
                _ => {
                    validate_extra_field_name(&key)?;
                    config.extra.insert(key, value);
                }
            }
        }

        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Fail-soft: a variable that does not parse is reported on the side
    /// channel and the default is kept.
    ///
    /// - `GRAYLOG_HOST`, `GRAYLOG_PORT`: backend address
    /// - `GRAYLOG_APP_NAME`: `host` field of each record
    /// - `GRAYLOG_FACILITY`, `GRAYLOG_LEVEL`, `GRAYLOG_CHUNK_SIZE`
    /// - `GRAYLOG_TRANSPORT`: `udp` (default) or `http`
    /// - `GRAYLOG_RAISE_ON_REPORT`: "true"/"1"/"yes" enables test mode
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("GRAYLOG_HOST") {
            config.hostname = host;
        }
        if let Ok(port) = std::env::var("GRAYLOG_PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(e) => tracing::warn!(value = %port, error = %e, "GRAYLOG_PORT is not a valid port"),
            }
        }
        if let Ok(name) = std::env::var("GRAYLOG_APP_NAME") {
            config.local_app_name = name;
        }
        if let Ok(facility) = std::env::var("GRAYLOG_FACILITY") {
            config.facility = facility;
        }
        if let Ok(level) = std::env::var("GRAYLOG_LEVEL") {
            match level.parse::<Level>() {
                Ok(level) => config.level = level,
                Err(e) => tracing::warn!(error = %e, "GRAYLOG_LEVEL ignored"),
            }
        }
        if let Ok(size) = std::env::var("GRAYLOG_CHUNK_SIZE") {
            match size.parse::<ChunkSize>() {
                Ok(size) => config.max_chunk_size = size,
                Err(e) => tracing::warn!(error = %e, "GRAYLOG_CHUNK_SIZE ignored"),
            }
        }
        if let Ok(transport) = std::env::var("GRAYLOG_TRANSPORT") {
            match transport.parse::<Transport>() {
                Ok(transport) => config.transport = transport,
                Err(e) => tracing::warn!(error = %e, "GRAYLOG_TRANSPORT ignored"),
            }
        }
        config.raise_on_report = match std::env::var("GRAYLOG_RAISE_ON_REPORT") {
            Ok(val) => matches!(val.to_lowercase().as_str(), "true" | "1" | "yes"),
            Err(_) => false,
        };

        tracing::debug!(
            backend = %format!("{}:{}", config.hostname, config.port),
            facility = %config.facility,
            "exception reporter configured"
        );

        config
    }

    pub fn with_facility(mut self, facility: impl Into<String>) -> Self {
        self.facility = facility.into();
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_local_app_name(mut self, name: impl Into<String>) -> Self {
        self.local_app_name = name.into();
        self
    }

    pub fn with_raise_on_report(mut self, raise: bool) -> Self {
        self.raise_on_report = raise;
        self
    }

    pub fn with_user_format(mut self, format: UserFormat) -> Self {
        self.user_format = format;
        self
    }

    pub fn with_passthrough_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.passthrough_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Add an extra field merged into every record
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self, ReportError> {
        let key = key.into();
        validate_extra_field_name(&key)?;
        self.extra.insert(key, value.into());
        Ok(self)
    }

    /// `host:port` of the backend
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Wrap config in Arc for thread-safe sharing
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

fn expect_string(key: &str, value: &Value) -> Result<String, ReportError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ReportError::InvalidConfig(format!("{key} must be a string")))
}

fn expect_number(key: &str, value: &Value) -> Result<u64, ReportError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ReportError::InvalidConfig(format!("{key} must be a non-negative integer"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ReportError::InvalidConfig(format!("{key} must be a non-negative integer"))),
        _ => Err(ReportError::InvalidConfig(format!("{key} must be a non-negative integer"))),
    }
}

/// GELF additional field names: `[A-Za-z0-9_.-]+`, and `id` is reserved
fn validate_extra_field_name(name: &str) -> Result<(), ReportError> {
    let name = name.strip_prefix('_').unwrap_or(name);
    if name.is_empty() {
        return Err(ReportError::InvalidConfig("extra field name is empty".to_string()));
    }
    if name == "id" {
        return Err(ReportError::InvalidConfig("extra field name `id` is reserved".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ReportError::InvalidConfig(format!("invalid extra field name: {name}")));
    }
    Ok(())
}
