use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

pub const DEFAULT_DATA_SOURCE: &str = "default";
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_POLL_MAX_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CONCURRENCY: usize = 10;

const SUPPORTED_BUCKET_TYPES: &[&str] = &["gcp"];

/// Driver settings. Built once and shared read-only by every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub data_source: String,
    pub project_id: Option<String>,
    pub location: Option<String>,
    pub key_file: Option<String>,
    /// Base64-encoded service account JSON.
    pub credentials: Option<String>,
    pub export_bucket: Option<String>,
    pub export_bucket_csv_escape_symbol: Option<String>,
    #[serde(with = "duration_ms")]
    pub poll_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub poll_max_interval: Duration,
    pub read_only: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            data_source: DEFAULT_DATA_SOURCE.to_string(),
            project_id: None,
            location: None,
            key_file: None,
            credentials: None,
            export_bucket: None,
            export_bucket_csv_escape_symbol: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_max_interval: DEFAULT_POLL_MAX_INTERVAL,
            read_only: true,
        }
    }
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env(data_source: &str) -> Result<Self> {
        Self::from_lookup(data_source, |name| std::env::var(name).ok())
    }

    /// Resolves settings through `lookup`, which receives full variable names
    /// such as `CUBEJS_DB_BQ_PROJECT_ID`.
    pub fn from_lookup<F>(data_source: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&env_name(data_source, suffix)).filter(|v| !v.trim().is_empty())
        };

        if let Some(bucket_type) = get("EXPORT_BUCKET_TYPE") {
            if !SUPPORTED_BUCKET_TYPES.contains(&bucket_type.as_str()) {
                return Err(DriverError::Configuration(format!(
                    "Unsupported export bucket type '{}' for {}; supported: {}",
                    bucket_type,
                    env_name(data_source, "EXPORT_BUCKET_TYPE"),
                    SUPPORTED_BUCKET_TYPES.join(", ")
                )));
            }
        }

        let poll_timeout = match get("POLL_TIMEOUT").or_else(|| get("QUERY_TIMEOUT")) {
            Some(value) => parse_duration(&value)?,
            None => DEFAULT_POLL_TIMEOUT,
        };
        let poll_max_interval = match get("POLL_MAX_INTERVAL") {
            Some(value) => parse_duration(&value)?,
            None => DEFAULT_POLL_MAX_INTERVAL,
        };

        Ok(Self {
            data_source: data_source.to_string(),
            project_id: get("BQ_PROJECT_ID"),
            location: get("BQ_LOCATION"),
            key_file: get("BQ_KEY_FILE"),
            credentials: get("BQ_CREDENTIALS"),
            export_bucket: get("EXPORT_BUCKET").or_else(|| get("BQ_EXPORT_BUCKET")),
            export_bucket_csv_escape_symbol: get("EXPORT_BUCKET_CSV_ESCAPE_SYMBOL"),
            poll_timeout,
            poll_max_interval,
            read_only: true,
        })
    }

    /// Variables a deployment must provide for the default data source.
    pub fn env_variables() -> &'static [&'static str] {
        &["CUBEJS_DB_BQ_PROJECT_ID", "CUBEJS_DB_BQ_KEY_FILE"]
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_export_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.export_bucket = Some(bucket.into());
        self
    }

    pub fn with_csv_escape_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.export_bucket_csv_escape_symbol = Some(symbol.into());
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_poll_max_interval(mut self, interval: Duration) -> Self {
        self.poll_max_interval = interval;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Decodes [`DriverConfig::credentials`] into service account JSON.
    pub fn decoded_credentials(&self) -> Result<Option<String>> {
        let Some(encoded) = &self.credentials else {
            return Ok(None);
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| DriverError::Configuration(format!("Invalid base64 credentials: {}", e)))?;
        let json = String::from_utf8(bytes)
            .map_err(|e| DriverError::Configuration(format!("Credentials are not UTF-8: {}", e)))?;
        serde_json::from_str::<serde_json::Value>(&json)
            .map_err(|e| DriverError::Configuration(format!("Credentials are not JSON: {}", e)))?;

        Ok(Some(json))
    }

    pub fn require_project_id(&self) -> Result<&str> {
        self.project_id.as_deref().ok_or_else(|| {
            DriverError::Configuration(format!(
                "Project ID required ({})",
                env_name(&self.data_source, "BQ_PROJECT_ID")
            ))
        })
    }
}

fn env_name(data_source: &str, suffix: &str) -> String {
    if data_source == DEFAULT_DATA_SOURCE {
        format!("CUBEJS_DB_{}", suffix)
    } else {
        format!("CUBEJS_DS_{}_DB_{}", data_source.to_uppercase(), suffix)
    }
}

/// Accepts plain seconds or a number with an `s`, `m` or `h` suffix.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (number, multiplier) = match value.chars().last() {
        Some('s') => (&value[..value.len() - 1], 1),
        Some('m') => (&value[..value.len() - 1], 60),
        Some('h') => (&value[..value.len() - 1], 3600),
        _ => (value, 1),
    };

    let invalid = || DriverError::Configuration(format!("Invalid duration: '{}'", value));
    let seconds: f64 = number.trim().parse().map_err(|_| invalid())?;
    Duration::try_from_secs_f64(seconds * multiplier as f64).map_err(|_| invalid())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
