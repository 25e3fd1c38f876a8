// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::codec::MinValueAttr;
use crate::error::ConfigError;
use crate::publisher::DEFAULT_ENDPOINT;
use crate::record::Level;
use crate::rotating_file::{
    resolve_directory, RotatingFileConfig, DEFAULT_EXTENSION, DEFAULT_RETAINED_FILE_COUNT_LIMIT,
};
use crate::sideband::SidebandFlags;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "PUBSUB_";

pub const DEFAULT_BATCH_POSTING_LIMIT: usize = 50;
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_BUFFER_LOG_SHIPPING_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_QUEUE_LIMIT: usize = 100_000;

/// Pub/Sub topic resource name rule.
const TOPIC_ID_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9\-_.~+%]{2,254}$";

/// Sink configuration. Option names match the documented configuration keys
/// (`ProjectId`, `BatchPostingLimit`, ...) when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SinkConfig {
    pub project_id: String,
    pub topic_id: String,
    pub batch_posting_limit: usize,
    pub batch_size_limit_bytes: Option<usize>,
    pub minimum_log_event_level: Option<Level>,
    /// Flush interval in periodic mode, in seconds.
    #[serde(deserialize_with = "duration_from_secs")]
    pub period: Duration,
    /// Poll interval in durable mode, in seconds.
    #[serde(deserialize_with = "duration_from_secs")]
    pub buffer_log_shipping_interval: Duration,
    /// Upper bound of records held in memory in periodic mode.
    pub queue_limit: usize,

    /// Directory plus file name prefix of the durable buffer. Setting it
    /// selects durable mode.
    pub buffer_base_file_name: Option<PathBuf>,
    pub buffer_file_extension: String,
    pub buffer_file_size_limit_bytes: Option<u64>,
    pub buffer_retained_file_count_limit: usize,
    pub buffer_file_buffered: bool,

    /// Directory plus file name prefix of the error sideband.
    pub error_base_file_name: Option<PathBuf>,
    pub error_file_size_limit_bytes: Option<u64>,
    pub error_retained_file_count_limit: usize,

    pub error_store_events: bool,
    pub debug_store_batch_limits_overflows: bool,
    pub debug_store_event_skip: bool,
    pub debug_store_all: bool,

    pub message_data_to_base64: bool,
    pub event_field_separator: Option<String>,
    /// `<fieldIndex>#<attributeName>`.
    pub message_attr_min_value: Option<String>,
    pub message_attr_fixed: HashMap<String, String>,

    pub endpoint: String,
    pub access_token: Option<String>,
    pub https_proxy: Option<String>,
    pub publish_timeout_secs: u64,
    pub publish_retries: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            topic_id: String::new(),
            batch_posting_limit: DEFAULT_BATCH_POSTING_LIMIT,
            batch_size_limit_bytes: None,
            minimum_log_event_level: None,
            period: DEFAULT_PERIOD,
            buffer_log_shipping_interval: DEFAULT_BUFFER_LOG_SHIPPING_INTERVAL,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            buffer_base_file_name: None,
            buffer_file_extension: DEFAULT_EXTENSION.to_string(),
            buffer_file_size_limit_bytes: None,
            buffer_retained_file_count_limit: DEFAULT_RETAINED_FILE_COUNT_LIMIT,
            buffer_file_buffered: false,
            error_base_file_name: None,
            error_file_size_limit_bytes: None,
            error_retained_file_count_limit: DEFAULT_RETAINED_FILE_COUNT_LIMIT,
            error_store_events: false,
            debug_store_batch_limits_overflows: false,
            debug_store_event_skip: false,
            debug_store_all: false,
            message_data_to_base64: true,
            event_field_separator: None,
            message_attr_min_value: None,
            message_attr_fixed: HashMap::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            access_token: None,
            https_proxy: None,
            publish_timeout_secs: 30,
            publish_retries: 3,
        }
    }
}

fn duration_from_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn invalid(option: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        option,
        reason: reason.into(),
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    env_string(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| invalid(name, format!("cannot parse '{raw}'")))
        })
        .transpose()
}

fn env_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    env_string(name)
        .map(|raw| match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(name, format!("expected a boolean, got '{raw}'"))),
        })
        .transpose()
}

fn env_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    env_parse::<f64>(name)?
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(|e| invalid(name, e.to_string())))
        .transpose()
}

/// Parses `key1:value1,key2:value2`. Entries without a colon are ignored.
fn parse_fixed_attributes(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn split_base_file_name(base: &Path) -> Option<(PathBuf, String)> {
    let prefix = base.file_name()?.to_str()?.to_string();
    let directory = base
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Some((directory, prefix))
}

impl SinkConfig {
    /// Reads `PUBSUB_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_string("PROJECT_ID") {
            config.project_id = v;
        }
        if let Some(v) = env_string("TOPIC_ID") {
            config.topic_id = v;
        }
        if let Some(v) = env_parse("BATCH_POSTING_LIMIT")? {
            config.batch_posting_limit = v;
        }
        config.batch_size_limit_bytes = env_parse("BATCH_SIZE_LIMIT_BYTES")?;
        config.minimum_log_event_level = env_parse("MINIMUM_LOG_EVENT_LEVEL")?;
        if let Some(v) = env_secs("PERIOD")? {
            config.period = v;
        }
        if let Some(v) = env_secs("BUFFER_LOG_SHIPPING_INTERVAL")? {
            config.buffer_log_shipping_interval = v;
        }
        if let Some(v) = env_parse("QUEUE_LIMIT")? {
            config.queue_limit = v;
        }

        config.buffer_base_file_name = env_string("BUFFER_BASE_FILE_NAME").map(PathBuf::from);
        if let Some(v) = env_string("BUFFER_FILE_EXTENSION") {
            config.buffer_file_extension = v;
        }
        config.buffer_file_size_limit_bytes = env_parse("BUFFER_FILE_SIZE_LIMIT_BYTES")?;
        if let Some(v) = env_parse("BUFFER_RETAINED_FILE_COUNT_LIMIT")? {
            config.buffer_retained_file_count_limit = v;
        }
        if let Some(v) = env_bool("BUFFER_FILE_BUFFERED")? {
            config.buffer_file_buffered = v;
        }

        config.error_base_file_name = env_string("ERROR_BASE_FILE_NAME").map(PathBuf::from);
        config.error_file_size_limit_bytes = env_parse("ERROR_FILE_SIZE_LIMIT_BYTES")?;
        if let Some(v) = env_parse("ERROR_RETAINED_FILE_COUNT_LIMIT")? {
            config.error_retained_file_count_limit = v;
        }

        config.error_store_events = env_bool("ERROR_STORE_EVENTS")?.unwrap_or(false);
        config.debug_store_batch_limits_overflows =
            env_bool("DEBUG_STORE_BATCH_LIMITS_OVERFLOWS")?.unwrap_or(false);
        config.debug_store_event_skip = env_bool("DEBUG_STORE_EVENT_SKIP")?.unwrap_or(false);
        config.debug_store_all = env_bool("DEBUG_STORE_ALL")?.unwrap_or(false);

        if let Some(v) = env_bool("MESSAGE_DATA_TO_BASE64")? {
            config.message_data_to_base64 = v;
        }
        config.event_field_separator = env::var(format!("{ENV_PREFIX}EVENT_FIELD_SEPARATOR"))
            .ok()
            .filter(|v| !v.is_empty());
        config.message_attr_min_value = env_string("MESSAGE_ATTR_MIN_VALUE");
        if let Some(v) = env_string("MESSAGE_ATTR_FIXED") {
            config.message_attr_fixed = parse_fixed_attributes(&v);
        }

        if let Some(v) = env_string("ENDPOINT") {
            config.endpoint = v;
        }
        config.access_token = env_string("ACCESS_TOKEN");
        config.https_proxy = env_string("HTTPS_PROXY").or_else(|| env::var("HTTPS_PROXY").ok());
        if let Some(v) = env_parse("PUBLISH_TIMEOUT_SECS")? {
            config.publish_timeout_secs = v;
        }
        if let Some(v) = env_parse("PUBLISH_RETRIES")? {
            config.publish_retries = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document whose keys are the option names.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SinkConfig =
            serde_json::from_str(json).map_err(|e| invalid("configuration", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Missing("ProjectId"));
        }
        if self.project_id.contains('/') {
            return Err(invalid("ProjectId", "must not contain '/'"));
        }

        let topic_id = self.topic_id.trim();
        if topic_id.is_empty() {
            return Err(ConfigError::Missing("TopicId"));
        }
        if let Ok(pattern) = Regex::new(TOPIC_ID_PATTERN) {
            if !pattern.is_match(topic_id) {
                return Err(invalid(
                    "TopicId",
                    format!("'{topic_id}' is not a valid topic name"),
                ));
            }
        }
        if topic_id.to_ascii_lowercase().starts_with("goog") {
            return Err(invalid("TopicId", "must not start with 'goog'"));
        }

        if self.batch_posting_limit < 1 {
            return Err(invalid("BatchPostingLimit", "must be at least 1"));
        }
        if self.batch_size_limit_bytes == Some(0) {
            return Err(invalid("BatchSizeLimitBytes", "must be at least 1"));
        }
        if self.period.is_zero() {
            return Err(invalid("Period", "must be greater than zero"));
        }
        if self.buffer_log_shipping_interval.is_zero() {
            return Err(invalid(
                "BufferLogShippingInterval",
                "must be greater than zero",
            ));
        }
        if self.queue_limit < self.batch_posting_limit {
            return Err(invalid(
                "QueueLimit",
                "must be at least BatchPostingLimit",
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("Endpoint"));
        }

        if let Some(base) = &self.buffer_base_file_name {
            if split_base_file_name(base).is_none() {
                return Err(invalid("BufferBaseFileName", "must end in a file name prefix"));
            }
        }
        if let Some(base) = &self.error_base_file_name {
            if split_base_file_name(base).is_none() {
                return Err(invalid("ErrorBaseFileName", "must end in a file name prefix"));
            }
        }
        self.check_prefix_collision()
    }

    /// The buffer and the error log may live in one directory only if neither
    /// prefix is a prefix of the other. Directories are compared after
    /// resolving `..` and symlinks.
    fn check_prefix_collision(&self) -> Result<(), ConfigError> {
        let (Some(buffer), Some(errors)) = (self.buffer_file_config(), self.error_file_config())
        else {
            return Ok(());
        };
        let directory = resolve_directory(&buffer.directory);
        if directory != resolve_directory(&errors.directory) {
            return Ok(());
        }
        if buffer.prefix.starts_with(&errors.prefix) || errors.prefix.starts_with(&buffer.prefix) {
            return Err(ConfigError::PrefixCollision {
                dir: directory.display().to_string(),
                first: buffer.prefix,
                second: errors.prefix,
            });
        }
        Ok(())
    }

    pub fn is_durable(&self) -> bool {
        self.buffer_base_file_name.is_some()
    }

    pub fn min_value_attr(&self) -> Option<MinValueAttr> {
        self.message_attr_min_value
            .as_deref()
            .and_then(MinValueAttr::parse)
    }

    pub fn sideband_flags(&self) -> SidebandFlags {
        SidebandFlags {
            error_store_events: self.error_store_events,
            debug_store_batch_limits_overflows: self.debug_store_batch_limits_overflows,
            debug_store_event_skip: self.debug_store_event_skip,
            debug_store_all: self.debug_store_all,
        }
    }

    pub fn buffer_file_config(&self) -> Option<RotatingFileConfig> {
        let (directory, prefix) = split_base_file_name(self.buffer_base_file_name.as_deref()?)?;
        Some(RotatingFileConfig {
            extension: self.buffer_file_extension.clone(),
            file_size_limit: self.buffer_file_size_limit_bytes,
            retained_file_count_limit: self.buffer_retained_file_count_limit,
            buffered: self.buffer_file_buffered,
            ..RotatingFileConfig::new(directory, prefix)
        })
    }

    pub fn error_file_config(&self) -> Option<RotatingFileConfig> {
        let (directory, prefix) = split_base_file_name(self.error_base_file_name.as_deref()?)?;
        Some(RotatingFileConfig {
            file_size_limit: self.error_file_size_limit_bytes,
            retained_file_count_limit: self.error_retained_file_count_limit,
            ..RotatingFileConfig::new(directory, prefix)
        })
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}
