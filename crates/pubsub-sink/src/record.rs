// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records handed to the sink by the logging front-end, and the
//! formatters that turn them into the text that gets published.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Severity of a record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Verbose,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

impl Level {
    /// Three-letter code used in text output.
    pub fn short_code(self) -> &'static str {
        match self {
            Level::Verbose => "VRB",
            Level::Debug => "DBG",
            Level::Information => "INF",
            Level::Warning => "WRN",
            Level::Error => "ERR",
            Level::Fatal => "FTL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Verbose => "Verbose",
            Level::Debug => "Debug",
            Level::Information => "Information",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::Fatal => "Fatal",
        };
        f.write_str(name)
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verbose" | "vrb" | "trace" => Ok(Level::Verbose),
            "debug" | "dbg" => Ok(Level::Debug),
            "information" | "info" | "inf" => Ok(Level::Information),
            "warning" | "warn" | "wrn" => Ok(Level::Warning),
            "error" | "err" => Ok(Level::Error),
            "fatal" | "ftl" => Ok(Level::Fatal),
            other => Err(format!("unknown level '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// One log event. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub rendered: String,
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(level: Level, rendered: impl Into<String>) -> Self {
        Record {
            timestamp: Utc::now(),
            level,
            rendered: rendered.into(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

/// Turns a record into the text that becomes the message payload.
///
/// Periodic and durable mode share one formatter instance so a record always
/// serializes the same way regardless of the path it takes.
pub trait RecordFormatter: Send + Sync + fmt::Debug {
    fn format(&self, record: &Record) -> String;
}

/// Default formatter: the rendered message text, nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFormatter;

impl RecordFormatter for RawFormatter {
    fn format(&self, record: &Record) -> String {
        record.rendered.clone()
    }
}

/// Formats a record as one compact JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl RecordFormatter for JsonFormatter {
    fn format(&self, record: &Record) -> String {
        let properties: Map<String, Value> = record
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut object = Map::new();
        object.insert(
            "Timestamp".to_string(),
            Value::String(
                record
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        );
        object.insert("Level".to_string(), Value::String(record.level.to_string()));
        object.insert(
            "RenderedMessage".to_string(),
            Value::String(record.rendered.clone()),
        );
        if !properties.is_empty() {
            object.insert("Properties".to_string(), Value::Object(properties));
        }
        Value::Object(object).to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Verbose < Level::Debug);
        assert!(Level::Information < Level::Warning);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("Information".parse::<Level>(), Ok(Level::Information));
        assert_eq!("WRN".parse::<Level>(), Ok(Level::Warning));
        assert_eq!(" error ".parse::<Level>(), Ok(Level::Error));
        assert!("loud".parse::<Level>().is_err());
    }

    #[test]
    fn test_raw_formatter_is_rendered_text() {
        let record = Record::new(Level::Warning, "disk 91% full").with_field("disk", "sda");
        assert_eq!(RawFormatter.format(&record), "disk 91% full");
    }

    #[test]
    fn test_json_formatter() {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let record = Record::new(Level::Error, "payment failed")
            .with_timestamp(timestamp)
            .with_field("order", 42);

        let formatted = JsonFormatter.format(&record);
        let parsed: Value = serde_json::from_str(&formatted).unwrap();

        assert_eq!(parsed["Timestamp"], "2024-05-01T12:30:00.000Z");
        assert_eq!(parsed["Level"], "Error");
        assert_eq!(parsed["RenderedMessage"], "payment failed");
        assert_eq!(parsed["Properties"]["order"], 42);
    }

    #[test]
    fn test_json_formatter_omits_empty_properties() {
        let record = Record::new(Level::Debug, "tick");
        let parsed: Value = serde_json::from_str(&JsonFormatter.format(&record)).unwrap();
        assert!(parsed.get("Properties").is_none());
    }
}
