// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort error and debug channel, written to its own rotating log.
//!
//! Nothing here returns an error or panics on I/O failure: a broken sideband
//! is logged through `tracing` and otherwise ignored, so it can never affect
//! delivery.

use crate::error::BufferError;
use crate::record::Level;
use crate::rotating_file::{RotatingFileConfig, RotatingFileLog};
use chrono::{SecondsFormat, Utc};
use std::sync::Mutex;
use tracing::{debug, error, warn};

pub const EVENTS_START_MARKER: &str = "---Events---";
pub const EVENTS_END_MARKER: &str = "----end-----";
pub const NO_EVENTS_LINE: &str = "there are no events";

/// Which optional entries the sideband records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SidebandFlags {
    /// Attach the failed payload to error entries.
    pub error_store_events: bool,
    /// Record batch boundaries reached before input ran out.
    pub debug_store_batch_limits_overflows: bool,
    /// Record messages dropped for exceeding the byte limit.
    pub debug_store_event_skip: bool,
    /// Record everything, payloads included.
    pub debug_store_all: bool,
}

#[derive(Debug)]
pub struct Sideband {
    flags: SidebandFlags,
    log: Option<Mutex<RotatingFileLog>>,
}

impl Sideband {
    pub fn new(config: Option<RotatingFileConfig>, flags: SidebandFlags) -> Result<Self, BufferError> {
        let log = config
            .map(RotatingFileLog::open)
            .transpose()?
            .map(Mutex::new);
        Ok(Sideband { flags, log })
    }

    /// A sideband without a backing file. Entries only reach `tracing`.
    pub fn disabled() -> Self {
        Sideband {
            flags: SidebandFlags::default(),
            log: None,
        }
    }

    pub fn flags(&self) -> SidebandFlags {
        self.flags
    }

    pub fn report_error(&self, message: &str, payload: Option<&[String]>) {
        error!("PUBSUB | {}", message);
        let payload = if self.flags.error_store_events || self.flags.debug_store_all {
            payload
        } else {
            None
        };
        self.write_entry(message, payload);
    }

    pub fn report_debug(&self, message: &str, payload: Option<&[String]>) {
        if !self.flags.debug_store_all {
            return;
        }
        debug!("PUBSUB | {}", message);
        self.write_entry(message, payload);
    }

    pub fn report_overflow(
        &self,
        message: &str,
        count: usize,
        count_limit: usize,
        size_bytes: usize,
        size_limit: Option<usize>,
    ) {
        if !(self.flags.debug_store_all || self.flags.debug_store_batch_limits_overflows) {
            return;
        }
        let size_limit = size_limit.map_or_else(|| "no limit".to_string(), |l| l.to_string());
        let formatted = format!(
            "{message} (count {count}, count limit {count_limit}, size {size_bytes} bytes, size limit {size_limit})"
        );
        debug!("PUBSUB | {}", formatted);
        self.write_entry(&formatted, None);
    }

    pub fn report_event_skip(&self, message: &str, payload: Option<&[String]>) {
        if !(self.flags.debug_store_all || self.flags.debug_store_event_skip) {
            return;
        }
        warn!("PUBSUB | {}", message);
        self.write_entry(message, payload);
    }

    fn write_entry(&self, message: &str, payload: Option<&[String]>) {
        let Some(log) = self.log.as_ref() else {
            return;
        };

        let mut lines = vec![message.to_string()];
        if let Some(payload) = payload {
            lines.push(EVENTS_START_MARKER.to_string());
            if payload.is_empty() {
                lines.push(NO_EVENTS_LINE.to_string());
            } else {
                lines.extend(payload.iter().map(|line| line.replace('\n', "\\n")));
            }
            lines.push(EVENTS_END_MARKER.to_string());
        }

        let mut log = match log.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        };
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        for line in lines {
            let entry = format!("{timestamp} [{}] {line}", Level::Error.short_code());
            if let Err(e) = log.append_line(&entry) {
                warn!("PUBSUB | Failed to write to error sideband: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn sideband(flags: SidebandFlags) -> (TempDir, RotatingFileConfig, Sideband) {
        let dir = tempfile::tempdir().unwrap();
        let config = RotatingFileConfig::new(dir.path(), "errors");
        let sideband = Sideband::new(Some(config.clone()), flags).unwrap();
        (dir, config, sideband)
    }

    fn lines(config: &RotatingFileConfig) -> Vec<String> {
        config
            .existing_files()
            .unwrap()
            .iter()
            .flat_map(|path| {
                fs::read_to_string(path)
                    .unwrap()
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn payload() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_error_with_stored_events() {
        let flags = SidebandFlags {
            error_store_events: true,
            ..Default::default()
        };
        let (_dir, config, sideband) = sideband(flags);

        sideband.report_error("X", Some(&payload()));

        let lines = lines(&config);
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("[ERR] X"));
        assert!(lines[1].ends_with(EVENTS_START_MARKER));
        assert!(lines[2].ends_with(" a"));
        assert!(lines[3].ends_with(" b"));
        assert!(lines[4].ends_with(EVENTS_END_MARKER));
    }

    #[test]
    fn test_error_without_stored_events() {
        let (_dir, config, sideband) = sideband(SidebandFlags::default());

        sideband.report_error("X", Some(&payload()));

        let lines = lines(&config);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("[ERR] X"));
    }

    #[test]
    fn test_debug_store_all_attaches_payload_to_errors() {
        let flags = SidebandFlags {
            debug_store_all: true,
            ..Default::default()
        };
        let (_dir, config, sideband) = sideband(flags);

        sideband.report_error("X", Some(&payload()));

        assert_eq!(lines(&config).len(), 5);
    }

    #[test]
    fn test_empty_payload_writes_placeholder() {
        let flags = SidebandFlags {
            error_store_events: true,
            ..Default::default()
        };
        let (_dir, config, sideband) = sideband(flags);

        sideband.report_error("nothing sent", Some(&[]));

        let lines = lines(&config);
        assert_eq!(lines.len(), 4);
        assert!(lines[2].ends_with(NO_EVENTS_LINE));
    }

    #[test]
    fn test_debug_requires_store_all() {
        let (_dir, config, sideband) = sideband(SidebandFlags::default());
        sideband.report_debug("trace", None);
        assert!(lines(&config).is_empty());

        let flags = SidebandFlags {
            debug_store_all: true,
            ..Default::default()
        };
        let (_dir, config, sideband) = self::sideband(flags);
        sideband.report_debug("trace", Some(&payload()));
        assert_eq!(lines(&config).len(), 5);
    }

    #[test]
    fn test_overflow_message_embeds_limits() {
        let flags = SidebandFlags {
            debug_store_batch_limits_overflows: true,
            ..Default::default()
        };
        let (_dir, config, sideband) = sideband(flags);

        sideband.report_overflow("Batch limit reached", 50, 50, 1024, None);
        sideband.report_overflow("Batch limit reached", 3, 50, 900, Some(1000));

        let lines = lines(&config);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(
            "Batch limit reached (count 50, count limit 50, size 1024 bytes, size limit no limit)"
        ));
        assert!(lines[1].ends_with("size 900 bytes, size limit 1000)"));
    }

    #[test]
    fn test_debug_store_all_records_overflow() {
        let flags = SidebandFlags {
            debug_store_all: true,
            ..Default::default()
        };
        let (_dir, config, sideband) = sideband(flags);

        sideband.report_overflow("Batch limit reached", 50, 50, 1024, Some(4096));

        let lines = lines(&config);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[ERR] Batch limit reached (count 50"));
        assert!(lines[0].ends_with("size limit 4096)"));
    }

    #[test]
    fn test_debug_store_all_records_event_skip() {
        let flags = SidebandFlags {
            debug_store_all: true,
            ..Default::default()
        };
        let (_dir, config, sideband) = sideband(flags);

        sideband.report_event_skip("Message of 2048 bytes skipped", Some(&payload()));

        let lines = lines(&config);
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("[ERR] Message of 2048 bytes skipped"));
        assert!(lines[1].ends_with(EVENTS_START_MARKER));
        assert!(lines[4].ends_with(EVENTS_END_MARKER));
    }

    #[test]
    fn test_overflow_not_recorded_by_default() {
        let (_dir, config, sideband) = sideband(SidebandFlags::default());
        sideband.report_overflow("Batch limit reached", 50, 50, 1024, None);
        assert!(lines(&config).is_empty());
    }

    #[test]
    fn test_event_skip_gating() {
        let (_dir, config, sideband) = sideband(SidebandFlags::default());
        sideband.report_event_skip("skipped", None);
        assert!(lines(&config).is_empty());

        let flags = SidebandFlags {
            debug_store_event_skip: true,
            ..Default::default()
        };
        let (_dir, config, sideband) = self::sideband(flags);
        sideband.report_event_skip("skipped", None);
        assert_eq!(lines(&config).len(), 1);
    }

    #[test]
    fn test_disabled_sideband_never_fails() {
        let sideband = Sideband::disabled();
        sideband.report_error("X", Some(&payload()));
        sideband.report_debug("X", None);
        sideband.report_overflow("X", 1, 1, 1, Some(1));
    }

    #[test]
    #[traced_test]
    fn test_write_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let config = RotatingFileConfig {
            file_size_limit: Some(1),
            ..RotatingFileConfig::new(dir.path(), "errors")
        };
        let sideband = Sideband::new(Some(config.clone()), SidebandFlags::default()).unwrap();
        sideband.report_error("first", None);
        assert!(!logs_contain("Failed to write to error sideband"));

        // The next entry has to roll into a directory that is gone.
        drop(dir);
        sideband.report_error("second", None);

        assert!(logs_contain("Failed to write to error sideband"));
        assert!(config.existing_files().unwrap().is_empty());
    }
}
