// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk buffer for durable mode.
//!
//! Formatted records are appended to a [`RotatingFileLog`], one JSON string
//! per line so payloads containing newlines survive. A bookmark file next to
//! the log remembers how far the shipper has got:
//!
//! ```text
//! <directory>/<prefix>-20240501_000.swap
//! <directory>/<prefix>-20240501_001.swap
//! <directory>/<prefix>.bookmark            "<prefix>-20240501_001.swap:4096"
//! ```
//!
//! The bookmark only moves forward after a successful publish, so a crash
//! between publish and [`DurableBuffer::advance`] re-delivers at most one chunk.

use crate::error::BufferError;
use crate::rotating_file::{RotatingFileConfig, RotatingFileLog};
use crate::sideband::Sideband;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

const BOOKMARK_EXTENSION: &str = ".bookmark";

/// A read position: a buffer file name and a byte offset into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPosition {
    pub file_name: String,
    pub offset: u64,
}

impl BufferPosition {
    fn parse(content: &str) -> Option<Self> {
        let (file_name, offset) = content.trim().rsplit_once(':')?;
        if file_name.is_empty() {
            return None;
        }
        Some(BufferPosition {
            file_name: file_name.to_string(),
            offset: offset.parse().ok()?,
        })
    }
}

impl std::fmt::Display for BufferPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_name, self.offset)
    }
}

/// Records read past the bookmark, and the position just after the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChunk {
    pub records: Vec<String>,
    /// `None` when nothing was consumed, not even corrupt lines.
    pub position: Option<BufferPosition>,
}

impl PendingChunk {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
pub struct DurableBuffer {
    config: RotatingFileConfig,
    bookmark_path: PathBuf,
    writer: Mutex<RotatingFileLog>,
}

impl DurableBuffer {
    pub fn open(config: RotatingFileConfig) -> Result<Self, BufferError> {
        let writer = RotatingFileLog::open(config)?;
        let config = writer.config().clone();
        let bookmark_path = config
            .directory
            .join(format!("{}{}", config.prefix, BOOKMARK_EXTENSION));
        Ok(DurableBuffer {
            config,
            bookmark_path,
            writer: Mutex::new(writer),
        })
    }

    pub fn config(&self) -> &RotatingFileConfig {
        &self.config
    }

    pub fn bookmark_path(&self) -> &Path {
        &self.bookmark_path
    }

    /// Appends one formatted record.
    pub fn append(&self, text: &str) -> Result<(), BufferError> {
        let line = Value::String(text.to_string()).to_string();
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append_line(&line)
    }

    pub fn flush(&self) -> Result<(), BufferError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }

    /// Reads up to `max_count` records past the bookmark. With `max_bytes`
    /// set, stops before the total text length would exceed it, but always
    /// returns at least one record when one is available.
    ///
    /// Lines that do not decode are reported to `sideband` and stepped over.
    pub fn read_pending(
        &self,
        max_count: usize,
        max_bytes: Option<usize>,
        sideband: &Sideband,
    ) -> Result<PendingChunk, BufferError> {
        self.flush()?;

        let bookmark = self.read_bookmark();
        let bookmark_key = bookmark
            .as_ref()
            .and_then(|b| self.config.parse_file_name(&b.file_name));

        let mut chunk = PendingChunk::default();
        let mut total_bytes = 0;

        for path in self.config.existing_files()? {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let key = self.config.parse_file_name(file_name);
            let start = match (&bookmark, bookmark_key) {
                (Some(b), _) if b.file_name == file_name => b.offset,
                (Some(_), Some(bk)) if key.is_some_and(|k| k < bk) => continue,
                _ => 0,
            };

            // Lines appended after this point wait for the next pass.
            let end = fs::metadata(&path)
                .map_err(|e| BufferError::io(&path, e))?
                .len();
            let mut reader = open_at(&path, start)?;
            let mut offset = start;
            let mut line = Vec::new();
            while offset < end {
                if chunk.records.len() >= max_count.max(1) {
                    return Ok(chunk);
                }
                line.clear();
                let read = reader
                    .read_until(b'\n', &mut line)
                    .map_err(|e| BufferError::io(&path, e))?;
                // A missing newline means the writer is mid-line.
                if read == 0 || line.last() != Some(&b'\n') {
                    break;
                }

                let raw = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                match serde_json::from_str::<String>(&raw) {
                    Ok(text) => {
                        let fits = max_bytes
                            .map_or(true, |limit| total_bytes + text.len() <= limit);
                        if !fits && !chunk.records.is_empty() {
                            return Ok(chunk);
                        }
                        total_bytes += text.len();
                        chunk.records.push(text);
                    }
                    Err(e) => {
                        warn!(
                            "PUBSUB | Skipping corrupt buffer line in {}: {}",
                            file_name, e
                        );
                        sideband.report_error(
                            &format!("Corrupt line skipped in buffer file {file_name}: {e}"),
                            Some(&[raw]),
                        );
                    }
                }
                offset += read as u64;
                chunk.position = Some(BufferPosition {
                    file_name: file_name.to_string(),
                    offset,
                });
            }
        }
        Ok(chunk)
    }

    /// Persists `position` as the new bookmark and removes buffer files that
    /// lie entirely before it.
    pub fn advance(&self, position: &BufferPosition) -> Result<(), BufferError> {
        let tmp = self.bookmark_path.with_extension("bookmark.tmp");
        fs::write(&tmp, position.to_string()).map_err(|e| BufferError::io(&tmp, e))?;
        fs::rename(&tmp, &self.bookmark_path)
            .map_err(|e| BufferError::io(&self.bookmark_path, e))?;
        debug!("PUBSUB | Buffer bookmark advanced to {}", position);

        let Some(bookmark_key) = self.config.parse_file_name(&position.file_name) else {
            return Ok(());
        };
        for path in self.config.existing_files()? {
            let consumed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| self.config.parse_file_name(n))
                .is_some_and(|key| key < bookmark_key);
            if !consumed {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!("PUBSUB | Removed shipped buffer file {}", path.display()),
                Err(e) => warn!(
                    "PUBSUB | Failed to remove shipped buffer file {}: {}",
                    path.display(),
                    e
                ),
            }
        }
        Ok(())
    }

    /// Current bookmark. A missing or unreadable bookmark restarts from the
    /// oldest file.
    pub fn read_bookmark(&self) -> Option<BufferPosition> {
        let content = match fs::read_to_string(&self.bookmark_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(
                    "PUBSUB | {}",
                    BufferError::io(&self.bookmark_path, e)
                );
                return None;
            }
        };
        let position = BufferPosition::parse(&content);
        if position.is_none() {
            warn!(
                "PUBSUB | {}, shipping from the oldest buffer file",
                BufferError::Bookmark {
                    path: self.bookmark_path.display().to_string(),
                    content,
                }
            );
        }
        position
    }
}

fn open_at(path: &Path, offset: u64) -> Result<BufReader<File>, BufferError> {
    let mut file = File::open(path).map_err(|e| BufferError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| BufferError::io(path, e))?;
    Ok(BufReader::new(file))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sideband::SidebandFlags;
    use std::io::Write;

    fn buffer_in(dir: &Path, prefix: &str) -> DurableBuffer {
        DurableBuffer::open(RotatingFileConfig::new(dir, prefix)).unwrap()
    }

    #[test]
    fn test_position_round_trip() {
        let position = BufferPosition::parse("buf-20240501_000.swap:128").unwrap();
        assert_eq!(position.file_name, "buf-20240501_000.swap");
        assert_eq!(position.offset, 128);
        assert_eq!(position.to_string(), "buf-20240501_000.swap:128");
        assert!(BufferPosition::parse("no offset").is_none());
        assert!(BufferPosition::parse(":12").is_none());
    }

    #[test]
    fn test_read_and_advance() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(dir.path(), "read");
        let sideband = Sideband::disabled();

        for text in ["one", "two", "three"] {
            buffer.append(text).unwrap();
        }

        let chunk = buffer.read_pending(2, None, &sideband).unwrap();
        assert_eq!(chunk.records, vec!["one", "two"]);

        // Without advancing, the same records come back.
        let again = buffer.read_pending(2, None, &sideband).unwrap();
        assert_eq!(again, chunk);

        buffer.advance(chunk.position.as_ref().unwrap()).unwrap();
        let rest = buffer.read_pending(10, None, &sideband).unwrap();
        assert_eq!(rest.records, vec!["three"]);

        buffer.advance(rest.position.as_ref().unwrap()).unwrap();
        assert!(buffer.read_pending(10, None, &sideband).unwrap().is_empty());
    }

    #[test]
    fn test_multiline_payload_survives() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(dir.path(), "multiline");

        buffer.append("line one\nline two").unwrap();

        let chunk = buffer
            .read_pending(10, None, &Sideband::disabled())
            .unwrap();
        assert_eq!(chunk.records, vec!["line one\nline two"]);
    }

    #[test]
    fn test_byte_limit_returns_at_least_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(dir.path(), "bytes");
        let sideband = Sideband::disabled();

        buffer.append("0123456789").unwrap();
        buffer.append("abc").unwrap();

        let chunk = buffer.read_pending(10, Some(4), &sideband).unwrap();
        assert_eq!(chunk.records, vec!["0123456789"]);
    }

    #[test]
    fn test_bookmark_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let sideband = Sideband::disabled();
        {
            let buffer = buffer_in(dir.path(), "restart");
            buffer.append("shipped").unwrap();
            buffer.append("pending").unwrap();
            let chunk = buffer.read_pending(1, None, &sideband).unwrap();
            buffer.advance(chunk.position.as_ref().unwrap()).unwrap();
        }

        let buffer = buffer_in(dir.path(), "restart");
        let chunk = buffer.read_pending(10, None, &sideband).unwrap();
        assert_eq!(chunk.records, vec!["pending"]);
    }

    #[test]
    fn test_consumed_files_removed_on_advance() {
        let dir = tempfile::tempdir().unwrap();
        let config = RotatingFileConfig {
            file_size_limit: Some(8),
            ..RotatingFileConfig::new(dir.path(), "consume")
        };
        let buffer = DurableBuffer::open(config.clone()).unwrap();
        let sideband = Sideband::disabled();

        for text in ["aaaa", "bbbb", "cccc"] {
            buffer.append(text).unwrap();
        }
        assert_eq!(config.existing_files().unwrap().len(), 3);

        let chunk = buffer.read_pending(2, None, &sideband).unwrap();
        assert_eq!(chunk.records, vec!["aaaa", "bbbb"]);
        buffer.advance(chunk.position.as_ref().unwrap()).unwrap();

        // The second file is the bookmark file and stays.
        assert_eq!(config.existing_files().unwrap().len(), 2);
        let rest = buffer.read_pending(10, None, &sideband).unwrap();
        assert_eq!(rest.records, vec!["cccc"]);
    }

    #[test]
    fn test_corrupt_line_is_reported_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(dir.path(), "corrupt");
        let sideband = Sideband::new(
            Some(RotatingFileConfig::new(dir.path(), "corrupt-errors")),
            SidebandFlags {
                error_store_events: true,
                ..Default::default()
            },
        )
        .unwrap();

        buffer.append("good").unwrap();
        let path = buffer.config().existing_files().unwrap().pop().unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json\n").unwrap();
        drop(file);
        buffer.append("also good").unwrap();

        let chunk = buffer.read_pending(10, None, &sideband).unwrap();
        assert_eq!(chunk.records, vec!["good", "also good"]);

        let errors = RotatingFileConfig::new(dir.path(), "corrupt-errors")
            .existing_files()
            .unwrap();
        let content = fs::read_to_string(&errors[0]).unwrap();
        assert!(content.contains("Corrupt line skipped"));
        assert!(content.contains("{not json"));
    }

    #[cfg(unix)]
    #[test]
    fn test_pass_stops_at_length_seen_on_entry() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(dir.path(), "shared");
        buffer.append("good").unwrap();
        let path = buffer.config().existing_files().unwrap().pop().unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json\n").unwrap();
        drop(file);

        // The error log resumes this link and so appends to the file being read.
        std::os::unix::fs::symlink(&path, dir.path().join("mirror-20991231_000.swap")).unwrap();
        let sideband = Sideband::new(
            Some(RotatingFileConfig::new(dir.path(), "mirror")),
            SidebandFlags {
                error_store_events: true,
                ..Default::default()
            },
        )
        .unwrap();

        let size_before = fs::metadata(&path).unwrap().len();
        let chunk = buffer.read_pending(1000, None, &sideband).unwrap();

        assert_eq!(chunk.records, vec!["good"]);
        assert_eq!(chunk.position.unwrap().offset, size_before);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.len() as u64 > size_before);
        assert!(content.contains("Corrupt line skipped"));
    }

    #[test]
    fn test_partial_trailing_line_is_left_for_later() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(dir.path(), "partial");
        let sideband = Sideband::disabled();

        buffer.append("complete").unwrap();
        let path = buffer.config().existing_files().unwrap().pop().unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\"half").unwrap();
        drop(file);

        let chunk = buffer.read_pending(10, None, &sideband).unwrap();
        assert_eq!(chunk.records, vec!["complete"]);
        assert_eq!(chunk.position.unwrap().offset, "\"complete\"\n".len() as u64);
    }

    #[test]
    fn test_corrupt_bookmark_restarts_from_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(dir.path(), "badmark");
        buffer.append("again").unwrap();
        fs::write(buffer.bookmark_path(), "garbage").unwrap();

        let chunk = buffer
            .read_pending(10, None, &Sideband::disabled())
            .unwrap();
        assert_eq!(chunk.records, vec!["again"]);
    }
}
