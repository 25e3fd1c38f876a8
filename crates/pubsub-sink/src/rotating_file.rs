// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only, line-oriented log split over size- and count-bounded files.
//!
//! Used twice per sink: once for the durable buffer and once for the error
//! sideband. The two instances are told apart only by their file name prefix,
//! so a process-wide registry refuses to open a second log on a prefix that is
//! already held.

use crate::error::BufferError;
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

/// Files kept on disk when no limit is configured.
pub const DEFAULT_RETAINED_FILE_COUNT_LIMIT: usize = 31;

/// Retention below this would delete the file being written.
pub const MIN_RETAINED_FILE_COUNT_LIMIT: usize = 2;

pub const DEFAULT_EXTENSION: &str = ".swap";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatingFileConfig {
    pub directory: PathBuf,
    pub prefix: String,
    pub extension: String,
    /// Maximum bytes per file; unbounded when `None`.
    pub file_size_limit: Option<u64>,
    pub retained_file_count_limit: usize,
    /// Flush only on [`RotatingFileLog::flush`] instead of after every line.
    pub buffered: bool,
}

impl RotatingFileConfig {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        RotatingFileConfig {
            directory: directory.into(),
            prefix: prefix.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            file_size_limit: None,
            retained_file_count_limit: DEFAULT_RETAINED_FILE_COUNT_LIMIT,
            buffered: false,
        }
    }

    fn claim_key(&self) -> PathBuf {
        self.directory.join(&self.prefix)
    }

    /// Parses `<prefix>-<yyyymmdd>_<seq><extension>` into `(date, seq)`.
    pub(crate) fn parse_file_name(&self, name: &str) -> Option<(NaiveDate, u32)> {
        let rest = name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?
            .strip_suffix(self.extension.as_str())?;
        let (date, seq) = rest.split_once('_')?;
        if date.len() != 8 {
            return None;
        }
        let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
        let seq = seq.parse::<u32>().ok()?;
        Some((date, seq))
    }

    fn file_name(&self, date: NaiveDate, seq: u32) -> String {
        format!(
            "{}-{}_{:03}{}",
            self.prefix,
            date.format("%Y%m%d"),
            seq,
            self.extension
        )
    }

    /// Existing log files, oldest first.
    pub fn existing_files(&self) -> Result<Vec<PathBuf>, BufferError> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BufferError::io(&self.directory, e)),
        };

        let mut files: Vec<((NaiveDate, u32), PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let key = self.parse_file_name(name.to_str()?)?;
                Some((key, entry.path()))
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }
}

/// Absolute form of `directory` with symlinks resolved as far as the path
/// exists. Missing trailing components are kept with `.` and `..` folded.
pub(crate) fn resolve_directory(directory: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(directory) {
        return resolved;
    }
    let absolute = env::current_dir()
        .map(|cwd| cwd.join(directory))
        .unwrap_or_else(|_| directory.to_path_buf());

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other.as_os_str()),
        }
    }

    for ancestor in lexical.ancestors() {
        if let (Ok(resolved), Ok(rest)) =
            (fs::canonicalize(ancestor), lexical.strip_prefix(ancestor))
        {
            return resolved.join(rest);
        }
    }
    lexical
}

fn claimed_prefixes() -> &'static Mutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Holds a `(directory, prefix)` pair for as long as the log is open.
#[derive(Debug)]
struct PrefixClaim(PathBuf);

impl PrefixClaim {
    fn acquire(config: &RotatingFileConfig) -> Result<Self, BufferError> {
        let key = config.claim_key();
        let mut claimed = claimed_prefixes()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !claimed.insert(key.clone()) {
            return Err(BufferError::PrefixInUse(key.display().to_string()));
        }
        Ok(PrefixClaim(key))
    }
}

impl Drop for PrefixClaim {
    fn drop(&mut self) {
        let mut claimed = claimed_prefixes()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        claimed.remove(&self.0);
    }
}

#[derive(Debug)]
struct CurrentFile {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    date: NaiveDate,
    seq: u32,
}

#[derive(Debug)]
pub struct RotatingFileLog {
    config: RotatingFileConfig,
    current: Option<CurrentFile>,
    _claim: PrefixClaim,
}

impl RotatingFileLog {
    pub fn open(mut config: RotatingFileConfig) -> Result<Self, BufferError> {
        config.retained_file_count_limit = config
            .retained_file_count_limit
            .max(MIN_RETAINED_FILE_COUNT_LIMIT);
        fs::create_dir_all(&config.directory)
            .map_err(|e| BufferError::io(&config.directory, e))?;
        config.directory = fs::canonicalize(&config.directory)
            .map_err(|e| BufferError::io(&config.directory, e))?;
        let claim = PrefixClaim::acquire(&config)?;

        Ok(RotatingFileLog {
            config,
            current: None,
            _claim: claim,
        })
    }

    pub fn config(&self) -> &RotatingFileConfig {
        &self.config
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }

    /// Appends `line` and a newline, rolling to a new file first if needed.
    pub fn append_line(&mut self, line: &str) -> Result<(), BufferError> {
        let len = line.len() as u64 + 1;
        let today = Utc::now().date_naive();
        self.ensure_file(today, len)?;

        let buffered = self.config.buffered;
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        let path = current.path.clone();
        current
            .writer
            .write_all(line.as_bytes())
            .and_then(|()| current.writer.write_all(b"\n"))
            .map_err(|e| BufferError::io(&path, e))?;
        current.size += len;
        if !buffered {
            current
                .writer
                .flush()
                .map_err(|e| BufferError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), BufferError> {
        if let Some(current) = self.current.as_mut() {
            current
                .writer
                .flush()
                .map_err(|e| BufferError::io(&current.path, e))?;
        }
        Ok(())
    }

    /// Never moves to a file that sorts before the current one, even when the
    /// clock goes backwards.
    fn ensure_file(&mut self, today: NaiveDate, incoming: u64) -> Result<(), BufferError> {
        if self.current.is_none() {
            self.current = Some(self.resume_or_create(today)?);
        }

        let needs_roll = match self.current.as_ref() {
            Some(current) => {
                current.date < today
                    || self
                        .config
                        .file_size_limit
                        .is_some_and(|limit| current.size > 0 && current.size + incoming > limit)
            }
            None => false,
        };

        if needs_roll {
            self.flush()?;
            let (date, seq) = match self.current.as_ref() {
                Some(current) if current.date >= today => (current.date, current.seq + 1),
                _ => (today, 0),
            };
            self.current = Some(self.create(date, seq)?);
            self.apply_retention()?;
        }
        Ok(())
    }

    /// Continues the newest existing file when it is dated today or later.
    fn resume_or_create(&self, today: NaiveDate) -> Result<CurrentFile, BufferError> {
        let newest = self.config.existing_files()?.into_iter().last();
        if let Some(path) = newest {
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| self.config.parse_file_name(n));
            if let Some((date, seq)) = parsed {
                if date >= today {
                    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    let file = OpenOptions::new()
                        .append(true)
                        .open(&path)
                        .map_err(|e| BufferError::io(&path, e))?;
                    debug!("PUBSUB | Resuming rotating log file {}", path.display());
                    return Ok(CurrentFile {
                        path,
                        writer: BufWriter::new(file),
                        size,
                        date,
                        seq,
                    });
                }
            }
        }
        self.create(today, 0)
    }

    fn create(&self, date: NaiveDate, seq: u32) -> Result<CurrentFile, BufferError> {
        let path = self.config.directory.join(self.config.file_name(date, seq));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BufferError::io(&path, e))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        debug!("PUBSUB | Opened rotating log file {}", path.display());
        Ok(CurrentFile {
            path,
            writer: BufWriter::new(file),
            size,
            date,
            seq,
        })
    }

    fn apply_retention(&self) -> Result<(), BufferError> {
        let files = self.config.existing_files()?;
        let limit = self.config.retained_file_count_limit;
        if files.len() <= limit {
            return Ok(());
        }
        for path in &files[..files.len() - limit] {
            if let Err(e) = fs::remove_file(path) {
                warn!(
                    "PUBSUB | Failed to remove expired log file {}: {}",
                    path.display(),
                    e
                );
            }
        }
        Ok(())
    }
}

impl Drop for RotatingFileLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("PUBSUB | Failed to flush rotating log on close: {}", e);
        }
    }
}
