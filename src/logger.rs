/*
 * This file is part of RingBMS.
 *
 * Copyright (C) 2025 RingBMS contributors
 *
 * RingBMS is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * RingBMS is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with RingBMS. If not, see <https://www.gnu.org/licenses/>.
 */

//! JSON event log and measurement line sinks.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use serde_json::{json, Value};

use crate::constants::paths::{EVENT_LOG, EVENT_LOG_FALLBACK};
use crate::error::{BmsError, Result};

lazy_static! {
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Opens the event log, falling back to /tmp when /var/log is not writable.
/// Returns the path in use, or `None` if neither could be opened.
pub fn init_logging() -> Option<PathBuf> {
    for candidate in [EVENT_LOG, EVENT_LOG_FALLBACK] {
        let path = PathBuf::from(candidate);
        if init_logging_at(&path).is_ok() {
            return Some(path);
        }
    }
    None
}

pub fn init_logging_at(path: &Path) -> Result<()> {
    let file = open_append(path).map_err(|source| BmsError::FileWrite {
        path: path.to_path_buf(),
        source,
    })?;
    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    Ok(())
}

/// Appends `{"ts_ms", "event", "data"}` as one JSON line.
pub fn log_event(event: &str, data: Value) {
    let line = json!({
        "ts_ms": now_millis(),
        "event": event,
        "data": data,
    })
    .to_string();

    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(f) = guard.as_mut() {
            let _ = writeln!(f, "{}", line);
            return;
        }
    }
    // not initialized: best effort to the fallback file
    if let Ok(mut f) = open_append(Path::new(EVENT_LOG_FALLBACK)) {
        let _ = writeln!(f, "{}", line);
    }
}

/// Destination of the measurement log lines
#[cfg_attr(test, mockall::automock)]
pub trait LogSink {
    fn append_line(&mut self, line: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

pub struct FileLogSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileLogSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = open_append(path).map_err(|source| BmsError::FileWrite {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { path: path.to_path_buf(), writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{}", line)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", line)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
