//! Append-only change log of a state store.
//!
//! Each mutation of a store is written as one JSON line holding the entry's
//! offset, timestamp, key and value (absent for a tombstone). Keys and values
//! are base64 encoded. Offsets are assigned in append order and never reused,
//! so entries are totally ordered per store.
//!
//! ## Compaction
//!
//! With [`CleanupPolicy::Compact`] the log can be rewritten to keep only the
//! latest entry per key. A tombstone is physically removed only once it is
//! older than the configured retention and at or below the owner's checkpoint;
//! the final entry of the log is always kept so the end offset never moves
//! backwards. Replaying the compacted log from its start yields the same map as
//! replaying the full log.
//!
//! ## Corruption
//!
//! A line that cannot be decoded (for instance a write cut short by a crash)
//! marks the log as corrupt from that line on. Readers report
//! [`ChangeLogError::Corrupt`] when they reach it and appends are refused.

use crate::error::ChangeLogError;
use crate::state::{CleanupPolicy, LogConfig};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One decoded change log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
  /// Offset of the entry in its log.
  pub offset: u64,
  /// Time of the mutation in milliseconds since the Unix epoch.
  pub timestamp_ms: i64,
  /// Serialized key.
  pub key: Bytes,
  /// Serialized value, `None` for a deletion.
  pub value: Option<Bytes>,
}

impl ChangeRecord {
  /// Returns true if the entry records a deletion.
  pub fn is_tombstone(&self) -> bool {
    self.value.is_none()
  }
}

#[derive(Serialize, Deserialize)]
struct LogLine {
  offset: u64,
  ts: i64,
  key: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  value: Option<String>,
}

impl LogLine {
  fn encode(offset: u64, timestamp_ms: i64, key: &[u8], value: Option<&[u8]>) -> Self {
    Self {
      offset,
      ts: timestamp_ms,
      key: STANDARD.encode(key),
      value: value.map(|v| STANDARD.encode(v)),
    }
  }

  fn decode(self) -> Result<ChangeRecord, String> {
    let key = STANDARD.decode(&self.key).map_err(|e| format!("key: {e}"))?;
    let value = match self.value {
      Some(v) => Some(Bytes::from(
        STANDARD.decode(&v).map_err(|e| format!("value: {e}"))?,
      )),
      None => None,
    };
    Ok(ChangeRecord {
      offset: self.offset,
      timestamp_ms: self.ts,
      key: Bytes::from(key),
      value,
    })
  }
}

fn parse_line(line: &str) -> Result<ChangeRecord, String> {
  let raw: LogLine = serde_json::from_str(line).map_err(|e| e.to_string())?;
  raw.decode()
}

/// Result of a compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionStats {
  /// Entries before compaction.
  pub before: usize,
  /// Entries after compaction.
  pub after: usize,
  /// Tombstones physically removed.
  pub tombstones_removed: usize,
}

/// File-backed change log of one store.
#[derive(Debug)]
pub struct ChangeLog {
  name: String,
  path: PathBuf,
  config: LogConfig,
  writer: Option<BufWriter<File>>,
  start_offset: u64,
  next_offset: u64,
  entries: usize,
  appended_since_compaction: usize,
  needs_newline: bool,
  corrupt: Option<(usize, String)>,
}

impl ChangeLog {
  /// Opens (or prepares to create) the log at `path` and scans it to find the
  /// retained offset range.
  pub fn open(
    name: impl Into<String>,
    path: impl AsRef<Path>,
    config: LogConfig,
  ) -> Result<Self, ChangeLogError> {
    let path = path.as_ref().to_path_buf();
    let mut log = Self {
      name: name.into(),
      path,
      config,
      writer: None,
      start_offset: 0,
      next_offset: 0,
      entries: 0,
      appended_since_compaction: 0,
      needs_newline: false,
      corrupt: None,
    };
    log.scan()?;
    Ok(log)
  }

  fn io_err(&self, source: std::io::Error) -> ChangeLogError {
    ChangeLogError::Io {
      path: self.path.clone(),
      source,
    }
  }

  fn scan(&mut self) -> Result<(), ChangeLogError> {
    let file = match File::open(&self.path) {
      Ok(f) => f,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
      Err(e) => return Err(self.io_err(e)),
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut line_no = 0usize;
    let mut first: Option<u64> = None;
    let mut last: Option<u64> = None;
    loop {
      line.clear();
      let read = reader.read_line(&mut line).map_err(|e| self.io_err(e))?;
      if read == 0 {
        break;
      }
      line_no += 1;
      self.needs_newline = !line.ends_with('\n');
      let trimmed = line.trim_end();
      if trimmed.is_empty() {
        continue;
      }
      match parse_line(trimmed) {
        Ok(record) if last.is_some_and(|l| record.offset <= l) => {
          self.corrupt = Some((line_no, format!("offset {} out of order", record.offset)));
          break;
        }
        Ok(record) => {
          first.get_or_insert(record.offset);
          last = Some(record.offset);
          self.entries += 1;
        }
        Err(reason) => {
          warn!(log = %self.name, line = line_no, %reason, "change log has an undecodable entry");
          self.corrupt = Some((line_no, reason));
          break;
        }
      }
    }
    self.next_offset = last.map_or(0, |l| l + 1);
    self.start_offset = first.unwrap_or(self.next_offset);
    Ok(())
  }

  /// Log name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Path of the log file.
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Log settings.
  pub fn config(&self) -> &LogConfig {
    &self.config
  }

  /// Offset of the first retained entry (equals [`end_offset`](Self::end_offset) when empty).
  pub fn start_offset(&self) -> u64 {
    self.start_offset
  }

  /// Offset the next appended entry will receive.
  pub fn end_offset(&self) -> u64 {
    self.next_offset
  }

  /// Number of retained entries.
  pub fn len(&self) -> usize {
    self.entries
  }

  /// Returns true if no entry is retained.
  pub fn is_empty(&self) -> bool {
    self.entries == 0
  }

  /// Returns true if an undecodable entry was found.
  pub fn is_corrupt(&self) -> bool {
    self.corrupt.is_some()
  }

  fn corrupt_error(&self) -> Option<ChangeLogError> {
    self.corrupt.as_ref().map(|(line, reason)| ChangeLogError::Corrupt {
      path: self.path.clone(),
      line: *line,
      reason: reason.clone(),
    })
  }

  fn writer(&mut self) -> Result<&mut BufWriter<File>, ChangeLogError> {
    if self.writer.is_none() {
      if let Some(parent) = self.path.parent() {
        fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
      }
      let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&self.path)
        .map_err(|e| self.io_err(e))?;
      self.writer = Some(BufWriter::new(file));
    }
    let path = self.path.clone();
    self.writer.as_mut().ok_or(ChangeLogError::Io {
      path,
      source: std::io::Error::other("change log writer unavailable"),
    })
  }

  /// Appends an entry and returns its offset. `value` of `None` is a tombstone.
  pub fn append(
    &mut self,
    key: &[u8],
    value: Option<&[u8]>,
    timestamp_ms: i64,
  ) -> Result<u64, ChangeLogError> {
    if let Some(err) = self.corrupt_error() {
      return Err(err);
    }
    let offset = self.next_offset;
    let mut line = serde_json::to_string(&LogLine::encode(offset, timestamp_ms, key, value))
      .map_err(|e| self.io_err(std::io::Error::other(e)))?;
    line.push('\n');
    if self.needs_newline {
      line.insert(0, '\n');
    }
    let path = self.path.clone();
    self
      .writer()?
      .write_all(line.as_bytes())
      .map_err(|source| ChangeLogError::Io { path, source })?;
    self.needs_newline = false;
    if self.entries == 0 {
      self.start_offset = offset;
    }
    self.next_offset += 1;
    self.entries += 1;
    self.appended_since_compaction += 1;
    Ok(offset)
  }

  /// Flushes buffered entries to disk.
  pub fn flush(&mut self) -> Result<(), ChangeLogError> {
    if let Some(writer) = self.writer.as_mut() {
      let result = writer.flush().and_then(|()| writer.get_ref().sync_data());
      result.map_err(|e| self.io_err(e))?;
    }
    Ok(())
  }

  /// Returns a lazy reader over entries with offset in `[from, end_offset())`,
  /// where the end is fixed at the time of the call.
  pub fn read_from(&mut self, from: u64) -> Result<ChangeLogReader, ChangeLogError> {
    self.flush()?;
    let until = self.next_offset;
    let lines = match File::open(&self.path) {
      Ok(f) => Some(BufReader::new(f)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
      Err(e) => return Err(self.io_err(e)),
    };
    Ok(ChangeLogReader {
      path: self.path.clone(),
      reader: lines,
      line: String::new(),
      line_no: 0,
      last: None,
      from,
      until,
      done: false,
    })
  }

  /// Returns true if the log is compacted and enough entries were appended
  /// since the last compaction.
  pub fn needs_compaction(&self) -> bool {
    self.config.cleanup_policy == CleanupPolicy::Compact
      && self.appended_since_compaction >= self.config.compaction_threshold.max(1)
  }

  /// Rewrites the log keeping the latest entry per key.
  ///
  /// Tombstones older than the retention are dropped when their offset is at
  /// or below `safe_offset`. Does nothing unless the policy is
  /// [`CleanupPolicy::Compact`].
  pub fn compact(
    &mut self,
    now_ms: i64,
    safe_offset: Option<u64>,
  ) -> Result<CompactionStats, ChangeLogError> {
    if self.config.cleanup_policy != CleanupPolicy::Compact {
      return Ok(CompactionStats {
        before: self.entries,
        after: self.entries,
        tombstones_removed: 0,
      });
    }
    if let Some(err) = self.corrupt_error() {
      return Err(err);
    }

    let records = self.read_from(0)?.collect::<Result<Vec<_>, _>>()?;
    let last_offset = records.last().map(|r| r.offset);
    let mut latest: HashMap<&Bytes, u64> = HashMap::with_capacity(records.len());
    for record in &records {
      latest.insert(&record.key, record.offset);
    }

    let retention_ms = i64::try_from(self.config.retention.as_millis()).unwrap_or(i64::MAX);
    let mut tombstones_removed = 0;
    let kept: Vec<&ChangeRecord> = records
      .iter()
      .filter(|r| latest.get(&r.key) == Some(&r.offset))
      .filter(|r| {
        let removable = r.is_tombstone()
          && Some(r.offset) != last_offset
          && safe_offset.is_some_and(|s| r.offset <= s)
          && now_ms.saturating_sub(r.timestamp_ms) > retention_ms;
        if removable {
          tombstones_removed += 1;
        }
        !removable
      })
      .collect();

    let tmp = self.path.with_extension("compacting");
    {
      let file = File::create(&tmp).map_err(|e| self.io_err(e))?;
      let mut out = BufWriter::new(file);
      for record in &kept {
        let line = LogLine::encode(
          record.offset,
          record.timestamp_ms,
          &record.key,
          record.value.as_deref(),
        );
        let mut json =
          serde_json::to_string(&line).map_err(|e| self.io_err(std::io::Error::other(e)))?;
        json.push('\n');
        out.write_all(json.as_bytes()).map_err(|e| self.io_err(e))?;
      }
      let result = out.flush().and_then(|()| out.get_ref().sync_data());
      result.map_err(|e| self.io_err(e))?;
    }
    // the old writer points at the replaced file
    self.writer = None;
    fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;

    let stats = CompactionStats {
      before: records.len(),
      after: kept.len(),
      tombstones_removed,
    };
    self.entries = kept.len();
    self.start_offset = kept.first().map_or(self.next_offset, |r| r.offset);
    self.appended_since_compaction = 0;
    self.needs_newline = false;
    debug!(
      log = %self.name,
      before = stats.before,
      after = stats.after,
      tombstones_removed,
      "compacted change log"
    );
    Ok(stats)
  }
}

/// Lazy, finite reader over a range of change log entries.
pub struct ChangeLogReader {
  path: PathBuf,
  reader: Option<BufReader<File>>,
  line: String,
  line_no: usize,
  last: Option<u64>,
  from: u64,
  until: u64,
  done: bool,
}

impl ChangeLogReader {
  /// Offset at which the reader stops (exclusive).
  pub fn until(&self) -> u64 {
    self.until
  }
}

impl Iterator for ChangeLogReader {
  type Item = Result<ChangeRecord, ChangeLogError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    let Some(reader) = self.reader.as_mut() else {
      self.done = true;
      return None;
    };
    loop {
      self.line.clear();
      match reader.read_line(&mut self.line) {
        Ok(0) => {
          self.done = true;
          return None;
        }
        Ok(_) => {}
        Err(source) => {
          self.done = true;
          return Some(Err(ChangeLogError::Io {
            path: self.path.clone(),
            source,
          }));
        }
      }
      self.line_no += 1;
      let trimmed = self.line.trim_end();
      if trimmed.is_empty() {
        continue;
      }
      match parse_line(trimmed) {
        Ok(record) if self.last.is_some_and(|l| record.offset <= l) => {
          self.done = true;
          return Some(Err(ChangeLogError::Corrupt {
            path: self.path.clone(),
            line: self.line_no,
            reason: format!("offset {} out of order", record.offset),
          }));
        }
        Ok(record) if record.offset >= self.until => {
          self.done = true;
          return None;
        }
        Ok(record) if record.offset < self.from => {
          self.last = Some(record.offset);
          continue;
        }
        Ok(record) => {
          self.last = Some(record.offset);
          return Some(Ok(record));
        }
        Err(reason) => {
          self.done = true;
          return Some(Err(ChangeLogError::Corrupt {
            path: self.path.clone(),
            line: self.line_no,
            reason,
          }));
        }
      }
    }
  }
}
