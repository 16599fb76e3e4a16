//! File-backed action log.

use super::csv::{decode_record, encode_record, HEADER};
use super::entry::{ActionLogEntry, LogAction};
use super::LogStoreError;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was added to the existing log.
    Appended,
    /// The log was reset to its header before the record was added.
    Rotated,
}

/// Size-bounded, append-only CSV log of every decision.
///
/// Every operation holds the store lock for its full duration, so an append
/// never interleaves with the read-modify-write of an amendment.
pub struct ActionLogStore {
    path: PathBuf,
    max_bytes: u64,
    lock: Mutex<()>,
}

impl ActionLogStore {
    /// Open the log at `path`, writing the header if the file is missing or empty.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, LogStoreError> {
        let store = Self {
            path: path.into(),
            max_bytes,
            lock: Mutex::new(()),
        };

        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let needs_header = match fs::metadata(&store.path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if needs_header {
            store.replace_contents(&format!("{HEADER}\n"))?;
        }

        debug!(path = %store.path.display(), max_bytes, "Action log opened");
        Ok(store)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, resetting the log first if it would outgrow the ceiling.
    pub fn append(&self, entry: &ActionLogEntry) -> Result<AppendOutcome, LogStoreError> {
        let _guard = self.guard()?;

        let line = format!("{}\n", encode_record(entry));
        let current = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let outcome = if current == 0 || current + line.len() as u64 > self.max_bytes {
            if current > 0 {
                info!(
                    path = %self.path.display(),
                    size = current,
                    max_bytes = self.max_bytes,
                    "Action log reached its size limit, starting a fresh log"
                );
            }
            self.replace_contents(&format!("{HEADER}\n"))?;
            if current > 0 {
                AppendOutcome::Rotated
            } else {
                AppendOutcome::Appended
            }
        } else {
            AppendOutcome::Appended
        };

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;

        Ok(outcome)
    }

    /// Read every well-formed record in file order.
    pub fn read_all(&self) -> Result<Vec<ActionLogEntry>, LogStoreError> {
        let _guard = self.guard()?;
        let content = self.read_contents()?;

        let mut malformed = 0usize;
        let entries: Vec<ActionLogEntry> = content
            .lines()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let entry = decode_record(line);
                if entry.is_none() {
                    malformed += 1;
                }
                entry
            })
            .collect();

        if malformed > 0 {
            warn!(
                path = %self.path.display(),
                skipped = malformed,
                "Skipped malformed action log lines"
            );
        }

        Ok(entries)
    }

    /// Flag the most recent record for `ray_id` as synced.
    ///
    /// Returns whether a record changed.
    pub fn mark_synced(&self, ray_id: &str) -> Result<bool, LogStoreError> {
        Ok(self.mark_synced_many(&[ray_id])? > 0)
    }

    /// Flag the most recent record of each ray id as synced, in one rewrite.
    ///
    /// A `REPORTED` record is preferred over later records that share the ray
    /// id. Records already flagged stay as they are. Returns the number of
    /// records changed.
    pub fn mark_synced_many<S: AsRef<str>>(&self, ray_ids: &[S]) -> Result<usize, LogStoreError> {
        let _guard = self.guard()?;
        let content = self.read_contents()?;

        let wanted: HashSet<&str> = ray_ids.iter().map(|id| id.as_ref()).collect();
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        // (line index, entry) of the chosen record per ray id
        let mut targets: HashMap<String, (usize, ActionLogEntry)> = HashMap::new();
        for (index, line) in lines.iter().enumerate().skip(1) {
            let Some(entry) = decode_record(line) else {
                continue;
            };
            if !wanted.contains(entry.ray_id.as_str()) {
                continue;
            }
            let replace = match targets.get(&entry.ray_id) {
                None => true,
                Some((_, chosen)) => {
                    entry.action == LogAction::Reported || chosen.action != LogAction::Reported
                }
            };
            if replace {
                targets.insert(entry.ray_id.clone(), (index, entry));
            }
        }

        let mut changed = 0usize;
        for (index, mut entry) in targets.into_values() {
            if entry.secondary_synced {
                continue;
            }
            entry.secondary_synced = true;
            lines[index] = encode_record(&entry);
            changed += 1;
        }

        if changed > 0 {
            let mut rewritten = lines.join("\n");
            rewritten.push('\n');
            self.replace_contents(&rewritten)?;
        }

        Ok(changed)
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, LogStoreError> {
        self.lock.lock().map_err(|_| LogStoreError::LockPoisoned)
    }

    fn read_contents(&self) -> Result<String, LogStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the whole file through a sibling temp file and rename it into place.
    fn replace_contents(&self, content: &str) -> Result<(), LogStoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
