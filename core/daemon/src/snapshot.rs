//! Durable mirror of the live presence map, read once at startup.

use chrono::{DateTime, Utc};
use fs_err as fs;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{AttendanceError, Result};

pub type PresenceMap = HashMap<String, DateTime<Utc>>;

pub struct LiveSnapshot {
    path: PathBuf,
    writes: AtomicU64,
}

impl LiveSnapshot {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means nobody was present. A file that cannot be parsed
    /// is an error; startup must not silently drop open intervals.
    pub fn load(&self) -> Result<PresenceMap> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PresenceMap::new())
            }
            Err(err) => return Err(AttendanceError::storage("Failed to read snapshot", err)),
        };

        serde_json::from_slice(&data).map_err(|err| AttendanceError::SnapshotCorrupt {
            path: self.path.clone(),
            details: err.to_string(),
        })
    }

    /// Overwrites the snapshot with `entries` via a temp file and rename.
    /// Concurrent saves never share a temp file; the last rename wins.
    pub fn save(&self, entries: &PresenceMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| AttendanceError::storage("Failed to create snapshot dir", err))?;
        }

        let ordered: BTreeMap<&String, &DateTime<Utc>> = entries.iter().collect();
        let payload = serde_json::to_vec_pretty(&ordered)
            .map_err(|err| AttendanceError::storage("Failed to serialize snapshot", err))?;

        let seq = self.writes.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .path
            .with_extension(format!("tmp.{}.{}", std::process::id(), seq));
        fs::write(&tmp_path, payload)
            .map_err(|err| AttendanceError::storage("Failed to write snapshot", err))?;
        fs::rename(&tmp_path, &self.path).map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            AttendanceError::storage("Failed to commit snapshot", err)
        })?;
        Ok(())
    }
}
