//! Daemon-wide state: the engine plus the stores the request layer reads.
//!
//! Handlers only talk to `SharedState`. The engine owns presence; the
//! directory and session store are exposed through thin wrappers that add
//! the cross-component guards (presence checks on member edits).

use attendance_protocol::IdentityRef;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::config::DaemonPaths;
use crate::db::Db;
use crate::directory::{Directory, Identity};
use crate::engine::{AttendanceEngine, PresentEntry, SweepReport, Transition};
use crate::error::{AttendanceError, Result};
use crate::scan_log::{ScanEvent, ScanLog};
use crate::session_store::{SessionFilter, SessionRecord, SessionStore};
use crate::snapshot::LiveSnapshot;
use crate::sweep::{SweepStatus, SweepTracker};

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub started_at: DateTime<Utc>,
    pub present: usize,
    pub members: usize,
    pub data_dir: PathBuf,
    pub sweep: SweepStatus,
    pub security: SecuritySnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecuritySnapshot {
    pub rejected_connections: u64,
}

pub struct SharedState {
    directory: Arc<Directory>,
    sessions: SessionStore,
    engine: Arc<AttendanceEngine>,
    scans: ScanLog,
    sweep: SweepTracker,
    paths: DaemonPaths,
    started_at: DateTime<Utc>,
    rejected_connections: AtomicU64,
}

impl SharedState {
    /// Opens storage, loads the directory and restores live state. Any
    /// failure here is fatal to startup.
    pub fn open(paths: DaemonPaths, scan_history_len: usize, sweep: SweepTracker) -> Result<Self> {
        let db = Arc::new(Db::new(paths.db.clone())?);
        let directory = Arc::new(Directory::load(Arc::clone(&db))?);
        let sessions = SessionStore::new(db);
        let engine = Arc::new(AttendanceEngine::open(
            Arc::clone(&directory),
            sessions.clone(),
            LiveSnapshot::new(paths.snapshot.clone()),
        )?);

        Ok(Self {
            directory,
            sessions,
            engine,
            scans: ScanLog::new(scan_history_len),
            sweep,
            paths,
            started_at: Utc::now(),
            rejected_connections: AtomicU64::new(0),
        })
    }

    pub fn engine(&self) -> Arc<AttendanceEngine> {
        Arc::clone(&self.engine)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            started_at: self.started_at,
            present: self.engine.count(),
            members: self.directory.member_count(),
            data_dir: self.paths.data_dir.clone(),
            sweep: self.sweep.snapshot(),
            security: SecuritySnapshot {
                rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            },
        }
    }

    pub fn record_rejected_connection(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Every scan is logged, resolvable or not.
    pub fn scan(&self, tag_id: &str, now: DateTime<Utc>) -> Result<Transition> {
        self.scans.record(tag_id, now);
        self.engine.toggle(tag_id, now)
    }

    pub fn sign_in(&self, who: &IdentityRef, now: DateTime<Utc>) -> Result<Transition> {
        match who {
            IdentityRef::Tag(tag_id) => self.engine.sign_in(tag_id, now),
            IdentityRef::External(external_id) => {
                self.engine.sign_in_by_external_id(external_id, now)
            }
        }
    }

    pub fn sign_out(&self, who: &IdentityRef, now: DateTime<Utc>) -> Result<Transition> {
        match who {
            IdentityRef::Tag(tag_id) => self.engine.sign_out(tag_id, now),
            IdentityRef::External(external_id) => {
                self.engine.sign_out_by_external_id(external_id, now)
            }
        }
    }

    pub fn sign_out_all(&self, now: DateTime<Utc>) -> SweepReport {
        self.engine.force_sign_out_all(now)
    }

    pub fn present(&self) -> Vec<PresentEntry> {
        self.engine.list_present()
    }

    pub fn count(&self) -> usize {
        self.engine.count()
    }

    pub fn history(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        self.sessions.query(filter)
    }

    pub fn delete_history(&self, filter: &SessionFilter) -> Result<usize> {
        let deleted = self.sessions.delete(filter)?;
        info!(deleted, "History deleted");
        Ok(deleted)
    }

    pub fn scan_history(&self) -> Vec<ScanEvent> {
        self.scans.recent()
    }

    pub fn list_members(&self) -> Result<Vec<Identity>> {
        self.directory.list()
    }

    pub fn create_member(&self, name: &str, tag_id: &str, external_id: &str) -> Result<Identity> {
        self.directory.create(name, tag_id, external_id)
    }

    /// A present member keeps their tag until they sign out; otherwise the
    /// open interval would be keyed by a tag nobody owns.
    pub fn update_member(
        &self,
        id: i64,
        name: &str,
        tag_id: &str,
        external_id: &str,
    ) -> Result<Identity> {
        let current = self.directory.get(id)?;
        if current.tag_id != tag_id.trim() && self.engine.is_present(&current.tag_id) {
            return Err(AttendanceError::CurrentlyPresent(current.display_name));
        }
        self.directory.update(id, name, tag_id, external_id)
    }

    pub fn delete_member(&self, id: i64) -> Result<Identity> {
        let member = self.directory.get(id)?;
        if self.engine.is_present(&member.tag_id) {
            return Err(AttendanceError::CurrentlyPresent(member.display_name));
        }

        let removed_sessions = self.sessions.cascade_delete_for(id)?;
        self.directory.delete(id)?;
        info!(member_id = id, removed_sessions, "Member and history removed");
        Ok(member)
    }

    pub fn export_members(&self) -> Result<(usize, PathBuf)> {
        let path = self.paths.members_export.clone();
        let count = self.directory.export_to(&path)?;
        Ok((count, path))
    }

    pub fn import_members(&self) -> Result<(usize, PathBuf)> {
        let path = self.paths.members_export.clone();
        let count = self.directory.import_from(&path)?;
        Ok((count, path))
    }
}
