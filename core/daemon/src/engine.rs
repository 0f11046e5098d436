//! Attendance state engine: the single owner of "who is inside".
//!
//! The presence map is keyed by tag and guarded by one `RwLock`. Every
//! decide-and-write step (toggle, directional sign-in/out, sweep) holds the
//! writer lock for the whole decision, so a tag can never hold two open
//! intervals. Durable side effects (session append, snapshot rewrite) run
//! after the lock is released and are best-effort: a failure is logged and
//! the in-memory transition stands.
//!
//! Callers sample `now` before taking the lock, so a close time can trail
//! the start it closes. `close_time` keeps every closed interval strictly
//! positive.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::directory::{Directory, Identity};
use crate::error::{AttendanceError, Result};
use crate::session_store::{ClosedInterval, SessionStore};
use crate::snapshot::{LiveSnapshot, PresenceMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub direction: Direction,
    pub identity: Identity,
    pub at: DateTime<Utc>,
    /// Start of the interval that was closed; only set for `Out`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_start: Option<DateTime<Utc>>,
}

impl Transition {
    pub fn message(&self) -> String {
        match (self.direction, self.prior_start) {
            (Direction::Out, Some(start)) => format!(
                "Goodbye, {}! Duration: {}",
                self.identity.display_name,
                format_duration(self.at.signed_duration_since(start))
            ),
            (Direction::Out, None) => format!("Goodbye, {}!", self.identity.display_name),
            (Direction::In, _) => format!("Welcome, {}!", self.identity.display_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresentEntry {
    pub tag_id: String,
    /// `None` when a restored tag no longer resolves in the directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(rename = "signin_time")]
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub tag_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub count: usize,
    /// Intervals closed for identities that still resolve, including those
    /// whose durable write failed. Tags that no longer resolve appear only
    /// in `failures`.
    pub closed: Vec<ClosedInterval>,
    pub failures: Vec<SweepFailure>,
}

pub struct AttendanceEngine {
    directory: Arc<Directory>,
    sessions: SessionStore,
    snapshot: LiveSnapshot,
    present: RwLock<PresenceMap>,
}

impl AttendanceEngine {
    /// Restores live state from the snapshot. A malformed snapshot fails
    /// startup rather than discarding open intervals.
    pub fn open(
        directory: Arc<Directory>,
        sessions: SessionStore,
        snapshot: LiveSnapshot,
    ) -> Result<Self> {
        let restored = snapshot.load()?;
        let unresolved = restored
            .keys()
            .filter(|tag_id| directory.resolve(tag_id).is_none())
            .count();
        if unresolved > 0 {
            warn!(
                unresolved,
                "Restored presence includes tags missing from the directory"
            );
        }
        info!(
            present = restored.len(),
            path = %snapshot.path().display(),
            "Live state restored"
        );

        Ok(Self {
            directory,
            sessions,
            snapshot,
            present: RwLock::new(restored),
        })
    }

    /// Signs the tag in if absent, out if present, as one indivisible step.
    pub fn toggle(&self, tag_id: &str, now: DateTime<Utc>) -> Result<Transition> {
        let identity = self.resolve(tag_id)?;

        let prior_start = {
            let mut present = self.write_present();
            match present.remove(tag_id) {
                Some(start) => Some(start),
                None => {
                    present.insert(tag_id.to_string(), now);
                    None
                }
            }
        };

        let transition = match prior_start {
            Some(start) => self.finish_sign_out(identity, start, close_time(start, now)),
            None => self.finish_sign_in(identity, now),
        };
        Ok(transition)
    }

    pub fn sign_in(&self, tag_id: &str, now: DateTime<Utc>) -> Result<Transition> {
        let identity = self.resolve(tag_id)?;
        self.sign_in_identity(identity, now)
    }

    pub fn sign_out(&self, tag_id: &str, now: DateTime<Utc>) -> Result<Transition> {
        let identity = self.resolve(tag_id)?;
        self.sign_out_identity(identity, now)
    }

    pub fn sign_in_by_external_id(
        &self,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let identity = self.resolve_external(external_id)?;
        self.sign_in_identity(identity, now)
    }

    pub fn sign_out_by_external_id(
        &self,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let identity = self.resolve_external(external_id)?;
        self.sign_out_identity(identity, now)
    }

    /// Earliest arrival first. Reflects one consistent view of the map.
    pub fn list_present(&self) -> Vec<PresentEntry> {
        let mut entries: Vec<(String, DateTime<Utc>)> = self
            .read_present()
            .iter()
            .map(|(tag_id, start)| (tag_id.clone(), *start))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        entries
            .into_iter()
            .map(|(tag_id, start_time)| PresentEntry {
                identity: self.directory.resolve(&tag_id),
                tag_id,
                start_time,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.read_present().len()
    }

    pub fn is_present(&self, tag_id: &str) -> bool {
        self.read_present().contains_key(tag_id)
    }

    /// Closes every open interval at `now` and empties the map. Storage
    /// failures are collected per tag; they never stop the sweep.
    pub fn force_sign_out_all(&self, now: DateTime<Utc>) -> SweepReport {
        let taken = std::mem::take(&mut *self.write_present());
        if taken.is_empty() {
            return SweepReport::default();
        }

        self.persist_snapshot();

        let mut swept: Vec<(String, DateTime<Utc>)> = taken.into_iter().collect();
        swept.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut report = SweepReport {
            count: swept.len(),
            ..SweepReport::default()
        };

        for (tag_id, start) in swept {
            let end = close_time(start, now);
            let Some(identity) = self.directory.resolve(&tag_id) else {
                warn!(tag_id = %tag_id, "Swept tag no longer resolves; session not recorded");
                report.failures.push(SweepFailure {
                    tag_id: tag_id.clone(),
                    error: AttendanceError::UnknownIdentity(tag_id).to_string(),
                });
                continue;
            };

            if let Err(err) = self.sessions.append(identity.id, start, end) {
                warn!(
                    error = %err,
                    tag_id = %tag_id,
                    member_id = identity.id,
                    "Failed to record swept session"
                );
                report.failures.push(SweepFailure {
                    tag_id,
                    error: err.to_string(),
                });
            }
            report.closed.push(ClosedInterval {
                identity_id: identity.id,
                start_time: start,
                end_time: end,
            });
        }

        info!(
            count = report.count,
            failures = report.failures.len(),
            "Signed out all attendees"
        );
        report
    }

    /// Flushes a final snapshot. Called once on orderly shutdown.
    pub fn shutdown(&self) -> Result<()> {
        let copy = self.read_present().clone();
        self.snapshot.save(&copy)?;
        info!(present = copy.len(), "Final snapshot written");
        Ok(())
    }

    fn sign_in_identity(&self, identity: Identity, now: DateTime<Utc>) -> Result<Transition> {
        {
            let mut present = self.write_present();
            if present.contains_key(&identity.tag_id) {
                return Err(AttendanceError::AlreadyPresent(identity.display_name));
            }
            present.insert(identity.tag_id.clone(), now);
        }
        Ok(self.finish_sign_in(identity, now))
    }

    fn sign_out_identity(&self, identity: Identity, now: DateTime<Utc>) -> Result<Transition> {
        let start = self
            .write_present()
            .remove(&identity.tag_id)
            .ok_or_else(|| AttendanceError::NotPresent(identity.display_name.clone()))?;
        Ok(self.finish_sign_out(identity, start, close_time(start, now)))
    }

    fn finish_sign_in(&self, identity: Identity, now: DateTime<Utc>) -> Transition {
        self.persist_snapshot();
        info!(
            member_id = identity.id,
            tag_id = %identity.tag_id,
            name = %identity.display_name,
            "Signed in"
        );
        Transition {
            direction: Direction::In,
            identity,
            at: now,
            prior_start: None,
        }
    }

    fn finish_sign_out(
        &self,
        identity: Identity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Transition {
        if let Err(err) = self.sessions.append(identity.id, start, end) {
            warn!(
                error = %err,
                member_id = identity.id,
                tag_id = %identity.tag_id,
                "Failed to record session; presence change kept"
            );
        }
        self.persist_snapshot();
        info!(
            member_id = identity.id,
            tag_id = %identity.tag_id,
            name = %identity.display_name,
            duration_secs = end.signed_duration_since(start).num_seconds(),
            "Signed out"
        );
        Transition {
            direction: Direction::Out,
            identity,
            at: end,
            prior_start: Some(start),
        }
    }

    fn persist_snapshot(&self) {
        let copy = self.read_present().clone();
        if let Err(err) = self.snapshot.save(&copy) {
            warn!(error = %err, "Failed to write live snapshot");
        }
    }

    fn resolve(&self, tag_id: &str) -> Result<Identity> {
        self.directory.resolve(tag_id).ok_or_else(|| {
            info!(tag_id = %tag_id, "Unknown tag scanned");
            AttendanceError::UnknownIdentity(tag_id.to_string())
        })
    }

    fn resolve_external(&self, external_id: &str) -> Result<Identity> {
        self.directory
            .resolve_by_external_id(external_id)
            .ok_or_else(|| AttendanceError::UnknownIdentity(external_id.to_string()))
    }

    // Every critical section leaves the map valid, so a poisoned lock is
    // still safe to use.
    fn read_present(&self) -> RwLockReadGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.present
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_present(&self) -> RwLockWriteGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.present
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// End instant for an interval opened at `start`; never earlier than one
/// microsecond after it.
fn close_time(start: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > start {
        now
    } else {
        start + chrono::Duration::microseconds(1)
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::session_store::SessionFilter;
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;
    use std::thread;

    struct Harness {
        dir: tempfile::TempDir,
        db: Arc<Db>,
        directory: Arc<Directory>,
        engine: Arc<AttendanceEngine>,
    }

    impl Harness {
        fn snapshot_path(&self) -> PathBuf {
            self.dir.path().join("current_attendees.json")
        }

        fn sessions(&self) -> Vec<crate::session_store::SessionRecord> {
            SessionStore::new(Arc::clone(&self.db))
                .query(&SessionFilter::default())
                .expect("query sessions")
        }

        fn reopen(&self) -> AttendanceEngine {
            AttendanceEngine::open(
                Arc::clone(&self.directory),
                SessionStore::new(Arc::clone(&self.db)),
                LiveSnapshot::new(self.snapshot_path()),
            )
            .expect("reopen engine")
        }
    }

    fn harness_with(members: &[(&str, &str, &str)]) -> Harness {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(dir.path().join("attendance.db")).expect("db init"));
        for (name, tag, external) in members {
            db.insert_member(name, tag, external).expect("seed member");
        }
        let directory = Arc::new(Directory::load(Arc::clone(&db)).expect("directory"));
        let engine = AttendanceEngine::open(
            Arc::clone(&directory),
            SessionStore::new(Arc::clone(&db)),
            LiveSnapshot::new(dir.path().join("current_attendees.json")),
        )
        .expect("engine");
        Harness {
            dir,
            db,
            directory,
            engine: Arc::new(engine),
        }
    }

    fn harness() -> Harness {
        harness_with(&[("Alice", "U1", "111"), ("Bob", "U2", "222")])
    }

    fn t(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, hour, minute, 0).unwrap()
    }

    #[test]
    fn toggle_in_then_out_records_session() {
        let h = harness();

        let first = h.engine.toggle("U1", t(9, 0)).expect("toggle in");
        assert_eq!(first.direction, Direction::In);
        assert_eq!(first.prior_start, None);
        assert!(h.engine.is_present("U1"));

        let second = h.engine.toggle("U1", t(10, 30)).expect("toggle out");
        assert_eq!(second.direction, Direction::Out);
        assert_eq!(second.prior_start, Some(t(9, 0)));
        assert_eq!(second.message(), "Goodbye, Alice! Duration: 1h30m0s");
        assert_eq!(h.engine.count(), 0);

        let sessions = h.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "Alice");
        assert_eq!(sessions[0].start_time, t(9, 0));
        assert_eq!(sessions[0].end_time, t(10, 30));
    }

    #[test]
    fn unknown_tag_leaves_map_unchanged() {
        let h = harness();
        h.engine.toggle("U2", t(9, 0)).expect("bob in");

        let err = h.engine.toggle("UX", t(9, 5)).unwrap_err();
        assert!(matches!(err, AttendanceError::UnknownIdentity(tag) if tag == "UX"));

        let present = h.engine.list_present();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].tag_id, "U2");
        assert!(h.sessions().is_empty());
    }

    #[test]
    fn directional_operations_reject_wrong_state() {
        let h = harness();

        assert!(matches!(
            h.engine.sign_out("U1", t(9, 0)),
            Err(AttendanceError::NotPresent(_))
        ));
        h.engine.sign_in("U1", t(9, 0)).expect("sign in");
        assert!(matches!(
            h.engine.sign_in("U1", t(9, 1)),
            Err(AttendanceError::AlreadyPresent(_))
        ));

        let out = h.engine.sign_out("U1", t(11, 0)).expect("sign out");
        assert_eq!(out.prior_start, Some(t(9, 0)));
        assert_eq!(h.sessions().len(), 1);
    }

    #[test]
    fn external_id_entry_points_share_state_with_scans() {
        let h = harness();

        let signed_in = h
            .engine
            .sign_in_by_external_id("222", t(8, 0))
            .expect("external sign in");
        assert_eq!(signed_in.identity.tag_id, "U2");

        let scanned = h.engine.toggle("U2", t(12, 0)).expect("scan out");
        assert_eq!(scanned.direction, Direction::Out);
        assert!(matches!(
            h.engine.sign_out_by_external_id("222", t(12, 1)),
            Err(AttendanceError::NotPresent(_))
        ));
        assert!(matches!(
            h.engine.sign_in_by_external_id("999", t(12, 2)),
            Err(AttendanceError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn list_present_orders_by_arrival() {
        let h = harness_with(&[
            ("Alice", "U1", "111"),
            ("Bob", "U2", "222"),
            ("Carol", "U3", "333"),
        ]);
        h.engine.toggle("U3", t(9, 30)).unwrap();
        h.engine.toggle("U1", t(8, 0)).unwrap();
        h.engine.toggle("U2", t(9, 0)).unwrap();

        let names: Vec<_> = h
            .engine
            .list_present()
            .into_iter()
            .map(|entry| entry.identity.expect("resolved").display_name)
            .collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
    }

    #[test]
    fn force_sign_out_all_closes_every_interval_at_sweep_time() {
        let h = harness();
        h.engine.toggle("U1", t(9, 0)).unwrap();
        h.engine.toggle("U2", t(10, 0)).unwrap();
        let sweep_at = Utc.with_ymd_and_hms(2024, 1, 16, 4, 0, 0).unwrap();

        let report = h.engine.force_sign_out_all(sweep_at);

        assert_eq!(report.count, 2);
        assert!(report.failures.is_empty());
        assert_eq!(report.closed.len(), 2);
        assert!(report.closed.iter().all(|c| c.end_time == sweep_at));
        assert_eq!(h.engine.count(), 0);

        let sessions = h.sessions();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.end_time == sweep_at));
    }

    #[test]
    fn force_sign_out_all_on_empty_map_is_a_no_op() {
        let h = harness();
        let report = h.engine.force_sign_out_all(t(4, 0));
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn sweep_collects_storage_failures_and_still_clears() {
        let h = harness();
        h.engine.toggle("U1", t(9, 0)).unwrap();
        h.engine.toggle("U2", t(10, 0)).unwrap();
        // Remove Bob's row behind the cache so his append violates the foreign key.
        let bob = h.directory.resolve("U2").unwrap();
        h.db.delete_member(bob.id).expect("direct delete");

        let report = h.engine.force_sign_out_all(t(23, 0));

        assert_eq!(report.count, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tag_id, "U2");
        assert_eq!(h.engine.count(), 0);
        assert_eq!(h.sessions().len(), 1);
    }

    #[test]
    fn failed_append_does_not_roll_back_sign_out() {
        let h = harness();
        h.engine.toggle("U1", t(9, 0)).unwrap();
        let alice = h.directory.resolve("U1").unwrap();
        h.db.delete_member(alice.id).expect("direct delete");

        let out = h.engine.toggle("U1", t(10, 0)).expect("toggle still succeeds");
        assert_eq!(out.direction, Direction::Out);
        assert!(!h.engine.is_present("U1"));
    }

    #[test]
    fn snapshot_failure_does_not_block_transitions() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(dir.path().join("attendance.db")).expect("db init"));
        db.insert_member("Alice", "U1", "111").unwrap();
        let directory = Arc::new(Directory::load(Arc::clone(&db)).unwrap());
        // Parent of the snapshot path is a regular file, so every save fails.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let engine = AttendanceEngine::open(
            directory,
            SessionStore::new(Arc::clone(&db)),
            LiveSnapshot::new(blocker.join("current_attendees.json")),
        )
        .expect("engine");

        engine.toggle("U1", t(9, 0)).expect("toggle in");
        assert!(engine.is_present("U1"));
        assert!(engine.shutdown().is_err());
    }

    #[test]
    fn live_state_survives_restart() {
        let h = harness();
        h.engine.toggle("U1", t(9, 0)).unwrap();
        h.engine.toggle("U2", t(9, 15)).unwrap();
        h.engine.toggle("U2", t(9, 45)).unwrap();
        h.engine.shutdown().expect("shutdown");

        let restarted = h.reopen();
        assert!(restarted.is_present("U1"));
        assert!(!restarted.is_present("U2"));

        let out = restarted.toggle("U1", t(17, 0)).expect("toggle out");
        assert_eq!(out.prior_start, Some(t(9, 0)));
    }

    #[test]
    fn corrupt_snapshot_fails_open() {
        let h = harness();
        std::fs::write(h.snapshot_path(), "[1, 2").unwrap();
        let result = AttendanceEngine::open(
            Arc::clone(&h.directory),
            SessionStore::new(Arc::clone(&h.db)),
            LiveSnapshot::new(h.snapshot_path()),
        );
        assert!(matches!(
            result,
            Err(AttendanceError::SnapshotCorrupt { .. })
        ));
    }

    #[test]
    fn concurrent_toggles_on_distinct_tags_lose_nothing() {
        let members: Vec<(String, String, String)> = (0..32)
            .map(|i| (format!("Member {}", i), format!("TAG{}", i), format!("{}", i)))
            .collect();
        let borrowed: Vec<(&str, &str, &str)> = members
            .iter()
            .map(|(n, t, e)| (n.as_str(), t.as_str(), e.as_str()))
            .collect();
        let h = harness_with(&borrowed);

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let engine = Arc::clone(&h.engine);
                thread::spawn(move || {
                    engine
                        .toggle(&format!("TAG{}", i), Utc::now())
                        .expect("toggle")
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("join").direction, Direction::In);
        }

        assert_eq!(h.engine.count(), 32);
    }

    #[test]
    fn concurrent_toggles_on_one_tag_alternate() {
        let h = harness();
        let start = t(9, 0);

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let engine = Arc::clone(&h.engine);
                thread::spawn(move || {
                    engine
                        .toggle("U1", start + Duration::minutes(i))
                        .expect("toggle")
                        .direction
                })
            })
            .collect();
        let ins = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|direction| *direction == Direction::In)
            .count();

        assert_eq!(ins, 10);
        assert!(!h.engine.is_present("U1"));

        let sessions = h.sessions();
        assert_eq!(sessions.len(), 10);
        assert!(sessions.iter().all(|s| s.end_time > s.start_time));
    }

    #[test]
    fn out_of_order_close_still_records_session() {
        let h = harness();
        h.engine.toggle("U1", t(10, 0)).expect("toggle in");

        // A request stamped earlier can reach the lock later.
        let out = h.engine.toggle("U1", t(9, 59)).expect("toggle out");
        assert_eq!(out.direction, Direction::Out);
        assert_eq!(out.prior_start, Some(t(10, 0)));
        assert!(out.at > t(10, 0));

        let sessions = h.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_time, t(10, 0));
        assert_eq!(sessions[0].end_time, t(10, 0) + Duration::microseconds(1));
    }

    #[test]
    fn sweep_behind_a_late_sign_in_still_records_it() {
        let h = harness();
        h.engine.sign_in("U1", t(9, 0)).expect("sign in");
        h.engine.sign_in("U2", t(12, 0)).expect("sign in");

        let report = h.engine.force_sign_out_all(t(11, 0));

        assert_eq!(report.count, 2);
        assert!(report.failures.is_empty());
        assert_eq!(report.closed.len(), 2);
        assert!(report
            .closed
            .iter()
            .all(|closed| closed.end_time > closed.start_time));
        assert_eq!(h.sessions().len(), 2);
    }

    #[test]
    fn sweep_reports_unresolvable_tags_as_failures_only() {
        let h = harness();
        h.engine.toggle("U1", t(9, 0)).unwrap();
        h.engine.toggle("U2", t(10, 0)).unwrap();
        let bob = h.directory.resolve("U2").unwrap();
        h.db.delete_member(bob.id).expect("direct delete");
        h.directory.refresh().expect("refresh cache");

        let report = h.engine.force_sign_out_all(t(23, 0));

        assert_eq!(report.count, 2);
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tag_id, "U2");
        assert_eq!(h.engine.count(), 0);
    }
}
