//! Daily forced sign-out.
//!
//! The wake instant is recomputed from local wall-clock date arithmetic every
//! cycle, so DST changes and clock adjustments are picked up on the next
//! iteration rather than accumulating drift.

use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::{AttendanceEngine, SweepReport};

/// Upper bound on one sleep; the wake instant is re-derived after each.
const MAX_SLEEP_SECS: u64 = 300;
/// A DST gap is never longer than a few hours.
const MAX_GAP_STEPS_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    #[default]
    Idle,
    Waiting,
    Sweeping,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStatus {
    pub enabled: bool,
    pub phase: SweepPhase,
    pub schedule: String,
    pub next_sweep_at: Option<DateTime<Utc>>,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_swept: usize,
    pub last_failures: usize,
    pub total_sweeps: u64,
}

/// Shared view of the scheduler for the health report.
#[derive(Clone, Default)]
pub struct SweepTracker {
    inner: Arc<Mutex<SweepStatus>>,
}

impl SweepTracker {
    pub fn new(enabled: bool, at: NaiveTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SweepStatus {
                enabled,
                schedule: at.format("%H:%M").to_string(),
                ..SweepStatus::default()
            })),
        }
    }

    pub fn snapshot(&self) -> SweepStatus {
        self.lock().clone()
    }

    fn waiting_until(&self, next: DateTime<Utc>) {
        let mut status = self.lock();
        status.phase = SweepPhase::Waiting;
        status.next_sweep_at = Some(next);
    }

    fn sweeping(&self) {
        self.lock().phase = SweepPhase::Sweeping;
    }

    fn finished(&self, at: DateTime<Utc>, report: &SweepReport) {
        let mut status = self.lock();
        status.phase = SweepPhase::Idle;
        status.last_sweep_at = Some(at);
        status.last_swept = report.count;
        status.last_failures = report.failures.len();
        status.total_sweeps += 1;
    }

    fn lock(&self) -> MutexGuard<'_, SweepStatus> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// First instant strictly after `now` whose local wall-clock time is `at`.
///
/// A nonexistent local time (spring-forward gap) moves forward to the first
/// valid minute; an ambiguous one (fall-back fold) resolves to the earlier
/// instant.
pub fn next_sweep_after<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();

    loop {
        if let Some(candidate) = resolve_local(&tz, date.and_time(at)) {
            if candidate > *now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            // End of the representable calendar; nothing later exists.
            None => return now.clone(),
        }
    }
}

fn resolve_local<Tz: TimeZone>(
    tz: &Tz,
    mut local: chrono::NaiveDateTime,
) -> Option<DateTime<Tz>> {
    for _ in 0..=MAX_GAP_STEPS_MINUTES {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(instant) => return Some(instant),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest),
            LocalResult::None => local += ChronoDuration::minutes(1),
        }
    }
    None
}

pub struct SweepScheduler {
    engine: Arc<AttendanceEngine>,
    at: NaiveTime,
    tracker: SweepTracker,
}

impl SweepScheduler {
    pub fn new(engine: Arc<AttendanceEngine>, at: NaiveTime, tracker: SweepTracker) -> Self {
        Self {
            engine,
            at,
            tracker,
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("attendance-sweep".to_string())
            .spawn(move || self.run())
    }

    /// Runs one sweep at `now` and records the outcome.
    pub fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        self.tracker.sweeping();
        let report = self.engine.force_sign_out_all(now);
        self.tracker.finished(now, &report);
        if !report.failures.is_empty() {
            warn!(
                failures = report.failures.len(),
                swept = report.count,
                "Scheduled sweep finished with storage failures"
            );
        }
        report
    }

    fn run(self) {
        info!(at = %self.at.format("%H:%M"), "Sweep scheduler started");
        loop {
            let next = next_sweep_after(&Local::now(), self.at).with_timezone(&Utc);
            self.tracker.waiting_until(next);
            info!(next_sweep_at = %next, "Next sweep scheduled");

            loop {
                let remaining = next.signed_duration_since(Utc::now());
                if remaining <= ChronoDuration::zero() {
                    break;
                }
                let secs = remaining.num_seconds().clamp(1, MAX_SLEEP_SECS as i64) as u64;
                thread::sleep(Duration::from_secs(secs));
            }

            let report = self.run_once(Utc::now());
            info!(swept = report.count, "Scheduled sweep complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::directory::Directory;
    use crate::session_store::SessionStore;
    use crate::snapshot::LiveSnapshot;
    use chrono::{FixedOffset, NaiveDate, NaiveDateTime};

    /// US Eastern rules for 2024 only: EDT from 2024-03-10 07:00 UTC until
    /// 2024-11-03 06:00 UTC, EST otherwise.
    #[derive(Debug, Clone, Copy)]
    struct Eastern2024;

    fn naive(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn est() -> FixedOffset {
        FixedOffset::west_opt(5 * 3600).unwrap()
    }

    fn edt() -> FixedOffset {
        FixedOffset::west_opt(4 * 3600).unwrap()
    }

    fn eastern_offset_at(utc: &NaiveDateTime) -> FixedOffset {
        if *utc >= naive(2024, 3, 10, 7, 0) && *utc < naive(2024, 11, 3, 6, 0) {
            edt()
        } else {
            est()
        }
    }

    impl TimeZone for Eastern2024 {
        type Offset = FixedOffset;

        fn from_offset(_offset: &FixedOffset) -> Self {
            Eastern2024
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            // EDT first: of two valid readings it is the earlier instant.
            let valid: Vec<FixedOffset> = [edt(), est()]
                .into_iter()
                .filter(|offset| {
                    let utc = *local - ChronoDuration::seconds(offset.local_minus_utc() as i64);
                    eastern_offset_at(&utc) == *offset
                })
                .collect();
            match valid.as_slice() {
                [] => LocalResult::None,
                [only] => LocalResult::Single(*only),
                [earlier, later, ..] => LocalResult::Ambiguous(*earlier, *later),
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            eastern_offset_at(&utc.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            eastern_offset_at(utc)
        }
    }

    fn eastern(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Eastern2024> {
        Eastern2024
            .from_local_datetime(&naive(y, mo, d, h, mi))
            .single()
            .unwrap()
    }

    fn four_am() -> NaiveTime {
        NaiveTime::from_hms_opt(4, 0, 0).unwrap()
    }

    #[test]
    fn before_sweep_time_schedules_today() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 1, 30, 0).unwrap();
        let next = next_sweep_after(&now, four_am());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 4, 0, 0).unwrap());
    }

    #[test]
    fn after_sweep_time_schedules_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 18, 0, 0).unwrap();
        let next = next_sweep_after(&now, four_am());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 4, 0, 0).unwrap());
    }

    #[test]
    fn exactly_at_sweep_time_schedules_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 4, 0, 0).unwrap();
        let next = next_sweep_after(&now, four_am());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 4, 0, 0).unwrap());
    }

    #[test]
    fn uses_local_wall_clock_of_the_offset() {
        let pacific = FixedOffset::west_opt(8 * 3600).unwrap();
        let now = pacific.with_ymd_and_hms(2024, 1, 15, 23, 0, 0).unwrap();
        let next = next_sweep_after(&now, four_am());
        assert_eq!(next, pacific.with_ymd_and_hms(2024, 1, 16, 4, 0, 0).unwrap());
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 1, 16, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn keeps_wall_clock_time_across_spring_forward() {
        let now = eastern(2024, 3, 9, 18, 0);
        let next = next_sweep_after(&now, four_am());
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn sweep_time_in_gap_moves_to_first_valid_minute() {
        let now = eastern(2024, 3, 10, 0, 0);
        let half_past_two = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        let next = next_sweep_after(&now, half_past_two);
        assert_eq!(next, eastern(2024, 3, 10, 3, 0));
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap()
        );
    }

    #[test]
    fn sweep_time_in_fold_uses_earlier_instant() {
        let now = eastern(2024, 11, 3, 0, 0);
        let half_past_one = NaiveTime::from_hms_opt(1, 30, 0).unwrap();
        let next = next_sweep_after(&now, half_past_one);
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap()
        );
    }

    #[test]
    fn fold_is_swept_once() {
        // 05:45 UTC is 01:45 EDT, after the first 01:30 of the fold.
        let now = Eastern2024.from_utc_datetime(&naive(2024, 11, 3, 5, 45));
        let half_past_one = NaiveTime::from_hms_opt(1, 30, 0).unwrap();
        let next = next_sweep_after(&now, half_past_one);
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 11, 4, 6, 30, 0).unwrap()
        );
    }

    #[test]
    fn run_once_clears_presence_and_updates_status() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(dir.path().join("attendance.db")).expect("db init"));
        db.insert_member("Alice", "U1", "111").unwrap();
        let directory = Arc::new(Directory::load(Arc::clone(&db)).unwrap());
        let engine = Arc::new(
            AttendanceEngine::open(
                directory,
                SessionStore::new(Arc::clone(&db)),
                LiveSnapshot::new(dir.path().join("current_attendees.json")),
            )
            .unwrap(),
        );
        let signed_in = Utc.with_ymd_and_hms(2024, 1, 15, 20, 0, 0).unwrap();
        engine.toggle("U1", signed_in).unwrap();

        let tracker = SweepTracker::new(true, four_am());
        let scheduler = SweepScheduler::new(Arc::clone(&engine), four_am(), tracker.clone());
        let sweep_at = Utc.with_ymd_and_hms(2024, 1, 16, 4, 0, 0).unwrap();
        let report = scheduler.run_once(sweep_at);

        assert_eq!(report.count, 1);
        assert_eq!(engine.count(), 0);
        let status = tracker.snapshot();
        assert_eq!(status.phase, SweepPhase::Idle);
        assert_eq!(status.last_sweep_at, Some(sweep_at));
        assert_eq!(status.last_swept, 1);
        assert_eq!(status.total_sweeps, 1);
        assert_eq!(status.schedule, "04:00");
    }
}
