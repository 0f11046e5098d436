use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEvent {
    pub tag_id: String,
    pub time: DateTime<Utc>,
}

/// Bounded log of recent raw scans, including tags that did not resolve.
pub struct ScanLog {
    capacity: usize,
    events: Mutex<VecDeque<ScanEvent>>,
}

impl ScanLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, tag_id: &str, time: DateTime<Utc>) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(ScanEvent {
            tag_id: tag_id.to_string(),
            time,
        });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<ScanEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn keeps_only_newest_entries() {
        let log = ScanLog::new(10);
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        for i in 0..15 {
            log.record(&format!("TAG{}", i), base + Duration::seconds(i));
        }

        let recent = log.recent();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].tag_id, "TAG14");
        assert_eq!(recent[9].tag_id, "TAG5");
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let log = ScanLog::new(0);
        log.record("U1", Utc::now());
        assert!(log.recent().is_empty());
    }
}
