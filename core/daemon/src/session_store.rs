use attendance_protocol::HistoryQuery;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::db::Db;
use crate::error::{AttendanceError, Result};

/// A completed presence interval as written by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedInterval {
    pub identity_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// A stored session joined with the member's display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: i64,
    pub member_id: i64,
    pub name: String,
    #[serde(rename = "signin_time")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "signout_time")]
    pub end_time: DateTime<Utc>,
}

/// `from`/`to` are inclusive bounds on the session start time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub member_id: Option<i64>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn for_member(member_id: i64) -> Self {
        Self {
            member_id: Some(member_id),
            ..Self::default()
        }
    }

    /// Whether the filter narrows the row set. `limit` alone does not count.
    pub fn is_scoped(&self) -> bool {
        self.from.is_some() || self.to.is_some() || self.member_id.is_some()
    }
}

impl From<HistoryQuery> for SessionFilter {
    fn from(query: HistoryQuery) -> Self {
        Self {
            from: query.from,
            to: query.to,
            member_id: query.member_id,
            limit: query.limit,
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Db>,
}

impl SessionStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn append(
        &self,
        identity_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<ClosedInterval> {
        if end_time <= start_time {
            return Err(AttendanceError::InvalidInterval {
                start: start_time.to_rfc3339(),
                end: end_time.to_rfc3339(),
            });
        }

        let row_id = self.db.insert_session(identity_id, start_time, end_time)?;
        debug!(row_id, identity_id, "Session appended");
        Ok(ClosedInterval {
            identity_id,
            start_time,
            end_time,
        })
    }

    /// Newest first by start time; `limit` applies after filtering.
    pub fn query(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        self.db.query_sessions(filter)
    }

    pub fn delete(&self, filter: &SessionFilter) -> Result<usize> {
        if !filter.is_scoped() {
            return Err(AttendanceError::NoFilterSpecified);
        }
        let deleted = self.db.delete_sessions(filter)?;
        debug!(deleted, ?filter, "Sessions deleted");
        Ok(deleted)
    }

    /// Removes every session of one identity, ahead of deleting the identity.
    pub fn cascade_delete_for(&self, identity_id: i64) -> Result<usize> {
        self.db.delete_sessions(&SessionFilter::for_member(identity_id))
    }
}
