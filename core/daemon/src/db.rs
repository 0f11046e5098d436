//! SQLite persistence for attendance-daemon.
//!
//! Two tables: the member directory and the append-only sessions table.
//! Sessions reference members with `ON DELETE CASCADE`, so removing a member
//! removes their history in the same statement.

use chrono::{DateTime, SecondsFormat, Utc};
use fs_err as fs;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::path::PathBuf;

use crate::directory::Identity;
use crate::error::{AttendanceError, Result};
use crate::session_store::{SessionFilter, SessionRecord};

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn list_members(&self) -> Result<Vec<Identity>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, tag_id, external_id FROM members ORDER BY id ASC")
                .map_err(|err| AttendanceError::storage("Failed to prepare members query", err))?;

            let rows = stmt
                .query_map([], member_from_row)
                .map_err(|err| AttendanceError::storage("Failed to query members", err))?;

            let mut members = Vec::new();
            for row in rows {
                members.push(
                    row.map_err(|err| AttendanceError::storage("Failed to decode member row", err))?,
                );
            }
            Ok(members)
        })
    }

    pub fn get_member(&self, id: i64) -> Result<Option<Identity>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, name, tag_id, external_id FROM members WHERE id = ?1",
                params![id],
                member_from_row,
            )
            .optional()
            .map_err(|err| AttendanceError::storage("Failed to query member", err))
        })
    }

    pub fn insert_member(&self, name: &str, tag_id: &str, external_id: &str) -> Result<Identity> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO members (name, tag_id, external_id) VALUES (?1, ?2, ?3)",
                params![name, tag_id, external_id],
            )
            .map_err(|err| map_member_write_error(err, tag_id, "Failed to insert member"))?;

            Ok(Identity {
                id: conn.last_insert_rowid(),
                display_name: name.to_string(),
                tag_id: tag_id.to_string(),
                external_id: external_id.to_string(),
            })
        })
    }

    /// Inserts unless the tag is already registered. Returns whether a row was added.
    pub fn insert_member_if_absent(
        &self,
        name: &str,
        tag_id: &str,
        external_id: &str,
    ) -> Result<bool> {
        self.with_connection(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO members (name, tag_id, external_id) VALUES (?1, ?2, ?3)",
                    params![name, tag_id, external_id],
                )
                .map_err(|err| AttendanceError::storage("Failed to import member", err))?;
            Ok(inserted > 0)
        })
    }

    pub fn update_member(
        &self,
        id: i64,
        name: &str,
        tag_id: &str,
        external_id: &str,
    ) -> Result<Identity> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE members SET name = ?1, tag_id = ?2, external_id = ?3 WHERE id = ?4",
                    params![name, tag_id, external_id, id],
                )
                .map_err(|err| map_member_write_error(err, tag_id, "Failed to update member"))?;

            if updated == 0 {
                return Err(AttendanceError::MemberNotFound(id));
            }

            Ok(Identity {
                id,
                display_name: name.to_string(),
                tag_id: tag_id.to_string(),
                external_id: external_id.to_string(),
            })
        })
    }

    pub fn delete_member(&self, id: i64) -> Result<()> {
        self.with_connection(|conn| {
            let deleted = conn
                .execute("DELETE FROM members WHERE id = ?1", params![id])
                .map_err(|err| AttendanceError::storage("Failed to delete member", err))?;
            if deleted == 0 {
                return Err(AttendanceError::MemberNotFound(id));
            }
            Ok(())
        })
    }

    pub fn insert_session(
        &self,
        member_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<i64> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (member_id, signin_time, signout_time) VALUES (?1, ?2, ?3)",
                params![
                    member_id,
                    format_timestamp(start_time),
                    format_timestamp(end_time)
                ],
            )
            .map_err(|err| AttendanceError::storage("Failed to insert session", err))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn query_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        let (where_clause, mut values) = filter_clause(filter, "s.");
        let mut sql = format!(
            "SELECT s.id, s.member_id, m.name, s.signin_time, s.signout_time \
             FROM sessions s JOIN members m ON m.id = s.member_id{} \
             ORDER BY s.signin_time DESC, s.id DESC",
            where_clause
        );
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(limit as i64));
        }

        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|err| AttendanceError::storage("Failed to prepare sessions query", err))?;

            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(|err| AttendanceError::storage("Failed to query sessions", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                let (id, member_id, name, signin, signout) = row
                    .map_err(|err| AttendanceError::storage("Failed to decode session row", err))?;
                sessions.push(SessionRecord {
                    id,
                    member_id,
                    name,
                    start_time: parse_timestamp(&signin)?,
                    end_time: parse_timestamp(&signout)?,
                });
            }
            Ok(sessions)
        })
    }

    pub fn delete_sessions(&self, filter: &SessionFilter) -> Result<usize> {
        let (where_clause, values) = filter_clause(filter, "");
        let sql = format!("DELETE FROM sessions{}", where_clause);

        self.with_connection(|conn| {
            conn.execute(&sql, params_from_iter(values.iter()))
                .map_err(|err| AttendanceError::storage("Failed to delete sessions", err))
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS members (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    tag_id TEXT NOT NULL UNIQUE,
                    external_id TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    member_id INTEGER NOT NULL,
                    signin_time TEXT NOT NULL,
                    signout_time TEXT NOT NULL,
                    FOREIGN KEY(member_id) REFERENCES members(id) ON DELETE CASCADE
                 );
                 CREATE INDEX IF NOT EXISTS sessions_member_id ON sessions(member_id);
                 CREATE INDEX IF NOT EXISTS sessions_signin_time ON sessions(signin_time);
                 COMMIT;",
            )
            .map_err(|err| AttendanceError::storage("Failed to initialize schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| AttendanceError::storage("Failed to create data dir", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| AttendanceError::storage("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| AttendanceError::storage("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| AttendanceError::storage("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| AttendanceError::storage("Failed to set busy_timeout", err))?;
        // Per-connection; the cascade from members to sessions depends on it.
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|err| AttendanceError::storage("Failed to enable foreign keys", err))?;

        Ok(conn)
    }
}

/// Fixed-width UTC text so lexicographic order matches chronological order.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AttendanceError::storage(format!("Invalid stored timestamp {}", value), err))
}

fn filter_clause(filter: &SessionFilter, prefix: &str) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(from) = filter.from {
        clauses.push(format!("{}signin_time >= ?", prefix));
        values.push(SqlValue::Text(format_timestamp(from)));
    }
    if let Some(to) = filter.to {
        clauses.push(format!("{}signin_time <= ?", prefix));
        values.push(SqlValue::Text(format_timestamp(to)));
    }
    if let Some(member_id) = filter.member_id {
        clauses.push(format!("{}member_id = ?", prefix));
        values.push(SqlValue::Integer(member_id));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn member_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        display_name: row.get(1)?,
        tag_id: row.get(2)?,
        external_id: row.get(3)?,
    })
}

fn map_member_write_error(err: rusqlite::Error, tag_id: &str, context: &str) -> AttendanceError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            AttendanceError::DuplicateTag(tag_id.to_string())
        }
        _ => AttendanceError::storage(context, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn temp_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("attendance.db")).expect("db init");
        (temp_dir, db)
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let whole = format_timestamp(base_time());
        let fractional = format_timestamp(base_time() + Duration::microseconds(1500));
        assert_eq!(whole, "2024-01-15T12:00:00.000000Z");
        assert_eq!(whole.len(), fractional.len());
        assert!(whole < fractional);
    }

    #[test]
    fn inserts_and_lists_members() {
        let (_dir, db) = temp_db();
        let alice = db.insert_member("Alice", "U1", "111").expect("insert");
        db.insert_member("Bob", "U2", "222").expect("insert");

        let members = db.list_members().expect("list");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], alice);
        assert_eq!(db.get_member(alice.id).expect("get"), Some(alice));
    }

    #[test]
    fn duplicate_tag_is_reported() {
        let (_dir, db) = temp_db();
        db.insert_member("Alice", "U1", "111").expect("insert");
        let err = db.insert_member("Mallory", "U1", "333").unwrap_err();
        assert!(matches!(err, AttendanceError::DuplicateTag(tag) if tag == "U1"));
    }

    #[test]
    fn update_of_missing_member_is_not_found() {
        let (_dir, db) = temp_db();
        let err = db.update_member(999, "Ghost", "U9", "9").unwrap_err();
        assert!(matches!(err, AttendanceError::MemberNotFound(999)));
    }

    #[test]
    fn insert_if_absent_skips_existing_tags() {
        let (_dir, db) = temp_db();
        assert!(db.insert_member_if_absent("Alice", "U1", "111").unwrap());
        assert!(!db.insert_member_if_absent("Alice Again", "U1", "111").unwrap());
        assert_eq!(db.list_members().unwrap().len(), 1);
    }

    #[test]
    fn deleting_member_cascades_sessions() {
        let (_dir, db) = temp_db();
        let alice = db.insert_member("Alice", "U1", "111").expect("insert");
        let bob = db.insert_member("Bob", "U2", "222").expect("insert");
        db.insert_session(alice.id, base_time(), base_time() + Duration::hours(1))
            .expect("session");
        db.insert_session(bob.id, base_time(), base_time() + Duration::hours(1))
            .expect("session");

        db.delete_member(alice.id).expect("delete");

        let remaining = db.query_sessions(&SessionFilter::default()).expect("query");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].member_id, bob.id);
    }

    #[test]
    fn session_for_unknown_member_violates_foreign_key() {
        let (_dir, db) = temp_db();
        let err = db
            .insert_session(42, base_time(), base_time() + Duration::hours(1))
            .unwrap_err();
        assert_eq!(err.code(), "storage_error");
    }
}
