//! Error types for attendance-daemon operations.

use std::path::PathBuf;

/// All errors the engine and its stores can report.
///
/// State-machine violations are deterministic and caller-correctable; they
/// are surfaced to the request layer unchanged. Storage errors raised after a
/// map mutation are logged by the engine instead of being returned.
#[derive(Debug, thiserror::Error)]
pub enum AttendanceError {
    // ─────────────────────────────────────────────────────────────────────
    // State-machine violations
    // ─────────────────────────────────────────────────────────────────────
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("Already signed in: {0}")]
    AlreadyPresent(String),

    #[error("Not signed in: {0}")]
    NotPresent(String),

    #[error("Cannot delete member who is currently signed in: {0}")]
    CurrentlyPresent(String),

    #[error("At least one of from, to, or member_id is required")]
    NoFilterSpecified,

    // ─────────────────────────────────────────────────────────────────────
    // Directory errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Member not found: {0}")]
    MemberNotFound(i64),

    #[error("Tag already registered: {0}")]
    DuplicateTag(String),

    #[error("Invalid member: {0}")]
    InvalidMember(String),

    // ─────────────────────────────────────────────────────────────────────
    // Persistence errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Session must end after it starts: {start} >= {end}")]
    InvalidInterval { start: String, end: String },

    #[error("Snapshot file is malformed: {path}: {details}")]
    SnapshotCorrupt { path: PathBuf, details: String },

    #[error("Storage error: {context}: {details}")]
    Storage { context: String, details: String },
}

impl AttendanceError {
    pub fn storage(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        AttendanceError::Storage {
            context: context.into(),
            details: err.to_string(),
        }
    }

    /// Stable wire code for the daemon protocol.
    pub fn code(&self) -> &'static str {
        match self {
            AttendanceError::UnknownIdentity(_) => "unknown_identity",
            AttendanceError::AlreadyPresent(_) => "already_present",
            AttendanceError::NotPresent(_) => "not_present",
            AttendanceError::CurrentlyPresent(_) => "currently_present",
            AttendanceError::NoFilterSpecified => "no_filter_specified",
            AttendanceError::MemberNotFound(_) => "member_not_found",
            AttendanceError::DuplicateTag(_) => "duplicate_tag",
            AttendanceError::InvalidMember(_) => "invalid_params",
            AttendanceError::InvalidInterval { .. } => "invalid_interval",
            AttendanceError::SnapshotCorrupt { .. } | AttendanceError::Storage { .. } => {
                "storage_error"
            }
        }
    }
}

/// Convenience type alias for Results using AttendanceError.
pub type Result<T> = std::result::Result<T, AttendanceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_share_a_code() {
        let corrupt = AttendanceError::SnapshotCorrupt {
            path: PathBuf::from("/tmp/current_attendees.json"),
            details: "expected value".to_string(),
        };
        let io = AttendanceError::storage("Failed to insert session", "disk full");
        assert_eq!(corrupt.code(), "storage_error");
        assert_eq!(io.code(), "storage_error");
        assert_eq!(
            io.to_string(),
            "Storage error: Failed to insert session: disk full"
        );
    }
}
