//! IPC protocol types and validation for attendance-daemon.
//!
//! This crate is shared by the daemon and its clients (the `attend` CLI, the
//! tag-scanner bridge) to prevent schema drift. The daemon remains the
//! authority on validation, but clients can reuse the same types to construct
//! valid requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";

const MAX_FIELD_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Scan,
    SignIn,
    SignOut,
    SignOutAll,
    GetPresent,
    GetCount,
    GetHistory,
    DeleteHistory,
    GetScanHistory,
    ListMembers,
    CreateMember,
    UpdateMember,
    DeleteMember,
    ExportMembers,
    ImportMembers,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// A tag read reported by a scanner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScanParams {
    pub tag_id: String,
}

/// Directional sign-in/sign-out. Exactly one of `tag_id` or `external_id`
/// (the chat-platform id) must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IdentityParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRef {
    Tag(String),
    External(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryParams {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub member_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Validated history filter. `from`/`to` bound the session start time,
/// both inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub member_id: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MemberParams {
    pub name: String,
    pub tag_id: String,
    pub external_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UpdateMemberParams {
    pub id: i64,
    pub name: String,
    pub tag_id: String,
    pub external_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MemberIdParams {
    pub id: i64,
}

pub fn parse_scan(params: Option<Value>) -> Result<ScanParams, ErrorInfo> {
    let parsed: ScanParams = decode(params, "scan")?;
    Ok(ScanParams {
        tag_id: require_field(&parsed.tag_id, "tag_id")?,
    })
}

pub fn parse_identity(params: Option<Value>) -> Result<IdentityRef, ErrorInfo> {
    let parsed: IdentityParams = decode(params, "identity")?;
    match (parsed.tag_id, parsed.external_id) {
        (Some(tag_id), None) => Ok(IdentityRef::Tag(require_field(&tag_id, "tag_id")?)),
        (None, Some(external_id)) => Ok(IdentityRef::External(require_field(
            &external_id,
            "external_id",
        )?)),
        (Some(_), Some(_)) => Err(ErrorInfo::new(
            "invalid_params",
            "provide either tag_id or external_id, not both",
        )),
        (None, None) => Err(ErrorInfo::new(
            "missing_field",
            "tag_id or external_id is required",
        )),
    }
}

/// History params are optional as a whole; an absent payload means "all sessions".
pub fn parse_history(params: Option<Value>) -> Result<HistoryQuery, ErrorInfo> {
    let raw: HistoryParams = match params {
        None | Some(Value::Null) => HistoryParams::default(),
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new(
                "invalid_params",
                format!("history params are invalid: {}", err),
            )
        })?,
    };

    let from = raw
        .from
        .as_deref()
        .map(|value| parse_timestamp(value, "from"))
        .transpose()?;
    let to = raw
        .to
        .as_deref()
        .map(|value| parse_timestamp(value, "to"))
        .transpose()?;

    let limit = match raw.limit {
        Some(limit) if limit <= 0 => {
            return Err(ErrorInfo::new(
                "invalid_params",
                "limit must be a positive integer",
            ))
        }
        Some(limit) => Some(limit as usize),
        None => None,
    };

    if let Some(member_id) = raw.member_id {
        if member_id <= 0 {
            return Err(ErrorInfo::new(
                "invalid_params",
                "member_id must be a positive integer",
            ));
        }
    }

    Ok(HistoryQuery {
        from,
        to,
        member_id: raw.member_id,
        limit,
    })
}

pub fn parse_member(params: Option<Value>) -> Result<MemberParams, ErrorInfo> {
    let parsed: MemberParams = decode(params, "member")?;
    Ok(MemberParams {
        name: require_field(&parsed.name, "name")?,
        tag_id: require_field(&parsed.tag_id, "tag_id")?,
        external_id: require_field(&parsed.external_id, "external_id")?,
    })
}

pub fn parse_member_update(params: Option<Value>) -> Result<UpdateMemberParams, ErrorInfo> {
    let parsed: UpdateMemberParams = decode(params, "member update")?;
    Ok(UpdateMemberParams {
        id: require_id(parsed.id)?,
        name: require_field(&parsed.name, "name")?,
        tag_id: require_field(&parsed.tag_id, "tag_id")?,
        external_id: require_field(&parsed.external_id, "external_id")?,
    })
}

pub fn parse_member_id(params: Option<Value>) -> Result<MemberIdParams, ErrorInfo> {
    let parsed: MemberIdParams = decode(params, "member id")?;
    Ok(MemberIdParams {
        id: require_id(parsed.id)?,
    })
}

fn decode<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
    label: &str,
) -> Result<T, ErrorInfo> {
    let params = match params {
        Some(value) if !value.is_null() => value,
        _ => {
            return Err(ErrorInfo::new(
                "invalid_params",
                format!("{} payload is required", label),
            ))
        }
    };
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", label, err),
        )
    })
}

fn require_field(value: &str, field: &str) -> Result<String, ErrorInfo> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if trimmed.len() > MAX_FIELD_LEN {
        return Err(ErrorInfo::new(
            "invalid_params",
            format!("{} must be {} characters or fewer", field, MAX_FIELD_LEN),
        ));
    }
    Ok(trimmed.to_string())
}

fn require_id(id: i64) -> Result<i64, ErrorInfo> {
    if id <= 0 {
        return Err(ErrorInfo::new(
            "invalid_params",
            "id must be a positive integer",
        ));
    }
    Ok(id)
}

fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, ErrorInfo> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ErrorInfo::new("invalid_timestamp", format!("{} must be RFC3339", field)))
}
