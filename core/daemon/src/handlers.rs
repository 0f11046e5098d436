//! Request dispatch: validated params in, `SharedState` call, JSON out.

use attendance_protocol::{
    parse_history, parse_identity, parse_member, parse_member_id, parse_member_update,
    parse_scan, Method, Request, Response, PROTOCOL_VERSION,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::AttendanceError;
use crate::session_store::SessionFilter;
use crate::state::SharedState;

pub fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params;
    let now = Utc::now();

    match request.method {
        Method::GetHealth => {
            let mut data = json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            if let Ok(Value::Object(health)) = serde_json::to_value(state.health()) {
                if let Value::Object(map) = &mut data {
                    map.extend(health);
                }
            }
            Response::ok(id, data)
        }
        Method::Scan => match parse_scan(params) {
            Ok(parsed) => transition_response(id, state.scan(&parsed.tag_id, now)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::SignIn => match parse_identity(params) {
            Ok(who) => transition_response(id, state.sign_in(&who, now)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::SignOut => match parse_identity(params) {
            Ok(who) => transition_response(id, state.sign_out(&who, now)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::SignOutAll => {
            let report = state.sign_out_all(now);
            let message = format!("Signed out {} member(s)", report.count);
            with_message(id, &report, message, "sweep report")
        }
        Method::GetPresent => {
            let present = state.present();
            debug!(present = present.len(), "Present snapshot");
            serialize(id, &present, "present list")
        }
        Method::GetCount => Response::ok(id, json!({ "count": state.count() })),
        Method::GetHistory => match parse_history(params) {
            Ok(query) => match state.history(&SessionFilter::from(query)) {
                Ok(sessions) => serialize(id, &sessions, "history"),
                Err(err) => error_response(id, err),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::DeleteHistory => match parse_history(params) {
            Ok(query) => match state.delete_history(&SessionFilter::from(query)) {
                Ok(deleted) => Response::ok(id, json!({ "deleted": deleted })),
                Err(err) => error_response(id, err),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetScanHistory => serialize(id, &state.scan_history(), "scan history"),
        Method::ListMembers => match state.list_members() {
            Ok(members) => serialize(id, &members, "members"),
            Err(err) => error_response(id, err),
        },
        Method::CreateMember => match parse_member(params) {
            Ok(member) => match state.create_member(
                &member.name,
                &member.tag_id,
                &member.external_id,
            ) {
                Ok(created) => serialize(id, &created, "member"),
                Err(err) => error_response(id, err),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::UpdateMember => match parse_member_update(params) {
            Ok(update) => match state.update_member(
                update.id,
                &update.name,
                &update.tag_id,
                &update.external_id,
            ) {
                Ok(updated) => serialize(id, &updated, "member"),
                Err(err) => error_response(id, err),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::DeleteMember => match parse_member_id(params) {
            Ok(target) => match state.delete_member(target.id) {
                Ok(removed) => serialize(id, &removed, "member"),
                Err(err) => error_response(id, err),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::ExportMembers => match state.export_members() {
            Ok((count, path)) => Response::ok(
                id,
                json!({ "exported": count, "path": path.display().to_string() }),
            ),
            Err(err) => error_response(id, err),
        },
        Method::ImportMembers => match state.import_members() {
            Ok((count, path)) => Response::ok(
                id,
                json!({ "imported": count, "path": path.display().to_string() }),
            ),
            Err(err) => error_response(id, err),
        },
    }
}

fn transition_response(
    id: Option<String>,
    result: crate::error::Result<crate::engine::Transition>,
) -> Response {
    match result {
        Ok(transition) => {
            let message = transition.message();
            with_message(id, &transition, message, "transition")
        }
        Err(err) => error_response(id, err),
    }
}

fn with_message<T: Serialize>(
    id: Option<String>,
    value: &T,
    message: String,
    label: &str,
) -> Response {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            map.insert("message".to_string(), Value::String(message));
            Response::ok(id, Value::Object(map))
        }
        Ok(other) => Response::ok(id, other),
        Err(err) => serialization_error(id, label, err),
    }
}

fn serialize<T: Serialize + ?Sized>(id: Option<String>, value: &T, label: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => serialization_error(id, label, err),
    }
}

fn serialization_error(id: Option<String>, label: &str, err: serde_json::Error) -> Response {
    Response::error(
        id,
        "serialization_error",
        format!("Failed to serialize {}: {}", label, err),
    )
}

fn error_response(id: Option<String>, err: AttendanceError) -> Response {
    if matches!(
        err,
        AttendanceError::Storage { .. } | AttendanceError::SnapshotCorrupt { .. }
    ) {
        warn!(error = %err, "Request failed with storage error");
    }
    Response::error(id, err.code(), err.to_string())
}
