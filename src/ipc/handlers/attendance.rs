use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scan::InsertOutcome;
use crate::store;
use chrono::Local;
use log::info;
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

/// Manual mark step, the same decision a scanning session applies to one
/// decoded payload: unknown payloads are a no-op, an existing row for today
/// is left alone, only a fresh insert changes state.
fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let payload = get_required_str(params, "payload")?;

    let student = store::find_student_by_unique_id(conn, &payload).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let Some(student) = student else {
        return Ok(json!({ "status": "unknown", "payload": payload }));
    };

    let now = Local::now();
    let today = now.date_naive();
    let exists = store::exists_present_on(conn, &student.id, today).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    if exists {
        return Ok(json!({
            "status": "already_marked",
            "uniqueId": student.unique_id,
            "day": store::day_key(today)
        }));
    }

    let outcome =
        store::insert_present_on(conn, &student.id, today, now).map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;
    let status = match outcome {
        InsertOutcome::Inserted => {
            info!("marked present: {} ({})", student.name, student.unique_id);
            "marked"
        }
        // A concurrent writer beat us to it; the row exists either way.
        InsertOutcome::AlreadyPresent => "already_marked",
    };
    Ok(json!({
        "status": status,
        "uniqueId": student.unique_id,
        "name": student.name,
        "day": store::day_key(today)
    }))
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_mark(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        _ => None,
    }
}
