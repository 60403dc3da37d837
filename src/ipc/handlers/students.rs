use crate::codegen;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, StoreError};
use log::warn;
use rusqlite::Connection;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

// The unique id doubles as the code-image file stem, so keep it to
// characters that are safe in both a QR payload and a filename.
fn valid_unique_id(unique_id: &str) -> bool {
    !unique_id.is_empty()
        && unique_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let unique_id = match required_str(req, "uniqueId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    if !valid_unique_id(&unique_id) {
        return err(
            &req.id,
            "bad_params",
            "uniqueId must be non-empty ascii alphanumeric, '-' or '_'",
            None,
        );
    }
    let workspace = match state.workspace.clone() {
        Some(w) => w,
        None => return err(&req.id, "no_workspace", "select a workspace first", None),
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let student = match store::create_student(conn, &name, &unique_id) {
        Ok(s) => s,
        Err(StoreError::DuplicateUniqueId(uid)) => {
            return err(
                &req.id,
                "duplicate_unique_id",
                format!("unique id already registered: {}", uid),
                None,
            )
        }
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };

    // Registration stands even if the code image cannot be written; the
    // image can be regenerated, the row cannot be silently lost.
    let code_path = match codegen::generate_code_png(&workspace, &unique_id) {
        Ok(path) => {
            let path_str = path.to_string_lossy().to_string();
            if let Err(e) = store::set_code_path(conn, &student.id, &path_str) {
                warn!("failed to record code path for {}: {}", unique_id, e);
            }
            Some(path_str)
        }
        Err(e) => {
            warn!("code image generation failed for {}: {}", unique_id, e);
            None
        }
    };

    ok(
        &req.id,
        json!({
            "id": student.id,
            "name": student.name,
            "uniqueId": student.unique_id,
            "codePath": code_path,
            "codeGenerated": code_path.is_some()
        }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match store::list_students(conn) {
        Ok(students) => {
            let rows: Vec<serde_json::Value> = students
                .iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "name": s.name,
                        "uniqueId": s.unique_id,
                        "codePath": s.code_path
                    })
                })
                .collect();
            ok(&req.id, json!({ "students": rows }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let unique_id = match required_str(req, "uniqueId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match store::delete_student_by_unique_id(conn, &unique_id) {
        Ok(true) => ok(&req.id, json!({ "deleted": true })),
        Ok(false) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.register" => Some(handle_register(state, req)),
        "students.list" => Some(handle_list(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
