use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scan::{
    AbortReason, DirFrameSource, RqrrDecoder, ScanError, SessionController, SessionOptions,
    SessionOutcome,
};
use crate::store::{SqliteIdentities, SqliteLedger};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

fn session_options(params: &serde_json::Value) -> SessionOptions {
    SessionOptions {
        max_frames: params.get("maxFrames").and_then(|v| v.as_u64()),
        max_duration: params
            .get("maxSeconds")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs),
        ..SessionOptions::default()
    }
}

fn handle_scan_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let frames_path = match req.params.get("framesPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing framesPath", None),
    };

    // Device open comes first; if it fails the ledger is never contacted
    // and there is no summary to report.
    let mut frames = match DirFrameSource::open(&frames_path) {
        Ok(f) => f,
        Err(ScanError::DeviceUnavailable(msg)) => {
            return err(&req.id, "device_unavailable", msg, None)
        }
    };

    let decoder = RqrrDecoder;
    let identities = SqliteIdentities(conn);
    let ledger = SqliteLedger(conn);
    let mut controller = SessionController::new(
        &mut frames,
        &decoder,
        &identities,
        &ledger,
        session_options(&req.params),
    );
    let summary = controller.run();

    let outcome = match summary.outcome {
        SessionOutcome::Finished => json!({ "kind": "finished" }),
        SessionOutcome::Aborted(AbortReason::StorageUnavailable) => json!({
            "kind": "aborted",
            "reason": "storage_unavailable"
        }),
    };
    ok(
        &req.id,
        json!({
            "outcome": outcome,
            "marksMade": summary.marks_made,
            "distinctStudentsSeen": summary.distinct_students_seen,
            "framesProcessed": summary.frames_processed,
            "durationMs": summary.duration.as_millis() as u64
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scan.run" => Some(handle_scan_run(state, req)),
        _ => None,
    }
}
