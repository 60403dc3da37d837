use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
use chrono::NaiveDate;
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

struct ReportRow {
    name: String,
    identifier: String,
    status: &'static str,
    date: String,
}

fn parse_day(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: format!("{} must be YYYY-MM-DD", key),
        details: None,
    })
}

fn parse_range(params: &serde_json::Value) -> Result<(NaiveDate, NaiveDate), HandlerErr> {
    let from = parse_day(params, "from")?;
    let to = parse_day(params, "to")?;
    if from > to {
        return Err(HandlerErr {
            code: "bad_params",
            message: "from must not be after to".to_string(),
            details: None,
        });
    }
    if (to - from).num_days() >= 366 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "range must not exceed one year".to_string(),
            details: None,
        });
    }
    Ok((from, to))
}

/// One row per (student, day) over the inclusive range. Absent is never
/// stored; it is synthesized here for days with no present row.
fn collect_rows(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<ReportRow>, HandlerErr> {
    let students = store::list_students(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let present = store::present_pairs_between(conn, from, to).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut rows = Vec::new();
    for s in &students {
        let mut day = from;
        while day <= to {
            let key = (s.id.clone(), store::day_key(day));
            rows.push(ReportRow {
                name: s.name.clone(),
                identifier: s.unique_id.clone(),
                status: if present.contains(&key) {
                    "Present"
                } else {
                    "Absent"
                },
                date: store::day_key(day),
            });
            day = day.succ_opt().ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: "date out of range".to_string(),
                details: None,
            })?;
        }
    }
    Ok(rows)
}

fn reports_range(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (from, to) = parse_range(params)?;
    let rows = collect_rows(conn, from, to)?;
    let rows_json: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            json!({
                "name": r.name,
                "identifier": r.identifier,
                "status": r.status,
                "date": r.date
            })
        })
        .collect();
    Ok(json!({
        "from": store::day_key(from),
        "to": store::day_key(to),
        "rows": rows_json
    }))
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn reports_export_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (from, to) = parse_range(params)?;
    let rows = collect_rows(conn, from, to)?;

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push("Name,Identifier,Status,Date".to_string());
    for r in &rows {
        lines.push(
            [
                csv_field(&r.name),
                csv_field(&r.identifier),
                r.status.to_string(),
                r.date.clone(),
            ]
            .join(","),
        );
    }
    let csv = lines.join("\n") + "\n";

    let written_to = match params.get("path").and_then(|v| v.as_str()) {
        Some(path) => {
            std::fs::write(path, &csv).map_err(|e| HandlerErr {
                code: "export_write_failed",
                message: e.to_string(),
                details: Some(json!({ "path": path })),
            })?;
            Some(path.to_string())
        }
        None => None,
    };

    Ok(json!({
        "csv": csv,
        "rowCount": rows.len(),
        "writtenTo": written_to
    }))
}

fn handle_reports_range(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match reports_range(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_reports_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match reports_export_csv(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.range" => Some(handle_reports_range(state, req)),
        "reports.exportCsv" => Some(handle_reports_export_csv(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::csv_field;

    #[test]
    fn csv_fields_are_quoted_only_when_needed() {
        assert_eq!(csv_field("Asha Rao"), "Asha Rao");
        assert_eq!(csv_field("Rao, Asha"), "\"Rao, Asha\"");
        assert_eq!(csv_field("the \"A\""), "\"the \"\"A\"\"\"");
    }
}
