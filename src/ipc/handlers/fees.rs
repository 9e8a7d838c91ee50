use crate::error::WorkflowError;
use crate::fees;
use crate::ipc::error::{err, ok, workflow};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;

fn required_str(params: &serde_json::Value, key: &str) -> Result<String, WorkflowError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WorkflowError::invalid_input(format!("missing {}", key)))
}

/// `months` is a single label (single mode) or an array of labels (bulk
/// mode); any other shape is rejected before the engine runs.
fn parse_months(params: &serde_json::Value) -> Result<fees::MarkMonths, WorkflowError> {
    match params.get("months") {
        Some(serde_json::Value::String(s)) => Ok(fees::MarkMonths::Single(s.clone())),
        Some(serde_json::Value::Array(items)) => {
            let mut labels = Vec::with_capacity(items.len());
            for item in items {
                let label = item.as_str().ok_or_else(|| {
                    WorkflowError::invalid_input("months must contain strings")
                })?;
                labels.push(label.to_string());
            }
            Ok(fees::MarkMonths::Bulk(labels))
        }
        Some(_) => Err(WorkflowError::invalid_input(
            "months must be a string or an array of strings",
        )),
        None => Err(WorkflowError::invalid_input("missing months")),
    }
}

fn fees_mark_payment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let student_id = required_str(params, "studentId")?;
    let months = parse_months(params)?;
    let status_raw = required_str(params, "status")?;
    let status = fees::PaymentStatus::parse(&status_raw).ok_or_else(|| {
        WorkflowError::invalid_input("status must be \"paid\" or \"not paid\"")
    })?;
    let advance_flag = params
        .get("isAdvancePayment")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let today = Utc::now().date_naive();
    let outcome = fees::mark_payments(conn, &student_id, &months, status, advance_flag, today)?;
    Ok(match outcome {
        fees::MarkOutcome::Single(record) => json!({ "record": record }),
        fees::MarkOutcome::Bulk {
            items,
            inserted,
            updated,
        } => json!({
            "items": items,
            "inserted": inserted,
            "updated": updated
        }),
    })
}

fn fees_impose_late_fine(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let student_id = required_str(params, "studentId")?;
    let month = required_str(params, "month")?;
    let outcome = fees::impose_late_fine(conn, &student_id, &month)?;
    let mut result = json!({ "record": outcome.record });
    result["studentName"] = json!(outcome.student_name);
    Ok(result)
}

fn fees_statement(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let student_id = required_str(params, "studentId")?;
    let months: Option<Vec<String>> = match params.get("months") {
        None => None,
        Some(serde_json::Value::Array(items)) => {
            let mut labels = Vec::with_capacity(items.len());
            for item in items {
                let label = item.as_str().ok_or_else(|| {
                    WorkflowError::invalid_input("months must contain strings")
                })?;
                labels.push(label.to_string());
            }
            Some(labels)
        }
        Some(_) => {
            return Err(WorkflowError::invalid_input(
                "months must be an array of strings",
            ))
        }
    };
    let rows = fees::statement(conn, &student_id, months.as_deref())?;
    Ok(json!({ "studentId": student_id, "rows": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "fees.markPayment" | "fees.imposeLateFine" | "fees.statement"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "fees.markPayment" => fees_mark_payment(conn, &req.params),
        "fees.imposeLateFine" => fees_impose_late_fine(conn, &req.params),
        "fees.statement" => fees_statement(conn, &req.params),
        _ => unreachable!(),
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => workflow(&req.id, e),
    })
}
