use serde_json::json;

use crate::error::WorkflowError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Serializes a workflow error into the envelope: code string, human message,
/// numeric status under `details.status` (the protocol has no status line),
/// and the offending field for conflicts.
pub fn workflow(id: &str, e: WorkflowError) -> serde_json::Value {
    let mut details = json!({ "status": e.status() });
    if let WorkflowError::Conflict { field } = &e {
        details["field"] = json!(field);
    }
    err(id, e.code(), e.to_string(), Some(details))
}
