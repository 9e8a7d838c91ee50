use crate::error::WorkflowError;
use crate::ipc::error::{err, ok, workflow};
use crate::ipc::types::{AppState, Request};
use crate::membership;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn required_str(params: &serde_json::Value, key: &str) -> Result<String, WorkflowError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WorkflowError::invalid_input(format!("missing {}", key)))
}

/// Fee amounts are optional non-negative integers; `null` means unset.
fn optional_amount(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<i64>, WorkflowError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(Some(n)),
            _ => Err(WorkflowError::invalid_input(format!(
                "{} must be a non-negative integer",
                key
            ))),
        },
    }
}

fn class_row(conn: &Connection, class_id: &str) -> Result<serde_json::Value, WorkflowError> {
    let row = conn
        .query_row(
            "SELECT id, name, fee, late_fine_amount, students FROM classes WHERE id = ?",
            [class_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                    r.get::<_, Option<i64>>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    let (id, name, fee, late_fine_amount, students) =
        row.ok_or(WorkflowError::NotFound("class"))?;
    Ok(json!({
        "id": id,
        "name": name,
        "fee": fee,
        "lateFineAmount": late_fine_amount,
        "students": membership::parse_id_array(&students),
    }))
}

fn classes_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let name = required_str(params, "name")?;
    let fee = optional_amount(params, "fee")?;
    let late_fine_amount = optional_amount(params, "lateFineAmount")?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, fee, late_fine_amount, students)
         VALUES(?, ?, ?, ?, '[]')",
        (&class_id, &name, fee, late_fine_amount),
    )?;
    class_row(conn, &class_id)
}

fn classes_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let class_id = required_str(params, "classId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| WorkflowError::invalid_input("missing patch"))?;

    let mut set_parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(v) = patch.get("name") {
        let name = v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| WorkflowError::invalid_input("name must be a non-empty string"))?;
        set_parts.push("name = ?");
        binds.push(Value::Text(name));
    }
    for (key, column) in [("fee", "fee = ?"), ("lateFineAmount", "late_fine_amount = ?")] {
        if let Some(v) = patch.get(key) {
            set_parts.push(column);
            if v.is_null() {
                binds.push(Value::Null);
            } else {
                match v.as_i64() {
                    Some(n) if n >= 0 => binds.push(Value::Integer(n)),
                    _ => {
                        return Err(WorkflowError::invalid_input(format!(
                            "{} must be a non-negative integer or null",
                            key
                        )))
                    }
                }
            }
        }
    }
    if set_parts.is_empty() {
        return Err(WorkflowError::invalid_input("empty patch"));
    }

    if !membership::class_exists(conn, &class_id)? {
        return Err(WorkflowError::NotFound("class"));
    }
    binds.push(Value::Text(class_id.clone()));
    let sql = format!("UPDATE classes SET {} WHERE id = ?", set_parts.join(", "));
    conn.execute(&sql, params_from_iter(binds))?;
    class_row(conn, &class_id)
}

fn classes_list(conn: &Connection) -> Result<serde_json::Value, WorkflowError> {
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.fee,
           c.late_fine_amount,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         ORDER BY c.name",
    )?;
    let classes = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "fee": r.get::<_, Option<i64>>(2)?,
                "lateFineAmount": r.get::<_, Option<i64>>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "classes": classes }))
}

fn classes_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let class_id = required_str(params, "classId")?;
    class_row(conn, &class_id)
}

fn classes_remove(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let class_id = required_str(params, "classId")?;
    if !membership::class_exists(conn, &class_id)? {
        return Err(WorkflowError::NotFound("class"));
    }
    // No cascades: a class with enrolled students cannot be removed.
    let enrolled: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    )?;
    if enrolled > 0 {
        return Err(WorkflowError::invalid_state(format!(
            "class still has {} enrolled student(s)",
            enrolled
        )));
    }
    conn.execute("DELETE FROM classes WHERE id = ?", [&class_id])?;
    Ok(json!({ "removed": true, "classId": class_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = match req.method.as_str() {
        "classes.create" => classes_create,
        "classes.update" => classes_update,
        "classes.get" => classes_get,
        "classes.remove" => classes_remove,
        "classes.list" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            return Some(match classes_list(conn) {
                Ok(result) => ok(&req.id, result),
                Err(e) => workflow(&req.id, e),
            });
        }
        _ => return None,
    };

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match run(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => workflow(&req.id, e),
    })
}
