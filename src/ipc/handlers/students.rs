use crate::db;
use crate::error::WorkflowError;
use crate::ipc::error::{err, ok, workflow};
use crate::ipc::types::{AppState, Request};
use crate::membership;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn required_str(params: &serde_json::Value, key: &str) -> Result<String, WorkflowError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WorkflowError::invalid_input(format!("missing {}", key)))
}

fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn id_list(params: &serde_json::Value, key: &str) -> Result<Option<Vec<String>>, WorkflowError> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    let arr = v
        .as_array()
        .ok_or_else(|| WorkflowError::invalid_input(format!("{} must be an array", key)))?;
    let mut ids = Vec::with_capacity(arr.len());
    for item in arr {
        let id = item.as_str().ok_or_else(|| {
            WorkflowError::invalid_input(format!("{} must contain string ids", key))
        })?;
        ids.push(id.to_string());
    }
    Ok(Some(ids))
}

fn student_row(conn: &Connection, student_id: &str) -> Result<serde_json::Value, WorkflowError> {
    let row = conn
        .query_row(
            "SELECT id, name, email, grade, parent_name, parent_contact,
                    class_id, subjects, updated_at
             FROM students WHERE id = ?",
            [student_id],
            |r| {
                let subjects: String = r.get(7)?;
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "email": r.get::<_, String>(2)?,
                    "grade": r.get::<_, Option<String>>(3)?,
                    "parentName": r.get::<_, Option<String>>(4)?,
                    "parentContact": r.get::<_, Option<String>>(5)?,
                    "classId": r.get::<_, String>(6)?,
                    "subjects": membership::parse_id_array(&subjects),
                    "updatedAt": r.get::<_, Option<String>>(8)?,
                }))
            },
        )
        .optional()?;
    row.ok_or(WorkflowError::NotFound("student"))
}

/// Registration validates every reference before writing, then inserts the
/// student row and the class/subject back-references in one transaction.
/// A duplicate email surfaces as Conflict via the UNIQUE constraint.
fn students_register(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?;
    let class_id = required_str(params, "classId")?;
    let grade = optional_str(params, "grade");
    let parent_name = optional_str(params, "parentName");
    let parent_contact = optional_str(params, "parentContact");
    let subject_ids = membership::dedupe(id_list(params, "subjectIds")?.unwrap_or_default());

    let tx = conn.unchecked_transaction()?;
    if !membership::class_exists(&tx, &class_id)? {
        return Err(WorkflowError::NotFound("class"));
    }
    for subject_id in &subject_ids {
        if !membership::subject_exists(&tx, subject_id)? {
            return Err(WorkflowError::NotFound("subject"));
        }
    }

    let student_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO students(id, name, email, grade, parent_name, parent_contact,
                              class_id, subjects, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &name,
            &email,
            &grade,
            &parent_name,
            &parent_contact,
            &class_id,
            membership::to_id_array(&subject_ids),
            db::now_utc(),
        ),
    )?;
    membership::enroll_new_student(&tx, &student_id, &class_id, &subject_ids)?;
    let row = student_row(&tx, &student_id)?;
    tx.commit()?;
    info!(student = %student_id, class = %class_id, "student registered");
    Ok(row)
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let class_filter = optional_str(params, "classId");
    let (sql, binds): (&str, Vec<Value>) = match &class_filter {
        Some(class_id) => (
            "SELECT id, name, email, grade, class_id FROM students
             WHERE class_id = ? ORDER BY name",
            vec![Value::Text(class_id.clone())],
        ),
        None => (
            "SELECT id, name, email, grade, class_id FROM students ORDER BY name",
            Vec::new(),
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let students = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "grade": r.get::<_, Option<String>>(3)?,
                "classId": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "students": students }))
}

fn students_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let student_id = required_str(params, "studentId")?;
    student_row(conn, &student_id)
}

/// Scalar patch plus optional class/subject reassignment, all in one
/// transaction so a failed reassignment also rolls back the scalar fields.
fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let student_id = required_str(params, "studentId")?;
    let patch_raw = params
        .get("patch")
        .ok_or_else(|| WorkflowError::invalid_input("missing patch"))?;
    let patch = patch_raw
        .as_object()
        .ok_or_else(|| WorkflowError::invalid_input("patch must be an object"))?;
    if patch.is_empty() {
        return Err(WorkflowError::invalid_input("empty patch"));
    }

    let mut set_parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (key, column) in [
        ("name", "name = ?"),
        ("grade", "grade = ?"),
        ("parentName", "parent_name = ?"),
        ("parentContact", "parent_contact = ?"),
    ] {
        let Some(v) = patch.get(key) else { continue };
        if v.is_null() {
            if key == "name" {
                return Err(WorkflowError::invalid_input("name must not be null"));
            }
            set_parts.push(column);
            binds.push(Value::Null);
            continue;
        }
        let s = v
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| WorkflowError::invalid_input(format!("{} must be a string", key)))?;
        if key == "name" && s.is_empty() {
            return Err(WorkflowError::invalid_input("name must not be empty"));
        }
        set_parts.push(column);
        binds.push(Value::Text(s));
    }
    let new_class_id = patch
        .get("classId")
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| WorkflowError::invalid_input("classId must be a string"))
        })
        .transpose()?;
    let new_subject_ids = id_list(patch_raw, "subjectIds")?;

    let tx = conn.unchecked_transaction()?;
    let refs = membership::student_refs(&tx, &student_id)?
        .ok_or(WorkflowError::NotFound("student"))?;

    if !set_parts.is_empty() {
        binds.push(Value::Text(student_id.clone()));
        let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
        tx.execute(&sql, params_from_iter(binds))?;
    }
    if let Some(class_id) = &new_class_id {
        membership::reassign_class(&tx, &refs, class_id)?;
    }
    if let Some(subject_ids) = &new_subject_ids {
        membership::reassign_subjects(&tx, &refs, subject_ids)?;
    }
    tx.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (db::now_utc(), &student_id),
    )?;
    let row = student_row(&tx, &student_id)?;
    tx.commit()?;
    Ok(row)
}

/// Removal clears every back-reference and the student's ledger rows before
/// deleting the row itself; no cascades exist to do it for us.
fn students_remove(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let student_id = required_str(params, "studentId")?;

    let tx = conn.unchecked_transaction()?;
    let refs = membership::student_refs(&tx, &student_id)?
        .ok_or(WorkflowError::NotFound("student"))?;
    membership::withdraw_student(&tx, &refs)?;
    let fee_rows = tx.execute("DELETE FROM fee_payments WHERE student_id = ?", [&student_id])?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])?;
    tx.commit()?;
    info!(student = %student_id, fee_rows, "student removed");
    Ok(json!({
        "removed": true,
        "studentId": student_id,
        "feeRecordsRemoved": fee_rows
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "students.register"
            | "students.list"
            | "students.get"
            | "students.update"
            | "students.remove"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "students.register" => students_register(conn, &req.params),
        "students.list" => students_list(conn, &req.params),
        "students.get" => students_get(conn, &req.params),
        "students.update" => students_update(conn, &req.params),
        "students.remove" => students_remove(conn, &req.params),
        _ => unreachable!(),
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => workflow(&req.id, e),
    })
}
