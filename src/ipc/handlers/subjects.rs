use crate::error::WorkflowError;
use crate::ipc::error::{err, ok, workflow};
use crate::ipc::types::{AppState, Request};
use crate::membership;
use rusqlite::{Connection, OptionalExtension};
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

fn subjects_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let name = required_str(params, "name")?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, students) VALUES(?, ?, '[]')",
        (&subject_id, &name),
    )?;
    Ok(json!({ "id": subject_id, "name": name, "students": [] }))
}

fn subjects_list(conn: &Connection) -> Result<serde_json::Value, WorkflowError> {
    let mut stmt =
        conn.prepare("SELECT id, name, students FROM subjects ORDER BY name")?;
    let subjects = stmt
        .query_map([], |r| {
            let students: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "studentCount": membership::parse_id_array(&students).len(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "subjects": subjects }))
}

/// Subjects are non-owning, so removal pulls the subject id out of every
/// enrolled student's owning array and deletes the row, in one transaction.
fn subjects_remove(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, WorkflowError> {
    let subject_id = required_str(params, "subjectId")?;

    let tx = conn.unchecked_transaction()?;
    let members: Option<String> = tx
        .query_row(
            "SELECT students FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()?;
    let members = members.ok_or(WorkflowError::NotFound("subject"))?;

    for student_id in membership::parse_id_array(&members) {
        let subjects: Option<String> = tx
            .query_row(
                "SELECT subjects FROM students WHERE id = ?",
                [&student_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(subjects) = subjects else { continue };
        let mut ids = membership::parse_id_array(&subjects);
        if membership::pull(&mut ids, &subject_id) {
            tx.execute(
                "UPDATE students SET subjects = ? WHERE id = ?",
                (membership::to_id_array(&ids), &student_id),
            )?;
        }
    }
    tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])?;
    tx.commit()?;
    Ok(json!({ "removed": true, "subjectId": subject_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "subjects.create" | "subjects.list" | "subjects.remove"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "subjects.create" => subjects_create(conn, &req.params),
        "subjects.list" => subjects_list(conn),
        "subjects.remove" => subjects_remove(conn, &req.params),
        _ => unreachable!(),
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => workflow(&req.id, e),
    })
}
