use rusqlite::{Connection, OptionalExtension};

use crate::error::WorkflowError;

/// Class and subject rows carry a denormalized `students` JSON array that
/// inverts the owning references on the student row. Nothing in the store
/// enforces the link, so every routine here runs inside the caller's
/// transaction and patches both sides or neither.

pub fn parse_id_array(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub fn to_id_array(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

/// Set-semantics append: no duplicates, insertion order preserved.
pub fn add_to_set(ids: &mut Vec<String>, id: &str) -> bool {
    if ids.iter().any(|existing| existing == id) {
        return false;
    }
    ids.push(id.to_string());
    true
}

/// Removes every occurrence of `id`.
pub fn pull(ids: &mut Vec<String>, id: &str) -> bool {
    let before = ids.len();
    ids.retain(|existing| existing != id);
    ids.len() != before
}

pub fn dedupe(ids: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        add_to_set(&mut out, &id);
    }
    out
}

/// The owning-reference side of a student row, as the engine needs it.
#[derive(Debug, Clone)]
pub struct StudentRefs {
    pub id: String,
    pub class_id: String,
    pub subjects: Vec<String>,
}

pub fn student_refs(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<StudentRefs>, WorkflowError> {
    let row = conn
        .query_row(
            "SELECT id, class_id, subjects FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(id, class_id, subjects)| StudentRefs {
        id,
        class_id,
        subjects: parse_id_array(&subjects),
    }))
}

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, WorkflowError> {
    let hit = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?;
    Ok(hit.is_some())
}

pub fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, WorkflowError> {
    let hit = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?;
    Ok(hit.is_some())
}

fn members_of(conn: &Connection, table: &str, id: &str) -> Result<Vec<String>, WorkflowError> {
    let sql = format!("SELECT students FROM {} WHERE id = ?", table);
    let raw: Option<String> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    Ok(raw.map(|s| parse_id_array(&s)).unwrap_or_default())
}

fn write_members(
    conn: &Connection,
    table: &str,
    id: &str,
    ids: &[String],
) -> Result<(), WorkflowError> {
    let sql = format!("UPDATE {} SET students = ? WHERE id = ?", table);
    conn.execute(&sql, (to_id_array(ids), id))?;
    Ok(())
}

pub fn add_student_to_class(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<(), WorkflowError> {
    let mut members = members_of(conn, "classes", class_id)?;
    if add_to_set(&mut members, student_id) {
        write_members(conn, "classes", class_id, &members)?;
    }
    Ok(())
}

pub fn remove_student_from_class(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<(), WorkflowError> {
    let mut members = members_of(conn, "classes", class_id)?;
    if pull(&mut members, student_id) {
        write_members(conn, "classes", class_id, &members)?;
    }
    Ok(())
}

pub fn add_student_to_subject(
    conn: &Connection,
    subject_id: &str,
    student_id: &str,
) -> Result<(), WorkflowError> {
    let mut members = members_of(conn, "subjects", subject_id)?;
    if add_to_set(&mut members, student_id) {
        write_members(conn, "subjects", subject_id, &members)?;
    }
    Ok(())
}

pub fn remove_student_from_subject(
    conn: &Connection,
    subject_id: &str,
    student_id: &str,
) -> Result<(), WorkflowError> {
    let mut members = members_of(conn, "subjects", subject_id)?;
    if pull(&mut members, student_id) {
        write_members(conn, "subjects", subject_id, &members)?;
    }
    Ok(())
}

/// Moves the student between class member arrays and repoints the owning
/// reference. No-op when the class is unchanged. Caller supplies the
/// transaction; all three writes land together or not at all.
pub fn reassign_class(
    conn: &Connection,
    student: &StudentRefs,
    new_class_id: &str,
) -> Result<bool, WorkflowError> {
    if student.class_id == new_class_id {
        return Ok(false);
    }
    if !class_exists(conn, new_class_id)? {
        return Err(WorkflowError::NotFound("class"));
    }
    remove_student_from_class(conn, &student.class_id, &student.id)?;
    add_student_to_class(conn, new_class_id, &student.id)?;
    conn.execute(
        "UPDATE students SET class_id = ? WHERE id = ?",
        (new_class_id, &student.id),
    )?;
    Ok(true)
}

/// Replaces the student's subject set: pulls the id from subjects being
/// dropped, adds it to subjects being picked up, then overwrites the owning
/// array. Every target subject must exist before anything is written.
pub fn reassign_subjects(
    conn: &Connection,
    student: &StudentRefs,
    new_subject_ids: &[String],
) -> Result<bool, WorkflowError> {
    let new_set = dedupe(new_subject_ids.to_vec());
    for subject_id in &new_set {
        if !subject_exists(conn, subject_id)? {
            return Err(WorkflowError::NotFound("subject"));
        }
    }

    let removed: Vec<&String> = student
        .subjects
        .iter()
        .filter(|s| !new_set.contains(s))
        .collect();
    let added: Vec<&String> = new_set
        .iter()
        .filter(|s| !student.subjects.contains(s))
        .collect();
    if removed.is_empty() && added.is_empty() && new_set == student.subjects {
        return Ok(false);
    }

    for subject_id in removed {
        remove_student_from_subject(conn, subject_id, &student.id)?;
    }
    for subject_id in added {
        add_student_to_subject(conn, subject_id, &student.id)?;
    }
    conn.execute(
        "UPDATE students SET subjects = ? WHERE id = ?",
        (to_id_array(&new_set), &student.id),
    )?;
    Ok(true)
}

/// Back-reference bookkeeping for a brand-new student row.
pub fn enroll_new_student(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
    subject_ids: &[String],
) -> Result<(), WorkflowError> {
    add_student_to_class(conn, class_id, student_id)?;
    for subject_id in subject_ids {
        add_student_to_subject(conn, subject_id, student_id)?;
    }
    Ok(())
}

/// Pulls a departing student out of every member array it appears in.
pub fn withdraw_student(conn: &Connection, student: &StudentRefs) -> Result<(), WorkflowError> {
    remove_student_from_class(conn, &student.class_id, &student.id)?;
    for subject_id in &student.subjects {
        remove_student_from_subject(conn, subject_id, &student.id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn mem_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("schema");
        conn
    }

    fn insert_class(conn: &Connection, id: &str, students: &[&str]) {
        let arr = serde_json::to_string(students).expect("encode");
        conn.execute(
            "INSERT INTO classes(id, name, fee, late_fine_amount, students)
             VALUES(?, ?, 500, 100, ?)",
            (id, format!("Class {}", id), arr),
        )
        .expect("insert class");
    }

    fn insert_subject(conn: &Connection, id: &str, students: &[&str]) {
        let arr = serde_json::to_string(students).expect("encode");
        conn.execute(
            "INSERT INTO subjects(id, name, students) VALUES(?, ?, ?)",
            (id, format!("Subject {}", id), arr),
        )
        .expect("insert subject");
    }

    fn insert_student(conn: &Connection, id: &str, class_id: &str, subjects: &[&str]) {
        let arr = serde_json::to_string(subjects).expect("encode");
        conn.execute(
            "INSERT INTO students(id, name, email, class_id, subjects)
             VALUES(?, ?, ?, ?, ?)",
            (id, format!("Student {}", id), format!("{}@school.test", id), class_id, arr),
        )
        .expect("insert student");
    }

    #[test]
    fn add_to_set_rejects_duplicates() {
        let mut ids = vec!["a".to_string()];
        assert!(!add_to_set(&mut ids, "a"));
        assert!(add_to_set(&mut ids, "b"));
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn pull_removes_all_occurrences() {
        let mut ids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert!(pull(&mut ids, "a"));
        assert_eq!(ids, vec!["b"]);
        assert!(!pull(&mut ids, "a"));
    }

    #[test]
    fn dedupe_preserves_first_occurrence_order() {
        let ids = vec![
            "s2".to_string(),
            "s1".to_string(),
            "s2".to_string(),
            "s3".to_string(),
        ];
        assert_eq!(dedupe(ids), vec!["s2", "s1", "s3"]);
    }

    #[test]
    fn parse_id_array_tolerates_garbage() {
        assert_eq!(parse_id_array("[\"a\",\"b\"]"), vec!["a", "b"]);
        assert!(parse_id_array("not json").is_empty());
        assert!(parse_id_array("").is_empty());
    }

    #[test]
    fn reassign_class_moves_backreference_exactly_once() {
        let conn = mem_db();
        insert_class(&conn, "ca", &["s1", "s9"]);
        insert_class(&conn, "cb", &["s9"]);
        insert_student(&conn, "s1", "ca", &[]);

        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        let changed = reassign_class(&conn, &refs, "cb").expect("reassign");
        assert!(changed);

        let a = members_of(&conn, "classes", "ca").expect("members a");
        let b = members_of(&conn, "classes", "cb").expect("members b");
        assert!(!a.contains(&"s1".to_string()));
        assert_eq!(b.iter().filter(|s| s.as_str() == "s1").count(), 1);

        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        assert_eq!(refs.class_id, "cb");
    }

    #[test]
    fn reassign_class_is_noop_for_same_class() {
        let conn = mem_db();
        insert_class(&conn, "ca", &["s1"]);
        insert_student(&conn, "s1", "ca", &[]);
        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        assert!(!reassign_class(&conn, &refs, "ca").expect("reassign"));
        assert_eq!(members_of(&conn, "classes", "ca").expect("members"), vec!["s1"]);
    }

    #[test]
    fn reassign_class_requires_target_to_exist() {
        let conn = mem_db();
        insert_class(&conn, "ca", &["s1"]);
        insert_student(&conn, "s1", "ca", &[]);
        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        let err = reassign_class(&conn, &refs, "missing").expect_err("must fail");
        assert_eq!(err.code(), "not_found");
        // Nothing moved.
        assert_eq!(members_of(&conn, "classes", "ca").expect("members"), vec!["s1"]);
    }

    #[test]
    fn reassign_subjects_applies_set_difference() {
        let conn = mem_db();
        insert_class(&conn, "ca", &["s1"]);
        insert_subject(&conn, "mat", &["s1", "s2"]);
        insert_subject(&conn, "sci", &["s2"]);
        insert_subject(&conn, "art", &[]);
        insert_student(&conn, "s1", "ca", &["mat"]);

        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        let changed =
            reassign_subjects(&conn, &refs, &["sci".to_string(), "art".to_string()])
                .expect("reassign");
        assert!(changed);

        assert_eq!(members_of(&conn, "subjects", "mat").expect("mat"), vec!["s2"]);
        assert_eq!(
            members_of(&conn, "subjects", "sci").expect("sci"),
            vec!["s2", "s1"]
        );
        assert_eq!(members_of(&conn, "subjects", "art").expect("art"), vec!["s1"]);

        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        assert_eq!(refs.subjects, vec!["sci", "art"]);
    }

    #[test]
    fn reassign_subjects_dedupes_input() {
        let conn = mem_db();
        insert_class(&conn, "ca", &["s1"]);
        insert_subject(&conn, "mat", &[]);
        insert_student(&conn, "s1", "ca", &[]);

        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        reassign_subjects(&conn, &refs, &["mat".to_string(), "mat".to_string()])
            .expect("reassign");

        assert_eq!(members_of(&conn, "subjects", "mat").expect("mat"), vec!["s1"]);
        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        assert_eq!(refs.subjects, vec!["mat"]);
    }

    #[test]
    fn reassign_subjects_rejects_unknown_subject_before_writing() {
        let conn = mem_db();
        insert_class(&conn, "ca", &["s1"]);
        insert_subject(&conn, "mat", &["s1"]);
        insert_student(&conn, "s1", "ca", &["mat"]);

        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        let err = reassign_subjects(&conn, &refs, &["ghost".to_string()])
            .expect_err("must fail");
        assert_eq!(err.code(), "not_found");
        assert_eq!(members_of(&conn, "subjects", "mat").expect("mat"), vec!["s1"]);
    }

    #[test]
    fn withdraw_student_clears_every_array() {
        let conn = mem_db();
        insert_class(&conn, "ca", &["s1", "s2"]);
        insert_subject(&conn, "mat", &["s1"]);
        insert_subject(&conn, "sci", &["s1", "s2"]);
        insert_student(&conn, "s1", "ca", &["mat", "sci"]);

        let refs = student_refs(&conn, "s1").expect("query").expect("student");
        withdraw_student(&conn, &refs).expect("withdraw");

        assert_eq!(members_of(&conn, "classes", "ca").expect("ca"), vec!["s2"]);
        assert!(members_of(&conn, "subjects", "mat").expect("mat").is_empty());
        assert_eq!(members_of(&conn, "subjects", "sci").expect("sci"), vec!["s2"]);
    }
}
