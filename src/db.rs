use chrono::Utc;
use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("campus.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Row layout mirrors the document model: owning references and the
/// denormalized `students` back-reference arrays (JSON text) are maintained
/// by the membership engine inside transactions, not by foreign keys. The
/// store only enforces the two uniqueness constraints the engines rely on:
/// fee_payments(student_id, month) and students.email.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            fee INTEGER,
            late_fine_amount INTEGER,
            students TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;
    ensure_classes_late_fine_amount(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            students TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            grade TEXT,
            parent_name TEXT,
            parent_contact TEXT,
            class_id TEXT NOT NULL,
            subjects TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            month TEXT NOT NULL,
            status TEXT NOT NULL,
            base_amount INTEGER NOT NULL DEFAULT 0,
            late_fine_amount INTEGER NOT NULL DEFAULT 0,
            late_fine INTEGER NOT NULL DEFAULT 0,
            fine_paid INTEGER NOT NULL DEFAULT 0,
            is_advance_payment INTEGER NOT NULL DEFAULT 0,
            payment_date TEXT,
            UNIQUE(student_id, month)
        )",
        [],
    )?;
    ensure_fee_payments_advance_flag(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_student ON fee_payments(student_id)",
        [],
    )?;

    Ok(())
}

/// RFC 3339 UTC timestamp with second precision, the format every row
/// timestamp in the workspace uses.
pub fn now_utc() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// Workspaces created before late fines shipped lack the policy column.
fn ensure_classes_late_fine_amount(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "classes", "late_fine_amount")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE classes ADD COLUMN late_fine_amount INTEGER", [])?;
    Ok(())
}

// Advance-payment tracking was added after the first ledger release.
fn ensure_fee_payments_advance_flag(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "fee_payments", "is_advance_payment")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE fee_payments ADD COLUMN is_advance_payment INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
