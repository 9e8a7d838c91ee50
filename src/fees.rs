use chrono::{Datelike, NaiveDate};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::db;
use crate::error::WorkflowError;
use crate::membership;

/// Fallbacks used only when imposing a fine on a class whose fee policy is
/// unset. The payment-marking path treats a missing fee as 0 instead; the two
/// paths disagree upstream and unifying them would change observable amounts.
pub const FINE_FALLBACK_CLASS_FEE: i64 = 1000;
pub const FINE_FALLBACK_LATE_FINE: i64 = 500;

pub const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Canonicalizes a month label so "Jan", "jan" and "January" all key the same
/// ledger row. Accepts the full English name or a three-letter abbreviation,
/// case-insensitive.
pub fn canonical_month(label: &str) -> Option<&'static str> {
    let lower = label.trim().to_ascii_lowercase();
    MONTHS.iter().copied().find(|m| {
        let full = m.to_ascii_lowercase();
        full == lower || (lower.len() == 3 && full.starts_with(&lower))
    })
}

fn month_number(canonical: &str) -> u32 {
    MONTHS
        .iter()
        .position(|m| *m == canonical)
        .map(|i| i as u32 + 1)
        .unwrap_or(1)
}

/// Advance-payment rule for single-month marks: the month counts as future
/// when its first day, taken in `today`'s year, lies strictly after `today`.
pub fn is_future_month(canonical: &str, today: NaiveDate) -> bool {
    match NaiveDate::from_ymd_opt(today.year(), month_number(canonical), 1) {
        Some(first) => first > today,
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Paid,
    NotPaid,
}

impl PaymentStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "paid" => Some(Self::Paid),
            "not paid" => Some(Self::NotPaid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::NotPaid => "not paid",
        }
    }
}

/// One ledger row, as returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRecord {
    pub id: String,
    pub student_id: String,
    pub month: String,
    pub status: String,
    pub base_amount: i64,
    pub late_fine_amount: i64,
    pub late_fine: bool,
    pub fine_paid: bool,
    pub is_advance_payment: bool,
    pub payment_date: Option<String>,
}

pub fn fetch_record(
    conn: &Connection,
    student_id: &str,
    month: &str,
) -> Result<Option<FeeRecord>, WorkflowError> {
    let row = conn
        .query_row(
            "SELECT id, student_id, month, status, base_amount, late_fine_amount,
                    late_fine, fine_paid, is_advance_payment, payment_date
             FROM fee_payments
             WHERE student_id = ? AND month = ?",
            (student_id, month),
            |r| {
                Ok(FeeRecord {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    month: r.get(2)?,
                    status: r.get(3)?,
                    base_amount: r.get(4)?,
                    late_fine_amount: r.get(5)?,
                    late_fine: r.get::<_, i64>(6)? != 0,
                    fine_paid: r.get::<_, i64>(7)? != 0,
                    is_advance_payment: r.get::<_, i64>(8)? != 0,
                    payment_date: r.get(9)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Fee policy as stored on the class row. `None` fields mean unset; each
/// caller applies its own per-path default.
#[derive(Debug, Clone, Copy)]
pub struct FeePolicy {
    pub fee: Option<i64>,
    pub late_fine_amount: Option<i64>,
}

pub fn class_fee_policy(
    conn: &Connection,
    class_id: &str,
) -> Result<Option<FeePolicy>, WorkflowError> {
    let row = conn
        .query_row(
            "SELECT fee, late_fine_amount FROM classes WHERE id = ?",
            [class_id],
            |r| {
                Ok(FeePolicy {
                    fee: r.get(0)?,
                    late_fine_amount: r.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

#[derive(Debug, Clone)]
pub enum MarkMonths {
    Single(String),
    Bulk(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItem {
    pub month: String,
    pub outcome: &'static str,
}

#[derive(Debug)]
pub enum MarkOutcome {
    Single(FeeRecord),
    Bulk {
        items: Vec<BulkItem>,
        inserted: usize,
        updated: usize,
    },
}

/// Marks one month or a batch of months with the given payment status, in one
/// transaction. Per month: `base_amount` is seeded from the class fee on
/// insert only (missing fee counts as 0 here), paying clears the outstanding
/// fine flag, and `fine_paid` is asymmetric: bulk mode sets it
/// unconditionally, single mode only when the status is "paid".
pub fn mark_payments(
    conn: &Connection,
    student_id: &str,
    months: &MarkMonths,
    status: PaymentStatus,
    advance_flag: bool,
    today: NaiveDate,
) -> Result<MarkOutcome, WorkflowError> {
    let (labels, bulk): (Vec<&str>, bool) = match months {
        MarkMonths::Single(m) => (vec![m.as_str()], false),
        MarkMonths::Bulk(ms) => {
            if ms.is_empty() {
                return Err(WorkflowError::invalid_input("months must not be empty"));
            }
            (ms.iter().map(|s| s.as_str()).collect(), true)
        }
    };
    // Validate every label before any write so a bad bulk item costs nothing.
    let mut canonical: Vec<&'static str> = Vec::with_capacity(labels.len());
    for label in &labels {
        let m = canonical_month(label)
            .ok_or_else(|| WorkflowError::invalid_input(format!("unknown month: {}", label)))?;
        canonical.push(m);
    }

    let tx = conn.unchecked_transaction()?;
    let refs = membership::student_refs(&tx, student_id)?
        .ok_or(WorkflowError::NotFound("student"))?;
    let base_amount = class_fee_policy(&tx, &refs.class_id)?
        .and_then(|p| p.fee)
        .unwrap_or(0);
    let now = db::now_utc();

    let mut items: Vec<BulkItem> = Vec::with_capacity(canonical.len());
    let mut inserted = 0usize;
    let mut updated = 0usize;
    for month in &canonical {
        let advance = advance_flag || (!bulk && is_future_month(month, today));
        let existing_id: Option<String> = tx
            .query_row(
                "SELECT id FROM fee_payments WHERE student_id = ? AND month = ?",
                (student_id, month),
                |r| r.get(0),
            )
            .optional()?;
        match existing_id {
            Some(id) => {
                let mut set_parts: Vec<&str> = vec![
                    "status = ?",
                    "payment_date = ?",
                    "late_fine = 0",
                    "is_advance_payment = ?",
                ];
                let mut binds: Vec<Value> = vec![
                    Value::Text(status.as_str().to_string()),
                    Value::Text(now.clone()),
                    Value::Integer(advance as i64),
                ];
                if bulk || status == PaymentStatus::Paid {
                    set_parts.push("fine_paid = 1");
                }
                binds.push(Value::Text(id));
                let sql = format!(
                    "UPDATE fee_payments SET {} WHERE id = ?",
                    set_parts.join(", ")
                );
                tx.execute(&sql, params_from_iter(binds))?;
                updated += 1;
                items.push(BulkItem {
                    month: month.to_string(),
                    outcome: "updated",
                });
            }
            None => {
                let fine_paid = bulk || status == PaymentStatus::Paid;
                tx.execute(
                    "INSERT INTO fee_payments(
                        id, student_id, month, status, base_amount,
                        late_fine_amount, late_fine, fine_paid,
                        is_advance_payment, payment_date)
                     VALUES(?, ?, ?, ?, ?, 0, 0, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        student_id,
                        month,
                        status.as_str(),
                        base_amount,
                        fine_paid as i64,
                        advance as i64,
                        &now,
                    ),
                )?;
                inserted += 1;
                items.push(BulkItem {
                    month: month.to_string(),
                    outcome: "inserted",
                });
            }
        }
    }

    let outcome = if bulk {
        MarkOutcome::Bulk {
            items,
            inserted,
            updated,
        }
    } else {
        let record = fetch_record(&tx, student_id, canonical[0])?
            .ok_or_else(|| WorkflowError::invalid_state("fee record vanished mid-transaction"))?;
        MarkOutcome::Single(record)
    };
    tx.commit()?;
    debug!(student = student_id, inserted, updated, "fee mark committed");
    Ok(outcome)
}

#[derive(Debug)]
pub struct FineOutcome {
    pub record: FeeRecord,
    pub student_name: String,
}

/// Imposes a late fine on (student, month), creating the ledger row if it
/// does not exist yet. The fine is additive but never compounded: a second
/// call in the same unpaid state leaves `late_fine_amount` unchanged. A month
/// already marked paid cannot be fined.
pub fn impose_late_fine(
    conn: &Connection,
    student_id: &str,
    month_label: &str,
) -> Result<FineOutcome, WorkflowError> {
    let month = canonical_month(month_label)
        .ok_or_else(|| WorkflowError::invalid_input(format!("unknown month: {}", month_label)))?;

    let tx = conn.unchecked_transaction()?;
    let student: Option<(String, String)> = tx
        .query_row(
            "SELECT name, class_id FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let (student_name, class_id) = student.ok_or(WorkflowError::NotFound("student"))?;
    let policy =
        class_fee_policy(&tx, &class_id)?.ok_or(WorkflowError::NotFound("class"))?;
    let class_fee = policy.fee.unwrap_or(FINE_FALLBACK_CLASS_FEE);
    let late_fine = policy.late_fine_amount.unwrap_or(FINE_FALLBACK_LATE_FINE);

    let existing = fetch_record(&tx, student_id, month)?;
    match existing {
        Some(rec) if rec.status == PaymentStatus::Paid.as_str() => {
            return Err(WorkflowError::invalid_state(format!(
                "cannot impose a fine on {}: month already paid",
                month
            )));
        }
        Some(rec) => {
            let mut set_parts: Vec<&str> = vec!["late_fine = 1"];
            let mut binds: Vec<Value> = Vec::new();
            if rec.late_fine_amount == 0 {
                set_parts.push("late_fine_amount = late_fine_amount + ?");
                binds.push(Value::Integer(late_fine));
            }
            if rec.fine_paid {
                set_parts.push("fine_paid = 0");
            }
            binds.push(Value::Text(rec.id.clone()));
            let sql = format!(
                "UPDATE fee_payments SET {} WHERE id = ?",
                set_parts.join(", ")
            );
            tx.execute(&sql, params_from_iter(binds))?;
        }
        None => {
            tx.execute(
                "INSERT INTO fee_payments(
                    id, student_id, month, status, base_amount,
                    late_fine_amount, late_fine, fine_paid,
                    is_advance_payment, payment_date)
                 VALUES(?, ?, ?, 'not paid', ?, ?, 1, 0, 0, NULL)",
                (
                    Uuid::new_v4().to_string(),
                    student_id,
                    month,
                    class_fee,
                    late_fine,
                ),
            )?;
        }
    }

    let record = fetch_record(&tx, student_id, month)?
        .ok_or_else(|| WorkflowError::invalid_state("fee record vanished mid-transaction"))?;
    tx.commit()?;
    debug!(student = student_id, month, "late fine committed");
    Ok(FineOutcome {
        record,
        student_name,
    })
}

/// Read-only monthly fee statement. Months without a ledger row derive a
/// placeholder from the class fee with the payment-path default (0), marked
/// `recorded: false`.
pub fn statement(
    conn: &Connection,
    student_id: &str,
    months: Option<&[String]>,
) -> Result<Vec<serde_json::Value>, WorkflowError> {
    let requested: Vec<&'static str> = match months {
        Some(labels) => {
            let mut out = Vec::with_capacity(labels.len());
            for label in labels {
                let m = canonical_month(label).ok_or_else(|| {
                    WorkflowError::invalid_input(format!("unknown month: {}", label))
                })?;
                out.push(m);
            }
            out
        }
        None => MONTHS.to_vec(),
    };

    let refs = membership::student_refs(conn, student_id)?
        .ok_or(WorkflowError::NotFound("student"))?;
    let base_amount = class_fee_policy(conn, &refs.class_id)?
        .and_then(|p| p.fee)
        .unwrap_or(0);

    let mut rows = Vec::with_capacity(requested.len());
    for month in requested {
        match fetch_record(conn, student_id, month)? {
            Some(rec) => {
                let mut row = json!(rec);
                row["recorded"] = json!(true);
                rows.push(row);
            }
            None => rows.push(json!({
                "month": month,
                "status": PaymentStatus::NotPaid.as_str(),
                "baseAmount": base_amount,
                "lateFineAmount": 0,
                "lateFine": false,
                "finePaid": false,
                "isAdvancePayment": false,
                "paymentDate": null,
                "recorded": false
            })),
        }
    }
    Ok(rows)
}
