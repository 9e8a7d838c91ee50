use thiserror::Error;

/// Failure of a fee or membership workflow. Mutating operations abort their
/// transaction and surface exactly one of these; the IPC layer serializes the
/// code string plus `status()` into the error envelope.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("duplicate value for {field}")]
    Conflict { field: String },
    #[error("database error: {0}")]
    Internal(rusqlite::Error),
}

impl WorkflowError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidState(_) => "invalid_state",
            Self::Conflict { .. } => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) => 400,
            Self::InvalidState(_) => 422,
            Self::Conflict { .. } => 409,
            Self::Internal(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for WorkflowError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &e {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                if let Some(field) = unique_violation_field(message) {
                    return Self::Conflict { field };
                }
            }
        }
        Self::Internal(e)
    }
}

/// Extracts the bare column names from a SQLite unique-violation message,
/// e.g. "UNIQUE constraint failed: fee_payments.student_id, fee_payments.month"
/// becomes "student_id, month".
fn unique_violation_field(message: &str) -> Option<String> {
    let columns = message.strip_prefix("UNIQUE constraint failed: ")?;
    let bare: Vec<&str> = columns
        .split(", ")
        .map(|col| col.rsplit('.').next().unwrap_or(col))
        .collect();
    if bare.is_empty() {
        return None;
    }
    Some(bare.join(", "))
}
