use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Attribute '{0}' not found in table '{1}'")]
    AttributeNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Duplicate entry in '{table}': {key}")]
    DuplicateEntry { table: String, key: String },

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("No rows in '{0}' match the restriction")]
    MissingRow(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
