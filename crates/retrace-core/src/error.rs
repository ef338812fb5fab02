use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetraceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Row decode error: {0}")]
    RowDecode(String),

    #[error("DB task join error: {0}")]
    TaskJoin(String),
}
