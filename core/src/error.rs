use thiserror::Error;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown data store '{name}'")]
    UnknownStore { name: String },

    #[error("Data store '{store}' unavailable: {reason}")]
    StoreUnavailable { store: String, reason: String },

    #[error("Refusing to seed store '{store}' at {uri}: it already holds rows")]
    SeedRefused { store: String, uri: String },

    #[error("Column '{column}' missing from result set")]
    MissingColumn { column: String },

    #[error("Column '{column}': expected {expected}, found {found}")]
    ColumnType {
        column: String,
        expected: &'static str,
        found: String,
    },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PushResult<T> = Result<T, PushError>;
