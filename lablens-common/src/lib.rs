pub mod config;
pub use config::{Config, LoggingConfig, PipelineConfig, QueryConfig, RebuildPolicy, StorageConfig};

use thiserror::Error;

/// Rejected filter input. Raised at compile time, before anything reaches an executor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("condition {index}: unknown column '{column}'")]
    UnknownColumn { index: usize, column: String },
    #[error("condition {index}: unsupported operator '{operator}'")]
    UnknownOperator { index: usize, operator: String },
    #[error("unsupported logic '{0}' (use AND or OR)")]
    UnknownLogic(String),
    #[error("condition {index}: operator '{operator}' expects {expected}")]
    ShapeMismatch { index: usize, operator: String, expected: &'static str },
    #[error("condition {index}: operator '{operator}' does not accept null")]
    NullNotAllowed { index: usize, operator: String },
    #[error("condition {index}: 'in' requires a non-empty list")]
    EmptyInList { index: usize },
    #[error("condition {index}: invalid value for column '{column}': {detail}")]
    InvalidValue { index: usize, column: String, detail: String },
    #[error("condition {index}: unparseable date '{raw}'")]
    InvalidDate { index: usize, raw: String },
    #[error("condition {index}: operator '{operator}' is not supported on column '{column}'")]
    UnsupportedForColumn { index: usize, operator: String, column: String },
    #[error("column '{column}' is not available on {relation}")]
    NotInRelation { column: String, relation: &'static str },
    #[error("cannot sort {relation} by '{column}'")]
    InvalidSort { column: String, relation: &'static str },
    #[error("unsupported sort order '{0}' (use ASC or DESC)")]
    InvalidOrder(String),
    #[error("malformed filter: {0}")]
    Malformed(String),
}

/// Aggregate rebuild failure. The previously published views stay in place.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("fact snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error("fact snapshot is missing required column '{0}'")]
    MissingColumn(String),
    #[error("invalid fact snapshot at row {row}: {detail}")]
    InvalidSnapshot { row: usize, detail: String },
    #[error("a rebuild is already in progress")]
    RebuildInProgress,
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Error, Debug)]
pub enum LabLensError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LabLensError>;
