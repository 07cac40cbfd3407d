//! Strata Columnar Table Store
//!
//! An embedded, time-partitioned columnar table engine with a parallel
//! CSV bulk importer. The importer splits an unordered input file into
//! chunks, indexes timestamps per partition, bulk-loads per-worker shadow
//! tables, reconciles symbol dictionaries and finally attaches finished
//! partition directories to the target table.

pub mod config;
pub mod import;
pub mod storage;

// Re-export main types
pub use config::{Runtime, StorageConfig};
pub use import::{
    Atomicity, CancellationToken, CsvFileImporter, ImportPhase, ImportRequest, ImportStats,
};
pub use storage::{ColumnMeta, ColumnType, PartitionBy, TableMeta, TableWriter};

/// Storage and import error type
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("invalid partition name: {0}")]
    InvalidPartitionName(String),

    #[error("another parallel import is in progress")]
    Busy,

    #[error("import cancelled in {phase} phase")]
    Cancelled { phase: import::ImportPhase },

    #[error("import failed in {phase} phase: {message}")]
    Import {
        phase: import::ImportPhase,
        message: String,
    },
}

impl StrataError {
    /// Phase the error is attributed to, when it carries one.
    pub fn phase(&self) -> Option<import::ImportPhase> {
        match self {
            StrataError::Cancelled { phase } | StrataError::Import { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
