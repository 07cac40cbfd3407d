//! Engine configuration
//!
//! All collaborators receive configuration explicitly; there is no
//! module-scope mutable state.

use std::path::{Path, PathBuf};

/// Default read/convert buffer for file scans (2 MiB).
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 2 * 1024 * 1024;
/// Default number of records sampled for type detection.
pub const DEFAULT_TEXT_ANALYSIS_MAX_LINES: usize = 10_000;
/// Default per-partition index buffer flush threshold, in entries.
pub const DEFAULT_INDEX_FLUSH_THRESHOLD: usize = 256 * 1024;

/// Filesystem layout and tunables shared by the table engine and the importer.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory holding table directories.
    pub db_root: PathBuf,
    /// Root directory for transient import state (index chunks, shadow tables).
    pub work_root: PathBuf,
    /// Directories an import work dir must never alias.
    pub protected_roots: Vec<PathBuf>,
    /// Read buffer used by boundary scans, indexing and row conversion.
    pub copy_buffer_size: usize,
    /// Number of leading records sampled by the type detector.
    pub text_analysis_max_lines: usize,
    /// Entries buffered per partition before an index chunk is flushed and sorted.
    pub index_flush_threshold: usize,
}

impl StorageConfig {
    pub fn new(db_root: impl Into<PathBuf>, work_root: impl Into<PathBuf>) -> Self {
        let db_root = db_root.into();
        let work_root = work_root.into();
        let protected_roots = vec![db_root.clone(), PathBuf::from("/")];
        Self {
            db_root,
            work_root,
            protected_roots,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            text_analysis_max_lines: DEFAULT_TEXT_ANALYSIS_MAX_LINES,
            index_flush_threshold: DEFAULT_INDEX_FLUSH_THRESHOLD,
        }
    }

    /// True when `dir` aliases one of the protected roots.
    pub fn is_protected(&self, dir: &Path) -> bool {
        self.protected_roots.iter().any(|root| root == dir)
    }
}

/// Explicit collaborator bundle handed to the importer and its workers.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub config: StorageConfig,
    pub worker_count: usize,
}

impl Runtime {
    pub fn new(config: StorageConfig, worker_count: usize) -> Self {
        Self {
            config,
            worker_count: worker_count.max(1),
        }
    }
}
