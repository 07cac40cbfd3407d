//! Import tasks
//!
//! One slot type flows through every phase of the import; the payload is
//! a tagged union of per-phase variants sharing `task_id`, the
//! cancellation token and the outcome. Workers record failures on the
//! task; the driver promotes the first failure in publish order at the
//! phase barrier.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::import::boundary::{scan_chunk, ChunkStats};
use crate::import::indexer::{build_partition_index, IndexerResult, IndexingContext};
use crate::import::loader::{import_partition_range, LoadContext, LoadResult};
use crate::import::symbols::{merge_symbol_tables, update_symbol_keys, SymbolMergeContext};
use crate::import::{CancellationToken, ImportPhase};
use crate::storage::symbol::SymbolMapWriter;
use crate::storage::table::TableWriter;
use crate::{Result, StrataError};

pub enum TaskPayload {
    Idle,
    BoundaryScan {
        input: Arc<PathBuf>,
        lo: u64,
        hi: u64,
        buffer_size: usize,
        stats: ChunkStats,
    },
    BuildPartitionIndex {
        ctx: Arc<IndexingContext>,
        chunk_index: u32,
        lo: u64,
        hi: u64,
        line_number: u64,
        skip_header: bool,
        file_length: u64,
        result: Option<IndexerResult>,
    },
    ImportPartitionData {
        ctx: Arc<LoadContext>,
        shadow_id: u32,
        lo: usize,
        hi: usize,
        result: Option<LoadResult>,
    },
    MergeSymbolTables {
        ctx: Arc<SymbolMergeContext>,
        column: String,
        target: Arc<Mutex<SymbolMapWriter>>,
    },
    UpdateSymbolKeys {
        shadow_dir: PathBuf,
        partition_dir_name: String,
        column: String,
        row_count: u64,
    },
    BuildColumnIndex {
        shadow_root: PathBuf,
        shadow_table: String,
        columns: Vec<String>,
    },
}

pub struct ImportTask {
    pub task_id: u32,
    pub phase: ImportPhase,
    pub payload: TaskPayload,
    pub outcome: Option<StrataError>,
    pub cancel: Option<CancellationToken>,
}

impl ImportTask {
    pub fn idle() -> Self {
        Self {
            task_id: 0,
            phase: ImportPhase::Init,
            payload: TaskPayload::Idle,
            outcome: None,
            cancel: None,
        }
    }

    /// Execute the payload in place; failures land in `outcome`.
    pub fn run(&mut self, worker_id: usize) {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                self.outcome = Some(StrataError::Cancelled { phase: self.phase });
                return;
            }
        }
        if let Err(e) = self.execute(worker_id) {
            log::error!("import task {} failed in {} phase: {e}", self.task_id, self.phase);
            self.outcome = Some(e);
        }
    }

    fn execute(&mut self, worker_id: usize) -> Result<()> {
        match &mut self.payload {
            TaskPayload::Idle => Ok(()),
            TaskPayload::BoundaryScan {
                input,
                lo,
                hi,
                buffer_size,
                stats,
            } => {
                *stats = scan_chunk(input, *lo, *hi, *buffer_size)?;
                Ok(())
            }
            TaskPayload::BuildPartitionIndex {
                ctx,
                chunk_index,
                lo,
                hi,
                line_number,
                skip_header,
                file_length,
                result,
            } => {
                *result = Some(build_partition_index(
                    ctx,
                    worker_id,
                    *chunk_index,
                    *lo,
                    *hi,
                    *line_number,
                    *skip_header,
                    *file_length,
                )?);
                Ok(())
            }
            TaskPayload::ImportPartitionData {
                ctx,
                shadow_id,
                lo,
                hi,
                result,
            } => {
                *result = Some(import_partition_range(ctx, *shadow_id, *lo, *hi)?);
                Ok(())
            }
            TaskPayload::MergeSymbolTables {
                ctx,
                column,
                target,
            } => merge_symbol_tables(ctx, column, target),
            TaskPayload::UpdateSymbolKeys {
                shadow_dir,
                partition_dir_name,
                column,
                row_count,
            } => update_symbol_keys(shadow_dir, partition_dir_name, column, *row_count),
            TaskPayload::BuildColumnIndex {
                shadow_root,
                shadow_table,
                columns,
            } => {
                let mut writer = TableWriter::open(shadow_root, shadow_table)?;
                for column in columns.iter() {
                    writer.add_index(column)?;
                }
                Ok(())
            }
        }
    }

    /// Reset the slot for reuse after collection.
    pub fn clear(&mut self) {
        self.task_id = 0;
        self.phase = ImportPhase::Init;
        self.payload = TaskPayload::Idle;
        self.outcome = None;
        self.cancel = None;
    }
}
