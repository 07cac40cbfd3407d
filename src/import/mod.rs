//! Parallel CSV import
//!
//! Imports one large, unordered CSV file into a time-partitioned table.
//! The driver runs the phases in order, fanning each out over the worker
//! pool through the task queue and stealing work whenever the queue is
//! full:
//!
//! 1. boundary check: scan chunks for quote parity and newline offsets
//! 2. indexing: write per-partition `(timestamp, offset)` index chunks
//! 3. partition import: merge indexes, bulk-load per-worker shadow tables
//! 4. symbol table merge: fold shadow dictionaries into the target's
//! 5. update symbol keys: rewrite shadow keys through the remap files
//! 6. build index: secondary indexes over indexed symbol columns
//! 7. move partitions: rename (or cross-device copy) into the target
//! 8. attach partitions: graft the moved directories onto the target
//!
//! Every phase transition is a barrier; the first task failure in publish
//! order wins. Cleanup removes the work directory and shadow tables on
//! all paths, and restores the target (truncate pre-existing, drop
//! freshly created) when the import fails.

pub mod boundary;
pub mod indexer;
pub mod lexer;
pub mod loader;
pub mod queue;
pub mod symbols;
pub mod task;
#[cfg(test)]
mod tests;
pub mod timestamp;
pub mod types;

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fs2::FileExt;

use crate::config::Runtime;
use crate::import::boundary::ChunkStats;
use crate::import::indexer::IndexingContext;
use crate::import::loader::{
    assign_partitions, shadow_table_name, LoadContext, PartitionInfo,
};
use crate::import::queue::{worker_loop, TaskQueue, QUEUE_CAPACITY};
use crate::import::symbols::SymbolMergeContext;
use crate::import::task::{ImportTask, TaskPayload};
use crate::import::timestamp::TimestampParser;
use crate::import::types::{
    adapter_for, detect_delimiter, detect_schema, ColumnAdapter, DetectedSchema,
};
use crate::storage::meta::{ColumnMeta, ColumnType, TableMeta};
use crate::storage::table::{
    create_table, drop_table, is_valid_table_name, table_dir, table_exists, TableWriter,
};
use crate::{Result, StrataError};

pub use loader::PartitionInfo as ImportPartitionInfo;

/// Chunks never shrink below this unless the file itself is smaller.
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 300 * 1024 * 1024;

const LOCK_FILE_NAME: &str = ".import.lock";
const EXDEV: i32 = 18;

/// What to do when a row cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Atomicity {
    /// Leave the failed column at its type's null and keep the row.
    #[default]
    SkipCol,
    /// Drop the row.
    SkipRow,
    /// Fail the whole import.
    SkipAll,
}

/// Import state machine; also the context attached to errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Init,
    BoundaryCheck,
    Indexing,
    PartitionImport,
    SymbolTableMerge,
    UpdateSymbolKeys,
    BuildIndex,
    MovePartitions,
    AttachPartitions,
    Done,
}

impl std::fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImportPhase::Init => "init",
            ImportPhase::BoundaryCheck => "boundary check",
            ImportPhase::Indexing => "indexing",
            ImportPhase::PartitionImport => "partition import",
            ImportPhase::SymbolTableMerge => "symbol table merge",
            ImportPhase::UpdateSymbolKeys => "update symbol keys",
            ImportPhase::BuildIndex => "build index",
            ImportPhase::MovePartitions => "move partitions",
            ImportPhase::AttachPartitions => "attach partitions",
            ImportPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation; polled at phase boundaries and task dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One import, fully described.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub table: String,
    pub input_file: PathBuf,
    pub partition_by: crate::storage::PartitionBy,
    /// Auto-detected from the first buffer when unset.
    pub delimiter: Option<u8>,
    /// Required when the target table does not exist.
    pub timestamp_column: Option<String>,
    /// chrono format string; common shapes are probed when unset.
    pub timestamp_format: Option<String>,
    pub force_header: bool,
    pub atomicity: Atomicity,
}

#[derive(Debug, Default)]
pub struct ImportStats {
    pub imported_rows: u64,
    pub skipped_rows: u64,
    pub partitions: Vec<PartitionInfo>,
}

/// Process-wide advisory lock: one parallel import per work root.
struct ImportLock {
    file: File,
}

impl ImportLock {
    fn acquire(work_root: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(work_root.join(LOCK_FILE_NAME))?;
        file.try_lock_exclusive().map_err(|_| StrataError::Busy)?;
        Ok(Self { file })
    }
}

impl Drop for ImportLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

struct Analysis {
    delimiter: u8,
    schema: DetectedSchema,
    parser: TimestampParser,
}

/// Target table opened (or created) for the import, plus the conversion
/// plan from input fields to target columns.
struct PreparedTarget {
    writer: TableWriter,
    /// Adapters by input field position; moved into the load context.
    adapters: Option<Vec<Box<dyn ColumnAdapter>>>,
    /// Input field position → target column index.
    column_map: Vec<usize>,
    /// Input field position of the designated timestamp.
    timestamp_field: usize,
    parser: TimestampParser,
    delimiter: u8,
    has_header: bool,
    created: bool,
    existed: bool,
}

pub struct CsvFileImporter {
    runtime: Runtime,
    cancel: CancellationToken,
    min_chunk_size: u64,
    request: Option<ImportRequest>,
}

impl CsvFileImporter {
    pub fn new(runtime: Runtime, cancel: CancellationToken) -> Self {
        Self {
            runtime,
            cancel,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            request: None,
        }
    }

    pub fn configure(&mut self, request: ImportRequest) -> Result<()> {
        if !is_valid_table_name(&request.table) {
            return Err(StrataError::Config(format!(
                "invalid table name '{}'",
                request.table
            )));
        }
        self.request = Some(request);
        Ok(())
    }

    pub fn set_min_chunk_size(&mut self, bytes: u64) {
        self.min_chunk_size = bytes.max(1);
    }

    /// Run the whole import; blocks until done, failed or cancelled.
    pub fn run(&mut self) -> Result<ImportStats> {
        let request = self
            .request
            .take()
            .ok_or_else(|| StrataError::Config("importer is not configured".to_string()))?;
        let config = self.runtime.config.clone();

        fs::create_dir_all(&config.work_root)?;
        let _lock = ImportLock::acquire(&config.work_root)?;

        let work_dir = config.work_root.join(&request.table);
        if config.is_protected(&work_dir) {
            return Err(StrataError::Config(format!(
                "import work directory '{}' aliases a protected root",
                work_dir.display()
            )));
        }

        let started = Instant::now();
        log::info!(
            "started importing file '{}' into table '{}'",
            request.input_file.display(),
            request.table
        );

        let file_len = fs::metadata(&request.input_file)?.len();
        if file_len < 1 {
            return Err(StrataError::Import {
                phase: ImportPhase::BoundaryCheck,
                message: format!("empty input file '{}'", request.input_file.display()),
            });
        }

        let analysis = analyze_structure(&config, &request, file_len)?;
        let mut target = prepare_table(&config, &request, analysis)?;

        let queue = TaskQueue::new(QUEUE_CAPACITY);
        let shutdown = AtomicBool::new(false);
        let worker_count = self.runtime.worker_count;

        let outcome = std::thread::scope(|scope| {
            for w in 0..worker_count {
                let queue = &queue;
                let shutdown = &shutdown;
                scope.spawn(move || worker_loop(queue, w, shutdown));
            }
            let mut job = ImportJob {
                runtime: &self.runtime,
                queue: &queue,
                cancel: &self.cancel,
                request: &request,
                file_len,
                work_dir: &work_dir,
                min_chunk_size: self.min_chunk_size,
                target: &mut target,
                phase: ImportPhase::Init,
                phase_start: Instant::now(),
            };
            let result = job.run();
            shutdown.store(true, Ordering::Release);
            result
        });

        let result = match outcome {
            Ok(stats) => {
                log::info!(
                    "finished importing file '{}' rows={} skipped={} time={}ms",
                    request.input_file.display(),
                    stats.imported_rows,
                    stats.skipped_rows,
                    started.elapsed().as_millis()
                );
                Ok(stats)
            }
            Err(e) => {
                log::error!("import of '{}' failed: {e}", request.input_file.display());
                restore_target(&config, &request, target);
                Err(e)
            }
        };

        remove_dir_logged(&work_dir);
        remove_shadow_tables(&config.work_root, &request.table);
        result
    }
}

/// Undo target-table side effects after a failed import.
fn restore_target(
    config: &crate::config::StorageConfig,
    request: &ImportRequest,
    mut target: PreparedTarget,
) {
    if target.existed {
        if let Err(e) = target.writer.truncate() {
            log::error!("could not truncate table '{}': {e}", request.table);
        }
    } else if target.created {
        drop(target.writer);
        if let Err(e) = drop_table(&config.db_root, &request.table) {
            log::error!("could not remove table '{}': {e}", request.table);
        }
    }
}

fn remove_dir_logged(dir: &Path) {
    if dir.exists() {
        log::info!("removing import directory '{}'", dir.display());
        if let Err(e) = fs::remove_dir_all(dir) {
            log::error!("could not remove '{}': {e}", dir.display());
        }
    }
}

/// Remove every `${table}_${n}` shadow table under the work root.
fn remove_shadow_tables(work_root: &Path, table: &str) {
    let prefix = format!("{table}_");
    let entries = match fs::read_dir(work_root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                remove_dir_logged(&entry.path());
            }
        }
    }
}

/// Read the leading buffer, settle the delimiter and detect the schema.
fn analyze_structure(
    config: &crate::config::StorageConfig,
    request: &ImportRequest,
    file_len: u64,
) -> Result<Analysis> {
    let mut file = File::open(&request.input_file)?;
    let mut buf = vec![0u8; config.copy_buffer_size];
    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    let buf = &buf[..filled];
    let eof = filled as u64 == file_len;

    let delimiter = request
        .delimiter
        .unwrap_or_else(|| detect_delimiter(buf));
    let parser = TimestampParser::new(request.timestamp_format.clone());
    let mut schema = detect_schema(
        buf,
        delimiter,
        config.text_analysis_max_lines,
        request.force_header,
        eof,
        &parser,
    )?;
    // a declared timestamp column overrides probing for it; rows that do
    // not conform then fail row-wise through the atomicity policy
    if let Some(name) = &request.timestamp_column {
        if let Some(col) = schema
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
        {
            col.ctype = ColumnType::Timestamp;
        }
    }
    if schema.columns.is_empty() {
        return Err(StrataError::Config(format!(
            "cannot determine structure of '{}'",
            request.input_file.display()
        )));
    }
    log::debug!(
        "analyzed '{}': {} columns, delimiter '{}', header={}",
        request.input_file.display(),
        schema.columns.len(),
        delimiter as char,
        schema.has_header
    );
    Ok(Analysis {
        delimiter,
        schema,
        parser,
    })
}

/// Open or create the target and build the field → column plan.
fn prepare_table(
    config: &crate::config::StorageConfig,
    request: &ImportRequest,
    analysis: Analysis,
) -> Result<PreparedTarget> {
    let Analysis {
        delimiter,
        schema,
        parser,
    } = analysis;
    let detected = &schema.columns;

    if table_exists(&config.db_root, &request.table) {
        let writer = TableWriter::open(&config.db_root, &request.table)?;
        let meta = writer.metadata();

        if writer.row_count() > 0 {
            return Err(StrataError::Config(format!(
                "target table must be empty [table={}]",
                request.table
            )));
        }
        if meta.partition_by != request.partition_by {
            return Err(StrataError::Config(
                "declared partition by unit doesn't match table's".to_string(),
            ));
        }
        if detected.len() > meta.column_count() {
            return Err(StrataError::SchemaMismatch(format!(
                "column count mismatch [textColumnCount={}, tableColumnCount={}, table={}]",
                detected.len(),
                meta.column_count(),
                request.table
            )));
        }

        let column_map: Vec<usize> = detected
            .iter()
            .enumerate()
            .map(|(i, col)| meta.column_index(&col.name).unwrap_or(i))
            .collect();

        let designated = meta.timestamp_index;
        if let Some(name) = &request.timestamp_column {
            let requested = meta
                .column_index(name)
                .ok_or_else(|| StrataError::Config(format!("invalid timestamp column '{name}'")))?;
            if requested != designated {
                return Err(StrataError::Config(format!(
                    "column '{name}' is not the designated timestamp of table '{}'",
                    request.table
                )));
            }
        }
        let timestamp_field = column_map
            .iter()
            .position(|&target| target == designated)
            .ok_or_else(|| StrataError::Config("timestamp column not found".to_string()))?;
        if meta.columns[designated].ctype != ColumnType::Timestamp {
            return Err(StrataError::SchemaMismatch(format!(
                "designated timestamp column '{}' is not TIMESTAMP typed",
                meta.columns[designated].name
            )));
        }
        validate_timestamp_shape(detected[timestamp_field].ctype, &meta.columns[designated].name)?;

        let mut adapters = Vec::with_capacity(detected.len());
        for (i, col) in detected.iter().enumerate() {
            let target_type = meta.columns[column_map[i]].ctype;
            if col.ctype != target_type {
                log::info!(
                    "mis-detected [table={}, column={}, type={}]",
                    request.table,
                    i,
                    col.ctype.name()
                );
            }
            adapters.push(adapter_for(col.ctype, target_type, &parser));
        }

        Ok(PreparedTarget {
            writer,
            adapters: Some(adapters),
            column_map,
            timestamp_field,
            parser,
            delimiter,
            has_header: schema.has_header,
            created: false,
            existed: true,
        })
    } else {
        let ts_name = request.timestamp_column.as_deref().ok_or_else(|| {
            StrataError::Config("timestamp column must be set when importing to new table".to_string())
        })?;
        let timestamp_field = detected
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(ts_name))
            .ok_or_else(|| {
                StrataError::Config(format!(
                    "timestamp column '{ts_name}' not found in file header"
                ))
            })?;
        validate_timestamp_shape(detected[timestamp_field].ctype, ts_name)?;

        let columns: Vec<ColumnMeta> = detected
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let ctype = if i == timestamp_field {
                    ColumnType::Timestamp
                } else {
                    col.ctype
                };
                ColumnMeta::new(&col.name, ctype)
            })
            .collect();
        let meta = TableMeta::new(&request.table, columns, timestamp_field, request.partition_by);
        create_table(&config.db_root, &meta)?;
        let writer = match TableWriter::open(&config.db_root, &request.table) {
            Ok(writer) => writer,
            Err(e) => {
                let _ = drop_table(&config.db_root, &request.table);
                return Err(e);
            }
        };

        let adapters: Vec<Box<dyn ColumnAdapter>> = detected
            .iter()
            .enumerate()
            .map(|(i, col)| adapter_for(col.ctype, meta.columns[i].ctype, &parser))
            .collect();

        Ok(PreparedTarget {
            writer,
            adapters: Some(adapters),
            column_map: (0..detected.len()).collect(),
            timestamp_field,
            parser,
            delimiter,
            has_header: schema.has_header,
            created: true,
            existed: false,
        })
    }
}

fn validate_timestamp_shape(detected: ColumnType, name: &str) -> Result<()> {
    match detected {
        ColumnType::Timestamp | ColumnType::Long => Ok(()),
        other => Err(StrataError::Config(format!(
            "column '{name}' is not a timestamp [detected={}]",
            other.name()
        ))),
    }
}

// ============================================================================
// Driver
// ============================================================================

struct ImportJob<'a> {
    runtime: &'a Runtime,
    queue: &'a TaskQueue,
    cancel: &'a CancellationToken,
    request: &'a ImportRequest,
    file_len: u64,
    work_dir: &'a Path,
    min_chunk_size: u64,
    target: &'a mut PreparedTarget,
    phase: ImportPhase,
    phase_start: Instant,
}

/// Drain `outstanding` collected task slots, stealing work while the
/// collect sequence is dry. The first recorded failure wins; failed tasks
/// skip their consumer.
fn collect_tasks(
    queue: &TaskQueue,
    outstanding: u32,
    driver_id: usize,
    failure: &mut Option<StrataError>,
    consumer: &mut dyn FnMut(&mut ImportTask),
) -> u32 {
    let mut collected = 0;
    while collected < outstanding {
        if let Some(seq) = queue.next_collect() {
            {
                let mut task = queue.slot(seq).lock();
                match task.outcome.take() {
                    Some(e) => {
                        if failure.is_none() {
                            *failure = Some(e);
                        }
                    }
                    None => consumer(&mut task),
                }
                task.clear();
            }
            queue.done_collect(seq);
            collected += 1;
        } else if !queue.steal(driver_id) {
            TaskQueue::pause();
        }
    }
    collected
}

/// Publish one task, draining the queue in line whenever it is full.
#[allow(clippy::too_many_arguments)]
fn publish_task(
    queue: &TaskQueue,
    driver_id: usize,
    queued: &mut u32,
    collected: &mut u32,
    failure: &mut Option<StrataError>,
    consumer: &mut dyn FnMut(&mut ImportTask),
    fill: impl FnOnce(&mut ImportTask),
) {
    loop {
        if let Some(seq) = queue.next_pub() {
            {
                let mut task = queue.slot(seq).lock();
                task.clear();
                fill(&mut task);
            }
            queue.done_pub(seq);
            *queued += 1;
            return;
        }
        *collected += collect_tasks(queue, *queued - *collected, driver_id, failure, consumer);
    }
}

impl<'a> ImportJob<'a> {
    fn run(&mut self) -> Result<ImportStats> {
        let chunks = self.find_chunk_boundaries()?;
        let (partition_bytes, max_line_length, indexing_skipped) = self.index_chunks(&chunks)?;
        let (partitions, shadow_count, load_skipped) =
            self.import_partitions(partition_bytes, max_line_length, indexing_skipped)?;
        self.merge_symbol_tables(shadow_count)?;
        self.update_symbol_keys(&partitions)?;
        self.build_column_indexes(shadow_count)?;
        self.move_partitions(&partitions)?;
        self.attach_partitions(&partitions)?;
        self.phase = ImportPhase::Done;

        Ok(ImportStats {
            imported_rows: partitions.iter().map(|p| p.imported_rows).sum(),
            skipped_rows: indexing_skipped + load_skipped,
            partitions,
        })
    }

    fn driver_id(&self) -> usize {
        self.runtime.worker_count
    }

    fn enter_phase(&mut self, phase: ImportPhase) -> Result<()> {
        self.phase = phase;
        if self.cancel.is_cancelled() {
            return Err(StrataError::Cancelled { phase });
        }
        log::info!(
            "started {} of file '{}'",
            phase,
            self.request.input_file.display()
        );
        self.phase_start = Instant::now();
        Ok(())
    }

    fn exit_phase(&self) {
        log::info!(
            "finished {} of file '{}' time={}ms",
            self.phase,
            self.request.input_file.display(),
            self.phase_start.elapsed().as_millis()
        );
    }

    fn fail(&self, message: String) -> StrataError {
        StrataError::Import {
            phase: self.phase,
            message,
        }
    }

    /// Phase 1: resolve true chunk starts. Returns `(offset, line)` pairs
    /// including the terminating `(file_len, _)`.
    fn find_chunk_boundaries(&mut self) -> Result<Vec<(u64, u64)>> {
        self.enter_phase(ImportPhase::BoundaryCheck)?;

        let worker_count = self.runtime.worker_count as u64;
        let chunk_size = self
            .min_chunk_size
            .max(self.file_len.div_ceil(worker_count));
        let chunk_count = self.file_len.div_ceil(chunk_size).max(1);

        if worker_count == 1 || chunk_count == 1 {
            self.exit_phase();
            return Ok(vec![(0, 0), (self.file_len, 0)]);
        }

        let input = Arc::new(self.request.input_file.clone());
        let buffer_size = self.runtime.config.copy_buffer_size;
        let mut stats = vec![ChunkStats::empty(); chunk_count as usize];
        let mut failure = None;
        let (mut queued, mut collected) = (0u32, 0u32);

        {
            let mut consumer = |task: &mut ImportTask| {
                if let TaskPayload::BoundaryScan {
                    stats: chunk_stats, ..
                } = &task.payload
                {
                    stats[task.task_id as usize] = *chunk_stats;
                }
            };
            for i in 0..chunk_count {
                let lo = i * chunk_size;
                let hi = (lo + chunk_size).min(self.file_len);
                let input = Arc::clone(&input);
                let cancel = self.cancel.clone();
                publish_task(
                    self.queue,
                    self.driver_id(),
                    &mut queued,
                    &mut collected,
                    &mut failure,
                    &mut consumer,
                    |task| {
                        task.task_id = i as u32;
                        task.phase = ImportPhase::BoundaryCheck;
                        task.cancel = Some(cancel);
                        task.payload = TaskPayload::BoundaryScan {
                            input,
                            lo,
                            hi,
                            buffer_size,
                            stats: ChunkStats::empty(),
                        };
                    },
                );
            }
            collected += collect_tasks(
                self.queue,
                queued - collected,
                self.driver_id(),
                &mut failure,
                &mut consumer,
            );
        }
        debug_assert_eq!(queued, collected);
        if let Some(e) = failure {
            return Err(e);
        }

        let bounds = process_chunk_stats(&stats, self.file_len);
        self.exit_phase();
        Ok(bounds)
    }

    /// Phase 2: per-chunk partition indexing.
    fn index_chunks(
        &mut self,
        bounds: &[(u64, u64)],
    ) -> Result<(Vec<(i64, u64)>, u64, u64)> {
        self.enter_phase(ImportPhase::Indexing)?;

        if bounds.len() < 2 {
            return Err(self.fail(format!(
                "no chunks found for indexing in file '{}'",
                self.request.input_file.display()
            )));
        }

        if self.work_dir.exists() {
            fs::remove_dir_all(self.work_dir)?;
        }
        fs::create_dir_all(self.work_dir)?;
        log::info!("created import dir '{}'", self.work_dir.display());

        let ctx = Arc::new(IndexingContext {
            input_path: self.request.input_file.clone(),
            work_dir: self.work_dir.to_path_buf(),
            partition_by: self.request.partition_by,
            delimiter: self.target.delimiter,
            timestamp_index: self.target.timestamp_field,
            timestamp_parser: self.target.parser.clone(),
            column_count: self.target.column_map.len(),
            buffer_size: self.runtime.config.copy_buffer_size,
            flush_threshold: self.runtime.config.index_flush_threshold,
        });

        let mut partition_bytes: std::collections::BTreeMap<i64, u64> =
            std::collections::BTreeMap::new();
        let mut max_line_length = 0u64;
        let mut skipped_rows = 0u64;
        let mut failure = None;
        let (mut queued, mut collected) = (0u32, 0u32);

        {
            let mut consumer = |task: &mut ImportTask| {
                if let TaskPayload::BuildPartitionIndex {
                    result: Some(result),
                    ..
                } = &task.payload
                {
                    for &(key, bytes) in &result.partitions {
                        *partition_bytes.entry(key).or_insert(0) += bytes;
                    }
                    max_line_length = max_line_length.max(result.max_line_length);
                    skipped_rows += result.skipped_rows;
                }
            };
            for i in 0..bounds.len() - 1 {
                let (lo, line_number) = bounds[i];
                let hi = bounds[i + 1].0;
                let ctx = Arc::clone(&ctx);
                let cancel = self.cancel.clone();
                let skip_header = self.target.has_header && i == 0;
                let file_length = self.file_len;
                publish_task(
                    self.queue,
                    self.driver_id(),
                    &mut queued,
                    &mut collected,
                    &mut failure,
                    &mut consumer,
                    |task| {
                        task.task_id = i as u32;
                        task.phase = ImportPhase::Indexing;
                        task.cancel = Some(cancel);
                        task.payload = TaskPayload::BuildPartitionIndex {
                            ctx,
                            chunk_index: i as u32,
                            lo,
                            hi,
                            line_number,
                            skip_header,
                            file_length,
                            result: None,
                        };
                    },
                );
            }
            collected += collect_tasks(
                self.queue,
                queued - collected,
                self.driver_id(),
                &mut failure,
                &mut consumer,
            );
        }
        debug_assert_eq!(queued, collected);
        if let Some(e) = failure {
            return Err(e);
        }

        self.exit_phase();
        Ok((
            partition_bytes.into_iter().collect(),
            max_line_length,
            skipped_rows,
        ))
    }

    /// Phase 3: merge indexes and bulk-load shadow tables.
    fn import_partitions(
        &mut self,
        partition_bytes: Vec<(i64, u64)>,
        max_line_length: u64,
        indexing_skipped: u64,
    ) -> Result<(Vec<PartitionInfo>, u32, u64)> {
        self.enter_phase(ImportPhase::PartitionImport)?;

        if self.request.atomicity == Atomicity::SkipAll && indexing_skipped > 0 {
            return Err(self.fail(format!(
                "{indexing_skipped} rows could not be parsed"
            )));
        }
        if partition_bytes.is_empty() {
            return Err(self.fail("no partitions to merge and load found".to_string()));
        }

        let partitions: Vec<PartitionInfo> = partition_bytes
            .into_iter()
            .map(|(key, bytes)| PartitionInfo {
                key,
                dir_name: self.request.partition_by.format_dir_name(key),
                bytes,
                task_id: u32::MAX,
                imported_rows: 0,
            })
            .collect();
        let (mut partitions, ranges) =
            assign_partitions(partitions, self.runtime.worker_count);
        let shadow_count = ranges.len() as u32;

        let adapters = self
            .target
            .adapters
            .take()
            .expect("adapters consumed once, in this phase");
        let ctx = Arc::new(LoadContext {
            input_path: self.request.input_file.clone(),
            work_dir: self.work_dir.to_path_buf(),
            shadow_root: self.runtime.config.work_root.clone(),
            meta: self.target.writer.metadata().clone(),
            adapters,
            column_map: self.target.column_map.clone(),
            timestamp_field: self.target.timestamp_field,
            delimiter: self.target.delimiter,
            atomicity: self.request.atomicity,
            partitions: partitions.clone(),
            max_line_length,
        });

        let mut load_skipped = 0u64;
        let mut failure = None;
        let (mut queued, mut collected) = (0u32, 0u32);
        {
            let mut consumer = |task: &mut ImportTask| {
                if let TaskPayload::ImportPartitionData {
                    lo,
                    result: Some(result),
                    ..
                } = &task.payload
                {
                    for (j, &imported) in result.imported.iter().enumerate() {
                        partitions[*lo + j].imported_rows = imported;
                    }
                    load_skipped += result.skipped;
                }
            };
            for (shadow_id, &(lo, hi)) in ranges.iter().enumerate() {
                let ctx = Arc::clone(&ctx);
                let cancel = self.cancel.clone();
                publish_task(
                    self.queue,
                    self.driver_id(),
                    &mut queued,
                    &mut collected,
                    &mut failure,
                    &mut consumer,
                    |task| {
                        task.task_id = shadow_id as u32;
                        task.phase = ImportPhase::PartitionImport;
                        task.cancel = Some(cancel);
                        task.payload = TaskPayload::ImportPartitionData {
                            ctx,
                            shadow_id: shadow_id as u32,
                            lo,
                            hi,
                            result: None,
                        };
                    },
                );
            }
            collected += collect_tasks(
                self.queue,
                queued - collected,
                self.driver_id(),
                &mut failure,
                &mut consumer,
            );
        }
        debug_assert_eq!(queued, collected);
        if let Some(e) = failure {
            return Err(e);
        }

        self.exit_phase();
        Ok((partitions, shadow_count, load_skipped))
    }

    /// Phase 4: one task per symbol column; the target dictionary is the
    /// serialization point, shadows fold in worker-id order.
    fn merge_symbol_tables(&mut self, shadow_count: u32) -> Result<()> {
        self.enter_phase(ImportPhase::SymbolTableMerge)?;

        let symbol_columns = self.target.writer.metadata().symbol_columns();
        if symbol_columns.is_empty() {
            self.exit_phase();
            return Ok(());
        }

        let ctx = Arc::new(SymbolMergeContext {
            shadow_root: self.runtime.config.work_root.clone(),
            table_name: self.request.table.clone(),
            shadow_count,
        });

        let mut failure = None;
        let (mut queued, mut collected) = (0u32, 0u32);
        {
            let mut consumer = |_task: &mut ImportTask| {};
            for col in symbol_columns {
                let column = self.target.writer.metadata().columns[col].name.clone();
                let dict = self.target.writer.symbol_map(col)?;
                let ctx = Arc::clone(&ctx);
                let cancel = self.cancel.clone();
                publish_task(
                    self.queue,
                    self.driver_id(),
                    &mut queued,
                    &mut collected,
                    &mut failure,
                    &mut consumer,
                    |task| {
                        task.task_id = col as u32;
                        task.phase = ImportPhase::SymbolTableMerge;
                        task.cancel = Some(cancel);
                        task.payload = TaskPayload::MergeSymbolTables {
                            ctx,
                            column,
                            target: dict,
                        };
                    },
                );
            }
            collected += collect_tasks(
                self.queue,
                queued - collected,
                self.driver_id(),
                &mut failure,
                &mut consumer,
            );
        }
        debug_assert_eq!(queued, collected);
        if let Some(e) = failure {
            return Err(e);
        }
        self.exit_phase();
        Ok(())
    }

    /// Phase 5: rewrite shadow symbol keys through the remap files.
    fn update_symbol_keys(&mut self, partitions: &[PartitionInfo]) -> Result<()> {
        self.enter_phase(ImportPhase::UpdateSymbolKeys)?;

        let meta = self.target.writer.metadata();
        let symbol_names: Vec<String> = meta
            .symbol_columns()
            .into_iter()
            .map(|c| meta.columns[c].name.clone())
            .collect();

        let mut failure = None;
        let (mut queued, mut collected) = (0u32, 0u32);
        {
            let mut consumer = |_task: &mut ImportTask| {};
            for p in partitions.iter().filter(|p| p.imported_rows > 0) {
                let shadow_dir = table_dir(
                    &self.runtime.config.work_root,
                    &shadow_table_name(&self.request.table, p.task_id),
                );
                for column in &symbol_names {
                    let shadow_dir = shadow_dir.clone();
                    let column = column.clone();
                    let dir_name = p.dir_name.clone();
                    let row_count = p.imported_rows;
                    let cancel = self.cancel.clone();
                    let task_id = p.task_id;
                    publish_task(
                        self.queue,
                        self.driver_id(),
                        &mut queued,
                        &mut collected,
                        &mut failure,
                        &mut consumer,
                        |task| {
                            task.task_id = task_id;
                            task.phase = ImportPhase::UpdateSymbolKeys;
                            task.cancel = Some(cancel);
                            task.payload = TaskPayload::UpdateSymbolKeys {
                                shadow_dir,
                                partition_dir_name: dir_name,
                                column,
                                row_count,
                            };
                        },
                    );
                }
            }
            collected += collect_tasks(
                self.queue,
                queued - collected,
                self.driver_id(),
                &mut failure,
                &mut consumer,
            );
        }
        debug_assert_eq!(queued, collected);
        if let Some(e) = failure {
            return Err(e);
        }
        self.exit_phase();
        Ok(())
    }

    /// Phase 6: secondary indexes over shadow tables.
    fn build_column_indexes(&mut self, shadow_count: u32) -> Result<()> {
        self.enter_phase(ImportPhase::BuildIndex)?;

        let meta = self.target.writer.metadata();
        let indexed: Vec<String> = meta
            .columns
            .iter()
            .filter(|c| c.indexed && c.ctype == ColumnType::Symbol)
            .map(|c| c.name.clone())
            .collect();

        if !indexed.is_empty() {
            let mut failure = None;
            let (mut queued, mut collected) = (0u32, 0u32);
            {
                let mut consumer = |_task: &mut ImportTask| {};
                for shadow_id in 0..shadow_count {
                    let shadow_root = self.runtime.config.work_root.clone();
                    let shadow_table = shadow_table_name(&self.request.table, shadow_id);
                    let columns = indexed.clone();
                    let cancel = self.cancel.clone();
                    publish_task(
                        self.queue,
                        self.driver_id(),
                        &mut queued,
                        &mut collected,
                        &mut failure,
                        &mut consumer,
                        |task| {
                            task.task_id = shadow_id;
                            task.phase = ImportPhase::BuildIndex;
                            task.cancel = Some(cancel);
                            task.payload = TaskPayload::BuildColumnIndex {
                                shadow_root,
                                shadow_table,
                                columns,
                            };
                        },
                    );
                }
                collected += collect_tasks(
                    self.queue,
                    queued - collected,
                    self.driver_id(),
                    &mut failure,
                    &mut consumer,
                );
            }
            debug_assert_eq!(queued, collected);
            if let Some(e) = failure {
                return Err(e);
            }
        }
        self.exit_phase();
        Ok(())
    }

    /// Phase 7: rename (or copy across devices) shadow partition dirs
    /// into the target table directory.
    fn move_partitions(&mut self, partitions: &[PartitionInfo]) -> Result<()> {
        self.enter_phase(ImportPhase::MovePartitions)?;

        let target_dir = self.target.writer.table_dir().to_path_buf();
        for p in partitions.iter().filter(|p| p.imported_rows > 0) {
            let src = table_dir(
                &self.runtime.config.work_root,
                &shadow_table_name(&self.request.table, p.task_id),
            )
            .join(&p.dir_name);
            let dst = target_dir.join(&p.dir_name);
            move_partition_dir(&src, &dst)?;
        }
        self.exit_phase();
        Ok(())
    }

    /// Phase 8: attach every moved partition and commit the target.
    fn attach_partitions(&mut self, partitions: &[PartitionInfo]) -> Result<()> {
        self.enter_phase(ImportPhase::AttachPartitions)?;

        let mut attached = 0u32;
        for p in partitions.iter().filter(|p| p.imported_rows > 0) {
            let key = self.request.partition_by.parse_dir_name(&p.dir_name)?;
            self.target.writer.attach_partition(key)?;
            attached += 1;
        }
        if attached == 0 {
            return Err(self.fail("no partitions to attach found".to_string()));
        }
        self.target.writer.commit(true)?;
        self.exit_phase();
        Ok(())
    }
}

/// Fold the per-chunk stats left to right into true chunk boundaries.
/// A chunk whose candidate start is missing (all quoted text or one very
/// long line) merges into its predecessor.
fn process_chunk_stats(stats: &[ChunkStats], file_len: u64) -> Vec<(u64, u64)> {
    let mut bounds = vec![(0u64, 0u64)];
    let mut quotes = stats[0].quote_count;
    let mut total_lines = stats[0].nl_count_even + 1;

    for chunk in &stats[1..] {
        let (start, lines) = if quotes & 1 == 1 {
            (chunk.nl_first_odd, chunk.nl_count_odd)
        } else {
            (chunk.nl_first_even, chunk.nl_count_even)
        };
        if start > -1 {
            bounds.push((start as u64, total_lines));
        }
        quotes += chunk.quote_count;
        total_lines += lines;
    }

    if bounds.last().map(|&(o, _)| o < file_len).unwrap_or(false) {
        bounds.push((file_len, total_lines));
    }
    bounds
}

/// Move a partition directory, falling back to a per-file copy when the
/// source and destination sit on different filesystems.
fn move_partition_dir(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            log::info!(
                "'{}' and '{}' are not on the same mounted filesystem, copying",
                src.display(),
                dst.display()
            );
            copy_partition_dir(src, dst)
        }
        Err(e) => Err(e.into()),
    }
}

/// Copy the regular files of one partition directory.
fn copy_partition_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), dst.join(entry.file_name()))?;
        }
    }
    Ok(())
}
