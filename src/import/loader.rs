//! Index merge and shadow-table load
//!
//! The driver assigns indexed partitions to shadow tables with a greedy
//! longest-processing-time-first pass over partition byte sizes. Each
//! load task then creates its shadow table, k-way merges the memory-mapped
//! chunk indexes of every assigned partition into `index.m`, and replays
//! the merged order against the input file: read the record at each
//! offset, tokenize it, convert fields through the column adapters and
//! append the row.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::import::indexer::INDEX_ENTRY_SIZE;
use crate::import::lexer::{CsvLexer, Fields, RecordMeta, RecordSink};
use crate::import::types::ColumnAdapter;
use crate::import::{Atomicity, ImportPhase};
use crate::storage::meta::TableMeta;
use crate::storage::table::{create_table, table_dir, TableWriter};
use crate::{Result, StrataError};

pub const MERGED_INDEX_FILE_NAME: &str = "index.m";

/// One indexed partition and its place in the load plan.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub key: i64,
    pub dir_name: String,
    /// Index bytes accumulated over all chunks; the LPT weight.
    pub bytes: u64,
    /// Shadow table (load task) the partition is assigned to.
    pub task_id: u32,
    pub imported_rows: u64,
}

/// Greedy LPT assignment: heaviest partition first onto the least-loaded
/// worker, ties to the lowest index. Returns the partitions re-sorted by
/// `(task_id, key)` together with each shadow's `[lo, hi)` range; shadow
/// ids are dense, covering only workers that received work.
pub fn assign_partitions(
    mut partitions: Vec<PartitionInfo>,
    worker_count: usize,
) -> (Vec<PartitionInfo>, Vec<(usize, usize)>) {
    let mut order: Vec<usize> = (0..partitions.len()).collect();
    order.sort_by(|&a, &b| {
        partitions[b]
            .bytes
            .cmp(&partitions[a].bytes)
            .then(partitions[a].key.cmp(&partitions[b].key))
    });

    let mut loads = vec![0u64; worker_count.max(1)];
    for idx in order {
        let worker = loads
            .iter()
            .enumerate()
            .min_by_key(|&(i, &load)| (load, i))
            .map(|(i, _)| i)
            .expect("at least one worker");
        partitions[idx].task_id = worker as u32;
        loads[worker] += partitions[idx].bytes;
    }

    // densify shadow ids over the workers that actually got partitions
    let mut used: Vec<u32> = partitions.iter().map(|p| p.task_id).collect();
    used.sort_unstable();
    used.dedup();
    for p in &mut partitions {
        p.task_id = used.binary_search(&p.task_id).expect("assigned above") as u32;
    }

    partitions.sort_by_key(|p| (p.task_id, p.key));

    let mut ranges = Vec::with_capacity(used.len());
    let mut lo = 0;
    for shadow in 0..used.len() as u32 {
        let hi = partitions.partition_point(|p| p.task_id <= shadow);
        ranges.push((lo, hi));
        lo = hi;
    }
    (partitions, ranges)
}

/// Shared input for every load task of one import.
pub struct LoadContext {
    pub input_path: PathBuf,
    pub work_dir: PathBuf,
    /// Shadow tables are created here, next to the work dir.
    pub shadow_root: PathBuf,
    /// Target schema; shadow tables clone it under their own name.
    pub meta: TableMeta,
    /// Adapters by input field position.
    pub adapters: Vec<Box<dyn ColumnAdapter>>,
    /// Input field position → target column index.
    pub column_map: Vec<usize>,
    /// Field position of the designated timestamp in the input.
    pub timestamp_field: usize,
    pub delimiter: u8,
    pub atomicity: Atomicity,
    pub partitions: Vec<PartitionInfo>,
    /// Read buffer for row re-tokenization; at least the longest record.
    pub max_line_length: u64,
}

#[derive(Debug, Default)]
pub struct LoadResult {
    /// Imported row count per partition of the task's `[lo, hi)` range.
    pub imported: Vec<u64>,
    pub skipped: u64,
}

pub fn shadow_table_name(table: &str, shadow_id: u32) -> String {
    format!("{table}_{shadow_id}")
}

struct RowSink<'a> {
    writer: &'a mut TableWriter,
    adapters: &'a [Box<dyn ColumnAdapter>],
    column_map: &'a [usize],
    timestamp_field: usize,
    atomicity: Atomicity,
    /// Timestamp of the entry being replayed; set before each record.
    ts: i64,
    imported: u64,
    skipped: u64,
}

impl<'a> RecordSink for RowSink<'a> {
    fn on_record(&mut self, meta: RecordMeta, fields: &Fields<'_>) -> Result<()> {
        let mut row = self.writer.new_row(self.ts)?;
        let count = fields.len().min(self.adapters.len());
        let mut cancelled = false;
        for i in 0..count {
            if i == self.timestamp_field {
                continue;
            }
            let bytes = fields.get(i);
            if bytes.is_empty() {
                continue;
            }
            if self.adapters[i]
                .write(&mut row, self.column_map[i], bytes)
                .is_err()
            {
                match self.atomicity {
                    Atomicity::SkipAll => {
                        return Err(StrataError::Import {
                            phase: ImportPhase::PartitionImport,
                            message: format!(
                                "bad syntax at offset {} column {i}",
                                meta.offset
                            ),
                        });
                    }
                    Atomicity::SkipRow => {
                        cancelled = true;
                        break;
                    }
                    Atomicity::SkipCol => {}
                }
            }
        }
        if cancelled {
            row.cancel();
            self.skipped += 1;
        } else {
            row.append()?;
            self.imported += 1;
        }
        Ok(())
    }
}

/// Memory-map every chunk index file of a partition directory.
fn map_index_chunks(partition_dir: &Path) -> Result<Vec<Mmap>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(partition_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| n != MERGED_INDEX_FILE_NAME)
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut maps = Vec::with_capacity(paths.len());
    for path in paths {
        let file = File::open(&path)?;
        if file.metadata()?.len() == 0 {
            continue;
        }
        maps.push(unsafe { Mmap::map(&file)? });
    }
    Ok(maps)
}

#[inline]
fn entry_at(map: &Mmap, pos: usize) -> (i64, u64) {
    let base = pos * INDEX_ENTRY_SIZE;
    let ts = i64::from_ne_bytes(map[base..base + 8].try_into().unwrap());
    let offset = u64::from_ne_bytes(map[base + 8..base + 16].try_into().unwrap());
    (ts, offset)
}

/// K-way merge the sorted chunk maps into `index.m`; ties on timestamp
/// resolve by source offset, preserving original file order.
fn merge_index_chunks(partition_dir: &Path, chunks: &[Mmap]) -> Result<Option<MmapMut>> {
    let total: usize = chunks.iter().map(|m| m.len()).sum();
    if total == 0 {
        return Ok(None);
    }
    let merged_path = partition_dir.join(MERGED_INDEX_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&merged_path)?;
    file.set_len(total as u64)?;
    let mut out = unsafe { MmapMut::map_mut(&file)? };

    let mut heap: BinaryHeap<Reverse<(i64, u64, usize)>> = BinaryHeap::with_capacity(chunks.len());
    let mut positions = vec![0usize; chunks.len()];
    for (c, map) in chunks.iter().enumerate() {
        let (ts, offset) = entry_at(map, 0);
        heap.push(Reverse((ts, offset, c)));
    }

    let mut write_at = 0usize;
    while let Some(Reverse((ts, offset, c))) = heap.pop() {
        out[write_at..write_at + 8].copy_from_slice(&ts.to_ne_bytes());
        out[write_at + 8..write_at + 16].copy_from_slice(&offset.to_ne_bytes());
        write_at += INDEX_ENTRY_SIZE;

        positions[c] += 1;
        if positions[c] * INDEX_ENTRY_SIZE < chunks[c].len() {
            let (ts, offset) = entry_at(&chunks[c], positions[c]);
            heap.push(Reverse((ts, offset, c)));
        }
    }
    debug_assert_eq!(write_at, total);
    Ok(Some(out))
}

/// Load `[lo, hi)` of the partition plan into shadow table `shadow_id`.
pub fn import_partition_range(
    ctx: &LoadContext,
    shadow_id: u32,
    lo: usize,
    hi: usize,
) -> Result<LoadResult> {
    let shadow_name = shadow_table_name(&ctx.meta.table_name, shadow_id);
    let shadow_dir = table_dir(&ctx.shadow_root, &shadow_name);
    if shadow_dir.exists() {
        fs::remove_dir_all(&shadow_dir)?;
    }
    let mut shadow_meta = ctx.meta.clone();
    shadow_meta.table_name = shadow_name.clone();
    create_table(&ctx.shadow_root, &shadow_meta)?;
    let mut writer = TableWriter::open(&ctx.shadow_root, &shadow_name)?;

    let mut input = File::open(&ctx.input_path)?;
    let input_len = input.metadata()?.len();
    let mut record_buf = vec![0u8; (ctx.max_line_length.max(1)) as usize];
    let mut lexer = CsvLexer::new(ctx.delimiter);

    let mut result = LoadResult {
        imported: vec![0; hi - lo],
        skipped: 0,
    };

    for p in lo..hi {
        let partition_dir = ctx.work_dir.join(&ctx.partitions[p].dir_name);
        if !partition_dir.is_dir() {
            return Err(StrataError::Corruption(format!(
                "missing partition index directory '{}'",
                partition_dir.display()
            )));
        }
        let chunks = map_index_chunks(&partition_dir)?;
        let merged = match merge_index_chunks(&partition_dir, &chunks)? {
            Some(merged) => merged,
            None => continue,
        };
        drop(chunks);

        let mut sink = RowSink {
            writer: &mut writer,
            adapters: &ctx.adapters,
            column_map: &ctx.column_map,
            timestamp_field: ctx.timestamp_field,
            atomicity: ctx.atomicity,
            ts: 0,
            imported: 0,
            skipped: 0,
        };

        let entry_count = merged.len() / INDEX_ENTRY_SIZE;
        for e in 0..entry_count {
            let base = e * INDEX_ENTRY_SIZE;
            let ts = i64::from_ne_bytes(merged[base..base + 8].try_into().unwrap());
            let offset = u64::from_ne_bytes(merged[base + 8..base + 16].try_into().unwrap());

            let want = record_buf.len().min((input_len - offset) as usize);
            input.seek(SeekFrom::Start(offset))?;
            input.read_exact(&mut record_buf[..want])?;

            sink.ts = ts;
            lexer.restart(offset, 0, false);
            let emitted = lexer.parse_one(&record_buf[..want], &mut sink)?;
            if !emitted {
                // trailing record without a final newline
                lexer.parse_last(&mut sink)?;
            }
        }

        result.imported[p - lo] = sink.imported;
        result.skipped += sink.skipped;
        drop(sink);
        writer.commit(true)?;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(key: i64, bytes: u64) -> PartitionInfo {
        PartitionInfo {
            key,
            dir_name: format!("p{key}"),
            bytes,
            task_id: u32::MAX,
            imported_rows: 0,
        }
    }

    #[test]
    fn test_lpt_balances_by_bytes() {
        let parts = vec![part(0, 100), part(1, 90), part(2, 20), part(3, 10)];
        let (assigned, ranges) = assign_partitions(parts, 2);
        assert_eq!(ranges.len(), 2);
        // heaviest two split across workers, small ones fill the lighter
        let load0: u64 = assigned.iter().filter(|p| p.task_id == 0).map(|p| p.bytes).sum();
        let load1: u64 = assigned.iter().filter(|p| p.task_id == 1).map(|p| p.bytes).sum();
        assert_eq!(load0 + load1, 220);
        assert!(load0.abs_diff(load1) <= 20);
    }

    #[test]
    fn test_assignment_is_sorted_and_dense() {
        let parts = vec![part(30, 5), part(10, 5), part(20, 5)];
        let (assigned, ranges) = assign_partitions(parts, 8);
        // only three workers used, ids dense, partitions sorted within
        assert_eq!(ranges.len(), 3);
        for (shadow, &(lo, hi)) in ranges.iter().enumerate() {
            for p in &assigned[lo..hi] {
                assert_eq!(p.task_id, shadow as u32);
            }
        }
        let mut last = (0u32, i64::MIN);
        for p in &assigned {
            assert!((p.task_id, p.key) >= last);
            last = (p.task_id, p.key);
        }
    }

    #[test]
    fn test_single_worker_gets_everything() {
        let parts = vec![part(2, 1), part(1, 1)];
        let (assigned, ranges) = assign_partitions(parts, 1);
        assert_eq!(ranges, vec![(0, 2)]);
        assert_eq!(assigned[0].key, 1);
        assert_eq!(assigned[1].key, 2);
    }

    #[test]
    fn test_assignment_deterministic_on_ties() {
        let parts = vec![part(4, 7), part(3, 7), part(2, 7), part(1, 7)];
        let (a, _) = assign_partitions(parts.clone(), 2);
        let (b, _) = assign_partitions(parts, 2);
        let keyed_a: Vec<_> = a.iter().map(|p| (p.key, p.task_id)).collect();
        let keyed_b: Vec<_> = b.iter().map(|p| (p.key, p.task_id)).collect();
        assert_eq!(keyed_a, keyed_b);
    }
}
