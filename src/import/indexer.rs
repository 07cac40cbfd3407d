//! Partition indexer
//!
//! Streams one chunk of the input through the lexer and appends
//! `(timestamp, record offset)` pairs to per-partition index files under
//! the import work directory. Files are named `${worker}_${chunk}` inside
//! the partition directory and are fully sorted by timestamp (offset
//! breaking ties) before the chunk task finishes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use byteorder::{NativeEndian, WriteBytesExt};
use rayon::prelude::*;

use crate::import::lexer::{CsvLexer, Fields, RecordMeta, RecordSink};
use crate::import::timestamp::TimestampParser;
use crate::storage::PartitionBy;
use crate::Result;

/// Bytes per index record: i64 timestamp + u64 file offset.
pub const INDEX_ENTRY_SIZE: usize = 16;
/// Entry count above which flush sorting goes parallel.
const PAR_SORT_THRESHOLD: usize = 100_000;

/// Shared input for every indexing task of one import.
#[derive(Debug)]
pub struct IndexingContext {
    pub input_path: PathBuf,
    pub work_dir: PathBuf,
    pub partition_by: PartitionBy,
    pub delimiter: u8,
    /// Field position of the timestamp column in the input file.
    pub timestamp_index: usize,
    pub timestamp_parser: TimestampParser,
    /// Expected field count; rows with more fields are dropped.
    pub column_count: usize,
    pub buffer_size: usize,
    pub flush_threshold: usize,
}

#[derive(Debug, Default)]
pub struct IndexerResult {
    /// `(partition key, index bytes written)` pairs, ascending by key.
    pub partitions: Vec<(i64, u64)>,
    /// Longest record seen, bytes including the newline.
    pub max_line_length: u64,
    /// Rows dropped for an unparseable or missing timestamp, plus rows
    /// dropped for carrying extra fields.
    pub skipped_rows: u64,
}

struct PartitionBuffer {
    entries: Vec<(i64, u64)>,
    file: Option<BufWriter<File>>,
    bytes: u64,
}

struct IndexSink<'a> {
    ctx: &'a IndexingContext,
    worker_id: usize,
    chunk_index: u32,
    buffers: AHashMap<i64, PartitionBuffer>,
    max_line_length: u64,
    skipped_rows: u64,
}

impl<'a> IndexSink<'a> {
    fn chunk_file_path(&self, key: i64) -> PathBuf {
        let dir_name = self.ctx.partition_by.format_dir_name(key);
        self.ctx
            .work_dir
            .join(dir_name)
            .join(format!("{}_{}", self.worker_id, self.chunk_index))
    }

    fn flush_partition(buffer: &mut PartitionBuffer, path: &Path) -> Result<()> {
        if buffer.entries.is_empty() {
            return Ok(());
        }
        if buffer.file.is_none() {
            fs::create_dir_all(path.parent().expect("chunk file has a partition dir"))?;
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            buffer.file = Some(BufWriter::new(file));
        }
        let writer = buffer.file.as_mut().expect("opened above");
        for &(ts, offset) in &buffer.entries {
            writer.write_i64::<NativeEndian>(ts)?;
            writer.write_u64::<NativeEndian>(offset)?;
        }
        buffer.bytes += (buffer.entries.len() * INDEX_ENTRY_SIZE) as u64;
        buffer.entries.clear();
        Ok(())
    }

    /// Flush everything and leave each chunk file sorted on disk.
    fn finish(mut self) -> Result<IndexerResult> {
        let mut partitions = Vec::with_capacity(self.buffers.len());
        for (key, mut buffer) in self.buffers.drain() {
            let path = {
                let dir_name = self.ctx.partition_by.format_dir_name(key);
                self.ctx
                    .work_dir
                    .join(dir_name)
                    .join(format!("{}_{}", self.worker_id, self.chunk_index))
            };
            if buffer.file.is_some() {
                // spilled: append the tail, then sort the file in place
                Self::flush_partition(&mut buffer, &path)?;
                let writer = buffer.file.take().expect("spilled file open");
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                sort_index_file(&path)?;
            } else {
                sort_entries(&mut buffer.entries);
                Self::flush_partition(&mut buffer, &path)?;
                let writer = buffer.file.take().expect("flush opened the file");
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            }
            partitions.push((key, buffer.bytes));
        }
        partitions.sort_unstable_by_key(|&(key, _)| key);
        Ok(IndexerResult {
            partitions,
            max_line_length: self.max_line_length,
            skipped_rows: self.skipped_rows,
        })
    }
}

impl<'a> RecordSink for IndexSink<'a> {
    fn on_record(&mut self, meta: RecordMeta, fields: &Fields<'_>) -> Result<()> {
        self.max_line_length = self.max_line_length.max(meta.byte_len as u64);

        let ts_field = if self.ctx.timestamp_index < fields.len() {
            fields.get(self.ctx.timestamp_index)
        } else {
            &[][..]
        };
        // an empty or unparseable timestamp cannot be partitioned; the row
        // is dropped here and SKIP_ALL fails the import at the next phase
        let ts = match self.ctx.timestamp_parser.parse(ts_field) {
            Some(ts) => ts,
            None => {
                self.skipped_rows += 1;
                return Ok(());
            }
        };

        let key = self.ctx.partition_by.floor(ts);
        let buffer = self.buffers.entry(key).or_insert_with(|| PartitionBuffer {
            entries: Vec::new(),
            file: None,
            bytes: 0,
        });
        buffer.entries.push((ts, meta.offset));
        if buffer.entries.len() >= self.ctx.flush_threshold {
            let path = self.chunk_file_path(key);
            let buffer = self.buffers.get_mut(&key).expect("inserted above");
            Self::flush_partition(buffer, &path)?;
        }
        Ok(())
    }
}

fn sort_entries(entries: &mut [(i64, u64)]) {
    if entries.len() > PAR_SORT_THRESHOLD {
        entries.par_sort_unstable();
    } else {
        entries.sort_unstable();
    }
}

/// Re-sort a spilled chunk file in place.
fn sort_index_file(path: &Path) -> Result<()> {
    let bytes = fs::read(path)?;
    let mut entries: Vec<(i64, u64)> = bytes
        .chunks_exact(INDEX_ENTRY_SIZE)
        .map(|c| {
            (
                i64::from_ne_bytes(c[0..8].try_into().unwrap()),
                u64::from_ne_bytes(c[8..16].try_into().unwrap()),
            )
        })
        .collect();
    sort_entries(&mut entries);
    let mut writer = BufWriter::new(File::create(path)?);
    for (ts, offset) in entries {
        writer.write_i64::<NativeEndian>(ts)?;
        writer.write_u64::<NativeEndian>(offset)?;
    }
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

/// Index one chunk `[lo, hi)` of the input file.
pub fn build_partition_index(
    ctx: &IndexingContext,
    worker_id: usize,
    chunk_index: u32,
    lo: u64,
    hi: u64,
    line_number: u64,
    skip_header: bool,
    file_length: u64,
) -> Result<IndexerResult> {
    let mut file = File::open(&ctx.input_path)?;
    file.seek(SeekFrom::Start(lo))?;

    let mut lexer = CsvLexer::new(ctx.delimiter);
    lexer.set_expected_field_count(Some(ctx.column_count));
    lexer.restart(lo, line_number, skip_header);

    let mut sink = IndexSink {
        ctx,
        worker_id,
        chunk_index,
        buffers: AHashMap::new(),
        max_line_length: 0,
        skipped_rows: 0,
    };

    let mut buf = vec![0u8; ctx.buffer_size.max(1)];
    let mut offset = lo;
    while offset < hi {
        let want = ((hi - offset) as usize).min(buf.len());
        let read = file.read(&mut buf[..want])?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("input truncated at offset {offset}"),
            )
            .into());
        }
        lexer.parse(&buf[..read], &mut sink)?;
        offset += read as u64;
    }
    if hi == file_length {
        lexer.parse_last(&mut sink)?;
    }

    let overflow = lexer.overflow_count();
    let mut result = sink.finish()?;
    result.skipped_rows += overflow;
    Ok(result)
}
