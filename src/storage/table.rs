//! Tables and the table writer
//!
//! A table is a directory: `_meta`, `_txn`, one `$col.sym` dictionary per
//! SYMBOL column and one directory per partition holding `$col.d` data
//! files (plus `$col.i` offsets for var-length columns). The writer
//! appends rows partition by partition; rows arrive ascending within a
//! partition, so the writer keeps a single active partition and seals it
//! when the partition key moves on.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{NativeEndian, WriteBytesExt};
use parking_lot::Mutex;

use crate::storage::index::build_symbol_index;
use crate::storage::meta::{ColumnType, TableMeta, META_FILE_NAME};
use crate::storage::symbol::SymbolMapWriter;
use crate::storage::txn::TxMeta;
use crate::{Result, StrataError};

pub const DATA_FILE_SUFFIX: &str = ".d";
pub const OFFSET_FILE_SUFFIX: &str = ".i";

/// Null sentinel for LONG and TIMESTAMP cells.
pub const NULL_LONG: i64 = i64::MIN;
/// Null sentinel for SYMBOL keys.
pub const NULL_SYMBOL_KEY: i32 = -1;

/// Table names become directory names; keep them filesystem-safe.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 127
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

pub fn table_dir(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

pub fn table_exists(root: &Path, name: &str) -> bool {
    table_dir(root, name).join(META_FILE_NAME).is_file()
}

/// Create a new, empty table directory.
pub fn create_table(root: &Path, meta: &TableMeta) -> Result<()> {
    if !is_valid_table_name(&meta.table_name) {
        return Err(StrataError::Config(format!(
            "invalid table name '{}'",
            meta.table_name
        )));
    }
    let dir = table_dir(root, &meta.table_name);
    if dir.join(META_FILE_NAME).exists() {
        return Err(StrataError::TableExists(meta.table_name.clone()));
    }
    fs::create_dir_all(&dir)?;
    meta.store(&dir)?;
    TxMeta::new(meta.symbol_columns().len()).store(&dir)?;
    Ok(())
}

pub fn drop_table(root: &Path, name: &str) -> Result<()> {
    let dir = table_dir(root, name);
    if !dir.exists() {
        return Err(StrataError::TableNotFound(name.to_string()));
    }
    fs::remove_dir_all(&dir)?;
    Ok(())
}

pub fn data_file_path(partition_dir: &Path, column: &str) -> PathBuf {
    partition_dir.join(format!("{column}{DATA_FILE_SUFFIX}"))
}

fn offset_file_path(partition_dir: &Path, column: &str) -> PathBuf {
    partition_dir.join(format!("{column}{OFFSET_FILE_SUFFIX}"))
}

#[derive(Debug, Clone, Copy)]
enum CellSlot {
    Unset,
    Bool(bool),
    I64(i64),
    F64(f64),
    Sym(i32),
    Str { start: u32, len: u32 },
}

struct ColumnAppender {
    ctype: ColumnType,
    data: BufWriter<File>,
    offsets: Option<BufWriter<File>>,
    /// Logical length of the data file, tracked for var-length offsets.
    data_len: u64,
}

impl ColumnAppender {
    fn open(partition_dir: &Path, column: &str, ctype: ColumnType) -> Result<Self> {
        let data_path = data_file_path(partition_dir, column);
        let data_file = OpenOptions::new().create(true).append(true).open(&data_path)?;
        let data_len = data_file.metadata()?.len();
        let offsets = if ctype.is_var_len() {
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(offset_file_path(partition_dir, column))?;
            Some(BufWriter::new(f))
        } else {
            None
        };
        Ok(Self {
            ctype,
            data: BufWriter::new(data_file),
            offsets,
            data_len,
        })
    }

    fn write_cell(&mut self, slot: CellSlot, str_buf: &[u8]) -> Result<()> {
        match self.ctype {
            ColumnType::Boolean => {
                let v = matches!(slot, CellSlot::Bool(true));
                self.data.write_u8(v as u8)?;
                self.data_len += 1;
            }
            ColumnType::Long | ColumnType::Timestamp => {
                let v = match slot {
                    CellSlot::I64(v) => v,
                    _ => NULL_LONG,
                };
                self.data.write_i64::<NativeEndian>(v)?;
                self.data_len += 8;
            }
            ColumnType::Double => {
                let v = match slot {
                    CellSlot::F64(v) => v,
                    _ => f64::NAN,
                };
                self.data.write_f64::<NativeEndian>(v)?;
                self.data_len += 8;
            }
            ColumnType::Symbol => {
                let v = match slot {
                    CellSlot::Sym(k) => k,
                    _ => NULL_SYMBOL_KEY,
                };
                self.data.write_i32::<NativeEndian>(v)?;
                self.data_len += 4;
            }
            ColumnType::String => {
                let bytes = match slot {
                    CellSlot::Str { start, len } => &str_buf[start as usize..(start + len) as usize],
                    _ => &[][..],
                };
                let offsets = self.offsets.as_mut().expect("var-length column has offsets");
                offsets.write_u64::<NativeEndian>(self.data_len)?;
                self.data.write_u32::<NativeEndian>(bytes.len() as u32)?;
                self.data.write_all(bytes)?;
                self.data_len += 4 + bytes.len() as u64;
            }
        }
        Ok(())
    }

    fn finish(mut self, sync: bool) -> Result<()> {
        self.data.flush()?;
        if sync {
            self.data.get_ref().sync_all()?;
        }
        if let Some(mut offsets) = self.offsets.take() {
            offsets.flush()?;
            if sync {
                offsets.get_ref().sync_all()?;
            }
        }
        Ok(())
    }
}

struct ActivePartition {
    key: i64,
    appenders: Vec<ColumnAppender>,
    rows: u64,
}

/// Append-only writer over one table.
pub struct TableWriter {
    dir: PathBuf,
    meta: TableMeta,
    txn: TxMeta,
    /// One dictionary per SYMBOL column; shared so dictionary merge tasks
    /// can serialize on the same map the writer commits.
    symbols: Vec<Arc<Mutex<SymbolMapWriter>>>,
    active: Option<ActivePartition>,
    cells: Vec<CellSlot>,
    str_buf: Vec<u8>,
}

impl TableWriter {
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        let dir = table_dir(root, name);
        if !dir.join(META_FILE_NAME).is_file() {
            return Err(StrataError::TableNotFound(name.to_string()));
        }
        let meta = TableMeta::load(&dir)?;
        let txn = TxMeta::load(&dir)?;
        let mut symbols = Vec::new();
        for &col in &meta.symbol_columns() {
            symbols.push(Arc::new(Mutex::new(SymbolMapWriter::open(
                &dir,
                &meta.columns[col].name,
            )?)));
        }
        let cells = vec![CellSlot::Unset; meta.column_count()];
        Ok(Self {
            dir,
            meta,
            txn,
            symbols,
            active: None,
            cells,
            str_buf: Vec::new(),
        })
    }

    pub fn metadata(&self) -> &TableMeta {
        &self.meta
    }

    pub fn partition_by(&self) -> crate::storage::PartitionBy {
        self.meta.partition_by
    }

    pub fn table_dir(&self) -> &Path {
        &self.dir
    }

    /// Committed plus uncommitted rows.
    pub fn row_count(&self) -> u64 {
        self.txn.row_count + self.active.as_ref().map(|a| a.rows).unwrap_or(0)
    }

    pub fn txn(&self) -> &TxMeta {
        &self.txn
    }

    /// Shared dictionary handle for a SYMBOL column.
    pub fn symbol_map(&self, column_index: usize) -> Result<Arc<Mutex<SymbolMapWriter>>> {
        let ordinal = self.meta.symbol_ordinal(column_index).ok_or_else(|| {
            StrataError::ColumnNotFound(format!("symbol column #{column_index}"))
        })?;
        Ok(Arc::clone(&self.symbols[ordinal]))
    }

    /// Start a row at `ts`. Any unfinished previous row is discarded.
    pub fn new_row(&mut self, ts: i64) -> Result<Row<'_>> {
        let key = self.meta.partition_by.floor(ts);
        match &self.active {
            Some(active) if active.key == key => {}
            _ => self.switch_partition(key)?,
        }
        for cell in &mut self.cells {
            *cell = CellSlot::Unset;
        }
        self.str_buf.clear();
        self.cells[self.meta.timestamp_index] = CellSlot::I64(ts);
        Ok(Row { writer: self })
    }

    fn switch_partition(&mut self, key: i64) -> Result<()> {
        self.seal_active(false)?;
        let dir_name = self.meta.partition_by.format_dir_name(key);
        let partition_dir = self.dir.join(dir_name);
        fs::create_dir_all(&partition_dir)?;
        let mut appenders = Vec::with_capacity(self.meta.column_count());
        for col in &self.meta.columns {
            appenders.push(ColumnAppender::open(&partition_dir, &col.name, col.ctype)?);
        }
        self.active = Some(ActivePartition {
            key,
            appenders,
            rows: 0,
        });
        Ok(())
    }

    fn seal_active(&mut self, sync: bool) -> Result<()> {
        if let Some(active) = self.active.take() {
            for appender in active.appenders {
                appender.finish(sync)?;
            }
            if active.rows > 0 {
                self.txn.add_partition_rows(active.key, active.rows);
            }
        }
        Ok(())
    }

    /// Seal the active partition, flush dictionaries and persist `_txn`.
    pub fn commit(&mut self, sync: bool) -> Result<()> {
        self.seal_active(sync)?;
        for (ordinal, symbol) in self.symbols.iter().enumerate() {
            let mut map = symbol.lock();
            map.flush()?;
            self.txn.symbol_counts[ordinal] = map.len() as u32;
        }
        self.txn.store(&self.dir)?;
        Ok(())
    }

    /// Remove all partitions and dictionary entries; the table stays
    /// defined. Sweeps every partition directory, including ones moved in
    /// but never attached.
    pub fn truncate(&mut self) -> Result<()> {
        self.active = None;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            }
        }
        self.txn.reset();
        for symbol in &self.symbols {
            symbol.lock().truncate()?;
        }
        self.txn.store(&self.dir)?;
        Ok(())
    }

    /// Graft an already materialized partition directory onto the table.
    ///
    /// The directory must exist under the table dir with the canonical name
    /// for `key`; its row count is derived from the designated timestamp
    /// column file.
    pub fn attach_partition(&mut self, key: i64) -> Result<()> {
        let dir_name = self.meta.partition_by.format_dir_name(key);
        let partition_dir = self.dir.join(&dir_name);
        if !partition_dir.is_dir() {
            return Err(StrataError::Corruption(format!(
                "missing partition directory '{}'",
                partition_dir.display()
            )));
        }
        let ts_column = &self.meta.columns[self.meta.timestamp_index].name;
        let ts_len = fs::metadata(data_file_path(&partition_dir, ts_column))?.len();
        self.txn.add_partition_rows(key, ts_len / 8);
        Ok(())
    }

    /// Build the secondary index for an indexed SYMBOL column, over every
    /// partition currently in the transaction.
    pub fn add_index(&mut self, column: &str) -> Result<()> {
        let col = self
            .meta
            .column_index(column)
            .ok_or_else(|| StrataError::ColumnNotFound(column.to_string()))?;
        if self.meta.columns[col].ctype != ColumnType::Symbol {
            return Err(StrataError::SchemaMismatch(format!(
                "column '{column}' is not a symbol column"
            )));
        }
        let column = self.meta.columns[col].name.clone();
        for p in &self.txn.partitions {
            let dir = self.dir.join(self.meta.partition_by.format_dir_name(p.key));
            build_symbol_index(&dir, &column, p.row_count)?;
        }
        Ok(())
    }
}

/// One in-flight row; cells not set before `append` become nulls.
pub struct Row<'a> {
    writer: &'a mut TableWriter,
}

impl<'a> Row<'a> {
    fn set(&mut self, column: usize, slot: CellSlot) -> Result<()> {
        if column >= self.writer.cells.len() {
            return Err(StrataError::ColumnNotFound(format!("column #{column}")));
        }
        self.writer.cells[column] = slot;
        Ok(())
    }

    pub fn put_bool(&mut self, column: usize, value: bool) -> Result<()> {
        self.set(column, CellSlot::Bool(value))
    }

    pub fn put_long(&mut self, column: usize, value: i64) -> Result<()> {
        self.set(column, CellSlot::I64(value))
    }

    pub fn put_timestamp(&mut self, column: usize, micros: i64) -> Result<()> {
        self.set(column, CellSlot::I64(micros))
    }

    pub fn put_double(&mut self, column: usize, value: f64) -> Result<()> {
        self.set(column, CellSlot::F64(value))
    }

    pub fn put_str(&mut self, column: usize, value: &[u8]) -> Result<()> {
        let start = self.writer.str_buf.len() as u32;
        self.writer.str_buf.extend_from_slice(value);
        self.set(
            column,
            CellSlot::Str {
                start,
                len: value.len() as u32,
            },
        )
    }

    /// Resolve `value` through the column's dictionary and store its key.
    pub fn put_sym(&mut self, column: usize, value: &str) -> Result<()> {
        let ordinal = self.writer.meta.symbol_ordinal(column).ok_or_else(|| {
            StrataError::ColumnNotFound(format!("symbol column #{column}"))
        })?;
        let key = self.writer.symbols[ordinal].lock().put(value) as i32;
        self.set(column, CellSlot::Sym(key))
    }

    /// Write the row out.
    pub fn append(self) -> Result<()> {
        let writer = self.writer;
        let active = writer.active.as_mut().expect("new_row opened a partition");
        for (i, appender) in active.appenders.iter_mut().enumerate() {
            appender.write_cell(writer.cells[i], &writer.str_buf)?;
        }
        active.rows += 1;
        Ok(())
    }

    /// Discard the row.
    pub fn cancel(self) {}
}
