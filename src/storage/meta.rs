//! Table metadata and framed metadata files
//!
//! `_meta` and `_txn` share a small framed envelope:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Magic (8 bytes)              │
//! │ Version: u32                 │
//! │ Payload length: u32          │
//! │ Payload (bincode)            │
//! │ Checksum: u32 (crc32 of payload)
//! └──────────────────────────────┘
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::partition::PartitionBy;
use crate::{Result, StrataError};

pub(crate) const META_MAGIC: &[u8; 8] = b"STRMETA\0";
pub(crate) const TXN_MAGIC: &[u8; 8] = b"STRTXN\0\0";
const FORMAT_VERSION: u32 = 1;

pub const META_FILE_NAME: &str = "_meta";
pub const TXN_FILE_NAME: &str = "_txn";

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Long,
    Double,
    String,
    Symbol,
    Timestamp,
}

impl ColumnType {
    /// Fixed cell width in the `.d` file, in bytes (0 for var-length).
    pub fn fixed_size(&self) -> usize {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::Symbol => 4,
            ColumnType::Long | ColumnType::Double | ColumnType::Timestamp => 8,
            ColumnType::String => 0,
        }
    }

    pub fn is_var_len(&self) -> bool {
        matches!(self, ColumnType::String)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Long => "LONG",
            ColumnType::Double => "DOUBLE",
            ColumnType::String => "STRING",
            ColumnType::Symbol => "SYMBOL",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

/// Column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub ctype: ColumnType,
    pub indexed: bool,
}

impl ColumnMeta {
    pub fn new(name: &str, ctype: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ctype,
            indexed: false,
        }
    }

    pub fn indexed(name: &str, ctype: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ctype,
            indexed: true,
        }
    }
}

/// Table schema and partitioning definition, persisted as `_meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub table_name: String,
    pub columns: Vec<ColumnMeta>,
    /// Designated timestamp column; rows partition on this column.
    pub timestamp_index: usize,
    pub partition_by: PartitionBy,
}

impl TableMeta {
    pub fn new(
        table_name: &str,
        columns: Vec<ColumnMeta>,
        timestamp_index: usize,
        partition_by: PartitionBy,
    ) -> Self {
        Self {
            table_name: table_name.to_string(),
            columns,
            timestamp_index,
            partition_by,
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Indexes of all SYMBOL columns, in declaration order.
    pub fn symbol_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.ctype == ColumnType::Symbol)
            .map(|(i, _)| i)
            .collect()
    }

    /// Ordinal of `column_index` among SYMBOL columns, if it is one.
    pub fn symbol_ordinal(&self, column_index: usize) -> Option<usize> {
        if self.columns.get(column_index)?.ctype != ColumnType::Symbol {
            return None;
        }
        Some(
            self.columns[..column_index]
                .iter()
                .filter(|c| c.ctype == ColumnType::Symbol)
                .count(),
        )
    }

    pub fn load(table_dir: &Path) -> Result<Self> {
        read_framed(&table_dir.join(META_FILE_NAME), META_MAGIC)
    }

    pub fn store(&self, table_dir: &Path) -> Result<()> {
        write_framed(&table_dir.join(META_FILE_NAME), META_MAGIC, self)
    }
}

/// Write a framed, checksummed metadata file.
pub(crate) fn write_framed<T: Serialize>(path: &Path, magic: &[u8; 8], value: &T) -> Result<()> {
    let payload = bincode::serialize(value)
        .map_err(|e| StrataError::Corruption(format!("metadata encode failed: {e}")))?;
    let mut file = File::create(path)?;
    file.write_all(magic)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    file.write_all(&(payload.len() as u32).to_le_bytes())?;
    file.write_all(&payload)?;
    file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read and verify a framed metadata file.
pub(crate) fn read_framed<T: DeserializeOwned>(path: &Path, magic: &[u8; 8]) -> Result<T> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 16];
    file.read_exact(&mut head)?;
    if &head[0..8] != magic {
        return Err(StrataError::Corruption(format!(
            "bad magic in {}",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(head[8..12].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(StrataError::Corruption(format!(
            "unsupported metadata version {version} in {}",
            path.display()
        )));
    }
    let len = u32::from_le_bytes(head[12..16].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;
    let mut crc = [0u8; 4];
    file.read_exact(&mut crc)?;
    if crc32fast::hash(&payload) != u32::from_le_bytes(crc) {
        return Err(StrataError::Corruption(format!(
            "checksum mismatch in {}",
            path.display()
        )));
    }
    bincode::deserialize(&payload)
        .map_err(|e| StrataError::Corruption(format!("metadata decode failed: {e}")))
}
