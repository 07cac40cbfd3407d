//! Committed table state
//!
//! `_txn` records what a reader may see: the attached partitions with
//! their row counts, the total row count and the per-symbol-column
//! dictionary sizes. It is rewritten atomically on commit.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::meta::{read_framed, write_framed, TXN_FILE_NAME, TXN_MAGIC};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionTxn {
    pub key: i64,
    pub row_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxMeta {
    pub row_count: u64,
    /// Attached partitions, ascending by key.
    pub partitions: Vec<PartitionTxn>,
    /// Dictionary sizes per SYMBOL column, in symbol-column ordinal order.
    pub symbol_counts: Vec<u32>,
}

impl TxMeta {
    pub fn new(symbol_column_count: usize) -> Self {
        Self {
            row_count: 0,
            partitions: Vec::new(),
            symbol_counts: vec![0; symbol_column_count],
        }
    }

    pub fn load(table_dir: &Path) -> Result<Self> {
        read_framed(&table_dir.join(TXN_FILE_NAME), TXN_MAGIC)
    }

    pub fn store(&self, table_dir: &Path) -> Result<()> {
        write_framed(&table_dir.join(TXN_FILE_NAME), TXN_MAGIC, self)
    }

    pub fn partition_row_count(&self, key: i64) -> u64 {
        self.partitions
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.row_count)
            .unwrap_or(0)
    }

    /// Add rows to a partition, inserting it in key order when new.
    pub fn add_partition_rows(&mut self, key: i64, rows: u64) {
        match self.partitions.iter_mut().find(|p| p.key == key) {
            Some(p) => p.row_count += rows,
            None => {
                let at = self.partitions.partition_point(|p| p.key < key);
                self.partitions.insert(at, PartitionTxn { key, row_count: rows });
            }
        }
        self.row_count += rows;
    }

    pub fn reset(&mut self) {
        self.row_count = 0;
        self.partitions.clear();
        for c in &mut self.symbol_counts {
            *c = 0;
        }
    }
}
