//! Symbol dictionary reconciliation
//!
//! Shadow tables assign dictionary keys independently, so the same string
//! can carry a different key in every shadow. Phase one folds each shadow
//! dictionary into the target dictionary (the shared writer is the
//! serialization point) and records the local→target key mapping in a
//! dense remap file next to the shadow columns. Phase two memory-maps
//! each shadow partition's key column and rewrites the 32-bit keys in
//! place through the remap table.
//!
//! Shadows are folded in worker-id order and local keys ascend within a
//! shadow, so target key assignment is deterministic for a given input.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{NativeEndian, WriteBytesExt};
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::import::loader::shadow_table_name;
use crate::storage::symbol::{remap_file_path, SymbolMapReader, SymbolMapWriter};
use crate::storage::table::{data_file_path, table_dir};
use crate::{Result, StrataError};

/// Shared input for the dictionary-merge tasks of one import.
pub struct SymbolMergeContext {
    pub shadow_root: PathBuf,
    pub table_name: String,
    pub shadow_count: u32,
}

/// Fold every shadow dictionary for `column` into the target dictionary,
/// writing one remap file per shadow.
pub fn merge_symbol_tables(
    ctx: &SymbolMergeContext,
    column: &str,
    target: &Mutex<SymbolMapWriter>,
) -> Result<()> {
    for shadow_id in 0..ctx.shadow_count {
        let shadow_dir = table_dir(&ctx.shadow_root, &shadow_table_name(&ctx.table_name, shadow_id));
        let reader = SymbolMapReader::open(&shadow_dir, column)?;

        let remap_path = remap_file_path(&shadow_dir, column);
        let mut remap = BufWriter::new(File::create(&remap_path)?);
        {
            let mut target = target.lock();
            for value in reader.values() {
                remap.write_u32::<NativeEndian>(target.put(value))?;
            }
        }
        remap.flush()?;
    }
    Ok(())
}

/// Rewrite the keys of one `(shadow, partition, column)` in place.
///
/// Every non-null key must fall inside the remap table; anything else is
/// corruption and fails the import.
pub fn update_symbol_keys(
    shadow_dir: &Path,
    partition_dir_name: &str,
    column: &str,
    row_count: u64,
) -> Result<()> {
    if row_count == 0 {
        return Ok(());
    }
    let column_path = data_file_path(&shadow_dir.join(partition_dir_name), column);
    let remap = read_remap(&remap_file_path(shadow_dir, column))?;

    let file = OpenOptions::new().read(true).write(true).open(&column_path)?;
    let len = file.metadata()?.len();
    if len < 4 {
        return Ok(());
    }
    let mut map = unsafe { MmapMut::map_mut(&file)? };

    let count = (row_count as usize).min(map.len() / 4);
    for i in 0..count {
        let base = i * 4;
        let key = i32::from_ne_bytes(map[base..base + 4].try_into().unwrap());
        if key < 0 {
            continue; // null
        }
        let key = key as usize;
        if key >= remap.len() {
            return Err(StrataError::Corruption(format!(
                "symbol key {key} out of range (dictionary size {}) in '{}'",
                remap.len(),
                column_path.display()
            )));
        }
        map[base..base + 4].copy_from_slice(&(remap[key] as i32).to_ne_bytes());
    }
    map.flush()?;
    Ok(())
}

fn read_remap(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}
