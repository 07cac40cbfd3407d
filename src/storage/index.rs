//! Secondary indexes over SYMBOL columns
//!
//! `$col.k` maps each dictionary key present in a partition to the row ids
//! holding it, as sorted blocks: `[i32 key][u32 count][u64 row_id...]`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::storage::table::data_file_path;
use crate::{Result, StrataError};

pub const INDEX_FILE_SUFFIX: &str = ".k";

/// Build (or rebuild) the index file for one partition.
pub fn build_symbol_index(partition_dir: &Path, column: &str, row_count: u64) -> Result<()> {
    let data_path = data_file_path(partition_dir, column);
    let mut reader = BufReader::new(File::open(&data_path)?);

    let mut rows_by_key: BTreeMap<i32, Vec<u64>> = BTreeMap::new();
    for row_id in 0..row_count {
        let key = reader.read_i32::<NativeEndian>().map_err(|_| {
            StrataError::Corruption(format!(
                "symbol column file too short: {}",
                data_path.display()
            ))
        })?;
        if key >= 0 {
            rows_by_key.entry(key).or_default().push(row_id);
        }
    }

    let index_path = partition_dir.join(format!("{column}{INDEX_FILE_SUFFIX}"));
    let mut writer = BufWriter::new(File::create(index_path)?);
    for (key, rows) in rows_by_key {
        writer.write_i32::<NativeEndian>(key)?;
        writer.write_u32::<NativeEndian>(rows.len() as u32)?;
        for row in rows {
            writer.write_u64::<NativeEndian>(row)?;
        }
    }
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

/// Read an index file back as key → row ids (used by tests and readers).
pub fn read_symbol_index(partition_dir: &Path, column: &str) -> Result<BTreeMap<i32, Vec<u64>>> {
    let path = partition_dir.join(format!("{column}{INDEX_FILE_SUFFIX}"));
    let mut reader = BufReader::new(File::open(path)?);
    let mut map = BTreeMap::new();
    loop {
        let key = match reader.read_i32::<NativeEndian>() {
            Ok(k) => k,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let count = reader.read_u32::<NativeEndian>()?;
        let mut rows = Vec::with_capacity(count as usize);
        for _ in 0..count {
            rows.push(reader.read_u64::<NativeEndian>()?);
        }
        map.insert(key, rows);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_build_and_read_index() {
        let dir = tempdir().unwrap();
        let mut data = File::create(data_file_path(dir.path(), "sym")).unwrap();
        for key in [1i32, 0, 1, -1, 0] {
            data.write_all(&key.to_ne_bytes()).unwrap();
        }
        drop(data);

        build_symbol_index(dir.path(), "sym", 5).unwrap();
        let index = read_symbol_index(dir.path(), "sym").unwrap();
        assert_eq!(index.len(), 2); // null key not indexed
        assert_eq!(index[&0], vec![1, 4]);
        assert_eq!(index[&1], vec![0, 2]);
    }

    #[test]
    fn test_short_column_file_is_corruption() {
        let dir = tempdir().unwrap();
        File::create(data_file_path(dir.path(), "sym")).unwrap();
        assert!(matches!(
            build_symbol_index(dir.path(), "sym", 3),
            Err(StrataError::Corruption(_))
        ));
    }
}
