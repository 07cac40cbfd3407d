//! Symbol dictionaries
//!
//! A SYMBOL column stores 32-bit dictionary keys in its `.d` file; the
//! dictionary itself lives at the table root as `$col.sym`, a
//! concatenation of `[u32 len][utf8 bytes]` entries. The key of a value
//! is its entry ordinal, so dictionaries append-only grow and keys are
//! stable once assigned.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::{Result, StrataError};

pub const SYMBOL_FILE_SUFFIX: &str = ".sym";
pub const REMAP_FILE_SUFFIX: &str = ".remap";

pub fn symbol_file_path(table_dir: &Path, column: &str) -> PathBuf {
    table_dir.join(format!("{column}{SYMBOL_FILE_SUFFIX}"))
}

pub fn remap_file_path(table_dir: &Path, column: &str) -> PathBuf {
    table_dir.join(format!("{column}{REMAP_FILE_SUFFIX}"))
}

fn read_dict(path: &Path) -> Result<Vec<String>> {
    let mut values = Vec::new();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(values),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    loop {
        let len = match reader.read_u32::<NativeEndian>() {
            Ok(n) => n as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        let value = String::from_utf8(buf)
            .map_err(|_| StrataError::Corruption(format!("non-utf8 symbol in {}", path.display())))?;
        values.push(value);
    }
    Ok(values)
}

/// Append-only dictionary writer; the serialization point for key assignment.
pub struct SymbolMapWriter {
    path: PathBuf,
    values: Vec<String>,
    keys: AHashMap<String, u32>,
    /// Entries already on disk; flush appends from here.
    persisted: usize,
}

impl SymbolMapWriter {
    pub fn open(table_dir: &Path, column: &str) -> Result<Self> {
        let path = symbol_file_path(table_dir, column);
        let values = read_dict(&path)?;
        let keys = values
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u32))
            .collect();
        let persisted = values.len();
        Ok(Self {
            path,
            values,
            keys,
            persisted,
        })
    }

    /// Look up or assign the key for `value`.
    pub fn put(&mut self, value: &str) -> u32 {
        if let Some(&key) = self.keys.get(value) {
            return key;
        }
        let key = self.values.len() as u32;
        self.values.push(value.to_string());
        self.keys.insert(value.to_string(), key);
        key
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_of(&self, key: u32) -> Option<&str> {
        self.values.get(key as usize).map(|s| s.as_str())
    }

    /// Append unpersisted entries to the dictionary file.
    pub fn flush(&mut self) -> Result<()> {
        if self.persisted == self.values.len() {
            return Ok(());
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for value in &self.values[self.persisted..] {
            writer.write_u32::<NativeEndian>(value.len() as u32)?;
            writer.write_all(value.as_bytes())?;
        }
        writer.flush()?;
        self.persisted = self.values.len();
        Ok(())
    }

    /// Drop all entries, in memory and on disk.
    pub fn truncate(&mut self) -> Result<()> {
        self.values.clear();
        self.keys.clear();
        self.persisted = 0;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read-only dictionary view, local keys ascending.
pub struct SymbolMapReader {
    values: Vec<String>,
}

impl SymbolMapReader {
    pub fn open(table_dir: &Path, column: &str) -> Result<Self> {
        Ok(Self {
            values: read_dict(&symbol_file_path(table_dir, column))?,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_of(&self, key: u32) -> Option<&str> {
        self.values.get(key as usize).map(|s| s.as_str())
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_assigns_dense_keys() {
        let dir = tempdir().unwrap();
        let mut w = SymbolMapWriter::open(dir.path(), "sym").unwrap();
        assert_eq!(w.put("a"), 0);
        assert_eq!(w.put("b"), 1);
        assert_eq!(w.put("a"), 0);
        assert_eq!(w.len(), 2);
        assert_eq!(w.value_of(1), Some("b"));
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut w = SymbolMapWriter::open(dir.path(), "sym").unwrap();
            w.put("x");
            w.put("y");
            w.flush().unwrap();
            // second flush is a no-op, not a duplicate append
            w.flush().unwrap();
        }
        let mut w = SymbolMapWriter::open(dir.path(), "sym").unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w.put("x"), 0);
        assert_eq!(w.put("z"), 2);

        let r = SymbolMapReader::open(dir.path(), "sym").unwrap();
        assert_eq!(r.values(), &["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_missing_dictionary_is_empty() {
        let dir = tempdir().unwrap();
        let r = SymbolMapReader::open(dir.path(), "absent").unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let mut w = SymbolMapWriter::open(dir.path(), "sym").unwrap();
        w.put("a");
        w.flush().unwrap();
        w.truncate().unwrap();
        assert!(w.is_empty());
        assert!(!symbol_file_path(dir.path(), "sym").exists());
        assert_eq!(w.put("b"), 0);
    }
}
