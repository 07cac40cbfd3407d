//! Boundary scanner
//!
//! Counts quotes over a byte range and records, for both quote parities,
//! how many newlines were seen and where the first one sits. "Parity" is
//! the running quote count modulo two at the byte following the newline.
//! A later left-to-right fold over all chunks knows the global quote
//! count before each chunk and picks the candidate that is really a
//! record boundary.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::Result;

/// Per-chunk scan result. Offsets point just past the newline (the start
/// of the following record); -1 when the chunk holds no such newline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub quote_count: u64,
    pub nl_count_even: u64,
    pub nl_count_odd: u64,
    pub nl_first_even: i64,
    pub nl_first_odd: i64,
}

impl ChunkStats {
    pub fn empty() -> Self {
        Self {
            nl_first_even: -1,
            nl_first_odd: -1,
            ..Default::default()
        }
    }
}

/// Scan `[lo, hi)` of `path` with a buffer of at most `buffer_size` bytes.
pub fn scan_chunk(path: &Path, lo: u64, hi: u64, buffer_size: usize) -> Result<ChunkStats> {
    debug_assert!(hi > lo);
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(lo))?;

    let mut quotes: u64 = 0;
    let mut nl_count = [0u64; 2];
    let mut nl_first = [-1i64; 2];

    let mut buf = vec![0u8; buffer_size.max(1)];
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
        for (i, &b) in buf[..read].iter().enumerate() {
            if b == b'"' {
                quotes += 1;
            } else if b == b'\n' {
                let parity = (quotes & 1) as usize;
                nl_count[parity] += 1;
                if nl_first[parity] == -1 {
                    nl_first[parity] = (offset + i as u64 + 1) as i64;
                }
            }
        }
        offset += read as u64;
    }

    Ok(ChunkStats {
        quote_count: quotes,
        nl_count_even: nl_count[0],
        nl_count_odd: nl_count[1],
        nl_first_even: nl_first[0],
        nl_first_odd: nl_first[1],
    })
}
