//! End-to-end import tests

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::{tempdir, TempDir};

use super::*;
use crate::config::StorageConfig;
use crate::storage::symbol::SymbolMapReader;
use crate::storage::table::data_file_path;
use crate::storage::{
    create_table, read_symbol_index, table_dir, table_exists, ColumnMeta, ColumnType, PartitionBy,
    TableMeta, TableWriter, NULL_LONG,
};
use crate::StrataError;

const DAY: i64 = 86_400_000_000;

struct Fixture {
    _dir: TempDir,
    runtime: Runtime,
}

fn fixture(worker_count: usize) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let db_root = dir.path().join("db");
    let work_root = dir.path().join("work");
    fs::create_dir_all(&db_root).unwrap();
    let mut config = StorageConfig::new(&db_root, &work_root);
    config.copy_buffer_size = 64 * 1024;
    config.index_flush_threshold = 64;
    Fixture {
        _dir: dir,
        runtime: Runtime::new(config, worker_count),
    }
}

impl Fixture {
    fn db_root(&self) -> &Path {
        &self.runtime.config.db_root
    }

    fn work_root(&self) -> &Path {
        &self.runtime.config.work_root
    }

    fn write_input(&self, name: &str, content: &str) -> PathBuf {
        let path = self._dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn request(&self, table: &str, input: &Path) -> ImportRequest {
        ImportRequest {
            table: table.to_string(),
            input_file: input.to_path_buf(),
            partition_by: PartitionBy::Day,
            delimiter: None,
            timestamp_column: None,
            timestamp_format: None,
            force_header: false,
            atomicity: Atomicity::SkipCol,
        }
    }

    fn run(&self, request: ImportRequest) -> crate::Result<ImportStats> {
        self.run_with_token(request, CancellationToken::new(), DEFAULT_MIN_CHUNK_SIZE)
    }

    fn run_with_token(
        &self,
        request: ImportRequest,
        token: CancellationToken,
        min_chunk_size: u64,
    ) -> crate::Result<ImportStats> {
        let mut importer = CsvFileImporter::new(self.runtime.clone(), token);
        importer.set_min_chunk_size(min_chunk_size);
        importer.configure(request)?;
        importer.run()
    }

    fn partition_dir(&self, table: &str, name: &str) -> PathBuf {
        table_dir(self.db_root(), table).join(name)
    }
}

fn read_i64s(path: &Path) -> Vec<i64> {
    fs::read(path)
        .unwrap()
        .chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

fn read_i32s(path: &Path) -> Vec<i32> {
    fs::read(path)
        .unwrap()
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

/// Pre-create a target table with `(ts TIMESTAMP, sym SYMBOL indexed, val LONG)`.
fn create_symbol_target(fx: &Fixture, table: &str) {
    let meta = TableMeta::new(
        table,
        vec![
            ColumnMeta::new("ts", ColumnType::Timestamp),
            ColumnMeta::indexed("sym", ColumnType::Symbol),
            ColumnMeta::new("val", ColumnType::Long),
        ],
        0,
        PartitionBy::Day,
    );
    create_table(fx.db_root(), &meta).unwrap();
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_s1_empty_file_fails_boundary_check() {
    let fx = fixture(2);
    let input = fx.write_input("empty.csv", "");
    let err = fx.run(fx.request("t", &input)).unwrap_err();
    match err {
        StrataError::Import { phase, message } => {
            assert_eq!(phase, ImportPhase::BoundaryCheck);
            assert!(message.contains("empty"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!table_exists(fx.db_root(), "t"));
}

#[test]
fn test_s2_one_row_single_worker() {
    let fx = fixture(1);
    let input = fx.write_input("one.csv", "ts,val\n2022-01-01T00:00:00Z,42\n");
    let mut request = fx.request("trades", &input);
    request.timestamp_column = Some("ts".to_string());

    let stats = fx.run(request).unwrap();
    assert_eq!(stats.imported_rows, 1);
    assert_eq!(stats.skipped_rows, 0);

    let pdir = fx.partition_dir("trades", "2022-01-01");
    assert!(pdir.is_dir());
    assert_eq!(
        read_i64s(&data_file_path(&pdir, "ts")),
        vec![1_640_995_200_000_000]
    );
    assert_eq!(read_i64s(&data_file_path(&pdir, "val")), vec![42]);

    let writer = TableWriter::open(fx.db_root(), "trades").unwrap();
    assert_eq!(writer.row_count(), 1);
    // work dir and shadows are gone
    assert!(!fx.work_root().join("trades").exists());
    assert!(!table_dir(fx.work_root(), "trades_0").exists());
}

/// Builds a file with quoted embedded newlines sprinkled throughout, so
/// chunk boundaries land inside quoted regions, and compares the parallel
/// import byte-for-byte against a single-threaded one.
#[test]
fn test_s3_cross_chunk_quoted_newlines_match_single_threaded() {
    let rows = 30_000u64;
    let mut data = String::with_capacity(rows as usize * 70);
    for i in 0..rows {
        let ts = (i as i64 % 2) * DAY + (i as i64 / 2) * 1000;
        if i % 10 == 3 {
            data.push_str(&format!("{ts},\"multi\nline \"\"note\"\" {i}\",{i}\n"));
        } else {
            data.push_str(&format!("{ts},plain note {i},{i}\n"));
        }
    }

    let run = |workers: usize, min_chunk: u64| {
        let fx = fixture(workers);
        let input = fx.write_input("big.csv", &data);
        let mut request = fx.request("t", &input);
        request.timestamp_column = Some("f0".to_string());
        let stats = fx.run_with_token(request, CancellationToken::new(), min_chunk).unwrap();
        (fx, stats)
    };

    let (fx_single, stats_single) = run(1, DEFAULT_MIN_CHUNK_SIZE);
    let (fx_parallel, stats_parallel) = run(4, 128 * 1024);

    assert_eq!(stats_single.imported_rows, rows);
    assert_eq!(stats_parallel.imported_rows, rows);
    assert_eq!(stats_parallel.skipped_rows, 0);

    for name in ["1970-01-01", "1970-01-02"] {
        for col in ["f0", "f1", "f2"] {
            let single = fs::read(data_file_path(&fx_single.partition_dir("t", name), col)).unwrap();
            let parallel =
                fs::read(data_file_path(&fx_parallel.partition_dir("t", name), col)).unwrap();
            assert_eq!(single, parallel, "partition {name} column {col}");
        }
    }
}

#[test]
fn test_s4_symbol_reconciliation_is_deterministic() {
    let fx = fixture(3);
    create_symbol_target(&fx, "t");

    // three equal-weight partitions, one per worker; each shadow sees a
    // distinct string at local key 0
    let mut data = String::new();
    for day in 0..3i64 {
        let sym = ["a", "b", "c"][day as usize];
        let rows = if day == 2 { 20 } else { 21 };
        for i in 0..rows {
            data.push_str(&format!("{},{},{}\n", day * DAY + i * 1000, sym, i));
        }
    }
    // a shared trailing symbol in the last partition so remapping is
    // non-trivial; equal row counts keep the LPT assignment by key order
    data.push_str(&format!("{},a,99\n", 2 * DAY + 999_000_000));

    let input = fx.write_input("syms.csv", &data);
    let stats = fx.run(fx.request("t", &input)).unwrap();
    assert_eq!(stats.imported_rows, 63);

    // deterministic target keys: worker order then local key order
    let dict = SymbolMapReader::open(&table_dir(fx.db_root(), "t"), "sym").unwrap();
    assert_eq!(dict.values(), &["a".to_string(), "b".to_string(), "c".to_string()]);

    // every rewritten key resolves to its source string
    for (day, expect) in [(0, "a"), (1, "b"), (2, "c")] {
        let name = PartitionBy::Day.format_dir_name(day * DAY);
        let keys = read_i32s(&data_file_path(&fx.partition_dir("t", &name), "sym"));
        assert!(!keys.is_empty());
        let tail = if day == 2 { &keys[..keys.len() - 1] } else { &keys[..] };
        for &k in tail {
            assert_eq!(dict.value_of(k as u32), Some(expect), "partition {name}");
        }
    }
    // the shared trailing "a" in day 2 remapped onto target key 0
    let day2 = PartitionBy::Day.format_dir_name(2 * DAY);
    let keys = read_i32s(&data_file_path(&fx.partition_dir("t", &day2), "sym"));
    assert_eq!(*keys.last().unwrap(), 0);

    // the indexed column produced a secondary index per partition
    let index = read_symbol_index(&fx.partition_dir("t", &day2), "sym").unwrap();
    assert_eq!(index[&2].len(), 20);
    assert_eq!(index[&0], vec![20]);
}

#[test]
fn test_s5_cross_device_copy_fallback() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("ts.d"), b"12345678").unwrap();
    fs::write(src.join("sym.d"), b"abcd").unwrap();
    fs::create_dir_all(src.join("nested")).unwrap();

    copy_partition_dir(&src, &dst).unwrap();
    assert_eq!(fs::read(dst.join("ts.d")).unwrap(), b"12345678");
    assert_eq!(fs::read(dst.join("sym.d")).unwrap(), b"abcd");
    // only regular files are copied
    assert!(!dst.join("nested").exists());
}

#[test]
fn test_s6_skip_all_attaches_nothing() {
    let fx = fixture(2);
    create_symbol_target(&fx, "t");
    let input = fx.write_input(
        "bad.csv",
        "ts,sym,val\n100,a,1\nnot-a-timestamp,b,2\n200,c,3\n",
    );
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("ts".to_string());
    request.atomicity = Atomicity::SkipAll;

    let err = fx.run(request).unwrap_err();
    match err {
        StrataError::Import { phase, .. } => assert_eq!(phase, ImportPhase::PartitionImport),
        other => panic!("unexpected error {other:?}"),
    }

    // pre-existing target survives, empty, with no partitions attached
    assert!(table_exists(fx.db_root(), "t"));
    let writer = TableWriter::open(fx.db_root(), "t").unwrap();
    assert_eq!(writer.row_count(), 0);
    assert!(writer.txn().partitions.is_empty());
    assert!(!fx.partition_dir("t", "1970-01-01").exists());
    assert!(!fx.work_root().join("t").exists());
}

// ============================================================================
// Invariants
// ============================================================================

#[test]
fn test_row_preservation_with_skips() {
    let fx = fixture(2);
    // 8 data rows: one bad timestamp, one extra-values row, six good
    let input = fx.write_input(
        "mixed.csv",
        "ts,val\n\
         100,1\n\
         200,2\n\
         bogus,3\n\
         300,4\n\
         400,5,EXTRA\n\
         500,6\n\
         600,7\n\
         ,8\n",
    );
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("ts".to_string());

    let stats = fx.run(request).unwrap();
    assert_eq!(stats.imported_rows, 5);
    assert_eq!(stats.skipped_rows, 3);
    assert_eq!(stats.imported_rows + stats.skipped_rows, 8);
}

#[test]
fn test_per_partition_ordering_with_ties() {
    let fx = fixture(2);
    // unordered timestamps; two pairs tie and must keep file order
    let input = fx.write_input(
        "unordered.csv",
        "500,a\n100,b\n500,c\n100,d\n300,e\n",
    );
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("f0".to_string());

    let stats = fx.run(request).unwrap();
    assert_eq!(stats.imported_rows, 5);

    let pdir = fx.partition_dir("t", "1970-01-01");
    assert_eq!(read_i64s(&data_file_path(&pdir, "f0")), vec![100, 100, 300, 500, 500]);

    // f1 is a string column; check tie order via the offsets of the pairs
    let strings = read_strings(&pdir, "f1", 5);
    assert_eq!(strings, vec!["b", "d", "e", "a", "c"]);
}

fn read_strings(pdir: &Path, col: &str, count: usize) -> Vec<String> {
    let data = fs::read(data_file_path(pdir, col)).unwrap();
    let offsets = read_i64s(&pdir.join(format!("{col}.i")));
    assert_eq!(offsets.len(), count);
    offsets
        .iter()
        .map(|&off| {
            let off = off as usize;
            let len = u32::from_ne_bytes(data[off..off + 4].try_into().unwrap()) as usize;
            String::from_utf8(data[off + 4..off + 4 + len].to_vec()).unwrap()
        })
        .collect()
}

#[test]
fn test_idempotent_restart_is_byte_identical() {
    let run_once = || {
        let fx = fixture(3);
        create_symbol_target(&fx, "t");
        let mut data = String::new();
        for i in 0..500i64 {
            let sym = ["x", "y", "z"][(i % 3) as usize];
            data.push_str(&format!("{},{},{}\n", (i % 2) * DAY + i * 7, sym, i));
        }
        let input = fx.write_input("r.csv", &data);
        fx.run(fx.request("t", &input)).unwrap();
        let mut files = Vec::new();
        for name in ["1970-01-01", "1970-01-02"] {
            for col in ["ts", "sym", "val"] {
                files.push(fs::read(data_file_path(&fx.partition_dir("t", name), col)).unwrap());
            }
        }
        files
    };
    assert_eq!(run_once(), run_once());
}

#[test]
fn test_cancellation_leaves_no_detritus() {
    let fx = fixture(2);
    let input = fx.write_input("c.csv", "ts,val\n100,1\n200,2\n");
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("ts".to_string());

    let token = CancellationToken::new();
    token.cancel();
    let err = fx
        .run_with_token(request, token, DEFAULT_MIN_CHUNK_SIZE)
        .unwrap_err();
    assert!(matches!(err, StrataError::Cancelled { .. }));

    assert!(!fx.work_root().join("t").exists());
    assert!(!table_dir(fx.work_root(), "t_0").exists());
    // the freshly created target was rolled back
    assert!(!table_exists(fx.db_root(), "t"));
}

// ============================================================================
// Behaviors
// ============================================================================

/// Pre-create a target table with `(ts TIMESTAMP, val LONG)`.
fn create_long_target(fx: &Fixture, table: &str) {
    let meta = TableMeta::new(
        table,
        vec![
            ColumnMeta::new("ts", ColumnType::Timestamp),
            ColumnMeta::new("val", ColumnType::Long),
        ],
        0,
        PartitionBy::Day,
    );
    create_table(fx.db_root(), &meta).unwrap();
}

#[test]
fn test_skip_col_leaves_null() {
    let fx = fixture(1);
    create_long_target(&fx, "t");
    let input = fx.write_input("n.csv", "ts,val\n100,7\n200,oops\n300,9\n");
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("ts".to_string());

    let stats = fx.run(request).unwrap();
    assert_eq!(stats.imported_rows, 3);

    let pdir = fx.partition_dir("t", "1970-01-01");
    assert_eq!(read_i64s(&data_file_path(&pdir, "val")), vec![7, NULL_LONG, 9]);
}

#[test]
fn test_skip_row_drops_row() {
    let fx = fixture(1);
    create_long_target(&fx, "t");
    let input = fx.write_input("n.csv", "ts,val\n100,7\n200,oops\n300,9\n");
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("ts".to_string());
    request.atomicity = Atomicity::SkipRow;

    let stats = fx.run(request).unwrap();
    assert_eq!(stats.imported_rows, 2);
    assert_eq!(stats.skipped_rows, 1);

    let pdir = fx.partition_dir("t", "1970-01-01");
    assert_eq!(read_i64s(&data_file_path(&pdir, "ts")), vec![100, 300]);
}

#[test]
fn test_semicolon_delimiter_auto_detected() {
    let fx = fixture(2);
    let input = fx.write_input("semi.csv", "ts;val\n100;1\n200;2\n");
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("ts".to_string());

    let stats = fx.run(request).unwrap();
    assert_eq!(stats.imported_rows, 2);
}

#[test]
fn test_long_column_tolerates_timestamp_input() {
    let fx = fixture(1);
    let meta = TableMeta::new(
        "t",
        vec![
            ColumnMeta::new("ts", ColumnType::Timestamp),
            ColumnMeta::new("seen_at", ColumnType::Long),
        ],
        0,
        PartitionBy::Day,
    );
    create_table(fx.db_root(), &meta).unwrap();

    let input = fx.write_input("l.csv", "100,1970-01-01T00:00:01Z\n200,1970-01-01T00:00:02Z\n");
    let stats = fx.run(fx.request("t", &input)).unwrap();
    assert_eq!(stats.imported_rows, 2);

    let pdir = fx.partition_dir("t", "1970-01-01");
    assert_eq!(
        read_i64s(&data_file_path(&pdir, "seen_at")),
        vec![1_000_000, 2_000_000]
    );
}

#[test]
fn test_busy_when_lock_held() {
    let fx = fixture(1);
    fs::create_dir_all(fx.work_root()).unwrap();
    let lock = File::create(fx.work_root().join(".import.lock")).unwrap();
    lock.try_lock_exclusive().unwrap();

    let input = fx.write_input("b.csv", "100,1\n");
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("f0".to_string());
    assert!(matches!(fx.run(request), Err(StrataError::Busy)));
}

#[test]
fn test_protected_work_dir_is_rejected() {
    let mut fx = fixture(1);
    let guarded = fx.work_root().join("t");
    fx.runtime.config.protected_roots.push(guarded);

    let input = fx.write_input("p.csv", "100,1\n");
    let mut request = fx.request("t", &input);
    request.timestamp_column = Some("f0".to_string());
    assert!(matches!(fx.run(request), Err(StrataError::Config(_))));
    assert!(!fx.work_root().join("t").exists());
}

#[test]
fn test_non_empty_target_is_rejected() {
    let fx = fixture(1);
    create_symbol_target(&fx, "t");
    {
        let mut writer = TableWriter::open(fx.db_root(), "t").unwrap();
        writer.new_row(50).unwrap().append().unwrap();
        writer.commit(true).unwrap();
    }
    let input = fx.write_input("x.csv", "100,a,1\n");
    let err = fx.run(fx.request("t", &input)).unwrap_err();
    assert!(matches!(err, StrataError::Config(_)), "{err:?}");
}

#[test]
fn test_partition_by_mismatch_is_rejected() {
    let fx = fixture(1);
    create_symbol_target(&fx, "t"); // DAY partitioned
    let input = fx.write_input("x.csv", "100,a,1\n");
    let mut request = fx.request("t", &input);
    request.partition_by = PartitionBy::Hour;
    assert!(matches!(fx.run(request), Err(StrataError::Config(_))));
}

#[test]
fn test_column_count_mismatch_is_schema_error() {
    let fx = fixture(1);
    let meta = TableMeta::new(
        "t",
        vec![ColumnMeta::new("ts", ColumnType::Timestamp)],
        0,
        PartitionBy::Day,
    );
    create_table(fx.db_root(), &meta).unwrap();

    let input = fx.write_input("x.csv", "100,too,many,columns\n");
    assert!(matches!(
        fx.run(fx.request("t", &input)),
        Err(StrataError::SchemaMismatch(_))
    ));
}

#[test]
fn test_missing_timestamp_column_for_new_table() {
    let fx = fixture(1);
    let input = fx.write_input("x.csv", "a,b\n1,2\n");
    let err = fx.run(fx.request("t", &input)).unwrap_err();
    assert!(matches!(err, StrataError::Config(_)), "{err:?}");
}

#[test]
fn test_chunk_stats_fold() {
    use super::boundary::ChunkStats;

    // plain chunks: the even candidate wins
    let stats = vec![
        ChunkStats {
            quote_count: 0,
            nl_count_even: 3,
            nl_count_odd: 0,
            nl_first_even: 10,
            nl_first_odd: -1,
        },
        ChunkStats {
            quote_count: 0,
            nl_count_even: 2,
            nl_count_odd: 0,
            nl_first_even: 110,
            nl_first_odd: -1,
        },
    ];
    assert_eq!(process_chunk_stats(&stats, 200), vec![(0, 0), (110, 4), (200, 6)]);

    // odd quote carry-over: the second chunk's odd candidate wins
    let stats = vec![
        ChunkStats {
            quote_count: 1,
            nl_count_even: 1,
            nl_count_odd: 0,
            nl_first_even: 5,
            nl_first_odd: -1,
        },
        ChunkStats {
            quote_count: 1,
            nl_count_even: 4,
            nl_count_odd: 1,
            nl_first_even: 150,
            nl_first_odd: 120,
        },
    ];
    assert_eq!(process_chunk_stats(&stats, 200), vec![(0, 0), (120, 2), (200, 3)]);

    // a fully quoted chunk merges into its predecessor
    let stats = vec![
        ChunkStats {
            quote_count: 1,
            nl_count_even: 2,
            nl_count_odd: 0,
            nl_first_even: 8,
            nl_first_odd: -1,
        },
        ChunkStats {
            quote_count: 0,
            nl_count_even: 0,
            nl_count_odd: 0,
            nl_first_even: -1,
            nl_first_odd: -1,
        },
        ChunkStats {
            quote_count: 1,
            nl_count_even: 0,
            nl_count_odd: 2,
            nl_first_even: -1,
            nl_first_odd: 210,
        },
    ];
    assert_eq!(process_chunk_stats(&stats, 300), vec![(0, 0), (210, 3), (300, 5)]);
}
