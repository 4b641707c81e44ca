//! Concurrent writers, readers and pruners sharing one cache directory

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::Duration;
use sqlcache::{
    CacheEntry, CacheKey, CacheManager, CacheStore, Column, ColumnData, DbIdentity, EntryMeta,
    FnExecutor, FreshnessPolicy, Table, Value, codec,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::TempDir;

const WRITERS: usize = 4;
const ROUNDS: usize = 25;

fn key() -> CacheKey {
    CacheKey::from_hex("5a".repeat(32)).unwrap()
}

/// A table whose every cell identifies the writer, so torn mixes are visible
fn writer_table(writer: usize, rows: usize) -> Table {
    Table::new(vec![
        Column::new(
            "writer",
            ColumnData::Int64(vec![Some(writer as i64); rows]),
        ),
        Column::new(
            "fill",
            ColumnData::Text(vec![Some(format!("w{writer}-").repeat(16)); rows]),
        ),
    ])
    .unwrap()
}

fn writer_entry(writer: usize) -> CacheEntry {
    // Writers use very different sizes to widen any window for torn reads
    let table = writer_table(writer, 50 + writer * 400);
    let meta = EntryMeta::new(key(), format!("select {writer}"), &table);
    CacheEntry::new(meta, codec::encode(&table).unwrap())
}

fn assert_consistent(entry: &CacheEntry) {
    let table = codec::decode(&entry.payload).unwrap();
    assert_eq!(table.row_count() as u64, entry.meta.row_count);
    let Some(Value::Int64(writer)) = table.row(0).map(|r| r[0].clone()) else {
        panic!("empty table");
    };
    assert_eq!(table, writer_table(writer as usize, table.row_count()));
    assert_eq!(entry.meta.query_text, format!("select {writer}"));
}

#[test]
fn concurrent_puts_never_tear() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let store = CacheStore::new(&root);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut observed = 0usize;
                while !done.load(Ordering::SeqCst) {
                    match store.get(&key()) {
                        Ok(entry) => {
                            assert_consistent(&entry);
                            observed += 1;
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => panic!("reader saw a damaged entry: {e}"),
                    }
                }
                observed
            })
        })
        .collect();

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let store = CacheStore::new(&root);
            thread::spawn(move || {
                let entry = writer_entry(writer);
                for _ in 0..ROUNDS {
                    store.put(&key(), &entry).unwrap();
                }
            })
        })
        .collect();

    for handle in writers {
        handle.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    for handle in readers {
        handle.join().unwrap();
    }

    // Last completed commit wins; whichever it was, it is whole
    let store = CacheStore::new(&root);
    assert_consistent(&store.get(&key()).unwrap());
    assert_eq!(store.list().unwrap().len(), 1);

    // No staging files are left behind
    let leftovers = std::fs::read_dir(&root)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn pruning_during_reads_is_safe() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let store = CacheStore::new(&root);
    store.put(&key(), &writer_entry(1)).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = store.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                match store.get(&key()) {
                    Ok(entry) => assert_consistent(&entry),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => panic!("reader saw a damaged entry: {e}"),
                }
            }
        })
    };

    for round in 0..ROUNDS {
        store.put(&key(), &writer_entry(round % WRITERS)).unwrap();
        store.enforce_limits(Some(0), None).unwrap();
    }
    done.store(true, Ordering::SeqCst);
    reader.join().unwrap();
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn managers_in_parallel_share_results() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let root = root.clone();
            thread::spawn(move || {
                let manager = CacheManager::new(
                    CacheStore::open(&root).unwrap(),
                    FnExecutor(|_sql: &str, _params: &[Value]| -> Result<Table, Infallible> {
                        Ok(writer_table(9, 10))
                    }),
                    DbIdentity::new("sqlite:///tmp/shared.db"),
                );
                let policy = FreshnessPolicy::fresh_within(Duration::hours(1));
                for _ in 0..ROUNDS {
                    let outcome = manager.query("SELECT * FROM t", &[], &policy).unwrap();
                    assert_eq!(outcome.table, writer_table(9, 10));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(CacheStore::new(&root).list().unwrap().len(), 1);
}
