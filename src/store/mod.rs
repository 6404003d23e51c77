//! Disk-backed overflow store.
//!
//! An ordered, durable key/value log that buffers messages the live pipeline
//! cannot currently accept. Records are replayed oldest-first across all
//! topics and removed as soon as they are handed back to the producer.
//!
//! # Design
//!
//! - SQLite table with a `BLOB` primary key, so key order is byte order
//! - The sequence counter lives in the store and is recovered on open
//! - The connection lock is only held per statement, never across `visit`

mod record;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

pub use record::{decode_key, decode_payload, encode_key, CorruptRecord, OverflowRecord};

use record::{encode_payload, sequence_of, SEQUENCE_LEN};

/// File name of the database inside the store directory
pub const DATABASE_FILE: &str = "overflow.db";

/// Records fetched per statement during a scan
const SCAN_BATCH_SIZE: i64 = 256;

/// Errors that can occur during overflow store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage could not be opened
    #[error("failed to open overflow store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The store directory could not be created
    #[error("failed to prepare overflow store directory: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be written
    #[error("failed to persist record: {0}")]
    Persist(#[source] rusqlite::Error),

    /// Reading or deleting records failed
    #[error("overflow store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// The store has been closed
    #[error("overflow store is closed")]
    Closed,

    /// No overflow store is configured
    #[error("overflow store not configured")]
    Disabled,
}

/// Outcome of one `scan_oldest_first` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Records handed to the visitor and removed
    pub visited: usize,
    /// Records discarded because they could not be decoded
    pub corrupted: usize,
    /// Records whose removal failed (they will be seen again)
    pub delete_failures: usize,
}

/// Ordered durable buffer, safe under concurrent writers and one reader.
pub struct OverflowStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    sequence: AtomicU64,
    scan_lock: Mutex<()>,
}

impl OverflowStore {
    /// Open (or create) the store in the directory `path`.
    ///
    /// Recovers the sequence counter from the highest existing key, or from
    /// the saved high-water mark when that is larger.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let open_err = |source: rusqlite::Error| StoreError::Open {
            path: path.clone(),
            source,
        };

        let conn = Connection::open(path.join(DATABASE_FILE)).map_err(open_err)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS overflow (
                key BLOB PRIMARY KEY,
                value TEXT NOT NULL
            ) WITHOUT ROWID;
            CREATE TABLE IF NOT EXISTS meta (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
        ",
        )
        .map_err(open_err)?;

        // The high-water mark covers the case where every record was drained
        let saved: Option<i64> = conn
            .query_row(
                "SELECT value FROM meta WHERE name = 'sequence'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(open_err)?;

        let last_key: Option<Vec<u8>> = conn
            .query_row(
                "SELECT key FROM overflow WHERE length(key) >= 8 ORDER BY key DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(open_err)?;
        let sequence = last_key
            .as_deref()
            .and_then(sequence_of)
            .unwrap_or(0)
            .max(saved.and_then(|v| u64::try_from(v).ok()).unwrap_or(0));

        tracing::info!(
            path = %path.display(),
            sequence = sequence,
            "Overflow store opened"
        );

        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
            sequence: AtomicU64::new(sequence),
            scan_lock: Mutex::new(()),
        })
    }

    /// Directory the store lives in
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest sequence handed out so far
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Persist a message. Returns the sequence assigned to it.
    ///
    /// Failures are returned to the caller and never retried here.
    pub fn put(&self, topic: &str, payload: &[u8]) -> Result<u64, StoreError> {
        let value = encode_payload(payload);
        self.with_conn(|conn| {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let key = encode_key(sequence, topic);
            conn.execute(
                "INSERT INTO overflow (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(StoreError::Persist)?;
            Ok(sequence)
        })
    }

    /// Visit every record in ascending key order, removing each one after
    /// `visit` returns.
    ///
    /// Only records that existed when the scan started are visited, so a
    /// visitor that writes back into the store cannot loop forever. Corrupted
    /// records are logged and removed without reaching the visitor.
    pub fn scan_oldest_first<F>(&self, mut visit: F) -> Result<ScanSummary, StoreError>
    where
        F: FnMut(&str, Vec<u8>),
    {
        let _scan = self.scan_lock.lock().unwrap_or_else(|e| e.into_inner());
        let upper = self.sequence().saturating_add(1).to_be_bytes().to_vec();
        let min_key_len = SEQUENCE_LEN as i64;
        // Records about to be deleted must keep their sequences reserved
        self.with_conn(|conn| self.save_sequence(conn))?;
        let mut after: Vec<u8> = Vec::new();
        let mut summary = ScanSummary::default();

        loop {
            let batch = self.with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT CAST(key AS BLOB), CAST(value AS BLOB) FROM overflow
                     WHERE key > ?1 AND (key < ?2 OR length(key) < ?4)
                     ORDER BY key LIMIT ?3",
                )?;
                // Keys shorter than a sequence can sort above the bound but
                // must still be swept as corrupt
                let rows = stmt
                    .query_map(params![after, upper, SCAN_BATCH_SIZE, min_key_len], |row| {
                        Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })?;

            let Some((last_key, _)) = batch.last() else {
                break;
            };
            after = last_key.clone();

            for (key, value) in batch {
                match OverflowRecord::decode(&key, &value) {
                    Ok(record) => {
                        visit(&record.topic, record.payload);
                        summary.visited += 1;
                    }
                    Err(e) => {
                        summary.corrupted += 1;
                        tracing::error!(
                            error = %e,
                            value = %String::from_utf8_lossy(&value),
                            "Discarding undecodable overflow record"
                        );
                    }
                }

                if let Err(e) = self.delete(&key) {
                    summary.delete_failures += 1;
                    tracing::error!(error = %e, "Failed to delete overflow record");
                }
            }
        }

        if summary.visited > 0 || summary.corrupted > 0 {
            tracing::debug!(
                visited = summary.visited,
                corrupted = summary.corrupted,
                delete_failures = summary.delete_failures,
                "Overflow scan completed"
            );
        }

        Ok(summary)
    }

    /// Read up to `limit` records oldest-first without removing them.
    ///
    /// Undecodable records are skipped.
    pub fn peek(&self, limit: usize) -> Result<Vec<OverflowRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT CAST(key AS BLOB), CAST(value AS BLOB) FROM overflow ORDER BY key LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows
                .iter()
                .filter_map(|(key, value)| OverflowRecord::decode(key, value).ok())
                .collect())
        })
    }

    /// Number of records currently stored
    pub fn len(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM overflow", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Release the storage handle.
    ///
    /// Waits for an in-flight scan to finish first. Later calls fail with
    /// `StoreError::Closed`.
    pub fn close(&self) {
        let _scan = self.scan_lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(conn) = self.lock().take() else {
            return;
        };

        if let Err(e) = self.save_sequence(&conn) {
            tracing::error!(error = %e, "Failed to save overflow sequence");
        }

        match conn.close() {
            Ok(()) => tracing::info!(path = %self.path.display(), "Overflow store closed"),
            Err((_, e)) => tracing::error!(error = %e, "Failed to close overflow store cleanly"),
        }
    }

    fn save_sequence(&self, conn: &Connection) -> Result<(), StoreError> {
        let sequence = i64::try_from(self.sequence()).unwrap_or(i64::MAX);
        conn.execute(
            "INSERT INTO meta (name, value) VALUES ('sequence', ?1)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![sequence],
        )?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM overflow WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panic mid-statement leaves the connection usable; SQLite rolls back.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for OverflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverflowStore")
            .field("path", &self.path)
            .field("sequence", &self.sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_temp() -> (tempfile::TempDir, OverflowStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = OverflowStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn insert_raw(store: &OverflowStore, key: &[u8], value: &str) {
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO overflow (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_open_empty_store() {
        let (_dir, store) = open_temp();
        assert_eq!(store.sequence(), 0);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_put_assigns_increasing_sequences() {
        let (_dir, store) = open_temp();

        assert_eq!(store.put("a", b"one").unwrap(), 1);
        assert_eq!(store.put("b", b"two").unwrap(), 2);
        assert_eq!(store.put("a", b"three").unwrap(), 3);
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_sequence_recovered_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = OverflowStore::open(dir.path()).unwrap();
            for _ in 0..5 {
                store.put("topic", b"payload").unwrap();
            }
            store.close();
        }

        let store = OverflowStore::open(dir.path()).unwrap();
        assert_eq!(store.sequence(), 5);
        assert_eq!(store.put("topic", b"next").unwrap(), 6);
    }

    #[test]
    fn test_sequence_survives_drained_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = OverflowStore::open(dir.path()).unwrap();
            store.put("topic", b"1").unwrap();
            store.put("topic", b"2").unwrap();
            store.scan_oldest_first(|_, _| {}).unwrap();
            store.put("topic", b"3").unwrap();
            store.close();
        }

        let store = OverflowStore::open(dir.path()).unwrap();
        assert!(store.put("topic", b"4").unwrap() > 3);
    }

    #[test]
    fn test_sequence_survives_empty_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = OverflowStore::open(dir.path()).unwrap();
            store.put("topic", b"1").unwrap();
            store.put("topic", b"2").unwrap();
            let summary = store.scan_oldest_first(|_, _| {}).unwrap();
            assert_eq!(summary.visited, 2);
            assert!(store.is_empty().unwrap());
        }

        // Dropped without close: the mark written by the scan still applies
        let store = OverflowStore::open(dir.path()).unwrap();
        assert_eq!(store.sequence(), 2);
        assert_eq!(store.put("topic", b"3").unwrap(), 3);
    }

    #[test]
    fn test_scan_is_global_fifo() {
        let (_dir, store) = open_temp();
        store.put("b", b"1").unwrap();
        store.put("a", b"2").unwrap();
        store.put("b", b"3").unwrap();

        let mut seen = Vec::new();
        let summary = store
            .scan_oldest_first(|topic, payload| seen.push((topic.to_string(), payload)))
            .unwrap();

        assert_eq!(summary.visited, 3);
        assert_eq!(
            seen,
            vec![
                ("b".to_string(), b"1".to_vec()),
                ("a".to_string(), b"2".to_vec()),
                ("b".to_string(), b"3".to_vec()),
            ]
        );
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_scan_skips_corrupted_records() {
        let (_dir, store) = open_temp();
        store.put("t", b"first").unwrap();
        insert_raw(&store, &encode_key(store.sequence(), "t~"), "%%% not base64 %%%");
        store.put("t", b"second").unwrap();
        insert_raw(&store, &[0x00], "AAAA");

        let mut seen = Vec::new();
        let summary = store
            .scan_oldest_first(|_, payload| seen.push(payload))
            .unwrap();

        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(summary.visited, 2);
        assert_eq!(summary.corrupted, 2);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_short_key_above_bound_is_discarded() {
        let (_dir, store) = open_temp();
        store.put("t", b"only").unwrap();
        // Sorts after every key the store has issued so far
        insert_raw(&store, &[0x01], "AAAA");

        let mut seen = Vec::new();
        let summary = store
            .scan_oldest_first(|_, payload| seen.push(payload))
            .unwrap();

        assert_eq!(seen, vec![b"only".to_vec()]);
        assert_eq!(summary.visited, 1);
        assert_eq!(summary.corrupted, 1);
        assert!(store.is_empty().unwrap());

        let again = store.scan_oldest_first(|_, _| {}).unwrap();
        assert_eq!(again.visited + again.corrupted, 0);
    }

    #[test]
    fn test_scan_does_not_revisit_records_written_during_scan() {
        let (_dir, store) = open_temp();
        for i in 0..3u8 {
            store.put("t", &[i]).unwrap();
        }

        let mut visits = 0;
        let summary = store
            .scan_oldest_first(|topic, payload| {
                visits += 1;
                store.put(topic, &payload).unwrap();
            })
            .unwrap();

        assert_eq!(visits, 3);
        assert_eq!(summary.visited, 3);
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(store.peek(1).unwrap()[0].sequence, 4);
    }

    #[test]
    fn test_scan_spans_multiple_batches() {
        let (_dir, store) = open_temp();
        let total = SCAN_BATCH_SIZE as usize * 2 + 7;
        for i in 0..total {
            store.put("bulk", i.to_string().as_bytes()).unwrap();
        }

        let mut last = None;
        let summary = store
            .scan_oldest_first(|_, payload| {
                let n: usize = String::from_utf8(payload).unwrap().parse().unwrap();
                if let Some(prev) = last {
                    assert!(n > prev);
                }
                last = Some(n);
            })
            .unwrap();

        assert_eq!(summary.visited, total);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let (_dir, store) = open_temp();
        store.put("x", b"payload").unwrap();

        let records = store.peek(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "x");
        assert_eq!(records[0].payload, b"payload");
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let (_dir, store) = open_temp();
        store.close();

        assert!(matches!(store.put("t", b"p"), Err(StoreError::Closed)));
        assert!(matches!(
            store.scan_oldest_first(|_, _| {}),
            Err(StoreError::Closed)
        ));
        store.close();
    }

    #[test]
    fn test_open_fails_on_unusable_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        assert!(OverflowStore::open(&file).is_err());
    }

    #[test]
    fn test_concurrent_writers_get_unique_sequences() {
        let (_dir, store) = open_temp();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| store.put("t", b"p").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();

        assert_eq!(all.len(), 100);
        assert_eq!(store.len().unwrap(), 100);
        assert_eq!(store.sequence(), 100);
    }

    /// Runs a scan on its own thread whose visitor parks until released.
    fn spawn_parked_scan(
        store: &Arc<OverflowStore>,
    ) -> (
        std::sync::mpsc::Receiver<()>,
        std::sync::mpsc::Sender<()>,
        std::thread::JoinHandle<Result<ScanSummary, StoreError>>,
    ) {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let store = store.clone();
        let handle = std::thread::spawn(move || {
            store.scan_oldest_first(|_, _| {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        });
        (entered_rx, release_tx, handle)
    }

    #[test]
    fn test_close_waits_for_in_flight_scan() {
        use std::sync::atomic::AtomicBool;

        let (_dir, store) = open_temp();
        let store = Arc::new(store);
        store.put("t", b"held").unwrap();

        let (entered, release, scanner) = spawn_parked_scan(&store);
        entered.recv().unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let closer = {
            let store = store.clone();
            let closed = closed.clone();
            std::thread::spawn(move || {
                store.close();
                closed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!closed.load(Ordering::SeqCst), "close finished during a scan");

        release.send(()).unwrap();
        let summary = scanner.join().unwrap().unwrap();
        closer.join().unwrap();

        assert_eq!(summary.visited, 1);
        assert_eq!(summary.delete_failures, 0);
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(store.put("t", b"late"), Err(StoreError::Closed)));
    }

    #[test]
    fn test_scans_do_not_overlap() {
        use std::sync::atomic::AtomicBool;

        let (_dir, store) = open_temp();
        let store = Arc::new(store);
        store.put("t", b"first").unwrap();

        let (entered, release, scanner) = spawn_parked_scan(&store);
        entered.recv().unwrap();
        // Written after the first scan took its bound
        store.put("t", b"second").unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let follower = {
            let store = store.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                let summary = store.scan_oldest_first(|_, payload| seen.push(payload));
                finished.store(true, Ordering::SeqCst);
                summary.map(|_| seen)
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!finished.load(Ordering::SeqCst), "second scan ran concurrently");

        release.send(()).unwrap();
        assert_eq!(scanner.join().unwrap().unwrap().visited, 1);
        assert_eq!(follower.join().unwrap().unwrap(), vec![b"second".to_vec()]);
        assert!(store.is_empty().unwrap());
    }
}
