//! The serialized operation queue fronting the database.
//!
//! Many concurrent callers are multiplexed onto a single writer thread
//! that owns the connection exclusively. The worker drains up to
//! [`MAX_BATCH`] queued operations at a time, groups them by kind, merges
//! the payloads within a group (overlapping key sets become one query
//! whose result is fanned back to every waiter), and executes the groups
//! in a fixed order: reads, then writes, then invalidations, then vacuum.
//! Flush barriers complete last.
//!
//! A failed group completes its own waiters with the wrapped backend
//! error and the worker moves on; nothing poisons the queue or the
//! connection.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use stashbox_core::{CacheElement, CacheError, CacheResult, Clock, ShutdownSignal, time};

use crate::schema;

/// Maximum number of operations drained into one batch.
pub(crate) const MAX_BATCH: usize = 64;

/// Maximum keys per `IN (...)` list, kept well under SQLite's host
/// parameter limit.
const MAX_SQL_VARS: usize = 500;

type Done<T> = oneshot::Sender<CacheResult<T>>;

pub(crate) enum Operation {
    Insert {
        elements: Vec<CacheElement>,
        done: Done<()>,
    },
    Select {
        keys: Vec<String>,
        done: Done<Vec<CacheElement>>,
    },
    SelectByType {
        type_names: Vec<String>,
        done: Done<Vec<CacheElement>>,
    },
    Invalidate {
        keys: Vec<String>,
        done: Done<()>,
    },
    InvalidateByType {
        type_names: Vec<String>,
        done: Done<()>,
    },
    InvalidateAll {
        done: Done<()>,
    },
    GetAllKeys {
        done: Done<Vec<String>>,
    },
    Vacuum {
        done: Done<()>,
    },
    Flush {
        done: Done<()>,
    },
}

/// Where the worker opens its database.
pub(crate) enum StoreTarget {
    Path(PathBuf),
    InMemory,
}

/// Counters describing the work the writer thread has executed.
///
/// Exposed so callers (and tests) can observe batching and coalescing:
/// N concurrent reads of the same key merged into one pass bump
/// `select_statements` once.
#[derive(Debug, Default)]
pub struct QueueStats {
    batches: AtomicU64,
    select_statements: AtomicU64,
    type_select_statements: AtomicU64,
    key_listings: AtomicU64,
    insert_transactions: AtomicU64,
    invalidate_transactions: AtomicU64,
    vacuums: AtomicU64,
    flushes: AtomicU64,
}

impl QueueStats {
    /// Batches the worker has drained.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Key-lookup SELECT statements executed.
    pub fn select_statements(&self) -> u64 {
        self.select_statements.load(Ordering::Relaxed)
    }

    /// Type-filtered SELECT statements executed.
    pub fn type_select_statements(&self) -> u64 {
        self.type_select_statements.load(Ordering::Relaxed)
    }

    /// Key-listing statements executed.
    pub fn key_listings(&self) -> u64 {
        self.key_listings.load(Ordering::Relaxed)
    }

    /// Upsert transactions committed.
    pub fn insert_transactions(&self) -> u64 {
        self.insert_transactions.load(Ordering::Relaxed)
    }

    /// Invalidation transactions committed (including lazy evictions).
    pub fn invalidate_transactions(&self) -> u64 {
        self.invalidate_transactions.load(Ordering::Relaxed)
    }

    /// Vacuum passes executed.
    pub fn vacuums(&self) -> u64 {
        self.vacuums.load(Ordering::Relaxed)
    }

    /// Flush barriers honoured.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

pub(crate) struct OperationQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Operation>>>,
    stats: Arc<QueueStats>,
    shutdown: ShutdownSignal,
}

impl OperationQueue {
    /// Spawns the writer thread and returns the queue handle plus the
    /// one-shot initialization signal the cache awaits before issuing SQL.
    pub(crate) fn start(
        target: StoreTarget,
        clock: Clock,
    ) -> CacheResult<(Self, oneshot::Receiver<CacheResult<()>>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();
        let stats = Arc::new(QueueStats::default());
        let shutdown = ShutdownSignal::new();

        let worker_stats = Arc::clone(&stats);
        let worker_shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("stashbox-sqlite-writer".into())
            .spawn(move || run_worker(target, clock, rx, init_tx, worker_stats, worker_shutdown))
            .map_err(CacheError::backend)?;

        Ok((
            OperationQueue {
                sender: Mutex::new(Some(tx)),
                stats,
                shutdown,
            },
            init_rx,
        ))
    }

    pub(crate) fn enqueue(&self, operation: Operation) -> CacheResult<()> {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => tx.send(operation).map_err(|_| CacheError::Disposed),
            None => Err(CacheError::Disposed),
        }
    }

    /// Stops accepting operations. The worker drains what is already
    /// queued, releases the connection and fires the shutdown signal.
    pub(crate) fn close(&self) {
        let mut guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }

    pub(crate) fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

fn run_worker(
    target: StoreTarget,
    clock: Clock,
    mut rx: mpsc::UnboundedReceiver<Operation>,
    init_tx: oneshot::Sender<CacheResult<()>>,
    stats: Arc<QueueStats>,
    shutdown: ShutdownSignal,
) {
    let mut conn = match open_connection(&target).and_then(|mut conn| {
        schema::initialize(&mut conn, clock)?;
        Ok(conn)
    }) {
        Ok(conn) => {
            let _ = init_tx.send(Ok(()));
            conn
        }
        Err(err) => {
            warn!(error = %err, "cache initialization failed");
            let _ = init_tx.send(Err(err));
            shutdown.fire();
            return;
        }
    };

    while let Some(first) = rx.blocking_recv() {
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(operation) => batch.push(operation),
                Err(_) => break,
            }
        }
        stats.batches.fetch_add(1, Ordering::Relaxed);
        execute_batch(&mut conn, batch, clock, &stats);
    }

    drop(conn);
    debug!("cache writer released the database");
    shutdown.fire();
}

fn open_connection(target: &StoreTarget) -> CacheResult<Connection> {
    match target {
        StoreTarget::Path(path) => Connection::open(path).map_err(CacheError::backend),
        StoreTarget::InMemory => Connection::open_in_memory().map_err(CacheError::backend),
    }
}

/// One drained batch, grouped by operation kind.
#[derive(Default)]
struct Batch {
    inserts: Vec<(Vec<CacheElement>, Done<()>)>,
    selects: Vec<(Vec<String>, Done<Vec<CacheElement>>)>,
    type_selects: Vec<(Vec<String>, Done<Vec<CacheElement>>)>,
    key_listings: Vec<Done<Vec<String>>>,
    invalidates: Vec<(Vec<String>, Done<()>)>,
    type_invalidates: Vec<(Vec<String>, Done<()>)>,
    invalidate_alls: Vec<Done<()>>,
    vacuums: Vec<Done<()>>,
    flushes: Vec<Done<()>>,
}

impl Batch {
    fn group(operations: Vec<Operation>) -> Self {
        let mut batch = Batch::default();
        for operation in operations {
            match operation {
                Operation::Insert { elements, done } => batch.inserts.push((elements, done)),
                Operation::Select { keys, done } => batch.selects.push((keys, done)),
                Operation::SelectByType { type_names, done } => {
                    batch.type_selects.push((type_names, done))
                }
                Operation::Invalidate { keys, done } => batch.invalidates.push((keys, done)),
                Operation::InvalidateByType { type_names, done } => {
                    batch.type_invalidates.push((type_names, done))
                }
                Operation::InvalidateAll { done } => batch.invalidate_alls.push(done),
                Operation::GetAllKeys { done } => batch.key_listings.push(done),
                Operation::Vacuum { done } => batch.vacuums.push(done),
                Operation::Flush { done } => batch.flushes.push(done),
            }
        }
        batch
    }
}

/// Executes one batch. Reads first so they observe the snapshot at batch
/// execution time, then writes, then invalidations (which also evict the
/// expired rows the reads observed), then vacuum. Flush barriers complete
/// after everything else in the batch.
pub(crate) fn execute_batch(
    conn: &mut Connection,
    operations: Vec<Operation>,
    clock: Clock,
    stats: &QueueStats,
) {
    let batch = Batch::group(operations);
    let now_ticks = time::to_ticks(clock());
    // Keys observed expired by a read in this pass; evicted below.
    let mut expired: Vec<String> = Vec::new();

    if !batch.selects.is_empty() {
        run_selects(conn, batch.selects, now_ticks, &mut expired, stats);
    }
    if !batch.type_selects.is_empty() {
        run_type_selects(conn, batch.type_selects, now_ticks, &mut expired, stats);
    }
    if !batch.key_listings.is_empty() {
        run_key_listings(conn, batch.key_listings, now_ticks, stats);
    }
    if !batch.inserts.is_empty() {
        run_inserts(conn, batch.inserts, stats);
    }
    if !batch.invalidates.is_empty()
        || !batch.type_invalidates.is_empty()
        || !batch.invalidate_alls.is_empty()
        || !expired.is_empty()
    {
        run_invalidations(
            conn,
            batch.invalidates,
            batch.type_invalidates,
            batch.invalidate_alls,
            expired,
            now_ticks,
            stats,
        );
    }
    if !batch.vacuums.is_empty() {
        run_vacuums(conn, batch.vacuums, now_ticks, stats);
    }
    if !batch.flushes.is_empty() {
        run_flushes(conn, batch.flushes, stats);
    }
}

fn placeholders(count: usize) -> String {
    let mut sql = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            sql.push(',');
        }
        sql.push('?');
    }
    sql
}

fn element_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(CacheElement, i64)> {
    let key: String = row.get(0)?;
    let type_name: Option<String> = row.get(1)?;
    let value: Vec<u8> = row.get(2)?;
    let expiration_ticks: i64 = row.get(3)?;
    let created_ticks: i64 = row.get(4)?;
    let element = CacheElement {
        key,
        type_name,
        value: Bytes::from(value),
        created_at: time::from_ticks(created_ticks).unwrap_or(chrono::DateTime::UNIX_EPOCH),
        expiration: time::expiration_from_ticks(expiration_ticks),
    };
    Ok((element, expiration_ticks))
}

fn fail_all<T>(waiters: Vec<Done<T>>, err: rusqlite::Error, context: &'static str) {
    warn!(error = %err, context, "batch group failed");
    let shared = CacheError::backend(err);
    for done in waiters {
        let _ = done.send(Err(shared.clone()));
    }
}

fn run_selects(
    conn: &Connection,
    selects: Vec<(Vec<String>, Done<Vec<CacheElement>>)>,
    now_ticks: i64,
    expired: &mut Vec<String>,
    stats: &QueueStats,
) {
    let wanted: BTreeSet<&String> = selects.iter().flat_map(|(keys, _)| keys.iter()).collect();
    let wanted: Vec<&String> = wanted.into_iter().collect();

    let mut live: HashMap<String, CacheElement> = HashMap::new();
    let result: rusqlite::Result<()> = wanted.chunks(MAX_SQL_VARS).try_for_each(|chunk| {
        let sql = format!(
            "SELECT Key, TypeName, Value, Expiration, CreatedAt FROM CacheElement WHERE Key IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), element_from_row)?;
        stats.select_statements.fetch_add(1, Ordering::Relaxed);
        for row in rows {
            let (element, expiration_ticks) = row?;
            if expiration_ticks < now_ticks {
                expired.push(element.key);
            } else {
                live.insert(element.key.clone(), element);
            }
        }
        Ok(())
    });

    match result {
        Ok(()) => {
            for (keys, done) in selects {
                let found = keys
                    .iter()
                    .filter_map(|key| live.get(key).cloned())
                    .collect();
                let _ = done.send(Ok(found));
            }
        }
        Err(err) => {
            let waiters = selects.into_iter().map(|(_, done)| done).collect();
            fail_all(waiters, err, "select");
        }
    }
}

fn run_type_selects(
    conn: &Connection,
    type_selects: Vec<(Vec<String>, Done<Vec<CacheElement>>)>,
    now_ticks: i64,
    expired: &mut Vec<String>,
    stats: &QueueStats,
) {
    let wanted: BTreeSet<&String> = type_selects
        .iter()
        .flat_map(|(names, _)| names.iter())
        .collect();
    let wanted: Vec<&String> = wanted.into_iter().collect();

    let mut live: Vec<CacheElement> = Vec::new();
    let result: rusqlite::Result<()> = wanted.chunks(MAX_SQL_VARS).try_for_each(|chunk| {
        let sql = format!(
            "SELECT Key, TypeName, Value, Expiration, CreatedAt FROM CacheElement WHERE TypeName IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), element_from_row)?;
        stats.type_select_statements.fetch_add(1, Ordering::Relaxed);
        for row in rows {
            let (element, expiration_ticks) = row?;
            if expiration_ticks < now_ticks {
                expired.push(element.key);
            } else {
                live.push(element);
            }
        }
        Ok(())
    });

    match result {
        Ok(()) => {
            for (names, done) in type_selects {
                let found = live
                    .iter()
                    .filter(|element| {
                        element
                            .type_name
                            .as_deref()
                            .is_some_and(|name| names.iter().any(|wanted| wanted == name))
                    })
                    .cloned()
                    .collect();
                let _ = done.send(Ok(found));
            }
        }
        Err(err) => {
            let waiters = type_selects.into_iter().map(|(_, done)| done).collect();
            fail_all(waiters, err, "select by type");
        }
    }
}

fn run_key_listings(
    conn: &Connection,
    listings: Vec<Done<Vec<String>>>,
    now_ticks: i64,
    stats: &QueueStats,
) {
    let result: rusqlite::Result<Vec<String>> = (|| {
        let mut stmt = conn.prepare("SELECT Key FROM CacheElement WHERE Expiration >= ?1")?;
        let rows = stmt.query_map([now_ticks], |row| row.get(0))?;
        stats.key_listings.fetch_add(1, Ordering::Relaxed);
        rows.collect()
    })();

    match result {
        Ok(keys) => {
            for done in listings {
                let _ = done.send(Ok(keys.clone()));
            }
        }
        Err(err) => fail_all(listings, err, "key listing"),
    }
}

fn run_inserts(conn: &mut Connection, inserts: Vec<(Vec<CacheElement>, Done<()>)>, stats: &QueueStats) {
    let result: rusqlite::Result<()> = (|| {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO CacheElement (Key, TypeName, Value, Expiration, CreatedAt)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (elements, _) in &inserts {
                for element in elements {
                    stmt.execute(rusqlite::params![
                        element.key,
                        element.type_name,
                        element.value.as_ref(),
                        time::expiration_to_ticks(element.expiration),
                        time::to_ticks(element.created_at),
                    ])?;
                }
            }
        }
        tx.commit()?;
        stats.insert_transactions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })();

    match result {
        Ok(()) => {
            for (_, done) in inserts {
                let _ = done.send(Ok(()));
            }
        }
        Err(err) => {
            let waiters = inserts.into_iter().map(|(_, done)| done).collect();
            fail_all(waiters, err, "insert");
        }
    }
}

fn run_invalidations(
    conn: &mut Connection,
    invalidates: Vec<(Vec<String>, Done<()>)>,
    type_invalidates: Vec<(Vec<String>, Done<()>)>,
    invalidate_alls: Vec<Done<()>>,
    expired: Vec<String>,
    now_ticks: i64,
    stats: &QueueStats,
) {
    let keys: BTreeSet<&String> = invalidates
        .iter()
        .flat_map(|(keys, _)| keys.iter())
        .collect();
    let keys: Vec<&String> = keys.into_iter().collect();
    let names: BTreeSet<&String> = type_invalidates
        .iter()
        .flat_map(|(names, _)| names.iter())
        .collect();
    let names: Vec<&String> = names.into_iter().collect();
    let evictions: BTreeSet<&String> = expired.iter().collect();
    let evictions: Vec<&String> = evictions.into_iter().collect();

    let result: rusqlite::Result<()> = (|| {
        let tx = conn.transaction()?;
        if invalidate_alls.is_empty() {
            for chunk in keys.chunks(MAX_SQL_VARS) {
                let sql = format!(
                    "DELETE FROM CacheElement WHERE Key IN ({})",
                    placeholders(chunk.len())
                );
                tx.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
            }
            for chunk in names.chunks(MAX_SQL_VARS) {
                let sql = format!(
                    "DELETE FROM CacheElement WHERE TypeName IN ({})",
                    placeholders(chunk.len())
                );
                tx.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
            }
            // Lazy evictions re-check expiration against the stored row:
            // an upsert for the same key earlier in this pass must survive.
            for chunk in evictions.chunks(MAX_SQL_VARS) {
                let sql = format!(
                    "DELETE FROM CacheElement WHERE Expiration < ?1 AND Key IN ({})",
                    placeholders(chunk.len())
                );
                let params: Vec<&dyn rusqlite::ToSql> = std::iter::once(&now_ticks as &dyn rusqlite::ToSql)
                    .chain(chunk.iter().map(|key| *key as &dyn rusqlite::ToSql))
                    .collect();
                tx.execute(&sql, rusqlite::params_from_iter(params))?;
            }
        } else {
            tx.execute("DELETE FROM CacheElement", [])?;
        }
        tx.commit()?;
        stats.invalidate_transactions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })();

    let waiters: Vec<Done<()>> = invalidates
        .into_iter()
        .map(|(_, done)| done)
        .chain(type_invalidates.into_iter().map(|(_, done)| done))
        .chain(invalidate_alls)
        .collect();

    match result {
        Ok(()) => {
            for done in waiters {
                let _ = done.send(Ok(()));
            }
        }
        Err(err) => fail_all(waiters, err, "invalidate"),
    }
}

fn run_vacuums(conn: &Connection, vacuums: Vec<Done<()>>, now_ticks: i64, stats: &QueueStats) {
    let result: rusqlite::Result<()> = (|| {
        conn.execute("DELETE FROM CacheElement WHERE Expiration < ?1", [now_ticks])?;
        conn.execute_batch("VACUUM;")?;
        stats.vacuums.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })();

    match result {
        Ok(()) => {
            for done in vacuums {
                let _ = done.send(Ok(()));
            }
        }
        Err(err) => fail_all(vacuums, err, "vacuum"),
    }
}

fn run_flushes(conn: &Connection, flushes: Vec<Done<()>>, stats: &QueueStats) {
    // Force the WAL back into the main database file so a fresh instance
    // opening the same path observes every prior write.
    let result = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .map(|_| {
            stats.flushes.fetch_add(1, Ordering::Relaxed);
        });

    match result {
        Ok(()) => {
            for done in flushes {
                let _ = done.send(Ok(()));
            }
        }
        Err(err) => fail_all(flushes, err, "flush"),
    }
}
