//! Durable crawl state: the graph, the frontier and processing queues, the
//! iteration log, and job metadata, all in one SQLite file opened in WAL
//! mode.
//!
//! Every mutation goes through one `tokio_rusqlite` connection, which runs
//! all calls on a single background thread: that thread is the single
//! writer that serializes state changes. Each operation is one transaction,
//! so any abrupt termination lands on a committed boundary where the
//! partition invariants hold.

use std::path::{Path, PathBuf};

use rusqlite::OptionalExtension as _;
use serde::Serialize;

use crate::config::ThrottleConfig;
use crate::error::{CrawlError, Result};
use crate::model::{Edge, Gender, IterationRecord, Pid, RelationshipType, RunStatus, Vertex};

const SCHEMA_VERSION: i64 = 2;

const BIOLOGICAL_ISH: &str = "'UnspecifiedParentType','AssumedBiological','BiologicalParent'";
const REFLAGGABLE: &str = "'UnspecifiedParentType','AssumedBiological'";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS VERTEX (
    id TEXT NOT NULL PRIMARY KEY,
    color INTEGER NOT NULL,
    surname TEXT NOT NULL DEFAULT '',
    given_name TEXT NOT NULL DEFAULT '',
    iteration INTEGER NOT NULL,
    lifespan TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS VERTEX_ITERATION_IDX ON VERTEX(iteration);
CREATE TABLE IF NOT EXISTS EDGE (
    source TEXT NOT NULL,
    destination TEXT NOT NULL,
    type TEXT NOT NULL,
    id TEXT NOT NULL,
    PRIMARY KEY (source, destination, id)
);
CREATE INDEX IF NOT EXISTS EDGE_TYPE_SOURCE_IDX ON EDGE(type, source);
CREATE INDEX IF NOT EXISTS EDGE_TYPE_DESTINATION_IDX ON EDGE(type, destination);
CREATE INDEX IF NOT EXISTS EDGE_ID_IDX ON EDGE(id);
CREATE TABLE IF NOT EXISTS FRONTIER_QUEUE (
    id TEXT NOT NULL PRIMARY KEY,
    seq INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS FRONTIER_SEQ_IDX ON FRONTIER_QUEUE(seq);
CREATE TABLE IF NOT EXISTS PROCESSING_QUEUE (
    id TEXT NOT NULL PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS LOG (
    iteration INTEGER NOT NULL PRIMARY KEY,
    duration REAL NOT NULL,
    vertices INTEGER NOT NULL,
    frontier INTEGER NOT NULL,
    edges INTEGER NOT NULL,
    spanning_edges INTEGER NOT NULL,
    frontier_edges INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS JOB_METADATA (
    key TEXT NOT NULL PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Snapshot returned by [`Store::get_status`]; serialized as the
/// `checkpoint --status` JSON.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub run_status: RunStatus,
    pub frontier_depth: u64,
    pub processing_depth: u64,
    pub vertex_count: u64,
    pub edge_count: u64,
    pub last_completed_iteration: Option<u32>,
    pub starting_iteration: u32,
    pub last_checkpoint_event: Option<String>,
    pub last_checkpoint_ts: Option<String>,
    pub throttle: Option<ThrottleConfig>,
}

/// Handle to the crawl database. Cloning is cheap; all clones share the
/// single writer connection.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
    path: PathBuf,
}

fn integrity(msg: impl Into<String>) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(CrawlError::StoreIntegrity(msg.into())))
}

/// Unwrap integrity errors smuggled through the connection layer.
fn lift(e: tokio_rusqlite::Error) -> CrawlError {
    match e {
        tokio_rusqlite::Error::Other(inner) => match inner.downcast::<CrawlError>() {
            Ok(crawl) => *crawl,
            Err(other) => CrawlError::Config(other.to_string()),
        },
        other => CrawlError::Store(other),
    }
}

impl Store {
    /// Open (or create) the database at `<out_dir>/<basename>.db` and run
    /// forward-only migrations.
    pub async fn open(
        out_dir: impl AsRef<Path>,
        basename: &str,
        create_if_missing: bool,
    ) -> Result<Self> {
        let out_dir = out_dir.as_ref();
        let path = out_dir.join(format!("{basename}.db"));
        if !path.exists() {
            if !create_if_missing {
                return Err(CrawlError::Config(format!(
                    "database not found: {}",
                    path.display()
                )));
            }
            std::fs::create_dir_all(out_dir)?;
        }

        let conn = tokio_rusqlite::Connection::open(path.clone())
            .await
            .map_err(lift)?;
        let store = Self { conn, path };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an existing database read-only, for status inspection.
    pub async fn open_read_only(out_dir: impl AsRef<Path>, basename: &str) -> Result<Self> {
        let path = out_dir.as_ref().join(format!("{basename}.db"));
        if !path.exists() {
            return Err(CrawlError::Config(format!(
                "database not found: {}",
                path.display()
            )));
        }
        let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY;
        let conn = tokio_rusqlite::Connection::open_with_flags(path.clone(), flags)
            .await
            .map_err(lift)?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "synchronous", "NORMAL")?;

                let tx = conn.transaction()?;
                migrate(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(lift)
    }

    // ── Frontier ────────────────────────────────────────────────────────

    /// Insert each pid into the frontier unless it is already seen
    /// (vertex, processing, or frontier). First insertion wins the FIFO
    /// position; duplicates are no-ops.
    pub async fn add_to_frontier(&self, pids: Vec<Pid>) -> Result<usize> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut added = 0;
                for pid in &pids {
                    added += frontier_insert(&tx, pid)?;
                }
                tx.commit()?;
                Ok(added)
            })
            .await
            .map_err(lift)
    }

    /// Idempotent seeding: inserts only when the frontier is empty.
    /// Returns the number inserted (0 when seeding was skipped).
    pub async fn seed_frontier_if_empty(&self, pids: Vec<Pid>) -> Result<usize> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let depth: i64 =
                    tx.query_row("SELECT COUNT(*) FROM FRONTIER_QUEUE", [], |r| r.get(0))?;
                if depth > 0 {
                    return Ok(0);
                }
                let mut added = 0;
                for pid in &pids {
                    added += frontier_insert(&tx, pid)?;
                }
                tx.commit()?;
                Ok(added)
            })
            .await
            .map_err(lift)
    }

    /// Ordered snapshot of the oldest frontier entries.
    pub async fn peek_frontier(&self, limit: usize) -> Result<Vec<Pid>> {
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM FRONTIER_QUEUE ORDER BY seq LIMIT ?1")?;
                let rows = stmt
                    .query_map([limit as i64], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await
            .map_err(lift)
    }

    // ── Iteration lifecycle ─────────────────────────────────────────────

    /// The resume cursor: `max(LOG.iteration) + 1`, or 0 on a fresh run.
    pub async fn next_iteration_to_run(&self) -> Result<u32> {
        self.conn
            .call(|conn| {
                let next: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(iteration) + 1, 0) FROM LOG",
                    [],
                    |r| r.get(0),
                )?;
                Ok(next as u32)
            })
            .await
            .map_err(lift)
    }

    /// Promote up to `max_batch_drain` oldest frontier entries into the
    /// processing set and return them.
    ///
    /// Crash recovery: a non-empty processing set means a prior process
    /// died mid-iteration; its contents are returned verbatim without
    /// promoting, and the caller re-dispatches them (vertex and edge
    /// inserts are idempotent, so replay is safe).
    pub async fn start_iteration(&self, iteration: u32, max_batch_drain: usize) -> Result<Vec<Pid>> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let expected: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(iteration) + 1, 0) FROM LOG",
                    [],
                    |r| r.get(0),
                )?;
                if i64::from(iteration) != expected {
                    return Err(integrity(format!(
                        "start_iteration({iteration}) but resume cursor is {expected}"
                    )));
                }

                let mut stmt = tx.prepare("SELECT id FROM PROCESSING_QUEUE ORDER BY rowid")?;
                let leftover = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                drop(stmt);
                if !leftover.is_empty() {
                    tx.commit()?;
                    return Ok(leftover);
                }

                let mut stmt =
                    tx.prepare("SELECT id FROM FRONTIER_QUEUE ORDER BY seq LIMIT ?1")?;
                let promoted = stmt
                    .query_map([max_batch_drain as i64], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                drop(stmt);

                for pid in &promoted {
                    tx.execute("INSERT INTO PROCESSING_QUEUE (id) VALUES (?1)", [pid])?;
                    tx.execute("DELETE FROM FRONTIER_QUEUE WHERE id = ?1", [pid])?;
                }
                tx.commit()?;
                Ok(promoted)
            })
            .await
            .map_err(lift)
    }

    /// Snapshot of the current processing set.
    pub async fn get_ids_to_process(&self) -> Result<Vec<Pid>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM PROCESSING_QUEUE ORDER BY rowid")?;
                let rows = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await
            .map_err(lift)
    }

    /// Upsert a vertex and retire its pid from the processing set. No-op
    /// when the vertex already exists, so payload replay after a crash is
    /// safe.
    pub async fn add_individual(&self, vertex: Vertex) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO VERTEX
                       (id, color, surname, given_name, iteration, lifespan)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        vertex.pid,
                        vertex.gender.as_i64(),
                        vertex.surname,
                        vertex.given_name,
                        vertex.iteration,
                        vertex.lifespan,
                    ],
                )?;
                tx.execute("DELETE FROM PROCESSING_QUEUE WHERE id = ?1", [&vertex.pid])?;
                tx.execute("DELETE FROM FRONTIER_QUEUE WHERE id = ?1", [&vertex.pid])?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(lift)
    }

    /// Idempotent edge upsert, keyed `(source, destination, rel_id)`.
    /// Unseen endpoints are appended to the frontier, source first.
    pub async fn add_parent_child_relationship(
        &self,
        parent: Pid,
        child: Pid,
        rel_id: String,
        rel_type: RelationshipType,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO EDGE (source, destination, type, id)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![parent, child, rel_type.as_str(), rel_id],
                )?;
                frontier_insert(&tx, &parent)?;
                frontier_insert(&tx, &child)?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(lift)
    }

    /// Move pids from the processing set back to the frontier (permanent
    /// batch failure, end-of-hop leftovers, or shutdown). Pids that became
    /// vertices in the meantime are simply retired.
    pub async fn release_to_frontier(&self, pids: Vec<Pid>) -> Result<usize> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut released = 0;
                for pid in &pids {
                    let removed =
                        tx.execute("DELETE FROM PROCESSING_QUEUE WHERE id = ?1", [pid])?;
                    if removed > 0 {
                        released += frontier_insert(&tx, pid)?;
                    }
                }
                tx.commit()?;
                Ok(released)
            })
            .await
            .map_err(lift)
    }

    /// Close iteration `n` in a single transaction: drain any processing
    /// leftovers back to the frontier, write the LOG row, and record the
    /// checkpoint. Returns the committed record.
    pub async fn end_iteration(&self, iteration: u32, duration_s: f64) -> Result<IterationRecord> {
        let record = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let expected: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(iteration) + 1, 0) FROM LOG",
                    [],
                    |r| r.get(0),
                )?;
                if i64::from(iteration) != expected {
                    return Err(integrity(format!(
                        "end_iteration({iteration}) out of order; expected {expected}"
                    )));
                }

                // Anything still in processing failed this hop; it goes
                // back to the frontier for retry rather than being lost.
                let mut stmt = tx.prepare("SELECT id FROM PROCESSING_QUEUE ORDER BY rowid")?;
                let leftover = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                drop(stmt);
                for pid in &leftover {
                    tx.execute("DELETE FROM PROCESSING_QUEUE WHERE id = ?1", [pid])?;
                    frontier_insert(&tx, pid)?;
                }

                let vertices: i64 = tx.query_row("SELECT COUNT(*) FROM VERTEX", [], |r| r.get(0))?;
                let frontier: i64 =
                    tx.query_row("SELECT COUNT(*) FROM FRONTIER_QUEUE", [], |r| r.get(0))?;
                let (within, spanning, outside) = edge_split(&tx)?;

                tx.execute(
                    "INSERT INTO LOG
                       (iteration, duration, vertices, frontier, edges, spanning_edges, frontier_edges)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![iteration, duration_s, vertices, frontier, within, spanning, outside],
                )?;
                set_meta(&tx, "last_checkpoint_event", "iteration_complete")?;
                set_meta(&tx, "last_checkpoint_ts", &now_ts())?;
                tx.commit()?;

                Ok(IterationRecord {
                    iteration,
                    duration_s,
                    vertices: vertices as u64,
                    frontier: frontier as u64,
                    edges: within as u64,
                    spanning_edges: spanning as u64,
                    frontier_edges: outside as u64,
                })
            })
            .await
            .map_err(lift)?;

        self.wal_checkpoint().await?;
        Ok(record)
    }

    // ── Relationship resolution ─────────────────────────────────────────

    /// Flag ambiguity: any child with more than two incident biological-ish
    /// edges gets its unresolved edges flipped to `Resolve`. Edges already
    /// typed `BiologicalParent` are authoritative and stay. Returns the
    /// number of edges flipped.
    pub async fn determine_resolution(&self, iteration: u32) -> Result<usize> {
        let flipped = self
            .conn
            .call(|conn| {
                let sql = format!(
                    "UPDATE EDGE SET type = 'Resolve'
                     WHERE type IN ({REFLAGGABLE})
                       AND destination IN (
                         SELECT destination FROM EDGE
                         WHERE type IN ({BIOLOGICAL_ISH}, 'Resolve')
                         GROUP BY destination
                         HAVING COUNT(*) > 2
                       )"
                );
                let n = conn.execute(&sql, [])?;
                Ok(n)
            })
            .await
            .map_err(lift)?;
        if flipped > 0 {
            tracing::debug!(iteration, flipped, "flagged ambiguous edges for resolution");
        }
        Ok(flipped)
    }

    /// Distinct relationship ids currently flagged `Resolve`.
    pub async fn relationships_to_resolve(&self) -> Result<Vec<String>> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT id FROM EDGE WHERE type = 'Resolve' ORDER BY id")?;
                let rows = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await
            .map_err(lift)
    }

    /// Rewrite the type of every edge carrying `rel_id`.
    pub async fn update_relationship(
        &self,
        rel_id: String,
        rel_type: RelationshipType,
    ) -> Result<usize> {
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE EDGE SET type = ?1 WHERE id = ?2",
                    rusqlite::params![rel_type.as_str(), rel_id],
                )?;
                Ok(n)
            })
            .await
            .map_err(lift)
    }

    /// Record the resolution pass and commit.
    pub async fn end_relationship_resolution(&self, duration_s: f64, count: usize) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                set_meta(&tx, "resolution_duration_s", &duration_s.to_string())?;
                set_meta(&tx, "resolution_count", &count.to_string())?;
                set_meta(&tx, "last_checkpoint_event", "relationships_complete")?;
                set_meta(&tx, "last_checkpoint_ts", &now_ts())?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(lift)?;
        self.wal_checkpoint().await
    }

    // ── Checkpoints & metadata ──────────────────────────────────────────

    /// Record a named checkpoint and fold the WAL into the main file.
    pub async fn record_checkpoint(&self, event: &str) -> Result<()> {
        let event = event.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                set_meta(&tx, "last_checkpoint_event", &event)?;
                set_meta(&tx, "last_checkpoint_ts", &now_ts())?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(lift)?;
        self.wal_checkpoint().await
    }

    async fn wal_checkpoint(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(lift)
    }

    pub async fn set_run_status(&self, status: RunStatus) -> Result<()> {
        self.set_meta("run_status", status.as_str()).await
    }

    pub async fn save_throttle_config(&self, throttle: &ThrottleConfig) -> Result<()> {
        let json = serde_json::to_string(throttle)
            .map_err(|e| CrawlError::Config(format!("throttle config: {e}")))?;
        self.set_meta("throttle_config", &json).await
    }

    pub async fn set_max_hopcount(&self, hops: u32) -> Result<()> {
        self.set_meta("max_hopcount", &hops.to_string()).await
    }

    pub async fn record_seeds(&self, seeds: &[Pid]) -> Result<()> {
        self.set_meta("seeds", &seeds.join(",")).await
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                set_meta(conn, &key, &value)?;
                Ok(())
            })
            .await
            .map_err(lift)
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM JOB_METADATA WHERE key = ?1",
                        [&key],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await
            .map_err(lift)
    }

    // ── Inspection ──────────────────────────────────────────────────────

    pub async fn get_status(&self) -> Result<StoreStatus> {
        self.conn
            .call(|conn| {
                let frontier: i64 =
                    conn.query_row("SELECT COUNT(*) FROM FRONTIER_QUEUE", [], |r| r.get(0))?;
                let processing: i64 =
                    conn.query_row("SELECT COUNT(*) FROM PROCESSING_QUEUE", [], |r| r.get(0))?;
                let vertices: i64 =
                    conn.query_row("SELECT COUNT(*) FROM VERTEX", [], |r| r.get(0))?;
                let edges: i64 = conn.query_row("SELECT COUNT(*) FROM EDGE", [], |r| r.get(0))?;
                let last: Option<i64> =
                    conn.query_row("SELECT MAX(iteration) FROM LOG", [], |r| r.get(0))?;
                let run_status = get_meta(conn, "run_status")?
                    .and_then(|s| RunStatus::parse(&s))
                    .unwrap_or(RunStatus::Idle);
                let throttle = get_meta(conn, "throttle_config")?
                    .and_then(|json| serde_json::from_str(&json).ok());

                Ok(StoreStatus {
                    run_status,
                    frontier_depth: frontier as u64,
                    processing_depth: processing as u64,
                    vertex_count: vertices as u64,
                    edge_count: edges as u64,
                    last_completed_iteration: last.map(|n| n as u32),
                    starting_iteration: last.map(|n| n as u32 + 1).unwrap_or(0),
                    last_checkpoint_event: get_meta(conn, "last_checkpoint_event")?,
                    last_checkpoint_ts: get_meta(conn, "last_checkpoint_ts")?,
                    throttle,
                })
            })
            .await
            .map_err(lift)
    }

    /// All vertices, insertion-ordered.
    pub async fn get_vertices(&self) -> Result<Vec<Vertex>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, color, surname, given_name, iteration, lifespan
                     FROM VERTEX ORDER BY rowid",
                )?;
                let rows = stmt
                    .query_map([], |r| {
                        Ok(Vertex {
                            pid: r.get(0)?,
                            gender: Gender::from_i64(r.get(1)?),
                            surname: r.get(2)?,
                            given_name: r.get(3)?,
                            iteration: r.get(4)?,
                            lifespan: r.get(5)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(lift)
    }

    /// All edges, keyed order.
    pub async fn get_edges(&self) -> Result<Vec<Edge>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT source, destination, type, id FROM EDGE
                     ORDER BY source, destination, id",
                )?;
                let rows = stmt
                    .query_map([], |r| {
                        let type_str: String = r.get(2)?;
                        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, type_str, r.get::<_, String>(3)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(lift)?
            .into_iter()
            .map(|(source, destination, type_str, rel_id)| {
                let rel_type = RelationshipType::parse(&type_str).ok_or_else(|| {
                    CrawlError::StoreIntegrity(format!("unknown edge type: {type_str}"))
                })?;
                Ok(Edge {
                    source,
                    destination,
                    rel_id,
                    rel_type,
                })
            })
            .collect()
    }

    /// Committed iteration log, ordered.
    pub async fn get_log(&self) -> Result<Vec<IterationRecord>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT iteration, duration, vertices, frontier, edges,
                            spanning_edges, frontier_edges
                     FROM LOG ORDER BY iteration",
                )?;
                let rows = stmt
                    .query_map([], |r| {
                        Ok(IterationRecord {
                            iteration: r.get(0)?,
                            duration_s: r.get(1)?,
                            vertices: r.get::<_, i64>(2)? as u64,
                            frontier: r.get::<_, i64>(3)? as u64,
                            edges: r.get::<_, i64>(4)? as u64,
                            spanning_edges: r.get::<_, i64>(5)? as u64,
                            frontier_edges: r.get::<_, i64>(6)? as u64,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(lift)
    }

    /// Verify the partition and log-contiguity invariants; used by tests
    /// and the runner's post-run sanity pass.
    pub async fn check_integrity(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                let overlap: i64 = conn.query_row(
                    "SELECT
                       (SELECT COUNT(*) FROM VERTEX v JOIN PROCESSING_QUEUE p ON v.id = p.id)
                     + (SELECT COUNT(*) FROM VERTEX v JOIN FRONTIER_QUEUE f ON v.id = f.id)
                     + (SELECT COUNT(*) FROM PROCESSING_QUEUE p JOIN FRONTIER_QUEUE f ON p.id = f.id)",
                    [],
                    |r| r.get(0),
                )?;
                if overlap != 0 {
                    return Err(integrity(format!(
                        "{overlap} pid(s) present in more than one partition"
                    )));
                }

                let (rows, min, max): (i64, Option<i64>, Option<i64>) = conn.query_row(
                    "SELECT COUNT(*), MIN(iteration), MAX(iteration) FROM LOG",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )?;
                if rows > 0 && (min != Some(0) || max != Some(rows - 1)) {
                    return Err(integrity(format!(
                        "iteration log not contiguous: {rows} rows spanning {min:?}..{max:?}"
                    )));
                }
                Ok(())
            })
            .await
            .map_err(lift)
    }
}

// ── Connection-level helpers (run on the writer thread) ─────────────────

fn frontier_insert(conn: &rusqlite::Connection, pid: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO FRONTIER_QUEUE (id, seq)
         SELECT ?1, COALESCE((SELECT MAX(seq) FROM FRONTIER_QUEUE), 0) + 1
         WHERE NOT EXISTS (SELECT 1 FROM VERTEX WHERE id = ?1)
           AND NOT EXISTS (SELECT 1 FROM PROCESSING_QUEUE WHERE id = ?1)",
        [pid],
    )
}

fn edge_split(conn: &rusqlite::Connection) -> rusqlite::Result<(i64, i64, i64)> {
    conn.query_row(
        "SELECT
           COALESCE(SUM(src_in = 1 AND dst_in = 1), 0),
           COALESCE(SUM(src_in + dst_in = 1), 0),
           COALESCE(SUM(src_in = 0 AND dst_in = 0), 0)
         FROM (
           SELECT EXISTS(SELECT 1 FROM VERTEX v WHERE v.id = e.source) AS src_in,
                  EXISTS(SELECT 1 FROM VERTEX v WHERE v.id = e.destination) AS dst_in
           FROM EDGE e
         )",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
}

fn set_meta(conn: &rusqlite::Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO JOB_METADATA (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

fn get_meta(conn: &rusqlite::Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM JOB_METADATA WHERE key = ?1",
        [key],
        |r| r.get(0),
    )
    .optional()
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Forward-only migrations, keyed on the `schema_version` metadata row.
/// Version 1 predates the single-file layout: FRONTIER_VERTEX/PROCESSING
/// table names, no FIFO seq, no JOB_METADATA.
fn migrate(conn: &rusqlite::Connection) -> std::result::Result<(), tokio_rusqlite::Error> {
    let has_metadata: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='JOB_METADATA'",
            [],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    let version = if has_metadata {
        get_meta(conn, "schema_version")?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    } else {
        let has_legacy: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name='FRONTIER_VERTEX'",
                [],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if has_legacy {
            1
        } else {
            0
        }
    };

    if version > SCHEMA_VERSION {
        return Err(integrity(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    if version == 1 {
        conn.execute_batch(
            "CREATE TABLE FRONTIER_QUEUE (
                 id TEXT NOT NULL PRIMARY KEY,
                 seq INTEGER NOT NULL
             );
             INSERT INTO FRONTIER_QUEUE (id, seq)
                 SELECT id, rowid FROM FRONTIER_VERTEX ORDER BY rowid;
             DROP TABLE FRONTIER_VERTEX;
             ALTER TABLE PROCESSING RENAME TO PROCESSING_QUEUE;",
        )?;
    }

    conn.execute_batch(SCHEMA)?;
    set_meta(conn, "schema_version", &SCHEMA_VERSION.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vertex(pid: &str, iteration: u32) -> Vertex {
        Vertex {
            pid: pid.to_string(),
            gender: Gender::Male,
            surname: "Tester".to_string(),
            given_name: pid.to_string(),
            iteration,
            lifespan: "1900-2000".to_string(),
        }
    }

    async fn open_temp() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), "crawl", true).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_open_creates_wal_database() {
        let (dir, store) = open_temp().await;
        assert!(dir.path().join("crawl.db").exists());
        assert_eq!(
            store.get_meta("schema_version").await.unwrap().as_deref(),
            Some("2")
        );
        drop(store);

        // Reopen and confirm the schema survives.
        let reopened = Store::open(dir.path(), "crawl", false).await.unwrap();
        assert_eq!(reopened.next_iteration_to_run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_without_create_fails_on_missing() {
        let dir = TempDir::new().unwrap();
        assert!(Store::open(dir.path(), "missing", false).await.is_err());
    }

    #[tokio::test]
    async fn test_frontier_fifo_and_dedup() {
        let (_dir, store) = open_temp().await;
        store
            .add_to_frontier(vec!["A".into(), "B".into(), "C".into()])
            .await
            .unwrap();
        // Duplicate insert keeps the original position.
        store.add_to_frontier(vec!["A".into()]).await.unwrap();
        assert_eq!(store.peek_frontier(2).await.unwrap(), vec!["A", "B"]);
        assert_eq!(
            store.peek_frontier(10).await.unwrap(),
            vec!["A", "B", "C"]
        );
    }

    #[tokio::test]
    async fn test_seed_frontier_if_empty() {
        let (_dir, store) = open_temp().await;
        assert_eq!(
            store
                .seed_frontier_if_empty(vec!["A".into(), "B".into(), "C".into()])
                .await
                .unwrap(),
            3
        );
        assert_eq!(store.seed_frontier_if_empty(vec!["D".into()]).await.unwrap(), 0);
        assert_eq!(store.peek_frontier(10).await.unwrap(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_iteration_promotes_and_closes() {
        let (_dir, store) = open_temp().await;
        store
            .add_to_frontier(vec!["A".into(), "B".into(), "C".into()])
            .await
            .unwrap();

        let promoted = store.start_iteration(0, 2).await.unwrap();
        assert_eq!(promoted, vec!["A", "B"]);
        assert_eq!(store.get_ids_to_process().await.unwrap(), vec!["A", "B"]);
        assert_eq!(store.peek_frontier(10).await.unwrap(), vec!["C"]);

        store.add_individual(vertex("A", 0)).await.unwrap();
        store.add_individual(vertex("B", 0)).await.unwrap();
        let record = store.end_iteration(0, 1.5).await.unwrap();
        assert_eq!(record.iteration, 0);
        assert_eq!(record.vertices, 2);
        assert_eq!(record.frontier, 1);
        assert_eq!(store.next_iteration_to_run().await.unwrap(), 1);
        store.check_integrity().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_iteration_returns_leftovers_after_crash() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), "crash", true).await.unwrap();
            store
                .add_to_frontier(vec!["A".into(), "B".into()])
                .await
                .unwrap();
            store.start_iteration(0, 10).await.unwrap();
            store.add_individual(vertex("A", 0)).await.unwrap();
            // Process dies here: B is still in processing, no LOG row.
        }

        let store = Store::open(dir.path(), "crash", false).await.unwrap();
        assert_eq!(store.next_iteration_to_run().await.unwrap(), 0);
        // Recovery path: the surviving processing set comes back verbatim.
        let recovered = store.start_iteration(0, 10).await.unwrap();
        assert_eq!(recovered, vec!["B"]);
        // Replay of an already-persisted vertex is a no-op.
        store.add_individual(vertex("A", 0)).await.unwrap();
        store.add_individual(vertex("B", 0)).await.unwrap();
        store.end_iteration(0, 0.1).await.unwrap();
        assert_eq!(store.get_vertices().await.unwrap().len(), 2);
        store.check_integrity().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_iteration_is_integrity_error() {
        let (_dir, store) = open_temp().await;
        store.add_to_frontier(vec!["A".into()]).await.unwrap();
        let err = store.start_iteration(3, 10).await.unwrap_err();
        assert!(matches!(err, CrawlError::StoreIntegrity(_)));
    }

    #[tokio::test]
    async fn test_edge_insert_feeds_frontier_and_is_idempotent() {
        let (_dir, store) = open_temp().await;
        store.add_to_frontier(vec!["P0".into()]).await.unwrap();
        store.start_iteration(0, 10).await.unwrap();
        store.add_individual(vertex("P0", 0)).await.unwrap();

        for _ in 0..2 {
            store
                .add_parent_child_relationship(
                    "P1".into(),
                    "P0".into(),
                    "R1".into(),
                    RelationshipType::UnspecifiedParentType,
                )
                .await
                .unwrap();
        }

        let edges = store.get_edges().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source, "P1");
        assert_eq!(edges[0].destination, "P0");
        // The unseen parent landed in the frontier exactly once.
        assert_eq!(store.peek_frontier(10).await.unwrap(), vec!["P1"]);
    }

    #[tokio::test]
    async fn test_release_to_frontier_requeues_at_back() {
        let (_dir, store) = open_temp().await;
        store
            .add_to_frontier(vec!["A".into(), "B".into(), "C".into()])
            .await
            .unwrap();
        store.start_iteration(0, 2).await.unwrap();
        store.release_to_frontier(vec!["A".into()]).await.unwrap();
        // A was re-enqueued behind C.
        assert_eq!(store.peek_frontier(10).await.unwrap(), vec!["C", "A"]);
        assert_eq!(store.get_ids_to_process().await.unwrap(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_end_iteration_drains_leftovers_to_frontier() {
        let (_dir, store) = open_temp().await;
        store
            .add_to_frontier(vec!["A".into(), "B".into()])
            .await
            .unwrap();
        store.start_iteration(0, 10).await.unwrap();
        store.add_individual(vertex("A", 0)).await.unwrap();
        // B was requested but never returned by the service.
        let record = store.end_iteration(0, 0.5).await.unwrap();
        assert_eq!(record.frontier, 1);
        assert_eq!(store.peek_frontier(10).await.unwrap(), vec!["B"]);
        assert!(store.get_ids_to_process().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_determine_resolution_flags_over_parented_child() {
        let (_dir, store) = open_temp().await;
        store.add_to_frontier(vec!["C0".into()]).await.unwrap();
        store.start_iteration(0, 10).await.unwrap();
        store.add_individual(vertex("C0", 0)).await.unwrap();
        for (parent, rel) in [("P1", "R1"), ("P2", "R2"), ("P3", "R3")] {
            store
                .add_parent_child_relationship(
                    parent.into(),
                    "C0".into(),
                    rel.into(),
                    RelationshipType::UnspecifiedParentType,
                )
                .await
                .unwrap();
        }
        store.end_iteration(0, 0.1).await.unwrap();

        let flipped = store.determine_resolution(0).await.unwrap();
        assert_eq!(flipped, 3);
        let ids = store.relationships_to_resolve().await.unwrap();
        assert_eq!(ids, vec!["R1", "R2", "R3"]);

        // Two parents is fine; nothing flagged for a second child.
        store
            .add_parent_child_relationship(
                "P1".into(),
                "C1".into(),
                "R4".into(),
                RelationshipType::UnspecifiedParentType,
            )
            .await
            .unwrap();
        store.determine_resolution(0).await.unwrap();
        let edges = store.get_edges().await.unwrap();
        let r4 = edges.iter().find(|e| e.rel_id == "R4").unwrap();
        assert_eq!(r4.rel_type, RelationshipType::UnspecifiedParentType);
    }

    #[tokio::test]
    async fn test_determine_resolution_leaves_biological_parent() {
        let (_dir, store) = open_temp().await;
        store
            .add_parent_child_relationship(
                "P1".into(),
                "C0".into(),
                "R1".into(),
                RelationshipType::BiologicalParent,
            )
            .await
            .unwrap();
        for (parent, rel) in [("P2", "R2"), ("P3", "R3")] {
            store
                .add_parent_child_relationship(
                    parent.into(),
                    "C0".into(),
                    rel.into(),
                    RelationshipType::UnspecifiedParentType,
                )
                .await
                .unwrap();
        }

        store.determine_resolution(0).await.unwrap();
        let edges = store.get_edges().await.unwrap();
        let r1 = edges.iter().find(|e| e.rel_id == "R1").unwrap();
        assert_eq!(r1.rel_type, RelationshipType::BiologicalParent);
        assert_eq!(
            store.relationships_to_resolve().await.unwrap(),
            vec!["R2", "R3"]
        );
    }

    #[tokio::test]
    async fn test_update_relationship_rewrites_all_edges_with_id() {
        let (_dir, store) = open_temp().await;
        store
            .add_parent_child_relationship(
                "P1".into(),
                "C0".into(),
                "R1".into(),
                RelationshipType::Resolve,
            )
            .await
            .unwrap();
        store
            .add_parent_child_relationship(
                "P2".into(),
                "C0".into(),
                "R1".into(),
                RelationshipType::Resolve,
            )
            .await
            .unwrap();

        let n = store
            .update_relationship("R1".into(), RelationshipType::NonBiological)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(store.relationships_to_resolve().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_cursor_and_depths() {
        let (_dir, store) = open_temp().await;
        store.set_run_status(RunStatus::Running).await.unwrap();
        store
            .save_throttle_config(&ThrottleConfig::default())
            .await
            .unwrap();
        store
            .add_to_frontier(vec!["A".into(), "B".into()])
            .await
            .unwrap();
        store.start_iteration(0, 1).await.unwrap();
        store.add_individual(vertex("A", 0)).await.unwrap();
        store.end_iteration(0, 0.2).await.unwrap();

        let status = store.get_status().await.unwrap();
        assert_eq!(status.run_status, RunStatus::Running);
        assert_eq!(status.vertex_count, 1);
        assert_eq!(status.frontier_depth, 1);
        assert_eq!(status.processing_depth, 0);
        assert_eq!(status.last_completed_iteration, Some(0));
        assert_eq!(status.starting_iteration, 1);
        assert_eq!(status.throttle, Some(ThrottleConfig::default()));
        assert_eq!(
            status.last_checkpoint_event.as_deref(),
            Some("iteration_complete")
        );
    }

    #[tokio::test]
    async fn test_migrates_legacy_v1_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE VERTEX (
                     id TEXT NOT NULL PRIMARY KEY,
                     color INTEGER NOT NULL,
                     surname TEXT NOT NULL DEFAULT '',
                     given_name TEXT NOT NULL DEFAULT '',
                     iteration INTEGER NOT NULL,
                     lifespan TEXT NOT NULL DEFAULT ''
                 );
                 CREATE TABLE EDGE (
                     source TEXT NOT NULL,
                     destination TEXT NOT NULL,
                     type TEXT NOT NULL,
                     id TEXT NOT NULL,
                     PRIMARY KEY (source, destination, id)
                 );
                 CREATE TABLE FRONTIER_VERTEX (id TEXT NOT NULL PRIMARY KEY);
                 CREATE TABLE PROCESSING (id TEXT NOT NULL PRIMARY KEY);
                 CREATE TABLE LOG (
                     iteration INTEGER NOT NULL PRIMARY KEY,
                     duration REAL NOT NULL,
                     vertices INTEGER NOT NULL,
                     frontier INTEGER NOT NULL,
                     edges INTEGER NOT NULL,
                     spanning_edges INTEGER NOT NULL,
                     frontier_edges INTEGER NOT NULL
                 );
                 INSERT INTO FRONTIER_VERTEX (id) VALUES ('F1'), ('F2');
                 INSERT INTO PROCESSING (id) VALUES ('P1');",
            )
            .unwrap();
        }

        let store = Store::open(dir.path(), "legacy", false).await.unwrap();
        assert_eq!(store.peek_frontier(5).await.unwrap(), vec!["F1", "F2"]);
        assert_eq!(store.get_ids_to_process().await.unwrap(), vec!["P1"]);
        assert_eq!(
            store.get_meta("schema_version").await.unwrap().as_deref(),
            Some("2")
        );
    }
}
