//! SQLite-backed durable store for buffered webhooks and usage statistics
//!
//! Buffered requests must survive gateway restarts, so they live in
//! sqlite rather than memory. The single connection behind a mutex also
//! serializes statistics writes, which keeps last-accessed/last-buffered
//! touches free of lost updates under concurrent requests.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// A durably persisted webhook request awaiting replay.
///
/// Round-trips through storage: headers are serialized as a JSON map of
/// name to value list, the payload is raw bytes. Reconstructable into a
/// fully-formed outbound HTTP request against `scheme://host{path}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRequest {
    pub id: String,
    pub namespace: String,
    /// Cluster the namespace lives on; needed to query pod state at replay time
    pub cluster_url: String,
    pub method: String,
    pub headers: HashMap<String, Vec<String>>,
    pub payload: Vec<u8>,
    pub host: String,
    pub scheme: String,
    pub path: String,
    pub retry_count: u32,
}

impl BufferedRequest {
    /// Target URL the request is replayed against
    pub fn target_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }
}

/// Per-namespace usage timestamps, best-effort telemetry
#[derive(Debug, Clone)]
pub struct UsageStat {
    pub namespace: String,
    pub last_accessed: Option<String>,
    pub last_buffered: Option<String>,
}

/// Store connection wrapper with thread-safe access
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open store database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.run_migrations()?;

        info!("Store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: buffered requests and usage statistics
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            -- Buffered webhook requests awaiting replay.
            -- rowid preserves insertion order within a namespace.
            CREATE TABLE IF NOT EXISTS buffered_requests (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                cluster_url TEXT NOT NULL,
                method TEXT NOT NULL,
                headers TEXT NOT NULL,
                payload BLOB NOT NULL,
                host TEXT NOT NULL,
                scheme TEXT NOT NULL,
                path TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_buffered_namespace
                ON buffered_requests(namespace);

            -- Per-namespace usage timestamps
            CREATE TABLE IF NOT EXISTS usage_stats (
                namespace TEXT PRIMARY KEY,
                last_accessed TEXT,
                last_buffered TEXT
            );
            "#,
        )?;

        conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (1)",
            [],
        )?;

        Ok(())
    }

    /// Persist a buffered request
    pub fn create_request(&self, request: &BufferedRequest) -> Result<()> {
        let headers =
            serde_json::to_string(&request.headers).context("Failed to serialize headers")?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO buffered_requests
                (id, namespace, cluster_url, method, headers, payload, host, scheme, path, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request.id,
                request.namespace,
                request.cluster_url,
                request.method,
                headers,
                request.payload,
                request.host,
                request.scheme,
                request.path,
                request.retry_count,
            ],
        )
        .context("Failed to persist buffered request")?;

        Ok(())
    }

    /// List a namespace's buffered requests in insertion order
    pub fn requests_for(&self, namespace: &str) -> Result<Vec<BufferedRequest>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, namespace, cluster_url, method, headers, payload, host, scheme, path, retry_count
             FROM buffered_requests
             WHERE namespace = ?1
             ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map(params![namespace], |row| {
            let headers_json: String = row.get(4)?;
            Ok((
                BufferedRequest {
                    id: row.get(0)?,
                    namespace: row.get(1)?,
                    cluster_url: row.get(2)?,
                    method: row.get(3)?,
                    headers: HashMap::new(),
                    payload: row.get(5)?,
                    host: row.get(6)?,
                    scheme: row.get(7)?,
                    path: row.get(8)?,
                    retry_count: row.get(9)?,
                },
                headers_json,
            ))
        })?;

        let mut requests = Vec::new();
        for row in rows {
            let (mut request, headers_json) = row?;
            request.headers = serde_json::from_str(&headers_json)
                .context("Failed to deserialize buffered request headers")?;
            requests.push(request);
        }

        Ok(requests)
    }

    /// Delete a buffered request. Returns true if a row was removed.
    pub fn delete_request(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM buffered_requests WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Increment the retry count of a buffered request.
    ///
    /// Fails if the row no longer exists, which the replay task treats
    /// as a broken record to be deleted.
    pub fn increment_retry(&self, id: &str) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE buffered_requests SET retry_count = retry_count + 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            anyhow::bail!("buffered request '{}' not found", id);
        }

        let count: u32 = conn.query_row(
            "SELECT retry_count FROM buffered_requests WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Namespaces that currently have pending buffered requests
    pub fn namespaces_with_pending(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT namespace FROM buffered_requests ORDER BY namespace")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut namespaces = Vec::new();
        for row in rows {
            namespaces.push(row?);
        }
        Ok(namespaces)
    }

    /// Number of buffered requests pending for a namespace
    pub fn pending_count(&self, namespace: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM buffered_requests WHERE namespace = ?1",
            params![namespace],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Record that a webhook was buffered for this namespace just now
    pub fn touch_last_buffered(&self, namespace: &str) -> Result<()> {
        self.touch(namespace, "last_buffered")
    }

    /// Record that a UI request was forwarded for this namespace just now
    pub fn touch_last_accessed(&self, namespace: &str) -> Result<()> {
        self.touch(namespace, "last_accessed")
    }

    fn touch(&self, namespace: &str, column: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        // column is one of two internal constants, never user input
        conn.execute(
            &format!(
                "INSERT INTO usage_stats (namespace, {col}) VALUES (?1, ?2)
                 ON CONFLICT(namespace) DO UPDATE SET {col} = ?2",
                col = column
            ),
            params![namespace, now],
        )?;
        Ok(())
    }

    /// Usage timestamps for one namespace
    pub fn usage_for(&self, namespace: &str) -> Result<Option<UsageStat>> {
        let conn = self.conn.lock().unwrap();
        let stat = conn
            .query_row(
                "SELECT namespace, last_accessed, last_buffered
                 FROM usage_stats WHERE namespace = ?1",
                params![namespace],
                |row| {
                    Ok(UsageStat {
                        namespace: row.get(0)?,
                        last_accessed: row.get(1)?,
                        last_buffered: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(stat)
    }

    /// Snapshot of all usage statistics, for periodic logging
    pub fn usage_snapshot(&self) -> Result<Vec<UsageStat>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT namespace, last_accessed, last_buffered
             FROM usage_stats ORDER BY namespace",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UsageStat {
                namespace: row.get(0)?,
                last_accessed: row.get(1)?,
                last_buffered: row.get(2)?,
            })
        })?;

        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }
}
