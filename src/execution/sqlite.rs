//! SQLite Executor
//!
//! Runs accepted statements against a read-only connection. The blocking
//! rusqlite call lives on the blocking pool; the async side enforces the
//! query timeout and interrupts the statement when it fires.
//!
//! Concurrent runs share one connection. The timeout starts once a call
//! holds the connection, and an expiring call only interrupts the
//! connection while its own statement is the one running.

use crate::error::{AnalyticsError, Result};
use crate::execution::result::{ExecutionResult, Scalar};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ROWS: usize = 5000;

/// Capability: run one read-only statement and return its rows.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, sql: &str) -> Result<ExecutionResult>;
}

type QueryRows = (Vec<String>, Vec<Vec<Scalar>>, bool);

pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    /// Id of the `execute` call whose statement currently holds the connection.
    running: Arc<Mutex<Option<u64>>>,
    next_call: AtomicU64,
    timeout: Duration,
    max_rows: usize,
}

impl SqliteExecutor {
    /// Open a database file read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        info!("Opened {} read-only", path.display());
        Self::from_connection(conn)
    }

    /// Wrap an existing connection; it is switched to query-only mode.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "query_only", true)?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            running: Arc::new(Mutex::new(None)),
            next_call: AtomicU64::new(1),
            timeout: DEFAULT_QUERY_TIMEOUT,
            max_rows: DEFAULT_MAX_ROWS,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Run `f` against the connection synchronously (catalog loading).
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| AnalyticsError::Execution("connection lock poisoned".to_string()))?;
        f(&guard)
    }

    /// Interrupt the connection if, and only if, call `id` is still running.
    fn interrupt_call(&self, id: u64) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if *running == Some(id) {
            self.interrupt.interrupt();
            true
        } else {
            false
        }
    }
}

fn mark_running(running: &Mutex<Option<u64>>, call: Option<u64>) {
    *running.lock().unwrap_or_else(PoisonError::into_inner) = call;
}

fn joined(outcome: std::result::Result<Result<QueryRows>, tokio::task::JoinError>) -> Result<QueryRows> {
    match outcome {
        Ok(rows) => rows,
        Err(join_error) => Err(AnalyticsError::Execution(format!("query task failed: {}", join_error))),
    }
}

fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> Result<QueryRows> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(AnalyticsError::Execution(
            "statement is not read-only; attempt to write a readonly database".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if out.len() >= max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(match row.get_ref(idx)? {
                ValueRef::Null => Scalar::Null,
                ValueRef::Integer(v) => Scalar::Integer(v),
                ValueRef::Real(v) => Scalar::Real(v),
                ValueRef::Text(t) => Scalar::Text(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => Scalar::Blob(b.to_vec()),
            });
        }
        out.push(values);
    }
    Ok((columns, out, truncated))
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        let conn = Arc::clone(&self.conn);
        let running = Arc::clone(&self.running);
        let statement = sql.to_string();
        let max_rows = self.max_rows;
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let mut task = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| AnalyticsError::Execution("connection lock poisoned".to_string()))?;
            mark_running(&running, Some(call));
            // nobody is waiting for this statement any more
            if started_tx.send(()).is_err() {
                mark_running(&running, None);
                return Err(AnalyticsError::Execution("query abandoned before it started".to_string()));
            }
            let outcome = run_query(&guard, &statement, max_rows);
            mark_running(&running, None);
            outcome
        });

        // waiting for another run's statement does not count against this one
        if started_rx.await.is_err() {
            return match joined(task.await) {
                Err(e) => Err(e),
                Ok(_) => Err(AnalyticsError::Execution("query did not start".to_string())),
            };
        }
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(outcome) => {
                let (columns, rows, truncated) = joined(outcome)?;
                let mut result = ExecutionResult::new(columns, rows);
                result.truncated = truncated;
                result.duration_ms = started.elapsed().as_millis() as u64;
                if truncated {
                    warn!("Result truncated at {} rows", max_rows);
                }
                debug!("Query returned {} rows in {}ms", result.row_count, result.duration_ms);
                Ok(result)
            }
            Err(_) => {
                let interrupted = self.interrupt_call(call);
                warn!(
                    "Query exceeded {}ms (interrupted: {}); its result is dropped",
                    self.timeout.as_millis(),
                    interrupted
                );
                Err(AnalyticsError::Timeout(format!(
                    "query exceeded {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}
