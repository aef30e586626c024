#![allow(dead_code)]

use async_trait::async_trait;
use rusqlite::Connection;
use shopfloor_analyst::catalog::{CatalogOverlay, SchemaCatalog};
use shopfloor_analyst::config::PipelineSettings;
use shopfloor_analyst::error::{AnalyticsError, Result};
use shopfloor_analyst::execution::{ExecutionResult, QueryExecutor, SqliteExecutor};
use shopfloor_analyst::llm::{ModelPort, ScriptedModel};
use shopfloor_analyst::schema_rag::LexicalRanker;
use shopfloor_analyst::workflow::{CancelFlag, Orchestrator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE line_master (
    line_id TEXT PRIMARY KEY,
    line_name TEXT NOT NULL,
    building TEXT,
    capacity_per_shift INTEGER
);
CREATE TABLE products (
    product_id TEXT PRIMARY KEY,
    product_name TEXT NOT NULL,
    category TEXT
);
CREATE TABLE staff (
    staff_id TEXT PRIMARY KEY,
    full_name TEXT NOT NULL,
    role TEXT,
    hire_date TEXT
);
CREATE TABLE production_orders (
    order_id TEXT PRIMARY KEY,
    line_id TEXT REFERENCES line_master(line_id),
    product_id TEXT REFERENCES products(product_id),
    quantity_planned REAL,
    quantity_actual REAL,
    status TEXT,
    order_date TEXT
);
CREATE TABLE shift_logs (
    shift_id TEXT PRIMARY KEY,
    line_id TEXT REFERENCES line_master(line_id),
    supervisor_id TEXT REFERENCES staff(staff_id),
    shift_type TEXT,
    shift_date TEXT,
    start_time TEXT,
    end_time TEXT,
    output_units INTEGER,
    downtime_minutes INTEGER
);
"#;

const ROWS: &str = r#"
INSERT INTO line_master VALUES
    ('LINE-1', 'Assembly A', 'North', 600),
    ('LINE-2', 'Assembly B', 'North', 400),
    ('LINE-3', 'Packaging', 'South', 550);
INSERT INTO products VALUES
    ('P-100', 'Gear housing', 'mechanical'),
    ('P-200', 'Control board', 'electronics'),
    ('P-300', 'Drive shaft', 'mechanical');
INSERT INTO staff VALUES
    ('S-01', 'Dana Ortiz', 'supervisor', '2019-04-01'),
    ('S-02', 'Kim Osei', 'supervisor', '2021-09-15'),
    ('S-03', 'Ravi Patel', 'operator', '2022-01-10');
INSERT INTO production_orders VALUES
    ('PO-1040', 'LINE-1', 'P-100', 500, 480, 'completed', '2024-03-04'),
    ('PO-1041', 'LINE-3', 'P-200', 400, 372, 'completed', '2024-03-04'),
    ('PO-1042', 'LINE-3', 'P-100', 300, 285, 'completed', '2024-03-05'),
    ('PO-1043', 'LINE-2', 'P-300', 250, 200, 'in_progress', '2024-03-05'),
    ('PO-1044', 'LINE-3', 'P-200', 500, 455, 'completed', '2024-03-06'),
    ('PO-1045', 'LINE-1', 'P-300', 350, 0, 'planned', '2024-03-07');
INSERT INTO shift_logs VALUES
    ('SH-1', 'LINE-3', 'S-01', 'day', '2024-03-04', '06:00', '14:00', 372, 25),
    ('SH-2', 'LINE-3', 'S-02', 'night', '2024-03-05', '22:00', '06:00', 285, 40),
    ('SH-3', 'LINE-1', 'S-01', 'day', '2024-03-05', '06:00', '14:00', 480, 10);
"#;

/// In-memory manufacturing database with a week of orders and shifts.
pub fn seeded_connection() -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory database");
    conn.execute_batch(SCHEMA).expect("schema");
    conn.execute_batch(ROWS).expect("rows");
    conn
}

pub fn overlay() -> CatalogOverlay {
    let descriptions: HashMap<String, String> = [
        ("line_master", "Production lines with building and capacity"),
        ("products", "Product catalogue"),
        ("staff", "Supervisors and operators"),
        (
            "production_orders",
            "Orders per line with planned and actual quantity; yield is actual over planned",
        ),
        ("shift_logs", "Shift records with output, downtime and supervisor"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    CatalogOverlay {
        descriptions,
        join_guide: vec!["staff joins production only through shift_logs.supervisor_id".to_string()],
    }
}

/// Catalog and read-only executor over the same seeded database.
pub fn seeded_store() -> (Arc<SchemaCatalog>, Arc<SqliteExecutor>) {
    let conn = seeded_connection();
    let catalog = SchemaCatalog::load(&conn).expect("catalog").with_overlay(overlay());
    let executor = SqliteExecutor::from_connection(conn)
        .expect("executor")
        .with_timeout(Duration::from_secs(5));
    (Arc::new(catalog), Arc::new(executor))
}

pub fn port(model: Arc<ScriptedModel>) -> ModelPort {
    ModelPort::new(model, Duration::from_millis(200), 512)
}

pub fn orchestrator(model: Arc<ScriptedModel>, executor: Arc<dyn QueryExecutor>) -> Orchestrator {
    let (catalog, _) = seeded_store();
    Orchestrator::new(
        catalog,
        port(model),
        executor,
        Arc::new(LexicalRanker::new()),
        PipelineSettings::default(),
    )
}

pub fn seeded_orchestrator(model: Arc<ScriptedModel>) -> Orchestrator {
    let (catalog, executor) = seeded_store();
    Orchestrator::new(
        catalog,
        port(model),
        executor,
        Arc::new(LexicalRanker::new()),
        PipelineSettings::default(),
    )
}

/// A data store that never answers.
#[derive(Default)]
pub struct UnreachableExecutor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl QueryExecutor for UnreachableExecutor {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn execute(&self, _sql: &str) -> Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AnalyticsError::Execution(
            "unable to open database file: connection refused".to_string(),
        ))
    }
}

/// Runs the statement, then raises the cancel flag before returning, as
/// if the user gave up while the query was in flight.
pub struct CancellingExecutor {
    pub inner: Arc<SqliteExecutor>,
    pub cancel: CancelFlag,
}

#[async_trait]
impl QueryExecutor for CancellingExecutor {
    fn name(&self) -> &str {
        "cancelling"
    }

    async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        let result = self.inner.execute(sql).await;
        self.cancel.cancel();
        result
    }
}
