use crate::error::{AnalyticsError, Result};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub not_null: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub row_count: Option<u64>,
    /// (column, rendered value) pairs from the first stored row
    #[serde(default)]
    pub sample_row: Vec<(String, String)>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            row_count: None,
            sample_row: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn column(mut self, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        self.columns.push(ColumnSchema {
            name: name.into(),
            data_type: data_type.into(),
            primary_key: false,
            not_null: false,
        });
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        self.columns.push(ColumnSchema {
            name: name.into(),
            data_type: data_type.into(),
            primary_key: true,
            not_null: true,
        });
        self
    }

    pub fn references(
        mut self,
        from_column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            from_column: from_column.into(),
            to_table: to_table.into(),
            to_column: to_column.into(),
        });
        self
    }

    pub fn sample(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.sample_row.push((column.into(), value.into()));
        self
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Hand-authored additions merged over the structural metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogOverlay {
    #[serde(default)]
    pub descriptions: HashMap<String, String>,
    #[serde(default)]
    pub join_guide: Vec<String>,
}

impl CatalogOverlay {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let overlay: CatalogOverlay = serde_json::from_str(&raw)
            .map_err(|e| AnalyticsError::Schema(format!("Failed to parse overlay {}: {}", path.display(), e)))?;
        Ok(overlay)
    }
}

/// Read-only description of the analytics database, built once per process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub tables: Vec<TableSchema>,
    /// Hand-authored join hints, one per line
    #[serde(default)]
    pub join_guide: Vec<String>,
}

impl SchemaCatalog {
    pub fn new(tables: Vec<TableSchema>, join_guide: Vec<String>) -> Self {
        Self { tables, join_guide }
    }

    /// Build the catalog from SQLite structural metadata, in declaration order.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
        )?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            tables.push(load_table(conn, &name)?);
        }

        info!("Loaded schema catalog with {} tables", tables.len());
        Ok(Self {
            tables,
            join_guide: Vec::new(),
        })
    }

    pub fn with_overlay(mut self, overlay: CatalogOverlay) -> Self {
        for table in &mut self.tables {
            if let Some(description) = overlay
                .descriptions
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&table.name))
                .map(|(_, d)| d.clone())
            {
                table.description = description;
            }
        }
        self.join_guide.extend(overlay.join_guide);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table).map(|t| t.has_column(column)).unwrap_or(false)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Join hints derived from foreign keys followed by the hand-authored lines.
    pub fn join_paths(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .tables
            .iter()
            .flat_map(|t| {
                t.foreign_keys.iter().map(move |fk| {
                    format!(
                        "{} -> {}: {}.{} = {}.{}",
                        t.name, fk.to_table, t.name, fk.from_column, fk.to_table, fk.to_column
                    )
                })
            })
            .collect();
        for line in &self.join_guide {
            if !lines.contains(line) {
                lines.push(line.clone());
            }
        }
        lines
    }
}

fn load_table(conn: &Connection, name: &str) -> Result<TableSchema> {
    let quoted = quote_identifier(name);

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quoted))?;
    let columns: Vec<ColumnSchema> = stmt
        .query_map([], |row| {
            Ok(ColumnSchema {
                name: row.get(1)?,
                data_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                not_null: row.get::<_, i64>(3)? != 0,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<std::result::Result<_, _>>()?;

    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quoted))?;
    let foreign_keys: Vec<ForeignKey> = stmt
        .query_map([], |row| {
            let from_column: String = row.get(3)?;
            Ok(ForeignKey {
                to_table: row.get(2)?,
                to_column: row.get::<_, Option<String>>(4)?.unwrap_or_else(|| from_column.clone()),
                from_column,
            })
        })?
        .collect::<std::result::Result<_, _>>()?;

    let row_count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quoted), [], |row| row.get(0))?;

    let mut stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT 1", quoted))?;
    let column_names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut sample_row = Vec::new();
    if let Some(row) = rows.next()? {
        for (idx, column) in column_names.iter().enumerate() {
            let rendered = match row.get_ref(idx)? {
                ValueRef::Null => "NULL".to_string(),
                ValueRef::Integer(i) => i.to_string(),
                ValueRef::Real(f) => f.to_string(),
                ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
                ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
            };
            sample_row.push((column.clone(), rendered));
        }
    }

    debug!("Loaded table {} ({} columns, {} rows)", name, columns.len(), row_count);
    Ok(TableSchema {
        name: name.to_string(),
        description: String::new(),
        columns,
        foreign_keys,
        row_count: Some(row_count.max(0) as u64),
        sample_row,
    })
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
