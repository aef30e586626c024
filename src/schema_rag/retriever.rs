//! Schema Retriever
//!
//! Ranks catalog tables against a question. The lexical ranker is the only
//! production implementation; other backends plug in behind [`SchemaRetriever`].

use crate::catalog::{ColumnSchema, ForeignKey, SchemaCatalog, TableSchema};
use crate::error::Result;
use crate::schema_rag::vector_store::{Document, InMemoryVectorStore};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTable {
    pub name: String,
    pub score: f32,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub sample_row: Vec<(String, String)>,
}

impl RankedTable {
    fn from_table(table: &TableSchema, score: f32) -> Self {
        Self {
            name: table.name.clone(),
            score,
            columns: table.columns.clone(),
            foreign_keys: table.foreign_keys.clone(),
            row_count: table.row_count,
            sample_row: table.sample_row.clone(),
        }
    }
}

/// Ranked schema slice handed to SQL generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaContext {
    pub tables: Vec<RankedTable>,
    pub join_guide: Vec<String>,
    /// True when ranking was unavailable and every table is included unranked
    pub degraded: bool,
}

impl SchemaContext {
    /// Every catalog table in declaration order, unscored.
    pub fn all_tables(catalog: &SchemaCatalog) -> Self {
        Self {
            tables: catalog
                .tables
                .iter()
                .map(|t| RankedTable::from_table(t, 0.0))
                .collect(),
            join_guide: catalog.join_paths(),
            degraded: true,
        }
    }

    pub fn position(&self, table: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name.eq_ignore_ascii_case(table))
    }

    /// Tables worth putting in front of the model: the top `top_k` matches,
    /// or everything when nothing matched lexically.
    pub fn prompt_tables(&self, top_k: usize) -> Vec<&RankedTable> {
        let matched: Vec<&RankedTable> = self.tables.iter().filter(|t| t.score > 0.0).take(top_k).collect();
        if matched.is_empty() {
            self.tables.iter().collect()
        } else {
            matched
        }
    }

    pub fn render(&self, top_k: usize) -> String {
        let mut parts = Vec::new();
        for table in self.prompt_tables(top_k) {
            let mut lines = match table.row_count {
                Some(rows) => vec![format!("TABLE: {} ({} rows)", table.name, rows)],
                None => vec![format!("TABLE: {}", table.name)],
            };
            for column in &table.columns {
                let pk = if column.primary_key { " [PK]" } else { "" };
                lines.push(format!("  - {} ({}){}", column.name, column.data_type, pk));
            }
            for fk in &table.foreign_keys {
                lines.push(format!("  FK: {} -> {}.{}", fk.from_column, fk.to_table, fk.to_column));
            }
            if !table.sample_row.is_empty() {
                lines.push(format!(
                    "  Sample row: {}",
                    table.sample_row.iter().map(|(column, value)| format!("{}={}", column, value)).join(", ")
                ));
            }
            parts.push(lines.join("\n"));
        }

        if !self.join_guide.is_empty() {
            parts.push(format!(
                "JOIN GUIDE (use these exact patterns):\n{}",
                self.join_guide.iter().map(|l| format!("- {}", l)).join("\n")
            ));
        }
        parts.join("\n\n")
    }
}

/// Capability: order catalog tables by relevance to a question.
pub trait SchemaRetriever: Send + Sync {
    fn rank(&self, query: &str, catalog: &SchemaCatalog) -> Result<SchemaContext>;
}

/// TF-IDF ranking over table name, column names, description and sample values.
#[derive(Debug, Clone, Default)]
pub struct LexicalRanker;

impl LexicalRanker {
    pub fn new() -> Self {
        Self
    }

    fn document_for(table: &TableSchema) -> Document {
        // the name is repeated so it outweighs any single column
        let text = format!(
            "{} {} {} {} {}",
            table.name,
            table.name,
            table.columns.iter().map(|c| c.name.as_str()).join(" "),
            table.description,
            table.sample_row.iter().map(|(_, value)| value.as_str()).join(" ")
        );
        Document {
            id: table.name.clone(),
            text,
        }
    }
}

impl SchemaRetriever for LexicalRanker {
    fn rank(&self, query: &str, catalog: &SchemaCatalog) -> Result<SchemaContext> {
        let store = InMemoryVectorStore::build(catalog.tables.iter().map(Self::document_for).collect())?;

        let tables: Vec<RankedTable> = store
            .search(query)
            .into_iter()
            .map(|hit| RankedTable::from_table(&catalog.tables[hit.position], hit.score))
            .collect();

        debug!(
            "Ranked {} tables: {}",
            tables.len(),
            tables.iter().map(|t| format!("{}={:.3}", t.name, t.score)).join(", ")
        );

        Ok(SchemaContext {
            tables,
            join_guide: catalog.join_paths(),
            degraded: false,
        })
    }
}
