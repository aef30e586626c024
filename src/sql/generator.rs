//! SQL Generator
//!
//! Turns a question plus ranked schema into one candidate statement. The model
//! only proposes; the validator decides.

use crate::error::Result;
use crate::llm::{ModelPort, PromptPurpose};
use crate::query::Intent;
use crate::schema_rag::SchemaContext;
use crate::sql::candidate::SqlCandidate;
use tracing::info;

const SQL_SYSTEM_PROMPT: &str = r#"You are a SQL expert for a manufacturing SQLite database.
Generate a single SQLite-compatible SELECT query to answer the user's question.

CRITICAL SQLite RULES:
- This is SQLite. Do NOT use PostgreSQL or MySQL syntax.
- NO :: casting. Use CAST(x AS TYPE) instead.
- For current date: DATE('now')
- For date arithmetic: DATE('now', '-10 days'), DATE('now', '-1 month')
- For extracting date from datetime: DATE(column_name)
- Dates are stored as TEXT in 'YYYY-MM-DD' format
- Datetimes are stored as TEXT in 'YYYY-MM-DD HH:MM:SS' format
- Use ONLY the tables and columns provided in the schema below
- ONLY generate SELECT statements, never INSERT, UPDATE, DELETE, DROP
- Use proper JOINs when data spans multiple tables, following the join guide
- Use the exact column names from the schema; do not guess columns
- Return ONLY the SQL query, no explanation, no markdown, no code fences

ALIAS RULES:
- When aliasing tables, keep it simple and consistent
- After aliasing, ALWAYS use the alias for ALL column references
- Double-check every column reference matches its table alias
"#;

pub struct SqlGenerator {
    model: ModelPort,
    schema_top_k: usize,
}

impl SqlGenerator {
    pub fn new(model: ModelPort, schema_top_k: usize) -> Self {
        Self { model, schema_top_k }
    }

    /// Ask the model for a statement. `prior_failure` carries the previous
    /// attempt's rejection or execution error so the model can correct it.
    pub async fn propose(
        &self,
        question: &str,
        intent: Intent,
        schema: &SchemaContext,
        prior_failure: Option<&str>,
        attempt: u32,
    ) -> Result<SqlCandidate> {
        let prompt = self.build_prompt(question, intent, schema, prior_failure);
        let response = self
            .model
            .generate(PromptPurpose::GenerateSql, SQL_SYSTEM_PROMPT, &prompt)
            .await?;

        let statement = extract_statement(&response);
        info!("Attempt {} proposed: {}", attempt, statement.replace('\n', " "));
        Ok(SqlCandidate::new(attempt, statement))
    }

    pub fn build_prompt(
        &self,
        question: &str,
        intent: Intent,
        schema: &SchemaContext,
        prior_failure: Option<&str>,
    ) -> String {
        let mut prompt = format!(
            "SCHEMA:\n{}\n\nQUESTION TYPE: {}\nUSER QUESTION: {}",
            schema.render(self.schema_top_k),
            intent,
            question
        );

        if let Some(failure) = prior_failure {
            prompt.push_str(&format!(
                "\n\nPREVIOUS ATTEMPT FAILED WITH ERROR:\n{}\n\nFix the SQL to resolve this error. Return only the corrected SQL query.",
                failure
            ));
        }
        prompt
    }
}

/// Pull the statement out of a model reply: fences, leading prose and
/// trailing semicolons are dropped.
pub fn extract_statement(response: &str) -> String {
    let mut text = response.trim().to_string();

    if text.contains("```") {
        let fenced: Vec<&str> = text
            .lines()
            .skip_while(|l| !l.trim_start().starts_with("```"))
            .skip(1)
            .take_while(|l| !l.trim_start().starts_with("```"))
            .collect();
        if !fenced.is_empty() {
            text = fenced.join("\n");
        } else {
            text = text.replace("```", "");
        }
    }

    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|l| {
            let upper = l.trim_start().to_ascii_uppercase();
            upper.starts_with("SELECT") || upper.starts_with("WITH")
        })
        .unwrap_or(0);

    lines[start..]
        .join("\n")
        .trim()
        .trim_end_matches(';')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedModel, ScriptedReply};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_extract_statement_strips_fences_and_prose() {
        let reply = "Here is the query:\n```sql\nSELECT line_id\nFROM production_orders;\n```\nThis returns lines.";
        assert_eq!(extract_statement(reply), "SELECT line_id\nFROM production_orders");

        let reply = "Sure.\nWITH x AS (SELECT 1) SELECT * FROM x;;";
        assert_eq!(extract_statement(reply), "WITH x AS (SELECT 1) SELECT * FROM x");

        assert_eq!(extract_statement("  SELECT 1  "), "SELECT 1");
    }

    #[tokio::test]
    async fn test_propose_feeds_back_prior_failure() {
        let model = Arc::new(
            ScriptedModel::new().always(PromptPurpose::GenerateSql, ScriptedReply::text("SELECT 1;")),
        );
        let port = ModelPort::new(model.clone(), Duration::from_secs(1), 256);
        let generator = SqlGenerator::new(port, 4);

        let candidate = generator
            .propose(
                "How many orders?",
                Intent::Aggregation,
                &SchemaContext::default(),
                Some("Table 'orders' does not exist in the schema"),
                2,
            )
            .await
            .unwrap();

        assert_eq!(candidate.attempt, 2);
        assert_eq!(candidate.statement, "SELECT 1");
        let prompts = model.prompts_for(PromptPurpose::GenerateSql);
        assert!(prompts[0].contains("PREVIOUS ATTEMPT FAILED WITH ERROR"));
        assert!(prompts[0].contains("Table 'orders' does not exist"));
        assert!(prompts[0].contains("QUESTION TYPE: AGGREGATION"));
    }
}
