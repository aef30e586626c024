use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use shopfloor_analyst::catalog::CatalogOverlay;
use shopfloor_analyst::config::AnalystConfig;
use shopfloor_analyst::execution::SqliteExecutor;
use shopfloor_analyst::schema_rag::{LexicalRanker, SchemaRetriever};
use shopfloor_analyst::sql::{DialectNormalizer, SqlValidator};
use shopfloor_analyst::{Orchestrator, Query, SchemaCatalog};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shopfloor-analyst")]
#[command(about = "Ask questions about manufacturing data and get a KPI report")]
struct Args {
    /// SQLite database to query (or set ANALYST_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON file with table descriptions and join hints
    #[arg(long, global = true)]
    overlay: Option<PathBuf>,

    /// Language model provider: ollama or anthropic (or set LLM_PROVIDER)
    #[arg(long, global = true)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline for a question
    Ask {
        question: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the loaded schema catalog
    Schema,
    /// Show how tables rank against a question
    Rank { question: String },
    /// Validate and normalize a statement without running it
    CheckSql { statement: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = AnalystConfig::from_env()?;
    if let Some(provider) = &args.provider {
        config = config.with_provider(provider)?;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(overlay) = args.overlay {
        config.catalog_overlay = Some(overlay);
    }

    let executor = SqliteExecutor::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?
        .with_timeout(config.query_timeout)
        .with_max_rows(config.max_result_rows);

    let mut catalog = executor.with_connection(SchemaCatalog::load)?;
    if let Some(path) = &config.catalog_overlay {
        catalog = catalog.with_overlay(CatalogOverlay::load(path)?);
    }
    let catalog = Arc::new(catalog);
    info!("Loaded {} tables from {}", catalog.tables.len(), config.db_path.display());

    match args.command {
        Command::Ask { question, json } => {
            let orchestrator = Orchestrator::new(
                Arc::clone(&catalog),
                config.model_port(),
                Arc::new(executor),
                Arc::new(LexicalRanker::new()),
                config.pipeline.clone(),
            );
            let report = orchestrator.run(Query::new(question)).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
        }
        Command::Schema => {
            for table in &catalog.tables {
                let rows = table.row_count.map(|n| format!(" ({} rows)", n)).unwrap_or_default();
                println!("{}{}", table.name, rows);
                if !table.description.is_empty() {
                    println!("  {}", table.description);
                }
                println!(
                    "  {}",
                    table.columns.iter().map(|c| format!("{} {}", c.name, c.data_type)).join(", ")
                );
            }
            let joins = catalog.join_paths();
            if !joins.is_empty() {
                println!("\nJoins:");
                for join in joins {
                    println!("  {}", join);
                }
            }
        }
        Command::Rank { question } => {
            let context = LexicalRanker::new().rank(&question, &catalog)?;
            for (position, table) in context.tables.iter().enumerate() {
                println!("{:>2}. {:<24} {:.3}", position + 1, table.name, table.score);
            }
        }
        Command::CheckSql { statement } => {
            let validator = SqlValidator::new(Arc::clone(&catalog)).with_max_chars(config.pipeline.max_statement_chars);
            match validator.check(&statement) {
                Ok(()) => {
                    println!("accepted");
                    println!("{}", DialectNormalizer::new().normalize(&statement));
                }
                Err(reason) => {
                    println!("rejected: {}", reason);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
