//! Row Upload CLI
//!
//! Runs one batch: loads the schema catalog, the plan and a CSV file, then
//! uploads every row and prints the batch report.
//!
//! Usage:
//!   cargo run --features cli --bin row-upload -- \
//!     --schema catalog.yaml \
//!     --plan specimen_plan.yaml \
//!     --rows specimens.csv \
//!     --validate
//!
//!   # Against PostgreSQL, with identity packs for an edit batch
//!   cargo run --features cli,database --bin row-upload -- \
//!     --schema catalog.yaml --plan specimen_plan.yaml --rows edits.csv \
//!     --packs edits_packs.json --scope institution=6f1c...
//!
//! Without `--database-url` the batch runs against an empty in-memory store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use row_upload::identity_pack::load_identity_packs;
use row_upload::schema::loader::load_schema;
use row_upload::source::{missing_columns, read_csv_file};
use row_upload::{
    BatchReport, ClearedRelationshipPolicy, InMemoryStore, RecordStore, UploadConfig, UploadMode,
    UploadPlan, Uploader,
};

/// Upload CSV rows into a relational schema through a mapping plan
#[derive(Parser, Debug)]
#[command(name = "row-upload")]
#[command(about = "Match and upsert CSV rows into a record graph")]
struct Args {
    /// Schema catalog (YAML or JSON)
    #[arg(long)]
    schema: PathBuf,

    /// Mapping plan (YAML or JSON)
    #[arg(long)]
    plan: PathBuf,

    /// CSV file with a header row
    #[arg(long)]
    rows: PathBuf,

    /// JSON array of identity packs, one per row
    #[arg(long)]
    packs: Option<PathBuf>,

    /// Upload configuration file (defaults to ROW_UPLOAD_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Check every row and roll back instead of committing
    #[arg(long)]
    validate: bool,

    /// Batch scope in format table=record-id (can be specified multiple times)
    #[arg(long, value_parser = parse_key_val)]
    scope: Vec<(String, String)>,

    /// What to do with records whose relationship was cleared (hold, delete)
    #[arg(long)]
    cleared_policy: Option<ClearedRelationshipPolicy>,

    /// Acting identity recorded in the audit trail
    #[arg(long)]
    agent: Option<String>,

    /// Stop after the first failed row
    #[arg(long)]
    stop_on_failure: bool,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,

    /// PostgreSQL connection string (needs the `database` feature)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

/// Parse key=value pairs from command line
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: {}", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let schema = Arc::new(
        load_schema(&args.schema)
            .with_context(|| format!("Failed to load schema {}", args.schema.display()))?,
    );
    let plan = Arc::new(
        UploadPlan::from_file(&schema, &args.plan)
            .with_context(|| format!("Failed to load plan {}", args.plan.display()))?,
    );
    let rows = read_csv_file(&args.rows)
        .with_context(|| format!("Failed to read rows {}", args.rows.display()))?;
    missing_columns(&plan, &rows);

    let packs = match &args.packs {
        Some(path) => Some(
            load_identity_packs(path)
                .with_context(|| format!("Failed to read identity packs {}", path.display()))?,
        ),
        None => None,
    };

    let store = open_store(&args, &schema).await?;
    let uploader = Uploader::new(schema, plan, store, config);
    let report = uploader
        .run(&rows, packs.as_deref())
        .await
        .context("Upload failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report, uploader.config().mode);
    }

    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn build_config(args: &Args) -> Result<UploadConfig> {
    let mut config = match &args.config {
        Some(path) => UploadConfig::from_file(path)?.with_overrides(|key| std::env::var(key).ok())?,
        None => UploadConfig::from_env()?,
    };
    if args.validate {
        config.mode = UploadMode::Validate;
    }
    if let Some(policy) = args.cleared_policy {
        config.cleared_relationship_policy = policy;
    }
    if let Some(agent) = &args.agent {
        config.agent = agent.clone();
    }
    if args.stop_on_failure {
        config.stop_on_failed_row = true;
    }
    config.scope.extend(args.scope.iter().cloned());
    Ok(config)
}

#[cfg(feature = "database")]
async fn open_store(
    args: &Args,
    schema: &Arc<row_upload::Schema>,
) -> Result<Arc<dyn RecordStore>> {
    if let Some(url) = &args.database_url {
        let store = row_upload::PgRecordStore::connect(url, schema.clone())
            .await
            .context("Failed to connect to database")?;
        store.ensure_tables().await.context("Failed to prepare tables")?;
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(InMemoryStore::new(schema)))
}

#[cfg(not(feature = "database"))]
async fn open_store(
    args: &Args,
    schema: &Arc<row_upload::Schema>,
) -> Result<Arc<dyn RecordStore>> {
    if args.database_url.is_some() {
        anyhow::bail!("row-upload was built without the `database` feature");
    }
    Ok(Arc::new(InMemoryStore::new(schema)))
}

fn print_summary(report: &BatchReport, mode: UploadMode) {
    println!("Mode: {}", mode);
    println!(
        "Rows: {} ({} committed, {} failed)",
        report.rows.len(),
        report.committed_rows,
        report.failed_rows
    );
    for (label, count) in &report.counts {
        println!("  {:<22} {}", label, count);
    }
    for row in report.rows.iter().filter(|row| row.is_failure()) {
        match &row.failure {
            Some(failure) => println!("Row {}: {:?}", row.row_index, failure),
            None => println!("Row {}: {}", row.row_index, row.result.outcome.label()),
        }
    }
    if report.cancelled {
        println!("Batch stopped before the last row");
    }
}
