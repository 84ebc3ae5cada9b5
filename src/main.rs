//! Retrieval evaluation CLI
//!
//! Scores search index results for a query set with an LLM judge.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use retrieval_eval::{
    config::Config,
    context::ContextAssembler,
    judge::{JudgeWithBackoff, LlmJudge},
    query::{QuerySet, sample_queries},
    report::{DEFAULT_REPORT_FILENAME, EvaluationReport},
    retriever::{SearchIndexClient, decode_source_url},
    runner::EvaluationRunner,
    sanitize::Sanitizer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Retrieval evaluation - rates search results with an LLM judge
#[derive(Parser)]
#[command(name = "retrieval-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evaluation over a query set
    Run {
        /// Query file (.json, .yaml or one query per line)
        #[arg(short, long)]
        queries: Option<PathBuf>,

        /// Documents retrieved per query
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Queries evaluated at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Abandon the run after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Evaluate only the first N queries
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output path for the JSON report
        #[arg(short, long, default_value = DEFAULT_REPORT_FILENAME)]
        output: PathBuf,
    },

    /// Validate configuration and test the judge connection
    Check,

    /// Decode chunk ids and fetch the chunks from the index
    Inspect {
        /// Chunk ids as stored in the index
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Print the summary of a saved report
    Show {
        /// Path to the report file
        #[arg(default_value = DEFAULT_REPORT_FILENAME)]
        report: PathBuf,

        /// Also print every record
        #[arg(long)]
        records: bool,

        /// Also write the records as CSV to this path
        #[arg(long, value_name = "OUT")]
        csv: Option<PathBuf>,
    },

    /// Convert a saved report to CSV
    Export {
        /// Path to the report file
        #[arg(default_value = DEFAULT_REPORT_FILENAME)]
        report: PathBuf,

        /// Output path for the CSV file
        #[arg(long, value_name = "OUT")]
        csv: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run {
            queries,
            top_k,
            concurrency,
            timeout,
            limit,
            output,
        } => {
            let options = RunOptions {
                queries,
                top_k,
                concurrency,
                timeout,
                limit,
                output,
            };
            let succeeded = cmd_run(config_path, options).await?;
            if !succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Check => cmd_check(config_path).await,
        Commands::Inspect { ids } => cmd_inspect(config_path, ids).await,
        Commands::Show {
            report,
            records,
            csv,
        } => cmd_show(report, records, csv),
        Commands::Export { report, csv } => cmd_export(report, csv),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

struct RunOptions {
    queries: Option<PathBuf>,
    top_k: Option<usize>,
    concurrency: Option<usize>,
    timeout: Option<u64>,
    limit: Option<usize>,
    output: PathBuf,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

/// Returns whether at least one query received a verdict.
async fn cmd_run(config_path: Option<&Path>, options: RunOptions) -> Result<bool> {
    println!("Loading configuration...");
    let mut config = load_config(config_path)?;

    if let Some(top_k) = options.top_k {
        config.evaluation.top_k = top_k;
    }
    if let Some(concurrency) = options.concurrency {
        config.evaluation.concurrency = concurrency;
    }
    if options.timeout.is_some() {
        config.evaluation.run_timeout_secs = options.timeout;
    }
    config.validate().context("Invalid configuration")?;

    let mut queries = match &options.queries {
        Some(path) => QuerySet::load(path).context("Failed to load queries")?,
        None if !config.queries.is_empty() => QuerySet::from_texts("config", &config.queries),
        None => sample_queries(),
    };
    if let Some(limit) = options.limit {
        queries = queries.take(limit);
    }

    println!("Search index: {}", config.search.index);
    println!("Judge deployment: {}", config.judge.deployment);
    println!(
        "Evaluating {} queries (top {}, {} at a time)...",
        queries.len(),
        config.evaluation.top_k,
        config.evaluation.concurrency
    );

    let retriever =
        SearchIndexClient::new(config.search.clone()).context("Failed to create search client")?;
    let judge = LlmJudge::from_config(config.judge.clone()).context("Failed to create judge")?;
    let sanitizer = Sanitizer::new(&config.sanitizer).context("Invalid sanitizer patterns")?;
    let assembler = ContextAssembler::new(sanitizer, config.evaluation.separator.clone());

    let runner = EvaluationRunner::new(
        Arc::new(retriever),
        Arc::new(JudgeWithBackoff::new(judge, config.retry)),
        assembler,
        config.evaluation.clone(),
    )?;

    let report = runner.run(&queries).await;

    report.print_records();
    report.print_summary();

    report
        .save_json(&options.output)
        .context("Failed to save report")?;
    println!("Report saved to: {}", options.output.display());

    if !report.has_successes() {
        eprintln!("No query received a verdict.");
    }

    Ok(report.has_successes())
}

async fn cmd_check(config_path: Option<&Path>) -> Result<()> {
    println!("Checking configuration...\n");

    let config = load_config(config_path)?;

    println!("Configuration:");
    println!("  Search endpoint:  {}", config.search.endpoint);
    println!("  Search index:     {}", config.search.index);
    println!("  Judge provider:   {:?}", config.judge.provider);
    println!("  Judge endpoint:   {}", config.judge.endpoint);
    println!("  Judge deployment: {}", config.judge.deployment);
    println!();

    if let Err(e) = config.validate() {
        anyhow::bail!("Configuration error: {}", e);
    }

    let judge = LlmJudge::from_config(config.judge).context("Failed to create judge")?;

    println!("Sending test request...");
    match judge.check_connection().await {
        Ok(reply) if reply.to_lowercase().contains("hello") => {
            println!("Connection successful!");
        }
        Ok(reply) => {
            anyhow::bail!(
                "Connected, but the judge answered unexpectedly: {}",
                reply.trim()
            );
        }
        Err(e) => {
            anyhow::bail!("Connection failed: {}", e);
        }
    }

    Ok(())
}

async fn cmd_inspect(config_path: Option<&Path>, ids: Vec<String>) -> Result<()> {
    let config = load_config(config_path)?;
    if config.search.endpoint.is_empty() || config.search.index.is_empty() {
        anyhow::bail!("Search endpoint and index are required. Set AZURE_SEARCH_ENDPOINT and AZURE_SEARCH_INDEX.");
    }

    let client = SearchIndexClient::new(config.search).context("Failed to create search client")?;

    for id in &ids {
        println!("\n{}", "─".repeat(60));
        println!("Chunk: {}", id);

        match decode_source_url(id) {
            Some(url) => println!("  Source URL: {}", url),
            None => println!("  Source URL: (not encoded in id)"),
        }

        let chunk = client
            .lookup(id)
            .await
            .with_context(|| format!("Failed to fetch chunk '{}'", id))?;

        let Some(chunk) = chunk else {
            println!("  Not found in index '{}'", client.index_name());
            continue;
        };

        let doc = &chunk.document;
        if chunk.matched_by.is_approximate() {
            println!("  Match:   approximate (top search hit for the source file name)");
        }
        println!("  Title:   {}", doc.title.as_deref().unwrap_or("N/A"));
        println!("  Length:  {} chars", doc.content.chars().count());
        println!("  Fields:  {}", chunk.fields.join(", "));
        println!("  Content:");
        for line in doc.content.lines() {
            println!("    {}", line);
        }
    }

    println!("{}", "─".repeat(60));
    Ok(())
}

fn load_report(report_path: &Path) -> Result<EvaluationReport> {
    if !report_path.exists() {
        anyhow::bail!(
            "Report not found at '{}'. Run the 'run' command first.",
            report_path.display()
        );
    }

    EvaluationReport::load_json(report_path).context("Failed to load report")
}

fn write_csv(report: &EvaluationReport, out: &Path) -> Result<()> {
    report
        .save_csv(out)
        .with_context(|| format!("Failed to write CSV to '{}'", out.display()))?;
    println!("CSV saved to: {}", out.display());
    Ok(())
}

fn cmd_show(report_path: PathBuf, records: bool, csv: Option<PathBuf>) -> Result<()> {
    let report = load_report(&report_path)?;

    if records {
        report.print_records();
    }
    report.print_summary();

    if let Some(out) = csv {
        write_csv(&report, &out)?;
    }

    Ok(())
}

fn cmd_export(report_path: PathBuf, out: PathBuf) -> Result<()> {
    let report = load_report(&report_path)?;
    println!("Converting {} records...", report.records.len());
    write_csv(&report, &out)
}
