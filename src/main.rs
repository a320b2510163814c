use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use prospect::config::{resolve_db_path, EnrichConfig, RunMode};
use prospect::llm::AnthropicClient;
use prospect::model::Company;
use prospect::pipeline::{Pipeline, SourceSet};
use prospect::questions::load_questions_or_default;
use prospect::registry::FieldRegistry;
use prospect::resilience::{BreakerConfig, BreakerRegistry, Envelope, RetryPolicy};
use prospect::sources::HttpCrawler;
use prospect::store::SqliteStore;

#[derive(Parser)]
#[command(name = "prospect")]
#[command(version, about = "Company enrichment pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to prospect.toml. Defaults to the current directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the store database. Defaults to the platform data dir.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Enrich one company by URL, or a CSV of companies
    Enrich {
        /// Company URL, or a path to a CSV file (url[,name[,city[,state]]])
        input: String,
        /// Run mode: full or sourcing
        #[arg(long, default_value = "full")]
        mode: RunMode,
        /// Bypass the batch API; send every request directly
        #[arg(long)]
        no_batch: bool,
        /// Ignore persisted answers and re-extract everything
        #[arg(long)]
        force_reextract: bool,
        /// Questions file (defaults to the compiled-in set)
        #[arg(long)]
        questions: Option<PathBuf>,
    },
    /// List the loaded question set
    Questions {
        #[arg(long)]
        questions: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Enrich {
            input,
            mode,
            no_batch,
            force_reextract,
            questions,
        } => {
            cmd_enrich(
                &cli,
                input,
                *mode,
                *no_batch,
                *force_reextract,
                questions.as_deref(),
            )
            .await?;
        }
        Commands::Questions { questions } => {
            cmd_questions(questions.as_deref())?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if verbose { "prospect=debug" } else { "prospect=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli, mode: RunMode, no_batch: bool, force_reextract: bool) -> Result<EnrichConfig> {
    let mut config = match &cli.config {
        Some(path) => EnrichConfig::load(path)?,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            EnrichConfig::load_or_default(&cwd)?
        }
    };
    config.mode = mode;
    config.no_batch = no_batch;
    config.force_reextract = force_reextract;

    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }
    Ok(config)
}

async fn cmd_enrich(
    cli: &Cli,
    input: &str,
    mode: RunMode,
    no_batch: bool,
    force_reextract: bool,
    questions_file: Option<&std::path::Path>,
) -> Result<()> {
    let config = Arc::new(load_config(cli, mode, no_batch, force_reextract)?);
    let questions = load_questions_or_default(questions_file)?;

    let llm = Arc::new(AnthropicClient::from_env()?);
    let store = Arc::new(SqliteStore::new(&resolve_db_path(cli.db.clone()))?);
    let envelope = Envelope::new(
        RetryPolicy::default(),
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
    );
    let sources = SourceSet {
        crawler: Some(Arc::new(HttpCrawler::new(config.budgets.crawl_concurrency))),
        ..Default::default()
    };

    let pipeline = Pipeline {
        config,
        registry: Arc::new(FieldRegistry::default()),
        questions,
        llm,
        envelope,
        sources,
        adv_prefill: None,
        run_store: store.clone(),
        checkpoints: store.clone(),
        page_cache: store.clone(),
        answer_store: store,
        sink: None,
    };

    let companies = parse_input(input)?;
    let total = companies.len();
    let mut failures = 0usize;

    for company in companies {
        let url = company.url.clone();
        match pipeline.run(company).await {
            Ok(outcome) => {
                println!("{}", outcome.report);
                println!(
                    "{} {} (score {:.2}, ${:.4})",
                    style("✓").green().bold(),
                    url,
                    outcome.quality_score,
                    outcome.total_cost
                );
                if outcome.write_intent.is_some() {
                    tracing::debug!(company = %url, "record write deferred (no sink configured)");
                }
            }
            Err(err) => {
                failures += 1;
                eprintln!("{} {}: {err}", style("✗").red().bold(), url);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {total} runs failed");
    }
    Ok(())
}

/// A URL argument enriches one company; a .csv path enriches each row.
fn parse_input(input: &str) -> Result<Vec<Company>> {
    if !input.ends_with(".csv") {
        return Ok(vec![Company::new(input)]);
    }

    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read CSV file: {input}"))?;
    let mut companies = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Tolerate a header row.
        if i == 0 && line.to_lowercase().starts_with("url") {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let Some(url) = fields.next().filter(|u| !u.is_empty()) else {
            continue;
        };
        let mut company = Company::new(url);
        company.name = fields.next().filter(|s| !s.is_empty()).map(String::from);
        company.city = fields.next().filter(|s| !s.is_empty()).map(String::from);
        company.state = fields.next().filter(|s| !s.is_empty()).map(String::from);
        companies.push(company);
    }
    if companies.is_empty() {
        anyhow::bail!("No companies found in {input}");
    }
    Ok(companies)
}

fn cmd_questions(questions_file: Option<&std::path::Path>) -> Result<()> {
    let questions = load_questions_or_default(questions_file)?;
    println!("{} questions loaded:\n", questions.len());
    for q in &questions {
        println!(
            "  {} {} (tier {}, P{})",
            style(&q.id).cyan().bold(),
            q.text,
            q.tier,
            q.priority
        );
        println!("      fields: {}", q.field_keys);
        println!(
            "      pages: {}",
            q.page_types
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}
