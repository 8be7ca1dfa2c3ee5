use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use larder_core::config::Config;
use larder_core::ingest::{load_documents, IndexBuilder};
use larder_core::pipeline::QueryPipeline;
use larder_core::provider::HttpProvider;
use larder_core::server::Server;
use larder_core::types::{MetadataFilter, Query};
use larder_core::{Chunker, VectorIndex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "larder")]
#[command(about = "Retrieval-augmented answers over a recipe collection", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Chunk, embed, and index the document collection")]
    Build {
        #[arg(short, long, help = "Documents file (JSON array); defaults to the configured path")]
        documents: Option<PathBuf>,

        #[arg(long, help = "Abort on the first document that fails")]
        strict: bool,

        #[arg(long, default_value_t = 4, help = "Embedding requests in flight at once")]
        concurrency: usize,
    },

    #[command(about = "Ask a question against the indexed collection")]
    Query {
        #[arg(
            help = "The question to answer",
            required_unless_present = "like",
            conflicts_with = "like"
        )]
        question: Option<String>,

        #[arg(long, help = "Answer over recipes similar to this indexed document id")]
        like: Option<String>,

        #[arg(long, help = "Only consider recipes in this category")]
        category: Option<String>,

        #[arg(long, help = "Override the configured number of retrieved chunks")]
        top_k: Option<usize>,
    },

    #[command(about = "Run a file of questions through the pipeline")]
    Batch {
        #[arg(short, long, help = "Questions file (JSON array)")]
        input: PathBuf,

        #[arg(short, long, help = "Where to write the results")]
        output: PathBuf,

        #[arg(long, default_value_t = 2, help = "Questions in flight at once")]
        concurrency: usize,
    },

    #[command(about = "Serve queries over HTTP")]
    Serve {
        #[arg(long, help = "Override the configured bind host")]
        host: Option<String>,

        #[arg(long, help = "Override the configured port")]
        port: Option<u16>,
    },

    #[command(about = "Show the effective configuration")]
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Build {
            documents,
            strict,
            concurrency,
        } => build(&config, documents, strict, concurrency).await,
        Commands::Query {
            question,
            like,
            category,
            top_k,
        } => query(&config, question, like, category, top_k).await,
        Commands::Batch {
            input,
            output,
            concurrency,
        } => batch(&config, &input, &output, concurrency).await,
        Commands::Serve { host, port } => serve(&config, host, port).await,
        Commands::Config => show_config(&config),
    }
}

fn provider(config: &Config) -> Arc<HttpProvider> {
    Arc::new(HttpProvider::new(
        config.embedding.clone(),
        config.generator.clone(),
    ))
}

fn load_pipeline(config: &Config) -> Result<Arc<QueryPipeline>> {
    let index_path = config.data.index_path();
    let index = Arc::new(VectorIndex::load(&index_path).with_context(|| {
        format!(
            "Failed to load index from {} (run 'larder build' first)",
            index_path.display()
        )
    })?);
    index
        .ensure_dimension(config.embedding.dimension)
        .with_context(|| {
            format!(
                "Index at {} was built for a different embedding dimension (re-run 'larder build')",
                index_path.display()
            )
        })?;
    let provider = provider(config);
    Ok(Arc::new(QueryPipeline::new(
        config,
        provider.clone(),
        provider,
        index,
    )))
}

async fn build(
    config: &Config,
    documents: Option<PathBuf>,
    strict: bool,
    concurrency: usize,
) -> Result<ExitCode> {
    let documents_path = documents.unwrap_or_else(|| config.data.documents_path());
    let documents = load_documents(&documents_path)
        .with_context(|| format!("Failed to read documents from {}", documents_path.display()))?;
    println!(
        "{} Indexing {} documents from {}",
        "→".blue(),
        documents.len(),
        documents_path.display()
    );

    let chunker = Chunker::new(config.chunking.max_size, config.chunking.overlap)
        .context("Invalid chunking configuration")?;
    let index = Arc::new(
        VectorIndex::new(config.embedding.dimension)
            .with_chunking(config.chunking.max_size, config.chunking.overlap),
    );
    let builder = IndexBuilder::new(chunker, provider(config), Arc::clone(&index))
        .with_concurrency(concurrency)
        .strict(strict);

    let report = builder.build(&documents).await?;

    let index_path = config.data.index_path();
    if let Some(parent) = index_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    index.save(&index_path)?;

    println!(
        "{} Indexed {} documents ({} chunks) into {}",
        "✓".green().bold(),
        report.documents,
        report.chunks,
        index_path.display()
    );

    if !report.is_clean() {
        println!();
        println!("{}", "Failed documents:".bold().red());
        for failure in &report.failures {
            println!("  {} {}: {}", "✗".red(), failure.doc_id.bold(), failure.error);
        }
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn query(
    config: &Config,
    question: Option<String>,
    like: Option<String>,
    category: Option<String>,
    top_k: Option<usize>,
) -> Result<ExitCode> {
    if top_k == Some(0) {
        anyhow::bail!("--top-k must be greater than zero");
    }
    let pipeline = load_pipeline(config)?;

    let text = match (question, like) {
        (Some(question), None) => question,
        (None, Some(doc_id)) => pipeline
            .retriever()
            .query_text_for_document(&doc_id)
            .with_context(|| format!("Document '{doc_id}' is not in the index"))?,
        _ => anyhow::bail!("Provide a question or --like, not both"),
    };

    let mut query = Query::new(text);
    if let Some(category) = category {
        query = query.with_filter(MetadataFilter::new().with("category", category));
    }
    if let Some(top_k) = top_k {
        query = query.with_top_k(top_k);
    }

    let answer = pipeline.answer(query).await?;

    println!("{}", answer.text);
    println!();
    if !answer.citations.is_empty() {
        println!("{} {}", "Sources:".bold(), answer.citations.join(", ").cyan());
    } else if answer.grounded {
        println!(
            "{} Answered from {} context chunks",
            "•".cyan(),
            answer.context.len()
        );
    } else {
        println!(
            "{}",
            "Not grounded: no matching recipes were found.".yellow()
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Deserialize)]
struct BatchQuestion {
    #[serde(default)]
    id: Option<String>,
    question: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Serialize)]
struct BatchRow {
    id: Option<String>,
    question: String,
    answer: Option<String>,
    citations: Vec<String>,
    grounded: bool,
    error: Option<String>,
}

async fn batch(
    config: &Config,
    input: &Path,
    output: &Path,
    concurrency: usize,
) -> Result<ExitCode> {
    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read questions from {}", input.display()))?;
    let questions: Vec<BatchQuestion> =
        serde_json::from_str(&raw).context("Questions file must be a JSON array")?;
    let pipeline = load_pipeline(config)?;

    println!("{} Answering {} questions", "→".blue(), questions.len());

    let rows: Vec<BatchRow> = futures::stream::iter(questions)
        .map(|item| {
            let pipeline = Arc::clone(&pipeline);
            async move {
                let mut query = Query::new(item.question.clone());
                if let Some(category) = &item.category {
                    query = query.with_filter(MetadataFilter::new().with("category", category.clone()));
                }
                match pipeline.answer(query).await {
                    Ok(answer) => BatchRow {
                        id: item.id,
                        question: item.question,
                        answer: Some(answer.text),
                        citations: answer.citations,
                        grounded: answer.grounded,
                        error: None,
                    },
                    Err(err) => BatchRow {
                        id: item.id,
                        question: item.question,
                        answer: None,
                        citations: Vec::new(),
                        grounded: false,
                        error: Some(err.to_string()),
                    },
                }
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let failures = rows.iter().filter(|row| row.error.is_some()).count();
    let rendered = serde_json::to_string_pretty(&rows)?;
    std::fs::write(output, rendered)
        .with_context(|| format!("Failed to write results to {}", output.display()))?;

    println!(
        "{} Wrote {} results to {} ({} failed)",
        "✓".green().bold(),
        rows.len(),
        output.display(),
        failures
    );
    if failures > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve(config: &Config, host: Option<String>, port: Option<u16>) -> Result<ExitCode> {
    let mut server_config = config.server.clone();
    if let Some(host) = host {
        server_config.host = host;
    }
    if let Some(port) = port {
        server_config.port = port;
    }

    let pipeline = load_pipeline(config)?;
    let addr = server_config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!("{} Serving queries on {}", "→".blue(), addr.bold());
    if server_config.api_key.is_some() {
        println!("  Bearer auth {}", "enabled".green());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nShutting down...");
                shutdown.cancel();
            }
        });
    }

    let server = Server::new(pipeline, server_config.api_key);
    server.run(listener, shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

fn show_config(config: &Config) -> Result<ExitCode> {
    println!("{}", "Current Configuration:".bold().green());
    println!();
    println!("{}", "Data:".bold());
    println!("  Documents:     {}", config.data.documents_path().display());
    println!("  Index:         {}", config.data.index_path().display());
    println!();
    println!("{}", "Chunking:".bold());
    println!("  Max Size:      {}", config.chunking.max_size);
    println!("  Overlap:       {}", config.chunking.overlap);
    println!();
    println!("{}", "Embedding:".bold());
    println!("  Model:         {}", config.embedding.model.cyan());
    println!("  Base URL:      {}", config.embedding.base_url);
    println!("  Dimension:     {}", config.embedding.dimension);
    println!();
    println!("{}", "Generator:".bold());
    println!("  Model:         {}", config.generator.model.cyan());
    println!("  Base URL:      {}", config.generator.base_url);
    println!("  Temperature:   {}", config.generator.temperature);
    println!("  Max Tokens:    {}", config.generator.max_tokens);
    println!();
    println!("{}", "Retrieval:".bold());
    println!("  Top K:         {}", config.retrieval.top_k);
    println!("  Candidates:    {}", config.retrieval.candidates);
    println!("  Rerank Weight: {}", config.retrieval.rerank_weight);
    println!();
    println!("{}", "Context:".bold());
    println!("  Budget:        {} chars", config.context.budget_chars);
    println!();
    println!("{}", "Retry:".bold());
    println!("  Max Attempts:  {}", config.retry.max_attempts);
    println!("  Base Delay:    {} ms", config.retry.base_delay_ms);
    println!("  Timeout:       {} s", config.retry.request_timeout_secs);
    println!();
    println!("{}", "Server:".bold());
    println!("  Bind:          {}", config.server.bind_addr());

    Ok(ExitCode::SUCCESS)
}
