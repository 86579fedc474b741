use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use parlgraph_core::{
    create_embedding_provider, load_config, validate_config, AgentLoop, Canonicalizer,
    ExtractionRun, HybridRetriever, ParlgraphConfig, TwoPassExtractor, TwoPassMode,
    DEFAULT_CONFIG_FILE,
};
use parlgraph_provider::ProviderRegistry;
use parlgraph_store::{EmbeddingProvider, GraphStore, ImportBundle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "parlgraph", version, about = "Knowledge graph and Q&A over parliamentary transcripts")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, help = "Path to the YAML config file")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Validate the config file")]
    Validate,
    #[command(about = "Import videos, speakers, utterances and roster entries from JSON")]
    Import {
        #[arg(help = "JSON file with videos/speakers/utterances/roster arrays")]
        file: PathBuf,
    },
    #[command(about = "Extract graph edges for one video")]
    Extract {
        #[arg(long, help = "YouTube video id")]
        video: String,
        #[arg(long, help = "Second-pass mode: none, always, on_parse_failure, on_low_edge_count, on_violations")]
        two_pass: Option<String>,
    },
    #[command(about = "Recompute edge rank scores")]
    RankEdges,
    #[command(about = "Retrieve a cited subgraph for a query")]
    Retrieve {
        #[arg(help = "Search query")]
        query: String,
        #[arg(long)]
        hops: Option<usize>,
        #[arg(long)]
        seed_k: Option<usize>,
        #[arg(long)]
        max_edges: Option<usize>,
        #[arg(long)]
        max_citations: Option<usize>,
        #[arg(long, help = "Drop edges ranked below this score")]
        rank_threshold: Option<f64>,
    },
    #[command(about = "Ask a question and get a cited answer")]
    Ask {
        #[arg(help = "Question")]
        question: String,
    },
    #[command(about = "Show store counts")]
    Stats,
}

fn init_logging(log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "parlgraph.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Ok(guard)
}

fn open_store(config: &ParlgraphConfig) -> Result<GraphStore> {
    let store = GraphStore::open(&config.store.path)
        .with_context(|| format!("opening store {}", config.store.path))?;
    store.ensure_vec_table(config.embedding.dimensions)?;
    Ok(store)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let config = load_config(&cli.config)?;
    validate_config(&config).with_context(|| format!("invalid config {}", cli.config.display()))?;
    let _guard = init_logging(Path::new(&config.store.log_dir))?;

    match command {
        Commands::Validate => {
            println!(
                "Config valid. {} providers, extraction model {}, agent model {}, {:?} embeddings ({} dims).",
                config.providers.len(),
                config.models.extraction,
                config.models.agent,
                config.embedding.provider,
                config.embedding.dimensions
            );
        }
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let bundle: ImportBundle = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;
            let stats = open_store(&config)?.import(bundle).await?;
            print_json(&stats)?;
        }
        Commands::Extract { video, two_pass } => {
            let stats = run_extraction(&config, &video, two_pass.as_deref()).await?;
            print_json(&stats)?;
        }
        Commands::RankEdges => {
            let ranked = open_store(&config)?.refresh_edge_ranks().await?;
            println!("Ranked {ranked} edges.");
        }
        Commands::Retrieve {
            query,
            hops,
            seed_k,
            max_edges,
            max_citations,
            rank_threshold,
        } => {
            let mut params = config.retrieval_params();
            params.hops = hops.unwrap_or(params.hops);
            params.seed_k = seed_k.unwrap_or(params.seed_k);
            params.max_edges = max_edges.unwrap_or(params.max_edges);
            params.max_citations = max_citations.unwrap_or(params.max_citations);
            params.edge_rank_threshold = rank_threshold.or(params.edge_rank_threshold);

            let store = open_store(&config)?;
            let retriever = HybridRetriever::new(store, embedder(&config), config.retry_policy());
            let result = retriever.retrieve(&query, params).await?;
            print_json(&result)?;
        }
        Commands::Ask { question } => {
            run_ask(&config, &question).await?;
        }
        Commands::Stats => {
            let counts = open_store(&config)?.counts().await?;
            print_json(&counts)?;
        }
    }

    Ok(())
}

fn embedder(config: &ParlgraphConfig) -> Arc<dyn EmbeddingProvider> {
    let embedder = create_embedding_provider(&config.embedding);
    if !embedder.is_semantic() {
        tracing::warn!("stub embeddings configured, vector seeds will not be meaningful");
    }
    embedder
}

async fn run_extraction(
    config: &ParlgraphConfig,
    video: &str,
    two_pass: Option<&str>,
) -> Result<parlgraph_core::RunStats> {
    let registry = ProviderRegistry::from_configs(&config.providers)?;
    let (provider, model) = registry.resolve(&config.models.extraction)?;

    let mut settings = config.extractor_settings();
    if let Some(mode) = two_pass {
        settings.two_pass = mode.parse::<TwoPassMode>()?;
    }

    let store = open_store(config)?;
    let embedder = embedder(config);
    let retry = config.retry_policy();
    let extractor = TwoPassExtractor::new(provider, model, retry.clone(), settings);
    let canonicalizer = Canonicalizer::new(store.clone(), embedder.clone(), retry);
    let run = ExtractionRun::new(store, embedder, extractor, canonicalizer, config.run_settings());
    run.run_video(video).await
}

async fn run_ask(config: &ParlgraphConfig, question: &str) -> Result<()> {
    let registry = ProviderRegistry::from_configs(&config.providers)?;
    let (provider, model) = registry.resolve(&config.models.agent)?;

    let store = open_store(config)?;
    let retriever = HybridRetriever::new(store, embedder(config), config.retry_policy());
    let agent = AgentLoop::new(
        provider,
        model,
        config.retry_policy(),
        Arc::new(retriever),
        config.retrieval_params(),
        config.agent_settings(),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let answer = agent.run(question, &[], &cancel).await;
    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, source) in answer.sources.iter().enumerate() {
            let title = source
                .speaker_title
                .as_deref()
                .map(|t| format!(", {t}"))
                .unwrap_or_default();
            println!(
                "  [{}] {}{} at {}: {}",
                i + 1,
                source.speaker_name,
                title,
                source.timestamp,
                source.youtube_url
            );
        }
    }
    if !answer.followup_questions.is_empty() {
        println!();
        println!("Follow-up questions:");
        for question in &answer.followup_questions {
            println!("  - {question}");
        }
    }
    Ok(())
}
