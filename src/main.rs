//! support-agent CLI
//!
//! `once` and `watch` poll the inbox; `route`, `show` and `index` are
//! operator tools that need only part of the configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use support_agent::config::{AppConfig, RetrieverConfig, RouterConfig};
use support_agent::knowledge::{EmbeddingConfig, KnowledgeRetriever, VectorConfig, create_embedder, open_index};
use support_agent::llm::create_provider;
use support_agent::mail::{Dispatcher, build_transport};
use support_agent::pipeline::types::{Classification, Urgency};
use support_agent::pipeline::{Classifier, Drafter, EmailPipeline, InboxWorker, route};
use support_agent::store::{ConversationStore, LibSqlBackend};

/// Extra time a running cycle gets to finish after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "support-agent")]
#[command(author, version, about = "AI customer support email agent", long_about = None)]
struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write daily-rolling log files here
    #[arg(long, env = "SUPPORT_AGENT_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process unread email once and exit
    Once,

    /// Poll the inbox until interrupted
    Watch,

    /// Show the routing decision for a classification
    Route {
        #[arg(long, default_value = "low")]
        urgency: Urgency,

        #[arg(long, default_value_t = 0.0)]
        complexity: f32,

        /// Comma-separated sensitive topics
        #[arg(long, value_delimiter = ',')]
        topics: Vec<String>,
    },

    /// Print stored conversation records as JSON
    Show {
        /// Email id; omit to list recent records
        email_id: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Embed a pre-chunked text file and add it to the knowledge index
    Index {
        file: PathBuf,

        /// Document id (defaults to the file name)
        #[arg(long)]
        id: Option<String>,

        /// Source label stored with the chunk
        #[arg(long)]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _log_guard = support_agent::logging::init(
        support_agent::logging::level_for_verbosity(cli.verbose),
        cli.log_dir.as_deref(),
    );

    match cli.command {
        Commands::Once => {
            let config = AppConfig::from_env()?;
            let worker = InboxWorker::new(Arc::new(build_pipeline(&config).await?));
            let summary = worker.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Watch => {
            let config = AppConfig::from_env()?;
            let worker = Arc::new(InboxWorker::new(Arc::new(build_pipeline(&config).await?)));
            let (mut handle, shutdown) = worker.spawn();
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            tracing::info!("Interrupt received, stopping after the current cycle");
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);

            let grace = config.pipeline.poll_interval + SHUTDOWN_GRACE;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!("Inbox worker did not stop in time, aborting");
                handle.abort();
            }
        }
        Commands::Route {
            urgency,
            complexity,
            topics,
        } => {
            let router = RouterConfig::from_env()?;
            let classification = Classification::new("general", urgency, complexity, &topics);
            let decision = route(&classification, &router);
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Show { email_id, limit } => {
            let store = open_store(&db_path()).await?;
            match email_id {
                Some(id) => match store.get(&id).await? {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => anyhow::bail!("no conversation stored for {id}"),
                },
                None => {
                    let records = store.list(limit).await?;
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
            }
        }
        Commands::Index { file, id, source } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let id = match id {
                Some(id) => id,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("file has no name; pass --id")?,
            };
            let retriever = KnowledgeRetriever::new(
                create_embedder(&EmbeddingConfig::from_env()?)?,
                open_index(&VectorConfig::from_env()?).await?,
                RetrieverConfig::from_env()?,
            );
            retriever.upsert_document(&id, &text, source.as_deref()).await?;
            println!("indexed {id}");
        }
    }

    Ok(())
}

fn db_path() -> PathBuf {
    std::env::var("SUPPORT_AGENT_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(support_agent::config::DEFAULT_DB_PATH))
}

async fn open_store(path: &Path) -> anyhow::Result<LibSqlBackend> {
    LibSqlBackend::new_local(path)
        .await
        .with_context(|| format!("opening database at {}", path.display()))
}

async fn build_pipeline(config: &AppConfig) -> anyhow::Result<EmailPipeline> {
    let llm = create_provider(&config.llm)?;
    let embedder = create_embedder(&config.embeddings)?;
    let index = open_index(&config.vector).await?;
    let transport = build_transport(&config.mail)?;
    let store: Arc<dyn ConversationStore> = Arc::new(open_store(&config.db_path).await?);

    tracing::info!(
        model = llm.model_name(),
        embeddings = embedder.model(),
        index = index.backend().as_str(),
        mail = %transport.provider(),
        db = %config.db_path.display(),
        "Pipeline ready"
    );

    Ok(EmailPipeline::new(
        Classifier::new(Arc::clone(&llm), config.classifier.clone()),
        KnowledgeRetriever::new(embedder, index, config.retriever.clone()),
        Drafter::new(llm, config.drafter.clone()),
        config.router.clone(),
        Dispatcher::new(transport, config.dispatch.clone()),
        store,
        config.pipeline.clone(),
    ))
}
