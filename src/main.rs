//! # ragline CLI
//!
//! ```bash
//! ragline --config ./config/ragline.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline init` | Create the SQLite vector store schema |
//! | `ragline serve` | Start the HTTP + voice WebSocket server |
//! | `ragline ingest <file>` | Chunk and index a text file for a tenant |
//! | `ragline ask "<question>"` | One-shot grounded answer |
//! | `ragline status` | Providers, cache and retrieval settings |
//!
//! ## Examples
//!
//! ```bash
//! ragline init
//! ragline ingest --tenant acme --document handbook ./docs/handbook.md
//! ragline ask --tenant acme --user alice "What is the refund policy?"
//! ragline serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ragline::chunk::DEFAULT_CHUNK_CHARS;
use ragline::config::{self, Config};
use ragline::ingest::{run_ingest, IngestOptions};
use ragline::migrate;
use ragline::models::Identity;
use ragline::server;
use ragline::service::ServiceContext;

/// Multi-tenant grounded answers over your documents, with provider
/// failover and voice sessions.
///
/// All commands accept `--config`. See `config/ragline.example.toml`.
#[derive(Parser)]
#[command(
    name = "ragline",
    about = "ragline: grounded-answer query service with circuit-broken LLM routing",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the SQLite vector store schema.
    ///
    /// Idempotent. Only needed for `[store].backend = "sqlite"`.
    Init,

    /// Start the HTTP and voice WebSocket server on `[server].bind`.
    Serve,

    /// Chunk a text file and index it for one tenant.
    Ingest {
        /// Tenant that owns the document.
        #[arg(long)]
        tenant: String,

        /// Document id (defaults to the file stem).
        #[arg(long)]
        document: Option<String>,

        /// Maximum characters per chunk.
        #[arg(long, default_value_t = DEFAULT_CHUNK_CHARS)]
        max_chars: usize,

        /// Show chunk counts without indexing.
        #[arg(long)]
        dry_run: bool,

        file: PathBuf,
    },

    /// Answer one question and exit.
    Ask {
        #[arg(long)]
        tenant: String,

        #[arg(long, default_value = "cli")]
        user: String,

        question: String,
    },

    /// Print provider breakers, cache counters and retrieval settings.
    Status {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(cfg: &Config) {
    // RUST_LOG wins over the configured filter.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| cfg.logging.filter.clone().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Vector store initialized at {}.", cfg.store.path.display());
        }
        Commands::Serve => {
            let ctx = Arc::new(ServiceContext::from_config(cfg).await?);
            server::run_server(ctx).await?;
        }
        Commands::Ingest {
            tenant,
            document,
            max_chars,
            dry_run,
            file,
        } => {
            if cfg.store.backend == "memory" && !dry_run {
                eprintln!("warning: [store].backend is \"memory\"; indexed chunks are discarded on exit");
            }
            let ctx = ServiceContext::from_config(cfg).await?;
            let opts = IngestOptions {
                tenant: &tenant,
                document_id: document.as_deref(),
                max_chars,
                dry_run,
            };
            run_ingest(&ctx.orchestrator, &file, opts).await?;
        }
        Commands::Ask {
            tenant,
            user,
            question,
        } => {
            let ctx = ServiceContext::from_config(cfg).await?;
            let answer = ctx
                .orchestrator
                .answer(&Identity::new(tenant, user), &question)
                .await?;

            println!("{}", answer.answer_text);
            if !answer.sources.is_empty() {
                println!();
                println!("Sources:");
                for (i, source) in answer.sources.iter().enumerate() {
                    println!(
                        "  {}. {} [{}] (score: {:.2})",
                        i + 1,
                        source.document_ref,
                        source.chunk_id,
                        source.score
                    );
                }
            }
            println!();
            println!(
                "provider: {}  tokens: {} in / {} out  latency: {} ms{}",
                answer.provider,
                answer.tokens_in,
                answer.tokens_out,
                answer.latency_ms,
                if answer.cached { "  (cached)" } else { "" }
            );
        }
        Commands::Status { json } => {
            let ctx = ServiceContext::from_config(cfg).await?;
            let status = ctx.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!("ragline {}", status.version);
            println!();
            println!("Providers (priority order):");
            for p in &status.providers {
                println!(
                    "  {:<16} {:?}  failures {}/{}  reset {} ms",
                    p.name, p.state, p.consecutive_failures, p.failure_threshold, p.reset_timeout_ms
                );
            }
            let r = &status.retrieval;
            println!();
            println!("Retrieval:");
            println!("  store: {}", r.store);
            println!("  embedding: {} ({} dims)", r.embedding_model, r.dims);
            println!("  default_k: {}", r.default_k);
            println!("  max_context_chars: {}", r.max_context_chars);
            println!("  require_grounding: {}", r.require_grounding);
            match r.indexed_chunks {
                Some(n) => println!("  indexed chunks: {}", n),
                None => println!("  indexed chunks: unavailable"),
            }
            println!();
            println!("Speech-to-text: {}", status.stt);
        }
    }

    Ok(())
}
