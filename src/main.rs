//! # factgate CLI
//!
//! The `factgate` binary is the operator interface for the knowledge core.
//! It provides commands for database initialization, fact ingestion, hybrid
//! search, the verification review queue, session fact lifecycle, and
//! starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! factgate --config ./factgate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `factgate init` | Create the SQLite database and run schema migrations |
//! | `factgate ingest "<text>"` | Ingest a fact from inline text, a URL, or a file |
//! | `factgate search "<query>"` | Hybrid keyword + vector search |
//! | `factgate ask "<question>"` | Retrieval-augmented answer synthesis |
//! | `factgate pending list` | Review queue, oldest first |
//! | `factgate pending approve <id>...` | Approve pending facts |
//! | `factgate pending reject <id>...` | Reject pending facts |
//! | `factgate session list <id>` | Facts attached to a session |
//! | `factgate session resolve <id>` | End-of-session cleanup |
//! | `factgate config show` | Effective verification config |
//! | `factgate serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use factgate::config;
use factgate::ingest::{self, FactSource, IngestParams, NewFactMeta};
use factgate::migrate;
use factgate::models::{
    AccessLevel, AuthScope, FileAction, RagQuery, SearchQuery, VerificationConfig,
};
use factgate::provider::{create_provider, ModelProvider};
use factgate::search::{self, SearchParams};
use factgate::server::{self, AppState};
use factgate::session;
use factgate::store::sqlite::SqliteStore;
use factgate::store::FactStore;
use factgate::verify;

/// factgate — a knowledge store with provenance gating and hybrid retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Database, retrieval, provider, and server settings are read from it.
#[derive(Parser)]
#[command(
    name = "factgate",
    about = "factgate — a knowledge store with provenance gating and hybrid retrieval",
    version,
    long_about = "factgate stores discrete facts with access attributes, gates them through a \
    verification queue before they become retrievable, and serves hybrid (keyword + vector) \
    search plus retrieval-augmented answers via a CLI and an HTTP JSON API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./factgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (facts,
    /// fact_vectors, facts_fts, settings). Idempotent — running it multiple
    /// times is safe.
    Init,

    /// Ingest a fact.
    ///
    /// Content comes from inline text, `--url`, or `--file` (exactly one).
    /// The fact lands in the pending review queue unless its source label
    /// is configured for auto-approval.
    Ingest {
        /// Inline fact content.
        text: Option<String>,

        /// Fetch content from this URL instead.
        #[arg(long, conflicts_with = "file")]
        url: Option<String>,

        /// Read content from this file instead.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Optional display title.
        #[arg(long)]
        title: Option<String>,

        /// Category (default `general`).
        #[arg(long)]
        category: Option<String>,

        /// Comma-separated tags.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Access level: `private`, `shared`, or `public`.
        #[arg(long)]
        access: Option<String>,

        /// Attach the fact to a session ledger.
        #[arg(long)]
        session: Option<String>,
    },

    /// Search stored facts with the hybrid engine.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,

        /// Filter to these categories.
        #[arg(long, value_delimiter = ',')]
        category: Vec<String>,

        /// Filter to facts carrying any of these tags.
        #[arg(long, value_delimiter = ',')]
        tag: Vec<String>,

        /// Include facts still awaiting review.
        #[arg(long)]
        pending: bool,

        /// Apply the secondary reranking pass.
        #[arg(long)]
        rerank: bool,

        /// Print the scoring breakdown per result.
        #[arg(long)]
        explain: bool,
    },

    /// Ask a question and synthesize an answer from stored facts.
    ///
    /// Requires a configured model provider.
    Ask {
        /// The question.
        query: String,

        /// Let the provider reformulate the query before retrieval.
        #[arg(long)]
        reformulate: bool,
    },

    /// Manage the verification review queue.
    Pending {
        #[command(subcommand)]
        action: PendingAction,
    },

    /// Manage session-derived facts.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Show or update the verification configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum PendingAction {
    /// List pending facts, oldest first.
    List {
        /// 1-based page number.
        #[arg(long, default_value_t = 1)]
        page: i64,

        /// Page size override.
        #[arg(long)]
        page_size: Option<i64>,
    },

    /// Approve one or more pending facts.
    Approve {
        /// Fact ids.
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Reject one or more pending facts.
    Reject {
        /// Fact ids.
        #[arg(required = true)]
        ids: Vec<String>,

        /// Hard-delete instead of retaining the rejected record.
        #[arg(long)]
        delete: bool,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List the facts attached to a session.
    List {
        /// Session id.
        id: String,
    },

    /// Flag a session fact for preservation (or clear with --unset).
    Preserve {
        /// Session id.
        id: String,

        /// Fact id.
        fact_id: String,

        /// Clear the flag instead of setting it.
        #[arg(long)]
        unset: bool,
    },

    /// Resolve a session: delete non-preserved facts, keep the rest.
    Resolve {
        /// Session id.
        id: String,

        /// What to do with session attachments: `delete`, `transfer_kb`,
        /// or `transfer_shared`.
        #[arg(long, default_value = "delete")]
        file_action: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective verification configuration.
    Show,

    /// Update the verification configuration.
    Set {
        /// Comma-separated source labels that skip review.
        #[arg(long, value_delimiter = ',')]
        auto_approve_sources: Option<Vec<String>>,

        /// Hard-delete rejected facts by default.
        #[arg(long)]
        delete_on_reject: Option<bool>,

        /// Default review-queue page size.
        #[arg(long)]
        page_size: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let store = SqliteStore::connect(&cfg.db).await?;
        migrate::run_migrations(store.pool()).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let sqlite = SqliteStore::connect(&cfg.db).await?;
    migrate::run_migrations(sqlite.pool()).await?;
    let store: Arc<dyn FactStore> = Arc::new(sqlite);
    let provider: Arc<dyn ModelProvider> = Arc::from(create_provider(&cfg.provider)?);
    let search_params = SearchParams::from_config(&cfg.retrieval, &cfg.provider);
    let ingest_params = IngestParams::from_config(&cfg.provider);
    let defaults = cfg.verification.to_verification_config();
    let scope = AuthScope::system();

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Serve => {
            let state = AppState {
                store,
                provider,
                search_params,
                ingest_params,
                verification_defaults: defaults,
            };
            server::serve(&cfg, state).await?;
        }
        Commands::Ingest {
            text,
            url,
            file,
            title,
            category,
            tags,
            access,
            session,
        } => {
            let source = match (text, url, file) {
                (Some(t), None, None) => FactSource::Text(t),
                (None, Some(u), None) => FactSource::Url(u),
                (None, None, Some(f)) => FactSource::File(f),
                _ => anyhow::bail!("provide exactly one of <text>, --url, or --file"),
            };
            let access_level = access
                .as_deref()
                .map(str::parse::<AccessLevel>)
                .transpose()?;
            let meta = NewFactMeta {
                title,
                category,
                tags,
                access_level,
                session_id: session,
                ..NewFactMeta::default()
            };
            let vcfg = verify::get_config(store.as_ref(), &defaults).await?;
            let outcome = ingest::ingest(
                store.as_ref(),
                provider.as_ref(),
                &scope,
                source,
                meta,
                &vcfg,
                &ingest_params,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Search {
            query,
            limit,
            category,
            tag,
            pending,
            rerank,
            explain,
        } => {
            let q = SearchQuery {
                text: query,
                limit,
                categories: category,
                tags: tag,
                include_pending: pending,
                enable_reranking: rerank,
                explain,
            };
            let resp =
                search::search(store.as_ref(), provider.as_ref(), &scope, &q, &search_params)
                    .await?;
            if resp.degraded {
                eprintln!("note: vector channel unavailable, results are keyword-only");
            }
            if resp.results.is_empty() {
                println!("No results.");
            }
            for (i, r) in resp.results.iter().enumerate() {
                let title = r.title.as_deref().unwrap_or("(untitled)");
                println!(
                    "{:2}. [{:.3}] {} ({} / {} / {})",
                    i + 1,
                    r.score,
                    title,
                    r.id,
                    r.category,
                    r.state.as_str()
                );
                if !r.snippet.is_empty() {
                    println!("      {}", r.snippet.replace('\n', " "));
                }
                if let Some(ref e) = r.explain {
                    println!(
                        "      keyword={:.3} vector={:.3} alpha={:.2} solo_discount={} reranked={}",
                        e.keyword_score, e.vector_score, e.alpha, e.solo_discount_applied, e.reranked
                    );
                }
            }
        }
        Commands::Ask { query, reformulate } => {
            let rag = RagQuery {
                query: SearchQuery {
                    text: query,
                    limit: None,
                    categories: Vec::new(),
                    tags: Vec::new(),
                    include_pending: false,
                    enable_reranking: false,
                    explain: false,
                },
                reformulate,
            };
            let answer = search::rag_search(
                store.as_ref(),
                provider.as_ref(),
                &scope,
                &rag,
                &search_params,
            )
            .await?;
            if let Some(ref rq) = answer.reformulated_query {
                eprintln!("note: query reformulated to: {}", rq);
            }
            if answer.low_confidence {
                eprintln!("note: low confidence — little or no grounding material was found");
            }
            println!("{}", answer.answer);
            if !answer.sources_used.is_empty() {
                println!("\nSources: {}", answer.sources_used.join(", "));
            }
        }
        Commands::Pending { action } => match action {
            PendingAction::List { page, page_size } => {
                let vcfg = verify::get_config(store.as_ref(), &defaults).await?;
                let listing =
                    verify::list_pending(store.as_ref(), page, page_size, &vcfg).await?;
                println!(
                    "{} pending fact(s), page {}/{}",
                    listing.total, listing.page, listing.total_pages
                );
                for f in &listing.facts {
                    let title = f.title.as_deref().unwrap_or("(untitled)");
                    println!("  {}  {}  [{} / {}]", f.id, title, f.source, f.category);
                }
            }
            PendingAction::Approve { ids } => {
                if ids.len() == 1 {
                    let outcome =
                        verify::approve(store.as_ref(), &ids[0], &scope.principal).await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    let outcome =
                        verify::bulk_approve(Arc::clone(&store), ids, &scope.principal).await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
            }
            PendingAction::Reject { ids, delete } => {
                let vcfg = verify::get_config(store.as_ref(), &defaults).await?;
                let delete = delete.then_some(true);
                if ids.len() == 1 {
                    let outcome = verify::reject(
                        store.as_ref(),
                        &ids[0],
                        &scope.principal,
                        delete,
                        &vcfg,
                    )
                    .await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    let outcome = verify::bulk_reject(
                        Arc::clone(&store),
                        ids,
                        &scope.principal,
                        delete,
                        &vcfg,
                    )
                    .await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
            }
        },
        Commands::Session { action } => match action {
            SessionAction::List { id } => {
                let records = session::list_session_facts(store.as_ref(), &id).await?;
                if records.is_empty() {
                    println!("No facts for session {}.", id);
                }
                for r in &records {
                    let mark = if r.preserve { "*" } else { " " };
                    println!("{} {}  {}", mark, r.fact_id, r.content.replace('\n', " "));
                }
            }
            SessionAction::Preserve { id, fact_id, unset } => {
                session::set_preserve(store.as_ref(), &id, &fact_id, !unset).await?;
                println!(
                    "Fact {} {} preservation.",
                    fact_id,
                    if unset { "cleared from" } else { "flagged for" }
                );
            }
            SessionAction::Resolve { id, file_action } => {
                let action: FileAction = file_action.parse()?;
                let resolution =
                    session::resolve_session(Arc::clone(&store), &id, action).await?;
                println!("{}", serde_json::to_string_pretty(&resolution)?);
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let vcfg = verify::get_config(store.as_ref(), &defaults).await?;
                println!("{}", serde_json::to_string_pretty(&vcfg)?);
            }
            ConfigAction::Set {
                auto_approve_sources,
                delete_on_reject,
                page_size,
            } => {
                let current = verify::get_config(store.as_ref(), &defaults).await?;
                let updated = VerificationConfig {
                    auto_approve_sources: auto_approve_sources
                        .unwrap_or(current.auto_approve_sources),
                    delete_on_reject: delete_on_reject.unwrap_or(current.delete_on_reject),
                    page_size: page_size.unwrap_or(current.page_size),
                };
                verify::update_config(store.as_ref(), &updated).await?;
                println!("{}", serde_json::to_string_pretty(&updated)?);
            }
        },
    }

    Ok(())
}
