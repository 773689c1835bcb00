use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mnemo::capture::{CaptureRequest, CaptureService};
use mnemo::config::MemoryConfig;
use mnemo::embedding::FastEmbedder;
use mnemo::hook::{parse_hook_input, session_end};
use mnemo::index::IndexService;
use mnemo::lifecycle::LifecycleManager;
use mnemo::model::{HydrationLevel, Namespace, SyncOutcome};
use mnemo::patterns::PatternManager;
use mnemo::recall::RecallService;
use mnemo::search::{RerankTarget, get_optimizer};
use mnemo::store::NotesStore;
use mnemo::sync::SyncService;

#[derive(Subcommand)]
enum Command {
    /// Initialize the index file and its schema
    Init {},
    /// Capture a memory attached to a commit
    Capture {
        /// Namespace for the memory e.g. decisions, learnings
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        summary: String,
        /// Markdown body; defaults to the summary
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        spec: Option<String>,
        /// Comma separated tags
        #[arg(long)]
        tags: Option<String>,
        #[arg(long)]
        phase: Option<String>,
        /// Comma separated related memory ids
        #[arg(long)]
        relates_to: Option<String>,
        /// Target commit sha, defaults to HEAD
        #[arg(long)]
        commit: Option<String>,
        /// Run an incremental sync afterwards so the memory is queryable
        /// immediately
        #[arg(long, default_value = "false")]
        sync: bool,
    },
    /// Project the notes ref into the index
    Sync {
        /// Re-parse and re-embed every note instead of resuming from the
        /// checkpoint
        #[arg(long, default_value = "false")]
        rebuild: bool,
    },
    /// Search memories
    Search {
        query: String,
        #[arg(long, default_value = "5")]
        k: usize,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        spec: Option<String>,
        #[arg(long)]
        min_similarity: Option<f64>,
        /// Full text search instead of semantic search
        #[arg(long, default_value = "false")]
        text: bool,
        /// Expand the query and rerank results by recency, namespace,
        /// spec and tag signals
        #[arg(long, default_value = "false")]
        rank: bool,
        /// Comma separated tags used by the reranker
        #[arg(long)]
        tags: Option<String>,
    },
    /// Show one memory by id
    Show {
        id: String,
        /// Include the raw note and commit metadata
        #[arg(long, default_value = "false")]
        full: bool,
        /// Also include snapshots of files the commit changed
        #[arg(long, default_value = "false")]
        files: bool,
    },
    /// List the most recent memories
    Recent {
        #[arg(long, default_value = "10")]
        limit: usize,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        spec: Option<String>,
    },
    /// Aggregate all memories for a spec
    Context { spec: String },
    /// Run the automatic lifecycle transitions
    Lifecycle {
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
    /// Garbage collect aged tombstones
    Gc {
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
    /// Detect candidate patterns across indexed memories
    Patterns {
        #[arg(long, default_value = "2")]
        min_occurrences: usize,
        #[arg(long, default_value = "10")]
        max_candidates: usize,
    },
    /// Session-end hook: read JSON on stdin, sync, emit JSON on stdout
    Hook {},
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

fn split_csv(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_namespace(value: Option<String>) -> Result<Option<Namespace>> {
    match value {
        Some(v) => Ok(Some(v.parse::<Namespace>()?)),
        None => Ok(None),
    }
}

fn print_sync_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(stats) => println!("{}", json!({ "sync": stats })),
        SyncOutcome::InProgress => println!("{}", json!({ "sync": "in progress" })),
        SyncOutcome::Failed { stats, error } => {
            println!("{}", json!({ "sync": stats, "error": error.to_string() }))
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = MemoryConfig::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Some(Command::Init {}) => {
            let index = IndexService::open(&config)?;
            println!(
                "{}",
                json!({
                    "initialized": config.index_path,
                    "embedding_dimension": index.dimension(),
                })
            );
        }
        Some(Command::Capture {
            namespace,
            summary,
            content,
            spec,
            tags,
            phase,
            relates_to,
            commit,
            sync,
        }) => {
            let store = NotesStore::open(&config)?;
            let capture = CaptureService::new(&store, &config);
            let request = CaptureRequest {
                namespace,
                timestamp: None,
                content: content.unwrap_or_else(|| summary.clone()),
                summary,
                spec,
                tags: split_csv(tags),
                phase,
                relates_to: split_csv(relates_to),
                commit,
            };
            let id = capture.capture(request)?;
            println!("{}", json!({ "captured": id }));

            if sync {
                let index = IndexService::open(&config)?;
                let embedder = FastEmbedder::new()?;
                let sync = SyncService::new(&store, &index, &embedder, &config);
                print_sync_outcome(&sync.incremental_sync()?);
            }
        }
        Some(Command::Sync { rebuild }) => {
            let store = NotesStore::open(&config)?;
            let index = IndexService::open(&config)?;
            let embedder = FastEmbedder::new()?;
            let sync = SyncService::new(&store, &index, &embedder, &config);
            let outcome = if rebuild {
                sync.rebuild_sync()?
            } else {
                sync.incremental_sync()?
            };
            print_sync_outcome(&outcome);
        }
        Some(Command::Search {
            query,
            k,
            namespace,
            spec,
            min_similarity,
            text,
            rank,
            tags,
        }) => {
            let store = NotesStore::open(&config)?;
            let index = IndexService::open(&config)?;
            let namespace = parse_namespace(namespace)?;

            if text {
                let embedder = mnemo::embedding::HashingEmbedder::new(config.embedding_dimension);
                let recall = RecallService::new(&store, &index, &embedder, &config);
                let results = recall.search_text(&query, k, namespace, spec.as_deref())?;
                println!("{}", json!({ "query": query, "results": results }));
                return Ok(());
            }

            let embedder = FastEmbedder::new()?;
            let recall = RecallService::new(&store, &index, &embedder, &config);
            if rank {
                let optimizer = get_optimizer(&config);
                let target = RerankTarget {
                    namespace,
                    spec,
                    tags: split_csv(tags),
                };
                let results = optimizer.search(&recall, &query, k, &target)?;
                println!("{}", json!({ "query": query, "results": results }));
            } else {
                let results =
                    recall.search(&query, k, namespace, spec.as_deref(), min_similarity)?;
                println!("{}", json!({ "query": query, "results": results }));
            }
        }
        Some(Command::Show { id, full, files }) => {
            let store = NotesStore::open(&config)?;
            let index = IndexService::open(&config)?;
            let embedder = mnemo::embedding::HashingEmbedder::new(config.embedding_dimension);
            let recall = RecallService::new(&store, &index, &embedder, &config);

            let Some(memory) = recall.get(&id)? else {
                println!("{}", json!({ "error": format!("no memory with id {id}") }));
                return Ok(());
            };
            let level = if files {
                HydrationLevel::Files
            } else if full {
                HydrationLevel::Full
            } else {
                HydrationLevel::Summary
            };
            let hydrated = recall.hydrate(memory, None, level)?;
            println!("{}", json!(hydrated));
        }
        Some(Command::Recent {
            limit,
            namespace,
            spec,
        }) => {
            let index = IndexService::open(&config)?;
            let namespace = parse_namespace(namespace)?;
            let results = index.list_recent(limit, namespace, spec.as_deref())?;
            println!("{}", json!({ "results": results }));
        }
        Some(Command::Context { spec }) => {
            let store = NotesStore::open(&config)?;
            let index = IndexService::open(&config)?;
            let embedder = mnemo::embedding::HashingEmbedder::new(config.embedding_dimension);
            let recall = RecallService::new(&store, &index, &embedder, &config);
            let context = recall.get_spec_context(&spec)?;
            println!("{}", json!(context));
        }
        Some(Command::Lifecycle { dry_run }) => {
            let index = IndexService::open(&config)?;
            let manager = LifecycleManager::new(config.clone());
            let stats = manager.process_lifecycle(&index, dry_run)?;
            println!("{}", json!({ "dry_run": dry_run, "stats": stats }));
        }
        Some(Command::Gc { dry_run }) => {
            let index = IndexService::open(&config)?;
            let manager = LifecycleManager::new(config.clone());
            let stats = manager.garbage_collect(&index, dry_run)?;
            println!("{}", json!({ "dry_run": dry_run, "stats": stats }));
        }
        Some(Command::Patterns {
            min_occurrences,
            max_candidates,
        }) => {
            let index = IndexService::open(&config)?;
            let ids = index.get_all_ids()?;
            let memories = index.get_batch(&ids)?;
            let manager = PatternManager::new(config.clone());
            let patterns = manager.detect_patterns(&memories, min_occurrences, max_candidates);
            for pattern in &patterns {
                manager.register_pattern(pattern.clone());
            }
            println!("{}", json!({ "candidates": patterns }));
        }
        Some(Command::Hook {}) => {
            let _input = parse_hook_input(std::io::stdin().lock());
            let embedder = FastEmbedder::new()?;
            let output = session_end(&config, &embedder);
            println!("{output}");
        }
        None => {}
    }

    Ok(())
}
