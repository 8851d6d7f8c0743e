// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gallerydex::config::{default_data_dir, default_extensions, normalize_extensions};
use gallerydex::oracle::{PageRequest, Recursion, SortField};
use gallerydex::{Broadcaster, Collaborators, GalleryConfig, GalleryState, Librarian, Oracle};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gallerydex", version, about = "Incremental media-folder indexer")]
struct Cli {
    /// Where the metadata cache and search index live
    #[arg(long, env = "GALLERYDEX_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Allowed extensions, comma separated (e.g. png,jpg,mp4)
    #[arg(long, value_delimiter = ',', global = true)]
    extensions: Vec<String>,

    /// Hot-tier capacity of the metadata cache
    #[arg(long, default_value_t = 1024, global = true)]
    hot_capacity: usize,

    /// Number of metadata workers
    #[arg(long, default_value_t = 2, global = true)]
    workers: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch a folder and print change notifications as JSON lines
    Watch {
        root: PathBuf,
        /// Only watch the top-level directory
        #[arg(long)]
        flat: bool,
        /// Skip queueing metadata work for existing images
        #[arg(long)]
        no_backfill: bool,
    },
    /// Print one page of a folder listing
    Scan {
        root: PathBuf,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long, value_enum, default_value_t = SortArg::Timestamp)]
        sort: SortArg,
        #[arg(long)]
        asc: bool,
        #[arg(long, value_enum, default_value_t = RecursionArg::Auto)]
        recursive: RecursionArg,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        /// Print per-folder counts instead of a page
        #[arg(long)]
        summary: bool,
    },
    /// Full-text search over indexed prompts
    Search {
        root: PathBuf,
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show metadata for one file (path relative to the root)
    Metadata {
        root: PathBuf,
        path: String,
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SortArg {
    Timestamp,
    Name,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RecursionArg {
    Auto,
    True,
    False,
}

/// Writes every notification to stdout as one JSON line.
struct StdoutBroadcaster;

impl Broadcaster for StdoutBroadcaster {
    fn notify(&self, event: &str, payload: Value) {
        let line = json!({ "event": event, "payload": payload });
        let mut out = std::io::stdout().lock();
        if writeln!(out, "{}", line).is_err() {
            tracing::warn!("[Main] stdout closed, dropping notification");
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = GalleryConfig {
        data_dir: cli.data_dir.clone().unwrap_or_else(default_data_dir),
        extensions: if cli.extensions.is_empty() { default_extensions() } else { normalize_extensions(&cli.extensions) },
        ..GalleryConfig::default()
    };
    config.cache.hot_capacity = cli.hot_capacity;
    config.pipeline.workers = cli.workers.max(1);

    let collaborators = Collaborators { broadcaster: Arc::new(StdoutBroadcaster), ..Collaborators::default() };

    match cli.command {
        Command::Watch { root, flat, no_backfill } => {
            config.recursive = !flat;
            config.backfill = !no_backfill;
            let state = GalleryState::open(config, collaborators).context("Failed to open gallery stores")?;

            let mut librarian = Librarian::new(Arc::clone(&state), &root, tokio::runtime::Handle::current())?;
            let files = tokio::task::block_in_place(|| librarian.start())?;
            tracing::info!("[Main] Watching {} ({} files). Ctrl-C to stop.", librarian.root().path.display(), files);

            tokio::signal::ctrl_c().await?;
            tracing::info!("[Main] Shutting down...");
            librarian.stop();
            tokio::task::block_in_place(|| state.shutdown());
        }
        Command::Scan { root, folder, sort, asc, recursive, page, limit, summary } => {
            let state = GalleryState::open(config, collaborators).context("Failed to open gallery stores")?;
            let oracle = Oracle::new(Arc::clone(&state), &root)?;
            if summary {
                print_json(&oracle.folder_summary())?;
            } else {
                let request = PageRequest {
                    folder,
                    sort: match sort {
                        SortArg::Timestamp => SortField::Timestamp,
                        SortArg::Name => SortField::Name,
                    },
                    descending: !asc,
                    recursion: match recursive {
                        RecursionArg::Auto => Recursion::Auto,
                        RecursionArg::True => Recursion::Always,
                        RecursionArg::False => Recursion::Never,
                    },
                    page,
                    limit,
                };
                print_json(&oracle.list_page(&request)?)?;
            }
            state.shutdown();
        }
        Command::Search { root, query, limit } => {
            let state = GalleryState::open(config, collaborators).context("Failed to open gallery stores")?;
            let oracle = Oracle::new(Arc::clone(&state), &root)?;
            print_json(&oracle.search(&query, limit)?)?;
            state.shutdown();
        }
        Command::Metadata { root, path, refresh } => {
            let state = GalleryState::open(config, collaborators).context("Failed to open gallery stores")?;
            let oracle = Oracle::new(Arc::clone(&state), &root)?;
            print_json(&oracle.metadata_for(&path, refresh)?)?;
            state.shutdown();
        }
    }

    Ok(())
}
