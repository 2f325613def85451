//! Command-line front end for sift.
//!
//! ```bash
//! sift index ./my-project
//! sift search my-project "parse error handling" --mode hybrid --limit 5
//! sift projects
//! sift watch ./my-project
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sift_config::Config;
use sift_index::{IndexReport, ProjectRegistry, SearchMode, SearchResponse};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sift",
    version,
    about = "Hybrid lexical and semantic code search with incremental indexing"
)]
pub struct Cli {
    /// Configuration file (TOML). Defaults to the user config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Index a project, registering it on first use.
    Index {
        path: PathBuf,

        /// Re-chunk and re-embed every file, even unchanged ones.
        #[arg(long)]
        force: bool,
    },

    /// Search an indexed project.
    Search {
        /// Project name, as shown by `sift projects`.
        project: String,

        query: String,

        #[arg(long, short = 'n')]
        limit: Option<usize>,

        /// `lexical`, `vector` or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        mode: SearchMode,
    },

    /// List registered projects.
    Projects,

    /// Index a project, then keep it indexed as files change.
    Watch { path: PathBuf },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    execute(cli, config).await
}

/// Logs go to stderr so `--json` output stays parseable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub async fn execute(cli: Cli, config: Config) -> Result<()> {
    let default_limit = config.search.default_limit;
    let registry = ProjectRegistry::open(config)
        .await
        .context("Failed to open the project registry")?;

    match cli.command {
        Command::Index { path, force } => {
            let report = registry
                .index(&path, force)
                .await
                .with_context(|| format!("Failed to index {}", path.display()))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&path, &report);
            }
        }
        Command::Search {
            project,
            query,
            limit,
            mode,
        } => {
            let response = registry
                .search(&project, &query, limit.unwrap_or(default_limit), mode)
                .await
                .with_context(|| format!("Search in {project} failed"))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_results(&response);
            }
        }
        Command::Projects => {
            let projects = registry.projects().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&projects)?);
            } else if projects.is_empty() {
                println!("No projects indexed yet.");
            } else {
                for (name, root) in &projects {
                    println!("{name}\t{}", root.display());
                }
            }
        }
        Command::Watch { path } => {
            let service = registry
                .watch(&path)
                .await
                .with_context(|| format!("Failed to watch {}", path.display()))?;
            info!("Watching {} (Ctrl-C to stop)", path.display());
            tokio::select! {
                result = service.run() => result.context("Watcher stopped")?,
                _ = tokio::signal::ctrl_c() => info!("Stopping watcher"),
            }
        }
    }

    Ok(())
}

fn print_report(path: &Path, report: &IndexReport) {
    println!(
        "Indexed {}: {} files processed, {} removed, {} chunks ({} embedded) in {:.2?}",
        path.display(),
        report.files_processed,
        report.files_removed,
        report.chunks_indexed,
        report.chunks_embedded,
        report.duration
    );
    if report.detection.short_circuited {
        println!("No changes since the last run.");
    }
    for (file, reason) in &report.errors {
        warn!("{}: {}", file, reason);
    }
}

fn print_results(response: &SearchResponse) {
    if response.degraded {
        for error in &response.errors {
            warn!("Partial results: {}", error);
        }
    }
    if response.results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in response.results.iter().enumerate() {
        let symbol = hit.symbol_name.as_deref().unwrap_or("-");
        println!(
            "{:>2}. {}:{}-{}  {}  ({:.4})",
            i + 1,
            hit.file_path,
            hit.start_line,
            hit.end_line,
            symbol,
            hit.score
        );
        if let Some(line) = hit.content.lines().find(|l| !l.trim().is_empty()) {
            println!("      {}", line.trim());
        }
    }
}
