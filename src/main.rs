use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod crawler;
mod digest;
mod knowledge;
mod layout;
mod manifest;
mod registry;
mod render;
mod report;
mod search;
mod summary;
mod theme;
mod tree;

use knowledge::KnowledgeBase;
use tree::{LayoutNode, TreeNode};

#[derive(Parser)]
#[command(name = "ociv")]
#[command(about = "Inspect forests of OCI image layouts and the base layers they share")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Known layer names file [default: ~/.cache/ociv/known-layers.json]
    #[arg(long, global = true, env = "OCIV_KNOWN_LAYERS")]
    known_layers: Option<PathBuf>,

    /// How deep to look for layouts below each root
    #[arg(long, global = true, env = "OCIV_MAX_DEPTH", default_value_t = layout::DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// When to colorize output
    #[arg(long, global = true, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Icon style for the tree
    #[arg(long, global = true, value_enum, default_value_t = render::IconStyle::Emoji)]
    icons: render::IconStyle,

    /// Custom theme as JSON string (e.g., '{"layout":"#7daea3"}')
    #[arg(long, global = true)]
    theme: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, env = "OCIV_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

#[derive(Subcommand)]
enum Command {
    /// Base-layer usage report for each root
    Summary {
        #[arg(default_value = ".")]
        roots: Vec<PathBuf>,
    },

    /// Print layouts, images, referrers and sub-indexes as a tree
    Tree {
        #[arg(default_value = ".")]
        roots: Vec<PathBuf>,
    },

    /// Detailed summary of images and sub-indexes whose digest starts with DIGEST
    Show {
        digest: String,

        #[arg(default_value = ".")]
        roots: Vec<PathBuf>,
    },

    /// Print the tree restricted to nodes matching NEEDLE
    Search {
        needle: String,

        #[arg(default_value = ".")]
        roots: Vec<PathBuf>,
    },

    /// Crawl a registry for top-layer names and save them to the known layers file
    Fetch {
        /// Registry base URL, e.g. https://registry.example.com
        #[arg(long)]
        registry: String,

        /// Comma-separated repository name prefixes; empty crawls everything
        #[arg(long, default_value = "")]
        prefixes: String,

        /// Maximum in-flight registry requests
        #[arg(long, default_value_t = crawler::DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// Give up waiting for the crawl after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Do not fetch manifests for names already in the known layers file
        #[arg(long)]
        skip_known: bool,

        /// Skip tags starting with this prefix (repeatable)
        #[arg(long = "skip-tag-prefix")]
        skip_tag_prefixes: Vec<String>,

        /// Write only the crawled entries instead of merging with the existing file
        #[arg(long)]
        replace: bool,
    },
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                .init();
        }
        None => registry.with(tracing_subscriber::fmt::layer().with_writer(io::stderr)).init(),
    }

    Ok(())
}

/// Walk every root; a root that cannot be read is reported and skipped
fn build_forests(roots: &[PathBuf], knowledge: &mut KnowledgeBase, max_depth: usize) -> Vec<LayoutNode> {
    let mut builder = layout::GraphBuilder::new(knowledge, max_depth);
    roots
        .iter()
        .filter_map(|root| match builder.build(root) {
            Ok(node) => Some(node),
            Err(err) => {
                eprintln!("{}: {:#}", root.display(), err);
                None
            }
        })
        .collect()
}

fn show(forests: &[LayoutNode], wanted: &str, knowledge: &KnowledgeBase, use_color: bool) -> Result<()> {
    let wanted = digest::bare(wanted);
    let mut found = 0;

    for layout in forests.iter().flat_map(LayoutNode::layouts) {
        for info in layout.images.iter().filter(|i| i.reference.digest.starts_with(wanted)) {
            print!("{}", render::paint_report(&report::image_summary(info, knowledge), use_color));
            found += 1;
        }
        for info in layout.sub_indexes.iter().filter(|i| i.reference.digest.starts_with(wanted)) {
            print!("{}", render::paint_report(&report::sub_index_summary(info, layout), use_color));
            found += 1;
        }
    }

    if found == 0 {
        bail!("No image or sub-index digest starts with {}", wanted);
    }
    Ok(())
}

async fn fetch(
    path: &Path,
    registry_url: &str,
    options: crawler::CrawlOptions,
    timeout: Option<Duration>,
    replace: bool,
) -> Result<()> {
    let crawler = crawler::Crawler::new(registry::HttpRegistry::new(registry_url), options);
    let existing = if replace { Vec::new() } else { load_persisted(path)? };
    debug!(existing = existing.len(), replace, "starting crawl");

    let saved = crawler::fetch_and_save(&crawler, path, existing, timeout).await?;
    println!("Saved {} known layer names to {}", saved, path.display());
    Ok(())
}

fn load_persisted(path: &Path) -> Result<Vec<knowledge::LayerNameEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(knowledge::load_entries(path)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let use_color = match cli.color {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => atty::is(atty::Stream::Stdout),
    };

    let theme = match &cli.theme {
        Some(theme_json) => theme::Theme::from_json(theme_json)?,
        None => theme::Theme::default(),
    };

    let known_layers = cli
        .known_layers
        .clone()
        .or_else(knowledge::default_path)
        .context("Cannot determine a home directory for the known layers file; pass --known-layers")?;

    if let Command::Fetch {
        registry,
        prefixes,
        concurrency,
        timeout,
        skip_known,
        skip_tag_prefixes,
        replace,
    } = &cli.command
    {
        let skip_names: HashSet<String> = if *skip_known {
            load_persisted(&known_layers)?.into_iter().map(|e| e.name).collect()
        } else {
            HashSet::new()
        };
        let options = crawler::CrawlOptions {
            prefixes: crawler::parse_prefixes(prefixes),
            concurrency: *concurrency,
            skip_names,
            skip_tag_prefixes: skip_tag_prefixes.clone(),
        };
        let timeout = timeout.map(Duration::from_secs);
        return fetch(&known_layers, registry, options, timeout, *replace).await;
    }

    let mut kb = KnowledgeBase::load_or_empty(&known_layers)?;
    if kb.is_empty() {
        info!(path = %known_layers.display(), "no known layer names yet, run `ociv fetch` to collect some");
    } else {
        debug!(digests = kb.len(), "known layers loaded");
    }

    let options = render::RenderOptions {
        use_color,
        icon_style: cli.icons,
        theme,
    };

    match &cli.command {
        Command::Fetch { .. } => {}
        Command::Summary { roots } => {
            let forests = build_forests(roots, &mut kb, cli.max_depth);
            for forest in &forests {
                println!("{}", summary::report(forest, &kb));
            }
        }
        Command::Tree { roots } => {
            let forests = build_forests(roots, &mut kb, cli.max_depth);
            let trees: Vec<TreeNode> = forests.iter().map(TreeNode::from_layout).collect();
            render::render_forest(&trees, &options)?;
        }
        Command::Show { digest, roots } => {
            let forests = build_forests(roots, &mut kb, cli.max_depth);
            show(&forests, digest, &kb, use_color)?;
        }
        Command::Search { needle, roots } => {
            let forests = build_forests(roots, &mut kb, cli.max_depth);
            let trees: Vec<TreeNode> = forests
                .iter()
                .filter_map(|forest| search::filter(&TreeNode::from_layout(forest), needle))
                .collect();
            if trees.is_empty() {
                eprintln!("No matches for {:?}", needle);
            }
            render::render_forest(&trees, &options)?;
        }
    }

    Ok(())
}
