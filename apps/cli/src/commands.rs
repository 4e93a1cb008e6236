//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use cadbridge_converter::ShapeConvBackend;
use cadbridge_core::{DefaultCustomizer, Orchestrator, default_build_parameters};
use cadbridge_resolver::{FileIndex, XRefResolver};
use cadbridge_shared::{AppConfig, file_etag, init_config, load_config, load_config_from};
use cadbridge_sink::SinkClient;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// CadBridge — turn CAD assemblies into an indexed document graph.
#[derive(Parser)]
#[command(
    name = "cadbridge",
    version,
    about = "Convert CAD assembly trees into a document graph for the index service.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.cadbridge/cadbridge.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Convert root assemblies and everything they reference.
    Convert {
        /// Root assembly file(s) to process.
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        /// Directory to index for xref resolution
        /// (defaults to index.base_dir from the config).
        #[arg(long)]
        scan_dir: Option<PathBuf>,

        /// Do not emit a synthetic aggregate node over multiple roots.
        #[arg(long)]
        no_top_node: bool,
    },

    /// Upload build parameters and trigger an index build.
    Build {
        /// Wait for the triggered build to finish.
        #[arg(long)]
        wait: bool,
    },

    /// Delete every connector document from the project index.
    ClearIndex,

    /// Upload ad-hoc JSON documents (files or folders of .json files).
    PushDocs {
        /// Document files or folders.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Command::Convert {
            roots,
            scan_dir,
            no_top_node,
        } => cmd_convert(config, &roots, scan_dir.as_deref(), !no_top_node).await,
        Command::Build { wait } => cmd_build(config, wait).await,
        Command::ClearIndex => cmd_clear_index(config).await,
        Command::PushDocs { inputs } => cmd_push_docs(config, &inputs).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// convert
// ---------------------------------------------------------------------------

async fn cmd_convert(
    config: AppConfig,
    roots: &[PathBuf],
    scan_dir: Option<&Path>,
    top_node: bool,
) -> Result<()> {
    config.validate()?;
    config.converter.validate()?;
    config.echo();

    let base_dir = match scan_dir {
        Some(p) => p.to_path_buf(),
        None if !config.index.base_dir.is_empty() => PathBuf::from(&config.index.base_dir),
        None => return Err(eyre!("no scan directory: set index.base_dir or pass --scan-dir")),
    };
    let base_dir = std::path::absolute(&base_dir)?;
    if !base_dir.is_dir() {
        return Err(eyre!("scan directory '{}' does not exist", base_dir.display()));
    }

    let spinner = spinner();
    spinner.set_message(format!("Indexing {}", base_dir.display()));
    let index = FileIndex::load_or_build(
        &base_dir,
        &config.index.extensions,
        Some(&config.index_cache_file()),
    )?;
    info!(files = index.file_count(), "xref index ready");
    let resolver = XRefResolver::new(index);

    let sink = SinkClient::new(&config.sink, &config.cache.folder)?;
    let backend = ShapeConvBackend::new(
        &config.converter,
        &config.cache.folder,
        config.sink.verify_ssl,
        config.sink.http_proxy.clone(),
    );

    let mut orchestrator = Orchestrator::new(
        config,
        sink,
        Some(resolver),
        vec![Box::new(backend)],
        Box::new(DefaultCustomizer::new()),
    )?;

    spinner.set_message(format!("Converting {} root file(s)", roots.len()));
    let started = std::time::Instant::now();
    let root_ids = orchestrator.run(roots, top_node).await?;
    spinner.finish_and_clear();

    println!();
    println!("  Conversion complete!");
    println!("  Roots: {}", root_ids.len());
    for id in &root_ids {
        println!("    {id}");
    }
    println!("  Time:  {:.1}s", started.elapsed().as_secs_f64());
    println!();

    Ok(())
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

async fn cmd_build(config: AppConfig, wait: bool) -> Result<()> {
    config.validate()?;

    let mut sink = SinkClient::new(&config.sink, &config.cache.folder)?;
    let caps = sink.capabilities().await?;
    info!(
        cpu_count = caps.cpu_count,
        ram_bytes = caps.ram_quantity_bytes,
        "sized build parameters from server capabilities"
    );

    sink.add_raw_document(default_build_parameters(&caps)).await?;
    sink.upload_batch().await?;
    sink.sync_index().await?;
    sink.trigger_build().await?;

    if wait {
        let finished = sink
            .wait_for_build(
                Duration::from_secs(config.lock.build_poll_interval_secs),
                Duration::from_secs(config.lock.build_wait_timeout_secs),
            )
            .await?;
        if finished {
            println!("Build finished.");
        } else {
            println!("Gave up waiting for the build; check the project status later.");
        }
    } else {
        println!("Build triggered.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// clear-index
// ---------------------------------------------------------------------------

async fn cmd_clear_index(config: AppConfig) -> Result<()> {
    config.validate()?;
    let sink = SinkClient::new(&config.sink, &config.cache.folder)?;
    let deleted = sink.remove_documents().await?;
    println!("Removed {deleted} documents from the index.");
    Ok(())
}

// ---------------------------------------------------------------------------
// push-docs
// ---------------------------------------------------------------------------

async fn cmd_push_docs(config: AppConfig, inputs: &[PathBuf]) -> Result<()> {
    config.validate()?;
    let mut sink = SinkClient::new(&config.sink, &config.cache.folder)?;

    let mut pushed = 0usize;
    for input in inputs {
        pushed += push_input(&mut sink, input).await?;
    }
    sink.upload_batch().await?;
    sink.sync_index().await?;
    println!("Pushed {pushed} documents.");
    Ok(())
}

/// Push one input: a folder of .json files, or a single file holding a
/// document or a list of documents. The file's mtime becomes the ts of any
/// document lacking one.
async fn push_input(sink: &mut SinkClient, input: &Path) -> Result<usize> {
    if input.is_dir() {
        let mut pushed = 0usize;
        for entry in std::fs::read_dir(input)?.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                pushed += Box::pin(push_input(sink, &path)).await?;
            }
        }
        return Ok(pushed);
    }

    let content = std::fs::read_to_string(input)?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| eyre!("invalid document file {}: {e}", input.display()))?;
    let ts = file_etag(input)?;

    let docs = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    let count = docs.len();
    for mut doc in docs {
        if let Some(obj) = doc.as_object_mut() {
            obj.entry("ts").or_insert(serde_json::json!(ts));
        }
        sink.add_raw_document(doc).await?;
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
