//! patchbay - dry-run convergence of session snapshots
//!
//! Subcommands:
//! - `patchbay plan <session.json>` - Print the derived desired state
//! - `patchbay converge <session.json>...` - Apply revisions in order and print the engine command log
//! - `patchbay config` - Print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use patchbay::testing::{descriptor, EngineCall, FakePluginHost, RecordingEngine};
use patchbay::{CatalogResolver, Collaborators, Conductor, PluginDescriptor, Session, WavFileLoader};
use patchconf::PatchConfig;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "patchbay")]
#[command(about = "Converge an audio engine on session snapshots")]
#[command(version)]
struct Cli {
    /// Config file replacing ./patchbay.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the desired engine state for a session
    Plan {
        /// Session snapshot (JSON)
        session: PathBuf,

        /// Plugins the fake host offers, as id@version
        #[arg(short, long = "plugin")]
        plugins: Vec<String>,
    },

    /// Apply session revisions in order against a recording engine
    Converge {
        /// Session snapshots (JSON), applied in the order given
        #[arg(required = true)]
        sessions: Vec<PathBuf>,

        /// Plugins the fake host offers, as id@version
        #[arg(short, long = "plugin")]
        plugins: Vec<String>,

        /// Also print query calls (transport state, diagnostics)
        #[arg(long)]
        queries: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Serialize)]
struct Step<'a, R: Serialize> {
    source: &'a str,
    report: R,
    commands: Vec<EngineCall>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PatchConfig::load_from(cli.config.as_deref()).context("failed to load config")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Plan { session, plugins } => plan(&config, &session, &plugins).await?,
        Commands::Converge {
            sessions,
            plugins,
            queries,
        } => converge(&config, &sessions, &plugins, queries).await?,
        Commands::Config => print!("{}", config.to_toml()),
    }

    Ok(())
}

async fn plan(config: &PatchConfig, path: &Path, plugins: &[String]) -> Result<()> {
    let session = read_session(path).await?;
    let (_engine, conductor) = dry_run(config, path, plugins).await?;

    let desired = conductor.plan(&session).await?;
    println!("{}", serde_json::to_string_pretty(&desired)?);

    conductor.shutdown().await;
    Ok(())
}

async fn converge(
    config: &PatchConfig,
    paths: &[PathBuf],
    plugins: &[String],
    queries: bool,
) -> Result<()> {
    let Some(first) = paths.first() else {
        bail!("no session files given");
    };
    let (engine, conductor) = dry_run(config, first, plugins).await?;

    let drain = |engine: &RecordingEngine| -> Vec<EngineCall> {
        engine
            .take_calls()
            .into_iter()
            .filter(|call| queries || !call.is_query())
            .collect()
    };

    for path in paths {
        let session = read_session(path).await?;
        let report = conductor
            .apply_session(Arc::new(session))
            .await
            .with_context(|| format!("failed to converge {}", path.display()))?;

        let step = Step {
            source: &path.display().to_string(),
            report,
            commands: drain(&engine),
        };
        println!("{}", serde_json::to_string_pretty(&step)?);
    }

    conductor.shutdown().await;
    let step = Step {
        source: "shutdown",
        report: (),
        commands: drain(&engine),
    };
    println!("{}", serde_json::to_string_pretty(&step)?);

    Ok(())
}

/// Conductor over a recording engine, a fake plugin host and WAV files
/// resolved relative to the session file.
async fn dry_run(
    config: &PatchConfig,
    session_path: &Path,
    plugins: &[String],
) -> Result<(Arc<RecordingEngine>, Conductor)> {
    let catalog = plugins
        .iter()
        .map(|entry| parse_plugin(entry))
        .collect::<Result<Vec<_>>>()?;

    let engine = Arc::new(RecordingEngine::new());
    let host = Arc::new(FakePluginHost::new().with_catalog(catalog));
    let resolver = Arc::new(CatalogResolver::from_host(host.as_ref()).await?);
    let root = session_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let conductor = Conductor::new(
        config,
        Collaborators {
            engine: engine.clone(),
            host,
            loader: Arc::new(WavFileLoader::with_root(root)),
            resolver,
        },
    );
    Ok((engine, conductor))
}

fn parse_plugin(entry: &str) -> Result<PluginDescriptor> {
    match entry.split_once('@') {
        Some((id, version)) if !id.is_empty() && !version.is_empty() => Ok(descriptor(id, version)),
        _ => bail!("invalid plugin '{}', expected id@version", entry),
    }
}

async fn read_session(path: &Path) -> Result<Session> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}
