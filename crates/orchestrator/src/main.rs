use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use swarm_domain::config::{Config, ENV_SESSION_DIR, ENV_SESSION_ID};

mod merge;
mod runtime;
mod spawner;

use runtime::Orchestrator;

/// Per-binary swarm orchestrator, spawned by the MCP supervisor.
///
/// The `-A`/`-T` flags mirror the disassembly host's launch contract so
/// the supervisor can point its host command directly at this binary.
#[derive(Parser)]
#[command(name = "swarm-orchestrator", version)]
struct Cli {
    /// Binary or database to analyze.
    binary: String,

    /// Automatic mode (host compatibility flag).
    #[arg(short = 'A')]
    auto: bool,

    /// Slice-selection flag for fat binaries (host compatibility).
    #[arg(short = 'T')]
    slice: Option<String>,

    /// Optional JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Session identity comes from the supervisor's environment, never
    // from the command line.
    let session_id = std::env::var(ENV_SESSION_ID)
        .with_context(|| format!("{ENV_SESSION_ID} not set (not spawned by a supervisor?)"))?;
    let session_dir = PathBuf::from(
        std::env::var(ENV_SESSION_DIR)
            .with_context(|| format!("{ENV_SESSION_DIR} not set"))?,
    );

    let config = Config::load(cli.config.as_deref())?;

    let binary_name = Path::new(&cli.binary)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");
    let workspace_dir = config.workspace_dir(binary_name);
    std::fs::create_dir_all(&workspace_dir)
        .with_context(|| format!("creating workspace {}", workspace_dir.display()))?;
    init_tracing(&workspace_dir.join("orchestrator.log"));

    tracing::info!(
        session_id,
        session_dir = %session_dir.display(),
        binary = %cli.binary,
        auto = cli.auto,
        slice = ?cli.slice,
        "orchestrator starting"
    );

    let orchestrator = Arc::new(
        Orchestrator::new(config, &cli.binary)
            .await
            .context("initializing orchestrator")?,
    );
    orchestrator.serve(session_dir).await?;

    tracing::info!(session_id, "orchestrator exiting");
    Ok(())
}

/// Log to `orchestrator.log` in the workspace; fall back to stderr if
/// the file cannot be opened.
fn init_tracing(log_path: &Path) {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => {
            let file = Arc::new(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(move || LogWriter(file.clone()))
                .init();
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
            tracing::warn!(error = %e, path = %log_path.display(), "log file unavailable");
        }
    }
}

struct LogWriter(Arc<std::fs::File>);

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.0).flush()
    }
}
