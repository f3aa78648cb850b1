#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scriptctl::{ManagerConfig, OutputEvent, ScriptManager};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scriptctl", version, about = "Run and stop the scripts of a directory")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file. Flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory scripts are discovered in.
    #[arg(long, global = true)]
    scripts_dir: Option<PathBuf>,

    /// Allowed extension. Can be repeated; none means every file.
    #[arg(long = "ext", global = true)]
    extensions: Vec<String>,

    /// Interpreter for an extension as EXT=PROGRAM. Can be repeated.
    ///
    /// Example: --interpreter sh=/bin/sh
    #[arg(long = "interpreter", global = true)]
    interpreters: Vec<String>,

    /// Append each script's output to <LOGS_DIR>/<name>.log.
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    /// Grace period between the termination request and the forced kill.
    #[arg(long, global = true)]
    grace_ms: Option<u64>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the scripts that can be run.
    List {
        /// Print JSON instead of plain names.
        #[arg(long)]
        json: bool,
    },

    /// Run scripts and stream their output until they end.
    Run {
        /// Script file names, relative to the scripts directory.
        #[arg(required = true)]
        names: Vec<String>,

        /// Stop whatever is still running after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("scriptctl=debug")
        } else {
            EnvFilter::new("scriptctl=warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let manager = ScriptManager::new(config)?;

    match cli.command {
        Commands::List { json } => cmd_list(&manager, json),
        Commands::Run {
            names,
            timeout_ms,
            json,
        } => cmd_run(&manager, names, timeout_ms, json).await,
    }
}

fn load_config(cli: &Cli) -> Result<ManagerConfig> {
    let mut config = match &cli.config {
        Some(path) => ManagerConfig::from_json_file(path)?,
        None => {
            let dir = cli
                .scripts_dir
                .as_ref()
                .context("either --config or --scripts-dir is required")?;
            let mut builder = ManagerConfig::builder();
            builder.scripts_dir(std::path::absolute(dir)?);
            builder.build()?
        }
    };

    if let (Some(_), Some(dir)) = (&cli.config, &cli.scripts_dir) {
        config.scripts_dir = std::path::absolute(dir)?;
    }
    if !cli.extensions.is_empty() {
        config.allowed_extensions = cli
            .extensions
            .iter()
            .map(|ext| scriptctl::normalize_extension(ext))
            .collect();
    }
    for raw in &cli.interpreters {
        let (ext, program) = raw
            .split_once('=')
            .with_context(|| format!("invalid --interpreter {raw:?}, expected EXT=PROGRAM"))?;
        config
            .interpreters
            .insert(scriptctl::normalize_extension(ext), program.to_string());
    }
    if let Some(dir) = &cli.logs_dir {
        config.logs_dir = Some(std::path::absolute(dir)?);
    }
    if let Some(grace_ms) = cli.grace_ms {
        config.termination_grace_ms = grace_ms;
    }

    config.validate()?;
    Ok(config)
}

fn cmd_list(manager: &ScriptManager, json: bool) -> Result<()> {
    let scripts = manager.list_available();
    if json {
        println!("{}", serde_json::to_string_pretty(&scripts)?);
        return Ok(());
    }
    if scripts.is_empty() {
        eprintln!("no scripts in {}", manager.scripts_dir().display());
    }
    for script in scripts {
        println!("{}", script.name);
    }
    Ok(())
}

async fn cmd_run(
    manager: &ScriptManager,
    names: Vec<String>,
    timeout_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    // Subscribed before starting so start failures are printed too
    let mut events = manager.subscribe().into_stream();

    let mut pending = HashSet::new();
    let mut failed = 0usize;
    for name in names {
        match manager.start(&name).await {
            Ok(handle) => {
                info!(script = %handle.script_name, pid = ?handle.pid, "Started");
                pending.insert(name);
            }
            Err(e) => {
                warn!(script = %name, error = %e, "Start failed");
                failed += 1;
            }
        }
    }

    let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
    let mut stopping = false;
    let mut nonzero = 0usize;

    loop {
        // Failure notices are already buffered, print them even if nothing started
        if pending.is_empty() {
            while let Some(Some(event)) = tokio::time::timeout(Duration::ZERO, events.next())
                .await
                .ok()
            {
                print_event(&event, json)?;
            }
            break;
        }

        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                print_event(&event, json)?;
                if let Some(exit) = event.exit {
                    pending.remove(&event.script_name);
                    if !exit.requested && exit.code != Some(0) {
                        nonzero += 1;
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("Interrupted, stopping all scripts");
                stopping = true;
                manager.stop_all().await;
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if !stopping && deadline.is_some() => {
                info!("Timeout reached, stopping all scripts");
                stopping = true;
                manager.stop_all().await;
            }
        }
    }

    if failed > 0 || nonzero > 0 {
        anyhow::bail!("{failed} script(s) failed to start, {nonzero} exited unsuccessfully");
    }
    Ok(())
}

fn print_event(event: &OutputEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("[{}] {}: {}", event.script_name, event.stream, event.message);
    }
    Ok(())
}
