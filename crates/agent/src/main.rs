//! cadex-agent: index agent for remote hosts
//!
//! Serves the index protocol either on a TCP port or over stdin/stdout
//! (for use behind ssh or another pipe).

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::{info, warn};

use cadex_core::{CadexConfig, IndexService, ProtocolReader, ProtocolWriter};
use cadex_transport::RemoteIndexServer;

#[derive(Parser)]
#[command(name = "cadex-agent")]
#[command(version)]
#[command(about = "Index agent for cadex content-addressed sync")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the agent's index comes from
#[derive(clap::Args)]
struct AgentArgs {
    /// Config file (defaults to ./cadex.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory to index (repeatable, replaces configured roots)
    #[arg(short, long)]
    root: Vec<PathBuf>,

    /// Device name recorded in locations
    #[arg(short, long)]
    device: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for index requests on TCP
    Serve {
        #[command(flatten)]
        args: AgentArgs,

        /// Listen address, e.g. 0.0.0.0:7070 (defaults to [service] in config)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Answer index requests on stdin/stdout until EOF
    Stdio {
        #[command(flatten)]
        args: AgentArgs,
    },
    /// Print version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // stdout carries protocol frames in stdio mode, so logs go to stderr
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Version => {
            eprintln!("cadex-agent {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Serve { args, listen } => {
            let config = load_config(&args)?;
            let addr = match listen {
                Some(addr) => addr,
                None => config.service.listen_addr()?.to_string(),
            };
            serve(&config, &addr).await?;
        }
        Commands::Stdio { args } => {
            let config = load_config(&args)?;
            let service = IndexService::new(config.index_agent());
            tokio::task::spawn_blocking(move || run_stdio(&service)).await??;
        }
    }

    Ok(())
}

fn load_config(args: &AgentArgs) -> Result<CadexConfig> {
    let mut config = match &args.config {
        Some(path) => CadexConfig::load_file(path)?,
        None => CadexConfig::load(&std::env::current_dir()?)?,
    };
    if !args.root.is_empty() {
        config.roots.clone_from(&args.root);
    }
    if let Some(device) = &args.device {
        config.device.clone_from(device);
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config: &CadexConfig, addr: &str) -> Result<()> {
    let server = RemoteIndexServer::bind(addr, IndexService::new(config.index_agent())).await?;
    info!(
        "cadex-agent serving {} root(s) on {}",
        config.roots.len(),
        server.local_addr()?
    );

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        shutdown.cancel();
    });

    server.run().await?;
    Ok(())
}

fn run_stdio(service: &IndexService) -> Result<()> {
    info!(device = service.device(), "cadex-agent stdio session starting");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = ProtocolReader::new(BufReader::new(stdin.lock()));
    let mut writer = ProtocolWriter::new(BufWriter::new(stdout.lock()));

    loop {
        match reader.read_message() {
            Ok(Some(request)) => writer.send(&service.dispatch(request))?,
            Ok(None) => break,
            Err(e) => {
                warn!("read error: {e}");
                let _ = writer.send_error(&e.to_string());
                break;
            }
        }
    }

    info!("cadex-agent stdio session finished");
    Ok(())
}
