//! cadex: content-addressed indexing and sync
//!
//! Indexes trees into checksum stores, compares them with a remote agent's
//! store, and streams the missing content to a receiver.

mod progress;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tracing::{debug, info};

use cadex_core::{CadexConfig, ContentStore, IndexReport, Pattern, StoreDiff};
use cadex_transport::{
    IndexSession, LocalSession, Receiver, ReceiverOptions, RemoteIndexClient, Sender,
};

use crate::progress::Progress;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "cadex")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Content-addressed file indexing and sync")]
#[command(long_about = r#"
cadex indexes file trees by SHA-1 content checksum, so identical content is
found regardless of name or location.

A path is indexed when some include matches and no exclude does. A leading
`!` excludes, a leading `/` anchors the pattern to the root:
  --pattern '**/*' --pattern '!**/*.h' --pattern '!/target/**'

Examples:
  cadex index ./src -o src.store              Index a tree into a store file
  cadex index ./src -b src.store -o src.store Re-index, rehashing only changes
  cadex remote host:7070 -o remote.store      Ask an agent for its store
  cadex diff src.store remote.store           Compare two stores
  cadex receive -l 0.0.0.0:7071               Accept incoming files
  cadex sync host:7070 host:7071 ./src        Send content the remote lacks
  cadex sync host:7070 host:7071 ./src --baseline local.store --remote-baseline remote.store
                                              Same, reusing and refreshing both stores
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./cadex.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Summary,
    Json,
}

/// Options shared by every command that runs an index
#[derive(clap::Args)]
struct IndexArgs {
    /// Include/exclude rule, applied in order (repeatable)
    #[arg(short, long = "pattern")]
    patterns: Vec<String>,

    /// Previous store file; unchanged files reuse its checksums
    #[arg(short, long)]
    baseline: Option<PathBuf>,

    /// Write the resulting store here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "summary")]
    format: Format,
}

/// Store files a sync reads as baselines and rewrites afterwards
#[derive(clap::Args, Default)]
struct SyncStores {
    /// Local store file; unchanged files reuse its checksums
    #[arg(long)]
    baseline: Option<PathBuf>,

    /// Remote store file, sent to the agent as its baseline
    #[arg(long)]
    remote_baseline: Option<PathBuf>,

    /// Write the new local store here (defaults to --baseline)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write the new remote store here (defaults to --remote-baseline)
    #[arg(long)]
    remote_output: Option<PathBuf>,
}

impl SyncStores {
    fn load(&self) -> Result<(ContentStore, ContentStore)> {
        Ok((
            read_baseline(self.baseline.as_deref())?,
            read_baseline(self.remote_baseline.as_deref())?,
        ))
    }

    fn save(&self, local: &ContentStore, remote: &ContentStore) -> Result<()> {
        if let Some(path) = self.output.as_ref().or(self.baseline.as_ref()) {
            write_store(path, local)?;
        }
        if let Some(path) = self.remote_output.as_ref().or(self.remote_baseline.as_ref()) {
            write_store(path, remote)?;
        }
        Ok(())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Index local directories into a content store
    Index {
        /// Directories to index (defaults to configured roots)
        roots: Vec<PathBuf>,

        /// Device name recorded in locations
        #[arg(short, long)]
        device: Option<String>,

        /// Rehash files the baseline claims are unchanged
        #[arg(long)]
        verify: bool,

        #[command(flatten)]
        args: IndexArgs,
    },

    /// Ask a remote agent to index its roots
    Remote {
        /// Agent address (host:port)
        addr: String,

        /// Seconds to wait for the agent
        #[arg(short, long)]
        timeout: Option<u64>,

        #[command(flatten)]
        args: IndexArgs,
    },

    /// Compare two store files by checksum
    Diff {
        /// Local store file
        local: PathBuf,

        /// Remote store file
        remote: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "summary")]
        format: Format,
    },

    /// Send files or text to a receiver
    Send {
        /// Receiver address (host:port)
        addr: String,

        /// Files to send
        files: Vec<PathBuf>,

        /// Text message to send before the files
        #[arg(short, long)]
        text: Option<String>,
    },

    /// Receive files into the staging directory until interrupted
    Receive {
        /// Listen address (defaults to [transfer] in config)
        #[arg(short, long)]
        listen: Option<String>,

        /// Staging directory for incoming files
        #[arg(short, long)]
        staging: Option<PathBuf>,
    },

    /// Index locally and remotely, then send content the remote lacks
    Sync {
        /// Agent address (host:port)
        agent: String,

        /// Receiver address (host:port)
        receiver: String,

        /// Directories to index (defaults to configured roots)
        roots: Vec<PathBuf>,

        /// Include/exclude rule, applied in order (repeatable)
        #[arg(short, long = "pattern")]
        patterns: Vec<String>,

        /// Seconds to wait for the agent
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Only report what would be sent
        #[arg(short = 'n', long)]
        dry_run: bool,

        #[command(flatten)]
        stores: SyncStores,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Index {
            roots,
            device,
            verify,
            args,
        } => {
            let mut config = with_roots(config, roots);
            if let Some(device) = device {
                config.device = device;
            }
            config.verify_unchanged |= verify;
            index_command(&config, &args).await?;
        }
        Commands::Remote {
            addr,
            timeout,
            args,
        } => {
            remote_command(&config, &addr, timeout, &args).await?;
        }
        Commands::Diff {
            local,
            remote,
            format,
        } => {
            diff_command(&local, &remote, format)?;
        }
        Commands::Send { addr, files, text } => {
            send_command(&addr, &files, text.as_deref(), config.transfer.chunk_size).await?;
        }
        Commands::Receive { listen, staging } => {
            receive_command(&config, listen, staging).await?;
        }
        Commands::Sync {
            agent,
            receiver,
            roots,
            patterns,
            timeout,
            dry_run,
            stores,
        } => {
            let config = with_roots(config, roots);
            let target = SyncTarget {
                agent: &agent,
                receiver: &receiver,
                timeout,
            };
            sync_command(&config, &target, &patterns, &stores, dry_run).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CadexConfig> {
    let config = match path {
        Some(path) => CadexConfig::load_file(path)?,
        None => CadexConfig::load(&std::env::current_dir()?)?,
    };
    debug!(device = %config.device, roots = config.roots.len(), "loaded config");
    Ok(config)
}

fn with_roots(mut config: CadexConfig, roots: Vec<PathBuf>) -> CadexConfig {
    if !roots.is_empty() {
        config.roots = roots;
    }
    config
}

/// Command-line rules replace configured ones; with neither, index everything
fn resolve_patterns(rules: &[String], config: &CadexConfig) -> Vec<Pattern> {
    if !rules.is_empty() {
        rules.iter().map(|r| Pattern::parse_rule(r)).collect()
    } else if !config.patterns.is_empty() {
        config.patterns.clone()
    } else {
        vec![Pattern::include("**/*")]
    }
}

fn read_store(path: &Path) -> Result<ContentStore> {
    let data = std::fs::read(path).map_err(|e| eyre!("reading {}: {e}", path.display()))?;
    Ok(ContentStore::deserialize(&data)?)
}

fn read_baseline(path: Option<&Path>) -> Result<ContentStore> {
    match path {
        Some(path) if path.exists() => read_store(path),
        _ => Ok(ContentStore::new()),
    }
}

fn write_store(path: &Path, store: &ContentStore) -> Result<()> {
    std::fs::write(path, store.serialize())
        .map_err(|e| eyre!("writing {}: {e}", path.display()))?;
    info!("wrote {} checksums to {}", store.len(), path.display());
    Ok(())
}

fn timeout_of(config: &CadexConfig, secs: Option<u64>) -> Duration {
    secs.map_or_else(|| config.service.timeout(), Duration::from_secs)
}

async fn index_command(config: &CadexConfig, args: &IndexArgs) -> Result<()> {
    let progress = Progress::new();
    let patterns = resolve_patterns(&args.patterns, config);
    let baseline = read_baseline(args.baseline.as_deref())?;

    progress.indexing(config.roots.len(), &config.device);
    let mut session = LocalSession::new(config.index_agent());
    let report = session.index(&patterns, &baseline).await?;

    finish_index(&progress, &report, args)
}

async fn remote_command(
    config: &CadexConfig,
    addr: &str,
    timeout: Option<u64>,
    args: &IndexArgs,
) -> Result<()> {
    let progress = Progress::new();
    let patterns = resolve_patterns(&args.patterns, config);
    let baseline = read_baseline(args.baseline.as_deref())?;

    let mut client = RemoteIndexClient::connect(addr, timeout_of(config, timeout)).await?;
    progress.indexing(1, addr);
    let report = client.index(&patterns, &baseline).await?;

    finish_index(&progress, &report, args)
}

fn finish_index(progress: &Progress, report: &IndexReport, args: &IndexArgs) -> Result<()> {
    match args.format {
        Format::Json => {
            let json = serde_json::json!({
                "store": report.store,
                "stats": report.stats,
                "failures": report.failures,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Format::Summary => progress.indexed(report),
    }

    if let Some(output) = &args.output {
        write_store(output, &report.store)?;
    }
    Ok(())
}

fn diff_command(local: &Path, remote: &Path, format: Format) -> Result<()> {
    let local = read_store(local)?;
    let remote = read_store(remote)?;
    let diff = StoreDiff::between(&local, &remote);

    match format {
        Format::Json => {
            let json = serde_json::json!({
                "only_local": diff.only_local,
                "only_remote": diff.only_remote,
                "shared": diff.shared,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Format::Summary => {
            let progress = Progress::new();
            progress.comparing(local.len(), remote.len());
            progress.diffed(&diff);
            for key in &diff.only_local {
                if let Some(location) = local.locations(key).and_then(|l| l.iter().next()) {
                    println!("- {key} {}", location.path.display());
                }
            }
            for key in &diff.only_remote {
                if let Some(location) = remote.locations(key).and_then(|l| l.iter().next()) {
                    println!("+ {key} {}", location.path.display());
                }
            }
        }
    }
    Ok(())
}

async fn send_command(
    addr: &str,
    files: &[PathBuf],
    text: Option<&str>,
    chunk_size: usize,
) -> Result<()> {
    if files.is_empty() && text.is_none() {
        bail!("nothing to send: pass files and/or --text");
    }

    let progress = Progress::new();
    let mut sender = Sender::connect(addr).await?.with_chunk_size(chunk_size);
    if let Some(text) = text {
        sender.send_text(text).await?;
    }

    let sources: Vec<(PathBuf, String)> = files
        .iter()
        .map(|path| -> Result<(PathBuf, String)> {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| eyre!("{} has no file name", path.display()))?;
            Ok((path.clone(), name))
        })
        .collect::<Result<_>>()?;
    let sent = send_all(&progress, &mut sender, &sources).await?;

    sender.close().await?;
    progress.sent(sources.len(), sent);
    Ok(())
}

/// Stream each file under its name, with one byte bar over all of them
async fn send_all(progress: &Progress, sender: &mut Sender, sources: &[(PathBuf, String)]) -> Result<u64> {
    let total = sources
        .iter()
        .map(|(path, _)| std::fs::metadata(path).map(|m| m.len()))
        .sum::<std::io::Result<u64>>()?;

    let pb = progress.send_bar(total);
    let mut done = 0u64;
    for (path, name) in sources {
        pb.set_prefix(name.clone());
        let base = done;
        done += sender
            .send_file_with(path, name, |sent| pb.set_position(base + sent))
            .await?;
    }
    pb.finish_and_clear();
    Ok(done)
}

async fn receive_command(
    config: &CadexConfig,
    listen: Option<String>,
    staging: Option<PathBuf>,
) -> Result<()> {
    let addr = match listen {
        Some(addr) => addr,
        None => config.transfer.listen_addr()?.to_string(),
    };
    let mut options = ReceiverOptions::from(config.transfer.clone());
    if let Some(staging) = staging {
        options.staging_dir = staging;
    }

    let (receiver, mut queue) = Receiver::bind(addr.as_str(), options).await?;
    info!("receiving on {} (Ctrl+C to stop)", receiver.local_addr()?);

    let shutdown = receiver.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        shutdown.cancel();
    });

    let server = tokio::spawn(receiver.run());
    let mut count = 0usize;
    while let Some(message) = queue.pop().await {
        Progress::received(&message);
        count += 1;
    }

    server.await??;
    info!("received {count} message(s)");
    Ok(())
}

/// Where a sync indexes remotely and delivers to
struct SyncTarget<'a> {
    agent: &'a str,
    receiver: &'a str,
    timeout: Option<u64>,
}

async fn sync_command(
    config: &CadexConfig,
    target: &SyncTarget<'_>,
    rules: &[String],
    stores: &SyncStores,
    dry_run: bool,
) -> Result<()> {
    let progress = Progress::new();
    let patterns = resolve_patterns(rules, config);
    let (local_baseline, remote_baseline) = stores.load()?;

    progress.indexing(config.roots.len(), &config.device);
    let mut local = LocalSession::new(config.index_agent());
    let local_report = local.index(&patterns, &local_baseline).await?;
    progress.indexed(&local_report);

    // The remote walks its own roots with the same rules
    let mut remote =
        RemoteIndexClient::connect(target.agent, timeout_of(config, target.timeout)).await?;
    progress.indexing(1, remote.peer());
    let remote_report = remote.index(&patterns, &remote_baseline).await?;
    progress.indexed(&remote_report);
    stores.save(&local_report.store, &remote_report.store)?;

    progress.comparing(local_report.store.len(), remote_report.store.len());
    let diff = StoreDiff::between(&local_report.store, &remote_report.store);
    progress.diffed(&diff);

    let plan = diff.transfer_plan(&local_report.store);
    if plan.is_empty() {
        return Ok(());
    }
    if dry_run {
        for (key, location) in &plan {
            println!("{key} {}", location.path.display());
        }
        return Ok(());
    }

    let sources: Vec<(PathBuf, String)> = plan
        .iter()
        .map(|(key, location)| {
            let name = location
                .path
                .file_name()
                .map_or_else(|| key.to_hex(), |n| n.to_string_lossy().into_owned());
            (location.path.clone(), name)
        })
        .collect();

    let mut sender = Sender::connect(target.receiver)
        .await?
        .with_chunk_size(config.transfer.chunk_size);
    let sent = send_all(&progress, &mut sender, &sources).await?;
    sender.close().await?;
    progress.sent(sources.len(), sent);
    Ok(())
}
