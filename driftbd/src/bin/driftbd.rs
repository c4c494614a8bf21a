//! driftbd daemon - migratable NBD block device server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use driftbd::{control, Config, Daemon, DeviceConfig, ListenServer, ProxyOptions, ProxyServer};

#[derive(Parser)]
#[command(name = "driftbd", about = "Migratable NBD block device daemon")]
struct Cli {
    /// Path to a config file. CLI flags override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosely.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a device to clients and accept mirror commands.
    Serve {
        /// Backing file to export.
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Address to listen on.
        #[arg(short = 'l', long)]
        addr: Option<String>,
        /// Control socket path.
        #[arg(short, long)]
        sock: Option<PathBuf>,
        /// Refuse clients not on the allow-list.
        #[arg(long)]
        default_deny: bool,
        /// Initial allow-list entries.
        acl: Vec<String>,
    },
    /// Wait for an incoming migration, then serve as the new owner.
    Listen {
        /// Backing file the migration writes into.
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Address the migration sender connects to.
        #[arg(short = 'l', long)]
        addr: Option<String>,
        /// Public address to rebind to after taking control.
        #[arg(long)]
        rebind_addr: Option<String>,
        /// Refuse peers not on the allow-list.
        #[arg(long)]
        default_deny: bool,
        /// Initial allow-list entries.
        acl: Vec<String>,
    },
    /// Front an upstream server with transparent reconnection.
    Proxy {
        /// Downstream listen address.
        #[arg(short = 'l', long)]
        addr: String,
        /// Upstream server address.
        #[arg(short, long)]
        upstream: String,
        /// Serve speculative reads from a local cache.
        #[arg(long)]
        prefetch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match cli.command {
        Commands::Serve {
            file,
            addr,
            sock,
            default_deny,
            acl,
        } => {
            let config = build_config(cli.config, file, addr, default_deny, &acl)?;
            let sock = sock.unwrap_or_else(|| config.socket.clone());
            serve(config, sock).await?
        }
        Commands::Listen {
            file,
            addr,
            rebind_addr,
            default_deny,
            acl,
        } => {
            let config = build_config(cli.config, file, addr, default_deny, &acl)?;
            let listener = ListenServer::open(config, rebind_addr)?;
            listener.run().await
        }
        Commands::Proxy {
            addr,
            upstream,
            prefetch,
        } => {
            let (wire, timeouts) = match cli.config {
                Some(ref path) => {
                    let config = Config::load(path)
                        .with_context(|| format!("failed to load config: {}", path.display()))?;
                    (config.wire, config.timeouts)
                }
                None => Default::default(),
            };
            let opts = ProxyOptions {
                listen: addr,
                upstream,
                prefetch,
            };
            let mut proxy = ProxyServer::new(opts, &wire, timeouts);
            match proxy.run().await {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "proxy failed");
                    1
                }
            }
        }
    };

    std::process::exit(code);
}

fn build_config(
    config: Option<PathBuf>,
    file: Option<PathBuf>,
    addr: Option<String>,
    default_deny: bool,
    acl: &[String],
) -> Result<Config> {
    let mut config = match config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => Config {
            device: DeviceConfig {
                path: file.clone().context("either --config or --file is required")?,
            },
            serve: Default::default(),
            socket: PathBuf::from("/run/driftbd/driftbd.sock"),
            wire: Default::default(),
            timeouts: Default::default(),
        },
    };

    if let Some(file) = file {
        config.device.path = file;
    }
    if let Some(addr) = addr {
        config.serve.address = addr;
    }
    if default_deny {
        config.serve.default_deny = true;
    }
    if !acl.is_empty() {
        config.serve.acl = acl.to_vec();
    }
    Ok(config)
}

async fn serve(config: Config, sock: PathBuf) -> Result<i32> {
    if let Some(parent) = sock.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if sock.exists() {
        std::fs::remove_file(&sock)?;
    }

    let daemon = Daemon::open(config).context("failed to open device")?;

    let control_listener = UnixListener::bind(&sock)
        .with_context(|| format!("failed to bind control socket: {}", sock.display()))?;
    info!(socket = %sock.display(), "control socket ready");
    tokio::spawn({
        let daemon = daemon.clone();
        async move {
            if let Err(e) = control::serve_control(control_listener, daemon).await {
                error!(error = %e, "control socket failed");
            }
        }
    });

    let addr = daemon.config().serve.address.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, size = daemon.size(), "serving");

    Ok(daemon.run(listener).await)
}
