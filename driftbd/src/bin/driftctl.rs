//! driftctl - control client for a running driftbd daemon.
//!
//! Usage:
//!   driftctl mirror <addr> <port> [exit|unlink|nothing]
//!   driftctl acl <addr>...
//!   driftctl status
//!   driftctl break

use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const DEFAULT_SOCKET_PATH: &str = "/run/driftbd/driftbd.sock";

#[derive(Parser)]
#[command(name = "driftctl")]
#[command(about = "Control a running driftbd daemon")]
struct Cli {
    /// Control socket path
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the device to another server.
    Mirror {
        /// Destination address.
        addr: String,
        /// Destination port.
        port: u16,
        /// What to do once the destination holds the device.
        #[arg(default_value = "exit")]
        action: String,
    },
    /// Replace the connection allow-list.
    Acl {
        /// Addresses to admit.
        entries: Vec<String>,
    },
    /// Show daemon status.
    Status,
    /// Abandon a running migration.
    Break,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let words = match &cli.command {
        Commands::Mirror { addr, port, action } => {
            vec![
                "mirror".to_string(),
                addr.clone(),
                port.to_string(),
                action.clone(),
            ]
        }
        Commands::Acl { entries } => {
            let mut words = vec!["acl".to_string()];
            words.extend(entries.iter().cloned());
            words
        }
        Commands::Status => vec!["status".to_string()],
        Commands::Break => vec!["break".to_string()],
    };

    let stream = UnixStream::connect(&cli.socket)
        .await
        .with_context(|| format!("failed to connect to {}", cli.socket.display()))?;
    let (reader, mut writer) = stream.into_split();

    let mut request = words.join(" ");
    request.push_str("\n\n");
    writer.write_all(request.as_bytes()).await?;

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await?;
    let reply = reply.trim_end();
    println!("{reply}");

    // The reply's leading code is the exit status contract.
    exit(if reply.starts_with("0:") { 0 } else { 1 });
}
