//! Administrative control channel.
//!
//! Line protocol over a local socket: the client sends LF-terminated
//! words, finishes with a blank line, and gets exactly one reply line of
//! the form `<code>: <message>`. Code 0 is success, 1 a command failure,
//! 9 a missing command, 10 an unknown one. One command per connection.
//!
//! The `mirror` reply is not written until the first connection attempt
//! to the destination has resolved, so the administrator learns about a
//! size mismatch or rejection immediately rather than from the logs.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::acl::AclList;
use crate::daemon::{BreakOutcome, Daemon};
use crate::error::MirrorError;
use crate::mirror::{FinishAction, MirrorSpec};

/// Accept control connections until the listener fails.
pub async fn serve_control(listener: UnixListener, daemon: Arc<Daemon>) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, daemon).await {
                warn!(error = %e, "control connection error");
            }
        });
    }
}

/// Serve one control connection: read a command, write one reply line.
pub async fn handle_client<S>(stream: S, daemon: Arc<Daemon>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let mut tokens: Vec<String> = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        tokens.extend(trimmed.split_whitespace().map(str::to_owned));
    }

    let reply = dispatch(&daemon, &tokens).await;
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Parse and run one command, producing the reply line.
pub async fn dispatch(daemon: &Arc<Daemon>, tokens: &[String]) -> String {
    let Some((command, args)) = tokens.split_first() else {
        return "9: missing command".to_string();
    };

    match command.as_str() {
        "mirror" => {
            info!("mirror command received");
            mirror_command(daemon, args).await
        }
        "acl" => {
            info!("acl command received");
            acl_command(daemon, args)
        }
        "status" => format!("0: {}", daemon.status_line().await),
        "break" => {
            info!("break command received");
            match daemon.break_mirror().await {
                BreakOutcome::Stopped => "0: mirror stopped".to_string(),
                BreakOutcome::Completed => "1: mirror completed".to_string(),
                BreakOutcome::NotMirroring => "1: not mirroring".to_string(),
            }
        }
        _ => "10: unknown command".to_string(),
    }
}

async fn mirror_command(daemon: &Arc<Daemon>, args: &[String]) -> String {
    if args.len() < 2 {
        return "1: mirror takes at least two parameters".to_string();
    }
    let Ok(ip) = args[0].parse::<IpAddr>() else {
        return "1: bad IP address".to_string();
    };
    let Ok(port) = args[1].parse::<u16>() else {
        return "1: bad IP port number".to_string();
    };
    let action = match args.get(2) {
        None => FinishAction::Exit,
        Some(word) => match word.parse::<FinishAction>() {
            Ok(action) => action,
            Err(()) => return "1: action must be 'exit', 'unlink' or 'nothing'".to_string(),
        },
    };
    if args.len() > 3 {
        return "1: unrecognised parameters to mirror".to_string();
    }

    let spec = MirrorSpec {
        target: SocketAddr::new(ip, port),
        action,
    };
    match daemon.start_mirror(spec).await {
        Ok(()) => "0: mirror started".to_string(),
        Err(MirrorError::AlreadyRunning) => "1: mirror already running".to_string(),
        Err(MirrorError::ShuttingDown) => "1: shutting down".to_string(),
        Err(e) => format!("1: {e}"),
    }
}

fn acl_command(daemon: &Arc<Daemon>, args: &[String]) -> String {
    match AclList::parse(args.iter().map(String::as_str), daemon.default_deny()) {
        Ok(acl) => {
            info!(entries = acl.len(), "acl set");
            daemon.set_acl(acl);
            "0: updated".to_string()
        }
        Err(bad) => format!("1: bad spec: {bad}"),
    }
}
