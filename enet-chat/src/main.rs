// enet-chat: line-based chat server and client over the enet bridge.

mod client;
mod config;
mod server;
mod session;

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::info;

use session::{Command, Role, Session};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: enet-chat server\n       enet-chat client [host] [port]";

enum Mode {
    Server,
    Client { host: String, port: Option<u16> },
}

fn parse_mode(args: &[String]) -> anyhow::Result<Mode> {
    match args.first().map(String::as_str) {
        Some("server") => Ok(Mode::Server),
        Some("client") => {
            let host = args.get(1).cloned().unwrap_or_else(|| "localhost".to_string());
            let port = match args.get(2) {
                Some(p) => Some(
                    p.parse::<u16>()
                        .map_err(|_| anyhow::anyhow!("invalid port {:?}", p))?,
                ),
                None => None,
            };
            Ok(Mode::Client { host, port })
        }
        _ => anyhow::bail!("{}", USAGE),
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("enet-chat {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mode = parse_mode(&args)?;
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    let result = match mode {
        Mode::Server => {
            let session = server::open(&cfg)?;
            println!("Server ready. Type messages to broadcast to all clients (or 'quit' to exit):");
            rt.block_on(drive(session))
        }
        Mode::Client { host, port } => {
            let session = client::open(&cfg, &host, port.unwrap_or(cfg.port))?;
            println!("Type messages to send (or 'quit' to exit):");
            rt.block_on(drive(session))
        }
    };
    // Stdin reads park a blocking thread that never wakes on its own.
    rt.shutdown_timeout(Duration::from_millis(100));
    result
}

/// Run the session's event loop on a blocking thread, feeding it stdin lines until `quit`,
/// Ctrl+C or SIGTERM.
async fn drive<R>(session: Session<R>) -> anyhow::Result<()>
where
    R: Role + Send + 'static,
{
    let (tx, rx) = unbounded_channel();
    let mut worker = tokio::task::spawn_blocking(move || session.run(rx));
    tokio::spawn(read_stdin(tx.clone()));
    tokio::select! {
        res = &mut worker => res?,
        res = shutdown_signal() => {
            res?;
            info!("shutting down");
            let _ = tx.send(Command::Quit);
            worker.await?;
        }
    }
    Ok(())
}

async fn read_stdin(tx: UnboundedSender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().eq_ignore_ascii_case("quit") => {
                let _ = tx.send(Command::Quit);
                return;
            }
            Ok(Some(line)) => {
                if tx.send(Command::Line(line)).is_err() {
                    return;
                }
            }
            // EOF: keep running on network events alone.
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("stdin: {}", e);
                return;
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
