//! HyperShare daemon and CLI.
//!
//! `hypershare start` runs the node; the query subcommands talk to a
//! running daemon over its IPC socket.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hypershare::ipc::IpcClient;
use hypershare::{Config, Node};

#[derive(Parser)]
#[command(name = "hypershare", version, about = "Peer-to-peer file distribution")]
struct Cli {
    /// Path to a key=value configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon
    Start {
        /// Override server.port
        #[arg(long)]
        port: Option<u16>,
        /// Override storage.base_dir
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Disable UDP discovery
        #[arg(long)]
        no_discovery: bool,
    },
    /// Show daemon status
    Status,
    /// List known peers
    Peers,
    /// List indexed files
    Files,
    /// List transfers
    Transfers,
    /// Share a file through the running daemon
    Share { path: PathBuf },
    /// Download a file by id, optionally from a specific peer
    Download {
        file_id: String,
        #[arg(long)]
        peer: Option<u32>,
    },
}

fn load_config(path: &Option<PathBuf>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load_from_file(path)
            .map_err(|e| format!("cannot read config {}: {}", path.display(), e)),
        None => Ok(Config::default()),
    }
}

async fn query_daemon(config: &Config, command: &str) -> ExitCode {
    let socket = config.ipc_socket_path();
    match IpcClient::request(&socket, command).await {
        Ok(response) => {
            println!("{}", response.message);
            for (key, value) in &response.data {
                println!("{}={}", key, value);
            }
            if response.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!(
                "cannot reach daemon at {}: {} (is it running?)",
                socket.display(),
                e
            );
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(config: Config) -> ExitCode {
    let node = match Node::new(config.clone()) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("failed to initialize node: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = node.start().await {
        eprintln!("failed to start node: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        peer = node.local_peer_id(),
        fingerprint = %node.fingerprint(),
        port = node.listen_port(),
        "daemon running, ctrl-c to stop"
    );

    // Drain events into the log until interrupted
    let mut events = node.events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Some(event) => info!(?event, "event"),
                    None => break,
                }
            }
        }
    }

    node.shutdown();
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Start {
            port,
            base_dir,
            no_discovery,
        } => {
            if let Some(port) = port {
                config.set("server.port", port.to_string());
            }
            if let Some(base_dir) = base_dir {
                config.set("storage.base_dir", base_dir.to_string_lossy().to_string());
            }
            if no_discovery {
                config.set("discovery.enabled", "false");
            }

            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level()));
            tracing_subscriber::fmt().with_env_filter(filter).init();

            run_daemon(config).await
        }
        Command::Status => query_daemon(&config, "status").await,
        Command::Peers => query_daemon(&config, "peers").await,
        Command::Files => query_daemon(&config, "files").await,
        Command::Transfers => query_daemon(&config, "transfers").await,
        Command::Share { path } => {
            let path = match path.canonicalize() {
                Ok(path) => path,
                Err(e) => {
                    eprintln!("cannot resolve {}: {}", path.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            query_daemon(&config, &format!("share {}", path.display())).await
        }
        Command::Download { file_id, peer } => {
            let command = match peer {
                Some(peer) => format!("download {} {}", file_id, peer),
                None => format!("download {}", file_id),
            };
            query_daemon(&config, &command).await
        }
    }
}
