// pb-agent: Long-running Pushbullet client agent.
//
// Connects the real-time stream, mirrors devices and recent pushes, and
// keeps the persisted session fresh until interrupted.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pb-agent", version, about = "Pushbullet client agent")]
struct Args {
    /// Config file path.
    #[arg(long, default_value = "/etc/pb-agent/agent.toml")]
    config: PathBuf,

    /// Store the given access token and exit.
    #[arg(long, value_name = "TOKEN")]
    set_token: Option<String>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "pb-agent starting");

    let cfg = match pb_agent::config::load_config_from_path(&args.config) {
        Ok(cfg) => {
            info!(
                api_base = %cfg.server.api_base,
                store = %cfg.store.sqlite_path.display(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // One-shot token bootstrap mode.
    if let Some(token) = args.set_token {
        let store = match pb_agent::store::Store::open(&cfg.store.sqlite_path) {
            Ok(store) => store,
            Err(e) => {
                eprintln!("FATAL: failed to open store: {}", e);
                std::process::exit(1);
            }
        };
        if let Err(e) = store.set_token(token.trim()) {
            eprintln!("FATAL: failed to save token: {}", e);
            std::process::exit(1);
        }
        println!("token saved");
        return;
    }

    let mut agent = match pb_agent::agent::Agent::new(cfg) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("FATAL: failed to build agent: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = agent.start() {
        eprintln!("FATAL: failed to start agent: {}", e);
        std::process::exit(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(e) => info!(error = %e, "signal listener failed, shutting down"),
    }
    agent.stop().await;
}
