//! sockchain - SOCKS5 proxy chaining server
//!
//! This is the main entry point for the sockchain application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sockchain::config::Loader;
use sockchain::dispatch::serve;
use sockchain::picker::picker_by_name;
use sockchain::server::Server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// SOCKS5 proxy server forwarding through chains of upstream proxies
#[derive(Parser, Debug)]
#[command(name = "sockchain")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen on address
    #[arg(short = 'a', long, default_value = "127.0.0.1:1080")]
    addr: String,

    /// Listen on network (tcp, unix)
    #[arg(short = 'n', long, default_value = "tcp")]
    network: String,

    /// Load chain description file (repeatable; stdin when absent)
    #[arg(short = 'c', long = "config")]
    config: Vec<PathBuf>,

    /// If a chain connection fails, retry with another one x times
    #[arg(short = 'r', long, default_value_t = 0)]
    retry: u32,

    /// Chain selection policy (round-robin, random)
    #[arg(short = 'p', long, default_value = "round-robin")]
    picker: String,

    /// Log additional info
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose)?;

    let picker = picker_by_name(&args.picker)
        .with_context(|| format!("unknown picker `{}`", args.picker))?;

    let mut loader = Loader::new();
    if args.config.is_empty() {
        info!("no specified config files, reading from stdin");
        let stdin = std::io::stdin();
        loader.load("<stdin>", stdin.lock(), picker.as_ref())?;
    } else {
        for path in &args.config {
            loader.load_file(path, picker.as_ref())?;
        }
    }

    if picker.is_empty() {
        bail!("no loaded proxies");
    }

    if args.verbose {
        for (i, chain) in picker.all().iter().enumerate() {
            info!("chain {}: {}", i, chain);
        }
    }

    let server = Arc::new(Server::listen(&args.network, &args.addr).await?);
    info!("listening on {} {}", args.network, args.addr);

    // close the listener on Ctrl+C or SIGTERM; the accept loop then
    // winds down on its own
    let shutdown_server = Arc::clone(&server);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutting down");
        let _ = shutdown_server.close();
    });

    serve(server, picker, args.retry).await;

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Setup logging based on the verbose flag
fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
