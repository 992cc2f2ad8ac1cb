//! groupd server - TCP front end for the persistent group session store
//!
//! Usage:
//!   groupd-server [--config <file.json>] [--listen <addr:port>] [--data <path>] [--log <path>]
//!
//! Protocol (ASCII, `$`-terminated):
//!   new:$              create an empty session
//!   store:<payload>$   overwrite the session with <payload>
//!   restore:$          reply with the session, or `groupNotFound$`
//!   remove:$           delete the session
//!
//! SIGINT/SIGTERM stop the server after queued commands finish and the
//! store is flushed, waiting at most the configured grace period.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use groupd::{Dispatcher, Server, ServerConfig, SessionStore};

fn print_usage() {
    println!("Usage: groupd-server [--config <file>] [--listen <addr>] [--data <path>] [--log <path>]");
    println!();
    println!("Options:");
    println!("  --config       JSON config file (fields default when absent)");
    println!("  --listen       Listen address (default: 0.0.0.0:9995)");
    println!("  --data         Heap file (default: rvm/DATA)");
    println!("  --log          Transaction log file (default: rvm/LOG)");
    println!("  --heap-size    Size of a newly initialized heap in bytes");
    println!("  --capacity     Session buffer capacity in bytes (default: 1000)");
    println!();
    println!("Flags:");
    println!("  -V, --version  Print version information");
    println!("  -h, --help     Print this help message");
    println!();
    println!("Environment:");
    println!("  GROUPD_LOG     Log filter (default: info)");
}

fn load_config(args: &[String]) -> anyhow::Result<ServerConfig> {
    let mut config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args
                .get(i + 1)
                .map(PathBuf::from)
                .context("--config requires a path")?;
            ServerConfig::from_file(&path)
                .with_context(|| format!("loading config {}", path.display()))?
        }
        None => ServerConfig::default(),
    };
    config.apply_args(args)?;
    config.validate()?;
    Ok(config)
}

fn run(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    tracing::info!("starting groupd-server v{}", env!("CARGO_PKG_VERSION"));

    let store = SessionStore::open(&config).with_context(|| {
        format!(
            "opening session store (heap {}, log {})",
            config.data_path.display(),
            config.log_path.display()
        )
    })?;
    tracing::info!(root = ?store.root(), "stored pointer");

    let dispatcher = Dispatcher::spawn(store).context("starting dispatcher")?;
    let server = Server::bind(&config, dispatcher.handle())
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %server.local_addr()?, "listener ready");

    // Graceful shutdown: stop accepting, drain the dispatcher, flush, exit.
    let shutting_down = server.shutdown_flag();
    let grace = config.shutdown_grace();
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("registering signal handlers")?;

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!(
                signal = sig,
                "caught an interrupt signal; exiting cleanly within {:?}",
                grace
            );
            shutting_down.store(true, Ordering::SeqCst);
            match dispatcher.shutdown(grace) {
                Ok(()) => tracing::info!("done"),
                Err(e) => tracing::warn!("unclean shutdown: {}", e),
            }
            std::process::exit(0);
        }
    });

    server.run();
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("groupd-server {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("groupd-server {}", env!("CARGO_PKG_VERSION"));
        println!();
        print_usage();
        std::process::exit(0);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("GROUPD_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&args) {
        eprintln!("[groupd-server] Fatal: {:#}", e);
        std::process::exit(1);
    }
}
