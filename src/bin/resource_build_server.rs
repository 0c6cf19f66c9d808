//! CLI & process entry point (C12): parses arguments, initializes logging, starts the
//! server, and drives it until asked to stop.

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use resource_build_server::{config::Config, id::ResourceId, registry, server::Server, ServerError};

#[derive(Parser, Debug)]
#[command(name = "resource-build-server", about = "Long-running resource build orchestrator")]
struct Cli {
    /// Path to the server's INI configuration file.
    #[arg(long, default_value = "ResourceServer.ini")]
    config: PathBuf,

    /// Run a one-shot packaging sweep over these map resource ids (`type:data://path`) and
    /// exit instead of serving requests.
    #[arg(long = "package", value_name = "RESOURCE_ID")]
    package: Vec<String>,

    /// Raise the log level to debug/trace.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("fatal: {error}");
            return ExitCode::from(1);
        }
    };

    let registry = match &config.worker_binary_path {
        Some(path) => registry::default_registry(path.clone()),
        None => {
            eprintln!("fatal: worker_binary_path is not set in {}", cli.config.display());
            return ExitCode::from(1);
        }
    };

    let mut server = match Server::start(&config, registry) {
        Ok(server) => server,
        Err(error @ ServerError::AlreadyRunning(_)) => {
            eprintln!("fatal: {error}");
            return ExitCode::from(2);
        }
        Err(error) => {
            eprintln!("fatal: {error}");
            return ExitCode::from(1);
        }
    };

    if !cli.package.is_empty() {
        return run_packaging(&mut server, &cli.package);
    }

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_requested.clone();
    if ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .is_err()
    {
        tracing::warn!("failed to install Ctrl-C handler; shut down by killing the process");
    }

    server.run_until(|| shutdown_requested.load(Ordering::SeqCst));
    ExitCode::SUCCESS
}

fn run_packaging(server: &mut Server, ids: &[String]) -> ExitCode {
    let mut maps = Vec::new();
    for raw in ids {
        match raw.parse::<ResourceId>() {
            Ok(id) => maps.push(id),
            Err(error) => {
                eprintln!("fatal: invalid --package resource id {raw:?}: {error}");
                return ExitCode::from(1);
            }
        }
    }
    if !server.scheduler_mut().start_packaging(maps) {
        eprintln!("fatal: could not start packaging (empty set, or a sweep is already running)");
        return ExitCode::from(1);
    }
    server.scheduler_mut().run_until_idle(std::time::Duration::from_millis(5), None);
    tracing::info!("packaging complete");
    server.shutdown();
    ExitCode::SUCCESS
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}
