//! ESDM daemon.
//!
//! Binds the privileged RPC socket as root, forks into reaper and
//! server, drops privileges and serves random bytes until terminated.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::{error, info, warn};

use esdm::config::{ConfigError, EsdmConfig};
use esdm::daemon::{self, drop_privileges_permanent, run_with_reaper, ReaperError, StatusShm};
use esdm::drng::DrngManager;
use esdm::rpc::{RpcServer, SocketKind};
use esdm::sources::{KernelRngSource, SourceRegistry};

#[derive(Debug, Parser)]
#[command(name = "esdmd", version, about = "Entropy source and DRNG manager daemon")]
struct Cli {
    /// User to drop privileges to.
    #[arg(long)]
    user: Option<String>,

    /// Force SP800-90C (FIPS) operation.
    #[arg(long)]
    fips: bool,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Serve Prometheus metrics on this port.
    #[cfg(feature = "metrics")]
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot bind RPC socket: {0}")]
    Bind(std::io::Error),
    #[error(transparent)]
    Reaper(#[from] ReaperError),
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<EsdmConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => EsdmConfig::load(path)?,
        None => EsdmConfig::default(),
    };

    if let Some(user) = &cli.user {
        config.user = user.clone();
    }
    config.fips = config.fips || cli.fips;
    config.validate()?;
    Ok(config)
}

fn build_manager(config: &EsdmConfig, sp80090c: bool) -> DrngManager {
    let mut sources = SourceRegistry::new();
    if sp80090c || !config.credit_kernel_rng {
        // The kernel RNG is not an SP800-90B source; mix it in without
        // entropy credit.
        sources.register(Box::new(KernelRngSource::uncredited()));
    } else {
        sources.register(Box::new(KernelRngSource::new()));
    }

    DrngManager::new(config.manager_config(sp80090c), sources)
}

/// Runs the forked server process; returns its exit code.
fn server_main(
    server: Arc<RpcServer>,
    priv_listener: std::os::unix::net::UnixListener,
    config: &EsdmConfig,
) -> i32 {
    let manager = Arc::clone(server.manager());

    // Publish service state for local monitors. Non-fatal: the RPC
    // status method remains authoritative.
    let status_shm = match StatusShm::create() {
        Ok(shm) => Some(Arc::new(shm)),
        Err(err) => {
            warn!(%err, "Status segment unavailable");
            None
        }
    };

    {
        let server = Arc::clone(&server);
        if let Err(err) = ctrlc::set_handler(move || server.request_exit()) {
            error!(%err, "Cannot install termination handler");
            return 1;
        }
    }

    let unpriv_worker = match server.spawn_unprivileged() {
        Ok(handle) => handle,
        Err(err) => {
            error!(%err, "Cannot start unprivileged RPC worker");
            return 1;
        }
    };

    if let Some(shm) = &status_shm {
        let shm = Arc::clone(shm);
        let manager = Arc::clone(&manager);
        let spawned = std::thread::Builder::new()
            .name("esdm-status".into())
            .spawn(move || {
                while !manager.state().exiting() {
                    shm.update(&manager.status());
                    std::thread::sleep(Duration::from_millis(500));
                }
            });
        if let Err(err) = spawned {
            warn!(%err, "Status mirror thread unavailable");
        }
    }

    // Seed opportunistically before clients arrive.
    manager.try_seed();

    if let Err(err) = drop_privileges_permanent(&config.user) {
        error!(%err, "Privilege drop failed");
        server.request_exit();
        return 1;
    }

    // Both sockets go live together.
    server.signal_privileges_dropped();
    info!(version = esdm::VERSION, "ESDM daemon ready");

    server.serve_privileged(priv_listener);

    let _ = unpriv_worker.join();
    info!("ESDM daemon shut down");
    0
}

#[cfg(feature = "metrics")]
fn spawn_metrics_server(manager: Arc<DrngManager>, port: u16) {
    use esdm::metrics::{MetricsRegistry, MetricsServer, MetricsServerConfig};

    let registry = match MetricsRegistry::new() {
        Ok(registry) => registry,
        Err(err) => {
            warn!(%err, "Metrics registry unavailable");
            return;
        }
    };

    let spawned = std::thread::Builder::new()
        .name("esdm-metrics".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(%err, "Metrics runtime unavailable");
                    return;
                }
            };

            let server =
                MetricsServer::new(MetricsServerConfig::with_port(port), registry, manager);
            if let Err(err) = runtime.block_on(server.run()) {
                warn!(%err, "Metrics server terminated");
            }
        });
    if let Err(err) = spawned {
        warn!(%err, "Metrics thread unavailable");
    }
}

fn run(cli: Cli) -> Result<i32, StartupError> {
    let config = load_config(&cli)?;
    let sp80090c = daemon::sp80090c_requested(config.fips);
    if sp80090c {
        info!("Operating SP800-90C compliant");
    }

    let manager = Arc::new(build_manager(&config, sp80090c));
    let server = Arc::new(RpcServer::new(Arc::clone(&manager), config.server_config()));

    // The privileged socket is bound before the fork so a startup
    // failure is reported synchronously with exit code 1.
    let priv_listener = server
        .bind_listener(SocketKind::Privileged)
        .map_err(StartupError::Bind)?;

    let server_config = config.server_config();
    #[cfg(feature = "metrics")]
    let metrics_port = cli.metrics_port;

    let code = run_with_reaper(
        move || {
            #[cfg(feature = "metrics")]
            if let Some(port) = metrics_port {
                spawn_metrics_server(Arc::clone(server.manager()), port);
            }
            server_main(server, priv_listener, &config)
        },
        move || {
            RpcServer::cleanup_sockets(&server_config);
            daemon::remove_status();
        },
    )?;

    Ok(code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("ESDM daemon v{}", esdm::VERSION);

    match run(cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!(%err, "Startup failed");
            ExitCode::FAILURE
        }
    }
}
