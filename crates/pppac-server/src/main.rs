use clap::Parser;
use pppac_server::config::Properties;
use pppac_server::control::ControlServer;
use pppac_server::daemon::Daemon;
use pppac_server::radius::UdpRadiusClient;
use pppac_server::server::{NullTunnelLayer, SharedDaemon};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// pppacd - PPP access concentrator daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "pppacd")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "pppacd.conf")]
    config_path: PathBuf,

    /// Validate configuration and exit (doesn't start the daemon)
    #[arg(short, long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let props = match Properties::from_file(&cli.config_path) {
        Ok(props) => props,
        Err(e) => {
            eprintln!("cannot load {}: {}", cli.config_path.display(), e);
            process::exit(1);
        }
    };

    let daemon = match Daemon::new(props) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            process::exit(1);
        }
    };

    if cli.validate {
        let config = daemon.config();
        println!("configuration validated successfully");
        println!();
        println!("Configuration summary:");
        println!("  Max sessions: {}", config.max_session);
        println!("  Pools: {}", config.pools.len());
        for pool in &config.pools {
            println!(
                "    {} ({} static, {} dynamic ranges)",
                pool.label,
                pool.static_ranges.len(),
                pool.dynamic_ranges.len()
            );
        }
        println!("  Control socket: {}", config.control_socket.display());
        process::exit(0);
    }

    let log_level = daemon
        .config()
        .log_level
        .clone()
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("pppacd v{}", env!("CARGO_PKG_VERSION"));
    info!("loaded configuration from {}", cli.config_path.display());

    let control_socket = daemon.config().control_socket.clone();
    let shared = SharedDaemon::new(
        daemon,
        Arc::new(UdpRadiusClient),
        Arc::new(NullTunnelLayer),
    );

    let control = match ControlServer::bind(shared.clone(), &control_socket) {
        Ok(control) => control.spawn(),
        Err(e) => {
            error!("cannot bind control socket {}: {e}", control_socket.display());
            process::exit(1);
        }
    };
    let timer = shared.run_timer();

    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("cannot install SIGHUP handler: {e}");
            process::exit(1);
        }
    };

    info!("daemon started");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP: reloading {}", cli.config_path.display());
                match Properties::from_file(&cli.config_path) {
                    Ok(props) => {
                        if let Err(e) = shared.reload(props).await {
                            warn!("reload failed, previous configuration stays active: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("reload failed, previous configuration stays active: {e}");
                    }
                }
            }
        }
    }

    control.abort();
    timer.abort();
    std::fs::remove_file(&control_socket).ok();
}
