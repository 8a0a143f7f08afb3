//! imageio daemon.
//!
//! Serves virtual disk images over HTTPS for random read/write transfer,
//! authorized by ephemeral in-memory tickets installed over a co-located
//! control listener.
//!
//! The daemon runs three listeners sharing one handler stack:
//! 1. Remote TLS data listener (default port 54322)
//! 2. Local unix-socket data listener (for co-located clients)
//! 3. Control listener (unix socket or TCP loopback)

mod auth;
mod backend;
mod buf;
mod config;
mod http;
mod ops;
mod tls;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::auth::Authorizer;
use crate::config::{Args, Config, ControlTransport};
use crate::http::AppState;

/// How often idle tickets are checked against their inactivity timeout.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Grace given to in-flight transfers on shutdown before disconnecting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("imageiod v{} starting", env!("CARGO_PKG_VERSION"));

    let cfg = Arc::new(Config::from_args(&args));
    let auth = Authorizer::new(cfg.daemon.inactivity_timeout);
    let shutdown = Arc::new(Notify::new());

    let data_state = AppState {
        auth: Arc::clone(&auth),
        cfg: Arc::clone(&cfg),
        control: false,
    };
    let control_state = AppState {
        auth: Arc::clone(&auth),
        cfg: Arc::clone(&cfg),
        control: true,
    };

    // ---------------------------------------------------------------
    // Remote TLS data listener
    // ---------------------------------------------------------------
    match (&cfg.tls.cert_file, &cfg.tls.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let tls_config =
                match tls::server_config(cert_file, key_file, cfg.tls.enable_tls1_1) {
                    Ok(config) => config,
                    Err(e) => {
                        error!("cannot load TLS configuration: {}", e);
                        std::process::exit(1);
                    }
                };

            let host: IpAddr = cfg
                .remote
                .host
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            let addr = SocketAddr::new(host, cfg.remote.port);
            let router = http::data_router(data_state.clone());
            let shutdown_remote = Arc::clone(&shutdown);
            tokio::spawn(async move {
                if let Err(e) = tls::serve(addr, router, tls_config, shutdown_remote).await {
                    error!("remote listener failed: {}", e);
                }
            });
        }
        _ => {
            info!("remote listener disabled: no TLS certificate configured");
        }
    }

    // ---------------------------------------------------------------
    // Local unix-socket data listener
    // ---------------------------------------------------------------
    if cfg.local.enable {
        let socket = cfg.local.socket.clone();
        let router = http::data_router(data_state.clone());
        let shutdown_local = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let wait = async move { shutdown_local.notified().await };
            if let Err(e) = http::serve_unix(&socket, router, wait).await {
                error!("local listener failed: {}", e);
            }
        });
    }

    // ---------------------------------------------------------------
    // Control listener
    // ---------------------------------------------------------------
    {
        let router = http::control_router(control_state);
        let shutdown_control = Arc::clone(&shutdown);
        let transport = cfg.control.transport.clone();
        tokio::spawn(async move {
            let wait = async move { shutdown_control.notified().await };
            let result = match transport {
                ControlTransport::Unix(path) => {
                    http::serve_unix(&path.to_string_lossy(), router, wait).await
                }
                ControlTransport::Tcp(port) => {
                    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
                    http::serve_tcp(addr, router, wait).await
                }
            };
            if let Err(e) = result {
                error!("control listener failed: {}", e);
            }
        });
    }

    // ---------------------------------------------------------------
    // Inactivity sweeper
    // ---------------------------------------------------------------
    {
        let auth = Arc::clone(&auth);
        let shutdown_sweep = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => auth.expire_inactive(),
                    _ = shutdown_sweep.notified() => return,
                }
            }
        });
    }

    info!("imageiod ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot wait for signals: {}", e);
    }

    info!("imageiod shutting down");
    shutdown.notify_waiters();

    // Cancel all tickets, giving in-flight transfers a moment to finish
    // before their connections drop.
    auth.clear(SHUTDOWN_GRACE).await;

    info!("imageiod stopped");
}
