//! Daemon configuration.
//!
//! Command line arguments are parsed into a typed [`Config`] passed
//! explicitly to the services; there is no ambient configuration state.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use imageio_proto::defaults;

/// imageio daemon
#[derive(Parser, Debug)]
#[command(name = "imageiod", version, about = "imageio data and control daemon")]
pub struct Args {
    /// TLS certificate for the remote listener (PEM)
    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    /// TLS private key for the remote listener (PEM)
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// CA certificate used when proxying to an https origin (PEM)
    #[arg(long)]
    pub ca_file: Option<PathBuf>,

    /// Accept TLSv1.1 clients (the TLS backend may refuse)
    #[arg(long)]
    pub enable_tls1_1: bool,

    /// Skip origin certificate verification in proxy mode
    #[arg(long)]
    pub insecure_proxy: bool,

    /// Remote listener address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Remote listener port
    #[arg(short = 'p', long, default_value_t = defaults::REMOTE_PORT)]
    pub port: u16,

    /// Disable the local unix socket listener
    #[arg(long)]
    pub no_local: bool,

    /// Local listener socket path; a leading @ selects the abstract
    /// namespace
    #[arg(long, default_value = defaults::LOCAL_SOCKET)]
    pub local_socket: String,

    /// Control listener unix socket path; when unset the control listener
    /// binds TCP loopback
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Control listener TCP port on loopback
    #[arg(long, default_value_t = defaults::CONTROL_PORT)]
    pub control_port: u16,

    /// Transfer buffer size in bytes
    #[arg(long, default_value_t = defaults::BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Maximum connections per backend
    #[arg(long, default_value_t = defaults::MAX_CONNECTIONS)]
    pub max_connections: u32,

    /// Seconds a ticket may stay at zero connections before expiring
    #[arg(long, default_value_t = defaults::INACTIVITY_TIMEOUT)]
    pub inactivity_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub buffer_size: usize,
    pub max_connections: u32,
    pub inactivity_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub enable_tls1_1: bool,
    pub insecure_proxy: bool,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub enable: bool,
    pub socket: String,
}

/// Where the control listener binds. A unix socket is preferred; TCP stays
/// on loopback so the control plane is never exposed remotely.
#[derive(Debug, Clone)]
pub enum ControlTransport {
    Unix(PathBuf),
    Tcp(u16),
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub transport: ControlTransport,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub tls: TlsConfig,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub control: ControlConfig,
}

impl Config {
    pub fn from_args(args: &Args) -> Config {
        Config {
            daemon: DaemonConfig {
                buffer_size: args.buffer_size,
                max_connections: args.max_connections,
                inactivity_timeout: Duration::from_secs(args.inactivity_timeout),
            },
            tls: TlsConfig {
                cert_file: args.cert_file.clone(),
                key_file: args.key_file.clone(),
                ca_file: args.ca_file.clone(),
                enable_tls1_1: args.enable_tls1_1,
                insecure_proxy: args.insecure_proxy,
            },
            remote: RemoteConfig {
                host: args.host.clone(),
                port: args.port,
            },
            local: LocalConfig {
                enable: !args.no_local,
                socket: args.local_socket.clone(),
            },
            control: ControlConfig {
                transport: match &args.control_socket {
                    Some(path) => ControlTransport::Unix(path.clone()),
                    None => ControlTransport::Tcp(args.control_port),
                },
            },
        }
    }
}
