//! imageio admin tool.
//!
//! Manages tickets on a running imageiod by talking to its control
//! listener, over the unix socket or TCP loopback.
//!
//! # Usage
//!
//! ```text
//! imageioctl [OPTIONS] <COMMAND>
//!
//! Commands:
//!   add-ticket    Install a ticket from a JSON file
//!   show-ticket   Show ticket status
//!   mod-ticket    Extend or expire a ticket
//!   del-ticket    Cancel and remove a ticket
//!   list-tickets  List installed ticket ids
//! ```
//!
//! Exit codes: 0 on success, 2 on usage errors, 1 on runtime failures.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing_subscriber::EnvFilter;

use imageio_client::control::{ControlAddress, ControlClient};
use imageio_proto::{defaults, ImageResult, TicketSpec};

/// imageio daemon admin tool.
#[derive(Parser)]
#[command(name = "imageioctl", version, about = "imageio daemon admin tool")]
struct Cli {
    /// Control listener unix socket path
    #[arg(short = 's', long)]
    socket: Option<PathBuf>,

    /// Control listener TCP port on loopback, used when no socket is given
    #[arg(short = 'p', long, default_value_t = defaults::CONTROL_PORT)]
    port: u16,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a ticket from a JSON file
    AddTicket {
        /// Ticket JSON file
        file: PathBuf,
    },
    /// Show ticket status
    ShowTicket {
        /// Ticket id
        id: String,
    },
    /// Extend or expire a ticket
    ModTicket {
        /// Ticket id
        id: String,
        /// New timeout in seconds; 0 expires the ticket now
        #[arg(long)]
        timeout: u64,
    },
    /// Cancel and remove a ticket
    DelTicket {
        /// Ticket id
        id: String,
        /// Force removal after this many seconds, disconnecting users
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List installed ticket ids
    ListTickets,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let address = match &cli.socket {
        Some(path) => ControlAddress::Unix(path.clone()),
        None => ControlAddress::Tcp("127.0.0.1".into(), cli.port),
    };

    match run(address, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("imageioctl: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(address: ControlAddress, command: Commands) -> ImageResult<()> {
    let client = ControlClient::new(address)?;

    match command {
        Commands::AddTicket { file } => {
            let data = std::fs::read(&file)?;
            let spec: TicketSpec = serde_json::from_slice(&data).map_err(|e| {
                imageio_proto::Error::BadRequest(format!("invalid ticket file {file:?}: {e}"))
            })?;
            spec.validate()?;
            client.add_ticket(&spec).await?;
            println!("Added ticket {}", spec.uuid);
        }

        Commands::ShowTicket { id } => {
            let info = client.get_ticket(&id).await?;
            print_ticket(&info);
        }

        Commands::ModTicket { id, timeout } => {
            client.extend_ticket(&id, timeout).await?;
            println!("Updated ticket {id}");
        }

        Commands::DelTicket { id, timeout } => {
            client.delete_ticket(&id, timeout).await?;
            println!("Removed ticket {id}");
        }

        Commands::ListTickets => {
            let ids = client.list_tickets().await?;
            for id in ids {
                println!("{id}");
            }
        }
    }
    Ok(())
}

/// Render a ticket status as a two column table.
fn print_ticket(info: &serde_json::Value) {
    let mut builder = Builder::default();
    builder.push_record(["Field", "Value"]);

    if let Some(map) = info.as_object() {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for key in keys {
            let value = match &map[key] {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            builder.push_record([key.clone(), value]);
        }
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{table}");
}
