use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use tokio::runtime;
use tracing::{error, info};

use tether::service::setup_tracing;
use tether::{AppResult, Connection, ConnectionHandler, Server, ServerConfig};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Pushes every received payload back to its sender.
struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_connect(&self, conn: &Arc<Connection>) {
        info!("client {} connected", conn.id());
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        info!("client {} disconnected", conn.id());
    }

    fn on_receive(&self, conn: &Arc<Connection>, payload: Bytes) {
        let conn = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.push(payload).await {
                error!("echo to client {} failed: {}", conn.id(), e);
            }
        });
    }
}

fn load_config(commandline: &CommandLine) -> AppResult<ServerConfig> {
    match &commandline.conf {
        Some(path) => ServerConfig::set_up_config(path),
        None => {
            let path = PathBuf::from("./conf.toml");
            if path.exists() {
                ServerConfig::set_up_config(path)
            } else {
                Ok(ServerConfig::default())
            }
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();

    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let server_config = load_config(&commandline)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", server_config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;
    let _log_guard = setup_tracing("logs")?;

    rt.block_on(async {
        let server = Server::new(server_config, Arc::new(EchoHandler));
        let local_addr = server.start().await?;
        info!("tether listening on {}", local_addr);

        tokio::signal::ctrl_c().await?;
        info!("received ctrl-c, shutting down");
        server.stop().await
    })
}
