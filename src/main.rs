//! CLI for relayhub
//!
//! Subcommands:
//! - `server`: run a node (HTTP API, WebSocket listener, optional dispatcher)
//! - `watch`: connect to a node over WebSocket and print what arrives

use std::path::PathBuf;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use relayhub::config::{Settings, load_config, load_config_from};
use relayhub::transport::message::ControlFrame;
use relayhub::utils::logging;
use relayhub::{server, utils::error::ServerError};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "relayhub")]
enum Command {
    /// Run a relayhub node
    Server {
        /// Configuration file; defaults to config/default.toml when present
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Subscribe to topics over WebSocket and print every message received
    Watch {
        /// WebSocket URL of the node
        #[arg(long, default_value = "ws://127.0.0.1:8081")]
        url: String,
        /// Topics to subscribe to
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    match cmd {
        Command::Server { config } => {
            let settings = match load_settings(config) {
                Ok(settings) => settings,
                Err(e) => {
                    logging::init("info");
                    error!("Failed to load configuration: {}", e);
                    std::process::exit(1);
                }
            };
            logging::init(&settings.logging.level);
            if let Err(e) = server::run(settings).await {
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Watch { url, topics } => {
            logging::init("info");
            if let Err(e) = run_watch(&url, &topics).await {
                error!("Watch failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings, ServerError> {
    let settings = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(settings)
}

async fn run_watch(url: &str, topics: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let (mut ws_stream, _response) = connect_async(url).await?;
    info!("connected to {url}");

    for topic in topics {
        let frame = ControlFrame::Subscribe {
            topic: topic.clone(),
        };
        ws_stream
            .send(WsMessage::text(serde_json::to_string(&frame)?))
            .await?;
    }

    loop {
        tokio::select! {
            frame = ws_stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => println!("{}", text.as_str()),
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("connection closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                ws_stream.close(None).await?;
                break;
            }
        }
    }

    Ok(())
}
