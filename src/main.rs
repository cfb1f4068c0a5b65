mod cli;
mod config;
mod dispatcher;
mod engine;
mod hub;
mod orchestrator;
mod protocol;
mod robot;
mod watchdog;

use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

use crate::cli::{ClientAction, Cli, Command};
use crate::config::{DispatchConfig, ServerConfig};
use crate::protocol::ServerMessage;
use crate::robot::RobotLinkConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("jetbot_relay=debug".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server {
            bind,
            robot_url,
            reconnect_ms,
            robot_idle_ms,
            client_buffer,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                robot: RobotLinkConfig {
                    url: robot_url,
                    reconnect_backoff: Duration::from_millis(reconnect_ms),
                    idle_timeout: robot_idle_ms.map(Duration::from_millis),
                },
                client_buffer,
                dispatch: DispatchConfig::default(),
            };
            orchestrator::run_server(config).await.map_err(|err| err.into())
        }
        Command::Client {
            addr,
            replies,
            timeout_secs,
            action,
        } => {
            let request = match action {
                ClientAction::Drive { motion, iterations } => json!({
                    "command": motion.as_str(),
                    "parameters": {"iterations": iterations},
                }),
                ClientAction::Describe { text } => {
                    let mut parameters = serde_json::Map::new();
                    if let Some(text) = text {
                        parameters.insert("text".to_string(), Value::String(text));
                    }
                    json!({"command": "describe", "parameters": parameters})
                }
                ClientAction::Custom { text, iterations } => json!({
                    "command": "custom",
                    "parameters": {"text": text, "iterations": iterations},
                }),
                ClientAction::Autonomous {
                    text,
                    iterations,
                    delay,
                } => {
                    let mut parameters = json!({"text": text, "iterations": iterations});
                    if let Some(delay) = delay {
                        parameters["delay"] = json!(delay);
                    }
                    json!({"command": "autonomous", "parameters": parameters})
                }
            };

            let wait = Duration::from_secs(timeout_secs);
            match tokio::time::timeout(wait, send_command(&addr, request, replies)).await {
                Ok(result) => result?,
                Err(_) => println!("timed out after {}s", timeout_secs),
            }
            Ok(())
        }
    }
}

async fn send_command(addr: &str, request: Value, replies: usize) -> Result<(), String> {
    let (mut socket, _) = tokio_tungstenite::connect_async(addr)
        .await
        .map_err(|err| format!("connect failed: {}", err))?;

    let payload =
        serde_json::to_string(&request).map_err(|err| format!("serialize failed: {}", err))?;
    socket
        .send(Message::text(payload))
        .await
        .map_err(|err| format!("write failed: {}", err))?;

    let mut received = 0;
    let mut frames = 0u64;
    while received < replies {
        let message = match socket.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Err(format!("read failed: {}", err)),
            None => return Err("server closed the connection".to_string()),
        };
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ServerMessage>(text.as_str()) {
            Ok(ServerMessage::Image { .. }) => frames += 1,
            Ok(ServerMessage::Error { error }) => {
                println!("error: {}", error);
                received += 1;
            }
            Ok(ServerMessage::Result(result)) => {
                println!("{}: {}", result.jetbot_command, result.response);
                if let Some(description) = result.description {
                    println!("  description: {}", description);
                }
                received += 1;
            }
            Err(err) => return Err(format!("invalid reply: {}", err)),
        }
    }

    tracing::debug!(frames, "camera frames received while waiting");
    let _ = socket.close(None).await;
    Ok(())
}
