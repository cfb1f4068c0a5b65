use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::{EngineError, HttpSpeech, Narrator, OllamaVision, SpeechConfig, VisionConfig};
use crate::hub::{ClientRegistry, ClientSession};
use crate::protocol::{ClientRequest, ServerMessage};
use crate::robot::RobotLink;

/// Path observers connect to.
pub const CLIENT_PATH: &str = "/ws/client";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("engine init failed: {0}")]
    Engine(#[from] EngineError),
}

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let vision = OllamaVision::new(VisionConfig::from_env())?;
    let speech = HttpSpeech::new(SpeechConfig::from_env())?;

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
    tracing::info!(addr = %config.bind_addr, path = CLIENT_PATH, "listening for clients");

    let hub = ClientRegistry::new(config.client_buffer);
    let robot = RobotLink::new();
    let dispatcher = Arc::new(Dispatcher::new(
        robot.clone(),
        hub.clone(),
        Arc::new(vision),
        Narrator::new(Arc::new(speech)),
        config.dispatch.clone(),
    ));

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", err);
        }
        let _ = shutdown_tx.send(true);
    });

    let robot_task = tokio::spawn(robot.run(config.robot.clone(), hub.clone(), shutdown_rx.clone()));

    client_server(listener, dispatcher, hub, shutdown_rx).await;
    let _ = robot_task.await;
    tracing::info!("server stopped");
    Ok(())
}

async fn client_server(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    hub: ClientRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                break;
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, peer)) => {
                        let dispatcher = dispatcher.clone();
                        let hub = hub.clone();
                        tokio::spawn(async move { handle_connection(stream, peer, dispatcher, hub).await; });
                    }
                    Err(err) => {
                        tracing::warn!("accept error: {}", err);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    hub: ClientRegistry,
) {
    let check_path = |request: &Request, response: Response| {
        if request.uri().path() == CLIENT_PATH {
            Ok(response)
        } else {
            let mut refusal = ErrorResponse::new(Some("not found".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };
    let socket = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::debug!(%peer, "client handshake rejected: {}", err);
            return;
        }
    };
    tracing::info!(%peer, "client connected");

    let (mut writer, mut reader) = socket.split();
    let (session, mut outbox) = hub.register();

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = outbox.recv().await {
            if writer.send(Message::text(payload)).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });

    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_text(text.as_str(), session, &dispatcher, &hub).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(%peer, "client read error: {}", err);
                break;
            }
        }
    }

    hub.remove(session);
    let _ = writer_task.await;
    tracing::info!(%peer, "client disconnected");
}

async fn handle_text(
    text: &str,
    session: ClientSession,
    dispatcher: &Dispatcher,
    hub: &ClientRegistry,
) {
    tracing::info!(session = %session.id, "received from client: {}", text);
    match ClientRequest::parse(text) {
        Ok(request) => dispatcher.dispatch(&request).await,
        Err(err) => {
            tracing::warn!(session = %session.id, "rejecting client message: {}", err);
            hub.send_to(session, &ServerMessage::invalid_json());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::{json, Value};
    use tokio::time::timeout;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    use super::*;
    use crate::config::DispatchConfig;
    use crate::engine::{SpeechSynth, VisionModel};
    use crate::protocol::CommandPlan;

    const WAIT: Duration = Duration::from_secs(5);

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct StopVision;

    #[async_trait]
    impl VisionModel for StopVision {
        async fn infer(&self, _prompt: &str, _image: Option<&str>) -> CommandPlan {
            CommandPlan::fallback("offline")
        }
    }

    struct SilentSpeech;

    #[async_trait]
    impl SpeechSynth for SilentSpeech {
        async fn synthesize(&self, text: &str) -> Result<Bytes, EngineError> {
            Ok(Bytes::from(text.to_string()))
        }
    }

    async fn start_server() -> (SocketAddr, ClientRegistry, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = ClientRegistry::default();
        let dispatcher = Arc::new(Dispatcher::new(
            RobotLink::new(),
            hub.clone(),
            Arc::new(StopVision),
            Narrator::new(Arc::new(SilentSpeech)),
            DispatchConfig {
                step_delay: Duration::from_millis(1),
                ..DispatchConfig::default()
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(client_server(listener, dispatcher, hub.clone(), shutdown_rx));
        (addr, hub, shutdown_tx)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let url = format!("ws://{}{}", addr, CLIENT_PATH);
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let message = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn wait_for_clients(hub: &ClientRegistry, count: usize) {
        timeout(WAIT, async {
            while hub.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn malformed_json_is_reported_to_sender_only() {
        let (addr, hub, _shutdown) = start_server().await;
        let mut sender = connect(addr).await;
        let mut bystander = connect(addr).await;
        wait_for_clients(&hub, 2).await;

        sender.send(Message::text("{not json")).await.unwrap();
        assert_eq!(next_json(&mut sender).await, json!({"error": "Invalid JSON format"}));

        sender
            .send(Message::text(r#"{"command":"describe"}"#))
            .await
            .unwrap();
        let expected = json!({"response": "No image available!", "jetbot_command": "none"});
        assert_eq!(next_json(&mut sender).await, expected);
        assert_eq!(next_json(&mut bystander).await, expected);
    }

    #[tokio::test]
    async fn direct_command_without_robot_is_broadcast() {
        let (addr, hub, _shutdown) = start_server().await;
        let mut client = connect(addr).await;
        wait_for_clients(&hub, 1).await;

        client
            .send(Message::text(r#"{"command":"forward","parameters":{"iterations":2}}"#))
            .await
            .unwrap();
        let expected = json!({"response": "JetBot not connected!", "jetbot_command": "none"});
        assert_eq!(next_json(&mut client).await, expected);
        assert_eq!(next_json(&mut client).await, expected);
    }

    #[tokio::test]
    async fn disconnected_client_leaves_registry() {
        let (addr, hub, _shutdown) = start_server().await;
        let mut client = connect(addr).await;
        wait_for_clients(&hub, 1).await;

        client.close(None).await.unwrap();
        wait_for_clients(&hub, 0).await;
    }

    #[tokio::test]
    async fn other_paths_are_refused() {
        let (addr, hub, _shutdown) = start_server().await;
        let result = tokio_tungstenite::connect_async(format!("ws://{}/ws/robot", addr)).await;
        assert!(result.is_err());
        assert_eq!(hub.len(), 0);
    }
}
