use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::hub::ClientRegistry;
use crate::protocol::{RobotCommand, ServerMessage, Telemetry};
use crate::watchdog::{self, Heartbeat};

const OUTBOUND_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("robot not connected")]
    NotConnected,
    #[error("robot connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A command waiting for the session task, with the slot its write result
/// is reported through.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) payload: String,
    pub(crate) ack: oneshot::Sender<Result<(), LinkError>>,
}

/// Latest camera frame received from the robot.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image: String,
    pub captured_at: Instant,
}

#[derive(Debug, Clone)]
pub struct RobotLinkConfig {
    pub url: String,
    pub reconnect_backoff: Duration,
    pub idle_timeout: Option<Duration>,
}

/// The single connection to the robot.
///
/// While a connection is live its session task owns the socket and drains an
/// outbound queue, so commands from concurrent callers are written whole and
/// one at a time. [`RobotLink::send`] resolves once its command is on the
/// wire. Between connections the outbound slot is empty and `send` fails fast
/// with [`LinkError::NotConnected`]; commands still queued when a session
/// ends report the same error.
#[derive(Clone)]
pub struct RobotLink {
    outbound: Arc<RwLock<Option<mpsc::Sender<Outbound>>>>,
    frame_tx: Arc<watch::Sender<Option<Frame>>>,
}

impl RobotLink {
    pub fn new() -> Self {
        let (frame_tx, _) = watch::channel(None);
        Self {
            outbound: Arc::new(RwLock::new(None)),
            frame_tx: Arc::new(frame_tx),
        }
    }

    pub async fn send(&self, command: &RobotCommand) -> Result<(), LinkError> {
        let payload = serde_json::to_string(command)?;
        let tx = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or(LinkError::NotConnected)?;
        let (ack, written) = oneshot::channel();
        tx.send(Outbound { payload, ack })
            .await
            .map_err(|_| LinkError::NotConnected)?;
        written.await.map_err(|_| LinkError::NotConnected)??;
        tracing::debug!(command = %command.command, "robot command sent");
        Ok(())
    }

    #[cfg(test)]
    pub async fn is_connected(&self) -> bool {
        self.outbound
            .read()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn current_frame(&self) -> Option<Frame> {
        self.frame_tx.borrow().clone()
    }

    pub(crate) fn store_frame(&self, image: String) {
        self.frame_tx.send_replace(Some(Frame {
            image,
            captured_at: Instant::now(),
        }));
    }

    pub(crate) async fn attach(&self, tx: mpsc::Sender<Outbound>) {
        *self.outbound.write().await = Some(tx);
    }

    pub(crate) async fn detach(&self) {
        *self.outbound.write().await = None;
    }

    /// Keeps the link connected until `shutdown` flips.
    pub async fn run(
        self,
        config: RobotLinkConfig,
        hub: ClientRegistry,
        shutdown: watch::Receiver<bool>,
    ) {
        let url = config.url.clone();
        let session_link = self.clone();
        watchdog::supervise(
            "robot_link",
            config.reconnect_backoff,
            config.idle_timeout,
            shutdown,
            move |heartbeat| {
                let link = session_link.clone();
                let hub = hub.clone();
                let url = url.clone();
                async move { link.run_session(&url, &hub, heartbeat).await }
            },
        )
        .await;
        self.detach().await;
    }

    async fn run_session(
        &self,
        url: &str,
        hub: &ClientRegistry,
        heartbeat: Heartbeat,
    ) -> Result<(), LinkError> {
        let (stream, _response) = match tokio_tungstenite::connect_async(url).await {
            Ok(connected) => connected,
            Err(err) => {
                tracing::error!(url, "robot connection failed: {}", err);
                return Err(err.into());
            }
        };
        tracing::info!(url, "connected to robot");
        heartbeat.tick();

        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
        self.attach(tx).await;

        let result = loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(Outbound { payload, ack }) = outgoing else {
                        break Err(LinkError::Closed);
                    };
                    match write.send(Message::text(payload)).await {
                        Ok(()) => {
                            let _ = ack.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = ack.send(Err(LinkError::NotConnected));
                            break Err(err.into());
                        }
                    }
                }
                incoming = read.next() => {
                    heartbeat.tick();
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_telemetry(text.as_str(), hub),
                        Some(Ok(Message::Binary(data))) => {
                            tracing::debug!(bytes = data.len(), "ignoring binary robot message");
                        }
                        Some(Ok(Message::Close(reason))) => {
                            tracing::info!("robot closed connection: {:?}", reason);
                            break Err(LinkError::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break Err(err.into()),
                        None => break Err(LinkError::Closed),
                    }
                }
            }
        };

        // Unwritten commands fail with NotConnected once their acks drop.
        drop(rx);
        self.detach().await;
        tracing::warn!("robot link dropped");
        result
    }

    fn handle_telemetry(&self, text: &str, hub: &ClientRegistry) {
        let telemetry: Telemetry = match serde_json::from_str(text) {
            Ok(telemetry) => telemetry,
            Err(err) => {
                tracing::warn!("ignoring malformed robot message: {}", err);
                return;
            }
        };
        match telemetry.image {
            Some(image) if !image.is_empty() => {
                self.store_frame(image.clone());
                let delivered = hub.broadcast(&ServerMessage::Image { image });
                tracing::trace!(delivered, "frame relayed");
            }
            _ => tracing::debug!("robot telemetry: {}", text),
        }
    }
}

impl Default for RobotLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    async fn fake_robot() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    fn config(url: String) -> RobotLinkConfig {
        RobotLinkConfig {
            url,
            reconnect_backoff: Duration::from_millis(50),
            idle_timeout: None,
        }
    }

    async fn wait_connected(link: &RobotLink, connected: bool) {
        timeout(WAIT, async {
            while link.is_connected().await != connected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn send_without_connection_is_rejected() {
        let link = RobotLink::new();
        let result = link.send(&RobotCommand::new("forward", 0.5, 1.0)).await;
        assert!(matches!(result, Err(LinkError::NotConnected)));
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn send_resolves_after_command_is_written() {
        let link = RobotLink::new();
        let (tx, mut rx) = mpsc::channel(4);
        link.attach(tx).await;

        let sender = link.clone();
        let pending =
            tokio::spawn(async move { sender.send(&RobotCommand::new("left", 0.3, 0.5)).await });
        let Outbound { payload, ack } = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&payload).unwrap(),
            json!({"command": "left", "parameters": {"speed": 0.3, "duration": 0.5}})
        );
        assert!(!pending.is_finished());
        ack.send(Ok(())).unwrap();
        timeout(WAIT, pending).await.unwrap().unwrap().unwrap();

        link.detach().await;
        assert!(matches!(
            link.send(&RobotCommand::new("left", 0.3, 0.5)).await,
            Err(LinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn unwritten_command_reports_not_connected() {
        let link = RobotLink::new();
        let (tx, mut rx) = mpsc::channel(4);
        link.attach(tx).await;

        let sender = link.clone();
        let pending =
            tokio::spawn(async move { sender.send(&RobotCommand::new("forward", 0.5, 1.0)).await });
        let outbound = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        drop(outbound);

        let result = timeout(WAIT, pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(LinkError::NotConnected)));
    }

    #[tokio::test]
    async fn full_queue_does_not_block_detach_or_later_sends() {
        let link = RobotLink::new();
        let (tx, rx) = mpsc::channel(1);
        link.attach(tx).await;

        let mut waiting = Vec::new();
        for _ in 0..2 {
            let sender = link.clone();
            waiting.push(tokio::spawn(async move {
                sender.send(&RobotCommand::new("forward", 0.5, 1.0)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(WAIT, link.detach()).await.unwrap();
        let later = timeout(WAIT, link.send(&RobotCommand::new("stop", 0.0, 0.0)))
            .await
            .unwrap();
        assert!(matches!(later, Err(LinkError::NotConnected)));

        drop(rx);
        for task in waiting {
            let result = timeout(WAIT, task).await.unwrap().unwrap();
            assert!(matches!(result, Err(LinkError::NotConnected)));
        }
    }

    #[tokio::test]
    async fn relays_frames_and_commands_over_websocket() {
        let (listener, url) = fake_robot().await;
        let hub = ClientRegistry::default();
        let (_observer, mut observer_rx) = hub.register();
        let link = RobotLink::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(link.clone().run(config(url), hub.clone(), shutdown_rx));

        let (stream, _) = listener.accept().await.unwrap();
        let mut robot = tokio_tungstenite::accept_async(stream).await.unwrap();
        robot
            .send(Message::text(r#"{"battery": 0.7}"#))
            .await
            .unwrap();
        robot
            .send(Message::text(r#"{"image": "ZnJhbWU=", "battery": 0.7}"#))
            .await
            .unwrap();

        let relayed = timeout(WAIT, observer_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&relayed).unwrap(),
            json!({"image": "ZnJhbWU="})
        );
        assert_eq!(link.current_frame().unwrap().image, "ZnJhbWU=");

        wait_connected(&link, true).await;
        link.send(&RobotCommand::new("dance", 0.5, 1.0)).await.unwrap();
        let received = loop {
            match timeout(WAIT, robot.next()).await.unwrap().unwrap().unwrap() {
                Message::Text(text) => break text.to_string(),
                _ => continue,
            }
        };
        assert_eq!(
            serde_json::from_str::<Value>(&received).unwrap(),
            json!({"command": "dance", "parameters": {"speed": 0.5, "duration": 1.0}})
        );

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn reconnects_after_robot_drops() {
        let (listener, url) = fake_robot().await;
        let link = RobotLink::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(link.clone().run(
            config(url),
            ClientRegistry::default(),
            shutdown_rx,
        ));

        let (stream, _) = listener.accept().await.unwrap();
        let mut first = tokio_tungstenite::accept_async(stream).await.unwrap();
        wait_connected(&link, true).await;
        first.close(None).await.unwrap();
        drop(first);
        wait_connected(&link, false).await;

        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let _second = tokio_tungstenite::accept_async(stream).await.unwrap();
        wait_connected(&link, true).await;

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_telemetry_keeps_connection() {
        let (listener, url) = fake_robot().await;
        let link = RobotLink::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(link.clone().run(
            config(url),
            ClientRegistry::default(),
            shutdown_rx,
        ));

        let (stream, _) = listener.accept().await.unwrap();
        let mut robot = tokio_tungstenite::accept_async(stream).await.unwrap();
        robot.send(Message::text("not json")).await.unwrap();
        robot.send(Message::text(r#"{"image": "YWJj"}"#)).await.unwrap();

        let mut frames = link.frame_tx.subscribe();
        timeout(WAIT, frames.wait_for(|frame| frame.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert!(link.is_connected().await);

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
    }
}
