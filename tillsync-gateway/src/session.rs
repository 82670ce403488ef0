//! Persistent WebSocket session with the edge gateway.
//!
//! Registers on connect, heartbeats every 30s, and reconnects after a
//! fixed delay whenever the socket closes. The gateway is a single
//! trusted venue-local endpoint, so reconnection never gives up; only
//! `stop()` ends the session.

use crate::client::GatewayConfig;
use crate::protocol::GatewayMessage;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tillsync_types::RequestId;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Events surfaced from the gateway session.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// The socket connected and registration was acknowledged.
    Registered,
    /// The socket dropped; a reconnect is scheduled.
    Disconnected,
    /// The gateway accepted a forwarded command into its queue.
    CommandQueued(RequestId),
    /// Queue progress pushed by the gateway.
    SyncStatus { pending: u64, synced: u64, failed: u64 },
}

/// WebSocket session with automatic reconnect.
pub struct GatewaySession {
    config: GatewayConfig,
    connected_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<GatewayEvent>,
    /// Local pending-queue depth reported in heartbeats.
    pending_depth: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewaySession {
    /// Creates a session for the given config. Nothing connects until
    /// [`GatewaySession::start`].
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let (connected_tx, _) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            connected_tx,
            event_tx,
            pending_depth: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Watch channel tracking socket connectivity.
    #[must_use]
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Whether the socket is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Subscribes to session events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_tx.subscribe()
    }

    /// Updates the pending-queue depth carried in heartbeats.
    pub fn set_pending_depth(&self, depth: u64) {
        self.pending_depth.store(depth, Ordering::Relaxed);
    }

    /// Opens the session. A no-op when no gateway is configured or the
    /// session is already running.
    pub fn start(&self) {
        let Some(url) = self.config.ws_url() else {
            warn!("gateway session not started: no endpoint configured");
            return;
        };
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let config = self.config.clone();
        let connected_tx = self.connected_tx.clone();
        let event_tx = self.event_tx.clone();
        let pending_depth = self.pending_depth.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    conn = connect_async(url.clone()) => match conn {
                        Ok((stream, _)) => {
                            info!("gateway session connected to {url}");
                            // send_replace, not send: the flag must land
                            // even when nobody holds a watch receiver.
                            connected_tx.send_replace(true);
                            run_session(stream, &config, &event_tx, &pending_depth, &mut shutdown_rx)
                                .await;
                            connected_tx.send_replace(false);
                            let _ = event_tx.send(GatewayEvent::Disconnected);
                        }
                        Err(e) => {
                            debug!("gateway connect failed: {e}");
                        }
                    },
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                }
            }
        }));
    }

    /// Closes the socket and clears the session's own timers. Other
    /// components are untouched.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.connected_tx.send_replace(false);
    }

    /// Whether the session task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

async fn run_session(
    stream: WsStream,
    config: &GatewayConfig,
    event_tx: &broadcast::Sender<GatewayEvent>,
    pending_depth: &AtomicU64,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let (mut write, mut read) = stream.split();

    let register = GatewayMessage::Register {
        device_id: config.device_id,
        device_name: config.device_name.clone(),
        venue_id: config.venue_id.clone(),
    };
    if send_message(&mut write, &register).await.is_err() {
        return;
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; registration just went out.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = heartbeat.tick() => {
                let msg = GatewayMessage::Heartbeat {
                    device_id: config.device_id,
                    pending_commands: pending_depth.load(Ordering::Relaxed),
                };
                if send_message(&mut write, &msg).await.is_err() {
                    return;
                }
            }
            incoming = read.next() => {
                let Some(Ok(msg)) = incoming else {
                    debug!("gateway socket closed");
                    return;
                };
                if let Message::Text(text) = msg {
                    handle_message(&text, event_tx);
                }
            }
        }
    }
}

async fn send_message(write: &mut WsSink, msg: &GatewayMessage) -> Result<(), ()> {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to encode gateway message: {e}");
            return Err(());
        }
    };
    write.send(Message::Text(json)).await.map_err(|e| {
        debug!("gateway send failed, reconnecting: {e}");
    })
}

fn handle_message(text: &str, event_tx: &broadcast::Sender<GatewayEvent>) {
    let msg: GatewayMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("unparseable gateway message: {e}");
            return;
        }
    };
    match msg {
        GatewayMessage::Registered => {
            debug!("gateway registration acknowledged");
            let _ = event_tx.send(GatewayEvent::Registered);
        }
        GatewayMessage::HeartbeatAck => {}
        GatewayMessage::CommandQueued { request_id } => {
            let _ = event_tx.send(GatewayEvent::CommandQueued(request_id));
        }
        GatewayMessage::SyncStatus {
            pending,
            synced,
            failed,
        } => {
            let _ = event_tx.send(GatewayEvent::SyncStatus {
                pending,
                synced,
                failed,
            });
        }
        GatewayMessage::Register { .. } | GatewayMessage::Heartbeat { .. } => {
            debug!("ignoring client-to-gateway message echoed back");
        }
    }
}
