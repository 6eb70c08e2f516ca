use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::constants::KEEPALIVE_INTERVAL;
use crate::protocol::{decode_event, encode_command, ClientCommand, CommandSink, ServerEvent};

/// WebSocket link to the room server.
#[derive(Clone)]
pub struct RoomConnection {
    inner: Arc<ConnectionState>,
}

struct ConnectionState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    traffic: Mutex<Traffic>,
}

#[derive(Default)]
struct Traffic {
    counters: TrafficSnapshot,
    /// Nonce and send time of the ping awaiting its pong
    ping: Option<(u64, Instant)>,
}

/// Counters for one connection, shown by the room `status` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrafficSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub malformed_in: u64,
    pub last_rtt_ms: Option<f32>,
}

impl fmt::Display for TrafficSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sent ({} B), {} received ({} B)",
            self.messages_out, self.bytes_out, self.messages_in, self.bytes_in
        )?;
        if self.malformed_in > 0 {
            write!(f, ", {} malformed", self.malformed_in)?;
        }
        match self.last_rtt_ms {
            Some(rtt) => write!(f, ", rtt {rtt:.0} ms"),
            None => f.write_str(", rtt unknown"),
        }
    }
}

impl Default for RoomConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomConnection {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectionState {
                tx: Mutex::new(None),
                traffic: Mutex::new(Traffic::default()),
            }),
        }
    }

    /// Connect to the room server. Returns a receiver that resolves when the socket closes.
    pub async fn connect<F>(&self, server_url: &str, on_event: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .context("Failed to connect to room server")?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.inner.tx.lock() = Some(tx);

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_sender.send(msg).await.is_err() || closing {
                    break;
                }
            }
            send_inner.clear_transport();
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let handler = Arc::new(on_event);
        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        match decode_event(text.as_str()) {
                            Ok(event) => {
                                tracing::debug!("<- {}", event.kind());
                                handler(event);
                            }
                            Err(e) => {
                                recv_inner.record_malformed();
                                tracing::warn!("{}", e);
                            }
                        }
                    }
                    Ok(WsMessage::Pong(payload)) => {
                        recv_inner.handle_ws_pong(&payload);
                    }
                    Ok(WsMessage::Close(frame)) => {
                        tracing::info!("Room server closed the connection: {:?}", frame);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Room socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            recv_inner.clear_transport();
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Keep-alive pings
        let ping_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                sleep(KEEPALIVE_INTERVAL).await;
                if ping_inner.send_keepalive().is_err() {
                    break;
                }
            }
        });

        Ok(disconnect_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        self.inner.traffic.lock().counters.clone()
    }

    pub fn send(&self, command: &ClientCommand) -> Result<()> {
        let json = encode_command(command)?;
        tracing::debug!("-> {}", json);
        self.inner.record_outgoing(json.len() as u64);
        self.inner
            .enqueue_ws(WsMessage::Text(json.into()))
            .map_err(|_| anyhow::anyhow!("Not connected to the room server"))
    }

    /// Send a close frame; the socket tasks wind down after it.
    pub fn close(&self) {
        if self.inner.enqueue_ws(WsMessage::Close(None)).is_err() {
            tracing::debug!("Close requested on an idle connection");
        }
    }
}

impl CommandSink for RoomConnection {
    fn send_command(&mut self, command: ClientCommand) -> Result<()> {
        self.send(&command)
    }

    fn traffic(&self) -> Option<TrafficSnapshot> {
        Some(RoomConnection::traffic(self))
    }
}

impl ConnectionState {
    fn record_outgoing(&self, bytes: u64) {
        let mut traffic = self.traffic.lock();
        traffic.counters.bytes_out += bytes;
        traffic.counters.messages_out += 1;
    }

    fn record_incoming(&self, bytes: u64) {
        let mut traffic = self.traffic.lock();
        traffic.counters.bytes_in += bytes;
        traffic.counters.messages_in += 1;
    }

    fn record_malformed(&self) {
        self.traffic.lock().counters.malformed_in += 1;
    }

    fn handle_ws_pong(&self, payload: &[u8]) {
        self.record_incoming(payload.len() as u64);
        let Some(nonce) = payload.get(..8).and_then(|b| <[u8; 8]>::try_from(b).ok()) else {
            return;
        };
        let nonce = u64::from_le_bytes(nonce);

        let mut traffic = self.traffic.lock();
        if let Some((expected, sent)) = traffic.ping {
            if expected == nonce {
                traffic.counters.last_rtt_ms = Some(sent.elapsed().as_secs_f32() * 1000.0);
                traffic.ping = None;
            }
        }
    }

    fn ping_payload(&self) -> Vec<u8> {
        let nonce = Uuid::new_v4().as_u128() as u64;
        self.traffic.lock().ping = Some((nonce, Instant::now()));
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&nonce.to_le_bytes());
        payload.extend_from_slice(&current_unix_millis().to_le_bytes());
        payload
    }

    fn send_keepalive(&self) -> Result<(), ()> {
        let payload = self.ping_payload();
        self.record_outgoing(payload.len() as u64);
        self.enqueue_ws(WsMessage::Ping(payload.into()))
    }

    fn clear_transport(&self) {
        *self.tx.lock() = None;
        self.traffic.lock().ping = None;
    }

    fn enqueue_ws(&self, message: WsMessage) -> Result<(), ()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| ()),
            None => Err(()),
        }
    }
}

fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}
