//! Cross-process broadcast transport: a newline-framed JSON protocol over
//! TCP, with a relay daemon (`codehive relay`) fanning published frames out
//! to every process subscribed to a topic.
//!
//! `TcpBroker` is the client side, implementing [`RoomBroker`] so the bus can
//! swap it in for the in-process loopback via configuration. Delivery keeps
//! the bus's contract: best-effort, never blocking a publisher; a lost relay
//! connection degrades the process to local-only fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::errors::BrokerError;

use super::broker::{RoomBroker, SUBSCRIPTION_BUFFER};

/// One frame per line. `Subscribe`/`Publish` flow client → relay, `Deliver`
/// flows relay → client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RelayFrame {
    Subscribe { topic: String },
    Publish { topic: String, payload: String },
    Deliver { topic: String, payload: String },
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &RelayFrame) -> std::io::Result<()> {
    let mut line = serde_json::to_string(frame).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

// ── Client ───────────────────────────────────────────────────────────

enum Command {
    Subscribe {
        topic: String,
        tx: mpsc::Sender<String>,
    },
    Publish {
        topic: String,
        payload: String,
    },
}

/// Broker backed by a relay daemon. One TCP connection per process; an I/O
/// task multiplexes subscriptions over it and dispatches delivered frames to
/// the matching subscription queues.
pub struct TcpBroker {
    commands: mpsc::Sender<Command>,
}

impl TcpBroker {
    /// Connect to a relay at `tcp://host:port` (or bare `host:port`).
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let addr = url.strip_prefix("tcp://").unwrap_or(url);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BrokerError::Connection(format!("{}: {}", addr, e)))?;
        let (reader, writer) = stream.into_split();
        let (commands, command_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(io_task(reader, writer, command_rx));
        info!(relay = addr, "connected to broadcast relay");
        Ok(Self { commands })
    }
}

#[async_trait]
impl RoomBroker for TcpBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        self.commands
            .send(Command::Publish {
                topic: topic.to_string(),
                payload,
            })
            .await
            .map_err(|_| BrokerError::Publish("relay connection closed".to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, BrokerError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.commands
            .send(Command::Subscribe {
                topic: topic.to_string(),
                tx,
            })
            .await
            .map_err(|_| BrokerError::Subscribe("relay connection closed".to_string()))?;
        Ok(rx)
    }
}

async fn io_task(
    reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut lines = BufReader::new(reader).lines();
    let mut subscriptions: HashMap<String, Vec<mpsc::Sender<String>>> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Subscribe { topic, tx }) => {
                        let first = !subscriptions.contains_key(&topic);
                        subscriptions.entry(topic.clone()).or_default().push(tx);
                        if first
                            && write_frame(&mut writer, &RelayFrame::Subscribe { topic })
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Some(Command::Publish { topic, payload }) => {
                        if write_frame(&mut writer, &RelayFrame::Publish { topic, payload })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    // All broker handles dropped.
                    None => break,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => dispatch_line(&mut subscriptions, &line),
                    Ok(None) | Err(_) => {
                        warn!("broadcast relay connection closed; cross-process fan-out disabled");
                        break;
                    }
                }
            }
        }
    }
}

fn dispatch_line(subscriptions: &mut HashMap<String, Vec<mpsc::Sender<String>>>, line: &str) {
    match serde_json::from_str::<RelayFrame>(line) {
        Ok(RelayFrame::Deliver { topic, payload }) => {
            if let Some(subs) = subscriptions.get_mut(&topic) {
                subs.retain(|tx| match tx.try_send(payload.clone()) {
                    Ok(()) => true,
                    // Lagging subscriber misses this frame but stays.
                    Err(TrySendError::Full(_)) => true,
                    Err(TrySendError::Closed(_)) => false,
                });
                if subs.is_empty() {
                    subscriptions.remove(&topic);
                }
            }
        }
        Ok(_) => debug!("ignoring unexpected frame from relay"),
        Err(err) => debug!(error = %err, "ignoring malformed frame from relay"),
    }
}

// ── Relay daemon ─────────────────────────────────────────────────────

#[derive(Default)]
struct RelayRegistry {
    topics: HashMap<String, HashMap<u64, mpsc::Sender<String>>>,
}

/// Accept relay clients forever, fanning every published frame out to the
/// topic's subscribers. Slow or dead clients are dropped, never waited on.
pub async fn run_relay(listener: TcpListener) -> anyhow::Result<()> {
    let registry = Arc::new(Mutex::new(RelayRegistry::default()));
    let mut next_client_id: u64 = 0;
    loop {
        let (stream, peer) = listener.accept().await?;
        next_client_id += 1;
        let client_id = next_client_id;
        debug!(%peer, client = client_id, "relay client connected");
        tokio::spawn(handle_relay_client(
            client_id,
            stream,
            Arc::clone(&registry),
        ));
    }
}

async fn handle_relay_client(client_id: u64, stream: TcpStream, registry: Arc<Mutex<RelayRegistry>>) {
    let (reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(SUBSCRIPTION_BUFFER);

    let writer_task = tokio::spawn(async move {
        while let Some(mut line) = out_rx.recv().await {
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    let mut subscribed: HashSet<String> = HashSet::new();

    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<RelayFrame>(&line) {
            Ok(RelayFrame::Subscribe { topic }) => {
                subscribed.insert(topic.clone());
                if let Ok(mut registry) = registry.lock() {
                    registry
                        .topics
                        .entry(topic)
                        .or_default()
                        .insert(client_id, out_tx.clone());
                }
            }
            Ok(RelayFrame::Publish { topic, payload }) => {
                let Ok(frame) = serde_json::to_string(&RelayFrame::Deliver {
                    topic: topic.clone(),
                    payload,
                }) else {
                    continue;
                };
                if let Ok(mut registry) = registry.lock()
                    && let Some(subs) = registry.topics.get_mut(&topic)
                {
                    subs.retain(|_, tx| match tx.try_send(frame.clone()) {
                        Ok(()) => true,
                        Err(TrySendError::Full(_)) => true,
                        Err(TrySendError::Closed(_)) => false,
                    });
                }
            }
            Ok(RelayFrame::Deliver { .. }) => {
                debug!(client = client_id, "client sent a deliver frame; ignoring");
            }
            Err(err) => {
                debug!(client = client_id, error = %err, "ignoring malformed relay frame");
            }
        }
    }

    if let Ok(mut registry) = registry.lock() {
        for topic in &subscribed {
            if let Some(subs) = registry.topics.get_mut(topic) {
                subs.remove(&client_id);
                if subs.is_empty() {
                    registry.topics.remove(topic);
                }
            }
        }
    }
    writer_task.abort();
    debug!(client = client_id, "relay client disconnected");
}
