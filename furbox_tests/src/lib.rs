//! `furbox_tests`
//!
//! A mock game server speaking the channel protocol over a real websocket,
//! for driving `furbox_client` end to end.
//!
//! The mock accepts any number of sockets. Each socket may join the
//! configured topic; after that it receives whatever the test pushes.
//! Every client frame is recorded for assertions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use furbox_shared::{
    config::ClientConfig,
    net::{event, Frame, PHOENIX_TOPIC},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Topic the mock serves.
pub const TOPIC: &str = "world:lobby";

/// How the mock answers `phx_join`.
#[derive(Debug, Clone)]
pub enum JoinPolicy {
    /// Reply ok with `{"player": player}`. `early` is pushed as a
    /// `game_changed` right before the reply.
    Accept { player: Value, early: Option<Value> },
    /// Reply error with `{"reason": reason}`.
    Reject { reason: String },
    /// Never reply.
    Ignore,
}

impl JoinPolicy {
    pub fn accept(player: Value) -> Self {
        JoinPolicy::Accept {
            player,
            early: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ServerPush {
    event: String,
    payload: Value,
}

/// In-process mock server.
pub struct MockServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Frame>>>,
    pushes: broadcast::Sender<ServerPush>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    /// Binds an ephemeral port and starts accepting sockets.
    pub async fn start(policy: JoinPolicy) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock server")?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let (pushes, _) = broadcast::channel(256);

        let accept_received = received.clone();
        let accept_pushes = pushes.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(error = %e, "Mock accept failed");
                        break;
                    }
                };
                info!(%peer, "Mock server accepted socket");
                let conn = Connection {
                    policy: policy.clone(),
                    received: accept_received.clone(),
                    pushes: accept_pushes.subscribe(),
                };
                tokio::spawn(async move {
                    if let Err(e) = conn.serve(stream).await {
                        debug!(error = %e, "Mock connection ended");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            received,
            pushes,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/socket/websocket", self.addr)
    }

    /// Client config pointing at this server with test-friendly timeouts.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            socket_url: self.url(),
            topic: TOPIC.to_string(),
            join_timeout_ms: 500,
            ..ClientConfig::default()
        }
    }

    /// Pushes a `game_changed` snapshot to every joined socket.
    pub fn push_snapshot(&self, payload: Value) {
        self.push(event::GAME_CHANGED, payload);
    }

    /// Terminates the channel on every joined socket.
    pub fn close_channel(&self) {
        self.push(event::CLOSE, json!({}));
    }

    fn push(&self, event: &str, payload: Value) {
        let _ = self.pushes.send(ServerPush {
            event: event.to_string(),
            payload,
        });
    }

    /// Every frame received from clients so far.
    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn received_events(&self, event: &str) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|f| f.event == event)
            .collect()
    }

    /// Waits until at least `count` frames with `event` have arrived.
    pub async fn wait_for(
        &self,
        event: &str,
        count: usize,
        timeout: Duration,
    ) -> anyhow::Result<Vec<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            let frames = self.received_events(event);
            if frames.len() >= count {
                return Ok(frames);
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "timed out waiting for {count} '{event}' frames, got {}",
                    frames.len()
                );
            }
            time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct Connection {
    policy: JoinPolicy,
    received: Arc<Mutex<Vec<Frame>>>,
    pushes: broadcast::Receiver<ServerPush>,
}

impl Connection {
    async fn serve(mut self, stream: TcpStream) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .context("websocket handshake")?;
        let (mut write, mut read) = ws.split();
        let mut joined: Option<String> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e).context("mock read"),
                    };
                    let frame = Frame::decode(text.as_str())?;
                    if let Ok(mut received) = self.received.lock() {
                        received.push(frame.clone());
                    }
                    for out in self.respond(&frame, &mut joined) {
                        write.send(Message::Text(out.encode()?.into())).await?;
                    }
                }
                push = self.pushes.recv() => {
                    let ServerPush { event, payload } = match push {
                        Ok(push) => push,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if let Some(topic) = &joined {
                        let frame = Frame::new(topic.as_str(), event, payload);
                        write.send(Message::Text(frame.encode()?.into())).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Frames to send back for one client frame.
    fn respond(&self, frame: &Frame, joined: &mut Option<String>) -> Vec<Frame> {
        let reply = |status: &str, response: Value| {
            Frame::new(
                frame.topic.as_str(),
                event::REPLY,
                json!({"status": status, "response": response}),
            )
            .with_refs(frame.join_ref.clone(), frame.msg_ref.clone())
        };

        match frame.event.as_str() {
            event::HEARTBEAT if frame.topic == PHOENIX_TOPIC => vec![reply("ok", json!({}))],
            event::JOIN if frame.topic == TOPIC => match &self.policy {
                JoinPolicy::Accept { player, early } => {
                    *joined = Some(frame.topic.clone());
                    let mut out = Vec::new();
                    if let Some(early) = early {
                        out.push(Frame::new(TOPIC, event::GAME_CHANGED, early.clone()));
                    }
                    out.push(reply("ok", json!({ "player": player })));
                    out
                }
                JoinPolicy::Reject { reason } => vec![reply("error", json!({ "reason": reason }))],
                JoinPolicy::Ignore => Vec::new(),
            },
            event::JOIN => vec![reply("error", json!({"reason": "unmatched topic"}))],
            event::LEAVE => {
                *joined = None;
                vec![reply("ok", json!({}))]
            }
            _ => vec![reply("ok", json!({}))],
        }
    }
}
