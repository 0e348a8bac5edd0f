//! Websocket transport for [`Channel`].
//!
//! One websocket carries every topic. The socket is split into:
//! - a writer task draining an unbounded queue of outbound frames
//! - a reader task decoding inbound text frames
//! - a heartbeat task keeping the server-side socket alive
//!
//! The client joins a single topic per socket.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use furbox_shared::{
    config::ClientConfig,
    net::{event, Frame, ReplyStatus, PROTOCOL_VSN},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelMessage};

/// Appends the serializer version to a socket URL unless already present.
pub fn socket_url(base: &str) -> String {
    if base.contains("vsn=") {
        return base.to_string();
    }
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}vsn={PROTOCOL_VSN}")
}

/// Live websocket I/O tasks.
struct Link {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
}

impl Link {
    async fn connect(url: &str, heartbeat_period: Duration) -> anyhow::Result<Self> {
        info!(url = %url, "Connecting to server");

        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("websocket connect {url}"))?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, event = %frame.event, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!(error = %e, "Websocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Websocket writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring undecodable frame"),
                    },
                    Ok(Message::Close(reason)) => {
                        info!(?reason, "Server closed websocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Websocket read failed");
                        break;
                    }
                }
            }
            debug!("Websocket reader finished");
        });

        let hb_tx = out_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval =
                time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
            let mut n: u64 = 0;
            loop {
                interval.tick().await;
                n += 1;
                if hb_tx.send(Frame::heartbeat(format!("hb-{n}"))).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            outbound: Some(out_tx),
            inbound: in_rx,
            reader,
            writer: Some(writer),
            heartbeat,
        })
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // The writer exits on its own once every sender is gone.
        self.heartbeat.abort();
        self.reader.abort();
    }
}

/// Channel over a Phoenix-style websocket.
///
/// Created closed; [`Channel::open`] dials the server.
pub struct PhoenixSocket {
    url: String,
    heartbeat_period: Duration,
    join_timeout: Duration,
    link: Option<Link>,
    /// Frames that arrived while waiting for a join reply.
    pending: VecDeque<Frame>,
    topic: Option<String>,
    join_ref: Option<String>,
    next_ref: u64,
}

impl PhoenixSocket {
    /// A closed socket for `cfg.socket_url`. No I/O happens until `open`.
    pub fn new(cfg: &ClientConfig) -> Self {
        Self {
            url: socket_url(&cfg.socket_url),
            heartbeat_period: cfg.heartbeat_interval(),
            join_timeout: cfg.join_timeout(),
            link: None,
            pending: VecDeque::new(),
            topic: None,
            join_ref: None,
            next_ref: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn send(&self, frame: Frame) -> anyhow::Result<()> {
        self.link
            .as_ref()
            .and_then(|link| link.outbound.as_ref())
            .context("socket not open")?
            .send(frame)
            .map_err(|_| anyhow::anyhow!("websocket writer closed"))
    }

    /// Leaves the topic, flushes queued frames and closes the websocket.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.leave().await?;
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        link.heartbeat.abort();
        link.reader.abort();
        link.outbound = None;
        if let Some(writer) = link.writer.take() {
            if time::timeout(Duration::from_secs(1), writer).await.is_err() {
                debug!("Websocket writer did not finish in time");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for PhoenixSocket {
    async fn open(&mut self) -> anyhow::Result<()> {
        if self.link.is_none() {
            self.link = Some(Link::connect(&self.url, self.heartbeat_period).await?);
        }
        Ok(())
    }

    async fn join(&mut self, topic: &str, params: Value) -> anyhow::Result<Value> {
        if let Some(current) = &self.topic {
            anyhow::bail!("already joined {current}");
        }

        let join_ref = self.make_ref();
        self.send(
            Frame::new(topic, event::JOIN, params)
                .with_refs(Some(join_ref.clone()), Some(join_ref.clone())),
        )?;
        debug!(topic = %topic, join_ref = %join_ref, "Join sent");

        let deadline = Instant::now() + self.join_timeout;
        let link = self.link.as_mut().context("socket not open")?;
        loop {
            let frame = match time::timeout_at(deadline, link.inbound.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => anyhow::bail!("socket closed while joining {topic}"),
                Err(_) => anyhow::bail!("join {topic} timed out"),
            };

            if frame.topic == topic && frame.msg_ref.as_deref() == Some(join_ref.as_str()) {
                let reply = frame.reply().context("malformed join reply")?;
                if reply.status != ReplyStatus::Ok {
                    anyhow::bail!("join {topic} rejected: {}", reply.response);
                }
                self.topic = Some(topic.to_string());
                self.join_ref = Some(join_ref);
                return Ok(reply.response);
            }

            self.pending.push_back(frame);
        }
    }

    fn push(&mut self, event: &str, payload: Value) -> anyhow::Result<()> {
        let topic = self.topic.clone().context("push before join")?;
        let msg_ref = self.make_ref();
        self.send(Frame::new(topic, event, payload).with_refs(self.join_ref.clone(), Some(msg_ref)))
    }

    async fn next_event(&mut self) -> Option<ChannelMessage> {
        let topic = self.topic.clone()?;
        loop {
            let frame = match self.pending.pop_front() {
                Some(frame) => frame,
                None => self.link.as_mut()?.inbound.recv().await?,
            };

            if frame.topic != topic {
                continue;
            }
            if frame.join_ref.is_some() && frame.join_ref != self.join_ref {
                debug!(event = %frame.event, "Ignoring frame from a previous join");
                continue;
            }
            if let Some(reply) = frame.reply() {
                if reply.status != ReplyStatus::Ok {
                    warn!(msg_ref = ?frame.msg_ref, response = %reply.response, "Push rejected");
                }
                continue;
            }

            return Some(ChannelMessage::new(frame.event, frame.payload));
        }
    }

    async fn leave(&mut self) -> anyhow::Result<()> {
        let Some(topic) = self.topic.take() else {
            return Ok(());
        };
        let msg_ref = self.make_ref();
        let frame = Frame::new(topic.as_str(), event::LEAVE, json!({}))
            .with_refs(self.join_ref.take(), Some(msg_ref));
        if self.send(frame).is_err() {
            debug!(topic = %topic, "Socket already closed, leave not sent");
        }
        info!(topic = %topic, "Left channel");
        Ok(())
    }
}
