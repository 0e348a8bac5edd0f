//! Channel abstraction.
//!
//! A channel is one joined pub/sub topic on the game server. The client core
//! only needs a few things from it: open the connection, join,
//! fire-and-forget push, receive the next inbound event, and leave.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// A topic event, inbound or outbound.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub event: String,
    pub payload: Value,
}

impl ChannelMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Bidirectional message exchange on one topic.
#[async_trait]
pub trait Channel: Send {
    /// Opens the underlying connection. Already-open transports keep the
    /// default.
    async fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Joins `topic` and returns the server's reply response.
    async fn join(&mut self, topic: &str, params: Value) -> anyhow::Result<Value>;

    /// Queues an outbound event. Never waits for an acknowledgment.
    fn push(&mut self, event: &str, payload: Value) -> anyhow::Result<()>;

    /// Next inbound event on the joined topic, or `None` once closed.
    async fn next_event(&mut self) -> Option<ChannelMessage>;

    /// Leaves the topic. Calling it again is a no-op.
    async fn leave(&mut self) -> anyhow::Result<()>;
}

/// In-process channel for tests and headless tools.
///
/// Records every push and lets the paired [`MemoryHandle`] inject inbound
/// events.
pub struct MemoryChannel {
    open_error: Option<String>,
    join_reply: Result<Value, String>,
    topic: Option<String>,
    inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    pushed: Arc<Mutex<Vec<ChannelMessage>>>,
    left: Arc<Mutex<bool>>,
}

/// Test-side end of a [`MemoryChannel`].
#[derive(Clone)]
pub struct MemoryHandle {
    inbound: mpsc::UnboundedSender<ChannelMessage>,
    pushed: Arc<Mutex<Vec<ChannelMessage>>>,
    left: Arc<Mutex<bool>>,
}

impl MemoryChannel {
    /// A channel whose join succeeds with `response`.
    pub fn new(response: Value) -> (Self, MemoryHandle) {
        Self::build(Ok(response))
    }

    /// A channel whose join is rejected with `reason`.
    pub fn rejecting(reason: impl Into<String>) -> (Self, MemoryHandle) {
        Self::build(Err(reason.into()))
    }

    /// A channel whose connection can never be opened.
    pub fn unreachable(reason: impl Into<String>) -> (Self, MemoryHandle) {
        let (mut chan, handle) = Self::build(Ok(Value::Null));
        chan.open_error = Some(reason.into());
        (chan, handle)
    }

    fn build(join_reply: Result<Value, String>) -> (Self, MemoryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pushed = Arc::new(Mutex::new(Vec::new()));
        let left = Arc::new(Mutex::new(false));
        (
            Self {
                open_error: None,
                join_reply,
                topic: None,
                inbound: rx,
                pushed: pushed.clone(),
                left: left.clone(),
            },
            MemoryHandle {
                inbound: tx,
                pushed,
                left,
            },
        )
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    fn is_left(&self) -> bool {
        self.left.lock().map(|l| *l).unwrap_or(true)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn open(&mut self) -> anyhow::Result<()> {
        match &self.open_error {
            Some(reason) => anyhow::bail!("open failed: {reason}"),
            None => Ok(()),
        }
    }

    async fn join(&mut self, topic: &str, _params: Value) -> anyhow::Result<Value> {
        match &self.join_reply {
            Ok(response) => {
                self.topic = Some(topic.to_string());
                Ok(response.clone())
            }
            Err(reason) => anyhow::bail!("join {topic} rejected: {reason}"),
        }
    }

    fn push(&mut self, event: &str, payload: Value) -> anyhow::Result<()> {
        let mut pushed = self
            .pushed
            .lock()
            .map_err(|_| anyhow::anyhow!("push log poisoned"))?;
        pushed.push(ChannelMessage::new(event, payload));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelMessage> {
        if self.is_left() {
            return None;
        }
        self.inbound.recv().await
    }

    async fn leave(&mut self) -> anyhow::Result<()> {
        if let Ok(mut left) = self.left.lock() {
            *left = true;
        }
        self.inbound.close();
        Ok(())
    }
}

impl MemoryHandle {
    /// Delivers an inbound event to the channel.
    pub fn deliver(&self, event: &str, payload: Value) {
        let _ = self.inbound.send(ChannelMessage::new(event, payload));
    }

    /// Everything pushed so far.
    pub fn pushed(&self) -> Vec<ChannelMessage> {
        self.pushed.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Pushes with the given event name.
    pub fn pushed_events(&self, event: &str) -> Vec<ChannelMessage> {
        self.pushed()
            .into_iter()
            .filter(|m| m.event == event)
            .collect()
    }

    pub fn clear_pushed(&self) {
        if let Ok(mut p) = self.pushed.lock() {
            p.clear();
        }
    }

    pub fn has_left(&self) -> bool {
        self.left.lock().map(|l| *l).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_channel_records_and_delivers() {
        let (mut chan, handle) = MemoryChannel::new(json!({"player": 1}));
        let reply = chan.join("world:lobby", json!({})).await.unwrap();
        assert_eq!(reply, json!({"player": 1}));
        assert_eq!(chan.topic(), Some("world:lobby"));

        chan.push("kick", json!({"player": 1})).unwrap();
        assert_eq!(handle.pushed_events("kick").len(), 1);

        handle.deliver("game_changed", json!({}));
        let msg = chan.next_event().await.unwrap();
        assert_eq!(msg.event, "game_changed");
    }

    #[tokio::test]
    async fn memory_channel_rejected_join() {
        let (mut chan, _handle) = MemoryChannel::rejecting("full");
        assert!(chan.join("world:lobby", json!({})).await.is_err());
        assert_eq!(chan.topic(), None);
    }

    #[tokio::test]
    async fn leave_is_idempotent_and_closes() {
        let (mut chan, handle) = MemoryChannel::new(json!({"player": 1}));
        chan.join("world:lobby", json!({})).await.unwrap();
        chan.leave().await.unwrap();
        chan.leave().await.unwrap();
        assert!(handle.has_left());
        handle.deliver("game_changed", json!({}));
        assert!(chan.next_event().await.is_none());
    }
}
