//! Client implementation.
//!
//! The client owns, on a single task:
//! - The joined channel (outbound intents, inbound snapshots)
//! - The input sampler fed by key events
//! - The snapshot interpolator
//! - The frame loop driving sampling, interpolation and drawing
//!
//! Input is only sampled and the scene only drawn while `Joined`.

use std::time::Duration;

use anyhow::Context;
use furbox_shared::{
    config::ClientConfig,
    net::{decode_game_changed, event, player_id_from_join, EntityId},
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, ChannelMessage},
    frame::FrameLoop,
    input::{InputSampler, KeyEvent},
    interp::{RemoteStateInterpolator, TrackedEntity},
    scene::{NullScene, SceneSink},
    socket::PhoenixSocket,
};

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No joined channel.
    Disconnected,
    /// Join sent, waiting for the reply.
    Connecting,
    /// Joined; input is sampled and the scene drawn.
    Joined,
}

/// Local input delivered to a running client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInput {
    Key(KeyEvent),
    Status,
    Leave,
}

/// High-level game client.
pub struct GameClient<C: Channel> {
    pub state: ConnectionState,
    player: Option<EntityId>,
    cfg: ClientConfig,

    channel: C,
    sampler: InputSampler,
    interp: RemoteStateInterpolator,
    scene: Box<dyn SceneSink>,

    frames: Option<FrameLoop>,
    inputs: Option<mpsc::Receiver<ClientInput>>,

    frame_count: u64,
    snapshots: u64,
    rejected: u64,
}

impl GameClient<PhoenixSocket> {
    /// Opens the websocket and joins the configured topic.
    pub async fn connect(cfg: &ClientConfig) -> anyhow::Result<Self> {
        let mut client = Self::new(PhoenixSocket::new(cfg), cfg.clone());
        client.join().await?;
        Ok(client)
    }
}

impl<C: Channel> GameClient<C> {
    pub fn new(channel: C, cfg: ClientConfig) -> Self {
        let interp = RemoteStateInterpolator::from_config(&cfg);
        Self {
            state: ConnectionState::Disconnected,
            player: None,
            cfg,
            channel,
            sampler: InputSampler::new(),
            interp,
            scene: Box::new(NullScene),
            frames: None,
            inputs: None,
            frame_count: 0,
            snapshots: 0,
            rejected: 0,
        }
    }

    pub fn with_scene(mut self, scene: Box<dyn SceneSink>) -> Self {
        self.scene = scene;
        self
    }

    /// Opens the channel connection, joins the configured topic and captures
    /// the local player id.
    ///
    /// On failure the client is left `Disconnected`; there is no retry.
    pub async fn join(&mut self) -> anyhow::Result<EntityId> {
        if self.state != ConnectionState::Disconnected {
            anyhow::bail!("join while {:?}", self.state);
        }

        self.state = ConnectionState::Connecting;
        if let Err(e) = self.channel.open().await {
            self.state = ConnectionState::Disconnected;
            return Err(e).context("open channel connection");
        }
        info!(topic = %self.cfg.topic, "Joining channel");

        let response = match self.channel.join(&self.cfg.topic, json!({})).await {
            Ok(response) => response,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e).context("join channel");
            }
        };

        let player = match player_id_from_join(&response) {
            Ok(player) => player,
            Err(e) => {
                warn!(response = %response, "Join reply without player id");
                let _ = self.channel.leave().await;
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        self.player = Some(player.clone());
        self.frames = Some(FrameLoop::new(self.cfg.frame_interval()));
        self.state = ConnectionState::Joined;
        info!(player = %player, topic = %self.cfg.topic, "Joined channel");
        Ok(player)
    }

    /// Attaches the local input source.
    pub fn attach_input(&mut self, rx: mpsc::Receiver<ClientInput>) {
        self.inputs = Some(rx);
    }

    pub fn player(&self) -> Option<&EntityId> {
        self.player.as_ref()
    }

    pub fn interpolator(&self) -> &RemoteStateInterpolator {
        &self.interp
    }

    pub fn sampler(&self) -> &InputSampler {
        &self.sampler
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Gives the channel back, e.g. to close the socket after leaving.
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Entities to render, or `None` before the channel is joined.
    pub fn visible_entities(&self) -> Option<impl Iterator<Item = &TrackedEntity>> {
        (self.state == ConnectionState::Joined).then(|| self.interp.entities())
    }

    pub fn on_key(&mut self, ev: KeyEvent) {
        if self.state != ConnectionState::Joined {
            debug!(?ev, "Ignoring key while not joined");
            return;
        }
        self.sampler.apply(ev);
    }

    /// One frame: sample input, advance interpolation, draw.
    pub fn on_frame(&mut self, dt: Duration) {
        if self.state != ConnectionState::Joined {
            return;
        }

        if let Some(player) = &self.player {
            if let Err(e) = self.sampler.sample(player, &mut self.channel) {
                warn!(error = %e, "Failed to send intent");
            }
        }

        self.interp.advance(dt);

        self.scene.begin_frame();
        for entity in self.interp.entities() {
            self.scene.draw_entity(entity);
        }
        self.scene.end_frame();
        self.frame_count += 1;
    }

    /// Handles one inbound channel event.
    pub fn handle_inbound(&mut self, msg: ChannelMessage) {
        match msg.event.as_str() {
            event::GAME_CHANGED => self.apply_game_changed(&msg.payload),
            event::CLOSE | event::ERROR => {
                warn!(event = %msg.event, payload = %msg.payload, "Channel closed by server");
                self.teardown();
            }
            other => debug!(event = %other, "Unhandled channel event"),
        }
    }

    fn apply_game_changed(&mut self, payload: &Value) {
        if self.state != ConnectionState::Joined {
            debug!("Ignoring snapshot while not joined");
            return;
        }

        let decoded = match decode_game_changed(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Dropping malformed snapshot");
                self.rejected += 1;
                return;
            }
        };
        for reject in &decoded.rejected {
            warn!(entity = %reject, "Skipping malformed snapshot entity");
        }
        self.rejected += decoded.rejected.len() as u64;

        let report = self.interp.apply_decoded(&decoded);
        self.snapshots += 1;

        for key in &report.spawned {
            if let Some(entity) = self.interp.get(key) {
                debug!(entity = %key, "Entity spawned");
                self.scene.entity_spawned(entity);
            }
        }
        for key in &report.removed {
            debug!(entity = %key, "Entity removed");
            self.scene.entity_removed(key);
        }
    }

    /// Leaves the channel and stops all per-frame work. Idempotent.
    pub async fn leave(&mut self) -> anyhow::Result<()> {
        if self.state == ConnectionState::Joined {
            let res = self.channel.leave().await;
            self.teardown();
            res.context("leave channel")?;
            info!("Left game");
        } else {
            self.teardown();
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(frames) = self.frames.as_mut() {
            frames.cancel();
        }
        self.frames = None;
        self.inputs = None;
        self.sampler.clear();
        self.state = ConnectionState::Disconnected;
    }

    /// Drives frames, inbound events and local input until the client is no
    /// longer joined.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        while self.state == ConnectionState::Joined {
            tokio::select! {
                dt = next_frame(&mut self.frames) => match dt {
                    Some(dt) => self.on_frame(dt),
                    None => break,
                },
                msg = self.channel.next_event() => match msg {
                    Some(msg) => self.handle_inbound(msg),
                    None => {
                        warn!("Channel closed");
                        self.teardown();
                    }
                },
                input = next_input(&mut self.inputs) => match input {
                    Some(ClientInput::Key(ev)) => self.on_key(ev),
                    Some(ClientInput::Status) => {
                        for line in self.status_lines() {
                            info!("{line}");
                        }
                    }
                    Some(ClientInput::Leave) => self.leave().await?,
                    None => {
                        debug!("Input source closed");
                        self.inputs = None;
                    }
                },
            }
        }
        Ok(())
    }

    /// Human-readable client status.
    pub fn status_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.push(format!("State: {:?}", self.state));
        if let Some(player) = &self.player {
            out.push(format!("Player: {player}"));
        }
        out.push(format!("Topic: {}", self.cfg.topic));
        out.push(format!("Frames: {}", self.frame_count));
        out.push(format!("Snapshots applied: {}", self.snapshots));
        out.push(format!("Entities rejected: {}", self.rejected));
        out.push(format!("Entities tracked: {}", self.interp.len()));
        out.push(format!("Held: {:?}", self.sampler.actions()));
        out
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots
    }
}

async fn next_frame(frames: &mut Option<FrameLoop>) -> Option<Duration> {
    match frames {
        Some(frames) => frames.next_frame().await,
        None => None,
    }
}

async fn next_input(inputs: &mut Option<mpsc::Receiver<ClientInput>>) -> Option<ClientInput> {
    match inputs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, MemoryHandle};
    use crate::input::Key;
    use crate::interp::EntityKey;
    use furbox_shared::math::Vec2;

    const FRAME: Duration = Duration::from_micros(16_667);

    fn client() -> (GameClient<MemoryChannel>, MemoryHandle) {
        let (chan, handle) = MemoryChannel::new(json!({"player": 1}));
        (GameClient::new(chan, ClientConfig::default()), handle)
    }

    fn snapshot(x: f32) -> Value {
        json!({
            "players": [{"id": 1, "position": [x, 0.0]}],
            "ball": {"position": [0.0, 0.0], "scale": 0.5}
        })
    }

    #[tokio::test]
    async fn join_captures_player_id() {
        let (mut client, _handle) = client();
        assert_eq!(client.state, ConnectionState::Disconnected);
        let player = client.join().await.unwrap();
        assert_eq!(player, EntityId::Number(1));
        assert_eq!(client.state, ConnectionState::Joined);
        assert_eq!(client.channel().topic(), Some("world:lobby"));
    }

    #[tokio::test]
    async fn rejected_join_stays_disconnected() {
        let (chan, _handle) = MemoryChannel::rejecting("unauthorized");
        let mut client = GameClient::new(chan, ClientConfig::default());
        assert!(client.join().await.is_err());
        assert_eq!(client.state, ConnectionState::Disconnected);
        assert!(client.visible_entities().is_none());
    }

    #[tokio::test]
    async fn unreachable_server_stays_disconnected() {
        let (chan, handle) = MemoryChannel::unreachable("connection refused");
        let mut client = GameClient::new(chan, ClientConfig::default());
        let err = client.join().await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
        assert_eq!(client.state, ConnectionState::Disconnected);
        assert_eq!(client.channel().topic(), None);
        assert!(client.player().is_none());

        client.on_key(KeyEvent::Down(Key::ArrowUp));
        client.on_frame(FRAME);
        assert!(handle.pushed().is_empty());
    }

    #[tokio::test]
    async fn join_without_player_id_fails() {
        let (chan, handle) = MemoryChannel::new(json!({}));
        let mut client = GameClient::new(chan, ClientConfig::default());
        assert!(client.join().await.is_err());
        assert_eq!(client.state, ConnectionState::Disconnected);
        assert!(handle.has_left());
    }

    #[tokio::test]
    async fn nothing_is_sent_before_join() {
        let (mut client, handle) = client();
        client.on_key(KeyEvent::Down(Key::ArrowUp));
        client.on_key(KeyEvent::Down(Key::Space));
        client.on_frame(FRAME);
        assert!(handle.pushed().is_empty());
        assert!(client.sampler().actions().is_empty());
    }

    #[tokio::test]
    async fn frame_sends_intent_once_joined() {
        let (mut client, handle) = client();
        client.join().await.unwrap();
        client.on_key(KeyEvent::Down(Key::W));
        client.on_key(KeyEvent::Down(Key::D));
        client.on_frame(FRAME);

        let moves = handle.pushed_events(event::MOVE_PLAYER);
        assert_eq!(moves.len(), 1);
        let offset: Vec2 = serde_json::from_value(moves[0].payload["offset"].clone()).unwrap();
        assert!((offset.len() - 1.0).abs() < 1e-6);
        assert_eq!(moves[0].payload["player"], json!(1));

        client.on_key(KeyEvent::Up(Key::W));
        client.on_key(KeyEvent::Up(Key::D));
        handle.clear_pushed();
        client.on_frame(FRAME);
        assert!(handle.pushed().is_empty());
    }

    #[tokio::test]
    async fn snapshots_seed_then_smooth() {
        let (mut client, _handle) = client();
        client.join().await.unwrap();

        client.handle_inbound(ChannelMessage::new(event::GAME_CHANGED, snapshot(0.0)));
        client.handle_inbound(ChannelMessage::new(event::GAME_CHANGED, snapshot(10.0)));
        let key = EntityKey::Player(EntityId::Number(1));
        assert_eq!(client.interpolator().position(&key), Some(Vec2::ZERO));

        client.on_frame(FRAME);
        let x = client.interpolator().position(&key).unwrap().x;
        assert!((x - 2.0).abs() < 1e-5);
        assert_eq!(client.visible_entities().unwrap().count(), 2);
        assert_eq!(client.snapshots_applied(), 2);
    }

    #[tokio::test]
    async fn malformed_entities_are_skipped() {
        let (mut client, _handle) = client();
        client.join().await.unwrap();
        client.handle_inbound(ChannelMessage::new(
            event::GAME_CHANGED,
            json!({"players": [{"id": 1}, {"id": 2, "position": [1, 1]}]}),
        ));
        client.handle_inbound(ChannelMessage::new(event::GAME_CHANGED, json!("garbage")));
        assert_eq!(client.interpolator().len(), 1);
        assert_eq!(client.state, ConnectionState::Joined);
    }

    #[tokio::test]
    async fn out_of_range_snapshot_is_rejected_and_later_ones_smooth() {
        let (mut client, _handle) = client();
        client.join().await.unwrap();
        let key = EntityKey::Player(EntityId::Number(1));

        client.handle_inbound(ChannelMessage::new(
            event::GAME_CHANGED,
            json!({"players": [{"id": 1, "position": [1e39, 0]}]}),
        ));
        assert!(client.interpolator().get(&key).is_none());
        client.on_frame(FRAME);

        client.handle_inbound(ChannelMessage::new(event::GAME_CHANGED, snapshot(5.0)));
        for _ in 0..100 {
            client.on_frame(FRAME);
        }
        let pos = client.interpolator().position(&key).unwrap();
        assert!((pos.x - 5.0).abs() < 1e-5 && pos.y == 0.0);
        assert!(client
            .status_lines()
            .contains(&"Entities rejected: 1".to_string()));
    }

    #[tokio::test]
    async fn leave_detaches_everything_and_is_idempotent() {
        let (mut client, handle) = client();
        client.join().await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        client.attach_input(rx);
        client.on_key(KeyEvent::Down(Key::ArrowLeft));

        client.leave().await.unwrap();
        client.leave().await.unwrap();
        assert_eq!(client.state, ConnectionState::Disconnected);
        assert!(handle.has_left());
        assert!(tx.send(ClientInput::Key(KeyEvent::Down(Key::W))).await.is_err());

        handle.clear_pushed();
        client.on_key(KeyEvent::Down(Key::ArrowUp));
        client.on_frame(FRAME);
        assert!(handle.pushed().is_empty());
        assert_eq!(client.frame_count(), 0);
        assert!(client.visible_entities().is_none());
    }

    #[tokio::test]
    async fn server_close_tears_down() {
        let (mut client, _handle) = client();
        client.join().await.unwrap();
        client.handle_inbound(ChannelMessage::new(event::CLOSE, json!({})));
        assert_eq!(client.state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_samples_until_leave() {
        let (mut client, handle) = client();
        client.join().await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        client.attach_input(rx);

        tx.send(ClientInput::Key(KeyEvent::Down(Key::ArrowRight))).await.unwrap();
        handle.deliver(event::GAME_CHANGED, snapshot(5.0));

        let driver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(ClientInput::Leave).await.unwrap();
        });

        client.run().await.unwrap();
        driver.await.unwrap();

        assert_eq!(client.state, ConnectionState::Disconnected);
        assert!(client.frame_count() >= 3);
        assert!(!handle.pushed_events(event::MOVE_PLAYER).is_empty());
        assert_eq!(client.snapshots_applied(), 1);

        // Nothing more runs after the loop has stopped.
        let frames = client.frame_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.frame_count(), frames);
    }
}
