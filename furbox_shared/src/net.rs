//! Wire protocol.
//!
//! The game server speaks the Phoenix channels protocol (serializer v2):
//! every websocket text frame is a JSON array
//! `[join_ref, ref, topic, event, payload]`.
//!
//! On top of that sit the game messages:
//! - server -> client: `game_changed` snapshots
//! - client -> server: `move_player` and `kick` intents

use std::fmt;

use anyhow::Context;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::math::Vec2;

/// Serializer version appended to the socket URL as `vsn`.
pub const PROTOCOL_VSN: &str = "2.0.0";

/// Topic used for socket-level messages such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Event names used on the wire.
pub mod event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const HEARTBEAT: &str = "heartbeat";

    pub const GAME_CHANGED: &str = "game_changed";
    pub const MOVE_PLAYER: &str = "move_player";
    pub const KICK: &str = "kick";
}

/// One channel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn with_refs(mut self, join_ref: Option<String>, msg_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self.msg_ref = msg_ref;
        self
    }

    /// Socket heartbeat frame.
    pub fn heartbeat(msg_ref: String) -> Self {
        Self::new(PHOENIX_TOPIC, event::HEARTBEAT, Value::Object(Default::default()))
            .with_refs(None, Some(msg_ref))
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("serialize frame")
    }

    pub fn decode(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("deserialize frame")
    }

    /// Parses the payload as a reply, if this is a `phx_reply` frame.
    pub fn reply(&self) -> Option<Reply> {
        if self.event != event::REPLY {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        (
            &self.join_ref,
            &self.msg_ref,
            &self.topic,
            &self.event,
            &self.payload,
        )
            .serialize(s)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let (join_ref, msg_ref, topic, event, payload) =
            <(Option<String>, Option<String>, String, String, Value)>::deserialize(d)?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Timeout,
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

/// Server-assigned entity identifier.
///
/// Kept in whichever form the server sent so it round-trips unchanged.
/// Numeric ids may be negative; an integral float such as `1.0` is read as
/// the integer it denotes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum EntityId {
    Number(u64),
    Signed(i64),
    Name(String),
}

impl EntityId {
    fn from_number(n: &serde_json::Number) -> Option<Self> {
        if let Some(u) = n.as_u64() {
            return Some(EntityId::Number(u));
        }
        if let Some(i) = n.as_i64() {
            return Some(EntityId::Signed(i));
        }
        let f = n.as_f64()?;
        if !f.is_finite() || f.fract() != 0.0 {
            return None;
        }
        if f >= 0.0 && f < u64::MAX as f64 {
            Some(EntityId::Number(f as u64))
        } else if f < 0.0 && f >= i64::MIN as f64 {
            Some(EntityId::Signed(f as i64))
        } else {
            None
        }
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match Value::deserialize(d)? {
            Value::String(s) => Ok(EntityId::Name(s)),
            Value::Number(n) => EntityId::from_number(&n)
                .ok_or_else(|| de::Error::custom(format!("entity id {n} is not an integer"))),
            other => Err(de::Error::custom(format!("invalid entity id: {other}"))),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Number(n) => write!(f, "{n}"),
            EntityId::Signed(n) => write!(f, "{n}"),
            EntityId::Name(s) => f.write_str(s),
        }
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Name(s.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        EntityId::Number(n)
    }
}

/// Extracts the local player id from a join reply's `response`.
pub fn player_id_from_join(response: &Value) -> anyhow::Result<EntityId> {
    let raw = response
        .get("player")
        .or_else(|| response.get("id"))
        .context("join reply carries no player id")?;
    serde_json::from_value(raw.clone()).context("parse player id")
}

/// Client -> server: movement intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovePlayer {
    pub player: EntityId,
    pub offset: Vec2,
}

/// Client -> server: kick action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kick {
    pub player: EntityId,
}

/// Authoritative state of one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: EntityId,
    pub position: Vec2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
}

/// Authoritative state of the ball.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallState {
    pub position: Vec2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
}

/// Server -> client: `game_changed` snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GameChanged {
    #[serde(default)]
    pub players: Vec<PlayerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ball: Option<BallState>,
}

/// A snapshot entry that failed validation and was left out.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotReject {
    /// `id` is set when the entry still carried a readable id.
    Player {
        index: usize,
        id: Option<EntityId>,
        reason: String,
    },
    Ball { reason: String },
}

impl fmt::Display for SnapshotReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotReject::Player {
                index,
                id: Some(id),
                reason,
            } => write!(f, "players[{index}] ({id}): {reason}"),
            SnapshotReject::Player { index, reason, .. } => {
                write!(f, "players[{index}]: {reason}")
            }
            SnapshotReject::Ball { reason } => write!(f, "ball: {reason}"),
        }
    }
}

/// Result of decoding a `game_changed` payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedSnapshot {
    pub snapshot: GameChanged,
    pub rejected: Vec<SnapshotReject>,
}

/// Decodes a `game_changed` payload entity by entity.
///
/// Malformed entities are skipped and listed in `rejected`. Only a payload
/// that is not an object, or whose `players` is not a list, fails outright.
pub fn decode_game_changed(payload: &Value) -> anyhow::Result<DecodedSnapshot> {
    let obj = payload
        .as_object()
        .context("game_changed payload is not an object")?;

    let mut out = DecodedSnapshot::default();

    match obj.get("players") {
        None | Some(Value::Null) => {}
        Some(Value::Array(players)) => {
            for (index, raw) in players.iter().enumerate() {
                let checked = PlayerState::deserialize(raw)
                    .map_err(|e| e.to_string())
                    .and_then(|p| check_finite(p.position, p.scale).map(|()| p));
                match checked {
                    Ok(p) => out.snapshot.players.push(p),
                    Err(reason) => out.rejected.push(SnapshotReject::Player {
                        index,
                        id: raw
                            .get("id")
                            .and_then(|id| EntityId::deserialize(id).ok()),
                        reason,
                    }),
                }
            }
        }
        Some(other) => anyhow::bail!("game_changed players is not a list: {other}"),
    }

    match obj.get("ball") {
        None | Some(Value::Null) => {}
        Some(raw) => {
            let checked = BallState::deserialize(raw)
                .map_err(|e| e.to_string())
                .and_then(|b| check_finite(b.position, b.scale).map(|()| b));
            match checked {
                Ok(b) => out.snapshot.ball = Some(b),
                Err(reason) => out.rejected.push(SnapshotReject::Ball { reason }),
            }
        }
    }

    Ok(out)
}

/// Values out of `f32` range decode as infinities; those never reach the
/// interpolator.
fn check_finite(position: Vec2, scale: Option<f32>) -> Result<(), String> {
    if !position.is_finite() {
        return Err(format!("position [{}, {}] is not finite", position.x, position.y));
    }
    match scale {
        Some(s) if !s.is_finite() => Err(format!("scale {s} is not finite")),
        _ => Ok(()),
    }
}

/// Encodes a typed payload into a JSON value for pushing.
pub fn to_payload<T: Serialize>(msg: &T) -> anyhow::Result<Value> {
    serde_json::to_value(msg).context("serialize payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_encodes_as_array() {
        let f = Frame::new("world:lobby", event::JOIN, json!({}))
            .with_refs(Some("1".into()), Some("1".into()));
        assert_eq!(f.encode().unwrap(), r#"["1","1","world:lobby","phx_join",{}]"#);
    }

    #[test]
    fn frame_decodes_null_refs() {
        let f = Frame::decode(r#"[null,null,"world:lobby","game_changed",{"players":[]}]"#).unwrap();
        assert_eq!(f.join_ref, None);
        assert_eq!(f.msg_ref, None);
        assert_eq!(f.event, event::GAME_CHANGED);
    }

    #[test]
    fn reply_is_parsed_from_phx_reply() {
        let f = Frame::new(
            "world:lobby",
            event::REPLY,
            json!({"status": "ok", "response": {"player": 2}}),
        );
        let reply = f.reply().unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(
            player_id_from_join(&reply.response).unwrap(),
            EntityId::Number(2)
        );
    }

    #[test]
    fn non_reply_frames_have_no_reply() {
        let f = Frame::new("world:lobby", event::GAME_CHANGED, json!({}));
        assert!(f.reply().is_none());
    }

    #[test]
    fn player_id_falls_back_to_id_field() {
        let id = player_id_from_join(&json!({"id": "p-7"})).unwrap();
        assert_eq!(id, EntityId::from("p-7"));
        assert!(player_id_from_join(&json!({})).is_err());
    }

    #[test]
    fn move_player_wire_shape() {
        let msg = MovePlayer {
            player: EntityId::Number(1),
            offset: Vec2::new(1.0, 0.0),
        };
        assert_eq!(
            to_payload(&msg).unwrap(),
            json!({"player": 1, "offset": [1.0, 0.0]})
        );
    }

    #[test]
    fn decode_full_snapshot() {
        let payload = json!({
            "players": [
                {"id": "a", "position": [1.0, 2.0], "scale": 1.5},
                {"id": 2, "position": [3, 4]}
            ],
            "ball": {"position": [0, 0]}
        });
        let decoded = decode_game_changed(&payload).unwrap();
        assert!(decoded.rejected.is_empty());
        assert_eq!(decoded.snapshot.players.len(), 2);
        assert_eq!(decoded.snapshot.players[0].scale, Some(1.5));
        assert_eq!(decoded.snapshot.players[1].id, EntityId::Number(2));
        assert_eq!(decoded.snapshot.ball.unwrap().position, Vec2::ZERO);
    }

    #[test]
    fn decode_skips_malformed_entities() {
        let payload = json!({
            "players": [
                {"id": "a"},
                {"id": "b", "position": [5, 6]},
                {"position": [1, 1]}
            ],
            "ball": {"scale": 2}
        });
        let decoded = decode_game_changed(&payload).unwrap();
        assert_eq!(decoded.snapshot.players.len(), 1);
        assert_eq!(decoded.snapshot.players[0].id, EntityId::from("b"));
        assert!(decoded.snapshot.ball.is_none());
        assert_eq!(decoded.rejected.len(), 3);
        assert!(matches!(
            decoded.rejected[0],
            SnapshotReject::Player { index: 0, .. }
        ));
        assert!(matches!(decoded.rejected[2], SnapshotReject::Ball { .. }));
    }

    #[test]
    fn decode_rejects_out_of_range_numbers() {
        let payload = json!({
            "players": [
                {"id": "a", "position": [1e39, 0.0]},
                {"id": "b", "position": [1.0, 1.0], "scale": -1e40},
                {"id": "c", "position": [2.0, 2.0]}
            ],
            "ball": {"position": [0.0, -1e39]}
        });
        let decoded = decode_game_changed(&payload).unwrap();
        assert_eq!(decoded.snapshot.players.len(), 1);
        assert_eq!(decoded.snapshot.players[0].id, EntityId::from("c"));
        assert!(decoded.snapshot.ball.is_none());
        assert_eq!(decoded.rejected.len(), 3);
        assert_eq!(
            decoded.rejected[0],
            SnapshotReject::Player {
                index: 0,
                id: Some(EntityId::from("a")),
                reason: "position [inf, 0] is not finite".to_string(),
            }
        );
        assert!(matches!(decoded.rejected[2], SnapshotReject::Ball { .. }));
    }

    #[test]
    fn rejected_players_keep_their_id_when_readable() {
        let decoded = decode_game_changed(&json!({
            "players": [{"id": 4}, {"position": [1, 1]}]
        }))
        .unwrap();
        assert!(matches!(
            &decoded.rejected[0],
            SnapshotReject::Player { id: Some(EntityId::Number(4)), .. }
        ));
        assert!(matches!(
            &decoded.rejected[1],
            SnapshotReject::Player { id: None, .. }
        ));
    }

    #[test]
    fn numeric_ids_accept_negative_and_integral_floats() {
        let id = |v: Value| serde_json::from_value::<EntityId>(v);
        assert_eq!(id(json!(-1)).unwrap(), EntityId::Signed(-1));
        assert_eq!(id(json!(1.0)).unwrap(), EntityId::Number(1));
        assert_eq!(id(json!(-3.0)).unwrap(), EntityId::Signed(-3));
        assert_eq!(id(json!(1.0)).unwrap(), id(json!(1)).unwrap());
        assert!(id(json!(1.5)).is_err());
        assert!(id(json!(true)).is_err());

        assert_eq!(serde_json::to_value(EntityId::Signed(-1)).unwrap(), json!(-1));
        assert_eq!(
            player_id_from_join(&json!({"player": -2})).unwrap(),
            EntityId::Signed(-2)
        );
    }

    #[test]
    fn decode_rejects_non_object_payload() {
        assert!(decode_game_changed(&json!([1, 2])).is_err());
        assert!(decode_game_changed(&json!({"players": 3})).is_err());
    }

    #[test]
    fn decode_tolerates_missing_sections() {
        let decoded = decode_game_changed(&json!({})).unwrap();
        assert_eq!(decoded, DecodedSnapshot::default());
    }
}
