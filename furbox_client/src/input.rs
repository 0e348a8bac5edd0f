//! Input handling.
//!
//! Physical keys are decoded into [`Key`] at the edge and mapped to logical
//! [`Actions`]. The sampler keeps the held-key set and, once per frame,
//! turns it into an [`Intent`] and the matching `move_player`/`kick` pushes.

use bitflags::bitflags;
use furbox_shared::{
    math::Vec2,
    net::{event, to_payload, EntityId, Kick, MovePlayer},
};

use crate::channel::Channel;

bitflags! {
    /// Physical keys currently held.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeldKeys: u16 {
        const ARROW_UP    = 1 << 0;
        const ARROW_DOWN  = 1 << 1;
        const ARROW_LEFT  = 1 << 2;
        const ARROW_RIGHT = 1 << 3;
        const W           = 1 << 4;
        const A           = 1 << 5;
        const S           = 1 << 6;
        const D           = 1 << 7;
        const SPACE       = 1 << 8;
    }
}

bitflags! {
    /// Logical game actions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Actions: u8 {
        const MOVE_UP    = 1 << 0;
        const MOVE_DOWN  = 1 << 1;
        const MOVE_LEFT  = 1 << 2;
        const MOVE_RIGHT = 1 << 3;
        const KICK       = 1 << 4;
    }
}

/// A key the game reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    W,
    A,
    S,
    D,
    Space,
}

impl Key {
    pub const ALL: [Key; 9] = [
        Key::ArrowUp,
        Key::ArrowDown,
        Key::ArrowLeft,
        Key::ArrowRight,
        Key::W,
        Key::A,
        Key::S,
        Key::D,
        Key::Space,
    ];

    /// Decodes a key name. Letters are case-insensitive; unknown keys are `None`.
    pub fn from_name(name: &str) -> Option<Key> {
        let key = match name {
            "ArrowUp" => Key::ArrowUp,
            "ArrowDown" => Key::ArrowDown,
            "ArrowLeft" => Key::ArrowLeft,
            "ArrowRight" => Key::ArrowRight,
            " " => Key::Space,
            _ => match name.to_ascii_lowercase().as_str() {
                "w" => Key::W,
                "a" => Key::A,
                "s" => Key::S,
                "d" => Key::D,
                "up" => Key::ArrowUp,
                "down" => Key::ArrowDown,
                "left" => Key::ArrowLeft,
                "right" => Key::ArrowRight,
                "space" => Key::Space,
                _ => return None,
            },
        };
        Some(key)
    }

    fn flag(self) -> HeldKeys {
        match self {
            Key::ArrowUp => HeldKeys::ARROW_UP,
            Key::ArrowDown => HeldKeys::ARROW_DOWN,
            Key::ArrowLeft => HeldKeys::ARROW_LEFT,
            Key::ArrowRight => HeldKeys::ARROW_RIGHT,
            Key::W => HeldKeys::W,
            Key::A => HeldKeys::A,
            Key::S => HeldKeys::S,
            Key::D => HeldKeys::D,
            Key::Space => HeldKeys::SPACE,
        }
    }

    pub fn action(self) -> Actions {
        match self {
            Key::ArrowUp | Key::W => Actions::MOVE_UP,
            Key::ArrowDown | Key::S => Actions::MOVE_DOWN,
            Key::ArrowLeft | Key::A => Actions::MOVE_LEFT,
            Key::ArrowRight | Key::D => Actions::MOVE_RIGHT,
            Key::Space => Actions::KICK,
        }
    }
}

/// Key-down / key-up signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Down(Key),
    Up(Key),
}

/// What the player wants this frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Intent {
    /// Unit-length or zero movement direction.
    pub offset: Vec2,
    pub kick: bool,
}

impl Intent {
    pub fn is_idle(&self) -> bool {
        self.offset.is_zero() && !self.kick
    }
}

/// Held-key state plus per-frame sampling.
#[derive(Debug, Clone, Default)]
pub struct InputSampler {
    held: HeldKeys,
}

impl InputSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&mut self, key: Key) {
        self.held.insert(key.flag());
    }

    pub fn release(&mut self, key: Key) {
        self.held.remove(key.flag());
    }

    pub fn apply(&mut self, ev: KeyEvent) {
        match ev {
            KeyEvent::Down(key) => self.press(key),
            KeyEvent::Up(key) => self.release(key),
        }
    }

    /// Releases everything.
    pub fn clear(&mut self) {
        self.held = HeldKeys::empty();
    }

    pub fn held_keys(&self) -> HeldKeys {
        self.held
    }

    pub fn actions(&self) -> Actions {
        Key::ALL
            .iter()
            .filter(|k| self.held.contains(k.flag()))
            .fold(Actions::empty(), |acc, k| acc | k.action())
    }

    pub fn intent(&self) -> Intent {
        intent_from_actions(self.actions())
    }

    /// Samples held input and pushes the resulting intent messages.
    ///
    /// Sends `move_player` only for a non-zero offset and `kick` for every
    /// frame the kick key is held.
    pub fn sample<C: Channel + ?Sized>(
        &self,
        player: &EntityId,
        channel: &mut C,
    ) -> anyhow::Result<Intent> {
        let intent = self.intent();
        if let Some(msg) = build_move(player, intent) {
            channel.push(event::MOVE_PLAYER, to_payload(&msg)?)?;
        }
        if intent.kick {
            channel.push(
                event::KICK,
                to_payload(&Kick {
                    player: player.clone(),
                })?,
            )?;
        }
        Ok(intent)
    }
}

/// Turns an action set into an intent, normalizing diagonals.
pub fn intent_from_actions(actions: Actions) -> Intent {
    let axis = |pos: Actions, neg: Actions| -> f32 {
        actions.contains(pos) as i8 as f32 - actions.contains(neg) as i8 as f32
    };
    let dx = axis(Actions::MOVE_RIGHT, Actions::MOVE_LEFT);
    let dy = axis(Actions::MOVE_UP, Actions::MOVE_DOWN);

    let mut offset = Vec2::new(dx, dy);
    if dx != 0.0 && dy != 0.0 {
        offset = offset.normalize_or_zero();
    }

    Intent {
        offset,
        kick: actions.contains(Actions::KICK),
    }
}

/// Builds the `move_player` message for an intent, if it moves at all.
pub fn build_move(player: &EntityId, intent: Intent) -> Option<MovePlayer> {
    if intent.offset.is_zero() {
        return None;
    }
    Some(MovePlayer {
        player: player.clone(),
        offset: intent.offset,
    })
}
