//! Rendering abstraction.
//!
//! The client core does not depend on a graphics backend. A renderer
//! receives spawn/remove notifications and, every frame, the interpolated
//! position of each tracked entity.

use tracing::{debug, info};

use crate::interp::{EntityKey, TrackedEntity};

/// Consumer of per-frame entity positions.
pub trait SceneSink: Send {
    /// A new entity appeared; create its visual.
    fn entity_spawned(&mut self, entity: &TrackedEntity);
    fn entity_removed(&mut self, key: &EntityKey);
    fn begin_frame(&mut self);
    fn draw_entity(&mut self, entity: &TrackedEntity);
    fn end_frame(&mut self);
}

/// A no-op scene useful for headless tests.
#[derive(Default)]
pub struct NullScene;

impl SceneSink for NullScene {
    fn entity_spawned(&mut self, _entity: &TrackedEntity) {}
    fn entity_removed(&mut self, _key: &EntityKey) {}
    fn begin_frame(&mut self) {}
    fn draw_entity(&mut self, _entity: &TrackedEntity) {}
    fn end_frame(&mut self) {}
}

/// Logs entity positions every `every` frames.
pub struct LogScene {
    every: u64,
    frame: u64,
    lines: Vec<String>,
}

impl LogScene {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            frame: 0,
            lines: Vec::new(),
        }
    }

    fn logging(&self) -> bool {
        self.frame % self.every == 0
    }
}

impl SceneSink for LogScene {
    fn entity_spawned(&mut self, entity: &TrackedEntity) {
        info!(entity = %entity.key, x = entity.current.x, y = entity.current.y, "Spawned");
    }

    fn entity_removed(&mut self, key: &EntityKey) {
        info!(entity = %key, "Removed");
    }

    fn begin_frame(&mut self) {
        self.frame += 1;
        self.lines.clear();
    }

    fn draw_entity(&mut self, entity: &TrackedEntity) {
        if self.logging() {
            self.lines.push(format!(
                "{}=({:.2}, {:.2})",
                entity.key, entity.current.x, entity.current.y
            ));
        }
    }

    fn end_frame(&mut self) {
        if self.logging() && !self.lines.is_empty() {
            info!(frame = self.frame, "{}", self.lines.join(" "));
        } else if self.logging() {
            debug!(frame = self.frame, "Empty scene");
        }
    }
}
