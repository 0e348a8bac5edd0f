//! Interpolation.
//!
//! The server pushes discrete snapshots at its own cadence. Each tracked
//! entity keeps the last authoritative `target` and the rendered `current`;
//! every frame `current` closes a fixed fraction of the remaining distance.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use furbox_shared::{
    config::ClientConfig,
    math::Vec2,
    net::{DecodedSnapshot, EntityId, GameChanged, SnapshotReject},
};

/// Fraction of the remaining distance closed per frame by default.
pub const DEFAULT_SMOOTHING: f32 = 0.2;

/// Rendering key of a tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    Player(EntityId),
    Ball,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Player(id) => write!(f, "player:{id}"),
            EntityKey::Ball => f.write_str("ball"),
        }
    }
}

/// Position pair of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub key: EntityKey,
    /// Last rendered, interpolated position.
    pub current: Vec2,
    /// Latest authoritative position.
    pub target: Vec2,
    pub scale: Option<f32>,
}

/// How the per-frame step is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Smoothing {
    /// Close `factor` of the distance every frame, whatever its length.
    Fixed { factor: f32 },
    /// Close `1 - (1 - factor)^(dt * reference_hz)`, so the same wall-clock
    /// convergence at any frame rate.
    TimeScaled { factor: f32, reference_hz: f32 },
}

impl Default for Smoothing {
    fn default() -> Self {
        Smoothing::Fixed {
            factor: DEFAULT_SMOOTHING,
        }
    }
}

impl Smoothing {
    /// Fraction of the remaining distance to close for a frame of length `dt`.
    pub fn step(self, dt: Duration) -> f32 {
        match self {
            Smoothing::Fixed { factor } => factor,
            Smoothing::TimeScaled {
                factor,
                reference_hz,
            } => {
                let frames = dt.as_secs_f32() * reference_hz;
                1.0 - (1.0 - factor).powf(frames)
            }
        }
    }
}

/// What happens to entities a snapshot no longer mentions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Never remove.
    #[default]
    KeepAll,
    /// Drop anything missing from the latest snapshot.
    PruneMissing,
}

/// Outcome of applying one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotReport {
    /// Keys seen for the first time; the renderer should create visuals.
    pub spawned: Vec<EntityKey>,
    /// Keys whose target was overwritten.
    pub updated: usize,
    /// Keys dropped under [`Retention::PruneMissing`].
    pub removed: Vec<EntityKey>,
}

/// Smooths authoritative snapshots into per-frame positions.
#[derive(Debug, Clone, Default)]
pub struct RemoteStateInterpolator {
    entities: BTreeMap<EntityKey, TrackedEntity>,
    smoothing: Smoothing,
    retention: Retention,
}

impl RemoteStateInterpolator {
    pub fn new(smoothing: Smoothing, retention: Retention) -> Self {
        Self {
            entities: BTreeMap::new(),
            smoothing,
            retention,
        }
    }

    pub fn from_config(cfg: &ClientConfig) -> Self {
        let smoothing = if cfg.time_scaled_smoothing {
            Smoothing::TimeScaled {
                factor: cfg.smoothing_factor,
                reference_hz: cfg.frame_hz as f32,
            }
        } else {
            Smoothing::Fixed {
                factor: cfg.smoothing_factor,
            }
        };
        let retention = if cfg.prune_missing {
            Retention::PruneMissing
        } else {
            Retention::KeepAll
        };
        Self::new(smoothing, retention)
    }

    /// Applies a snapshot: new keys are seeded at their position, known keys
    /// only get a new target.
    pub fn apply_snapshot(&mut self, snap: &GameChanged) -> SnapshotReport {
        self.apply(snap, Some(Vec::new()))
    }

    /// Applies a leniently decoded snapshot.
    ///
    /// Entities that were rejected during decoding are left untouched and
    /// never pruned. If a rejected player carried no readable id, pruning is
    /// skipped for this snapshot.
    pub fn apply_decoded(&mut self, decoded: &DecodedSnapshot) -> SnapshotReport {
        let keep = decoded
            .rejected
            .iter()
            .map(|reject| match reject {
                SnapshotReject::Player { id, .. } => id.clone().map(EntityKey::Player),
                SnapshotReject::Ball { .. } => Some(EntityKey::Ball),
            })
            .collect::<Option<Vec<_>>>();
        self.apply(&decoded.snapshot, keep)
    }

    /// `keep` lists keys that survive pruning; `None` disables it.
    fn apply(&mut self, snap: &GameChanged, keep: Option<Vec<EntityKey>>) -> SnapshotReport {
        let mut report = SnapshotReport::default();

        let players = snap
            .players
            .iter()
            .map(|p| (EntityKey::Player(p.id.clone()), p.position, p.scale));
        let ball = snap
            .ball
            .iter()
            .map(|b| (EntityKey::Ball, b.position, b.scale));

        let mut seen = Vec::with_capacity(snap.players.len() + 1);
        for (key, position, scale) in players.chain(ball) {
            self.upsert(key.clone(), position, scale, &mut report);
            seen.push(key);
        }

        if let (Retention::PruneMissing, Some(keep)) = (self.retention, keep) {
            let stale: Vec<EntityKey> = self
                .entities
                .keys()
                .filter(|k| !seen.contains(k) && !keep.contains(k))
                .cloned()
                .collect();
            for key in stale {
                self.entities.remove(&key);
                report.removed.push(key);
            }
        }

        report
    }

    fn upsert(
        &mut self,
        key: EntityKey,
        position: Vec2,
        scale: Option<f32>,
        report: &mut SnapshotReport,
    ) {
        match self.entities.get_mut(&key) {
            Some(ent) => {
                ent.target = position;
                if scale.is_some() {
                    ent.scale = scale;
                }
                report.updated += 1;
            }
            None => {
                self.entities.insert(
                    key.clone(),
                    TrackedEntity {
                        key: key.clone(),
                        current: position,
                        target: position,
                        scale,
                    },
                );
                report.spawned.push(key);
            }
        }
    }

    /// Advances every entity one frame toward its target.
    pub fn advance(&mut self, dt: Duration) {
        let t = self.smoothing.step(dt).clamp(0.0, 1.0);
        for ent in self.entities.values_mut() {
            let next = ent.current + (ent.target - ent.current) * t;
            // On overflow jump straight to the target.
            ent.current = if next.is_finite() { next } else { ent.target };
        }
    }

    /// Current position of an entity.
    pub fn position(&self, key: &EntityKey) -> Option<Vec2> {
        self.entities.get(key).map(|e| e.current)
    }

    pub fn get(&self, key: &EntityKey) -> Option<&TrackedEntity> {
        self.entities.get(key)
    }

    /// Tracked entities in stable key order.
    pub fn entities(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn smoothing(&self) -> Smoothing {
        self.smoothing
    }
}
