//! `furbox_shared`
//!
//! Types shared by the furbox client and its tests.
//!
//! Design goals:
//! - Keep the wire format explicit: frames and payloads are plain serde types.
//! - Decode leniently at the entity level so one bad entry never drops a snapshot.
//! - No `unsafe`.

pub mod config;
pub mod math;
pub mod net;
