//! `furbox_client`
//!
//! Client-side systems:
//! - Channel join/leave lifecycle over a websocket
//! - Keyboard input sampling into movement/kick intents
//! - Interpolation of server snapshots for rendering
//! - Frame loop and rendering abstraction wiring

pub mod channel;
pub mod client;
pub mod frame;
pub mod input;
pub mod interp;
pub mod scene;
pub mod socket;

pub use client::{ClientInput, ConnectionState, GameClient};
