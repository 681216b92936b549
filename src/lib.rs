//! soundshare: capture this host's system audio and deliver it in
//! near-real-time to any number of receiver hosts over TCP, alongside a
//! latency probe and bidirectional text chat sharing the same session (§1).
//!
//! The core here is transport- and UI-agnostic: [`Session`] (streamer side)
//! and [`ReceiverSession`] (receiver side) talk to the outside world only
//! through the [`UiSink`] trait and the [`audio`] capture/playback traits.
//! `src/main.rs` wires a concrete CLI and `cpal` backend on top.

pub mod audio;
pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod ping;
pub mod protocol;
pub mod receiver;
pub mod sink;
pub mod state;
pub mod streamer;

pub use config::AudioConfig;
pub use error::{Result, SoundshareError};
pub use receiver::ReceiverSession;
pub use sink::{ChannelSink, ChatKind, NullSink, UiSink};
pub use state::AppState;
pub use streamer::Session;
