//! # Audio Module
//!
//! Queueing and playback.
//!
//! ### [`queue`] - Queue Management
//! - Per-guild state: current track, pending FIFO, loop, volume
//! - Playback tokens so each finished track is handled once
//!
//! ### [`player`] - Music Player
//! - Keyed store of guild states, one async mutex per guild
//! - Download, enqueue and start flow, plus reactions to playback events
//!
//! ### [`voice`] - Voice Output
//! - `VoiceOutput` trait between the player and songbird
//! - `SongbirdOutput`, which plays downloaded files on the guild's call

pub mod player;
pub mod queue;
pub mod voice;
