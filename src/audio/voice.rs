use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::{File, Input},
    tracks::TrackHandle,
    CoreEvent, Event, Songbird, TrackEvent,
};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    audio::{player::PlaybackEvent, queue::Track},
    bot::events::{DriverDisconnectNotifier, TrackFinishedNotifier},
};

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("could not join voice channel: {0}")]
    Join(String),
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("audio file is missing: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("track control failed: {0}")]
    Control(String),
}

/// Everything the player needs from a voice connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceOutput: Send + Sync {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError>;

    async fn leave(&self, guild_id: GuildId) -> Result<(), VoiceError>;

    async fn current_channel(&self, guild_id: GuildId) -> Option<ChannelId>;

    /// Starts `track`, replacing whatever the guild was playing. Completion
    /// is reported as a [`PlaybackEvent::Finished`] carrying `token`.
    async fn start(
        &self,
        guild_id: GuildId,
        track: &Track,
        token: u64,
        gain: f32,
    ) -> Result<(), VoiceError>;

    fn stop(&self, guild_id: GuildId);

    fn pause(&self, guild_id: GuildId) -> Result<(), VoiceError>;

    fn resume(&self, guild_id: GuildId) -> Result<(), VoiceError>;

    fn set_gain(&self, guild_id: GuildId, gain: f32);
}

/// [`VoiceOutput`] backed by songbird.
pub struct SongbirdOutput {
    manager: Arc<Songbird>,
    events: flume::Sender<PlaybackEvent>,
    tracks: DashMap<GuildId, TrackHandle>,
}

impl SongbirdOutput {
    pub fn new(manager: Arc<Songbird>, events: flume::Sender<PlaybackEvent>) -> Self {
        Self {
            manager,
            events,
            tracks: DashMap::new(),
        }
    }
}

#[async_trait]
impl VoiceOutput for SongbirdOutput {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| VoiceError::Join(e.to_string()))?;

        let mut call = call.lock().await;
        if let Err(e) = call.deafen(true).await {
            warn!("Could not self-deafen in guild {}: {:?}", guild_id, e);
        }

        // Rejoining must not stack a second notifier on the call.
        call.remove_all_global_events();
        call.add_global_event(
            Event::Core(CoreEvent::DriverDisconnect),
            DriverDisconnectNotifier {
                guild_id,
                events: self.events.clone(),
            },
        );

        info!("🔊 Joined voice channel {} in guild {}", channel_id, guild_id);
        Ok(())
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), VoiceError> {
        self.stop(guild_id);

        if self.manager.get(guild_id).is_none() {
            return Ok(());
        }

        self.manager
            .remove(guild_id)
            .await
            .map_err(|e| VoiceError::Join(e.to_string()))?;

        info!("👋 Left voice channel in guild {}", guild_id);
        Ok(())
    }

    async fn current_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let call = self.manager.get(guild_id)?;
        let call = call.lock().await;
        call.current_channel()
            .map(|channel| ChannelId::new(channel.0.get()))
    }

    async fn start(
        &self,
        guild_id: GuildId,
        track: &Track,
        token: u64,
        gain: f32,
    ) -> Result<(), VoiceError> {
        if tokio::fs::metadata(&track.path).await.is_err() {
            return Err(VoiceError::MissingFile(track.path.clone()));
        }

        let call = self.manager.get(guild_id).ok_or(VoiceError::NotConnected)?;
        self.stop(guild_id);

        let input: Input = File::new(track.path.clone()).into();

        let handle = {
            let mut call = call.lock().await;
            call.play_input(input)
        };

        if let Err(e) = handle.set_volume(gain) {
            warn!("Could not set volume for {}: {:?}", track.title, e);
        }

        self.tracks.insert(guild_id, handle.clone());

        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackFinishedNotifier {
                        guild_id,
                        token,
                        events: self.events.clone(),
                    },
                )
                .map_err(|e| VoiceError::Control(e.to_string()))?;
        }

        debug!("🎵 Started {} (token {}) in guild {}", track.title, token, guild_id);
        Ok(())
    }

    fn stop(&self, guild_id: GuildId) {
        if let Some((_, handle)) = self.tracks.remove(&guild_id) {
            let _ = handle.stop();
        }
    }

    fn pause(&self, guild_id: GuildId) -> Result<(), VoiceError> {
        let handle = self.tracks.get(&guild_id).ok_or(VoiceError::NotConnected)?;
        handle.pause().map_err(|e| VoiceError::Control(e.to_string()))
    }

    fn resume(&self, guild_id: GuildId) -> Result<(), VoiceError> {
        let handle = self.tracks.get(&guild_id).ok_or(VoiceError::NotConnected)?;
        handle.play().map_err(|e| VoiceError::Control(e.to_string()))
    }

    fn set_gain(&self, guild_id: GuildId, gain: f32) {
        if let Some(handle) = self.tracks.get(&guild_id) {
            if let Err(e) = handle.set_volume(gain) {
                warn!("Could not set volume in guild {}: {:?}", guild_id, e);
            }
        }
    }
}
