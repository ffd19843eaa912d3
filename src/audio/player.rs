use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{io, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        queue::{Finish, GuildMusicState, PlaybackStatus, Started, Track, DEFAULT_VOLUME},
        voice::VoiceOutput,
    },
    error::BotError,
    sources::Downloader,
    storage::DownloadStore,
};

/// Delay before a guild's leftover downloads are swept after the bot leaves
/// its voice channel.
const DIRECTORY_CLEANUP_DELAY: Duration = Duration::from_secs(5);

/// Notifications from the voice layer, delivered to [`MusicPlayer::handle_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The track started with `token` ended, normally or with an error.
    Finished {
        guild_id: GuildId,
        token: u64,
        error: Option<String>,
    },
    /// The voice connection dropped without being asked to.
    Disconnected { guild_id: GuildId, reason: String },
}

/// A message the player wants posted in a text channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub channel_id: ChannelId,
    pub content: String,
}

pub struct PlayRequest {
    pub guild_id: GuildId,
    pub voice_channel: ChannelId,
    pub text_channel: ChannelId,
    pub query: String,
    pub requested_by: UserId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    /// The track started immediately.
    Started(Track),
    /// The track waits behind `position` others.
    Queued { track: Track, position: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkipReport {
    pub skipped: usize,
    pub queued_before: usize,
    pub now_playing: Option<Track>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    /// Current track first.
    pub tracks: Vec<Track>,
    pub looping: bool,
    pub total_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub track: Track,
    pub volume: u8,
    pub paused: bool,
}

/// Per-guild state keyed by guild id. Each entry has its own mutex, so
/// commands for one guild run one at a time while other guilds proceed.
#[derive(Default)]
pub struct GuildStore {
    guilds: DashMap<GuildId, Arc<Mutex<GuildMusicState>>>,
}

impl GuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<Mutex<GuildMusicState>> {
        self.guilds
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildMusicState::new())))
            .clone()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Mutex<GuildMusicState>>> {
        self.guilds.get(&guild_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, guild_id: GuildId) -> Option<Arc<Mutex<GuildMusicState>>> {
        self.guilds.remove(&guild_id).map(|(_, state)| state)
    }

    /// Removes the entry only if it is still `state`.
    pub fn remove_if_current(&self, guild_id: GuildId, state: &Arc<Mutex<GuildMusicState>>) {
        self.guilds
            .remove_if(&guild_id, |_, entry| Arc::ptr_eq(entry, state));
    }

    #[cfg(test)]
    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.guilds.contains_key(&guild_id)
    }

    /// Whether `state` is still the live entry for the guild.
    pub fn is_current(&self, guild_id: GuildId, state: &Arc<Mutex<GuildMusicState>>) -> bool {
        self.guilds
            .get(&guild_id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), state))
    }
}

/// Coordinates downloads, the per-guild queues and the voice connection.
pub struct MusicPlayer {
    guilds: Arc<GuildStore>,
    voice: Arc<dyn VoiceOutput>,
    downloader: Arc<dyn Downloader>,
    store: DownloadStore,
    sweep_delay: Duration,
}

impl MusicPlayer {
    pub fn new(
        voice: Arc<dyn VoiceOutput>,
        downloader: Arc<dyn Downloader>,
        store: DownloadStore,
    ) -> Self {
        Self {
            guilds: Arc::new(GuildStore::new()),
            voice,
            downloader,
            store,
            sweep_delay: DIRECTORY_CLEANUP_DELAY,
        }
    }

    #[cfg(test)]
    pub fn guild_state(&self, guild_id: GuildId) -> Arc<Mutex<GuildMusicState>> {
        self.guilds.get_or_create(guild_id)
    }

    #[cfg(test)]
    pub fn with_sweep_delay(mut self, delay: Duration) -> Self {
        self.sweep_delay = delay;
        self
    }

    pub fn store(&self) -> &DownloadStore {
        &self.store
    }

    /// Voice channel the bot is connected to in the guild, if any.
    pub async fn bot_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.voice.current_channel(guild_id).await
    }

    /// Downloads `request.query` and queues it, starting playback when the
    /// guild is idle.
    ///
    /// The download runs without holding the guild lock.
    pub async fn play(&self, request: PlayRequest) -> Result<PlayOutcome, BotError> {
        let guild_id = request.guild_id;
        let mut state = self.guilds.get_or_create(guild_id);

        let staging = self.store.staging_dir(guild_id).await?;
        let resolved = self
            .downloader
            .resolve(&request.query, &staging, request.requested_by)
            .await;

        let mut track = match resolved {
            Ok(track) => track,
            Err(e) => {
                self.store.discard_staging(&staging).await;
                return Err(e.into());
            }
        };

        // The bot may have left while downloading, in which case the state
        // we started with is gone and the track goes to a fresh one.
        let mut guard = state.clone().lock_owned().await;
        while !self.guilds.is_current(guild_id, &state) {
            drop(guard);
            debug!("Guild {} was reset during a download, requeueing {}", guild_id, track.title);
            state = self.guilds.get_or_create(guild_id);
            guard = state.clone().lock_owned().await;
        }

        let committed = self.store.commit(guild_id, &track.path).await;
        self.store.discard_staging(&staging).await;
        track.path = committed?;

        guard.set_text_channel(request.text_channel);
        let position = guard.enqueue(track.clone());

        if guard.is_active() {
            return Ok(PlayOutcome::Queued { track, position });
        }

        self.ensure_connected(guild_id, &mut guard, request.voice_channel)
            .await?;

        let first = guard.start_next();
        match self.play_started(guild_id, &mut guard, first).await {
            Some(started) if started.path == track.path && position == 0 => {
                Ok(PlayOutcome::Started(started))
            }
            Some(_) => Ok(PlayOutcome::Queued { track, position }),
            None => {
                self.go_idle(guild_id, &mut guard).await;
                Err(BotError::VoiceConnection(format!(
                    "could not start playback of {}",
                    track.title
                )))
            }
        }
    }

    /// Skips `count` tracks, the current one included.
    pub async fn skip(&self, guild_id: GuildId, count: usize) -> Result<SkipReport, BotError> {
        let state = self.guilds.get(guild_id).ok_or(BotError::NothingPlaying)?;
        let mut guard = state.lock().await;

        let queued_before = guard.len();
        let skip = guard.skip(count)?;

        self.voice.stop(guild_id);
        self.store.remove_files_later(skip.discarded);

        let now_playing = self.play_started(guild_id, &mut guard, skip.started).await;
        if now_playing.is_none() {
            self.go_idle(guild_id, &mut guard).await;
        }

        Ok(SkipReport {
            skipped: skip.skipped,
            queued_before,
            now_playing,
        })
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<(), BotError> {
        let state = self.guilds.get(guild_id).ok_or(BotError::NothingPlaying)?;
        let mut guard = state.lock().await;

        guard.pause()?;
        if let Err(e) = self.voice.pause(guild_id) {
            guard.resume()?;
            return Err(BotError::VoiceConnection(e.to_string()));
        }

        info!("⏸️ Paused guild {}", guild_id);
        Ok(())
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<(), BotError> {
        let state = self.guilds.get(guild_id).ok_or(BotError::NothingPlaying)?;
        let mut guard = state.lock().await;

        guard.resume()?;
        if let Err(e) = self.voice.resume(guild_id) {
            guard.pause()?;
            return Err(BotError::VoiceConnection(e.to_string()));
        }

        info!("▶️ Resumed guild {}", guild_id);
        Ok(())
    }

    pub async fn is_paused(&self, guild_id: GuildId) -> bool {
        match self.guilds.get(guild_id) {
            Some(state) => state.lock().await.status() == PlaybackStatus::Paused,
            None => false,
        }
    }

    /// Current guild volume in percent.
    pub async fn volume(&self, guild_id: GuildId) -> u8 {
        match self.guilds.get(guild_id) {
            Some(state) => state.lock().await.volume(),
            None => DEFAULT_VOLUME,
        }
    }

    /// Sets the guild volume; out-of-range values leave it unchanged.
    ///
    /// Needs guild state, so a guild the bot never played in is rejected.
    pub async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<u8, BotError> {
        let state = self.guilds.get(guild_id).ok_or(BotError::NothingPlaying)?;
        let mut guard = state.lock().await;

        guard.set_volume(volume)?;
        self.voice.set_gain(guild_id, guard.gain());

        info!("🔊 Volume set to {}% in guild {}", guard.volume(), guild_id);
        Ok(guard.volume())
    }

    /// Flips looping; requires something queued.
    pub async fn toggle_loop(&self, guild_id: GuildId) -> Result<bool, BotError> {
        let state = self.guilds.get(guild_id).ok_or(BotError::NothingPlaying)?;
        let mut guard = state.lock().await;

        if guard.is_empty() {
            return Err(BotError::NothingPlaying);
        }

        Ok(guard.toggle_loop())
    }

    pub async fn now_playing(&self, guild_id: GuildId) -> Result<NowPlaying, BotError> {
        let state = self.guilds.get(guild_id).ok_or(BotError::NothingPlaying)?;
        let guard = state.lock().await;

        let track = guard.peek_current().cloned().ok_or(BotError::NothingPlaying)?;
        Ok(NowPlaying {
            track,
            volume: guard.volume(),
            paused: guard.status() == PlaybackStatus::Paused,
        })
    }

    pub async fn queue(&self, guild_id: GuildId) -> Result<QueueSnapshot, BotError> {
        let state = self.guilds.get(guild_id).ok_or(BotError::NothingPlaying)?;
        let guard = state.lock().await;

        if guard.is_empty() {
            return Err(BotError::NothingPlaying);
        }

        Ok(QueueSnapshot {
            tracks: guard.tracks().cloned().collect(),
            looping: guard.is_looping(),
            total_duration: guard.total_duration(),
        })
    }

    /// Deletes downloaded files of the guild that no queued track uses.
    pub async fn cleanup(&self, guild_id: GuildId) -> Result<usize, BotError> {
        Ok(sweep_guild(&self.guilds, &self.store, guild_id).await?)
    }

    /// Reacts to a voice-layer event. Returns a message to post, if any.
    pub async fn handle_event(&self, event: PlaybackEvent) -> Option<Notice> {
        match event {
            PlaybackEvent::Finished {
                guild_id,
                token,
                error,
            } => {
                if let Some(e) = &error {
                    error!("Playback error in guild {}: {}", guild_id, e);
                }
                self.track_finished(guild_id, token).await;
                None
            }
            PlaybackEvent::Disconnected { guild_id, reason } => {
                let state = self.guilds.get(guild_id)?;
                let mut guard = state.lock().await;
                warn!(
                    "🔌 Voice connection to {:?} lost in guild {}: {}",
                    guard.voice_channel(),
                    guild_id,
                    reason
                );

                let paths = guard.reset();
                self.store.remove_files_later(paths);
                if let Err(e) = self.voice.leave(guild_id).await {
                    debug!("Leaving after disconnect failed: {}", e);
                }

                guard.text_channel().map(|channel_id| Notice {
                    channel_id,
                    content: "Lost connection to the voice channel, playback stopped.".to_string(),
                })
            }
        }
    }

    /// The bot left the voice channel: forget the guild and sweep its
    /// downloads once the decoder has released them.
    ///
    /// A play issued in the meantime keeps its files; the sweep only removes
    /// what the guild's live queue does not reference.
    pub async fn forget(&self, guild_id: GuildId) {
        if let Some(state) = self.guilds.remove(guild_id) {
            let mut guard = state.lock().await;
            guard.reset();
            self.voice.stop(guild_id);
        }

        let guilds = self.guilds.clone();
        let store = self.store.clone();
        let delay = self.sweep_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = sweep_guild(&guilds, &store, guild_id).await {
                error!("Error sweeping downloads of guild {}: {}", guild_id, e);
            }
        });
        info!("🧹 Forgot state of guild {}", guild_id);
    }

    async fn track_finished(&self, guild_id: GuildId, token: u64) {
        let Some(state) = self.guilds.get(guild_id) else {
            debug!("Finish event for unknown guild {}", guild_id);
            return;
        };
        let mut guard = state.lock().await;

        match guard.finish(token) {
            Finish::Stale => {}
            Finish::Next { started, discarded } => {
                self.store.remove_files_later(discarded);
                if self
                    .play_started(guild_id, &mut guard, Some(started))
                    .await
                    .is_none()
                {
                    self.go_idle(guild_id, &mut guard).await;
                }
            }
            Finish::Idle { discarded } => {
                self.store.remove_files_later(discarded);
                info!("📭 Queue finished in guild {}", guild_id);
                self.go_idle(guild_id, &mut guard).await;
            }
        }
    }

    async fn ensure_connected(
        &self,
        guild_id: GuildId,
        state: &mut GuildMusicState,
        channel_id: ChannelId,
    ) -> Result<(), BotError> {
        if self.voice.current_channel(guild_id).await.is_some() {
            return Ok(());
        }

        state.set_status(PlaybackStatus::Connecting);
        match self.voice.join(guild_id, channel_id).await {
            Ok(()) => {
                state.set_voice_channel(channel_id);
                state.set_status(PlaybackStatus::Idle);
                Ok(())
            }
            Err(e) => {
                error!("Error connecting to voice in guild {}: {}", guild_id, e);
                let paths = state.reset();
                self.store.remove_files_later(paths);
                Err(BotError::VoiceConnection(e.to_string()))
            }
        }
    }

    /// Sends `next` to the voice connection. Tracks that cannot be started
    /// are dropped and the following one is tried.
    async fn play_started(
        &self,
        guild_id: GuildId,
        state: &mut GuildMusicState,
        mut next: Option<Started>,
    ) -> Option<Track> {
        while let Some(started) = next {
            match self
                .voice
                .start(guild_id, &started.track, started.token, state.gain())
                .await
            {
                Ok(()) => {
                    info!("🎵 Now playing in guild {}: {}", guild_id, started.track.title);
                    return Some(started.track);
                }
                Err(e) => {
                    error!("Error playing {} in guild {}: {}", started.track.title, guild_id, e);
                    let discarded = state.abandon(started.token);
                    self.store.remove_files_later(discarded);
                    next = state.start_next();
                }
            }
        }

        state.set_status(PlaybackStatus::Idle);
        None
    }

    /// Nothing left to play: leave the voice channel.
    async fn go_idle(&self, guild_id: GuildId, state: &mut GuildMusicState) {
        if let Err(e) = self.voice.leave(guild_id).await {
            warn!("Error leaving voice in guild {}: {}", guild_id, e);
        }
        state.set_status(PlaybackStatus::Disconnected);
    }
}

/// Removes the guild's downloads that its queue does not reference, under
/// the guild lock. Staging directories of running downloads are left alone.
/// An entry left empty and disconnected is dropped from the store.
async fn sweep_guild(
    guilds: &GuildStore,
    store: &DownloadStore,
    guild_id: GuildId,
) -> io::Result<usize> {
    let state = guilds.get_or_create(guild_id);
    let guard = state.lock().await;

    let removed = store.cleanup(guild_id, &guard.referenced_paths()).await?;
    if guard.is_empty() && guard.status() == PlaybackStatus::Disconnected {
        guilds.remove_if_current(guild_id, &state);
    }
    Ok(removed)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::{
        audio::voice::{MockVoiceOutput, VoiceError},
        sources::DownloadError,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::{
        path::{Path, PathBuf},
        sync::Mutex as StdMutex,
    };
    use tokio::sync::Notify;

    const GUILD: GuildId = GuildId::new(10);
    const VOICE: ChannelId = ChannelId::new(20);
    const TEXT: ChannelId = ChannelId::new(30);

    /// Downloads of queries starting with `slow` announce themselves on
    /// `entered` and then wait for `release`.
    #[derive(Default)]
    struct GatedDownloader {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Downloader for GatedDownloader {
        async fn resolve(
            &self,
            query: &str,
            dest_dir: &Path,
            requested_by: UserId,
        ) -> Result<Track, DownloadError> {
            if query.starts_with("slow") {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(fake_track(query, dest_dir, requested_by))
        }
    }

    fn player_in(dir: &Path, voice: MockVoiceOutput) -> MusicPlayer {
        MusicPlayer::new(
            Arc::new(voice),
            Arc::new(fake_downloader()),
            DownloadStore::new(dir).with_retry_delay(Duration::from_millis(1)),
        )
    }

    fn request(query: &str) -> PlayRequest {
        request_in(GUILD, query)
    }

    fn token_of(started: &StdMutex<Vec<(String, u64)>>, title: &str) -> u64 {
        started
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| t == title)
            .map(|(_, token)| *token)
            .unwrap()
    }

    async fn titles(player: &MusicPlayer) -> Vec<String> {
        match player.queue(GUILD).await {
            Ok(snapshot) => snapshot.tracks.into_iter().map(|t| t.title).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn first_play_starts_and_later_ones_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let player = player_in(tmp.path(), recording_voice(started.clone()));

        let first = player.play(request("a")).await.unwrap();
        let second = player.play(request("b")).await.unwrap();

        assert!(matches!(first, PlayOutcome::Started(ref t) if t.title == "A"));
        assert!(matches!(second, PlayOutcome::Queued { position: 1, .. }));
        assert_eq!(titles(&player).await, vec!["A", "B"]);
        assert_eq!(started.lock().unwrap().len(), 1);

        let committed = tmp.path().join("10").join("a.webm");
        assert!(committed.exists());
    }

    #[tokio::test]
    async fn failed_download_leaves_queue_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let player = player_in(tmp.path(), recording_voice(started.clone()));

        player.play(request("a")).await.unwrap();
        let err = player.play(request("xyz123notreal")).await.unwrap_err();

        assert!(matches!(err, BotError::Download(DownloadError::NoResults)));
        assert_eq!(titles(&player).await, vec!["A"]);

        // The guild keeps answering commands.
        assert!(matches!(
            player.play(request("b")).await.unwrap(),
            PlayOutcome::Queued { position: 1, .. }
        ));
        assert_eq!(player.set_volume(GUILD, 50).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn skip_two_of_three_plays_the_third() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let player = player_in(tmp.path(), recording_voice(started.clone()));
        for query in ["a", "b", "c"] {
            player.play(request(query)).await.unwrap();
        }

        let report = player.skip(GUILD, 2).await.unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.queued_before, 3);
        assert_eq!(report.now_playing.map(|t| t.title), Some("C".to_string()));
        assert_eq!(titles(&player).await, vec!["C"]);
        let started: Vec<String> = started.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(started, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn skip_everything_goes_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let player = player_in(tmp.path(), recording_voice(started));
        player.play(request("a")).await.unwrap();
        player.play(request("b")).await.unwrap();

        let report = player.skip(GUILD, 99).await.unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.now_playing, None);
        assert!(matches!(player.queue(GUILD).await, Err(BotError::NothingPlaying)));
        assert!(matches!(player.skip(GUILD, 1).await, Err(BotError::NothingPlaying)));
    }

    #[tokio::test]
    async fn loop_replays_a_single_track() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let player = player_in(tmp.path(), recording_voice(started.clone()));
        player.play(request("a")).await.unwrap();
        assert!(player.toggle_loop(GUILD).await.unwrap());

        let token = started.lock().unwrap()[0].1;
        let event = PlaybackEvent::Finished {
            guild_id: GUILD,
            token,
            error: None,
        };
        assert_eq!(player.handle_event(event.clone()).await, None);
        // A second notification for the same track changes nothing.
        player.handle_event(event).await;

        let started = started.lock().unwrap().clone();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].0, "A");
        assert_ne!(started[1].1, token);
        assert_eq!(titles(&player).await, vec!["A"]);
        assert!(tmp.path().join("10").join("a.webm").exists());
    }

    #[tokio::test]
    async fn finish_advances_and_errors_still_advance() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let player = player_in(tmp.path(), recording_voice(started.clone()));
        player.play(request("a")).await.unwrap();
        player.play(request("b")).await.unwrap();

        let token = started.lock().unwrap()[0].1;
        player
            .handle_event(PlaybackEvent::Finished {
                guild_id: GUILD,
                token,
                error: Some("decoder exploded".to_string()),
            })
            .await;

        assert_eq!(titles(&player).await, vec!["B"]);
        assert_eq!(started.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn volume_rejects_out_of_range_values() {
        let tmp = tempfile::tempdir().unwrap();
        let player = player_in(tmp.path(), recording_voice(Arc::default()));
        player.play(request("a")).await.unwrap();

        player.set_volume(GUILD, 30).await.unwrap();
        assert!(matches!(
            player.set_volume(GUILD, 101).await,
            Err(BotError::InvalidArgument(_))
        ));
        assert_eq!(player.volume(GUILD).await, 30);
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let player = player_in(tmp.path(), recording_voice(Arc::default()));
        assert!(matches!(player.pause(GUILD).await, Err(BotError::NothingPlaying)));

        player.play(request("a")).await.unwrap();
        player.pause(GUILD).await.unwrap();
        assert!(player.is_paused(GUILD).await);
        assert!(matches!(player.pause(GUILD).await, Err(BotError::AlreadyPaused)));
        player.resume(GUILD).await.unwrap();
        assert!(matches!(player.resume(GUILD).await, Err(BotError::NotPaused)));
    }

    #[tokio::test]
    async fn join_failure_surfaces_voice_error_and_resets() {
        let tmp = tempfile::tempdir().unwrap();
        let mut voice = MockVoiceOutput::new();
        voice.expect_current_channel().returning(|_| None);
        voice
            .expect_join()
            .returning(|_, _| Err(VoiceError::Join("timed out".to_string())));
        voice.expect_start().never();
        let player = player_in(tmp.path(), voice);

        let err = player.play(request("a")).await.unwrap_err();

        assert!(matches!(err, BotError::VoiceConnection(_)));
        assert!(matches!(player.queue(GUILD).await, Err(BotError::NothingPlaying)));
    }

    #[tokio::test]
    async fn unplayable_track_is_dropped_for_the_next() {
        let tmp = tempfile::tempdir().unwrap();
        let mut voice = MockVoiceOutput::new();
        voice.expect_current_channel().returning(|_| Some(VOICE));
        voice.expect_stop().returning(|_| ());
        voice.expect_leave().returning(|_| Ok(()));
        voice
            .expect_start()
            .returning(|_, track: &Track, _, _| match track.title.as_str() {
                "B" => Err(VoiceError::MissingFile(PathBuf::from("b.webm"))),
                _ => Ok(()),
            });
        let player = player_in(tmp.path(), voice);
        for query in ["a", "b", "c"] {
            player.play(request(query)).await.unwrap();
        }

        let report = player.skip(GUILD, 1).await.unwrap();

        assert_eq!(report.now_playing.map(|t| t.title), Some("C".to_string()));
        assert_eq!(titles(&player).await, vec!["C"]);
    }

    #[tokio::test]
    async fn disconnect_resets_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let player = player_in(tmp.path(), recording_voice(Arc::default()));
        player.play(request("a")).await.unwrap();

        let notice = player
            .handle_event(PlaybackEvent::Disconnected {
                guild_id: GUILD,
                reason: "Io".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(notice.channel_id, TEXT);
        assert!(matches!(player.now_playing(GUILD).await, Err(BotError::NothingPlaying)));
    }

    #[tokio::test]
    async fn cleanup_keeps_queued_files() {
        let tmp = tempfile::tempdir().unwrap();
        let player = player_in(tmp.path(), recording_voice(Arc::default()));
        player.play(request("a")).await.unwrap();
        let stale = tmp.path().join("10").join("old.webm");
        std::fs::write(&stale, b"x").unwrap();

        assert_eq!(player.cleanup(GUILD).await.unwrap(), 1);
        assert!(!stale.exists());
        assert!(tmp.path().join("10").join("a.webm").exists());
    }

    #[tokio::test]
    async fn replaced_guild_state_is_not_current() {
        let store = GuildStore::new();
        let first = store.get_or_create(GUILD);
        assert!(store.is_current(GUILD, &first));

        store.remove(GUILD);
        let second = store.get_or_create(GUILD);

        assert!(!store.is_current(GUILD, &first));
        assert!(store.is_current(GUILD, &second));
    }

    #[tokio::test]
    async fn volume_of_an_untouched_guild_leaves_no_state_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let player = player_in(tmp.path(), recording_voice(Arc::default()));

        assert_eq!(player.volume(GUILD).await, DEFAULT_VOLUME);
        assert!(matches!(
            player.set_volume(GUILD, 40).await,
            Err(BotError::NothingPlaying)
        ));
        assert_eq!(player.cleanup(GUILD).await.unwrap(), 0);

        assert!(!player.guilds.contains(GUILD));
    }

    #[tokio::test]
    async fn cleanup_after_the_queue_ran_out_drops_the_idle_state() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let player = player_in(tmp.path(), recording_voice(started.clone()));
        player.play(request("a")).await.unwrap();
        player
            .handle_event(PlaybackEvent::Finished {
                guild_id: GUILD,
                token: token_of(&started, "A"),
                error: None,
            })
            .await;

        player.cleanup(GUILD).await.unwrap();
        assert!(!player.guilds.contains(GUILD));
        assert!(!tmp.path().join("10").join("a.webm").exists());
    }

    #[tokio::test]
    async fn download_finishing_after_the_bot_left_starts_a_fresh_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let downloader = Arc::new(GatedDownloader::default());
        let player = Arc::new(
            MusicPlayer::new(
                Arc::new(recording_voice(started.clone())),
                downloader.clone(),
                DownloadStore::new(tmp.path()).with_retry_delay(Duration::from_millis(1)),
            )
            .with_sweep_delay(Duration::from_millis(10)),
        );
        player.play(request("a")).await.unwrap();

        let pending = tokio::spawn({
            let player = player.clone();
            async move { player.play(request("slowb")).await }
        });
        downloader.entered.notified().await;

        // A ends, the bot leaves, and the leftover sweep runs while the
        // download is still in its staging directory.
        player
            .handle_event(PlaybackEvent::Finished {
                guild_id: GUILD,
                token: token_of(&started, "A"),
                error: None,
            })
            .await;
        player.forget(GUILD).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        downloader.release.notify_one();

        let outcome = pending.await.unwrap().unwrap();

        assert!(matches!(outcome, PlayOutcome::Started(ref t) if t.title == "SLOWB"));
        assert_eq!(titles(&player).await, vec!["SLOWB"]);
        assert!(tmp.path().join("10").join("slowb.webm").exists());
        let started: Vec<String> = started.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(started, vec!["A", "SLOWB"]);
    }

    #[tokio::test]
    async fn sweep_after_leaving_spares_tracks_queued_since() {
        let tmp = tempfile::tempdir().unwrap();
        let player = player_in(tmp.path(), recording_voice(Arc::default()))
            .with_sweep_delay(Duration::from_millis(20));
        player.play(request("a")).await.unwrap();

        player.forget(GUILD).await;
        player.play(request("b")).await.unwrap();
        player.play(request("c")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let dir = tmp.path().join("10");
        assert!(!dir.join("a.webm").exists());
        assert!(dir.join("b.webm").exists());
        assert!(dir.join("c.webm").exists());
        assert_eq!(titles(&player).await, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn sweep_after_leaving_removes_everything_unused() {
        let tmp = tempfile::tempdir().unwrap();
        let player = player_in(tmp.path(), recording_voice(Arc::default()))
            .with_sweep_delay(Duration::from_millis(10));
        player.play(request("a")).await.unwrap();
        player.play(request("b")).await.unwrap();

        player.forget(GUILD).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let dir = tmp.path().join("10");
        assert!(!dir.join("a.webm").exists());
        assert!(!dir.join("b.webm").exists());
        assert!(!player.guilds.contains(GUILD));
    }
}
