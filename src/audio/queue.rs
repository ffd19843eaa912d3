use serenity::model::id::{ChannelId, UserId};
use std::{
    collections::{HashSet, VecDeque},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

/// Volume of a guild that never changed it, in percent.
pub const DEFAULT_VOLUME: u8 = 100;

/// A downloaded track waiting in, or playing from, a guild queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub title: String,
    /// What the user typed after `play`.
    pub query: String,
    pub url: String,
    pub path: PathBuf,
    pub duration: Option<Duration>,
    pub uploader: Option<String>,
    pub thumbnail: Option<String>,
    pub requested_by: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// No voice connection.
    Disconnected,
    /// Joining the voice channel.
    Connecting,
    /// Connected, nothing playing.
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("nothing is playing")]
    NothingPlaying,
    #[error("playback is already paused")]
    AlreadyPaused,
    #[error("playback is not paused")]
    NotPaused,
    #[error("volume must be between 0 and 100, got {0}")]
    VolumeOutOfRange(u16),
    #[error("skip count must be at least 1")]
    ZeroSkip,
}

/// A track that just became current, together with its playback token.
#[derive(Debug, Clone, PartialEq)]
pub struct Started {
    pub token: u64,
    pub track: Track,
}

/// Outcome of a "track finished" event.
#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    /// The event belongs to a track that is no longer current.
    Stale,
    /// The next track became current.
    Next {
        started: Started,
        discarded: Vec<PathBuf>,
    },
    /// Nothing left to play.
    Idle { discarded: Vec<PathBuf> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skip {
    pub skipped: usize,
    /// The new head, if any track survived the skip.
    pub started: Option<Started>,
    /// Files no remaining track refers to.
    pub discarded: Vec<PathBuf>,
}

/// Queue and playback state of a single guild.
///
/// Every method is synchronous and side-effect free apart from the state
/// itself: callers turn the returned values into voice and filesystem
/// actions.
#[derive(Debug)]
pub struct GuildMusicState {
    current: Option<Track>,
    pending: VecDeque<Track>,
    looping: bool,
    volume: u8,
    status: PlaybackStatus,
    token: u64,
    voice_channel: Option<ChannelId>,
    text_channel: Option<ChannelId>,
}

impl Default for GuildMusicState {
    fn default() -> Self {
        Self::new()
    }
}

impl GuildMusicState {
    pub fn new() -> Self {
        Self {
            current: None,
            pending: VecDeque::new(),
            looping: false,
            volume: DEFAULT_VOLUME,
            status: PlaybackStatus::Disconnected,
            token: 0,
            voice_channel: None,
            text_channel: None,
        }
    }

    /// Appends a track to the tail and returns how many tracks are ahead of it.
    pub fn enqueue(&mut self, track: Track) -> usize {
        let ahead = self.pending.len() + usize::from(self.current.is_some());
        info!("➕ Queued: {} ({} ahead)", track.title, ahead);
        self.pending.push_back(track);
        ahead
    }

    /// Promotes the pending head to current if nothing is playing.
    pub fn start_next(&mut self) -> Option<Started> {
        if self.current.is_some() {
            return None;
        }

        let track = self.pending.pop_front()?;
        self.token += 1;
        self.current = Some(track.clone());
        self.status = PlaybackStatus::Playing;
        debug!("▶️ Token {} now playing: {}", self.token, track.title);

        Some(Started {
            token: self.token,
            track,
        })
    }

    /// Handles the end of the track identified by `token`.
    ///
    /// Only the first event for the current token has an effect; duplicates
    /// (end and error for one track, or events of a skipped track) are
    /// `Finish::Stale`.
    pub fn finish(&mut self, token: u64) -> Finish {
        if self.current.is_none() || token != self.token {
            debug!("Ignoring stale finish event (token {}, current {})", token, self.token);
            return Finish::Stale;
        }

        let mut discarded = Vec::new();
        if let Some(finished) = self.current.take() {
            if self.looping {
                info!("🔁 Re-queued by loop: {}", finished.title);
                self.pending.push_back(finished);
            } else if !self.references(&finished.path) {
                discarded.push(finished.path);
            }
        }

        match self.start_next() {
            Some(started) => Finish::Next { started, discarded },
            None => {
                self.status = PlaybackStatus::Idle;
                Finish::Idle { discarded }
            }
        }
    }

    /// Drops the current track without re-queueing it, even with loop on.
    /// Used when a track cannot be played at all.
    pub fn abandon(&mut self, token: u64) -> Vec<PathBuf> {
        if token != self.token {
            return Vec::new();
        }

        match self.current.take() {
            Some(track) => self.unreferenced(std::iter::once(track.path)),
            None => Vec::new(),
        }
    }

    /// Removes up to `count` tracks from the head, the current track first,
    /// and starts whatever is left at the head.
    ///
    /// Skipped tracks are never re-queued, even with loop enabled.
    pub fn skip(&mut self, count: usize) -> Result<Skip, QueueError> {
        if count == 0 {
            return Err(QueueError::ZeroSkip);
        }

        if self.current.is_none() && self.pending.is_empty() {
            return Err(QueueError::NothingPlaying);
        }

        let mut removed = Vec::new();
        if let Some(current) = self.current.take() {
            removed.push(current);
        }
        while removed.len() < count {
            match self.pending.pop_front() {
                Some(track) => removed.push(track),
                None => break,
            }
        }

        let skipped = removed.len();
        let discarded = self.unreferenced(removed.into_iter().map(|track| track.path));

        let started = self.start_next();
        if started.is_none() {
            self.status = PlaybackStatus::Idle;
        }

        info!("⏭️ Skipped {} track(s)", skipped);
        Ok(Skip {
            skipped,
            started,
            discarded,
        })
    }

    pub fn peek_current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn toggle_loop(&mut self) -> bool {
        self.looping = !self.looping;
        info!("🔁 Loop {}", if self.looping { "enabled" } else { "disabled" });
        self.looping
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Sets the guild volume in percent; values above 100 are rejected
    /// without touching the current volume.
    pub fn set_volume(&mut self, volume: u16) -> Result<(), QueueError> {
        let volume = u8::try_from(volume)
            .ok()
            .filter(|v| *v <= 100)
            .ok_or(QueueError::VolumeOutOfRange(volume))?;
        self.volume = volume;
        Ok(())
    }

    /// Volume as the gain songbird expects.
    pub fn gain(&self) -> f32 {
        f32::from(self.volume) / 100.0
    }

    pub fn pause(&mut self) -> Result<(), QueueError> {
        match self.status {
            PlaybackStatus::Playing => {
                self.status = PlaybackStatus::Paused;
                Ok(())
            }
            PlaybackStatus::Paused => Err(QueueError::AlreadyPaused),
            _ => Err(QueueError::NothingPlaying),
        }
    }

    pub fn resume(&mut self) -> Result<(), QueueError> {
        match self.status {
            PlaybackStatus::Paused => {
                self.status = PlaybackStatus::Playing;
                Ok(())
            }
            PlaybackStatus::Playing => Err(QueueError::NotPaused),
            _ => Err(QueueError::NothingPlaying),
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn set_status(&mut self, status: PlaybackStatus) {
        self.status = status;
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Drops every track and forgets the voice connection.
    ///
    /// Returns the paths of the dropped tracks (deduplicated).
    pub fn reset(&mut self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let mut seen = HashSet::new();
        for track in self.current.take().into_iter().chain(self.pending.drain(..)) {
            if seen.insert(track.path.clone()) {
                paths.push(track.path);
            }
        }

        self.token += 1;
        self.status = PlaybackStatus::Disconnected;
        self.voice_channel = None;
        paths
    }

    /// Files that must survive a cleanup.
    pub fn referenced_paths(&self) -> HashSet<PathBuf> {
        self.tracks().map(|track| track.path.clone()).collect()
    }

    /// The current track followed by the pending ones.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.current.iter().chain(self.pending.iter())
    }

    #[cfg(test)]
    pub fn pending(&self) -> impl Iterator<Item = &Track> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total known duration of the current and pending tracks.
    pub fn total_duration(&self) -> Duration {
        self.tracks().filter_map(|track| track.duration).sum()
    }

    #[cfg(test)]
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn voice_channel(&self) -> Option<ChannelId> {
        self.voice_channel
    }

    pub fn set_voice_channel(&mut self, channel: ChannelId) {
        self.voice_channel = Some(channel);
    }

    pub fn text_channel(&self) -> Option<ChannelId> {
        self.text_channel
    }

    pub fn set_text_channel(&mut self, channel: ChannelId) {
        self.text_channel = Some(channel);
    }

    fn references(&self, path: &Path) -> bool {
        self.tracks().any(|track| track.path.as_path() == path)
    }

    fn unreferenced(&self, paths: impl Iterator<Item = PathBuf>) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        for path in paths {
            if !self.references(&path) && !out.contains(&path) {
                out.push(path);
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) fn test_track(name: &str) -> Track {
    Track {
        title: name.to_string(),
        query: name.to_lowercase(),
        url: format!("https://www.youtube.com/watch?v={}", name),
        path: PathBuf::from(format!("dl/1/{}.webm", name)),
        duration: Some(Duration::from_secs(60)),
        uploader: None,
        thumbnail: None,
        requested_by: UserId::new(7),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn titles(state: &GuildMusicState) -> Vec<String> {
        state.tracks().map(|t| t.title.clone()).collect()
    }

    fn playing(names: &[&str]) -> GuildMusicState {
        let mut state = GuildMusicState::new();
        for name in names {
            state.enqueue(test_track(name));
        }
        state.start_next();
        state
    }

    #[test]
    fn enqueue_preserves_insertion_order() {
        let mut state = GuildMusicState::new();
        let names = ["A", "B", "C", "D", "E"];
        for (i, name) in names.iter().enumerate() {
            assert_eq!(state.enqueue(test_track(name)), i);
        }
        assert_eq!(titles(&state), names.to_vec());

        state.start_next();
        assert_eq!(titles(&state), names.to_vec());
        assert_eq!(state.peek_current().map(|t| t.title.as_str()), Some("A"));
    }

    #[test]
    fn start_next_does_nothing_while_a_track_is_current() {
        let mut state = playing(&["A", "B"]);
        assert_eq!(state.start_next(), None);
        assert_eq!(state.peek_current().unwrap().title, "A");
    }

    #[test]
    fn skip_two_of_three_makes_the_last_current() {
        let mut state = playing(&["A", "B", "C"]);

        let skip = state.skip(2).unwrap();

        assert_eq!(skip.skipped, 2);
        assert_eq!(skip.started.unwrap().track.title, "C");
        assert_eq!(state.peek_current().unwrap().title, "C");
        assert_eq!(state.pending().count(), 0);
        assert_eq!(state.status(), PlaybackStatus::Playing);
    }

    #[test]
    fn skip_beyond_length_empties_and_goes_idle() {
        let mut state = playing(&["A", "B"]);

        let skip = state.skip(10).unwrap();

        assert_eq!(skip.skipped, 2);
        assert_eq!(skip.started, None);
        assert!(state.is_empty());
        assert_eq!(state.status(), PlaybackStatus::Idle);
        assert_eq!(
            skip.discarded,
            vec![PathBuf::from("dl/1/A.webm"), PathBuf::from("dl/1/B.webm")]
        );
    }

    #[test]
    fn skip_on_empty_queue_is_reported() {
        let mut state = GuildMusicState::new();
        assert_eq!(state.skip(1), Err(QueueError::NothingPlaying));
        assert_eq!(playing(&["A"]).skip(0), Err(QueueError::ZeroSkip));
    }

    #[test]
    fn skip_keeps_files_still_referenced() {
        let mut state = playing(&["A", "B", "A"]);

        let skip = state.skip(1).unwrap();

        assert!(skip.discarded.is_empty());
        assert_eq!(titles(&state), vec!["B", "A"]);
    }

    #[test]
    fn skip_with_loop_does_not_requeue() {
        let mut state = playing(&["A", "B"]);
        state.toggle_loop();

        state.skip(1).unwrap();

        assert_eq!(titles(&state), vec!["B"]);
    }

    #[test]
    fn loop_requeues_a_single_track_once() {
        let mut state = playing(&["A"]);
        assert!(state.toggle_loop());
        let token = state.token();

        match state.finish(token) {
            Finish::Next { started, discarded } => {
                assert_eq!(started.track.title, "A");
                assert!(discarded.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(titles(&state), vec!["A"]);
    }

    #[test]
    fn loop_appends_finished_track_to_tail() {
        let mut state = playing(&["A", "B", "C"]);
        state.toggle_loop();

        state.finish(state.token());

        assert_eq!(titles(&state), vec!["B", "C", "A"]);
    }

    #[test]
    fn finish_without_loop_discards() {
        let mut state = playing(&["A", "B"]);

        match state.finish(state.token()) {
            Finish::Next { started, discarded } => {
                assert_eq!(started.track.title, "B");
                assert_eq!(discarded, vec![PathBuf::from("dl/1/A.webm")]);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            state.finish(state.token()),
            Finish::Idle {
                discarded: vec![PathBuf::from("dl/1/B.webm")]
            }
        );
        assert_eq!(state.status(), PlaybackStatus::Idle);
        assert!(state.is_empty());
    }

    #[test]
    fn finish_is_effective_once_per_token() {
        let mut state = playing(&["A", "B"]);
        let token = state.token();

        assert!(matches!(state.finish(token), Finish::Next { .. }));
        assert_eq!(state.finish(token), Finish::Stale);
        assert_eq!(state.peek_current().unwrap().title, "B");
    }

    #[test]
    fn finish_of_skipped_track_is_stale() {
        let mut state = playing(&["A", "B", "C"]);
        let skipped_token = state.token();

        state.skip(1).unwrap();

        assert_eq!(state.finish(skipped_token), Finish::Stale);
        assert_eq!(titles(&state), vec!["B", "C"]);
    }

    #[test]
    fn abandoned_track_is_not_looped() {
        let mut state = playing(&["A", "B"]);
        state.toggle_loop();

        let discarded = state.abandon(state.token());

        assert_eq!(discarded, vec![PathBuf::from("dl/1/A.webm")]);
        assert_eq!(titles(&state), vec!["B"]);
        assert_eq!(state.start_next().unwrap().track.title, "B");
    }

    #[test]
    fn volume_out_of_range_is_rejected() {
        let mut state = GuildMusicState::new();
        state.set_volume(40).unwrap();

        assert_eq!(state.set_volume(101), Err(QueueError::VolumeOutOfRange(101)));
        assert_eq!(state.set_volume(1000), Err(QueueError::VolumeOutOfRange(1000)));
        assert_eq!(state.volume(), 40);

        state.set_volume(0).unwrap();
        assert_eq!(state.gain(), 0.0);
    }

    #[test]
    fn pause_and_resume_transitions() {
        let mut state = GuildMusicState::new();
        assert_eq!(state.pause(), Err(QueueError::NothingPlaying));

        let mut state = playing(&["A"]);
        assert_eq!(state.resume(), Err(QueueError::NotPaused));
        state.pause().unwrap();
        assert_eq!(state.pause(), Err(QueueError::AlreadyPaused));
        assert_eq!(state.status(), PlaybackStatus::Paused);
        state.resume().unwrap();
        assert_eq!(state.status(), PlaybackStatus::Playing);
    }

    #[test]
    fn reset_reports_each_path_once_and_invalidates_token() {
        let mut state = playing(&["A", "B", "A"]);
        let token = state.token();

        let paths = state.reset();

        assert_eq!(
            paths,
            vec![PathBuf::from("dl/1/A.webm"), PathBuf::from("dl/1/B.webm")]
        );
        assert_eq!(state.finish(token), Finish::Stale);
        assert_eq!(state.status(), PlaybackStatus::Disconnected);
        assert!(state.is_empty());
    }

    #[test]
    fn referenced_paths_cover_current_and_pending() {
        let state = playing(&["A", "B"]);
        let paths = state.referenced_paths();
        assert!(paths.contains(&PathBuf::from("dl/1/A.webm")));
        assert!(paths.contains(&PathBuf::from("dl/1/B.webm")));
        assert_eq!(state.total_duration(), Duration::from_secs(120));
    }
}
