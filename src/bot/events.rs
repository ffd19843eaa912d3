use serenity::{async_trait, http::Http, model::id::GuildId};
use songbird::{
    tracks::PlayMode, Event as VoiceEvent, EventContext, EventHandler as VoiceEventHandler,
};
use std::{future::Future, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::player::{MusicPlayer, Notice, PlaybackEvent};

/// Reports the end of a track, normal or errored, tagged with the token it
/// was started under.
pub struct TrackFinishedNotifier {
    pub guild_id: GuildId,
    pub token: u64,
    pub events: flume::Sender<PlaybackEvent>,
}

#[async_trait]
impl VoiceEventHandler for TrackFinishedNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        let mut error = None;
        if let EventContext::Track(track_list) = ctx {
            for (state, _handle) in *track_list {
                if let PlayMode::Errored(e) = &state.playing {
                    error = Some(format!("{:?}", e));
                }
            }
        }

        let event = PlaybackEvent::Finished {
            guild_id: self.guild_id,
            token: self.token,
            error,
        };
        if self.events.send(event).is_err() {
            warn!("Playback supervisor is gone, dropping finish event");
        }

        None
    }
}

/// Reports voice connections that dropped on their own.
pub struct DriverDisconnectNotifier {
    pub guild_id: GuildId,
    pub events: flume::Sender<PlaybackEvent>,
}

#[async_trait]
impl VoiceEventHandler for DriverDisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        if let EventContext::DriverDisconnect(data) = ctx {
            // No reason means we asked to leave.
            let reason = data.reason.as_ref()?;
            let event = PlaybackEvent::Disconnected {
                guild_id: self.guild_id,
                reason: format!("{:?}", reason),
            };
            if self.events.send(event).is_err() {
                warn!("Playback supervisor is gone, dropping disconnect event");
            }
        }

        None
    }
}

/// Drains playback events and hands each to its own task, so a guild whose
/// lock is held up by a slow voice join does not stall the others. Events of
/// one guild still serialize on that guild's lock.
pub fn spawn_playback_supervisor<F, Fut>(
    player: Arc<MusicPlayer>,
    events: flume::Receiver<PlaybackEvent>,
    post: F,
) -> JoinHandle<()>
where
    F: Fn(Notice) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let post = Arc::new(post);
    tokio::spawn(async move {
        info!("🎛️ Playback supervisor started");

        while let Ok(event) = events.recv_async().await {
            debug!("Playback event: {:?}", event);

            let player = player.clone();
            let post = post.clone();
            tokio::spawn(async move {
                if let Some(notice) = player.handle_event(event).await {
                    post(notice).await;
                }
            });
        }

        info!("Playback supervisor stopped");
    })
}

/// Posts a player notice in its text channel.
pub async fn send_notice(http: &Http, notice: Notice) {
    if let Err(e) = notice.channel_id.say(http, &notice.content).await {
        error!("Error sending notice to {}: {:?}", notice.channel_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::player::test_support::{fake_downloader, recording_voice, request_in},
        storage::DownloadStore,
    };
    use pretty_assertions::assert_eq;
    use serenity::model::id::ChannelId;
    use std::{sync::Mutex as StdMutex, time::Duration};

    const BUSY: GuildId = GuildId::new(1);
    const FREE: GuildId = GuildId::new(2);

    #[tokio::test]
    async fn a_held_guild_does_not_stall_other_guilds() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let player = Arc::new(MusicPlayer::new(
            Arc::new(recording_voice(started.clone())),
            Arc::new(fake_downloader()),
            DownloadStore::new(tmp.path()),
        ));
        player.play(request_in(BUSY, "x")).await.unwrap();
        player.play(request_in(FREE, "a")).await.unwrap();
        player.play(request_in(FREE, "b")).await.unwrap();
        let busy_token = started.lock().unwrap()[0].1;
        let free_token = started.lock().unwrap()[1].1;

        let (events_tx, events_rx) = flume::unbounded();
        let (notices_tx, notices_rx) = flume::unbounded();
        spawn_playback_supervisor(player.clone(), events_rx, move |notice| {
            let notices = notices_tx.clone();
            async move {
                notices.send(notice).unwrap();
            }
        });

        let busy = player.guild_state(BUSY);
        let held = busy.lock().await;
        for (guild_id, token) in [(BUSY, busy_token), (FREE, free_token)] {
            events_tx
                .send(PlaybackEvent::Finished {
                    guild_id,
                    token,
                    error: None,
                })
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while started.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(started.lock().unwrap()[2].0, "B");
        drop(held);

        events_tx
            .send(PlaybackEvent::Disconnected {
                guild_id: FREE,
                reason: "Io".to_string(),
            })
            .unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(5), notices_rx.recv_async())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(notice.channel_id, ChannelId::new(30));
    }
}
