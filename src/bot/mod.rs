//! # Bot Module
//!
//! Discord gateway side of the bot: prefix command parsing, one handler per
//! command, and the songbird event handlers that feed playback events back
//! into the player.
//!
//! ## Flow
//!
//! 1. [`MusicBot::message`] hands every guild message to
//!    [`handlers::handle_message`], which parses it with [`commands::parse`].
//! 2. Handlers run the voice checks and call into
//!    [`MusicPlayer`](crate::audio::player::MusicPlayer).
//! 3. Track ends and voice disconnects arrive through [`events`] and are
//!    applied by the playback supervisor, one task per event.

use serenity::{
    async_trait,
    gateway::ActivityData,
    model::{channel::Message, gateway::Ready, voice::VoiceState},
    prelude::{Context, EventHandler},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info};

pub mod commands;
pub mod events;
pub mod handlers;

use crate::{audio::player::MusicPlayer, config::Config};

/// Gateway event handler.
pub struct MusicBot {
    pub(crate) config: Arc<Config>,
    pub(crate) player: Arc<MusicPlayer>,
    /// Leftover downloads are purged on the first `ready` only; later ones
    /// are reconnects with downloads possibly in flight.
    purged: AtomicBool,
}

impl MusicBot {
    pub fn new(config: Arc<Config>, player: Arc<MusicPlayer>) -> Self {
        Self {
            config,
            player,
            purged: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} guilds", ready.guilds.len());

        if !self.purged.swap(true, Ordering::SeqCst) {
            match self.player.store().purge_all().await {
                Ok(purged) => info!(
                    "🧹 Removed {} leftover download directories from {}",
                    purged,
                    self.player.store().root().display()
                ),
                Err(e) => error!("Error cleaning up download directory: {:?}", e),
            }
        }

        ctx.set_activity(Some(ActivityData::playing(format!(
            "Music 🎵 | {}help",
            self.config.prefix
        ))));
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot || msg.guild_id.is_none() {
            return;
        }

        handlers::handle_message(&ctx, &msg, self).await;
    }

    /// Forgets a guild's playback state once the bot is no longer in any of
    /// its voice channels, whether it left or was kicked.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        if new.user_id != ctx.cache.current_user().id || new.channel_id.is_some() {
            return;
        }

        let Some(guild_id) = new.guild_id.or_else(|| old.and_then(|o| o.guild_id)) else {
            return;
        };

        info!("🔌 Bot left voice in guild {}", guild_id);
        self.player.forget(guild_id).await;
    }
}
