use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod error;
mod sources;
mod storage;
mod ui;

use crate::audio::{player::MusicPlayer, voice::SongbirdOutput};
use crate::bot::{
    events::{send_notice, spawn_playback_supervisor},
    MusicBot,
};
use crate::config::Config;
use crate::sources::YtDlpDownloader;
use crate::storage::DownloadStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("music_bot=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting music-bot v{}", env!("CARGO_PKG_VERSION"));

    if std::env::args().any(|arg| arg == "--health-check") {
        dotenvy::dotenv().ok();
        let ytdl = std::env::var("YTDL_BINARY").unwrap_or_else(|_| "yt-dlp".to_string());
        return health_check(&ytdl).await;
    }

    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let (events_tx, events_rx) = flume::unbounded();
    let songbird = Songbird::serenity();

    let player = Arc::new(MusicPlayer::new(
        Arc::new(SongbirdOutput::new(songbird.clone(), events_tx)),
        Arc::new(YtDlpDownloader::new(
            config.ytdl_binary.clone(),
            config.ytdl_format.clone(),
        )),
        DownloadStore::new(config.download_dir.clone()),
    ));

    let handler = MusicBot::new(config.clone(), player.clone());

    let mut client = Client::builder(&config.bot_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    let http = client.http.clone();
    spawn_playback_supervisor(player, events_rx, move |notice| {
        let http = http.clone();
        async move { send_notice(&http, notice).await }
    });

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("⚠️ Shutdown signal received, closing...");
                shard_manager.shutdown_all().await;
            }
            Err(e) => error!("Error listening for Ctrl+C: {:?}", e),
        }
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

/// Verifies the external tools the bot shells out to are runnable.
async fn health_check(ytdl: &str) -> Result<()> {
    let yt_dlp = async_process::Command::new(ytdl)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing dependencies: {} and ffmpeg must be runnable", ytdl);
    }
}
