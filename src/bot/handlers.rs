use serenity::{
    builder::{CreateEmbed, CreateMessage, EditMessage},
    model::{
        channel::Message,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{error, info, warn};

use crate::{
    audio::player::{PlayOutcome, PlayRequest, SkipReport},
    bot::{
        commands::{self, Command, SkipCount},
        MusicBot,
    },
    error::BotError,
    ui::embeds,
};

/// Entry point for every guild message that might be a command.
pub async fn handle_message(ctx: &Context, msg: &Message, bot: &MusicBot) {
    let Some(parsed) = commands::parse(&bot.config.prefix, &msg.content) else {
        return;
    };
    let Some(guild_id) = msg.guild_id else {
        return;
    };

    let result = match parsed {
        Ok(command) => {
            info!(
                "📝 {} used {} in guild {}",
                msg.author.name,
                command.name(),
                guild_id
            );
            run_command(ctx, msg, bot, guild_id, command).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        report_error(bot, &e);
        if let Some(text) = user_message(bot, &e) {
            if let Err(why) = msg.channel_id.say(&ctx.http, text).await {
                error!("Error sending error reply: {:?}", why);
            }
        }
    }
}

async fn run_command(
    ctx: &Context,
    msg: &Message,
    bot: &MusicBot,
    guild_id: GuildId,
    command: Command,
) -> Result<(), BotError> {
    let voice_channel = if command.needs_voice() {
        Some(sense_checks(ctx, bot, guild_id, msg.author.id).await?)
    } else {
        None
    };

    match command {
        Command::Play(query) => match voice_channel {
            Some(channel) => handle_play(ctx, msg, bot, guild_id, channel, query).await,
            None => Err(BotError::NotInVoice),
        },
        Command::Queue => handle_queue(ctx, msg, bot, guild_id).await,
        Command::Skip(count) => handle_skip(ctx, msg, bot, guild_id, count).await,
        Command::NowPlaying => handle_nowplaying(ctx, msg, bot, guild_id).await,
        Command::Pause => {
            bot.player.pause(guild_id).await?;
            say(ctx, msg.channel_id, "Playback paused.").await
        }
        Command::Resume => {
            bot.player.resume(guild_id).await?;
            say(ctx, msg.channel_id, "Playback resumed.").await
        }
        Command::Volume(level) => handle_volume(ctx, msg, bot, guild_id, level).await,
        Command::Loop => {
            let looping = bot.player.toggle_loop(guild_id).await?;
            send_embed(ctx, msg.channel_id, embeds::create_loop_embed(bot.config.color, looping))
                .await
        }
        Command::Cleanup => handle_cleanup(ctx, msg, bot, guild_id).await,
        Command::Help => {
            let embed = embeds::create_help_embed(bot.config.color, &bot.config.prefix);
            send_embed(ctx, msg.channel_id, embed).await
        }
        Command::Ayuda => {
            let embed = embeds::create_ayuda_embed(bot.config.color, &bot.config.prefix);
            send_embed(ctx, msg.channel_id, embed).await
        }
    }
}

async fn handle_play(
    ctx: &Context,
    msg: &Message,
    bot: &MusicBot,
    guild_id: GuildId,
    voice_channel: ChannelId,
    query: String,
) -> Result<(), BotError> {
    if query.is_empty() {
        if bot.player.is_paused(guild_id).await {
            bot.player.resume(guild_id).await?;
            return say(ctx, msg.channel_id, "Playback resumed.").await;
        }
        return Err(BotError::InvalidArgument(
            "Please provide a song name or URL.".to_string(),
        ));
    }

    let mut status = msg
        .channel_id
        .say(&ctx.http, format!("Looking for `{}`...", query))
        .await?;

    let request = PlayRequest {
        guild_id,
        voice_channel,
        text_channel: msg.channel_id,
        query,
        requested_by: msg.author.id,
    };

    let content = match bot.player.play(request).await {
        Ok(PlayOutcome::Started(track)) => format!("Now playing: `{}`", track.title),
        Ok(PlayOutcome::Queued { track, position }) => {
            format!("Added to queue: `{}` (position {})", track.title, position)
        }
        Err(e) => {
            report_error(bot, &e);
            match user_message(bot, &e) {
                Some(text) => text,
                None => return Ok(()),
            }
        }
    };

    status
        .edit(ctx, EditMessage::new().content(content))
        .await?;
    Ok(())
}

async fn handle_queue(
    ctx: &Context,
    msg: &Message,
    bot: &MusicBot,
    guild_id: GuildId,
) -> Result<(), BotError> {
    let snapshot = bot.player.queue(guild_id).await?;
    send_embed(
        ctx,
        msg.channel_id,
        embeds::create_queue_embed(bot.config.color, &snapshot),
    )
    .await
}

async fn handle_skip(
    ctx: &Context,
    msg: &Message,
    bot: &MusicBot,
    guild_id: GuildId,
    count: SkipCount,
) -> Result<(), BotError> {
    let count = match count {
        SkipCount::Some(n) => n,
        SkipCount::All => usize::MAX,
    };

    let report = bot.player.skip(guild_id, count).await?;
    say(ctx, msg.channel_id, &skip_message(&report)).await
}

async fn handle_nowplaying(
    ctx: &Context,
    msg: &Message,
    bot: &MusicBot,
    guild_id: GuildId,
) -> Result<(), BotError> {
    let now = bot.player.now_playing(guild_id).await?;
    send_embed(
        ctx,
        msg.channel_id,
        embeds::create_now_playing_embed(bot.config.color, &now),
    )
    .await
}

async fn handle_volume(
    ctx: &Context,
    msg: &Message,
    bot: &MusicBot,
    guild_id: GuildId,
    level: Option<u16>,
) -> Result<(), BotError> {
    let text = match level {
        None => format!("Current volume: {}%", bot.player.volume(guild_id).await),
        Some(level) => {
            let volume = bot.player.set_volume(guild_id, level).await?;
            format!("Volume set to {}%", volume)
        }
    };
    say(ctx, msg.channel_id, &text).await
}

async fn handle_cleanup(
    ctx: &Context,
    msg: &Message,
    bot: &MusicBot,
    guild_id: GuildId,
) -> Result<(), BotError> {
    let is_admin = msg
        .author_permissions(&ctx.cache)
        .is_some_and(|permissions| permissions.administrator());
    if !is_admin {
        return Err(BotError::MissingPermissions);
    }

    let text = match bot.player.cleanup(guild_id).await? {
        0 => "No files to clean up.".to_string(),
        removed => format!("Cleaned up {} files.", removed),
    };
    say(ctx, msg.channel_id, &text).await
}

/// The author must be in a voice channel, and in the bot's one if the bot is
/// already connected. Returns the author's channel.
async fn sense_checks(
    ctx: &Context,
    bot: &MusicBot,
    guild_id: GuildId,
    user_id: UserId,
) -> Result<ChannelId, BotError> {
    let author_channel = author_voice_channel(ctx, guild_id, user_id).ok_or(BotError::NotInVoice)?;

    match bot.player.bot_channel(guild_id).await {
        Some(bot_channel) if bot_channel != author_channel => Err(BotError::WrongVoiceChannel),
        _ => Ok(author_channel),
    }
}

fn author_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

fn skip_message(report: &SkipReport) -> String {
    if report.skipped >= report.queued_before {
        "Skipping all remaining tracks.".to_string()
    } else if report.skipped == 1 {
        "Skipping track.".to_string()
    } else {
        format!(
            "Skipping {} of {} tracks.",
            report.skipped, report.queued_before
        )
    }
}

fn user_message(bot: &MusicBot, err: &BotError) -> Option<String> {
    err.user_message(
        &bot.config.prefix,
        bot.config.report_command_not_found,
        bot.config.report_dl_error,
    )
}

fn report_error(bot: &MusicBot, err: &BotError) {
    if !err.is_unexpected() {
        info!("Command rejected: {}", err);
    } else if bot.config.print_stack_trace {
        error!("Command failed: {:?}", err);
    } else {
        warn!("Command failed: {}", err);
    }
}

async fn say(ctx: &Context, channel_id: ChannelId, text: &str) -> Result<(), BotError> {
    channel_id.say(&ctx.http, text).await?;
    Ok(())
}

async fn send_embed(ctx: &Context, channel_id: ChannelId, embed: CreateEmbed) -> Result<(), BotError> {
    channel_id
        .send_message(&ctx.http, CreateMessage::new().embed(embed))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(skipped: usize, queued_before: usize) -> SkipReport {
        SkipReport {
            skipped,
            queued_before,
            now_playing: None,
        }
    }

    #[test]
    fn skip_messages() {
        assert_eq!(skip_message(&report(1, 3)), "Skipping track.");
        assert_eq!(skip_message(&report(2, 3)), "Skipping 2 of 3 tracks.");
        assert_eq!(skip_message(&report(3, 3)), "Skipping all remaining tracks.");
        assert_eq!(skip_message(&report(1, 1)), "Skipping all remaining tracks.");
    }
}
