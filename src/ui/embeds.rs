use serenity::{
    all::Colour,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::{
    player::{NowPlaying, QueueSnapshot},
    queue::Track,
};

/// Shown for tracks without a known duration.
const UNKNOWN: &str = "Unknown";

/// Queue listing: the current track marked with `▷`, pending ones numbered
/// from 1.
pub fn create_queue_embed(colour: u32, queue: &QueueSnapshot) -> CreateEmbed {
    let loop_status = if queue.looping { "Enabled" } else { "Disabled" };
    let total = if queue.total_duration.is_zero() {
        UNKNOWN.to_string()
    } else {
        format_duration(queue.total_duration)
    };

    CreateEmbed::new()
        .title("Music Queue")
        .colour(Colour::new(colour))
        .field("Now playing:", queue_listing(&queue.tracks), false)
        .field("Total duration:", total, true)
        .field("Tracks in queue:", queue.tracks.len().to_string(), true)
        .field("Loop:", loop_status, true)
}

/// Details of the current track.
pub fn create_now_playing_embed(colour: u32, now: &NowPlaying) -> CreateEmbed {
    let track = &now.track;
    let title = if now.paused {
        "Now Playing (paused)"
    } else {
        "Now Playing"
    };

    let mut embed = CreateEmbed::new()
        .title(title)
        .colour(Colour::new(colour))
        .url(&track.url)
        .field("Title", &track.title, false)
        .field("Uploader", track.uploader.as_deref().unwrap_or(UNKNOWN), true)
        .field("Duration", duration_or_unknown(track.duration), true)
        .field("Volume", format!("{}%", now.volume), true)
        .field("Requested by", format!("<@{}>", track.requested_by), true);

    if let Some(thumbnail) = &track.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }

    embed
}

pub fn create_loop_embed(colour: u32, looping: bool) -> CreateEmbed {
    CreateEmbed::new()
        .title("Loop Mode")
        .colour(Colour::new(colour))
        .description(format!(
            "Looping is now {}",
            if looping { "**ON**" } else { "**OFF**" }
        ))
}

pub fn create_help_embed(colour: u32, prefix: &str) -> CreateEmbed {
    let commands = [
        (format!("{p}play [query]", p = prefix), "Play a song from YouTube"),
        (format!("{p}queue", p = prefix), "Show the current music queue"),
        (format!("{p}skip [n|all]", p = prefix), "Skip a number of tracks"),
        (format!("{p}nowplaying", p = prefix), "Show information about the current track"),
        (format!("{p}pause", p = prefix), "Pause the current track"),
        (format!("{p}resume", p = prefix), "Resume playback"),
        (format!("{p}volume [0-100]", p = prefix), "Set the playback volume"),
        (format!("{p}loop", p = prefix), "Toggle queue looping"),
        (format!("{p}cleanup", p = prefix), "Clean up downloaded files (admin only)"),
    ];

    commands.into_iter().fold(
        CreateEmbed::new()
            .title("Music Bot Help")
            .description("Here are the available commands:")
            .colour(Colour::new(colour))
            .footer(CreateEmbedFooter::new(format!(
                "Type {}ayuda for help in Spanish",
                prefix
            ))),
        |embed, (name, value)| embed.field(name, value, false),
    )
}

/// Spanish help, listing every alias.
pub fn create_ayuda_embed(colour: u32, prefix: &str) -> CreateEmbed {
    let aliases = |names: &[&str]| {
        names
            .iter()
            .map(|name| format!("{}{}", prefix, name))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let commands = [
        (
            aliases(&["play", "p"]),
            format!(
                "Reproduce una canción de YouTube. Acepta una búsqueda o una URL, por ejemplo `{p}play aire jose merce` o `{p}play https://www.youtube.com/watch?v=xzxyefhCQXg`",
                p = prefix
            ),
        ),
        (
            aliases(&["queue", "lista", "q"]),
            "Muestra la cola de reproducción actual".to_string(),
        ),
        (
            format!("{} [n|all]", aliases(&["skip", "s", "siguiente", "pasar", "next"])),
            format!(
                "Salta una o más canciones. Si la lista tiene 10 canciones y quieres pasar a la cuarta, usa `{}siguiente 3`",
                prefix
            ),
        ),
        (
            aliases(&["nowplaying", "np", "sonando"]),
            "Muestra información sobre la canción actual".to_string(),
        ),
        (
            aliases(&["pause", "pa", "parar", "pausa"]),
            "Pausa la canción actual".to_string(),
        ),
        (
            aliases(&["resume", "r", "continuar", "unpausar"]),
            "Reanuda la reproducción".to_string(),
        ),
        (
            format!("{} [0-100]", aliases(&["volume", "v"])),
            "Ajusta el volumen de reproducción".to_string(),
        ),
        (
            aliases(&["loop", "l"]),
            "Activa o desactiva la reproducción en bucle".to_string(),
        ),
        (
            aliases(&["cleanup", "clean"]),
            "Limpia los archivos descargados (solo administradores)".to_string(),
        ),
    ];

    commands.into_iter().fold(
        CreateEmbed::new()
            .title("Ayuda del Bot de Música")
            .description("Aquí están los comandos disponibles:")
            .colour(Colour::new(colour)),
        |embed, (name, value)| embed.field(name, value, false),
    )
}

fn queue_listing(tracks: &[Track]) -> String {
    let mut listing = String::new();
    for (i, track) in tracks.iter().enumerate() {
        let duration = duration_or_unknown(track.duration);
        if i == 0 {
            listing.push_str(&format!("▷ {} [{}]\n\n", track.title, duration));
        } else {
            listing.push_str(&format!("**{}:** {} [{}]\n", i, track.title, duration));
        }
    }

    truncate_field(listing)
}

/// Embed field values are capped at 1024 characters by Discord.
fn truncate_field(mut value: String) -> String {
    const LIMIT: usize = 1024;
    const ELLIPSIS: &str = "\n…";

    if value.chars().count() <= LIMIT {
        return value;
    }

    let cut = value
        .char_indices()
        .nth(LIMIT - ELLIPSIS.chars().count())
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());
    value.truncate(cut);
    value.push_str(ELLIPSIS);
    value
}

fn duration_or_unknown(duration: Option<Duration>) -> String {
    match duration {
        Some(d) if !d.is_zero() => format_duration(d),
        _ => UNKNOWN.to_string(),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
