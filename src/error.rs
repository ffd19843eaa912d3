use thiserror::Error;

use crate::{audio::queue::QueueError, sources::DownloadError};

/// Everything a command can fail with.
///
/// Each variant maps to the message posted back in the channel; only
/// [`BotError::is_unexpected`] errors are logged as failures.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("unknown command: {0}")]
    CommandNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("voice connection failed: {0}")]
    VoiceConnection(String),

    #[error("author is not in a voice channel")]
    NotInVoice,

    #[error("author is in a different voice channel than the bot")]
    WrongVoiceChannel,

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("playback is not paused")]
    NotPaused,

    #[error("playback is already paused")]
    AlreadyPaused,

    #[error("missing administrator permissions")]
    MissingPermissions,

    #[error("discord error: {0}")]
    Discord(#[from] serenity::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<QueueError> for BotError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NothingPlaying => BotError::NothingPlaying,
            QueueError::AlreadyPaused => BotError::AlreadyPaused,
            QueueError::NotPaused => BotError::NotPaused,
            QueueError::VolumeOutOfRange(_) => {
                BotError::InvalidArgument("Volume must be between 0 and 100.".to_string())
            }
            QueueError::ZeroSkip => {
                BotError::InvalidArgument("Skip count must be at least 1.".to_string())
            }
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Other(err.into())
    }
}

impl BotError {
    /// Text posted in the channel, or `None` when the error should stay silent.
    pub fn user_message(&self, prefix: &str, report_not_found: bool, report_dl_error: bool) -> Option<String> {
        let message = match self {
            BotError::CommandNotFound(_) if !report_not_found => return None,
            BotError::CommandNotFound(_) => {
                format!("Command not recognized. Type `{}help` to see commands.", prefix)
            }
            BotError::InvalidArgument(msg) => msg.clone(),
            BotError::Download(err) => err.user_message(report_dl_error),
            BotError::VoiceConnection(_) => {
                "Failed to connect to voice channel.".to_string()
            }
            BotError::NotInVoice => "You must be in a voice channel to use this command.".to_string(),
            BotError::WrongVoiceChannel => {
                "You must be in the same voice channel as the bot.".to_string()
            }
            BotError::NothingPlaying => "The bot isn't playing anything.".to_string(),
            BotError::NotPaused => "The bot is not paused.".to_string(),
            BotError::AlreadyPaused => "The bot is already paused.".to_string(),
            BotError::MissingPermissions => {
                "This command requires administrator permissions.".to_string()
            }
            BotError::Discord(_) | BotError::Other(_) => {
                "An unexpected error occurred. Check logs for details.".to_string()
            }
        };
        Some(message)
    }

    /// Whether the error is a fault rather than a user mistake.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            BotError::Discord(_) | BotError::Other(_) | BotError::VoiceConnection(_)
        )
    }
}
