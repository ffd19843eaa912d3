use anyhow::Result;
use std::path::PathBuf;
use tracing::warn;

/// Embed colour used when `BOT_COLOR` is missing or malformed.
pub const DEFAULT_COLOR: u32 = 0x915CBF;

/// yt-dlp format selector used when `YTDL_FORMAT` is not set.
pub const DEFAULT_YTDL_FORMAT: &str = "bestaudio[ext=webm]/bestaudio";

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub bot_token: String,
    pub prefix: String,
    pub color: u32,

    // Downloads
    pub ytdl_format: String,
    pub ytdl_binary: String,
    pub download_dir: PathBuf,

    // Reporting
    pub print_stack_trace: bool,
    pub report_command_not_found: bool,
    pub report_dl_error: bool,
}

impl Config {
    /// Loads the configuration from the process environment, reading a
    /// `.env` file first when one exists.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.download_dir)?;

        Ok(config)
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// Only `BOT_TOKEN` is mandatory. Every other key falls back to its
    /// default when absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("BOT_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No token provided. Please put BOT_TOKEN in .env"))?;

        let color = match lookup("BOT_COLOR") {
            Some(raw) => parse_color(&raw).unwrap_or_else(|| {
                warn!("🎨 Invalid BOT_COLOR {:?}, using default ({:06x})", raw, DEFAULT_COLOR);
                DEFAULT_COLOR
            }),
            None => DEFAULT_COLOR,
        };

        let config = Self {
            bot_token,
            prefix: lookup("BOT_PREFIX").unwrap_or_else(|| ".".to_string()),
            color,

            ytdl_format: lookup("YTDL_FORMAT").unwrap_or_else(|| DEFAULT_YTDL_FORMAT.to_string()),
            ytdl_binary: lookup("YTDL_BINARY").unwrap_or_else(|| "yt-dlp".to_string()),
            download_dir: lookup("DOWNLOAD_DIR")
                .unwrap_or_else(|| "./dl".to_string())
                .into(),

            print_stack_trace: parse_flag(lookup("PRINT_STACK_TRACE").as_deref(), true),
            report_command_not_found: parse_flag(
                lookup("BOT_REPORT_COMMAND_NOT_FOUND").as_deref(),
                true,
            ),
            report_dl_error: parse_flag(lookup("BOT_REPORT_DL_ERROR").as_deref(), false),
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            anyhow::bail!("BOT_PREFIX must not be empty");
        }

        if self.prefix.chars().any(char::is_whitespace) {
            anyhow::bail!("BOT_PREFIX must not contain whitespace, got: {:?}", self.prefix);
        }

        if self.ytdl_format.trim().is_empty() {
            anyhow::bail!("YTDL_FORMAT must not be empty");
        }

        Ok(())
    }

    /// Returns a summary of the configuration that is safe to log.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Prefix: {:?}, color: {:06x}\n  \
            Downloads: {} into {} (format {:?})\n  \
            Reporting: stack traces={}, unknown commands={}, download errors={}",
            self.prefix,
            self.color,
            self.ytdl_binary,
            self.download_dir.display(),
            self.ytdl_format,
            self.print_stack_trace,
            self.report_command_not_found,
            self.report_dl_error,
        )
    }
}

/// `true`, `t` and `1` (any case) are true, everything else is false.
pub fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(value) => matches!(value.trim().to_lowercase().as_str(), "true" | "t" | "1"),
        None => default,
    }
}

/// Parses a hex colour, with or without a leading `#` or `0x`.
pub fn parse_color(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix('#')
        .or_else(|| trimmed.strip_prefix("0x"))
        .unwrap_or(trimmed);

    u32::from_str_radix(hex, 16)
        .ok()
        .filter(|color| *color <= 0xFF_FF_FF)
}
