use crate::error::BotError;

/// How many tracks `skip` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCount {
    Some(usize),
    All,
}

/// A parsed prefix command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// An empty query resumes a paused track.
    Play(String),
    Queue,
    Skip(SkipCount),
    NowPlaying,
    Pause,
    Resume,
    /// `None` shows the current volume.
    Volume(Option<u16>),
    Loop,
    Cleanup,
    Help,
    Ayuda,
}

impl Command {
    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Play(_) => "play",
            Command::Queue => "queue",
            Command::Skip(_) => "skip",
            Command::NowPlaying => "nowplaying",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Volume(_) => "volume",
            Command::Loop => "loop",
            Command::Cleanup => "cleanup",
            Command::Help => "help",
            Command::Ayuda => "ayuda",
        }
    }

    /// Whether the author has to share the bot's voice channel.
    pub fn needs_voice(&self) -> bool {
        !matches!(self, Command::Cleanup | Command::Help | Command::Ayuda)
    }
}

/// Parses `content` if it starts with `prefix`.
///
/// Returns `None` for messages that are not commands at all, and
/// `Some(Err(_))` for commands that are unknown or carry bad arguments.
pub fn parse(prefix: &str, content: &str) -> Option<Result<Command, BotError>> {
    let body = content.strip_prefix(prefix)?;
    let body = body.trim_start();

    let (name, args) = match body.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (body, ""),
    };

    if name.is_empty() {
        return None;
    }

    Some(parse_command(&name.to_lowercase(), args))
}

fn parse_command(name: &str, args: &str) -> Result<Command, BotError> {
    let command = match name {
        "play" | "p" => Command::Play(args.to_string()),
        "queue" | "lista" | "q" => Command::Queue,
        "skip" | "s" | "siguiente" | "pasar" | "next" => Command::Skip(parse_skip(args)?),
        "nowplaying" | "np" | "sonando" => Command::NowPlaying,
        "pause" | "pa" | "parar" | "pausa" => Command::Pause,
        "resume" | "r" | "continuar" | "unpausar" => Command::Resume,
        "volume" | "v" => Command::Volume(parse_volume(args)?),
        "loop" | "l" => Command::Loop,
        "cleanup" | "clean" => Command::Cleanup,
        "help" | "h" => Command::Help,
        "ayuda" | "a" => Command::Ayuda,
        other => return Err(BotError::CommandNotFound(other.to_string())),
    };
    Ok(command)
}

fn parse_skip(args: &str) -> Result<SkipCount, BotError> {
    let Some(arg) = args.split_whitespace().next() else {
        return Ok(SkipCount::Some(1));
    };

    if arg.eq_ignore_ascii_case("all") {
        return Ok(SkipCount::All);
    }

    match arg.parse::<usize>() {
        Ok(0) => Err(BotError::InvalidArgument(
            "Skip count must be at least 1.".to_string(),
        )),
        Ok(n) => Ok(SkipCount::Some(n)),
        Err(_) => Err(BotError::InvalidArgument(
            "Skip count must be a number or `all`.".to_string(),
        )),
    }
}

fn parse_volume(args: &str) -> Result<Option<u16>, BotError> {
    let Some(arg) = args.split_whitespace().next() else {
        return Ok(None);
    };

    let arg = arg.trim_end_matches('%');
    match arg.parse::<u16>() {
        Ok(v) if v <= 100 => Ok(Some(v)),
        _ => Err(BotError::InvalidArgument(
            "Volume must be between 0 and 100.".to_string(),
        )),
    }
}
