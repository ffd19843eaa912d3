pub mod ytdlp;

use async_trait::async_trait;
use regex::Regex;
use serenity::model::id::UserId;
use std::{path::Path, path::PathBuf, sync::LazyLock};
use thiserror::Error;

use crate::audio::queue::Track;

pub use ytdlp::YtDlpDownloader;

/// Resolves a user query into a track stored on disk.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Downloads the best match for `query` into `dest_dir`.
    ///
    /// Each call is independent: implementations must not share mutable
    /// state between invocations beyond the destination directory.
    async fn resolve(
        &self,
        query: &str,
        dest_dir: &Path,
        requested_by: UserId,
    ) -> Result<Track, DownloadError>;
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no results for the query")]
    NoResults,
    #[error("video is geo-blocked: {0}")]
    GeoBlocked(String),
    #[error("video is age restricted: {0}")]
    AgeRestricted(String),
    #[error("video is unavailable: {0}")]
    Unavailable(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("malformed query: {0}")]
    InvalidQuery(String),
    #[error("extraction failed: {0}")]
    Extractor(String),
    #[error("downloaded file not found in {}", .0.display())]
    MissingFile(PathBuf),
    #[error("could not run the download tool: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("could not parse the download tool output: {0}")]
    Parse(#[from] serde_json::Error),
}

impl DownloadError {
    /// Message shown in the channel. Details from the tool are only
    /// revealed when `report_details` is set.
    pub fn user_message(&self, report_details: bool) -> String {
        match self {
            DownloadError::NoResults => "Couldn't find any results for your query.".to_string(),
            _ if !report_details => "Sorry, failed to download this video.".to_string(),
            other => format!("Failed to download due to error: {}", other.detail()),
        }
    }

    fn detail(&self) -> String {
        match self {
            DownloadError::GeoBlocked(msg)
            | DownloadError::AgeRestricted(msg)
            | DownloadError::Unavailable(msg)
            | DownloadError::Network(msg)
            | DownloadError::InvalidQuery(msg)
            | DownloadError::Extractor(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Classifies the stderr of a failed yt-dlp run.
    pub fn from_stderr(stderr: &str) -> Self {
        let message = last_error_line(stderr);
        let lower = message.to_lowercase();

        let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if any(&[
            "available in your country",
            "blocked it in your country",
            "geo restriction",
            "geo-restricted",
        ]) {
            DownloadError::GeoBlocked(message)
        } else if any(&["confirm your age", "age-restricted", "age restricted", "inappropriate for some users"]) {
            DownloadError::AgeRestricted(message)
        } else if any(&["video unavailable", "private video", "has been removed", "this video is not available"]) {
            DownloadError::Unavailable(message)
        } else if any(&[
            "unable to download webpage",
            "timed out",
            "connection refused",
            "connection reset",
            "network is unreachable",
            "name or service not known",
            "temporary failure in name resolution",
        ]) {
            DownloadError::Network(message)
        } else if any(&["is not a valid url", "unsupported url"]) {
            DownloadError::InvalidQuery(message)
        } else {
            DownloadError::Extractor(message)
        }
    }
}

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b[^m]*m").expect("static regex"));

/// Strips terminal colours and a leading `ERROR:` marker.
pub fn sanitize_message(raw: &str) -> String {
    let clean = ANSI_ESCAPE.replace_all(raw, "");
    let clean = clean.trim();

    match clean.get(..5) {
        Some(head) if head.eq_ignore_ascii_case("error") => clean[5..]
            .trim_start_matches([' ', ':'])
            .trim_end()
            .to_string(),
        _ => clean.to_string(),
    }
}

fn last_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|line| ANSI_ESCAPE.replace_all(line, "").trim_start().starts_with("ERROR"))
        .or_else(|| stderr.lines().rev().find(|line| !line.trim().is_empty()))
        .map(sanitize_message)
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| "unknown error".to_string())
}
