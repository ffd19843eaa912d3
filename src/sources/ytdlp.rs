use async_trait::async_trait;
use serde::Deserialize;
use serenity::model::id::UserId;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tracing::{debug, info, warn};

use super::{DownloadError, Downloader};
use crate::audio::queue::Track;

/// Downloads audio by spawning yt-dlp, one process per request.
pub struct YtDlpDownloader {
    binary: String,
    format: String,
}

/// The subset of yt-dlp's info JSON the bot uses.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default, rename = "_filename")]
    filename: Option<String>,
}

impl YtDlpDownloader {
    pub fn new(binary: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            format: format.into(),
        }
    }

    fn command(&self, query: &str, dest_dir: &Path) -> tokio::process::Command {
        let template = dest_dir.join("%(id)s.%(ext)s");

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args([
            "--format",
            self.format.as_str(),
            "--default-search",
            "ytsearch",
            "--no-playlist",
            "--socket-timeout",
            "10",
            "--retries",
            "3",
            "--source-address",
            "0.0.0.0",
            "--quiet",
            "--no-warnings",
            "--no-progress",
            "--dump-json",
            "--no-simulate",
            "--output",
        ])
        .arg(template)
        .arg("--")
        .arg(query)
        .stdin(Stdio::null())
        .kill_on_drop(true);

        cmd
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn resolve(
        &self,
        query: &str,
        dest_dir: &Path,
        requested_by: UserId,
    ) -> Result<Track, DownloadError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(DownloadError::InvalidQuery("empty query".to_string()));
        }

        info!("🔍 yt-dlp lookup: {}", query);
        let output = self.command(query, dest_dir).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp failed for {:?}: {}", query, stderr.trim());
            return Err(DownloadError::from_stderr(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let info = match parse_info(&stdout)? {
            Some(info) => info,
            None => return Err(DownloadError::NoResults),
        };

        let path = locate_download(&info, dest_dir)
            .await
            .ok_or_else(|| DownloadError::MissingFile(dest_dir.to_path_buf()))?;

        debug!("📥 Downloaded {} to {}", info.id, path.display());
        Ok(info.into_track(query, path, requested_by))
    }
}

/// yt-dlp prints one JSON document per line; the last one describes the
/// downloaded entry.
fn parse_info(stdout: &str) -> Result<Option<VideoInfo>, DownloadError> {
    match stdout.lines().rev().find(|line| line.trim_start().starts_with('{')) {
        Some(line) => Ok(Some(serde_json::from_str(line)?)),
        None => Ok(None),
    }
}

/// Finds the file yt-dlp wrote: the reported filename, then `<id>.<ext>`,
/// then any finished file in the directory starting with the id.
async fn locate_download(info: &VideoInfo, dest_dir: &Path) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(name) = &info.filename {
        candidates.push(PathBuf::from(name));
    }
    if let Some(ext) = &info.ext {
        candidates.push(dest_dir.join(format!("{}.{}", info.id, ext)));
    }

    for candidate in candidates {
        if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_file()) {
            return Some(candidate);
        }
    }

    let prefix = format!("{}.", info.id);
    let mut entries = tokio::fs::read_dir(dest_dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let unfinished = name.ends_with(".part") || name.ends_with(".ytdl");
        if name.starts_with(&prefix) && !unfinished {
            return Some(entry.path());
        }
    }

    None
}

impl VideoInfo {
    fn into_track(self, query: &str, path: PathBuf, requested_by: UserId) -> Track {
        Track {
            title: self.title.unwrap_or_else(|| "Unknown".to_string()),
            query: query.to_string(),
            url: self
                .webpage_url
                .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", self.id)),
            path,
            duration: self
                .duration
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(Duration::from_secs_f64),
            uploader: self.uploader,
            thumbnail: self.thumbnail,
            requested_by,
        }
    }
}
