use serenity::model::id::GuildId;
use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{debug, info, warn};

const STAGING_PREFIX: &str = ".incoming-";
const REMOVE_ATTEMPTS: usize = 5;

/// Owns the download directory: one sub-directory per guild, and inside it
/// one staging directory per in-flight download.
///
/// Finished downloads are moved from their staging directory into the guild
/// directory right before they are queued, so cleanup never sees a file that
/// is still being written.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    root: PathBuf,
    retry_delay: Duration,
}

impl DownloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retry_delay: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn guild_dir(&self, guild_id: GuildId) -> PathBuf {
        self.root.join(guild_id.get().to_string())
    }

    /// Creates a fresh staging directory for one download.
    pub async fn staging_dir(&self, guild_id: GuildId) -> io::Result<PathBuf> {
        let dir = self
            .guild_dir(guild_id)
            .join(format!("{}{:016x}", STAGING_PREFIX, fastrand::u64(..)));
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Moves a finished download into the guild directory and returns its
    /// new path.
    pub async fn commit(&self, guild_id: GuildId, staged: &Path) -> io::Result<PathBuf> {
        let name = staged.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "staged path has no file name")
        })?;
        let target = self.guild_dir(guild_id).join(name);
        fs::rename(staged, &target).await?;
        debug!("📦 Committed {}", target.display());
        Ok(target)
    }

    /// Removes a staging directory and whatever is left in it.
    pub async fn discard_staging(&self, staging: &Path) {
        if let Err(e) = fs::remove_dir_all(staging).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove staging dir {}: {}", staging.display(), e);
            }
        }
    }

    /// Deletes every file in the guild directory that is not in `keep`.
    ///
    /// Staging directories are skipped, so in-flight downloads survive.
    /// Returns the number of files removed.
    pub async fn cleanup(&self, guild_id: GuildId, keep: &HashSet<PathBuf>) -> io::Result<usize> {
        let dir = self.guild_dir(guild_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || keep.contains(&path) {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        info!("🧹 Cleaned up {} file(s) for guild {}", removed, guild_id);
        Ok(removed)
    }

    /// Removes a file, retrying a few times in case it is still held open
    /// by the audio decoder.
    pub async fn remove_file_with_retries(&self, path: &Path) -> bool {
        for attempt in 1..=REMOVE_ATTEMPTS {
            match fs::remove_file(path).await {
                Ok(()) => return true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
                Err(e) => {
                    debug!("Attempt {} to remove {} failed: {}", attempt, path.display(), e);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }

        warn!("Giving up on removing {}", path.display());
        false
    }

    /// Removes the given files in the background.
    pub fn remove_files_later(&self, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }

        let store = self.clone();
        tokio::spawn(async move {
            for path in paths {
                store.remove_file_with_retries(&path).await;
            }
        });
    }

    /// Removes every guild directory left from a previous run.
    pub async fn purge_all(&self) -> io::Result<usize> {
        fs::create_dir_all(&self.root).await?;

        let mut entries = fs::read_dir(&self.root).await?;
        let mut purged = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => purged += 1,
                Err(e) => warn!("Failed to clean up directory {}: {}", entry.path().display(), e),
            }
        }

        Ok(purged)
    }
}
