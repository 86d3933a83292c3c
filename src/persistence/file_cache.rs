use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tokio::fs;
use tracing::debug;

use crate::broker::message::valid_message_id;
use crate::utils::error::{Error, Result};
use crate::utils::limiter::FixedLimiter;

/// Directory of attachment files, one file per message ID.
///
/// Tracks the total size on disk and refuses writes past `total_size_limit`.
#[derive(Debug)]
pub struct FileCache {
    dir: PathBuf,
    total_size_current: Mutex<i64>,
    total_size_limit: i64,
}

impl FileCache {
    pub async fn new(dir: impl AsRef<Path>, total_size_limit: i64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        let size = dir_size(&dir).await?;
        Ok(Self {
            dir,
            total_size_current: Mutex::new(size),
            total_size_limit,
        })
    }

    /// Writes the attachment for message `id`.
    ///
    /// Every limiter in `limiters`, plus the cache's own remaining capacity, must accept
    /// the full size. On failure no limiter is charged and no file is left behind.
    pub async fn write(&self, id: &str, data: &[u8], limiters: &[&FixedLimiter]) -> Result<i64> {
        if !valid_message_id(id) {
            return Err(Error::InvalidAttachmentId(id.to_string()));
        }
        let size = i64::try_from(data.len()).map_err(|_| Error::AttachmentTooLarge)?;
        let file = self.path(id);
        if fs::try_exists(&file).await? {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("attachment {id} exists"),
            )));
        }

        let total = FixedLimiter::new(self.remaining());
        let mut charged: Vec<&FixedLimiter> = Vec::with_capacity(limiters.len() + 1);
        for limiter in limiters.iter().copied().chain(std::iter::once(&total)) {
            if let Err(e) = limiter.add(size) {
                for l in &charged {
                    l.sub(size);
                }
                return Err(e);
            }
            charged.push(limiter);
        }

        debug!(message_id = id, size, "Writing attachment");
        if let Err(e) = fs::write(&file, data).await {
            let _ = fs::remove_file(&file).await;
            for l in &charged {
                l.sub(size);
            }
            return Err(e.into());
        }
        *self.lock() += size;
        Ok(size)
    }

    /// Reads the attachment of message `id`. A missing file is [`Error::MessageNotFound`].
    pub async fn read(&self, id: &str) -> Result<Vec<u8>> {
        if !valid_message_id(id) {
            return Err(Error::InvalidAttachmentId(id.to_string()));
        }
        match fs::read(self.path(id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::MessageNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the attachments of the given messages and recomputes the total size.
    pub async fn remove(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            if !valid_message_id(id) {
                return Err(Error::InvalidAttachmentId(id.clone()));
            }
            debug!(message_id = %id, "Deleting attachment");
            if let Err(e) = fs::remove_file(self.path(id)).await {
                debug!(message_id = %id, error = %e, "Error deleting attachment");
            }
        }
        let size = dir_size(&self.dir).await?;
        *self.lock() = size;
        Ok(())
    }

    pub fn size(&self) -> i64 {
        *self.lock()
    }

    pub fn remaining(&self) -> i64 {
        (self.total_size_limit - self.size()).max(0)
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, i64> {
        self.total_size_current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn dir_size(dir: &Path) -> Result<i64> {
    let mut entries = fs::read_dir(dir).await?;
    let mut size: u64 = 0;
    while let Some(entry) = entries.next_entry().await? {
        size += entry.metadata().await?.len();
    }
    Ok(i64::try_from(size).unwrap_or(i64::MAX))
}
