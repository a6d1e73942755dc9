use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::AppError;
use crate::utils;

/// The number of client IDs reserved on disk at a time.
pub const ID_BLOCK: u32 = 1024;

/// Hands out client IDs which are never reused, across restarts too.
///
/// Stage recovery logs are keyed by client ID, so a restarted gateway must not hand out an ID
/// which may still have state in them. IDs are reserved in blocks by persisting the end of the
/// block before any of its IDs is used; the unused rest of a block is skipped after a restart.
pub struct ClientIds {
    path: PathBuf,
    /// The next ID to hand out.
    next: u32,
    /// The end of the reserved block, exclusive.
    reserved: u32,
}

impl ClientIds {
    /// Open the ID counter stored at the given path, starting from 1 if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let next = match tokio::fs::read(&path).await {
            Ok(raw) => utils::decode_u32(&raw).with_context(|| format!("error decoding client id counter {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 1,
            Err(err) => return Err(err).with_context(|| format!("error reading client id counter {}", path.display())),
        };
        tracing::debug!(next, path = %path.display(), "client id counter opened");
        Ok(Self { path, next, reserved: next })
    }

    /// Take the next client ID, reserving a new block as needed.
    pub async fn next_id(&mut self) -> Result<u32> {
        if self.next >= self.reserved {
            let reserved = match self.next.checked_add(ID_BLOCK) {
                Some(reserved) => reserved,
                None => return Err(AppError::InvalidInput("client ids are exhausted".into()).into()),
            };
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || persist(&path, reserved))
                .await
                .context("error joining client id counter write")??;
            self.reserved = reserved;
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }
}

/// Atomically replace the counter file with the given value.
fn persist(path: &Path, val: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("error creating dir for client id counter {}", path.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).with_context(|| format!("error creating {}", tmp.display()))?;
    file.write_all(&utils::encode_u32(val)).context("error writing client id counter")?;
    file.sync_all().context("error syncing client id counter")?;
    fs::rename(&tmp, path).with_context(|| format!("error replacing client id counter {}", path.display()))?;
    Ok(())
}
