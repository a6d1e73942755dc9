//! The durable recovery log.
//!
//! Every worker owns an append-only log file recording the lifecycle of each message it handles:
//!
//! ```text
//! START <message> <client>
//! SENT <message> <client> <published>
//! SAVE_BEGIN <message> <client> <received> <sent> <base64 state | ->
//! SAVE_DONE <message> <client>
//! COMMIT <message> <client>
//! ```
//!
//! Each append is written and synced under an exclusive file lock before the call returns, so
//! a record is either fully present or, after a crash, present as a torn trailing line which
//! readers skip and the next `open` truncates.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;

use crate::error::{ShutdownError, ShutdownResult, ERR_LOG_FLUSH, ERR_LOG_LOCK};

/// The size of the chunks read while scanning the log backward.
const REV_CHUNK_SIZE: u64 = 8 * 1024;
/// The placeholder written in place of an empty processor state.
const NO_STATE: &str = "-";

const TAG_START: &str = "START";
const TAG_SENT: &str = "SENT";
const TAG_SAVE_BEGIN: &str = "SAVE_BEGIN";
const TAG_SAVE_DONE: &str = "SAVE_DONE";
const TAG_COMMIT: &str = "COMMIT";

/// The state persisted for a client by a save.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SavedState {
    /// Messages received from upstream for the client, including the one being saved.
    pub received: u64,
    /// Messages published downstream for the client.
    pub sent: u64,
    /// The processor's snapshot, if it keeps any state.
    pub processor: Option<Vec<u8>>,
}

/// A single record of the recovery log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    Start { message_id: u64, client_id: u32 },
    Sent { message_id: u64, client_id: u32, published: u64 },
    SaveBegin { message_id: u64, client_id: u32, state: SavedState },
    SaveDone { message_id: u64, client_id: u32 },
    Commit { message_id: u64, client_id: u32 },
}

impl LogRecord {
    /// The (message, client) pair this record belongs to.
    pub fn ids(&self) -> (u64, u32) {
        match self {
            Self::Start { message_id, client_id }
            | Self::Sent { message_id, client_id, .. }
            | Self::SaveBegin { message_id, client_id, .. }
            | Self::SaveDone { message_id, client_id }
            | Self::Commit { message_id, client_id } => (*message_id, *client_id),
        }
    }

    /// Render this record as a newline terminated log line.
    pub fn to_line(&self) -> String {
        match self {
            Self::Start { message_id, client_id } => format!("{} {} {}\n", TAG_START, message_id, client_id),
            Self::Sent { message_id, client_id, published } => format!("{} {} {} {}\n", TAG_SENT, message_id, client_id, published),
            Self::SaveBegin { message_id, client_id, state } => {
                let blob = state.processor.as_ref().map(base64::encode).unwrap_or_else(|| NO_STATE.into());
                format!("{} {} {} {} {} {}\n", TAG_SAVE_BEGIN, message_id, client_id, state.received, state.sent, blob)
            }
            Self::SaveDone { message_id, client_id } => format!("{} {} {}\n", TAG_SAVE_DONE, message_id, client_id),
            Self::Commit { message_id, client_id } => format!("{} {} {}\n", TAG_COMMIT, message_id, client_id),
        }
    }

    /// Parse a log line, without its newline terminator.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(' ').collect();
        let ids = |parts: &[&str]| -> Result<(u64, u32)> {
            let message_id = parts.get(1).context("missing message id")?.parse().context("invalid message id")?;
            let client_id = parts.get(2).context("missing client id")?.parse().context("invalid client id")?;
            Ok((message_id, client_id))
        };
        let (message_id, client_id) = ids(&parts)?;
        let record = match (parts[0], parts.len()) {
            (TAG_START, 3) => Self::Start { message_id, client_id },
            (TAG_SENT, 4) => Self::Sent {
                message_id,
                client_id,
                published: parts[3].parse().context("invalid published count")?,
            },
            (TAG_SAVE_BEGIN, 6) => {
                let processor = match parts[5] {
                    NO_STATE => None,
                    blob => Some(base64::decode(blob).context("invalid base64 processor state")?),
                };
                Self::SaveBegin {
                    message_id,
                    client_id,
                    state: SavedState {
                        received: parts[3].parse().context("invalid received count")?,
                        sent: parts[4].parse().context("invalid sent count")?,
                        processor,
                    },
                }
            }
            (TAG_SAVE_DONE, 3) => Self::SaveDone { message_id, client_id },
            (TAG_COMMIT, 3) => Self::Commit { message_id, client_id },
            (tag, len) => bail!("unrecognized log record {} with {} fields", tag, len),
        };
        Ok(record)
    }
}

/// The kind of the most recent record of the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreType {
    Commit,
    SaveDone,
    Sent,
    Start,
}

/// The most recent point of progress found in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestorePoint {
    pub restore_type: RestoreType,
    pub message_id: u64,
    pub client_id: u32,
    /// The saved state, present when `restore_type` is `SaveDone`.
    pub state: Option<SavedState>,
}

/// A handle to a worker's recovery log.
#[derive(Clone)]
pub struct DurableLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    /// The path of the log file on disk.
    path: PathBuf,
    /// The append handle of the log file.
    file: Mutex<File>,
}

impl DurableLog {
    /// Open the log at the given path, creating it as needed.
    ///
    /// A torn trailing record left by a crash mid-append is truncated away.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("error creating dir for recovery log {}", path.display()))?;
        }
        Self::spawn_blocking(move || -> Result<Self> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("error opening recovery log {}", path.display()))?;
            FileExt::lock_exclusive(&file).context(ERR_LOG_LOCK)?;
            let res = truncate_torn_tail(&file, &path);
            FileExt::unlock(&file).context("error releasing recovery log lock")?;
            res?;
            Ok(Self {
                inner: Arc::new(LogInner { path, file: Mutex::new(file) }),
            })
        })
        .await?
    }

    /// Spawn a blocking log-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// The path of this log on disk.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Record that processing of the given message has started.
    pub async fn start(&self, message_id: u64, client_id: u32) -> ShutdownResult<()> {
        self.append(vec![LogRecord::Start { message_id, client_id }]).await
    }

    /// Record that the outputs of the given message have been published.
    pub async fn sent(&self, message_id: u64, client_id: u32, published: u64) -> ShutdownResult<()> {
        self.append(vec![LogRecord::Sent { message_id, client_id, published }]).await
    }

    /// Record the client's state after the given message.
    ///
    /// The SAVE_BEGIN and SAVE_DONE records are appended and synced one after the other.
    pub async fn save(&self, message_id: u64, client_id: u32, state: SavedState) -> ShutdownResult<()> {
        self.append(vec![LogRecord::SaveBegin { message_id, client_id, state }]).await?;
        self.append(vec![LogRecord::SaveDone { message_id, client_id }]).await
    }

    /// Record that the given message is fully handled.
    pub async fn commit(&self, message_id: u64, client_id: u32) -> ShutdownResult<()> {
        self.append(vec![LogRecord::Commit { message_id, client_id }]).await
    }

    /// Find the most recent point of progress recorded in the log.
    ///
    /// A missing or empty log yields `None`.
    pub async fn restore(&self) -> Result<Option<RestorePoint>> {
        let path = self.inner.path.clone();
        Self::spawn_blocking(move || find_restore_point(&path)).await?
    }

    /// Read every record of the log, most recent first.
    pub async fn records_rev(&self) -> Result<Vec<LogRecord>> {
        let path = self.inner.path.clone();
        Self::spawn_blocking(move || -> Result<Vec<LogRecord>> {
            match RevRecords::open(&path)? {
                Some(records) => records.collect(),
                None => Ok(vec![]),
            }
        })
        .await?
    }

    /// Rewrite the log without any record of the given client.
    ///
    /// The rewrite goes to a temporary file which atomically replaces the log.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn purge_client(&self, client_id: u32) -> ShutdownResult<()> {
        let inner = self.inner.clone();
        Self::spawn_blocking(move || -> Result<()> {
            let mut file = inner.file.lock().map_err(|_| anyhow!("recovery log mutex poisoned"))?;
            FileExt::lock_exclusive(&*file).context(ERR_LOG_LOCK)?;
            let res = rewrite_without_client(&inner.path, client_id);
            let _ = FileExt::unlock(&*file);
            let replacement = res?;
            *file = replacement;
            Ok(())
        })
        .await?
        .map_err(ShutdownError::from)
    }

    /// Append the given records as one locked, synced write per record.
    async fn append(&self, records: Vec<LogRecord>) -> ShutdownResult<()> {
        let inner = self.inner.clone();
        Self::spawn_blocking(move || -> Result<()> {
            let mut file = inner.file.lock().map_err(|_| anyhow!("recovery log mutex poisoned"))?;
            for record in records {
                FileExt::lock_exclusive(&*file).context(ERR_LOG_LOCK)?;
                let res = file.write_all(record.to_line().as_bytes()).and_then(|_| file.sync_data());
                let unlock_res = FileExt::unlock(&*file);
                res.context(ERR_LOG_FLUSH)?;
                unlock_res.context("error releasing recovery log lock")?;
            }
            Ok(())
        })
        .await?
        .map_err(ShutdownError::from)
    }
}

/// Truncate a trailing line which is missing its newline terminator.
fn truncate_torn_tail(file: &File, path: &Path) -> Result<()> {
    let len = file.metadata().context("error reading recovery log metadata")?.len();
    if len == 0 {
        return Ok(());
    }
    let mut reader = file.try_clone().context("error cloning recovery log handle")?;
    let mut last = [0u8; 1];
    reader.seek(SeekFrom::Start(len - 1)).context("error seeking recovery log")?;
    reader.read_exact(&mut last).context("error reading recovery log")?;
    if last[0] == b'\n' {
        return Ok(());
    }

    // Walk backward to the last complete line.
    let mut keep = 0u64;
    let mut lines = RevLines::new(reader, len);
    if let Some(res) = lines.next_raw() {
        let (offset, line) = res.context("error scanning recovery log")?;
        keep = offset + line.len() as u64 + 1;
    }
    tracing::warn!(path = %path.display(), len, keep, "truncating torn trailing record of recovery log");
    file.set_len(keep).context("error truncating recovery log")?;
    file.sync_data().context(ERR_LOG_FLUSH)?;
    Ok(())
}

/// Copy every record not belonging to the given client into a fresh file which replaces the log.
fn rewrite_without_client(path: &Path, client_id: u32) -> Result<File> {
    let mut records = match RevRecords::open(path)? {
        Some(records) => records.collect::<Result<Vec<_>>>()?,
        None => vec![],
    };
    records.reverse();

    let tmp_path = path.with_extension("compact");
    let mut tmp = File::create(&tmp_path).with_context(|| format!("error creating {}", tmp_path.display()))?;
    for record in records.iter().filter(|record| record.ids().1 != client_id) {
        tmp.write_all(record.to_line().as_bytes()).context("error writing compacted recovery log")?;
    }
    tmp.sync_all().context(ERR_LOG_FLUSH)?;
    std::fs::rename(&tmp_path, path).context("error replacing recovery log with compacted copy")?;

    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("error reopening recovery log {}", path.display()))
}

/// Find the most recent restore point of the log at the given path.
pub fn find_restore_point(path: &Path) -> Result<Option<RestorePoint>> {
    let mut records = match RevRecords::open(path)? {
        Some(records) => records,
        None => return Ok(None),
    };
    let latest = match records.next() {
        Some(record) => record?,
        None => return Ok(None),
    };
    if !matches!(latest, LogRecord::SaveDone { .. }) {
        return Ok(Some(restore_point_of(&latest, None)));
    }

    // A SAVE_DONE is always directly preceded by its SAVE_BEGIN.
    match records.next().transpose()? {
        Some(LogRecord::SaveBegin { message_id, client_id, state }) if (message_id, client_id) == latest.ids() => {
            Ok(Some(restore_point_of(&latest, Some(state))))
        }
        _ => bail!("recovery log has a SAVE_DONE record without its SAVE_BEGIN record"),
    }
}

fn restore_point_of(record: &LogRecord, state: Option<SavedState>) -> RestorePoint {
    let (message_id, client_id) = record.ids();
    let restore_type = match record {
        LogRecord::Start { .. } => RestoreType::Start,
        // A save which never completed leaves the message as sent.
        LogRecord::Sent { .. } | LogRecord::SaveBegin { .. } => RestoreType::Sent,
        LogRecord::SaveDone { .. } => RestoreType::SaveDone,
        LogRecord::Commit { .. } => RestoreType::Commit,
    };
    RestorePoint {
        restore_type,
        message_id,
        client_id,
        state,
    }
}

/// An iterator over the parsed records of a log, most recent first.
///
/// Lines which fail to parse are skipped with a warning.
pub struct RevRecords {
    lines: RevLines,
}

impl RevRecords {
    /// Open the log at the given path for reverse reading, `None` if it does not exist.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("error opening recovery log {}", path.display())),
        };
        let len = file.metadata().context("error reading recovery log metadata")?.len();
        Ok(Some(Self {
            lines: RevLines::new(file, len),
        }))
    }
}

impl Iterator for RevRecords {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next_raw()? {
                Ok((_, line)) => line,
                Err(err) => return Some(Err(anyhow::Error::from(err).context("error reading recovery log"))),
            };
            let parsed = std::str::from_utf8(&line)
                .map_err(anyhow::Error::from)
                .and_then(LogRecord::parse);
            match parsed {
                Ok(record) => return Some(Ok(record)),
                Err(err) => {
                    tracing::warn!(error = ?err, "skipping unreadable recovery log record");
                    continue;
                }
            }
        }
    }
}

/// Reads the lines of a file from its end toward its start in fixed-size chunks.
struct RevLines {
    file: File,
    /// The start offset of the region not yet read.
    pos: u64,
    /// Bytes read but not yet yielded; always the beginning of the unyielded region.
    tail: Vec<u8>,
    /// Set when the file does not end with a newline, so its last line is torn.
    skip_torn: bool,
    /// Whether the torn-tail check has run.
    checked_torn: bool,
}

impl RevLines {
    fn new(file: File, len: u64) -> Self {
        Self {
            file,
            pos: len,
            tail: Vec::new(),
            skip_torn: false,
            checked_torn: false,
        }
    }

    /// Yield the next line (without terminator) along with its start offset.
    fn next_raw(&mut self) -> Option<io::Result<(u64, Vec<u8>)>> {
        loop {
            if let Some(idx) = self.tail.iter().rposition(|byte| *byte == b'\n') {
                let line = self.tail.split_off(idx + 1);
                self.tail.truncate(idx);
                let offset = self.pos + idx as u64 + 1;
                if self.skip_torn {
                    self.skip_torn = false;
                    continue;
                }
                if line.is_empty() {
                    continue;
                }
                return Some(Ok((offset, line)));
            }
            if self.pos == 0 {
                if self.tail.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut self.tail);
                if self.skip_torn {
                    self.skip_torn = false;
                    continue;
                }
                return Some(Ok((0, line)));
            }
            if let Err(err) = self.read_chunk() {
                return Some(Err(err));
            }
        }
    }

    fn read_chunk(&mut self) -> io::Result<()> {
        let len = REV_CHUNK_SIZE.min(self.pos);
        self.pos -= len;
        let mut chunk = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(&mut chunk)?;
        if !self.checked_torn {
            self.checked_torn = true;
            self.skip_torn = chunk.last().map(|byte| *byte != b'\n').unwrap_or(false);
        }
        chunk.extend_from_slice(&self.tail);
        self.tail = chunk;
        Ok(())
    }
}
