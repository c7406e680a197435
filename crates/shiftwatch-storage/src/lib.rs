//! File-backed persistence, the single-instance cycle lock and HTTP utilities for shiftwatch.

use std::collections::HashSet;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shiftwatch_core::{CheckerState, Recipient, RecipientError, Snapshot};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftwatch-storage";

pub const DEFAULT_JOBS_FILE: &str = "jobs_seen.json";
pub const DEFAULT_STATE_FILE: &str = "job_checker_state.json";
pub const DEFAULT_RECIPIENTS_FILE: &str = "recipients.json";
pub const DEFAULT_LOCK_FILE: &str = "job_checker.lock";
pub const JOURNAL_FILE: &str = "commit.journal";

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn temp_path_for(target: &Path) -> anyhow::Result<PathBuf> {
    let name = target
        .file_name()
        .with_context(|| format!("{} has no file name", target.display()))?
        .to_string_lossy();
    Ok(parent_dir(target).join(format!(".{name}.{}.tmp", Uuid::new_v4())))
}

async fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp file {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", path.display()))?;
    Ok(())
}

/// Replace `path` with `bytes` through a synced temp file and a rename.
///
/// The previous contents survive any failure.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    ensure_parent(path).await?;
    let temp = temp_path_for(path)?;
    if let Err(err) = write_synced(&temp, bytes).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err).with_context(|| {
            format!("atomically renaming {} -> {}", temp.display(), path.display())
        });
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_bytes_atomic(path, &bytes).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Missing,
    Loaded,
    Corrupt {
        reason: String,
        preserved_as: Option<PathBuf>,
    },
    /// The file exists but could not be read; it was left in place.
    Unreadable { reason: String },
}

#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub status: LoadStatus,
}

impl<T> Loaded<T> {
    pub fn is_corrupt(&self) -> bool {
        matches!(self.status, LoadStatus::Corrupt { .. })
    }

    pub fn is_unreadable(&self) -> bool {
        matches!(self.status, LoadStatus::Unreadable { .. })
    }
}

/// Read a JSON file, falling back to `T::default()` when it is missing, unreadable or invalid.
///
/// An invalid file is renamed to `<file>.corrupt-<stamp>` so the next save cannot destroy it.
/// A read error leaves the file where it is and reports [`LoadStatus::Unreadable`].
pub async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Loaded<T> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Loaded {
                value: T::default(),
                status: LoadStatus::Missing,
            }
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not read persisted file");
            return Loaded {
                value: T::default(),
                status: LoadStatus::Unreadable {
                    reason: err.to_string(),
                },
            };
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Loaded {
            value,
            status: LoadStatus::Loaded,
        },
        Err(err) => set_aside_corrupt(path, err.to_string()).await,
    }
}

async fn set_aside_corrupt<T: Default>(path: &Path, reason: String) -> Loaded<T> {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let aside = PathBuf::from(format!("{}.corrupt-{stamp}", path.display()));
    let preserved_as = match fs::rename(path, &aside).await {
        Ok(()) => Some(aside),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not preserve corrupt file");
            None
        }
    };
    warn!(path = %path.display(), %reason, "persisted file unreadable; treating it as empty");
    Loaded {
        value: T::default(),
        status: LoadStatus::Corrupt {
            reason,
            preserved_as,
        },
    }
}

/// `jobs_seen.json` -> `jobs_seen_backup_<stamp>.json`
pub fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_backup_{stamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}_backup_{stamp}"),
    };
    path.with_file_name(name)
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitJournal {
    entries: Vec<JournalEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    temp: PathBuf,
    target: PathBuf,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit aborted before it was decided; previous files untouched: {0:#}")]
    Aborted(anyhow::Error),
    #[error("commit decided but not fully applied; it is rolled forward on next recover: {0:#}")]
    Incomplete(anyhow::Error),
}

/// Job Store + checker state file pair, committed together through a journal.
///
/// A commit is decided once its journal is durable: [`CheckerStore::recover`] rolls a
/// leftover journal forward, and a crash before that point leaves both old files in place.
/// Call `recover` and `commit` only while holding the cycle lock.
#[derive(Debug, Clone)]
pub struct CheckerStore {
    jobs_path: PathBuf,
    state_path: PathBuf,
    journal_path: PathBuf,
}

impl CheckerStore {
    pub fn new(jobs_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let journal_path = parent_dir(&state_path).join(JOURNAL_FILE);
        Self {
            jobs_path: jobs_path.into(),
            state_path,
            journal_path,
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(DEFAULT_JOBS_FILE), dir.join(DEFAULT_STATE_FILE))
    }

    pub fn jobs_path(&self) -> &Path {
        &self.jobs_path
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub async fn load_jobs(&self) -> Loaded<Snapshot> {
        read_json_or_default(&self.jobs_path).await
    }

    pub async fn load_state(&self) -> Loaded<CheckerState> {
        read_json_or_default(&self.state_path).await
    }

    pub async fn save_jobs(&self, jobs: &Snapshot) -> anyhow::Result<()> {
        write_json_atomic(&self.jobs_path, jobs).await
    }

    pub async fn save_state(&self, state: &CheckerState) -> anyhow::Result<()> {
        write_json_atomic(&self.state_path, state).await
    }

    pub async fn commit(&self, jobs: &Snapshot, state: &CheckerState) -> Result<(), CommitError> {
        let jobs_bytes = serde_json::to_vec_pretty(jobs)
            .context("serializing job store")
            .map_err(CommitError::Aborted)?;
        let state_bytes = serde_json::to_vec_pretty(state)
            .context("serializing checker state")
            .map_err(CommitError::Aborted)?;

        let mut entries = Vec::with_capacity(2);
        for (target, bytes) in [(&self.jobs_path, jobs_bytes), (&self.state_path, state_bytes)] {
            match self.stage(target, &bytes).await {
                Ok(temp) => entries.push(JournalEntry {
                    temp,
                    target: target.clone(),
                }),
                Err(err) => {
                    discard_staged(&entries).await;
                    return Err(CommitError::Aborted(err));
                }
            }
        }

        let journal = CommitJournal { entries };
        if let Err(err) = write_json_atomic(&self.journal_path, &journal).await {
            discard_staged(&journal.entries).await;
            return Err(CommitError::Aborted(err));
        }

        self.apply(&journal).await.map_err(CommitError::Incomplete)
    }

    async fn stage(&self, target: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        ensure_parent(target).await?;
        let temp = temp_path_for(target)?;
        if let Err(err) = write_synced(&temp, bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }
        Ok(temp)
    }

    async fn apply(&self, journal: &CommitJournal) -> anyhow::Result<()> {
        for entry in &journal.entries {
            match fs::rename(&entry.temp, &entry.target).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(temp = %entry.temp.display(), "journal entry already applied");
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "renaming {} -> {}",
                            entry.temp.display(),
                            entry.target.display()
                        )
                    })
                }
            }
        }
        fs::remove_file(&self.journal_path)
            .await
            .with_context(|| format!("removing {}", self.journal_path.display()))
    }

    /// Finish an interrupted commit. Returns true when a journal was rolled forward.
    pub async fn recover(&self) -> anyhow::Result<bool> {
        let text = match fs::read_to_string(&self.journal_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.sweep_stray_temps().await;
                return Ok(false);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading {}", self.journal_path.display()))
            }
        };

        let journal: CommitJournal = match serde_json::from_str(&text) {
            Ok(journal) => journal,
            Err(err) => {
                warn!(path = %self.journal_path.display(), error = %err, "discarding unreadable commit journal");
                let _ = fs::remove_file(&self.journal_path).await;
                self.sweep_stray_temps().await;
                return Ok(false);
            }
        };

        info!(entries = journal.entries.len(), "rolling forward interrupted commit");
        self.apply(&journal).await?;
        Ok(true)
    }

    async fn sweep_stray_temps(&self) {
        for target in [&self.jobs_path, &self.state_path] {
            let Some(name) = target.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let prefix = format!(".{name}.");
            let Ok(mut dir) = fs::read_dir(parent_dir(target)).await else {
                continue;
            };
            while let Ok(Some(entry)) = dir.next_entry().await {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if !(file_name.starts_with(&prefix) && file_name.ends_with(".tmp")) {
                    continue;
                }
                match fs::remove_file(entry.path()).await {
                    Ok(()) => debug!(file = %file_name, "removed stray temp file"),
                    Err(err) => warn!(file = %file_name, error = %err, "could not remove stray temp file"),
                }
            }
        }
    }

    /// Copy both files to timestamped backups next to them; missing files are skipped.
    pub async fn backup(&self, stamp: &str) -> anyhow::Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for source in [&self.jobs_path, &self.state_path] {
            if !fs::try_exists(source)
                .await
                .with_context(|| format!("checking {}", source.display()))?
            {
                continue;
            }
            let dest = backup_path(source, stamp);
            fs::copy(source, &dest)
                .await
                .with_context(|| format!("copying {} -> {}", source.display(), dest.display()))?;
            written.push(dest);
        }
        Ok(written)
    }
}

async fn discard_staged(entries: &[JournalEntry]) {
    for entry in entries {
        let _ = fs::remove_file(&entry.temp).await;
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("recipient {0} already exists")]
    Duplicate(String),
    #[error("recipient {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Invalid(#[from] RecipientError),
    #[error("malformed recipient fields: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("recipient list {path} is unreadable ({reason}); it was left in place")]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Recipient list stored as a JSON array; every change replaces the whole file.
///
/// An invalid file is reported and never moved aside or overwritten, so a broken list
/// keeps failing loudly instead of turning into an empty one.
#[derive(Debug)]
pub struct RecipientRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RecipientRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Result<Vec<Recipient>, RegistryError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(RegistryError::Corrupt {
                    path: self.path.clone(),
                    reason: err.to_string(),
                })
            }
        };
        serde_json::from_str(&text).map_err(|err| {
            warn!(path = %self.path.display(), error = %err, "recipient list is invalid");
            RegistryError::Corrupt {
                path: self.path.clone(),
                reason: err.to_string(),
            }
        })
    }

    pub async fn get(&self, email: &str) -> Result<Option<Recipient>, RegistryError> {
        Ok(self.list().await?.into_iter().find(|r| r.email == email))
    }

    pub async fn add(&self, recipient: Recipient) -> Result<(), RegistryError> {
        recipient.validate()?;
        let _guard = self.write_lock.lock().await;
        let mut recipients = self.list().await?;
        if recipients.iter().any(|r| r.email == recipient.email) {
            warn!(email = %recipient.email, "recipient already exists");
            return Err(RegistryError::Duplicate(recipient.email));
        }
        info!(email = %recipient.email, "adding recipient");
        recipients.push(recipient);
        write_json_atomic(&self.path, &recipients).await?;
        Ok(())
    }

    /// Replace the stored recipient with the same email.
    pub async fn update(&self, recipient: Recipient) -> Result<(), RegistryError> {
        recipient.validate()?;
        let _guard = self.write_lock.lock().await;
        let mut recipients = self.list().await?;
        let Some(slot) = recipients.iter_mut().find(|r| r.email == recipient.email) else {
            return Err(RegistryError::NotFound(recipient.email));
        };
        info!(email = %recipient.email, "updating recipient");
        *slot = recipient;
        write_json_atomic(&self.path, &recipients).await?;
        Ok(())
    }

    /// Overlay `changes` onto the stored recipient; fields not named keep their stored values.
    pub async fn patch(
        &self,
        email: &str,
        changes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Recipient, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut recipients = self.list().await?;
        let Some(slot) = recipients.iter_mut().find(|r| r.email == email) else {
            return Err(RegistryError::NotFound(email.to_string()));
        };
        let mut merged = match serde_json::to_value(&*slot)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        merged.extend(changes);
        merged.insert("email".into(), serde_json::Value::String(email.to_string()));
        let updated: Recipient = serde_json::from_value(serde_json::Value::Object(merged))?;
        updated.validate()?;

        info!(%email, "updating recipient");
        *slot = updated.clone();
        write_json_atomic(&self.path, &recipients).await?;
        Ok(updated)
    }

    pub async fn remove(&self, email: &str) -> Result<Recipient, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut recipients = self.list().await?;
        let Some(index) = recipients.iter().position(|r| r.email == email) else {
            return Err(RegistryError::NotFound(email.to_string()));
        };
        let removed = recipients.remove(index);
        write_json_atomic(&self.path, &recipients).await?;
        info!(%email, "removed recipient");
        Ok(removed)
    }
}

#[derive(Debug, Error)]
#[error("cycle lock {path}: {source}")]
pub struct LockError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    token: Uuid,
    acquired_at: DateTime<Utc>,
}

/// A lock file with no readable owner younger than this belongs to a writer mid-create.
const EMPTY_LOCK_GRACE: Duration = Duration::from_secs(5);

/// Tokens of the guards alive in this process. A lock file carrying our pid with any other
/// token was left by an earlier process that happened to get the same pid.
fn held_tokens() -> &'static std::sync::Mutex<HashSet<Uuid>> {
    static HELD: OnceLock<std::sync::Mutex<HashSet<Uuid>>> = OnceLock::new();
    HELD.get_or_init(Default::default)
}

fn set_token_held(token: Uuid, held: bool) {
    let mut tokens = held_tokens().lock().unwrap_or_else(|e| e.into_inner());
    if held {
        tokens.insert(token);
    } else {
        tokens.remove(&token);
    }
}

fn token_is_held(token: &Uuid) -> bool {
    held_tokens()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Live,
    /// Token of the stale owner, `None` when the file had no readable owner.
    Stale(Option<Uuid>),
}

/// Cross-process single-instance lock backed by a create-new lock file holding the owner PID.
#[derive(Debug, Clone)]
pub struct CycleLock {
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl CycleLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::ZERO,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when a live owner still holds the lock once the timeout elapses.
    pub async fn acquire(&self) -> Result<Option<CycleLockGuard>, LockError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(Some(guard));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn try_acquire(&self) -> Result<Option<CycleLockGuard>, LockError> {
        // Second pass only runs after a stale lock was reclaimed.
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(file) => return self.claim(file).map(Some),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let Holder::Stale(stale_token) = self.inspect_holder() else {
                        return Ok(None);
                    };
                    warn!(path = %self.path.display(), "reclaiming stale cycle lock");
                    if !self.reclaim(stale_token)? {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(self.error(err)),
            }
        }
        Ok(None)
    }

    fn claim(&self, mut file: std::fs::File) -> Result<CycleLockGuard, LockError> {
        let owner = LockOwner {
            pid: std::process::id(),
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        // Registered before the owner is written so no task here mistakes the file for stale.
        set_token_held(owner.token, true);
        let written = serde_json::to_vec(&owner)
            .map_err(io::Error::other)
            .and_then(|bytes| file.write_all(&bytes))
            .and_then(|()| file.sync_all());
        if let Err(source) = written {
            let _ = std::fs::remove_file(&self.path);
            set_token_held(owner.token, false);
            return Err(self.error(source));
        }
        debug!(path = %self.path.display(), pid = owner.pid, "acquired cycle lock");
        Ok(CycleLockGuard {
            path: self.path.clone(),
            token: owner.token,
        })
    }

    fn inspect_holder(&self) -> Holder {
        match read_lock_owner(&self.path) {
            Some(owner) => {
                let alive = if owner.pid == std::process::id() {
                    token_is_held(&owner.token)
                } else {
                    pid_alive(owner.pid)
                };
                if alive {
                    Holder::Live
                } else {
                    Holder::Stale(Some(owner.token))
                }
            }
            None if lock_age(&self.path).is_some_and(|age| age > EMPTY_LOCK_GRACE) => {
                Holder::Stale(None)
            }
            None => Holder::Live,
        }
    }

    /// Move the lock file aside and delete it only if it still holds the owner judged stale.
    ///
    /// Returns false when another contender replaced the stale lock first; its lock is put back.
    fn reclaim(&self, stale_token: Option<Uuid>) -> Result<bool, LockError> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let aside = self
            .path
            .with_file_name(format!(".{name}.reclaim-{}", Uuid::new_v4()));
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(self.error(err)),
        }

        let still_stale = match (stale_token, read_lock_owner(&aside)) {
            (Some(token), Some(owner)) => owner.token == token,
            (None, None) => lock_age(&aside).is_some_and(|age| age > EMPTY_LOCK_GRACE),
            _ => false,
        };
        if still_stale {
            if let Err(err) = std::fs::remove_file(&aside) {
                warn!(path = %aside.display(), error = %err, "could not remove reclaimed lock");
            }
            return Ok(true);
        }

        warn!(path = %self.path.display(), "cycle lock changed hands during reclaim; restoring it");
        // hard_link never replaces a lock another contender created in the meantime.
        let restored = std::fs::hard_link(&aside, &self.path);
        let _ = std::fs::remove_file(&aside);
        if let Err(err) = restored {
            error!(path = %self.path.display(), error = %err, "could not restore cycle lock");
        }
        Ok(false)
    }

    fn error(&self, source: io::Error) -> LockError {
        LockError {
            path: self.path.clone(),
            source,
        }
    }
}

/// Releases the lock file on drop, unless another owner has reclaimed it since.
#[derive(Debug)]
pub struct CycleLockGuard {
    path: PathBuf,
    token: Uuid,
}

impl Drop for CycleLockGuard {
    fn drop(&mut self) {
        match read_lock_owner(&self.path) {
            Some(owner) if owner.token == self.token => {
                if let Err(err) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %err, "failed to release cycle lock");
                }
            }
            _ => warn!(path = %self.path.display(), "cycle lock was reclaimed by another owner"),
        }
        set_token_held(self.token, false);
    }
}

fn read_lock_owner(path: &Path) -> Option<LockOwner> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw listing pages, for inspecting what a cycle actually saw.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_path(&self, content_hash: &str) -> PathBuf {
        let shard = content_hash.get(..2).unwrap_or("00");
        self.root.join(shard).join(format!("{content_hash}.html"))
    }

    pub async fn store_page(&self, bytes: &[u8]) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.page_path(&content_hash);
        let deduplicated = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archived page {}", path.display()))?;
        if !deduplicated {
            write_bytes_atomic(&path, bytes).await?;
        }
        Ok(ArchivedPage {
            content_hash,
            path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Raw `Cookie` header for pages behind a session.
    pub cookie: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            cookie: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

/// reqwest client with exponential backoff on 5xx, 429, timeouts and connect errors.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(cookie) = &config.cookie {
            let mut headers = HeaderMap::new();
            let mut value = HeaderValue::from_str(cookie).context("invalid session cookie header")?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(|| self.client.get(url))
            .instrument(info_span!("http_get", %url))
            .await
    }

    /// POST a JSON body. The URL is kept out of spans since it may embed credentials.
    pub async fn post_json<T: Serialize + ?Sized + Sync>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(|| self.client.post(url).json(body))
            .instrument(info_span!("http_post"))
            .await
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err.without_url(), attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftwatch_core::{snapshot_from_records, JobRecord, Ledger, RunId};
    use tempfile::tempdir;

    fn sample_snapshot() -> Snapshot {
        snapshot_from_records([
            JobRecord::from_listing("Gala", "2024-05-10", "18:00", "London", "Usher", "2/5"),
            JobRecord::from_listing("Expo", "2024-05-11", "09:00", "Leeds", "Host", "5/5 Locked"),
        ])
    }

    fn sample_state(run: &str) -> CheckerState {
        let run_id = RunId::new(run);
        let ledger: Ledger = sample_snapshot()
            .values()
            .filter_map(|r| r.hash())
            .map(|h| (h, run_id.clone()))
            .collect();
        CheckerState {
            last_check_time: None,
            processed_jobs: ledger,
            last_run_id: Some(run_id),
            last_fetch_rows: Some(2),
        }
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn atomic_write_replaces_contents_without_leaving_temps() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.json");
        write_json_atomic(&path, &vec![1, 2]).await.expect("first write");
        write_json_atomic(&path, &vec![3]).await.expect("second write");

        let loaded: Loaded<Vec<u32>> = read_json_or_default(&path).await;
        assert_eq!(loaded.value, vec![3]);
        assert_eq!(loaded.status, LoadStatus::Loaded);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_degrades_to_default_and_is_preserved() {
        let dir = tempdir().expect("tempdir");
        let store = CheckerStore::in_dir(dir.path());
        std::fs::write(store.state_path(), b"{ not json").unwrap();

        let loaded = store.load_state().await;
        assert!(loaded.is_corrupt());
        assert!(loaded.value.processed_jobs.is_empty());
        let LoadStatus::Corrupt { preserved_as: Some(aside), .. } = loaded.status else {
            panic!("expected preserved corrupt file");
        };
        assert_eq!(std::fs::read(aside).unwrap(), b"{ not json");
        assert!(!store.state_path().exists());
    }

    #[tokio::test]
    async fn read_error_leaves_file_in_place() {
        let dir = tempdir().expect("tempdir");
        let store = CheckerStore::in_dir(dir.path());
        std::fs::create_dir(store.state_path()).unwrap();

        let loaded = store.load_state().await;
        assert!(loaded.is_unreadable());
        assert!(!loaded.is_corrupt());
        assert!(store.state_path().is_dir());
        let aside = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(!aside);
    }

    #[tokio::test]
    async fn missing_files_load_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CheckerStore::in_dir(dir.path());
        let jobs = store.load_jobs().await;
        assert_eq!(jobs.status, LoadStatus::Missing);
        assert!(jobs.value.is_empty());
    }

    #[tokio::test]
    async fn commit_writes_both_files_and_removes_journal() {
        let dir = tempdir().expect("tempdir");
        let store = CheckerStore::in_dir(dir.path());
        store
            .commit(&sample_snapshot(), &sample_state("run_1"))
            .await
            .expect("commit");

        assert_eq!(store.load_jobs().await.value, sample_snapshot());
        assert_eq!(store.load_state().await.value, sample_state("run_1"));
        assert!(!dir.path().join(JOURNAL_FILE).exists());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn recover_rolls_decided_commit_forward() {
        let dir = tempdir().expect("tempdir");
        let store = CheckerStore::in_dir(dir.path());
        store.save_jobs(&Snapshot::new()).await.unwrap();
        store.save_state(&CheckerState::default()).await.unwrap();

        // Decided but unapplied: temps and journal written, no renames yet.
        let jobs_temp = store.stage(store.jobs_path(), &serde_json::to_vec(&sample_snapshot()).unwrap()).await.unwrap();
        let state_temp = store.stage(store.state_path(), &serde_json::to_vec(&sample_state("run_2")).unwrap()).await.unwrap();
        let journal = CommitJournal {
            entries: vec![
                JournalEntry { temp: jobs_temp, target: store.jobs_path().to_path_buf() },
                JournalEntry { temp: state_temp, target: store.state_path().to_path_buf() },
            ],
        };
        write_json_atomic(&dir.path().join(JOURNAL_FILE), &journal).await.unwrap();

        assert!(store.recover().await.expect("recover"));
        assert_eq!(store.load_jobs().await.value, sample_snapshot());
        assert_eq!(store.load_state().await.value.last_run_id, Some(RunId::new("run_2")));
        assert!(!dir.path().join(JOURNAL_FILE).exists());
    }

    #[tokio::test]
    async fn recover_without_journal_discards_undecided_temps() {
        let dir = tempdir().expect("tempdir");
        let store = CheckerStore::in_dir(dir.path());
        store.commit(&Snapshot::new(), &sample_state("run_1")).await.unwrap();
        let stray = store.stage(store.jobs_path(), b"{}").await.unwrap();

        assert!(!store.recover().await.expect("recover"));
        assert!(!stray.exists());
        assert_eq!(store.load_state().await.value, sample_state("run_1"));
    }

    #[tokio::test]
    async fn interrupted_commit_is_rolled_forward_once_the_target_is_writable() {
        let dir = tempdir().expect("tempdir");
        let store = CheckerStore::in_dir(dir.path());
        store.commit(&Snapshot::new(), &sample_state("run_1")).await.unwrap();

        // A directory in place of the state file makes its rename fail after the jobs rename.
        std::fs::remove_file(store.state_path()).unwrap();
        std::fs::create_dir(store.state_path()).unwrap();
        let err = store
            .commit(&sample_snapshot(), &sample_state("run_2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Incomplete(_)));
        assert!(dir.path().join(JOURNAL_FILE).exists());

        std::fs::remove_dir(store.state_path()).unwrap();
        assert!(store.recover().await.expect("recover"));
        assert_eq!(store.load_jobs().await.value, sample_snapshot());
        assert_eq!(store.load_state().await.value, sample_state("run_2"));
        assert!(!dir.path().join(JOURNAL_FILE).exists());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn backups_use_timestamped_names() {
        let dir = tempdir().expect("tempdir");
        let store = CheckerStore::in_dir(dir.path());
        store.commit(&sample_snapshot(), &sample_state("run_1")).await.unwrap();
        let written = store.backup("20240510_100000").await.unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("jobs_seen_backup_20240510_100000.json"),
                dir.path().join("job_checker_state_backup_20240510_100000.json"),
            ]
        );
    }

    #[tokio::test]
    async fn registry_rejects_duplicates_and_unknown_emails() {
        let dir = tempdir().expect("tempdir");
        let registry = RecipientRegistry::new(dir.path().join(DEFAULT_RECIPIENTS_FILE));

        registry.add(Recipient::new("a@example.test")).await.expect("add");
        let dup = registry.add(Recipient::new("a@example.test")).await;
        assert!(matches!(dup, Err(RegistryError::Duplicate(_))));
        assert_eq!(registry.list().await.unwrap().len(), 1);

        let mut changed = Recipient::new("a@example.test");
        changed.delay = 5;
        registry.update(changed).await.expect("update");
        assert_eq!(registry.get("a@example.test").await.unwrap().unwrap().delay, 5);

        let missing = registry.update(Recipient::new("b@example.test")).await;
        assert!(matches!(missing, Err(RegistryError::NotFound(_))));
        let invalid = registry.add(Recipient::new("not-an-email")).await;
        assert!(matches!(invalid, Err(RegistryError::Invalid(_))));

        registry.remove("a@example.test").await.expect("remove");
        assert!(registry.list().await.unwrap().is_empty());
        assert!(matches!(
            registry.remove("a@example.test").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_recipient_list_is_reported_and_kept() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_RECIPIENTS_FILE);
        std::fs::write(&path, b"[{\"email\": ").unwrap();
        let registry = RecipientRegistry::new(&path);

        assert!(matches!(registry.list().await, Err(RegistryError::Corrupt { .. })));
        let add = registry.add(Recipient::new("a@example.test")).await;
        assert!(matches!(add, Err(RegistryError::Corrupt { .. })));
        assert_eq!(std::fs::read(&path).unwrap(), b"[{\"email\": ");
    }

    #[tokio::test]
    async fn patch_keeps_fields_it_does_not_name() {
        let dir = tempdir().expect("tempdir");
        let registry = RecipientRegistry::new(dir.path().join(DEFAULT_RECIPIENTS_FILE));
        let mut stored = Recipient::new("a@example.test");
        stored.use_telegram = true;
        stored.telegram_id = "42".into();
        registry.add(stored).await.unwrap();

        let mut changes = serde_json::Map::new();
        changes.insert("delay".into(), serde_json::json!(10));
        changes.insert("email".into(), serde_json::json!("other@example.test"));
        let updated = registry.patch("a@example.test", changes).await.expect("patch");
        assert_eq!(updated.email, "a@example.test");
        assert_eq!(updated.delay, 10);
        assert!(updated.use_telegram);
        assert_eq!(updated.telegram_id, "42");
        assert_eq!(registry.get("a@example.test").await.unwrap(), Some(updated));

        let mut bad = serde_json::Map::new();
        bad.insert("delay".into(), serde_json::json!("soon"));
        assert!(matches!(
            registry.patch("a@example.test", bad).await,
            Err(RegistryError::Malformed(_))
        ));
        let mut no_chat = serde_json::Map::new();
        no_chat.insert("telegram_id".into(), serde_json::json!(""));
        assert!(matches!(
            registry.patch("a@example.test", no_chat).await,
            Err(RegistryError::Invalid(_))
        ));
        assert!(matches!(
            registry.patch("b@example.test", serde_json::Map::new()).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let dir = tempdir().expect("tempdir");
        let lock = CycleLock::new(dir.path().join(DEFAULT_LOCK_FILE));

        let guard = lock.acquire().await.unwrap().expect("first acquire");
        assert!(lock.acquire().await.unwrap().is_none());
        let waited = lock
            .clone()
            .with_timeout(Duration::from_millis(300))
            .acquire()
            .await
            .unwrap();
        assert!(waited.is_none());

        drop(guard);
        assert!(!lock.path().exists());
        assert!(lock.acquire().await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lock_held_by_dead_process_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let lock = CycleLock::new(dir.path().join(DEFAULT_LOCK_FILE));
        let dead = LockOwner {
            pid: i32::MAX as u32,
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        std::fs::write(lock.path(), serde_json::to_vec(&dead).unwrap()).unwrap();

        assert!(lock.acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lock_left_by_earlier_process_with_our_pid_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let lock = CycleLock::new(dir.path().join(DEFAULT_LOCK_FILE));
        let crashed = LockOwner {
            pid: std::process::id(),
            token: Uuid::new_v4(),
            acquired_at: Utc::now() - chrono::Duration::hours(6),
        };
        std::fs::write(lock.path(), serde_json::to_vec(&crashed).unwrap()).unwrap();

        let guard = lock.acquire().await.unwrap().expect("reclaimed");
        assert_ne!(read_lock_owner(lock.path()).unwrap().token, crashed.token);
        assert!(lock.acquire().await.unwrap().is_none());
        drop(guard);
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn reclaim_puts_back_a_lock_that_changed_hands() {
        let dir = tempdir().expect("tempdir");
        let lock = CycleLock::new(dir.path().join(DEFAULT_LOCK_FILE));
        let fresh = LockOwner {
            pid: std::process::id(),
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        std::fs::write(lock.path(), serde_json::to_vec(&fresh).unwrap()).unwrap();

        // The stale owner seen earlier is gone; the file now belongs to someone else.
        assert!(!lock.reclaim(Some(Uuid::new_v4())).unwrap());
        assert_eq!(read_lock_owner(lock.path()).unwrap().token, fresh.token);

        assert!(lock.reclaim(Some(fresh.token)).unwrap());
        assert!(!lock.path().exists());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn page_archive_deduplicates_by_content() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let first = archive.store_page(b"<table></table>").await.unwrap();
        let second = archive.store_page(b"<table></table>").await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.path, second.path);
        assert_eq!(
            PageArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }
}
