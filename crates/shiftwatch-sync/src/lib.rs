//! Check cycle orchestration: the job diff engine, cycle status, maintenance and scheduling.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use shiftwatch_adapters::{FileTableSource, HttpTableSource, JobSource, DEFAULT_SOURCE_URL};
use shiftwatch_core::{
    append_link, ChangeCategory, ChangeSet, CheckerState, CycleStatus, JobHash, JobKey, Ledger,
    Recipient, RunId, Snapshot,
};
use shiftwatch_notify::{DispatchReport, Dispatcher, NotificationSink, OperatorAlert};
use shiftwatch_storage::{
    CheckerStore, CommitError, CycleLock, HttpClient, HttpClientConfig, LoadStatus, LockError,
    PageArchive, RecipientRegistry, DEFAULT_JOBS_FILE, DEFAULT_LOCK_FILE, DEFAULT_RECIPIENTS_FILE,
    DEFAULT_STATE_FILE,
};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "shiftwatch-sync";

pub const DEFAULT_CHECK_CRON: &str = "0 */5 * * * *";

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub data_dir: PathBuf,
    pub jobs_file: PathBuf,
    pub state_file: PathBuf,
    pub recipients_file: PathBuf,
    pub lock_file: PathBuf,
    pub lock_timeout_secs: u64,
    pub source_url: String,
    /// Saved listing page read instead of fetching `source_url`.
    pub source_file: Option<PathBuf>,
    pub session_cookie: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub archive_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub check_cron: String,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

impl CheckerConfig {
    /// Defaults with every file placed in `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            jobs_file: data_dir.join(DEFAULT_JOBS_FILE),
            state_file: data_dir.join(DEFAULT_STATE_FILE),
            recipients_file: data_dir.join(DEFAULT_RECIPIENTS_FILE),
            lock_file: data_dir.join(DEFAULT_LOCK_FILE),
            data_dir,
            lock_timeout_secs: 0,
            source_url: DEFAULT_SOURCE_URL.to_string(),
            source_file: None,
            session_cookie: None,
            user_agent: "shiftwatch/0.1".to_string(),
            http_timeout_secs: 30,
            archive_dir: None,
            scheduler_enabled: false,
            check_cron: DEFAULT_CHECK_CRON.to_string(),
        }
    }

    pub fn from_env() -> Self {
        let base = Self::in_dir(env_path("SHIFTWATCH_DATA_DIR").unwrap_or_else(|| PathBuf::from(".")));
        Self {
            jobs_file: env_path("SHIFTWATCH_JOBS_FILE").unwrap_or(base.jobs_file),
            state_file: env_path("SHIFTWATCH_STATE_FILE").unwrap_or(base.state_file),
            recipients_file: env_path("SHIFTWATCH_RECIPIENTS_FILE").unwrap_or(base.recipients_file),
            lock_file: env_path("SHIFTWATCH_LOCK_FILE").unwrap_or(base.lock_file),
            lock_timeout_secs: env_string("SHIFTWATCH_LOCK_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.lock_timeout_secs),
            source_url: env_string("SHIFTWATCH_SOURCE_URL").unwrap_or(base.source_url),
            source_file: env_path("SHIFTWATCH_SOURCE_FILE"),
            session_cookie: env_string("SHIFTWATCH_SESSION_COOKIE"),
            user_agent: env_string("SHIFTWATCH_USER_AGENT").unwrap_or(base.user_agent),
            http_timeout_secs: env_string("SHIFTWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.http_timeout_secs),
            archive_dir: env_path("SHIFTWATCH_ARCHIVE_DIR"),
            scheduler_enabled: std::env::var("SHIFTWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            check_cron: env_string("SHIFTWATCH_CHECK_CRON").unwrap_or(base.check_cron),
            data_dir: base.data_dir,
        }
    }

    pub fn store(&self) -> CheckerStore {
        CheckerStore::new(self.jobs_file.clone(), self.state_file.clone())
    }

    pub fn registry(&self) -> RecipientRegistry {
        RecipientRegistry::new(self.recipients_file.clone())
    }

    pub fn cycle_lock(&self) -> CycleLock {
        CycleLock::new(self.lock_file.clone()).with_timeout(Duration::from_secs(self.lock_timeout_secs))
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            cookie: self.session_cookie.clone(),
            ..Default::default()
        }
    }

    pub fn build_source(&self) -> Result<Arc<dyn JobSource>> {
        if let Some(path) = &self.source_file {
            info!(path = %path.display(), "reading listings from file");
            let source = FileTableSource::new(path.clone()).with_base_url(&self.source_url);
            return Ok(Arc::new(source));
        }
        let http = HttpClient::new(self.http_config()).context("building listing http client")?;
        let mut source = HttpTableSource::new(http, self.source_url.clone());
        if let Some(dir) = &self.archive_dir {
            source = source.with_archive(PageArchive::new(dir.clone()));
        }
        Ok(Arc::new(source))
    }
}

/// Per-category counts from one diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub new: usize,
    pub reopened: usize,
    pub spotfreed: usize,
    /// Jobs whose hash was already in the ledger.
    pub suppressed: usize,
    /// Degenerate records with no identity fields.
    pub skipped: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone)]
pub struct DiffOutcome {
    pub changes: ChangeSet,
    pub ledger: Ledger,
    pub report: DiffReport,
}

fn count_or_unknown(value: Option<u32>) -> String {
    value.map_or_else(|| "?".to_string(), |v| v.to_string())
}

/// Classify every job in `current` against `previous` and the processed-jobs ledger.
///
/// A hash already in the ledger is skipped outright, whatever changed since. Each hash that
/// fires gains exactly one ledger entry, even when it is both reopened and spot-freed.
pub fn diff(current: &Snapshot, previous: &Snapshot, mut ledger: Ledger, run_id: &RunId) -> DiffOutcome {
    let mut changes = ChangeSet::default();
    let mut report = DiffReport::default();

    for (key, record) in current {
        let Some(hash) = record.hash() else {
            warn!(%key, "job has no title, date, time or location; skipping");
            report.skipped += 1;
            continue;
        };
        if ledger.contains(&hash) {
            report.suppressed += 1;
            continue;
        }

        let link = record.link.as_deref();
        let Some(prev) = previous.get(key) else {
            info!(title = %record.title, "found new job");
            changes.push(ChangeCategory::New, append_link(format!("New shift/job: {key}"), link));
            ledger.record(hash, run_id);
            report.new += 1;
            continue;
        };

        let mut fired = false;
        if prev.locked && !record.locked {
            info!(title = %record.title, "found reopened job");
            changes.push(ChangeCategory::Reopened, append_link(format!("Re-opened: {key}"), link));
            report.reopened += 1;
            fired = true;
        }
        if let (Some(prev_filled), Some(filled)) = (prev.filled, record.filled) {
            if filled < prev_filled && !record.locked {
                info!(title = %record.title, "found job with freed spot");
                let message = format!(
                    "Spot freed: {key} (was {prev_filled}/{}, now {filled}/{})",
                    count_or_unknown(prev.capacity),
                    count_or_unknown(record.capacity),
                );
                changes.push(ChangeCategory::SpotFreed, append_link(message, link));
                report.spotfreed += 1;
                fired = true;
            }
        }

        if fired {
            ledger.record(hash, run_id);
        } else {
            report.unchanged += 1;
        }
    }

    DiffOutcome {
        changes,
        ledger,
        report,
    }
}

/// Polling view of the most recent cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSnapshot {
    pub status: CycleStatus,
    pub last_run_id: Option<RunId>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    pub message: Option<String>,
    pub report: Option<DiffReport>,
}

/// Shared cycle status; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CycleTracker {
    inner: Arc<Mutex<CycleSnapshot>>,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CycleSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.snapshot().status == CycleStatus::Running
    }

    fn update(&self, apply: impl FnOnce(&mut CycleSnapshot)) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut *guard);
    }

    pub fn begin(&self, run_id: &RunId) {
        self.update(|s| {
            s.status = CycleStatus::Running;
            s.last_run_id = Some(run_id.clone());
            s.started_at = Some(Local::now());
            s.finished_at = None;
            s.message = None;
            s.report = None;
        });
    }

    pub fn succeed(&self, report: DiffReport, message: impl Into<String>) {
        self.update(|s| {
            s.status = CycleStatus::Success;
            s.finished_at = Some(Local::now());
            s.message = Some(message.into());
            s.report = Some(report);
        });
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.update(|s| {
            s.status = CycleStatus::Error;
            s.finished_at = Some(Local::now());
            s.message = Some(message.into());
        });
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("another check cycle is already running")]
    AlreadyRunning,
    #[error("listing source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("persisting cycle results failed: {0}")]
    Persistence(String),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub run_id: RunId,
    pub changes: ChangeSet,
    pub report: DiffReport,
    pub dispatch: Option<DispatchReport>,
    pub recovered_commit: bool,
    pub corrupt_inputs: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("number of jobs to remove must be at least 1")]
    ZeroCount,
    #[error("a check cycle is running; try again once it finishes")]
    Busy,
    #[error("{0} is unreadable; it was set aside and nothing was changed")]
    Corrupt(PathBuf),
    #[error("{0} could not be read; nothing was changed")]
    Unreadable(PathBuf),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

fn check_loaded(status: &LoadStatus, path: &Path) -> Result<(), MaintenanceError> {
    match status {
        LoadStatus::Corrupt { .. } => Err(MaintenanceError::Corrupt(path.to_path_buf())),
        LoadStatus::Unreadable { .. } => Err(MaintenanceError::Unreadable(path.to_path_buf())),
        LoadStatus::Loaded | LoadStatus::Missing => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub removed_keys: Vec<JobKey>,
    pub ledger_entries_removed: usize,
    pub backups: Vec<PathBuf>,
}

/// The two fixed jobs sent by [`Checker::test_notification`].
pub fn test_change_set() -> ChangeSet {
    let mut changes = ChangeSet::default();
    for key in [
        JobKey::from_fields("Test Job 1", "2024-05-10", "10:00-18:00", "London", "Actor", "Full"),
        JobKey::from_fields("Test Job 2", "2024-05-11", "14:00-22:00", "Manchester", "Dancer", "Part"),
    ] {
        changes.push(ChangeCategory::New, format!("New shift/job: {key}"));
    }
    changes
}

/// Everything one check cycle touches, shared by the scheduler, the web console and the CLI.
pub struct Checker {
    store: CheckerStore,
    registry: Arc<RecipientRegistry>,
    lock: CycleLock,
    source: Arc<dyn JobSource>,
    dispatcher: Dispatcher,
    alert: Arc<dyn OperatorAlert>,
    tracker: CycleTracker,
}

impl Checker {
    pub fn new(
        store: CheckerStore,
        registry: Arc<RecipientRegistry>,
        lock: CycleLock,
        source: Arc<dyn JobSource>,
        dispatcher: Dispatcher,
        alert: Arc<dyn OperatorAlert>,
    ) -> Self {
        Self {
            store,
            registry,
            lock,
            source,
            dispatcher,
            alert,
            tracker: CycleTracker::new(),
        }
    }

    pub fn from_config(
        config: &CheckerConfig,
        sink: Arc<dyn NotificationSink>,
        alert: Arc<dyn OperatorAlert>,
    ) -> Result<Self> {
        Ok(Self::new(
            config.store(),
            Arc::new(config.registry()),
            config.cycle_lock(),
            config.build_source()?,
            Dispatcher::new(sink),
            alert,
        ))
    }

    pub fn with_tracker(mut self, tracker: CycleTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &CycleTracker {
        &self.tracker
    }

    pub fn registry(&self) -> Arc<RecipientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn store(&self) -> &CheckerStore {
        &self.store
    }

    /// One scrape, diff, notify and commit pass under the cycle lock.
    pub async fn run(&self) -> Result<CycleOutcome, CycleError> {
        let guard = match self.lock.acquire().await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                warn!("another check cycle is already running");
                return Err(CycleError::AlreadyRunning);
            }
            Err(err) => {
                self.alert.alert("Cycle lock unavailable", &err.to_string()).await;
                self.tracker.fail(err.to_string());
                return Err(err.into());
            }
        };

        let now = Local::now().naive_local();
        let run_id = RunId::from_timestamp(now);
        self.tracker.begin(&run_id);

        let span = info_span!("check_cycle", run_id = %run_id);
        let result = self.run_locked(run_id, now).instrument(span).await;
        drop(guard);

        match &result {
            Ok(outcome) => self.tracker.succeed(
                outcome.report,
                format!(
                    "{} new, {} reopened, {} spots freed",
                    outcome.report.new, outcome.report.reopened, outcome.report.spotfreed
                ),
            ),
            Err(err) => self.tracker.fail(err.to_string()),
        }
        result
    }

    async fn run_locked(&self, run_id: RunId, now: NaiveDateTime) -> Result<CycleOutcome, CycleError> {
        let recovered_commit = match self.store.recover().await {
            Ok(recovered) => recovered,
            Err(err) => {
                let detail = format!("{err:#}");
                self.alert.alert("Commit journal recovery failed", &detail).await;
                return Err(CycleError::Persistence(detail));
            }
        };

        let jobs = self.store.load_jobs().await;
        let state = self.store.load_state().await;
        let mut corrupt_inputs = Vec::new();
        for (path, status) in [
            (self.store.jobs_path(), &jobs.status),
            (self.store.state_path(), &state.status),
        ] {
            if let LoadStatus::Unreadable { reason } = status {
                let detail = format!("{} could not be read ({reason}); it was left in place", path.display());
                self.alert.alert("Persisted file unreadable", &detail).await;
                return Err(CycleError::Persistence(detail));
            }
            if let LoadStatus::Corrupt { reason, preserved_as } = status {
                let kept = preserved_as
                    .as_ref()
                    .map_or_else(|| "not preserved".to_string(), |p| p.display().to_string());
                let detail = format!(
                    "{} could not be read ({reason}); treating it as empty. Original kept at: {kept}",
                    path.display()
                );
                self.alert.alert("Persisted file corrupt", &detail).await;
                corrupt_inputs.push(path.to_path_buf());
            }
        }
        let previous = jobs.value;
        let mut state: CheckerState = state.value;

        let current = match self.source.fetch_snapshot().await {
            Ok(snapshot) if snapshot.is_empty() => {
                let detail = format!(
                    "source {} returned no listings; last successful fetch had {} rows",
                    self.source.source_id(),
                    state
                        .last_fetch_rows
                        .map_or_else(|| "unknown".to_string(), |n| n.to_string())
                );
                self.alert.alert("Listing source returned nothing", &detail).await;
                return Err(CycleError::SourceUnavailable(detail));
            }
            Ok(snapshot) => snapshot,
            Err(err) => {
                let detail = err.to_string();
                self.alert.alert("Listing source unavailable", &detail).await;
                return Err(CycleError::SourceUnavailable(detail));
            }
        };
        info!(previous = previous.len(), current = current.len(), "loaded snapshots");

        let DiffOutcome {
            changes,
            ledger,
            report,
        } = diff(&current, &previous, std::mem::take(&mut state.processed_jobs), &run_id);
        info!(
            new = report.new,
            reopened = report.reopened,
            spotfreed = report.spotfreed,
            suppressed = report.suppressed,
            "diff complete"
        );

        let dispatch = if changes.is_empty() {
            info!("no updates to send");
            None
        } else {
            // Nothing is committed without a usable recipient list, so these changes stay pending.
            let recipients = match self.registry.list().await {
                Ok(recipients) => recipients,
                Err(err) => {
                    let detail = err.to_string();
                    self.alert.alert("Recipient list unreadable", &detail).await;
                    return Err(CycleError::Persistence(detail));
                }
            };
            Some(self.dispatcher.dispatch(&changes, &recipients).await)
        };

        state.processed_jobs = ledger;
        state.last_check_time = Some(now);
        state.last_run_id = Some(run_id.clone());
        state.last_fetch_rows = Some(current.len());
        if let Err(err) = self.store.commit(&current, &state).await {
            let detail = err.to_string();
            self.alert.alert("Saving checker state failed", &detail).await;
            return Err(CycleError::Persistence(detail));
        }
        info!("check cycle completed");

        Ok(CycleOutcome {
            run_id,
            changes,
            report,
            dispatch,
            recovered_commit,
            corrupt_inputs,
        })
    }

    /// Resend without ledger gating; nothing is persisted.
    ///
    /// With `force_all` every current job is sent as `Current job: {key}`.
    pub async fn resend_last_update(&self, force_all: bool) -> Result<Option<DispatchReport>, CycleError> {
        let previous = self.store.load_jobs().await.value;
        let current = self
            .source
            .fetch_snapshot()
            .await
            .map_err(|err| CycleError::SourceUnavailable(err.to_string()))?;

        let changes = if force_all {
            let mut changes = ChangeSet::default();
            for (key, record) in &current {
                changes.push(
                    ChangeCategory::New,
                    append_link(format!("Current job: {key}"), record.link.as_deref()),
                );
            }
            changes
        } else {
            let run_id = RunId::from_timestamp(Local::now().naive_local());
            diff(&current, &previous, Ledger::new(), &run_id).changes
        };

        if changes.is_empty() {
            info!("no updates to resend");
            return Ok(None);
        }
        info!(messages = changes.total(), "resending job updates to all recipients");
        let recipients = self.recipients().await?;
        Ok(Some(self.dispatcher.dispatch(&changes, &recipients).await))
    }

    pub async fn test_notification(&self) -> Result<DispatchReport, CycleError> {
        info!("sending test notifications");
        let recipients = self.recipients().await?;
        Ok(self.dispatch_to(&test_change_set(), &recipients).await)
    }

    async fn recipients(&self) -> Result<Vec<Recipient>, CycleError> {
        self.registry
            .list()
            .await
            .map_err(|err| CycleError::Persistence(err.to_string()))
    }

    pub async fn dispatch_to(&self, changes: &ChangeSet, recipients: &[Recipient]) -> DispatchReport {
        self.dispatcher.dispatch(changes, recipients).await
    }

    /// Remove the `count` greatest Job Store keys and the ledger entries recomputed from them.
    ///
    /// Both files are backed up first. Keys sort lexicographically, so "most recent" means the
    /// greatest title-first key, not the newest date.
    pub async fn remove_recent_jobs(&self, count: usize) -> Result<RemovalReport, MaintenanceError> {
        if count == 0 {
            return Err(MaintenanceError::ZeroCount);
        }
        let Some(_guard) = self.lock.acquire().await? else {
            return Err(MaintenanceError::Busy);
        };
        self.store.recover().await?;

        let jobs = self.store.load_jobs().await;
        check_loaded(&jobs.status, self.store.jobs_path())?;
        let state = self.store.load_state().await;
        check_loaded(&state.status, self.store.state_path())?;
        let mut jobs = jobs.value;
        let mut state = state.value;
        if jobs.is_empty() {
            info!("no jobs in the job store");
            return Ok(RemovalReport::default());
        }

        let mut keys: Vec<JobKey> = jobs.keys().cloned().collect();
        keys.sort_by(|a, b| b.cmp(a));
        keys.truncate(count);

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let backups = self.store.backup(&stamp).await?;
        info!(backups = ?backups, "created backups");

        let mut ledger_entries_removed = 0;
        for key in &keys {
            jobs.shift_remove(key);
            info!(%key, "removed job from job store");
            if let Some(hash) = JobHash::for_key(key) {
                if state.processed_jobs.forget(&hash).is_some() {
                    info!(%hash, "removed hash from ledger");
                    ledger_entries_removed += 1;
                }
            }
        }

        self.store.commit(&jobs, &state).await?;
        info!(jobs = keys.len(), ledger_entries_removed, "removed recent jobs");
        Ok(RemovalReport {
            removed_keys: keys,
            ledger_entries_removed,
            backups,
        })
    }
}

/// Build the cron job that runs [`Checker::run`], or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    checker: Arc<Checker>,
    config: &CheckerConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.check_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let checker = Arc::clone(&checker);
        Box::pin(async move {
            match checker.run().await {
                Ok(outcome) => info!(run_id = %outcome.run_id, "scheduled check finished"),
                Err(CycleError::AlreadyRunning) => info!("scheduled check skipped; cycle already running"),
                Err(err) => error!(error = %err, "scheduled check failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(%cron, "check scheduler configured");
    Ok(Some(sched))
}

/// Data directory paths exposed for status display.
pub fn describe_paths(config: &CheckerConfig) -> Vec<(&'static str, &Path)> {
    vec![
        ("jobs", config.jobs_file.as_path()),
        ("state", config.state_file.as_path()),
        ("recipients", config.recipients_file.as_path()),
        ("lock", config.lock_file.as_path()),
    ]
}
