//! Core domain model for shiftwatch: job identity, the processed-jobs ledger and change sets.

use std::fmt;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "shiftwatch-core";

/// Separator between the six listing fields that make up a [`JobKey`].
pub const JOB_KEY_DELIMITER: char = '\n';

/// Occupancy text containing this marker (ASCII case-insensitive) means no open slots.
pub const LOCKED_MARKER: &str = "locked";

/// Suffix appended to a change message when the job carries a link.
pub const LINK_PREFIX: &str = "\nLink: ";

/// Composite identity of one displayed listing occurrence.
///
/// Field order is title, date, time, location, profession, occupancy and must never change:
/// persisted job stores from earlier runs are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn from_fields(
        title: &str,
        date: &str,
        time: &str,
        location: &str,
        profession: &str,
        occupancy: &str,
    ) -> Self {
        let parts = [title, date, time, location, profession, occupancy];
        Self(parts.join(&JOB_KEY_DELIMITER.to_string()))
    }

    /// Wrap a key read back from a persisted store.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Title, date, time and location recovered from the first four key lines.
    pub fn identity_fields(&self) -> [&str; 4] {
        let mut lines = self.0.split(JOB_KEY_DELIMITER);
        let mut next = || lines.next().unwrap_or("");
        [next(), next(), next(), next()]
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// MD5 over title + date + time + location.
///
/// Occupancy is excluded so a change in fill level keeps the same hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHash(String);

impl JobHash {
    /// Returns `None` when all four identity fields are empty.
    pub fn compute(title: &str, date: &str, time: &str, location: &str) -> Option<Self> {
        if [title, date, time, location].iter().all(|f| f.is_empty()) {
            return None;
        }
        let digest = md5::compute(format!("{title}{date}{time}{location}").as_bytes());
        Some(Self(format!("{digest:x}")))
    }

    pub fn for_record(record: &JobRecord) -> Option<Self> {
        Self::compute(&record.title, &record.date, &record.time, &record.location)
    }

    /// Recompute the hash from a stored key, as maintenance tooling does.
    pub fn for_key(key: &JobKey) -> Option<Self> {
        let [title, date, time, location] = key.identity_fields();
        Self::compute(title, date, time, location)
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one check cycle; stored as the ledger value for traceability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn from_timestamp(ts: NaiveDateTime) -> Self {
        Self(format!("run_{}", ts.format("%Y-%m-%dT%H:%M:%S%.6f")))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scraped listing row plus the values derived from its occupancy text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub title: String,
    pub date: String,
    pub time: String,
    pub location: String,
    pub profession: String,
    pub occupancy: String,
    #[serde(default)]
    pub filled: Option<u32>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, rename = "jobId", alias = "job_id", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl JobRecord {
    pub fn from_listing(
        title: impl Into<String>,
        date: impl Into<String>,
        time: impl Into<String>,
        location: impl Into<String>,
        profession: impl Into<String>,
        occupancy: impl Into<String>,
    ) -> Self {
        let occupancy = occupancy.into();
        let (filled, capacity) = parse_occupancy(&occupancy);
        let locked = is_locked(&occupancy);
        Self {
            title: title.into(),
            date: date.into(),
            time: time.into(),
            location: location.into(),
            profession: profession.into(),
            occupancy,
            filled,
            capacity,
            locked,
            link: None,
            job_id: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey::from_fields(
            &self.title,
            &self.date,
            &self.time,
            &self.location,
            &self.profession,
            &self.occupancy,
        )
    }

    pub fn hash(&self) -> Option<JobHash> {
        JobHash::for_record(self)
    }
}

/// Split occupancy text such as `"3/5"` or `"Filled 3 / 5"` into (filled, capacity).
///
/// Both values stay absent unless digits sit directly on each side of the first `/`.
pub fn parse_occupancy(text: &str) -> (Option<u32>, Option<u32>) {
    let Some((lhs, rhs)) = text.split_once('/') else {
        return (None, None);
    };
    let lhs = lhs.trim_end();
    let filled_digits: String = lhs
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let capacity_digits: String = rhs
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();

    match (filled_digits.parse::<u32>(), capacity_digits.parse::<u32>()) {
        (Ok(filled), Ok(capacity)) => (Some(filled), Some(capacity)),
        _ => (None, None),
    }
}

pub fn is_locked(occupancy: &str) -> bool {
    occupancy.to_ascii_lowercase().contains(LOCKED_MARKER)
}

/// Mapping of every listing seen in one scrape, in scrape order.
pub type Snapshot = IndexMap<JobKey, JobRecord>;

/// Build a snapshot keyed by each record's [`JobKey`]; duplicate keys keep the last record.
pub fn snapshot_from_records(records: impl IntoIterator<Item = JobRecord>) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for record in records {
        snapshot.insert(record.key(), record);
    }
    snapshot
}

/// Processed-jobs ledger: JobHash -> RunId of the cycle that first reported it.
///
/// Recording is idempotent and the first run id always wins. Entries only leave through
/// [`Ledger::forget`], which is reserved for maintenance tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger(IndexMap<JobHash, RunId>);

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &JobHash) -> bool {
        self.0.contains_key(hash)
    }

    pub fn get(&self, hash: &JobHash) -> Option<&RunId> {
        self.0.get(hash)
    }

    /// Returns true when the hash was not present before.
    pub fn record(&mut self, hash: JobHash, run_id: &RunId) -> bool {
        if self.0.contains_key(&hash) {
            return false;
        }
        self.0.insert(hash, run_id.clone());
        true
    }

    pub fn merge(&mut self, other: Ledger) {
        for (hash, run_id) in other.0 {
            self.record(hash, &run_id);
        }
    }

    pub fn forget(&mut self, hash: &JobHash) -> Option<RunId> {
        self.0.shift_remove(hash)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobHash, &RunId)> {
        self.0.iter()
    }
}

impl FromIterator<(JobHash, RunId)> for Ledger {
    fn from_iter<I: IntoIterator<Item = (JobHash, RunId)>>(iter: I) -> Self {
        let mut ledger = Ledger::new();
        for (hash, run_id) in iter {
            ledger.record(hash, &run_id);
        }
        ledger
    }
}

/// Persisted checker state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckerState {
    #[serde(default)]
    pub last_check_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub processed_jobs: Ledger,
    #[serde(default)]
    pub last_run_id: Option<RunId>,
    /// Row count of the last snapshot committed by a successful cycle.
    #[serde(default)]
    pub last_fetch_rows: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeCategory {
    New,
    Reopened,
    SpotFreed,
}

impl ChangeCategory {
    /// Fixed presentation order.
    pub const ALL: [ChangeCategory; 3] = [Self::New, Self::Reopened, Self::SpotFreed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reopened => "reopened",
            Self::SpotFreed => "spotfreed",
        }
    }
}

/// Human-readable messages produced by one diff, grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub new: Vec<String>,
    pub reopened: Vec<String>,
    pub spotfreed: Vec<String>,
}

impl ChangeSet {
    pub fn messages(&self, category: ChangeCategory) -> &[String] {
        match category {
            ChangeCategory::New => &self.new,
            ChangeCategory::Reopened => &self.reopened,
            ChangeCategory::SpotFreed => &self.spotfreed,
        }
    }

    pub fn push(&mut self, category: ChangeCategory, message: String) {
        match category {
            ChangeCategory::New => self.new.push(message),
            ChangeCategory::Reopened => self.reopened.push(message),
            ChangeCategory::SpotFreed => self.spotfreed.push(message),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.reopened.is_empty() && self.spotfreed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.new.len() + self.reopened.len() + self.spotfreed.len()
    }
}

pub fn append_link(message: String, link: Option<&str>) -> String {
    match link {
        Some(link) if !link.is_empty() => format!("{message}{LINK_PREFIX}{link}"),
        _ => message,
    }
}

pub fn strip_link(message: &str) -> &str {
    match message.split_once(LINK_PREFIX) {
        Some((head, _)) => head,
        None => message,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecipientError {
    #[error("invalid email address: {0:?}")]
    InvalidEmail(String),
    #[error("recipient {0} enables telegram without a telegram id")]
    MissingTelegramId(String),
}

fn default_true() -> bool {
    true
}

/// Notification preferences for one recipient, keyed by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default, alias = "telegram_chat_id")]
    pub telegram_id: String,
    /// Minutes to wait before sending to this recipient.
    #[serde(default)]
    pub delay: u64,
    #[serde(default = "default_true")]
    pub notify_new: bool,
    #[serde(default = "default_true")]
    pub notify_reopened: bool,
    #[serde(default = "default_true")]
    pub notify_spotfreed: bool,
    #[serde(default)]
    pub use_telegram: bool,
    #[serde(default = "default_true")]
    pub use_email: bool,
    #[serde(default = "default_true")]
    pub receive_job_links: bool,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            telegram_id: String::new(),
            delay: 0,
            notify_new: true,
            notify_reopened: true,
            notify_spotfreed: true,
            use_telegram: false,
            use_email: true,
            receive_job_links: true,
        }
    }

    pub fn validate(&self) -> Result<(), RecipientError> {
        if !self.email.contains('@') {
            return Err(RecipientError::InvalidEmail(self.email.clone()));
        }
        if self.use_telegram && self.telegram_id.trim().is_empty() {
            return Err(RecipientError::MissingTelegramId(self.email.clone()));
        }
        Ok(())
    }

    pub fn wants(&self, category: ChangeCategory) -> bool {
        match category {
            ChangeCategory::New => self.notify_new,
            ChangeCategory::Reopened => self.notify_reopened,
            ChangeCategory::SpotFreed => self.notify_spotfreed,
        }
    }

    pub fn has_channel(&self) -> bool {
        self.use_email || self.use_telegram
    }

    pub fn telegram_destination(&self) -> Option<&str> {
        let id = self.telegram_id.trim();
        (self.use_telegram && !id.is_empty()).then_some(id)
    }
}

/// Last terminal state of the check cycle, exposed for polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}
