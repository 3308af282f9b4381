use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::domain::{ApplicationSnapshot, ProspectId};
use super::trail::AuditRecord;

/// Error enumeration for store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Append-only persistence for decision trails.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist `records` for `prospect_id`. Records whose
    /// [`AuditRecord::idempotency_key`] is already stored must be skipped, so a
    /// re-submitted batch never produces duplicate rows.
    async fn append(
        &self,
        prospect_id: &ProspectId,
        records: &[AuditRecord],
    ) -> Result<(), RepositoryError>;

    async fn trail(&self, prospect_id: &ProspectId) -> Result<Vec<AuditRecord>, RepositoryError>;
}

/// Key space a ban or attempt event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// Keyed by the encrypted ID number.
    Applicant,
    /// Keyed by the raw chassis number.
    Chassis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
    Reject,
    Cancel,
}

/// Historical reject or cancel attempt for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEvent {
    pub scope: LockScope,
    pub subject: String,
    pub kind: LockEventKind,
    pub prospect_id: ProspectId,
    pub occurred_on: NaiveDate,
    /// Full application image; kept for chassis rejects so later attempts can be compared.
    #[serde(default)]
    pub snapshot: Option<ApplicationSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanReason {
    PreviouslyRejected,
    PreviouslyCancelled,
    ChassisAttemptLimit,
    IdenticalResubmission,
}

impl BanReason {
    pub const fn text(self) -> &'static str {
        match self {
            BanReason::PreviouslyRejected => "previously rejected",
            BanReason::PreviouslyCancelled => "previously cancelled",
            BanReason::ChassisAttemptLimit => "chassis attempt limit reached",
            BanReason::IdenticalResubmission => "identical data resubmitted",
        }
    }
}

impl fmt::Display for BanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Persisted ban. Active while `unban_date` is after the evaluation date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub scope: LockScope,
    pub subject: String,
    pub reason: BanReason,
    pub banned_on: NaiveDate,
    pub unban_date: NaiveDate,
}

impl BanRecord {
    pub fn is_active(&self, today: NaiveDate) -> bool {
        self.unban_date > today
    }
}

/// Ban and attempt-history storage consulted by the lock trackers.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Ban on `subject` still active on `today`, if any.
    async fn active_ban(
        &self,
        scope: LockScope,
        subject: &str,
        today: NaiveDate,
    ) -> Result<Option<BanRecord>, RepositoryError>;

    /// Events of `kind` for `subject` that occurred on or after `since`.
    async fn events_since(
        &self,
        scope: LockScope,
        subject: &str,
        kind: LockEventKind,
        since: NaiveDate,
    ) -> Result<Vec<LockEvent>, RepositoryError>;

    async fn save_ban(&self, ban: BanRecord) -> Result<(), RepositoryError>;

    async fn record_event(&self, event: LockEvent) -> Result<(), RepositoryError>;
}
