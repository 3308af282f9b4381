//! Ports to the external collaborators the pipeline consults, plus the call guard
//! that bounds every external call by a timeout and the run's cancellation signal.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::domain::{ApplicantRecord, DupcheckRecord, LookupSubject};
use super::repository::LockStore;

/// Failure reaching an external provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} did not answer before the deadline")]
    Timeout { provider: String },
    #[error("{provider} responded with status {status}")]
    Status { provider: String, status: u16 },
    #[error("{provider} returned an unreadable payload: {message}")]
    Malformed { provider: String, message: String },
    #[error("run cancelled before calling {provider}")]
    Cancelled { provider: String },
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Timeout { provider }
            | ProviderError::Status { provider, .. }
            | ProviderError::Malformed { provider, .. }
            | ProviderError::Cancelled { provider } => provider,
        }
    }
}

/// Caller-owned cancellation flag for one run.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Issue one external call: refuse if the run is cancelled, otherwise bound it by `timeout`.
pub async fn call_provider<T, F>(
    provider: &str,
    timeout: Duration,
    cancel: &CancelSignal,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled {
            provider: provider.to_string(),
        });
    }

    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            provider: provider.to_string(),
        }),
    }
}

/// Customer-history lookup. A customer with no history is `Ok(None)`, never an error.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn lookup_customer(
        &self,
        subject: &LookupSubject<'_>,
    ) -> Result<Option<DupcheckRecord>, ProviderError>;
}

/// Installment source queried by the DSR aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductLine {
    OfflineTwoWheel,
    OfflineFourWheel,
    Online,
    CrossProduct,
}

impl ProductLine {
    pub const ALL: [ProductLine; 4] = [
        ProductLine::OfflineTwoWheel,
        ProductLine::OfflineFourWheel,
        ProductLine::Online,
        ProductLine::CrossProduct,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            ProductLine::OfflineTwoWheel => "offline_two_wheel",
            ProductLine::OfflineFourWheel => "offline_four_wheel",
            ProductLine::Online => "online",
            ProductLine::CrossProduct => "cross_product",
        }
    }
}

#[async_trait]
pub trait InstallmentProvider: Send + Sync {
    /// Monthly installment the person currently pays on `line`.
    async fn scan(
        &self,
        line: ProductLine,
        subject: &LookupSubject<'_>,
    ) -> Result<f64, ProviderError>;

    /// Installment of an active cross-product top-up agreement, if one exists.
    async fn top_up_installment(
        &self,
        subject: &LookupSubject<'_>,
    ) -> Result<Option<f64>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgreementStatus {
    Active,
    Closed,
}

/// Agreement a chassis number is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementRecord {
    pub agreement_number: String,
    pub owner_id_number: String,
    pub engine_number: String,
    pub status: AgreementStatus,
}

#[async_trait]
pub trait ChassisRegistry: Send + Sync {
    async fn lookup_agreement(
        &self,
        chassis_number: &str,
    ) -> Result<Option<AgreementRecord>, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub matched: bool,
    #[serde(default)]
    pub similarity: Option<f64>,
    #[serde(default)]
    pub detail: String,
}

/// Identity verification provider. The pipeline holds several, tried in order.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    fn name(&self) -> &str;

    async fn verify(&self, applicant: &ApplicantRecord)
        -> Result<VerificationResult, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BureauReport {
    /// 1 (current) to 5 (loss).
    pub worst_collectability: u8,
    pub max_overdue_days: u32,
    pub total_outstanding: f64,
    pub active_facilities: u32,
}

#[async_trait]
pub trait CreditBureau: Send + Sync {
    async fn query(&self, applicant: &ApplicantRecord) -> Result<BureauReport, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub score: f64,
    pub band: String,
}

#[async_trait]
pub trait BehavioralScorer: Send + Sync {
    async fn score(
        &self,
        applicant: &ApplicantRecord,
        report: Option<&BureauReport>,
    ) -> Result<ScoreResult, ProviderError>;
}

/// Every collaborator a standard pipeline needs.
#[derive(Clone)]
pub struct ProviderSet {
    pub history: Arc<dyn HistoryProvider>,
    pub installments: Arc<dyn InstallmentProvider>,
    pub chassis: Arc<dyn ChassisRegistry>,
    /// Primary first; later verifiers are only tried when earlier ones fail.
    pub identity: Vec<Arc<dyn IdentityVerifier>>,
    pub bureau: Arc<dyn CreditBureau>,
    pub scorer: Arc<dyn BehavioralScorer>,
    pub locks: Arc<dyn LockStore>,
}
