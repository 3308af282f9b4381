//! Rule evaluators for every pipeline stage.
//!
//! Each stage consumes the immutable application and threshold snapshot plus the
//! run's [`DecisionContext`], and returns a typed [`StageResult`] whose verdict comes
//! from the stage's static code table. Provider and persistence failures are errors,
//! never verdicts.

pub mod customer;
pub mod dsr;
pub mod elaborate;
pub mod lock;
pub mod pmk;
pub mod vehicle;
pub mod verification;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::config::PipelineSettings;

use super::domain::{
    CustomerStatus, CustomerType, DupcheckRecord, LoanApplication, RuleCode, StageResult,
};
use super::providers::{
    call_provider, BureauReport, CancelSignal, ProviderError, ProviderSet, ScoreResult,
};
use super::repository::RepositoryError;
use super::thresholds::ThresholdSnapshot;
use super::trail::StageId;

pub use customer::{classify_and_screen, classify_customer, BlacklistStage, DupcheckStage};
pub use dsr::{compute_dsr, DsrInputs, DsrStage};
pub use elaborate::ElaborateStage;
pub use lock::{check_chassis_attempts, check_lock, LockState, LockSystemStage};
pub use pmk::{evaluate_policy, human_age, PmkStage, PolicyFacts};
pub use vehicle::{ChassisFraudStage, VehicleAgeStage};
pub use verification::{BureauStage, EkycStage, ScoringStage};

/// Failure that aborts a run. Business rejections are never errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Persistence(#[from] RepositoryError),
}

/// Read-only inputs shared by every stage of one run.
pub struct StageInput<'a> {
    pub application: &'a LoanApplication,
    pub thresholds: &'a ThresholdSnapshot,
    pub settings: &'a PipelineSettings,
    pub cancel: &'a CancelSignal,
}

impl StageInput<'_> {
    /// Guard one external call with the run's timeout and cancellation signal.
    pub async fn call<T, F>(&self, provider: &str, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        call_provider(provider, self.settings.provider_timeout, self.cancel, call).await
    }
}

/// Installment figures feeding the DSR formula.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstallmentTotals {
    pub own: f64,
    pub other_applicant: f64,
    pub other_spouse: f64,
    pub cross_product_applicant: f64,
    pub cross_product_spouse: f64,
    /// Top-up installment subtracted from the applicant's cross-product figure.
    pub top_up_reduction: f64,
}

/// Mutable accumulator owned by the orchestrator for exactly one run.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionContext {
    pub evaluated_on: NaiveDate,
    pub applicant_history: Option<DupcheckRecord>,
    pub spouse_history: Option<DupcheckRecord>,
    pub customer_status: CustomerStatus,
    pub spouse_status: Option<CustomerStatus>,
    pub customer_type: CustomerType,
    pub installments: InstallmentTotals,
    pub dsr_percent: Option<f64>,
    /// Worst overdue days seen across the household's history.
    pub max_overdue_days: u32,
    pub bureau: Option<BureauReport>,
    pub score: Option<ScoreResult>,
    pub exposure: f64,
    pub contingency: bool,
}

impl DecisionContext {
    pub fn new(evaluated_on: NaiveDate) -> Self {
        Self {
            evaluated_on,
            applicant_history: None,
            spouse_history: None,
            customer_status: CustomerStatus::New,
            spouse_status: None,
            customer_type: CustomerType::Clean,
            installments: InstallmentTotals::default(),
            dsr_percent: None,
            max_overdue_days: 0,
            bureau: None,
            score: None,
            exposure: 0.0,
            contingency: false,
        }
    }

    /// Reason text for a rule evaluated after classification.
    pub fn result(
        &self,
        stage: StageId,
        rule: RuleCode,
        detail: impl std::fmt::Display,
    ) -> StageResult {
        StageResult::with_status(stage, rule, self.customer_status, detail)
    }
}

/// Result of one stage plus the stage-specific detail stored as the record's `info`.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub result: StageResult,
    pub info: serde_json::Value,
}

impl StageOutcome {
    pub fn new(result: StageResult, info: serde_json::Value) -> Self {
        Self { result, info }
    }
}

/// One node of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError>;
}

/// Build the standard evaluator for `stage` from the provider set.
pub fn standard_stage(stage: StageId, providers: &ProviderSet) -> Arc<dyn Stage> {
    match stage {
        StageId::LockSystem => Arc::new(LockSystemStage::new(providers.locks.clone())),
        StageId::Dupcheck => Arc::new(DupcheckStage::new(providers.history.clone())),
        StageId::Blacklist => Arc::new(BlacklistStage),
        StageId::VehicleAge => Arc::new(VehicleAgeStage),
        StageId::ChassisFraud => Arc::new(ChassisFraudStage::new(providers.chassis.clone())),
        StageId::Pmk => Arc::new(PmkStage),
        StageId::Dsr => Arc::new(DsrStage::new(providers.installments.clone())),
        StageId::Ekyc => Arc::new(EkycStage::new(providers.identity.clone())),
        StageId::Bureau => Arc::new(BureauStage::new(providers.bureau.clone())),
        StageId::Scoring => Arc::new(ScoringStage::new(providers.scorer.clone())),
        StageId::Elaborate => Arc::new(ElaborateStage),
    }
}

/// Static reason-code table of a stage.
pub fn code_table(stage: StageId) -> &'static [RuleCode] {
    match stage {
        StageId::LockSystem => lock::CODES,
        StageId::Dupcheck => customer::DUPCHECK_CODES,
        StageId::Blacklist => customer::BLACKLIST_CODES,
        StageId::VehicleAge => vehicle::VEHICLE_AGE_CODES,
        StageId::ChassisFraud => vehicle::CHASSIS_CODES,
        StageId::Pmk => pmk::CODES,
        StageId::Dsr => dsr::CODES,
        StageId::Ekyc => verification::EKYC_CODES,
        StageId::Bureau => verification::BUREAU_CODES,
        StageId::Scoring => verification::SCORING_CODES,
        StageId::Elaborate => elaborate::CODES,
    }
}

/// Render a configured limit without a trailing `.0` for whole numbers.
pub(crate) fn limit(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}
