//! Staged underwriting pipeline for vehicle-loan applications.
//!
//! A run walks the static stage route (lock gate, customer classification, blacklist,
//! vehicle and chassis checks, policy eligibility, DSR, identity, bureau, scoring and
//! LTV) against one frozen threshold snapshot. Each stage appends an audit record; the
//! first REJECT ends the run, and provider or persistence failures abort it with the
//! records appended so far.

pub mod domain;
pub mod evaluation;
pub mod fanout;
pub mod pipeline;
pub mod providers;
pub mod repository;
pub mod router;
pub mod seed;
pub mod service;
pub mod thresholds;
pub mod trail;

#[cfg(test)]
mod tests;

pub use domain::{
    ApplicantRecord, ApplicationSnapshot, BadDebtClass, CustomerStatus, CustomerType,
    DupcheckRecord, HomeStatus, LoanApplication, LoanTerms, LookupSubject, MaritalStatus,
    PartyIndex, ProspectId, RuleCode, StageResult, Verdict, VehicleRecord,
};
pub use evaluation::{DecisionContext, Stage, StageError, StageInput, StageOutcome};
pub use pipeline::{PipelineAbort, PipelineError, PipelineOutcome, UnderwritingPipeline};
pub use providers::{
    AgreementRecord, AgreementStatus, BehavioralScorer, BureauReport, CancelSignal,
    ChassisRegistry, CreditBureau, HistoryProvider, IdentityVerifier, InstallmentProvider,
    ProductLine, ProviderError, ProviderSet, ScoreResult, VerificationResult,
};
pub use repository::{
    AuditStore, BanReason, BanRecord, LockEvent, LockEventKind, LockScope, LockStore,
    RepositoryError,
};
pub use router::underwriting_router;
pub use seed::{load_history_file, parse_history, HistorySeed, SeedError};
pub use service::{
    CancellationReceipt, CancellationRequest, UnderwritingService, UnderwritingServiceError,
};
pub use thresholds::{
    ConfigStore, ConfigStoreError, StoredThresholds, ThresholdFamily, ThresholdResolver,
    ThresholdSnapshot,
};
pub use trail::{AuditRecord, DecisionTrail, Disposition, RouteError, StageId, TrailError};
