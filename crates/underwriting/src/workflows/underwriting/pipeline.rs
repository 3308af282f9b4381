//! Stage pipeline orchestrator.
//!
//! Stages run strictly in route order for one prospect. Every stage outcome is
//! appended to the trail; the first REJECT ends the run with disposition REJECT.
//! Provider and persistence failures abort the run without a record for the failing
//! stage, returning the records appended so far alongside the error.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::PipelineSettings;

use super::domain::{CustomerStatus, CustomerType, LoanApplication, ProspectId, RuleCode, Verdict};
use super::evaluation::{limit, standard_stage, DecisionContext, Stage, StageError, StageInput};
use super::providers::{CancelSignal, ProviderError, ProviderSet};
use super::repository::RepositoryError;
use super::thresholds::{ElaborateThresholds, ThresholdSnapshot};
use super::trail::{
    validate_route, AuditRecord, DecisionTrail, Disposition, RouteError, StageId,
    DISPOSITION_SOURCE, ROUTE,
};

const AUTO_APPROVED: RuleCode = RuleCode::pass("DSP-01", "auto-approved");
const CREDIT_PROCESS: RuleCode = RuleCode::pass("DSP-02", "routed to credit analyst");

/// Error that aborts a run, tagged with the stage that raised it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("upstream_service_timeout: {stage}: {source}")]
    UpstreamTimeout {
        stage: StageId,
        #[source]
        source: ProviderError,
    },
    #[error("upstream_service_error: {stage}: {source}")]
    UpstreamError {
        stage: StageId,
        #[source]
        source: ProviderError,
    },
    #[error("persistence_failure: {stage}: {source}")]
    Persistence {
        stage: StageId,
        #[source]
        source: RepositoryError,
    },
    #[error("cancelled before {stage}")]
    Cancelled { stage: StageId },
}

impl PipelineError {
    pub(crate) fn from_stage(stage: StageId, error: StageError) -> Self {
        match error {
            StageError::Provider(ProviderError::Cancelled { .. }) => Self::Cancelled { stage },
            StageError::Provider(source @ ProviderError::Timeout { .. }) => {
                Self::UpstreamTimeout { stage, source }
            }
            StageError::Provider(source) => Self::UpstreamError { stage, source },
            StageError::Persistence(source) => Self::Persistence { stage, source },
        }
    }

    pub fn stage(&self) -> StageId {
        match self {
            PipelineError::UpstreamTimeout { stage, .. }
            | PipelineError::UpstreamError { stage, .. }
            | PipelineError::Persistence { stage, .. }
            | PipelineError::Cancelled { stage } => *stage,
        }
    }

    /// Timeouts and cancellations may be retried as-is; provider errors need the
    /// underlying data fixed first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamTimeout { .. } | PipelineError::Cancelled { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UpstreamTimeout { .. } => "upstream_service_timeout",
            PipelineError::UpstreamError { .. } => "upstream_service_error",
            PipelineError::Persistence { .. } => "persistence_failure",
            PipelineError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Aborted run: no disposition, only the records appended before the failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct PipelineAbort {
    #[source]
    pub error: PipelineError,
    pub trail: DecisionTrail,
}

/// Completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    pub prospect_id: ProspectId,
    pub disposition: Disposition,
    pub customer_status: CustomerStatus,
    pub customer_type: CustomerType,
    pub dsr_percent: Option<f64>,
    pub trail: DecisionTrail,
}

pub struct UnderwritingPipeline {
    stages: Vec<Arc<dyn Stage>>,
    settings: PipelineSettings,
}

impl UnderwritingPipeline {
    /// Every stage of the static route table, wired to `providers`.
    pub fn standard(providers: &ProviderSet, settings: PipelineSettings) -> Result<Self, RouteError> {
        let order = validate_route(ROUTE)?;
        let stages = order
            .into_iter()
            .map(|stage| standard_stage(stage, providers))
            .collect();
        Self::from_stages(stages, settings)
    }

    /// Custom stage list. Stages must appear in route order, each at most once; stages
    /// may be left out.
    pub fn from_stages(
        stages: Vec<Arc<dyn Stage>>,
        settings: PipelineSettings,
    ) -> Result<Self, RouteError> {
        if stages.is_empty() {
            return Err(RouteError::Empty);
        }
        for pair in stages.windows(2) {
            let (previous, stage) = (pair[0].id(), pair[1].id());
            if stage.position() <= previous.position() {
                return Err(RouteError::OutOfOrder { previous, stage });
            }
        }
        Ok(Self { stages, settings })
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|stage| stage.id()).collect()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        application: &LoanApplication,
        thresholds: &ThresholdSnapshot,
        cancel: &CancelSignal,
    ) -> Result<PipelineOutcome, PipelineAbort> {
        self.run_on(application, thresholds, cancel, self.settings.today())
            .await
    }

    /// Run with an explicit local evaluation date for age, tenure and ban windows.
    pub async fn run_on(
        &self,
        application: &LoanApplication,
        thresholds: &ThresholdSnapshot,
        cancel: &CancelSignal,
        evaluated_on: NaiveDate,
    ) -> Result<PipelineOutcome, PipelineAbort> {
        let prospect_id = &application.prospect_id;
        let input = StageInput {
            application,
            thresholds,
            settings: &self.settings,
            cancel,
        };
        let mut context = DecisionContext::new(evaluated_on);
        let mut trail = DecisionTrail::new();

        for (position, stage) in self.stages.iter().enumerate() {
            let stage_id = stage.id();
            if cancel.is_cancelled() {
                warn!(%prospect_id, stage = %stage_id, "run cancelled");
                return Err(PipelineAbort {
                    error: PipelineError::Cancelled { stage: stage_id },
                    trail,
                });
            }

            debug!(%prospect_id, stage = %stage_id, "stage started");
            let outcome = match stage.evaluate(&input, &mut context).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    let error = PipelineError::from_stage(stage_id, error);
                    warn!(%prospect_id, error = %error, "run aborted");
                    return Err(PipelineAbort { error, trail });
                }
            };

            let result = outcome.result;
            info!(
                %prospect_id,
                stage = %stage_id,
                code = %result.code,
                result = ?result.result,
                status = %result.status_konsumen,
                "stage evaluated"
            );

            let next_step = self
                .stages
                .get(position + 1)
                .map(|next| next.id().tag().to_string())
                .unwrap_or_else(|| DISPOSITION_SOURCE.to_string());
            trail.append(AuditRecord::from_stage(
                prospect_id,
                &result,
                outcome.info,
                Some(next_step),
            ));

            match result.result {
                Verdict::Reject => {
                    return Ok(PipelineOutcome {
                        prospect_id: prospect_id.clone(),
                        disposition: Disposition::Reject,
                        customer_status: context.customer_status,
                        customer_type: context.customer_type,
                        dsr_percent: context.dsr_percent,
                        trail,
                    });
                }
                Verdict::Contingency => context.contingency = true,
                Verdict::Pass => {}
            }
        }

        let disposition = decide_disposition(&context, &thresholds.elaborate);
        let (rule, detail) = match disposition {
            Disposition::Approve => (
                AUTO_APPROVED,
                format!(
                    "exposure {} < {}",
                    limit(context.exposure),
                    limit(thresholds.elaborate.auto_approve_max_exposure)
                ),
            ),
            _ if context.contingency => (
                CREDIT_PROCESS,
                "provider contingency requires analyst review".to_string(),
            ),
            _ => (CREDIT_PROCESS, CREDIT_PROCESS.description.to_string()),
        };
        trail.append(AuditRecord::disposition(
            prospect_id,
            disposition,
            rule.code,
            format!("{} - {detail}", context.customer_status.label()),
            json!({
                "exposure": context.exposure,
                "contingency": context.contingency,
                "customer_type": context.customer_type,
            }),
        ));
        info!(%prospect_id, %disposition, "run completed");

        Ok(PipelineOutcome {
            prospect_id: prospect_id.clone(),
            disposition,
            customer_status: context.customer_status,
            customer_type: context.customer_type,
            dsr_percent: context.dsr_percent,
            trail,
        })
    }
}

/// APPROVE only for a contingency-free run whose exposure is under the auto-approve
/// limit; everything else goes to the credit analyst.
pub fn decide_disposition(
    context: &DecisionContext,
    thresholds: &ElaborateThresholds,
) -> Disposition {
    if !context.contingency
        && thresholds.auto_approve_max_exposure > 0.0
        && context.exposure < thresholds.auto_approve_max_exposure
    {
        Disposition::Approve
    } else {
        Disposition::CreditProcess
    }
}
