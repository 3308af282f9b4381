//! Stages backed by external verification and scoring providers: identity (eKYC),
//! credit bureau and behavioral score.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{limit, DecisionContext, Stage, StageError, StageInput, StageOutcome};
use crate::workflows::underwriting::domain::RuleCode;
use crate::workflows::underwriting::providers::{
    BehavioralScorer, CreditBureau, IdentityVerifier, ProviderError,
};
use crate::workflows::underwriting::trail::StageId;

const IDENTITY_VERIFIED: RuleCode = RuleCode::pass("EKY-00", "identity verified");
const IDENTITY_MISMATCH: RuleCode = RuleCode::reject("EKY-01", "identity mismatch");

pub const EKYC_CODES: &[RuleCode] = &[IDENTITY_VERIFIED, IDENTITY_MISMATCH];

const BUREAU_CLEAR: RuleCode = RuleCode::pass("BUR-00", "bureau record within limits");
const BUREAU_COLLECTABILITY: RuleCode =
    RuleCode::reject("BUR-01", "bureau collectability above limit");
const BUREAU_OVERDUE: RuleCode = RuleCode::reject("BUR-02", "bureau overdue above limit");

pub const BUREAU_CODES: &[RuleCode] = &[BUREAU_CLEAR, BUREAU_COLLECTABILITY, BUREAU_OVERDUE];

const SCORE_ACCEPTED: RuleCode = RuleCode::pass("SCR-00", "behavioral score accepted");
const SCORE_BAND_REJECTED: RuleCode = RuleCode::reject("SCR-01", "behavioral score band rejected");
const SCORE_BELOW_MINIMUM: RuleCode = RuleCode::reject("SCR-02", "behavioral score below minimum");
const SCORER_UNAVAILABLE: RuleCode =
    RuleCode::contingency("SCR-99", "behavioral scorer unavailable");

pub const SCORING_CODES: &[RuleCode] = &[
    SCORE_ACCEPTED,
    SCORE_BAND_REJECTED,
    SCORE_BELOW_MINIMUM,
    SCORER_UNAVAILABLE,
];

/// Identity verification with provider fallback.
///
/// Verifiers are tried in order. A provider error falls through to the next verifier;
/// a definitive mismatch rejects without consulting the rest. When every verifier
/// fails the last error aborts the run.
pub struct EkycStage {
    verifiers: Vec<Arc<dyn IdentityVerifier>>,
}

impl EkycStage {
    pub fn new(verifiers: Vec<Arc<dyn IdentityVerifier>>) -> Self {
        Self { verifiers }
    }
}

#[async_trait]
impl Stage for EkycStage {
    fn id(&self) -> StageId {
        StageId::Ekyc
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let applicant = &input.application.applicant;
        let mut last_error = None;

        for verifier in &self.verifiers {
            let provider = verifier.name();
            match input.call(provider, verifier.verify(applicant)).await {
                Ok(verification) => {
                    let (rule, detail) = if verification.matched {
                        (IDENTITY_VERIFIED, format!("identity verified by {provider}"))
                    } else {
                        (IDENTITY_MISMATCH, format!("identity mismatch at {provider}"))
                    };
                    let info = json!({
                        "provider": provider,
                        "verification": verification,
                        "fallbacks": last_error.as_ref().map(ToString::to_string),
                    });
                    return Ok(StageOutcome::new(
                        context.result(StageId::Ekyc, rule, detail),
                        info,
                    ));
                }
                Err(err @ ProviderError::Cancelled { .. }) => return Err(err.into()),
                Err(err) => {
                    warn!(
                        prospect_id = %input.application.prospect_id,
                        provider,
                        error = %err,
                        "identity verifier failed; falling back"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::Malformed {
                provider: "identity".to_string(),
                message: "no identity verifier configured".to_string(),
            })
            .into())
    }
}

pub struct BureauStage {
    bureau: Arc<dyn CreditBureau>,
}

impl BureauStage {
    pub fn new(bureau: Arc<dyn CreditBureau>) -> Self {
        Self { bureau }
    }
}

#[async_trait]
impl Stage for BureauStage {
    fn id(&self) -> StageId {
        StageId::Bureau
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let thresholds = &input.thresholds.bureau;
        let report = input
            .call(
                "credit_bureau",
                self.bureau.query(&input.application.applicant),
            )
            .await?;

        let (rule, detail) = if report.worst_collectability > thresholds.max_collectability {
            (
                BUREAU_COLLECTABILITY,
                format!(
                    "collectability {} > {}",
                    report.worst_collectability, thresholds.max_collectability
                ),
            )
        } else if report.max_overdue_days > thresholds.max_ovd_days {
            (
                BUREAU_OVERDUE,
                format!(
                    "bureau overdue {} > {}",
                    report.max_overdue_days, thresholds.max_ovd_days
                ),
            )
        } else {
            (
                BUREAU_CLEAR,
                format!("collectability {}", report.worst_collectability),
            )
        };

        let info = json!({ "report": report });
        context.bureau = Some(report);
        Ok(StageOutcome::new(
            context.result(StageId::Bureau, rule, detail),
            info,
        ))
    }
}

/// Behavioral score. When `contingency_on_scorer_failure` is set, a scorer failure
/// becomes a CONTINGENCY verdict and the run continues without auto-approval.
pub struct ScoringStage {
    scorer: Arc<dyn BehavioralScorer>,
}

impl ScoringStage {
    pub fn new(scorer: Arc<dyn BehavioralScorer>) -> Self {
        Self { scorer }
    }
}

#[async_trait]
impl Stage for ScoringStage {
    fn id(&self) -> StageId {
        StageId::Scoring
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let thresholds = &input.thresholds.scoring;
        let scored = input
            .call(
                "behavioral_scorer",
                self.scorer
                    .score(&input.application.applicant, context.bureau.as_ref()),
            )
            .await;

        let score = match scored {
            Ok(score) => score,
            Err(err @ ProviderError::Cancelled { .. }) => return Err(err.into()),
            Err(err) if input.settings.contingency_on_scorer_failure => {
                info!(
                    prospect_id = %input.application.prospect_id,
                    error = %err,
                    "behavioral scorer unavailable; continuing under contingency"
                );
                context.contingency = true;
                return Ok(StageOutcome::new(
                    context.result(StageId::Scoring, SCORER_UNAVAILABLE, "scorer unavailable"),
                    json!({ "error": err.to_string() }),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let band = score.band.trim().to_ascii_uppercase();
        let (rule, detail) = if thresholds.reject_bands.iter().any(|reject| *reject == band) {
            (SCORE_BAND_REJECTED, format!("score band {band} rejected"))
        } else if score.score < thresholds.min_score {
            (
                SCORE_BELOW_MINIMUM,
                format!(
                    "score {} < {}",
                    limit(score.score),
                    limit(thresholds.min_score)
                ),
            )
        } else {
            (
                SCORE_ACCEPTED,
                format!("score {} band {band}", limit(score.score)),
            )
        };

        let info = json!({ "score": score });
        context.score = Some(score);
        Ok(StageOutcome::new(
            context.result(StageId::Scoring, rule, detail),
            info,
        ))
    }
}
