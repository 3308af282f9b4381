//! Debt-service-ratio aggregation.
//!
//! `dsr = (own + other_applicant + other_spouse + cross_applicant + cross_spouse)
//! / income_total * 100`, where the "other" figures sum the two offline product lines
//! and the online line, and the cross-product figures come from the cross-product line.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    limit, DecisionContext, InstallmentTotals, Stage, StageError, StageInput, StageOutcome,
};
use crate::workflows::underwriting::domain::{CustomerStatus, RuleCode, StageResult};
use crate::workflows::underwriting::fanout::fetch_all;
use crate::workflows::underwriting::providers::{InstallmentProvider, ProductLine, ProviderError};
use crate::workflows::underwriting::thresholds::DsrThresholds;
use crate::workflows::underwriting::trail::StageId;

const WITHIN_LIMIT: RuleCode = RuleCode::pass("DSR-00", "DSR within limit");
const ABOVE_LIMIT: RuleCode = RuleCode::reject("DSR-01", "DSR above limit");
const SEGMENT_EXEMPT: RuleCode = RuleCode::pass("DSR-02", "customer segment exempt from DSR cap");
const INCOME_MISSING: RuleCode = RuleCode::reject("DSR-03", "income not provided");

pub const CODES: &[RuleCode] = &[WITHIN_LIMIT, ABOVE_LIMIT, SEGMENT_EXEMPT, INCOME_MISSING];

/// Monthly figures entering the ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DsrInputs {
    pub own_installment: f64,
    pub other_applicant: f64,
    pub other_spouse: f64,
    pub cross_product_applicant: f64,
    pub cross_product_spouse: f64,
    pub income_total: f64,
}

impl DsrInputs {
    pub fn obligations(&self) -> f64 {
        self.own_installment
            + (self.other_applicant + self.other_spouse)
            + (self.cross_product_applicant + self.cross_product_spouse)
    }

    fn from_totals(totals: &InstallmentTotals, income_total: f64) -> Self {
        Self {
            own_installment: totals.own,
            other_applicant: totals.other_applicant,
            other_spouse: totals.other_spouse,
            cross_product_applicant: totals.cross_product_applicant,
            cross_product_spouse: totals.cross_product_spouse,
            income_total,
        }
    }
}

/// Ratio and verdict for one application.
///
/// Missing income rejects with its own code and yields no ratio. Otherwise the bypass
/// flag is checked first (PASS with the within-limit code, ratio still reported), then
/// segment exemption, then the cap.
pub fn compute_dsr(
    inputs: &DsrInputs,
    status: CustomerStatus,
    customer_segment: Option<&str>,
    thresholds: &DsrThresholds,
) -> (Option<f64>, StageResult) {
    let result = |rule: RuleCode, detail: String| {
        StageResult::with_status(StageId::Dsr, rule, status, detail)
    };

    if !inputs.income_total.is_finite() || inputs.income_total <= 0.0 {
        return (None, result(INCOME_MISSING, INCOME_MISSING.description.to_string()));
    }

    let dsr = inputs.obligations() / inputs.income_total * 100.0;
    let max = limit(thresholds.max_dsr_percent);

    if thresholds.dsr_bypass {
        return (
            Some(dsr),
            result(WITHIN_LIMIT, format!("DSR <= {max} (bypass, computed {dsr:.2})")),
        );
    }

    if thresholds.is_exempt(customer_segment) {
        let segment = customer_segment.unwrap_or_default().trim().to_ascii_uppercase();
        return (
            Some(dsr),
            result(
                SEGMENT_EXEMPT,
                format!("segment {segment} exempt from DSR cap (DSR {dsr:.2})"),
            ),
        );
    }

    if dsr > thresholds.max_dsr_percent {
        (Some(dsr), result(ABOVE_LIMIT, format!("DSR > {max}")))
    } else {
        (Some(dsr), result(WITHIN_LIMIT, format!("DSR <= {max}")))
    }
}

/// Queries every installment source for each household member concurrently, applies
/// the top-up reduction for repeat customers, then computes the ratio.
pub struct DsrStage {
    installments: Arc<dyn InstallmentProvider>,
}

impl DsrStage {
    pub fn new(installments: Arc<dyn InstallmentProvider>) -> Self {
        Self { installments }
    }

    async fn top_up_reduction(
        &self,
        input: &StageInput<'_>,
        status: CustomerStatus,
    ) -> Result<f64, StageError> {
        if !status.is_repeat() {
            return Ok(0.0);
        }

        let applicant = input.application.applicant.lookup_subject();
        match input
            .call("top_up", self.installments.top_up_installment(&applicant))
            .await
        {
            Ok(amount) => Ok(amount.unwrap_or(0.0).max(0.0)),
            Err(err @ ProviderError::Cancelled { .. }) => Err(err.into()),
            Err(err) => {
                warn!(
                    prospect_id = %input.application.prospect_id,
                    error = %err,
                    "top-up lookup failed; using unreduced cross-product installment"
                );
                Ok(0.0)
            }
        }
    }
}

#[async_trait]
impl Stage for DsrStage {
    fn id(&self) -> StageId {
        StageId::Dsr
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let application = input.application;
        let subjects: Vec<_> = application
            .applicant
            .household()
            .into_iter()
            .map(|member| member.lookup_subject())
            .collect();

        let lookups: Vec<_> = subjects
            .iter()
            .flat_map(|subject| {
                ProductLine::ALL.iter().map(move |line| {
                    input.call(line.label(), self.installments.scan(*line, subject))
                })
            })
            .collect();
        let amounts = fetch_all(lookups).await?;

        let mut per_person = amounts.chunks(ProductLine::ALL.len()).map(|lines| {
            let other: f64 = lines.iter().take(3).map(|amount| amount.max(0.0)).sum();
            let cross = lines.get(3).copied().unwrap_or(0.0).max(0.0);
            (other, cross)
        });
        let (other_applicant, cross_applicant) = per_person.next().unwrap_or_default();
        let (other_spouse, cross_spouse) = per_person.next().unwrap_or_default();

        let top_up_reduction = self.top_up_reduction(input, context.customer_status).await?;
        let totals = InstallmentTotals {
            own: application.terms.installment_amount,
            other_applicant,
            other_spouse,
            cross_product_applicant: (cross_applicant - top_up_reduction).max(0.0),
            cross_product_spouse: cross_spouse,
            top_up_reduction,
        };

        let thresholds = &input.thresholds.dsr;
        let segment = application.terms.customer_segment.as_deref();
        let inputs = DsrInputs::from_totals(&totals, application.applicant.household_income());
        let (dsr, result) = compute_dsr(&inputs, context.customer_status, segment, thresholds);

        debug!(
            prospect_id = %application.prospect_id,
            dsr = ?dsr,
            obligations = inputs.obligations(),
            "DSR computed"
        );

        let info = json!({
            "dsr": dsr,
            "income_total": inputs.income_total,
            "installments": totals,
            "customer_segment": segment,
            "max_dsr_percent": thresholds.max_dsr_percent,
            "bypass": thresholds.dsr_bypass,
        });
        context.installments = totals;
        context.dsr_percent = dsr;
        Ok(StageOutcome::new(result, info))
    }
}
