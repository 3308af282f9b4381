use async_trait::async_trait;
use serde_json::json;

use super::{limit, DecisionContext, Stage, StageError, StageInput, StageOutcome};
use crate::workflows::underwriting::domain::RuleCode;
use crate::workflows::underwriting::trail::StageId;

const LTV_WITHIN_LIMIT: RuleCode = RuleCode::pass("LTV-00", "LTV within limit");
const LTV_ABOVE_LIMIT: RuleCode = RuleCode::reject("LTV-01", "LTV above limit");
const PRICE_MISSING: RuleCode = RuleCode::reject("LTV-02", "OTR price not provided");

pub const CODES: &[RuleCode] = &[LTV_WITHIN_LIMIT, LTV_ABOVE_LIMIT, PRICE_MISSING];

/// Loan-to-value check. Also settles the exposure used by the auto-approve rule:
/// financed amount plus the household's outstanding principal.
pub struct ElaborateStage;

#[async_trait]
impl Stage for ElaborateStage {
    fn id(&self) -> StageId {
        StageId::Elaborate
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let terms = &input.application.terms;
        let thresholds = &input.thresholds.elaborate;

        let outstanding: f64 = [&context.applicant_history, &context.spouse_history]
            .into_iter()
            .flatten()
            .filter_map(|record| record.outstanding_principal)
            .map(|amount| amount.max(0.0))
            .sum();
        context.exposure = terms.financed_amount.max(0.0) + outstanding;

        if !terms.otr_price.is_finite() || terms.otr_price <= 0.0 {
            return Ok(StageOutcome::new(
                context.result(StageId::Elaborate, PRICE_MISSING, PRICE_MISSING.description),
                json!({ "otr_price": terms.otr_price }),
            ));
        }

        let ltv = terms.financed_amount / terms.otr_price * 100.0;
        let max = limit(thresholds.max_ltv_percent);
        let (rule, detail) = if ltv > thresholds.max_ltv_percent {
            (LTV_ABOVE_LIMIT, format!("LTV {ltv:.2} > {max}"))
        } else {
            (LTV_WITHIN_LIMIT, format!("LTV {ltv:.2} <= {max}"))
        };

        let info = json!({
            "ltv": ltv,
            "financed_amount": terms.financed_amount,
            "otr_price": terms.otr_price,
            "exposure": context.exposure,
        });
        Ok(StageOutcome::new(
            context.result(StageId::Elaborate, rule, detail),
            info,
        ))
    }
}
