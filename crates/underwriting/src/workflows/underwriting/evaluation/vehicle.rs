use std::sync::Arc;

use async_trait::async_trait;
use chrono::Datelike;
use serde_json::json;

use super::{DecisionContext, Stage, StageError, StageInput, StageOutcome};
use crate::workflows::underwriting::domain::RuleCode;
use crate::workflows::underwriting::providers::{AgreementStatus, ChassisRegistry};
use crate::workflows::underwriting::trail::StageId;

const AGE_WITHIN_LIMIT: RuleCode = RuleCode::pass("VHC-00", "vehicle age within limit");
const AGE_EXCEEDED: RuleCode = RuleCode::reject("VHC-01", "vehicle age exceeded");
const INVALID_YEAR: RuleCode = RuleCode::reject("VHC-02", "invalid manufacture year");

pub const VEHICLE_AGE_CODES: &[RuleCode] = &[AGE_WITHIN_LIMIT, AGE_EXCEEDED, INVALID_YEAR];

const CHASSIS_CLEAR: RuleCode = RuleCode::pass("CHS-00", "chassis not held by another agreement");
const CHASSIS_OWNED_ELSEWHERE: RuleCode =
    RuleCode::reject("CHS-01", "chassis under another customer's active agreement");
const ENGINE_MISMATCH: RuleCode = RuleCode::reject("CHS-02", "engine number mismatch");

pub const CHASSIS_CODES: &[RuleCode] = &[CHASSIS_CLEAR, CHASSIS_OWNED_ELSEWHERE, ENGINE_MISMATCH];

/// Rejects collateral older than `vehicle_age_max` years in the evaluation year.
pub struct VehicleAgeStage;

#[async_trait]
impl Stage for VehicleAgeStage {
    fn id(&self) -> StageId {
        StageId::VehicleAge
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let max_age = input.thresholds.vehicle_age.vehicle_age_max;
        let manufacture_year = input.application.vehicle.manufacture_year;
        let current_year = context.evaluated_on.year();

        if manufacture_year <= 0 || manufacture_year > current_year {
            let result = context.result(
                StageId::VehicleAge,
                INVALID_YEAR,
                format!("manufacture year {manufacture_year} is not valid"),
            );
            return Ok(StageOutcome::new(
                result,
                json!({ "manufacture_year": manufacture_year }),
            ));
        }

        let age = current_year - manufacture_year;
        let (rule, detail) = if i64::from(age) > i64::from(max_age) {
            (AGE_EXCEEDED, format!("vehicle age {age} > {max_age}"))
        } else {
            (AGE_WITHIN_LIMIT, format!("vehicle age {age} <= {max_age}"))
        };

        Ok(StageOutcome::new(
            context.result(StageId::VehicleAge, rule, detail),
            json!({ "manufacture_year": manufacture_year, "age": age, "max_age": max_age }),
        ))
    }
}

/// Looks the chassis up in the agreement registry and rejects collateral already
/// financed for someone else, or whose engine number does not match the registry.
pub struct ChassisFraudStage {
    registry: Arc<dyn ChassisRegistry>,
}

impl ChassisFraudStage {
    pub fn new(registry: Arc<dyn ChassisRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for ChassisFraudStage {
    fn id(&self) -> StageId {
        StageId::ChassisFraud
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let vehicle = &input.application.vehicle;
        let agreement = input
            .call(
                "chassis_registry",
                self.registry.lookup_agreement(&vehicle.chassis_number),
            )
            .await?;

        let Some(agreement) = agreement else {
            return Ok(StageOutcome::new(
                context.result(StageId::ChassisFraud, CHASSIS_CLEAR, "chassis not registered"),
                json!({ "registered": false }),
            ));
        };

        let applicant_id = input.application.applicant.id_number.trim();
        let (rule, detail) = if agreement.status == AgreementStatus::Active
            && agreement.owner_id_number.trim() != applicant_id
        {
            (
                CHASSIS_OWNED_ELSEWHERE,
                format!(
                    "chassis under active agreement {}",
                    agreement.agreement_number
                ),
            )
        } else if !agreement
            .engine_number
            .trim()
            .eq_ignore_ascii_case(vehicle.engine_number.trim())
        {
            (
                ENGINE_MISMATCH,
                format!(
                    "engine number differs from agreement {}",
                    agreement.agreement_number
                ),
            )
        } else {
            (CHASSIS_CLEAR, CHASSIS_CLEAR.description.to_string())
        };

        Ok(StageOutcome::new(
            context.result(StageId::ChassisFraud, rule, detail),
            json!({ "registered": true, "agreement": agreement }),
        ))
    }
}
