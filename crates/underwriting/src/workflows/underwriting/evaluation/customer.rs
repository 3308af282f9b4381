//! Customer status classification, repeat-customer (dupcheck) rules and blacklist
//! screening.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{DecisionContext, Stage, StageError, StageInput, StageOutcome};
use crate::workflows::underwriting::domain::{
    BadDebtClass, CustomerStatus, CustomerType, DupcheckRecord, PartyIndex, RuleCode, StageResult,
    Verdict,
};
use crate::workflows::underwriting::fanout::fetch_all;
use crate::workflows::underwriting::providers::HistoryProvider;
use crate::workflows::underwriting::thresholds::{BlacklistThresholds, DupcheckThresholds};
use crate::workflows::underwriting::trail::StageId;

const NEW_CUSTOMER: RuleCode = RuleCode::pass("DUP-00", "new customer");
const AO_CLEAN: RuleCode = RuleCode::pass("DUP-01", "open-agreement customer within limits");
const RO_CLEAN: RuleCode = RuleCode::pass("DUP-02", "settled-agreement customer within limits");
const AO_OVERDUE: RuleCode = RuleCode::reject("DUP-11", "open agreement overdue above limit");
const RO_OVERDUE: RuleCode = RuleCode::reject("DUP-12", "settled agreement overdue above limit");
const AO_RUNNING_INSTALLMENTS: RuleCode =
    RuleCode::reject("DUP-13", "too few installments paid on running agreement");
const AO_ACTIVE_AGREEMENTS: RuleCode =
    RuleCode::reject("DUP-14", "too many active agreements");

pub const DUPCHECK_CODES: &[RuleCode] = &[
    NEW_CUSTOMER,
    AO_CLEAN,
    RO_CLEAN,
    AO_OVERDUE,
    RO_OVERDUE,
    AO_RUNNING_INSTALLMENTS,
    AO_ACTIVE_AGREEMENTS,
];

const CLEAN: RuleCode = RuleCode::pass("BLK-00", "no blacklist marker");
const SIMILAR_IDENTITY: RuleCode = RuleCode::reject("BLK-01", "similar identity");
const BLACKLISTED: [RuleCode; 2] = [
    RuleCode::reject("BLK-11", "applicant blacklisted"),
    RuleCode::reject("BLK-12", "spouse blacklisted"),
];
const HISTORIC_OVERDUE: [RuleCode; 2] = [
    RuleCode::reject("BLK-21", "applicant historic overdue above limit"),
    RuleCode::reject("BLK-22", "spouse historic overdue above limit"),
];
const INVENTORIED_ASSET: [RuleCode; 2] = [
    RuleCode::reject("BLK-31", "applicant has inventoried asset"),
    RuleCode::reject("BLK-32", "spouse has inventoried asset"),
];
const RESTRUCTURED: [RuleCode; 2] = [
    RuleCode::reject("BLK-41", "applicant agreement restructured"),
    RuleCode::reject("BLK-42", "spouse agreement restructured"),
];
const WARNING: [RuleCode; 2] = [
    RuleCode::pass("BLK-51", "applicant on warning list"),
    RuleCode::pass("BLK-52", "spouse on warning list"),
];

pub const BLACKLIST_CODES: &[RuleCode] = &[
    CLEAN,
    SIMILAR_IDENTITY,
    BLACKLISTED[0],
    BLACKLISTED[1],
    HISTORIC_OVERDUE[0],
    HISTORIC_OVERDUE[1],
    INVENTORIED_ASSET[0],
    INVENTORIED_ASSET[1],
    RESTRUCTURED[0],
    RESTRUCTURED[1],
    WARNING[0],
    WARNING[1],
];

/// NEW / AO / RO from one person's history. `None` means no history was found.
pub fn classify_customer(history: Option<&DupcheckRecord>) -> CustomerStatus {
    let Some(record) = history else {
        return CustomerStatus::New;
    };

    let total_installment = record.total_installment.unwrap_or(0.0);
    let settled = record.settlement_date.is_some();
    let paid_count_known = record.paid_installment_count.is_some();

    if (total_installment <= 0.0 && settled)
        || (total_installment > 0.0 && settled && !paid_count_known)
    {
        CustomerStatus::Ro
    } else if total_installment > 0.0 {
        CustomerStatus::Ao
    } else {
        CustomerStatus::New
    }
}

/// Classify one household member and screen their history for blacklist markers.
///
/// Markers are checked in priority order and the first match wins. A warning-class
/// bad debt is advisory: the verdict stays PASS and only the customer type changes.
/// The similar-identity marker only applies to the primary applicant.
pub fn classify_and_screen(
    history: Option<&DupcheckRecord>,
    party: PartyIndex,
    thresholds: &BlacklistThresholds,
) -> (StageResult, CustomerType) {
    let status = classify_customer(history);
    let index = party.index();
    let screened = |rule: RuleCode| {
        StageResult::with_status(StageId::Blacklist, rule, status, rule.description)
    };

    let Some(record) = history else {
        return (screened(CLEAN), CustomerType::Clean);
    };

    if party == PartyIndex::Applicant && record.similarity_flag == Some(true) {
        return (
            StageResult::with_status(
                StageId::Blacklist,
                SIMILAR_IDENTITY,
                status,
                "applicant similar identity",
            ),
            CustomerType::Clean,
        );
    }
    if record.bad_debt == Some(BadDebtClass::Blacklisted) {
        return (screened(BLACKLISTED[index]), CustomerType::Clean);
    }
    if record.max_overdue_days.unwrap_or(0) > thresholds.max_ovd_days {
        return (screened(HISTORIC_OVERDUE[index]), CustomerType::Clean);
    }
    if record.inventoried_asset_count.unwrap_or(0) > 0 {
        return (screened(INVENTORIED_ASSET[index]), CustomerType::Clean);
    }
    if record.restructured == Some(true) {
        return (screened(RESTRUCTURED[index]), CustomerType::Clean);
    }
    if record.bad_debt == Some(BadDebtClass::Warning) {
        return (screened(WARNING[index]), CustomerType::Warning);
    }

    (screened(CLEAN), CustomerType::Clean)
}

/// Repeat-customer rules for one household member's history.
fn dupcheck_rule(
    status: CustomerStatus,
    history: Option<&DupcheckRecord>,
    thresholds: &DupcheckThresholds,
) -> (RuleCode, String) {
    let Some(record) = history else {
        return (NEW_CUSTOMER, "no previous agreement".to_string());
    };

    match status {
        CustomerStatus::New => (NEW_CUSTOMER, "no running installment".to_string()),
        CustomerStatus::Ao => {
            let overdue = record.current_overdue_days.unwrap_or(0);
            let paid = record.paid_installment_count.unwrap_or(0);
            let active = record.active_agreement_count.unwrap_or(0);
            if overdue > thresholds.max_ovd_days {
                (
                    AO_OVERDUE,
                    format!("current overdue {overdue} > {}", thresholds.max_ovd_days),
                )
            } else if paid < thresholds.angsuran_berjalan_months {
                (
                    AO_RUNNING_INSTALLMENTS,
                    format!(
                        "paid installments {paid} < {}",
                        thresholds.angsuran_berjalan_months
                    ),
                )
            } else if active > thresholds.max_active_agreements {
                (
                    AO_ACTIVE_AGREEMENTS,
                    format!(
                        "active agreements {active} > {}",
                        thresholds.max_active_agreements
                    ),
                )
            } else {
                (AO_CLEAN, overdue_detail(overdue, thresholds))
            }
        }
        CustomerStatus::Ro => {
            let overdue = record.max_overdue_days.unwrap_or(0);
            if overdue > thresholds.max_ovd_days {
                (
                    RO_OVERDUE,
                    format!("max overdue {overdue} > {}", thresholds.max_ovd_days),
                )
            } else {
                (RO_CLEAN, overdue_detail(overdue, thresholds))
            }
        }
    }
}

fn overdue_detail(overdue: u32, thresholds: &DupcheckThresholds) -> String {
    if overdue <= thresholds.min_ovd_days {
        "no overdue".to_string()
    } else {
        format!("overdue {overdue} <= {}", thresholds.max_ovd_days)
    }
}

/// Fetches applicant and spouse history concurrently, classifies both, and applies
/// the repeat-customer rules, applicant first.
pub struct DupcheckStage {
    history: Arc<dyn HistoryProvider>,
}

impl DupcheckStage {
    pub fn new(history: Arc<dyn HistoryProvider>) -> Self {
        Self { history }
    }
}

#[async_trait]
impl Stage for DupcheckStage {
    fn id(&self) -> StageId {
        StageId::Dupcheck
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let household = input.application.applicant.household();
        let subjects: Vec<_> = household
            .iter()
            .map(|member| member.lookup_subject())
            .collect();

        let lookups: Vec<_> = subjects
            .iter()
            .map(|subject| input.call("history", self.history.lookup_customer(subject)))
            .collect();
        let mut histories = fetch_all(lookups)
            .await?
            .into_iter()
            .map(|record| record.and_then(DupcheckRecord::into_history));

        context.applicant_history = histories.next().flatten();
        context.spouse_history = histories.next().flatten();
        context.customer_status = classify_customer(context.applicant_history.as_ref());
        context.spouse_status = (household.len() > 1)
            .then(|| classify_customer(context.spouse_history.as_ref()));
        context.max_overdue_days = [&context.applicant_history, &context.spouse_history]
            .into_iter()
            .flatten()
            .filter_map(|record| record.max_overdue_days)
            .max()
            .unwrap_or(0);

        debug!(
            prospect_id = %input.application.prospect_id,
            status = %context.customer_status,
            spouse_status = ?context.spouse_status,
            "customer classified"
        );

        let thresholds = &input.thresholds.dupcheck;
        let (mut rule, mut detail) = dupcheck_rule(
            context.customer_status,
            context.applicant_history.as_ref(),
            thresholds,
        );
        if rule.verdict == Verdict::Pass {
            if let Some(spouse_status) = context.spouse_status {
                let (spouse_rule, spouse_detail) =
                    dupcheck_rule(spouse_status, context.spouse_history.as_ref(), thresholds);
                if spouse_rule.verdict == Verdict::Reject {
                    rule = spouse_rule;
                    detail = format!("spouse {spouse_detail}");
                }
            }
        }

        let info = json!({
            "customer_status": context.customer_status,
            "spouse_status": context.spouse_status,
            "applicant_history": context.applicant_history,
            "spouse_history": context.spouse_history,
        });
        Ok(StageOutcome::new(
            context.result(StageId::Dupcheck, rule, detail),
            info,
        ))
    }
}

/// Screens the histories fetched by the dupcheck stage; spouse only when present.
pub struct BlacklistStage;

#[async_trait]
impl Stage for BlacklistStage {
    fn id(&self) -> StageId {
        StageId::Blacklist
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let thresholds = &input.thresholds.blacklist;
        let (applicant, applicant_type) = classify_and_screen(
            context.applicant_history.as_ref(),
            PartyIndex::Applicant,
            thresholds,
        );
        context.customer_type = applicant_type;
        if applicant.is_reject() || context.spouse_status.is_none() {
            let info = json!({ "party": PartyIndex::Applicant, "customer_type": applicant_type });
            return Ok(StageOutcome::new(applicant, info));
        }

        let (spouse, spouse_type) = classify_and_screen(
            context.spouse_history.as_ref(),
            PartyIndex::Spouse,
            thresholds,
        );
        if spouse_type == CustomerType::Warning {
            context.customer_type = CustomerType::Warning;
        }

        // A clean applicant defers to the spouse's finding; an applicant warning
        // outranks a clean spouse.
        let (chosen, party) = if spouse.is_reject() || applicant.code == CLEAN.code {
            (spouse, PartyIndex::Spouse)
        } else {
            (applicant, PartyIndex::Applicant)
        };
        let info = json!({ "party": party, "customer_type": context.customer_type });
        Ok(StageOutcome::new(chosen, info))
    }
}
