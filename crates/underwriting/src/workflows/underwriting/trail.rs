use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::domain::{ProspectId, StageResult, Verdict};

/// Identifier of every rule stage the pipeline can route through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageId {
    LockSystem,
    Dupcheck,
    Blacklist,
    VehicleAge,
    ChassisFraud,
    Pmk,
    Dsr,
    Ekyc,
    Bureau,
    Scoring,
    Elaborate,
}

impl StageId {
    pub const ALL: [StageId; 11] = [
        StageId::LockSystem,
        StageId::Dupcheck,
        StageId::Blacklist,
        StageId::VehicleAge,
        StageId::ChassisFraud,
        StageId::Pmk,
        StageId::Dsr,
        StageId::Ekyc,
        StageId::Bureau,
        StageId::Scoring,
        StageId::Elaborate,
    ];

    pub const fn tag(self) -> &'static str {
        match self {
            StageId::LockSystem => "LOCK_SYSTEM",
            StageId::Dupcheck => "DUPCHECK",
            StageId::Blacklist => "BLACKLIST",
            StageId::VehicleAge => "VEHICLE_AGE",
            StageId::ChassisFraud => "CHASSIS_FRAUD",
            StageId::Pmk => "PMK",
            StageId::Dsr => "DSR",
            StageId::Ekyc => "EKYC",
            StageId::Bureau => "BUREAU",
            StageId::Scoring => "SCORING",
            StageId::Elaborate => "ELABORATE",
        }
    }

    /// Successor on PASS according to [`ROUTE`]; `None` for the terminal stage.
    pub fn next(self) -> Option<StageId> {
        ROUTE
            .iter()
            .find(|(stage, _)| *stage == self)
            .and_then(|(_, next)| *next)
    }

    /// Position in the standard route, used to validate custom stage lists.
    pub fn position(self) -> usize {
        route_order()
            .iter()
            .position(|stage| *stage == self)
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

pub const ENTRY_STAGE: StageId = StageId::LockSystem;

/// Static adjacency table: stage -> next stage on PASS.
pub const ROUTE: &[(StageId, Option<StageId>)] = &[
    (StageId::LockSystem, Some(StageId::Dupcheck)),
    (StageId::Dupcheck, Some(StageId::Blacklist)),
    (StageId::Blacklist, Some(StageId::VehicleAge)),
    (StageId::VehicleAge, Some(StageId::ChassisFraud)),
    (StageId::ChassisFraud, Some(StageId::Pmk)),
    (StageId::Pmk, Some(StageId::Dsr)),
    (StageId::Dsr, Some(StageId::Ekyc)),
    (StageId::Ekyc, Some(StageId::Bureau)),
    (StageId::Bureau, Some(StageId::Scoring)),
    (StageId::Scoring, Some(StageId::Elaborate)),
    (StageId::Elaborate, None),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("stage {0} has no entry in the route table")]
    MissingStage(StageId),
    #[error("stage {0} is declared more than once in the route table")]
    DuplicateStage(StageId),
    #[error("route revisits stage {0}")]
    Cycle(StageId),
    #[error("stage {0} is unreachable from the entry stage")]
    Unreachable(StageId),
    #[error("stage {stage} cannot run after {previous}")]
    OutOfOrder { previous: StageId, stage: StageId },
    #[error("pipeline has no stages")]
    Empty,
}

/// Check the route table is total (every stage declared once), acyclic and that
/// walking it from the entry stage reaches every stage.
pub fn validate_route(route: &[(StageId, Option<StageId>)]) -> Result<Vec<StageId>, RouteError> {
    let mut declared = BTreeSet::new();
    for (stage, _) in route {
        if !declared.insert(*stage) {
            return Err(RouteError::DuplicateStage(*stage));
        }
    }
    if let Some(missing) = StageId::ALL.iter().find(|stage| !declared.contains(stage)) {
        return Err(RouteError::MissingStage(*missing));
    }

    let mut visited = BTreeSet::new();
    let mut order = Vec::with_capacity(route.len());
    let mut cursor = Some(ENTRY_STAGE);
    while let Some(stage) = cursor {
        if !visited.insert(stage) {
            return Err(RouteError::Cycle(stage));
        }
        order.push(stage);
        cursor = route
            .iter()
            .find(|(candidate, _)| *candidate == stage)
            .and_then(|(_, next)| *next);
    }

    if let Some(unreached) = StageId::ALL.iter().find(|stage| !visited.contains(stage)) {
        return Err(RouteError::Unreachable(*unreached));
    }

    Ok(order)
}

fn route_order() -> Vec<StageId> {
    let mut order = Vec::with_capacity(ROUTE.len());
    let mut cursor = Some(ENTRY_STAGE);
    while let Some(stage) = cursor {
        if order.contains(&stage) {
            break;
        }
        order.push(stage);
        cursor = stage.next();
    }
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusProcess {
    OnProcess,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Activity {
    Process,
    Stop,
    Unprocess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Pass,
    Reject,
    CreditProcess,
    Approve,
}

/// Overall outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    Reject,
    CreditProcess,
    Approve,
}

impl Disposition {
    pub const fn tag(self) -> &'static str {
        match self {
            Disposition::Reject => "REJECT",
            Disposition::CreditProcess => "CREDIT_PROCESS",
            Disposition::Approve => "APPROVE",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

pub const DISPOSITION_SOURCE: &str = "DISPOSITION";

/// One append-only entry of a prospect's decision trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub prospect_id: ProspectId,
    pub status_process: StatusProcess,
    pub activity: Activity,
    pub decision: Decision,
    pub rule_code: String,
    pub source_decision: String,
    pub reason: String,
    pub info: serde_json::Value,
    pub next_step: Option<String>,
}

impl AuditRecord {
    /// Record for a stage outcome. `next_step` is the tag of whatever follows on PASS.
    pub fn from_stage(
        prospect_id: &ProspectId,
        result: &StageResult,
        info: serde_json::Value,
        next_step: Option<String>,
    ) -> Self {
        let (status_process, activity, decision, next_step) = match result.result {
            Verdict::Pass => (
                StatusProcess::OnProcess,
                Activity::Process,
                Decision::Pass,
                next_step,
            ),
            Verdict::Contingency => (
                StatusProcess::OnProcess,
                Activity::Process,
                Decision::CreditProcess,
                next_step,
            ),
            Verdict::Reject => (StatusProcess::Final, Activity::Stop, Decision::Reject, None),
        };

        Self {
            prospect_id: prospect_id.clone(),
            status_process,
            activity,
            decision,
            rule_code: result.code.clone(),
            source_decision: result.source_decision.tag().to_string(),
            reason: result.reason.clone(),
            info,
            next_step,
        }
    }

    /// Terminal record closing a run in which every stage passed.
    pub fn disposition(
        prospect_id: &ProspectId,
        disposition: Disposition,
        rule_code: &str,
        reason: impl Into<String>,
        info: serde_json::Value,
    ) -> Self {
        let (status_process, activity, decision) = match disposition {
            Disposition::Approve => (StatusProcess::Final, Activity::Stop, Decision::Approve),
            Disposition::CreditProcess => (
                StatusProcess::OnProcess,
                Activity::Unprocess,
                Decision::CreditProcess,
            ),
            Disposition::Reject => (StatusProcess::Final, Activity::Stop, Decision::Reject),
        };

        Self {
            prospect_id: prospect_id.clone(),
            status_process,
            activity,
            decision,
            rule_code: rule_code.to_string(),
            source_decision: DISPOSITION_SOURCE.to_string(),
            reason: reason.into(),
            info,
            next_step: None,
        }
    }

    /// Key under which stores deduplicate re-submitted records.
    pub fn idempotency_key(&self) -> String {
        format!("{}/{}", self.prospect_id.0, self.source_decision)
    }

    pub fn is_terminal(&self) -> bool {
        self.next_step.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrailError {
    #[error("record {index} points to {expected:?} but the next record comes from {found}")]
    BrokenLink {
        index: usize,
        expected: Option<String>,
        found: String,
    },
    #[error("trail ends at record {index} which still points to {next}")]
    Dangling { index: usize, next: String },
    #[error("record {index} belongs to prospect {found}, expected {expected}")]
    ForeignRecord {
        index: usize,
        expected: ProspectId,
        found: ProspectId,
    },
}

/// Append-only sequence of audit records for one prospect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionTrail {
    records: Vec<AuditRecord>,
}

impl DecisionTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: AuditRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&AuditRecord> {
        self.records.last()
    }

    /// Walk the NextStep pointers and confirm they form a finite chain across the
    /// records in order. A partial trail from an aborted run may end on a dangling
    /// pointer; pass `complete = false` to allow that.
    pub fn verify_links(&self, complete: bool) -> Result<(), TrailError> {
        let Some(first) = self.records.first() else {
            return Ok(());
        };

        for (index, pair) in self.records.windows(2).enumerate() {
            let (current, next) = (&pair[0], &pair[1]);
            if next.prospect_id != first.prospect_id {
                return Err(TrailError::ForeignRecord {
                    index: index + 1,
                    expected: first.prospect_id.clone(),
                    found: next.prospect_id.clone(),
                });
            }
            if current.next_step.as_deref() != Some(next.source_decision.as_str()) {
                return Err(TrailError::BrokenLink {
                    index,
                    expected: current.next_step.clone(),
                    found: next.source_decision.clone(),
                });
            }
        }

        if complete {
            if let Some(last) = self.records.last() {
                if let Some(next) = &last.next_step {
                    return Err(TrailError::Dangling {
                        index: self.records.len() - 1,
                        next: next.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl From<Vec<AuditRecord>> for DecisionTrail {
    fn from(records: Vec<AuditRecord>) -> Self {
        Self { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::underwriting::domain::{CustomerStatus, RuleCode};
    use serde_json::json;

    #[test]
    fn standard_route_is_total_and_acyclic() {
        let order = validate_route(ROUTE).expect("route validates");
        assert_eq!(order.len(), StageId::ALL.len());
        assert_eq!(order.first(), Some(&StageId::LockSystem));
        assert_eq!(order.last(), Some(&StageId::Elaborate));
        assert_eq!(StageId::Elaborate.next(), None);
    }

    #[test]
    fn cyclic_route_is_rejected() {
        let mut route = ROUTE.to_vec();
        route[10] = (StageId::Elaborate, Some(StageId::Dupcheck));
        assert_eq!(
            validate_route(&route),
            Err(RouteError::Cycle(StageId::Dupcheck))
        );
    }

    #[test]
    fn route_missing_a_stage_is_rejected() {
        let route: Vec<_> = ROUTE
            .iter()
            .copied()
            .filter(|(stage, _)| *stage != StageId::Bureau)
            .collect();
        assert_eq!(
            validate_route(&route),
            Err(RouteError::MissingStage(StageId::Bureau))
        );
    }

    #[test]
    fn disconnected_route_is_rejected() {
        let mut route = ROUTE.to_vec();
        route[5] = (StageId::Pmk, None);
        assert_eq!(
            validate_route(&route),
            Err(RouteError::Unreachable(StageId::Dsr))
        );
    }

    #[test]
    fn reject_records_are_terminal() {
        let prospect = ProspectId("P-1".to_string());
        let result = StageResult::new(
            StageId::Blacklist,
            RuleCode::reject("BLK-11", "applicant blacklisted"),
            CustomerStatus::New,
            "applicant blacklisted",
        );
        let record =
            AuditRecord::from_stage(&prospect, &result, json!({}), Some("VEHICLE_AGE".into()));

        assert_eq!(record.status_process, StatusProcess::Final);
        assert_eq!(record.activity, Activity::Stop);
        assert_eq!(record.decision, Decision::Reject);
        assert!(record.is_terminal());
        assert_eq!(record.idempotency_key(), "P-1/BLACKLIST");
    }

    #[test]
    fn verify_links_detects_broken_chain() {
        let prospect = ProspectId("P-2".to_string());
        let pass = StageResult::new(
            StageId::Dupcheck,
            RuleCode::pass("DUP-00", "new customer"),
            CustomerStatus::New,
            "NEW - no history",
        );
        let mut trail = DecisionTrail::new();
        trail.append(AuditRecord::from_stage(
            &prospect,
            &pass,
            json!({}),
            Some("BLACKLIST".into()),
        ));

        assert!(trail.verify_links(false).is_ok());
        assert!(matches!(
            trail.verify_links(true),
            Err(TrailError::Dangling { index: 0, .. })
        ));

        let skipped = StageResult::new(
            StageId::VehicleAge,
            RuleCode::pass("VHC-00", "vehicle age within limit"),
            CustomerStatus::New,
            "NEW - vehicle age 3 <= 12",
        );
        trail.append(AuditRecord::from_stage(&prospect, &skipped, json!({}), None));
        assert!(matches!(
            trail.verify_links(true),
            Err(TrailError::BrokenLink { index: 0, .. })
        ));
    }
}
