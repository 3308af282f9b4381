//! Ban/lock attempt tracking.
//!
//! Applicant-level bans are keyed by the encrypted ID number, vehicle-level bans by
//! the raw chassis number. Store failures propagate: a ban that could not be read or
//! written must abort the run rather than read as "not banned".

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::{DecisionContext, Stage, StageError, StageInput, StageOutcome};
use crate::workflows::underwriting::domain::{ApplicationSnapshot, RuleCode, StageResult};
use crate::workflows::underwriting::fanout::fetch_all;
use crate::workflows::underwriting::repository::{
    BanReason, BanRecord, LockEventKind, LockScope, LockStore, RepositoryError,
};
use crate::workflows::underwriting::thresholds::LockThresholds;
use crate::workflows::underwriting::trail::StageId;

const NOT_LOCKED: RuleCode = RuleCode::pass("LCK-00", "no active lock");
const APPLICANT_REJECTED: RuleCode =
    RuleCode::reject("LCK-01", "applicant banned after repeated rejections");
const APPLICANT_CANCELLED: RuleCode =
    RuleCode::reject("LCK-02", "applicant banned after repeated cancellations");
const CHASSIS_BANNED: RuleCode =
    RuleCode::reject("LCK-03", "chassis banned after repeated rejections or cancellations");
const CHASSIS_ATTEMPT_LIMIT: RuleCode =
    RuleCode::reject("LCK-04", "chassis attempt limit reached");
const CHASSIS_IDENTICAL: RuleCode =
    RuleCode::reject("LCK-05", "chassis resubmitted with identical data");

pub const CODES: &[RuleCode] = &[
    NOT_LOCKED,
    APPLICANT_REJECTED,
    APPLICANT_CANCELLED,
    CHASSIS_BANNED,
    CHASSIS_ATTEMPT_LIMIT,
    CHASSIS_IDENTICAL,
];

/// Ban state of one subject on the evaluation date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockState {
    pub is_banned: bool,
    pub reason: Option<BanReason>,
    pub unban_date: Option<NaiveDate>,
}

impl LockState {
    pub fn clear() -> Self {
        Self {
            is_banned: false,
            reason: None,
            unban_date: None,
        }
    }

    fn from_ban(ban: &BanRecord) -> Self {
        Self {
            is_banned: true,
            reason: Some(ban.reason),
            unban_date: Some(ban.unban_date),
        }
    }
}

struct BanWindow {
    kind: LockEventKind,
    attempts: u32,
    window_days: u32,
    ban_days: u32,
    reason: BanReason,
}

/// Sliding-window ban check for one subject.
///
/// An existing active ban is returned as stored. Otherwise reject events are counted
/// over the reject window, then cancel events over the cancel window; the first count
/// reaching its attempt threshold creates a ban that lifts `ban_days` after the oldest
/// counted event. The ban is reported for the current run even when that date is not
/// after `today`. An attempt threshold of zero disables that rule.
pub async fn check_lock(
    store: &dyn LockStore,
    scope: LockScope,
    subject: &str,
    thresholds: &LockThresholds,
    today: NaiveDate,
) -> Result<LockState, RepositoryError> {
    if subject.trim().is_empty() {
        return Ok(LockState::clear());
    }

    if let Some(ban) = store.active_ban(scope, subject, today).await? {
        debug!(?scope, reason = %ban.reason, "active ban found");
        return Ok(LockState::from_ban(&ban));
    }

    let windows = [
        BanWindow {
            kind: LockEventKind::Reject,
            attempts: thresholds.lock_reject_attempt,
            window_days: thresholds.lock_reject_window_days,
            ban_days: thresholds.lock_reject_ban_days,
            reason: BanReason::PreviouslyRejected,
        },
        BanWindow {
            kind: LockEventKind::Cancel,
            attempts: thresholds.lock_cancel_attempt,
            window_days: thresholds.lock_cancel_window_days,
            ban_days: thresholds.lock_cancel_ban_days,
            reason: BanReason::PreviouslyCancelled,
        },
    ];

    let lookups: Vec<_> = windows
        .iter()
        .map(|window| {
            store.events_since(
                scope,
                subject,
                window.kind,
                days_before(today, window.window_days),
            )
        })
        .collect();
    let counted = fetch_all(lookups).await?;

    for (window, events) in windows.iter().zip(counted) {
        if window.attempts == 0 || events.len() < window.attempts as usize {
            continue;
        }
        let Some(oldest) = events.iter().map(|event| event.occurred_on).min() else {
            continue;
        };
        let unban_date = days_after(oldest, window.ban_days);

        let ban = BanRecord {
            scope,
            subject: subject.to_string(),
            reason: window.reason,
            banned_on: today,
            unban_date,
        };
        store.save_ban(ban.clone()).await?;
        info!(?scope, reason = %ban.reason, %unban_date, attempts = events.len(), "ban recorded");
        return Ok(LockState::from_ban(&ban));
    }

    Ok(LockState::clear())
}

/// Chassis-fraud attempt tracker.
///
/// Rejected attempts on the same chassis within the chassis window are tolerated until
/// their count reaches `chassis_attempt_limit`, or until the current application is
/// identical, field for field, to one of them. Either condition bans the chassis for
/// `chassis_ban_days` from today.
pub async fn check_chassis_attempts(
    store: &dyn LockStore,
    chassis_number: &str,
    snapshot: &ApplicationSnapshot,
    thresholds: &LockThresholds,
    today: NaiveDate,
) -> Result<LockState, RepositoryError> {
    if chassis_number.trim().is_empty() {
        return Ok(LockState::clear());
    }

    let rejected = store
        .events_since(
            LockScope::Chassis,
            chassis_number,
            LockEventKind::Reject,
            days_before(today, thresholds.chassis_window_days),
        )
        .await?;

    let identical = rejected
        .iter()
        .any(|event| event.snapshot.as_ref() == Some(snapshot));
    let limit_reached = thresholds.chassis_attempt_limit > 0
        && rejected.len() >= thresholds.chassis_attempt_limit as usize;

    let reason = if identical {
        BanReason::IdenticalResubmission
    } else if limit_reached {
        BanReason::ChassisAttemptLimit
    } else {
        return Ok(LockState::clear());
    };

    let unban_date = days_after(today, thresholds.chassis_ban_days);

    let ban = BanRecord {
        scope: LockScope::Chassis,
        subject: chassis_number.to_string(),
        reason,
        banned_on: today,
        unban_date,
    };
    store.save_ban(ban.clone()).await?;
    info!(reason = %ban.reason, %unban_date, attempts = rejected.len(), "chassis ban recorded");
    Ok(LockState::from_ban(&ban))
}

fn days_before(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_sub_days(Days::new(u64::from(days))).unwrap_or(NaiveDate::MIN)
}

fn days_after(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_add_days(Days::new(u64::from(days))).unwrap_or(NaiveDate::MAX)
}

fn rule_for(scope: LockScope, reason: Option<BanReason>) -> RuleCode {
    match (scope, reason) {
        (LockScope::Applicant, Some(BanReason::PreviouslyCancelled)) => APPLICANT_CANCELLED,
        (LockScope::Applicant, _) => APPLICANT_REJECTED,
        (LockScope::Chassis, Some(BanReason::ChassisAttemptLimit)) => CHASSIS_ATTEMPT_LIMIT,
        (LockScope::Chassis, Some(BanReason::IdenticalResubmission)) => CHASSIS_IDENTICAL,
        (LockScope::Chassis, _) => CHASSIS_BANNED,
    }
}

/// Entry gate: applicant ban, chassis ban, then the chassis attempt tracker.
pub struct LockSystemStage {
    store: Arc<dyn LockStore>,
}

impl LockSystemStage {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    fn banned(&self, context: &DecisionContext, scope: LockScope, state: LockState) -> StageOutcome {
        let rule = rule_for(scope, state.reason);
        let until = state
            .unban_date
            .map(|date| date.to_string())
            .unwrap_or_else(|| "further notice".to_string());
        let reason = format!("{} until {until}", rule.description);
        let result = StageResult::new(StageId::LockSystem, rule, context.customer_status, reason);
        StageOutcome::new(result, json!({ "scope": scope, "lock": state }))
    }
}

#[async_trait]
impl Stage for LockSystemStage {
    fn id(&self) -> StageId {
        StageId::LockSystem
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let application = input.application;
        let thresholds = &input.thresholds.lock;
        let today = context.evaluated_on;

        let applicant = check_lock(
            self.store.as_ref(),
            LockScope::Applicant,
            &application.applicant.encrypted_id_number,
            thresholds,
            today,
        )
        .await?;
        if applicant.is_banned {
            return Ok(self.banned(context, LockScope::Applicant, applicant));
        }

        let chassis_number = &application.vehicle.chassis_number;
        let chassis = check_lock(
            self.store.as_ref(),
            LockScope::Chassis,
            chassis_number,
            thresholds,
            today,
        )
        .await?;
        if chassis.is_banned {
            return Ok(self.banned(context, LockScope::Chassis, chassis));
        }

        let attempts = check_chassis_attempts(
            self.store.as_ref(),
            chassis_number,
            &application.snapshot(),
            thresholds,
            today,
        )
        .await?;
        if attempts.is_banned {
            return Ok(self.banned(context, LockScope::Chassis, attempts));
        }

        let result = StageResult::new(
            StageId::LockSystem,
            NOT_LOCKED,
            context.customer_status,
            NOT_LOCKED.description,
        );
        Ok(StageOutcome::new(
            result,
            json!({ "applicant": applicant, "chassis": chassis }),
        ))
    }
}
