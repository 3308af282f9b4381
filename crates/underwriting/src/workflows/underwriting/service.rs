use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::domain::{LoanApplication, ProspectId};
use super::pipeline::{PipelineAbort, PipelineOutcome, UnderwritingPipeline};
use super::providers::CancelSignal;
use super::repository::{
    AuditStore, LockEvent, LockEventKind, LockScope, LockStore, RepositoryError,
};
use super::thresholds::ThresholdResolver;
use super::trail::{DecisionTrail, Disposition, StageId};

/// Keys a cancellation is recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRequest {
    #[serde(default)]
    pub encrypted_id_number: String,
    #[serde(default)]
    pub chassis_number: String,
}

impl CancellationRequest {
    pub fn from_application(application: &LoanApplication) -> Self {
        Self {
            encrypted_id_number: application.applicant.encrypted_id_number.clone(),
            chassis_number: application.vehicle.chassis_number.clone(),
        }
    }
}

/// What a cancellation touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancellationReceipt {
    pub prospect_id: ProspectId,
    /// An in-flight run for the prospect was signalled.
    pub interrupted_run: bool,
    pub events_recorded: usize,
}

/// Service composing the threshold resolver, the pipeline and the audit and lock stores.
pub struct UnderwritingService<A> {
    pipeline: Arc<UnderwritingPipeline>,
    thresholds: Arc<ThresholdResolver>,
    audit: Arc<A>,
    locks: Arc<dyn LockStore>,
    in_flight: Mutex<HashMap<ProspectId, CancelSignal>>,
}

impl<A> UnderwritingService<A>
where
    A: AuditStore + 'static,
{
    pub fn new(
        pipeline: UnderwritingPipeline,
        thresholds: ThresholdResolver,
        audit: Arc<A>,
        locks: Arc<dyn LockStore>,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            thresholds: Arc::new(thresholds),
            audit,
            locks,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &UnderwritingPipeline {
        &self.pipeline
    }

    /// Evaluate an application on today's local date and persist its trail.
    pub async fn evaluate(
        &self,
        application: &LoanApplication,
        cancel: CancelSignal,
    ) -> Result<PipelineOutcome, UnderwritingServiceError> {
        let today = self.pipeline.settings().today();
        self.evaluate_on(application, cancel, today).await
    }

    /// Evaluate on an explicit local date.
    ///
    /// Partial trails of aborted runs are persisted before the abort is returned. A
    /// REJECT from any business stage is recorded as a reject event for the applicant
    /// and the chassis; bans issued by the lock gate itself are not counted again.
    pub async fn evaluate_on(
        &self,
        application: &LoanApplication,
        cancel: CancelSignal,
        evaluated_on: NaiveDate,
    ) -> Result<PipelineOutcome, UnderwritingServiceError> {
        let prospect_id = &application.prospect_id;
        let _registration = self.register(prospect_id, &cancel)?;

        let thresholds = self.thresholds.snapshot().await;
        let run = self
            .pipeline
            .run_on(application, &thresholds, &cancel, evaluated_on)
            .await;

        match run {
            Ok(outcome) => {
                self.audit
                    .append(prospect_id, outcome.trail.records())
                    .await?;
                if outcome.disposition == Disposition::Reject {
                    self.record_reject(application, &outcome.trail, evaluated_on)
                        .await?;
                }
                Ok(outcome)
            }
            Err(abort) => {
                if !abort.trail.is_empty() {
                    if let Err(err) = self.audit.append(prospect_id, abort.trail.records()).await
                    {
                        error!(
                            %prospect_id,
                            abort = %abort.error,
                            error = %err,
                            "failed to persist partial trail of aborted run"
                        );
                        return Err(UnderwritingServiceError::Persistence(err));
                    }
                }
                Err(UnderwritingServiceError::Pipeline(abort))
            }
        }
    }

    /// Record cancel events for the applicant and chassis, and signal the prospect's
    /// in-flight run if there is one.
    pub async fn record_cancellation(
        &self,
        prospect_id: &ProspectId,
        request: &CancellationRequest,
    ) -> Result<CancellationReceipt, UnderwritingServiceError> {
        let interrupted_run = self.cancel_run(prospect_id);
        let today = self.pipeline.settings().today();

        let mut events_recorded = 0;
        for (scope, subject) in [
            (LockScope::Applicant, request.encrypted_id_number.trim()),
            (LockScope::Chassis, request.chassis_number.trim()),
        ] {
            if subject.is_empty() {
                continue;
            }
            self.locks
                .record_event(LockEvent {
                    scope,
                    subject: subject.to_string(),
                    kind: LockEventKind::Cancel,
                    prospect_id: prospect_id.clone(),
                    occurred_on: today,
                    snapshot: None,
                })
                .await?;
            events_recorded += 1;
        }

        info!(%prospect_id, interrupted_run, events_recorded, "cancellation recorded");
        Ok(CancellationReceipt {
            prospect_id: prospect_id.clone(),
            interrupted_run,
            events_recorded,
        })
    }

    /// Signal the in-flight run for `prospect_id`. Returns whether one was running.
    pub fn cancel_run(&self, prospect_id: &ProspectId) -> bool {
        let registry = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match registry.get(prospect_id) {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    /// Persisted trail of a prospect.
    pub async fn trail(
        &self,
        prospect_id: &ProspectId,
    ) -> Result<DecisionTrail, UnderwritingServiceError> {
        let records = self.audit.trail(prospect_id).await?;
        if records.is_empty() {
            return Err(UnderwritingServiceError::UnknownProspect(prospect_id.clone()));
        }
        Ok(DecisionTrail::from(records))
    }

    async fn record_reject(
        &self,
        application: &LoanApplication,
        trail: &DecisionTrail,
        today: NaiveDate,
    ) -> Result<(), RepositoryError> {
        let gated = trail
            .last()
            .map(|record| record.source_decision == StageId::LockSystem.tag())
            .unwrap_or(false);
        if gated {
            return Ok(());
        }

        let prospect_id = &application.prospect_id;
        let applicant = application.applicant.encrypted_id_number.trim();
        let chassis = application.vehicle.chassis_number.trim();
        let events = [
            (LockScope::Applicant, applicant, None),
            (LockScope::Chassis, chassis, Some(application.snapshot())),
        ];

        for (scope, subject, snapshot) in events {
            if subject.is_empty() {
                warn!(%prospect_id, ?scope, "reject event skipped: blank subject");
                continue;
            }
            self.locks
                .record_event(LockEvent {
                    scope,
                    subject: subject.to_string(),
                    kind: LockEventKind::Reject,
                    prospect_id: prospect_id.clone(),
                    occurred_on: today,
                    snapshot,
                })
                .await?;
        }
        Ok(())
    }

    fn register(
        &self,
        prospect_id: &ProspectId,
        cancel: &CancelSignal,
    ) -> Result<InFlightRun<'_>, UnderwritingServiceError> {
        let mut registry = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registry.contains_key(prospect_id) {
            return Err(UnderwritingServiceError::InFlight(prospect_id.clone()));
        }
        registry.insert(prospect_id.clone(), cancel.clone());
        Ok(InFlightRun {
            registry: &self.in_flight,
            prospect_id: prospect_id.clone(),
        })
    }
}

/// Removes a prospect from the in-flight registry when its run ends.
struct InFlightRun<'a> {
    registry: &'a Mutex<HashMap<ProspectId, CancelSignal>>,
    prospect_id: ProspectId,
}

impl Drop for InFlightRun<'_> {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.prospect_id);
    }
}

/// Error raised by the underwriting service.
#[derive(Debug, thiserror::Error)]
pub enum UnderwritingServiceError {
    #[error(transparent)]
    Pipeline(#[from] PipelineAbort),
    #[error("persistence_failure: {0}")]
    Persistence(#[from] RepositoryError),
    #[error("no decision trail recorded for prospect {0}")]
    UnknownProspect(ProspectId),
    #[error("prospect {0} is already being evaluated")]
    InFlight(ProspectId),
}
