use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::NaiveDate;
use serde_json::Value;

use crate::config::PipelineSettings;
use crate::workflows::underwriting::domain::{
    ApplicantRecord, DupcheckRecord, HomeStatus, LoanApplication, LoanTerms, LookupSubject,
    MaritalStatus, ProspectId, RuleCode, StageResult, VehicleRecord,
};
use crate::workflows::underwriting::evaluation::{
    DecisionContext, Stage, StageError, StageInput, StageOutcome,
};
use crate::workflows::underwriting::pipeline::UnderwritingPipeline;
use crate::workflows::underwriting::providers::{
    AgreementRecord, BehavioralScorer, BureauReport, ChassisRegistry, CreditBureau,
    HistoryProvider, IdentityVerifier, InstallmentProvider, ProductLine, ProviderError,
    ProviderSet, ScoreResult, VerificationResult,
};
use crate::workflows::underwriting::repository::{
    AuditStore, BanRecord, LockEvent, LockEventKind, LockScope, LockStore, RepositoryError,
};
use crate::workflows::underwriting::service::UnderwritingService;
use crate::workflows::underwriting::thresholds::{
    ConfigStore, ConfigStoreError, StoredThresholds, ThresholdFamily, ThresholdResolver,
    ThresholdSnapshot,
};
use crate::workflows::underwriting::trail::{AuditRecord, StageId};

pub(super) const APPLICANT_ID: &str = "3201011204900001";
pub(super) const SPOUSE_ID: &str = "3201015507920002";
pub(super) const CHASSIS: &str = "MH1JM8115NK100001";

pub(super) fn evaluation_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 15).expect("valid date")
}

pub(super) fn settings() -> PipelineSettings {
    PipelineSettings {
        provider_timeout: Duration::from_millis(200),
        ..PipelineSettings::default()
    }
}

pub(super) fn applicant() -> ApplicantRecord {
    ApplicantRecord {
        id_number: APPLICANT_ID.to_string(),
        encrypted_id_number: "enc-3201011204900001".to_string(),
        legal_name: "Budi Santoso".to_string(),
        birth_date: "1990-04-12".to_string(),
        mother_name: "Siti Aminah".to_string(),
        marital_status: MaritalStatus::Single,
        monthly_income: 10_000_000.0,
        home_status: HomeStatus::Owned,
        employment_since_year: "2018".to_string(),
        employment_since_month: "3".to_string(),
        residence_since_year: "2015".to_string(),
        residence_since_month: "1".to_string(),
        spouse: None,
    }
}

pub(super) fn spouse() -> ApplicantRecord {
    ApplicantRecord {
        id_number: SPOUSE_ID.to_string(),
        encrypted_id_number: "enc-3201015507920002".to_string(),
        legal_name: "Rina Wulandari".to_string(),
        birth_date: "1992-07-15".to_string(),
        mother_name: "Sri Rahayu".to_string(),
        marital_status: MaritalStatus::Married,
        monthly_income: 4_000_000.0,
        home_status: HomeStatus::Owned,
        employment_since_year: "2019".to_string(),
        employment_since_month: "8".to_string(),
        residence_since_year: "2015".to_string(),
        residence_since_month: "1".to_string(),
        spouse: None,
    }
}

pub(super) fn application(prospect: &str) -> LoanApplication {
    LoanApplication {
        prospect_id: ProspectId(prospect.to_string()),
        applicant: applicant(),
        vehicle: VehicleRecord {
            chassis_number: CHASSIS.to_string(),
            engine_number: "JM81E1100001".to_string(),
            manufacture_year: 2022,
            title_holder_name: "Budi Santoso".to_string(),
        },
        terms: LoanTerms {
            tenor_months: 36,
            installment_amount: 260_000.0,
            otr_price: 20_000_000.0,
            financed_amount: 15_000_000.0,
            customer_segment: None,
        },
    }
}

pub(super) fn married_application(prospect: &str) -> LoanApplication {
    let mut application = application(prospect);
    application.applicant.marital_status = MaritalStatus::Married;
    application.applicant.spouse = Some(Box::new(spouse()));
    application
}

/// Open agreement, paid well past the running-installment minimum.
pub(super) fn active_history() -> DupcheckRecord {
    DupcheckRecord {
        customer_id: Some("CUST-0042".to_string()),
        total_installment: Some(850_000.0),
        paid_installment_count: Some(12),
        current_overdue_days: Some(0),
        max_overdue_days: Some(3),
        active_agreement_count: Some(1),
        outstanding_principal: Some(6_000_000.0),
        ..DupcheckRecord::default()
    }
}

/// Fully settled agreement.
pub(super) fn settled_history() -> DupcheckRecord {
    DupcheckRecord {
        customer_id: Some("CUST-0077".to_string()),
        total_installment: Some(0.0),
        settlement_date: NaiveDate::from_ymd_opt(2023, 11, 30),
        paid_installment_count: Some(24),
        max_overdue_days: Some(5),
        ..DupcheckRecord::default()
    }
}

pub(super) fn thresholds() -> ThresholdSnapshot {
    ThresholdSnapshot::default()
}

/// Fake providers that let every stage pass for [`application`].
#[derive(Clone)]
pub(super) struct Fakes {
    pub(super) history: Arc<MemoryHistory>,
    pub(super) installments: Arc<MemoryInstallments>,
    pub(super) chassis: Arc<MemoryRegistry>,
    pub(super) identity: Vec<Arc<dyn IdentityVerifier>>,
    pub(super) bureau: Arc<dyn CreditBureau>,
    pub(super) scorer: Arc<dyn BehavioralScorer>,
    pub(super) locks: Arc<MemoryLocks>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            history: Arc::new(MemoryHistory::default()),
            installments: Arc::new(MemoryInstallments::default()),
            chassis: Arc::new(MemoryRegistry::default()),
            identity: vec![Arc::new(FixedVerifier::matched("dukcapil"))],
            bureau: Arc::new(FixedBureau::clear()),
            scorer: Arc::new(FixedScorer::new(720.0, "LOW")),
            locks: Arc::new(MemoryLocks::default()),
        }
    }
}

impl Fakes {
    pub(super) fn providers(&self) -> ProviderSet {
        ProviderSet {
            history: self.history.clone(),
            installments: self.installments.clone(),
            chassis: self.chassis.clone(),
            identity: self.identity.clone(),
            bureau: self.bureau.clone(),
            scorer: self.scorer.clone(),
            locks: self.locks.clone(),
        }
    }

    pub(super) fn pipeline(&self) -> UnderwritingPipeline {
        self.pipeline_with(settings())
    }

    pub(super) fn pipeline_with(&self, settings: PipelineSettings) -> UnderwritingPipeline {
        UnderwritingPipeline::standard(&self.providers(), settings).expect("standard route")
    }

    pub(super) fn service(
        &self,
        audit: Arc<MemoryAuditStore>,
        config: Arc<MemoryConfigStore>,
    ) -> UnderwritingService<MemoryAuditStore> {
        UnderwritingService::new(
            self.pipeline(),
            ThresholdResolver::new(config),
            audit,
            self.locks.clone(),
        )
    }
}

pub(super) fn build_service() -> (
    UnderwritingService<MemoryAuditStore>,
    Fakes,
    Arc<MemoryAuditStore>,
) {
    let fakes = Fakes::default();
    let audit = Arc::new(MemoryAuditStore::default());
    let service = fakes.service(audit.clone(), Arc::new(MemoryConfigStore::default()));
    (service, fakes, audit)
}

#[derive(Default)]
pub(super) struct MemoryHistory {
    records: Mutex<HashMap<String, DupcheckRecord>>,
    calls: AtomicUsize,
}

impl MemoryHistory {
    pub(super) fn insert(&self, id_number: &str, record: DupcheckRecord) {
        self.records
            .lock()
            .expect("history mutex poisoned")
            .insert(id_number.to_string(), record);
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryProvider for MemoryHistory {
    async fn lookup_customer(
        &self,
        subject: &LookupSubject<'_>,
    ) -> Result<Option<DupcheckRecord>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .lock()
            .expect("history mutex poisoned")
            .get(subject.id_number)
            .cloned())
    }
}

#[derive(Default)]
pub(super) struct MemoryInstallments {
    amounts: Mutex<HashMap<(String, ProductLine), f64>>,
    top_ups: Mutex<HashMap<String, f64>>,
    failing_line: Mutex<Option<ProductLine>>,
    calls: AtomicUsize,
}

impl MemoryInstallments {
    pub(super) fn set(&self, id_number: &str, line: ProductLine, amount: f64) {
        self.amounts
            .lock()
            .expect("installment mutex poisoned")
            .insert((id_number.to_string(), line), amount);
    }

    pub(super) fn set_top_up(&self, id_number: &str, amount: f64) {
        self.top_ups
            .lock()
            .expect("installment mutex poisoned")
            .insert(id_number.to_string(), amount);
    }

    pub(super) fn fail_line(&self, line: ProductLine) {
        *self.failing_line.lock().expect("installment mutex poisoned") = Some(line);
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstallmentProvider for MemoryInstallments {
    async fn scan(
        &self,
        line: ProductLine,
        subject: &LookupSubject<'_>,
    ) -> Result<f64, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing_line.lock().expect("installment mutex poisoned") == Some(line) {
            return Err(ProviderError::Status {
                provider: line.label().to_string(),
                status: 500,
            });
        }
        Ok(self
            .amounts
            .lock()
            .expect("installment mutex poisoned")
            .get(&(subject.id_number.to_string(), line))
            .copied()
            .unwrap_or(0.0))
    }

    async fn top_up_installment(
        &self,
        subject: &LookupSubject<'_>,
    ) -> Result<Option<f64>, ProviderError> {
        Ok(self
            .top_ups
            .lock()
            .expect("installment mutex poisoned")
            .get(subject.id_number)
            .copied())
    }
}

#[derive(Default)]
pub(super) struct MemoryRegistry {
    agreements: Mutex<HashMap<String, AgreementRecord>>,
}

impl MemoryRegistry {
    pub(super) fn insert(&self, chassis_number: &str, agreement: AgreementRecord) {
        self.agreements
            .lock()
            .expect("registry mutex poisoned")
            .insert(chassis_number.to_string(), agreement);
    }
}

#[async_trait]
impl ChassisRegistry for MemoryRegistry {
    async fn lookup_agreement(
        &self,
        chassis_number: &str,
    ) -> Result<Option<AgreementRecord>, ProviderError> {
        Ok(self
            .agreements
            .lock()
            .expect("registry mutex poisoned")
            .get(chassis_number)
            .cloned())
    }
}

pub(super) struct FixedVerifier {
    name: String,
    outcome: Result<VerificationResult, ProviderError>,
    calls: AtomicUsize,
}

impl FixedVerifier {
    pub(super) fn matched(name: &str) -> Self {
        Self::new(
            name,
            Ok(VerificationResult {
                matched: true,
                similarity: Some(0.98),
                detail: "record found".to_string(),
            }),
        )
    }

    pub(super) fn mismatched(name: &str) -> Self {
        Self::new(
            name,
            Ok(VerificationResult {
                matched: false,
                similarity: Some(0.41),
                detail: "name mismatch".to_string(),
            }),
        )
    }

    pub(super) fn failing(name: &str) -> Self {
        Self::new(
            name,
            Err(ProviderError::Status {
                provider: name.to_string(),
                status: 503,
            }),
        )
    }

    fn new(name: &str, outcome: Result<VerificationResult, ProviderError>) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            calls: AtomicUsize::new(0),
        }
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityVerifier for FixedVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(
        &self,
        _applicant: &ApplicantRecord,
    ) -> Result<VerificationResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

pub(super) struct FixedBureau {
    report: BureauReport,
    delay: Option<Duration>,
}

impl FixedBureau {
    pub(super) fn clear() -> Self {
        Self::with_report(BureauReport {
            worst_collectability: 1,
            max_overdue_days: 0,
            total_outstanding: 0.0,
            active_facilities: 0,
        })
    }

    pub(super) fn with_report(report: BureauReport) -> Self {
        Self {
            report,
            delay: None,
        }
    }

    /// Answers only after `delay`, to exercise the provider timeout.
    pub(super) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::clear()
        }
    }
}

#[async_trait]
impl CreditBureau for FixedBureau {
    async fn query(&self, _applicant: &ApplicantRecord) -> Result<BureauReport, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.report.clone())
    }
}

pub(super) struct FixedScorer {
    outcome: Result<ScoreResult, ProviderError>,
}

impl FixedScorer {
    pub(super) fn new(score: f64, band: &str) -> Self {
        Self {
            outcome: Ok(ScoreResult {
                score,
                band: band.to_string(),
            }),
        }
    }

    pub(super) fn unavailable() -> Self {
        Self {
            outcome: Err(ProviderError::Status {
                provider: "behavioral_scorer".to_string(),
                status: 502,
            }),
        }
    }
}

#[async_trait]
impl BehavioralScorer for FixedScorer {
    async fn score(
        &self,
        _applicant: &ApplicantRecord,
        _report: Option<&BureauReport>,
    ) -> Result<ScoreResult, ProviderError> {
        self.outcome.clone()
    }
}

#[derive(Default)]
pub(super) struct MemoryLocks {
    bans: Mutex<Vec<BanRecord>>,
    events: Mutex<Vec<LockEvent>>,
}

impl MemoryLocks {
    pub(super) fn bans(&self) -> Vec<BanRecord> {
        self.bans.lock().expect("lock store mutex poisoned").clone()
    }

    pub(super) fn events(&self) -> Vec<LockEvent> {
        self.events.lock().expect("lock store mutex poisoned").clone()
    }

    pub(super) fn push_event(
        &self,
        scope: LockScope,
        subject: &str,
        kind: LockEventKind,
        occurred_on: NaiveDate,
    ) {
        self.events
            .lock()
            .expect("lock store mutex poisoned")
            .push(LockEvent {
                scope,
                subject: subject.to_string(),
                kind,
                prospect_id: ProspectId(format!("P-{occurred_on}")),
                occurred_on,
                snapshot: None,
            });
    }
}

#[async_trait]
impl LockStore for MemoryLocks {
    async fn active_ban(
        &self,
        scope: LockScope,
        subject: &str,
        today: NaiveDate,
    ) -> Result<Option<BanRecord>, RepositoryError> {
        Ok(self
            .bans
            .lock()
            .expect("lock store mutex poisoned")
            .iter()
            .filter(|ban| ban.scope == scope && ban.subject == subject && ban.is_active(today))
            .max_by_key(|ban| ban.unban_date)
            .cloned())
    }

    async fn events_since(
        &self,
        scope: LockScope,
        subject: &str,
        kind: LockEventKind,
        since: NaiveDate,
    ) -> Result<Vec<LockEvent>, RepositoryError> {
        Ok(self
            .events
            .lock()
            .expect("lock store mutex poisoned")
            .iter()
            .filter(|event| {
                event.scope == scope
                    && event.subject == subject
                    && event.kind == kind
                    && event.occurred_on >= since
            })
            .cloned()
            .collect())
    }

    async fn save_ban(&self, ban: BanRecord) -> Result<(), RepositoryError> {
        self.bans.lock().expect("lock store mutex poisoned").push(ban);
        Ok(())
    }

    async fn record_event(&self, event: LockEvent) -> Result<(), RepositoryError> {
        self.events
            .lock()
            .expect("lock store mutex poisoned")
            .push(event);
        Ok(())
    }
}

/// Lock store whose reads fail, to check that ban lookups never read as "not banned".
pub(super) struct UnavailableLocks;

#[async_trait]
impl LockStore for UnavailableLocks {
    async fn active_ban(
        &self,
        _scope: LockScope,
        _subject: &str,
        _today: NaiveDate,
    ) -> Result<Option<BanRecord>, RepositoryError> {
        Err(RepositoryError::Unavailable("ban table offline".to_string()))
    }

    async fn events_since(
        &self,
        _scope: LockScope,
        _subject: &str,
        _kind: LockEventKind,
        _since: NaiveDate,
    ) -> Result<Vec<LockEvent>, RepositoryError> {
        Err(RepositoryError::Unavailable("ban table offline".to_string()))
    }

    async fn save_ban(&self, _ban: BanRecord) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("ban table offline".to_string()))
    }

    async fn record_event(&self, _event: LockEvent) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("ban table offline".to_string()))
    }
}

#[derive(Default)]
pub(super) struct MemoryAuditStore {
    records: Mutex<HashMap<ProspectId, Vec<AuditRecord>>>,
    appends: AtomicUsize,
}

impl MemoryAuditStore {
    pub(super) fn stored(&self, prospect_id: &ProspectId) -> Vec<AuditRecord> {
        self.records
            .lock()
            .expect("audit mutex poisoned")
            .get(prospect_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(super) fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(
        &self,
        prospect_id: &ProspectId,
        records: &[AuditRecord],
    ) -> Result<(), RepositoryError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.records.lock().expect("audit mutex poisoned");
        let stored = guard.entry(prospect_id.clone()).or_default();
        for record in records {
            let key = record.idempotency_key();
            if !stored.iter().any(|existing| existing.idempotency_key() == key) {
                stored.push(record.clone());
            }
        }
        Ok(())
    }

    async fn trail(&self, prospect_id: &ProspectId) -> Result<Vec<AuditRecord>, RepositoryError> {
        Ok(self.stored(prospect_id))
    }
}

pub(super) struct UnavailableAuditStore;

#[async_trait]
impl AuditStore for UnavailableAuditStore {
    async fn append(
        &self,
        _prospect_id: &ProspectId,
        _records: &[AuditRecord],
    ) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("audit database offline".to_string()))
    }

    async fn trail(&self, _prospect_id: &ProspectId) -> Result<Vec<AuditRecord>, RepositoryError> {
        Err(RepositoryError::Unavailable("audit database offline".to_string()))
    }
}

#[derive(Default)]
pub(super) struct MemoryConfigStore {
    bodies: Mutex<HashMap<ThresholdFamily, StoredThresholds>>,
}

impl MemoryConfigStore {
    pub(super) fn publish(&self, family: ThresholdFamily, version: u32, body: &str) {
        self.bodies.lock().expect("config mutex poisoned").insert(
            family,
            StoredThresholds {
                version,
                body: body.to_string(),
            },
        );
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn latest(
        &self,
        family: ThresholdFamily,
    ) -> Result<Option<StoredThresholds>, ConfigStoreError> {
        Ok(self
            .bodies
            .lock()
            .expect("config mutex poisoned")
            .get(&family)
            .cloned())
    }
}

/// Stage double with a fixed verdict that counts its invocations.
pub(super) struct CountingStage {
    id: StageId,
    rule: RuleCode,
    calls: Arc<AtomicUsize>,
}

impl CountingStage {
    pub(super) fn new(id: StageId, rule: RuleCode) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                id,
                rule,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Stage for CountingStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn evaluate(
        &self,
        _input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StageOutcome::new(
            StageResult::with_status(self.id, self.rule, context.customer_status, self.rule.description),
            Value::Null,
        ))
    }
}

/// Stage double that fails with a fixed provider error.
pub(super) struct FailingStage {
    pub(super) id: StageId,
    pub(super) error: ProviderError,
}

#[async_trait]
impl Stage for FailingStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn evaluate(
        &self,
        _input: &StageInput<'_>,
        _context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        Err(self.error.clone().into())
    }
}

pub(super) fn context() -> DecisionContext {
    DecisionContext::new(evaluation_date())
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
