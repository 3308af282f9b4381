use async_trait::async_trait;
use chrono::NaiveDate;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use underwriting::config::PipelineSettings;
use underwriting::error::AppError;
use underwriting::workflows::underwriting::{
    load_history_file, AgreementRecord, ApplicantRecord, AuditRecord, AuditStore, BanRecord,
    BehavioralScorer, BureauReport, ChassisRegistry, ConfigStore, ConfigStoreError, CreditBureau,
    DupcheckRecord, HistoryProvider, HistorySeed, IdentityVerifier, InstallmentProvider,
    LockEvent, LockEventKind, LockScope, LockStore, LookupSubject, ProductLine, ProspectId,
    ProviderError, ProviderSet, RepositoryError, ScoreResult, StoredThresholds, ThresholdFamily,
    ThresholdResolver, UnderwritingPipeline, UnderwritingService, VerificationResult,
};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Customer history keyed by ID number, usually seeded from a CSV export.
#[derive(Default, Clone)]
pub(crate) struct InMemoryHistory {
    records: Arc<Mutex<HashMap<String, DupcheckRecord>>>,
}

impl InMemoryHistory {
    pub(crate) fn from_seeds(seeds: Vec<HistorySeed>) -> Self {
        let history = Self::default();
        for seed in seeds {
            if let Some(record) = seed.record {
                history.insert(&seed.id_number, record);
            }
        }
        history
    }

    pub(crate) fn insert(&self, id_number: &str, record: DupcheckRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id_number.to_string(), record);
    }
}

#[async_trait]
impl HistoryProvider for InMemoryHistory {
    async fn lookup_customer(
        &self,
        subject: &LookupSubject<'_>,
    ) -> Result<Option<DupcheckRecord>, ProviderError> {
        let guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(subject.id_number).cloned())
    }
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryInstallments {
    amounts: Arc<Mutex<HashMap<(String, ProductLine), f64>>>,
}

impl InMemoryInstallments {
    pub(crate) fn set(&self, id_number: &str, line: ProductLine, amount: f64) {
        self.amounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((id_number.to_string(), line), amount);
    }
}

#[async_trait]
impl InstallmentProvider for InMemoryInstallments {
    async fn scan(
        &self,
        line: ProductLine,
        subject: &LookupSubject<'_>,
    ) -> Result<f64, ProviderError> {
        let guard = self.amounts.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .get(&(subject.id_number.to_string(), line))
            .copied()
            .unwrap_or(0.0))
    }

    async fn top_up_installment(
        &self,
        _subject: &LookupSubject<'_>,
    ) -> Result<Option<f64>, ProviderError> {
        Ok(None)
    }
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryChassisRegistry {
    agreements: Arc<Mutex<HashMap<String, AgreementRecord>>>,
}

impl InMemoryChassisRegistry {
    pub(crate) fn insert(&self, chassis_number: &str, agreement: AgreementRecord) {
        self.agreements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chassis_number.to_string(), agreement);
    }
}

#[async_trait]
impl ChassisRegistry for InMemoryChassisRegistry {
    async fn lookup_agreement(
        &self,
        chassis_number: &str,
    ) -> Result<Option<AgreementRecord>, ProviderError> {
        let guard = self.agreements.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(chassis_number).cloned())
    }
}

/// Verifier that matches every applicant with a non-blank ID number and legal name.
pub(crate) struct OfflineIdentityVerifier {
    name: &'static str,
}

impl OfflineIdentityVerifier {
    pub(crate) fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl IdentityVerifier for OfflineIdentityVerifier {
    fn name(&self) -> &str {
        self.name
    }

    async fn verify(
        &self,
        applicant: &ApplicantRecord,
    ) -> Result<VerificationResult, ProviderError> {
        let matched =
            !applicant.id_number.trim().is_empty() && !applicant.legal_name.trim().is_empty();
        Ok(VerificationResult {
            matched,
            similarity: Some(if matched { 1.0 } else { 0.0 }),
            detail: if matched {
                "offline record match".to_string()
            } else {
                "identity fields missing".to_string()
            },
        })
    }
}

/// Bureau without negative records.
pub(crate) struct OfflineBureau;

#[async_trait]
impl CreditBureau for OfflineBureau {
    async fn query(&self, _applicant: &ApplicantRecord) -> Result<BureauReport, ProviderError> {
        Ok(BureauReport {
            worst_collectability: 1,
            max_overdue_days: 0,
            total_outstanding: 0.0,
            active_facilities: 0,
        })
    }
}

/// Scorer that derives a band from the worst collectability the bureau reported.
pub(crate) struct OfflineScorer;

#[async_trait]
impl BehavioralScorer for OfflineScorer {
    async fn score(
        &self,
        _applicant: &ApplicantRecord,
        report: Option<&BureauReport>,
    ) -> Result<ScoreResult, ProviderError> {
        let collectability = report.map(|report| report.worst_collectability).unwrap_or(1);
        let (score, band) = match collectability {
            0 | 1 => (720.0, "LOW"),
            2 => (610.0, "MEDIUM"),
            _ => (480.0, "HIGH"),
        };
        Ok(ScoreResult {
            score,
            band: band.to_string(),
        })
    }
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryLockStore {
    bans: Arc<Mutex<Vec<BanRecord>>>,
    events: Arc<Mutex<Vec<LockEvent>>>,
}

impl InMemoryLockStore {
    pub(crate) fn bans(&self) -> Vec<BanRecord> {
        self.bans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn events(&self) -> Vec<LockEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn active_ban(
        &self,
        scope: LockScope,
        subject: &str,
        today: NaiveDate,
    ) -> Result<Option<BanRecord>, RepositoryError> {
        let guard = self.bans.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
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
        let guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
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
        self.bans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ban);
        Ok(())
    }

    async fn record_event(&self, event: LockEvent) -> Result<(), RepositoryError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryAuditStore {
    trails: Arc<Mutex<HashMap<ProspectId, Vec<AuditRecord>>>>,
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(
        &self,
        prospect_id: &ProspectId,
        records: &[AuditRecord],
    ) -> Result<(), RepositoryError> {
        let mut guard = self.trails.lock().unwrap_or_else(PoisonError::into_inner);
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
        let guard = self.trails.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(prospect_id).cloned().unwrap_or_default())
    }
}

/// Threshold store holding the latest published blob per family.
#[derive(Default, Clone)]
pub(crate) struct InMemoryConfigStore {
    bodies: Arc<Mutex<HashMap<ThresholdFamily, StoredThresholds>>>,
}

impl InMemoryConfigStore {
    /// Publish a new version of `family`; the next run picks it up.
    pub(crate) fn publish(&self, family: ThresholdFamily, body: &str) -> u32 {
        let mut guard = self.bodies.lock().unwrap_or_else(PoisonError::into_inner);
        let version = guard.get(&family).map(|stored| stored.version + 1).unwrap_or(1);
        guard.insert(
            family,
            StoredThresholds {
                version,
                body: body.to_string(),
            },
        );
        version
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn latest(
        &self,
        family: ThresholdFamily,
    ) -> Result<Option<StoredThresholds>, ConfigStoreError> {
        let guard = self.bodies.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(&family).cloned())
    }
}

/// In-memory wiring for every port, with handles to the stores the CLI inspects.
pub(crate) struct InMemoryBackend {
    pub(crate) service: Arc<UnderwritingService<InMemoryAuditStore>>,
    pub(crate) history: InMemoryHistory,
    pub(crate) installments: InMemoryInstallments,
    pub(crate) registry: InMemoryChassisRegistry,
    pub(crate) locks: InMemoryLockStore,
    pub(crate) thresholds: InMemoryConfigStore,
}

impl InMemoryBackend {
    pub(crate) fn build(
        settings: PipelineSettings,
        seeds: Vec<HistorySeed>,
    ) -> Result<Self, AppError> {
        let history = InMemoryHistory::from_seeds(seeds);
        let installments = InMemoryInstallments::default();
        let registry = InMemoryChassisRegistry::default();
        let locks = InMemoryLockStore::default();
        let thresholds = InMemoryConfigStore::default();

        let providers = ProviderSet {
            history: Arc::new(history.clone()),
            installments: Arc::new(installments.clone()),
            chassis: Arc::new(registry.clone()),
            identity: vec![
                Arc::new(OfflineIdentityVerifier::new("dukcapil")),
                Arc::new(OfflineIdentityVerifier::new("asliri")),
            ],
            bureau: Arc::new(OfflineBureau),
            scorer: Arc::new(OfflineScorer),
            locks: Arc::new(locks.clone()),
        };
        let pipeline = UnderwritingPipeline::standard(&providers, settings)?;
        let service = UnderwritingService::new(
            pipeline,
            ThresholdResolver::new(Arc::new(thresholds.clone())),
            Arc::new(InMemoryAuditStore::default()),
            Arc::new(locks.clone()),
        );

        Ok(Self {
            service: Arc::new(service),
            history,
            installments,
            registry,
            locks,
            thresholds,
        })
    }
}

pub(crate) fn load_seeds(path: Option<&Path>) -> Result<Vec<HistorySeed>, AppError> {
    match path {
        Some(path) => Ok(load_history_file(path)?),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(id_number: &str) -> LookupSubject<'_> {
        LookupSubject {
            id_number,
            legal_name: "Dewi Lestari",
            birth_date: "1988-03-04",
            mother_name: "Kartini",
        }
    }

    #[tokio::test]
    async fn seeds_without_history_are_not_stored() {
        let history = InMemoryHistory::from_seeds(vec![
            HistorySeed {
                id_number: "3275014403880001".to_string(),
                record: None,
            },
            HistorySeed {
                id_number: "3275014403880002".to_string(),
                record: Some(DupcheckRecord {
                    paid_installment_count: Some(9),
                    ..DupcheckRecord::default()
                }),
            },
        ]);

        let missing = history
            .lookup_customer(&subject("3275014403880001"))
            .await
            .expect("lookup succeeds");
        assert_eq!(missing, None);

        let found = history
            .lookup_customer(&subject("3275014403880002"))
            .await
            .expect("lookup succeeds")
            .expect("history present");
        assert_eq!(found.paid_installment_count, Some(9));
    }

    #[test]
    fn publishing_bumps_the_version() {
        let store = InMemoryConfigStore::default();
        assert_eq!(store.publish(ThresholdFamily::Dsr, r#"{"max_dsr_percent": 30}"#), 1);
        assert_eq!(store.publish(ThresholdFamily::Dsr, r#"{"max_dsr_percent": 40}"#), 2);
    }

    #[test]
    fn parse_date_reports_the_raw_value() {
        let err = parse_date("15/06/2025").expect_err("not ISO");
        assert!(err.contains("15/06/2025"));
    }
}
