//! Integration tests for the vehicle-loan underwriting workflow.
//!
//! Scenarios run through the public service facade and HTTP router with in-memory
//! collaborators, so routing, persistence and reject bookkeeping are exercised the way
//! a deployed service would drive them.

mod common {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use underwriting::config::PipelineSettings;
    use underwriting::workflows::underwriting::{
        parse_history, AgreementRecord, ApplicantRecord, AuditRecord, AuditStore, BanRecord,
        BehavioralScorer, BureauReport, ChassisRegistry, ConfigStore, ConfigStoreError,
        CreditBureau, DupcheckRecord, HistoryProvider, HomeStatus, IdentityVerifier,
        InstallmentProvider, LoanApplication, LoanTerms, LockEvent, LockEventKind, LockScope,
        LockStore, LookupSubject, MaritalStatus, ProductLine, ProspectId, ProviderError,
        ProviderSet, RepositoryError, ScoreResult, StoredThresholds, ThresholdFamily,
        ThresholdResolver, UnderwritingPipeline, UnderwritingService, VerificationResult,
        VehicleRecord,
    };

    pub(super) const APPLICANT_ID: &str = "3275014403880001";
    pub(super) const ENCRYPTED_ID: &str = "enc-3275014403880001";
    pub(super) const CHASSIS: &str = "MHKA1BA1JKJ000123";

    pub(super) fn evaluation_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 15).expect("valid date")
    }

    pub(super) fn application(prospect: &str) -> LoanApplication {
        LoanApplication {
            prospect_id: ProspectId(prospect.to_string()),
            applicant: ApplicantRecord {
                id_number: APPLICANT_ID.to_string(),
                encrypted_id_number: ENCRYPTED_ID.to_string(),
                legal_name: "Dewi Lestari".to_string(),
                birth_date: "1988-03-04".to_string(),
                mother_name: "Kartini".to_string(),
                marital_status: MaritalStatus::Single,
                monthly_income: 10_000_000.0,
                home_status: HomeStatus::Owned,
                employment_since_year: "2016".to_string(),
                employment_since_month: "7".to_string(),
                residence_since_year: "2012".to_string(),
                residence_since_month: "2".to_string(),
                spouse: None,
            },
            vehicle: VehicleRecord {
                chassis_number: CHASSIS.to_string(),
                engine_number: "K15BN1045678".to_string(),
                manufacture_year: 2021,
                title_holder_name: "Dewi Lestari".to_string(),
            },
            terms: LoanTerms {
                tenor_months: 24,
                installment_amount: 260_000.0,
                otr_price: 18_000_000.0,
                financed_amount: 12_000_000.0,
                customer_segment: None,
            },
        }
    }

    /// Customer-history export with one settled, blacklisted customer.
    pub(super) const BLACKLIST_EXPORT: &str = "\
id_number,customer_id,total_installment,settlement_date,paid_installment_count,max_overdue_days,current_overdue_days,inventoried_asset_count,restructured,bad_debt,similarity_flag,active_agreement_count,outstanding_principal
3275014403880001,C-1204,0,2022-08-31,24,4,0,0,false,blacklisted,false,0,0
";

    #[derive(Default)]
    pub(super) struct SeededHistory {
        records: HashMap<String, DupcheckRecord>,
    }

    impl SeededHistory {
        pub(super) fn from_csv(export: &str) -> Self {
            let records = parse_history(export.as_bytes())
                .expect("export parses")
                .into_iter()
                .filter_map(|seed| seed.record.map(|record| (seed.id_number, record)))
                .collect();
            Self { records }
        }
    }

    #[async_trait]
    impl HistoryProvider for SeededHistory {
        async fn lookup_customer(
            &self,
            subject: &LookupSubject<'_>,
        ) -> Result<Option<DupcheckRecord>, ProviderError> {
            Ok(self.records.get(subject.id_number).cloned())
        }
    }

    pub(super) struct NoInstallments;

    #[async_trait]
    impl InstallmentProvider for NoInstallments {
        async fn scan(
            &self,
            _line: ProductLine,
            _subject: &LookupSubject<'_>,
        ) -> Result<f64, ProviderError> {
            Ok(0.0)
        }

        async fn top_up_installment(
            &self,
            _subject: &LookupSubject<'_>,
        ) -> Result<Option<f64>, ProviderError> {
            Ok(None)
        }
    }

    pub(super) struct EmptyRegistry;

    #[async_trait]
    impl ChassisRegistry for EmptyRegistry {
        async fn lookup_agreement(
            &self,
            _chassis_number: &str,
        ) -> Result<Option<AgreementRecord>, ProviderError> {
            Ok(None)
        }
    }

    pub(super) struct MatchingVerifier;

    #[async_trait]
    impl IdentityVerifier for MatchingVerifier {
        fn name(&self) -> &str {
            "dukcapil"
        }

        async fn verify(
            &self,
            _applicant: &ApplicantRecord,
        ) -> Result<VerificationResult, ProviderError> {
            Ok(VerificationResult {
                matched: true,
                similarity: Some(0.99),
                detail: "record found".to_string(),
            })
        }
    }

    /// Clean bureau that counts how often it is consulted.
    #[derive(Default)]
    pub(super) struct CountingBureau {
        calls: AtomicUsize,
    }

    impl CountingBureau {
        pub(super) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CreditBureau for CountingBureau {
        async fn query(&self, _applicant: &ApplicantRecord) -> Result<BureauReport, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BureauReport {
                worst_collectability: 1,
                max_overdue_days: 0,
                total_outstanding: 0.0,
                active_facilities: 0,
            })
        }
    }

    pub(super) struct LowRiskScorer;

    #[async_trait]
    impl BehavioralScorer for LowRiskScorer {
        async fn score(
            &self,
            _applicant: &ApplicantRecord,
            _report: Option<&BureauReport>,
        ) -> Result<ScoreResult, ProviderError> {
            Ok(ScoreResult {
                score: 705.0,
                band: "LOW".to_string(),
            })
        }
    }

    #[derive(Default)]
    pub(super) struct MemoryLocks {
        bans: Mutex<Vec<BanRecord>>,
        events: Mutex<Vec<LockEvent>>,
    }

    impl MemoryLocks {
        pub(super) fn events(&self) -> Vec<LockEvent> {
            self.events.lock().expect("lock mutex poisoned").clone()
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
                .expect("lock mutex poisoned")
                .iter()
                .find(|ban| ban.scope == scope && ban.subject == subject && ban.is_active(today))
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
                .events()
                .into_iter()
                .filter(|event| {
                    event.scope == scope
                        && event.subject == subject
                        && event.kind == kind
                        && event.occurred_on >= since
                })
                .collect())
        }

        async fn save_ban(&self, ban: BanRecord) -> Result<(), RepositoryError> {
            self.bans.lock().expect("lock mutex poisoned").push(ban);
            Ok(())
        }

        async fn record_event(&self, event: LockEvent) -> Result<(), RepositoryError> {
            self.events.lock().expect("lock mutex poisoned").push(event);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(super) struct MemoryAudit {
        trails: Mutex<HashMap<ProspectId, Vec<AuditRecord>>>,
    }

    #[async_trait]
    impl AuditStore for MemoryAudit {
        async fn append(
            &self,
            prospect_id: &ProspectId,
            records: &[AuditRecord],
        ) -> Result<(), RepositoryError> {
            let mut guard = self.trails.lock().expect("audit mutex poisoned");
            let stored = guard.entry(prospect_id.clone()).or_default();
            for record in records {
                let key = record.idempotency_key();
                if !stored.iter().any(|existing| existing.idempotency_key() == key) {
                    stored.push(record.clone());
                }
            }
            Ok(())
        }

        async fn trail(
            &self,
            prospect_id: &ProspectId,
        ) -> Result<Vec<AuditRecord>, RepositoryError> {
            Ok(self
                .trails
                .lock()
                .expect("audit mutex poisoned")
                .get(prospect_id)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    pub(super) struct PublishedThresholds {
        bodies: HashMap<ThresholdFamily, StoredThresholds>,
    }

    impl PublishedThresholds {
        pub(super) fn with(mut self, family: ThresholdFamily, body: &str) -> Self {
            self.bodies.insert(
                family,
                StoredThresholds {
                    version: 1,
                    body: body.to_string(),
                },
            );
            self
        }
    }

    #[async_trait]
    impl ConfigStore for PublishedThresholds {
        async fn latest(
            &self,
            family: ThresholdFamily,
        ) -> Result<Option<StoredThresholds>, ConfigStoreError> {
            Ok(self.bodies.get(&family).cloned())
        }
    }

    pub(super) struct Harness {
        pub(super) service: Arc<UnderwritingService<MemoryAudit>>,
        pub(super) bureau: Arc<CountingBureau>,
        pub(super) locks: Arc<MemoryLocks>,
    }

    pub(super) fn harness(history: SeededHistory, thresholds: PublishedThresholds) -> Harness {
        let bureau = Arc::new(CountingBureau::default());
        let locks = Arc::new(MemoryLocks::default());
        let providers = ProviderSet {
            history: Arc::new(history),
            installments: Arc::new(NoInstallments),
            chassis: Arc::new(EmptyRegistry),
            identity: vec![Arc::new(MatchingVerifier)],
            bureau: bureau.clone(),
            scorer: Arc::new(LowRiskScorer),
            locks: locks.clone(),
        };
        let settings = PipelineSettings {
            provider_timeout: Duration::from_millis(500),
            ..PipelineSettings::default()
        };
        let pipeline =
            UnderwritingPipeline::standard(&providers, settings).expect("standard route");
        let service = UnderwritingService::new(
            pipeline,
            ThresholdResolver::new(Arc::new(thresholds)),
            Arc::new(MemoryAudit::default()),
            locks.clone(),
        );

        Harness {
            service: Arc::new(service),
            bureau,
            locks,
        }
    }
}

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use tower::ServiceExt;
use underwriting::workflows::underwriting::{
    underwriting_router, CancelSignal, CustomerStatus, Disposition, LockScope, ProspectId,
    StageId, ThresholdFamily,
};

#[tokio::test]
async fn new_customer_within_dsr_limit_goes_to_credit_process() {
    let harness = harness(SeededHistory::default(), PublishedThresholds::default());
    let application = application("P-INT-A");

    let outcome = harness
        .service
        .evaluate_on(&application, CancelSignal::new(), evaluation_date())
        .await
        .expect("run completes");

    assert_eq!(outcome.customer_status, CustomerStatus::New);
    assert_eq!(outcome.disposition, Disposition::CreditProcess);
    let dsr = outcome.dsr_percent.expect("dsr computed");
    assert!((dsr - 2.6).abs() < 1e-9);

    let dsr_record = outcome
        .trail
        .records()
        .iter()
        .find(|record| record.source_decision == StageId::Dsr.tag())
        .expect("dsr stage recorded");
    assert_eq!(dsr_record.rule_code, "DSR-00");
    assert_eq!(dsr_record.reason, "NEW - DSR <= 35");

    assert_eq!(outcome.trail.len(), StageId::ALL.len() + 1);
    outcome.trail.verify_links(true).expect("trail links are intact");
    assert!(harness.locks.events().is_empty());
}

#[tokio::test]
async fn blacklisted_applicant_is_rejected_before_external_checks() {
    let harness = harness(
        SeededHistory::from_csv(BLACKLIST_EXPORT),
        PublishedThresholds::default(),
    );
    let application = application("P-INT-B");

    let outcome = harness
        .service
        .evaluate_on(&application, CancelSignal::new(), evaluation_date())
        .await
        .expect("run completes");

    assert_eq!(outcome.disposition, Disposition::Reject);
    assert_eq!(outcome.trail.len(), 3);
    let last = outcome.trail.last().expect("reject record");
    assert_eq!(last.rule_code, "BLK-11");
    assert_eq!(last.source_decision, StageId::Blacklist.tag());
    assert_eq!(last.next_step, None);
    assert_eq!(harness.bureau.calls(), 0);

    let events = harness.locks.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().any(|event| event.scope == LockScope::Applicant
        && event.subject == ENCRYPTED_ID));
    assert!(events
        .iter()
        .any(|event| event.scope == LockScope::Chassis && event.subject == CHASSIS));

    let stored = harness
        .service
        .trail(&ProspectId("P-INT-B".to_string()))
        .await
        .expect("trail persisted");
    assert_eq!(stored, outcome.trail);
}

#[tokio::test]
async fn vehicle_older_than_published_maximum_is_rejected() {
    let harness = harness(
        SeededHistory::default(),
        PublishedThresholds::default()
            .with(ThresholdFamily::VehicleAge, r#"{"vehicle_age_max": 17}"#),
    );
    let mut application = application("P-INT-C");
    application.vehicle.manufacture_year = 2007;

    let outcome = harness
        .service
        .evaluate_on(&application, CancelSignal::new(), evaluation_date())
        .await
        .expect("run completes");

    assert_eq!(outcome.disposition, Disposition::Reject);
    assert_eq!(outcome.trail.len(), 4);
    let last = outcome.trail.last().expect("reject record");
    assert_eq!(last.rule_code, "VHC-01");
    assert_eq!(last.reason, "NEW - vehicle age 18 > 17");
    assert_eq!(harness.bureau.calls(), 0);
}

#[tokio::test]
async fn http_submission_returns_the_persisted_trail() {
    let harness = harness(SeededHistory::default(), PublishedThresholds::default());
    let router = underwriting_router(harness.service.clone());
    let payload =
        serde_json::to_string(&application("P-INT-HTTP")).expect("application serializes");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/underwriting/applications")
                .header("content-type", "application/json")
                .body(Body::from(payload))
                .expect("request builds"),
        )
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/v1/underwriting/applications/P-INT-HTTP/trail")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json payload");
    let trail = json["trail"].as_array().expect("trail array");
    assert_eq!(trail.len(), 12);
    assert_eq!(trail[11]["source_decision"], "DISPOSITION");
}
