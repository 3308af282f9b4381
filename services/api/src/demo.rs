use crate::infra::{load_seeds, InMemoryBackend};
use chrono::{Datelike, NaiveDate};
use clap::Args;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use underwriting::config::PipelineSettings;
use underwriting::error::AppError;
use underwriting::workflows::underwriting::{
    AgreementRecord, AgreementStatus, ApplicantRecord, BadDebtClass, CancelSignal,
    CancellationRequest, DecisionTrail, DupcheckRecord, HomeStatus, LoanApplication, LoanTerms,
    MaritalStatus, PipelineOutcome, ProductLine, ProspectId, ThresholdFamily,
    UnderwritingServiceError, VehicleRecord,
};

#[derive(Args, Debug)]
pub(crate) struct EvaluateArgs {
    /// Loan application as JSON
    #[arg(long)]
    pub(crate) input: PathBuf,
    /// Optional customer-history CSV export used as the history provider
    #[arg(long)]
    pub(crate) history_csv: Option<PathBuf>,
    /// Evaluation date (YYYY-MM-DD). Defaults to today in the configured zone.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
}

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Evaluation date (YYYY-MM-DD). Defaults to today in the configured zone.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
    /// Optional customer-history CSV export merged into the demo history
    #[arg(long)]
    pub(crate) history_csv: Option<PathBuf>,
}

/// Evaluate one application file and print the outcome as JSON.
pub(crate) async fn run_evaluate(args: EvaluateArgs) -> Result<(), AppError> {
    let EvaluateArgs {
        input,
        history_csv,
        today,
    } = args;

    let settings = PipelineSettings::from_env()?;
    let today = today.unwrap_or_else(|| settings.today());
    let application: LoanApplication =
        serde_json::from_reader(BufReader::new(File::open(&input)?))?;
    let seeds = load_seeds(history_csv.as_deref())?;
    let backend = InMemoryBackend::build(settings, seeds)?;

    match backend
        .service
        .evaluate_on(&application, CancelSignal::new(), today)
        .await
    {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(UnderwritingServiceError::Pipeline(abort)) => {
            eprintln!(
                "evaluation aborted at {} ({})",
                abort.error.stage(),
                abort.error.kind()
            );
            println!("{}", serde_json::to_string_pretty(&abort.trail)?);
            Err(UnderwritingServiceError::Pipeline(abort).into())
        }
        Err(err) => Err(err.into()),
    }
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs { today, history_csv } = args;

    let settings = PipelineSettings::default();
    let today = today.unwrap_or_else(|| settings.today());
    let seeds = load_seeds(history_csv.as_deref())?;
    let backend = InMemoryBackend::build(settings, seeds)?;

    println!("Vehicle-loan underwriting demo (evaluation date {today})");

    println!("\n1. New customer, no other installments");
    let clean = demo_application("P-DEMO-001", "3201011204900001", 2022);
    evaluate_and_render(&backend, &clean, today).await?;

    println!("\n2. Open-agreement customer with an online installment");
    let repeat = demo_application("P-DEMO-002", "3201011204900002", 2021);
    backend.history.insert(
        &repeat.applicant.id_number,
        DupcheckRecord {
            customer_id: Some("CUST-2002".to_string()),
            total_installment: Some(1_150_000.0),
            paid_installment_count: Some(14),
            current_overdue_days: Some(0),
            max_overdue_days: Some(6),
            active_agreement_count: Some(1),
            outstanding_principal: Some(7_500_000.0),
            ..DupcheckRecord::default()
        },
    );
    backend.installments.set(
        &repeat.applicant.id_number,
        ProductLine::Online,
        1_150_000.0,
    );
    evaluate_and_render(&backend, &repeat, today).await?;

    println!("\n3. Blacklisted customer");
    let blacklisted = demo_application("P-DEMO-003", "3201011204900003", 2022);
    backend.history.insert(
        &blacklisted.applicant.id_number,
        DupcheckRecord {
            customer_id: Some("CUST-2003".to_string()),
            total_installment: Some(0.0),
            settlement_date: NaiveDate::from_ymd_opt(2022, 3, 31),
            paid_installment_count: Some(24),
            max_overdue_days: Some(12),
            bad_debt: Some(BadDebtClass::Blacklisted),
            ..DupcheckRecord::default()
        },
    );
    evaluate_and_render(&backend, &blacklisted, today).await?;

    println!("\n4. Vehicle older than the published maximum age");
    let version = backend
        .thresholds
        .publish(ThresholdFamily::VehicleAge, r#"{"vehicle_age_max": 17}"#);
    println!("  Published vehicle_age thresholds v{version}: max 17 years");
    let old_vehicle = demo_application("P-DEMO-004", "3201011204900004", today.year() - 18);
    evaluate_and_render(&backend, &old_vehicle, today).await?;

    println!("\n5. Chassis financed under another customer's agreement");
    let mut pledged = demo_application("P-DEMO-005", "3201011204900005", 2023);
    pledged.vehicle.chassis_number = "MH1JM8116PK200045".to_string();
    backend.registry.insert(
        &pledged.vehicle.chassis_number,
        AgreementRecord {
            agreement_number: "AGR-2024-1187".to_string(),
            owner_id_number: "3174000000000009".to_string(),
            engine_number: pledged.vehicle.engine_number.clone(),
            status: AgreementStatus::Active,
        },
    );
    evaluate_and_render(&backend, &pledged, today).await?;

    println!("\n6. Repeated cancellations lock the applicant");
    let request = CancellationRequest::from_application(&clean);
    for attempt in 1..=3 {
        let receipt = backend
            .service
            .record_cancellation(&ProspectId(format!("P-DEMO-CXL-{attempt}")), &request)
            .await?;
        println!(
            "  Cancellation {} recorded ({} events)",
            receipt.prospect_id, receipt.events_recorded
        );
    }
    let resubmitted = LoanApplication {
        prospect_id: ProspectId("P-DEMO-006".to_string()),
        ..clean
    };
    evaluate_and_render(&backend, &resubmitted, today).await?;

    let events = backend.locks.events();
    let bans = backend.locks.bans();
    println!(
        "\nLock store: {} attempt events, {} active bans",
        events.len(),
        bans.iter().filter(|ban| ban.is_active(today)).count()
    );
    for ban in bans {
        println!(
            "  - {:?} {} banned until {} ({})",
            ban.scope, ban.subject, ban.unban_date, ban.reason
        );
    }

    Ok(())
}

async fn evaluate_and_render(
    backend: &InMemoryBackend,
    application: &LoanApplication,
    today: NaiveDate,
) -> Result<(), AppError> {
    match backend
        .service
        .evaluate_on(application, CancelSignal::new(), today)
        .await
    {
        Ok(outcome) => {
            render_outcome(&outcome);
            Ok(())
        }
        Err(UnderwritingServiceError::Pipeline(abort)) => {
            println!("  Evaluation aborted: {}", abort.error);
            render_trail(&abort.trail);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn render_outcome(outcome: &PipelineOutcome) {
    let dsr = outcome
        .dsr_percent
        .map(|value| format!("{value:.2}%"))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        "- {} -> {} | customer {} | DSR {}",
        outcome.prospect_id, outcome.disposition, outcome.customer_status, dsr
    );
    render_trail(&outcome.trail);
}

fn render_trail(trail: &DecisionTrail) {
    for record in trail.records() {
        println!(
            "    {:<13} {:<7} {:<13} {}",
            record.source_decision,
            record.rule_code,
            format!("{:?}", record.decision),
            record.reason
        );
    }
}

fn demo_application(prospect: &str, id_number: &str, manufacture_year: i32) -> LoanApplication {
    LoanApplication {
        prospect_id: ProspectId(prospect.to_string()),
        applicant: ApplicantRecord {
            id_number: id_number.to_string(),
            encrypted_id_number: format!("enc-{id_number}"),
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
        },
        vehicle: VehicleRecord {
            chassis_number: format!("MH1JM81{}", id_number.get(10..).unwrap_or(id_number)),
            engine_number: "JM81E1100001".to_string(),
            manufacture_year,
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
