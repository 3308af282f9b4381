//! Policy eligibility (PMK): income, work tenure, residence tenure, minimum age and
//! maximum age at maturity. Checks run in that order and the first failure wins.
//!
//! Dates are evaluated on the run's local evaluation date. Blank or unparseable date
//! fields make the affected check not applicable; they never pass or fail it.

use async_trait::async_trait;
use chrono::{Datelike, Months, NaiveDate};
use serde_json::json;

use super::{limit, DecisionContext, Stage, StageError, StageInput, StageOutcome};
use crate::workflows::underwriting::domain::{
    CustomerStatus, HomeStatus, LoanApplication, MaritalStatus, RuleCode, StageResult,
};
use crate::workflows::underwriting::thresholds::{PmkThresholds, DEFAULT_HOME_SINCE_YEARS};
use crate::workflows::underwriting::trail::StageId;

const ELIGIBLE: RuleCode = RuleCode::pass("PMK-00", "policy eligibility met");
const INCOME: RuleCode = RuleCode::reject("PMK-01", "income below minimum");
const WORK_EXPERIENCE: RuleCode = RuleCode::reject("PMK-02", "work experience below minimum");
const HOME_SINCE: RuleCode = RuleCode::reject("PMK-03", "residence tenure below minimum");
const MIN_AGE: RuleCode = RuleCode::reject("PMK-04", "applicant below minimum age");
const MAX_AGE: RuleCode = RuleCode::reject("PMK-05", "loan matures after maximum age");

pub const CODES: &[RuleCode] = &[ELIGIBLE, INCOME, WORK_EXPERIENCE, HOME_SINCE, MIN_AGE, MAX_AGE];

/// Inputs of the policy evaluator, borrowed from the application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyFacts<'a> {
    /// Household monthly income.
    pub income: f64,
    pub home_status: HomeStatus,
    pub employment_since_year: &'a str,
    pub employment_since_month: &'a str,
    pub residence_since_year: &'a str,
    pub residence_since_month: &'a str,
    pub birth_date: &'a str,
    pub tenor_months: u32,
    pub marital_status: MaritalStatus,
}

impl<'a> PolicyFacts<'a> {
    pub fn from_application(application: &'a LoanApplication) -> Self {
        let applicant = &application.applicant;
        Self {
            income: applicant.household_income(),
            home_status: applicant.home_status,
            employment_since_year: &applicant.employment_since_year,
            employment_since_month: &applicant.employment_since_month,
            residence_since_year: &applicant.residence_since_year,
            residence_since_month: &applicant.residence_since_month,
            birth_date: &applicant.birth_date,
            tenor_months: application.terms.tenor_months,
            marital_status: applicant.marital_status,
        }
    }
}

/// Age in completed years on `on`. A birthday later in the year has not counted yet.
pub fn human_age(birth_date: NaiveDate, on: NaiveDate) -> i32 {
    let mut age = on.year() - birth_date.year();
    if (on.month(), on.day()) < (birth_date.month(), birth_date.day()) {
        age -= 1;
    }
    age
}

pub fn evaluate_policy(
    facts: &PolicyFacts<'_>,
    thresholds: &PmkThresholds,
    status: CustomerStatus,
    today: NaiveDate,
) -> StageResult {
    let reject = |rule: RuleCode, detail: String| {
        StageResult::with_status(StageId::Pmk, rule, status, detail)
    };

    if facts.income < thresholds.min_income {
        return reject(
            INCOME,
            format!(
                "income {} < {}",
                limit(facts.income),
                limit(thresholds.min_income)
            ),
        );
    }

    if let Some(months) = months_since(
        facts.employment_since_year,
        facts.employment_since_month,
        today,
    ) {
        if months < i64::from(thresholds.min_work_years) * 12 {
            return reject(
                WORK_EXPERIENCE,
                format!(
                    "work experience {} < {} years",
                    describe_months(months),
                    thresholds.min_work_years
                ),
            );
        }
    }

    if let Some(months) = months_since(
        facts.residence_since_year,
        facts.residence_since_month,
        today,
    ) {
        let required_years = required_home_years(facts.home_status, thresholds);
        if months < i64::from(required_years) * 12 {
            return reject(
                HOME_SINCE,
                format!(
                    "home since {} < {required_years} years",
                    describe_months(months)
                ),
            );
        }
    }

    if let Some(birth_date) = parse_date(facts.birth_date) {
        let min_age = if facts.marital_status.is_married() {
            thresholds.min_age_married
        } else {
            thresholds.min_age_single
        };
        let age = human_age(birth_date, today);
        if i64::from(age) < i64::from(min_age) {
            return reject(MIN_AGE, format!("age {age} < {min_age}"));
        }

        let age_limit_date = birth_date
            .checked_add_months(Months::new(thresholds.max_age_limit.saturating_mul(12)));
        let maturity_date = today.checked_add_months(Months::new(facts.tenor_months));
        if let (Some(age_limit_date), Some(maturity_date)) = (age_limit_date, maturity_date) {
            if maturity_date > age_limit_date {
                return reject(
                    MAX_AGE,
                    format!(
                        "maturity {maturity_date} after reaching {} on {age_limit_date}",
                        thresholds.max_age_limit
                    ),
                );
            }
        }
    }

    StageResult::with_status(StageId::Pmk, ELIGIBLE, status, ELIGIBLE.description)
}

fn required_home_years(home_status: HomeStatus, thresholds: &PmkThresholds) -> u32 {
    match home_status {
        HomeStatus::Owned => thresholds.min_home_years_owned,
        HomeStatus::EmployerProvided => thresholds.min_home_years_employer,
        HomeStatus::Rented => thresholds.min_home_years_rented,
        HomeStatus::Family | HomeStatus::Other => DEFAULT_HOME_SINCE_YEARS,
    }
}

/// Whole months between a `(year, month)` pair and `today`; `None` when either field is
/// blank or unparseable.
fn months_since(year: &str, month: &str, today: NaiveDate) -> Option<i64> {
    let year = year.trim().parse::<i32>().ok().filter(|year| *year > 0)?;
    let month = month
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|month| (1..=12).contains(month))?;

    let elapsed = (i64::from(today.year()) - i64::from(year)) * 12
        + (i64::from(today.month()) - i64::from(month));
    Some(elapsed)
}

fn describe_months(months: i64) -> String {
    format!("{} years {} months", months.div_euclid(12), months.rem_euclid(12))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok()
}

pub struct PmkStage;

#[async_trait]
impl Stage for PmkStage {
    fn id(&self) -> StageId {
        StageId::Pmk
    }

    async fn evaluate(
        &self,
        input: &StageInput<'_>,
        context: &mut DecisionContext,
    ) -> Result<StageOutcome, StageError> {
        let facts = PolicyFacts::from_application(input.application);
        let result = evaluate_policy(
            &facts,
            &input.thresholds.pmk,
            context.customer_status,
            context.evaluated_on,
        );
        let info = json!({
            "income": facts.income,
            "home_status": facts.home_status,
            "marital_status": facts.marital_status,
            "tenor_months": facts.tenor_months,
            "evaluated_on": context.evaluated_on,
        });
        Ok(StageOutcome::new(result, info))
    }
}
