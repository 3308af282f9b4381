use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use super::trail::StageId;

/// Identifier wrapper for a submitted loan application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProspectId(pub String);

impl fmt::Display for ProspectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaritalStatus {
    Single,
    Married,
    Divorced,
    Widowed,
}

impl MaritalStatus {
    pub fn is_married(self) -> bool {
        matches!(self, MaritalStatus::Married)
    }
}

/// Residence ownership category used by the home-since tenure rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HomeStatus {
    Owned,
    EmployerProvided,
    Rented,
    Family,
    Other,
}

/// Applicant data captured at intake. Immutable for the lifetime of a pipeline run.
///
/// Date fields stay in their raw submitted form: the policy evaluator treats an
/// unparseable or blank value as "check not applicable" rather than failing intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantRecord {
    pub id_number: String,
    /// Encrypted ID number used as the applicant-level ban key.
    pub encrypted_id_number: String,
    pub legal_name: String,
    /// `YYYY-MM-DD`.
    pub birth_date: String,
    pub mother_name: String,
    pub marital_status: MaritalStatus,
    #[serde(default, deserialize_with = "amount")]
    pub monthly_income: f64,
    pub home_status: HomeStatus,
    #[serde(default)]
    pub employment_since_year: String,
    #[serde(default)]
    pub employment_since_month: String,
    #[serde(default)]
    pub residence_since_year: String,
    #[serde(default)]
    pub residence_since_month: String,
    #[serde(default)]
    pub spouse: Option<Box<ApplicantRecord>>,
}

impl ApplicantRecord {
    /// Applicant first, spouse second when present.
    pub fn household(&self) -> Vec<&ApplicantRecord> {
        let mut members = vec![self];
        if let Some(spouse) = self.spouse.as_deref() {
            members.push(spouse);
        }
        members
    }

    pub fn household_income(&self) -> f64 {
        self.household()
            .iter()
            .map(|member| member.monthly_income.max(0.0))
            .sum()
    }

    pub fn lookup_subject(&self) -> LookupSubject<'_> {
        LookupSubject {
            id_number: &self.id_number,
            legal_name: &self.legal_name,
            birth_date: &self.birth_date,
            mother_name: &self.mother_name,
        }
    }
}

/// Identity tuple the history and installment providers are queried with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupSubject<'a> {
    pub id_number: &'a str,
    pub legal_name: &'a str,
    pub birth_date: &'a str,
    pub mother_name: &'a str,
}

/// Collateral description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub chassis_number: String,
    pub engine_number: String,
    pub manufacture_year: i32,
    pub title_holder_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    pub tenor_months: u32,
    /// Monthly installment of the requested loan.
    #[serde(deserialize_with = "amount")]
    pub installment_amount: f64,
    /// On-the-road price of the vehicle.
    #[serde(deserialize_with = "amount")]
    pub otr_price: f64,
    /// Net amount financed (NTF).
    #[serde(deserialize_with = "amount")]
    pub financed_amount: f64,
    #[serde(default)]
    pub customer_segment: Option<String>,
}

/// Full application handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanApplication {
    pub prospect_id: ProspectId,
    pub applicant: ApplicantRecord,
    pub vehicle: VehicleRecord,
    pub terms: LoanTerms,
}

impl LoanApplication {
    pub fn snapshot(&self) -> ApplicationSnapshot {
        let applicant = &self.applicant;
        let spouse = applicant.spouse.as_deref();
        ApplicationSnapshot {
            id_number: applicant.id_number.clone(),
            legal_name: applicant.legal_name.clone(),
            birth_date: applicant.birth_date.clone(),
            mother_name: applicant.mother_name.clone(),
            marital_status: applicant.marital_status,
            monthly_income: applicant.monthly_income,
            home_status: applicant.home_status,
            employment_since: format!(
                "{}-{}",
                applicant.employment_since_year, applicant.employment_since_month
            ),
            residence_since: format!(
                "{}-{}",
                applicant.residence_since_year, applicant.residence_since_month
            ),
            spouse_id_number: spouse.map(|member| member.id_number.clone()),
            spouse_legal_name: spouse.map(|member| member.legal_name.clone()),
            spouse_monthly_income: spouse.map(|member| member.monthly_income),
            chassis_number: self.vehicle.chassis_number.clone(),
            engine_number: self.vehicle.engine_number.clone(),
            manufacture_year: self.vehicle.manufacture_year,
            title_holder_name: self.vehicle.title_holder_name.clone(),
            tenor_months: self.terms.tenor_months,
            installment_amount: self.terms.installment_amount,
            otr_price: self.terms.otr_price,
            financed_amount: self.terms.financed_amount,
            customer_segment: self.terms.customer_segment.clone(),
        }
    }
}

/// Field-by-field image of an application kept with each rejected chassis attempt.
/// Two attempts are identical only when every field matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSnapshot {
    pub id_number: String,
    pub legal_name: String,
    pub birth_date: String,
    pub mother_name: String,
    pub marital_status: MaritalStatus,
    pub monthly_income: f64,
    pub home_status: HomeStatus,
    pub employment_since: String,
    pub residence_since: String,
    pub spouse_id_number: Option<String>,
    pub spouse_legal_name: Option<String>,
    pub spouse_monthly_income: Option<f64>,
    pub chassis_number: String,
    pub engine_number: String,
    pub manufacture_year: i32,
    pub title_holder_name: String,
    pub tenor_months: u32,
    pub installment_amount: f64,
    pub otr_price: f64,
    pub financed_amount: f64,
    pub customer_segment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BadDebtClass {
    Blacklisted,
    Warning,
}

/// Customer history returned by the history provider for one person.
///
/// Every field is optional: a record with all fields absent carries no history and
/// is normalized to `None` by [`DupcheckRecord::into_history`] at the provider boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DupcheckRecord {
    #[serde(default, deserialize_with = "optional_identifier")]
    pub customer_id: Option<String>,
    #[serde(default, deserialize_with = "optional_amount")]
    pub total_installment: Option<f64>,
    #[serde(default)]
    pub settlement_date: Option<NaiveDate>,
    #[serde(default)]
    pub paid_installment_count: Option<u32>,
    #[serde(default)]
    pub max_overdue_days: Option<u32>,
    #[serde(default)]
    pub current_overdue_days: Option<u32>,
    #[serde(default)]
    pub inventoried_asset_count: Option<u32>,
    #[serde(default)]
    pub restructured: Option<bool>,
    #[serde(default)]
    pub bad_debt: Option<BadDebtClass>,
    #[serde(default)]
    pub similarity_flag: Option<bool>,
    #[serde(default)]
    pub active_agreement_count: Option<u32>,
    #[serde(default, deserialize_with = "optional_amount")]
    pub outstanding_principal: Option<f64>,
}

impl DupcheckRecord {
    pub fn is_empty(&self) -> bool {
        self == &DupcheckRecord::default()
    }

    pub fn into_history(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerStatus {
    #[serde(rename = "NEW")]
    New,
    /// Repeat customer with an open agreement.
    #[serde(rename = "AO")]
    Ao,
    /// Repeat customer whose agreements are settled.
    #[serde(rename = "RO")]
    Ro,
}

impl CustomerStatus {
    pub const fn label(self) -> &'static str {
        match self {
            CustomerStatus::New => "NEW",
            CustomerStatus::Ao => "AO",
            CustomerStatus::Ro => "RO",
        }
    }

    pub fn is_repeat(self) -> bool {
        !matches!(self, CustomerStatus::New)
    }
}

impl fmt::Display for CustomerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustomerType {
    Clean,
    Warning,
}

/// Which household member a screening result refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyIndex {
    Applicant,
    Spouse,
}

impl PartyIndex {
    pub const fn index(self) -> usize {
        match self {
            PartyIndex::Applicant => 0,
            PartyIndex::Spouse => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Reject,
    Contingency,
}

/// Entry of a stage's static reason-code table. The verdict of a [`StageResult`]
/// always comes from its rule code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleCode {
    pub code: &'static str,
    pub verdict: Verdict,
    pub description: &'static str,
}

impl RuleCode {
    pub const fn pass(code: &'static str, description: &'static str) -> Self {
        Self {
            code,
            verdict: Verdict::Pass,
            description,
        }
    }

    pub const fn reject(code: &'static str, description: &'static str) -> Self {
        Self {
            code,
            verdict: Verdict::Reject,
            description,
        }
    }

    pub const fn contingency(code: &'static str, description: &'static str) -> Self {
        Self {
            code,
            verdict: Verdict::Contingency,
            description,
        }
    }
}

/// Typed outcome of one rule evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub code: String,
    pub result: Verdict,
    pub reason: String,
    pub status_konsumen: CustomerStatus,
    pub source_decision: StageId,
}

impl StageResult {
    pub fn new(
        source: StageId,
        rule: RuleCode,
        status: CustomerStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            code: rule.code.to_string(),
            result: rule.verdict,
            reason: reason.into(),
            status_konsumen: status,
            source_decision: source,
        }
    }

    /// Reason text prefixed with the customer status, e.g. `NEW - DSR <= 35`.
    pub fn with_status(
        source: StageId,
        rule: RuleCode,
        status: CustomerStatus,
        detail: impl fmt::Display,
    ) -> Self {
        Self::new(source, rule, status, format!("{} - {}", status.label(), detail))
    }

    pub fn is_reject(&self) -> bool {
        self.result == Verdict::Reject
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Integer(i64),
    Float(f64),
    Text(String),
}

fn number_to_text(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Identifiers arrive as either JSON strings or numbers; normalize once at ingestion.
pub(crate) fn optional_identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<StringOrNumber>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match value {
        StringOrNumber::Integer(number) => Some(number.to_string()),
        StringOrNumber::Float(number) => Some(number_to_text(number)),
        StringOrNumber::Text(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
    }))
}

pub(crate) fn parse_amount(raw: &str) -> Result<Option<f64>, String> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return Ok(None);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(Some)
        .ok_or_else(|| format!("'{raw}' is not a numeric amount"))
}

pub(crate) fn optional_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => Ok(None),
        Some(StringOrNumber::Integer(number)) => Ok(Some(number as f64)),
        Some(StringOrNumber::Float(number)) => Ok(Some(number)),
        Some(StringOrNumber::Text(text)) => parse_amount(&text).map_err(serde::de::Error::custom),
    }
}

pub(crate) fn amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(optional_amount(deserializer)?.unwrap_or(0.0))
}
