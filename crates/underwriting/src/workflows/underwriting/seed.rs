//! Customer-history seed import.
//!
//! Reads a CSV export of customer history, one row per ID number, into
//! [`DupcheckRecord`]s. Identifiers and amounts are normalised here, at the ingestion
//! boundary; a row whose history columns are all blank means "no history".

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};

use super::domain::{parse_amount, BadDebtClass, DupcheckRecord};

/// History of one ID number. `record` is `None` when the export carries no history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySeed {
    pub id_number: String,
    pub record: Option<DupcheckRecord>,
}

#[derive(Debug)]
pub enum SeedError {
    Io(std::io::Error),
    Csv(csv::Error),
    InvalidField {
        line: u64,
        field: &'static str,
        message: String,
    },
}

impl std::fmt::Display for SeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeedError::Io(err) => write!(f, "failed to read history export: {}", err),
            SeedError::Csv(err) => write!(f, "invalid history CSV data: {}", err),
            SeedError::InvalidField {
                line,
                field,
                message,
            } => write!(f, "line {}: invalid {}: {}", line, field, message),
        }
    }
}

impl std::error::Error for SeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SeedError::Io(err) => Some(err),
            SeedError::Csv(err) => Some(err),
            SeedError::InvalidField { .. } => None,
        }
    }
}

impl From<std::io::Error> for SeedError {
    fn from(err: std::io::Error) -> Self {
        SeedError::Io(err)
    }
}

impl From<csv::Error> for SeedError {
    fn from(err: csv::Error) -> Self {
        SeedError::Csv(err)
    }
}

pub fn load_history_file(path: impl AsRef<Path>) -> Result<Vec<HistorySeed>, SeedError> {
    let file = File::open(path)?;
    parse_history(file)
}

pub fn parse_history<R: Read>(reader: R) -> Result<Vec<HistorySeed>, SeedError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut seeds = Vec::new();

    for (index, record) in csv_reader.deserialize::<HistoryRow>().enumerate() {
        let row = record?;
        // Header is line 1.
        let line = index as u64 + 2;
        let Some(id_number) = row.id_number.clone() else {
            return Err(SeedError::InvalidField {
                line,
                field: "id_number",
                message: "missing".to_string(),
            });
        };
        let record = row.into_record(line)?.into_history();
        seeds.push(HistorySeed { id_number, record });
    }

    Ok(seeds)
}

#[derive(Debug, Deserialize)]
struct HistoryRow {
    #[serde(default, deserialize_with = "empty_string_as_none")]
    id_number: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    customer_id: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    total_installment: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    settlement_date: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    paid_installment_count: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    max_overdue_days: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    current_overdue_days: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    inventoried_asset_count: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    restructured: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    bad_debt: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    similarity_flag: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    active_agreement_count: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    outstanding_principal: Option<String>,
}

impl HistoryRow {
    fn into_record(self, line: u64) -> Result<DupcheckRecord, SeedError> {
        let invalid = |field: &'static str, message: String| SeedError::InvalidField {
            line,
            field,
            message,
        };

        let amount = |field: &'static str, raw: &Option<String>| match raw {
            Some(raw) => parse_amount(raw).map_err(|message| invalid(field, message)),
            None => Ok(None),
        };
        let count = |field: &'static str, raw: &Option<String>| -> Result<Option<u32>, SeedError> {
            match amount(field, raw)? {
                Some(value) if value >= 0.0 && value.fract() == 0.0 && value <= f64::from(u32::MAX) => {
                    Ok(Some(value as u32))
                }
                Some(value) => Err(invalid(field, format!("{value} is not a count"))),
                None => Ok(None),
            }
        };
        let flag = |field: &'static str, raw: &Option<String>| -> Result<Option<bool>, SeedError> {
            match raw.as_deref().map(|raw| raw.to_ascii_lowercase()) {
                None => Ok(None),
                Some(raw) => match raw.as_str() {
                    "1" | "true" | "yes" | "y" => Ok(Some(true)),
                    "0" | "false" | "no" | "n" => Ok(Some(false)),
                    _ => Err(invalid(field, format!("'{raw}' is not a boolean"))),
                },
            }
        };

        let settlement_date = match self.settlement_date.as_deref() {
            Some(raw) => Some(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|err| invalid("settlement_date", err.to_string()))?,
            ),
            None => None,
        };
        let bad_debt = match self.bad_debt.as_deref().map(|raw| raw.to_ascii_uppercase()) {
            None => None,
            Some(raw) => match raw.as_str() {
                "BLACKLISTED" | "BLACKLIST" => Some(BadDebtClass::Blacklisted),
                "WARNING" => Some(BadDebtClass::Warning),
                _ => return Err(invalid("bad_debt", format!("unknown class '{raw}'"))),
            },
        };

        Ok(DupcheckRecord {
            customer_id: self.customer_id.as_deref().map(normalize_identifier),
            total_installment: amount("total_installment", &self.total_installment)?,
            settlement_date,
            paid_installment_count: count("paid_installment_count", &self.paid_installment_count)?,
            max_overdue_days: count("max_overdue_days", &self.max_overdue_days)?,
            current_overdue_days: count("current_overdue_days", &self.current_overdue_days)?,
            inventoried_asset_count: count(
                "inventoried_asset_count",
                &self.inventoried_asset_count,
            )?,
            restructured: flag("restructured", &self.restructured)?,
            bad_debt,
            similarity_flag: flag("similarity_flag", &self.similarity_flag)?,
            active_agreement_count: count("active_agreement_count", &self.active_agreement_count)?,
            outstanding_principal: amount("outstanding_principal", &self.outstanding_principal)?,
        })
    }
}

/// Spreadsheet exports turn numeric IDs into `12345.0` or `1.2345E4`; keep them as the
/// plain digit string.
fn normalize_identifier(raw: &str) -> String {
    let looks_numeric = raw.contains(|c: char| matches!(c, '.' | 'e' | 'E'));
    match raw.parse::<f64>() {
        Ok(value) if looks_numeric && value.fract() == 0.0 && value.abs() < 1e15 => {
            format!("{}", value as i64)
        }
        _ => raw.to_string(),
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty()))
}
