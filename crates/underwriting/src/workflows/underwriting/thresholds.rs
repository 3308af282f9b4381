//! Versioned per-family rule thresholds.
//!
//! Each rule family is stored as a JSON blob. The resolver loads every family at the
//! start of a run and freezes them into a [`ThresholdSnapshot`]; nothing re-reads the
//! store mid-run. Unreachable stores, malformed JSON and wrong-typed fields all fall
//! back to the documented per-field defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::fanout::fetch_all;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdFamily {
    Dupcheck,
    Blacklist,
    VehicleAge,
    Pmk,
    Dsr,
    Lock,
    Bureau,
    Scoring,
    Elaborate,
}

impl ThresholdFamily {
    pub const ALL: [ThresholdFamily; 9] = [
        ThresholdFamily::Dupcheck,
        ThresholdFamily::Blacklist,
        ThresholdFamily::VehicleAge,
        ThresholdFamily::Pmk,
        ThresholdFamily::Dsr,
        ThresholdFamily::Lock,
        ThresholdFamily::Bureau,
        ThresholdFamily::Scoring,
        ThresholdFamily::Elaborate,
    ];

    pub const fn key(self) -> &'static str {
        match self {
            ThresholdFamily::Dupcheck => "dupcheck",
            ThresholdFamily::Blacklist => "blacklist",
            ThresholdFamily::VehicleAge => "vehicle_age",
            ThresholdFamily::Pmk => "pmk",
            ThresholdFamily::Dsr => "dsr",
            ThresholdFamily::Lock => "lock",
            ThresholdFamily::Bureau => "bureau",
            ThresholdFamily::Scoring => "scoring",
            ThresholdFamily::Elaborate => "elaborate",
        }
    }
}

impl fmt::Display for ThresholdFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Latest stored configuration blob for a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredThresholds {
    pub version: u32,
    pub body: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("config store unavailable: {0}")]
    Unavailable(String),
}

/// Port to the versioned threshold store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Latest blob for `family`, or `None` when nothing has been published.
    async fn latest(
        &self,
        family: ThresholdFamily,
    ) -> Result<Option<StoredThresholds>, ConfigStoreError>;
}

/// Parsed JSON object with typed, defaulting accessors.
#[derive(Debug, Clone, Default)]
struct RawThresholds {
    fields: Map<String, Value>,
}

impl RawThresholds {
    fn parse(family: ThresholdFamily, body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(fields)) => Self { fields },
            Ok(_) | Err(_) => {
                warn!(%family, "threshold config is not a JSON object; using defaults");
                Self::default()
            }
        }
    }

    fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.fields
            .get(key)
            .and_then(|value| match value {
                Value::Number(number) => number.as_f64(),
                Value::String(text) => text.trim().parse::<f64>().ok(),
                _ => None,
            })
            .filter(|value| value.is_finite() && *value >= 0.0)
            .unwrap_or(default)
    }

    fn u32_or(&self, key: &str, default: u32) -> u32 {
        self.fields
            .get(key)
            .and_then(|value| match value {
                Value::Number(number) => number.as_u64(),
                Value::String(text) => text.trim().parse::<u64>().ok(),
                _ => None,
            })
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(default)
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.fields.get(key) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => default,
            },
            _ => default,
        }
    }

    fn strings_or(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.fields.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str())
                .map(|item| item.trim().to_ascii_uppercase())
                .filter(|item| !item.is_empty())
                .collect(),
            _ => default.iter().map(|item| item.to_string()).collect(),
        }
    }
}

/// Repeat-customer rules applied by the dupcheck stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DupcheckThresholds {
    /// Overdue days at or under which a repeat customer is considered clean. Default: 0.
    pub min_ovd_days: u32,
    /// Overdue days above which a repeat customer is rejected. Default: 30.
    pub max_ovd_days: u32,
    /// Installments an AO customer must have paid on the running agreement. Default: 6.
    pub angsuran_berjalan_months: u32,
    /// Open agreements an AO customer may hold. Default: 2.
    pub max_active_agreements: u32,
}

impl Default for DupcheckThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl DupcheckThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            min_ovd_days: raw.u32_or("min_ovd_days", 0),
            max_ovd_days: raw.u32_or("max_ovd_days", 30),
            angsuran_berjalan_months: raw.u32_or("angsuran_berjalan_months", 6),
            max_active_agreements: raw.u32_or("max_active_agreements", 2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistThresholds {
    /// Historic overdue days above which a person is rejected. Default: 90.
    pub max_ovd_days: u32,
}

impl Default for BlacklistThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl BlacklistThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            max_ovd_days: raw.u32_or("max_ovd_days", 90),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleAgeThresholds {
    /// Default: 12 years.
    pub vehicle_age_max: u32,
}

impl Default for VehicleAgeThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl VehicleAgeThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            vehicle_age_max: raw.u32_or("vehicle_age_max", 12),
        }
    }
}

/// Minimum residence tenure, in years, for home statuses outside the configured ones.
pub const DEFAULT_HOME_SINCE_YEARS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmkThresholds {
    pub min_income: f64,
    pub min_work_years: u32,
    pub min_home_years_owned: u32,
    pub min_home_years_employer: u32,
    pub min_home_years_rented: u32,
    pub min_age_single: u32,
    pub min_age_married: u32,
    pub max_age_limit: u32,
}

impl Default for PmkThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl PmkThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            min_income: raw.f64_or("min_income", 3_000_000.0),
            min_work_years: raw.u32_or("min_work_years", 1),
            min_home_years_owned: raw.u32_or("min_home_years_owned", 1),
            min_home_years_employer: raw.u32_or("min_home_years_employer", 1),
            min_home_years_rented: raw.u32_or("min_home_years_rented", 1),
            min_age_single: raw.u32_or("min_age_single", 21),
            min_age_married: raw.u32_or("min_age_married", 18),
            max_age_limit: raw.u32_or("max_age_limit", 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsrThresholds {
    /// Default: 35%.
    pub max_dsr_percent: f64,
    /// Force PASS regardless of the computed ratio. Default: off.
    pub dsr_bypass: bool,
    /// Customer segments that skip the cap entirely (upper-cased). Default: none.
    pub exempt_segments: Vec<String>,
}

impl Default for DsrThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl DsrThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            max_dsr_percent: raw.f64_or("max_dsr_percent", 35.0),
            dsr_bypass: raw.bool_or("dsr_bypass", false),
            exempt_segments: raw.strings_or("exempt_segments", &[]),
        }
    }

    pub fn is_exempt(&self, segment: Option<&str>) -> bool {
        segment
            .map(|segment| segment.trim().to_ascii_uppercase())
            .map(|segment| self.exempt_segments.iter().any(|exempt| *exempt == segment))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockThresholds {
    pub lock_reject_attempt: u32,
    pub lock_reject_window_days: u32,
    pub lock_reject_ban_days: u32,
    pub lock_cancel_attempt: u32,
    pub lock_cancel_window_days: u32,
    pub lock_cancel_ban_days: u32,
    pub chassis_attempt_limit: u32,
    pub chassis_window_days: u32,
    pub chassis_ban_days: u32,
}

impl Default for LockThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl LockThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            lock_reject_attempt: raw.u32_or("lock_reject_attempt", 3),
            lock_reject_window_days: raw.u32_or("lock_reject_window_days", 30),
            lock_reject_ban_days: raw.u32_or("lock_reject_ban_days", 30),
            lock_cancel_attempt: raw.u32_or("lock_cancel_attempt", 3),
            lock_cancel_window_days: raw.u32_or("lock_cancel_window_days", 30),
            lock_cancel_ban_days: raw.u32_or("lock_cancel_ban_days", 30),
            chassis_attempt_limit: raw.u32_or("chassis_attempt_limit", 2),
            chassis_window_days: raw.u32_or("chassis_window_days", 30),
            chassis_ban_days: raw.u32_or("chassis_ban_days", 30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BureauThresholds {
    /// Worst tolerated collectability grade (1 = current .. 5 = loss). Default: 2.
    pub max_collectability: u8,
    /// Default: 60 days.
    pub max_ovd_days: u32,
}

impl Default for BureauThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl BureauThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            max_collectability: u8::try_from(raw.u32_or("max_collectability", 2)).unwrap_or(2),
            max_ovd_days: raw.u32_or("max_ovd_days", 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringThresholds {
    pub min_score: f64,
    /// Risk bands rejected outright (upper-cased). Default: `["HIGH"]`.
    pub reject_bands: Vec<String>,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl ScoringThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            min_score: raw.f64_or("min_score", 0.0),
            reject_bands: raw.strings_or("reject_bands", &["HIGH"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElaborateThresholds {
    /// Default: 85%.
    pub max_ltv_percent: f64,
    /// Exposure strictly below this amount is auto-approved. Default: 0 (disabled).
    pub auto_approve_max_exposure: f64,
}

impl Default for ElaborateThresholds {
    fn default() -> Self {
        Self::from_raw(&RawThresholds::default())
    }
}

impl ElaborateThresholds {
    fn from_raw(raw: &RawThresholds) -> Self {
        Self {
            max_ltv_percent: raw.f64_or("max_ltv_percent", 85.0),
            auto_approve_max_exposure: raw.f64_or("auto_approve_max_exposure", 0.0),
        }
    }
}

/// Immutable set of thresholds used for exactly one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSnapshot {
    /// Version of each family that was loaded; families on defaults are absent.
    pub versions: BTreeMap<ThresholdFamily, u32>,
    pub dupcheck: DupcheckThresholds,
    pub blacklist: BlacklistThresholds,
    pub vehicle_age: VehicleAgeThresholds,
    pub pmk: PmkThresholds,
    pub dsr: DsrThresholds,
    pub lock: LockThresholds,
    pub bureau: BureauThresholds,
    pub scoring: ScoringThresholds,
    pub elaborate: ElaborateThresholds,
}

impl ThresholdSnapshot {
    /// Build a snapshot from raw JSON bodies keyed by family, as the resolver does.
    pub fn from_bodies(bodies: &BTreeMap<ThresholdFamily, String>) -> Self {
        let mut snapshot = Self::default();
        for (family, body) in bodies {
            snapshot.apply(*family, &RawThresholds::parse(*family, body));
        }
        snapshot
    }

    fn apply(&mut self, family: ThresholdFamily, raw: &RawThresholds) {
        match family {
            ThresholdFamily::Dupcheck => self.dupcheck = DupcheckThresholds::from_raw(raw),
            ThresholdFamily::Blacklist => self.blacklist = BlacklistThresholds::from_raw(raw),
            ThresholdFamily::VehicleAge => self.vehicle_age = VehicleAgeThresholds::from_raw(raw),
            ThresholdFamily::Pmk => self.pmk = PmkThresholds::from_raw(raw),
            ThresholdFamily::Dsr => self.dsr = DsrThresholds::from_raw(raw),
            ThresholdFamily::Lock => self.lock = LockThresholds::from_raw(raw),
            ThresholdFamily::Bureau => self.bureau = BureauThresholds::from_raw(raw),
            ThresholdFamily::Scoring => self.scoring = ScoringThresholds::from_raw(raw),
            ThresholdFamily::Elaborate => self.elaborate = ElaborateThresholds::from_raw(raw),
        }
    }
}

/// Loads a fresh [`ThresholdSnapshot`] per run. Never fails.
pub struct ThresholdResolver {
    store: Arc<dyn ConfigStore>,
}

impl ThresholdResolver {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self) -> ThresholdSnapshot {
        let lookups: Vec<_> = ThresholdFamily::ALL
            .iter()
            .map(|family| load_family(self.store.clone(), *family))
            .collect();

        let loaded = fetch_all(lookups).await.unwrap_or_default();

        let mut snapshot = ThresholdSnapshot::default();
        for (family, stored) in loaded {
            if let Some(stored) = stored {
                debug!(%family, version = stored.version, "loaded threshold config");
                snapshot.apply(family, &RawThresholds::parse(family, &stored.body));
                snapshot.versions.insert(family, stored.version);
            }
        }
        snapshot
    }
}

type FamilyLookup = BoxFuture<'static, Result<(ThresholdFamily, Option<StoredThresholds>), ()>>;

fn load_family(store: Arc<dyn ConfigStore>, family: ThresholdFamily) -> FamilyLookup {
    Box::pin(async move {
        match store.latest(family).await {
            Ok(stored) => Ok((family, stored)),
            Err(err) => {
                warn!(%family, error = %err, "threshold config unavailable; using defaults");
                Ok((family, None))
            }
        }
    })
}
