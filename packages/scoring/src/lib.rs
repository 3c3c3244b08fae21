#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Scoring primitives for the SafeRoute risk engine.
//!
//! This crate defines the closed crime category taxonomy, the harm and
//! time-of-day weight tables, the recency decay table, and the piecewise
//! risk function. Heatmap cells and route segments are both scored through
//! the same [`risk_score`] function and the same [`ScoringTables::weighted_value`]
//! fold, so a hexagon rendered on the map and a route segment crossing it
//! can never disagree.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Weighted-count thresholds for the piecewise risk function.
///
/// Calibrated for H3 resolution 10 cells (~73m edge, ~13,781 m²) against
/// Southampton crime data with a 12-month lookback (P50 ~2, P75 ~10,
/// P90 ~30, P95 ~60, P99 ~150+).
const THRESHOLD_VERY_LOW: f64 = 5.0;
const THRESHOLD_LOW: f64 = 20.0;
const THRESHOLD_MODERATE: f64 = 50.0;
const THRESHOLD_HIGH: f64 = 100.0;
const THRESHOLD_VERY_HIGH: f64 = 200.0;

/// The closed crime category taxonomy.
///
/// Slugs follow the UK Police street-crime category identifiers. Any
/// category outside this set normalizes to [`CrimeCategory::Other`] before
/// aggregation, so the table is closed at scoring time.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CrimeCategory {
    /// Violence and sexual offences
    ViolentCrime,
    /// Taking property by force or threat
    Robbery,
    /// Unlawful entry of a dwelling or business
    Burglary,
    /// Theft directly from the victim without force
    TheftFromThePerson,
    /// Theft of or from a vehicle
    VehicleCrime,
    /// Criminal damage and arson
    CriminalDamageArson,
    /// Possession of weapons
    PossessionOfWeapons,
    /// Drug offences
    Drugs,
    /// Public order offences
    PublicOrder,
    /// Bicycle theft
    BicycleTheft,
    /// Theft not covered by a more specific category
    OtherTheft,
    /// Shoplifting
    Shoplifting,
    /// Anti-social behaviour
    AntiSocialBehaviour,
    /// Everything else, including unknown feed categories
    #[strum(to_string = "other", serialize = "other-crime")]
    Other,
}

impl CrimeCategory {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::ViolentCrime,
            Self::Robbery,
            Self::Burglary,
            Self::TheftFromThePerson,
            Self::VehicleCrime,
            Self::CriminalDamageArson,
            Self::PossessionOfWeapons,
            Self::Drugs,
            Self::PublicOrder,
            Self::BicycleTheft,
            Self::OtherTheft,
            Self::Shoplifting,
            Self::AntiSocialBehaviour,
            Self::Other,
        ]
    }

    /// Normalizes a feed category slug into the closed taxonomy.
    ///
    /// Unknown slugs map to [`CrimeCategory::Other`] so that every event
    /// carries a scorable category before it reaches aggregation.
    #[must_use]
    pub fn from_slug(slug: &str) -> Self {
        slug.parse().unwrap_or(Self::Other)
    }
}

/// One of the four diurnal buckets used for time-of-day weighting.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimeOfDay {
    /// 23:00-06:00
    Night,
    /// 06:00-10:00
    Morning,
    /// 10:00-18:00
    Day,
    /// 18:00-23:00
    Evening,
}

impl TimeOfDay {
    /// Classifies a local-time hour into its diurnal bucket.
    #[must_use]
    pub const fn from_hour(hour: u32) -> Self {
        match hour {
            6..=9 => Self::Morning,
            10..=17 => Self::Day,
            18..=22 => Self::Evening,
            _ => Self::Night,
        }
    }
}

/// Risk classification derived from the safety score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskClass {
    /// Safety score >= 75
    Low,
    /// Safety score in [50, 75)
    Medium,
    /// Safety score < 50
    High,
}

impl RiskClass {
    /// Classifies a 0-100 safety score.
    #[must_use]
    pub fn from_safety(safety: f64) -> Self {
        if safety >= 75.0 {
            Self::Low
        } else if safety >= 50.0 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

/// Errors raised while loading the weight tables.
#[derive(Debug, thiserror::Error)]
pub enum WeightsError {
    /// The TOML document failed to parse.
    #[error("Failed to parse weights config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The weights file could not be read.
    #[error("Failed to read weights config: {0}")]
    Io(#[from] std::io::Error),

    /// A table key does not name a known crime category.
    #[error("Unknown crime category in weights config: {slug}")]
    UnknownCategory {
        /// The unrecognized slug.
        slug: String,
    },

    /// A weight was negative.
    #[error("Negative weight for {slug}: {value}")]
    NegativeWeight {
        /// The category the weight belongs to.
        slug: String,
        /// The offending value.
        value: f64,
    },
}

/// One category's row in the weights config.
#[derive(Debug, Clone, Copy, Deserialize)]
struct WeightRow {
    harm: f64,
    night: f64,
    morning: f64,
    day: f64,
    evening: f64,
}

impl Default for WeightRow {
    fn default() -> Self {
        Self {
            harm: 1.0,
            night: 1.0,
            morning: 1.0,
            day: 1.0,
            evening: 1.0,
        }
    }
}

/// Default weight tables embedded at compile time.
const DEFAULT_WEIGHTS_TOML: &str = include_str!("../weights.toml");

/// Harm weights and time-of-day multipliers for every category.
///
/// Loaded once at startup. Categories absent from the config fall back to
/// neutral weights (1.0 everywhere).
#[derive(Debug, Clone)]
pub struct ScoringTables {
    rows: BTreeMap<CrimeCategory, WeightRow>,
}

impl Default for ScoringTables {
    /// Builds the tables from the embedded default config.
    ///
    /// # Panics
    ///
    /// Panics if the embedded config is malformed (a compile-time artifact,
    /// covered by tests).
    fn default() -> Self {
        Self::from_toml_str(DEFAULT_WEIGHTS_TOML).expect("embedded weights.toml is malformed")
    }
}

impl ScoringTables {
    /// Parses weight tables from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`WeightsError`] if the document fails to parse, names an
    /// unknown category, or contains a negative weight.
    pub fn from_toml_str(contents: &str) -> Result<Self, WeightsError> {
        let parsed: BTreeMap<String, WeightRow> = toml::from_str(contents)?;

        let mut rows: BTreeMap<CrimeCategory, WeightRow> = CrimeCategory::all()
            .iter()
            .map(|&cat| (cat, WeightRow::default()))
            .collect();

        for (slug, row) in parsed {
            let category: CrimeCategory =
                slug.parse()
                    .map_err(|_| WeightsError::UnknownCategory { slug: slug.clone() })?;

            for value in [row.harm, row.night, row.morning, row.day, row.evening] {
                if value < 0.0 {
                    return Err(WeightsError::NegativeWeight { slug, value });
                }
            }

            rows.insert(category, row);
        }

        Ok(Self { rows })
    }

    /// Loads weight tables from the file at `SAFEROUTE_WEIGHTS_PATH`, or the
    /// embedded defaults when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns [`WeightsError`] if the override file cannot be read or parsed.
    pub fn from_env() -> Result<Self, WeightsError> {
        match std::env::var("SAFEROUTE_WEIGHTS_PATH") {
            Ok(path) => {
                log::info!("Loading scoring weights from {path}");
                let contents = std::fs::read_to_string(path)?;
                Self::from_toml_str(&contents)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// Returns the harm weight for a category.
    #[must_use]
    pub fn harm_weight(&self, category: CrimeCategory) -> f64 {
        self.rows.get(&category).map_or(1.0, |row| row.harm)
    }

    /// Returns the time-of-day multiplier for a category and bucket.
    #[must_use]
    pub fn time_multiplier(&self, category: CrimeCategory, time_of_day: TimeOfDay) -> f64 {
        self.rows.get(&category).map_or(1.0, |row| match time_of_day {
            TimeOfDay::Night => row.night,
            TimeOfDay::Morning => row.morning,
            TimeOfDay::Day => row.day,
            TimeOfDay::Evening => row.evening,
        })
    }

    /// Computes the query-side weighted value of a category histogram.
    ///
    /// This is the single weighting fold shared by the snapshot service and
    /// the route scorer: `Σ count · harm · tod · override` over the
    /// histogram, where `tod` and `override` default to 1 when absent.
    /// Histogram keys outside the taxonomy normalize to `other`.
    ///
    /// Recency is *not* applied here; callers multiply by
    /// [`recency_weight`] per `(cell, month)` member.
    #[must_use]
    pub fn weighted_value(
        &self,
        stats: &BTreeMap<String, u64>,
        time_of_day: Option<TimeOfDay>,
        overrides: Option<&BTreeMap<String, f64>>,
    ) -> f64 {
        let mut total = 0.0;

        for (slug, &count) in stats {
            let category = CrimeCategory::from_slug(slug);

            let mut weight = self.harm_weight(category);

            if let Some(bucket) = time_of_day {
                weight *= self.time_multiplier(category, bucket);
            }

            if let Some(overrides) = overrides {
                weight *= overrides.get(slug).copied().unwrap_or(1.0);
            }

            #[allow(clippy::cast_precision_loss)]
            {
                total += count as f64 * weight;
            }
        }

        total
    }
}

/// Returns the recency decay factor for an event `months_ago` months old.
///
/// Decays from 1.0 (current month) to 0.30 (more than a year old).
/// Months-ago is always computed against the current month at query time,
/// never at ingestion.
#[must_use]
pub const fn recency_weight(months_ago: u32) -> f64 {
    match months_ago {
        0 => 1.00,
        1 => 0.95,
        2 => 0.90,
        3 => 0.85,
        4 => 0.75,
        5 => 0.70,
        6 => 0.65,
        7 => 0.60,
        8 => 0.55,
        9 => 0.50,
        10 => 0.45,
        11 => 0.40,
        12 => 0.35,
        _ => 0.30,
    }
}

/// Maps a weighted crime count onto a risk score in `[0, 1]`.
///
/// Piecewise-linear over the calibrated thresholds, with the tail above 200
/// compressed into `[0.95, 1.0]` and capped. This is the *only* risk
/// function in the system: heatmap cells and route segments both go through
/// it, which keeps the two surfaces visually and numerically consistent.
#[must_use]
pub fn risk_score(weighted: f64) -> f64 {
    let risk = if weighted <= 0.0 {
        0.0
    } else if weighted < THRESHOLD_VERY_LOW {
        0.2 * weighted / THRESHOLD_VERY_LOW
    } else if weighted < THRESHOLD_LOW {
        0.2 + 0.2 * (weighted - THRESHOLD_VERY_LOW) / (THRESHOLD_LOW - THRESHOLD_VERY_LOW)
    } else if weighted < THRESHOLD_MODERATE {
        0.4 + 0.2 * (weighted - THRESHOLD_LOW) / (THRESHOLD_MODERATE - THRESHOLD_LOW)
    } else if weighted < THRESHOLD_HIGH {
        0.6 + 0.2 * (weighted - THRESHOLD_MODERATE) / (THRESHOLD_HIGH - THRESHOLD_MODERATE)
    } else if weighted < THRESHOLD_VERY_HIGH {
        0.8 + 0.15 * (weighted - THRESHOLD_HIGH) / (THRESHOLD_VERY_HIGH - THRESHOLD_HIGH)
    } else {
        let excess = (weighted - THRESHOLD_VERY_HIGH).min(200.0);
        0.95 + 0.05 * excess / 200.0
    };

    risk.clamp(0.0, 1.0)
}

/// Converts a risk score into a 0-100 safety score, rounded to 1 decimal.
#[must_use]
pub fn safety_score(risk: f64) -> f64 {
    (((1.0 - risk) * 100.0).clamp(0.0, 100.0) * 10.0).round() / 10.0
}

/// Number of whole months between two first-of-month dates.
///
/// Returns 0 when `month` is not earlier than `current_month`.
#[must_use]
pub fn months_between(month: NaiveDate, current_month: NaiveDate) -> u32 {
    let years = i64::from(current_month.year()) - i64::from(month.year());
    let months = years * 12 + i64::from(current_month.month()) - i64::from(month.month());
    u32::try_from(months).unwrap_or(0)
}

/// Returns the first day of the month `months_back` months before `month`.
///
/// # Panics
///
/// Panics if the resulting date underflows the calendar (year < -262143),
/// which cannot happen for real query inputs.
#[must_use]
pub fn month_floor_back(month: NaiveDate, months_back: u32) -> NaiveDate {
    let total = i64::from(month.year()) * 12 + i64::from(month.month()) - 1 - i64::from(months_back);
    let year = total.div_euclid(12);
    let month_index = total.rem_euclid(12);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let date = NaiveDate::from_ymd_opt(year as i32, (month_index + 1) as u32, 1);
    date.expect("month arithmetic produced an invalid date")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    #[test]
    fn unknown_slug_normalizes_to_other() {
        assert_eq!(CrimeCategory::from_slug("violent-crime"), CrimeCategory::ViolentCrime);
        assert_eq!(CrimeCategory::from_slug("other-crime"), CrimeCategory::Other);
        assert_eq!(CrimeCategory::from_slug("quantum-theft"), CrimeCategory::Other);
        assert_eq!(CrimeCategory::Other.to_string(), "other");
    }

    #[test]
    fn hour_buckets_match_boundaries() {
        assert_eq!(TimeOfDay::from_hour(0), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(5), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(6), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(9), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(10), TimeOfDay::Day);
        assert_eq!(TimeOfDay::from_hour(17), TimeOfDay::Day);
        assert_eq!(TimeOfDay::from_hour(18), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(22), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(23), TimeOfDay::Night);
    }

    #[test]
    fn risk_function_boundary_values() {
        assert!((risk_score(0.0) - 0.0).abs() < 1e-9);
        assert!((risk_score(5.0) - 0.2).abs() < 1e-9);
        assert!((risk_score(20.0) - 0.4).abs() < 1e-9);
        assert!((risk_score(50.0) - 0.6).abs() < 1e-9);
        assert!((risk_score(100.0) - 0.8).abs() < 1e-9);
        assert!((risk_score(200.0) - 0.95).abs() < 1e-9);
        assert!((risk_score(400.0) - 1.0).abs() < 1e-9);
        assert!((risk_score(10_000.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn risk_is_monotonic() {
        let samples = [0.0, 0.5, 4.9, 5.0, 12.0, 19.9, 20.0, 35.0, 49.9, 50.0, 75.0, 99.9, 100.0,
            150.0, 199.9, 200.0, 300.0, 399.9, 400.0, 500.0];
        for pair in samples.windows(2) {
            assert!(
                risk_score(pair[0]) <= risk_score(pair[1]),
                "risk decreased between w={} and w={}",
                pair[0],
                pair[1],
            );
        }
    }

    #[test]
    fn safety_rounds_to_one_decimal() {
        assert!((safety_score(0.0) - 100.0).abs() < f64::EPSILON);
        assert!((safety_score(1.0) - 0.0).abs() < f64::EPSILON);
        assert!((safety_score(0.348) - 65.2).abs() < f64::EPSILON);
    }

    #[test]
    fn risk_class_thresholds() {
        assert_eq!(RiskClass::from_safety(100.0), RiskClass::Low);
        assert_eq!(RiskClass::from_safety(75.0), RiskClass::Low);
        assert_eq!(RiskClass::from_safety(74.9), RiskClass::Medium);
        assert_eq!(RiskClass::from_safety(50.0), RiskClass::Medium);
        assert_eq!(RiskClass::from_safety(49.9), RiskClass::High);
        assert_eq!(RiskClass::from_safety(0.0), RiskClass::High);
    }

    #[test]
    fn recency_table_decays() {
        assert!((recency_weight(0) - 1.0).abs() < f64::EPSILON);
        assert!((recency_weight(3) - 0.85).abs() < f64::EPSILON);
        assert!((recency_weight(12) - 0.35).abs() < f64::EPSILON);
        assert!((recency_weight(13) - 0.30).abs() < f64::EPSILON);
        assert!((recency_weight(48) - 0.30).abs() < f64::EPSILON);

        for k in 0..24 {
            assert!(recency_weight(k) >= recency_weight(k + 1));
        }
    }

    #[test]
    fn months_between_spans_year_boundaries() {
        assert_eq!(months_between(month(2025, 7), month(2025, 7)), 0);
        assert_eq!(months_between(month(2025, 1), month(2025, 7)), 6);
        assert_eq!(months_between(month(2024, 7), month(2025, 7)), 12);
        assert_eq!(months_between(month(2023, 11), month(2025, 2)), 15);
        // Later month than "current" clamps to zero rather than underflowing.
        assert_eq!(months_between(month(2025, 9), month(2025, 7)), 0);
    }

    #[test]
    fn month_floor_back_crosses_january() {
        assert_eq!(month_floor_back(month(2025, 7), 0), month(2025, 7));
        assert_eq!(month_floor_back(month(2025, 7), 7), month(2024, 12));
        assert_eq!(month_floor_back(month(2025, 1), 12), month(2024, 1));
        assert_eq!(month_floor_back(month(2025, 1), 13), month(2023, 12));
    }

    #[test]
    fn embedded_weights_parse_and_match_calibration() {
        let tables = ScoringTables::default();
        assert!((tables.harm_weight(CrimeCategory::ViolentCrime) - 3.0).abs() < f64::EPSILON);
        assert!((tables.harm_weight(CrimeCategory::Robbery) - 2.5).abs() < f64::EPSILON);
        assert!((tables.harm_weight(CrimeCategory::Burglary) - 2.0).abs() < f64::EPSILON);
        assert!((tables.harm_weight(CrimeCategory::TheftFromThePerson) - 1.8).abs() < f64::EPSILON);
        assert!((tables.harm_weight(CrimeCategory::AntiSocialBehaviour) - 0.8).abs() < f64::EPSILON);
        assert!((tables.harm_weight(CrimeCategory::Other) - 1.0).abs() < f64::EPSILON);
        assert!(
            (tables.time_multiplier(CrimeCategory::ViolentCrime, TimeOfDay::Night) - 2.5).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn weights_config_rejects_unknown_category() {
        let result = ScoringTables::from_toml_str(
            "[jaywalking]\nharm = 1.0\nnight = 1.0\nmorning = 1.0\nday = 1.0\nevening = 1.0\n",
        );
        assert!(matches!(result, Err(WeightsError::UnknownCategory { .. })));
    }

    #[test]
    fn weights_config_rejects_negative_weight() {
        let result = ScoringTables::from_toml_str(
            "[burglary]\nharm = -2.0\nnight = 1.0\nmorning = 1.0\nday = 1.0\nevening = 1.0\n",
        );
        assert!(matches!(result, Err(WeightsError::NegativeWeight { .. })));
    }

    #[test]
    fn missing_categories_fall_back_to_neutral_weights() {
        let tables = ScoringTables::from_toml_str(
            "[burglary]\nharm = 2.0\nnight = 1.5\nmorning = 0.8\nday = 1.2\nevening = 1.0\n",
        )
        .unwrap();
        assert!((tables.harm_weight(CrimeCategory::Drugs) - 1.0).abs() < f64::EPSILON);
        assert!(
            (tables.time_multiplier(CrimeCategory::Drugs, TimeOfDay::Night) - 1.0).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn weighted_value_single_violent_crime() {
        let tables = ScoringTables::default();
        let mut stats = BTreeMap::new();
        stats.insert("violent-crime".to_string(), 1);

        // Scenario: one violent crime, no time filter.
        let base = tables.weighted_value(&stats, None, None);
        assert!((base - 3.0).abs() < 1e-9);
        assert!((risk_score(base) - 0.12).abs() < 1e-9);
        assert!((safety_score(risk_score(base)) - 88.0).abs() < f64::EPSILON);

        // Same cell queried with the night filter.
        let night = tables.weighted_value(&stats, Some(TimeOfDay::Night), None);
        assert!((night - 7.5).abs() < 1e-9);
        let risk = risk_score(night);
        assert!((risk - (0.2 + 0.2 * 2.5 / 15.0)).abs() < 1e-9);
        assert!((safety_score(risk) - 76.7).abs() < f64::EPSILON);
    }

    #[test]
    fn weighted_value_with_recency_decay() {
        let tables = ScoringTables::default();
        let mut stats = BTreeMap::new();
        stats.insert("violent-crime".to_string(), 1);

        // One violent crime twelve months old.
        let weighted = tables.weighted_value(&stats, None, None) * recency_weight(12);
        assert!((weighted - 1.05).abs() < 1e-9);
        assert!((risk_score(weighted) - 0.042).abs() < 1e-9);
        assert!((safety_score(risk_score(weighted)) - 95.8).abs() < f64::EPSILON);
    }

    #[test]
    fn weighted_value_applies_category_overrides_after_harm() {
        let tables = ScoringTables::default();
        let mut stats = BTreeMap::new();
        stats.insert("burglary".to_string(), 2);

        let mut overrides = BTreeMap::new();
        overrides.insert("burglary".to_string(), 0.5);

        let weighted = tables.weighted_value(&stats, None, Some(&overrides));
        assert!((weighted - 2.0 * 2.0 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn weighted_value_normalizes_unknown_histogram_keys() {
        let tables = ScoringTables::default();
        let mut stats = BTreeMap::new();
        stats.insert("hoverboard-rage".to_string(), 3);

        // Unknown keys score as `other` (harm 1.0).
        assert!((tables.weighted_value(&stats, None, None) - 3.0).abs() < 1e-9);
    }
}
