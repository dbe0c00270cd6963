use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const KM_PER_MILE: f64 = 1.60934;

pub fn miles_to_km(miles: f64) -> f64 {
    miles * KM_PER_MILE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum QualityGrade {
    Research,
    #[value(name = "needs_id")]
    NeedsId,
    Casual,
}

impl QualityGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityGrade::Research => "research",
            QualityGrade::NeedsId => "needs_id",
            QualityGrade::Casual => "casual",
        }
    }
}

impl fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QualityGrade {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "research" => Ok(QualityGrade::Research),
            "needs_id" => Ok(QualityGrade::NeedsId),
            "casual" => Ok(QualityGrade::Casual),
            other => Err(HarvestError::InvalidFilter(format!(
                "unknown quality grade: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum IconicTaxon {
    Animalia,
    Plantae,
    Insecta,
    Aves,
    Mammalia,
    Reptilia,
    Amphibia,
    Mollusca,
    Arachnida,
    Fungi,
}

impl IconicTaxon {
    pub fn name(self) -> &'static str {
        match self {
            IconicTaxon::Animalia => "Animalia",
            IconicTaxon::Plantae => "Plantae",
            IconicTaxon::Insecta => "Insecta",
            IconicTaxon::Aves => "Aves",
            IconicTaxon::Mammalia => "Mammalia",
            IconicTaxon::Reptilia => "Reptilia",
            IconicTaxon::Amphibia => "Amphibia",
            IconicTaxon::Mollusca => "Mollusca",
            IconicTaxon::Arachnida => "Arachnida",
            IconicTaxon::Fungi => "Fungi",
        }
    }

    pub fn taxon_id(self) -> u64 {
        match self {
            IconicTaxon::Animalia => 1,
            IconicTaxon::Plantae => 47126,
            IconicTaxon::Insecta => 47158,
            IconicTaxon::Aves => 3,
            IconicTaxon::Mammalia => 40151,
            IconicTaxon::Reptilia => 26036,
            IconicTaxon::Amphibia => 20978,
            IconicTaxon::Mollusca => 47115,
            IconicTaxon::Arachnida => 47119,
            IconicTaxon::Fungi => 47170,
        }
    }
}

impl fmt::Display for IconicTaxon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PhotoTier {
    Square,
    Small,
    Medium,
    Large,
    Original,
}

impl PhotoTier {
    pub const FALLBACK_ORDER: [PhotoTier; 5] = [
        PhotoTier::Original,
        PhotoTier::Large,
        PhotoTier::Medium,
        PhotoTier::Small,
        PhotoTier::Square,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhotoTier::Square => "square",
            PhotoTier::Small => "small",
            PhotoTier::Medium => "medium",
            PhotoTier::Large => "large",
            PhotoTier::Original => "original",
        }
    }
}

impl fmt::Display for PhotoTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, HarvestError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(HarvestError::InvalidFilter(format!(
                "latitude out of range: {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(HarvestError::InvalidFilter(format!(
                "longitude out of range: {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub since: Option<NaiveDate>,
    pub before: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(since: Option<NaiveDate>, before: Option<NaiveDate>) -> Result<Self, HarvestError> {
        if let (Some(lower), Some(upper)) = (since, before)
            && lower > upper
        {
            return Err(HarvestError::InvalidFilter(format!(
                "observed-since {lower} is after observed-before {upper}"
            )));
        }
        Ok(Self { since, before })
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, HarvestError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| HarvestError::InvalidDate(value.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Establishment {
    Native,
    Introduced,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_miles: f64,
    pub quality_grade: Option<QualityGrade>,
    pub iconic_taxon: Option<IconicTaxon>,
    pub observed_since: Option<NaiveDate>,
    pub observed_before: Option<NaiveDate>,
    pub captive_only: bool,
    pub wild_only: bool,
    pub introduced_only: bool,
    pub native_only: bool,
    pub threatened_only: bool,
    pub endemic_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoFilter {
    pub center: Coordinate,
    pub radius_miles: f64,
    pub radius_km: f64,
    pub quality_grade: Option<QualityGrade>,
    pub iconic_taxon: Option<IconicTaxon>,
    pub observed_on: DateRange,
    pub captive: Option<bool>,
    pub establishment: Option<Establishment>,
    pub threatened: bool,
    pub endemic: bool,
}

impl GeoFilter {
    pub fn new(latitude: f64, longitude: f64, radius_miles: f64) -> Result<Self, HarvestError> {
        Self::from_request(FilterRequest {
            latitude,
            longitude,
            radius_miles,
            ..FilterRequest::default()
        })
    }

    pub fn from_request(request: FilterRequest) -> Result<Self, HarvestError> {
        let center = Coordinate::new(request.latitude, request.longitude)?;
        if !request.radius_miles.is_finite() || request.radius_miles <= 0.0 {
            return Err(HarvestError::InvalidFilter(format!(
                "radius must be positive, got {}",
                request.radius_miles
            )));
        }
        let observed_on = DateRange::new(request.observed_since, request.observed_before)?;

        let captive = match (request.captive_only, request.wild_only) {
            (true, true) => {
                return Err(HarvestError::InvalidFilter(
                    "captive-only and wild-only are mutually exclusive".to_string(),
                ));
            }
            (true, false) => Some(true),
            (false, true) => Some(false),
            (false, false) => None,
        };

        let establishment = match (request.introduced_only, request.native_only) {
            (true, true) => {
                return Err(HarvestError::InvalidFilter(
                    "introduced-only and native-only are mutually exclusive".to_string(),
                ));
            }
            (true, false) => Some(Establishment::Introduced),
            (false, true) => Some(Establishment::Native),
            (false, false) => None,
        };

        Ok(Self {
            center,
            radius_miles: request.radius_miles,
            radius_km: miles_to_km(request.radius_miles),
            quality_grade: request.quality_grade,
            iconic_taxon: request.iconic_taxon,
            observed_on,
            captive,
            establishment,
            threatened: request.threatened_only,
            endemic: request.endemic_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_order_starts_at_original() {
        assert_eq!(PhotoTier::FALLBACK_ORDER[0], PhotoTier::Original);
        assert_eq!(PhotoTier::FALLBACK_ORDER[4], PhotoTier::Square);
    }

    #[test]
    fn quality_grade_round_trips_through_str() {
        let grade: QualityGrade = "needs_id".parse().unwrap();
        assert_eq!(grade, QualityGrade::NeedsId);
        assert_eq!(grade.as_str(), "needs_id");
    }
}
