use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::domain::{Coordinate, PhotoTier, QualityGrade};
use crate::error::HarvestError;

static ANCESTRY_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:/\d+)*$").expect("ancestry pattern is valid"));

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRef {
    pub id: Option<u64>,
    pub login: Option<String>,
    pub name: Option<String>,
    pub observations_count: Option<u64>,
    pub species_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferencePhoto {
    pub id: Option<u64>,
    pub square_url: Option<String>,
    pub medium_url: Option<String>,
    pub attribution: Option<String>,
    pub license_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Species {
    pub id: u64,
    pub name: Option<String>,
    pub preferred_common_name: Option<String>,
    pub english_common_name: Option<String>,
    pub rank: Option<String>,
    pub rank_level: Option<f64>,
    pub ancestry: Vec<u64>,
    pub is_active: Option<bool>,
    pub conservation_status: Option<String>,
    pub conservation_status_name: Option<String>,
    pub iconic_taxon_id: Option<u64>,
    pub iconic_taxon_name: Option<String>,
    pub wikipedia_url: Option<String>,
    pub extinct: Option<bool>,
    pub introduced: Option<bool>,
    pub native: Option<bool>,
    pub endemic: Option<bool>,
    pub threatened: Option<bool>,
    pub observations_count: Option<u64>,
    pub default_photo: Option<ReferencePhoto>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhotoUrls {
    pub square: Option<String>,
    pub small: Option<String>,
    pub medium: Option<String>,
    pub large: Option<String>,
    pub original: Option<String>,
}

impl PhotoUrls {
    pub fn get(&self, tier: PhotoTier) -> Option<&str> {
        let url = match tier {
            PhotoTier::Square => &self.square,
            PhotoTier::Small => &self.small,
            PhotoTier::Medium => &self.medium,
            PhotoTier::Large => &self.large,
            PhotoTier::Original => &self.original,
        };
        url.as_deref()
    }

    pub fn any(&self) -> Option<&str> {
        PhotoTier::FALLBACK_ORDER
            .iter()
            .find_map(|tier| self.get(*tier))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u64,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Photo {
    pub id: Option<u64>,
    pub observation_id: u64,
    pub index: usize,
    pub license_code: Option<String>,
    pub attribution: Option<String>,
    pub urls: PhotoUrls,
    pub original_dimensions: Option<Dimensions>,
    pub native_page_url: Option<String>,
    pub hidden: bool,
    pub flags_count: usize,
    pub moderator_actions_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_tier: Option<PhotoTier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentificationSource {
    Human,
    AutomatedVision,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    pub id: Option<u64>,
    pub user: Option<UserRef>,
    pub taxon_id: Option<u64>,
    pub agrees: Option<bool>,
    pub source: IdentificationSource,
    pub category: Option<String>,
    pub current: Option<bool>,
    pub body: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub id: u64,
    pub observed_on: Option<String>,
    pub time_observed_at: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub coordinate: Option<Coordinate>,
    pub positional_accuracy: Option<f64>,
    pub public_positional_accuracy: Option<f64>,
    pub quality_grade: Option<QualityGrade>,
    pub num_identification_agreements: Option<u64>,
    pub num_identification_disagreements: Option<u64>,
    pub captive_cultivated: Option<bool>,
    pub description: Option<String>,
    pub place_guess: Option<String>,
    pub geoprivacy: Option<String>,
    pub obscured: Option<bool>,
    pub mappable: Option<bool>,
    pub license_code: Option<String>,
    pub uri: Option<String>,
    pub user: Option<UserRef>,
    pub species: Option<Arc<Species>>,
    pub photos: Vec<Photo>,
    pub identifications: Vec<Identification>,
    pub comments_count: Option<u64>,
    pub faves_count: Option<u64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SpeciesRegistry {
    by_id: HashMap<u64, Arc<Species>>,
}

impl SpeciesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Arc<Species>> {
        self.by_id.get(&id)
    }

    pub fn intern(&mut self, taxon: &Value) -> Option<Arc<Species>> {
        let id = u64_field(taxon, "id")?;
        let species = self
            .by_id
            .entry(id)
            .or_insert_with(|| Arc::new(species_from_taxon(id, taxon)));
        Some(Arc::clone(species))
    }
}

#[derive(Debug, Default)]
pub struct Normalizer {
    registry: SpeciesRegistry,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &SpeciesRegistry {
        &self.registry
    }

    pub fn normalize(&mut self, raw: &Value) -> Result<Observation, HarvestError> {
        let id = record_id(raw).ok_or_else(|| {
            HarvestError::MalformedRecord(format!(
                "observation without a numeric id: {}",
                preview(raw)
            ))
        })?;

        let species = match raw.get("taxon").filter(|taxon| taxon.is_object()) {
            Some(taxon) => {
                let species = self.registry.intern(taxon);
                if species.is_none() {
                    tracing::warn!(observation = id, "taxon without a numeric id, species left empty");
                }
                species
            }
            None => None,
        };

        let photos = array_field(raw, "photos")
            .iter()
            .enumerate()
            .map(|(index, photo)| photo_from_raw(id, index, photo))
            .collect();

        let identifications = array_field(raw, "identifications")
            .iter()
            .map(identification_from_raw)
            .collect();

        let quality_grade = match str_field(raw, "quality_grade") {
            Some(grade) => match grade.parse::<QualityGrade>() {
                Ok(grade) => Some(grade),
                Err(_) => {
                    tracing::debug!(observation = id, grade = %grade, "unknown quality grade");
                    None
                }
            },
            None => None,
        };

        Ok(Observation {
            id,
            observed_on: str_field(raw, "observed_on"),
            time_observed_at: str_field(raw, "time_observed_at"),
            created_at: str_field(raw, "created_at"),
            updated_at: str_field(raw, "updated_at"),
            coordinate: coordinate_from_raw(raw),
            positional_accuracy: f64_field(raw, "positional_accuracy"),
            public_positional_accuracy: f64_field(raw, "public_positional_accuracy"),
            quality_grade,
            num_identification_agreements: u64_field(raw, "num_identification_agreements"),
            num_identification_disagreements: u64_field(raw, "num_identification_disagreements"),
            captive_cultivated: bool_field(raw, "captive_cultivated")
                .or_else(|| bool_field(raw, "captive")),
            description: str_field(raw, "description"),
            place_guess: str_field(raw, "place_guess"),
            geoprivacy: str_field(raw, "geoprivacy"),
            obscured: bool_field(raw, "obscured"),
            mappable: bool_field(raw, "mappable"),
            license_code: str_field(raw, "license_code"),
            uri: str_field(raw, "uri"),
            user: raw.get("user").and_then(user_from_raw),
            species,
            photos,
            identifications,
            comments_count: u64_field(raw, "comments_count"),
            faves_count: u64_field(raw, "faves_count"),
            tags: tags_from_raw(raw),
        })
    }
}

fn species_from_taxon(id: u64, taxon: &Value) -> Species {
    let status = taxon.get("conservation_status");
    let (conservation_status, status_name) = match status {
        Some(Value::Object(_)) => (
            status.and_then(|value| str_field(value, "status")),
            status.and_then(|value| str_field(value, "status_name")),
        ),
        Some(Value::String(code)) if !code.trim().is_empty() => (Some(code.clone()), None),
        _ => (None, None),
    };

    Species {
        id,
        name: str_field(taxon, "name"),
        preferred_common_name: str_field(taxon, "preferred_common_name"),
        english_common_name: str_field(taxon, "english_common_name"),
        rank: str_field(taxon, "rank"),
        rank_level: f64_field(taxon, "rank_level"),
        ancestry: parse_ancestry(id, taxon),
        is_active: bool_field(taxon, "is_active"),
        conservation_status,
        conservation_status_name: str_field(taxon, "conservation_status_name").or(status_name),
        iconic_taxon_id: u64_field(taxon, "iconic_taxon_id"),
        iconic_taxon_name: str_field(taxon, "iconic_taxon_name"),
        wikipedia_url: str_field(taxon, "wikipedia_url"),
        extinct: bool_field(taxon, "extinct"),
        introduced: bool_field(taxon, "introduced"),
        native: bool_field(taxon, "native"),
        endemic: bool_field(taxon, "endemic"),
        threatened: bool_field(taxon, "threatened"),
        observations_count: u64_field(taxon, "observations_count"),
        default_photo: taxon
            .get("default_photo")
            .filter(|photo| photo.is_object())
            .map(|photo| ReferencePhoto {
                id: u64_field(photo, "id"),
                square_url: str_field(photo, "square_url").or_else(|| str_field(photo, "url")),
                medium_url: str_field(photo, "medium_url"),
                attribution: str_field(photo, "attribution"),
                license_code: str_field(photo, "license_code"),
            }),
    }
}

pub fn parse_ancestry(taxon_id: u64, taxon: &Value) -> Vec<u64> {
    if let Some(Value::Array(items)) = taxon.get("ancestor_ids") {
        let ids: Option<Vec<u64>> = items.iter().map(Value::as_u64).collect();
        return match ids {
            Some(mut ids) => {
                if ids.last() == Some(&taxon_id) {
                    ids.pop();
                }
                ids
            }
            None => Vec::new(),
        };
    }

    match taxon.get("ancestry").and_then(Value::as_str) {
        Some(path) if ANCESTRY_PATH.is_match(path.trim()) => path
            .trim()
            .split('/')
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn photo_from_raw(observation_id: u64, index: usize, raw: &Value) -> Photo {
    let urls = PhotoUrls {
        square: str_field(raw, "square_url").or_else(|| str_field(raw, "url")),
        small: str_field(raw, "small_url"),
        medium: str_field(raw, "medium_url"),
        large: str_field(raw, "large_url"),
        original: str_field(raw, "original_url"),
    };
    let original_dimensions = raw.get("original_dimensions").and_then(|dims| {
        Some(Dimensions {
            width: u64_field(dims, "width")?,
            height: u64_field(dims, "height")?,
        })
    });
    Photo {
        id: u64_field(raw, "id"),
        observation_id,
        index,
        license_code: str_field(raw, "license_code"),
        attribution: str_field(raw, "attribution"),
        urls,
        original_dimensions,
        native_page_url: str_field(raw, "native_page_url"),
        hidden: bool_field(raw, "hidden").unwrap_or(false),
        flags_count: array_field(raw, "flags").len(),
        moderator_actions_count: array_field(raw, "moderator_actions").len(),
        local_path: None,
        delivered_tier: None,
    }
}

fn identification_from_raw(raw: &Value) -> Identification {
    let category = str_field(raw, "category");
    let agrees = match bool_field(raw, "disagreement") {
        Some(disagreement) => Some(!disagreement),
        None => match category.as_deref() {
            Some("maverick") => Some(false),
            Some("supporting" | "improving" | "leading") => Some(true),
            _ => None,
        },
    };
    let source = if bool_field(raw, "vision").unwrap_or(false) {
        IdentificationSource::AutomatedVision
    } else {
        IdentificationSource::Human
    };
    Identification {
        id: u64_field(raw, "id"),
        user: raw.get("user").and_then(user_from_raw),
        taxon_id: u64_field(raw, "taxon_id")
            .or_else(|| raw.get("taxon").and_then(|taxon| u64_field(taxon, "id"))),
        agrees,
        source,
        category,
        current: bool_field(raw, "current"),
        body: str_field(raw, "body"),
        created_at: str_field(raw, "created_at"),
    }
}

fn user_from_raw(raw: &Value) -> Option<UserRef> {
    if !raw.is_object() {
        return None;
    }
    Some(UserRef {
        id: u64_field(raw, "id"),
        login: str_field(raw, "login"),
        name: str_field(raw, "name"),
        observations_count: u64_field(raw, "observations_count"),
        species_count: u64_field(raw, "species_count"),
    })
}

fn coordinate_from_raw(raw: &Value) -> Option<Coordinate> {
    if let (Some(lat), Some(lng)) = (f64_field(raw, "latitude"), f64_field(raw, "longitude")) {
        return Coordinate::new(lat, lng).ok();
    }
    if let Some(location) = raw.get("location").and_then(Value::as_str)
        && let Some((lat, lng)) = location.split_once(',')
        && let (Ok(lat), Ok(lng)) = (lat.trim().parse::<f64>(), lng.trim().parse::<f64>())
    {
        return Coordinate::new(lat, lng).ok();
    }
    let coordinates = raw.get("geojson")?.get("coordinates")?.as_array()?;
    match coordinates.as_slice() {
        [lng, lat] => Coordinate::new(lat.as_f64()?, lng.as_f64()?).ok(),
        _ => None,
    }
}

fn tags_from_raw(raw: &Value) -> Vec<String> {
    array_field(raw, "tags")
        .iter()
        .filter_map(|tag| match tag {
            Value::String(tag) => Some(tag.clone()),
            Value::Object(_) => str_field(tag, "tag"),
            _ => None,
        })
        .collect()
}

fn array_field<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn record_id(raw: &Value) -> Option<u64> {
    u64_field(raw, "id")
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn f64_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn bool_field(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(Value::as_bool)
}

fn preview(raw: &Value) -> String {
    let text = raw.to_string();
    if text.chars().count() > 120 {
        format!("{}...", text.chars().take(120).collect::<String>())
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ancestry_from_string() {
        let taxon = json!({ "id": 5, "ancestry": "48460/1/2" });
        assert_eq!(parse_ancestry(5, &taxon), vec![48460, 1, 2]);
    }

    #[test]
    fn ancestry_from_ids_drops_self() {
        let taxon = json!({ "id": 5, "ancestor_ids": [48460, 1, 2, 5] });
        assert_eq!(parse_ancestry(5, &taxon), vec![48460, 1, 2]);
    }

    #[test]
    fn malformed_ancestry_is_empty() {
        assert!(parse_ancestry(5, &json!({ "ancestry": "48460//x" })).is_empty());
        assert!(parse_ancestry(5, &json!({ "ancestor_ids": [1, "two"] })).is_empty());
        assert!(parse_ancestry(5, &json!({ "ancestry": 12 })).is_empty());
        assert!(parse_ancestry(5, &json!({})).is_empty());
    }

    #[test]
    fn coordinate_sources() {
        let from_location = json!({ "location": "-8.13,115.36" });
        assert_eq!(
            coordinate_from_raw(&from_location),
            Some(Coordinate {
                latitude: -8.13,
                longitude: 115.36
            })
        );
        let from_geojson = json!({ "geojson": { "type": "Point", "coordinates": [115.36, -8.13] } });
        assert_eq!(
            coordinate_from_raw(&from_geojson),
            coordinate_from_raw(&from_location)
        );
        assert_eq!(coordinate_from_raw(&json!({ "location": "nowhere" })), None);
    }

    #[test]
    fn identification_stance() {
        let vision = identification_from_raw(&json!({ "vision": true, "category": "supporting" }));
        assert_eq!(vision.source, IdentificationSource::AutomatedVision);
        assert_eq!(vision.agrees, Some(true));

        let dissent = identification_from_raw(&json!({ "disagreement": true }));
        assert_eq!(dissent.agrees, Some(false));
        assert_eq!(dissent.source, IdentificationSource::Human);

        let silent = identification_from_raw(&json!({ "category": "removed" }));
        assert_eq!(silent.agrees, None);
    }
}
