use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{FilterRequest, GeoFilter, IconicTaxon, PhotoTier, QualityGrade, parse_date};
use crate::error::HarvestError;
use crate::query::{MAX_PER_PAGE, QueryBuilder};

pub const DEFAULT_CONFIG_FILE: &str = "inat-harvest.json";
pub const DEFAULT_LATITUDE: f64 = -8.132489362310453;
pub const DEFAULT_LONGITUDE: f64 = 115.36386760679501;
pub const DEFAULT_RADIUS_MILES: f64 = 5.0;
pub const DEFAULT_OUTPUT: &str = "inaturalist_metadata.json";
pub const DEFAULT_IMAGES_DIR: &str = "./images";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    pub schema_version: Option<u32>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius: Option<f64>,
    pub output: Option<String>,
    pub images_dir: Option<String>,
    pub download: Option<bool>,
    pub max_observations: Option<usize>,
    pub image_quality: Option<PhotoTier>,
    pub quality_grade: Option<QualityGrade>,
    pub iconic_taxon: Option<IconicTaxon>,
    pub observed_since: Option<String>,
    pub observed_before: Option<String>,
    pub captive_only: Option<bool>,
    pub wild_only: Option<bool>,
    pub introduced_only: Option<bool>,
    pub native_only: Option<bool>,
    pub threatened_only: Option<bool>,
    pub endemic_only: Option<bool>,
    pub per_page: Option<u32>,
    pub workers: Option<usize>,
    pub auth: Option<bool>,
    pub credentials: Option<String>,
}

impl HarvestConfig {
    pub fn merge(self, overrides: HarvestConfig) -> HarvestConfig {
        HarvestConfig {
            schema_version: overrides.schema_version.or(self.schema_version),
            lat: overrides.lat.or(self.lat),
            lon: overrides.lon.or(self.lon),
            radius: overrides.radius.or(self.radius),
            output: overrides.output.or(self.output),
            images_dir: overrides.images_dir.or(self.images_dir),
            download: overrides.download.or(self.download),
            max_observations: overrides.max_observations.or(self.max_observations),
            image_quality: overrides.image_quality.or(self.image_quality),
            quality_grade: overrides.quality_grade.or(self.quality_grade),
            iconic_taxon: overrides.iconic_taxon.or(self.iconic_taxon),
            observed_since: overrides.observed_since.or(self.observed_since),
            observed_before: overrides.observed_before.or(self.observed_before),
            captive_only: overrides.captive_only.or(self.captive_only),
            wild_only: overrides.wild_only.or(self.wild_only),
            introduced_only: overrides.introduced_only.or(self.introduced_only),
            native_only: overrides.native_only.or(self.native_only),
            threatened_only: overrides.threatened_only.or(self.threatened_only),
            endemic_only: overrides.endemic_only.or(self.endemic_only),
            per_page: overrides.per_page.or(self.per_page),
            workers: overrides.workers.or(self.workers),
            auth: overrides.auth.or(self.auth),
            credentials: overrides.credentials.or(self.credentials),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub query: QueryBuilder,
    pub output: Utf8PathBuf,
    pub images_dir: Utf8PathBuf,
    pub download: bool,
    pub max_observations: Option<usize>,
    pub image_quality: PhotoTier,
    pub workers: usize,
    pub auth: bool,
    pub credentials: Option<Utf8PathBuf>,
}

impl ResolvedConfig {
    pub fn filter(&self) -> &GeoFilter {
        self.query.filter()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(path: Option<&str>) -> Result<HarvestConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            return match path {
                Some(_) => Err(HarvestError::MissingConfig(config_path)),
                None => Ok(HarvestConfig::default()),
            };
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| HarvestError::ConfigParse(err.to_string()))
    }

    pub fn resolve(
        path: Option<&str>,
        overrides: HarvestConfig,
    ) -> Result<ResolvedConfig, HarvestError> {
        let config = Self::load(path)?.merge(overrides);
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: HarvestConfig) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let observed_since = config.observed_since.as_deref().map(parse_date).transpose()?;
        let observed_before = config.observed_before.as_deref().map(parse_date).transpose()?;
        let filter = GeoFilter::from_request(FilterRequest {
            latitude: config.lat.unwrap_or(DEFAULT_LATITUDE),
            longitude: config.lon.unwrap_or(DEFAULT_LONGITUDE),
            radius_miles: config.radius.unwrap_or(DEFAULT_RADIUS_MILES),
            quality_grade: config.quality_grade,
            iconic_taxon: config.iconic_taxon,
            observed_since,
            observed_before,
            captive_only: config.captive_only.unwrap_or(false),
            wild_only: config.wild_only.unwrap_or(false),
            introduced_only: config.introduced_only.unwrap_or(false),
            native_only: config.native_only.unwrap_or(false),
            threatened_only: config.threatened_only.unwrap_or(false),
            endemic_only: config.endemic_only.unwrap_or(false),
        })?;
        let query = QueryBuilder::new(filter, config.per_page.unwrap_or(MAX_PER_PAGE))?;

        let workers = config.workers.unwrap_or(1);
        if workers == 0 {
            return Err(HarvestError::InvalidFilter(
                "workers must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            query,
            output: Utf8PathBuf::from(config.output.unwrap_or_else(|| DEFAULT_OUTPUT.to_string())),
            images_dir: Utf8PathBuf::from(
                config
                    .images_dir
                    .unwrap_or_else(|| DEFAULT_IMAGES_DIR.to_string()),
            ),
            download: config.download.unwrap_or(true),
            max_observations: config.max_observations,
            image_quality: config.image_quality.unwrap_or(PhotoTier::Original),
            workers,
            auth: config.auth.unwrap_or(true),
            credentials: config.credentials.map(Utf8PathBuf::from),
        })
    }
}
