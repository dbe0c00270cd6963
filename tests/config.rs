use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use inat_harvest::config::{ConfigLoader, DEFAULT_LATITUDE, HarvestConfig};
use inat_harvest::domain::{Establishment, IconicTaxon, PhotoTier, QualityGrade};
use inat_harvest::error::HarvestError;

fn write_config(content: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inat-harvest.json");
    fs::write(&path, content).unwrap();
    let path = path.to_str().unwrap().to_string();
    (dir, path)
}

#[test]
fn file_settings_are_resolved() {
    let (_dir, path) = write_config(
        r#"{
            "schema_version": 1,
            "lat": 51.5,
            "lon": -0.12,
            "radius": 2.5,
            "output": "london.json",
            "images_dir": "london-images",
            "image_quality": "large",
            "quality_grade": "research",
            "iconic_taxon": "Aves",
            "observed_since": "2024-03-01",
            "native_only": true,
            "per_page": 100,
            "workers": 4,
            "auth": false
        }"#,
    );

    let resolved = ConfigLoader::resolve(Some(&path), HarvestConfig::default()).unwrap();
    let filter = resolved.filter();
    assert_eq!(filter.center.latitude, 51.5);
    assert_eq!(filter.center.longitude, -0.12);
    assert_eq!(filter.radius_miles, 2.5);
    assert_eq!(filter.quality_grade, Some(QualityGrade::Research));
    assert_eq!(filter.iconic_taxon, Some(IconicTaxon::Aves));
    assert_eq!(filter.establishment, Some(Establishment::Native));
    assert_eq!(
        filter.observed_on.since.map(|date| date.to_string()),
        Some("2024-03-01".to_string())
    );
    assert_eq!(resolved.query.per_page(), 100);
    assert_eq!(resolved.output, Utf8PathBuf::from("london.json"));
    assert_eq!(resolved.images_dir, Utf8PathBuf::from("london-images"));
    assert_eq!(resolved.image_quality, PhotoTier::Large);
    assert_eq!(resolved.workers, 4);
    assert!(!resolved.auth);
    assert!(resolved.download);
}

#[test]
fn command_line_overrides_the_file() {
    let (_dir, path) = write_config(r#"{ "radius": 2.5, "download": true, "workers": 4 }"#);
    let overrides = HarvestConfig {
        radius: Some(10.0),
        download: Some(false),
        ..HarvestConfig::default()
    };

    let resolved = ConfigLoader::resolve(Some(&path), overrides).unwrap();
    assert_eq!(resolved.filter().radius_miles, 10.0);
    assert!(!resolved.download);
    assert_eq!(resolved.workers, 4);
    assert_eq!(resolved.filter().center.latitude, DEFAULT_LATITUDE);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = ConfigLoader::load(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, HarvestError::MissingConfig(_));
}

#[test]
fn unknown_keys_are_rejected() {
    let (_dir, path) = write_config(r#"{ "radius_km": 3 }"#);
    let err = ConfigLoader::load(Some(&path)).unwrap_err();
    assert_matches!(err, HarvestError::ConfigParse(_));
}

#[test]
fn invalid_values_surface_before_any_request() {
    let bad_date = HarvestConfig {
        observed_since: Some("2024/01/01".to_string()),
        ..HarvestConfig::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(bad_date),
        Err(HarvestError::InvalidDate(_))
    );

    let conflicting = HarvestConfig {
        captive_only: Some(true),
        wild_only: Some(true),
        ..HarvestConfig::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(conflicting),
        Err(HarvestError::InvalidFilter(_))
    );

    let no_workers = HarvestConfig {
        workers: Some(0),
        ..HarvestConfig::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(no_workers),
        Err(HarvestError::InvalidFilter(_))
    );

    let oversized_page = HarvestConfig {
        per_page: Some(500),
        ..HarvestConfig::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(oversized_page),
        Err(HarvestError::InvalidFilter(_))
    );
}
