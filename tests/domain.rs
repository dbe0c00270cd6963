use assert_matches::assert_matches;

use inat_harvest::domain::{
    Establishment, FilterRequest, GeoFilter, IconicTaxon, KM_PER_MILE, PhotoTier, QualityGrade,
    miles_to_km, parse_date,
};
use inat_harvest::error::HarvestError;

#[test]
fn radius_is_converted_to_kilometres() {
    let filter = GeoFilter::new(-8.1325, 115.3639, 5.0).unwrap();
    assert_eq!(filter.radius_miles, 5.0);
    assert!((filter.radius_km - 8.0467).abs() < 1e-9);
    assert_eq!(miles_to_km(1.0), KM_PER_MILE);
    assert_eq!(filter.captive, None);
    assert_eq!(filter.establishment, None);
}

#[test]
fn out_of_range_center_is_rejected() {
    assert_matches!(
        GeoFilter::new(91.0, 0.0, 1.0),
        Err(HarvestError::InvalidFilter(_))
    );
    assert_matches!(
        GeoFilter::new(0.0, -180.5, 1.0),
        Err(HarvestError::InvalidFilter(_))
    );
    assert_matches!(
        GeoFilter::new(f64::NAN, 0.0, 1.0),
        Err(HarvestError::InvalidFilter(_))
    );
    assert!(GeoFilter::new(-90.0, 180.0, 1.0).is_ok());
}

#[test]
fn radius_must_be_positive() {
    assert_matches!(
        GeoFilter::new(0.0, 0.0, 0.0),
        Err(HarvestError::InvalidFilter(_))
    );
    assert_matches!(
        GeoFilter::new(0.0, 0.0, -2.0),
        Err(HarvestError::InvalidFilter(_))
    );
}

#[test]
fn date_window_must_be_ordered() {
    let request = FilterRequest {
        latitude: 0.0,
        longitude: 0.0,
        radius_miles: 1.0,
        observed_since: Some(parse_date("2024-06-01").unwrap()),
        observed_before: Some(parse_date("2024-01-01").unwrap()),
        ..FilterRequest::default()
    };
    assert_matches!(
        GeoFilter::from_request(request),
        Err(HarvestError::InvalidFilter(_))
    );
    assert_matches!(parse_date("June 1st"), Err(HarvestError::InvalidDate(_)));
}

#[test]
fn exclusive_toggles_conflict() {
    let base = FilterRequest {
        latitude: 0.0,
        longitude: 0.0,
        radius_miles: 1.0,
        ..FilterRequest::default()
    };

    let introduced = GeoFilter::from_request(FilterRequest {
        introduced_only: true,
        ..base.clone()
    })
    .unwrap();
    assert_eq!(introduced.establishment, Some(Establishment::Introduced));

    let captive = GeoFilter::from_request(FilterRequest {
        captive_only: true,
        ..base.clone()
    })
    .unwrap();
    assert_eq!(captive.captive, Some(true));

    assert_matches!(
        GeoFilter::from_request(FilterRequest {
            introduced_only: true,
            native_only: true,
            ..base.clone()
        }),
        Err(HarvestError::InvalidFilter(_))
    );
    assert_matches!(
        GeoFilter::from_request(FilterRequest {
            captive_only: true,
            wild_only: true,
            ..base
        }),
        Err(HarvestError::InvalidFilter(_))
    );
}

#[test]
fn iconic_taxa_map_to_ids() {
    assert_eq!(IconicTaxon::Plantae.taxon_id(), 47126);
    assert_eq!(IconicTaxon::Aves.name(), "Aves");
    assert_eq!(IconicTaxon::Reptilia.to_string(), "Reptilia");
}

#[test]
fn unknown_quality_grade_is_invalid() {
    assert_matches!(
        "excellent".parse::<QualityGrade>(),
        Err(HarvestError::InvalidFilter(_))
    );
    assert_eq!(
        serde_json::to_string(&QualityGrade::NeedsId).unwrap(),
        "\"needs_id\""
    );
}

#[test]
fn tiers_order_by_size() {
    assert!(PhotoTier::Square < PhotoTier::Original);
    assert_eq!(PhotoTier::Large.to_string(), "large");
    assert_eq!(
        serde_json::from_str::<PhotoTier>("\"medium\"").unwrap(),
        PhotoTier::Medium
    );
}
