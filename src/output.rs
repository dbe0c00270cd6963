use std::collections::HashMap;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, RunOutcome};
use crate::domain::{GeoFilter, PhotoTier};
use crate::error::HarvestError;
use crate::normalize::Observation;
use crate::store::write_bytes_atomic;

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub generated_at: DateTime<Utc>,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_miles: f64,
    pub radius_km: f64,
    pub total_observations: usize,
    pub total_species: usize,
    pub images_downloaded: usize,
    pub images_skipped: usize,
    pub images_failed: usize,
    pub success_rate_percent: f64,
    pub images_directory: Option<String>,
    pub image_quality: PhotoTier,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub metadata: RunMetadata,
    pub observations: &'a [Observation],
}

impl<'a> RunReport<'a> {
    pub fn new(
        filter: &GeoFilter,
        outcome: &'a RunOutcome,
        images_directory: Option<&Utf8Path>,
        image_quality: PhotoTier,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let downloaded = outcome.images_downloaded();
        let skipped = outcome.images_skipped();
        let failed = outcome.images_failed();
        Self {
            metadata: RunMetadata {
                generated_at,
                center_latitude: filter.center.latitude,
                center_longitude: filter.center.longitude,
                radius_miles: filter.radius_miles,
                radius_km: filter.radius_km,
                total_observations: outcome.observations.len(),
                total_species: outcome.species_count,
                images_downloaded: downloaded,
                images_skipped: skipped,
                images_failed: failed,
                success_rate_percent: success_rate(downloaded + skipped, failed),
                images_directory: images_directory.map(|dir| dir.to_string()),
                image_quality,
                authenticated: outcome.authenticated,
                error: outcome.error.as_ref().map(ToString::to_string),
            },
            observations: &outcome.observations,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, HarvestError> {
        serde_json::to_vec_pretty(self).map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), HarvestError> {
        let mut bytes = self.to_json()?;
        bytes.push(b'\n');
        write_bytes_atomic(path, &bytes)?;
        tracing::info!(path = %path, "metadata saved");
        Ok(())
    }
}

pub fn success_rate(present: usize, failed: usize) -> f64 {
    let attempted = present + failed;
    if attempted == 0 {
        return 0.0;
    }
    let rate = present as f64 / attempted as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeciesTally {
    pub name: String,
    pub observations: usize,
}

pub fn top_species(observations: &[Observation], limit: usize) -> Vec<SpeciesTally> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for observation in observations {
        if let Some(name) = observation
            .species
            .as_ref()
            .and_then(|species| species.name.as_deref())
        {
            *counts.entry(name).or_default() += 1;
        }
    }
    let mut tallies: Vec<SpeciesTally> = counts
        .into_iter()
        .map(|(name, observations)| SpeciesTally {
            name: name.to_string(),
            observations,
        })
        .collect();
    tallies.sort_by(|a, b| {
        b.observations
            .cmp(&a.observations)
            .then_with(|| a.name.cmp(&b.name))
    });
    tallies.truncate(limit);
    tallies
}

pub fn log_summary(report: &RunReport<'_>) {
    let metadata = &report.metadata;
    tracing::info!(
        observations = metadata.total_observations,
        species = metadata.total_species,
        downloaded = metadata.images_downloaded,
        skipped = metadata.images_skipped,
        failed = metadata.images_failed,
        "success rate {:.1}%",
        metadata.success_rate_percent
    );
    if metadata.images_failed > 0 {
        tracing::info!(
            failed = metadata.images_failed,
            "some photos could not be fetched; they may have been deleted upstream"
        );
    }
    if metadata.images_skipped > 0 {
        tracing::info!(
            skipped = metadata.images_skipped,
            "existing images were kept; re-running resumes where this run stopped"
        );
    }
    for tally in top_species(report.observations, 10) {
        tracing::info!(observations = tally.observations, "top species: {}", tally.name);
    }
}

pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}

pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn event(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_rounds() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(success_rate(2, 1), 66.7);
        assert_eq!(success_rate(5, 0), 100.0);
    }
}
