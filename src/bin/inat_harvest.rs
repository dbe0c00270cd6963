use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use inat_harvest::app::{App, RunOptions};
use inat_harvest::config::{ConfigLoader, HarvestConfig, ResolvedConfig};
use inat_harvest::credentials::{Credential, CredentialMode, CredentialProvider, EnvFileStore};
use inat_harvest::domain::{IconicTaxon, PhotoTier, QualityGrade};
use inat_harvest::error::HarvestError;
use inat_harvest::inat::{InatHttpClient, OAuthHttpClient};
use inat_harvest::materialize::AssetHttpClient;
use inat_harvest::output::{LogSink, RunReport, log_summary};
use inat_harvest::rate::RateGovernor;
use inat_harvest::store::ImageStore;

#[derive(Parser)]
#[command(name = "inat-harvest")]
#[command(about = "Download iNaturalist observations and photos around a location")]
#[command(version, author)]
struct Cli {
    #[arg(long, allow_negative_numbers = true, help = "Center latitude (default: Les village, Bali)")]
    lat: Option<f64>,

    #[arg(long, allow_negative_numbers = true, help = "Center longitude")]
    lon: Option<f64>,

    #[arg(long, help = "Search radius in miles (default: 5)")]
    radius: Option<f64>,

    #[arg(long, help = "Metadata JSON output path (default: inaturalist_metadata.json)")]
    output: Option<String>,

    #[arg(long, help = "Directory for downloaded photos (default: ./images)")]
    images_dir: Option<String>,

    #[arg(long, help = "Only write metadata, skip photo downloads")]
    no_download: bool,

    #[arg(long)]
    max_observations: Option<usize>,

    #[arg(long, value_enum, help = "Requested photo size (default: original)")]
    image_quality: Option<PhotoTier>,

    #[arg(long, value_enum)]
    quality_grade: Option<QualityGrade>,

    #[arg(long, value_enum, ignore_case = true)]
    iconic_taxon: Option<IconicTaxon>,

    #[arg(long, help = "Observed on or after (YYYY-MM-DD)")]
    observed_since: Option<String>,

    #[arg(long, help = "Observed on or before (YYYY-MM-DD)")]
    observed_before: Option<String>,

    #[arg(long)]
    captive_only: bool,

    #[arg(long)]
    wild_only: bool,

    #[arg(long)]
    introduced_only: bool,

    #[arg(long)]
    native_only: bool,

    #[arg(long)]
    threatened_only: bool,

    #[arg(long)]
    endemic_only: bool,

    #[arg(long, help = "Observations per API page, 1-200 (default: 200)")]
    per_page: Option<u32>,

    #[arg(long, help = "Concurrent photo downloads (default: 1)")]
    workers: Option<usize>,

    #[arg(long, help = "Ignore stored credentials and run anonymously")]
    no_auth: bool,

    #[arg(long, help = "Bearer token to use instead of the credential store")]
    access_token: Option<String>,

    #[arg(long, help = "Credential store file (default: .env)")]
    credentials: Option<String>,

    #[arg(long, help = "JSON run configuration (default: inat-harvest.json if present)")]
    config: Option<String>,
}

impl Cli {
    fn overrides(&self) -> HarvestConfig {
        let flag = |set: bool| set.then_some(true);
        HarvestConfig {
            schema_version: None,
            lat: self.lat,
            lon: self.lon,
            radius: self.radius,
            output: self.output.clone(),
            images_dir: self.images_dir.clone(),
            download: self.no_download.then_some(false),
            max_observations: self.max_observations,
            image_quality: self.image_quality,
            quality_grade: self.quality_grade,
            iconic_taxon: self.iconic_taxon,
            observed_since: self.observed_since.clone(),
            observed_before: self.observed_before.clone(),
            captive_only: flag(self.captive_only),
            wild_only: flag(self.wild_only),
            introduced_only: flag(self.introduced_only),
            native_only: flag(self.native_only),
            threatened_only: flag(self.threatened_only),
            endemic_only: flag(self.endemic_only),
            per_page: self.per_page,
            workers: self.workers,
            auth: self.no_auth.then_some(false),
            credentials: self.credentials.clone(),
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::InvalidFilter(_)
        | HarvestError::InvalidDate(_)
        | HarvestError::MissingConfig(_)
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::CredentialStore(_) => 2,
        HarvestError::Http(_)
        | HarvestError::TransientRemote(_)
        | HarvestError::RemoteStatus { .. }
        | HarvestError::MalformedResponse(_)
        | HarvestError::AuthUnavailable(_)
        | HarvestError::HarvestFailed { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref(), cli.overrides())?;
    let governor = Arc::new(RateGovernor::default());
    let credentials = build_credentials(&cli, &config, Arc::clone(&governor))?;

    let app = App::new(
        InatHttpClient::new()?,
        AssetHttpClient::new()?,
        credentials,
        Arc::clone(&governor),
        ImageStore::new(config.images_dir.clone()),
    );
    let options = RunOptions {
        max_results: config.max_observations,
        tier: config.image_quality,
        download: config.download,
        workers: config.workers,
        ..RunOptions::default()
    };

    let mut outcome = app.run(config.query.clone(), options, &LogSink);
    let report = RunReport::new(
        config.filter(),
        &outcome,
        config.download.then_some(config.images_dir.as_path()),
        config.image_quality,
        Utc::now(),
    );
    report.write(&config.output)?;
    log_summary(&report);

    match outcome.error.take() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn build_credentials(
    cli: &Cli,
    config: &ResolvedConfig,
    governor: Arc<RateGovernor>,
) -> miette::Result<CredentialProvider> {
    if !config.auth {
        tracing::info!("running unauthenticated");
        return Ok(CredentialProvider::unauthenticated(governor));
    }
    if let Some(token) = &cli.access_token {
        let credential = Credential::bearer(token.clone(), None, None)?;
        return Ok(CredentialProvider::new(credential, governor));
    }

    let path = config
        .credentials
        .clone()
        .unwrap_or_else(EnvFileStore::default_path);
    let store = EnvFileStore::new(path.clone());
    let provider = CredentialProvider::from_store(
        Box::new(store),
        Box::new(OAuthHttpClient::new()?),
        governor,
    )?;
    if provider.mode() == CredentialMode::Bearer {
        tracing::info!(store = %path, "using stored access token");
    } else {
        tracing::info!(store = %path, "no access token found, running unauthenticated");
    }
    Ok(provider)
}
