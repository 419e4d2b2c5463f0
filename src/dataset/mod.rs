//! Implementation of the `dataset build` subcommand.
//!
//! The pipeline runs its stages in fixed dependency order: archive,
//! annotation, interpretation, conservation, export.  Each stage re-derives
//! its own index over the shared record store and fills the columns it is
//! responsible for; a failed stage aborts the pipeline before the next one
//! runs.

pub mod annotation;
pub mod archive;
pub mod conservation;
pub mod export;
pub mod interpretation;
pub mod record;

use std::time::Instant;

use clap::Parser;

use crate::clients::http::{
    HttpBatchAnnotationClient, HttpCaseArchiveClient, HttpInterpretationClient, HttpService,
    HttpVariantClient, DEFAULT_ARCHIVE_PAGE_SIZE,
};
use crate::clients::retry::RetryPolicy;
use crate::clients::{
    BatchAnnotationClient, CaseArchiveClient, CaseStatus, InterpretationClient, VariantClient,
};
use crate::common::{default_concurrency, GenomeRelease};

use self::annotation::AnnotationStage;
use self::archive::ArchiveStage;
use self::conservation::ConservationStage;
use self::interpretation::InterpretationStage;
use self::record::RecordStore;

/// Environment variable holding the service username.
const USERNAME_ENV: &str = "DATASET_SERVICE_USERNAME";
/// Environment variable holding the service password.
const PASSWORD_ENV: &str = "DATASET_SERVICE_PASSWORD";

/// Command line arguments for `dataset build` subcommand.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Build the variant dataset", long_about = None)]
pub struct Args {
    /// The assumed genome build.
    #[clap(long, value_enum, default_value_t = GenomeRelease::Grch38)]
    pub genome_release: GenomeRelease,
    /// Program to filter archived cases by.
    #[clap(long, default_value = "rare_disease")]
    pub program: String,
    /// Case statuses to include.
    #[clap(
        long,
        value_enum,
        value_delimiter = ',',
        default_values_t = vec![CaseStatus::ArchivedPositive, CaseStatus::ArchivedNegative]
    )]
    pub case_status: Vec<CaseStatus>,
    /// Path to the output CSV file.
    #[clap(long)]
    pub path_output: String,

    /// Base URL of the case/variant archive service.
    #[clap(long)]
    pub archive_url: String,
    /// Base URL of the clinical interpretation service.
    #[clap(long)]
    pub interpretation_url: String,
    /// Base URL of the batch annotation service.
    #[clap(long)]
    pub annotation_url: String,

    /// Maximal number of concurrent lookups per stage; defaults to the number
    /// of available cores.
    #[clap(long)]
    pub concurrency: Option<usize>,
    /// Number of keys per conservation batch request.
    #[clap(long, default_value_t = 200)]
    pub batch_size: usize,
}

/// Main entry point for `dataset build` subcommand.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!(
        "variant-dataset-worker version {}",
        crate::common::worker_version()
    );
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let username = std::env::var(USERNAME_ENV)
        .map_err(|_| anyhow::anyhow!("{} must hold the service username", USERNAME_ENV))?;
    let password = std::env::var(PASSWORD_ENV)
        .map_err(|_| anyhow::anyhow!("{} must hold the service password", PASSWORD_ENV))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let policy = RetryPolicy::default();
        // The variant lookups are served by the archive service as well.
        let archive = HttpCaseArchiveClient::new(
            HttpService::new(&args.archive_url, &username, &password, policy.clone())?,
            DEFAULT_ARCHIVE_PAGE_SIZE,
        );
        let variants = HttpVariantClient::new(HttpService::new(
            &args.archive_url,
            &username,
            &password,
            policy.clone(),
        )?);
        let interpretation = HttpInterpretationClient::new(HttpService::new(
            &args.interpretation_url,
            &username,
            &password,
            policy.clone(),
        )?);
        let batch = HttpBatchAnnotationClient::new(HttpService::new(
            &args.annotation_url,
            &username,
            &password,
            policy,
        )?);

        let store = run_pipeline(&archive, &variants, &interpretation, &batch, args).await?;
        export::write_dataset(&store, &args.path_output)
    })?;

    tracing::info!(
        "All of `dataset build` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}

/// Run all enrichment stages in dependency order and return the final record
/// set.
pub async fn run_pipeline(
    archive: &dyn CaseArchiveClient,
    variants: &dyn VariantClient,
    interpretation: &dyn InterpretationClient,
    batch: &dyn BatchAnnotationClient,
    args: &Args,
) -> Result<RecordStore, anyhow::Error> {
    let concurrency = args.concurrency.unwrap_or_else(default_concurrency);

    tracing::info!("running archive stage ...");
    let before_stage = Instant::now();
    let mut store = ArchiveStage::new(
        archive,
        args.program.clone(),
        args.genome_release,
        args.case_status.clone(),
    )
    .run()
    .await?;
    tracing::info!("... archive stage done in {:?}", before_stage.elapsed());

    tracing::info!("running annotation stage ...");
    let before_stage = Instant::now();
    AnnotationStage::new(variants, args.genome_release, concurrency)
        .run(&mut store)
        .await?;
    tracing::info!("... annotation stage done in {:?}", before_stage.elapsed());

    tracing::info!("running interpretation stage ...");
    let before_stage = Instant::now();
    InterpretationStage::new(interpretation, concurrency)
        .run(&mut store)
        .await?;
    tracing::info!(
        "... interpretation stage done in {:?}",
        before_stage.elapsed()
    );

    tracing::info!("running conservation stage ...");
    let before_stage = Instant::now();
    ConservationStage::new(batch, args.batch_size, concurrency)
        .run(&mut store)
        .await?;
    tracing::info!("... conservation stage done in {:?}", before_stage.elapsed());

    Ok(store)
}
