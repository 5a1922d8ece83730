use clap::Parser;

use moderation_pipeline::catalog::FileCatalog;
use moderation_pipeline::config::Config;
use moderation_pipeline::executor::ExecutorConfig;
use moderation_pipeline::step::ImageClassificationStep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,moderation_pipeline=debug".into());
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        provider = ?config.provider,
        store_path = %config.store_path.display(),
        input = %config.input_table,
        output = %config.output_table,
        "Starting moderation pipeline"
    );

    let catalog = FileCatalog::open(&config.store_path).await?;
    let provider = config.provider_factory()?;

    let mut step = ImageClassificationStep::new(&config.input_table, &config.output_table, provider)
        .with_image_field(&config.image_field)
        .with_details_field(&config.details_field)
        .with_create_table(!config.no_create_table)
        .with_executor_config(ExecutorConfig::from(&config))
        .with_labels(config.parse_labels());
    if let Some(name) = &config.step_name {
        step = step.with_step_name(name);
    }

    let compute = step.build_compute(&catalog).await?;
    let stats = if config.full {
        compute.run_full(&catalog).await?
    } else {
        compute.run(&catalog).await?
    };

    tracing::info!(
        step = compute.name(),
        chunks = stats.chunks,
        processed = stats.processed,
        deleted = stats.deleted,
        "Pipeline run completed"
    );
    Ok(())
}
