mod cli;

use anyhow::Context;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use trellis_core::runtime::load_records;
use trellis_core::{config, Pipeline};

fn main() {
    if let Err(error) = run() {
        eprintln!("trellis failed: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = cli::Cli::parse_args();
    trellis_core::logging::init_tracing(&args.log_level);

    let config = config::load(args.config.as_deref().map(Path::new))
        .context("failed to load configuration")?;
    config::validate_config(&config).context("invalid configuration")?;

    match args.command {
        cli::Command::Validate => {
            println!("Config is valid.");
            Ok(())
        }
        cli::Command::Rules => {
            let pipeline = Pipeline::from_config(config)?;
            for trigger in pipeline.triggers().iter() {
                if trigger.description().is_empty() {
                    println!("- {}", trigger.name());
                } else {
                    println!("- {}: {}", trigger.name(), trigger.description());
                }
            }
            Ok(())
        }
        cli::Command::Tasks => {
            let pipeline = Pipeline::from_config(config)?;
            for name in pipeline.tasks().names() {
                let task = pipeline.tasks().get(&name)?;
                println!("- {} ({})", task.name, task.image);
                if !task.description.is_empty() {
                    println!("  {}", task.description);
                }
            }
            Ok(())
        }
        cli::Command::Ingest { file } => {
            let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
            runtime.block_on(async {
                let mut pipeline = Pipeline::from_config(config)?;
                ingest_file(&pipeline, &file).await?;
                let stats = pipeline.run_until_idle().await;
                println!(
                    "delivered {} messages ({} failed, {} dropped)",
                    stats.delivered, stats.failed, stats.dropped
                );
                Ok::<(), anyhow::Error>(())
            })
        }
        cli::Command::Run { ingest } => {
            let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
            runtime.block_on(async {
                let mut pipeline = Pipeline::from_config(config)?;
                if let Some(file) = ingest {
                    ingest_file(&pipeline, &file).await?;
                }

                let shutdown = CancellationToken::new();
                let signal = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("interrupt received, shutting down");
                    }
                    signal.cancel();
                });
                pipeline.run(shutdown).await;
                Ok::<(), anyhow::Error>(())
            })
        }
    }
}

async fn ingest_file(pipeline: &Pipeline, file: &str) -> anyhow::Result<()> {
    let records = load_records(Path::new(file))?;
    for record in &records {
        pipeline.ingest(record).await?;
    }
    tracing::info!(file, records = records.len(), "records ingested");
    Ok(())
}
