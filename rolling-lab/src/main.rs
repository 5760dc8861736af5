use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use rolling_core::domain::RunRecord;
use rolling_storage::postgres::{self, PostgresConfig};
use rolling_storage::{RunRepository, TaskRepository};
use rolling_workflow::{
    model_and_test_key, CollectArtifacts, RollingGen, RollingPipeline, TaskQueue, TrainingExecutor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod executors;

use executors::{CommandExecutor, ProvenanceExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::load()?;

    // Initialize tracing
    let default_filter = format!(
        "rolling_lab={level},rolling_workflow={level},rolling_storage={level}",
        level = config.log_level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(config.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    tracing::info!("Starting rolling lab for namespace {}", config.namespace);

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!("Metrics exporter listening on {}", addr);
    }
    rolling_workflow::metrics::register_metric_descriptions();

    // Initialize database pool
    let pg_config = PostgresConfig::new(config.database_url.clone()).with_max_connections(config.max_connections);
    let db_pool = postgres::create_pool_with_config(&pg_config).await?;
    postgres::migrate(&db_pool).await?;
    postgres::health_check(&db_pool).await?;
    tracing::info!("Database pool initialized");

    let (executor, artifact): (Arc<dyn TrainingExecutor>, String) =
        match CommandExecutor::new(&config.executor_command) {
            Some(executor) => (Arc::new(executor), config.collect_artifact.clone()),
            None => {
                tracing::warn!("No executor command configured, runs will only record provenance");
                (Arc::new(ProvenanceExecutor), "provenance".to_string())
            }
        };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, returning claimed tasks");
            shutdown.cancel();
        }
    });

    let queue = TaskQueue::new(Arc::new(TaskRepository::new(db_pool.clone())), config.pool.clone());
    let store = Arc::new(RunRepository::new(db_pool));
    let generator = RollingGen::new(config.step_days, config.roll_type).with_trunc_days(config.trunc_days);

    let pipeline = RollingPipeline::new(queue, store, executor, config.namespace.clone())
        .with_tasks(config.templates()?)
        .with_generator(generator)
        .with_trainer_config(config.trainer.clone())
        .with_workers(config.workers)
        .with_cancellation(cancel);

    let model = config.collect_model.clone();
    let keep = move |record: &RunRecord| -> rolling_core::Result<bool> {
        Ok(model
            .as_deref()
            .map_or(true, |class| record.task.model_class() == Some(class)))
    };

    let collection = pipeline
        .run_all(model_and_test_key, keep, &CollectArtifacts::new(artifact))
        .await?;

    for (key, runs) in &collection.groups {
        println!(
            "{}",
            serde_json::to_string(&serde_json::json!({"group": key.parts(), "runs": runs}))?
        );
    }
    for warning in &collection.report.warnings {
        tracing::warn!("{}", warning.message);
    }
    tracing::info!(
        "Done: {} groups from {} runs",
        collection.report.groups,
        collection.report.aggregated
    );

    Ok(())
}
