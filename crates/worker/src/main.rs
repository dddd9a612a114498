use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use jobforge_core::JobRegistry;
use jobforge_infra::config::RunnerConfig;
use jobforge_infra::jobs::{
    InMemoryJobStore, JobRunner, JobRunnerHandle, JobStore, PostgresJobStore, TracingObserver,
};

mod cli;
mod jobs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    jobforge_observability::init(args.log_format);

    let config = match &args.config {
        Some(path) => RunnerConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RunnerConfig::default(),
    };
    let registry = Arc::new(jobs::registry());
    let demo = args.demo;

    // Store calls block on the runtime, so setup runs off the async workers.
    let handle = match &args.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url, args.max_connections)
                .await
                .context("failed to connect to Postgres")?;
            info!("using Postgres job store");
            tokio::task::spawn_blocking(move || start(store, registry, config, demo)).await??
        }
        None => {
            info!("DATABASE_URL not set; using in-memory job store");
            let store = InMemoryJobStore::arc();
            tokio::task::spawn_blocking(move || start(store, registry, config, demo)).await??
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    tokio::task::spawn_blocking(move || handle.shutdown()).await?;
    Ok(())
}

fn start<S>(
    store: S,
    registry: Arc<JobRegistry>,
    config: RunnerConfig,
    demo: bool,
) -> anyhow::Result<JobRunnerHandle>
where
    S: JobStore + 'static,
{
    if demo {
        store
            .enqueue(&jobs::EchoJob {
                message: "hello from jobforge".into(),
            })
            .context("failed to enqueue demo job")?;
        store
            .enqueue(&jobs::SleepJob { seconds: 2 })
            .context("failed to enqueue demo job")?;
    }

    let runner = JobRunner::new(store, registry, config)
        .context("invalid runner configuration")?
        .with_observer(Arc::new(TracingObserver));
    let handle = runner.spawn().context("failed to spawn job runner thread")?;
    handle.start();
    Ok(handle)
}
