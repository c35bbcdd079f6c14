use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use jobmesh_events::{Event, InMemoryEventBus, job_id, job_topic};
use jobmesh_infra::{
    ConsumerRegistry, ConsumerWorker, FileIdentity, JobEventHandler, JobManagerConfig, JobResult,
};
use jobmesh_store::{MemoryRepository, Repository};

const ENV_ID_FILE: &str = "JOBMESH_ID_FILE";
const DEFAULT_ID_FILE: &str = "./jobmesh.id";
const ENV_REDIS_URL: &str = "REDIS_URL";
const REDIS_NAMESPACE: &str = "jobmesh";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    jobmesh_observability::init();

    let config = JobManagerConfig::from_env().context("invalid job manager configuration")?;
    let identity = FileIdentity::new(
        std::env::var(ENV_ID_FILE).unwrap_or_else(|_| DEFAULT_ID_FILE.to_string()),
    );

    start(config, identity).await
}

#[cfg(feature = "redis")]
async fn start(config: JobManagerConfig, identity: FileIdentity) -> anyhow::Result<()> {
    match std::env::var(ENV_REDIS_URL) {
        Ok(url) => {
            let repository = jobmesh_store::RedisRepository::new(&url, REDIS_NAMESPACE)
                .with_context(|| format!("cannot open redis store at {url}"))?;
            info!(namespace = REDIS_NAMESPACE, "using redis store");
            run(config, identity, repository).await
        }
        Err(_) => run(config, identity, MemoryRepository::new()).await,
    }
}

#[cfg(not(feature = "redis"))]
async fn start(config: JobManagerConfig, identity: FileIdentity) -> anyhow::Result<()> {
    if std::env::var(ENV_REDIS_URL).is_ok() {
        warn!("{ENV_REDIS_URL} is set but this build has no redis support; using the in-memory store");
    }
    run(config, identity, MemoryRepository::new()).await
}

async fn run<R: Repository>(
    config: JobManagerConfig,
    identity: FileIdentity,
    repository: R,
) -> anyhow::Result<()> {
    let bus = Arc::new(InMemoryEventBus::<Event>::new());

    let registry = ConsumerRegistry::new().with("*", |job: &Event| {
        info!(
            job_topic = job_topic(job).unwrap_or(job.topic()),
            job_id = job_id(job).unwrap_or_default(),
            "job received"
        );
        JobResult::Success
    });
    let consumer = ConsumerWorker::spawn("jobmesh-consumer", bus.clone(), registry)
        .context("cannot start consumer worker")?;

    let engine = JobEventHandler::activate(config, &identity, repository, bus)
        .context("cannot activate job engine")?;
    info!(process = %engine.process_id(), "node running; press Ctrl-C to stop");

    let signal = tokio::signal::ctrl_c().await;
    engine.shutdown();
    consumer.shutdown();
    if let Err(e) = signal {
        warn!(error = %e, "signal handler failed");
    }
    Ok(())
}
