use std::panic;
use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Args;
use crate::core::{
    pool::SandboxPool,
    protocol::{ExecutionProtocol, classifier::ImportClassifier},
    sandbox::PooledExecutor,
    traits::{executor::CodeExecutor, runtime::SandboxRuntime},
    workers::{execution::ExecutionHandler, grading::GradingHandler, run_worker},
};
use crate::docker::runtime::DockerCli;
use crate::memory::{queue::InMemoryQueue, store::InMemoryResultStore};

mod config;
mod constants;
mod core;
mod docker;
mod feeder;
mod memory;


#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let args = Args::parse();
    let sandbox = args.sandbox_config();
    let token = CancellationToken::new();

    let runtime: Arc<dyn SandboxRuntime> = Arc::new(DockerCli::new(&args.docker_path));
    let pool = Arc::new(SandboxPool::new(runtime.clone(), sandbox.clone()));
    if let Err(e) = pool.initialize().await {
        tracing::error!("Sandbox pool warm-up failed, containers will be created on demand: {}", e);
    }
    let maintenance = pool.spawn_maintenance(token.clone());

    let protocol = Arc::new(ExecutionProtocol::new(
        runtime,
        Arc::new(ImportClassifier::default()),
        sandbox,
    ));
    let executor: Arc<dyn CodeExecutor> = Arc::new(PooledExecutor::new(pool.clone(), protocol));

    let store = Arc::new(InMemoryResultStore::default());
    let execution_queue = Arc::new(InMemoryQueue::new(
        constants::EXECUTION_QUEUE,
        args.max_attempts,
    ));
    let grading_queue = Arc::new(InMemoryQueue::new(
        constants::GRADING_QUEUE,
        args.max_attempts,
    ));

    let feeder = feeder::feed_jobs(
        BufReader::new(tokio::io::stdin()),
        store.clone(),
        execution_queue.clone(),
        grading_queue.clone(),
        token.clone(),
    );
    let execution_worker = tokio::spawn(run_worker(
        args.execution_worker(),
        execution_queue.clone(),
        Arc::new(ExecutionHandler::new(executor.clone(), store.clone())),
        token.clone(),
    ));
    let grading_worker = tokio::spawn(run_worker(
        args.grading_worker(),
        grading_queue.clone(),
        Arc::new(GradingHandler::new(executor, store.clone())),
        token.clone(),
    ));

    let purger = {
        let store = store.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(constants::CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => { store.purge_expired(); }
                }
            }
        })
    };

    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    tracing::info!("Workers consuming jobs from stdin");
    let (execution, grading) = tokio::join!(execution_worker, grading_worker);
    execution?;
    grading?;

    token.cancel();
    let accepted = feeder.await?;
    maintenance.await?;
    purger.await?;
    pool.shutdown().await;

    for record in store.records() {
        println!("{}", serde_json::to_string(&record)?);
    }
    tracing::info!(
        accepted,
        executions = execution_queue.acked(),
        gradings = grading_queue.acked(),
        dropped = execution_queue.dropped() + grading_queue.dropped(),
        "Done"
    );

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
