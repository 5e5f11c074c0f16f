use std::sync::Arc;

use payrail_core::SystemClock;
use payrail_infra::external::{FakeGateway, RecordingSibling};
use payrail_infra::kinds::register_all;
use payrail_infra::tasks::{Dispatcher, TaskProtocol};
use payrail_infra::{Datastore, InMemoryDatastore, PayrailConfig, PostgresDatastore};

#[tokio::main]
async fn main() {
    payrail_observability::init();

    let config = match PayrailConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    match config.database_url.clone() {
        Some(url) => match PostgresDatastore::connect(&url).await {
            Ok(datastore) => run(datastore, &config).await,
            Err(e) => {
                tracing::error!(error = %e, "failed to connect to database");
                std::process::exit(1);
            }
        },
        None => run(InMemoryDatastore::new(), &config).await,
    }
}

async fn run<D>(datastore: D, config: &PayrailConfig)
where
    D: Datastore + 'static,
{
    tracing::warn!("no gateway transport configured; using in-process gateway and sibling");

    let protocol = TaskProtocol::new(datastore, config.backoff, Arc::new(SystemClock));
    let mut dispatcher = Dispatcher::new(protocol);
    register_all(
        &mut dispatcher,
        Arc::new(FakeGateway::new()),
        Arc::new(RecordingSibling::new()),
    );

    let handle = dispatcher.spawn(config.dispatcher().with_name("payrail-worker"));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    let stats = handle.shutdown().await;
    tracing::info!(
        claimed = stats.claimed,
        committed = stats.committed,
        stale = stats.stale,
        failed = stats.failed,
        expired = stats.expired,
        "worker stopped"
    );
}
