//! Binary entry point: parse configuration, wire up the KV queue, the
//! deletion controller, storage state, and the dispatcher, then serve.
//!
//! Shaped like the teacher's `bin/pageserver.rs`: parse CLI, initialize
//! logging, build configuration, construct subsystems bottom-up, run.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use zeroize::Zeroizing;

use lbsd::config::Cli;
use lbsd::deletion::DeletionController;
use lbsd::dispatch::Dispatcher;
use lbsd::kv::{DynamoKv, KvQueue};
use lbsd::logging;
use lbsd::storage::StorageState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.into_config().context("loading configuration")?;

    logging::init(config.json_logs);
    info!(
        listen_addr = %config.listen_addr,
        table = %config.table,
        region = %config.region,
        opps = config.opps,
        "starting lbsd"
    );

    let backend = DynamoKv::from_config_with_credentials(
        config.region.clone(),
        config.endpoint_url.clone(),
        config.table.clone(),
        config.access_key_id.clone(),
        config.secret_access_key.clone().map(Zeroizing::new),
    )
    .await;
    let kv = KvQueue::spawn(Arc::new(backend), config.opps);

    let deletion = DeletionController::spawn(kv.clone()).await;
    let storage = Arc::new(
        StorageState::load(kv, deletion, config.blocklen)
            .await
            .context("recovering storage state from the KV backend")?,
    );

    let dispatcher = Arc::new(Dispatcher::new(storage, config.nreaders));
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(listen_addr = %config.listen_addr, "listening");

    dispatcher.run(listener).await
}
