//! SlotDB node - hosts the storage engine of one node

mod config;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use slotdb_core::replica::{ChannelManager, LoopbackNetwork, ShardState};
use slotdb_core::storage::{Engine, LoggingConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn usage() -> ! {
    eprintln!("usage: slotdb [config.toml]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next().as_deref() {
        None => ServerConfig::parse("")?,
        Some("-h" | "--help") => usage(),
        Some(path) => ServerConfig::load(&PathBuf::from(path))?,
    };
    if args.next().is_some() {
        usage();
    }
    init_logging(&config.storage.logging);

    info!(
        version = slotdb_core::VERSION,
        node = config.node_id,
        dir = ?config.storage.tsdb.dir,
        wal = ?config.storage.wal.dir,
        "starting SlotDB node"
    );

    // a single node replicates to itself through the in-process network
    let network = LoopbackNetwork::new();
    let engine = Engine::open(config.storage.clone(), config.node_id, network.clone()).context("open storage engine")?;
    network.register(&engine);

    let cancel = CancellationToken::new();
    let channels = Arc::new(ChannelManager::new(
        config.storage.write.clone(),
        config.storage.tsdb.family_width_millis(),
        config.storage.tsdb.accept_window(),
        network.clone(),
        &cancel,
    ));
    for db in &config.databases {
        for shard_id in db.hosted_shards() {
            engine.get_or_create_shard(&db.name, shard_id)?;
            channels.create_channel(&db.name, db.num_shards, shard_id)?;
            channels.sync_shard_state(
                &db.name,
                ShardState {
                    id: shard_id,
                    leader: config.node_id,
                    replicas: vec![config.node_id],
                },
            )?;
        }
        info!(database = %db.name, shards = db.num_shards, "database ready");
    }

    let handles = tasks::spawn_all(&config, engine.clone(), channels.clone(), &cancel);
    info!("SlotDB node running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("shutting down");
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task failed");
        }
    }
    channels.close().await;
    network.unregister(config.node_id);
    let closing = engine.clone();
    tokio::task::spawn_blocking(move || closing.close())
        .await
        .context("join engine close")?
        .context("close storage engine")?;
    info!("SlotDB node stopped");
    Ok(())
}
