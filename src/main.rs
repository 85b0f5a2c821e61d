//! CacheGopher node entry point.
//!
//! Loads a JSON config, resolves this node's own entry by `--server-id`,
//! starts the replication dispatcher when this node is a primary,
//! optionally recovers from a peer first, then serves the wire protocol
//! until interrupted.

use std::panic;
use std::sync::Arc;

use anyhow::{bail, Context};
use cachegopher::config::{Configuration, ServerRole};
use cachegopher::node::Server;
use cachegopher::replication::{Replicator, SecondarySpec};
use cachegopher::store;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cachegopher", version, about = "Distributed in-memory key-value cache")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "cachegopher.json")]
    config: std::path::PathBuf,

    /// This node's id, as listed in the config's `servers` array.
    #[arg(long)]
    server_id: String,

    /// Recover from a peer before accepting client traffic.
    #[arg(long, default_value_t = false)]
    recover: bool,
}

fn main() -> anyhow::Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("cachegopher fatal error:");
        eprintln!("{panic_info}");
        if let Some(location) = panic_info.location() {
            eprintln!("location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    let cli = Cli::parse();
    let config = Configuration::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    init_logging(&config);

    log::info!("cachegopher v{} starting as '{}'", cachegopher::VERSION, cli.server_id);

    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    let result = runtime.block_on(run(cli, config));

    match &result {
        Ok(()) => log::info!("cachegopher shutdown complete"),
        Err(err) => log::error!("cachegopher exited with error: {err}"),
    }
    result
}

fn init_logging(config: &Configuration) {
    let level = config.logging.level.parse().unwrap_or(log::LevelFilter::Info);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Some(path) = &config.logging.file {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }
    builder.init();
}

async fn run(cli: Cli, config: Configuration) -> anyhow::Result<()> {
    let own = config
        .server(&cli.server_id)
        .with_context(|| format!("server id '{}' not in config", cli.server_id))?
        .clone();

    let store = store::new_store(&config.common.eviction_policy, config.common.max_size)
        .context("constructing eviction store")?;

    let replicator = match own.role {
        ServerRole::Primary => {
            let secondaries = config.secondaries_of(&own.id)?;
            let specs = secondaries
                .into_iter()
                .map(|s| SecondarySpec {
                    id: s.id.clone(),
                    addr: s.address.clone(),
                })
                .collect();
            Some(Replicator::spawn(specs, config.client_conf.keep_alive_interval()))
        }
        ServerRole::Secondary => None,
    };

    if cli.recover {
        let peer_addr = match &own.primary {
            Some(primary_id) => config.server(primary_id)?.address.clone(),
            None => bail!("--recover requires a 'primary' entry for secondary '{}'", own.id),
        };
        log::info!("recovering from '{peer_addr}' before accepting traffic");
        cachegopher::recovery::recover_from_peer(&peer_addr, &own.id, &store)
            .await
            .context("recovery failed")?;
    }

    let server = Arc::new(Server::new(store, replicator));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("ctrl-c received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    server.serve(&own.address, shutdown_rx).await?;
    Ok(())
}
