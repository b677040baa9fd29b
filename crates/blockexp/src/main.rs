mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{eyre, WrapErr};

use blockexp_core::chain::build_accessor;
use blockexp_core::error::RpcError;
use blockexp_core::{CoreError, Database, SyncService};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let config = config::Config::load(&args.config)?;
    let mut store_settings = config.store_settings();
    if let Some(dir) = args.data_dir {
        store_settings.data_dir = Some(dir);
    }
    let mut sync_settings = config.sync_settings();
    if let Some(secs) = args.poll_interval_secs {
        sync_settings.poll_interval = Duration::from_secs(secs);
    }

    let targets = config.targets();
    if targets.is_empty() {
        return Err(eyre!(
            "no enabled chains in {}; add a [chains.<CHAIN>] table",
            args.config.display()
        ));
    }

    let database = Database::open(store_settings).context("open ledger store")?;
    match database.data_dir() {
        Some(dir) => tracing::info!(path = %dir.display(), "ledger snapshots enabled"),
        None => tracing::warn!("no data_dir configured; the ledger is kept in memory only"),
    }

    let mut service = SyncService::new();
    for target in &targets {
        let accessor = build_accessor(target, config.rpc.requests_per_second)
            .wrap_err_with(|| format!("configure {}:{}", target.chain, target.network))?;
        database
            .connect()
            .await?
            .ledger(&target.chain, &target.network)
            .await?
            .create_indexes()
            .await
            .wrap_err_with(|| format!("create indexes for {}:{}", target.chain, target.network))?;
        service.start(Arc::new(accessor), database.clone(), sync_settings.clone())?;
    }
    tracing::info!(
        targets = service.len(),
        poll_interval_secs = sync_settings.poll_interval.as_secs(),
        "indexer running"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for ctrl-c")?;
            tracing::info!("shutdown requested");
        }
        _ = service.finished() => {
            tracing::warn!("every synchronizer has stopped");
        }
    }

    let mut failed = 0;
    for ((chain, network), result) in service.shutdown().await {
        match result {
            Ok(()) | Err(CoreError::Cancelled) => {}
            Err(err) => {
                failed += 1;
                let hint = failure_hint(&err).map(|h| format!("\nhint: {h}")).unwrap_or_default();
                tracing::error!(%chain, %network, "synchronizer ended with an error: {err}{hint}");
            }
        }
    }
    database.close();

    if failed > 0 {
        return Err(eyre!("{failed} synchronizer(s) failed"));
    }
    Ok(())
}

/// Operator guidance for failures that usually mean a misconfigured daemon.
fn failure_hint(err: &CoreError) -> Option<&'static str> {
    match err {
        CoreError::Rpc(RpcError::Unauthorized) => {
            Some("authentication failed; check the user:pass embedded in the chain URL")
        }
        CoreError::Rpc(RpcError::ConnectionFailed { .. }) => {
            Some("the daemon is unreachable; verify the chain URL and that the node is running")
        }
        CoreError::Rpc(RpcError::InvalidResponse(_)) => {
            Some("the endpoint did not answer JSON-RPC; verify the URL points at the daemon's RPC port")
        }
        CoreError::Rpc(RpcError::Server { code: -5, .. }) => {
            Some("the node could not find a transaction; run it with -txindex=1")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_cover_connection_problems_only() {
        assert!(failure_hint(&CoreError::Rpc(RpcError::Unauthorized)).is_some());
        assert!(failure_hint(&CoreError::Rpc(RpcError::Server {
            code: -5,
            message: "No such mempool or blockchain transaction".into(),
        }))
        .is_some());
        assert!(failure_hint(&CoreError::Cancelled).is_none());
        assert!(failure_hint(&CoreError::InvalidData("bad".into())).is_none());
    }
}
