use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};

use meridian_daemon::{
    chain::HttpChainGateway,
    config::Config,
    core::storage::SledStorage,
    node::Node,
    notify::LogNotifier,
    rpc,
};

fn setup_logging(level: &str) -> Result<()> {
    let level = match level {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };

    let colors = fern::colors::ColoredLevelConfig::new()
        .info(fern::colors::Color::Green)
        .warn(fern::colors::Color::Yellow)
        .error(fern::colors::Color::Red)
        .debug(fern::colors::Color::Blue);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        // dependency noise stays at warn
        .level_for("sled", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("actix_server", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()
        .context("initializing logger")?;
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let config = Config::parse();
    setup_logging(&config.log_level)?;

    if let Some(bind) = &config.prometheus_bind_address {
        let address: std::net::SocketAddr = bind.parse().context("invalid prometheus bind")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(address)
            .install()
            .context("installing prometheus exporter")?;
        info!("prometheus exporter on {}", bind);
    }

    let settings = config.build_settings()?;
    info!(
        "watching {} contract(s) from block {} with {} confirmations",
        settings.contracts.len(),
        settings.genesis_block,
        settings.confirmations
    );

    let storage = Arc::new(SledStorage::open(&config.storage_path)?);
    let gateway = Arc::new(HttpChainGateway::new(
        config.chain_rpc_url.clone(),
        config.chain_ws_url.clone(),
        config.key_service_url.clone(),
        settings.confirmations,
    ));

    let node = Node::new(storage, gateway, Arc::new(LogNotifier), settings);
    node.start().await?;

    let server = {
        let node = Arc::clone(&node);
        let bind = config.rpc_bind_address.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc::run_server(node, &bind).await {
                error!("command API server exited: {}", e);
            }
        })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    server.abort();
    node.stop().await;
    node.storage.flush().await?;
    info!("goodbye");
    Ok(())
}
