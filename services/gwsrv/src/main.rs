//! gwsrv - Modbus TCP gateway polling service

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use common::logging::init_logging;
use common::ServiceArgs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gwsrv::{AppConfig, GatewayRegistry, GatewayService, LoggingSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServiceArgs::parse();

    // The file's logging section configures the subscriber; the load outcome
    // is reported once it is installed
    let loaded = AppConfig::load(&args.config);
    let log_config = match &loaded {
        Ok(config) => config.log_config(&args),
        Err(_) => AppConfig::default().log_config(&args),
    };
    init_logging(&log_config).context("Failed to initialise logging")?;

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration: {}", e);
            return Err(e).with_context(|| format!("Failed to load {}", args.config.display()));
        },
    };
    info!(
        "Loaded {} ({} gateways)",
        args.config.display(),
        config.gateways.len()
    );

    // Validation mode: build the registry, print a summary and exit
    if args.validate {
        let registry = GatewayRegistry::from_configs(config.gateways.clone())
            .context("Invalid gateway configuration")?;
        for gateway in registry.iter() {
            info!(
                "{} {} slaves={:?} groups={} interval={:?}",
                gateway.id,
                gateway.endpoint(),
                gateway.slave_ids,
                gateway.groups.len(),
                gateway.interval.unwrap_or(config.polling.interval())
            );
        }
        info!(
            "Configuration valid: {} gateways, {} slaves",
            registry.len(),
            registry.slave_count()
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let listener = common::spawn_shutdown_listener(cancel.clone());

    let service = GatewayService::start(&config, Arc::new(LoggingSink), cancel.clone())
        .context("Failed to start gateway service")?;

    service.cancelled().await;
    service.shutdown().await;
    listener.abort();
    Ok(())
}
