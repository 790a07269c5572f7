//! Service wiring: registry, connections, pollers and health reporting

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::error::Result;
use crate::health::{self, HealthRegistry};
use crate::registry::GatewayRegistry;
use crate::scheduler::{PollSettings, Scheduler, SchedulerHandle};
use crate::sink::ResultSink;

impl AppConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: self.polling.connect_timeout(),
            reconnect: self.reconnect.to_policy(),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.polling.interval(),
            request_timeout: self.polling.request_timeout(),
        }
    }
}

/// A running gateway service
pub struct GatewayService {
    registry: Arc<GatewayRegistry>,
    health: HealthRegistry,
    connections: ConnectionManager,
    scheduler: Scheduler,
    reporter: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl GatewayService {
    /// Validate the gateway list and start all tasks
    ///
    /// Must be called inside a tokio runtime. Everything stops when `cancel`
    /// fires or [`GatewayService::shutdown`] is called.
    pub fn start(
        config: &AppConfig,
        sink: Arc<dyn ResultSink>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(GatewayRegistry::from_configs(config.gateways.clone())?);
        let health = HealthRegistry::new();
        let cancel = cancel.child_token();

        let mut connections = ConnectionManager::start(
            &registry,
            config.connection_settings(),
            health.clone(),
            cancel.clone(),
        );
        let links = registry
            .iter()
            .filter_map(|gateway| connections.take_link(gateway.id))
            .collect();

        let scheduler = Scheduler::start(
            registry.clone(),
            links,
            config.poll_settings(),
            sink,
            health.clone(),
            cancel.clone(),
        );

        let reporter = config.health.report_interval().map(|period| {
            health::spawn_reporter(health.clone(), registry.clone(), period, cancel.clone())
        });

        info!(
            "Gateway service running: {} gateways, {} slaves",
            registry.len(),
            registry.slave_count()
        );

        Ok(Self {
            registry,
            health,
            connections,
            scheduler,
            reporter,
            cancel,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Resolves once the service has been cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Stop pollers first, then close connections
    pub async fn shutdown(self) {
        info!("Shutting down gateway service");
        self.cancel.cancel();
        self.scheduler.shutdown().await;
        self.connections.shutdown().await;
        if let Some(reporter) = self.reporter {
            if let Err(e) = reporter.await {
                warn!("Health reporter ended abnormally: {}", e);
            }
        }
        self.health.report(&self.registry);
        info!("Gateway service stopped");
    }
}
