//! Poll scheduler
//!
//! One poller task per gateway. Each poller owns the transaction table of its
//! connection, so request/response correlation never crosses tasks:
//!
//! ```text
//!   tick ──► per-slave queues ──► dispatch (1 in flight per slave) ──► link.send
//!                 ▲                                                      │
//!   submit() ─────┘                 inbound frames ◄─────────────────────┘
//!                                        │
//!                        match tid ──► ResultSink + HealthRegistry
//! ```

mod poller;
pub mod transaction;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ems_modbus::{Request, Response};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::GatewayLink;
use crate::error::{GwError, Result};
use crate::health::HealthRegistry;
use crate::registry::{GatewayId, GatewayRegistry};
use crate::sink::ResultSink;
use poller::Poller;

const SUBMIT_CAPACITY: usize = 32;

/// Timing shared by all pollers
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Default tick interval; gateways may override it
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// An on-demand request waiting for its slave
pub(crate) struct Submission {
    pub slave_id: u8,
    pub request: Request,
    pub reply: oneshot::Sender<Result<Response>>,
}

/// Submits on-demand requests (reads or writes) to running pollers
#[derive(Clone)]
pub struct SchedulerHandle {
    registry: Arc<GatewayRegistry>,
    submitters: Arc<HashMap<GatewayId, mpsc::Sender<Submission>>>,
}

impl SchedulerHandle {
    /// Run `request` against `slave_id` behind `gateway`
    ///
    /// Submitted requests go ahead of queued polls but still wait for the
    /// slave's in-flight request to finish.
    pub async fn submit(
        &self,
        gateway: GatewayId,
        slave_id: u8,
        request: Request,
    ) -> Result<Response> {
        request.validate()?;

        if !self.registry.contains_slave(gateway, slave_id) {
            return Err(GwError::config(format!(
                "Slave {} is not configured behind {}",
                slave_id, gateway
            )));
        }
        let submitter = self
            .submitters
            .get(&gateway)
            .ok_or_else(|| GwError::connection(format!("No poller for {}", gateway)))?;

        let (reply, response) = oneshot::channel();
        submitter
            .send(Submission {
                slave_id,
                request,
                reply,
            })
            .await
            .map_err(|_| GwError::connection(format!("{} poller stopped", gateway)))?;

        response
            .await
            .map_err(|_| GwError::connection(format!("{} poller stopped", gateway)))?
    }
}

/// Running pollers
pub struct Scheduler {
    handle: SchedulerHandle,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Spawn one poller per link; gateways without a link are not polled
    pub fn start(
        registry: Arc<GatewayRegistry>,
        links: Vec<GatewayLink>,
        settings: PollSettings,
        sink: Arc<dyn ResultSink>,
        health: HealthRegistry,
        cancel: CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let mut submitters = HashMap::with_capacity(links.len());
        let mut tasks = Vec::with_capacity(links.len());

        for link in links {
            let id = link.handle.gateway();
            let Some(gateway) = registry.get(id).cloned() else {
                warn!("No registry entry for {}, link ignored", id);
                continue;
            };

            let (tx, rx) = mpsc::channel(SUBMIT_CAPACITY);
            submitters.insert(id, tx);

            let poller = Poller::new(
                gateway,
                link,
                rx,
                &settings,
                sink.clone(),
                health.clone(),
                cancel.clone(),
            );
            tasks.push(tokio::spawn(poller.run()));
        }

        info!(
            "Scheduler started: {} pollers, interval {:?}, timeout {:?}",
            tasks.len(),
            settings.interval,
            settings.request_timeout
        );

        Self {
            handle: SchedulerHandle {
                registry,
                submitters: Arc::new(submitters),
            },
            tasks,
            cancel,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop all pollers; outstanding requests are abandoned
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Poller ended abnormally: {}", e);
            }
        }
    }
}
