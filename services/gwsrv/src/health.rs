//! Per-gateway and per-slave health counters
//!
//! Written by connection workers and pollers, read by the periodic report.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ems_modbus::Response;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ConnectionState;
use crate::error::GwError;
use crate::registry::{GatewayId, GatewayRegistry};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveHealth {
    /// Completed requests, any outcome
    pub requests: u64,
    pub successes: u64,
    pub exceptions: u64,
    pub timeouts: u64,
    pub protocol_errors: u64,
    pub connection_errors: u64,
    /// Poll ticks skipped because the previous poll was still queued or in flight
    pub skipped_polls: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayHealth {
    pub state: ConnectionState,
    pub reconnects: u64,
    /// Responses whose transaction id matched nothing in flight
    pub unmatched_responses: u64,
    /// Frames that failed MBAP validation or did not fit their request
    pub rejected_frames: u64,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Shared health registry, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    slaves: Arc<DashMap<(GatewayId, u8), SlaveHealth>>,
    gateways: Arc<DashMap<GatewayId, GatewayHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed request
    pub fn record_outcome(
        &self,
        gateway: GatewayId,
        slave_id: u8,
        outcome: &Result<Response, GwError>,
    ) {
        let mut entry = self.slaves.entry((gateway, slave_id)).or_default();
        entry.requests += 1;
        match outcome {
            Ok(_) => {
                entry.successes += 1;
                entry.last_success = Some(Utc::now());
            },
            Err(e) => {
                match e {
                    GwError::Timeout(_) => entry.timeouts += 1,
                    GwError::Connection(_) => entry.connection_errors += 1,
                    GwError::Protocol(p) if p.exception_code().is_some() => {
                        entry.exceptions += 1
                    },
                    GwError::Protocol(_) | GwError::Config(_) => entry.protocol_errors += 1,
                }
                entry.last_error = Some(e.to_string());
                entry.last_error_at = Some(Utc::now());
            },
        }
    }

    pub fn record_skipped(&self, gateway: GatewayId, slave_id: u8) {
        self.slaves
            .entry((gateway, slave_id))
            .or_default()
            .skipped_polls += 1;
    }

    pub fn set_state(&self, gateway: GatewayId, state: ConnectionState) {
        let mut entry = self.gateways.entry(gateway).or_default();
        entry.state = state;
        entry.connected_since = match state {
            ConnectionState::Connected => Some(Utc::now()),
            _ => None,
        };
    }

    pub fn record_reconnect(&self, gateway: GatewayId) {
        self.gateways.entry(gateway).or_default().reconnects += 1;
    }

    pub fn record_unmatched(&self, gateway: GatewayId) {
        self.gateways.entry(gateway).or_default().unmatched_responses += 1;
    }

    pub fn record_rejected_frame(&self, gateway: GatewayId) {
        self.gateways.entry(gateway).or_default().rejected_frames += 1;
    }

    pub fn slave(&self, gateway: GatewayId, slave_id: u8) -> Option<SlaveHealth> {
        self.slaves.get(&(gateway, slave_id)).map(|e| e.value().clone())
    }

    pub fn gateway(&self, gateway: GatewayId) -> Option<GatewayHealth> {
        self.gateways.get(&gateway).map(|e| e.value().clone())
    }

    /// Log one line per gateway and per slave
    pub fn report(&self, registry: &GatewayRegistry) {
        for gateway in registry.iter() {
            let gw = self.gateway(gateway.id).unwrap_or_default();
            info!(
                "Health {} {}: state={} reconnects={} unmatched={} rejected={}",
                gateway.id,
                gateway.endpoint(),
                gw.state,
                gw.reconnects,
                gw.unmatched_responses,
                gw.rejected_frames
            );

            for &slave in &gateway.slave_ids {
                let Some(h) = self.slave(gateway.id, slave) else {
                    continue;
                };
                let line = format!(
                    "  slave {}: req={} ok={} exc={} timeout={} proto={} conn={} skipped={}",
                    slave,
                    h.requests,
                    h.successes,
                    h.exceptions,
                    h.timeouts,
                    h.protocol_errors,
                    h.connection_errors,
                    h.skipped_polls
                );
                if h.requests > 0 && h.successes == 0 {
                    warn!("{} (no successful poll)", line);
                } else {
                    info!("{}", line);
                }
            }
        }
    }
}

/// Periodically log the health report until cancelled
pub fn spawn_reporter(
    health: HealthRegistry,
    registry: Arc<GatewayRegistry>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick completes immediately; nothing to report yet
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => health.report(&registry),
            }
        }
    })
}
