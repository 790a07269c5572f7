//! Poll result delivery

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ems_modbus::{Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::GwError;
use crate::registry::GatewayId;

/// Outcome of one request, scheduled or submitted
#[derive(Debug, Clone)]
pub struct PollResult {
    pub gateway: GatewayId,
    pub slave_id: u8,
    /// Register group name; `None` for submitted requests
    pub group: Option<String>,
    pub request: Request,
    pub outcome: Result<Response, GwError>,
    pub issued_at: DateTime<Utc>,
    pub latency: Duration,
}

impl PollResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    fn label(&self) -> &str {
        self.group.as_deref().unwrap_or("on-demand")
    }
}

/// Consumer of poll results
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: PollResult);
}

/// Writes every result to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl ResultSink for LoggingSink {
    async fn deliver(&self, result: PollResult) {
        match &result.outcome {
            Ok(response) => match (response.registers(), response.bits()) {
                (Some(values), _) => info!(
                    "{} slave {} {} @{}: {:?} ({:?})",
                    result.gateway,
                    result.slave_id,
                    result.label(),
                    result.request.address(),
                    values,
                    result.latency
                ),
                (None, Some(bits)) => info!(
                    "{} slave {} {} @{}: {:?} ({:?})",
                    result.gateway,
                    result.slave_id,
                    result.label(),
                    result.request.address(),
                    bits.iter().map(|&b| u8::from(b)).collect::<Vec<_>>(),
                    result.latency
                ),
                (None, None) => info!(
                    "{} slave {} {} confirmed: {:?}",
                    result.gateway,
                    result.slave_id,
                    result.label(),
                    response
                ),
            },
            Err(GwError::Connection(e)) => debug!(
                "{} slave {} {}: {}",
                result.gateway,
                result.slave_id,
                result.label(),
                e
            ),
            Err(e) => warn!(
                "{} slave {} {} failed: {}",
                result.gateway,
                result.slave_id,
                result.label(),
                e
            ),
        }
    }
}

/// Forwards results into a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PollResult>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PollResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn deliver(&self, result: PollResult) {
        // Receiver gone means nobody is interested any more
        let _ = self.tx.send(result);
    }
}
