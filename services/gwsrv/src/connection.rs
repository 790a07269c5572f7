//! Connection manager
//!
//! One worker task per gateway owns that gateway's TCP socket. Everything
//! else talks to the socket through channels:
//!
//! ```text
//!            outbound (Bytes)               ┌──────────────┐
//! poller ──────────────────────────────────►│              │
//!        ◄──────────────────────────────────│   worker     │◄──► TcpStream
//!            inbound (MBAP frames)          │ (per gateway)│
//!        ◄─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ │              │
//!            state (watch)                  └──────────────┘
//! ```

pub mod reconnect;
mod worker;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GwError, Result};
use crate::health::HealthRegistry;
use crate::registry::{GatewayId, GatewayRegistry};
use reconnect::ReconnectPolicy;
use worker::ConnectionWorker;

/// Room for one frame per possible unit id. The poller keeps at most one
/// request per slave on the wire, so its sends never wait for the worker
/// while replies are pending.
const OUTBOUND_CAPACITY: usize = u8::MAX as usize + 1;
const INBOUND_CAPACITY: usize = u8::MAX as usize + 1;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Connection settings shared by all workers
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Sending side of one gateway connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    gateway: GatewayId,
    outbound: mpsc::Sender<Bytes>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn gateway(&self) -> GatewayId {
        self.gateway
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue one encoded frame for the socket
    ///
    /// Fails with a connection error unless the gateway is connected.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(GwError::not_connected());
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| GwError::connection(format!("{} worker stopped", self.gateway)))
    }

    /// Queue one encoded frame without waiting
    ///
    /// Returns `Ok(false)` and drops the frame when the queue is full.
    pub fn try_send(&self, frame: Bytes) -> Result<bool> {
        if !self.is_connected() {
            return Err(GwError::not_connected());
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GwError::connection(format!(
                "{} worker stopped",
                self.gateway
            ))),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Everything a consumer needs to drive one gateway connection
#[derive(Debug)]
pub struct GatewayLink {
    pub handle: ConnectionHandle,
    /// Complete MBAP frames, not yet validated
    pub inbound: mpsc::Receiver<Bytes>,
}

/// Owns the per-gateway connection workers
pub struct ConnectionManager {
    handles: HashMap<GatewayId, ConnectionHandle>,
    inbound: HashMap<GatewayId, mpsc::Receiver<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Spawn one worker per registered gateway
    ///
    /// Workers stop when `cancel` fires or [`ConnectionManager::shutdown`] is called.
    pub fn start(
        registry: &GatewayRegistry,
        settings: ConnectionSettings,
        health: HealthRegistry,
        cancel: CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let mut handles = HashMap::with_capacity(registry.len());
        let mut inbound = HashMap::with_capacity(registry.len());
        let mut tasks = Vec::with_capacity(registry.len());

        for gateway in registry.iter() {
            let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
            let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

            let worker = ConnectionWorker {
                gateway: gateway.id,
                endpoint: gateway.endpoint(),
                settings: settings.clone(),
                outbound: out_rx,
                inbound: in_tx,
                state: state_tx,
                health: health.clone(),
                cancel: cancel.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));

            handles.insert(
                gateway.id,
                ConnectionHandle {
                    gateway: gateway.id,
                    outbound: out_tx,
                    state: state_rx,
                },
            );
            inbound.insert(gateway.id, in_rx);
        }

        info!("Connection manager started: {} gateways", tasks.len());
        Self {
            handles,
            inbound,
            tasks,
            cancel,
        }
    }

    /// Send an encoded frame to a gateway
    pub async fn send(&self, gateway: GatewayId, frame: Bytes) -> Result<()> {
        match self.handles.get(&gateway) {
            Some(handle) => handle.send(frame).await,
            None => Err(GwError::connection(format!("Unknown gateway {}", gateway))),
        }
    }

    pub fn state(&self, gateway: GatewayId) -> Option<ConnectionState> {
        self.handles.get(&gateway).map(ConnectionHandle::state)
    }

    pub fn handle(&self, gateway: GatewayId) -> Option<ConnectionHandle> {
        self.handles.get(&gateway).cloned()
    }

    /// Take the inbound frame stream of a gateway; only one consumer may hold it
    pub fn take_inbound(&mut self, gateway: GatewayId) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound.remove(&gateway)
    }

    /// Handle plus inbound stream, for the gateway's poller
    pub fn take_link(&mut self, gateway: GatewayId) -> Option<GatewayLink> {
        let handle = self.handle(gateway)?;
        let inbound = self.take_inbound(gateway)?;
        Some(GatewayLink { handle, inbound })
    }

    /// Stop all workers and close their sockets
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Connection worker ended abnormally: {}", e);
            }
        }
        debug!("Connection manager stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_requires_connected_state() {
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let handle = ConnectionHandle {
            gateway: GatewayId(0),
            outbound: out_tx,
            state: state_rx,
        };

        let err = handle.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, GwError::Connection(_)));

        state_tx.send(ConnectionState::Connected).unwrap();
        handle.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn test_try_send_reports_full_queue() {
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let handle = ConnectionHandle {
            gateway: GatewayId(0),
            outbound: out_tx,
            state: state_rx,
        };

        assert!(handle.try_send(Bytes::from_static(b"a")).unwrap());
        assert!(!handle.try_send(Bytes::from_static(b"b")).unwrap());
        assert_eq!(out_rx.try_recv().unwrap(), Bytes::from_static(b"a"));

        drop(out_rx);
        assert!(matches!(
            handle.try_send(Bytes::from_static(b"c")),
            Err(GwError::Connection(_))
        ));
    }
}
