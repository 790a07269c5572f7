//! Per-gateway connection worker

use std::time::Duration;

use bytes::Bytes;
use ems_modbus::MbapFramer;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reconnect::ReconnectHelper;
use super::{ConnectionSettings, ConnectionState};
use crate::error::{GwError, Result};
use crate::health::HealthRegistry;
use crate::registry::GatewayId;

/// Why a connected session ended
enum SessionEnd {
    Cancelled,
    /// Poller dropped its inbound receiver
    ConsumerGone,
    Failed(GwError),
}

pub(super) struct ConnectionWorker {
    pub gateway: GatewayId,
    pub endpoint: String,
    pub settings: ConnectionSettings,
    pub outbound: mpsc::Receiver<Bytes>,
    pub inbound: mpsc::Sender<Bytes>,
    pub state: watch::Sender<ConnectionState>,
    pub health: HealthRegistry,
    pub cancel: CancellationToken,
}

impl ConnectionWorker {
    pub async fn run(mut self) {
        let mut backoff = ReconnectHelper::new(self.settings.reconnect.clone());
        let mut ever_connected = false;

        loop {
            self.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect_tcp(&self.endpoint, self.settings.connect_timeout) => result,
            };

            match attempt {
                Ok(stream) => {
                    backoff.mark_connected();
                    if ever_connected {
                        self.health.record_reconnect(self.gateway);
                        info!("{} reconnected to {}", self.gateway, self.endpoint);
                    } else {
                        info!("{} connected to {}", self.gateway, self.endpoint);
                    }
                    ever_connected = true;

                    // Frames queued for an earlier session carry stale transaction ids
                    self.discard_outbound();
                    self.set_state(ConnectionState::Connected);

                    let end = self.serve(stream).await;
                    self.set_state(ConnectionState::Disconnected);
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::ConsumerGone => {
                            debug!("{} has no consumer, stopping worker", self.gateway);
                            break;
                        },
                        SessionEnd::Failed(e) => {
                            warn!("{} connection lost: {}", self.gateway, e);
                        },
                    }
                    self.discard_outbound();
                },
                Err(e) => {
                    backoff.mark_failed();
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        "{} connect to {} failed (attempt {}): {}",
                        self.gateway,
                        self.endpoint,
                        backoff.consecutive_failures() + 1,
                        e
                    );
                },
            }

            let delay = backoff.next_delay();
            debug!("{} retrying in {:?}", self.gateway, delay);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!(
            "{} worker stopped ({} connects, {} failed attempts)",
            self.gateway,
            backoff.stats().successful_connects,
            backoff.stats().failed_attempts
        );
    }

    /// Pump frames both ways until the socket fails or the worker is cancelled
    async fn serve(&mut self, stream: TcpStream) -> SessionEnd {
        let mut framed = Framed::new(stream, MbapFramer);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = framed.close().await;
                    return SessionEnd::Cancelled;
                },
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        if self.inbound.send(frame).await.is_err() {
                            return SessionEnd::ConsumerGone;
                        }
                    },
                    Some(Err(e)) => {
                        // Impossible MBAP length: the stream lost synchronisation
                        return SessionEnd::Failed(GwError::connection(format!(
                            "stream desynchronised: {}",
                            e
                        )));
                    },
                    None => {
                        return SessionEnd::Failed(GwError::connection("closed by peer"));
                    },
                },
                outgoing = self.outbound.recv() => match outgoing {
                    Some(frame) => {
                        if let Err(e) = framed.send(frame).await {
                            return SessionEnd::Failed(GwError::from(e));
                        }
                    },
                    None => return SessionEnd::ConsumerGone,
                },
            }
        }
    }

    fn discard_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("{} dropped {} stale outbound frames", self.gateway, dropped);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.health.set_state(self.gateway, state);
        }
    }
}

async fn connect_tcp(endpoint: &str, connect_timeout: Duration) -> Result<TcpStream> {
    debug!("TCP connecting: {}", endpoint);
    match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("TCP_NODELAY: {}", e);
            }
            Ok(stream)
        },
        Ok(Err(e)) => Err(GwError::connection(format!(
            "Failed to connect to {}: {}",
            endpoint, e
        ))),
        Err(_) => Err(GwError::connection(format!(
            "Connection to {} timed out after {:?}",
            endpoint, connect_timeout
        ))),
    }
}
