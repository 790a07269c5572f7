//! Shared helpers for gwsrv integration tests
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

pub mod simulator;

use std::net::SocketAddr;
use std::time::Duration;

use gwsrv::{AppConfig, ConnectionState, GatewayConfig, GatewayId, GatewayService, PollResult};
use tokio::sync::mpsc::UnboundedReceiver;

/// Gateway entry pointing at a local simulator
pub fn gateway_config(addr: SocketAddr, slaves: Vec<u8>) -> GatewayConfig {
    GatewayConfig::new(addr.ip().to_string(), addr.port(), slaves)
}

/// Short intervals so tests finish quickly
pub fn fast_config(gateways: Vec<GatewayConfig>) -> AppConfig {
    let mut config = AppConfig {
        gateways,
        ..Default::default()
    };
    config.polling.interval_ms = 50;
    config.polling.request_timeout_ms = 200;
    config.polling.connect_timeout_ms = 500;
    config.reconnect.initial_delay_ms = 50;
    config.reconnect.max_delay_ms = 200;
    config.health.report_interval_secs = 0;
    config
}

/// Next result satisfying `pred`, panicking after `within`
pub async fn next_matching(
    rx: &mut UnboundedReceiver<PollResult>,
    within: Duration,
    mut pred: impl FnMut(&PollResult) -> bool,
) -> PollResult {
    tokio::time::timeout(within, async {
        loop {
            let result = rx.recv().await.expect("sink closed");
            if pred(&result) {
                return result;
            }
        }
    })
    .await
    .expect("no matching poll result in time")
}

/// Wait until the gateway reports Connected
pub async fn wait_connected(service: &GatewayService, id: GatewayId) {
    let mut state = service.connections().handle(id).unwrap().subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("gateway did not connect")
    .unwrap();
}

/// Poll `check` every 10ms until it holds, panicking after `within`
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(within, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
