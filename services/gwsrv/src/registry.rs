//! Gateway registry
//!
//! Validated, read-only view of the configured gateways. Gateways keep
//! their configuration order; [`GatewayId`] is the position in that order.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ems_modbus::Request;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::error::{GwError, Result};

/// Index of a gateway in configuration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayId(pub usize);

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gw#{}", self.0)
    }
}

/// A register group resolved into its read request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollGroup {
    pub name: String,
    pub request: Request,
}

/// A validated gateway
#[derive(Debug, Clone)]
pub struct Gateway {
    pub id: GatewayId,
    pub ip: String,
    pub port: u16,
    /// In configuration order, no duplicates
    pub slave_ids: Vec<u8>,
    pub groups: Vec<PollGroup>,
    /// Per-gateway poll interval override
    pub interval: Option<Duration>,
}

impl Gateway {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn has_slave(&self, slave_id: u8) -> bool {
        self.slave_ids.contains(&slave_id)
    }

    fn from_config(id: GatewayId, config: GatewayConfig) -> Result<Self> {
        let endpoint = config.endpoint();

        if config.ip.trim().is_empty() {
            return Err(GwError::config(format!("Gateway #{}: empty ip", id.0)));
        }
        if config.port == 0 {
            return Err(GwError::config(format!("Gateway {}: port 0", endpoint)));
        }
        if config.slave_ids.is_empty() {
            return Err(GwError::config(format!(
                "Gateway {}: slave_ids is empty",
                endpoint
            )));
        }

        let mut seen = HashSet::with_capacity(config.slave_ids.len());
        for &slave in &config.slave_ids {
            if slave == 0 {
                return Err(GwError::config(format!(
                    "Gateway {}: slave id 0 is the broadcast address",
                    endpoint
                )));
            }
            if !seen.insert(slave) {
                return Err(GwError::config(format!(
                    "Gateway {}: duplicate slave id {}",
                    endpoint, slave
                )));
            }
        }

        let groups = config
            .register_groups
            .iter()
            .map(|group| {
                Ok(PollGroup {
                    name: group.name.clone(),
                    request: group.to_request().map_err(|e| {
                        GwError::config(format!("Gateway {}: {}", endpoint, e))
                    })?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            ip: config.ip,
            port: config.port,
            slave_ids: config.slave_ids,
            groups,
            interval: config.interval_ms.map(Duration::from_millis),
        })
    }
}

/// Read-only registry of configured gateways
#[derive(Debug, Clone)]
pub struct GatewayRegistry {
    gateways: Vec<Arc<Gateway>>,
    by_slave: BTreeMap<u8, Vec<GatewayId>>,
}

impl GatewayRegistry {
    /// Validate and index the configured gateways
    pub fn from_configs(configs: Vec<GatewayConfig>) -> Result<Self> {
        if configs.is_empty() {
            return Err(GwError::config("No gateways configured"));
        }

        let mut endpoints = HashSet::with_capacity(configs.len());
        let mut gateways = Vec::with_capacity(configs.len());
        let mut by_slave: BTreeMap<u8, Vec<GatewayId>> = BTreeMap::new();

        for (index, config) in configs.into_iter().enumerate() {
            let gateway = Gateway::from_config(GatewayId(index), config)?;

            if !endpoints.insert((gateway.ip.clone(), gateway.port)) {
                return Err(GwError::config(format!(
                    "Duplicate gateway {}",
                    gateway.endpoint()
                )));
            }

            for &slave in &gateway.slave_ids {
                by_slave.entry(slave).or_default().push(gateway.id);
            }
            debug!(
                "Registered {} {} slaves={:?} groups={}",
                gateway.id,
                gateway.endpoint(),
                gateway.slave_ids,
                gateway.groups.len()
            );
            gateways.push(Arc::new(gateway));
        }

        info!(
            "Gateway registry: {} gateways, {} distinct slave ids",
            gateways.len(),
            by_slave.len()
        );
        Ok(Self { gateways, by_slave })
    }

    pub fn get(&self, id: GatewayId) -> Option<&Arc<Gateway>> {
        self.gateways.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Gateway>> {
        self.gateways.iter()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    pub fn find_by_endpoint(&self, ip: &str, port: u16) -> Option<&Arc<Gateway>> {
        self.gateways.iter().find(|g| g.ip == ip && g.port == port)
    }

    /// Gateways that front `slave_id`, in configuration order
    pub fn gateways_for_slave(&self, slave_id: u8) -> &[GatewayId] {
        self.by_slave
            .get(&slave_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_slave(&self, id: GatewayId, slave_id: u8) -> bool {
        self.get(id).is_some_and(|g| g.has_slave(slave_id))
    }

    /// Total number of (gateway, slave) pairs
    pub fn slave_count(&self) -> usize {
        self.gateways.iter().map(|g| g.slave_ids.len()).sum()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::RegisterGroup;

    fn gw(ip: &str, port: u16, slaves: &[u8]) -> GatewayConfig {
        GatewayConfig::new(ip, port, slaves.to_vec())
    }

    fn config_error(result: Result<GatewayRegistry>) -> String {
        match result {
            Err(GwError::Config(msg)) => msg,
            other => panic!("expected config error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_lookup_by_slave_keeps_config_order() {
        let registry = GatewayRegistry::from_configs(vec![
            gw("10.0.0.1", 502, &[1, 2]),
            gw("10.0.0.2", 502, &[2, 3]),
            gw("10.0.0.1", 503, &[2]),
        ])
        .unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.slave_count(), 5);
        assert_eq!(
            registry.gateways_for_slave(2),
            &[GatewayId(0), GatewayId(1), GatewayId(2)]
        );
        assert_eq!(registry.gateways_for_slave(3), &[GatewayId(1)]);
        assert!(registry.gateways_for_slave(9).is_empty());

        assert!(registry.contains_slave(GatewayId(0), 1));
        assert!(!registry.contains_slave(GatewayId(1), 1));
        assert!(!registry.contains_slave(GatewayId(7), 1));

        let found = registry.find_by_endpoint("10.0.0.1", 503).unwrap();
        assert_eq!(found.id, GatewayId(2));
        assert!(registry.find_by_endpoint("10.0.0.9", 502).is_none());
    }

    #[test]
    fn test_rejects_duplicate_endpoint() {
        let msg = config_error(GatewayRegistry::from_configs(vec![
            gw("10.0.0.1", 502, &[1]),
            gw("10.0.0.1", 502, &[2]),
        ]));
        assert!(msg.contains("Duplicate gateway 10.0.0.1:502"));
    }

    #[test]
    fn test_rejects_bad_entries() {
        assert!(config_error(GatewayRegistry::from_configs(vec![])).contains("No gateways"));
        assert!(
            config_error(GatewayRegistry::from_configs(vec![gw("10.0.0.1", 502, &[])]))
                .contains("slave_ids is empty")
        );
        assert!(
            config_error(GatewayRegistry::from_configs(vec![gw("", 502, &[1])]))
                .contains("empty ip")
        );
        assert!(
            config_error(GatewayRegistry::from_configs(vec![gw("10.0.0.1", 0, &[1])]))
                .contains("port 0")
        );
        assert!(
            config_error(GatewayRegistry::from_configs(vec![gw("10.0.0.1", 502, &[0])]))
                .contains("broadcast")
        );
        assert!(config_error(GatewayRegistry::from_configs(vec![gw(
            "10.0.0.1",
            502,
            &[4, 5, 4]
        )]))
        .contains("duplicate slave id 4"));
    }

    #[test]
    fn test_resolves_register_groups() {
        let mut config = gw("10.0.0.1", 502, &[1]);
        config.register_groups = vec![RegisterGroup::new("status", 0x02, 10, 16)];
        config.interval_ms = Some(250);

        let registry = GatewayRegistry::from_configs(vec![config]).unwrap();
        let gateway = registry.get(GatewayId(0)).unwrap();
        assert_eq!(gateway.interval, Some(Duration::from_millis(250)));
        assert_eq!(
            gateway.groups,
            vec![PollGroup {
                name: "status".to_string(),
                request: Request::ReadDiscreteInputs {
                    address: 10,
                    quantity: 16
                },
            }]
        );

        let mut bad = gw("10.0.0.1", 502, &[1]);
        bad.register_groups = vec![RegisterGroup::new("wrap", 0x03, 0xFFFF, 2)];
        assert!(GatewayRegistry::from_configs(vec![bad]).is_err());
    }
}
