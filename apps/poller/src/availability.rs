//! Per-cycle interface health and the availability instructions derived from it.

use std::collections::HashMap;
use std::mem;

use serde::{Deserialize, Serialize};

use crate::error::{PollerError, ResultCode};
use crate::item::{Interface, InterfaceId, ItemId};

/// Delays carried by deactivation instructions, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub unavailable_delay: u64,
    pub unreachable_period: u64,
    pub unreachable_delay: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self { unavailable_delay: 60, unreachable_period: 45, unreachable_delay: 15 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    ConfirmAvailable,
    ConfirmUnavailable,
    NoOp,
}

pub fn classify(code: ResultCode) -> Classification {
    match code {
        ResultCode::Success | ResultCode::NotSupported | ResultCode::AgentError => Classification::ConfirmAvailable,
        ResultCode::NetworkError | ResultCode::GatewayError | ResultCode::TimeoutError => {
            Classification::ConfirmUnavailable
        }
        ResultCode::ConfigError | ResultCode::SignalInterrupted => Classification::NoOp,
    }
}

/// Last outcome observed for an interface in the current cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHealth {
    pub code: ResultCode,
    pub host: String,
    pub item_id: ItemId,
    pub key_orig: String,
    pub error: Option<String>,
}

/// Health records of the current cycle, at most one per interface
#[derive(Debug, Default)]
pub struct InterfaceHealthMap {
    records: HashMap<InterfaceId, InterfaceHealth>,
}

impl InterfaceHealthMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal outcome against its interface
    ///
    /// Successes on a settled interface are skipped unless an earlier
    /// observation this cycle already created a record, so the last
    /// observation always decides.
    pub fn observe(
        &mut self,
        interface: &Interface,
        host: &str,
        item_id: ItemId,
        key_orig: &str,
        code: ResultCode,
        error: Option<&str>,
    ) {
        if classify(code) == Classification::NoOp {
            return;
        }
        if code.is_success() && interface.is_settled_available() && !self.records.contains_key(&interface.id) {
            return;
        }

        self.records.insert(
            interface.id,
            InterfaceHealth {
                code,
                host: host.to_string(),
                item_id,
                key_orig: key_orig.to_string(),
                error: error.map(str::to_string),
            },
        );
    }

    pub fn get(&self, interface_id: InterfaceId) -> Option<&InterfaceHealth> {
        self.records.get(&interface_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Turn the cycle's records into instructions and start a fresh cycle
    pub fn flush(&mut self, now: i64, config: &AvailabilityConfig) -> Vec<AvailabilityInstruction> {
        let mut records: Vec<_> = mem::take(&mut self.records).into_iter().collect();
        records.sort_by_key(|(interface_id, _)| *interface_id);

        records
            .into_iter()
            .filter_map(|(interface_id, health)| match classify(health.code) {
                Classification::ConfirmAvailable => Some(AvailabilityInstruction::Activate { interface_id, ts: now }),
                Classification::ConfirmUnavailable => Some(AvailabilityInstruction::Deactivate {
                    interface_id,
                    ts: now,
                    host: health.host,
                    item_id: health.item_id,
                    key_orig: health.key_orig,
                    error: health.error.unwrap_or_default(),
                    unavailable_delay: config.unavailable_delay,
                    unreachable_period: config.unreachable_period,
                    unreachable_delay: config.unreachable_delay,
                }),
                Classification::NoOp => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum AvailabilityInstruction {
    Activate {
        interface_id: InterfaceId,
        ts: i64,
    },
    Deactivate {
        interface_id: InterfaceId,
        ts: i64,
        host: String,
        item_id: ItemId,
        key_orig: String,
        error: String,
        unavailable_delay: u64,
        unreachable_period: u64,
        unreachable_delay: u64,
    },
}

impl AvailabilityInstruction {
    pub fn interface_id(&self) -> InterfaceId {
        match self {
            AvailabilityInstruction::Activate { interface_id, .. }
            | AvailabilityInstruction::Deactivate { interface_id, .. } => *interface_id,
        }
    }
}

/// One coalesced payload per cycle for the availability subsystem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityUpdate {
    pub instructions: Vec<AvailabilityInstruction>,
}

impl AvailabilityUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, PollerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PollerError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Availability;

    fn interface(id: InterfaceId, available: Availability, errors_from: i64) -> Interface {
        Interface { id, addr: "192.0.2.1".into(), port: 10050, available, errors_from }
    }

    #[test]
    fn classification() {
        assert_eq!(classify(ResultCode::Success), Classification::ConfirmAvailable);
        assert_eq!(classify(ResultCode::NotSupported), Classification::ConfirmAvailable);
        assert_eq!(classify(ResultCode::TimeoutError), Classification::ConfirmUnavailable);
        assert_eq!(classify(ResultCode::GatewayError), Classification::ConfirmUnavailable);
        assert_eq!(classify(ResultCode::ConfigError), Classification::NoOp);
        assert_eq!(classify(ResultCode::SignalInterrupted), Classification::NoOp);
    }

    #[test]
    fn success_on_settled_interface_is_not_recorded() {
        let mut map = InterfaceHealthMap::new();
        map.observe(&interface(1, Availability::Available, 0), "db01", 10, "agent.ping", ResultCode::Success, None);
        assert!(map.is_empty());

        map.observe(&interface(2, Availability::Unavailable, 1_700_000_000), "db01", 11, "agent.ping", ResultCode::Success, None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn last_observation_decides() {
        let iface = interface(7, Availability::Available, 0);
        let mut map = InterfaceHealthMap::new();

        map.observe(&iface, "db01", 1, "net.if.in[eth0]", ResultCode::NetworkError, Some("refused"));
        map.observe(&iface, "db01", 2, "agent.ping", ResultCode::Success, None);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(7).unwrap().item_id, 2);

        let instructions = map.flush(100, &AvailabilityConfig::default());
        assert_eq!(instructions, vec![AvailabilityInstruction::Activate { interface_id: 7, ts: 100 }]);
        assert!(map.is_empty());
    }

    #[test]
    fn deactivation_carries_key_error_and_delays() {
        let mut map = InterfaceHealthMap::new();
        map.observe(&interface(3, Availability::Available, 0), "db02", 9, "system.cpu.load", ResultCode::TimeoutError, Some("timed out"));

        let config = AvailabilityConfig { unavailable_delay: 30, unreachable_period: 20, unreachable_delay: 10 };
        let instructions = map.flush(50, &config);

        assert_eq!(
            instructions,
            vec![AvailabilityInstruction::Deactivate {
                interface_id: 3,
                ts: 50,
                host: "db02".into(),
                item_id: 9,
                key_orig: "system.cpu.load".into(),
                error: "timed out".into(),
                unavailable_delay: 30,
                unreachable_period: 20,
                unreachable_delay: 10,
            }]
        );
    }

    #[test]
    fn no_op_codes_and_empty_flush_emit_nothing() {
        let mut map = InterfaceHealthMap::new();
        assert!(map.flush(1, &AvailabilityConfig::default()).is_empty());

        let iface = interface(4, Availability::Unknown, 0);
        map.observe(&iface, "db01", 1, "k", ResultCode::ConfigError, Some("bad tls"));
        map.observe(&iface, "db01", 2, "k", ResultCode::SignalInterrupted, None);
        assert!(map.is_empty());
        assert!(map.flush(1, &AvailabilityConfig::default()).is_empty());
    }

    #[test]
    fn update_payload_round_trips() {
        let update = AvailabilityUpdate {
            instructions: vec![AvailabilityInstruction::Activate { interface_id: 1, ts: 5 }],
        };
        let payload = update.encode().unwrap();
        assert!(String::from_utf8_lossy(&payload).contains("\"action\":\"activate\""));
        assert_eq!(AvailabilityUpdate::decode(&payload).unwrap(), update);
    }
}
