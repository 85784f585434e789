//! Collaborators for running a poller on its own, from the `[[items]]` of
//! the config file.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::availability::{AvailabilityInstruction, AvailabilityUpdate};
use crate::collaborators::{AvailabilityChannel, ItemState, Scheduler, ValuePipeline, ValueRecord};
use crate::config::StaticItem;
use crate::error::PollerError;
use crate::item::{Availability, ItemDescriptor, ItemId, ItemType, PollerType};
use crate::ledger::RequeueBatch;

struct ScheduledItem {
    item: ItemDescriptor,
    delay: i64,
    next_check: i64,
}

struct Schedule {
    entries: Vec<ScheduledItem>,
    in_flight: HashSet<ItemId>,
}

/// Serves a fixed set of items, each on its own delay
pub struct StaticScheduler {
    capacity: usize,
    schedule: Mutex<Schedule>,
}

impl StaticScheduler {
    /// All items are due at `now`; at most `capacity` are in flight at once
    pub fn new(items: Vec<StaticItem>, capacity: usize, now: i64) -> Self {
        let entries = items
            .into_iter()
            .map(|entry| ScheduledItem {
                item: entry.item,
                delay: entry.delay_seconds as i64,
                next_check: now,
            })
            .collect();

        Self { capacity, schedule: Mutex::new(Schedule { entries, in_flight: HashSet::new() }) }
    }

    /// Due items for a poller type at `now`, leaving room for those in flight
    pub fn due_items(&self, poller_type: PollerType, in_flight: usize, now: i64) -> Vec<ItemDescriptor> {
        let headroom = self.capacity.saturating_sub(in_flight);
        let mut schedule = self.schedule.lock();
        let Schedule { entries, in_flight: taken } = &mut *schedule;

        let due: Vec<ItemDescriptor> = entries
            .iter()
            .filter(|entry| serves(poller_type, entry.item.item_type()))
            .filter(|entry| entry.next_check <= now && !taken.contains(&entry.item.item_id))
            .take(headroom)
            .map(|entry| entry.item.clone())
            .collect();

        taken.extend(due.iter().map(|item| item.item_id));
        due
    }

    /// Reschedule finished items; returns the earliest next check among them
    pub fn reschedule(&self, batch: &RequeueBatch) -> Option<i64> {
        let mut schedule = self.schedule.lock();
        let Schedule { entries, in_flight } = &mut *schedule;
        let mut earliest: Option<i64> = None;

        for (item_id, clock) in batch.item_ids.iter().zip(&batch.last_clocks) {
            in_flight.remove(item_id);

            if let Some(entry) = entries.iter_mut().find(|entry| entry.item.item_id == *item_id) {
                entry.next_check = clock + entry.delay;
                earliest = Some(earliest.map_or(entry.next_check, |earliest| earliest.min(entry.next_check)));
            }
        }

        earliest
    }

    /// Fold availability instructions into the interface snapshots handed out
    /// with items
    pub fn apply(&self, instructions: &[AvailabilityInstruction]) {
        let mut schedule = self.schedule.lock();

        for instruction in instructions {
            let interfaces = schedule
                .entries
                .iter_mut()
                .map(|entry| &mut entry.item.interface)
                .filter(|interface| interface.id == instruction.interface_id());

            for interface in interfaces {
                match instruction {
                    AvailabilityInstruction::Activate { .. } => {
                        interface.available = Availability::Available;
                        interface.errors_from = 0;
                    }
                    AvailabilityInstruction::Deactivate { ts, unreachable_period, .. } => {
                        if interface.errors_from == 0 {
                            interface.errors_from = *ts;
                        }
                        if *ts - interface.errors_from >= *unreachable_period as i64 {
                            interface.available = Availability::Unavailable;
                        }
                    }
                }
            }
        }
    }
}

fn serves(poller_type: PollerType, item_type: ItemType) -> bool {
    matches!(
        (poller_type, item_type),
        (PollerType::Agent, ItemType::Agent) | (PollerType::HttpAgent, ItemType::HttpAgent)
    )
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl Scheduler for StaticScheduler {
    async fn pull_due_items(
        &self,
        poller_type: PollerType,
        _timeout: Duration,
        in_flight: usize,
    ) -> Result<Vec<ItemDescriptor>, PollerError> {
        Ok(self.due_items(poller_type, in_flight, unix_now()))
    }

    async fn requeue(&self, batch: &RequeueBatch, _poller_type: PollerType) -> Result<Option<i64>, PollerError> {
        Ok(self.reschedule(batch))
    }

    async fn release_items(&self, items: Vec<ItemDescriptor>) -> Result<(), PollerError> {
        debug!(items = items.len(), "released items");
        Ok(())
    }
}

/// Buffers values and writes them to the log on flush
#[derive(Default)]
pub struct LogValueSink {
    pending: Mutex<Vec<ValueRecord>>,
}

impl LogValueSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ValuePipeline for LogValueSink {
    async fn submit_value(&self, record: ValueRecord) -> Result<(), PollerError> {
        self.pending.lock().push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), PollerError> {
        let records = std::mem::take(&mut *self.pending.lock());

        for record in records {
            match (&record.state, &record.value) {
                (ItemState::Normal, Some(value)) => {
                    info!(item_id = record.item_id, host_id = record.host_id, ts = record.ts, %value, "value");
                }
                _ => warn!(
                    item_id = record.item_id,
                    host_id = record.host_id,
                    ts = record.ts,
                    error = record.error.as_deref().unwrap_or(""),
                    "item not supported"
                ),
            }
        }

        Ok(())
    }
}

/// Logs availability instructions and feeds them back to the scheduler's
/// interface snapshots
pub struct LogAvailabilitySink {
    scheduler: std::sync::Arc<StaticScheduler>,
}

impl LogAvailabilitySink {
    pub fn new(scheduler: std::sync::Arc<StaticScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl AvailabilityChannel for LogAvailabilitySink {
    async fn send_availability_update(&self, payload: Vec<u8>) -> Result<(), PollerError> {
        let update = AvailabilityUpdate::decode(&payload)?;

        for instruction in &update.instructions {
            match instruction {
                AvailabilityInstruction::Activate { interface_id, .. } => {
                    info!(interface_id, "interface available");
                }
                AvailabilityInstruction::Deactivate { interface_id, host, item_id, key_orig, error, .. } => {
                    warn!(interface_id, host = %host, item_id, key = %key_orig, error = %error, "interface unreachable");
                }
            }
        }

        self.scheduler.apply(&update.instructions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use crate::item::{AgentCheck, CheckKind, Host, Interface, TlsConnect, ValueType};

    fn static_item(item_id: ItemId, delay_seconds: u64) -> StaticItem {
        StaticItem {
            delay_seconds,
            item: ItemDescriptor {
                item_id,
                host: Host { id: 1, name: "db01".into(), tls: TlsConnect::Unencrypted },
                interface: Interface {
                    id: 1,
                    addr: "192.0.2.20".into(),
                    port: 10050,
                    available: Availability::Unknown,
                    errors_from: 0,
                },
                value_type: ValueType::Unsigned,
                flags: 0,
                key_orig: format!("key[{item_id}]"),
                check: CheckKind::Agent(AgentCheck { key: format!("key[{item_id}]") }),
            },
        }
    }

    #[test]
    fn items_in_flight_are_not_handed_out_twice() {
        let scheduler = StaticScheduler::new(vec![static_item(1, 30), static_item(2, 60)], 10, 1000);

        assert_eq!(scheduler.due_items(PollerType::Agent, 0, 1000).len(), 2);
        assert!(scheduler.due_items(PollerType::Agent, 2, 1000).is_empty());
        assert!(scheduler.due_items(PollerType::HttpAgent, 0, 1000).is_empty());

        let batch = RequeueBatch {
            item_ids: vec![2, 1],
            last_clocks: vec![1001, 1002],
            result_codes: vec![ResultCode::Success, ResultCode::Success],
        };
        assert_eq!(scheduler.reschedule(&batch), Some(1032));

        assert!(scheduler.due_items(PollerType::Agent, 0, 1031).is_empty());
        assert_eq!(scheduler.due_items(PollerType::Agent, 0, 1032).len(), 1);
    }

    #[test]
    fn headroom_limits_pulls() {
        let items = (1..=5).map(|id| static_item(id, 10)).collect();
        let scheduler = StaticScheduler::new(items, 3, 0);

        assert_eq!(scheduler.due_items(PollerType::Agent, 1, 0).len(), 2);
    }

    #[test]
    fn availability_updates_reach_snapshots() {
        let scheduler = StaticScheduler::new(vec![static_item(1, 30)], 10, 0);

        scheduler.apply(&[AvailabilityInstruction::Activate { interface_id: 1, ts: 5 }]);
        let item = scheduler.due_items(PollerType::Agent, 0, 0).remove(0);
        assert!(item.interface.is_settled_available());

        let deactivate = |ts| AvailabilityInstruction::Deactivate {
            interface_id: 1,
            ts,
            host: "db01".into(),
            item_id: 1,
            key_orig: "key[1]".into(),
            error: "timed out".into(),
            unavailable_delay: 60,
            unreachable_period: 45,
            unreachable_delay: 15,
        };

        scheduler.apply(&[deactivate(100)]);
        scheduler.apply(&[deactivate(145)]);
        let schedule = scheduler.schedule.lock();
        assert_eq!(schedule.entries[0].item.interface.errors_from, 100);
        assert_eq!(schedule.entries[0].item.interface.available, Availability::Unavailable);
    }
}
