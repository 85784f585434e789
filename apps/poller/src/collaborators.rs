//! Boundaries to the rest of the server: the scheduler that hands out due
//! items, the value pipeline, and the availability subsystem.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::codec::CheckValue;
use crate::error::PollerError;
use crate::item::{HostId, ItemDescriptor, ItemId, PollerType, ValueType};
use crate::ledger::RequeueBatch;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Items whose next check time has come, leaving room for those in flight
    async fn pull_due_items(
        &self,
        poller_type: PollerType,
        timeout: Duration,
        in_flight: usize,
    ) -> Result<Vec<ItemDescriptor>, PollerError>;

    /// Report outcomes; returns the earliest next check time (seconds) across the batch
    async fn requeue(&self, batch: &RequeueBatch, poller_type: PollerType) -> Result<Option<i64>, PollerError>;

    /// Hand descriptors back once their checks are done
    async fn release_items(&self, items: Vec<ItemDescriptor>) -> Result<(), PollerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Normal,
    NotSupported,
}

/// One finished item as submitted to the value pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueRecord {
    pub item_id: ItemId,
    pub host_id: HostId,
    pub value_type: ValueType,
    pub flags: u8,
    pub value: Option<CheckValue>,
    pub ts: i64,
    pub state: ItemState,
    pub error: Option<String>,
}

#[async_trait]
pub trait ValuePipeline: Send + Sync {
    async fn submit_value(&self, record: ValueRecord) -> Result<(), PollerError>;

    /// Deliver everything submitted so far
    async fn flush(&self) -> Result<(), PollerError>;
}

#[async_trait]
pub trait AvailabilityChannel: Send + Sync {
    async fn send_availability_update(&self, payload: Vec<u8>) -> Result<(), PollerError>;
}

/// The collaborators a poller runs against
#[derive(Clone)]
pub struct Collaborators {
    pub scheduler: Arc<dyn Scheduler>,
    pub values: Arc<dyn ValuePipeline>,
    pub availability: Arc<dyn AvailabilityChannel>,
}
