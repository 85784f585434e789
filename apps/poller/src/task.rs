use futures::future::BoxFuture;

use crate::codec::CheckValue;
use crate::error::CheckError;
use crate::http::HttpCompletion;
use crate::item::{HostId, Interface, ItemDescriptor, ItemId, ItemType, ValueType};

/// Identity of an in-flight check, carried from dispatch to completion
#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    pub item_id: ItemId,
    pub host_id: HostId,
    pub host_name: String,
    pub item_type: ItemType,
    pub value_type: ValueType,
    pub flags: u8,
    pub interface: Interface,
    pub key_orig: String,
}

impl From<&ItemDescriptor> for TaskItem {
    fn from(item: &ItemDescriptor) -> Self {
        Self {
            item_id: item.item_id,
            host_id: item.host.id,
            host_name: item.host.name.clone(),
            item_type: item.item_type(),
            value_type: item.value_type,
            flags: item.flags,
            interface: item.interface.clone(),
            key_orig: item.key_orig.clone(),
        }
    }
}

/// What a finished task future yields back to the reactor
pub enum Completion {
    Agent { task: TaskItem, result: Result<CheckValue, CheckError> },
    Http(HttpCompletion),
}

pub type TaskFuture = BoxFuture<'static, Completion>;
