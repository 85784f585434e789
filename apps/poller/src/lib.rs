//! Asynchronous polling engine for agent and HTTP agent checks.
//!
//! A [`Poller`] pulls due items from a [`Scheduler`], runs each check as a
//! future on a single reactor, and at the end of every cycle hands values,
//! availability changes and requeue instructions to its collaborators.

pub mod agent;
pub mod availability;
pub mod codec;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod http;
pub mod item;
pub mod ledger;
pub mod poller;
pub mod standalone;
pub mod task;

pub use collaborators::{AvailabilityChannel, Collaborators, Scheduler, ValuePipeline};
pub use error::{CheckError, CheckStage, PollerError, ResultCode};
pub use poller::{Poller, Shutdown};
