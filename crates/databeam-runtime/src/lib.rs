//! Module runtime for the DataBeam platform.
//!
//! A module implements [`IoModule`] and hands itself to a [`ModuleHost`],
//! which owns the transport, the [`DataBroker`], the persisted data-config
//! and the [`JobManager`], answers the controller's queries and drives the
//! sampling/capture state machine.

pub mod broker;
pub mod jobs;
pub mod module;

#[cfg(test)]
pub(crate) mod testkit;

pub use broker::DataBroker;
pub use jobs::{Job, JobManager};
pub use module::{IoModule, ModuleContext, ModuleHost};
