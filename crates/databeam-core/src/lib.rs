//! Core building blocks shared by every DataBeam crate.
//!
//! This crate deliberately contains no networking: it provides the wire
//! message taxonomy, data schemas, the config factory used to describe a
//! module's default configuration, the persisted live/capture policy, and
//! small time/env/file helpers.

pub mod cfg;
pub mod data_config;
pub mod env;
pub mod error;
pub mod fs;
pub mod logging;
pub mod messages;
pub mod schema;
pub mod time;

pub use data_config::DataConfigStore;
pub use env::EnvConfig;
pub use error::CoreError;
pub use schema::DataSchema;
pub use time::TimeSource;
