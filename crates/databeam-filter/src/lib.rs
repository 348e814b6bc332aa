//! Streaming filter module.
//!
//! Subscribes to an upstream module's live stream, maintains a per-channel
//! ring of timestamped samples and republishes the filtered values through
//! its own data broker.

pub mod filters;
pub mod module;

pub use filters::{Filter, FilterMethod, Timebase};
pub use module::FilterModule;
