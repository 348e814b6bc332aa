//! Connection layer for DataBeam modules.
//!
//! All traffic flows through the deployment router process. A module holds
//! one [`Endpoint`] per remote deployment (four TCP sockets each) and a
//! [`BusRouter`] that multiplexes them by the leading DB_ID segment of the
//! key. Handlers are registered as trait objects; the transport borrows
//! them for the lifetime of the subscription.

pub mod endpoint;
pub mod frame;
pub mod router;
pub mod testing;

pub use endpoint::{Endpoint, RouterConfig};
pub use router::BusRouter;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default deadline for [`Bus::query`].
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives fire-and-forget publications for subscribed keys.
#[async_trait]
pub trait BusSubscriber: Send + Sync {
    async fn notify_subscriber(&self, key: &str, payload: &str);
}

/// Answers unary queries for a declared topic.
#[async_trait]
pub trait BusQueryable: Send + Sync {
    async fn notify_queryable(&self, topic: &str, payload: &str) -> String;
}

/// The connection manager contract the rest of the platform codes against.
///
/// Identity for `unsubscribe` is the subscriber object itself: the same
/// `Arc` that was passed to `subscribe`.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn declare_queryable(&self, topic: &str, handler: Arc<dyn BusQueryable>);
    async fn subscribe(&self, key: &str, subscriber: Arc<dyn BusSubscriber>);
    async fn unsubscribe(&self, key: &str, subscriber: Arc<dyn BusSubscriber>);
    async fn publish(&self, key: &str, data: &str);

    /// Query `topic` at the node addressed by `identity`. Returns the reply
    /// payload, or an empty string once `timeout` has elapsed.
    async fn query(&self, identity: &str, topic: &str, data: &str, timeout: Duration) -> String;

    /// Install the DB_ID → hostname table reported by the controller and
    /// eagerly open endpoints for every listed remote.
    async fn set_external_databeams(&self, db_ids: Vec<String>, hostnames: Vec<String>);

    async fn shutdown(&self);
}
