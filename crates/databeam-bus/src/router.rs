//! Multi-endpoint router.
//!
//! Holds one endpoint per known deployment and multiplexes by the first
//! `/`-separated segment of a key. The DB_ID → hostname table lives here
//! and nowhere else; it is filled from the controller's registry reply.
//! Queries and queryables always use the local endpoint; external
//! queryables are not supported.

use crate::endpoint::{Endpoint, RouterConfig};
use crate::{Bus, BusQueryable, BusSubscriber};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub struct BusRouter {
    node_name: String,
    cfg: RouterConfig,
    token: CancellationToken,
    /// Index 0 is always the local deployment.
    endpoints: Mutex<Vec<(String, Arc<Endpoint>)>>,
    hostnames: SyncMutex<HashMap<String, String>>,
}

impl BusRouter {
    /// Connect the local endpoint.
    pub async fn connect(
        cfg: RouterConfig,
        local_db_id: &str,
        node_name: &str,
        token: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        debug!(node = node_name, "creating connection layer");
        let local = Endpoint::connect(&cfg, node_name, token.child_token()).await?;
        Ok(Arc::new(Self {
            node_name: node_name.to_string(),
            cfg,
            token,
            endpoints: Mutex::new(vec![(local_db_id.to_string(), local)]),
            hostnames: SyncMutex::new(HashMap::new()),
        }))
    }

    fn extract_db_id(key: &str) -> &str {
        key.split('/').next().unwrap_or(key)
    }

    async fn local(&self) -> Arc<Endpoint> {
        self.endpoints.lock().await[0].1.clone()
    }

    /// Find the endpoint for a DB_ID, lazily opening one when `create` is
    /// set and the hostname is known.
    async fn endpoint_for(&self, db_id: &str, create: bool) -> Option<Arc<Endpoint>> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some((_, ep)) = endpoints.iter().find(|(id, _)| id == db_id) {
            return Some(ep.clone());
        }
        if !create {
            return None;
        }
        let Some(hostname) = self.hostnames.lock().get(db_id).cloned() else {
            error!(db_id, "no hostname known for external deployment");
            return None;
        };
        match Endpoint::connect(
            &self.cfg.with_hostname(&hostname),
            &self.node_name,
            self.token.child_token(),
        )
        .await
        {
            Ok(ep) => {
                debug!(db_id, %hostname, "opened endpoint for external deployment");
                endpoints.push((db_id.to_string(), ep.clone()));
                Some(ep)
            }
            Err(e) => {
                error!(db_id, %hostname, error = %e, "could not open external endpoint");
                None
            }
        }
    }
}

#[async_trait]
impl Bus for BusRouter {
    async fn declare_queryable(&self, topic: &str, handler: Arc<dyn BusQueryable>) {
        self.local().await.declare_queryable(topic, handler).await;
    }

    async fn subscribe(&self, key: &str, subscriber: Arc<dyn BusSubscriber>) {
        let db_id = Self::extract_db_id(key);
        match self.endpoint_for(db_id, true).await {
            Some(ep) => ep.subscribe(key, subscriber).await,
            None => error!(key, "subscribe dropped, deployment unknown"),
        }
    }

    async fn unsubscribe(&self, key: &str, subscriber: Arc<dyn BusSubscriber>) {
        let db_id = Self::extract_db_id(key);
        match self.endpoint_for(db_id, false).await {
            Some(ep) => ep.unsubscribe(key, subscriber).await,
            None => error!(key, "unsubscribe for unknown deployment"),
        }
    }

    async fn publish(&self, key: &str, data: &str) {
        let db_id = Self::extract_db_id(key);
        match self.endpoint_for(db_id, true).await {
            Some(ep) => ep.publish(key, data).await,
            None => error!(key, "publish dropped, deployment unknown"),
        }
    }

    async fn query(&self, identity: &str, topic: &str, data: &str, timeout: Duration) -> String {
        self.local().await.query(identity, topic, data, timeout).await
    }

    async fn set_external_databeams(&self, db_ids: Vec<String>, hostnames: Vec<String>) {
        {
            let mut table = self.hostnames.lock();
            table.clear();
            for (id, host) in db_ids.iter().zip(hostnames.iter()) {
                table.insert(id.clone(), host.clone());
            }
        }
        // Eagerly open an endpoint per listed remote so later subscribe
        // calls do not pay the connection latency.
        for id in &db_ids {
            let known = {
                let endpoints = self.endpoints.lock().await;
                endpoints.iter().any(|(known, _)| known == id)
            };
            if !known {
                let _ = self.endpoint_for(id, true).await;
            }
        }
    }

    async fn shutdown(&self) {
        debug!(node = %self.node_name, "connection layer shutdown");
        let mut endpoints = self.endpoints.lock().await;
        for (_, ep) in endpoints.iter() {
            ep.shutdown().await;
        }
        endpoints.clear();
        debug!(node = %self.node_name, "connection layer shutdown done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_id_extraction() {
        assert_eq!(BusRouter::extract_db_id("db01/m/imu/liveall"), "db01");
        assert_eq!(BusRouter::extract_db_id("db01"), "db01");
        assert_eq!(BusRouter::extract_db_id(""), "");
    }
}
