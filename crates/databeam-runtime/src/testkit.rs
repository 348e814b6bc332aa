//! Test doubles shared by the runtime unit tests.

use async_trait::async_trait;
use databeam_bus::{Bus, BusQueryable, BusSubscriber};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Records all bus traffic and answers queries from a scripted table.
pub struct MockBus {
    published: Mutex<Vec<(String, String)>>,
    queries: Mutex<Vec<(String, String, String)>>,
    replies: Mutex<HashMap<String, String>>,
    subscriptions: Mutex<Vec<String>>,
    queryables: Mutex<Vec<String>>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            queryables: Mutex::new(Vec::new()),
        })
    }

    /// Scripted reply for a query topic; unscripted topics time out (empty
    /// reply), like an unreachable peer.
    pub fn script_reply(&self, topic: &str, reply: &str) {
        self.replies
            .lock()
            .insert(topic.to_string(), reply.to_string());
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    pub fn queries(&self) -> Vec<(String, String, String)> {
        self.queries.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn queryables(&self) -> Vec<String> {
        self.queryables.lock().clone()
    }

    /// Poll until at least `count` publishes arrived or the deadline hits.
    pub async fn wait_published(&self, count: usize, timeout: Duration) -> Vec<(String, String)> {
        let deadline = Instant::now() + timeout;
        loop {
            let published = self.published();
            if published.len() >= count || Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until at least `count` queries were issued.
    pub async fn wait_queries(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<(String, String, String)> {
        let deadline = Instant::now() + timeout;
        loop {
            let queries = self.queries();
            if queries.len() >= count || Instant::now() >= deadline {
                return queries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn declare_queryable(&self, topic: &str, _handler: Arc<dyn BusQueryable>) {
        self.queryables.lock().push(topic.to_string());
    }

    async fn subscribe(&self, key: &str, _subscriber: Arc<dyn BusSubscriber>) {
        self.subscriptions.lock().push(key.to_string());
    }

    async fn unsubscribe(&self, key: &str, _subscriber: Arc<dyn BusSubscriber>) {
        let mut subs = self.subscriptions.lock();
        if let Some(pos) = subs.iter().position(|k| k == key) {
            subs.remove(pos);
        }
    }

    async fn publish(&self, key: &str, data: &str) {
        self.published
            .lock()
            .push((key.to_string(), data.to_string()));
    }

    async fn query(&self, identity: &str, topic: &str, data: &str, _timeout: Duration) -> String {
        self.queries
            .lock()
            .push((identity.to_string(), topic.to_string(), data.to_string()));
        self.replies.lock().get(topic).cloned().unwrap_or_default()
    }

    async fn set_external_databeams(&self, _db_ids: Vec<String>, _hostnames: Vec<String>) {}

    async fn shutdown(&self) {}
}
