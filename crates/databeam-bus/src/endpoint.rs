//! Single-peer transport endpoint.
//!
//! Four TCP connections to one deployment router: a subscription reader, a
//! publisher, an outgoing-request socket and an incoming-request socket.
//! The two request sockets identify themselves with the node address on
//! connect so the router can route by destination.
//!
//! Two background workers run per endpoint. Both poll their socket with a
//! short receive timeout; that timeout is the cancellation point.

use crate::frame::{
    part_str, read_frame, write_frame, SUBSCRIBE_CTL, UNSUBSCRIBE_CTL,
};
use crate::{BusQueryable, BusSubscriber};
use anyhow::Context;
use databeam_core::EnvConfig;
use parking_lot::Mutex as SyncMutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Receive poll interval of the worker loops.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

const UUID_LEN: usize = 8;
const UUID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Router connection parameters, usually taken from the environment.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub hostname: String,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub sub_port: u16,
    pub pub_port: u16,
}

impl RouterConfig {
    pub fn from_env(env: &EnvConfig) -> anyhow::Result<Self> {
        fn port(env: &EnvConfig, key: &str) -> anyhow::Result<u16> {
            let raw = env.get(key);
            raw.parse()
                .with_context(|| format!("invalid port in {key}: {raw:?}"))
        }
        Ok(Self {
            hostname: env.get("DB_ROUTER"),
            frontend_port: port(env, "DB_ROUTER_FRONTEND_PORT")?,
            backend_port: port(env, "DB_ROUTER_BACKEND_PORT")?,
            sub_port: port(env, "DB_ROUTER_SUB_PORT")?,
            pub_port: port(env, "DB_ROUTER_PUB_PORT")?,
        })
    }

    /// Same ports, different host. Used for external deployments.
    pub fn with_hostname(&self, hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            ..self.clone()
        }
    }
}

type SubscriberMap = HashMap<String, Vec<Arc<dyn BusSubscriber>>>;
type QueryableMap = HashMap<String, Arc<dyn BusQueryable>>;

pub struct Endpoint {
    node_name: String,
    subscribers: Mutex<SubscriberMap>,
    queryables: Mutex<QueryableMap>,
    publish_tx: Mutex<OwnedWriteHalf>,
    sub_ctl_tx: Mutex<OwnedWriteHalf>,
    query_stream: Mutex<TcpStream>,
    queryable_tx: Mutex<OwnedWriteHalf>,
    uuid_rng: SyncMutex<StdRng>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handler identity: the data pointer of the registered `Arc`. Two clones
/// of the same `Arc` compare equal, distinct allocations never do.
fn same_subscriber(a: &Arc<dyn BusSubscriber>, b: &Arc<dyn BusSubscriber>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Endpoint {
    /// Open the four router connections and start both workers.
    pub async fn connect(
        cfg: &RouterConfig,
        node_name: &str,
        token: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let host = cfg.hostname.as_str();
        debug!(node = node_name, host, "connecting endpoint");

        // The naming follows the local role: our publisher feeds the
        // router's subscriber port and vice versa.
        let sub_stream = TcpStream::connect((host, cfg.pub_port))
            .await
            .with_context(|| format!("subscribe connect to {host}:{}", cfg.pub_port))?;
        let pub_stream = TcpStream::connect((host, cfg.sub_port))
            .await
            .with_context(|| format!("publish connect to {host}:{}", cfg.sub_port))?;
        let mut query_stream = TcpStream::connect((host, cfg.frontend_port))
            .await
            .with_context(|| format!("query connect to {host}:{}", cfg.frontend_port))?;
        let mut queryable_stream = TcpStream::connect((host, cfg.backend_port))
            .await
            .with_context(|| format!("queryable connect to {host}:{}", cfg.backend_port))?;

        for s in [&sub_stream, &pub_stream, &query_stream, &queryable_stream] {
            s.set_nodelay(true)?;
        }

        // Identify the request sockets so replies and inbound queries can
        // be routed to this node.
        write_frame(&mut query_stream, &[node_name.as_bytes()]).await?;
        write_frame(&mut queryable_stream, &[node_name.as_bytes()]).await?;

        let (sub_rx, sub_ctl_tx) = sub_stream.into_split();
        let (queryable_rx, queryable_tx) = queryable_stream.into_split();
        let (_pub_rx, publish_tx) = pub_stream.into_split();

        let endpoint = Arc::new(Self {
            node_name: node_name.to_string(),
            subscribers: Mutex::new(HashMap::new()),
            queryables: Mutex::new(HashMap::new()),
            publish_tx: Mutex::new(publish_tx),
            sub_ctl_tx: Mutex::new(sub_ctl_tx),
            query_stream: Mutex::new(query_stream),
            queryable_tx: Mutex::new(queryable_tx),
            uuid_rng: SyncMutex::new(StdRng::seed_from_u64(0)),
            token,
            workers: Mutex::new(Vec::new()),
        });

        let sub_worker = tokio::spawn(Self::subscription_worker(endpoint.clone(), sub_rx));
        let query_worker = tokio::spawn(Self::queryable_worker(endpoint.clone(), queryable_rx));
        endpoint
            .workers
            .lock()
            .await
            .extend([sub_worker, query_worker]);

        Ok(endpoint)
    }

    /// Register a handler for a query topic. A topic can be declared only
    /// once per endpoint.
    pub async fn declare_queryable(&self, topic: &str, handler: Arc<dyn BusQueryable>) {
        let mut map = self.queryables.lock().await;
        if map.contains_key(topic) {
            error!(topic, "queryable already declared");
            return;
        }
        map.insert(topic.to_string(), handler);
    }

    /// Subscribe a handler to a key. The first subscriber of a key sends
    /// the subscription upstream; the same handler is never stored twice.
    pub async fn subscribe(&self, key: &str, subscriber: Arc<dyn BusSubscriber>) {
        let mut map = self.subscribers.lock().await;
        match map.get_mut(key) {
            Some(list) => {
                if !list.iter().any(|s| same_subscriber(s, &subscriber)) {
                    list.push(subscriber);
                }
            }
            None => {
                if let Err(e) = self.send_sub_control(SUBSCRIBE_CTL, key).await {
                    warn!(key, error = %e, "subscribe control failed");
                }
                map.insert(key.to_string(), vec![subscriber]);
            }
        }
    }

    /// Remove a handler; removing the last one drops the upstream
    /// subscription.
    pub async fn unsubscribe(&self, key: &str, subscriber: Arc<dyn BusSubscriber>) {
        let mut map = self.subscribers.lock().await;
        let mut found = false;
        if let Some(list) = map.get_mut(key) {
            if let Some(pos) = list.iter().position(|s| same_subscriber(s, &subscriber)) {
                list.swap_remove(pos);
                found = true;
            }
            if list.is_empty() {
                map.remove(key);
                if let Err(e) = self.send_sub_control(UNSUBSCRIBE_CTL, key).await {
                    warn!(key, error = %e, "unsubscribe control failed");
                }
            }
        }
        if !found {
            error!(key, "could not unsubscribe handler for key");
        }
    }

    /// Fire-and-forget publish; network errors are logged, not surfaced.
    pub async fn publish(&self, key: &str, data: &str) {
        let mut tx = self.publish_tx.lock().await;
        if let Err(e) = write_frame(&mut *tx, &[key.as_bytes(), data.as_bytes()]).await {
            warn!(key, error = %e, "publish failed");
        }
    }

    /// Send a query and wait for the reply carrying the same correlation
    /// id. Replies left over from earlier timed-out queries are discarded.
    /// Returns an empty string once the deadline elapses.
    pub async fn query(
        &self,
        identity: &str,
        topic: &str,
        data: &str,
        timeout_after: Duration,
    ) -> String {
        let uuid = self.generate_uuid();
        // One query in flight per endpoint; the stream lock serializes
        // callers.
        let mut stream = self.query_stream.lock().await;
        let deadline = Instant::now() + timeout_after;

        if let Err(e) = write_frame(
            &mut *stream,
            &[
                identity.as_bytes(),
                uuid.as_bytes(),
                topic.as_bytes(),
                data.as_bytes(),
            ],
        )
        .await
        {
            warn!(identity, topic, error = %e, "query send failed");
            return String::new();
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(identity, topic, "query timeout");
                return String::new();
            }
            match timeout(remaining, read_frame(&mut *stream)).await {
                Err(_) => {
                    debug!(identity, topic, "query timeout");
                    return String::new();
                }
                Ok(Err(e)) => {
                    warn!(identity, topic, error = %e, "query socket error");
                    return String::new();
                }
                Ok(Ok(parts)) => {
                    if parts.len() == 4 && parts[1] == uuid.as_bytes() {
                        return part_str(&parts[3]);
                    }
                    debug!(topic, "discarding stale query reply");
                }
            }
        }
    }

    /// Cancel the workers, drop the upstream subscriptions, join.
    pub async fn shutdown(&self) {
        debug!(node = %self.node_name, "endpoint shutdown");
        {
            let map = self.subscribers.lock().await;
            for key in map.keys() {
                if let Err(e) = self.send_sub_control(UNSUBSCRIBE_CTL, key).await {
                    debug!(%key, error = %e, "unsubscribe on shutdown failed");
                }
            }
        }
        self.token.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        debug!(node = %self.node_name, "endpoint shutdown done");
    }

    async fn send_sub_control(&self, ctl: u8, key: &str) -> std::io::Result<()> {
        let mut part = Vec::with_capacity(key.len() + 1);
        part.push(ctl);
        part.extend_from_slice(key.as_bytes());
        let mut tx = self.sub_ctl_tx.lock().await;
        write_frame(&mut *tx, &[&part]).await
    }

    fn generate_uuid(&self) -> String {
        let mut rng = self.uuid_rng.lock();
        (0..UUID_LEN)
            .map(|_| UUID_CHARS[rng.gen_range(0..UUID_CHARS.len())] as char)
            .collect()
    }

    async fn subscription_worker(endpoint: Arc<Endpoint>, mut rx: OwnedReadHalf) {
        debug!(node = %endpoint.node_name, "subscription worker started");
        loop {
            if endpoint.token.is_cancelled() {
                break;
            }
            let parts = match timeout(RECV_TIMEOUT, read_frame(&mut rx)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    if !endpoint.token.is_cancelled() {
                        warn!(node = %endpoint.node_name, error = %e, "subscription socket closed");
                    }
                    break;
                }
                Ok(Ok(parts)) => parts,
            };
            if parts.len() != 2 {
                debug!(parts = parts.len(), "malformed publication frame dropped");
                continue;
            }
            let key = part_str(&parts[0]);
            let payload = part_str(&parts[1]);

            let map = endpoint.subscribers.lock().await;
            if let Some(list) = map.get(&key) {
                for subscriber in list {
                    subscriber.notify_subscriber(&key, &payload).await;
                }
            }
        }
        debug!(node = %endpoint.node_name, "subscription worker shutdown");
    }

    async fn queryable_worker(endpoint: Arc<Endpoint>, mut rx: OwnedReadHalf) {
        debug!(node = %endpoint.node_name, "queryable worker started");
        loop {
            if endpoint.token.is_cancelled() {
                break;
            }
            let parts = match timeout(RECV_TIMEOUT, read_frame(&mut rx)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    if !endpoint.token.is_cancelled() {
                        warn!(node = %endpoint.node_name, error = %e, "queryable socket closed");
                    }
                    break;
                }
                Ok(Ok(parts)) => parts,
            };
            if parts.len() != 4 {
                debug!(parts = parts.len(), "malformed query frame dropped");
                continue;
            }
            let topic = part_str(&parts[2]);

            let map = endpoint.queryables.lock().await;
            let Some(handler) = map.get(&topic) else {
                debug!(%topic, "query for undeclared topic dropped");
                continue;
            };
            let reply = handler
                .notify_queryable(&topic, &part_str(&parts[3]))
                .await;
            drop(map);

            let mut tx = endpoint.queryable_tx.lock().await;
            if let Err(e) = write_frame(
                &mut *tx,
                &[
                    parts[0].as_slice(),
                    parts[1].as_slice(),
                    parts[2].as_slice(),
                    reply.as_bytes(),
                ],
            )
            .await
            {
                warn!(%topic, error = %e, "query reply send failed");
            }
        }
        debug!(node = %endpoint.node_name, "queryable worker shutdown");
    }
}
