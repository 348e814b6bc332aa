//! In-process router stand-in for tests.
//!
//! Implements just enough of the deployment router contract to exercise
//! endpoints end to end: prefix-matched pub/sub fan-out and identity-routed
//! request/reply between the frontend and backend ports. Not part of the
//! shipped system; the real router is an external process.

use crate::endpoint::RouterConfig;
use crate::frame::{read_frame, write_frame, SUBSCRIBE_CTL, UNSUBSCRIBE_CTL};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Frame = Vec<Vec<u8>>;
type DealerRegistry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>>;

struct SubConn {
    keys: std::sync::Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<Frame>,
}

pub struct StubRouter {
    cfg: RouterConfig,
    token: CancellationToken,
}

impl StubRouter {
    pub async fn spawn() -> anyhow::Result<Self> {
        let frontend = TcpListener::bind("127.0.0.1:0").await?;
        let backend = TcpListener::bind("127.0.0.1:0").await?;
        let sub = TcpListener::bind("127.0.0.1:0").await?;
        let pub_ = TcpListener::bind("127.0.0.1:0").await?;

        let cfg = RouterConfig {
            hostname: "127.0.0.1".to_string(),
            frontend_port: frontend.local_addr()?.port(),
            backend_port: backend.local_addr()?.port(),
            sub_port: sub.local_addr()?.port(),
            pub_port: pub_.local_addr()?.port(),
        };

        let token = CancellationToken::new();
        let subs: Arc<Mutex<Vec<Arc<SubConn>>>> = Arc::new(Mutex::new(Vec::new()));
        let front_reg: DealerRegistry = Arc::new(Mutex::new(HashMap::new()));
        let back_reg: DealerRegistry = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(accept_sub(sub, subs.clone(), token.clone()));
        tokio::spawn(accept_pub(pub_, subs, token.clone()));
        tokio::spawn(accept_dealer(
            frontend,
            front_reg.clone(),
            back_reg.clone(),
            token.clone(),
        ));
        tokio::spawn(accept_dealer(backend, back_reg, front_reg, token.clone()));

        Ok(Self { cfg, token })
    }

    pub fn config(&self) -> RouterConfig {
        self.cfg.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for StubRouter {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn accept_sub(
    listener: TcpListener,
    subs: Arc<Mutex<Vec<Arc<SubConn>>>>,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => break,
            },
        };
        let (mut rx_half, mut tx_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let conn = Arc::new(SubConn {
            keys: std::sync::Mutex::new(HashSet::new()),
            tx,
        });
        subs.lock().await.push(conn.clone());

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let parts: Vec<&[u8]> = frame.iter().map(|p| p.as_slice()).collect();
                if write_frame(&mut tx_half, &parts).await.is_err() {
                    break;
                }
            }
        });

        let conn_token = token.clone();
        tokio::spawn(async move {
            loop {
                let parts = tokio::select! {
                    _ = conn_token.cancelled() => break,
                    read = read_frame(&mut rx_half) => match read {
                        Ok(parts) => parts,
                        Err(_) => break,
                    },
                };
                if parts.len() != 1 || parts[0].is_empty() {
                    continue;
                }
                let ctl = parts[0][0];
                let key = String::from_utf8_lossy(&parts[0][1..]).into_owned();
                let mut keys = conn.keys.lock().expect("poisoned");
                match ctl {
                    SUBSCRIBE_CTL => {
                        keys.insert(key);
                    }
                    UNSUBSCRIBE_CTL => {
                        keys.remove(&key);
                    }
                    _ => {}
                }
            }
        });
    }
}

async fn accept_pub(
    listener: TcpListener,
    subs: Arc<Mutex<Vec<Arc<SubConn>>>>,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => break,
            },
        };
        let subs = subs.clone();
        let conn_token = token.clone();
        tokio::spawn(async move {
            let (mut rx_half, _tx_half) = stream.into_split();
            loop {
                let parts = tokio::select! {
                    _ = conn_token.cancelled() => break,
                    read = read_frame(&mut rx_half) => match read {
                        Ok(parts) => parts,
                        Err(_) => break,
                    },
                };
                if parts.len() != 2 {
                    continue;
                }
                let key = String::from_utf8_lossy(&parts[0]).into_owned();
                for conn in subs.lock().await.iter() {
                    let matches = conn
                        .keys
                        .lock()
                        .expect("poisoned")
                        .iter()
                        .any(|sub| key.starts_with(sub.as_str()));
                    if matches {
                        let _ = conn.tx.send(parts.clone());
                    }
                }
            }
        });
    }
}

/// Shared by the frontend and backend ports: the first frame names the
/// connection, every later 4-part frame is routed to `peers[dest]` with the
/// sender identity substituted into part 0.
async fn accept_dealer(
    listener: TcpListener,
    own: DealerRegistry,
    peers: DealerRegistry,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => break,
            },
        };
        let own = own.clone();
        let peers = peers.clone();
        let conn_token = token.clone();
        tokio::spawn(async move {
            let (mut rx_half, mut tx_half) = stream.into_split();
            let Ok(hello) = read_frame(&mut rx_half).await else {
                return;
            };
            let Some(identity_part) = hello.first() else {
                return;
            };
            let identity = String::from_utf8_lossy(identity_part).into_owned();

            let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
            own.lock().await.insert(identity.clone(), tx);

            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let parts: Vec<&[u8]> = frame.iter().map(|p| p.as_slice()).collect();
                    if write_frame(&mut tx_half, &parts).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                let parts = tokio::select! {
                    _ = conn_token.cancelled() => break,
                    read = read_frame(&mut rx_half) => match read {
                        Ok(parts) => parts,
                        Err(_) => break,
                    },
                };
                if parts.len() != 4 {
                    continue;
                }
                let dest = String::from_utf8_lossy(&parts[0]).into_owned();
                let routed = vec![
                    identity.clone().into_bytes(),
                    parts[1].clone(),
                    parts[2].clone(),
                    parts[3].clone(),
                ];
                match peers.lock().await.get(&dest) {
                    Some(peer) => {
                        let _ = peer.send(routed);
                    }
                    None => debug!(%dest, "stub router: no peer for destination"),
                }
            }
            own.lock().await.remove(&identity);
        });
    }
}
