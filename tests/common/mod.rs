//! Shared helpers for the integration tests.
//!
//! [`MemoryNetwork`] stands in for TCP: a call is delivered by invoking the
//! target's facade directly. Peers can be taken down (calls and dials fail)
//! until brought up again, or silenced (calls never complete, so only the
//! per-call timeout ends them).

#![allow(dead_code)]

use async_trait::async_trait;
use ra_mutex::{
    rpc::{Connector, PeerChannel, RpcFacade},
    Error, Message, MutexCoordinator, Node, NodeConfig, Phase, Result,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

pub const PATIENCE: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct MemoryNetwork {
    facades: Mutex<HashMap<String, Arc<RpcFacade>>>,
    down: Mutex<HashSet<String>>,
    silent: Mutex<HashSet<String>>,
    held: Mutex<HashSet<String>>,
    delivered: Mutex<Vec<(String, String, Message)>>,
}

impl MemoryNetwork {
    pub fn register(&self, address: &str, facade: Arc<RpcFacade>) {
        self.facades
            .lock()
            .unwrap()
            .insert(address.to_string(), facade);
    }

    pub fn take_down(&self, address: &str) {
        self.down.lock().unwrap().insert(address.to_string());
    }

    pub fn bring_up(&self, address: &str) {
        self.down.lock().unwrap().remove(address);
    }

    pub fn silence(&self, address: &str) {
        self.silent.lock().unwrap().insert(address.to_string());
    }

    /// Function that delays every call to `address` until [`MemoryNetwork::release`].
    ///
    /// Keep holds shorter than the call timeout or the calls fail.
    pub fn hold(&self, address: &str) {
        self.held.lock().unwrap().insert(address.to_string());
    }

    pub fn release(&self, address: &str) {
        self.held.lock().unwrap().remove(address);
    }

    /// Number of `Reply` messages delivered from `from` to `to`.
    pub fn replies(&self, from: &str, to: &str) -> usize {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, t, message)| {
                f == from && t == to && matches!(message, Message::Reply { .. })
            })
            .count()
    }

    fn is_down(&self, address: &str) -> bool {
        self.down.lock().unwrap().contains(address)
    }

    fn is_held(&self, address: &str) -> bool {
        self.held.lock().unwrap().contains(address)
    }

    fn is_silent(&self, address: &str) -> bool {
        self.silent.lock().unwrap().contains(address)
    }

    fn facade(&self, address: &str) -> Option<Arc<RpcFacade>> {
        self.facades.lock().unwrap().get(address).cloned()
    }
}

pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
    from: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerChannel>> {
        if self.network.is_down(address) || self.network.facade(address).is_none() {
            return Err(Error::Connect {
                address: address.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }

        Ok(Arc::new(MemoryChannel {
            network: Arc::clone(&self.network),
            from: self.from.clone(),
            to: address.to_string(),
        }))
    }
}

struct MemoryChannel {
    network: Arc<MemoryNetwork>,
    from: String,
    to: String,
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    async fn call(&self, message: &Message) -> Result<()> {
        if self.network.is_down(&self.to) {
            return Err(Error::Closed {
                address: self.to.clone(),
            });
        }
        if self.network.is_silent(&self.to) {
            std::future::pending::<()>().await;
        }
        while self.network.is_held(&self.to) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let facade = self.network.facade(&self.to).ok_or_else(|| Error::Closed {
            address: self.to.clone(),
        })?;

        self.network
            .delivered
            .lock()
            .unwrap()
            .push((self.from.clone(), self.to.clone(), message.clone()));

        match facade.handle(message.clone()).await? {
            Message::Ack => Ok(()),
            _ => Err(Error::UnexpectedResponse {
                address: self.to.clone(),
            }),
        }
    }
}

pub fn config(address: &str, group: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::new(address, group.iter().map(|a| a.to_string()).collect());
    config.call_timeout_ms = 200;
    config.connect_timeout_ms = 100;
    config.connect_backoff_ms = 10;
    config.health_interval_ms = 50;
    config
}

pub struct Cluster {
    pub network: Arc<MemoryNetwork>,
    pub nodes: BTreeMap<String, Node>,
}

impl Cluster {
    /// Function that starts `running` nodes of a group whose members are
    /// `group`, and waits until they all see each other.
    pub async fn start(group: &[&str], running: &[&str]) -> Self {
        let network = Arc::new(MemoryNetwork::default());
        let mut nodes = BTreeMap::new();

        for address in running {
            let connector = Arc::new(MemoryConnector {
                network: Arc::clone(&network),
                from: address.to_string(),
            });
            let node = Node::detached(&config(address, group), connector);
            network.register(address, node.facade());
            nodes.insert(address.to_string(), node);
        }

        for node in nodes.values() {
            within(node.wait_for_peers(running.len() - 1)).await;
        }

        Self { network, nodes }
    }

    pub async fn full(group: &[&str]) -> Self {
        Self::start(group, group).await
    }

    pub fn coordinator(&self, address: &str) -> Arc<MutexCoordinator> {
        Arc::clone(self.nodes[address].coordinator())
    }
}

/// Function that fails the test instead of hanging it.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(PATIENCE, future)
        .await
        .expect("operation did not finish in time")
}

pub async fn wait_for_phase(coordinator: &MutexCoordinator, phase: Phase) {
    within(async {
        while coordinator.phase().await != phase {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
}

pub async fn wait_for_deferred(coordinator: &MutexCoordinator, peer: &str) {
    within(async {
        while !coordinator.deferred_peers().await.iter().any(|p| p == peer) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
}

/// Function that waits until `coordinator` sees its link to `peer` as live, or
/// as not live when `live` is false.
pub async fn wait_for_link(coordinator: &MutexCoordinator, peer: &str, live: bool) {
    within(async {
        while coordinator
            .registry()
            .state(peer)
            .await
            .is_some_and(|state| state.is_live())
            != live
        {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
}
