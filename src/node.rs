//! Module that wires a node together: listener, registry, coordinator and the
//! background loops.

use crate::{
    config::NodeConfig,
    coordinator::MutexCoordinator,
    error::Result,
    log,
    net::TcpConnector,
    peer::{PeerRegistry, Reachability},
    rpc::{Connector, RpcFacade},
    server::Listener,
};
use color_print::cformat;
use std::sync::Arc;
use tokio::{task::JoinHandle, time::Instant};

pub struct Node {
    coordinator: Arc<MutexCoordinator>,
    facade: Arc<RpcFacade>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Function that starts a node on TCP.
    ///
    /// The listen address is bound before any peer is dialed; if binding fails
    /// the node never starts.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let listener = Listener::bind(&config.listen_address).await?;
        let connector = Arc::new(TcpConnector::new(config.connect_timeout()));

        let mut node = Self::detached(&config, connector);

        let facade = Arc::clone(&node.facade);
        node.tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(facade).await {
                log::error(&cformat!("<red>Listener stopped</red>: {e}."));
            }
        }));

        Ok(node)
    }

    /// Function that starts a node without a listener.
    ///
    /// Inbound messages have to be handed to [`Node::facade`] by whoever owns
    /// the transport.
    pub fn detached(config: &NodeConfig, connector: Arc<dyn Connector>) -> Self {
        let registry = Arc::new(PeerRegistry::configure(
            &config.listen_address,
            config.peer_addresses(),
            connector,
            config.registry_settings(),
        ));
        let coordinator = Arc::new(MutexCoordinator::new(
            config.listen_address.clone(),
            Arc::clone(&registry),
            config.call_timeout(),
        ));
        let facade = Arc::new(RpcFacade::new(Arc::clone(&coordinator)));

        // subscribe before the first dial so no Up is missed
        let events = registry.subscribe();
        let watcher = tokio::spawn(Arc::clone(&coordinator).watch_peers(events));

        registry.start();
        let health = tokio::spawn(Arc::clone(&registry).health_loop());

        Self {
            coordinator,
            facade,
            tasks: vec![watcher, health],
        }
    }

    pub fn coordinator(&self) -> &Arc<MutexCoordinator> {
        &self.coordinator
    }

    pub fn facade(&self) -> Arc<RpcFacade> {
        Arc::clone(&self.facade)
    }

    /// Function that waits until at least `min_live` peers are reachable.
    ///
    /// Waits forever if they never show up, logging progress once per health
    /// interval.
    pub async fn wait_for_peers(&self, min_live: usize) -> Reachability {
        let registry = self.coordinator.registry();
        let settings = registry.settings();
        let mut last_report = Instant::now();

        loop {
            let reachability = registry.reachability().await;
            if reachability.live >= min_live {
                log::info(&cformat!(
                    "<green>{}/{}</green> peers reachable, ready.",
                    reachability.live,
                    reachability.total
                ));
                return reachability;
            }

            if last_report.elapsed() >= settings.health_interval {
                log::info(&cformat!(
                    "Waiting for peers: <bold>{}/{}</bold> reachable.",
                    reachability.live,
                    reachability.total
                ));
                last_report = Instant::now();
            }

            tokio::time::sleep(settings.connect_backoff.min(settings.health_interval)).await;
        }
    }

    /// Function that stops the listener, the peer watcher and the health loop.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
