//! Module with the registry of configured peers and their reachability.

use crate::{
    log,
    message::Message,
    rpc::{call_with_timeout, Connector, PeerChannel},
};
use color_print::cformat;
use futures::future::join_all;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{broadcast, Mutex},
    time::sleep,
};

/// Capacity of the peer event channel. A subscriber that lags behind gets
/// `RecvError::Lagged` and has to resynchronize from the registry.
const EVENT_CAPACITY: usize = 64;

/// Enum that tells where a peer is in its connection lifecycle.
#[derive(Clone)]
pub enum PeerState {
    /// Configured, never dialed.
    Unconnected,
    /// A connect loop is running for it.
    Connecting,
    Live(Arc<dyn PeerChannel>),
    /// Lost after having been live; a connect loop is about to take over.
    Failed,
}

impl PeerState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }
}

impl fmt::Debug for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "Unconnected",
            Self::Connecting => "Connecting",
            Self::Live(_) => "Live",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Timing knobs of the registry.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub connect_backoff: Duration,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
}

/// Change of a peer's reachability, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A connection was established and registered.
    Up(String),
    /// A live connection was dropped after a failed call.
    Down(String),
}

/// Live and configured peer counts reported by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reachability {
    pub live: usize,
    pub total: usize,
}

pub struct PeerRegistry {
    configured: BTreeSet<String>,
    peers: Mutex<BTreeMap<String, PeerState>>,
    connector: Arc<dyn Connector>,
    settings: RegistrySettings,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    /// Function that builds the registry from the configured addresses.
    ///
    /// `own_address` and duplicates are dropped. Every peer starts
    /// `Unconnected`; call [`PeerRegistry::start`] to dial them.
    pub fn configure<I, S>(
        own_address: &str,
        addresses: I,
        connector: Arc<dyn Connector>,
        settings: RegistrySettings,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let configured: BTreeSet<String> = addresses
            .into_iter()
            .map(Into::into)
            .filter(|address| address != own_address)
            .collect();

        let peers = configured
            .iter()
            .map(|address| (address.clone(), PeerState::Unconnected))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            configured,
            peers: Mutex::new(peers),
            connector,
            settings,
            events,
        }
    }

    pub fn is_configured(&self, address: &str) -> bool {
        self.configured.contains(address)
    }

    pub fn total(&self) -> usize {
        self.configured.len()
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Function that subscribes to [`PeerEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: PeerEvent) {
        // no subscriber is fine
        let _ = self.events.send(event);
    }

    /// Function that spawns one connect loop per configured peer.
    pub fn start(self: &Arc<Self>) {
        for address in &self.configured {
            self.spawn_connect(address.clone());
        }
    }

    fn spawn_connect(self: &Arc<Self>, address: String) {
        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.connect_loop(address).await });
    }

    /// Function that dials `address` until it succeeds.
    ///
    /// There is no retry ceiling: a peer may come up long after us. Returns
    /// right away if the peer is already live or another loop owns it.
    pub async fn connect_loop(self: Arc<Self>, address: String) {
        {
            let mut peers = self.peers.lock().await;
            match peers.get(&address) {
                Some(PeerState::Unconnected | PeerState::Failed) => {
                    peers.insert(address.clone(), PeerState::Connecting);
                }
                Some(_) => return,
                None => {
                    log::warn(&cformat!(
                        "Refusing to dial unconfigured peer <bold>{address}</bold>."
                    ));
                    return;
                }
            }
        }

        loop {
            match self.connector.connect(&address).await {
                Ok(channel) => {
                    self.peers
                        .lock()
                        .await
                        .insert(address.clone(), PeerState::Live(channel));
                    log::info(&cformat!("Connected to <bold>{address}</bold>."));
                    self.publish(PeerEvent::Up(address));
                    return;
                }
                Err(e) => {
                    log::debug(&format!("Dial {address} failed: {e} (retrying)."));
                    sleep(self.settings.connect_backoff).await;
                }
            }
        }
    }

    /// Function that returns the channel of a live peer.
    pub async fn channel(&self, address: &str) -> Option<Arc<dyn PeerChannel>> {
        match self.peers.lock().await.get(address) {
            Some(PeerState::Live(channel)) => Some(Arc::clone(channel)),
            _ => None,
        }
    }

    pub async fn state(&self, address: &str) -> Option<PeerState> {
        self.peers.lock().await.get(address).cloned()
    }

    /// Function that takes a point-in-time view of the live peers, ordered by
    /// address.
    pub async fn snapshot_live(&self) -> Vec<(String, Arc<dyn PeerChannel>)> {
        self.peers
            .lock()
            .await
            .iter()
            .filter_map(|(address, state)| match state {
                PeerState::Live(channel) => Some((address.clone(), Arc::clone(channel))),
                _ => None,
            })
            .collect()
    }

    pub async fn reachability(&self) -> Reachability {
        let live = self
            .peers
            .lock()
            .await
            .values()
            .filter(|state| state.is_live())
            .count();

        Reachability {
            live,
            total: self.total(),
        }
    }

    /// Function that drops the connection of a peer after a failed call and
    /// starts reconnecting.
    ///
    /// Subscribers get a [`PeerEvent::Down`] for it. Only acts if `channel` is
    /// still the registered one, so a late failure on an old connection does
    /// not tear down a fresh one.
    pub async fn mark_failed(self: &Arc<Self>, address: &str, channel: &Arc<dyn PeerChannel>) {
        let dropped = {
            let mut peers = self.peers.lock().await;
            let current = matches!(
                peers.get(address),
                Some(PeerState::Live(registered)) if same_channel(registered, channel)
            );
            if current {
                peers.insert(address.to_string(), PeerState::Failed);
            }
            current
        };

        if dropped {
            log::warn(&cformat!(
                "Peer <bold>{address}</bold> is <red>unreachable</red>, reconnecting."
            ));
            self.publish(PeerEvent::Down(address.to_string()));
            self.spawn_connect(address.to_string());
        }
    }

    /// Function that pings every live peer once and reports reachability.
    pub async fn health_sweep(self: &Arc<Self>) -> Reachability {
        let probes = self
            .snapshot_live()
            .await
            .into_iter()
            .map(|(address, channel)| async move {
                let result = call_with_timeout(
                    channel.as_ref(),
                    &address,
                    &Message::Ping,
                    self.settings.probe_timeout,
                )
                .await;
                (address, channel, result)
            });

        for (address, channel, result) in join_all(probes).await {
            if let Err(e) = result {
                log::debug(&format!("Ping {address} failed: {e}."));
                self.mark_failed(&address, &channel).await;
            }
        }

        self.reachability().await
    }

    /// Function that runs [`PeerRegistry::health_sweep`] forever.
    pub async fn health_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let reachability = self.health_sweep().await;
            log::debug(&format!(
                "Health sweep: {}/{} peers live.",
                reachability.live, reachability.total
            ));
        }
    }
}

fn same_channel(a: &Arc<dyn PeerChannel>, b: &Arc<dyn PeerChannel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
