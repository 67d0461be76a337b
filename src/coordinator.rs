//! Module with the Ricart-Agrawala state machine.
//!
//! A node enters the critical section once every peer that was live when it
//! asked has answered. Answers are real `Reply` messages or implicit ones: a
//! member whose `Request` could not be delivered, or that drops out while we
//! wait, counts as having replied. While a node holds priority it keeps the
//! replies it owes in a [`DeferredSet`] and sends them on exit.
//!
//! All mutable state sits in one `CoordinatorState` behind one lock. No
//! network call is made while that lock is held.

use crate::{
    clock::{LogicalClock, Timestamp},
    deferred::DeferredSet,
    error::{Error, Result},
    log,
    peer::{PeerEvent, PeerRegistry},
    rpc::{CallOutcome, Outbound},
};
use color_print::cformat;
use futures::future::join_all;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, Mutex, Notify,
};

/// Enum that tells where the local node is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Request broadcast, waiting for replies.
    Requesting,
    InCriticalSection,
}

/// Bookkeeping of one request round.
#[derive(Debug)]
struct Round {
    id: u64,
    /// Snapshot members that have not answered yet.
    outstanding: BTreeSet<String>,
    size: usize,
}

/// Outcome of one outbound `Request`, delivered to the requesting task.
#[derive(Debug)]
enum RoundEvent {
    Delivered { round: u64, peer: String },
    Undeliverable { round: u64, peer: String, error: Error },
}

#[derive(Debug)]
struct CoordinatorState {
    clock: LogicalClock,
    phase: Phase,
    request_timestamp: Timestamp,
    round: Option<Round>,
    rounds_started: u64,
    deferred: DeferredSet,
}

impl CoordinatorState {
    fn new() -> Self {
        Self {
            clock: LogicalClock::new(),
            phase: Phase::Idle,
            request_timestamp: 0,
            round: None,
            rounds_started: 0,
            deferred: DeferredSet::new(),
        }
    }

    /// Function that tells whether our own request outranks `(timestamp, from)`.
    ///
    /// Lower timestamp wins; equal timestamps fall back to the lower address.
    fn holds_priority(&self, own_address: &str, timestamp: Timestamp, from: &str) -> bool {
        match self.phase {
            Phase::InCriticalSection => true,
            Phase::Requesting => (self.request_timestamp, own_address) < (timestamp, from),
            Phase::Idle => false,
        }
    }

    /// Function that counts an answer from `peer` for round `round`.
    ///
    /// Each member is counted at most once per round.
    fn count(&mut self, round: u64, peer: &str) -> bool {
        if self.phase != Phase::Requesting {
            return false;
        }
        match self.round.as_mut() {
            Some(current) if current.id == round => current.outstanding.remove(peer),
            _ => false,
        }
    }

    fn round_complete(&self) -> bool {
        self.phase == Phase::Requesting
            && self
                .round
                .as_ref()
                .is_some_and(|round| round.outstanding.is_empty())
    }
}

pub struct MutexCoordinator {
    address: String,
    state: Mutex<CoordinatorState>,
    registry: Arc<PeerRegistry>,
    outbound: Outbound,
    quorum_reached: Notify,
}

impl MutexCoordinator {
    pub fn new(address: String, registry: Arc<PeerRegistry>, call_timeout: Duration) -> Self {
        let outbound = Outbound::new(address.clone(), Arc::clone(&registry), call_timeout);
        Self {
            address,
            state: Mutex::new(CoordinatorState::new()),
            registry,
            outbound,
            quorum_reached: Notify::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn clock(&self) -> Timestamp {
        self.state.lock().await.clock.now()
    }

    /// Timestamp of the outstanding request, if any.
    pub async fn request_timestamp(&self) -> Option<Timestamp> {
        let state = self.state.lock().await;
        (state.phase != Phase::Idle).then_some(state.request_timestamp)
    }

    pub async fn deferred_peers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.deferred.clone().drain()
    }

    /// Function that blocks until this node may enter the critical section.
    ///
    /// Never fails because of peers: unreachable ones count as having replied.
    pub async fn request_access(&self) -> Result<()> {
        let (_, events) = self.begin_round().await?;
        self.await_quorum(events).await;
        Ok(())
    }

    /// Function like [`MutexCoordinator::request_access`] that gives up after
    /// `deadline`.
    ///
    /// Giving up abandons the round: the node goes back to idle and answers
    /// every request it was holding back.
    pub async fn request_access_within(&self, deadline: Duration) -> Result<()> {
        let (round, events) = self.begin_round().await?;

        match tokio::time::timeout(deadline, self.await_quorum(events)).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.abandon(round).await;
                Err(Error::DeadlineElapsed)
            }
        }
    }

    /// Function that requests access and hands back a guard for the section.
    pub async fn lock(self: &Arc<Self>) -> Result<CriticalSection> {
        self.request_access().await?;
        Ok(CriticalSection {
            coordinator: Some(Arc::clone(self)),
        })
    }

    async fn begin_round(&self) -> Result<(u64, mpsc::UnboundedReceiver<RoundEvent>)> {
        let snapshot = self.registry.snapshot_live().await;

        let (round, timestamp) = {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Idle {
                return Err(Error::AlreadyRequesting);
            }

            let timestamp = state.clock.tick();
            state.rounds_started += 1;
            state.phase = Phase::Requesting;
            state.request_timestamp = timestamp;
            state.round = Some(Round {
                id: state.rounds_started,
                outstanding: snapshot.iter().map(|(peer, _)| peer.clone()).collect(),
                size: snapshot.len(),
            });
            (state.rounds_started, timestamp)
        };

        log::info(&cformat!(
            "Requesting access at <bold>ts={timestamp}</bold> from <bold>{}/{}</bold> peers.",
            snapshot.len(),
            self.registry.total()
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        for (peer, channel) in snapshot {
            let tx = tx.clone();
            let outbound = self.outbound.clone();

            tokio::spawn(async move {
                let event = match outbound.request(&peer, channel, timestamp).await {
                    CallOutcome::Acked => RoundEvent::Delivered { round, peer },
                    CallOutcome::Failed(error) => RoundEvent::Undeliverable { round, peer, error },
                };
                // the receiver is gone once the round is over
                let _ = tx.send(event);
            });
        }

        Ok((round, rx))
    }

    async fn await_quorum(&self, mut events: mpsc::UnboundedReceiver<RoundEvent>) {
        let mut events_open = true;

        loop {
            {
                let mut state = self.state.lock().await;
                if state.round_complete() {
                    state.phase = Phase::InCriticalSection;
                    let size = state.round.as_ref().map_or(0, |r| r.size);
                    log::info(&cformat!(
                        "<green>Entering</green> the critical section (<bold>{size}</bold> replies)."
                    ));
                    return;
                }
            }

            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.apply(event).await,
                    None => events_open = false,
                },
                _ = self.quorum_reached.notified() => {}
            }
        }
    }

    async fn apply(&self, event: RoundEvent) {
        match event {
            RoundEvent::Delivered { peer, .. } => {
                log::debug(&format!("Request delivered to {peer}."));
            }
            RoundEvent::Undeliverable { round, peer, error } => {
                let counted = self.state.lock().await.count(round, &peer);
                if counted {
                    log::warn(&cformat!(
                        "Request to <bold>{peer}</bold> failed ({error}); counting it as a reply."
                    ));
                }
            }
        }
    }

    async fn abandon(&self, round: u64) {
        let (timestamp, owed) = {
            let mut state = self.state.lock().await;
            let current = state.round.as_ref().is_some_and(|r| r.id == round);
            if !current || state.phase != Phase::Requesting {
                return;
            }
            state.phase = Phase::Idle;
            state.round = None;
            (state.clock.tick(), state.deferred.drain())
        };

        log::warn(&cformat!(
            "Gave up waiting for access, answering <bold>{}</bold> deferred peers.",
            owed.len()
        ));
        self.send_replies(timestamp, owed).await;
    }

    /// Function that leaves the critical section and answers every deferred
    /// request.
    pub async fn exit_cs(&self) -> Result<()> {
        let (timestamp, owed) = {
            let mut state = self.state.lock().await;
            if state.phase != Phase::InCriticalSection {
                return Err(Error::NotInCriticalSection);
            }
            state.phase = Phase::Idle;
            state.round = None;
            (state.clock.tick(), state.deferred.drain())
        };

        log::info(&cformat!(
            "<yellow>Leaving</yellow> the critical section, releasing <bold>{}</bold> deferred replies.",
            owed.len()
        ));
        self.send_replies(timestamp, owed).await;
        Ok(())
    }

    async fn send_replies(&self, timestamp: Timestamp, peers: Vec<String>) {
        let replies = peers
            .iter()
            .map(|peer| async move { (peer, self.outbound.reply(peer, timestamp).await) });

        for (peer, result) in join_all(replies).await {
            if let Err(e) = result {
                log::warn(&cformat!(
                    "Deferred reply to <bold>{peer}</bold> failed ({e}), holding it until the peer is back."
                ));
            }
        }
    }

    /// Function that handles a `Request` from a peer.
    ///
    /// Either defers the peer or spawns the reply right away; never waits on
    /// the network.
    pub async fn on_request(&self, timestamp: Timestamp, from: &str) {
        if !self.registry.is_configured(from) {
            log::warn(&cformat!(
                "Ignoring request from unconfigured peer <bold>{from}</bold>."
            ));
            return;
        }

        // a new request means the peer is done with the one we still owe
        if self.outbound.forget(from).await {
            log::debug(&format!("Dropped the held-back reply to {from}, superseded."));
        }

        let reply_with = {
            let mut state = self.state.lock().await;
            state.clock.observe(timestamp);

            if state.holds_priority(&self.address, timestamp, from) {
                if !state.deferred.defer(from) {
                    log::warn(&cformat!(
                        "Peer <bold>{from}</bold> asked again before being answered."
                    ));
                }
                None
            } else {
                Some(state.clock.now())
            }
        };

        match reply_with {
            None => log::debug(&format!("Deferred reply to {from} (ts={timestamp}).")),
            Some(now) => {
                let outbound = self.outbound.clone();
                let peer = from.to_string();
                tokio::spawn(async move {
                    if let Err(e) = outbound.reply(&peer, now).await {
                        log::warn(&cformat!(
                            "Reply to <bold>{peer}</bold> failed ({e}), holding it until the peer is back."
                        ));
                    }
                });
            }
        }
    }

    /// Function that handles a `Reply` from a peer.
    pub async fn on_reply(&self, timestamp: Timestamp, from: &str) {
        if !self.registry.is_configured(from) {
            log::warn(&cformat!(
                "Ignoring reply from unconfigured peer <bold>{from}</bold>."
            ));
            return;
        }

        let counted = {
            let mut state = self.state.lock().await;
            state.clock.observe(timestamp);
            match state.round.as_ref().map(|round| round.id) {
                Some(round) => state.count(round, from),
                None => false,
            }
        };

        if counted {
            log::debug(&format!("Reply from {from} counted."));
            self.quorum_reached.notify_one();
        } else {
            log::warn(&cformat!(
                "Ignoring duplicate or stray reply from <bold>{from}</bold>."
            ));
        }
    }

    /// Function that follows the registry's [`PeerEvent`]s until it closes.
    ///
    /// A peer coming up gets the reply we could not deliver earlier. A round
    /// member going down counts as having replied.
    pub async fn watch_peers(self: Arc<Self>, mut events: broadcast::Receiver<PeerEvent>) {
        loop {
            match events.recv().await {
                Ok(PeerEvent::Up(peer)) => self.spawn_redeliver(peer),
                Ok(PeerEvent::Down(peer)) => self.peer_lost(&peer).await,
                Err(RecvError::Lagged(missed)) => {
                    log::warn(&format!("Missed {missed} peer events, resynchronizing."));
                    self.resync().await;
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    fn spawn_redeliver(&self, peer: String) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move { outbound.redeliver(&peer).await });
    }

    async fn peer_lost(&self, peer: &str) {
        let counted = {
            let mut state = self.state.lock().await;
            match state.round.as_ref().map(|round| round.id) {
                Some(round) => state.count(round, peer),
                None => false,
            }
        };

        if counted {
            log::warn(&cformat!(
                "Peer <bold>{peer}</bold> dropped out while we waited; counting it as a reply."
            ));
            self.quorum_reached.notify_one();
        }
    }

    /// Function that rebuilds what missed events would have told us.
    async fn resync(&self) {
        let outstanding: Vec<String> = {
            let state = self.state.lock().await;
            state
                .round
                .as_ref()
                .map(|round| round.outstanding.iter().cloned().collect())
                .unwrap_or_default()
        };
        for peer in outstanding {
            let live = self
                .registry
                .state(&peer)
                .await
                .is_some_and(|state| state.is_live());
            if !live {
                self.peer_lost(&peer).await;
            }
        }

        for peer in self.outbound.undelivered().await {
            self.spawn_redeliver(peer);
        }
    }
}

/// Guard for an acquired critical section.
///
/// Call [`CriticalSection::release`] to leave. A guard dropped without it
/// still leaves, from a spawned task.
pub struct CriticalSection {
    coordinator: Option<Arc<MutexCoordinator>>,
}

impl CriticalSection {
    pub async fn release(mut self) -> Result<()> {
        match self.coordinator.take() {
            Some(coordinator) => coordinator.exit_cs().await,
            None => Ok(()),
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            log::warn("Critical section dropped without release.");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = coordinator.exit_cs().await;
                });
            }
        }
    }
}
