//! Module with the boundary between the coordinator and the network.
//!
//! Inbound messages enter through [`RpcFacade::handle`]. Outbound calls go
//! through [`Outbound`], which looks up the live channel in the registry,
//! applies the per-call timeout and never retries: reconnecting is the
//! registry's job.

use crate::{
    clock::{Timestamp, MAX_REMOTE_TIMESTAMP},
    coordinator::MutexCoordinator,
    error::{Error, Result},
    log,
    message::Message,
    peer::PeerRegistry,
};
use async_trait::async_trait;
use color_print::cformat;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::sleep};

/// An established connection to one peer.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Sends `message` and waits for the peer's `Ack`.
    async fn call(&self, message: &Message) -> Result<()>;
}

/// Dials peers. Implemented over TCP by [`crate::net::TcpConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerChannel>>;
}

/// Function that performs one call bounded by `timeout`.
pub async fn call_with_timeout(
    channel: &dyn PeerChannel,
    address: &str,
    message: &Message,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, channel.call(message)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            address: address.to_string(),
        }),
    }
}

/// Result of an outbound `Request`.
#[derive(Debug)]
pub enum CallOutcome {
    Acked,
    /// The call failed or timed out; the coordinator counts it as a reply.
    Failed(Error),
}

/// Struct that sends our protocol messages to peers.
///
/// A `Reply` that cannot be delivered is kept until the peer is reachable
/// again, see [`Outbound::redeliver`]. At most one is kept per peer: a newer
/// request from the same peer supersedes it.
#[derive(Clone)]
pub struct Outbound {
    address: String,
    registry: Arc<PeerRegistry>,
    call_timeout: Duration,
    undelivered: Arc<Mutex<BTreeMap<String, Timestamp>>>,
}

impl Outbound {
    pub fn new(address: String, registry: Arc<PeerRegistry>, call_timeout: Duration) -> Self {
        Self {
            address,
            registry,
            call_timeout,
            undelivered: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Function that sends our request to a peer taken from a live snapshot.
    pub async fn request(
        &self,
        address: &str,
        channel: Arc<dyn PeerChannel>,
        timestamp: Timestamp,
    ) -> CallOutcome {
        let message = Message::Request {
            timestamp,
            requester: self.address.clone(),
        };

        match call_with_timeout(channel.as_ref(), address, &message, self.call_timeout).await {
            Ok(()) => CallOutcome::Acked,
            Err(e) => {
                self.registry.mark_failed(address, &channel).await;
                CallOutcome::Failed(e)
            }
        }
    }

    /// Function that sends a reply to a peer, using whatever connection the
    /// registry currently holds for it.
    ///
    /// On failure the reply is kept for [`Outbound::redeliver`] and the error
    /// is returned.
    pub async fn reply(&self, address: &str, timestamp: Timestamp) -> Result<()> {
        let result = self.send_reply(address, timestamp).await;
        if result.is_err() {
            self.undelivered
                .lock()
                .await
                .insert(address.to_string(), timestamp);

            // the peer may have been redialed while the call was failing
            if self.registry.channel(address).await.is_some() {
                let outbound = self.clone();
                let address = address.to_string();
                tokio::spawn(async move { outbound.redeliver(&address).await });
            }
        }
        result
    }

    /// Function that resends the reply kept for `address`, if any.
    ///
    /// Keeps trying while the peer stays live. Once it drops out the reply
    /// waits for the next [`crate::peer::PeerEvent::Up`].
    pub async fn redeliver(&self, address: &str) {
        loop {
            let Some(timestamp) = self.undelivered.lock().await.remove(address) else {
                return;
            };

            match self.send_reply(address, timestamp).await {
                Ok(()) => {
                    log::info(&cformat!(
                        "Delivered the held-back reply to <bold>{address}</bold>."
                    ));
                    return;
                }
                Err(e) => {
                    log::debug(&format!("Resending reply to {address} failed: {e}."));
                    self.undelivered
                        .lock()
                        .await
                        .entry(address.to_string())
                        .or_insert(timestamp);
                }
            }

            if !self
                .registry
                .state(address)
                .await
                .is_some_and(|state| state.is_live())
            {
                return;
            }
            sleep(self.registry.settings().connect_backoff).await;
        }
    }

    /// Function that drops the reply kept for `address`.
    ///
    /// Returns whether there was one.
    pub async fn forget(&self, address: &str) -> bool {
        self.undelivered.lock().await.remove(address).is_some()
    }

    /// Peers that are owed a reply we could not deliver yet.
    pub async fn undelivered(&self) -> Vec<String> {
        self.undelivered.lock().await.keys().cloned().collect()
    }

    async fn send_reply(&self, address: &str, timestamp: Timestamp) -> Result<()> {
        let channel = self
            .registry
            .channel(address)
            .await
            .ok_or_else(|| Error::Closed {
                address: address.to_string(),
            })?;

        let message = Message::Reply {
            timestamp,
            from: self.address.clone(),
        };

        let result =
            call_with_timeout(channel.as_ref(), address, &message, self.call_timeout).await;
        if result.is_err() {
            self.registry.mark_failed(address, &channel).await;
        }
        result
    }
}

/// Struct that dispatches inbound messages to the coordinator.
pub struct RpcFacade {
    coordinator: Arc<MutexCoordinator>,
}

impl RpcFacade {
    pub fn new(coordinator: Arc<MutexCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Function that handles one inbound message and returns the answer.
    ///
    /// Never waits on the network: replies that must go out now are sent from
    /// a separate task.
    pub async fn handle(&self, message: Message) -> Result<Message> {
        log::debug(&format!("Inbound {}.", message.kind()));

        if let Message::Request { timestamp, .. } | Message::Reply { timestamp, .. } = &message {
            if *timestamp > MAX_REMOTE_TIMESTAMP {
                log::warn(&cformat!(
                    "Rejecting {} with out-of-range <bold>ts={timestamp}</bold>.",
                    message.kind()
                ));
                return Err(Error::TimestampOutOfRange(*timestamp));
            }
        }

        match message {
            Message::Request {
                timestamp,
                requester,
            } => self.coordinator.on_request(timestamp, &requester).await,
            Message::Reply { timestamp, from } => self.coordinator.on_reply(timestamp, &from).await,
            Message::Ping => {}
            Message::Ack => {
                log::warn(&cformat!("Received a stray <bold>Ack</bold>."));
                return Err(Error::UnexpectedMessage("Ack"));
            }
        }

        Ok(Message::Ack)
    }
}
