//! Module with the TCP transport: one JSON line per message.

use crate::{
    error::{Error, Result},
    message::Message,
    rpc::{Connector, PeerChannel},
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_util::codec::{Framed, LinesCodec};

pub type Lines = Framed<TcpStream, LinesCodec>;

/// Struct that dials peers over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerChannel>> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(Error::Timeout {
                    address: address.to_string(),
                })
            }
        };
        stream.set_nodelay(true)?;

        Ok(Arc::new(TcpChannel {
            address: address.to_string(),
            lines: Mutex::new(Framed::new(stream, LinesCodec::new())),
            broken: AtomicBool::new(false),
        }))
    }
}

/// Struct that represents one outbound connection.
///
/// Calls on the same connection are serialized. A call that is cut short
/// (timeout, error) leaves the stream unusable because its `Ack` may still
/// arrive, so every later call fails fast until the registry redials.
pub struct TcpChannel {
    address: String,
    lines: Mutex<Lines>,
    broken: AtomicBool,
}

#[async_trait]
impl PeerChannel for TcpChannel {
    async fn call(&self, message: &Message) -> Result<()> {
        let mut lines = self.lines.lock().await;
        if self.broken.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed {
                address: self.address.clone(),
            });
        }

        lines.send(message.to_json_string()?).await?;

        let answer = match lines.next().await {
            Some(line) => Message::from_json_string(&line?)?,
            None => {
                return Err(Error::Closed {
                    address: self.address.clone(),
                })
            }
        };

        if answer != Message::Ack {
            return Err(Error::UnexpectedResponse {
                address: self.address.clone(),
            });
        }

        self.broken.store(false, Ordering::SeqCst);
        Ok(())
    }
}
