use crate::{
    error::{Error, Result},
    log,
    message::Message,
    rpc::RpcFacade,
};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::codec::{Framed, LinesCodec};

/// Struct that accepts connections from peers and feeds their messages to the
/// facade.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Function that binds the listen address.
    ///
    /// Failing here is fatal for the node.
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| Error::Bind {
                address: address.to_string(),
                source,
            })?;

        log::info(&cformat!("Listening on <bold>{address}</bold>."));
        Ok(Self { listener })
    }

    async fn handle(stream: TcpStream, address: SocketAddr, facade: Arc<RpcFacade>) -> Result<()> {
        let mut lines = Framed::new(stream, LinesCodec::new());

        while let Some(line) = lines.next().await {
            let message = match Message::from_json_string(&line?) {
                Ok(message) => message,
                Err(e) => {
                    log::warn(&cformat!(
                        "Dropping malformed line from <bold>{address}</bold>: {e}."
                    ));
                    continue;
                }
            };

            match facade.handle(message).await {
                Ok(answer) => lines.send(answer.to_json_string()?).await?,
                Err(e) => log::warn(&format!("Not answering {address}: {e}.")),
            }
        }

        log::debug(&format!("Connection from {address} closed."));
        Ok(())
    }

    /// Function that accepts connections forever, one task per connection.
    ///
    /// Connection tasks belong to this future: dropping or aborting it closes
    /// every accepted connection as well.
    pub async fn run(self, facade: Arc<RpcFacade>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            let (stream, address) = self.listener.accept().await?;

            log::debug(&format!("Accepted a connection from {address}."));

            // reap finished handlers
            while connections.try_join_next().is_some() {}

            let facade = facade.clone();
            connections.spawn(async move {
                if let Err(e) = Self::handle(stream, address, facade).await {
                    log::error(&format!("{e}"));
                }
            });
        }
    }
}
