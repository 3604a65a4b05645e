//! STOMP message broker.
//!
//! The interesting machinery is per connection: `connection` owns the
//! protocol state machine, `heartbeat`/`ack`/`transaction`/`consumer`/
//! `producer` are its parts, and `router`/`host`/`store` are the broker-side
//! collaborators it talks to.

pub mod ack;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod heartbeat;
pub mod host;
pub mod producer;
pub mod router;
pub mod selector;
pub mod store;
pub mod transaction;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::host::HostRegistry;

/// A running broker: the bound address and a shutdown handle.
///
/// Shutting down stops the accept loop and tells every live connection to
/// finish; dropping the handle does the same.
pub struct BrokerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct Broker;

impl Broker {
    /// Bind the configured listen address (use port 0 to let the OS pick)
    /// and spawn the accept loop.
    pub async fn start(config: BrokerConfig) -> Result<BrokerHandle, std::io::Error> {
        let listener = TcpListener::bind(&config.bind).await?;
        let local_addr = listener.local_addr()?;
        let hosts = Arc::new(HostRegistry::from_config(&config));
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(addr = %local_addr, "broker listening");
        tokio::spawn(accept_loop(listener, config, hosts, shutdown_rx));

        Ok(BrokerHandle {
            local_addr,
            shutdown: shutdown_tx,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<BrokerConfig>,
    hosts: Arc<HostRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => {
                    tokio::spawn(connection::handle_connection(
                        stream,
                        Arc::clone(&config),
                        Arc::clone(&hosts),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    debug!(error = %e, "accept failed");
                }
            },
        }
    }
    debug!("accept loop stopped");
}
