//! relayd server - main service loop

use crate::config::Config;
use partynet_net::{accept_loop, RelayServer, RelayStats};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Server state
pub struct Server {
    config: Config,
    relay: Arc<RelayServer>,
    /// Shutdown signal
    shutdown: CancellationToken,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let shutdown = CancellationToken::new();
        let relay = RelayServer::new(config.queue_capacity, &shutdown);
        Self {
            config,
            relay,
            shutdown,
        }
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        self.serve(listener).await
    }

    /// Run on an already bound listener until shutdown, or until the last
    /// participant leaves when `exit_when_idle` is set
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("Relay listening on {}", listener.local_addr()?);

        let stats_handle = self.spawn_stats_task();
        let relay = self.relay.clone();
        let accept = accept_loop(listener, self.shutdown.clone(), move |stream, addr| {
            let relay = relay.clone();
            async move {
                relay.handle_conn(stream).await;
                debug!("Connection from {} finished", addr);
            }
        });

        let idle = self.relay.done();
        tokio::select! {
            _ = accept => {}
            _ = idle.cancelled(), if self.config.exit_when_idle => {
                info!("Last participant left, exiting");
            }
        }

        self.shutdown.cancel();
        stats_handle.abort();
        let stats = self.stats();
        info!(
            "Relay stopped: {} connections, {} lines relayed",
            stats.connections_accepted, stats.lines_relayed
        );
        Ok(())
    }

    /// Spawn background statistics task
    fn spawn_stats_task(&self) -> tokio::task::JoinHandle<()> {
        let relay = self.relay.clone();
        let shutdown = self.shutdown.clone();
        let secs = self.config.stats_interval_secs;

        tokio::spawn(async move {
            if secs == 0 {
                return;
            }
            let mut ticker = interval(Duration::from_secs(secs));
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = relay.stats();
                        info!(
                            "{} connected, {} accepted, {} lines relayed, {} deliveries failed",
                            relay.client_count(),
                            stats.connections_accepted,
                            stats.lines_relayed,
                            stats.deliveries_failed
                        );
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shutdown token, for wiring signal handlers
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of connected participants
    pub fn client_count(&self) -> usize {
        self.relay.client_count()
    }

    /// Get relay statistics
    pub fn stats(&self) -> RelayStats {
        self.relay.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use partynet_core::{Message, PartyId, SessionId};
    use partynet_net::{Network, RelayClient};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(exit_when_idle: bool) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            queue_capacity: 16,
            stats_interval_secs: 0,
            exit_when_idle,
            verbose: false,
            log_format: LogFormat::Pretty,
        }
    }

    async fn start(exit_when_idle: bool) -> (Arc<Server>, SocketAddr, tokio::task::JoinHandle<()>) {
        let server = Arc::new(Server::new(test_config(exit_when_idle)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = server.clone();
        let handle = tokio::spawn(async move {
            running.serve(listener).await.unwrap();
        });
        (server, addr, handle)
    }

    async fn wait_for_clients(server: &Server, n: usize) {
        timeout(WAIT, async {
            while server.client_count() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(test_config(false));
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.stats().lines_relayed, 0);
    }

    #[tokio::test]
    async fn test_relays_between_participants() {
        let (server, addr, handle) = start(false).await;
        let shutdown = CancellationToken::new();

        let a_stream = TcpStream::connect(addr).await.unwrap();
        let b_stream = TcpStream::connect(addr).await.unwrap();
        let a = RelayClient::connect("a".into(), a_stream, 16, &shutdown);
        let b = RelayClient::connect("b".into(), b_stream, 16, &shutdown);
        wait_for_clients(&server, 2).await;

        let msg = Message::broadcast(SessionId::default(), "t", 1, PartyId::from("a"), vec![1, 2]);
        a.send(msg.clone()).await;
        let got = timeout(WAIT, b.next(&"b".into()).recv()).await.unwrap().unwrap();
        assert_eq!(got, msg);
        assert_eq!(server.stats().connections_accepted, 2);

        server.shutdown();
        timeout(WAIT, handle).await.unwrap().unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_exit_when_idle() {
        let (server, addr, handle) = start(true).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 1).await;
        drop(stream);

        timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(server.stats().connections_accepted, 1);
    }
}
