//! TCP transport helpers
//!
//! Dialing with exponential backoff and a cancellable accept loop. No
//! handshake happens here: a connection is handed to a topology as soon as
//! it exists.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Server {addr} failed to respond after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("Cancelled")]
    Cancelled,
}

/// Retry policy for dialing a peer or relay
#[derive(Clone, Copy, Debug)]
pub struct DialPolicy {
    /// First retry delay; doubled after every failure
    pub initial_backoff: Duration,
    /// Give up once this much time has passed
    pub timeout: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

impl DialPolicy {
    /// Delay before retry number `tries` (0-based)
    pub fn backoff(&self, tries: u32) -> Duration {
        self.initial_backoff.saturating_mul(1u32 << tries.min(16))
    }
}

/// Connect to `addr`, retrying with exponential backoff until the policy's
/// deadline.
pub async fn dial_with_backoff<A>(
    addr: A,
    policy: DialPolicy,
    shutdown: &CancellationToken,
) -> Result<TcpStream, TransportError>
where
    A: ToSocketAddrs + std::fmt::Display + Clone,
{
    let deadline = Instant::now() + policy.timeout;
    let mut tries = 0u32;
    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return Err(TransportError::Cancelled),
            attempt = TcpStream::connect(addr.clone()) => attempt,
        };
        let err = match attempt {
            Ok(stream) => {
                info!("Connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => e,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(TransportError::Timeout {
                addr: addr.to_string(),
                timeout: policy.timeout,
            });
        }
        let delay = policy.backoff(tries).min(deadline - now);
        warn!(
            "Server {} not responding ({}); retrying({}) in {:?}",
            addr, err, tries, delay
        );
        tokio::select! {
            _ = shutdown.cancelled() => return Err(TransportError::Cancelled),
            _ = sleep(delay) => {}
        }
        tries += 1;
    }
}

/// Accept connections until `shutdown` fires, handing each to `on_conn`.
///
/// Accept errors are logged and the loop continues.
pub async fn accept_loop<F, Fut>(listener: TcpListener, shutdown: CancellationToken, on_conn: F)
where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    info!("Accepted connection from {}", addr);
                    tokio::spawn(on_conn(stream, addr));
                }
                Err(e) => error!("Accept error: {}", e),
            },
            _ = shutdown.cancelled() => {
                info!("Accept loop stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles() {
        let policy = DialPolicy {
            initial_backoff: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_dial_times_out() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let policy = DialPolicy {
            initial_backoff: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
        };
        let result = dial_with_backoff(addr, policy, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_dial_waits_for_late_listener() {
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            let _ = listener.accept().await;
        });
        let policy = DialPolicy {
            initial_backoff: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        };
        assert!(dial_with_backoff(addr, policy, &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dial_cancelled() {
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = dial_with_backoff(addr, DialPolicy::default(), &shutdown).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn test_accept_loop_hands_out_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let server = tokio::spawn(accept_loop(listener, shutdown.clone(), move |_stream, _addr| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.load(Ordering::SeqCst) < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        server.await.unwrap();
    }
}
