//! Bridging loop between a protocol handler and a topology
//!
//! Outgoing messages are handed to a single forwarder task so the loop never
//! waits on a slow topology, while per-run send order is kept.
//!
//! Messages for other sessions are held in the inbox rather than fed to the
//! handler, and replayed when a run for their session starts.

use crate::network::Network;
use partynet_core::{Handler, Message, PartyId, ProtocolError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bridging errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Run cancelled")]
    Cancelled,
}

/// Run `handler` as party `id` over `network` until its outgoing source
/// closes, then return its result.
pub async fn run_handler<H, N>(
    id: &PartyId,
    mut handler: H,
    network: Arc<N>,
    shutdown: &CancellationToken,
) -> Result<H::Output, BridgeError>
where
    H: Handler,
    N: Network,
{
    let mut outgoing = handler
        .take_outgoing()
        .ok_or(ProtocolError::OutgoingTaken)?;
    let session = handler.session();
    let inbox = network.next(id);

    let (fwd_tx, mut fwd_rx) = mpsc::unbounded_channel::<Message>();
    let net = network.clone();
    let mut forwarder = tokio::spawn(async move {
        while let Some(msg) = fwd_rx.recv().await {
            net.send(msg).await;
        }
    });

    let held = inbox.take_held(&session);
    if !held.is_empty() {
        debug!("Party {}: replaying {} held messages", id, held.len());
    }
    for msg in held {
        handler.accept(msg);
    }

    let mut inbox_open = true;
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                forwarder.abort();
                info!("Party {}: run cancelled", id);
                return Err(BridgeError::Cancelled);
            }

            msg = outgoing.recv() => match msg {
                Some(msg) => {
                    // Only fails if the forwarder panicked
                    if fwd_tx.send(msg).is_err() {
                        warn!("Party {}: forwarder gone, dropping message", id);
                    }
                }
                None => break,
            },

            msg = inbox.recv(), if inbox_open => match msg {
                Some(msg) if msg.ssid() != &session => {
                    debug!("Party {}: holding message for session {}", id, msg.ssid());
                    inbox.hold(msg);
                }
                Some(msg) => handler.accept(msg),
                None => {
                    warn!("Party {}: inbox closed before the run finished", id);
                    inbox_open = false;
                }
            },
        }
    }

    // Let queued sends reach the topology before reporting
    drop(fwd_tx);
    tokio::select! {
        _ = shutdown.cancelled() => {
            forwarder.abort();
            info!("Party {}: run cancelled while sending", id);
            return Err(BridgeError::Cancelled);
        }
        res = &mut forwarder => {
            if let Err(e) = res {
                warn!("Party {}: forwarder failed: {}", id, e);
            }
        }
    }

    debug!("Party {}: run finished", id);
    Ok(handler.result()?)
}
