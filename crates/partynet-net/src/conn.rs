//! Per-connection reader and writer plumbing shared by the TCP topologies

use crate::framing::LineCodec;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read the next line, or `None` once the connection is finished.
///
/// Framing errors end the connection; cancellation ends it silently.
pub(crate) async fn next_line<R>(
    lines: &mut FramedRead<R, LineCodec>,
    closed: &CancellationToken,
) -> Option<Bytes>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = closed.cancelled() => None,
        next = lines.next() => match next {
            Some(Ok(line)) => Some(line),
            Some(Err(e)) => {
                warn!("Read failed, closing connection: {}", e);
                None
            }
            None => None,
        },
    }
}

/// Drain `rx` onto the socket until the channel closes or `closed` fires.
///
/// Write errors are logged and the line is dropped; nothing is retried.
/// A peer that stops reading cannot hold the writer past `closed`.
pub(crate) async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LineCodec::new());
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        tokio::select! {
            _ = closed.cancelled() => return,
            sent = sink.send(line) => {
                if let Err(e) = sent {
                    warn!("Write failed, line dropped: {}", e);
                }
            }
        }
    }
    tokio::select! {
        _ = closed.cancelled() => {}
        res = sink.close() => {
            if let Err(e) = res {
                debug!("Closing writer: {}", e);
            }
        }
    }
}

/// Push into a bounded queue, giving up if `closed` fires first.
///
/// Returns false when the item was not queued.
pub(crate) async fn enqueue<T>(tx: &mpsc::Sender<T>, item: T, closed: &CancellationToken) -> bool {
    tokio::select! {
        _ = closed.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_write_loop_stops_when_peer_never_reads() {
        // Tiny pipe whose far end is kept open but never read
        let (near, _far) = tokio::io::duplex(16);
        let (tx, rx) = mpsc::channel(8);
        let closed = CancellationToken::new();
        let writer = tokio::spawn(write_loop(near, rx, closed.clone()));

        for _ in 0..3 {
            tx.send(Bytes::from(vec![b'x'; 64])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        closed.cancel();
        timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_write_loop_flushes_lines_in_order() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel(8);
        let closed = CancellationToken::new();
        let writer = tokio::spawn(write_loop(near, rx, closed));

        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let mut out = String::new();
        far.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_enqueue_gives_up_on_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let closed = CancellationToken::new();
        assert!(enqueue(&tx, 1u8, &closed).await);
        closed.cancel();
        assert!(!enqueue(&tx, 2u8, &closed).await);
    }
}
