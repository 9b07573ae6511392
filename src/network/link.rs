//! Perfect point-to-point links over lossy UDP.
//!
//! Guarantees, provided both ends stay up:
//! 1. Validity - every message sent is eventually delivered
//! 2. No duplication - no message is delivered more than once
//! 3. No creation - no message is delivered unless it was sent

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::id::{MessageId, ProcessId, SeqNr, INITIAL_SEQ_NR, MAX_PROCESSES};
use crate::network::codec::{self, WireError, MAX_DATAGRAM_SIZE};

/// How often unacknowledged datagrams are retransmitted.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is already bound")]
    AlreadyBound,
    #[error("link is not bound")]
    NotBound,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A sent datagram still waiting for its ACK. While present it is
/// retransmitted on every tick.
struct PendingDatagram {
    dst: SocketAddr,
    bytes: Arc<[u8]>,
}

/// Reliable exactly-once unicast over one UDP socket.
///
/// Sends record the datagram in a pending map before the first transmit and
/// retransmit it every [`RESEND_INTERVAL`] until the peer's ACK arrives.
/// Receipt deduplicates on the packed (sender, seq_nr) key and ACKs every
/// datagram, duplicates included, so the sender eventually goes quiet even
/// when ACKs get lost.
pub struct PerfectLink {
    id: ProcessId,
    socket: OnceLock<UdpSocket>,
    next_seq_nr: AtomicU32,
    pending: Mutex<HashMap<SeqNr, PendingDatagram>>,
    delivered: Mutex<HashSet<MessageId>>,
    cancel: CancellationToken,
}

impl PerfectLink {
    /// Constructs an unbound link. No network activity happens here.
    pub fn new(id: ProcessId) -> Self {
        Self {
            id,
            socket: OnceLock::new(),
            next_seq_nr: AtomicU32::new(INITIAL_SEQ_NR),
            pending: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Creates and binds the UDP socket. Fails if already bound.
    pub async fn bind(&self, addr: SocketAddr) -> Result<(), LinkError> {
        if self.socket.get().is_some() {
            return Err(LinkError::AlreadyBound);
        }
        let socket = UdpSocket::bind(addr).await?;
        self.socket.set(socket).map_err(|_| LinkError::AlreadyBound)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        let socket = self.socket.get().ok_or(LinkError::NotBound)?;
        Ok(socket.local_addr()?)
    }

    /// Sends `payloads` (at most 8 chunks) to `dst` under a fresh sequence
    /// number and records it for retransmission. Returns without waiting for
    /// the ACK. Concurrent senders each observe a unique sequence number.
    pub fn send(
        &self,
        dst: SocketAddr,
        metadata: &[u8],
        payloads: &[&[u8]],
    ) -> Result<SeqNr, LinkError> {
        let socket = self.socket.get().ok_or(LinkError::NotBound)?;
        let seq_nr = self.next_seq_nr.fetch_add(1, Ordering::Relaxed);
        let bytes: Arc<[u8]> = codec::encode(seq_nr, self.id, metadata, payloads)?.into();

        // Record before the first transmit so a racing ACK always finds the
        // entry to remove.
        self.pending.lock().insert(
            seq_nr,
            PendingDatagram {
                dst,
                bytes: Arc::clone(&bytes),
            },
        );
        transmit(socket, &bytes, dst);
        Ok(seq_nr)
    }

    /// Owns the receive loop until [`Self::shutdown`]. Invokes `callback`
    /// once per freshly delivered datagram with the decoded metadata and
    /// payload slices; both borrow the receive buffer and are only valid for
    /// the duration of the call.
    pub async fn listen_batch<F>(&self, mut callback: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, &[u8], &[&[u8]]) + Send,
    {
        let socket = self.socket.get().ok_or(LinkError::NotBound)?;
        let mut resend = interval(RESEND_INTERVAL);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = resend.tick() => self.retransmit_pending(socket),
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => {
                        self.handle_datagram(socket, &buf[..len], src, &mut callback)
                    }
                    Err(error) => warn!(%error, "recv_from failed"),
                },
            }
        }
    }

    /// Like [`Self::listen_batch`] but invokes `callback` once per payload
    /// chunk, dropping metadata.
    pub async fn listen<F>(&self, mut callback: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, &[u8]) + Send,
    {
        self.listen_batch(move |sender, _metadata, payloads| {
            for payload in payloads {
                callback(sender, payload);
            }
        })
        .await
    }

    /// Stops the listen loop. Pending retransmissions are abandoned.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Number of sent datagrams still waiting for an ACK.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn handle_datagram<F>(
        &self,
        socket: &UdpSocket,
        buf: &[u8],
        src: SocketAddr,
        callback: &mut F,
    ) where
        F: FnMut(ProcessId, &[u8], &[&[u8]]),
    {
        let datagram = match codec::decode(buf) {
            Ok(datagram) => datagram,
            Err(error) => {
                debug!(%src, %error, "dropping malformed datagram");
                return;
            }
        };

        if datagram.is_ack {
            self.pending.lock().remove(&datagram.seq_nr);
            return;
        }

        // Closed-world protocol: ids are dense 1..=MAX_PROCESSES.
        if datagram.sender == 0 || datagram.sender as usize > MAX_PROCESSES {
            debug!(%src, sender = datagram.sender, "dropping datagram with invalid sender");
            return;
        }

        let fresh = self
            .delivered
            .lock()
            .insert(MessageId::new(datagram.sender, datagram.seq_nr));
        if fresh {
            callback(datagram.sender, datagram.metadata, &datagram.payloads);
        }

        // Ack duplicates too: our previous ACK may have been lost and the
        // sender keeps retransmitting until one gets through.
        transmit(socket, &codec::encode_ack(datagram.seq_nr, self.id), src);
    }

    fn retransmit_pending(&self, socket: &UdpSocket) {
        // Snapshot under the lock, transmit outside it.
        let entries: Vec<(SocketAddr, Arc<[u8]>)> = self
            .pending
            .lock()
            .values()
            .map(|p| (p.dst, Arc::clone(&p.bytes)))
            .collect();
        if !entries.is_empty() {
            trace!(count = entries.len(), "retransmitting unacked datagrams");
        }
        for (dst, bytes) in entries {
            transmit(socket, &bytes, dst);
        }
    }
}

/// One best-effort transmission. Failures never propagate: anything worth
/// delivering sits in the pending map and goes out again next tick.
fn transmit(socket: &UdpSocket, bytes: &[u8], dst: SocketAddr) {
    match socket.try_send_to(bytes, dst) {
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
            trace!(%dst, "send buffer full, deferring to retransmit tick");
        }
        Err(error) => warn!(%dst, %error, "datagram transmit failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_requires_bind() {
        let link = PerfectLink::new(1);
        let err = link.send("127.0.0.1:9".parse().unwrap(), &[], &[]);
        assert!(matches!(err, Err(LinkError::NotBound)));
    }

    #[tokio::test]
    async fn bind_twice_fails() {
        let link = PerfectLink::new(1);
        link.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = link.bind("127.0.0.1:0".parse().unwrap()).await;
        assert!(matches!(err, Err(LinkError::AlreadyBound)));
    }

    #[tokio::test]
    async fn send_records_pending_until_acked() {
        let link = PerfectLink::new(1);
        link.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        // No receiver on the far side, so the entry must stay pending.
        let dst = "127.0.0.1:1".parse().unwrap();
        link.send(dst, &[], &[b"payload".as_slice()]).unwrap();
        assert_eq!(link.pending_len(), 1);
    }

    #[tokio::test]
    async fn sequence_numbers_are_unique_and_increasing() {
        let link = PerfectLink::new(1);
        link.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let dst = "127.0.0.1:1".parse().unwrap();
        let first = link.send(dst, &[], &[]).unwrap();
        let second = link.send(dst, &[], &[]).unwrap();
        assert_eq!(first, INITIAL_SEQ_NR);
        assert_eq!(second, INITIAL_SEQ_NR + 1);
    }
}
