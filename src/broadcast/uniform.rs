//! Uniform reliable broadcast: echo on first sighting, deliver at majority.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::broadcast::best_effort::BestEffortBroadcast;
use crate::core::gate::SendGate;
use crate::core::id::{MessageId, ProcessId, ProcessSet, SeqNr, INITIAL_SEQ_NR};
use crate::core::membership::Membership;
use crate::network::link::LinkError;

/// Cap on broadcasts this instance may have in flight at once.
pub const MAX_IN_FLIGHT: usize = 8;

/// Best-effort broadcast plus an acknowledgement-echo protocol that adds
/// uniform agreement: if any process delivers a message, every correct
/// process eventually delivers it.
///
/// A broadcast is identified by the packed (originator, seq_nr) pair carried
/// in the datagram metadata for its whole propagation. Per id we track a
/// bitset of processes observed to have seen it; presence of the map entry
/// doubles as the pending flag. Entries are never collected, which is fine
/// for the intended workload sizes.
pub struct UniformReliableBroadcast {
    beb: BestEffortBroadcast,
    acknowledged: Mutex<HashMap<MessageId, ProcessSet>>,
    next_seq_nr: AtomicU32,
    gate: SendGate,
}

impl UniformReliableBroadcast {
    pub fn new(id: ProcessId, membership: Membership) -> Self {
        Self {
            beb: BestEffortBroadcast::new(id, membership),
            acknowledged: Mutex::new(HashMap::new()),
            next_seq_nr: AtomicU32::new(INITIAL_SEQ_NR),
            gate: SendGate::new(MAX_IN_FLIGHT),
        }
    }

    #[inline]
    pub fn id(&self) -> ProcessId {
        self.beb.id()
    }

    #[inline]
    pub fn membership(&self) -> &Membership {
        self.beb.membership()
    }

    pub async fn bind(&self, addr: SocketAddr) -> Result<(), LinkError> {
        self.beb.bind(addr).await
    }

    /// Broadcasts `payloads` under a fresh broadcast id. Blocks while
    /// [`MAX_IN_FLIGHT`] own broadcasts are still undelivered; the permit is
    /// returned when this broadcast uniformly delivers at this node.
    pub async fn broadcast(&self, payloads: &[&[u8]]) -> Result<(), LinkError> {
        self.gate.acquire().await;

        let broadcast_id = {
            let mut acknowledged = self.acknowledged.lock();
            let seq_nr = self.next_seq_nr.fetch_add(1, Ordering::Relaxed);
            let id = MessageId::new(self.beb.id(), seq_nr);
            // Pre-registering makes our own loopback receipt count as the
            // originator's echo instead of triggering a second one.
            acknowledged.insert(id, ProcessSet::new());
            id
        };

        let result = self.beb.broadcast(&broadcast_id.to_le_bytes(), payloads);
        if result.is_err() {
            self.acknowledged.lock().remove(&broadcast_id);
            self.gate.release();
        }
        result
    }

    /// Like [`Self::listen_batch`] but fires once per payload chunk.
    pub async fn listen<F>(&self, mut callback: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, SeqNr, &[u8]) + Send,
    {
        self.listen_batch(move |originator, seq_nr, payloads: &[&[u8]]| {
            for payload in payloads {
                callback(originator, seq_nr, payload);
            }
        })
        .await
    }

    /// Owns the receive loop. `callback` fires exactly once per uniformly
    /// delivered broadcast with the originator, the originator's broadcast
    /// sequence number, and the payload chunks of the datagram (borrowed
    /// from the receive buffer).
    pub async fn listen_batch<F>(&self, mut callback: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, SeqNr, &[&[u8]]) + Send,
    {
        let majority = self.membership().majority();

        self.beb
            .listen_batch(move |sender, metadata, payloads| {
                let Some(broadcast_id) = MessageId::from_metadata(metadata) else {
                    warn!(sender, "dropping broadcast datagram without id");
                    return;
                };

                let (was_new, should_deliver) = {
                    let mut acknowledged = self.acknowledged.lock();
                    let (acks, was_new) = match acknowledged.entry(broadcast_id) {
                        Entry::Occupied(entry) => (entry.into_mut(), false),
                        Entry::Vacant(entry) => (entry.insert(ProcessSet::new()), true),
                    };
                    let had_acked = acks.insert(sender);
                    (was_new, !had_acked && acks.len() == majority)
                };

                // First sighting and delivery coincide only in a group of one.
                debug_assert!(!(was_new && should_deliver) || majority == 1);

                if was_new {
                    // Echo verbatim so a majority observes the broadcast even
                    // if the originator dies mid-fan-out.
                    if let Err(error) = self.beb.broadcast(metadata, payloads) {
                        warn!(%error, "echo failed");
                    }
                }

                if should_deliver {
                    let originator = broadcast_id.process();
                    if originator == self.beb.id() {
                        // Our own broadcast has uniformly delivered.
                        self.gate.release();
                    }
                    callback(originator, broadcast_id.seq_nr(), payloads);
                }
            })
            .await
    }

    pub fn shutdown(&self) {
        self.beb.shutdown();
    }
}
