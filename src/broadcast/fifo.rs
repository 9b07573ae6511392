//! FIFO ordering on top of uniform reliable broadcast.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;

use arrayvec::ArrayVec;
use tracing::warn;

use crate::broadcast::uniform::UniformReliableBroadcast;
use crate::core::id::{ProcessId, SeqNr, INITIAL_SEQ_NR};
use crate::core::membership::Membership;
use crate::network::codec::{WireError, MAX_CHUNKS};
use crate::network::link::LinkError;

/// Front-end specialized to 32-bit values: URB deliveries are reordered per
/// sender so the callback observes each sender's values in broadcast order.
/// A broadcast packs up to 8 values into one datagram; its values share the
/// datagram's sequence number and are delivered as a block.
pub struct FifoBroadcast {
    urb: UniformReliableBroadcast,
}

impl FifoBroadcast {
    pub fn new(id: ProcessId, membership: Membership) -> Self {
        Self {
            urb: UniformReliableBroadcast::new(id, membership),
        }
    }

    #[inline]
    pub fn id(&self) -> ProcessId {
        self.urb.id()
    }

    pub async fn bind(&self, addr: SocketAddr) -> Result<(), LinkError> {
        self.urb.bind(addr).await
    }

    /// Broadcasts up to 8 values packed into a single datagram.
    pub async fn broadcast(&self, values: &[u32]) -> Result<(), LinkError> {
        if values.len() > MAX_CHUNKS {
            return Err(WireError::TooManyChunks(values.len()).into());
        }
        let encoded: ArrayVec<[u8; 4], MAX_CHUNKS> =
            values.iter().map(|v| v.to_le_bytes()).collect();
        let chunks: ArrayVec<&[u8], MAX_CHUNKS> =
            encoded.iter().map(|b| b.as_slice()).collect();
        self.urb.broadcast(&chunks).await
    }

    /// Owns the receive loop; `callback` observes `(sender, value)` pairs in
    /// per-sender broadcast order.
    pub async fn listen<F>(&self, mut callback: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, u32) + Send,
    {
        let mut buffers: HashMap<ProcessId, ReorderBuffer> = HashMap::new();

        self.urb
            .listen_batch(move |sender, seq_nr, payloads| {
                let mut values = ValueGroup::new();
                for payload in payloads {
                    let Ok(bytes) = <[u8; 4]>::try_from(*payload) else {
                        warn!(sender, len = payload.len(), "dropping non-u32 payload");
                        return;
                    };
                    values.push(u32::from_le_bytes(bytes));
                }
                buffers
                    .entry(sender)
                    .or_default()
                    .feed(seq_nr, values, |v| callback(sender, v));
            })
            .await
    }

    pub fn shutdown(&self) {
        self.urb.shutdown();
    }
}

/// The values of one broadcast datagram, in chunk order.
type ValueGroup = ArrayVec<u32, MAX_CHUNKS>;

/// Per-sender reorder buffer: a min-heap of value groups keyed on the
/// originator's broadcast sequence number, drained while the head is the
/// next expected one. URB's no-duplication property keeps the heap free of
/// repeated sequence numbers.
struct ReorderBuffer {
    next_seq_nr: SeqNr,
    heap: BinaryHeap<Reverse<(SeqNr, ValueGroup)>>,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self {
            next_seq_nr: INITIAL_SEQ_NR,
            heap: BinaryHeap::new(),
        }
    }
}

impl ReorderBuffer {
    fn feed<F>(&mut self, seq_nr: SeqNr, values: ValueGroup, mut deliver: F)
    where
        F: FnMut(u32),
    {
        if seq_nr != self.next_seq_nr {
            self.heap.push(Reverse((seq_nr, values)));
            return;
        }

        for value in values {
            deliver(value);
        }
        self.next_seq_nr += 1;

        // Drain the contiguous prefix that this receipt unblocked.
        while let Some(Reverse((seq, _))) = self.heap.peek() {
            if *seq != self.next_seq_nr {
                break;
            }
            if let Some(Reverse((_, group))) = self.heap.pop() {
                for value in group {
                    deliver(value);
                }
                self.next_seq_nr += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(values: &[u32]) -> ValueGroup {
        values.iter().copied().collect()
    }

    fn feed_all(buffer: &mut ReorderBuffer, receipts: &[(SeqNr, &[u32])]) -> Vec<u32> {
        let mut delivered = Vec::new();
        for &(seq, values) in receipts {
            buffer.feed(seq, group(values), |v| delivered.push(v));
        }
        delivered
    }

    #[test]
    fn in_order_receipts_pass_through() {
        let mut buffer = ReorderBuffer::default();
        let delivered = feed_all(&mut buffer, &[(1, &[10, 11]), (2, &[20]), (3, &[30])]);
        assert_eq!(delivered, [10, 11, 20, 30]);
    }

    #[test]
    fn out_of_order_receipts_are_held_back() {
        let mut buffer = ReorderBuffer::default();
        let delivered = feed_all(&mut buffer, &[(3, &[30]), (2, &[20, 21])]);
        assert!(delivered.is_empty());
        let delivered = feed_all(&mut buffer, &[(1, &[10])]);
        assert_eq!(delivered, [10, 20, 21, 30]);
    }

    #[test]
    fn gap_drains_only_the_contiguous_prefix() {
        let mut buffer = ReorderBuffer::default();
        let delivered = feed_all(&mut buffer, &[(2, &[20]), (5, &[50]), (1, &[10])]);
        assert_eq!(delivered, [10, 20]);
        let delivered = feed_all(&mut buffer, &[(4, &[40]), (3, &[30])]);
        assert_eq!(delivered, [30, 40, 50]);
    }

    #[test]
    fn grouped_values_stay_in_chunk_order() {
        let mut buffer = ReorderBuffer::default();
        let delivered = feed_all(&mut buffer, &[(2, &[9, 8, 7]), (1, &[1, 2, 3])]);
        assert_eq!(delivered, [1, 2, 3, 9, 8, 7]);
    }
}
