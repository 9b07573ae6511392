//! # Argonaut
//!
//! Message-passing abstractions for a fixed group of processes over lossy
//! UDP, layered from exactly-once unicast up to one-shot lattice agreement.
//!
//! ## Layers
//!
//! - [`PerfectLink`] - reliable exactly-once unicast with stop-and-retransmit
//! - [`BestEffortBroadcast`] - fan-out of link sends over the membership
//! - [`UniformReliableBroadcast`] - echo + majority-ack uniform agreement
//! - [`FifoBroadcast`] - per-sender ordering on top of URB
//! - [`LatticeAgreement`] - propose/ack/nack rounds deciding comparable sets
//!
//! ## Design Constraints
//!
//! - One bounded datagram per application message; at most 8 payload chunks
//!   packed per datagram
//! - Decoded metadata and payloads are borrowed views into the receive
//!   buffer; callbacks copy explicitly if they retain anything
//! - Hot-path map keys are packed `(process, seq_nr)` integers
//! - Failure model is fail-stop with a correct majority; delivery maps grow
//!   for the lifetime of the process
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use argonaut::prelude::*;
//!
//! # async fn run() -> Result<(), argonaut::network::LinkError> {
//! let membership = Membership::new(HashMap::from([
//!     (1, "127.0.0.1:11001".parse().unwrap()),
//!     (2, "127.0.0.1:11002".parse().unwrap()),
//!     (3, "127.0.0.1:11003".parse().unwrap()),
//! ]));
//!
//! let urb = UniformReliableBroadcast::new(1, membership);
//! urb.bind("127.0.0.1:11001".parse().unwrap()).await?;
//! urb.broadcast(&[&42u32.to_le_bytes()]).await?;
//! urb.listen(|sender, _seq_nr, payload| {
//!     println!("delivered {payload:?} from {sender}");
//! })
//! .await
//! # }
//! ```

pub mod app;
pub mod broadcast;
pub mod core;
pub mod lattice;
pub mod network;

/// Prelude for convenient imports of the primary API types.
pub mod prelude {
    pub use crate::broadcast::{BestEffortBroadcast, FifoBroadcast, UniformReliableBroadcast};
    pub use crate::core::{Membership, MessageId, ProcessId, SendGate, SeqNr};
    pub use crate::lattice::LatticeAgreement;
    pub use crate::network::{PerfectLink, MAX_CHUNKS, MAX_DATAGRAM_SIZE};
}

// Re-export primary types at the crate root for convenience.
pub use crate::broadcast::{BestEffortBroadcast, FifoBroadcast, UniformReliableBroadcast};
pub use crate::core::{Membership, MessageId, ProcessId, ProcessSet, SendGate, SeqNr};
pub use crate::lattice::LatticeAgreement;
pub use crate::network::{LinkError, PerfectLink, WireError, MAX_CHUNKS, MAX_DATAGRAM_SIZE};
