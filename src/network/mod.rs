//! Datagram transport: the wire codec and the perfect-link layer above UDP.

pub mod codec;
pub mod link;

pub use codec::{Datagram, WireError, MAX_CHUNKS, MAX_DATAGRAM_SIZE};
pub use link::{LinkError, PerfectLink, RESEND_INTERVAL};
