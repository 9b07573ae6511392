//! Lattice agreement: propose/ack/nack rounds deciding comparable sets.

pub mod agreement;
pub mod message;

pub use agreement::{LatticeAgreement, MAX_IN_FLIGHT as MAX_PROPOSALS_IN_FLIGHT};
pub use message::{LatticeMessage, MessageKind};
