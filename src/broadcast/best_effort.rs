//! Best-effort broadcast: one perfect-link send per group member.

use std::net::SocketAddr;

use crate::core::id::{ProcessId, SeqNr};
use crate::core::membership::Membership;
use crate::network::link::{LinkError, PerfectLink};

/// Fan-out of perfect-link sends over the whole membership, self included.
/// Carries no per-broadcast state; reliability below comes from the link,
/// agreement above from URB.
pub struct BestEffortBroadcast {
    link: PerfectLink,
    membership: Membership,
}

impl BestEffortBroadcast {
    pub fn new(id: ProcessId, membership: Membership) -> Self {
        Self {
            link: PerfectLink::new(id),
            membership,
        }
    }

    #[inline]
    pub fn id(&self) -> ProcessId {
        self.link.id()
    }

    #[inline]
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub async fn bind(&self, addr: SocketAddr) -> Result<(), LinkError> {
        self.link.bind(addr).await
    }

    /// Sends the same metadata and payloads to every known process.
    pub fn broadcast(&self, metadata: &[u8], payloads: &[&[u8]]) -> Result<(), LinkError> {
        for (_, addr) in self.membership.iter() {
            self.link.send(addr, metadata, payloads)?;
        }
        Ok(())
    }

    /// Unicast pass-through.
    pub fn send(
        &self,
        dst: SocketAddr,
        metadata: &[u8],
        payloads: &[&[u8]],
    ) -> Result<SeqNr, LinkError> {
        self.link.send(dst, metadata, payloads)
    }

    pub async fn listen<F>(&self, callback: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, &[u8]) + Send,
    {
        self.link.listen(callback).await
    }

    pub async fn listen_batch<F>(&self, callback: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, &[u8], &[&[u8]]) + Send,
    {
        self.link.listen_batch(callback).await
    }

    pub fn shutdown(&self) {
        self.link.shutdown();
    }
}
