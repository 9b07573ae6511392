//! The static process group: id to socket address, identical on every node.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::core::id::ProcessId;

/// Addresses of every process in the group, our own included. Built once at
/// startup from the hosts file and never mutated.
#[derive(Debug, Clone)]
pub struct Membership {
    addrs: HashMap<ProcessId, SocketAddr>,
}

impl Membership {
    pub fn new(addrs: HashMap<ProcessId, SocketAddr>) -> Self {
        Self { addrs }
    }

    /// Group size N.
    #[inline]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Smallest quorum that intersects every other quorum: `N / 2 + 1`.
    #[inline]
    pub fn majority(&self) -> usize {
        self.addrs.len() / 2 + 1
    }

    #[inline]
    pub fn addr_of(&self, process: ProcessId) -> Option<SocketAddr> {
        self.addrs.get(&process).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessId, SocketAddr)> + '_ {
        self.addrs.iter().map(|(id, addr)| (*id, *addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(n: u8) -> Membership {
        let addrs = (1..=n)
            .map(|id| (id, format!("127.0.0.1:{}", 9000 + id as u16).parse().unwrap()))
            .collect();
        Membership::new(addrs)
    }

    #[test]
    fn majority_is_floor_half_plus_one() {
        assert_eq!(group(1).majority(), 1);
        assert_eq!(group(2).majority(), 2);
        assert_eq!(group(3).majority(), 2);
        assert_eq!(group(4).majority(), 3);
        assert_eq!(group(5).majority(), 3);
    }

    #[test]
    fn lookup_by_id() {
        let membership = group(3);
        assert_eq!(
            membership.addr_of(2),
            Some("127.0.0.1:9002".parse().unwrap())
        );
        assert_eq!(membership.addr_of(4), None);
    }
}
