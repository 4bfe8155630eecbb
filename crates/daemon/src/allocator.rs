//! Client address allocation
//!
//! Addresses come from a configured linear range and are handed out lowest
//! first against the set currently in use. The pool itself is pure set
//! arithmetic; the provisioner serializes the scan-allocate-register sequence
//! so two concurrent issues can never observe the same free address.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use wirevend_common::{Error, Result};

/// A contiguous inclusive range of client addresses
#[derive(Debug, Clone, Copy)]
pub struct IpPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl IpPool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if u32::from(start) > u32::from(end) {
            return Err(Error::InvalidConfig(format!(
                "address pool start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn size(&self) -> usize {
        (u32::from(self.end) - u32::from(self.start) + 1) as usize
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        a >= u32::from(self.start) && a <= u32::from(self.end)
    }

    /// The lowest address in the range not present in `used`
    pub fn next_free(&self, used: &BTreeSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        for raw in u32::from(self.start)..=u32::from(self.end) {
            let addr = Ipv4Addr::from(raw);
            if !used.contains(&addr) {
                return Ok(addr);
            }
        }
        Err(Error::PoolExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> IpPool {
        IpPool::new(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 6)).unwrap()
    }

    #[test]
    fn test_lowest_free_first() {
        let p = pool();
        let mut used = BTreeSet::new();
        assert_eq!(p.next_free(&used).unwrap(), Ipv4Addr::new(10, 0, 0, 2));

        used.insert(Ipv4Addr::new(10, 0, 0, 2));
        used.insert(Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(p.next_free(&used).unwrap(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_holes_are_reused() {
        let p = pool();
        let used: BTreeSet<_> = [
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
            Ipv4Addr::new(10, 0, 0, 5),
        ]
        .into_iter()
        .collect();
        assert_eq!(p.next_free(&used).unwrap(), Ipv4Addr::new(10, 0, 0, 4));
    }

    #[test]
    fn test_exhaustion() {
        let p = pool();
        let mut used = BTreeSet::new();
        for _ in 0..p.size() {
            let addr = p.next_free(&used).unwrap();
            assert!(p.contains(addr));
            assert!(used.insert(addr), "allocator returned a used address");
        }
        assert!(matches!(p.next_free(&used), Err(Error::PoolExhausted)));
    }

    #[test]
    fn test_foreign_addresses_ignored() {
        let p = pool();
        // Addresses outside the range never block allocation
        let used: BTreeSet<_> = [Ipv4Addr::new(192, 168, 1, 1)].into_iter().collect();
        assert_eq!(p.next_free(&used).unwrap(), Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_range_crossing_octet() {
        let p = IpPool::new(Ipv4Addr::new(10, 0, 0, 250), Ipv4Addr::new(10, 0, 1, 5)).unwrap();
        assert_eq!(p.size(), 12);
        let used: BTreeSet<_> = (250..=255).map(|o| Ipv4Addr::new(10, 0, 0, o)).collect();
        assert_eq!(p.next_free(&used).unwrap(), Ipv4Addr::new(10, 0, 1, 0));
    }

    #[test]
    fn test_inverted_range_rejected() {
        assert!(IpPool::new(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 2)).is_err());
    }
}
