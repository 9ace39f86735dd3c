//! Port allocation for function workers
//!
//! Ports are handed out from a single cursor that only moves forward, so no
//! two workers ever share a port for the lifetime of the router, even after a
//! worker dies and its function is respawned.

use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("worker port space exhausted (next port would be {next})")]
pub struct PortsExhausted {
    pub next: u32,
}

/// Monotonic port cursor
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            next: AtomicU32::new(u32::from(base)),
        }
    }

    /// Return the current cursor value and advance it
    pub fn allocate(&self) -> Result<u16, PortsExhausted> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |port| {
                (port <= u32::from(u16::MAX)).then_some(port + 1)
            })
            .map(|port| port as u16)
            .map_err(|next| PortsExhausted { next })
    }

    /// Number of ports handed out so far
    pub fn allocated(&self) -> u32 {
        self.next.load(Ordering::SeqCst) - u32::from(self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_allocation_is_monotonic() {
        let ports = PortAllocator::new(9100);

        assert_eq!(ports.allocate(), Ok(9100));
        assert_eq!(ports.allocate(), Ok(9101));
        assert_eq!(ports.allocate(), Ok(9102));
        assert_eq!(ports.allocated(), 3);
    }

    #[test]
    fn test_exhaustion_at_top_of_range() {
        let ports = PortAllocator::new(u16::MAX - 1);

        assert_eq!(ports.allocate(), Ok(u16::MAX - 1));
        assert_eq!(ports.allocate(), Ok(u16::MAX));
        assert_eq!(
            ports.allocate(),
            Err(PortsExhausted {
                next: u32::from(u16::MAX) + 1
            })
        );
        // Stays exhausted
        assert!(ports.allocate().is_err());
    }

    #[test]
    fn test_concurrent_allocations_never_repeat() {
        let ports = Arc::new(PortAllocator::new(20000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..100).map(|_| ports.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(ports.allocated(), 800);
    }
}
