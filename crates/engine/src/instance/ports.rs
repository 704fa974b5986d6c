//! UDP port allocation for SIP instances.

use std::net::UdpSocket;

use tracing::debug;

use crate::errors::{EngineError, Result};

/// Default first candidate port.
pub const DEFAULT_BASE_PORT: u16 = 5060;

/// Candidate ports advance in steps of two, leaving the odd port free for
/// RTCP-style pairing.
const PORT_STEP: u16 = 2;

/// Candidates probed per allocation before giving up.
const MAX_RETRIES: u32 = 10;

/// Hands out even UDP ports starting from a base, probing each candidate
/// with a short-lived bind so two instances never share a port.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    next: u16,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self { base, next: base }
    }

    /// Allocate the next free port. Ports already taken by other processes
    /// are skipped.
    pub fn allocate(&mut self) -> Result<u16> {
        for _ in 0..MAX_RETRIES {
            let candidate = self.next;
            self.next = self.next.saturating_add(PORT_STEP);

            match UdpSocket::bind(("127.0.0.1", candidate)) {
                Ok(probe) => {
                    drop(probe);
                    debug!(port = candidate, "allocated SIP port");
                    return Ok(candidate);
                }
                Err(err) => {
                    debug!(port = candidate, %err, "port probe failed, trying next");
                }
            }
        }
        Err(EngineError::PortsExhausted {
            retries: MAX_RETRIES,
        })
    }

    /// Rewind to the base port. Called after cleanup so the next run reuses
    /// the same range.
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_even_steps() {
        let mut alloc = PortAllocator::new(39060);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!(a, 39060);
        assert_eq!(b, 39062);
    }

    #[test]
    fn skips_occupied_ports() {
        let holder = UdpSocket::bind(("127.0.0.1", 39160)).unwrap();
        let mut alloc = PortAllocator::new(39160);
        let port = alloc.allocate().unwrap();
        assert_eq!(port, 39162);
        drop(holder);
    }

    #[test]
    fn reset_rewinds_to_base() {
        let mut alloc = PortAllocator::new(39260);
        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        alloc.reset();
        assert_eq!(alloc.allocate().unwrap(), 39260);
    }

    #[test]
    fn exhaustion_reports_retry_count() {
        let holders: Vec<UdpSocket> = (0..10)
            .map(|i| UdpSocket::bind(("127.0.0.1", 39360 + i * 2)).unwrap())
            .collect();
        let mut alloc = PortAllocator::new(39360);
        let err = alloc.allocate().unwrap_err();
        assert_eq!(err.to_string(), "failed to allocate port after 10 retries");
        drop(holders);
    }
}
