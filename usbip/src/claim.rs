//! The device-claim seam: a hook for platform integration (e.g. a privileged
//! System Extension) to seize a device's interfaces before import succeeds.
//!
//! This crate only defines the contract. Packaging, code-signing, and the
//! actual interface-seizure mechanism live outside the core.

use std::collections::HashSet;
use std::sync::Mutex;

/// `is_claimed`/`claim` over a set of busIDs.
pub trait DeviceClaim: Send + Sync {
    /// Whether `bus_id` is already claimed.
    fn is_claimed(&self, bus_id: &str) -> bool;

    /// Claims `bus_id`. Idempotent: claiming an already-claimed device
    /// succeeds. Returns `false` if the claim could not be made.
    fn claim(&mut self, bus_id: &str) -> bool;
}

/// A claim manager with no platform integration: every claim trivially
/// succeeds and nothing is ever considered claimed. This is the default when
/// `autoBindDevices` is off and no external claim mechanism is wired in.
#[derive(Default)]
pub struct NoopClaim;

impl DeviceClaim for NoopClaim {
    fn is_claimed(&self, _bus_id: &str) -> bool {
        false
    }

    fn claim(&mut self, _bus_id: &str) -> bool {
        true
    }
}

/// An in-memory claim manager suitable for the in-process, non-System
/// Extension case: once claimed, a busID stays claimed until released.
#[derive(Default)]
pub struct InMemoryClaim {
    claimed: Mutex<HashSet<String>>,
}

impl DeviceClaim for InMemoryClaim {
    fn is_claimed(&self, bus_id: &str) -> bool {
        self.claimed.lock().unwrap().contains(bus_id)
    }

    fn claim(&mut self, bus_id: &str) -> bool {
        self.claimed.lock().unwrap().insert(bus_id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_claim_always_succeeds_and_never_reports_claimed() {
        let mut claim = NoopClaim;
        assert!(claim.claim("1-1"));
        assert!(!claim.is_claimed("1-1"));
    }

    #[test]
    fn in_memory_claim_is_idempotent() {
        let mut claim = InMemoryClaim::default();
        assert!(claim.claim("1-1"));
        assert!(claim.claim("1-1"));
        assert!(claim.is_claimed("1-1"));
        assert!(!claim.is_claimed("1-2"));
    }
}
