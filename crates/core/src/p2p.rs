//! Peer-access capability probing.

use crate::runtime::{DeviceMesh, PeerAccessError};

/// Check that every pair in `devices` can directly address each other's
/// memory, enabling access as a side effect.
///
/// Enabling an already-enabled pair is the idempotency case and counts as
/// success, so probing the same device set twice returns `true` both times.
/// Any other failure short-circuits to `false`; the dispatcher then routes
/// the call through the staged-copy fallback instead of surfacing an error.
pub fn can_enable_p2p(mesh: &DeviceMesh, devices: &[usize]) -> bool {
    for (i, &a) in devices.iter().enumerate() {
        for &b in &devices[i + 1..] {
            for (from, to) in [(a, b), (b, a)] {
                if !mesh.can_access_peer(from, to) {
                    tracing::debug!(from, to, "peer access not supported");
                    return false;
                }
                match mesh.enable_peer_access(from, to) {
                    Ok(()) => {}
                    Err(PeerAccessError::AlreadyEnabled) => {
                        tracing::trace!(from, to, "peer access already enabled");
                    }
                    Err(PeerAccessError::Unsupported) => {
                        tracing::warn!(from, to, "peer access enable failed");
                        return false;
                    }
                }
            }
        }
    }
    true
}
