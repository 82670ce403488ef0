//! The mode decision table.

use tillsync_types::ResilienceMode;

/// Derives the operating mode from the current reachability inputs.
///
/// Precedence is strict: cloud beats edge beats mesh beats device,
/// regardless of how healthy the lower tier looks. A joined mesh with
/// no peers is worthless, so it falls through to device.
#[must_use]
pub fn decide_mode(
    cloud_reachable: bool,
    edge_reachable: bool,
    mesh_active: bool,
    peer_count: usize,
) -> ResilienceMode {
    if cloud_reachable {
        ResilienceMode::Online
    } else if edge_reachable {
        ResilienceMode::Edge
    } else if mesh_active && peer_count > 0 {
        ResilienceMode::Mesh
    } else {
        ResilienceMode::Device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_always_wins() {
        assert_eq!(decide_mode(true, true, true, 5), ResilienceMode::Online);
        assert_eq!(decide_mode(true, false, false, 0), ResilienceMode::Online);
    }

    #[test]
    fn edge_beats_mesh() {
        assert_eq!(decide_mode(false, true, true, 2), ResilienceMode::Edge);
    }

    #[test]
    fn mesh_requires_peers() {
        assert_eq!(decide_mode(false, false, true, 1), ResilienceMode::Mesh);
        assert_eq!(decide_mode(false, false, true, 0), ResilienceMode::Device);
    }

    #[test]
    fn everything_down_is_device() {
        assert_eq!(decide_mode(false, false, false, 0), ResilienceMode::Device);
    }
}
