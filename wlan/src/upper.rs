//! Upward interface to the protocol stack.

use alloc::vec::Vec;

use crate::hal::RxStatus;
use crate::types::{PeerId, VapId};

/// Result of regenerating a beacon body before transmission.
#[derive(Debug, Clone, Copy)]
pub struct BeaconUpdate {
    /// This beacon carries a DTIM; deferred multicast may follow it.
    pub is_dtim: bool,
}

/// Callbacks into the protocol stack.
///
/// Invoked from both interrupt-time and deferred paths; implementations
/// must not call back into the device.
pub trait UpperLayer {
    /// A frame cleared the receive pipeline. `frame` has the FCS trimmed.
    fn receive(&mut self, peer: Option<PeerId>, frame: &[u8], status: &RxStatus);

    /// Raw capture for monitor interfaces. Called for every completed
    /// receive descriptor, errored or not, before any filtering.
    fn monitor_capture(&mut self, _frame: &[u8], _status: &RxStatus) {}

    /// Michael MIC verification failed on a received frame.
    fn michael_failure(&mut self, _frame: &[u8], _key_index: Option<u16>) {}

    /// Produce the initial beacon body for a VAP.
    fn build_beacon(&mut self, vap: VapId) -> Vec<u8>;

    /// Refresh a beacon body in place (TIM bitmap and friends) just before
    /// it is handed to the hardware.
    fn update_beacon(&mut self, vap: VapId, frame: &mut Vec<u8>, mcast_pending: bool)
        -> BeaconUpdate;

    /// The hardware reported missed beacons from our AP (station mode).
    fn beacon_miss(&mut self) {}

    /// Set or clear a peer's TIM bit.
    fn set_tim(&mut self, _peer: PeerId, _set: bool) {}

    /// A peer changed power-save state.
    fn node_ps_change(&mut self, _peer: PeerId, _sleeping: bool) {}
}
