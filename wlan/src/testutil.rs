//! Shared fixtures for the in-crate tests.

use alloc::vec;
use alloc::vec::Vec;

use crate::device::{Config, Device};
use crate::hal::{RxStatus, SoftHal};
use crate::types::{MacAddr, OpMode, PeerId, VapId};
use crate::upper::{BeaconUpdate, UpperLayer};

pub(crate) const AP_MAC: MacAddr = MacAddr([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
pub(crate) const STA_MAC: MacAddr = MacAddr([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

/// Records every callback so tests can assert on what reached the stack.
#[derive(Default)]
pub(crate) struct TestUpper {
    pub received: Vec<(Option<PeerId>, Vec<u8>)>,
    pub monitor_frames: usize,
    pub michael_failures: usize,
    pub beacon_misses: u32,
    pub beacons_built: u32,
    pub beacons_updated: u32,
    pub tim_changes: Vec<(PeerId, bool)>,
    pub ps_changes: Vec<(PeerId, bool)>,
    /// Next update_beacon call reports a DTIM.
    pub next_dtim: bool,
}

impl UpperLayer for TestUpper {
    fn receive(&mut self, peer: Option<PeerId>, frame: &[u8], _status: &RxStatus) {
        self.received.push((peer, frame.to_vec()));
    }

    fn monitor_capture(&mut self, _frame: &[u8], _status: &RxStatus) {
        self.monitor_frames += 1;
    }

    fn michael_failure(&mut self, _frame: &[u8], _key_index: Option<u16>) {
        self.michael_failures += 1;
    }

    fn build_beacon(&mut self, _vap: VapId) -> Vec<u8> {
        self.beacons_built += 1;
        let mut f = vec![0u8; 64];
        f[0] = 0x80; // management / beacon
        f
    }

    fn update_beacon(&mut self, _vap: VapId, _frame: &mut Vec<u8>, _mcast_pending: bool) -> BeaconUpdate {
        self.beacons_updated += 1;
        BeaconUpdate { is_dtim: self.next_dtim }
    }

    fn beacon_miss(&mut self) {
        self.beacon_misses += 1;
    }

    fn set_tim(&mut self, peer: PeerId, set: bool) {
        self.tim_changes.push((peer, set));
    }

    fn node_ps_change(&mut self, peer: PeerId, sleeping: bool) {
        self.ps_changes.push((peer, sleeping));
    }
}

pub(crate) fn small_config() -> Config {
    Config {
        pool_size: 32,
        pool_low_water: 4,
        rx_ring_size: 8,
        rx_buf_size: 256,
        max_vaps: 4,
        max_peers: 8,
        ..Config::default()
    }
}

/// A started access-point device with one VAP.
pub(crate) fn ap_device() -> (Device<SoftHal>, VapId) {
    let dev = Device::new(SoftHal::new(), small_config()).unwrap();
    dev.start().unwrap();
    let vap = dev.add_vap(OpMode::HostAp, AP_MAC).unwrap();
    (dev, vap)
}
