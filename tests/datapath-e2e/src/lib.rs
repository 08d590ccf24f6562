//! Shared harness for the data-path end-to-end tests.
//!
//! Everything here drives the driver through its public surface only:
//! frames enter through the receive ring head (the loopback self-test
//! hook) and interrupts are raised on the software HAL.

use skylark_wlan::hal::{RxStatus, SoftHal};
use skylark_wlan::upper::{BeaconUpdate, UpperLayer};
use skylark_wlan::{frame, Config, Device, MacAddr, OpMode, PeerId, VapId};

pub const AP_MAC: MacAddr = MacAddr([0x02, 0x10, 0x20, 0x30, 0x40, 0x50]);
pub const STA_MAC: MacAddr = MacAddr([0x02, 0x01, 0x02, 0x03, 0x04, 0x05]);

/// Records every callback from the driver.
#[derive(Default)]
pub struct Stack {
    pub received: Vec<(Option<PeerId>, Vec<u8>)>,
    pub beacon_misses: u32,
    pub michael_failures: u32,
    pub tim_changes: Vec<(PeerId, bool)>,
    pub ps_changes: Vec<(PeerId, bool)>,
    pub next_dtim: bool,
}

impl UpperLayer for Stack {
    fn receive(&mut self, peer: Option<PeerId>, frame: &[u8], _status: &RxStatus) {
        self.received.push((peer, frame.to_vec()));
    }

    fn michael_failure(&mut self, _frame: &[u8], _key_index: Option<u16>) {
        self.michael_failures += 1;
    }

    fn build_beacon(&mut self, _vap: VapId) -> Vec<u8> {
        let mut f = vec![0u8; 72];
        f[0] = 0x80;
        f
    }

    fn update_beacon(&mut self, _vap: VapId, _frame: &mut Vec<u8>, _mcast_pending: bool) -> BeaconUpdate {
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

pub fn test_config() -> Config {
    Config {
        pool_size: 48,
        pool_low_water: 4,
        rx_ring_size: 8,
        rx_buf_size: 512,
        max_peers: 8,
        ..Config::default()
    }
}

/// Started access point with one VAP and one associated station.
pub fn ap_with_station() -> (Device<SoftHal>, VapId, PeerId) {
    let dev = Device::new(SoftHal::new(), test_config()).unwrap();
    dev.start().unwrap();
    let vap = dev.add_vap(OpMode::HostAp, AP_MAC).unwrap();
    let peer = dev.add_peer(vap, STA_MAC).unwrap();
    (dev, vap, peer)
}

/// A QoS data frame from the station, optionally carrying the PM bit.
pub fn sta_frame(tid: u8, seq: u16, pm: bool) -> Vec<u8> {
    let mut f = frame::make_qos_data(AP_MAC, STA_MAC, tid, seq, &[0u8; 20]);
    if pm {
        f[1] |= frame::FC1_PWR_MGT;
    }
    f
}

pub fn ap_frame(tid: u8, seq: u16) -> Vec<u8> {
    frame::make_qos_data(STA_MAC, AP_MAC, tid, seq, &[0u8; 20])
}

/// Feed one frame through the receive ring as if the hardware had
/// DMA'd it, then deliver the receive interrupt.
pub fn rx_frame(dev: &Device<SoftHal>, stack: &mut Stack, f: &[u8]) {
    let id = dev
        .with_rx_head(|buf| {
            buf.mark_driver_owned();
            buf.payload_mut()[..f.len()].copy_from_slice(f);
            buf.mark_device_owned();
            buf.index()
        })
        .expect("receive ring is empty");
    dev.with_hal(|hal| {
        hal.complete_rx(id, RxStatus::clean(f.len() + frame::CRC_LEN));
        hal.raise_irq(skylark_wlan::hal::mask::RX);
    });
    let pending = dev.interrupt(stack);
    dev.service(pending, stack);
}
