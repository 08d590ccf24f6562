//! Beacon scheduling through the alarm interrupt.

use datapath_e2e::*;
use skylark_wlan::hal::{mask, SoftHal};
use skylark_wlan::types::tu_to_tsf;
use skylark_wlan::Device;

fn alarm(dev: &Device<SoftHal>, stack: &mut Stack) -> skylark_wlan::intr::Pending {
    dev.with_hal(|hal| hal.raise_irq(mask::SWBA));
    let pending = dev.interrupt(stack);
    dev.service(pending, stack);
    pending
}

#[test]
fn alarm_transmits_the_armed_beacon() {
    let (dev, vap, _peer) = ap_with_station();
    let mut stack = Stack::default();
    dev.beacon_alloc(vap, &mut stack).unwrap();

    // Slot 0 transmits in the last quarter of the interval.
    dev.with_hal(|hal| hal.set_tsf(tu_to_tsf(80)));
    alarm(&dev, &mut stack);
    assert_eq!(dev.stats_snapshot().beacons_sent, 1);
}

#[test]
fn alarm_before_arming_does_nothing() {
    let (dev, _vap, _peer) = ap_with_station();
    let mut stack = Stack::default();
    // SWBA is still masked, nothing is armed.
    dev.with_hal(|hal| hal.raise_irq(mask::SWBA));
    let pending = dev.interrupt(&mut stack);
    assert!(!pending.any());
    assert_eq!(dev.stats_snapshot().beacons_sent, 0);
}

#[test]
fn dtim_flushes_multicast_behind_the_beacon() {
    let (dev, vap, _peer) = ap_with_station();
    let mut stack = Stack::default();
    dev.beacon_alloc(vap, &mut stack).unwrap();

    // A station in power save makes group traffic wait for the DTIM.
    rx_frame(&dev, &mut stack, &sta_frame(0, 1, true));
    let bcast = {
        let mut f = ap_frame(0, 2);
        f[4..10].copy_from_slice(&[0xff; 6]);
        f
    };
    dev.transmit(vap, None, bcast).unwrap();
    assert_eq!(dev.stats_snapshot().cab_queued, 0);

    stack.next_dtim = true;
    dev.with_hal(|hal| hal.set_tsf(tu_to_tsf(80)));
    alarm(&dev, &mut stack);
    let s = dev.stats_snapshot();
    assert_eq!(s.beacons_sent, 1);
    assert_eq!(s.cab_queued, 1);
}

#[test]
fn stuck_beacon_queue_triggers_a_reset() {
    let (dev, vap, _peer) = ap_with_station();
    let mut stack = Stack::default();
    dev.beacon_alloc(vap, &mut stack).unwrap();

    // The beacon queue is allocated first, so it is hardware queue 0.
    dev.with_hal(|hal| hal.set_tx_pending(0, 1));

    let threshold = test_config().bstuck_threshold;
    for i in 1..threshold {
        let pending = alarm(&dev, &mut stack);
        assert!(!pending.beacon_stuck, "interval {i}");
    }
    let pending = alarm(&dev, &mut stack);
    assert!(pending.beacon_stuck);
    let s = dev.stats_snapshot();
    assert_eq!(s.beacon_busy, threshold);
    assert_eq!(s.beacon_stuck_resets, 1);
    assert_eq!(s.resets, 1);
}

#[test]
fn bmiss_interrupt_reaches_the_stack() {
    let dev = Device::new(
        SoftHal::new(),
        skylark_wlan::Config {
            op_mode: skylark_wlan::OpMode::Station,
            ..test_config()
        },
    )
    .unwrap();
    dev.start().unwrap();
    let mut stack = Stack::default();
    dev.with_hal(|hal| hal.raise_irq(mask::BMISS));
    let pending = dev.interrupt(&mut stack);
    dev.service(pending, &mut stack);
    assert_eq!(stack.beacon_misses, 1);
    assert_eq!(dev.stats_snapshot().intr_bmiss, 1);
}
