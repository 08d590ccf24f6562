//! Transmit round trips and error recovery through the interrupt path.

use datapath_e2e::*;
use skylark_wlan::hal::{mask, Hal, SoftHal};
use skylark_wlan::Device;

fn service_tx(dev: &Device<SoftHal>, stack: &mut Stack) {
    dev.with_hal(|hal| hal.raise_irq(mask::TX));
    let pending = dev.interrupt(stack);
    dev.service(pending, stack);
}

#[test]
fn transmit_complete_reclaim_cycle() {
    let (dev, vap, peer) = ap_with_station();
    let mut stack = Stack::default();
    dev.with_hal(|hal| hal.complete_all_tx = true);

    // One frame per access category.
    for (i, tid) in [0u8, 1, 4, 6].iter().enumerate() {
        dev.transmit(vap, Some(peer), ap_frame(*tid, i as u16)).unwrap();
    }
    service_tx(&dev, &mut stack);
    let s = dev.stats_snapshot();
    assert_eq!(s.tx_frames, 4);
    assert_eq!(s.tx_ok, 4);

    // The rings restart cleanly for a second round.
    dev.transmit(vap, Some(peer), ap_frame(0, 10)).unwrap();
    service_tx(&dev, &mut stack);
    assert_eq!(dev.stats_snapshot().tx_ok, 5);
    assert!(dev.tx_ready());
}

#[test]
fn fatal_interrupt_forces_a_full_recovery() {
    let (dev, vap, peer) = ap_with_station();
    let mut stack = Stack::default();

    // A frame is in flight when the chip falls over.
    dev.transmit(vap, Some(peer), ap_frame(0, 1)).unwrap();
    dev.with_hal(|hal| hal.raise_irq(mask::FATAL));
    let pending = dev.interrupt(&mut stack);
    assert!(pending.fatal);
    assert_eq!(dev.with_hal(|hal| hal.interrupt_mask()), 0);

    dev.service(pending, &mut stack);
    let s = dev.stats_snapshot();
    assert_eq!(s.resets, 1);
    assert_eq!(s.intr_fatal, 1);
    assert!(dev.with_hal(|hal| hal.rx_running()));
    assert_ne!(dev.with_hal(|hal| hal.interrupt_mask()), 0);

    // The in-flight frame was dropped, and the path works again.
    dev.with_hal(|hal| hal.complete_all_tx = true);
    dev.transmit(vap, Some(peer), ap_frame(0, 2)).unwrap();
    service_tx(&dev, &mut stack);
    assert_eq!(dev.stats_snapshot().tx_ok, 1);
}

#[test]
fn rx_overrun_recovers_like_fatal() {
    let (dev, _vap, _peer) = ap_with_station();
    let mut stack = Stack::default();
    dev.with_hal(|hal| hal.raise_irq(mask::RXORN));
    let pending = dev.interrupt(&mut stack);
    assert!(pending.rx_overrun);
    dev.service(pending, &mut stack);
    let s = dev.stats_snapshot();
    assert_eq!(s.intr_rxorn, 1);
    assert_eq!(s.resets, 1);

    // Receive still works after the reset.
    rx_frame(&dev, &mut stack, &sta_frame(0, 1, false));
    assert_eq!(stack.received.len(), 1);
}

#[test]
fn watchdog_resets_a_stuck_queue() {
    let (dev, vap, peer) = ap_with_station();
    let mut stack = Stack::default();

    // Queued but never completed by the hardware.
    dev.transmit(vap, Some(peer), ap_frame(0, 1)).unwrap();
    dev.watchdog(&mut stack);
    assert_eq!(dev.stats_snapshot().resets, 0);
    dev.watchdog(&mut stack);
    assert_eq!(dev.stats_snapshot().resets, 1);

    dev.with_hal(|hal| hal.complete_all_tx = true);
    dev.transmit(vap, Some(peer), ap_frame(0, 2)).unwrap();
    service_tx(&dev, &mut stack);
    assert_eq!(dev.stats_snapshot().tx_ok, 1);
}

#[test]
fn tx_underrun_raises_the_trigger_level() {
    let (dev, _vap, _peer) = ap_with_station();
    let mut stack = Stack::default();
    dev.with_hal(|hal| hal.raise_irq(mask::TXURN));
    let pending = dev.interrupt(&mut stack);
    dev.service(pending, &mut stack);
    assert_eq!(dev.with_hal(|hal| hal.trigger_level_raises()), 1);
}
