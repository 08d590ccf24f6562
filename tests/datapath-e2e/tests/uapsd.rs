//! Power-save delivery, end to end: PM transitions, triggers, service
//! periods and overflow handling, all driven through frames and
//! interrupts.

use datapath_e2e::*;
use skylark_wlan::hal::mask;

fn complete_tx(dev: &skylark_wlan::Device<skylark_wlan::hal::SoftHal>, stack: &mut Stack) {
    dev.with_hal(|hal| {
        hal.complete_all_tx = true;
        hal.raise_irq(mask::TX);
    });
    let pending = dev.interrupt(stack);
    dev.service(pending, stack);
}

#[test]
fn full_service_period_cycle() {
    let (dev, vap, peer) = ap_with_station();
    dev.configure_peer_uapsd(peer, [true; 4], 2).unwrap();
    let mut stack = Stack::default();

    // Station announces power save with the PM bit.
    rx_frame(&dev, &mut stack, &sta_frame(0, 1, true));
    assert_eq!(stack.ps_changes, vec![(peer, true)]);

    // Downlink frames are held, not transmitted.
    for i in 0..3 {
        dev.transmit(vap, Some(peer), ap_frame(6, 10 + i)).unwrap();
    }
    assert_eq!(dev.stats_snapshot().tx_frames, 0);

    // Trigger on a delivery-enabled category: one service period of
    // max_sp frames goes out in a single burst.
    rx_frame(&dev, &mut stack, &sta_frame(6, 2, true));
    assert_eq!(dev.stats_snapshot().uapsd_triggers, 1);

    // Hardware finishes the burst; reclaim closes the period and
    // promotes the overflow frame.
    complete_tx(&dev, &mut stack);
    let s = dev.stats_snapshot();
    assert_eq!(s.uapsd_eosp, 1);
    assert_eq!(s.tx_ok, 2);

    // Second trigger drains the remainder. With nothing left behind it,
    // the TIM bit is cleared.
    rx_frame(&dev, &mut stack, &sta_frame(6, 3, true));
    assert!(stack.tim_changes.contains(&(peer, false)));
    complete_tx(&dev, &mut stack);
    let s = dev.stats_snapshot();
    assert_eq!(s.uapsd_eosp, 2);
    assert_eq!(s.tx_ok, 3);
    assert_eq!(s.uapsd_qos_null, 0);

    // Station wakes; the driver reports the transition.
    rx_frame(&dev, &mut stack, &sta_frame(0, 4, false));
    assert!(stack.ps_changes.contains(&(peer, false)));
}

#[test]
fn trigger_with_nothing_buffered_gets_a_qos_null() {
    let (dev, _vap, peer) = ap_with_station();
    dev.configure_peer_uapsd(peer, [true; 4], 4).unwrap();
    let mut stack = Stack::default();

    rx_frame(&dev, &mut stack, &sta_frame(0, 1, true));
    rx_frame(&dev, &mut stack, &sta_frame(6, 2, true));
    let s = dev.stats_snapshot();
    assert_eq!(s.uapsd_triggers, 1);
    assert_eq!(s.uapsd_qos_null, 1);

    complete_tx(&dev, &mut stack);
    assert_eq!(dev.stats_snapshot().uapsd_eosp, 1);
}

#[test]
fn retried_trigger_frame_is_not_a_new_trigger() {
    let (dev, _vap, peer) = ap_with_station();
    dev.configure_peer_uapsd(peer, [true; 4], 2).unwrap();
    let mut stack = Stack::default();

    rx_frame(&dev, &mut stack, &sta_frame(0, 1, true));
    rx_frame(&dev, &mut stack, &sta_frame(6, 5, true));
    complete_tx(&dev, &mut stack);

    // The station retransmits the same trigger; the period it started
    // has already been served.
    let mut retry = sta_frame(6, 5, true);
    retry[1] |= skylark_wlan::frame::FC1_RETRY;
    rx_frame(&dev, &mut stack, &retry);

    let s = dev.stats_snapshot();
    assert_eq!(s.uapsd_triggers, 1);
    assert_eq!(s.uapsd_dup_triggers, 1);
}

#[test]
fn trigger_on_non_delivery_category_is_ignored() {
    let (dev, _vap, peer) = ap_with_station();
    // Only voice is delivery-enabled.
    dev.configure_peer_uapsd(peer, [false, false, false, true], 2)
        .unwrap();
    let mut stack = Stack::default();

    rx_frame(&dev, &mut stack, &sta_frame(0, 1, true));
    rx_frame(&dev, &mut stack, &sta_frame(0, 2, true));
    let s = dev.stats_snapshot();
    assert_eq!(s.uapsd_triggers, 0);
    assert_eq!(s.uapsd_ignored_triggers, 1);
}

#[test]
fn overflow_past_both_queues_evicts_one_frame() {
    let (dev, vap, peer) = ap_with_station();
    dev.configure_peer_uapsd(peer, [true; 4], 2).unwrap();
    let mut stack = Stack::default();
    rx_frame(&dev, &mut stack, &sta_frame(0, 1, true));

    // Delivery and overflow hold two frames each; the fifth send makes
    // room by dropping the oldest overflow frame.
    for i in 0..5 {
        dev.transmit(vap, Some(peer), ap_frame(6, 20 + i)).unwrap();
    }
    assert_eq!(dev.stats_snapshot().uapsd_overflow_evictions, 1);
}
