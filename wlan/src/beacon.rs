//! Beacon scheduling.
//!
//! Beacons live outside the normal transmit path: one long-lived buffer
//! per beaconing VAP, re-armed from the software beacon alarm (SWBA)
//! rather than reclaimed through completion interrupts. With multiple
//! VAPs the interval is either staggered, one VAP per alarm with its TSF
//! offset pre-written into the frame, or burst, all beacons chained onto
//! the hardware queue at once.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use desc_pool::BufId;

use crate::device::Device;
use crate::error::{Result, WlanError};
use crate::frame;
use crate::hal::{mask, Hal, TxDescSetup};
use crate::types::{tsf_to_tu, tu_to_tsf, VapId};
use crate::upper::UpperLayer;
use crate::vap::{BeaconState, Vap};

/// Slot-time changes are announced in a beacon before they take effect,
/// so the switch is staged across two beacon intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SlotPhase {
    #[default]
    Stable,
    /// Change requested; the next beacon carries the announcement.
    Update,
    /// Announcement sent; apply when the staging slot comes around again,
    /// giving every VAP a full interval of notice.
    Commit,
}

#[derive(Debug, Default)]
pub(crate) struct SlotState {
    pub(crate) phase: SlotPhase,
    pub(crate) short: bool,
    /// Beacon slot current when the change was staged.
    pub(crate) slotupdate: usize,
}

impl<H: Hal> Device<H> {
    /// Build and arm the beacon for one VAP. Safe to call again to pick
    /// up template changes; the old buffer is replaced.
    pub fn beacon_alloc(&self, vap_id: VapId, upper: &mut dyn UpperLayer) -> Result<()> {
        let vap = self
            .vaps
            .lock()
            .get(vap_id)
            .ok_or(WlanError::UnknownVap(vap_id))?;
        if !vap.is_beaconing() {
            return Err(WlanError::InvalidState("not a beaconing interface"));
        }

        let mut payload = upper.build_beacon(vap_id);
        self.write_tsf_adjust(&vap, &mut payload);
        let rate = self.rate.lock().select(None, payload.len(), true);

        let old = vap.state.lock().beacon_buf.take();
        let id = {
            let mut pool = self.pool.lock();
            if let Some(old) = old {
                if pool.get(old).is_device_owned() {
                    pool.get_mut(old).mark_driver_owned();
                }
                pool.release(old);
            }
            let Some(id) = pool.acquire() else {
                self.stats.lock().tx_no_buffer += 1;
                return Err(WlanError::Busy);
            };
            let buf = pool.get_mut(id);
            buf.set_payload(payload);
            self.hal
                .lock()
                .setup_tx_desc(pool.get_mut(id), &TxDescSetup::beacon(rate.rate));
            id
        };

        {
            let mut state = vap.state.lock();
            state.beacon_buf = Some(id);
            state.beacon_state = BeaconState::Armed;
        }

        // First beaconing VAP turns the alarm on.
        let im = self.imask.load(Ordering::Acquire) | mask::SWBA;
        self.imask.store(im, Ordering::Release);
        self.hal.lock().set_interrupt_mask(im);
        log::debug!("beacon armed for vap {} (slot {})", vap_id, vap.bslot);
        Ok(())
    }

    /// Staggered VAPs transmit early within the interval; the pre-written
    /// timestamp adjustment makes their TSF read as if they had sent at
    /// their own TBTT.
    fn write_tsf_adjust(&self, vap: &Arc<Vap>, payload: &mut [u8]) {
        if !self.cfg.stagger_beacons || vap.bslot == 0 {
            return;
        }
        let (intval, maxvaps) = {
            let vaps = self.vaps.lock();
            (vaps.beacon_interval as u32, vaps.max_vaps() as u32)
        };
        let tu = intval * (maxvaps - vap.bslot as u32) / maxvaps;
        if payload.len() >= frame::BEACON_TSTAMP + 8 {
            frame::set_beacon_timestamp(payload, tu_to_tsf(tu));
        }
    }

    /// Release beacon and multicast state when a VAP goes away. Clears
    /// the alarm once no beaconing VAP remains.
    pub(crate) fn beacon_teardown(&self, vap: &Arc<Vap>) {
        let (buf, mcast) = {
            let mut state = vap.state.lock();
            state.beacon_state = BeaconState::Stopped;
            (state.beacon_buf.take(), core::mem::take(&mut state.mcast))
        };
        let mut pool = self.pool.lock();
        if let Some(id) = buf {
            if pool.get(id).is_device_owned() {
                pool.get_mut(id).mark_driver_owned();
            }
            pool.release(id);
        }
        for id in mcast {
            pool.release(id);
        }
        drop(pool);
        if self.vaps.lock().beaconing_count() == 0 {
            let im = self.imask.load(Ordering::Acquire) & !mask::SWBA;
            self.imask.store(im, Ordering::Release);
            self.hal.lock().set_interrupt_mask(im);
        }
    }

    /// SWBA handler. Returns true when the beacon queue looks stuck and a
    /// deferred reset check should run.
    pub(crate) fn beacon_send(&self, upper: &mut dyn UpperLayer) -> bool {
        // Previous beacon still pending means we are either radio-busy or
        // wedged; skip this interval rather than stomp on live DMA.
        let pending = self.hal.lock().num_tx_pending(self.beacon_hwq);
        if pending != 0 {
            let misses = self.bmiss_count.fetch_add(1, Ordering::Relaxed) + 1;
            self.stats.lock().beacon_busy += 1;
            log::warn!("beacon queue busy, {misses} consecutive");
            return misses >= self.cfg.bstuck_threshold;
        }
        if self.bmiss_count.swap(0, Ordering::Relaxed) > 0 {
            log::info!("beacon transmission resumed");
        }

        let slot = self.current_slot();
        let mut chain: Vec<BufId> = Vec::new();
        if self.cfg.stagger_beacons {
            if let Some(vap) = self.staggered_slot_vap(slot) {
                if let Some(id) = self.beacon_generate(&vap, upper) {
                    chain.push(id);
                }
            }
        } else {
            let vaps: Vec<Arc<Vap>> = self
                .vaps
                .lock()
                .iter()
                .filter(|v| v.is_beaconing())
                .cloned()
                .collect();
            for vap in vaps {
                if let Some(id) = self.beacon_generate(&vap, upper) {
                    chain.push(id);
                }
            }
        }

        self.slot_time_step(slot);

        if chain.is_empty() {
            return false;
        }
        {
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            for pair in chain.windows(2) {
                pool.link(pair[0], pair[1]);
            }
            let last = chain[chain.len() - 1];
            pool.unlink(last);
            for &id in &chain {
                pool.get_mut(id).mark_device_owned();
            }
            hal.stop_tx(self.beacon_hwq);
            hal.put_tx_buf(self.beacon_hwq, chain[0]);
            hal.start_tx(self.beacon_hwq);
        }
        self.stats.lock().beacons_sent += chain.len() as u64;
        false
    }

    /// Beacon slot the TSF currently sits in.
    fn current_slot(&self) -> usize {
        let tsftu = tsf_to_tu(self.hal.lock().tsf());
        let vaps = self.vaps.lock();
        let intval = vaps.beacon_interval as u64;
        let maxvaps = vaps.max_vaps() as u64;
        if intval == 0 {
            return 0;
        }
        (((tsftu as u64 % intval) * maxvaps) / intval) as usize
    }

    /// Which VAP owns the current staggered beacon slot. Slots count down
    /// through the interval, and transmission is set up one slot early.
    fn staggered_slot_vap(&self, slot: usize) -> Option<Arc<Vap>> {
        let vaps = self.vaps.lock();
        vaps.by_bslot((slot + 1) % vaps.max_vaps())
    }

    /// Refresh one VAP's beacon contents and, on a DTIM, flush its
    /// multicast backlog onto the CAB queue behind the beacon.
    fn beacon_generate(&self, vap: &Arc<Vap>, upper: &mut dyn UpperLayer) -> Option<BufId> {
        let (id, mut payload, mcast_pending) = {
            let state = vap.state.lock();
            if state.beacon_state != BeaconState::Armed {
                return None;
            }
            let id = state.beacon_buf?;
            let mcast_pending = !state.mcast.is_empty();
            let mut pool = self.pool.lock();
            let buf = pool.get_mut(id);
            if buf.is_device_owned() {
                buf.mark_driver_owned();
            }
            (id, buf.take_payload()?, mcast_pending)
        };

        let update = upper.update_beacon(vap.id, &mut payload, mcast_pending);
        self.write_tsf_adjust(vap, &mut payload);
        let rate = self.rate.lock().select(None, payload.len(), true);

        {
            let mut pool = self.pool.lock();
            let buf = pool.get_mut(id);
            buf.set_payload(payload);
            self.hal
                .lock()
                .setup_tx_desc(pool.get_mut(id), &TxDescSetup::beacon(rate.rate));
        }

        if update.is_dtim && mcast_pending {
            self.cab_flush(vap);
        }
        Some(id)
    }

    /// Move a VAP's buffered multicast frames onto the content-after-
    /// beacon queue. All but the last carry MoreData; the queue is kicked
    /// once so the burst follows the beacon.
    fn cab_flush(&self, vap: &Arc<Vap>) {
        // With staggered beacons and several BSSes, frames from the last
        // DTIM may still sit on the queue. They are stale; drop them.
        if self.cfg.stagger_beacons && self.vaps.lock().beaconing_count() > 1 {
            let mut q = self.txqs[self.cab_ix].lock();
            if !q.is_empty() {
                self.hal.lock().stop_tx(q.hw_id());
                let mut pool = self.pool.lock();
                let dropped = q.force_drain(&mut *pool);
                log::debug!("dropped {dropped} stale multicast frames");
            }
        }

        let mcast: Vec<BufId> = {
            let mut state = vap.state.lock();
            core::mem::take(&mut state.mcast).into_iter().collect()
        };
        let count = mcast.len();
        {
            let mut q = self.txqs[self.cab_ix].lock();
            let mut rc = self.rate.lock();
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            for (i, id) in mcast.iter().copied().enumerate() {
                {
                    let buf = pool.get_mut(id);
                    let rate = rc.select(None, buf.payload().len(), true);
                    frame::set_more_data(buf.payload_mut(), i + 1 < count);
                    hal.setup_tx_desc(
                        buf,
                        &TxDescSetup {
                            no_ack: true,
                            ..TxDescSetup::normal(rate.rate, 1)
                        },
                    );
                }
                q.enqueue_gated(&mut *pool, &mut *hal, id);
            }
            q.kick(&mut *hal);
        }
        self.stats.lock().cab_queued += count as u64;
    }

    /// Ask for a slot-time change. Takes effect immediately with no
    /// beacons up, otherwise staged across the next two alarms.
    pub fn request_slot_time(&self, short: bool) {
        let mut slot = self.slot_state.lock();
        slot.short = short;
        if self.vaps.lock().beaconing_count() == 0 {
            self.hal.lock().set_slot_time(short);
            slot.phase = SlotPhase::Stable;
        } else {
            slot.phase = SlotPhase::Update;
        }
    }

    fn slot_time_step(&self, slot: usize) {
        let mut st = self.slot_state.lock();
        match st.phase {
            SlotPhase::Stable => {}
            SlotPhase::Update => {
                st.phase = SlotPhase::Commit;
                st.slotupdate = slot;
            }
            SlotPhase::Commit => {
                // Alarms for other slots pass by untouched; the change
                // lands one full interval after it was staged.
                if st.slotupdate == slot {
                    self.hal.lock().set_slot_time(st.short);
                    st.phase = SlotPhase::Stable;
                }
            }
        }
    }

    /// Deferred half of stuck-beacon handling: the interrupt path only
    /// counts misses, the reset happens here.
    pub(crate) fn bstuck_check(&self, upper: &mut dyn UpperLayer) {
        if self.bmiss_count.load(Ordering::Relaxed) < self.cfg.bstuck_threshold {
            return;
        }
        log::error!("beacon queue stuck, resetting");
        self.stats.lock().beacon_stuck_resets += 1;
        self.bmiss_count.store(0, Ordering::Relaxed);
        self.reset(upper, true);
    }
}
