//! Device core.
//!
//! Owns every shared structure of the data path and enforces the lock
//! order documented in the crate root. Beacon scheduling lives in
//! `beacon.rs` and interrupt dispatch in `intr.rs`; both are `impl` blocks
//! on [`Device`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use desc_pool::{desc_flags, BufferPool};
use spin::Mutex;

use crate::error::{Result, WlanError};
use crate::frame;
use crate::hal::{Hal, PacketType, RxStatus, TxDescSetup, TxQueueKind, TxQueueParams};
use crate::keycache::{KeyCache, KeyMaterial, KeySlotGroup, GLOBAL_KEY_SLOTS};
use crate::node::{PeerNode, PeerTable};
use crate::ps::{self, TriggerVerdict};
use crate::rate::{FixedRate, RateControl};
use crate::rx::{classify, RxDrop, RxRing};
use crate::stats::DeviceStats;
use crate::txq::TxQueue;
use crate::types::{AccessCategory, Channel, HwQueueId, MacAddr, OpMode, PeerId, VapId};
use crate::upper::UpperLayer;
use crate::vap::VapTable;

/// Default WME channel-access parameters, indexed by access category.
const WME_DEFAULTS: [TxQueueParams; AccessCategory::COUNT] = [
    // Best effort
    TxQueueParams { aifs: 3, cw_min: 15, cw_max: 1023, burst_time: 0 },
    // Background
    TxQueueParams { aifs: 7, cw_min: 15, cw_max: 1023, burst_time: 0 },
    // Video
    TxQueueParams { aifs: 2, cw_min: 7, cw_max: 15, burst_time: 94 },
    // Voice
    TxQueueParams { aifs: 2, cw_min: 3, cw_max: 7, burst_time: 47 },
];

/// Consecutive watchdog ticks without reclaim progress before a queue is
/// declared stuck and the chip reset.
const TX_STUCK_TICKS: u32 = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub op_mode: OpMode,
    pub channel: Channel,
    /// Transmit/beacon/power-save buffer pool size.
    pub pool_size: usize,
    /// Free buffers below which upstream transmit should throttle.
    pub pool_low_water: usize,
    pub rx_ring_size: usize,
    pub rx_buf_size: usize,
    pub max_vaps: usize,
    pub max_peers: usize,
    /// Beacon interval in TUs, shared by all VAPs.
    pub beacon_interval: u16,
    /// Stagger VAP beacons across the interval; bursting sends them
    /// back-to-back instead.
    pub stagger_beacons: bool,
    /// Consecutive busy beacon slots before the chip is considered stuck.
    pub bstuck_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            op_mode: OpMode::HostAp,
            channel: Channel::new(2437),
            pool_size: 64,
            pool_low_water: 8,
            rx_ring_size: 16,
            rx_buf_size: 1920,
            max_vaps: 4,
            max_peers: 64,
            beacon_interval: 100,
            stagger_beacons: true,
            bstuck_threshold: 10,
        }
    }
}

/// Key cache plus the key-slot-to-peer fast map.
pub(crate) struct KeyState {
    pub(crate) cache: KeyCache,
    /// Receive fast path: hardware key slot to peer.
    pub(crate) keyixmap: Vec<Option<PeerId>>,
    /// Slot groups backing the global key indices.
    pub(crate) globals: [Option<KeySlotGroup>; GLOBAL_KEY_SLOTS as usize],
}

pub struct Device<H: Hal> {
    pub(crate) cfg: Config,
    pub(crate) hal: Mutex<H>,
    pub(crate) pool: Mutex<BufferPool>,
    pub(crate) txqs: Vec<Mutex<TxQueue>>,
    /// Access category to `txqs` index.
    pub(crate) ac_map: [usize; AccessCategory::COUNT],
    pub(crate) cab_ix: usize,
    pub(crate) uapsd_ix: usize,
    pub(crate) beacon_hwq: HwQueueId,
    pub(crate) rx: Mutex<RxRing>,
    pub(crate) keys: Mutex<KeyState>,
    pub(crate) peers: Mutex<PeerTable>,
    pub(crate) vaps: Mutex<VapTable>,
    pub(crate) stats: Mutex<DeviceStats>,
    pub(crate) rate: Mutex<Box<dyn RateControl>>,
    pub(crate) channel: Mutex<Channel>,
    pub(crate) imask: AtomicU32,
    /// Consecutive beacon intervals the previous beacon was still pending.
    pub(crate) bmiss_count: AtomicU32,
    pub(crate) monitor_vaps: AtomicU32,
    pub(crate) slot_state: Mutex<crate::beacon::SlotState>,
}

impl<H: Hal> Device<H> {
    pub fn new(mut hal: H, cfg: Config) -> Result<Self> {
        let key_size = hal.key_cache_size();
        let split_mic = hal.needs_split_mic();
        let mcast_search = hal.supports_mcast_key_search();

        let beacon_hwq = hal
            .setup_tx_queue(TxQueueKind::Beacon)
            .ok_or(WlanError::NoHwQueue)?;

        let mut txqs = Vec::new();
        let cab_hw = hal
            .setup_tx_queue(TxQueueKind::Cab)
            .ok_or(WlanError::NoHwQueue)?;
        let cab_ix = txqs.len();
        txqs.push(Mutex::new(TxQueue::new(cab_hw, TxQueueKind::Cab)));

        let uapsd_hw = hal
            .setup_tx_queue(TxQueueKind::Uapsd)
            .ok_or(WlanError::NoHwQueue)?;
        let uapsd_ix = txqs.len();
        txqs.push(Mutex::new(TxQueue::new(uapsd_hw, TxQueueKind::Uapsd)));

        // One data queue per access category, sharing the first one when
        // the chip runs out.
        let mut claimed: [Option<usize>; AccessCategory::COUNT] = [None; AccessCategory::COUNT];
        let mut degraded = 0u32;
        for ac in AccessCategory::ALL {
            if let Some(hw) = hal.setup_tx_queue(TxQueueKind::Data) {
                hal.update_tx_queue(hw, &WME_DEFAULTS[ac.index()]);
                let ix = txqs.len();
                txqs.push(Mutex::new(TxQueue::new(hw, TxQueueKind::Data)));
                claimed[ac.index()] = Some(ix);
            }
        }
        let first_data = claimed
            .iter()
            .flatten()
            .copied()
            .next()
            .ok_or(WlanError::NoHwQueue)?;
        let mut ac_map = [first_data; AccessCategory::COUNT];
        for ac in AccessCategory::ALL {
            match claimed[ac.index()] {
                Some(ix) => ac_map[ac.index()] = ix,
                None => {
                    degraded += 1;
                    log::warn!(
                        "no hardware queue for {:?}, sharing queue {}",
                        ac,
                        first_data
                    );
                }
            }
        }

        let mut pool = BufferPool::new(cfg.pool_size, cfg.pool_low_water);
        let rx = RxRing::new(&mut pool, cfg.rx_ring_size, cfg.rx_buf_size)?;

        let mut stats = DeviceStats::default();
        stats.tx_queue_degraded = degraded;

        Ok(Self {
            hal: Mutex::new(hal),
            pool: Mutex::new(pool),
            txqs,
            ac_map,
            cab_ix,
            uapsd_ix,
            beacon_hwq,
            rx: Mutex::new(rx),
            keys: Mutex::new(KeyState {
                cache: KeyCache::new(key_size, split_mic, mcast_search),
                keyixmap: {
                    let mut m = Vec::new();
                    m.resize(key_size as usize, None);
                    m
                },
                globals: [None; GLOBAL_KEY_SLOTS as usize],
            }),
            peers: Mutex::new(PeerTable::new(cfg.max_peers)),
            vaps: Mutex::new(VapTable::new(cfg.max_vaps, cfg.beacon_interval)),
            stats: Mutex::new(stats),
            rate: Mutex::new(Box::new(FixedRate::default())),
            channel: Mutex::new(cfg.channel),
            imask: AtomicU32::new(0),
            bmiss_count: AtomicU32::new(0),
            monitor_vaps: AtomicU32::new(0),
            slot_state: Mutex::new(crate::beacon::SlotState::default()),
            cfg,
        })
    }

    /// Replace the rate-control policy.
    pub fn set_rate_control(&self, rc: Box<dyn RateControl>) {
        *self.rate.lock() = rc;
    }

    /// Reset the chip onto the operating channel and bring the receive
    /// path up.
    pub fn start(&self) -> Result<()> {
        let chan = *self.channel.lock();
        self.hal.lock().reset(self.cfg.op_mode, chan, true)?;
        {
            let mut rx = self.rx.lock();
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            rx.start(&mut *pool, &mut *hal);
        }
        let im = self.base_imask();
        self.imask.store(im, Ordering::Release);
        self.hal.lock().set_interrupt_mask(im);
        log::info!("device started on {} MHz", chan.mhz);
        Ok(())
    }

    /// Quiesce the hardware: interrupts off, queues drained, receive
    /// stopped and flushed.
    pub fn stop(&self) {
        self.imask.store(0, Ordering::Release);
        self.hal.lock().set_interrupt_mask(0);
        self.drain_tx_all();
        let mut rx = self.rx.lock();
        let mut pool = self.pool.lock();
        let mut hal = self.hal.lock();
        rx.stop(&mut *pool, &mut *hal);
        rx.flush(&mut *pool);
    }

    pub(crate) fn base_imask(&self) -> u32 {
        use crate::hal::mask;
        let mut im = mask::RX | mask::TX | mask::RXEOL | mask::RXORN | mask::FATAL | mask::TXURN;
        if self.cfg.op_mode == OpMode::Station {
            im |= mask::BMISS;
        }
        if self.vaps.lock().beaconing_count() > 0 {
            im |= mask::SWBA;
        }
        im
    }

    pub fn stats_snapshot(&self) -> DeviceStats {
        self.stats.lock().clone()
    }

    /// Scoped raw HAL access for platform glue: calibration, diagnostics,
    /// self-test. Takes the HAL lock, so the closure must not touch the
    /// device.
    pub fn with_hal<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.hal.lock())
    }

    /// Scoped access to the buffer at the head of the receive ring.
    /// Loopback self-test support; None when the ring is empty.
    pub fn with_rx_head<R>(&self, f: impl FnOnce(&mut desc_pool::Buffer) -> R) -> Option<R> {
        let rx = self.rx.lock();
        let head = rx.head()?;
        let mut pool = self.pool.lock();
        Some(f(pool.get_mut(head)))
    }

    /// Upstream flow control: false while the pool sits below its
    /// low-water mark.
    pub fn tx_ready(&self) -> bool {
        !self.pool.lock().below_low_water()
    }

    // ------------------------------------------------------------------
    // VAPs and peers
    // ------------------------------------------------------------------

    pub fn add_vap(&self, mode: OpMode, mac: MacAddr) -> Result<VapId> {
        let vap = self.vaps.lock().add(mode, mac)?;
        if mode == OpMode::Monitor {
            self.monitor_vaps.fetch_add(1, Ordering::Relaxed);
        }
        Ok(vap.id)
    }

    pub fn remove_vap(&self, id: VapId) -> Result<()> {
        // Peers of this VAP go first.
        let peer_ids: Vec<PeerId> = self
            .peers
            .lock()
            .iter()
            .filter(|p| p.vap == id)
            .map(|p| p.id)
            .collect();
        for pid in peer_ids {
            self.remove_peer(pid)?;
        }
        let vap = self.vaps.lock().remove(id).ok_or(WlanError::UnknownVap(id))?;
        if vap.mode == OpMode::Monitor {
            self.monitor_vaps.fetch_sub(1, Ordering::Relaxed);
        }
        self.beacon_teardown(&vap);
        Ok(())
    }

    pub fn add_peer(&self, vap: VapId, mac: MacAddr) -> Result<PeerId> {
        if self.vaps.lock().get(vap).is_none() {
            return Err(WlanError::UnknownVap(vap));
        }
        let peer = self.peers.lock().add(mac, vap)?;
        Ok(peer.id)
    }

    /// Negotiated U-APSD parameters for a peer.
    pub fn configure_peer_uapsd(
        &self,
        id: PeerId,
        delivery_enabled: [bool; AccessCategory::COUNT],
        max_sp: usize,
    ) -> Result<()> {
        let peer = self.peer(id)?;
        peer.configure_uapsd(delivery_enabled, max_sp);
        Ok(())
    }

    pub fn remove_peer(&self, id: PeerId) -> Result<()> {
        let peer = self.peers.lock().remove(id).ok_or(WlanError::UnknownPeer(id))?;
        self.key_delete_peer_inner(&peer);
        // Frames buffered for power save die with the association.
        let chain = ps::drain_buffered(&mut peer.ps.lock(), &mut self.pool.lock());
        let mut pool = self.pool.lock();
        for bid in chain {
            pool.release(bid);
        }
        drop(pool);
        let was_sleeping = peer.ps.lock().sleeping;
        if was_sleeping {
            if let Some(vap) = self.vaps.lock().get(peer.vap) {
                vap.ps_peer_left();
            }
        }
        Ok(())
    }

    pub(crate) fn peer(&self, id: PeerId) -> Result<Arc<PeerNode>> {
        self.peers.lock().get(id).ok_or(WlanError::UnknownPeer(id))
    }

    // ------------------------------------------------------------------
    // Transmit
    // ------------------------------------------------------------------

    /// Queue one frame for transmission.
    ///
    /// Group-addressed frames on a BSS with sleeping stations are held in
    /// the VAP's multicast queue until the next DTIM beacon. Frames for a
    /// triggerable (U-APSD, dozing) peer are staged for service-period
    /// delivery. Everything else goes straight onto the data queue of its
    /// access category.
    pub fn transmit(&self, vap_id: VapId, peer: Option<PeerId>, payload: Vec<u8>) -> Result<()> {
        // Single length check so the header accessors below can index
        // freely.
        if payload.len() < frame::MIN_FRAME_LEN {
            return Err(WlanError::RuntFrame(payload.len()));
        }
        let vap = self
            .vaps
            .lock()
            .get(vap_id)
            .ok_or(WlanError::UnknownVap(vap_id))?;
        let peer_arc = match peer {
            Some(id) => Some(self.peer(id)?),
            None => None,
        };
        let is_group = frame::addr1(&payload).is_group();
        let frame_len = payload.len();
        let ac = if payload.len() >= frame::QOS_HDR_LEN && frame::is_qos_data(&payload) {
            AccessCategory::from_tid(frame::tid(&payload))
        } else {
            AccessCategory::BestEffort
        };

        let id = {
            let mut pool = self.pool.lock();
            match pool.acquire() {
                Some(id) => {
                    let buf = pool.get_mut(id);
                    buf.set_payload(payload);
                    buf.set_peer(peer);
                    id
                }
                None => {
                    self.stats.lock().tx_no_buffer += 1;
                    return Err(WlanError::Busy);
                }
            }
        };

        if is_group && vap.is_beaconing() && vap.has_ps_peers() {
            vap.state.lock().mcast.push_back(id);
            return Ok(());
        }

        let choice = self.rate.lock().select(peer, frame_len, is_group);
        let key_index = peer_arc
            .as_ref()
            .and_then(|p| p.key.lock().map(|g| g.primary));
        let setup = TxDescSetup {
            pkt_type: PacketType::Normal,
            rate: choice.rate,
            tries: choice.tries,
            key_index,
            antenna: 0,
            no_ack: is_group,
        };
        {
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            hal.setup_tx_desc(pool.get_mut(id), &setup);
        }

        if let Some(p) = &peer_arc {
            let mut ps_st = p.ps.lock();
            if ps_st.wants_ps_delivery() {
                let evicted = ps::uapsd_enqueue(&mut ps_st, &mut self.pool.lock(), id);
                drop(ps_st);
                if let Some(ev) = evicted {
                    self.pool.lock().release(ev);
                    self.stats.lock().uapsd_overflow_evictions += 1;
                }
                return Ok(());
            }
        }

        let ix = self.ac_map[ac.index()];
        {
            let mut q = self.txqs[ix].lock();
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            q.enqueue(&mut *pool, &mut *hal, id);
        }
        self.stats.lock().tx_frames += 1;
        Ok(())
    }

    /// Apply new WME parameters to the data queue of one access category.
    pub fn wme_update(&self, ac: AccessCategory, params: &TxQueueParams) -> Result<()> {
        let ix = self.ac_map[ac.index()];
        let hw = self.txqs[ix].lock().hw_id();
        if !self.hal.lock().update_tx_queue(hw, params) {
            return Err(WlanError::Hardware("queue rejected WME parameters"));
        }
        Ok(())
    }

    /// Reclaim completed frames from every transmit queue.
    pub fn tx_reclaim(&self, upper: &mut dyn UpperLayer) -> usize {
        let mut total = 0;
        for ix in 0..self.txqs.len() {
            total += self.reclaim_queue(ix, upper);
        }
        total
    }

    fn reclaim_queue(&self, ix: usize, upper: &mut dyn UpperLayer) -> usize {
        let is_uapsd = ix == self.uapsd_ix;
        let mut reclaimed = 0;
        loop {
            // Pop one completed frame, gathering what the completion
            // handlers need before the buffer is released.
            let (id, status, peer_tag, eosp) = {
                let mut q = self.txqs[ix].lock();
                let mut pool = self.pool.lock();
                let mut hal = self.hal.lock();
                let Some((id, status)) = q.reclaim_one(&mut *pool, &mut *hal) else {
                    break;
                };
                drop(hal);
                let buf = pool.get_mut(id);
                let peer_tag = buf.peer();
                // Write the hardware's final sequence number back when it
                // looks sane; diagnostic surfaces read it from the frame.
                if let Some(seq) = status.final_seq {
                    if seq < 1 << 12 && buf.has_payload() && buf.payload().len() >= 24 {
                        frame::set_seq_number(buf.payload_mut(), seq);
                    }
                }
                let eosp = is_uapsd
                    && buf.has_payload()
                    && buf.payload().len() >= frame::QOS_HDR_LEN
                    && frame::eosp(buf.payload());
                (id, status, peer_tag, eosp)
            };

            {
                let mut stats = self.stats.lock();
                if status.ok {
                    stats.tx_ok += 1;
                    stats.count_tx_antenna(status.antenna);
                } else {
                    stats.tx_err += 1;
                    if status.excessive_retries {
                        stats.tx_excessive_retries += 1;
                    }
                    if status.fifo_underrun {
                        stats.tx_fifo_underrun += 1;
                    }
                }
                if status.filtered {
                    stats.tx_filtered += 1;
                }
                stats.tx_short_retries += status.short_retries as u64;
                stats.tx_long_retries += status.long_retries as u64;
            }

            let peer_arc = peer_tag.and_then(|pid| self.peers.lock().get(pid));
            if let Some(p) = &peer_arc {
                let mut pstats = p.stats.lock();
                if status.ok {
                    pstats.tx_ok += 1;
                    pstats.last_rssi = status.rssi;
                    pstats.last_antenna = status.antenna;
                } else {
                    pstats.tx_err += 1;
                }
            }
            // Filtered frames say nothing about the channel; keep them away
            // from rate control.
            if !status.filtered {
                self.rate.lock().tx_complete(peer_tag, &status);
            }

            if eosp {
                self.stats.lock().uapsd_eosp += 1;
                if let Some(p) = &peer_arc {
                    let empty = {
                        let mut ps_st = p.ps.lock();
                        ps::close_service_period(&mut ps_st);
                        ps_st.buffered() == 0
                    };
                    if empty {
                        upper.set_tim(p.id, false);
                    }
                }
            }

            self.pool.lock().release(id);
            reclaimed += 1;
        }
        reclaimed
    }

    /// Stop DMA on every transmit queue and throw away all queued frames.
    pub fn drain_tx_all(&self) {
        for ix in 0..self.txqs.len() {
            let mut q = self.txqs[ix].lock();
            self.hal.lock().stop_tx(q.hw_id());
            let mut pool = self.pool.lock();
            q.force_drain(&mut *pool);
        }
    }

    /// Periodic transmit health check. Resets the chip when a queue has
    /// stopped making progress.
    pub fn watchdog(&self, upper: &mut dyn UpperLayer) {
        let mut stuck = false;
        for q in &self.txqs {
            if q.lock().watchdog_tick() >= TX_STUCK_TICKS {
                stuck = true;
            }
        }
        if stuck {
            log::error!("transmit queue stuck, resetting");
            self.reset(upper, false);
        }
    }

    // ------------------------------------------------------------------
    // Key management
    // ------------------------------------------------------------------

    /// Install a global (group) key at a fixed index.
    pub fn key_set_global(&self, index: u16, material: KeyMaterial) -> Result<u16> {
        if index >= GLOBAL_KEY_SLOTS {
            return Err(WlanError::InvalidKeyIndex(index));
        }
        let mut keys = self.keys.lock();
        if let Some(old) = keys.globals[index as usize].take() {
            self.reset_key_slots(&old);
            keys.cache.free(&old);
        }
        let group = keys.cache.alloc_global(index, material.cipher)?;
        self.write_key_slots(&group, &material, None);
        keys.globals[index as usize] = Some(group);
        Ok(group.primary)
    }

    /// Remove a global key. The fixed slot stays reserved in the cache.
    pub fn key_delete_global(&self, index: u16) -> Result<()> {
        let mut keys = self.keys.lock();
        if index >= GLOBAL_KEY_SLOTS {
            return Err(WlanError::InvalidKeyIndex(index));
        }
        let group = keys.globals[index as usize]
            .take()
            .ok_or(WlanError::InvalidState("global key not set"))?;
        self.reset_key_slots(&group);
        keys.cache.free(&group);
        Ok(())
    }

    /// Install a pairwise key for a peer, replacing any previous one.
    /// Returns the primary hardware slot.
    pub fn key_set_peer(&self, id: PeerId, material: KeyMaterial) -> Result<u16> {
        let peer = self.peer(id)?;
        let mut keys = self.keys.lock();
        // Free the old group first so rekeying reuses the same slots.
        if let Some(old) = peer.key.lock().take() {
            self.reset_key_slots(&old);
            Self::unmap_key_slots(&mut keys, &old);
            keys.cache.free(&old);
        }
        let group = keys
            .cache
            .alloc_unicast(material.cipher)
            .ok_or(WlanError::NoKeySlots)?;
        self.write_key_slots(&group, &material, Some(peer.mac));
        keys.keyixmap[group.primary as usize] = Some(id);
        if let Some(rx) = group.rx {
            keys.keyixmap[rx as usize] = Some(id);
        }
        *peer.key.lock() = Some(group);
        Ok(group.primary)
    }

    pub fn key_delete_peer(&self, id: PeerId) -> Result<()> {
        let peer = self.peer(id)?;
        self.key_delete_peer_inner(&peer);
        Ok(())
    }

    fn key_delete_peer_inner(&self, peer: &Arc<PeerNode>) {
        let Some(group) = peer.key.lock().take() else {
            return;
        };
        let mut keys = self.keys.lock();
        self.reset_key_slots(&group);
        Self::unmap_key_slots(&mut keys, &group);
        keys.cache.free(&group);
    }

    fn write_key_slots(&self, group: &KeySlotGroup, material: &KeyMaterial, mac: Option<MacAddr>) {
        let mut hal = self.hal.lock();
        hal.key_write(group.primary, material, mac);
        for ix in [group.tx_mic, group.rx, group.rx_mic].into_iter().flatten() {
            hal.key_write(ix, material, None);
        }
    }

    fn reset_key_slots(&self, group: &KeySlotGroup) {
        let mut hal = self.hal.lock();
        for ix in group.slots() {
            hal.key_reset(ix);
        }
    }

    fn unmap_key_slots(keys: &mut KeyState, group: &KeySlotGroup) {
        keys.keyixmap[group.primary as usize] = None;
        if let Some(rx) = group.rx {
            keys.keyixmap[rx as usize] = None;
        }
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// Deferred receive processing: consume completed ring buffers, pass
    /// survivors upstairs and repost each buffer at the tail.
    pub fn rx_poll(&self, upper: &mut dyn UpperLayer) -> usize {
        let monitor = self.monitor_vaps.load(Ordering::Relaxed) > 0;
        let mut handled = 0;
        loop {
            // Detach the head buffer's payload if it has completed. The
            // self-linked tail is the hardware's scratch space and is
            // never consumed.
            let (id, status, payload) = {
                let mut rx = self.rx.lock();
                let mut pool = self.pool.lock();
                let mut hal = self.hal.lock();
                let Some(head) = rx.head() else { break };
                if pool.get(head).is_self_linked() {
                    break;
                }
                let Some(status) = hal.proc_rx_desc(pool.get(head)) else {
                    break;
                };
                rx.pop_head();
                let buf = pool.get_mut(head);
                if buf.is_device_owned() {
                    buf.mark_driver_owned();
                }
                let payload = buf.take_payload().unwrap_or_default();
                (head, status, payload)
            };
            handled += 1;

            let seen = status.len.min(payload.len());
            self.rx_one(upper, &payload[..seen], &status, monitor);

            let mut rx = self.rx.lock();
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            rx.repost(&mut *pool, &mut *hal, id);
        }
        handled
    }

    /// Classify and deliver a single received frame.
    fn rx_one(&self, upper: &mut dyn UpperLayer, data: &[u8], status: &RxStatus, monitor: bool) {
        // Monitor taps see everything, including frames about to be
        // rejected for errors.
        if monitor {
            upper.monitor_capture(data, status);
        }

        match classify(status) {
            Err(reason) => {
                let mut stats = self.stats.lock();
                match reason {
                    RxDrop::Crc => stats.rx_crc_err += 1,
                    RxDrop::Fifo => stats.rx_fifo_err += 1,
                    RxDrop::Phy(code) => stats.count_phy_err(code),
                    RxDrop::Decrypt => stats.rx_decrypt_err += 1,
                    RxDrop::Mic => {
                        stats.rx_mic_err += 1;
                        drop(stats);
                        upper.michael_failure(data, status.key_index);
                    }
                    RxDrop::TooShort => stats.rx_too_short += 1,
                    RxDrop::TooLong => stats.rx_too_long += 1,
                }
            }
            Ok(trimmed) => {
                let peer = self.lookup_rx_peer(data, status);
                if let Some(p) = &peer {
                    let mut pstats = p.stats.lock();
                    pstats.rx_frames += 1;
                    pstats.last_rssi = status.rssi;
                    pstats.last_antenna = status.antenna;
                }
                {
                    let mut stats = self.stats.lock();
                    stats.rx_frames += 1;
                    stats.count_rx_antenna(status.antenna);
                }
                upper.receive(peer.map(|p| p.id), &data[..trimmed.min(data.len())], status);
            }
        }
    }

    /// Find the sending peer: key-slot fast path first, transmitter
    /// address second. A hit by address back-fills the fast map.
    fn lookup_rx_peer(
        &self,
        data: &[u8],
        status: &RxStatus,
    ) -> Option<Arc<PeerNode>> {
        if let Some(kix) = status.key_index {
            let mapped = {
                let keys = self.keys.lock();
                keys.keyixmap.get(kix as usize).copied().flatten()
            };
            if let Some(pid) = mapped {
                if let Some(p) = self.peers.lock().get(pid) {
                    return Some(p);
                }
            }
        }
        if data.len() < 16 {
            return None;
        }
        let peer = self.peers.lock().find(frame::addr2(data))?;
        let group = *peer.key.lock();
        if let Some(group) = group {
            let mut keys = self.keys.lock();
            if keys.keyixmap[group.primary as usize].is_none() {
                keys.keyixmap[group.primary as usize] = Some(peer.id);
            }
        }
        Some(peer)
    }

    // ------------------------------------------------------------------
    // Power save
    // ------------------------------------------------------------------

    /// Interrupt-time scan of completed receive descriptors for U-APSD
    /// triggers and PM transitions. Runs before the deferred receive pass
    /// so trigger responses ride the frame that asked for them.
    pub fn process_triggers(&self, upper: &mut dyn UpperLayer) {
        // Pass 1: collect candidate headers under the ring locks.
        let mut candidates: Vec<([u8; frame::QOS_HDR_LEN], RxStatus)> = Vec::new();
        {
            let rx = self.rx.lock();
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            for id in rx.iter() {
                if pool.get(id).is_self_linked() {
                    break;
                }
                if pool.get(id).is_completed() {
                    continue;
                }
                let Some(status) = hal.proc_rx_desc(pool.get(id)) else {
                    break;
                };
                let buf = pool.get_mut(id);
                buf.set_completed(true);
                if status.error.is_some() || status.more {
                    continue;
                }
                if buf.is_device_owned() {
                    buf.mark_driver_owned();
                }
                let data = buf.payload();
                if status.len.min(data.len()) < frame::QOS_HDR_LEN {
                    buf.mark_device_owned();
                    continue;
                }
                let mut hdr = [0u8; frame::QOS_HDR_LEN];
                hdr.copy_from_slice(&data[..frame::QOS_HDR_LEN]);
                buf.mark_device_owned();
                candidates.push((hdr, status));
            }
        }

        // Pass 2: evaluate each candidate with the ring locks dropped.
        for (hdr, status) in candidates {
            self.process_one_trigger(upper, &hdr, &status);
        }
    }

    fn process_one_trigger(
        &self,
        upper: &mut dyn UpperLayer,
        hdr: &[u8],
        status: &RxStatus,
    ) {
        let Some(peer) = self.lookup_rx_peer(hdr, status) else {
            return;
        };
        let vap = self.vaps.lock().get(peer.vap);

        let (verdict, now_sleeping) = {
            let mut ps_st = peer.ps.lock();
            let v = ps::evaluate_trigger(&mut ps_st, hdr);
            (v, ps_st.sleeping)
        };

        match verdict {
            TriggerVerdict::StateChange => {
                if let Some(v) = &vap {
                    if now_sleeping {
                        v.ps_peer_joined();
                    } else {
                        v.ps_peer_left();
                    }
                }
                upper.node_ps_change(peer.id, now_sleeping);
                if !now_sleeping {
                    // Waking flushes everything buffered, in order, onto
                    // the delivery queue.
                    let chain = ps::drain_buffered(&mut peer.ps.lock(), &mut self.pool.lock());
                    if !chain.is_empty() {
                        let mut q = self.txqs[self.uapsd_ix].lock();
                        let mut pool = self.pool.lock();
                        let mut hal = self.hal.lock();
                        q.splice(&mut *pool, &mut *hal, chain);
                    }
                }
            }
            TriggerVerdict::StartSp => {
                self.stats.lock().uapsd_triggers += 1;
                self.start_service_period(upper, &peer, hdr);
            }
            TriggerVerdict::Duplicate => {
                self.stats.lock().uapsd_dup_triggers += 1;
            }
            TriggerVerdict::AlreadyInSp | TriggerVerdict::AcNotDelivery => {
                self.stats.lock().uapsd_ignored_triggers += 1;
            }
            TriggerVerdict::NotTrigger => {}
        }
    }

    /// Deliver one service period to a peer: take the staged chain (or
    /// synthesize a QoS-null), mark its final frame EOSP with a completion
    /// interrupt, and splice it onto the delivery queue with a single DMA
    /// start.
    fn start_service_period(&self, upper: &mut dyn UpperLayer, peer: &Arc<PeerNode>, trigger: &[u8]) {
        let vap_mac = self
            .vaps
            .lock()
            .get(peer.vap)
            .map(|v| v.mac)
            .unwrap_or(MacAddr::BROADCAST);

        let mut ps_st = peer.ps.lock();
        let mut chain = ps::take_service_period(&mut ps_st);
        let overflow_pending = !ps_st.overflow.is_empty();

        if chain.is_empty() {
            // Nothing buffered: answer with a QoS-null so the station can
            // close its service period and doze again.
            let tid = frame::tid(trigger);
            let qnull = frame::make_qos_null(peer.mac, vap_mac, vap_mac, tid);
            let choice = self.rate.lock().select(Some(peer.id), qnull.len(), false);
            let mut pool = self.pool.lock();
            let Some(id) = pool.acquire() else {
                drop(pool);
                ps_st.sp_in_progress = false;
                self.stats.lock().tx_no_buffer += 1;
                return;
            };
            {
                let buf = pool.get_mut(id);
                buf.set_payload(qnull);
                buf.set_peer(Some(peer.id));
            }
            let mut hal = self.hal.lock();
            hal.setup_tx_desc(
                pool.get_mut(id),
                &TxDescSetup {
                    pkt_type: PacketType::Normal,
                    rate: choice.rate,
                    tries: choice.tries,
                    key_index: None,
                    antenna: 0,
                    no_ack: false,
                },
            );
            drop(hal);
            drop(pool);
            chain.push_back(id);
            self.stats.lock().uapsd_qos_null += 1;
        }

        // Final frame of the period: EOSP, MoreData if another period is
        // already waiting, and a completion interrupt so the period can be
        // closed promptly.
        let Some(&last) = chain.back() else {
            ps_st.sp_in_progress = false;
            return;
        };
        {
            let mut pool = self.pool.lock();
            let buf = pool.get_mut(last);
            buf.desc.flags |= desc_flags::INTREQ;
            frame::set_eosp(buf.payload_mut());
            frame::set_more_data(buf.payload_mut(), overflow_pending);
        }
        if !overflow_pending {
            upper.set_tim(peer.id, false);
        }

        {
            let mut q = self.txqs[self.uapsd_ix].lock();
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            q.splice(&mut *pool, &mut *hal, chain);
        }
        drop(ps_st);
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Full recovery path: drain transmit, stop receive, reset the chip,
    /// bring receive back and restore the interrupt mask.
    pub fn reset(&self, _upper: &mut dyn UpperLayer, full: bool) {
        self.hal.lock().set_interrupt_mask(0);
        self.drain_tx_all();
        {
            let mut rx = self.rx.lock();
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            rx.stop(&mut *pool, &mut *hal);
        }
        let chan = *self.channel.lock();
        if let Err(e) = self.hal.lock().reset(self.cfg.op_mode, chan, full) {
            log::error!("chip reset failed: {e}");
        }
        {
            let mut rx = self.rx.lock();
            let mut pool = self.pool.lock();
            let mut hal = self.hal.lock();
            rx.start(&mut *pool, &mut *hal);
        }
        let im = self.base_imask();
        self.imask.store(im, Ordering::Release);
        self.hal.lock().set_interrupt_mask(im);
        self.bmiss_count.store(0, Ordering::Relaxed);
        self.stats.lock().resets += 1;
    }

    /// Move to a new operating channel; the chip resets in place.
    pub fn set_channel(&self, upper: &mut dyn UpperLayer, chan: Channel) {
        *self.channel.lock() = chan;
        self.reset(upper, true);
        log::info!("switched to {} MHz", chan.mhz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::hal::{RxError, SoftHal};
    use crate::keycache::{CipherKind, KeyMaterial};
    use crate::testutil::{ap_device, small_config, TestUpper, AP_MAC, STA_MAC};
    use crate::txq::RingState;
    use desc_pool::BufId;

    fn from_sta(tid: u8) -> Vec<u8> {
        frame::make_qos_data(AP_MAC, STA_MAC, tid, 1, &[0u8; 16])
    }

    fn to_sta(tid: u8) -> Vec<u8> {
        frame::make_qos_data(STA_MAC, AP_MAC, tid, 1, &[0u8; 16])
    }

    #[test]
    fn each_access_category_gets_its_own_queue() {
        let (dev, _) = ap_device();
        for a in 0..AccessCategory::COUNT {
            for b in a + 1..AccessCategory::COUNT {
                assert_ne!(dev.ac_map[a], dev.ac_map[b]);
            }
        }
        assert_eq!(dev.stats_snapshot().tx_queue_degraded, 0);
    }

    #[test]
    fn short_on_queues_falls_back_to_sharing() {
        // Beacon, CAB and U-APSD claim three; one data queue is left.
        let dev = Device::new(SoftHal::with_queues(4), small_config()).unwrap();
        let first = dev.ac_map[0];
        assert!(dev.ac_map.iter().all(|&ix| ix == first));
        assert_eq!(dev.stats_snapshot().tx_queue_degraded, 3);
    }

    #[test]
    fn wme_update_reaches_the_mapped_queue() {
        let (dev, _) = ap_device();
        let params = crate::hal::TxQueueParams {
            aifs: 2,
            cw_min: 3,
            cw_max: 7,
            burst_time: 30,
        };
        dev.wme_update(AccessCategory::Voice, &params).unwrap();
        let hw = dev.txqs[dev.ac_map[AccessCategory::Voice.index()]]
            .lock()
            .hw_id();
        assert_eq!(dev.hal.lock().queue_params(hw), Some(params));
    }

    #[test]
    fn transmit_and_reclaim_round_trip() {
        let (dev, vap) = ap_device();
        let peer = dev.add_peer(vap, STA_MAC).unwrap();
        dev.transmit(vap, Some(peer), to_sta(0)).unwrap();

        let ix = dev.ac_map[AccessCategory::BestEffort.index()];
        assert_eq!(dev.txqs[ix].lock().state(), RingState::Running);
        assert_eq!(dev.txqs[ix].lock().depth(), 1);

        dev.hal.lock().complete_all_tx = true;
        let mut up = TestUpper::default();
        assert_eq!(dev.tx_reclaim(&mut up), 1);
        assert_eq!(dev.txqs[ix].lock().state(), RingState::Idle);
        let stats = dev.stats_snapshot();
        assert_eq!(stats.tx_frames, 1);
        assert_eq!(stats.tx_ok, 1);
        assert_eq!(dev.pool.lock().in_use(), dev.cfg.rx_ring_size);
    }

    #[test]
    fn transmit_for_triggerable_peer_is_buffered() {
        let (dev, vap) = ap_device();
        let peer = dev.add_peer(vap, STA_MAC).unwrap();
        dev.configure_peer_uapsd(peer, [true; 4], 2).unwrap();
        {
            let p = dev.peer(peer).unwrap();
            let mut ps_st = p.ps.lock();
            ps_st.sleeping = true;
            ps_st.triggerable = true;
        }
        dev.transmit(vap, Some(peer), to_sta(6)).unwrap();
        let p = dev.peer(peer).unwrap();
        assert_eq!(p.ps.lock().delivery.len(), 1);
        let ix = dev.ac_map[AccessCategory::Voice.index()];
        assert!(dev.txqs[ix].lock().is_empty());
    }

    #[test]
    fn group_frames_wait_for_dtim_when_stations_sleep() {
        let (dev, vap) = ap_device();
        let v = dev.vaps.lock().get(vap).unwrap();
        v.ps_peer_joined();
        let f = frame::make_qos_data(MacAddr::BROADCAST, AP_MAC, 0, 1, &[0u8; 8]);
        dev.transmit(vap, None, f).unwrap();
        assert_eq!(v.state.lock().mcast.len(), 1);
    }

    #[test]
    fn pool_exhaustion_reports_busy() {
        let mut cfg = small_config();
        cfg.pool_size = cfg.rx_ring_size + 1;
        let dev = Device::new(SoftHal::new(), cfg).unwrap();
        dev.start().unwrap();
        let vap = dev.add_vap(OpMode::HostAp, AP_MAC).unwrap();
        dev.transmit(vap, None, to_sta(0)).unwrap();
        assert!(matches!(
            dev.transmit(vap, None, to_sta(0)),
            Err(WlanError::Busy)
        ));
        assert_eq!(dev.stats_snapshot().tx_no_buffer, 1);
        assert!(!dev.tx_ready());
    }

    #[test]
    fn pairwise_tkip_key_maps_both_lookup_slots() {
        let (dev, vap) = ap_device();
        let peer = dev.add_peer(vap, STA_MAC).unwrap();
        let slot = dev
            .key_set_peer(peer, KeyMaterial::new(CipherKind::Tkip, &[7u8; 16]))
            .unwrap();
        assert_eq!(slot, 4);
        {
            let keys = dev.keys.lock();
            assert_eq!(keys.keyixmap[4], Some(peer));
            assert_eq!(keys.keyixmap[36], Some(peer));
        }
        assert!(dev.hal.lock().key_slot(slot).is_some());

        dev.key_delete_peer(peer).unwrap();
        let keys = dev.keys.lock();
        assert_eq!(keys.keyixmap[4], None);
        assert!(dev.hal.lock().key_resets().contains(&4));
        assert!(dev.hal.lock().key_resets().contains(&100));
    }

    #[test]
    fn global_key_can_be_replaced_in_place() {
        let (dev, _) = ap_device();
        let s1 = dev
            .key_set_global(1, KeyMaterial::new(CipherKind::AesCcm, &[1u8; 16]))
            .unwrap();
        assert_eq!(s1, 1);
        let s2 = dev
            .key_set_global(1, KeyMaterial::new(CipherKind::AesCcm, &[2u8; 16]))
            .unwrap();
        assert_eq!(s2, 1);
        dev.key_delete_global(1).unwrap();
        assert!(matches!(
            dev.key_delete_global(1),
            Err(WlanError::InvalidState(_))
        ));
    }

    // Write a frame into the current head receive buffer and mark it
    // complete in the status ring.
    fn inject_rx(dev: &Device<SoftHal>, f: &[u8], status: crate::hal::RxStatus) -> BufId {
        let head = dev.rx.lock().head().unwrap();
        {
            let mut pool = dev.pool.lock();
            let buf = pool.get_mut(head);
            buf.mark_driver_owned();
            buf.payload_mut()[..f.len()].copy_from_slice(f);
            buf.mark_device_owned();
        }
        dev.hal.lock().complete_rx(head, status);
        head
    }

    #[test]
    fn rx_poll_delivers_and_reposts() {
        let (dev, vap) = ap_device();
        let peer = dev.add_peer(vap, STA_MAC).unwrap();
        let f = from_sta(0);
        let head = inject_rx(&dev, &f, crate::hal::RxStatus::clean(f.len() + frame::CRC_LEN));

        let mut up = TestUpper::default();
        assert_eq!(dev.rx_poll(&mut up), 1);
        assert_eq!(up.received.len(), 1);
        let (who, data) = &up.received[0];
        assert_eq!(*who, Some(peer));
        assert_eq!(data.len(), f.len());

        // Consumed buffer went back on the tail with a fresh payload.
        let rx = dev.rx.lock();
        assert_eq!(rx.len(), dev.cfg.rx_ring_size);
        assert_ne!(rx.head(), Some(head));
        assert_eq!(dev.stats_snapshot().rx_frames, 1);
    }

    #[test]
    fn rx_errors_are_counted_not_delivered() {
        let (dev, _) = ap_device();
        let f = from_sta(0);
        inject_rx(
            &dev,
            &f,
            crate::hal::RxStatus::with_error(f.len(), RxError::Crc),
        );
        let mut up = TestUpper::default();
        assert_eq!(dev.rx_poll(&mut up), 1);
        assert!(up.received.is_empty());
        assert_eq!(dev.stats_snapshot().rx_crc_err, 1);
    }

    #[test]
    fn michael_failure_reaches_upper_layer() {
        let (dev, _) = ap_device();
        let f = from_sta(0);
        inject_rx(
            &dev,
            &f,
            crate::hal::RxStatus::with_error(f.len(), RxError::Mic),
        );
        let mut up = TestUpper::default();
        dev.rx_poll(&mut up);
        assert_eq!(up.michael_failures, 1);
        assert_eq!(dev.stats_snapshot().rx_mic_err, 1);
    }

    #[test]
    fn runt_frame_is_rejected_before_header_access() {
        let (dev, vap) = ap_device();
        let in_use = dev.pool.lock().in_use();
        assert_eq!(dev.transmit(vap, None, alloc::vec![0u8; 4]), Err(WlanError::RuntFrame(4)));
        assert_eq!(dev.pool.lock().in_use(), in_use);
    }

    #[test]
    fn non_qos_frame_survives_service_period_delivery() {
        let (dev, vap) = ap_device();
        let peer = dev.add_peer(vap, STA_MAC).unwrap();
        dev.configure_peer_uapsd(peer, [true; 4], 2).unwrap();
        {
            let p = dev.peer(peer).unwrap();
            let mut ps_st = p.ps.lock();
            ps_st.sleeping = true;
            ps_st.triggerable = true;
        }

        // Bare null data frame: 24-byte header, no QoS control field.
        let mut null = alloc::vec![0u8; 24];
        null[0] = frame::FC0_TYPE_DATA | 0x40;
        null[4..10].copy_from_slice(&STA_MAC.0);
        null[10..16].copy_from_slice(&AP_MAC.0);
        dev.transmit(vap, Some(peer), null).unwrap();

        let mut trig = from_sta(6);
        trig[1] |= frame::FC1_PWR_MGT;
        inject_rx(
            &dev,
            &trig,
            crate::hal::RxStatus::clean(trig.len() + frame::CRC_LEN),
        );
        let mut up = TestUpper::default();
        dev.process_triggers(&mut up);

        // Delivered untouched; no QoS bits were forced into the header.
        let q = dev.txqs[dev.uapsd_ix].lock();
        assert_eq!(q.depth(), 1);
        let head = q.head().unwrap();
        let mut pool = dev.pool.lock();
        let buf = pool.get_mut(head);
        buf.mark_driver_owned();
        assert_eq!(buf.payload().len(), 24);
        assert!(!frame::eosp(buf.payload()));
    }

    #[test]
    fn empty_trigger_answers_with_qos_null() {
        let (dev, vap) = ap_device();
        let peer = dev.add_peer(vap, STA_MAC).unwrap();
        dev.configure_peer_uapsd(peer, [true; 4], 2).unwrap();
        {
            let p = dev.peer(peer).unwrap();
            let mut ps_st = p.ps.lock();
            ps_st.sleeping = true;
            ps_st.triggerable = true;
        }

        let mut trig = from_sta(6);
        trig[1] |= frame::FC1_PWR_MGT;
        inject_rx(
            &dev,
            &trig,
            crate::hal::RxStatus::clean(trig.len() + frame::CRC_LEN),
        );

        let mut up = TestUpper::default();
        dev.process_triggers(&mut up);

        assert_eq!(dev.txqs[dev.uapsd_ix].lock().depth(), 1);
        assert_eq!(dev.txqs[dev.uapsd_ix].lock().state(), RingState::Running);
        let stats = dev.stats_snapshot();
        assert_eq!(stats.uapsd_triggers, 1);
        assert_eq!(stats.uapsd_qos_null, 1);
        let p = dev.peer(peer).unwrap();
        assert!(p.ps.lock().sp_in_progress);
    }

    #[test]
    fn remove_peer_returns_buffered_frames_to_the_pool() {
        let (dev, vap) = ap_device();
        let peer = dev.add_peer(vap, STA_MAC).unwrap();
        dev.configure_peer_uapsd(peer, [true; 4], 2).unwrap();
        {
            let p = dev.peer(peer).unwrap();
            let mut ps_st = p.ps.lock();
            ps_st.sleeping = true;
            ps_st.triggerable = true;
        }
        dev.vaps.lock().get(vap).unwrap().ps_peer_joined();
        for _ in 0..3 {
            dev.transmit(vap, Some(peer), to_sta(6)).unwrap();
        }
        let before = dev.pool.lock().available();
        dev.remove_peer(peer).unwrap();
        assert_eq!(dev.pool.lock().available(), before + 3);
    }

    #[test]
    fn stop_quiesces_everything() {
        let (dev, vap) = ap_device();
        dev.transmit(vap, None, to_sta(0)).unwrap();
        dev.stop();
        assert_eq!(dev.hal.lock().interrupt_mask(), 0);
        assert!(!dev.hal.lock().rx_running());
        assert_eq!(dev.pool.lock().in_use(), dev.cfg.rx_ring_size);
    }
}
