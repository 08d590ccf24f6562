//! Software device model.
//!
//! Behaves like a well-mannered chip: queues hand out ids in order, key
//! slots remember what was written, completions are whatever the test
//! injected. Nothing here is timing-dependent, which keeps the test suite
//! deterministic.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use desc_pool::{BufId, Buffer};

use super::{Hal, RxStatus, TxDescSetup, TxQueueKind, TxQueueParams, TxStatus};
use crate::error::{Result, WlanError};
use crate::keycache::KeyMaterial;
use crate::types::{Channel, HwQueueId, MacAddr, OpMode};

struct SoftQueue {
    kind: TxQueueKind,
    active: bool,
    head: Option<BufId>,
    puts: u32,
    starts: u32,
    stops: u32,
    params: Option<TxQueueParams>,
    pending: usize,
}

/// Test double implementing [`Hal`].
pub struct SoftHal {
    key_cache_size: u16,
    mcast_key_search: bool,
    split_mic: bool,
    max_queues: usize,

    queues: Vec<SoftQueue>,

    tx_results: BTreeMap<BufId, TxStatus>,
    /// When set, every polled transmit descriptor completes successfully.
    pub complete_all_tx: bool,

    rx_results: BTreeMap<BufId, RxStatus>,
    rx_head: Option<BufId>,
    rx_running: bool,
    rx_stops: u32,

    keys: BTreeMap<u16, (KeyMaterial, Option<MacAddr>)>,
    key_resets: Vec<u16>,

    imask: u32,
    pending_irq: u32,

    resets: u32,
    full_resets: u32,
    /// Makes the next reset fail, once.
    pub fail_next_reset: bool,

    tsf: u64,
    slot_short: Option<bool>,
    trigger_level_raises: u32,
}

impl SoftHal {
    pub fn new() -> Self {
        Self {
            key_cache_size: 128,
            mcast_key_search: false,
            split_mic: true,
            max_queues: 10,
            queues: Vec::new(),
            tx_results: BTreeMap::new(),
            complete_all_tx: false,
            rx_results: BTreeMap::new(),
            rx_head: None,
            rx_running: false,
            rx_stops: 0,
            keys: BTreeMap::new(),
            key_resets: Vec::new(),
            imask: 0,
            pending_irq: 0,
            resets: 0,
            full_resets: 0,
            fail_next_reset: false,
            tsf: 0,
            slot_short: None,
            trigger_level_raises: 0,
        }
    }

    pub fn with_queues(max_queues: usize) -> Self {
        Self {
            max_queues,
            ..Self::new()
        }
    }

    pub fn with_key_cache(size: u16, split_mic: bool, mcast_key_search: bool) -> Self {
        Self {
            key_cache_size: size,
            split_mic,
            mcast_key_search,
            ..Self::new()
        }
    }

    // -- Test controls ------------------------------------------------------

    /// Inject a transmit completion for a buffer.
    pub fn complete_tx(&mut self, id: BufId, status: TxStatus) {
        self.tx_results.insert(id, status);
    }

    /// Inject a receive completion for a buffer. Stays visible until the
    /// buffer's descriptor is re-initialized, matching a real status ring.
    pub fn complete_rx(&mut self, id: BufId, status: RxStatus) {
        self.rx_results.insert(id, status);
    }

    /// Latch interrupt cause bits for the next `pending_interrupts` read.
    pub fn raise_irq(&mut self, bits: u32) {
        self.pending_irq |= bits;
    }

    /// Pretend the hardware still holds `n` frames on a queue.
    pub fn set_tx_pending(&mut self, q: HwQueueId, n: usize) {
        self.queues[q as usize].pending = n;
    }

    pub fn advance_tsf(&mut self, micros: u64) {
        self.tsf += micros;
    }

    pub fn set_tsf(&mut self, tsf: u64) {
        self.tsf = tsf;
    }

    // -- Test observers -----------------------------------------------------

    pub fn queue_head(&self, q: HwQueueId) -> Option<BufId> {
        self.queues[q as usize].head
    }

    pub fn queue_starts(&self, q: HwQueueId) -> u32 {
        self.queues[q as usize].starts
    }

    pub fn queue_puts(&self, q: HwQueueId) -> u32 {
        self.queues[q as usize].puts
    }

    pub fn queue_active(&self, q: HwQueueId) -> bool {
        self.queues[q as usize].active
    }

    pub fn queue_params(&self, q: HwQueueId) -> Option<TxQueueParams> {
        self.queues[q as usize].params
    }

    pub fn queue_kind(&self, q: HwQueueId) -> TxQueueKind {
        self.queues[q as usize].kind
    }

    pub fn queue_stops(&self, q: HwQueueId) -> u32 {
        self.queues[q as usize].stops
    }

    pub fn rx_stops(&self) -> u32 {
        self.rx_stops
    }

    pub fn rx_running(&self) -> bool {
        self.rx_running
    }

    pub fn rx_head(&self) -> Option<BufId> {
        self.rx_head
    }

    pub fn key_slot(&self, ix: u16) -> Option<&(KeyMaterial, Option<MacAddr>)> {
        self.keys.get(&ix)
    }

    pub fn key_resets(&self) -> &[u16] {
        &self.key_resets
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn full_resets(&self) -> u32 {
        self.full_resets
    }

    pub fn slot_time_short(&self) -> Option<bool> {
        self.slot_short
    }

    pub fn trigger_level_raises(&self) -> u32 {
        self.trigger_level_raises
    }
}

impl Default for SoftHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for SoftHal {
    fn reset(&mut self, _mode: OpMode, _chan: Channel, full: bool) -> Result<()> {
        if self.fail_next_reset {
            self.fail_next_reset = false;
            return Err(WlanError::Hardware("reset failed"));
        }
        self.resets += 1;
        if full {
            self.full_resets += 1;
        }
        self.rx_running = false;
        for q in &mut self.queues {
            q.active = false;
            q.head = None;
        }
        Ok(())
    }

    fn setup_tx_queue(&mut self, kind: TxQueueKind) -> Option<HwQueueId> {
        if self.queues.len() >= self.max_queues {
            return None;
        }
        let id = self.queues.len() as HwQueueId;
        self.queues.push(SoftQueue {
            kind,
            active: false,
            head: None,
            puts: 0,
            starts: 0,
            stops: 0,
            params: None,
            pending: 0,
        });
        Some(id)
    }

    fn update_tx_queue(&mut self, q: HwQueueId, params: &TxQueueParams) -> bool {
        self.queues[q as usize].params = Some(*params);
        true
    }

    fn put_tx_buf(&mut self, q: HwQueueId, head: BufId) {
        let q = &mut self.queues[q as usize];
        q.head = Some(head);
        q.puts += 1;
    }

    fn start_tx(&mut self, q: HwQueueId) {
        let q = &mut self.queues[q as usize];
        q.active = true;
        q.starts += 1;
    }

    fn stop_tx(&mut self, q: HwQueueId) -> bool {
        let q = &mut self.queues[q as usize];
        q.active = false;
        q.head = None;
        q.stops += 1;
        true
    }

    fn num_tx_pending(&mut self, q: HwQueueId) -> usize {
        self.queues[q as usize].pending
    }

    fn setup_tx_desc(&mut self, buf: &mut Buffer, _params: &TxDescSetup) {
        buf.desc.data_len = if buf.has_payload() {
            buf.payload().len()
        } else {
            0
        };
    }

    fn proc_tx_desc(&mut self, buf: &Buffer) -> Option<TxStatus> {
        if let Some(st) = self.tx_results.remove(&buf.index()) {
            return Some(st);
        }
        if self.complete_all_tx {
            return Some(TxStatus::success());
        }
        None
    }

    fn setup_rx_desc(&mut self, buf: &mut Buffer) {
        // Fresh descriptor; forget any stale completion for this slot.
        self.rx_results.remove(&buf.index());
        buf.desc.flags = 0;
    }

    fn proc_rx_desc(&mut self, buf: &Buffer) -> Option<RxStatus> {
        self.rx_results.get(&buf.index()).cloned()
    }

    fn put_rx_buf(&mut self, head: BufId) {
        self.rx_head = Some(head);
    }

    fn start_rx(&mut self) {
        self.rx_running = true;
    }

    fn stop_rx(&mut self) -> bool {
        self.rx_running = false;
        self.rx_stops += 1;
        true
    }

    fn key_cache_size(&self) -> u16 {
        self.key_cache_size
    }

    fn supports_mcast_key_search(&self) -> bool {
        self.mcast_key_search
    }

    fn needs_split_mic(&self) -> bool {
        self.split_mic
    }

    fn key_write(&mut self, ix: u16, key: &KeyMaterial, mac: Option<MacAddr>) -> bool {
        if ix >= self.key_cache_size {
            return false;
        }
        self.keys.insert(ix, (key.clone(), mac));
        true
    }

    fn key_reset(&mut self, ix: u16) {
        self.keys.remove(&ix);
        self.key_resets.push(ix);
    }

    fn pending_interrupts(&mut self) -> u32 {
        let p = self.pending_irq;
        self.pending_irq = 0;
        p
    }

    fn set_interrupt_mask(&mut self, mask: u32) {
        self.imask = mask;
    }

    fn interrupt_mask(&self) -> u32 {
        self.imask
    }

    fn raise_tx_trigger_level(&mut self) {
        self.trigger_level_raises += 1;
    }

    fn tsf(&self) -> u64 {
        self.tsf
    }

    fn set_slot_time(&mut self, short: bool) {
        self.slot_short = Some(short);
    }
}
