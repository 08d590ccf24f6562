//! Hardware transmit queues.
//!
//! Each queue shadows one hardware DMA ring: a FIFO of buffer ids whose
//! descriptors are chained through their link fields. Enqueue follows the
//! two-case protocol: an idle ring gets its head pointer programmed and DMA
//! kicked; a running ring gets the new descriptor patched onto the previous
//! tail. The ring state is tracked explicitly rather than inferred from a
//! dangling link pointer.

use alloc::collections::VecDeque;

use desc_pool::{BufId, BufferPool};

use crate::hal::{Hal, TxQueueKind, TxStatus};
use crate::types::HwQueueId;

/// DMA ring activity, from the driver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    /// Nothing queued; next enqueue programs the head pointer.
    Idle,
    /// Descriptors are chained; next enqueue patches the tail link.
    Running,
}

pub struct TxQueue {
    hw_id: HwQueueId,
    kind: TxQueueKind,
    q: VecDeque<BufId>,
    /// Tail of the descriptor chain; the link to patch for the next frame.
    link: Option<BufId>,
    state: RingState,
    total_queued: u64,
    total_reclaimed: u64,
    /// Reclaim progress snapshot for stuck detection.
    watchdog_mark: u64,
    stuck_count: u32,
}

impl TxQueue {
    pub fn new(hw_id: HwQueueId, kind: TxQueueKind) -> Self {
        Self {
            hw_id,
            kind,
            q: VecDeque::new(),
            link: None,
            state: RingState::Idle,
            total_queued: 0,
            total_reclaimed: 0,
            watchdog_mark: 0,
            stuck_count: 0,
        }
    }

    pub fn hw_id(&self) -> HwQueueId {
        self.hw_id
    }

    pub fn kind(&self) -> TxQueueKind {
        self.kind
    }

    pub fn depth(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Oldest queued frame, next in line for reclaim.
    pub fn head(&self) -> Option<BufId> {
        self.q.front().copied()
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn total_queued(&self) -> u64 {
        self.total_queued
    }

    /// Append one frame and hand it to the hardware.
    pub fn enqueue<H: Hal>(&mut self, pool: &mut BufferPool, hal: &mut H, id: BufId) {
        self.chain(pool, hal, id, false);
        if self.state == RingState::Idle {
            hal.start_tx(self.hw_id);
            self.state = RingState::Running;
        }
    }

    /// Append one frame without kicking DMA. Used for the CAB queue, whose
    /// transmission is gated behind the beacon; [`kick`](Self::kick) starts
    /// it once the chain is complete.
    pub fn enqueue_gated<H: Hal>(&mut self, pool: &mut BufferPool, hal: &mut H, id: BufId) {
        self.chain(pool, hal, id, true);
    }

    fn chain<H: Hal>(&mut self, pool: &mut BufferPool, hal: &mut H, id: BufId, gated: bool) {
        {
            let buf = pool.get_mut(id);
            debug_assert!(buf.is_driver_owned());
            buf.desc.link = None;
            buf.mark_device_owned();
        }
        match self.link {
            None => {
                debug_assert!(self.state == RingState::Idle || gated);
                hal.put_tx_buf(self.hw_id, id);
            }
            Some(prev) => pool.link(prev, id),
        }
        self.link = Some(id);
        self.q.push_back(id);
        self.total_queued += 1;
    }

    /// Start DMA on a gated queue if it has work.
    pub fn kick<H: Hal>(&mut self, hal: &mut H) {
        if self.state == RingState::Idle && !self.q.is_empty() {
            hal.start_tx(self.hw_id);
            self.state = RingState::Running;
        }
    }

    /// Splice a pre-chained run of descriptors onto the queue as one unit.
    /// The chain's internal links must already be set in order. DMA is
    /// started at most once, regardless of chain length.
    pub fn splice<H: Hal>(&mut self, pool: &mut BufferPool, hal: &mut H, mut chain: VecDeque<BufId>) {
        let (first, last) = match (chain.front(), chain.back()) {
            (Some(&f), Some(&l)) => (f, l),
            _ => return,
        };
        for &id in &chain {
            pool.get_mut(id).mark_device_owned();
        }
        pool.unlink(last);
        match self.link {
            None => {
                hal.put_tx_buf(self.hw_id, first);
            }
            Some(prev) => pool.link(prev, first),
        }
        if self.state == RingState::Idle {
            hal.start_tx(self.hw_id);
            self.state = RingState::Running;
        }
        self.link = Some(last);
        self.total_queued += chain.len() as u64;
        self.q.append(&mut chain);
    }

    /// Reclaim the head frame if the hardware is done with it.
    ///
    /// Returns `None` when the queue is empty or the head descriptor is
    /// still in flight; reclaim never reaches past an in-progress head.
    /// The buffer comes back driver-owned; releasing it is the caller's
    /// job.
    pub fn reclaim_one<H: Hal>(
        &mut self,
        pool: &mut BufferPool,
        hal: &mut H,
    ) -> Option<(BufId, TxStatus)> {
        let &head = self.q.front()?;
        let status = hal.proc_tx_desc(pool.get(head))?;
        self.q.pop_front();
        if self.q.is_empty() {
            self.link = None;
            self.state = RingState::Idle;
        }
        pool.get_mut(head).mark_driver_owned();
        self.total_reclaimed += 1;
        Some((head, status))
    }

    /// Throw away every queued frame. The caller must have stopped DMA on
    /// this queue first. Buffers go straight back to the pool.
    pub fn force_drain(&mut self, pool: &mut BufferPool) -> usize {
        let mut freed = 0;
        while let Some(id) = self.q.pop_front() {
            let buf = pool.get_mut(id);
            if buf.is_device_owned() {
                buf.mark_driver_owned();
            }
            pool.release(id);
            freed += 1;
        }
        self.link = None;
        self.state = RingState::Idle;
        self.stuck_count = 0;
        freed
    }

    /// Periodic progress check. Returns the number of consecutive ticks the
    /// queue has held frames without reclaiming any.
    pub fn watchdog_tick(&mut self) -> u32 {
        if self.q.is_empty() || self.total_reclaimed != self.watchdog_mark {
            self.stuck_count = 0;
        } else {
            self.stuck_count += 1;
        }
        self.watchdog_mark = self.total_reclaimed;
        self.stuck_count
    }
}
