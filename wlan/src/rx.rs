//! Receive ring and frame classification.
//!
//! The receive ring is a fixed set of buffers whose descriptors form a
//! linked list ending in a self-linked tail. The self-link keeps a stalled
//! DMA engine re-writing the last buffer instead of running off the chain;
//! in exchange, software must never consume a buffer whose descriptor still
//! links to itself, because the hardware may overwrite it at any time.
//!
//! Consumed buffers are reposted at the tail with a fresh payload: the new
//! tail self-links and the previous tail is patched to point at it.

use alloc::collections::VecDeque;
use alloc::vec;

use desc_pool::{BufId, BufferPool};

use crate::error::{Result, WlanError};
use crate::frame::{CRC_LEN, MIN_FRAME_LEN};
use crate::hal::{Hal, RxError, RxStatus};

/// Why a received frame never made it upstairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxDrop {
    Crc,
    Fifo,
    Phy(u8),
    Decrypt,
    /// MIC failure; the layer above is notified before the drop, and
    /// monitor interfaces still see the frame.
    Mic,
    TooShort,
    /// Frame spilled into a second descriptor.
    TooLong,
}

/// Decide what to do with a completed receive descriptor.
///
/// On accept, returns the payload length with the FCS trimmed off. A
/// decrypt error without a matched key slot is not an error at all: the
/// hardware never actually decrypted, so the frame passes through for
/// software handling.
pub fn classify(status: &RxStatus) -> core::result::Result<usize, RxDrop> {
    if status.more {
        return Err(RxDrop::TooLong);
    }
    match status.error {
        Some(RxError::Crc) => return Err(RxDrop::Crc),
        Some(RxError::Fifo) => return Err(RxDrop::Fifo),
        Some(RxError::Phy(code)) => return Err(RxDrop::Phy(code)),
        Some(RxError::Decrypt) => {
            if status.key_index.is_some() {
                return Err(RxDrop::Decrypt);
            }
        }
        Some(RxError::Mic) => return Err(RxDrop::Mic),
        None => {}
    }
    let trimmed = status.len.saturating_sub(CRC_LEN);
    if trimmed < MIN_FRAME_LEN {
        return Err(RxDrop::TooShort);
    }
    Ok(trimmed)
}

pub struct RxRing {
    /// Buffers in hardware order; front is the next to complete.
    order: VecDeque<BufId>,
    buf_size: usize,
    running: bool,
}

impl RxRing {
    /// Claim `count` buffers from the pool and build the ring. The ring
    /// keeps them for its lifetime.
    pub fn new(pool: &mut BufferPool, count: usize, buf_size: usize) -> Result<Self> {
        debug_assert!(count >= 2, "ring needs a consumable head and a tail");
        let mut order = VecDeque::with_capacity(count);
        for _ in 0..count {
            let id = pool.acquire().ok_or(WlanError::Busy)?;
            pool.get_mut(id).set_payload(vec![0u8; buf_size]);
            order.push_back(id);
        }
        Ok(Self {
            order,
            buf_size,
            running: false,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn head(&self) -> Option<BufId> {
        self.order.front().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = BufId> + '_ {
        self.order.iter().copied()
    }

    /// Chain every descriptor in ring order, self-link the tail, hand the
    /// head to the hardware and enable receive.
    pub fn start<H: Hal>(&mut self, pool: &mut BufferPool, hal: &mut H) {
        let ids: alloc::vec::Vec<BufId> = self.order.iter().copied().collect();
        for &id in &ids {
            let buf = pool.get_mut(id);
            if buf.is_device_owned() {
                buf.mark_driver_owned();
            }
            if !buf.has_payload() {
                buf.set_payload(vec![0u8; self.buf_size]);
            }
            hal.setup_rx_desc(buf);
            buf.set_completed(false);
            buf.mark_device_owned();
        }
        for pair in ids.windows(2) {
            pool.link(pair[0], pair[1]);
        }
        if let Some(&tail) = ids.last() {
            pool.self_link(tail);
        }
        if let Some(&head) = ids.first() {
            hal.put_rx_buf(head);
        }
        hal.start_rx();
        self.running = true;
    }

    /// Disable receive DMA. Buffers return to driver ownership so they can
    /// be flushed or rebuilt.
    pub fn stop<H: Hal>(&mut self, pool: &mut BufferPool, hal: &mut H) -> bool {
        let ok = hal.stop_rx();
        for &id in &self.order {
            let buf = pool.get_mut(id);
            if buf.is_device_owned() {
                buf.mark_driver_owned();
            }
        }
        self.running = false;
        ok
    }

    /// Drop every buffered payload. Ring must be stopped.
    pub fn flush(&mut self, pool: &mut BufferPool) {
        debug_assert!(!self.running);
        for &id in &self.order {
            let buf = pool.get_mut(id);
            buf.take_payload();
            buf.set_completed(false);
        }
    }

    /// Pop the head buffer for consumption. The caller must already have
    /// verified it is complete and not the self-linked tail.
    pub fn pop_head(&mut self) -> Option<BufId> {
        self.order.pop_front()
    }

    /// Return a consumed buffer to the tail of the ring with a fresh
    /// payload, re-establishing the self-linked sentinel.
    pub fn repost<H: Hal>(&mut self, pool: &mut BufferPool, hal: &mut H, id: BufId) {
        {
            let buf = pool.get_mut(id);
            debug_assert!(buf.is_driver_owned());
            buf.set_payload(vec![0u8; self.buf_size]);
            hal.setup_rx_desc(buf);
            buf.set_completed(false);
            buf.mark_device_owned();
        }
        pool.self_link(id);
        if let Some(&prev_tail) = self.order.back() {
            pool.link(prev_tail, id);
        } else {
            // Ring emptied entirely; this buffer becomes the new head.
            hal.put_rx_buf(id);
        }
        self.order.push_back(id);
    }
}
