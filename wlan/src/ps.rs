//! U-APSD power-save buffering and trigger evaluation.
//!
//! Frames for a sleeping U-APSD station are staged in two per-peer queues:
//! `delivery` holds at most one service period's worth (`max_sp` frames),
//! `overflow` holds the next period's worth. Both queues keep their
//! descriptors chained in order so a whole service period can be spliced
//! onto the shared delivery hardware queue in one motion.
//!
//! Trigger evaluation runs at interrupt time, before the deferred receive
//! pass, so the response frames can ride the ongoing service period.

use alloc::collections::VecDeque;

use desc_pool::{BufId, BufferPool};

use crate::frame;
use crate::node::PsState;
use crate::types::AccessCategory;

/// What the interrupt-time scan decided about one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerVerdict {
    /// Not a trigger; nothing to do.
    NotTrigger,
    /// PM bit toggled: the peer changed power state. No delivery happens on
    /// the same frame. The caller flushes buffered frames if the peer woke.
    StateChange,
    /// Retransmission of the trigger that opened the current or previous
    /// service period; ignored.
    Duplicate,
    /// A service period is already open.
    AlreadyInSp,
    /// Qualifying QoS frame on an AC not negotiated for delivery.
    AcNotDelivery,
    /// Frame opens a new service period.
    StartSp,
}

/// Evaluate one received frame against a peer's power-save state,
/// updating PM tracking and service-period bookkeeping.
///
/// Caller holds the peer's ps lock.
pub fn evaluate_trigger(ps: &mut PsState, fr: &[u8]) -> TriggerVerdict {
    let pm = frame::pm_bit(fr);
    if pm != ps.sleeping {
        ps.sleeping = pm;
        ps.sp_in_progress = false;
        ps.triggerable = pm && ps.uapsd_capable;
        return TriggerVerdict::StateChange;
    }
    if !ps.triggerable {
        return TriggerVerdict::NotTrigger;
    }
    if !frame::is_qos_data(fr) {
        return TriggerVerdict::NotTrigger;
    }
    let ac = AccessCategory::from_tid(frame::tid(fr));
    if !ps.delivery_enabled[ac.index()] {
        return TriggerVerdict::AcNotDelivery;
    }
    if ps.sp_in_progress {
        return TriggerVerdict::AlreadyInSp;
    }
    let seq = frame::seq_number(fr);
    if frame::retry(fr) && ps.last_trigger_seq[ac.index()] == Some(seq) {
        return TriggerVerdict::Duplicate;
    }
    ps.sp_in_progress = true;
    ps.last_trigger_seq[ac.index()] = Some(seq);
    TriggerVerdict::StartSp
}

/// Stage a frame for power-save delivery.
///
/// Returns the buffer evicted to make room, if any; the caller releases it
/// and accounts the drop. Queue bounds: delivery and overflow each hold at
/// most `max_sp` frames, so at most one eviction per enqueue.
pub fn uapsd_enqueue(ps: &mut PsState, pool: &mut BufferPool, id: BufId) -> Option<BufId> {
    // An emptied delivery queue promotes the overflow wholesale, keeping
    // arrival order; the chain links inside overflow are already in order.
    if ps.delivery.is_empty() && !ps.overflow.is_empty() {
        ps.delivery.append(&mut ps.overflow);
    }

    pool.unlink(id);
    let mut evicted = None;
    if ps.delivery.len() < ps.max_sp {
        if let Some(&tail) = ps.delivery.back() {
            pool.link(tail, id);
        }
        ps.delivery.push_back(id);
    } else {
        if ps.overflow.len() >= ps.max_sp {
            evicted = ps.overflow.pop_front();
        }
        if let Some(&tail) = ps.overflow.back() {
            pool.link(tail, id);
        }
        ps.overflow.push_back(id);
    }
    evicted
}

/// Take the staged service period out of the peer, still chained.
/// Used when a trigger starts delivery.
pub fn take_service_period(ps: &mut PsState) -> VecDeque<BufId> {
    core::mem::take(&mut ps.delivery)
}

/// Close the peer's service period after its EOSP frame completed, and
/// promote the overflow queue for the next trigger.
pub fn close_service_period(ps: &mut PsState) {
    ps.sp_in_progress = false;
    if ps.delivery.is_empty() && !ps.overflow.is_empty() {
        ps.delivery.append(&mut ps.overflow);
    }
}

/// Drain everything buffered for a peer, chained in order, for requeue when
/// the peer wakes or is torn down.
pub fn drain_buffered(ps: &mut PsState, pool: &mut BufferPool) -> VecDeque<BufId> {
    let mut all = core::mem::take(&mut ps.delivery);
    let mut overflow = core::mem::take(&mut ps.overflow);
    if let (Some(&tail), Some(&head)) = (all.back(), overflow.front()) {
        pool.link(tail, head);
    }
    all.append(&mut overflow);
    ps.sp_in_progress = false;
    all
}
