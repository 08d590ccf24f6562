//! Interrupt dispatch.
//!
//! Split in the usual two halves. [`Device::interrupt`] runs at
//! interrupt time: it reads and clears the hardware status, handles the
//! beacon alarm and the U-APSD trigger scan inline (both are
//! latency-sensitive) and hands everything else back as [`Pending`].
//! [`Device::service`] runs that deferred work from task context.

use core::sync::atomic::Ordering;

use crate::device::Device;
use crate::hal::{mask, Hal};
use crate::upper::UpperLayer;

/// Deferred work produced by the interrupt half.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub rx: bool,
    pub tx: bool,
    pub bmiss: bool,
    /// Unrecoverable hardware error; a full reset is required.
    pub fatal: bool,
    /// Receive DMA overrun; treated like fatal.
    pub rx_overrun: bool,
    /// Beacon queue missed enough intervals to warrant a stuck check.
    pub beacon_stuck: bool,
}

impl Pending {
    pub fn any(&self) -> bool {
        self.rx || self.tx || self.bmiss || self.fatal || self.rx_overrun || self.beacon_stuck
    }
}

impl<H: Hal> Device<H> {
    /// Interrupt-time half. Cheap, bounded work only.
    pub fn interrupt(&self, upper: &mut dyn UpperLayer) -> Pending {
        let imask = self.imask.load(Ordering::Acquire);
        let status = self.hal.lock().pending_interrupts() & imask;
        let mut pending = Pending::default();
        if status == 0 {
            return pending;
        }
        self.stats.lock().intr_total += 1;

        // Fatal conditions shut interrupts off until the deferred reset
        // has run; anything else the chip raises meanwhile is noise.
        if status & mask::FATAL != 0 {
            self.stats.lock().intr_fatal += 1;
            self.hal.lock().set_interrupt_mask(0);
            pending.fatal = true;
            return pending;
        }
        if status & mask::RXORN != 0 {
            self.stats.lock().intr_rxorn += 1;
            self.hal.lock().set_interrupt_mask(0);
            pending.rx_overrun = true;
            return pending;
        }

        if status & mask::RXEOL != 0 {
            // The ring ran dry; the poll below reposts everything the
            // hardware has finished with.
            self.stats.lock().intr_rxeol += 1;
            pending.rx = true;
        }
        if status & mask::TXURN != 0 {
            self.stats.lock().intr_txurn += 1;
            self.hal.lock().raise_tx_trigger_level();
        }
        if status & mask::SWBA != 0 {
            pending.beacon_stuck = self.beacon_send(upper);
        }
        if status & mask::RX != 0 {
            self.process_triggers(upper);
            pending.rx = true;
        }
        if status & mask::TX != 0 {
            pending.tx = true;
        }
        if status & mask::BMISS != 0 {
            self.stats.lock().intr_bmiss += 1;
            pending.bmiss = true;
        }
        pending
    }

    /// Task-context half.
    pub fn service(&self, pending: Pending, upper: &mut dyn UpperLayer) {
        if pending.fatal || pending.rx_overrun {
            log::error!(
                "{} error, resetting",
                if pending.fatal { "fatal hardware" } else { "rx overrun" }
            );
            self.reset(upper, true);
            return;
        }
        if pending.rx {
            self.rx_poll(upper);
        }
        if pending.tx {
            self.tx_reclaim(upper);
        }
        if pending.bmiss {
            upper.beacon_miss();
        }
        if pending.beacon_stuck {
            self.bstuck_check(upper);
        }
    }
}
