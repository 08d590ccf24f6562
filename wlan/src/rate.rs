//! Rate-control seam.
//!
//! The data path asks for a rate before writing each transmit descriptor
//! and reports the outcome after reclaim. Filtered completions never reach
//! `tx_complete`; the destination was in power save and the attempt says
//! nothing about the channel.

use crate::hal::TxStatus;
use crate::types::PeerId;

#[derive(Debug, Clone, Copy)]
pub struct RateChoice {
    pub rate: u8,
    pub tries: u8,
}

pub trait RateControl: Send {
    fn select(&mut self, peer: Option<PeerId>, len: usize, is_group: bool) -> RateChoice;

    fn tx_complete(&mut self, peer: Option<PeerId>, status: &TxStatus);
}

/// Fixed-rate policy; the default until something smarter is plugged in.
pub struct FixedRate {
    pub choice: RateChoice,
    pub completions: u64,
}

impl FixedRate {
    pub fn new(rate: u8, tries: u8) -> Self {
        Self {
            choice: RateChoice { rate, tries },
            completions: 0,
        }
    }
}

impl Default for FixedRate {
    fn default() -> Self {
        // 24 Mb/s OFDM, 4 tries.
        Self::new(0x0c, 4)
    }
}

impl RateControl for FixedRate {
    fn select(&mut self, _peer: Option<PeerId>, _len: usize, is_group: bool) -> RateChoice {
        if is_group {
            // Group frames go out once, at the basic rate.
            RateChoice {
                rate: self.choice.rate,
                tries: 1,
            }
        } else {
            self.choice
        }
    }

    fn tx_complete(&mut self, _peer: Option<PeerId>, _status: &TxStatus) {
        self.completions += 1;
    }
}
