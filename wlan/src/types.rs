//! Shared identifiers and radio-level types.

use core::fmt;

/// Station table index.
pub type PeerId = u16;

/// Virtual interface index.
pub type VapId = u8;

/// Hardware transmit queue number.
pub type HwQueueId = u8;

/// IEEE 802.11 MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Group bit (I/G) of the first octet.
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// Operating mode of a virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    Station,
    HostAp,
    Adhoc,
    Monitor,
}

/// Radio channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Center frequency in MHz.
    pub mhz: u16,
    /// Band / modulation flags, opaque to the data path.
    pub flags: u16,
}

impl Channel {
    pub const fn new(mhz: u16) -> Self {
        Self { mhz, flags: 0 }
    }
}

/// WME access category, in increasing priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessCategory {
    BestEffort = 0,
    Background = 1,
    Video = 2,
    Voice = 3,
}

impl AccessCategory {
    pub const COUNT: usize = 4;

    pub const ALL: [AccessCategory; 4] = [
        AccessCategory::BestEffort,
        AccessCategory::Background,
        AccessCategory::Video,
        AccessCategory::Voice,
    ];

    /// Map a QoS TID (0..16) to its access category.
    pub fn from_tid(tid: u8) -> AccessCategory {
        match tid & 0x7 {
            1 | 2 => AccessCategory::Background,
            4 | 5 => AccessCategory::Video,
            6 | 7 => AccessCategory::Voice,
            _ => AccessCategory::BestEffort,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Time unit (TU) of 1024 microseconds, as used by beacon timers.
pub const TU_SHIFT: u32 = 10;

/// Convert a TSF value (microseconds) to TUs.
#[inline]
pub fn tsf_to_tu(tsf: u64) -> u32 {
    (tsf >> TU_SHIFT) as u32
}

/// Convert TUs to a TSF delta in microseconds.
#[inline]
pub fn tu_to_tsf(tu: u32) -> u64 {
    (tu as u64) << TU_SHIFT
}
