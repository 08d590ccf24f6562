//! Data-path error type.

use core::fmt;

pub type Result<T> = core::result::Result<T, WlanError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WlanError {
    /// No frame buffers free; caller should back off and retry.
    Busy,
    /// No key-cache slot group could satisfy the allocation.
    NoKeySlots,
    /// Requested key index is outside the key cache.
    InvalidKeyIndex(u16),
    /// Requested global key index is already claimed.
    KeyIndexInUse(u16),
    /// Hardware has no transmit queue left to hand out.
    NoHwQueue,
    /// VAP table is full.
    TooManyVaps,
    /// Peer table is full.
    TooManyPeers,
    /// Peer id does not name a live station.
    UnknownPeer(u16),
    /// VAP id does not name a live interface.
    UnknownVap(u8),
    /// Frame too short to carry a MAC header.
    RuntFrame(usize),
    /// Operation not valid in the current state.
    InvalidState(&'static str),
    /// The device model reported a failure.
    Hardware(&'static str),
}

impl fmt::Display for WlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WlanError::Busy => write!(f, "no frame buffers available"),
            WlanError::NoKeySlots => write!(f, "key cache full"),
            WlanError::InvalidKeyIndex(ix) => write!(f, "key index {ix} out of range"),
            WlanError::KeyIndexInUse(ix) => write!(f, "key index {ix} already in use"),
            WlanError::NoHwQueue => write!(f, "no hardware transmit queue available"),
            WlanError::TooManyVaps => write!(f, "VAP table full"),
            WlanError::TooManyPeers => write!(f, "peer table full"),
            WlanError::UnknownPeer(id) => write!(f, "unknown peer {id}"),
            WlanError::UnknownVap(id) => write!(f, "unknown VAP {id}"),
            WlanError::RuntFrame(len) => write!(f, "runt frame of {len} bytes"),
            WlanError::InvalidState(what) => write!(f, "invalid state: {what}"),
            WlanError::Hardware(what) => write!(f, "hardware error: {what}"),
        }
    }
}
