//! Hardware key-cache slot management.
//!
//! The chip holds 128 key slots. TKIP with hardware Michael needs companion
//! slots at fixed architectural offsets: the MIC key lives 64 slots above
//! the cipher key, and parts with split TKIP storage keep a separate receive
//! key 32 slots up (with its own MIC companion at +32+64). Allocation
//! therefore hands out slot *groups*, and the bitmap search has to find
//! groups whose members are all free at once.
//!
//! The first [`GLOBAL_KEY_SLOTS`] indices are reserved for global (group)
//! keys at construction, together with their companions, and are never
//! returned to the free map; deleting a global key only releases the claim.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Result, WlanError};

/// Number of global key indices (WEP-style default keys).
pub const GLOBAL_KEY_SLOTS: u16 = 4;

/// Architectural size of the key cache bitmap.
pub const KEY_CACHE_MAX: u16 = 128;

/// Slot offset of a TKIP MIC companion.
const MIC_OFFSET: u16 = 64;

/// Slot offset of the split receive key.
const SPLIT_RX_OFFSET: u16 = 32;

/// Cipher selector for key-cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Wep,
    Tkip,
    AesCcm,
    /// Pass-through slot used for address matching only.
    Clear,
}

impl CipherKind {
    /// TKIP keeps its Michael keys in companion slots.
    pub fn needs_mic(&self) -> bool {
        *self == CipherKind::Tkip
    }
}

/// Key bytes handed to the device model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub cipher: CipherKind,
    pub key: Vec<u8>,
    pub tx_mic: [u8; 8],
    pub rx_mic: [u8; 8],
}

impl KeyMaterial {
    pub fn new(cipher: CipherKind, key: &[u8]) -> Self {
        Self {
            cipher,
            key: key.to_vec(),
            tx_mic: [0; 8],
            rx_mic: [0; 8],
        }
    }
}

/// The set of hardware slots backing one logical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySlotGroup {
    /// Transmit cipher key; the index the rest of the driver refers to.
    pub primary: u16,
    /// Transmit MIC companion (TKIP).
    pub tx_mic: Option<u16>,
    /// Separate receive cipher key (split-TKIP parts).
    pub rx: Option<u16>,
    /// Receive MIC companion (split-TKIP parts).
    pub rx_mic: Option<u16>,
}

impl KeySlotGroup {
    pub fn single(ix: u16) -> Self {
        Self {
            primary: ix,
            tx_mic: None,
            rx: None,
            rx_mic: None,
        }
    }

    pub fn pair(ix: u16) -> Self {
        Self {
            primary: ix,
            tx_mic: Some(ix + MIC_OFFSET),
            rx: None,
            rx_mic: None,
        }
    }

    pub fn two_pair(ix: u16) -> Self {
        Self {
            primary: ix,
            tx_mic: Some(ix + MIC_OFFSET),
            rx: Some(ix + SPLIT_RX_OFFSET),
            rx_mic: Some(ix + SPLIT_RX_OFFSET + MIC_OFFSET),
        }
    }

    /// All hardware slots in the group.
    pub fn slots(&self) -> impl Iterator<Item = u16> {
        [Some(self.primary), self.tx_mic, self.rx, self.rx_mic]
            .into_iter()
            .flatten()
    }
}

/// Slot allocator over the key-cache bitmap.
pub struct KeyCache {
    /// One bit per slot; set means unavailable.
    map: Vec<u8>,
    size: u16,
    split_mic: bool,
    mcast_key_search: bool,
    /// Which global indices currently hold a key.
    global_claimed: [bool; GLOBAL_KEY_SLOTS as usize],
}

impl KeyCache {
    pub fn new(size: u16, split_mic: bool, mcast_key_search: bool) -> Self {
        let size = size.min(KEY_CACHE_MAX);
        let mut cache = Self {
            map: vec![0u8; (KEY_CACHE_MAX / 8) as usize],
            size,
            split_mic,
            mcast_key_search,
            global_claimed: [false; GLOBAL_KEY_SLOTS as usize],
        };
        // Slots the chip doesn't have are permanently unavailable.
        for ix in size..KEY_CACHE_MAX {
            cache.set(ix);
        }
        // Reserve the global key indices and every companion they could
        // ever need, so dynamic allocation can never collide with them.
        for ix in 0..GLOBAL_KEY_SLOTS {
            cache.set(ix);
            cache.set(ix + MIC_OFFSET);
            if split_mic {
                cache.set(ix + SPLIT_RX_OFFSET);
                cache.set(ix + SPLIT_RX_OFFSET + MIC_OFFSET);
            }
        }
        cache
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn split_mic(&self) -> bool {
        self.split_mic
    }

    pub fn mcast_key_search(&self) -> bool {
        self.mcast_key_search
    }

    fn set(&mut self, ix: u16) {
        self.map[(ix / 8) as usize] |= 1 << (ix % 8);
    }

    fn clear(&mut self, ix: u16) {
        self.map[(ix / 8) as usize] &= !(1 << (ix % 8));
    }

    pub fn is_taken(&self, ix: u16) -> bool {
        self.map[(ix / 8) as usize] & (1 << (ix % 8)) != 0
    }

    /// Allocate slots for a per-station key.
    pub fn alloc_unicast(&mut self, cipher: CipherKind) -> Option<KeySlotGroup> {
        if cipher.needs_mic() {
            if self.split_mic {
                self.alloc_two_pair()
            } else {
                self.alloc_pair()
            }
        } else {
            self.alloc_single()
        }
    }

    /// Claim a global key index.
    ///
    /// With multicast key search the hardware matches group keys by
    /// transmitter address, so the slot comes from the dynamic space
    /// instead of the fixed index.
    pub fn alloc_global(&mut self, index: u16, cipher: CipherKind) -> Result<KeySlotGroup> {
        if index >= GLOBAL_KEY_SLOTS {
            return Err(WlanError::InvalidKeyIndex(index));
        }
        if self.mcast_key_search {
            return self.alloc_unicast(cipher).ok_or(WlanError::NoKeySlots);
        }
        if self.global_claimed[index as usize] {
            return Err(WlanError::KeyIndexInUse(index));
        }
        self.global_claimed[index as usize] = true;
        let group = if cipher.needs_mic() {
            if self.split_mic {
                KeySlotGroup::two_pair(index)
            } else {
                KeySlotGroup::pair(index)
            }
        } else {
            KeySlotGroup::single(index)
        };
        Ok(group)
    }

    /// Release a slot group.
    ///
    /// Global indices stay reserved in the bitmap; only the claim drops.
    pub fn free(&mut self, group: &KeySlotGroup) {
        if group.primary < GLOBAL_KEY_SLOTS {
            self.global_claimed[group.primary as usize] = false;
            return;
        }
        for ix in group.slots() {
            self.clear(ix);
        }
    }

    /// Single free slot, anywhere in the cache.
    fn alloc_single(&mut self) -> Option<KeySlotGroup> {
        for (i, &b) in self.map.iter().enumerate() {
            if b == 0xff {
                continue;
            }
            let bit = (!b).trailing_zeros() as u16;
            let ix = i as u16 * 8 + bit;
            self.set(ix);
            return Some(KeySlotGroup::single(ix));
        }
        None
    }

    /// Key plus MIC companion at +64. Merging each candidate byte with the
    /// byte 64 slots up makes a zero bit mean "both free".
    fn alloc_pair(&mut self) -> Option<KeySlotGroup> {
        let nbytes = self.map.len();
        for i in 0..nbytes / 2 {
            let merged = self.map[i] | self.map[i + 8];
            if merged == 0xff {
                continue;
            }
            let bit = (!merged).trailing_zeros() as u16;
            let ix = i as u16 * 8 + bit;
            let group = KeySlotGroup::pair(ix);
            for s in group.slots() {
                self.set(s);
            }
            return Some(group);
        }
        None
    }

    /// Key, receive key and both MIC companions: +32, +64, +96.
    fn alloc_two_pair(&mut self) -> Option<KeySlotGroup> {
        let nbytes = self.map.len();
        for i in 0..nbytes / 4 {
            let merged = self.map[i] | self.map[i + 4] | self.map[i + 8] | self.map[i + 12];
            if merged == 0xff {
                continue;
            }
            let bit = (!merged).trailing_zeros() as u16;
            let ix = i as u16 * 8 + bit;
            let group = KeySlotGroup::two_pair(ix);
            for s in group.slots() {
                self.set(s);
            }
            return Some(group);
        }
        None
    }
}
