//! Virtual interface (VAP) table.
//!
//! Each VAP is one logical BSS on the shared radio. Beaconing VAPs own a
//! beacon slot and a multicast hold queue for frames deferred to the next
//! DTIM beacon.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use desc_pool::BufId;
use spin::Mutex;

use crate::error::{Result, WlanError};
use crate::types::{MacAddr, OpMode, VapId};

/// Beacon lifecycle of a VAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconState {
    /// No beacon buffer.
    Stopped,
    /// Buffer allocated and filled, not yet transmitted.
    Allocated,
    /// In the transmit rotation; regenerated before every send.
    Armed,
}

/// Mutable VAP state, guarded by the VAP lock (outermost in the order).
pub struct VapState {
    pub beacon_state: BeaconState,
    pub beacon_buf: Option<BufId>,
    /// Group-addressed frames held while stations sleep, released onto the
    /// CAB queue at DTIM.
    pub mcast: VecDeque<BufId>,
}

pub struct Vap {
    pub id: VapId,
    pub mode: OpMode,
    pub mac: MacAddr,
    /// Beacon slot; fixed for the life of the VAP.
    pub bslot: usize,
    pub state: Mutex<VapState>,
    /// Stations of this VAP currently in power save. Group-addressed
    /// traffic is deferred to DTIM while nonzero.
    pub ps_peers: AtomicUsize,
}

impl Vap {
    fn new(id: VapId, mode: OpMode, mac: MacAddr, bslot: usize) -> Self {
        Self {
            id,
            mode,
            mac,
            bslot,
            state: Mutex::new(VapState {
                beacon_state: BeaconState::Stopped,
                beacon_buf: None,
                mcast: VecDeque::new(),
            }),
            ps_peers: AtomicUsize::new(0),
        }
    }

    /// Host-AP and ad-hoc interfaces transmit beacons.
    pub fn is_beaconing(&self) -> bool {
        matches!(self.mode, OpMode::HostAp | OpMode::Adhoc)
    }

    pub fn has_ps_peers(&self) -> bool {
        self.ps_peers.load(Ordering::Relaxed) > 0
    }

    pub fn ps_peer_joined(&self) {
        self.ps_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ps_peer_left(&self) {
        let prev = self.ps_peers.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }
}

/// VAP membership plus beacon slot assignment.
pub struct VapTable {
    slots: Vec<Option<Arc<Vap>>>,
    /// Beacon slot occupancy; one slot per possible VAP.
    bslots: Vec<bool>,
    /// Beacon interval in TUs, shared across all VAPs.
    pub beacon_interval: u16,
}

impl VapTable {
    pub fn new(max_vaps: usize, beacon_interval: u16) -> Self {
        let mut slots = Vec::with_capacity(max_vaps);
        slots.resize_with(max_vaps, || None);
        Self {
            slots,
            bslots: alloc::vec![false; max_vaps],
            beacon_interval,
        }
    }

    pub fn max_vaps(&self) -> usize {
        self.slots.len()
    }

    pub fn add(&mut self, mode: OpMode, mac: MacAddr) -> Result<Arc<Vap>> {
        let id = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(WlanError::TooManyVaps)?;
        // Beacon slots are scarce only for beaconing modes, but assigning
        // one to every VAP keeps the id space simple.
        let bslot = self
            .bslots
            .iter()
            .position(|&taken| !taken)
            .ok_or(WlanError::TooManyVaps)?;
        self.bslots[bslot] = true;
        let vap = Arc::new(Vap::new(id as VapId, mode, mac, bslot));
        self.slots[id] = Some(vap.clone());
        Ok(vap)
    }

    pub fn remove(&mut self, id: VapId) -> Option<Arc<Vap>> {
        let vap = self.slots.get_mut(id as usize)?.take()?;
        self.bslots[vap.bslot] = false;
        Some(vap)
    }

    pub fn get(&self, id: VapId) -> Option<Arc<Vap>> {
        self.slots.get(id as usize)?.clone()
    }

    /// VAP owning a beacon slot.
    pub fn by_bslot(&self, bslot: usize) -> Option<Arc<Vap>> {
        self.iter().find(|v| v.bslot == bslot).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Vap>> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of VAPs currently in the beacon rotation.
    pub fn beaconing_count(&self) -> usize {
        self.iter().filter(|v| v.is_beaconing()).count()
    }
}
