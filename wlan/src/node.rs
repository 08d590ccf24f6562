//! Station (peer) table.
//!
//! One [`PeerNode`] per associated station, shared behind `Arc` so the
//! interrupt path can hold a peer across a table update. Mutable state
//! lives in per-peer locks; the table lock only covers membership.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use desc_pool::BufId;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{Result, WlanError};
use crate::keycache::KeySlotGroup;
use crate::types::{AccessCategory, MacAddr, PeerId, VapId};

/// Per-peer power-save and U-APSD state. Guarded by the peer's `ps` lock,
/// which is taken before any transmit-queue lock.
#[derive(Debug)]
pub struct PsState {
    /// Station advertised U-APSD at association.
    pub uapsd_capable: bool,
    /// Per-AC delivery enablement negotiated at association.
    pub delivery_enabled: [bool; AccessCategory::COUNT],
    /// Negotiated service-period cap; bounds both delivery and overflow
    /// queues.
    pub max_sp: usize,

    /// Current PM bit state; true while the station sleeps.
    pub sleeping: bool,
    /// Sleeping and U-APSD capable; trigger frames are honored.
    pub triggerable: bool,
    /// A service period is open; further triggers are ignored until EOSP
    /// completes.
    pub sp_in_progress: bool,
    /// Sequence number of the last frame that started a service period,
    /// per AC. Retransmitted triggers must not start a second period.
    pub last_trigger_seq: [Option<u16>; AccessCategory::COUNT],

    /// Frames staged for the next service period, descriptor-chained in
    /// order. At most `max_sp` entries.
    pub delivery: VecDeque<BufId>,
    /// Spill-over beyond one service period. At most `max_sp` entries.
    pub overflow: VecDeque<BufId>,
}

impl PsState {
    fn new() -> Self {
        Self {
            uapsd_capable: false,
            delivery_enabled: [false; AccessCategory::COUNT],
            max_sp: 0,
            sleeping: false,
            triggerable: false,
            sp_in_progress: false,
            last_trigger_seq: [None; AccessCategory::COUNT],
            delivery: VecDeque::new(),
            overflow: VecDeque::new(),
        }
    }

    /// Frames currently buffered for power-save delivery.
    pub fn buffered(&self) -> usize {
        self.delivery.len() + self.overflow.len()
    }

    /// Whether a frame queued for this peer should go through the
    /// power-save path rather than straight to a data queue.
    pub fn wants_ps_delivery(&self) -> bool {
        self.triggerable
    }
}

/// Rolling per-peer transmit/receive accounting.
#[derive(Debug, Default, Clone)]
pub struct PeerStats {
    pub tx_ok: u64,
    pub tx_err: u64,
    pub rx_frames: u64,
    pub last_rssi: i8,
    pub last_antenna: u8,
}

/// An associated station.
pub struct PeerNode {
    pub id: PeerId,
    pub mac: MacAddr,
    pub vap: VapId,
    /// Hardware key slots assigned to this peer, if any.
    pub key: Mutex<Option<KeySlotGroup>>,
    pub ps: Mutex<PsState>,
    pub stats: Mutex<PeerStats>,
}

impl PeerNode {
    fn new(id: PeerId, mac: MacAddr, vap: VapId) -> Self {
        Self {
            id,
            mac,
            vap,
            key: Mutex::new(None),
            ps: Mutex::new(PsState::new()),
            stats: Mutex::new(PeerStats::default()),
        }
    }

    /// Record U-APSD negotiation results.
    pub fn configure_uapsd(&self, enabled: [bool; AccessCategory::COUNT], max_sp: usize) {
        let mut ps = self.ps.lock();
        ps.uapsd_capable = enabled.iter().any(|&e| e);
        ps.delivery_enabled = enabled;
        ps.max_sp = max_sp;
    }
}

/// Peer membership, indexed by id with a MAC-address side map.
pub struct PeerTable {
    slots: Vec<Option<Arc<PeerNode>>>,
    by_mac: HashMap<MacAddr, PeerId>,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            by_mac: HashMap::new(),
        }
    }

    pub fn add(&mut self, mac: MacAddr, vap: VapId) -> Result<Arc<PeerNode>> {
        if self.by_mac.contains_key(&mac) {
            return Err(WlanError::InvalidState("peer already associated"));
        }
        let id = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(WlanError::TooManyPeers)? as PeerId;
        let peer = Arc::new(PeerNode::new(id, mac, vap));
        self.slots[id as usize] = Some(peer.clone());
        self.by_mac.insert(mac, id);
        Ok(peer)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Arc<PeerNode>> {
        let peer = self.slots.get_mut(id as usize)?.take()?;
        self.by_mac.remove(&peer.mac);
        Some(peer)
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<PeerNode>> {
        self.slots.get(id as usize)?.clone()
    }

    pub fn find(&self, mac: MacAddr) -> Option<Arc<PeerNode>> {
        let id = *self.by_mac.get(&mac)?;
        self.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PeerNode>> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}
