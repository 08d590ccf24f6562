//! Descriptor-chained frame buffer pool.
//!
//! A pool of frame buffers, each permanently paired with one hardware
//! descriptor. Queues chain descriptors by buffer index; the pool owns the
//! backing storage and the free list.
//!
//! # Design Philosophy
//!
//! - **Ownership tracking**: every buffer is Free, DriverOwned, or
//!   DeviceOwned, and illegal transitions trip debug assertions
//! - **Index-based chaining**: descriptor link fields hold buffer indices,
//!   never raw addresses, so chains stay valid across reset
//! - **No interior locking**: callers serialize access with their own lock

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

/// Index of a buffer inside its pool. Doubles as the descriptor "address"
/// used in link fields.
pub type BufId = u16;

// ============================================================================
// Ownership
// ============================================================================

/// Who may touch a buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwnership {
    /// In the pool free list.
    Free,
    /// Held by the driver; payload may be read and written.
    DriverOwned,
    /// Posted to the device; hands off until completion.
    DeviceOwned,
}

impl BufferOwnership {
    pub fn is_free(&self) -> bool {
        *self == BufferOwnership::Free
    }

    pub fn can_access(&self) -> bool {
        *self == BufferOwnership::DriverOwned
    }

    pub fn is_device_owned(&self) -> bool {
        *self == BufferOwnership::DeviceOwned
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// One hardware descriptor.
///
/// The link field chains descriptors into a DMA list. A descriptor whose
/// link names its own buffer is self-linked, the resting state of a
/// receive-ring tail.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    /// Next descriptor in the chain, if any.
    pub link: Option<BufId>,
    /// Bytes of payload covered by this descriptor.
    pub data_len: usize,
    /// Control bits interpreted by the device model (interrupt request etc).
    pub flags: u32,
}

/// Descriptor control flags.
pub mod desc_flags {
    /// Request a transmit-completion interrupt for this descriptor.
    pub const INTREQ: u32 = 1 << 0;
}

impl Descriptor {
    pub const fn empty() -> Self {
        Self {
            link: None,
            data_len: 0,
            flags: 0,
        }
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Buffer
// ============================================================================

/// A frame buffer plus its descriptor.
pub struct Buffer {
    /// Buffer index within the pool.
    index: BufId,
    /// The hardware descriptor permanently bound to this buffer.
    pub desc: Descriptor,
    /// Frame payload. `None` while free or after the payload was handed off.
    payload: Option<Vec<u8>>,
    /// Opaque peer tag attached by the owner (station table index).
    peer: Option<u16>,
    /// Completion pre-scan marker. Set when an interrupt-time walk has
    /// already seen this descriptor complete, so the deferred pass does not
    /// re-query the device.
    completed: bool,
    /// Current ownership state.
    ownership: BufferOwnership,
}

impl Buffer {
    fn new(index: BufId) -> Self {
        Self {
            index,
            desc: Descriptor::empty(),
            payload: None,
            peer: None,
            completed: false,
            ownership: BufferOwnership::Free,
        }
    }

    /// Get buffer index.
    pub fn index(&self) -> BufId {
        self.index
    }

    /// Get payload as slice.
    ///
    /// # Panics
    /// Panics if the buffer is not DriverOwned or has no payload.
    pub fn payload(&self) -> &[u8] {
        assert!(
            self.ownership.can_access(),
            "BUG: Cannot access buffer not owned by driver (state: {:?})",
            self.ownership
        );
        self.payload.as_deref().expect("buffer has no payload")
    }

    /// Get payload as mutable slice.
    ///
    /// # Panics
    /// Panics if the buffer is not DriverOwned or has no payload.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        assert!(
            self.ownership.can_access(),
            "BUG: Cannot access buffer not owned by driver (state: {:?})",
            self.ownership
        );
        self.payload.as_deref_mut().expect("buffer has no payload")
    }

    /// Attach a payload, replacing any previous one.
    pub fn set_payload(&mut self, data: Vec<u8>) {
        debug_assert!(self.ownership.can_access());
        self.desc.data_len = data.len();
        self.payload = Some(data);
    }

    /// Detach the payload, leaving the buffer empty.
    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        debug_assert!(self.ownership.can_access());
        self.desc.data_len = 0;
        self.payload.take()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Peer tag, if one is attached.
    pub fn peer(&self) -> Option<u16> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: Option<u16>) {
        self.peer = peer;
    }

    /// True if the descriptor links to itself (receive-ring tail sentinel).
    pub fn is_self_linked(&self) -> bool {
        self.desc.link == Some(self.index)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn set_completed(&mut self, done: bool) {
        self.completed = done;
    }

    /// Get current ownership state.
    pub fn ownership(&self) -> BufferOwnership {
        self.ownership
    }

    pub fn is_free(&self) -> bool {
        self.ownership.is_free()
    }

    pub fn is_driver_owned(&self) -> bool {
        self.ownership.can_access()
    }

    pub fn is_device_owned(&self) -> bool {
        self.ownership.is_device_owned()
    }

    /// Mark buffer as allocated (Free -> DriverOwned).
    fn mark_allocated(&mut self) {
        debug_assert!(self.ownership.is_free(), "Buffer must be free to allocate");
        self.ownership = BufferOwnership::DriverOwned;
    }

    /// Mark buffer as device-owned (DriverOwned -> DeviceOwned).
    /// Call immediately before posting to the device.
    pub fn mark_device_owned(&mut self) {
        debug_assert!(
            self.ownership == BufferOwnership::DriverOwned,
            "Buffer must be driver-owned before device transfer"
        );
        self.ownership = BufferOwnership::DeviceOwned;
    }

    /// Mark buffer as driver-owned (DeviceOwned -> DriverOwned).
    /// Call after the device reports the descriptor complete.
    pub fn mark_driver_owned(&mut self) {
        debug_assert!(
            self.ownership == BufferOwnership::DeviceOwned,
            "Buffer must be device-owned before reclaim"
        );
        self.ownership = BufferOwnership::DriverOwned;
    }

    /// Mark buffer as free (DriverOwned -> Free).
    fn mark_free(&mut self) {
        debug_assert!(
            self.ownership == BufferOwnership::DriverOwned,
            "Buffer must be driver-owned before freeing"
        );
        self.ownership = BufferOwnership::Free;
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Fixed-size pool of descriptor-backed buffers with a free list.
pub struct BufferPool {
    /// All buffers, indexed by `BufId`.
    buffers: Vec<Buffer>,
    /// Free list (indices of free buffers).
    free_list: Vec<BufId>,
    /// Low-water mark: below this many free buffers the caller should
    /// throttle new transmit work.
    low_water: usize,
}

impl BufferPool {
    /// Create a pool of `count` buffers, all free.
    pub fn new(count: usize, low_water: usize) -> Self {
        assert!(count > 0, "Pool must hold at least one buffer");
        assert!(count <= BufId::MAX as usize, "Pool size exceeds index range");
        debug_assert!(low_water < count);

        let mut buffers = Vec::with_capacity(count);
        let mut free_list = Vec::with_capacity(count);
        for i in 0..count {
            buffers.push(Buffer::new(i as BufId));
            free_list.push(i as BufId);
        }
        // Hand out low indices first.
        free_list.reverse();

        Self {
            buffers,
            free_list,
            low_water,
        }
    }

    /// Allocate a buffer from the pool.
    ///
    /// Returns `None` if the pool is exhausted.
    pub fn acquire(&mut self) -> Option<BufId> {
        let id = self.free_list.pop()?;
        let buf = &mut self.buffers[id as usize];
        debug_assert!(buf.is_free(), "Allocated buffer must be free");
        buf.mark_allocated();
        buf.desc = Descriptor::empty();
        buf.completed = false;
        Some(id)
    }

    /// Return a buffer to the pool.
    ///
    /// Clears the payload, peer tag and descriptor state. The buffer must be
    /// driver-owned.
    pub fn release(&mut self, id: BufId) {
        let buf = &mut self.buffers[id as usize];
        debug_assert!(buf.is_driver_owned(), "Can only free driver-owned buffers");
        buf.payload = None;
        buf.peer = None;
        buf.completed = false;
        buf.desc = Descriptor::empty();
        buf.mark_free();
        self.free_list.push(id);
    }

    /// Get reference to buffer by index.
    ///
    /// # Panics
    /// Panics if index is out of range.
    pub fn get(&self, id: BufId) -> &Buffer {
        &self.buffers[id as usize]
    }

    /// Get mutable reference to buffer by index.
    ///
    /// # Panics
    /// Panics if index is out of range.
    pub fn get_mut(&mut self, id: BufId) -> &mut Buffer {
        &mut self.buffers[id as usize]
    }

    /// Chain `prev`'s descriptor to `next`.
    pub fn link(&mut self, prev: BufId, next: BufId) {
        self.buffers[prev as usize].desc.link = Some(next);
    }

    /// Point a descriptor's link at its own buffer (receive tail sentinel).
    pub fn self_link(&mut self, id: BufId) {
        self.buffers[id as usize].desc.link = Some(id);
    }

    /// Clear a descriptor's link.
    pub fn unlink(&mut self, id: BufId) {
        self.buffers[id as usize].desc.link = None;
    }

    /// Get number of available (free) buffers.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Get total number of buffers in pool.
    pub fn total(&self) -> usize {
        self.buffers.len()
    }

    /// Get number of buffers currently in use.
    pub fn in_use(&self) -> usize {
        self.buffers.len() - self.free_list.len()
    }

    /// Check if pool is empty (no free buffers).
    pub fn is_exhausted(&self) -> bool {
        self.free_list.is_empty()
    }

    /// True when free buffers have dropped below the low-water mark.
    pub fn below_low_water(&self) -> bool {
        self.free_list.len() < self.low_water
    }

    /// Iterate over all buffers.
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }
}

// ============================================================================
// Tests
// ============================================================================
