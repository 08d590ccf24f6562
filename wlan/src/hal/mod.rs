//! Hardware abstraction boundary.
//!
//! The data path drives the device exclusively through [`Hal`]. Descriptor
//! contents (rates, key slots, interrupt requests) cross this boundary as
//! plain structs; the implementation translates them into whatever register
//! and descriptor layout the silicon wants.
//!
//! [`SoftHal`] is a deterministic software device used by the tests.

pub mod soft;

pub use soft::SoftHal;

use desc_pool::{BufId, Buffer};

use crate::error::Result;
use crate::keycache::KeyMaterial;
use crate::types::{Channel, HwQueueId, MacAddr, OpMode};

/// Interrupt status and mask bits.
pub mod mask {
    /// Receive descriptors completed.
    pub const RX: u32 = 1 << 0;
    /// Transmit descriptors completed.
    pub const TX: u32 = 1 << 1;
    /// Software beacon alert: next beacon is due.
    pub const SWBA: u32 = 1 << 2;
    /// Beacon miss (station mode).
    pub const BMISS: u32 = 1 << 3;
    /// Receive ring ran out of linked descriptors.
    pub const RXEOL: u32 = 1 << 4;
    /// Receive FIFO overrun; requires a chip reset on affected parts.
    pub const RXORN: u32 = 1 << 5;
    /// Transmit FIFO underrun.
    pub const TXURN: u32 = 1 << 6;
    /// Unrecoverable hardware fault.
    pub const FATAL: u32 = 1 << 7;
}

/// What a hardware transmit queue is for. Affects arbitration and gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxQueueKind {
    /// Regular WME data queue.
    Data,
    /// Beacon queue; fires on the beacon timer.
    Beacon,
    /// Content-after-beacon queue, gated behind beacon transmission.
    Cab,
    /// Shared U-APSD delivery queue.
    Uapsd,
}

/// WME channel-access parameters for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxQueueParams {
    pub aifs: u8,
    pub cw_min: u16,
    pub cw_max: u16,
    /// TXOP burst limit in units of 32 microseconds. Zero disables bursting.
    pub burst_time: u16,
}

/// Frame classification handed to the descriptor writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Normal,
    Beacon,
    ProbeResp,
}

/// Per-frame transmit descriptor parameters.
#[derive(Debug, Clone)]
pub struct TxDescSetup {
    pub pkt_type: PacketType,
    /// Transmit rate code.
    pub rate: u8,
    /// Attempts at `rate` before the frame is failed.
    pub tries: u8,
    /// Hardware key slot for on-chip encryption.
    pub key_index: Option<u16>,
    /// 0 selects automatic antenna.
    pub antenna: u8,
    /// Suppress the ACK requirement (group-addressed and beacon frames).
    pub no_ack: bool,
}

impl TxDescSetup {
    pub fn normal(rate: u8, tries: u8) -> Self {
        Self {
            pkt_type: PacketType::Normal,
            rate,
            tries,
            key_index: None,
            antenna: 0,
            no_ack: false,
        }
    }

    pub fn beacon(rate: u8) -> Self {
        Self {
            pkt_type: PacketType::Beacon,
            rate,
            tries: 1,
            key_index: None,
            antenna: 0,
            no_ack: true,
        }
    }
}

/// Transmit completion report for one descriptor.
#[derive(Debug, Clone)]
pub struct TxStatus {
    pub ok: bool,
    pub excessive_retries: bool,
    pub fifo_underrun: bool,
    /// Frame was filtered (destination in power save); rate control must not
    /// see it as a real failure.
    pub filtered: bool,
    pub short_retries: u8,
    pub long_retries: u8,
    /// ACK RSSI.
    pub rssi: i8,
    pub antenna: u8,
    /// Sequence number the hardware actually transmitted, when reported.
    pub final_seq: Option<u16>,
    pub timestamp: u32,
}

impl TxStatus {
    pub fn success() -> Self {
        Self {
            ok: true,
            excessive_retries: false,
            fifo_underrun: false,
            filtered: false,
            short_retries: 0,
            long_retries: 0,
            rssi: 40,
            antenna: 1,
            final_seq: None,
            timestamp: 0,
        }
    }

    pub fn failed_retries() -> Self {
        Self {
            ok: false,
            excessive_retries: true,
            ..Self::success()
        }
    }
}

/// Receive error classification, in decreasing precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    Crc,
    Fifo,
    /// PHY error with its hardware sub-code.
    Phy(u8),
    /// Hardware decryption failed.
    Decrypt,
    /// Michael MIC verification failed.
    Mic,
}

/// Receive completion report for one descriptor.
#[derive(Debug, Clone)]
pub struct RxStatus {
    /// Bytes in the buffer, FCS included.
    pub len: usize,
    pub rssi: i8,
    pub rate: u8,
    pub antenna: u8,
    pub timestamp: u32,
    /// Key slot the hardware matched while decrypting, if any.
    pub key_index: Option<u16>,
    pub error: Option<RxError>,
    /// Frame continues in the next descriptor (oversized; dropped).
    pub more: bool,
}

impl RxStatus {
    pub fn clean(len: usize) -> Self {
        Self {
            len,
            rssi: 35,
            rate: 0x0c,
            antenna: 1,
            timestamp: 0,
            key_index: None,
            error: None,
            more: false,
        }
    }

    pub fn with_error(len: usize, error: RxError) -> Self {
        Self {
            error: Some(error),
            ..Self::clean(len)
        }
    }
}

/// The device model.
///
/// One implementation per chip family. All methods take `&mut self`; the
/// caller holds the HAL lock for the duration of a call and never across
/// two calls.
pub trait Hal {
    // -- Reset and channel --------------------------------------------------

    /// Reset the chip onto a channel. `full` discards calibration state.
    fn reset(&mut self, mode: OpMode, chan: Channel, full: bool) -> Result<()>;

    // -- Transmit queues ----------------------------------------------------

    /// Claim a hardware queue. Returns `None` when the chip is out of queues.
    fn setup_tx_queue(&mut self, kind: TxQueueKind) -> Option<HwQueueId>;

    /// Apply WME parameters to a queue. Returns false if the queue rejects
    /// them.
    fn update_tx_queue(&mut self, q: HwQueueId, params: &TxQueueParams) -> bool;

    /// Program the queue's head descriptor pointer.
    fn put_tx_buf(&mut self, q: HwQueueId, head: BufId);

    /// Kick DMA on a queue.
    fn start_tx(&mut self, q: HwQueueId);

    /// Halt DMA on a queue. Returns false if the queue refused to stop.
    fn stop_tx(&mut self, q: HwQueueId) -> bool;

    /// Frames the hardware still holds for a queue.
    fn num_tx_pending(&mut self, q: HwQueueId) -> usize;

    // -- Descriptors --------------------------------------------------------

    /// Write transmit control words for a buffer.
    fn setup_tx_desc(&mut self, buf: &mut Buffer, params: &TxDescSetup);

    /// Poll a transmit descriptor. `None` while the hardware still owns it.
    fn proc_tx_desc(&mut self, buf: &Buffer) -> Option<TxStatus>;

    /// Initialize a receive descriptor over the buffer's payload.
    fn setup_rx_desc(&mut self, buf: &mut Buffer);

    /// Poll a receive descriptor. `None` while the hardware still owns it.
    fn proc_rx_desc(&mut self, buf: &Buffer) -> Option<RxStatus>;

    // -- Receive engine -----------------------------------------------------

    /// Program the receive head descriptor pointer.
    fn put_rx_buf(&mut self, head: BufId);

    /// Enable the receive engine.
    fn start_rx(&mut self);

    /// Disable the receive engine. Returns false if DMA failed to stop.
    fn stop_rx(&mut self) -> bool;

    // -- Key cache ----------------------------------------------------------

    fn key_cache_size(&self) -> u16;

    /// Chip can match group keys by transmitter address.
    fn supports_mcast_key_search(&self) -> bool;

    /// Chip stores Michael MIC keys in companion slots.
    fn needs_split_mic(&self) -> bool;

    /// Program one key slot. Returns false on rejection.
    fn key_write(&mut self, ix: u16, key: &KeyMaterial, mac: Option<MacAddr>) -> bool;

    /// Invalidate one key slot.
    fn key_reset(&mut self, ix: u16);

    // -- Interrupts ---------------------------------------------------------

    /// Read and clear the pending interrupt status.
    fn pending_interrupts(&mut self) -> u32;

    fn set_interrupt_mask(&mut self, mask: u32);

    fn interrupt_mask(&self) -> u32;

    /// Bump the transmit DMA trigger level after a FIFO underrun.
    fn raise_tx_trigger_level(&mut self);

    // -- Timers and misc ----------------------------------------------------

    /// 64-bit TSF, microseconds.
    fn tsf(&self) -> u64;

    fn set_slot_time(&mut self, short: bool);
}
