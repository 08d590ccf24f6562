//! Device-wide counters.
//!
//! Plain integers behind the stats lock. Everything here is monotonic and
//! best-effort; nothing in the data path branches on a counter.

/// Number of PHY error sub-codes tracked in the histogram.
pub const PHY_ERR_KINDS: usize = 32;

/// Number of receive antennas tracked.
pub const ANTENNA_MAX: usize = 8;

#[derive(Debug, Clone)]
pub struct DeviceStats {
    // Interrupt controller.
    pub intr_total: u64,
    pub intr_fatal: u32,
    pub intr_rxorn: u32,
    pub intr_rxeol: u32,
    pub intr_txurn: u32,
    pub intr_bmiss: u32,
    pub resets: u32,

    // Transmit.
    pub tx_frames: u64,
    pub tx_ok: u64,
    pub tx_err: u64,
    pub tx_excessive_retries: u32,
    pub tx_fifo_underrun: u32,
    pub tx_filtered: u32,
    pub tx_no_buffer: u32,
    pub tx_short_retries: u64,
    pub tx_long_retries: u64,
    pub tx_queue_degraded: u32,
    pub tx_antenna: [u64; ANTENNA_MAX],

    // Receive.
    pub rx_frames: u64,
    pub rx_crc_err: u32,
    pub rx_fifo_err: u32,
    pub rx_phy_err: u32,
    pub rx_phy: [u32; PHY_ERR_KINDS],
    pub rx_decrypt_err: u32,
    pub rx_mic_err: u32,
    pub rx_too_short: u32,
    pub rx_too_long: u32,
    pub rx_no_buffer: u32,
    pub rx_antenna: [u64; ANTENNA_MAX],

    // Beacons.
    pub beacons_sent: u64,
    pub beacon_busy: u32,
    pub beacon_stuck_resets: u32,
    pub cab_queued: u64,

    // Power save.
    pub uapsd_triggers: u32,
    pub uapsd_dup_triggers: u32,
    pub uapsd_ignored_triggers: u32,
    pub uapsd_qos_null: u32,
    pub uapsd_overflow_evictions: u32,
    pub uapsd_eosp: u32,
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self {
            intr_total: 0,
            intr_fatal: 0,
            intr_rxorn: 0,
            intr_rxeol: 0,
            intr_txurn: 0,
            intr_bmiss: 0,
            resets: 0,
            tx_frames: 0,
            tx_ok: 0,
            tx_err: 0,
            tx_excessive_retries: 0,
            tx_fifo_underrun: 0,
            tx_filtered: 0,
            tx_no_buffer: 0,
            tx_short_retries: 0,
            tx_long_retries: 0,
            tx_queue_degraded: 0,
            tx_antenna: [0; ANTENNA_MAX],
            rx_frames: 0,
            rx_crc_err: 0,
            rx_fifo_err: 0,
            rx_phy_err: 0,
            rx_phy: [0; PHY_ERR_KINDS],
            rx_decrypt_err: 0,
            rx_mic_err: 0,
            rx_too_short: 0,
            rx_too_long: 0,
            rx_no_buffer: 0,
            rx_antenna: [0; ANTENNA_MAX],
            beacons_sent: 0,
            beacon_busy: 0,
            beacon_stuck_resets: 0,
            cab_queued: 0,
            uapsd_triggers: 0,
            uapsd_dup_triggers: 0,
            uapsd_ignored_triggers: 0,
            uapsd_qos_null: 0,
            uapsd_overflow_evictions: 0,
            uapsd_eosp: 0,
        }
    }
}

impl DeviceStats {
    /// Record a PHY error sub-code in the histogram.
    pub fn count_phy_err(&mut self, code: u8) {
        self.rx_phy_err += 1;
        let slot = (code as usize) % PHY_ERR_KINDS;
        self.rx_phy[slot] += 1;
    }

    /// Record which antenna a frame arrived on.
    pub fn count_rx_antenna(&mut self, antenna: u8) {
        let slot = (antenna as usize) % ANTENNA_MAX;
        self.rx_antenna[slot] += 1;
    }

    /// Record which antenna a frame went out on. Feeds the default
    /// antenna selection heuristic.
    pub fn count_tx_antenna(&mut self, antenna: u8) {
        let slot = (antenna as usize) % ANTENNA_MAX;
        self.tx_antenna[slot] += 1;
    }
}
