//! 802.11 frame header accessors.
//!
//! Frames move through the data path as byte slices; these helpers read and
//! patch the handful of header fields the driver cares about (power
//! management, QoS, sequence control). Full frame parsing belongs to the
//! layer above.

use alloc::vec;
use alloc::vec::Vec;

use crate::types::MacAddr;

/// FCS length trimmed from received frames.
pub const CRC_LEN: usize = 4;

/// Smallest frame the data path will pass upward (an ACK, sans FCS).
pub const MIN_FRAME_LEN: usize = 10;

/// Length of a three-address QoS data header.
pub const QOS_HDR_LEN: usize = 26;

// Frame control byte 0.
pub const FC0_VERSION_MASK: u8 = 0x03;
pub const FC0_TYPE_MASK: u8 = 0x0c;
pub const FC0_TYPE_MGT: u8 = 0x00;
pub const FC0_TYPE_CTL: u8 = 0x04;
pub const FC0_TYPE_DATA: u8 = 0x08;
pub const FC0_SUBTYPE_MASK: u8 = 0xf0;
pub const FC0_SUBTYPE_BEACON: u8 = 0x80;
pub const FC0_SUBTYPE_QOS: u8 = 0x80;
pub const FC0_SUBTYPE_QOS_NULL: u8 = 0xc0;

// Frame control byte 1.
pub const FC1_DIR_MASK: u8 = 0x03;
pub const FC1_DIR_FROMDS: u8 = 0x02;
pub const FC1_RETRY: u8 = 0x08;
pub const FC1_PWR_MGT: u8 = 0x10;
pub const FC1_MORE_DATA: u8 = 0x20;

// QoS control field, first byte.
pub const QOS_TID_MASK: u8 = 0x0f;
pub const QOS_EOSP: u8 = 0x10;

const ADDR1: usize = 4;
const ADDR2: usize = 10;
const ADDR3: usize = 16;
const SEQ: usize = 22;
const QOS: usize = 24;

/// Offset of the timestamp field in a beacon body (right after the header).
pub const BEACON_TSTAMP: usize = 24;

#[inline]
pub fn frame_type(frame: &[u8]) -> u8 {
    frame[0] & FC0_TYPE_MASK
}

#[inline]
pub fn frame_subtype(frame: &[u8]) -> u8 {
    frame[0] & FC0_SUBTYPE_MASK
}

#[inline]
pub fn is_data(frame: &[u8]) -> bool {
    frame_type(frame) == FC0_TYPE_DATA
}

/// QoS data or QoS null; the frames that can open a U-APSD service period.
#[inline]
pub fn is_qos_data(frame: &[u8]) -> bool {
    is_data(frame) && frame[0] & FC0_SUBTYPE_QOS != 0
}

#[inline]
pub fn is_qos_null(frame: &[u8]) -> bool {
    is_data(frame) && frame_subtype(frame) == FC0_SUBTYPE_QOS_NULL
}

/// TID of a QoS frame. Callers must have checked [`is_qos_data`].
#[inline]
pub fn tid(frame: &[u8]) -> u8 {
    frame[QOS] & QOS_TID_MASK
}

#[inline]
pub fn pm_bit(frame: &[u8]) -> bool {
    frame[1] & FC1_PWR_MGT != 0
}

#[inline]
pub fn retry(frame: &[u8]) -> bool {
    frame[1] & FC1_RETRY != 0
}

#[inline]
pub fn more_data(frame: &[u8]) -> bool {
    frame[1] & FC1_MORE_DATA != 0
}

#[inline]
pub fn set_more_data(frame: &mut [u8], on: bool) {
    if on {
        frame[1] |= FC1_MORE_DATA;
    } else {
        frame[1] &= !FC1_MORE_DATA;
    }
}

#[inline]
pub fn eosp(frame: &[u8]) -> bool {
    is_qos_data(frame) && frame[QOS] & QOS_EOSP != 0
}

/// Set end-of-service-period. Frames without a QoS control field are left
/// untouched; only QoS data carries the bit.
#[inline]
pub fn set_eosp(frame: &mut [u8]) {
    if frame.len() > QOS && is_qos_data(frame) {
        frame[QOS] |= QOS_EOSP;
    }
}

/// 12-bit sequence number from the sequence-control field.
#[inline]
pub fn seq_number(frame: &[u8]) -> u16 {
    let raw = u16::from_le_bytes([frame[SEQ], frame[SEQ + 1]]);
    raw >> 4
}

#[inline]
pub fn set_seq_number(frame: &mut [u8], seq: u16) {
    let frag = frame[SEQ] & 0x0f;
    let raw = (seq << 4) | frag as u16;
    frame[SEQ..SEQ + 2].copy_from_slice(&raw.to_le_bytes());
}

#[inline]
pub fn addr1(frame: &[u8]) -> MacAddr {
    let mut a = [0u8; 6];
    a.copy_from_slice(&frame[ADDR1..ADDR1 + 6]);
    MacAddr(a)
}

#[inline]
pub fn addr2(frame: &[u8]) -> MacAddr {
    let mut a = [0u8; 6];
    a.copy_from_slice(&frame[ADDR2..ADDR2 + 6]);
    MacAddr(a)
}

/// Write the timestamp-adjust value into a beacon body.
pub fn set_beacon_timestamp(frame: &mut [u8], tsf: u64) {
    frame[BEACON_TSTAMP..BEACON_TSTAMP + 8].copy_from_slice(&tsf.to_le_bytes());
}

pub fn beacon_timestamp(frame: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&frame[BEACON_TSTAMP..BEACON_TSTAMP + 8]);
    u64::from_le_bytes(b)
}

/// Build a QoS-null frame from us (`src`) to a station (`dst`), used to
/// terminate a service period when no data is buffered.
pub fn make_qos_null(dst: MacAddr, src: MacAddr, bssid: MacAddr, tid: u8) -> Vec<u8> {
    let mut f = vec![0u8; QOS_HDR_LEN];
    f[0] = FC0_TYPE_DATA | FC0_SUBTYPE_QOS_NULL;
    f[1] = FC1_DIR_FROMDS;
    f[ADDR1..ADDR1 + 6].copy_from_slice(&dst.0);
    f[ADDR2..ADDR2 + 6].copy_from_slice(&src.0);
    f[ADDR3..ADDR3 + 6].copy_from_slice(&bssid.0);
    f[QOS] = tid & QOS_TID_MASK;
    f
}

/// Build a minimal QoS data frame. Test scaffolding for the data path; real
/// frames arrive fully formed from the layer above.
pub fn make_qos_data(dst: MacAddr, src: MacAddr, tid: u8, seq: u16, body: &[u8]) -> Vec<u8> {
    let mut f = vec![0u8; QOS_HDR_LEN + body.len()];
    f[0] = FC0_TYPE_DATA | FC0_SUBTYPE_QOS;
    f[ADDR1..ADDR1 + 6].copy_from_slice(&dst.0);
    f[ADDR2..ADDR2 + 6].copy_from_slice(&src.0);
    f[ADDR3..ADDR3 + 6].copy_from_slice(&src.0);
    f[QOS] = tid & QOS_TID_MASK;
    f[QOS_HDR_LEN..].copy_from_slice(body);
    set_seq_number(&mut f, seq);
    f
}
