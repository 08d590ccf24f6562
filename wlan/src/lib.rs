//! 802.11 NIC data-path core.
//!
//! Everything between the protocol stack and the device model: the frame
//! buffer pool, transmit queues with their descriptor chains, the receive
//! ring, the hardware key cache, staggered/burst beacon scheduling, U-APSD
//! power-save delivery and the interrupt/reset controller.
//!
//! The device itself sits behind the [`hal::Hal`] trait; [`hal::SoftHal`]
//! is a pure-software model used by the test suite. The protocol stack
//! sits above the [`upper::UpperLayer`] trait.
//!
//! # Locking
//!
//! Lock order, outermost first: VAP table, key cache, peer table, per-peer
//! power-save state, transmit queue, rate control, buffer pool, HAL, stats.
//! Interrupt-time paths (trigger scan, beacon send) follow the same order
//! as deferred paths.

#![no_std]

extern crate alloc;

pub mod beacon;
pub mod device;
pub mod error;
pub mod frame;
pub mod hal;
pub mod intr;
pub mod keycache;
pub mod node;
pub mod ps;
pub mod rate;
pub mod rx;
pub mod stats;
pub mod txq;
pub mod types;
pub mod upper;
pub mod vap;

pub use desc_pool::{BufId, Buffer, BufferPool};
pub use device::{Config, Device};
pub use error::{Result, WlanError};
pub use types::{AccessCategory, Channel, MacAddr, OpMode, PeerId, VapId};

#[cfg(test)]
pub(crate) mod testutil;
