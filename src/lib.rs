//! # `rtwn-hal`
//! This is the chip-control core for Realtek RTL8192C, RTL8812A and RTL8821A based Wi-Fi
//! adapters, in both their PCIe and USB incarnations. It sits between a generic IEEE 802.11 stack
//! and the bus transport, and owns everything that requires knowledge of the chip itself.
//!
//! ## Hardware overview
//! This chapter will give a short overview of the parts of the chip, that this crate drives.
//!
//! ### Registers
//! All interaction with the chip happens through a flat register space, which is reached either
//! through PCIe MMIO or through USB vendor requests. The transport is not part of this crate, you
//! provide it by implementing [RegisterAccess]. Multi-byte registers are little-endian and we
//! do all the conversions internally.
//!
//! ### Firmware
//! The MAC contains an embedded 8051 microcontroller, which runs a firmware image that has to be
//! downloaded into its RAM on every power up. The image is written in 4 KiB pages through a
//! download window, after which the hardware computes a checksum and the firmware signals
//! readiness. See [firmware] for the exact sequence. Once the firmware is up, the host talks to
//! it through four host-to-chip (H2C) mailboxes and receives events through the chip-to-host
//! (C2H) channel.
//!
//! ### Key cache (CAM)
//! Hardware encryption and decryption is driven by a content addressable memory, which holds
//! one key per slot. Each slot consists of eight 32-bit words, that are written indirectly
//! through a command register. Word zero contains the valid bit, so it is always written last.
//!
//! ### Calibration
//! The RF front-end needs an IQ/LO calibration after every channel change. Newer chips can do
//! this themselves when asked by the host through an H2C command, older chips require the
//! host to sequence the baseband registers directly and compare the results of consecutive runs.
//!
//! ### Receive (RX) and transmit (TX)
//! Every frame handed up from the DMA engine is prefixed with a 24 byte RX descriptor, optionally
//! followed by a PHY status block. On USB chips, firmware reports like TX completion are also
//! delivered in-band as RX descriptors with a special bit set. The RTL8192C instead reports
//! events through a register window, which has to be polled.
//! Outgoing frames are prefixed by a TX descriptor, which carries queue selection, rate and
//! aggregation parameters. USB descriptors additionally carry an XOR checksum.
//!
//! ## Concurrency
//! All register access goes through one lock, the station table is protected by a separate one.
//! Anything that may sleep, like programming the key cache or polling for C2H events, is
//! deferred to a worker, which is driven by [Rtwn::run_worker] or manually through
//! [Rtwn::process_key_commands] and [Rtwn::poll_c2h].

#![cfg_attr(not(test), no_std)]
#![allow(unexpected_cfgs)]

#[macro_use]
extern crate defmt_or_log;

mod c2h;
mod calib;
mod cam;
mod chip;
mod crypto;
mod dma_list;
pub mod firmware;
mod ll;
#[cfg(test)]
mod mock;
mod node;
mod rates;
mod regs;
mod rx;
mod sync;
mod tx;
mod wmac;

pub use c2h::*;
pub use calib::*;
pub use cam::*;
pub use chip::*;
pub use crypto::*;
pub use dma_list::TxRing;
pub use firmware::{
    FirmwareStore, FirmwareVersion, FwCmdError, FwResetReason, H2cCommand, H2cMessage, LoadError,
};
pub use ll::{IoError, IoResult, RegisterAccess, RegisterExt};
pub use node::{NodeEntry, NodeTable};
pub use rates::*;
pub use rx::*;
pub use tx::*;
pub use wmac::*;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
