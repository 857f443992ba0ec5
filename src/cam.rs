//! The hardware key cache (CAM).
//!
//! Every slot consists of eight 32-bit words:
//!
//! | Word | Content |
//! | ---- | ------- |
//! | 0 | key ID, algorithm, valid bit, MAC\[0..2\] |
//! | 1 | MAC\[2..6\] |
//! | 2-5 | 128-bit key |
//! | 6-7 | reserved, must be zero |
//!
//! The words are accessed indirectly, by writing the data to `CAMWRITE` and then the word address
//! to `CAMCMD`. The hardware only trusts a slot once word zero has its valid bit set, so that word
//! is written last when programming and first when clearing.

use bitfield_struct::bitfield;

use crate::{
    crypto::{CamAlgorithm, CAM_KEY_LENGTH},
    ll::{IoResult, RegisterAccess, RegisterExt},
    regs::{CAMCMD, CAMCMD_CLR, CAMCMD_POLLING, CAMCMD_WRITE, CAMWRITE},
};

/// The slot reserved for group and default keys.
pub const DEFAULT_KEY_SLOT: SlotIndex = SlotIndex(0);
/// Number of words per slot.
const CAM_WORDS_PER_SLOT: u32 = 8;
/// Maximum number of slots any chip has.
pub const MAX_CAM_SLOTS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The index of a CAM slot.
pub struct SlotIndex(u8);
impl SlotIndex {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

#[bitfield(u32)]
struct CamCtl0 {
    #[bits(2)]
    key_id: u8,
    #[bits(3)]
    algorithm: u8,
    #[bits(10)]
    __: u16,
    valid: bool,
    /// The first two bytes of the MAC address.
    mac_low: u16,
}

/// Slots, that are never handed out to pairwise keys.
const fn reserved_mask() -> u64 {
    1 << DEFAULT_KEY_SLOT.0
}

/// Allocation state of the key cache.
///
/// Only pairwise keys are tracked here. Group keys get [DEFAULT_KEY_SLOT] without an allocation.
pub struct KeyCache {
    allocated: u64,
    limit: usize,
}
impl KeyCache {
    /// Create an empty key cache with `limit` slots.
    pub const fn new(limit: usize) -> Self {
        Self {
            allocated: 0,
            limit: if limit > MAX_CAM_SLOTS {
                MAX_CAM_SLOTS
            } else {
                limit
            },
        }
    }
    /// Allocate a slot for a key.
    ///
    /// Returns [None] if all slots are taken. The caller then has to keep the key in software.
    pub fn allocate_slot(&mut self, is_pairwise: bool) -> Option<SlotIndex> {
        if !is_pairwise {
            return Some(DEFAULT_KEY_SLOT);
        }
        let free = (!(self.allocated | reserved_mask())).trailing_zeros() as usize;
        if free >= self.limit {
            debug!("No free CAM slot left.");
            return None;
        }
        self.allocated |= 1 << free;
        trace!("Allocated CAM slot {}.", free);
        Some(SlotIndex(free as u8))
    }
    /// Return a slot to the pool.
    pub fn release_slot(&mut self, slot: SlotIndex) {
        if slot.index() < MAX_CAM_SLOTS {
            self.allocated &= !(1 << slot.index());
        }
    }
    pub fn is_allocated(&self, slot: SlotIndex) -> bool {
        slot.index() < MAX_CAM_SLOTS && self.allocated & (1 << slot.index()) != 0
    }
    /// Wipe the whole CAM and forget all allocations.
    pub fn init<B: RegisterAccess>(&mut self, bus: &mut B) -> IoResult<()> {
        self.allocated = 0;
        bus.write_4(CAMCMD, CAMCMD_POLLING | CAMCMD_CLR)
    }
    /// Write a key into a slot.
    ///
    /// This has to be called from a context, that may sleep.
    pub fn program<B: RegisterAccess>(
        &self,
        bus: &mut B,
        slot: SlotIndex,
        algorithm: CamAlgorithm,
        key_id: u8,
        key: &[u8; CAM_KEY_LENGTH],
        mac: &[u8; 6],
    ) -> IoResult<()> {
        let result = program_slot(bus, slot, algorithm, key_id, key, mac);
        if result.is_err() {
            warn!("Failed to program CAM slot {}.", slot.0);
        } else {
            debug!("Programmed CAM slot {} with key ID {}.", slot.0, key_id);
        }
        result
    }
    /// Invalidate a slot and release it.
    pub fn clear<B: RegisterAccess>(&mut self, bus: &mut B, slot: SlotIndex) -> IoResult<()> {
        let result = (0..6).try_for_each(|word| write_word(bus, slot, word, 0));
        if result.is_err() {
            warn!("Failed to clear CAM slot {}.", slot.0);
        }
        self.release_slot(slot);
        result
    }
}

fn write_word<B: RegisterAccess>(
    bus: &mut B,
    slot: SlotIndex,
    word: u32,
    data: u32,
) -> IoResult<()> {
    bus.write_4(CAMWRITE, data)?;
    bus.write_4(
        CAMCMD,
        CAMCMD_POLLING | CAMCMD_WRITE | (u32::from(slot.0) * CAM_WORDS_PER_SLOT + word),
    )
}

fn program_slot<B: RegisterAccess>(
    bus: &mut B,
    slot: SlotIndex,
    algorithm: CamAlgorithm,
    key_id: u8,
    key: &[u8; CAM_KEY_LENGTH],
    mac: &[u8; 6],
) -> IoResult<()> {
    // Reserved words.
    write_word(bus, slot, 6, 0)?;
    write_word(bus, slot, 7, 0)?;

    for (word, chunk) in (2..).zip(key.chunks_exact(4)) {
        write_word(
            bus,
            slot,
            word,
            u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        )?;
    }
    write_word(
        bus,
        slot,
        1,
        u32::from_le_bytes([mac[2], mac[3], mac[4], mac[5]]),
    )?;

    let ctl0 = CamCtl0::new()
        .with_key_id(key_id & 0x03)
        .with_algorithm(algorithm.into_bits() & 0x07)
        .with_valid(true)
        .with_mac_low(u16::from_le_bytes([mac[0], mac[1]]));
    write_word(bus, slot, 0, ctl0.into_bits())
}
