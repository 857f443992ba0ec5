//! The PCIe TX descriptor ring.
//!
//! The MAC walks the descriptors of a queue by following their next address field, so the ring
//! has to be linked once up front. After that, descriptors are only ever reset in place, which
//! keeps the linkage intact.

use crate::tx::{PcieTxDesc, TxDescriptor, TxRequest, PCIE_TX_DESC_LEN};

/// A ring of `N` PCIe TX descriptors.
///
/// `base_addr` is the bus address of the first descriptor. The transport is responsible for
/// making [Self::descriptors] visible to the device at that address.
pub struct TxRing<const N: usize> {
    descriptors: [PcieTxDesc; N],
    base_addr: u32,
    /// The next descriptor to be filled.
    cur: usize,
    /// Number of descriptors currently owned by the hardware.
    queued: usize,
}
impl<const N: usize> TxRing<N> {
    /// Create a new ring and link all descriptors.
    pub fn new(base_addr: u32) -> Self {
        const { assert!(N >= 2, "A TX ring needs at least two descriptors.") };
        let mut ring = Self {
            descriptors: [PcieTxDesc::default(); N],
            base_addr,
            cur: 0,
            queued: 0,
        };
        for (i, desc) in ring.descriptors.iter_mut().enumerate() {
            desc.set_next(Self::address_of(base_addr, (i + 1) % N));
        }
        trace!("Initialized TX ring with {} descriptors.", N);
        ring
    }
    fn address_of(base_addr: u32, index: usize) -> u32 {
        base_addr + (index * PCIE_TX_DESC_LEN) as u32
    }
    /// The bus address of descriptor `index`.
    pub fn address(&self, index: usize) -> u32 {
        Self::address_of(self.base_addr, index % N)
    }
    pub fn descriptors(&self) -> &[PcieTxDesc; N] {
        &self.descriptors
    }
    pub fn descriptor(&self, index: usize) -> Option<&PcieTxDesc> {
        self.descriptors.get(index)
    }
    pub const fn queued(&self) -> usize {
        self.queued
    }
    pub const fn is_full(&self) -> bool {
        self.queued == N
    }
    /// Fill the next free descriptor with `fill` and hand it to the hardware.
    ///
    /// Returns the index of the descriptor, or [None] if the ring is full.
    pub fn push(
        &mut self,
        request: &TxRequest,
        buffer_addr: u32,
        fill: impl FnOnce(&mut PcieTxDesc, &TxRequest),
    ) -> Option<usize> {
        if self.is_full() {
            debug!("TX ring is full.");
            return None;
        }
        let index = self.cur;
        let desc = &mut self.descriptors[index];
        fill(desc, request);
        desc.set_buffer(buffer_addr);
        desc.set_owned_by_hw(true);
        self.cur = (self.cur + 1) % N;
        self.queued += 1;
        Some(index)
    }
    /// Reclaim the oldest descriptor, once the hardware is done with it.
    ///
    /// Returns the index of the reclaimed descriptor.
    pub fn reclaim(&mut self) -> Option<usize> {
        if self.queued == 0 {
            return None;
        }
        let index = (self.cur + N - self.queued) % N;
        let desc = &mut self.descriptors[index];
        if desc.is_owned_by_hw() {
            return None;
        }
        desc.reset();
        self.queued -= 1;
        Some(index)
    }
    /// Reset all descriptors, keeping the ring linkage.
    pub fn reset(&mut self) {
        self.descriptors.iter_mut().for_each(PcieTxDesc::reset);
        self.cur = 0;
        self.queued = 0;
    }
    /// The raw bytes of descriptor `index`.
    pub fn as_bytes(&self, index: usize) -> Option<&[u8]> {
        self.descriptors.get(index).map(|desc| desc.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::r92c_fill_tx_desc;

    const BASE: u32 = 0x1000_0000;

    #[test]
    fn ring_is_linked() {
        let ring = TxRing::<4>::new(BASE);
        for (i, desc) in ring.descriptors().iter().enumerate() {
            assert_eq!(desc.next(), BASE + (((i + 1) % 4) * 64) as u32);
        }
        assert_eq!(ring.address(5), BASE + 64);
    }
    #[test]
    fn push_and_reclaim() {
        let mut ring = TxRing::<2>::new(BASE);
        let request = TxRequest {
            len: 100,
            ..Default::default()
        };
        assert_eq!(ring.push(&request, 0x2000, r92c_fill_tx_desc), Some(0));
        assert_eq!(ring.push(&request, 0x3000, r92c_fill_tx_desc), Some(1));
        assert!(ring.is_full());
        assert_eq!(ring.push(&request, 0x4000, r92c_fill_tx_desc), None);

        // Still owned by the hardware.
        assert_eq!(ring.reclaim(), None);
        ring.descriptors[0].set_owned_by_hw(false);
        assert_eq!(ring.reclaim(), Some(0));
        assert_eq!(ring.descriptor(0).map(PcieTxDesc::buffer), Some(0));
        assert_eq!(ring.descriptor(0).map(PcieTxDesc::next), Some(BASE + 64));
        assert_eq!(ring.push(&request, 0x4000, r92c_fill_tx_desc), Some(0));
    }
    #[test]
    fn reset_keeps_linkage() {
        let mut ring = TxRing::<3>::new(BASE);
        ring.push(&TxRequest::default(), 0x2000, r92c_fill_tx_desc);
        ring.reset();
        assert_eq!(ring.queued(), 0);
        assert!(ring
            .descriptors()
            .iter()
            .enumerate()
            .all(|(i, desc)| !desc.is_owned_by_hw() && desc.next() == ring.address(i + 1)));
    }
}
