//! Low level register access.
//!
//! The chip exposes a flat 16-bit register space. How that space is reached depends on the bus,
//! so the transport is abstracted through [RegisterAccess]. Everything above this module uses
//! the width-specific helpers from [RegisterExt].

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A register write wasn't accepted by the bus.
pub struct IoError;

/// Result type for register writes.
pub type IoResult<T> = Result<T, IoError>;

/// The register primitive provided by the bus transport.
///
/// Multi-byte accesses are passed through as raw bytes in the order they appear on the bus, which
/// is little-endian for all registers of these chips.
pub trait RegisterAccess {
    /// Read `buf.len()` bytes starting at `addr`.
    ///
    /// Reads can't fail. A transport that loses a read fills the buffer with whatever it has,
    /// just like the hardware would return garbage.
    fn read(&mut self, addr: u16, buf: &mut [u8]);
    /// Write `data` starting at `addr`.
    fn write(&mut self, addr: u16, data: &[u8]) -> IoResult<()>;
    /// Wait for at least `us` microseconds.
    ///
    /// In task context the transport may sleep here, otherwise it has to busy-wait. The RX path
    /// never calls this.
    fn delay_us(&mut self, us: u32);
}
impl<T: RegisterAccess + ?Sized> RegisterAccess for &mut T {
    #[inline]
    fn read(&mut self, addr: u16, buf: &mut [u8]) {
        (**self).read(addr, buf)
    }
    #[inline]
    fn write(&mut self, addr: u16, data: &[u8]) -> IoResult<()> {
        (**self).write(addr, data)
    }
    #[inline]
    fn delay_us(&mut self, us: u32) {
        (**self).delay_us(us)
    }
}

/// Width specific accessors and read-modify-write helpers.
///
/// This is implemented for every [RegisterAccess].
pub trait RegisterExt: RegisterAccess {
    #[inline]
    fn read_1(&mut self, addr: u16) -> u8 {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf);
        buf[0]
    }
    #[inline]
    fn read_2(&mut self, addr: u16) -> u16 {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf);
        u16::from_le_bytes(buf)
    }
    #[inline]
    fn read_4(&mut self, addr: u16) -> u32 {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf);
        u32::from_le_bytes(buf)
    }
    #[inline]
    fn write_1(&mut self, addr: u16, value: u8) -> IoResult<()> {
        self.write(addr, &[value])
    }
    #[inline]
    fn write_2(&mut self, addr: u16, value: u16) -> IoResult<()> {
        self.write(addr, &value.to_le_bytes())
    }
    #[inline]
    fn write_4(&mut self, addr: u16, value: u32) -> IoResult<()> {
        self.write(addr, &value.to_le_bytes())
    }
    /// Clear the bits in `clear` and set the bits in `set`.
    fn setbits_1(&mut self, addr: u16, clear: u8, set: u8) -> IoResult<()> {
        let value = (self.read_1(addr) & !clear) | set;
        self.write_1(addr, value)
    }
    /// Clear the bits in `clear` and set the bits in `set`.
    fn setbits_2(&mut self, addr: u16, clear: u16, set: u16) -> IoResult<()> {
        let value = (self.read_2(addr) & !clear) | set;
        self.write_2(addr, value)
    }
    /// Clear the bits in `clear` and set the bits in `set`.
    fn setbits_4(&mut self, addr: u16, clear: u32, set: u32) -> IoResult<()> {
        let value = (self.read_4(addr) & !clear) | set;
        self.write_4(addr, value)
    }
    /// Modify a single byte of a 32-bit register.
    ///
    /// `clear` and `set` are given as 32-bit masks and `shift` selects the byte, so only that
    /// byte is touched on the bus.
    fn setbits_1_shift(&mut self, addr: u16, clear: u32, set: u32, shift: u16) -> IoResult<()> {
        let bits = u32::from(shift) * 8;
        self.setbits_1(addr + shift, (clear >> bits) as u8, (set >> bits) as u8)
    }
    /// Read a baseband register.
    #[inline]
    fn bb_read(&mut self, addr: u16) -> u32 {
        self.read_4(addr)
    }
    /// Write a baseband register.
    #[inline]
    fn bb_write(&mut self, addr: u16, value: u32) -> IoResult<()> {
        self.write_4(addr, value)
    }
    #[inline]
    fn bb_setbits(&mut self, addr: u16, clear: u32, set: u32) -> IoResult<()> {
        self.setbits_4(addr, clear, set)
    }
    /// Write a contiguous block, like a chunk of firmware.
    #[inline]
    fn write_block(&mut self, addr: u16, data: &[u8]) -> IoResult<()> {
        self.write(addr, data)
    }
    /// Poll `condition` up to `attempts` times, with `delay_us` between polls.
    ///
    /// Returns `true` as soon as the condition holds.
    fn poll_until(
        &mut self,
        attempts: usize,
        delay_us: u32,
        mut condition: impl FnMut(&mut Self) -> bool,
    ) -> bool {
        for _ in 0..attempts {
            if condition(self) {
                return true;
            }
            self.delay_us(delay_us);
        }
        false
    }
}
impl<T: RegisterAccess + ?Sized> RegisterExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;

    #[test]
    fn multi_byte_access_is_little_endian() {
        let mut bus = MockBus::new();
        bus.write_4(0x100, 0x1234_5678).unwrap();
        assert_eq!(bus.read_1(0x100), 0x78);
        assert_eq!(bus.read_2(0x102), 0x1234);
        assert_eq!(bus.read_4(0x100), 0x1234_5678);
    }
    #[test]
    fn setbits_1_shift_touches_one_byte() {
        let mut bus = MockBus::new();
        bus.write_4(0x80, 0x000f_0000).unwrap();
        bus.clear_log();
        bus.setbits_1_shift(0x80, 0x0008_0000, 0, 2).unwrap();
        assert_eq!(bus.read_4(0x80), 0x0007_0000);
        assert_eq!(bus.writes(), &[(0x82, vec![0x07])]);
    }
    #[test]
    fn poll_until_is_bounded() {
        let mut bus = MockBus::new();
        let mut polls = 0;
        assert!(!bus.poll_until(20, 10_000, |_| {
            polls += 1;
            false
        }));
        assert_eq!(polls, 20);
        assert_eq!(bus.elapsed_us(), 200_000);
    }
    #[test]
    fn poll_until_stops_when_satisfied() {
        let mut bus = MockBus::new();
        // The bit shows up on the third read.
        bus.script(0x0080, &[0, 0, 0x40]);
        assert!(bus.poll_until(10, 50, |bus| bus.read_1(0x0080) & 0x40 != 0));
        assert_eq!(bus.elapsed_us(), 100);
    }
}
