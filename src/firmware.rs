//! Firmware download and host-to-chip (H2C) commands.
//!
//! The download works like this:
//! 1. The image is fetched from a [FirmwareStore] and its size validated.
//! 2. If the image starts with a header carrying the chip's signature, the header is skipped.
//! 3. Download mode is enabled and the 8051 is held in reset.
//! 4. The image is written in 4 KiB pages through a window at `0x1000`, after which the hardware
//!    reports a checksum. This is attempted up to three times.
//! 5. Download mode is disabled, the MCU is released and we wait for the firmware to signal
//!    readiness.
//!
//! The fetched image is handed back to the store on every exit path.

use core::ops::Deref;

use macro_bits::{bit, check_bit, serializable_enum};

use crate::{
    chip::{Chip, ChipConfig},
    ll::{IoError, IoResult, RegisterAccess, RegisterExt},
    regs::*,
};

/// Size of the optional firmware header.
pub const FW_HEADER_LEN: usize = 32;
/// Size of one download page.
pub const FW_PAGE_SIZE: usize = 4096;
/// Number of download attempts.
const FW_DOWNLOAD_ATTEMPTS: usize = 3;
const FW_POLL_INTERVAL_US: u32 = 10_000;
const FW_CHECKSUM_POLLS: usize = 25;
const FW_READY_POLLS: usize = 20;
const H2C_POLL_INTERVAL_US: u32 = 2_000;
const H2C_POLLS: usize = 50;
/// Maximum length of an H2C payload.
pub const H2C_MAX_PAYLOAD: usize = 5;
const H2C_FLAG_EXT: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// An error that occured while loading the firmware.
pub enum LoadError {
    /// The store didn't have an image with the requested name.
    NotFound,
    /// The image is either smaller than the header or larger than the chip allows.
    InvalidSize(usize),
    /// The firmware never signaled readiness.
    Timeout,
    /// A register write failed outside of the retried download loop.
    Io(IoError),
}
impl From<IoError> for LoadError {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// An error that occured while sending an H2C command.
pub enum FwCmdError {
    /// No firmware is running, so there is nobody to receive the command.
    NotLoaded,
    /// The mailbox didn't become free in time.
    Timeout,
    /// The payload doesn't fit into a mailbox.
    TooLong,
    Io(IoError),
}
impl From<IoError> for FwCmdError {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The reason for resetting the MCU.
pub enum FwResetReason {
    /// A previous image is still staged and has to be dropped before downloading.
    Download,
    /// The checksum of a freshly downloaded image was reported.
    Checksum,
    /// The device is going down.
    Shutdown,
}

/// A source of firmware images.
pub trait FirmwareStore {
    /// The image handle.
    type Image: AsRef<[u8]>;

    /// Look up an image by name.
    fn fetch(&mut self, name: &str) -> Option<Self::Image>;
    /// Hand an image back to the store.
    fn release(&mut self, image: Self::Image);
}

/// A fetched image, which is released back into the store once dropped.
pub struct FirmwareGuard<'a, S: FirmwareStore> {
    store: &'a mut S,
    image: Option<S::Image>,
}
impl<'a, S: FirmwareStore> FirmwareGuard<'a, S> {
    /// Fetch an image from the store.
    pub fn fetch(store: &'a mut S, name: &str) -> Option<Self> {
        let image = store.fetch(name)?;
        Some(Self {
            store,
            image: Some(image),
        })
    }
}
impl<S: FirmwareStore> Deref for FirmwareGuard<'_, S> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.image.as_ref().map_or(&[], |image| image.as_ref())
    }
}
impl<S: FirmwareStore> Drop for FirmwareGuard<'_, S> {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            self.store.release(image);
            trace!("Firmware image released.");
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Version information from the firmware header.
pub struct FirmwareVersion {
    pub version: u16,
    pub subversion: u16,
    pub month: u8,
    pub date: u8,
    pub hour: u8,
    pub minute: u8,
}

/// The header prepended to firmware images.
///
/// All fields are little-endian:
/// `signature: u16, category: u8, function: u8, version: u16, subversion: u16, month: u8,
/// date: u8, hour: u8, minute: u8, ramcodesize: u16, ...` padded to 32 bytes.
pub(crate) struct FirmwareHeader<'a>(&'a [u8; FW_HEADER_LEN]);
impl<'a> FirmwareHeader<'a> {
    pub fn new(image: &'a [u8]) -> Option<Self> {
        image.get(..FW_HEADER_LEN)?.try_into().ok().map(Self)
    }
    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.0[offset], self.0[offset + 1]])
    }
    pub fn signature(&self) -> u16 {
        self.u16_at(0)
    }
    /// Check if the upper twelve bits of the signature match the chip.
    pub fn matches(&self, fw_signature: u16) -> bool {
        self.signature() >> 4 == fw_signature
    }
    pub fn version(&self) -> FirmwareVersion {
        FirmwareVersion {
            version: self.u16_at(4),
            subversion: self.u16_at(6),
            month: self.0[8],
            date: self.0[9],
            hour: self.0[10],
            minute: self.0[11],
        }
    }
}

/// The size of the next write, when `remaining` bytes are left.
#[inline]
const fn block_len(remaining: usize, max_block: usize) -> usize {
    if remaining > max_block {
        max_block
    } else if remaining > 4 {
        4
    } else {
        1
    }
}

/// Select `page` in the download window and write `data` into it.
fn load_page<B: RegisterAccess>(
    bus: &mut B,
    page: usize,
    mut data: &[u8],
    max_block: usize,
) -> IoResult<()> {
    let reg = bus.read_4(MCUFWDL) & !MCUFWDL_PAGE_MASK;
    bus.write_4(
        MCUFWDL,
        reg | (((page as u32) << MCUFWDL_PAGE_SHIFT) & MCUFWDL_PAGE_MASK),
    )?;

    let mut offset = FW_START_ADDR;
    while !data.is_empty() {
        let len = block_len(data.len(), max_block);
        bus.write_block(offset, &data[..len])?;
        offset += len as u16;
        data = &data[len..];
    }
    Ok(())
}

/// Validate the image and strip the header if present.
pub(crate) fn prepare_image<'a>(
    image: &'a [u8],
    config: &ChipConfig,
) -> Result<(&'a [u8], Option<FirmwareVersion>), LoadError> {
    if image.len() < FW_HEADER_LEN || image.len() > config.fw_size_limit {
        warn!("Wrong firmware size: {} bytes.", image.len());
        return Err(LoadError::InvalidSize(image.len()));
    }
    match FirmwareHeader::new(image) {
        Some(header) if header.matches(config.fw_signature) => {
            let version = header.version();
            debug!(
                "FW V{}.{} {}-{} {}:{}",
                version.version,
                version.subversion,
                version.month,
                version.date,
                version.hour,
                version.minute
            );
            Ok((&image[FW_HEADER_LEN..], Some(version)))
        }
        _ => Ok((image, None)),
    }
}

/// Download `body` into the MCU and wait for it to come up.
///
/// The body must already have its header stripped.
pub(crate) fn download<B: RegisterAccess, C: Chip>(
    bus: &mut B,
    chip: &C,
    body: &[u8],
) -> Result<(), LoadError> {
    let config = chip.config();

    if bus.read_1(MCUFWDL) & MCUFWDL_RAM_DL_SEL != 0 {
        bus.write_1(MCUFWDL, 0)?;
        chip.fw_reset(bus, FwResetReason::Download)?;
    }

    // Enable download mode and put the 8051 into reset.
    bus.setbits_1(MCUFWDL, 0, MCUFWDL_EN)?;
    bus.setbits_1_shift(MCUFWDL, MCUFWDL_ROM_DLEN, 0, 2)?;

    let mut checksum_ok = false;
    for attempt in 0..FW_DOWNLOAD_ATTEMPTS {
        if bus.setbits_1(MCUFWDL, 0, MCUFWDL_CHKSUM_RPT).is_err() {
            warn!("Couldn't reset the firmware checksum (try {}).", attempt);
            continue;
        }
        let loaded = body
            .chunks(config.fw_page_size)
            .enumerate()
            .try_for_each(|(page, chunk)| {
                load_page(&mut *bus, page, chunk, config.fw_max_block)
            });
        if loaded.is_err() {
            warn!("Couldn't load firmware page (try {}).", attempt);
            continue;
        }
        if bus.poll_until(FW_CHECKSUM_POLLS, FW_POLL_INTERVAL_US, |bus| {
            bus.read_4(MCUFWDL) & u32::from(MCUFWDL_CHKSUM_RPT) != 0
        }) {
            checksum_ok = true;
            break;
        }
        debug!("Timeout waiting for checksum report (try {}).", attempt);
    }
    if !checksum_ok {
        warn!("Firmware checksum was never reported, waiting for readiness anyway.");
    }

    // Disable download mode and release the MCU.
    bus.setbits_1(MCUFWDL, MCUFWDL_EN, 0)?;
    bus.setbits_4(MCUFWDL, MCUFWDL_WINTINI_RDY, MCUFWDL_RDY)?;
    chip.fw_reset(bus, FwResetReason::Checksum)?;

    if !bus.poll_until(FW_READY_POLLS, FW_POLL_INTERVAL_US, |bus| {
        bus.read_4(MCUFWDL) & MCUFWDL_WINTINI_RDY != 0
    }) {
        error!("Timeout waiting for firmware readiness.");
        return Err(LoadError::Timeout);
    }
    Ok(())
}

/// MCU reset for the RTL8192C.
///
/// A reset for [FwResetReason::Checksum] is deliberately skipped on this chip.
pub(crate) fn r92c_fw_reset<B: RegisterAccess>(bus: &mut B, reason: FwResetReason) -> IoResult<()> {
    if reason == FwResetReason::Checksum {
        return Ok(());
    }
    // Ask the 8051 to reset itself.
    bus.write_1(HMETFR + 3, 0x20)?;
    if bus.poll_until(100, 50, |bus| {
        u32::from(bus.read_2(SYS_FUNC_EN)) & SYS_FUNC_EN_CPUEN == 0
    }) {
        return Ok(());
    }
    trace!("8051 didn't reset itself, forcing it.");
    bus.setbits_1_shift(SYS_FUNC_EN, SYS_FUNC_EN_CPUEN, 0, 1)
}

/// MCU reset for the RTL8812A and RTL8821A, which always toggles the MCU IO wrapper.
pub(crate) fn r12a_fw_reset<B: RegisterAccess>(
    bus: &mut B,
    _reason: FwResetReason,
) -> IoResult<()> {
    bus.setbits_1(RSV_CTRL, 0x02, 0)?;
    bus.setbits_1(RSV_CTRL + 1, 0x08, 0)?;
    bus.setbits_1_shift(SYS_FUNC_EN, SYS_FUNC_EN_CPUEN, 0, 1)?;

    bus.setbits_1(RSV_CTRL, 0x02, 0)?;
    bus.setbits_1(RSV_CTRL + 1, 0, 0x08)?;
    bus.setbits_1_shift(SYS_FUNC_EN, 0, SYS_FUNC_EN_CPUEN, 1)
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Host-to-chip command IDs.
    pub enum H2cCommand: u8 {
        /// RTL8192C join report, RTL8812A media status report.
        MediaStatus => 0x01,
        /// RTL8812A/8821A firmware IQ calibration.
        IqCalibrate => 0x45
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// An H2C command together with its payload.
pub struct H2cMessage {
    id: H2cCommand,
    payload: [u8; H2C_MAX_PAYLOAD],
    len: usize,
}
impl H2cMessage {
    /// Create a new message.
    pub fn new<const N: usize>(id: H2cCommand, data: [u8; N]) -> Self {
        const { assert!(N <= H2C_MAX_PAYLOAD) };
        let mut payload = [0u8; H2C_MAX_PAYLOAD];
        payload[..N].copy_from_slice(&data);
        Self {
            id,
            payload,
            len: N,
        }
    }
    pub fn id(&self) -> H2cCommand {
        self.id
    }
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len]
    }
}

/// The four rotating H2C mailboxes.
#[derive(Debug, Default)]
pub(crate) struct H2cMailbox {
    current: u8,
}
impl H2cMailbox {
    /// Send a command to the firmware.
    ///
    /// Payloads longer than three bytes use the extension register, which is written first,
    /// since writing the main box triggers the firmware.
    pub fn send<B: RegisterAccess>(
        &mut self,
        bus: &mut B,
        id: u8,
        payload: &[u8],
    ) -> Result<(), FwCmdError> {
        if payload.len() > H2C_MAX_PAYLOAD {
            return Err(FwCmdError::TooLong);
        }
        let current = self.current;
        if !bus.poll_until(H2C_POLLS, H2C_POLL_INTERVAL_US, |bus| {
            !check_bit!(bus.read_1(HMETFR), bit!(current))
        }) {
            warn!("H2C box {} didn't become free.", current);
            return Err(FwCmdError::Timeout);
        }

        let mut cmd = [0u8; 1 + H2C_MAX_PAYLOAD];
        cmd[0] = id;
        if payload.len() > 3 {
            // Layout: [id | EXT, byte2, byte3, byte4, byte0, byte1]
            cmd[0] |= H2C_FLAG_EXT;
            cmd[1..payload.len() - 1].copy_from_slice(&payload[2..]);
            cmd[4..6].copy_from_slice(&payload[..2]);
            bus.write_2(hmebox_ext(current), u16::from_le_bytes([cmd[4], cmd[5]]))?;
        } else {
            cmd[1..=payload.len()].copy_from_slice(payload);
        }
        bus.write_4(
            hmebox(current),
            u32::from_le_bytes([cmd[0], cmd[1], cmd[2], cmd[3]]),
        )?;
        trace!("H2C command {} sent through box {}.", id, current);

        self.current = (current + 1) % H2C_NBOX;
        Ok(())
    }
    /// Send a prepared [H2cMessage].
    pub fn send_message<B: RegisterAccess>(
        &mut self,
        bus: &mut B,
        message: &H2cMessage,
    ) -> Result<(), FwCmdError> {
        self.send(bus, message.id().into_bits(), message.payload())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{chip::Rtl8812au, mock::MockBus};

    /// A store, that counts how often its image was released.
    pub struct TestStore {
        pub image: Option<Vec<u8>>,
        pub releases: usize,
    }
    impl FirmwareStore for TestStore {
        type Image = Vec<u8>;
        fn fetch(&mut self, _name: &str) -> Option<Self::Image> {
            self.image.clone()
        }
        fn release(&mut self, _image: Self::Image) {
            self.releases += 1;
        }
    }

    pub fn image_with_header(signature: u16, body_len: usize) -> Vec<u8> {
        let mut image = vec![0u8; FW_HEADER_LEN];
        image[..2].copy_from_slice(&signature.to_le_bytes());
        image[4..6].copy_from_slice(&0x19u16.to_le_bytes());
        image.extend((0..body_len).map(|i| i as u8));
        image
    }
    /// Reconstruct the downloaded body from the write log.
    fn downloaded_body(bus: &MockBus) -> Vec<u8> {
        let mut page = 0usize;
        let mut body = Vec::new();
        for (addr, data) in bus.writes() {
            if *addr == MCUFWDL && data.len() == 4 {
                let reg = u32::from_le_bytes(data[..4].try_into().unwrap());
                page = ((reg & MCUFWDL_PAGE_MASK) >> MCUFWDL_PAGE_SHIFT) as usize;
            } else if *addr >= FW_START_ADDR {
                let offset = page * FW_PAGE_SIZE + (*addr - FW_START_ADDR) as usize;
                // Writes must be contiguous.
                assert_eq!(offset, body.len());
                body.extend_from_slice(data);
            }
        }
        body
    }
    /// Pages selected through the download window, in order.
    fn page_selects(bus: &MockBus) -> Vec<usize> {
        bus.writes()
            .iter()
            .filter(|(addr, data)| *addr == MCUFWDL && data.len() == 4)
            .map(|(_, data)| u32::from_le_bytes(data[..4].try_into().unwrap()))
            .filter(|reg| reg & MCUFWDL_RDY == 0)
            .map(|reg| ((reg & MCUFWDL_PAGE_MASK) >> MCUFWDL_PAGE_SHIFT) as usize)
            .collect()
    }
    /// Makes the MCU report readiness once the driver sets RDY.
    pub fn ready_on_rdy(bus: &mut MockBus) {
        bus.on_write(|regs, addr, data| {
            if addr == MCUFWDL && data.len() == 4 && data[0] & MCUFWDL_RDY as u8 != 0 {
                let value = regs.get_4(MCUFWDL) | MCUFWDL_WINTINI_RDY;
                regs.set_4(MCUFWDL, value);
            }
        });
    }

    #[test]
    fn block_sizes() {
        assert_eq!(block_len(1000, 196), 196);
        assert_eq!(block_len(196, 196), 4);
        assert_eq!(block_len(5, 196), 4);
        assert_eq!(block_len(4, 196), 1);
        assert_eq!(block_len(1, 196), 1);
    }
    #[test]
    fn header_is_stripped_only_on_signature_match() {
        let config = Rtl8812au.config();
        let image = image_with_header(0x9500, 64);
        let (body, version) = prepare_image(&image, config).unwrap();
        assert_eq!(body.len(), 64);
        assert_eq!(version.unwrap().version, 0x19);

        let image = image_with_header(0x1234, 64);
        let (body, version) = prepare_image(&image, config).unwrap();
        assert_eq!(body.len(), image.len());
        assert!(version.is_none());
    }
    #[test]
    fn size_bounds() {
        let config = Rtl8812au.config();
        assert_eq!(
            prepare_image(&[0u8; 16], config),
            Err(LoadError::InvalidSize(16))
        );
        let huge = vec![0u8; config.fw_size_limit + 1];
        assert_eq!(
            prepare_image(&huge, config),
            Err(LoadError::InvalidSize(huge.len()))
        );
    }
    #[test]
    fn two_page_download() {
        let mut bus = MockBus::new();
        bus.preset_1(MCUFWDL, MCUFWDL_CHKSUM_RPT);
        ready_on_rdy(&mut bus);

        let image = image_with_header(0x9500, FW_PAGE_SIZE + 100);
        let (body, _) = prepare_image(&image, Rtl8812au.config()).unwrap();
        assert_eq!(download(&mut bus, &Rtl8812au, body), Ok(()));

        assert_eq!(page_selects(&bus), vec![0, 1]);
        assert_eq!(downloaded_body(&bus), &image[FW_HEADER_LEN..]);
        // Checksum and readiness were both seen on the first poll.
        assert_eq!(bus.elapsed_us(), 0);
    }
    #[test]
    fn readiness_timeout() {
        let mut bus = MockBus::new();
        bus.preset_1(MCUFWDL, MCUFWDL_CHKSUM_RPT);

        let body = vec![0xaa; 64];
        assert_eq!(
            download(&mut bus, &Rtl8812au, &body),
            Err(LoadError::Timeout)
        );
        assert_eq!(bus.read_1(MCUFWDL) & MCUFWDL_EN, 0);
        assert_eq!(
            bus.elapsed_us(),
            (FW_READY_POLLS as u64) * u64::from(FW_POLL_INTERVAL_US)
        );
    }
    #[test]
    fn failed_page_write_is_retried() {
        let mut bus = MockBus::new();
        bus.preset_1(MCUFWDL, MCUFWDL_CHKSUM_RPT);
        ready_on_rdy(&mut bus);
        bus.fail_writes_to(FW_START_ADDR);

        let body = vec![0xaa; 64];
        assert_eq!(download(&mut bus, &Rtl8812au, &body), Ok(()));
        // Three attempts, each failing on the first block of page zero.
        assert_eq!(page_selects(&bus), vec![0, 0, 0]);
    }
    #[test]
    fn guard_releases_image() {
        let mut store = TestStore {
            image: Some(vec![0u8; 64]),
            releases: 0,
        };
        {
            let guard = FirmwareGuard::fetch(&mut store, "rtwn-rtl8812aufw").unwrap();
            assert_eq!(guard.len(), 64);
        }
        assert_eq!(store.releases, 1);

        store.image = None;
        assert!(FirmwareGuard::fetch(&mut store, "rtwn-rtl8812aufw").is_none());
        assert_eq!(store.releases, 1);
    }
    #[test]
    fn r92c_checksum_reset_is_a_no_op() {
        let mut bus = MockBus::new();
        r92c_fw_reset(&mut bus, FwResetReason::Checksum).unwrap();
        assert!(bus.writes().is_empty());

        r92c_fw_reset(&mut bus, FwResetReason::Download).unwrap();
        assert_eq!(bus.writes_to(HMETFR + 3), vec![0x20]);
    }
    #[test]
    fn h2c_extended_layout() {
        let mut bus = MockBus::new();
        let mut mailbox = H2cMailbox::default();
        mailbox.send(&mut bus, 0x45, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(bus.writes()[0].0, hmebox_ext(0));
        assert_eq!(bus.writes_to(hmebox_ext(0)), vec![0x0201]);
        assert_eq!(bus.writes_to(hmebox(0)), vec![u32::from_le_bytes([0xc5, 3, 4, 5])]);

        mailbox.send(&mut bus, 0x01, &[1, 7, 0]).unwrap();
        assert_eq!(bus.writes_to(hmebox(1)), vec![u32::from_le_bytes([0x01, 1, 7, 0])]);
        assert_eq!(
            mailbox.send(&mut bus, 0x01, &[0; 6]),
            Err(FwCmdError::TooLong)
        );
    }
    #[test]
    fn h2c_busy_box_times_out() {
        let mut bus = MockBus::new();
        bus.preset_1(HMETFR, 0x01);
        let mut mailbox = H2cMailbox::default();
        assert_eq!(
            mailbox.send(&mut bus, 0x01, &[1]),
            Err(FwCmdError::Timeout)
        );
    }
}
