//! Per-chip behavior.
//!
//! The three chip generations share the shape of every protocol this crate implements, but differ
//! in register layouts, descriptor formats and a few quirks. Everything that differs is expressed
//! through the [Chip] trait, which is implemented by one unit-like type per variant. The driver is
//! generic over it, so choosing a chip happens once, by constructing [Rtwn](crate::Rtwn) with
//! the right variant.

use crate::{
    calib::CalibrationPath,
    firmware::{
        r12a_fw_reset, r92c_fw_reset, FirmwareVersion, FwResetReason, H2cCommand, H2cMessage,
    },
    ll::{IoResult, RegisterAccess, RegisterExt},
    regs::{DWBCN1_CTRL, DWBCN1_CTRL_SEL_BCN1},
    rx::{self, ChecksumStatus, RxClass, RxDescriptor, TxReport},
    tx::{self, PcieTxDesc, TxDescriptor, TxRequest, UsbTxDesc},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The frequency band.
pub enum Band {
    TwoPointFourGhz,
    FiveGhz,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The channel width.
pub enum ChannelWidth {
    Twenty,
    Forty,
    Eighty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The channel the radio is tuned to.
pub struct Channel {
    /// The IEEE channel number.
    pub number: u8,
    pub band: Band,
    pub width: ChannelWidth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The bus the chip is attached through.
pub enum BusKind {
    Pcie,
    Usb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Static configuration of a chip variant.
pub struct ChipConfig {
    /// Human readable name.
    pub name: &'static str,
    /// The name under which the firmware image is looked up.
    pub fw_name: &'static str,
    /// The expected firmware signature, without its lowest nibble.
    pub fw_signature: u16,
    /// Maximum size of a firmware image, including the header.
    pub fw_size_limit: usize,
    /// Size of one firmware download page.
    pub fw_page_size: usize,
    /// The largest write the transport can do in one go.
    pub fw_max_block: usize,
    /// Number of CAM slots.
    pub cam_entry_limit: usize,
    /// Number of MACIDs, i.e. station table entries.
    pub macid_limit: usize,
    /// Number of TX chains.
    pub ntxchains: usize,
    pub bus: BusKind,
}

/// The operations, that differ between chip variants.
pub trait Chip {
    /// The TX descriptor layout.
    type TxDesc: TxDescriptor;

    fn config(&self) -> &ChipConfig;
    /// Reset the embedded MCU.
    fn fw_reset<B: RegisterAccess>(&self, bus: &mut B, reason: FwResetReason) -> IoResult<()>;
    /// Decide how IQ calibration is done, given the version of the loaded firmware.
    ///
    /// This is evaluated once after the firmware is loaded.
    fn calibration_path(&self, fw_version: Option<FirmwareVersion>) -> CalibrationPath;
    /// Classify a buffer received from the DMA engine.
    fn classify_rx(&self, buf: &[u8]) -> RxClass;
    /// Parse a TX report.
    ///
    /// For chips reporting in-band, this is the whole RX buffer, otherwise it's the payload
    /// of the C2H event.
    fn parse_tx_report(&self, buf: &[u8]) -> Option<TxReport>;
    /// Decode the RSSI of a CCK frame from its PHY status.
    fn cck_rssi(&self, phy: &[u8]) -> i8;
    /// Decode the RSSI of an OFDM or HT frame from its PHY status.
    fn ofdm_rssi(&self, phy: &[u8]) -> i8;
    /// Get the TCP/UDP checksum offload status of a received frame.
    fn checksum_status(&self, _desc: &RxDescriptor) -> ChecksumStatus {
        ChecksumStatus::Unchecked
    }
    /// Whether events have to be polled from the C2H register window.
    fn polls_c2h(&self) -> bool {
        false
    }
    /// The command announcing a station to the firmware.
    fn media_status(&self, macid: u8, associated: bool) -> H2cMessage;
    /// Fill a TX descriptor for a regular frame.
    fn fill_tx_desc(&self, desc: &mut Self::TxDesc, request: &TxRequest);
    /// Fill a TX descriptor for the beacon of interface `id`.
    fn fill_beacon_desc(&self, desc: &mut Self::TxDesc, id: u8, band: Band);
    /// Point the beacon queue at the beacon of interface `id`.
    fn beacon_select<B: RegisterAccess>(&self, _bus: &mut B, _id: u8) -> IoResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// RTL8192CE, a PCIe 802.11n chip.
///
/// This one doesn't report TX status in-band, so events are polled from a register window.
pub struct Rtl8192ce {
    config: ChipConfig,
    /// Whether the CCK high power mode is enabled, as read from the baseband.
    pub cck_high_power: bool,
}
impl Rtl8192ce {
    /// Create the chip with either one (RTL8188CE) or two TX chains.
    pub const fn new(ntxchains: usize) -> Self {
        Self {
            config: ChipConfig {
                name: "RTL8192CE",
                fw_name: "rtwn-rtl8192cfwE_B",
                fw_signature: 0x88c,
                fw_size_limit: 0x4000,
                fw_page_size: 4096,
                // MMIO writes are at most 32 bits wide.
                fw_max_block: 4,
                cam_entry_limit: 32,
                macid_limit: 32,
                ntxchains,
                bus: BusKind::Pcie,
            },
            cck_high_power: false,
        }
    }
}
impl Default for Rtl8192ce {
    fn default() -> Self {
        Self::new(2)
    }
}
impl Chip for Rtl8192ce {
    type TxDesc = PcieTxDesc;

    fn config(&self) -> &ChipConfig {
        &self.config
    }
    fn fw_reset<B: RegisterAccess>(&self, bus: &mut B, reason: FwResetReason) -> IoResult<()> {
        r92c_fw_reset(bus, reason)
    }
    fn calibration_path(&self, _fw_version: Option<FirmwareVersion>) -> CalibrationPath {
        CalibrationPath::Software
    }
    fn classify_rx(&self, _buf: &[u8]) -> RxClass {
        // Events arrive through the C2H window instead.
        RxClass::Data
    }
    fn parse_tx_report(&self, buf: &[u8]) -> Option<TxReport> {
        rx::r92c_parse_tx_report(buf)
    }
    fn cck_rssi(&self, phy: &[u8]) -> i8 {
        rx::r92c_cck_rssi(phy, self.cck_high_power)
    }
    fn ofdm_rssi(&self, phy: &[u8]) -> i8 {
        // The average power lives in the second PHY status word.
        rx::ofdm_rssi(phy.get(4).copied().unwrap_or(0))
    }
    fn polls_c2h(&self) -> bool {
        true
    }
    fn media_status(&self, _macid: u8, associated: bool) -> H2cMessage {
        H2cMessage::new(H2cCommand::MediaStatus, [associated as u8])
    }
    fn fill_tx_desc(&self, desc: &mut PcieTxDesc, request: &TxRequest) {
        tx::r92c_fill_tx_desc(desc, request);
    }
    fn fill_beacon_desc(&self, desc: &mut PcieTxDesc, id: u8, band: Band) {
        tx::r92c_fill_beacon_desc(desc, id, band);
    }
}

const R12A_FW_SIZE_LIMIT: usize = 0x8000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// RTL8812AU, a USB 802.11ac chip with two chains.
pub struct Rtl8812au;
impl Rtl8812au {
    const CONFIG: ChipConfig = ChipConfig {
        name: "RTL8812AU",
        fw_name: "rtwn-rtl8812aufw",
        fw_signature: 0x950,
        fw_size_limit: R12A_FW_SIZE_LIMIT,
        fw_page_size: 4096,
        fw_max_block: 196,
        cam_entry_limit: 64,
        macid_limit: 128,
        ntxchains: 2,
        bus: BusKind::Usb,
    };
}
impl Chip for Rtl8812au {
    type TxDesc = UsbTxDesc;

    fn config(&self) -> &ChipConfig {
        &Self::CONFIG
    }
    fn fw_reset<B: RegisterAccess>(&self, bus: &mut B, reason: FwResetReason) -> IoResult<()> {
        r12a_fw_reset(bus, reason)
    }
    fn calibration_path(&self, fw_version: Option<FirmwareVersion>) -> CalibrationPath {
        match fw_version {
            Some(FirmwareVersion { version: 0x19, .. }) => CalibrationPath::Firmware,
            _ => CalibrationPath::Unavailable,
        }
    }
    fn classify_rx(&self, buf: &[u8]) -> RxClass {
        rx::r12a_classify(buf)
    }
    fn parse_tx_report(&self, buf: &[u8]) -> Option<TxReport> {
        rx::r12a_parse_tx_report(buf)
    }
    fn cck_rssi(&self, phy: &[u8]) -> i8 {
        rx::r88e_cck_rssi(phy)
    }
    fn ofdm_rssi(&self, phy: &[u8]) -> i8 {
        rx::ofdm_rssi(phy.get(1).copied().unwrap_or(0))
    }
    fn checksum_status(&self, desc: &RxDescriptor) -> ChecksumStatus {
        rx::r12a_checksum_status(desc)
    }
    fn media_status(&self, macid: u8, associated: bool) -> H2cMessage {
        H2cMessage::new(H2cCommand::MediaStatus, [associated as u8, macid, 0])
    }
    fn fill_tx_desc(&self, desc: &mut UsbTxDesc, request: &TxRequest) {
        tx::r12a_fill_tx_desc(desc, request);
    }
    fn fill_beacon_desc(&self, desc: &mut UsbTxDesc, id: u8, band: Band) {
        tx::r12a_fill_beacon_desc(desc, id, id, band);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// RTL8821AU, a single chain USB 802.11ac chip.
///
/// Apart from a few quirks, this behaves like the [Rtl8812au].
pub struct Rtl8821au;
impl Rtl8821au {
    const CONFIG: ChipConfig = ChipConfig {
        name: "RTL8821AU",
        fw_name: "rtwn-rtl8821aufw",
        fw_signature: 0x210,
        ntxchains: 1,
        ..Rtl8812au::CONFIG
    };
}
impl Chip for Rtl8821au {
    type TxDesc = UsbTxDesc;

    fn config(&self) -> &ChipConfig {
        &Self::CONFIG
    }
    fn fw_reset<B: RegisterAccess>(&self, bus: &mut B, reason: FwResetReason) -> IoResult<()> {
        r12a_fw_reset(bus, reason)
    }
    fn calibration_path(&self, fw_version: Option<FirmwareVersion>) -> CalibrationPath {
        match fw_version {
            Some(FirmwareVersion { version: 0x16, .. }) => CalibrationPath::Firmware,
            _ => CalibrationPath::Unavailable,
        }
    }
    fn classify_rx(&self, buf: &[u8]) -> RxClass {
        rx::r12a_classify(buf)
    }
    fn parse_tx_report(&self, buf: &[u8]) -> Option<TxReport> {
        rx::r12a_parse_tx_report(buf)
    }
    fn cck_rssi(&self, phy: &[u8]) -> i8 {
        rx::r21a_cck_rssi(phy)
    }
    fn ofdm_rssi(&self, phy: &[u8]) -> i8 {
        rx::ofdm_rssi(phy.get(1).copied().unwrap_or(0))
    }
    fn checksum_status(&self, desc: &RxDescriptor) -> ChecksumStatus {
        rx::r12a_checksum_status(desc)
    }
    fn media_status(&self, macid: u8, associated: bool) -> H2cMessage {
        H2cMessage::new(H2cCommand::MediaStatus, [associated as u8, macid, 0])
    }
    fn fill_tx_desc(&self, desc: &mut UsbTxDesc, request: &TxRequest) {
        tx::r12a_fill_tx_desc(desc, request);
    }
    fn fill_beacon_desc(&self, desc: &mut UsbTxDesc, id: u8, band: Band) {
        // The sequence number source is doubled on this chip.
        tx::r12a_fill_beacon_desc(desc, id, id * 2, band);
    }
    fn beacon_select<B: RegisterAccess>(&self, bus: &mut B, id: u8) -> IoResult<()> {
        // The select bit lives in the third byte, the rest of the register belongs to the MAC.
        if id == 0 {
            bus.setbits_1_shift(DWBCN1_CTRL, DWBCN1_CTRL_SEL_BCN1, 0, 2)
        } else {
            bus.setbits_1_shift(DWBCN1_CTRL, 0, DWBCN1_CTRL_SEL_BCN1, 2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;

    fn version(version: u16) -> Option<FirmwareVersion> {
        Some(FirmwareVersion {
            version,
            ..Default::default()
        })
    }

    #[test]
    fn calibration_path_depends_on_firmware_version() {
        assert_eq!(
            Rtl8812au.calibration_path(version(0x19)),
            CalibrationPath::Firmware
        );
        assert_eq!(
            Rtl8812au.calibration_path(version(0x16)),
            CalibrationPath::Unavailable
        );
        assert_eq!(
            Rtl8821au.calibration_path(version(0x16)),
            CalibrationPath::Firmware
        );
        assert_eq!(
            Rtl8821au.calibration_path(None),
            CalibrationPath::Unavailable
        );
        assert_eq!(
            Rtl8192ce::default().calibration_path(version(0x19)),
            CalibrationPath::Software
        );
    }
    #[test]
    fn rtl8821a_inherits_limits() {
        let config = Rtl8821au.config();
        assert_eq!(config.cam_entry_limit, 64);
        assert_eq!(config.macid_limit, 128);
        assert_eq!(config.ntxchains, 1);
        assert_eq!(config.fw_signature, 0x210);
    }
    #[test]
    fn beacon_slot_selection() {
        let mut bus = MockBus::new();
        Rtl8821au.beacon_select(&mut bus, 1).unwrap();
        assert_eq!(bus.read_4(DWBCN1_CTRL), DWBCN1_CTRL_SEL_BCN1);
        assert_eq!(bus.writes(), &[(DWBCN1_CTRL + 2, vec![0x10])]);
        Rtl8821au.beacon_select(&mut bus, 0).unwrap();
        assert_eq!(bus.read_4(DWBCN1_CTRL), 0);

        bus.clear_log();
        Rtl8812au.beacon_select(&mut bus, 1).unwrap();
        assert!(bus.writes().is_empty());
    }
    #[test]
    fn media_status_payloads() {
        let msg = Rtl8812au.media_status(5, true);
        assert_eq!(msg.payload(), &[1, 5, 0]);
        let msg = Rtl8192ce::default().media_status(5, false);
        assert_eq!(msg.payload(), &[0]);
    }
}
