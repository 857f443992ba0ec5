//! RX descriptor decoding.
//!
//! Every buffer handed up by the DMA engine starts with a 24 byte descriptor, which is followed by
//! `info_size` bytes of PHY status, `shift` bytes of padding and finally the frame itself:
//! `[descriptor][PHY status][shift][frame]`.
//! On USB chips, a descriptor with the report bit set carries a firmware event instead of a
//! frame: `[descriptor][event id][sequence][payload]`.

use bitfield_struct::bitfield;

use crate::rates::{PhyMode, RateIndex};

/// Length of the RX descriptor.
pub const RX_DESC_LEN: usize = 24;
/// Length of the shortest frame we accept, which is an ACK without its FCS.
const MIN_FRAME_LEN: usize = 10;
/// Length of a TX report record.
const TX_REPORT_LEN: usize = 8;

/// C2H event IDs on the RTL8812A and RTL8821A.
pub(crate) const R12A_C2H_TX_REPORT: u8 = 0x03;
pub(crate) const R12A_C2H_IQK_FINISHED: u8 = 0x11;

const R12A_TXRPTB0_RETRY_OVER: u8 = 0x80;
const R92C_RPTB7_PKT_OK: u8 = 0x01;
const RETRY_COUNT_MASK: u8 = 0x3f;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub(crate) struct RxDw0 {
    #[bits(14)]
    pub pkt_len: u16,
    pub crc_error: bool,
    pub icv_error: bool,
    /// In units of eight bytes.
    #[bits(4)]
    pub info_size: u8,
    #[bits(3)]
    pub cipher: u8,
    pub qos: bool,
    #[bits(2)]
    pub shift: u8,
    pub phy_status: bool,
    pub sw_decrypt: bool,
    #[bits(4)]
    pub __: u8,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub(crate) struct RxDw1 {
    #[bits(13)]
    pub __: u16,
    pub amsdu: bool,
    #[bits(6)]
    pub __: u8,
    pub checksum_error: bool,
    pub ipv6: bool,
    pub udp: bool,
    pub checksum_checked: bool,
    #[bits(8)]
    pub __: u8,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub(crate) struct RxDw2 {
    #[bits(28)]
    pub __: u32,
    /// The buffer carries a firmware report.
    pub report: bool,
    #[bits(3)]
    pub __: u8,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub(crate) struct RxDw3 {
    #[bits(6)]
    pub rate: u8,
    pub ht: bool,
    #[bits(25)]
    pub __: u32,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub(crate) struct RxDw4 {
    /// Short preamble for CCK, short GI for OFDM and HT.
    pub short_plcp: bool,
    #[bits(31)]
    pub __: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// A decoded RX descriptor.
pub struct RxDescriptor {
    dw0: RxDw0,
    dw1: RxDw1,
    dw2: RxDw2,
    dw3: RxDw3,
    dw4: RxDw4,
    tsf_low: u32,
}
impl RxDescriptor {
    /// Decode the descriptor at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let desc = buf.get(..RX_DESC_LEN)?;
        let word = |i: usize| {
            u32::from_le_bytes([desc[i * 4], desc[i * 4 + 1], desc[i * 4 + 2], desc[i * 4 + 3]])
        };
        Some(Self {
            dw0: RxDw0::from_bits(word(0)),
            dw1: RxDw1::from_bits(word(1)),
            dw2: RxDw2::from_bits(word(2)),
            dw3: RxDw3::from_bits(word(3)),
            dw4: RxDw4::from_bits(word(4)),
            tsf_low: word(5),
        })
    }
    /// Length of the frame, including the FCS.
    pub fn pkt_len(&self) -> usize {
        self.dw0.pkt_len() as usize
    }
    /// Length of the PHY status in bytes.
    pub fn info_size(&self) -> usize {
        self.dw0.info_size() as usize * 8
    }
    pub fn shift(&self) -> usize {
        self.dw0.shift() as usize
    }
    /// Whether a PHY status block precedes the frame.
    pub fn has_phy_status(&self) -> bool {
        self.dw0.phy_status() && self.info_size() != 0
    }
    pub fn crc_error(&self) -> bool {
        self.dw0.crc_error()
    }
    pub fn icv_error(&self) -> bool {
        self.dw0.icv_error()
    }
    /// Whether the hardware decrypted the frame.
    pub fn decrypted(&self) -> bool {
        self.dw0.cipher() != 0 && !self.dw0.sw_decrypt()
    }
    pub fn is_report(&self) -> bool {
        self.dw2.report()
    }
    pub fn is_amsdu(&self) -> bool {
        self.dw1.amsdu()
    }
    pub fn rate(&self) -> RateIndex {
        RateIndex::from_bits(self.dw3.rate())
    }
    pub fn short_plcp(&self) -> bool {
        self.dw4.short_plcp()
    }
    /// Lower 32 bits of the TSF at reception.
    pub fn tsf_low(&self) -> u32 {
        self.tsf_low
    }
    /// Total length of descriptor, PHY status, padding and frame.
    pub fn total_len(&self) -> usize {
        RX_DESC_LEN + self.info_size() + self.shift() + self.pkt_len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// What a received buffer contains.
pub enum RxClass {
    /// A regular 802.11 frame.
    Data,
    /// A TX completion report.
    TxReport,
    /// Some other firmware event.
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The outcome of a transmission, as reported by the firmware.
pub struct TxReport {
    pub macid: u8,
    pub success: bool,
    pub retries: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The result of the TCP/UDP checksum offload.
pub enum ChecksumStatus {
    /// The hardware didn't check the frame.
    Unchecked,
    Valid {
        ipv6: bool,
        udp: bool,
    },
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Why a received buffer was dropped.
pub enum RxDropReason {
    /// The buffer is shorter than its descriptor claims.
    Truncated,
    /// The frame is too short to be an 802.11 frame.
    TooShort,
    /// The FCS or ICV didn't match.
    BadCrc,
    /// The checksum offload engine flagged the payload.
    BadChecksum,
    /// A firmware event was malformed or referenced an unknown station.
    MalformedReport,
}

/// The parts of a data buffer.
pub(crate) struct DataBuffer<'a> {
    pub desc: RxDescriptor,
    pub phy: Option<&'a [u8]>,
    pub frame: &'a [u8],
}

/// Split a data buffer into descriptor, PHY status and frame.
pub(crate) fn split_data(buf: &[u8]) -> Result<DataBuffer<'_>, RxDropReason> {
    let desc = RxDescriptor::parse(buf).ok_or(RxDropReason::Truncated)?;
    if desc.crc_error() || desc.icv_error() {
        trace!("Dropping frame with CRC or ICV error.");
        return Err(RxDropReason::BadCrc);
    }
    if desc.pkt_len() < MIN_FRAME_LEN {
        return Err(RxDropReason::TooShort);
    }
    let phy_start = RX_DESC_LEN;
    let frame_start = phy_start + desc.info_size() + desc.shift();
    let frame = buf
        .get(frame_start..frame_start + desc.pkt_len())
        .ok_or(RxDropReason::Truncated)?;
    let phy = desc
        .has_phy_status()
        .then(|| &buf[phy_start..phy_start + desc.info_size()]);
    Ok(DataBuffer { desc, phy, frame })
}

/// Classification for chips reporting events in-band.
pub(crate) fn r12a_classify(buf: &[u8]) -> RxClass {
    let Some(desc) = RxDescriptor::parse(buf) else {
        return RxClass::Data;
    };
    if !desc.is_report() {
        return RxClass::Data;
    }
    // Event ID and sequence number have to fit, otherwise we don't know what this is.
    match buf.get(RX_DESC_LEN..RX_DESC_LEN + 2) {
        Some([id, _]) if *id == R12A_C2H_TX_REPORT => RxClass::TxReport,
        Some(_) => RxClass::Other,
        None => RxClass::Data,
    }
}

/// Parse an in-band TX report, which starts after the descriptor, event ID and sequence number.
pub(crate) fn r12a_parse_tx_report(buf: &[u8]) -> Option<TxReport> {
    let report = buf.get(RX_DESC_LEN + 2..)?;
    if report.len() != TX_REPORT_LEN {
        warn!(
            "Wrong TX report size {}, must be {}.",
            report.len(),
            TX_REPORT_LEN
        );
        return None;
    }
    Some(TxReport {
        macid: report[1],
        success: report[0] & R12A_TXRPTB0_RETRY_OVER == 0,
        retries: report[2] & RETRY_COUNT_MASK,
    })
}

/// Parse the payload of a polled TX report event.
pub(crate) fn r92c_parse_tx_report(report: &[u8]) -> Option<TxReport> {
    if report.len() != TX_REPORT_LEN {
        warn!(
            "Wrong TX report size {}, must be {}.",
            report.len(),
            TX_REPORT_LEN
        );
        return None;
    }
    Some(TxReport {
        macid: report[5] & 0x1f,
        success: report[7] & R92C_RPTB7_PKT_OK != 0,
        retries: report[0] & RETRY_COUNT_MASK,
    })
}

pub(crate) fn r12a_checksum_status(desc: &RxDescriptor) -> ChecksumStatus {
    let dw1 = desc.dw1;
    if !dw1.checksum_checked() {
        ChecksumStatus::Unchecked
    } else if dw1.checksum_error() {
        ChecksumStatus::Invalid
    } else {
        ChecksumStatus::Valid {
            ipv6: dw1.ipv6(),
            udp: dw1.udp(),
        }
    }
}

/// Offset of the AGC report in the CCK PHY status.
const CCK_AGC_REPORT: usize = 5;

fn cck_agc_report(phy: &[u8]) -> u8 {
    phy.get(CCK_AGC_REPORT).copied().unwrap_or(0)
}

pub(crate) fn r92c_cck_rssi(phy: &[u8], high_power: bool) -> i8 {
    const CCK_OFFSETS: [i8; 4] = [16, -12, -26, -46];
    let agc = cck_agc_report(phy);
    let (report, rssi) = if high_power {
        ((agc >> 5) & 0x03, (agc & 0x1f) << 1)
    } else {
        ((agc >> 6) & 0x03, agc & 0x3e)
    };
    CCK_OFFSETS[report as usize] - rssi as i8
}

/// CCK RSSI decoding, used by the RTL8812A.
pub(crate) fn r88e_cck_rssi(phy: &[u8]) -> i8 {
    let agc = cck_agc_report(phy);
    let lna = (agc & 0xe0) >> 5;
    let vga = (agc & 0x1f) as i8;
    let rssi = match lna {
        7 if vga <= 27 => -100 + 2 * (27 - vga),
        7 => -100,
        6 => -48 + 2 * (2 - vga),
        5 => -42 + 2 * (7 - vga),
        4 => -36 + 2 * (7 - vga),
        3 => -24 + 2 * (7 - vga),
        2 => -12 + 2 * (5 - vga),
        1 => 8 - 2 * vga,
        _ => 14 - 2 * vga,
    };
    rssi + 6
}

pub(crate) fn r21a_cck_rssi(phy: &[u8]) -> i8 {
    let agc = cck_agc_report(phy);
    let lna = (agc & 0xe0) >> 5;
    let vga = (agc & 0x1f) as i8;
    match lna {
        5 => -38 - 2 * vga,
        4 => -30 - 2 * vga,
        2 => -14 - 2 * vga,
        1 => -6 - 2 * vga,
        0 => 8 - 2 * vga,
        _ => {
            debug!("Unknown LNA index {} in CCK PHY status.", lna);
            -100
        }
    }
}

/// Decode the average power of an OFDM or HT frame.
pub(crate) fn ofdm_rssi(pwdb_all: u8) -> i8 {
    ((pwdb_all >> 1) & 0x7f) as i8 - 110
}

/// Pick the RSSI decoding rule for the rate class.
pub(crate) fn decode_rssi(
    rate: RateIndex,
    cck: impl FnOnce() -> i8,
    ofdm: impl FnOnce() -> i8,
) -> i8 {
    if rate.phy_mode() == PhyMode::Cck {
        cck()
    } else {
        ofdm()
    }
}

/// An iterator over the descriptors in a USB bulk transfer.
///
/// Every descriptor is followed by its PHY status, padding and frame. All but the last are padded
/// to a multiple of eight bytes.
pub struct RxAggregate<'a> {
    buf: &'a [u8],
}
impl<'a> RxAggregate<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}
impl<'a> Iterator for RxAggregate<'a> {
    type Item = &'a [u8];
    fn next(&mut self) -> Option<Self::Item> {
        let desc = RxDescriptor::parse(self.buf)?;
        let total_len = desc.total_len();
        if total_len > self.buf.len() {
            warn!(
                "Aggregate truncated, {} bytes left, {} needed.",
                self.buf.len(),
                total_len
            );
            self.buf = &[];
            return None;
        }
        let (chunk, rest) = self.buf.split_at(total_len);
        let aligned = total_len.next_multiple_of(8);
        self.buf = rest.get(aligned - total_len..).unwrap_or(&[]);
        Some(chunk)
    }
}

/// Compute the position of a multicast address in the 64-bit hash filter.
pub fn multicast_hash(addr: &[u8; 6]) -> u8 {
    const MASK: u64 = 0x0000_4d10_1df4_81b4;
    let mut pos = 0x27u8;
    for (i, byte) in addr.iter().enumerate() {
        let first_bit = if i == 0 { 1 } else { 0 };
        for j in first_bit..8 {
            if (byte >> j) & 1 != 0 {
                pos ^= (MASK >> (i * 8 + j - 1)) as u8;
            }
        }
    }
    pos & 0x3f
}

/// Build the contents of the multicast filter registers from a list of addresses.
pub fn multicast_filter<'a>(addrs: impl IntoIterator<Item = &'a [u8; 6]>) -> [u32; 2] {
    let mut filter = [0u32; 2];
    for addr in addrs {
        let pos = multicast_hash(addr);
        filter[(pos / 32) as usize] |= 1 << (pos % 32);
    }
    filter
}
