//! TX descriptors.
//!
//! Every outgoing frame is prefixed by a descriptor, which tells the MAC where to queue it, which
//! rate to use and how often to retry. The RTL8192CE uses a 64 byte layout, which additionally
//! carries the DMA buffer address and the link to the next descriptor of the ring. The USB chips
//! use a 40 byte layout, protected by a 16-bit XOR checksum over its first 32 bytes.
//!
//! The descriptors are stored as raw little-endian bytes, so they can be handed to the transport
//! as is. Fields are accessed through bitfield views of the individual words.

use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

use crate::{
    chip::Band,
    crypto::CamAlgorithm,
    rates::{RateIndex, RateMask, RateSet},
    RtwnError, RtwnResult,
};

/// Length of the RTL8192CE descriptor.
pub const PCIE_TX_DESC_LEN: usize = 64;
/// Length of the RTL8812AU and RTL8821AU descriptor.
pub const USB_TX_DESC_LEN: usize = 40;
/// The part of the PCIe descriptor, that the MAC parses as frame header.
const PCIE_TX_DESC_HEADER_LEN: u8 = 32;
/// The number of bytes covered by the USB checksum.
const USB_TX_CHECKSUM_LEN: usize = 32;

/// The MACID used for broadcast and multicast frames.
pub const MACID_BROADCAST: u8 = 1;
/// Allow the hardware to fall back through the whole rate table.
const DATA_RATE_FALLBACK_LIMIT: u8 = 0x1f;

/// The MACID, that ends up in a descriptor field of `width` bits.
///
/// Stations, that don't fit, are sent to the broadcast MACID instead of a truncated one.
fn descriptor_macid(macid: u8, width: u32) -> u8 {
    if u32::from(macid) >> width == 0 {
        macid
    } else {
        MACID_BROADCAST
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The hardware queue a frame is placed in.
    pub enum QueueSelect: u8 {
        #[default]
        BestEffort => 0x00,
        Background => 0x02,
        Video => 0x05,
        Voice => 0x07,
        Beacon => 0x10,
        High => 0x11,
        Management => 0x12
    }
}

/// Cipher codes in the descriptor.
const TX_CIPHER_NONE: u8 = 0;
const TX_CIPHER_RC4: u8 = 1;
const TX_CIPHER_AES: u8 = 3;

fn cipher_code(algorithm: Option<CamAlgorithm>) -> u8 {
    match algorithm {
        Some(CamAlgorithm::Wep40 | CamAlgorithm::Wep104 | CamAlgorithm::Tkip) => TX_CIPHER_RC4,
        Some(CamAlgorithm::Aes) => TX_CIPHER_AES,
        _ => TX_CIPHER_NONE,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Everything the descriptor needs to know about a frame.
pub struct TxRequest {
    /// Length of the frame, without the descriptor.
    pub len: u16,
    /// The MACID of the receiver.
    pub macid: u8,
    pub queue: QueueSelect,
    pub rate: RateIndex,
    /// Override the retry limit of the MAC.
    pub retry_limit: Option<u8>,
    /// Allow A-MPDU aggregation of up to the specified number of frames.
    pub max_aggregation: Option<u8>,
    /// Use the short guard interval, only valid for HT rates.
    pub short_gi: bool,
    /// Use the short preamble, only valid for CCK rates.
    pub short_preamble: bool,
    /// The frame is sent to a group address.
    pub multicast: bool,
    /// Request a TX report from the firmware.
    pub report: bool,
    /// Let the hardware encrypt the frame with this algorithm.
    pub hw_encrypt: Option<CamAlgorithm>,
    /// The rates negotiated with the receiver.
    ///
    /// An empty bitmap sends at [Self::rate] without limiting it.
    pub rates: RateMask,
}
impl TxRequest {
    /// Restrict the frame to the rates negotiated with the receiver.
    ///
    /// Group addressed frames only use the basic rates.
    pub fn with_rates(mut self, rates: &RateSet<'_>) -> Self {
        self.rates = rates.rate_mask(self.multicast);
        self
    }
    /// The rate, that actually goes into the descriptor.
    fn data_rate(&self) -> RateIndex {
        self.rates.clamp(self.rate)
    }
    fn raid(&self) -> u8 {
        self.rates.raid().into_bits()
    }
    /// Multicast frames are sent at a fixed rate.
    fn fallback_limit(&self) -> u8 {
        if self.multicast {
            0
        } else {
            DATA_RATE_FALLBACK_LIMIT
        }
    }
}

/// A chip specific TX descriptor.
pub trait TxDescriptor: Default {
    const LEN: usize;
    /// The descriptor as it's handed to the hardware.
    fn as_bytes(&self) -> &[u8];
}

fn load_word(buf: &[u8], index: usize) -> u32 {
    let offset = index * 4;
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
fn store_word(buf: &mut [u8], index: usize, value: u32) {
    let offset = index * 4;
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
/// The first word, which is the same on all chips.
struct TxDw0 {
    pkt_len: u16,
    /// Offset of the frame from the start of the descriptor.
    offset: u8,
    bmcast: bool,
    __: bool,
    last_segment: bool,
    first_segment: bool,
    #[bits(3)]
    __: u8,
    own: bool,
}
impl TxDw0 {
    fn single_segment(len: u16, offset: u8, multicast: bool) -> Self {
        Self::new()
            .with_pkt_len(len)
            .with_offset(offset)
            .with_bmcast(multicast)
            .with_first_segment(true)
            .with_last_segment(true)
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R92cTxDw1 {
    #[bits(5)]
    macid: u8,
    agg_enable: bool,
    agg_break: bool,
    __: bool,
    #[bits(5)]
    qsel: u8,
    #[bits(3)]
    __: u8,
    #[bits(4)]
    raid: u8,
    #[bits(2)]
    __: u8,
    #[bits(2)]
    cipher: u8,
    __: u8,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R92cTxDw2 {
    #[bits(19)]
    __: u32,
    /// Request a CCX report.
    ccx_report: bool,
    #[bits(12)]
    __: u16,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R92cTxDw4 {
    #[bits(7)]
    __: u8,
    hw_seq: bool,
    use_rate: bool,
    __: bool,
    disable_fallback: bool,
    #[bits(3)]
    __: u8,
    port_id: bool,
    #[bits(9)]
    __: u16,
    data_short: bool,
    #[bits(7)]
    __: u8,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R92cTxDw5 {
    #[bits(6)]
    data_rate: u8,
    short_gi: bool,
    __: bool,
    /// The lowest entry of the rate table the hardware may fall back to.
    #[bits(5)]
    data_rate_fallback_limit: u8,
    #[bits(4)]
    __: u8,
    retry_limit_enable: bool,
    #[bits(6)]
    retry_limit: u8,
    agg_num: u8,
}

/// The RTL8192CE TX descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PcieTxDesc {
    buf: [u8; PCIE_TX_DESC_LEN],
}
impl PcieTxDesc {
    const BUF_SIZE_OFFSET: usize = 28;
    const BUF_ADDR_WORD: usize = 8;
    const NEXT_ADDR_WORD: usize = 10;
    /// Everything from here on survives [Self::reset].
    const LINKAGE_OFFSET: usize = 40;

    fn word<W: From<u32>>(&self, index: usize) -> W {
        W::from(load_word(&self.buf, index))
    }
    fn set_word<W: Into<u32>>(&mut self, index: usize, value: W) {
        store_word(&mut self.buf, index, value.into());
    }
    fn update<W: From<u32> + Into<u32>>(&mut self, index: usize, f: impl FnOnce(W) -> W) {
        let value = f(self.word(index));
        self.set_word(index, value);
    }
    /// Link this descriptor to the next one in the ring.
    pub fn set_next(&mut self, next_addr: u32) {
        store_word(&mut self.buf, Self::NEXT_ADDR_WORD, next_addr);
    }
    pub fn next(&self) -> u32 {
        load_word(&self.buf, Self::NEXT_ADDR_WORD)
    }
    /// Set the DMA address of the frame, once it's mapped.
    ///
    /// The buffer size is taken from the packet length.
    pub fn set_buffer(&mut self, addr: u32) {
        let pkt_len = self.word::<TxDw0>(0).pkt_len();
        self.buf[Self::BUF_SIZE_OFFSET..Self::BUF_SIZE_OFFSET + 2]
            .copy_from_slice(&pkt_len.to_le_bytes());
        store_word(&mut self.buf, Self::BUF_ADDR_WORD, addr);
    }
    pub fn buffer(&self) -> u32 {
        load_word(&self.buf, Self::BUF_ADDR_WORD)
    }
    /// Hand the descriptor to the hardware.
    pub fn set_owned_by_hw(&mut self, owned: bool) {
        self.update(0, |dw0: TxDw0| dw0.with_own(owned));
    }
    pub fn is_owned_by_hw(&self) -> bool {
        self.word::<TxDw0>(0).own()
    }
    /// Clear all frame related fields, but keep the ring linkage.
    pub fn reset(&mut self) {
        self.buf[..Self::LINKAGE_OFFSET].fill(0);
    }
}
impl Default for PcieTxDesc {
    fn default() -> Self {
        Self {
            buf: [0; PCIE_TX_DESC_LEN],
        }
    }
}
impl TxDescriptor for PcieTxDesc {
    const LEN: usize = PCIE_TX_DESC_LEN;
    fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

pub(crate) fn r92c_fill_tx_desc(desc: &mut PcieTxDesc, request: &TxRequest) {
    let macid = descriptor_macid(request.macid, 5);
    desc.reset();
    desc.set_word(
        0,
        TxDw0::single_segment(request.len, PCIE_TX_DESC_HEADER_LEN, request.multicast),
    );
    desc.set_word(
        1,
        R92cTxDw1::new()
            .with_macid(macid)
            .with_qsel(request.queue.into_bits())
            .with_raid(request.raid() & 0x0f)
            .with_agg_enable(request.max_aggregation.is_some())
            .with_agg_break(request.max_aggregation.is_none())
            .with_cipher(cipher_code(request.hw_encrypt)),
    );
    desc.set_word(2, R92cTxDw2::new().with_ccx_report(request.report));
    desc.set_word(
        4,
        R92cTxDw4::new()
            .with_hw_seq(true)
            .with_use_rate(true)
            .with_disable_fallback(request.multicast)
            .with_data_short(request.short_preamble && request.rate.is_cck()),
    );
    desc.set_word(
        5,
        R92cTxDw5::new()
            .with_data_rate(request.data_rate().into_bits() & 0x3f)
            .with_short_gi(request.short_gi && request.rate.is_ht())
            .with_data_rate_fallback_limit(request.fallback_limit())
            .with_retry_limit_enable(request.retry_limit.is_some())
            .with_retry_limit(request.retry_limit.unwrap_or(0) & 0x3f)
            .with_agg_num(request.max_aggregation.unwrap_or(0)),
    );
}

/// Fill the descriptor for the beacon of interface `id`.
pub(crate) fn r92c_fill_beacon_desc(desc: &mut PcieTxDesc, id: u8, band: Band) {
    desc.reset();
    desc.set_word(0, TxDw0::single_segment(0, PCIE_TX_DESC_HEADER_LEN, true));
    desc.set_word(
        1,
        R92cTxDw1::new()
            .with_macid(MACID_BROADCAST)
            .with_qsel(QueueSelect::Beacon.into_bits()),
    );
    desc.set_word(
        4,
        R92cTxDw4::new()
            .with_hw_seq(true)
            .with_use_rate(true)
            .with_port_id(id != 0),
    );
    desc.set_word(
        5,
        R92cTxDw5::new().with_data_rate(beacon_rate(band).into_bits()),
    );
}

fn beacon_rate(band: Band) -> RateIndex {
    match band {
        Band::FiveGhz => RateIndex::OFDM6,
        Band::TwoPointFourGhz => RateIndex::CCK1,
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R12aTxDw1 {
    #[bits(7)]
    macid: u8,
    __: bool,
    #[bits(5)]
    qsel: u8,
    #[bits(3)]
    __: u8,
    #[bits(5)]
    raid: u8,
    __: bool,
    #[bits(2)]
    cipher: u8,
    __: u8,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R12aTxDw2 {
    #[bits(12)]
    __: u16,
    agg_enable: bool,
    #[bits(3)]
    __: u8,
    agg_break: bool,
    #[bits(2)]
    __: u8,
    /// Request a TX report.
    report: bool,
    #[bits(12)]
    __: u16,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R12aTxDw3 {
    #[bits(6)]
    __: u8,
    /// Selects the sequence number source, one per beacon slot.
    #[bits(2)]
    seq_sel: u8,
    use_rate: bool,
    __: bool,
    disable_fallback: bool,
    #[bits(4)]
    __: u8,
    hw_seq: bool,
    __: bool,
    #[bits(5)]
    max_agg: u8,
    #[bits(10)]
    __: u16,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R12aTxDw4 {
    #[bits(7)]
    data_rate: u8,
    __: bool,
    /// The lowest entry of the rate table the hardware may fall back to.
    #[bits(5)]
    data_rate_fallback_limit: u8,
    #[bits(4)]
    __: u8,
    retry_limit_enable: bool,
    #[bits(6)]
    retry_limit: u8,
    __: u8,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R12aTxDw5 {
    #[bits(4)]
    __: u8,
    /// Short preamble for CCK, short guard interval for HT.
    data_short: bool,
    #[bits(27)]
    __: u32,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R12aTxDw6 {
    #[bits(12)]
    __: u16,
    #[bits(4)]
    mbssid: u8,
    __: u16,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct R12aTxDw7 {
    checksum: u16,
    __: u8,
    agg_num: u8,
}

/// The RTL8812AU and RTL8821AU TX descriptor.
///
/// Every modification recomputes the checksum, so the descriptor is always ready for the
/// transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UsbTxDesc {
    buf: [u8; USB_TX_DESC_LEN],
}
impl UsbTxDesc {
    const CHECKSUM_WORD: usize = 7;

    fn word<W: From<u32>>(&self, index: usize) -> W {
        W::from(load_word(&self.buf, index))
    }
    fn set_word<W: Into<u32>>(&mut self, index: usize, value: W) {
        store_word(&mut self.buf, index, value.into());
        self.update_checksum();
    }
    fn update<W: From<u32> + Into<u32>>(&mut self, index: usize, f: impl FnOnce(W) -> W) {
        let value = f(self.word(index));
        self.set_word(index, value);
    }
    /// XOR of the first 16 little-endian half words, with the checksum field being zero.
    fn compute_checksum(&self) -> u16 {
        let checksum_offset = Self::CHECKSUM_WORD * 4;
        self.buf[..USB_TX_CHECKSUM_LEN]
            .chunks_exact(2)
            .enumerate()
            .filter(|(i, _)| i * 2 != checksum_offset)
            .fold(0, |sum, (_, half)| sum ^ u16::from_le_bytes([half[0], half[1]]))
    }
    fn update_checksum(&mut self) {
        let checksum = self.compute_checksum();
        let dw7 =
            R12aTxDw7::from(load_word(&self.buf, Self::CHECKSUM_WORD)).with_checksum(checksum);
        store_word(&mut self.buf, Self::CHECKSUM_WORD, dw7.into());
    }
    pub fn checksum(&self) -> u16 {
        self.word::<R12aTxDw7>(Self::CHECKSUM_WORD).checksum()
    }
    /// Check that the stored checksum matches the contents.
    pub fn checksum_valid(&self) -> bool {
        self.checksum() == self.compute_checksum()
    }
    /// Set the length of the frame following the descriptor.
    pub fn set_pkt_len(&mut self, len: u16) {
        self.update(0, |dw0: TxDw0| dw0.with_pkt_len(len));
    }
    /// Set the number of frames aggregated into this USB transfer.
    pub fn set_agg_num(&mut self, agg_num: u8) {
        self.update(Self::CHECKSUM_WORD, |dw7: R12aTxDw7| dw7.with_agg_num(agg_num));
    }
}
impl Default for UsbTxDesc {
    fn default() -> Self {
        Self {
            buf: [0; USB_TX_DESC_LEN],
        }
    }
}
impl TxDescriptor for UsbTxDesc {
    const LEN: usize = USB_TX_DESC_LEN;
    fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

pub(crate) fn r12a_fill_tx_desc(desc: &mut UsbTxDesc, request: &TxRequest) {
    let macid = descriptor_macid(request.macid, 7);
    *desc = UsbTxDesc::default();
    desc.set_word(
        0,
        TxDw0::single_segment(request.len, USB_TX_DESC_LEN as u8, request.multicast),
    );
    desc.set_word(
        1,
        R12aTxDw1::new()
            .with_macid(macid)
            .with_qsel(request.queue.into_bits())
            .with_raid(request.raid() & 0x1f)
            .with_cipher(cipher_code(request.hw_encrypt)),
    );
    desc.set_word(
        2,
        R12aTxDw2::new()
            .with_agg_enable(request.max_aggregation.is_some())
            .with_agg_break(request.max_aggregation.is_none())
            .with_report(request.report),
    );
    desc.set_word(
        3,
        R12aTxDw3::new()
            .with_hw_seq(true)
            .with_use_rate(true)
            .with_disable_fallback(request.multicast)
            .with_max_agg(request.max_aggregation.unwrap_or(0).min(0x1f)),
    );
    desc.set_word(
        4,
        R12aTxDw4::new()
            .with_data_rate(request.data_rate().into_bits() & 0x7f)
            .with_data_rate_fallback_limit(request.fallback_limit())
            .with_retry_limit_enable(request.retry_limit.is_some())
            .with_retry_limit(request.retry_limit.unwrap_or(0) & 0x3f),
    );
    let data_short = (request.short_gi && request.rate.is_ht())
        || (request.short_preamble && request.rate.is_cck());
    desc.set_word(5, R12aTxDw5::new().with_data_short(data_short));
}

/// Fill the descriptor for the beacon of interface `id`, using sequence number source `seq_sel`.
pub(crate) fn r12a_fill_beacon_desc(desc: &mut UsbTxDesc, id: u8, seq_sel: u8, band: Band) {
    *desc = UsbTxDesc::default();
    desc.set_word(0, TxDw0::single_segment(0, USB_TX_DESC_LEN as u8, true));
    // The beacon queue implies hardware sequence numbers.
    desc.set_word(
        1,
        R12aTxDw1::new()
            .with_macid(MACID_BROADCAST)
            .with_qsel(QueueSelect::Beacon.into_bits()),
    );
    desc.set_word(
        3,
        R12aTxDw3::new()
            .with_use_rate(true)
            .with_seq_sel(seq_sel & 0x03),
    );
    desc.set_word(
        4,
        R12aTxDw4::new().with_data_rate(beacon_rate(band).into_bits()),
    );
    desc.set_word(6, R12aTxDw6::new().with_mbssid(id & 0x0f));
}

/// The maximum number of bulk out endpoints.
pub const MAX_BULK_OUT_ENDPOINTS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Assignment of queues to USB bulk out endpoints.
pub struct EndpointMap {
    voice: u8,
    video: u8,
    best_effort: u8,
    background: u8,
}
impl EndpointMap {
    /// Distribute the queues over the available bulk out endpoints.
    ///
    /// Voice always gets the first endpoint, the others are shared depending on how many there
    /// are. A fourth endpoint is left unused.
    pub fn new(endpoints: &[u8]) -> RtwnResult<Self> {
        let (voice, video, data) = match *endpoints {
            [ep] => (ep, ep, ep),
            [ep0, ep1] => (ep0, ep0, ep1),
            [ep0, ep1, ep2] | [ep0, ep1, ep2, _] => (ep0, ep1, ep2),
            _ => {
                warn!("Invalid number of bulk out endpoints: {}", endpoints.len());
                return Err(RtwnError::InvalidEndpointCount);
            }
        };
        Ok(Self {
            voice,
            video,
            best_effort: data,
            background: data,
        })
    }
    /// The endpoint for frames of `queue`.
    pub fn endpoint(&self, queue: QueueSelect) -> u8 {
        match queue {
            QueueSelect::BestEffort => self.best_effort,
            QueueSelect::Background => self.background,
            QueueSelect::Video => self.video,
            _ => self.voice,
        }
    }
}
