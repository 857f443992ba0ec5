//! Register map.
//!
//! Only the registers this crate touches are listed. Addresses are shared between the chip
//! generations unless prefixed otherwise.

// System
pub(crate) const SYS_FUNC_EN: u16 = 0x0002;
pub(crate) const SYS_FUNC_EN_CPUEN: u32 = 0x0400;
pub(crate) const RSV_CTRL: u16 = 0x001c;
pub(crate) const GPIO_MUXCFG: u16 = 0x0040;
pub(crate) const GPIO_MUXCFG_ENBT: u32 = 0x0020;

// MCU firmware download
pub(crate) const MCUFWDL: u16 = 0x0080;
pub(crate) const MCUFWDL_EN: u8 = 0x01;
pub(crate) const MCUFWDL_RDY: u32 = 0x02;
pub(crate) const MCUFWDL_CHKSUM_RPT: u8 = 0x04;
pub(crate) const MCUFWDL_WINTINI_RDY: u32 = 0x40;
pub(crate) const MCUFWDL_RAM_DL_SEL: u8 = 0x80;
pub(crate) const MCUFWDL_PAGE_MASK: u32 = 0x0007_0000;
pub(crate) const MCUFWDL_PAGE_SHIFT: u32 = 16;
pub(crate) const MCUFWDL_ROM_DLEN: u32 = 0x0008_0000;
pub(crate) const FW_START_ADDR: u16 = 0x1000;

// C2H event window (RTL8192C)
pub(crate) const C2H_EVT_MSG: u16 = 0x01a0;
pub(crate) const C2H_EVT_CLEAR: u16 = 0x01af;
pub(crate) const C2H_EVT_HOST_CLOSE: u8 = 0x00;
pub(crate) const C2H_EVT_FW_CLOSE: u8 = 0xff;

// H2C mailboxes
pub(crate) const HMETFR: u16 = 0x01cc;
pub(crate) const fn hmebox(i: u8) -> u16 {
    0x01d0 + i as u16 * 4
}
pub(crate) const fn hmebox_ext(i: u8) -> u16 {
    0x01f0 + i as u16 * 2
}
pub(crate) const H2C_NBOX: u8 = 4;

// Beacon and TSF
pub(crate) const TXPAUSE: u16 = 0x0522;
pub(crate) const TX_QUEUE_AC_MGT_HIGH: u8 = 0x3f;
pub(crate) const BCN_CTRL: u16 = 0x0550;
pub(crate) const BCN_CTRL_EN_BCN: u8 = 0x08;
pub(crate) const USTIME_TSF: u16 = 0x055c;
pub(crate) const USTIME_TSF_UPDATE: u8 = 0x08;
pub(crate) const DWBCN1_CTRL: u16 = 0x0228;
pub(crate) const DWBCN1_CTRL_SEL_BCN1: u32 = 0x0010_0000;

// Multicast filter
pub(crate) const MAR: u16 = 0x0620;

// CAM
pub(crate) const CAMCMD: u16 = 0x0670;
pub(crate) const CAMCMD_POLLING: u32 = 0x8000_0000;
pub(crate) const CAMCMD_CLR: u32 = 0x4000_0000;
pub(crate) const CAMCMD_WRITE: u32 = 0x0001_0000;
pub(crate) const CAMWRITE: u16 = 0x0674;

// Baseband, used by the IQ calibration.
pub(crate) const fn fpga0_rfifacesw(chain: u16) -> u16 {
    0x0870 + chain * 4
}
pub(crate) const fn hssi_param1(chain: u16) -> u16 {
    0x0820 + chain * 8
}
pub(crate) const HSSI_PARAM1_PI: u32 = 0x0000_0100;
pub(crate) const fn lssi_param(chain: u16) -> u16 {
    0x0840 + chain * 0x10
}
pub(crate) const OFDM0_TRXPATHENA: u16 = 0x0c04;
pub(crate) const OFDM0_TRMUXPAR: u16 = 0x0c08;
pub(crate) const fn ofdm0_rxiqimbalance(chain: u16) -> u16 {
    0x0c14 + chain * 8
}
pub(crate) const OFDM0_ECCATHRESHOLD: u16 = 0x0c4c;
pub(crate) const OFDM0_AGCRSSITABLE: u16 = 0x0c78;
pub(crate) const fn ofdm0_txiqimbalance(chain: u16) -> u16 {
    0x0c80 + chain * 8
}
pub(crate) const fn ofdm0_txafe(chain: u16) -> u16 {
    0x0c94 + chain * 8
}
pub(crate) const OFDM0_RXIQEXTANTA: u16 = 0x0ca0;

/// ADDA registers, that are saved and overridden during IQ calibration.
pub(crate) const IQ_CAL_ADDA: [u16; 16] = [
    0x085c, 0x0e6c, 0x0e70, 0x0e74, 0x0e78, 0x0e7c, 0x0e80, 0x0e84, 0x0e88, 0x0e8c, 0x0ed0,
    0x0ed4, 0x0ed8, 0x0edc, 0x0ee0, 0x0eec,
];
