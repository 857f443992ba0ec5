//! IQ/LO calibration.
//!
//! After a channel change the I/Q imbalance of the RF front-end has to be measured and
//! corrected. Newer chips do this in firmware, when asked through an H2C command. On the others
//! the host drives the measurement itself:
//!
//! 1. The measurement is repeated up to three times.
//! 2. Every run saves the affected registers (only on the first run), switches the baseband into
//!    calibration mode, pulses the LO and IQ calibration twice per chain and reads back the
//!    results. Failed measurements are replaced by a sentinel value.
//! 3. Once two consecutive runs agree within a small tolerance, the result is considered stable
//!    and written into the baseband. If they never agree, the hardware stays uncalibrated until
//!    the next channel change.
//!
//! The measurement itself is abstracted through [IqSampler], so the convergence logic in
//! [CalibrationEngine] doesn't depend on the register sequence.

use crate::{
    chip::{Band, Channel, ChannelWidth},
    firmware::{H2cCommand, H2cMessage},
    ll::{IoResult, RegisterAccess, RegisterExt},
    regs::*,
};

/// Maximum number of runs.
pub const IQ_CAL_RUNS: u8 = 3;
/// Maximum difference between two runs, for them to be considered equal.
pub const IQ_CAL_TOLERANCE: u16 = 5;
/// The value recorded for a failed measurement.
pub const IQ_CAL_FAILED: u16 = 0xff;
/// Maximum number of chains we calibrate.
pub const IQ_CAL_MAX_CHAINS: usize = 2;

/// Time for the LO and IQ calibration to complete.
const IQ_CAL_SETTLE_US: u32 = 1000;

// Calibration block of the baseband.
const IQK_ENABLE: u16 = 0x0e28;
const IQK_TX_TONE_A: u16 = 0x0e30;
const IQK_RX_TONE_A: u16 = 0x0e34;
const IQK_TX_PI_A: u16 = 0x0e38;
const IQK_RX_PI_A: u16 = 0x0e3c;
const IQK_TX_CTL: u16 = 0x0e40;
const IQK_RX_CTL: u16 = 0x0e44;
const IQK_TRIGGER_A: u16 = 0x0e48;
const IQK_LO_CAL: u16 = 0x0e4c;
const IQK_TX_TONE_B: u16 = 0x0e50;
const IQK_RX_TONE_B: u16 = 0x0e54;
const IQK_TX_PI_B: u16 = 0x0e58;
const IQK_RX_PI_B: u16 = 0x0e5c;
const IQK_TRIGGER_B: u16 = 0x0e60;
const IQK_STATUS: u16 = 0x0eac;
const fn iqk_tx_result(chain: u16, i: u16) -> u16 {
    0x0e94 + chain * 0x20 + i * 8
}
const fn iqk_rx_result(chain: u16, i: u16) -> u16 {
    0x0ea4 + chain * 0x20 + i * 8
}
const fn rf_interface_oe(chain: u16) -> u16 {
    0x0b68 + chain * 4
}
/// Bit in [IQK_STATUS], that is set when the TX measurement of `chain` failed.
const fn iqk_tx_failed(chain: usize) -> u32 {
    1 << (28 + chain * 3)
}
const fn iqk_rx_failed(chain: usize) -> u32 {
    1 << (27 + chain * 3)
}
/// Values the hardware reports, when the measurement produced garbage.
const IQK_TX_GARBAGE: [u16; 2] = [0x142, 0x042];
const IQK_RX_GARBAGE: [u16; 2] = [0x132, 0x036];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// How IQ calibration is done on this device.
pub enum CalibrationPath {
    /// The firmware calibrates, when asked by an H2C command.
    Firmware,
    /// The host drives the baseband registers.
    ///
    /// Only the register sequence of the RTL8192C family is known.
    Software,
    /// Nobody can calibrate, so the front-end stays uncalibrated.
    Unavailable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// State of the software calibration.
pub enum CalibrationState {
    #[default]
    Idle,
    /// Run `n` is in progress.
    Running(u8),
    /// Run `n` agreed with its predecessor and was applied.
    Converged(u8),
    /// No two consecutive runs agreed.
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The raw I/Q imbalance of one chain.
pub struct ChainSample {
    /// TX X and Y.
    pub tx: [u16; 2],
    /// RX X and Y.
    pub rx: [u16; 2],
}
impl ChainSample {
    pub const FAILED: Self = Self {
        tx: [IQ_CAL_FAILED; 2],
        rx: [IQ_CAL_FAILED; 2],
    };
    pub fn tx_valid(&self) -> bool {
        !self.tx.contains(&IQ_CAL_FAILED)
    }
    pub fn rx_valid(&self) -> bool {
        !self.rx.contains(&IQ_CAL_FAILED)
    }
    /// Check if both samples are valid and within [IQ_CAL_TOLERANCE] of each other.
    pub fn agrees_with(&self, other: &Self) -> bool {
        let close = |a: &[u16; 2], b: &[u16; 2]| {
            a.iter()
                .zip(b)
                .all(|(a, b)| a.abs_diff(*b) <= IQ_CAL_TOLERANCE)
        };
        self.tx_valid()
            && self.rx_valid()
            && other.tx_valid()
            && other.rx_valid()
            && close(&self.tx, &other.tx)
            && close(&self.rx, &other.rx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The result of one calibration run.
pub struct CalibrationRun {
    pub chains: [ChainSample; IQ_CAL_MAX_CHAINS],
}
impl Default for CalibrationRun {
    fn default() -> Self {
        Self {
            chains: [ChainSample::FAILED; IQ_CAL_MAX_CHAINS],
        }
    }
}

/// Check if two runs agree on all active chains.
pub fn runs_agree(previous: &CalibrationRun, current: &CalibrationRun, nchains: usize) -> bool {
    previous
        .chains
        .iter()
        .zip(current.chains.iter())
        .take(nchains.clamp(1, IQ_CAL_MAX_CHAINS))
        .all(|(previous, current)| previous.agrees_with(current))
}

/// The source of calibration measurements.
pub trait IqSampler {
    /// Do one measurement run.
    fn sample(&mut self, run: u8) -> IoResult<CalibrationRun>;
    /// Apply a converged result.
    fn apply(&mut self, result: &CalibrationRun) -> IoResult<()>;
}

/// The convergence state machine.
pub struct CalibrationEngine {
    state: CalibrationState,
    nchains: usize,
}
impl CalibrationEngine {
    pub const fn new(nchains: usize) -> Self {
        Self {
            state: CalibrationState::Idle,
            nchains,
        }
    }
    pub const fn state(&self) -> CalibrationState {
        self.state
    }
    /// Run the calibration to completion.
    ///
    /// Not converging isn't an error, it's reported as [CalibrationState::Exhausted].
    pub fn run(&mut self, sampler: &mut impl IqSampler) -> IoResult<CalibrationState> {
        let result = self.run_inner(sampler);
        if result.is_err() {
            self.state = CalibrationState::Idle;
        }
        result
    }
    fn run_inner(&mut self, sampler: &mut impl IqSampler) -> IoResult<CalibrationState> {
        let mut previous: Option<CalibrationRun> = None;
        for n in 0..IQ_CAL_RUNS {
            self.state = CalibrationState::Running(n);
            let current = sampler.sample(n)?;
            if previous.is_some_and(|previous| runs_agree(&previous, &current, self.nchains)) {
                debug!("IQ calibration converged after run {}.", n);
                sampler.apply(&current)?;
                self.state = CalibrationState::Converged(n);
                return Ok(self.state);
            }
            previous = Some(current);
        }
        debug!("IQ calibration didn't converge.");
        self.state = CalibrationState::Exhausted;
        Ok(self.state)
    }
}

/// Registers, that are overridden during calibration.
struct SavedRegisters {
    adda: [u32; IQ_CAL_ADDA.len()],
    txpause: u8,
    bcn_ctrl: u8,
    ustime_tsf: u8,
    gpio_muxcfg: u32,
    hssi_param1: u32,
    trxpathena: u32,
    trmuxpar: u32,
    rfifacesw1: u32,
}

/// Calibration through the baseband registers of the RTL8192C.
pub struct RegisterIqSampler<'a, B: RegisterAccess> {
    bus: &'a mut B,
    ntxchains: usize,
    saved: Option<SavedRegisters>,
}
impl<'a, B: RegisterAccess> RegisterIqSampler<'a, B> {
    pub fn new(bus: &'a mut B, ntxchains: usize) -> Self {
        Self {
            bus,
            ntxchains: ntxchains.clamp(1, IQ_CAL_MAX_CHAINS),
            saved: None,
        }
    }
    fn save(&mut self) -> SavedRegisters {
        let bus = &mut *self.bus;
        SavedRegisters {
            adda: IQ_CAL_ADDA.map(|reg| bus.bb_read(reg)),
            txpause: bus.read_1(TXPAUSE),
            bcn_ctrl: bus.read_1(BCN_CTRL),
            ustime_tsf: bus.read_1(USTIME_TSF),
            gpio_muxcfg: bus.read_4(GPIO_MUXCFG),
            hssi_param1: bus.bb_read(hssi_param1(0)),
            trxpathena: bus.bb_read(OFDM0_TRXPATHENA),
            trmuxpar: bus.bb_read(OFDM0_TRMUXPAR),
            rfifacesw1: bus.bb_read(fpga0_rfifacesw(1)),
        }
    }
    fn write_adda(&mut self, value: u32) -> IoResult<()> {
        IQ_CAL_ADDA
            .iter()
            .try_for_each(|reg| self.bus.bb_write(*reg, value))
    }
    /// Trigger one measurement on `chain` and read back the result.
    fn measure_chain(&mut self, chain: usize) -> IoResult<ChainSample> {
        let bus = &mut *self.bus;
        if chain == 0 {
            bus.bb_write(IQK_TX_TONE_A, 0x1000_8c1f)?;
            bus.bb_write(IQK_RX_TONE_A, 0x1000_8c1f)?;
            bus.bb_write(IQK_TX_PI_A, 0x8214_0102)?;
            if self.ntxchains > 1 {
                bus.bb_write(IQK_RX_PI_A, 0x2816_0202)?;
                bus.bb_write(IQK_TX_TONE_B, 0x1000_8c22)?;
                bus.bb_write(IQK_RX_TONE_B, 0x1000_8c22)?;
                bus.bb_write(IQK_TX_PI_B, 0x8214_0102)?;
                bus.bb_write(IQK_RX_PI_B, 0x2816_0202)?;
            } else {
                bus.bb_write(IQK_RX_PI_A, 0x2816_0502)?;
            }
            bus.bb_write(IQK_LO_CAL, 0x0010_28d1)?;
            // LO and IQ calibration in one shot.
            bus.bb_write(IQK_TRIGGER_A, 0xf900_0000)?;
            bus.bb_write(IQK_TRIGGER_A, 0xf800_0000)?;
        } else {
            bus.bb_write(IQK_TRIGGER_B, 0x0000_0002)?;
            bus.bb_write(IQK_TRIGGER_B, 0x0000_0000)?;
        }
        bus.delay_us(IQ_CAL_SETTLE_US);

        let status = bus.bb_read(IQK_STATUS);
        let chain_reg = chain as u16;
        let mut sample = ChainSample::FAILED;
        if status & iqk_tx_failed(chain) != 0 {
            return Ok(sample);
        }
        let tx = [0, 1].map(|i| ((bus.bb_read(iqk_tx_result(chain_reg, i)) >> 16) & 0x3ff) as u16);
        if tx[0] == IQK_TX_GARBAGE[0] || tx[1] == IQK_TX_GARBAGE[1] {
            return Ok(sample);
        }
        sample.tx = tx;
        if status & iqk_rx_failed(chain) != 0 {
            return Ok(sample);
        }
        let rx = [0, 1].map(|i| ((bus.bb_read(iqk_rx_result(chain_reg, i)) >> 16) & 0x3ff) as u16);
        if rx[0] == IQK_RX_GARBAGE[0] || rx[1] == IQK_RX_GARBAGE[1] {
            return Ok(sample);
        }
        sample.rx = rx;
        Ok(sample)
    }
    fn restore(&mut self) -> IoResult<()> {
        let Some(saved) = self.saved.as_ref() else {
            return Ok(());
        };
        let bus = &mut *self.bus;
        if saved.hssi_param1 & HSSI_PARAM1_PI == 0 {
            bus.bb_write(hssi_param1(0), saved.hssi_param1)?;
            bus.bb_write(hssi_param1(1), saved.hssi_param1)?;
        }
        IQ_CAL_ADDA
            .iter()
            .zip(saved.adda)
            .try_for_each(|(reg, value)| bus.bb_write(*reg, value))?;
        bus.write_1(TXPAUSE, saved.txpause)?;
        bus.write_1(BCN_CTRL, saved.bcn_ctrl)?;
        bus.write_1(USTIME_TSF, saved.ustime_tsf)?;
        bus.write_4(GPIO_MUXCFG, saved.gpio_muxcfg)
    }
}
impl<B: RegisterAccess> IqSampler for RegisterIqSampler<'_, B> {
    fn sample(&mut self, run: u8) -> IoResult<CalibrationRun> {
        if run == 0 || self.saved.is_none() {
            self.saved = Some(self.save());
        }
        let (bcn_ctrl, ustime_tsf, gpio_muxcfg, hssi) = match self.saved.as_ref() {
            Some(saved) => (
                saved.bcn_ctrl,
                saved.ustime_tsf,
                saved.gpio_muxcfg,
                saved.hssi_param1,
            ),
            None => return Ok(CalibrationRun::default()),
        };

        if self.ntxchains == 1 {
            self.bus.bb_write(IQ_CAL_ADDA[0], 0x0b1b_25a0)?;
            for reg in &IQ_CAL_ADDA[1..] {
                self.bus.bb_write(*reg, 0x0bdb_25a0)?;
            }
        } else {
            self.write_adda(0x04db_25a4)?;
        }
        if hssi & HSSI_PARAM1_PI == 0 {
            self.bus.bb_write(hssi_param1(0), hssi | HSSI_PARAM1_PI)?;
            self.bus.bb_write(hssi_param1(1), hssi | HSSI_PARAM1_PI)?;
        }

        let bus = &mut *self.bus;
        bus.bb_write(OFDM0_TRXPATHENA, 0x03a0_5600)?;
        bus.bb_write(OFDM0_TRMUXPAR, 0x0008_00e4)?;
        bus.bb_write(fpga0_rfifacesw(1), 0x2220_4000)?;
        if self.ntxchains > 1 {
            bus.bb_write(lssi_param(0), 0x0001_0000)?;
            bus.bb_write(lssi_param(1), 0x0001_0000)?;
        }

        // Stop all queues and beaconing for the duration.
        bus.write_1(TXPAUSE, TX_QUEUE_AC_MGT_HIGH)?;
        bus.write_1(BCN_CTRL, bcn_ctrl & !BCN_CTRL_EN_BCN)?;
        bus.write_1(USTIME_TSF, ustime_tsf & !USTIME_TSF_UPDATE)?;
        bus.write_1(GPIO_MUXCFG, (gpio_muxcfg & !GPIO_MUXCFG_ENBT) as u8)?;

        bus.bb_write(rf_interface_oe(0), 0x0008_0000)?;
        if self.ntxchains > 1 {
            bus.bb_write(rf_interface_oe(1), 0x0008_0000)?;
        }
        bus.bb_write(IQK_ENABLE, 0x8080_0000)?;
        bus.bb_write(IQK_TX_CTL, 0x0100_7c00)?;
        bus.bb_write(IQK_RX_CTL, 0x0100_4800)?;
        bus.bb_write(rf_interface_oe(0), 0x0008_0000)?;

        let mut result = CalibrationRun::default();
        for chain in 0..self.ntxchains {
            if chain > 0 {
                // Put chain 0 on standby and enable chain 1.
                self.bus.bb_write(IQK_ENABLE, 0)?;
                self.bus.bb_write(lssi_param(0), 0x0001_0000)?;
                self.bus.bb_write(IQK_ENABLE, 0x8080_0000)?;
                self.write_adda(0x0b1b_25a4)?;
            }
            // The second measurement is the one, that counts.
            for _ in 0..2 {
                result.chains[chain] = self.measure_chain(chain)?;
            }
            let sample = result.chains[chain];
            debug!(
                "IQ calibration run {} chain {}: tx {} {}, rx {} {}",
                run, chain, sample.tx[0], sample.tx[1], sample.rx[0], sample.rx[1]
            );
        }

        let saved_paths = self
            .saved
            .as_ref()
            .map(|saved| (saved.trxpathena, saved.rfifacesw1, saved.trmuxpar));
        if let Some((trxpathena, rfifacesw1, trmuxpar)) = saved_paths {
            self.bus.bb_write(OFDM0_TRXPATHENA, trxpathena)?;
            self.bus.bb_write(fpga0_rfifacesw(1), rfifacesw1)?;
            self.bus.bb_write(OFDM0_TRMUXPAR, trmuxpar)?;
        }
        self.bus.bb_write(IQK_ENABLE, 0)?;
        self.bus.bb_write(lssi_param(0), 0x0003_2ed3)?;
        if self.ntxchains > 1 {
            self.bus.bb_write(lssi_param(1), 0x0003_2ed3)?;
        }

        // The first run has nothing to restore yet.
        if run != 0 {
            self.restore()?;
        }
        Ok(result)
    }
    fn apply(&mut self, result: &CalibrationRun) -> IoResult<()> {
        result
            .chains
            .iter()
            .take(self.ntxchains)
            .enumerate()
            .try_for_each(|(chain, sample)| write_results(&mut *self.bus, sample, chain as u16))
    }
}

/// Sign extend a 10-bit value.
const fn sign_extend_10(value: u16) -> u32 {
    let value = (value & 0x3ff) as u32;
    if value & 0x200 != 0 {
        value | 0xffff_fc00
    } else {
        value
    }
}

/// Write the correction for one chain into the baseband.
pub(crate) fn write_results<B: RegisterAccess>(
    bus: &mut B,
    sample: &ChainSample,
    chain: u16,
) -> IoResult<()> {
    if !sample.tx_valid() {
        return Ok(());
    }
    // The existing imbalance register holds the scaling factor.
    let scale = (bus.bb_read(ofdm0_txiqimbalance(chain)) >> 22) & 0x3ff;

    let x = sign_extend_10(sample.tx[0]).wrapping_mul(scale);
    bus.bb_setbits(ofdm0_txiqimbalance(chain), 0x3ff, (x >> 8) & 0x3ff)?;
    let x_msb = if (x >> 7) & 1 != 0 { 0x8000_0000 } else { 0 };
    bus.bb_setbits(OFDM0_ECCATHRESHOLD, 0x8000_0000, x_msb)?;

    let y = sign_extend_10(sample.tx[1]).wrapping_mul(scale);
    let tx_c = y >> 8;
    bus.bb_setbits(ofdm0_txafe(chain), 0xf000_0000, ((tx_c & 0x3c0) >> 6) << 28)?;
    bus.bb_setbits(ofdm0_txiqimbalance(chain), 0x003f_0000, (tx_c & 0x3f) << 16)?;
    let y_msb = if (y >> 7) & 1 != 0 { 0x2000_0000 } else { 0 };
    bus.bb_setbits(OFDM0_ECCATHRESHOLD, 0x2000_0000, y_msb)?;

    if !sample.rx_valid() {
        return Ok(());
    }
    let [rx_x, rx_y] = sample.rx.map(u32::from);
    bus.bb_setbits(ofdm0_rxiqimbalance(chain), 0x3ff, rx_x & 0x3ff)?;
    bus.bb_setbits(ofdm0_rxiqimbalance(chain), 0xfc00, (rx_y & 0x3f) << 10)?;
    let rx_y_high = (rx_y & 0x3c0) >> 6;
    if chain == 0 {
        bus.bb_setbits(OFDM0_RXIQEXTANTA, 0xf000_0000, rx_y_high << 28)
    } else {
        bus.bb_setbits(OFDM0_AGCRSSITABLE, 0xf000, rx_y_high << 12)
    }
}

const IQ_CMD_WIDTH_20: u8 = 0x01;
const IQ_CMD_WIDTH_40: u8 = 0x02;
const IQ_CMD_WIDTH_80: u8 = 0x04;
const IQ_CMD_BAND_2GHZ: u8 = 0x10;
const IQ_CMD_BAND_5GHZ: u8 = 0x20;

/// Build the H2C command asking the firmware to calibrate on `channel`.
pub(crate) fn iq_calibrate_message(
    channel: &Channel,
    ext_pa_5g: bool,
    ext_lna_5g: bool,
) -> H2cMessage {
    let band = match channel.band {
        Band::TwoPointFourGhz => IQ_CMD_BAND_2GHZ,
        Band::FiveGhz => IQ_CMD_BAND_5GHZ,
    };
    let width = match channel.width {
        ChannelWidth::Twenty => IQ_CMD_WIDTH_20,
        ChannelWidth::Forty => IQ_CMD_WIDTH_40,
        ChannelWidth::Eighty => IQ_CMD_WIDTH_80,
    };
    H2cMessage::new(
        H2cCommand::IqCalibrate,
        [
            channel.number,
            band | width,
            ext_pa_5g as u8 | (ext_lna_5g as u8) << 1,
        ],
    )
}
