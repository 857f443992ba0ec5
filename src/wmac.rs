//! The driver facade.
//!
//! [Rtwn] ties the chip specific parts together and owns the shared state. Register access is
//! serialized through the device lock, stations live behind a lock of their own. Work, that may
//! sleep, is deferred to [Rtwn::run_worker]: key cache programming arrives through a bounded
//! queue, and on chips without in-band TX reports the C2H window is polled from there too.
//!
//! The RX path only takes the station lock, so it can run in interrupt context.

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex, channel::Channel};
use embassy_time::{Duration, Timer};
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    c2h::{read_event, C2hPoller, C2H_SLOW_INTERVAL, R92C_C2H_TX_REPORT},
    calib::{
        iq_calibrate_message, CalibrationEngine, CalibrationPath, CalibrationState,
        RegisterIqSampler,
    },
    cam::{KeyCache, SlotIndex},
    chip::{Band, Channel as RadioChannel, Chip},
    crypto::{CamAlgorithm, CipherParameters, CAM_KEY_LENGTH},
    firmware::{
        download, prepare_image, FirmwareGuard, FirmwareStore, FirmwareVersion, FwCmdError,
        FwResetReason, H2cMailbox, H2cMessage, LoadError,
    },
    ll::{IoError, RegisterAccess, RegisterExt},
    node::{NodeEntry, NodeTable},
    rates::RateIndex,
    regs::MAR,
    rx::{
        decode_rssi, multicast_filter, split_data, ChecksumStatus, RxClass, RxDropReason, TxReport,
        R12A_C2H_IQK_FINISHED, RX_DESC_LEN,
    },
    sync::{DropGuard, Latch, PendingFlag},
    tx::TxRequest,
    DefaultRawMutex,
};

/// Number of key operations, that can be queued for the worker.
pub const KEY_QUEUE_DEPTH: usize = 8;

/// Errors returned by the driver.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RtwnError {
    /// A register write failed.
    Io(IoError),
    Firmware(LoadError),
    FwCmd(FwCmdError),
    /// A firmware calibration is already in progress.
    CalibrationInProgress,
    /// Neither the host nor the loaded firmware can calibrate this chip.
    CalibrationUnavailable,
    /// The MACID is out of range for this chip.
    InvalidStation,
    /// The device has an unsupported number of bulk out endpoints.
    InvalidEndpointCount,
}
impl From<IoError> for RtwnError {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
impl From<LoadError> for RtwnError {
    fn from(err: LoadError) -> Self {
        Self::Firmware(err)
    }
}
impl From<FwCmdError> for RtwnError {
    fn from(err: FwCmdError) -> Self {
        Self::FwCmd(err)
    }
}
/// A [Result] returned by the driver.
pub type RtwnResult<T> = Result<T, RtwnError>;

/// Receives the outcome of transmissions.
pub trait RateControl {
    /// A frame to station `macid` of interface `vap` was transmitted.
    fn tx_complete(&mut self, vap: u8, macid: u8, success: bool, retries: u8);
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Where a key ended up.
pub enum KeyInstall {
    /// The key was queued for programming into this CAM slot.
    Hardware(SlotIndex),
    /// The key has to be handled in software.
    Software,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyOperation {
    Program {
        algorithm: CamAlgorithm,
        key_id: u8,
        key: [u8; CAM_KEY_LENGTH],
        mac: [u8; 6],
    },
    Clear,
}
/// Key cache work deferred to the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyCommand {
    slot: SlotIndex,
    operation: KeyOperation,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// The result of a calibration request.
pub enum CalibrationOutcome {
    /// The firmware was asked to calibrate and will report completion.
    Delegated,
    /// The host calibrated.
    Software(CalibrationState),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// A frame received from the air.
pub struct RxFrame<'a> {
    /// The 802.11 frame, without descriptor, PHY status and padding.
    pub frame: &'a [u8],
    pub rate: RateIndex,
    /// The RSSI in dBm, if the PHY status was present.
    pub rssi: Option<i8>,
    /// The MACID of the transmitter, if it's a known station.
    pub macid: Option<u8>,
    /// The hardware decrypted the frame.
    pub decrypted: bool,
    /// Short preamble or short guard interval.
    pub short_plcp: bool,
    pub amsdu: bool,
    pub checksum: ChecksumStatus,
    /// The lower 32 bits of the TSF at reception.
    pub tsf_low: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// What became of a received buffer.
pub enum RxEvent<'a> {
    Frame(RxFrame<'a>),
    /// A TX report, which was forwarded to rate control.
    TxReport(TxReport),
    /// A firmware event, identified by its ID.
    FirmwareEvent(u8),
    Dropped(RxDropReason),
}

/// Everything behind the device lock.
struct DeviceState<B: RegisterAccess> {
    bus: B,
    cam: KeyCache,
    mailbox: H2cMailbox,
    fw_version: Option<FirmwareVersion>,
    calibration_path: CalibrationPath,
    calibration: CalibrationEngine,
    c2h: C2hPoller,
    ext_pa_5g: bool,
    ext_lna_5g: bool,
}

/// Driver for a Realtek rtwn chip.
///
/// All register access is serialized through the device lock. The station table has its own lock,
/// which is never held while the device lock is taken.
pub struct Rtwn<B: RegisterAccess, C: Chip> {
    chip: C,
    device: blocking_mutex::Mutex<DefaultRawMutex, RefCell<DeviceState<B>>>,
    nodes: blocking_mutex::Mutex<DefaultRawMutex, RefCell<NodeTable>>,
    key_commands: Channel<DefaultRawMutex, KeyCommand, KEY_QUEUE_DEPTH>,
    fw_loaded: AtomicBool,
    detached: AtomicBool,
    iqk_running: Latch,
    reports_requested: PendingFlag,
}
impl<B: RegisterAccess, C: Chip> Rtwn<B, C> {
    /// Create a new driver instance for `chip`, which is reached through `bus`.
    pub fn new(bus: B, chip: C) -> Self {
        let config = chip.config();
        trace!("Creating driver for {}.", config.name);
        Self {
            device: blocking_mutex::Mutex::new(RefCell::new(DeviceState {
                bus,
                cam: KeyCache::new(config.cam_entry_limit),
                mailbox: H2cMailbox::default(),
                fw_version: None,
                calibration_path: chip.calibration_path(None),
                calibration: CalibrationEngine::new(config.ntxchains),
                c2h: C2hPoller::default(),
                ext_pa_5g: false,
                ext_lna_5g: false,
            })),
            nodes: blocking_mutex::Mutex::new(RefCell::new(NodeTable::new(config.macid_limit))),
            key_commands: Channel::new(),
            fw_loaded: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            iqk_running: Latch::new(),
            reports_requested: PendingFlag::new(),
            chip,
        }
    }
    fn with_device<R>(&self, f: impl FnOnce(&mut DeviceState<B>) -> R) -> R {
        self.device.lock(|state| f(&mut state.borrow_mut()))
    }
    fn with_nodes<R>(&self, f: impl FnOnce(&mut NodeTable) -> R) -> R {
        self.nodes.lock(|nodes| f(&mut nodes.borrow_mut()))
    }
    /// Run `f` with exclusive access to the bus.
    ///
    /// This is meant for the initialization sequences, that aren't part of this crate.
    pub fn with_bus<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.with_device(|state| f(&mut state.bus))
    }
    pub fn chip(&self) -> &C {
        &self.chip
    }
    /// Configure the external 5 GHz front-end, which is reported to the firmware for
    /// calibration.
    pub fn set_5ghz_frontend(&self, ext_pa: bool, ext_lna: bool) {
        self.with_device(|state| {
            state.ext_pa_5g = ext_pa;
            state.ext_lna_5g = ext_lna;
        });
    }

    /// Fetch the firmware image from `store` and download it into the MCU.
    ///
    /// The image is fetched without holding the device lock and released on every path.
    pub fn load_firmware<S: FirmwareStore>(&self, store: &mut S) -> Result<(), LoadError> {
        let config = self.chip.config();
        let Some(image) = FirmwareGuard::fetch(store, config.fw_name) else {
            error!("Firmware image {} not found.", config.fw_name);
            return Err(LoadError::NotFound);
        };
        let (body, version) = prepare_image(&image, config)?;
        self.with_device(|state| {
            download(&mut state.bus, &self.chip, body)?;
            state.fw_version = version;
            state.calibration_path = self.chip.calibration_path(version);
            debug!(
                "Firmware calibration: {}",
                state.calibration_path == CalibrationPath::Firmware
            );
            Ok::<(), LoadError>(())
        })?;
        self.fw_loaded.store(true, Ordering::Release);
        info!("Firmware for {} loaded.", config.name);
        Ok(())
    }
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.with_device(|state| state.fw_version)
    }
    pub fn is_firmware_loaded(&self) -> bool {
        self.fw_loaded.load(Ordering::Acquire)
    }
    /// Send a command to the firmware.
    pub fn fw_cmd(&self, message: &H2cMessage) -> Result<(), FwCmdError> {
        if !self.is_firmware_loaded() {
            warn!("Firmware isn't loaded, dropping H2C command.");
            return Err(FwCmdError::NotLoaded);
        }
        self.with_device(|state| state.mailbox.send_message(&mut state.bus, message))
    }
    /// Tell the firmware about the association state of a station.
    pub fn set_media_status(&self, macid: u8, associated: bool) -> Result<(), FwCmdError> {
        self.fw_cmd(&self.chip.media_status(macid, associated))
    }

    /// Wipe the key cache.
    pub fn init_cam(&self) -> RtwnResult<()> {
        self.with_device(|state| state.cam.init(&mut state.bus))?;
        Ok(())
    }
    /// Install a key.
    ///
    /// Pairwise keys get a CAM slot and are programmed by the worker. Group keys are always left
    /// to software, since the key search is unreliable with multiple interfaces.
    pub fn key_set(&self, cipher: &CipherParameters<'_>, key_id: u8, mac: &[u8; 6]) -> KeyInstall {
        if cipher.is_group() {
            debug!("Group key {} stays in software.", key_id);
            return KeyInstall::Software;
        }
        let Some(slot) = self.with_device(|state| state.cam.allocate_slot(true)) else {
            return KeyInstall::Software;
        };
        let command = KeyCommand {
            slot,
            operation: KeyOperation::Program {
                algorithm: cipher.algorithm(),
                key_id,
                key: cipher.padded_key(),
                mac: *mac,
            },
        };
        if self.key_commands.try_send(command).is_err() {
            warn!("Key queue is full, keeping key {} in software.", key_id);
            self.with_device(|state| state.cam.release_slot(slot));
            return KeyInstall::Software;
        }
        KeyInstall::Hardware(slot)
    }
    /// Remove a key, which was installed in `slot`.
    ///
    /// Returns [false] if the removal couldn't be queued.
    pub fn key_delete(&self, slot: SlotIndex) -> bool {
        let queued = self
            .key_commands
            .try_send(KeyCommand {
                slot,
                operation: KeyOperation::Clear,
            })
            .is_ok();
        if !queued {
            warn!("Key queue is full, couldn't delete key in slot {}.", slot.index());
        }
        queued
    }
    fn execute_key_command(&self, command: KeyCommand) {
        // A slot, that failed to program, stays invalid.
        let result = self.with_device(|state| match command.operation {
            KeyOperation::Program {
                algorithm,
                key_id,
                key,
                mac,
            } => state
                .cam
                .program(&mut state.bus, command.slot, algorithm, key_id, &key, &mac),
            KeyOperation::Clear => state.cam.clear(&mut state.bus, command.slot),
        });
        if result.is_err() {
            warn!("Key command for slot {} failed.", command.slot.index());
        }
    }
    /// Execute all queued key commands.
    ///
    /// Returns the number of commands executed.
    pub fn process_key_commands(&self) -> usize {
        let mut executed = 0;
        while let Ok(command) = self.key_commands.try_receive() {
            self.execute_key_command(command);
            executed += 1;
        }
        executed
    }

    /// Calibrate the RF front-end for `channel`.
    ///
    /// Depending on the chip and firmware, this either asks the firmware to calibrate or drives
    /// the calibration from the host. A firmware calibration, that is still running, is reported
    /// as [RtwnError::CalibrationInProgress]. Chips, that can only be calibrated by firmware,
    /// return [RtwnError::CalibrationUnavailable] without touching the hardware, if the loaded
    /// firmware can't do it.
    pub fn iq_calibrate(&self, channel: &RadioChannel) -> RtwnResult<CalibrationOutcome> {
        let (path, ext_pa, ext_lna) =
            self.with_device(|state| (state.calibration_path, state.ext_pa_5g, state.ext_lna_5g));
        match path {
            CalibrationPath::Firmware => {
                if !self.iqk_running.try_acquire() {
                    debug!("Firmware calibration is already running.");
                    return Err(RtwnError::CalibrationInProgress);
                }
                let guard = DropGuard::new(|| self.iqk_running.release());
                self.fw_cmd(&iq_calibrate_message(channel, ext_pa, ext_lna))?;
                guard.defuse();
                debug!("Started firmware calibration on channel {}.", channel.number);
                Ok(CalibrationOutcome::Delegated)
            }
            CalibrationPath::Software => {
                let ntxchains = self.chip.config().ntxchains;
                let state = self.with_device(|state| {
                    let DeviceState {
                        bus, calibration, ..
                    } = state;
                    calibration.run(&mut RegisterIqSampler::new(bus, ntxchains))
                })?;
                Ok(CalibrationOutcome::Software(state))
            }
            CalibrationPath::Unavailable => {
                debug!("No IQ calibration available for {}.", self.chip.config().name);
                Err(RtwnError::CalibrationUnavailable)
            }
        }
    }
    pub fn is_calibration_running(&self) -> bool {
        self.iqk_running.is_set()
    }
    pub fn calibration_state(&self) -> CalibrationState {
        self.with_device(|state| state.calibration.state())
    }

    /// Register a station.
    pub fn node_join(&self, entry: NodeEntry) -> RtwnResult<()> {
        if self.with_nodes(|nodes| nodes.insert(entry)) {
            Ok(())
        } else {
            Err(RtwnError::InvalidStation)
        }
    }
    pub fn node_leave(&self, macid: u8) -> Option<NodeEntry> {
        self.with_nodes(|nodes| nodes.remove(macid))
    }
    /// Get a copy of a station entry.
    pub fn node(&self, macid: u8) -> Option<NodeEntry> {
        self.with_nodes(|nodes| nodes.get(macid))
    }
    /// The last RSSI of a station, or of the device if the station is unknown.
    pub fn last_rssi(&self, macid: Option<u8>) -> i8 {
        self.with_nodes(|nodes| nodes.last_rssi(macid))
    }

    /// Forward a TX report to rate control.
    ///
    /// Returns [false] if the report references an unknown station.
    fn handle_tx_report(&self, report: &TxReport, rate_control: &mut impl RateControl) -> bool {
        if report.macid as usize >= self.chip.config().macid_limit {
            warn!("TX report for invalid MACID {}.", report.macid);
            return false;
        }
        let Some(node) = self.node(report.macid) else {
            debug!("TX report for unknown MACID {}.", report.macid);
            return false;
        };
        trace!(
            "TX report for MACID {}: success {} retries {}",
            report.macid,
            report.success,
            report.retries
        );
        rate_control.tx_complete(node.vap, node.id, report.success, report.retries);
        true
    }
    /// Process a buffer received from the DMA engine.
    ///
    /// This never touches the registers and never sleeps, so it's safe to call from an interrupt
    /// context.
    pub fn handle_rx<'a>(
        &self,
        buf: &'a [u8],
        rate_control: &mut impl RateControl,
    ) -> RxEvent<'a> {
        match self.chip.classify_rx(buf) {
            RxClass::TxReport => match self.chip.parse_tx_report(buf) {
                Some(report) if self.handle_tx_report(&report, rate_control) => {
                    RxEvent::TxReport(report)
                }
                _ => RxEvent::Dropped(RxDropReason::MalformedReport),
            },
            RxClass::Other => {
                let id = buf.get(RX_DESC_LEN).copied().unwrap_or_default();
                if id == R12A_C2H_IQK_FINISHED {
                    debug!("Firmware calibration finished.");
                    self.iqk_running.release();
                } else {
                    debug!("Unhandled firmware event {}.", id);
                }
                RxEvent::FirmwareEvent(id)
            }
            RxClass::Data => match self.handle_data(buf) {
                Ok(frame) => RxEvent::Frame(frame),
                Err(reason) => RxEvent::Dropped(reason),
            },
        }
    }
    fn handle_data<'a>(&self, buf: &'a [u8]) -> Result<RxFrame<'a>, RxDropReason> {
        let data = split_data(buf)?;
        let checksum = self.chip.checksum_status(&data.desc);
        if checksum == ChecksumStatus::Invalid {
            debug!("Dropping frame with bad checksum.");
            return Err(RxDropReason::BadChecksum);
        }
        let rate = data.desc.rate();
        let rssi = data.phy.map(|phy| {
            decode_rssi(
                rate,
                || self.chip.cck_rssi(phy),
                || self.chip.ofdm_rssi(phy),
            )
        });
        // The transmitter address is the second address of every frame, that has one.
        let transmitter = data
            .frame
            .get(10..16)
            .and_then(|addr| <[u8; 6]>::try_from(addr).ok());
        let macid = self.with_nodes(|nodes| {
            let macid = transmitter
                .and_then(|addr| nodes.find(&addr))
                .map(|node| node.id);
            if let Some(rssi) = rssi {
                nodes.record_rssi(macid, rssi, rate);
            }
            macid
        });
        Ok(RxFrame {
            frame: data.frame,
            rate,
            rssi,
            macid,
            decrypted: data.desc.decrypted(),
            short_plcp: data.desc.short_plcp(),
            amsdu: data.desc.is_amsdu(),
            checksum,
            tsf_low: data.desc.tsf_low(),
        })
    }

    /// Fill the TX descriptor for a frame.
    pub fn fill_tx_desc(&self, desc: &mut C::TxDesc, request: &TxRequest) {
        if request.macid as usize >= self.chip.config().macid_limit {
            debug!("MACID {} is out of range, sending as broadcast.", request.macid);
        }
        self.chip.fill_tx_desc(desc, request);
        if request.report && self.chip.polls_c2h() {
            self.reports_requested.raise();
        }
    }
    /// Fill the descriptor for the beacon of interface `id`.
    pub fn fill_beacon_desc(&self, desc: &mut C::TxDesc, id: u8, band: Band) {
        self.chip.fill_beacon_desc(desc, id, band);
    }
    /// Select the beacon slot, that the next beacon is written to.
    pub fn beacon_select(&self, id: u8) -> RtwnResult<()> {
        self.with_device(|state| self.chip.beacon_select(&mut state.bus, id))?;
        Ok(())
    }
    /// Program the multicast filter to accept `addrs`.
    pub fn set_multicast_filter<'a>(
        &self,
        addrs: impl IntoIterator<Item = &'a [u8; 6]>,
    ) -> RtwnResult<()> {
        let [low, high] = multicast_filter(addrs);
        self.with_device(|state| {
            state.bus.write_4(MAR, low)?;
            state.bus.write_4(MAR + 4, high)
        })?;
        Ok(())
    }

    /// Poll the C2H window once and dispatch the event, if there is one.
    ///
    /// Returns the time until the next poll.
    pub fn poll_c2h(&self, rate_control: &mut impl RateControl) -> Duration {
        if !self.chip.polls_c2h() || self.is_detached() {
            return C2H_SLOW_INTERVAL;
        }
        let (event, interval) = self.with_device(|state| {
            let event = read_event(&mut state.bus).unwrap_or_else(|_| {
                warn!("Couldn't acknowledge C2H event.");
                None
            });
            // Lowered on every poll, so a lost report can't keep the poller busy forever.
            (event, state.c2h.advance(self.reports_requested.take()))
        });
        if let Some(event) = event {
            if event.id == R92C_C2H_TX_REPORT {
                if let Some(report) = self.chip.parse_tx_report(event.payload()) {
                    self.handle_tx_report(&report, rate_control);
                }
            } else {
                debug!("Unhandled C2H event {}.", event.id);
            }
        }
        interval
    }
    /// Run the deferred work until the device is detached.
    ///
    /// This executes key commands as they come in and polls the C2H window, if the chip
    /// requires it.
    pub async fn run_worker(&self, rate_control: &mut impl RateControl) {
        let mut interval = self.poll_c2h(rate_control);
        while !self.is_detached() {
            match select(self.key_commands.receive(), Timer::after(interval)).await {
                Either::First(command) => self.execute_key_command(command),
                Either::Second(()) => interval = self.poll_c2h(rate_control),
            }
        }
        debug!("Worker stopped.");
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
    /// Stop the worker and shut down the firmware.
    ///
    /// The worker notices on its next wakeup.
    pub fn detach(&self) -> RtwnResult<()> {
        self.detached.store(true, Ordering::Release);
        self.reports_requested.take();
        if self.fw_loaded.swap(false, Ordering::AcqRel) {
            self.with_device(|state| self.chip.fw_reset(&mut state.bus, FwResetReason::Shutdown))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::{block_on, join::join};

    use super::*;
    use crate::{
        c2h::C2H_FAST_INTERVAL,
        chip::{ChannelWidth, Rtl8192ce, Rtl8812au},
        firmware::{
            tests::{image_with_header, ready_on_rdy, TestStore},
            H2cCommand,
        },
        mock::MockBus,
        regs::{
            hmebox, C2H_EVT_CLEAR, C2H_EVT_FW_CLOSE, C2H_EVT_HOST_CLOSE, C2H_EVT_MSG, MCUFWDL,
            MCUFWDL_CHKSUM_RPT,
        },
        rx::{multicast_hash, tests::{data_buffer, report_buffer}, R12A_C2H_TX_REPORT},
        tx::{PcieTxDesc, UsbTxDesc},
    };

    const PEER: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x07];

    #[derive(Default)]
    struct Recorder {
        reports: Vec<(u8, u8, bool, u8)>,
    }
    impl RateControl for Recorder {
        fn tx_complete(&mut self, vap: u8, macid: u8, success: bool, retries: u8) {
            self.reports.push((vap, macid, success, retries));
        }
    }

    fn firmware_bus() -> MockBus {
        let mut bus = MockBus::new();
        bus.preset_1(MCUFWDL, MCUFWDL_CHKSUM_RPT);
        ready_on_rdy(&mut bus);
        bus
    }
    fn store(image: Vec<u8>) -> TestStore {
        TestStore {
            image: Some(image),
            releases: 0,
        }
    }
    /// An RTL8812AU with firmware, that calibrates itself.
    fn loaded_r12a() -> Rtwn<MockBus, Rtl8812au> {
        let rtwn = Rtwn::new(firmware_bus(), Rtl8812au);
        let mut store = store(image_with_header(0x9500, 128));
        rtwn.load_firmware(&mut store).unwrap();
        rtwn
    }
    fn channel() -> RadioChannel {
        RadioChannel {
            number: 6,
            band: Band::TwoPointFourGhz,
            width: ChannelWidth::Twenty,
        }
    }

    #[test]
    fn firmware_load_selects_calibration_path() {
        let rtwn = Rtwn::new(firmware_bus(), Rtl8812au);
        let mut store = store(image_with_header(0x9500, 4096 + 16));
        assert_eq!(rtwn.load_firmware(&mut store), Ok(()));
        assert_eq!(store.releases, 1);
        assert_eq!(rtwn.firmware_version().map(|v| v.version), Some(0x19));
        assert!(rtwn.is_firmware_loaded());
        assert_eq!(
            rtwn.iq_calibrate(&channel()),
            Ok(CalibrationOutcome::Delegated)
        );
    }
    #[test]
    fn missing_firmware() {
        let rtwn = Rtwn::new(firmware_bus(), Rtl8812au);
        let mut store = TestStore {
            image: None,
            releases: 0,
        };
        assert_eq!(rtwn.load_firmware(&mut store), Err(LoadError::NotFound));
        assert_eq!(
            rtwn.set_media_status(0, true),
            Err(FwCmdError::NotLoaded)
        );
    }
    #[test]
    fn firmware_timeout_is_fatal() {
        let mut bus = MockBus::new();
        bus.preset_1(MCUFWDL, MCUFWDL_CHKSUM_RPT);
        let rtwn = Rtwn::new(bus, Rtl8812au);
        let mut store = store(image_with_header(0x9500, 64));
        assert_eq!(rtwn.load_firmware(&mut store), Err(LoadError::Timeout));
        // The image is released on the error path too.
        assert_eq!(store.releases, 1);
        assert!(!rtwn.is_firmware_loaded());
    }
    #[test]
    fn media_status_goes_through_the_mailbox() {
        let rtwn = loaded_r12a();
        rtwn.set_media_status(3, true).unwrap();
        let word = rtwn.with_bus(|bus| bus.read_4(hmebox(0)));
        assert_eq!(
            word.to_le_bytes(),
            [H2cCommand::MediaStatus.into_bits(), 1, 3, 0]
        );
    }
    #[test]
    fn firmware_calibration_is_latched_until_finished() {
        let rtwn = loaded_r12a();
        let mut rate_control = Recorder::default();
        assert_eq!(
            rtwn.iq_calibrate(&channel()),
            Ok(CalibrationOutcome::Delegated)
        );
        assert!(rtwn.is_calibration_running());
        assert_eq!(
            rtwn.iq_calibrate(&channel()),
            Err(RtwnError::CalibrationInProgress)
        );

        let finished = report_buffer(R12A_C2H_IQK_FINISHED, &[]);
        assert_eq!(
            rtwn.handle_rx(&finished, &mut rate_control),
            RxEvent::FirmwareEvent(R12A_C2H_IQK_FINISHED)
        );
        assert!(!rtwn.is_calibration_running());
        assert_eq!(
            rtwn.iq_calibrate(&channel()),
            Ok(CalibrationOutcome::Delegated)
        );
    }
    #[test]
    fn failed_calibration_command_releases_the_latch() {
        let rtwn = Rtwn::new(firmware_bus(), Rtl8812au);
        let mut store = store(image_with_header(0x9500, 64));
        rtwn.load_firmware(&mut store).unwrap();
        rtwn.with_bus(|bus| bus.fail_writes_to(hmebox(0)));
        assert_eq!(
            rtwn.iq_calibrate(&channel()),
            Err(RtwnError::FwCmd(FwCmdError::Io(IoError)))
        );
        assert!(!rtwn.is_calibration_running());
    }
    #[test]
    fn software_calibration() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8192ce::new(1));
        // All measurements read back as zero, which is consistent.
        assert_eq!(
            rtwn.iq_calibrate(&channel()),
            Ok(CalibrationOutcome::Software(CalibrationState::Converged(1)))
        );
        assert_eq!(rtwn.calibration_state(), CalibrationState::Converged(1));
    }
    #[test]
    fn calibration_without_capable_firmware_is_refused() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        assert_eq!(
            rtwn.iq_calibrate(&channel()),
            Err(RtwnError::CalibrationUnavailable)
        );
        assert!(rtwn.with_bus(|bus| bus.writes().is_empty()));
        assert_eq!(rtwn.calibration_state(), CalibrationState::Idle);

        // Firmware, that doesn't know the command, changes nothing.
        let rtwn = Rtwn::new(firmware_bus(), Rtl8812au);
        let mut image = image_with_header(0x9500, 64);
        image[4..6].copy_from_slice(&0x16u16.to_le_bytes());
        let mut store = store(image);
        rtwn.load_firmware(&mut store).unwrap();
        rtwn.with_bus(|bus| bus.clear_log());
        assert_eq!(
            rtwn.iq_calibrate(&channel()),
            Err(RtwnError::CalibrationUnavailable)
        );
        assert!(rtwn.with_bus(|bus| bus.writes().is_empty()));
        assert!(!rtwn.is_calibration_running());
    }
    #[test]
    fn pairwise_key_is_programmed_by_the_worker() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        let key = [0x11; 16];
        let cipher = CipherParameters::Ccmp(&key, crate::crypto::KeyType::Pairwise);
        let KeyInstall::Hardware(slot) = rtwn.key_set(&cipher, 0, &PEER) else {
            panic!("Pairwise key wasn't offloaded.");
        };
        // Nothing hits the bus before the worker runs.
        assert!(rtwn.with_bus(|bus| bus.writes().is_empty()));
        assert_eq!(rtwn.process_key_commands(), 1);
        assert_eq!(rtwn.with_bus(|bus| bus.cam_word(slot.index(), 2)), 0x1111_1111);

        assert!(rtwn.key_delete(slot));
        assert_eq!(rtwn.process_key_commands(), 1);
        assert_eq!(rtwn.with_bus(|bus| bus.cam_word(slot.index(), 0)), 0);
        // The slot is free again.
        assert_eq!(rtwn.key_set(&cipher, 0, &PEER), KeyInstall::Hardware(slot));
    }
    #[test]
    fn failed_key_command_leaves_the_slot_invalid() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        let key = [0x33; 16];
        let cipher = CipherParameters::Ccmp(&key, crate::crypto::KeyType::Pairwise);
        let KeyInstall::Hardware(slot) = rtwn.key_set(&cipher, 0, &PEER) else {
            panic!("Pairwise key wasn't offloaded.");
        };
        rtwn.with_bus(|bus| bus.fail_writes_to(crate::regs::CAMWRITE));
        // The failure is logged and the queue keeps draining.
        assert!(rtwn.key_delete(slot));
        assert_eq!(rtwn.process_key_commands(), 2);
        assert_eq!(rtwn.with_bus(|bus| bus.cam_word(slot.index(), 0)), 0);
    }
    #[test]
    fn group_keys_stay_in_software() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        let key = [0x22; 16];
        let cipher = CipherParameters::Ccmp(&key, crate::crypto::KeyType::Group);
        assert_eq!(rtwn.key_set(&cipher, 1, &[0xff; 6]), KeyInstall::Software);
        assert_eq!(rtwn.process_key_commands(), 0);
    }
    #[test]
    fn full_key_queue_falls_back_to_software() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        let key = [0x33; 16];
        let cipher = CipherParameters::Ccmp(&key, crate::crypto::KeyType::Pairwise);
        for _ in 0..KEY_QUEUE_DEPTH {
            assert!(matches!(
                rtwn.key_set(&cipher, 0, &PEER),
                KeyInstall::Hardware(_)
            ));
        }
        assert_eq!(rtwn.key_set(&cipher, 0, &PEER), KeyInstall::Software);
        // The slot of the rejected key went back into the pool.
        let rejected = SlotIndex::new(KEY_QUEUE_DEPTH as u8 + 1);
        assert!(!rtwn.with_device(|state| state.cam.is_allocated(rejected)));
    }
    #[test]
    fn in_band_tx_report_reaches_rate_control() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        let mut rate_control = Recorder::default();
        rtwn.node_join(NodeEntry::new(4, 1, PEER)).unwrap();

        // Retry limit not exceeded, MACID 4, three retries.
        let report = report_buffer(R12A_C2H_TX_REPORT, &[0, 4, 3, 0, 0, 0, 0, 0]);
        assert!(matches!(
            rtwn.handle_rx(&report, &mut rate_control),
            RxEvent::TxReport(TxReport {
                macid: 4,
                success: true,
                retries: 3
            })
        ));
        assert_eq!(rate_control.reports, vec![(1, 4, true, 3)]);

        // Out of range MACIDs are dropped without looking at the table.
        let report = report_buffer(R12A_C2H_TX_REPORT, &[0x80, 200, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            rtwn.handle_rx(&report, &mut rate_control),
            RxEvent::Dropped(RxDropReason::MalformedReport)
        );
        assert_eq!(rate_control.reports.len(), 1);
    }
    #[test]
    fn data_frame_updates_station_rssi() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        let mut rate_control = Recorder::default();
        rtwn.node_join(NodeEntry::new(2, 0, PEER)).unwrap();

        let mut frame = vec![0u8; 24];
        frame[10..16].copy_from_slice(&PEER);
        let mut buf = data_buffer(4, 0, RateIndex::OFDM6.into_bits(), &frame);
        // PWDB in the second PHY status byte, -60 dBm.
        buf[RX_DESC_LEN + 1] = 100;

        let RxEvent::Frame(rx) = rtwn.handle_rx(&buf, &mut rate_control) else {
            panic!("Frame wasn't delivered.");
        };
        assert_eq!(rx.frame, &frame[..]);
        assert_eq!(rx.macid, Some(2));
        assert_eq!(rx.rssi, Some(-60));
        assert_eq!(rtwn.last_rssi(Some(2)), -60);
        assert_eq!(rtwn.node(2).and_then(|node| node.avg_pwdb), Some(40));
    }
    #[test]
    fn polled_tx_report() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8192ce::default());
        let mut rate_control = Recorder::default();
        rtwn.node_join(NodeEntry::new(5, 0, PEER)).unwrap();

        let mut desc = PcieTxDesc::default();
        rtwn.fill_tx_desc(
            &mut desc,
            &TxRequest {
                macid: 5,
                report: true,
                ..Default::default()
            },
        );
        rtwn.with_bus(|bus| {
            bus.preset_1(C2H_EVT_CLEAR, C2H_EVT_FW_CLOSE);
            bus.preset_1(C2H_EVT_MSG, 0x80 | R92C_C2H_TX_REPORT);
            // Two retries, MACID 5, packet OK.
            bus.preset_4(C2H_EVT_MSG + 2, 0x0000_0002);
            bus.preset_4(C2H_EVT_MSG + 6, 0x0100_0500);
        });
        assert_eq!(rtwn.poll_c2h(&mut rate_control), C2H_FAST_INTERVAL);
        assert_eq!(rate_control.reports, vec![(0, 5, true, 2)]);
        assert_eq!(
            rtwn.with_bus(|bus| bus.read_1(C2H_EVT_CLEAR)),
            C2H_EVT_HOST_CLOSE
        );
    }
    #[test]
    fn lost_tx_report_lets_the_poller_idle() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8192ce::default());
        let mut rate_control = Recorder::default();
        let mut desc = PcieTxDesc::default();
        rtwn.fill_tx_desc(
            &mut desc,
            &TxRequest {
                macid: 5,
                report: true,
                ..Default::default()
            },
        );
        // The report never shows up in the C2H window.
        assert_eq!(rtwn.poll_c2h(&mut rate_control), C2H_FAST_INTERVAL);
        let last = (0..100)
            .map(|_| rtwn.poll_c2h(&mut rate_control))
            .last();
        assert_eq!(last, Some(C2H_SLOW_INTERVAL));
        assert!(rate_control.reports.is_empty());
    }
    #[test]
    fn multicast_filter_is_written() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        let addr = [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01];
        rtwn.set_multicast_filter([&addr]).unwrap();
        let pos = multicast_hash(&addr);
        let word = rtwn.with_bus(|bus| bus.read_4(MAR + u16::from(pos / 32) * 4));
        assert_eq!(word, 1 << (pos % 32));
    }
    #[test]
    fn out_of_range_station_is_rejected() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8192ce::default());
        assert_eq!(
            rtwn.node_join(NodeEntry::new(32, 0, PEER)),
            Err(RtwnError::InvalidStation)
        );
    }
    #[test]
    fn worker_programs_keys_until_detached() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8192ce::default());
        let mut rate_control = Recorder::default();
        let key = [0x44; 16];
        let cipher = CipherParameters::Tkip(&key, crate::crypto::KeyType::Pairwise);
        let KeyInstall::Hardware(slot) = rtwn.key_set(&cipher, 0, &PEER) else {
            panic!("Pairwise key wasn't offloaded.");
        };
        block_on(join(rtwn.run_worker(&mut rate_control), async {
            Timer::after_millis(30).await;
            rtwn.detach().unwrap();
        }));
        assert_eq!(rtwn.with_bus(|bus| bus.cam_word(slot.index(), 2)), 0x4444_4444);
        assert!(rtwn.is_detached());
    }
    #[test]
    fn detached_worker_returns_immediately() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        rtwn.detach().unwrap();
        block_on(rtwn.run_worker(&mut Recorder::default()));
        assert_eq!(
            rtwn.poll_c2h(&mut Recorder::default()),
            C2H_SLOW_INTERVAL
        );
    }
    #[test]
    fn beacon_descriptor_and_slot() {
        let rtwn = Rtwn::new(MockBus::new(), Rtl8812au);
        let mut desc = UsbTxDesc::default();
        rtwn.fill_beacon_desc(&mut desc, 0, Band::FiveGhz);
        assert!(desc.checksum_valid());
        rtwn.beacon_select(0).unwrap();
    }
}
