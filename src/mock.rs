//! A register bus for tests.
//!
//! Registers are stored byte-addressed, so overlapping accesses of different widths behave like
//! on the real chip. Every write is logged, the CAM command interface is emulated and hardware
//! reactions can be modeled with a write hook.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    ll::{IoError, IoResult, RegisterAccess},
    regs::{CAMCMD, CAMCMD_CLR, CAMCMD_WRITE, CAMWRITE},
};

/// Number of emulated CAM words (64 slots of 8 words).
pub const CAM_WORDS: usize = 64 * 8;

#[derive(Default)]
pub struct Registers {
    bytes: HashMap<u16, u8>,
}
impl Registers {
    pub fn get(&self, addr: u16, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.bytes.get(&(addr + i as u16)).copied().unwrap_or(0);
        }
    }
    pub fn set(&mut self, addr: u16, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u16, *byte);
        }
    }
    pub fn get_4(&self, addr: u16) -> u32 {
        let mut buf = [0u8; 4];
        self.get(addr, &mut buf);
        u32::from_le_bytes(buf)
    }
    pub fn set_4(&mut self, addr: u16, value: u32) {
        self.set(addr, &value.to_le_bytes());
    }
}

type WriteHook = Box<dyn FnMut(&mut Registers, u16, &[u8])>;

pub struct MockBus {
    pub regs: Registers,
    pub cam: Vec<u32>,
    log: Vec<(u16, Vec<u8>)>,
    scripted: HashMap<u16, VecDeque<u32>>,
    failing: HashSet<u16>,
    hook: Option<WriteHook>,
    elapsed_us: u64,
}
impl MockBus {
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            cam: vec![0; CAM_WORDS],
            log: Vec::new(),
            scripted: HashMap::new(),
            failing: HashSet::new(),
            hook: None,
            elapsed_us: 0,
        }
    }
    /// Preload a 32-bit register without logging.
    pub fn preset_4(&mut self, addr: u16, value: u32) {
        self.regs.set_4(addr, value);
    }
    /// Preload an 8-bit register without logging.
    pub fn preset_1(&mut self, addr: u16, value: u8) {
        self.regs.set(addr, &[value]);
    }
    /// Queue values returned by subsequent reads of `addr`, before falling back to the register
    /// contents.
    pub fn script(&mut self, addr: u16, values: &[u32]) {
        self.scripted
            .entry(addr)
            .or_default()
            .extend(values.iter().copied());
    }
    /// Make every write to `addr` fail.
    pub fn fail_writes_to(&mut self, addr: u16) {
        self.failing.insert(addr);
    }
    pub fn on_write(&mut self, hook: impl FnMut(&mut Registers, u16, &[u8]) + 'static) {
        self.hook = Some(Box::new(hook));
    }
    pub fn writes(&self) -> &[(u16, Vec<u8>)] {
        &self.log
    }
    pub fn clear_log(&mut self) {
        self.log.clear();
    }
    /// All values written to `addr`, in order.
    pub fn writes_to(&self, addr: u16) -> Vec<u32> {
        self.log
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, data)| {
                let mut buf = [0u8; 4];
                buf[..data.len().min(4)].copy_from_slice(&data[..data.len().min(4)]);
                u32::from_le_bytes(buf)
            })
            .collect()
    }
    pub fn cam_word(&self, slot: usize, word: usize) -> u32 {
        self.cam[slot * 8 + word]
    }
    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_us
    }
    fn emulate_cam(&mut self, command: u32) {
        if command & CAMCMD_CLR != 0 {
            self.cam.iter_mut().for_each(|word| *word = 0);
        }
        if command & CAMCMD_WRITE != 0 {
            let addr = (command & 0xffff) as usize;
            if addr < CAM_WORDS {
                self.cam[addr] = self.regs.get_4(CAMWRITE);
            }
        }
    }
}
impl RegisterAccess for MockBus {
    fn read(&mut self, addr: u16, buf: &mut [u8]) {
        if let Some(value) = self
            .scripted
            .get_mut(&addr)
            .and_then(|queue| queue.pop_front())
        {
            let bytes = value.to_le_bytes();
            let len = buf.len().min(4);
            buf[..len].copy_from_slice(&bytes[..len]);
            return;
        }
        self.regs.get(addr, buf);
    }
    fn write(&mut self, addr: u16, data: &[u8]) -> IoResult<()> {
        if self.failing.contains(&addr) {
            return Err(IoError);
        }
        self.regs.set(addr, data);
        self.log.push((addr, data.to_vec()));
        if addr == CAMCMD && data.len() == 4 {
            self.emulate_cam(self.regs.get_4(CAMCMD));
        }
        if let Some(mut hook) = self.hook.take() {
            hook(&mut self.regs, addr, data);
            self.hook = Some(hook);
        }
        Ok(())
    }
    fn delay_us(&mut self, us: u32) {
        self.elapsed_us += u64::from(us);
    }
}
