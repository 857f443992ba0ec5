//! Polled chip-to-host (C2H) events.
//!
//! The RTL8192C doesn't deliver firmware events in-band. Instead the firmware places them in a
//! small register window and sets a status byte, which the host has to poll. The poll interval
//! adapts to the traffic: while TX reports are expected we poll every 10 ms, once nothing was
//! expected for a while we fall back to once a second.

use embassy_time::Duration;

use crate::{
    ll::{IoResult, RegisterAccess, RegisterExt},
    regs::{C2H_EVT_CLEAR, C2H_EVT_FW_CLOSE, C2H_EVT_HOST_CLOSE, C2H_EVT_MSG},
};

/// Poll interval while events are expected.
pub const C2H_FAST_INTERVAL: Duration = Duration::from_millis(10);
/// Poll interval once idle.
pub const C2H_SLOW_INTERVAL: Duration = Duration::from_secs(1);
/// Number of empty polls, after which we consider the channel idle.
const C2H_IDLE_THRESHOLD: u8 = 20;
/// Size of the event buffer.
pub const C2H_MSG_MAX_LEN: usize = 16;
/// The payload starts after the ID/length byte and the sequence number.
const C2H_PAYLOAD_OFFSET: u16 = C2H_EVT_MSG + 2;

/// Event ID of a TX report on the RTL8192C.
pub(crate) const R92C_C2H_TX_REPORT: u8 = 0x00;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// State of the poll task.
pub enum C2hState {
    /// Nothing was expected for a while, we poll slowly.
    Idle,
    /// Events were expected during the last interval.
    Pending,
    /// No events were expected for `n` polls.
    Backoff(u8),
}
impl Default for C2hState {
    fn default() -> Self {
        Self::Backoff(0)
    }
}

#[derive(Debug, Default)]
/// Drives the adaptive poll interval.
pub struct C2hPoller {
    state: C2hState,
}
impl C2hPoller {
    pub const fn state(&self) -> C2hState {
        self.state
    }
    /// Advance the state machine after a poll and return the time until the next one.
    ///
    /// `pending` tells whether events were expected since the last poll.
    pub fn advance(&mut self, pending: bool) -> Duration {
        self.state = if pending {
            C2hState::Pending
        } else {
            match self.state {
                C2hState::Pending => C2hState::Backoff(1),
                C2hState::Backoff(n) if n >= C2H_IDLE_THRESHOLD => C2hState::Idle,
                C2hState::Backoff(n) => C2hState::Backoff(n + 1),
                C2hState::Idle => C2hState::Idle,
            }
        };
        match self.state {
            C2hState::Idle => C2H_SLOW_INTERVAL,
            _ => C2H_FAST_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// An event read from the C2H window.
pub struct C2hEvent {
    pub id: u8,
    len: usize,
    buf: [u8; C2H_MSG_MAX_LEN],
}
impl C2hEvent {
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Read a pending event from the C2H window and acknowledge it.
///
/// Returns [None] if the firmware hasn't posted anything.
pub(crate) fn read_event<B: RegisterAccess>(bus: &mut B) -> IoResult<Option<C2hEvent>> {
    let status = bus.read_1(C2H_EVT_CLEAR);
    if status == C2H_EVT_HOST_CLOSE {
        return Ok(None);
    }
    let event = if status == C2H_EVT_FW_CLOSE {
        let header = bus.read_1(C2H_EVT_MSG);
        let id = header & 0x0f;
        let len = (header >> 4) as usize;
        let mut buf = [0u8; C2H_MSG_MAX_LEN];
        for offset in (0..len).step_by(4) {
            buf[offset..offset + 4]
                .copy_from_slice(&bus.read_4(C2H_PAYLOAD_OFFSET + offset as u16).to_le_bytes());
        }
        trace!("C2H event {} with {} bytes.", id, len);
        Some(C2hEvent { id, len, buf })
    } else {
        None
    };
    // Hand the window back to the firmware.
    bus.write_1(C2H_EVT_CLEAR, C2H_EVT_HOST_CLOSE)?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;

    #[test]
    fn interval_backs_off_when_nothing_is_pending() {
        let mut poller = C2hPoller::default();
        assert_eq!(poller.advance(true), C2H_FAST_INTERVAL);
        assert_eq!(poller.state(), C2hState::Pending);
        for n in 1..=20 {
            assert_eq!(poller.advance(false), C2H_FAST_INTERVAL);
            assert_eq!(poller.state(), C2hState::Backoff(n));
        }
        assert_eq!(poller.advance(false), C2H_SLOW_INTERVAL);
        assert_eq!(poller.state(), C2hState::Idle);
        assert_eq!(poller.advance(false), C2H_SLOW_INTERVAL);
        // A pending report brings us right back.
        assert_eq!(poller.advance(true), C2H_FAST_INTERVAL);
    }
    #[test]
    fn empty_window_is_left_alone() {
        let mut bus = MockBus::new();
        assert_eq!(read_event(&mut bus), Ok(None));
        assert!(bus.writes().is_empty());
    }
    #[test]
    fn event_is_read_and_acknowledged() {
        let mut bus = MockBus::new();
        bus.preset_1(C2H_EVT_CLEAR, C2H_EVT_FW_CLOSE);
        bus.preset_1(C2H_EVT_MSG, 0x80 | R92C_C2H_TX_REPORT);
        bus.preset_4(C2H_PAYLOAD_OFFSET, 0x0403_0201);
        bus.preset_4(C2H_PAYLOAD_OFFSET + 4, 0x0807_0605);

        let event = read_event(&mut bus).unwrap().unwrap();
        assert_eq!(event.id, R92C_C2H_TX_REPORT);
        assert_eq!(event.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bus.read_1(C2H_EVT_CLEAR), C2H_EVT_HOST_CLOSE);
    }
    #[test]
    fn unknown_status_is_acknowledged_without_event() {
        let mut bus = MockBus::new();
        bus.preset_1(C2H_EVT_CLEAR, 0x42);
        assert_eq!(read_event(&mut bus), Ok(None));
        assert_eq!(bus.writes_to(C2H_EVT_CLEAR), vec![0]);
    }
}
