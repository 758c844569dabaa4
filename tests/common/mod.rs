//! Mock CAN controller, frame and clock shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use amk_inverter::amk::{ACTUAL_VALUES_1_OFFSET, ACTUAL_VALUES_2_OFFSET};
use amk_inverter::{AmkInverter, AmkInverterConfig, Clock};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_hal::can::{self, ErrorKind, Frame, Id, StandardId};

pub type Inverter<'a> = AmkInverter<CriticalSectionRawMutex, &'a MockClock>;

pub const TIMEOUT: Duration = Duration::from_millis(100);

// ── Status word bits ──────────────────────────────────────────

pub const SYSTEM_READY: u16 = 1 << 8;
pub const ERROR: u16 = 1 << 9;
pub const QUIT_DC_ON: u16 = 1 << 11;
pub const DC_ON: u16 = 1 << 12;
pub const QUIT_INVERTER_ON: u16 = 1 << 13;
pub const INVERTER_ON: u16 = 1 << 14;

pub const LOW_VOLTAGE: u16 = SYSTEM_READY;
pub const HIGH_VOLTAGE: u16 = SYSTEM_READY | DC_ON | QUIT_DC_ON;
pub const ENERGIZED: u16 = HIGH_VOLTAGE | INVERTER_ON | QUIT_INVERTER_ON;

// ── MockClock ─────────────────────────────────────────────────

/// Manually driven clock. Every read advances it by `step`, so polling loops make progress.
#[derive(Default)]
pub struct MockClock {
    now_us: AtomicU64,
    step_us: AtomicU64,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now_us.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set_step(&self, step: Duration) {
        self.step_us.store(step.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        let step = self.step_us.load(Ordering::SeqCst);
        self.now_us.fetch_add(step, Ordering::SeqCst)
    }
}

// ── MockFrame ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MockFrame {
    id: Id,
    data: Vec<u8>,
    remote: bool,
}

impl MockFrame {
    pub fn standard(id: u16, data: &[u8]) -> Self {
        Self::new(StandardId::new(id).unwrap(), data).unwrap()
    }

    pub fn raw_id(&self) -> u16 {
        match self.id {
            Id::Standard(id) => id.as_raw(),
            Id::Extended(_) => panic!("extended identifier"),
        }
    }
}

impl Frame for MockFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }

        Some(MockFrame {
            id: id.into(),
            data: data.to_vec(),
            remote: false,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }

        Some(MockFrame {
            id: id.into(),
            data: vec![0; dlc],
            remote: true,
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.data.len()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

pub fn actual_values_1(base_id: u16, status: u16, speed: i16) -> MockFrame {
    let mut data = [0u8; 8];
    data[0..2].copy_from_slice(&status.to_le_bytes());
    data[2..4].copy_from_slice(&speed.to_le_bytes());
    MockFrame::standard(base_id + ACTUAL_VALUES_1_OFFSET, &data)
}

pub fn actual_values_2(base_id: u16, torque: i16, dc_bus_voltage: u16) -> MockFrame {
    let mut data = [0u8; 8];
    data[0..2].copy_from_slice(&torque.to_le_bytes());
    data[2..4].copy_from_slice(&dc_bus_voltage.to_le_bytes());
    MockFrame::standard(base_id + ACTUAL_VALUES_2_OFFSET, &data)
}

// ── MockCan ───────────────────────────────────────────────────

#[derive(Debug)]
pub struct MockCanError(pub ErrorKind);

impl can::Error for MockCanError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

/// Records every transmitted frame. `busy` keeps the mailbox full, `fault` fails every transmit.
///
/// With `mailboxes` set, accepted frames wait in `pending` instead of going straight to `sent`.
/// A full controller displaces its lowest priority pending frame for a higher priority one, and
/// with `drain_on_block` it puts its highest priority pending frame on the bus whenever a
/// transmit has to wait.
#[derive(Default)]
pub struct MockCan {
    pub sent: Vec<MockFrame>,
    pub inbox: VecDeque<MockFrame>,
    pub busy: bool,
    pub fault: Option<ErrorKind>,
    pub attempts: usize,
    pub mailboxes: Option<usize>,
    pub pending: Vec<MockFrame>,
    pub drain_on_block: bool,
}

impl MockCan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sent(&self) -> Option<&MockFrame> {
        self.sent.last()
    }

    pub fn with_mailboxes(mailboxes: usize) -> Self {
        MockCan {
            mailboxes: Some(mailboxes),
            ..Self::default()
        }
    }

    fn queue(
        &mut self,
        frame: &MockFrame,
        capacity: usize,
    ) -> nb::Result<Option<MockFrame>, MockCanError> {
        if self.pending.len() < capacity {
            self.pending.push(frame.clone());
            return Ok(None);
        }

        if let Some(lowest) = (0..self.pending.len()).max_by_key(|&i| self.pending[i].raw_id()) {
            if frame.raw_id() < self.pending[lowest].raw_id() {
                let displaced = std::mem::replace(&mut self.pending[lowest], frame.clone());
                return Ok(Some(displaced));
            }
        }

        if self.drain_on_block {
            if let Some(highest) = (0..self.pending.len()).min_by_key(|&i| self.pending[i].raw_id())
            {
                let frame = self.pending.remove(highest);
                self.sent.push(frame);
            }
        }

        Err(nb::Error::WouldBlock)
    }
}

impl can::nb::Can for MockCan {
    type Frame = MockFrame;
    type Error = MockCanError;

    fn transmit(&mut self, frame: &MockFrame) -> nb::Result<Option<MockFrame>, MockCanError> {
        self.attempts += 1;

        if let Some(kind) = self.fault {
            return Err(nb::Error::Other(MockCanError(kind)));
        }
        if self.busy {
            return Err(nb::Error::WouldBlock);
        }
        if let Some(capacity) = self.mailboxes {
            return self.queue(frame, capacity);
        }

        self.sent.push(frame.clone());
        Ok(None)
    }

    fn receive(&mut self) -> nb::Result<MockFrame, MockCanError> {
        self.inbox.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

pub fn config(base_id: u16) -> AmkInverterConfig {
    AmkInverterConfig {
        base_id,
        timeout_period: TIMEOUT,
        nominal_torque: 10.0,
    }
}

pub fn inverter(base_id: u16, clock: &MockClock) -> Inverter<'_> {
    AmkInverter::new(config(base_id), clock).unwrap()
}
