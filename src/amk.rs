//! AMK racing-kit inverter node

use core::cmp::Ordering;
use core::f32::consts::PI;
use core::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::can::{self, Frame};
use log::{debug, error};

use crate::can_node::{node_id, CanBus, CanNode, CanNodeConfig, Clock, NodeFields, NodeView};
use crate::Error;

/// Identifier offset of the setpoints frame sent to the inverter
pub const SETPOINTS_1_OFFSET: u16 = 0x183;
/// Identifier offset of the status, speed and current frame
pub const ACTUAL_VALUES_1_OFFSET: u16 = 0x282;
/// Identifier offset of the torque and DC bus frame
pub const ACTUAL_VALUES_2_OFFSET: u16 = 0x284;

const FRAME_LEN: usize = 8;

// Status word
const STATUS_SYSTEM_READY: u16 = 1 << 8;
const STATUS_ERROR: u16 = 1 << 9;
const STATUS_WARNING: u16 = 1 << 10;
const STATUS_QUIT_DC_ON: u16 = 1 << 11;
const STATUS_DC_ON: u16 = 1 << 12;
const STATUS_QUIT_INVERTER_ON: u16 = 1 << 13;
const STATUS_INVERTER_ON: u16 = 1 << 14;
const STATUS_DERATING: u16 = 1 << 15;

// Control word
const CONTROL_INVERTER_ON: u16 = 1 << 8;
const CONTROL_DC_ON: u16 = 1 << 9;
const CONTROL_ENABLE: u16 = 1 << 10;
const CONTROL_ERROR_RESET: u16 = 1 << 11;

const CONTROL_ENERGIZE: u16 = CONTROL_INVERTER_ON | CONTROL_DC_ON | CONTROL_ENABLE;

/// Raw current to amperes
const CURRENT_SCALE: f32 = 107.2 / 16384.0;

/// rpm to rad/s
const RPM_TO_RAD_PER_S: f32 = PI / 30.0;

/// Generalized state of an inverter, ordered by how ready the inverter is
///
/// Ordering goes through [`rank`](InverterState::rank), the gaps between ranks are reserved for
/// states that may be added later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InverterState {
    /// The node's data is stale, or reports no usable combination of flags
    Invalid,
    /// The inverter is reporting an error
    Error,
    /// Ready and error-free, but high voltage is not present
    ReadyLowVoltage,
    /// Ready and error-free, the DC bus is charged
    ReadyHighVoltage,
    /// Ready and error-free, the motor is energized
    ReadyEnergized,
}

impl InverterState {
    /// Relative priority of the state, lower is less ready
    pub const fn rank(self) -> u8 {
        match self {
            InverterState::Invalid => 0,
            InverterState::Error => 1,
            InverterState::ReadyLowVoltage => 5,
            InverterState::ReadyHighVoltage => 6,
            InverterState::ReadyEnergized => 7,
        }
    }
}

impl Ord for InverterState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for InverterState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Last values reported by an inverter
#[derive(Debug, Clone, PartialEq)]
pub struct AmkData {
    /// Inverter is ready and error-free
    pub system_ready: bool,
    /// A system error is present
    pub error: bool,
    /// A system warning is present
    pub warning: bool,
    /// Acknowledgement of the DC bus being enabled and energized. Not asserted until `dc_on` is set
    /// and the DC bus voltage exceeds the minimum.
    pub quit_dc_on: bool,
    /// DC bus is enabled, see `quit_dc_on` for whether it is energized
    pub dc_on: bool,
    /// Acknowledgement of the inverter being enabled and energized. Not asserted until the DC bus
    /// is energized, `inverter_on` is set and the system is error-free.
    pub quit_inverter: bool,
    /// Inverter controller is enabled, see `quit_inverter` for whether it is energized
    pub inverter_on: bool,
    /// Output torque is being de-rated due to hardware conditions
    pub derating: bool,
    /// Torque at the motor shaft in Nm, may differ from the request due to de-rating
    pub actual_torque: f32,
    /// Motor shaft speed in rpm
    pub actual_speed: f32,
    /// Measured DC bus voltage in V
    pub dc_bus_voltage: f32,
    /// Torque producing current (Iq) in A
    pub torque_current: f32,
    /// Magnetizing current (Id) in A
    pub magnetizing_current: f32,
    /// Mechanical power at the motor shaft in W
    pub actual_power: f32,
    /// AMK diagnostic number of the active error, 0 when there is none
    pub diagnostic_number: u16,
    nominal_torque: f32,
}

impl AmkData {
    /// Empty field block for a motor with the given nominal torque (Nm)
    pub const fn new(nominal_torque: f32) -> Self {
        AmkData {
            system_ready: false,
            error: false,
            warning: false,
            quit_dc_on: false,
            dc_on: false,
            quit_inverter: false,
            inverter_on: false,
            derating: false,
            actual_torque: 0.0,
            actual_speed: 0.0,
            dc_bus_voltage: 0.0,
            torque_current: 0.0,
            magnetizing_current: 0.0,
            actual_power: 0.0,
            diagnostic_number: 0,
            nominal_torque,
        }
    }

    /// Nominal torque of the motor in Nm, the unit of all torque values on the bus is 0.1% of it
    pub fn nominal_torque(&self) -> f32 {
        self.nominal_torque
    }

    /// Derives the inverter's state from these fields. The first matching condition wins.
    pub fn state(&self, data_valid: bool) -> InverterState {
        if !data_valid {
            InverterState::Invalid
        } else if self.error {
            InverterState::Error
        } else if self.quit_inverter && self.inverter_on {
            InverterState::ReadyEnergized
        } else if self.quit_dc_on && self.dc_on {
            InverterState::ReadyHighVoltage
        } else if self.system_ready {
            InverterState::ReadyLowVoltage
        } else {
            InverterState::Invalid
        }
    }

    fn decode_actual_values_1(&mut self, data: &[u8]) {
        let status = LittleEndian::read_u16(&data[0..2]);

        self.system_ready = status & STATUS_SYSTEM_READY != 0;
        self.error = status & STATUS_ERROR != 0;
        self.warning = status & STATUS_WARNING != 0;
        self.quit_dc_on = status & STATUS_QUIT_DC_ON != 0;
        self.dc_on = status & STATUS_DC_ON != 0;
        self.quit_inverter = status & STATUS_QUIT_INVERTER_ON != 0;
        self.inverter_on = status & STATUS_INVERTER_ON != 0;
        self.derating = status & STATUS_DERATING != 0;

        self.actual_speed = f32::from(LittleEndian::read_i16(&data[2..4]));
        self.torque_current = f32::from(LittleEndian::read_i16(&data[4..6])) * CURRENT_SCALE;
        self.magnetizing_current = f32::from(LittleEndian::read_i16(&data[6..8])) * CURRENT_SCALE;
    }

    fn decode_actual_values_2(&mut self, data: &[u8]) {
        self.actual_torque =
            f32::from(LittleEndian::read_i16(&data[0..2])) * self.nominal_torque / 1_000.0;
        self.dc_bus_voltage = f32::from(LittleEndian::read_u16(&data[2..4]));
        self.diagnostic_number = LittleEndian::read_u16(&data[4..6]);
    }
}

impl NodeFields for AmkData {
    const RX_OFFSETS: &'static [u16] = &[ACTUAL_VALUES_1_OFFSET, ACTUAL_VALUES_2_OFFSET];

    fn decode(&mut self, offset: u16, data: &[u8]) -> Result<(), Error> {
        if data.len() != FRAME_LEN {
            return Err(Error::ParseError);
        }

        match offset {
            ACTUAL_VALUES_1_OFFSET => self.decode_actual_values_1(data),
            ACTUAL_VALUES_2_OFFSET => self.decode_actual_values_2(data),
            _ => return Err(Error::ParseError),
        }

        self.actual_power = self.actual_torque * self.actual_speed * RPM_TO_RAD_PER_S;
        Ok(())
    }
}

impl NodeView<'_, AmkData> {
    /// State of the inverter as of this lock
    pub fn state(&self) -> InverterState {
        self.fields().state(self.is_data_valid())
    }
}

/// Configuration of one inverter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmkInverterConfig {
    /// Node offset the inverter's message identifiers are derived from
    pub base_id: u16,
    /// Maximum age of telemetry before it is considered stale
    pub timeout_period: Duration,
    /// Nominal torque of the motor in Nm, the unit of all torque values on the bus is 0.1% of it
    pub nominal_torque: f32,
}

impl Default for AmkInverterConfig {
    fn default() -> Self {
        AmkInverterConfig {
            base_id: 1,
            timeout_period: Duration::from_millis(100),
            // AMK DD5-14-10-POW
            nominal_torque: 9.8,
        }
    }
}

/// An AMK inverter on a shared CAN bus
pub struct AmkInverter<M: RawMutex, K> {
    node: CanNode<M, K, AmkData>,
}

impl<M: RawMutex, K: Clock> AmkInverter<M, K> {
    /// Creates an inverter that has not reported anything yet.
    ///
    /// Fails with [`Error::ConfigError`] if `base_id` puts one of the inverter's messages outside
    /// the standard identifier range.
    pub fn new(config: AmkInverterConfig, clock: K) -> Result<Self, Error> {
        if node_id(config.base_id, SETPOINTS_1_OFFSET).is_none() {
            error!("inverter {:#x}: setpoints identifier out of range", config.base_id);
            return Err(Error::ConfigError);
        }

        let node = CanNode::new(
            CanNodeConfig {
                base_id: config.base_id,
                timeout_period: config.timeout_period,
            },
            clock,
            AmkData::new(config.nominal_torque),
        )?;

        Ok(AmkInverter { node })
    }

    /// The underlying CAN node
    pub fn node(&self) -> &CanNode<M, K, AmkData> {
        &self.node
    }

    /// Runs `f` with the inverter locked, see [`CanNode::lock`]
    pub fn lock<R>(&self, f: impl FnOnce(&NodeView<'_, AmkData>) -> R) -> R {
        self.node.lock(f)
    }

    /// Locks the inverter just long enough to derive its current state
    pub fn state(&self) -> InverterState {
        self.node.lock(|amk| amk.state())
    }

    /// Decodes `frame` if it is addressed to this inverter, see [`CanNode::receive`]
    pub fn receive<F: Frame>(&self, frame: &F) -> Result<bool, Error> {
        self.node.receive(frame)
    }

    /// Requests the inverter to be energized or de-energized.
    ///
    /// Only reports whether the request made it onto the bus, completion is seen later through
    /// `quit_dc_on` and `quit_inverter`.
    pub fn send_energization_request<C: can::nb::Can, B: Clock>(
        &self,
        bus: &mut CanBus<C, B>,
        energized: bool,
        timeout: Duration,
    ) -> Result<(), Error> {
        let control = if energized { CONTROL_ENERGIZE } else { 0 };

        debug!("inverter {:#05x}: energization request {}", self.node.base_id(), energized);
        self.send_setpoints(bus, setpoints_payload(control, 0, 0, 0), timeout)
    }

    /// Requests an amount of torque (Nm), bounded by the given limits (Nm). Also requests the
    /// inverter to be energized if it is not already.
    pub fn send_torque_request<C: can::nb::Can, B: Clock>(
        &self,
        bus: &mut CanBus<C, B>,
        torque_request: f32,
        torque_limit_positive: f32,
        torque_limit_negative: f32,
        timeout: Duration,
    ) -> Result<(), Error> {
        let nominal_torque = self.node.lock(|amk| amk.nominal_torque());
        let payload = setpoints_payload(
            CONTROL_ENERGIZE,
            torque_to_raw(torque_request, nominal_torque),
            torque_to_raw(torque_limit_positive, nominal_torque),
            torque_to_raw(torque_limit_negative, nominal_torque),
        );

        debug!(
            "inverter {:#05x}: torque request {} Nm ({} / {})",
            self.node.base_id(),
            torque_request,
            torque_limit_positive,
            torque_limit_negative
        );
        self.send_setpoints(bus, payload, timeout)
    }

    /// Requests all latched errors to be cleared. Has no lasting effect while the fault persists.
    pub fn send_error_reset_request<C: can::nb::Can, B: Clock>(
        &self,
        bus: &mut CanBus<C, B>,
        timeout: Duration,
    ) -> Result<(), Error> {
        debug!("inverter {:#05x}: error reset request", self.node.base_id());
        self.send_setpoints(bus, setpoints_payload(CONTROL_ERROR_RESET, 0, 0, 0), timeout)
    }

    fn send_setpoints<C: can::nb::Can, B: Clock>(
        &self,
        bus: &mut CanBus<C, B>,
        payload: [u8; FRAME_LEN],
        timeout: Duration,
    ) -> Result<(), Error> {
        let id = node_id(self.node.base_id(), SETPOINTS_1_OFFSET).ok_or(Error::InvalidFrame)?;
        bus.send_frame(id.as_raw(), &payload, timeout)
    }
}

// Saturates at the limits of i16, NaN becomes 0
fn torque_to_raw(torque: f32, nominal_torque: f32) -> i16 {
    (torque / nominal_torque * 1_000.0) as i16
}

fn setpoints_payload(
    control: u16,
    torque: i16,
    limit_positive: i16,
    limit_negative: i16,
) -> [u8; FRAME_LEN] {
    let mut payload = [0u8; FRAME_LEN];

    LittleEndian::write_u16(&mut payload[0..2], control);
    LittleEndian::write_i16(&mut payload[2..4], torque);
    LittleEndian::write_i16(&mut payload[4..6], limit_positive);
    LittleEndian::write_i16(&mut payload[6..8], limit_negative);

    payload
}
