//! AMK inverter fleet communication library
//!
//! Tracks the liveness and readiness of AMK racing-kit inverters sharing a CAN bus, commands their
//! energization and torque, and rolls the status of a whole fleet up into one decision.
//!
//! Telemetry flows `CanBus::receive` -> `AmkInverter::receive` (or `fleet::dispatch`) -> the
//! node's locked field block. Commands go from an `AmkInverter` to the `CanBus`, taking the node
//! lock only to read the motor's nominal torque.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

use embedded_hal::can::ErrorKind;
use failure::Fail;

pub mod amk;
pub mod can_node;
pub mod eeprom;
pub mod fleet;

pub use amk::{AmkData, AmkInverter, AmkInverterConfig, InverterState};
pub use can_node::{node_id, CanBus, CanNode, CanNodeConfig, Clock, NodeView};

/// Errors returned if an operation fails
#[derive(Fail, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation did not complete within its timeout
    #[fail(display = "Operation timed out")]
    Timeout,
    /// The CAN controller reported an error
    #[fail(display = "CAN bus error: {:?}", _0)]
    Bus(ErrorKind),
    /// A pending frame pushed out of the transmit mailbox could not be put back in time
    #[fail(display = "Displaced CAN frame was not requeued")]
    Displaced,
    /// Identifier or payload cannot be put in a CAN frame
    #[fail(display = "Invalid CAN frame")]
    InvalidFrame,
    /// Error occured during parsing
    #[fail(display = "Error occured during parsing")]
    ParseError,
    /// Error occured on the I2C bus
    #[fail(display = "Error occured on the I2C bus")]
    I2c,
    /// Write would cross an EEPROM page boundary
    #[fail(display = "Write crosses a page boundary")]
    PageBoundary,
    /// Address is outside of the device's memory
    #[fail(display = "Address out of range")]
    OutOfRange,
    /// Configuration cannot be used
    #[fail(display = "Invalid configuration")]
    ConfigError,
}
