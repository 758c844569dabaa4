//! Operations over a group of inverters
//!
//! No lock spans the whole fleet. Each inverter is locked on its own while it is visited, so the
//! results are a rolling snapshot: every member is as recent as the moment it was read. Callers
//! needing a fresher decision repeat the call.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::can::Frame;
use log::warn;

use crate::amk::{AmkInverter, InverterState};
use crate::can_node::Clock;
use crate::Error;

/// Gets the global state of a group of inverters, that is the least ready state among them.
///
/// An empty fleet has no meaningful state and is reported as [`InverterState::Invalid`].
pub fn group_state<M: RawMutex, K: Clock>(fleet: &[AmkInverter<M, K>]) -> InverterState {
    fleet.iter().map(AmkInverter::state).min().unwrap_or_else(|| {
        warn!("group state of an empty fleet requested");
        InverterState::Invalid
    })
}

/// Gets the total power of a group of inverters, in W. Inverters with stale data count as 0.
pub fn cumulative_power<M: RawMutex, K: Clock>(fleet: &[AmkInverter<M, K>]) -> f32 {
    fleet
        .iter()
        .map(|amk| {
            amk.lock(|amk| {
                if amk.is_data_valid() {
                    amk.actual_power
                } else {
                    0.0
                }
            })
        })
        .sum()
}

/// Hands `frame` to the inverter it is addressed to.
///
/// Returns `Ok(false)` if no member of the fleet claims the frame.
pub fn dispatch<M: RawMutex, K: Clock, F: Frame>(
    fleet: &[AmkInverter<M, K>],
    frame: &F,
) -> Result<bool, Error> {
    for amk in fleet {
        if amk.receive(frame)? {
            return Ok(true);
        }
    }

    Ok(false)
}
