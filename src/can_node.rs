//! CAN node transport
//!
//! [`CanBus`] exchanges raw frames with an `embedded-hal` CAN controller. [`CanNode`] holds the
//! field block of one node on that bus behind its own lock, decodes the frames addressed to it
//! and tracks how long ago the last one arrived.

use core::cell::RefCell;
use core::ops::Deref;
use core::time::Duration;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::can::{self, Frame, Id, StandardId};
use log::{debug, error, trace, warn};

use crate::Error;

/// Monotonic time source
pub trait Clock {
    /// Microseconds since an arbitrary fixed point. Must never go backwards.
    fn now_us(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }
}

/// Fields of a node, decoded from the frames addressed to it
pub trait NodeFields {
    /// Identifier offsets (from the node's base identifier) of the frames decoded by this node
    const RX_OFFSETS: &'static [u16];

    /// Decodes the payload of the frame received at `base_id + offset`.
    ///
    /// Must validate the payload before modifying anything, a rejected frame leaves the fields
    /// untouched.
    fn decode(&mut self, offset: u16, data: &[u8]) -> Result<(), Error>;
}

/// Identifier scheme and staleness bound of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanNodeConfig {
    /// Root address the node's message identifiers are offset from
    pub base_id: u16,
    /// Maximum age of received data before it is considered stale
    pub timeout_period: Duration,
}

impl Default for CanNodeConfig {
    fn default() -> Self {
        CanNodeConfig {
            base_id: 0,
            timeout_period: Duration::from_millis(100),
        }
    }
}

struct Block<T> {
    fields: T,
    last_rx_us: Option<u64>,
}

/// One node on a CAN bus
///
/// The fields are only reachable from inside [`lock`](CanNode::lock) and
/// [`update`](CanNode::update), so several fields read in one closure always come from the same
/// reception. Closures must not call back into the same node.
pub struct CanNode<M: RawMutex, K, T> {
    base_id: u16,
    timeout_us: u64,
    clock: K,
    block: Mutex<M, RefCell<Block<T>>>,
}

/// Read access to a node's fields, valid for the duration of one lock
pub struct NodeView<'a, T> {
    fields: &'a T,
    data_valid: bool,
}

impl<'a, T> NodeView<'a, T> {
    /// True if a frame was received within the node's timeout period. The fields are undefined
    /// otherwise.
    pub fn is_data_valid(&self) -> bool {
        self.data_valid
    }

    /// The node's last received fields
    pub fn fields(&self) -> &'a T {
        self.fields
    }
}

impl<T> Deref for NodeView<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.fields
    }
}

impl<M: RawMutex, K: Clock, T: NodeFields> CanNode<M, K, T> {
    /// Creates a node that has not received anything yet.
    ///
    /// Fails with [`Error::ConfigError`] if one of the node's identifiers does not fit in a
    /// standard identifier.
    pub fn new(config: CanNodeConfig, clock: K, fields: T) -> Result<Self, Error> {
        if let Some(offset) = T::RX_OFFSETS
            .iter()
            .find(|offset| node_id(config.base_id, **offset).is_none())
        {
            error!(
                "node {:#x}: offset {:#05x} is outside the standard identifier range",
                config.base_id, offset
            );
            return Err(Error::ConfigError);
        }

        Ok(CanNode {
            base_id: config.base_id,
            timeout_us: config.timeout_period.as_micros() as u64,
            clock,
            block: Mutex::new(RefCell::new(Block {
                fields,
                last_rx_us: None,
            })),
        })
    }

    /// Root address of the node's message identifiers
    pub fn base_id(&self) -> u16 {
        self.base_id
    }

    /// Maximum age of received data before it is considered stale
    pub fn timeout_period(&self) -> Duration {
        Duration::from_micros(self.timeout_us)
    }

    /// Runs `f` with the node locked. Staleness is resolved once, when the lock is taken.
    pub fn lock<R>(&self, f: impl FnOnce(&NodeView<'_, T>) -> R) -> R {
        self.block.lock(|cell| {
            let block = cell.borrow();
            let view = NodeView {
                fields: &block.fields,
                data_valid: self.is_fresh(block.last_rx_us),
            };
            f(&view)
        })
    }

    /// Runs `f` on the locked fields and records a valid reception at the current time
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.block.lock(|cell| {
            let mut block = cell.borrow_mut();
            let result = f(&mut block.fields);
            block.last_rx_us = Some(self.clock.now_us());
            result
        })
    }

    /// True if a frame was received within the node's timeout period
    pub fn is_data_valid(&self) -> bool {
        self.lock(|view| view.is_data_valid())
    }

    /// Decodes `frame` into the node if it is addressed to it.
    ///
    /// Returns `Ok(false)` for frames belonging to other nodes. A malformed frame is rejected with
    /// [`Error::ParseError`] and does not refresh the node's staleness timer.
    pub fn receive<F: Frame>(&self, frame: &F) -> Result<bool, Error> {
        if frame.is_remote_frame() {
            return Ok(false);
        }

        let offset = match self.offset_of(frame.id()) {
            Some(offset) => offset,
            None => return Ok(false),
        };

        self.block.lock(|cell| -> Result<(), Error> {
            let mut block = cell.borrow_mut();
            block.fields.decode(offset, frame.data())?;
            block.last_rx_us = Some(self.clock.now_us());
            Ok(())
        })?;

        trace!("node {:#05x}: decoded frame at offset {:#05x}", self.base_id, offset);
        Ok(true)
    }

    fn offset_of(&self, id: Id) -> Option<u16> {
        let id = match id {
            Id::Standard(id) => id,
            Id::Extended(_) => return None,
        };

        T::RX_OFFSETS
            .iter()
            .copied()
            .find(|offset| node_id(self.base_id, *offset) == Some(id))
    }

    fn is_fresh(&self, last_rx_us: Option<u64>) -> bool {
        match last_rx_us {
            Some(at) => self.clock.now_us().saturating_sub(at) <= self.timeout_us,
            None => false,
        }
    }
}

/// Identifier of the frame `offset` away from `base_id`, if it is a valid standard identifier
pub fn node_id(base_id: u16, offset: u16) -> Option<StandardId> {
    base_id.checked_add(offset).and_then(StandardId::new)
}

/// CAN controller shared by the nodes on one bus
pub struct CanBus<C, K> {
    can: C,
    clock: K,
}

impl<C: can::nb::Can, K: Clock> CanBus<C, K> {
    /// Wraps a CAN controller, currently using the embedded-hal non-blocking `Can` trait
    pub fn new(can: C, clock: K) -> Self {
        CanBus { can, clock }
    }

    /// Releases the controller and clock
    pub fn free(self) -> (C, K) {
        (self.can, self.clock)
    }

    /// Places a standard-identifier frame in the controller's transmit mailbox.
    ///
    /// Polls the controller until the frame is accepted or `timeout` elapses. The controller is
    /// tried at least once, even with a zero timeout. Never retries after a bus error.
    ///
    /// A lower priority frame pushed out of the mailbox to make room is put back within the same
    /// timeout. If it cannot be, the send fails with [`Error::Displaced`] even though this frame
    /// was accepted.
    pub fn send_frame(&mut self, id: u16, payload: &[u8], timeout: Duration) -> Result<(), Error> {
        let id = StandardId::new(id).ok_or(Error::InvalidFrame)?;
        let mut pending = C::Frame::new(id, payload).ok_or(Error::InvalidFrame)?;
        let mut displaced = false;
        let timeout_us = timeout.as_micros() as u64;
        let start = self.clock.now_us();

        loop {
            match self.can.transmit(&pending) {
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => {
                    debug!(
                        "frame {:?} displaced pending frame {:?}, requeueing it",
                        pending.id(),
                        frame.id()
                    );
                    pending = frame;
                    displaced = true;
                }
                Err(nb::Error::WouldBlock) => {
                    if self.clock.now_us().saturating_sub(start) < timeout_us {
                        continue;
                    }
                    if displaced {
                        warn!(
                            "displaced frame {:?} not requeued after {:?}, it is lost",
                            pending.id(),
                            timeout
                        );
                        return Err(Error::Displaced);
                    }
                    warn!("frame {:#05x} timed out after {:?}", id.as_raw(), timeout);
                    return Err(Error::Timeout);
                }
                Err(nb::Error::Other(e)) => {
                    let kind = can::Error::kind(&e);
                    warn!("frame {:?} failed: {:?}", pending.id(), kind);
                    return Err(Error::Bus(kind));
                }
            }
        }
    }

    /// Takes the next frame out of the controller's receive buffer
    pub fn receive(&mut self) -> nb::Result<C::Frame, Error> {
        self.can
            .receive()
            .map_err(|e| e.map(|e| Error::Bus(can::Error::kind(&e))))
    }
}
