//! Microchip 24LC32 I2C EEPROM
//!
//! The whole device is mirrored in a local cache. Reads and writes go through the cache, and its
//! contents are considered valid only while they start with the configured magic string.

use core::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use heapless::Vec;
use log::{error, info, warn};

use crate::Error;

/// Memory size of the device in bytes
pub const SIZE: usize = 4096;

/// Write page size of the device in bytes. A single write cannot cross a page boundary.
pub const PAGE_SIZE: usize = 32;

// Address bytes followed by one page
const WRITE_BUFFER_SIZE: usize = PAGE_SIZE + 2;

/// State of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The device did not respond
    Failed = 0,
    /// The device responded, the cached contents are not valid
    Invalid = 1,
    /// The cached contents are valid
    Ready = 3,
}

/// Configuration of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mc24lc32Config {
    /// 7-bit I2C address of the device
    pub addr: u8,
    /// How long to poll for the device's acknowledgement after a write before giving up
    pub timeout_period: Duration,
    /// String stored at address 0 marking the contents as valid
    pub magic_string: &'static str,
}

impl Default for Mc24lc32Config {
    fn default() -> Self {
        Mc24lc32Config {
            addr: 0x50,
            timeout_period: Duration::from_millis(10),
            magic_string: "MC24LC32",
        }
    }
}

/// Driver for the Microchip 24LC32 I2C EEPROM
pub struct Mc24lc32<I2C, D> {
    i2c: I2C,
    delay: D,
    addr: u8,
    timeout_period: Duration,
    magic_string: &'static [u8],
    state: State,
    cache: [u8; SIZE],
}

impl<I2C, D, E> Mc24lc32<I2C, D>
where
    I2C: Write<Error = E> + WriteRead<Error = E>,
    D: DelayMs<u8>,
    E: core::fmt::Debug,
{
    /// Creates the driver and reads the device's contents into the cache.
    ///
    /// Fails only on an unusable configuration. An unresponsive device is reported through
    /// [`state`](Mc24lc32::state).
    pub fn new(config: Mc24lc32Config, i2c: I2C, delay: D) -> Result<Self, Error> {
        let magic_string = config.magic_string.as_bytes();
        if magic_string.is_empty() || magic_string.len() > SIZE {
            return Err(Error::ConfigError);
        }

        let mut eeprom = Mc24lc32 {
            i2c,
            delay,
            addr: config.addr,
            timeout_period: config.timeout_period,
            magic_string,
            state: State::Failed,
            cache: [0u8; SIZE],
        };

        eeprom.read().ok();
        Ok(eeprom)
    }

    /// Releases the I2C bus and delay
    pub fn free(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    /// State of the device
    pub fn state(&self) -> State {
        self.state
    }

    /// Cached copy of the device's contents
    pub fn cache(&self) -> &[u8; SIZE] {
        &self.cache
    }

    /// Mutable cached copy of the device's contents. Changes are committed on the next
    /// [`write`](Mc24lc32::write).
    pub fn cache_mut(&mut self) -> &mut [u8; SIZE] {
        &mut self.cache
    }

    /// Reads the device's memory into the cache. Returns whether the contents are valid.
    pub fn read(&mut self) -> Result<bool, Error> {
        if let Err(e) = self.i2c.write_read(self.addr, &[0, 0], &mut self.cache) {
            error!("24LC32 {:#04x}: read failed: {:?}", self.addr, e);
            self.state = State::Failed;
            return Err(Error::I2c);
        }

        self.state = if self.cache.starts_with(self.magic_string) {
            State::Ready
        } else {
            State::Invalid
        };

        info!("24LC32 {:#04x}: read, state {:?}", self.addr, self.state);
        Ok(self.state == State::Ready)
    }

    /// Writes the whole cache to the device
    pub fn write(&mut self) -> Result<(), Error> {
        for page in 0..SIZE / PAGE_SIZE {
            self.write_cached((page * PAGE_SIZE) as u16, PAGE_SIZE)?;
        }

        Ok(())
    }

    /// Writes `data` to the device and the cache at `address`. The write cannot cross a page
    /// boundary.
    ///
    /// The cache is only updated once the device has acknowledged the write. After an error the
    /// cache keeps its previous contents, while the device's contents at `address` are unknown.
    pub fn write_through(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        let start = usize::from(address);
        let end = start + data.len();

        if end > SIZE {
            return Err(Error::OutOfRange);
        }
        if data.is_empty() {
            return Ok(());
        }
        if start / PAGE_SIZE != (end - 1) / PAGE_SIZE {
            return Err(Error::PageBoundary);
        }

        self.write_page(address, data)?;
        self.cache[start..end].copy_from_slice(data);
        Ok(())
    }

    /// True if the cached contents are valid
    pub fn is_valid(&self) -> bool {
        self.state == State::Ready
    }

    /// Marks the cached contents as valid. Committed on the next write.
    pub fn validate(&mut self) {
        let len = self.magic_string.len();
        self.cache[..len].copy_from_slice(self.magic_string);
        self.state = State::Ready;
    }

    /// Marks the cached contents as invalid. Committed on the next write.
    pub fn invalidate(&mut self) {
        for (byte, magic) in self.cache.iter_mut().zip(self.magic_string) {
            *byte = !magic;
        }
        self.state = State::Invalid;
    }

    fn write_cached(&mut self, address: u16, len: usize) -> Result<(), Error> {
        let start = usize::from(address);
        let mut page: Vec<u8, PAGE_SIZE> = Vec::new();
        page.extend_from_slice(&self.cache[start..start + len])
            .map_err(|_| Error::PageBoundary)?;

        self.write_page(address, &page)
    }

    fn write_page(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        let mut header = [0u8; 2];
        BigEndian::write_u16(&mut header, address);

        let mut buffer: Vec<u8, WRITE_BUFFER_SIZE> = Vec::new();
        buffer
            .extend_from_slice(&header)
            .and_then(|_| buffer.extend_from_slice(data))
            .map_err(|_| Error::PageBoundary)?;

        if let Err(e) = self.i2c.write(self.addr, &buffer) {
            error!("24LC32 {:#04x}: write at {:#06x} failed: {:?}", self.addr, address, e);
            return Err(Error::I2c);
        }

        self.poll_acknowledgement()
    }

    // The device does not acknowledge its address until the internal write cycle is done
    fn poll_acknowledgement(&mut self) -> Result<(), Error> {
        let timeout_ms = self.timeout_period.as_millis();
        let mut elapsed_ms = 0;

        loop {
            if self.i2c.write(self.addr, &[0, 0]).is_ok() {
                return Ok(());
            }
            if elapsed_ms >= timeout_ms {
                warn!(
                    "24LC32 {:#04x}: no acknowledgement after {:?}",
                    self.addr, self.timeout_period
                );
                return Err(Error::Timeout);
            }

            self.delay.delay_ms(1);
            elapsed_ms += 1;
        }
    }
}
