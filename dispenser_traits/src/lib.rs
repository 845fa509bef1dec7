pub mod clock;
pub mod events;
pub mod latch;

pub use clock::{Clock, MonotonicClock};
pub use events::{EdgeEvent, EdgeReceiver, EdgeSender, EdgeSource, edge_queue};
pub use latch::DropLatch;

/// Four-coil stepper driven through an 8-phase half-step table.
/// One call advances exactly one phase in the given direction (+1 / -1)
/// and blocks for the implementation's inter-step delay.
pub trait Stepper {
    fn step(&mut self, direction: i8) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// De-energize all coils.
    fn release(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Optical fork sensor. Active-low input: reads open when a wheel
/// opening is aligned with the fork.
pub trait OptoFork {
    fn is_open(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;
}

/// Pill-drop detect latch, set from interrupt context and consumed by the
/// cooperative loop. Both operations are infallible single-word accesses.
pub trait DropSensor {
    /// Return whether a drop has been latched since the last `clear`.
    fn detected(&mut self) -> bool;

    /// Reset the latch ahead of a dispense attempt.
    fn clear(&mut self);
}

/// Byte-addressable non-volatile storage (EEPROM-class device).
///
/// Writes are assumed to succeed at the bus level; the implementation owns
/// the mandatory post-write settle delay. Corruption is only detectable on
/// the next read via the store's CRC checks.
pub trait Nvs {
    fn write(
        &mut self,
        addr: u16,
        bytes: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    fn read(
        &mut self,
        addr: u16,
        buf: &mut [u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Line-oriented serial channel to the radio module (AT command link).
pub trait SerialLink {
    fn write_all(&mut self, bytes: &[u8])
    -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Non-blocking single-byte read; `None` when no byte is buffered.
    fn read_byte(&mut self) -> Result<Option<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

// Forwarding impls so boxed devices satisfy the same bounds.

impl<T: Stepper + ?Sized> Stepper for Box<T> {
    fn step(&mut self, direction: i8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).step(direction)
    }
    fn release(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).release()
    }
}

impl<T: OptoFork + ?Sized> OptoFork for Box<T> {
    fn is_open(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        (**self).is_open()
    }
}

impl<T: DropSensor + ?Sized> DropSensor for Box<T> {
    fn detected(&mut self) -> bool {
        (**self).detected()
    }
    fn clear(&mut self) {
        (**self).clear()
    }
}

impl<T: Nvs + ?Sized> Nvs for Box<T> {
    fn write(
        &mut self,
        addr: u16,
        bytes: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).write(addr, bytes)
    }
    fn read(
        &mut self,
        addr: u16,
        buf: &mut [u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).read(addr, buf)
    }
}

impl<T: SerialLink + ?Sized> SerialLink for Box<T> {
    fn write_all(
        &mut self,
        bytes: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).write_all(bytes)
    }
    fn read_byte(&mut self) -> Result<Option<u8>, Box<dyn std::error::Error + Send + Sync>> {
        (**self).read_byte()
    }
}

impl<T: Clock + ?Sized> Clock for Box<T> {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
    fn sleep_ms(&self, ms: u32) {
        (**self).sleep_ms(ms)
    }
}
