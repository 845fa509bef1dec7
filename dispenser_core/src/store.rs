//! CRC-protected persistent state record and fixed-slot log.
//!
//! Layout on the 32 KiB EEPROM: the log occupies 64 slots of 64 bytes at the
//! base of the address space; the single state record lives in the last 64
//! bytes near the top. A slot is valid iff its first byte is non-zero, a NUL
//! terminator exists within the message window, and the CRC16 recomputed
//! over `message + NUL + crc bytes` is exactly zero (self-checking encoding).
//!
//! A failed state CRC on load is reported as "absent", never as an error:
//! it is the expected outcome of a first boot or a torn write, and the
//! caller substitutes defaults.

use dispenser_traits::Nvs;
use eyre::WrapErr;

use crate::error::Result;
use crate::hw_error::map_hw_error;

/// Total device size in bytes.
pub const NVS_SIZE: u16 = 32 * 1024;
/// Fixed address of the state record, in the last 64 bytes of the device.
pub const STATE_ADDR: u16 = NVS_SIZE - 64;
/// Base address of the log region.
pub const LOG_BASE_ADDR: u16 = 0;
/// Fixed size of one log slot.
pub const LOG_ENTRY_SIZE: usize = 64;
/// Number of log slots. The log is a fixed array, not a ring buffer.
pub const LOG_MAX_ENTRIES: u16 = 64;
/// Longest storable message; longer messages are truncated.
pub const MAX_MESSAGE_LEN: usize = 61;
/// Encoded state record length: payload (8 bytes) + CRC16 (2 bytes).
pub const STATE_RECORD_LEN: usize = 10;

/// CRC16, MSB-first, polynomial 0x1021, init 0xFFFF, no final XOR.
///
/// The writer appends the big-endian CRC to the data, so recomputing over
/// `data + crc` yields zero. Both the state record and each log entry rely
/// on that self-check identity.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        let mut x = (crc >> 8) as u8 ^ b;
        x ^= x >> 4;
        crc = (crc << 8) ^ (u16::from(x) << 12) ^ (u16::from(x) << 5) ^ u16::from(x);
    }
    crc
}

/// Motor phase recorded in the durable state, the crash marker for the
/// dispense cycle: `Turning` persisted on disk across a reboot means power
/// was lost mid-rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotorStatus {
    #[default]
    Idle,
    Turning,
}

impl MotorStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Turning => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Idle),
            1 => Some(Self::Turning),
            _ => None,
        }
    }
}

/// The one durable record. Mutated and persisted by every operation that
/// changes calibration, count, period or motor phase; never deleted, only
/// overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct DispenserState {
    pub steps_per_revolution: f32,
    /// Treatment period in pills, 1..=7.
    pub period: u8,
    /// Pills dispensed so far this fill, `<= period` while calibrated.
    pub dispensed_count: u8,
    pub is_calibrated: bool,
    pub motor_status: MotorStatus,
}

impl Default for DispenserState {
    fn default() -> Self {
        Self {
            steps_per_revolution: 4096.0,
            period: 7,
            dispensed_count: 0,
            is_calibrated: false,
            motor_status: MotorStatus::Idle,
        }
    }
}

impl DispenserState {
    /// Encode to the fixed wire layout, CRC included.
    pub fn encode(&self) -> [u8; STATE_RECORD_LEN] {
        let mut out = [0u8; STATE_RECORD_LEN];
        out[0..4].copy_from_slice(&self.steps_per_revolution.to_le_bytes());
        out[4] = self.period;
        out[5] = self.dispensed_count;
        out[6] = u8::from(self.is_calibrated);
        out[7] = self.motor_status.to_byte();
        let crc = crc16(&out[0..8]);
        out[8..10].copy_from_slice(&crc.to_be_bytes());
        out
    }

    /// Decode and verify. `None` means "no usable prior state": either the
    /// CRC does not match or a field is out of range.
    pub fn decode(bytes: &[u8; STATE_RECORD_LEN]) -> Option<Self> {
        let stored = u16::from_be_bytes([bytes[8], bytes[9]]);
        if crc16(&bytes[0..8]) != stored {
            return None;
        }
        let steps_per_revolution = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let period = bytes[4];
        let dispensed_count = bytes[5];
        let is_calibrated = match bytes[6] {
            0 => false,
            1 => true,
            _ => return None,
        };
        let motor_status = MotorStatus::from_byte(bytes[7])?;
        if !(1..=7).contains(&period) || dispensed_count > period {
            return None;
        }
        if !steps_per_revolution.is_finite() || steps_per_revolution <= 0.0 {
            return None;
        }
        Some(Self {
            steps_per_revolution,
            period,
            dispensed_count,
            is_calibrated,
            motor_status,
        })
    }
}

fn slot_addr(index: u16) -> u16 {
    LOG_BASE_ADDR + index * LOG_ENTRY_SIZE as u16
}

/// Validity self-check over one raw slot.
pub fn log_entry_is_valid(slot: &[u8; LOG_ENTRY_SIZE]) -> bool {
    if slot[0] == 0 {
        return false;
    }
    // A terminator must exist at or before index MAX_MESSAGE_LEN: a
    // maximum-length message puts its NUL exactly there.
    let Some(nul) = slot[..=MAX_MESSAGE_LEN].iter().position(|&b| b == 0) else {
        return false;
    };
    // message + NUL + two CRC bytes must hash to zero
    crc16(&slot[..nul + 3]) == 0
}

fn log_entry_message(slot: &[u8; LOG_ENTRY_SIZE]) -> Option<String> {
    if !log_entry_is_valid(slot) {
        return None;
    }
    let nul = slot[..=MAX_MESSAGE_LEN].iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&slot[..nul]).into_owned())
}

/// Encode one message into a full slot image: truncated message, NUL, then
/// the big-endian CRC over `message + NUL`.
pub fn encode_log_entry(message: &str) -> [u8; LOG_ENTRY_SIZE] {
    let mut slot = [0u8; LOG_ENTRY_SIZE];
    let msg = message.as_bytes();
    let len = msg.len().min(MAX_MESSAGE_LEN);
    slot[..len].copy_from_slice(&msg[..len]);
    slot[len] = 0;
    let crc = crc16(&slot[..=len]);
    slot[len + 1] = (crc >> 8) as u8;
    slot[len + 2] = (crc & 0xFF) as u8;
    slot
}

/// Owns the non-volatile device and implements the state/log operations on
/// top of it. Write settle delays are the device's concern.
pub struct Store<N: Nvs> {
    nvs: N,
}

impl<N: Nvs> Store<N> {
    pub fn new(nvs: N) -> Self {
        Self { nvs }
    }

    /// Access to the underlying device (tests, diagnostics).
    pub fn nvs_mut(&mut self) -> &mut N {
        &mut self.nvs
    }

    /// Persist the state record at its fixed address. Writes are assumed to
    /// succeed at the bus level; corruption is only detected on the next
    /// [`load`](Self::load).
    pub fn save(&mut self, state: &DispenserState) -> Result<()> {
        let record = state.encode();
        self.nvs
            .write(STATE_ADDR, &record)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("state save")?;
        tracing::debug!(
            spr = state.steps_per_revolution,
            count = state.dispensed_count,
            period = state.period,
            calibrated = state.is_calibrated,
            "state persisted"
        );
        Ok(())
    }

    /// Read back the state record; `Ok(None)` when the CRC does not match.
    /// This is the sole defense against partial or garbled records.
    pub fn load(&mut self) -> Result<Option<DispenserState>> {
        let mut record = [0u8; STATE_RECORD_LEN];
        self.nvs
            .read(STATE_ADDR, &mut record)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("state load")?;
        let state = DispenserState::decode(&record);
        if state.is_none() {
            tracing::info!("no valid state record; defaults apply");
        }
        Ok(state)
    }

    /// Append a message into the first invalid (free) slot. When every slot
    /// is valid the whole log is wiped first and the entry lands in slot 0.
    /// Returns the slot index written.
    pub fn log_write(&mut self, message: &str) -> Result<u16> {
        let mut target = None;
        for i in 0..LOG_MAX_ENTRIES {
            if !self.read_slot(i).map(|s| log_entry_is_valid(&s))? {
                target = Some(i);
                break;
            }
        }
        let index = match target {
            Some(i) => i,
            None => {
                tracing::warn!("log full, erasing all slots");
                self.log_erase_all()?;
                0
            }
        };
        let slot = encode_log_entry(message);
        self.nvs
            .write(slot_addr(index), &slot)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("log write")?;
        tracing::debug!(slot = index, message, "log entry written");
        Ok(index)
    }

    /// Invalidate every slot by zeroing its first byte.
    pub fn log_erase_all(&mut self) -> Result<()> {
        for i in 0..LOG_MAX_ENTRIES {
            self.nvs
                .write(slot_addr(i), &[0])
                .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
                .wrap_err("log erase")?;
        }
        Ok(())
    }

    /// Lazy, finite, restartable walk over the valid messages in slot order.
    /// Slots that fail to read are skipped with a warning.
    pub fn log_read_all(&mut self) -> LogEntries<'_, N> {
        LogEntries {
            store: self,
            next: 0,
        }
    }

    fn read_slot(&mut self, index: u16) -> Result<[u8; LOG_ENTRY_SIZE]> {
        let mut slot = [0u8; LOG_ENTRY_SIZE];
        self.nvs
            .read(slot_addr(index), &mut slot)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("log slot read")?;
        Ok(slot)
    }
}

/// Iterator over `(slot_index, message)` for every valid entry.
pub struct LogEntries<'a, N: Nvs> {
    store: &'a mut Store<N>,
    next: u16,
}

impl<N: Nvs> Iterator for LogEntries<'_, N> {
    type Item = (u16, String);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < LOG_MAX_ENTRIES {
            let index = self.next;
            self.next += 1;
            match self.store.read_slot(index) {
                Ok(slot) => {
                    if let Some(msg) = log_entry_message(&slot) {
                        return Some((index, msg));
                    }
                }
                Err(e) => {
                    tracing::warn!(slot = index, error = %e, "log slot unreadable, skipping");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod crc_tests {
    use super::*;

    #[test]
    fn matches_ccitt_false_check_value() {
        // Standard check input for CRC-16/CCITT-FALSE.
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn empty_input_is_initial_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn appending_own_crc_hashes_to_zero() {
        let data = b"OK: 3/7";
        let crc = crc16(data);
        let mut framed = data.to_vec();
        framed.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(crc16(&framed), 0);
    }
}

#[cfg(test)]
mod record_tests {
    use super::*;

    #[test]
    fn decode_rejects_out_of_range_period() {
        let state = DispenserState::default();
        let mut bytes = state.encode();
        // Force period to 9 and re-seal the CRC so only the range check fires.
        bytes[4] = 9;
        let crc = crc16(&bytes[0..8]);
        bytes[8..10].copy_from_slice(&crc.to_be_bytes());
        assert!(DispenserState::decode(&bytes).is_none());
    }

    #[test]
    fn decode_rejects_count_above_period() {
        let state = DispenserState {
            period: 3,
            dispensed_count: 2,
            ..Default::default()
        };
        let mut bytes = state.encode();
        bytes[5] = 4;
        let crc = crc16(&bytes[0..8]);
        bytes[8..10].copy_from_slice(&crc.to_be_bytes());
        assert!(DispenserState::decode(&bytes).is_none());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let state = DispenserState {
            steps_per_revolution: 4103.5,
            period: 5,
            dispensed_count: 2,
            is_calibrated: true,
            motor_status: MotorStatus::Turning,
        };
        let decoded = DispenserState::decode(&state.encode()).expect("valid record");
        assert_eq!(decoded, state);
    }
}
