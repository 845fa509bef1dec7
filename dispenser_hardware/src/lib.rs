#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Device backends for the dispenser seams.
//!
//! Simulated devices are always available and carry no hardware
//! dependencies; the Raspberry Pi GPIO/I2C/UART backends live in `rpi`
//! behind the `hardware` feature.

pub mod error;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod rpi;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use dispenser_traits::{DropSensor, Nvs, OptoFork, SerialLink, Stepper};

use crate::error::HwError;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Simulated dispenser wheel: one revolution of `rev` steps with a single
/// opening of `gap` steps starting at position 0. The stepper and opto fork
/// views share the position cell, so stepping moves what the sensor sees.
pub struct SimWheel {
    pos: Rc<Cell<i64>>,
    gap: u32,
    rev: u32,
}

impl SimWheel {
    pub fn new(gap: u32, rev: u32) -> Self {
        assert!(gap > 0 && gap < rev);
        Self {
            pos: Rc::new(Cell::new(0)),
            gap,
            rev,
        }
    }

    /// Start with the opening rotated away from the fork.
    pub fn starting_blocked(gap: u32, rev: u32) -> Self {
        let wheel = Self::new(gap, rev);
        wheel.pos.set(i64::from(gap));
        wheel
    }

    pub fn stepper(&self) -> SimStepper {
        SimStepper {
            pos: self.pos.clone(),
            steps: Rc::new(Cell::new(0)),
            releases: Rc::new(Cell::new(0)),
        }
    }

    pub fn opto_fork(&self) -> SimOptoFork {
        SimOptoFork {
            pos: self.pos.clone(),
            gap: self.gap,
            rev: self.rev,
        }
    }

    /// Steps from the opening start, normalized into one revolution.
    pub fn offset_from_home(&self) -> i64 {
        self.pos.get().rem_euclid(i64::from(self.rev))
    }
}

pub struct SimStepper {
    pos: Rc<Cell<i64>>,
    steps: Rc<Cell<u64>>,
    releases: Rc<Cell<u32>>,
}

impl SimStepper {
    pub fn steps_taken(&self) -> u64 {
        self.steps.get()
    }

    pub fn release_count(&self) -> u32 {
        self.releases.get()
    }

    /// A second handle observing the same counters.
    pub fn observer(&self) -> Self {
        Self {
            pos: self.pos.clone(),
            steps: self.steps.clone(),
            releases: self.releases.clone(),
        }
    }
}

impl Stepper for SimStepper {
    fn step(&mut self, direction: i8) -> Result<(), BoxedError> {
        self.pos.set(self.pos.get() + i64::from(direction));
        self.steps.set(self.steps.get() + 1);
        Ok(())
    }

    fn release(&mut self) -> Result<(), BoxedError> {
        self.releases.set(self.releases.get() + 1);
        Ok(())
    }
}

pub struct SimOptoFork {
    pos: Rc<Cell<i64>>,
    gap: u32,
    rev: u32,
}

impl OptoFork for SimOptoFork {
    fn is_open(&mut self) -> Result<bool, BoxedError> {
        let offset = self.pos.get().rem_euclid(i64::from(self.rev));
        Ok(offset < i64::from(self.gap))
    }
}

/// Scripted pill-drop latch. Each `clear` arms the next scripted outcome;
/// `detected` then reports it until the next `clear`.
pub struct SimDropSensor {
    script: VecDeque<bool>,
    fallback: bool,
    current: bool,
}

impl SimDropSensor {
    /// Every dispense attempt sees a drop.
    pub fn always() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: true,
            current: false,
        }
    }

    /// No attempt ever sees a drop.
    pub fn never() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: false,
            current: false,
        }
    }

    /// Outcomes consumed in order, then `fallback` thereafter.
    pub fn from_script(outcomes: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            script: outcomes.into_iter().collect(),
            fallback,
            current: false,
        }
    }
}

impl DropSensor for SimDropSensor {
    fn detected(&mut self) -> bool {
        self.current
    }

    fn clear(&mut self) {
        self.current = self.script.pop_front().unwrap_or(self.fallback);
    }
}

/// In-memory EEPROM image. Clones share the image, so a test can write
/// through one handle and corrupt or inspect through another.
#[derive(Clone)]
pub struct SimEeprom {
    image: Rc<RefCell<Vec<u8>>>,
    writes: Rc<Cell<u32>>,
}

impl SimEeprom {
    pub fn new(size: usize) -> Self {
        Self {
            image: Rc::new(RefCell::new(vec![0u8; size])),
            writes: Rc::new(Cell::new(0)),
        }
    }

    pub fn write_count(&self) -> u32 {
        self.writes.get()
    }

    /// Corrupt a single bit, as a power glitch during a write would.
    pub fn flip_bit(&self, addr: u16, bit: u8) {
        let mut image = self.image.borrow_mut();
        image[addr as usize] ^= 1 << (bit & 7);
    }

    pub fn read_raw(&self, addr: u16, len: usize) -> Vec<u8> {
        let image = self.image.borrow();
        image[addr as usize..addr as usize + len].to_vec()
    }

    fn check_range(&self, addr: u16, len: usize) -> Result<(), HwError> {
        let end = addr as usize + len;
        if end > self.image.borrow().len() {
            return Err(HwError::Bus(format!(
                "access past end of device: {addr}+{len}"
            )));
        }
        Ok(())
    }
}

impl Nvs for SimEeprom {
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BoxedError> {
        self.check_range(addr, bytes.len())?;
        let a = addr as usize;
        self.image.borrow_mut()[a..a + bytes.len()].copy_from_slice(bytes);
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }

    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), BoxedError> {
        self.check_range(addr, buf.len())?;
        let a = addr as usize;
        buf.copy_from_slice(&self.image.borrow()[a..a + buf.len()]);
        Ok(())
    }
}

/// File-backed EEPROM image for the CLI: survives process restarts, which
/// is what makes simulated power-loss recovery demonstrable. Writes go to
/// memory and then the whole image is flushed atomically (write to a
/// sibling temp file, fsync, rename).
pub struct FileEeprom {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileEeprom {
    pub fn open(path: impl Into<PathBuf>, size: usize) -> Result<Self, HwError> {
        let path = path.into();
        let mut image = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![0u8; size],
            Err(e) => return Err(HwError::Io(e)),
        };
        image.resize(size, 0);
        Ok(Self { path, image })
    }

    fn flush(&self) -> Result<(), HwError> {
        write_atomic(&self.path, &self.image).map_err(HwError::Io)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("new");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp, path)
}

impl Nvs for FileEeprom {
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BoxedError> {
        let end = addr as usize + bytes.len();
        if end > self.image.len() {
            return Err(Box::new(HwError::Bus(format!(
                "access past end of device: {addr}+{}",
                bytes.len()
            ))));
        }
        self.image[addr as usize..end].copy_from_slice(bytes);
        self.flush()?;
        Ok(())
    }

    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), BoxedError> {
        let end = addr as usize + buf.len();
        if end > self.image.len() {
            return Err(Box::new(HwError::Bus(format!(
                "access past end of device: {addr}+{}",
                buf.len()
            ))));
        }
        buf.copy_from_slice(&self.image[addr as usize..end]);
        Ok(())
    }
}

/// Raw scripted serial port. Tests push response lines in and read the
/// written commands back out; nothing answers automatically.
#[derive(Clone, Default)]
pub struct SimSerial {
    rx: Rc<RefCell<VecDeque<u8>>>,
    tx: Rc<RefCell<Vec<u8>>>,
}

impl SimSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one CRLF-terminated line for the device under test to read.
    pub fn push_line(&self, line: &str) {
        let mut rx = self.rx.borrow_mut();
        rx.extend(line.bytes());
        rx.extend(*b"\r\n");
    }

    /// Drain everything written so far, split into CRLF-terminated lines.
    pub fn take_tx_lines(&self) -> Vec<String> {
        let mut tx = self.tx.borrow_mut();
        let text = String::from_utf8_lossy(&tx).into_owned();
        tx.clear();
        text.split("\r\n")
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

impl SerialLink for SimSerial {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxedError> {
        self.tx.borrow_mut().extend_from_slice(bytes);
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, BoxedError> {
        Ok(self.rx.borrow_mut().pop_front())
    }
}

/// Well-behaved fake radio module: acknowledges every AT command the way
/// the real module does and accepts the join on the first try. Used by the
/// CLI when no real UART is present.
#[derive(Default)]
pub struct SimRadio {
    rx: VecDeque<u8>,
    cmd: Vec<u8>,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn respond(&mut self, line: &str) {
        self.rx.extend(line.bytes());
        self.rx.extend(*b"\r\n");
    }

    fn handle_command(&mut self, cmd: &str) {
        if cmd == "AT" {
            self.respond("+AT: OK");
        } else if cmd.starts_with("AT+MODE=") {
            self.respond("+MODE: LWOTAA");
        } else if cmd.starts_with("AT+KEY=") {
            self.respond("+KEY: APPKEY");
        } else if cmd.starts_with("AT+CLASS=") {
            self.respond("+CLASS: A");
        } else if cmd.starts_with("AT+PORT=") {
            self.respond("+PORT: 8");
        } else if cmd == "AT+JOIN" {
            self.respond("+JOIN: NetID 000024");
            self.respond("+JOIN: Done");
        } else if cmd.starts_with("AT+MSG=") {
            self.respond("+MSG: Done");
        } else {
            self.respond("+AT: ERROR(-1)");
        }
    }
}

impl SerialLink for SimRadio {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxedError> {
        for &b in bytes {
            match b {
                b'\r' => {}
                b'\n' => {
                    let cmd = String::from_utf8_lossy(&self.cmd).into_owned();
                    self.cmd.clear();
                    self.handle_command(&cmd);
                }
                _ => self.cmd.push(b),
            }
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, BoxedError> {
        Ok(self.rx.pop_front())
    }
}
