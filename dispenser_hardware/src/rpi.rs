//! Raspberry Pi backends: GPIO half-step motor drive, opto fork input,
//! piezo interrupt wiring, I2C EEPROM and the UART link to the radio.

use std::time::Duration;

use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use rppal::i2c::I2c;
use rppal::uart::{Parity, Uart};

use dispenser_traits::{DropLatch, EdgeSender, EdgeSource, Nvs, OptoFork, SerialLink, Stepper};

use crate::error::HwError;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// 28BYJ-48 half-step excitation sequence, one coil pattern per phase.
const HALF_STEP_SEQUENCE: [[bool; 4]; 8] = [
    [true, false, false, false],
    [true, true, false, false],
    [false, true, false, false],
    [false, true, true, false],
    [false, false, true, false],
    [false, false, true, true],
    [false, false, false, true],
    [true, false, false, true],
];

pub struct GpioStepper {
    coils: [OutputPin; 4],
    phase: usize,
    step_delay: Duration,
}

impl GpioStepper {
    pub fn new(gpio: &Gpio, pins: [u8; 4]) -> Result<Self, HwError> {
        let get = |n: u8| -> Result<OutputPin, HwError> {
            Ok(gpio
                .get(n)
                .map_err(|e| HwError::Gpio(e.to_string()))?
                .into_output_low())
        };
        Ok(Self {
            coils: [get(pins[0])?, get(pins[1])?, get(pins[2])?, get(pins[3])?],
            phase: 0,
            step_delay: Duration::from_millis(1),
        })
    }

    fn apply_phase(&mut self) {
        let pattern = HALF_STEP_SEQUENCE[self.phase];
        for (coil, on) in self.coils.iter_mut().zip(pattern) {
            if on {
                coil.set_high();
            } else {
                coil.set_low();
            }
        }
    }
}

impl Stepper for GpioStepper {
    fn step(&mut self, direction: i8) -> Result<(), BoxedError> {
        self.phase = (self.phase as i32 + i32::from(direction)).rem_euclid(8) as usize;
        self.apply_phase();
        std::thread::sleep(self.step_delay);
        Ok(())
    }

    fn release(&mut self) -> Result<(), BoxedError> {
        for coil in &mut self.coils {
            coil.set_low();
        }
        Ok(())
    }
}

/// Active-low fork input: the line reads low when a wheel opening is
/// aligned.
pub struct GpioOptoFork {
    pin: InputPin,
}

impl GpioOptoFork {
    pub fn new(gpio: &Gpio, pin: u8) -> Result<Self, HwError> {
        Ok(Self {
            pin: gpio
                .get(pin)
                .map_err(|e| HwError::Gpio(e.to_string()))?
                .into_input_pullup(),
        })
    }
}

impl OptoFork for GpioOptoFork {
    fn is_open(&mut self) -> Result<bool, BoxedError> {
        Ok(self.pin.is_low())
    }
}

/// Owns the piezo input pin so the falling-edge interrupt stays armed.
/// The handler runs in interrupt context and only sets the latch and posts
/// one edge event.
pub struct PiezoIrq {
    _pin: InputPin,
}

impl PiezoIrq {
    pub fn attach(
        gpio: &Gpio,
        pin: u8,
        latch: DropLatch,
        events: Option<EdgeSender>,
    ) -> Result<Self, HwError> {
        let mut pin = gpio
            .get(pin)
            .map_err(|e| HwError::Gpio(e.to_string()))?
            .into_input_pullup();
        pin.set_async_interrupt(Trigger::FallingEdge, move |_level: Level| {
            latch.set();
            if let Some(events) = &events {
                if !events.post(EdgeSource::PillDrop) {
                    tracing::warn!("edge queue full, pill-drop event dropped");
                }
            }
        })
        .map_err(|e| HwError::Gpio(e.to_string()))?;
        Ok(Self { _pin: pin })
    }
}

/// Motor and fork opened together on one GPIO handle.
pub struct WheelIo {
    pub stepper: GpioStepper,
    pub opto: GpioOptoFork,
}

pub fn open_wheel(motor_pins: [u8; 4], opto_pin: u8) -> Result<WheelIo, HwError> {
    let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
    Ok(WheelIo {
        stepper: GpioStepper::new(&gpio, motor_pins)?,
        opto: GpioOptoFork::new(&gpio, opto_pin)?,
    })
}

/// Drop latch that owns its interrupt registration; dropping the sensor
/// disarms the piezo IRQ.
pub struct PiezoDropSensor {
    latch: DropLatch,
    _irq: PiezoIrq,
}

pub fn open_drop_sensor(pin: u8, events: Option<EdgeSender>) -> Result<PiezoDropSensor, HwError> {
    let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
    let latch = DropLatch::new();
    let irq = PiezoIrq::attach(&gpio, pin, latch.clone(), events)?;
    Ok(PiezoDropSensor { latch, _irq: irq })
}

impl dispenser_traits::DropSensor for PiezoDropSensor {
    fn detected(&mut self) -> bool {
        dispenser_traits::DropSensor::detected(&mut self.latch)
    }

    fn clear(&mut self) {
        dispenser_traits::DropSensor::clear(&mut self.latch)
    }
}

const EEPROM_I2C_ADDR: u16 = 0x50;
const EEPROM_PAGE_SIZE: usize = 64;
const EEPROM_WRITE_SETTLE: Duration = Duration::from_millis(10);

/// 24C256-class I2C EEPROM. Writes are chunked at page boundaries and each
/// page write is followed by the device's mandatory settle delay.
pub struct I2cEeprom {
    bus: I2c,
}

impl I2cEeprom {
    pub fn new() -> Result<Self, HwError> {
        let mut bus = I2c::new().map_err(|e| HwError::Bus(e.to_string()))?;
        bus.set_slave_address(EEPROM_I2C_ADDR)
            .map_err(|e| HwError::Bus(e.to_string()))?;
        Ok(Self { bus })
    }

    fn write_page(&mut self, addr: u16, bytes: &[u8]) -> Result<(), HwError> {
        let mut frame = Vec::with_capacity(2 + bytes.len());
        frame.extend_from_slice(&addr.to_be_bytes());
        frame.extend_from_slice(bytes);
        self.bus
            .write(&frame)
            .map_err(|e| HwError::Bus(e.to_string()))?;
        std::thread::sleep(EEPROM_WRITE_SETTLE);
        Ok(())
    }
}

impl Nvs for I2cEeprom {
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BoxedError> {
        let mut addr = addr;
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = EEPROM_PAGE_SIZE - (addr as usize % EEPROM_PAGE_SIZE);
            let take = room.min(rest.len());
            self.write_page(addr, &rest[..take])?;
            addr += take as u16;
            rest = &rest[take..];
        }
        Ok(())
    }

    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), BoxedError> {
        self.bus
            .write(&addr.to_be_bytes())
            .map_err(|e| HwError::Bus(e.to_string()))?;
        self.bus
            .read(buf)
            .map_err(|e| HwError::Bus(e.to_string()))?;
        Ok(())
    }
}

/// Non-blocking UART to the radio module.
pub struct UartLink {
    uart: Uart,
}

impl UartLink {
    pub fn new(baud: u32) -> Result<Self, HwError> {
        let mut uart =
            Uart::new(baud, Parity::None, 8, 1).map_err(|e| HwError::Serial(e.to_string()))?;
        uart.set_read_mode(0, Duration::ZERO)
            .map_err(|e| HwError::Serial(e.to_string()))?;
        Ok(Self { uart })
    }
}

impl SerialLink for UartLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxedError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let n = self
                .uart
                .write(rest)
                .map_err(|e| HwError::Serial(e.to_string()))?;
            rest = &rest[n..];
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, BoxedError> {
        let mut buf = [0u8; 1];
        let n = self
            .uart
            .read(&mut buf)
            .map_err(|e| HwError::Serial(e.to_string()))?;
        Ok((n == 1).then_some(buf[0]))
    }
}
