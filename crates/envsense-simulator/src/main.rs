//! Host simulator for the envsense drivers.
//!
//! Every device is simulated in software: the barometer, the light sensor
//! and the pollution co-processor as I2C peripherals, the SHT15 as a
//! reactive model of its two wires. Synthetic readings drift slowly so
//! successive rounds differ.
//!
//! Usage: `envsense-simulator [ROUNDS]` (default 5). Run with
//! `RUST_LOG=debug` to see calibration dumps and protocol messages.

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;
use std::time::Instant;

use embassy_time::Delay;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::i2c::{self, ErrorKind, I2c, NoAcknowledgeSource, Operation};
use log::{error, info, warn};

use envsense::config::{BarometerConfig, LightConfig, Sht15Config};
use envsense::dual_mode_pin::DualModePin;
use envsense::sensors::barometer::{BMP280, Barometer, REG_CTRL_MEAS, REG_RESET};
use envsense::sensors::pollution::{AnalogInput, AnalogPollutionSensor, Channel, PollutionSensor};
use envsense::sensors::sht15::Sht15;
use envsense::sensors::tsl45315::Tsl45315;

const DEFAULT_ROUNDS: u32 = 5;

/// Sea level pressure used for the second half of the run, in Pa.
const LOCAL_SEA_LEVEL_PA: f64 = 101_900.0;

// ---------------------------------------------------------------------------
// I2C plumbing
// ---------------------------------------------------------------------------

/// A peripheral behind a [`SimBus`].
trait SimDevice {
    fn write(&mut self, bytes: &[u8]);
    fn read(&mut self, buf: &mut [u8]);
}

/// One simulated device on its own bus. Other addresses are not
/// acknowledged.
struct SimBus<Dev> {
    address: u8,
    device: Dev,
}

impl<Dev> i2c::ErrorType for SimBus<Dev> {
    type Error = ErrorKind;
}

impl<Dev: SimDevice> I2c for SimBus<Dev> {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if address != self.address {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        for op in operations {
            match op {
                Operation::Write(bytes) => self.device.write(bytes),
                Operation::Read(buf) => self.device.read(buf),
            }
        }
        Ok(())
    }
}

/// 256-byte register space with an auto-incrementing pointer.
struct Registers {
    memory: [u8; 256],
    pointer: u8,
}

impl Registers {
    fn new() -> Self {
        Self {
            memory: [0; 256],
            pointer: 0,
        }
    }

    fn set(&mut self, register: u8, bytes: &[u8]) {
        let start = register as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Some((register, data)) = bytes.split_first() {
            self.pointer = *register;
            for value in data {
                self.memory[self.pointer as usize] = *value;
                self.pointer = self.pointer.wrapping_add(1);
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) {
        for slot in buf.iter_mut() {
            *slot = self.memory[self.pointer as usize];
            self.pointer = self.pointer.wrapping_add(1);
        }
    }
}

fn seconds_since(started: Instant) -> f64 {
    started.elapsed().as_secs_f64()
}

// ---------------------------------------------------------------------------
// Barometer
// ---------------------------------------------------------------------------

/// BMP280 that converts whenever its control register is written.
struct SimBmp280 {
    registers: Registers,
    started: Instant,
}

impl SimBmp280 {
    fn new() -> Self {
        let mut registers = Registers::new();
        // Trimming values from the datasheet example
        let calibration: [u16; 12] = [
            27504,
            26435,
            (-1000i16) as u16,
            36477,
            (-10685i16) as u16,
            3024,
            2855,
            140,
            (-7i16) as u16,
            15500,
            (-14600i16) as u16,
            6000,
        ];
        for (i, word) in calibration.iter().enumerate() {
            registers.set(0x88 + 2 * i as u8, &word.to_le_bytes());
        }
        registers.set(0xD0, &[0x58]);

        let mut device = Self {
            registers,
            started: Instant::now(),
        };
        device.convert();
        device
    }

    fn convert(&mut self) {
        let t = seconds_since(self.started);
        let raw_temperature = (519_888.0 + 2_000.0 * (t / 7.0).sin()) as u32;
        let raw_pressure = (415_148.0 + 1_500.0 * (t / 11.0).sin()) as u32;
        self.registers
            .set(0xF7, &(raw_pressure << 4).to_be_bytes()[1..]);
        self.registers
            .set(0xFA, &(raw_temperature << 4).to_be_bytes()[1..]);
    }
}

impl SimDevice for SimBmp280 {
    fn write(&mut self, bytes: &[u8]) {
        self.registers.write(bytes);
        match bytes {
            [REG_CTRL_MEAS, _, ..] => self.convert(),
            [REG_RESET, 0xB6, ..] => info!("sim: BMP280 reset"),
            _ => {}
        }
    }

    fn read(&mut self, buf: &mut [u8]) {
        self.registers.read(buf);
    }
}

// ---------------------------------------------------------------------------
// Light sensor
// ---------------------------------------------------------------------------

struct SimTsl45315 {
    registers: Registers,
    started: Instant,
}

impl SimTsl45315 {
    fn new() -> Self {
        let mut registers = Registers::new();
        registers.set(0x0A, &[0xA0]);
        Self {
            registers,
            started: Instant::now(),
        }
    }
}

impl SimDevice for SimTsl45315 {
    fn write(&mut self, bytes: &[u8]) {
        // strip the command bit from the register address
        let mut unmasked = bytes.to_vec();
        if let Some(first) = unmasked.first_mut() {
            *first &= 0x7F;
        }
        self.registers.write(&unmasked);
    }

    fn read(&mut self, buf: &mut [u8]) {
        if self.registers.pointer == 0x04 {
            let powered = self.registers.memory[0] & 0x03 == 0x03;
            let lux = if powered {
                let t = seconds_since(self.started);
                (350.0 + 150.0 * (t / 5.0).sin()) as u16
            } else {
                0
            };
            // scale down for shorter integration windows
            let divider = 1u16 << (self.registers.memory[1] & 0x03);
            self.registers.set(0x04, &(lux / divider).to_le_bytes());
        }
        self.registers.read(buf);
    }
}

// ---------------------------------------------------------------------------
// Pollution sensors
// ---------------------------------------------------------------------------

/// Co-processor that answers `'1'` with a one-byte sample.
struct SimCoprocessor {
    requested: bool,
    started: Instant,
}

impl SimDevice for SimCoprocessor {
    fn write(&mut self, bytes: &[u8]) {
        self.requested = bytes == b"1";
    }

    fn read(&mut self, buf: &mut [u8]) {
        let t = seconds_since(self.started);
        let sample = if self.requested {
            (120.0 + 60.0 * (t / 3.0).sin()) as u8
        } else {
            0
        };
        self.requested = false;
        buf.fill(sample);
    }
}

struct SimAdc {
    started: Instant,
}

impl AnalogInput for SimAdc {
    type Error = Infallible;

    fn read_channel(&mut self, channel: Channel) -> Result<i16, Self::Error> {
        let t = seconds_since(self.started);
        Ok(match channel {
            Channel::A0 => (900.0 + 300.0 * (t / 4.0).sin()) as i16,
            _ => 0,
        })
    }
}

// ---------------------------------------------------------------------------
// SHT15 line model
// ---------------------------------------------------------------------------

/// Where the simulated SHT15 is in a transfer.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    /// Data fell while the clock was high.
    Starting,
    Command { opcode: u8, bits: u8 },
    Acknowledge { opcode: u8 },
    Converting { word: u16, polls: u8 },
    /// Clock counts 0..8 high byte, 8 master ack, 9..17 low byte, 17 CRC skip.
    Transfer { word: u16, clock: u8 },
}

struct Sht15Model {
    phase: Phase,
    clock_high: bool,
    master_level: bool,
    pull_low: bool,
    started: Instant,
}

impl Sht15Model {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            clock_high: false,
            master_level: true,
            pull_low: false,
            started: Instant::now(),
        }
    }

    fn sample_for(&self, opcode: u8) -> u16 {
        let t = seconds_since(self.started);
        match opcode {
            0b0000_0011 => {
                let celsius = 22.0 + 2.0 * (t / 9.0).sin();
                ((celsius + 40.0) / 0.01) as u16
            }
            0b0000_0101 => {
                // inverse of the linear term, good enough for a simulation
                let humidity = 45.0 + 8.0 * (t / 13.0).sin();
                ((humidity + 2.0468) / 0.0367 * 1.06) as u16
            }
            _ => {
                warn!("sim: SHT15 got unknown command {:#04x}", opcode);
                0
            }
        }
    }

    fn clock_edge(&mut self, high: bool) {
        self.clock_high = high;
        self.phase = match (self.phase, high) {
            (Phase::Command { opcode, bits }, true) => {
                let opcode = (opcode << 1) | self.master_level as u8;
                if bits + 1 == 8 {
                    Phase::Acknowledge { opcode }
                } else {
                    Phase::Command {
                        opcode,
                        bits: bits + 1,
                    }
                }
            }
            (Phase::Acknowledge { opcode }, true) => {
                self.pull_low = true;
                Phase::Acknowledge { opcode }
            }
            (Phase::Acknowledge { opcode }, false) => {
                self.pull_low = false;
                Phase::Converting {
                    word: self.sample_for(opcode),
                    polls: 3,
                }
            }
            (Phase::Transfer { word, clock }, true) => {
                self.pull_low = match clock {
                    0..8 => (word >> (15 - clock)) & 1 == 0,
                    9..17 => (word >> (16 - clock)) & 1 == 0,
                    _ => false,
                };
                Phase::Transfer { word, clock }
            }
            (Phase::Transfer { word, clock }, false) => {
                self.pull_low = false;
                if clock + 1 >= 18 {
                    Phase::Idle
                } else {
                    Phase::Transfer {
                        word,
                        clock: clock + 1,
                    }
                }
            }
            (phase, _) => phase,
        };
    }

    fn data_driven(&mut self, level: bool) {
        self.master_level = level;
        if !self.clock_high {
            return;
        }
        self.phase = match (self.phase, level) {
            (Phase::Idle, false) => Phase::Starting,
            (Phase::Starting, true) => Phase::Command { opcode: 0, bits: 0 },
            (phase, _) => phase,
        };
    }

    fn sample(&mut self) -> bool {
        if let Phase::Converting { word, polls } = self.phase {
            if polls == 0 {
                self.pull_low = true;
                self.phase = Phase::Transfer { word, clock: 0 };
            } else {
                self.phase = Phase::Converting {
                    word,
                    polls: polls - 1,
                };
            }
        }
        !self.pull_low
    }
}

struct SimClock(Rc<RefCell<Sht15Model>>);
struct SimData(Rc<RefCell<Sht15Model>>);

impl digital::ErrorType for SimClock {
    type Error = Infallible;
}

impl OutputPin for SimClock {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().clock_edge(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().clock_edge(true);
        Ok(())
    }
}

impl digital::ErrorType for SimData {
    type Error = Infallible;
}

impl DualModePin for SimData {
    fn set_as_input(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_as_output(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().data_driven(true);
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().data_driven(false);
        Ok(())
    }

    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.0.borrow_mut().sample())
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();

    let rounds = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_ROUNDS);
    info!("Starting envsense simulator, {} rounds", rounds);

    let baro_bus = SimBus {
        address: BMP280.default_address,
        device: SimBmp280::new(),
    };
    let mut barometer = match Barometer::new(baro_bus, Delay, BMP280, BarometerConfig::default())
    {
        Ok(barometer) => barometer,
        Err(e) => {
            error!("barometer init failed: {}", e);
            return;
        }
    };
    match barometer.read_chip_id() {
        Ok(id) => info!("BMP280 chip id {}", id),
        Err(e) => error!("chip id read failed: {}", e),
    }

    let light_config = LightConfig::default();
    let light_bus = SimBus {
        address: light_config.address,
        device: SimTsl45315::new(),
    };
    let mut light = match Tsl45315::new(light_bus, light_config) {
        Ok(light) => light,
        Err(e) => {
            error!("light sensor init failed: {}", e);
            return;
        }
    };

    let model = Rc::new(RefCell::new(Sht15Model::new()));
    let mut sht = match Sht15::new(
        SimClock(model.clone()),
        SimData(model),
        Delay,
        Sht15Config::default(),
    ) {
        Ok(sht) => sht,
        Err(e) => {
            error!("SHT15 init failed: {}", e);
            return;
        }
    };

    let mut pollution = PollutionSensor::new(
        SimBus {
            address: envsense::sensors::pollution::DEFAULT_COPROCESSOR_ADDRESS,
            device: SimCoprocessor {
                requested: false,
                started: Instant::now(),
            },
        },
        Delay,
    );
    let mut analog = AnalogPollutionSensor::new(SimAdc {
        started: Instant::now(),
    });

    for round in 0..rounds {
        if round == rounds / 2 {
            match barometer.set_reference_sea_level_pressure(LOCAL_SEA_LEVEL_PA) {
                Ok(()) => info!("sea level reference set to {} Pa", LOCAL_SEA_LEVEL_PA),
                Err(e) => error!("bad sea level reference: {}", e),
            }
        }

        match (
            barometer.read_temperature(),
            barometer.read_pressure(),
            barometer.read_altitude(),
        ) {
            (Ok(t), Ok(p), Ok(a)) => info!(
                "[{}] BMP280: {:.2} °C, {:.2} hPa, {:.1} m",
                round,
                t,
                p / 100.0,
                a
            ),
            (t, p, a) => error!("[{}] BMP280 read failed: {:?} {:?} {:?}", round, t, p, a),
        }

        match sht.read() {
            Ok(reading) => info!(
                "[{}] SHT15: {:.2} °C, {:.1} %RH",
                round, reading.temperature, reading.humidity
            ),
            Err(e) => {
                error!("[{}] SHT15 read failed: {}", round, e);
                if let Err(e) = sht.reset() {
                    error!("SHT15 reset failed: {}", e);
                }
            }
        }

        match light.read_value() {
            Ok(lux) => info!("[{}] TSL45315: {} lx", round, lux),
            Err(e) => error!("[{}] TSL45315 read failed: {}", round, e),
        }

        match (pollution.read_value(), analog.read_value()) {
            (Ok(digital), Ok(raw)) => {
                info!("[{}] pollution: co-processor {}, ADC {}", round, digital, raw)
            }
            (d, a) => error!("[{}] pollution read failed: {:?} {:?}", round, d, a),
        }
    }

    if sht.ack_mismatches() > 0 {
        warn!("SHT15 acknowledgment mismatches: {}", sht.ack_mismatches());
    }
    if let Err(e) = light.power_down() {
        error!("light sensor power down failed: {}", e);
    }
    info!("Simulator exiting");
}
