//! Typed response slots, one per command byte.
//!
//! Each payload type implements [`Decode`]; [`Response`] wraps it with the
//! frame counting and validity tracking shared by every command. A slot
//! becomes valid only once its final expected frame has decoded cleanly.
//! For multi-frame responses the first data byte carries a 1-based
//! sequence number; a mismatch aborts the in-progress reassembly and the
//! slot stays invalid until the request is issued again.

use crate::decode;
use crate::frame::{Frame, DATA_SIZE};

/// Payload decoding for one command.
pub trait Decode: Default {
    /// The command byte this payload answers.
    const COMMAND: u8;

    /// How many frames make up a complete response.
    fn expected_frames(&self) -> usize {
        1
    }

    /// Whether the request may be issued at all (arrays are requestable
    /// only once sized from the pack information).
    fn requestable(&self) -> bool {
        true
    }

    /// Decode one frame; `frame_number` is 1-based. Returns false to
    /// abort.
    fn decode(&mut self, frame: &Frame, frame_number: usize) -> bool;
}

/// A response slot: payload plus reassembly state.
#[derive(Debug, Default)]
pub struct Response<T: Decode> {
    value: T,
    received: usize,
    valid: bool,
}

impl<T: Decode> Response<T> {
    #[must_use]
    pub fn command(&self) -> u8 {
        T::COMMAND
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The decoded payload, valid or not. Use [`Response::get`] when only
    /// complete responses matter.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.valid.then_some(&self.value)
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Build the request frame, resetting the reassembly counters. Returns
    /// `None` when the payload is not currently requestable.
    pub fn request(&mut self) -> Option<Frame> {
        if !self.value.requestable() {
            return None;
        }
        self.received = 0;
        Some(Frame::request(T::COMMAND))
    }

    /// Feed one received frame. Returns true when this frame completed the
    /// response (the `valid` flag has just been set).
    pub fn accept(&mut self, frame: &Frame) -> bool {
        let expected = self.value.expected_frames();
        if self.received >= expected {
            return false;
        }
        self.received += 1;
        let number = self.received;
        // Single-frame responses use all 8 data bytes for payload; only
        // multi-frame responses carry a sequence byte.
        if expected > 1 && usize::from(frame.u8_at(0)) != number {
            self.abort();
            return false;
        }
        if !self.value.decode(frame, number) {
            self.abort();
            return false;
        }
        if number == expected {
            self.valid = true;
            return true;
        }
        false
    }

    fn abort(&mut self) {
        self.received = 0;
        self.valid = false;
    }
}

// ---------------------------------------------------------------------------
// 0x50..0x63: static information and thresholds
// ---------------------------------------------------------------------------

/// 0x50: rated capacity and nominal cell voltage.
#[derive(Debug, Default, Clone)]
pub struct BatteryRatings {
    pub pack_capacity_ah: f64,
    pub nominal_cell_voltage_v: f64,
}

impl Decode for BatteryRatings {
    const COMMAND: u8 = 0x50;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.pack_capacity_ah = decode::scaled_u32(frame, 0, 1000.0);
        self.nominal_cell_voltage_v = decode::scaled_u32(frame, 4, 1000.0);
        true
    }
}

/// 0x51: board, cell and sensor counts.
#[derive(Debug, Default, Clone)]
pub struct HardwareConfig {
    pub board_count: u8,
    pub cell_counts: [u8; 3],
    pub sensor_counts: [u8; 3],
}

impl Decode for HardwareConfig {
    const COMMAND: u8 = 0x51;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.board_count = frame.u8_at(0);
        for index in 0..3 {
            self.cell_counts[index] = frame.u8_at(1 + index);
            self.sensor_counts[index] = frame.u8_at(4 + index);
        }
        true
    }
}

/// 0x52: cumulative charge counters. Layout unconfirmed (TBC); kept as two
/// raw u32 ampere-hour fields until validated against live hardware.
#[derive(Debug, Default, Clone)]
pub struct BatteryStat {
    pub cumulative_charge_ah: f64,
    pub cumulative_discharge_ah: f64,
}

impl Decode for BatteryStat {
    const COMMAND: u8 = 0x52;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.cumulative_charge_ah = decode::scaled_u32(frame, 0, 1.0);
        self.cumulative_discharge_ah = decode::scaled_u32(frame, 4, 1.0);
        true
    }
}

/// 0x53: battery mode, type and production date. Layout unconfirmed (TBC).
#[derive(Debug, Default, Clone)]
pub struct BatteryInfo {
    pub operation_mode: u8,
    pub battery_type: u8,
    pub production_date: decode::ProductionDate,
    pub automatic_sleep_secs: u16,
    pub unknown1: u8,
    pub unknown2: u8,
}

impl Decode for BatteryInfo {
    const COMMAND: u8 = 0x53;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.operation_mode = frame.u8_at(0);
        self.battery_type = frame.u8_at(1);
        self.production_date = decode::ProductionDate::decode(frame, 2);
        self.automatic_sleep_secs = decode::minutes_as_secs(frame, 5);
        self.unknown1 = frame.u8_at(6);
        self.unknown2 = frame.u8_at(7);
        true
    }
}

/// String responses: 7 characters per frame after the sequence byte.
#[derive(Debug, Clone)]
pub struct Text<const CMD: u8, const PAGES: usize> {
    pub text: String,
}

impl<const CMD: u8, const PAGES: usize> Default for Text<CMD, PAGES> {
    fn default() -> Self {
        Self { text: String::new() }
    }
}

impl<const CMD: u8, const PAGES: usize> Decode for Text<CMD, PAGES> {
    const COMMAND: u8 = CMD;
    fn expected_frames(&self) -> usize {
        PAGES
    }
    fn decode(&mut self, frame: &Frame, frame_number: usize) -> bool {
        if frame_number == 1 {
            self.text.clear();
        }
        for index in 0..DATA_SIZE - 1 {
            self.text.push(char::from(frame.u8_at(1 + index)));
        }
        if frame_number == PAGES {
            self.text = self.text.trim().to_string();
        }
        true
    }
}

/// 0x54: firmware index (single page).
pub type FirmwareIndex = Text<0x54, 1>;
/// 0x57: battery code (five pages).
pub type BatteryCode = Text<0x57, 5>;
/// 0x62: software version (two pages).
pub type SoftwareVersion = Text<0x62, 2>;
/// 0x63: hardware version (two pages).
pub type HardwareVersion = Text<0x63, 2>;

/// Two-level max/min threshold pairs used by several commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdPair {
    pub max1: f32,
    pub max2: f32,
    pub min1: f32,
    pub min2: f32,
}

macro_rules! threshold_response {
    ($name:ident, $command:literal, $decoder:path, $stride:literal) => {
        #[derive(Debug, Default, Clone)]
        pub struct $name(pub ThresholdPair);

        impl Decode for $name {
            const COMMAND: u8 = $command;
            fn decode(&mut self, frame: &Frame, _: usize) -> bool {
                self.0 = ThresholdPair {
                    max1: $decoder(frame, 0),
                    max2: $decoder(frame, $stride),
                    min1: $decoder(frame, 2 * $stride),
                    min2: $decoder(frame, 3 * $stride),
                };
                true
            }
        }
    };
}

threshold_response!(CellVoltageThresholds, 0x59, decode::voltage_milli, 2);
threshold_response!(PackVoltageThresholds, 0x5A, decode::voltage_deci, 2);
threshold_response!(PackCurrentThresholds, 0x5B, decode::current_deci, 2);
threshold_response!(PackSocThresholds, 0x5D, decode::percent_deci, 2);

/// 0x5C: charge/discharge temperature thresholds, two levels each.
#[derive(Debug, Default, Clone)]
pub struct PackTemperatureThresholds {
    pub charge_max: [i8; 2],
    pub charge_min: [i8; 2],
    pub discharge_max: [i8; 2],
    pub discharge_min: [i8; 2],
}

impl Decode for PackTemperatureThresholds {
    const COMMAND: u8 = 0x5C;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.charge_max = [decode::temperature(frame, 0), decode::temperature(frame, 1)];
        self.charge_min = [decode::temperature(frame, 2), decode::temperature(frame, 3)];
        self.discharge_max = [decode::temperature(frame, 4), decode::temperature(frame, 5)];
        self.discharge_min = [decode::temperature(frame, 6), decode::temperature(frame, 7)];
        true
    }
}

/// 0x5E: cell difference thresholds.
#[derive(Debug, Default, Clone)]
pub struct CellSensorThresholds {
    pub voltage_diff_v: [f32; 2],
    pub temperature_diff_c: [i8; 2],
}

impl Decode for CellSensorThresholds {
    const COMMAND: u8 = 0x5E;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.voltage_diff_v = [decode::voltage_milli(frame, 0), decode::voltage_milli(frame, 2)];
        self.temperature_diff_c = [decode::temperature(frame, 4), decode::temperature(frame, 5)];
        true
    }
}

/// 0x5F: balancing enable threshold and acceptable differential.
#[derive(Debug, Default, Clone)]
pub struct CellBalanceThresholds {
    pub enable_voltage_v: f32,
    pub acceptable_differential_v: f32,
}

impl Decode for CellBalanceThresholds {
    const COMMAND: u8 = 0x5F;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.enable_voltage_v = decode::voltage_milli(frame, 0);
        self.acceptable_differential_v = decode::voltage_milli(frame, 2);
        true
    }
}

/// 0x60: short-circuit shutdown current and sampling resistance.
#[derive(Debug, Default, Clone)]
pub struct ShortCircuitThresholds {
    pub shutdown_a: f32,
    pub sampling_r: f32,
}

impl Decode for ShortCircuitThresholds {
    const COMMAND: u8 = 0x60;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.shutdown_a = f32::from(frame.u16_at(0));
        self.sampling_r = f32::from(frame.u16_at(2)) / 1000.0;
        true
    }
}

/// 0x61: BMS real-time clock. Layout unconfirmed (TBC); kept as two opaque
/// u32s until the vendor protocol is confirmed.
#[derive(Debug, Default, Clone)]
pub struct Rtc {
    pub datetime1: u32,
    pub datetime2: u32,
}

impl Decode for Rtc {
    const COMMAND: u8 = 0x61;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.datetime1 = frame.u32_at(0);
        self.datetime2 = frame.u32_at(4);
        true
    }
}

// ---------------------------------------------------------------------------
// 0x90..0x98: live status
// ---------------------------------------------------------------------------

/// 0x90: pack voltage, current and state of charge.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackStatus {
    pub voltage_v: f32,
    pub current_a: f32,
    pub soc_pct: f32,
}

impl Decode for PackStatus {
    const COMMAND: u8 = 0x90;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.voltage_v = decode::voltage_deci(frame, 0);
        self.current_a = decode::current_deci(frame, 4);
        self.soc_pct = decode::percent_deci(frame, 6);
        true
    }
}

/// 0x91: extreme cell voltages and their cell numbers.
#[derive(Debug, Default, Clone, Copy)]
pub struct CellVoltageMinmax {
    pub max_v: f32,
    pub max_cell: u8,
    pub min_v: f32,
    pub min_cell: u8,
}

impl Decode for CellVoltageMinmax {
    const COMMAND: u8 = 0x91;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.max_v = decode::voltage_milli(frame, 0);
        self.max_cell = frame.u8_at(2);
        self.min_v = decode::voltage_milli(frame, 3);
        self.min_cell = frame.u8_at(5);
        true
    }
}

/// 0x92: extreme sensor temperatures and their sensor numbers.
#[derive(Debug, Default, Clone, Copy)]
pub struct CellTemperatureMinmax {
    pub max_c: i8,
    pub max_sensor: u8,
    pub min_c: i8,
    pub min_sensor: u8,
}

impl Decode for CellTemperatureMinmax {
    const COMMAND: u8 = 0x92;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.max_c = decode::temperature(frame, 0);
        self.max_sensor = frame.u8_at(1);
        self.min_c = decode::temperature(frame, 2);
        self.min_sensor = frame.u8_at(3);
        true
    }
}

/// Charge/discharge state reported by 0x93.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    #[default]
    Stationary,
    Charging,
    Discharging,
}

impl ChargeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Charging,
            0x02 => Self::Discharging,
            _ => Self::Stationary,
        }
    }
}

/// 0x93: MOSFET states and residual capacity.
#[derive(Debug, Default, Clone)]
pub struct MosfetStatus {
    pub state: ChargeState,
    pub charge_on: bool,
    pub discharge_on: bool,
    pub life_cycle: u8,
    pub residual_capacity_ah: f64,
}

impl Decode for MosfetStatus {
    const COMMAND: u8 = 0x93;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.state = ChargeState::from_u8(frame.u8_at(0));
        self.charge_on = frame.u8_at(1) != 0;
        self.discharge_on = frame.u8_at(2) != 0;
        self.life_cycle = frame.u8_at(3);
        self.residual_capacity_ah = decode::scaled_u32(frame, 4, 1000.0);
        true
    }
}

/// 0x94: pack composition and cycle count.
#[derive(Debug, Default, Clone)]
pub struct PackInfo {
    pub cells: u8,
    pub sensors: u8,
    pub charger_on: bool,
    pub load_on: bool,
    pub dio: [bool; 8],
    pub cycles: u16,
}

impl Decode for PackInfo {
    const COMMAND: u8 = 0x94;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.cells = frame.u8_at(0);
        self.sensors = frame.u8_at(1);
        self.charger_on = frame.u8_at(2) != 0;
        self.load_on = frame.u8_at(3) != 0;
        self.dio = decode::dio_states(frame, 4);
        self.cycles = frame.u16_at(5);
        true
    }
}

/// 0x95: per-cell voltages, three cells per frame.
#[derive(Debug, Default, Clone)]
pub struct CellVoltages {
    pub values: Vec<f32>,
}

pub const CELLS_MAX: usize = 48;
const CELLS_PER_FRAME: usize = 3;

impl CellVoltages {
    /// Size the array; enables requests. Rejects out-of-range counts.
    pub fn set_count(&mut self, count: usize) -> bool {
        if count == 0 || count >= CELLS_MAX {
            return false;
        }
        self.values = vec![0.0; count];
        true
    }
}

impl Decode for CellVoltages {
    const COMMAND: u8 = 0x95;
    fn expected_frames(&self) -> usize {
        self.values.len().div_ceil(CELLS_PER_FRAME)
    }
    fn requestable(&self) -> bool {
        !self.values.is_empty()
    }
    fn decode(&mut self, frame: &Frame, frame_number: usize) -> bool {
        let base = (frame_number - 1) * CELLS_PER_FRAME;
        for index in 0..CELLS_PER_FRAME {
            let Some(slot) = self.values.get_mut(base + index) else {
                break;
            };
            *slot = decode::voltage_milli(frame, 1 + index * 2);
        }
        true
    }
}

/// 0x96: per-sensor temperatures, seven sensors per frame.
#[derive(Debug, Default, Clone)]
pub struct CellTemperatures {
    pub values: Vec<i8>,
}

pub const SENSORS_MAX: usize = 16;
const SENSORS_PER_FRAME: usize = 7;

impl CellTemperatures {
    pub fn set_count(&mut self, count: usize) -> bool {
        if count == 0 || count >= SENSORS_MAX {
            return false;
        }
        self.values = vec![0; count];
        true
    }
}

impl Decode for CellTemperatures {
    const COMMAND: u8 = 0x96;
    fn expected_frames(&self) -> usize {
        self.values.len().div_ceil(SENSORS_PER_FRAME)
    }
    fn requestable(&self) -> bool {
        !self.values.is_empty()
    }
    fn decode(&mut self, frame: &Frame, frame_number: usize) -> bool {
        let base = (frame_number - 1) * SENSORS_PER_FRAME;
        for index in 0..SENSORS_PER_FRAME {
            let Some(slot) = self.values.get_mut(base + index) else {
                break;
            };
            *slot = decode::temperature(frame, 1 + index);
        }
        true
    }
}

/// 0x97: per-cell balance states, 48 bits in one frame.
#[derive(Debug, Default, Clone)]
pub struct CellBalances {
    pub states: Vec<bool>,
}

impl CellBalances {
    pub fn set_count(&mut self, count: usize) -> bool {
        if count == 0 || count >= CELLS_MAX {
            return false;
        }
        self.states = vec![false; count];
        true
    }
}

impl Decode for CellBalances {
    const COMMAND: u8 = 0x97;
    fn requestable(&self) -> bool {
        !self.states.is_empty()
    }
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        for (index, state) in self.states.iter_mut().enumerate() {
            *state = frame.bit_index(index);
        }
        true
    }
}

/// 0x98: 56 failure bits plus a "show" indicator byte.
#[derive(Debug, Default, Clone)]
pub struct FailureStatus {
    pub bits: u64,
    pub count: usize,
    pub show: bool,
}

pub const FAILURE_CODES: usize = 56;

/// Descriptions indexed by failure bit, per the vendor fault table.
pub const FAILURE_DESCRIPTIONS: [&str; FAILURE_CODES] = [
    // Byte 0
    "Cell voltage high level 1",
    "Cell voltage high level 2",
    "Cell voltage low level 1",
    "Cell voltage low level 2",
    "Pack voltage high level 1",
    "Pack voltage high level 2",
    "Pack voltage low level 1",
    "Pack voltage low level 2",
    // Byte 1
    "Charge temperature high level 1",
    "Charge temperature high level 2",
    "Charge temperature low level 1",
    "Charge temperature low level 2",
    "Discharge temperature high level 1",
    "Discharge temperature high level 2",
    "Discharge temperature low level 1",
    "Discharge temperature low level 2",
    // Byte 2
    "Charge current high level 1",
    "Charge current high level 2",
    "Discharge current high level 1",
    "Discharge current high level 2",
    "SOC high level 1",
    "SOC high level 2",
    "SOC low level 1",
    "SOC low level 2",
    // Byte 3
    "Cell voltage difference high level 1",
    "Cell voltage difference high level 2",
    "Cell temperature difference high level 1",
    "Cell temperature difference high level 2",
    "Reserved 3-4",
    "Reserved 3-5",
    "Reserved 3-6",
    "Reserved 3-7",
    // Byte 4
    "Charge MOSFET temperature high",
    "Discharge MOSFET temperature high",
    "Charge MOSFET temperature sensor fail",
    "Discharge MOSFET temperature sensor fail",
    "Charge MOSFET adhesion fail",
    "Discharge MOSFET adhesion fail",
    "Charge MOSFET breaker fail",
    "Discharge MOSFET breaker fail",
    // Byte 5
    "AFE acquisition module fail",
    "Voltage sensor fail",
    "Temperature sensor fail",
    "EEPROM storage fail",
    "RTC fail",
    "Precharge fail",
    "Vehicle communication fail",
    "Network communication fail",
    // Byte 6
    "Current sensor module fail",
    "Voltage sensor module fail",
    "Short circuit protection fail",
    "Low voltage no charging",
    "MOS GPS or soft switch MOS off",
    "Reserved 6-5",
    "Reserved 6-6",
    "Reserved 6-7",
];

impl FailureStatus {
    /// Descriptions of the currently active failure bits.
    #[must_use]
    pub fn active(&self) -> Vec<&'static str> {
        (0..FAILURE_CODES)
            .filter(|&index| self.bits >> index & 1 != 0)
            .map(|index| FAILURE_DESCRIPTIONS[index])
            .collect()
    }
}

impl Decode for FailureStatus {
    const COMMAND: u8 = 0x98;
    fn decode(&mut self, frame: &Frame, _: usize) -> bool {
        self.bits = 0;
        self.count = 0;
        for index in 0..FAILURE_CODES {
            if frame.bit_index(index) {
                self.bits |= 1 << index;
                self.count += 1;
            }
        }
        self.show = frame.u8_at(7) == 0x03;
        true
    }
}

// ---------------------------------------------------------------------------
// Write-only commands
// ---------------------------------------------------------------------------

/// 0x00: reset the BMS.
#[must_use]
pub fn reset_request() -> Frame {
    Frame::request(0x00)
}

/// 0xD9: discharge MOSFET enable; the on/off selector sits at data
/// offset 4.
#[must_use]
pub fn mosfet_discharge_request(on: bool) -> Frame {
    Frame::request(0xD9).set_u8(4, u8::from(on)).finalize()
}

/// 0xDA: charge MOSFET enable; the on/off selector sits at data offset 4.
#[must_use]
pub fn mosfet_charge_request(on: bool) -> Frame {
    Frame::request(0xDA).set_u8(4, u8::from(on)).finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(command: u8, data: [u8; 8]) -> Frame {
        let mut frame = Frame::request(command);
        for (offset, byte) in data.into_iter().enumerate() {
            frame = frame.set_u8(offset, byte);
        }
        frame.finalize()
    }

    #[test]
    fn pack_status_decodes_in_one_frame() {
        let mut slot = Response::<PackStatus>::default();
        assert!(slot.request().is_some());
        // 10.0 V, 0.0 A, 100.0 %
        let done = slot.accept(&frame(0x90, [0x00, 0x64, 0x00, 0x00, 0x75, 0x30, 0x03, 0xE8]));
        assert!(done);
        let status = slot.get().expect("valid after final frame");
        assert_eq!(status.voltage_v, 10.0);
        assert_eq!(status.current_a, 0.0);
        assert_eq!(status.soc_pct, 100.0);
    }

    fn cell_voltage_frame(sequence: u8, cells: [u16; 3]) -> Frame {
        frame(
            0x95,
            [
                sequence,
                (cells[0] >> 8) as u8,
                cells[0] as u8,
                (cells[1] >> 8) as u8,
                cells[1] as u8,
                (cells[2] >> 8) as u8,
                cells[2] as u8,
                0,
            ],
        )
    }

    #[test]
    fn eight_cells_need_three_frames() {
        let mut slot = Response::<CellVoltages>::default();
        assert!(slot.request().is_none(), "unsized array is not requestable");
        assert!(slot.value_mut().set_count(8));
        assert_eq!(slot.value().expected_frames(), 3);
        assert!(slot.request().is_some());

        assert!(!slot.accept(&cell_voltage_frame(1, [3301, 3302, 3303])));
        assert!(!slot.accept(&cell_voltage_frame(2, [3304, 3305, 3306])));
        assert!(slot.accept(&cell_voltage_frame(3, [3307, 3308, 0])));
        let voltages = slot.get().expect("complete");
        assert_eq!(voltages.values.len(), 8);
        assert_eq!(voltages.values[0], 3.301);
        assert_eq!(voltages.values[7], 3.308);
    }

    #[test]
    fn repeated_sequence_byte_leaves_response_invalid() {
        let mut slot = Response::<CellVoltages>::default();
        assert!(slot.value_mut().set_count(8));
        slot.request();
        assert!(!slot.accept(&cell_voltage_frame(1, [3300, 3300, 3300])));
        assert!(!slot.accept(&cell_voltage_frame(2, [3300, 3300, 3300])));
        assert!(!slot.accept(&cell_voltage_frame(2, [3300, 3300, 3300])));
        assert!(!slot.is_valid());

        // The next issue of the request starts a fresh assembly.
        slot.request();
        assert!(!slot.accept(&cell_voltage_frame(1, [3300, 3300, 3300])));
        assert!(!slot.accept(&cell_voltage_frame(2, [3300, 3300, 3300])));
        assert!(slot.accept(&cell_voltage_frame(3, [3300, 3300, 0])));
        assert!(slot.is_valid());
    }

    #[test]
    fn temperatures_pack_seven_per_frame() {
        let mut slot = Response::<CellTemperatures>::default();
        assert!(slot.value_mut().set_count(9));
        assert_eq!(slot.value().expected_frames(), 2);
        slot.request();
        assert!(!slot.accept(&frame(0x96, [1, 60, 61, 62, 63, 64, 65, 66])));
        assert!(slot.accept(&frame(0x96, [2, 67, 68, 0, 0, 0, 0, 0])));
        let temps = slot.get().expect("complete");
        assert_eq!(temps.values, vec![20, 21, 22, 23, 24, 25, 26, 27, 28]);
    }

    #[test]
    fn balances_are_single_frame_bits() {
        let mut slot = Response::<CellBalances>::default();
        assert!(slot.value_mut().set_count(10));
        slot.request();
        assert!(slot.accept(&frame(0x97, [0b0000_0101, 0b0000_0010, 0, 0, 0, 0, 0, 0])));
        let balances = slot.get().expect("complete");
        assert_eq!(
            balances.states,
            vec![true, false, true, false, false, false, false, false, false, true]
        );
    }

    #[test]
    fn failure_status_maps_bits_to_descriptions() {
        let mut slot = Response::<FailureStatus>::default();
        slot.request();
        // Bits 0 and 9 set; "show" indicator present.
        assert!(slot.accept(&frame(0x98, [0b0000_0001, 0b0000_0010, 0, 0, 0, 0, 0, 0x03])));
        let failures = slot.get().expect("complete");
        assert_eq!(failures.count, 2);
        assert!(failures.show);
        assert_eq!(
            failures.active(),
            vec!["Cell voltage high level 1", "Charge temperature high level 2"]
        );
    }

    #[test]
    fn version_strings_concatenate_pages() {
        let mut slot = Response::<SoftwareVersion>::default();
        slot.request();
        assert!(!slot.accept(&frame(0x62, [1, b' ', b'v', b'1', b'.', b'2', b'.', b'3'])));
        assert!(slot.accept(&frame(0x62, [2, b'-', b'r', b'c', b'1', b' ', b' ', b' '])));
        assert_eq!(slot.get().expect("complete").text, "v1.2.3-rc1");
    }

    #[test]
    fn mosfet_requests_place_selector_at_offset_four() {
        let on = mosfet_charge_request(true);
        assert_eq!(on.command(), 0xDA);
        assert_eq!(on.u8_at(4), 1);
        assert!(on.is_valid());
        let off = mosfet_discharge_request(false);
        assert_eq!(off.command(), 0xD9);
        assert_eq!(off.u8_at(4), 0);
        assert!(off.is_valid());
    }
}
