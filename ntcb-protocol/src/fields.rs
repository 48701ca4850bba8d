//! FLEX telemetry field table and record decoding.
//!
//! Every field has a fixed width and decode rule. A record is the
//! concatenation of the active fields in ascending field-number order.

use chrono::{DateTime, TimeZone, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// How a field's bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    MsgNumber,
    EventCode,
    EventTime,
    DeviceStatus,
    ModuleStatus,
    GsmSignal,
    NavigationStatus,
    LastFixTime,
    Latitude,
    Longitude,
    Altitude,
    Speed,
    Course,
    Mileage,
    LastSegment,
    SegmentDuration,
    SegmentValidDuration,
    Voltage,
    DiscreteBank,
    PulseCounter,
    Frequency,
    EngineHours,
    FuelLevel,
}

/// One entry of the field table.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// 1-based field number as used in the bitmask.
    pub number: u16,
    /// Stable name used as the record key.
    pub name: &'static str,
    /// Encoded width in bytes.
    pub width: usize,
    pub kind: FieldKind,
}

const fn spec(number: u16, name: &'static str, width: usize, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        number,
        name,
        width,
        kind,
    }
}

/// Known FLEX fields, indexed by `number - 1`.
pub const FIELD_TABLE: [FieldSpec; 40] = [
    spec(1, "msg_number", 4, FieldKind::MsgNumber),
    spec(2, "event_code", 2, FieldKind::EventCode),
    spec(3, "event_time", 4, FieldKind::EventTime),
    spec(4, "device_status", 1, FieldKind::DeviceStatus),
    spec(5, "module_status_1", 1, FieldKind::ModuleStatus),
    spec(6, "module_status_2", 1, FieldKind::ModuleStatus),
    spec(7, "gsm_signal", 1, FieldKind::GsmSignal),
    spec(8, "nav_status", 1, FieldKind::NavigationStatus),
    spec(9, "last_fix_time", 4, FieldKind::LastFixTime),
    spec(10, "latitude", 4, FieldKind::Latitude),
    spec(11, "longitude", 4, FieldKind::Longitude),
    spec(12, "altitude_m", 4, FieldKind::Altitude),
    spec(13, "speed_kmh", 4, FieldKind::Speed),
    spec(14, "course_deg", 2, FieldKind::Course),
    spec(15, "mileage_km", 4, FieldKind::Mileage),
    spec(16, "last_segment_km", 4, FieldKind::LastSegment),
    spec(17, "segment_duration_s", 2, FieldKind::SegmentDuration),
    spec(18, "segment_valid_duration_s", 2, FieldKind::SegmentValidDuration),
    spec(19, "power_voltage", 2, FieldKind::Voltage),
    spec(20, "battery_voltage", 2, FieldKind::Voltage),
    spec(21, "analog_in_1", 2, FieldKind::Voltage),
    spec(22, "analog_in_2", 2, FieldKind::Voltage),
    spec(23, "analog_in_3", 2, FieldKind::Voltage),
    spec(24, "analog_in_4", 2, FieldKind::Voltage),
    spec(25, "analog_in_5", 2, FieldKind::Voltage),
    spec(26, "analog_in_6", 2, FieldKind::Voltage),
    spec(27, "analog_in_7", 2, FieldKind::Voltage),
    spec(28, "analog_in_8", 2, FieldKind::Voltage),
    spec(29, "inputs_1_8", 1, FieldKind::DiscreteBank),
    spec(30, "inputs_9_16", 1, FieldKind::DiscreteBank),
    spec(31, "outputs_1_8", 1, FieldKind::DiscreteBank),
    spec(32, "outputs_9_16", 1, FieldKind::DiscreteBank),
    spec(33, "pulse_counter_1", 4, FieldKind::PulseCounter),
    spec(34, "pulse_counter_2", 4, FieldKind::PulseCounter),
    spec(35, "frequency_1_hz", 2, FieldKind::Frequency),
    spec(36, "frequency_2_hz", 2, FieldKind::Frequency),
    spec(37, "engine_hours", 4, FieldKind::EngineHours),
    spec(38, "fuel_level_1", 2, FieldKind::FuelLevel),
    spec(39, "fuel_level_2", 2, FieldKind::FuelLevel),
    spec(40, "fuel_level_3", 2, FieldKind::FuelLevel),
];

/// Look up a field by its 1-based number.
pub fn field_spec(number: u16) -> Option<&'static FieldSpec> {
    if number == 0 {
        return None;
    }
    FIELD_TABLE.get(number as usize - 1)
}

/// Seconds since the Unix epoch as sent by the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub u32);

impl Timestamp {
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.0 as i64, 0).single()
    }
}

/// Two-bit work mode carried in the device status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    Parking,
    Moving,
    Tracking,
    Reserved,
}

/// Field #4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub test_mode: bool,
    pub alarm_armed: bool,
    pub alarm_active: bool,
    pub work_mode: WorkMode,
    pub evacuation: bool,
    pub power_save: bool,
    pub accelerometer_calibrated: bool,
}

impl From<u8> for DeviceStatus {
    fn from(b: u8) -> Self {
        let work_mode = match (b >> 3) & 0x03 {
            0 => WorkMode::Parking,
            1 => WorkMode::Moving,
            2 => WorkMode::Tracking,
            _ => WorkMode::Reserved,
        };
        Self {
            test_mode: b & 0x01 != 0,
            alarm_armed: b & 0x02 != 0,
            alarm_active: b & 0x04 != 0,
            work_mode,
            evacuation: b & 0x20 != 0,
            power_save: b & 0x40 != 0,
            accelerometer_calibrated: b & 0x80 != 0,
        }
    }
}

/// Fields #5 and #6: per-module status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ModuleStatus(pub u8);

impl ModuleStatus {
    pub fn bit(self, n: u8) -> bool {
        n < 8 && self.0 & (1 << n) != 0
    }
}

/// Field #7.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GsmSignal {
    NoNetwork,
    Percent(f32),
}

impl From<u8> for GsmSignal {
    fn from(b: u8) -> Self {
        if b == 99 {
            GsmSignal::NoNetwork
        } else {
            GsmSignal::Percent(b.min(31) as f32 * 100.0 / 31.0)
        }
    }
}

/// Field #8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NavigationStatus {
    pub enabled: bool,
    pub fix_valid: bool,
    pub satellites: u8,
}

impl From<u8> for NavigationStatus {
    fn from(b: u8) -> Self {
        Self {
            enabled: b & 0x01 != 0,
            fix_valid: b & 0x02 != 0,
            satellites: b >> 2,
        }
    }
}

/// Fields #29 to #32: eight discrete lines, bit 0 is the lowest-numbered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DiscreteBank(pub [bool; 8]);

impl From<u8> for DiscreteBank {
    fn from(b: u8) -> Self {
        let mut lines = [false; 8];
        for (i, line) in lines.iter_mut().enumerate() {
            *line = b & (1 << i) != 0;
        }
        DiscreteBank(lines)
    }
}

/// Fields #38 to #40.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FuelLevel {
    Level(u16),
    /// Values 65500 and above are sensor error codes.
    Error(u16),
}

impl From<u16> for FuelLevel {
    fn from(v: u16) -> Self {
        if v >= 65500 {
            FuelLevel::Error(v)
        } else {
            FuelLevel::Level(v)
        }
    }
}

/// A decoded field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    MsgNumber(u32),
    EventCode(u16),
    EventTime(Timestamp),
    DeviceStatus(DeviceStatus),
    ModuleStatus(ModuleStatus),
    Gsm(GsmSignal),
    Navigation(NavigationStatus),
    LastFixTime(Timestamp),
    /// Degrees.
    Latitude(f64),
    /// Degrees.
    Longitude(f64),
    AltitudeM(f64),
    SpeedKmh(f32),
    CourseDeg(u16),
    MileageKm(f32),
    LastSegmentKm(f32),
    SegmentSeconds(u16),
    ValidSegmentSeconds(u16),
    Volts(f32),
    Discrete(DiscreteBank),
    Pulses(u32),
    FrequencyHz(u16),
    EngineHours(f64),
    Fuel(FuelLevel),
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_i32(b: &[u8]) -> i32 {
    i32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_f32(b: &[u8]) -> f32 {
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

impl FieldKind {
    /// Decode exactly `width` bytes of this kind.
    fn decode(self, b: &[u8]) -> FieldValue {
        match self {
            FieldKind::MsgNumber => FieldValue::MsgNumber(le_u32(b)),
            FieldKind::EventCode => FieldValue::EventCode(le_u16(b)),
            FieldKind::EventTime => FieldValue::EventTime(Timestamp(le_u32(b))),
            FieldKind::DeviceStatus => FieldValue::DeviceStatus(DeviceStatus::from(b[0])),
            FieldKind::ModuleStatus => FieldValue::ModuleStatus(ModuleStatus(b[0])),
            FieldKind::GsmSignal => FieldValue::Gsm(GsmSignal::from(b[0])),
            FieldKind::NavigationStatus => FieldValue::Navigation(NavigationStatus::from(b[0])),
            FieldKind::LastFixTime => FieldValue::LastFixTime(Timestamp(le_u32(b))),
            FieldKind::Latitude => FieldValue::Latitude(le_i32(b) as f64 / 600000.0),
            FieldKind::Longitude => FieldValue::Longitude(le_i32(b) as f64 / 600000.0),
            FieldKind::Altitude => FieldValue::AltitudeM(le_i32(b) as f64 / 10.0),
            FieldKind::Speed => FieldValue::SpeedKmh(le_f32(b)),
            FieldKind::Course => FieldValue::CourseDeg(le_u16(b)),
            FieldKind::Mileage => FieldValue::MileageKm(le_f32(b)),
            FieldKind::LastSegment => FieldValue::LastSegmentKm(le_f32(b)),
            FieldKind::SegmentDuration => FieldValue::SegmentSeconds(le_u16(b)),
            FieldKind::SegmentValidDuration => FieldValue::ValidSegmentSeconds(le_u16(b)),
            FieldKind::Voltage => FieldValue::Volts(le_u16(b) as f32 / 1000.0),
            FieldKind::DiscreteBank => FieldValue::Discrete(DiscreteBank::from(b[0])),
            FieldKind::PulseCounter => FieldValue::Pulses(le_u32(b)),
            FieldKind::Frequency => FieldValue::FrequencyHz(le_u16(b)),
            FieldKind::EngineHours => FieldValue::EngineHours(le_u32(b) as f64 / 3600.0),
            FieldKind::FuelLevel => FieldValue::Fuel(FuelLevel::from(le_u16(b))),
        }
    }
}

/// One decoded field of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedField {
    pub number: u16,
    pub name: &'static str,
    pub value: FieldValue,
}

/// A decoded telemetry record, fields in ascending field-number order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryRecord {
    fields: Vec<DecodedField>,
}

impl TelemetryRecord {
    pub fn fields(&self) -> &[DecodedField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn field(&self, number: u16) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|f| f.number == number)
            .map(|f| &f.value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for TelemetryRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for field in &self.fields {
            map.serialize_entry(field.name, &field.value)?;
        }
        map.end()
    }
}

/// Decode one record laid out according to `active_fields`.
///
/// Fields that do not fit in `raw` are left out, but the cursor still moves
/// past them so later fields stay aligned. Decoding stops at the first field
/// number missing from the table.
pub fn decode_record(raw: &[u8], active_fields: &[u16]) -> TelemetryRecord {
    let mut fields = Vec::with_capacity(active_fields.len());
    let mut cursor = 0usize;

    for &number in active_fields {
        let Some(spec) = field_spec(number) else {
            break;
        };
        let end = cursor + spec.width;
        if let Some(bytes) = raw.get(cursor..end) {
            fields.push(DecodedField {
                number,
                name: spec.name,
                value: spec.kind.decode(bytes),
            });
        }
        cursor = end;
    }

    TelemetryRecord { fields }
}
