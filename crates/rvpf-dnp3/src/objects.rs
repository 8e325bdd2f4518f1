use bytes::{BufMut, BytesMut};

use rvpf_core::{ProtocolError, Value};

/// Object groups of the catalog. Codes are the on-wire group numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Group {
    DeviceAttributes = 0,
    BinaryInput = 1,
    BinaryOutputStatus = 10,
    BinaryOutputCommand = 12,
    Counter = 20,
    AnalogInput = 30,
    AnalogOutput = 41,
    Time = 50,
    ClassData = 60,
    InternalIndications = 80,
}

impl Group {
    pub fn from_code(code: u8) -> Option<Group> {
        match code {
            0 => Some(Group::DeviceAttributes),
            1 => Some(Group::BinaryInput),
            10 => Some(Group::BinaryOutputStatus),
            12 => Some(Group::BinaryOutputCommand),
            20 => Some(Group::Counter),
            30 => Some(Group::AnalogInput),
            41 => Some(Group::AnalogOutput),
            50 => Some(Group::Time),
            60 => Some(Group::ClassData),
            80 => Some(Group::InternalIndications),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Index prefix carried before each object instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrefixCode {
    None = 0,
    Index1 = 1,
    Index2 = 2,
    Index4 = 3,
    Size1 = 4,
}

/// Range descriptor layout following the object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RangeCode {
    StartStop1 = 0x0,
    StartStop2 = 0x1,
    StartStop4 = 0x2,
    All = 0x6,
    Count1 = 0x7,
    Count2 = 0x8,
    Count4 = 0x9,
    FreeFormat = 0xB,
}

impl RangeCode {
    fn from_code(code: u8) -> Option<RangeCode> {
        match code {
            0x0 => Some(RangeCode::StartStop1),
            0x1 => Some(RangeCode::StartStop2),
            0x2 => Some(RangeCode::StartStop4),
            0x6 => Some(RangeCode::All),
            0x7 => Some(RangeCode::Count1),
            0x8 => Some(RangeCode::Count2),
            0x9 => Some(RangeCode::Count4),
            0xB => Some(RangeCode::FreeFormat),
            _ => None,
        }
    }
}

impl PrefixCode {
    fn from_code(code: u8) -> Option<PrefixCode> {
        match code {
            0 => Some(PrefixCode::None),
            1 => Some(PrefixCode::Index1),
            2 => Some(PrefixCode::Index2),
            3 => Some(PrefixCode::Index4),
            4 => Some(PrefixCode::Size1),
            _ => None,
        }
    }

    pub(crate) fn encoded_width(self) -> usize {
        match self {
            PrefixCode::None => 0,
            PrefixCode::Index1 | PrefixCode::Size1 => 1,
            PrefixCode::Index2 => 2,
            PrefixCode::Index4 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qualifier {
    pub prefix: PrefixCode,
    pub range: RangeCode,
}

impl Qualifier {
    pub fn byte(self) -> u8 {
        ((self.prefix as u8) << 4) | self.range as u8
    }

    pub fn from_byte(byte: u8) -> Result<Qualifier, ProtocolError> {
        let prefix = PrefixCode::from_code(byte >> 4)
            .ok_or(ProtocolError::TransportDesync)?;
        let range =
            RangeCode::from_code(byte & 0x0F).ok_or(ProtocolError::TransportDesync)?;
        Ok(Qualifier { prefix, range })
    }
}

/// Decoded range of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    StartStop { start: u32, stop: u32 },
    Count(u32),
    All,
}

impl Range {
    pub fn count(self) -> usize {
        match self {
            Range::StartStop { start, stop } => (stop.saturating_sub(start) as usize) + 1,
            Range::Count(n) => n as usize,
            Range::All => 0,
        }
    }

    /// Narrowest qualifier range code able to carry this range.
    pub fn code(self) -> RangeCode {
        match self {
            Range::StartStop { stop, .. } if stop <= 0xFF => RangeCode::StartStop1,
            Range::StartStop { stop, .. } if stop <= 0xFFFF => RangeCode::StartStop2,
            Range::StartStop { .. } => RangeCode::StartStop4,
            Range::Count(n) if n <= 0xFF => RangeCode::Count1,
            Range::Count(n) if n <= 0xFFFF => RangeCode::Count2,
            Range::Count(_) => RangeCode::Count4,
            Range::All => RangeCode::All,
        }
    }
}

/// Header of one item in an application fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub group: u8,
    pub variation: u8,
    pub qualifier: Qualifier,
    pub range: Range,
}

/// One decoded object instance. The variant carries the on-wire layout's
/// fields; unknown `(group, variation)` pairs are preserved opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectInstance {
    BinaryInputPacked { value: bool },
    BinaryInputFlags { flags: u8 },
    BinaryOutputFlags { flags: u8 },
    ControlRelayOutputBlock {
        code: u8,
        count: u8,
        on_time_ms: u32,
        off_time_ms: u32,
        status: u8,
    },
    Counter32 { value: u32, flags: u8 },
    Counter16 { value: u16, flags: u8 },
    Counter32NoFlag { value: u32 },
    Counter16NoFlag { value: u16 },
    AnalogInput32 { value: i32, flags: u8 },
    AnalogInput16 { value: i16, flags: u8 },
    AnalogInput32NoFlag { value: i32 },
    AnalogInput16NoFlag { value: i16 },
    AnalogInputFloat { value: f32, flags: u8 },
    AnalogInputDouble { value: f64, flags: u8 },
    AnalogOutput32 { value: i32, status: u8 },
    AnalogOutput16 { value: i16, status: u8 },
    AnalogOutputFloat { value: f32, status: u8 },
    AnalogOutputDouble { value: f64, status: u8 },
    /// Absolute time, milliseconds since 1970-01-01, 48 bits.
    TimeAndDate { millis: u64 },
    InternalIndicationBit { value: bool },
    Opaque { group: u8, variation: u8, bytes: Vec<u8> },
}

/// Point state flag: device considers the value current.
pub const FLAG_ONLINE: u8 = 0x01;
/// Binary state bit inside a flags byte.
pub const FLAG_STATE: u8 = 0x80;

/// Control code for a latching relay close.
pub const CROB_LATCH_ON: u8 = 0x03;
/// Control code for a latching relay trip.
pub const CROB_LATCH_OFF: u8 = 0x04;

impl ObjectInstance {
    pub fn group_variation(&self) -> (u8, u8) {
        match self {
            ObjectInstance::BinaryInputPacked { .. } => (1, 1),
            ObjectInstance::BinaryInputFlags { .. } => (1, 2),
            ObjectInstance::BinaryOutputFlags { .. } => (10, 2),
            ObjectInstance::ControlRelayOutputBlock { .. } => (12, 1),
            ObjectInstance::Counter32 { .. } => (20, 1),
            ObjectInstance::Counter16 { .. } => (20, 2),
            ObjectInstance::Counter32NoFlag { .. } => (20, 5),
            ObjectInstance::Counter16NoFlag { .. } => (20, 6),
            ObjectInstance::AnalogInput32 { .. } => (30, 1),
            ObjectInstance::AnalogInput16 { .. } => (30, 2),
            ObjectInstance::AnalogInput32NoFlag { .. } => (30, 3),
            ObjectInstance::AnalogInput16NoFlag { .. } => (30, 4),
            ObjectInstance::AnalogInputFloat { .. } => (30, 5),
            ObjectInstance::AnalogInputDouble { .. } => (30, 6),
            ObjectInstance::AnalogOutput32 { .. } => (41, 1),
            ObjectInstance::AnalogOutput16 { .. } => (41, 2),
            ObjectInstance::AnalogOutputFloat { .. } => (41, 3),
            ObjectInstance::AnalogOutputDouble { .. } => (41, 4),
            ObjectInstance::TimeAndDate { .. } => (50, 1),
            ObjectInstance::InternalIndicationBit { .. } => (80, 1),
            ObjectInstance::Opaque { group, variation, .. } => (*group, *variation),
        }
    }

    /// Materialize a typed value, or `UnsupportedObject` when the layout
    /// carries none the caller can use.
    pub fn value(&self) -> Result<Value, ProtocolError> {
        match self {
            ObjectInstance::BinaryInputPacked { value }
            | ObjectInstance::InternalIndicationBit { value } => Ok(Value::Bool(*value)),
            ObjectInstance::BinaryInputFlags { flags }
            | ObjectInstance::BinaryOutputFlags { flags } => {
                Ok(Value::Bool(flags & FLAG_STATE != 0))
            }
            ObjectInstance::ControlRelayOutputBlock { code, .. } => {
                Ok(Value::Bool(code & 0x0F == CROB_LATCH_ON))
            }
            ObjectInstance::Counter32 { value, .. } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::Counter16 { value, .. } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::Counter32NoFlag { value } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::Counter16NoFlag { value } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::AnalogInput32 { value, .. } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::AnalogInput16 { value, .. } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::AnalogInput32NoFlag { value } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::AnalogInput16NoFlag { value } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::AnalogInputFloat { value, .. } => {
                Ok(Value::Double(f64::from(*value)))
            }
            ObjectInstance::AnalogInputDouble { value, .. } => Ok(Value::Double(*value)),
            ObjectInstance::AnalogOutput32 { value, .. } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::AnalogOutput16 { value, .. } => Ok(Value::Long(i64::from(*value))),
            ObjectInstance::AnalogOutputFloat { value, .. } => {
                Ok(Value::Double(f64::from(*value)))
            }
            ObjectInstance::AnalogOutputDouble { value, .. } => Ok(Value::Double(*value)),
            ObjectInstance::TimeAndDate { millis } => Ok(Value::Long(*millis as i64)),
            ObjectInstance::Opaque { group, variation, .. } => {
                Err(ProtocolError::UnsupportedObject {
                    group: *group,
                    variation: *variation,
                })
            }
        }
    }

    /// Echoed status of a control or output object, if the layout has one.
    pub fn control_status(&self) -> Option<u8> {
        match self {
            ObjectInstance::ControlRelayOutputBlock { status, .. }
            | ObjectInstance::AnalogOutput32 { status, .. }
            | ObjectInstance::AnalogOutput16 { status, .. }
            | ObjectInstance::AnalogOutputFloat { status, .. }
            | ObjectInstance::AnalogOutputDouble { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            // Packed variants are emitted by the item encoder.
            ObjectInstance::BinaryInputPacked { .. }
            | ObjectInstance::InternalIndicationBit { .. } => {}
            ObjectInstance::BinaryInputFlags { flags }
            | ObjectInstance::BinaryOutputFlags { flags } => dst.put_u8(*flags),
            ObjectInstance::ControlRelayOutputBlock {
                code,
                count,
                on_time_ms,
                off_time_ms,
                status,
            } => {
                dst.put_u8(*code);
                dst.put_u8(*count);
                dst.put_u32_le(*on_time_ms);
                dst.put_u32_le(*off_time_ms);
                dst.put_u8(*status);
            }
            ObjectInstance::Counter32 { value, flags } => {
                dst.put_u8(*flags);
                dst.put_u32_le(*value);
            }
            ObjectInstance::Counter16 { value, flags } => {
                dst.put_u8(*flags);
                dst.put_u16_le(*value);
            }
            ObjectInstance::Counter32NoFlag { value } => dst.put_u32_le(*value),
            ObjectInstance::Counter16NoFlag { value } => dst.put_u16_le(*value),
            ObjectInstance::AnalogInput32 { value, flags } => {
                dst.put_u8(*flags);
                dst.put_i32_le(*value);
            }
            ObjectInstance::AnalogInput16 { value, flags } => {
                dst.put_u8(*flags);
                dst.put_i16_le(*value);
            }
            ObjectInstance::AnalogInput32NoFlag { value } => dst.put_i32_le(*value),
            ObjectInstance::AnalogInput16NoFlag { value } => dst.put_i16_le(*value),
            ObjectInstance::AnalogInputFloat { value, flags } => {
                dst.put_u8(*flags);
                dst.put_f32_le(*value);
            }
            ObjectInstance::AnalogInputDouble { value, flags } => {
                dst.put_u8(*flags);
                dst.put_f64_le(*value);
            }
            ObjectInstance::AnalogOutput32 { value, status } => {
                dst.put_i32_le(*value);
                dst.put_u8(*status);
            }
            ObjectInstance::AnalogOutput16 { value, status } => {
                dst.put_i16_le(*value);
                dst.put_u8(*status);
            }
            ObjectInstance::AnalogOutputFloat { value, status } => {
                dst.put_f32_le(*value);
                dst.put_u8(*status);
            }
            ObjectInstance::AnalogOutputDouble { value, status } => {
                dst.put_f64_le(*value);
                dst.put_u8(*status);
            }
            ObjectInstance::TimeAndDate { millis } => {
                dst.put_slice(&millis.to_le_bytes()[..6]);
            }
            ObjectInstance::Opaque { bytes, .. } => dst.put_slice(bytes),
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            ObjectInstance::BinaryInputPacked { .. }
            | ObjectInstance::InternalIndicationBit { .. } => 0,
            ObjectInstance::BinaryInputFlags { .. }
            | ObjectInstance::BinaryOutputFlags { .. } => 1,
            ObjectInstance::ControlRelayOutputBlock { .. } => 11,
            ObjectInstance::Counter32 { .. } => 5,
            ObjectInstance::Counter16 { .. } => 3,
            ObjectInstance::Counter32NoFlag { .. } => 4,
            ObjectInstance::Counter16NoFlag { .. } => 2,
            ObjectInstance::AnalogInput32 { .. } => 5,
            ObjectInstance::AnalogInput16 { .. } => 3,
            ObjectInstance::AnalogInput32NoFlag { .. } => 4,
            ObjectInstance::AnalogInput16NoFlag { .. } => 2,
            ObjectInstance::AnalogInputFloat { .. } => 5,
            ObjectInstance::AnalogInputDouble { .. } => 9,
            ObjectInstance::AnalogOutput32 { .. } => 5,
            ObjectInstance::AnalogOutput16 { .. } => 3,
            ObjectInstance::AnalogOutputFloat { .. } => 5,
            ObjectInstance::AnalogOutputDouble { .. } => 9,
            ObjectInstance::TimeAndDate { .. } => 6,
            ObjectInstance::Opaque { bytes, .. } => bytes.len(),
        }
    }
}

/// On-wire layout class of a variation.
#[derive(Clone, Copy)]
pub enum Layout {
    /// Fixed byte count per instance, decoded by the entry's function.
    Fixed(usize, fn(&[u8]) -> ObjectInstance),
    /// One bit per point, packed over the item's range.
    PackedBits,
    /// Header only, no instance payload (class data).
    HeaderOnly,
}

/// Static variation dispatch: `(group, variation)` to layout and decoder.
pub const VARIATION_TABLE: &[(u8, u8, Layout)] = &[
    (1, 1, Layout::PackedBits),
    (1, 2, Layout::Fixed(1, |b| ObjectInstance::BinaryInputFlags { flags: b[0] })),
    (10, 2, Layout::Fixed(1, |b| ObjectInstance::BinaryOutputFlags { flags: b[0] })),
    (12, 1, Layout::Fixed(11, |b| ObjectInstance::ControlRelayOutputBlock {
        code: b[0],
        count: b[1],
        on_time_ms: u32::from_le_bytes([b[2], b[3], b[4], b[5]]),
        off_time_ms: u32::from_le_bytes([b[6], b[7], b[8], b[9]]),
        status: b[10],
    })),
    (20, 1, Layout::Fixed(5, |b| ObjectInstance::Counter32 {
        flags: b[0],
        value: u32::from_le_bytes([b[1], b[2], b[3], b[4]]),
    })),
    (20, 2, Layout::Fixed(3, |b| ObjectInstance::Counter16 {
        flags: b[0],
        value: u16::from_le_bytes([b[1], b[2]]),
    })),
    (20, 5, Layout::Fixed(4, |b| ObjectInstance::Counter32NoFlag {
        value: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
    })),
    (20, 6, Layout::Fixed(2, |b| ObjectInstance::Counter16NoFlag {
        value: u16::from_le_bytes([b[0], b[1]]),
    })),
    (30, 1, Layout::Fixed(5, |b| ObjectInstance::AnalogInput32 {
        flags: b[0],
        value: i32::from_le_bytes([b[1], b[2], b[3], b[4]]),
    })),
    (30, 2, Layout::Fixed(3, |b| ObjectInstance::AnalogInput16 {
        flags: b[0],
        value: i16::from_le_bytes([b[1], b[2]]),
    })),
    (30, 3, Layout::Fixed(4, |b| ObjectInstance::AnalogInput32NoFlag {
        value: i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
    })),
    (30, 4, Layout::Fixed(2, |b| ObjectInstance::AnalogInput16NoFlag {
        value: i16::from_le_bytes([b[0], b[1]]),
    })),
    (30, 5, Layout::Fixed(5, |b| ObjectInstance::AnalogInputFloat {
        flags: b[0],
        value: f32::from_le_bytes([b[1], b[2], b[3], b[4]]),
    })),
    (30, 6, Layout::Fixed(9, |b| ObjectInstance::AnalogInputDouble {
        flags: b[0],
        value: f64::from_le_bytes([b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8]]),
    })),
    (41, 1, Layout::Fixed(5, |b| ObjectInstance::AnalogOutput32 {
        value: i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        status: b[4],
    })),
    (41, 2, Layout::Fixed(3, |b| ObjectInstance::AnalogOutput16 {
        value: i16::from_le_bytes([b[0], b[1]]),
        status: b[2],
    })),
    (41, 3, Layout::Fixed(5, |b| ObjectInstance::AnalogOutputFloat {
        value: f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        status: b[4],
    })),
    (41, 4, Layout::Fixed(9, |b| ObjectInstance::AnalogOutputDouble {
        value: f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        status: b[8],
    })),
    (50, 1, Layout::Fixed(6, |b| ObjectInstance::TimeAndDate {
        millis: u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], 0, 0]),
    })),
    (60, 1, Layout::HeaderOnly),
    (60, 2, Layout::HeaderOnly),
    (60, 3, Layout::HeaderOnly),
    (60, 4, Layout::HeaderOnly),
    (80, 1, Layout::PackedBits),
];

pub fn find_layout(group: u8, variation: u8) -> Option<Layout> {
    VARIATION_TABLE
        .iter()
        .find(|(g, v, _)| *g == group && *v == variation)
        .map(|(_, _, layout)| *layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_codes_round_trip() {
        for code in [0u8, 1, 10, 12, 20, 30, 41, 50, 60, 80] {
            assert_eq!(Group::from_code(code).unwrap().code(), code);
        }
        assert!(Group::from_code(99).is_none());
    }

    #[test]
    fn qualifier_byte_round_trip() {
        let qualifier = Qualifier {
            prefix: PrefixCode::Index2,
            range: RangeCode::Count2,
        };
        assert_eq!(qualifier.byte(), 0x28);
        assert_eq!(Qualifier::from_byte(0x28).unwrap(), qualifier);
        assert!(Qualifier::from_byte(0xF5).is_err());
    }

    #[test]
    fn range_picks_narrowest_code() {
        assert_eq!(Range::StartStop { start: 3, stop: 3 }.code(), RangeCode::StartStop1);
        assert_eq!(
            Range::StartStop { start: 0, stop: 300 }.code(),
            RangeCode::StartStop2
        );
        assert_eq!(Range::Count(70_000).code(), RangeCode::Count4);
        assert_eq!(Range::All.code(), RangeCode::All);
    }

    #[test]
    fn instances_encode_to_declared_size() {
        let samples: Vec<ObjectInstance> = vec![
            ObjectInstance::BinaryInputFlags { flags: FLAG_ONLINE | FLAG_STATE },
            ObjectInstance::ControlRelayOutputBlock {
                code: CROB_LATCH_ON,
                count: 1,
                on_time_ms: 0,
                off_time_ms: 0,
                status: 0,
            },
            ObjectInstance::Counter32 { value: 9, flags: FLAG_ONLINE },
            ObjectInstance::AnalogInput16 { value: 1234, flags: FLAG_ONLINE },
            ObjectInstance::AnalogInputDouble { value: 2.5, flags: FLAG_ONLINE },
            ObjectInstance::AnalogOutput32 { value: -7, status: 0 },
            ObjectInstance::TimeAndDate { millis: 0x0102030405 },
        ];
        for instance in samples {
            let mut buf = BytesMut::new();
            instance.encode(&mut buf);
            assert_eq!(buf.len(), instance.encoded_size(), "{instance:?}");
        }
    }

    #[test]
    fn fixed_layout_round_trip() {
        let original = ObjectInstance::AnalogInput16 { value: 1234, flags: FLAG_ONLINE };
        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        let Layout::Fixed(size, decode) = find_layout(30, 2).unwrap() else {
            panic!("group 30 variation 2 must be fixed layout");
        };
        assert_eq!(size, buf.len());
        assert_eq!(decode(&buf), original);
    }

    #[test]
    fn unknown_variation_surfaces_unsupported_object() {
        let opaque = ObjectInstance::Opaque {
            group: 34,
            variation: 1,
            bytes: vec![0xAB],
        };
        assert_eq!(
            opaque.value(),
            Err(ProtocolError::UnsupportedObject { group: 34, variation: 1 })
        );
        assert!(find_layout(34, 1).is_none());
    }

    #[test]
    fn crob_value_reflects_latch_code() {
        let on = ObjectInstance::ControlRelayOutputBlock {
            code: CROB_LATCH_ON,
            count: 1,
            on_time_ms: 0,
            off_time_ms: 0,
            status: 0,
        };
        assert_eq!(on.value().unwrap(), Value::Bool(true));
    }
}
