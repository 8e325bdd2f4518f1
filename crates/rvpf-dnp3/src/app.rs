use bytes::{BufMut, BytesMut};

use rvpf_core::ProtocolError;

use crate::objects::{
    find_layout, Layout, ObjectHeader, ObjectInstance, PrefixCode, Qualifier, Range, RangeCode,
};

/// Application control byte: `FIR<<7 | FIN<<6 | CON<<5 | UNS<<4 | seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppControl {
    pub fir: bool,
    pub fin: bool,
    pub con: bool,
    pub uns: bool,
    pub seq: u8,
}

impl AppControl {
    pub fn byte(self) -> u8 {
        (u8::from(self.fir) << 7)
            | (u8::from(self.fin) << 6)
            | (u8::from(self.con) << 5)
            | (u8::from(self.uns) << 4)
            | (self.seq & 0x0F)
    }

    pub fn from_byte(byte: u8) -> AppControl {
        AppControl {
            fir: byte & 0x80 != 0,
            fin: byte & 0x40 != 0,
            con: byte & 0x20 != 0,
            uns: byte & 0x10 != 0,
            seq: byte & 0x0F,
        }
    }
}

/// Next 4-bit sequence value.
pub fn next_app_seq(seq: u8) -> u8 {
    (seq + 1) & 0x0F
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    Confirm = 0,
    Read = 1,
    Write = 2,
    Select = 3,
    Operate = 4,
    DirectOperate = 5,
    ColdRestart = 13,
    WarmRestart = 14,
    EnableUnsolicited = 20,
    DisableUnsolicited = 21,
    Response = 129,
    UnsolicitedResponse = 130,
}

impl FunctionCode {
    pub fn from_code(code: u8) -> Option<FunctionCode> {
        match code {
            0 => Some(FunctionCode::Confirm),
            1 => Some(FunctionCode::Read),
            2 => Some(FunctionCode::Write),
            3 => Some(FunctionCode::Select),
            4 => Some(FunctionCode::Operate),
            5 => Some(FunctionCode::DirectOperate),
            13 => Some(FunctionCode::ColdRestart),
            14 => Some(FunctionCode::WarmRestart),
            20 => Some(FunctionCode::EnableUnsolicited),
            21 => Some(FunctionCode::DisableUnsolicited),
            129 => Some(FunctionCode::Response),
            130 => Some(FunctionCode::UnsolicitedResponse),
            _ => None,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            FunctionCode::Response | FunctionCode::UnsolicitedResponse
        )
    }

    /// Whether items of this function carry instance payloads. Read-style
    /// requests address objects by header and range only.
    pub fn carries_payload(self) -> bool {
        !matches!(
            self,
            FunctionCode::Read
                | FunctionCode::EnableUnsolicited
                | FunctionCode::DisableUnsolicited
        )
    }
}

/// The two internal-indication bytes carried by responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InternalIndications(pub u16);

impl InternalIndications {
    pub const DEVICE_RESTART: u16 = 0x8000;
    pub const DEVICE_TROUBLE: u16 = 0x4000;
    pub const NO_FUNC_CODE_SUPPORT: u16 = 0x0001;
    pub const OBJECT_UNKNOWN: u16 = 0x0002;
    pub const PARAMETER_ERROR: u16 = 0x0004;

    pub fn bytes(self) -> [u8; 2] {
        [(self.0 >> 8) as u8, self.0 as u8]
    }

    pub fn from_bytes(first: u8, second: u8) -> InternalIndications {
        InternalIndications((u16::from(first) << 8) | u16::from(second))
    }

    pub fn contains(self, mask: u16) -> bool {
        self.0 & mask != 0
    }
}

/// Bounds-checked cursor over a fragment payload.
struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        SliceReader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::TransportDesync);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// One item of a fragment: object header plus decoded instances and the
/// per-instance indices they address.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectItem {
    pub header: ObjectHeader,
    pub indices: Vec<u32>,
    pub instances: Vec<ObjectInstance>,
}

impl ObjectItem {
    /// Request item addressing an index range, no instance payload.
    pub fn read_range(group: u8, variation: u8, start: u32, stop: u32) -> ObjectItem {
        let range = Range::StartStop { start, stop };
        ObjectItem {
            header: ObjectHeader {
                group,
                variation,
                qualifier: Qualifier {
                    prefix: PrefixCode::None,
                    range: range.code(),
                },
                range,
            },
            indices: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Request item addressing every point of the group.
    pub fn read_all(group: u8, variation: u8) -> ObjectItem {
        ObjectItem {
            header: ObjectHeader {
                group,
                variation,
                qualifier: Qualifier {
                    prefix: PrefixCode::None,
                    range: RangeCode::All,
                },
                range: Range::All,
            },
            indices: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Item carrying instances for a contiguous index run (responses).
    pub fn with_range_instances(
        group: u8,
        variation: u8,
        start: u32,
        instances: Vec<ObjectInstance>,
    ) -> ObjectItem {
        let stop = start + instances.len().saturating_sub(1) as u32;
        let range = Range::StartStop { start, stop };
        ObjectItem {
            header: ObjectHeader {
                group,
                variation,
                qualifier: Qualifier {
                    prefix: PrefixCode::None,
                    range: range.code(),
                },
                range,
            },
            indices: (start..=stop).collect(),
            instances,
        }
    }

    /// Item carrying index-prefixed instances (controls).
    pub fn with_indexed_instances(
        group: u8,
        variation: u8,
        entries: Vec<(u32, ObjectInstance)>,
    ) -> ObjectItem {
        let max_index = entries.iter().map(|(i, _)| *i).max().unwrap_or(0);
        let count = entries.len() as u32;
        let prefix = if max_index <= 0xFF {
            PrefixCode::Index1
        } else if max_index <= 0xFFFF {
            PrefixCode::Index2
        } else {
            PrefixCode::Index4
        };
        let range = Range::Count(count);
        let (indices, instances) = entries.into_iter().unzip();
        ObjectItem {
            header: ObjectHeader {
                group,
                variation,
                qualifier: Qualifier {
                    prefix,
                    range: range.code(),
                },
                range,
            },
            indices,
            instances,
        }
    }

    /// Index of each instance, expanding a start-stop range when the
    /// instances are not prefixed.
    pub fn instance_index(&self, position: usize) -> Option<u32> {
        if let Some(index) = self.indices.get(position) {
            return Some(*index);
        }
        match self.header.range {
            Range::StartStop { start, stop } => {
                let index = start + position as u32;
                (index <= stop).then_some(index)
            }
            _ => None,
        }
    }

    fn range_bytes(&self) -> usize {
        match self.header.qualifier.range {
            RangeCode::StartStop1 => 2,
            RangeCode::StartStop2 => 4,
            RangeCode::StartStop4 => 8,
            RangeCode::Count1 | RangeCode::FreeFormat => 1,
            RangeCode::Count2 => 2,
            RangeCode::Count4 => 4,
            RangeCode::All => 0,
        }
    }

    pub fn encoded_size(&self) -> usize {
        let prefix_bytes = self.header.qualifier.prefix.encoded_width() * self.instances.len();
        let payload: usize = match find_layout(self.header.group, self.header.variation) {
            Some(Layout::PackedBits) => self.instances.len().div_ceil(8),
            _ => self.instances.iter().map(ObjectInstance::encoded_size).sum(),
        };
        3 + self.range_bytes() + prefix_bytes + payload
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.header.group);
        dst.put_u8(self.header.variation);
        dst.put_u8(self.header.qualifier.byte());
        match (self.header.qualifier.range, self.header.range) {
            (RangeCode::StartStop1, Range::StartStop { start, stop }) => {
                dst.put_u8(start as u8);
                dst.put_u8(stop as u8);
            }
            (RangeCode::StartStop2, Range::StartStop { start, stop }) => {
                dst.put_u16_le(start as u16);
                dst.put_u16_le(stop as u16);
            }
            (RangeCode::StartStop4, Range::StartStop { start, stop }) => {
                dst.put_u32_le(start);
                dst.put_u32_le(stop);
            }
            (RangeCode::Count1 | RangeCode::FreeFormat, Range::Count(n)) => dst.put_u8(n as u8),
            (RangeCode::Count2, Range::Count(n)) => dst.put_u16_le(n as u16),
            (RangeCode::Count4, Range::Count(n)) => dst.put_u32_le(n),
            (RangeCode::All, Range::All) => {}
            // Constructors keep qualifier and range consistent.
            (code, range) => unreachable!("range {range:?} under qualifier {code:?}"),
        }

        let packed = matches!(
            find_layout(self.header.group, self.header.variation),
            Some(Layout::PackedBits)
        );
        if packed {
            let mut byte = 0u8;
            for (i, instance) in self.instances.iter().enumerate() {
                let bit = match instance {
                    ObjectInstance::BinaryInputPacked { value }
                    | ObjectInstance::InternalIndicationBit { value } => *value,
                    _ => false,
                };
                if bit {
                    byte |= 1 << (i % 8);
                }
                if i % 8 == 7 {
                    dst.put_u8(byte);
                    byte = 0;
                }
            }
            if !self.instances.is_empty() && self.instances.len() % 8 != 0 {
                dst.put_u8(byte);
            }
            return;
        }

        for (position, instance) in self.instances.iter().enumerate() {
            match self.header.qualifier.prefix {
                PrefixCode::None => {}
                PrefixCode::Index1 => dst.put_u8(self.indices[position] as u8),
                PrefixCode::Index2 => dst.put_u16_le(self.indices[position] as u16),
                PrefixCode::Index4 => dst.put_u32_le(self.indices[position]),
                PrefixCode::Size1 => dst.put_u8(instance.encoded_size() as u8),
            }
            instance.encode(dst);
        }
    }

    fn decode(
        reader: &mut SliceReader<'_>,
        carries_payload: bool,
    ) -> Result<ObjectItem, ProtocolError> {
        let group = reader.u8()?;
        let variation = reader.u8()?;
        let qualifier = Qualifier::from_byte(reader.u8()?)?;
        let range = match qualifier.range {
            RangeCode::StartStop1 => {
                let start = u32::from(reader.u8()?);
                let stop = u32::from(reader.u8()?);
                Range::StartStop { start, stop }
            }
            RangeCode::StartStop2 => {
                let start = u32::from(reader.u16_le()?);
                let stop = u32::from(reader.u16_le()?);
                Range::StartStop { start, stop }
            }
            RangeCode::StartStop4 => Range::StartStop {
                start: reader.u32_le()?,
                stop: reader.u32_le()?,
            },
            RangeCode::Count1 | RangeCode::FreeFormat => Range::Count(u32::from(reader.u8()?)),
            RangeCode::Count2 => Range::Count(u32::from(reader.u16_le()?)),
            RangeCode::Count4 => Range::Count(reader.u32_le()?),
            RangeCode::All => Range::All,
        };
        if let Range::StartStop { start, stop } = range {
            if stop < start {
                return Err(ProtocolError::TransportDesync);
            }
        }
        let header = ObjectHeader { group, variation, qualifier, range };
        let count = header.range.count();

        let mut indices = Vec::new();
        let mut instances = Vec::new();

        if !carries_payload {
            return Ok(ObjectItem { header, indices, instances });
        }

        match find_layout(group, variation) {
            Some(Layout::HeaderOnly) => {}
            Some(Layout::PackedBits) => {
                let bytes = reader.take(count.div_ceil(8))?;
                for position in 0..count {
                    let bit = bytes[position / 8] & (1 << (position % 8)) != 0;
                    instances.push(match group {
                        80 => ObjectInstance::InternalIndicationBit { value: bit },
                        _ => ObjectInstance::BinaryInputPacked { value: bit },
                    });
                }
            }
            Some(Layout::Fixed(size, decode_fn)) => {
                for _ in 0..count {
                    match qualifier.prefix {
                        PrefixCode::None => {}
                        PrefixCode::Index1 => indices.push(u32::from(reader.u8()?)),
                        PrefixCode::Index2 => indices.push(u32::from(reader.u16_le()?)),
                        PrefixCode::Index4 => indices.push(reader.u32_le()?),
                        PrefixCode::Size1 => {
                            // Size prefix on a fixed layout carries no index.
                            reader.u8()?;
                        }
                    }
                    instances.push(decode_fn(reader.take(size)?));
                }
            }
            None => {
                // Unknown pair: the layout length is unknowable, so the
                // rest of the fragment is preserved opaque.
                let bytes = reader.take(reader.remaining())?.to_vec();
                instances.push(ObjectInstance::Opaque { group, variation, bytes });
            }
        }

        Ok(ObjectItem { header, indices, instances })
    }
}

/// An application fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub control: AppControl,
    pub function: FunctionCode,
    pub iin: Option<InternalIndications>,
    pub items: Vec<ObjectItem>,
}

impl Fragment {
    /// Single-fragment request (FIR and FIN set).
    pub fn request(function: FunctionCode, seq: u8, items: Vec<ObjectItem>) -> Fragment {
        Fragment {
            control: AppControl { fir: true, fin: true, con: false, uns: false, seq },
            function,
            iin: None,
            items,
        }
    }

    pub fn confirm(seq: u8, uns: bool) -> Fragment {
        Fragment {
            control: AppControl { fir: true, fin: true, con: false, uns, seq },
            function: FunctionCode::Confirm,
            iin: None,
            items: Vec::new(),
        }
    }

    pub fn header_size(function: FunctionCode) -> usize {
        if function.is_response() {
            4
        } else {
            2
        }
    }

    pub fn encoded_size(&self) -> usize {
        Self::header_size(self.function)
            + self.items.iter().map(ObjectItem::encoded_size).sum::<usize>()
    }

    pub fn encode(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(self.encoded_size());
        dst.put_u8(self.control.byte());
        dst.put_u8(self.function as u8);
        if self.function.is_response() {
            let iin = self.iin.unwrap_or_default();
            dst.put_slice(&iin.bytes());
        }
        for item in &self.items {
            item.encode(&mut dst);
        }
        dst
    }

    pub fn decode(bytes: &[u8]) -> Result<Fragment, ProtocolError> {
        let mut reader = SliceReader::new(bytes);
        let control = AppControl::from_byte(reader.u8()?);
        let code = reader.u8()?;
        let function = FunctionCode::from_code(code).ok_or(ProtocolError::TransportDesync)?;
        let iin = if function.is_response() {
            Some(InternalIndications::from_bytes(reader.u8()?, reader.u8()?))
        } else {
            None
        };
        let mut items = Vec::new();
        while reader.remaining() > 0 {
            items.push(ObjectItem::decode(&mut reader, function.carries_payload())?);
        }
        Ok(Fragment { control, function, iin, items })
    }
}

/// Pack items into fragment-sized chunks. An item whose instances exceed
/// the budget on their own is split across contiguous sub-ranges.
pub fn pack_items(
    items: Vec<ObjectItem>,
    function: FunctionCode,
    max_fragment_size: usize,
) -> Vec<Vec<ObjectItem>> {
    let budget = max_fragment_size.saturating_sub(Fragment::header_size(function));
    let mut chunks: Vec<Vec<ObjectItem>> = Vec::new();
    let mut current: Vec<ObjectItem> = Vec::new();
    let mut used = 0usize;

    for item in items {
        let size = item.encoded_size();
        if used + size <= budget {
            used += size;
            current.push(item);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        if size <= budget {
            used = size;
            current.push(item);
            continue;
        }
        // Single oversized item: split by instances.
        for part in split_item(item, budget) {
            let part_size = part.encoded_size();
            if used + part_size > budget && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                used = 0;
            }
            used += part_size;
            current.push(part);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }
    chunks
}

fn split_item(item: ObjectItem, budget: usize) -> Vec<ObjectItem> {
    let overhead = 3 + 8; // header plus the widest range descriptor
    let per_instance = item
        .instances
        .iter()
        .map(|i| i.encoded_size() + item.header.qualifier.prefix.encoded_width())
        .max()
        .unwrap_or(1)
        .max(1);
    let chunk_len = ((budget.saturating_sub(overhead)) / per_instance).max(1);

    let ObjectItem { header, indices, instances } = item;
    let mut parts = Vec::new();
    let mut position = 0usize;
    while position < instances.len() {
        let end = (position + chunk_len).min(instances.len());
        let slice: Vec<ObjectInstance> = instances[position..end].to_vec();
        let part = if indices.is_empty() {
            let start = match header.range {
                Range::StartStop { start, .. } => start + position as u32,
                _ => position as u32,
            };
            ObjectItem::with_range_instances(header.group, header.variation, start, slice)
        } else {
            let entries = indices[position..end]
                .iter()
                .copied()
                .zip(slice)
                .collect();
            ObjectItem::with_indexed_instances(header.group, header.variation, entries)
        };
        parts.push(part);
        position = end;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{CROB_LATCH_ON, FLAG_ONLINE};

    #[test]
    fn app_control_round_trip() {
        for byte in 0..=u8::MAX {
            assert_eq!(AppControl::from_byte(byte).byte(), byte);
        }
    }

    #[test]
    fn app_seq_wraps_at_fifteen() {
        assert_eq!(next_app_seq(14), 15);
        assert_eq!(next_app_seq(15), 0);
    }

    #[test]
    fn read_request_round_trip() {
        let request = Fragment::request(
            FunctionCode::Read,
            5,
            vec![ObjectItem::read_range(30, 2, 3, 3)],
        );
        let decoded = Fragment::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
        let qualifier = decoded.items[0].header.qualifier;
        assert_eq!(qualifier.prefix, PrefixCode::None);
        assert_eq!(qualifier.range, RangeCode::StartStop1);
        assert_eq!(decoded.items[0].header.range, Range::StartStop { start: 3, stop: 3 });
    }

    #[test]
    fn response_round_trip_with_iin() {
        let response = Fragment {
            control: AppControl { fir: true, fin: true, con: false, uns: false, seq: 5 },
            function: FunctionCode::Response,
            iin: Some(InternalIndications(InternalIndications::DEVICE_RESTART)),
            items: vec![ObjectItem::with_range_instances(
                30,
                2,
                3,
                vec![ObjectInstance::AnalogInput16 { value: 1234, flags: FLAG_ONLINE }],
            )],
        };
        let decoded = Fragment::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
        assert!(decoded.iin.unwrap().contains(InternalIndications::DEVICE_RESTART));
    }

    #[test]
    fn indexed_control_round_trip() {
        let crob = ObjectInstance::ControlRelayOutputBlock {
            code: CROB_LATCH_ON,
            count: 1,
            on_time_ms: 0,
            off_time_ms: 0,
            status: 0,
        };
        let request = Fragment::request(
            FunctionCode::DirectOperate,
            0,
            vec![ObjectItem::with_indexed_instances(12, 1, vec![(7, crob)])],
        );
        let decoded = Fragment::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.items[0].indices, vec![7]);
        assert_eq!(decoded.items[0].instance_index(0), Some(7));
    }

    #[test]
    fn packed_binary_round_trip() {
        let instances: Vec<ObjectInstance> = (0..11)
            .map(|i| ObjectInstance::BinaryInputPacked { value: i % 3 == 0 })
            .collect();
        let item = ObjectItem::with_range_instances(1, 1, 0, instances.clone());
        let fragment = Fragment {
            control: AppControl { fir: true, fin: true, con: false, uns: false, seq: 0 },
            function: FunctionCode::Response,
            iin: Some(InternalIndications::default()),
            items: vec![item],
        };
        let decoded = Fragment::decode(&fragment.encode()).unwrap();
        assert_eq!(decoded.items[0].instances, instances);
    }

    #[test]
    fn unknown_variation_preserved_opaque() {
        let mut bytes = Fragment {
            control: AppControl { fir: true, fin: true, con: false, uns: false, seq: 1 },
            function: FunctionCode::Response,
            iin: Some(InternalIndications::default()),
            items: Vec::new(),
        }
        .encode();
        // group 34 variation 2, qualifier all, then unknown payload
        bytes.put_slice(&[34, 2, 0x06, 0xDE, 0xAD, 0xBE]);
        let decoded = Fragment::decode(&bytes).unwrap();
        let instance = &decoded.items[0].instances[0];
        assert!(matches!(instance, ObjectInstance::Opaque { group: 34, variation: 2, .. }));
        assert!(instance.value().is_err());
    }

    #[test]
    fn truncated_fragment_is_desync() {
        let request = Fragment::request(
            FunctionCode::Read,
            5,
            vec![ObjectItem::read_range(30, 2, 3, 3)],
        );
        let bytes = request.encode();
        assert_eq!(
            Fragment::decode(&bytes[..bytes.len() - 1]).unwrap_err(),
            ProtocolError::TransportDesync
        );
    }

    #[test]
    fn pack_splits_oversized_items() {
        let instances: Vec<ObjectInstance> = (0..200)
            .map(|i| ObjectInstance::AnalogInput32 { value: i, flags: FLAG_ONLINE })
            .collect();
        let item = ObjectItem::with_range_instances(30, 1, 0, instances);
        let chunks = pack_items(vec![item], FunctionCode::Response, 512);
        assert!(chunks.len() >= 2, "200 five-byte instances must not fit 512 bytes");

        let mut seen = 0usize;
        for chunk in &chunks {
            let size: usize = chunk.iter().map(ObjectItem::encoded_size).sum();
            assert!(size + 4 <= 512);
            for item in chunk {
                seen += item.instances.len();
            }
        }
        assert_eq!(seen, 200);
        // Sub-ranges stay contiguous.
        assert_eq!(chunks[0][0].header.range, Range::StartStop {
            start: 0,
            stop: chunks[0][0].instances.len() as u32 - 1,
        });
    }

    #[test]
    fn confirm_fragment_is_two_bytes() {
        let confirm = Fragment::confirm(9, false);
        assert_eq!(confirm.encode().len(), 2);
        assert_eq!(Fragment::decode(&confirm.encode()).unwrap(), confirm);
    }
}
