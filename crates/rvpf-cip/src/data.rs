use rvpf_core::{ProtocolError, Value};

/// Elementary CIP data types and their on-wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DataKind {
    Bool = 0x00C1,
    Sint = 0x00C2,
    Int = 0x00C3,
    Dint = 0x00C4,
    Lint = 0x00C5,
    Real = 0x00CA,
    Lreal = 0x00CB,
}

impl DataKind {
    pub fn from_code(code: u16) -> Option<DataKind> {
        match code {
            0x00C1 => Some(DataKind::Bool),
            0x00C2 => Some(DataKind::Sint),
            0x00C3 => Some(DataKind::Int),
            0x00C4 => Some(DataKind::Dint),
            0x00C5 => Some(DataKind::Lint),
            0x00CA => Some(DataKind::Real),
            0x00CB => Some(DataKind::Lreal),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<DataKind> {
        match name.to_ascii_uppercase().as_str() {
            "BOOL" => Some(DataKind::Bool),
            "SINT" => Some(DataKind::Sint),
            "INT" => Some(DataKind::Int),
            "DINT" => Some(DataKind::Dint),
            "LINT" => Some(DataKind::Lint),
            "REAL" => Some(DataKind::Real),
            "LREAL" => Some(DataKind::Lreal),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn element_size(self) -> usize {
        match self {
            DataKind::Bool | DataKind::Sint => 1,
            DataKind::Int => 2,
            DataKind::Dint | DataKind::Real => 4,
            DataKind::Lint | DataKind::Lreal => 8,
        }
    }
}

/// A typed block of controller data: type tag, element count, and the
/// raw little-endian bytes, plus the service status it came back with.
#[derive(Debug, Clone, PartialEq)]
pub struct CipData {
    pub kind: DataKind,
    pub elements: u16,
    pub raw: Vec<u8>,
    pub status: u8,
}

impl CipData {
    pub fn new(kind: DataKind, elements: u16, raw: Vec<u8>) -> CipData {
        CipData {
            kind,
            elements,
            raw,
            status: 0,
        }
    }

    /// Wrap a failed service slot; carries no payload.
    pub fn failed(status: u8) -> CipData {
        CipData {
            kind: DataKind::Bool,
            elements: 0,
            raw: Vec::new(),
            status,
        }
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    /// Decode a read-tag payload: type code, then element data.
    pub fn decode(payload: &[u8], elements: u16) -> Result<CipData, ProtocolError> {
        if payload.len() < 2 {
            return Err(ProtocolError::BadValue(
                "tag payload shorter than its type code".to_string(),
            ));
        }
        let code = u16::from_le_bytes([payload[0], payload[1]]);
        let kind = DataKind::from_code(code).ok_or(ProtocolError::UnsupportedObject {
            group: (code >> 8) as u8,
            variation: code as u8,
        })?;
        let raw = payload[2..].to_vec();
        if raw.len() < kind.element_size() * usize::from(elements.max(1)) {
            return Err(ProtocolError::BadValue(format!(
                "tag payload of {} bytes shorter than {} x {:?}",
                raw.len(),
                elements.max(1),
                kind
            )));
        }
        Ok(CipData::new(kind, elements.max(1), raw))
    }

    /// Build the write-tag payload representation of a value.
    pub fn from_value(kind: DataKind, value: &Value, elements: u16) -> Result<CipData, ProtocolError> {
        let scalars: Vec<&Value> = match value {
            Value::Tuple(values) => values.iter().collect(),
            single => vec![single],
        };
        if scalars.len() != usize::from(elements.max(1)) {
            return Err(ProtocolError::BadValue(format!(
                "{} scalars for {} elements",
                scalars.len(),
                elements.max(1)
            )));
        }
        let mut raw = Vec::with_capacity(kind.element_size() * scalars.len());
        for scalar in scalars {
            match kind {
                DataKind::Bool => raw.push(if scalar.as_bool()? { 0xFF } else { 0x00 }),
                DataKind::Sint => raw.push(scalar.as_long()? as u8),
                DataKind::Int => raw.extend_from_slice(&(scalar.as_long()? as i16).to_le_bytes()),
                DataKind::Dint => raw.extend_from_slice(&(scalar.as_long()? as i32).to_le_bytes()),
                DataKind::Lint => raw.extend_from_slice(&scalar.as_long()?.to_le_bytes()),
                DataKind::Real => {
                    raw.extend_from_slice(&(scalar.as_double()? as f32).to_le_bytes())
                }
                DataKind::Lreal => raw.extend_from_slice(&scalar.as_double()?.to_le_bytes()),
            }
        }
        Ok(CipData::new(kind, elements.max(1), raw))
    }

    /// Value of element `i`.
    pub fn value_at(&self, i: usize) -> Result<Value, ProtocolError> {
        if self.status != 0 {
            return Err(ProtocolError::BadValue(format!(
                "service failed with status {:#04x}",
                self.status
            )));
        }
        let size = self.kind.element_size();
        let offset = i * size;
        let bytes = self
            .raw
            .get(offset..offset + size)
            .ok_or_else(|| ProtocolError::BadValue(format!("element {i} out of range")))?;
        Ok(match self.kind {
            DataKind::Bool => Value::Bool(bytes[0] != 0),
            DataKind::Sint => Value::Long(i64::from(bytes[0] as i8)),
            DataKind::Int => Value::Long(i64::from(i16::from_le_bytes([bytes[0], bytes[1]]))),
            DataKind::Dint => Value::Long(i64::from(i32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            DataKind::Lint => Value::Long(i64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ])),
            DataKind::Real => Value::Double(f64::from(f32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            DataKind::Lreal => Value::Double(f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ])),
        })
    }

    /// Scalar for single elements, tuple for arrays.
    pub fn value(&self) -> Result<Value, ProtocolError> {
        if self.elements <= 1 {
            return self.value_at(0);
        }
        let values = (0..usize::from(self.elements))
            .map(|i| self.value_at(i))
            .collect::<Result<Vec<Value>, ProtocolError>>()?;
        Ok(Value::Tuple(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dint_round_trip() {
        let data = CipData::from_value(DataKind::Dint, &Value::Long(-77), 1).unwrap();
        let mut payload = DataKind::Dint.code().to_le_bytes().to_vec();
        payload.extend_from_slice(&data.raw);
        let decoded = CipData::decode(&payload, 1).unwrap();
        assert_eq!(decoded.value().unwrap(), Value::Long(-77));
    }

    #[test]
    fn real_array_decodes_as_tuple() {
        let mut raw = Vec::new();
        for v in [1.5f32, -2.0, 0.25] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let mut payload = DataKind::Real.code().to_le_bytes().to_vec();
        payload.extend_from_slice(&raw);
        let decoded = CipData::decode(&payload, 3).unwrap();
        assert_eq!(
            decoded.value().unwrap(),
            Value::Tuple(vec![
                Value::Double(1.5),
                Value::Double(-2.0),
                Value::Double(0.25)
            ])
        );
    }

    #[test]
    fn unknown_type_code_is_unsupported() {
        let payload = [0xD3u8, 0x00, 0x01];
        assert!(matches!(
            CipData::decode(&payload, 1),
            Err(ProtocolError::UnsupportedObject { .. })
        ));
    }

    #[test]
    fn short_payload_is_bad_value() {
        let payload = DataKind::Dint.code().to_le_bytes();
        assert!(matches!(
            CipData::decode(&payload, 1),
            Err(ProtocolError::BadValue(_))
        ));
    }

    #[test]
    fn failed_slot_refuses_values() {
        let failed = CipData::failed(0x05);
        assert_eq!(failed.status(), 0x05);
        assert!(failed.value().is_err());
    }

    #[test]
    fn element_count_mismatch_on_write() {
        let err = CipData::from_value(DataKind::Int, &Value::Long(1), 3);
        assert!(matches!(err, Err(ProtocolError::BadValue(_))));
    }
}
