use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datetime::DateTime;
use crate::error::ProtocolError;

/// A value carried by a point: scalar, text, raw bytes, or a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Long(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_bool(&self) -> Result<bool, ProtocolError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Long(n) => Ok(*n != 0),
            Value::Double(d) => Ok(*d != 0.0),
            other => Err(bad_value("bool", other)),
        }
    }

    pub fn as_long(&self) -> Result<i64, ProtocolError> {
        match self {
            Value::Long(n) => Ok(*n),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Double(d) if d.fract() == 0.0 => Ok(*d as i64),
            Value::Text(s) => s
                .parse::<i64>()
                .map_err(|_| bad_value("integer", self)),
            other => Err(bad_value("integer", other)),
        }
    }

    pub fn as_double(&self) -> Result<f64, ProtocolError> {
        match self {
            Value::Double(d) => Ok(*d),
            Value::Long(n) => Ok(*n as f64),
            Value::Bool(b) => Ok(f64::from(u8::from(*b))),
            Value::Text(s) => s
                .parse::<f64>()
                .map_err(|_| bad_value("floating point", self)),
            other => Err(bad_value("floating point", other)),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
        }
    }
}

fn bad_value(wanted: &str, got: &Value) -> ProtocolError {
    ProtocolError::BadValue(format!("expected {wanted}, got {}", got.type_name()))
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// A logical measurement: identity plus the protocol attributes needed to
/// address it on a device (e.g. "GROUP"/"VARIATION"/"INDEX" for DNP3,
/// "TAG"/"ELEMENTS" for CIP).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub uuid: Uuid,
    pub name: String,
    /// The device (master or outstation) producing or consuming values
    /// for this point.
    pub origin: String,
    pub content: crate::content::ContentKind,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Point {
    pub fn new(name: impl Into<String>, origin: impl Into<String>) -> Self {
        Point {
            uuid: Uuid::new_v4(),
            name: name.into(),
            origin: origin.into(),
            content: crate::content::ContentKind::Floating,
            attributes: HashMap::new(),
        }
    }

    pub fn with_content(mut self, content: crate::content::ContentKind) -> Self {
        self.content = content;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl ToString) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Parse an attribute, reporting a missing or malformed entry as
    /// `BadValue` naming the point.
    pub fn parse_attribute<T: std::str::FromStr>(&self, key: &str) -> Result<T, ProtocolError> {
        let raw = self.attribute(key).ok_or_else(|| {
            ProtocolError::BadValue(format!("point {} has no {key} attribute", self.name))
        })?;
        raw.parse::<T>().map_err(|_| {
            ProtocolError::BadValue(format!(
                "point {} has malformed {key} attribute: {raw}",
                self.name
            ))
        })
    }
}

/// A timestamped value of a point, optionally carrying a quality state
/// and a deleted marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValue {
    pub point_uuid: Uuid,
    pub stamp: DateTime,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub deleted: bool,
}

impl PointValue {
    pub fn new(point: &Point, stamp: DateTime, value: Value) -> Self {
        PointValue {
            point_uuid: point.uuid,
            stamp,
            state: None,
            value: Some(value),
            deleted: false,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn deleted(point: &Point, stamp: DateTime) -> Self {
        PointValue {
            point_uuid: point.uuid,
            stamp,
            state: None,
            value: None,
            deleted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_conversions() {
        assert_eq!(Value::Long(1234).as_double().unwrap(), 1234.0);
        assert_eq!(Value::Double(7.0).as_long().unwrap(), 7);
        assert!(Value::Bool(true).as_bool().unwrap());
        assert!(Value::Text("x".into()).as_long().is_err());
        assert!(Value::Double(1.5).as_long().is_err());
    }

    #[test]
    fn attribute_parsing() {
        let point = Point::new("plant.flow", "rtu-1")
            .with_attribute("GROUP", 30)
            .with_attribute("INDEX", 3);
        assert_eq!(point.parse_attribute::<u8>("GROUP").unwrap(), 30);
        assert_eq!(point.parse_attribute::<u16>("INDEX").unwrap(), 3);
        let missing = point.parse_attribute::<u8>("VARIATION");
        assert!(matches!(missing, Err(ProtocolError::BadValue(_))));
    }

    #[test]
    fn point_value_construction() {
        let point = Point::new("plant.flow", "rtu-1");
        let pv = PointValue::new(&point, DateTime::unix_epoch(), Value::Long(5));
        assert_eq!(pv.point_uuid, point.uuid);
        assert!(!pv.deleted);
        assert!(PointValue::deleted(&point, DateTime::unix_epoch()).deleted);
    }
}
