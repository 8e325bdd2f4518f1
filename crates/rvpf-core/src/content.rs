use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::point::Value;

/// Content type of a point, as a tagged variant with behavior tables
/// instead of a class hierarchy. `normalize` converts a device-side value
/// to the canonical form (SI units, doubles); `denormalize` goes back;
/// `decode`/`encode` coerce raw protocol values to and from the variant's
/// native representation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ContentKind {
    /// Two-state value (breaker position, alarm flag).
    Logical,
    /// Monotonic or sampled integer count.
    Count,
    /// Plain floating point, already in canonical units.
    Floating,
    /// Linear instrument scaling: canonical = raw * multiplier + offset.
    Scaled { multiplier: f64, offset: f64 },
    /// Temperature with a unit tag; canonical form is kelvin.
    Temperature { unit: TemperatureUnit },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureUnit {
    Kelvin,
    Celsius,
    Fahrenheit,
}

/// Coerce a raw protocol value to the content's native representation.
pub fn decode(kind: ContentKind, value: &Value) -> Result<Value, ProtocolError> {
    match kind {
        ContentKind::Logical => Ok(Value::Bool(value.as_bool()?)),
        ContentKind::Count => Ok(Value::Long(value.as_long()?)),
        ContentKind::Floating
        | ContentKind::Scaled { .. }
        | ContentKind::Temperature { .. } => Ok(Value::Double(value.as_double()?)),
    }
}

/// Coerce a native value back to the form written to the device.
pub fn encode(kind: ContentKind, value: &Value) -> Result<Value, ProtocolError> {
    match kind {
        ContentKind::Logical => Ok(Value::Bool(value.as_bool()?)),
        ContentKind::Count => Ok(Value::Long(value.as_long()?)),
        ContentKind::Floating
        | ContentKind::Scaled { .. }
        | ContentKind::Temperature { .. } => Ok(Value::Double(value.as_double()?)),
    }
}

/// Device value to canonical value.
pub fn normalize(kind: ContentKind, value: &Value) -> Result<Value, ProtocolError> {
    match kind {
        ContentKind::Logical => Ok(Value::Bool(value.as_bool()?)),
        ContentKind::Count => Ok(Value::Long(value.as_long()?)),
        ContentKind::Floating => Ok(Value::Double(value.as_double()?)),
        ContentKind::Scaled { multiplier, offset } => {
            Ok(Value::Double(value.as_double()? * multiplier + offset))
        }
        ContentKind::Temperature { unit } => {
            let raw = value.as_double()?;
            let kelvin = match unit {
                TemperatureUnit::Kelvin => raw,
                TemperatureUnit::Celsius => raw + 273.15,
                TemperatureUnit::Fahrenheit => (raw - 32.0) / 1.8 + 273.15,
            };
            Ok(Value::Double(kelvin))
        }
    }
}

/// Canonical value back to the device-side representation.
pub fn denormalize(kind: ContentKind, value: &Value) -> Result<Value, ProtocolError> {
    match kind {
        ContentKind::Logical => Ok(Value::Bool(value.as_bool()?)),
        ContentKind::Count => Ok(Value::Long(value.as_long()?)),
        ContentKind::Floating => Ok(Value::Double(value.as_double()?)),
        ContentKind::Scaled { multiplier, offset } => {
            if multiplier == 0.0 {
                return Err(ProtocolError::BadValue(
                    "scaled content with zero multiplier".to_string(),
                ));
            }
            Ok(Value::Double((value.as_double()? - offset) / multiplier))
        }
        ContentKind::Temperature { unit } => {
            let kelvin = value.as_double()?;
            let raw = match unit {
                TemperatureUnit::Kelvin => kelvin,
                TemperatureUnit::Celsius => kelvin - 273.15,
                TemperatureUnit::Fahrenheit => (kelvin - 273.15) * 1.8 + 32.0,
            };
            Ok(Value::Double(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_round_trip() {
        let kind = ContentKind::Scaled {
            multiplier: 0.1,
            offset: -40.0,
        };
        let canonical = normalize(kind, &Value::Long(500)).unwrap();
        assert_eq!(canonical, Value::Double(10.0));
        let raw = denormalize(kind, &canonical).unwrap();
        assert_eq!(raw, Value::Double(500.0));
    }

    #[test]
    fn temperature_units() {
        let celsius = ContentKind::Temperature {
            unit: TemperatureUnit::Celsius,
        };
        let kelvin = normalize(celsius, &Value::Double(25.0)).unwrap();
        assert_eq!(kelvin, Value::Double(298.15));

        let fahrenheit = ContentKind::Temperature {
            unit: TemperatureUnit::Fahrenheit,
        };
        let back = denormalize(fahrenheit, &Value::Double(273.15)).unwrap();
        assert_eq!(back, Value::Double(32.0));
    }

    #[test]
    fn logical_rejects_containers() {
        let err = decode(ContentKind::Logical, &Value::Tuple(vec![]));
        assert!(matches!(err, Err(ProtocolError::BadValue(_))));
    }

    #[test]
    fn zero_multiplier_is_bad_value() {
        let kind = ContentKind::Scaled {
            multiplier: 0.0,
            offset: 0.0,
        };
        assert!(denormalize(kind, &Value::Double(1.0)).is_err());
    }
}
