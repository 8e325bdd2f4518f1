// RVPF | Source Available BUSL-1.1 | Copyright (c) 2025 Estimatedstocks AB
pub mod config;
pub mod content;
pub mod datetime;
pub mod error;
pub mod exchange;
pub mod point;

pub use config::{DeviceConfig, FieldConfig, LogLevel};
pub use datetime::{DateTime, Elapsed};
pub use error::ProtocolError;
pub use exchange::{PointExchange, ReadResult, WriteResult};
pub use point::{Point, PointValue, Value};
