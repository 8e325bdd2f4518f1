// RVPF | Source Available BUSL-1.1 | Copyright (c) 2025 Estimatedstocks AB
//! CIP/EtherNet-IP client: encapsulation codec, registered sessions,
//! tag services with multi-service batching, and the point-exchange
//! proxy on top.

pub mod codec;
pub mod data;
pub mod proxy;
pub mod session;

pub use data::{CipData, DataKind};
pub use proxy::{CipPointAddress, ServerProxy, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
pub use session::{CipSession, SessionState};
