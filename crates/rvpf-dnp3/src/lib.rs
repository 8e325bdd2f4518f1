// RVPF | Source Available BUSL-1.1 | Copyright (c) 2025 Estimatedstocks AB
//! DNP3 master stack: frame codec, transport segmentation, application
//! fragments, data-link engine, association multiplexing, and the
//! batched point-exchange API on top.

pub mod app;
pub mod channel;
pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod link;
pub mod master;
pub mod objects;
pub mod outstation;
pub mod transport;

pub use app::{AppControl, Fragment, FunctionCode, InternalIndications, ObjectItem};
pub use channel::ChannelConfig;
pub use codec::{Frame, FrameCodec};
pub use connection::{Connection, ConnectionEvent, FrameSender};
pub use endpoint::{AppState, Association, EndPointOptions, RemoteEndPoint};
pub use link::{LinkControl, LinkState};
pub use master::{Dnp3Config, Dnp3Master, Dnp3PointAddress};
pub use objects::{Group, ObjectHeader, ObjectInstance, Qualifier, Range};
pub use outstation::{Dnp3Outstation, OutstationDatabase};
