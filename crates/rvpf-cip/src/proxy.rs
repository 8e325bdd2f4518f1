use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use rvpf_core::config::DeviceConfig;
use rvpf_core::content::ContentKind;
use rvpf_core::{
    DateTime, Point, PointExchange, PointValue, ProtocolError, ReadResult, WriteResult,
};

use crate::codec::{
    multi_service_request, multi_service_size, parse_multi_service_response, read_tag_request,
    write_tag_request, ServiceResponse, MAX_ENVELOPE, SERVICE_MULTIPLE, SERVICE_READ_TAG,
    SERVICE_WRITE_TAG,
};
use crate::data::{CipData, DataKind};
use crate::session::CipSession;

/// Point attributes consumed from the metadata collaborator.
pub const ATTR_TAG: &str = "TAG";
pub const ATTR_ELEMENTS: &str = "ELEMENTS";
pub const ATTR_TYPE: &str = "TYPE";
pub const ATTR_TCP_ADDRESS: &str = "TCP_ADDRESS";
pub const ATTR_TCP_PORT: &str = "TCP_PORT";
pub const ATTR_SLOT: &str = "SLOT";
pub const ATTR_TIMEOUT: &str = "TIMEOUT";

pub const DEFAULT_TCP_PORT: u16 = 44818;
pub const DEFAULT_UDP_PORT: u16 = 2222;

/// Tag address of one point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipPointAddress {
    pub tag: String,
    pub elements: u16,
    /// Controller-side data type for writes; reads discover it from the
    /// response.
    pub kind: Option<DataKind>,
}

impl CipPointAddress {
    pub fn from_point(point: &Point) -> Result<CipPointAddress, ProtocolError> {
        let tag = point
            .attribute(ATTR_TAG)
            .ok_or_else(|| {
                ProtocolError::BadValue(format!("point {} has no TAG attribute", point.name))
            })?
            .to_string();
        let elements = match point.attribute(ATTR_ELEMENTS) {
            Some(_) => point.parse_attribute::<u16>(ATTR_ELEMENTS)?,
            None => 1,
        };
        let kind = match point.attribute(ATTR_TYPE) {
            Some(name) => Some(DataKind::from_name(name).ok_or_else(|| {
                ProtocolError::BadValue(format!("unknown CIP type {name}"))
            })?),
            None => None,
        };
        Ok(CipPointAddress { tag, elements, kind })
    }

    /// Data type used for a write when the metadata does not pin one.
    fn write_kind(&self, content: ContentKind) -> DataKind {
        self.kind.unwrap_or(match content {
            ContentKind::Logical => DataKind::Bool,
            ContentKind::Count => DataKind::Dint,
            _ => DataKind::Real,
        })
    }
}

struct QueuedRead {
    point: Point,
    address: Result<CipPointAddress, ProtocolError>,
}

struct QueuedWrite {
    value: PointValue,
    point: Point,
    address: Result<CipPointAddress, ProtocolError>,
}

/// Client proxy for one controller: batches queued tag reads and writes
/// into multi-service packets within the negotiated envelope.
pub struct ServerProxy {
    id: String,
    host: String,
    port: u16,
    session: CipSession,
    queued_reads: Vec<QueuedRead>,
    queued_writes: Vec<QueuedWrite>,
}

impl ServerProxy {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        slot: u8,
        timeout: Duration,
    ) -> ServerProxy {
        ServerProxy {
            id: id.into(),
            host: host.into(),
            port,
            session: CipSession::new(timeout, slot),
            queued_reads: Vec::new(),
            queued_writes: Vec::new(),
        }
    }

    pub fn from_device(device: &DeviceConfig) -> anyhow::Result<ServerProxy> {
        use anyhow::Context;

        let (host, port) = match device.target.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().context("target port")?),
            None => (device.target.clone(), DEFAULT_TCP_PORT),
        };
        let slot = match device.params.get("slot") {
            Some(raw) => raw.parse().context("slot")?,
            None => 0,
        };
        let timeout = match device.params.get("timeout_ms") {
            Some(raw) => Duration::from_millis(raw.parse().context("timeout_ms")?),
            None => Duration::from_millis(2000),
        };
        Ok(ServerProxy::new(device.id.clone(), host, port, slot, timeout))
    }

    async fn ensure_open(&mut self) -> Result<(), ProtocolError> {
        if self.session.is_open() {
            return Ok(());
        }
        debug!("{}: opening session to {}:{}", self.id, self.host, self.port);
        let host = self.host.clone();
        self.session.open(&host, self.port).await
    }

    /// Group service requests into the largest multi-service packets the
    /// envelope allows; a single request goes out unwrapped.
    fn batch(requests: &[Vec<u8>]) -> Vec<Vec<usize>> {
        let mut batches: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        for (position, _) in requests.iter().enumerate() {
            current.push(position);
            let members: Vec<Vec<u8>> =
                current.iter().map(|i| requests[*i].clone()).collect();
            if multi_service_size(&members) > MAX_ENVELOPE && current.len() > 1 {
                let overflow = current.pop().expect("just pushed");
                batches.push(std::mem::take(&mut current));
                current.push(overflow);
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Send one batch, returning the per-request responses in order.
    async fn run_batch(
        &mut self,
        requests: &[Vec<u8>],
        members: &[usize],
    ) -> Result<Vec<ServiceResponse>, ProtocolError> {
        if members.len() == 1 {
            let response = self.session.transact(&requests[members[0]]).await?;
            return Ok(vec![response]);
        }
        let packet: Vec<Vec<u8>> = members.iter().map(|i| requests[*i].clone()).collect();
        let outer = self.session.transact(&multi_service_request(&packet)).await?;
        if !outer.answers(SERVICE_MULTIPLE) {
            return Err(ProtocolError::UnexpectedResponse);
        }
        let embedded = parse_multi_service_response(&outer)?;
        if embedded.len() != members.len() {
            return Err(ProtocolError::UnexpectedResponse);
        }
        Ok(embedded)
    }
}

fn read_outcome(
    point: &Point,
    address: &CipPointAddress,
    response: &ServiceResponse,
) -> Result<PointValue, ProtocolError> {
    if !response.answers(SERVICE_READ_TAG) {
        return Err(ProtocolError::UnexpectedResponse);
    }
    if response.status != 0 {
        return Err(ProtocolError::BadValue(format!(
            "tag {} read failed with status {:#04x}",
            address.tag, response.status
        )));
    }
    let data = CipData::decode(&response.data, address.elements)?;
    let raw = data.value()?;
    // Arrays keep their tuple shape; scalars go through the content type.
    let value = if address.elements > 1 {
        raw
    } else {
        rvpf_core::content::decode(point.content, &raw)?
    };
    Ok(PointValue::new(point, DateTime::now(), value))
}

fn write_outcome(address: &CipPointAddress, response: &ServiceResponse) -> Result<(), ProtocolError> {
    if !response.answers(SERVICE_WRITE_TAG) {
        return Err(ProtocolError::UnexpectedResponse);
    }
    if response.status != 0 {
        return Err(ProtocolError::BadValue(format!(
            "tag {} write failed with status {:#04x}",
            address.tag, response.status
        )));
    }
    Ok(())
}

#[async_trait]
impl PointExchange for ServerProxy {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.ensure_open().await
    }

    fn request_read(&mut self, point: Point) {
        let address = CipPointAddress::from_point(&point);
        self.queued_reads.push(QueuedRead { point, address });
    }

    fn request_write(&mut self, value: PointValue, point: Point) {
        let address = CipPointAddress::from_point(&point);
        self.queued_writes.push(QueuedWrite { value, point, address });
    }

    fn rollback_reads(&mut self) {
        self.queued_reads.clear();
    }

    fn rollback_writes(&mut self) {
        self.queued_writes.clear();
    }

    async fn commit_reads(&mut self) -> Vec<ReadResult> {
        let queued = std::mem::take(&mut self.queued_reads);
        if queued.is_empty() {
            return Vec::new();
        }

        let mut outcomes: Vec<Option<Result<PointValue, ProtocolError>>> =
            (0..queued.len()).map(|_| None).collect();
        let mut requests: Vec<Vec<u8>> = Vec::new();
        let mut request_owner: Vec<usize> = Vec::new();
        for (position, queued_read) in queued.iter().enumerate() {
            match &queued_read.address {
                Ok(address) => match read_tag_request(&address.tag, address.elements) {
                    Ok(request) => {
                        requests.push(request);
                        request_owner.push(position);
                    }
                    Err(e) => outcomes[position] = Some(Err(e)),
                },
                Err(e) => outcomes[position] = Some(Err(e.clone())),
            }
        }

        if !requests.is_empty() {
            if let Err(e) = self.ensure_open().await {
                for owner in &request_owner {
                    outcomes[*owner] = Some(Err(e.clone()));
                }
            } else {
                for members in Self::batch(&requests) {
                    match self.run_batch(&requests, &members).await {
                        Ok(responses) => {
                            for (member, response) in members.iter().zip(responses) {
                                let position = request_owner[*member];
                                let address = queued[position]
                                    .address
                                    .as_ref()
                                    .expect("request only built from valid address");
                                outcomes[position] = Some(read_outcome(
                                    &queued[position].point,
                                    address,
                                    &response,
                                ));
                            }
                        }
                        Err(e) => {
                            warn!("{}: read batch failed: {e}", self.id);
                            for member in &members {
                                outcomes[request_owner[*member]] = Some(Err(e.clone()));
                            }
                        }
                    }
                }
            }
        }

        queued
            .into_iter()
            .zip(outcomes)
            .map(|(queued_read, outcome)| ReadResult {
                point: queued_read.point,
                outcome: outcome.unwrap_or(Err(ProtocolError::Cancelled)),
            })
            .collect()
    }

    async fn commit_writes(&mut self) -> Vec<WriteResult> {
        let queued = std::mem::take(&mut self.queued_writes);
        if queued.is_empty() {
            return Vec::new();
        }

        let mut outcomes: Vec<Option<Result<(), ProtocolError>>> =
            (0..queued.len()).map(|_| None).collect();
        let mut requests: Vec<Vec<u8>> = Vec::new();
        let mut request_owner: Vec<usize> = Vec::new();
        for (position, queued_write) in queued.iter().enumerate() {
            let built = queued_write.address.as_ref().map_err(Clone::clone).and_then(
                |address| {
                    let raw = queued_write.value.value.as_ref().ok_or_else(|| {
                        ProtocolError::BadValue(format!(
                            "point {} has no value",
                            queued_write.point.name
                        ))
                    })?;
                    let native = rvpf_core::content::encode(queued_write.point.content, raw)?;
                    let data = CipData::from_value(
                        address.write_kind(queued_write.point.content),
                        &native,
                        address.elements,
                    )?;
                    write_tag_request(&address.tag, &data)
                },
            );
            match built {
                Ok(request) => {
                    requests.push(request);
                    request_owner.push(position);
                }
                Err(e) => outcomes[position] = Some(Err(e)),
            }
        }

        if !requests.is_empty() {
            if let Err(e) = self.ensure_open().await {
                for owner in &request_owner {
                    outcomes[*owner] = Some(Err(e.clone()));
                }
            } else {
                for members in Self::batch(&requests) {
                    match self.run_batch(&requests, &members).await {
                        Ok(responses) => {
                            for (member, response) in members.iter().zip(responses) {
                                let position = request_owner[*member];
                                let address = queued[position]
                                    .address
                                    .as_ref()
                                    .expect("request only built from valid address");
                                outcomes[position] = Some(write_outcome(address, &response));
                            }
                        }
                        Err(e) => {
                            warn!("{}: write batch failed: {e}", self.id);
                            for member in &members {
                                outcomes[request_owner[*member]] = Some(Err(e.clone()));
                            }
                        }
                    }
                }
            }
        }

        queued
            .into_iter()
            .zip(outcomes)
            .map(|(queued_write, outcome)| WriteResult {
                value: queued_write.value,
                outcome: outcome.unwrap_or(Err(ProtocolError::Cancelled)),
            })
            .collect()
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        self.session.close().await;
        self.queued_reads.clear();
        self.queued_writes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvpf_core::Value;

    #[test]
    fn address_parsing_defaults() {
        let point = Point::new("plc.tag_a", "plc-1").with_attribute(ATTR_TAG, "tag_a");
        let address = CipPointAddress::from_point(&point).unwrap();
        assert_eq!(address.tag, "tag_a");
        assert_eq!(address.elements, 1);
        assert_eq!(address.kind, None);

        let missing = Point::new("plc.broken", "plc-1");
        assert!(CipPointAddress::from_point(&missing).is_err());
    }

    #[test]
    fn write_kind_follows_content() {
        let address = CipPointAddress {
            tag: "x".to_string(),
            elements: 1,
            kind: None,
        };
        assert_eq!(address.write_kind(ContentKind::Logical), DataKind::Bool);
        assert_eq!(address.write_kind(ContentKind::Count), DataKind::Dint);
        assert_eq!(address.write_kind(ContentKind::Floating), DataKind::Real);

        let pinned = CipPointAddress {
            kind: Some(DataKind::Lreal),
            ..address
        };
        assert_eq!(pinned.write_kind(ContentKind::Count), DataKind::Lreal);
    }

    #[test]
    fn batching_respects_envelope() {
        // Long tag names inflate each request towards the envelope.
        let requests: Vec<Vec<u8>> = (0..12)
            .map(|i| read_tag_request(&format!("some_rather_long_tag_name_{i:03}"), 1).unwrap())
            .collect();
        let batches = ServerProxy::batch(&requests);
        assert!(batches.len() > 1);
        let mut seen = Vec::new();
        for members in &batches {
            let packet: Vec<Vec<u8>> = members.iter().map(|i| requests[*i].clone()).collect();
            assert!(multi_service_size(&packet) <= MAX_ENVELOPE || packet.len() == 1);
            seen.extend(members.iter().copied());
        }
        assert_eq!(seen, (0..12).collect::<Vec<usize>>());
    }

    #[test]
    fn small_sets_stay_in_one_batch() {
        let requests = vec![
            read_tag_request("tag_a", 1).unwrap(),
            read_tag_request("tag_b", 10).unwrap(),
            read_tag_request("tag_c", 1).unwrap(),
        ];
        assert_eq!(ServerProxy::batch(&requests), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn read_outcome_converts_via_content() {
        let point = Point::new("plc.count", "plc-1")
            .with_content(ContentKind::Count)
            .with_attribute(ATTR_TAG, "count");
        let address = CipPointAddress::from_point(&point).unwrap();
        let response = ServiceResponse {
            service: SERVICE_READ_TAG | 0x80,
            status: 0,
            data: vec![0xC3, 0x00, 0x39, 0x30],
        };
        let value = read_outcome(&point, &address, &response).unwrap();
        assert_eq!(value.value, Some(Value::Long(12345)));

        let failed = ServiceResponse {
            service: SERVICE_READ_TAG | 0x80,
            status: 0x05,
            data: vec![],
        };
        assert!(read_outcome(&point, &address, &failed).is_err());
    }
}
