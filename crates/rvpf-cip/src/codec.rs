use bytes::{BufMut, BytesMut};

use rvpf_core::ProtocolError;

use crate::data::CipData;

/// EtherNet/IP encapsulation commands.
pub const COMMAND_REGISTER_SESSION: u16 = 0x0065;
pub const COMMAND_UNREGISTER_SESSION: u16 = 0x0066;
pub const COMMAND_SEND_RR_DATA: u16 = 0x006F;

/// CIP services.
pub const SERVICE_READ_TAG: u8 = 0x4C;
pub const SERVICE_WRITE_TAG: u8 = 0x4D;
pub const SERVICE_MULTIPLE: u8 = 0x0A;
pub const SERVICE_UNCONNECTED_SEND: u8 = 0x52;

/// Common-packet-format item types.
const ITEM_NULL_ADDRESS: u16 = 0x0000;
const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

/// Ceiling for one forward-open envelope; batches split at this size.
pub const MAX_ENVELOPE: usize = 504;

pub const ENCAP_HEADER_SIZE: usize = 24;

/// Parsed 24-byte encapsulation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
    pub command: u16,
    pub length: u16,
    pub session: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    pub fn parse(bytes: &[u8]) -> Result<EncapHeader, ProtocolError> {
        if bytes.len() < ENCAP_HEADER_SIZE {
            return Err(ProtocolError::Io(format!(
                "encapsulation header truncated at {} bytes",
                bytes.len()
            )));
        }
        let mut context = [0u8; 8];
        context.copy_from_slice(&bytes[12..20]);
        Ok(EncapHeader {
            command: u16::from_le_bytes([bytes[0], bytes[1]]),
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
            session: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            status: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            context,
            options: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
        })
    }
}

/// Wrap command data in an encapsulation packet.
pub fn encapsulate(command: u16, session: u32, context: [u8; 8], data: &[u8]) -> BytesMut {
    let mut packet = BytesMut::with_capacity(ENCAP_HEADER_SIZE + data.len());
    packet.put_u16_le(command);
    packet.put_u16_le(data.len() as u16);
    packet.put_u32_le(session);
    packet.put_u32_le(0); // status, zero on requests
    packet.put_slice(&context);
    packet.put_u32_le(0); // options
    packet.put_slice(data);
    packet
}

/// RegisterSession command data: protocol version 1, options 0.
pub fn register_session_data() -> [u8; 4] {
    [0x01, 0x00, 0x00, 0x00]
}

/// SendRRData command data: interface handle, timeout, and a two-item
/// common packet carrying the CIP request.
pub fn send_rr_data(cip: &[u8], timeout_secs: u16) -> Vec<u8> {
    let mut data = BytesMut::with_capacity(16 + cip.len());
    data.put_u32_le(0); // CIP interface handle
    data.put_u16_le(timeout_secs);
    data.put_u16_le(2); // item count
    data.put_u16_le(ITEM_NULL_ADDRESS);
    data.put_u16_le(0);
    data.put_u16_le(ITEM_UNCONNECTED_DATA);
    data.put_u16_le(cip.len() as u16);
    data.put_slice(cip);
    data.to_vec()
}

/// Extract the unconnected-data payload from SendRRData command data.
pub fn parse_rr_data(data: &[u8]) -> Result<&[u8], ProtocolError> {
    if data.len() < 8 {
        return Err(ProtocolError::Io("SendRRData data truncated".to_string()));
    }
    let item_count = u16::from_le_bytes([data[6], data[7]]);
    let mut offset = 8usize;
    for _ in 0..item_count {
        if data.len() < offset + 4 {
            return Err(ProtocolError::Io("common packet truncated".to_string()));
        }
        let item_type = u16::from_le_bytes([data[offset], data[offset + 1]]);
        let item_len = usize::from(u16::from_le_bytes([data[offset + 2], data[offset + 3]]));
        offset += 4;
        if data.len() < offset + item_len {
            return Err(ProtocolError::Io("common packet item truncated".to_string()));
        }
        if item_type == ITEM_UNCONNECTED_DATA {
            return Ok(&data[offset..offset + item_len]);
        }
        offset += item_len;
    }
    Err(ProtocolError::Io(
        "no unconnected data item in common packet".to_string(),
    ))
}

/// ANSI symbolic path for a tag name, each segment padded to even length.
pub fn symbolic_path(tag: &str) -> Result<Vec<u8>, ProtocolError> {
    if tag.is_empty() {
        return Err(ProtocolError::BadValue("empty tag name".to_string()));
    }
    let mut path = Vec::new();
    for segment in tag.split('.') {
        if segment.is_empty() || segment.len() > 255 || !segment.is_ascii() {
            return Err(ProtocolError::BadValue(format!(
                "malformed tag segment in {tag}"
            )));
        }
        path.push(0x91); // ANSI extended symbol segment
        path.push(segment.len() as u8);
        path.extend_from_slice(segment.as_bytes());
        if segment.len() % 2 != 0 {
            path.push(0x00);
        }
    }
    Ok(path)
}

/// Read Tag Service request.
pub fn read_tag_request(tag: &str, elements: u16) -> Result<Vec<u8>, ProtocolError> {
    let path = symbolic_path(tag)?;
    let mut request = Vec::with_capacity(4 + path.len());
    request.push(SERVICE_READ_TAG);
    request.push((path.len() / 2) as u8);
    request.extend_from_slice(&path);
    request.extend_from_slice(&elements.max(1).to_le_bytes());
    Ok(request)
}

/// Write Tag Service request.
pub fn write_tag_request(tag: &str, data: &CipData) -> Result<Vec<u8>, ProtocolError> {
    let path = symbolic_path(tag)?;
    let mut request = Vec::with_capacity(6 + path.len() + data.raw.len());
    request.push(SERVICE_WRITE_TAG);
    request.push((path.len() / 2) as u8);
    request.extend_from_slice(&path);
    request.extend_from_slice(&data.kind.code().to_le_bytes());
    request.extend_from_slice(&data.elements.to_le_bytes());
    request.extend_from_slice(&data.raw);
    Ok(request)
}

/// Multiple Service Packet addressed to the message router.
pub fn multi_service_request(services: &[Vec<u8>]) -> Vec<u8> {
    let mut request = Vec::new();
    request.push(SERVICE_MULTIPLE);
    request.push(2); // path size in words
    request.extend_from_slice(&[0x20, 0x02, 0x24, 0x01]); // message router
    let count = services.len() as u16;
    request.extend_from_slice(&count.to_le_bytes());
    // Offsets are measured from the service-count word.
    let mut offset = 2 + 2 * services.len();
    for service in services {
        request.extend_from_slice(&(offset as u16).to_le_bytes());
        offset += service.len();
    }
    for service in services {
        request.extend_from_slice(service);
    }
    request
}

/// Size a multi-service packet would have with these embedded requests.
pub fn multi_service_size(services: &[Vec<u8>]) -> usize {
    6 + 2 + 2 * services.len() + services.iter().map(Vec::len).sum::<usize>()
}

/// Unconnected Send through the connection manager, routed to the
/// processor slot.
pub fn unconnected_send(embedded: &[u8], slot: u8) -> Vec<u8> {
    let mut request = Vec::with_capacity(16 + embedded.len());
    request.push(SERVICE_UNCONNECTED_SEND);
    request.push(2); // path size in words
    request.extend_from_slice(&[0x20, 0x06, 0x24, 0x01]); // connection manager
    request.push(0x0A); // priority / time tick
    request.push(0x0F); // timeout ticks
    request.extend_from_slice(&(embedded.len() as u16).to_le_bytes());
    request.extend_from_slice(embedded);
    if embedded.len() % 2 != 0 {
        request.push(0x00);
    }
    request.push(1); // route path size in words
    request.push(0); // reserved
    request.push(0x01); // backplane port
    request.push(slot);
    request
}

/// One embedded service response: echoed service code, general status,
/// and the payload that follows the status words.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub service: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

impl ServiceResponse {
    /// The request service this response answers (`service | 0x80`).
    pub fn answers(&self, request_service: u8) -> bool {
        self.service == request_service | 0x80
    }
}

pub fn parse_service_response(bytes: &[u8]) -> Result<ServiceResponse, ProtocolError> {
    if bytes.len() < 4 {
        return Err(ProtocolError::Io("service response truncated".to_string()));
    }
    let service = bytes[0];
    let status = bytes[2];
    let extended_words = usize::from(bytes[3]);
    let data_start = 4 + extended_words * 2;
    if bytes.len() < data_start {
        return Err(ProtocolError::Io(
            "service response extended status truncated".to_string(),
        ));
    }
    Ok(ServiceResponse {
        service,
        status,
        data: bytes[data_start..].to_vec(),
    })
}

/// Split a multi-service response into its embedded responses, in order.
pub fn parse_multi_service_response(
    response: &ServiceResponse,
) -> Result<Vec<ServiceResponse>, ProtocolError> {
    if !response.answers(SERVICE_MULTIPLE) {
        return Err(ProtocolError::UnexpectedResponse);
    }
    let data = &response.data;
    if data.len() < 2 {
        return Err(ProtocolError::Io("multi-service response truncated".to_string()));
    }
    let count = usize::from(u16::from_le_bytes([data[0], data[1]]));
    if data.len() < 2 + 2 * count {
        return Err(ProtocolError::Io("multi-service offsets truncated".to_string()));
    }
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(usize::from(u16::from_le_bytes([
            data[2 + 2 * i],
            data[3 + 2 * i],
        ])));
    }
    let mut responses = Vec::with_capacity(count);
    for (i, offset) in offsets.iter().enumerate() {
        let end = if i + 1 < count { offsets[i + 1] } else { data.len() };
        if *offset > end || end > data.len() {
            return Err(ProtocolError::Io("multi-service offsets inconsistent".to_string()));
        }
        responses.push(parse_service_response(&data[*offset..end])?);
    }
    Ok(responses)
}
