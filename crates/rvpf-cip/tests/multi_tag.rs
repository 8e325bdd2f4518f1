//! Multi-tag batching against a scripted controller fixture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use rvpf_core::content::ContentKind;
use rvpf_core::{Point, PointExchange, ProtocolError, Value};
use rvpf_cip::codec::{
    encapsulate, parse_rr_data, send_rr_data, EncapHeader, COMMAND_REGISTER_SESSION,
    COMMAND_SEND_RR_DATA, COMMAND_UNREGISTER_SESSION, ENCAP_HEADER_SIZE, SERVICE_MULTIPLE,
    SERVICE_READ_TAG, SERVICE_UNCONNECTED_SEND,
};
use rvpf_cip::proxy::{ATTR_ELEMENTS, ATTR_TAG};
use rvpf_cip::{DataKind, ServerProxy};

/// Per-tag fixture: type code and element values.
type Fixtures = HashMap<String, (DataKind, Vec<i64>)>;

fn parse_tag(request: &[u8]) -> (String, u16, usize) {
    assert_eq!(request[0], SERVICE_READ_TAG);
    let path_words = usize::from(request[1]);
    let path = &request[2..2 + path_words * 2];
    assert_eq!(path[0], 0x91);
    let len = usize::from(path[1]);
    let tag = String::from_utf8(path[2..2 + len].to_vec()).unwrap();
    let elements_at = 2 + path_words * 2;
    let elements = u16::from_le_bytes([request[elements_at], request[elements_at + 1]]);
    (tag, elements, elements_at + 2)
}

fn read_response(fixtures: &Fixtures, request: &[u8]) -> Vec<u8> {
    let (tag, elements, _) = parse_tag(request);
    let mut response = vec![SERVICE_READ_TAG | 0x80, 0x00];
    match fixtures.get(&tag) {
        Some((kind, values)) => {
            assert_eq!(usize::from(elements), values.len(), "fixture mismatch for {tag}");
            response.extend_from_slice(&[0x00, 0x00]); // status ok
            response.extend_from_slice(&kind.code().to_le_bytes());
            for value in values {
                match kind {
                    DataKind::Int => {
                        response.extend_from_slice(&(*value as i16).to_le_bytes())
                    }
                    DataKind::Dint => {
                        response.extend_from_slice(&(*value as i32).to_le_bytes())
                    }
                    other => panic!("fixture kind {other:?} not scripted"),
                }
            }
        }
        None => response.extend_from_slice(&[0x05, 0x00]), // path unknown
    }
    response
}

/// Unwrap an Unconnected Send to its embedded request.
fn unwrap_unconnected(routed: &[u8]) -> &[u8] {
    assert_eq!(routed[0], SERVICE_UNCONNECTED_SEND);
    let size = usize::from(u16::from_le_bytes([routed[8], routed[9]]));
    &routed[10..10 + size]
}

async fn spawn_controller(fixtures: Fixtures) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let rr_count = Arc::new(AtomicUsize::new(0));
    let counter = rr_count.clone();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        loop {
            let mut header_bytes = [0u8; ENCAP_HEADER_SIZE];
            if socket.read_exact(&mut header_bytes).await.is_err() {
                return;
            }
            let header = EncapHeader::parse(&header_bytes).unwrap();
            let mut data = vec![0u8; usize::from(header.length)];
            if !data.is_empty() && socket.read_exact(&mut data).await.is_err() {
                return;
            }
            match header.command {
                COMMAND_REGISTER_SESSION => {
                    let mut reply =
                        encapsulate(COMMAND_REGISTER_SESSION, 0xBEEF, header.context, &data);
                    reply[4..8].copy_from_slice(&0xBEEFu32.to_le_bytes());
                    socket.write_all(&reply).await.unwrap();
                }
                COMMAND_SEND_RR_DATA => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let routed = parse_rr_data(&data).unwrap();
                    let embedded = unwrap_unconnected(routed);
                    let cip_response = if embedded[0] == SERVICE_MULTIPLE {
                        let body = &embedded[6..];
                        let count = usize::from(u16::from_le_bytes([body[0], body[1]]));
                        let mut offsets = Vec::new();
                        for i in 0..count {
                            offsets.push(usize::from(u16::from_le_bytes([
                                body[2 + 2 * i],
                                body[3 + 2 * i],
                            ])));
                        }
                        let mut replies = Vec::new();
                        for (i, offset) in offsets.iter().enumerate() {
                            let end = if i + 1 < count { offsets[i + 1] } else { body.len() };
                            replies.push(read_response(&fixtures, &body[*offset..end]));
                        }
                        let mut out = vec![SERVICE_MULTIPLE | 0x80, 0x00, 0x00, 0x00];
                        out.extend_from_slice(&(count as u16).to_le_bytes());
                        let mut offset = 2 + 2 * count;
                        for reply in &replies {
                            out.extend_from_slice(&(offset as u16).to_le_bytes());
                            offset += reply.len();
                        }
                        for reply in &replies {
                            out.extend_from_slice(reply);
                        }
                        out
                    } else {
                        read_response(&fixtures, embedded)
                    };
                    let reply = encapsulate(
                        COMMAND_SEND_RR_DATA,
                        header.session,
                        header.context,
                        &send_rr_data(&cip_response, 10),
                    );
                    socket.write_all(&reply).await.unwrap();
                }
                COMMAND_UNREGISTER_SESSION => return,
                other => panic!("unexpected command {other:#x}"),
            }
        }
    });
    (addr, rr_count)
}

fn tag_point(name: &str, tag: &str, elements: u16) -> Point {
    let point = Point::new(name, "plc-1")
        .with_content(ContentKind::Count)
        .with_attribute(ATTR_TAG, tag);
    if elements > 1 {
        point.with_attribute(ATTR_ELEMENTS, elements)
    } else {
        point
    }
}

#[tokio::test]
async fn multi_tag_read_uses_one_round_trip() {
    let mut fixtures: Fixtures = HashMap::new();
    fixtures.insert("tag_a".to_string(), (DataKind::Dint, vec![111]));
    fixtures.insert("tag_b".to_string(), (DataKind::Int, (0..10).collect()));
    fixtures.insert("tag_c".to_string(), (DataKind::Dint, vec![-42]));
    let (addr, rr_count) = spawn_controller(fixtures).await;

    let mut proxy = ServerProxy::new(
        "cip-test",
        addr.ip().to_string(),
        addr.port(),
        0,
        Duration::from_millis(1000),
    );
    proxy.request_read(tag_point("plc.a", "tag_a", 1));
    proxy.request_read(tag_point("plc.b", "tag_b", 10));
    proxy.request_read(tag_point("plc.c", "tag_c", 1));
    let results = proxy.commit_reads().await;

    // The whole batch fits one multi-service packet: one SendRRData.
    assert_eq!(rr_count.load(Ordering::SeqCst), 1);

    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0].outcome.as_ref().unwrap().value,
        Some(Value::Long(111))
    );
    let expected: Vec<Value> = (0..10).map(Value::Long).collect();
    assert_eq!(
        results[1].outcome.as_ref().unwrap().value,
        Some(Value::Tuple(expected))
    );
    assert_eq!(
        results[2].outcome.as_ref().unwrap().value,
        Some(Value::Long(-42))
    );
}

#[tokio::test]
async fn unknown_tag_fails_its_own_request_only() {
    let mut fixtures: Fixtures = HashMap::new();
    fixtures.insert("known".to_string(), (DataKind::Dint, vec![7]));
    let (addr, _) = spawn_controller(fixtures).await;

    let mut proxy = ServerProxy::new(
        "cip-test",
        addr.ip().to_string(),
        addr.port(),
        0,
        Duration::from_millis(1000),
    );
    proxy.request_read(tag_point("plc.known", "known", 1));
    proxy.request_read(tag_point("plc.ghost", "ghost", 1));
    let results = proxy.commit_reads().await;

    assert_eq!(
        results[0].outcome.as_ref().unwrap().value,
        Some(Value::Long(7))
    );
    assert!(matches!(
        results[1].outcome,
        Err(ProtocolError::BadValue(_))
    ));
}

#[tokio::test]
async fn single_tag_write_round_trip() {
    // Writes are acknowledged with an empty payload by the fixture.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        loop {
            let mut header_bytes = [0u8; ENCAP_HEADER_SIZE];
            if socket.read_exact(&mut header_bytes).await.is_err() {
                return;
            }
            let header = EncapHeader::parse(&header_bytes).unwrap();
            let mut data = vec![0u8; usize::from(header.length)];
            if !data.is_empty() && socket.read_exact(&mut data).await.is_err() {
                return;
            }
            match header.command {
                COMMAND_REGISTER_SESSION => {
                    let mut reply =
                        encapsulate(COMMAND_REGISTER_SESSION, 0x77, header.context, &data);
                    reply[4..8].copy_from_slice(&0x77u32.to_le_bytes());
                    socket.write_all(&reply).await.unwrap();
                }
                COMMAND_SEND_RR_DATA => {
                    let ack = vec![0xCD, 0x00, 0x00, 0x00];
                    let reply = encapsulate(
                        COMMAND_SEND_RR_DATA,
                        header.session,
                        header.context,
                        &send_rr_data(&ack, 10),
                    );
                    socket.write_all(&reply).await.unwrap();
                }
                _ => return,
            }
        }
    });

    let mut proxy = ServerProxy::new(
        "cip-test",
        addr.ip().to_string(),
        addr.port(),
        0,
        Duration::from_millis(1000),
    );
    let point = tag_point("plc.setpoint", "setpoint", 1);
    let value = rvpf_core::PointValue::new(&point, rvpf_core::DateTime::now(), Value::Long(9));
    let errors = proxy.update_point_values(&[(value, point)]).await;
    assert_eq!(errors, vec![None]);
}
