use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use rvpf_core::ProtocolError;

use crate::codec::{
    encapsulate, parse_rr_data, parse_service_response, register_session_data, send_rr_data,
    unconnected_send, EncapHeader, ServiceResponse, COMMAND_REGISTER_SESSION,
    COMMAND_SEND_RR_DATA, COMMAND_UNREGISTER_SESSION, ENCAP_HEADER_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Registering,
    Open,
    Draining,
}

/// One registered EtherNet/IP session over TCP.
///
/// Requests are serialized: every exchange stamps a fresh request id
/// into the sender context, and the echoed context must match, or the
/// session is considered compromised and torn down.
pub struct CipSession {
    state: SessionState,
    stream: Option<TcpStream>,
    session_handle: u32,
    next_request_id: u32,
    timeout: Duration,
    slot: u8,
}

impl CipSession {
    pub fn new(timeout: Duration, slot: u8) -> CipSession {
        CipSession {
            state: SessionState::Closed,
            stream: None,
            session_handle: 0,
            next_request_id: 1,
            timeout,
            slot,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn context_for(&mut self) -> ([u8; 8], u32) {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let mut context = [0u8; 8];
        context[..4].copy_from_slice(&id.to_le_bytes());
        (context, id)
    }

    /// Connect and register the session.
    pub async fn open(&mut self, host: &str, port: u16) -> Result<(), ProtocolError> {
        self.teardown();
        self.state = SessionState::Registering;

        let stream = tokio::time::timeout(
            self.timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| {
            ProtocolError::ServiceUnavailable(format!("connect to {host}:{port} timed out"))
        })?
        .map_err(|e| ProtocolError::ServiceUnavailable(e.to_string()))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let (context, id) = self.context_for();
        let packet = encapsulate(
            COMMAND_REGISTER_SESSION,
            0,
            context,
            &register_session_data(),
        );
        let header = match self.exchange(&packet, id).await {
            Ok((header, _)) => header,
            Err(e) => {
                self.teardown();
                return Err(e);
            }
        };
        if header.command != COMMAND_REGISTER_SESSION || header.status != 0 {
            self.teardown();
            return Err(ProtocolError::ServiceUnavailable(format!(
                "session registration refused (status {:#x})",
                header.status
            )));
        }
        self.session_handle = header.session;
        self.state = SessionState::Open;
        info!("session {:#010x} registered with {host}:{port}", header.session);
        Ok(())
    }

    /// Send one CIP request (already service-encoded) as an unconnected
    /// send and return the parsed service response.
    pub async fn transact(&mut self, cip_request: &[u8]) -> Result<ServiceResponse, ProtocolError> {
        if self.state != SessionState::Open {
            return Err(ProtocolError::ServiceUnavailable(
                "session is not open".to_string(),
            ));
        }
        let routed = unconnected_send(cip_request, self.slot);
        let (context, id) = self.context_for();
        let packet = encapsulate(
            COMMAND_SEND_RR_DATA,
            self.session_handle,
            context,
            &send_rr_data(&routed, self.timeout.as_secs().max(1) as u16),
        );
        let (header, data) = match self.exchange(&packet, id).await {
            Ok(response) => response,
            Err(e) => {
                // Session-level failures are fatal to the session.
                self.teardown();
                return Err(e);
            }
        };
        if header.command != COMMAND_SEND_RR_DATA || header.status != 0 {
            self.teardown();
            return Err(ProtocolError::UnexpectedResponse);
        }
        let embedded = parse_rr_data(&data)?;
        parse_service_response(embedded)
    }

    /// One request/response over the stream, correlated by context.
    async fn exchange(
        &mut self,
        packet: &[u8],
        request_id: u32,
    ) -> Result<(EncapHeader, Vec<u8>), ProtocolError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ProtocolError::ServiceUnavailable("no connection".to_string()))?;

        tokio::time::timeout(self.timeout, stream.write_all(packet))
            .await
            .map_err(|_| ProtocolError::ApplicationTimeout(self.timeout))??;

        let mut header_bytes = [0u8; ENCAP_HEADER_SIZE];
        tokio::time::timeout(self.timeout, stream.read_exact(&mut header_bytes))
            .await
            .map_err(|_| ProtocolError::ApplicationTimeout(self.timeout))??;
        let header = EncapHeader::parse(&header_bytes)?;

        let mut data = vec![0u8; usize::from(header.length)];
        if !data.is_empty() {
            tokio::time::timeout(self.timeout, stream.read_exact(&mut data))
                .await
                .map_err(|_| ProtocolError::ApplicationTimeout(self.timeout))??;
        }

        let echoed = u32::from_le_bytes([
            header.context[0],
            header.context[1],
            header.context[2],
            header.context[3],
        ]);
        if echoed != request_id {
            warn!("response context {echoed} does not match request {request_id}");
            return Err(ProtocolError::UnexpectedResponse);
        }
        Ok((header, data))
    }

    /// Unregister (best effort) and drop the connection.
    pub async fn close(&mut self) {
        if self.state == SessionState::Open {
            self.state = SessionState::Draining;
            let (context, _) = self.context_for();
            let packet = encapsulate(
                COMMAND_UNREGISTER_SESSION,
                self.session_handle,
                context,
                &[],
            );
            if let Some(stream) = self.stream.as_mut() {
                let _ = tokio::time::timeout(self.timeout, stream.write_all(&packet)).await;
            }
            debug!("session {:#010x} unregistered", self.session_handle);
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.session_handle = 0;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal controller fixture: registers sessions and echoes a
    /// scripted service response to every SendRRData.
    async fn spawn_controller(scripted: Vec<u8>, corrupt_context: bool) -> std::net::SocketAddr {
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
                let mut context = header.context;
                if corrupt_context {
                    context[0] ^= 0xFF;
                }
                match header.command {
                    COMMAND_REGISTER_SESSION => {
                        let mut reply =
                            encapsulate(COMMAND_REGISTER_SESSION, 0x1001, context, &data);
                        reply[4..8].copy_from_slice(&0x1001u32.to_le_bytes());
                        socket.write_all(&reply).await.unwrap();
                    }
                    COMMAND_SEND_RR_DATA => {
                        let body = send_rr_data(&scripted, 10);
                        let reply =
                            encapsulate(COMMAND_SEND_RR_DATA, header.session, context, &body);
                        socket.write_all(&reply).await.unwrap();
                    }
                    COMMAND_UNREGISTER_SESSION => return,
                    other => panic!("unexpected command {other:#x}"),
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn register_transact_unregister() {
        // Scripted response: read-tag reply carrying INT 12345.
        let scripted = vec![0xCC, 0x00, 0x00, 0x00, 0xC3, 0x00, 0x39, 0x30];
        let addr = spawn_controller(scripted, false).await;

        let mut session = CipSession::new(Duration::from_millis(1000), 0);
        assert_eq!(session.state(), SessionState::Closed);
        session.open("127.0.0.1", addr.port()).await.unwrap();
        assert!(session.is_open());

        let request = crate::codec::read_tag_request("tag_a", 1).unwrap();
        let response = session.transact(&request).await.unwrap();
        assert!(response.answers(crate::codec::SERVICE_READ_TAG));
        assert_eq!(response.data, vec![0xC3, 0x00, 0x39, 0x30]);

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn context_mismatch_is_fatal() {
        let scripted = vec![0xCC, 0x00, 0x00, 0x00, 0xC3, 0x00, 0x01, 0x00];
        let addr = spawn_controller(scripted, true).await;

        let mut session = CipSession::new(Duration::from_millis(1000), 0);
        let err = session.open("127.0.0.1", addr.port()).await.unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedResponse);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn transact_without_open_is_unavailable() {
        let mut session = CipSession::new(Duration::from_millis(100), 0);
        let err = session.transact(&[0x4C]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn silent_controller_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let mut session = CipSession::new(Duration::from_millis(200), 0);
        let err = session.open("127.0.0.1", addr.port()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ApplicationTimeout(_)));
    }
}
