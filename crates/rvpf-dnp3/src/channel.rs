use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use rvpf_core::config::SerialConfig;
use rvpf_core::ProtocolError;

/// How to reach the remote device.
#[derive(Debug, Clone)]
pub enum ChannelConfig {
    Tcp { target: SocketAddr },
    Udp { bind: SocketAddr, peer: SocketAddr },
    Serial(SerialConfig),
}

/// Reading half of a full-duplex byte channel.
pub enum ChannelReader {
    Tcp(OwnedReadHalf),
    Udp { socket: Arc<UdpSocket>, peer: SocketAddr },
    Serial(tokio::io::ReadHalf<SerialStream>),
}

/// Writing half of a full-duplex byte channel.
pub enum ChannelWriter {
    Tcp(OwnedWriteHalf),
    Udp { socket: Arc<UdpSocket>, peer: SocketAddr },
    Serial(tokio::io::WriteHalf<SerialStream>),
}

/// Open the configured channel and split it for the two pumps.
pub async fn open(config: &ChannelConfig) -> Result<(ChannelReader, ChannelWriter), ProtocolError> {
    match config {
        ChannelConfig::Tcp { target } => {
            let stream = TcpStream::connect(target)
                .await
                .map_err(|e| ProtocolError::ServiceUnavailable(e.to_string()))?;
            stream.set_nodelay(true)?;
            let (read, write) = stream.into_split();
            Ok((ChannelReader::Tcp(read), ChannelWriter::Tcp(write)))
        }
        ChannelConfig::Udp { bind, peer } => {
            let socket = UdpSocket::bind(bind)
                .await
                .map_err(|e| ProtocolError::ServiceUnavailable(e.to_string()))?;
            let socket = Arc::new(socket);
            Ok((
                ChannelReader::Udp { socket: socket.clone(), peer: *peer },
                ChannelWriter::Udp { socket, peer: *peer },
            ))
        }
        ChannelConfig::Serial(serial) => {
            let stream = open_serial(serial)?;
            let (read, write) = tokio::io::split(stream);
            Ok((ChannelReader::Serial(read), ChannelWriter::Serial(write)))
        }
    }
}

fn open_serial(config: &SerialConfig) -> Result<SerialStream, ProtocolError> {
    let data_bits = match config.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(ProtocolError::ServiceUnavailable(format!(
                "unsupported data bits: {other}"
            )))
        }
    };
    let parity = match config.parity.as_str() {
        "none" => tokio_serial::Parity::None,
        "odd" => tokio_serial::Parity::Odd,
        "even" => tokio_serial::Parity::Even,
        other => {
            return Err(ProtocolError::ServiceUnavailable(format!(
                "unsupported parity: {other}"
            )))
        }
    };
    let stop_bits = match config.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            return Err(ProtocolError::ServiceUnavailable(format!(
                "unsupported stop bits: {other}"
            )))
        }
    };

    let stream = tokio_serial::new(&config.port_name, config.speed)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()
        .map_err(|e| ProtocolError::ServiceUnavailable(e.to_string()))?;

    // Stale bytes from a previous session would desynchronize framing.
    if let Err(e) = stream.clear(tokio_serial::ClearBuffer::All) {
        warn!("purge of {} failed: {e}", config.port_name);
    }
    debug!(
        "opened {} at {} baud ({}{}{})",
        config.port_name, config.speed, config.data_bits, config.parity, config.stop_bits
    );
    Ok(stream)
}

impl ChannelReader {
    /// Read the next chunk of bytes. Returns 0 when the peer closed.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        match self {
            ChannelReader::Tcp(read) => Ok(read.read(buf).await?),
            ChannelReader::Udp { socket, peer } => loop {
                let (n, from) = socket.recv_from(buf).await?;
                if from != *peer {
                    debug!("dropping datagram from unexpected source {from}");
                    continue;
                }
                return Ok(n);
            },
            ChannelReader::Serial(read) => Ok(read.read(buf).await?),
        }
    }
}

impl ChannelWriter {
    /// Write one frame's bytes. UDP sends exactly one datagram per call.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        match self {
            ChannelWriter::Tcp(write) => Ok(write.write_all(bytes).await?),
            ChannelWriter::Udp { socket, peer } => {
                let sent = socket.send_to(bytes, *peer).await?;
                if sent != bytes.len() {
                    return Err(ProtocolError::Io(format!(
                        "datagram truncated: {sent} of {} bytes",
                        bytes.len()
                    )));
                }
                Ok(())
            }
            ChannelWriter::Serial(write) => Ok(write.write_all(bytes).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_channel_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let config = ChannelConfig::Tcp { target: addr };
        let (mut reader, mut writer) = open(&config).await.unwrap();
        writer.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_close_yields_zero_not_hang() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let (mut reader, _writer) = open(&ChannelConfig::Tcp { target: addr }).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), reader.receive(&mut buf))
            .await
            .expect("receive must resolve on close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn udp_filters_unexpected_sources() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let config = ChannelConfig::Udp {
            bind: "127.0.0.1:0".parse().unwrap(),
            peer: peer_addr,
        };
        let (mut reader, writer) = open(&config).await.unwrap();
        let local = match &writer {
            ChannelWriter::Udp { socket, .. } => socket.local_addr().unwrap(),
            _ => unreachable!(),
        };

        stranger.send_to(&[9, 9, 9], local).await.unwrap();
        peer.send_to(&[1, 2], local).await.unwrap();

        let mut buf = [0u8; 16];
        let n = reader.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2]);
    }

    #[tokio::test]
    async fn connect_refused_is_service_unavailable() {
        // Bind-then-drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = open(&ChannelConfig::Tcp { target: addr }).await;
        assert!(matches!(
            result,
            Err(ProtocolError::ServiceUnavailable(_))
        ));
    }
}
