use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use rvpf_core::ProtocolError;

use crate::channel::{ChannelConfig, ChannelReader, ChannelWriter};
use crate::codec::{encode_frame, Frame, FrameCodec, MAX_FRAME_SIZE};

/// Key of an association on a connection: (local address, remote address).
pub type AssocKey = (u16, u16);

/// Lifecycle notifications of a connection, consumed at the receiver's
/// own pace.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Opened,
    Closed(String),
    /// An association's link gave up (retries or keepalive exhausted).
    LinkDown { association: AssocKey },
}

/// Scheduling class of an outbound frame. Management frames bypass user
/// data; user data is drained round-robin across associations.
#[derive(Debug, Clone, Copy)]
pub enum SendClass {
    Management,
    User(AssocKey),
}

struct SendRequest {
    frame: Frame,
    class: SendClass,
}

/// Handle used by associations to enqueue outbound frames.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<SendRequest>,
    closed: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl FrameSender {
    pub fn send_management(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.send(frame, SendClass::Management)
    }

    pub fn send_user(&self, key: AssocKey, frame: Frame) -> Result<(), ProtocolError> {
        self.send(frame, SendClass::User(key))
    }

    fn send(&self, frame: Frame, class: SendClass) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::LinkDown);
        }
        self.tx
            .send(SendRequest { frame, class })
            .map_err(|_| ProtocolError::LinkDown)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

/// A full-duplex connection to one remote device. Owns the two pump
/// tasks; all other access goes through message passing.
pub struct Connection {
    sender: FrameSender,
    events: broadcast::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
    send_task: tokio::task::JoinHandle<()>,
    receive_task: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Open the channel and start the pumps. `dispatch` is invoked by the
    /// receive pump for every valid inbound frame; it must not block.
    pub async fn open(
        config: &ChannelConfig,
        dispatch: Arc<dyn Fn(Frame) + Send + Sync>,
    ) -> Result<Connection, ProtocolError> {
        let (reader, writer) = crate::channel::open(config).await?;
        Ok(Self::start(reader, writer, dispatch))
    }

    /// Start the pumps over an already-open channel (listener side).
    pub fn start(
        reader: ChannelReader,
        writer: ChannelWriter,
        dispatch: Arc<dyn Fn(Frame) + Send + Sync>,
    ) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let closed = Arc::new(AtomicBool::new(false));

        let sender = FrameSender {
            tx,
            closed: closed.clone(),
            events: events.clone(),
        };

        let send_task = tokio::spawn(send_pump(
            rx,
            writer,
            closed.clone(),
            events.clone(),
        ));
        let receive_task = tokio::spawn(receive_pump(
            reader,
            dispatch,
            closed.clone(),
            events.clone(),
        ));

        let _ = events.send(ConnectionEvent::Opened);
        Connection {
            sender,
            events,
            closed,
            send_task,
            receive_task,
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent teardown. Pending sends are dropped; the peer sees the
    /// stream close.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.events.send(ConnectionEvent::Closed(reason.to_string()));
        self.send_task.abort();
        self.receive_task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close("connection dropped");
    }
}

/// Drains the outbound queues. Management frames always go first; user
/// frames are taken one per association in rotation so a chatty
/// association cannot starve a quiet one.
async fn send_pump(
    mut rx: mpsc::UnboundedReceiver<SendRequest>,
    mut writer: ChannelWriter,
    closed: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
) {
    let mut management: VecDeque<Frame> = VecDeque::new();
    let mut user: HashMap<AssocKey, VecDeque<Frame>> = HashMap::new();
    let mut rotation: VecDeque<AssocKey> = VecDeque::new();

    loop {
        if management.is_empty() && rotation.is_empty() {
            match rx.recv().await {
                Some(request) => enqueue(request, &mut management, &mut user, &mut rotation),
                None => break,
            }
        }
        while let Ok(request) = rx.try_recv() {
            enqueue(request, &mut management, &mut user, &mut rotation);
        }

        let frame = if let Some(frame) = management.pop_front() {
            frame
        } else if let Some(key) = rotation.pop_front() {
            let queue = user.get_mut(&key).expect("rotation tracks queues");
            let frame = queue.pop_front().expect("queued key has a frame");
            if !queue.is_empty() {
                rotation.push_back(key);
            } else {
                user.remove(&key);
            }
            frame
        } else {
            continue;
        };

        let bytes = encode_frame(&frame);
        trace!(
            "sending frame dst={} src={} control={:#04x} ({} bytes)",
            frame.destination,
            frame.source,
            frame.control,
            bytes.len()
        );
        if let Err(e) = writer.send(&bytes).await {
            if !closed.swap(true, Ordering::AcqRel) {
                warn!("send pump stopping: {e}");
                let _ = events.send(ConnectionEvent::Closed(e.to_string()));
            }
            return;
        }
    }
}

fn enqueue(
    request: SendRequest,
    management: &mut VecDeque<Frame>,
    user: &mut HashMap<AssocKey, VecDeque<Frame>>,
    rotation: &mut VecDeque<AssocKey>,
) {
    match request.class {
        SendClass::Management => management.push_back(request.frame),
        SendClass::User(key) => {
            let queue = user.entry(key).or_default();
            if queue.is_empty() {
                rotation.push_back(key);
            }
            queue.push_back(request.frame);
        }
    }
}

/// Single reader of the channel: accumulates bytes, decodes frames, and
/// hands each to the dispatcher. Corrupt frames are dropped and counted;
/// reading continues.
async fn receive_pump(
    mut reader: ChannelReader,
    dispatch: Arc<dyn Fn(Frame) + Send + Sync>,
    closed: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
) {
    let mut codec = FrameCodec;
    let mut accumulated = BytesMut::with_capacity(MAX_FRAME_SIZE * 4);
    let mut chunk = [0u8; 2048];

    loop {
        let n = match reader.receive(&mut chunk).await {
            Ok(0) => {
                if !closed.swap(true, Ordering::AcqRel) {
                    debug!("receive pump: peer closed");
                    let _ = events.send(ConnectionEvent::Closed("peer closed".to_string()));
                }
                return;
            }
            Ok(n) => n,
            Err(e) => {
                if !closed.swap(true, Ordering::AcqRel) {
                    warn!("receive pump stopping: {e}");
                    let _ = events.send(ConnectionEvent::Closed(e.to_string()));
                }
                return;
            }
        };
        accumulated.extend_from_slice(&chunk[..n]);

        loop {
            match codec.decode(&mut accumulated) {
                Ok(Some(frame)) => dispatch(frame),
                Ok(None) => break,
                Err(ProtocolError::FrameCorrupt) => {
                    warn!("dropping frame that failed CRC validation");
                }
                Err(e) => {
                    warn!("receive pump stopping on decode failure: {e}");
                    if !closed.swap(true, Ordering::AcqRel) {
                        let _ = events.send(ConnectionEvent::Closed(e.to_string()));
                    }
                    return;
                }
            }
        }
    }
}

/// A connection-less sender for state-machine tests: frames enqueued on
/// it are forwarded to the returned receiver, classes ignored.
#[cfg(test)]
pub(crate) fn test_sender() -> (FrameSender, mpsc::UnboundedReceiver<Frame>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SendRequest>();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let _ = frame_tx.send(request.frame);
        }
    });
    let (events, _) = broadcast::channel(8);
    let sender = FrameSender {
        tx,
        closed: Arc::new(AtomicBool::new(false)),
        events,
    };
    (sender, frame_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (ChannelReader, ChannelWriter, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (read, write) = client.into_split();
        (ChannelReader::Tcp(read), ChannelWriter::Tcp(write), server)
    }

    #[tokio::test]
    async fn frames_reach_dispatcher() {
        let (reader, writer, mut server) = tcp_pair().await;
        let received: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let connection = Connection::start(
            reader,
            writer,
            Arc::new(move |frame| sink.lock().push(frame)),
        );

        let frame = Frame {
            control: 0xC4,
            destination: 1,
            source: 10,
            payload: vec![0xC0, 0x81, 0x00, 0x00],
        };
        server.write_all(&encode_frame(&frame)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(received.lock().as_slice(), &[frame]);
        connection.close("test done");
    }

    #[tokio::test]
    async fn corrupt_frame_is_dropped_and_reading_continues() {
        let (reader, writer, mut server) = tcp_pair().await;
        let received: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _connection = Connection::start(
            reader,
            writer,
            Arc::new(move |frame| sink.lock().push(frame)),
        );

        let good = Frame {
            control: 0xC4,
            destination: 1,
            source: 10,
            payload: vec![1, 2, 3, 4],
        };
        let mut bad = encode_frame(&good);
        let body_at = 10;
        bad[body_at] ^= 0xFF;
        server.write_all(&bad).await.unwrap();
        server.write_all(&encode_frame(&good)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(received.lock().as_slice(), &[good]);
    }

    #[tokio::test]
    async fn send_after_close_is_link_down() {
        let (reader, writer, _server) = tcp_pair().await;
        let connection = Connection::start(reader, writer, Arc::new(|_| {}));
        let sender = connection.sender();
        connection.close("going away");

        let frame = Frame {
            control: 0xC0,
            destination: 1,
            source: 10,
            payload: vec![],
        };
        assert_eq!(
            sender.send_management(frame).unwrap_err(),
            ProtocolError::LinkDown
        );
    }

    #[tokio::test]
    async fn peer_close_emits_event() {
        let (reader, writer, server) = tcp_pair().await;
        let connection = Connection::start(reader, writer, Arc::new(|_| {}));
        let mut events = connection.subscribe();
        drop(server);

        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
                .await
                .expect("close event must arrive")
                .unwrap()
            {
                ConnectionEvent::Closed(_) => break,
                _ => continue,
            }
        }
        assert!(connection.is_closed());
    }
}
