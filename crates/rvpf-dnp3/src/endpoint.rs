use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use rvpf_core::config::{ApplicationConfig, LinkConfig};
use rvpf_core::ProtocolError;

use crate::app::{
    next_app_seq, pack_items, AppControl, Fragment, FunctionCode, InternalIndications, ObjectItem,
};
use crate::channel::ChannelConfig;
use crate::codec::Frame;
use crate::connection::{AssocKey, Connection, ConnectionEvent, FrameSender};
use crate::link::{LinkLayer, LinkControl, LinkState, PrimaryFunction, SecondaryFunction};
use crate::transport::{Reassembler, Segmenter};

/// Application layer state of one direction of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Idle,
    AwaitingResponse,
    AwaitingConfirm,
}

/// The logical channel between one local and one remote address, with
/// its own link, transport, and application state.
pub struct Association {
    pub key: AssocKey,
    link: LinkLayer,
    app_config: ApplicationConfig,
    confirmed_user_data: bool,
    sender: FrameSender,
    state: Mutex<AppState>,
    segmenter: Mutex<Segmenter>,
    reassembler: Mutex<Reassembler>,
    app_seq: Mutex<u8>,
    unsolicited_seq: Mutex<u8>,
    responses_tx: mpsc::UnboundedSender<Result<Fragment, ProtocolError>>,
    responses_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Fragment, ProtocolError>>>,
    requests_tx: mpsc::UnboundedSender<Fragment>,
    requests_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Fragment>>,
    confirms_tx: mpsc::UnboundedSender<Fragment>,
    confirms_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Fragment>>,
    unsolicited_tx: broadcast::Sender<Fragment>,
    keepalive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Association {
    fn new(
        key: AssocKey,
        link_config: LinkConfig,
        app_config: ApplicationConfig,
        confirmed_user_data: bool,
        master: bool,
        sender: FrameSender,
        unsolicited_tx: broadcast::Sender<Fragment>,
    ) -> Arc<Association> {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (confirms_tx, confirms_rx) = mpsc::unbounded_channel();
        let max_fragment = app_config.max_fragment_size;

        let association = Arc::new(Association {
            key,
            link: LinkLayer::new(link_config, key.0, key.1, master),
            app_config,
            confirmed_user_data,
            sender,
            state: Mutex::new(AppState::Idle),
            segmenter: Mutex::new(Segmenter::new()),
            reassembler: Mutex::new(Reassembler::new(max_fragment)),
            app_seq: Mutex::new(0),
            unsolicited_seq: Mutex::new(0),
            responses_tx,
            responses_rx: tokio::sync::Mutex::new(responses_rx),
            requests_tx,
            requests_rx: tokio::sync::Mutex::new(requests_rx),
            confirms_tx,
            confirms_rx: tokio::sync::Mutex::new(confirms_rx),
            unsolicited_tx,
            keepalive_task: Mutex::new(None),
        });
        association.spawn_keepalive();
        association
    }

    pub fn app_state(&self) -> AppState {
        *self.state.lock()
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// Inbound frame from the receive pump. Classifies by link function:
    /// secondary frames complete the link's echo slot, management frames
    /// are answered in place, user data goes through reassembly.
    pub(crate) fn on_frame(&self, frame: Frame) {
        let control = LinkControl::from_byte(frame.control);
        if !control.prm {
            match SecondaryFunction::from_code(control.function) {
                Some(function) => self.link.on_secondary(function),
                None => warn!(
                    "association {:?}: unknown secondary function {}",
                    self.key, control.function
                ),
            }
            return;
        }
        match PrimaryFunction::from_code(control.function) {
            Some(PrimaryFunction::ConfirmedUserData) => {
                self.link.note_activity();
                let ack = self.link.secondary_frame(SecondaryFunction::Ack);
                let _ = self.sender.send_management(ack);
                self.on_user_data(&frame.payload);
            }
            Some(PrimaryFunction::UnconfirmedUserData) => {
                self.link.note_activity();
                self.on_user_data(&frame.payload);
            }
            Some(management) => {
                if let Some(reply) = self.link.on_primary_management(management) {
                    let _ = self.sender.send_management(reply);
                }
            }
            None => {
                warn!(
                    "association {:?}: unsupported primary function {}",
                    self.key, control.function
                );
                let reply = self.link.secondary_frame(SecondaryFunction::NotSupported);
                let _ = self.sender.send_management(reply);
            }
        }
    }

    fn on_user_data(&self, payload: &[u8]) {
        let complete = self.reassembler.lock().push(payload);
        match complete {
            Ok(Some(bytes)) => match Fragment::decode(&bytes) {
                Ok(fragment) => self.route_fragment(fragment),
                Err(e) => {
                    warn!("association {:?}: undecodable fragment: {e}", self.key);
                    let _ = self.responses_tx.send(Err(e));
                }
            },
            Ok(None) => {}
            Err(e) => {
                // The aborted fragment is lost; the stream itself stays up.
                debug!("association {:?}: {e}", self.key);
            }
        }
    }

    fn route_fragment(&self, fragment: Fragment) {
        match fragment.function {
            FunctionCode::Confirm => {
                let _ = self.confirms_tx.send(fragment);
            }
            FunctionCode::Response => {
                if fragment.control.con {
                    let confirm = Fragment::confirm(fragment.control.seq, false);
                    if let Err(e) = self.send_fragment_unconfirmed(&confirm) {
                        warn!("association {:?}: confirm not sent: {e}", self.key);
                    }
                }
                let _ = self.responses_tx.send(Ok(fragment));
            }
            FunctionCode::UnsolicitedResponse => {
                if fragment.control.con {
                    let confirm = Fragment::confirm(fragment.control.seq, true);
                    if let Err(e) = self.send_fragment_unconfirmed(&confirm) {
                        warn!("association {:?}: confirm not sent: {e}", self.key);
                    }
                }
                if self.unsolicited_tx.send(fragment).is_err() {
                    debug!("association {:?}: unsolicited response dropped", self.key);
                }
            }
            _ => {
                let _ = self.requests_tx.send(fragment);
            }
        }
    }

    fn send_fragment_unconfirmed(&self, fragment: &Fragment) -> Result<(), ProtocolError> {
        let bytes = fragment.encode();
        let segments = self.segmenter.lock().split(&bytes);
        for segment in segments {
            self.link.send_unconfirmed(&self.sender, segment)?;
        }
        Ok(())
    }

    async fn send_fragment(&self, fragment: &Fragment) -> Result<(), ProtocolError> {
        if !self.confirmed_user_data {
            return self.send_fragment_unconfirmed(fragment);
        }
        let bytes = fragment.encode();
        let segments = self.segmenter.lock().split(&bytes);
        for segment in segments {
            self.link.send_confirmed(&self.sender, segment).await?;
        }
        Ok(())
    }

    /// One request/response exchange from the master side. Multi-fragment
    /// responses are accumulated until FIN; confirmable fragments are
    /// acknowledged by the routing layer as they arrive.
    pub async fn transact(
        &self,
        function: FunctionCode,
        items: Vec<ObjectItem>,
        timeout: Duration,
    ) -> Result<(Vec<ObjectItem>, InternalIndications), ProtocolError> {
        self.link.ensure_active(&self.sender).await?;

        let seq = {
            let mut app_seq = self.app_seq.lock();
            let seq = *app_seq;
            *app_seq = next_app_seq(seq);
            seq
        };
        let request = Fragment::request(function, seq, items);

        let mut rx = self.responses_rx.lock().await;
        while rx.try_recv().is_ok() {
            debug!("association {:?}: discarding stale response", self.key);
        }

        *self.state.lock() = AppState::AwaitingResponse;
        let result = self.await_response(&mut rx, &request, seq, timeout).await;
        *self.state.lock() = AppState::Idle;
        result
    }

    async fn await_response(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Result<Fragment, ProtocolError>>,
        request: &Fragment,
        seq: u8,
        timeout: Duration,
    ) -> Result<(Vec<ObjectItem>, InternalIndications), ProtocolError> {
        self.send_fragment(request).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut collected = Vec::new();
        let mut iin = InternalIndications::default();
        let mut expected = seq;
        loop {
            let fragment = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Err(ProtocolError::ApplicationTimeout(timeout)),
                Ok(None) => return Err(ProtocolError::Cancelled),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(fragment))) => fragment,
            };
            if fragment.control.seq != expected {
                debug!(
                    "association {:?}: response seq {} while expecting {expected}",
                    self.key, fragment.control.seq
                );
                continue;
            }
            if let Some(indications) = fragment.iin {
                iin = indications;
            }
            let fin = fragment.control.fin;
            collected.extend(fragment.items);
            if fin {
                return Ok((collected, iin));
            }
            expected = next_app_seq(fragment.control.seq);
        }
    }

    /// Next inbound request fragment (outstation side).
    pub async fn recv_request(&self) -> Option<Fragment> {
        self.requests_rx.lock().await.recv().await
    }

    /// Send a response, splitting into confirmable fragments as needed.
    /// Intermediate fragments carry `FIN=0, CON=1` and are paced by the
    /// peer's confirms; the final fragment carries `FIN=1`.
    pub async fn respond(
        &self,
        request_seq: u8,
        items: Vec<ObjectItem>,
        iin: InternalIndications,
    ) -> Result<(), ProtocolError> {
        let chunks = pack_items(items, FunctionCode::Response, self.app_config.max_fragment_size);
        let last = chunks.len() - 1;
        let mut seq = request_seq;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let con = i != last;
            let fragment = Fragment {
                control: AppControl {
                    fir: i == 0,
                    fin: i == last,
                    con,
                    uns: false,
                    seq,
                },
                function: FunctionCode::Response,
                iin: Some(iin),
                items: chunk,
            };
            self.send_fragment(&fragment).await?;
            if con {
                *self.state.lock() = AppState::AwaitingConfirm;
                let confirmed = self.await_confirm(seq).await;
                *self.state.lock() = AppState::Idle;
                confirmed?;
            }
            seq = next_app_seq(seq);
        }
        Ok(())
    }

    /// Send an unsolicited response using the independent sequence
    /// counter; the peer's confirm is awaited when requested.
    pub async fn send_unsolicited(
        &self,
        items: Vec<ObjectItem>,
        iin: InternalIndications,
        confirmable: bool,
    ) -> Result<(), ProtocolError> {
        let seq = {
            let mut unsolicited_seq = self.unsolicited_seq.lock();
            let seq = *unsolicited_seq;
            *unsolicited_seq = next_app_seq(seq);
            seq
        };
        let fragment = Fragment {
            control: AppControl {
                fir: true,
                fin: true,
                con: confirmable,
                uns: true,
                seq,
            },
            function: FunctionCode::UnsolicitedResponse,
            iin: Some(iin),
            items,
        };
        self.send_fragment(&fragment).await?;
        if confirmable {
            self.await_confirm(seq).await?;
        }
        Ok(())
    }

    async fn await_confirm(&self, seq: u8) -> Result<(), ProtocolError> {
        let deadline = tokio::time::Instant::now() + self.app_config.timeout;
        let mut rx = self.confirms_rx.lock().await;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Err(ProtocolError::ApplicationTimeout(self.app_config.timeout)),
                Ok(None) => return Err(ProtocolError::Cancelled),
                Ok(Some(confirm)) if confirm.control.seq == seq => return Ok(()),
                Ok(Some(confirm)) => debug!(
                    "association {:?}: confirm seq {} while expecting {seq}",
                    self.key, confirm.control.seq
                ),
            }
        }
    }

    /// Fail the transaction currently awaiting a response, if any.
    pub(crate) fn fail_pending(&self, error: ProtocolError) {
        let _ = self.responses_tx.send(Err(error));
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let Some(keepalive) = self.link.keepalive() else {
            return;
        };
        let association = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(keepalive).await;
                let Some(association) = association.upgrade() else {
                    return;
                };
                if association.sender.is_closed() {
                    // Connection went away underneath us: the link is
                    // down by definition.
                    association.link.mark_down();
                    association.fail_pending(ProtocolError::LinkDown);
                    association.sender.emit(ConnectionEvent::LinkDown {
                        association: association.key,
                    });
                    return;
                }
                if association.link.idle_for() < keepalive
                    || association.link_state() != LinkState::SecReset
                {
                    continue;
                }
                if let Err(e) = association.link.probe(&association.sender).await {
                    warn!("association {:?}: keepalive failed: {e}", association.key);
                    association.fail_pending(ProtocolError::LinkDown);
                    association.sender.emit(ConnectionEvent::LinkDown {
                        association: association.key,
                    });
                    return;
                }
            }
        });
        *self.keepalive_task.lock() = Some(handle);
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive_task.lock().take() {
            handle.abort();
        }
    }
}

/// Per-connection policy and tuning shared by its associations.
#[derive(Debug, Clone)]
pub struct EndPointOptions {
    pub link: LinkConfig,
    pub application: ApplicationConfig,
    /// Send user data as confirmed link frames.
    pub confirmed_user_data: bool,
    /// This side initiates requests (sets the DIR bit).
    pub master: bool,
    /// Create associations for unknown inbound (local, remote) pairs.
    pub auto_create: bool,
    /// Accept only frames addressed to this local address, when set.
    pub expected_local: Option<u16>,
}

impl Default for EndPointOptions {
    fn default() -> Self {
        EndPointOptions {
            link: LinkConfig::default(),
            application: ApplicationConfig::default(),
            confirmed_user_data: false,
            master: true,
            auto_create: false,
            expected_local: None,
        }
    }
}

/// Container of a connection's associations for one remote device
/// address: routes inbound frames and creates associations on demand.
pub struct RemoteEndPoint {
    remote_device_addr: u16,
    options: EndPointOptions,
    sender: FrameSender,
    associations: RwLock<HashMap<AssocKey, Arc<Association>>>,
    unsolicited_tx: broadcast::Sender<Fragment>,
    on_association: Mutex<Option<Box<dyn Fn(Arc<Association>) + Send + Sync>>>,
}

impl RemoteEndPoint {
    pub fn new(
        remote_device_addr: u16,
        sender: FrameSender,
        options: EndPointOptions,
    ) -> Arc<RemoteEndPoint> {
        let (unsolicited_tx, _) = broadcast::channel(64);
        Arc::new(RemoteEndPoint {
            remote_device_addr,
            options,
            sender,
            associations: RwLock::new(HashMap::new()),
            unsolicited_tx,
            on_association: Mutex::new(None),
        })
    }

    /// Open the channel, start the pumps, and wire dispatch to this
    /// endpoint.
    pub async fn open(
        remote_device_addr: u16,
        channel: &ChannelConfig,
        options: EndPointOptions,
    ) -> Result<(Connection, Arc<RemoteEndPoint>), ProtocolError> {
        let slot: Arc<OnceLock<Arc<RemoteEndPoint>>> = Arc::new(OnceLock::new());
        let dispatch_slot = slot.clone();
        let connection = Connection::open(
            channel,
            Arc::new(move |frame| {
                if let Some(endpoint) = dispatch_slot.get() {
                    endpoint.dispatch(frame);
                }
            }),
        )
        .await?;
        let endpoint = RemoteEndPoint::new(remote_device_addr, connection.sender(), options);
        let _ = slot.set(endpoint.clone());
        Ok((connection, endpoint))
    }

    pub fn remote_device_addr(&self) -> u16 {
        self.remote_device_addr
    }

    pub fn sender(&self) -> &FrameSender {
        &self.sender
    }

    /// Invoked for every association created after this call (listener
    /// side spawns a request handler per association).
    pub fn set_association_hook(&self, hook: Box<dyn Fn(Arc<Association>) + Send + Sync>) {
        *self.on_association.lock() = Some(hook);
    }

    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<Fragment> {
        self.unsolicited_tx.subscribe()
    }

    /// Look up or create the association for (local, remote).
    pub fn association(&self, local: u16, remote: u16) -> Arc<Association> {
        let key = (local, remote);
        if let Some(existing) = self.associations.read().get(&key) {
            return existing.clone();
        }
        let mut map = self.associations.write();
        if let Some(existing) = map.get(&key) {
            return existing.clone();
        }
        let association = Association::new(
            key,
            self.options.link.clone(),
            self.options.application.clone(),
            self.options.confirmed_user_data,
            self.options.master,
            self.sender.clone(),
            self.unsolicited_tx.clone(),
        );
        map.insert(key, association.clone());
        drop(map);
        if let Some(hook) = self.on_association.lock().as_ref() {
            hook(association.clone());
        }
        association
    }

    pub fn associations(&self) -> Vec<Arc<Association>> {
        self.associations.read().values().cloned().collect()
    }

    /// Fail every association's pending transaction (connection close).
    pub fn cancel_all(&self, error: ProtocolError) {
        for association in self.associations.read().values() {
            association.fail_pending(error.clone());
        }
    }

    /// Route one inbound frame to its association. The frame's
    /// destination is our local address, its source the remote address.
    pub fn dispatch(&self, frame: Frame) {
        if let Some(expected) = self.options.expected_local {
            if frame.destination != expected {
                debug!(
                    "dropping frame for {} (local address is {expected})",
                    frame.destination
                );
                return;
            }
        }
        let key = (frame.destination, frame.source);
        let existing = self.associations.read().get(&key).cloned();
        let association = match existing {
            Some(association) => association,
            None if self.options.auto_create => self.association(key.0, key.1),
            None => {
                debug!("dropping frame for unknown association {key:?}");
                return;
            }
        };
        association.on_frame(frame);
    }
}
