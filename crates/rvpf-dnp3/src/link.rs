use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use rvpf_core::config::LinkConfig;
use rvpf_core::ProtocolError;

use crate::codec::Frame;
use crate::connection::{FrameSender, SendClass};

pub const DIR_BIT: u8 = 0x80;
pub const PRM_BIT: u8 = 0x40;
pub const FCB_BIT: u8 = 0x20;
pub const FCV_DFC_BIT: u8 = 0x10;
pub const FUNCTION_MASK: u8 = 0x0F;

/// Function codes of primary (initiating) frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimaryFunction {
    ResetLinkStates = 0,
    TestLinkStates = 2,
    ConfirmedUserData = 3,
    UnconfirmedUserData = 4,
    RequestLinkStatus = 9,
}

impl PrimaryFunction {
    pub fn from_code(code: u8) -> Option<PrimaryFunction> {
        match code {
            0 => Some(PrimaryFunction::ResetLinkStates),
            2 => Some(PrimaryFunction::TestLinkStates),
            3 => Some(PrimaryFunction::ConfirmedUserData),
            4 => Some(PrimaryFunction::UnconfirmedUserData),
            9 => Some(PrimaryFunction::RequestLinkStatus),
            _ => None,
        }
    }
}

/// Function codes of secondary (responding) frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecondaryFunction {
    Ack = 0,
    Nack = 1,
    LinkStatus = 11,
    NotSupported = 15,
}

impl SecondaryFunction {
    pub fn from_code(code: u8) -> Option<SecondaryFunction> {
        match code {
            0 => Some(SecondaryFunction::Ack),
            1 => Some(SecondaryFunction::Nack),
            11 => Some(SecondaryFunction::LinkStatus),
            15 => Some(SecondaryFunction::NotSupported),
            _ => None,
        }
    }
}

/// Decoded link control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkControl {
    pub dir: bool,
    pub prm: bool,
    pub fcb: bool,
    pub fcv_dfc: bool,
    pub function: u8,
}

impl LinkControl {
    pub fn byte(self) -> u8 {
        (u8::from(self.dir) << 7)
            | (u8::from(self.prm) << 6)
            | (u8::from(self.fcb) << 5)
            | (u8::from(self.fcv_dfc) << 4)
            | (self.function & FUNCTION_MASK)
    }

    pub fn from_byte(byte: u8) -> LinkControl {
        LinkControl {
            dir: byte & DIR_BIT != 0,
            prm: byte & PRM_BIT != 0,
            fcb: byte & FCB_BIT != 0,
            fcv_dfc: byte & FCV_DFC_BIT != 0,
            function: byte & FUNCTION_MASK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    SecNotReset,
    SecReset,
    LinkDown,
}

/// Per-association data-link engine.
///
/// One link transaction may be outstanding at a time: the sender
/// registers an echo slot, the receive pump completes it when the
/// matching secondary frame arrives.
pub struct LinkLayer {
    config: LinkConfig,
    local: u16,
    remote: u16,
    /// True on the master side (sets the DIR bit on primary frames).
    master: bool,
    state: Mutex<LinkState>,
    fcb: Mutex<bool>,
    pending: Mutex<Option<oneshot::Sender<SecondaryFunction>>>,
    last_activity: Mutex<Instant>,
    /// Whether the peer's primary has reset our secondary station.
    peer_reset: Mutex<bool>,
}

impl LinkLayer {
    pub fn new(config: LinkConfig, local: u16, remote: u16, master: bool) -> LinkLayer {
        LinkLayer {
            config,
            local,
            remote,
            master,
            state: Mutex::new(LinkState::SecNotReset),
            fcb: Mutex::new(false),
            pending: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            peer_reset: Mutex::new(false),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn mark_down(&self) {
        *self.state.lock() = LinkState::LinkDown;
    }

    pub fn note_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.config.keepalive
    }

    fn primary_frame(&self, function: PrimaryFunction, fcv: bool, payload: Vec<u8>) -> Frame {
        let control = LinkControl {
            dir: self.master,
            prm: true,
            fcb: fcv && *self.fcb.lock(),
            fcv_dfc: fcv,
            function: function as u8,
        };
        Frame {
            control: control.byte(),
            destination: self.remote,
            source: self.local,
            payload,
        }
    }

    pub fn secondary_frame(&self, function: SecondaryFunction) -> Frame {
        let control = LinkControl {
            dir: self.master,
            prm: false,
            fcb: false,
            fcv_dfc: false,
            function: function as u8,
        };
        Frame {
            control: control.byte(),
            destination: self.remote,
            source: self.local,
            payload: Vec::new(),
        }
    }

    /// Unconfirmed user data: fire and forget.
    pub fn send_unconfirmed(
        &self,
        sender: &FrameSender,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let frame = self.primary_frame(PrimaryFunction::UnconfirmedUserData, false, payload);
        sender.send_user((self.local, self.remote), frame)
    }

    /// Confirmed user data: acknowledged, retried, FCB toggled.
    pub async fn send_confirmed(
        &self,
        sender: &FrameSender,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let frame = self.primary_frame(PrimaryFunction::ConfirmedUserData, true, payload);
        self.transact(sender, frame, SendClass::User((self.local, self.remote)))
            .await?;
        let mut fcb = self.fcb.lock();
        *fcb = !*fcb;
        Ok(())
    }

    /// Bring the secondary station of the peer to the reset state.
    pub async fn ensure_active(&self, sender: &FrameSender) -> Result<(), ProtocolError> {
        if self.state() == LinkState::SecReset {
            return Ok(());
        }
        debug!("resetting link {}:{}", self.local, self.remote);
        let frame = self.primary_frame(PrimaryFunction::ResetLinkStates, false, Vec::new());
        self.transact(sender, frame, SendClass::Management).await?;
        *self.state.lock() = LinkState::SecReset;
        *self.fcb.lock() = true;
        Ok(())
    }

    /// Keepalive probe: test frame, echo expected within the link timeout.
    pub async fn probe(&self, sender: &FrameSender) -> Result<(), ProtocolError> {
        let frame = self.primary_frame(PrimaryFunction::TestLinkStates, true, Vec::new());
        self.transact(sender, frame, SendClass::Management).await?;
        let mut fcb = self.fcb.lock();
        *fcb = !*fcb;
        Ok(())
    }

    async fn transact(
        &self,
        sender: &FrameSender,
        frame: Frame,
        class: SendClass,
    ) -> Result<SecondaryFunction, ProtocolError> {
        for attempt in 0..=self.config.retries {
            let (tx, rx) = oneshot::channel();
            *self.pending.lock() = Some(tx);
            match class {
                SendClass::Management => sender.send_management(frame.clone())?,
                SendClass::User(key) => sender.send_user(key, frame.clone())?,
            }
            match tokio::time::timeout(self.config.timeout, rx).await {
                Ok(Ok(SecondaryFunction::Ack)) | Ok(Ok(SecondaryFunction::LinkStatus)) => {
                    self.note_activity();
                    return Ok(SecondaryFunction::Ack);
                }
                Ok(Ok(other)) => {
                    warn!(
                        "link {}:{} answered {:?} (attempt {attempt})",
                        self.local, self.remote, other
                    );
                }
                _ => {}
            }
            if attempt < self.config.retries {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        *self.pending.lock() = None;
        self.mark_down();
        Err(ProtocolError::LinkDown)
    }

    /// Called by the receive pump for inbound secondary frames.
    pub fn on_secondary(&self, function: SecondaryFunction) {
        self.note_activity();
        if let Some(tx) = self.pending.lock().take() {
            let _ = tx.send(function);
        }
    }

    /// Called by the receive pump for inbound primary management frames.
    /// Returns the reply to enqueue, if any.
    pub fn on_primary_management(&self, function: PrimaryFunction) -> Option<Frame> {
        self.note_activity();
        match function {
            PrimaryFunction::ResetLinkStates => {
                *self.peer_reset.lock() = true;
                Some(self.secondary_frame(SecondaryFunction::Ack))
            }
            PrimaryFunction::TestLinkStates => {
                if *self.peer_reset.lock() {
                    Some(self.secondary_frame(SecondaryFunction::Ack))
                } else {
                    Some(self.secondary_frame(SecondaryFunction::Nack))
                }
            }
            PrimaryFunction::RequestLinkStatus => {
                Some(self.secondary_frame(SecondaryFunction::LinkStatus))
            }
            PrimaryFunction::ConfirmedUserData | PrimaryFunction::UnconfirmedUserData => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_byte_round_trip() {
        for byte in 0..=u8::MAX {
            assert_eq!(LinkControl::from_byte(byte).byte(), byte);
        }
    }

    #[test]
    fn reset_frame_layout_matches_wire() {
        let link = LinkLayer::new(LinkConfig::default(), 1, 10, true);
        let frame = link.primary_frame(PrimaryFunction::ResetLinkStates, false, Vec::new());
        // DIR=1, PRM=1, function 0
        assert_eq!(frame.control, 0xC0);
        assert_eq!(frame.destination, 10);
        assert_eq!(frame.source, 1);
    }

    #[test]
    fn management_replies() {
        let link = LinkLayer::new(LinkConfig::default(), 10, 1, false);

        // Test before reset is refused.
        let nack = link.on_primary_management(PrimaryFunction::TestLinkStates).unwrap();
        assert_eq!(LinkControl::from_byte(nack.control).function, SecondaryFunction::Nack as u8);

        let ack = link.on_primary_management(PrimaryFunction::ResetLinkStates).unwrap();
        assert_eq!(LinkControl::from_byte(ack.control).function, SecondaryFunction::Ack as u8);
        assert!(!LinkControl::from_byte(ack.control).prm);

        let ack = link.on_primary_management(PrimaryFunction::TestLinkStates).unwrap();
        assert_eq!(LinkControl::from_byte(ack.control).function, SecondaryFunction::Ack as u8);
    }

    #[test]
    fn user_data_is_not_answered_here() {
        let link = LinkLayer::new(LinkConfig::default(), 10, 1, false);
        assert!(link
            .on_primary_management(PrimaryFunction::UnconfirmedUserData)
            .is_none());
    }

    #[test]
    fn secondary_completes_pending_slot() {
        let link = LinkLayer::new(LinkConfig::default(), 1, 10, true);
        let (tx, mut rx) = oneshot::channel();
        *link.pending.lock() = Some(tx);
        link.on_secondary(SecondaryFunction::Ack);
        assert_eq!(rx.try_recv().unwrap(), SecondaryFunction::Ack);
        // A stray secondary with no pending slot is ignored.
        link.on_secondary(SecondaryFunction::Ack);
    }
}
