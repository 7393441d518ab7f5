//! Scriptable in-process transport, for exercising the broker without a
//! network.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::{
    IceCandidate, SdpKind, SessionDescription, TransportEvent, TransportFactory, TransportSession,
};
use crate::connection::ConnectionKind;
use crate::error::TransportError;

#[derive(Default)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    channel: Option<(String, bool)>,
    sent: Vec<Bytes>,
    closed: bool,
}

pub struct MockTransport {
    kind: ConnectionKind,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<MockState>,
    buffered: AtomicU64,
    terminal: AtomicBool,
    fail_sends: AtomicBool,
}

impl MockTransport {
    fn new(kind: ConnectionKind) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            kind,
            events: events_tx,
            state: Mutex::new(MockState::default()),
            buffered: AtomicU64::new(0),
            terminal: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        });
        (transport, events_rx)
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Injects an event as if the real transport had produced it.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_buffered_amount(&self, amount: u64) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    pub fn set_terminal(&self, terminal: bool) {
        self.terminal.store(terminal, Ordering::SeqCst);
    }

    /// Makes every subsequent `send` fail, as a dead channel would.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    pub fn committed_local(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn committed_remote(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    /// The data channel requested before the offer, when one was.
    pub fn channel_request(&self) -> Option<(String, bool)> {
        self.state.lock().channel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl TransportSession for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 mock-offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.state.lock().remote.is_none() {
            return Err(TransportError::Negotiation(
                "answer requested before a remote offer".into(),
            ));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 mock-answer".into(),
        })
    }

    async fn commit_local(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.state.lock().local = Some(desc);
        Ok(())
    }

    async fn commit_remote(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.state.lock().remote = Some(desc);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.state.lock().remote_candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<(), TransportError> {
        self.state.lock().channel = Some((label.to_string(), ordered));
        Ok(())
    }

    async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("mock send failure".into()));
        }
        self.state.lock().sent.push(bytes);
        Ok(())
    }

    async fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Hands out [`MockTransport`]s and remembers every one it created, so tests
/// can script and inspect them after the fact.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn transport(&self, index: usize) -> Option<Arc<MockTransport>> {
        self.created.lock().get(index).cloned()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        kind: ConnectionKind,
    ) -> Result<
        (
            Arc<dyn TransportSession>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        TransportError,
    > {
        let (transport, events_rx) = MockTransport::new(kind);
        self.created.lock().push(Arc::clone(&transport));
        Ok((transport, events_rx))
    }
}
