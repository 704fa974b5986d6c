//! In-process loopback SIP network.
//!
//! Endpoints created by one [`LoopbackNetwork`] can call each other by
//! port, with real codec negotiation, DTMF, media-direction renegotiation,
//! REFER, and termination signaling, but no wire traffic. Integration
//! tests drive full scenarios through it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::endpoint::{
    AnswerHooks, Dialog, EndpointError, EndpointFactory, EndpointResult, MediaChannel,
    MediaDirection, ServerSession, SipEndpoint, SipUri,
};
use crate::graph::SipInstanceConfig;

/// Codecs the loopback media layer can actually carry. Configured codecs
/// outside this list are dropped at endpoint creation, mirroring a real
/// stack that ignores codecs it has no payload support for.
pub const SUPPORTED_CODECS: [&str; 3] = ["PCMU", "PCMA", "G722"];

/// Registry of loopback endpoints, keyed by port. Doubles as the
/// [`EndpointFactory`] handed to the engine.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<DashMap<u16, Arc<LoopbackEndpoint>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointFactory for LoopbackNetwork {
    async fn create(
        &self,
        config: &SipInstanceConfig,
        port: u16,
    ) -> EndpointResult<Arc<dyn SipEndpoint>> {
        let codecs: Vec<String> = config
            .codecs
            .iter()
            .filter(|codec| SUPPORTED_CODECS.contains(&codec.as_str()))
            .cloned()
            .collect();

        let endpoint = Arc::new(LoopbackEndpoint {
            dn: config.dn.clone(),
            port,
            codecs,
            registry: Arc::clone(&self.endpoints),
            inbox: Mutex::new(None),
        });
        self.endpoints.insert(port, Arc::clone(&endpoint));
        Ok(endpoint)
    }
}

/// One loopback user agent bound to a port.
pub struct LoopbackEndpoint {
    dn: String,
    port: u16,
    codecs: Vec<String>,
    registry: Arc<DashMap<u16, Arc<LoopbackEndpoint>>>,
    // Set while serve() runs; calls to an endpoint without an inbox are
    // rejected as unreachable.
    inbox: Mutex<Option<mpsc::Sender<Box<dyn ServerSession>>>>,
}

#[async_trait]
impl SipEndpoint for LoopbackEndpoint {
    fn local_uri(&self) -> SipUri {
        SipUri::new(self.dn.clone(), "127.0.0.1").with_port(self.port)
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn serve(
        &self,
        incoming: mpsc::Sender<Box<dyn ServerSession>>,
        cancel: CancellationToken,
    ) -> EndpointResult<()> {
        *self.inbox.lock() = Some(incoming);
        cancel.cancelled().await;
        *self.inbox.lock() = None;
        Ok(())
    }

    async fn invite(
        &self,
        target: &SipUri,
        hooks: AnswerHooks,
    ) -> EndpointResult<Arc<dyn Dialog>> {
        let callee = self
            .registry
            .get(&target.port_or_default())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EndpointError::NoRoute(target.clone()))?;

        let inbox = callee
            .inbox
            .lock()
            .clone()
            .ok_or_else(|| EndpointError::NoRoute(target.clone()))?;

        let (answer_tx, answer_rx) = oneshot::channel();
        let session = Box::new(LoopbackServerSession {
            call_id: Uuid::new_v4().to_string(),
            from: self.local_uri(),
            to: target.clone(),
            offered_codecs: self.codecs.clone(),
            callee_codecs: callee.codecs.clone(),
            caller_hooks: hooks,
            answer_tx,
        });

        inbox
            .send(session)
            .await
            .map_err(|_| EndpointError::NoRoute(target.clone()))?;

        match answer_rx.await {
            Ok(result) => result.map(|dialog| dialog as Arc<dyn Dialog>),
            Err(_) => Err(EndpointError::Rejected {
                code: 487,
                reason: "call abandoned before answer".to_string(),
            }),
        }
    }

    async fn shutdown(&self) -> EndpointResult<()> {
        *self.inbox.lock() = None;
        self.registry.remove(&self.port);
        Ok(())
    }
}

/// A ringing inbound call on a loopback endpoint.
pub struct LoopbackServerSession {
    call_id: String,
    from: SipUri,
    to: SipUri,
    offered_codecs: Vec<String>,
    callee_codecs: Vec<String>,
    caller_hooks: AnswerHooks,
    answer_tx: oneshot::Sender<EndpointResult<Arc<LoopbackDialog>>>,
}

#[async_trait]
impl ServerSession for LoopbackServerSession {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn from_uri(&self) -> &SipUri {
        &self.from
    }

    fn to_uri(&self) -> &SipUri {
        &self.to
    }

    async fn answer(self: Box<Self>, hooks: AnswerHooks) -> EndpointResult<Arc<dyn Dialog>> {
        let negotiated: Vec<String> = self
            .offered_codecs
            .iter()
            .filter(|codec| self.callee_codecs.contains(codec))
            .cloned()
            .collect();
        if negotiated.is_empty() {
            let err = EndpointError::Negotiation {
                offered: self.offered_codecs.clone(),
                supported: self.callee_codecs.clone(),
            };
            let _ = self.answer_tx.send(Err(err.clone()));
            return Err(err);
        }

        let (caller_dialog, callee_dialog) =
            LoopbackDialog::pair(self.call_id, self.from, self.to, self.caller_hooks, hooks);
        let _ = self.answer_tx.send(Ok(caller_dialog));
        Ok(callee_dialog)
    }

    async fn reject(self: Box<Self>, code: u16, reason: &str) -> EndpointResult<()> {
        let _ = self.answer_tx.send(Err(EndpointError::Rejected {
            code,
            reason: reason.to_string(),
        }));
        Ok(())
    }
}

/// One leg of an established loopback call.
pub struct LoopbackDialog {
    call_id: String,
    remote: SipUri,
    direction: Mutex<MediaDirection>,
    hooks: Mutex<AnswerHooks>,
    // Strong link for the lifetime of the call; broken at hangup so the
    // pair can be dropped.
    peer: Mutex<Option<Arc<LoopbackDialog>>>,
    terminated_tx: watch::Sender<bool>,
    terminated_rx: watch::Receiver<bool>,
    media: Arc<LoopbackMedia>,
}

impl LoopbackDialog {
    fn pair(
        call_id: String,
        caller_uri: SipUri,
        callee_uri: SipUri,
        caller_hooks: AnswerHooks,
        callee_hooks: AnswerHooks,
    ) -> (Arc<Self>, Arc<Self>) {
        let (to_callee_tx, to_callee_rx) = mpsc::unbounded_channel();
        let (to_caller_tx, to_caller_rx) = mpsc::unbounded_channel();

        let caller = Self::leg(
            call_id.clone(),
            callee_uri,
            caller_hooks,
            to_callee_tx,
            to_caller_rx,
        );
        let callee = Self::leg(call_id, caller_uri, callee_hooks, to_caller_tx, to_callee_rx);

        *caller.peer.lock() = Some(Arc::clone(&callee));
        *callee.peer.lock() = Some(Arc::clone(&caller));
        (caller, callee)
    }

    fn leg(
        call_id: String,
        remote: SipUri,
        hooks: AnswerHooks,
        dtmf_tx: mpsc::UnboundedSender<char>,
        dtmf_rx: mpsc::UnboundedReceiver<char>,
    ) -> Arc<Self> {
        let (terminated_tx, terminated_rx) = watch::channel(false);
        Arc::new(Self {
            call_id,
            remote,
            direction: Mutex::new(MediaDirection::SendRecv),
            hooks: Mutex::new(hooks),
            peer: Mutex::new(None),
            media: Arc::new(LoopbackMedia {
                dtmf_tx,
                dtmf_rx: AsyncMutex::new(dtmf_rx),
                terminated: terminated_rx.clone(),
            }),
            terminated_tx,
            terminated_rx,
        })
    }

    fn take_peer(&self) -> Option<Arc<LoopbackDialog>> {
        self.peer.lock().take()
    }

    fn peer(&self) -> Option<Arc<LoopbackDialog>> {
        self.peer.lock().clone()
    }

    fn terminate(&self) {
        self.terminated_tx.send_replace(true);
    }
}

#[async_trait]
impl Dialog for LoopbackDialog {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn remote_uri(&self) -> &SipUri {
        &self.remote
    }

    fn media(&self) -> Option<Arc<dyn MediaChannel>> {
        if self.is_terminated() {
            None
        } else {
            Some(Arc::clone(&self.media) as Arc<dyn MediaChannel>)
        }
    }

    fn direction(&self) -> MediaDirection {
        *self.direction.lock()
    }

    fn set_direction(&self, direction: MediaDirection) {
        *self.direction.lock() = direction;
    }

    async fn hangup(&self) -> EndpointResult<()> {
        if self.is_terminated() {
            return Ok(());
        }
        self.terminate();
        // Breaking both peer links lets the pair be freed.
        if let Some(peer) = self.take_peer() {
            peer.terminate();
            peer.take_peer();
        }
        Ok(())
    }

    async fn reinvite(&self) -> EndpointResult<()> {
        if self.is_terminated() {
            return Err(EndpointError::Terminated);
        }
        let peer = self.peer().ok_or(EndpointError::Terminated)?;
        let remote_direction = self.direction().reverse();
        peer.set_direction(remote_direction);
        // Hook handlers hand off to their own tasks, so calling under the
        // hooks lock cannot re-enter this dialog.
        let hooks = peer.hooks.lock();
        if let Some(on_media_update) = hooks.on_media_update.as_ref() {
            on_media_update(remote_direction);
        }
        Ok(())
    }

    async fn refer(&self, target: &SipUri) -> EndpointResult<()> {
        if self.is_terminated() {
            return Err(EndpointError::Terminated);
        }
        let peer = self.peer().ok_or(EndpointError::Terminated)?;
        let hooks = peer.hooks.lock();
        if let Some(on_refer) = hooks.on_refer.as_ref() {
            on_refer(target.clone());
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        *self.terminated_rx.borrow()
    }

    async fn wait_terminated(&self) {
        let mut rx = self.terminated_rx.clone();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }
}

/// DTMF transport between the two legs, plus file playback.
pub struct LoopbackMedia {
    dtmf_tx: mpsc::UnboundedSender<char>,
    dtmf_rx: AsyncMutex<mpsc::UnboundedReceiver<char>>,
    terminated: watch::Receiver<bool>,
}

#[async_trait]
impl MediaChannel for LoopbackMedia {
    async fn send_dtmf(&self, digit: char) -> EndpointResult<()> {
        if *self.terminated.borrow() {
            return Err(EndpointError::Terminated);
        }
        self.dtmf_tx
            .send(digit)
            .map_err(|_| EndpointError::Terminated)
    }

    async fn recv_dtmf(&self) -> EndpointResult<char> {
        let mut rx = self.dtmf_rx.lock().await;
        rx.recv().await.ok_or(EndpointError::Terminated)
    }

    async fn play_file(&self, path: &Path) -> EndpointResult<u64> {
        if *self.terminated.borrow() {
            return Err(EndpointError::Terminated);
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| EndpointError::Transport(err.to_string()))?;
        Ok(bytes.len() as u64)
    }
}
