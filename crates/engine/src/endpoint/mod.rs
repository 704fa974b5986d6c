//! Endpoint abstraction layer.
//!
//! The executor drives calls through these traits rather than a concrete
//! SIP stack. `testkit::loopback` provides an in-process implementation;
//! a UDP-based stack plugs in behind the same seam.

mod uri;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::graph::SipInstanceConfig;

pub use uri::{SipUri, SipUriError, DEFAULT_SIP_PORT};

/// Result type for endpoint-layer operations.
pub type EndpointResult<T> = std::result::Result<T, EndpointError>;

/// Failures surfaced by a SIP endpoint implementation.
#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    /// Offer/answer produced no common codec.
    #[error("media negotiation failed: no codec in common (offered {offered:?}, supported {supported:?})")]
    Negotiation {
        offered: Vec<String>,
        supported: Vec<String>,
    },

    /// No endpoint is reachable at the target address.
    #[error("no route to {0}")]
    NoRoute(SipUri),

    /// The remote side declined the call.
    #[error("call rejected: {code} {reason}")]
    Rejected { code: u16, reason: String },

    /// The dialog was already torn down when the operation ran.
    #[error("dialog already terminated")]
    Terminated,

    /// The dialog has no media channel to operate on.
    #[error("media channel unavailable")]
    NoMedia,

    /// The endpoint was shut down while the operation was in flight.
    #[error("endpoint shut down")]
    Shutdown,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// SDP-style media direction for a dialog leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    /// The direction as seen from the other side of the dialog.
    pub fn reverse(self) -> Self {
        match self {
            Self::SendRecv => Self::SendRecv,
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            Self::Inactive => Self::Inactive,
        }
    }
}

/// Callbacks a party registers when entering a dialog.
///
/// Implementations fire these from their signaling path and may hold
/// internal locks while doing so; handlers must hand any follow-up work
/// off to a spawned task instead of calling back into the dialog inline.
#[derive(Default)]
pub struct AnswerHooks {
    /// Fired when the peer renegotiates media; carries this side's new
    /// direction.
    pub on_media_update: Option<Box<dyn Fn(MediaDirection) + Send + Sync>>,
    /// Fired when the peer sends a REFER naming a transfer target.
    pub on_refer: Option<Box<dyn Fn(SipUri) + Send + Sync>>,
}

impl std::fmt::Debug for AnswerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerHooks")
            .field("on_media_update", &self.on_media_update.is_some())
            .field("on_refer", &self.on_refer.is_some())
            .finish()
    }
}

/// In-dialog media operations: RFC 4733 DTMF and file playback.
#[async_trait]
pub trait MediaChannel: Send + Sync {
    /// Transmit one DTMF digit to the peer.
    async fn send_dtmf(&self, digit: char) -> EndpointResult<()>;

    /// Await the next DTMF digit from the peer. Blocks until a digit
    /// arrives or the dialog terminates.
    async fn recv_dtmf(&self) -> EndpointResult<char>;

    /// Stream an audio file into the dialog. Returns the number of bytes
    /// played.
    async fn play_file(&self, path: &Path) -> EndpointResult<u64>;
}

/// An established call leg.
#[async_trait]
pub trait Dialog: Send + Sync {
    fn call_id(&self) -> &str;

    /// The remote party's URI.
    fn remote_uri(&self) -> &SipUri;

    /// The media channel for this leg, absent once the dialog is torn down.
    fn media(&self) -> Option<Arc<dyn MediaChannel>>;

    /// Current local media direction of this leg.
    fn direction(&self) -> MediaDirection;

    /// Change the local media direction without signaling. Takes effect on
    /// the wire at the next [`Dialog::reinvite`].
    fn set_direction(&self, direction: MediaDirection);

    /// Send BYE and tear the dialog down. Idempotent.
    async fn hangup(&self) -> EndpointResult<()>;

    /// Renegotiate the leg with the current local media direction via
    /// re-INVITE.
    async fn reinvite(&self) -> EndpointResult<()>;

    /// Send a REFER asking the peer to call `target`.
    async fn refer(&self, target: &SipUri) -> EndpointResult<()>;

    fn is_terminated(&self) -> bool;

    /// Resolve when the dialog terminates, from either side. Returns
    /// immediately if it already has.
    async fn wait_terminated(&self);
}

impl std::fmt::Debug for dyn Dialog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialog")
            .field("call_id", &self.call_id())
            .finish()
    }
}

/// An inbound call awaiting a decision.
#[async_trait]
pub trait ServerSession: Send + Sync {
    fn call_id(&self) -> &str;
    fn from_uri(&self) -> &SipUri;
    fn to_uri(&self) -> &SipUri;

    /// Accept the call. On success the returned dialog is established and
    /// `hooks` is armed for the lifetime of the dialog. Consumes the
    /// session either way.
    async fn answer(self: Box<Self>, hooks: AnswerHooks) -> EndpointResult<Arc<dyn Dialog>>;

    /// Decline the call with a status code.
    async fn reject(self: Box<Self>, code: u16, reason: &str) -> EndpointResult<()>;
}

/// A bound SIP user agent owned by one scenario instance.
#[async_trait]
pub trait SipEndpoint: Send + Sync {
    /// The local contact URI this endpoint answers on.
    fn local_uri(&self) -> SipUri;

    fn port(&self) -> u16;

    /// Run the inbound side: deliver new calls into `incoming` until the
    /// token is cancelled. The channel is expected to have capacity 1, so
    /// an unconsumed call exerts backpressure on further arrivals.
    async fn serve(
        &self,
        incoming: mpsc::Sender<Box<dyn ServerSession>>,
        cancel: CancellationToken,
    ) -> EndpointResult<()>;

    /// Place an outbound call and block until it is answered or fails.
    async fn invite(&self, target: &SipUri, hooks: AnswerHooks)
        -> EndpointResult<Arc<dyn Dialog>>;

    /// Release transport resources. Idempotent.
    async fn shutdown(&self) -> EndpointResult<()>;
}

/// Builds endpoints for scenario instances. Implemented by the loopback
/// testkit and by real-stack adapters.
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn create(
        &self,
        config: &SipInstanceConfig,
        port: u16,
    ) -> EndpointResult<Arc<dyn SipEndpoint>>;
}
