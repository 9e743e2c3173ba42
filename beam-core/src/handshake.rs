//! Handshake state machine: negotiates the direct channel through the relay and owns the
//! channel lifecycle. Idle -> Negotiating -> Open -> Closed | Failed.

use std::fmt;

use tracing::{debug, info, trace, warn};

use crate::identity::PeerId;
use crate::protocol::{SignalEnvelope, SignalKind};

/// Lifecycle of the direct channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Negotiating,
    Open,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }

    fn is_live(self) -> bool {
        matches!(self, ChannelState::Negotiating | ChannelState::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "idle"),
            ChannelState::Negotiating => write!(f, "negotiating"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
            ChannelState::Failed => write!(f, "failed"),
        }
    }
}

/// Which side of the negotiation this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the offer after an explicit connect.
    Caller,
    /// Answered an inbound offer.
    Answerer,
}

/// Lifecycle events reported by the underlying channel primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Commands for the underlying channel primitive. Offer and answer descriptions come back
/// through `on_local_description`, gathered candidates through `on_local_candidate`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    /// Create a local channel and produce an offer description.
    CreateOffer,
    /// Create a channel, apply this remote offer, and produce an answer description.
    AcceptOffer { sdp: String },
    /// Apply the remote answer to the channel created by `CreateOffer`.
    ApplyAnswer { sdp: String },
    /// Add a remote network candidate. May arrive before or after the remote description.
    AddCandidate(serde_json::Value),
    /// Tear the channel down.
    Close,
}

/// Why the channel is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Negotiation or connectivity failed.
    Failed,
    /// The channel reported a disconnect.
    Disconnected,
    /// The channel closed, or we closed it.
    Closed,
}

/// Work for the host produced by the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutput {
    Channel(ChannelCommand),
    Signal(SignalEnvelope),
    Connected(PeerId),
    Disconnected {
        remote: Option<PeerId>,
        reason: DisconnectReason,
    },
}

/// Refused connect request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectRejected {
    #[error("handshake already {0}")]
    NotIdle(ChannelState),
    #[error("cannot connect to self")]
    SelfConnect,
}

pub struct Handshake {
    local_id: PeerId,
    remote_id: Option<PeerId>,
    role: Option<Role>,
    state: ChannelState,
    description_sent: bool,
    answer_applied: bool,
    /// Local candidates gathered before our description went out.
    held_candidates: Vec<serde_json::Value>,
}

impl Handshake {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            remote_id: None,
            role: None,
            state: ChannelState::Idle,
            description_sent: false,
            answer_applied: false,
            held_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn remote_id(&self) -> Option<&PeerId> {
        self.remote_id.as_ref()
    }

    /// Caller role: Idle -> Negotiating, asks the host for an offer.
    pub fn connect(&mut self, remote: PeerId) -> Result<Vec<HandshakeOutput>, ConnectRejected> {
        if self.state != ChannelState::Idle {
            return Err(ConnectRejected::NotIdle(self.state));
        }
        if remote == self.local_id {
            return Err(ConnectRejected::SelfConnect);
        }
        info!(remote = %remote, "connecting");
        self.remote_id = Some(remote);
        self.role = Some(Role::Caller);
        self.state = ChannelState::Negotiating;
        Ok(vec![HandshakeOutput::Channel(ChannelCommand::CreateOffer)])
    }

    /// Apply an envelope already filtered to our identity by the relay client.
    pub fn on_envelope(&mut self, env: SignalEnvelope) -> Vec<HandshakeOutput> {
        if env.to != self.local_id {
            trace!(to = %env.to, "envelope not addressed to us");
            return vec![];
        }
        match env.kind {
            SignalKind::Offer => self.on_offer(env),
            SignalKind::Answer => self.on_answer(env),
            SignalKind::Candidate => self.on_remote_candidate(env),
        }
    }

    /// The channel produced our offer (caller) or answer (answerer).
    pub fn on_local_description(&mut self, sdp: String) -> Vec<HandshakeOutput> {
        if self.state != ChannelState::Negotiating || self.description_sent {
            debug!(state = %self.state, "ignoring local description");
            return vec![];
        }
        let (Some(remote), Some(role)) = (self.remote_id.clone(), self.role) else {
            return vec![];
        };
        self.description_sent = true;
        let env = match role {
            Role::Caller => SignalEnvelope::offer(self.local_id.clone(), remote.clone(), sdp),
            Role::Answerer => SignalEnvelope::answer(self.local_id.clone(), remote.clone(), sdp),
        };
        debug!(kind = %env.kind, to = %env.to, "sending local description");
        let mut out = vec![HandshakeOutput::Signal(env)];
        for c in std::mem::take(&mut self.held_candidates) {
            out.push(HandshakeOutput::Signal(SignalEnvelope::candidate(
                self.local_id.clone(),
                remote.clone(),
                c,
            )));
        }
        out
    }

    /// The channel gathered a local network candidate.
    pub fn on_local_candidate(&mut self, candidate: serde_json::Value) -> Vec<HandshakeOutput> {
        if !self.state.is_live() {
            trace!(state = %self.state, "dropping local candidate");
            return vec![];
        }
        let Some(remote) = self.remote_id.clone() else {
            return vec![];
        };
        if !self.description_sent {
            // the remote must see our description first
            self.held_candidates.push(candidate);
            return vec![];
        }
        vec![HandshakeOutput::Signal(SignalEnvelope::candidate(
            self.local_id.clone(),
            remote,
            candidate,
        ))]
    }

    /// Lifecycle event from the channel primitive.
    pub fn on_channel_event(&mut self, event: ChannelEvent) -> Vec<HandshakeOutput> {
        match (self.state, event) {
            (ChannelState::Negotiating, ChannelEvent::Connected) => {
                self.state = ChannelState::Open;
                let Some(remote) = self.remote_id.clone() else {
                    return vec![];
                };
                info!(remote = %remote, "channel open");
                vec![HandshakeOutput::Connected(remote)]
            }
            (ChannelState::Negotiating | ChannelState::Open, ChannelEvent::Failed) => {
                self.terminate(ChannelState::Failed, DisconnectReason::Failed)
            }
            (ChannelState::Negotiating | ChannelState::Open, ChannelEvent::Disconnected) => {
                self.terminate(ChannelState::Failed, DisconnectReason::Disconnected)
            }
            (ChannelState::Negotiating | ChannelState::Open, ChannelEvent::Closed) => {
                self.terminate(ChannelState::Closed, DisconnectReason::Closed)
            }
            (state, event) => {
                trace!(%state, ?event, "ignoring channel event");
                vec![]
            }
        }
    }

    /// Local teardown: closes a live channel and moves to Closed.
    pub fn close(&mut self) -> Vec<HandshakeOutput> {
        if !self.state.is_live() {
            return vec![];
        }
        let mut out = vec![HandshakeOutput::Channel(ChannelCommand::Close)];
        out.extend(self.terminate(ChannelState::Closed, DisconnectReason::Closed));
        out
    }

    /// Back to Idle with no remote, closing a live channel first.
    pub fn reset(&mut self) -> Vec<HandshakeOutput> {
        let out = self.close();
        self.state = ChannelState::Idle;
        self.remote_id = None;
        self.role = None;
        self.description_sent = false;
        self.answer_applied = false;
        self.held_candidates.clear();
        out
    }

    fn on_offer(&mut self, env: SignalEnvelope) -> Vec<HandshakeOutput> {
        if self.state != ChannelState::Idle {
            // no renegotiation
            warn!(from = %env.from, state = %self.state, "ignoring offer, handshake not idle");
            return vec![];
        }
        let Some(sdp) = env.sdp else {
            return vec![];
        };
        info!(from = %env.from, "accepting offer");
        self.remote_id = Some(env.from);
        self.role = Some(Role::Answerer);
        self.state = ChannelState::Negotiating;
        vec![HandshakeOutput::Channel(ChannelCommand::AcceptOffer { sdp })]
    }

    fn on_answer(&mut self, env: SignalEnvelope) -> Vec<HandshakeOutput> {
        let expected = self.state == ChannelState::Negotiating
            && self.role == Some(Role::Caller)
            && self.remote_id.as_ref() == Some(&env.from)
            && !self.answer_applied;
        if !expected {
            debug!(from = %env.from, state = %self.state, "ignoring unexpected answer");
            return vec![];
        }
        let Some(sdp) = env.sdp else {
            return vec![];
        };
        self.answer_applied = true;
        vec![HandshakeOutput::Channel(ChannelCommand::ApplyAnswer { sdp })]
    }

    fn on_remote_candidate(&mut self, env: SignalEnvelope) -> Vec<HandshakeOutput> {
        if !self.state.is_live() || self.remote_id.as_ref() != Some(&env.from) {
            debug!(from = %env.from, state = %self.state, "ignoring candidate");
            return vec![];
        }
        match env.candidate {
            Some(c) => vec![HandshakeOutput::Channel(ChannelCommand::AddCandidate(c))],
            None => vec![],
        }
    }

    fn terminate(&mut self, next: ChannelState, reason: DisconnectReason) -> Vec<HandshakeOutput> {
        info!(from = %self.state, to = %next, ?reason, "channel down");
        self.state = next;
        vec![HandshakeOutput::Disconnected {
            remote: self.remote_id.clone(),
            reason,
        }]
    }
}
