//! Signal relay client: addressed envelope delivery over the relay connection with bounded
//! retry while the connection is still establishing. No I/O; the host transmits and reports.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::identity::PeerId;
use crate::protocol::SignalEnvelope;
use crate::scheduler::{RetryPolicy, Timer};
use crate::wire;

/// Relay connection lifecycle as observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Open,
    Closed,
}

/// Work for the host produced by the relay client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutput {
    /// Write this text message to the relay connection.
    Transmit(String),
    /// Arm a timer; call back `on_retry_timer` when it fires.
    Schedule(Timer, Duration),
    /// Envelope given up on (retries exhausted or relay unusable).
    Dropped(SignalEnvelope),
}

struct Pending {
    envelope: SignalEnvelope,
    text: String,
    attempts: u32,
}

/// Relay client state: connection state plus a FIFO of envelopes awaiting an open connection.
pub struct RelayClient {
    local_id: PeerId,
    state: RelayState,
    policy: RetryPolicy,
    queue: VecDeque<Pending>,
    retry_armed: bool,
}

impl RelayClient {
    pub fn new(local_id: PeerId, policy: RetryPolicy) -> Self {
        Self {
            local_id,
            state: RelayState::Connecting,
            policy,
            queue: VecDeque::new(),
            retry_armed: false,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Envelopes waiting for the connection to open.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Deliver now if open; queue and retry while connecting; drop if closed.
    pub fn send(&mut self, envelope: SignalEnvelope) -> Vec<RelayOutput> {
        let text = match wire::encode_envelope(&envelope) {
            Ok(t) => t,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "failed to encode envelope, dropping");
                return vec![RelayOutput::Dropped(envelope)];
            }
        };
        match self.state {
            RelayState::Open => {
                trace!(kind = %envelope.kind, to = %envelope.to, "relay send");
                let mut out = self.flush();
                out.push(RelayOutput::Transmit(text));
                out
            }
            RelayState::Connecting => {
                debug!(kind = %envelope.kind, to = %envelope.to, "relay connecting, queueing envelope");
                self.queue.push_back(Pending {
                    envelope,
                    text,
                    attempts: 1,
                });
                self.arm_retry().into_iter().collect()
            }
            RelayState::Closed => {
                warn!(kind = %envelope.kind, to = %envelope.to, "relay connection closed, dropping envelope");
                vec![RelayOutput::Dropped(envelope)]
            }
        }
    }

    /// Host reports a connection state change.
    pub fn on_state_changed(&mut self, state: RelayState) -> Vec<RelayOutput> {
        debug!(from = ?self.state, to = ?state, "relay state");
        self.state = state;
        match state {
            RelayState::Open => self.flush(),
            RelayState::Closed => self.drop_all("relay connection closed"),
            RelayState::Connecting => self.arm_retry().into_iter().collect(),
        }
    }

    /// Retry timer fired: flush if open, otherwise count one more failed attempt per envelope.
    pub fn on_retry_timer(&mut self) -> Vec<RelayOutput> {
        self.retry_armed = false;
        match self.state {
            RelayState::Open => self.flush(),
            RelayState::Closed => self.drop_all("relay connection closed"),
            RelayState::Connecting => {
                let mut out = Vec::new();
                let mut kept = VecDeque::with_capacity(self.queue.len());
                for mut p in self.queue.drain(..) {
                    p.attempts += 1;
                    if self.policy.allows_another(p.attempts) {
                        kept.push_back(p);
                    } else {
                        warn!(
                            kind = %p.envelope.kind,
                            to = %p.envelope.to,
                            attempts = p.attempts,
                            "relay never opened, dropping envelope"
                        );
                        out.push(RelayOutput::Dropped(p.envelope));
                    }
                }
                self.queue = kept;
                out.extend(self.arm_retry());
                out
            }
        }
    }

    /// Decode an inbound relay message. Returns the envelope only if it is well-formed and
    /// addressed to us; foreign or malformed traffic is discarded.
    pub fn on_message(&self, text: &str) -> Option<SignalEnvelope> {
        let envelope = match wire::decode_envelope(text) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "ignoring malformed relay message");
                return None;
            }
        };
        if envelope.to != self.local_id {
            trace!(kind = %envelope.kind, to = %envelope.to, "ignoring envelope for another peer");
            return None;
        }
        if envelope.from == self.local_id {
            trace!("ignoring envelope from self");
            return None;
        }
        Some(envelope)
    }

    fn flush(&mut self) -> Vec<RelayOutput> {
        self.queue
            .drain(..)
            .map(|p| RelayOutput::Transmit(p.text))
            .collect()
    }

    fn drop_all(&mut self, reason: &str) -> Vec<RelayOutput> {
        self.queue
            .drain(..)
            .map(|p| {
                warn!(kind = %p.envelope.kind, to = %p.envelope.to, reason, "dropping envelope");
                RelayOutput::Dropped(p.envelope)
            })
            .collect()
    }

    fn arm_retry(&mut self) -> Option<RelayOutput> {
        if self.queue.is_empty() || self.retry_armed {
            return None;
        }
        self.retry_armed = true;
        Some(RelayOutput::Schedule(Timer::RelayRetry, self.policy.interval))
    }
}
