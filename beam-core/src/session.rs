//! Host-driven API: PeerSession receives events from the host, returns outputs.
//!
//! One local identity, at most one remote, one handshake, and at most one transfer in
//! each direction. All mutation happens through these methods on the host's event loop.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::handshake::{
    ChannelCommand, ChannelEvent, ChannelState, DisconnectReason, Handshake, HandshakeOutput,
};
use crate::identity::PeerId;
use crate::protocol::{SignalEnvelope, TransferId, TransferMetadata};
use crate::receiver::{ReceiverEvent, TransferReceiver};
use crate::relay::{RelayClient, RelayOutput, RelayState};
use crate::scheduler::{RetryPolicy, Timer, Watermarks};
use crate::sender::{SenderOutput, TransferSender};
use crate::wire::Frame;

/// Work for the host to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Write this text message to the relay connection.
    Relay(String),
    /// Drive the channel primitive.
    Channel(ChannelCommand),
    /// Send this frame on the open channel.
    Frame(Frame),
    /// Read `len` bytes at `offset` of the file being sent; pass them to `on_chunk_read`.
    ReadChunk {
        transfer_id: TransferId,
        offset: u64,
        len: usize,
    },
    /// Arm a timer; call `on_timer` when it fires.
    Schedule(Timer, Duration),
    /// Surface to the presentation layer.
    Event(SessionEvent),
}

/// Events for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected(PeerId),
    Disconnected {
        remote: Option<PeerId>,
        reason: DisconnectReason,
    },
    SendStarted(TransferMetadata),
    SendProgress(u8),
    SendComplete(TransferId),
    /// Outbound transfer dropped on this side before completion.
    SendAborted(TransferId),
    ReceiveMetadata(TransferMetadata),
    ReceiveProgress(u8),
    ReceiveComplete {
        meta: TransferMetadata,
        payload: Vec<u8>,
    },
    /// Signaling envelope given up on; the handshake will likely not complete.
    SignalDropped(SignalEnvelope),
}

/// Main coordinator. Host passes events; session returns outputs.
pub struct PeerSession {
    local_id: PeerId,
    config: Config,
    relay: RelayClient,
    handshake: Handshake,
    sender: TransferSender,
    receiver: TransferReceiver,
}

impl PeerSession {
    pub fn new(config: Config) -> Self {
        Self::with_id(PeerId::generate(), config)
    }

    pub fn with_id(local_id: PeerId, config: Config) -> Self {
        Self {
            relay: RelayClient::new(local_id.clone(), RetryPolicy::from_config(&config)),
            handshake: Handshake::new(local_id.clone()),
            sender: TransferSender::new(
                Watermarks::from_config(&config),
                config.drain_poll_interval(),
            ),
            receiver: TransferReceiver::new(),
            local_id,
            config,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn remote_id(&self) -> Option<&PeerId> {
        self.handshake.remote_id()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.handshake.state()
    }

    pub fn relay_state(&self) -> RelayState {
        self.relay.state()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_sending(&self) -> bool {
        self.sender.is_busy()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiver.is_receiving()
    }

    /// Caller role: start negotiating with `remote`.
    pub fn connect(&mut self, remote: PeerId) -> Vec<Output> {
        match self.handshake.connect(remote) {
            Ok(out) => self.handshake_outputs(out),
            Err(e) => {
                warn!(error = %e, "connect ignored");
                vec![]
            }
        }
    }

    /// Send a file of `byte_size` bytes over the open channel. No-op with a warning unless the
    /// channel is open and no outbound transfer is in flight. The bytes are requested chunk by
    /// chunk through `Output::ReadChunk`. `buffered` is the channel's current buffered amount.
    pub fn send_file(
        &mut self,
        byte_size: u64,
        name: &str,
        media_type: &str,
        buffered: u64,
    ) -> Vec<Output> {
        if self.handshake.state() != ChannelState::Open {
            warn!(state = %self.handshake.state(), name, "send ignored, channel not open");
            return vec![];
        }
        match self.sender.start(byte_size, name, media_type, buffered) {
            Ok((meta, out)) => {
                let mut outputs = vec![Output::Event(SessionEvent::SendStarted(meta))];
                outputs.extend(Self::sender_outputs(out));
                outputs
            }
            Err(e) => {
                warn!(error = %e, name, "send ignored");
                vec![]
            }
        }
    }

    /// Relay connection state changed.
    pub fn on_relay_state(&mut self, state: RelayState) -> Vec<Output> {
        let out = self.relay.on_state_changed(state);
        Self::relay_outputs(out)
    }

    /// Text message from the relay.
    pub fn on_relay_message(&mut self, text: &str) -> Vec<Output> {
        let Some(envelope) = self.relay.on_message(text) else {
            return vec![];
        };
        let out = self.handshake.on_envelope(envelope);
        self.handshake_outputs(out)
    }

    /// The channel produced our offer or answer description.
    pub fn on_local_description(&mut self, sdp: String) -> Vec<Output> {
        let out = self.handshake.on_local_description(sdp);
        self.handshake_outputs(out)
    }

    /// The channel gathered a local network candidate.
    pub fn on_local_candidate(&mut self, candidate: serde_json::Value) -> Vec<Output> {
        let out = self.handshake.on_local_candidate(candidate);
        self.handshake_outputs(out)
    }

    /// Channel lifecycle change. Failure or closure abandons both transfers.
    pub fn on_channel_event(&mut self, event: ChannelEvent) -> Vec<Output> {
        let out = self.handshake.on_channel_event(event);
        self.handshake_outputs(out)
    }

    /// Frame from the open channel.
    pub fn on_frame(&mut self, frame: Frame) -> Vec<Output> {
        if self.handshake.state() != ChannelState::Open {
            debug!(state = %self.handshake.state(), len = frame.len(), "ignoring frame, channel not open");
            return vec![];
        }
        self.receiver
            .on_frame(frame)
            .into_iter()
            .map(|e| {
                Output::Event(match e {
                    ReceiverEvent::Metadata(meta) => SessionEvent::ReceiveMetadata(meta),
                    ReceiverEvent::Progress(p) => SessionEvent::ReceiveProgress(p),
                    ReceiverEvent::Complete { payload, meta } => {
                        SessionEvent::ReceiveComplete { meta, payload }
                    }
                })
            })
            .collect()
    }

    /// Bytes for an `Output::ReadChunk` request.
    pub fn on_chunk_read(&mut self, transfer_id: &TransferId, bytes: Vec<u8>, buffered: u64) -> Vec<Output> {
        Self::sender_outputs(self.sender.on_chunk_read(transfer_id, bytes, buffered))
    }

    /// The host could not read the file being sent. Drops the outbound transfer.
    pub fn abort_send(&mut self) -> Vec<Output> {
        match self.sender.abort() {
            Some(id) => vec![Output::Event(SessionEvent::SendAborted(id))],
            None => vec![],
        }
    }

    /// Channel signalled its buffered amount fell to the low watermark.
    pub fn on_buffer_drained(&mut self, buffered: u64) -> Vec<Output> {
        Self::sender_outputs(self.sender.on_drained(buffered))
    }

    /// A timer armed via `Output::Schedule` fired. `buffered` is the channel's buffered amount.
    pub fn on_timer(&mut self, timer: Timer, buffered: u64) -> Vec<Output> {
        match timer {
            Timer::RelayRetry => Self::relay_outputs(self.relay.on_retry_timer()),
            Timer::DrainPoll => Self::sender_outputs(self.sender.on_poll(buffered)),
        }
    }

    /// Tear down the channel and abandon both transfers.
    pub fn close(&mut self) -> Vec<Output> {
        let out = self.handshake.close();
        let outputs = self.handshake_outputs(out);
        self.abandon_transfers();
        outputs
    }

    /// Back to Idle with no remote; the local identity is kept.
    pub fn reset(&mut self) -> Vec<Output> {
        let out = self.handshake.reset();
        let outputs = self.handshake_outputs(out);
        self.abandon_transfers();
        info!(local = %self.local_id, "session reset");
        outputs
    }

    fn abandon_transfers(&mut self) {
        if let Some(id) = self.sender.abort() {
            info!(transfer_id = %id, "outbound transfer abandoned");
        }
        if let Some(id) = self.receiver.reset() {
            info!(transfer_id = %id, "inbound transfer abandoned");
        }
    }

    fn handshake_outputs(&mut self, out: Vec<HandshakeOutput>) -> Vec<Output> {
        let mut outputs = Vec::with_capacity(out.len());
        for o in out {
            match o {
                HandshakeOutput::Channel(cmd) => outputs.push(Output::Channel(cmd)),
                HandshakeOutput::Signal(env) => {
                    outputs.extend(Self::relay_outputs(self.relay.send(env)))
                }
                HandshakeOutput::Connected(remote) => {
                    outputs.push(Output::Event(SessionEvent::Connected(remote)))
                }
                HandshakeOutput::Disconnected { remote, reason } => {
                    self.abandon_transfers();
                    outputs.push(Output::Event(SessionEvent::Disconnected { remote, reason }));
                }
            }
        }
        outputs
    }

    fn relay_outputs(out: Vec<RelayOutput>) -> Vec<Output> {
        out.into_iter()
            .map(|o| match o {
                RelayOutput::Transmit(text) => Output::Relay(text),
                RelayOutput::Schedule(timer, after) => Output::Schedule(timer, after),
                RelayOutput::Dropped(env) => Output::Event(SessionEvent::SignalDropped(env)),
            })
            .collect()
    }

    fn sender_outputs(out: Vec<SenderOutput>) -> Vec<Output> {
        out.into_iter()
            .map(|o| match o {
                SenderOutput::Frame(frame) => Output::Frame(frame),
                SenderOutput::Progress(p) => Output::Event(SessionEvent::SendProgress(p)),
                SenderOutput::ReadChunk {
                    transfer_id,
                    offset,
                    len,
                } => Output::ReadChunk {
                    transfer_id,
                    offset,
                    len,
                },
                SenderOutput::Schedule(timer, after) => Output::Schedule(timer, after),
                SenderOutput::Finished(id) => Output::Event(SessionEvent::SendComplete(id)),
                SenderOutput::Aborted(id) => Output::Event(SessionEvent::SendAborted(id)),
            })
            .collect()
    }
}

impl Default for PeerSession {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    fn relay_texts(out: &[Output]) -> Vec<String> {
        out.iter()
            .filter_map(|o| match o {
                Output::Relay(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    fn frames(out: &[Output]) -> Vec<Frame> {
        out.iter()
            .filter_map(|o| match o {
                Output::Frame(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn events(out: &[Output]) -> Vec<SessionEvent> {
        out.iter()
            .filter_map(|o| match o {
                Output::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    /// Answer every `ReadChunk` in `out` from `payload`, collecting what follows.
    fn serve_reads(session: &mut PeerSession, out: Vec<Output>, payload: &[u8], buffered: u64) -> Vec<Output> {
        let mut all = Vec::new();
        let mut pending = std::collections::VecDeque::from(out);
        while let Some(o) = pending.pop_front() {
            if let Output::ReadChunk {
                transfer_id,
                offset,
                len,
            } = &o
            {
                let start = *offset as usize;
                let bytes = payload[start..start + len].to_vec();
                pending.extend(session.on_chunk_read(transfer_id, bytes, buffered));
            }
            all.push(o);
        }
        all
    }

    /// Two sessions with relays open, negotiated to Open by hand.
    fn open_pair() -> (PeerSession, PeerSession) {
        let mut a = PeerSession::with_id("p1".into(), Config::default());
        let mut b = PeerSession::with_id("p2".into(), Config::default());
        a.on_relay_state(RelayState::Open);
        b.on_relay_state(RelayState::Open);

        assert_eq!(
            a.connect("p2".into()),
            vec![Output::Channel(ChannelCommand::CreateOffer)]
        );
        let offer = relay_texts(&a.on_local_description("offer-sdp".into()));
        let out = b.on_relay_message(&offer[0]);
        assert_eq!(
            out,
            vec![Output::Channel(ChannelCommand::AcceptOffer {
                sdp: "offer-sdp".into()
            })]
        );
        let answer = relay_texts(&b.on_local_description("answer-sdp".into()));
        let out = a.on_relay_message(&answer[0]);
        assert_eq!(
            out,
            vec![Output::Channel(ChannelCommand::ApplyAnswer {
                sdp: "answer-sdp".into()
            })]
        );
        assert_eq!(
            events(&a.on_channel_event(ChannelEvent::Connected)),
            vec![SessionEvent::Connected("p2".into())]
        );
        assert_eq!(
            events(&b.on_channel_event(ChannelEvent::Connected)),
            vec![SessionEvent::Connected("p1".into())]
        );
        (a, b)
    }

    #[test]
    fn identity_is_generated_once() {
        let s = PeerSession::default();
        assert!(!s.local_id().as_str().is_empty());
        assert_eq!(s.remote_id(), None);
        assert_eq!(s.channel_state(), ChannelState::Idle);
    }

    #[test]
    fn signaling_queued_until_relay_opens() {
        let mut a = PeerSession::with_id("p1".into(), Config::default());
        a.connect("p2".into());
        let out = a.on_local_description("offer-sdp".into());
        assert_eq!(
            out,
            vec![Output::Schedule(Timer::RelayRetry, Duration::from_millis(100))]
        );
        // still connecting on retry: nothing to transmit, timer re-armed
        let out = a.on_timer(Timer::RelayRetry, 0);
        assert_eq!(
            out,
            vec![Output::Schedule(Timer::RelayRetry, Duration::from_millis(100))]
        );
        let out = a.on_relay_state(RelayState::Open);
        let texts = relay_texts(&out);
        assert_eq!(texts.len(), 1);
        let env = wire::decode_envelope(&texts[0]).unwrap();
        assert_eq!(env, SignalEnvelope::offer("p1".into(), "p2".into(), "offer-sdp".into()));
    }

    #[test]
    fn exhausted_retries_surface_dropped_signal() {
        let config = Config {
            relay_retry_attempts: 2,
            ..Config::default()
        };
        let mut a = PeerSession::with_id("p1".into(), config);
        a.connect("p2".into());
        a.on_local_description("offer-sdp".into());
        let out = a.on_timer(Timer::RelayRetry, 0);
        assert!(matches!(
            events(&out).as_slice(),
            [SessionEvent::SignalDropped(env)] if env.to == PeerId::from("p2")
        ));
    }

    #[test]
    fn send_before_open_is_noop() {
        let mut a = PeerSession::with_id("p1".into(), Config::default());
        assert!(a.send_file(3, "x", "", 0).is_empty());
        a.connect("p2".into());
        assert!(a.send_file(3, "x", "", 0).is_empty());
        assert!(!a.is_sending());
    }

    #[test]
    fn small_transfer_end_to_end() {
        let (mut a, mut b) = open_pair();
        let out = a.send_file(11, "hello.txt", "text/plain", 0);
        let out = serve_reads(&mut a, out, b"hello world", 0);
        let ev = events(&out);
        assert!(matches!(&ev[0], SessionEvent::SendStarted(m) if m.chunk_count == 1));
        assert_eq!(ev[1], SessionEvent::SendProgress(99));
        assert_eq!(ev[2], SessionEvent::SendProgress(100));
        assert!(matches!(&ev[3], SessionEvent::SendComplete(_)));

        let mut received = Vec::new();
        for f in frames(&out) {
            received.extend(events(&b.on_frame(f)));
        }
        assert!(matches!(&received[0], SessionEvent::ReceiveMetadata(m) if m.name == "hello.txt"));
        assert_eq!(received[1], SessionEvent::ReceiveProgress(100));
        assert!(matches!(
            &received[2],
            SessionEvent::ReceiveComplete { payload, .. } if payload == b"hello world"
        ));
    }

    #[test]
    fn second_send_while_busy_is_noop() {
        let config = Config {
            buffer_low_watermark: 0,
            buffer_high_watermark: 0,
            ..Config::default()
        };
        let mut a = PeerSession::with_id("p1".into(), config.clone());
        let mut b = PeerSession::with_id("p2".into(), config);
        a.on_relay_state(RelayState::Open);
        b.on_relay_state(RelayState::Open);
        a.connect("p2".into());
        let offer = relay_texts(&a.on_local_description("o".into()));
        b.on_relay_message(&offer[0]);
        let answer = relay_texts(&b.on_local_description("a".into()));
        a.on_relay_message(&answer[0]);
        a.on_channel_event(ChannelEvent::Connected);

        let first = a.send_file(100, "a", "", 0);
        assert!(!first.is_empty());
        assert!(a.is_sending());
        assert!(a.send_file(100, "b", "", 0).is_empty());
    }

    #[test]
    fn channel_failure_abandons_transfers() {
        let (mut a, mut b) = open_pair();
        let out = a.send_file(40000, "r", "", 32 * 1024 * 1024);
        assert!(a.is_sending());
        // receiver gets only the metadata
        b.on_frame(frames(&out)[0].clone());
        assert!(b.is_receiving());

        let out = a.on_channel_event(ChannelEvent::Failed);
        assert_eq!(
            events(&out),
            vec![SessionEvent::Disconnected {
                remote: Some("p2".into()),
                reason: DisconnectReason::Failed
            }]
        );
        assert!(!a.is_sending());
        assert_eq!(a.channel_state(), ChannelState::Failed);

        b.on_channel_event(ChannelEvent::Disconnected);
        assert!(!b.is_receiving());
        // frames after teardown are ignored
        assert!(b.on_frame(Frame::Binary(vec![0u8; 10])).is_empty());
    }

    #[test]
    fn backpressure_resumes_on_drain() {
        let (mut a, _b) = open_pair();
        let out = a.send_file(40000, "r", "", 17 * 1024 * 1024);
        assert_eq!(frames(&out).len(), 1);
        assert!(out.contains(&Output::Schedule(Timer::DrainPoll, Duration::from_millis(20))));

        let out = a.on_timer(Timer::DrainPoll, 4 * 1024 * 1024);
        assert_eq!(
            out,
            vec![Output::Schedule(Timer::DrainPoll, Duration::from_millis(20))]
        );
        // Still above the low watermark: stay paused.
        assert!(a.on_buffer_drained(4 * 1024 * 1024).is_empty());
        let out = a.on_buffer_drained(512 * 1024);
        let out = serve_reads(&mut a, out, &[0u8; 40000], 512 * 1024);
        assert_eq!(frames(&out).len(), 4);
        assert!(!a.is_sending());
    }

    #[test]
    fn failed_read_aborts_send() {
        let (mut a, _b) = open_pair();
        let out = a.send_file(40000, "r", "", 0);
        let Some(Output::ReadChunk { transfer_id, .. }) = out.last().cloned() else {
            panic!("expected a chunk read")
        };
        assert_eq!(a.abort_send(), vec![Output::Event(SessionEvent::SendAborted(transfer_id.clone()))]);
        assert!(!a.is_sending());
        // Late bytes for the dropped transfer are ignored.
        assert!(a.on_chunk_read(&transfer_id, vec![0u8; 16384], 0).is_empty());
        assert!(a.abort_send().is_empty());
    }

    #[test]
    fn short_read_surfaces_send_aborted() {
        let (mut a, _b) = open_pair();
        let out = a.send_file(40000, "r", "", 0);
        let Some(Output::ReadChunk { transfer_id, .. }) = out.last().cloned() else {
            panic!("expected a chunk read")
        };
        let out = a.on_chunk_read(&transfer_id, vec![0u8; 10], 0);
        assert_eq!(events(&out), vec![SessionEvent::SendAborted(transfer_id)]);
        assert!(frames(&out).is_empty());
        assert!(!a.is_sending());
    }

    #[test]
    fn close_and_reset() {
        let (mut a, _b) = open_pair();
        let out = a.close();
        assert_eq!(out[0], Output::Channel(ChannelCommand::Close));
        assert_eq!(a.channel_state(), ChannelState::Closed);
        // terminal: connect is refused until reset
        assert!(a.connect("p3".into()).is_empty());
        a.reset();
        assert_eq!(a.channel_state(), ChannelState::Idle);
        assert_eq!(a.remote_id(), None);
        assert_eq!(a.local_id(), &PeerId::from("p1"));
        assert_eq!(
            a.connect("p3".into()),
            vec![Output::Channel(ChannelCommand::CreateOffer)]
        );
    }

    #[test]
    fn relay_traffic_for_others_is_ignored() {
        let mut b = PeerSession::with_id("p2".into(), Config::default());
        b.on_relay_state(RelayState::Open);
        let foreign = r#"{"type":"offer","from":"p1","to":"p3","sdp":"v=0"}"#;
        assert!(b.on_relay_message(foreign).is_empty());
        assert_eq!(b.channel_state(), ChannelState::Idle);
        let candidate = r#"{"type":"candidate","from":"p1","to":"p2","candidate":{"candidate":"x"}}"#;
        assert!(b.on_relay_message(candidate).is_empty());
        assert_eq!(b.channel_state(), ChannelState::Idle);
    }
}
