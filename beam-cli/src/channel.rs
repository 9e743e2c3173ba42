//! WebRTC data channel adapter: runs channel commands from the session and reports
//! descriptions, candidates, lifecycle, frames, and drain signals back to the event loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use beam_core::{ChannelCommand, ChannelEvent, Frame};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::driver::HostEvent;

const LABEL: &str = "beam";

type SharedChannel = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// What a channel reports back to the event loop.
#[derive(Debug)]
pub enum ChannelSignal {
    LocalDescription(String),
    LocalCandidate(Value),
    Lifecycle(ChannelEvent),
    Frame(Frame),
    /// Buffered amount fell to the low watermark.
    Drained,
}

/// Tags every signal with the channel generation so callbacks from a replaced
/// peer connection can be told apart.
#[derive(Clone)]
struct Emitter {
    generation: u64,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl Emitter {
    fn emit(&self, signal: ChannelSignal) {
        let _ = self.events.send(HostEvent::Channel {
            generation: self.generation,
            signal,
        });
    }
}

pub struct Channel {
    pc: Arc<RTCPeerConnection>,
    dc: SharedChannel,
    emitter: Emitter,
    low_watermark: usize,
    remote_description_set: bool,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl Channel {
    pub async fn new(
        generation: u64,
        stun_servers: &[String],
        low_watermark: u64,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> anyhow::Result<Self> {
        let mut me = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut me)?;
        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .build();
        let ice_servers = if stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .context("creating peer connection")?,
        );
        let dc: SharedChannel = Arc::new(Mutex::new(None));
        let low_watermark = usize::try_from(low_watermark).unwrap_or(usize::MAX);
        let emitter = Emitter { generation, events };

        let tx = emitter.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(c) = candidate else {
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        tx.emit(ChannelSignal::LocalCandidate(candidate_json(&init)));
                    }
                    Err(e) => debug!(error = %e, "skipping unserializable candidate"),
                }
            })
        }));

        let tx = emitter.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(?state, "peer connection state");
                let event = match state {
                    RTCPeerConnectionState::Failed => ChannelEvent::Failed,
                    RTCPeerConnectionState::Disconnected => ChannelEvent::Disconnected,
                    RTCPeerConnectionState::Closed => ChannelEvent::Closed,
                    _ => return,
                };
                tx.emit(ChannelSignal::Lifecycle(event));
            })
        }));

        let tx = emitter.clone();
        let slot = dc.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let slot = slot.clone();
            Box::pin(async move {
                info!(label = channel.label(), "remote data channel");
                attach(&channel, tx, low_watermark).await;
                *slot.lock().await = Some(channel);
            })
        }));

        Ok(Self {
            pc,
            dc,
            emitter,
            low_watermark,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        })
    }

    pub async fn execute(&mut self, cmd: ChannelCommand) -> anyhow::Result<()> {
        match cmd {
            ChannelCommand::CreateOffer => {
                let channel = self
                    .pc
                    .create_data_channel(
                        LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await
                    .context("creating data channel")?;
                attach(&channel, self.emitter.clone(), self.low_watermark).await;
                *self.dc.lock().await = Some(channel);

                let offer = self.pc.create_offer(None).await.context("creating offer")?;
                self.pc
                    .set_local_description(offer.clone())
                    .await
                    .context("setting local offer")?;
                self.emitter.emit(ChannelSignal::LocalDescription(offer.sdp));
            }
            ChannelCommand::AcceptOffer { sdp } => {
                let desc = RTCSessionDescription::offer(sdp)?;
                self.pc
                    .set_remote_description(desc)
                    .await
                    .context("setting remote offer")?;
                self.remote_description_set = true;
                self.flush_candidates().await;

                let answer = self.pc.create_answer(None).await.context("creating answer")?;
                self.pc
                    .set_local_description(answer.clone())
                    .await
                    .context("setting local answer")?;
                self.emitter.emit(ChannelSignal::LocalDescription(answer.sdp));
            }
            ChannelCommand::ApplyAnswer { sdp } => {
                let desc = RTCSessionDescription::answer(sdp)?;
                self.pc
                    .set_remote_description(desc)
                    .await
                    .context("setting remote answer")?;
                self.remote_description_set = true;
                self.flush_candidates().await;
            }
            ChannelCommand::AddCandidate(value) => {
                let Some(init) = parse_candidate(&value) else {
                    debug!(%value, "ignoring malformed candidate");
                    return Ok(());
                };
                if self.remote_description_set {
                    self.pc
                        .add_ice_candidate(init)
                        .await
                        .context("adding candidate")?;
                } else {
                    trace!("buffering candidate until remote description");
                    self.pending_candidates.push(init);
                }
            }
            ChannelCommand::Close => {
                self.pc.close().await.context("closing peer connection")?;
            }
        }
        Ok(())
    }

    pub async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        let dc = self
            .dc
            .lock()
            .await
            .clone()
            .context("data channel not created")?;
        match frame {
            Frame::Text(text) => dc.send_text(text).await.context("sending text frame")?,
            Frame::Binary(bytes) => dc
                .send(&Bytes::from(bytes))
                .await
                .context("sending chunk")?,
        };
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.emitter.generation
    }

    /// Bytes queued on the data channel and not yet sent.
    pub async fn buffered_amount(&self) -> u64 {
        let dc = self.dc.lock().await.clone();
        match dc {
            Some(dc) => dc.buffered_amount().await as u64,
            None => 0,
        }
    }

    /// Wait until the data channel has handed every queued byte to the transport.
    pub async fn wait_drained(&self, poll: Duration) {
        while self.buffered_amount().await > 0 {
            tokio::time::sleep(poll).await;
        }
    }

    async fn flush_candidates(&mut self) {
        for init in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(error = %e, "failed to add buffered candidate");
            }
        }
    }
}

async fn attach(dc: &Arc<RTCDataChannel>, events: Emitter, low: usize) {
    let tx = events.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        info!(label = %label, "data channel open");
        tx.emit(ChannelSignal::Lifecycle(ChannelEvent::Connected));
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        tx.emit(ChannelSignal::Lifecycle(ChannelEvent::Closed));
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if let Some(frame) = frame_from_message(&msg) {
            tx.emit(ChannelSignal::Frame(frame));
        }
        Box::pin(async {})
    }));

    dc.set_buffered_amount_low_threshold(low).await;
    let tx = events;
    dc.on_buffered_amount_low(Box::new(move || {
        tx.emit(ChannelSignal::Drained);
        Box::pin(async {})
    }))
    .await;
}

fn frame_from_message(msg: &DataChannelMessage) -> Option<Frame> {
    if !msg.is_string {
        return Some(Frame::Binary(msg.data.to_vec()));
    }
    match String::from_utf8(msg.data.to_vec()) {
        Ok(text) => Some(Frame::Text(text)),
        Err(_) => {
            debug!("dropping non-utf8 text message");
            None
        }
    }
}

/// Browser-shaped candidate object, as carried in the `candidate` field of an envelope.
fn candidate_json(init: &RTCIceCandidateInit) -> Value {
    json!({
        "candidate": init.candidate,
        "sdpMid": init.sdp_mid,
        "sdpMLineIndex": init.sdp_mline_index,
        "usernameFragment": init.username_fragment,
    })
}

fn parse_candidate(value: &Value) -> Option<RTCIceCandidateInit> {
    let candidate = value.get("candidate")?.as_str()?;
    if candidate.is_empty() {
        return None;
    }
    Some(RTCIceCandidateInit {
        candidate: candidate.to_string(),
        sdp_mid: value
            .get("sdpMid")
            .and_then(Value::as_str)
            .map(str::to_string),
        sdp_mline_index: value
            .get("sdpMLineIndex")
            .and_then(Value::as_u64)
            .and_then(|i| u16::try_from(i).ok()),
        username_fragment: value
            .get("usernameFragment")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
