//! Beam peer session and transfer protocol.
//! Host-driven: no I/O; host passes events and receives outputs.

pub mod chunk;
pub mod config;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod receiver;
pub mod relay;
pub mod scheduler;
pub mod sender;
pub mod session;
pub mod wire;

pub use chunk::CHUNK_SIZE;
pub use config::Config;
pub use handshake::{ChannelCommand, ChannelEvent, ChannelState, DisconnectReason};
pub use identity::PeerId;
pub use protocol::{SignalEnvelope, SignalKind, TransferId, TransferMetadata};
pub use relay::RelayState;
pub use scheduler::Timer;
pub use session::{Output, PeerSession, SessionEvent};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
