//! Single-task event loop. Owns the `PeerSession`, feeds it relay, channel, and timer
//! events, and executes the outputs it returns.

use std::collections::VecDeque;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use beam_core::{
    ChannelCommand, ChannelEvent, ChannelState, Output, PeerId, PeerSession, RelayState,
    SessionEvent, Timer,
};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelSignal};
use crate::config::Config;
use crate::progress::TransferProgress;
use crate::relay;

/// Everything the loop reacts to.
#[derive(Debug)]
pub enum HostEvent {
    RelayState(RelayState),
    RelayMessage(String),
    Channel { generation: u64, signal: ChannelSignal },
    Timer(Timer),
}

#[derive(Debug, Clone)]
pub enum Role {
    /// Caller: connect to `to` and send `file` once the channel opens.
    Send { to: PeerId, file: PathBuf },
    /// Answerer: accept offers and write completed transfers into `download_dir`.
    Receive { download_dir: PathBuf },
}

const DRAIN_POLL: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// SCTP acknowledgements trail the buffered amount reaching zero.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

pub struct Driver {
    session: PeerSession,
    role: Role,
    stun_servers: Vec<String>,
    channel: Channel,
    relay: mpsc::UnboundedSender<String>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    events_rx: mpsc::UnboundedReceiver<HostEvent>,
    progress: Option<TransferProgress>,
    /// File being sent; chunks are read from it on request.
    source: Option<File>,
    renew_channel: bool,
    sent: bool,
    done: bool,
}

impl Driver {
    /// Connect to the relay and prepare the first channel.
    pub async fn new(session: PeerSession, role: Role, config: &Config) -> anyhow::Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let relay = relay::spawn(config.relay_url.clone(), events_tx.clone());
        let channel = Channel::new(
            0,
            &config.stun_servers,
            session.config().buffer_low_watermark,
            events_tx.clone(),
        )
        .await?;
        Ok(Self {
            session,
            role,
            stun_servers: config.stun_servers.clone(),
            channel,
            relay,
            events_tx,
            events_rx,
            progress: None,
            source: None,
            renew_channel: false,
            sent: false,
            done: false,
        })
    }

    /// Run until the role is finished, the relay goes away, or `shutdown` resolves.
    pub async fn run(
        mut self,
        shutdown: impl Future<Output = anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        if let Role::Send { to, .. } = &self.role {
            let out = self.session.connect(to.clone());
            self.execute(out).await?;
        }
        tokio::pin!(shutdown);
        while !self.done {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    info!("shutting down");
                    let out = self.session.close();
                    self.execute(out).await?;
                    break;
                }
                ev = self.events_rx.recv() => {
                    let Some(ev) = ev else { break };
                    self.handle(ev).await?;
                }
            }
        }
        if let Role::Send { .. } = self.role {
            if !self.sent {
                anyhow::bail!("transfer did not complete");
            }
        }
        Ok(())
    }

    async fn handle(&mut self, ev: HostEvent) -> anyhow::Result<()> {
        let out = match ev {
            HostEvent::RelayState(state) => {
                if state == RelayState::Closed && self.session.channel_state() != ChannelState::Open {
                    warn!("relay closed before the channel opened");
                    self.done = true;
                }
                self.session.on_relay_state(state)
            }
            HostEvent::RelayMessage(text) => self.session.on_relay_message(&text),
            HostEvent::Timer(timer) => {
                let buffered = self.channel.buffered_amount().await;
                self.session.on_timer(timer, buffered)
            }
            HostEvent::Channel { generation, signal } => {
                if generation != self.channel.generation() {
                    debug!(generation, ?signal, "ignoring signal from replaced channel");
                    return Ok(());
                }
                match signal {
                    ChannelSignal::LocalDescription(sdp) => self.session.on_local_description(sdp),
                    ChannelSignal::LocalCandidate(c) => self.session.on_local_candidate(c),
                    ChannelSignal::Lifecycle(event) => self.session.on_channel_event(event),
                    ChannelSignal::Frame(frame) => self.session.on_frame(frame),
                    ChannelSignal::Drained => {
                        let buffered = self.channel.buffered_amount().await;
                        self.session.on_buffer_drained(buffered)
                    }
                }
            }
        };
        self.execute(out).await?;
        if self.renew_channel {
            self.renew_channel = false;
            self.replace_channel().await?;
        }
        Ok(())
    }

    /// Execute outputs in order. Session events may produce further outputs; those queue behind.
    async fn execute(&mut self, outputs: Vec<Output>) -> anyhow::Result<()> {
        let mut queue: VecDeque<Output> = outputs.into();
        while let Some(output) = queue.pop_front() {
            match output {
                Output::Relay(text) => {
                    if self.relay.send(text).is_err() {
                        warn!("relay task gone, message lost");
                    }
                }
                Output::Channel(cmd) => {
                    if let Err(e) = self.channel.execute(cmd).await {
                        warn!(error = %e, "channel command failed");
                        queue.extend(self.session.on_channel_event(ChannelEvent::Failed));
                    }
                }
                Output::Frame(frame) => {
                    if let Err(e) = self.channel.send(frame).await {
                        warn!(error = %e, "frame send failed");
                        queue.extend(self.session.on_channel_event(ChannelEvent::Failed));
                    }
                }
                Output::ReadChunk {
                    transfer_id,
                    offset,
                    len,
                } => {
                    let Some(file) = self.source.as_mut() else {
                        debug!(%transfer_id, "chunk requested with no open source");
                        continue;
                    };
                    match read_chunk(file, offset, len).await {
                        Ok(bytes) => {
                            let buffered = self.channel.buffered_amount().await;
                            queue.extend(self.session.on_chunk_read(&transfer_id, bytes, buffered));
                        }
                        Err(e) => {
                            warn!(%transfer_id, offset, error = %e, "reading file failed");
                            queue.extend(self.session.abort_send());
                        }
                    }
                }
                Output::Schedule(timer, after) => {
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(HostEvent::Timer(timer));
                    });
                }
                Output::Event(event) => queue.extend(self.on_session_event(event).await?),
            }
        }
        Ok(())
    }

    async fn on_session_event(&mut self, event: SessionEvent) -> anyhow::Result<Vec<Output>> {
        match event {
            SessionEvent::Connected(remote) => {
                info!(remote = %remote, "connected");
                if let Role::Send { file, .. } = &self.role {
                    let file = file.clone();
                    return self.start_send(&file).await;
                }
            }
            SessionEvent::Disconnected { remote, reason } => {
                info!(remote = ?remote.as_ref().map(PeerId::as_str), ?reason, "disconnected");
                if let Some(p) = self.progress.take() {
                    p.abandon();
                }
                match self.role {
                    Role::Send { .. } => self.done = true,
                    Role::Receive { .. } => {
                        // stays available for the next caller
                        let out = self.session.reset();
                        self.renew_channel = true;
                        return Ok(out
                            .into_iter()
                            .filter(|o| !matches!(o, Output::Channel(_)))
                            .collect());
                    }
                }
            }
            SessionEvent::SendStarted(meta) => {
                info!(transfer_id = %meta.transfer_id, name = %meta.name, size = meta.byte_size, "sending");
                self.progress = Some(TransferProgress::new("Sending", &meta.name, meta.byte_size));
            }
            SessionEvent::SendProgress(p) | SessionEvent::ReceiveProgress(p) => {
                if let Some(bar) = &self.progress {
                    bar.update(p);
                }
            }
            SessionEvent::SendComplete(id) => {
                if let Some(p) = self.progress.take() {
                    p.finish_with_message(format!("Sent {id}"));
                }
                self.source = None;
                self.sent = true;
                if tokio::time::timeout(DRAIN_TIMEOUT, self.channel.wait_drained(DRAIN_POLL))
                    .await
                    .is_err()
                {
                    warn!(transfer_id = %id, "channel did not drain before close");
                }
                tokio::time::sleep(CLOSE_GRACE).await;
                return Ok(self.session.close());
            }
            SessionEvent::SendAborted(id) => {
                error!(transfer_id = %id, "send aborted");
                if let Some(p) = self.progress.take() {
                    p.abandon();
                }
                self.source = None;
                self.done = true;
                return Ok(self.session.close());
            }
            SessionEvent::ReceiveMetadata(meta) => {
                info!(transfer_id = %meta.transfer_id, name = %meta.name, size = meta.byte_size, "incoming transfer");
                self.progress = Some(TransferProgress::new("Receiving", &meta.name, meta.byte_size));
            }
            SessionEvent::ReceiveComplete { meta, payload } => {
                if let Role::Receive { download_dir } = &self.role {
                    let path = download_dir.join(sanitize_file_name(&meta.name));
                    tokio::fs::write(&path, &payload)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(transfer_id = %meta.transfer_id, path = %path.display(), "saved");
                    if let Some(p) = self.progress.take() {
                        p.finish_with_message(format!("Saved {}", path.display()));
                    }
                }
            }
            SessionEvent::SignalDropped(envelope) => {
                warn!(kind = %envelope.kind, to = %envelope.to, "signal dropped; handshake may stall");
            }
        }
        Ok(vec![])
    }

    async fn start_send(&mut self, file: &Path) -> anyhow::Result<Vec<Output>> {
        let source = File::open(file)
            .await
            .with_context(|| format!("opening {}", file.display()))?;
        let byte_size = source
            .metadata()
            .await
            .with_context(|| format!("reading metadata of {}", file.display()))?
            .len();
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let media_type = media_type_for(&name);
        let buffered = self.channel.buffered_amount().await;
        self.source = Some(source);
        Ok(self.session.send_file(byte_size, &name, media_type, buffered))
    }

    async fn replace_channel(&mut self) -> anyhow::Result<()> {
        if let Err(e) = self.channel.execute(ChannelCommand::Close).await {
            debug!(error = %e, "closing previous channel");
        }
        let generation = self.channel.generation() + 1;
        self.channel = Channel::new(
            generation,
            &self.stun_servers,
            self.session.config().buffer_low_watermark,
            self.events_tx.clone(),
        )
        .await?;
        info!(local = self.session.local_id().short(), "waiting for the next sender");
        Ok(())
    }
}

/// Read exactly `len` bytes at `offset`. A file that shrank under us is an error.
async fn read_chunk(file: &mut File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reduce a transmitted name to a single safe file name component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .replace('\\', "/")
        .rsplit('/')
        .find(|s| !s.is_empty() && *s != "." && *s != "..")
        .unwrap_or("")
        .to_string();
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_start_matches('.').trim();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe.to_string()
    }
}

fn media_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("report.bin"), "report.bin");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_file_name("dir/"), "dir");
    }

    #[test]
    fn sanitize_falls_back_for_empty_or_hidden() {
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("///"), "file");
        assert_eq!(sanitize_file_name(".bashrc"), "bashrc");
        assert_eq!(sanitize_file_name("a<b>|c?.txt"), "abc.txt");
    }

    #[tokio::test]
    async fn reads_chunks_by_offset() {
        let path = std::env::temp_dir().join(format!("beam-read-chunk-{}.bin", std::process::id()));
        let data: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let mut file = File::open(&path).await.unwrap();
        let last = read_chunk(&mut file, 32768, 7232).await.unwrap();
        assert_eq!(last, &data[32768..]);
        // Seeks back: order of requests does not matter.
        let first = read_chunk(&mut file, 0, 16384).await.unwrap();
        assert_eq!(first, &data[..16384]);
        // Past the end of what is there.
        assert!(read_chunk(&mut file, 32768, 16384).await.is_err());

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[test]
    fn media_types() {
        assert_eq!(media_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(media_type_for("notes.txt"), "text/plain");
        assert_eq!(media_type_for("report.bin"), "application/octet-stream");
        assert_eq!(media_type_for("Makefile"), "application/octet-stream");
    }
}
