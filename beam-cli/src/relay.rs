//! Websocket connection to the signal relay. Reports lifecycle and inbound text to the
//! event loop; writes whatever text the session hands it.

use anyhow::Context;
use beam_core::RelayState;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::driver::HostEvent;

/// Spawn the relay task. Returns the sender for outbound text messages.
pub fn spawn(url: String, events: mpsc::UnboundedSender<HostEvent>) -> mpsc::UnboundedSender<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = run(&url, events.clone(), rx).await {
            warn!(url = %url, error = %e, "relay connection ended");
        }
        let _ = events.send(HostEvent::RelayState(RelayState::Closed));
    });
    tx
}

async fn run(
    url: &str,
    events: mpsc::UnboundedSender<HostEvent>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    info!(url, "connecting to relay");
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("connecting to relay {url}"))?;
    let (mut write, mut read) = ws.split();
    let _ = events.send(HostEvent::RelayState(RelayState::Open));
    info!(url, "relay connected");

    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(text) = msg else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                write
                    .send(Message::Text(text.into()))
                    .await
                    .context("writing to relay")?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(HostEvent::RelayMessage(text.as_str().to_string()));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(url, "relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("reading from relay"),
                }
            }
        }
    }
    Ok(())
}
