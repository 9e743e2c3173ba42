//! Minimal signal relay: every text message is forwarded to every other connected client.
//! Addressing is the clients' business; the relay never parses envelopes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

type Clients = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>>;

/// Bind and serve until the process exits.
pub async fn run(listen: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding relay on {listen}"))?;
    info!(addr = %listener.local_addr()?, "relay listening");
    serve(listener).await
}

pub async fn serve(listener: TcpListener) -> anyhow::Result<()> {
    let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
    let next_id = AtomicU64::new(1);
    loop {
        let (stream, addr) = listener.accept().await.context("accepting relay client")?;
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let clients = clients.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, id, clients.clone()).await {
                debug!(client = id, %addr, error = %e, "relay client error");
            }
            clients.lock().await.remove(&id);
            info!(client = id, %addr, "relay client left");
        });
    }
}

async fn handle_client(stream: TcpStream, id: u64, clients: Clients) -> anyhow::Result<()> {
    let ws = accept_async(stream).await.context("websocket handshake")?;
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Forward messages to this client.
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    clients.lock().await.insert(id, tx);
    info!(client = id, "relay client joined");

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let delivered = fan_out(&*clients.lock().await, id, text.as_str());
                trace!(client = id, delivered, "relayed");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(client = id, error = %e, "relay read error");
                break;
            }
        }
    }
    send_task.abort();
    Ok(())
}

/// Broadcast-with-exclusion. Returns how many clients the message was queued for.
fn fan_out(clients: &HashMap<u64, mpsc::UnboundedSender<String>>, origin: u64, text: &str) -> usize {
    let mut delivered = 0;
    for (id, tx) in clients {
        if *id != origin && tx.send(text.to_string()).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    #[test]
    fn fan_out_excludes_origin() {
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        let clients: HashMap<u64, _> = [(1, tx1), (2, tx2), (3, tx3)].into_iter().collect();

        assert_eq!(fan_out(&clients, 1, "hello"), 2);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), "hello");
        assert_eq!(rx3.try_recv().unwrap(), "hello");
    }

    #[test]
    fn fan_out_skips_closed_clients() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        drop(rx1);
        let clients: HashMap<u64, _> = [(1, tx1), (2, tx2)].into_iter().collect();
        assert_eq!(fan_out(&clients, 3, "x"), 1);
    }

    #[tokio::test]
    async fn relays_between_websocket_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener));

        let (a, _) = connect_async(url.as_str()).await.unwrap();
        let (b, _) = connect_async(url.as_str()).await.unwrap();
        let (mut a_write, mut a_read) = a.split();
        let (_b_write, mut b_read) = b.split();
        // let the server register both clients
        tokio::time::sleep(Duration::from_millis(100)).await;

        let envelope = r#"{"type":"offer","from":"p1","to":"p2","sdp":"v=0"}"#;
        a_write.send(Message::Text(envelope.into())).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), b_read.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, Message::Text(envelope.into()));

        // sender does not hear its own message
        let echo = tokio::time::timeout(Duration::from_millis(200), a_read.next()).await;
        assert!(echo.is_err());
    }
}
