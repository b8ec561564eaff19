use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::TelemetryError;
use crate::transport::{Channel, Endpoint, Incoming, Transport, CHANNEL_CAPACITY};

/// WebSocket transport to the cluster-watch service.
///
/// Every `connect` opens its own socket and spawns a pump task that moves
/// text messages between the socket and the returned [`Channel`].
#[derive(Debug, Clone)]
pub struct WsTransport {
    base: Url,
}

impl WsTransport {
    pub fn new(base: Url) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TelemetryError> {
        let url = endpoint.url(&self.base)?;
        log::debug!("ws: connecting {url}");

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TelemetryError::connect_failed(endpoint, e))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(ws, outbound_rx, inbound_tx, endpoint.to_string()));

        Ok(Channel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<Incoming>,
    endpoint: String,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(Incoming::Message(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if inbound.send(Incoming::Message(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("ws: read error on {endpoint}: {e}");
                    let _ = inbound.send(Incoming::Failed(e.to_string())).await;
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        log::warn!("ws: write error on {endpoint}: {e}");
                        let _ = inbound.send(Incoming::Failed(e.to_string())).await;
                        break;
                    }
                }
                None => break,
            },
            _ = inbound.closed() => break,
        }
    }

    let _ = sink.close().await;
    log::debug!("ws: closed {endpoint}");
}
