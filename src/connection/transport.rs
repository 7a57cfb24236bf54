use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

/// Upper bound for the close handshake on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// A frame received from the sensor stream.
///
/// Only data-bearing frames are distinguished; everything else
/// (ping, pong, raw frames) is reported as `Control` and ignored
/// by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Control,
}

/// One live connection to the stream endpoint.
///
/// The manager owns at most one `Link` at a time.
#[async_trait::async_trait]
pub trait Link: Send {
    /// Next frame from the peer.
    ///
    /// RETURNS:
    /// - `Some(Ok(frame))` for every received frame
    /// - `Some(Err(_))` on a transport error (link is dead)
    /// - `None` once the peer closed the connection
    async fn next_frame(&mut self) -> Option<anyhow::Result<Frame>>;

    /// Closes the link. Must never fail; errors are swallowed.
    async fn close(&mut self);
}

/// Opens links to a stream endpoint.
///
/// The WebSocket implementation is [`WsTransport`]; tests inject
/// scripted transports through the same seam.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Establishes a new link to `endpoint`.
    async fn open(&self, endpoint: &str) -> anyhow::Result<Box<dyn Link>>;
}

// ------------------------------------------------------------
// WebSocket transport
// ------------------------------------------------------------
//
// Plain `ws://` and TLS `wss://` endpoints through tokio-tungstenite.
// No subprotocol, no auth headers.
//
pub struct WsTransport;

#[async_trait::async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, endpoint: &str) -> anyhow::Result<Box<dyn Link>> {
        let (ws, response) = connect_async(endpoint).await?;
        log::debug!("Handshake with {} answered {}", endpoint, response.status());

        Ok(Box::new(WsLink { ws }))
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsLink {
    /// Tungstenite queues the close reply and only sends it on the next
    /// read or flush, so keep reading until the stream ends.
    async fn finish_close_handshake(&mut self) {
        let drain = async {
            while let Some(Ok(_)) = self.ws.next().await {}
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
            log::debug!("Peer did not finish the close handshake");
        }
    }
}

#[async_trait::async_trait]
impl Link for WsLink {
    async fn next_frame(&mut self) -> Option<anyhow::Result<Frame>> {
        match self.ws.next().await? {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data.to_vec()))),

            // Peer initiated close: flush our reply, then the link is over
            Ok(Message::Close(frame)) => {
                if let Some(f) = frame {
                    log::debug!("Close frame received: {} {}", f.code, f.reason);
                }
                self.finish_close_handshake().await;
                None
            }

            // Ping / pong are answered by tungstenite itself
            Ok(_) => Some(Ok(Frame::Control)),

            Err(e) => Some(Err(e.into())),
        }
    }

    async fn close(&mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Close handshake failed: {}", e),
            Err(_) => log::debug!("Close handshake timed out"),
        }
    }
}
