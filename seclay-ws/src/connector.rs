use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

// ---

use seclay_domain::{Connector, Result, Socket, SocketSink, SocketSource};

// ---

use super::WsError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// WsConnector
// ---------------------------------------------------------------------------

/// Connects to `ws://` and `wss://` URLs. TLS roots come from
/// `webpki-roots`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

// ---

impl WsConnector {
    // ---
    pub fn new() -> Self {
        Self
    }
}

// ---

#[async_trait]
impl Connector for WsConnector {
    // ---
    async fn connect(&self, url: &str, headers: &[(String, String)]) -> Result<Socket> {
        // ---
        let mut request = url
            .into_client_request()
            .map_err(|e| WsError::Request(e.to_string()))?;

        for (name, value) in headers {
            let header = |reason: String| WsError::Header {
                name: name.clone(),
                reason,
            };
            let key = HeaderName::from_bytes(name.as_bytes()).map_err(|e| header(e.to_string()))?;
            let value = HeaderValue::from_str(value).map_err(|e| header(e.to_string()))?;
            request.headers_mut().insert(key, value);
        }

        let (stream, response) = connect_async(request).await.map_err(WsError::from)?;
        tracing::debug!(url, status = %response.status(), "websocket connected");

        let (sink, source) = stream.split();
        Ok(Socket {
            sink: Box::new(WsSink { sink, closed: false }),
            source: Box::new(WsSource { source }),
        })
    }
}

// ---------------------------------------------------------------------------
// WsSink / WsSource
// ---------------------------------------------------------------------------

struct WsSink {
    // ---
    sink: SplitSink<WsStream, WsMessage>,
    closed: bool,
}

// ---

#[async_trait]
impl SocketSink for WsSink {
    // ---
    async fn send(&mut self, message: Vec<u8>) -> Result<()> {
        // ---
        if self.closed {
            return Err(WsError::Closed.into());
        }
        self.sink
            .send(WsMessage::Binary(message))
            .await
            .map_err(WsError::from)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // ---
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.sink.close().await.map_err(WsError::from)?;
        Ok(())
    }
}

// ---

struct WsSource {
    // ---
    source: SplitStream<WsStream>,
}

// ---

#[async_trait]
impl SocketSource for WsSource {
    // ---
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        // ---
        loop {
            match self.source.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data)),
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!(?frame, "websocket closed by peer");
                    return Ok(None);
                }
                // tungstenite queues the pong and sends it on the next I/O.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                    continue
                }
                Some(Ok(WsMessage::Text(_))) => return Err(WsError::TextFrame.into()),
                Some(Err(e)) => return Err(WsError::from(e).into()),
                None => return Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
