//! WebSocket session with the gateway.
//!
//! One transport per connection attempt. It speaks the `acnet-client`
//! sub-protocol, carries opaque binary frames in both directions, and is
//! split into a sink and a source so the connection driver can interleave
//! writes with the read loop.

use std::fmt;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::trace;

/// Sub-protocol token offered during the WebSocket handshake.
pub(crate) const SUBPROTOCOL: &str = "acnet-client";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub(crate) enum TransportError {
    /// The gateway URL could not be turned into a handshake request.
    Url(tungstenite::Error),
    /// Handshake or socket failure.
    Socket(tungstenite::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Url(e) => write!(f, "bad gateway url: {}", e),
            TransportError::Socket(e) => write!(f, "websocket failure: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

pub(crate) struct Transport {
    ws: WsStream,
}

impl Transport {
    /// Open a session to the gateway. Compression is never negotiated;
    /// frames cross the wire as-is.
    pub async fn connect(url: &str) -> Result<Transport, TransportError> {
        let mut request = url.into_client_request().map_err(TransportError::Url)?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (ws, _response) = connect_async(request).await.map_err(TransportError::Socket)?;
        Ok(Transport { ws })
    }

    pub fn split(self) -> (FrameSink, FrameSource) {
        let (sink, source) = self.ws.split();
        (FrameSink { inner: sink }, FrameSource { inner: source })
    }
}

pub(crate) struct FrameSink {
    inner: SplitSink<WsStream, Message>,
}

impl FrameSink {
    pub async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.inner
            .send(Message::binary(frame))
            .await
            .map_err(TransportError::Socket)
    }
}

pub(crate) struct FrameSource {
    inner: SplitStream<WsStream>,
}

impl FrameSource {
    /// Next binary frame from the gateway.
    ///
    /// `Ok(None)` means the session completed; an error means it failed.
    /// Either way the session is done and must be replaced.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(msg) = self.inner.next().await {
            match msg.map_err(TransportError::Socket)? {
                Message::Binary(pkt) => return Ok(Some(pkt)),
                Message::Close(_) => return Ok(None),
                other => trace!(kind = ?other, "ignoring non-binary message"),
            }
        }
        Ok(None)
    }
}
