//! WebSocket transport over `tokio-tungstenite`.
//!
//! [`connect`] performs the TLS/WebSocket handshake and splits the stream into
//! a [`WsSink`] and a [`WsSource`]. Unlike a market-data feed connection there
//! is no reconnect loop here: a dropped socket ends the session and the caller
//! decides what to do next.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{FrameSink, FrameSource};
use crate::error::{Result, TdsError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of a WebSocket connection.
pub struct WsSink {
    inner: SplitSink<WsStream, Message>,
    closed: bool,
}

/// Read half of a WebSocket connection.
pub struct WsSource {
    inner: SplitStream<WsStream>,
}

/// Open a WebSocket connection to `url` with optional extra handshake headers.
pub async fn connect(url: &str, extra_headers: &HashMap<String, String>) -> Result<(WsSink, WsSource)> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| TdsError::Transport(format!("bad socket url {url}: {e}")))?;

    for (key, value) in extra_headers {
        let name = tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| TdsError::Transport(format!("bad header name {key}: {e}")))?;
        let value = value
            .parse()
            .map_err(|e| TdsError::Transport(format!("bad header value for {key}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    info!("[ws] connecting to {url} (host={})", extract_host(url));
    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TdsError::Transport(format!("connect {url}: {e}")))?;
    info!("[ws] connected");

    let (write, read) = stream.split();
    Ok((WsSink { inner: write, closed: false }, WsSource { inner: read }))
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(TdsError::Transport("socket already closed".into()));
        }
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TdsError::Transport(format!("write: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner
            .close()
            .await
            .map_err(|e| TdsError::Transport(format!("close: {e}")))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => {
                    let text: &str = &text;
                    return Some(Ok(text.to_owned()));
                }
                Ok(Message::Close(frame)) => {
                    warn!("[ws] received close frame: {frame:?}");
                    return None;
                }
                Ok(Message::Binary(data)) => {
                    debug!("[ws] ignoring {} byte binary frame", data.len());
                }
                // Pings are answered by tungstenite on the next write/flush.
                Ok(_) => {}
                Err(e) => return Some(Err(TdsError::Transport(format!("read: {e}")))),
            }
        }
    }
}

/// Extract the host from a URL string.
fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.host_str().unwrap_or("").to_string())
        .unwrap_or_default()
}
