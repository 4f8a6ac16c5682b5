//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves, plus the [`Connector`] seam the
//! [`ConnectionManager`](crate::connection::ConnectionManager) talks to.
//! All WebSocket consumers in the crate should use this module rather than
//! `tokio-tungstenite` directly.
//!
//! # Architecture
//!
//! ```text
//!   ConnectionManager ──open(url)──► Connector
//!                                      │
//!                                      ├── TungsteniteConnector (production)
//!                                      └── in-memory connector (tests)
//!                                      │
//!                      (Box<dyn FrameWriter>, Box<dyn FrameReader>)
//! ```
//!
//! The push-channel URL is derived from the REST base URL by
//! [`push_channel_url`]; the bearer credential travels as the `token` query
//! parameter.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;

use crate::constants::PUSH_CHANNEL_PATH;
use crate::error::ConnectionErrorKind;

/// Concrete WebSocket stream type (avoids repeating the 6-line generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a push channel.
#[async_trait]
pub trait FrameWriter: Send + std::fmt::Debug {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Send a pong frame in response to a ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()>;

    /// Send a close frame with `code` and `reason`, then flush.
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Read half of a push channel.
#[async_trait]
pub trait FrameReader: Send + std::fmt::Debug {
    /// Receive the next message, returning `None` when the stream ends.
    async fn recv(&mut self) -> Option<Result<WsMessage>>;
}

/// Opens push channels.
///
/// Implementations classify handshake failures: an HTTP 401/403 during the
/// upgrade maps to [`ConnectionErrorKind::Unauthorized`], everything else to
/// [`ConnectionErrorKind::Transport`].
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Perform the handshake against `url`.
    async fn open(
        &self,
        url: &str,
    ) -> std::result::Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>), ConnectionErrorKind>;
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .send(tungstenite::Message::Close(Some(frame)))
            .await
            .context("WebSocket send_close failed")?;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsReader {
    /// Raw `Frame` variants are skipped internally.
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames, skip
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL.
///
/// The push channel carries its credential in the URL, so no extra headers
/// are sent. Returns split (writer, reader) halves for independent use in
/// `tokio::select!` loops.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the WebSocket handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {}", redact_token(url)))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Production [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn open(
        &self,
        url: &str,
    ) -> std::result::Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>), ConnectionErrorKind>
    {
        match connect(url).await {
            Ok((writer, reader)) => Ok((Box::new(writer), Box::new(reader))),
            Err(e) => Err(classify_handshake_error(&e)),
        }
    }
}

/// Map a failed handshake onto the connection error taxonomy.
fn classify_handshake_error(err: &anyhow::Error) -> ConnectionErrorKind {
    match err.downcast_ref::<tungstenite::Error>() {
        Some(tungstenite::Error::Http(response)) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                return ConnectionErrorKind::Unauthorized;
            }
        }
        Some(tungstenite::Error::Url(e)) => {
            return ConnectionErrorKind::InvalidUrl(e.to_string());
        }
        _ => {}
    }
    ConnectionErrorKind::Transport(format!("{err:#}"))
}

/// Convert an HTTP(S) URL to WS(S) scheme by prefix substitution.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Derive the notification push-channel URL from the REST base URL.
///
/// `https` maps to `wss` and `http` to `ws`; host and port are preserved, the
/// path becomes [`PUSH_CHANNEL_PATH`] and the credential is appended as the
/// `token` query parameter. A base URL that does not parse falls back to a
/// literal prefix substitution.
#[must_use]
pub fn push_channel_url(base_url: &str, credential: &str) -> String {
    if let Ok(mut url) = reqwest::Url::parse(base_url) {
        let scheme = match url.scheme() {
            "https" | "wss" => Some("wss"),
            "http" | "ws" => Some("ws"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            if url.set_scheme(scheme).is_ok() {
                url.set_path(PUSH_CHANNEL_PATH);
                url.set_query(None);
                url.set_fragment(None);
                url.query_pairs_mut().append_pair("token", credential);
                return url.to_string();
            }
        }
    }

    format!(
        "{}{}?token={}",
        http_to_ws_scheme(base_url.trim_end_matches('/')),
        PUSH_CHANNEL_PATH,
        credential
    )
}

/// Strip the credential from a push-channel URL before logging it.
#[must_use]
pub fn redact_token(url: &str) -> String {
    match url.find("token=") {
        Some(idx) => format!("{}token=***", &url[..idx]),
        None => url.to_string(),
    }
}
