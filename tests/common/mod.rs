//! In-memory push channel shared by the integration tests.
//!
//! [`MockConnector`] hands out one [`MockSocket`] per accepted handshake. The
//! test plays the server through the socket: push frames, close, or drop.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use case_sync::connection::{ConnectionManager, ConnectionState};
use case_sync::error::ConnectionErrorKind;
use case_sync::ws::{Connector, FrameReader, FrameWriter, WsMessage};
use tokio::sync::mpsc;

/// What the client wrote to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Pong(Vec<u8>),
    Close(u16, String),
}

/// How the next handshake behaves.
#[derive(Debug, Clone)]
pub enum Handshake {
    Accept,
    AcceptAfter(Duration),
    Reject(ConnectionErrorKind),
}

/// Server side of one accepted connection.
#[derive(Debug, Clone)]
pub struct MockSocket {
    to_client: Arc<Mutex<Option<mpsc::UnboundedSender<Result<WsMessage, String>>>>>,
    sent: Arc<Mutex<Vec<Sent>>>,
}

impl MockSocket {
    pub fn push_text(&self, text: &str) {
        self.push(Ok(WsMessage::Text(text.to_string())));
    }

    pub fn push_close(&self, code: u16, reason: &str) {
        self.push(Ok(WsMessage::Close {
            code,
            reason: reason.to_string(),
        }));
    }

    pub fn push_ping(&self, payload: &[u8]) {
        self.push(Ok(WsMessage::Ping(payload.to_vec())));
    }

    pub fn push_error(&self, message: &str) {
        self.push(Err(message.to_string()));
    }

    /// End the stream without a close frame (abnormal closure).
    pub fn drop_connection(&self) {
        self.to_client.lock().unwrap().take();
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.sent_texts()
            .iter()
            .filter(|t| t.as_str() == r#"{"type":"ping"}"#)
            .count()
    }

    fn push(&self, msg: Result<WsMessage, String>) {
        if let Some(tx) = self.to_client.lock().unwrap().as_ref() {
            let _ = tx.send(msg);
        }
    }
}

#[derive(Debug)]
struct MockWriter {
    sent: Arc<Mutex<Vec<Sent>>>,
}

#[async_trait]
impl FrameWriter for MockWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Text(text.to_string()));
        Ok(())
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Pong(data));
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Close(code, reason.to_string()));
        Ok(())
    }
}

#[derive(Debug)]
struct MockReader {
    rx: mpsc::UnboundedReceiver<Result<WsMessage, String>>,
}

#[async_trait]
impl FrameReader for MockReader {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        self.rx
            .recv()
            .await
            .map(|msg| msg.map_err(anyhow::Error::msg))
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    script: VecDeque<Handshake>,
    urls: Vec<String>,
    sockets: Vec<MockSocket>,
}

/// Connector that accepts (or rejects) handshakes according to a script.
///
/// Once the script is exhausted every handshake is accepted.
#[derive(Debug, Default)]
pub struct MockConnector {
    state: Mutex<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, handshake: Handshake) {
        self.state.lock().unwrap().script.push_back(handshake);
    }

    /// Handshakes attempted so far.
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().urls.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.lock().unwrap().urls.clone()
    }

    /// The `n`th accepted socket.
    pub fn socket(&self, n: usize) -> MockSocket {
        self.state.lock().unwrap().sockets[n].clone()
    }

    pub fn last_socket(&self) -> MockSocket {
        let state = self.state.lock().unwrap();
        state.sockets.last().cloned().expect("no socket accepted yet")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        url: &str,
    ) -> std::result::Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>), ConnectionErrorKind>
    {
        let handshake = {
            let mut state = self.state.lock().unwrap();
            state.urls.push(url.to_string());
            state.script.pop_front().unwrap_or(Handshake::Accept)
        };

        match handshake {
            Handshake::Reject(error) => return Err(error),
            Handshake::AcceptAfter(delay) => tokio::time::sleep(delay).await,
            Handshake::Accept => {}
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let socket = MockSocket {
            to_client: Arc::new(Mutex::new(Some(tx))),
            sent: Arc::clone(&sent),
        };
        self.state.lock().unwrap().sockets.push(socket);

        Ok((Box::new(MockWriter { sent }), Box::new(MockReader { rx })))
    }
}

/// Wait until the manager reaches `state`.
pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut rx = manager.watch_state();
    tokio::time::timeout(Duration::from_secs(3600), rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

/// Let spawned tasks run without advancing time.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
