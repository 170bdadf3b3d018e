//! WebSocket substrate: text and binary frames are unified into plain
//! bytes before reaching the Tokenizer/Queue, and pings are answered
//! automatically. Reconnect and TLS follow the same shape as the stream
//! socket substrate.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::{backoff_delay, QueueHandles, TlsContext, TlsVerifyMode, Transport, TransportCore, TransportState};
use crate::error::TransportError;
use crate::task::{ResponseParser, TaskInfo};
use crate::tokenizer::Tokenizer;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Configuration for a [`WebSocketTransport`].
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Full `ws://` or `wss://` endpoint URL.
    pub url: String,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// WebSocket transport with automatic reconnect. TLS is implied by a
/// `wss://` URL; `start_tls` forces a reconnect under the TLS posture
/// supplied (the scheme is not rewritten — callers should configure a
/// `wss://` URL up front).
pub struct WebSocketTransport {
    core: TransportCore,
    config: Mutex<WebSocketConfig>,
    sink: Mutex<Option<WsSink>>,
    attempt: AtomicU32,
    tls: Mutex<Option<(TlsVerifyMode, TlsContext)>>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig, handles: QueueHandles, tokenizer: Option<Tokenizer>) -> Arc<Self> {
        let this = Arc::new(Self {
            core: TransportCore::new(handles, tokenizer),
            config: Mutex::new(config),
            sink: Mutex::new(None),
            attempt: AtomicU32::new(0),
            tls: Mutex::new(None),
        });
        let loop_handle = this.clone();
        tokio::spawn(async move { loop_handle.reconnect_loop().await });
        this
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.core.is_terminated() {
                return;
            }
            self.core.set_state(TransportState::Connecting);
            match self.try_connect_once().await {
                Ok((sink, stream)) => {
                    self.attempt.store(0, Ordering::SeqCst);
                    *self.sink.lock().await = Some(sink);
                    self.core.set_online(true).await;
                    let url = self.config.lock().await.url.clone();
                    debug!(url = %url, "websocket connected");
                    self.read_loop(stream).await;
                    *self.sink.lock().await = None;
                    self.core.set_online(false).await;
                    if let Some(tokenizer) = self.core.tokenizer_handle() {
                        tokenizer.lock().await.clear();
                    }
                }
                Err(err) => {
                    warn!(error = %err, "websocket connect failed");
                }
            }

            if self.core.is_terminated() {
                return;
            }
            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
    }

    async fn try_connect_once(&self) -> Result<(WsSink, WsStream), TransportError> {
        let url = self.config.lock().await.url.clone();
        let (stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::InvalidUri(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((sink, stream))
    }

    async fn read_loop(&self, mut stream: WsStream) {
        while let Some(message) = stream.next().await {
            match message {
                Ok(WsMessage::Binary(data)) => {
                    self.core.process(Bytes::from(data)).await;
                }
                Ok(WsMessage::Text(text)) => {
                    self.core.process(Bytes::from(text.into_bytes())).await;
                }
                Ok(WsMessage::Ping(payload)) => {
                    let mut sink = self.sink.lock().await;
                    if let Some(sink) = sink.as_mut() {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    trace!("websocket peer closed");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    trace!(error = %err, "websocket read error");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, connect_timeout: Duration) -> Result<(), TransportError> {
        if self.core.is_terminated() {
            return Err(TransportError::Terminated);
        }
        if self.core.state() == TransportState::Connected {
            return Ok(());
        }
        tokio::time::timeout(connect_timeout, self.core.wait_online())
            .await
            .map_err(|_| TransportError::Disconnected)?
    }

    async fn terminate(&self) {
        self.core.mark_terminated();
        *self.sink.lock().await = None;
        self.core.report_disconnected().await;
    }

    async fn disconnect(&self) {
        let mut sink = self.sink.lock().await;
        if let Some(sink) = sink.as_mut() {
            let _ = sink.close().await;
        }
        *sink = None;
    }

    async fn send(&self, bytes: Bytes) -> usize {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => {
                let len = bytes.len();
                match sink.send(WsMessage::Binary(bytes.to_vec())).await {
                    Ok(()) => len,
                    Err(err) => {
                        warn!(error = %err, "websocket write failed");
                        0
                    }
                }
            }
            None => 0,
        }
    }

    async fn send_with_task(&self, bytes: Bytes, task: TaskInfo, parser: Option<ResponseParser>) -> usize {
        self.core.register_current(task, parser).await;
        self.send(bytes).await
    }

    async fn start_tls(&self, verify_mode: TlsVerifyMode, context: TlsContext) -> Result<(), TransportError> {
        let mut tls = self.tls.lock().await;
        if tls.is_some() {
            return Ok(());
        }
        *tls = Some((verify_mode, context));
        drop(tls);
        self.disconnect().await;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }
}
