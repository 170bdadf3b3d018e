//! TCP substrate, optionally upgraded to TLS mid-session. Generalizes the
//! teacher's `TcpSocketTransport` (`read_message`/`write_message` plus its
//! reconnect-free single-stream handling) into a reconnecting Transport.

use async_trait::async_trait;
use bytes::Bytes;
use native_tls::TlsConnector as NativeTlsConnector;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;
use tokio_native_tls::{TlsConnector, TlsStream};
use tracing::{debug, trace, warn};

use super::{backoff_delay, QueueHandles, TlsContext, TlsVerifyMode, Transport, TransportCore, TransportState};
use crate::error::TransportError;
use crate::task::{ResponseParser, TaskInfo};
use crate::tokenizer::Tokenizer;

/// Configuration for a [`StreamSocketTransport`].
#[derive(Debug, Clone)]
pub struct StreamSocketConfig {
    pub host: String,
    pub port: u16,
    /// Read-buffer size; the teacher default was 8 KiB, spec floor is 2 KiB.
    pub buffer_size: usize,
    /// Disable Nagle's algorithm on the underlying socket.
    pub tcp_nodelay: bool,
}

impl StreamSocketConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            buffer_size: 8192,
            tcp_nodelay: true,
        }
    }
}

enum ReadHalf {
    Plain(OwnedReadHalf),
    Tls(tokio::io::ReadHalf<TlsStream<TcpStream>>),
}

enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

impl ReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ReadHalf::Plain(half) => half.read(buf).await,
            ReadHalf::Tls(half) => half.read(buf).await,
        }
    }
}

impl WriteHalf {
    async fn write_all_flushed(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            WriteHalf::Plain(half) => {
                half.write_all(bytes).await?;
                half.flush().await
            }
            WriteHalf::Tls(half) => {
                half.write_all(bytes).await?;
                half.flush().await
            }
        }
    }
}

/// TCP transport with optional mid-session TLS upgrade and automatic
/// reconnect on disconnect.
pub struct StreamSocketTransport {
    core: TransportCore,
    config: StreamSocketConfig,
    writer: Mutex<Option<WriteHalf>>,
    tls: Mutex<Option<(TlsVerifyMode, TlsContext)>>,
    attempt: AtomicU32,
    /// Forces a blocked `read_loop` out of its read future on `disconnect`/
    /// `terminate`, since dropping the write half alone doesn't interrupt an
    /// in-flight read on the other half.
    disconnect_signal: Notify,
}

impl StreamSocketTransport {
    /// Build the transport and immediately start its background reconnect
    /// loop; `connect` only ever waits on that loop's progress.
    pub fn new(config: StreamSocketConfig, handles: QueueHandles, tokenizer: Option<Tokenizer>) -> Arc<Self> {
        let this = Arc::new(Self {
            core: TransportCore::new(handles, tokenizer),
            config,
            writer: Mutex::new(None),
            tls: Mutex::new(None),
            attempt: AtomicU32::new(0),
            disconnect_signal: Notify::new(),
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
                Ok((read_half, write_half)) => {
                    self.attempt.store(0, Ordering::SeqCst);
                    *self.writer.lock().await = Some(write_half);
                    self.core.set_online(true).await;
                    debug!(host = %self.config.host, port = self.config.port, "stream socket connected");
                    self.read_loop(read_half).await;
                    *self.writer.lock().await = None;
                    self.core.set_online(false).await;
                    if let Some(tokenizer) = self.core.tokenizer_handle() {
                        tokenizer.lock().await.clear();
                    }
                }
                Err(err) => {
                    warn!(host = %self.config.host, port = self.config.port, error = %err, "stream socket connect failed");
                }
            }

            if self.core.is_terminated() {
                return;
            }
            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
    }

    async fn try_connect_once(&self) -> Result<(ReadHalf, WriteHalf), TransportError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(&addr).await.map_err(TransportError::from)?;
        stream.set_nodelay(self.config.tcp_nodelay).ok();

        let tls_request = self.tls.lock().await.clone();
        match tls_request {
            None => {
                let (read, write) = stream.into_split();
                Ok((ReadHalf::Plain(read), WriteHalf::Plain(write)))
            }
            Some((verify_mode, context)) => {
                let mut builder = NativeTlsConnector::builder();
                if verify_mode == TlsVerifyMode::None {
                    builder.danger_accept_invalid_certs(true);
                    builder.danger_accept_invalid_hostnames(true);
                }
                let native_connector = builder
                    .build()
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                let connector = TlsConnector::from(native_connector);
                let domain = context.domain.unwrap_or_else(|| self.config.host.clone());
                let tls_stream = connector
                    .connect(&domain, stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                let (read, write) = tokio::io::split(tls_stream);
                Ok((ReadHalf::Tls(read), WriteHalf::Tls(write)))
            }
        }
    }

    async fn read_loop(&self, mut read_half: ReadHalf) {
        let mut buf = vec![0u8; self.config.buffer_size.max(2048)];
        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            trace!("stream socket read EOF");
                            break;
                        }
                        Ok(n) => {
                            self.core.process(Bytes::copy_from_slice(&buf[..n])).await;
                        }
                        Err(err) => {
                            trace!(error = %err, "stream socket read error");
                            break;
                        }
                    }
                }
                _ = self.disconnect_signal.notified() => {
                    trace!("stream socket disconnect requested, closing read half");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StreamSocketTransport {
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
        *self.writer.lock().await = None;
        self.disconnect_signal.notify_waiters();
        self.core.report_disconnected().await;
    }

    async fn disconnect(&self) {
        *self.writer.lock().await = None;
        self.disconnect_signal.notify_waiters();
    }

    async fn send(&self, bytes: Bytes) -> usize {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => match writer.write_all_flushed(&bytes).await {
                Ok(()) => bytes.len(),
                Err(err) => {
                    warn!(error = %err, "stream socket write failed");
                    0
                }
            },
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
