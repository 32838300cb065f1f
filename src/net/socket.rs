//! Unified socket endpoint
//!
//! Wraps a TCP stream, a Unix domain stream, or an anonymous pipe pair
//! behind one buffered read/write surface:
//!
//! - [`Socket::spool`] makes a single non-blocking pass: one write attempt
//!   from the send queue, one read attempt into the receive [`Buffer`].
//! - [`Socket::flush`] and [`Socket::send_now`] await until the bytes are on
//!   the wire (or the peer is gone).
//!
//! Would-block conditions are never errors. A broken pipe closes the socket
//! silently; any other I/O failure sets the error flag, records the message,
//! and closes.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use super::buffer::{Buffer, BLOCK_SIZE};
use crate::error::Result;

/// Largest single write issued by [`Socket::send_now`].
const SEND_CHUNK: usize = 51200;

/// Receive-buffer block count above which `spool` stops reading.
const SPOOL_BACKLOG_LIMIT: usize = 10000;

enum Backend {
    Tcp(TcpStream),
    Unix(UnixStream),
    Pipe { tx: pipe::Sender, rx: pipe::Receiver },
}

/// A unified, buffered socket endpoint.
pub struct Socket {
    backend: Option<Backend>,
    recv: Buffer,
    send_queue: VecDeque<Bytes>,
    up: u64,
    down: u64,
    error: bool,
    remotehost: String,
}

impl Socket {
    fn from_backend(backend: Backend, remotehost: String) -> Self {
        Self {
            backend: Some(backend),
            recv: Buffer::new(),
            send_queue: VecDeque::new(),
            up: 0,
            down: 0,
            error: false,
            remotehost,
        }
    }

    /// Connect over TCP.
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::from_backend(Backend::Tcp(stream), host.to_string()))
    }

    /// Wrap an already connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let host = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        Self::from_backend(Backend::Tcp(stream), host)
    }

    /// Connect to a Unix domain socket path.
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        let host = path.as_ref().display().to_string();
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_backend(Backend::Unix(stream), host))
    }

    /// Wrap an already connected Unix stream.
    pub fn from_unix(stream: UnixStream) -> Self {
        Self::from_backend(Backend::Unix(stream), String::new())
    }

    /// Wrap an anonymous pipe pair (write end, read end).
    pub fn from_pipe(tx: pipe::Sender, rx: pipe::Receiver) -> Self {
        Self::from_backend(Backend::Pipe { tx, rx }, String::new())
    }

    /// Create two connected sockets, useful for in-process plumbing.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_unix(a), Self::from_unix(b)))
    }

    /// True while the underlying descriptor is open.
    pub fn connected(&self) -> bool {
        self.backend.is_some()
    }

    /// True if a hard I/O error was recorded.
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Remote host, or the error string after an I/O failure.
    pub fn remotehost(&self) -> &str {
        &self.remotehost
    }

    /// Total bytes written to the peer.
    pub fn data_up(&self) -> u64 {
        self.up
    }

    /// Total bytes read from the peer.
    pub fn data_down(&self) -> u64 {
        self.down
    }

    /// The receive buffer.
    pub fn received(&mut self) -> &mut Buffer {
        &mut self.recv
    }

    /// Close the socket. Idempotent; pending queued data is dropped.
    pub fn close(&mut self) {
        if self.backend.take().is_some() {
            tracing::debug!(host = %self.remotehost, up = self.up, down = self.down, "socket closed");
        }
    }

    fn fail(&mut self, err: &io::Error) {
        if err.kind() != io::ErrorKind::BrokenPipe {
            self.error = true;
            self.remotehost = err.to_string();
            tracing::debug!(error = %err, "socket error");
        }
        self.close();
    }

    /// One non-blocking write attempt; returns bytes written.
    fn try_write_once(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let Some(backend) = self.backend.as_mut() else {
            return 0;
        };
        let res = match backend {
            Backend::Tcp(s) => s.try_write(data),
            Backend::Unix(s) => s.try_write(data),
            Backend::Pipe { tx, .. } => tx.try_write(data),
        };
        match res {
            Ok(0) => {
                self.close();
                0
            }
            Ok(n) => {
                self.up += n as u64;
                n
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                self.fail(&e);
                0
            }
        }
    }

    /// One non-blocking read attempt into the receive buffer.
    fn try_read_once(&mut self) -> bool {
        let Some(backend) = self.backend.as_mut() else {
            return false;
        };
        let mut chunk = [0u8; BLOCK_SIZE];
        let res = match backend {
            Backend::Tcp(s) => s.try_read(&mut chunk),
            Backend::Unix(s) => s.try_read(&mut chunk),
            Backend::Pipe { rx, .. } => rx.try_read(&mut chunk),
        };
        match res {
            Ok(0) => {
                // orderly shutdown by the peer
                self.close();
                false
            }
            Ok(n) => {
                self.down += n as u64;
                self.recv.append(&chunk[..n]);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    /// Drain as much of the send queue as the kernel will take right now.
    fn pump_send_queue(&mut self) {
        while let Some(front) = self.send_queue.front().cloned() {
            let written = self.try_write_once(&front);
            if written == 0 {
                break;
            }
            if written < front.len() {
                self.send_queue[0] = front.slice(written..);
                break;
            }
            self.send_queue.pop_front();
        }
    }

    /// Single non-blocking spool pass: write what can be written, read what
    /// can be read. Returns true if any new data was received.
    pub fn spool(&mut self) -> bool {
        if !self.send_queue.is_empty() {
            self.pump_send_queue();
        }
        if self.recv.size() > SPOOL_BACKLOG_LIMIT {
            return true;
        }
        self.try_read_once()
    }

    /// Queue data for sending, writing as much as possible immediately.
    pub fn send(&mut self, data: &[u8]) {
        self.pump_send_queue();
        if !self.send_queue.is_empty() {
            self.send_queue.push_back(Bytes::copy_from_slice(data));
            return;
        }
        let written = self.try_write_once(data);
        if written < data.len() {
            self.send_queue
                .push_back(Bytes::copy_from_slice(&data[written..]));
        }
    }

    async fn write_all_chunked(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() && self.backend.is_some() {
            let end = (offset + SEND_CHUNK).min(data.len());
            let res = match self.backend.as_mut().unwrap() {
                Backend::Tcp(s) => s.write_all(&data[offset..end]).await,
                Backend::Unix(s) => s.write_all(&data[offset..end]).await,
                Backend::Pipe { tx, .. } => tx.write_all(&data[offset..end]).await,
            };
            match res {
                Ok(()) => {
                    self.up += (end - offset) as u64;
                    offset = end;
                }
                Err(e) => {
                    self.fail(&e);
                    return;
                }
            }
        }
    }

    /// Block until the send queue has drained or the peer is gone.
    /// Returns true if new data was received by the trailing read pass.
    pub async fn flush(&mut self) -> bool {
        while let Some(front) = self.send_queue.pop_front() {
            if !self.connected() {
                break;
            }
            self.write_all_chunked(&front).await;
        }
        self.try_read_once()
    }

    /// Send exactly `data`, blocking as needed. The queued backlog is sent
    /// first so ordering is preserved.
    pub async fn send_now(&mut self, data: &[u8]) {
        while let Some(front) = self.send_queue.pop_front() {
            if !self.connected() {
                return;
            }
            self.write_all_chunked(&front).await;
        }
        self.write_all_chunked(data).await;
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("connected", &self.connected())
            .field("up", &self.up)
            .field("down", &self.down)
            .field("error", &self.error)
            .finish()
    }
}

enum ListenBackend {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A listening endpoint, TCP (IPv6-preferred) or Unix.
pub struct Listener {
    backend: ListenBackend,
}

impl Listener {
    /// Bind a TCP listener, attempting IPv6 first and falling back to IPv4.
    pub async fn bind_tcp(host: &str, port: u16) -> Result<Self> {
        let v6_host = if host.is_empty() || host == "0.0.0.0" {
            "::".to_string()
        } else {
            host.to_string()
        };
        match TcpListener::bind((v6_host.as_str(), port)).await {
            Ok(listener) => {
                tracing::info!(host = %v6_host, port, "listening (IPv6)");
                Ok(Self {
                    backend: ListenBackend::Tcp(listener),
                })
            }
            Err(e) => {
                tracing::debug!(error = %e, "IPv6 bind failed, trying IPv4");
                let v4_host = if host.is_empty() { "0.0.0.0" } else { host };
                let listener = TcpListener::bind((v4_host, port)).await?;
                tracing::info!(host = %v4_host, port, "listening (IPv4)");
                Ok(Self {
                    backend: ListenBackend::Tcp(listener),
                })
            }
        }
    }

    /// Bind a Unix domain listener at the given path.
    pub fn bind_unix(path: impl AsRef<Path>) -> Result<Self> {
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            backend: ListenBackend::Unix(listener),
        })
    }

    /// Local TCP address, if TCP-backed.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.backend {
            ListenBackend::Tcp(l) => l.local_addr().ok(),
            ListenBackend::Unix(_) => None,
        }
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<Socket> {
        match &self.backend {
            ListenBackend::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                tracing::debug!(peer = %peer, "accepted connection");
                Ok(Socket::from_tcp(stream))
            }
            ListenBackend::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Socket::from_unix(stream))
            }
        }
    }
}
