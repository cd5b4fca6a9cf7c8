//! Outbound connection pool
//!
//! Keeps a small number of idle relay connections per endpoint. A connection
//! only re-enters the pool through [`ConnectionPool::release`] while it is
//! healthy and has carried no session bytes; everything else is closed through
//! [`ConnectionPool::discard`].

use crate::config::SessionConfig;
use crate::socks5::ReplyCode;
use crate::{Result, SsrError};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Pool key: relay host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Active,
    Closed,
}

/// Owned handle over one TCP stream
///
/// Nothing is closed implicitly on the happy path: callers either release the
/// connection back to the pool or close it.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    state: ConnectionState,
    healthy: bool,
    idle_since: Instant,
}

impl Connection {
    pub fn new(id: u64, endpoint: Endpoint, stream: TcpStream) -> Self {
        Self {
            id,
            endpoint,
            stream: Some(stream),
            state: ConnectionState::Active,
            healthy: true,
            idle_since: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy && self.state != ConnectionState::Closed
    }

    /// Forbid pooling: the leg errored or already carried session bytes
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| SsrError::OperationFailed(format!("connection {} is closed", self.id)))
    }

    /// Check without blocking: a live idle socket has nothing to read
    pub fn is_alive(&self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        let mut peek = [0u8; 1];
        match stream.try_read(&mut peek) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            // EOF, stray bytes or a socket error all disqualify it
            _ => false,
        }
    }

    /// Close the stream; closing twice is a no-op
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.stream = None;
        self.state = ConnectionState::Closed;
        log::trace!("[POOL] Closed connection {} to {}", self.id, self.endpoint);
    }
}

/// Why dialling an endpoint failed
///
/// Keeps the io error kind so callers can pick a SOCKS5 reply before the
/// failure collapses into [`SsrError`].
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connect timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Io(#[from] io::Error),
}

impl DialError {
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            DialError::Timeout => ReplyCode::TTLExpired,
            DialError::Io(e) => ReplyCode::from_io_kind(e.kind()),
        }
    }
}

impl From<DialError> for SsrError {
    fn from(err: DialError) -> Self {
        match err {
            DialError::Timeout => SsrError::OperationTimeout,
            DialError::Io(e) => SsrError::from(e),
        }
    }
}

/// Bounded per-endpoint cache of idle upstream connections
pub struct ConnectionPool {
    idle: Mutex<HashMap<Endpoint, VecDeque<Connection>>>,
    idle_capacity: usize,
    idle_timeout: Duration,
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(idle_capacity: usize, idle_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            idle_capacity,
            idle_timeout,
            connect_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.pool_idle_capacity,
            config.pool_idle_timeout,
            config.connect_timeout,
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Endpoint, VecDeque<Connection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand out the newest live idle connection, or dial a new one
    pub async fn get_connection(&self, endpoint: &Endpoint) -> Result<Connection> {
        Ok(self.acquire(endpoint).await?)
    }

    /// Like [`get_connection`](Self::get_connection), keeping the dial failure detail
    pub async fn acquire(&self, endpoint: &Endpoint) -> std::result::Result<Connection, DialError> {
        if let Some(conn) = self.take_idle(endpoint) {
            log::debug!("[POOL] Reusing connection {} to {}", conn.id, endpoint);
            return Ok(conn);
        }
        self.connect(endpoint).await
    }

    fn take_idle(&self, endpoint: &Endpoint) -> Option<Connection> {
        let mut idle = self.lock();
        let queue = idle.get_mut(endpoint)?;

        while let Some(mut conn) = queue.pop_back() {
            if conn.idle_since.elapsed() > self.idle_timeout || !conn.is_alive() {
                log::trace!("[POOL] Evicting stale connection {} to {}", conn.id, endpoint);
                conn.close();
                continue;
            }
            conn.state = ConnectionState::Active;
            return Some(conn);
        }
        None
    }

    async fn connect(&self, endpoint: &Endpoint) -> std::result::Result<Connection, DialError> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| {
            log::warn!(
                "[POOL] Connect to {} timed out after {:?}",
                endpoint,
                self.connect_timeout
            );
            DialError::Timeout
        })?
        .map_err(|e| {
            log::debug!("[POOL] Connect to {} failed: {}", endpoint, e);
            DialError::Io(e)
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[POOL] set_nodelay failed: {}", e);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("[POOL] Opened connection {} to {}", id, endpoint);
        Ok(Connection::new(id, endpoint.clone(), stream))
    }

    /// Return a connection after a healthy session
    ///
    /// Returns whether it was pooled; otherwise it has been closed.
    pub fn release(&self, mut conn: Connection) -> bool {
        if !conn.is_healthy() || !conn.is_alive() {
            conn.close();
            return false;
        }

        let mut idle = self.lock();
        let queue = idle.entry(conn.endpoint.clone()).or_default();
        if queue.len() >= self.idle_capacity {
            drop(idle);
            log::trace!("[POOL] Idle capacity reached for {}", conn.endpoint);
            conn.close();
            return false;
        }

        conn.state = ConnectionState::Idle;
        conn.idle_since = Instant::now();
        log::trace!("[POOL] Released connection {} to {}", conn.id, conn.endpoint);
        queue.push_back(conn);
        true
    }

    /// Close a connection without pooling it
    pub fn discard(&self, mut conn: Connection) {
        conn.close();
    }

    /// Close every pooled connection; returns how many were dropped
    pub fn cleanup(&self) -> usize {
        let drained: Vec<Connection> = self.lock().drain().flat_map(|(_, queue)| queue).collect();
        let count = drained.len();
        for mut conn in drained {
            conn.close();
        }
        if count > 0 {
            log::info!("[POOL] Cleaned up {} idle connections", count);
        }
        count
    }

    pub fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.lock().get(endpoint).map_or(0, VecDeque::len)
    }

    pub fn total_idle(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    /// Connections dialled over the pool's lifetime
    pub fn total_created(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}
