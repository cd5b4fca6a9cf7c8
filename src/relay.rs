//! Relay engine: the local SOCKS5 server
//!
//! Each accepted client runs as one [`ProxySession`]:
//!
//! ```text
//! Handshaking -> AwaitingRequest -> AwaitingUpstream -> Relaying -> Closed
//! ```
//!
//! While relaying, the upload loop (client -> encrypt -> obfuscate -> relay)
//! and the download loop (relay -> deobfuscate -> decrypt -> client) race in
//! one `select!` together with the session's cancellation token. Whichever
//! finishes first ends the session, so neither leg can outlive the other.

use crate::config::SessionConfig;
use crate::crypto::{CipherEngine, StreamDecryptor, StreamEncryptor};
use crate::header::encode_header;
use crate::obfs::{ObfsContext, Obfuscator};
use crate::pool::{Connection, ConnectionPool, Endpoint};
use crate::socks5::{self, ReplyCode, TargetAddress};
use crate::stats::TrafficStats;
use crate::{Result, SsrError};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-client progress, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    AwaitingRequest,
    AwaitingUpstream,
    Relaying,
    Closed(SessionOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    Error,
}

/// How the relay phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    /// Client finished sending
    ClientEof,
    /// Relay closed its side
    UpstreamEof,
    Cancelled,
}

struct SessionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    config: Arc<SessionConfig>,
    endpoint: Endpoint,
    pool: Arc<ConnectionPool>,
    stats: Arc<TrafficStats>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    sessions_cancel: CancellationToken,
    next_session: AtomicU64,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = self.sessions_cancel.child_token();
        let client = Connection::new(id, Endpoint::new(peer.ip().to_string(), peer.port()), stream);

        let session = ProxySession {
            id,
            client,
            upstream: None,
            state: SessionState::Handshaking,
            shared: Arc::clone(self),
            cancel: cancel.clone(),
        };

        // registry lock is held across spawn so the task's own removal
        // cannot run before the insert
        let mut sessions = self.sessions();
        let task = tokio::spawn(session.run());
        sessions.insert(id, SessionHandle { cancel, task });
    }
}

/// Accepts SOCKS5 clients and relays them to the configured SSR server
pub struct LocalServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_cancel: CancellationToken,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LocalServer {
    /// Bind the listener and start accepting
    pub async fn bind(
        config: Arc<SessionConfig>,
        pool: Arc<ConnectionPool>,
        stats: Arc<TrafficStats>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.local_address.as_str(), config.local_port))
            .await
            .map_err(|e| {
                SsrError::OperationFailed(format!(
                    "failed to bind {}:{}: {}",
                    config.local_address, config.local_port, e
                ))
            })?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            endpoint: Endpoint::new(config.server_address.clone(), config.server_port),
            config,
            pool,
            stats,
            sessions: Mutex::new(HashMap::new()),
            sessions_cancel: CancellationToken::new(),
            next_session: AtomicU64::new(1),
        });

        let accept_cancel = CancellationToken::new();
        let task = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&shared),
            accept_cancel.clone(),
        ));

        log::info!("[RELAY] SOCKS5 listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shared,
            accept_cancel,
            accept_task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("[RELAY] Accepted client {}", peer);
                        shared.spawn_session(stream, peer);
                    }
                    Err(e) => {
                        log::error!("[RELAY] Accept error: {}", e);
                        // back off on fd exhaustion instead of spinning
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
            }
        }
        log::info!("[RELAY] Listener stopped");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.sessions().len()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.shared.pool
    }

    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.shared.stats
    }

    /// Stop accepting, cancel every session, then drain the pool
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.accept_cancel.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                log::warn!("[RELAY] Accept task ended abnormally: {}", e);
            }
        }

        self.shared.sessions_cancel.cancel();
        let handles: Vec<(u64, SessionHandle)> = self.shared.sessions().drain().collect();
        let count = handles.len();
        let tasks = handles.into_iter().map(|(id, handle)| {
            handle.cancel.cancel();
            async move {
                if let Err(e) = handle.task.await {
                    log::warn!("[RELAY] Session {} ended abnormally: {}", id, e);
                }
            }
        });
        futures::future::join_all(tasks).await;
        if count > 0 {
            log::info!("[RELAY] Cancelled {} active sessions", count);
        }

        self.shared.pool.cleanup();
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        // stop every task even without an awaited shutdown
        self.accept_cancel.cancel();
        self.shared.sessions_cancel.cancel();
    }
}

/// One client paired with one upstream; the unit of cancellation
struct ProxySession {
    id: u64,
    client: Connection,
    upstream: Option<Connection>,
    state: SessionState,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ProxySession {
    fn transition(&mut self, next: SessionState) {
        log::trace!("[RELAY] Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    async fn unless_cancelled<T>(
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SsrError::OperationFailed("session cancelled".into())),
            result = fut => result,
        }
    }

    async fn run(mut self) {
        let outcome = match self.serve().await {
            Ok(end) => {
                log::debug!("[RELAY] Session {} ended: {:?}", self.id, end);
                SessionOutcome::Success
            }
            Err(e) if e.is_protocol_error() => {
                log::debug!("[RELAY] Session {} rejected: {}", self.id, e);
                SessionOutcome::Error
            }
            Err(e) => {
                log::warn!("[RELAY] Session {} failed: {}", self.id, e);
                SessionOutcome::Error
            }
        };

        // an upstream that carried this session's IV and header is spent;
        // only one that never saw session bytes may go back to the pool
        if let Some(upstream) = self.upstream.take() {
            if upstream.is_healthy() {
                self.shared.pool.release(upstream);
            } else {
                self.shared.pool.discard(upstream);
            }
        }
        if let Ok(stream) = self.client.stream_mut() {
            let _ = stream.shutdown().await;
        }
        self.client.close();
        self.transition(SessionState::Closed(outcome));

        self.shared.sessions().remove(&self.id);
    }

    /// Send the mapped reply, then hand the error back
    async fn reject(&mut self, err: SsrError) -> SsrError {
        let reply = ReplyCode::from_error(&err);
        self.reject_with(err, reply).await
    }

    async fn reject_with(&mut self, err: SsrError, reply: ReplyCode) -> SsrError {
        if let Ok(stream) = self.client.stream_mut() {
            if let Err(e) = socks5::send_response(stream, reply).await {
                log::trace!("[RELAY] Session {}: reply failed: {}", self.id, e);
            }
        }
        err
    }

    async fn serve(&mut self) -> Result<RelayEnd> {
        let cancel = self.cancel.clone();
        let config = Arc::clone(&self.shared.config);

        let greeting = socks5::read_handshake(self.client.stream_mut()?);
        Self::unless_cancelled(&cancel, greeting).await?;
        self.transition(SessionState::AwaitingRequest);

        let request = socks5::read_connect_request(self.client.stream_mut()?);
        let target = match Self::unless_cancelled(&cancel, request).await {
            Ok(target) => target,
            Err(SsrError::InvalidProtocol) => return Err(SsrError::InvalidProtocol),
            Err(e) => return Err(self.reject(e).await),
        };
        log::debug!("[RELAY] Session {}: CONNECT {}", self.id, target);

        let header = match encode_header(&target) {
            Ok(header) => header,
            Err(e) => return Err(self.reject(e).await),
        };
        let cipher = match CipherEngine::new(config.method, &config.password) {
            Ok(cipher) => cipher,
            Err(e) => return Err(self.reject(e).await),
        };

        self.transition(SessionState::AwaitingUpstream);
        let endpoint = self.shared.endpoint.clone();
        let pool = Arc::clone(&self.shared.pool);
        let acquired = Self::unless_cancelled(&cancel, async { Ok(pool.acquire(&endpoint).await) });
        let upstream = match acquired.await? {
            Ok(upstream) => upstream,
            Err(e) => {
                let reply = e.reply_code();
                return Err(self.reject_with(e.into(), reply).await);
            }
        };
        self.upstream = Some(upstream);

        let mut obfs = config.obfs.build(ObfsContext {
            host: config.server_address.clone(),
            port: config.server_port,
            param: config.obfs_param.clone(),
            key: cipher.key().to_vec(),
            iv_len: config.method.iv_len(),
            head_len: header.len(),
        });
        let (mut encryptor, decryptor) = cipher.split();

        if let Err(e) = self.send_header(&header, &mut encryptor, obfs.as_mut()).await {
            return Err(self.reject(e).await);
        }
        socks5::send_response(self.client.stream_mut()?, ReplyCode::Succeeded).await?;

        self.transition(SessionState::Relaying);
        self.relay(&target, encryptor, decryptor, obfs).await
    }

    async fn send_header(
        &mut self,
        header: &[u8],
        encryptor: &mut StreamEncryptor,
        obfs: &mut dyn Obfuscator,
    ) -> Result<()> {
        let first = obfs.obfuscate(&encryptor.encrypt(header)?)?;
        let upstream = self
            .upstream
            .as_mut()
            .ok_or_else(|| SsrError::OperationFailed("no upstream".into()))?;
        upstream.mark_unhealthy();
        upstream.stream_mut()?.write_all(&first).await?;
        log::trace!("[RELAY] Session {}: sent {} byte header chunk", self.id, first.len());
        Ok(())
    }

    async fn relay(
        &mut self,
        target: &TargetAddress,
        mut encryptor: StreamEncryptor,
        mut decryptor: StreamDecryptor,
        obfs: Box<dyn Obfuscator>,
    ) -> Result<RelayEnd> {
        let buffer_size = self.shared.config.read_buffer_size();
        let stats = Arc::clone(&self.shared.stats);
        let cancel = self.cancel.clone();
        let obfs = Mutex::new(obfs);
        let lock_obfs = || obfs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let upstream = self
            .upstream
            .as_mut()
            .ok_or_else(|| SsrError::OperationFailed("no upstream".into()))?;
        let (mut client_read, mut client_write) = self.client.stream_mut()?.split();
        let (mut upstream_read, mut upstream_write) = upstream.stream_mut()?.split();

        let upload = async {
            let mut buf = vec![0u8; buffer_size];
            loop {
                let n = client_read.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<_, SsrError>(RelayEnd::ClientEof);
                }
                stats.add_sent(n as u64);
                let ciphertext = encryptor.encrypt(&buf[..n])?;
                let wire = lock_obfs().obfuscate(&ciphertext)?;
                upstream_write.write_all(&wire).await?;
            }
        };

        let download = async {
            let mut buf = vec![0u8; buffer_size];
            loop {
                let n = upstream_read.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<_, SsrError>(RelayEnd::UpstreamEof);
                }
                let ciphertext = lock_obfs().deobfuscate(&buf[..n])?;
                let plaintext = decryptor.decrypt(&ciphertext)?;
                if !plaintext.is_empty() {
                    client_write.write_all(&plaintext).await?;
                    stats.add_received(plaintext.len() as u64);
                }
            }
        };

        let end = tokio::select! {
            _ = cancel.cancelled() => Ok(RelayEnd::Cancelled),
            result = upload => result,
            result = download => result,
        };

        match &end {
            Ok(how) => log::debug!("[RELAY] Session {} to {} finished: {:?}", self.id, target, how),
            Err(e) => log::debug!("[RELAY] Session {} to {} aborted: {}", self.id, target, e),
        }
        end
    }
}
