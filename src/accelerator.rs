//! Accelerator facade
//!
//! The host constructs one [`Accelerator`] and passes it around by handle;
//! clones share the same instance. Lifecycle:
//!
//! ```text
//! Disconnected --start--> Connecting --bound--> Connected
//!      ^                       |                    |
//!      |                     error                 stop
//!      |                       v                    v
//!      +------------------- Error(..)         Disconnecting --> Disconnected
//! ```

use crate::config::SessionConfig;
use crate::pool::ConnectionPool;
use crate::relay::LocalServer;
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::{Result, SsrError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Externally visible accelerator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceleratorStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error(String),
}

impl AcceleratorStatus {
    /// Whether a listener may currently exist
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AcceleratorStatus::Connecting
                | AcceleratorStatus::Connected
                | AcceleratorStatus::Disconnecting
        )
    }

    /// Stable numeric form for the C ABI
    pub fn code(&self) -> i32 {
        match self {
            AcceleratorStatus::Disconnected => 0,
            AcceleratorStatus::Connecting => 1,
            AcceleratorStatus::Connected => 2,
            AcceleratorStatus::Disconnecting => 3,
            AcceleratorStatus::Error(_) => -1,
        }
    }
}

impl fmt::Display for AcceleratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorStatus::Disconnected => write!(f, "disconnected"),
            AcceleratorStatus::Connecting => write!(f, "connecting"),
            AcceleratorStatus::Connected => write!(f, "connected"),
            AcceleratorStatus::Disconnecting => write!(f, "disconnecting"),
            AcceleratorStatus::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Receives status transitions and periodic traffic deltas
///
/// Callbacks run on runtime worker threads and must not block.
pub trait AcceleratorDelegate: Send + Sync {
    fn status_changed(&self, _status: &AcceleratorStatus) {}

    fn traffic_updated(&self, _received_delta: u64, _sent_delta: u64) {}
}

type DelegateSlot = Arc<Mutex<Option<Arc<dyn AcceleratorDelegate>>>>;

fn current_delegate(slot: &DelegateSlot) -> Option<Arc<dyn AcceleratorDelegate>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
}

struct State {
    config: Option<SessionConfig>,
    status: AcceleratorStatus,
    local_addr: Option<SocketAddr>,
}

struct Running {
    server: LocalServer,
    ticker_cancel: CancellationToken,
    ticker: JoinHandle<()>,
}

struct Inner {
    state: Mutex<State>,
    /// Serializes start/stop/reload
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    stats: Arc<TrafficStats>,
    delegate: DelegateSlot,
}

/// Public lifecycle handle over the local proxy
#[derive(Clone)]
pub struct Accelerator {
    inner: Arc<Inner>,
}

impl Default for Accelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accelerator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    config: None,
                    status: AcceleratorStatus::Disconnected,
                    local_addr: None,
                }),
                lifecycle: tokio::sync::Mutex::new(None),
                stats: Arc::new(TrafficStats::new()),
                delegate: Arc::new(Mutex::new(None)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: AcceleratorStatus) {
        {
            let mut state = self.state();
            if state.status == status {
                return;
            }
            log::info!("[ACCEL] Status: {} -> {}", state.status, status);
            state.status = status.clone();
        }
        if let Some(delegate) = current_delegate(&self.inner.delegate) {
            delegate.status_changed(&status);
        }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn AcceleratorDelegate>) {
        *self
            .inner
            .delegate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(delegate);
    }

    pub fn clear_delegate(&self) {
        *self.inner.delegate.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn status(&self) -> AcceleratorStatus {
        self.state().status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().status.is_active()
    }

    pub fn config(&self) -> Option<SessionConfig> {
        self.state().config.clone()
    }

    /// Address the SOCKS5 listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local_addr
    }

    /// Counters since the last start
    pub fn traffic(&self) -> TrafficSnapshot {
        self.inner.stats.snapshot()
    }

    /// Install a configuration; only allowed while stopped
    pub fn configure(&self, config: SessionConfig) -> Result<()> {
        let mut state = self.state();
        if state.status.is_active() {
            return Err(SsrError::AlreadyRunning);
        }
        config.validate()?;
        log::info!(
            "[ACCEL] Configured {}:{} ({}, {})",
            config.server_address,
            config.server_port,
            config.method,
            config.obfs
        );
        state.config = Some(config);
        Ok(())
    }

    /// Bind the listener and start relaying
    pub async fn start(&self) -> Result<()> {
        let mut running = self.inner.lifecycle.lock().await;
        if running.is_some() {
            return Err(SsrError::AlreadyRunning);
        }

        let config = self
            .config()
            .ok_or_else(|| SsrError::ConfigurationError("accelerator is not configured".into()))?;
        config.validate()?;

        self.set_status(AcceleratorStatus::Connecting);
        self.inner.stats.reset();

        let pool = Arc::new(ConnectionPool::from_config(&config));
        let interval = config.traffic_interval;
        let stats = Arc::clone(&self.inner.stats);
        let server = match LocalServer::bind(Arc::new(config), pool, stats).await {
            Ok(server) => server,
            Err(e) => {
                log::error!("[ACCEL] Start failed: {}", e);
                self.set_status(AcceleratorStatus::Error(e.to_string()));
                return Err(e);
            }
        };

        let ticker_cancel = CancellationToken::new();
        let ticker = tokio::spawn(traffic_ticker(
            Arc::clone(&self.inner.stats),
            Arc::clone(&self.inner.delegate),
            interval,
            ticker_cancel.clone(),
        ));

        self.state().local_addr = Some(server.local_addr());
        *running = Some(Running {
            server,
            ticker_cancel,
            ticker,
        });
        self.set_status(AcceleratorStatus::Connected);
        Ok(())
    }

    /// Stop relaying; a no-op when already stopped
    pub async fn stop(&self) {
        let mut running = self.inner.lifecycle.lock().await;
        let Some(current) = running.take() else {
            return;
        };

        self.set_status(AcceleratorStatus::Disconnecting);
        current.server.shutdown().await;

        current.ticker_cancel.cancel();
        if let Err(e) = current.ticker.await {
            log::warn!("[ACCEL] Traffic timer ended abnormally: {}", e);
        }

        self.state().local_addr = None;
        self.set_status(AcceleratorStatus::Disconnected);
    }

    /// Stop, install `config`, start again
    pub async fn reload(&self, config: SessionConfig) -> Result<()> {
        self.stop().await;
        if let Err(e) = self.configure(config) {
            self.set_status(AcceleratorStatus::Error(e.to_string()));
            return Err(e);
        }
        self.start().await
    }

    /// Sessions currently relaying, 0 when stopped
    pub async fn active_sessions(&self) -> usize {
        self.inner
            .lifecycle
            .lock()
            .await
            .as_ref()
            .map_or(0, |running| running.server.active_sessions())
    }
}

/// Report counter growth every `interval`, plus once more on cancellation
async fn traffic_ticker(
    stats: Arc<TrafficStats>,
    delegate: DelegateSlot,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = stats.snapshot();

    let mut report = |last: &mut TrafficSnapshot| {
        let now = stats.snapshot();
        let delta = now.delta_since(last);
        *last = now;
        if delta.is_zero() {
            return;
        }
        log::trace!(
            "[ACCEL] Traffic +{} received, +{} sent",
            delta.received_bytes,
            delta.sent_bytes
        );
        if let Some(delegate) = current_delegate(&delegate) {
            delegate.traffic_updated(delta.received_bytes, delta.sent_bytes);
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                report(&mut last);
                break;
            }
            _ = ticker.tick() => report(&mut last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<AcceleratorStatus>>,
        received: AtomicU64,
        sent: AtomicU64,
    }

    impl AcceleratorDelegate for Recorder {
        fn status_changed(&self, status: &AcceleratorStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }

        fn traffic_updated(&self, received_delta: u64, sent_delta: u64) {
            self.received.fetch_add(received_delta, Ordering::Relaxed);
            self.sent.fetch_add(sent_delta, Ordering::Relaxed);
        }
    }

    fn local_config() -> SessionConfig {
        SessionConfig::new("127.0.0.1", 9, "secret").with_local("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_start_requires_configuration() {
        let accel = Accelerator::new();
        assert!(matches!(
            accel.start().await,
            Err(SsrError::ConfigurationError(_))
        ));
        assert_eq!(accel.status(), AcceleratorStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let accel = Accelerator::new();
        let recorder = Arc::new(Recorder::default());
        accel.set_delegate(recorder.clone());

        accel.configure(local_config()).unwrap();
        accel.start().await.unwrap();
        assert_eq!(accel.status(), AcceleratorStatus::Connected);
        assert!(accel.local_addr().is_some());

        assert_eq!(accel.start().await, Err(SsrError::AlreadyRunning));
        assert_eq!(accel.configure(local_config()), Err(SsrError::AlreadyRunning));

        accel.stop().await;
        assert_eq!(accel.status(), AcceleratorStatus::Disconnected);
        assert!(accel.local_addr().is_none());

        // idempotent
        accel.stop().await;

        assert_eq!(
            *recorder.statuses.lock().unwrap(),
            vec![
                AcceleratorStatus::Connecting,
                AcceleratorStatus::Connected,
                AcceleratorStatus::Disconnecting,
                AcceleratorStatus::Disconnected,
            ]
        );

        // restart after a clean stop
        accel.start().await.unwrap();
        accel.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_sets_error() {
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let accel = Accelerator::new();
        accel
            .configure(SessionConfig::new("127.0.0.1", 9, "secret").with_local("127.0.0.1", port))
            .unwrap();
        assert!(matches!(accel.start().await, Err(SsrError::OperationFailed(_))));
        assert!(matches!(accel.status(), AcceleratorStatus::Error(_)));

        // configuration can be replaced after an error
        accel.configure(local_config()).unwrap();
        accel.start().await.unwrap();
        accel.stop().await;
    }

    #[tokio::test]
    async fn test_reload_rebinds() {
        let accel = Accelerator::new();
        accel.configure(local_config()).unwrap();
        accel.start().await.unwrap();

        accel.reload(local_config().with_remarks("second")).await.unwrap();
        assert_eq!(accel.status(), AcceleratorStatus::Connected);
        assert_eq!(accel.config().unwrap().remarks.as_deref(), Some("second"));

        let bad = SessionConfig::new("127.0.0.1", 9, "");
        assert!(accel.reload(bad).await.is_err());
        assert!(matches!(accel.status(), AcceleratorStatus::Error(_)));
        assert_eq!(accel.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_traffic_ticker_reports_deltas() {
        let stats = Arc::new(TrafficStats::new());
        let recorder = Arc::new(Recorder::default());
        let delegate: Arc<dyn AcceleratorDelegate> = recorder.clone();
        let slot: DelegateSlot = Arc::new(Mutex::new(Some(delegate)));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(traffic_ticker(
            Arc::clone(&stats),
            slot,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        stats.add_sent(100);
        stats.add_received(7);
        tokio::time::sleep(Duration::from_millis(40)).await;
        stats.add_sent(5);

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(recorder.sent.load(Ordering::Relaxed), 105);
        assert_eq!(recorder.received.load(Ordering::Relaxed), 7);
    }
}
