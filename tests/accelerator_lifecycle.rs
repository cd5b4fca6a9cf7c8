//! Accelerator lifecycle, delegate callbacks and shutdown behaviour

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ssr_accelerator::{
    decode_header, Accelerator, AcceleratorDelegate, AcceleratorStatus, CipherEngine,
    CipherMethod, SessionConfig, SsrError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PASSWORD: &str = "lifecycle";

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
        self.received.fetch_add(received_delta, Ordering::SeqCst);
        self.sent.fetch_add(sent_delta, Ordering::SeqCst);
    }
}

/// Minimal plain-obfs SSR echo server
async fn spawn_echo_relay() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut encryptor, mut decryptor) =
                    CipherEngine::new(CipherMethod::Aes256Cfb, PASSWORD).unwrap().split();
                let mut buf = vec![0u8; 8192];
                let mut plain = Vec::new();
                let mut header_done = false;
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    plain.extend(decryptor.decrypt(&buf[..n]).unwrap());
                    if !header_done {
                        match decode_header(&plain) {
                            Ok((_, used)) => {
                                plain.drain(..used);
                                header_done = true;
                            }
                            Err(_) => continue,
                        }
                    }
                    if !plain.is_empty() {
                        let wire = encryptor.encrypt(&plain).unwrap();
                        plain.clear();
                        if stream.write_all(&wire).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    port
}

fn config(relay_port: u16) -> SessionConfig {
    let mut config = SessionConfig::new("127.0.0.1", relay_port, PASSWORD)
        .with_method(CipherMethod::Aes256Cfb)
        .with_local("127.0.0.1", 0);
    config.traffic_interval = Duration::from_millis(20);
    config
}

async fn connect_through(accel: &Accelerator) -> TcpStream {
    let local = accel.local_addr().expect("running accelerator has an address");
    let mut client = TcpStream::connect(local).await.unwrap();
    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await.unwrap();
    client
        .write_all(&[5, 1, 0, 1, 93, 184, 216, 34, 0, 80])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0);
    client
}

#[tokio::test]
async fn test_traffic_deltas_reach_delegate() {
    let relay_port = spawn_echo_relay().await;
    let accel = Accelerator::new();
    let recorder = Arc::new(Recorder::default());
    accel.set_delegate(recorder.clone());
    accel.configure(config(relay_port)).unwrap();
    accel.start().await.unwrap();

    let mut client = connect_through(&accel).await;
    client.write_all(&[7u8; 3000]).await.unwrap();
    let mut echoed = vec![0u8; 3000];
    client.read_exact(&mut echoed).await.unwrap();
    assert!(echoed.iter().all(|b| *b == 7));

    drop(client);
    accel.stop().await;

    // the final delta is flushed on stop
    assert_eq!(recorder.sent.load(Ordering::SeqCst), 3000);
    assert_eq!(recorder.received.load(Ordering::SeqCst), 3000);
    assert_eq!(accel.traffic().sent_bytes, 3000);

    let statuses = recorder.statuses.lock().unwrap().clone();
    assert_eq!(statuses.first(), Some(&AcceleratorStatus::Connecting));
    assert_eq!(statuses.last(), Some(&AcceleratorStatus::Disconnected));
}

#[tokio::test]
async fn test_stop_closes_active_sessions() {
    let relay_port = spawn_echo_relay().await;
    let accel = Accelerator::new();
    accel.configure(config(relay_port)).unwrap();
    accel.start().await.unwrap();

    let mut client = connect_through(&accel).await;
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(accel.active_sessions().await, 1);

    accel.stop().await;
    assert_eq!(accel.active_sessions().await, 0);

    let mut buf = [0u8; 4];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("client leg closed by stop")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_restart_after_stop_resets_counters() {
    let relay_port = spawn_echo_relay().await;
    let accel = Accelerator::new();
    accel.configure(config(relay_port)).unwrap();

    accel.start().await.unwrap();
    let mut client = connect_through(&accel).await;
    client.write_all(b"abc").await.unwrap();
    let mut echoed = [0u8; 3];
    client.read_exact(&mut echoed).await.unwrap();
    drop(client);
    accel.stop().await;
    assert_eq!(accel.traffic().sent_bytes, 3);

    accel.start().await.unwrap();
    assert_eq!(accel.status(), AcceleratorStatus::Connected);
    assert_eq!(accel.traffic().sent_bytes, 0);
    accel.stop().await;
}

#[tokio::test]
async fn test_lifecycle_misuse_returns_errors() {
    let accel = Accelerator::new();

    // stop while unconfigured is a no-op
    accel.stop().await;
    assert_eq!(accel.status(), AcceleratorStatus::Disconnected);

    assert!(matches!(accel.start().await, Err(SsrError::ConfigurationError(_))));
    assert!(matches!(
        accel.configure(SessionConfig::new("relay", 443, "pw").with_method(CipherMethod::Rc4Md5)),
        Err(SsrError::ConfigurationError(_))
    ));

    accel.configure(config(9)).unwrap();
    accel.start().await.unwrap();
    assert_eq!(accel.start().await, Err(SsrError::AlreadyRunning));
    assert_eq!(accel.configure(config(9)), Err(SsrError::AlreadyRunning));

    // clones share the instance
    let other = accel.clone();
    other.stop().await;
    assert_eq!(accel.status(), AcceleratorStatus::Disconnected);
}
