//! Test utilities for succession scenarios.
//!
//! Provides a test configuration, spawners that stand in for the replacement
//! process, and a minimal HTTP client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use handoff::listener::descriptor_name;
use handoff::metadata::{ListenerMetadata, GET_LISTENER};
use handoff::{Config, LifecycleState, SpawnError, Spawner};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a tracing subscriber once so failing tests show the lifecycle logs.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("handoff=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Configuration bound to an ephemeral local port with a per-test control channel.
pub fn test_config(dir: &Path, shutdown_timeout: Duration, signal_buffer_size: usize) -> Config {
    Config {
        sock_file: dir.join("handoff.sock"),
        addr: "127.0.0.1:0".to_string(),
        shutdown_timeout,
        signal_buffer_size,
    }
}

/// A router answering `GET /` with `body`.
pub fn router(body: &'static str) -> Router {
    Router::new().route("/", get(move || async move { body }))
}

/// Plays the replacement process: records the inherited listener's name,
/// then dials the control channel and asks for the listener.
pub struct FakeChild {
    sock_file: PathBuf,
    inherited: Mutex<Vec<String>>,
    received: mpsc::UnboundedSender<ListenerMetadata>,
}

impl FakeChild {
    pub fn new(sock_file: PathBuf) -> (Self, mpsc::UnboundedReceiver<ListenerMetadata>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let child = Self {
            sock_file,
            inherited: Mutex::new(Vec::new()),
            received: tx,
        };
        (child, rx)
    }

    /// Names of the listeners handed to each spawn.
    pub fn inherited(&self) -> Vec<String> {
        self.inherited.lock().unwrap().clone()
    }
}

impl Spawner for FakeChild {
    fn spawn(&self, listener: BorrowedFd<'_>) -> Result<u32, SpawnError> {
        let dup = std::net::TcpListener::from(listener.try_clone_to_owned()?);
        self.inherited
            .lock()
            .unwrap()
            .push(descriptor_name(&dup.local_addr()?));

        let path = self.sock_file.clone();
        let received = self.received.clone();
        tokio::spawn(async move {
            let mut conn = UnixStream::connect(&path).await.unwrap();
            conn.write_all(GET_LISTENER).await.unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).await.unwrap();
            let _ = received.send(ListenerMetadata::decode(&buf).unwrap());
        });
        Ok(4242)
    }
}

/// A replacement that starts but never dials back.
#[derive(Default)]
pub struct SilentChild {
    pub spawned: std::sync::Arc<AtomicUsize>,
}

impl Spawner for SilentChild {
    fn spawn(&self, _listener: BorrowedFd<'_>) -> Result<u32, SpawnError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(4343)
    }
}

/// `GET path` with `Connection: close`, returning the raw response.
pub async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(DEFAULT_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    response
}

/// Wait until the lifecycle reaches `state`.
pub async fn wait_for_state(states: &mut watch::Receiver<LifecycleState>, state: LifecycleState) {
    timeout(DEFAULT_TIMEOUT, states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("lifecycle never reached {:?}", state))
        .unwrap();
}
