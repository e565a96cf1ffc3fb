//! Server facade and HTTP generations.
//!
//! A [`Server`] owns the configuration and the listening socket for the
//! lifetime of the process. Each [`Generation`] serves an [`axum::Router`]
//! on its own duplicate of that socket and can be stopped gracefully.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::lifecycle::{self, Lifecycle, LifecycleOutcome};
use crate::listener::{self, ListenerHandle};
use crate::shutdown::GracefulShutdown;
use crate::succession::{ExecSpawner, Spawner, Succession};
use crate::{Config, Error, ShutdownError};

/// A succession-capable server.
pub struct Server {
    config: Config,
    listener: Arc<ListenerHandle>,
    spawner: Arc<dyn Spawner>,
}

impl Server {
    /// Validate `config` and acquire the listening socket.
    ///
    /// The socket is imported from a parent process handing off to us when
    /// one answers on the control channel, otherwise a new one is bound.
    pub async fn bind(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let spawner = ExecSpawner::for_config(&config)?;
        let listener = listener::acquire(&config.addr, &config.sock_file).await?;

        Ok(Self {
            config,
            listener: Arc::new(listener),
            spawner: Arc::new(spawner),
        })
    }

    /// Replace the spawner used for succession.
    pub fn with_spawner(mut self, spawner: impl Spawner + 'static) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    /// Descriptor name of the listening socket, `tcp:<local address>`.
    pub fn listener_name(&self) -> &str {
        self.listener.name()
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start serving `router` in a new generation.
    pub fn start(&self, router: Router) -> Result<Generation, Error> {
        Ok(Generation::start(&self.listener, router)?)
    }

    /// The lifecycle state machine for this server.
    pub fn lifecycle(&self) -> Lifecycle {
        let succession = Succession::new(
            self.config.sock_file.clone(),
            Arc::clone(&self.listener),
            Arc::clone(&self.spawner),
        );
        Lifecycle::new(succession, self.config.shutdown_timeout)
    }

    /// Serve `router` until a succession completes or a termination signal
    /// arrives, then drain and return.
    pub async fn run(self, router: Router) -> Result<LifecycleOutcome, Error> {
        let signals =
            lifecycle::signal_queue(self.config.signal_buffer_size).map_err(Error::Signal)?;
        let generation = self.start(router)?;

        let outcome = self.lifecycle().run(signals, generation).await?;
        info!(outcome = ?outcome, "Exiting");
        Ok(outcome)
    }
}

/// One running instance of the HTTP server.
pub struct Generation {
    local_addr: SocketAddr,
    shutdown: Arc<GracefulShutdown>,
    task: JoinHandle<()>,
}

impl Generation {
    /// Serve `router` on a duplicate of `listener`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(listener: &ListenerHandle, router: Router) -> io::Result<Self> {
        let listener = listener.to_tokio()?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(GracefulShutdown::new());

        let task = tokio::spawn(serve(listener, router, Arc::clone(&shutdown)).in_current_span());

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently open on this generation.
    pub fn active_connections(&self) -> usize {
        self.shutdown.active_connections()
    }

    /// Stop accepting and wait up to `timeout` for open connections to
    /// finish. Connections still open afterwards are closed.
    pub async fn stop(self, timeout: Duration) -> Result<(), ShutdownError> {
        debug!(addr = %self.local_addr, "Server shutting down");

        let result = self.shutdown.shutdown(timeout).await;
        self.task.await?;

        match &result {
            Ok(()) => debug!("Server shut down"),
            Err(e) => debug!(error = %e, "Server shut down"),
        }
        result
    }
}

async fn serve(listener: tokio::net::TcpListener, router: Router, shutdown: Arc<GracefulShutdown>) {
    let builder = Builder::new(TokioExecutor::new());
    let stop = shutdown.stop_token();
    let addr = listener.local_addr().ok();

    info!(addr = ?addr, "HTTP server started");

    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let guard = shutdown.connection_guard();
        let service = TowerToHyperService::new(router.clone());
        let builder = builder.clone();
        let stop = stop.clone();
        let force = shutdown.force_token();

        let connection = async move {
            let _guard = guard;
            let conn = builder.serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(%peer, error = %e, "Connection closed with error");
                    }
                    return;
                }
                _ = stop.cancelled() => {}
            }

            conn.as_mut().graceful_shutdown();
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(%peer, error = %e, "Connection closed with error while draining");
                    }
                }
                _ = force.cancelled() => {
                    debug!(%peer, "Connection force-closed at shutdown timeout");
                }
            }
        };
        tokio::spawn(connection.in_current_span());
    }

    info!(addr = ?addr, "HTTP server stopped accepting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn handle() -> ListenerHandle {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        ListenerHandle::from_std("127.0.0.1:0", listener).unwrap()
    }

    async fn get_root(addr: SocketAddr) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_generation_serves_router() {
        let listener = handle();
        let generation =
            Generation::start(&listener, Router::new().route("/", get(|| async { "hello" }))).unwrap();

        let response = get_root(generation.local_addr()).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello"));

        generation.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_outlives_generation() {
        let listener = handle();
        let router = Router::new().route("/", get(|| async { "again" }));

        let first = Generation::start(&listener, router.clone()).unwrap();
        first.stop(Duration::from_secs(1)).await.unwrap();

        let second = Generation::start(&listener, router).unwrap();
        assert!(get_root(second.local_addr()).await.ends_with("again"));
        second.stop(Duration::from_secs(1)).await.unwrap();
    }

    /// Records each event's message with the names of its enclosing spans.
    #[derive(Clone, Default)]
    struct SpanRecorder(Arc<std::sync::Mutex<Vec<(String, Vec<&'static str>)>>>);

    struct MessageVisitor(String);

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    impl<S> tracing_subscriber::Layer<S> for SpanRecorder
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            let spans = ctx
                .event_scope(event)
                .map(|scope| scope.from_root().map(|span| span.name()).collect())
                .unwrap_or_default();
            self.0.lock().unwrap().push((visitor.0, spans));
        }
    }

    #[tokio::test]
    async fn test_generation_logs_within_caller_span() {
        use tracing_subscriber::layer::SubscriberExt;

        let recorder = SpanRecorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        let _default = tracing::subscriber::set_default(subscriber);

        let listener = handle();
        let span = tracing::info_span!("server", pid = std::process::id());
        let generation = span
            .in_scope(|| Generation::start(&listener, Router::new().route("/", get(|| async { "hi" }))))
            .unwrap();
        assert!(get_root(generation.local_addr()).await.ends_with("hi"));
        generation.stop(Duration::from_secs(1)).await.unwrap();

        let events = recorder.0.lock().unwrap();
        let (_, spans) = events
            .iter()
            .find(|(message, _)| message == "HTTP server started")
            .expect("serve task logged nothing");
        assert_eq!(spans, &vec!["server"]);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = Config {
            addr: String::new(),
            ..Config::default()
        };
        assert!(matches!(
            Server::bind(config).await,
            Err(Error::Config(crate::ConfigError::MissingAddr))
        ));
    }
}
