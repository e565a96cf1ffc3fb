//! Error types for process succession.

use std::io;

use thiserror::Error;

/// Invalid or missing configuration. Fatal before startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The control channel path is empty.
    #[error("socket file is required")]
    MissingSockFile,

    /// The bind address is empty.
    #[error("server address is required")]
    MissingAddr,

    /// The shutdown timeout is zero.
    #[error("shutdown timeout must be greater than 0")]
    ZeroShutdownTimeout,

    /// The signal queue has no capacity.
    #[error("signal buffer size must be at least 1")]
    ZeroSignalBufferSize,

    /// An environment variable could not be parsed.
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
    },

    /// The configuration file could not be read.
    #[error("unable to read config file: {0}")]
    Read(#[source] io::Error),

    /// The configuration file is not valid TOML for [`crate::Config`].
    #[error("unable to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure to import or create the listening socket. Fatal, aborts startup.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// No parent process is listening on the control channel.
    #[error("unable to dial control channel: {0}")]
    Connect(#[source] io::Error),

    /// The control channel exchange failed.
    #[error("control channel IO error: {0}")]
    Io(#[from] io::Error),

    /// The parent closed the control channel without answering.
    #[error("listener info not received from socket")]
    EmptyResponse,

    /// The parent answered with something that is not listener metadata.
    #[error("unable to decode listener metadata: {0}")]
    Decode(#[from] serde_json::Error),

    /// The parent offered a listener for a different address.
    #[error("unable to find listener for {expected} (parent offered {found})")]
    AddressMismatch {
        /// Address this process wants to serve
        expected: String,
        /// Address contained in the metadata
        found: String,
    },

    /// The promised descriptor is not an open socket in this process.
    #[error("inherited fd {fd} is not a valid socket")]
    InvalidDescriptor {
        /// Descriptor number from the metadata
        fd: i32,
    },

    /// The inherited descriptor is a socket, but not the one that was promised.
    #[error("inherited descriptor is {found}, expected {expected}")]
    DescriptorNameMismatch {
        /// Name promised in the metadata
        expected: String,
        /// Name of the socket actually found at the descriptor
        found: String,
    },

    /// Binding a fresh listening socket failed.
    #[error("unable to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Failure of a single succession attempt. The current generation keeps serving.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The control channel could not be bound.
    #[error("unable to start unix domain socket: {0}")]
    Bind(#[source] io::Error),

    /// Accepting the control channel connection failed.
    #[error("error accepting control channel connection: {0}")]
    Accept(#[source] io::Error),

    /// No replacement dialed the control channel in time.
    #[error("timeout occurred waiting for connection from child")]
    AcceptTimeout,

    /// Reading the request failed.
    #[error("unable to read data from socket: {0}")]
    Read(#[source] io::Error),

    /// The replacement sent something other than `get_listener`.
    #[error("unrecognized control command: {0:?}")]
    UnrecognizedCommand(String),

    /// The listening socket's descriptor could not be described.
    #[error("unable to describe listener descriptor: {0}")]
    Descriptor(#[source] io::Error),

    /// Listener metadata could not be serialized.
    #[error("unable to encode listener metadata: {0}")]
    Encode(#[from] serde_json::Error),

    /// Writing the response failed.
    #[error("unable to send listener over the unix domain socket: {0}")]
    Write(#[source] io::Error),

    /// The responder stopped without reporting an outcome.
    #[error("handoff responder exited without an outcome")]
    ResponderExited,
}

/// Replacement process creation failed. Logged; the attempt keeps waiting.
#[derive(Debug, Error)]
#[error("unable to spawn replacement process: {0}")]
pub struct SpawnError(#[from] pub io::Error);

/// Draining connections did not finish cleanly. Logged, never escalated.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Connections were still open when the timeout elapsed and were closed forcibly.
    #[error("shutdown timed out with {remaining} connection(s) still open")]
    Timeout {
        /// Connections force-closed
        remaining: usize,
    },

    /// The accept loop task failed.
    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Top-level error for the server facade.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listening socket acquisition error
    #[error("unable to create or import a listener: {0}")]
    Acquire(#[from] AcquireError),

    /// Generic IO error while starting a generation
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Signal handler registration failed
    #[error("unable to register signal handlers: {0}")]
    Signal(#[source] io::Error),

    /// Shutdown error surfaced at exit
    #[error("shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),
}
