//! Control channel responder.
//!
//! Runs on its own task for a single succession attempt: binds the control
//! channel, reports [`HandoffEvent::SocketOpened`], accepts exactly one
//! connection (bounded by [`ACCEPT_TIMEOUT`]), answers `get_listener` with
//! the listener metadata and reports [`HandoffEvent::ListenerSent`]. Any
//! failure is reported as [`HandoffEvent::Failed`]. The control channel
//! socket file is removed on every exit path.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::listener::ListenerHandle;
use crate::metadata::{ListenerMetadata, GET_LISTENER};
use crate::HandoffError;

/// How long the replacement process has to dial the control channel.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(4);

/// Receive buffer for the request command.
const MAX_COMMAND_LEN: usize = 512;

/// Progress of a succession attempt, reported in order.
#[derive(Debug)]
pub enum HandoffEvent {
    /// The control channel exists; a replacement can now dial it.
    SocketOpened,
    /// The listener metadata was written to the replacement.
    ListenerSent,
    /// The attempt was abandoned.
    Failed(HandoffError),
}

/// A bound control channel. Removes its socket file on drop.
struct ControlChannel {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlChannel {
    fn bind(path: &Path) -> io::Result<Self> {
        remove_stale_socket(path)?;
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    async fn accept(&self, timeout: Duration) -> Result<UnixStream, HandoffError> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((conn, _))) => Ok(conn),
            Ok(Err(e)) => {
                error!(error = %e, "Error occurred when accepting socket connection");
                Err(HandoffError::Accept(e))
            }
            Err(_) => {
                let err = HandoffError::AcceptTimeout;
                info!(sock_file = %self.path.display(), "{}", err);
                Err(err)
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(sock_file = %self.path.display(), error = %e, "Unable to remove control channel socket");
            }
        }
    }
}

/// Remove a socket file left behind by a previous attempt.
///
/// Anything at `path` that is not a socket is left alone and makes the bind fail.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(sock_file = %path.display(), "Removing stale control channel socket");
            std::fs::remove_file(path)
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Serve one succession attempt on `sock_file`, reporting progress on `events`.
pub async fn run(
    sock_file: PathBuf,
    listener: Arc<ListenerHandle>,
    events: mpsc::Sender<HandoffEvent>,
) {
    if let Err(e) = respond(&sock_file, &listener, &events).await {
        let _ = events.send(HandoffEvent::Failed(e)).await;
    }
}

async fn respond(
    sock_file: &Path,
    listener: &ListenerHandle,
    events: &mpsc::Sender<HandoffEvent>,
) -> Result<(), HandoffError> {
    let channel = ControlChannel::bind(sock_file).map_err(|e| {
        error!(sock_file = %sock_file.display(), error = %e, "Unable to start unix domain socket");
        HandoffError::Bind(e)
    })?;

    info!(sock_file = %sock_file.display(), "Control channel opened");
    if events.send(HandoffEvent::SocketOpened).await.is_err() {
        return Ok(());
    }

    let mut conn = channel.accept(ACCEPT_TIMEOUT).await?;

    let mut buf = [0u8; MAX_COMMAND_LEN];
    let n = conn.read(&mut buf).await.map_err(|e| {
        error!(error = %e, "Unable to read data from socket");
        HandoffError::Read(e)
    })?;
    if n == 0 {
        return Err(HandoffError::Read(io::ErrorKind::UnexpectedEof.into()));
    }

    let command = &buf[..n];
    if command != GET_LISTENER {
        let command = String::from_utf8_lossy(command).into_owned();
        warn!(command = %command, "Replacement sent an unrecognized command");
        return Err(HandoffError::UnrecognizedCommand(command));
    }

    debug!("Replacement requested listener information");
    send_listener(listener, &mut conn).await?;

    // The socket file is gone before anyone hears about the handoff.
    drop(conn);
    drop(channel);
    let _ = events.send(HandoffEvent::ListenerSent).await;
    Ok(())
}

async fn send_listener(listener: &ListenerHandle, conn: &mut UnixStream) -> Result<(), HandoffError> {
    let descriptor = listener.descriptor().map_err(HandoffError::Descriptor)?;
    let metadata = ListenerMetadata::inherited(listener.addr(), descriptor.name());
    let payload = metadata.encode()?;

    conn.write_all(&payload).await.map_err(|e| {
        error!(error = %e, "Unable to send listener over the unix domain socket");
        HandoffError::Write(e)
    })?;

    debug!(addr = %metadata.addr, fd = metadata.fd, name = %metadata.filename, "Sent listener metadata");
    Ok(())
}
