//! Succession: spawn a replacement process and hand it the listening socket.
//!
//! On a restart signal the orchestrator starts the control channel
//! [responder](crate::responder) and waits on its events:
//! - `SocketOpened`: spawn the replacement with the listener inherited at fd 3
//! - `ListenerSent`: the replacement has everything it needs, the current
//!   generation should shut down
//! - `Failed`: the attempt is abandoned, the current generation keeps serving

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, Instrument};

use crate::listener::ListenerHandle;
use crate::metadata::INHERITED_LISTENER_FD;
use crate::responder::{self, HandoffEvent};
use crate::{Config, HandoffError, SpawnError};

/// Creates the replacement process.
pub trait Spawner: Send + Sync {
    /// Start a replacement that inherits `listener` at [`INHERITED_LISTENER_FD`].
    ///
    /// Must not wait for the replacement to become ready. Returns its PID.
    fn spawn(&self, listener: BorrowedFd<'_>) -> Result<u32, SpawnError>;
}

impl<T: Spawner + ?Sized> Spawner for Arc<T> {
    fn spawn(&self, listener: BorrowedFd<'_>) -> Result<u32, SpawnError> {
        (**self).spawn(listener)
    }
}

/// Spawns a new instance of an executable.
///
/// The replacement gets the program path as its only argument, the spawner's
/// working directory, this process's environment plus the spawner's extra
/// variables, the standard streams of this process and the listener at fd 3.
/// Every other descriptor is close-on-exec.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
    dir: PathBuf,
    env: Vec<(OsString, OsString)>,
}

impl ExecSpawner {
    /// Spawn `program` in `dir`.
    pub fn new(program: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            dir: dir.into(),
            env: Vec::new(),
        }
    }

    /// Spawn the current executable in the current working directory.
    pub fn current() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, std::env::current_dir()?))
    }

    /// Spawn the current executable, carrying `config` over in its environment.
    ///
    /// The replacement gets no arguments, so settings given as command line
    /// flags would otherwise fall back to the defaults in the new process.
    pub fn for_config(config: &Config) -> io::Result<Self> {
        Ok(Self::current()?.envs(config.to_env()))
    }

    /// Set an extra environment variable for the replacement.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Set several extra environment variables for the replacement.
    pub fn envs<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        vars.into_iter().fold(self, |spawner, (k, v)| spawner.env(k, v))
    }

    /// The command for a replacement, without the listener installed.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .current_dir(&self.dir)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        command
    }
}

impl Spawner for ExecSpawner {
    fn spawn(&self, listener: BorrowedFd<'_>) -> Result<u32, SpawnError> {
        let source = listener.as_raw_fd();
        let mut command = self.command();

        // SAFETY: the hook runs between fork and exec and only calls
        // dup2/fcntl, which are async-signal-safe.
        unsafe {
            command.pre_exec(move || install_at_slot(source, INHERITED_LISTENER_FD));
        }

        info!(program = %self.program.display(), dir = %self.dir.display(), fd = source, "Spawning replacement process");
        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("replacement exited before reporting its pid"))?;

        Ok(pid)
    }
}

/// Make `source` available at `slot` across exec.
///
/// `dup2` onto a different slot yields a descriptor without close-on-exec.
/// When the listener already sits at `slot`, its flag is cleared in place.
fn install_at_slot(source: RawFd, slot: RawFd) -> io::Result<()> {
    if source == slot {
        let flags = unsafe { libc::fcntl(slot, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(slot, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }

    if unsafe { libc::dup2(source, slot) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Orchestrates one succession attempt per restart signal.
#[derive(Clone)]
pub struct Succession {
    sock_file: PathBuf,
    listener: Arc<ListenerHandle>,
    spawner: Arc<dyn Spawner>,
}

impl Succession {
    pub fn new(sock_file: PathBuf, listener: Arc<ListenerHandle>, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            sock_file,
            listener,
            spawner,
        }
    }

    /// Run a succession attempt to completion.
    ///
    /// `Ok(())` means the replacement received the listener and this
    /// generation should shut down. An error means the attempt was abandoned
    /// and this generation should keep serving.
    pub async fn handle_restart_signal(&self) -> Result<(), HandoffError> {
        let (tx, mut rx) = mpsc::channel(2);
        tokio::spawn(
            responder::run(self.sock_file.clone(), Arc::clone(&self.listener), tx)
                .in_current_span(),
        );

        while let Some(event) = rx.recv().await {
            match event {
                HandoffEvent::SocketOpened => match self.spawner.spawn(self.listener.as_fd()) {
                    Ok(pid) => info!(pid, "Spawned a new child. Waiting for spinup."),
                    Err(e) => error!(error = %e, "Unable to fork child"),
                },
                HandoffEvent::ListenerSent => {
                    debug!("Sent listener information to fork, shutting down parent");
                    return Ok(());
                }
                HandoffEvent::Failed(e) => return Err(e),
            }
        }

        Err(HandoffError::ResponderExited)
    }
}
