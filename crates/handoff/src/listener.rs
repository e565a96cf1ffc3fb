//! Listening socket acquisition.
//!
//! A process first tries to import the listening socket from a parent that is
//! handing off to it: it dials the control channel, asks for the listener
//! metadata and adopts the descriptor it inherited at process creation. When
//! nobody answers on the control channel this is a cold start and a fresh
//! socket is bound instead.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::metadata::{ListenerMetadata, GET_LISTENER, INHERITED_LISTENER_FD, MAX_METADATA_LEN};
use crate::AcquireError;

/// An open listening socket bound to the configured address.
///
/// Owned by the server for the lifetime of the process. Each generation
/// accepts on its own duplicate, so the handle stays open while generations
/// come and go.
#[derive(Debug)]
pub struct ListenerHandle {
    addr: String,
    name: String,
    listener: std::net::TcpListener,
}

/// A duplicate of the listening descriptor together with its name.
///
/// Closed on drop.
#[derive(Debug)]
pub struct TransferableDescriptor {
    fd: OwnedFd,
    name: String,
}

impl TransferableDescriptor {
    /// Name of the descriptor, e.g. `tcp:0.0.0.0:3000`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsFd for TransferableDescriptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl ListenerHandle {
    /// Wrap a bound std listener that serves `addr`.
    pub fn from_std(addr: impl Into<String>, listener: std::net::TcpListener) -> io::Result<Self> {
        let name = descriptor_name(&listener.local_addr()?);
        Ok(Self {
            addr: addr.into(),
            name,
            listener,
        })
    }

    /// Configured address this listener serves.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Name of the underlying descriptor.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Duplicate the descriptor for transfer to another process.
    pub fn descriptor(&self) -> io::Result<TransferableDescriptor> {
        let fd = self.listener.as_fd().try_clone_to_owned()?;
        Ok(TransferableDescriptor {
            fd,
            name: self.name.clone(),
        })
    }

    /// Metadata describing this listener as inherited by a replacement process.
    pub fn metadata(&self) -> ListenerMetadata {
        ListenerMetadata::inherited(self.addr.clone(), self.name.clone())
    }

    /// A new tokio listener on a duplicate of this socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn to_tokio(&self) -> io::Result<tokio::net::TcpListener> {
        let listener = self.listener.try_clone()?;
        listener.set_nonblocking(true)?;
        tokio::net::TcpListener::from_std(listener)
    }
}

impl AsFd for ListenerHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

/// Name given to a TCP listening descriptor bound to `addr`.
pub fn descriptor_name(addr: &SocketAddr) -> String {
    format!("tcp:{}", addr)
}

/// Import the listener from a parent process, or bind a new one.
///
/// Both paths return the same handle type. Only a failure to bind is an error.
pub async fn acquire(addr: &str, sock_file: &Path) -> Result<ListenerHandle, AcquireError> {
    match import_listener(addr, sock_file).await {
        Ok(handle) => {
            debug!(addr, name = handle.name(), "Imported listener file descriptor");
            return Ok(handle);
        }
        Err(e) => {
            info!(error = %e, "Listener not imported");
            // A parent answered, so fd 3 may hold its socket. Holding on to it
            // would keep the socket alive and pass it to our own replacement.
            if !matches!(e, AcquireError::Connect(_)) {
                release_inherited(INHERITED_LISTENER_FD);
            }
        }
    }

    create_listener(addr).await
}

/// Ask the parent process on `sock_file` for the listener serving `addr`.
pub async fn import_listener(addr: &str, sock_file: &Path) -> Result<ListenerHandle, AcquireError> {
    let mut conn = UnixStream::connect(sock_file)
        .await
        .map_err(AcquireError::Connect)?;

    conn.write_all(GET_LISTENER).await?;

    let mut buf = vec![0u8; MAX_METADATA_LEN];
    let n = conn.read(&mut buf).await?;
    if n == 0 {
        return Err(AcquireError::EmptyResponse);
    }
    drop(conn);

    let metadata = ListenerMetadata::decode(&buf[..n])?;
    if metadata.addr != addr {
        return Err(AcquireError::AddressMismatch {
            expected: addr.to_string(),
            found: metadata.addr,
        });
    }

    let listener = adopt_descriptor(&metadata)?;
    Ok(ListenerHandle {
        addr: metadata.addr,
        name: metadata.filename,
        listener,
    })
}

/// Bind a fresh listening socket at `addr`.
pub async fn create_listener(addr: &str) -> Result<ListenerHandle, AcquireError> {
    let bind_err = |source| AcquireError::Bind {
        addr: addr.to_string(),
        source,
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(bind_err)?
        .into_std()
        .map_err(bind_err)?;

    let handle = ListenerHandle::from_std(addr, listener).map_err(bind_err)?;
    info!(addr, name = handle.name(), "Bound new listener");
    Ok(handle)
}

/// Take ownership of the inherited descriptor named by `metadata`.
///
/// The raw inherited descriptor is closed once a duplicate has been adopted.
fn adopt_descriptor(metadata: &ListenerMetadata) -> Result<std::net::TcpListener, AcquireError> {
    let fd = metadata.fd;
    if !validate_fd(fd) || !is_listening(fd) {
        return Err(AcquireError::InvalidDescriptor { fd });
    }

    // SAFETY: fstat and SO_ACCEPTCONN confirmed `fd` is an open listening
    // socket. It was inherited for this handoff and nothing else in this
    // process owns it.
    let inherited = unsafe { OwnedFd::from_raw_fd(fd) };
    let adopted = inherited.try_clone()?;
    drop(inherited);

    let listener = std::net::TcpListener::from(adopted);
    let found = descriptor_name(&listener.local_addr()?);
    if found != metadata.filename {
        return Err(AcquireError::DescriptorNameMismatch {
            expected: metadata.filename.clone(),
            found,
        });
    }

    debug!(fd, adopted_fd = listener.as_raw_fd(), name = %found, "Adopted inherited listener");
    Ok(listener)
}

/// Close `fd` if it is a listening socket that came in across exec.
///
/// Descriptors opened by this process are close-on-exec, so a listener
/// without the flag was inherited.
fn release_inherited(fd: RawFd) {
    if !validate_fd(fd) || !is_listening(fd) {
        return;
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || flags & libc::FD_CLOEXEC != 0 {
        return;
    }

    // SAFETY: `fd` is an open listening socket inherited from the parent and
    // not adopted by anything in this process.
    drop(unsafe { OwnedFd::from_raw_fd(fd) });
    debug!(fd, "Closed unused inherited listener");
}

/// Validate that a file descriptor is a valid socket using fstat.
fn validate_fd(fd: i32) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Whether the socket behind `fd` is in the listening state.
fn is_listening(fd: i32) -> bool {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    result == 0 && value != 0
}
