//! Adoption of inherited file descriptors.
//!
//! Each advertised descriptor must be a listening TCP stream socket; the
//! trailing descriptor may instead be a Unix stream socket, in which case
//! it is the handoff control channel rather than a listener.
//!
//! A note on blocking mode: the descriptor that will be re-passed to a
//! future child and the live listener descriptor are dup(2)s of one
//! another, so O_NONBLOCK lives on the shared open file description.
//! The live listener must end up non-blocking or the accept loop blocks
//! the runtime across a shutdown, so adoption always reasserts it after
//! duplicating.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tracing::info;

use crate::activation;
use crate::error::{Error, Result};
use crate::messenger::Messenger;

/// A listening TCP socket paired with a duplicated descriptor on the same
/// kernel socket.
///
/// The duplicate is what gets passed to a successor process; the listener
/// is what the embedded server accepts on. Both stay open for the life of
/// the pair and closing either never invalidates the other.
#[derive(Debug)]
pub(crate) struct FileListenerPair {
    pub(crate) listener: TcpListener,
    pub(crate) file: OwnedFd,
    pub(crate) addr: SocketAddr,
}

/// Adopts the environment-advertised descriptors.
///
/// Returns the listener pairs plus the control-channel messenger if the
/// trailing descriptor was a Unix stream socket. Clears the activation
/// variables on success so unrelated child spawns do not re-inherit them.
pub(crate) fn inherit() -> Result<(Vec<FileListenerPair>, Option<Messenger>)> {
    let mut fds = activation::listen_fds()?;
    let messenger = take_messenger(&mut fds)?;
    let pairs = fds
        .into_iter()
        .map(adopt_listener)
        .collect::<Result<Vec<_>>>()?;
    activation::clear_env();
    Ok((pairs, messenger))
}

/// If the last advertised descriptor is a Unix stream socket, detaches it
/// from the listener list and wraps it as the control channel.
fn take_messenger(fds: &mut Vec<RawFd>) -> Result<Option<Messenger>> {
    let Some(&last) = fds.last() else {
        return Ok(None);
    };
    if !(is_stream_socket(last)? && is_unix_socket(last)?) {
        return Ok(None);
    }
    fds.pop();
    // SAFETY: the activation protocol hands us ownership of this fd.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(last) };
    let messenger = Messenger::from_std(stream)?;
    info!(fd = last, "inherited handoff control channel");
    Ok(Some(messenger))
}

/// Turns one inherited descriptor into a [`FileListenerPair`].
fn adopt_listener(fd: RawFd) -> Result<FileListenerPair> {
    if !is_stream_socket(fd)? || is_unix_socket(fd)? {
        return Err(Error::BadFd { fd });
    }
    // Freshly-bound listeners get these; inherited sockets (e.g. from a
    // service manager's unit file) may not.
    set_listener_socket_options(fd)?;

    // SAFETY: the activation protocol hands us ownership of this fd.
    let file = unsafe { OwnedFd::from_raw_fd(fd) };
    let dup = file.try_clone()?;
    let listener = TcpListener::from(dup);
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    info!(fd, %addr, "inherited listener");
    Ok(FileListenerPair { listener, file, addr })
}

/// Whether `fd` is a socket of type SOCK_STREAM.
pub(crate) fn is_stream_socket(fd: RawFd) -> io::Result<bool> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if st.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Ok(false);
    }
    let mut ty: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut ty as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ty == libc::SOCK_STREAM)
}

/// Whether `fd` is bound in the AF_UNIX domain.
pub(crate) fn is_unix_socket(fd: RawFd) -> io::Result<bool> {
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr.ss_family == libc::AF_UNIX as libc::sa_family_t)
}

/// Matches the socket options a freshly-bound listener would have had.
pub(crate) fn set_listener_socket_options(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_BROADCAST, 1)?;
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    Ok(())
}

pub(crate) fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::os::fd::{AsRawFd, IntoRawFd};

    use super::*;

    /// Adopts a raw listener fd the same way inheritance does. For tests in
    /// sibling modules that need a ready-made pair.
    pub(crate) fn adopt_for_test(fd: RawFd) -> FileListenerPair {
        adopt_listener(fd).expect("adoptable listener fd")
    }

    #[test]
    fn test_tcp_listener_is_stream_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(is_stream_socket(listener.as_raw_fd()).unwrap());
        assert!(!is_unix_socket(listener.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_udp_socket_is_not_stream() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(!is_stream_socket(socket.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_plain_file_is_not_a_socket() {
        let file = std::fs::File::open("/dev/null").unwrap();
        assert!(!is_stream_socket(file.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_unix_stream_is_detected() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        assert!(is_stream_socket(a.as_raw_fd()).unwrap());
        assert!(is_unix_socket(a.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_adopt_listener_round_trip() {
        let bound = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = bound.local_addr().unwrap();

        let pair = adopt_listener(bound.into_raw_fd()).unwrap();
        assert_eq!(pair.addr, addr);
        assert_ne!(pair.listener.as_raw_fd(), pair.file.as_raw_fd());

        // The adopted listener still accepts.
        pair.listener.set_nonblocking(false).unwrap();
        let client = std::net::TcpStream::connect(addr);
        assert!(client.is_ok());
        assert!(pair.listener.accept().is_ok());
    }

    #[test]
    fn test_adopt_rejects_unix_socket() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = a.into_raw_fd();
        match adopt_listener(fd) {
            Err(Error::BadFd { fd: got }) => assert_eq!(got, fd),
            other => panic!("expected BadFd, got {other:?}"),
        }
        // adopt_listener did not take ownership on the error path.
        unsafe { libc::close(fd) };
    }

    #[tokio::test]
    async fn test_take_messenger_pops_trailing_unix_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();

        let mut fds = vec![listener.as_raw_fd(), a.into_raw_fd()];
        let messenger = take_messenger(&mut fds).unwrap();
        assert!(messenger.is_some());
        assert_eq!(fds.len(), 1);
    }

    #[tokio::test]
    async fn test_take_messenger_leaves_tcp_listeners_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut fds = vec![listener.as_raw_fd()];
        assert!(take_messenger(&mut fds).unwrap().is_none());
        assert_eq!(fds.len(), 1);
    }
}
