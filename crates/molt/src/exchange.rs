//! The listener exchange.
//!
//! Owns every listener this process is responsible for. Inherited pairs
//! wait in ordered slots until a server claims one by address; servers
//! with no matching slot get a freshly-bound listener. Either way the
//! passable duplicate lands in the active list, whose order fixes the fd
//! numbering a successor process will see.

use std::net::{IpAddr, SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use tracing::info;

use crate::error::{Error, Result};
use crate::fd::FileListenerPair;

pub(crate) struct Exchange {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Ordered inherited pairs; a `None` slot is already acquired.
    inherited: Vec<Option<FileListenerPair>>,
    /// Duplicates of every listener this process owns, in first-adoption
    /// order. These are what a successor inherits.
    active: Vec<OwnedFd>,
}

impl Exchange {
    pub(crate) fn new(inherited: Vec<FileListenerPair>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                inherited: inherited.into_iter().map(Some).collect(),
                active: Vec::new(),
            }),
        }
    }

    /// Whether this process inherited any listeners at startup.
    pub(crate) fn did_inherit(&self) -> bool {
        !self.lock().inherited.is_empty()
    }

    /// Bound addresses of the not-yet-acquired inherited listeners.
    pub(crate) fn inherited_addrs(&self) -> Vec<SocketAddr> {
        self.lock()
            .inherited
            .iter()
            .flatten()
            .map(|pair| pair.addr)
            .collect()
    }

    /// Snapshot of the active descriptors, in adoption order. The exchange
    /// retains ownership; the descriptors stay valid for its lifetime.
    pub(crate) fn active_files(&self) -> Vec<RawFd> {
        self.lock().active.iter().map(|f| f.as_raw_fd()).collect()
    }

    /// Claims the first inherited listener bound to `addr`, if any.
    fn acquire_listener(&self, addr: SocketAddr) -> Option<TcpListener> {
        let mut inner = self.lock();
        let idx = inner
            .inherited
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|p| addr_eq(addr, p.addr)))?;
        let pair = inner.inherited[idx].take()?;
        inner.active.push(pair.file);
        Some(pair.listener)
    }

    /// Registers a freshly-bound listener: duplicates its descriptor into
    /// the active list and reasserts non-blocking mode on the live fd.
    ///
    /// On error the caller still owns (and must close) the listener.
    fn activate_listener(&self, listener: &TcpListener) -> Result<()> {
        let file = listener.as_fd().try_clone_to_owned()?;
        // O_NONBLOCK sits on the open file description shared with the
        // duplicate; make sure the accept loop keeps its non-blocking fd.
        listener.set_nonblocking(true)?;
        self.lock().active.push(file);
        Ok(())
    }

    /// Returns a listener for `addr`: an inherited one when the address
    /// matches, a freshly-bound one otherwise.
    pub(crate) fn acquire_or_create_listener(&self, addr: &str) -> Result<TcpListener> {
        let resolved = resolve_addr(addr)?;

        if let Some(listener) = self.acquire_listener(resolved) {
            info!(addr = %resolved, "acquired inherited listener");
            return Ok(listener);
        }

        let listener = TcpListener::bind(resolved).map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        self.activate_listener(&listener)?;
        info!(addr = %resolved, "created listener");
        Ok(listener)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves a listen address. The host part may be omitted (`":8080"`),
/// which means the wildcard address.
fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    let full;
    let target = if addr.starts_with(':') {
        full = format!("0.0.0.0{addr}");
        full.as_str()
    } else {
        addr
    };
    target
        .to_socket_addrs()
        .map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| Error::Bind {
            addr: addr.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ),
        })
}

/// Listen-address equality: same port, same IPv6 zone, same canonical
/// 16-byte IP. Unspecified addresses all name the wildcard and compare
/// equal to one another across families.
fn addr_eq(a: SocketAddr, b: SocketAddr) -> bool {
    if a.port() != b.port() || zone(a) != zone(b) {
        return false;
    }
    canonical16(a.ip()) == canonical16(b.ip())
        || (a.ip().is_unspecified() && b.ip().is_unspecified())
}

fn canonical16(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn zone(addr: SocketAddr) -> u32 {
    match addr {
        SocketAddr::V4(_) => 0,
        SocketAddr::V6(v6) => v6.scope_id(),
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::IntoRawFd;

    use super::*;

    fn inherited_pair() -> (FileListenerPair, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let pair = crate::fd::tests::adopt_for_test(listener.into_raw_fd());
        (pair, addr)
    }

    #[test]
    fn test_acquire_matching_inherited_listener() {
        let (pair, addr) = inherited_pair();
        let exchange = Exchange::new(vec![pair]);
        assert!(exchange.did_inherit());
        assert_eq!(exchange.inherited_addrs(), vec![addr]);

        let listener = exchange
            .acquire_or_create_listener(&addr.to_string())
            .unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);

        // The paired duplicate moved into the active snapshot exactly once.
        assert_eq!(exchange.active_files().len(), 1);
        assert!(exchange.inherited_addrs().is_empty());
        // Still inherited even though every slot is acquired.
        assert!(exchange.did_inherit());
    }

    #[test]
    fn test_create_when_nothing_matches() {
        let exchange = Exchange::new(Vec::new());
        assert!(!exchange.did_inherit());

        let listener = exchange.acquire_or_create_listener("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(exchange.active_files().len(), 1);
    }

    #[test]
    fn test_active_order_is_adoption_order() {
        let (pair, addr) = inherited_pair();
        let exchange = Exchange::new(vec![pair]);

        let created = exchange.acquire_or_create_listener("127.0.0.1:0").unwrap();
        let acquired = exchange
            .acquire_or_create_listener(&addr.to_string())
            .unwrap();

        let files = exchange.active_files();
        assert_eq!(files.len(), 2);
        // First the created listener's duplicate, then the acquired pair's.
        assert!(files[0] != acquired.as_raw_fd());
        drop(created);
    }

    #[test]
    fn test_bind_failure_is_a_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let exchange = Exchange::new(Vec::new());
        match exchange.acquire_or_create_listener(&addr.to_string()) {
            Err(Error::Bind { addr: got, .. }) => assert_eq!(got, addr.to_string()),
            other => panic!("expected Bind error, got {other:?}"),
        }
        assert!(exchange.active_files().is_empty());
    }

    #[test]
    fn test_resolve_port_only_form() {
        let addr = resolve_addr(":8080").unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn test_resolve_garbage_is_a_bind_error() {
        assert!(matches!(
            resolve_addr("not an address"),
            Err(Error::Bind { .. })
        ));
    }

    #[test]
    fn test_addr_eq_rules() {
        let v4 = |s: &str| s.parse::<SocketAddr>().unwrap();

        assert!(addr_eq(v4("127.0.0.1:80"), v4("127.0.0.1:80")));
        assert!(!addr_eq(v4("127.0.0.1:80"), v4("127.0.0.1:81")));
        assert!(!addr_eq(v4("127.0.0.1:80"), v4("127.0.0.2:80")));

        // IPv4 and its v6-mapped form name the same endpoint.
        assert!(addr_eq(v4("127.0.0.1:80"), v4("[::ffff:127.0.0.1]:80")));

        // All unspecified addresses are the wildcard.
        assert!(addr_eq(v4("0.0.0.0:80"), v4("[::]:80")));
        assert!(!addr_eq(v4("0.0.0.0:80"), v4("127.0.0.1:80")));

        // Zones must match.
        let zoned: SocketAddr =
            std::net::SocketAddrV6::new("fe80::1".parse().unwrap(), 80, 0, 2).into();
        let unzoned: SocketAddr =
            std::net::SocketAddrV6::new("fe80::1".parse().unwrap(), 80, 0, 0).into();
        assert!(!addr_eq(zoned, unzoned));
        assert!(addr_eq(zoned, zoned));
    }
}
