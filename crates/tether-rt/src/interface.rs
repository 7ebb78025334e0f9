//! Socket creation and address resolution.
//!
//! Listening sockets are built with raw `libc` calls so every option lands
//! before `bind`; accepted and connecting sockets get their options applied
//! to the live fd. The [`Resolver`] fronts system lookup with a TTL'd cache
//! so reconnect storms do not hammer the resolver.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::net::TcpStream;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Options applied to listening, accepted and connecting sockets.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub close_on_exec: bool,
    pub reuse_address: bool,
    pub non_blocking: bool,
    pub keep_alive: bool,
    pub tcp_nodelay: bool,
    pub tcp_defer_accept: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            close_on_exec: true,
            reuse_address: false,
            non_blocking: true,
            keep_alive: false,
            tcp_nodelay: false,
            tcp_defer_accept: false,
        }
    }
}

impl SocketOptions {
    /// Defaults for a listening socket.
    pub fn listening() -> Self {
        SocketOptions { reuse_address: true, ..Default::default() }
    }
}

const LISTEN_BACKLOG: libc::c_int = 256;

fn last_error<T>() -> io::Result<T> {
    Err(io::Error::last_os_error())
}

fn set_flag(fd: RawFd, get: libc::c_int, set: libc::c_int, bit: libc::c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, get);
        if flags < 0 {
            return last_error();
        }
        if libc::fcntl(fd, set, flags | bit) < 0 {
            return last_error();
        }
    }
    Ok(())
}

fn set_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return last_error();
    }
    Ok(())
}

/// Apply fd-level options (everything except reuse-address, which must be
/// set before bind and is handled by [`listen_tcp`]).
pub fn apply_options(fd: RawFd, options: &SocketOptions) -> io::Result<()> {
    if options.close_on_exec {
        set_flag(fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    }
    if options.non_blocking {
        set_flag(fd, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
    }
    if options.keep_alive {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    }
    if options.tcp_nodelay {
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    }
    if options.tcp_defer_accept {
        #[cfg(target_os = "linux")]
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1)?;
    }
    Ok(())
}

/// Bind and listen on `bind_ip:port` with `options`.
///
/// An empty `bind_ip` binds the wildcard v4 address. Returns the listener in
/// non-blocking mode when requested, ready to hand clones to reactors.
pub fn listen_tcp(
    bind_ip: &str,
    port: u16,
    options: &SocketOptions,
) -> io::Result<std::net::TcpListener> {
    let ip: IpAddr = if bind_ip.is_empty() {
        IpAddr::from([0, 0, 0, 0])
    } else {
        bind_ip
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid bind address"))?
    };
    let addr = SocketAddr::new(ip, port);

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return last_error();
    }

    // Make sure the fd is reclaimed on any failure below.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };

    if options.reuse_address {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    }
    apply_options(fd, options)?;

    let (storage, len) = sockaddr_from(&addr);
    let ret = unsafe {
        libc::bind(fd, &storage as *const libc::sockaddr_storage as *const libc::sockaddr, len)
    };
    if ret != 0 {
        return last_error();
    }

    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } != 0 {
        return last_error();
    }

    debug!("listening on {}", listener.local_addr()?);
    Ok(listener)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Start a non-blocking connect toward `addr`.
///
/// The returned stream is mid-connect; the transport's `Connect` action
/// resolves whether it succeeded once the socket turns writable.
pub fn connect_tcp(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    apply_options(stream.as_raw_fd(), options)?;
    Ok(stream)
}

/// Apply accepted-socket options to a freshly accepted stream.
pub fn setup_accepted(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    apply_options(stream.as_raw_fd(), options)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

struct CacheEntry {
    addrs: Vec<IpAddr>,
    expires: Instant,
}

/// Address resolution with a TTL'd cache.
pub struct Resolver {
    ttl: Duration,
    cache: Mutex<FxHashMap<String, CacheEntry>>,
}

impl Resolver {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(ttl: Duration) -> Self {
        Resolver { ttl, cache: Mutex::new(FxHashMap::default()) }
    }

    /// Resolve `host` to its addresses, newest cache entry first.
    pub fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // IP literals bypass the cache entirely.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let now = Instant::now();
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(host) {
                if entry.expires > now {
                    return Ok(entry.addrs.clone());
                }
            }
        }

        let addrs: Vec<IpAddr> = (host, 0u16)
            .to_socket_addrs()
            .map_err(|e| {
                warn!("failed to resolve {host}: {e}");
                e
            })?
            .map(|a| a.ip())
            .collect();

        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "host has no addresses"));
        }

        let mut cache = self.cache.lock();
        cache.insert(
            host.to_owned(),
            CacheEntry { addrs: addrs.clone(), expires: now + self.ttl },
        );
        Ok(addrs)
    }

    /// Drop every cached entry.
    pub fn flush(&self) {
        self.cache.lock().clear();
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::new(Self::DEFAULT_TTL)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_tcp_binds() {
        let listener = listen_tcp("127.0.0.1", 0, &SocketOptions::listening()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);

        // A second listener on the same port must fail even with reuse_address
        // (reuse_address only skips TIME_WAIT, it is not SO_REUSEPORT).
        let err = listen_tcp("127.0.0.1", addr.port(), &SocketOptions::listening());
        assert!(err.is_err());
    }

    #[test]
    fn test_listen_rejects_bad_address() {
        assert!(listen_tcp("not an ip", 0, &SocketOptions::listening()).is_err());
    }

    #[test]
    fn test_connect_reaches_listener() {
        let listener = listen_tcp("127.0.0.1", 0, &SocketOptions::listening()).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut options = SocketOptions::default();
        options.tcp_nodelay = true;
        let _stream = connect_tcp(addr, &options).unwrap();

        listener.set_nonblocking(true).unwrap();
        let accepted = loop {
            match listener.accept() {
                Ok((s, _)) => break s,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        drop(accepted);
    }

    #[test]
    fn test_resolver_ip_literal() {
        let resolver = Resolver::default();
        let addrs = resolver.resolve("127.0.0.1").unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_resolver_caches() {
        let resolver = Resolver::new(Duration::from_secs(3600));
        let first = resolver.resolve("localhost").unwrap();
        assert!(!first.is_empty());

        // Cached entry answers the same without another lookup.
        let second = resolver.resolve("localhost").unwrap();
        assert_eq!(first, second);

        resolver.flush();
        let third = resolver.resolve("localhost").unwrap();
        assert!(!third.is_empty());
    }
}
