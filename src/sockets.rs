//! Thin portable wrappers around BSD socket calls, plus the endpoint
//! address grammar (`tcp://host:port`, `tls://host:port`, `host:port`,
//! bracketed IPv6).

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Error, Result};

/// Scheme recognized on an endpoint string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Plain,
    Tcp,
    Tls,
}

/// The result of splitting a triadic address (`scheme://host:port`) into
/// its parts.
#[derive(Debug, Clone)]
pub struct ParsedEndpoint {
    pub scheme: Scheme,
    pub addr: SocketAddr,
}

/// Parse `tcp://host:port`, `tls://host:port`, `host:port`, or a bracketed
/// IPv6 form of any of those, into a [`ParsedEndpoint`]. Returns a
/// configuration error on malformed input, never panics.
pub fn parse_endpoint(address: &str) -> Result<ParsedEndpoint> {
    let (scheme, rest) = if let Some(stripped) = address.strip_prefix("tcp://") {
        (Scheme::Tcp, stripped)
    } else if let Some(stripped) = address.strip_prefix("tls://") {
        (Scheme::Tls, stripped)
    } else {
        (Scheme::Plain, address)
    };

    let addr = parse_ip_port(rest)?;
    Ok(ParsedEndpoint { scheme, addr })
}

/// Parse a bare `host:port` or `[host]:port` address. Accepts a trailing
/// unmatched closing bracket (`fe80::1]:80`) the way the original grammar
/// tolerates it.
pub fn parse_ip_port(address: &str) -> Result<SocketAddr> {
    let address = address.trim();
    if let Some(stripped) = address.strip_prefix('[') {
        // "[host]:port" or the tolerated "host]:port"
        let close = stripped
            .find(']')
            .ok_or_else(|| Error::config(format!("invalid bracketed address '{address}'")))?;
        let host = &stripped[..close];
        let after = &stripped[close + 1..];
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| Error::config(format!("missing port in '{address}'")))?;
        return build_addr(host, port);
    }
    if let Some(close) = address.find(']') {
        // tolerated form without opening bracket: "host]:port"
        let host = &address[..close];
        let after = &address[close + 1..];
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| Error::config(format!("missing port in '{address}'")))?;
        return build_addr(host, port);
    }

    // Bare "host:port" — for IPv6 literals without brackets this is
    // ambiguous, so only the last ':' is treated as the port separator.
    let idx = address
        .rfind(':')
        .ok_or_else(|| Error::config(format!("missing port in '{address}'")))?;
    build_addr(&address[..idx], &address[idx + 1..])
}

fn build_addr(host: &str, port: &str) -> Result<SocketAddr> {
    let port: u16 = port
        .parse()
        .map_err(|_| Error::config(format!("invalid port '{port}'")))?;
    let ip: IpAddr = host
        .parse()
        .or_else(|_| {
            // Fall back to name resolution for host names; loopback/any
            // literal forms are handled by the direct IpAddr parse above.
            use std::net::ToSocketAddrs;
            (host, 0u16)
                .to_socket_addrs()
                .ok()
                .and_then(|mut it| it.next())
                .map(|sa| sa.ip())
                .ok_or(())
        })
        .map_err(|_| Error::config(format!("unresolvable host '{host}'")))?;
    Ok(SocketAddr::new(ip, port))
}

/// Render a socket address back into `host:port` / `[host]:port` form.
pub fn to_ip_port(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}

/// `true` if `addr` is the zero address (`0.0.0.0:0` / `[::]:0`) — the
/// connector treats this as "wrong address" and fails immediately instead
/// of attempting a connect.
pub fn is_zero_address(addr: &SocketAddr) -> bool {
    addr.port() == 0
        && match addr.ip() {
            IpAddr::V4(v4) => v4 == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(v6) => v6 == Ipv6Addr::UNSPECIFIED,
        }
}

/// Create a non-blocking, close-on-exec TCP socket for the given address
/// family.
pub fn create_nonblocking_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    Ok(socket)
}

pub fn bind_socket(socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
    socket.bind(&SockAddr::from(*addr))
}

pub fn listen_socket(socket: &Socket, backlog: i32) -> io::Result<()> {
    socket.listen(backlog)
}

/// `Ok(None)` means the connect is in progress (`EINPROGRESS`), which the
/// connector treats as the expected non-error outcome of a non-blocking
/// connect.
pub fn connect_socket(socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
    match socket.connect(&SockAddr::from(*addr)) {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.raw_os_error(), Some(libc::EINPROGRESS)) => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn accept_socket(listener: &Socket) -> io::Result<(Socket, SocketAddr)> {
    let (socket, sockaddr) = listener.accept()?;
    let addr = sockaddr
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "accepted non-IP socket"))?;
    Ok((socket, addr))
}

/// Read `SO_ERROR`. A value of `0` means the non-blocking connect
/// succeeded.
pub fn socket_error_code(fd: RawFd) -> io::Result<i32> {
    let mut errval: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errval as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(errval)
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    // SAFETY: the fd is borrowed for the duration of this call only; we
    // forget the temporary socket2::Socket so it never closes the fd.
    let socket = unsafe { Socket::from_raw_fd(fd) };
    let result = socket.local_addr().and_then(|sa| {
        sa.as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-IP local addr"))
    });
    let _ = socket.into_raw_fd();
    result
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let socket = unsafe { Socket::from_raw_fd(fd) };
    let result = socket.peer_addr().and_then(|sa| {
        sa.as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-IP peer addr"))
    });
    let _ = socket.into_raw_fd();
    result
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    with_borrowed(fd, |s| s.set_nodelay(on))
}

pub fn set_keepalive(fd: RawFd, on: bool, idle_seconds: u32) -> io::Result<()> {
    with_borrowed(fd, |s| {
        if on {
            let params = socket2::TcpKeepalive::new().with_time(std::time::Duration::from_secs(idle_seconds as u64));
            s.set_tcp_keepalive(&params)
        } else {
            // socket2 has no direct "disable" call; emulate via raw setsockopt.
            let zero: libc::c_int = 0;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_KEEPALIVE,
                    &zero as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }
    })
}

pub fn set_reuse_addr(fd: RawFd) -> io::Result<()> {
    with_borrowed(fd, |s| s.set_reuse_address(true))
}

pub fn set_reuse_port(fd: RawFd) -> io::Result<()> {
    with_borrowed(fd, |s| s.set_reuse_port(true))
}

fn with_borrowed<R>(fd: RawFd, f: impl FnOnce(&Socket) -> io::Result<R>) -> io::Result<R> {
    let socket = unsafe { Socket::from_raw_fd(fd) };
    let result = f(&socket);
    let _ = socket.into_raw_fd();
    result
}

pub fn close_socket(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Vectored read directly against a raw fd (used by [`crate::buffer::Buffer::read_from_fd`]
/// to fold the "extra page" trick into a single syscall).
pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    let iov = bufs.as_mut_ptr() as *mut libc::iovec;
    let n = unsafe { libc::readv(fd, iov, bufs.len() as libc::c_int) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub fn write_to_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub fn read_from_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Extracts the raw fd from a `socket2::Socket`, consuming it without
/// closing — used at the acceptor/connector → connection ownership
/// handoff points.
pub fn into_raw_fd(socket: Socket) -> RawFd {
    socket.into_raw_fd()
}

pub fn as_raw_fd(socket: &Socket) -> RawFd {
    socket.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prop_assert_eq;

    #[test]
    fn parses_plain_host_port() {
        let ep = parse_endpoint("127.0.0.1:8080").unwrap();
        assert_eq!(ep.scheme, Scheme::Plain);
        assert_eq!(ep.addr.port(), 8080);
    }

    #[test]
    fn parses_tcp_scheme() {
        let ep = parse_endpoint("tcp://127.0.0.1:9090").unwrap();
        assert_eq!(ep.scheme, Scheme::Tcp);
    }

    #[test]
    fn parses_tls_scheme_with_bracketed_ipv6() {
        let ep = parse_endpoint("tls://[::1]:443").unwrap();
        assert_eq!(ep.scheme, Scheme::Tls);
        assert!(ep.addr.is_ipv6());
        assert_eq!(ep.addr.port(), 443);
    }

    #[test]
    fn tolerates_missing_opening_bracket() {
        let addr = parse_ip_port("::1]:80").unwrap();
        assert_eq!(addr.port(), 80);
    }

    #[test]
    fn round_trips_through_to_ip_port() {
        let ep = parse_endpoint("tcp://127.0.0.1:1234").unwrap();
        let rendered = to_ip_port(&ep.addr);
        let reparsed = parse_ip_port(&rendered).unwrap();
        assert_eq!(reparsed, ep.addr);
    }

    #[test]
    fn zero_address_detected() {
        let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        assert!(is_zero_address(&addr));
        let addr: SocketAddr = "0.0.0.0:80".parse().unwrap();
        assert!(!is_zero_address(&addr));
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_ip_port("127.0.0.1").is_err());
    }

    proptest::proptest! {
        #[test]
        fn to_ip_port_round_trips_for_any_v4_address(a: u8, b: u8, c: u8, d: u8, port: u16) {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port);
            let reparsed = parse_ip_port(&to_ip_port(&addr)).unwrap();
            prop_assert_eq!(reparsed, addr);
        }

        #[test]
        fn to_ip_port_round_trips_for_any_v6_address(segments: [u16; 8], port: u16) {
            let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(
                segments[0], segments[1], segments[2], segments[3],
                segments[4], segments[5], segments[6], segments[7],
            )), port);
            let reparsed = parse_ip_port(&to_ip_port(&addr)).unwrap();
            prop_assert_eq!(reparsed, addr);
        }
    }
}
