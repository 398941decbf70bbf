//! Socket layer used by the dispatcher.
//!
//! The dispatcher only talks to these traits so tests can script server
//! behaviour; [`SystemSockets`] is the real thing on top of socket2.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

/// Largest DNS message over a stream transport.
pub const MAX_STREAM_FRAME: usize = u16::MAX as usize;

pub trait DatagramSocket: Send {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    /// Waits at most `timeout`; `ErrorKind::TimedOut` when nothing arrives.
    fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> io::Result<(usize, SocketAddr)>;
}

/// A connected, length-prefixed DNS stream.
pub trait StreamConnection: Send {
    fn send_frame(&mut self, msg: &[u8]) -> io::Result<()>;
    fn recv_frame(&mut self, deadline: Instant) -> io::Result<Vec<u8>>;
}

pub trait SocketLayer: Send + Sync {
    fn udp_socket(&self, server: SocketAddr, mark: u32) -> io::Result<Box<dyn DatagramSocket>>;
    fn tcp_connect(
        &self,
        server: SocketAddr,
        mark: u32,
        timeout: Duration,
    ) -> io::Result<Box<dyn StreamConnection>>;
}

#[cfg(unix)]
fn set_int_option(socket: &Socket, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Tags a socket with a routing mark / 为 socket 设置路由标记
#[cfg(target_os = "linux")]
pub fn set_socket_mark(socket: &Socket, mark: u32) -> io::Result<()> {
    if mark == 0 {
        return Ok(());
    }
    set_int_option(socket, libc::SO_MARK, mark as libc::c_int)
}

#[cfg(not(target_os = "linux"))]
pub fn set_socket_mark(_socket: &Socket, mark: u32) -> io::Result<()> {
    if mark != 0 {
        debug!(mark, "socket marks are not supported on this platform, ignoring");
    }
    Ok(())
}

const LISTENER_BUFFER: usize = 4 * 1024 * 1024;

/// Non-blocking UDP listener. On unix several of these may share `addr`
/// (SO_REUSEPORT) and the kernel spreads datagrams across them.
pub fn bind_udp_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if let Err(err) = set_int_option(&socket, libc::SO_REUSEPORT, 1) {
        debug!(error = %err, "SO_REUSEPORT unavailable");
    }
    // the kernel may cap these; a smaller buffer still works
    if let Err(err) = socket.set_recv_buffer_size(LISTENER_BUFFER) {
        debug!(size = LISTENER_BUFFER, error = %err, "failed to set udp recv buffer");
    }
    if let Err(err) = socket.set_send_buffer_size(LISTENER_BUFFER) {
        debug!(size = LISTENER_BUFFER, error = %err, "failed to set udp send buffer");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn new_socket(server: SocketAddr, ty: Type, protocol: Protocol, mark: u32) -> io::Result<Socket> {
    let domain = if server.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    if let Err(err) = set_socket_mark(&socket, mark) {
        // usually missing CAP_NET_ADMIN; the query still goes out unmarked
        debug!(mark, error = %err, "failed to set socket mark");
    }
    Ok(socket)
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

/// Remaining time until `deadline`, or a TimedOut error.
pub fn remaining(deadline: Instant) -> io::Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(timed_out("read"));
    }
    Ok(left)
}

/// Maps read-timeout errors from the OS onto `TimedOut`.
fn normalize_timeout(err: io::Error) -> io::Error {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => timed_out("read"),
        _ => err,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSockets;

struct SystemDatagram(UdpSocket);

impl DatagramSocket for SystemDatagram {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, target)
    }

    fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> io::Result<(usize, SocketAddr)> {
        if timeout.is_zero() {
            return Err(timed_out("read"));
        }
        self.0.set_read_timeout(Some(timeout))?;
        self.0.recv_from(buf).map_err(normalize_timeout)
    }
}

struct SystemStream(TcpStream);

impl StreamConnection for SystemStream {
    fn send_frame(&mut self, msg: &[u8]) -> io::Result<()> {
        write_frame(&mut self.0, msg)
    }

    fn recv_frame(&mut self, deadline: Instant) -> io::Result<Vec<u8>> {
        self.0.set_read_timeout(Some(remaining(deadline)?))?;
        read_frame(&mut self.0).map_err(normalize_timeout)
    }
}

/// Writes `msg` with its two-byte length prefix in one call.
pub fn write_frame<W: Write>(w: &mut W, msg: &[u8]) -> io::Result<()> {
    if msg.len() > MAX_STREAM_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "message too large for stream"));
    }
    let mut frame = Vec::with_capacity(msg.len() + 2);
    frame.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    frame.extend_from_slice(msg);
    w.write_all(&frame)?;
    w.flush()
}

pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty frame"));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Connected TCP socket to `server`, marked and with Nagle off.
pub fn connect_tcp(server: SocketAddr, mark: u32, timeout: Duration) -> io::Result<TcpStream> {
    let socket = new_socket(server, Type::STREAM, Protocol::TCP, mark)?;
    socket.connect_timeout(&server.into(), timeout.max(Duration::from_millis(1)))?;
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

impl SocketLayer for SystemSockets {
    fn udp_socket(&self, server: SocketAddr, mark: u32) -> io::Result<Box<dyn DatagramSocket>> {
        let socket = new_socket(server, Type::DGRAM, Protocol::UDP, mark)?;
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&local.into())?;
        Ok(Box::new(SystemDatagram(socket.into())))
    }

    fn tcp_connect(
        &self,
        server: SocketAddr,
        mark: u32,
        timeout: Duration,
    ) -> io::Result<Box<dyn StreamConnection>> {
        Ok(Box::new(SystemStream(connect_tcp(server, mark, timeout)?)))
    }
}
