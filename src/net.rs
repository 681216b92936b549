//! Net primitives: listen/accept/connect with timeout, socket tuning, polling,
//! interface discovery (§4.2, original `network.c`/`network.h`).

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Socket, TcpKeepalive};

use crate::error::{Result, SoundshareError};

/// Fixed admission capacity shared by the audio and chat client tables
/// (original `MAX_CLIENTS`/`MAX_CHAT_CLIENTS`, both 16).
pub const MAX_CLIENTS: usize = 16;

struct Slot {
    stream: TcpStream,
    ip: String,
}

/// Fixed-capacity table of connected client sockets (§9 design note 2):
/// a `parking_lot::Mutex`-guarded array rather than a hash map, so admission
/// has an explicit capacity and a stable per-client index.
pub struct ClientTable {
    inner: Mutex<[Option<Slot>; MAX_CLIENTS]>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(std::array::from_fn(|_| None)) }
    }

    /// Admit a client, returning its stable slot index or `CapacityExceeded`.
    pub fn admit(&self, stream: TcpStream, ip: String) -> Result<usize> {
        let mut slots = self.inner.lock();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Slot { stream, ip });
                return Ok(i);
            }
        }
        Err(SoundshareError::CapacityExceeded)
    }

    pub fn remove(&self, idx: usize) {
        self.inner.lock()[idx] = None;
    }

    pub fn count(&self) -> usize {
        self.inner.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn ip_of(&self, idx: usize) -> Option<String> {
        self.inner.lock()[idx].as_ref().map(|s| s.ip.clone())
    }

    /// Snapshot live `(index, cloned stream)` pairs and release the lock
    /// before the caller writes — the audio fan-out path (§9 design note 2),
    /// where holding the lock across a slow client's write would stall every
    /// other client.
    pub fn snapshot(&self) -> Vec<(usize, TcpStream)> {
        self.inner
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().and_then(|s| s.stream.try_clone().ok().map(|c| (i, c))))
            .collect()
    }

    /// Write to every connected client while holding the lock. Chat traffic
    /// is low-volume enough that lock contention during the write doesn't
    /// matter, matching the original's `chat_server_broadcast`.
    pub fn broadcast_locked(&self, mut write: impl FnMut(&mut TcpStream)) {
        for slot in self.inner.lock().iter_mut().flatten() {
            write(&mut slot.stream);
        }
    }

    /// Same as [`broadcast_locked`](Self::broadcast_locked) but skips one slot
    /// (the sender), matching `chat_srv_broadcast_except`.
    pub fn broadcast_locked_except(&self, exclude: usize, mut write: impl FnMut(&mut TcpStream)) {
        for (i, slot) in self.inner.lock().iter_mut().enumerate() {
            if i == exclude {
                continue;
            }
            if let Some(slot) = slot {
                write(&mut slot.stream);
            }
        }
    }

    pub fn close_all(&self) {
        let mut slots = self.inner.lock();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind `0.0.0.0:port` with `SO_REUSEADDR` and start listening.
pub fn create_server(port: u16, backlog: i32) -> Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    tracing::info!(port, "server listening");
    Ok(listener)
}

/// Accept one client (non-blocking listener); caller polls first. Applies `TCP_NODELAY`.
pub fn accept_client(srv: &TcpListener) -> io::Result<(TcpStream, String)> {
    let (stream, addr) = srv.accept()?;
    stream.set_nodelay(true)?;
    Ok((stream, addr.ip().to_string()))
}

/// Connect with an explicit timeout: nonblocking connect, poll for writable,
/// check `SO_ERROR`, then switch back to blocking and set `TCP_NODELAY`.
pub fn connect_with_timeout(host: &str, port: u16, timeout_ms: u64) -> Result<TcpStream> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| SoundshareError::ConnectFailed(io::Error::new(io::ErrorKind::InvalidInput, "bad host address")))?;
    let addr: SocketAddr = (ip, port).into();

    let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(SoundshareError::ConnectFailed(e)),
    }

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let ready = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SoundshareError::ConnectTimeout(timeout_ms));
        }
        match poll_fd_raw(socket.as_raw_fd(), libc::POLLOUT, remaining.as_millis() as i32) {
            r if r > 0 => break true,
            0 => continue,
            _ => return Err(SoundshareError::ConnectFailed(io::Error::last_os_error())),
        }
    };
    debug_assert!(ready);

    if let Some(err) = socket.take_error()? {
        return Err(SoundshareError::ConnectFailed(err));
    }

    socket.set_nonblocking(false)?;
    socket.set_nodelay(true)?;
    tracing::info!(host, port, "connected");
    Ok(socket.into())
}

/// Apply streaming socket options: `TCP_NODELAY`, `SO_KEEPALIVE`, `SO_SNDBUF`, low-delay `IP_TOS`.
pub fn set_audio_options(stream: &TcpStream, send_buf_bytes: u32) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = Socket::from(stream.try_clone()?);
    socket.set_tcp_keepalive(&TcpKeepalive::new())?;
    if send_buf_bytes > 0 {
        socket.set_send_buffer_size(send_buf_bytes as usize)?;
    }
    socket.set_tos(0x10)?; // IPTOS_LOWDELAY
    std::mem::forget(socket); // we only borrowed the fd via try_clone
    Ok(())
}

fn poll_fd_raw(fd: i32, events: i16, timeout_ms: i32) -> i32 {
    let mut pollfd = libc::pollfd { fd, events, revents: 0 };
    let rc = unsafe { libc::poll(&mut pollfd as *mut libc::pollfd, 1, timeout_ms) };
    if rc < 0 {
        if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            return 0;
        }
        return -1;
    }
    if rc > 0 && (pollfd.revents & libc::POLLERR) != 0 {
        return -1;
    }
    rc
}

/// Poll a socket for readability. `> 0` ready, `0` timeout, `< 0` error. EINTR is surfaced as `0`.
pub fn poll_readable(stream: &TcpStream, timeout_ms: i32) -> i32 {
    poll_fd_raw(stream.as_raw_fd(), libc::POLLIN, timeout_ms)
}

/// Poll a socket for writability. Same return convention as [`poll_readable`].
pub fn poll_writable(stream: &TcpStream, timeout_ms: i32) -> i32 {
    poll_fd_raw(stream.as_raw_fd(), libc::POLLOUT, timeout_ms)
}

/// Poll a listener for an incoming connection. Same return convention as [`poll_readable`].
pub fn poll_acceptable(listener: &TcpListener, timeout_ms: i32) -> i32 {
    poll_fd_raw(listener.as_raw_fd(), libc::POLLIN, timeout_ms)
}

/// First non-loopback, up, IPv4 interface address (original `net_get_device_ip`).
pub fn device_ipv4() -> Option<String> {
    let ifaces = get_if_addrs::get_if_addrs().ok()?;
    ifaces
        .into_iter()
        .find(|i| !i.is_loopback() && i.ip().is_ipv4())
        .map(|i| i.ip().to_string())
}

/// Bind to an ephemeral port and return it immediately freed, for tests that
/// need a spare port number.
pub fn pick_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    listener.local_addr().map(|a| a.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn create_and_accept_loopback() {
        let port = pick_free_port().unwrap();
        let srv = create_server(port, 4).unwrap();
        let client_thread = std::thread::spawn(move || {
            let mut stream = connect_with_timeout("127.0.0.1", port, 2000).unwrap();
            stream.write_all(b"hi").unwrap();
        });

        let mut ready = 0;
        while ready <= 0 {
            ready = poll_acceptable(&srv, 1000);
        }
        let (mut accepted, _ip) = accept_client(&srv).unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        client_thread.join().unwrap();
    }

    #[test]
    fn connect_timeout_on_unreachable_host() {
        // 240.0.0.1 is reserved/unreachable and expected to time out rather
        // than immediately RST on most CI networks; keep the timeout short.
        let result = connect_with_timeout("240.0.0.1", 9, 200);
        assert!(result.is_err());
    }

    #[test]
    fn client_table_admits_up_to_capacity() {
        let port = pick_free_port().unwrap();
        let srv = create_server(port, MAX_CLIENTS as i32 + 1).unwrap();
        let table = ClientTable::new();

        let mut handles = Vec::new();
        for _ in 0..MAX_CLIENTS {
            handles.push(std::thread::spawn(move || connect_with_timeout("127.0.0.1", port, 1000).unwrap()));
        }
        for h in handles {
            let client_side = h.join().unwrap();
            let mut ready = 0;
            while ready <= 0 {
                ready = poll_acceptable(&srv, 1000);
            }
            let (stream, ip) = accept_client(&srv).unwrap();
            table.admit(stream, ip).unwrap();
            // Leak the client-side stream deliberately: dropping it would
            // close the socket before the table entry is exercised below.
            std::mem::forget(client_side);
        }
        assert_eq!(table.count(), MAX_CLIENTS);

        let extra = connect_with_timeout("127.0.0.1", port, 1000).unwrap();
        let mut ready = 0;
        while ready <= 0 {
            ready = poll_acceptable(&srv, 1000);
        }
        let (stream, ip) = accept_client(&srv).unwrap();
        assert!(matches!(table.admit(stream, ip), Err(SoundshareError::CapacityExceeded)));
        std::mem::forget(extra);
    }
}
