//! UDP transport.
//!
//! The state publisher binds the state port and sends every record to the
//! peers that subscribed with a `sub` datagram within the subscriber TTL.
//! The command receiver binds the command port and accepts datagrams from
//! anyone. Receivers drain the socket and keep the newest datagram.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::{ChannelClient, ChannelServer, Inbox, Outbox, Wait};

/// Payload a client sends to (re)subscribe to state records.
pub const SUBSCRIBE: &[u8] = b"sub";
const MAX_DATAGRAM: usize = 1024;
/// Slice used for `Wait::Forever` so subscriptions can be refreshed.
const FOREVER_SLICE: Duration = Duration::from_millis(500);

/// `*` binds every interface.
fn bind_host(host: &str) -> &str {
    if host == "*" { "0.0.0.0" } else { host }
}

/// Resolve `host`, preferring IPv4 since the server binds IPv4 by default.
fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{host}:{port} did not resolve"),
            )
        })
}

fn is_empty_read(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused
    )
}

/// Read every pending datagram without blocking; return the newest.
fn drain(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Option<String>> {
    socket.set_nonblocking(true)?;
    let mut newest = None;
    loop {
        match socket.recv_from(buf) {
            Ok((n, _)) => newest = Some(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Err(e) if is_empty_read(&e) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(newest)
}

/// Block up to `d` for a first datagram, then drain to the newest.
fn recv_within(socket: &UdpSocket, buf: &mut [u8], d: Duration) -> io::Result<Option<String>> {
    let deadline = Instant::now() + d;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return drain(socket, buf);
        }
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(remaining))?;
        match socket.recv_from(buf) {
            Ok((n, _)) => {
                let first = String::from_utf8_lossy(&buf[..n]).into_owned();
                return Ok(Some(drain(socket, buf)?.unwrap_or(first)));
            }
            // A refused connected socket returns at once; keep waiting.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                std::thread::sleep(remaining.min(Duration::from_millis(10)));
            }
            Err(e) if is_empty_read(&e) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

pub struct UdpStatePublisher {
    socket: UdpSocket,
    subscribers: HashMap<SocketAddr, Instant>,
    ttl: Duration,
    buf: Vec<u8>,
}

impl UdpStatePublisher {
    pub fn bind(addr: SocketAddr, ttl: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        tracing::debug!(%addr, "state publisher bound");
        Ok(Self {
            socket,
            subscribers: HashMap::new(),
            ttl,
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn refresh_subscribers(&mut self) {
        let now = Instant::now();
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((n, from)) if &self.buf[..n] == SUBSCRIBE => {
                    if self.subscribers.insert(from, now).is_none() {
                        tracing::info!(%from, "state subscriber joined");
                    }
                }
                Ok((_, from)) => tracing::debug!(%from, "ignoring datagram on state port"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP errors from departed subscribers surface here on some platforms.
                Err(e) => {
                    tracing::trace!(error = %e, "state port receive error");
                    break;
                }
            }
        }
        let ttl = self.ttl;
        self.subscribers.retain(|from, seen| {
            let keep = now.saturating_duration_since(*seen) <= ttl;
            if !keep {
                tracing::info!(%from, "state subscriber expired");
            }
            keep
        });
    }
}

impl Outbox for UdpStatePublisher {
    fn send_latest(&mut self, record: &str) -> io::Result<()> {
        self.refresh_subscribers();
        for to in self.subscribers.keys() {
            match self.socket.send_to(record.as_bytes(), to) {
                Ok(_) => {}
                // A full socket buffer drops the record; the next one replaces it.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => tracing::debug!(%to, error = %e, "state send failed"),
            }
        }
        Ok(())
    }
}

pub struct UdpStateSubscriber {
    socket: UdpSocket,
    last_subscribe: Option<Instant>,
    resubscribe_every: Duration,
    buf: Vec<u8>,
}

impl UdpStateSubscriber {
    /// Subscribe to the publisher at `server`, renewing every `resubscribe_every`.
    pub fn connect(server: SocketAddr, resubscribe_every: Duration) -> io::Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(server)?;
        let mut me = Self {
            socket,
            last_subscribe: None,
            resubscribe_every,
            buf: vec![0; MAX_DATAGRAM],
        };
        me.subscribe_if_due();
        Ok(me)
    }

    fn subscribe_if_due(&mut self) {
        let due = self
            .last_subscribe
            .is_none_or(|t| t.elapsed() >= self.resubscribe_every);
        if !due {
            return;
        }
        match self.socket.send(SUBSCRIBE) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
            Err(e) => tracing::debug!(error = %e, "subscribe failed"),
        }
        self.last_subscribe = Some(Instant::now());
    }
}

impl Inbox for UdpStateSubscriber {
    fn recv_latest(&mut self, wait: Wait) -> io::Result<Option<String>> {
        self.subscribe_if_due();
        match wait {
            Wait::NonBlocking => drain(&self.socket, &mut self.buf),
            Wait::For(d) => {
                // Slice the wait so a subscription lost before the server
                // came up is renewed in time.
                let deadline = Instant::now() + d;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let slice = remaining.min(self.resubscribe_every.max(FOREVER_SLICE / 5));
                    let got = recv_within(&self.socket, &mut self.buf, slice)?;
                    if got.is_some() || remaining <= slice {
                        return Ok(got);
                    }
                    self.subscribe_if_due();
                }
            }
            Wait::Forever => loop {
                if let Some(r) = recv_within(&self.socket, &mut self.buf, FOREVER_SLICE)? {
                    return Ok(Some(r));
                }
                self.subscribe_if_due();
            },
        }
    }
}

pub struct UdpCommandReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpCommandReceiver {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        tracing::debug!(%addr, "command receiver bound");
        Ok(Self {
            socket,
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Inbox for UdpCommandReceiver {
    fn recv_latest(&mut self, wait: Wait) -> io::Result<Option<String>> {
        match wait {
            Wait::NonBlocking => drain(&self.socket, &mut self.buf),
            Wait::For(d) => recv_within(&self.socket, &mut self.buf, d),
            Wait::Forever => loop {
                if let Some(r) = recv_within(&self.socket, &mut self.buf, FOREVER_SLICE)? {
                    return Ok(Some(r));
                }
            },
        }
    }
}

pub struct UdpCommandSender {
    socket: UdpSocket,
}

impl UdpCommandSender {
    pub fn connect(server: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(server)?;
        Ok(Self { socket })
    }
}

impl Outbox for UdpCommandSender {
    fn send_latest(&mut self, record: &str) -> io::Result<()> {
        match self.socket.send(record.as_bytes()) {
            Ok(_) => Ok(()),
            // Nobody listening yet; commands are fire-and-forget.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub type UdpServer = ChannelServer<UdpStatePublisher, UdpCommandReceiver>;
pub type UdpClient = ChannelClient<UdpCommandSender, UdpStateSubscriber>;

/// Bind both server sockets on `host`.
pub fn bind_server(
    host: &str,
    state_port: u16,
    command_port: u16,
    subscriber_ttl: Duration,
) -> io::Result<UdpServer> {
    let host = bind_host(host);
    let state = UdpStatePublisher::bind(resolve(host, state_port)?, subscriber_ttl)?;
    let command = UdpCommandReceiver::bind(resolve(host, command_port)?)?;
    tracing::info!(host, state_port, command_port, "channel server listening");
    Ok(ChannelServer::new(state, command))
}

/// Connect a client to a server on `host`. Subscriptions are renewed at a
/// third of `subscriber_ttl`.
pub fn connect_client(
    host: &str,
    state_port: u16,
    command_port: u16,
    subscriber_ttl: Duration,
) -> io::Result<UdpClient> {
    let state = UdpStateSubscriber::connect(resolve(host, state_port)?, subscriber_ttl / 3)?;
    let command = UdpCommandSender::connect(resolve(host, command_port)?)?;
    Ok(ChannelClient::new(command, state))
}
