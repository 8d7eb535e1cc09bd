use crate::net::error::{Error, ErrorKind, NetResult};
use crate::net::shared::{EndpointId, INVALID_ENDPOINT, MAX_CLIENTS, SELECT_TIMEOUT};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol as RawProtocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Transport protocol of an endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Protocol {
    Stream,
    Datagram,
}

/// Lifecycle state of an endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SocketState {
    Uninitialized,
    Initialized,
    Bound,
    Listening,
    Connected,
}

/// A protocol-typed IPv4 network endpoint with an explicit lifecycle.
///
/// Every operation asserts its required source state and leaves the endpoint
/// unchanged when the assertion fails. The only transitions are the ones in
/// the table below; `close` is the universal way back to `Uninitialized`.
///
/// ```text
/// Uninitialized -open-> Initialized -bind-> Bound -listen-> Listening
///                       Initialized -connect-> Connected
///                       Listening -accept-> (new Connected endpoint)
///                       Connected -recv of 0 bytes-> Uninitialized
///                       any but Uninitialized -close-> Uninitialized
/// ```
#[derive(Debug)]
pub struct Endpoint {
    socket: Option<Socket>,
    protocol: Protocol,
    state: SocketState,
    addr: Option<SocketAddrV4>,
}

impl Endpoint {
    /// Creates an endpoint in the `Uninitialized` state. No OS handle is
    /// acquired until `open` is called.
    pub fn new(protocol: Protocol) -> Endpoint {
        Endpoint {
            socket: None,
            protocol,
            state: SocketState::Uninitialized,
            addr: None,
        }
    }

    /// Endpoint wrapping a freshly accepted stream socket.
    pub(crate) fn from_accept(socket: Socket, peer: SocketAddrV4) -> Endpoint {
        Endpoint {
            socket: Some(socket),
            protocol: Protocol::Stream,
            state: SocketState::Connected,
            addr: Some(peer),
        }
    }

    /// Handle-less record of a datagram sender. Owned by the packet that was
    /// decoded from the datagram.
    pub(crate) fn from_peer(addr: SocketAddrV4) -> Endpoint {
        Endpoint {
            socket: None,
            protocol: Protocol::Datagram,
            state: SocketState::Uninitialized,
            addr: Some(addr),
        }
    }

    /// Acquires the OS handle. Requires `Uninitialized`.
    pub fn open(&mut self) -> NetResult<()> {
        self.expect_state(SocketState::Uninitialized, "open")?;

        let kind = match self.protocol {
            Protocol::Stream => (Type::STREAM, RawProtocol::TCP),
            Protocol::Datagram => (Type::DGRAM, RawProtocol::UDP),
        };

        let socket = Socket::new(Domain::IPV4, kind.0, Some(kind.1)).map_err(|err| {
            Error::with_cause(ErrorKind::System, "open", "failed to acquire socket handle", err)
        })?;

        self.socket = Some(socket);
        self.state = SocketState::Initialized;
        Ok(())
    }

    /// Binds to a local address. Requires `Initialized`; `host` must be a
    /// dotted quad.
    pub fn bind(&mut self, host: &str, port: u16) -> NetResult<()> {
        self.expect_state(SocketState::Initialized, "bind")?;

        let ip: Ipv4Addr = host.parse().map_err(|err| {
            Error::with_cause(
                ErrorKind::System,
                "bind",
                format!("host {:?} is not a dotted quad address", host),
                err,
            )
        })?;
        let addr = SocketAddrV4::new(ip, port);

        // Read the address back so a port 0 bind reports the assigned port.
        let local = {
            let socket = self.raw("bind")?;
            drop(socket.set_reuse_address(true));
            socket.bind(&SockAddr::from(addr)).map_err(|err| {
                Error::with_cause(ErrorKind::BindFailed, "bind", format!("failed to bind {}", addr), err)
            })?;
            socket.local_addr().ok().and_then(|local| local.as_socket_ipv4())
        };

        self.addr = local.or(Some(addr));
        self.state = SocketState::Bound;
        Ok(())
    }

    /// Starts listening for stream connections. Requires `Bound` on a stream
    /// endpoint. The backlog equals the per-selector client capacity.
    pub fn listen(&mut self) -> NetResult<()> {
        self.expect_protocol(Protocol::Stream, "listen")?;
        self.expect_state(SocketState::Bound, "listen")?;

        self.raw("listen")?.listen(MAX_CLIENTS as i32).map_err(|err| {
            Error::with_cause(ErrorKind::ListenFailed, "listen", "failed to enter listen state", err)
        })?;

        self.state = SocketState::Listening;
        Ok(())
    }

    /// Accepts one pending stream connection. Requires `Listening`. Returns
    /// `Ok(None)` when the endpoint is non-blocking and nothing is pending.
    pub fn accept(&self) -> NetResult<Option<Endpoint>> {
        self.expect_state(SocketState::Listening, "accept")?;

        match self.raw("accept")?.accept() {
            Ok((socket, addr)) => {
                let peer = addr.as_socket_ipv4().ok_or_else(|| {
                    Error::new(ErrorKind::AcceptFailed, "accept", "peer address is not IPv4")
                })?;
                Ok(Some(Endpoint::from_accept(socket, peer)))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(Error::with_cause(
                ErrorKind::AcceptFailed,
                "accept",
                "failed to accept connection",
                err,
            )),
        }
    }

    /// Connects to a remote stream endpoint. Requires `Initialized` on a
    /// stream endpoint; `host` must be a dotted quad.
    pub fn connect(&mut self, host: &str, port: u16) -> NetResult<()> {
        self.expect_protocol(Protocol::Stream, "connect")?;
        self.expect_state(SocketState::Initialized, "connect")?;

        let ip: Ipv4Addr = host.parse().map_err(|err| {
            Error::with_cause(
                ErrorKind::System,
                "connect",
                format!("host {:?} is not a dotted quad address", host),
                err,
            )
        })?;
        let addr = SocketAddrV4::new(ip, port);

        self.raw("connect")?.connect(&SockAddr::from(addr)).map_err(|err| {
            Error::with_cause(
                ErrorKind::ConnectFailed,
                "connect",
                format!("failed to connect to {}", addr),
                err,
            )
        })?;

        self.addr = Some(addr);
        self.state = SocketState::Connected;
        Ok(())
    }

    /// Receives bytes from a connected stream endpoint. `Ok(Some(0))` means
    /// the peer closed; the endpoint drops its handle and returns to
    /// `Uninitialized`. `Ok(None)` means the endpoint is non-blocking and no
    /// data is available.
    pub fn recv(&mut self, buf: &mut [u8]) -> NetResult<Option<usize>> {
        self.expect_protocol(Protocol::Stream, "recv")?;
        self.expect_state(SocketState::Connected, "recv")?;

        loop {
            let result = recv_into(self.raw("recv")?, buf);

            return match result {
                Ok(0) => {
                    self.socket = None;
                    self.state = SocketState::Uninitialized;
                    Ok(Some(0))
                }
                Ok(count) => Ok(Some(count)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(Error::with_cause(
                    ErrorKind::RecvFailed,
                    "recv",
                    "connection read failed",
                    err,
                )),
            };
        }
    }

    /// Receives one datagram. Requires `Bound` on a datagram endpoint.
    /// Returns the length and a fresh handle-less endpoint carrying the
    /// sender's address, or `Ok(None)` when non-blocking and idle.
    pub fn recv_from(&self, buf: &mut [u8]) -> NetResult<Option<(usize, Endpoint)>> {
        self.expect_protocol(Protocol::Datagram, "recvfrom")?;
        self.expect_state(SocketState::Bound, "recvfrom")?;

        loop {
            return match recv_from_into(self.raw("recvfrom")?, buf) {
                Ok((count, addr)) => {
                    let peer = addr.as_socket_ipv4().ok_or_else(|| {
                        Error::new(ErrorKind::RecvFailed, "recvfrom", "sender address is not IPv4")
                    })?;
                    Ok(Some((count, Endpoint::from_peer(peer))))
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(Error::with_cause(
                    ErrorKind::RecvFailed,
                    "recvfrom",
                    "datagram read failed",
                    err,
                )),
            };
        }
    }

    /// Single write attempt on a connected stream endpoint. Returns the byte
    /// count, which is 0 when the endpoint is non-blocking and the socket
    /// buffer is full. Frames should go through `send_all`.
    pub fn send(&self, buf: &[u8]) -> NetResult<usize> {
        self.expect_protocol(Protocol::Stream, "send")?;
        self.expect_state(SocketState::Connected, "send")?;

        match self.raw("send")?.send(buf) {
            Ok(count) => Ok(count),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(Error::with_cause(
                ErrorKind::SendFailed,
                "send",
                "connection write failed",
                err,
            )),
        }
    }

    /// Writes the whole of `buf` to a connected stream endpoint, parking on a
    /// writability poll whenever the socket buffer is full.
    pub fn send_all(&self, buf: &[u8]) -> NetResult<()> {
        self.expect_protocol(Protocol::Stream, "send")?;
        self.expect_state(SocketState::Connected, "send")?;

        let socket = self.raw("send")?;
        let mut offset = 0;

        while offset < buf.len() {
            match socket.send(&buf[offset..]) {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::SendFailed,
                        "send",
                        "connection write returned zero bytes",
                    ))
                }
                Ok(count) => offset += count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_writable(SELECT_TIMEOUT).map_err(|err| {
                        Error::with_cause(
                            ErrorKind::SendFailed,
                            "send",
                            "failed to wait for writability",
                            err,
                        )
                    })?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(Error::with_cause(
                        ErrorKind::SendFailed,
                        "send",
                        format!("connection write failed after {} bytes", offset),
                        err,
                    ))
                }
            }
        }

        Ok(())
    }

    /// Sends one datagram to `dst`. Requires `Bound` on a datagram endpoint.
    pub fn send_to(&self, buf: &[u8], dst: SocketAddrV4) -> NetResult<usize> {
        self.expect_protocol(Protocol::Datagram, "sendto")?;
        self.expect_state(SocketState::Bound, "sendto")?;

        let socket = self.raw("sendto")?;

        loop {
            return match socket.send_to(buf, &SockAddr::from(dst)) {
                Ok(count) => Ok(count),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_writable(SELECT_TIMEOUT).map_err(|err| {
                        Error::with_cause(
                            ErrorKind::SendFailed,
                            "sendto",
                            "failed to wait for writability",
                            err,
                        )
                    })?;
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(Error::with_cause(
                    ErrorKind::SendFailed,
                    "sendto",
                    format!("datagram write to {} failed", dst),
                    err,
                )),
            };
        }
    }

    /// Disables reads, writes or both at the transport. Requires any state
    /// but `Uninitialized`.
    pub fn shutdown(&self, how: Shutdown) -> NetResult<()> {
        if self.state == SocketState::Uninitialized {
            return Err(Error::new(
                ErrorKind::State,
                "shutdown",
                "endpoint is uninitialized",
            ));
        }

        self.raw("shutdown")?.shutdown(how).map_err(|err| {
            Error::with_cause(
                ErrorKind::ShutdownFailed,
                "shutdown",
                "transport shutdown failed",
                err,
            )
        })
    }

    /// Releases the OS handle and returns to `Uninitialized`. The transport
    /// is shut down first, so a broken socket surfaces as `CloseFailed`
    /// instead of being dropped silently; the handle is released and the
    /// state reset either way. Calling close on an already uninitialized
    /// endpoint is an error.
    pub fn close(&mut self) -> NetResult<()> {
        if self.state == SocketState::Uninitialized {
            return Err(Error::new(ErrorKind::State, "close", "endpoint is uninitialized"));
        }

        let result = match self.socket.take() {
            Some(socket) => match socket.shutdown(Shutdown::Both) {
                Ok(()) => Ok(()),
                // Never-connected and already-gone endpoints have nothing to
                // shut down.
                Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
                Err(err) => Err(Error::with_cause(
                    ErrorKind::CloseFailed,
                    "close",
                    "transport shutdown during close failed",
                    err,
                )),
            },
            None => Ok(()),
        };

        self.state = SocketState::Uninitialized;
        result
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        self.state
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Local address for bound endpoints, peer address for connected ones and
    /// sender address for datagram source records.
    #[inline]
    pub fn addr(&self) -> Option<SocketAddrV4> {
        self.addr
    }

    #[inline]
    pub fn host(&self) -> Option<Ipv4Addr> {
        self.addr.map(|addr| *addr.ip())
    }

    #[inline]
    pub fn port(&self) -> Option<u16> {
        self.addr.map(|addr| addr.port())
    }

    /// Identity of the endpoint: its OS handle, or `INVALID_ENDPOINT` when no
    /// handle is held.
    #[inline]
    pub fn id(&self) -> EndpointId {
        match &self.socket {
            Some(socket) => socket.as_raw_fd(),
            None => INVALID_ENDPOINT,
        }
    }

    /// Clones the handle into a mio stream for poll registration. The clone
    /// shares the one underlying socket, so readiness tracks this endpoint.
    pub(crate) fn poll_stream(&self) -> NetResult<TcpStream> {
        let clone = self.clone_raw("register")?;
        Ok(TcpStream::from_std(clone.into()))
    }

    pub(crate) fn poll_listener(&self) -> NetResult<TcpListener> {
        let clone = self.clone_raw("register")?;
        Ok(TcpListener::from_std(clone.into()))
    }

    pub(crate) fn poll_datagram(&self) -> NetResult<UdpSocket> {
        let clone = self.clone_raw("register")?;
        Ok(UdpSocket::from_std(clone.into()))
    }

    fn clone_raw(&self, op: &'static str) -> NetResult<Socket> {
        self.raw(op)?.try_clone().map_err(|err| {
            Error::with_cause(ErrorKind::System, op, "failed to clone socket handle", err)
        })
    }

    /// Parks the calling thread on a transient poll until the socket is
    /// writable or the timeout elapses. Used when a non-blocking send hits a
    /// full socket buffer.
    fn wait_writable(&self, timeout: Duration) -> io::Result<()> {
        let socket = match &self.socket {
            Some(socket) => socket.try_clone()?,
            None => return Ok(()),
        };

        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(1);

        match self.protocol {
            Protocol::Stream => {
                let mut source = TcpStream::from_std(socket.into());
                poll.registry().register(&mut source, Token(0), Interest::WRITABLE)?;
                poll.poll(&mut events, Some(timeout))?;
            }
            Protocol::Datagram => {
                let mut source = UdpSocket::from_std(socket.into());
                poll.registry().register(&mut source, Token(0), Interest::WRITABLE)?;
                poll.poll(&mut events, Some(timeout))?;
            }
        }

        Ok(())
    }

    pub(crate) fn set_nonblocking(&self, on: bool) -> NetResult<()> {
        self.raw("set_nonblocking")?.set_nonblocking(on).map_err(|err| {
            Error::with_cause(
                ErrorKind::System,
                "set_nonblocking",
                "failed to change blocking mode",
                err,
            )
        })
    }

    fn raw(&self, op: &'static str) -> NetResult<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::State, op, "endpoint holds no socket handle"))
    }

    fn expect_state(&self, required: SocketState, op: &'static str) -> NetResult<()> {
        if self.state != required {
            return Err(Error::new(
                ErrorKind::State,
                op,
                format!("requires a {:?} endpoint, state is {:?}", required, self.state),
            ));
        }
        Ok(())
    }

    fn expect_protocol(&self, required: Protocol, op: &'static str) -> NetResult<()> {
        if self.protocol != required {
            return Err(Error::new(
                ErrorKind::ProtocolMismatch,
                op,
                format!("requires a {:?} endpoint, protocol is {:?}", required, self.protocol),
            ));
        }
        Ok(())
    }
}

/// Raw reads for the reassembly buffer: no state bookkeeping, end of stream
/// surfaces as `Ok(0)` like any other reader.
impl<'a> io::Read for &'a Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.socket {
            Some(socket) => recv_into(socket, buf),
            None => Ok(0),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} endpoint", self.protocol)?;
        if let Some(addr) = self.addr {
            write!(f, " {}", addr)?;
        }
        write!(f, " ({:?}, id {})", self.state, self.id())
    }
}

// socket2 takes `MaybeUninit` buffers; handing it an initialized view is
// sound because it only ever writes into the slice.
fn recv_into(socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv(uninit)
}

fn recv_from_into(socket: &Socket, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv_from(uninit)
}
