use crate::logging;
use crate::net::error::{Error, ErrorKind, NetResult};
use crate::net::inbox::PacketInbox;
use crate::net::packet::{Packet, PacketSource};
use crate::net::registry::PacketRegistry;
use crate::net::selector::{Admission, Selector};
use crate::net::shared::{EndpointId, MAX_DGRAM, SELECT_TIMEOUT};
use crate::net::socket::{Endpoint, Protocol};
use mio::{Events, Interest, Poll, Token};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Listen address of a server, deserializable from application config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

struct Shared {
    listener: Mutex<Endpoint>,
    datagram: Mutex<Endpoint>,
    selectors: Mutex<Vec<Arc<Selector>>>,
    running: AtomicBool,
    initialized: AtomicBool,
    inbox: Arc<PacketInbox>,
    packets: Arc<PacketRegistry>,
    log: logging::Logger,
}

/// The server automation: one listening stream endpoint and one bound
/// datagram endpoint on the same address, an accept thread that spreads new
/// peers across selectors, and a datagram thread feeding the same inbox.
///
/// Threads are terminated by flipping the running flag; every loop waits on
/// its poll for at most 100 ms, so `stop` joins within one quantum.
pub struct Server {
    shared: Arc<Shared>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
    datagram_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        packets: Arc<PacketRegistry>,
        log: L,
    ) -> Server {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "server")),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Server {
            shared: Arc::new(Shared {
                listener: Mutex::new(Endpoint::new(Protocol::Stream)),
                datagram: Mutex::new(Endpoint::new(Protocol::Datagram)),
                selectors: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                inbox: Arc::new(PacketInbox::new()),
                packets,
                log,
            }),
            accept_thread: Mutex::new(None),
            datagram_thread: Mutex::new(None),
        }
    }

    /// The inbox every decoded packet and session synthetic lands in.
    pub fn inbox(&self) -> Arc<PacketInbox> {
        self.shared.inbox.clone()
    }

    /// Address the server listens on; for a port 0 init this reports the
    /// assigned port.
    pub fn addr(&self) -> Option<SocketAddrV4> {
        self.shared.listener.lock().expect("server listener mutex poisoned").addr()
    }

    /// Opens and binds the stream and datagram endpoints on the same
    /// address and puts the stream endpoint into the listening state.
    pub fn init(&self, host: &str, port: u16) -> NetResult<()> {
        if self.shared.initialized.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::State, "init", "server is already initialized"));
        }

        let addr = {
            let mut listener = self.shared.listener.lock().expect("server listener mutex poisoned");
            listener.open()?;
            listener.bind(host, port)?;
            listener.listen()?;
            listener.set_nonblocking(true)?;
            listener.addr()
        };

        {
            let mut datagram = self.shared.datagram.lock().expect("server datagram mutex poisoned");
            datagram.open()?;
            datagram.bind(host, addr.map(|addr| addr.port()).unwrap_or(port))?;
            datagram.set_nonblocking(true)?;
        }

        self.shared.initialized.store(true, Ordering::Release);

        logging::info!(self.shared.log, "server initialized";
                       "host" => host, "port" => addr.map(|addr| addr.port()).unwrap_or(port));
        Ok(())
    }

    pub fn init_config(&self, config: &ServerConfig) -> NetResult<()> {
        self.init(&config.host, config.port)
    }

    /// Spawns the accept and datagram threads.
    pub fn start(&self) -> NetResult<()> {
        if !self.shared.initialized.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::State, "start", "server is not initialized"));
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(Error::new(
                ErrorKind::ServerRunning,
                "start",
                "server is already running",
            ));
        }

        // On restart, revive the selectors that still hold peers.
        {
            let mut selectors = self.shared.selectors.lock().expect("server selectors mutex poisoned");
            selectors.retain(|selector| selector.running() || !selector.is_empty());

            for selector in selectors.iter() {
                if !selector.running() {
                    if let Err(err) = selector.start() {
                        logging::warn!(self.shared.log, "failed to restart selector"; "error" => %err);
                    }
                }
            }
        }

        let shared = self.shared.clone();
        let accept = thread::Builder::new()
            .name("server-accept".to_string())
            .spawn(move || accept_loop(shared));

        let accept = match accept {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(Error::with_cause(
                    ErrorKind::System,
                    "start",
                    "failed to spawn accept thread",
                    err,
                ));
            }
        };

        let shared = self.shared.clone();
        let datagram = thread::Builder::new()
            .name("server-datagram".to_string())
            .spawn(move || datagram_loop(shared));

        let datagram = match datagram {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                drop(accept.join());
                return Err(Error::with_cause(
                    ErrorKind::System,
                    "start",
                    "failed to spawn datagram thread",
                    err,
                ));
            }
        };

        *self.accept_thread.lock().expect("server accept mutex poisoned") = Some(accept);
        *self.datagram_thread.lock().expect("server datagram thread mutex poisoned") = Some(datagram);

        logging::info!(self.shared.log, "server started");
        Ok(())
    }

    /// Signals both loops, joins them and stops every selector.
    pub fn stop(&self) -> NetResult<()> {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::ServerStopped, "stop", "server is not running"));
        }

        if let Some(handle) = self.accept_thread.lock().expect("server accept mutex poisoned").take() {
            drop(handle.join());
        }
        if let Some(handle) = self
            .datagram_thread
            .lock()
            .expect("server datagram thread mutex poisoned")
            .take()
        {
            drop(handle.join());
        }

        let selectors = self.shared.selectors.lock().expect("server selectors mutex poisoned");
        for selector in selectors.iter() {
            drop(selector.stop());
        }

        logging::info!(self.shared.log, "server stopped");
        Ok(())
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Places a connected stream endpoint into a selector, growing the pool
    /// when every selector is full.
    pub fn add_client(&self, endpoint: Endpoint) -> NetResult<()> {
        add_client_shared(&self.shared, endpoint)
    }

    /// Sends the packet to every stream peer exactly once.
    pub fn broadcast(&self, packet: &dyn Packet) -> NetResult<()> {
        let frame = packet.encode()?;

        let snapshot: Vec<Arc<Selector>> = self
            .shared
            .selectors
            .lock()
            .expect("server selectors mutex poisoned")
            .clone();

        for selector in snapshot {
            selector.broadcast_frame(&frame);
        }

        Ok(())
    }

    /// Sends the packet to the one stream peer with the given endpoint id.
    /// Returns false when no selector manages that peer.
    pub fn send_to(&self, id: EndpointId, packet: &dyn Packet) -> NetResult<bool> {
        let frame = packet.encode()?;

        let snapshot: Vec<Arc<Selector>> = self
            .shared
            .selectors
            .lock()
            .expect("server selectors mutex poisoned")
            .clone();

        for selector in snapshot {
            if selector.send_frame_to(id, &frame)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Sends the packet as a single datagram from the server's datagram
    /// endpoint.
    pub fn send_datagram(&self, packet: &dyn Packet, dst: SocketAddrV4) -> NetResult<()> {
        let frame = packet.encode()?;

        if frame.len() > MAX_DGRAM {
            return Err(Error::new(
                ErrorKind::OutOfRange,
                "sendto",
                format!("frame of {} bytes exceeds the datagram limit", frame.len()),
            ));
        }

        let sent = self
            .shared
            .datagram
            .lock()
            .expect("server datagram mutex poisoned")
            .send_to(&frame, dst)?;

        if sent < frame.len() {
            return Err(Error::new(
                ErrorKind::Truncated,
                "sendto",
                format!("sent {} of {} bytes", sent, frame.len()),
            ));
        }

        Ok(())
    }

    /// Number of live selectors.
    pub fn selector_count(&self) -> usize {
        self.shared.selectors.lock().expect("server selectors mutex poisoned").len()
    }

    /// Number of stream peers across all selectors.
    pub fn peer_count(&self) -> usize {
        self.shared
            .selectors
            .lock()
            .expect("server selectors mutex poisoned")
            .iter()
            .map(|selector| selector.len())
            .sum()
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "server")?;
        if let Some(addr) = self.addr() {
            write!(f, " {}", addr)?;
        }
        write!(
            f,
            ": {}, {} selectors, {} peers",
            if self.running() { "running" } else { "stopped" },
            self.selector_count(),
            self.peer_count()
        )
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.running() {
            drop(self.stop());
        }
    }
}

fn add_client_shared(shared: &Arc<Shared>, endpoint: Endpoint) -> NetResult<()> {
    let mut selectors = shared.selectors.lock().expect("server selectors mutex poisoned");

    // Selectors whose last peer left have stopped themselves; drop them.
    selectors.retain(|selector| selector.running() || !selector.is_empty());

    let mut endpoint = Some(endpoint);

    for selector in selectors.iter() {
        match selector.add_client(endpoint.take().expect("endpoint already admitted"))? {
            Admission::Accepted => return Ok(()),
            Admission::Full(refused) => endpoint = Some(refused),
        }
    }

    let selector = Arc::new(Selector::new(
        shared.packets.clone(),
        shared.inbox.clone(),
        &shared.log,
    )?);

    match selector.add_client(endpoint.take().expect("endpoint already admitted"))? {
        Admission::Accepted => {}
        Admission::Full(_) => {
            return Err(Error::new(
                ErrorKind::System,
                "add_client",
                "fresh selector refused a peer",
            ))
        }
    }

    selector.start()?;
    selectors.push(selector);

    logging::info!(shared.log, "selector pool grew"; "selectors" => selectors.len());
    Ok(())
}

fn accept_loop(shared: Arc<Shared>) {
    let mut registration = {
        let listener = shared.listener.lock().expect("server listener mutex poisoned");
        match listener.poll_listener() {
            Ok(registration) => registration,
            Err(err) => {
                logging::error!(shared.log, "accept loop failed to clone listener"; "error" => %err);
                return;
            }
        }
    };

    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            logging::error!(shared.log, "accept loop failed to create poll"; "error" => %err);
            return;
        }
    };
    if let Err(err) = poll
        .registry()
        .register(&mut registration, Token(0), Interest::READABLE)
    {
        logging::error!(shared.log, "accept loop failed to register listener"; "error" => %err);
        return;
    }

    let mut events = Events::with_capacity(8);

    logging::debug!(shared.log, "accept thread running");

    while shared.running.load(Ordering::Acquire) {
        if let Err(err) = poll.poll(&mut events, Some(SELECT_TIMEOUT)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            logging::error!(shared.log, "accept poll failed, stopping accept loop"; "error" => %err);
            return;
        }

        loop {
            let accepted = {
                let listener = shared.listener.lock().expect("server listener mutex poisoned");
                listener.accept()
            };

            match accepted {
                Ok(Some(endpoint)) => {
                    logging::info!(shared.log, "accepted stream peer"; "peer" => %endpoint);
                    if let Err(err) = add_client_shared(&shared, endpoint) {
                        logging::warn!(shared.log, "failed to admit peer"; "error" => %err);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    logging::error!(shared.log, "accept failed, stopping accept loop"; "error" => %err);
                    return;
                }
            }
        }
    }

    logging::debug!(shared.log, "accept thread exited");
}

fn datagram_loop(shared: Arc<Shared>) {
    let mut registration = {
        let datagram = shared.datagram.lock().expect("server datagram mutex poisoned");
        match datagram.poll_datagram() {
            Ok(registration) => registration,
            Err(err) => {
                logging::error!(shared.log, "datagram loop failed to clone endpoint"; "error" => %err);
                return;
            }
        }
    };

    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            logging::error!(shared.log, "datagram loop failed to create poll"; "error" => %err);
            return;
        }
    };
    if let Err(err) = poll
        .registry()
        .register(&mut registration, Token(0), Interest::READABLE)
    {
        logging::error!(shared.log, "datagram loop failed to register endpoint"; "error" => %err);
        return;
    }

    let mut events = Events::with_capacity(8);
    let mut buf = vec![0u8; MAX_DGRAM];

    logging::debug!(shared.log, "datagram thread running");

    while shared.running.load(Ordering::Acquire) {
        if let Err(err) = poll.poll(&mut events, Some(SELECT_TIMEOUT)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            logging::error!(shared.log, "datagram poll failed, stopping datagram loop"; "error" => %err);
            return;
        }

        loop {
            let received = {
                let datagram = shared.datagram.lock().expect("server datagram mutex poisoned");
                datagram.recv_from(&mut buf)
            };

            match received {
                Ok(Some((len, sender))) => {
                    let source = PacketSource::from_endpoint(&sender);

                    match shared.packets.decode_datagram(&buf[..len], source) {
                        Ok(packet) => {
                            logging::trace!(shared.log, "datagram decoded";
                                            "peer" => %source, "tag" => packet.tag());
                            shared.inbox.push(packet);
                        }
                        Err(err) => {
                            logging::warn!(shared.log, "dropping undecodable datagram";
                                           "peer" => %source, "error" => %err);
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    logging::error!(shared.log, "datagram read failed, stopping datagram loop";
                                    "error" => %err);
                    return;
                }
            }
        }
    }

    logging::debug!(shared.log, "datagram thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::client::Client;
    use crate::net::packet::{
        Progress, RawBytes, TypeTag, TAG_CONNECT, TAG_DISCONNECT, TAG_RAW_BYTES,
    };
    use byteorder::{LittleEndian, ReadBytesExt};
    use std::any::Any;
    use std::io::{Cursor, Read};
    use std::time::{Duration, Instant};

    fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn started_server(packets: Arc<PacketRegistry>) -> (Server, SocketAddrV4) {
        let server = Server::new(packets, None);
        server.init("127.0.0.1", 0).unwrap();
        server.start().unwrap();
        let addr = server.addr().unwrap();
        (server, addr)
    }

    fn detached() -> PacketSource {
        PacketSource::detached(Protocol::Stream)
    }

    #[test]
    fn test_lifecycle_guards() {
        let server = Server::new(Arc::new(PacketRegistry::new()), None);

        assert_eq!(server.start().unwrap_err().kind(), ErrorKind::State);
        assert_eq!(server.stop().unwrap_err().kind(), ErrorKind::ServerStopped);

        server.init("127.0.0.1", 0).unwrap();
        assert_eq!(server.init("127.0.0.1", 0).unwrap_err().kind(), ErrorKind::State);

        server.start().unwrap();
        assert_eq!(server.start().unwrap_err().kind(), ErrorKind::ServerRunning);
        assert!(server.running());

        server.stop().unwrap();
        assert!(!server.running());
        assert_eq!(server.stop().unwrap_err().kind(), ErrorKind::ServerStopped);
    }

    #[test]
    fn test_config_roundtrip() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"host": "127.0.0.1", "port": 0}"#).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 0);

        let server = Server::new(Arc::new(PacketRegistry::new()), None);
        server.init_config(&config).unwrap();

        assert!(server.addr().unwrap().port() != 0);
    }

    #[test]
    fn test_echo_one_client() {
        // S1: stream echo through broadcast, both inboxes see the session.
        let packets = Arc::new(PacketRegistry::new());
        let (server, addr) = started_server(packets.clone());
        let server_inbox = server.inbox();

        let client = Client::new(packets, None);
        client.init("127.0.0.1", addr.port()).unwrap();
        client.start().unwrap();
        let client_inbox = client.inbox();

        assert!(wait_until(|| server_inbox.len() >= 1, Duration::from_secs(5)));
        let connect = server_inbox.pop().unwrap();
        assert_eq!(connect.tag(), TAG_CONNECT);
        let peer_id = connect.source().id();

        client.send(&RawBytes::new(detached(), b"hello".to_vec())).unwrap();

        assert!(wait_until(|| server_inbox.len() >= 1, Duration::from_secs(5)));
        let packet = server_inbox.pop().unwrap();
        assert_eq!(packet.source().id(), peer_id);
        let raw = packet.as_any().downcast_ref::<RawBytes>().unwrap();
        assert_eq!(raw.data(), b"hello");

        server.broadcast(&*packet).unwrap();

        assert!(wait_until(|| client_inbox.len() >= 2, Duration::from_secs(5)));
        assert_eq!(client_inbox.pop().unwrap().tag(), TAG_CONNECT);
        let echoed = client_inbox.pop().unwrap();
        let raw = echoed.as_any().downcast_ref::<RawBytes>().unwrap();
        assert_eq!(raw.data(), b"hello");

        // A targeted reply reaches only that peer.
        let reply = RawBytes::new(detached(), b"just you".to_vec());
        assert!(server.send_to(peer_id, &reply).unwrap());
        assert!(!server.send_to(peer_id.wrapping_add(1000), &reply).unwrap());

        assert!(wait_until(|| client_inbox.len() >= 1, Duration::from_secs(5)));
        let targeted = client_inbox.pop().unwrap();
        let raw = targeted.as_any().downcast_ref::<RawBytes>().unwrap();
        assert_eq!(raw.data(), b"just you");

        client.stop().unwrap();
        server.stop().unwrap();
    }

    #[test]
    fn test_peer_close_disconnects_within_quantum() {
        // S2: closing the client produces a Disconnect and empties the pool.
        let packets = Arc::new(PacketRegistry::new());
        let (server, addr) = started_server(packets.clone());
        let server_inbox = server.inbox();

        let client = Client::new(packets, None);
        client.init("127.0.0.1", addr.port()).unwrap();
        client.start().unwrap();

        assert!(wait_until(|| server_inbox.len() >= 1, Duration::from_secs(5)));
        let connect = server_inbox.pop().unwrap();
        let peer_id = connect.source().id();

        client.stop().unwrap();

        assert!(wait_until(|| server_inbox.len() >= 1, Duration::from_secs(2)));
        let disconnect = server_inbox.pop().unwrap();
        assert_eq!(disconnect.tag(), TAG_DISCONNECT);
        assert_eq!(disconnect.source().id(), peer_id);

        assert!(wait_until(|| server.peer_count() == 0, Duration::from_secs(2)));

        server.stop().unwrap();
    }

    #[test]
    fn test_capacity_spill_grows_selector_pool() {
        // S3, scaled to 70 peers: exactly two selectors, seventy Connects.
        let packets = Arc::new(PacketRegistry::new());
        let (server, addr) = started_server(packets.clone());
        let server_inbox = server.inbox();

        let mut connectors = Vec::new();
        for _ in 0..70 {
            let mut connector = Endpoint::new(Protocol::Stream);
            connector.open().unwrap();
            connector.connect("127.0.0.1", addr.port()).unwrap();
            connectors.push(connector);
        }

        assert!(wait_until(|| server_inbox.len() >= 70, Duration::from_secs(10)));
        assert_eq!(server.peer_count(), 70);
        assert_eq!(server.selector_count(), 2);

        let mut connects = 0;
        while let Some(packet) = server_inbox.pop() {
            assert_eq!(packet.tag(), TAG_CONNECT);
            connects += 1;
        }
        assert_eq!(connects, 70);

        server.stop().unwrap();
    }

    #[test]
    fn test_datagram_ping_carries_sender_address() {
        // S4: one RawBytes datagram, source records the sender's address.
        let packets = Arc::new(PacketRegistry::new());
        let (server, addr) = started_server(packets.clone());
        let server_inbox = server.inbox();

        let mut sender = Endpoint::new(Protocol::Datagram);
        sender.open().unwrap();
        sender.bind("127.0.0.1", 0).unwrap();

        let frame = RawBytes::new(PacketSource::detached(Protocol::Datagram), b"PING".to_vec())
            .encode()
            .unwrap();
        sender.send_to(&frame, addr).unwrap();

        assert!(wait_until(|| server_inbox.len() >= 1, Duration::from_secs(5)));

        let packet = server_inbox.pop().unwrap();
        assert_eq!(packet.tag(), TAG_RAW_BYTES);
        assert_eq!(packet.source().protocol(), Protocol::Datagram);
        assert_eq!(packet.source().addr(), sender.addr());

        let raw = packet.as_any().downcast_ref::<RawBytes>().unwrap();
        assert_eq!(raw.data(), b"PING");

        // Datagrams synthesize no session packets.
        assert!(server_inbox.is_empty());

        server.stop().unwrap();
    }

    #[test]
    fn test_server_replies_over_datagram() {
        let packets = Arc::new(PacketRegistry::new());
        let (server, addr) = started_server(packets.clone());
        let server_inbox = server.inbox();

        let mut sender = Endpoint::new(Protocol::Datagram);
        sender.open().unwrap();
        sender.bind("127.0.0.1", 0).unwrap();

        let frame = RawBytes::new(PacketSource::detached(Protocol::Datagram), b"PING".to_vec())
            .encode()
            .unwrap();
        sender.send_to(&frame, addr).unwrap();

        assert!(wait_until(|| server_inbox.len() >= 1, Duration::from_secs(5)));
        let packet = server_inbox.pop().unwrap();
        let reply_to = packet.source().addr().unwrap();

        server
            .send_datagram(
                &RawBytes::new(PacketSource::detached(Protocol::Datagram), b"PONG".to_vec()),
                reply_to,
            )
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = sender.recv_from(&mut buf).unwrap().unwrap();

        assert_eq!(from.addr(), server.shared.datagram.lock().unwrap().addr());
        assert_eq!(&buf[..2], &[0x02, 0x00]);
        assert_eq!(&buf[6..len], b"PONG");

        server.stop().unwrap();
    }

    // Two-length-prefixed string pair, the chat demo's custom variant.
    #[derive(Debug)]
    struct ChatMessage {
        source: PacketSource,
        from: String,
        text: String,
    }

    const TAG_CHAT: TypeTag = 0x1001;

    impl ChatMessage {
        fn new(from: &str, text: &str) -> ChatMessage {
            ChatMessage {
                source: PacketSource::detached(Protocol::Stream),
                from: from.to_string(),
                text: text.to_string(),
            }
        }

        fn read_string(frame: &mut Cursor<&[u8]>) -> NetResult<Option<String>> {
            let remaining = frame.get_ref().len() - frame.position() as usize;
            if remaining < 4 {
                return Ok(None);
            }

            let len = frame.read_i32::<LittleEndian>().map_err(|err| {
                Error::with_cause(ErrorKind::Truncated, "decode", "failed to read string length", err)
            })?;
            if len < 0 {
                return Err(Error::new(ErrorKind::OutOfRange, "decode", "negative string length"));
            }
            let len = len as usize;

            let remaining = frame.get_ref().len() - frame.position() as usize;
            if remaining < len {
                return Ok(None);
            }

            let mut bytes = vec![0u8; len];
            frame.read_exact(&mut bytes).map_err(|err| {
                Error::with_cause(ErrorKind::Truncated, "decode", "failed to read string bytes", err)
            })?;

            String::from_utf8(bytes)
                .map(Some)
                .map_err(|err| Error::with_cause(ErrorKind::Truncated, "decode", "string is not UTF-8", err))
        }
    }

    impl Packet for ChatMessage {
        fn tag(&self) -> TypeTag {
            TAG_CHAT
        }

        fn source(&self) -> PacketSource {
            self.source
        }

        fn decode_stream(&mut self, frame: &mut Cursor<&[u8]>) -> NetResult<Progress> {
            let from = match Self::read_string(frame)? {
                Some(from) => from,
                None => return Ok(Progress::Incomplete),
            };
            let text = match Self::read_string(frame)? {
                Some(text) => text,
                None => return Ok(Progress::Incomplete),
            };

            self.from = from;
            self.text = text;
            Ok(Progress::Complete)
        }

        fn decode_payload(&mut self, payload: &[u8]) -> NetResult<()> {
            let mut frame = Cursor::new(payload);

            match self.decode_stream(&mut frame)? {
                Progress::Complete if frame.position() as usize == payload.len() => Ok(()),
                _ => Err(Error::new(
                    ErrorKind::Truncated,
                    "decode",
                    "datagram does not hold exactly one chat message",
                )),
            }
        }

        fn encode_payload(&self, frame: &mut Vec<u8>) -> NetResult<()> {
            for field in &[&self.from, &self.text] {
                frame.extend_from_slice(&(field.len() as i32).to_le_bytes());
                frame.extend_from_slice(field.as_bytes());
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_custom_variant_ordered_fanout() {
        // S6, scaled down: a registered user variant flows in order from one
        // client through the server back to every peer.
        const MESSAGES: usize = 200;

        let mut packets = PacketRegistry::new();
        packets
            .register(
                TAG_CHAT,
                Box::new(|source| {
                    Box::new(ChatMessage {
                        source,
                        from: String::new(),
                        text: String::new(),
                    })
                }),
            )
            .unwrap();
        let packets = Arc::new(packets);

        let (server, addr) = started_server(packets.clone());
        let server_inbox = server.inbox();

        let speaker = Client::new(packets.clone(), None);
        speaker.init("127.0.0.1", addr.port()).unwrap();
        speaker.start().unwrap();

        let listener = Client::new(packets.clone(), None);
        listener.init("127.0.0.1", addr.port()).unwrap();
        listener.start().unwrap();
        let listener_inbox = listener.inbox();

        assert!(wait_until(|| server.peer_count() == 2, Duration::from_secs(5)));

        for i in 0..MESSAGES {
            speaker
                .send(&ChatMessage::new("speaker", &format!("message {}", i)))
                .unwrap();
        }

        // The server sees the full sequence in order and replays it.
        let mut relayed = 0;
        assert!(wait_until(
            || server_inbox.len() >= MESSAGES + 2,
            Duration::from_secs(10)
        ));

        while let Some(packet) = server_inbox.pop() {
            if packet.tag() != TAG_CHAT {
                continue;
            }
            let chat = packet.as_any().downcast_ref::<ChatMessage>().unwrap();
            assert_eq!(chat.text, format!("message {}", relayed));
            relayed += 1;
            server.broadcast(&*packet).unwrap();
        }
        assert_eq!(relayed, MESSAGES);

        // The passive peer receives the replay in the same order.
        assert!(wait_until(
            || listener_inbox.len() >= MESSAGES + 1,
            Duration::from_secs(10)
        ));

        let mut received = 0;
        while let Some(packet) = listener_inbox.pop() {
            if packet.tag() != TAG_CHAT {
                continue;
            }
            let chat = packet.as_any().downcast_ref::<ChatMessage>().unwrap();
            assert_eq!(chat.text, format!("message {}", received));
            received += 1;
        }
        assert_eq!(received, MESSAGES);

        speaker.stop().unwrap();
        listener.stop().unwrap();
        server.stop().unwrap();
    }
}
