use crate::logging;
use crate::net::error::{Error, ErrorKind, NetResult};
use crate::net::inbox::PacketInbox;
use crate::net::packet::{Connect, Packet, PacketSource};
use crate::net::registry::PacketRegistry;
use crate::net::selector::{drain_stream, retire_peer, Drain, StreamPeer};
use crate::net::shared::{MAX_DGRAM, SELECT_TIMEOUT};
use crate::net::socket::{Endpoint, Protocol};
use mio::{Events, Interest, Poll, Token};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Server address of a client, deserializable from application config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

struct Shared {
    stream: Mutex<Option<StreamPeer>>,
    datagram: Mutex<Endpoint>,
    running: AtomicBool,
    initialized: AtomicBool,
    inbox: Arc<PacketInbox>,
    packets: Arc<PacketRegistry>,
    log: logging::Logger,
}

/// The client automation: one stream endpoint connected to the server, one
/// datagram endpoint bound to an ephemeral port, and a reader thread for
/// each, both feeding the client's inbox.
///
/// A client is single-shot: `init` once, `start` once, `stop` once. Losing
/// the stream connection stops the whole client.
pub struct Client {
    shared: Arc<Shared>,
    stream_thread: Mutex<Option<thread::JoinHandle<()>>>,
    datagram_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Client {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        packets: Arc<PacketRegistry>,
        log: L,
    ) -> Client {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "client")),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Client {
            shared: Arc::new(Shared {
                stream: Mutex::new(None),
                datagram: Mutex::new(Endpoint::new(Protocol::Datagram)),
                running: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                inbox: Arc::new(PacketInbox::new()),
                packets,
                log,
            }),
            stream_thread: Mutex::new(None),
            datagram_thread: Mutex::new(None),
        }
    }

    pub fn inbox(&self) -> Arc<PacketInbox> {
        self.shared.inbox.clone()
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Source handle of the stream connection, for tagging outbound packets.
    pub fn source(&self) -> Option<PacketSource> {
        self.shared
            .stream
            .lock()
            .expect("client stream mutex poisoned")
            .as_ref()
            .map(|peer| peer.source)
    }

    /// Local address of the datagram endpoint.
    pub fn datagram_addr(&self) -> Option<SocketAddrV4> {
        self.shared.datagram.lock().expect("client datagram mutex poisoned").addr()
    }

    /// Connects the stream endpoint to `(host, port)` and binds the datagram
    /// endpoint to an ephemeral port. Synthesizes the session `Connect` with
    /// the server-side stream endpoint as source.
    pub fn init(&self, host: &str, port: u16) -> NetResult<()> {
        if self.shared.initialized.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::State, "init", "client is already initialized"));
        }

        let mut endpoint = Endpoint::new(Protocol::Stream);
        endpoint.open()?;
        endpoint.connect(host, port)?;
        endpoint.set_nonblocking(true)?;

        {
            let mut datagram = self.shared.datagram.lock().expect("client datagram mutex poisoned");
            datagram.open()?;
            datagram.bind("0.0.0.0", 0)?;
            datagram.set_nonblocking(true)?;
        }

        let peer = StreamPeer::new(endpoint);
        let source = peer.source;

        *self.shared.stream.lock().expect("client stream mutex poisoned") = Some(peer);
        self.shared.initialized.store(true, Ordering::Release);

        self.shared.inbox.push(Box::new(Connect::new(source)));

        logging::info!(self.shared.log, "connected to server"; "server" => %source);
        Ok(())
    }

    pub fn init_config(&self, config: &ClientConfig) -> NetResult<()> {
        self.init(&config.host, config.port)
    }

    /// Spawns the stream and datagram reader threads.
    pub fn start(&self) -> NetResult<()> {
        if !self.shared.initialized.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::State, "start", "client is not initialized"));
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(Error::new(
                ErrorKind::ClientRunning,
                "start",
                "client is already running",
            ));
        }

        let shared = self.shared.clone();
        let stream = thread::Builder::new()
            .name("client-stream".to_string())
            .spawn(move || stream_loop(shared));

        let stream = match stream {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(Error::with_cause(
                    ErrorKind::System,
                    "start",
                    "failed to spawn stream reader",
                    err,
                ));
            }
        };

        let shared = self.shared.clone();
        let datagram = thread::Builder::new()
            .name("client-datagram".to_string())
            .spawn(move || datagram_loop(shared));

        let datagram = match datagram {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                drop(stream.join());
                return Err(Error::with_cause(
                    ErrorKind::System,
                    "start",
                    "failed to spawn datagram reader",
                    err,
                ));
            }
        };

        *self.stream_thread.lock().expect("client stream thread mutex poisoned") = Some(stream);
        *self.datagram_thread.lock().expect("client datagram thread mutex poisoned") = Some(datagram);

        logging::info!(self.shared.log, "client started");
        Ok(())
    }

    /// Signals both readers, joins them and closes both endpoints. The
    /// stream close is what lets the server notice the departure.
    pub fn stop(&self) -> NetResult<()> {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::ClientStopped, "stop", "client is not running"));
        }

        if let Some(handle) = self.stream_thread.lock().expect("client stream thread mutex poisoned").take()
        {
            drop(handle.join());
        }
        if let Some(handle) = self
            .datagram_thread
            .lock()
            .expect("client datagram thread mutex poisoned")
            .take()
        {
            drop(handle.join());
        }

        if let Some(peer) = self
            .shared
            .stream
            .lock()
            .expect("client stream mutex poisoned")
            .as_mut()
        {
            drop(peer.endpoint.close());
        }
        drop(self.shared.datagram.lock().expect("client datagram mutex poisoned").close());

        logging::info!(self.shared.log, "client stopped");
        Ok(())
    }

    /// Writes the packet as one frame to the stream endpoint.
    pub fn send(&self, packet: &dyn Packet) -> NetResult<()> {
        let frame = packet.encode()?;

        let stream = self.shared.stream.lock().expect("client stream mutex poisoned");
        match stream.as_ref() {
            Some(peer) => peer.endpoint.send_all(&frame),
            None => Err(Error::new(ErrorKind::State, "send", "client is not initialized")),
        }
    }

    /// Sends the packet as a single datagram from the client's datagram
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
            .expect("client datagram mutex poisoned")
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
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "client")?;
        if let Some(source) = self.source() {
            write!(f, " -> {}", source)?;
        }
        write!(f, ": {}", if self.running() { "running" } else { "stopped" })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.running() {
            drop(self.stop());
        }
    }
}

fn stream_loop(shared: Arc<Shared>) {
    let mut registration = {
        let stream = shared.stream.lock().expect("client stream mutex poisoned");
        match stream.as_ref() {
            Some(peer) => match peer.endpoint.poll_stream() {
                Ok(registration) => registration,
                Err(err) => {
                    logging::error!(shared.log, "stream reader failed to clone endpoint"; "error" => %err);
                    return;
                }
            },
            None => return,
        }
    };

    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            logging::error!(shared.log, "stream reader failed to create poll"; "error" => %err);
            return;
        }
    };
    if let Err(err) = poll
        .registry()
        .register(&mut registration, Token(0), Interest::READABLE)
    {
        logging::error!(shared.log, "stream reader failed to register endpoint"; "error" => %err);
        return;
    }

    let mut events = Events::with_capacity(4);

    logging::debug!(shared.log, "stream reader running");

    while shared.running.load(Ordering::Acquire) {
        if let Err(err) = poll.poll(&mut events, Some(SELECT_TIMEOUT)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            logging::error!(shared.log, "stream poll failed, stopping reader"; "error" => %err);
            return;
        }

        if events.is_empty() {
            continue;
        }

        let dropped = {
            let mut stream = shared.stream.lock().expect("client stream mutex poisoned");
            match stream.as_mut() {
                None => return,
                Some(peer) => match drain_stream(peer, &shared.packets, &shared.inbox, &shared.log) {
                    Drain::Alive => false,
                    Drain::Dropped => {
                        retire_peer(peer, &shared.inbox, &shared.log);
                        true
                    }
                },
            }
        };

        if dropped {
            // Losing the server connection stops the whole client; the
            // datagram reader notices the flag within one quantum.
            logging::info!(shared.log, "server connection lost, stopping client");
            shared.running.store(false, Ordering::Release);
            return;
        }
    }

    logging::debug!(shared.log, "stream reader exited");
}

fn datagram_loop(shared: Arc<Shared>) {
    let mut registration = {
        let datagram = shared.datagram.lock().expect("client datagram mutex poisoned");
        match datagram.poll_datagram() {
            Ok(registration) => registration,
            Err(err) => {
                logging::error!(shared.log, "datagram reader failed to clone endpoint"; "error" => %err);
                return;
            }
        }
    };

    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            logging::error!(shared.log, "datagram reader failed to create poll"; "error" => %err);
            return;
        }
    };
    if let Err(err) = poll
        .registry()
        .register(&mut registration, Token(0), Interest::READABLE)
    {
        logging::error!(shared.log, "datagram reader failed to register endpoint"; "error" => %err);
        return;
    }

    let mut events = Events::with_capacity(4);
    let mut buf = vec![0u8; MAX_DGRAM];

    logging::debug!(shared.log, "datagram reader running");

    while shared.running.load(Ordering::Acquire) {
        if let Err(err) = poll.poll(&mut events, Some(SELECT_TIMEOUT)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            logging::error!(shared.log, "datagram poll failed, stopping reader"; "error" => %err);
            return;
        }

        loop {
            let received = {
                let datagram = shared.datagram.lock().expect("client datagram mutex poisoned");
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
                    logging::error!(shared.log, "datagram read failed, stopping reader"; "error" => %err);
                    return;
                }
            }
        }
    }

    logging::debug!(shared.log, "datagram reader exited");
}
