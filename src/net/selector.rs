use crate::logging;
use crate::net::buffer::Buffer;
use crate::net::error::{Error, ErrorKind, NetResult};
use crate::net::inbox::PacketInbox;
use crate::net::packet::{Connect, Disconnect, Packet, PacketSource};
use crate::net::registry::PacketRegistry;
use crate::net::shared::{EndpointId, MAX_CLIENTS, SELECT_TIMEOUT};
use crate::net::socket::{Endpoint, Protocol, SocketState};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

const READ_BUF_SIZE: usize = 65536;

/// Outcome of offering a stream endpoint to a selector.
#[derive(Debug)]
pub enum Admission {
    Accepted,
    /// The selector is at capacity; the endpoint is handed back so the
    /// caller can try another selector.
    Full(Endpoint),
}

/// A stream peer under selector management: the endpoint, the buffer its
/// frames are reassembled in, and the mio handle it is registered through
/// while it sits on a selector poll.
pub(crate) struct StreamPeer {
    pub(crate) endpoint: Endpoint,
    pub(crate) buffer: Buffer,
    pub(crate) id: EndpointId,
    pub(crate) source: PacketSource,
    pub(crate) registration: Option<TcpStream>,
}

impl StreamPeer {
    pub(crate) fn new(endpoint: Endpoint) -> StreamPeer {
        let id = endpoint.id();
        let source = PacketSource::from_endpoint(&endpoint);

        StreamPeer {
            endpoint,
            buffer: Buffer::new(READ_BUF_SIZE),
            id,
            source,
            registration: None,
        }
    }
}

/// Outcome of draining a stream peer.
pub(crate) enum Drain {
    Alive,
    /// The peer is done for (error, desync or close). The caller must retire
    /// it; `drain_stream` itself neither closes nor synthesizes.
    Dropped,
}

/// Reads everything the peer socket currently has, then decodes every
/// complete frame into the inbox in arrival order.
///
/// `Truncated` and `UnknownType` conditions are logged and skipped; read
/// failures, desyncs and end of stream report `Dropped`.
pub(crate) fn drain_stream(
    peer: &mut StreamPeer,
    packets: &PacketRegistry,
    inbox: &PacketInbox,
    log: &logging::Logger,
) -> Drain {
    let source = peer.source;

    let (_, closed) = match peer.buffer.ingress(&mut &peer.endpoint) {
        Ok(progress) => progress,
        Err(err) => {
            let err = Error::with_cause(ErrorKind::RecvFailed, "select", "peer read failed", err);
            logging::warn!(log, "dropping peer"; "peer" => %source, "error" => %err);
            return Drain::Dropped;
        }
    };

    loop {
        match packets.decode_stream(&mut peer.buffer, source) {
            Ok(Some(packet)) => {
                logging::trace!(log, "packet decoded"; "peer" => %source, "tag" => packet.tag());
                inbox.push(packet);
            }
            Ok(None) => break,
            Err(err) => {
                if err.kind() == ErrorKind::UnknownType {
                    logging::warn!(log, "skipping unknown packet type"; "peer" => %source, "error" => %err);
                    continue;
                }
                logging::warn!(log, "dropping desynchronized peer"; "peer" => %source, "error" => %err);
                return Drain::Dropped;
            }
        }
    }

    if closed {
        if !peer.buffer.is_empty() {
            let err = Error::new(
                ErrorKind::Truncated,
                "select",
                format!(
                    "peer closed leaving {} bytes of an incomplete frame",
                    peer.buffer.len()
                ),
            );
            logging::error!(log, "incomplete frame at close"; "peer" => %source, "error" => %err);
        }
        return Drain::Dropped;
    }

    Drain::Alive
}

/// Closes the peer endpoint and synthesizes its Disconnect. Called exactly
/// once per peer, after its last decoded packet went into the inbox.
pub(crate) fn retire_peer(peer: &mut StreamPeer, inbox: &PacketInbox, log: &logging::Logger) {
    drop(peer.endpoint.close());
    inbox.push(Box::new(Disconnect::new(peer.source)));
    logging::debug!(log, "peer disconnected"; "peer" => %peer.source);
}

#[derive(Clone)]
struct PeerSlot {
    id: EndpointId,
    peer: Arc<Mutex<StreamPeer>>,
}

struct Shared {
    peers: Mutex<Vec<PeerSlot>>,
    poll: Mutex<Poll>,
    poller: mio::Registry,
    running: AtomicBool,
    inbox: Arc<PacketInbox>,
    packets: Arc<PacketRegistry>,
    log: logging::Logger,
}

/// Multiplexes up to [`MAX_CLIENTS`] connected stream endpoints on a single
/// reader thread.
///
/// The reader waits on its poll with a 100 ms timeout — that timeout is the
/// cancellation quantum: `stop` flips the running flag and the thread is gone
/// within one quantum. A selector whose last peer leaves stops itself.
pub struct Selector {
    shared: Arc<Shared>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Selector {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        packets: Arc<PacketRegistry>,
        inbox: Arc<PacketInbox>,
        log: L,
    ) -> NetResult<Selector> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "selector")),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let poll = Poll::new().map_err(|err| {
            Error::with_cause(ErrorKind::System, "selector", "failed to create poll", err)
        })?;
        let poller = poll.registry().try_clone().map_err(|err| {
            Error::with_cause(ErrorKind::System, "selector", "failed to clone poll registry", err)
        })?;

        Ok(Selector {
            shared: Arc::new(Shared {
                peers: Mutex::new(Vec::new()),
                poll: Mutex::new(poll),
                poller,
                running: AtomicBool::new(false),
                inbox,
                packets,
                log,
            }),
            reader: Mutex::new(None),
        })
    }

    /// Admits a `{Stream, Connected}` endpoint. Inserts the peer and then
    /// synthesizes its `Connect`, both under the peers lock, so the Connect
    /// precedes everything the peer sends. Returns the endpoint back inside
    /// `Admission::Full` when the selector already holds [`MAX_CLIENTS`].
    pub fn add_client(&self, endpoint: Endpoint) -> NetResult<Admission> {
        if endpoint.protocol() != Protocol::Stream {
            return Err(Error::new(
                ErrorKind::ProtocolMismatch,
                "add_client",
                "selectors manage stream endpoints only",
            ));
        }
        if endpoint.state() != SocketState::Connected {
            return Err(Error::new(
                ErrorKind::State,
                "add_client",
                format!("endpoint must be Connected, state is {:?}", endpoint.state()),
            ));
        }

        let mut peers = self.shared.peers.lock().expect("selector peers mutex poisoned");

        if peers.len() >= MAX_CLIENTS {
            return Ok(Admission::Full(endpoint));
        }

        endpoint.set_nonblocking(true)?;

        let mut peer = StreamPeer::new(endpoint);
        let id = peer.id;
        let source = peer.source;

        let mut registration = peer.endpoint.poll_stream()?;
        self.shared
            .poller
            .register(&mut registration, Token(id as usize), Interest::READABLE)
            .map_err(|err| {
                Error::with_cause(
                    ErrorKind::System,
                    "add_client",
                    "failed to register peer with the poller",
                    err,
                )
            })?;
        peer.registration = Some(registration);

        peers.push(PeerSlot {
            id,
            peer: Arc::new(Mutex::new(peer)),
        });
        self.shared.inbox.push(Box::new(Connect::new(source)));

        logging::debug!(self.shared.log, "peer admitted"; "peer" => %source, "peers" => peers.len());
        Ok(Admission::Accepted)
    }

    /// Spawns the reader thread. Requires at least one peer and no running
    /// reader.
    pub fn start(&self) -> NetResult<()> {
        if self.shared.running.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::SelectorRunning,
                "start",
                "selector is already running",
            ));
        }
        if self.shared.peers.lock().expect("selector peers mutex poisoned").is_empty() {
            return Err(Error::new(ErrorKind::SelectorEmpty, "start", "selector has no peers"));
        }

        // Reap a reader that stopped itself.
        if let Some(handle) = self.reader.lock().expect("selector reader mutex poisoned").take() {
            drop(handle.join());
        }

        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("selector-reader".to_string())
            .spawn(move || select_loop(shared));

        match handle {
            Ok(handle) => {
                *self.reader.lock().expect("selector reader mutex poisoned") = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::with_cause(
                    ErrorKind::System,
                    "start",
                    "failed to spawn reader thread",
                    err,
                ))
            }
        }
    }

    /// Signals the reader to terminate and joins it. The reader notices the
    /// flag within one poll timeout. Stopping a stopped selector is a no-op.
    pub fn stop(&self) -> NetResult<()> {
        self.shared.running.store(false, Ordering::Release);

        if let Some(handle) = self.reader.lock().expect("selector reader mutex poisoned").take() {
            drop(handle.join());
        }

        Ok(())
    }

    /// Sends the packet to every managed peer. The peer list is snapshotted
    /// under the lock and the sends happen outside it; per-peer failures are
    /// logged and left for the reader to notice.
    pub fn broadcast(&self, packet: &dyn Packet) -> NetResult<()> {
        let frame = packet.encode()?;
        self.broadcast_frame(&frame);
        Ok(())
    }

    pub(crate) fn broadcast_frame(&self, frame: &[u8]) {
        let snapshot: Vec<PeerSlot> = self
            .shared
            .peers
            .lock()
            .expect("selector peers mutex poisoned")
            .clone();

        for slot in snapshot {
            let peer = slot.peer.lock().expect("peer mutex poisoned");

            if peer.endpoint.state() != SocketState::Connected {
                continue;
            }
            if let Err(err) = peer.endpoint.send_all(frame) {
                logging::warn!(self.shared.log, "broadcast send failed";
                               "peer" => %peer.source, "error" => %err);
            }
        }
    }

    /// Sends the packet to the one peer with the given endpoint id. Returns
    /// false when this selector does not manage that peer.
    pub fn send_to(&self, id: EndpointId, packet: &dyn Packet) -> NetResult<bool> {
        let frame = packet.encode()?;
        self.send_frame_to(id, &frame)
    }

    pub(crate) fn send_frame_to(&self, id: EndpointId, frame: &[u8]) -> NetResult<bool> {
        let slot = self
            .shared
            .peers
            .lock()
            .expect("selector peers mutex poisoned")
            .iter()
            .find(|slot| slot.id == id)
            .cloned();

        match slot {
            None => Ok(false),
            Some(slot) => {
                let peer = slot.peer.lock().expect("peer mutex poisoned");
                peer.endpoint.send_all(frame)?;
                Ok(true)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shared.peers.lock().expect("selector peers mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "selector: {} peers, {}",
            self.len(),
            if self.running() { "running" } else { "stopped" }
        )
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        drop(self.stop());
    }
}

fn select_loop(shared: Arc<Shared>) {
    let mut events = Events::with_capacity(MAX_CLIENTS);

    logging::debug!(shared.log, "reader thread running");

    while shared.running.load(Ordering::Acquire) {
        {
            let mut poll = shared.poll.lock().expect("selector poll mutex poisoned");
            if let Err(err) = poll.poll(&mut events, Some(SELECT_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(shared.log, "poll failed, stopping selector"; "error" => %err);
                shared.running.store(false, Ordering::Release);
                break;
            }
        }

        for event in events.iter() {
            let id = event.token().0 as EndpointId;

            let slot = shared
                .peers
                .lock()
                .expect("selector peers mutex poisoned")
                .iter()
                .find(|slot| slot.id == id)
                .cloned();

            let slot = match slot {
                Some(slot) => slot,
                None => continue,
            };

            let dropped = {
                let mut peer = slot.peer.lock().expect("peer mutex poisoned");

                match drain_stream(&mut peer, &shared.packets, &shared.inbox, &shared.log) {
                    Drain::Alive => false,
                    Drain::Dropped => {
                        // Deregister before the handles go away.
                        if let Some(mut registration) = peer.registration.take() {
                            drop(shared.poller.deregister(&mut registration));
                        }
                        retire_peer(&mut peer, &shared.inbox, &shared.log);
                        true
                    }
                }
            };

            if dropped {
                shared
                    .peers
                    .lock()
                    .expect("selector peers mutex poisoned")
                    .retain(|slot| slot.id != id);
            }
        }

        if shared.peers.lock().expect("selector peers mutex poisoned").is_empty() {
            logging::debug!(shared.log, "no peers left, self-stopping");
            shared.running.store(false, Ordering::Release);
        }
    }

    logging::debug!(shared.log, "reader thread exited");
}
