use std::os::unix::io::RawFd;
use std::time::Duration;

/// Maximum number of stream endpoints a single selector multiplexes.
pub const MAX_CLIENTS: usize = 64;

/// Largest datagram accepted or produced on the wire (IPv4 UDP payload limit).
pub const MAX_DGRAM: usize = 65507;

/// Upper bound on the length field of a stream `RawBytes` frame. A claim
/// outside this range desynchronizes the stream and is fatal for the peer.
pub const MAX_STREAM_PAYLOAD: usize = 1 << 20;

/// Cancellation quantum: every reader thread waits on its poll for at most
/// this long before rechecking its running flag.
pub const SELECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Identity of an endpoint, equal to its OS handle.
pub type EndpointId = RawFd;

/// Identity reported by endpoints that hold no OS handle (datagram senders,
/// closed endpoints).
pub const INVALID_ENDPOINT: EndpointId = -1;
