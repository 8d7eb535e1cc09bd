use crate::net::error::{Error, ErrorKind, NetResult};
use crate::net::shared::{EndpointId, INVALID_ENDPOINT, MAX_STREAM_PAYLOAD};
use crate::net::socket::{Endpoint, Protocol};
use byteorder::{LittleEndian, ReadBytesExt};
use std::any::Any;
use std::fmt;
use std::io::{Cursor, Read};
use std::net::SocketAddrV4;

/// Wire tag identifying a packet variant.
pub type TypeTag = u16;

pub const TAG_DISCONNECT: TypeTag = 0x0000;
pub const TAG_CONNECT: TypeTag = 0x0001;
pub const TAG_RAW_BYTES: TypeTag = 0x0002;

/// Tags up to and including this value are reserved for built-in variants.
pub const TAG_RESERVED_MAX: TypeTag = 0x000F;

/// Non-owning handle to the endpoint a packet originated from: the endpoint
/// identity for routing and purging, plus enough address information to reply.
/// The endpoint itself stays owned by its selector or client.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PacketSource {
    id: EndpointId,
    protocol: Protocol,
    addr: Option<SocketAddrV4>,
}

impl PacketSource {
    pub fn from_endpoint(endpoint: &Endpoint) -> PacketSource {
        PacketSource {
            id: endpoint.id(),
            protocol: endpoint.protocol(),
            addr: endpoint.addr(),
        }
    }

    /// Handle-less source for packets built by the application itself.
    pub fn detached(protocol: Protocol) -> PacketSource {
        PacketSource {
            id: INVALID_ENDPOINT,
            protocol,
            addr: None,
        }
    }

    #[inline]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[inline]
    pub fn addr(&self) -> Option<SocketAddrV4> {
        self.addr
    }
}

impl fmt::Display for PacketSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} id {}", self.protocol, self.id)?;
        if let Some(addr) = self.addr {
            write!(f, " ({})", addr)?;
        }
        Ok(())
    }
}

/// Progress of a stream-side decode attempt.
#[derive(Debug, Eq, PartialEq)]
pub enum Progress {
    /// The frame was fully decoded.
    Complete,
    /// The reassembly buffer does not yet hold the whole frame; retry once
    /// more bytes have arrived.
    Incomplete,
}

/// A framed application packet.
///
/// The wire form is always `tag:u16_le` followed by a variant-specific
/// payload. The 2-byte tag is the only framing the core provides; variants
/// with a variable payload must embed their own length field the way
/// [`RawBytes`] does.
pub trait Packet: Send + std::fmt::Debug {
    /// Wire tag of this variant.
    fn tag(&self) -> TypeTag;

    /// Endpoint the packet was decoded from or synthesized for.
    fn source(&self) -> PacketSource;

    /// Stream path: decode the payload from the reassembly buffer, the tag
    /// already consumed. Returning `Incomplete` must leave the packet
    /// unchanged; the cursor position is discarded by the caller.
    fn decode_stream(&mut self, frame: &mut Cursor<&[u8]>) -> NetResult<Progress>;

    /// Datagram path: decode from the complete payload of one datagram, the
    /// tag already stripped. Leftover or missing bytes are an error.
    fn decode_payload(&mut self, payload: &[u8]) -> NetResult<()>;

    /// Appends the wire payload (everything after the tag) to `frame`.
    fn encode_payload(&self, frame: &mut Vec<u8>) -> NetResult<()>;

    /// Dynamic view for application downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Produces the full wire frame: `tag ‖ payload`.
    fn encode(&self) -> NetResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(16);
        frame.extend_from_slice(&self.tag().to_le_bytes());
        self.encode_payload(&mut frame)?;
        Ok(frame)
    }
}

/// Session-closed marker. Synthesized by the core when a stream peer goes
/// away; its payload is empty and it is never transmitted by built-ins.
#[derive(Debug)]
pub struct Disconnect {
    source: PacketSource,
}

impl Disconnect {
    pub fn new(source: PacketSource) -> Disconnect {
        Disconnect { source }
    }
}

impl Packet for Disconnect {
    fn tag(&self) -> TypeTag {
        TAG_DISCONNECT
    }

    fn source(&self) -> PacketSource {
        self.source
    }

    fn decode_stream(&mut self, _frame: &mut Cursor<&[u8]>) -> NetResult<Progress> {
        Ok(Progress::Complete)
    }

    fn decode_payload(&mut self, payload: &[u8]) -> NetResult<()> {
        expect_empty_payload(payload, "disconnect")
    }

    fn encode_payload(&self, _frame: &mut Vec<u8>) -> NetResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Session-opened marker. Synthesized by a selector when it admits a stream
/// peer and by a client once its connection stands; empty payload.
#[derive(Debug)]
pub struct Connect {
    source: PacketSource,
}

impl Connect {
    pub fn new(source: PacketSource) -> Connect {
        Connect { source }
    }
}

impl Packet for Connect {
    fn tag(&self) -> TypeTag {
        TAG_CONNECT
    }

    fn source(&self) -> PacketSource {
        self.source
    }

    fn decode_stream(&mut self, _frame: &mut Cursor<&[u8]>) -> NetResult<Progress> {
        Ok(Progress::Complete)
    }

    fn decode_payload(&mut self, payload: &[u8]) -> NetResult<()> {
        expect_empty_payload(payload, "connect")
    }

    fn encode_payload(&self, _frame: &mut Vec<u8>) -> NetResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Opaque length-prefixed byte payload; wire form `len:i32_le ‖ bytes[len]`.
#[derive(Debug)]
pub struct RawBytes {
    source: PacketSource,
    data: Vec<u8>,
}

impl RawBytes {
    pub fn new(source: PacketSource, data: Vec<u8>) -> RawBytes {
        RawBytes { source, data }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PartialEq for RawBytes {
    fn eq(&self, other: &RawBytes) -> bool {
        self.data == other.data
    }
}

impl Packet for RawBytes {
    fn tag(&self) -> TypeTag {
        TAG_RAW_BYTES
    }

    fn source(&self) -> PacketSource {
        self.source
    }

    fn decode_stream(&mut self, frame: &mut Cursor<&[u8]>) -> NetResult<Progress> {
        if remaining(frame) < 4 {
            return Ok(Progress::Incomplete);
        }

        let len = frame.read_i32::<LittleEndian>().map_err(|err| {
            Error::with_cause(ErrorKind::Truncated, "decode", "failed to read length field", err)
        })?;

        if len < 0 || len as usize > MAX_STREAM_PAYLOAD {
            return Err(Error::new(
                ErrorKind::OutOfRange,
                "decode",
                format!("length field {} is outside [0, {}]", len, MAX_STREAM_PAYLOAD),
            ));
        }

        if remaining(frame) < len as usize {
            return Ok(Progress::Incomplete);
        }

        let mut data = vec![0u8; len as usize];
        frame.read_exact(&mut data).map_err(|err| {
            Error::with_cause(ErrorKind::Truncated, "decode", "failed to read payload", err)
        })?;

        self.data = data;
        Ok(Progress::Complete)
    }

    fn decode_payload(&mut self, payload: &[u8]) -> NetResult<()> {
        if payload.len() < 4 {
            return Err(Error::new(
                ErrorKind::Truncated,
                "decode",
                "datagram is shorter than its length header",
            ));
        }

        let mut header = Cursor::new(payload);
        let len = header.read_i32::<LittleEndian>().map_err(|err| {
            Error::with_cause(ErrorKind::Truncated, "decode", "failed to read length field", err)
        })?;

        if len < 0 {
            return Err(Error::new(
                ErrorKind::OutOfRange,
                "decode",
                format!("length field {} is negative", len),
            ));
        }

        if payload.len() - 4 != len as usize {
            return Err(Error::new(
                ErrorKind::Truncated,
                "decode",
                format!(
                    "length field {} disagrees with datagram payload of {} bytes",
                    len,
                    payload.len() - 4
                ),
            ));
        }

        self.data = payload[4..].to_vec();
        Ok(())
    }

    fn encode_payload(&self, frame: &mut Vec<u8>) -> NetResult<()> {
        if self.data.len() > i32::max_value() as usize {
            return Err(Error::new(
                ErrorKind::OutOfRange,
                "encode",
                "payload does not fit a 32 bit length field",
            ));
        }

        frame.extend_from_slice(&(self.data.len() as i32).to_le_bytes());
        frame.extend_from_slice(&self.data);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn expect_empty_payload(payload: &[u8], op: &'static str) -> NetResult<()> {
    if !payload.is_empty() {
        return Err(Error::new(
            ErrorKind::Truncated,
            op,
            format!("expected an empty payload, got {} bytes", payload.len()),
        ));
    }
    Ok(())
}

#[inline]
fn remaining(frame: &Cursor<&[u8]>) -> usize {
    frame.get_ref().len() - frame.position() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::shared::INVALID_ENDPOINT;

    fn test_source() -> PacketSource {
        PacketSource {
            id: INVALID_ENDPOINT,
            protocol: Protocol::Stream,
            addr: None,
        }
    }

    #[test]
    fn test_raw_bytes_wire_form() {
        let packet = RawBytes::new(test_source(), b"hello".to_vec());

        let frame = packet.encode().unwrap();

        assert_eq!(&frame[..2], &[0x02, 0x00]);
        assert_eq!(&frame[2..6], &[0x05, 0x00, 0x00, 0x00]);
        assert_eq!(&frame[6..], b"hello");
    }

    #[test]
    fn test_synthetic_wire_form_is_tag_only() {
        assert_eq!(Connect::new(test_source()).encode().unwrap(), vec![0x01, 0x00]);
        assert_eq!(Disconnect::new(test_source()).encode().unwrap(), vec![0x00, 0x00]);
    }

    #[test]
    fn test_stream_decode_waits_for_full_frame() {
        let frame = RawBytes::new(test_source(), vec![7u8; 16]).encode().unwrap();
        let payload = &frame[2..];

        // Header alone, then header plus a partial body: both incomplete.
        for cut in &[0usize, 3, 4, 10] {
            let mut packet = RawBytes::new(test_source(), Vec::new());
            let mut cursor = Cursor::new(&payload[..*cut]);
            assert_eq!(packet.decode_stream(&mut cursor).unwrap(), Progress::Incomplete);
            assert!(packet.is_empty());
        }

        let mut packet = RawBytes::new(test_source(), Vec::new());
        let mut cursor = Cursor::new(payload);
        assert_eq!(packet.decode_stream(&mut cursor).unwrap(), Progress::Complete);
        assert_eq!(packet.data(), &[7u8; 16][..]);
        assert_eq!(cursor.position() as usize, payload.len());
    }

    #[test]
    fn test_stream_decode_rejects_absurd_length_claim() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(-1i32).to_le_bytes());

        let mut packet = RawBytes::new(test_source(), Vec::new());
        let err = packet
            .decode_stream(&mut Cursor::new(&payload[..]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let mut payload = Vec::new();
        payload.extend_from_slice(&(MAX_STREAM_PAYLOAD as i32 + 1).to_le_bytes());

        let mut packet = RawBytes::new(test_source(), Vec::new());
        let err = packet
            .decode_stream(&mut Cursor::new(&payload[..]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn test_datagram_decode_requires_exact_length() {
        let frame = RawBytes::new(test_source(), b"PING".to_vec()).encode().unwrap();

        let mut packet = RawBytes::new(test_source(), Vec::new());
        packet.decode_payload(&frame[2..]).unwrap();
        assert_eq!(packet.data(), b"PING");

        // Short header.
        let mut packet = RawBytes::new(test_source(), Vec::new());
        assert_eq!(
            packet.decode_payload(&frame[2..4]).unwrap_err().kind(),
            ErrorKind::Truncated
        );

        // Body shorter than claimed.
        let mut packet = RawBytes::new(test_source(), Vec::new());
        assert_eq!(
            packet.decode_payload(&frame[2..7]).unwrap_err().kind(),
            ErrorKind::Truncated
        );

        // Excess bytes after the claimed body.
        let mut long = frame[2..].to_vec();
        long.push(0);
        let mut packet = RawBytes::new(test_source(), Vec::new());
        assert_eq!(packet.decode_payload(&long).unwrap_err().kind(), ErrorKind::Truncated);
    }

    #[test]
    fn test_synthetics_reject_datagram_payloads() {
        let mut packet = Connect::new(test_source());

        packet.decode_payload(&[]).unwrap();
        assert_eq!(packet.decode_payload(&[1]).unwrap_err().kind(), ErrorKind::Truncated);
    }
}
