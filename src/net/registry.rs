use crate::net::buffer::Buffer;
use crate::net::error::{Error, ErrorKind, NetResult};
use crate::net::packet::{
    Connect, Disconnect, Packet, PacketSource, Progress, RawBytes, TypeTag, TAG_CONNECT,
    TAG_DISCONNECT, TAG_RAW_BYTES, TAG_RESERVED_MAX,
};
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use std::io::Cursor;

/// Constructor callback producing an empty packet of one variant, ready to
/// decode itself.
pub type PacketCtor = Box<dyn Fn(PacketSource) -> Box<dyn Packet> + Send + Sync>;

fn new_disconnect(source: PacketSource) -> Box<dyn Packet> {
    Box::new(Disconnect::new(source))
}

fn new_connect(source: PacketSource) -> Box<dyn Packet> {
    Box::new(Connect::new(source))
}

fn new_raw_bytes(source: PacketSource) -> Box<dyn Packet> {
    Box::new(RawBytes::new(source, Vec::new()))
}

/// Mapping from wire tag to packet constructor, with the three built-ins
/// pre-registered.
///
/// The registry is populated before any reader thread starts and is handed to
/// server/client/selectors behind an `Arc`, which makes it immutable from
/// then on; that is what lets lookups go unlocked.
pub struct PacketRegistry {
    ctors: HashMap<TypeTag, PacketCtor>,
}

impl PacketRegistry {
    pub fn new() -> PacketRegistry {
        let mut ctors: HashMap<TypeTag, PacketCtor> = HashMap::new();

        ctors.insert(TAG_DISCONNECT, Box::new(new_disconnect));
        ctors.insert(TAG_CONNECT, Box::new(new_connect));
        ctors.insert(TAG_RAW_BYTES, Box::new(new_raw_bytes));

        PacketRegistry { ctors }
    }

    /// Registers a user variant. Tags in the reserved range
    /// `[0x0000, 0x000F]` are rejected; re-registering a user tag replaces
    /// the previous constructor.
    pub fn register(&mut self, tag: TypeTag, ctor: PacketCtor) -> NetResult<()> {
        if tag <= TAG_RESERVED_MAX {
            return Err(Error::new(
                ErrorKind::ReservedType,
                "register",
                format!("tag {:#06x} is in the reserved range [0x0000, {:#06x}]", tag, TAG_RESERVED_MAX),
            ));
        }

        self.ctors.insert(tag, ctor);
        Ok(())
    }

    pub fn lookup(&self, tag: TypeTag) -> Option<&PacketCtor> {
        self.ctors.get(&tag)
    }

    pub fn len(&self) -> usize {
        self.ctors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctors.is_empty()
    }

    /// Decodes one framed packet from the stream reassembly buffer.
    ///
    /// `Ok(None)` means the buffer does not yet hold a complete frame and
    /// nothing was consumed. On success exactly one frame is consumed. An
    /// unknown tag consumes only the 2 tag bytes and reports `UnknownType`,
    /// so the reader can log it and continue with the following bytes.
    pub fn decode_stream(
        &self,
        buf: &mut Buffer,
        source: PacketSource,
    ) -> NetResult<Option<Box<dyn Packet>>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        enum Step {
            Deliver(Box<dyn Packet>, usize),
            Wait,
            Unknown(TypeTag),
            Fail(Error),
        }

        let step = {
            let bytes = buf.read_slice();
            let tag = LittleEndian::read_u16(&bytes[..2]);

            match self.ctors.get(&tag) {
                None => Step::Unknown(tag),
                Some(ctor) => {
                    let mut packet = ctor(source);
                    let mut cursor = Cursor::new(&bytes[2..]);

                    match packet.decode_stream(&mut cursor) {
                        Ok(Progress::Complete) => Step::Deliver(packet, 2 + cursor.position() as usize),
                        Ok(Progress::Incomplete) => Step::Wait,
                        Err(err) => Step::Fail(err),
                    }
                }
            }
        };

        match step {
            Step::Deliver(packet, consumed) => {
                buf.consume(consumed);
                Ok(Some(packet))
            }
            Step::Wait => Ok(None),
            Step::Unknown(tag) => {
                buf.consume(2);
                Err(Error::new(
                    ErrorKind::UnknownType,
                    "decode",
                    format!("no constructor registered for tag {:#06x}", tag),
                ))
            }
            Step::Fail(err) => Err(err),
        }
    }

    /// Decodes one complete datagram: `tag:u16_le ‖ payload`.
    pub fn decode_datagram(
        &self,
        datagram: &[u8],
        source: PacketSource,
    ) -> NetResult<Box<dyn Packet>> {
        if datagram.len() < 2 {
            return Err(Error::new(
                ErrorKind::Truncated,
                "decode",
                "datagram is shorter than the type tag",
            ));
        }

        let tag = LittleEndian::read_u16(&datagram[..2]);
        let ctor = self.ctors.get(&tag).ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownType,
                "decode",
                format!("no constructor registered for tag {:#06x}", tag),
            )
        })?;

        let mut packet = ctor(source);
        packet.decode_payload(&datagram[2..])?;
        Ok(packet)
    }
}

impl Default for PacketRegistry {
    fn default() -> PacketRegistry {
        PacketRegistry::new()
    }
}
