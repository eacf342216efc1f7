/*!
    wire-level framing of the hub datagram protocol.

    Every transmission on the bus is one datagram: a two byte frame marker,
    a total length, addressing and numbering bytes, a packet id, an optional
    payload and a one byte checksum. All integers are little endian.

    The codec only reports checksum validity, it never decides what to do
    about a bad one. Dropping corrupt datagrams (and relying on the sender's
    retransmission) is the reception engine's call.
*/

use bilge::prelude::*;
use packbytes::{FromBytes, ToBytes};
use thiserror::Error;

use crate::pack_bilge;


/// two bytes identifying the start of a valid datagram on the wire
pub const FRAME_MARKER: [u8; 2] = [0x44, 0x4b];
/// bytes of frame marker and length field, read together when resynchronizing
pub const PREFIX_LENGTH: usize = 4;
/// size of a datagram with an empty payload, marker and checksum included
pub const FIXED_PACKET_LENGTH: usize = 11;

/// source address of the host itself, never a real module
pub const HOST_ADDRESS: u8 = 0;
/// destination reaching every module on the chain at once
pub const BROADCAST_ADDRESS: u8 = 0xff;
/// highest address a real module can hold
pub const MAX_MODULE_ADDRESS: u8 = 254;


/// purpose of a datagram: which command it carries, and whether it is the
/// command itself or a module's answer to it
#[bitsize(16)]
#[derive(Copy, Clone, FromBits, DebugBits, PartialEq, Default)]
pub struct PacketId {
    /// number of the command being issued or answered
    pub command: u15,
    /// set on every datagram a module sends back for a command
    pub response: bool,
}
pack_bilge!(PacketId, u16);

impl PacketId {
    /// id of the command datagram carrying `command`
    pub fn command_id(command: u16) -> Self {
        Self::new(u15::new(command), false)
    }
    /// id of the response datagram answering `command`
    pub fn response_id(command: u16) -> Self {
        Self::new(u15::new(command), true)
    }
}

/// fixed-layout start of every datagram, up to the payload
#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct Header {
    pub frame: [u8; 2],
    /// total size of the transmission, frame marker and checksum included
    pub length: u16,
    /// module this datagram is going to
    pub dest: u8,
    /// module this datagram is coming from, [HOST_ADDRESS] when from the host
    pub source: u8,
    /// sender-assigned number identifying the transmission, never 0
    pub message_number: u8,
    /// message number this datagram answers, 0 when it answers nothing
    pub reference_number: u8,
    pub packet_id: PacketId,
}

pub const HEADER_LENGTH: usize = 10;

/// 8 bit overflowing sum, the checksum covers every packet byte except the checksum itself
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}


/// raised when a byte buffer cannot even be parsed as a datagram. A parsed
/// datagram with a wrong checksum is *not* an error, see [Datagram::is_checksum_valid]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer does not start with the frame marker")]
    BadMarker,
    #[error("buffer shorter than the smallest possible datagram")]
    Truncated,
    #[error("length field does not match the buffer size")]
    LengthMismatch,
}


/// one framed, checksummed unit of wire traffic
#[derive(Clone, Debug, PartialEq)]
pub struct Datagram {
    pub dest: u8,
    pub source: u8,
    pub message_number: u8,
    pub reference_number: u8,
    pub packet_id: PacketId,
    pub payload: Vec<u8>,
    /// checksum as found on the wire, or as computed when built locally
    checksum: u8,
}

impl Datagram {
    /// build a datagram ready to serialize, its checksum already computed
    pub fn new(dest: u8, source: u8, message_number: u8, reference_number: u8, packet_id: PacketId, payload: Vec<u8>) -> Self {
        let mut new = Self {
            dest, source, message_number, reference_number, packet_id, payload,
            checksum: 0,
            };
        new.checksum = new.compute_checksum();
        new
    }

    /// command number with the response bit stripped
    pub fn command_number(&self) -> u16 {
        self.packet_id.command().value()
    }
    /// whether this datagram answers a command rather than carrying one
    pub fn is_response(&self) -> bool {
        self.packet_id.response()
    }
    /// total size of the serialized packet
    pub fn packet_length(&self) -> u16 {
        (FIXED_PACKET_LENGTH + self.payload.len()) as u16
    }

    fn header(&self) -> Header {
        Header {
            frame: FRAME_MARKER,
            length: self.packet_length(),
            dest: self.dest,
            source: self.source,
            message_number: self.message_number,
            reference_number: self.reference_number,
            packet_id: self.packet_id,
            }
    }

    fn compute_checksum(&self) -> u8 {
        checksum(&self.header().to_le_bytes())
            .wrapping_add(checksum(&self.payload))
    }

    /// whether the checksum found on the wire matches the packet content
    pub fn is_checksum_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// serialize for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(usize::from(self.packet_length()));
        bytes.extend_from_slice(&self.header().to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.push(self.checksum);
        bytes
    }

    /// parse one complete, length-delimited packet
    pub fn from_bytes(packet: &[u8]) -> Result<Self, FrameError> {
        if packet.len() < FIXED_PACKET_LENGTH {
            return Err(FrameError::Truncated);
        }
        if packet[.. 2] != FRAME_MARKER {
            return Err(FrameError::BadMarker);
        }
        let header = Header::from_le_bytes(packet[.. HEADER_LENGTH].try_into().unwrap());
        if usize::from(header.length) != packet.len() {
            return Err(FrameError::LengthMismatch);
        }
        Ok(Self {
            dest: header.dest,
            source: header.source,
            message_number: header.message_number,
            reference_number: header.reference_number,
            packet_id: header.packet_id,
            payload: packet[HEADER_LENGTH .. packet.len()-1].to_vec(),
            checksum: packet[packet.len()-1],
            })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Datagram {
        Datagram::new(3, HOST_ADDRESS, 42, 0, PacketId::command_id(0x7f03), vec![1, 0xfe, 7])
    }

    #[test]
    fn round_trip() {
        let sent = sample();
        let received = Datagram::from_bytes(&sent.to_bytes()).unwrap();
        assert!(received.is_checksum_valid());
        assert_eq!(received.command_number(), 0x7f03);
        assert_eq!(received.message_number, 42);
        assert_eq!(received.reference_number, 0);
        assert_eq!(received.payload, vec![1, 0xfe, 7]);
        assert_eq!(received, sent);
    }

    #[test]
    fn corruption_flips_checksum() {
        let mut bytes = sample().to_bytes();
        // any single payload byte corruption must be caught by an additive checksum
        for i in HEADER_LENGTH .. bytes.len()-1 {
            bytes[i] = bytes[i].wrapping_add(1);
            let corrupted = Datagram::from_bytes(&bytes).unwrap();
            assert!(! corrupted.is_checksum_valid());
            bytes[i] = bytes[i].wrapping_sub(1);
        }
    }

    #[test]
    fn response_bit() {
        let id = PacketId::response_id(0x7f03);
        assert_eq!(u16::from(id), 0x7f03 | 0x8000);
        assert!(id.response());
        assert_eq!(id.command().value(), 0x7f03);
        assert!(! PacketId::command_id(0x7f03).response());
    }

    #[test]
    fn rejects_malformed_buffers() {
        assert_eq!(Datagram::from_bytes(&[0x44]), Err(FrameError::Truncated));
        let mut bytes = sample().to_bytes();
        bytes[0] = 0x45;
        assert_eq!(Datagram::from_bytes(&bytes), Err(FrameError::BadMarker));
        let bytes = sample().to_bytes();
        assert_eq!(Datagram::from_bytes(&bytes[.. bytes.len()-1]), Err(FrameError::LengthMismatch));
    }

    #[test]
    fn empty_payload_is_fixed_length() {
        let ping = Datagram::new(1, HOST_ADDRESS, 1, 0, PacketId::command_id(0x7f04), vec![]);
        assert_eq!(ping.to_bytes().len(), FIXED_PACKET_LENGTH);
    }
}
