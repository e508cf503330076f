//! HCI packet recombination
//!
//! HCI packets contain no marker to indicate what kind of packet they are, so every packet sent
//! over the interface is prefixed with a one byte packet indicator (the same labeling used for
//! the UART transport in the specification). A [`Recombiner`] takes the raw, arbitrarily chunked
//! byte stream read from the interface driver and reconstructs the discrete indicator-labeled
//! packets within it.

use core::fmt;
use std::collections::VecDeque;

/// The types of HCI packets
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum PacketKind {
    /// Command packet
    Command,
    /// Asynchronous Connection-Oriented Data Packet
    Acl,
    /// Synchronous Connection-Oriented Data Packet
    Sco,
    /// Event Packet
    Event,
    /// Isochronous Data Packet
    Iso,
}

impl PacketKind {
    /// Get the packet indicator prefixed to packets of this type
    pub fn indicator(self) -> u8 {
        match self {
            PacketKind::Command => 0x01,
            PacketKind::Acl => 0x02,
            PacketKind::Sco => 0x03,
            PacketKind::Event => 0x04,
            PacketKind::Iso => 0x05,
        }
    }

    /// Try to get the packet type for a packet indicator
    pub fn try_from_indicator(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(PacketKind::Command),
            0x02 => Some(PacketKind::Acl),
            0x03 => Some(PacketKind::Sco),
            0x04 => Some(PacketKind::Event),
            0x05 => Some(PacketKind::Iso),
            _ => None,
        }
    }

    /// The size of the packet header (after the indicator)
    fn header_size(self) -> usize {
        match self {
            PacketKind::Command => 3,
            PacketKind::Acl => 4,
            PacketKind::Sco => 3,
            PacketKind::Event => 2,
            PacketKind::Iso => 4,
        }
    }

    /// Extract the payload length from a complete header
    ///
    /// The position and width of the length field depends on the packet type.
    fn payload_len(self, header: &[u8]) -> usize {
        match self {
            PacketKind::Command => header[2] as usize,
            PacketKind::Acl => <u16>::from_le_bytes([header[2], header[3]]) as usize,
            PacketKind::Sco => header[2] as usize,
            PacketKind::Event => header[1] as usize,
            // the upper two bits of the ISO length field are reserved
            PacketKind::Iso => (<u16>::from_le_bytes([header[2], header[3]]) & 0x3FFF) as usize,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketKind::Command => f.write_str("Command"),
            PacketKind::Acl => f.write_str("ACL"),
            PacketKind::Sco => f.write_str("SCO"),
            PacketKind::Event => f.write_str("Event"),
            PacketKind::Iso => f.write_str("ISO"),
        }
    }
}

/// A complete HCI packet
///
/// The contained bytes are the packet header followed by the packet payload. The packet
/// indicator is not included, it is carried by the `kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    bytes: Vec<u8>,
}

impl Packet {
    pub fn get_kind(&self) -> PacketKind {
        self.kind
    }

    pub fn get_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Convert into the indicator-prefixed form written to the interface
    pub fn into_wire_bytes(self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(1 + self.bytes.len());

        wire.push(self.kind.indicator());
        wire.extend_from_slice(&self.bytes);

        wire
    }
}

#[derive(Clone, Copy)]
enum RecombineState {
    AwaitingIndicator,
    AwaitingHeader(PacketKind),
    AwaitingPayload(PacketKind, usize),
}

/// Recombiner of HCI packets from a chunked byte stream
///
/// Chunk boundaries of the input may fall anywhere, including in the middle of a packet header,
/// and chunks may be empty. Each call to [`feed`](Recombiner::feed) returns at most one
/// complete packet; when a chunk carried more than one packet the remainder stays buffered and
/// is drained by calling `feed` again (an empty chunk works).
pub struct Recombiner {
    state: RecombineState,
    input: VecDeque<u8>,
    assembled: Vec<u8>,
}

impl Recombiner {
    pub fn new() -> Self {
        Recombiner {
            state: RecombineState::AwaitingIndicator,
            input: VecDeque::new(),
            assembled: Vec::new(),
        }
    }

    /// Feed bytes read from the interface
    ///
    /// Returns the next complete packet, or `None` when more bytes are needed.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Packet> {
        self.input.extend(chunk.iter().copied());

        loop {
            match self.state {
                RecombineState::AwaitingIndicator => {
                    let byte = self.input.pop_front()?;

                    match PacketKind::try_from_indicator(byte) {
                        Some(kind) => {
                            self.assembled.clear();
                            self.state = RecombineState::AwaitingHeader(kind);
                        }
                        None => log::error!("dropping unknown packet indicator {:#04x}", byte),
                    }
                }
                RecombineState::AwaitingHeader(kind) => {
                    while self.assembled.len() < kind.header_size() {
                        self.assembled.push(self.input.pop_front()?);
                    }

                    let total = kind.header_size() + kind.payload_len(&self.assembled);

                    self.state = RecombineState::AwaitingPayload(kind, total);
                }
                RecombineState::AwaitingPayload(kind, total) => {
                    while self.assembled.len() < total {
                        self.assembled.push(self.input.pop_front()?);
                    }

                    self.state = RecombineState::AwaitingIndicator;

                    return Some(Packet {
                        kind,
                        bytes: core::mem::take(&mut self.assembled),
                    });
                }
            }
        }
    }
}

impl Default for Recombiner {
    fn default() -> Self {
        Recombiner::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_packet_fed_byte_at_a_time() {
        let data = [0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00];

        let mut recombiner = Recombiner::new();

        for byte in &data[..6] {
            assert_eq!(None, recombiner.feed(core::slice::from_ref(byte)));
        }

        let packet = recombiner.feed(&data[6..]).expect("expected a complete packet");

        assert_eq!(PacketKind::Event, packet.get_kind());
        assert_eq!(&data[1..], packet.get_bytes());
    }

    #[test]
    fn zero_length_chunks_do_not_emit_packets() {
        let mut recombiner = Recombiner::new();

        assert_eq!(None, recombiner.feed(&[]));
        assert_eq!(None, recombiner.feed(&[0x04, 0x13]));
        assert_eq!(None, recombiner.feed(&[]));

        let packet = recombiner.feed(&[0x05, 0x01, 0x01, 0x00, 0x01, 0x00]).unwrap();

        assert_eq!(PacketKind::Event, packet.get_kind());
        assert_eq!(7, packet.get_bytes().len());
    }

    #[test]
    fn two_packets_in_one_chunk_drain_with_empty_feeds() {
        // an ACL data packet followed by a zero parameter event
        let chunk = [0x02, 0x01, 0x00, 0x02, 0x00, 0xAA, 0xBB, 0x04, 0x01, 0x00];

        let mut recombiner = Recombiner::new();

        let first = recombiner.feed(&chunk).unwrap();
        assert_eq!(PacketKind::Acl, first.get_kind());
        assert_eq!(&chunk[1..7], first.get_bytes());

        let second = recombiner.feed(&[]).unwrap();
        assert_eq!(PacketKind::Event, second.get_kind());
        assert_eq!(&chunk[8..], second.get_bytes());

        assert_eq!(None, recombiner.feed(&[]));
    }

    #[test]
    fn chunk_boundary_within_the_header() {
        let mut recombiner = Recombiner::new();

        assert_eq!(None, recombiner.feed(&[0x02, 0x40]));
        assert_eq!(None, recombiner.feed(&[0x00, 0x03]));

        let packet = recombiner.feed(&[0x00, 0x01, 0x02, 0x03]).unwrap();

        assert_eq!(PacketKind::Acl, packet.get_kind());
        assert_eq!(&[0x40, 0x00, 0x03, 0x00, 0x01, 0x02, 0x03], packet.get_bytes());
    }

    #[test]
    fn unknown_indicator_bytes_are_skipped() {
        let mut recombiner = Recombiner::new();

        assert_eq!(None, recombiner.feed(&[0xFF, 0x00]));

        let packet = recombiner.feed(&[0x04, 0x10, 0x01, 0x55]).unwrap();

        assert_eq!(PacketKind::Event, packet.get_kind());
        assert_eq!(&[0x10, 0x01, 0x55], packet.get_bytes());
    }

    #[test]
    fn wire_bytes_round_trip() {
        let wire = [0x04u8, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13];

        let mut recombiner = Recombiner::new();

        let packet = recombiner.feed(&wire).unwrap();

        assert_eq!(wire.to_vec(), packet.into_wire_bytes());
    }
}
