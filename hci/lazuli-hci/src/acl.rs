//! HCI ACL Data Packets
//!
//! ACL data packets carry connection-oriented data between the host and controller. The packet
//! header contains the connection handle the data is for, a packet boundary flag marking
//! whether the payload starts or continues an L2CAP PDU, a broadcast flag, and the payload
//! length.

use core::fmt;
use lazuli_core::ConnectionHandle;

/// The packet boundary flag
///
/// A two bit flag within the HCI ACL data packet header used to mark fragmentation boundaries.
/// On an LE-U logical link only `FirstNonFlushable` and `ContinuingFragment` are valid.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AclPacketBoundary {
    FirstNonFlushable,
    ContinuingFragment,
    FirstAutoFlushable,
    CompleteL2capPdu,
}

impl AclPacketBoundary {
    /// Get the value shifted into the correct position of the first 16 bits of the header
    fn get_shifted_val(&self) -> u16 {
        (match self {
            AclPacketBoundary::FirstNonFlushable => 0x0,
            AclPacketBoundary::ContinuingFragment => 0x1,
            AclPacketBoundary::FirstAutoFlushable => 0x2,
            AclPacketBoundary::CompleteL2capPdu => 0x3,
        }) << 12
    }

    /// Extract the `AclPacketBoundary` from the first 16 bits of the header
    fn from_shifted_val(val: u16) -> Self {
        match (val >> 12) & 3 {
            0x0 => AclPacketBoundary::FirstNonFlushable,
            0x1 => AclPacketBoundary::ContinuingFragment,
            0x2 => AclPacketBoundary::FirstAutoFlushable,
            _ => AclPacketBoundary::CompleteL2capPdu,
        }
    }

    /// Check if this flag marks the first fragment of an L2CAP PDU
    pub fn is_start(&self) -> bool {
        !matches!(self, AclPacketBoundary::ContinuingFragment)
    }
}

/// The broadcast flag
///
/// Every ACL data packet of an LE-U logical link is point-to-point, so this host only ever
/// produces `NoBroadcast`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AclBroadcastFlag {
    /// Point-to-point message
    NoBroadcast,
    /// Broadcast to all active peripherals
    BrEdrBroadcast,
}

impl AclBroadcastFlag {
    fn get_shifted_val(&self) -> u16 {
        (match self {
            AclBroadcastFlag::NoBroadcast => 0x0,
            AclBroadcastFlag::BrEdrBroadcast => 0x1,
        }) << 14
    }

    fn try_from_shifted_val(val: u16) -> Result<Self, ()> {
        match (val >> 14) & 3 {
            0x0 => Ok(AclBroadcastFlag::NoBroadcast),
            0x1 => Ok(AclBroadcastFlag::BrEdrBroadcast),
            _ => Err(()),
        }
    }
}

/// Error from decoding a HCI ACL data packet
#[derive(Debug)]
pub enum HciAclPacketError {
    PacketTooSmall,
    InvalidBroadcastFlag,
    InvalidConnectionHandle(&'static str),
    InvalidDataTotalLength,
}

impl fmt::Display for HciAclPacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HciAclPacketError::PacketTooSmall => {
                f.write_str("packet is too small to be a valid HCI ACL data packet")
            }
            HciAclPacketError::InvalidBroadcastFlag => f.write_str("invalid broadcast flag"),
            HciAclPacketError::InvalidConnectionHandle(reason) => {
                write!(f, "invalid connection handle, {}", reason)
            }
            HciAclPacketError::InvalidDataTotalLength => {
                f.write_str("the data total length field does not match the received data")
            }
        }
    }
}

impl std::error::Error for HciAclPacketError {}

/// The HCI ACL Data Packet
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HciAclData {
    connection_handle: ConnectionHandle,
    packet_boundary_flag: AclPacketBoundary,
    broadcast_flag: AclBroadcastFlag,
    payload: Vec<u8>,
}

impl HciAclData {
    /// The size of the header of a HCI ACL data packet
    pub const HEADER_SIZE: usize = 4;

    /// The minimum maximum payload size
    ///
    /// Every host and controller must be able to accept a HCI ACL data packet with a payload of
    /// 27 bytes.
    pub const MIN_MAX_PAYLOAD_SIZE: usize = 27;

    /// Create a new `HciAclData`
    ///
    /// # Panic
    /// The payload length must not be larger than the maximum `u16` number
    pub fn new(
        connection_handle: ConnectionHandle,
        packet_boundary_flag: AclPacketBoundary,
        broadcast_flag: AclBroadcastFlag,
        payload: Vec<u8>,
    ) -> Self {
        assert!(payload.len() <= <u16>::MAX.into());

        HciAclData {
            connection_handle,
            packet_boundary_flag,
            broadcast_flag,
            payload,
        }
    }

    pub fn get_handle(&self) -> ConnectionHandle {
        self.connection_handle
    }

    pub fn get_payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn get_packet_boundary_flag(&self) -> AclPacketBoundary {
        self.packet_boundary_flag
    }

    pub fn get_broadcast_flag(&self) -> AclBroadcastFlag {
        self.broadcast_flag
    }

    /// Convert into a raw HCI ACL data packet
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(Self::HEADER_SIZE + self.payload.len());

        let first_2_bytes = self.connection_handle.get_raw_handle()
            | self.packet_boundary_flag.get_shifted_val()
            | self.broadcast_flag.get_shifted_val();

        packet.extend_from_slice(&first_2_bytes.to_le_bytes());
        packet.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        packet.extend_from_slice(&self.payload);

        packet
    }

    /// Attempt to decode a raw HCI ACL data packet
    pub fn try_from_packet(packet: &[u8]) -> Result<Self, HciAclPacketError> {
        if packet.len() < Self::HEADER_SIZE {
            return Err(HciAclPacketError::PacketTooSmall);
        }

        let first_2_bytes = <u16>::from_le_bytes([packet[0], packet[1]]);

        let connection_handle = ConnectionHandle::try_from(first_2_bytes & 0xFFF)
            .map_err(HciAclPacketError::InvalidConnectionHandle)?;

        let packet_boundary_flag = AclPacketBoundary::from_shifted_val(first_2_bytes);

        let broadcast_flag = AclBroadcastFlag::try_from_shifted_val(first_2_bytes)
            .map_err(|_| HciAclPacketError::InvalidBroadcastFlag)?;

        let data_length = <u16>::from_le_bytes([packet[2], packet[3]]) as usize;

        let payload = packet
            .get(Self::HEADER_SIZE..Self::HEADER_SIZE + data_length)
            .ok_or(HciAclPacketError::InvalidDataTotalLength)?
            .to_vec();

        Ok(HciAclData {
            connection_handle,
            packet_boundary_flag,
            broadcast_flag,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u16) -> ConnectionHandle {
        ConnectionHandle::try_from(raw).unwrap()
    }

    #[test]
    fn packet_round_trip() {
        let data = HciAclData::new(
            handle(0x40),
            AclPacketBoundary::FirstNonFlushable,
            AclBroadcastFlag::NoBroadcast,
            vec![1, 2, 3, 4],
        );

        let packet = data.to_packet();

        assert_eq!(vec![0x40, 0x00, 0x04, 0x00, 1, 2, 3, 4], packet);
        assert_eq!(data, HciAclData::try_from_packet(&packet).unwrap());
    }

    #[test]
    fn boundary_flag_bits() {
        let data = HciAclData::new(
            handle(0x0EFF),
            AclPacketBoundary::ContinuingFragment,
            AclBroadcastFlag::NoBroadcast,
            vec![],
        );

        let packet = data.to_packet();

        assert_eq!(vec![0xFF, 0x1E, 0x00, 0x00], packet);

        let decoded = HciAclData::try_from_packet(&packet).unwrap();

        assert_eq!(AclPacketBoundary::ContinuingFragment, decoded.get_packet_boundary_flag());
        assert!(!decoded.get_packet_boundary_flag().is_start());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let packet = [0x40, 0x00, 0x05, 0x00, 1, 2];

        assert!(matches!(
            HciAclData::try_from_packet(&packet),
            Err(HciAclPacketError::InvalidDataTotalLength)
        ));
    }
}
