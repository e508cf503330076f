//! Shared primitives for the `lazuli` Bluetooth LE host stack
//!
//! Everything in this crate is a plain data type used by two or more of the protocol layer
//! crates: the controller error codes, the connection handle, the device address, and the
//! attribute UUID. None of these types perform I/O and none of them depend on an async runtime,
//! so every layer can use them without caring how the host is driven.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod errors;

mod uuid;

pub use uuid::{Uuid, UuidFormatError};

use core::fmt;

/// A handle to an established connection
///
/// A connection handle is assigned by the controller when a connection is made. It is the key
/// every layer above the packet level uses to address the same logical link, from flow control
/// all the way up to the central orchestrator. Raw handle values are restricted to the range
/// zero to [`ConnectionHandle::MAX`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle {
    handle: u16,
}

impl ConnectionHandle {
    /// The maximum raw value of a connection handle
    pub const MAX: ConnectionHandle = ConnectionHandle { handle: 0x0EFF };

    const ERROR: &'static str = "raw connection handle value larger than 0xEFF";

    /// Get the raw value of the connection handle
    pub fn get_raw_handle(&self) -> u16 {
        self.handle
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectionHandle({:#06x})", self.handle)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.handle)
    }
}

impl TryFrom<u16> for ConnectionHandle {
    type Error = &'static str;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        if raw <= ConnectionHandle::MAX.handle {
            Ok(ConnectionHandle { handle: raw })
        } else {
            Err(Self::ERROR)
        }
    }
}

impl TryFrom<[u8; 2]> for ConnectionHandle {
    type Error = &'static str;

    fn try_from(raw: [u8; 2]) -> Result<Self, Self::Error> {
        ConnectionHandle::try_from(<u16>::from_le_bytes(raw))
    }
}

/// A Bluetooth device address
///
/// The bytes are stored in the order they appear over the interface, which is the opposite of
/// the human readable colon-separated form produced by the `Display` implementation.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BluetoothDeviceAddress(pub [u8; 6]);

impl BluetoothDeviceAddress {
    /// Create an address containing all zero bytes
    pub fn zeroed() -> Self {
        BluetoothDeviceAddress([0; 6])
    }
}

impl From<[u8; 6]> for BluetoothDeviceAddress {
    fn from(address: [u8; 6]) -> Self {
        BluetoothDeviceAddress(address)
    }
}

impl fmt::Debug for BluetoothDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for BluetoothDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_handle_range() {
        assert!(ConnectionHandle::try_from(0u16).is_ok());
        assert!(ConnectionHandle::try_from(0x0EFFu16).is_ok());
        assert!(ConnectionHandle::try_from(0x0F00u16).is_err());
    }

    #[test]
    fn connection_handle_from_le_bytes() {
        let handle = ConnectionHandle::try_from([0x40, 0x00]).unwrap();

        assert_eq!(0x40, handle.get_raw_handle());
    }

    #[test]
    fn address_display_reverses_byte_order() {
        let address = BluetoothDeviceAddress([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

        assert_eq!("06:05:04:03:02:01", address.to_string());
    }
}
