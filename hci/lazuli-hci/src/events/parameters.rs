//! Event parameter types
//!
//! Every event carries a parameter specific to its event code. The types here are the decoded
//! forms of the parameters for the events this host processes. Decoding walks the parameter
//! bytes front to back; any parameter shorter than its fixed layout produces an
//! [`EventError::IncompleteParameter`](super::EventError).

use super::EventError;
use lazuli_core::errors::Error;
use lazuli_core::{BluetoothDeviceAddress, ConnectionHandle};

fn take<'a>(param: &mut &'a [u8], len: usize) -> Result<&'a [u8], EventError> {
    if param.len() < len {
        return Err(EventError::IncompleteParameter);
    }

    let (front, rest) = param.split_at(len);

    *param = rest;

    Ok(front)
}

fn take_u8(param: &mut &[u8]) -> Result<u8, EventError> {
    Ok(take(param, 1)?[0])
}

fn take_u16(param: &mut &[u8]) -> Result<u16, EventError> {
    let bytes = take(param, 2)?;

    Ok(<u16>::from_le_bytes([bytes[0], bytes[1]]))
}

fn take_status(param: &mut &[u8]) -> Result<Error, EventError> {
    Ok(Error::from(take_u8(param)?))
}

fn take_handle(param: &mut &[u8]) -> Result<ConnectionHandle, EventError> {
    // the upper 4 bits of the handle field are reserved
    ConnectionHandle::try_from(take_u16(param)? & 0xFFF).map_err(|_| EventError::IncompleteParameter)
}

fn take_address(param: &mut &[u8]) -> Result<BluetoothDeviceAddress, EventError> {
    let bytes = take(param, 6)?;

    let mut address = [0u8; 6];

    address.copy_from_slice(bytes);

    Ok(BluetoothDeviceAddress(address))
}

/// The role of this device within a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeRole {
    Central,
    Peripheral,
}

impl LeRole {
    fn try_from_raw(raw: u8) -> Result<Self, EventError> {
        match raw {
            0x00 => Ok(LeRole::Central),
            0x01 => Ok(LeRole::Peripheral),
            _ => Err(EventError::InvalidParameterValue("role", raw)),
        }
    }
}

/// The type of a peer device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeAddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl LeAddressType {
    pub fn to_raw(self) -> u8 {
        match self {
            LeAddressType::Public => 0x00,
            LeAddressType::Random => 0x01,
            LeAddressType::PublicIdentity => 0x02,
            LeAddressType::RandomIdentity => 0x03,
        }
    }

    pub(crate) fn try_from_raw(raw: u8) -> Result<Self, EventError> {
        match raw {
            0x00 => Ok(LeAddressType::Public),
            0x01 => Ok(LeAddressType::Random),
            0x02 => Ok(LeAddressType::PublicIdentity),
            0x03 => Ok(LeAddressType::RandomIdentity),
            _ => Err(EventError::InvalidParameterValue("address type", raw)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandCompleteData {
    pub number_of_hci_command_packets: u8,
    /// The opcode of the completed command, `None` when the event only updates the number of
    /// command packets the controller can accept
    pub command_opcode: Option<u16>,
    /// The return parameter of the command, starting with the status byte
    pub return_parameter: Vec<u8>,
}

impl CommandCompleteData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        let number_of_hci_command_packets = take_u8(&mut p)?;

        let raw_opcode = take_u16(&mut p)?;

        Ok(CommandCompleteData {
            number_of_hci_command_packets,
            command_opcode: (raw_opcode != 0).then_some(raw_opcode),
            return_parameter: p.to_vec(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommandStatusData {
    pub status: Error,
    pub number_of_hci_command_packets: u8,
    /// The opcode of the command this status is for, `None` when the event only updates the
    /// number of command packets the controller can accept
    pub command_opcode: Option<u16>,
}

impl CommandStatusData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        let status = take_status(&mut p)?;
        let number_of_hci_command_packets = take_u8(&mut p)?;
        let raw_opcode = take_u16(&mut p)?;

        Ok(CommandStatusData {
            status,
            number_of_hci_command_packets,
            command_opcode: (raw_opcode != 0).then_some(raw_opcode),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DisconnectionCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub reason: Error,
}

impl DisconnectionCompleteData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        Ok(DisconnectionCompleteData {
            status: take_status(&mut p)?,
            connection_handle: take_handle(&mut p)?,
            reason: take_status(&mut p)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionChangeData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub encryption_enabled: bool,
}

impl EncryptionChangeData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        Ok(EncryptionChangeData {
            status: take_status(&mut p)?,
            connection_handle: take_handle(&mut p)?,
            encryption_enabled: take_u8(&mut p)? != 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReadRemoteVersionInformationCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub version: u8,
    pub manufacturer_name: u16,
    pub subversion: u16,
}

impl ReadRemoteVersionInformationCompleteData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        Ok(ReadRemoteVersionInformationCompleteData {
            status: take_status(&mut p)?,
            connection_handle: take_handle(&mut p)?,
            version: take_u8(&mut p)?,
            manufacturer_name: take_u16(&mut p)?,
            subversion: take_u16(&mut p)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NumberOfCompletedPacketsData {
    pub connection_handle: ConnectionHandle,
    pub completed_packets: u16,
}

impl NumberOfCompletedPacketsData {
    /// The parameter holds an array of connection handles followed by an array of counts.
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Vec<Self>, EventError> {
        let count = take_u8(&mut p)? as usize;

        let mut handles = Vec::with_capacity(count);

        for _ in 0..count {
            handles.push(take_handle(&mut p)?);
        }

        let mut entries = Vec::with_capacity(count);

        for connection_handle in handles {
            entries.push(NumberOfCompletedPacketsData {
                connection_handle,
                completed_packets: take_u16(&mut p)?,
            });
        }

        Ok(entries)
    }
}

#[derive(Debug, Clone)]
pub struct LeConnectionCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub role: LeRole,
    pub peer_address_type: LeAddressType,
    pub peer_address: BluetoothDeviceAddress,
    pub connection_interval: u16,
    pub peripheral_latency: u16,
    pub supervision_timeout: u16,
    pub central_clock_accuracy: u8,
}

impl LeConnectionCompleteData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        let status = take_status(&mut p)?;

        if status != Error::NoError {
            // the remaining fields are not meaningful on a failed connection, but the handle
            // field is still present and everything after it may be garbage
            let connection_handle = take_handle(&mut p).unwrap_or(ConnectionHandle::MAX);

            return Ok(LeConnectionCompleteData {
                status,
                connection_handle,
                role: LeRole::Central,
                peer_address_type: LeAddressType::Public,
                peer_address: BluetoothDeviceAddress::zeroed(),
                connection_interval: 0,
                peripheral_latency: 0,
                supervision_timeout: 0,
                central_clock_accuracy: 0,
            });
        }

        Ok(LeConnectionCompleteData {
            status,
            connection_handle: take_handle(&mut p)?,
            role: LeRole::try_from_raw(take_u8(&mut p)?)?,
            peer_address_type: LeAddressType::try_from_raw(take_u8(&mut p)?)?,
            peer_address: take_address(&mut p)?,
            connection_interval: take_u16(&mut p)?,
            peripheral_latency: take_u16(&mut p)?,
            supervision_timeout: take_u16(&mut p)?,
            central_clock_accuracy: take_u8(&mut p)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LeEnhancedConnectionCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub role: LeRole,
    pub peer_address_type: LeAddressType,
    pub peer_address: BluetoothDeviceAddress,
    pub local_resolvable_private_address: BluetoothDeviceAddress,
    pub peer_resolvable_private_address: BluetoothDeviceAddress,
    pub connection_interval: u16,
    pub peripheral_latency: u16,
    pub supervision_timeout: u16,
    pub central_clock_accuracy: u8,
}

impl LeEnhancedConnectionCompleteData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        let status = take_status(&mut p)?;

        if status != Error::NoError {
            let connection_handle = take_handle(&mut p).unwrap_or(ConnectionHandle::MAX);

            return Ok(LeEnhancedConnectionCompleteData {
                status,
                connection_handle,
                role: LeRole::Central,
                peer_address_type: LeAddressType::Public,
                peer_address: BluetoothDeviceAddress::zeroed(),
                local_resolvable_private_address: BluetoothDeviceAddress::zeroed(),
                peer_resolvable_private_address: BluetoothDeviceAddress::zeroed(),
                connection_interval: 0,
                peripheral_latency: 0,
                supervision_timeout: 0,
                central_clock_accuracy: 0,
            });
        }

        Ok(LeEnhancedConnectionCompleteData {
            status,
            connection_handle: take_handle(&mut p)?,
            role: LeRole::try_from_raw(take_u8(&mut p)?)?,
            peer_address_type: LeAddressType::try_from_raw(take_u8(&mut p)?)?,
            peer_address: take_address(&mut p)?,
            local_resolvable_private_address: take_address(&mut p)?,
            peer_resolvable_private_address: take_address(&mut p)?,
            connection_interval: take_u16(&mut p)?,
            peripheral_latency: take_u16(&mut p)?,
            supervision_timeout: take_u16(&mut p)?,
            central_clock_accuracy: take_u8(&mut p)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LeAdvertisingReportData {
    pub event_type: u8,
    pub address_type: LeAddressType,
    pub address: BluetoothDeviceAddress,
    pub data: Vec<u8>,
    pub rssi: i8,
}

impl LeAdvertisingReportData {
    /// The parameter holds a report count followed by one array per field.
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Vec<Self>, EventError> {
        let count = take_u8(&mut p)? as usize;

        let mut event_types = Vec::with_capacity(count);
        let mut address_types = Vec::with_capacity(count);
        let mut addresses = Vec::with_capacity(count);
        let mut data_lengths = Vec::with_capacity(count);
        let mut datas = Vec::with_capacity(count);

        for _ in 0..count {
            event_types.push(take_u8(&mut p)?);
        }
        for _ in 0..count {
            address_types.push(LeAddressType::try_from_raw(take_u8(&mut p)?)?);
        }
        for _ in 0..count {
            addresses.push(take_address(&mut p)?);
        }
        for _ in 0..count {
            data_lengths.push(take_u8(&mut p)? as usize);
        }
        for len in &data_lengths {
            datas.push(take(&mut p, *len)?.to_vec());
        }

        let mut reports = Vec::with_capacity(count);

        // rssi array is last
        for i in 0..count {
            reports.push(LeAdvertisingReportData {
                event_type: event_types[i],
                address_type: address_types[i],
                address: addresses[i],
                data: core::mem::take(&mut datas[i]),
                rssi: take_u8(&mut p)? as i8,
            });
        }

        Ok(reports)
    }
}

#[derive(Debug, Clone)]
pub struct LeExtendedAdvertisingReportData {
    pub event_type: u16,
    pub address_type: LeAddressType,
    pub address: BluetoothDeviceAddress,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub advertising_sid: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub periodic_advertising_interval: u16,
    pub direct_address_type: u8,
    pub direct_address: BluetoothDeviceAddress,
    pub data: Vec<u8>,
}

impl LeExtendedAdvertisingReportData {
    /// Unlike the legacy report, the extended report parameter carries each report's fields
    /// together.
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Vec<Self>, EventError> {
        let count = take_u8(&mut p)? as usize;

        let mut reports = Vec::with_capacity(count);

        for _ in 0..count {
            let event_type = take_u16(&mut p)?;
            let address_type = LeAddressType::try_from_raw(take_u8(&mut p)?)?;
            let address = take_address(&mut p)?;
            let primary_phy = take_u8(&mut p)?;
            let secondary_phy = take_u8(&mut p)?;
            let advertising_sid = take_u8(&mut p)?;
            let tx_power = take_u8(&mut p)? as i8;
            let rssi = take_u8(&mut p)? as i8;
            let periodic_advertising_interval = take_u16(&mut p)?;
            let direct_address_type = take_u8(&mut p)?;
            let direct_address = take_address(&mut p)?;
            let data_len = take_u8(&mut p)? as usize;
            let data = take(&mut p, data_len)?.to_vec();

            reports.push(LeExtendedAdvertisingReportData {
                event_type,
                address_type,
                address,
                primary_phy,
                secondary_phy,
                advertising_sid,
                tx_power,
                rssi,
                periodic_advertising_interval,
                direct_address_type,
                direct_address,
                data,
            });
        }

        Ok(reports)
    }
}

#[derive(Debug, Clone)]
pub struct LeConnectionUpdateCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub connection_interval: u16,
    pub peripheral_latency: u16,
    pub supervision_timeout: u16,
}

impl LeConnectionUpdateCompleteData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        Ok(LeConnectionUpdateCompleteData {
            status: take_status(&mut p)?,
            connection_handle: take_handle(&mut p)?,
            connection_interval: take_u16(&mut p)?,
            peripheral_latency: take_u16(&mut p)?,
            supervision_timeout: take_u16(&mut p)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LeReadRemoteFeaturesCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub features: [u8; 8],
}

impl LeReadRemoteFeaturesCompleteData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        let status = take_status(&mut p)?;
        let connection_handle = take_handle(&mut p)?;

        let mut features = [0u8; 8];

        if status == Error::NoError {
            features.copy_from_slice(take(&mut p, 8)?);
        }

        Ok(LeReadRemoteFeaturesCompleteData {
            status,
            connection_handle,
            features,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LeDataLengthChangeData {
    pub connection_handle: ConnectionHandle,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
}

impl LeDataLengthChangeData {
    pub(crate) fn try_from_parameter(mut p: &[u8]) -> Result<Self, EventError> {
        Ok(LeDataLengthChangeData {
            connection_handle: take_handle(&mut p)?,
            max_tx_octets: take_u16(&mut p)?,
            max_tx_time: take_u16(&mut p)?,
            max_rx_octets: take_u16(&mut p)?,
            max_rx_time: take_u16(&mut p)?,
        })
    }
}
