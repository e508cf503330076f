//! Command parameters and return parameters
//!
//! Each function here builds the `(command, parameter)` pair for one HCI command, ready to be
//! passed to [`Host::send_command`](crate::Host::send_command). The layouts are fixed by the
//! specification and treated as plain serialize/deserialize contracts.
//!
//! Return parameter parsers take the full return parameter as resolved by the `Host`, which
//! begins with the status byte the `Host` already checked.

use crate::events::parameters::LeAddressType;
use crate::opcodes::{
    ControllerAndBaseband, HciCommand, InformationParameters, LEController, LinkControl,
};
use core::fmt;
use lazuli_core::errors::Error;
use lazuli_core::{BluetoothDeviceAddress, ConnectionHandle};

/// Error for a return parameter that does not match its fixed layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnParameterError {
    command: &'static str,
}

impl ReturnParameterError {
    fn new(command: &'static str) -> Self {
        ReturnParameterError { command }
    }
}

impl fmt::Display for ReturnParameterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid return parameter for command {}", self.command)
    }
}

impl std::error::Error for ReturnParameterError {}

/// The address of a peer to connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub address_type: LeAddressType,
    pub address: BluetoothDeviceAddress,
}

/// The type of scan performed while scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeScanType {
    Passive,
    Active,
}

impl LeScanType {
    fn to_raw(self) -> u8 {
        match self {
            LeScanType::Passive => 0x00,
            LeScanType::Active => 0x01,
        }
    }
}

/// Parameters for the scan commands
///
/// The interval and window are in units of 625 microseconds. The defaults are an active scan
/// with a 10 millisecond interval fully occupied by the scan window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    pub scan_type: LeScanType,
    pub scan_interval: u16,
    pub scan_window: u16,
    pub own_address_type: LeAddressType,
}

impl Default for ScanParameters {
    fn default() -> Self {
        ScanParameters {
            scan_type: LeScanType::Active,
            scan_interval: 0x0010,
            scan_window: 0x0010,
            own_address_type: LeAddressType::Public,
        }
    }
}

/// Parameters for the create connection commands
///
/// The connection interval, latency, and supervision timeout are passed through in controller
/// units. The defaults request a 30 to 50 millisecond connection interval with a 5 second
/// supervision timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub scan_interval: u16,
    pub scan_window: u16,
    pub interval_min: u16,
    pub interval_max: u16,
    pub max_latency: u16,
    pub supervision_timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
    pub own_address_type: LeAddressType,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        ConnectionParameters {
            scan_interval: 0x0060,
            scan_window: 0x0030,
            interval_min: 0x0018,
            interval_max: 0x0028,
            max_latency: 0,
            supervision_timeout: 0x01F4,
            min_ce_length: 0,
            max_ce_length: 0,
            own_address_type: LeAddressType::Public,
        }
    }
}

pub fn reset() -> (HciCommand, Vec<u8>) {
    (HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset), Vec::new())
}

pub fn disconnect(handle: ConnectionHandle, reason: Error) -> (HciCommand, Vec<u8>) {
    let mut parameter = handle.get_raw_handle().to_le_bytes().to_vec();

    parameter.push(reason.into());

    (HciCommand::LinkControl(LinkControl::Disconnect), parameter)
}

pub fn read_remote_version_information(handle: ConnectionHandle) -> (HciCommand, Vec<u8>) {
    (
        HciCommand::LinkControl(LinkControl::ReadRemoteVersionInformation),
        handle.get_raw_handle().to_le_bytes().to_vec(),
    )
}

pub fn read_local_supported_commands() -> (HciCommand, Vec<u8>) {
    (
        HciCommand::InformationParameters(InformationParameters::ReadLocalSupportedCommands),
        Vec::new(),
    )
}

pub fn read_buffer_size() -> (HciCommand, Vec<u8>) {
    (
        HciCommand::InformationParameters(InformationParameters::ReadBufferSize),
        Vec::new(),
    )
}

pub fn le_read_buffer_size() -> (HciCommand, Vec<u8>) {
    (HciCommand::LEController(LEController::ReadBufferSize), Vec::new())
}

pub fn le_read_remote_features(handle: ConnectionHandle) -> (HciCommand, Vec<u8>) {
    (
        HciCommand::LEController(LEController::ReadRemoteFeatures),
        handle.get_raw_handle().to_le_bytes().to_vec(),
    )
}

pub fn le_set_scan_parameters(sp: &ScanParameters) -> (HciCommand, Vec<u8>) {
    let mut parameter = Vec::with_capacity(7);

    parameter.push(sp.scan_type.to_raw());
    parameter.extend_from_slice(&sp.scan_interval.to_le_bytes());
    parameter.extend_from_slice(&sp.scan_window.to_le_bytes());
    parameter.push(sp.own_address_type.to_raw());
    // scanning filter policy: accept all advertising packets
    parameter.push(0x00);

    (HciCommand::LEController(LEController::SetScanParameters), parameter)
}

pub fn le_set_scan_enable(enable: bool, filter_duplicates: bool) -> (HciCommand, Vec<u8>) {
    let parameter = vec![enable as u8, filter_duplicates as u8];

    (HciCommand::LEController(LEController::SetScanEnable), parameter)
}

pub fn le_set_extended_scan_parameters(sp: &ScanParameters) -> (HciCommand, Vec<u8>) {
    let mut parameter = Vec::with_capacity(8);

    parameter.push(sp.own_address_type.to_raw());
    // scanning filter policy: accept all advertising packets
    parameter.push(0x00);
    // scan the LE 1M PHY only
    parameter.push(0x01);
    parameter.push(sp.scan_type.to_raw());
    parameter.extend_from_slice(&sp.scan_interval.to_le_bytes());
    parameter.extend_from_slice(&sp.scan_window.to_le_bytes());

    (
        HciCommand::LEController(LEController::SetExtendedScanParameters),
        parameter,
    )
}

pub fn le_set_extended_scan_enable(enable: bool, filter_duplicates: bool) -> (HciCommand, Vec<u8>) {
    let mut parameter = Vec::with_capacity(6);

    parameter.push(enable as u8);
    parameter.push(filter_duplicates as u8);
    // scan continuously, no duration or period
    parameter.extend_from_slice(&0u16.to_le_bytes());
    parameter.extend_from_slice(&0u16.to_le_bytes());

    (HciCommand::LEController(LEController::SetExtendedScanEnable), parameter)
}

pub fn le_create_connection(peer: PeerAddress, cp: &ConnectionParameters) -> (HciCommand, Vec<u8>) {
    let mut parameter = Vec::with_capacity(25);

    parameter.extend_from_slice(&cp.scan_interval.to_le_bytes());
    parameter.extend_from_slice(&cp.scan_window.to_le_bytes());
    // initiator filter policy: do not use the filter accept list
    parameter.push(0x00);
    parameter.push(peer.address_type.to_raw());
    parameter.extend_from_slice(&peer.address.0);
    parameter.push(cp.own_address_type.to_raw());
    parameter.extend_from_slice(&cp.interval_min.to_le_bytes());
    parameter.extend_from_slice(&cp.interval_max.to_le_bytes());
    parameter.extend_from_slice(&cp.max_latency.to_le_bytes());
    parameter.extend_from_slice(&cp.supervision_timeout.to_le_bytes());
    parameter.extend_from_slice(&cp.min_ce_length.to_le_bytes());
    parameter.extend_from_slice(&cp.max_ce_length.to_le_bytes());

    (HciCommand::LEController(LEController::CreateConnection), parameter)
}

pub fn le_extended_create_connection(peer: PeerAddress, cp: &ConnectionParameters) -> (HciCommand, Vec<u8>) {
    let mut parameter = Vec::with_capacity(26);

    // initiator filter policy: do not use the filter accept list
    parameter.push(0x00);
    parameter.push(cp.own_address_type.to_raw());
    parameter.push(peer.address_type.to_raw());
    parameter.extend_from_slice(&peer.address.0);
    // initiate on the LE 1M PHY only
    parameter.push(0x01);
    parameter.extend_from_slice(&cp.scan_interval.to_le_bytes());
    parameter.extend_from_slice(&cp.scan_window.to_le_bytes());
    parameter.extend_from_slice(&cp.interval_min.to_le_bytes());
    parameter.extend_from_slice(&cp.interval_max.to_le_bytes());
    parameter.extend_from_slice(&cp.max_latency.to_le_bytes());
    parameter.extend_from_slice(&cp.supervision_timeout.to_le_bytes());
    parameter.extend_from_slice(&cp.min_ce_length.to_le_bytes());
    parameter.extend_from_slice(&cp.max_ce_length.to_le_bytes());

    (
        HciCommand::LEController(LEController::ExtendedCreateConnection),
        parameter,
    )
}

pub fn le_create_connection_cancel() -> (HciCommand, Vec<u8>) {
    (
        HciCommand::LEController(LEController::CreateConnectionCancel),
        Vec::new(),
    )
}

/// The supported commands bit mask returned by *Read Local Supported Commands*
#[derive(Debug, Clone, Copy)]
pub struct SupportedCommands {
    mask: [u8; 64],
}

impl SupportedCommands {
    pub fn try_from_return(return_parameter: &[u8]) -> Result<Self, ReturnParameterError> {
        let bytes = return_parameter
            .get(1..65)
            .ok_or_else(|| ReturnParameterError::new("Read Local Supported Commands"))?;

        let mut mask = [0u8; 64];

        mask.copy_from_slice(bytes);

        Ok(SupportedCommands { mask })
    }

    /// Check for a command by its octet and bit position within the mask
    pub fn is_supported(&self, octet: usize, bit: usize) -> bool {
        self.mask.get(octet).map(|byte| byte & (1 << bit) != 0).unwrap_or(false)
    }

    /// Check for the extended scan and connect command family
    ///
    /// All three of *LE Set Extended Scan Parameters*, *LE Set Extended Scan Enable*, and
    /// *LE Extended Create Connection* must be supported for the extended family to be usable.
    pub fn supports_extended_scan_and_connect(&self) -> bool {
        self.is_supported(37, 5) && self.is_supported(37, 6) && self.is_supported(37, 7)
    }
}

/// The LE data buffer information returned by *LE Read Buffer Size*
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeBufferSize {
    pub le_acl_data_packet_length: u16,
    pub total_num_le_acl_data_packets: u8,
}

impl LeBufferSize {
    pub fn try_from_return(return_parameter: &[u8]) -> Result<Self, ReturnParameterError> {
        let bytes = return_parameter
            .get(1..4)
            .ok_or_else(|| ReturnParameterError::new("LE Read Buffer Size"))?;

        Ok(LeBufferSize {
            le_acl_data_packet_length: <u16>::from_le_bytes([bytes[0], bytes[1]]),
            total_num_le_acl_data_packets: bytes[2],
        })
    }

    /// Check if the controller has no dedicated LE data buffer
    ///
    /// When there is no dedicated LE buffer pool the shared buffer reported by *Read Buffer
    /// Size* is used instead.
    pub fn is_unavailable(&self) -> bool {
        self.le_acl_data_packet_length == 0 || self.total_num_le_acl_data_packets == 0
    }
}

/// The shared data buffer information returned by *Read Buffer Size*
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSize {
    pub acl_data_packet_length: u16,
    pub total_num_acl_data_packets: u16,
}

impl BufferSize {
    pub fn try_from_return(return_parameter: &[u8]) -> Result<Self, ReturnParameterError> {
        let bytes = return_parameter
            .get(1..8)
            .ok_or_else(|| ReturnParameterError::new("Read Buffer Size"))?;

        Ok(BufferSize {
            acl_data_packet_length: <u16>::from_le_bytes([bytes[0], bytes[1]]),
            total_num_acl_data_packets: <u16>::from_le_bytes([bytes[3], bytes[4]]),
        })
    }
}
