//! Attribute protocol data units
//!
//! An attribute PDU is an opcode byte followed by an opcode specific body. The opcodes are
//! partitioned into the PDUs sent by a client and the PDUs sent by a server; requests pair with
//! the response of the same name, commands and notifications have no pairing, and an indication
//! pairs with the confirmation the client must answer it with.

use core::fmt;
use lazuli_core::Uuid;

/// Attribute PDUs sent by the client
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq)]
pub enum ClientPduName {
    ExchangeMtuRequest,
    FindInformationRequest,
    FindByTypeValueRequest,
    ReadByTypeRequest,
    ReadRequest,
    ReadBlobRequest,
    ReadByGroupTypeRequest,
    WriteRequest,
    WriteCommand,
    HandleValueConfirmation,
}

impl TryFrom<u8> for ClientPduName {
    type Error = ();

    fn try_from(val: u8) -> Result<Self, ()> {
        match val {
            0x02 => Ok(ClientPduName::ExchangeMtuRequest),
            0x04 => Ok(ClientPduName::FindInformationRequest),
            0x06 => Ok(ClientPduName::FindByTypeValueRequest),
            0x08 => Ok(ClientPduName::ReadByTypeRequest),
            0x0A => Ok(ClientPduName::ReadRequest),
            0x0C => Ok(ClientPduName::ReadBlobRequest),
            0x10 => Ok(ClientPduName::ReadByGroupTypeRequest),
            0x12 => Ok(ClientPduName::WriteRequest),
            0x52 => Ok(ClientPduName::WriteCommand),
            0x1E => Ok(ClientPduName::HandleValueConfirmation),
            _ => Err(()),
        }
    }
}

impl From<ClientPduName> for u8 {
    fn from(pdu_name: ClientPduName) -> u8 {
        match pdu_name {
            ClientPduName::ExchangeMtuRequest => 0x02,
            ClientPduName::FindInformationRequest => 0x04,
            ClientPduName::FindByTypeValueRequest => 0x06,
            ClientPduName::ReadByTypeRequest => 0x08,
            ClientPduName::ReadRequest => 0x0A,
            ClientPduName::ReadBlobRequest => 0x0C,
            ClientPduName::ReadByGroupTypeRequest => 0x10,
            ClientPduName::WriteRequest => 0x12,
            ClientPduName::WriteCommand => 0x52,
            ClientPduName::HandleValueConfirmation => 0x1E,
        }
    }
}

impl fmt::Display for ClientPduName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientPduName::ExchangeMtuRequest => f.write_str("exchange mtu request"),
            ClientPduName::FindInformationRequest => f.write_str("find information request"),
            ClientPduName::FindByTypeValueRequest => f.write_str("find by type value request"),
            ClientPduName::ReadByTypeRequest => f.write_str("read by type request"),
            ClientPduName::ReadRequest => f.write_str("read request"),
            ClientPduName::ReadBlobRequest => f.write_str("read blob request"),
            ClientPduName::ReadByGroupTypeRequest => f.write_str("read by group type request"),
            ClientPduName::WriteRequest => f.write_str("write request"),
            ClientPduName::WriteCommand => f.write_str("write command"),
            ClientPduName::HandleValueConfirmation => f.write_str("handle value confirmation"),
        }
    }
}

/// Attribute PDUs sent by the server
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq)]
pub enum ServerPduName {
    ErrorResponse,
    ExchangeMtuResponse,
    FindInformationResponse,
    FindByTypeValueResponse,
    ReadByTypeResponse,
    ReadResponse,
    ReadBlobResponse,
    ReadByGroupTypeResponse,
    WriteResponse,
    HandleValueNotification,
    HandleValueIndication,
}

impl TryFrom<u8> for ServerPduName {
    type Error = ();

    fn try_from(val: u8) -> Result<Self, ()> {
        match val {
            0x01 => Ok(ServerPduName::ErrorResponse),
            0x03 => Ok(ServerPduName::ExchangeMtuResponse),
            0x05 => Ok(ServerPduName::FindInformationResponse),
            0x07 => Ok(ServerPduName::FindByTypeValueResponse),
            0x09 => Ok(ServerPduName::ReadByTypeResponse),
            0x0B => Ok(ServerPduName::ReadResponse),
            0x0D => Ok(ServerPduName::ReadBlobResponse),
            0x11 => Ok(ServerPduName::ReadByGroupTypeResponse),
            0x13 => Ok(ServerPduName::WriteResponse),
            0x1B => Ok(ServerPduName::HandleValueNotification),
            0x1D => Ok(ServerPduName::HandleValueIndication),
            _ => Err(()),
        }
    }
}

impl From<ServerPduName> for u8 {
    fn from(pdu_name: ServerPduName) -> u8 {
        match pdu_name {
            ServerPduName::ErrorResponse => 0x01,
            ServerPduName::ExchangeMtuResponse => 0x03,
            ServerPduName::FindInformationResponse => 0x05,
            ServerPduName::FindByTypeValueResponse => 0x07,
            ServerPduName::ReadByTypeResponse => 0x09,
            ServerPduName::ReadResponse => 0x0B,
            ServerPduName::ReadBlobResponse => 0x0D,
            ServerPduName::ReadByGroupTypeResponse => 0x11,
            ServerPduName::WriteResponse => 0x13,
            ServerPduName::HandleValueNotification => 0x1B,
            ServerPduName::HandleValueIndication => 0x1D,
        }
    }
}

impl fmt::Display for ServerPduName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerPduName::ErrorResponse => f.write_str("error response"),
            ServerPduName::ExchangeMtuResponse => f.write_str("exchange mtu response"),
            ServerPduName::FindInformationResponse => f.write_str("find information response"),
            ServerPduName::FindByTypeValueResponse => f.write_str("find by type value response"),
            ServerPduName::ReadByTypeResponse => f.write_str("read by type response"),
            ServerPduName::ReadResponse => f.write_str("read response"),
            ServerPduName::ReadBlobResponse => f.write_str("read blob response"),
            ServerPduName::ReadByGroupTypeResponse => f.write_str("read by group type response"),
            ServerPduName::WriteResponse => f.write_str("write response"),
            ServerPduName::HandleValueNotification => f.write_str("handle value notification"),
            ServerPduName::HandleValueIndication => f.write_str("handle value indication"),
        }
    }
}

/// The error codes of an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    DatabaseOutOfSync,
    ValueNotAllowed,
    ApplicationError(u8),
    Unknown(u8),
}

impl From<u8> for ErrorCode {
    fn from(raw: u8) -> Self {
        match raw {
            0x01 => ErrorCode::InvalidHandle,
            0x02 => ErrorCode::ReadNotPermitted,
            0x03 => ErrorCode::WriteNotPermitted,
            0x04 => ErrorCode::InvalidPdu,
            0x05 => ErrorCode::InsufficientAuthentication,
            0x06 => ErrorCode::RequestNotSupported,
            0x07 => ErrorCode::InvalidOffset,
            0x08 => ErrorCode::InsufficientAuthorization,
            0x09 => ErrorCode::PrepareQueueFull,
            0x0A => ErrorCode::AttributeNotFound,
            0x0B => ErrorCode::AttributeNotLong,
            0x0C => ErrorCode::InsufficientEncryptionKeySize,
            0x0D => ErrorCode::InvalidAttributeValueLength,
            0x0E => ErrorCode::UnlikelyError,
            0x0F => ErrorCode::InsufficientEncryption,
            0x10 => ErrorCode::UnsupportedGroupType,
            0x11 => ErrorCode::InsufficientResources,
            0x12 => ErrorCode::DatabaseOutOfSync,
            0x13 => ErrorCode::ValueNotAllowed,
            0x80..=0x9F => ErrorCode::ApplicationError(raw),
            _ => ErrorCode::Unknown(raw),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        match code {
            ErrorCode::InvalidHandle => 0x01,
            ErrorCode::ReadNotPermitted => 0x02,
            ErrorCode::WriteNotPermitted => 0x03,
            ErrorCode::InvalidPdu => 0x04,
            ErrorCode::InsufficientAuthentication => 0x05,
            ErrorCode::RequestNotSupported => 0x06,
            ErrorCode::InvalidOffset => 0x07,
            ErrorCode::InsufficientAuthorization => 0x08,
            ErrorCode::PrepareQueueFull => 0x09,
            ErrorCode::AttributeNotFound => 0x0A,
            ErrorCode::AttributeNotLong => 0x0B,
            ErrorCode::InsufficientEncryptionKeySize => 0x0C,
            ErrorCode::InvalidAttributeValueLength => 0x0D,
            ErrorCode::UnlikelyError => 0x0E,
            ErrorCode::InsufficientEncryption => 0x0F,
            ErrorCode::UnsupportedGroupType => 0x10,
            ErrorCode::InsufficientResources => 0x11,
            ErrorCode::DatabaseOutOfSync => 0x12,
            ErrorCode::ValueNotAllowed => 0x13,
            ErrorCode::ApplicationError(raw) | ErrorCode::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorCode::InvalidHandle => f.write_str("invalid handle"),
            ErrorCode::ReadNotPermitted => f.write_str("read not permitted"),
            ErrorCode::WriteNotPermitted => f.write_str("write not permitted"),
            ErrorCode::InvalidPdu => f.write_str("invalid PDU"),
            ErrorCode::InsufficientAuthentication => f.write_str("insufficient authentication"),
            ErrorCode::RequestNotSupported => f.write_str("request not supported"),
            ErrorCode::InvalidOffset => f.write_str("invalid offset"),
            ErrorCode::InsufficientAuthorization => f.write_str("insufficient authorization"),
            ErrorCode::PrepareQueueFull => f.write_str("prepare queue full"),
            ErrorCode::AttributeNotFound => f.write_str("attribute not found"),
            ErrorCode::AttributeNotLong => f.write_str("attribute not long"),
            ErrorCode::InsufficientEncryptionKeySize => f.write_str("insufficient encryption key size"),
            ErrorCode::InvalidAttributeValueLength => f.write_str("invalid attribute value length"),
            ErrorCode::UnlikelyError => f.write_str("unlikely error"),
            ErrorCode::InsufficientEncryption => f.write_str("insufficient encryption"),
            ErrorCode::UnsupportedGroupType => f.write_str("unsupported group type"),
            ErrorCode::InsufficientResources => f.write_str("insufficient resources"),
            ErrorCode::DatabaseOutOfSync => f.write_str("database out of sync"),
            ErrorCode::ValueNotAllowed => f.write_str("value not allowed"),
            ErrorCode::ApplicationError(raw) => write!(f, "application error ({:#04x})", raw),
            ErrorCode::Unknown(raw) => write!(f, "unknown error code ({:#04x})", raw),
        }
    }
}

/// An inclusive range of attribute handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRange {
    pub starting_handle: u16,
    pub ending_handle: u16,
}

impl HandleRange {
    /// The full attribute handle range
    pub const FULL: HandleRange = HandleRange {
        starting_handle: 0x0001,
        ending_handle: 0xFFFF,
    };

    /// Check that the starting handle is neither zero nor past the ending handle
    pub fn is_valid(&self) -> bool {
        self.starting_handle != 0 && self.starting_handle <= self.ending_handle
    }

    fn to_le_bytes(self) -> [u8; 4] {
        let start = self.starting_handle.to_le_bytes();
        let end = self.ending_handle.to_le_bytes();

        [start[0], start[1], end[0], end[1]]
    }
}

/// Error for a PDU body that does not match its opcode's layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFormatError {
    pub pdu: &'static str,
    pub reason: &'static str,
}

impl TransferFormatError {
    fn new(pdu: &'static str, reason: &'static str) -> Self {
        TransferFormatError { pdu, reason }
    }
}

impl fmt::Display for TransferFormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid {} PDU, {}", self.pdu, self.reason)
    }
}

impl std::error::Error for TransferFormatError {}

/// A decoded error response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    pub request_opcode: u8,
    pub attribute_handle: u16,
    pub error: ErrorCode,
}

impl ErrorResponse {
    pub(crate) fn try_from_body(body: &[u8]) -> Result<Self, TransferFormatError> {
        if body.len() != 4 {
            return Err(TransferFormatError::new("error response", "the body must be 4 bytes"));
        }

        Ok(ErrorResponse {
            request_opcode: body[0],
            attribute_handle: <u16>::from_le_bytes([body[1], body[2]]),
            error: ErrorCode::from(body[3]),
        })
    }
}

/// An entry of a read by group type response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByGroupTypeEntry {
    pub attribute_handle: u16,
    pub group_end_handle: u16,
    pub value: Vec<u8>,
}

/// An entry of a read by type response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByTypeEntry {
    pub attribute_handle: u16,
    pub value: Vec<u8>,
}

pub fn exchange_mtu_request(client_rx_mtu: u16) -> Vec<u8> {
    let mut pdu = vec![ClientPduName::ExchangeMtuRequest.into()];

    pdu.extend_from_slice(&client_rx_mtu.to_le_bytes());

    pdu
}

pub fn find_information_request(range: HandleRange) -> Vec<u8> {
    let mut pdu = vec![ClientPduName::FindInformationRequest.into()];

    pdu.extend_from_slice(&range.to_le_bytes());

    pdu
}

pub fn read_by_type_request(range: HandleRange, attribute_type: Uuid) -> Vec<u8> {
    let mut pdu = vec![ClientPduName::ReadByTypeRequest.into()];

    pdu.extend_from_slice(&range.to_le_bytes());
    pdu.extend_from_slice(&attribute_type.to_le_bytes());

    pdu
}

pub fn read_by_group_type_request(range: HandleRange, group_type: Uuid) -> Vec<u8> {
    let mut pdu = vec![ClientPduName::ReadByGroupTypeRequest.into()];

    pdu.extend_from_slice(&range.to_le_bytes());
    pdu.extend_from_slice(&group_type.to_le_bytes());

    pdu
}

pub fn read_request(attribute_handle: u16) -> Vec<u8> {
    let mut pdu = vec![ClientPduName::ReadRequest.into()];

    pdu.extend_from_slice(&attribute_handle.to_le_bytes());

    pdu
}

pub fn read_blob_request(attribute_handle: u16, value_offset: u16) -> Vec<u8> {
    let mut pdu = vec![ClientPduName::ReadBlobRequest.into()];

    pdu.extend_from_slice(&attribute_handle.to_le_bytes());
    pdu.extend_from_slice(&value_offset.to_le_bytes());

    pdu
}

pub fn write_request(attribute_handle: u16, value: &[u8]) -> Vec<u8> {
    let mut pdu = vec![ClientPduName::WriteRequest.into()];

    pdu.extend_from_slice(&attribute_handle.to_le_bytes());
    pdu.extend_from_slice(value);

    pdu
}

pub fn write_command(attribute_handle: u16, value: &[u8]) -> Vec<u8> {
    let mut pdu = vec![ClientPduName::WriteCommand.into()];

    pdu.extend_from_slice(&attribute_handle.to_le_bytes());
    pdu.extend_from_slice(value);

    pdu
}

pub fn handle_value_confirmation() -> Vec<u8> {
    vec![ClientPduName::HandleValueConfirmation.into()]
}

pub(crate) fn parse_exchange_mtu_response(body: &[u8]) -> Result<u16, TransferFormatError> {
    if body.len() != 2 {
        return Err(TransferFormatError::new(
            "exchange mtu response",
            "the body must be 2 bytes",
        ));
    }

    Ok(<u16>::from_le_bytes([body[0], body[1]]))
}

pub(crate) fn parse_find_information_response(body: &[u8]) -> Result<Vec<(u16, Uuid)>, TransferFormatError> {
    let (&format, mut rest) = body
        .split_first()
        .ok_or_else(|| TransferFormatError::new("find information response", "the body is empty"))?;

    let uuid_size = match format {
        0x01 => 2,
        0x02 => 16,
        _ => {
            return Err(TransferFormatError::new(
                "find information response",
                "unknown information data format",
            ))
        }
    };

    let entry_size = 2 + uuid_size;

    if rest.is_empty() || rest.len() % entry_size != 0 {
        return Err(TransferFormatError::new(
            "find information response",
            "the information data does not divide into entries",
        ));
    }

    let mut entries = Vec::with_capacity(rest.len() / entry_size);

    while !rest.is_empty() {
        let (entry, remainder) = rest.split_at(entry_size);

        let handle = <u16>::from_le_bytes([entry[0], entry[1]]);

        let uuid = Uuid::try_from_le_slice(&entry[2..])
            .map_err(|_| TransferFormatError::new("find information response", "invalid UUID"))?;

        entries.push((handle, uuid));

        rest = remainder;
    }

    Ok(entries)
}

pub(crate) fn parse_read_by_type_response(body: &[u8]) -> Result<Vec<ReadByTypeEntry>, TransferFormatError> {
    let (&entry_size, mut rest) = body
        .split_first()
        .ok_or_else(|| TransferFormatError::new("read by type response", "the body is empty"))?;

    let entry_size = entry_size as usize;

    if entry_size < 3 || rest.is_empty() || rest.len() % entry_size != 0 {
        return Err(TransferFormatError::new(
            "read by type response",
            "the attribute data does not divide into entries",
        ));
    }

    let mut entries = Vec::with_capacity(rest.len() / entry_size);

    while !rest.is_empty() {
        let (entry, remainder) = rest.split_at(entry_size);

        entries.push(ReadByTypeEntry {
            attribute_handle: <u16>::from_le_bytes([entry[0], entry[1]]),
            value: entry[2..].to_vec(),
        });

        rest = remainder;
    }

    Ok(entries)
}

pub(crate) fn parse_read_by_group_type_response(body: &[u8]) -> Result<Vec<ReadByGroupTypeEntry>, TransferFormatError> {
    let (&entry_size, mut rest) = body
        .split_first()
        .ok_or_else(|| TransferFormatError::new("read by group type response", "the body is empty"))?;

    let entry_size = entry_size as usize;

    if entry_size < 5 || rest.is_empty() || rest.len() % entry_size != 0 {
        return Err(TransferFormatError::new(
            "read by group type response",
            "the attribute data does not divide into entries",
        ));
    }

    let mut entries = Vec::with_capacity(rest.len() / entry_size);

    while !rest.is_empty() {
        let (entry, remainder) = rest.split_at(entry_size);

        entries.push(ReadByGroupTypeEntry {
            attribute_handle: <u16>::from_le_bytes([entry[0], entry[1]]),
            group_end_handle: <u16>::from_le_bytes([entry[2], entry[3]]),
            value: entry[4..].to_vec(),
        });

        rest = remainder;
    }

    Ok(entries)
}

pub(crate) fn parse_handle_value(body: &[u8]) -> Result<(u16, Vec<u8>), TransferFormatError> {
    if body.len() < 2 {
        return Err(TransferFormatError::new(
            "handle value notification",
            "the body must contain the attribute handle",
        ));
    }

    Ok((<u16>::from_le_bytes([body[0], body[1]]), body[2..].to_vec()))
}
