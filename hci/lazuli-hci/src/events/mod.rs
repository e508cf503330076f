//! Host Controller Interface Events
//!
//! Events are the asynchronous notifications sent by the controller. [`Events`] enumerates the
//! event kinds processed by this host and [`EventsData`] carries the decoded parameter for each
//! of them. Keeping the two as closed enumerations means a newly routed event kind that is not
//! handled somewhere shows up as a compile error instead of silently going nowhere.
//!
//! The event packet format is an event code byte, a parameter length byte, and then the
//! parameter. The LE events share the single *LE Meta* event code; the first parameter byte is
//! the sub event code enumerated by [`LeMeta`].

pub mod parameters;

use core::fmt;
use parameters::{
    CommandCompleteData, CommandStatusData, DisconnectionCompleteData, EncryptionChangeData,
    LeAdvertisingReportData, LeConnectionCompleteData, LeConnectionUpdateCompleteData, LeDataLengthChangeData,
    LeEnhancedConnectionCompleteData, LeExtendedAdvertisingReportData, LeReadRemoteFeaturesCompleteData,
    NumberOfCompletedPacketsData, ReadRemoteVersionInformationCompleteData,
};

/// The sub events of the *LE Meta* event
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LeMeta {
    ConnectionComplete,
    AdvertisingReport,
    ConnectionUpdateComplete,
    ReadRemoteFeaturesComplete,
    DataLengthChange,
    EnhancedConnectionComplete,
    ExtendedAdvertisingReport,
}

impl LeMeta {
    /// Get the sub event code for the `LeMeta` event
    pub fn get_sub_code(&self) -> u8 {
        match self {
            LeMeta::ConnectionComplete => 0x01,
            LeMeta::AdvertisingReport => 0x02,
            LeMeta::ConnectionUpdateComplete => 0x03,
            LeMeta::ReadRemoteFeaturesComplete => 0x04,
            LeMeta::DataLengthChange => 0x07,
            LeMeta::EnhancedConnectionComplete => 0x0A,
            LeMeta::ExtendedAdvertisingReport => 0x0D,
        }
    }

    /// Try to create a `LeMeta` event from its sub event code
    pub fn try_from_sub_code(sub_event_code: u8) -> Result<Self, EventError> {
        match sub_event_code {
            0x01 => Ok(LeMeta::ConnectionComplete),
            0x02 => Ok(LeMeta::AdvertisingReport),
            0x03 => Ok(LeMeta::ConnectionUpdateComplete),
            0x04 => Ok(LeMeta::ReadRemoteFeaturesComplete),
            0x07 => Ok(LeMeta::DataLengthChange),
            0x0A => Ok(LeMeta::EnhancedConnectionComplete),
            0x0D => Ok(LeMeta::ExtendedAdvertisingReport),
            code => Err(EventError::UnknownLeSubEventCode(code)),
        }
    }
}

/// The events processed by this host
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Events {
    DisconnectionComplete,
    EncryptionChange,
    ReadRemoteVersionInformationComplete,
    CommandComplete,
    CommandStatus,
    NumberOfCompletedPackets,
    LeMeta(LeMeta),
}

impl Events {
    /// Get the event code
    ///
    /// For a `LeMeta` event this is the code of the meta event itself, the sub event code is
    /// acquired from [`LeMeta::get_sub_code`].
    pub fn get_event_code(&self) -> u8 {
        match self {
            Events::DisconnectionComplete => 0x05,
            Events::EncryptionChange => 0x08,
            Events::ReadRemoteVersionInformationComplete => 0x0C,
            Events::CommandComplete => 0x0E,
            Events::CommandStatus => 0x0F,
            Events::NumberOfCompletedPackets => 0x13,
            Events::LeMeta(_) => 0x3E,
        }
    }
}

/// Decoded event data
#[derive(Debug, Clone)]
pub enum EventsData {
    DisconnectionComplete(DisconnectionCompleteData),
    EncryptionChange(EncryptionChangeData),
    ReadRemoteVersionInformationComplete(ReadRemoteVersionInformationCompleteData),
    CommandComplete(CommandCompleteData),
    CommandStatus(CommandStatusData),
    NumberOfCompletedPackets(Vec<NumberOfCompletedPacketsData>),
    LeMeta(LeMetaData),
}

impl EventsData {
    /// Get the event enumeration for this event data
    pub fn get_event(&self) -> Events {
        match self {
            EventsData::DisconnectionComplete(_) => Events::DisconnectionComplete,
            EventsData::EncryptionChange(_) => Events::EncryptionChange,
            EventsData::ReadRemoteVersionInformationComplete(_) => Events::ReadRemoteVersionInformationComplete,
            EventsData::CommandComplete(_) => Events::CommandComplete,
            EventsData::CommandStatus(_) => Events::CommandStatus,
            EventsData::NumberOfCompletedPackets(_) => Events::NumberOfCompletedPackets,
            EventsData::LeMeta(meta) => Events::LeMeta(meta.get_sub_event()),
        }
    }

    /// Try to decode an event packet
    ///
    /// The input is a full event packet, starting with the event code byte.
    pub fn try_from_packet(packet: &[u8]) -> Result<Self, EventError> {
        if packet.len() < 2 {
            return Err(EventError::IncompleteParameter);
        }

        let event_code = packet[0];
        let length = packet[1] as usize;

        let parameter = packet.get(2..2 + length).ok_or(EventError::IncompleteParameter)?;

        match event_code {
            0x05 => DisconnectionCompleteData::try_from_parameter(parameter).map(EventsData::DisconnectionComplete),
            0x08 => EncryptionChangeData::try_from_parameter(parameter).map(EventsData::EncryptionChange),
            0x0C => ReadRemoteVersionInformationCompleteData::try_from_parameter(parameter)
                .map(EventsData::ReadRemoteVersionInformationComplete),
            0x0E => CommandCompleteData::try_from_parameter(parameter).map(EventsData::CommandComplete),
            0x0F => CommandStatusData::try_from_parameter(parameter).map(EventsData::CommandStatus),
            0x13 => {
                NumberOfCompletedPacketsData::try_from_parameter(parameter).map(EventsData::NumberOfCompletedPackets)
            }
            0x3E => LeMetaData::try_from_parameter(parameter).map(EventsData::LeMeta),
            code => Err(EventError::UnknownEventCode(code)),
        }
    }
}

/// Decoded *LE Meta* sub event data
#[derive(Debug, Clone)]
pub enum LeMetaData {
    ConnectionComplete(LeConnectionCompleteData),
    AdvertisingReport(Vec<LeAdvertisingReportData>),
    ConnectionUpdateComplete(LeConnectionUpdateCompleteData),
    ReadRemoteFeaturesComplete(LeReadRemoteFeaturesCompleteData),
    DataLengthChange(LeDataLengthChangeData),
    EnhancedConnectionComplete(LeEnhancedConnectionCompleteData),
    ExtendedAdvertisingReport(Vec<LeExtendedAdvertisingReportData>),
}

impl LeMetaData {
    /// Get the sub event enumeration for this sub event data
    pub fn get_sub_event(&self) -> LeMeta {
        match self {
            LeMetaData::ConnectionComplete(_) => LeMeta::ConnectionComplete,
            LeMetaData::AdvertisingReport(_) => LeMeta::AdvertisingReport,
            LeMetaData::ConnectionUpdateComplete(_) => LeMeta::ConnectionUpdateComplete,
            LeMetaData::ReadRemoteFeaturesComplete(_) => LeMeta::ReadRemoteFeaturesComplete,
            LeMetaData::DataLengthChange(_) => LeMeta::DataLengthChange,
            LeMetaData::EnhancedConnectionComplete(_) => LeMeta::EnhancedConnectionComplete,
            LeMetaData::ExtendedAdvertisingReport(_) => LeMeta::ExtendedAdvertisingReport,
        }
    }

    fn try_from_parameter(parameter: &[u8]) -> Result<Self, EventError> {
        let (&sub_code, sub_parameter) = parameter.split_first().ok_or(EventError::IncompleteParameter)?;

        match LeMeta::try_from_sub_code(sub_code)? {
            LeMeta::ConnectionComplete => {
                LeConnectionCompleteData::try_from_parameter(sub_parameter).map(LeMetaData::ConnectionComplete)
            }
            LeMeta::AdvertisingReport => {
                LeAdvertisingReportData::try_from_parameter(sub_parameter).map(LeMetaData::AdvertisingReport)
            }
            LeMeta::ConnectionUpdateComplete => LeConnectionUpdateCompleteData::try_from_parameter(sub_parameter)
                .map(LeMetaData::ConnectionUpdateComplete),
            LeMeta::ReadRemoteFeaturesComplete => LeReadRemoteFeaturesCompleteData::try_from_parameter(sub_parameter)
                .map(LeMetaData::ReadRemoteFeaturesComplete),
            LeMeta::DataLengthChange => {
                LeDataLengthChangeData::try_from_parameter(sub_parameter).map(LeMetaData::DataLengthChange)
            }
            LeMeta::EnhancedConnectionComplete => LeEnhancedConnectionCompleteData::try_from_parameter(sub_parameter)
                .map(LeMetaData::EnhancedConnectionComplete),
            LeMeta::ExtendedAdvertisingReport => LeExtendedAdvertisingReportData::try_from_parameter(sub_parameter)
                .map(LeMetaData::ExtendedAdvertisingReport),
        }
    }
}

/// Error for event packets that could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    IncompleteParameter,
    UnknownEventCode(u8),
    UnknownLeSubEventCode(u8),
    InvalidParameterValue(&'static str, u8),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventError::IncompleteParameter => f.write_str("the event parameter is incomplete"),
            EventError::UnknownEventCode(code) => write!(f, "unknown event code {:#04x}", code),
            EventError::UnknownLeSubEventCode(code) => {
                write!(f, "unknown LE meta sub event code {:#04x}", code)
            }
            EventError::InvalidParameterValue(field, value) => {
                write!(f, "invalid value {:#04x} for event parameter field '{}'", value, field)
            }
        }
    }
}

impl std::error::Error for EventError {}
