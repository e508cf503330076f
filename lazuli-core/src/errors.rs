//! Controller error codes
//!
//! [`Error`] is an enumeration of the controller error codes listed in volume one part F of the
//! Bluetooth core specification. It is used instead of raw error code bytes so that errors
//! print out their *names* along with the code.
//!
//! Three enumerations do not map to a specification error code. `NoError` is created from the
//! error code zero, which is used by events to signify that there was no error.
//! `Unknown` covers codes not part of the specification (manufacturer specific errors or plain
//! bugs). `MissingErrorCode` occurs when an event parameter was too short to contain the status
//! byte at all.

use core::fmt;

macro_rules! controller_errors {
    ( $( $name:ident => $code:literal, $display:literal, )* ) => {
        /// A controller error
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Error {
            NoError,
            Unknown(u8),
            MissingErrorCode,
            $( $name, )*
        }

        impl From<u8> for Error {
            fn from(raw: u8) -> Self {
                match raw {
                    0x00 => Error::NoError,
                    $( $code => Error::$name, )*
                    _ => Error::Unknown(raw),
                }
            }
        }

        impl From<Error> for u8 {
            fn from(error: Error) -> u8 {
                match error {
                    Error::NoError | Error::MissingErrorCode => 0x00,
                    Error::Unknown(code) => code,
                    $( Error::$name => $code, )*
                }
            }
        }

        impl fmt::Debug for Error {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match *self {
                    Error::NoError => f.write_str("NoError"),
                    Error::Unknown(code) => write!(f, "Unknown Error Code ({:#04x})", code),
                    Error::MissingErrorCode => f.write_str("MissingErrorCode"),
                    $( Error::$name => write!(f, concat!(stringify!($name), " ({:#04x})"), $code), )*
                }
            }
        }

        impl fmt::Display for Error {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match *self {
                    Error::NoError => f.write_str("no error"),
                    Error::Unknown(code) => write!(f, "unknown error code ({:#04x})", code),
                    Error::MissingErrorCode => f.write_str("error code is missing"),
                    $( Error::$name => f.write_str($display), )*
                }
            }
        }
    };
}

controller_errors! {
    UnknownHciCommand => 0x01, "unknown HCI command",
    UnknownConnectionIdentifier => 0x02, "unknown connection identifier",
    HardwareFailure => 0x03, "hardware failure",
    PageTimeout => 0x04, "page timeout",
    AuthenticationFailure => 0x05, "authentication failure",
    PinOrKeyMissing => 0x06, "PIN or key missing",
    MemoryCapacityExceeded => 0x07, "memory capacity exceeded",
    ConnectionTimeout => 0x08, "connection timeout",
    ConnectionLimitExceeded => 0x09, "connection limit exceeded",
    SynchronousConnectionLimitToADeviceExceeded => 0x0A,
        "synchronous connection limit to a device exceeded",
    ConnectionAlreadyExists => 0x0B, "connection already exists",
    CommandDisallowed => 0x0C, "command disallowed",
    ConnectionRejectedDueToLimitedResources => 0x0D, "connection rejected due to limited resources",
    ConnectionRejectedDueToSecurityReasons => 0x0E, "connection rejected due to security reasons",
    ConnectionRejectedDueToUnacceptableBluetoothAddress => 0x0F,
        "connection rejected due to unacceptable bluetooth address",
    ConnectionAcceptTimeoutExceeded => 0x10, "connection accept timeout exceeded",
    UnsupportedFeatureOrParameterValue => 0x11, "unsupported feature or parameter value",
    InvalidHciCommandParameters => 0x12, "invalid HCI command parameters",
    RemoteUserTerminatedConnection => 0x13, "remote user terminated connection",
    RemoteDeviceTerminatedConnectionDueToLowResources => 0x14,
        "remote device terminated connection due to low resources",
    RemoteDeviceTerminatedConnectionDueToPowerOff => 0x15,
        "remote device terminated connection due to power off",
    ConnectionTerminatedByLocalHost => 0x16, "connection terminated by local host",
    RepeatedAttempts => 0x17, "repeated attempts",
    PairingNotAllowed => 0x18, "pairing not allowed",
    UnknownLmpPdu => 0x19, "unknown LMP PDU",
    UnsupportedRemoteFeature => 0x1A, "unsupported remote feature",
    ScoOffsetRejected => 0x1B, "SCO offset rejected",
    ScoIntervalRejected => 0x1C, "SCO interval rejected",
    ScoAirModeRejected => 0x1D, "SCO air mode rejected",
    InvalidLmpParametersOrInvalidLlParameters => 0x1E, "invalid LMP or LL parameters",
    UnspecifiedError => 0x1F, "unspecified error",
    UnsupportedLmpParameterValueOrUnsupportedLlParameterValue => 0x20,
        "unsupported LMP or LL parameter value",
    RoleChangeNotAllowed => 0x21, "role change not allowed",
    LmpResponseTimeoutOrLlResponseTimeout => 0x22, "LMP or LL response timeout",
    LmpErrorTransactionCollisionOrLlProcedureCollision => 0x23,
        "LMP error transaction collision or LL procedure collision",
    LmpPduNotAllowed => 0x24, "LMP PDU not allowed",
    EncryptionModeNotAcceptable => 0x25, "encryption mode not acceptable",
    LinkKeyCannotBeChanged => 0x26, "link key cannot be changed",
    RequestedQosNotSupported => 0x27, "requested QoS not supported",
    InstantPassed => 0x28, "instant passed",
    PairingWithUnitKeyNotSupported => 0x29, "pairing with unit key not supported",
    DifferentTransactionCollision => 0x2A, "different transaction collision",
    QosUnacceptableParameter => 0x2C, "QoS unacceptable parameter",
    QosRejected => 0x2D, "QoS rejected",
    ChannelAssessmentNotSupported => 0x2E, "channel assessment not supported",
    InsufficientSecurity => 0x2F, "insufficient security",
    ParameterOutOfMandatoryRange => 0x30, "parameter out of mandatory range",
    RoleSwitchPending => 0x32, "role switch pending",
    ReservedSlotViolation => 0x34, "reserved slot violation",
    RoleSwitchFailed => 0x35, "role switch failed",
    ExtendedInquiryResponseTooLarge => 0x36, "extended inquiry response too large",
    SimplePairingNotSupportedByHost => 0x37, "simple pairing not supported by host",
    HostBusyBecausePairing => 0x38, "host busy because of pairing",
    ConnectionRejectedDueToNoSuitableChannelFound => 0x39,
        "connection rejected due to no suitable channel found",
    ControllerBusy => 0x3A, "controller busy",
    UnacceptableConnectionParameters => 0x3B, "unacceptable connection parameters",
    AdvertisingTimeout => 0x3C, "advertising timeout",
    ConnectionTerminatedDueToMicFailure => 0x3D, "connection terminated due to MIC failure",
    ConnectionFailedToBeEstablishedOrSynchronizationTimeout => 0x3E,
        "connection failed to be established or synchronization timeout",
    CoarseClockAdjustmentRejectedButWillTryToAdjustUsingClockDragging => 0x40,
        "coarse clock adjustment rejected, will try to adjust using clock dragging",
    Type0SubmapNotDefined => 0x41, "type0 submap not defined",
    UnknownAdvertisingIdentifier => 0x42, "unknown advertising identifier",
    LimitReached => 0x43, "limit reached",
    OperationCancelledByHost => 0x44, "operation cancelled by host",
    PacketTooLong => 0x45, "packet too long",
}

impl Error {
    /// Map `NoError` to `Ok(())` and any other enumeration to the output of `err`
    pub fn ok_or_else<F, E>(self, err: F) -> Result<(), E>
    where
        F: FnOnce(Self) -> E,
    {
        if let Error::NoError = self {
            Ok(())
        } else {
            Err(err(self))
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        assert_eq!(Error::NoError, Error::from(0u8));
        assert_eq!(Error::UnknownConnectionIdentifier, Error::from(0x02u8));
        assert_eq!(Error::CommandDisallowed, Error::from(0x0Cu8));
        assert_eq!(0x0Cu8, Error::CommandDisallowed.into());
        assert_eq!(Error::Unknown(0xFE), Error::from(0xFEu8));
        assert_eq!(0xFEu8, Error::Unknown(0xFE).into());
    }

    #[test]
    fn ok_or_else_maps_only_no_error() {
        assert_eq!(Ok(()), Error::NoError.ok_or_else(|e| e));
        assert_eq!(
            Err(Error::HardwareFailure),
            Error::HardwareFailure.ok_or_else(|e| e)
        );
    }
}
