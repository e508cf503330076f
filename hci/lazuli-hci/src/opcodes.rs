//! HCI Command Opcodes
//!
//! Opcodes are composed of a group identifier (OGF) and an individual command identifier (OCF)
//! specific to the group. The two are packed together to form the raw opcode value carried in a
//! command packet.
//!
//! Instead of juggling raw group and command codes, the enum [`HciCommand`] should be used. An
//! opcode is acquired from it with the method `into_opcode`.
//!
//! ```
//! # use lazuli_hci::opcodes::{ControllerAndBaseband, HciCommand};
//!
//! assert_eq!(0xC03, HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset).into_opcode());
//! ```

use core::fmt;

/// Enumeration of the HCI command opcodes used by this host
///
/// Commands are organized by the command groups containing them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HciCommand {
    LinkControl(LinkControl),
    ControllerAndBaseband(ControllerAndBaseband),
    InformationParameters(InformationParameters),
    LEController(LEController),
}

impl HciCommand {
    /// Get the opcode for this command
    pub const fn into_opcode(self) -> u16 {
        self.into_opcode_pair().into_opcode()
    }

    /// Get the `OpCodePair` for this command
    pub const fn into_opcode_pair(self) -> OpCodePair {
        match self {
            HciCommand::LinkControl(ocf) => ocf.into_opcode_pair(),
            HciCommand::ControllerAndBaseband(ocf) => ocf.into_opcode_pair(),
            HciCommand::InformationParameters(ocf) => ocf.into_opcode_pair(),
            HciCommand::LEController(ocf) => ocf.into_opcode_pair(),
        }
    }
}

impl fmt::Display for HciCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let opcode = self.into_opcode_pair();

        match self {
            HciCommand::LinkControl(c) => {
                write!(f, "link control - {} ({:#x}:{:#x})", c, opcode.ogf, opcode.ocf)
            }
            HciCommand::ControllerAndBaseband(c) => write!(
                f,
                "controller and baseband - {} ({:#x}:{:#x})",
                c, opcode.ogf, opcode.ocf
            ),
            HciCommand::InformationParameters(c) => write!(
                f,
                "information parameters - {} ({:#x}:{:#x})",
                c, opcode.ogf, opcode.ocf
            ),
            HciCommand::LEController(c) => {
                write!(f, "LE controller - {} ({:#x}:{:#x})", c, opcode.ogf, opcode.ocf)
            }
        }
    }
}

/// A pair of OGF (OpCode Group Field) and OCF (OpCode Command Field)
///
/// The main use for this is converting between the `HciCommand` enumeration and the numerical
/// opcode passed over the interface to the controller.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OpCodePair {
    pub ogf: u16,
    pub ocf: u16,
}

impl OpCodePair {
    /// Convert the OpCodePair into the raw opcode
    pub const fn into_opcode(self) -> u16 {
        // the first 10 bits of an opcode are the OCF field, the last 6 bits are the OGF field
        (self.ocf & 0x3FF) | (self.ogf << 10)
    }

    /// Convert a raw opcode into an OpCodePair
    pub const fn from_opcode(val: u16) -> Self {
        OpCodePair {
            ogf: val >> 10,
            ocf: val & 0x3FF,
        }
    }
}

impl From<HciCommand> for OpCodePair {
    fn from(cmd: HciCommand) -> OpCodePair {
        cmd.into_opcode_pair()
    }
}

impl TryFrom<OpCodePair> for HciCommand {
    type Error = String;

    fn try_from(pair: OpCodePair) -> Result<Self, Self::Error> {
        match pair.ogf {
            0x1 => Ok(HciCommand::LinkControl(LinkControl::try_from_ocf(pair.ocf)?)),
            0x3 => Ok(HciCommand::ControllerAndBaseband(
                ControllerAndBaseband::try_from_ocf(pair.ocf)?,
            )),
            0x4 => Ok(HciCommand::InformationParameters(
                InformationParameters::try_from_ocf(pair.ocf)?,
            )),
            0x8 => Ok(HciCommand::LEController(LEController::try_from_ocf(pair.ocf)?)),
            _ => Err(format!("unknown opcode group field {:#x}", pair.ogf)),
        }
    }
}

macro_rules! command_group {
    ( $(#[$docs:meta])* $group:ident, $ogf:literal, { $( $command:ident => $ocf:literal, )* } ) => {
        $(#[$docs])*
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        pub enum $group {
            $( $command, )*
        }

        impl $group {
            pub const fn into_opcode_pair(self) -> OpCodePair {
                match self {
                    $( $group::$command => OpCodePair { ogf: $ogf, ocf: $ocf }, )*
                }
            }

            fn try_from_ocf(ocf: u16) -> Result<Self, String> {
                match ocf {
                    $( $ocf => Ok($group::$command), )*
                    _ => Err(format!(
                        concat!("unknown ", stringify!($group), " command field {:#x}"),
                        ocf
                    )),
                }
            }
        }

        impl fmt::Display for $group {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self {
                    $( $group::$command => f.write_str(stringify!($command)), )*
                }
            }
        }
    };
}

command_group! {
    /// Link control command group
    LinkControl, 0x1, {
        Disconnect => 0x6,
        ReadRemoteVersionInformation => 0x1D,
    }
}

command_group! {
    /// Controller and baseband command group
    ControllerAndBaseband, 0x3, {
        Reset => 0x3,
    }
}

command_group! {
    /// Information parameters command group
    InformationParameters, 0x4, {
        ReadLocalSupportedCommands => 0x2,
        ReadBufferSize => 0x5,
    }
}

command_group! {
    /// LE controller command group
    LEController, 0x8, {
        ReadBufferSize => 0x2,
        SetScanParameters => 0xB,
        SetScanEnable => 0xC,
        CreateConnection => 0xD,
        CreateConnectionCancel => 0xE,
        ReadRemoteFeatures => 0x16,
        SetExtendedScanParameters => 0x41,
        SetExtendedScanEnable => 0x42,
        ExtendedCreateConnection => 0x43,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_packing() {
        let opcode = HciCommand::LEController(LEController::CreateConnection).into_opcode();

        assert_eq!(0x200D, opcode);

        let pair = OpCodePair::from_opcode(opcode);

        assert_eq!(0x8, pair.ogf);
        assert_eq!(0xD, pair.ocf);
        assert_eq!(Ok(HciCommand::LEController(LEController::CreateConnection)), pair.try_into());
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        assert!(HciCommand::try_from(OpCodePair { ogf: 0x3F, ocf: 0x0 }).is_err());
    }
}
