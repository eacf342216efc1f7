/*!
    the standard command vocabulary and the interface descriptor types.

    Every module implements the *standard* commands, living in a reserved
    numeric band with fixed numbers. Anything else belongs to a named
    interface whose starting command number differs per module and firmware
    version and is negotiated at runtime with [COMMAND_QUERY_INTERFACE]
    (see the per-module registry in the host layer).
*/

use bilge::prelude::*;
use packbytes::{FromBytes, ToBytes};

use crate::pack_bilge;


/// numeric band reserved for the commands every module implements
pub const STANDARD_COMMAND_FIRST: u16 = 0x7f01;
pub const STANDARD_COMMAND_LAST: u16 = 0x7fff;

pub const COMMAND_ACK: u16                    = 0x7f01;
pub const COMMAND_NACK: u16                   = 0x7f02;
pub const COMMAND_GET_MODULE_STATUS: u16      = 0x7f03;
pub const COMMAND_KEEP_ALIVE: u16             = 0x7f04;
pub const COMMAND_FAIL_SAFE: u16              = 0x7f05;
pub const COMMAND_SET_NEW_MODULE_ADDRESS: u16 = 0x7f06;
pub const COMMAND_QUERY_INTERFACE: u16        = 0x7f07;
pub const COMMAND_SET_MODULE_LED_COLOR: u16   = 0x7f0a;
pub const COMMAND_GET_MODULE_LED_COLOR: u16   = 0x7f0b;
pub const COMMAND_SET_MODULE_LED_PATTERN: u16 = 0x7f0c;
pub const COMMAND_GET_MODULE_LED_PATTERN: u16 = 0x7f0d;
pub const COMMAND_SET_DEBUG_LOG_LEVEL: u16    = 0x7f0e;
pub const COMMAND_DISCOVERY: u16              = 0x7f0f;

pub fn is_standard_command(number: u16) -> bool {
    (STANDARD_COMMAND_FIRST ..= STANDARD_COMMAND_LAST).contains(&number)
}


/// why a module refused a command
///
/// The two `Abandoned*` reasons are synthesized by the host when it gives up
/// on an exchange; they have no wire encoding and must never be transmitted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NackReason {
    ServoNotConfiguredBeforeEnabled,
    BatteryTooLowToRunServo,
    /// command rejected, the peripheral bus master is busy
    I2cMasterBusy,
    /// poll again for completion status
    I2cOperationInProgress,
    /// read results were requested but no read is outstanding
    I2cNoResultsPending,
    /// query does not match the last operation
    I2cQueryMismatch,
    MotorNotConfiguredBeforeEnabled,
    CommandInvalidForMotorMode,
    BatteryTooLowToRunMotor,
    /// command known and properly delivered but not implemented yet
    CommandImplPending,
    /// command known but not handled by the receiving subsystem
    CommandRoutingError,
    /// module does not know this command number at all
    PacketIdUnknown,
    /// host gave up waiting for the ack of this command
    AbandonedWaitingForAck,
    /// host gave up waiting for the response of this command
    AbandonedWaitingForResponse,
    /// reason code this host has no specific knowledge of
    Other(u8),
}

impl NackReason {
    pub fn from_wire(code: u8) -> Self {
        match code {
            30 => Self::ServoNotConfiguredBeforeEnabled,
            31 => Self::BatteryTooLowToRunServo,
            40 => Self::I2cMasterBusy,
            41 => Self::I2cOperationInProgress,
            42 => Self::I2cNoResultsPending,
            43 => Self::I2cQueryMismatch,
            50 => Self::MotorNotConfiguredBeforeEnabled,
            51 => Self::CommandInvalidForMotorMode,
            52 => Self::BatteryTooLowToRunMotor,
            253 => Self::CommandImplPending,
            254 => Self::CommandRoutingError,
            255 => Self::PacketIdUnknown,
            other => Self::Other(other),
        }
    }

    /// wire encoding, `None` for the host-synthesized abandonment reasons
    pub fn to_wire(self) -> Option<u8> {
        match self {
            Self::ServoNotConfiguredBeforeEnabled => Some(30),
            Self::BatteryTooLowToRunServo => Some(31),
            Self::I2cMasterBusy => Some(40),
            Self::I2cOperationInProgress => Some(41),
            Self::I2cNoResultsPending => Some(42),
            Self::I2cQueryMismatch => Some(43),
            Self::MotorNotConfiguredBeforeEnabled => Some(50),
            Self::CommandInvalidForMotorMode => Some(51),
            Self::BatteryTooLowToRunMotor => Some(52),
            Self::CommandImplPending => Some(253),
            Self::CommandRoutingError => Some(254),
            Self::PacketIdUnknown => Some(255),
            Self::AbandonedWaitingForAck | Self::AbandonedWaitingForResponse => None,
            Self::Other(code) => Some(code),
        }
    }

    /// busy conditions a sender may simply retry after a short sleep
    pub fn is_transient(self) -> bool {
        matches!(self, Self::I2cMasterBusy | Self::I2cOperationInProgress)
    }

    /// the module does not actually implement the command it was sent
    pub fn is_unsupported(self) -> bool {
        matches!(self, Self::CommandImplPending | Self::CommandRoutingError | Self::PacketIdUnknown)
    }

    /// synthesized by the host rather than received from a module
    pub fn is_abandonment(self) -> bool {
        matches!(self, Self::AbandonedWaitingForAck | Self::AbandonedWaitingForResponse)
    }
}


/// condition bits a module reports in its status reply
#[bitsize(8)]
#[derive(Copy, Clone, FromBits, DebugBits, PartialEq, Default)]
pub struct ModuleStatus {
    /// the module hit its keep-alive timeout and reset its volatile state
    pub keep_alive_timeout: bool,
    pub device_reset: bool,
    pub fail_safe: bool,
    pub controller_over_temp: bool,
    pub battery_low: bool,
    pub hib_fault: bool,
    _reserved: u2,
}
pack_bilge!(ModuleStatus, u8);


// payloads of the standard commands and their responses

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct Ack {
    /// the module wants the host to query its status
    pub attention_required: u8,
}

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct Nack {
    pub reason: u8,
}

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct GetModuleStatus {
    /// reset the reported bits once they have been read
    pub clear_status: u8,
}

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct ModuleStatusReply {
    pub status: ModuleStatus,
    /// one bit per motor channel currently raising an alert
    pub motor_alerts: u8,
}

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct SetNewModuleAddress {
    pub address: u8,
}

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct QueryInterfaceReply {
    /// number the module assigned to the first command of the interface
    pub command_number_first: u16,
    /// how many commands of the interface this firmware implements
    pub number_of_commands: u16,
}

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default, PartialEq)]
pub struct LedColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// one step of the indicator pattern: hold the color for `duration` expressed
/// in tenths of a second
#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default, PartialEq)]
pub struct PatternStep {
    pub duration: u8,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

pub const MAX_PATTERN_STEPS: usize = 16;

/// serialize an indicator pattern, silently clamped to [MAX_PATTERN_STEPS]
pub fn pattern_payload(steps: &[PatternStep]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(steps.len().min(MAX_PATTERN_STEPS) * 4);
    for step in steps.iter().take(MAX_PATTERN_STEPS) {
        payload.extend_from_slice(&step.to_le_bytes());
    }
    payload
}

/// payload of a [COMMAND_QUERY_INTERFACE]: the interface name, nul terminated
pub fn interface_name_payload(name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(name.len() + 1);
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugGroup {
    Main = 1,
    ToHost = 2,
    FromHost = 3,
    Adc = 4,
    PwmServo = 5,
    ModuleLed = 6,
    DigitalIo = 7,
    I2c = 8,
    Motor0 = 9,
    Motor1 = 10,
    Motor2 = 11,
    Motor3 = 12,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugVerbosity {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct SetDebugLogLevel {
    pub group: u8,
    pub verbosity: u8,
}

#[derive(Copy, Clone, FromBytes, ToBytes, Debug, Default)]
pub struct DiscoveryReply {
    /// nonzero when the replying module saw the discovery arrive over usb,
    /// marking it as the directly attached parent
    pub parent: u8,
}


/// one command a module may implement as part of a named interface
///
/// These are declared as `static` descriptors by the device-specific layers
/// built on top of this crate; the engine identifies them by reference.
#[derive(Debug)]
pub struct InterfaceCommand {
    /// short name used in diagnostics and unsupported-command errors
    pub name: &'static str,
    /// whether the module answers with a full response rather than a bare ack
    pub expects_response: bool,
}

/// a named, versionable group of module commands whose starting command
/// number is negotiated at runtime
///
/// The slot order is the wire order: the command in slot `i` gets number
/// `base + i` once the base is known. `None` slots keep the numbering of an
/// interface whose older commands were retired.
#[derive(Debug)]
pub struct Interface {
    pub name: &'static str,
    pub commands: &'static [Option<&'static InterfaceCommand>],
}

impl Interface {
    /// how many command numbers the interface spans, placeholders included
    pub fn command_count(&self) -> u16 {
        self.commands.len() as u16
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_reason_wire_codes() {
        for code in 0 ..= 255u8 {
            let reason = NackReason::from_wire(code);
            assert_eq!(reason.to_wire(), Some(code));
            assert!(! reason.is_abandonment());
        }
        assert_eq!(NackReason::AbandonedWaitingForAck.to_wire(), None);
        assert_eq!(NackReason::AbandonedWaitingForResponse.to_wire(), None);
    }

    #[test]
    fn transient_and_unsupported_are_disjoint() {
        for code in 0 ..= 255u8 {
            let reason = NackReason::from_wire(code);
            assert!(! (reason.is_transient() && reason.is_unsupported()));
        }
        assert!(NackReason::I2cMasterBusy.is_transient());
        assert!(NackReason::I2cOperationInProgress.is_transient());
        assert!(NackReason::PacketIdUnknown.is_unsupported());
    }

    #[test]
    fn status_bits() {
        let status = ModuleStatus::from(0b0000_0101u8);
        assert!(status.keep_alive_timeout());
        assert!(! status.device_reset());
        assert!(status.fail_safe());
    }

    #[test]
    fn pattern_payload_clamps() {
        let step = PatternStep { duration: 10, red: 0, green: 255, blue: 0 };
        let payload = pattern_payload(&vec![step; 20]);
        assert_eq!(payload.len(), MAX_PATTERN_STEPS * 4);
        assert_eq!(&payload[.. 4], &[10, 0, 255, 0]);
    }

    #[test]
    fn interface_name_is_nul_terminated() {
        assert_eq!(interface_name_payload("DEKA"), b"DEKA\0");
    }
}
