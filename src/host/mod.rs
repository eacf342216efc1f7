/*!
    the host-side engine: devices, modules and message exchange.

    The central resource is the [Device] owning one serial channel and every
    module reachable through it. [Module] is the per-peer handle the
    device-specific controller layers talk to.

    message flow for one command:

    - the caller builds a command and the module resolves its wire number
      (failing fast if the interface was never negotiated or got nacked)
    - the bus lock is taken for the whole exchange
    - a fresh message number is assigned, the datagram serialized and written
    - the reception loop routes the matching ack/nack/response back by
      reference number, retransmitting on a fixed cadence until then
    - on timeout the host synthesizes an abandonment nack itself
*/

mod message;
mod registry;
mod module;
mod device;

pub use message::{MessageKey, Completion};
pub use module::{Module, Controller};
pub use device::{ArmingState, Device, DeviceOptions, DiscoveredModule, ObserverId};

use crate::commands::NackReason;
use thiserror::Error;


/// error regarding communication with controller modules
#[derive(Error, Debug)]
pub enum Error {
    #[error("problem with the usb serial bus")]
    Bus(#[from] std::io::Error),
    #[error("module refused the command: {0:?}")]
    Nack(NackReason),
    #[error("command {0} is not supported by this module")]
    Unsupported(&'static str),
    #[error("no contact with the module")]
    NoContact,
    #[error("device is gone")]
    Closed,
    #[error("host-side misuse: {0}")]
    Usage(&'static str),
}

impl Error {
    /// the refusal reason, if this error is one
    pub fn nack_reason(&self) -> Option<NackReason> {
        match self {
            Self::Nack(reason) => Some(*reason),
            _ => None,
        }
    }

    /// whether retrying the command after a short sleep may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Nack(reason) if reason.is_transient())
    }
}
