/*!
    the message model: what one in-flight exchange looks like to the host.

    A command leaves the unfinished table exactly once, through its oneshot
    completion channel: on ack, nack or response receipt, or when the host
    abandons it. Removing the entry *is* the completion, which keeps the
    bookkeeping idempotent by construction.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use packbytes::{ByteArray, FromBytes};
use tokio::sync::oneshot;
use log::warn;

use crate::commands::{InterfaceCommand, NackReason};


/// identity of one in-flight exchange, the key of the bus access lock
///
/// Keys are plain unique tokens: two handles to the same exchange compare
/// equal, everything else differs.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MessageKey(u64);

impl MessageKey {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MessageKey {
    fn default() -> Self {
        Self::new()
    }
}


/// the wire number of an outgoing command, resolved at send time
#[derive(Copy, Clone, Debug)]
pub(crate) enum CommandNumber {
    /// fixed number from the reserved standard band
    Standard(u16),
    /// negotiated per module, looked up in its registry right before sending
    Interface(&'static InterfaceCommand),
}

/// one outgoing command, ready to serialize
pub(crate) struct Outgoing {
    pub key: MessageKey,
    /// short name used in logs and errors
    pub name: &'static str,
    pub command: CommandNumber,
    pub payload: Vec<u8>,
    /// wire destination when it differs from the module address (broadcast)
    pub dest: Option<u8>,
    /// whether the module will answer at all; discovery is the one command that is not
    pub ackable: bool,
    /// whether a full response (rather than a bare ack) is expected back
    pub expects_response: bool,
    /// whether the sender may repeat the datagram while waiting
    pub retransmittable: bool,
    /// skip the bus lock entry gate; reserved for the shutdown fast path
    pub bypass_gate: bool,
}

impl Outgoing {
    /// an ack-only command
    pub fn command(name: &'static str, command: CommandNumber, payload: Vec<u8>) -> Self {
        Self {
            key: MessageKey::new(),
            name,
            command,
            payload,
            dest: None,
            ackable: true,
            expects_response: false,
            retransmittable: true,
            bypass_gate: false,
        }
    }

    /// a command answered by a full response
    pub fn with_response(mut self) -> Self {
        self.expects_response = true;
        self
    }

    /// a command nobody will answer nor retransmit
    pub fn fire_and_forget(mut self) -> Self {
        self.ackable = false;
        self.retransmittable = false;
        self
    }

    /// address the datagram somewhere other than the owning module
    pub fn to(mut self, dest: u8) -> Self {
        self.dest = Some(dest);
        self
    }

    /// reuse a key created by the caller, to span a bus lock over more than the send itself
    pub fn keyed(mut self, key: MessageKey) -> Self {
        self.key = key;
        self
    }

    /// skip the fair entry gate of the bus lock; only for the holder of an
    /// acquisitions hold during an unrecoverable shutdown
    pub fn bypassing(mut self) -> Self {
        self.bypass_gate = true;
        self
    }
}


/// terminal outcome of one exchange
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    /// positive acknowledgement, no response follows
    Acked {
        /// the module asks to have its status queried
        attention_required: bool,
    },
    /// refusal, no response follows
    Nacked(NackReason),
    /// full response from the module
    Response {
        command_number: u16,
        payload: Vec<u8>,
    },
    /// completed locally without touching hardware
    Pretended,
}

impl Completion {
    /// the refusal reason, if any
    pub fn nack_reason(&self) -> Option<NackReason> {
        match self {
            Self::Nacked(reason) => Some(*reason),
            _ => None,
        }
    }
}


/// one entry of a module's unfinished-command table
pub(crate) struct Pending {
    pub name: &'static str,
    pub expects_response: bool,
    /// serialized datagram, cached for retransmission until the exchange finishes
    pub serialized: Vec<u8>,
    pub retransmissions_remaining: u8,
    /// completing the exchange consumes the entry
    pub complete: oneshot::Sender<Completion>,
}

impl Pending {
    /// the abandonment reason matching what the exchange was still waiting for
    pub fn abandonment_reason(&self) -> NackReason {
        if self.expects_response {
            NackReason::AbandonedWaitingForResponse
        }
        else {
            NackReason::AbandonedWaitingForAck
        }
    }
}


/// decode a fixed-layout payload, tolerating a size mismatch by zero filling.
/// Firmware ahead of (or behind) this host may well append or drop trailing fields
pub(crate) fn decode_payload<R: FromBytes>(payload: &[u8]) -> R {
    let mut bytes = R::Bytes::zeroed();
    let size = bytes.as_mut().len();
    if payload.len() != size {
        warn!("payload of {} bytes decoded as {} byte structure", payload.len(), size);
    }
    let count = payload.len().min(size);
    bytes.as_mut()[.. count].copy_from_slice(&payload[.. count]);
    R::from_le_bytes(bytes)
}
