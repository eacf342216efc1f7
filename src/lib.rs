/*!
    host-side driver for chains of hub controller modules.

    One module is directly usb-attached (the parent), further modules hang
    behind it on a half-duplex rs485 child bus. The host speaks a framed,
    checksummed datagram protocol to all of them over the single serial link.

    The crate splits in two layers:

    - the wire layer: [datagram] (framing and checksums) and [commands]
      (the standard command vocabulary and interface descriptors)
    - the engine: [host] owns the serial channel, runs the reception loop,
      correlates commands with their acks/nacks/responses, arbitrates the
      half-duplex bus through a [lock::MessageKeyedLock], and drives the
      keep-alive and fail-safe watchdogs

    Any serial backend can carry the bus by implementing [transport::Channel];
    a [transport::SerialChannel] backend and an in-memory
    [transport::mock::MockChannel] are provided.
*/

mod utils;

pub mod datagram;
pub mod commands;
pub mod lock;
pub mod transport;
pub mod host;
