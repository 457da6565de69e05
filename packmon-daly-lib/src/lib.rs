//! Daly BMS protocol implementation for half-duplex serial communication.
//!
//! This library provides types and functions for talking to Daly battery
//! management units over their 13-byte framed request/response protocol.
//!
//! # Frame Layout
//!
//! Every frame on the wire is exactly 13 bytes:
//!
//! ```text
//! [0xA5] [addr] [cmd] [0x08] [d0 .. d7] [checksum]
//! ```
//!
//! - `addr` is `0x40` for host-originated traffic; `0x01` marks a sleeping
//!   slave and such frames are dropped by the receiver.
//! - the length byte is always `0x08` (8 data bytes).
//! - `checksum` is the sum of the first 12 bytes, modulo 256.
//!
//! Multi-frame responses (cell voltages, cell temperatures, version
//! strings) carry a 1-based sequence number in the first data byte; an
//! out-of-sequence frame aborts the in-progress reassembly. Single-frame
//! responses use all 8 data bytes for payload.
//!
//! Protocol references: the official 0x90-0x98 command documentation and
//! the community decoding of the remaining commands. The 0x52, 0x53 and
//! 0x61 layouts are unconfirmed and decoded as opaque fields until
//! validated against live hardware.

pub mod decode;
pub mod frame;
pub mod response;
pub mod session;

pub use frame::{Frame, FrameReceiver, ADDRESS_HOST, ADDRESS_SLAVE, DATA_SIZE, FRAME_SIZE, START_BYTE};
pub use response::Response;
pub use session::{ByteLink, FrameListener, Session};
