//! HSB Protocol - Wire protocol for worker communication
//!
//! This crate provides the command types, reply interpretation and the
//! newline-delimited JSON codec used between the bridge and the worker
//! process. The protocol carries no request identifiers: replies are
//! matched to commands purely by order.

pub mod codec;
pub mod message;
pub mod parse;
pub mod reply;

pub use codec::{CodecError, DecodedLine, JsonLineCodec, LineError, MAX_LINE_LENGTH};
pub use message::Command;
pub use parse::RawDevice;
pub use reply::{check_ack, parse_device_list, reported_error, DeviceList, ReplyError, SkippedDevice};
