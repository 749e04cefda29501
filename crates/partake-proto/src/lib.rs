//! Wire-level building blocks for partake
//!
//! Partake is a daemon that brokers access to a shared-memory segment among
//! local client processes. This crate holds everything both ends of the wire
//! need to agree on: opaque 64-bit tokens (and the sequence that generates
//! them), the proquint rendering used in logs, the request/response message
//! types with their serialization, and the length-prefixed frame codec.
//!
//! The daemon itself lives in the `partaked` crate; this crate is dependency-
//! light so that client libraries can use it without pulling in the daemon's
//! runtime.

pub mod frame;
pub mod proquint;
pub mod token;
pub mod wire;

pub use frame::{encode_frame, FrameDecoder, FrameError, FRAME_ALIGNMENT, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
pub use token::{KeySequence, Token};
pub use wire::{
    decode_request_message, decode_response_message, encode_request_message,
    encode_response_message, Mapping, Policy, Request, RequestBody, RequestMessage, Response,
    ResponseBody, ResponseMessage, SegmentMapping, SegmentSpec, Status, WireError,
};
