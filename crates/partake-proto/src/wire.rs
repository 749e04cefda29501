//! Request and response messages.
//!
//! Every frame on the wire carries one root message: a vector of request
//! records from the client, or a vector of response records from the daemon.
//! Records are serialized with bincode using fixed-width little-endian
//! integers and a trailing-bytes check, so a message either decodes exactly
//! or is rejected as malformed. Enum variants are tagged with their 32-bit
//! variant index.

use crate::token::Token;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Object policy, fixed at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Policy {
    /// Write-once, share, read-many. The allocating handle holds exclusive
    /// write access until the object is shared.
    Default,
    /// Always writable by every holder; the daemon does not mediate access
    /// to the contents.
    Primitive,
}

/// Per-request result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    InvalidRequest,
    OutOfShmem,
    NoSuchSegment,
    NoSuchObject,
    ObjectBusy,
    ObjectReserved,
}

/// Where a chunk lives: key plus the region of the segment it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub key: Token,
    pub segment: u32,
    pub offset: u64,
    pub size: u64,
}

/// How clients attach the segment locally, by creation mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentMapping {
    /// POSIX shared memory: `shm_open(name)` then `mmap`.
    PosixShm { name: String },
    /// A regular file: `open(path)` then `mmap`.
    MmapFile { path: String },
    /// System V shared memory: `shmat(shm_id)`.
    SystemV { shm_id: i32 },
    /// Win32 named file mapping.
    Win32FileMapping { name: String, large_pages: bool },
}

/// Returned by `GetSegment`; everything a client needs to map the segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub mapping: SegmentMapping,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    Ping,
    Hello { name: String, pid: u32 },
    Quit,
    GetSegment { segment: u32 },
    Alloc { size: u64, policy: Policy },
    Open { key: Token, policy: Policy, wait: bool },
    Close { key: Token },
    Share { key: Token },
    Unshare { key: Token, wait: bool },
    CreateVoucher { key: Token, count: u32 },
    DiscardVoucher { key: Token },
}

/// One client request. The `seqno` is chosen by the client and echoed in the
/// response; the daemon assigns it no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub seqno: u64,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub requests: Vec<Request>,
}

/// Variant-specific success payloads. Error responses carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    None,
    Ping,
    Hello { session_id: u32 },
    Quit,
    GetSegment { spec: SegmentSpec },
    Alloc { mapping: Mapping },
    Open { mapping: Mapping },
    Close,
    Share,
    Unshare { key: Token },
    CreateVoucher { key: Token },
    DiscardVoucher { key: Token },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub seqno: u64,
    pub status: Status,
    pub body: ResponseBody,
}

impl Response {
    pub fn success(seqno: u64, body: ResponseBody) -> Self {
        Self {
            seqno,
            status: Status::Ok,
            body,
        }
    }

    pub fn error(seqno: u64, status: Status) -> Self {
        debug_assert!(status != Status::Ok);
        Self {
            seqno,
            status,
            body: ResponseBody::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub responses: Vec<Response>,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(#[source] bincode::Error),
    #[error("message does not fit in a frame ({len} bytes)")]
    Oversize { len: usize },
}

use bincode::Options as _;

/// The one serialization configuration both ends use.
fn wire_options() -> impl bincode::Options {
    bincode::options()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let bytes = wire_options()
        .serialize(value)
        .map_err(WireError::Malformed)?;
    if bytes.len() > crate::frame::MAX_PAYLOAD_LEN {
        return Err(WireError::Oversize { len: bytes.len() });
    }
    Ok(bytes)
}

fn decode<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, WireError> {
    wire_options()
        .deserialize(bytes)
        .map_err(WireError::Malformed)
}

pub fn encode_request_message(msg: &RequestMessage) -> Result<Vec<u8>, WireError> {
    encode(msg)
}

pub fn decode_request_message(bytes: &[u8]) -> Result<RequestMessage, WireError> {
    decode(bytes)
}

pub fn encode_response_message(msg: &ResponseMessage) -> Result<Vec<u8>, WireError> {
    encode(msg)
}

pub fn decode_response_message(bytes: &[u8]) -> Result<ResponseMessage, WireError> {
    decode(bytes)
}
