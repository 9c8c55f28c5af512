//! Appliance wire protocol.
//!
//! This module defines the binary request/response protocol spoken by the similarity-search
//! appliance: message framing, header layout, checksums, body encoding and the rules for
//! interpreting response bodies as query results.
//!
//! # Overview
//!
//! Every exchange is a single request followed by a single response over one TCP session.
//! There is no pipelining; a request must be fully answered before the next one is written.
//!
//! # Key Components
//!
//! - [`Request`]: An outgoing command with its attributes and optional [`Payload`].
//! - [`Response`]: A decoded response header plus its optional body.
//! - [`ProtocolTransport`]: Abstraction over a bidirectional stream (e.g., TCP) used to exchange
//!   messages.
//! - [`Command`], [`Status`], [`DistanceMode`], [`QueryMode`]: Numeric codes carried on the wire.
//!
//! # Binary Format
//!
//! All integers are little-endian and fixed-width.
//!
//! - Request header: `u32 command | u32 reserved | u64 attribute_0 | u64 attribute_1 |
//!   u64 body_length | [u8; 8] api_key | u32 crc32`, 44 bytes in total.
//! - Response header: `u32 command | u32 status | u64 attribute_0 | u64 attribute_1 |
//!   u64 body_length | u32 crc32`, 36 bytes in total.
//! - A body, when present, is `body_length` bytes followed by the `u32` CRC-32 of those bytes.
//!
//! Response bodies are sequences of `(dataset_id, distance)` pairs of `u64` words. The pair
//! `(u64::MAX, u64::MAX)` terminates the result list of a single query.
//!
//! # Checksums
//!
//! Checksums on responses are verified by default. Verification can be turned off per
//! transport to reproduce the permissive behaviour of older clients, in which case a
//! mismatch is only logged.
mod codes;
mod error;
mod request;
mod response;
mod transport;

use bincode::config::{Configuration, Fixint, LittleEndian};

pub use codes::{Command, DistanceMode, QueryMode, Status};
pub use error::{ErrorClass, ProtocolError, Section};
pub use request::{
    API_KEY_LEN, ApiKey, DatasetFile, Payload, QueryFile, REQUEST_HEADER_LEN, RandomDataset,
    Request, matrix_width, to_components,
};
pub use response::{
    BatchResult, QueryResult, RESPONSE_HEADER_LEN, Reply, Response, ResultShape, SENTINEL,
    decode_results, encode_results,
};
pub use transport::ProtocolTransport;

/// Size of the CRC-32 trailer after a header or a body.
pub const CHECKSUM_LEN: usize = size_of::<u32>();

/// Default cap on a body length declared by a peer.
pub const MAX_BODY_LEN: u64 = 256 * 1024 * 1024;

/// Fixed-width, little-endian layout shared by every header on the wire.
pub(crate) fn wire_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// CRC-32 (IEEE) of `bytes`, as carried in header and body trailers.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
