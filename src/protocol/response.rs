use bincode::{Decode, Encode};
use log::{debug, warn};
use serde::Serialize;

use super::{
    CHECKSUM_LEN, Command, ProtocolError, Section, Status, checksum,
    request::{read_checksum, verify},
    wire_config,
};

/// Response header size, checksum included.
pub const RESPONSE_HEADER_LEN: usize = RESPONSE_FIELDS_LEN + CHECKSUM_LEN;

const RESPONSE_FIELDS_LEN: usize = 2 * size_of::<u32>() + 3 * size_of::<u64>();

/// Word value marking the end of one query's results.
pub const SENTINEL: u64 = u64::MAX;

const WORD_LEN: usize = size_of::<u64>();
const PAIR_LEN: usize = 2 * WORD_LEN;

/// One match returned by the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct QueryResult {
    pub dataset_id: u64,
    pub distance: u64,
}

impl QueryResult {
    pub fn new(dataset_id: u64, distance: u64) -> Self {
        Self {
            dataset_id,
            distance,
        }
    }

    fn is_sentinel(&self) -> bool {
        self.dataset_id == SENTINEL || self.distance == SENTINEL
    }

    fn from_pair(pair: &[u8]) -> Self {
        let (id, distance) = pair.split_at(WORD_LEN);
        Self {
            dataset_id: read_word(id),
            distance: read_word(distance),
        }
    }
}

/// Result lists for a batch, one per query vector in input order.
pub type BatchResult = Vec<Vec<QueryResult>>;

/// How a response body is to be read, fixed by the request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// The answer is `attribute_0` of the response header.
    Scalar,
    /// One sentinel-terminated result list.
    Flat,
    /// One result list per query, each closed by a sentinel pair.
    Batched,
}

/// Decoded answer to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Scalar(u64),
    Results(Vec<QueryResult>),
    Batch(BatchResult),
}

impl Reply {
    pub fn into_scalar(self) -> Result<u64, ProtocolError> {
        match self {
            Reply::Scalar(value) => Ok(value),
            other => Err(unexpected("a scalar", &other)),
        }
    }

    /// Result list of a single query. A bodiless reply means no matches.
    pub fn into_results(self) -> Result<Vec<QueryResult>, ProtocolError> {
        match self {
            Reply::Results(results) => Ok(results),
            Reply::Scalar(_) => Ok(Vec::new()),
            other => Err(unexpected("a flat result list", &other)),
        }
    }

    /// Result lists of a batch. A bodiless reply holds no lists.
    pub fn into_batch(self) -> Result<BatchResult, ProtocolError> {
        match self {
            Reply::Batch(lists) => Ok(lists),
            Reply::Scalar(_) => Ok(Vec::new()),
            other => Err(unexpected("batched result lists", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> ProtocolError {
    let got = match got {
        Reply::Scalar(_) => "a scalar",
        Reply::Results(_) => "a flat result list",
        Reply::Batch(_) => "batched result lists",
    };
    ProtocolError::MalformedBody(format!("expected {wanted}, decoded {got}"))
}

#[derive(Debug, Encode, Decode)]
struct ResponseHeader {
    command: u32,
    status: u32,
    attribute_0: u64,
    attribute_1: u64,
    body_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: Command,
    pub status: Status,
    /// Command dependent; the scalar answer when there is no body.
    pub attribute_0: u64,
    pub attribute_1: u64,
    /// Body size in bytes.
    pub body_length: u64,
    pub header_checksum: u32,
    pub body: Option<Vec<u8>>,
    pub body_checksum: Option<u32>,
}

impl Response {
    pub fn new(command: Command, status: Status) -> Self {
        Self {
            command,
            status,
            attribute_0: 0,
            attribute_1: 0,
            body_length: 0,
            header_checksum: 0,
            body: None,
            body_checksum: None,
        }
    }

    pub fn with_attributes(mut self, attribute_0: u64, attribute_1: u64) -> Self {
        self.attribute_0 = attribute_0;
        self.attribute_1 = attribute_1;
        self
    }

    /// Attaches `body` and sets `body_length` to its size.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body_length = body.len() as u64;
        self.body_checksum = Some(checksum(&body));
        self.body = Some(body);
        self
    }

    /// Encodes the header and, when present, the body with fresh checksums.
    ///
    /// A response without a body is written as a bare header even if `body_length` is
    /// non-zero, the way the appliance answers with an error status.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let header = ResponseHeader {
            command: self.command.code(),
            status: self.status.code(),
            attribute_0: self.attribute_0,
            attribute_1: self.attribute_1,
            body_length: self.body_length,
        };

        let body_len = self.body.as_ref().map_or(0, |b| b.len() + CHECKSUM_LEN);
        let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + body_len);
        bincode::encode_into_std_write(header, &mut out, wire_config())?;
        debug_assert_eq!(out.len(), RESPONSE_FIELDS_LEN);
        let crc = checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());

        if let Some(body) = &self.body {
            if body.len() as u64 != self.body_length {
                return Err(ProtocolError::InvalidArgument(format!(
                    "response declares {} body bytes but holds {}",
                    self.body_length,
                    body.len()
                )));
            }
            out.extend_from_slice(body);
            out.extend_from_slice(&checksum(body).to_le_bytes());
        }
        Ok(out)
    }

    /// Decodes the fixed 36 byte header. The returned response has no body yet.
    ///
    /// With `verify_checksum` unset a checksum mismatch is logged and ignored.
    pub fn decode_header(buf: &[u8], verify_checksum: bool) -> Result<Self, ProtocolError> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::MalformedBody(format!(
                "response header needs {RESPONSE_HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let (fields, trailer) = buf[..RESPONSE_HEADER_LEN].split_at(RESPONSE_FIELDS_LEN);
        check(Section::Header, fields, trailer, verify_checksum)?;

        let (header, _): (ResponseHeader, usize) =
            bincode::decode_from_slice(fields, wire_config())?;
        Ok(Self {
            command: header.command.try_into()?,
            status: header.status.try_into()?,
            attribute_0: header.attribute_0,
            attribute_1: header.attribute_1,
            body_length: header.body_length,
            header_checksum: read_checksum(trailer)?,
            body: None,
            body_checksum: None,
        })
    }

    /// Attaches a received body and its trailing checksum.
    pub(crate) fn attach_body(
        &mut self,
        body: Vec<u8>,
        trailer: &[u8],
        verify_checksum: bool,
    ) -> Result<(), ProtocolError> {
        check(Section::Body, &body, trailer, verify_checksum)?;
        self.body_checksum = Some(read_checksum(trailer)?);
        self.body = Some(body);
        Ok(())
    }

    /// Interprets the response according to the shape of the originating request.
    pub fn reply(&self, shape: ResultShape) -> Result<Reply, ProtocolError> {
        match (&self.body, shape) {
            (Some(body), ResultShape::Flat | ResultShape::Batched) if !body.is_empty() => {
                decode_results(body, shape)
            }
            (Some(body), ResultShape::Scalar) if !body.is_empty() => {
                debug!(
                    "ignoring {} body bytes of {} reply",
                    body.len(),
                    self.command
                );
                Ok(Reply::Scalar(self.attribute_0))
            }
            _ => Ok(Reply::Scalar(self.attribute_0)),
        }
    }
}

fn check(
    section: Section,
    bytes: &[u8],
    trailer: &[u8],
    verify_checksum: bool,
) -> Result<(), ProtocolError> {
    match verify(section, bytes, trailer) {
        Err(ProtocolError::InvalidChecksum {
            received, computed, ..
        }) if !verify_checksum => {
            warn!(
                "{section} checksum mismatch ignored: received {received:#010x}, computed {computed:#010x}"
            );
            Ok(())
        }
        res => res,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    ReadingPair,
    EndOfQuery,
    EndOfBatch,
}

/// Decodes `(dataset_id, distance)` pairs from a response body.
///
/// In flat mode the first sentinel pair ends the list and anything after it is ignored.
/// In batched mode each sentinel pair closes one query's list; pairs after the last
/// sentinel are dropped.
pub fn decode_results(body: &[u8], shape: ResultShape) -> Result<Reply, ProtocolError> {
    if shape == ResultShape::Scalar {
        return Err(ProtocolError::InvalidArgument(
            "scalar replies carry no result pairs".into(),
        ));
    }
    if body.len() % PAIR_LEN != 0 {
        return Err(ProtocolError::MalformedBody(format!(
            "{} bytes is not a whole number of result pairs",
            body.len()
        )));
    }

    let mut pairs = body.chunks_exact(PAIR_LEN).map(QueryResult::from_pair);
    let mut lists: BatchResult = Vec::new();
    let mut current = Vec::new();
    let mut state = DecodeState::ReadingPair;

    while state != DecodeState::EndOfBatch {
        state = match state {
            DecodeState::ReadingPair => match pairs.next() {
                Some(pair) if pair.is_sentinel() => DecodeState::EndOfQuery,
                Some(pair) => {
                    current.push(pair);
                    DecodeState::ReadingPair
                }
                None => DecodeState::EndOfBatch,
            },
            DecodeState::EndOfQuery => {
                lists.push(std::mem::take(&mut current));
                match shape {
                    ResultShape::Batched => DecodeState::ReadingPair,
                    _ => DecodeState::EndOfBatch,
                }
            }
            DecodeState::EndOfBatch => DecodeState::EndOfBatch,
        };
    }

    match shape {
        ResultShape::Batched => {
            if !current.is_empty() {
                warn!(
                    "dropping {} result pairs after the last sentinel",
                    current.len()
                );
            }
            Ok(Reply::Batch(lists))
        }
        _ => Ok(Reply::Results(lists.pop().unwrap_or(current))),
    }
}

/// Encodes result lists the way the appliance does, each closed by a sentinel pair.
pub fn encode_results(lists: &[Vec<QueryResult>]) -> Vec<u8> {
    let pairs: usize = lists.iter().map(|l| l.len() + 1).sum();
    let mut out = Vec::with_capacity(pairs * PAIR_LEN);
    for list in lists {
        for r in list {
            out.extend_from_slice(&r.dataset_id.to_le_bytes());
            out.extend_from_slice(&r.distance.to_le_bytes());
        }
        out.extend_from_slice(&SENTINEL.to_le_bytes());
        out.extend_from_slice(&SENTINEL.to_le_bytes());
    }
    out
}

fn read_word(bytes: &[u8]) -> u64 {
    let mut word = [0; WORD_LEN];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}
