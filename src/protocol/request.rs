use std::fmt;

use bincode::{Decode, Encode};
use serde::Serialize;

use super::{CHECKSUM_LEN, Command, ProtocolError, Section, checksum, wire_config};

/// Width of the API key field.
pub const API_KEY_LEN: usize = 8;

/// Request header size, checksum included.
pub const REQUEST_HEADER_LEN: usize = REQUEST_FIELDS_LEN + CHECKSUM_LEN;

const REQUEST_FIELDS_LEN: usize = 2 * size_of::<u32>() + 3 * size_of::<u64>() + API_KEY_LEN;

/// Access key sent with every request: exactly eight bytes, space padded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ApiKey([u8; API_KEY_LEN]);

impl ApiKey {
    /// Left-justifies `key` into the fixed field, truncating anything past eight bytes.
    pub fn new(key: &str) -> Self {
        let mut field = [b' '; API_KEY_LEN];
        let src = key.as_bytes();
        let n = src.len().min(API_KEY_LEN);
        field[..n].copy_from_slice(&src[..n]);
        Self(field)
    }

    pub fn as_bytes(&self) -> &[u8; API_KEY_LEN] {
        &self.0
    }
}

impl From<&str> for ApiKey {
    fn from(value: &str) -> Self {
        ApiKey::new(value)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(********)")
    }
}

/// Body of a request.
///
/// The unit of `body_length` depends on the variant: vector payloads count components
/// and raw payloads count bytes. Components are single bytes, so both equal the
/// number of encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    SingleVector(Vec<u8>),
    /// Vectors of equal width, encoded vector-major.
    VectorBatch(Vec<Vec<u8>>),
    /// Passed through verbatim; used for JSON descriptors.
    RawBytes(Vec<u8>),
}

impl Payload {
    pub fn vector(components: Vec<u8>) -> Result<Self, ProtocolError> {
        if components.is_empty() {
            return Err(ProtocolError::InvalidArgument(
                "query vector has no components".into(),
            ));
        }
        Ok(Payload::SingleVector(components))
    }

    pub fn batch(vectors: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        matrix_width(&vectors)?;
        Ok(Payload::VectorBatch(vectors))
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Payload::RawBytes(serde_json::to_vec(value)?))
    }

    /// Component count of a single vector; zero for raw payloads.
    pub fn width(&self) -> usize {
        match self {
            Payload::SingleVector(v) => v.len(),
            Payload::VectorBatch(vectors) => vectors.first().map_or(0, Vec::len),
            Payload::RawBytes(_) => 0,
        }
    }

    pub fn body_length(&self) -> u64 {
        let len = match self {
            Payload::SingleVector(v) => v.len(),
            Payload::VectorBatch(vectors) => vectors.iter().map(Vec::len).sum(),
            Payload::RawBytes(bytes) => bytes.len(),
        };
        len as u64
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Payload::SingleVector(v) | Payload::RawBytes(v) => out.extend_from_slice(v),
            Payload::VectorBatch(vectors) => {
                for v in vectors {
                    out.extend_from_slice(v);
                }
            }
        }
    }
}

/// Returns the shared width of `vectors`.
///
/// # Errors
///
/// Fails when the list is empty, a vector has no components, or widths differ.
pub fn matrix_width(vectors: &[Vec<u8>]) -> Result<usize, ProtocolError> {
    let width = match vectors.first() {
        Some(first) if !first.is_empty() => first.len(),
        Some(_) => {
            return Err(ProtocolError::InvalidArgument(
                "vectors must have at least one component".into(),
            ));
        }
        None => return Err(ProtocolError::InvalidArgument("no vectors supplied".into())),
    };

    if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != width) {
        return Err(ProtocolError::InvalidArgument(format!(
            "vector {i} has {} components, expected {width}",
            v.len()
        )));
    }
    Ok(width)
}

/// Narrows numeric components to the single-byte wire encoding.
pub fn to_components<T>(values: &[T]) -> Result<Vec<u8>, ProtocolError>
where
    T: Copy + TryInto<u8> + fmt::Display,
{
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            v.try_into().map_err(|_| {
                ProtocolError::InvalidArgument(format!(
                    "component {i} is {v}, outside the range 0..=255"
                ))
            })
        })
        .collect()
}

/// DS_LOAD descriptor for a dataset file already present on the appliance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetFile<'a> {
    pub dataset_name: &'a str,
    pub file_name: &'a str,
}

/// DS_LOAD descriptor asking the appliance to synthesise a random dataset.
#[derive(Debug, Serialize)]
pub struct RandomDataset {
    #[serde(rename = "vectorCount")]
    pub vector_count: u64,
    #[serde(rename = "compCount")]
    pub component_count: u64,
}

/// QUERY descriptor for a query file on the appliance; results are written server-side.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFile<'a> {
    pub file_name: &'a str,
    pub dataset_name: &'a str,
    pub output: &'a str,
}

#[derive(Debug, Encode, Decode)]
struct RequestHeader {
    command: u32,
    reserved: u32,
    attribute_0: u64,
    attribute_1: u64,
    body_length: u64,
    api_key: [u8; API_KEY_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub api_key: ApiKey,
    pub command: Command,
    pub attribute_0: u64,
    pub attribute_1: u64,
    pub body_length: u64,
    pub body: Option<Payload>,
}

impl Request {
    pub fn new(api_key: ApiKey, command: Command) -> Self {
        Self {
            api_key,
            command,
            attribute_0: 0,
            attribute_1: 0,
            body_length: 0,
            body: None,
        }
    }

    pub fn with_attributes(mut self, attribute_0: u64, attribute_1: u64) -> Self {
        self.attribute_0 = attribute_0;
        self.attribute_1 = attribute_1;
        self
    }

    /// Attaches `payload` and derives `body_length` from it.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.body_length = payload.body_length();
        self.body = Some(payload);
        self
    }

    /// Encodes the header, its checksum and the optional body with its checksum.
    ///
    /// # Errors
    ///
    /// Fails when `body_length` is non-zero without a body, or disagrees with the body.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let header = RequestHeader {
            command: self.command.code(),
            reserved: 0,
            attribute_0: self.attribute_0,
            attribute_1: self.attribute_1,
            body_length: self.body_length,
            api_key: *self.api_key.as_bytes(),
        };

        let body_len = self
            .body
            .as_ref()
            .map_or(0, |p| p.body_length() as usize + CHECKSUM_LEN);
        let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + body_len);
        bincode::encode_into_std_write(header, &mut out, wire_config())?;
        debug_assert_eq!(out.len(), REQUEST_FIELDS_LEN);
        let crc = checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());

        match (&self.body, self.body_length) {
            (None, 0) => {}
            (None, n) => {
                return Err(ProtocolError::InvalidArgument(format!(
                    "{} declares {n} body elements but carries no body",
                    self.command
                )));
            }
            (Some(payload), n) if payload.body_length() != n => {
                return Err(ProtocolError::InvalidArgument(format!(
                    "{} declares {n} body elements but the body holds {}",
                    self.command,
                    payload.body_length()
                )));
            }
            (Some(_), 0) => {}
            (Some(payload), _) => {
                let start = out.len();
                payload.encode_into(&mut out);
                let crc = checksum(&out[start..]);
                out.extend_from_slice(&crc.to_le_bytes());
            }
        }

        Ok(out)
    }

    /// Decodes and checks a request header as the appliance would.
    ///
    /// The returned request carries `body_length` but no body.
    pub fn decode_header(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < REQUEST_HEADER_LEN {
            return Err(ProtocolError::InvalidArgument(format!(
                "request header needs {REQUEST_HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let (fields, trailer) = buf[..REQUEST_HEADER_LEN].split_at(REQUEST_FIELDS_LEN);
        verify(Section::Header, fields, trailer)?;

        let (header, _): (RequestHeader, usize) =
            bincode::decode_from_slice(fields, wire_config())?;
        Ok(Self {
            api_key: ApiKey(header.api_key),
            command: header.command.try_into()?,
            attribute_0: header.attribute_0,
            attribute_1: header.attribute_1,
            body_length: header.body_length,
            body: None,
        })
    }
}

/// Compares a little-endian CRC trailer against the checksum of `bytes`.
pub(crate) fn verify(section: Section, bytes: &[u8], trailer: &[u8]) -> Result<(), ProtocolError> {
    let received = read_checksum(trailer)?;
    let computed = checksum(bytes);
    if received != computed {
        return Err(ProtocolError::InvalidChecksum {
            section,
            received,
            computed,
        });
    }
    Ok(())
}

pub(crate) fn read_checksum(trailer: &[u8]) -> Result<u32, ProtocolError> {
    let bytes: [u8; CHECKSUM_LEN] = trailer.try_into().map_err(|_| {
        ProtocolError::MalformedBody(format!("checksum trailer of {} bytes", trailer.len()))
    })?;
    Ok(u32::from_le_bytes(bytes))
}
