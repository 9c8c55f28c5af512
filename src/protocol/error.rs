use std::{fmt, io};

use thiserror::Error;

use super::{Command, Status};

/// Part of a message a checksum covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Header,
    Body,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Header => f.write_str("header"),
            Section::Body => f.write_str("body"),
        }
    }
}

/// Broad family an error belongs to; decides what the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Socket failures. The caller decides whether to reconnect.
    Transport,
    /// Non-success status from the appliance. The connection stays usable.
    Appliance,
    /// The byte stream can no longer be trusted; reconnect.
    Desync,
    /// Arguments rejected before anything was sent.
    Validation,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport io error: {0}")]
    Io(#[source] io::Error),

    #[error("connection closed by peer after {received} of {expected} bytes")]
    Closed { expected: usize, received: usize },

    #[error("connection is not open")]
    NotConnected,

    #[error("no usable address for '{0}'")]
    Resolve(String),

    #[error("timed out waiting on the appliance")]
    TimedOut,

    #[error("failed to encode header: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode header: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("failed to encode json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("appliance rejected {command}: {status}")]
    Appliance { command: Command, status: Status },

    #[error("unknown {kind} code {code:#x}")]
    UnknownCode { kind: &'static str, code: u32 },

    #[error("{section} checksum mismatch: received {received:#010x}, computed {computed:#010x}")]
    InvalidChecksum {
        section: Section,
        received: u32,
        computed: u32,
    },

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    #[error("declared body of {len} bytes exceeds the {max} byte limit")]
    BodyTooLarge { len: u64, max: u64 },

    #[error("protocol desync: sent {expected} queries but received {received} result lists")]
    Desync { expected: usize, received: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid sequence: {0}")]
    InvalidSequence(String),
}

impl From<io::Error> for ProtocolError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ProtocolError::TimedOut,
            _ => ProtocolError::Io(value),
        }
    }
}

impl ProtocolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::Closed { .. }
            | ProtocolError::NotConnected
            | ProtocolError::Resolve(_)
            | ProtocolError::TimedOut => ErrorClass::Transport,
            ProtocolError::Appliance { status, .. } if status.indicates_desync() => {
                ErrorClass::Desync
            }
            ProtocolError::Appliance { .. } => ErrorClass::Appliance,
            ProtocolError::Decode(_)
            | ProtocolError::UnknownCode { .. }
            | ProtocolError::InvalidChecksum { .. }
            | ProtocolError::MalformedBody(_)
            | ProtocolError::BodyTooLarge { .. }
            | ProtocolError::Desync { .. } => ErrorClass::Desync,
            ProtocolError::Encode(_)
            | ProtocolError::Json(_)
            | ProtocolError::InvalidArgument(_)
            | ProtocolError::InvalidSequence(_) => ErrorClass::Validation,
        }
    }

    /// Whether the connection must be closed and reopened before further use.
    pub fn requires_reconnect(&self) -> bool {
        match self.class() {
            ErrorClass::Desync => true,
            ErrorClass::Transport => !matches!(self, ProtocolError::NotConnected),
            ErrorClass::Appliance | ErrorClass::Validation => false,
        }
    }

    /// Status code carried by an appliance rejection.
    pub fn status(&self) -> Option<Status> {
        match self {
            ProtocolError::Appliance { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_map_to_timed_out() {
        let err: ProtocolError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(err, ProtocolError::TimedOut));

        let err: ProtocolError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(matches!(err, ProtocolError::TimedOut));

        let err: ProtocolError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn appliance_errors_keep_connection() {
        let err = ProtocolError::Appliance {
            command: Command::Query,
            status: Status::InvalidApiKey,
        };
        assert_eq!(err.class(), ErrorClass::Appliance);
        assert!(!err.requires_reconnect());
        assert_eq!(err.status(), Some(Status::InvalidApiKey));
        assert_eq!(err.to_string(), "appliance rejected QUERY: INVALID_API_KEY");
    }

    #[test]
    fn desync_requires_reconnect() {
        let err = ProtocolError::Desync {
            expected: 128,
            received: 127,
        };
        assert_eq!(err.class(), ErrorClass::Desync);
        assert!(err.requires_reconnect());

        let err = ProtocolError::Appliance {
            command: Command::Query,
            status: Status::InvalidPacket,
        };
        assert!(err.requires_reconnect());

        let err = ProtocolError::BodyTooLarge {
            len: u64::MAX,
            max: 1024,
        };
        assert_eq!(err.class(), ErrorClass::Desync);
        assert!(err.requires_reconnect());
    }
}
