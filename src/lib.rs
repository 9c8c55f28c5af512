pub mod batch;
pub mod client;
pub mod protocol;

pub use batch::{BatchOptions, BatchQuery, DEFAULT_CHUNK_SIZE, Progress, QueryExecutor};
pub use client::{Client, ConnectionOptions, KeepaliveOptions, SessionConfig, Threshold};
pub use protocol::{
    BatchResult, Command, DistanceMode, ErrorClass, MAX_BODY_LEN, ProtocolError, QueryMode,
    QueryResult, Status,
};
