//! Session with a similarity-search appliance.
//!
//! [`Client`] owns the connection to one appliance and exposes one method per protocol
//! command. Every call writes a single request and blocks until the complete response has
//! been read; one connection never has more than one request in flight.
//!
//! Configuration commands (distance mode, query mode, read count, threshold) change state
//! held by the appliance for the rest of the session. The client mirrors what it last set
//! successfully in a [`SessionConfig`] and can optionally refuse to query before that
//! configuration is complete.
//!
//! # Example
//! ```no_run
//! use simlink::{Client, ConnectionOptions, DistanceMode, QueryMode};
//!
//! let mut client = Client::open("10.0.0.5", 5555, "my-key", ConnectionOptions::default())?;
//! client.reset()?;
//! client.set_distance_mode(DistanceMode::L1)?;
//! client.set_query_mode(QueryMode::KnnA)?;
//! client.set_read_count(10)?;
//! client.load_dataset_file("/data/mnist.bin", "mnist")?;
//!
//! let nearest = client.query(vec![0; 784])?;
//! println!("{} results", nearest.len());
//! client.close();
//! # Ok::<(), simlink::ProtocolError>(())
//! ```
use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::{
    batch::{BatchOptions, BatchQuery, QueryExecutor},
    protocol::{
        ApiKey, BatchResult, Command, DatasetFile, DistanceMode, MAX_BODY_LEN, Payload,
        ProtocolError, ProtocolTransport, QueryFile, QueryMode, QueryResult, RandomDataset, Reply,
        Request, ResultShape,
    },
};

/// DS_LOAD `attribute_1` values.
const DS_LOAD_INLINE: u64 = 0;
const DS_LOAD_FILE: u64 = 1;
const DS_LOAD_RANDOM: u64 = 2;

/// QUERY `attribute_1` values.
const QUERY_SINGLE: u64 = 0;
const QUERY_BATCH: u64 = 1;
const QUERY_FILE: u64 = 2;

/// TCP keepalive probing.
#[derive(Debug, Clone)]
pub struct KeepaliveOptions {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Time between unanswered probes.
    pub interval: Duration,
    /// Unanswered probes before the connection is dropped.
    pub retries: u32,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(7200),
            interval: Duration::from_secs(75),
            retries: 8,
        }
    }
}

impl KeepaliveOptions {
    fn to_socket(&self) -> TcpKeepalive {
        let keepalive = TcpKeepalive::new().with_time(self.idle);
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
        let keepalive = keepalive.with_interval(self.interval);
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        let keepalive = keepalive.with_retries(self.retries);
        keepalive
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Option<Duration>,
    /// Upper bound on any single read; `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// `None` leaves keepalive disabled.
    pub keepalive: Option<KeepaliveOptions>,
    /// Fail on response checksum mismatches instead of logging them.
    pub verify_checksums: bool,
    /// Largest response body accepted from the appliance.
    pub max_body_len: u64,
    /// Refuse to query until the session is fully configured.
    pub strict_sequencing: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: None,
            write_timeout: None,
            keepalive: Some(KeepaliveOptions::default()),
            verify_checksums: true,
            max_body_len: MAX_BODY_LEN,
            strict_sequencing: false,
        }
    }
}

/// Query threshold; a single bound or an inclusive range for [`QueryMode::Range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Single(u64),
    Range { lower: u64, upper: u64 },
}

/// Appliance configuration as last set through this client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub distance_mode: Option<DistanceMode>,
    pub query_mode: Option<QueryMode>,
    pub read_count: Option<u64>,
    pub threshold: Option<Threshold>,
}

impl SessionConfig {
    fn check_query_ready(&self) -> Result<(), ProtocolError> {
        match self.distance_mode {
            None | Some(DistanceMode::NoDistanceMode) => {
                return Err(ProtocolError::InvalidSequence(
                    "query issued before a distance mode was set".into(),
                ));
            }
            Some(_) => {}
        }
        match self.query_mode {
            None | Some(QueryMode::NoQueryMode) => Err(ProtocolError::InvalidSequence(
                "query issued before a query mode was set".into(),
            )),
            Some(mode) if mode.is_knn() && self.read_count.is_none() => Err(
                ProtocolError::InvalidSequence(format!("{mode} query issued without a read count")),
            ),
            Some(QueryMode::Range) if !matches!(self.threshold, Some(Threshold::Range { .. })) => {
                Err(ProtocolError::InvalidSequence(
                    "RANGE query issued without a threshold range".into(),
                ))
            }
            Some(mode @ (QueryMode::Gt | QueryMode::Lt | QueryMode::Eq))
                if self.threshold.is_none() =>
            {
                Err(ProtocolError::InvalidSequence(format!(
                    "{mode} query issued without a threshold"
                )))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Connection to one appliance.
pub struct Client<T: Read + Write = TcpStream> {
    transport: Option<ProtocolTransport<T>>,
    api_key: ApiKey,
    options: ConnectionOptions,
    session: SessionConfig,
}

impl Client<TcpStream> {
    /// Resolves `host`, connects with keepalive enabled and stores `api_key` for every
    /// request on this connection.
    pub fn open(
        host: &str,
        port: u16,
        api_key: &str,
        options: ConnectionOptions,
    ) -> Result<Self, ProtocolError> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| ProtocolError::Resolve(format!("{host}:{port} ({e})")))?;

        let mut last_err = None;
        for addr in addrs {
            match connect(addr, &options) {
                Ok(stream) => {
                    info!("connected to appliance at {addr}");
                    return Ok(Self::from_stream(stream, api_key, options));
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => e.into(),
            None => ProtocolError::Resolve(format!("{host}:{port}")),
        })
    }
}

fn connect(addr: SocketAddr, options: &ConnectionOptions) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(keepalive) = &options.keepalive {
        socket.set_keepalive(true)?;
        socket.set_tcp_keepalive(&keepalive.to_socket())?;
    }

    match options.connect_timeout {
        Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
        None => socket.connect(&addr.into())?,
    }

    let stream: TcpStream = socket.into();
    stream.set_nodelay(true)?;
    stream.set_read_timeout(options.read_timeout.filter(|t| !t.is_zero()))?;
    stream.set_write_timeout(options.write_timeout.filter(|t| !t.is_zero()))?;
    Ok(stream)
}

impl<T: Read + Write> Client<T> {
    /// Wraps an already connected stream.
    pub fn from_stream(stream: T, api_key: &str, options: ConnectionOptions) -> Self {
        let transport = ProtocolTransport::new(stream)
            .verify_checksums(options.verify_checksums)
            .max_body_len(options.max_body_len);
        Self {
            transport: Some(transport),
            api_key: ApiKey::new(api_key),
            options,
            session: SessionConfig::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Releases the connection. Later requests fail with [`ProtocolError::NotConnected`].
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            info!("connection closed");
        }
    }

    fn execute(&mut self, request: Request, shape: ResultShape) -> Result<Reply, ProtocolError> {
        let transport = self.transport.as_mut().ok_or(ProtocolError::NotConnected)?;
        debug!(
            "sending {} attributes ({}, {}) body {}",
            request.command, request.attribute_0, request.attribute_1, request.body_length
        );
        let reply = transport
            .send_request(&request)
            .and_then(|response| response.reply(shape));
        self.drop_if_unusable(reply)
    }

    /// Closes the connection when `result` leaves the stream misaligned.
    fn drop_if_unusable<R>(
        &mut self,
        result: Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        if let Err(e) = &result {
            if e.requires_reconnect() && self.transport.take().is_some() {
                warn!("closing connection after unrecoverable error: {e}");
            }
        }
        result
    }

    fn command(
        &mut self,
        command: Command,
        attribute_0: u64,
        attribute_1: u64,
    ) -> Result<u64, ProtocolError> {
        let request = Request::new(self.api_key, command).with_attributes(attribute_0, attribute_1);
        self.execute(request, ResultShape::Scalar)?.into_scalar()
    }

    /// Clears all appliance state, including loaded datasets.
    pub fn reset(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::Reset, 0, 0)?;
        self.session = SessionConfig::default();
        Ok(())
    }

    pub fn reset_timer(&mut self) -> Result<(), ProtocolError> {
        self.command(Command::ResetTimer, 0, 0)?;
        Ok(())
    }

    /// Device time in nanoseconds since the last timer reset.
    pub fn get_timer_value(&mut self) -> Result<u64, ProtocolError> {
        self.command(Command::GetTimer, 0, 0)
    }

    pub fn set_distance_mode(&mut self, mode: DistanceMode) -> Result<(), ProtocolError> {
        self.command(Command::DistanceMode, mode.into(), 0)?;
        self.session.distance_mode = Some(mode);
        Ok(())
    }

    pub fn set_query_mode(&mut self, mode: QueryMode) -> Result<(), ProtocolError> {
        self.command(Command::QueryMode, mode.into(), 0)?;
        self.session.query_mode = Some(mode);
        Ok(())
    }

    /// Sets `k` for the k-NN query modes.
    pub fn set_read_count(&mut self, count: u64) -> Result<(), ProtocolError> {
        self.command(Command::ReadCount, count, 0)?;
        self.session.read_count = Some(count);
        Ok(())
    }

    /// Sets the threshold for the GT, LT, EQ and k-NN modes.
    pub fn set_threshold(&mut self, threshold: u64) -> Result<(), ProtocolError> {
        self.command(Command::Threshold, threshold, 0)?;
        self.session.threshold = Some(Threshold::Single(threshold));
        Ok(())
    }

    /// Sets both bounds for [`QueryMode::Range`].
    pub fn set_threshold_range(&mut self, lower: u64, upper: u64) -> Result<(), ProtocolError> {
        if lower > upper {
            return Err(ProtocolError::InvalidArgument(format!(
                "threshold range {lower}..{upper} is empty"
            )));
        }
        self.command(Command::Threshold, lower, upper)?;
        self.session.threshold = Some(Threshold::Range { lower, upper });
        Ok(())
    }

    /// Uploads `vectors` as the appliance dataset.
    pub fn ds_load(&mut self, vectors: Vec<Vec<u8>>) -> Result<(), ProtocolError> {
        let payload = Payload::batch(vectors)?;
        let request = Request::new(self.api_key, Command::DsLoad)
            .with_attributes(payload.width() as u64, DS_LOAD_INLINE)
            .with_payload(payload);
        self.execute(request, ResultShape::Scalar)?;
        Ok(())
    }

    /// Loads a dataset file already stored on the appliance.
    pub fn load_dataset_file(
        &mut self,
        file_name: &str,
        dataset_name: &str,
    ) -> Result<(), ProtocolError> {
        let payload = Payload::json(&DatasetFile {
            dataset_name,
            file_name,
        })?;
        let request = Request::new(self.api_key, Command::DsLoad)
            .with_attributes(0, DS_LOAD_FILE)
            .with_payload(payload);
        self.execute(request, ResultShape::Scalar)?;
        Ok(())
    }

    /// Has the appliance generate a random dataset.
    pub fn ds_load_random(
        &mut self,
        vector_count: u64,
        component_count: u64,
    ) -> Result<(), ProtocolError> {
        let payload = Payload::json(&RandomDataset {
            vector_count,
            component_count,
        })?;
        let request = Request::new(self.api_key, Command::DsLoad)
            .with_attributes(0, DS_LOAD_RANDOM)
            .with_payload(payload);
        self.execute(request, ResultShape::Scalar)?;
        Ok(())
    }

    /// Runs a single query vector.
    pub fn query(&mut self, vector: Vec<u8>) -> Result<Vec<QueryResult>, ProtocolError> {
        self.check_query_ready()?;
        let payload = Payload::vector(vector)?;
        let request = Request::new(self.api_key, Command::Query)
            .with_attributes(payload.width() as u64, QUERY_SINGLE)
            .with_payload(payload);
        self.execute(request, ResultShape::Flat)?.into_results()
    }

    /// Runs many query vectors in chunks of `options.chunk_size`.
    ///
    /// After a [`ProtocolError::Desync`] the connection is closed and must be reopened.
    pub fn query_batch(
        &mut self,
        vectors: &[Vec<u8>],
        options: &BatchOptions,
    ) -> Result<BatchResult, ProtocolError> {
        let result = BatchQuery::new(options.clone()).run(self, vectors);
        self.drop_if_unusable(result)
    }

    /// Runs the queries in a file stored on the appliance, which writes the results to
    /// `output_name` on its side. Returns `attribute_0` of the response.
    pub fn query_from_file(
        &mut self,
        file_name: &str,
        dataset_name: &str,
        output_name: &str,
    ) -> Result<u64, ProtocolError> {
        let payload = Payload::json(&QueryFile {
            file_name,
            dataset_name,
            output: output_name,
        })?;
        let request = Request::new(self.api_key, Command::Query)
            .with_attributes(0, QUERY_FILE)
            .with_payload(payload);
        self.execute(request, ResultShape::Scalar)?.into_scalar()
    }

    fn check_query_ready(&self) -> Result<(), ProtocolError> {
        if self.options.strict_sequencing {
            self.session.check_query_ready()?;
        }
        Ok(())
    }
}

impl<T: Read + Write> QueryExecutor for Client<T> {
    fn execute_chunk(&mut self, chunk: &[Vec<u8>]) -> Result<BatchResult, ProtocolError> {
        self.check_query_ready()?;
        let payload = Payload::batch(chunk.to_vec())?;
        let request = Request::new(self.api_key, Command::Query)
            .with_attributes(payload.width() as u64, QUERY_BATCH)
            .with_payload(payload);
        self.execute(request, ResultShape::Batched)?.into_batch()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpListener,
        thread::{self, JoinHandle},
    };

    use super::*;
    use crate::protocol::{Response, Status, encode_results};

    const KEY: &str = "secret";

    /// Serves requests with `handler` until the client hangs up; returns what it saw.
    fn spawn_stub<F>(mut handler: F) -> (SocketAddr, JoinHandle<Vec<Request>>)
    where
        F: FnMut(&Request) -> Response + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(sock);
            let mut seen = Vec::new();
            while let Ok(request) = transport.read_request() {
                transport.write_response(&handler(&request)).unwrap();
                seen.push(request);
            }
            seen
        });
        (addr, handle)
    }

    /// Minimal appliance: queries answer each vector with `(v[0] | v[1] << 8, v[2])` and
    /// advance the timer; RESET and RESET_TIMER zero it.
    fn appliance() -> impl FnMut(&Request) -> Response + Send + 'static {
        let mut timer = 0_u64;
        move |request| {
            let ok = Response::new(request.command, Status::Success);
            match request.command {
                Command::Reset | Command::ResetTimer => {
                    timer = 0;
                    ok
                }
                Command::GetTimer => ok.with_attributes(timer, 0),
                Command::Query if request.attribute_1 == QUERY_FILE => ok.with_attributes(7, 0),
                Command::Query => {
                    timer += 1000;
                    let width = request.attribute_0 as usize;
                    let Some(Payload::RawBytes(body)) = &request.body else {
                        return Response::new(Command::Query, Status::InvalidData);
                    };
                    let lists: Vec<Vec<QueryResult>> = body
                        .chunks(width)
                        .map(|v| {
                            let id = u64::from(v[0]) | (u64::from(v[1]) << 8);
                            vec![QueryResult::new(id, u64::from(v[2]))]
                        })
                        .collect();
                    ok.with_attributes(request.attribute_0, request.attribute_1)
                        .with_body(encode_results(&lists))
                }
                _ => ok,
            }
        }
    }

    fn open(addr: SocketAddr, options: ConnectionOptions) -> Client {
        Client::open("127.0.0.1", addr.port(), KEY, options).unwrap()
    }

    fn configured(client: &mut Client) {
        client.set_distance_mode(DistanceMode::L1).unwrap();
        client.set_query_mode(QueryMode::KnnA).unwrap();
        client.set_read_count(1).unwrap();
    }

    #[test]
    fn reset_is_idempotent() {
        let (addr, stub) = spawn_stub(appliance());
        let mut client = open(addr, ConnectionOptions::default());

        configured(&mut client);
        client.query(vec![1, 0, 9]).unwrap();
        assert_eq!(client.get_timer_value().unwrap(), 1000);

        client.reset().unwrap();
        client.reset().unwrap();
        assert_eq!(client.session(), &SessionConfig::default());
        assert_eq!(client.get_timer_value().unwrap(), 0);

        client.close();
        let seen = stub.join().unwrap();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|r| r.api_key == ApiKey::new(KEY)));
    }

    #[test]
    fn configuration_commands_carry_codes() {
        let (addr, stub) = spawn_stub(appliance());
        let mut client = open(addr, ConnectionOptions::default());

        client.set_distance_mode(DistanceMode::Hamming).unwrap();
        client.set_query_mode(QueryMode::Range).unwrap();
        client.set_read_count(25).unwrap();
        client.set_threshold(40).unwrap();
        client.set_threshold_range(10, 20).unwrap();
        client.reset_timer().unwrap();
        assert_eq!(
            client.session(),
            &SessionConfig {
                distance_mode: Some(DistanceMode::Hamming),
                query_mode: Some(QueryMode::Range),
                read_count: Some(25),
                threshold: Some(Threshold::Range {
                    lower: 10,
                    upper: 20
                }),
            }
        );
        client.close();

        let seen: Vec<_> = stub
            .join()
            .unwrap()
            .into_iter()
            .map(|r| (r.command, r.attribute_0, r.attribute_1, r.body_length))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Command::DistanceMode, 2, 0, 0),
                (Command::QueryMode, 6, 0, 0),
                (Command::ReadCount, 25, 0, 0),
                (Command::Threshold, 40, 0, 0),
                (Command::Threshold, 10, 20, 0),
                (Command::ResetTimer, 0, 0, 0),
            ]
        );
    }

    #[test]
    fn single_query_returns_flat_results() {
        let (addr, stub) = spawn_stub(appliance());
        let mut client = open(addr, ConnectionOptions::default());

        let results = client.query(vec![3, 1, 42, 0]).unwrap();
        assert_eq!(results, vec![QueryResult::new(259, 42)]);
        client.close();

        let seen = stub.join().unwrap();
        assert_eq!(seen[0].attribute_0, 4);
        assert_eq!(seen[0].attribute_1, QUERY_SINGLE);
        assert_eq!(seen[0].body, Some(Payload::RawBytes(vec![3, 1, 42, 0])));
    }

    #[test]
    fn batch_query_is_chunked_and_ordered() {
        let (addr, stub) = spawn_stub(appliance());
        let mut client = open(addr, ConnectionOptions::default());

        let vectors: Vec<Vec<u8>> = (0..300_usize)
            .map(|i| vec![i as u8, (i >> 8) as u8, (i % 7) as u8])
            .collect();
        let results = client
            .query_batch(
                &vectors,
                &BatchOptions {
                    chunk_size: 128,
                    verbose: false,
                },
            )
            .unwrap();

        assert_eq!(results.len(), 300);
        for (i, list) in results.iter().enumerate() {
            assert_eq!(list, &vec![QueryResult::new(i as u64, (i % 7) as u64)]);
        }
        client.close();

        let lengths: Vec<_> = stub
            .join()
            .unwrap()
            .iter()
            .map(|r| (r.attribute_0, r.attribute_1, r.body_length))
            .collect();
        assert_eq!(lengths, vec![(3, 1, 384), (3, 1, 384), (3, 1, 132)]);
    }

    #[test]
    fn appliance_error_leaves_connection_usable() {
        let mut rejected = false;
        let mut inner = appliance();
        let (addr, stub) = spawn_stub(move |request| {
            if !rejected {
                rejected = true;
                // Declares a body it never sends.
                let mut response = Response::new(request.command, Status::InvalidApiKey);
                response.body_length = 16;
                return response;
            }
            inner(request)
        });
        let mut client = open(addr, ConnectionOptions::default());

        let err = client.query(vec![1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Appliance {
                command: Command::Query,
                status: Status::InvalidApiKey
            }
        ));
        assert!(!err.requires_reconnect());

        assert_eq!(client.get_timer_value().unwrap(), 0);
        client.close();
        stub.join().unwrap();
    }

    #[test]
    fn dataset_loading_payloads() {
        let (addr, stub) = spawn_stub(appliance());
        let mut client = open(addr, ConnectionOptions::default());

        client.ds_load(vec![vec![1, 2], vec![3, 4]]).unwrap();
        client.load_dataset_file("/srv/words.bin", "words").unwrap();
        client.ds_load_random(1000, 64).unwrap();
        assert_eq!(
            client.query_from_file("/srv/q.bin", "words", "/srv/out.bin").unwrap(),
            7
        );
        assert!(client.ds_load(vec![vec![1, 2], vec![3]]).is_err());
        client.close();

        let seen = stub.join().unwrap();
        assert_eq!(seen.len(), 4);

        assert_eq!(seen[0].command, Command::DsLoad);
        assert_eq!((seen[0].attribute_0, seen[0].attribute_1), (2, DS_LOAD_INLINE));
        assert_eq!(seen[0].body, Some(Payload::RawBytes(vec![1, 2, 3, 4])));

        let json = |r: &Request| -> serde_json::Value {
            let Some(Payload::RawBytes(body)) = &r.body else {
                panic!("missing body");
            };
            assert_eq!(r.body_length, body.len() as u64);
            serde_json::from_slice(body).unwrap()
        };

        assert_eq!(seen[1].attribute_1, DS_LOAD_FILE);
        assert_eq!(
            json(&seen[1]),
            serde_json::json!({"datasetName": "words", "fileName": "/srv/words.bin"})
        );

        assert_eq!(seen[2].attribute_1, DS_LOAD_RANDOM);
        assert_eq!(
            json(&seen[2]),
            serde_json::json!({"vectorCount": 1000, "compCount": 64})
        );

        assert_eq!(seen[3].command, Command::Query);
        assert_eq!((seen[3].attribute_0, seen[3].attribute_1), (0, QUERY_FILE));
        assert_eq!(
            json(&seen[3]),
            serde_json::json!({
                "fileName": "/srv/q.bin",
                "datasetName": "words",
                "output": "/srv/out.bin"
            })
        );
    }

    #[test]
    fn strict_sequencing_checks_locally() {
        let (addr, stub) = spawn_stub(appliance());
        let options = ConnectionOptions {
            strict_sequencing: true,
            ..Default::default()
        };
        let mut client = open(addr, options);

        assert!(matches!(
            client.query(vec![1, 2, 3]),
            Err(ProtocolError::InvalidSequence(_))
        ));
        client.set_distance_mode(DistanceMode::L1).unwrap();
        client.set_query_mode(QueryMode::KnnD).unwrap();
        assert!(matches!(
            client.query_batch(&[vec![1, 2, 3]], &BatchOptions::default()),
            Err(ProtocolError::InvalidSequence(_))
        ));

        client.set_read_count(3).unwrap();
        assert_eq!(client.query(vec![1, 0, 2]).unwrap().len(), 1);
        client.close();

        let commands: Vec<_> = stub.join().unwrap().iter().map(|r| r.command).collect();
        assert_eq!(
            commands,
            vec![
                Command::DistanceMode,
                Command::QueryMode,
                Command::ReadCount,
                Command::Query
            ]
        );
    }

    #[test]
    fn closed_client_rejects_requests() {
        let (addr, stub) = spawn_stub(appliance());
        let mut client = open(addr, ConnectionOptions::default());

        client.close();
        assert!(!client.is_open());
        assert!(matches!(client.reset(), Err(ProtocolError::NotConnected)));
        assert!(stub.join().unwrap().is_empty());
    }

    #[test]
    fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(sock);
            transport.read_request().unwrap();
            // Hold the connection open without answering until the client hangs up.
            let _ = transport.read_request();
        });

        let options = ConnectionOptions {
            read_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut client = open(addr, options);
        let err = client.get_timer_value().unwrap_err();
        assert!(matches!(err, ProtocolError::TimedOut));
        assert!(err.requires_reconnect());

        assert!(!client.is_open());
        assert!(matches!(client.reset(), Err(ProtocolError::NotConnected)));

        client.close();
        stub.join().unwrap();
    }

    #[test]
    fn unreachable_appliance_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Client::open("127.0.0.1", port, KEY, ConnectionOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.class(), crate::protocol::ErrorClass::Transport);
    }

    #[test]
    fn misaligned_reply_closes_connection() {
        let (addr, stub) = spawn_stub(|request| {
            let mut response = Response::new(request.command, Status::Success);
            response.body_length = u64::MAX;
            response
        });
        let mut client = open(addr, ConnectionOptions::default());

        let err = client.query(vec![1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BodyTooLarge {
                len: u64::MAX,
                max: MAX_BODY_LEN
            }
        ));
        assert!(!client.is_open());
        assert!(matches!(
            client.get_timer_value(),
            Err(ProtocolError::NotConnected)
        ));
        assert_eq!(stub.join().unwrap().len(), 1);
    }

    #[test]
    fn batch_desync_closes_connection() {
        let mut inner = appliance();
        let (addr, stub) = spawn_stub(move |request| {
            let mut response = inner(request);
            if request.command == Command::Query {
                let lists = vec![vec![QueryResult::new(1, 1)]];
                response = response.with_body(encode_results(&lists));
            }
            response
        });
        let mut client = open(addr, ConnectionOptions::default());

        let vectors = vec![vec![1, 0, 0], vec![2, 0, 0]];
        let err = client
            .query_batch(&vectors, &BatchOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Desync {
                expected: 2,
                received: 1
            }
        ));
        assert!(!client.is_open());
        assert_eq!(stub.join().unwrap().len(), 1);
    }

    #[test]
    fn empty_threshold_range_is_rejected() {
        let (addr, stub) = spawn_stub(appliance());
        let mut client = open(addr, ConnectionOptions::default());

        assert!(matches!(
            client.set_threshold_range(9, 3),
            Err(ProtocolError::InvalidArgument(_))
        ));
        client.close();
        assert!(stub.join().unwrap().is_empty());
    }
}
