//! Chunked execution of large query workloads.
//!
//! The appliance answers a single QUERY request for a bounded number of vectors
//! efficiently. [`BatchQuery`] splits a workload into contiguous chunks, issues them one
//! after another through a [`QueryExecutor`] and stitches the per-query result lists back
//! together in input order.
//!
//! # Example
//! ```rust
//! use simlink::{BatchOptions, BatchQuery, BatchResult, ProtocolError, QueryExecutor, QueryResult};
//!
//! struct Echo;
//!
//! impl QueryExecutor for Echo {
//!     fn execute_chunk(&mut self, chunk: &[Vec<u8>]) -> Result<BatchResult, ProtocolError> {
//!         Ok(chunk
//!             .iter()
//!             .map(|v| vec![QueryResult::new(u64::from(v[0]), 0)])
//!             .collect())
//!     }
//! }
//!
//! let vectors: Vec<Vec<u8>> = (0..10).map(|i| vec![i, 0]).collect();
//! let results = BatchQuery::new(BatchOptions { chunk_size: 4, verbose: false })
//!     .run(&mut Echo, &vectors)
//!     .unwrap();
//!
//! assert_eq!(results.len(), 10);
//! assert_eq!(results[9][0].dataset_id, 9);
//! ```
use std::{
    fmt,
    time::{Duration, Instant},
};

use log::{debug, error, info};

use crate::protocol::{BatchResult, ProtocolError, matrix_width};

/// Vectors carried by one QUERY request unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum number of vectors per QUERY request.
    pub chunk_size: usize,
    /// Log progress after each chunk.
    pub verbose: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            verbose: true,
        }
    }
}

/// Something that can answer one chunk of queries with one result list per vector.
pub trait QueryExecutor {
    fn execute_chunk(&mut self, chunk: &[Vec<u8>]) -> Result<BatchResult, ProtocolError>;
}

/// Snapshot of a running batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
    pub elapsed: Duration,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.done as f64 / self.total as f64 * 100.0
    }

    pub fn queries_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.done as f64 / secs
    }

    /// Remaining time extrapolated from the average time per query so far.
    pub fn remaining(&self) -> Option<Duration> {
        if self.done == 0 {
            return None;
        }
        let per_query = self.elapsed.as_secs_f64() / self.done as f64;
        Some(Duration::from_secs_f64(
            per_query * self.total.saturating_sub(self.done) as f64,
        ))
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "query {:5} / {:5} ({:3.0}%) time remaining: ",
            self.done,
            self.total,
            self.percent()
        )?;
        match self.remaining() {
            None => write!(f, "unknown"),
            Some(d) if d < Duration::from_secs(60) => write!(f, "<1 min"),
            Some(d) => write!(f, "~{:.0} min", d.as_secs_f64() / 60.0),
        }
    }
}

/// Runs a workload chunk by chunk, strictly in sequence.
pub struct BatchQuery<'a> {
    options: BatchOptions,
    observer: Option<Box<dyn FnMut(&Progress) + 'a>>,
}

impl<'a> BatchQuery<'a> {
    pub fn new(options: BatchOptions) -> Self {
        Self {
            options,
            observer: None,
        }
    }

    /// Calls `f` after every chunk but the last.
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Progress) + 'a,
    {
        self.observer = Some(Box::new(f));
        self
    }

    /// Executes `vectors` in chunks and returns one result list per vector, in order.
    ///
    /// # Errors
    ///
    /// Validation errors for an empty workload, ragged widths or a zero chunk size.
    /// [`ProtocolError::Desync`] when a chunk comes back with the wrong number of result
    /// lists; the connection behind the executor must then be reopened. Executor errors are
    /// returned as-is, and nothing is retried.
    pub fn run<E>(
        &mut self,
        executor: &mut E,
        vectors: &[Vec<u8>],
    ) -> Result<BatchResult, ProtocolError>
    where
        E: QueryExecutor + ?Sized,
    {
        let chunk_size = self.options.chunk_size;
        if chunk_size == 0 {
            return Err(ProtocolError::InvalidArgument(
                "chunk size must be at least 1".into(),
            ));
        }
        let width = matrix_width(vectors)?;
        let total = vectors.len();
        let chunks = total.div_ceil(chunk_size);
        debug!("querying {total} vectors of width {width} in {chunks} chunks");

        let start = Instant::now();
        let mut results = BatchResult::with_capacity(total);

        for (i, chunk) in vectors.chunks(chunk_size).enumerate() {
            let lists = executor.execute_chunk(chunk)?;
            if lists.len() != chunk.len() {
                error!(
                    "chunk {i} sent {} queries but received {} result lists",
                    chunk.len(),
                    lists.len()
                );
                return Err(ProtocolError::Desync {
                    expected: chunk.len(),
                    received: lists.len(),
                });
            }
            results.extend(lists);

            if i + 1 < chunks {
                self.report(Progress {
                    done: results.len(),
                    total,
                    elapsed: start.elapsed(),
                });
            }
        }

        let elapsed = start.elapsed();
        if self.options.verbose {
            info!(
                "completed {total} queries in {chunks} chunks, {:.1} queries/s",
                Progress {
                    done: total,
                    total,
                    elapsed
                }
                .queries_per_sec()
            );
        }
        Ok(results)
    }

    fn report(&mut self, progress: Progress) {
        if self.options.verbose {
            info!("{progress}");
        }
        if let Some(observer) = self.observer.as_mut() {
            observer(&progress);
        }
    }
}
