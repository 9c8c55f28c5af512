use std::{error::Error, time::Duration};

use clap::{Parser, Subcommand};
use simlink::{Client, ConnectionOptions, DistanceMode, QueryMode};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Appliance host name or address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Appliance port
    #[arg(long, default_value_t = 5555)]
    port: u16,
    /// Access key sent with every request
    #[arg(long)]
    api_key: String,
    /// Give up on a silent appliance after this many seconds
    #[arg(long)]
    read_timeout: Option<u64>,
    /// Log checksum mismatches instead of failing on them
    #[arg(long)]
    no_verify_checksums: bool,
    #[command(subcommand)]
    command: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Clear all appliance state
    Reset,
    /// Zero the device timer
    ResetTimer,
    /// Print the device timer in nanoseconds
    Timer,
    /// Select the distance metric
    DistanceMode {
        #[arg(value_parser = parse_distance_mode)]
        mode: DistanceMode,
    },
    /// Select how results are chosen
    QueryMode {
        #[arg(value_parser = parse_query_mode)]
        mode: QueryMode,
    },
    /// Set k for the k-NN query modes
    ReadCount { count: u64 },
    /// Set the query threshold, or a range when an upper bound is given
    Threshold { lower: u64, upper: Option<u64> },
    /// Load a dataset file stored on the appliance
    LoadFile { file: String, name: String },
    /// Generate a random dataset on the appliance
    LoadRandom { vectors: u64, components: u64 },
    /// Run a single query vector and print its results as JSON
    Query {
        /// Distance metric to set first on this connection
        #[arg(long, value_parser = parse_distance_mode)]
        distance: Option<DistanceMode>,
        /// Query mode to set first on this connection
        #[arg(long, value_parser = parse_query_mode)]
        mode: Option<QueryMode>,
        /// Read count to set first on this connection
        #[arg(short)]
        k: Option<u64>,
        #[arg(required = true)]
        components: Vec<u8>,
    },
    /// Run a query file stored on the appliance
    QueryFile {
        file: String,
        dataset: String,
        output: String,
    },
}

fn parse_distance_mode(s: &str) -> Result<DistanceMode, String> {
    s.parse().map_err(|e: simlink::ProtocolError| e.to_string())
}

fn parse_query_mode(s: &str) -> Result<QueryMode, String> {
    s.parse().map_err(|e: simlink::ProtocolError| e.to_string())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let options = ConnectionOptions {
        read_timeout: cli.read_timeout.map(Duration::from_secs),
        verify_checksums: !cli.no_verify_checksums,
        ..Default::default()
    };
    let mut client = Client::open(&cli.host, cli.port, &cli.api_key, options)?;

    match cli.command {
        Action::Reset => client.reset()?,
        Action::ResetTimer => client.reset_timer()?,
        Action::Timer => println!("{}", client.get_timer_value()?),
        Action::DistanceMode { mode } => client.set_distance_mode(mode)?,
        Action::QueryMode { mode } => client.set_query_mode(mode)?,
        Action::ReadCount { count } => client.set_read_count(count)?,
        Action::Threshold { lower, upper: None } => client.set_threshold(lower)?,
        Action::Threshold {
            lower,
            upper: Some(upper),
        } => client.set_threshold_range(lower, upper)?,
        Action::LoadFile { file, name } => client.load_dataset_file(&file, &name)?,
        Action::LoadRandom {
            vectors,
            components,
        } => client.ds_load_random(vectors, components)?,
        Action::Query {
            distance,
            mode,
            k,
            components,
        } => {
            if let Some(distance) = distance {
                client.set_distance_mode(distance)?;
            }
            if let Some(mode) = mode {
                client.set_query_mode(mode)?;
            }
            if let Some(k) = k {
                client.set_read_count(k)?;
            }
            let results = client.query(components)?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Action::QueryFile {
            file,
            dataset,
            output,
        } => println!("{}", client.query_from_file(&file, &dataset, &output)?),
    }

    client.close();
    Ok(())
}
