#![warn(clippy::all)]

//! Aggregate proxy configs from many subscription sources.
//!
//! A run fetches every healthy source, parses and normalizes the configs
//! it finds, tests them for reachability, drops semantic duplicates and
//! writes ranked results incrementally in several formats.

pub mod batch;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod notify;
pub mod output;
pub mod pipeline;
pub mod state;
pub mod tester;

pub use batch::{Batch, BatchProcessor, HashComputer, OutputSink, ResultSource};
pub use codec::{Codec, ParsedConfig, Protocol};
pub use config::{RuntimeConfig, SourceDescriptor};
pub use dedup::Deduplicator;
pub use error::{ConfigError, FetchError, PersistError};
pub use fetcher::Fetcher;
pub use pipeline::{run, Aggregator, RunSummary};
pub use state::{SourceEvent, SourceState, StateManager};
pub use tester::{ConnectivityTester, TestedConfig};
