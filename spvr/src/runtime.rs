//! Background threads.
//!
//! - `ingestor`: the UDP pose receiver feeding the control channel.
//! - `backoff`: retry pacing for its transport failures.

pub mod backoff;
pub mod ingestor;

pub use backoff::{Backoff, BackoffConfig};
pub use ingestor::{IngestorConfig, IngestorError, IngestorHealth, IngestorStats, PoseIngestor};
