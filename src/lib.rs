pub mod config;
pub mod error;
pub mod db;
pub mod ingest;
pub mod ledger;
pub mod sync;
pub mod events;
pub mod watch;
pub mod pipeline;

pub use config::Config;
pub use error::{TabsyncError, Result};
pub use pipeline::{Coordinator, FileOutcome, RunSummary};
