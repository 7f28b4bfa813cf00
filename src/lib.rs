//! depotsync: bring a directory to an exact changelist of a versioned depot.
//!
//! Records describing the files of a changelist stream through filter
//! stages, get batched and handed to a transfer command, and are verified by
//! checksum twice before the local state moves forward. An optional fstat
//! cache service answers the record queries from immutable cached entries.

pub mod batch;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod depot;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod record;
pub mod server;
pub mod state;
pub mod streaming;
pub mod sync;
pub mod transfer;
pub mod transport;

pub use error::{Result, SyncError};
pub use record::{Action, FileType, FstatRecord};
pub use sync::{Reconciler, SyncReport, SyncRequest};
