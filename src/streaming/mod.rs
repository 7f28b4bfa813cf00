//! Record streaming.
//!
//! Stages exchange [`Entry`] values over bounded channels. Where records cross
//! a byte boundary (stdin/stdout, depot command output, cached entries) they
//! use the line codec.
//!
//! ```text
//! QUERY --> drop --checksum --> keep --case --> [batch --> dispatch]
//!       --> drop --checksum --> [batch --> dispatch --force]
//!       --> drop --checksum --> fail
//! ```

pub mod channel;
pub mod codec;
pub mod pipeline;

pub use channel::{
    batch_channel, entry_channel, Batch, BatchReceiver, BatchSender, Entry, EntryReceiver,
    EntrySender, Outcome, StageStats, BATCH_CHANNEL_SIZE, DEFAULT_BATCH_BYTES, DEFAULT_WORKERS,
    STAGE_CHANNEL_SIZE,
};
pub use codec::{decode_all, encode_all, read_into, write_from, RecordReader, RecordWriter};
pub use pipeline::{Pipeline, PipelineOptions, PipelineRun, StageReport};
