//! Plumbing between segment payload and the player's elementary stream
//! output: demuxers write into a [`FakeEsOut`], which queues timestamped
//! [`EsCommand`]s that are replayed against the real [`EsOutput`] as the
//! playback clock advances.

mod commands;
mod demuxer;
mod es_out;
pub(crate) mod id3;
mod passthrough;

pub use commands::{
    CommandsQueue, EsBlock, EsCommand, EsOutput, RecordingOutput, TrackFormat, TrackId,
};
pub use demuxer::{DemuxInput, DemuxStatus, Demuxer, DemuxerCapabilities, DemuxerFactory};
pub use es_out::{FakeEsOut, TimestampSync};
pub use passthrough::PassthroughDemuxer;
