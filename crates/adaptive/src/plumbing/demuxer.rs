// Demuxer abstraction and the registry that builds demuxers per stream format
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use manifest::{StreamFormat, Tick};
use strum::Display;

use super::commands::TrackFormat;
use super::es_out::FakeEsOut;
use super::passthrough::PassthroughDemuxer;
use crate::error::DemuxError;

/// How a demuxer behaves across segment boundaries and restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxerCapabilities {
    /// Output timestamps restart at zero with every instance.
    pub always_starts_from_zero: bool,
    /// A seek needs a fresh instance.
    pub needs_restart_on_seek: bool,
    /// Representations of the same format can be spliced without restart.
    pub bitstream_switch_compatible: bool,
    /// Every segment is a self contained file.
    pub needs_restart_on_each_segment: bool,
}

impl Default for DemuxerCapabilities {
    fn default() -> Self {
        Self {
            always_starts_from_zero: false,
            needs_restart_on_seek: true,
            bitstream_switch_compatible: true,
            needs_restart_on_each_segment: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DemuxStatus {
    Success,
    Eof,
    Error,
}

/// One block of segment payload handed to a demuxer.
#[derive(Debug, Clone)]
pub struct DemuxInput {
    pub data: Bytes,
    /// First block of a segment.
    pub segment_start: bool,
    pub segment_time: Tick,
    pub segment_duration: Tick,
    /// Byte offset of `data` within the segment.
    pub offset: u64,
    /// Segment size when announced by the server.
    pub length: Option<u64>,
}

pub trait Demuxer: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> DemuxerCapabilities {
        DemuxerCapabilities::default()
    }

    fn demux(&mut self, input: DemuxInput, out: &mut FakeEsOut) -> DemuxStatus;

    /// The current segment is complete and ends at `end`.
    fn segment_end(&mut self, _end: Tick, _out: &mut FakeEsOut) -> DemuxStatus {
        DemuxStatus::Success
    }

    /// Flush internal state, no more data follows for now.
    fn drain(&mut self, _out: &mut FakeEsOut) {}

    fn close(&mut self, _out: &mut FakeEsOut) {}
}

type DemuxerCtor = Arc<dyn Fn(&TrackFormat) -> Box<dyn Demuxer> + Send + Sync>;

/// Demuxer constructors keyed by stream format name.
#[derive(Clone, Default)]
pub struct DemuxerFactory {
    constructors: HashMap<String, DemuxerCtor>,
}

impl fmt::Debug for DemuxerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("DemuxerFactory").field("formats", &names).finish()
    }
}

const PASSTHROUGH_FORMATS: [StreamFormat; 9] = [
    StreamFormat::Unknown,
    StreamFormat::MpegTs,
    StreamFormat::Mp4,
    StreamFormat::PackedAac,
    StreamFormat::PackedMp3,
    StreamFormat::PackedAc3,
    StreamFormat::WebVtt,
    StreamFormat::Ttml,
    StreamFormat::Ogg,
];

impl DemuxerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every known format forwarded as a single opaque track.
    pub fn with_passthrough() -> Self {
        let mut factory = Self::new();
        for format in PASSTHROUGH_FORMATS {
            factory.register(format.to_string(), move |track: &TrackFormat| {
                Box::new(PassthroughDemuxer::new(format, track.clone())) as Box<dyn Demuxer>
            });
        }
        factory
    }

    pub fn register<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&TrackFormat) -> Box<dyn Demuxer> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(ctor));
    }

    pub fn supports(&self, format: StreamFormat) -> bool {
        self.constructors.contains_key(&format.to_string())
    }

    pub fn create(
        &self,
        format: StreamFormat,
        track: &TrackFormat,
    ) -> Result<Box<dyn Demuxer>, DemuxError> {
        let name = format.to_string();
        let ctor = self
            .constructors
            .get(&name)
            .ok_or(DemuxError::NoDemuxer { format: name })?;
        Ok(ctor(track))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl Demuxer for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        fn demux(&mut self, _input: DemuxInput, _out: &mut FakeEsOut) -> DemuxStatus {
            DemuxStatus::Success
        }
    }

    #[test]
    fn passthrough_covers_known_formats() {
        let factory = DemuxerFactory::with_passthrough();
        assert!(factory.supports(StreamFormat::MpegTs));
        assert!(factory.supports(StreamFormat::Mp4));
        assert!(factory.supports(StreamFormat::Unknown));
        assert!(!factory.supports(StreamFormat::Unsupported));
        assert!(matches!(
            factory.create(StreamFormat::Unsupported, &TrackFormat::default()),
            Err(DemuxError::NoDemuxer { .. })
        ));
    }

    #[test]
    fn registered_constructor_replaces_default() {
        let mut factory = DemuxerFactory::with_passthrough();
        factory.register("ts", |_: &TrackFormat| Box::new(Silent) as Box<dyn Demuxer>);
        let demuxer = factory
            .create(StreamFormat::MpegTs, &TrackFormat::default())
            .unwrap();
        assert_eq!(demuxer.name(), "silent");
        assert_eq!(demuxer.capabilities(), DemuxerCapabilities::default());
        assert_eq!(DemuxStatus::Eof.to_string(), "eof");
    }
}
