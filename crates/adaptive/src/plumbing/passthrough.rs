// Demuxer forwarding segment payload as a single elementary stream
use manifest::{StreamFormat, Tick};

use super::commands::{EsBlock, TrackFormat, TrackId};
use super::demuxer::{DemuxInput, DemuxStatus, Demuxer, DemuxerCapabilities};
use super::es_out::FakeEsOut;

/// Forwards bytes untouched, stamping each block with its position inside
/// the segment. Useful for remuxing to disk and as a stand-in where no
/// container parser is registered.
pub struct PassthroughDemuxer {
    format: StreamFormat,
    track_format: TrackFormat,
    track: Option<TrackId>,
    last_time: Tick,
}

impl PassthroughDemuxer {
    pub fn new(format: StreamFormat, mut track_format: TrackFormat) -> Self {
        track_format.format = format;
        Self {
            format,
            track_format,
            track: None,
            last_time: 0,
        }
    }

    fn block_time(input: &DemuxInput) -> Tick {
        match input.length {
            Some(len) if len > 0 => {
                let offset = input.offset.min(len);
                input.segment_time
                    + (input.segment_duration as i128 * offset as i128 / len as i128) as Tick
            }
            _ => input.segment_time,
        }
    }
}

impl Demuxer for PassthroughDemuxer {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn capabilities(&self) -> DemuxerCapabilities {
        if self.format.is_text() {
            DemuxerCapabilities {
                bitstream_switch_compatible: false,
                needs_restart_on_each_segment: true,
                ..Default::default()
            }
        } else {
            DemuxerCapabilities::default()
        }
    }

    fn demux(&mut self, input: DemuxInput, out: &mut FakeEsOut) -> DemuxStatus {
        if input.data.is_empty() {
            return DemuxStatus::Success;
        }
        let track = match self.track {
            Some(track) => track,
            None => {
                let track = out.create_track(self.track_format.clone());
                self.track = Some(track);
                track
            }
        };
        let time = Self::block_time(&input).max(self.last_time);
        self.last_time = time;
        if input.segment_start {
            out.set_pcr(time);
        }
        out.send(
            track,
            EsBlock {
                data: input.data,
                dts: time,
                pts: time,
                discontinuity: false,
            },
        );
        DemuxStatus::Success
    }

    fn segment_end(&mut self, end: Tick, out: &mut FakeEsOut) -> DemuxStatus {
        if self.track.is_some() {
            self.last_time = self.last_time.max(end);
            out.set_pcr(self.last_time);
        }
        DemuxStatus::Success
    }

    fn close(&mut self, out: &mut FakeEsOut) {
        if let Some(track) = self.track.take() {
            out.delete_track(track);
        }
    }
}
