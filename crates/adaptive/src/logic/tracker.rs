// Segment tracker: hands out the chunks of one adaptation set in order
use std::sync::Arc;
use std::time::Duration;

use manifest::{
    AdaptationSet, ByteRange, CommonEncryption, ID, Manifest, Representation, StreamFormat, Tick,
};
use tracing::{debug, trace};

use super::SharedLogic;
use super::buffering::BufferingLogic;
use crate::error::AdaptiveError;
use crate::events::TrackerEvent;
use crate::http::{ChunkType, RateObserver};

/// Everything needed to fetch and interpret one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRequest {
    pub set: ID,
    pub representation: ID,
    pub chunk_type: ChunkType,
    /// `None` for initialization chunks.
    pub sequence: Option<u64>,
    pub url: String,
    pub byte_range: Option<ByteRange>,
    pub start_time: Tick,
    pub duration: Tick,
    pub discontinuity: bool,
    pub display_time: Option<Tick>,
    pub encryption: Option<CommonEncryption>,
    pub format: StreamFormat,
    pub codecs: Vec<String>,
}

impl ChunkRequest {
    pub fn is_init(&self) -> bool {
        self.chunk_type == ChunkType::Init
    }

    pub fn end_time(&self) -> Tick {
        self.start_time + self.duration
    }

    /// IV for AES-128 decryption of this chunk.
    pub fn iv(&self) -> Option<[u8; 16]> {
        self.encryption
            .as_ref()
            .map(|e| e.iv_for_sequence(self.sequence.unwrap_or_default()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextChunk {
    Chunk(Box<ChunkRequest>),
    /// Nothing available yet: a live window has not grown or the
    /// representation still needs its playlist.
    WouldBlock,
    Eof,
}

/// Tracks the position of one adaptation set and switches representations
/// at segment boundaries.
pub struct SegmentTracker {
    set: ID,
    period: Option<ID>,
    logic: Arc<SharedLogic>,
    buffering: BufferingLogic,
    current: Option<ID>,
    next_sequence: Option<u64>,
    last_sequence: Option<u64>,
    init_sent: bool,
    last_end: Option<Tick>,
    format: StreamFormat,
    enabled: bool,
    pending_discontinuity: bool,
    events: Vec<TrackerEvent>,
}

/// The adaptation set `id` of `period`, or of the first period that has one.
pub(crate) fn find_set<'m>(
    manifest: &'m Manifest,
    period: Option<&ID>,
    id: &ID,
) -> Option<&'m AdaptationSet> {
    match period {
        Some(period) => manifest.period(period)?.adaptation_set(id),
        None => manifest.periods.iter().find_map(|p| p.adaptation_set(id)),
    }
}

impl SegmentTracker {
    pub fn new(set: ID, logic: Arc<SharedLogic>, buffering: BufferingLogic) -> Self {
        Self {
            set,
            period: None,
            logic,
            buffering,
            current: None,
            next_sequence: None,
            last_sequence: None,
            init_sent: false,
            last_end: None,
            format: StreamFormat::Unknown,
            enabled: false,
            pending_discontinuity: false,
            events: Vec::new(),
        }
    }

    /// Restricts the tracker to the adaptation set of one period.
    pub fn with_period(mut self, period: ID) -> Self {
        self.period = Some(period);
        self
    }

    pub fn set_id(&self) -> &ID {
        &self.set
    }

    pub fn period(&self) -> Option<&ID> {
        self.period.as_ref()
    }

    fn find_set<'m>(&self, manifest: &'m Manifest) -> Option<&'m AdaptationSet> {
        find_set(manifest, self.period.as_ref(), &self.set)
    }

    pub fn current_representation(&self) -> Option<&ID> {
        self.current.as_ref()
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn emit(&mut self, event: TrackerEvent) {
        self.logic.tracker_event(&event);
        self.events.push(event);
    }

    /// Events emitted since the last call.
    pub fn take_events(&mut self) -> Vec<TrackerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.emit(TrackerEvent::BufferingStateUpdate {
            set: self.set.clone(),
            enabled,
        });
    }

    pub fn update_buffering_level(
        &mut self,
        minimum: Tick,
        maximum: Tick,
        current: Tick,
        target: Tick,
    ) {
        self.emit(TrackerEvent::BufferingLevelChange {
            set: self.set.clone(),
            minimum,
            maximum,
            current,
            target,
        });
    }

    /// Stops selecting `rep`; the next boundary picks another one.
    pub fn exclude(&mut self, rep: &ID) {
        self.logic.exclude(rep.clone());
    }

    /// Marks the next chunk as discontinuous, e.g. after a skipped segment.
    pub fn mark_discontinuity(&mut self) {
        self.pending_discontinuity = true;
    }

    /// Feeds a rate sample to the logic and returns the representation it
    /// would switch to, if different from the current one.
    pub fn notify_bandwidth(
        &mut self,
        manifest: &Manifest,
        bytes: u64,
        elapsed: Duration,
    ) -> Option<ID> {
        self.logic
            .update_download_rate(&self.set, bytes, elapsed, Duration::ZERO);
        let set = self.find_set(manifest)?;
        let current = self.current.as_ref().and_then(|id| set.representation(id));
        let wanted = self.logic.next_representation(set, current)?;
        (Some(&wanted) != self.current.as_ref()).then_some(wanted)
    }

    fn switch_to(&mut self, set: &AdaptationSet, wanted: &Representation) {
        let prev = self.current.as_ref().and_then(|id| set.representation(id));
        if let (Some(prev), Some(seq)) = (prev, self.next_sequence) {
            self.next_sequence = Some(wanted.translate_sequence(prev, seq).unwrap_or(seq));
        }
        debug!(
            set = %self.set,
            from = ?prev.map(|r| &r.id),
            to = %wanted.id,
            bandwidth = wanted.bandwidth,
            "Representation switch"
        );
        let event = TrackerEvent::RepresentationSwitch {
            set: self.set.clone(),
            prev: prev.map(|r| (r.id.clone(), r.bandwidth)),
            next: Some((wanted.id.clone(), wanted.bandwidth)),
        };
        self.current = Some(wanted.id.clone());
        self.init_sent = false;
        self.emit(event);
        if wanted.format != self.format {
            self.format = wanted.format;
            self.emit(TrackerEvent::FormatChange {
                set: self.set.clone(),
                format: wanted.format,
            });
        }
    }

    /// Next chunk of the set. Representation changes only happen here,
    /// between two chunks.
    pub fn next_chunk(&mut self, manifest: &Manifest) -> Result<NextChunk, AdaptiveError> {
        let Some(set) = self.find_set(manifest) else {
            return Ok(NextChunk::Eof);
        };

        if self.current.is_none() || self.init_sent {
            let current = self.current.as_ref().and_then(|id| set.representation(id));
            let wanted = self
                .logic
                .next_representation(set, current)
                .and_then(|id| set.representation(&id))
                .ok_or_else(|| AdaptiveError::NoUsableRepresentation {
                    set: self.set.clone(),
                })?;
            if Some(&wanted.id) != self.current.as_ref() {
                self.switch_to(set, wanted);
            }
        }

        let Some(rep) = self.current.as_ref().and_then(|id| set.representation(id)) else {
            return Err(AdaptiveError::NoUsableRepresentation {
                set: self.set.clone(),
            });
        };
        if rep.needs_loading() {
            trace!(representation = %rep.id, "Waiting for media playlist");
            return Ok(NextChunk::WouldBlock);
        }
        let live = manifest.live || rep.live;

        if self.next_sequence.is_none() {
            self.next_sequence = self.buffering.start_sequence(manifest, rep);
            if self.next_sequence.is_none() {
                return Ok(if live { NextChunk::WouldBlock } else { NextChunk::Eof });
            }
        }

        if !self.init_sent {
            self.init_sent = true;
            if let Some(init) = &rep.init {
                return Ok(NextChunk::Chunk(Box::new(ChunkRequest {
                    set: self.set.clone(),
                    representation: rep.id.clone(),
                    chunk_type: ChunkType::Init,
                    sequence: None,
                    url: init.url.clone(),
                    byte_range: init.byte_range,
                    start_time: self.last_end.unwrap_or_else(|| rep.start_time()),
                    duration: 0,
                    discontinuity: false,
                    display_time: None,
                    encryption: init
                        .encryption
                        .clone()
                        .or_else(|| rep.encryption.clone())
                        .filter(CommonEncryption::is_encrypted),
                    format: rep.format,
                    codecs: rep.codecs.clone(),
                })));
            }
        }

        let mut wanted = self.next_sequence.unwrap_or_default();
        loop {
            let Some(segment) = rep.next_segment(wanted) else {
                return Ok(if live { NextChunk::WouldBlock } else { NextChunk::Eof });
            };
            let start = rep.time_of(segment);
            let end = rep.end_time_of(segment);
            if self.last_end.is_some_and(|last| end <= last) {
                trace!(sequence = segment.sequence, "Skipping segment behind playback position");
                wanted = segment.sequence + 1;
                self.next_sequence = Some(wanted);
                continue;
            }

            let skipped = segment.sequence > wanted;
            let pending = std::mem::take(&mut self.pending_discontinuity);
            let discontinuity = segment.discontinuity || pending || (skipped && live);
            let request = ChunkRequest {
                set: self.set.clone(),
                representation: rep.id.clone(),
                chunk_type: ChunkType::Segment,
                sequence: Some(segment.sequence),
                url: segment.url.clone(),
                byte_range: segment.byte_range,
                start_time: start,
                duration: end - start,
                discontinuity,
                display_time: segment.display_time,
                encryption: rep.encryption_for(segment),
                format: rep.format,
                codecs: rep.codecs.clone(),
            };

            self.next_sequence = Some(segment.sequence + 1);
            self.last_sequence = Some(segment.sequence);
            self.last_end = Some(end);
            if discontinuity {
                self.emit(TrackerEvent::Discontinuity {
                    set: self.set.clone(),
                    sequence: segment.sequence,
                });
            }
            self.emit(TrackerEvent::SegmentChange {
                set: self.set.clone(),
                sequence: segment.sequence,
                duration: end - start,
            });
            return Ok(NextChunk::Chunk(Box::new(request)));
        }
    }

    /// Moves to the segment covering `time`. The demuxer restarts, so the
    /// initialization chunk is sent again.
    pub fn set_position(&mut self, manifest: &Manifest, time: Tick) -> bool {
        let Some(set) = self.find_set(manifest) else {
            return false;
        };
        let rep = match self.current.as_ref().and_then(|id| set.representation(id)) {
            Some(rep) => rep,
            None => match self
                .logic
                .next_representation(set, None)
                .and_then(|id| set.representation(&id))
            {
                Some(rep) => {
                    self.switch_to(set, rep);
                    rep
                }
                None => return false,
            },
        };
        let Some(segment) = rep.segment_at(time) else {
            return false;
        };
        self.next_sequence = Some(segment.sequence);
        self.init_sent = false;
        self.last_end = None;
        self.emit(TrackerEvent::PositionChange {
            set: self.set.clone(),
            time,
        });
        true
    }

    /// Forgets the position so that the next chunk is chosen like at start.
    pub fn reset_position(&mut self) {
        self.next_sequence = None;
        self.last_sequence = None;
        self.last_end = None;
        self.init_sent = false;
    }

    /// Start of the next segment to fetch.
    pub fn playback_time(&self, manifest: &Manifest) -> Option<Tick> {
        let rep = manifest.representation(self.current.as_ref()?)?;
        match self.next_sequence.and_then(|seq| rep.next_segment(seq)) {
            Some(seg) => Some(rep.time_of(seg)),
            None => self.last_end,
        }
    }

    /// Media time left in the current representation after the last
    /// fetched segment.
    pub fn min_ahead(&self, manifest: &Manifest) -> Tick {
        let Some(rep) = self.current.as_ref().and_then(|id| manifest.representation(id)) else {
            return 0;
        };
        match self.last_sequence {
            Some(seq) => rep.ahead_of(seq),
            None => rep.total_duration(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferingConfig, LogicConfig};
    use crate::logic::{HighestLogic, LowestLogic, RepresentationSelector};
    use manifest::{CLOCK_FREQ, InitSegment, ManifestKind, Period, Segment};

    const SIX: u64 = 6 * CLOCK_FREQ as u64;

    fn rep(id: &str, bandwidth: u64, first: u64, count: u64) -> Representation {
        let mut rep = Representation::new(id);
        rep.bandwidth = bandwidth;
        rep.sequence_aligned = true;
        rep.segments = (first..first + count)
            .map(|i| Segment::new(i, format!("http://h/{id}/{i}.ts"), i * SIX, SIX))
            .collect();
        rep
    }

    fn manifest(reps: Vec<Representation>, live: bool) -> Manifest {
        let mut set = AdaptationSet::new("video");
        for mut r in reps {
            r.live = live;
            set.add_representation(r);
        }
        let mut period = Period::new("0");
        period.adaptation_sets.push(set);
        let mut manifest = Manifest::new(ManifestKind::Hls, "http://h/master.m3u8");
        manifest.live = live;
        manifest.periods.push(period);
        manifest
    }

    fn tracker(logic: SharedLogic) -> SegmentTracker {
        SegmentTracker::new(
            ID::new("video"),
            Arc::new(logic),
            BufferingLogic::new(&BufferingConfig::default()),
        )
    }

    fn lowest() -> SharedLogic {
        SharedLogic::new(Box::new(LowestLogic::new(RepresentationSelector::default())))
    }

    fn expect_chunk(next: NextChunk) -> ChunkRequest {
        match next {
            NextChunk::Chunk(req) => *req,
            other => panic!("expected a chunk, got {other:?}"),
        }
    }

    #[test]
    fn vod_sequences_increase_until_eof() {
        let manifest = manifest(vec![rep("a", 100, 0, 5)], false);
        let mut tracker = tracker(lowest());
        let mut seen = Vec::new();
        loop {
            match tracker.next_chunk(&manifest).unwrap() {
                NextChunk::Chunk(req) => seen.push(req.sequence.unwrap()),
                NextChunk::Eof => break,
                NextChunk::WouldBlock => panic!("vod never blocks"),
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(tracker.next_chunk(&manifest).unwrap(), NextChunk::Eof);
    }

    #[test]
    fn init_is_sent_once_per_representation() {
        let mut r = rep("a", 100, 0, 3);
        r.init = Some(InitSegment {
            url: "http://h/a/init.mp4".into(),
            byte_range: None,
            encryption: None,
        });
        let manifest = manifest(vec![r], false);
        let mut tracker = tracker(lowest());
        let first = expect_chunk(tracker.next_chunk(&manifest).unwrap());
        assert!(first.is_init());
        let kinds: Vec<_> = (0..3)
            .map(|_| expect_chunk(tracker.next_chunk(&manifest).unwrap()).is_init())
            .collect();
        assert_eq!(kinds, vec![false, false, false]);
    }

    #[test]
    fn live_window_never_moves_backwards() {
        let mut window = manifest(vec![rep("a", 100, 10, 4)], true);
        let mut tracker = tracker(lowest());
        let mut last_end = 0;
        let mut ends = Vec::new();
        for _ in 0..3 {
            match tracker.next_chunk(&window).unwrap() {
                NextChunk::Chunk(req) => {
                    assert!(req.end_time() > last_end);
                    last_end = req.end_time();
                    ends.push(last_end);
                }
                NextChunk::WouldBlock => break,
                NextChunk::Eof => panic!("live never ends"),
            }
        }
        assert!(!ends.is_empty());

        // the refreshed window restamps its segments a little earlier
        let mut shifted = rep("a", 100, 12, 6);
        for seg in &mut shifted.segments {
            seg.start_time -= SIX / 2;
        }
        window = manifest(vec![shifted], true);
        while let NextChunk::Chunk(req) = tracker.next_chunk(&window).unwrap() {
            assert!(req.end_time() > last_end);
            last_end = req.end_time();
        }
    }

    #[test]
    fn switching_translates_by_time() {
        let manifest = manifest(vec![rep("low", 100, 0, 5), rep("high", 900, 0, 5)], false);
        let logic = Arc::new(lowest());
        let mut tracker = SegmentTracker::new(
            ID::new("video"),
            logic,
            BufferingLogic::new(&BufferingConfig::default()),
        );
        let a = expect_chunk(tracker.next_chunk(&manifest).unwrap());
        let b = expect_chunk(tracker.next_chunk(&manifest).unwrap());
        assert_eq!((a.representation.as_str(), a.sequence), ("low", Some(0)));
        assert_eq!(b.sequence, Some(1));

        // switch logic mid stream
        tracker.logic = Arc::new(SharedLogic::new(Box::new(HighestLogic::new(
            RepresentationSelector::default(),
        ))));
        let c = expect_chunk(tracker.next_chunk(&manifest).unwrap());
        assert_eq!((c.representation.as_str(), c.sequence), ("high", Some(2)));
        assert_eq!(c.start_time, b.end_time());

        let events = tracker.take_events();
        let switches = events
            .iter()
            .filter(|e| matches!(e, TrackerEvent::RepresentationSwitch { .. }))
            .count();
        assert_eq!(switches, 2);
    }

    #[test]
    fn unloaded_representation_blocks() {
        let mut r = rep("a", 100, 0, 0);
        r.loaded = false;
        r.playlist_url = Some("http://h/a.m3u8".into());
        let manifest = manifest(vec![r], false);
        let mut tracker = tracker(lowest());
        assert_eq!(tracker.next_chunk(&manifest).unwrap(), NextChunk::WouldBlock);
        assert_eq!(tracker.current_representation(), Some(&ID::new("a")));
    }

    #[test]
    fn seek_restarts_at_covering_segment() {
        let manifest = manifest(vec![rep("a", 100, 0, 5)], false);
        let mut tracker = tracker(lowest());
        expect_chunk(tracker.next_chunk(&manifest).unwrap());
        assert!(tracker.set_position(&manifest, 13 * CLOCK_FREQ));
        let req = expect_chunk(tracker.next_chunk(&manifest).unwrap());
        assert_eq!(req.sequence, Some(2));
        assert!(!tracker.set_position(&manifest, 60 * CLOCK_FREQ));
    }

    #[test]
    fn marked_discontinuity_is_consumed_once() {
        let mut r = rep("a", 100, 0, 3);
        r.segments[0].discontinuity = true;
        let manifest = manifest(vec![r], false);
        let mut tracker = tracker(lowest());
        tracker.mark_discontinuity();
        let flags: Vec<bool> = (0..3)
            .map(|_| expect_chunk(tracker.next_chunk(&manifest).unwrap()).discontinuity)
            .collect();
        assert_eq!(flags, vec![true, false, false]);
    }

    #[test]
    fn period_scoped_tracker_ignores_other_periods() {
        let mut manifest = manifest(vec![rep("a", 100, 0, 2)], false);
        let mut second = Period::new("1");
        let mut set = AdaptationSet::new("video");
        set.add_representation(rep("b", 100, 2, 2));
        second.adaptation_sets.push(set);
        manifest.periods.push(second);

        let mut tracker = tracker(lowest()).with_period(ID::new("1"));
        let req = expect_chunk(tracker.next_chunk(&manifest).unwrap());
        assert_eq!((req.representation.as_str(), req.sequence), ("b", Some(2)));
    }

    #[test]
    fn excluding_every_representation_is_an_error() {
        let manifest = manifest(vec![rep("a", 100, 0, 2)], false);
        let mut tracker = tracker(SharedLogic::from_config(&LogicConfig::default()));
        tracker.exclude(&ID::new("a"));
        assert!(matches!(
            tracker.next_chunk(&manifest),
            Err(AdaptiveError::NoUsableRepresentation { .. })
        ));
    }
}
