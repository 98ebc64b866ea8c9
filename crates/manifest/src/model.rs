// Manifest data model: periods, adaptation sets, representations and segments
use std::fmt;

use strum::{Display, EnumString};

use crate::format::{ContentType, StreamFormat};
use crate::time::{Tick, Timescale};

/// Opaque identifier correlating objects across manifest reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ID(String);

impl ID {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ID {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ID {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Protocol the manifest was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ManifestKind {
    #[default]
    Hls,
    Dash,
    Smooth,
}

/// Role of an adaptation set within its period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    #[default]
    Main,
    Alternate,
    Supplementary,
    Commentary,
    Dub,
    Caption,
    Subtitle,
}

impl Role {
    /// Roles a player should select by default.
    pub fn is_default(&self) -> bool {
        matches!(self, Role::Main)
    }

    /// Priority used when several sets compete for the same output slot.
    pub fn priority(&self) -> u8 {
        match self {
            Role::Main => 0,
            Role::Dub | Role::Alternate => 1,
            Role::Commentary | Role::Caption | Role::Subtitle => 2,
            Role::Supplementary => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum EncryptionMethod {
    #[default]
    None,
    #[strum(serialize = "AES-128")]
    Aes128,
    #[strum(serialize = "SAMPLE-AES")]
    SampleAes,
    #[strum(serialize = "cenc")]
    Cenc,
}

/// Encryption descriptor attached to segments or representations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommonEncryption {
    pub method: EncryptionMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
}

impl CommonEncryption {
    pub fn aes128(uri: impl Into<String>, iv: Option<[u8; 16]>) -> Self {
        Self {
            method: EncryptionMethod::Aes128,
            uri: Some(uri.into()),
            iv,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.method != EncryptionMethod::None
    }

    /// Fills fields missing here from an enclosing descriptor.
    pub fn merged_with(&self, parent: Option<&CommonEncryption>) -> CommonEncryption {
        let Some(parent) = parent else {
            return self.clone();
        };
        CommonEncryption {
            method: if self.method == EncryptionMethod::None {
                parent.method
            } else {
                self.method
            },
            uri: self.uri.clone().or_else(|| parent.uri.clone()),
            iv: self.iv.or(parent.iv),
        }
    }

    /// HLS rule: without an explicit IV the media sequence number is the IV.
    pub fn iv_for_sequence(&self, sequence: u64) -> [u8; 16] {
        self.iv.unwrap_or_else(|| {
            let mut iv = [0u8; 16];
            iv[8..].copy_from_slice(&sequence.to_be_bytes());
            iv
        })
    }
}

/// Inclusive byte range inside a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// `length` bytes from `offset`. Zero-length ranges are meaningless.
    pub fn from_length(offset: u64, length: u64) -> Option<Self> {
        (length > 0).then(|| Self::new(offset, offset + length - 1))
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Range resumed after `received` bytes have already been delivered.
    pub fn advanced(&self, received: u64) -> Option<Self> {
        let start = self.start + received;
        (start <= self.end).then(|| Self::new(start, self.end))
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Parses `start-end` as used by DASH `mediaRange`/`range`.
    pub fn parse_dash(value: &str) -> Option<Self> {
        let (start, end) = value.trim().split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        (end >= start).then(|| Self::new(start, end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegment {
    pub url: String,
    pub byte_range: Option<ByteRange>,
    pub encryption: Option<CommonEncryption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u64,
    pub url: String,
    pub byte_range: Option<ByteRange>,
    /// Start in the owning representation's timescale.
    pub start_time: u64,
    pub duration: u64,
    pub discontinuity: bool,
    /// Wall clock of the segment start, from a program date-time anchor.
    pub display_time: Option<Tick>,
    pub encryption: Option<CommonEncryption>,
}

impl Segment {
    pub fn new(sequence: u64, url: impl Into<String>, start_time: u64, duration: u64) -> Self {
        Self {
            sequence,
            url: url.into(),
            byte_range: None,
            start_time,
            duration,
            discontinuity: false,
            display_time: None,
            encryption: None,
        }
    }

    pub fn end_time(&self) -> u64 {
        self.start_time + self.duration
    }
}

/// One concrete encoded rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: ID,
    pub bandwidth: u64,
    pub codecs: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub format: StreamFormat,
    /// Media playlist location for protocols that load representations lazily.
    pub playlist_url: Option<String>,
    pub timescale: Timescale,
    pub segments: Vec<Segment>,
    pub init: Option<InitSegment>,
    pub live: bool,
    /// False until the media playlist of a lazily loaded representation is fetched.
    pub loaded: bool,
    pub target_duration: Option<Tick>,
    pub revision: u64,
    pub encryption: Option<CommonEncryption>,
    /// Sequence numbers denote the same media position across sibling
    /// representations (HLS). Otherwise positions are matched by time.
    pub sequence_aligned: bool,
}

impl Representation {
    pub fn new(id: impl Into<ID>) -> Self {
        Self {
            id: id.into(),
            bandwidth: 0,
            codecs: Vec::new(),
            width: None,
            height: None,
            frame_rate: None,
            format: StreamFormat::Unknown,
            playlist_url: None,
            timescale: Timescale::TICKS,
            segments: Vec::new(),
            init: None,
            live: false,
            loaded: true,
            target_duration: None,
            revision: 0,
            encryption: None,
            sequence_aligned: false,
        }
    }

    pub fn time_of(&self, segment: &Segment) -> Tick {
        self.timescale.to_time(segment.start_time)
    }

    pub fn duration_of(&self, segment: &Segment) -> Tick {
        self.timescale.to_time(segment.duration)
    }

    pub fn end_time_of(&self, segment: &Segment) -> Tick {
        self.timescale.to_time(segment.end_time())
    }

    pub fn segment(&self, sequence: u64) -> Option<&Segment> {
        self.segments
            .binary_search_by_key(&sequence, |s| s.sequence)
            .ok()
            .map(|idx| &self.segments[idx])
    }

    /// First segment whose sequence is `>= sequence`.
    pub fn next_segment(&self, sequence: u64) -> Option<&Segment> {
        let idx = self.segments.partition_point(|s| s.sequence < sequence);
        self.segments.get(idx)
    }

    /// Segment covering `time`. Times before the window map to its first
    /// segment; times past the end map to nothing.
    pub fn segment_at(&self, time: Tick) -> Option<&Segment> {
        let first = self.segments.first()?;
        if time < self.time_of(first) {
            return Some(first);
        }
        let scaled = self.timescale.to_scaled(time);
        let idx = self.segments.partition_point(|s| s.start_time <= scaled);
        let candidate = &self.segments[idx.saturating_sub(1)];
        (scaled < candidate.end_time()).then_some(candidate)
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.segments.first().map(|s| s.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.last().map(|s| s.sequence)
    }

    pub fn start_time(&self) -> Tick {
        self.segments
            .first()
            .map(|s| self.time_of(s))
            .unwrap_or_default()
    }

    pub fn end_time(&self) -> Tick {
        self.segments
            .last()
            .map(|s| self.end_time_of(s))
            .unwrap_or_default()
    }

    pub fn total_duration(&self) -> Tick {
        self.end_time() - self.start_time()
    }

    /// Media time available after the segment `sequence`.
    pub fn ahead_of(&self, sequence: u64) -> Tick {
        let idx = self.segments.partition_point(|s| s.sequence <= sequence);
        let scaled: u64 = self.segments[idx..].iter().map(|s| s.duration).sum();
        self.timescale.to_time(scaled)
    }

    /// Drops history before `sequence`.
    pub fn prune_by_sequence(&mut self, sequence: u64) -> usize {
        let idx = self.segments.partition_point(|s| s.sequence < sequence);
        self.segments.drain(..idx).count()
    }

    /// Finds the position in `self` matching segment `sequence` of a
    /// sibling representation.
    pub fn translate_sequence(&self, from: &Representation, sequence: u64) -> Option<u64> {
        if self.sequence_aligned && from.sequence_aligned {
            return self.next_segment(sequence).map(|s| s.sequence);
        }
        let time = from
            .segment(sequence)
            .map(|s| from.time_of(s))
            .unwrap_or_else(|| from.end_time());
        self.segment_at(time).map(|s| s.sequence)
    }

    pub fn needs_loading(&self) -> bool {
        !self.loaded && self.playlist_url.is_some()
    }

    /// Encryption for a segment, inheriting representation defaults.
    pub fn encryption_for(&self, segment: &Segment) -> Option<CommonEncryption> {
        match (&segment.encryption, &self.encryption) {
            (Some(own), parent) => Some(own.merged_with(parent.as_ref())),
            (None, Some(parent)) => Some(parent.clone()),
            (None, None) => None,
        }
        .filter(CommonEncryption::is_encrypted)
    }
}

/// Interchangeable representations of the same content.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    pub id: ID,
    pub content_type: ContentType,
    pub lang: Option<String>,
    pub role: Role,
    pub description: Option<String>,
    pub segment_aligned: bool,
    pub bitswitchable: bool,
    /// False for renditions of a type the client cannot play.
    pub supported: bool,
    /// Sorted by ascending bandwidth.
    pub representations: Vec<Representation>,
}

impl AdaptationSet {
    pub fn new(id: impl Into<ID>) -> Self {
        Self {
            id: id.into(),
            content_type: ContentType::Unknown,
            lang: None,
            role: Role::Main,
            description: None,
            segment_aligned: true,
            bitswitchable: true,
            supported: true,
            representations: Vec::new(),
        }
    }

    /// Keeps only the primary language subtag (`en-US` -> `en`).
    pub fn set_lang(&mut self, lang: &str) {
        let lang = lang.trim();
        if lang.is_empty() {
            return;
        }
        let primary = match lang.find('-') {
            Some(pos) if lang.len() >= 4 => &lang[..pos],
            _ => lang,
        };
        self.lang = Some(primary.to_string());
    }

    pub fn add_representation(&mut self, rep: Representation) {
        let idx = self
            .representations
            .partition_point(|r| r.bandwidth <= rep.bandwidth);
        self.representations.insert(idx, rep);
    }

    pub fn representation(&self, id: &ID) -> Option<&Representation> {
        self.representations.iter().find(|r| &r.id == id)
    }

    pub fn representation_mut(&mut self, id: &ID) -> Option<&mut Representation> {
        self.representations.iter_mut().find(|r| &r.id == id)
    }

    pub fn format(&self) -> StreamFormat {
        self.representations
            .first()
            .map(|r| r.format)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub id: ID,
    pub start: Tick,
    pub duration: Option<Tick>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

impl Period {
    pub fn new(id: impl Into<ID>) -> Self {
        Self {
            id: id.into(),
            start: 0,
            duration: None,
            adaptation_sets: Vec::new(),
        }
    }

    pub fn adaptation_set(&self, id: &ID) -> Option<&AdaptationSet> {
        self.adaptation_sets.iter().find(|s| &s.id == id)
    }

    pub fn representations(&self) -> impl Iterator<Item = &Representation> {
        self.adaptation_sets
            .iter()
            .flat_map(|s| s.representations.iter())
    }
}

/// Root of a playback session.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub kind: ManifestKind,
    /// Location the document was fetched from; relative references resolve against it.
    pub url: String,
    pub periods: Vec<Period>,
    pub live: bool,
    /// Zero for live presentations.
    pub duration: Tick,
    pub min_update_period: Option<Tick>,
    pub min_buffering: Option<Tick>,
    pub max_buffering: Option<Tick>,
    pub time_shift_buffer_depth: Option<Tick>,
    pub suggested_presentation_delay: Option<Tick>,
    /// Negative offsets are relative to the end of the presentation.
    pub presentation_start_offset: Option<Tick>,
    pub availability_start_time: Option<Tick>,
    pub session_keys: Vec<CommonEncryption>,
}

impl Manifest {
    pub fn new(kind: ManifestKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            periods: Vec::new(),
            live: false,
            duration: 0,
            min_update_period: None,
            min_buffering: None,
            max_buffering: None,
            time_shift_buffer_depth: None,
            suggested_presentation_delay: None,
            presentation_start_offset: None,
            availability_start_time: None,
            session_keys: Vec::new(),
        }
    }

    pub fn first_period(&self) -> Option<&Period> {
        self.periods.first()
    }

    pub fn period(&self, id: &ID) -> Option<&Period> {
        self.periods.iter().find(|p| &p.id == id)
    }

    pub fn next_period(&self, id: &ID) -> Option<&Period> {
        let idx = self.periods.iter().position(|p| &p.id == id)?;
        self.periods.get(idx + 1)
    }

    /// Period playing at `time`: the last one starting at or before it.
    pub fn period_at(&self, time: Tick) -> Option<&Period> {
        self.periods.iter().rev().find(|p| p.start <= time)
    }

    pub fn representations(&self) -> impl Iterator<Item = &Representation> {
        self.periods.iter().flat_map(|p| p.representations())
    }

    pub fn representation(&self, id: &ID) -> Option<&Representation> {
        self.representations().find(|r| &r.id == id)
    }

    pub fn representation_mut(&mut self, id: &ID) -> Option<&mut Representation> {
        self.periods
            .iter_mut()
            .flat_map(|p| p.adaptation_sets.iter_mut())
            .flat_map(|s| s.representations.iter_mut())
            .find(|r| &r.id == id)
    }

    pub fn adaptation_set_of(&self, rep: &ID) -> Option<&AdaptationSet> {
        self.periods
            .iter()
            .flat_map(|p| p.adaptation_sets.iter())
            .find(|s| s.representation(rep).is_some())
    }

    /// Recomputes the VOD duration from loaded representations.
    pub fn refresh_duration(&mut self) {
        if self.live {
            self.duration = 0;
            return;
        }
        let from_periods: Tick = self.periods.iter().filter_map(|p| p.duration).sum();
        if from_periods > 0 {
            self.duration = from_periods;
            return;
        }
        let from_reps = self
            .periods
            .iter()
            .map(|p| {
                p.representations()
                    .filter(|r| r.loaded)
                    .map(Representation::total_duration)
                    .max()
                    .unwrap_or_default()
            })
            .sum::<Tick>();
        if from_reps > 0 {
            self.duration = from_reps;
        }
    }
}
