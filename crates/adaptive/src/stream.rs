// Stream pipeline: fetches the chunks of one adaptation set and feeds its demuxer
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use bytes::{Bytes, BytesMut};
use manifest::{AdaptationSet, ContentType, ID, Manifest, ManifestKind, StreamFormat, Tick};
use strum::Display;
use tracing::{debug, info, trace, warn};

use crate::encryption::{KeyMaterial, Keyring, decrypt_aes128, key_uri};
use crate::error::{AdaptiveError, DemuxError, EncryptionError, TransportError};
use crate::events::{ManagerEvent, TrackerEvent};
use crate::http::{Block, ChunkSource, ChunkType, ConnectionManager};
use crate::logic::{BufferingLogic, ChunkRequest, NextChunk, SegmentTracker};
use crate::metrics::PerformanceMetrics;
use crate::plumbing::id3::{self, Id3Header};
use crate::plumbing::{
    DemuxInput, DemuxStatus, Demuxer, DemuxerCapabilities, DemuxerFactory, EsOutput, FakeEsOut,
    TrackFormat,
};

/// Per protocol behaviour, picked once when the pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StreamFlavor {
    Hls,
    Smooth,
    Generic,
}

impl StreamFlavor {
    pub fn for_kind(kind: ManifestKind) -> Self {
        match kind {
            ManifestKind::Hls => Self::Hls,
            ManifestKind::Smooth => Self::Smooth,
            ManifestKind::Dash => Self::Generic,
        }
    }

    pub fn accepts(self, format: StreamFormat) -> bool {
        match self {
            Self::Smooth => format == StreamFormat::Mp4,
            Self::Hls | Self::Generic => format != StreamFormat::Unsupported,
        }
    }

    fn adjust(self, format: StreamFormat, mut caps: DemuxerCapabilities) -> DemuxerCapabilities {
        // TS variants of an HLS ladder do not share continuity counters
        if self == Self::Hls && format == StreamFormat::MpegTs {
            caps.bitstream_switch_compatible = false;
        }
        caps
    }

    /// Packed audio in HLS starts every segment with an ID3 timestamp tag.
    fn strips_id3(self, format: StreamFormat) -> bool {
        self == Self::Hls
            && matches!(
                format,
                StreamFormat::PackedAac | StreamFormat::PackedMp3 | StreamFormat::PackedAc3
            )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BufferingStatus {
    /// More data could be buffered right now.
    Ongoing,
    /// The deadline is reached.
    Full,
    /// Nothing left to fetch.
    End,
}

/// Services shared by every pipeline of a session.
#[derive(Clone)]
pub struct StreamResources {
    pub connections: Arc<ConnectionManager>,
    pub demuxers: Arc<DemuxerFactory>,
    pub keyring: Arc<Keyring>,
    pub metrics: Arc<PerformanceMetrics>,
    pub track_ids: Arc<AtomicU64>,
    pub block_size: usize,
    pub max_not_found: u32,
}

struct ActiveDemuxer {
    demuxer: Box<dyn Demuxer>,
    format: StreamFormat,
    representation: ID,
    caps: DemuxerCapabilities,
    fed: bool,
}

enum KeyState {
    Clear,
    Ready(KeyMaterial),
    Fetching {
        uri: String,
        source: ChunkSource,
        data: BytesMut,
    },
}

struct InFlight {
    request: Box<ChunkRequest>,
    source: ChunkSource,
    offset: u64,
    length: Option<u64>,
    first: bool,
    key: KeyState,
    encrypted: Option<BytesMut>,
    prefix: Option<BytesMut>,
}

enum Step {
    Progress,
    WouldBlock,
    End,
}

/// Download and demux loop of one adaptation set.
///
/// Every call is non-blocking: a chunk whose bytes have not arrived yet
/// turns into [`BufferingStatus::Ongoing`] and the caller comes back later.
pub struct StreamPipeline {
    set: ID,
    category: ContentType,
    flavor: StreamFlavor,
    tracker: SegmentTracker,
    buffering: BufferingLogic,
    out: FakeEsOut,
    resources: StreamResources,
    demuxer: Option<ActiveDemuxer>,
    inflight: Option<InFlight>,
    not_found: u32,
    eof: bool,
    events: Vec<ManagerEvent>,
}

impl StreamPipeline {
    pub fn new(
        set: &AdaptationSet,
        flavor: StreamFlavor,
        tracker: SegmentTracker,
        buffering: BufferingLogic,
        resources: StreamResources,
    ) -> Self {
        let mut out = FakeEsOut::new(resources.track_ids.clone());
        out.set_metadata(set.lang.clone(), set.description.clone(), set.role.priority());
        Self {
            set: set.id.clone(),
            category: set.content_type,
            flavor,
            tracker,
            buffering,
            out,
            resources,
            demuxer: None,
            inflight: None,
            not_found: 0,
            eof: false,
            events: Vec::new(),
        }
    }

    pub fn set_id(&self) -> &ID {
        &self.set
    }

    pub fn flavor(&self) -> StreamFlavor {
        self.flavor
    }

    pub fn is_enabled(&self) -> bool {
        self.tracker.is_enabled()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.tracker.set_enabled(enabled);
    }

    pub fn tracker(&self) -> &SegmentTracker {
        &self.tracker
    }

    pub fn es_out(&self) -> &FakeEsOut {
        &self.out
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn current_representation(&self) -> Option<&ID> {
        self.tracker.current_representation()
    }

    /// Events produced since the last call.
    pub fn take_events(&mut self) -> Vec<ManagerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Highest timestamp demuxed so far.
    pub fn buffering_level(&self) -> Option<Tick> {
        self.out.commands().buffering_level()
    }

    pub fn first_dts(&self) -> Option<Tick> {
        self.out.commands().first_dts()
    }

    pub fn pcr(&self) -> Option<Tick> {
        self.out.commands().pcr()
    }

    pub fn next_command_time(&self) -> Option<Tick> {
        self.out.commands().next_time()
    }

    pub fn demuxed_amount(&self, from: Tick) -> Tick {
        self.out.commands().demuxed_amount(from)
    }

    pub fn min_ahead(&self, manifest: &Manifest) -> Tick {
        self.tracker.min_ahead(manifest)
    }

    pub fn playback_time(&self, manifest: &Manifest) -> Option<Tick> {
        self.tracker.playback_time(manifest)
    }

    /// Fetches and demuxes until `deadline` is buffered, the network has
    /// nothing more right now, or `max_steps` chunks blocks were handled.
    pub fn bufferize(
        &mut self,
        manifest: &Manifest,
        deadline: Tick,
        max_steps: usize,
    ) -> Result<BufferingStatus, AdaptiveError> {
        if self.eof {
            return Ok(BufferingStatus::End);
        }
        for _ in 0..max_steps.max(1) {
            if self.buffering_level().is_some_and(|level| level >= deadline) {
                self.report_level(manifest);
                return Ok(BufferingStatus::Full);
            }
            match self.step(manifest)? {
                Step::Progress => {}
                Step::WouldBlock => return Ok(BufferingStatus::Ongoing),
                Step::End => return Ok(BufferingStatus::End),
            }
        }
        Ok(BufferingStatus::Ongoing)
    }

    /// Applies queued commands due at `up_to` to `output`.
    pub fn dequeue(&mut self, up_to: Tick, output: &mut dyn EsOutput) -> DemuxStatus {
        self.out.commands_mut().process(up_to, output);
        if self.eof && self.out.commands().is_empty() {
            DemuxStatus::Eof
        } else {
            DemuxStatus::Success
        }
    }

    /// Seeks to `time`. Returns false when no segment covers it.
    pub fn set_position(&mut self, manifest: &Manifest, time: Tick) -> bool {
        self.abort_inflight();
        if !self.tracker.set_position(manifest, time) {
            return false;
        }
        self.forward_tracker_events();
        self.out.commands_mut().flush_media();
        self.out.reset_timestamps();
        if self
            .demuxer
            .as_ref()
            .is_some_and(|active| active.caps.needs_restart_on_seek)
        {
            self.close_demuxer();
        }
        self.eof = false;
        self.not_found = 0;
        debug!(set = %self.set, time, "Stream repositioned");
        true
    }

    /// Restarts from the default start position, used when a paused live
    /// stream resumes.
    pub fn restart(&mut self) {
        self.abort_inflight();
        self.tracker.reset_position();
        self.out.commands_mut().flush_media();
        self.out.reset_timestamps();
        self.close_demuxer();
        self.eof = false;
        self.not_found = 0;
    }

    /// Stops fetching and schedules the deletion of every track. Queued
    /// media is dropped unless `keep_media`.
    pub fn close(&mut self, keep_media: bool) {
        self.abort_inflight();
        if let Some(mut active) = self.demuxer.take() {
            active.demuxer.close(&mut self.out);
        }
        if !keep_media {
            self.out.commands_mut().flush_media();
        }
        self.out.schedule_all_for_deletion();
        self.eof = true;
    }

    /// Delivers every queued command regardless of its time.
    pub fn drain(&mut self, output: &mut dyn EsOutput) {
        self.out.commands_mut().process(Tick::MAX, output);
    }

    /// Cancels transfers and releases the demuxer.
    pub fn shutdown(&mut self) {
        self.abort_inflight();
        if let Some(mut active) = self.demuxer.take() {
            active.demuxer.close(&mut self.out);
        }
        self.out.schedule_all_for_deletion();
        self.out.commands_mut().flush();
    }

    fn step(&mut self, manifest: &Manifest) -> Result<Step, AdaptiveError> {
        if self.inflight.is_some() {
            return Ok(self.pump(manifest));
        }
        let next = self.tracker.next_chunk(manifest);
        self.forward_tracker_events();
        match next? {
            NextChunk::Chunk(request) => {
                self.begin(request);
                Ok(Step::Progress)
            }
            NextChunk::WouldBlock => Ok(Step::WouldBlock),
            NextChunk::Eof => {
                self.finish();
                Ok(Step::End)
            }
        }
    }

    fn begin(&mut self, request: Box<ChunkRequest>) {
        if !self.flavor.accepts(request.format) {
            let reason = format!("{} streams cannot carry {}", self.flavor, request.format);
            self.degrade(&request.representation, reason);
            return;
        }
        if request.discontinuity {
            self.out.discontinuity();
        }
        if let Err(e) = self.prepare_demuxer(&request) {
            self.degrade(&request.representation, e.to_string());
            return;
        }
        let key = match self.prepare_key(&request) {
            Ok(key) => key,
            Err(e) => {
                self.degrade(&request.representation, e.to_string());
                return;
            }
        };
        let source = match self.resources.connections.make_source(
            &request.url,
            Some(self.set.clone()),
            request.chunk_type,
            request.byte_range,
        ) {
            Ok(source) => source,
            Err(e) => {
                self.transport_failure(&request, e);
                return;
            }
        };
        self.resources.connections.start(&source);
        debug!(
            set = %self.set,
            representation = %request.representation,
            sequence = ?request.sequence,
            url = %request.url,
            "Fetching chunk"
        );

        let encrypted = (!matches!(key, KeyState::Clear)).then(BytesMut::new);
        let prefix =
            (!request.is_init() && self.flavor.strips_id3(request.format)).then(BytesMut::new);
        self.inflight = Some(InFlight {
            request,
            source,
            offset: 0,
            length: None,
            first: true,
            key,
            encrypted,
            prefix,
        });
    }

    fn prepare_demuxer(&mut self, request: &ChunkRequest) -> Result<(), DemuxError> {
        let restart = match &self.demuxer {
            None => true,
            Some(active) => {
                let incompatible = !active.caps.bitstream_switch_compatible;
                active.format != request.format
                    || (active.fed
                        && ((incompatible && active.representation != request.representation)
                            || (incompatible && (request.is_init() || request.discontinuity))
                            || (!request.is_init() && active.caps.needs_restart_on_each_segment)))
            }
        };
        if !restart {
            if let Some(active) = self.demuxer.as_mut() {
                active.representation = request.representation.clone();
            }
            return Ok(());
        }

        self.close_demuxer();
        let track = TrackFormat {
            category: self.category,
            format: request.format,
            codecs: request.codecs.clone(),
            ..Default::default()
        };
        let demuxer = self.resources.demuxers.create(request.format, &track)?;
        let caps = self.flavor.adjust(request.format, demuxer.capabilities());
        if caps.always_starts_from_zero {
            self.out.set_expected_timestamp(request.start_time);
        }
        debug!(
            set = %self.set,
            demuxer = demuxer.name(),
            format = %request.format,
            "Demuxer started"
        );
        self.demuxer = Some(ActiveDemuxer {
            demuxer,
            format: request.format,
            representation: request.representation.clone(),
            caps,
            fed: false,
        });
        Ok(())
    }

    /// Tears the demuxer down while keeping its tracks for the next one.
    fn close_demuxer(&mut self) {
        let Some(mut active) = self.demuxer.take() else {
            return;
        };
        self.out.recycle_all();
        self.out.commands_mut().set_drop(true);
        active.demuxer.close(&mut self.out);
        self.out.commands_mut().set_drop(false);
        trace!(set = %self.set, demuxer = active.demuxer.name(), "Demuxer closed");
    }

    fn prepare_key(&self, request: &ChunkRequest) -> Result<KeyState, EncryptionError> {
        let Some(encryption) = request.encryption.as_ref().filter(|e| e.is_encrypted()) else {
            return Ok(KeyState::Clear);
        };
        let uri = key_uri(encryption)?;
        if let Some(key) = self.resources.keyring.get(uri) {
            self.resources.metrics.record_key_cache_hit();
            return Ok(KeyState::Ready(key));
        }
        self.resources.metrics.record_key_fetch();
        let source = self
            .resources
            .connections
            .make_source(uri, None, ChunkType::Key, None)
            .map_err(|source| EncryptionError::KeyFetch {
                uri: uri.to_string(),
                source,
            })?;
        self.resources.connections.start(&source);
        Ok(KeyState::Fetching {
            uri: uri.to_string(),
            source,
            data: BytesMut::new(),
        })
    }

    /// Returns true once the key is known.
    fn poll_key(&self, flight: &mut InFlight) -> Result<bool, EncryptionError> {
        let KeyState::Fetching { uri, source, data } = &mut flight.key else {
            return Ok(true);
        };
        loop {
            match source.read_block(0) {
                Ok(Block::Data(chunk)) => data.extend_from_slice(&chunk),
                Ok(Block::Pending) => return Ok(false),
                Ok(Block::Eof) => {
                    let key = self.resources.keyring.insert(uri, data)?;
                    debug!(uri = %uri, "Fetched decryption key");
                    flight.key = KeyState::Ready(key);
                    return Ok(true);
                }
                Err(source) => {
                    return Err(EncryptionError::KeyFetch {
                        uri: uri.clone(),
                        source,
                    });
                }
            }
        }
    }

    fn pump(&mut self, manifest: &Manifest) -> Step {
        let Some(mut flight) = self.inflight.take() else {
            return Step::Progress;
        };
        match self.poll_key(&mut flight) {
            Ok(true) => {}
            Ok(false) => {
                self.inflight = Some(flight);
                return Step::WouldBlock;
            }
            Err(e) => {
                self.resources.connections.cancel(&flight.source);
                self.degrade(&flight.request.representation, e.to_string());
                return Step::Progress;
            }
        }

        match flight.source.read_block(self.resources.block_size) {
            Ok(Block::Data(data)) => {
                if let Some(buffer) = flight.encrypted.as_mut() {
                    buffer.extend_from_slice(&data);
                } else if let Err(e) = self.deliver(&mut flight, data) {
                    self.resources.connections.cancel(&flight.source);
                    self.degrade(&flight.request.representation, e.to_string());
                    return Step::Progress;
                }
                self.inflight = Some(flight);
                Step::Progress
            }
            Ok(Block::Pending) => {
                self.inflight = Some(flight);
                Step::WouldBlock
            }
            Ok(Block::Eof) => {
                self.complete(flight, manifest);
                Step::Progress
            }
            Err(e) => {
                self.transport_failure(&flight.request, e);
                Step::Progress
            }
        }
    }

    fn complete(&mut self, mut flight: InFlight, manifest: &Manifest) {
        if let Some(buffer) = flight.encrypted.take() {
            let KeyState::Ready(key) = &flight.key else {
                self.degrade(&flight.request.representation, "decryption key unavailable".into());
                return;
            };
            let iv = flight.request.iv().unwrap_or_default();
            let clear = match decrypt_aes128(&buffer, key, &iv, Some(&self.resources.metrics)) {
                Ok(clear) => clear,
                Err(e) => {
                    self.degrade(&flight.request.representation, e.to_string());
                    return;
                }
            };
            flight.length = Some(clear.len() as u64);
            if let Err(e) = self.deliver(&mut flight, clear) {
                self.degrade(&flight.request.representation, e.to_string());
                return;
            }
        }
        if let Some(prefix) = flight.prefix.take().filter(|p| !p.is_empty()) {
            if let Err(e) = self.feed(&mut flight, prefix.freeze()) {
                self.degrade(&flight.request.representation, e.to_string());
                return;
            }
        }

        if !flight.request.is_init() {
            self.not_found = 0;
            if let Some(active) = self.demuxer.as_mut() {
                if active.demuxer.segment_end(flight.request.end_time(), &mut self.out)
                    == DemuxStatus::Error
                {
                    let reason =
                        format!("demuxer `{}` failed at segment end", active.demuxer.name());
                    self.degrade(&flight.request.representation, reason);
                    return;
                }
            }
        }
        trace!(
            set = %self.set,
            sequence = ?flight.request.sequence,
            bytes = flight.offset,
            "Chunk complete"
        );
        self.report_level(manifest);
    }

    /// Strips a leading ID3 tag when the flavour asks for it, then feeds.
    fn deliver(&mut self, flight: &mut InFlight, data: Bytes) -> Result<(), DemuxError> {
        let data = match flight.prefix.as_mut() {
            None => data,
            Some(prefix) => {
                prefix.extend_from_slice(&data);
                match id3::inspect(prefix) {
                    Id3Header::Incomplete => return Ok(()),
                    Id3Header::NotPresent => {
                        let all = prefix.split().freeze();
                        flight.prefix = None;
                        all
                    }
                    Id3Header::Tag { len, timestamp } => {
                        let rest = prefix.split().freeze().slice(len..);
                        flight.prefix = None;
                        flight.offset += len as u64;
                        if let Some(ts) = timestamp {
                            trace!(set = %self.set, ts, "ID3 timestamp");
                            self.out.set_associated_timestamp(ts);
                        }
                        rest
                    }
                }
            }
        };
        if data.is_empty() {
            return Ok(());
        }
        self.feed(flight, data)
    }

    fn feed(&mut self, flight: &mut InFlight, data: Bytes) -> Result<(), DemuxError> {
        let Some(active) = self.demuxer.as_mut() else {
            return Err(DemuxError::NoDemuxer {
                format: flight.request.format.to_string(),
            });
        };
        let len = data.len() as u64;
        let input = DemuxInput {
            data,
            segment_start: flight.first,
            segment_time: flight.request.start_time,
            segment_duration: flight.request.duration,
            offset: flight.offset,
            length: flight.length.or_else(|| flight.source.content_length()),
        };
        flight.first = false;
        flight.offset += len;
        match active.demuxer.demux(input, &mut self.out) {
            DemuxStatus::Error => Err(DemuxError::failed(active.demuxer.name(), "invalid payload")),
            DemuxStatus::Success | DemuxStatus::Eof => {
                if !active.fed {
                    active.fed = true;
                    self.out.milestone();
                }
                Ok(())
            }
        }
    }

    fn transport_failure(&mut self, request: &ChunkRequest, error: TransportError) {
        match error {
            TransportError::Cancelled => {
                debug!(set = %self.set, url = %request.url, "Chunk fetch cancelled");
            }
            e if e.is_not_found() => {
                self.resources.metrics.record_not_found();
                self.not_found += 1;
                if self.not_found > self.resources.max_not_found {
                    warn!(
                        set = %self.set,
                        failures = self.not_found,
                        "Too many missing segments, ending stream"
                    );
                    self.finish();
                } else {
                    warn!(set = %self.set, url = %request.url, "Segment not found, skipping");
                    self.tracker.mark_discontinuity();
                }
            }
            e => self.degrade(&request.representation, e.to_string()),
        }
    }

    fn degrade(&mut self, representation: &ID, reason: String) {
        warn!(
            set = %self.set,
            representation = %representation,
            reason = %reason,
            "Representation degraded"
        );
        self.tracker.exclude(representation);
        self.tracker.mark_discontinuity();
        self.events.push(ManagerEvent::RepresentationDegraded {
            representation: representation.clone(),
            reason,
        });
    }

    fn abort_inflight(&mut self) {
        let Some(flight) = self.inflight.take() else {
            return;
        };
        self.resources.connections.cancel(&flight.source);
        if let KeyState::Fetching { source, .. } = &flight.key {
            self.resources.connections.cancel(source);
        }
    }

    fn finish(&mut self) {
        if let Some(mut active) = self.demuxer.take() {
            active.demuxer.drain(&mut self.out);
            active.demuxer.close(&mut self.out);
        }
        self.out.commands_mut().set_eof(true);
        self.eof = true;
        info!(set = %self.set, "Stream ended");
        self.events.push(ManagerEvent::StreamEnded {
            set: self.set.clone(),
        });
    }

    fn forward_tracker_events(&mut self) {
        for event in self.tracker.take_events() {
            if let TrackerEvent::RepresentationSwitch {
                set,
                prev,
                next: Some((to, _)),
            } = event
            {
                if prev.is_some() {
                    self.resources.metrics.record_switch();
                }
                self.events.push(ManagerEvent::RepresentationSwitched {
                    set,
                    from: prev.map(|(id, _)| id),
                    to,
                });
            }
        }
    }

    fn report_level(&mut self, manifest: &Manifest) {
        let commands = self.out.commands();
        let from = commands.pcr().or(commands.first_dts()).unwrap_or_default();
        let current = commands.demuxed_amount(from);
        self.tracker.update_buffering_level(
            self.buffering.min_buffering(manifest),
            self.buffering.max_buffering(manifest),
            current,
            self.buffering.buffering_offset(manifest),
        );
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.abort_inflight();
    }
}
