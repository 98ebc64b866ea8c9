// FakeEsOut: stable tracks and fixed timestamps in front of the commands queue
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use manifest::Tick;
use tracing::{debug, trace};

use super::commands::{CommandsQueue, EsBlock, EsCommand, TrackFormat, TrackId};

/// Reference used to shift demuxer timestamps onto the presentation timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampSync {
    #[default]
    None,
    /// The demuxer restarts from zero; its first timestamp maps here.
    Expected(Tick),
    /// A timestamp carried out of band, e.g. in an ID3 tag.
    Associated(Tick),
}

#[derive(Debug)]
struct FakeEs {
    id: TrackId,
    format: TrackFormat,
    recyclable: bool,
}

/// Output seen by demuxers.
///
/// Tracks survive demuxer restarts: a restarted demuxer creating a
/// compatible track gets the old id back and the real output never sees a
/// delete/create pair.
pub struct FakeEsOut {
    commands: CommandsQueue,
    tracks: Vec<FakeEs>,
    ids: Arc<AtomicU64>,
    sync: TimestampSync,
    offset: Option<Tick>,
    lang: Option<String>,
    description: Option<String>,
    priority: u8,
}

impl FakeEsOut {
    /// `ids` is shared by every stream of a session so track ids are unique.
    pub fn new(ids: Arc<AtomicU64>) -> Self {
        Self {
            commands: CommandsQueue::new(),
            tracks: Vec::new(),
            ids,
            sync: TimestampSync::None,
            offset: None,
            lang: None,
            description: None,
            priority: 0,
        }
    }

    /// Metadata applied to tracks created without their own.
    pub fn set_metadata(
        &mut self,
        lang: Option<String>,
        description: Option<String>,
        priority: u8,
    ) {
        self.lang = lang;
        self.description = description;
        self.priority = priority;
    }

    pub fn commands(&self) -> &CommandsQueue {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut CommandsQueue {
        &mut self.commands
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn create_track(&mut self, mut format: TrackFormat) -> TrackId {
        if format.lang.is_none() {
            format.lang = self.lang.clone();
        }
        if format.description.is_none() {
            format.description = self.description.clone();
        }
        format.priority = format.priority.max(self.priority);

        if let Some(es) = self
            .tracks
            .iter_mut()
            .find(|es| es.recyclable && es.format.is_compatible(&format))
        {
            es.recyclable = false;
            trace!(track = es.id, "Recycled track");
            return es.id;
        }

        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        self.commands.schedule(EsCommand::Create {
            track: id,
            format: format.clone(),
        });
        self.tracks.push(FakeEs {
            id,
            format,
            recyclable: false,
        });
        debug!(track = id, "Created track");
        id
    }

    pub fn send(&mut self, track: TrackId, mut block: EsBlock) {
        block.dts = self.fix_timestamp(block.dts);
        block.pts = self.fix_timestamp(block.pts);
        self.commands.schedule(EsCommand::Data { track, block });
    }

    pub fn set_pcr(&mut self, time: Tick) {
        let time = self.fix_timestamp(time);
        self.commands.schedule(EsCommand::Pcr { time });
    }

    /// Deletion requested by a demuxer. Ignored while dropping so that the
    /// track can be recycled by the next demuxer.
    pub fn delete_track(&mut self, track: TrackId) {
        if self.commands.is_dropping() {
            return;
        }
        self.tracks.retain(|es| es.id != track);
        self.commands.schedule(EsCommand::Delete { track });
    }

    /// Prepares for a demuxer restart.
    pub fn recycle_all(&mut self) {
        for es in &mut self.tracks {
            es.recyclable = true;
        }
    }

    /// Deletes tracks the new demuxer did not claim.
    pub fn gc(&mut self) {
        let dropping = self.commands.is_dropping();
        self.commands.set_drop(false);
        let (stale, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.tracks).into_iter().partition(|es| es.recyclable);
        self.tracks = kept;
        for es in stale {
            debug!(track = es.id, "Removing unused track");
            self.commands.schedule(EsCommand::Delete { track: es.id });
        }
        self.commands.set_drop(dropping);
    }

    /// Called once a restarted demuxer has produced data.
    pub fn milestone(&mut self) {
        if self.tracks.iter().any(|es| es.recyclable) {
            self.gc();
        }
    }

    pub fn schedule_all_for_deletion(&mut self) {
        for es in std::mem::take(&mut self.tracks) {
            self.commands.schedule(EsCommand::Delete { track: es.id });
        }
    }

    pub fn set_expected_timestamp(&mut self, time: Tick) {
        self.sync = TimestampSync::Expected(time);
        self.offset = None;
    }

    pub fn set_associated_timestamp(&mut self, time: Tick) {
        self.sync = TimestampSync::Associated(time);
        self.offset = None;
    }

    pub fn timestamp_sync(&self) -> TimestampSync {
        self.sync
    }

    pub fn reset_timestamps(&mut self) {
        self.sync = TimestampSync::None;
        self.offset = None;
    }

    /// Timeline break: deliver what is queued first and forget the offset.
    pub fn discontinuity(&mut self) {
        self.commands.set_draining(true);
        self.reset_timestamps();
    }

    fn fix_timestamp(&mut self, ts: Tick) -> Tick {
        let reference = match self.sync {
            TimestampSync::None => return ts,
            TimestampSync::Expected(t) | TimestampSync::Associated(t) => t,
        };
        let offset = *self.offset.get_or_insert(reference - ts);
        ts + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::commands::RecordingOutput;
    use bytes::Bytes;
    use manifest::{ContentType, StreamFormat};

    fn video() -> TrackFormat {
        TrackFormat {
            category: ContentType::Video,
            format: StreamFormat::MpegTs,
            ..Default::default()
        }
    }

    fn block(dts: Tick) -> EsBlock {
        EsBlock {
            data: Bytes::from_static(b"frame"),
            dts,
            pts: dts,
            discontinuity: false,
        }
    }

    #[test]
    fn restart_recycles_compatible_tracks() {
        let mut out = FakeEsOut::new(Arc::new(AtomicU64::new(1)));
        let first = out.create_track(video());

        out.recycle_all();
        out.commands_mut().set_drop(true);
        out.delete_track(first);
        out.commands_mut().set_drop(false);

        let again = out.create_track(video());
        assert_eq!(first, again);
        out.milestone();

        let mut sink = RecordingOutput::default();
        out.commands_mut().process(Tick::MAX, &mut sink);
        assert_eq!(sink.commands.len(), 1);
        assert!(matches!(sink.commands[0], EsCommand::Create { .. }));
    }

    #[test]
    fn unclaimed_tracks_are_collected() {
        let mut out = FakeEsOut::new(Arc::new(AtomicU64::new(1)));
        let old = out.create_track(video());
        out.recycle_all();
        let audio = out.create_track(TrackFormat {
            category: ContentType::Audio,
            format: StreamFormat::PackedAac,
            ..Default::default()
        });
        assert_ne!(old, audio);
        out.milestone();
        assert_eq!(out.track_count(), 1);

        let mut sink = RecordingOutput::default();
        out.commands_mut().process(Tick::MAX, &mut sink);
        assert!(sink
            .commands
            .iter()
            .any(|c| *c == EsCommand::Delete { track: old }));
    }

    #[test]
    fn expected_timestamp_shifts_zero_based_output() {
        let mut out = FakeEsOut::new(Arc::new(AtomicU64::new(1)));
        let track = out.create_track(video());
        out.set_expected_timestamp(12_000_000);
        out.send(track, block(0));
        out.send(track, block(40_000));
        out.set_pcr(40_000);

        let mut sink = RecordingOutput::default();
        out.commands_mut().process(Tick::MAX, &mut sink);
        let stamps: Vec<_> = sink.commands.iter().filter_map(EsCommand::timestamp).collect();
        assert_eq!(stamps, vec![12_000_000, 12_040_000, 12_040_000]);
    }

    #[test]
    fn discontinuity_drains_and_resets() {
        let mut out = FakeEsOut::new(Arc::new(AtomicU64::new(1)));
        let track = out.create_track(video());
        out.set_associated_timestamp(5_000_000);
        out.send(track, block(100));
        out.discontinuity();
        assert!(out.commands().is_draining());
        assert_eq!(out.timestamp_sync(), TimestampSync::None);

        let mut sink = RecordingOutput::default();
        assert_eq!(out.commands_mut().process(0, &mut sink), 2);
    }

    #[test]
    fn metadata_fills_new_tracks() {
        let mut out = FakeEsOut::new(Arc::new(AtomicU64::new(7)));
        out.set_metadata(Some("en".into()), None, 2);
        let id = out.create_track(video());
        assert_eq!(id, 7);
        let mut sink = RecordingOutput::default();
        out.commands_mut().process(0, &mut sink);
        match &sink.commands[0] {
            EsCommand::Create { format, .. } => {
                assert_eq!(format.lang.as_deref(), Some("en"));
                assert_eq!(format.priority, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
