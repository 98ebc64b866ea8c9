// Commands queue: demuxer side effects replayed against the player clock
use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use manifest::{ContentType, StreamFormat, Tick};
use tracing::trace;

pub type TrackId = u64;

/// Description of an elementary stream as announced to the output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackFormat {
    pub category: ContentType,
    pub format: StreamFormat,
    pub codecs: Vec<String>,
    pub lang: Option<String>,
    pub description: Option<String>,
    /// Lower is preferred.
    pub priority: u8,
}

impl TrackFormat {
    /// Tracks with compatible formats can be reused across demuxer restarts.
    pub fn is_compatible(&self, other: &TrackFormat) -> bool {
        self.category == other.category
            && self.format == other.format
            && self.codecs == other.codecs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsBlock {
    pub data: Bytes,
    pub dts: Tick,
    pub pts: Tick,
    pub discontinuity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsCommand {
    Create { track: TrackId, format: TrackFormat },
    Data { track: TrackId, block: EsBlock },
    Pcr { time: Tick },
    Delete { track: TrackId },
}

impl EsCommand {
    pub fn timestamp(&self) -> Option<Tick> {
        match self {
            EsCommand::Data { block, .. } => Some(block.dts),
            EsCommand::Pcr { time } => Some(*time),
            EsCommand::Create { .. } | EsCommand::Delete { .. } => None,
        }
    }

    pub fn track(&self) -> Option<TrackId> {
        match self {
            EsCommand::Create { track, .. }
            | EsCommand::Data { track, .. }
            | EsCommand::Delete { track } => Some(*track),
            EsCommand::Pcr { .. } => None,
        }
    }
}

/// The real output sink, driven by the player's clock.
pub trait EsOutput {
    fn create(&mut self, track: TrackId, format: &TrackFormat);
    fn send(&mut self, track: TrackId, block: EsBlock);
    fn set_pcr(&mut self, time: Tick);
    fn delete(&mut self, track: TrackId);
}

/// Output that records every command, in delivery order.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    pub commands: Vec<EsCommand>,
}

impl EsOutput for RecordingOutput {
    fn create(&mut self, track: TrackId, format: &TrackFormat) {
        self.commands.push(EsCommand::Create {
            track,
            format: format.clone(),
        });
    }

    fn send(&mut self, track: TrackId, block: EsBlock) {
        self.commands.push(EsCommand::Data { track, block });
    }

    fn set_pcr(&mut self, time: Tick) {
        self.commands.push(EsCommand::Pcr { time });
    }

    fn delete(&mut self, track: TrackId) {
        self.commands.push(EsCommand::Delete { track });
    }
}

#[derive(Debug)]
struct Queued {
    time: Tick,
    command: EsCommand,
}

/// Time ordered log of commands.
///
/// Each command gets an effective time: its own timestamp, raised to the
/// latest time already queued for its track so that a track's commands
/// never overtake each other. Track declarations without a timestamp are
/// released as early as possible.
#[derive(Debug, Default)]
pub struct CommandsQueue {
    pending: VecDeque<Queued>,
    track_times: HashMap<TrackId, Tick>,
    dropping: bool,
    eof: bool,
    draining: bool,
    first_dts: Option<Tick>,
    buffering_level: Option<Tick>,
    pcr: Option<Tick>,
}

impl CommandsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, command: EsCommand) {
        if self.dropping {
            trace!(?command, "Dropped command");
            return;
        }
        let track_time = command.track().and_then(|t| self.track_times.get(&t).copied());
        let time = match (command.timestamp(), track_time) {
            (Some(ts), Some(prev)) => ts.max(prev),
            (Some(ts), None) => ts,
            (None, Some(prev)) => prev,
            (None, None) => Tick::MIN,
        };
        if let Some(track) = command.track() {
            self.track_times.insert(track, time);
        }
        if let Some(ts) = command.timestamp() {
            if matches!(command, EsCommand::Data { .. }) {
                self.first_dts.get_or_insert(ts);
            }
            self.buffering_level = Some(self.buffering_level.map_or(ts, |l| l.max(ts)));
        }
        let idx = self.pending.partition_point(|q| q.time <= time);
        self.pending.insert(idx, Queued { time, command });
    }

    /// Applies every command due at `up_to`, in order. While draining,
    /// everything queued is applied. Returns the number applied.
    pub fn process(&mut self, up_to: Tick, out: &mut dyn EsOutput) -> usize {
        let mut applied = 0;
        while let Some(front) = self.pending.front() {
            if !self.draining && front.time > up_to {
                break;
            }
            let Some(queued) = self.pending.pop_front() else {
                break;
            };
            match queued.command {
                EsCommand::Create { track, format } => out.create(track, &format),
                EsCommand::Data { track, block } => out.send(track, block),
                EsCommand::Pcr { time } => {
                    self.pcr = Some(time);
                    out.set_pcr(time);
                }
                EsCommand::Delete { track } => {
                    self.track_times.remove(&track);
                    out.delete(track);
                }
            }
            applied += 1;
        }
        if self.draining && self.pending.is_empty() {
            self.draining = false;
        }
        applied
    }

    /// Discards everything pending, e.g. on seek.
    pub fn flush(&mut self) {
        self.pending.clear();
        self.track_times.clear();
        self.first_dts = None;
        self.buffering_level = None;
        self.pcr = None;
        self.eof = false;
        self.draining = false;
    }

    /// Discards pending media and clock updates but keeps track
    /// declarations, which recycled tracks still depend on after a seek.
    pub fn flush_media(&mut self) {
        self.pending
            .retain(|q| matches!(q.command, EsCommand::Create { .. } | EsCommand::Delete { .. }));
        for queued in &mut self.pending {
            queued.time = Tick::MIN;
        }
        self.track_times.clear();
        self.first_dts = None;
        self.buffering_level = None;
        self.pcr = None;
        self.eof = false;
        self.draining = false;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Ignore scheduled commands while a demuxer is torn down.
    pub fn set_drop(&mut self, dropping: bool) {
        self.dropping = dropping;
    }

    pub fn is_dropping(&self) -> bool {
        self.dropping
    }

    pub fn set_eof(&mut self, eof: bool) {
        self.eof = eof;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Deliver everything before continuing, used across discontinuities.
    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining && !self.pending.is_empty();
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Highest timestamp demuxed so far.
    pub fn buffering_level(&self) -> Option<Tick> {
        self.buffering_level
    }

    /// Media time demuxed ahead of `from`.
    pub fn demuxed_amount(&self, from: Tick) -> Tick {
        self.buffering_level.map_or(0, |level| (level - from).max(0))
    }

    pub fn first_dts(&self) -> Option<Tick> {
        self.first_dts
    }

    /// Last clock reference delivered to the output.
    pub fn pcr(&self) -> Option<Tick> {
        self.pcr
    }

    /// Effective time of the next command to apply.
    pub fn next_time(&self) -> Option<Tick> {
        self.pending.front().map(|q| q.time)
    }
}
