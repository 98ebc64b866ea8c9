// Events produced by segment trackers and the playlist manager
use manifest::{ID, StreamFormat, Tick};

/// Emitted by a [`SegmentTracker`](crate::logic::SegmentTracker) while it
/// hands out chunks. Adaptation logics observe the same values.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    /// The next chunk does not continue the previous timeline.
    Discontinuity { set: ID, sequence: u64 },
    RepresentationSwitch {
        set: ID,
        prev: Option<(ID, u64)>,
        next: Option<(ID, u64)>,
    },
    FormatChange { set: ID, format: StreamFormat },
    /// A media segment of `duration` was handed out.
    SegmentChange { set: ID, sequence: u64, duration: Tick },
    PositionChange { set: ID, time: Tick },
    /// The stream was enabled or disabled.
    BufferingStateUpdate { set: ID, enabled: bool },
    BufferingLevelChange {
        set: ID,
        minimum: Tick,
        maximum: Tick,
        current: Tick,
        target: Tick,
    },
}

impl TrackerEvent {
    pub fn set(&self) -> &ID {
        match self {
            TrackerEvent::Discontinuity { set, .. }
            | TrackerEvent::RepresentationSwitch { set, .. }
            | TrackerEvent::FormatChange { set, .. }
            | TrackerEvent::SegmentChange { set, .. }
            | TrackerEvent::PositionChange { set, .. }
            | TrackerEvent::BufferingStateUpdate { set, .. }
            | TrackerEvent::BufferingLevelChange { set, .. } => set,
        }
    }
}

/// Notifications sent to the embedder over the bounded events channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// A live refresh merged `added` new segments.
    PlaylistUpdated { added: usize },
    UpdateFailed { attempt: u32, reason: String },
    /// Live refreshing gave up after too many consecutive failures.
    ManifestStalled { failures: u32 },
    RepresentationSwitched { set: ID, from: Option<ID>, to: ID },
    StreamEnded { set: ID },
    /// Playback moved on to the next period of the manifest.
    PeriodChanged { period: ID },
    /// A program date-time disagreed with the established timeline; the
    /// newest anchor was kept.
    AnchorConflict { representation: ID },
    RepresentationDegraded { representation: ID, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_carries_its_set() {
        let set = ID::new("audio");
        let events = [
            TrackerEvent::Discontinuity {
                set: set.clone(),
                sequence: 1,
            },
            TrackerEvent::PositionChange {
                set: set.clone(),
                time: 0,
            },
            TrackerEvent::BufferingStateUpdate {
                set: set.clone(),
                enabled: true,
            },
        ];
        assert!(events.iter().all(|e| e.set() == &set));
    }
}
