// Live refresh: merging a freshly parsed window into the current timeline
use tracing::{debug, warn};

use crate::model::{ID, Manifest, Representation, Segment};
use crate::time::{CLOCK_FREQ, Tick};

/// Drift between two program date-times of the same segment that is reported.
const ANCHOR_TOLERANCE: Tick = CLOCK_FREQ / 2;

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Segments past the previous live edge.
    pub added: usize,
    pub changed: bool,
    /// An absolute-time anchor moved; the update's anchor was kept.
    pub anchor_conflict: bool,
}

fn rescale(seg: &mut Segment, from: &Representation, to: &Representation) {
    if from.timescale == to.timescale {
        return;
    }
    seg.start_time = to.timescale.to_scaled(from.timescale.to_time(seg.start_time));
    seg.duration = to.timescale.to_scaled(from.timescale.to_time(seg.duration));
}

fn shift(value: u64, delta: i128) -> u64 {
    (value as i128 + delta).clamp(0, u64::MAX as i128) as u64
}

/// Where an update's window lands relative to the current timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// `skip` leading update segments predate the current window; the rest
    /// are moved by `delta` onto the current timeline.
    Overlap { skip: usize, delta: i128 },
    /// Entirely past the live edge.
    After { delta: i128 },
    /// Entirely before the current window.
    Stale,
    /// Unrelated windows; the update replaces the timeline.
    Reset,
}

/// Sequence numbers are authoritative; start times follow the current timeline.
fn place_by_sequence(current: &Representation, incoming: &[Segment]) -> Placement {
    let overlap = incoming.iter().enumerate().find_map(|(idx, s)| {
        current
            .segment(s.sequence)
            .map(|old| (idx, old.start_time as i128 - s.start_time as i128))
    });
    if let Some((skip, delta)) = overlap {
        return Placement::Overlap { skip, delta };
    }
    let (first, last) = (&incoming[0], &incoming[incoming.len() - 1]);
    match (current.segments.first(), current.segments.last()) {
        (Some(_), Some(edge)) if first.sequence > edge.sequence => Placement::After {
            delta: edge.end_time() as i128 - first.start_time as i128,
        },
        (Some(oldest), _) if last.sequence < oldest.sequence => Placement::Stale,
        (Some(_), _) => Placement::Reset,
        (None, _) => Placement::After { delta: 0 },
    }
}

/// Start times are authoritative; numbering follows the current timeline.
fn place_by_time(current: &Representation, incoming: &[Segment]) -> Placement {
    let overlap = incoming.iter().enumerate().find_map(|(idx, s)| {
        current
            .segments
            .binary_search_by_key(&s.start_time, |o| o.start_time)
            .ok()
            .map(|pos| (idx, current.segments[pos].sequence as i128 - s.sequence as i128))
    });
    if let Some((skip, delta)) = overlap {
        return Placement::Overlap { skip, delta };
    }
    let (first, last) = (&incoming[0], &incoming[incoming.len() - 1]);
    match (current.segments.first(), current.segments.last()) {
        (Some(_), Some(edge)) if first.start_time >= edge.end_time() => Placement::After {
            delta: (edge.sequence + 1) as i128 - first.sequence as i128,
        },
        (Some(oldest), _) if last.end_time() <= oldest.start_time => Placement::Stale,
        (Some(_), _) => Placement::Reset,
        (None, _) => Placement::After { delta: 0 },
    }
}

/// Merges `update` into `current`.
///
/// Positions shared by both windows keep the timeline of `current`; segments
/// outside the update's window are retained so that merging the same update
/// twice yields the same segment list. The revision only moves when
/// something changed.
pub fn merge_representation(
    current: &Representation,
    update: &Representation,
) -> (Representation, MergeOutcome) {
    let mut merged = current.clone();
    merged.live = update.live;
    merged.loaded = update.loaded || current.loaded;
    merged.target_duration = update.target_duration.or(current.target_duration);
    merged.encryption = update.encryption.clone();
    if update.playlist_url.is_some() {
        merged.playlist_url = update.playlist_url.clone();
    }
    if merged.init.is_none() {
        merged.init = update.init.clone();
    }
    if !merged.format.is_known() {
        merged.format = update.format;
    }

    let mut outcome = MergeOutcome::default();
    let mut incoming: Vec<Segment> = update.segments.clone();
    for seg in &mut incoming {
        rescale(seg, update, current);
    }

    if !incoming.is_empty() {
        let by_sequence = current.sequence_aligned && update.sequence_aligned;
        let placement = if by_sequence {
            place_by_sequence(current, &incoming)
        } else {
            place_by_time(current, &incoming)
        };
        let apply = |incoming: &mut [Segment], delta: i128| {
            for seg in incoming.iter_mut() {
                if by_sequence {
                    seg.start_time = shift(seg.start_time, delta);
                } else {
                    seg.sequence = shift(seg.sequence, delta);
                }
            }
        };

        match placement {
            Placement::Stale => {
                debug!(id = %current.id, "Ignoring stale playlist window");
                incoming.clear();
            }
            Placement::Reset => {
                warn!(id = %current.id, "Playlist window unrelated to current timeline, replacing");
                merged.segments.clear();
            }
            Placement::Overlap { skip, delta } => {
                incoming.drain(..skip);
                apply(&mut incoming, delta);
            }
            Placement::After { delta } => apply(&mut incoming, delta),
        }
    }

    if !incoming.is_empty() {
        let first_new = incoming[0].sequence;
        let last_new = incoming[incoming.len() - 1].sequence;
        let last_old = merged.last_sequence();

        for seg in &mut incoming {
            let Some(old) = merged.segment(seg.sequence) else {
                continue;
            };
            match (old.display_time, seg.display_time) {
                (Some(a), Some(b)) if (a - b).abs() > ANCHOR_TOLERANCE => {
                    outcome.anchor_conflict = true;
                }
                (Some(a), None) => seg.display_time = Some(a),
                _ => {}
            }
        }
        outcome.added = incoming
            .iter()
            .filter(|s| last_old.is_none_or(|last| s.sequence > last))
            .count();

        let head = merged.segments.iter().filter(|s| s.sequence < first_new);
        let tail = merged.segments.iter().filter(|s| s.sequence > last_new);
        let segments: Vec<Segment> = head
            .cloned()
            .chain(incoming)
            .chain(tail.cloned())
            .collect();
        merged.segments = segments;
    }

    outcome.changed = merged != *current;
    if outcome.changed {
        merged.revision = current.revision + 1;
    }
    if outcome.anchor_conflict {
        warn!(id = %current.id, "Conflicting program date-time anchors, keeping the latest");
    }
    (merged, outcome)
}

/// Merges a refreshed whole manifest. Representations are matched by ID;
/// ones missing from the update are dropped with their period.
pub fn merge_manifest(
    current: &Manifest,
    update: &Manifest,
) -> (Manifest, Vec<(ID, MergeOutcome)>) {
    let mut merged = update.clone();
    let mut outcomes = Vec::new();
    for rep in merged
        .periods
        .iter_mut()
        .flat_map(|p| p.adaptation_sets.iter_mut())
        .flat_map(|s| s.representations.iter_mut())
    {
        if let Some(old) = current.representation(&rep.id) {
            let (next, outcome) = merge_representation(old, rep);
            *rep = next;
            outcomes.push((rep.id.clone(), outcome));
        }
    }
    debug!(
        url = %merged.url,
        merged = outcomes.len(),
        "Merged refreshed manifest"
    );
    (merged, outcomes)
}
