// Buffering targets and start positions
use manifest::{Manifest, Representation, Tick};

use crate::config::BufferingConfig;

/// Segments kept between the live edge and the start position.
pub const SAFETY_BUFFERING_EDGE_OFFSET: u64 = 1;
/// Segments skipped at the old end of a live window, which may be expunged
/// before they are fetched.
pub const SAFETY_EXPURGING_OFFSET: u64 = 2;

fn ticks(d: std::time::Duration) -> Tick {
    d.as_micros() as Tick
}

/// Buffering rules combining user settings with manifest hints.
#[derive(Debug, Clone)]
pub struct BufferingLogic {
    min_buffering: Tick,
    max_buffering: Tick,
    live_delay: Tick,
    lowest: Tick,
    low_latency: bool,
}

impl BufferingLogic {
    pub fn new(config: &BufferingConfig) -> Self {
        Self {
            min_buffering: ticks(config.min_buffering),
            max_buffering: ticks(config.max_buffering),
            live_delay: ticks(config.live_delay),
            lowest: ticks(config.lowest_buffering),
            low_latency: config.low_latency,
        }
    }

    pub fn min_buffering(&self, manifest: &Manifest) -> Tick {
        if self.low_latency {
            return self.lowest;
        }
        let buffering = match manifest.min_buffering {
            Some(hint) => self.min_buffering.max(hint),
            None => self.min_buffering,
        };
        buffering.max(self.lowest)
    }

    pub fn max_buffering(&self, manifest: &Manifest) -> Tick {
        if self.low_latency {
            return self.min_buffering(manifest);
        }
        let mut buffering = self.max_buffering;
        if manifest.live {
            buffering = buffering.min(self.live_delay(manifest));
        }
        if let Some(hint) = manifest.max_buffering {
            buffering = buffering.min(hint);
        }
        buffering.max(self.min_buffering(manifest))
    }

    pub fn live_delay(&self, manifest: &Manifest) -> Tick {
        if self.low_latency {
            return self.min_buffering(manifest);
        }
        let mut delay = manifest
            .suggested_presentation_delay
            .or(manifest.presentation_start_offset.map(Tick::abs))
            .unwrap_or(self.live_delay);
        if let Some(depth) = manifest.time_shift_buffer_depth {
            delay = delay.min(depth);
        }
        delay.max(self.min_buffering(manifest))
    }

    /// Level at which playback can proceed without immediate rebuffering.
    pub fn stable_buffering(&self, manifest: &Manifest) -> Tick {
        let min = self.min_buffering(manifest);
        if self.low_latency {
            min
        } else if manifest.live {
            min.max(self.live_delay(manifest) * 6 / 10)
        } else {
            (min * 2).min(self.max_buffering(manifest))
        }
    }

    pub fn buffering_offset(&self, manifest: &Manifest) -> Tick {
        if manifest.live {
            self.live_delay(manifest)
        } else {
            self.max_buffering(manifest)
        }
    }

    /// First segment to fetch from `rep`.
    pub fn start_sequence(&self, manifest: &Manifest, rep: &Representation) -> Option<u64> {
        if manifest.live || rep.live {
            return self.live_start_sequence(manifest, rep);
        }
        let first = rep.segments.first()?;
        match manifest.presentation_start_offset {
            Some(offset) if offset != 0 => {
                let start = rep.time_of(first);
                let time = if offset > 0 {
                    start + offset
                } else {
                    (rep.end_time() + offset).max(start)
                };
                rep.segment_at(time)
                    .or(rep.segments.last())
                    .map(|s| s.sequence)
            }
            _ => Some(first.sequence),
        }
    }

    /// Start of a live window: `live_delay` behind the edge, never inside
    /// the edge safety margin nor in the expunge zone.
    pub fn live_start_sequence(&self, manifest: &Manifest, rep: &Representation) -> Option<u64> {
        let segments = &rep.segments;
        let first = segments.first()?;
        let back = segments.last()?;
        let buffering = rep.timescale.to_scaled(self.live_delay(manifest));

        let total: u64 = segments.iter().map(|s| s.duration).sum();
        let available = match manifest.time_shift_buffer_depth {
            Some(depth) => total.min(rep.timescale.to_scaled(depth)),
            None => total,
        };

        let mut available_start = first.sequence;
        if total != available {
            let mut offset = total - available;
            for seg in segments {
                available_start = seg.sequence;
                if offset < seg.duration {
                    break;
                }
                offset -= seg.duration;
            }
        }

        let edge = back.sequence
            - (segments.len() as u64 - 1).min(SAFETY_BUFFERING_EDGE_OFFSET);
        let mut safe_start = available_start;
        for _ in 0..SAFETY_EXPURGING_OFFSET {
            if safe_start + 1 >= edge {
                break;
            }
            safe_start += 1;
        }

        let mut max_bufferizable = 0u64;
        let mut edge_duration = 0u64;
        for seg in segments.iter().filter(|s| s.sequence >= safe_start) {
            if seg.sequence <= edge {
                max_bufferizable += seg.duration;
            } else {
                edge_duration += seg.duration;
            }
        }

        let to_buffer = max_bufferizable.min(buffering);
        let mut skip = total.saturating_sub(edge_duration + to_buffer);
        let mut start = safe_start;
        for seg in segments {
            start = seg.sequence;
            if seg.duration > skip {
                break;
            }
            skip -= seg.duration;
        }
        Some(start.max(safe_start).min(back.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifest::{CLOCK_FREQ, ManifestKind, Segment};

    fn live_rep(first: u64, count: u64, secs: u64) -> Representation {
        let mut rep = Representation::new("live");
        rep.live = true;
        rep.segments = (0..count)
            .map(|i| {
                let dur = secs * CLOCK_FREQ as u64;
                Segment::new(first + i, format!("s{}.ts", first + i), (first + i) * dur, dur)
            })
            .collect();
        rep
    }

    fn live_manifest() -> Manifest {
        let mut manifest = Manifest::new(ManifestKind::Hls, "http://h/live.m3u8");
        manifest.live = true;
        manifest
    }

    #[test]
    fn defaults_match_configuration() {
        let logic = BufferingLogic::new(&BufferingConfig::default());
        let vod = Manifest::new(ManifestKind::Dash, "x");
        assert_eq!(logic.min_buffering(&vod), 6 * CLOCK_FREQ);
        assert_eq!(logic.max_buffering(&vod), 30 * CLOCK_FREQ);
        assert_eq!(logic.live_delay(&vod), 15 * CLOCK_FREQ);
        assert_eq!(logic.max_buffering(&live_manifest()), 15 * CLOCK_FREQ);
    }

    #[test]
    fn manifest_hints_adjust_targets() {
        let logic = BufferingLogic::new(&BufferingConfig::default());
        let mut manifest = live_manifest();
        manifest.min_buffering = Some(10 * CLOCK_FREQ);
        manifest.time_shift_buffer_depth = Some(12 * CLOCK_FREQ);
        assert_eq!(logic.min_buffering(&manifest), 10 * CLOCK_FREQ);
        assert_eq!(logic.live_delay(&manifest), 12 * CLOCK_FREQ);
    }

    #[test]
    fn low_latency_uses_lowest_limit() {
        let config = BufferingConfig {
            low_latency: true,
            ..Default::default()
        };
        let logic = BufferingLogic::new(&config);
        let manifest = live_manifest();
        assert_eq!(logic.min_buffering(&manifest), 2 * CLOCK_FREQ);
        assert_eq!(logic.live_delay(&manifest), 2 * CLOCK_FREQ);
    }

    #[test]
    fn live_start_keeps_delay_from_edge() {
        let logic = BufferingLogic::new(&BufferingConfig::default());
        // ten 6s segments, 100..=109; edge margin excludes 109
        let rep = live_rep(100, 10, 6);
        let start = logic.start_sequence(&live_manifest(), &rep).unwrap();
        // 15s of delay before the safety edge lands inside segment 106
        assert_eq!(start, 106);
    }

    #[test]
    fn short_live_window_starts_after_expunge_zone() {
        let logic = BufferingLogic::new(&BufferingConfig::default());
        let rep = live_rep(10, 4, 10);
        let start = logic.start_sequence(&live_manifest(), &rep).unwrap();
        assert!(start >= 11 && start <= 12, "got {start}");
    }

    #[test]
    fn vod_honours_start_offset() {
        let logic = BufferingLogic::new(&BufferingConfig::default());
        let mut rep = live_rep(0, 5, 4);
        rep.live = false;
        let mut manifest = Manifest::new(ManifestKind::Hls, "x");
        assert_eq!(logic.start_sequence(&manifest, &rep), Some(0));
        manifest.presentation_start_offset = Some(9 * CLOCK_FREQ);
        assert_eq!(logic.start_sequence(&manifest, &rep), Some(2));
        manifest.presentation_start_offset = Some(-5 * CLOCK_FREQ);
        assert_eq!(logic.start_sequence(&manifest, &rep), Some(3));
    }
}
