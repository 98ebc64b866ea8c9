// Buffer level driven logic for several concurrent streams
use std::collections::BTreeMap;
use std::time::Duration;

use manifest::{AdaptationSet, CLOCK_FREQ, ID, Representation, Tick};
use tracing::trace;

use super::AdaptationLogic;
use super::rate::MovingAverage;
use super::selector::RepresentationSelector;
use crate::events::TrackerEvent;

#[derive(Debug, Clone)]
struct PredictiveStats {
    segments_count: u64,
    buffering_level: Tick,
    buffering_target: Tick,
    last_download_rate: u64,
    last_duration: Tick,
    average: MovingAverage,
}

impl Default for PredictiveStats {
    fn default() -> Self {
        Self {
            segments_count: 0,
            buffering_level: 0,
            buffering_target: 1,
            last_download_rate: 0,
            last_duration: 1,
            average: MovingAverage::new(10),
        }
    }
}

impl PredictiveStats {
    fn starting(&self) -> bool {
        self.segments_count < 3 || self.last_download_rate == 0
    }

    fn level(&self) -> f64 {
        self.buffering_level as f64 / self.buffering_target.max(1) as f64
    }
}

/// Starts every stream at the top, then steps down as buffers drain and
/// back up once they are healthy.
pub struct PredictiveLogic {
    selector: RepresentationSelector,
    // ordered so that iteration, and therefore selection, is deterministic
    streams: BTreeMap<ID, PredictiveStats>,
    used_bps: u64,
}

impl PredictiveLogic {
    pub fn new(selector: RepresentationSelector) -> Self {
        Self {
            selector,
            streams: BTreeMap::new(),
            used_bps: 0,
        }
    }

    fn available_bandwidth(&self, bandwidth: u64, current: Option<&Representation>) -> u64 {
        let remaining =
            bandwidth.saturating_sub(self.used_bps) + current.map_or(0, |r| r.bandwidth);
        remaining.max(bandwidth)
    }
}

impl AdaptationLogic for PredictiveLogic {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn selector_mut(&mut self) -> &mut RepresentationSelector {
        &mut self.selector
    }

    fn next_representation<'a>(
        &mut self,
        set: &'a AdaptationSet,
        current: Option<&Representation>,
    ) -> Option<&'a Representation> {
        let Some(stats) = self.streams.get(&set.id) else {
            return self.selector.highest(set);
        };
        let level = stats.level();
        let last_duration = stats.last_duration;
        let starting = stats.starting();

        let max_other_rate = self
            .streams
            .iter()
            .filter(|(id, _)| *id != &set.id)
            .map(|(_, other)| other.last_download_rate)
            .max()
            .unwrap_or(0);

        let chosen = if starting {
            self.selector.highest(set)
        } else {
            let available = self.available_bandwidth(max_other_rate, current);
            match current {
                None => self.selector.select(set, available),
                Some(prev) if level > 0.8 => {
                    self.selector.select(set, available.max(prev.bandwidth))
                }
                Some(prev) if level > 0.5 => set
                    .representation(&prev.id)
                    .filter(|r| !self.selector.is_excluded(&r.id))
                    .or_else(|| self.selector.select(set, prev.bandwidth)),
                Some(prev) if level > 2.0 * last_duration as f64 => self.selector.lower(set, prev),
                Some(_) => self
                    .selector
                    .select(set, (available as f64 * level) as u64),
            }
        };

        trace!(set = %set.id, level, chosen = ?chosen.map(|r| &r.id), "Predictive choice");
        if let Some(stats) = self.streams.get_mut(&set.id) {
            stats.segments_count += 1;
        }
        chosen
    }

    fn update_download_rate(&mut self, set: &ID, bytes: u64, elapsed: Duration) {
        let micros = elapsed.as_micros();
        if micros == 0 {
            return;
        }
        if let Some(stats) = self.streams.get_mut(set) {
            let bps = (bytes as u128 * 8 * CLOCK_FREQ as u128 / micros) as u64;
            stats.last_download_rate = stats.average.push(bps);
        }
    }

    fn tracker_event(&mut self, event: &TrackerEvent) {
        match event {
            TrackerEvent::RepresentationSwitch { prev, next, .. } => {
                if let Some((_, bandwidth)) = prev {
                    self.used_bps = self.used_bps.saturating_sub(*bandwidth);
                }
                if let Some((_, bandwidth)) = next {
                    self.used_bps += bandwidth;
                }
            }
            TrackerEvent::BufferingStateUpdate { set, enabled } => {
                if *enabled {
                    self.streams.entry(set.clone()).or_default();
                } else {
                    self.streams.remove(set);
                }
            }
            TrackerEvent::BufferingLevelChange {
                set,
                current,
                target,
                ..
            } => {
                let stats = self.streams.entry(set.clone()).or_default();
                stats.buffering_level = *current;
                stats.buffering_target = *target;
            }
            TrackerEvent::SegmentChange { set, duration, .. } => {
                self.streams.entry(set.clone()).or_default().last_duration = *duration;
            }
            _ => {}
        }
    }
}
