// Buffer based selection maximising a logarithmic quality utility
use std::collections::BTreeMap;
use std::time::Duration;

use manifest::{AdaptationSet, CLOCK_FREQ, ID, Representation, Tick};
use tracing::trace;

use super::AdaptationLogic;
use super::rate::MovingAverage;
use super::selector::RepresentationSelector;
use crate::events::TrackerEvent;

/// Buffer level below which quality is sacrificed first.
const MINIMUM_BUFFER: Tick = 6 * CLOCK_FREQ;
const BUFFER_TARGET: Tick = 30 * CLOCK_FREQ;

#[derive(Debug, Clone)]
struct NearOptimalContext {
    buffering_min: Tick,
    buffering_level: Tick,
    buffering_target: Tick,
    last_download_rate: u64,
    average: MovingAverage,
}

impl Default for NearOptimalContext {
    fn default() -> Self {
        Self {
            buffering_min: MINIMUM_BUFFER,
            buffering_level: 0,
            buffering_target: BUFFER_TARGET,
            last_download_rate: 0,
            average: MovingAverage::new(10),
        }
    }
}

/// Lyapunov style selection: each representation is scored by its utility,
/// `ln(bandwidth / lowest bandwidth)`, weighed against the buffered duration,
/// and the best score per bit wins. Downswitches are damped by the measured
/// throughput.
pub struct NearOptimalLogic {
    selector: RepresentationSelector,
    streams: BTreeMap<ID, NearOptimalContext>,
    used_bps: u64,
}

impl NearOptimalLogic {
    pub fn new(selector: RepresentationSelector) -> Self {
        Self {
            selector,
            streams: BTreeMap::new(),
            used_bps: 0,
        }
    }

    fn current_bps(&self) -> u64 {
        self.streams
            .values()
            .map(|ctx| ctx.last_download_rate)
            .max()
            .unwrap_or(0)
    }

    fn available_bandwidth(&self, bandwidth: u64, current: Option<&Representation>) -> u64 {
        let remaining =
            bandwidth.saturating_sub(self.used_bps) + current.map_or(0, |r| r.bandwidth);
        remaining.max(bandwidth)
    }

    /// Representation maximising `(vd * (utility + gamma) - level) / bandwidth`.
    /// Ties go to the higher one.
    fn best_score<'a>(
        &self,
        set: &'a AdaptationSet,
        lowest: &Representation,
        gamma: f64,
        vd: f64,
        level: f64,
    ) -> Option<&'a Representation> {
        let floor = lowest.bandwidth.max(1) as f64;
        let mut best: Option<(&Representation, f64)> = None;
        let mut rep = self.selector.lowest(set);
        while let Some(candidate) = rep {
            let utility = (candidate.bandwidth.max(1) as f64 / floor).ln();
            let score = (vd * (utility + gamma) - level) / candidate.bandwidth.max(1) as f64;
            if best.is_none_or(|(_, top)| top <= score) {
                best = Some((candidate, score));
            }
            rep = self
                .selector
                .higher(set, candidate)
                .filter(|next| next.bandwidth > candidate.bandwidth);
        }
        best.map(|(rep, _)| rep)
    }
}

impl AdaptationLogic for NearOptimalLogic {
    fn name(&self) -> &'static str {
        "near-optimal"
    }

    fn selector_mut(&mut self) -> &mut RepresentationSelector {
        &mut self.selector
    }

    fn next_representation<'a>(
        &mut self,
        set: &'a AdaptationSet,
        current: Option<&Representation>,
    ) -> Option<&'a Representation> {
        let lowest = self.selector.lowest(set)?;
        let highest = self.selector.highest(set)?;
        if lowest.id == highest.id {
            return Some(lowest);
        }
        let Some(ctx) = self.streams.get(&set.id) else {
            return Some(lowest);
        };

        let umin = (lowest.bandwidth.max(1) as f64).ln();
        let umax = (highest.bandwidth.max(1) as f64).ln();
        let min_secs = ctx.buffering_min as f64 / CLOCK_FREQ as f64;
        let headroom =
            (ctx.buffering_target as f64 / ctx.buffering_min.max(1) as f64 - 1.0).max(1e-3);
        let gamma = 1.0 + (umax - umin) / headroom;
        let vd = (min_secs - 1.0) / (umin + gamma);
        let level = ctx.buffering_level as f64 / CLOCK_FREQ as f64;
        let bps = self.available_bandwidth(self.current_bps(), current);

        let chosen = match current {
            None => {
                let start = self.selector.select(set, bps)?;
                // prefer audio+video over an audio only lowest rendition
                match self.selector.higher(set, start) {
                    Some(next)
                        if start.id == lowest.id
                            && next.id != start.id
                            && start.codecs.len() == 1
                            && next.codecs.len() > 1 =>
                    {
                        next
                    }
                    _ => start,
                }
            }
            Some(prev) => {
                let best = self.best_score(set, lowest, gamma, vd, level)?;
                if best.bandwidth >= prev.bandwidth {
                    best
                } else {
                    let by_rate = self.selector.select(set, bps)?;
                    if by_rate.bandwidth <= best.bandwidth {
                        best
                    } else if by_rate.bandwidth > prev.bandwidth {
                        set.representation(&prev.id)
                            .filter(|r| !self.selector.is_excluded(&r.id))
                            .unwrap_or(by_rate)
                    } else {
                        self.selector.lower(set, by_rate)?
                    }
                }
            }
        };

        trace!(
            set = %set.id,
            level,
            available = bps,
            chosen = %chosen.id,
            "Near optimal choice"
        );
        Some(chosen)
    }

    fn update_download_rate(&mut self, set: &ID, bytes: u64, elapsed: Duration) {
        let micros = elapsed.as_micros();
        if micros == 0 {
            return;
        }
        if let Some(ctx) = self.streams.get_mut(set) {
            let bps = (bytes as u128 * 8 * CLOCK_FREQ as u128 / micros) as u64;
            ctx.last_download_rate = ctx.average.push(bps);
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
                let ctx = self.streams.entry(set.clone()).or_default();
                ctx.buffering_level = *current;
                ctx.buffering_target = *target;
            }
            _ => {}
        }
    }
}
