// Download rate driven logic
use std::collections::VecDeque;
use std::time::Duration;

use manifest::{AdaptationSet, CLOCK_FREQ, ID, Representation};
use tracing::trace;

use super::AdaptationLogic;
use super::selector::RepresentationSelector;
use crate::events::TrackerEvent;

/// Samples are aggregated until this much transfer time accumulated.
const MIN_SAMPLE_DURATION: Duration = Duration::from_micros((CLOCK_FREQ / 4) as u64);

/// Exponential average whose smoothing factor follows the variability of
/// the last `window` observations.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<u64>,
    window: usize,
    previous: u64,
    average: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(window),
            window: window.max(1),
            previous: 0,
            average: 0.0,
        }
    }

    pub fn push(&mut self, value: u64) -> u64 {
        if self.values.len() >= self.window {
            if let Some(front) = self.values.pop_front() {
                self.previous = front;
            }
        }
        self.values.push_back(value);

        let min = self.values.iter().copied().min().unwrap_or_default();
        let max = self.values.iter().copied().max().unwrap_or_default();
        let mut last = self.previous;
        let mut diff_sum = 0u64;
        for &v in &self.values {
            diff_sum += v.abs_diff(last);
            last = v;
        }
        let alpha = if diff_sum > 0 {
            0.33 * (max - min) as f64 / diff_sum as f64
        } else {
            0.5
        };
        self.average = alpha * self.average + (1.0 - alpha) * value as f64;
        self.average as u64
    }

    pub fn get(&self) -> u64 {
        self.average as u64
    }
}

/// Selects the best representation the measured throughput can sustain,
/// keeping a quarter in reserve and accounting for what other streams use.
pub struct RateBasedLogic {
    selector: RepresentationSelector,
    average: MovingAverage,
    current_bps: u64,
    used_bps: u64,
    pending_bytes: u64,
    pending_time: Duration,
}

impl RateBasedLogic {
    pub fn new(selector: RepresentationSelector) -> Self {
        Self {
            selector,
            average: MovingAverage::new(2),
            current_bps: 0,
            used_bps: 0,
            pending_bytes: 0,
            pending_time: Duration::ZERO,
        }
    }

    /// Estimated sustainable rate, bits per second.
    pub fn current_bps(&self) -> u64 {
        self.current_bps
    }

    pub fn used_bps(&self) -> u64 {
        self.used_bps
    }
}

impl AdaptationLogic for RateBasedLogic {
    fn name(&self) -> &'static str {
        "rate"
    }

    fn selector_mut(&mut self) -> &mut RepresentationSelector {
        &mut self.selector
    }

    fn next_representation<'a>(
        &mut self,
        set: &'a AdaptationSet,
        current: Option<&Representation>,
    ) -> Option<&'a Representation> {
        let available = (self.current_bps + current.map_or(0, |r| r.bandwidth))
            .saturating_sub(self.used_bps);
        self.selector
            .select(set, available)
            .or_else(|| self.selector.lowest(set))
    }

    fn update_download_rate(&mut self, set: &ID, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        self.pending_bytes += bytes;
        self.pending_time += elapsed;
        if self.pending_time < MIN_SAMPLE_DURATION {
            return;
        }
        let micros = self.pending_time.as_micros().max(1);
        let bps = (self.pending_bytes as u128 * 8 * CLOCK_FREQ as u128 / micros) as u64;
        let average = self.average.push(bps);
        self.current_bps = average / 4 * 3;
        trace!(set = %set, bps, average, current = self.current_bps, "Rate sample");
        self.pending_bytes = 0;
        self.pending_time = Duration::ZERO;
    }

    fn tracker_event(&mut self, event: &TrackerEvent) {
        if let TrackerEvent::RepresentationSwitch { prev, next, .. } = event {
            if let Some((_, bandwidth)) = prev {
                self.used_bps = self.used_bps.saturating_sub(*bandwidth);
            }
            if let Some((_, bandwidth)) = next {
                self.used_bps += bandwidth;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::testing::ladder;

    #[test]
    fn steady_input_converges() {
        let mut avg = MovingAverage::new(2);
        let mut last = 0;
        for _ in 0..20 {
            last = avg.push(1_000_000);
        }
        assert!(last > 990_000 && last <= 1_000_000, "got {last}");
    }

    #[test]
    fn short_transfers_are_aggregated() {
        let mut logic = RateBasedLogic::new(RepresentationSelector::default());
        let set = ID::new("video");
        logic.update_download_rate(&set, 10_000, Duration::from_millis(100));
        assert_eq!(logic.current_bps(), 0);
        // 250 kB over 250 ms is 8 Mbit/s
        logic.update_download_rate(&set, 240_000, Duration::from_millis(150));
        assert!(logic.current_bps() > 0);
    }

    #[test]
    fn starts_low_then_follows_throughput() {
        let set = ladder();
        let mut logic = RateBasedLogic::new(RepresentationSelector::default());
        assert_eq!(logic.next_representation(&set, None).unwrap().id.as_str(), "low");

        // 10 Mbit/s for a couple of seconds
        for _ in 0..8 {
            logic.update_download_rate(&set.id, 312_500, Duration::from_millis(250));
        }
        assert_eq!(logic.next_representation(&set, None).unwrap().id.as_str(), "high");
    }

    #[test]
    fn other_streams_reduce_available_bandwidth() {
        let set = ladder();
        let mut logic = RateBasedLogic::new(RepresentationSelector::default());
        for _ in 0..8 {
            // 2.4 Mbit/s, 1.8 Mbit/s after the safety factor
            logic.update_download_rate(&set.id, 75_000, Duration::from_millis(250));
        }
        assert_eq!(logic.next_representation(&set, None).unwrap().id.as_str(), "mid");

        logic.tracker_event(&TrackerEvent::RepresentationSwitch {
            set: ID::new("audio"),
            prev: None,
            next: Some((ID::new("aac"), 1_000_000)),
        });
        assert_eq!(logic.used_bps(), 1_000_000);
        assert_eq!(logic.next_representation(&set, None).unwrap().id.as_str(), "low");
    }

    #[test]
    fn same_history_same_choice() {
        let set = ladder();
        let run = || {
            let mut logic = RateBasedLogic::new(RepresentationSelector::default());
            let mut picks = Vec::new();
            for (bytes, ms) in [(50_000, 300), (200_000, 250), (20_000, 400), (90_000, 260)] {
                logic.update_download_rate(&set.id, bytes, Duration::from_millis(ms));
                picks.push(logic.next_representation(&set, None).unwrap().id.clone());
            }
            picks
        };
        assert_eq!(run(), run());
    }
}
