//! Representation selection: adaptation logics, buffering rules and the
//! per adaptation set segment tracker.

mod buffering;
mod near_optimal;
mod predictive;
mod rate;
mod selector;
mod simple;
mod tracker;

use std::time::Duration;

use manifest::{AdaptationSet, ID, Representation};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{AdaptationLogicKind, LogicConfig};
use crate::events::TrackerEvent;
use crate::http::RateObserver;

pub use buffering::{BufferingLogic, SAFETY_BUFFERING_EDGE_OFFSET, SAFETY_EXPURGING_OFFSET};
pub use near_optimal::NearOptimalLogic;
pub use predictive::PredictiveLogic;
pub use rate::{MovingAverage, RateBasedLogic};
pub use selector::RepresentationSelector;
pub use simple::{FixedRateLogic, HighestLogic, LowestLogic};
pub use tracker::{ChunkRequest, NextChunk, SegmentTracker};

/// Chooses the representation to download next for an adaptation set.
///
/// Given the same sequence of rate samples and tracker events a logic must
/// make the same choices.
pub trait AdaptationLogic: Send {
    fn name(&self) -> &'static str;

    fn selector_mut(&mut self) -> &mut RepresentationSelector;

    fn next_representation<'a>(
        &mut self,
        set: &'a AdaptationSet,
        current: Option<&Representation>,
    ) -> Option<&'a Representation>;

    /// A media transfer tagged with `set` completed.
    fn update_download_rate(&mut self, _set: &ID, _bytes: u64, _elapsed: Duration) {}

    fn tracker_event(&mut self, _event: &TrackerEvent) {}

    /// Never select `rep` again.
    fn exclude(&mut self, rep: ID) {
        self.selector_mut().exclude(rep);
    }
}

pub fn create_logic(config: &LogicConfig) -> Box<dyn AdaptationLogic> {
    let selector = RepresentationSelector::from_config(config);
    match config.kind {
        AdaptationLogicKind::Lowest => Box::new(LowestLogic::new(selector)),
        AdaptationLogicKind::Highest => Box::new(HighestLogic::new(selector)),
        AdaptationLogicKind::Rate => Box::new(RateBasedLogic::new(selector)),
        AdaptationLogicKind::Fixed => Box::new(FixedRateLogic::new(selector, config.fixed_bitrate)),
        AdaptationLogicKind::Predictive => Box::new(PredictiveLogic::new(selector)),
        AdaptationLogicKind::NearOptimal => Box::new(NearOptimalLogic::new(selector)),
    }
}

/// One logic shared by every tracker of a session. It is also the rate
/// observer of the connection manager.
pub struct SharedLogic {
    inner: Mutex<Box<dyn AdaptationLogic>>,
}

impl SharedLogic {
    pub fn new(logic: Box<dyn AdaptationLogic>) -> Self {
        debug!(logic = logic.name(), "Adaptation logic created");
        Self {
            inner: Mutex::new(logic),
        }
    }

    pub fn from_config(config: &LogicConfig) -> Self {
        Self::new(create_logic(config))
    }

    pub fn name(&self) -> &'static str {
        self.inner.lock().name()
    }

    pub fn next_representation(
        &self,
        set: &AdaptationSet,
        current: Option<&Representation>,
    ) -> Option<ID> {
        self.inner
            .lock()
            .next_representation(set, current)
            .map(|r| r.id.clone())
    }

    pub fn tracker_event(&self, event: &TrackerEvent) {
        self.inner.lock().tracker_event(event);
    }

    pub fn exclude(&self, rep: ID) {
        self.inner.lock().exclude(rep);
    }

    pub fn is_excluded(&self, rep: &ID) -> bool {
        self.inner.lock().selector_mut().is_excluded(rep)
    }
}

impl RateObserver for SharedLogic {
    fn update_download_rate(&self, tag: &ID, bytes: u64, elapsed: Duration, _latency: Duration) {
        self.inner.lock().update_download_rate(tag, bytes, elapsed);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use manifest::{AdaptationSet, Representation};

    /// Three rung video ladder: low 500k/360p, mid 1M/720p, high 2M/1080p.
    pub fn ladder() -> AdaptationSet {
        let mut set = AdaptationSet::new("video");
        for (id, bw, height) in [
            ("low", 500_000, 360),
            ("mid", 1_000_000, 720),
            ("high", 2_000_000, 1080),
        ] {
            let mut rep = Representation::new(id);
            rep.bandwidth = bw;
            rep.height = Some(height);
            set.add_representation(rep);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_configured_logic() {
        for (kind, name) in [
            (AdaptationLogicKind::Lowest, "lowest"),
            (AdaptationLogicKind::Highest, "highest"),
            (AdaptationLogicKind::Rate, "rate"),
            (AdaptationLogicKind::Fixed, "fixed"),
            (AdaptationLogicKind::Predictive, "predictive"),
            (AdaptationLogicKind::NearOptimal, "near-optimal"),
        ] {
            let config = LogicConfig {
                kind,
                ..Default::default()
            };
            assert_eq!(create_logic(&config).name(), name);
        }
    }

    #[test]
    fn shared_logic_excludes_representations() {
        let set = testing::ladder();
        let logic =
            SharedLogic::new(Box::new(HighestLogic::new(RepresentationSelector::default())));
        assert_eq!(logic.next_representation(&set, None), Some(ID::new("high")));
        logic.exclude(ID::new("high"));
        assert!(logic.is_excluded(&ID::new("high")));
        assert_eq!(logic.next_representation(&set, None), Some(ID::new("mid")));
    }
}
