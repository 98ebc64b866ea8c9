// Fixed selection logics: always lowest, always highest, closest to a bitrate
use manifest::{AdaptationSet, Representation};

use super::AdaptationLogic;
use super::selector::RepresentationSelector;

pub struct LowestLogic {
    selector: RepresentationSelector,
}

impl LowestLogic {
    pub fn new(selector: RepresentationSelector) -> Self {
        Self { selector }
    }
}

impl AdaptationLogic for LowestLogic {
    fn name(&self) -> &'static str {
        "lowest"
    }

    fn selector_mut(&mut self) -> &mut RepresentationSelector {
        &mut self.selector
    }

    fn next_representation<'a>(
        &mut self,
        set: &'a AdaptationSet,
        _current: Option<&Representation>,
    ) -> Option<&'a Representation> {
        self.selector.lowest(set)
    }
}

pub struct HighestLogic {
    selector: RepresentationSelector,
}

impl HighestLogic {
    pub fn new(selector: RepresentationSelector) -> Self {
        Self { selector }
    }
}

impl AdaptationLogic for HighestLogic {
    fn name(&self) -> &'static str {
        "highest"
    }

    fn selector_mut(&mut self) -> &mut RepresentationSelector {
        &mut self.selector
    }

    fn next_representation<'a>(
        &mut self,
        set: &'a AdaptationSet,
        _current: Option<&Representation>,
    ) -> Option<&'a Representation> {
        self.selector.highest(set)
    }
}

/// Sticks to the best representation not above a configured bitrate.
pub struct FixedRateLogic {
    selector: RepresentationSelector,
    bitrate: u64,
}

impl FixedRateLogic {
    pub fn new(selector: RepresentationSelector, bitrate: u64) -> Self {
        Self { selector, bitrate }
    }
}

impl AdaptationLogic for FixedRateLogic {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn selector_mut(&mut self) -> &mut RepresentationSelector {
        &mut self.selector
    }

    fn next_representation<'a>(
        &mut self,
        set: &'a AdaptationSet,
        _current: Option<&Representation>,
    ) -> Option<&'a Representation> {
        self.selector.select(set, self.bitrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::testing::ladder;

    #[test]
    fn picks_are_independent_of_history() {
        let set = ladder();
        let mut lowest = LowestLogic::new(RepresentationSelector::default());
        let mut highest = HighestLogic::new(RepresentationSelector::default());
        let mut fixed = FixedRateLogic::new(RepresentationSelector::default(), 1_200_000);
        for _ in 0..3 {
            assert_eq!(lowest.next_representation(&set, None).unwrap().id.as_str(), "low");
            assert_eq!(highest.next_representation(&set, None).unwrap().id.as_str(), "high");
            assert_eq!(fixed.next_representation(&set, None).unwrap().id.as_str(), "mid");
        }
    }
}
