// Representation selection within an adaptation set
use std::collections::HashSet;

use manifest::{AdaptationSet, ID, Representation};

use crate::config::LogicConfig;

/// Picks representations by bitrate, honouring resolution caps and skipping
/// representations excluded after unrecoverable failures.
#[derive(Debug, Clone, Default)]
pub struct RepresentationSelector {
    max_width: Option<u32>,
    max_height: Option<u32>,
    excluded: HashSet<ID>,
}

impl RepresentationSelector {
    pub fn new(max_width: Option<u32>, max_height: Option<u32>) -> Self {
        Self {
            max_width,
            max_height,
            excluded: HashSet::new(),
        }
    }

    pub fn from_config(config: &LogicConfig) -> Self {
        Self::new(config.max_width, config.max_height)
    }

    pub fn exclude(&mut self, rep: ID) {
        self.excluded.insert(rep);
    }

    pub fn is_excluded(&self, rep: &ID) -> bool {
        self.excluded.contains(rep)
    }

    fn fits(&self, rep: &Representation) -> bool {
        let width_ok = match (self.max_width, rep.width) {
            (Some(max), Some(w)) => w <= max,
            _ => true,
        };
        let height_ok = match (self.max_height, rep.height) {
            (Some(max), Some(h)) => h <= max,
            _ => true,
        };
        width_ok && height_ok
    }

    /// Usable representations in ascending bandwidth order. When the caps
    /// rule out everything, every non excluded representation is usable.
    fn candidates<'a>(&self, set: &'a AdaptationSet) -> Vec<&'a Representation> {
        let usable: Vec<_> = set
            .representations
            .iter()
            .filter(|r| !self.excluded.contains(&r.id))
            .collect();
        let fitting: Vec<_> = usable.iter().copied().filter(|r| self.fits(r)).collect();
        if fitting.is_empty() { usable } else { fitting }
    }

    pub fn lowest<'a>(&self, set: &'a AdaptationSet) -> Option<&'a Representation> {
        self.candidates(set).first().copied()
    }

    pub fn highest<'a>(&self, set: &'a AdaptationSet) -> Option<&'a Representation> {
        self.candidates(set).last().copied()
    }

    /// Next representation above `rep`, or the highest one.
    pub fn higher<'a>(
        &self,
        set: &'a AdaptationSet,
        rep: &Representation,
    ) -> Option<&'a Representation> {
        let candidates = self.candidates(set);
        candidates
            .iter()
            .copied()
            .find(|r| r.bandwidth > rep.bandwidth)
            .or_else(|| candidates.last().copied())
    }

    /// Next representation below `rep`, or the lowest one.
    pub fn lower<'a>(
        &self,
        set: &'a AdaptationSet,
        rep: &Representation,
    ) -> Option<&'a Representation> {
        let candidates = self.candidates(set);
        candidates
            .iter()
            .rev()
            .copied()
            .find(|r| r.bandwidth < rep.bandwidth)
            .or_else(|| candidates.first().copied())
    }

    /// Highest representation whose bandwidth does not exceed `bitrate`,
    /// falling back to the lowest one.
    pub fn select<'a>(&self, set: &'a AdaptationSet, bitrate: u64) -> Option<&'a Representation> {
        let candidates = self.candidates(set);
        candidates
            .iter()
            .rev()
            .copied()
            .find(|r| r.bandwidth <= bitrate)
            .or_else(|| candidates.first().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::testing::ladder;

    #[test]
    fn selects_by_bitrate() {
        let set = ladder();
        let selector = RepresentationSelector::default();
        assert_eq!(selector.select(&set, 1_500_000).unwrap().id.as_str(), "mid");
        assert_eq!(selector.select(&set, 10).unwrap().id.as_str(), "low");
        assert_eq!(selector.select(&set, u64::MAX).unwrap().id.as_str(), "high");
    }

    #[test]
    fn honours_height_cap() {
        let set = ladder();
        let selector = RepresentationSelector::new(None, Some(720));
        assert_eq!(selector.highest(&set).unwrap().id.as_str(), "mid");
        assert_eq!(selector.select(&set, u64::MAX).unwrap().id.as_str(), "mid");
    }

    #[test]
    fn steps_up_and_down() {
        let set = ladder();
        let selector = RepresentationSelector::default();
        let mid = set.representation(&ID::new("mid")).unwrap();
        assert_eq!(selector.higher(&set, mid).unwrap().id.as_str(), "high");
        assert_eq!(selector.lower(&set, mid).unwrap().id.as_str(), "low");
        let low = set.representation(&ID::new("low")).unwrap();
        assert_eq!(selector.lower(&set, low).unwrap().id.as_str(), "low");
    }

    #[test]
    fn excluded_representations_are_skipped() {
        let set = ladder();
        let mut selector = RepresentationSelector::default();
        selector.exclude(ID::new("high"));
        assert_eq!(selector.highest(&set).unwrap().id.as_str(), "mid");
        selector.exclude(ID::new("mid"));
        selector.exclude(ID::new("low"));
        assert!(selector.highest(&set).is_none());
    }
}
