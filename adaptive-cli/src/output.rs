//! Elementary stream sink that only counts what it receives.

use std::collections::BTreeMap;
use std::fmt;

use adaptive_engine::manifest::{CLOCK_FREQ, Tick};
use adaptive_engine::{EsBlock, EsOutput, TrackFormat, TrackId};

#[derive(Debug, Clone)]
pub struct TrackStats {
    pub format: TrackFormat,
    pub blocks: u64,
    pub bytes: u64,
    pub discontinuities: u64,
    pub first_dts: Option<Tick>,
    pub last_dts: Option<Tick>,
    pub deleted: bool,
}

impl TrackStats {
    fn new(format: TrackFormat) -> Self {
        Self {
            format,
            blocks: 0,
            bytes: 0,
            discontinuities: 0,
            first_dts: None,
            last_dts: None,
            deleted: false,
        }
    }

    pub fn span(&self) -> Tick {
        match (self.first_dts, self.last_dts) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }
}

/// Per track totals, in track creation order.
#[derive(Debug, Default)]
pub struct StatsOutput {
    tracks: BTreeMap<TrackId, TrackStats>,
    commands: u64,
    last_pcr: Option<Tick>,
}

impl StatsOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracks(&self) -> impl Iterator<Item = (&TrackId, &TrackStats)> {
        self.tracks.iter()
    }

    pub fn commands(&self) -> u64 {
        self.commands
    }

    pub fn last_pcr(&self) -> Option<Tick> {
        self.last_pcr
    }

    pub fn total_bytes(&self) -> u64 {
        self.tracks.values().map(|t| t.bytes).sum()
    }
}

impl EsOutput for StatsOutput {
    fn create(&mut self, track: TrackId, format: &TrackFormat) {
        self.commands += 1;
        self.tracks.insert(track, TrackStats::new(format.clone()));
    }

    fn send(&mut self, track: TrackId, block: EsBlock) {
        self.commands += 1;
        let Some(stats) = self.tracks.get_mut(&track) else {
            return;
        };
        stats.blocks += 1;
        stats.bytes += block.data.len() as u64;
        if block.discontinuity {
            stats.discontinuities += 1;
        }
        stats.first_dts.get_or_insert(block.dts);
        stats.last_dts = Some(block.dts);
    }

    fn set_pcr(&mut self, time: Tick) {
        self.commands += 1;
        self.last_pcr = Some(time);
    }

    fn delete(&mut self, track: TrackId) {
        self.commands += 1;
        if let Some(stats) = self.tracks.get_mut(&track) {
            stats.deleted = true;
        }
    }
}

fn secs(time: Tick) -> f64 {
    time as f64 / CLOCK_FREQ as f64
}

impl fmt::Display for StatsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<6} {:<8} {:<10} {:>8} {:>12} {:>9} {:>6}",
            "track", "type", "format", "blocks", "bytes", "seconds", "disc"
        )?;
        for (id, track) in &self.tracks {
            writeln!(
                f,
                "{:<6} {:<8} {:<10} {:>8} {:>12} {:>9.3} {:>6}",
                id.to_string(),
                track.format.category.to_string(),
                track.format.format.to_string(),
                track.blocks,
                track.bytes,
                secs(track.span()),
                track.discontinuities
            )?;
        }
        write!(
            f,
            "{} commands, {} bytes, clock at {:.3}s",
            self.commands,
            self.total_bytes(),
            self.last_pcr.map(secs).unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptive_engine::manifest::{ContentType, StreamFormat};

    fn block(len: usize, dts: Tick, discontinuity: bool) -> EsBlock {
        EsBlock {
            data: vec![0u8; len].into(),
            dts,
            pts: dts,
            discontinuity,
        }
    }

    #[test]
    fn counts_per_track() {
        let mut out = StatsOutput::new();
        let video = TrackFormat {
            category: ContentType::Video,
            format: StreamFormat::MpegTs,
            ..Default::default()
        };
        out.create(1, &video);
        out.send(1, block(100, 0, false));
        out.send(1, block(50, 2 * CLOCK_FREQ, true));
        out.send(9, block(10, 0, false));
        out.set_pcr(2 * CLOCK_FREQ);
        out.delete(1);

        let (_, stats) = out.tracks().next().unwrap();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.bytes, 150);
        assert_eq!(stats.discontinuities, 1);
        assert_eq!(stats.span(), 2 * CLOCK_FREQ);
        assert!(stats.deleted);
        assert_eq!(out.commands(), 6);
        assert_eq!(out.total_bytes(), 150);

        let table = out.to_string();
        assert!(table.contains("video"));
        assert!(table.ends_with("6 commands, 150 bytes, clock at 2.000s"));
    }
}
