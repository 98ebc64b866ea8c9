//! End to end sessions against an in-memory origin.
//!
//! The manager is driven from the test thread, the way a player would:
//! `bufferize` never blocks, so the tests poll with short sleeps while the
//! context's runtime performs the transfers.

use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use adaptive_engine::http::memory::MemoryFactory;
use adaptive_engine::manifest::{CLOCK_FREQ, ID, ParseError, Tick};
use adaptive_engine::plumbing::RecordingOutput;
use adaptive_engine::{
    AdaptiveConfig, AdaptiveError, BufferingStatus, Context, DemuxStatus, EsCommand,
    ManagerEvent, PlaylistManager,
};

const VOD: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n\
#EXTINF:6.0,\nseg0.ts\n#EXTINF:6.0,\nseg1.ts\n#EXTINF:6.0,\nseg2.ts\n#EXT-X-ENDLIST\n";

fn context(factory: &MemoryFactory, config: AdaptiveConfig) -> Arc<Context> {
    Arc::new(
        Context::builder(config)
            .factory(Arc::new(factory.clone()))
            .build()
            .expect("context"),
    )
}

/// Calls `bufferize` until it stops reporting progress.
fn buffer_until(manager: &PlaylistManager, deadline: Tick) -> BufferingStatus {
    let until = Instant::now() + Duration::from_secs(10);
    loop {
        let status = manager.bufferize(deadline).expect("bufferize");
        if status != BufferingStatus::Ongoing || Instant::now() > until {
            return status;
        }
        sleep(Duration::from_millis(10));
    }
}

fn fetched(factory: &MemoryFactory, suffix: &str) -> Vec<String> {
    factory
        .requests()
        .into_iter()
        .filter(|url| url.ends_with(suffix))
        .collect()
}

fn payload_len(out: &RecordingOutput) -> usize {
    out.commands
        .iter()
        .map(|c| match c {
            EsCommand::Data { block, .. } => block.data.len(),
            _ => 0,
        })
        .sum()
}

#[test]
fn vod_playlist_plays_to_the_end() {
    let factory = MemoryFactory::new();
    factory.insert_typed(
        "http://origin/vod/index.m3u8",
        VOD,
        Some("application/vnd.apple.mpegurl"),
    );
    for i in 0..3 {
        factory.insert(format!("http://origin/vod/seg{i}.ts"), vec![i as u8; 188]);
    }

    let manager = PlaylistManager::open(
        "http://origin/vod/index.m3u8",
        context(&factory, AdaptiveConfig::default()),
    )
    .unwrap();
    manager.init().unwrap();
    manager.start().unwrap();

    // the first segment already reaches six seconds
    assert_eq!(buffer_until(&manager, 6 * CLOCK_FREQ), BufferingStatus::Full);
    assert_eq!(fetched(&factory, ".ts").len(), 1);

    assert_eq!(buffer_until(&manager, 20 * CLOCK_FREQ), BufferingStatus::End);
    assert_eq!(fetched(&factory, ".ts").len(), 3);
    assert!(manager.next_demux_time().is_some());

    let mut out = RecordingOutput::default();
    assert_eq!(manager.dequeue(18 * CLOCK_FREQ, &mut out), DemuxStatus::Eof);
    assert_eq!(manager.next_demux_time(), None);
    assert_eq!(payload_len(&out), 3 * 188);

    let mut events = manager.take_events().unwrap();
    let mut ended = false;
    while let Ok(event) = events.try_recv() {
        ended |= matches!(event, ManagerEvent::StreamEnded { .. });
    }
    assert!(ended);
    manager.stop();
}

#[test]
fn variants_are_loaded_on_demand() {
    let master = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=640x360\nlo/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720\nhi/index.m3u8\n";
    let factory = MemoryFactory::new();
    factory.insert("http://origin/live/master.m3u8", master);
    for variant in ["lo", "hi"] {
        factory.insert(format!("http://origin/live/{variant}/index.m3u8"), VOD);
        for i in 0..3 {
            factory.insert(format!("http://origin/live/{variant}/seg{i}.ts"), vec![1u8; 64]);
        }
    }

    let manager = PlaylistManager::open(
        "http://origin/live/master.m3u8",
        context(&factory, AdaptiveConfig::default()),
    )
    .unwrap();
    let (sets, reps, loaded) = manager.with_manifest(|m| {
        (
            m.periods[0].adaptation_sets.len(),
            m.representations().count(),
            m.representations().filter(|r| r.loaded).count(),
        )
    });
    assert_eq!((sets, reps, loaded), (1, 2, 0));

    manager.init().unwrap();
    manager.start().unwrap();
    assert_eq!(buffer_until(&manager, 100 * CLOCK_FREQ), BufferingStatus::End);

    let playlists = factory
        .requests()
        .iter()
        .filter(|url| url.ends_with("/index.m3u8"))
        .count();
    assert!(playlists >= 1);
    assert!(manager.with_manifest(|m| m.representations().any(|r| r.loaded)));

    let mut out = RecordingOutput::default();
    assert_eq!(manager.dequeue(Tick::MAX, &mut out), DemuxStatus::Eof);
    assert_eq!(payload_len(&out), 3 * 64);
    manager.stop();
}

#[test]
fn periods_play_one_after_another() {
    let factory = MemoryFactory::new();
    factory.insert_typed(
        "http://o/m.mpd",
        include_str!("../../manifest/tests/fixtures/multi_period.mpd"),
        Some("application/dash+xml"),
    );
    for i in 1..=2 {
        factory.insert(format!("http://o/ad/seg-{i:03}.m4s"), vec![1u8; 100]);
    }
    for i in 1..=5 {
        factory.insert(format!("http://o/show-{i}.m4s"), vec![2u8; 100]);
    }

    let manager =
        PlaylistManager::open("http://o/m.mpd", context(&factory, AdaptiveConfig::default()))
            .unwrap();
    manager.init().unwrap();
    manager.start().unwrap();
    let mut events = manager.take_events().unwrap();
    assert_eq!(manager.current_period(), Some(ID::new("ad")));

    assert_eq!(buffer_until(&manager, 100 * CLOCK_FREQ), BufferingStatus::End);
    assert_eq!(
        fetched(&factory, ".m4s"),
        vec!["http://o/ad/seg-001.m4s", "http://o/ad/seg-002.m4s"]
    );

    // consuming the first period moves on to the second one
    let mut out = RecordingOutput::default();
    assert_eq!(manager.dequeue(Tick::MAX, &mut out), DemuxStatus::Success);
    assert_eq!(manager.current_period(), Some(ID::new("show")));

    assert_eq!(buffer_until(&manager, 100 * CLOCK_FREQ), BufferingStatus::End);
    let segments = fetched(&factory, ".m4s");
    assert_eq!(segments.len(), 7);
    assert_eq!(segments[6], "http://o/show-5.m4s");
    assert_eq!(manager.dequeue(Tick::MAX, &mut out), DemuxStatus::Eof);
    assert_eq!(payload_len(&out), 7 * 100);

    // the ad track is gone before the show track appears
    let created: Vec<_> = out
        .commands
        .iter()
        .enumerate()
        .filter_map(|(i, c)| matches!(c, EsCommand::Create { .. }).then_some(i))
        .collect();
    let deleted = out
        .commands
        .iter()
        .position(|c| matches!(c, EsCommand::Delete { .. }))
        .unwrap();
    assert_eq!(created.len(), 2);
    assert!(created[0] < deleted && deleted < created[1]);

    // show blocks keep the presentation timeline
    let show_start = out.commands[created[1]..]
        .iter()
        .find_map(|c| match c {
            EsCommand::Data { block, .. } => Some(block.dts),
            _ => None,
        })
        .unwrap();
    assert!(show_start >= 10 * CLOCK_FREQ);

    let mut changed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ManagerEvent::PeriodChanged { period } = event {
            changed.push(period);
        }
    }
    assert_eq!(changed, vec![ID::new("show")]);
    manager.stop();
}

#[test]
fn playlist_without_header_is_rejected() {
    let factory = MemoryFactory::new();
    factory.insert("http://origin/bad.m3u8", "#EXTINF:6.0,\nseg0.ts\n");

    let result = PlaylistManager::open(
        "http://origin/bad.m3u8",
        context(&factory, AdaptiveConfig::default()),
    );
    assert!(matches!(
        result,
        Err(AdaptiveError::Parse(ParseError::MissingHeader { .. }))
    ));
}

#[test]
fn live_playlist_is_refreshed() {
    let live = |first: u64, count: u64| {
        let mut text = format!("#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:{first}\n");
        for i in first..first + count {
            text.push_str(&format!("#EXTINF:1.0,\nseg{i}.ts\n"));
        }
        text
    };
    let factory = MemoryFactory::new();
    factory.insert("http://origin/tv/index.m3u8", live(0, 3));
    for i in 0..8 {
        factory.insert(format!("http://origin/tv/seg{i}.ts"), vec![0u8; 32]);
    }

    let mut config = AdaptiveConfig::default();
    config.playlist.update_floor = Duration::from_millis(50);
    let manager =
        PlaylistManager::open("http://origin/tv/index.m3u8", context(&factory, config)).unwrap();
    manager.init().unwrap();
    manager.start().unwrap();
    let mut events = manager.take_events().unwrap();

    manager.bufferize(CLOCK_FREQ).unwrap();
    factory.insert("http://origin/tv/index.m3u8", live(0, 5));

    let until = Instant::now() + Duration::from_secs(10);
    let mut added = 0;
    while added == 0 && Instant::now() < until {
        manager.bufferize(CLOCK_FREQ).unwrap();
        while let Ok(event) = events.try_recv() {
            if let ManagerEvent::PlaylistUpdated { added: n } = event {
                added += n;
            }
        }
        sleep(Duration::from_millis(20));
    }
    assert_eq!(added, 2);
    assert!(manager.with_manifest(|m| m.live));
    manager.stop();
}
