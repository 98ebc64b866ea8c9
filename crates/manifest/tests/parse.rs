use manifest::time::parse_utc;
use manifest::{
    CLOCK_FREQ, ContentType, ManifestKind, ParseError, Role, StreamFormat, Tick, merge_manifest,
    merge_representation, parse,
};
use rstest::rstest;

fn fixture(name: &str) -> Vec<u8> {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read(path).unwrap()
}

fn assert_close(actual: Tick, expected: Tick) {
    assert!(
        (actual - expected).abs() <= 1,
        "expected {expected} got {actual}"
    );
}

#[rstest]
#[case("vod_3x6.m3u8", "http://example.com/vod/index.m3u8", 3, 18, &[0])]
#[case("vod_timeline.mpd", "http://example.com/vod.mpd", 5, 20, &[800_000, 2_400_000])]
fn fixture_structure(
    #[case] name: &str,
    #[case] url: &str,
    #[case] segments: usize,
    #[case] duration_secs: i64,
    #[case] bandwidths: &[u64],
) {
    let manifest = parse(&fixture(name), url).unwrap();
    assert!(!manifest.live);
    assert_close(manifest.duration, duration_secs * CLOCK_FREQ);

    let first = &manifest.periods[0].adaptation_sets[0];
    let declared: Vec<u64> = first.representations.iter().map(|r| r.bandwidth).collect();
    assert_eq!(declared, bandwidths);
    for rep in &first.representations {
        assert_eq!(rep.segments.len(), segments);
        assert_close(rep.total_duration(), duration_secs * CLOCK_FREQ);
        let seqs: Vec<u64> = rep.segments.iter().map(|s| s.sequence).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn master_playlist_with_two_variants() {
    let manifest = parse(
        &fixture("master_two_variants.m3u8"),
        "http://example.com/live/master.m3u8",
    )
    .unwrap();
    assert_eq!(manifest.kind, ManifestKind::Hls);
    let period = &manifest.periods[0];
    assert_eq!(period.adaptation_sets.len(), 1);

    let set = &period.adaptation_sets[0];
    assert_eq!(set.representations.len(), 2);
    assert_eq!(set.representations[0].bandwidth, 500_000);
    assert_eq!(set.representations[1].bandwidth, 2_000_000);
    assert_eq!(set.representations[0].codecs, set.representations[1].codecs);
    for rep in &set.representations {
        assert!(rep.init.is_none());
        assert!(rep.needs_loading());
    }
    assert_eq!(
        set.representations[1].playlist_url.as_deref(),
        Some("http://example.com/live/high/index.m3u8")
    );
    assert_eq!(set.representations[1].width, Some(1280));
}

#[test]
fn missing_magic_header_is_a_parse_error() {
    let body = b"#EXT-X-TARGETDURATION:6\n#EXTINF:6,\na.ts\n#EXT-X-ENDLIST\n";
    let result = parse(body, "http://example.com/index.m3u8");
    assert!(matches!(
        result,
        Err(ParseError::MissingHeader {
            expected: "#EXTM3U"
        })
    ));
}

#[test]
fn dash_sets_and_addressing() {
    let manifest = parse(&fixture("vod_timeline.mpd"), "http://example.com/vod.mpd").unwrap();
    assert_eq!(manifest.min_buffering, Some(2 * CLOCK_FREQ));
    let sets = &manifest.periods[0].adaptation_sets;
    assert_eq!(sets.len(), 2);

    let video = &sets[0];
    assert_eq!(video.role, Role::Main);
    assert_eq!(video.content_type, ContentType::Video);
    assert!(video.segment_aligned);
    let v360 = &video.representations[0];
    assert_eq!(v360.format, StreamFormat::Mp4);
    assert_eq!(
        v360.init.as_ref().unwrap().url,
        "http://cdn.example.com/vod/v360/init.mp4"
    );
    assert_eq!(
        v360.segments[1].url,
        "http://cdn.example.com/vod/v360/360000.m4s"
    );

    let audio = &sets[1];
    assert_eq!(audio.lang.as_deref(), Some("en"));
    let a128 = &audio.representations[0];
    assert_eq!(a128.segments.len(), 4);
    assert_close(a128.total_duration(), 20 * CLOCK_FREQ);
    assert_eq!(
        a128.init.as_ref().unwrap().url,
        "http://cdn.example.com/vod/audio/init.mp4"
    );
}

#[test]
fn dash_multi_period() {
    let manifest = parse(&fixture("multi_period.mpd"), "http://example.com/multi.mpd").unwrap();
    assert_eq!(manifest.periods.len(), 2);
    assert_eq!(manifest.duration, 30 * CLOCK_FREQ);

    let ad = &manifest.periods[0];
    let ad_rep = &ad.adaptation_sets[0].representations[0];
    assert_eq!(ad_rep.id.as_str(), "ad/v");
    assert_eq!(ad_rep.segments.len(), 2);
    assert_eq!(ad_rep.segments[0].url, "http://example.com/ad/seg-001.m4s");

    let show = &manifest.periods[1];
    assert_eq!(show.start, 10 * CLOCK_FREQ);
    assert_eq!(show.duration, Some(20 * CLOCK_FREQ));
    let show_rep = &show.adaptation_sets[0].representations[0];
    assert_eq!(show_rep.segments.len(), 5);
    assert_eq!(show_rep.start_time(), 10 * CLOCK_FREQ);
}

#[test]
fn live_window_anchors_and_merge() {
    let url = "http://example.com/live/index.m3u8";
    let first = parse(&fixture("live_window.m3u8"), url).unwrap();
    assert!(first.live);
    assert_eq!(first.duration, 0);

    let rep = &first.periods[0].adaptation_sets[0].representations[0];
    let anchor = parse_utc("2024-05-01T12:00:00Z").unwrap();
    assert_eq!(rep.segments[0].display_time, Some(anchor));
    assert_eq!(rep.segments[1].display_time, Some(anchor + 4 * CLOCK_FREQ));
    assert!(rep.segments[2].discontinuity);

    let refreshed = String::from_utf8(fixture("live_window.m3u8"))
        .unwrap()
        .replace("#EXT-X-MEDIA-SEQUENCE:1042", "#EXT-X-MEDIA-SEQUENCE:1043")
        .replace(
            "#EXT-X-PROGRAM-DATE-TIME:2024-05-01T12:00:00.000Z\n#EXTINF:4.000,\nchunk_1042.ts\n",
            "",
        )
        + "#EXTINF:4.000,\nchunk_1045.ts\n";
    let second = parse(refreshed.as_bytes(), url).unwrap();

    let (merged, outcomes) = merge_manifest(&first, &second);
    let merged_rep = &merged.periods[0].adaptation_sets[0].representations[0];
    let seqs: Vec<u64> = merged_rep.segments.iter().map(|s| s.sequence).collect();
    assert_eq!(seqs, vec![1042, 1043, 1044, 1045]);
    assert_eq!(outcomes[0].1.added, 1);
    assert_eq!(
        merged_rep.segment(1043).unwrap().start_time,
        rep.segment(1043).unwrap().start_time
    );

    let update = &second.periods[0].adaptation_sets[0].representations[0];
    let (again, _) = merge_representation(merged_rep, update);
    assert_eq!(again.segments, merged_rep.segments);
}
