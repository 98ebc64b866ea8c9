// Second HLS pass: tag sequence to manifest model
use std::collections::HashSet;

use tracing::{debug, trace};

use super::tags::{AttributeList, HlsByteRange, Line, Tag, TagKind, has_header, tokenize};
use crate::error::ParseError;
use crate::format::{ContentType, StreamFormat};
use crate::model::{
    AdaptationSet, CommonEncryption, EncryptionMethod, InitSegment, Manifest, ManifestKind, Period,
    Representation, Role, Segment,
};
use crate::resolve_url;
use crate::time::{CLOCK_FREQ, Tick, Timescale, parse_utc, seconds};

/// Allowed drift between a program date-time and the one implied by the
/// previous anchored segment before the two are reported as conflicting.
const ANCHOR_TOLERANCE: Tick = CLOCK_FREQ / 2;

/// Result of parsing one media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub representation: Representation,
    pub live: bool,
    pub start_offset: Option<Tick>,
    /// A program date-time disagreed with the timeline implied by an earlier one.
    pub anchor_conflict: bool,
}

/// Parses a master or media playlist fetched from `url`.
pub fn parse(text: &str, url: &str) -> Result<Manifest, ParseError> {
    if !has_header(text) {
        return Err(ParseError::MissingHeader {
            expected: "#EXTM3U",
        });
    }
    let lines = tokenize(text);
    let mut manifest = Manifest::new(ManifestKind::Hls, url);

    for tag in tags(&lines) {
        match tag.kind {
            TagKind::SessionKey => {
                if let Some(key) = key_from(&tag.attributes, url) {
                    manifest.session_keys.push(key);
                }
            }
            TagKind::Start => {
                manifest.presentation_start_offset =
                    tag.attributes.float("TIME-OFFSET").map(seconds);
            }
            _ => {}
        }
    }

    let is_master = tags(&lines).any(|t| t.kind == TagKind::StreamInf);
    let mut period = Period::new("0");

    if is_master {
        period.adaptation_sets = build_master(&lines, url);
        if period.adaptation_sets.is_empty() {
            return Err(ParseError::Empty { protocol: "HLS" });
        }
        debug!(
            url = %url,
            sets = period.adaptation_sets.len(),
            "Parsed HLS master playlist"
        );
    } else {
        let template = Representation::new(url);
        let media = build_media(&lines, url, &template);
        manifest.live = media.live;
        if let Some(offset) = media.start_offset {
            manifest.presentation_start_offset = Some(offset);
        }
        if media.live {
            manifest.min_update_period = media.representation.target_duration;
        }
        let mut set = AdaptationSet::new("default");
        set.content_type = content_type_of(media.representation.format);
        set.add_representation(media.representation);
        period.adaptation_sets.push(set);
        debug!(url = %url, live = manifest.live, "Parsed HLS media playlist");
    }

    manifest.periods.push(period);
    manifest.refresh_duration();
    Ok(manifest)
}

/// Parses a media playlist on behalf of an existing (possibly unloaded)
/// representation, keeping its identity and variant attributes.
pub fn parse_media_playlist(
    text: &str,
    url: &str,
    template: &Representation,
) -> Result<MediaPlaylist, ParseError> {
    if !has_header(text) {
        return Err(ParseError::MissingHeader {
            expected: "#EXTM3U",
        });
    }
    let lines = tokenize(text);
    if tags(&lines).any(|t| t.kind == TagKind::StreamInf) {
        return Err(ParseError::unsupported(
            "expected a media playlist but found variant streams",
        ));
    }
    Ok(build_media(&lines, url, template))
}

fn tags(lines: &[Line]) -> impl Iterator<Item = &Tag> {
    lines.iter().filter_map(|l| match l {
        Line::Tag(tag) => Some(tag),
        Line::Uri(_) => None,
    })
}

fn key_from(attrs: &AttributeList, base: &str) -> Option<CommonEncryption> {
    match attrs.get("METHOD")? {
        "AES-128" => attrs
            .get("URI")
            .map(|uri| CommonEncryption::aes128(resolve_url(base, uri), attrs.iv())),
        "SAMPLE-AES" | "SAMPLE-AES-CTR" => Some(CommonEncryption {
            method: EncryptionMethod::SampleAes,
            uri: attrs.get("URI").map(|u| resolve_url(base, u)),
            iv: attrs.iv(),
        }),
        _ => None,
    }
}

fn content_type_of(format: StreamFormat) -> ContentType {
    if format.is_text() {
        ContentType::Text
    } else {
        ContentType::Unknown
    }
}

fn build_master(lines: &[Line], url: &str) -> Vec<AdaptationSet> {
    let renditions: Vec<&AttributeList> = tags(lines)
        .filter(|t| t.kind == TagKind::Media)
        .map(|t| &t.attributes)
        .filter(|a| a.get("URI").is_some())
        .collect();
    let rendition_uris: HashSet<String> = renditions
        .iter()
        .filter_map(|a| a.get("URI"))
        .map(|u| resolve_url(url, u))
        .collect();

    let mut sets = Vec::new();
    let mut variants = AdaptationSet::new("default");
    let mut seen = HashSet::new();

    for attrs in tags(lines)
        .filter(|t| t.kind == TagKind::StreamInf)
        .map(|t| &t.attributes)
    {
        let Some(uri) = attrs.get("URI") else {
            continue;
        };
        let resolved = resolve_url(url, uri);
        if rendition_uris.contains(&resolved) || !seen.insert(resolved.clone()) {
            continue;
        }
        let mut rep = unloaded_representation(&resolved);
        rep.bandwidth = attrs
            .decimal("BANDWIDTH")
            .or_else(|| attrs.decimal("AVERAGE-BANDWIDTH"))
            .unwrap_or_default();
        rep.codecs = attrs.codecs();
        if let Some((w, h)) = attrs.resolution() {
            rep.width = Some(w);
            rep.height = Some(h);
        }
        rep.frame_rate = attrs.float("FRAME-RATE");
        trace!(uri = %resolved, bandwidth = rep.bandwidth, "Variant stream");
        variants.add_representation(rep);
    }
    if !variants.representations.is_empty() {
        sets.push(variants);
    }

    let mut seen_renditions = HashSet::new();
    for (idx, attrs) in renditions.into_iter().enumerate() {
        let Some(uri) = attrs.get("URI") else {
            continue;
        };
        let resolved = resolve_url(url, uri);
        if !seen_renditions.insert(resolved.clone()) {
            continue;
        }

        let id = match (attrs.get("GROUP-ID"), attrs.get("NAME")) {
            (Some(group), Some(name)) => format!("{group} {name}"),
            _ => format!("rendition-{}", idx + 1),
        };
        let mut set = AdaptationSet::new(id);
        set.description = attrs.get("NAME").map(str::to_string);
        set.role = match (attrs.flag("DEFAULT"), attrs.flag("AUTOSELECT")) {
            (Some(true), _) => Role::Main,
            (_, Some(false)) => Role::Supplementary,
            _ => Role::Alternate,
        };
        if let Some(lang) = attrs.get("LANGUAGE") {
            set.set_lang(lang);
        }
        match attrs.get("TYPE") {
            Some("AUDIO") => set.content_type = ContentType::Audio,
            Some("VIDEO") => set.content_type = ContentType::Video,
            Some("SUBTITLES") => {
                set.content_type = ContentType::Text;
                set.role = Role::Subtitle;
            }
            _ => set.supported = false,
        }

        let mut rep = unloaded_representation(&resolved);
        rep.codecs = attrs.codecs();
        if set.content_type == ContentType::Text && !rep.format.is_known() {
            rep.format = StreamFormat::WebVtt;
        }
        if !set.supported {
            rep.format = StreamFormat::Unsupported;
        }
        set.add_representation(rep);
        sets.push(set);
    }
    sets
}

fn unloaded_representation(uri: &str) -> Representation {
    let mut rep = Representation::new(uri);
    rep.playlist_url = Some(uri.to_string());
    rep.loaded = false;
    rep.sequence_aligned = true;
    rep
}

#[derive(Default)]
struct Carry {
    sequence: u64,
    pending_duration: Option<Tick>,
    pending_range: Option<HlsByteRange>,
    previous_range_end: Option<u64>,
    discontinuity: bool,
    encryption: Option<CommonEncryption>,
    pending_anchor: Option<Tick>,
}

fn build_media(lines: &[Line], url: &str, template: &Representation) -> MediaPlaylist {
    let mut rep = template.clone();
    rep.segments.clear();
    rep.init = None;
    rep.timescale = Timescale::TICKS;
    rep.sequence_aligned = true;
    rep.loaded = true;
    rep.playlist_url = Some(url.to_string());

    let mut carry = Carry::default();
    let mut live = true;
    let mut start_offset = None;
    let mut anchor_conflict = false;
    let mut time: u64 = 0;

    for line in lines {
        let tag = match line {
            Line::Tag(tag) => tag,
            Line::Uri(uri) => {
                let duration = carry
                    .pending_duration
                    .take()
                    .or(rep.target_duration)
                    .unwrap_or_default()
                    .max(0) as u64;
                let mut segment =
                    Segment::new(carry.sequence, resolve_url(url, uri), time, duration);
                if let Some(range) = carry.pending_range.take() {
                    segment.byte_range = range.resolve(carry.previous_range_end);
                    carry.previous_range_end = segment.byte_range.map(|r| r.end);
                }
                segment.discontinuity = std::mem::take(&mut carry.discontinuity);
                segment.encryption = carry.encryption.clone();
                anchor_conflict |=
                    anchor(&mut rep.segments, &mut segment, carry.pending_anchor.take());

                time += duration;
                carry.sequence += 1;
                rep.segments.push(segment);
                continue;
            }
        };

        match tag.kind {
            TagKind::Inf => carry.pending_duration = tag.inf_duration(),
            TagKind::ByteRange => carry.pending_range = HlsByteRange::parse(&tag.value),
            TagKind::Discontinuity => carry.discontinuity = true,
            TagKind::MediaSequence => {
                carry.sequence = tag.value.trim().parse().unwrap_or_default();
            }
            TagKind::TargetDuration => {
                rep.target_duration = tag.value.trim().parse::<f64>().ok().map(seconds);
            }
            TagKind::PlaylistType => live = tag.value.trim() != "VOD",
            TagKind::EndList => live = false,
            TagKind::ProgramDateTime => carry.pending_anchor = parse_utc(&tag.value),
            TagKind::Key => carry.encryption = key_from(&tag.attributes, url),
            TagKind::Map if rep.init.is_none() => {
                if let Some(uri) = tag.attributes.get("URI") {
                    rep.init = Some(InitSegment {
                        url: resolve_url(url, uri),
                        byte_range: tag
                            .attributes
                            .get("BYTERANGE")
                            .and_then(HlsByteRange::parse)
                            .and_then(|r| r.resolve(None)),
                        encryption: carry.encryption.clone(),
                    });
                }
            }
            TagKind::Start => start_offset = tag.attributes.float("TIME-OFFSET").map(seconds),
            _ => {}
        }
    }

    if rep.init.is_some() {
        rep.format = StreamFormat::Mp4;
    } else if let Some(first) = rep.segments.first() {
        let guessed = StreamFormat::from_extension(&first.url);
        rep.format = if guessed.is_known() {
            guessed
        } else if rep.format.is_known() {
            rep.format
        } else {
            StreamFormat::MpegTs
        };
    }
    rep.live = live;
    rep.revision = template.revision;

    trace!(
        url = %url,
        segments = rep.segments.len(),
        live,
        "Parsed media playlist"
    );

    MediaPlaylist {
        representation: rep,
        live,
        start_offset,
        anchor_conflict,
    }
}

/// Applies a program date-time to `segment` and reverse-propagates it onto
/// earlier segments lacking one. Returns whether it conflicted with the
/// timeline implied by the previous anchor.
fn anchor(history: &mut [Segment], segment: &mut Segment, pdt: Option<Tick>) -> bool {
    let implied = history
        .last()
        .filter(|_| !segment.discontinuity)
        .and_then(|prev| prev.display_time.map(|t| t + prev.duration as Tick));

    let Some(pdt) = pdt else {
        segment.display_time = implied;
        return false;
    };

    let conflict = implied.is_some_and(|t| (t - pdt).abs() > ANCHOR_TOLERANCE);
    segment.display_time = Some(pdt);

    let mut time = pdt;
    for prev in history.iter_mut().rev() {
        if prev.display_time.is_some() {
            break;
        }
        time -= prev.duration as Tick;
        prev.display_time = Some(time.max(0));
    }
    conflict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ID;

    #[test]
    fn media_sequence_and_durations() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:7\n\
                    #EXTINF:6,\na.ts\n#EXTINF:4.5,\nb.ts\nc.ts\n#EXT-X-ENDLIST\n";
        let manifest = parse(text, "http://h/p/index.m3u8").unwrap();
        let rep = &manifest.periods[0].adaptation_sets[0].representations[0];
        let seqs: Vec<_> = rep.segments.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![7, 8, 9]);
        assert_eq!(rep.segments[2].duration, 6 * CLOCK_FREQ as u64);
        assert_eq!(rep.segments[1].start_time, 6 * CLOCK_FREQ as u64);
        assert_eq!(rep.segments[0].url, "http://h/p/a.ts");
        assert!(!manifest.live);
        assert_eq!(manifest.duration, 16_500_000);
        assert_eq!(rep.format, StreamFormat::MpegTs);
    }

    #[test]
    fn key_and_map_carry_forward() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
                    #EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"\n\
                    #EXT-X-KEY:METHOD=AES-128,URI=\"../keys/k1\",IV=0x0A\n\
                    #EXTINF:4,\n1.m4s\n#EXT-X-KEY:METHOD=NONE\n#EXTINF:4,\n2.m4s\n";
        let manifest = parse(text, "http://h/a/b/index.m3u8").unwrap();
        let rep = &manifest.periods[0].adaptation_sets[0].representations[0];
        let init = rep.init.as_ref().unwrap();
        assert_eq!(init.url, "http://h/a/b/init.mp4");
        assert_eq!(init.byte_range.unwrap().len(), 720);
        let key = rep.segments[0].encryption.as_ref().unwrap();
        assert_eq!(key.uri.as_deref(), Some("http://h/a/keys/k1"));
        assert_eq!(key.iv.unwrap()[15], 0x0a);
        assert!(rep.segments[1].encryption.is_none());
        assert!(manifest.live);
        assert_eq!(manifest.duration, 0);
        assert_eq!(manifest.min_update_period, Some(4 * CLOCK_FREQ));
        assert_eq!(rep.format, StreamFormat::Mp4);
    }

    #[test]
    fn program_date_time_propagates_backwards() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n\
                    #EXTINF:2,\na.ts\n#EXTINF:2,\nb.ts\n\
                    #EXT-X-PROGRAM-DATE-TIME:1970-01-01T00:00:10Z\n#EXTINF:2,\nc.ts\n\
                    #EXTINF:2,\nd.ts\n#EXT-X-ENDLIST\n";
        let media =
            parse_media_playlist(text, "http://h/i.m3u8", &Representation::new("x")).unwrap();
        let times: Vec<_> = media
            .representation
            .segments
            .iter()
            .map(|s| s.display_time.unwrap() / CLOCK_FREQ)
            .collect();
        assert_eq!(times, vec![6, 8, 10, 12]);
        assert!(!media.anchor_conflict);
    }

    #[test]
    fn conflicting_anchors_are_flagged_and_latest_wins() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n\
                    #EXT-X-PROGRAM-DATE-TIME:1970-01-01T00:00:10Z\n#EXTINF:2,\na.ts\n\
                    #EXT-X-PROGRAM-DATE-TIME:1970-01-01T00:01:00Z\n#EXTINF:2,\nb.ts\n";
        let media =
            parse_media_playlist(text, "http://h/i.m3u8", &Representation::new("x")).unwrap();
        assert!(media.anchor_conflict);
        assert_eq!(
            media.representation.segments[1].display_time,
            Some(60 * CLOCK_FREQ)
        );
    }

    #[test]
    fn implicit_byterange_offsets_follow_previous_range() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n\
                    #EXTINF:2,\n#EXT-X-BYTERANGE:100@0\nall.ts\n\
                    #EXTINF:2,\n#EXT-X-BYTERANGE:50\nall.ts\n#EXT-X-ENDLIST\n";
        let media =
            parse_media_playlist(text, "http://h/i.m3u8", &Representation::new("x")).unwrap();
        let ranges: Vec<_> = media
            .representation
            .segments
            .iter()
            .map(|s| s.byte_range.map(|r| (r.start, r.end)))
            .collect();
        assert_eq!(ranges, vec![Some((0, 99)), Some((100, 149))]);
    }

    #[test]
    fn renditions_become_adaptation_sets() {
        let text = "#EXTM3U\n\
            #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en-US\",DEFAULT=YES,URI=\"en.m3u8\"\n\
            #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"French\",LANGUAGE=\"fr\",AUTOSELECT=NO,URI=\"fr.m3u8\"\n\
            #EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"sub\",NAME=\"Subs\",URI=\"subs.m3u8\"\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000,AUDIO=\"aud\"\nlow.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=64000\nen.m3u8\n";
        let manifest = parse(text, "http://h/master.m3u8").unwrap();
        let sets = &manifest.periods[0].adaptation_sets;
        assert_eq!(sets.len(), 4);
        assert_eq!(sets[0].representations.len(), 1);
        assert_eq!(sets[1].id, ID::new("aud English"));
        assert_eq!(sets[1].role, Role::Main);
        assert_eq!(sets[1].lang.as_deref(), Some("en"));
        assert_eq!(sets[2].role, Role::Supplementary);
        assert_eq!(sets[3].role, Role::Subtitle);
        assert_eq!(sets[3].content_type, ContentType::Text);
        assert!(sets.iter().all(|s| s.representations.iter().all(|r| !r.loaded)));
    }

    #[test]
    fn missing_header_is_rejected() {
        assert!(matches!(
            parse("#EXTINF:6,\na.ts\n", "http://h/i.m3u8"),
            Err(ParseError::MissingHeader { .. })
        ));
    }
}
