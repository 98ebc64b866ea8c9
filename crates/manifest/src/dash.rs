// DASH MPD: periods, adaptation sets and segment addressing schemes
use std::str::FromStr;

use tracing::{debug, trace, warn};

use crate::error::ParseError;
use crate::format::{ContentType, StreamFormat};
use crate::model::{
    AdaptationSet, ByteRange, CommonEncryption, EncryptionMethod, InitSegment, Manifest,
    ManifestKind, Period, Representation, Role, Segment,
};
use crate::resolve_url;
use crate::time::{Tick, Timescale, now_utc, parse_iso8601_duration, parse_utc};
use crate::xml::{Node, parse_document};

pub const MIME_TYPE: &str = "application/dash+xml";

/// Window exposed for a live `@duration` template without `timeShiftBufferDepth`.
const DEFAULT_LIVE_WINDOW: Tick = 30 * crate::time::CLOCK_FREQ;

/// Upper bound of segments expanded for one representation.
pub const MAX_SEGMENTS_PER_REPRESENTATION: usize = 100_000;

pub fn looks_like_mpd(text: &str) -> bool {
    text.contains("<MPD") || text.contains(":MPD")
}

/// Parses an MPD, expanding live templates against the current wall clock.
pub fn parse(raw: &str, url: &str) -> Result<Manifest, ParseError> {
    parse_at(raw, url, now_utc())
}

/// Parses an MPD as seen at wall clock `now` (ticks since the epoch).
pub fn parse_at(raw: &str, url: &str, now: Tick) -> Result<Manifest, ParseError> {
    let root = parse_document(raw)?;
    if root.name != "MPD" {
        return Err(ParseError::MissingHeader { expected: "MPD" });
    }

    let mut manifest = Manifest::new(ManifestKind::Dash, url);
    manifest.live = root.attr("type") == Some("dynamic");
    manifest.duration = optional_duration(&root, "mediaPresentationDuration").unwrap_or_default();
    manifest.min_update_period = optional_duration(&root, "minimumUpdatePeriod");
    manifest.min_buffering = optional_duration(&root, "minBufferTime");
    manifest.time_shift_buffer_depth = optional_duration(&root, "timeShiftBufferDepth");
    manifest.suggested_presentation_delay = optional_duration(&root, "suggestedPresentationDelay");
    manifest.availability_start_time = root.attr("availabilityStartTime").and_then(parse_utc);

    let base = base_url(&root, url);
    let period_nodes: Vec<&Node> = root.children("Period").collect();
    let multi_period = period_nodes.len() > 1;

    let mut starts = Vec::with_capacity(period_nodes.len());
    let mut cursor = 0;
    for node in &period_nodes {
        let start = duration_attr(node, "start")?.unwrap_or(cursor);
        let own = duration_attr(node, "duration")?;
        starts.push((start, own));
        cursor = start + own.unwrap_or_default();
    }

    for (idx, node) in period_nodes.iter().enumerate() {
        let (start, own) = starts[idx];
        let duration = own.or_else(|| match starts.get(idx + 1) {
            Some((next, _)) => Some(next - start),
            None if manifest.duration > 0 => Some(manifest.duration - start),
            None => None,
        });
        let id = node
            .attr("id")
            .map(str::to_string)
            .unwrap_or_else(|| idx.to_string());
        let mut period = Period::new(id.as_str());
        period.start = start;
        period.duration = duration;

        let ctx = PeriodContext {
            id: &id,
            prefix_ids: multi_period,
            start,
            duration,
            base: base_url(node, &base),
            live: manifest.live,
            availability_start: manifest.availability_start_time,
            window: manifest.time_shift_buffer_depth.unwrap_or(DEFAULT_LIVE_WINDOW),
            now,
        };
        for (set_idx, set_node) in node.children("AdaptationSet").enumerate() {
            let set = adaptation_set(&ctx, set_node, set_idx)?;
            if !set.representations.is_empty() {
                period.adaptation_sets.push(set);
            }
        }
        manifest.periods.push(period);
    }

    if manifest.periods.iter().all(|p| p.adaptation_sets.is_empty()) {
        return Err(ParseError::Empty { protocol: "DASH" });
    }
    if manifest.duration == 0 {
        manifest.refresh_duration();
    }
    debug!(
        url = %url,
        live = manifest.live,
        periods = manifest.periods.len(),
        "Parsed DASH manifest"
    );
    Ok(manifest)
}

struct PeriodContext<'a> {
    id: &'a str,
    prefix_ids: bool,
    start: Tick,
    duration: Option<Tick>,
    base: String,
    live: bool,
    availability_start: Option<Tick>,
    window: Tick,
    now: Tick,
}

fn duration_attr(node: &Node, name: &str) -> Result<Option<Tick>, ParseError> {
    match node.attr(name) {
        None => Ok(None),
        Some(value) => parse_iso8601_duration(value)
            .map(Some)
            .ok_or_else(|| ParseError::invalid_attribute(name, value)),
    }
}

/// MPD level durations are hints: an unusable value (calendar years or
/// months) leaves them unknown instead of failing the document.
fn optional_duration(node: &Node, name: &str) -> Option<Tick> {
    match duration_attr(node, name) {
        Ok(value) => value,
        Err(e) => {
            warn!(attribute = name, error = %e, "Ignoring MPD duration");
            None
        }
    }
}

fn base_url(node: &Node, parent: &str) -> String {
    match node.child("BaseURL").map(Node::text) {
        Some(base) if !base.is_empty() => resolve_url(parent, base),
        _ => parent.to_string(),
    }
}

fn frame_rate(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => value.trim().parse().ok(),
    }
}

fn role_of(node: &Node) -> Role {
    node.children("Role")
        .filter_map(|r| r.attr("value"))
        .find_map(|v| Role::from_str(v).ok())
        .unwrap_or_default()
}

fn protection_of(node: &Node) -> Option<CommonEncryption> {
    node.child("ContentProtection").map(|_| CommonEncryption {
        method: EncryptionMethod::Cenc,
        uri: None,
        iv: None,
    })
}

/// Representation-level node overriding attributes and children of the set level.
fn inherited<'a>(own: Option<&'a Node>, parent: Option<&'a Node>) -> Option<Node> {
    match (own, parent) {
        (None, None) => None,
        (Some(n), None) | (None, Some(n)) => Some(n.clone()),
        (Some(own), Some(parent)) => {
            let mut merged = own.clone();
            for (k, v) in &parent.attributes {
                if merged.attr(k).is_none() {
                    merged.attributes.push((k.clone(), v.clone()));
                }
            }
            for child in &parent.children {
                if merged.child(&child.name).is_none() {
                    merged.children.push(child.clone());
                }
            }
            Some(merged)
        }
    }
}

fn adaptation_set(
    ctx: &PeriodContext<'_>,
    node: &Node,
    idx: usize,
) -> Result<AdaptationSet, ParseError> {
    let id = node
        .attr("id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{idx}", ctx.id));
    let mut set = AdaptationSet::new(id);
    let mime = node.attr("mimeType").unwrap_or_default();
    set.content_type = node
        .attr("contentType")
        .and_then(|c| ContentType::from_str(c).ok())
        .unwrap_or_else(|| ContentType::from_mime(mime));
    if let Some(lang) = node.attr("lang") {
        set.set_lang(lang);
    }
    set.role = role_of(node);
    set.segment_aligned = node.attr_bool("segmentAlignment").unwrap_or(false);
    set.bitswitchable = node
        .attr_bool("bitstreamSwitching")
        .unwrap_or(set.segment_aligned);
    set.description = node.child("Label").map(|l| l.text().to_string());

    let base = base_url(node, &ctx.base);
    let protection = protection_of(node);

    for (rep_idx, rep_node) in node.children("Representation").enumerate() {
        let raw_id = rep_node
            .attr("id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{rep_idx}", set.id));
        let id = if ctx.prefix_ids {
            format!("{}/{raw_id}", ctx.id)
        } else {
            raw_id.clone()
        };
        let mut rep = Representation::new(id);
        rep.bandwidth = rep_node.attr_u64("bandwidth").unwrap_or_default();
        rep.width = rep_node.attr_u64("width").or(node.attr_u64("width")).map(|v| v as u32);
        rep.height = rep_node.attr_u64("height").or(node.attr_u64("height")).map(|v| v as u32);
        rep.frame_rate = rep_node
            .attr("frameRate")
            .or(node.attr("frameRate"))
            .and_then(frame_rate);
        rep.codecs = rep_node
            .attr("codecs")
            .or(node.attr("codecs"))
            .map(|c| c.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        let rep_mime = rep_node.attr("mimeType").unwrap_or(mime);
        rep.format = StreamFormat::from_mime(rep_mime);
        if !rep.format.is_known() {
            let by_codec = StreamFormat::from_codecs(&rep.codecs);
            if by_codec.is_known() {
                rep.format = by_codec;
            }
        }
        if set.content_type == ContentType::Unknown {
            set.content_type = ContentType::from_mime(rep_mime);
        }
        rep.live = ctx.live;
        rep.encryption = protection_of(rep_node).or_else(|| protection.clone());

        let rep_base = base_url(rep_node, &base);
        let addressing = Addressing {
            rep_id: &raw_id,
            bandwidth: rep.bandwidth,
            base: &rep_base,
        };

        if let Some(template) =
            inherited(rep_node.child("SegmentTemplate"), node.child("SegmentTemplate"))
        {
            expand_template(ctx, &addressing, &template, &mut rep)?;
        } else if let Some(list) =
            inherited(rep_node.child("SegmentList"), node.child("SegmentList"))
        {
            expand_list(ctx, &addressing, &list, &mut rep);
        } else {
            let segment_base = inherited(rep_node.child("SegmentBase"), node.child("SegmentBase"));
            single_resource(ctx, &addressing, segment_base.as_ref(), &mut rep);
        }

        rep.target_duration = rep
            .segments
            .iter()
            .map(|s| rep.duration_of(s))
            .max();
        trace!(id = %rep.id, segments = rep.segments.len(), "DASH representation");
        set.add_representation(rep);
    }
    Ok(set)
}

struct Addressing<'a> {
    rep_id: &'a str,
    bandwidth: u64,
    base: &'a str,
}

impl Addressing<'_> {
    fn url(&self, template: &str, number: Option<u64>, time: Option<u64>) -> String {
        resolve_url(self.base, &substitute(template, self.rep_id, self.bandwidth, number, time))
    }
}

/// Expands `$Identifier$` and `$Identifier%0Nd$` template markers.
pub(crate) fn substitute(
    template: &str,
    rep_id: &str,
    bandwidth: u64,
    number: Option<u64>,
    time: Option<u64>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('$') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('$') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let token = &after[..close];
        let (name, width) = match token.split_once('%') {
            Some((name, fmt)) => (
                name,
                fmt.trim_start_matches('0')
                    .trim_end_matches('d')
                    .parse::<usize>()
                    .unwrap_or(0),
            ),
            None => (token, 0),
        };
        let value = match name {
            "" => Some("$".to_string()),
            "RepresentationID" => Some(rep_id.to_string()),
            "Number" => number.map(|n| n.to_string()),
            "Time" => time.map(|t| t.to_string()),
            "Bandwidth" => Some(bandwidth.to_string()),
            _ => None,
        };
        match value {
            Some(v) if name.is_empty() || name == "RepresentationID" => out.push_str(&v),
            Some(v) => out.push_str(&format!("{v:0>width$}")),
            None => {
                out.push('$');
                out.push_str(token);
                out.push('$');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn init_from(
    addressing: &Addressing<'_>,
    template: &Node,
    encryption: Option<CommonEncryption>,
) -> Option<InitSegment> {
    if let Some(init) = template.attr("initialization") {
        return Some(InitSegment {
            url: addressing.url(init, None, None),
            byte_range: None,
            encryption,
        });
    }
    let node = template.child("Initialization")?;
    let url = match node.attr("sourceURL") {
        Some(src) => addressing.url(src, None, None),
        None => addressing.base.to_string(),
    };
    Some(InitSegment {
        url,
        byte_range: node.attr("range").and_then(ByteRange::parse_dash),
        encryption,
    })
}

fn expand_template(
    ctx: &PeriodContext<'_>,
    addressing: &Addressing<'_>,
    template: &Node,
    rep: &mut Representation,
) -> Result<(), ParseError> {
    let timescale = Timescale::new(template.attr_u64("timescale").unwrap_or(1));
    rep.timescale = timescale;
    let start_number = template.attr_u64("startNumber").unwrap_or(1);
    let pto = template.attr_u64("presentationTimeOffset").unwrap_or(0);
    let period_offset = timescale.to_scaled(ctx.start);
    rep.init = init_from(addressing, template, rep.encryption.clone());

    let Some(media) = template.attr("media") else {
        warn!(id = %rep.id, "SegmentTemplate without media attribute");
        return Ok(());
    };

    if let Some(timeline) = template.child("SegmentTimeline") {
        let period_end = ctx
            .duration
            .map(|d| pto + timescale.to_scaled(d));
        let entries: Vec<&Node> = timeline.children("S").collect();
        let mut cursor = 0u64;
        let mut number = start_number;
        for (idx, s) in entries.iter().enumerate() {
            let Some(d) = s.attr_u64("d").filter(|d| *d > 0) else {
                return Err(ParseError::invalid_attribute(
                    "S@d",
                    s.attr("d").unwrap_or_default(),
                ));
            };
            if let Some(t) = s.attr_u64("t") {
                cursor = t;
            }
            let repeat = s.attr_i64("r").unwrap_or(0);
            let count = if repeat >= 0 {
                let declared = (repeat as u64).saturating_add(1);
                match period_end {
                    Some(end) => declared.min(end.saturating_sub(cursor).div_ceil(d)),
                    None => declared,
                }
            } else {
                let limit = entries
                    .get(idx + 1)
                    .and_then(|n| n.attr_u64("t"))
                    .or(period_end)
                    .or_else(|| {
                        ctx.live.then(|| {
                            let elapsed = ctx.now
                                - ctx.availability_start.unwrap_or(ctx.now)
                                - ctx.start;
                            pto + timescale.to_scaled(elapsed)
                        })
                    })
                    .unwrap_or(cursor + d);
                limit.saturating_sub(cursor).div_ceil(d).max(1)
            };
            let room = MAX_SEGMENTS_PER_REPRESENTATION - rep.segments.len();
            if count > room as u64 {
                warn!(
                    id = %rep.id,
                    declared = count,
                    limit = MAX_SEGMENTS_PER_REPRESENTATION,
                    "SegmentTimeline truncated"
                );
            }
            for _ in 0..count.min(room as u64) {
                let url = addressing.url(media, Some(number), Some(cursor));
                let start = cursor.saturating_sub(pto) + period_offset;
                rep.segments.push(Segment::new(number, url, start, d));
                cursor += d;
                number += 1;
            }
            if rep.segments.len() >= MAX_SEGMENTS_PER_REPRESENTATION {
                break;
            }
        }
        return Ok(());
    }

    let Some(duration) = template.attr_u64("duration").filter(|d| *d > 0) else {
        warn!(id = %rep.id, "SegmentTemplate has neither timeline nor duration");
        return Ok(());
    };
    let seg_ticks = timescale.to_time(duration).max(1);

    let (first, last) = match (ctx.live, ctx.availability_start) {
        (true, Some(ast)) => {
            let elapsed = ctx.now - ast - ctx.start;
            if elapsed < seg_ticks {
                return Ok(());
            }
            let available = (elapsed / seg_ticks) as u64;
            let window = (ctx.window / seg_ticks).max(1) as u64;
            let last = start_number + available - 1;
            (last.saturating_sub(window - 1).max(start_number), last)
        }
        _ => {
            let Some(total) = ctx.duration else {
                warn!(id = %rep.id, "Cannot expand template without a period duration");
                return Ok(());
            };
            let count = timescale.to_scaled(total).div_ceil(duration);
            if count == 0 {
                return Ok(());
            }
            (start_number, start_number + count - 1)
        }
    };

    let limit = first.saturating_add(MAX_SEGMENTS_PER_REPRESENTATION as u64 - 1);
    if last > limit {
        warn!(
            id = %rep.id,
            declared = last - first + 1,
            limit = MAX_SEGMENTS_PER_REPRESENTATION,
            "SegmentTemplate truncated"
        );
    }
    for number in first..=last.min(limit) {
        let offset = (number - start_number) * duration;
        let url = addressing.url(media, Some(number), Some(offset + pto));
        rep.segments
            .push(Segment::new(number, url, offset + period_offset, duration));
    }
    Ok(())
}

fn expand_list(
    ctx: &PeriodContext<'_>,
    addressing: &Addressing<'_>,
    list: &Node,
    rep: &mut Representation,
) {
    let timescale = Timescale::new(list.attr_u64("timescale").unwrap_or(1));
    rep.timescale = timescale;
    rep.init = init_from(addressing, list, rep.encryption.clone());
    let start_number = list.attr_u64("startNumber").unwrap_or(1);
    let urls: Vec<&Node> = list.children("SegmentURL").collect();
    let duration = list.attr_u64("duration").unwrap_or_else(|| {
        let total = ctx.duration.map(|d| timescale.to_scaled(d)).unwrap_or_default();
        total / urls.len().max(1) as u64
    });
    let period_offset = timescale.to_scaled(ctx.start);

    for (idx, node) in urls.iter().enumerate() {
        let url = match node.attr("media") {
            Some(media) => resolve_url(addressing.base, media),
            None => addressing.base.to_string(),
        };
        let mut segment = Segment::new(
            start_number + idx as u64,
            url,
            period_offset + idx as u64 * duration,
            duration,
        );
        segment.byte_range = node.attr("mediaRange").and_then(ByteRange::parse_dash);
        rep.segments.push(segment);
    }
}

fn single_resource(
    ctx: &PeriodContext<'_>,
    addressing: &Addressing<'_>,
    segment_base: Option<&Node>,
    rep: &mut Representation,
) {
    let timescale = Timescale::new(
        segment_base
            .and_then(|b| b.attr_u64("timescale"))
            .unwrap_or(1_000_000),
    );
    rep.timescale = timescale;
    if let Some(base) = segment_base {
        rep.init = init_from(addressing, base, rep.encryption.clone());
    }
    let duration = ctx.duration.map(|d| timescale.to_scaled(d)).unwrap_or_default();
    rep.segments.push(Segment::new(
        1,
        addressing.base,
        timescale.to_scaled(ctx.start),
        duration,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::CLOCK_FREQ;

    #[test]
    fn template_substitution() {
        assert_eq!(
            substitute("$RepresentationID$/seg-$Number%05d$.m4s", "v1", 0, Some(42), None),
            "v1/seg-00042.m4s"
        );
        assert_eq!(
            substitute("t$Time$-$Bandwidth$$$x", "v", 800, None, Some(9)),
            "t9-800$x"
        );
        assert_eq!(substitute("$Unknown$", "v", 0, None, None), "$Unknown$");
    }

    #[test]
    fn live_duration_template_window() {
        let mpd = r#"<MPD type="dynamic" availabilityStartTime="1970-01-01T00:00:00Z"
                timeShiftBufferDepth="PT10S" minimumUpdatePeriod="PT2S">
              <Period id="p" start="PT0S">
                <AdaptationSet mimeType="video/mp4">
                  <SegmentTemplate media="s$Number$.m4s" initialization="i.mp4"
                      duration="2" timescale="1" startNumber="1"/>
                  <Representation id="v" bandwidth="1000"/>
                </AdaptationSet>
              </Period>
            </MPD>"#;
        let manifest = parse_at(mpd, "http://h/live.mpd", 100 * CLOCK_FREQ).unwrap();
        let rep = &manifest.periods[0].adaptation_sets[0].representations[0];
        assert!(manifest.live);
        assert_eq!(rep.first_sequence(), Some(46));
        assert_eq!(rep.last_sequence(), Some(50));
        assert_eq!(rep.init.as_ref().unwrap().url, "http://h/i.mp4");
        assert_eq!(manifest.min_update_period, Some(2 * CLOCK_FREQ));
    }

    #[test]
    fn timeline_repeat_is_clipped_to_the_period() {
        let mpd = r#"<MPD type="static" mediaPresentationDuration="PT10S">
              <Period>
                <AdaptationSet mimeType="video/mp4">
                  <SegmentTemplate media="s$Number$.m4s" timescale="1">
                    <SegmentTimeline><S t="0" d="1" r="50000000"/></SegmentTimeline>
                  </SegmentTemplate>
                  <Representation id="v" bandwidth="1000"/>
                </AdaptationSet>
              </Period>
            </MPD>"#;
        let manifest = parse(mpd, "http://h/vod.mpd").unwrap();
        let rep = &manifest.periods[0].adaptation_sets[0].representations[0];
        assert_eq!(rep.segments.len(), 10);
        assert_eq!(rep.last_sequence(), Some(10));
    }

    #[test]
    fn unbounded_timeline_is_capped() {
        let mpd = r#"<MPD type="static">
              <Period>
                <AdaptationSet mimeType="video/mp4">
                  <SegmentTemplate media="s$Number$.m4s" timescale="1">
                    <SegmentTimeline><S t="0" d="1" r="50000000"/></SegmentTimeline>
                  </SegmentTemplate>
                  <Representation id="v" bandwidth="1000"/>
                </AdaptationSet>
              </Period>
            </MPD>"#;
        let manifest = parse(mpd, "http://h/vod.mpd").unwrap();
        let rep = &manifest.periods[0].adaptation_sets[0].representations[0];
        assert_eq!(rep.segments.len(), MAX_SEGMENTS_PER_REPRESENTATION);
    }

    #[test]
    fn calendar_durations_are_ignored() {
        let mpd = r#"<MPD type="static" mediaPresentationDuration="P1Y">
              <Period duration="PT4S">
                <AdaptationSet mimeType="video/mp4">
                  <SegmentTemplate media="s$Number$.m4s" duration="2" timescale="1"/>
                  <Representation id="v" bandwidth="1000"/>
                </AdaptationSet>
              </Period>
            </MPD>"#;
        let manifest = parse(mpd, "http://h/vod.mpd").unwrap();
        assert_eq!(manifest.duration, 4 * CLOCK_FREQ);
        assert_eq!(manifest.periods[0].adaptation_sets[0].representations[0].segments.len(), 2);
    }

    #[test]
    fn rejects_wrong_root() {
        assert!(matches!(
            parse("<SmoothStreamingMedia/>", "http://h/m"),
            Err(ParseError::MissingHeader { expected: "MPD" })
        ));
    }
}
