// Smooth Streaming client manifests
use tracing::debug;

use crate::error::ParseError;
use crate::format::{ContentType, StreamFormat};
use crate::model::{
    AdaptationSet, CommonEncryption, EncryptionMethod, Manifest, ManifestKind, Period,
    Representation, Segment,
};
use crate::resolve_url;
use crate::time::{Timescale, seconds};
use crate::xml::{Node, parse_document};

pub const MIME_TYPE: &str = "application/vnd.ms-sstr+xml";

const DEFAULT_TIMESCALE: u64 = 10_000_000;

pub fn looks_like_smooth(text: &str) -> bool {
    text.contains("<SmoothStreamingMedia")
}

pub fn parse(raw: &str, url: &str) -> Result<Manifest, ParseError> {
    let root = parse_document(raw)?;
    if root.name != "SmoothStreamingMedia" {
        return Err(ParseError::MissingHeader {
            expected: "SmoothStreamingMedia",
        });
    }

    let timescale = Timescale::new(root.attr_u64("TimeScale").unwrap_or(DEFAULT_TIMESCALE));
    let mut manifest = Manifest::new(ManifestKind::Smooth, url);
    manifest.live = root.attr_bool("IsLive").unwrap_or(false);
    manifest.duration = root
        .attr_u64("Duration")
        .map(|d| timescale.to_time(d))
        .unwrap_or_default();
    manifest.time_shift_buffer_depth = root
        .attr_u64("DVRWindowLength")
        .filter(|d| *d > 0)
        .map(|d| timescale.to_time(d));
    if manifest.live {
        manifest.duration = 0;
        manifest.min_buffering = Some(seconds(4.0));
    }

    let protection = root.child("Protection").map(|_| CommonEncryption {
        method: EncryptionMethod::Cenc,
        uri: None,
        iv: None,
    });

    let mut period = Period::new("0");
    for (idx, stream) in root.children("StreamIndex").enumerate() {
        let set = stream_index(stream, idx, timescale, url, manifest.live, &protection)?;
        if !set.representations.is_empty() {
            period.adaptation_sets.push(set);
        }
    }
    if period.adaptation_sets.is_empty() {
        return Err(ParseError::Empty { protocol: "Smooth" });
    }
    manifest.periods.push(period);
    if manifest.duration == 0 {
        manifest.refresh_duration();
    }
    debug!(url = %url, live = manifest.live, "Parsed Smooth manifest");
    Ok(manifest)
}

/// Fragment timeline shared by every quality level of a stream.
fn timeline(stream: &Node) -> Result<Vec<(u64, u64)>, ParseError> {
    let chunks: Vec<&Node> = stream.children("c").collect();
    let mut out = Vec::with_capacity(chunks.len());
    let mut cursor = 0u64;
    for (idx, c) in chunks.iter().enumerate() {
        if let Some(t) = c.attr_u64("t") {
            cursor = t;
        }
        let duration = match c.attr_u64("d") {
            Some(d) => d,
            None => chunks
                .get(idx + 1)
                .and_then(|n| n.attr_u64("t"))
                .map(|next| next.saturating_sub(cursor))
                .ok_or_else(|| ParseError::invalid_attribute("c@d", ""))?,
        };
        if duration == 0 {
            return Err(ParseError::invalid_attribute("c@d", "0"));
        }
        let repeat = c.attr_u64("r").unwrap_or(1).max(1);
        for _ in 0..repeat {
            out.push((cursor, duration));
            cursor += duration;
        }
    }
    Ok(out)
}

fn fragment_url(template: &str, bitrate: u64, start: u64) -> String {
    template
        .replace("{bitrate}", &bitrate.to_string())
        .replace("{Bitrate}", &bitrate.to_string())
        .replace("{start time}", &start.to_string())
        .replace("{start_time}", &start.to_string())
}

fn stream_index(
    stream: &Node,
    idx: usize,
    manifest_timescale: Timescale,
    url: &str,
    live: bool,
    protection: &Option<CommonEncryption>,
) -> Result<AdaptationSet, ParseError> {
    let name = stream
        .attr("Name")
        .map(str::to_string)
        .unwrap_or_else(|| format!("stream-{idx}"));
    let mut set = AdaptationSet::new(name.as_str());
    set.content_type = match stream.attr("Type").map(str::to_ascii_lowercase).as_deref() {
        Some("video") => ContentType::Video,
        Some("audio") => ContentType::Audio,
        Some("text") => ContentType::Text,
        _ => ContentType::Unknown,
    };
    if let Some(lang) = stream.attr("Language") {
        set.set_lang(lang);
    }
    set.segment_aligned = true;

    let Some(url_template) = stream.attr("Url") else {
        return Ok(set);
    };
    let timescale = stream
        .attr_u64("TimeScale")
        .map(Timescale::new)
        .unwrap_or(manifest_timescale);
    let fragments = timeline(stream)?;

    for (level_idx, level) in stream.children("QualityLevel").enumerate() {
        let bitrate = level.attr_u64("Bitrate").unwrap_or_default();
        let mut rep = Representation::new(format!("{name}/{bitrate}/{level_idx}"));
        rep.bandwidth = bitrate;
        rep.timescale = timescale;
        rep.format = StreamFormat::Mp4;
        rep.live = live;
        rep.codecs = level
            .attr("FourCC")
            .map(|c| vec![c.to_ascii_lowercase()])
            .unwrap_or_default();
        rep.width = level
            .attr_u64("MaxWidth")
            .or(stream.attr_u64("MaxWidth"))
            .map(|w| w as u32);
        rep.height = level
            .attr_u64("MaxHeight")
            .or(stream.attr_u64("MaxHeight"))
            .map(|h| h as u32);
        rep.encryption = protection.clone();
        rep.segments = fragments
            .iter()
            .enumerate()
            .map(|(n, (start, duration))| {
                Segment::new(
                    n as u64 + 1,
                    resolve_url(url, &fragment_url(url_template, bitrate, *start)),
                    *start,
                    *duration,
                )
            })
            .collect();
        rep.target_duration = fragments
            .iter()
            .map(|(_, d)| timescale.to_time(*d))
            .max();
        set.add_representation(rep);
    }
    Ok(set)
}
