// First HLS pass: directive lines to typed tags with attribute lists
use std::str::FromStr;

use strum::{Display, EnumString};

use crate::model::ByteRange;
use crate::time::{Tick, seconds};

/// Tags the builder understands. Anything else is dropped while tokenizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub(crate) enum TagKind {
    #[strum(serialize = "EXTINF")]
    Inf,
    #[strum(serialize = "EXT-X-BYTERANGE")]
    ByteRange,
    #[strum(serialize = "EXT-X-DISCONTINUITY")]
    Discontinuity,
    #[strum(serialize = "EXT-X-DISCONTINUITY-SEQUENCE")]
    DiscontinuitySequence,
    #[strum(serialize = "EXT-X-KEY")]
    Key,
    #[strum(serialize = "EXT-X-SESSION-KEY")]
    SessionKey,
    #[strum(serialize = "EXT-X-MAP")]
    Map,
    #[strum(serialize = "EXT-X-PROGRAM-DATE-TIME")]
    ProgramDateTime,
    #[strum(serialize = "EXT-X-TARGETDURATION")]
    TargetDuration,
    #[strum(serialize = "EXT-X-MEDIA-SEQUENCE")]
    MediaSequence,
    #[strum(serialize = "EXT-X-ENDLIST")]
    EndList,
    #[strum(serialize = "EXT-X-PLAYLIST-TYPE")]
    PlaylistType,
    #[strum(serialize = "EXT-X-I-FRAMES-ONLY")]
    IFramesOnly,
    #[strum(serialize = "EXT-X-MEDIA")]
    Media,
    #[strum(serialize = "EXT-X-STREAM-INF")]
    StreamInf,
    #[strum(serialize = "EXT-X-I-FRAME-STREAM-INF")]
    IFrameStreamInf,
    #[strum(serialize = "EXT-X-START")]
    Start,
    #[strum(serialize = "EXT-X-INDEPENDENT-SEGMENTS")]
    IndependentSegments,
    #[strum(serialize = "EXT-X-VERSION")]
    Version,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Attribute {
    pub name: String,
    pub value: String,
}

/// `NAME=VALUE` list with quoted values unwrapped.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct AttributeList(Vec<Attribute>);

impl AttributeList {
    pub fn parse(input: &str) -> Self {
        let mut attrs = Vec::new();
        let mut rest = input.trim();

        while !rest.is_empty() {
            let Some(eq) = rest.find('=') else {
                break;
            };
            let name = rest[..eq].trim().trim_start_matches(',').trim().to_string();
            rest = &rest[eq + 1..];

            let value;
            if let Some(quoted) = rest.strip_prefix('"') {
                match quoted.find('"') {
                    Some(end) => {
                        value = quoted[..end].to_string();
                        rest = &quoted[end + 1..];
                    }
                    None => {
                        value = quoted.to_string();
                        rest = "";
                    }
                }
            } else {
                let end = rest.find(',').unwrap_or(rest.len());
                value = rest[..end].trim().to_string();
                rest = &rest[end..];
            }
            rest = rest.trim_start_matches([',', ' ', '\t']);

            if !name.is_empty() {
                attrs.push(Attribute { name, value });
            }
        }
        Self(attrs)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|a| a.name == name) {
            Some(attr) => attr.value = value,
            None => self.0.push(Attribute {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn decimal(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).map(|v| v.eq_ignore_ascii_case("YES"))
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        let (w, h) = self.get("RESOLUTION")?.split_once(['x', 'X'])?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }

    pub fn codecs(&self) -> Vec<String> {
        self.get("CODECS")
            .map(|c| {
                c.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `0x`-prefixed 128-bit hex string.
    pub fn iv(&self) -> Option<[u8; 16]> {
        let raw = self.get("IV")?.trim();
        let raw = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        let padded = format!("{raw:0>32}");
        let bytes = hex::decode(padded).ok()?;
        bytes.try_into().ok()
    }
}

/// Byte range written as `length[@offset]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HlsByteRange {
    pub length: u64,
    pub offset: Option<u64>,
}

impl HlsByteRange {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (length, offset) = match value.split_once('@') {
            Some((l, o)) => (l, Some(o.trim().parse().ok()?)),
            None => (value, None),
        };
        Some(Self {
            length: length.trim().parse().ok()?,
            offset,
        })
    }

    /// Resolves against the end of the previous sub-range of the same resource.
    pub fn resolve(&self, previous_end: Option<u64>) -> Option<ByteRange> {
        let offset = match self.offset {
            Some(offset) => offset,
            None => previous_end.map(|end| end + 1).unwrap_or(0),
        };
        ByteRange::from_length(offset, self.length)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Tag {
    pub kind: TagKind,
    /// Raw text after the colon.
    pub value: String,
    pub attributes: AttributeList,
}

impl Tag {
    /// EXTINF duration in ticks.
    pub fn inf_duration(&self) -> Option<Tick> {
        let duration = self.value.split(',').next()?.trim();
        duration
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(seconds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Line {
    Tag(Tag),
    Uri(String),
}

/// Checks the `#EXTM3U` magic: it must be followed by a line end or whitespace.
pub(crate) fn has_header(text: &str) -> bool {
    let text = text.trim_start_matches('\u{feff}');
    match text.strip_prefix("#EXTM3U") {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}

fn tag_with_attributes(kind: TagKind) -> bool {
    matches!(
        kind,
        TagKind::Key
            | TagKind::SessionKey
            | TagKind::Map
            | TagKind::Media
            | TagKind::StreamInf
            | TagKind::IFrameStreamInf
            | TagKind::Start
    )
}

/// Tokenizes a playlist body. A URI line following `EXT-X-STREAM-INF`
/// becomes its `URI` attribute; blank lines break that association.
pub(crate) fn tokenize(text: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut awaiting_variant_uri = false;

    for raw in text.lines().skip(1) {
        let line = raw.trim();
        if line.is_empty() {
            awaiting_variant_uri = false;
            continue;
        }

        if let Some(directive) = line.strip_prefix('#') {
            if !directive.starts_with("EXT") {
                continue;
            }
            let (name, value) = directive.split_once(':').unwrap_or((directive, ""));
            let Ok(kind) = TagKind::from_str(name.trim()) else {
                continue;
            };
            let attributes = if tag_with_attributes(kind) {
                AttributeList::parse(value)
            } else {
                AttributeList::default()
            };
            awaiting_variant_uri = kind == TagKind::StreamInf;
            lines.push(Line::Tag(Tag {
                kind,
                value: value.to_string(),
                attributes,
            }));
            continue;
        }

        if awaiting_variant_uri {
            if let Some(Line::Tag(tag)) = lines.last_mut() {
                tag.attributes.set("URI", line);
            }
            awaiting_variant_uri = false;
        } else {
            lines.push(Line::Uri(line.to_string()));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_list_handles_quoted_commas() {
        let attrs = AttributeList::parse(
            r#"BANDWIDTH=1280000,CODECS="avc1.4d401f,mp4a.40.2",RESOLUTION=640x360"#,
        );
        assert_eq!(attrs.decimal("BANDWIDTH"), Some(1_280_000));
        assert_eq!(attrs.codecs(), vec!["avc1.4d401f", "mp4a.40.2"]);
        assert_eq!(attrs.resolution(), Some((640, 360)));
    }

    #[test]
    fn iv_is_left_padded() {
        let attrs = AttributeList::parse("METHOD=AES-128,URI=\"k\",IV=0x1");
        let iv = attrs.iv().unwrap();
        assert_eq!(iv[15], 1);
        assert_eq!(iv[0], 0);
    }

    #[test]
    fn header_requires_separator() {
        assert!(has_header("#EXTM3U\n"));
        assert!(has_header("#EXTM3U"));
        assert!(has_header("\u{feff}#EXTM3U\r\n"));
        assert!(!has_header("#EXTM3UX\n"));
        assert!(!has_header("#EXTINF:6,\n"));
    }

    #[test]
    fn variant_uri_attached_to_stream_inf() {
        let lines = tokenize(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n#EXT-X-UNKNOWN:1\n#EXTINF:6,\nseg.ts\n",
        );
        assert_eq!(lines.len(), 3);
        match &lines[0] {
            Line::Tag(tag) => assert_eq!(tag.attributes.get("URI"), Some("low.m3u8")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(lines[2], Line::Uri("seg.ts".into()));
    }

    #[test]
    fn byterange_offsets() {
        let explicit = HlsByteRange::parse("100@50").unwrap();
        assert_eq!(explicit.resolve(None), Some(ByteRange::new(50, 149)));
        let implicit = HlsByteRange::parse("10").unwrap();
        assert_eq!(implicit.resolve(Some(149)), Some(ByteRange::new(150, 159)));
        assert_eq!(implicit.resolve(None), Some(ByteRange::new(0, 9)));
    }

    #[test]
    fn inf_duration_parses_fractional() {
        let tag = Tag {
            kind: TagKind::Inf,
            value: "5.005,title".into(),
            attributes: AttributeList::default(),
        };
        assert_eq!(tag.inf_duration(), Some(5_005_000));
    }
}
