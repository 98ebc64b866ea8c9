// Container format detection from mime types, codec strings and file extensions
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Canonical container format of a representation's segments.
///
/// The string form is the name demuxer factories are keyed by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    #[default]
    Unknown,
    #[strum(serialize = "ts")]
    MpegTs,
    Mp4,
    #[strum(serialize = "aac")]
    PackedAac,
    #[strum(serialize = "mp3")]
    PackedMp3,
    #[strum(serialize = "ac3")]
    PackedAc3,
    WebVtt,
    Ttml,
    Ogg,
    Unsupported,
}

impl StreamFormat {
    /// Maps a MIME type such as `video/mp4` or `application/ttml+xml`.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim().to_ascii_lowercase();
        let mime = mime.split(';').next().unwrap_or_default();
        match mime {
            "video/mp4" | "audio/mp4" | "application/mp4" | "video/iso.segment"
            | "audio/iso.segment" => Self::Mp4,
            "video/mp2t" | "video/mpeg2-ts" => Self::MpegTs,
            "audio/aac" | "audio/x-aac" => Self::PackedAac,
            "audio/mpeg" => Self::PackedMp3,
            "audio/ac3" | "audio/eac3" => Self::PackedAc3,
            "text/vtt" => Self::WebVtt,
            "application/ttml+xml" => Self::Ttml,
            "video/ogg" | "audio/ogg" | "application/ogg" => Self::Ogg,
            "" => Self::Unknown,
            _ => Self::Unsupported,
        }
    }

    /// Guesses from the path extension of a segment URL.
    pub fn from_extension(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let Some((_, ext)) = path.rsplit_once('.') else {
            return Self::Unknown;
        };
        if ext.contains('/') {
            return Self::Unknown;
        }
        match ext.to_ascii_lowercase().as_str() {
            "ts" | "m2ts" | "mts" => Self::MpegTs,
            "mp4" | "m4s" | "m4a" | "m4v" | "cmfv" | "cmfa" | "fmp4" => Self::Mp4,
            "aac" => Self::PackedAac,
            "mp3" => Self::PackedMp3,
            "ac3" | "ec3" => Self::PackedAc3,
            "vtt" | "webvtt" => Self::WebVtt,
            "ttml" | "dfxp" => Self::Ttml,
            "ogg" | "oga" | "opus" => Self::Ogg,
            _ => Self::Unknown,
        }
    }

    /// Text track formats carried by subtitle renditions.
    pub fn from_codecs(codecs: &[String]) -> Self {
        codecs
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .find_map(|c| match c.as_str() {
                "wvtt" => Some(Self::WebVtt),
                "stpp" | "stpp.ttml.im1t" => Some(Self::Ttml),
                _ => None,
            })
            .unwrap_or(Self::Unknown)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown | Self::Unsupported)
    }

    /// Text formats are never eligible for bitstream switching.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::WebVtt | Self::Ttml)
    }
}

/// Kind of elementary content an adaptation set carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ContentType {
    #[default]
    Unknown,
    Video,
    Audio,
    Text,
}

impl ContentType {
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else if mime.starts_with("text/") || mime.contains("ttml") {
            Self::Text
        } else {
            Self::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case("http://a/b/seg-1.ts", StreamFormat::MpegTs)]
    #[case("http://a/b/seg-1.m4s?token=x", StreamFormat::Mp4)]
    #[case("audio.aac", StreamFormat::PackedAac)]
    #[case("http://a/b.dir/segment", StreamFormat::Unknown)]
    #[case("subs.vtt#frag", StreamFormat::WebVtt)]
    fn detects_extension(#[case] url: &str, #[case] expected: StreamFormat) {
        assert_eq!(StreamFormat::from_extension(url), expected);
    }

    #[test]
    fn mime_and_names() {
        assert_eq!(
            StreamFormat::from_mime("video/mp4; codecs=\"avc1\""),
            StreamFormat::Mp4
        );
        assert_eq!(StreamFormat::from_mime("video/x-flv"), StreamFormat::Unsupported);
        assert_eq!(StreamFormat::MpegTs.to_string(), "ts");
        assert_eq!(StreamFormat::from_str("mp4").unwrap(), StreamFormat::Mp4);
        assert_eq!(ContentType::from_mime("audio/mp4"), ContentType::Audio);
    }
}
