//! # Manifest
//!
//! Protocol-neutral model of adaptive streaming presentations together with
//! parsers for HLS playlists, DASH MPDs and Smooth Streaming manifests.
//!
//! Parsing is a pure function of the document text and the URL it was fetched
//! from: no I/O happens here. Live presentations are refreshed by parsing the
//! new document and merging it into the current model with [`merge`].
//!
//! ## Features
//!
//! - Period / adaptation set / representation / segment tree shared by all protocols
//! - Two-pass HLS parser (tokenize, then build with carried context)
//! - DASH `SegmentTemplate`, `SegmentTimeline`, `SegmentList` and `SegmentBase` addressing
//! - Idempotent live window merging with absolute-time anchor conflict detection
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod dash;
mod error;
mod format;
pub mod hls;
pub mod merge;
mod model;
pub mod smooth;
pub mod time;
mod xml;

pub use error::ParseError;
pub use format::{ContentType, StreamFormat};
pub use merge::{MergeOutcome, merge_manifest, merge_representation};
pub use model::{
    AdaptationSet, ByteRange, CommonEncryption, EncryptionMethod, ID, InitSegment, Manifest,
    ManifestKind, Period, Representation, Role, Segment,
};
pub use time::{CLOCK_FREQ, Tick, Timescale};

use url::Url;

/// Resolves `reference` against the document it appeared in.
pub fn resolve_url(base: &str, reference: &str) -> String {
    if let Ok(absolute) = Url::parse(reference) {
        return absolute.into();
    }
    match Url::parse(base).and_then(|b| b.join(reference)) {
        Ok(joined) => joined.into(),
        Err(_) => match base.rfind('/') {
            Some(pos) => format!("{}{}", &base[..=pos], reference.trim_start_matches('/')),
            None => reference.to_string(),
        },
    }
}

impl ManifestKind {
    /// Sniffs the protocol from the response mime type, then the document
    /// body, then the URL.
    pub fn detect(text: &str, mime: Option<&str>, url: &str) -> Option<ManifestKind> {
        if let Some(mime) = mime.map(|m| m.split(';').next().unwrap_or_default().trim()) {
            let mime = mime.to_ascii_lowercase();
            if hls::MIME_TYPES.contains(&mime.as_str()) {
                return Some(ManifestKind::Hls);
            }
            if mime == dash::MIME_TYPE {
                return Some(ManifestKind::Dash);
            }
            if mime == smooth::MIME_TYPE {
                return Some(ManifestKind::Smooth);
            }
        }

        if hls::looks_like_playlist(text) {
            return Some(ManifestKind::Hls);
        }
        if dash::looks_like_mpd(text) {
            return Some(ManifestKind::Dash);
        }
        if smooth::looks_like_smooth(text) {
            return Some(ManifestKind::Smooth);
        }

        let path = url.split(['?', '#']).next().unwrap_or_default().to_ascii_lowercase();
        if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            Some(ManifestKind::Hls)
        } else if path.ends_with(".mpd") {
            Some(ManifestKind::Dash)
        } else if path.ends_with("/manifest") || path.ends_with(".ism") {
            Some(ManifestKind::Smooth)
        } else {
            None
        }
    }
}

/// Parses a manifest of the given kind.
pub fn parse_as(kind: ManifestKind, raw: &[u8], base_url: &str) -> Result<Manifest, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::Encoding)?;
    match kind {
        ManifestKind::Hls => hls::parse(text, base_url),
        ManifestKind::Dash => dash::parse(text, base_url),
        ManifestKind::Smooth => smooth::parse(text, base_url),
    }
}

/// Parses a manifest, sniffing its protocol from the content and URL.
pub fn parse(raw: &[u8], base_url: &str) -> Result<Manifest, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::Encoding)?;
    let kind = ManifestKind::detect(text, None, base_url)
        .ok_or_else(|| ParseError::unsupported("unrecognized manifest format"))?;
    parse_as(kind, raw, base_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_references() {
        assert_eq!(
            resolve_url("http://h/a/b/index.m3u8", "seg.ts"),
            "http://h/a/b/seg.ts"
        );
        assert_eq!(
            resolve_url("http://h/a/b/index.m3u8", "/root.ts"),
            "http://h/root.ts"
        );
        assert_eq!(
            resolve_url("http://h/a/index.m3u8", "https://cdn/x.ts"),
            "https://cdn/x.ts"
        );
        assert_eq!(resolve_url("local/index.m3u8", "seg.ts"), "local/seg.ts");
    }

    #[test]
    fn detects_kinds() {
        assert_eq!(
            ManifestKind::detect("#EXTM3U\n", None, "x"),
            Some(ManifestKind::Hls)
        );
        assert_eq!(
            ManifestKind::detect("<?xml?><MPD/>", None, "x"),
            Some(ManifestKind::Dash)
        );
        assert_eq!(
            ManifestKind::detect("", Some("application/vnd.ms-sstr+xml"), "x"),
            Some(ManifestKind::Smooth)
        );
        assert_eq!(
            ManifestKind::detect("garbage", None, "http://h/p.mpd?x=1"),
            Some(ManifestKind::Dash)
        );
        assert_eq!(ManifestKind::detect("garbage", None, "http://h/p"), None);
    }

    #[test]
    fn unknown_content_is_rejected() {
        assert!(matches!(
            parse(b"hello", "http://h/p"),
            Err(ParseError::Unsupported { .. })
        ));
    }
}
