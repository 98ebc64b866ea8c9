// HLS (RFC 8216) playlists
mod parser;
mod tags;

pub use parser::{MediaPlaylist, parse, parse_media_playlist};

/// Mime types served for extended M3U playlists.
pub const MIME_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

/// Cheap content sniff used before committing to a full parse.
pub fn looks_like_playlist(text: &str) -> bool {
    tags::has_header(text)
}
