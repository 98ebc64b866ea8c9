// ID3v2 tags prefixed to HLS packed audio segments
use manifest::Tick;

const HEADER_LEN: usize = 10;
const TIMESTAMP_OWNER: &[u8] = b"com.apple.streaming.transportStreamTimestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Id3Header {
    /// More bytes are needed to decide.
    Incomplete,
    NotPresent,
    /// A tag of `len` bytes, with the MPEG-TS timestamp it carries.
    Tag { len: usize, timestamp: Option<Tick> },
}

fn syncsafe(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |acc, b| (acc << 7) | (*b & 0x7f) as usize)
}

fn plain(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
}

/// Looks for a complete ID3v2 tag at the start of `data`.
pub fn inspect(data: &[u8]) -> Id3Header {
    let magic = &b"ID3"[..data.len().min(3)];
    if !data.starts_with(magic) {
        return Id3Header::NotPresent;
    }
    if data.len() < HEADER_LEN {
        return Id3Header::Incomplete;
    }
    if data[3] == 0xff || data[4] == 0xff || data[6..HEADER_LEN].iter().any(|b| b & 0x80 != 0) {
        return Id3Header::NotPresent;
    }
    let footer = if data[5] & 0x10 != 0 { HEADER_LEN } else { 0 };
    let len = HEADER_LEN + syncsafe(&data[6..HEADER_LEN]) + footer;
    if data.len() < len {
        return Id3Header::Incomplete;
    }
    Id3Header::Tag {
        len,
        timestamp: transport_stream_timestamp(&data[..len]),
    }
}

fn transport_stream_timestamp(tag: &[u8]) -> Option<Tick> {
    let version = tag[3];
    let mut pos = HEADER_LEN;
    if tag[5] & 0x40 != 0 {
        let ext = tag.get(pos..pos + 4)?;
        pos += if version >= 4 { syncsafe(ext) } else { plain(ext) + 4 };
    }
    while pos + HEADER_LEN <= tag.len() {
        let id = &tag[pos..pos + 4];
        if id[0] == 0 {
            break;
        }
        let size_bytes = &tag[pos + 4..pos + 8];
        let size = if version >= 4 { syncsafe(size_bytes) } else { plain(size_bytes) };
        let body = tag.get(pos + HEADER_LEN..pos + HEADER_LEN + size)?;
        if id == b"PRIV" {
            if let Some(data) = body
                .strip_prefix(TIMESTAMP_OWNER)
                .and_then(|b| b.strip_prefix(&[0]))
            {
                let raw: [u8; 8] = data.get(..8)?.try_into().ok()?;
                let ts = u64::from_be_bytes(raw) & 0x1_ffff_ffff;
                return Some((ts * 100 / 9) as Tick);
            }
        }
        pos += HEADER_LEN + size;
    }
    None
}

#[cfg(test)]
pub(crate) fn timestamp_tag(ts90k: u64) -> Vec<u8> {
    let mut body = b"PRIV".to_vec();
    let size = TIMESTAMP_OWNER.len() + 1 + 8;
    body.extend_from_slice(&(size as u32).to_be_bytes());
    body.extend_from_slice(&[0, 0]);
    body.extend_from_slice(TIMESTAMP_OWNER);
    body.push(0);
    body.extend_from_slice(&ts90k.to_be_bytes());

    let mut tag = b"ID3".to_vec();
    tag.extend_from_slice(&[3, 0, 0]);
    let len = body.len();
    tag.extend_from_slice(&[
        ((len >> 21) & 0x7f) as u8,
        ((len >> 14) & 0x7f) as u8,
        ((len >> 7) & 0x7f) as u8,
        (len & 0x7f) as u8,
    ]);
    tag.extend_from_slice(&body);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_apple_timestamp() {
        let mut data = timestamp_tag(900_000);
        let len = data.len();
        data.extend_from_slice(&[0xff, 0xf1, 0x50]);
        assert_eq!(
            inspect(&data),
            Id3Header::Tag {
                len,
                timestamp: Some(10_000_000)
            }
        );
    }

    #[test]
    fn partial_tags_need_more_data() {
        let data = timestamp_tag(1);
        assert_eq!(inspect(&data[..2]), Id3Header::Incomplete);
        assert_eq!(inspect(&data[..12]), Id3Header::Incomplete);
    }

    #[test]
    fn other_payloads_are_left_alone() {
        assert_eq!(inspect(&[0xff, 0xf1, 0x50, 0x80]), Id3Header::NotPresent);
        assert_eq!(inspect(b"I"), Id3Header::Incomplete);
        assert_eq!(inspect(b"IX"), Id3Header::NotPresent);
    }
}
