// Segment content classifier: decides from the head of a downloaded file
// whether it is usable media, ciphertext, a disguised transport stream, or junk.

use std::fmt;
use std::path::Path;

use memchr::memchr_iter;
use tokio::io::AsyncReadExt;

use crate::HarvestError;
use crate::config::ClassifierConfig;

pub const TS_SYNC_BYTE: u8 = 0x47;
pub const TS_PACKET_SIZE: usize = 188;

const ERROR_MARKERS: &[&str] = &[
    "<html",
    "<!doctype html",
    "<head",
    "<body",
    "<title",
    "<?xml",
    "400 bad request",
    "401 unauthorized",
    "403 forbidden",
    "404 not found",
    "410 gone",
    "429 too many requests",
    "500 internal server error",
    "502 bad gateway",
    "503 service unavailable",
    "access denied",
    "\"error\"",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    Ico,
}

impl ImageFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            "bmp" => Some(Self::Bmp),
            "ico" => Some(Self::Ico),
            _ => None,
        }
    }

    /// Format whose magic number opens `header`, if any.
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if header.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else if is_bmp_header(header) {
            Some(Self::Bmp)
        } else if header.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
            Some(Self::Ico)
        } else {
            None
        }
    }

    fn signature_len(&self) -> usize {
        match self {
            Self::Jpeg => 3,
            Self::Png => 8,
            Self::Gif => 6,
            Self::Webp => 12,
            Self::Bmp => 2,
            Self::Ico => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Bmp => "bmp",
            Self::Ico => "ico",
        }
    }
}

/// `BM`, zeroed reserved words and a known DIB header size at offset 14.
fn is_bmp_header(header: &[u8]) -> bool {
    const DIB_HEADER_SIZES: &[u32] = &[12, 40, 52, 56, 64, 108, 124];
    if header.len() < 18 || !header.starts_with(b"BM") || header[6..10] != [0; 4] {
        return false;
    }
    let dib_size = u32::from_le_bytes([header[14], header[15], header[16], header[17]]);
    DIB_HEADER_SIZES.contains(&dib_size)
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a segment hides behind an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisguiseKind {
    /// Image file name, but the bytes carry no image signature at all.
    DecoyExtension { claimed: ImageFormat },
    /// A genuine image header with a transport stream appended after it.
    ImageWrapped {
        format: ImageFormat,
        payload_offset: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClass {
    Valid,
    /// High-entropy binary kept for a decryptor.
    Encrypted,
    Disguised(DisguiseKind),
    HtmlError,
    Corrupt,
    Missing,
}

impl SegmentClass {
    /// Whether the file is kept and handed on towards reassembly.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Valid | Self::Encrypted | Self::Disguised(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Encrypted => "encrypted",
            Self::Disguised(DisguiseKind::DecoyExtension { .. }) => "disguised_extension",
            Self::Disguised(DisguiseKind::ImageWrapped { .. }) => "image_wrapped",
            Self::HtmlError => "html_error",
            Self::Corrupt => "corrupt",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for SegmentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure function of a file's leading bytes and its extension, so classifying
/// the same file twice always yields the same answer.
#[derive(Debug, Clone, Default)]
pub struct SegmentClassifier {
    config: ClassifierConfig,
}

impl SegmentClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classifies `head`, the leading bytes of a segment file. `extension` is the
    /// file's extension without the dot.
    pub fn classify_bytes(&self, head: &[u8], extension: Option<&str>) -> SegmentClass {
        if head.is_empty() {
            return SegmentClass::Corrupt;
        }

        // Some image headers (PNG, GIF) contain 0x47 in their first bytes, so
        // genuine images are looked at before the sync scan.
        if let Some(format) = ImageFormat::sniff(head) {
            return match find_ts_payload(head, format.signature_len()) {
                Some(payload_offset) => SegmentClass::Disguised(DisguiseKind::ImageWrapped {
                    format,
                    payload_offset,
                }),
                None => SegmentClass::Corrupt,
            };
        }

        let sync_window = &head[..head.len().min(self.config.sync_scan_bytes)];
        if sync_window.contains(&TS_SYNC_BYTE) {
            return SegmentClass::Valid;
        }

        let sample = &head[..head.len().min(self.config.header_window)];
        let text = decode_text(sample);

        if text.is_none() && distinct_byte_ratio(sample) > self.config.entropy_threshold {
            return SegmentClass::Encrypted;
        }

        if let Some(text) = text {
            let lowered = text.to_ascii_lowercase();
            if ERROR_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                return SegmentClass::HtmlError;
            }
        }

        match extension.and_then(ImageFormat::from_extension) {
            Some(claimed) => SegmentClass::Disguised(DisguiseKind::DecoyExtension { claimed }),
            None => SegmentClass::Corrupt,
        }
    }

    /// Reads the head of `path` and classifies it. A missing file is `Missing`.
    pub async fn classify_file(&self, path: &Path) -> Result<SegmentClass, HarvestError> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SegmentClass::Missing),
            Err(e) => return Err(e.into()),
        };

        let window = self.config.header_window.max(self.config.sync_scan_bytes);
        let mut head = Vec::with_capacity(window);
        let mut reader = file.take(window as u64);
        reader.read_to_end(&mut head).await?;

        if ImageFormat::sniff(&head).is_some() && self.config.wrapped_scan_limit > window {
            let mut file = reader.into_inner();
            let extra = (self.config.wrapped_scan_limit - window) as u64;
            (&mut file).take(extra).read_to_end(&mut head).await?;
        }

        let extension = path.extension().and_then(|ext| ext.to_str());
        Ok(self.classify_bytes(&head, extension))
    }
}

/// `sample` as text when it is UTF-8 made of printable characters. A sequence
/// cut off at the end of the window still counts as text.
fn decode_text(sample: &[u8]) -> Option<&str> {
    let text = match std::str::from_utf8(sample) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            // `valid_up_to` always lands on a char boundary.
            std::str::from_utf8(&sample[..e.valid_up_to()]).ok()?
        }
        Err(_) => return None,
    };
    text.chars()
        .all(|c| !c.is_control() || c.is_ascii_whitespace())
        .then_some(text)
}

fn distinct_byte_ratio(sample: &[u8]) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let mut seen = [false; 256];
    let mut distinct = 0usize;
    for &byte in sample {
        if !seen[byte as usize] {
            seen[byte as usize] = true;
            distinct += 1;
        }
    }
    distinct as f64 / sample.len() as f64
}

/// Offset of the first transport stream packet at or after `from`: a sync byte
/// followed by another one packet later.
pub fn find_ts_payload(data: &[u8], from: usize) -> Option<usize> {
    let tail = data.get(from..)?;
    memchr_iter(TS_SYNC_BYTE, tail)
        .map(|pos| from + pos)
        .find(|&offset| {
            data.get(offset + TS_PACKET_SIZE) == Some(&TS_SYNC_BYTE)
                && data
                    .get(offset + 2 * TS_PACKET_SIZE)
                    .is_none_or(|&b| b == TS_SYNC_BYTE)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> SegmentClassifier {
        SegmentClassifier::default()
    }

    fn ts_packets(count: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(count * TS_PACKET_SIZE);
        for i in 0..count {
            data.push(TS_SYNC_BYTE);
            data.extend(std::iter::repeat_n((i % 7) as u8, TS_PACKET_SIZE - 1));
        }
        data
    }

    #[test]
    fn sync_byte_start_is_valid() {
        assert_eq!(
            classifier().classify_bytes(&ts_packets(3), Some("ts")),
            SegmentClass::Valid
        );
        // Sync byte within the scan window but not at offset 0.
        let mut shifted = vec![0x00, 0x00];
        shifted.extend(ts_packets(2));
        assert_eq!(
            classifier().classify_bytes(&shifted, Some("ts")),
            SegmentClass::Valid
        );
    }

    #[test]
    fn high_entropy_binary_is_kept_as_encrypted() {
        let data: Vec<u8> = (56..=255u8).rev().collect();
        assert_eq!(data.len(), 200);
        let class = classifier().classify_bytes(&data, Some("ts"));
        assert_eq!(class, SegmentClass::Encrypted);
        assert!(class.is_usable());
    }

    #[test]
    fn html_bodies_are_rejected() {
        let body = b"<!DOCTYPE html><html><head><title>403 Forbidden</title></head></html>";
        let class = classifier().classify_bytes(body, Some("ts"));
        assert_eq!(class, SegmentClass::HtmlError);
        assert!(!class.is_usable());

        assert_eq!(
            classifier().classify_bytes(b"404 Not Found", Some("ts")),
            SegmentClass::HtmlError
        );
    }

    #[test]
    fn image_extension_without_signature_is_a_decoy() {
        let data = vec![0u8; 512];
        let class = classifier().classify_bytes(&data, Some("jpg"));
        assert_eq!(
            class,
            SegmentClass::Disguised(DisguiseKind::DecoyExtension {
                claimed: ImageFormat::Jpeg
            })
        );
        assert!(class.is_usable());

        // Same bytes under a media extension are just corrupt.
        assert_eq!(
            classifier().classify_bytes(&data, Some("ts")),
            SegmentClass::Corrupt
        );
    }

    #[test]
    fn image_header_followed_by_ts_is_wrapped() {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(&[0x10; 92]);
        let offset = data.len();
        data.extend(ts_packets(3));

        assert_eq!(
            classifier().classify_bytes(&data, Some("png")),
            SegmentClass::Disguised(DisguiseKind::ImageWrapped {
                format: ImageFormat::Png,
                payload_offset: offset,
            })
        );
    }

    #[test]
    fn genuine_image_without_payload_is_corrupt() {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0];
        data.extend_from_slice(&[0x10; 400]);
        assert_eq!(
            classifier().classify_bytes(&data, Some("jpg")),
            SegmentClass::Corrupt
        );
    }

    #[test]
    fn unmarked_text_depends_on_the_extension() {
        assert_eq!(
            classifier().classify_bytes(b"just some words", Some("ts")),
            SegmentClass::Corrupt
        );
        assert_eq!(
            classifier().classify_bytes(b"frame data follows here", Some("jpg")),
            SegmentClass::Disguised(DisguiseKind::DecoyExtension {
                claimed: ImageFormat::Jpeg
            })
        );
        // Error pages stay rejected whatever the extension.
        assert_eq!(
            classifier().classify_bytes(b"<html>403 Forbidden</html>", Some("jpg")),
            SegmentClass::HtmlError
        );
    }

    #[test]
    fn bmp_needs_a_plausible_dib_header() {
        let mut bmp = b"BM".to_vec();
        bmp.extend_from_slice(&[0x36, 0x10, 0, 0]); // file size
        bmp.extend_from_slice(&[0; 4]); // reserved
        bmp.extend_from_slice(&[0x36, 0, 0, 0]); // pixel offset
        bmp.extend_from_slice(&40u32.to_le_bytes());
        assert_eq!(ImageFormat::sniff(&bmp), Some(ImageFormat::Bmp));

        // High-entropy bytes that happen to open with `BM`.
        let mut lookalike = b"BM".to_vec();
        lookalike.extend((56..=241u8).rev());
        assert_eq!(ImageFormat::sniff(&lookalike), None);
        assert_eq!(
            classifier().classify_bytes(&lookalike, Some("ts")),
            SegmentClass::Encrypted
        );
    }

    #[test]
    fn truncated_utf8_still_counts_as_text() {
        let mut body = "<html>".repeat(31).into_bytes();
        body.extend_from_slice("é".as_bytes());
        // Window cuts the two-byte character in half.
        assert_eq!(body.len(), 188);
        let cut = &body[..187];
        assert!(decode_text(cut).is_some());
        assert_eq!(
            classifier().classify_bytes(cut, None),
            SegmentClass::HtmlError
        );
    }

    #[tokio::test]
    async fn file_classification_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier();

        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("segment_000000.ts", ts_packets(4)),
            ("segment_000001.ts", (56..=255u8).rev().collect()),
            ("segment_000002.ts", b"<html><body>denied</body></html>".to_vec()),
            ("segment_000003.jpg", vec![0u8; 300]),
        ];

        for (name, bytes) in cases {
            let path = dir.path().join(name);
            tokio::fs::write(&path, &bytes).await.unwrap();
            let first = classifier.classify_file(&path).await.unwrap();
            let second = classifier.classify_file(&path).await.unwrap();
            assert_eq!(first, second, "{name}");
        }

        let missing = dir.path().join("segment_000009.ts");
        assert_eq!(
            classifier.classify_file(&missing).await.unwrap(),
            SegmentClass::Missing
        );
    }

    #[tokio::test]
    async fn wrapped_payload_beyond_header_window_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_000000.png");

        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend(std::iter::repeat_n(0x10u8, 4000));
        let offset = data.len();
        data.extend(ts_packets(3));
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(
            classifier().classify_file(&path).await.unwrap(),
            SegmentClass::Disguised(DisguiseKind::ImageWrapped {
                format: ImageFormat::Png,
                payload_offset: offset,
            })
        );
    }
}
