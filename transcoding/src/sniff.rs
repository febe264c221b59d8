//! Content sniffing from leading magic bytes.
//!
//! The client's filename and declared content type are never consulted; only
//! the signature at the start of the upload decides how it is routed.

/// Container formats recognised by [`sniff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Gif,
    Png,
    Jpeg,
    WebP,
    Bmp,
    Tiff,
    Ico,
}

impl SourceFormat {
    /// Only GIF is routed through the animated path.
    pub fn is_animated_container(self) -> bool {
        matches!(self, Self::Gif)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Gif => "gif",
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
            Self::Bmp => "bmp",
            Self::Tiff => "tif",
            Self::Ico => "ico",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Gif => "image/gif",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
            Self::Ico => "image/x-icon",
        }
    }
}

const SIGNATURES: &[(&[u8], SourceFormat)] = &[
    (b"GIF87a", SourceFormat::Gif),
    (b"GIF89a", SourceFormat::Gif),
    (b"\x89PNG\r\n\x1a\n", SourceFormat::Png),
    (b"\xFF\xD8\xFF", SourceFormat::Jpeg),
    (b"II*\x00", SourceFormat::Tiff),
    (b"MM\x00*", SourceFormat::Tiff),
    (b"\x00\x00\x01\x00", SourceFormat::Ico),
    (b"BM", SourceFormat::Bmp),
];

/// Classifies `bytes` by signature. `None` means unrecognized and must be rejected.
pub fn sniff(bytes: &[u8]) -> Option<SourceFormat> {
    if is_webp(bytes) {
        return Some(SourceFormat::WebP);
    }

    SIGNATURES
        .iter()
        .find(|(magic, _)| bytes.starts_with(magic))
        .map(|(_, format)| *format)
}

fn is_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gif_is_animated_container() {
        for header in [&b"GIF89a\x01\x00\x01\x00"[..], &b"GIF87a\x01\x00\x01\x00"[..]] {
            let format = sniff(header).unwrap();
            assert_eq!(format, SourceFormat::Gif);
            assert!(format.is_animated_container());
            assert_eq!(format.extension(), "gif");
        }
    }

    #[test]
    fn test_still_signatures() {
        let cases: &[(&[u8], SourceFormat)] = &[
            (b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR", SourceFormat::Png),
            (b"\xFF\xD8\xFF\xE0\x00\x10JFIF", SourceFormat::Jpeg),
            (b"RIFF\x24\x00\x00\x00WEBPVP8 ", SourceFormat::WebP),
            (b"BM\x3a\x00\x00\x00", SourceFormat::Bmp),
            (b"II*\x00\x08\x00\x00\x00", SourceFormat::Tiff),
            (b"MM\x00*\x00\x00\x00\x08", SourceFormat::Tiff),
            (b"\x00\x00\x01\x00\x01\x00", SourceFormat::Ico),
        ];

        for (bytes, expected) in cases {
            let format = sniff(bytes).unwrap();
            assert_eq!(format, *expected);
            assert!(!format.is_animated_container());
        }
    }

    #[test]
    fn test_unrecognized_bytes() {
        assert_eq!(sniff(b"This is not an image"), None);
        assert_eq!(sniff(&[0x13, 0x37, 0xC0, 0xDE, 0x00, 0x42, 0x99]), None);
        assert_eq!(sniff(b""), None);
    }

    #[test]
    fn test_truncated_signatures() {
        assert_eq!(sniff(b"GIF8"), None);
        assert_eq!(sniff(b"\x89PN"), None);
        // RIFF without the WEBP form type is some other RIFF container
        assert_eq!(sniff(b"RIFF\x24\x00\x00\x00WAVEfmt "), None);
        assert_eq!(sniff(b"RIFF\x24\x00\x00\x00WE"), None);
    }
}
