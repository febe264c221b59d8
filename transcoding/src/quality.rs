//! Mapping from the public 1-100 quality scale to codec parameters.
//!
//! The public scale is "higher is better". CRF-driven codecs are "lower is
//! better", so the animated and video mappings invert and rescale. All
//! arithmetic is integral so identical inputs always produce identical
//! parameters.

use crate::error::{Result, TranscodeError};

pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;
pub const DEFAULT_QUALITY: u8 = 80;

/// libwebp `method`: 0 is fastest, 6 compresses hardest.
pub const WEBP_MAX_METHOD: i32 = 6;

/// libvpx-vp9 CRF range.
pub const VP9_MAX_CRF: u8 = 63;

/// libx264 CRF range (8-bit).
pub const X264_MAX_CRF: u8 = 51;

/// A quality value already validated to `MIN_QUALITY..=MAX_QUALITY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quality(u8);

impl Quality {
    pub fn new(value: i64) -> Result<Self> {
        if (MIN_QUALITY as i64..=MAX_QUALITY as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(TranscodeError::QualityOutOfRange(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(DEFAULT_QUALITY)
    }
}

/// Encoder settings for a lossy WebP still.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StillParams {
    pub quality: f32,
    pub method: i32,
    pub lossless: bool,
}

impl StillParams {
    pub fn from_quality(quality: Quality) -> Self {
        Self {
            quality: f32::from(quality.get()),
            method: WEBP_MAX_METHOD,
            lossless: false,
        }
    }
}

/// VP9 constant-quality settings for animated WebP output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimatedImageParams {
    pub crf: u8,
    /// Target bitrate; zero selects constant-quality mode.
    pub bitrate: u32,
}

impl AnimatedImageParams {
    /// `crf = round(63 - q * 0.63)`
    pub fn from_quality(quality: Quality) -> Self {
        Self {
            crf: inverted_crf(quality, VP9_MAX_CRF),
            bitrate: 0,
        }
    }
}

/// H.264 settings for MP4 output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoParams {
    pub crf: u8,
}

impl VideoParams {
    /// `crf = round(51 - q * 0.51)`
    pub fn from_quality(quality: Quality) -> Self {
        Self {
            crf: inverted_crf(quality, X264_MAX_CRF),
        }
    }
}

/// `round(max - q * max / 100)` in hundredths, halves rounding up, clamped to `0..=max`.
fn inverted_crf(quality: Quality, max: u8) -> u8 {
    let max = i64::from(max);
    let hundredths = max * 100 - i64::from(quality.get()) * max;
    let rounded = (hundredths + 50).div_euclid(100);
    rounded.clamp(0, max) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(value: i64) -> Quality {
        Quality::new(value).unwrap()
    }

    #[test]
    fn test_quality_bounds() {
        assert!(Quality::new(1).is_ok());
        assert!(Quality::new(100).is_ok());
        assert!(matches!(
            Quality::new(0),
            Err(TranscodeError::QualityOutOfRange(0))
        ));
        assert!(matches!(
            Quality::new(101),
            Err(TranscodeError::QualityOutOfRange(101))
        ));
        assert!(Quality::new(-5).is_err());
        assert_eq!(Quality::default().get(), 80);
    }

    #[test]
    fn test_animated_image_crf_exact_values() {
        assert_eq!(AnimatedImageParams::from_quality(q(1)).crf, 62);
        assert_eq!(AnimatedImageParams::from_quality(q(50)).crf, 32);
        assert_eq!(AnimatedImageParams::from_quality(q(80)).crf, 13);
        assert_eq!(AnimatedImageParams::from_quality(q(100)).crf, 0);
        assert_eq!(AnimatedImageParams::from_quality(q(80)).bitrate, 0);
    }

    #[test]
    fn test_video_crf_exact_values() {
        assert_eq!(VideoParams::from_quality(q(1)).crf, 50);
        assert_eq!(VideoParams::from_quality(q(50)).crf, 26);
        assert_eq!(VideoParams::from_quality(q(80)).crf, 10);
        assert_eq!(VideoParams::from_quality(q(100)).crf, 0);
    }

    #[test]
    fn test_crf_matches_float_formula_across_range() {
        for value in 1..=100 {
            let quality = q(value);
            let animated = (63.0 - value as f64 * 0.63).round() as u8;
            let video = (51.0 - value as f64 * 0.51).round() as u8;
            assert_eq!(AnimatedImageParams::from_quality(quality).crf, animated, "q={value}");
            assert_eq!(VideoParams::from_quality(quality).crf, video, "q={value}");
        }
    }

    #[test]
    fn test_crf_within_codec_range_and_non_increasing() {
        let mut last_animated = u8::MAX;
        let mut last_video = u8::MAX;
        for value in 1..=100 {
            let animated = AnimatedImageParams::from_quality(q(value)).crf;
            let video = VideoParams::from_quality(q(value)).crf;
            assert!(animated <= VP9_MAX_CRF);
            assert!(video <= X264_MAX_CRF);
            assert!(animated <= last_animated);
            assert!(video <= last_video);
            last_animated = animated;
            last_video = video;
        }
    }

    #[test]
    fn test_still_params_pass_through() {
        let mut last = 0.0;
        for value in 1..=100 {
            let params = StillParams::from_quality(q(value));
            assert_eq!(params.quality, value as f32);
            assert!((1.0..=100.0).contains(&params.quality));
            assert!(params.quality > last);
            assert_eq!(params.method, WEBP_MAX_METHOD);
            assert!(!params.lossless);
            last = params.quality;
        }
    }
}
