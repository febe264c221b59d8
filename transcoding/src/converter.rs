use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::animated::{AnimatedTarget, AnimatedTranscoder};
use crate::error::{Result, TranscodeError};
use crate::quality::{AnimatedImageParams, Quality, StillParams, VideoParams};
use crate::sniff::{sniff, SourceFormat};
use crate::still::StillEncoder;

pub const WEBP_CONTENT_TYPE: &str = "image/webp";
pub const MP4_CONTENT_TYPE: &str = "video/mp4";

/// Requested output for animated sources. Stills are always WebP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    AnimatedImage,
    Video,
}

impl FromStr for OutputKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webp" => Ok(Self::AnimatedImage),
            "mp4" => Ok(Self::Video),
            other => Err(format!("Unsupported output format '{}', expected webp or mp4", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub source: Vec<u8>,
    pub quality: i64,
    pub output_kind: OutputKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Checks everything that can be rejected without converting: a non-empty
/// upload, quality in range and a recognised signature.
pub fn validate(request: &ConversionRequest) -> Result<(Quality, SourceFormat)> {
    if request.source.is_empty() {
        return Err(TranscodeError::EmptyInput);
    }

    let quality = Quality::new(request.quality)?;
    let format = sniff(&request.source).ok_or(TranscodeError::UnrecognizedFormat)?;
    Ok((quality, format))
}

/// Routes a request to the still or animated path.
pub struct Converter {
    still: Arc<dyn StillEncoder>,
    animated: Arc<dyn AnimatedTranscoder>,
    still_permits: Arc<Semaphore>,
}

impl Converter {
    pub fn new(
        still: Arc<dyn StillEncoder>,
        animated: Arc<dyn AnimatedTranscoder>,
        still_concurrency: usize,
    ) -> Self {
        Self {
            still,
            animated,
            still_permits: Arc::new(Semaphore::new(still_concurrency.max(1))),
        }
    }

    pub async fn convert(&self, request: ConversionRequest) -> Result<ConversionResult> {
        let (quality, format) = validate(&request)?;

        log::info!(
            "Converting {} upload ({} bytes) at quality {} as {:?}",
            format.mime(),
            request.source.len(),
            quality.get(),
            request.output_kind
        );

        if format.is_animated_container() {
            self.convert_animated(request.source, format, quality, request.output_kind)
                .await
        } else {
            self.convert_still(request.source, quality).await
        }
    }

    async fn convert_still(&self, source: Vec<u8>, quality: Quality) -> Result<ConversionResult> {
        let params = StillParams::from_quality(quality);
        let permit = Arc::clone(&self.still_permits)
            .acquire_owned()
            .await
            .map_err(|e| TranscodeError::Internal(format!("Still encoder limiter closed: {}", e)))?;

        // The permit travels with the encode, so a caller that stops waiting
        // does not free a slot while the encode is still running
        let encoder = Arc::clone(&self.still);
        let bytes = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            encoder.encode(&source, &params)
        })
            .await
            .map_err(|e| TranscodeError::Internal(format!("Still encode task failed: {}", e)))??;

        Ok(ConversionResult {
            bytes,
            content_type: WEBP_CONTENT_TYPE,
        })
    }

    async fn convert_animated(
        &self,
        source: Vec<u8>,
        format: SourceFormat,
        quality: Quality,
        output_kind: OutputKind,
    ) -> Result<ConversionResult> {
        let target = match output_kind {
            OutputKind::AnimatedImage => {
                AnimatedTarget::AnimatedImage(AnimatedImageParams::from_quality(quality))
            }
            OutputKind::Video => AnimatedTarget::Video(VideoParams::from_quality(quality)),
        };

        let bytes = self
            .animated
            .transcode(&source, format.extension(), &target)
            .await?;

        Ok(ConversionResult {
            bytes,
            content_type: target.content_type(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GIF_HEADER: &[u8] = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;";

    #[derive(Default)]
    struct RecordingTranscoder {
        targets: Mutex<Vec<AnimatedTarget>>,
    }

    #[async_trait]
    impl AnimatedTranscoder for RecordingTranscoder {
        async fn transcode(
            &self,
            source: &[u8],
            source_extension: &str,
            target: &AnimatedTarget,
        ) -> Result<Vec<u8>> {
            assert_eq!(source_extension, "gif");
            self.targets.lock().unwrap().push(*target);
            Ok(source.to_vec())
        }
    }

    struct EchoStill;

    impl StillEncoder for EchoStill {
        fn encode(&self, source: &[u8], params: &StillParams) -> Result<Vec<u8>> {
            let mut out = vec![params.quality as u8];
            out.extend_from_slice(source);
            Ok(out)
        }
    }

    fn converter(animated: Arc<RecordingTranscoder>) -> Converter {
        Converter::new(Arc::new(EchoStill), animated, 2)
    }

    fn request(source: &[u8], quality: i64, output_kind: OutputKind) -> ConversionRequest {
        ConversionRequest {
            source: source.to_vec(),
            quality,
            output_kind,
        }
    }

    #[test]
    fn test_output_kind_parsing() {
        assert_eq!("webp".parse::<OutputKind>().unwrap(), OutputKind::AnimatedImage);
        assert_eq!("MP4".parse::<OutputKind>().unwrap(), OutputKind::Video);
        assert!("gif".parse::<OutputKind>().is_err());
        assert_eq!(OutputKind::default(), OutputKind::AnimatedImage);
    }

    #[test]
    fn test_validate_without_converting() {
        let (quality, format) = validate(&request(GIF_HEADER, 55, OutputKind::Video)).unwrap();
        assert_eq!(quality.get(), 55);
        assert_eq!(format, SourceFormat::Gif);

        assert!(matches!(
            validate(&request(GIF_HEADER, 101, OutputKind::Video)),
            Err(TranscodeError::QualityOutOfRange(101))
        ));
    }

    #[tokio::test]
    async fn test_still_ignores_requested_format() {
        let animated = Arc::new(RecordingTranscoder::default());
        let png = b"\x89PNG\r\n\x1a\nrest";

        let result = converter(animated.clone())
            .convert(request(png, 42, OutputKind::Video))
            .await
            .unwrap();

        assert_eq!(result.content_type, WEBP_CONTENT_TYPE);
        assert_eq!(result.bytes[0], 42);
        assert!(animated.targets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_animated_dispatch_by_output_kind() {
        let animated = Arc::new(RecordingTranscoder::default());
        let converter = converter(animated.clone());

        let image = converter
            .convert(request(GIF_HEADER, 80, OutputKind::AnimatedImage))
            .await
            .unwrap();
        let video = converter
            .convert(request(GIF_HEADER, 80, OutputKind::Video))
            .await
            .unwrap();

        assert_eq!(image.content_type, WEBP_CONTENT_TYPE);
        assert_eq!(video.content_type, MP4_CONTENT_TYPE);

        let targets = animated.targets.lock().unwrap();
        assert_eq!(
            targets[0],
            AnimatedTarget::AnimatedImage(AnimatedImageParams { crf: 13, bitrate: 0 })
        );
        assert_eq!(targets[1], AnimatedTarget::Video(VideoParams { crf: 10 }));
    }

    /// Blocks inside `encode` and records how many encodes overlap.
    #[derive(Default)]
    struct SlowStill {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StillEncoder for SlowStill {
        fn encode(&self, source: &[u8], _params: &StillParams) -> Result<Vec<u8>> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(300));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(source.to_vec())
        }
    }

    #[tokio::test]
    async fn test_abandoned_still_encode_keeps_its_permit() {
        let still = Arc::new(SlowStill::default());
        let converter = Converter::new(still.clone(), Arc::new(RecordingTranscoder::default()), 1);
        let png = b"\x89PNG\r\n\x1a\nrest";

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            converter.convert(request(png, 80, OutputKind::AnimatedImage)),
        )
        .await;
        assert!(abandoned.is_err());

        converter
            .convert(request(png, 80, OutputKind::AnimatedImage))
            .await
            .unwrap();

        assert_eq!(still.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejections_are_client_errors() {
        let animated = Arc::new(RecordingTranscoder::default());
        let converter = converter(animated.clone());

        let empty = converter.convert(request(b"", 80, OutputKind::AnimatedImage)).await;
        assert!(matches!(empty, Err(TranscodeError::EmptyInput)));

        let out_of_range = converter
            .convert(request(GIF_HEADER, 0, OutputKind::AnimatedImage))
            .await;
        assert!(matches!(out_of_range, Err(TranscodeError::QualityOutOfRange(0))));

        let unknown = converter
            .convert(request(b"definitely not an image", 80, OutputKind::AnimatedImage))
            .await;
        assert!(matches!(unknown, Err(TranscodeError::UnrecognizedFormat)));
        assert!(unknown.unwrap_err().is_client_error());

        assert!(animated.targets.lock().unwrap().is_empty());
    }
}
