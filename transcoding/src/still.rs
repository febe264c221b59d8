use crate::error::{Result, TranscodeError};
use crate::quality::StillParams;

/// Re-encodes a single-frame image. Implementations run synchronously and
/// are expected to be called from a blocking context.
pub trait StillEncoder: Send + Sync {
    fn encode(&self, source: &[u8], params: &StillParams) -> Result<Vec<u8>>;
}

/// In-process lossy WebP encoder backed by libwebp.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebpStillEncoder;

impl WebpStillEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl StillEncoder for WebpStillEncoder {
    fn encode(&self, source: &[u8], params: &StillParams) -> Result<Vec<u8>> {
        let image = image::load_from_memory(source)?;
        let (width, height) = (image.width(), image.height());

        if width == 0 || height == 0 {
            return Err(TranscodeError::Unprocessable(
                "Image has no pixels".to_string(),
            ));
        }

        let mut config = webp::WebPConfig::new()
            .map_err(|_| TranscodeError::Internal("Failed to initialise WebP config".to_string()))?;
        config.lossless = i32::from(params.lossless);
        config.quality = params.quality;
        config.method = params.method;

        // Keep the alpha plane only when the source has one
        let encoded = if image.color().has_alpha() {
            let rgba = image.to_rgba8();
            webp::Encoder::from_rgba(rgba.as_raw(), width, height).encode_advanced(&config)
        } else {
            let rgb = image.to_rgb8();
            webp::Encoder::from_rgb(rgb.as_raw(), width, height).encode_advanced(&config)
        }
        .map_err(|e| TranscodeError::Encode(format!("WebP encoding failed: {:?}", e)))?;

        log::debug!(
            "Encoded {}x{} still: {} -> {} bytes (q={})",
            width,
            height,
            source.len(),
            encoded.len(),
            params.quality
        );

        Ok(encoded.to_vec())
    }
}
