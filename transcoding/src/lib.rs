pub mod animated;
pub mod converter;
pub mod error;
pub mod quality;
pub mod sniff;
pub mod still;

pub use animated::{AnimatedTarget, AnimatedTranscoder, FfmpegTranscoder, ScratchSpace};
pub use converter::{validate, ConversionRequest, ConversionResult, Converter, OutputKind};
pub use error::{Result, TranscodeError};
pub use quality::{AnimatedImageParams, Quality, StillParams, VideoParams};
pub use sniff::{sniff, SourceFormat};
pub use still::{StillEncoder, WebpStillEncoder};
