// crates/aircast-media/src/error.rs

use ffmpeg_the_third as ffmpeg;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The container was opened but holds no stream the policy accepts.
    #[error("no usable stream in input")]
    NoStream,

    #[error("input format not found: {0}")]
    InputFormatNotFound(&'static str),

    #[error("codec not found: {0:?}")]
    CodecNotFound(ffmpeg::codec::Id),

    #[error("unsupported media type: {0:?}")]
    UnsupportedMedium(ffmpeg::media::Type),

    #[error("allocation failed: {0}")]
    Alloc(&'static str),

    #[error("invalid source identifier: {0}")]
    InvalidSource(String),

    #[error("filter not found: {0}")]
    FilterNotFound(&'static str),

    #[error("filter medium does not match the decoder's stream")]
    MediumMismatch,

    #[error("no encoder configured for the pipeline")]
    NoEncoderConfigured,

    #[error("invalid bitrate bounds: min {min} > max {max}")]
    InvalidBitrateBounds { min: i64, max: i64 },

    #[error("encoder ladder needs at least one step")]
    NoLadderSteps,

    /// A control call was made against an encoder variant that does not
    /// implement it, e.g. `pause_encoding` on a plain encoder.
    #[error("operation unsupported by this encoder")]
    Unsupported,

    #[error("this settings table does not expose bitrate control")]
    BitrateControlUnsupported,

    #[error(transparent)]
    Ffmpeg(#[from] ffmpeg::Error),
}
