// crates/aircast-media/src/info.rs
//
// Read-only describe surfaces published by the stages: the demuxer's stream
// description (consumed by the decoder) and the decoder's / filter's frame
// description (consumed by the filter / encoder). Snapshots are taken at
// construction time, before any worker starts, so no stage ever reaches into
// another stage's live codec state.

use ffmpeg_the_third as ffmpeg;

use ffmpeg::format::{Pixel, Sample};
use ffmpeg::util::color;
use ffmpeg::{codec, media, Rational};

use crate::ffi_ext::OwnedParameters;

/// What the demuxer knows about the selected elementary stream.
pub struct StreamInfo {
    pub(crate) index: usize,
    pub(crate) params: OwnedParameters,
    pub(crate) codec_id: codec::Id,
    pub(crate) medium: media::Type,
    pub(crate) time_base: Rational,
    pub(crate) frame_rate: Rational,
}

impl StreamInfo {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn codec_id(&self) -> codec::Id {
        self.codec_id
    }

    pub fn medium(&self) -> media::Type {
        self.medium
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Guessed framerate; `0/1` when the container does not advertise one
    /// (audio streams, some live sources).
    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }
}

/// Media parameters of decoded or filtered frames.
#[derive(Clone)]
pub enum FrameInfo {
    Video(VideoInfo),
    Audio(AudioInfo),
}

#[derive(Clone)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub format: Pixel,
    pub sample_aspect_ratio: Rational,
    pub color_space: color::Space,
    pub color_range: color::Range,
    pub frame_rate: Rational,
    pub time_base: Rational,
}

#[derive(Clone)]
pub struct AudioInfo {
    pub rate: u32,
    pub format: Sample,
    pub channels: u32,
    pub time_base: Rational,
}

impl FrameInfo {
    pub fn medium(&self) -> media::Type {
        match self {
            FrameInfo::Video(_) => media::Type::Video,
            FrameInfo::Audio(_) => media::Type::Audio,
        }
    }

    pub fn time_base(&self) -> Rational {
        match self {
            FrameInfo::Video(v) => v.time_base,
            FrameInfo::Audio(a) => a.time_base,
        }
    }
}
