// crates/aircast-media/src/defaults.rs
//
// Pipeline-wide defaults for WebRTC-bound streams.

use ffmpeg_the_third as ffmpeg;

use ffmpeg::codec;
use ffmpeg::format::Pixel;

pub const VIDEO_WIDTH: u32 = 1920;
pub const VIDEO_HEIGHT: u32 = 1080;
pub const VIDEO_FPS: u32 = 25;
pub const VIDEO_PIX_FMT: Pixel = Pixel::YUV420P;
pub const VIDEO_ENCODER: codec::Id = codec::Id::H264;

pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const AUDIO_FRAME_SIZE: u32 = 960;
pub const AUDIO_SAMPLE_FMT: &str = "s16";
pub const AUDIO_CHANNEL_LAYOUT: &str = "stereo";
pub const AUDIO_ENCODER: codec::Id = codec::Id::OPUS;
