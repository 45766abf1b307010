// crates/aircast-media/src/lib.rs
//
// Real-time transcoding pipeline: demux -> decode -> filter -> encode, each
// stage on its own worker, coupled by bounded pool-backed queues, with two
// encoder wrappers for adaptive bitrate control (in-place rebuild, or a warm
// multi-encoder ladder with atomic selection). Output is loose compressed
// packets for a real-time transport; muxing and networking live elsewhere.

use std::sync::Once;

use ffmpeg_the_third as ffmpeg;

pub mod adaptive;
pub mod decode;
pub mod defaults;
pub mod demux;
pub mod encode;
pub mod error;
pub mod filter;
pub mod filter_spec;
pub mod info;
pub mod multi;
pub mod notch;
pub mod settings;
pub mod transcoder;

mod ffi_ext;
mod pools;
mod stage;

pub use adaptive::{AdaptiveConfig, AdaptiveEncoder};
pub use decode::Decoder;
pub use demux::{Demuxer, DemuxerConfig, StreamPolicy};
pub use encode::{Encoder, EncoderBuilder};
pub use error::{Error, Result};
pub use filter::Filter;
pub use filter_spec::FilterSpec;
pub use info::{AudioInfo, FrameInfo, StreamInfo, VideoInfo};
pub use multi::{MultiConfig, MultiEncoder};
pub use notch::{NotchSpec, PropNoisePlan, PropNoiseUpdater};
pub use settings::{BitrateControl, CodecSettings, Vp8Settings, X264Opts, X264Settings};
pub use transcoder::{BitrateCallback, Transcoder, TranscoderBuilder};

pub use aircast_core::{BoundedQueue, CancelToken, PauseGate, Pool, PopError};

// Re-exported so callers can name codec ids, pixel formats and rationals
// without depending on the binding themselves.
pub use ffmpeg_the_third as media_sys;

static INIT: Once = Once::new();

/// Process-wide one-shot ffmpeg initialisation, including the capture-device
/// registry needed for `alsa`/`avfoundation` inputs. Every entry point that
/// touches the media library calls this first.
pub(crate) fn ensure_init() {
    INIT.call_once(|| {
        ffmpeg::init().expect("initialise ffmpeg");
        ffmpeg::device::register_all();
    });
}
