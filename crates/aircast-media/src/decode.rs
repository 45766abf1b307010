// crates/aircast-media/src/decode.rs
//
// Decoder: compressed packets in, decoded frames out. The decoder context is
// configured from the demuxer's stream description and opened before the
// worker starts; the frame description it publishes is what the filter
// configures its source from.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::{codec, decoder, ffi, media, Frame, Packet};
use parking_lot::Mutex;
use tracing::warn;

use aircast_core::{BoundedQueue, CancelToken};

use crate::demux::Demuxer;
use crate::error::{Error, Result};
use crate::ffi_ext::is_drained;
use crate::info::{AudioInfo, FrameInfo, StreamInfo, VideoInfo};
use crate::pools;
use crate::stage::{spawn_stage, Drain, Step};

const DEFAULT_CAPACITY: usize = 256;
const POP_DEADLINE: Duration = Duration::from_millis(50);

pub(crate) enum OpenedDecoder {
    Video(decoder::Video),
    Audio(decoder::Audio),
}

impl OpenedDecoder {
    fn send_packet(&mut self, packet: &Packet) -> std::result::Result<(), ffmpeg::Error> {
        match self {
            OpenedDecoder::Video(d) => d.send_packet(packet),
            OpenedDecoder::Audio(d) => d.send_packet(packet),
        }
    }

    fn receive_frame(&mut self, frame: &mut Frame) -> std::result::Result<(), ffmpeg::Error> {
        match self {
            OpenedDecoder::Video(d) => d.receive_frame(frame),
            OpenedDecoder::Audio(d) => d.receive_frame(frame),
        }
    }
}

struct DecodeStep {
    decoder: OpenedDecoder,
    is_video: bool,
}

// The opened decoder is owned exclusively by the stage worker; the binding
// marks codec contexts !Send only for an owner field we never populate.
unsafe impl Send for DecodeStep {}

impl Step for DecodeStep {
    type In = Packet;
    type Out = Frame;

    fn feed(&mut self, packet: &mut Packet) -> Result<()> {
        match self.decoder.send_packet(&*packet) {
            Ok(()) => Ok(()),
            // Codec back-pressure: draining below makes room. The packet is
            // not retried; recover-continue prefers fresh input over old.
            Err(ref err) if is_drained(err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn drain(&mut self, frame: &mut Frame) -> Result<Drain> {
        match self.decoder.receive_frame(frame) {
            Ok(()) => {
                if self.is_video {
                    // Downstream chooses its own GOP structure; the source's
                    // picture typing must not leak through.
                    unsafe {
                        (*frame.as_mut_ptr()).pict_type = ffi::AVPictureType::AV_PICTURE_TYPE_NONE;
                    }
                }
                Ok(Drain::Produced)
            }
            Err(ref err) if is_drained(err) => Ok(Drain::Exhausted),
            Err(err) => Err(err.into()),
        }
    }
}

pub struct Decoder {
    queue: Arc<BoundedQueue<Frame>>,
    upstream: Arc<BoundedQueue<Packet>>,
    info: FrameInfo,
    cancel: CancelToken,
    step: Mutex<Option<DecodeStep>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Decoder {
    pub fn new(demuxer: &Demuxer, cancel: &CancelToken) -> Result<Self> {
        Self::with_capacity(demuxer, DEFAULT_CAPACITY, cancel)
    }

    pub fn with_capacity(demuxer: &Demuxer, capacity: usize, cancel: &CancelToken) -> Result<Self> {
        let stream = demuxer.stream_info();
        let (decoder, info) = open_decoder(stream)?;

        Ok(Self {
            queue: BoundedQueue::with_capacity(capacity, pools::frame_pool()),
            upstream: Arc::clone(demuxer.packets()),
            info,
            cancel: cancel.clone(),
            step: Mutex::new(Some(DecodeStep {
                is_video: matches!(decoder, OpenedDecoder::Video(_)),
                decoder,
            })),
            worker: Mutex::new(None),
        })
    }

    /// Frame description of the decoder output.
    pub fn frame_info(&self) -> &FrameInfo {
        &self.info
    }

    /// The decoded-frame queue the filter consumes.
    pub fn frames(&self) -> &Arc<BoundedQueue<Frame>> {
        &self.queue
    }

    pub fn start(&self) {
        let Some(step) = self.step.lock().take() else {
            return;
        };
        *self.worker.lock() = Some(spawn_stage(
            "decode",
            step,
            Arc::clone(&self.upstream),
            Arc::clone(&self.queue),
            self.cancel.clone(),
            POP_DEADLINE,
        ));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("decode worker panicked");
            }
        }
    }
}

fn open_decoder(stream: &StreamInfo) -> Result<(OpenedDecoder, FrameInfo)> {
    if decoder::find(stream.codec_id).is_none() {
        return Err(Error::CodecNotFound(stream.codec_id));
    }

    let mut ctx = codec::Context::from_parameters(stream.params.to_parameters())?;
    unsafe {
        let raw = ctx.as_mut_ptr();
        (*raw).time_base = stream.time_base.into();
        if stream.medium == media::Type::Video {
            (*raw).framerate = stream.frame_rate.into();
        }
    }

    match stream.medium {
        media::Type::Video => {
            let opened = ctx.decoder().video()?;
            let info = FrameInfo::Video(VideoInfo {
                width: opened.width(),
                height: opened.height(),
                format: opened.format(),
                sample_aspect_ratio: opened.aspect_ratio(),
                color_space: opened.color_space(),
                color_range: opened.color_range(),
                frame_rate: stream.frame_rate,
                time_base: stream.time_base,
            });
            Ok((OpenedDecoder::Video(opened), info))
        }
        media::Type::Audio => {
            let opened = ctx.decoder().audio()?;
            let info = FrameInfo::Audio(AudioInfo {
                rate: opened.rate(),
                format: opened.format(),
                channels: opened.ch_layout().channels() as u32,
                time_base: stream.time_base,
            });
            Ok((OpenedDecoder::Audio(opened), info))
        }
        other => Err(Error::UnsupportedMedium(other)),
    }
}
