// crates/aircast-media/src/encode.rs
//
// Encoder stage: filtered frames in, compressed packets out. Every encoder
// instance is built by an EncoderBuilder so the adaptive wrappers can rebuild
// it with changed settings, and carries its own packet queue, worker and
// child cancel token so one instance can be retired without touching the
// rest of the pipeline.

use std::slice;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::{codec, encoder, ffi, Dictionary, Frame, Packet, Rational};
use parking_lot::Mutex;
use tracing::{debug, warn};

use aircast_core::{BoundedQueue, CancelToken};

use crate::error::{Error, Result};
use crate::ffi_ext::is_drained;
use crate::info::{AudioInfo, FrameInfo, VideoInfo};
use crate::pools;
use crate::settings::CodecSettings;
use crate::stage::{spawn_stage, Drain, Step};

const DEFAULT_CAPACITY: usize = 256;
const POP_DEADLINE: Duration = Duration::from_millis(50);

pub(crate) enum OpenedEncoder {
    Video(encoder::video::Video),
    Audio(encoder::audio::Audio),
}

impl OpenedEncoder {
    fn send_frame(&mut self, frame: &Frame) -> std::result::Result<(), ffmpeg::Error> {
        match self {
            OpenedEncoder::Video(e) => e.send_frame(frame),
            OpenedEncoder::Audio(e) => e.send_frame(frame),
        }
    }

    fn receive_packet(&mut self, packet: &mut Packet) -> std::result::Result<(), ffmpeg::Error> {
        match self {
            OpenedEncoder::Video(e) => e.receive_packet(packet),
            OpenedEncoder::Audio(e) => e.receive_packet(packet),
        }
    }

    fn as_ptr(&self) -> *const ffi::AVCodecContext {
        match self {
            OpenedEncoder::Video(e) => e.as_ptr(),
            OpenedEncoder::Audio(e) => e.as_ptr(),
        }
    }
}

struct EncodeStep {
    encoder: OpenedEncoder,
}

// Owned exclusively by the stage worker after start(); the binding's codec
// contexts are !Send only for an owner field we never populate.
unsafe impl Send for EncodeStep {}

impl Step for EncodeStep {
    type In = Frame;
    type Out = Packet;

    fn feed(&mut self, frame: &mut Frame) -> Result<()> {
        match self.encoder.send_frame(&*frame) {
            Ok(()) => Ok(()),
            // Codec back-pressure: drain below, prefer fresh frames over old.
            Err(ref err) if is_drained(err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn drain(&mut self, packet: &mut Packet) -> Result<Drain> {
        match self.encoder.receive_packet(packet) {
            Ok(()) => Ok(Drain::Produced),
            Err(ref err) if is_drained(err) => Ok(Drain::Exhausted),
            Err(err) => Err(err.into()),
        }
    }
}

/// Everything needed to (re)build an encoder instance: codec, the shared
/// settings table, queue capacity and the frame description of the producer.
///
/// The settings table is shared with the adaptive wrappers; it is only ever
/// locked for reads/mutations, never across a codec call.
pub struct EncoderBuilder {
    codec_id: codec::Id,
    settings: Arc<Mutex<Box<dyn CodecSettings>>>,
    capacity: usize,
    source: FrameInfo,
}

impl EncoderBuilder {
    pub fn new(
        codec_id: codec::Id,
        settings: impl CodecSettings + 'static,
        source: FrameInfo,
    ) -> Self {
        Self::boxed(codec_id, Box::new(settings), source)
    }

    pub fn boxed(
        codec_id: codec::Id,
        settings: Box<dyn CodecSettings>,
        source: FrameInfo,
    ) -> Self {
        Self {
            codec_id,
            settings: Arc::new(Mutex::new(settings)),
            capacity: DEFAULT_CAPACITY,
            source,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Retarget the settings table. Takes effect on the next `build`.
    pub fn update_bitrate(&self, bps: i64) -> Result<()> {
        let mut settings = self.settings.lock();
        match settings.bitrate_control() {
            Some(control) => {
                control.set_target_bitrate(bps);
                Ok(())
            }
            None => Err(Error::BitrateControlUnsupported),
        }
    }

    /// Current target from the settings table, in bits per second.
    pub fn target_bitrate(&self) -> Result<i64> {
        self.settings
            .lock()
            .target_bitrate()
            .ok_or(Error::BitrateControlUnsupported)
    }

    pub(crate) fn queue_capacity(&self) -> usize {
        self.capacity
    }

    /// Build and open an encoder reading from `upstream`. The worker is not
    /// started; the caller decides when.
    pub fn build(&self, upstream: Arc<BoundedQueue<Frame>>, cancel: &CancelToken) -> Result<Encoder> {
        self.build_with_pool(upstream, cancel, pools::packet_pool())
    }

    /// Like `build`, but producing into a caller-supplied packet pool. The
    /// adaptive wrapper shares one pool across encoder generations and its
    /// stable output queue so shells keep circulating across swaps instead
    /// of piling up in whichever pool last saw them.
    pub(crate) fn build_with_pool(
        &self,
        upstream: Arc<BoundedQueue<Frame>>,
        cancel: &CancelToken,
        pool: Arc<aircast_core::Pool<Packet>>,
    ) -> Result<Encoder> {
        crate::ensure_init();

        let codec =
            encoder::find(self.codec_id).ok_or(Error::CodecNotFound(self.codec_id))?;

        // Materialize the dictionary under the settings lock, then drop the
        // lock before any codec call.
        let mut options = Dictionary::new();
        let target_bitrate = {
            let settings = self.settings.lock();
            settings.for_each(&mut |key, value| {
                options.set(key, value);
                Ok(())
            })?;
            settings.target_bitrate()
        };

        let opened = match &self.source {
            FrameInfo::Video(video) => open_video(codec, video, options)?,
            FrameInfo::Audio(audio) => open_audio(codec, audio, options)?,
        };

        let (sps, pps) = if self.codec_id == codec::Id::H264 {
            split_parameter_sets(extradata(&opened))
        } else {
            (Vec::new(), Vec::new())
        };

        let packet_duration = expected_packet_duration(&self.source, &opened);

        Ok(Encoder {
            queue: BoundedQueue::with_capacity(self.capacity, pool),
            upstream,
            time_base: self.source.time_base(),
            packet_duration,
            target_bitrate,
            sps,
            pps,
            cancel: cancel.child(),
            step: Mutex::new(Some(EncodeStep { encoder: opened })),
            worker: Mutex::new(None),
        })
    }
}

pub struct Encoder {
    queue: Arc<BoundedQueue<Packet>>,
    upstream: Arc<BoundedQueue<Frame>>,
    time_base: Rational,
    packet_duration: Duration,
    target_bitrate: Option<i64>,
    sps: Vec<u8>,
    pps: Vec<u8>,
    cancel: CancelToken,
    step: Mutex<Option<EncodeStep>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Encoder {
    /// The compressed-packet queue this instance produces into.
    pub fn packets(&self) -> &Arc<BoundedQueue<Packet>> {
        &self.queue
    }

    /// Out-of-band parameter sets for signaling (H.264: Annex-B SPS / PPS).
    pub fn parameter_sets(&self) -> (Vec<u8>, Vec<u8>) {
        (self.sps.clone(), self.pps.clone())
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Nominal duration of one output packet.
    pub fn packet_duration(&self) -> Duration {
        self.packet_duration
    }

    /// Target bitrate recorded at build time, from the settings table.
    pub fn target_bitrate(&self) -> Option<i64> {
        self.target_bitrate
    }

    pub fn start(&self) {
        let Some(step) = self.step.lock().take() else {
            return;
        };
        *self.worker.lock() = Some(spawn_stage(
            "encode",
            step,
            Arc::clone(&self.upstream),
            Arc::clone(&self.queue),
            self.cancel.clone(),
            POP_DEADLINE,
        ));
    }

    /// Cancel this instance's worker and wait for it to close its queue.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("encode worker panicked");
            }
        }
    }
}

fn open_video(
    codec: ffmpeg::Codec,
    info: &VideoInfo,
    options: Dictionary,
) -> Result<OpenedEncoder> {
    let mut enc = codec::Context::new_with_codec(codec).encoder().video()?;
    enc.set_width(info.width);
    enc.set_height(info.height);
    enc.set_format(info.format);
    enc.set_time_base(info.time_base);
    enc.set_frame_rate(Some(info.frame_rate));
    enc.set_flags(codec::Flags::GLOBAL_HEADER);

    let opened = enc.open_as_with(codec, options)?;
    debug!(
        width = info.width,
        height = info.height,
        "video encoder opened"
    );
    Ok(OpenedEncoder::Video(opened))
}

fn open_audio(
    codec: ffmpeg::Codec,
    info: &AudioInfo,
    options: Dictionary,
) -> Result<OpenedEncoder> {
    use ffmpeg::util::channel_layout::ChannelLayout;

    let mut enc = codec::Context::new_with_codec(codec).encoder().audio()?;
    enc.set_rate(info.rate as i32);
    enc.set_format(info.format);
    enc.set_ch_layout(if info.channels >= 2 {
        ChannelLayout::STEREO
    } else {
        ChannelLayout::MONO
    });
    enc.set_flags(codec::Flags::GLOBAL_HEADER);
    unsafe {
        let raw = enc.as_mut_ptr();
        (*raw).time_base = info.time_base.into();
        // Opus and friends are still flagged experimental in some builds.
        (*raw).strict_std_compliance = ffi::FF_COMPLIANCE_EXPERIMENTAL;
    }

    let opened = enc.open_as_with(codec, options)?;
    debug!(rate = info.rate, "audio encoder opened");
    Ok(OpenedEncoder::Audio(opened))
}

fn expected_packet_duration(source: &FrameInfo, opened: &OpenedEncoder) -> Duration {
    match source {
        FrameInfo::Video(v) if v.frame_rate.numerator() > 0 => {
            Duration::from_secs_f64(1.0 / f64::from(v.frame_rate))
        }
        FrameInfo::Video(_) => Duration::from_secs_f64(1.0 / 30.0),
        FrameInfo::Audio(a) => {
            let frame_size = match opened {
                OpenedEncoder::Audio(e) => e.frame_size().max(1),
                OpenedEncoder::Video(_) => 1,
            };
            Duration::from_secs_f64(frame_size as f64 / a.rate.max(1) as f64)
        }
    }
}

fn extradata(opened: &OpenedEncoder) -> &[u8] {
    unsafe {
        let raw = opened.as_ptr();
        let data = (*raw).extradata;
        let size = (*raw).extradata_size;
        if data.is_null() || size <= 0 {
            &[]
        } else {
            slice::from_raw_parts(data, size as usize)
        }
    }
}

/// Split GLOBAL_HEADER extradata into Annex-B SPS and PPS.
///
/// Walks `0x00000001` start codes; nal_unit_type 7 starts the SPS (up to the
/// next start code), type 8 starts the PPS (through the end of extradata).
fn split_parameter_sets(extradata: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut sps = Vec::new();
    let mut pps = Vec::new();

    if extradata.len() < 5 {
        return (sps, pps);
    }

    let mut i = 0;
    while i + 4 < extradata.len() {
        if extradata[i..i + 4] != [0, 0, 0, 1] {
            i += 1;
            continue;
        }
        let nal_type = extradata[i + 4] & 0x1F;

        let mut next_start = extradata.len();
        let mut j = i + 4;
        while j + 4 < extradata.len() {
            if extradata[j..j + 4] == [0, 0, 0, 1] {
                next_start = j;
                break;
            }
            j += 1;
        }

        match nal_type {
            7 => sps = extradata[i..next_start].to_vec(),
            8 => pps = extradata[i..].to_vec(),
            _ => {}
        }

        i = next_start;
    }

    (sps, pps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: [u8; 4] = [0, 0, 0, 1];

    #[test]
    fn splits_sps_then_pps() {
        let mut extradata = Vec::new();
        extradata.extend_from_slice(&START);
        extradata.extend_from_slice(&[0x67, 0x42, 0x00, 0x1F, 0xAB]); // SPS
        extradata.extend_from_slice(&START);
        extradata.extend_from_slice(&[0x68, 0xCE, 0x38, 0x80]); // PPS

        let (sps, pps) = split_parameter_sets(&extradata);

        assert_eq!(&sps[..4], &START);
        assert_eq!(sps[4] & 0x1F, 7);
        assert_eq!(sps.len(), 9);

        assert_eq!(&pps[..4], &START);
        assert_eq!(pps[4] & 0x1F, 8);
        assert_eq!(pps.len(), 8);
    }

    #[test]
    fn pps_runs_through_end_of_extradata() {
        let mut extradata = Vec::new();
        extradata.extend_from_slice(&START);
        extradata.extend_from_slice(&[0x68, 0xCE, 0x38, 0x80, 0x00, 0x00]);

        let (sps, pps) = split_parameter_sets(&extradata);
        assert!(sps.is_empty());
        assert_eq!(pps.len(), extradata.len());
    }

    #[test]
    fn garbage_extradata_yields_nothing() {
        let (sps, pps) = split_parameter_sets(&[0xDE, 0xAD, 0xBE, 0xEF, 0x07]);
        assert!(sps.is_empty());
        assert!(pps.is_empty());
    }

    #[test]
    fn non_parameter_nal_units_are_skipped() {
        let mut extradata = Vec::new();
        extradata.extend_from_slice(&START);
        extradata.extend_from_slice(&[0x06, 0x05]); // SEI, ignored
        extradata.extend_from_slice(&START);
        extradata.extend_from_slice(&[0x67, 0x64, 0x00]); // SPS

        let (sps, pps) = split_parameter_sets(&extradata);
        assert_eq!(sps[4] & 0x1F, 7);
        assert!(pps.is_empty());
    }
}
