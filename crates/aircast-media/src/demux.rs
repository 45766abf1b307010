// crates/aircast-media/src/demux.rs
//
// Demuxer: opens a container (file path, capture device, rtsp:// URL),
// selects one elementary stream and feeds its compressed packets into a
// bounded queue. The input is probed once on the caller's thread so the
// stream description is available to the decoder before any worker runs.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::{format, media, Dictionary, Packet, Rational};
use parking_lot::Mutex;
use tracing::{debug, warn};

use aircast_core::{BoundedQueue, CancelToken};

use crate::error::{Error, Result};
use crate::ffi_ext::{self, is_again};
use crate::info::StreamInfo;
use crate::pools;

const DEFAULT_CAPACITY: usize = 256;

/// Back-off after a failed read so a source at EOF does not spin a core.
const READ_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Which elementary stream the demuxer latches onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPolicy {
    /// First video stream, the default for camera / RTSP sources.
    PreferVideo,
    /// First stream of any type (general mode, e.g. audio-only devices).
    FirstStream,
}

/// Builder-style demuxer configuration.
///
/// The option presets mirror what the underlying library needs for each
/// source kind; anything else can be passed through with `option()`.
#[derive(Clone, Debug)]
pub struct DemuxerConfig {
    url: String,
    input_format: Option<&'static str>,
    options: Vec<(String, String)>,
    capacity: usize,
    policy: StreamPolicy,
}

impl DemuxerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            input_format: None,
            options: Vec::new(),
            capacity: DEFAULT_CAPACITY,
            policy: StreamPolicy::PreferVideo,
        }
    }

    /// Low-latency RTSP ingest: TCP transport, 5 s socket timeout, no
    /// buffering or packet reordering.
    pub fn rtsp(self) -> Self {
        self.option("rtsp_transport", "tcp")
            .option("stimeout", "5000000")
            .option("fflags", "nobuffer")
            .option("flags", "low_delay")
            .option("reorder_queue_size", "0")
    }

    /// Read a file at its native rate instead of as fast as possible.
    pub fn realtime_file(self) -> Self {
        self.option("re", "")
    }

    /// Capture from an ALSA device.
    pub fn alsa(mut self) -> Self {
        self.input_format = Some("alsa");
        self
    }

    /// Capture from an AVFoundation camera (macOS), 1280x720 uyvy422 at 30.
    pub fn avfoundation(mut self) -> Self {
        self.input_format = Some("avfoundation");
        self.option("video_size", "1280x720")
            .option("framerate", "30")
            .option("pixel_format", "uyvy422")
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn any_stream(mut self) -> Self {
        self.policy = StreamPolicy::FirstStream;
        self
    }
}

// The format context is owned exclusively by the read worker once start()
// runs; the binding marks it !Send only for its internal owner bookkeeping.
struct DemuxInput(format::context::Input);
unsafe impl Send for DemuxInput {}

pub struct Demuxer {
    queue: Arc<BoundedQueue<Packet>>,
    info: Arc<StreamInfo>,
    cancel: CancelToken,
    input: Mutex<Option<DemuxInput>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Demuxer {
    pub fn open(config: DemuxerConfig, cancel: &CancelToken) -> Result<Self> {
        crate::ensure_init();

        let mut options = Dictionary::new();
        for (key, value) in &config.options {
            options.set(key, value);
        }

        let input = ffi_ext::open_input(&config.url, config.input_format, options)?;
        let info = Arc::new(select_stream(&input, config.policy)?);
        debug!(
            url = %config.url,
            stream = info.index,
            codec = ?info.codec_id,
            medium = ?info.medium,
            "demuxer ready"
        );

        Ok(Self {
            queue: BoundedQueue::with_capacity(config.capacity, pools::packet_pool()),
            info,
            cancel: cancel.clone(),
            input: Mutex::new(Some(DemuxInput(input))),
            worker: Mutex::new(None),
        })
    }

    /// Stream description for downstream configuration.
    pub fn stream_info(&self) -> &Arc<StreamInfo> {
        &self.info
    }

    /// The packet queue the decoder consumes.
    pub fn packets(&self) -> &Arc<BoundedQueue<Packet>> {
        &self.queue
    }

    pub fn start(&self) {
        let Some(DemuxInput(mut input)) = self.input.lock().take() else {
            return;
        };
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();
        let stream_index = self.info.index;

        let handle = thread::Builder::new()
            .name("demux".into())
            .spawn(move || {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let mut packet = queue.acquire();
                    match packet.read(&mut input) {
                        Ok(()) => {}
                        Err(err) => {
                            // Transient: live sources stall, files end. Keep
                            // polling until the pipeline is cancelled.
                            queue.release(packet);
                            if !is_again(&err) {
                                debug!(%err, "read failed, retrying");
                            }
                            thread::sleep(READ_RETRY_DELAY);
                            continue;
                        }
                    }
                    if packet.stream() != stream_index {
                        queue.release(packet);
                        continue;
                    }
                    if queue.push(packet).is_err() {
                        break;
                    }
                }
                queue.close();
            })
            .expect("spawn demux worker");

        *self.worker.lock() = Some(handle);
    }

    /// Wait for the read worker to exit. The pipeline token must already be
    /// cancelled (or the queue closed) for this to return promptly.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("demux worker panicked");
            }
        }
    }
}

fn select_stream(input: &format::context::Input, policy: StreamPolicy) -> Result<StreamInfo> {
    let stream = match policy {
        StreamPolicy::PreferVideo => input
            .streams()
            .best(media::Type::Video)
            .or_else(|| input.streams().next()),
        StreamPolicy::FirstStream => input.streams().next(),
    }
    .ok_or(Error::NoStream)?;

    let params = ffi_ext::OwnedParameters::copy_of(&stream.parameters())?;
    let codec_id = params.codec_id();
    let medium = params.medium();

    // avg_frame_rate is the container's guess; r_frame_rate is the fallback
    // for raw capture devices that do not advertise an average.
    let frame_rate = {
        let avg = stream.avg_frame_rate();
        if avg.numerator() > 0 {
            avg
        } else {
            stream.rate()
        }
    };

    Ok(StreamInfo {
        index: stream.index(),
        params,
        codec_id,
        medium,
        time_base: stream.time_base(),
        frame_rate: normalize(frame_rate),
    })
}

fn normalize(rate: Rational) -> Rational {
    if rate.numerator() > 0 && rate.denominator() > 0 {
        rate
    } else {
        Rational::new(0, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_preset_sets_transport_options() {
        let config = DemuxerConfig::new("rtsp://10.0.0.2/stream").rtsp();
        let has = |k: &str, v: &str| {
            config
                .options
                .iter()
                .any(|(key, value)| key == k && value == v)
        };
        assert!(has("rtsp_transport", "tcp"));
        assert!(has("stimeout", "5000000"));
        assert!(has("fflags", "nobuffer"));
        assert!(has("flags", "low_delay"));
        assert!(has("reorder_queue_size", "0"));
    }

    #[test]
    fn avfoundation_preset_forces_format_and_capture_geometry() {
        let config = DemuxerConfig::new("0").avfoundation();
        assert_eq!(config.input_format, Some("avfoundation"));
        assert!(config
            .options
            .iter()
            .any(|(k, v)| k == "video_size" && v == "1280x720"));
        assert!(config.options.iter().any(|(k, v)| k == "framerate" && v == "30"));
        assert!(config
            .options
            .iter()
            .any(|(k, v)| k == "pixel_format" && v == "uyvy422"));
    }

    #[test]
    fn defaults_are_video_first_with_256_deep_queue() {
        let config = DemuxerConfig::new("input.mp4");
        assert_eq!(config.capacity, 256);
        assert_eq!(config.policy, StreamPolicy::PreferVideo);
        assert_eq!(config.any_stream().policy, StreamPolicy::FirstStream);
    }
}
