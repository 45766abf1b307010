// crates/aircast-media/src/transcoder.rs
//
// Transcoder: composes demux -> decode -> filter -> encode behind one
// cancellation scope and exposes the packet/control surface the transport
// layer consumes. The encoder slot is a tagged variant; control calls a
// variant does not implement return Unsupported instead of probing at
// runtime.

use std::sync::Arc;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::{codec, media, Packet};

use aircast_core::{CancelToken, PopError};

use crate::adaptive::{AdaptiveConfig, AdaptiveEncoder};
use crate::decode::Decoder;
use crate::demux::{Demuxer, DemuxerConfig};
use crate::encode::{Encoder, EncoderBuilder};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::filter_spec::FilterSpec;
use crate::multi::{MultiConfig, MultiEncoder};
use crate::notch::{PropNoisePlan, PropNoiseUpdater};
use crate::settings::CodecSettings;

/// Callback handed to an external bandwidth estimator.
pub type BitrateCallback = Box<dyn Fn(i64) -> Result<()> + Send + Sync>;

enum EncoderStage {
    Plain(Encoder),
    Adaptive(AdaptiveEncoder),
    Multi(MultiEncoder),
}

impl EncoderStage {
    fn start(&self) {
        match self {
            EncoderStage::Plain(e) => e.start(),
            EncoderStage::Adaptive(e) => e.start(),
            EncoderStage::Multi(e) => e.start(),
        }
    }

    fn stop(&self) {
        match self {
            EncoderStage::Plain(e) => e.stop(),
            EncoderStage::Adaptive(e) => e.stop(),
            EncoderStage::Multi(e) => e.stop(),
        }
    }

    fn wait_for_packet(
        &self,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> std::result::Result<Packet, PopError> {
        match self {
            EncoderStage::Plain(e) => e.packets().pop(deadline, cancel),
            EncoderStage::Adaptive(e) => e.wait_for_packet(deadline),
            EncoderStage::Multi(e) => e.wait_for_packet(deadline),
        }
    }

    fn release_packet(&self, packet: Packet) {
        match self {
            EncoderStage::Plain(e) => e.packets().release(packet),
            EncoderStage::Adaptive(e) => e.release_packet(packet),
            EncoderStage::Multi(e) => e.release_packet(packet),
        }
    }

    fn parameter_sets(&self) -> (Vec<u8>, Vec<u8>) {
        match self {
            EncoderStage::Plain(e) => e.parameter_sets(),
            EncoderStage::Adaptive(e) => e.parameter_sets(),
            EncoderStage::Multi(e) => e.parameter_sets(),
        }
    }

    fn update_bitrate(&self, bps: i64) -> Result<()> {
        match self {
            EncoderStage::Plain(_) => Err(Error::Unsupported),
            EncoderStage::Adaptive(e) => e.update_bitrate(bps),
            EncoderStage::Multi(e) => e.update_bitrate(bps),
        }
    }

    fn applied_bitrate(&self) -> Result<i64> {
        match self {
            EncoderStage::Plain(e) => e.target_bitrate().ok_or(Error::BitrateControlUnsupported),
            EncoderStage::Adaptive(e) => e.applied_bitrate(),
            EncoderStage::Multi(e) => Ok(e.active_bitrate()),
        }
    }

    fn pause_encoding(&self) -> Result<()> {
        match self {
            EncoderStage::Plain(_) => Err(Error::Unsupported),
            EncoderStage::Adaptive(e) => {
                e.pause_encoding();
                Ok(())
            }
            EncoderStage::Multi(e) => {
                e.pause_encoding();
                Ok(())
            }
        }
    }

    fn unpause_encoding(&self) -> Result<()> {
        match self {
            EncoderStage::Plain(_) => Err(Error::Unsupported),
            EncoderStage::Adaptive(e) => {
                e.unpause_encoding();
                Ok(())
            }
            EncoderStage::Multi(e) => {
                e.unpause_encoding();
                Ok(())
            }
        }
    }
}

enum EncoderChoice {
    Plain {
        codec_id: codec::Id,
        settings: Box<dyn CodecSettings>,
    },
    Adaptive {
        codec_id: codec::Id,
        settings: Box<dyn CodecSettings>,
        config: AdaptiveConfig,
    },
    Multi {
        codec_id: codec::Id,
        settings: Box<dyn CodecSettings>,
        config: MultiConfig,
    },
}

pub struct TranscoderBuilder {
    demuxer: DemuxerConfig,
    decoder_capacity: usize,
    filter: Option<FilterSpec>,
    filter_capacity: usize,
    encoder_capacity: usize,
    encoder: Option<EncoderChoice>,
    noise_plan: Option<PropNoisePlan>,
}

impl TranscoderBuilder {
    pub fn new(demuxer: DemuxerConfig) -> Self {
        Self {
            demuxer,
            decoder_capacity: 256,
            filter: None,
            filter_capacity: 256,
            encoder_capacity: 256,
            encoder: None,
            noise_plan: None,
        }
    }

    pub fn decoder_capacity(mut self, capacity: usize) -> Self {
        self.decoder_capacity = capacity;
        self
    }

    pub fn filter(mut self, spec: FilterSpec) -> Self {
        self.filter = Some(spec);
        self
    }

    pub fn filter_capacity(mut self, capacity: usize) -> Self {
        self.filter_capacity = capacity;
        self
    }

    pub fn encoder_capacity(mut self, capacity: usize) -> Self {
        self.encoder_capacity = capacity;
        self
    }

    /// Fixed-rate encoder with no control surface.
    pub fn encode(mut self, codec_id: codec::Id, settings: impl CodecSettings + 'static) -> Self {
        self.encoder = Some(EncoderChoice::Plain {
            codec_id,
            settings: Box::new(settings),
        });
        self
    }

    /// Rebuild-on-update adaptive encoder.
    pub fn encode_adaptive(
        mut self,
        codec_id: codec::Id,
        settings: impl CodecSettings + 'static,
        config: AdaptiveConfig,
    ) -> Self {
        self.encoder = Some(EncoderChoice::Adaptive {
            codec_id,
            settings: Box::new(settings),
            config,
        });
        self
    }

    /// Warm multi-encoder ladder with atomic selection.
    pub fn encode_multi(
        mut self,
        codec_id: codec::Id,
        settings: impl CodecSettings + 'static,
        config: MultiConfig,
    ) -> Self {
        self.encoder = Some(EncoderChoice::Multi {
            codec_id,
            settings: Box::new(settings),
            config,
        });
        self
    }

    /// Telemetry-driven notch retuning against the filter's notch banks.
    pub fn prop_noise(mut self, plan: PropNoisePlan) -> Self {
        self.noise_plan = Some(plan);
        self
    }

    pub fn build(self) -> Result<Transcoder> {
        let cancel = CancelToken::new();

        let demuxer = Demuxer::open(self.demuxer, &cancel)?;
        let decoder = Decoder::with_capacity(&demuxer, self.decoder_capacity, &cancel)?;

        let spec = match self.filter {
            Some(spec) => spec,
            None => match decoder.frame_info().medium() {
                media::Type::Audio => FilterSpec::audio(),
                _ => FilterSpec::video(),
            },
        };
        let filter = Arc::new(Filter::with_capacity(
            &decoder,
            spec,
            self.filter_capacity,
            &cancel,
        )?);

        let choice = self.encoder.ok_or(Error::NoEncoderConfigured)?;
        let frames = Arc::clone(filter.frames());
        let source = filter.frame_info().clone();
        let encoder = match choice {
            EncoderChoice::Plain { codec_id, settings } => {
                let builder =
                    EncoderBuilder::boxed(codec_id, settings, source).capacity(self.encoder_capacity);
                EncoderStage::Plain(builder.build(frames, &cancel)?)
            }
            EncoderChoice::Adaptive {
                codec_id,
                settings,
                config,
            } => {
                let builder =
                    EncoderBuilder::boxed(codec_id, settings, source).capacity(self.encoder_capacity);
                EncoderStage::Adaptive(AdaptiveEncoder::new(config, builder, frames, &cancel)?)
            }
            EncoderChoice::Multi {
                codec_id,
                settings,
                config,
            } => {
                let builder =
                    EncoderBuilder::boxed(codec_id, settings, source).capacity(self.encoder_capacity);
                EncoderStage::Multi(MultiEncoder::new(config, builder, frames, &cancel)?)
            }
        };

        let updater = self
            .noise_plan
            .map(|plan| Arc::new(PropNoiseUpdater::new(Arc::clone(&filter), plan, &cancel)));

        Ok(Transcoder {
            cancel,
            demuxer,
            decoder,
            filter,
            encoder: Arc::new(encoder),
            updater,
        })
    }
}

pub struct Transcoder {
    cancel: CancelToken,
    demuxer: Demuxer,
    decoder: Decoder,
    filter: Arc<Filter>,
    encoder: Arc<EncoderStage>,
    updater: Option<Arc<PropNoiseUpdater>>,
}

impl Transcoder {
    pub fn builder(demuxer: DemuxerConfig) -> TranscoderBuilder {
        TranscoderBuilder::new(demuxer)
    }

    /// Spawn every worker, source to sink.
    pub fn start(&self) {
        self.demuxer.start();
        self.decoder.start();
        self.filter.start();
        self.encoder.start();
        if let Some(updater) = &self.updater {
            updater.start();
        }
    }

    /// Cancel the ambient scope and wait for every worker to exit. Bounded
    /// by the queue deadlines; the shutdown cascades source to sink as each
    /// stage closes its output queue.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.demuxer.stop();
        self.decoder.stop();
        self.filter.stop();
        self.encoder.stop();
        if let Some(updater) = &self.updater {
            updater.stop();
        }
    }

    /// Pop the next encoded packet; the caller releases it when done.
    pub fn wait_for_packet(&self, deadline: Duration) -> std::result::Result<Packet, PopError> {
        self.encoder.wait_for_packet(deadline, &self.cancel)
    }

    pub fn release_packet(&self, packet: Packet) {
        self.encoder.release_packet(packet);
    }

    pub fn update_bitrate(&self, bps: i64) -> Result<()> {
        self.encoder.update_bitrate(bps)
    }

    /// The bitrate actually in effect after clamping and selection.
    pub fn applied_bitrate(&self) -> Result<i64> {
        self.encoder.applied_bitrate()
    }

    /// Bitrate-update callback for wiring into an external estimator.
    pub fn on_update_bitrate(&self) -> BitrateCallback {
        let encoder = Arc::clone(&self.encoder);
        Box::new(move |bps| encoder.update_bitrate(bps))
    }

    pub fn pause_encoding(&self) -> Result<()> {
        self.encoder.pause_encoding()
    }

    pub fn unpause_encoding(&self) -> Result<()> {
        self.encoder.unpause_encoding()
    }

    /// Out-of-band parameter sets (H.264: Annex-B SPS / PPS).
    pub fn parameter_sets(&self) -> (Vec<u8>, Vec<u8>) {
        self.encoder.parameter_sets()
    }

    /// The filter stage, for runtime commands and notch retuning.
    pub fn filter(&self) -> &Arc<Filter> {
        &self.filter
    }

    pub fn prop_noise(&self) -> Option<&Arc<PropNoiseUpdater>> {
        self.updater.as_ref()
    }
}
