// crates/aircast-media/src/filter_spec.rs
//
// Declarative filter-chain description. Each fragment maps to one filter in
// the media library's graph language; the assembled content string is parsed
// between the buffer source and sink. Fragments that change the frame
// geometry also feed `output_info`, so the encoder can be configured from the
// filter's declared output without probing the live graph.

use ffmpeg_the_third as ffmpeg;

use ffmpeg::format::Pixel;
use ffmpeg::{media, Rational};

use crate::defaults;
use crate::info::{AudioInfo, FrameInfo, VideoInfo};

/// Graph content for one media kind, assembled fragment by fragment.
#[derive(Clone, Debug)]
pub struct FilterSpec {
    medium: media::Type,
    fragments: Vec<String>,

    // Declared output overrides, layered over the upstream description.
    out_width: Option<u32>,
    out_height: Option<u32>,
    out_format: Option<Pixel>,
    out_fps: Option<u32>,
    out_rate: Option<u32>,
}

impl FilterSpec {
    pub fn video() -> Self {
        Self {
            medium: media::Type::Video,
            fragments: Vec::new(),
            out_width: None,
            out_height: None,
            out_format: None,
            out_fps: None,
            out_rate: None,
        }
    }

    pub fn audio() -> Self {
        Self {
            medium: media::Type::Audio,
            ..Self::video()
        }
    }

    /// The stock video chain: 1920x1080 yuv420p at 25 fps.
    pub fn video_defaults() -> Self {
        Self::video()
            .scale(defaults::VIDEO_WIDTH, defaults::VIDEO_HEIGHT)
            .pixel_format(defaults::VIDEO_PIX_FMT)
            .fps(defaults::VIDEO_FPS)
    }

    /// The stock audio chain: s16 stereo at 48 kHz in 960-sample frames.
    pub fn audio_defaults() -> Self {
        Self::audio()
            .audio_format(defaults::AUDIO_SAMPLE_FMT, defaults::AUDIO_CHANNEL_LAYOUT)
            .resample(defaults::AUDIO_SAMPLE_RATE)
            .frame_size(defaults::AUDIO_FRAME_SIZE)
    }

    pub fn medium(&self) -> media::Type {
        self.medium
    }

    // ── Video fragments ──────────────────────────────────────────────────

    pub fn scale(mut self, width: u32, height: u32) -> Self {
        self.fragments.push(format!("scale={width}:{height}"));
        self.out_width = Some(width);
        self.out_height = Some(height);
        self
    }

    pub fn pixel_format(mut self, format: Pixel) -> Self {
        match format.descriptor() {
            Some(desc) => {
                self.fragments.push(format!("format=pix_fmts={}", desc.name()));
                self.out_format = Some(format);
            }
            None => tracing::warn!(?format, "pixel format has no name, fragment skipped"),
        }
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fragments.push(format!("fps={fps}"));
        self.out_fps = Some(fps);
        self
    }

    // ── Audio fragments ──────────────────────────────────────────────────

    pub fn audio_format(mut self, sample_fmt: &str, channel_layout: &str) -> Self {
        self.fragments.push(format!(
            "aformat=sample_fmts={sample_fmt}:channel_layouts={channel_layout}"
        ));
        self
    }

    pub fn resample(mut self, rate: u32) -> Self {
        self.fragments.push(format!("aresample={rate}"));
        self.out_rate = Some(rate);
        self
    }

    /// Fixed output frame size in samples (`asetnsamples`).
    pub fn frame_size(mut self, samples: u32) -> Self {
        self.fragments.push(format!("asetnsamples={samples}"));
        self
    }

    /// Dynamic-range compression against sudden volume changes.
    pub fn compressor(mut self, threshold_db: i32, ratio: u32, attack: f32, release: f32) -> Self {
        self.fragments.push(format!(
            "acompressor=threshold={threshold_db}dB:ratio={ratio}:attack={attack}:release={release}"
        ));
        self
    }

    /// High-pass to cut low rumble and wind noise.
    pub fn highpass(mut self, id: &str, frequency: u32, poles: u32) -> Self {
        self.fragments
            .push(format!("highpass@{id}=frequency={frequency}:poles={poles}"));
        self
    }

    pub fn lowpass(mut self, id: &str, frequency: u32, poles: u32) -> Self {
        self.fragments
            .push(format!("lowpass@{id}=frequency={frequency}:poles={poles}"));
        self
    }

    /// One notch at a fixed frequency, addressable at runtime by `id`.
    pub fn band_reject(mut self, id: &str, frequency: f32, q: f32) -> Self {
        self.fragments.push(format!(
            "bandreject@{id}=frequency={frequency:.2}:width_type=q:width={q}"
        ));
        self
    }

    /// A bank of notches for one propeller: one `bandreject` instance per
    /// harmonic of the blade-pass frequency, each individually retunable.
    pub fn notch_bank(mut self, id: &str, fundamental: f32, harmonics: u8, q: f32) -> Self {
        for harmonic in 0..harmonics as usize {
            let frequency = fundamental * (harmonic + 1) as f32;
            self = self.band_reject(&notch_instance(id, harmonic), frequency, q);
        }
        self
    }

    /// Silence gate for the noise floor left after the notch bank.
    pub fn gate(mut self, threshold_db: i32, range_db: i32, attack: f32, release: f32) -> Self {
        self.fragments.push(format!(
            "agate=threshold={threshold_db}dB:range={range_db}dB:attack={attack}:release={release}"
        ));
        self
    }

    /// Speech-band emphasis.
    pub fn equalizer(mut self, frequency: u32, width: u32, gain_db: i32) -> Self {
        self.fragments.push(format!(
            "equalizer=f={frequency}:t=h:width={width}:g={gain_db}"
        ));
        self
    }

    /// Loudness normalisation. Belongs at the end of the chain.
    pub fn loudnorm(mut self, integrated: i32, true_peak: f32, range: u32) -> Self {
        self.fragments
            .push(format!("loudnorm=I={integrated}:TP={true_peak}:LRA={range}"));
        self
    }

    /// Non-local-means denoiser. Heavy; use with care.
    pub fn denoise(mut self, strength: f32) -> Self {
        self.fragments.push(format!("anlmdn=s={strength}"));
        self
    }

    /// Escape hatch: any filter expression the media library understands.
    pub fn raw(mut self, fragment: impl Into<String>) -> Self {
        self.fragments.push(fragment.into());
        self
    }

    // ── Graph assembly ───────────────────────────────────────────────────

    pub(crate) fn endpoints(&self) -> (&'static str, &'static str) {
        match self.medium {
            media::Type::Audio => ("abuffer", "abuffersink"),
            _ => ("buffer", "buffersink"),
        }
    }

    pub(crate) fn content(&self) -> String {
        self.fragments.join(",")
    }

    pub(crate) fn passthrough(&self) -> &'static str {
        match self.medium {
            media::Type::Audio => "anull",
            _ => "null",
        }
    }

    pub(crate) fn source_args(&self, upstream: &FrameInfo) -> String {
        match upstream {
            FrameInfo::Video(v) => {
                let sar = if v.sample_aspect_ratio.numerator() > 0 {
                    v.sample_aspect_ratio
                } else {
                    Rational::new(1, 1)
                };
                let mut args = format!(
                    "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
                    v.width,
                    v.height,
                    ffmpeg::ffi::AVPixelFormat::from(v.format) as i32,
                    v.time_base.numerator(),
                    v.time_base.denominator().max(1),
                    sar.numerator(),
                    sar.denominator().max(1),
                );
                if v.frame_rate.numerator() > 0 {
                    args.push_str(&format!(
                        ":frame_rate={}/{}",
                        v.frame_rate.numerator(),
                        v.frame_rate.denominator().max(1)
                    ));
                }
                args
            }
            FrameInfo::Audio(a) => format!(
                "time_base={}/{}:sample_rate={}:sample_fmt={}:channels={}",
                a.time_base.numerator(),
                a.time_base.denominator().max(1),
                a.rate,
                ffmpeg::ffi::AVSampleFormat::from(a.format) as i32,
                a.channels.max(1),
            ),
        }
    }

    /// Sink-side frame description: declared overrides layered over the
    /// upstream parameters. This is what the encoder configures from.
    pub(crate) fn output_info(&self, upstream: &FrameInfo) -> FrameInfo {
        match upstream {
            FrameInfo::Video(v) => {
                let frame_rate = match self.out_fps {
                    Some(fps) => Rational::new(fps as i32, 1),
                    None if v.frame_rate.numerator() > 0 => v.frame_rate,
                    None => Rational::new(defaults::VIDEO_FPS as i32, 1),
                };
                FrameInfo::Video(VideoInfo {
                    width: self.out_width.unwrap_or(v.width),
                    height: self.out_height.unwrap_or(v.height),
                    format: self.out_format.unwrap_or(v.format),
                    sample_aspect_ratio: v.sample_aspect_ratio,
                    color_space: v.color_space,
                    color_range: v.color_range,
                    frame_rate,
                    time_base: Rational::new(frame_rate.denominator(), frame_rate.numerator()),
                })
            }
            FrameInfo::Audio(a) => {
                let rate = self.out_rate.unwrap_or(a.rate);
                FrameInfo::Audio(AudioInfo {
                    rate,
                    format: a.format,
                    channels: a.channels,
                    time_base: Rational::new(1, rate as i32),
                })
            }
        }
    }
}

/// Target name of one notch-bank instance, shared with the runtime updater.
pub(crate) fn notch_instance(id: &str, harmonic: usize) -> String {
    format!("{id}_h{harmonic}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_chain_assembles_in_order() {
        let spec = FilterSpec::video()
            .scale(640, 480)
            .pixel_format(Pixel::YUV420P)
            .fps(30);
        assert_eq!(spec.content(), "scale=640:480,format=pix_fmts=yuv420p,fps=30");
        assert_eq!(spec.endpoints(), ("buffer", "buffersink"));
    }

    #[test]
    fn audio_defaults_match_the_stock_chain() {
        let spec = FilterSpec::audio_defaults();
        assert_eq!(
            spec.content(),
            "aformat=sample_fmts=s16:channel_layouts=stereo,aresample=48000,asetnsamples=960"
        );
        assert_eq!(spec.endpoints(), ("abuffer", "abuffersink"));
    }

    #[test]
    fn empty_spec_falls_back_to_passthrough() {
        assert_eq!(FilterSpec::video().content(), "");
        assert_eq!(FilterSpec::video().passthrough(), "null");
        assert_eq!(FilterSpec::audio().passthrough(), "anull");
    }

    #[test]
    fn notch_bank_emits_one_addressable_filter_per_harmonic() {
        let spec = FilterSpec::audio().notch_bank("prop0", 120.0, 3, 30.0);
        let content = spec.content();
        assert_eq!(
            content,
            "bandreject@prop0_h0=frequency=120.00:width_type=q:width=30,\
             bandreject@prop0_h1=frequency=240.00:width_type=q:width=30,\
             bandreject@prop0_h2=frequency=360.00:width_type=q:width=30"
        );
    }

    #[test]
    fn declared_output_overrides_upstream_video_info() {
        let upstream = FrameInfo::Video(VideoInfo {
            width: 1280,
            height: 720,
            format: Pixel::UYVY422,
            sample_aspect_ratio: Rational::new(1, 1),
            color_space: ffmpeg::util::color::Space::Unspecified,
            color_range: ffmpeg::util::color::Range::Unspecified,
            frame_rate: Rational::new(30, 1),
            time_base: Rational::new(1, 90_000),
        });
        let spec = FilterSpec::video()
            .scale(640, 480)
            .pixel_format(Pixel::YUV420P)
            .fps(25);

        let FrameInfo::Video(out) = spec.output_info(&upstream) else {
            panic!("video in, video out");
        };
        assert_eq!((out.width, out.height), (640, 480));
        assert_eq!(out.format, Pixel::YUV420P);
        assert_eq!(out.frame_rate, Rational::new(25, 1));
        assert_eq!(out.time_base, Rational::new(1, 25));
    }

    #[test]
    fn audio_resample_sets_rate_and_time_base() {
        let upstream = FrameInfo::Audio(AudioInfo {
            rate: 44_100,
            format: ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
            channels: 2,
            time_base: Rational::new(1, 44_100),
        });
        let FrameInfo::Audio(out) = FilterSpec::audio().resample(48_000).output_info(&upstream)
        else {
            panic!("audio in, audio out");
        };
        assert_eq!(out.rate, 48_000);
        assert_eq!(out.time_base, Rational::new(1, 48_000));
    }
}
