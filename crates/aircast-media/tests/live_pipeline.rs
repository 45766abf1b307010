// End-to-end pipeline checks against real media. These need either capture
// hardware (the camera tests, macOS) or a local file supplied through
// AIRCAST_TEST_INPUT, so they are ignored by default:
//
//     AIRCAST_TEST_INPUT=clip.mp4 cargo test -p aircast-media -- --ignored

use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use aircast_media::media_sys::codec;
use aircast_media::{
    AdaptiveConfig, DemuxerConfig, FilterSpec, MultiConfig, PopError, Transcoder, X264Opts,
    X264Settings,
};

fn file_input() -> Option<DemuxerConfig> {
    std::env::var("AIRCAST_TEST_INPUT")
        .ok()
        .map(|path| DemuxerConfig::new(path).realtime_file())
}

fn camera_input() -> DemuxerConfig {
    DemuxerConfig::new("0").avfoundation()
}

fn small_filter() -> FilterSpec {
    FilterSpec::video()
        .scale(640, 480)
        .pixel_format(aircast_media::media_sys::format::Pixel::YUV420P)
        .fps(30)
}

fn drain_packets(transcoder: &Transcoder, budget: Duration, want: usize) -> Result<usize> {
    let deadline = Instant::now() + budget;
    let mut received = 0;
    while Instant::now() < deadline && received < want {
        match transcoder.wait_for_packet(Duration::from_millis(200)) {
            Ok(packet) => {
                received += 1;
                transcoder.release_packet(packet);
            }
            Err(PopError::TimedOut) => continue,
            Err(err) => bail!("packet wait failed: {err}"),
        }
    }
    Ok(received)
}

#[test]
#[ignore = "needs an AVFoundation camera"]
fn camera_to_h264_produces_packets_and_parameter_sets() -> Result<()> {
    let transcoder = Transcoder::builder(camera_input())
        .filter(small_filter())
        .encode(codec::Id::H264, X264Settings::low_latency())
        .build()?;

    transcoder.start();
    let received = drain_packets(&transcoder, Duration::from_secs(5), 10)?;
    transcoder.stop();

    assert!(received >= 1, "no packets within 5s");

    let (sps, pps) = transcoder.parameter_sets();
    assert!(sps.starts_with(&[0, 0, 0, 1]) && sps[4] & 0x1F == 7);
    assert!(pps.starts_with(&[0, 0, 0, 1]) && pps[4] & 0x1F == 8);
    Ok(())
}

#[test]
#[ignore = "needs AIRCAST_TEST_INPUT"]
fn adaptive_updates_clamp_to_the_configured_bounds() -> Result<()> {
    let Some(input) = file_input() else {
        bail!("set AIRCAST_TEST_INPUT to a local media file");
    };

    let transcoder = Transcoder::builder(input)
        .filter(small_filter())
        .encode_adaptive(
            codec::Id::H264,
            X264Opts::low_latency_cbr(),
            AdaptiveConfig::new(500_000, 1_500_000),
        )
        .build()?;
    transcoder.start();

    transcoder.update_bitrate(300_000)?;
    assert_eq!(transcoder.applied_bitrate()?, 500_000);

    transcoder.update_bitrate(3_000_000)?;
    assert_eq!(transcoder.applied_bitrate()?, 1_500_000);

    drain_packets(&transcoder, Duration::from_secs(3), 5)?;
    transcoder.stop();
    Ok(())
}

#[test]
#[ignore = "needs AIRCAST_TEST_INPUT"]
fn pause_on_floor_stops_and_resumes_packet_flow() -> Result<()> {
    let Some(input) = file_input() else {
        bail!("set AIRCAST_TEST_INPUT to a local media file");
    };

    let transcoder = Transcoder::builder(input)
        .filter(small_filter())
        .encode_adaptive(
            codec::Id::H264,
            X264Opts::low_latency_cbr(),
            AdaptiveConfig::new(500_000, 1_500_000).cut_below_min(),
        )
        .build()?;
    transcoder.start();
    drain_packets(&transcoder, Duration::from_secs(3), 1)?;

    // At the floor: the consumer must block.
    transcoder.update_bitrate(300_000)?;
    let blocked = drain_packets(&transcoder, Duration::from_secs(1), 1)?;
    assert_eq!(blocked, 0, "paused stream still delivered packets");

    // Above the floor: packets flow again within a second.
    transcoder.update_bitrate(800_000)?;
    let resumed = drain_packets(&transcoder, Duration::from_secs(1), 1)?;
    assert!(resumed >= 1, "stream did not resume after unpause");

    transcoder.stop();
    Ok(())
}

#[test]
#[ignore = "needs AIRCAST_TEST_INPUT"]
fn multi_encoder_switches_instantly_between_warm_rungs() -> Result<()> {
    let Some(input) = file_input() else {
        bail!("set AIRCAST_TEST_INPUT to a local media file");
    };

    let transcoder = Transcoder::builder(input)
        .filter(small_filter())
        .encode_multi(
            codec::Id::H264,
            X264Opts::low_latency_cbr(),
            MultiConfig::new(500_000, 2_000_000, 4),
        )
        .build()?;
    transcoder.start();

    let switch_started = Instant::now();
    transcoder.update_bitrate(1_200_000)?;
    // Highest rung at or below the target.
    assert_eq!(transcoder.applied_bitrate()?, 1_000_000);

    transcoder.update_bitrate(2_500_000)?;
    // Clamped to the ceiling, then the top rung.
    assert_eq!(transcoder.applied_bitrate()?, 2_000_000);

    // Selection is an index swap, not a rebuild.
    assert!(switch_started.elapsed() < Duration::from_millis(100));

    drain_packets(&transcoder, Duration::from_secs(3), 5)?;
    transcoder.stop();
    Ok(())
}

#[test]
#[ignore = "needs AIRCAST_TEST_INPUT"]
fn cancelling_the_scope_shuts_every_worker_down() -> Result<()> {
    let Some(input) = file_input() else {
        bail!("set AIRCAST_TEST_INPUT to a local media file");
    };

    let transcoder = Transcoder::builder(input)
        .filter(small_filter())
        .encode(codec::Id::H264, X264Settings::low_latency())
        .build()?;
    transcoder.start();
    drain_packets(&transcoder, Duration::from_secs(2), 1)?;

    let stop_started = Instant::now();
    transcoder.stop();
    assert!(stop_started.elapsed() < Duration::from_secs(2), "shutdown overran");

    // After shutdown the output side reports closure, not data.
    assert!(matches!(
        transcoder.wait_for_packet(Duration::from_millis(100)),
        Err(PopError::Closed) | Err(PopError::Cancelled)
    ));
    Ok(())
}
