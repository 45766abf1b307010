// crates/aircast-media/src/multi.rs
//
// Adaptive bitrate by warm standby: N differently-targeted encoders run
// continuously, one source frame is fanned to all of them by refcount bump,
// and selection is an atomic index swap. Packets from non-active encoders
// are shed by their own bounded queues; that waste is the price of an O(1)
// switch with no rebuild stall.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::{Frame, Packet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use aircast_core::{BoundedQueue, CancelToken, PauseGate, PopError};

use crate::adaptive::AdaptiveConfig;
use crate::encode::{Encoder, EncoderBuilder};
use crate::error::{Error, Result};
use crate::ffi_ext::ref_frame;
use crate::pools;

const FANOUT_DEADLINE: Duration = Duration::from_millis(50);

/// Private per-encoder frame queue depth. Roughly three seconds at 30 fps;
/// deep enough that a slow encoder sheds its own lane, not the source.
const LANE_CAPACITY: usize = 90;

#[derive(Clone, Copy, Debug)]
pub struct MultiConfig {
    pub steps: u8,
    pub bounds: AdaptiveConfig,
}

impl MultiConfig {
    pub fn new(min_bitrate: i64, max_bitrate: i64, steps: u8) -> Self {
        Self {
            steps,
            bounds: AdaptiveConfig::new(min_bitrate, max_bitrate),
        }
    }

    pub fn cut_below_min(mut self) -> Self {
        self.bounds = self.bounds.cut_below_min();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(Error::NoLadderSteps);
        }
        self.bounds.validate()
    }

    /// Evenly spaced bitrate ladder from min to max inclusive.
    pub(crate) fn ladder(&self) -> Vec<i64> {
        if self.steps == 1 {
            return vec![self.bounds.max_bitrate];
        }
        let step = (self.bounds.max_bitrate - self.bounds.min_bitrate) as f64
            / (self.steps - 1) as f64;
        (0..self.steps)
            .map(|i| self.bounds.min_bitrate + (i as f64 * step) as i64)
            .collect()
    }
}

/// Highest rung whose bitrate does not exceed the target; 0 when none does.
pub(crate) fn best_index(ladder: &[i64], target: i64) -> usize {
    let mut best = 0;
    for (i, bitrate) in ladder.iter().enumerate() {
        if *bitrate <= target {
            best = i;
        } else {
            break;
        }
    }
    best
}

struct Lane {
    frames: Arc<BoundedQueue<Frame>>,
    encoder: Arc<Encoder>,
    bitrate: i64,
}

pub struct MultiEncoder {
    lanes: Vec<Lane>,
    active: AtomicUsize,
    upstream: Arc<BoundedQueue<Frame>>,
    gate: PauseGate,
    config: MultiConfig,
    cancel: CancelToken,
    fan: Mutex<Option<JoinHandle<()>>>,
}

impl MultiEncoder {
    pub fn new(
        config: MultiConfig,
        builder: EncoderBuilder,
        upstream: Arc<BoundedQueue<Frame>>,
        cancel: &CancelToken,
    ) -> Result<Self> {
        config.validate()?;

        // Remember the pre-ladder target so the initial selection matches
        // what the caller configured rather than the last rung built.
        let initial = builder.target_bitrate().unwrap_or(config.bounds.min_bitrate);

        let mut lanes = Vec::with_capacity(config.steps as usize);
        for bitrate in config.ladder() {
            let frames = BoundedQueue::with_capacity(LANE_CAPACITY, pools::frame_pool());
            builder.update_bitrate(bitrate)?;
            let encoder = builder.build(Arc::clone(&frames), cancel)?;
            lanes.push(Lane {
                frames,
                encoder: Arc::new(encoder),
                bitrate,
            });
        }

        let ladder: Vec<i64> = lanes.iter().map(|lane| lane.bitrate).collect();
        let active = best_index(&ladder, config.bounds.clamp(initial));
        debug!(?ladder, active, "encoder ladder ready");

        Ok(Self {
            lanes,
            active: AtomicUsize::new(active),
            upstream,
            gate: PauseGate::new(),
            config,
            cancel: cancel.clone(),
            fan: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        for lane in &self.lanes {
            lane.encoder.start();
        }

        let mut fan = self.fan.lock();
        if fan.is_some() {
            return;
        }
        let upstream = Arc::clone(&self.upstream);
        let lanes: Vec<Arc<BoundedQueue<Frame>>> = self
            .lanes
            .iter()
            .map(|lane| Arc::clone(&lane.frames))
            .collect();
        let cancel = self.cancel.clone();
        *fan = Some(
            thread::Builder::new()
                .name("encode-fanout".into())
                .spawn(move || {
                    loop {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let source = match upstream.pop(FANOUT_DEADLINE, &cancel) {
                            Ok(frame) => frame,
                            Err(PopError::TimedOut) => continue,
                            Err(PopError::Cancelled) | Err(PopError::Closed) => break,
                        };
                        for lane in &lanes {
                            let mut shared = lane.acquire();
                            match ref_frame(&mut shared, &source) {
                                Ok(()) => {
                                    let _ = lane.push(shared);
                                }
                                Err(err) => {
                                    lane.release(shared);
                                    debug!(%err, "frame ref failed, lane skipped");
                                }
                            }
                        }
                        upstream.release(source);
                    }
                    for lane in &lanes {
                        lane.close();
                    }
                })
                .expect("spawn fanout worker"),
        );
    }

    /// Select the encoder for `bps`: pause-check, clamp, then an atomic
    /// pointer-sized swap. Completes in O(1) regardless of frame rate.
    pub fn update_bitrate(&self, bps: i64) -> Result<()> {
        if self.config.bounds.should_pause(bps) {
            debug!(bps, "bitrate at floor, pausing output");
            self.gate.pause();
        } else {
            self.gate.resume();
        }

        let bps = self.config.bounds.clamp(bps);
        let ladder: Vec<i64> = self.lanes.iter().map(|lane| lane.bitrate).collect();
        let index = best_index(&ladder, bps);
        let previous = self.active.swap(index, Ordering::SeqCst);
        if previous != index {
            debug!(from = previous, to = index, bitrate = ladder[index], "encoder switched");
        }
        Ok(())
    }

    fn active_lane(&self) -> &Lane {
        &self.lanes[self.active.load(Ordering::SeqCst)]
    }

    /// Pop the next packet from the active encoder. Blocks while paused.
    pub fn wait_for_packet(&self, deadline: Duration) -> std::result::Result<Packet, PopError> {
        if !self.gate.wait_while_paused(&self.cancel) {
            return Err(PopError::Cancelled);
        }
        self.active_lane().encoder.packets().pop(deadline, &self.cancel)
    }

    pub fn release_packet(&self, packet: Packet) {
        self.active_lane().encoder.packets().release(packet);
    }

    pub fn pause_encoding(&self) {
        self.gate.pause();
    }

    pub fn unpause_encoding(&self) {
        self.gate.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn parameter_sets(&self) -> (Vec<u8>, Vec<u8>) {
        self.active_lane().encoder.parameter_sets()
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn active_bitrate(&self) -> i64 {
        self.active_lane().bitrate
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.gate.resume();
        if let Some(handle) = self.fan.lock().take() {
            if handle.join().is_err() {
                warn!("fanout worker panicked");
            }
        }
        for lane in &self.lanes {
            lane.encoder.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_spaces_steps_evenly() {
        let config = MultiConfig::new(500_000, 2_000_000, 4);
        assert_eq!(
            config.ladder(),
            vec![500_000, 1_000_000, 1_500_000, 2_000_000]
        );
    }

    #[test]
    fn single_step_ladder_is_just_the_ceiling() {
        assert_eq!(MultiConfig::new(500_000, 2_000_000, 1).ladder(), vec![2_000_000]);
    }

    #[test]
    fn zero_steps_is_a_setup_error() {
        assert!(matches!(
            MultiConfig::new(500_000, 2_000_000, 0).validate(),
            Err(Error::NoLadderSteps)
        ));
    }

    #[test]
    fn selection_takes_highest_rung_at_or_below_target() {
        let ladder = MultiConfig::new(500_000, 2_000_000, 4).ladder();
        assert_eq!(best_index(&ladder, 1_200_000), 1);
        assert_eq!(best_index(&ladder, 1_500_000), 2);
        assert_eq!(best_index(&ladder, 400_000), 0);
    }

    #[test]
    fn out_of_range_target_clamps_then_selects_top_rung() {
        let config = MultiConfig::new(500_000, 2_000_000, 4);
        let ladder = config.ladder();
        assert_eq!(best_index(&ladder, config.bounds.clamp(2_500_000)), 3);
    }
}
