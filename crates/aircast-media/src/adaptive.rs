// crates/aircast-media/src/adaptive.rs
//
// Adaptive bitrate by encoder rebuild. A bandwidth estimator calls
// update_bitrate; after clamping and hysteresis the settings table is
// retargeted and a whole new encoder is built, started and swapped in. The
// consumer never notices: a forwarder worker drains whichever encoder is
// active into one stable output queue.

use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::{Frame, Packet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use aircast_core::{BoundedQueue, CancelToken, PauseGate, Pool, PopError};

use crate::encode::{Encoder, EncoderBuilder};
use crate::error::{Error, Result};
use crate::pools;

const FORWARD_DEADLINE: Duration = Duration::from_millis(50);

/// Rebuilds cheaper than this are thrash, not adaptation.
const REBUILD_THRESHOLD_PERCENT: f64 = 5.0;

#[derive(Clone, Copy, Debug)]
pub struct AdaptiveConfig {
    pub min_bitrate: i64,
    pub max_bitrate: i64,
    /// Requests at or below the floor pause output instead of serving it.
    pub cut_below_min: bool,
}

impl AdaptiveConfig {
    pub fn new(min_bitrate: i64, max_bitrate: i64) -> Self {
        Self {
            min_bitrate,
            max_bitrate,
            cut_below_min: false,
        }
    }

    pub fn cut_below_min(mut self) -> Self {
        self.cut_below_min = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_bitrate <= 0 || self.min_bitrate > self.max_bitrate {
            return Err(Error::InvalidBitrateBounds {
                min: self.min_bitrate,
                max: self.max_bitrate,
            });
        }
        Ok(())
    }

    pub(crate) fn clamp(&self, bps: i64) -> i64 {
        bps.clamp(self.min_bitrate, self.max_bitrate)
    }

    pub(crate) fn should_pause(&self, bps: i64) -> bool {
        bps <= self.min_bitrate && self.cut_below_min
    }
}

pub(crate) fn bitrate_change_percent(current: i64, requested: i64) -> f64 {
    if current == 0 {
        return f64::INFINITY;
    }
    ((requested - current).abs() as f64 / current.abs() as f64) * 100.0
}

pub(crate) fn needs_rebuild(current: i64, requested: i64) -> bool {
    bitrate_change_percent(current, requested) >= REBUILD_THRESHOLD_PERCENT
}

pub struct AdaptiveEncoder {
    builder: EncoderBuilder,
    upstream: Arc<BoundedQueue<Frame>>,
    active: Arc<RwLock<Arc<Encoder>>>,
    output: Arc<BoundedQueue<Packet>>,
    // Shared by every encoder generation and the output queue, so shells
    // keep circulating across swaps.
    packet_pool: Arc<Pool<Packet>>,
    gate: PauseGate,
    config: AdaptiveConfig,
    cancel: CancelToken,
    // Serializes update_bitrate callers; never held across wait_for_packet.
    swap: Mutex<()>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveEncoder {
    pub fn new(
        config: AdaptiveConfig,
        builder: EncoderBuilder,
        upstream: Arc<BoundedQueue<Frame>>,
        cancel: &CancelToken,
    ) -> Result<Self> {
        config.validate()?;
        let packet_pool = pools::packet_pool();
        let first =
            builder.build_with_pool(Arc::clone(&upstream), cancel, Arc::clone(&packet_pool))?;
        let capacity = builder.queue_capacity();

        Ok(Self {
            builder,
            upstream,
            active: Arc::new(RwLock::new(Arc::new(first))),
            output: BoundedQueue::with_capacity(capacity, Arc::clone(&packet_pool)),
            packet_pool,
            gate: PauseGate::new(),
            config,
            cancel: cancel.clone(),
            swap: Mutex::new(()),
            forwarder: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        self.active.read().start();

        let mut forwarder = self.forwarder.lock();
        if forwarder.is_some() {
            return;
        }
        let active = Arc::clone(&self.active);
        let output = Arc::clone(&self.output);
        let cancel = self.cancel.clone();
        *forwarder = Some(
            thread::Builder::new()
                .name("encode-forward".into())
                .spawn(move || {
                    loop {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let encoder = Arc::clone(&*active.read());
                        match encoder.packets().pop(FORWARD_DEADLINE, &cancel) {
                            Ok(packet) => {
                                if output.push(packet).is_err() {
                                    break;
                                }
                            }
                            Err(PopError::TimedOut) => continue,
                            // A retired encoder closed its queue; loop to
                            // pick up the freshly swapped-in one.
                            Err(PopError::Closed) => continue,
                            Err(PopError::Cancelled) => break,
                        }
                    }
                    output.close();
                })
                .expect("spawn forwarder worker"),
        );
    }

    /// Retarget the encoder. Clamped to the configured bounds; changes under
    /// 5 % are ignored; at or below the floor with `cut_below_min` set the
    /// stream pauses instead. On a rebuild failure the old encoder keeps
    /// serving and the error reaches the caller.
    pub fn update_bitrate(&self, bps: i64) -> Result<()> {
        let _swap = self.swap.lock();

        if self.config.should_pause(bps) {
            debug!(bps, "bitrate at floor, pausing output");
            self.gate.pause();
        } else {
            self.gate.resume();
        }

        let bps = self.config.clamp(bps);
        let current = self.builder.target_bitrate()?;
        if !needs_rebuild(current, bps) {
            debug!(current, requested = bps, "within hysteresis, keeping encoder");
            return Ok(());
        }

        self.builder.update_bitrate(bps)?;
        let fresh = self.builder.build_with_pool(
            Arc::clone(&self.upstream),
            &self.cancel,
            Arc::clone(&self.packet_pool),
        )?;
        fresh.start();

        let old = {
            let mut active = self.active.write();
            mem::replace(&mut *active, Arc::new(fresh))
        };
        // Retire off-thread so in-flight forwarder pops finish undisturbed.
        thread::spawn(move || old.stop());

        info!(from = current, to = bps, "encoder rebuilt");
        Ok(())
    }

    /// Pop the next packet from the stable output queue. Blocks while the
    /// stream is paused; the pause flag is observed before the queue.
    pub fn wait_for_packet(&self, deadline: Duration) -> std::result::Result<Packet, PopError> {
        if !self.gate.wait_while_paused(&self.cancel) {
            return Err(PopError::Cancelled);
        }
        self.output.pop(deadline, &self.cancel)
    }

    pub fn release_packet(&self, packet: Packet) {
        self.output.release(packet);
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
        self.active.read().parameter_sets()
    }

    /// The bitrate actually applied after clamping, from the settings table.
    pub fn applied_bitrate(&self) -> Result<i64> {
        self.builder.target_bitrate()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.gate.resume();
        if let Some(handle) = self.forwarder.lock().take() {
            if handle.join().is_err() {
                warn!("forwarder worker panicked");
            }
        }
        self.active.read().stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_applies_both_bounds() {
        let config = AdaptiveConfig::new(500_000, 1_500_000);
        assert_eq!(config.clamp(300_000), 500_000);
        assert_eq!(config.clamp(3_000_000), 1_500_000);
        assert_eq!(config.clamp(800_000), 800_000);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        assert!(AdaptiveConfig::new(2_000_000, 1_000_000).validate().is_err());
        assert!(AdaptiveConfig::new(0, 1_000_000).validate().is_err());
        assert!(AdaptiveConfig::new(500_000, 1_500_000).validate().is_ok());
    }

    #[test]
    fn pause_intent_requires_floor_and_flag() {
        let plain = AdaptiveConfig::new(500_000, 1_500_000);
        assert!(!plain.should_pause(300_000));

        let cutting = plain.cut_below_min();
        assert!(cutting.should_pause(300_000));
        assert!(cutting.should_pause(500_000));
        assert!(!cutting.should_pause(500_001));
    }

    #[test]
    fn hysteresis_swallows_small_changes() {
        assert!(!needs_rebuild(1_000_000, 1_000_000));
        assert!(!needs_rebuild(1_000_000, 1_049_000));
        assert!(!needs_rebuild(1_000_000, 960_000));
        assert!(needs_rebuild(1_000_000, 1_050_000));
        assert!(needs_rebuild(1_000_000, 900_000));
        // A zero current target always rebuilds.
        assert!(needs_rebuild(0, 500_000));
    }
}
