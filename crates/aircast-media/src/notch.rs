// crates/aircast-media/src/notch.rs
//
// Propeller-noise notch retuning. Each propeller gets a bank of bandreject
// filters at harmonics of its blade-pass frequency; as ESC telemetry reports
// RPM the tracked frequencies move and a flush worker pushes them into the
// running filter graph by id. The telemetry transport (MAVLink, serial ESC
// feeds) is the caller's concern; this updater only consumes RPM readings.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use aircast_core::CancelToken;

use crate::error::Result;
use crate::filter::Filter;
use crate::filter_spec::notch_instance;

/// One propeller's notch bank, matched to a `FilterSpec::notch_bank` entry
/// with the same id, harmonic count and blade count.
#[derive(Clone, Debug)]
pub struct NotchSpec {
    pub id: String,
    pub fundamental: f32,
    pub harmonics: u8,
    pub blades: u8,
}

#[derive(Clone, Debug)]
pub struct PropNoisePlan {
    pub interval: Duration,
    pub notches: Vec<NotchSpec>,
}

struct NotchState {
    id: String,
    blades: u8,
    frequencies: Vec<f32>,
}

impl NotchState {
    fn new(spec: &NotchSpec) -> Self {
        Self {
            id: spec.id.clone(),
            blades: spec.blades,
            frequencies: (0..spec.harmonics as usize)
                .map(|k| spec.fundamental * (k + 1) as f32)
                .collect(),
        }
    }

    /// Track the blade-pass fundamental with exponential smoothing so a
    /// noisy RPM reading does not yank the notches around.
    fn update(&mut self, rpm: f32) {
        let fundamental = rpm * self.blades as f32 / 60.0;
        for (k, frequency) in self.frequencies.iter_mut().enumerate() {
            *frequency = (*frequency + fundamental * (k + 1) as f32) / 2.0;
        }
    }
}

pub struct PropNoiseUpdater {
    filter: Arc<Filter>,
    notches: Arc<RwLock<Vec<NotchState>>>,
    interval: Duration,
    cancel: CancelToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PropNoiseUpdater {
    pub fn new(filter: Arc<Filter>, plan: PropNoisePlan, cancel: &CancelToken) -> Self {
        Self {
            filter,
            notches: Arc::new(RwLock::new(
                plan.notches.iter().map(NotchState::new).collect(),
            )),
            interval: plan.interval,
            cancel: cancel.clone(),
            worker: Mutex::new(None),
        }
    }

    /// Feed one RPM reading for the motor at `index` (telemetry order must
    /// match the plan's notch order). Unknown indices are ignored.
    pub fn report_rpm(&self, index: usize, rpm: f32) {
        if let Some(notch) = self.notches.write().get_mut(index) {
            notch.update(rpm);
        }
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let filter = Arc::clone(&self.filter);
        let notches = Arc::clone(&self.notches);
        let interval = self.interval;
        let cancel = self.cancel.clone();
        *worker = Some(
            thread::Builder::new()
                .name("notch-update".into())
                .spawn(move || {
                    let mut last_flush = Instant::now();
                    while !cancel.is_cancelled() {
                        thread::sleep(Duration::from_millis(50));
                        if last_flush.elapsed() < interval {
                            continue;
                        }
                        last_flush = Instant::now();
                        if let Err(err) = flush(&filter, &notches) {
                            debug!(%err, "notch retune failed");
                        }
                    }
                })
                .expect("spawn notch worker"),
        );
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("notch worker panicked");
            }
        }
    }
}

fn flush(filter: &Filter, notches: &RwLock<Vec<NotchState>>) -> Result<()> {
    // Snapshot under the read lock; graph commands happen outside it.
    let targets: Vec<(String, f32)> = {
        let notches = notches.read();
        notches
            .iter()
            .flat_map(|notch| {
                notch
                    .frequencies
                    .iter()
                    .enumerate()
                    .map(|(k, frequency)| (notch_instance(&notch.id, k), *frequency))
            })
            .collect()
    };

    for (target, frequency) in targets {
        filter.send_command(&target, "frequency", &format!("{frequency:.2}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> NotchSpec {
        NotchSpec {
            id: "prop0".into(),
            fundamental: 120.0,
            harmonics: 3,
            blades: 2,
        }
    }

    #[test]
    fn initial_frequencies_are_harmonics_of_the_fundamental() {
        let state = NotchState::new(&spec());
        assert_eq!(state.frequencies, vec![120.0, 240.0, 360.0]);
    }

    #[test]
    fn rpm_update_tracks_blade_pass_frequency() {
        let mut state = NotchState::new(&spec());
        // 6000 rpm, 2 blades: 200 Hz blade-pass fundamental.
        state.update(6000.0);
        assert_eq!(state.frequencies, vec![160.0, 320.0, 480.0]);

        // Converges toward the harmonics under a steady reading.
        for _ in 0..20 {
            state.update(6000.0);
        }
        assert!((state.frequencies[0] - 200.0).abs() < 0.01);
        assert!((state.frequencies[1] - 400.0).abs() < 0.01);
        assert!((state.frequencies[2] - 600.0).abs() < 0.01);
    }

    #[test]
    fn command_targets_match_the_filter_fragment_ids() {
        assert_eq!(notch_instance("prop0", 0), "prop0_h0");
        assert_eq!(notch_instance("prop3", 2), "prop3_h2");
    }
}
