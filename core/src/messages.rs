//! Pose availability and degradation for simulated runs.
//!
//! The external pose solver delivers fixes at a lower rate than the IMU and sometimes not at
//! all. This module makes that availability a first-class, reproducible scenario: a
//! [PoseScheduler] decides *when* a recorded fix is delivered to the filter, and a
//! [PoseFaultModel] decides *what* corruption, if any, is applied to the delivered fix.
//! Combined through [PoseDegradationConfig] and [build_step_events], a set of pre-aligned
//! flight records becomes the per-step event sequence the closed-loop runner consumes.
//!
//! Scheduling and corruption are separated so outage patterns and noise levels can be varied
//! independently. All randomness is seeded, so a given configuration replays identically.

use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use nalgebra::Vector3;

use crate::kalman::PoseMeasurement;
use crate::sim::{FlightDataRecord, time_difference};
use crate::ImuInput;

/// Scheduler controlling when pose fixes are emitted into the simulation.
///
/// - `PassThrough`: deliver every fix present in the records at its native rate.
/// - `FixedInterval`: down-sample the pose stream to a constant interval.
/// - `DutyCycle`: alternate between ON and OFF windows of fixed length, modeling periodic
///   loss of the pose solver (for example when the tracked target leaves the camera frame).
///
/// # Examples
///
/// ```
/// use quadstate::messages::PoseScheduler;
///
/// // Keep every recorded fix
/// let sched = PoseScheduler::PassThrough;
///
/// // Deliver at most one fix per half second
/// let sched = PoseScheduler::FixedInterval { interval_s: 0.5, phase_s: 0.0 };
///
/// // 2 s of fixes, then 3 s blind, repeating
/// let sched = PoseScheduler::DutyCycle { on_s: 2.0, off_s: 3.0, start_phase_s: 0.0 };
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoseScheduler {
    /// Pass every recorded pose fix through with no rate reduction.
    #[default]
    PassThrough,
    /// Emit pose fixes at a fixed interval, discarding those in between.
    FixedInterval {
        /// Desired interval between delivered fixes (seconds).
        interval_s: f64,
        /// Initial offset before the first delivered fix (seconds).
        phase_s: f64,
    },
    /// Alternate between ON and OFF windows to create duty-cycled outages.
    DutyCycle {
        /// Duration of each ON window (seconds).
        on_s: f64,
        /// Duration of each OFF window (seconds).
        off_s: f64,
        /// Initial offset applied to the window clock (seconds).
        start_phase_s: f64,
    },
}

impl PoseScheduler {
    /// Whether a fix available at elapsed time `t` should be delivered.
    ///
    /// `next_emit_s` is scheduler scratch state owned by the caller; for `FixedInterval` it
    /// holds the next emission time and is advanced on delivery.
    fn deliver(&self, t: f64, next_emit_s: &mut f64) -> bool {
        match self {
            PoseScheduler::PassThrough => true,
            PoseScheduler::FixedInterval { interval_s, phase_s } => {
                if *next_emit_s < *phase_s {
                    *next_emit_s = *phase_s;
                }
                if t + 1e-9 >= *next_emit_s {
                    *next_emit_s += interval_s;
                    true
                } else {
                    false
                }
            }
            PoseScheduler::DutyCycle {
                on_s,
                off_s,
                start_phase_s,
            } => {
                let period = on_s + off_s;
                let phase = (t + start_phase_s).rem_euclid(period);
                phase < *on_s
            }
        }
    }
}

/// Models how the content of a delivered pose fix is corrupted.
///
/// - `None`: deliver the fix unchanged.
/// - `Degraded`: add independent zero-mean Gaussian noise to the position and orientation
///   components, modeling a pose solver operating at the edge of its tracking envelope.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoseFaultModel {
    /// No corruption; fixes are passed through unchanged.
    #[default]
    None,
    /// Additive Gaussian noise on each delivered fix.
    Degraded {
        /// Per-axis position noise standard deviation (meters).
        sigma_pos_m: f64,
        /// Per-axis orientation noise standard deviation (radians).
        sigma_orient_rad: f64,
    },
}

/// Bundle of scheduler, fault model, and seed describing one degradation scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseDegradationConfig {
    pub scheduler: PoseScheduler,
    pub fault: PoseFaultModel,
    /// Seed for the fault-injection random number generator, so runs replay identically.
    pub seed: u64,
}

impl Default for PoseDegradationConfig {
    fn default() -> Self {
        PoseDegradationConfig {
            scheduler: PoseScheduler::PassThrough,
            fault: PoseFaultModel::None,
            seed: 0,
        }
    }
}

/// Mutable state of the fault injector across a run.
struct FaultState {
    rng: rand::rngs::StdRng,
}

impl FaultState {
    fn new(seed: u64) -> Self {
        FaultState {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    fn apply(&mut self, pose: PoseMeasurement, fault: &PoseFaultModel) -> PoseMeasurement {
        match fault {
            PoseFaultModel::None => pose,
            PoseFaultModel::Degraded {
                sigma_pos_m,
                sigma_orient_rad,
            } => {
                let position_noise = Normal::new(0.0, *sigma_pos_m)
                    .expect("position noise standard deviation must be finite and non-negative");
                let orientation_noise = Normal::new(0.0, *sigma_orient_rad).expect(
                    "orientation noise standard deviation must be finite and non-negative",
                );
                PoseMeasurement {
                    position: pose.position
                        + Vector3::new(
                            position_noise.sample(&mut self.rng),
                            position_noise.sample(&mut self.rng),
                            position_noise.sample(&mut self.rng),
                        ),
                    orientation: pose.orientation
                        + Vector3::new(
                            orientation_noise.sample(&mut self.rng),
                            orientation_noise.sample(&mut self.rng),
                            orientation_noise.sample(&mut self.rng),
                        ),
                }
            }
        }
    }
}

/// One filter step worth of inputs: control input, time differential, and the pose fix the
/// scheduler chose to deliver (if any).
#[derive(Clone, Debug)]
pub struct StepEvent {
    /// Elapsed time since the start of the run (seconds).
    pub elapsed_s: f64,
    /// Time differential to the previous record (seconds).
    pub dt: f64,
    /// Control input for this step.
    pub imu: ImuInput,
    /// Pose fix delivered for this step, after scheduling and fault injection.
    pub pose: Option<PoseMeasurement>,
}

/// Turn pre-aligned flight records into the per-step event sequence for the closed loop.
///
/// The first record anchors the clock and produces no event, matching the recurrence: step
/// `k` consumes record `k` with dt computed against record `k - 1`. Records whose pose
/// columns decode as absent stay absent; present fixes pass through the scheduler and, when
/// delivered, through the fault model.
pub fn build_step_events(
    records: &[FlightDataRecord],
    config: &PoseDegradationConfig,
) -> Vec<StepEvent> {
    let mut events = Vec::with_capacity(records.len().saturating_sub(1));
    if records.len() < 2 {
        return events;
    }
    let mut fault_state = FaultState::new(config.seed);
    let mut next_emit_s = 0.0;
    let mut elapsed_s = 0.0;
    for pair in records.windows(2) {
        let (previous, record) = (&pair[0], &pair[1]);
        let dt = time_difference(&previous.time, &record.time);
        elapsed_s += dt;
        let pose = record.pose().and_then(|pose| {
            if config.scheduler.deliver(elapsed_s, &mut next_emit_s) {
                Some(fault_state.apply(pose, &config.fault))
            } else {
                None
            }
        });
        events.push(StepEvent {
            elapsed_s,
            dt,
            imu: record.imu(),
            pose,
        });
    }
    events
}
