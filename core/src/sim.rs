//! Simulation utilities and CSV data handling for the quadrotor estimator.
//!
//! This module provides:
//! - A struct ([FlightDataRecord]) for reading and writing pre-aligned flight data to/from CSV
//! - A seeded Gaussian sampler for the accelerometer-bias disturbance channels
//! - A closed-loop runner that drives the filter over a record sequence
//! - [EstimateHistory] for storing and exporting the resulting estimate trajectory
//!
//! Records are pre-aligned: each row carries the IMU sample and the pose columns for exactly
//! one filter step, and the time differential is derived from consecutive row timestamps.
//! Aligning independent sensor streams into this shape is the data collection side's job and
//! is deliberately not done here.

use chrono::DateTime;
use nalgebra::Vector3;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::kalman::{FilterConfig, PoseMeasurement, QuadrotorUkf, StepReport};
use crate::messages::{PoseDegradationConfig, build_step_events};
use crate::{DisturbanceSample, ImuInput, QuadrotorState, rpy_to_rot_mat};

/// Timestamp layout used by record files, e.g. `2024-06-01 12:00:00.000 +0000`.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";
/// Time differential assumed when a record timestamp cannot be parsed.
pub const DEFAULT_TIME_STEP: f64 = 0.01;

/// Struct representing a single pre-aligned row of flight data.
///
/// One row corresponds to one filter step: the IMU sample that drives the prediction and the
/// pose columns for that instant. A step without a pose fix keeps the legacy convention of
/// all six pose columns written as zero (see [PoseMeasurement::from_sentinel]).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FlightDataRecord {
    /// Date-time string in [TIME_FORMAT]
    pub time: String,
    /// Sensed x-acceleration in m/s^2, body frame
    pub acc_x: f64,
    /// Sensed y-acceleration in m/s^2, body frame
    pub acc_y: f64,
    /// Sensed z-acceleration in m/s^2, body frame
    pub acc_z: f64,
    /// Rotation rate around the x-axis in rad/s
    pub gyro_x: f64,
    /// Rotation rate around the y-axis in rad/s
    pub gyro_y: f64,
    /// Rotation rate around the z-axis in rad/s
    pub gyro_z: f64,
    /// Measured x-position in meters, world frame
    pub pose_x: f64,
    /// Measured y-position in meters, world frame
    pub pose_y: f64,
    /// Measured z-position in meters, world frame
    pub pose_z: f64,
    /// Measured roll in radians
    pub pose_roll: f64,
    /// Measured pitch in radians
    pub pose_pitch: f64,
    /// Measured yaw in radians
    pub pose_yaw: f64,
}

impl FlightDataRecord {
    /// Reads a CSV file and returns a vector of records.
    ///
    /// # Arguments
    /// * `path` - Path to the CSV file to read.
    ///
    /// # Returns
    /// * `Ok(Vec<FlightDataRecord>)` on success, `Err` if the file cannot be read or parsed.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            records.push(row?);
        }
        Ok(records)
    }
    /// Writes a slice of records to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<(), Box<dyn std::error::Error>> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Control input carried by this record.
    pub fn imu(&self) -> ImuInput {
        ImuInput::new(
            Vector3::new(self.acc_x, self.acc_y, self.acc_z),
            Vector3::new(self.gyro_x, self.gyro_y, self.gyro_z),
        )
    }
    /// Pose fix carried by this record, with the legacy all-zero rows decoding as absent.
    pub fn pose(&self) -> Option<PoseMeasurement> {
        PoseMeasurement::from_sentinel(&[
            self.pose_x,
            self.pose_y,
            self.pose_z,
            self.pose_roll,
            self.pose_pitch,
            self.pose_yaw,
        ])
    }
}

/// Time difference in seconds between two record timestamps.
///
/// Falls back to [DEFAULT_TIME_STEP] when either timestamp fails to parse, so a malformed
/// row degrades a single step instead of ending the run.
pub fn time_difference(previous: &str, next: &str) -> f64 {
    match (
        DateTime::parse_from_str(previous, TIME_FORMAT),
        DateTime::parse_from_str(next, TIME_FORMAT),
    ) {
        (Ok(previous), Ok(next)) => {
            next.signed_duration_since(previous).num_milliseconds() as f64 / 1000.0
        }
        _ => DEFAULT_TIME_STEP,
    }
}

/// Seeded sampler for the accelerometer-bias disturbance channels.
///
/// Each step draws one value per axis from an independent zero-mean Gaussian with the
/// configured standard deviation. The seed makes simulated runs reproducible.
pub struct DisturbanceSampler {
    rng: rand::rngs::StdRng,
    axes: [Normal<f64>; 3],
}

impl DisturbanceSampler {
    /// Create a sampler from per-axis standard deviations and a seed.
    pub fn new(stddev: [f64; 3], seed: u64) -> DisturbanceSampler {
        let axes = stddev.map(|sigma| {
            Normal::new(0.0, sigma)
                .expect("bias disturbance standard deviation must be finite and non-negative")
        });
        DisturbanceSampler {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
            axes,
        }
    }
    /// Draw the disturbance sample for one step.
    pub fn sample(&mut self) -> DisturbanceSample {
        DisturbanceSample {
            accel_bias_drift: Vector3::new(
                self.axes[0].sample(&mut self.rng),
                self.axes[1].sample(&mut self.rng),
                self.axes[2].sample(&mut self.rng),
            ),
        }
    }
}

/// Ordered, append-only estimate trajectory produced by a run.
///
/// Holds one mean per record (the initial estimate plus one posterior per step), the
/// matching timestamps, and the per-step degradation reports.
#[derive(Debug)]
pub struct EstimateHistory {
    /// Posterior means in step order, beginning with the initial estimate
    pub means: Vec<nalgebra::DVector<f64>>,
    /// Timestamp of each mean
    pub timestamps: Vec<String>,
    /// Per-step reports (one fewer than `means`)
    pub reports: Vec<StepReport>,
    /// Name or identifier for this run
    pub name: String,
}

impl EstimateHistory {
    /// Creates an empty history.
    pub fn new(name: &str) -> Self {
        EstimateHistory {
            means: Vec::new(),
            timestamps: Vec::new(),
            reports: Vec::new(),
            name: name.to_string(),
        }
    }

    /// Writes the estimate trajectory to a CSV file.
    ///
    /// # Arguments
    /// * `path` - Path where the CSV file will be saved
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        writeln!(
            file,
            "time,pos_x_m,pos_y_m,pos_z_m,vel_x_mps,vel_y_mps,vel_z_mps,roll_rad,pitch_rad,yaw_rad,accel_bias_x,accel_bias_y,accel_bias_z,aux_1,aux_2"
        )?;
        for (mean, timestamp) in self.means.iter().zip(self.timestamps.iter()) {
            let state = QuadrotorState::from_vector(mean);
            writeln!(
                file,
                "{},{:.8},{:.8},{:.8},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
                timestamp,
                state.position[0],
                state.position[1],
                state.position[2],
                state.velocity[0],
                state.velocity[1],
                state.velocity[2],
                state.orientation[0],
                state.orientation[1],
                state.orientation[2],
                state.accel_bias[0],
                state.accel_bias[1],
                state.accel_bias[2],
                state.aux_bias[0],
                state.aux_bias[1],
            )?;
        }
        Ok(())
    }

    /// Creates an EstimateHistory from a CSV file previously written by [EstimateHistory::to_csv].
    ///
    /// Degradation reports are not serialized, so the loaded history carries none.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        name: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
        let mut result = EstimateHistory::new(name);
        for row in reader.records() {
            let row = row?;
            if row.len() < 15 {
                return Err("CSV record doesn't have enough fields".into());
            }
            let mut values = Vec::with_capacity(crate::STATE_DIM);
            for field in row.iter().skip(1) {
                values.push(field.parse::<f64>()?);
            }
            result.timestamps.push(row[0].to_string());
            result.means.push(nalgebra::DVector::from_vec(values));
        }
        Ok(result)
    }

    /// Number of steps that skipped or degraded, by report inspection.
    pub fn degraded_steps(&self) -> usize {
        self.reports
            .iter()
            .filter(|report| {
                report.factorization_fallback
                    || report.correction == crate::kalman::CorrectionStatus::SkippedSingular
            })
            .count()
    }
}

/// Generate pre-aligned records for a stationary hover.
///
/// The IMU reads the body-frame acceleration that exactly cancels the configured gravity
/// offset at the configured initial orientation, angular rates are zero, and every row
/// carries a pose fix equal to the initial position and orientation. Note the legacy pose
/// convention: with an all-zero initial pose the rows would decode as measurement-free.
pub fn hover_records(config: &FilterConfig, steps: usize, dt: f64) -> Vec<FlightDataRecord> {
    let initial = QuadrotorState::from_vector(&nalgebra::DVector::from_row_slice(
        &config.initial_mean,
    ));
    let rotation = rpy_to_rot_mat(
        initial.orientation[0],
        initial.orientation[1],
        initial.orientation[2],
    );
    let gravity_offset = Vector3::new(
        config.gravity_offset[0],
        config.gravity_offset[1],
        config.gravity_offset[2],
    );
    // Body-frame reading whose world-frame image cancels the gravity offset
    let accel = rotation.transpose() * gravity_offset;
    let base = DateTime::parse_from_str("2024-06-01 12:00:00.000 +0000", TIME_FORMAT)
        .expect("hover base timestamp is well-formed");
    (0..steps)
        .map(|i| {
            let time = base + chrono::Duration::milliseconds((i as f64 * dt * 1000.0).round() as i64);
            FlightDataRecord {
                time: time.format(TIME_FORMAT).to_string(),
                acc_x: accel[0],
                acc_y: accel[1],
                acc_z: accel[2],
                gyro_x: 0.0,
                gyro_y: 0.0,
                gyro_z: 0.0,
                pose_x: initial.position[0],
                pose_y: initial.position[1],
                pose_z: initial.position[2],
                pose_roll: initial.orientation[0],
                pose_pitch: initial.orientation[1],
                pose_yaw: initial.orientation[2],
            }
        })
        .collect()
}

/// Run the filter closed-loop over a record sequence.
///
/// The first record anchors the clock; each subsequent record becomes one filter step with
/// dt from consecutive timestamps, a freshly drawn disturbance sample, and whatever pose fix
/// the degradation scenario delivers. Returns the estimate trajectory with one mean per
/// record and the per-step reports.
///
/// # Arguments
/// * `records` - pre-aligned flight data
/// * `filter_config` - estimator constants
/// * `degradation` - pose scheduling and fault scenario
/// * `disturbance_seed` - seed for the bias disturbance sampler
pub fn run_closed_loop(
    records: &[FlightDataRecord],
    filter_config: &FilterConfig,
    degradation: &PoseDegradationConfig,
    disturbance_seed: u64,
) -> EstimateHistory {
    let mut result = EstimateHistory::new("Closed Loop");
    if records.is_empty() {
        return result;
    }
    let events = build_step_events(records, degradation);
    let mut filter = QuadrotorUkf::new(filter_config);
    let mut sampler = DisturbanceSampler::new(filter_config.accel_bias_stddev, disturbance_seed);

    result.timestamps.push(records[0].time.clone());
    for (event, record) in events.iter().zip(records.iter().skip(1)) {
        let disturbance = sampler.sample();
        let report = filter.step(&event.imu, &disturbance, event.pose.as_ref(), event.dt);
        result.reports.push(report);
        result.timestamps.push(record.time.clone());
    }
    result.means = filter.history().to_vec();
    result
}
