//! Sigma-point Kalman filter for the quadrotor flight state.
//!
//! This module contains the recursive estimator: a cubature-style sigma-point filter that
//! factors the summed covariance, pushes an equal-weight ensemble of 2n points through the
//! nonlinear dynamics in the top-level crate module, aggregates the prior moments, and
//! applies a measurement correction whenever an external pose fix is available. The two
//! numerically fragile operations (covariance factorization, innovation-covariance inversion)
//! degrade gracefully instead of aborting; every step completes and reports what happened
//! through [StepReport].
//!
//! The ensemble here differs from the canonical unscented transform: there is no central
//! point and no per-point weight vector. All 28 points carry the same weight and both moment
//! estimators divide by 28 uniformly.

use crate::linalg::{
    cholesky_factor, ensemble_covariance, ensemble_mean, fallback_factor, invert_square,
};
use crate::{
    DisturbanceSample, ENSEMBLE_SIZE, ImuInput, MEASUREMENT_DIM, ORIENTATION_INDEX,
    POSITION_INDEX, QuadrotorState, STATE_DIM, forward,
};

use std::fmt::{self, Debug, Display};

use log::warn;
use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

/// Externally configured constants of the estimator.
///
/// Defaults reproduce the values the source deployment flew with: a uniform process-noise
/// diagonal, a measurement-noise diagonal that trusts the pose solver's orientation far more
/// than its position, the world-frame gravity/calibration offset, the substitute factor
/// diagonal for failed factorizations, and the initial estimate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Diagonal value of the 14 x 14 process noise matrix Q
    pub process_noise_diagonal: f64,
    /// Diagonal value of the position block of the measurement noise matrix R
    pub measurement_noise_position: f64,
    /// Diagonal value of the orientation block of the measurement noise matrix R
    pub measurement_noise_orientation: f64,
    /// World-frame gravity/calibration offset subtracted from the rotated specific force
    pub gravity_offset: [f64; 3],
    /// Diagonal of the substitute Cholesky factor used when P + Q is not positive-definite
    pub factorization_fallback_diagonal: f64,
    /// Initial state estimate (14 values)
    pub initial_mean: [f64; STATE_DIM],
    /// Diagonal value of the initial covariance matrix P
    pub initial_covariance_diagonal: f64,
    /// Standard deviations of the per-axis accelerometer bias disturbance (simulation side)
    pub accel_bias_stddev: [f64; 3],
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            process_noise_diagonal: 0.005,
            measurement_noise_position: 0.2,
            measurement_noise_orientation: 0.0001,
            gravity_offset: [0.4109, 0.4024, 9.6343],
            // Cholesky diagonal of the initial P + Q
            factorization_fallback_diagonal: 0.1225,
            initial_mean: [
                -0.197612876747667,
                0.079773798179542,
                0.873867606945072,
                -0.361840566716804,
                0.364435964213824,
                0.107057884736583,
                0.003720102419965,
                -0.0003130927657911031,
                1.539666077119250,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
            initial_covariance_diagonal: 0.01,
            accel_bias_stddev: [0.0094, 0.0129, 0.0120],
        }
    }
}

/// An external pose fix: world-frame position plus roll/pitch/yaw orientation.
///
/// Availability is expressed through `Option<PoseMeasurement>` at the filter interface.
/// Recorded legacy logs instead encode an absent fix as six zeros; use [from_sentinel] when
/// interpreting such logs. The sentinel cannot distinguish a genuine all-zero reading from an
/// absent one, which is why it survives only at the log boundary.
///
/// [from_sentinel]: PoseMeasurement::from_sentinel
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoseMeasurement {
    /// Measured world-frame position in meters
    pub position: Vector3<f64>,
    /// Measured roll, pitch, yaw in radians
    pub orientation: Vector3<f64>,
}

impl Display for PoseMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoseMeasurement {{ pos: [{:.4}, {:.4}, {:.4}] m, rpy: [{:.4}, {:.4}, {:.4}] rad }}",
            self.position[0],
            self.position[1],
            self.position[2],
            self.orientation[0],
            self.orientation[1],
            self.orientation[2],
        )
    }
}

impl PoseMeasurement {
    /// Create a pose fix from position and orientation vectors.
    pub fn new(position: Vector3<f64>, orientation: Vector3<f64>) -> PoseMeasurement {
        PoseMeasurement {
            position,
            orientation,
        }
    }
    /// Flatten to the six-element measurement vector [position, orientation].
    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.position[0],
            self.position[1],
            self.position[2],
            self.orientation[0],
            self.orientation[1],
            self.orientation[2],
        ])
    }
    /// Interpret the legacy absent-measurement convention.
    ///
    /// Recorded logs mark a step without a pose fix by writing six zeros; the historical
    /// test is that the components sum to exactly zero. Returns `None` for such a row and
    /// `Some` otherwise.
    ///
    /// # Example
    /// ```rust
    /// use quadstate::kalman::PoseMeasurement;
    /// assert!(PoseMeasurement::from_sentinel(&[0.0; 6]).is_none());
    /// assert!(PoseMeasurement::from_sentinel(&[0.1, 0.0, 0.0, 0.0, 0.0, 0.0]).is_some());
    /// ```
    pub fn from_sentinel(components: &[f64; 6]) -> Option<PoseMeasurement> {
        if components.iter().sum::<f64>() == 0.0 {
            return None;
        }
        Some(PoseMeasurement {
            position: Vector3::new(components[0], components[1], components[2]),
            orientation: Vector3::new(components[3], components[4], components[5]),
        })
    }
}

/// What the correction branch of a step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorrectionStatus {
    /// A pose fix was available and the gain-weighted correction was applied.
    Applied,
    /// No pose fix was supplied; the prior was emitted as the posterior.
    NoMeasurement,
    /// The innovation covariance was singular; the correction was skipped and the prior
    /// emitted as the posterior.
    SkippedSingular,
}

/// Per-step account of the degradations that occurred, if any.
///
/// A step never fails; this report is how the two soft failure paths are surfaced to the
/// caller in addition to the log diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepReport {
    /// True when the covariance factorization failed and the fixed-diagonal substitute
    /// factor was used for this step's ensemble
    pub factorization_fallback: bool,
    /// Outcome of the measurement branch
    pub correction: CorrectionStatus,
}

/// Sigma-point filter over the fourteen-dimensional quadrotor state.
///
/// Holds the running estimate (mean and covariance), the fixed noise matrices, and the
/// append-only history of posterior means. The struct is the single writer of the running
/// estimate; if embedded in a concurrent host it must be externally synchronized, as the
/// recurrence is strictly sequential.
#[derive(Clone)]
pub struct QuadrotorUkf {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    process_noise: DMatrix<f64>,
    measurement_noise: DMatrix<f64>,
    gravity_offset: Vector3<f64>,
    fallback_diagonal: f64,
    estimates: Vec<DVector<f64>>,
}

impl Debug for QuadrotorUkf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UKF")
            .field("mean", &self.mean)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise)
            .field("measurement_noise", &self.measurement_noise)
            .finish()
    }
}

impl Display for QuadrotorUkf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuadrotorUkf {{ state: {:?}, steps: {} }}",
            QuadrotorState::from_vector(&self.mean),
            self.estimates.len().saturating_sub(1)
        )
    }
}

impl QuadrotorUkf {
    /// Create a filter from its configuration.
    ///
    /// The estimate history starts with the configured initial mean, matching the recorded
    /// output of the source deployment, so after `k` steps the history holds `k + 1` means.
    pub fn new(config: &FilterConfig) -> QuadrotorUkf {
        let mean = DVector::from_row_slice(&config.initial_mean);
        let covariance = DMatrix::from_diagonal_element(
            STATE_DIM,
            STATE_DIM,
            config.initial_covariance_diagonal,
        );
        let process_noise =
            DMatrix::from_diagonal_element(STATE_DIM, STATE_DIM, config.process_noise_diagonal);
        let mut measurement_noise = DMatrix::<f64>::zeros(MEASUREMENT_DIM, MEASUREMENT_DIM);
        for i in 0..3 {
            measurement_noise[(i, i)] = config.measurement_noise_position;
            measurement_noise[(i + 3, i + 3)] = config.measurement_noise_orientation;
        }
        QuadrotorUkf {
            estimates: vec![mean.clone()],
            mean,
            covariance,
            process_noise,
            measurement_noise,
            gravity_offset: Vector3::new(
                config.gravity_offset[0],
                config.gravity_offset[1],
                config.gravity_offset[2],
            ),
            fallback_diagonal: config.factorization_fallback_diagonal,
        }
    }

    /// Current state estimate.
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    /// Current state estimate as a named-block record.
    pub fn state(&self) -> QuadrotorState {
        QuadrotorState::from_vector(&self.mean)
    }
    /// Current state covariance.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    /// Append-only history of posterior means, starting with the initial estimate.
    pub fn history(&self) -> &[DVector<f64>] {
        &self.estimates
    }

    /// Build the equal-weight sigma ensemble around the current estimate.
    ///
    /// Factors P + Q; columns 0..14 are the mean plus sqrt(14) times each factor column,
    /// columns 14..28 the mean minus the same spread. When the factorization fails the
    /// configured fixed-diagonal factor is substituted for this call only and the returned
    /// flag is set.
    pub fn generate_ensemble(&self) -> (DMatrix<f64>, bool) {
        let summed = &self.covariance + &self.process_noise;
        let (factor, fallback) = match cholesky_factor(&summed) {
            Some(lower) => (lower, false),
            None => {
                warn!(
                    "covariance plus process noise is not symmetric positive-definite; \
                     substituting fixed diagonal factor {} for this step",
                    self.fallback_diagonal
                );
                (fallback_factor(STATE_DIM, self.fallback_diagonal), true)
            }
        };
        let scale = (STATE_DIM as f64).sqrt();
        let mut points = DMatrix::<f64>::zeros(STATE_DIM, ENSEMBLE_SIZE);
        for i in 0..STATE_DIM {
            let spread = scale * factor.column(i);
            points.column_mut(i).copy_from(&(&self.mean + &spread));
            points
                .column_mut(i + STATE_DIM)
                .copy_from(&(&self.mean - &spread));
        }
        (points, fallback)
    }

    /// Advance the filter by one time step.
    ///
    /// Generates the sigma ensemble, propagates every point through the quadrotor dynamics,
    /// aggregates the prior mean and covariance, and applies the measurement correction when
    /// a pose fix is supplied. Both branches overwrite the running estimate and append the
    /// posterior mean to the history.
    ///
    /// Failures degrade rather than abort: a non-positive-definite covariance engages the
    /// substitute factor for this step only, and a singular innovation covariance skips the
    /// correction so the prior becomes the posterior. Either event is noted in the returned
    /// [StepReport] and logged.
    ///
    /// # Arguments
    /// * `imu` - control input for this step
    /// * `disturbance` - externally drawn bias disturbance for this step
    /// * `pose` - external pose fix, or `None` when no measurement is available
    /// * `dt` - time step in seconds, must be positive
    pub fn step(
        &mut self,
        imu: &ImuInput,
        disturbance: &DisturbanceSample,
        pose: Option<&PoseMeasurement>,
        dt: f64,
    ) -> StepReport {
        let (mut deviations, factorization_fallback) = self.generate_ensemble();

        // Propagate every sigma point through the nonlinear dynamics
        let mut propagated = DMatrix::<f64>::zeros(STATE_DIM, ENSEMBLE_SIZE);
        for i in 0..ENSEMBLE_SIZE {
            let mut point = QuadrotorState::from_vector(&deviations.column(i).clone_owned());
            forward(&mut point, *imu, *disturbance, self.gravity_offset, dt);
            propagated.set_column(i, &point.to_vector());
        }

        let prior_mean = ensemble_mean(&propagated);
        // Recycle the ensemble storage to hold the mean-centered propagated points
        for i in 0..ENSEMBLE_SIZE {
            let centered = propagated.column(i) - &prior_mean;
            deviations.set_column(i, &centered);
        }
        let prior_covariance = ensemble_covariance(&deviations, &deviations);

        let pose = match pose {
            Some(pose) => pose,
            None => {
                self.mean = prior_mean;
                self.covariance = prior_covariance;
                self.estimates.push(self.mean.clone());
                return StepReport {
                    factorization_fallback,
                    correction: CorrectionStatus::NoMeasurement,
                };
            }
        };

        // Predicted observation ensemble: position and orientation rows of each point
        let mut observed = DMatrix::<f64>::zeros(MEASUREMENT_DIM, ENSEMBLE_SIZE);
        for i in 0..ENSEMBLE_SIZE {
            for axis in 0..3 {
                observed[(axis, i)] = propagated[(POSITION_INDEX + axis, i)];
                observed[(axis + 3, i)] = propagated[(ORIENTATION_INDEX + axis, i)];
            }
        }
        let predicted_observation = ensemble_mean(&observed);
        let innovation = pose.to_vector() - &predicted_observation;
        for i in 0..ENSEMBLE_SIZE {
            let centered = observed.column(i) - &predicted_observation;
            observed.set_column(i, &centered);
        }

        let innovation_covariance =
            ensemble_covariance(&observed, &observed) + &self.measurement_noise;
        let cross_covariance = ensemble_covariance(&deviations, &observed);

        let innovation_inverse = match invert_square(&innovation_covariance) {
            Some(inverse) => inverse,
            None => {
                warn!("innovation covariance is singular; skipping correction for this step");
                self.mean = prior_mean;
                self.covariance = prior_covariance;
                self.estimates.push(self.mean.clone());
                return StepReport {
                    factorization_fallback,
                    correction: CorrectionStatus::SkippedSingular,
                };
            }
        };

        let gain = &cross_covariance * &innovation_inverse;
        self.mean = prior_mean + &gain * innovation;
        self.covariance =
            prior_covariance - &gain * &innovation_covariance * gain.transpose();
        self.estimates.push(self.mean.clone());
        StepReport {
            factorization_fallback,
            correction: CorrectionStatus::Applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const DT: f64 = 0.1;

    fn quiet_config() -> FilterConfig {
        // Identity-adjacent starting point keeps the hand checks readable
        FilterConfig {
            initial_mean: [0.0; STATE_DIM],
            ..FilterConfig::default()
        }
    }

    fn hover_input(config: &FilterConfig) -> ImuInput {
        ImuInput::new(
            Vector3::new(
                config.gravity_offset[0],
                config.gravity_offset[1],
                config.gravity_offset[2],
            ),
            Vector3::zeros(),
        )
    }

    #[test]
    fn construction_reproduces_configuration() {
        let config = FilterConfig::default();
        let ukf = QuadrotorUkf::new(&config);
        assert_eq!(ukf.mean().len(), STATE_DIM);
        assert_approx_eq!(ukf.mean()[0], config.initial_mean[0], 1e-15);
        assert_approx_eq!(ukf.mean()[8], config.initial_mean[8], 1e-15);
        for i in 0..STATE_DIM {
            assert_approx_eq!(
                ukf.covariance()[(i, i)],
                config.initial_covariance_diagonal,
                1e-15
            );
        }
        // Position block of R is looser than the orientation block
        assert!(ukf.measurement_noise[(0, 0)] > ukf.measurement_noise[(3, 3)]);
        // History begins with the initial estimate
        assert_eq!(ukf.history().len(), 1);
        assert_eq!(ukf.history()[0], *ukf.mean());
    }

    #[test]
    fn ensemble_mean_recovers_the_state_mean() {
        // The plus/minus construction cancels, so the column average is the mean exactly
        let config = FilterConfig::default();
        let ukf = QuadrotorUkf::new(&config);
        let (points, fallback) = ukf.generate_ensemble();
        assert!(!fallback);
        assert_eq!(points.ncols(), ENSEMBLE_SIZE);
        let mean = crate::linalg::ensemble_mean(&points);
        for i in 0..STATE_DIM {
            assert_approx_eq!(mean[i], ukf.mean()[i], 1e-12);
        }
    }

    #[test]
    fn ensemble_survives_indefinite_covariance() {
        // Force a negative eigenvalue into P; the fallback factor must engage, not panic
        let config = quiet_config();
        let mut ukf = QuadrotorUkf::new(&config);
        ukf.covariance[(0, 0)] = -1.0;
        let (points, fallback) = ukf.generate_ensemble();
        assert!(fallback);
        assert_eq!(points.ncols(), ENSEMBLE_SIZE);
        // Spread comes from the substitute factor
        let expected = (STATE_DIM as f64).sqrt() * config.factorization_fallback_diagonal;
        assert_approx_eq!(points[(0, 0)] - ukf.mean()[0], expected, 1e-12);
    }

    #[test]
    fn fallback_does_not_persist_into_next_step() {
        let config = quiet_config();
        let mut ukf = QuadrotorUkf::new(&config);
        ukf.covariance[(0, 0)] = -1.0;
        let imu = hover_input(&config);
        let first = ukf.step(&imu, &DisturbanceSample::zeros(), None, DT);
        assert!(first.factorization_fallback);
        // The posterior covariance is rebuilt from the ensemble, so the next factorization
        // succeeds on its own
        let second = ukf.step(&imu, &DisturbanceSample::zeros(), None, DT);
        assert!(!second.factorization_fallback);
    }

    #[test]
    fn missing_measurement_emits_prior_unchanged() {
        let config = quiet_config();
        let mut ukf = QuadrotorUkf::new(&config);
        let imu = hover_input(&config);

        let mut shadow = ukf.clone();
        let report = ukf.step(&imu, &DisturbanceSample::zeros(), None, DT);
        assert_eq!(report.correction, CorrectionStatus::NoMeasurement);
        assert!(!report.factorization_fallback);

        // The legacy all-zero sentinel row decodes to the same branch
        let sentinel = PoseMeasurement::from_sentinel(&[0.0; 6]);
        let shadow_report =
            shadow.step(&imu, &DisturbanceSample::zeros(), sentinel.as_ref(), DT);
        assert_eq!(shadow_report.correction, CorrectionStatus::NoMeasurement);
        for i in 0..STATE_DIM {
            assert_eq!(ukf.mean()[i], shadow.mean()[i]);
        }
        assert_eq!(ukf.history().len(), 2);
    }

    #[test]
    fn agreeing_measurement_leaves_mean_and_shrinks_covariance() {
        let config = quiet_config();
        let mut ukf = QuadrotorUkf::new(&config);
        let imu = hover_input(&config);

        // Discover the prior by running a shadow copy without a measurement
        let mut shadow = ukf.clone();
        shadow.step(&imu, &DisturbanceSample::zeros(), None, DT);
        let prior_mean = shadow.mean().clone();
        let prior_covariance = shadow.covariance().clone();

        let pose = PoseMeasurement::new(
            Vector3::new(prior_mean[0], prior_mean[1], prior_mean[2]),
            Vector3::new(prior_mean[6], prior_mean[7], prior_mean[8]),
        );
        let report = ukf.step(&imu, &DisturbanceSample::zeros(), Some(&pose), DT);
        assert_eq!(report.correction, CorrectionStatus::Applied);

        // Innovation is zero, so the posterior mean matches the prior
        for i in 0..STATE_DIM {
            assert_approx_eq!(ukf.mean()[i], prior_mean[i], 1e-9);
        }
        // The correction tightened the observed blocks
        for i in [0, 1, 2, 6, 7, 8] {
            assert!(
                ukf.covariance()[(i, i)] < prior_covariance[(i, i)],
                "diagonal {} should shrink: {} vs {}",
                i,
                ukf.covariance()[(i, i)],
                prior_covariance[(i, i)]
            );
        }
    }

    #[test]
    fn history_is_append_only_across_branches() {
        let config = quiet_config();
        let mut ukf = QuadrotorUkf::new(&config);
        let imu = hover_input(&config);
        let pose = PoseMeasurement::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.1));

        ukf.step(&imu, &DisturbanceSample::zeros(), None, DT);
        let after_first = ukf.history()[1].clone();
        ukf.step(&imu, &DisturbanceSample::zeros(), Some(&pose), DT);
        ukf.step(&imu, &DisturbanceSample::zeros(), None, DT);

        assert_eq!(ukf.history().len(), 4);
        // Earlier entries are never rewritten
        assert_eq!(ukf.history()[1], after_first);
        assert_eq!(ukf.history()[3], *ukf.mean());
    }

    #[test]
    fn sentinel_rejects_only_the_zero_sum_row() {
        assert!(PoseMeasurement::from_sentinel(&[0.0; 6]).is_none());
        // A row that cancels to zero is also treated as absent; this ambiguity is the
        // reason the sentinel survives only at the log boundary
        assert!(PoseMeasurement::from_sentinel(&[1.0, -1.0, 0.0, 0.0, 0.0, 0.0]).is_none());
        let pose = PoseMeasurement::from_sentinel(&[0.5, 0.25, 1.0, 0.01, -0.02, 0.03]).unwrap();
        assert_eq!(pose.position, Vector3::new(0.5, 0.25, 1.0));
        assert_eq!(pose.orientation, Vector3::new(0.01, -0.02, 0.03));
    }
}
