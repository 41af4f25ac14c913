//! Quadrotor flight-state estimation toolbox
//!
//! This crate provides the state types, kinematics, and sigma-point Kalman filtering used to
//! estimate the flight state of a quadrotor from high-rate inertial data and a lower-rate,
//! sometimes-absent external pose fix (for example a camera-based pose solver or a motion
//! capture system). The filter is implemented as a struct that is initialized once and then
//! stepped with new sensor data; each step is a strict function of the previous step's output,
//! so the recurrence must be driven sequentially.
//!
//! This crate is not an IMU driver and does not parse raw multi-stream sensor logs. Inputs are
//! assumed to be pre-aligned per step: one accelerometer/gyroscope sample, one disturbance
//! sample, and at most one pose fix per time step, with the time differential computed by the
//! caller. The [sim] module provides a small harness that drives the filter from such
//! pre-aligned records, but alignment itself belongs to the data collection side.
//!
//! The crate is primarily built off of [`nalgebra`](https://crates.io/crates/nalgebra) for the
//! linear algebra, with [`rand`](https://crates.io/crates/rand) and
//! [`rand_distr`](https://crates.io/crates/rand_distr) supplying the random draws used by the
//! bias disturbance model in simulation. Variables are named for the quantity they represent
//! rather than the symbol used in filtering literature; for example the predicted measurement
//! spread is named `innovation_covariance` instead of `S`.
//!
//! ## Crate overview
//!
//! - [kalman]: the sigma-point filter, its configuration, and its per-step degradation report.
//! - [linalg]: covariance factorization with a fixed-diagonal fallback, ensemble moment
//!   reduction, and innovation-covariance inversion.
//! - [messages]: pose availability scheduling and fault injection for simulated runs.
//! - [sim]: pre-aligned flight records, disturbance sampling, and the closed-loop runner.
//!
//! ## State definition
//!
//! The fourteen-state vector is defined as:
//!
//! $$
//! x = [p_x, p_y, p_z, v_x, v_y, v_z, \phi, \theta, \psi, b_x, b_y, b_z, c_1, c_2]
//! $$
//!
//! Where:
//! - $p$ and $v$ are world-frame position (m) and velocity (m/s),
//! - $\phi$, $\theta$, $\psi$ are roll, pitch, and yaw in radians under a fixed Z-X-Y
//!   composition order,
//! - $b$ is the accelerometer bias (m/s^2), modeled as a random walk,
//! - $c_1$, $c_2$ are auxiliary bias terms carried through the dynamics unchanged.
//!
//! The Z-X-Y rotation construction in [rpy_to_rot_mat] is used both to propagate the
//! orientation and to reconstruct the angles from the composed matrix, so the two directions
//! round-trip by construction. Angle recovery divides by $\cos\phi$ and is therefore
//! undefined at $\cos\phi = 0$ (gimbal lock); this boundary is documented and deliberately
//! left unguarded.

pub mod kalman;
pub mod linalg;
pub mod messages;
pub mod sim;

use nalgebra::{DVector, Matrix3, Vector2, Vector3};
use std::fmt::{self, Debug, Display};

/// Number of estimated states.
pub const STATE_DIM: usize = 14;
/// Number of components in an external pose fix (position plus orientation).
pub const MEASUREMENT_DIM: usize = 6;
/// Number of sigma points in the equal-weight ensemble (two per state, no central point).
pub const ENSEMBLE_SIZE: usize = 2 * STATE_DIM;

/// First index of the world-frame position block.
pub const POSITION_INDEX: usize = 0;
/// First index of the world-frame velocity block.
pub const VELOCITY_INDEX: usize = 3;
/// First index of the roll/pitch/yaw block.
pub const ORIENTATION_INDEX: usize = 6;
/// First index of the accelerometer bias block.
pub const ACCEL_BIAS_INDEX: usize = 9;
/// First index of the two auxiliary bias terms.
pub const AUX_BIAS_INDEX: usize = 12;

/// Basic structure for holding one control-input sample from the IMU.
///
/// The vectors are in the body frame of the vehicle. The accelerometer reading is the sensed
/// specific force in m/s^2 (bias not yet removed; the filter compensates with its own bias
/// estimate) and the gyroscope reading is the angular rate in rad/s.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImuInput {
    /// Sensed acceleration in m/s^2, body frame x, y, z axis
    pub accel: Vector3<f64>,
    /// Angular rate in rad/s, body frame x, y, z axis
    pub gyro: Vector3<f64>,
}
impl Display for ImuInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImuInput {{ accel: [{:.4}, {:.4}, {:.4}], gyro: [{:.4}, {:.4}, {:.4}] }}",
            self.accel[0], self.accel[1], self.accel[2], self.gyro[0], self.gyro[1], self.gyro[2]
        )
    }
}
impl From<Vec<f64>> for ImuInput {
    /// Builds an input from a six-element vector (3 for accel, 3 for gyro).
    fn from(vec: Vec<f64>) -> Self {
        if vec.len() != 6 {
            panic!(
                "ImuInput must be initialized with a vector of length 6 (3 for accel, 3 for gyro)"
            );
        }
        ImuInput {
            accel: Vector3::new(vec[0], vec[1], vec[2]),
            gyro: Vector3::new(vec[3], vec[4], vec[5]),
        }
    }
}
impl ImuInput {
    /// Create a new input from acceleration and angular-rate vectors.
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> ImuInput {
        ImuInput { accel, gyro }
    }
}

/// One sample of the process disturbance driving the accelerometer-bias random walk.
///
/// The legacy nine-element disturbance vector carried zeros everywhere except entries six
/// through eight; only those three channels feed the dynamics, so this type stores them
/// directly. Samples are drawn externally each step (see [sim::DisturbanceSampler]) from
/// independent zero-mean Gaussian distributions.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisturbanceSample {
    /// Drift rate applied to the accelerometer bias states, in m/s^2 per second
    pub accel_bias_drift: Vector3<f64>,
}
impl From<Vec<f64>> for DisturbanceSample {
    /// Builds a sample from the legacy nine-element layout, keeping entries 6 through 8.
    fn from(vec: Vec<f64>) -> Self {
        if vec.len() != 9 {
            panic!("DisturbanceSample must be initialized with a vector of length 9");
        }
        DisturbanceSample {
            accel_bias_drift: Vector3::new(vec[6], vec[7], vec[8]),
        }
    }
}
impl DisturbanceSample {
    /// A zero disturbance (the bias estimate holds still).
    pub fn zeros() -> DisturbanceSample {
        DisturbanceSample::default()
    }
}

/// Basic structure for holding the quadrotor state in named blocks.
///
/// The filter itself works on flat fourteen-element vectors; this struct is the named view
/// used by the dynamics and by callers reading estimates. [QuadrotorState::to_vector] and
/// [QuadrotorState::from_vector] preserve the block layout given by [POSITION_INDEX],
/// [VELOCITY_INDEX], [ORIENTATION_INDEX], [ACCEL_BIAS_INDEX], and [AUX_BIAS_INDEX].
#[derive(Clone, Copy, PartialEq)]
pub struct QuadrotorState {
    /// World-frame position in meters
    pub position: Vector3<f64>,
    /// World-frame velocity in m/s
    pub velocity: Vector3<f64>,
    /// Roll, pitch, yaw in radians (Z-X-Y composition order)
    pub orientation: Vector3<f64>,
    /// Accelerometer bias estimate in m/s^2
    pub accel_bias: Vector3<f64>,
    /// Auxiliary bias terms, carried through the dynamics unchanged
    pub aux_bias: Vector2<f64>,
}

impl Debug for QuadrotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuadrotorState {{ pos: [{:.3}, {:.3}, {:.3}] m, vel: [{:.3}, {:.3}, {:.3}] m/s, rpy: [{:.2}, {:.2}, {:.2}] deg, accel bias: [{:.4}, {:.4}, {:.4}] m/s^2 }}",
            self.position[0],
            self.position[1],
            self.position[2],
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
            self.orientation[0].to_degrees(),
            self.orientation[1].to_degrees(),
            self.orientation[2].to_degrees(),
            self.accel_bias[0],
            self.accel_bias[1],
            self.accel_bias[2],
        )
    }
}

impl Default for QuadrotorState {
    fn default() -> Self {
        Self::new()
    }
}

impl QuadrotorState {
    /// Create a new state with all blocks zeroed.
    pub fn new() -> QuadrotorState {
        QuadrotorState {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            orientation: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            aux_bias: Vector2::zeros(),
        }
    }
    /// Build a state from a flat fourteen-element vector.
    ///
    /// # Arguments
    /// * `state` - vector in the order [position, velocity, orientation, accel bias, aux bias]
    pub fn from_vector(state: &DVector<f64>) -> QuadrotorState {
        QuadrotorState {
            position: Vector3::new(state[0], state[1], state[2]),
            velocity: Vector3::new(state[3], state[4], state[5]),
            orientation: Vector3::new(state[6], state[7], state[8]),
            accel_bias: Vector3::new(state[9], state[10], state[11]),
            aux_bias: Vector2::new(state[12], state[13]),
        }
    }
    /// Flatten the state into a fourteen-element vector.
    ///
    /// # Example
    /// ```rust
    /// use quadstate::QuadrotorState;
    /// let state = QuadrotorState::new();
    /// let vector = state.to_vector();
    /// assert_eq!(vector.len(), quadstate::STATE_DIM);
    /// ```
    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.position[0],
            self.position[1],
            self.position[2],
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
            self.orientation[0],
            self.orientation[1],
            self.orientation[2],
            self.accel_bias[0],
            self.accel_bias[1],
            self.accel_bias[2],
            self.aux_bias[0],
            self.aux_bias[1],
        ])
    }
}

/// Build the rotation matrix for the given roll, pitch, and yaw under the fixed Z-X-Y
/// composition order.
///
/// This exact entry-by-entry construction is used both to propagate the orientation and to
/// reconstruct the angles from the composed matrix in [rot_mat_to_rpy]; substituting a
/// different Euler convention breaks the round trip.
///
/// # Arguments
/// * `roll` - rotation about the body x axis in radians
/// * `pitch` - rotation about the body y axis in radians
/// * `yaw` - rotation about the body z axis in radians
pub fn rpy_to_rot_mat(roll: f64, pitch: f64, yaw: f64) -> Matrix3<f64> {
    let (sin_roll, cos_roll) = roll.sin_cos();
    let (sin_pitch, cos_pitch) = pitch.sin_cos();
    let (sin_yaw, cos_yaw) = yaw.sin_cos();
    Matrix3::new(
        cos_yaw * cos_pitch - sin_roll * sin_yaw * sin_pitch,
        cos_pitch * sin_yaw + cos_yaw * sin_roll * sin_pitch,
        -cos_roll * sin_pitch,
        -cos_roll * sin_yaw,
        cos_roll * cos_yaw,
        sin_roll,
        cos_yaw * sin_pitch + cos_pitch * sin_roll * sin_yaw,
        sin_yaw * sin_pitch - cos_yaw * cos_pitch * sin_roll,
        cos_roll * cos_pitch,
    )
}

/// Half-angle form of the two-argument arctangent:
/// $2 \arctan\left(y / (\sqrt{x^2 + y^2} + x)\right)$.
///
/// The angle-recovery expressions in [rot_mat_to_rpy] were derived against this exact form,
/// including its behavior as $x$ approaches the negative axis where the denominator
/// collapses, so it is not interchangeable with [f64::atan2].
pub fn half_angle_atan2(y: f64, x: f64) -> f64 {
    2.0 * (y / ((x * x + y * y).sqrt() + x)).atan()
}

/// Recover roll, pitch, and yaw from a Z-X-Y rotation matrix built by [rpy_to_rot_mat].
///
/// Roll comes straight from the sine entry; pitch and yaw divide the matching matrix entries
/// by $\cos\phi$ before the half-angle arctangent. The recovery is undefined when
/// $\cos\phi \approx 0$ (gimbal lock) and no guard is applied.
pub fn rot_mat_to_rpy(m: &Matrix3<f64>) -> (f64, f64, f64) {
    let roll = m[(1, 2)].asin();
    let cos_roll = roll.cos();
    let pitch = half_angle_atan2(-m[(0, 2)] / cos_roll, m[(2, 2)] / cos_roll);
    let yaw = half_angle_atan2(-m[(1, 0)] / cos_roll, m[(1, 1)] / cos_roll);
    (roll, pitch, yaw)
}

/// Nonlinear state transition for one time step.
///
/// Propagates a single state point through the quadrotor dynamics:
/// 1. rotate the bias-compensated specific force into the world frame and remove the
///    configured gravity/calibration offset,
/// 2. integrate position to second order and velocity to first order,
/// 3. compose the attitude with the incremental rotation built from angular rate times `dt`
///    and recover the new Euler angles,
/// 4. advance the accelerometer bias along its random walk,
/// 5. carry the auxiliary bias terms through unchanged.
///
/// All angles are radians and all arithmetic is double precision. The angle recovery in step 3
/// shares the gimbal-lock boundary of [rot_mat_to_rpy].
///
/// # Arguments
/// * `state` - the state point to propagate in place
/// * `imu` - control input (sensed acceleration and angular rate, body frame)
/// * `disturbance` - externally drawn random-walk drift for the bias channels
/// * `gravity_offset` - fixed world-frame gravity/calibration offset in m/s^2
/// * `dt` - time step in seconds, must be positive
///
/// # Example
/// ```rust
/// use quadstate::{forward, DisturbanceSample, ImuInput, QuadrotorState};
/// use nalgebra::Vector3;
/// let mut state = QuadrotorState::new();
/// let imu = ImuInput::new(Vector3::new(0.0, 0.0, 9.81), Vector3::zeros());
/// forward(
///     &mut state,
///     imu,
///     DisturbanceSample::zeros(),
///     Vector3::new(0.0, 0.0, 9.81),
///     0.01,
/// );
/// assert!(state.velocity.norm() < 1e-12);
/// ```
pub fn forward(
    state: &mut QuadrotorState,
    imu: ImuInput,
    disturbance: DisturbanceSample,
    gravity_offset: Vector3<f64>,
    dt: f64,
) {
    let rotation = rpy_to_rot_mat(
        state.orientation[0],
        state.orientation[1],
        state.orientation[2],
    );
    // Specific force with the current bias estimate removed, rotated into the world frame
    let specific_force = imu.accel - state.accel_bias;
    let world_accel = rotation * specific_force - gravity_offset;
    // Second-order position update, first-order velocity update
    state.position += state.velocity * dt + 0.5 * world_accel * dt * dt;
    state.velocity += world_accel * dt;
    // Attitude update: compose the prior rotation with the gyro increment
    let increment = rpy_to_rot_mat(imu.gyro[0] * dt, imu.gyro[1] * dt, imu.gyro[2] * dt);
    let composed = rotation * increment;
    let (roll, pitch, yaw) = rot_mat_to_rpy(&composed);
    state.orientation = Vector3::new(roll, pitch, yaw);
    // Accelerometer bias random walk
    state.accel_bias += disturbance.accel_bias_drift * dt;
    // aux_bias intentionally untouched
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_state_new() {
        let state = QuadrotorState::new();
        assert_eq!(state.position, Vector3::zeros());
        assert_eq!(state.velocity, Vector3::zeros());
        assert_eq!(state.orientation, Vector3::zeros());
        assert_eq!(state.accel_bias, Vector3::zeros());
        assert_eq!(state.aux_bias, Vector2::zeros());
    }

    #[test]
    fn test_vector_round_trip() {
        let mut state = QuadrotorState::new();
        state.position = Vector3::new(1.0, 2.0, 3.0);
        state.velocity = Vector3::new(-0.5, 0.25, 0.75);
        state.orientation = Vector3::new(0.1, -0.2, 1.5);
        state.accel_bias = Vector3::new(0.01, -0.02, 0.03);
        state.aux_bias = Vector2::new(4.0, 5.0);
        let vector = state.to_vector();
        assert_eq!(vector.len(), STATE_DIM);
        assert_eq!(vector[POSITION_INDEX], 1.0);
        assert_eq!(vector[VELOCITY_INDEX], -0.5);
        assert_eq!(vector[ORIENTATION_INDEX], 0.1);
        assert_eq!(vector[ACCEL_BIAS_INDEX], 0.01);
        assert_eq!(vector[AUX_BIAS_INDEX], 4.0);
        let rebuilt = QuadrotorState::from_vector(&vector);
        assert_eq!(rebuilt, state);
    }

    #[test]
    fn test_disturbance_from_legacy_layout() {
        let mut legacy = vec![0.0; 9];
        legacy[6] = 0.01;
        legacy[7] = -0.02;
        legacy[8] = 0.03;
        let sample = DisturbanceSample::from(legacy);
        assert_eq!(sample.accel_bias_drift, Vector3::new(0.01, -0.02, 0.03));
    }

    #[test]
    fn test_rotation_matrix_is_orthonormal() {
        let m = rpy_to_rot_mat(0.3, -0.4, 1.2);
        let should_be_identity = m * m.transpose();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(should_be_identity[(i, j)], expected, 1e-12);
            }
        }
        assert_approx_eq!(m.determinant(), 1.0, 1e-12);
    }

    #[test]
    fn test_half_angle_atan2_matches_standard_on_principal_domain() {
        for &(y, x) in &[(0.5, 1.0), (-0.3, 0.8), (1.0, 0.2), (-0.9, 0.1), (0.0, 1.0)] {
            assert_approx_eq!(half_angle_atan2(y, x), y.atan2(x), 1e-12);
        }
    }

    #[test]
    fn test_angle_round_trip_away_from_gimbal_lock() {
        let cases = [
            (0.0, 0.0, 0.0),
            (0.3, -0.6, 1.2),
            (-1.2, 0.4, -2.5),
            (1.4, 1.0, 3.0),
            (-1.5, -3.0, 0.1),
        ];
        for &(roll, pitch, yaw) in &cases {
            let m = rpy_to_rot_mat(roll, pitch, yaw);
            let (r, p, y) = rot_mat_to_rpy(&m);
            assert_approx_eq!(r, roll, 1e-9);
            // Pitch and yaw recover modulo a full turn
            assert_approx_eq!((p - pitch).sin(), 0.0, 1e-9);
            assert_approx_eq!((p - pitch).cos(), 1.0, 1e-9);
            assert_approx_eq!((y - yaw).sin(), 0.0, 1e-9);
            assert_approx_eq!((y - yaw).cos(), 1.0, 1e-9);
        }
    }

    #[test]
    fn test_forward_hover_holds_still() {
        // Sensed acceleration that exactly cancels the gravity offset at identity attitude
        let gravity_offset = Vector3::new(0.4109, 0.4024, 9.6343);
        let mut state = QuadrotorState::new();
        let imu = ImuInput::new(gravity_offset, Vector3::zeros());
        forward(
            &mut state,
            imu,
            DisturbanceSample::zeros(),
            gravity_offset,
            0.1,
        );
        assert_approx_eq!(state.position.norm(), 0.0, 1e-12);
        assert_approx_eq!(state.velocity.norm(), 0.0, 1e-12);
        assert_approx_eq!(state.orientation.norm(), 0.0, 1e-12);
    }

    #[test]
    fn test_forward_constant_acceleration_kinematics() {
        // 1 m/s^2 along world x for one second, integrated in ten steps
        let gravity_offset = Vector3::new(0.0, 0.0, 9.6343);
        let mut state = QuadrotorState::new();
        let imu = ImuInput::new(Vector3::new(1.0, 0.0, 9.6343), Vector3::zeros());
        for _ in 0..10 {
            forward(
                &mut state,
                imu,
                DisturbanceSample::zeros(),
                gravity_offset,
                0.1,
            );
        }
        assert_approx_eq!(state.velocity[0], 1.0, 1e-9);
        // Discrete second-order integration reproduces x = t^2 / 2 exactly for constant a
        assert_approx_eq!(state.position[0], 0.5, 1e-9);
    }

    #[test]
    fn test_forward_bias_compensation() {
        // A bias estimate equal to the sensed offset leaves only the gravity term
        let gravity_offset = Vector3::new(0.0, 0.0, 9.6343);
        let mut state = QuadrotorState::new();
        state.accel_bias = Vector3::new(0.2, -0.1, 0.0);
        let imu = ImuInput::new(Vector3::new(0.2, -0.1, 9.6343), Vector3::zeros());
        forward(
            &mut state,
            imu,
            DisturbanceSample::zeros(),
            gravity_offset,
            0.5,
        );
        assert_approx_eq!(state.velocity[0], 0.0, 1e-12);
        assert_approx_eq!(state.velocity[1], 0.0, 1e-12);
        assert_approx_eq!(state.velocity[2], 0.0, 1e-12);
    }

    #[test]
    fn test_forward_bias_random_walk_and_aux_passthrough() {
        let mut state = QuadrotorState::new();
        state.aux_bias = Vector2::new(7.0, -3.0);
        let disturbance = DisturbanceSample {
            accel_bias_drift: Vector3::new(0.01, 0.02, -0.03),
        };
        let imu = ImuInput::new(Vector3::new(0.4109, 0.4024, 9.6343), Vector3::zeros());
        forward(
            &mut state,
            imu,
            disturbance,
            Vector3::new(0.4109, 0.4024, 9.6343),
            0.5,
        );
        assert_approx_eq!(state.accel_bias[0], 0.005, 1e-12);
        assert_approx_eq!(state.accel_bias[1], 0.01, 1e-12);
        assert_approx_eq!(state.accel_bias[2], -0.015, 1e-12);
        assert_eq!(state.aux_bias, Vector2::new(7.0, -3.0));
    }

    #[test]
    fn test_forward_yaw_rate_integration() {
        let gravity_offset = Vector3::new(0.0, 0.0, 9.6343);
        let mut state = QuadrotorState::new();
        let imu = ImuInput::new(Vector3::new(0.0, 0.0, 9.6343), Vector3::new(0.0, 0.0, 0.5));
        forward(
            &mut state,
            imu,
            DisturbanceSample::zeros(),
            gravity_offset,
            0.2,
        );
        assert_approx_eq!(state.orientation[2], 0.1, 1e-9);
        assert_approx_eq!(state.orientation[0], 0.0, 1e-9);
        assert_approx_eq!(state.orientation[1], 0.0, 1e-9);
    }
}
