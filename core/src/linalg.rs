//! Linear algebra helpers for the sigma-point filter.
//!
//! Public API:
//!     pub fn cholesky_factor(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn fallback_factor(dim: usize, diagonal: f64) -> DMatrix<f64>
//!     pub fn ensemble_mean(points: &DMatrix<f64>) -> DVector<f64>
//!     pub fn ensemble_covariance(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn invert_square(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!
//! The failure modes here are deliberately soft. Factorization of a covariance that has
//! drifted off the positive-definite cone returns `None` so the caller can substitute the
//! configured fixed-diagonal factor and keep running, and inversion of a singular innovation
//! covariance returns `None` so the caller can skip the correction for that step. Neither
//! path panics.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};

/// Lower-triangular Cholesky factor L with L * L^T equal to the input.
///
/// Returns `None` when the matrix is not symmetric positive-definite, which in this filter
/// happens when accumulated round-off pushes an eigenvalue of the summed covariance negative.
///
/// # Arguments
/// * `matrix` - the matrix to factor, assumed square and symmetric
///
/// # Returns
/// * `Some(L)` with L lower triangular, or `None` if the factorization fails.
pub fn cholesky_factor(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(matrix.clone()).map(|ch| ch.l())
}

/// Fixed-diagonal substitute factor used when [cholesky_factor] fails.
///
/// The diagonal value is a configured constant chosen to match the factor of a healthy
/// covariance, so the substituted spread is plausible rather than degenerate. The substitute
/// is valid for the step that requested it only; the next covariance is always rebuilt from
/// the propagated ensemble.
pub fn fallback_factor(dim: usize, diagonal: f64) -> DMatrix<f64> {
    DMatrix::from_diagonal_element(dim, dim, diagonal)
}

/// Column-wise average of a point ensemble.
///
/// Every column carries equal weight; the sum is divided by the column count uniformly.
pub fn ensemble_mean(points: &DMatrix<f64>) -> DVector<f64> {
    let mut mean = DVector::<f64>::zeros(points.nrows());
    for column in points.column_iter() {
        mean += column;
    }
    mean / points.ncols() as f64
}

/// Equal-weight covariance between two already mean-centered ensembles.
///
/// For A of shape d1 x n and B of shape d2 x n, returns the d1 x d2 matrix
/// $\sum_i a_i b_i^T / n$. The same reducer serves all three second moments the filter
/// needs: the state covariance (A = B = centered state ensemble), the predicted-observation
/// covariance (A = B = centered observation ensemble), and the state/observation
/// cross-covariance (A = centered state ensemble, B = centered observation ensemble).
///
/// # Arguments
/// * `a` - mean-centered ensemble, one point per column
/// * `b` - mean-centered ensemble with the same number of columns
pub fn ensemble_covariance(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    assert_eq!(
        a.ncols(),
        b.ncols(),
        "ensemble_covariance: ensembles must have the same number of points"
    );
    let mut covariance = DMatrix::<f64>::zeros(a.nrows(), b.nrows());
    for i in 0..a.ncols() {
        covariance += a.column(i) * b.column(i).transpose();
    }
    covariance / a.ncols() as f64
}

/// General square-matrix inverse via LU decomposition.
///
/// Returns `None` when the matrix is singular to working precision. Used on the innovation
/// covariance, where a `None` means the correction is skipped for the step rather than
/// aborting the filter.
pub fn invert_square(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    matrix.clone().lu().try_inverse()
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        if a.shape() != b.shape() {
            return false;
        }
        let mut max_abs = 0.0f64;
        for i in 0..a.nrows() {
            for j in 0..a.ncols() {
                max_abs = max_abs.max((a[(i, j)] - b[(i, j)]).abs());
            }
        }
        max_abs <= tol
    }

    #[test]
    fn t_cholesky_factor_spd() {
        // P = A A^T is symmetric positive-definite
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2]);
        let p = &a * a.transpose();
        let l = cholesky_factor(&p).expect("Cholesky should succeed for SPD");
        let back = &l * l.transpose();
        assert!(approx_eq(&back, &p, 1e-12));
    }

    #[test]
    fn t_cholesky_factor_indefinite_is_none() {
        // Eigenvalues 3 and -1
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(cholesky_factor(&m).is_none());
    }

    #[test]
    fn t_fallback_factor_shape_and_values() {
        let l = fallback_factor(4, 0.1225);
        assert_eq!(l.shape(), (4, 4));
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 0.1225 } else { 0.0 };
                assert_eq!(l[(i, j)], expected);
            }
        }
    }

    #[test]
    fn t_ensemble_mean_uniform_weights() {
        let points = DMatrix::from_row_slice(2, 4, &[1.0, 2.0, 3.0, 4.0, 0.0, -2.0, 2.0, 0.0]);
        let mean = ensemble_mean(&points);
        assert_eq!(mean[0], 2.5);
        assert_eq!(mean[1], 0.0);
    }

    #[test]
    fn t_ensemble_covariance_self_is_symmetric_psd() {
        // Centered ensemble: columns sum to zero in each row
        let centered = DMatrix::from_row_slice(
            3,
            4,
            &[
                1.0, -1.0, 2.0, -2.0, //
                0.5, 0.5, -0.5, -0.5, //
                -1.0, 1.0, 1.0, -1.0,
            ],
        );
        let cov = ensemble_covariance(&centered, &centered);
        assert!(approx_eq(&cov, &cov.transpose(), 1e-14));
        // x^T C x >= 0 for a spread of directions
        for &(x0, x1, x2) in &[(1.0, 0.0, 0.0), (1.0, -2.0, 0.5), (-0.3, 0.7, 1.1)] {
            let x = DVector::from_vec(vec![x0, x1, x2]);
            let q = (x.transpose() * &cov * &x)[(0, 0)];
            assert!(q >= -1e-12, "quadratic form should be non-negative, got {}", q);
        }
    }

    #[test]
    fn t_ensemble_covariance_cross_shape() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, -1.0, 2.0, -2.0, 0.0, 0.0]);
        let b = DMatrix::from_row_slice(2, 2, &[1.0, -1.0, 3.0, -3.0]);
        let cross = ensemble_covariance(&a, &b);
        assert_eq!(cross.shape(), (3, 2));
        // First entry: (1*1 + (-1)(-1)) / 2 = 1
        assert_eq!(cross[(0, 0)], 1.0);
        assert_eq!(cross[(1, 1)], 6.0);
    }

    #[test]
    #[should_panic(expected = "same number of points")]
    fn t_ensemble_covariance_mismatched_columns_panics() {
        let a = DMatrix::<f64>::zeros(2, 3);
        let b = DMatrix::<f64>::zeros(2, 4);
        let _ = ensemble_covariance(&a, &b);
    }

    #[test]
    fn t_invert_square_round_trip() {
        let m = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, -1.0, 0.0, -1.0, 2.0]);
        let inverse = invert_square(&m).expect("well-conditioned matrix should invert");
        let identity = DMatrix::<f64>::identity(3, 3);
        assert!(approx_eq(&(&m * &inverse), &identity, 1e-12));
    }

    #[test]
    fn t_invert_square_singular_is_none() {
        // Second row is a multiple of the first
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert!(invert_square(&m).is_none());
    }
}
