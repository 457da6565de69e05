//! 4x4 linear solver for the Steinhart-Hart normal equations.

use std::fmt;

pub type Vector4 = [f64; 4];
pub type Matrix4 = [Vector4; 4];

/// Row-sum condition-number estimates above this reject the system.
const CONDITION_MAX: f64 = 1e15;
/// Determinant magnitudes below this reject the system.
const DETERMINANT_MIN: f64 = 1e-10;

/// Why a solve was refused. The messages are surfaced verbatim in
/// calibration diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveError {
    IllConditioned { estimate: f64 },
    NearSingular { determinant: f64 },
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllConditioned { estimate } => {
                write!(f, "matrix ill-conditioned, condition number estimate: {estimate:.12e}")
            }
            Self::NearSingular { determinant } => {
                write!(f, "matrix is singular/near-singular, determinant: {determinant:.12e}")
            }
        }
    }
}

impl std::error::Error for SolveError {}

fn det3(m: &Matrix4, rows: [usize; 3], cols: [usize; 3]) -> f64 {
    let [r0, r1, r2] = rows;
    let [c0, c1, c2] = cols;
    m[r0][c0] * (m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1])
        - m[r0][c1] * (m[r1][c0] * m[r2][c2] - m[r1][c2] * m[r2][c0])
        + m[r0][c2] * (m[r1][c0] * m[r2][c1] - m[r1][c1] * m[r2][c0])
}

fn det4(m: &Matrix4) -> f64 {
    m[0][0] * det3(m, [1, 2, 3], [1, 2, 3]) - m[0][1] * det3(m, [1, 2, 3], [0, 2, 3])
        + m[0][2] * det3(m, [1, 2, 3], [0, 1, 3])
        - m[0][3] * det3(m, [1, 2, 3], [0, 1, 2])
}

/// Solve `m * x = rhs` by Gauss elimination with partial pivoting.
///
/// Prechecks reject ill-conditioned systems (row-sum-norm condition
/// estimate) and near-singular ones (determinant magnitude) before any
/// elimination happens.
pub fn solve4(mut m: Matrix4, mut rhs: Vector4) -> Result<Vector4, SolveError> {
    let mut max_row_sum = f64::MIN;
    let mut min_row_sum = f64::MAX;
    for row in &m {
        let sum: f64 = row.iter().map(|v| v.abs()).sum();
        max_row_sum = max_row_sum.max(sum);
        min_row_sum = min_row_sum.min(sum);
    }
    let estimate = max_row_sum / min_row_sum;
    if estimate > CONDITION_MAX {
        return Err(SolveError::IllConditioned { estimate });
    }

    let determinant = det4(&m);
    if determinant.abs() < DETERMINANT_MIN {
        return Err(SolveError::NearSingular { determinant });
    }

    for i in 0..4 {
        let mut pivot = i;
        for j in i + 1..4 {
            if m[j][i].abs() > m[pivot][i].abs() {
                pivot = j;
            }
        }
        if pivot != i {
            m.swap(i, pivot);
            rhs.swap(i, pivot);
        }
        for j in i + 1..4 {
            let factor = m[j][i] / m[i][i];
            for k in i..4 {
                m[j][k] -= factor * m[i][k];
            }
            rhs[j] -= factor * rhs[i];
        }
    }

    let mut result = [0.0; 4];
    for i in (0..4).rev() {
        result[i] = rhs[i];
        for j in i + 1..4 {
            result[i] -= m[i][j] * result[j];
        }
        result[i] /= m[i][i];
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_identity() {
        let m = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let x = solve4(m, [1.0, 2.0, 3.0, 4.0]).expect("identity is solvable");
        assert_eq!(x, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn solves_known_system() {
        // x = [1, -2, 3, 0.5]
        let m = [
            [2.0, 1.0, 0.0, 0.0],
            [1.0, 3.0, 1.0, 0.0],
            [0.0, 1.0, 4.0, 1.0],
            [0.0, 0.0, 1.0, 5.0],
        ];
        let expected = [1.0, -2.0, 3.0, 0.5];
        let rhs: Vector4 = std::array::from_fn(|i| {
            (0..4).map(|j| m[i][j] * expected[j]).sum()
        });
        let x = solve4(m, rhs).expect("well conditioned");
        for (got, want) in x.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} != {want}");
        }
    }

    #[test]
    fn pivoting_handles_zero_leading_entry() {
        let m = [
            [0.0, 2.0, 0.0, 0.0],
            [3.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 4.0, 0.0],
            [0.0, 0.0, 0.0, 5.0],
        ];
        let x = solve4(m, [2.0, 3.0, 4.0, 5.0]).expect("solvable with pivoting");
        for (got, want) in x.iter().zip([1.0, 1.0, 1.0, 1.0]) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn rejects_singular_matrix() {
        let m = [
            [1.0, 2.0, 3.0, 4.0],
            [2.0, 4.0, 6.0, 8.0], // multiple of row 0
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
        match solve4(m, [1.0; 4]) {
            Err(SolveError::NearSingular { .. }) => {}
            other => panic!("expected NearSingular, got {other:?}"),
        }
    }

    #[test]
    fn rejects_ill_conditioned_matrix() {
        let m = [
            [1e16, 0.0, 0.0, 0.0],
            [0.0, 1e-2, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        match solve4(m, [1.0; 4]) {
            Err(SolveError::IllConditioned { .. }) => {}
            other => panic!("expected IllConditioned, got {other:?}"),
        }
    }
}
