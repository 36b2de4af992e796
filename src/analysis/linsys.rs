//! Dense linear-system solver used by every curve fit above order 1.

use nalgebra::{DMatrix, DVector};

const PIVOT_EPSILON: f64 = 1e-12;

/// Solve `A x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` when the system is singular (best available pivot magnitude
/// <= 1e-12). Callers treat that as a recoverable condition and fall back to a
/// lower-order fit. The caller's matrices are never mutated.
pub fn solve_linear_system(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let n = b.len();
    if a.nrows() != n || a.ncols() != n {
        return None;
    }
    let mut a = a.clone();
    let mut b = b.clone();

    for col in 0..n {
        // Pivot on the largest-magnitude entry at or below the diagonal.
        let mut pivot_row = col;
        let mut pivot_value = a[(col, col)].abs();
        for row in (col + 1)..n {
            let value = a[(row, col)].abs();
            if value > pivot_value {
                pivot_value = value;
                pivot_row = row;
            }
        }
        if !(pivot_value > PIVOT_EPSILON) {
            return None;
        }
        if pivot_row != col {
            a.swap_rows(col, pivot_row);
            b.swap_rows(col, pivot_row);
        }

        let pivot = a[(col, col)];
        for c in col..n {
            a[(col, c)] /= pivot;
        }
        b[col] /= pivot;

        for row in (col + 1)..n {
            let factor = a[(row, col)];
            if factor == 0.0 {
                continue;
            }
            for c in col..n {
                a[(row, c)] -= factor * a[(col, c)];
            }
            b[row] -= factor * b[col];
        }
    }

    // Back-substitution on the unit upper-triangular system.
    let mut solution = DVector::zeros(n);
    for row in (0..n).rev() {
        let mut sum = b[row];
        for c in (row + 1)..n {
            sum -= a[(row, c)] * solution[c];
        }
        solution[row] = sum;
    }
    Some(solution)
}
