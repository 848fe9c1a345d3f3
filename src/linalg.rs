//! Small hand-rolled linear algebra helpers.
//!
//! The matrices involved in fitting a two-parameter linear alignment or a
//! low-order ARMA model are tiny (at most a couple of dozen columns), so a
//! dependency on a full linear-algebra crate isn't warranted. This mirrors
//! the style of `ml_engine::correlations`, which computes Pearson's r with
//! plain summation loops rather than reaching for a stats crate.

/// Solve the ordinary-least-squares problem `X * beta ~= y` via the normal
/// equations `(X^T X) beta = X^T y`, solved by Gaussian elimination with
/// partial pivoting.
///
/// `rows` is the design matrix in row-major form (`rows[i]` is the i-th
/// observation's feature vector); `y` is the target vector. Returns `None`
/// if `X^T X` is singular to working precision.
pub fn ols_fit(rows: &[Vec<f64>], y: &[f64]) -> Option<Vec<f64>> {
    let n = rows.len();
    if n == 0 || y.len() != n {
        return None;
    }
    let p = rows[0].len();
    if p == 0 || rows.iter().any(|r| r.len() != p) {
        return None;
    }

    // Build X^T X (p x p) and X^T y (p).
    let mut xtx = vec![vec![0.0_f64; p]; p];
    let mut xty = vec![0.0_f64; p];
    for (row, &yi) in rows.iter().zip(y.iter()) {
        for a in 0..p {
            xty[a] += row[a] * yi;
            for b in 0..p {
                xtx[a][b] += row[a] * row[b];
            }
        }
    }

    solve_linear_system(&xtx, &xty)
}

/// Solve `A * x = b` via Gaussian elimination with partial pivoting.
/// Returns `None` if `A` is (numerically) singular.
pub fn solve_linear_system(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = a.len();
    if n == 0 || b.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }

    // Augmented matrix.
    let mut m: Vec<Vec<f64>> = a
        .iter()
        .zip(b.iter())
        .map(|(row, &bi)| {
            let mut r = row.clone();
            r.push(bi);
            r
        })
        .collect();

    for col in 0..n {
        // Partial pivot: largest absolute value in this column at or below `col`.
        let pivot_row = (col..n).max_by(|&i, &j| {
            m[i][col]
                .abs()
                .partial_cmp(&m[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;

        if m[pivot_row][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        for val in m[col].iter_mut() {
            *val /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = m[row][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..=n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    Some((0..n).map(|i| m[i][n]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_identity_system() {
        let a = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let b = vec![3.0, 4.0];
        let x = solve_linear_system(&a, &b).unwrap();
        assert!((x[0] - 3.0).abs() < 1e-9);
        assert!((x[1] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn solves_simple_two_by_two() {
        // 2x + y = 5, x - y = 1  => x = 2, y = 1
        let a = vec![vec![2.0, 1.0], vec![1.0, -1.0]];
        let b = vec![5.0, 1.0];
        let x = solve_linear_system(&a, &b).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-9);
        assert!((x[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn singular_system_returns_none() {
        let a = vec![vec![1.0, 1.0], vec![2.0, 2.0]];
        let b = vec![1.0, 2.0];
        assert!(solve_linear_system(&a, &b).is_none());
    }

    #[test]
    fn ols_recovers_exact_linear_relationship() {
        // y = 2x + 1, noise-free, solved via normal equations.
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, 1.0]).collect();
        let y: Vec<f64> = (0..20).map(|i| 2.0 * i as f64 + 1.0).collect();
        let beta = ols_fit(&rows, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-6);
        assert!((beta[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ols_rejects_mismatched_dimensions() {
        let rows = vec![vec![1.0, 2.0], vec![1.0]];
        let y = vec![1.0, 2.0];
        assert!(ols_fit(&rows, &y).is_none());
    }
}
