//! Gauss-Legendre quadrature rules on the reference interval and square.
//!
//! Rules are generated on demand with the Golub-Welsch algorithm: the nodes are
//! the eigenvalues of the symmetric tridiagonal Jacobi matrix associated with the
//! Legendre recurrence, and the weights follow from the first components of the
//! eigenvectors. An $n$-point rule integrates polynomials up to degree $2n - 1$
//! exactly on $[-1, 1]$.

use itertools::iproduct;
use nalgebra::{DMatrix, Point2, SymmetricEigen};

/// A quadrature rule on the reference interval $[-1, 1]$.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule1d {
    pub weights: Vec<f64>,
    pub points: Vec<f64>,
}

/// A tensor-product quadrature rule on the reference square $[-1, 1]^2$.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule2d {
    pub weights: Vec<f64>,
    pub points: Vec<Point2<f64>>,
}

/// The number of Gauss points needed to integrate a polynomial of the given
/// degree exactly (per axis for tensor-product rules).
pub fn points_for_degree(degree: u32) -> usize {
    (degree as usize / 2) + 1
}

/// The Gauss-Legendre rule with `num_points` points on $[-1, 1]$.
///
/// # Panics
///
/// Panics if `num_points` is zero.
pub fn gauss(num_points: usize) -> Rule1d {
    assert!(num_points > 0, "Quadrature rule must have at least one point");
    if num_points == 1 {
        return Rule1d {
            weights: vec![2.0],
            points: vec![0.0],
        };
    }

    let betas: Vec<f64> = (1..num_points)
        .map(|i| 0.5 / (1.0 - (2.0 * i as f64).powi(-2)).sqrt())
        .collect();
    let jacobi = DMatrix::from_fn(num_points, num_points, |r, c| {
        if r == c + 1 {
            betas[r - 1]
        } else if c == r + 1 {
            betas[c - 1]
        } else {
            0.0
        }
    });

    let eigen = SymmetricEigen::new(jacobi);
    let mut nodes: Vec<(f64, f64)> = eigen
        .eigenvalues
        .iter()
        .copied()
        .zip(eigen.eigenvectors.row(0).iter().map(|v0| v0.powi(2) * 2.0))
        .collect();
    nodes.sort_by(|a, b| a.0.total_cmp(&b.0));

    let (points, weights) = nodes.into_iter().unzip();
    Rule1d { weights, points }
}

/// The tensor-product Gauss-Legendre rule with `num_points` points per axis.
pub fn tensor_gauss(num_points: usize) -> Rule2d {
    let rule = gauss(num_points);
    let (weights, points) = iproduct!(
        rule.points.iter().zip(&rule.weights),
        rule.points.iter().zip(&rule.weights)
    )
    .map(|((&y, &wy), (&x, &wx))| (wx * wy, Point2::new(x, y)))
    .unzip();
    Rule2d { weights, points }
}
