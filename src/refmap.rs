//! Bilinear reference mappings for quadrilateral elements.
//!
//! The reference domain is the square $[-1, 1]^2$ with counter-clockwise
//! corners. Since the geometry is bilinear, every sub-quad reached by a path of
//! son transformations is again an exact bilinear quad whose corners are
//! obtained from midpoints and the cell center, and element edges are straight
//! segments.

use crate::mesh::SubPath;
use nalgebra::{Matrix2, Point2, Vector2};

/// Reference mapping of a (sub-)quadrilateral.
#[derive(Debug, Clone, PartialEq)]
pub struct RefMap {
    corners: [Point2<f64>; 4],
}

impl RefMap {
    pub fn from_corners(corners: [Point2<f64>; 4]) -> Self {
        Self { corners }
    }

    /// The mapping of the sub-quad reached from `corners` by `path`.
    pub fn for_sub_element(corners: [Point2<f64>; 4], path: &SubPath) -> Self {
        let mut current = corners;
        for &son in path.as_slice() {
            current = sub_quad_corners(&current, son);
        }
        Self { corners: current }
    }

    pub fn corners(&self) -> &[Point2<f64>; 4] {
        &self.corners
    }

    /// Maps a reference point to physical coordinates.
    pub fn map(&self, xi: &Point2<f64>) -> Point2<f64> {
        let n = bilinear_basis(xi);
        let mut coords = Vector2::zeros();
        for k in 0..4 {
            coords += self.corners[k].coords * n[k];
        }
        Point2::from(coords)
    }

    /// The Jacobian of the mapping at a reference point.
    pub fn jacobian(&self, xi: &Point2<f64>) -> Matrix2<f64> {
        let (dxi, deta) = bilinear_basis_gradients(xi);
        let mut j = Matrix2::zeros();
        for k in 0..4 {
            j.m11 += self.corners[k].x * dxi[k];
            j.m12 += self.corners[k].x * deta[k];
            j.m21 += self.corners[k].y * dxi[k];
            j.m22 += self.corners[k].y * deta[k];
        }
        j
    }

    /// Whether the mapping is affine, i.e. the quad is a parallelogram and the
    /// Jacobian is constant.
    pub fn is_affine(&self) -> bool {
        let c = &self.corners;
        let defect = (c[0].coords - c[1].coords) + (c[2].coords - c[3].coords);
        let scale = (c[2].coords - c[0].coords).norm().max(f64::MIN_POSITIVE);
        defect.norm() <= 1e-12 * scale
    }

    /// The constant inverse Jacobian for affine mappings.
    pub fn constant_inverse_jacobian(&self) -> Option<Matrix2<f64>> {
        if self.is_affine() {
            self.jacobian(&Point2::new(0.0, 0.0)).try_inverse()
        } else {
            None
        }
    }

    /// The physical endpoints of reference edge `edge` (straight for bilinear
    /// quads).
    pub fn edge_endpoints(&self, edge: u8) -> (Point2<f64>, Point2<f64>) {
        (
            self.corners[edge as usize],
            self.corners[(edge as usize + 1) % 4],
        )
    }

    /// Half the physical edge vector, i.e. the tangent with respect to the edge
    /// parameter $t \in [-1, 1]$.
    pub fn edge_tangent(&self, edge: u8) -> Vector2<f64> {
        let (a, b) = self.edge_endpoints(edge);
        (b.coords - a.coords) * 0.5
    }

    /// The outward unit normal on the given edge. Assumes counter-clockwise
    /// corner orientation.
    pub fn edge_unit_normal(&self, edge: u8) -> Vector2<f64> {
        let tangent = self.edge_tangent(edge);
        Vector2::new(tangent.y, -tangent.x).normalize()
    }
}

/// Corners of son `son` of a bilinear quad.
pub fn sub_quad_corners(corners: &[Point2<f64>; 4], son: u8) -> [Point2<f64>; 4] {
    let son = son as usize;
    let midpoint = |a: usize, b: usize| {
        Point2::from((corners[a].coords + corners[b].coords) * 0.5)
    };
    let center = Point2::from(
        corners.iter().fold(Vector2::zeros(), |acc, c| acc + c.coords) * 0.25,
    );
    let mut sub = [Point2::origin(); 4];
    sub[son] = corners[son];
    sub[(son + 1) % 4] = midpoint(son, (son + 1) % 4);
    sub[(son + 2) % 4] = center;
    sub[(son + 3) % 4] = midpoint((son + 3) % 4, son);
    sub
}

/// The point on reference edge `edge` at edge parameter $t \in [-1, 1]$,
/// oriented from corner `edge` towards corner `edge + 1`.
pub fn edge_reference_point(edge: u8, t: f64) -> Point2<f64> {
    match edge {
        0 => Point2::new(t, -1.0),
        1 => Point2::new(1.0, t),
        2 => Point2::new(-t, 1.0),
        3 => Point2::new(-1.0, -t),
        _ => panic!("Invalid edge index {edge}"),
    }
}

fn bilinear_basis(xi: &Point2<f64>) -> [f64; 4] {
    let (x, y) = (xi.x, xi.y);
    [
        (1.0 - x) * (1.0 - y) * 0.25,
        (1.0 + x) * (1.0 - y) * 0.25,
        (1.0 + x) * (1.0 + y) * 0.25,
        (1.0 - x) * (1.0 + y) * 0.25,
    ]
}

fn bilinear_basis_gradients(xi: &Point2<f64>) -> ([f64; 4], [f64; 4]) {
    let (x, y) = (xi.x, xi.y);
    let dxi = [
        -(1.0 - y) * 0.25,
        (1.0 - y) * 0.25,
        (1.0 + y) * 0.25,
        -(1.0 + y) * 0.25,
    ];
    let deta = [
        -(1.0 - x) * 0.25,
        -(1.0 + x) * 0.25,
        (1.0 + x) * 0.25,
        (1.0 - x) * 0.25,
    ];
    (dxi, deta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_quad() -> [Point2<f64>; 4] {
        [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ]
    }

    #[test]
    fn maps_reference_corners_to_physical_corners() {
        let map = RefMap::from_corners(unit_quad());
        for (k, corner) in crate::mesh::REFERENCE_CORNERS.iter().enumerate() {
            let mapped = map.map(&Point2::new(corner[0], corner[1]));
            assert!((mapped - unit_quad()[k]).norm() < 1e-14);
        }
    }

    #[test]
    fn axis_aligned_quad_is_affine_with_diagonal_jacobian() {
        let map = RefMap::from_corners(unit_quad());
        assert!(map.is_affine());
        let j = map.jacobian(&Point2::new(0.3, -0.7));
        assert!((j.m11 - 0.5).abs() < 1e-14);
        assert!((j.m22 - 0.5).abs() < 1e-14);
        assert!(j.m12.abs() < 1e-14 && j.m21.abs() < 1e-14);
        let j_inv = map.constant_inverse_jacobian().unwrap();
        assert!((j_inv.m11 - 2.0).abs() < 1e-14);
    }

    #[test]
    fn trapezoid_is_not_affine() {
        let map = RefMap::from_corners([
            Point2::new(0.0, 0.0),
            Point2::new(2.0, 0.0),
            Point2::new(1.5, 1.0),
            Point2::new(0.5, 1.0),
        ]);
        assert!(!map.is_affine());
        assert!(map.constant_inverse_jacobian().is_none());
    }

    #[test]
    fn sub_quad_matches_son_transformation() {
        let corners = unit_quad();
        let path = SubPath::from_slice(&[1, 3]);
        let sub = RefMap::for_sub_element(corners, &path);
        let full = RefMap::from_corners(corners);
        // Mapping a point through the sub-quad equals mapping its transformed
        // reference coordinates through the full quad.
        let xi = Point2::new(0.25, -0.5);
        let expected = full.map(&path.apply(&xi));
        assert!((sub.map(&xi) - expected).norm() < 1e-14);
    }

    #[test]
    fn outward_normals_of_unit_quad() {
        let map = RefMap::from_corners(unit_quad());
        assert!((map.edge_unit_normal(0) - Vector2::new(0.0, -1.0)).norm() < 1e-14);
        assert!((map.edge_unit_normal(1) - Vector2::new(1.0, 0.0)).norm() < 1e-14);
        assert!((map.edge_unit_normal(2) - Vector2::new(0.0, 1.0)).norm() < 1e-14);
        assert!((map.edge_unit_normal(3) - Vector2::new(-1.0, 0.0)).norm() < 1e-14);
    }
}
