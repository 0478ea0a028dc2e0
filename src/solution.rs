//! Finite element functions backed by coefficient vectors.
//!
//! A [`Solution`] pairs a [`Space`] with a global coefficient vector and can be
//! evaluated on any sub-element of the space's mesh. During nonlinear assembly
//! the previous iterate enters the forms this way.

use crate::mesh::{ElementIndex, SubPath};
use crate::refmap::RefMap;
use crate::space::Space;
use eyre::{ensure, eyre, Result};
use nalgebra::{DVector, Point2, Vector2};
use std::sync::Arc;

/// Values and physical gradients of a solution at a set of points.
#[derive(Debug, Clone, Default)]
pub struct SolutionValues {
    pub values: Vec<f64>,
    pub gradients: Vec<Vector2<f64>>,
}

/// A function in a finite element space, defined by its coefficient vector.
pub struct Solution {
    space: Arc<Space>,
    /// Per active element, the coefficient of each local shape function.
    local: Vec<Vec<f64>>,
    space_seq: u64,
}

impl Solution {
    /// Builds a solution from a global coefficient vector.
    ///
    /// With `add_dir_lift`, shape functions constrained by essential boundary
    /// conditions contribute their prescribed values; otherwise they are
    /// treated as zero.
    pub fn from_coefficients(
        space: Arc<Space>,
        coefficients: &DVector<f64>,
        add_dir_lift: bool,
    ) -> Result<Self> {
        let ndof = space
            .num_dofs()
            .ok_or_else(|| eyre!("Space has no assigned DOFs"))?;
        ensure!(
            coefficients.len() == ndof,
            "Coefficient vector length {} does not match DOF count {}",
            coefficients.len(),
            ndof
        );

        let mut local = vec![Vec::new(); space.mesh().num_elements()];
        for element in space.mesh().active_elements() {
            local[element] = space
                .element_assembly_list(element)
                .entries
                .iter()
                .map(|entry| match entry.dof {
                    Some(dof) => coefficients[dof],
                    None if add_dir_lift => entry.coef,
                    None => 0.0,
                })
                .collect();
        }
        let space_seq = space.seq();
        Ok(Self {
            space,
            local,
            space_seq,
        })
    }

    pub fn space(&self) -> &Arc<Space> {
        &self.space
    }

    /// Evaluates the solution on the sub-element of `element` given by `path`,
    /// at reference points of that sub-element.
    ///
    /// Fails if the space has been reassigned since this solution was built.
    pub fn evaluate(
        &self,
        element: ElementIndex,
        path: &SubPath,
        points: &[Point2<f64>],
    ) -> Result<SolutionValues> {
        ensure!(
            self.space.seq() == self.space_seq,
            "Solution is stale: space DOFs were reassigned after it was built"
        );
        let coefficients = &self.local[element];
        let shapeset = self.space.shapeset();
        let refmap = RefMap::from_corners(self.space.mesh().element_corners(element));

        let mut values = Vec::with_capacity(points.len());
        let mut gradients = Vec::with_capacity(points.len());
        for point in points {
            let xi = path.apply(point);
            let mut value = 0.0;
            let mut ref_grad = Vector2::zeros();
            for (shape, &coef) in coefficients.iter().enumerate() {
                let (v, dx, dy) = shapeset.eval(shape, &xi);
                value += coef * v;
                ref_grad += coef * Vector2::new(dx, dy);
            }
            let jacobian_inv = refmap
                .jacobian(&xi)
                .try_inverse()
                .ok_or_else(|| eyre!("Degenerate element {element}: singular Jacobian"))?;
            values.push(value);
            gradients.push(jacobian_inv.transpose() * ref_grad);
        }
        Ok(SolutionValues { values, gradients })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::create_unit_square_uniform_quad_mesh_2d;
    use crate::space::Continuity;

    fn linear_space() -> Arc<Space> {
        let mesh = Arc::new(create_unit_square_uniform_quad_mesh_2d(2));
        let mut space = Space::new(mesh, 1, Continuity::Continuous);
        space.assign_dofs().unwrap();
        Arc::new(space)
    }

    #[test]
    fn reproduces_linear_function_exactly() {
        let space = linear_space();
        // u(x, y) = 2x + 3y at the 9 grid vertices. Shapes are in tensor
        // order, so place each nodal value via the reference mapping.
        let mut coefficients = DVector::zeros(space.num_dofs().unwrap());
        for element in space.mesh().active_elements().collect::<Vec<_>>() {
            let refmap = RefMap::from_corners(space.mesh().element_corners(element));
            for (s, entry) in space
                .element_assembly_list(element)
                .entries
                .iter()
                .enumerate()
            {
                let node = Point2::new(-1.0 + 2.0 * (s % 2) as f64, -1.0 + 2.0 * (s / 2) as f64);
                let x = refmap.map(&node);
                coefficients[entry.dof.unwrap()] = 2.0 * x.x + 3.0 * x.y;
            }
        }
        let solution = Solution::from_coefficients(space, &coefficients, false).unwrap();

        let points = [Point2::new(0.3, -0.4), Point2::new(-1.0, 1.0)];
        let result = solution.evaluate(0, &SubPath::new(), &points).unwrap();
        let refmap = RefMap::from_corners(solution.space().mesh().element_corners(0));
        for (value, (gradient, point)) in result
            .values
            .iter()
            .zip(result.gradients.iter().zip(&points))
        {
            let x = refmap.map(point);
            assert!((value - (2.0 * x.x + 3.0 * x.y)).abs() < 1e-13);
            assert!((gradient - Vector2::new(2.0, 3.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn sub_element_evaluation_matches_parent() {
        let space = linear_space();
        let ndof = space.num_dofs().unwrap();
        let coefficients = DVector::from_fn(ndof, |i, _| (i as f64 + 1.0).sin());
        let solution = Solution::from_coefficients(space, &coefficients, false).unwrap();

        let path = SubPath::from_slice(&[2]);
        let xi = Point2::new(-0.2, 0.6);
        let on_sub = solution.evaluate(0, &path, &[xi]).unwrap();
        let on_parent = solution.evaluate(0, &SubPath::new(), &[path.apply(&xi)]).unwrap();
        assert!((on_sub.values[0] - on_parent.values[0]).abs() < 1e-13);
        assert!((on_sub.gradients[0] - on_parent.gradients[0]).norm() < 1e-12);
    }

    #[test]
    fn dirichlet_lift_restores_boundary_values() {
        let mesh = Arc::new(create_unit_square_uniform_quad_mesh_2d(1));
        let mut space = Space::new(mesh, 1, Continuity::Continuous);
        space.set_essential_bc(|_, _| Some(5.0));
        let ndof = space.assign_dofs().unwrap();
        assert_eq!(ndof, 0);
        let space = Arc::new(space);

        let lifted =
            Solution::from_coefficients(Arc::clone(&space), &DVector::zeros(0), true).unwrap();
        let plain = Solution::from_coefficients(space, &DVector::zeros(0), false).unwrap();

        let center = [Point2::new(0.0, 0.0)];
        assert!((lifted.evaluate(0, &SubPath::new(), &center).unwrap().values[0] - 5.0).abs() < 1e-13);
        assert_eq!(plain.evaluate(0, &SubPath::new(), &center).unwrap().values[0], 0.0);
    }
}
