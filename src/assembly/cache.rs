//! Memoization of shape function values and quadrature rules.
//!
//! Evaluating the basis on every cell of the joint traversal is dominated by a
//! small number of distinct situations: the same shapes, quadrature orders and
//! sub-element paths recur across elements. Two tables capture this:
//!
//! * the *affine* table stores physically transformed values and gradients,
//!   keyed by the (constant) inverse Jacobian entries so that congruent
//!   elements share entries, and
//! * the *general* table stores untransformed reference-domain values for
//!   elements with non-constant Jacobians, where the physical transformation
//!   must be applied per quadrature point anyway.
//!
//! Ordered map keys compare the inverse Jacobian entries first, so entries of
//! congruent elements cluster together.

use crate::quadrature::{self, Rule1d, Rule2d};
use nalgebra::Matrix2;
use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Domain tag for volume quadrature; edges use their index 0..=3.
pub const VOLUME_DOMAIN: u8 = 4;

/// Cache key for shape values on elements with a constant inverse Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AffineKey {
    /// Row-major entries of the inverse Jacobian. First field on purpose: keys
    /// of congruent elements are adjacent in the table.
    pub inv_map: [[OrderedFloat<f64>; 2]; 2],
    pub shape: usize,
    pub order: u32,
    pub sub_idx: u64,
    pub domain: u8,
    pub shapeset: u32,
}

impl AffineKey {
    pub fn new(
        inv_map: &Matrix2<f64>,
        shape: usize,
        order: u32,
        sub_idx: u64,
        domain: u8,
        shapeset: u32,
    ) -> Self {
        Self {
            inv_map: [
                [OrderedFloat(inv_map.m11), OrderedFloat(inv_map.m12)],
                [OrderedFloat(inv_map.m21), OrderedFloat(inv_map.m22)],
            ],
            shape,
            order,
            sub_idx,
            domain,
            shapeset,
        }
    }
}

/// Cache key for reference-domain shape values; element independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GeneralKey {
    pub shape: usize,
    pub order: u32,
    pub sub_idx: u64,
    pub domain: u8,
    pub shapeset: u32,
}

/// Values and partial derivatives of one shape function at the quadrature
/// points of one rule. Whether the derivatives are physical or
/// reference-domain depends on the table the entry lives in.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeValues {
    pub value: Vec<f64>,
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
}

/// Hit statistics, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub computed: u64,
    pub hits: u64,
}

/// The per-assembler cache of shape values and quadrature rules.
#[derive(Debug, Default)]
pub struct AssemblingCache {
    affine: BTreeMap<AffineKey, Rc<ShapeValues>>,
    general: BTreeMap<GeneralKey, Rc<ShapeValues>>,
    volume_rules: FxHashMap<u32, Rc<Rule2d>>,
    edge_rules: FxHashMap<u32, Rc<Rule1d>>,
    stats: CacheStats,
}

impl AssemblingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The memoized tensor-product rule exact for polynomials of `order`.
    pub fn volume_rule(&mut self, order: u32) -> Rc<Rule2d> {
        Rc::clone(self.volume_rules.entry(order).or_insert_with(|| {
            Rc::new(quadrature::tensor_gauss(quadrature::points_for_degree(
                order,
            )))
        }))
    }

    /// The memoized 1D rule exact for polynomials of `order`.
    pub fn edge_rule(&mut self, order: u32) -> Rc<Rule1d> {
        Rc::clone(self.edge_rules.entry(order).or_insert_with(|| {
            Rc::new(quadrature::gauss(quadrature::points_for_degree(order)))
        }))
    }

    pub fn affine_values(
        &mut self,
        key: AffineKey,
        compute: impl FnOnce() -> ShapeValues,
    ) -> Rc<ShapeValues> {
        match self.affine.entry(key) {
            std::collections::btree_map::Entry::Occupied(entry) => {
                self.stats.hits += 1;
                Rc::clone(entry.get())
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                self.stats.computed += 1;
                Rc::clone(entry.insert(Rc::new(compute())))
            }
        }
    }

    pub fn general_values(
        &mut self,
        key: GeneralKey,
        compute: impl FnOnce() -> ShapeValues,
    ) -> Rc<ShapeValues> {
        match self.general.entry(key) {
            std::collections::btree_map::Entry::Occupied(entry) => {
                self.stats.hits += 1;
                Rc::clone(entry.get())
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                self.stats.computed += 1;
                Rc::clone(entry.insert(Rc::new(compute())))
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drops all cached shape values, e.g. after a mesh or space changed.
    /// Quadrature rules are structure independent and survive.
    pub fn clear_shape_tables(&mut self) {
        self.affine.clear();
        self.general.clear();
        self.stats = CacheStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_values() -> ShapeValues {
        ShapeValues {
            value: vec![1.0],
            dx: vec![0.0],
            dy: vec![0.0],
        }
    }

    #[test]
    fn repeated_lookups_hit_the_cache() {
        let mut cache = AssemblingCache::new();
        let key = GeneralKey {
            shape: 3,
            order: 2,
            sub_idx: 0,
            domain: VOLUME_DOMAIN,
            shapeset: 1 << 8 | 1,
        };
        let first = cache.general_values(key, dummy_values);
        let second = cache.general_values(key, || panic!("must not recompute"));
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(cache.stats(), CacheStats { computed: 1, hits: 1 });
    }

    #[test]
    fn affine_keys_order_by_inverse_map_first() {
        let small = AffineKey::new(&Matrix2::identity(), 9, 9, 9, VOLUME_DOMAIN, 9);
        let large = AffineKey::new(&(Matrix2::identity() * 2.0), 0, 0, 0, VOLUME_DOMAIN, 0);
        assert!(small < large);
    }

    #[test]
    fn quadrature_rules_are_memoized() {
        let mut cache = AssemblingCache::new();
        let a = cache.volume_rule(4);
        let b = cache.volume_rule(4);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.points.len(), 9);
        let edge = cache.edge_rule(3);
        assert_eq!(edge.points.len(), 2);
    }

    #[test]
    fn clearing_resets_tables_but_keeps_rules() {
        let mut cache = AssemblingCache::new();
        let rule = cache.volume_rule(2);
        let key = GeneralKey {
            shape: 0,
            order: 2,
            sub_idx: 0,
            domain: VOLUME_DOMAIN,
            shapeset: 0,
        };
        cache.general_values(key, dummy_values);
        cache.clear_shape_tables();
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(Rc::ptr_eq(&rule, &cache.volume_rule(2)));
        cache.general_values(key, dummy_values);
        assert_eq!(cache.stats().computed, 1);
    }
}
