//! Per-tet quality records: AMIPS shape energy and dihedral angles.

use nalgebra::{Matrix3, Point3};
use rayon::prelude::*;
use tracing::debug;

use crate::predicates::{orient3d, Orientation};
use crate::types::{TetMesh, TET_FACETS};

/// Cap used when folding energies into averages and CSV-style digests.
pub const MAX_ENERGY: f64 = 1e50;

/// AMIPS-style shape energy of a tet.
///
/// Inverted and degenerate tets get a dedicated variant rather than a float
/// sentinel so that comparisons and adaptive resizing treat them correctly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Energy {
    Finite(f64),
    /// `det(J) <= 0`: the tet is inverted or flat.
    Inverted,
}

impl Energy {
    /// Numeric view, capped at [`MAX_ENERGY`] for inverted tets.
    #[inline]
    pub fn capped(self) -> f64 {
        match self {
            Energy::Finite(v) => v.min(MAX_ENERGY),
            Energy::Inverted => MAX_ENERGY,
        }
    }

    #[inline]
    pub fn is_inverted(self) -> bool {
        matches!(self, Energy::Inverted)
    }

    /// True if `self` is strictly better (lower) than `other`.
    #[inline]
    pub fn is_better_than(self, other: Energy) -> bool {
        match (self, other) {
            (Energy::Inverted, _) => false,
            (Energy::Finite(_), Energy::Inverted) => true,
            (Energy::Finite(a), Energy::Finite(b)) => a < b,
        }
    }

    /// True if `self` is no worse (not higher) than `other`.
    #[inline]
    pub fn is_not_worse_than(self, other: Energy) -> bool {
        match (self, other) {
            (Energy::Inverted, Energy::Inverted) => true,
            (Energy::Inverted, Energy::Finite(_)) => false,
            (Energy::Finite(_), Energy::Inverted) => true,
            (Energy::Finite(a), Energy::Finite(b)) => a <= b,
        }
    }

    /// The worse of two energies.
    #[inline]
    pub fn max(self, other: Energy) -> Energy {
        if self.is_not_worse_than(other) {
            other
        } else {
            self
        }
    }
}

impl Default for Energy {
    fn default() -> Self {
        Energy::Inverted
    }
}

/// Quality record of a single tet.
#[derive(Debug, Clone, Copy, Default)]
pub struct TetQuality {
    /// Minimum dihedral angle, radians.
    pub min_d_angle: f64,
    /// Maximum dihedral angle, radians.
    pub max_d_angle: f64,
    /// AMIPS shape energy.
    pub slim_energy: Energy,
}

impl TetQuality {
    /// Compute the full record for the tet `(p0, p1, p2, p3)`.
    pub fn compute(p0: &Point3<f64>, p1: &Point3<f64>, p2: &Point3<f64>, p3: &Point3<f64>) -> Self {
        let (min_d_angle, max_d_angle) = dihedral_angle_range(p0, p1, p2, p3);
        Self {
            min_d_angle,
            max_d_angle,
            slim_energy: amips_energy(p0, p1, p2, p3),
        }
    }
}

// Inverse of the edge matrix of the regular reference tet
// (0,0,0), (1,0,0), (1/2, sqrt(3)/2, 0), (1/2, sqrt(3)/6, sqrt(6)/3).
const REF_INV: [f64; 9] = [
    1.0,
    -0.577_350_269_189_625_8,
    -0.408_248_290_463_863,
    0.0,
    1.154_700_538_379_251_5,
    -0.408_248_290_463_863,
    0.0,
    0.0,
    1.224_744_871_391_589,
];

/// AMIPS energy `tr(J^T J)^{3/2} / (3^{3/2} det J)` of the map `J` taking
/// the unit regular tet onto `(p0, p1, p2, p3)`.
///
/// The energy is scale- and rotation-invariant, reaches its minimum of 1 on
/// the regular tet, and is `Inverted` whenever `det(J) <= 0` (the exact
/// predicate decides the sign so float underflow cannot report a flat tet
/// as valid).
pub fn amips_energy(
    p0: &Point3<f64>,
    p1: &Point3<f64>,
    p2: &Point3<f64>,
    p3: &Point3<f64>,
) -> Energy {
    if orient3d(p0, p1, p2, p3) != Orientation::Positive {
        return Energy::Inverted;
    }
    let e = Matrix3::from_columns(&[p1 - p0, p2 - p0, p3 - p0]);
    let inv = Matrix3::from_row_slice(&REF_INV);
    let j = e * inv;
    let det = j.determinant();
    if !(det > 0.0) {
        // Exactly positive volume but the double determinant underflowed.
        return Energy::Inverted;
    }
    let frob2 = j.norm_squared();
    let value = frob2.powf(1.5) / (3.0_f64.powf(1.5) * det);
    if value.is_finite() {
        Energy::Finite(value)
    } else {
        Energy::Inverted
    }
}

/// Minimum and maximum dihedral angle of a tet, in radians.
///
/// A dihedral angle is measured between the two facets sharing each of the
/// six edges, using outward facet normals.
pub fn dihedral_angle_range(
    p0: &Point3<f64>,
    p1: &Point3<f64>,
    p2: &Point3<f64>,
    p3: &Point3<f64>,
) -> (f64, f64) {
    let ps = [*p0, *p1, *p2, *p3];
    let mut normals = [nalgebra::Vector3::zeros(); 4];
    for (f, facet) in TET_FACETS.iter().enumerate() {
        let a = ps[facet[0]];
        let b = ps[facet[1]];
        let c = ps[facet[2]];
        let n = (b - a).cross(&(c - a));
        let len = n.norm();
        normals[f] = if len > 0.0 { n / len } else { n };
    }
    let mut min = std::f64::consts::PI;
    let mut max = 0.0_f64;
    // Facets f and g share an edge for every pair f != g.
    for f in 0..4 {
        for g in (f + 1)..4 {
            let cos = (-normals[f].dot(&normals[g])).clamp(-1.0, 1.0);
            let angle = cos.acos();
            min = min.min(angle);
            max = max.max(angle);
        }
    }
    (min, max)
}

/// Aggregate energy statistics over the live tets.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyStats {
    pub max: f64,
    pub avg: f64,
    pub n_inverted: usize,
}

/// Recompute quality records for every live tet. Pure per-tet work, done in
/// parallel.
pub fn compute_all(mesh: &mut TetMesh) -> EnergyStats {
    let tets = &mesh.tets;
    let vertices = &mesh.vertices;
    let removed = &mesh.removed;
    let qualities: Vec<(usize, TetQuality)> = (0..tets.len())
        .into_par_iter()
        .filter(|&t| !removed[t])
        .map(|t| {
            let tet = tets[t];
            let q = TetQuality::compute(
                &vertices[tet[0] as usize].posf,
                &vertices[tet[1] as usize].posf,
                &vertices[tet[2] as usize].posf,
                &vertices[tet[3] as usize].posf,
            );
            (t, q)
        })
        .collect();

    let mut stats = EnergyStats::default();
    let mut count = 0usize;
    for (t, q) in qualities {
        if q.slim_energy.is_inverted() {
            stats.n_inverted += 1;
        }
        let e = q.slim_energy.capped();
        stats.max = stats.max.max(e);
        stats.avg += e;
        count += 1;
        mesh.qualities[t] = q;
    }
    if count > 0 {
        stats.avg /= count as f64;
    }
    stats
}

/// Log the final quality digest: dihedral-angle histogram tails, energy
/// extremes, and the number of vertices that could not be rounded.
pub fn log_final_quality(mesh: &TetMesh) {
    let thresholds_low = [6.0, 12.0, 18.0].map(f64::to_radians);
    let thresholds_high = [162.0, 168.0, 174.0].map(f64::to_radians);
    let mut low_counts = [0usize; 3];
    let mut high_counts = [0usize; 3];
    let mut min_angle = std::f64::consts::PI;
    let mut max_angle = 0.0_f64;
    let mut max_energy = 0.0_f64;
    let mut avg_energy = 0.0_f64;
    let mut count = 0usize;
    for t in mesh.active_tets() {
        let q = &mesh.qualities[t];
        min_angle = min_angle.min(q.min_d_angle);
        max_angle = max_angle.max(q.max_d_angle);
        max_energy = max_energy.max(q.slim_energy.capped());
        avg_energy += q.slim_energy.capped();
        count += 1;
        for (i, &thr) in thresholds_low.iter().enumerate() {
            if q.min_d_angle < thr {
                low_counts[i] += 1;
            }
        }
        for (i, &thr) in thresholds_high.iter().enumerate() {
            if q.max_d_angle > thr {
                high_counts[i] += 1;
            }
        }
    }
    if count == 0 {
        debug!("final quality: empty mesh");
        return;
    }
    let unrounded = mesh
        .vertices
        .iter()
        .filter(|v| !v.conn_tets.is_empty() && !v.is_rounded())
        .count();
    debug!(
        "final quality: min_d_angle = {:.4}, max_d_angle = {:.4}, max_energy = {:.4}, avg_energy = {:.4}",
        min_angle,
        max_angle,
        max_energy,
        avg_energy / count as f64
    );
    debug!(
        "min_d_angle: <6deg {}; <12deg {}; <18deg {}",
        low_counts[0], low_counts[1], low_counts[2]
    );
    debug!(
        "max_d_angle: >174deg {}; >168deg {}; >162deg {}",
        high_counts[2], high_counts[1], high_counts[0]
    );
    debug!("{}/{} vertices unrounded", unrounded, mesh.active_vertex_count());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular_tet() -> [Point3<f64>; 4] {
        let s3 = 3.0_f64.sqrt();
        let s6 = 6.0_f64.sqrt();
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, s3 / 2.0, 0.0),
            Point3::new(0.5, s3 / 6.0, s6 / 3.0),
        ]
    }

    #[test]
    fn amips_is_one_on_regular_tet() {
        let [a, b, c, d] = regular_tet();
        match amips_energy(&a, &b, &c, &d) {
            Energy::Finite(e) => assert!((e - 1.0).abs() < 1e-9, "expected 1.0, got {e}"),
            Energy::Inverted => panic!("regular tet reported inverted"),
        }
    }

    #[test]
    fn amips_is_scale_invariant() {
        let [a, b, c, d] = regular_tet();
        let scale = |p: &Point3<f64>| Point3::new(p.x * 7.0, p.y * 7.0, p.z * 7.0);
        let e1 = amips_energy(&a, &b, &c, &d).capped();
        let e2 = amips_energy(&scale(&a), &scale(&b), &scale(&c), &scale(&d)).capped();
        assert!((e1 - e2).abs() < 1e-9);
    }

    #[test]
    fn amips_flags_inverted_tets() {
        let [a, b, c, d] = regular_tet();
        assert!(amips_energy(&a, &c, &b, &d).is_inverted());
        // Flat tet.
        let flat = Point3::new(0.5, 0.5, 0.0);
        assert!(amips_energy(&a, &b, &c, &flat).is_inverted());
    }

    #[test]
    fn amips_grows_with_distortion() {
        let [a, b, c, d] = regular_tet();
        let squashed = Point3::new(d.x, d.y, d.z * 0.05);
        let good = amips_energy(&a, &b, &c, &d).capped();
        let bad = amips_energy(&a, &b, &c, &squashed).capped();
        assert!(bad > good * 2.0, "expected distortion penalty, got {bad}");
    }

    #[test]
    fn regular_tet_dihedral_angles() {
        let [a, b, c, d] = regular_tet();
        let (min, max) = dihedral_angle_range(&a, &b, &c, &d);
        // All dihedral angles of the regular tet are acos(1/3) = 70.53deg.
        let expected = (1.0_f64 / 3.0).acos();
        assert!((min - expected).abs() < 1e-9);
        assert!((max - expected).abs() < 1e-9);
    }

    #[test]
    fn right_angle_tet_dihedral_range() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);
        let d = Point3::new(0.0, 0.0, 1.0);
        let (min, max) = dihedral_angle_range(&a, &b, &c, &d);
        // Corner tet of the cube: three right dihedrals, min = 54.7deg.
        assert!(min > 0.9 && min < 1.0, "min {min}");
        assert!((max - std::f64::consts::FRAC_PI_2).abs() < 1e-9, "max {max}");
    }

    #[test]
    fn energy_ordering_treats_inverted_as_worst() {
        assert!(Energy::Finite(5.0).is_better_than(Energy::Inverted));
        assert!(!Energy::Inverted.is_better_than(Energy::Finite(1e40)));
        assert!(Energy::Finite(3.0).is_not_worse_than(Energy::Finite(3.0)));
        assert_eq!(
            Energy::Finite(2.0).max(Energy::Inverted),
            Energy::Inverted
        );
    }
}
