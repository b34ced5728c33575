//! Incremental Delaunay tetrahedralization of the simplified vertex set.
//!
//! Bowyer-Watson insertion with exact orientation/insphere predicates. The
//! point set is the simplified soup's vertices plus the corners of an
//! inflated bounding box (so the ambient mesh covers a full box around the
//! input) and, optionally, voxel-stuffed points.

use hashbrown::HashMap;
use nalgebra::Point3;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::{TetError, TetResult};
use crate::filter::winding_number;
use crate::predicates::{insphere, orient3d, point_in_tet, Orientation};
use crate::state::RefineState;
use crate::types::{TriangleSoup, TET_FACETS};

/// Walk steps before falling back to a linear scan during point location.
const MAX_WALK_STEPS: usize = 10_000;

/// A Delaunay tetrahedralization: positively oriented tets over `points`.
/// The leading points come from the simplified soup; the rest are box
/// corners and voxel fill.
#[derive(Debug, Clone)]
pub struct DelaunayMesh {
    pub points: Vec<Point3<f64>>,
    pub tets: Vec<[u32; 4]>,
}

/// Assemble the point set and tetrahedralize it.
pub fn tetrahedralize_soup(
    soup: &TriangleSoup,
    envelope: &Envelope,
    state: &RefineState,
    use_voxel_stuffing: bool,
) -> TetResult<DelaunayMesh> {
    let mut points = soup.vertices.clone();

    let (min, max) = soup.bounds().ok_or(TetError::EmptyInput)?;
    let pad = state.bbox_diag * 0.1;
    for &x in &[min.x - pad, max.x + pad] {
        for &y in &[min.y - pad, max.y + pad] {
            for &z in &[min.z - pad, max.z + pad] {
                points.push(Point3::new(x, y, z));
            }
        }
    }

    if use_voxel_stuffing {
        let n_before = points.len();
        add_voxel_points(&mut points, soup, envelope, state, (min, max));
        debug!("voxel stuffing added {} points", points.len() - n_before);
    }

    let tets = triangulate(&points)?;
    debug!(
        "delaunay: {} points -> {} tets",
        points.len(),
        tets.len()
    );
    Ok(DelaunayMesh { points, tets })
}

/// Seed candidate points at voxel centers spaced by the target edge length.
///
/// A candidate is kept only when it clears the envelope and sits outside
/// the input's winding-number region, so the extra points cannot crowd the
/// tracked surface.
fn add_voxel_points(
    points: &mut Vec<Point3<f64>>,
    soup: &TriangleSoup,
    envelope: &Envelope,
    state: &RefineState,
    bounds: (Point3<f64>, Point3<f64>),
) {
    let step = state.initial_edge_len;
    if step <= 0.0 {
        return;
    }
    let (min, max) = bounds;
    let pad = state.bbox_diag * 0.1;
    let lo = Point3::new(min.x - pad, min.y - pad, min.z - pad);
    let hi = Point3::new(max.x + pad, max.y + pad, max.z + pad);
    let counts = [
        ((hi.x - lo.x) / step).floor() as i64,
        ((hi.y - lo.y) / step).floor() as i64,
        ((hi.z - lo.z) / step).floor() as i64,
    ];
    let mut seen: hashbrown::HashSet<[u64; 3]> = points
        .iter()
        .map(|p| [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()])
        .collect();
    for i in 0..=counts[0] {
        for j in 0..=counts[1] {
            for k in 0..=counts[2] {
                let p = Point3::new(
                    lo.x + i as f64 * step,
                    lo.y + j as f64 * step,
                    lo.z + k as f64 * step,
                );
                if p.x > hi.x || p.y > hi.y || p.z > hi.z {
                    continue;
                }
                if envelope.point_inside(&p, state.eps_2) {
                    continue;
                }
                if winding_number(soup, &p) > 0.5 {
                    continue;
                }
                if seen.insert([p.x.to_bits(), p.y.to_bits(), p.z.to_bits()]) {
                    points.push(p);
                }
            }
        }
    }
}

/// Bowyer-Watson over an explicit point list. Exact duplicates are skipped.
/// Returns positively oriented tets indexing into `points`.
pub fn triangulate(points: &[Point3<f64>]) -> TetResult<Vec<[u32; 4]>> {
    if points.len() < 4 {
        return Err(TetError::InvalidInput {
            details: format!("need at least 4 points, got {}", points.len()),
        });
    }
    let mut tri = Triangulation::new(points)?;
    let mut seen: HashMap<[u64; 3], u32> = HashMap::new();
    for (i, p) in points.iter().enumerate() {
        let key = [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()];
        if seen.insert(key, i as u32).is_some() {
            continue;
        }
        tri.insert(i as u32)?;
    }
    Ok(tri.finish())
}

struct Triangulation<'a> {
    points: &'a [Point3<f64>],
    /// Four synthetic far-away corners enclosing everything.
    super_points: [Point3<f64>; 4],
    tets: Vec<[u32; 4]>,
    alive: Vec<bool>,
    /// Neighbor tet across each facet; `NONE` on the outside.
    neighbors: Vec<[i64; 4]>,
    last_hint: usize,
}

const NONE: i64 = -1;

impl<'a> Triangulation<'a> {
    fn new(points: &'a [Point3<f64>]) -> TetResult<Self> {
        let mut min = points[0];
        let mut max = points[0];
        for p in points {
            min = Point3::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
            max = Point3::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
        }
        let center = Point3::new(
            (min.x + max.x) / 2.0,
            (min.y + max.y) / 2.0,
            (min.z + max.z) / 2.0,
        );
        let scale = (max - min).norm().max(1.0) * 1.0e4;
        // A regular-ish tet far outside every circumsphere of interest.
        let super_points = [
            Point3::new(center.x - scale, center.y - scale, center.z - scale),
            Point3::new(center.x + scale * 3.0, center.y - scale, center.z - scale),
            Point3::new(center.x - scale, center.y + scale * 3.0, center.z - scale),
            Point3::new(center.x - scale, center.y - scale, center.z + scale * 3.0),
        ];
        let n = points.len() as u32;
        let super_tet = [n, n + 1, n + 2, n + 3];
        let mut tri = Self {
            points,
            super_points,
            tets: vec![super_tet],
            alive: vec![true],
            neighbors: vec![[NONE; 4]],
            last_hint: 0,
        };
        if orient3d(
            &tri.point(n),
            &tri.point(n + 1),
            &tri.point(n + 2),
            &tri.point(n + 3),
        ) != Orientation::Positive
        {
            return Err(TetError::InvalidInput {
                details: "degenerate enclosing tetrahedron".into(),
            });
        }
        Ok(tri)
    }

    #[inline]
    fn point(&self, i: u32) -> Point3<f64> {
        let n = self.points.len() as u32;
        if i < n {
            self.points[i as usize]
        } else {
            self.super_points[(i - n) as usize]
        }
    }

    fn tet_points(&self, t: usize) -> [Point3<f64>; 4] {
        self.tets[t].map(|v| self.point(v))
    }

    /// Walk toward the tet whose closed hull contains `p`.
    fn locate(&self, p: &Point3<f64>) -> TetResult<usize> {
        let mut t = if self.alive[self.last_hint] {
            self.last_hint
        } else {
            self.alive.iter().position(|&a| a).expect("live tet")
        };
        let mut spin = 0usize;
        'walk: for _ in 0..MAX_WALK_STEPS {
            let tet = self.tets[t];
            // Rotate the facet order each step so exact ties cannot cycle.
            spin = spin.wrapping_add(1);
            for k0 in 0..4 {
                let k = (k0 + spin) % 4;
                let [a, b, c] = TET_FACETS[k].map(|i| self.point(tet[i]));
                if orient3d(&a, &b, &c, p) == Orientation::Negative {
                    match self.neighbors[t][k] {
                        NONE => break 'walk,
                        next => {
                            t = next as usize;
                            continue 'walk;
                        }
                    }
                }
            }
            return Ok(t);
        }
        // Exhaustive fallback.
        for t in 0..self.tets.len() {
            if !self.alive[t] {
                continue;
            }
            let [a, b, c, d] = self.tet_points(t);
            if point_in_tet(p, &a, &b, &c, &d) {
                return Ok(t);
            }
        }
        Err(TetError::InvalidInput {
            details: "point location failed; input coordinates are inconsistent".into(),
        })
    }

    fn insert(&mut self, v: u32) -> TetResult<()> {
        let p = self.point(v);
        let seed = self.locate(&p)?;

        // Grow the cavity of tets whose circumsphere strictly contains p.
        let mut cavity = vec![seed];
        let mut in_cavity = HashMap::new();
        in_cavity.insert(seed, true);
        let mut stack = vec![seed];
        while let Some(t) = stack.pop() {
            for k in 0..4 {
                let n = self.neighbors[t][k];
                if n == NONE {
                    continue;
                }
                let n = n as usize;
                if in_cavity.contains_key(&n) {
                    continue;
                }
                let [a, b, c, d] = self.tet_points(n);
                let inside = insphere(&a, &b, &c, &d, &p) == Orientation::Positive;
                in_cavity.insert(n, inside);
                if inside {
                    cavity.push(n);
                    stack.push(n);
                }
            }
        }

        // Collect boundary facets (facet of a cavity tet whose neighbor is
        // outside), then retriangulate the cavity as a fan around p.
        let mut new_tets: Vec<usize> = Vec::new();
        let mut edge_links: HashMap<(u32, u32), (usize, usize)> = HashMap::new();
        for &t in &cavity {
            for k in 0..4 {
                let n = self.neighbors[t][k];
                let outside = match n {
                    NONE => true,
                    n => !in_cavity.get(&(n as usize)).copied().unwrap_or(false),
                };
                if !outside {
                    continue;
                }
                let [fa, fb, fc] = TET_FACETS[k].map(|i| self.tets[t][i]);
                // Outward facet (fa, fb, fc) faces away from the cavity, so
                // (fa, fc, fb, v) is positively oriented.
                let id = self.tets.len();
                self.tets.push([fa, fc, fb, v]);
                self.alive.push(true);
                self.neighbors.push([NONE; 4]);
                new_tets.push(id);

                // Link across the old boundary facet (opposite v, index 3).
                self.neighbors[id][3] = n;
                if n != NONE {
                    let n = n as usize;
                    for kk in 0..4 {
                        let mut tri = TET_FACETS[kk].map(|i| self.tets[n][i]);
                        tri.sort_unstable();
                        let mut this = [fa, fb, fc];
                        this.sort_unstable();
                        if tri == this {
                            self.neighbors[n][kk] = id as i64;
                            break;
                        }
                    }
                }

                // Side facets pair up along shared cavity-boundary edges.
                // Tet layout [fa, fc, fb, v]: facet 0 holds edge (fc, fb),
                // facet 1 edge (fa, fb), facet 2 edge (fa, fc).
                for (facet, (ea, eb)) in [(0, (fc, fb)), (1, (fa, fb)), (2, (fa, fc))] {
                    let key = if ea < eb { (ea, eb) } else { (eb, ea) };
                    match edge_links.remove(&key) {
                        None => {
                            edge_links.insert(key, (id, facet));
                        }
                        Some((other, other_facet)) => {
                            self.neighbors[id][facet] = other as i64;
                            self.neighbors[other][other_facet] = id as i64;
                        }
                    }
                }
            }
        }
        debug_assert!(edge_links.is_empty(), "unpaired cavity boundary edge");

        for &t in &cavity {
            self.alive[t] = false;
        }
        self.last_hint = *new_tets.last().expect("cavity produced tets");
        Ok(())
    }

    /// Drop super-tet incidences and return the surviving tets.
    fn finish(self) -> Vec<[u32; 4]> {
        let n = self.points.len() as u32;
        self.tets
            .into_iter()
            .zip(self.alive)
            .filter(|(tet, alive)| *alive && tet.iter().all(|&v| v < n))
            .map(|(tet, _)| tet)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicates::orient3d;

    fn assert_valid_delaunay(points: &[Point3<f64>], tets: &[[u32; 4]]) {
        for tet in tets {
            let [a, b, c, d] = tet.map(|v| points[v as usize]);
            assert_eq!(
                orient3d(&a, &b, &c, &d),
                Orientation::Positive,
                "tet {tet:?} not positively oriented"
            );
            // Empty-sphere property against every other point.
            for (i, p) in points.iter().enumerate() {
                if tet.contains(&(i as u32)) {
                    continue;
                }
                assert_ne!(
                    insphere(&a, &b, &c, &d, p),
                    Orientation::Positive,
                    "point {i} violates the empty sphere of {tet:?}"
                );
            }
        }
    }

    #[test]
    fn five_points_two_tets() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
        ];
        let tets = triangulate(&points).unwrap();
        assert!(!tets.is_empty());
        assert_valid_delaunay(&points, &tets);
    }

    #[test]
    fn cube_corners_fill_the_cube() {
        let mut points = Vec::new();
        for z in [0.0, 1.0] {
            for y in [0.0, 1.0] {
                for x in [0.0, 1.0] {
                    points.push(Point3::new(x, y, z));
                }
            }
        }
        let tets = triangulate(&points).unwrap();
        assert_valid_delaunay(&points, &tets);
        // The tets must tile the cube: volumes sum to 1.
        let volume: f64 = tets
            .iter()
            .map(|tet| {
                let [a, b, c, d] = tet.map(|v| points[v as usize]);
                (b - a).cross(&(c - a)).dot(&(d - a)) / 6.0
            })
            .sum();
        assert!((volume - 1.0).abs() < 1e-9, "volume {volume}");
    }

    #[test]
    fn duplicate_points_are_skipped() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.0, 0.0, 0.0), // duplicate
        ];
        let tets = triangulate(&points).unwrap();
        assert_eq!(tets.len(), 1);
        assert!(tets[0].iter().all(|&v| v < 4));
    }

    #[test]
    fn interior_point_is_connected() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
            Point3::new(0.0, 4.0, 0.0),
            Point3::new(0.0, 0.0, 4.0),
            Point3::new(0.5, 0.5, 0.5),
        ];
        let tets = triangulate(&points).unwrap();
        assert_valid_delaunay(&points, &tets);
        assert!(
            tets.iter().any(|t| t.contains(&4)),
            "interior point must appear in the triangulation"
        );
        assert_eq!(tets.len(), 4);
    }

    #[test]
    fn random_cloud_satisfies_empty_sphere() {
        // Deterministic pseudo-random points.
        let mut seed = 0x2545f491_u64;
        let mut rand = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % 10_000) as f64 / 10_000.0
        };
        let points: Vec<Point3<f64>> = (0..40)
            .map(|_| Point3::new(rand(), rand(), rand()))
            .collect();
        let tets = triangulate(&points).unwrap();
        assert!(!tets.is_empty());
        assert_valid_delaunay(&points, &tets);
    }
}
