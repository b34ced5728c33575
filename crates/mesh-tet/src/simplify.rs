//! Preprocessing: input validation, soup cleanup, and envelope-constrained
//! surface simplification.
//!
//! Simplification shrinks the vertex set handed to the Delaunay stage by
//! collapsing and swapping edges while every touched triangle stays inside
//! the envelope. The input soup itself is never modified; the envelope is
//! built over the cleaned input and stays valid for the whole pipeline.

use hashbrown::{HashMap, HashSet};
use nalgebra::Point3;
use tracing::{debug, info};

use crate::envelope::Envelope;
use crate::error::{TetError, TetResult};
use crate::state::RefineState;
use crate::types::{Triangle, TriangleSoup};

/// Result of preprocessing.
#[derive(Debug)]
pub struct PreprocessResult {
    /// Simplified soup; its face indices are the ids carried by surface tags
    /// downstream.
    pub soup: TriangleSoup,
    /// Whether the cleaned input surface is closed (every edge shared by
    /// exactly two triangles).
    pub is_mesh_closed: bool,
}

/// Reject inputs the pipeline cannot work with.
pub fn validate_input(soup: &TriangleSoup) -> TetResult<()> {
    if soup.faces.is_empty() {
        return Err(TetError::InvalidInput {
            details: "face list is empty".into(),
        });
    }
    for (i, p) in soup.vertices.iter().enumerate() {
        if !p.x.is_finite() || !p.y.is_finite() || !p.z.is_finite() {
            return Err(TetError::InvalidInput {
                details: format!("vertex {i} has a non-finite coordinate"),
            });
        }
    }
    let n = soup.vertices.len() as u32;
    for (f, face) in soup.faces.iter().enumerate() {
        for &v in face {
            if v >= n {
                return Err(TetError::InvalidInput {
                    details: format!("face {f} references vertex {v}, but only {n} exist"),
                });
            }
        }
    }
    match soup.bounds() {
        Some((min, max)) if (max - min).norm_squared() > 0.0 => Ok(()),
        _ => Err(TetError::InvalidInput {
            details: "bounding box has no extent".into(),
        }),
    }
}

/// Weld exactly coincident vertices, drop zero-area and duplicate
/// triangles. Exact comparisons only; tolerance-based merging is the
/// simplification loop's job.
pub fn clean_soup(soup: &TriangleSoup) -> TriangleSoup {
    let mut remap = vec![0u32; soup.vertices.len()];
    let mut seen: HashMap<[u64; 3], u32> = HashMap::new();
    let mut vertices: Vec<Point3<f64>> = Vec::with_capacity(soup.vertices.len());
    for (i, p) in soup.vertices.iter().enumerate() {
        let key = [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()];
        let id = *seen.entry(key).or_insert_with(|| {
            vertices.push(*p);
            (vertices.len() - 1) as u32
        });
        remap[i] = id;
    }

    let mut face_seen: HashSet<[u32; 3]> = HashSet::new();
    let mut faces = Vec::with_capacity(soup.faces.len());
    for face in &soup.faces {
        let mapped = face.map(|v| remap[v as usize]);
        if mapped[0] == mapped[1] || mapped[1] == mapped[2] || mapped[2] == mapped[0] {
            continue;
        }
        let tri = Triangle::new(
            vertices[mapped[0] as usize],
            vertices[mapped[1] as usize],
            vertices[mapped[2] as usize],
        );
        if tri.normal_unnormalized().norm_squared() == 0.0 {
            continue;
        }
        let mut key = mapped;
        key.sort_unstable();
        if face_seen.insert(key) {
            faces.push(mapped);
        }
    }
    TriangleSoup { vertices, faces }
}

/// True if every edge of the soup is shared by exactly two triangles.
pub fn is_closed(soup: &TriangleSoup) -> bool {
    let mut edge_count: HashMap<(u32, u32), u32> = HashMap::new();
    for face in &soup.faces {
        for k in 0..3 {
            let a = face[k];
            let b = face[(k + 1) % 3];
            let key = if a < b { (a, b) } else { (b, a) };
            *edge_count.entry(key).or_insert(0) += 1;
        }
    }
    !edge_count.is_empty() && edge_count.values().all(|&c| c == 2)
}

/// Simplify the cleaned soup under the envelope.
///
/// Alternates edge-collapse and edge-swap sweeps until a full sweep changes
/// nothing. Collapses move a vertex onto its edge partner, so every
/// surviving vertex is an input vertex and trivially inside the envelope.
pub fn simplify(
    soup: &TriangleSoup,
    envelope: &Envelope,
    state: &RefineState,
) -> TetResult<PreprocessResult> {
    let is_mesh_closed = is_closed(soup);
    let mut mesh = WorkingMesh::new(soup);
    let input_faces = mesh.live_face_count();

    // Bounded for safety on adversarial inputs; real meshes converge in a
    // handful of sweeps.
    for sweep in 0..20 {
        let collapsed = mesh.collapse_sweep(envelope, state);
        let swapped = mesh.swap_sweep(envelope, state);
        debug!("simplify sweep {sweep}: {collapsed} collapses, {swapped} swaps");
        if collapsed + swapped == 0 {
            break;
        }
    }

    let simplified = mesh.compact();
    if simplified.is_empty() {
        return Err(TetError::EmptyInput);
    }
    info!(
        "simplified surface: {} -> {} triangles, {} vertices",
        input_faces,
        simplified.faces.len(),
        simplified.vertices.len()
    );
    Ok(PreprocessResult {
        soup: simplified,
        is_mesh_closed,
    })
}

/// Mutable soup with tombstoned faces and vertex-face adjacency.
struct WorkingMesh {
    vertices: Vec<Point3<f64>>,
    faces: Vec<[u32; 3]>,
    f_removed: Vec<bool>,
    conn: Vec<HashSet<u32>>,
}

impl WorkingMesh {
    fn new(soup: &TriangleSoup) -> Self {
        let mut conn = vec![HashSet::new(); soup.vertices.len()];
        for (f, face) in soup.faces.iter().enumerate() {
            for &v in face {
                conn[v as usize].insert(f as u32);
            }
        }
        Self {
            vertices: soup.vertices.clone(),
            faces: soup.faces.clone(),
            f_removed: vec![false; soup.faces.len()],
            conn,
        }
    }

    fn live_face_count(&self) -> usize {
        self.f_removed.iter().filter(|r| !**r).count()
    }

    fn triangle(&self, f: u32) -> Triangle {
        let [a, b, c] = self.faces[f as usize];
        Triangle::new(
            self.vertices[a as usize],
            self.vertices[b as usize],
            self.vertices[c as usize],
        )
    }

    fn live_edges(&self) -> Vec<((u32, u32), f64)> {
        let mut edges: HashMap<(u32, u32), f64> = HashMap::new();
        for (f, face) in self.faces.iter().enumerate() {
            if self.f_removed[f] {
                continue;
            }
            for k in 0..3 {
                let a = face[k];
                let b = face[(k + 1) % 3];
                let key = if a < b { (a, b) } else { (b, a) };
                edges.entry(key).or_insert_with(|| {
                    (self.vertices[a as usize] - self.vertices[b as usize]).norm()
                });
            }
        }
        let mut list: Vec<_> = edges.into_iter().collect();
        list.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        list
    }

    /// Try to collapse every edge, shortest first. Returns the number of
    /// collapses applied.
    fn collapse_sweep(&mut self, envelope: &Envelope, state: &RefineState) -> usize {
        let mut count = 0;
        for ((a, b), _) in self.live_edges() {
            if self.conn[a as usize].is_empty() || self.conn[b as usize].is_empty() {
                continue;
            }
            if self.try_collapse(a, b, envelope, state) || self.try_collapse(b, a, envelope, state)
            {
                count += 1;
            }
        }
        count
    }

    /// Collapse `u` onto `v` if the new star is valid.
    fn try_collapse(&mut self, u: u32, v: u32, envelope: &Envelope, state: &RefineState) -> bool {
        if u == v {
            return false;
        }
        let star: Vec<u32> = self.conn[u as usize].iter().copied().collect();
        if star.is_empty() {
            return false;
        }
        for &f in &star {
            let face = self.faces[f as usize];
            if face.contains(&v) {
                // Vanishes with the edge.
                continue;
            }
            let old = self.triangle(f);
            let mapped = face.map(|w| if w == u { v } else { w });
            let new = Triangle::new(
                self.vertices[mapped[0] as usize],
                self.vertices[mapped[1] as usize],
                self.vertices[mapped[2] as usize],
            );
            // Zero area, inverted orientation, or envelope escape all veto.
            let n_old = old.normal_unnormalized();
            let n_new = new.normal_unnormalized();
            if n_new.norm_squared() == 0.0 || n_old.dot(&n_new) <= 0.0 {
                return false;
            }
            if !envelope.triangle_inside(&new, state.eps_2, state.sampling_dist) {
                return false;
            }
        }

        // Apply.
        for f in star {
            let face = self.faces[f as usize];
            if face.contains(&v) {
                self.remove_face(f);
            } else {
                for w in self.faces[f as usize].iter_mut() {
                    if *w == u {
                        *w = v;
                    }
                }
                self.conn[v as usize].insert(f);
            }
        }
        self.conn[u as usize].clear();
        true
    }

    /// Flip manifold interior edges when the flip strictly improves the
    /// worst triangle of the pair. Returns the number of flips applied.
    fn swap_sweep(&mut self, envelope: &Envelope, state: &RefineState) -> usize {
        let mut count = 0;
        let edges: Vec<(u32, u32)> = self.live_edges().into_iter().map(|(e, _)| e).collect();
        for (a, b) in edges {
            let shared: Vec<u32> = self.conn[a as usize]
                .intersection(&self.conn[b as usize])
                .copied()
                .collect();
            if shared.len() != 2 {
                continue;
            }
            let (f0, f1) = (shared[0], shared[1]);
            if self.f_removed[f0 as usize] || self.f_removed[f1 as usize] {
                continue;
            }
            let Some(w0) = opposite_vertex(&self.faces[f0 as usize], a, b) else {
                continue;
            };
            let Some(w1) = opposite_vertex(&self.faces[f1 as usize], a, b) else {
                continue;
            };
            if w0 == w1 {
                continue;
            }
            // Refuse to create an edge that already exists elsewhere.
            if self.conn[w0 as usize]
                .intersection(&self.conn[w1 as usize])
                .next()
                .is_some()
            {
                continue;
            }
            let old0 = self.triangle(f0);
            let old1 = self.triangle(f1);
            let g0 = Triangle::new(
                self.vertices[a as usize],
                self.vertices[w1 as usize],
                self.vertices[w0 as usize],
            );
            let g1 = Triangle::new(
                self.vertices[b as usize],
                self.vertices[w0 as usize],
                self.vertices[w1 as usize],
            );
            if g0.area() == 0.0 || g1.area() == 0.0 {
                continue;
            }
            if g0.area().min(g1.area()) <= old0.area().min(old1.area()) {
                continue;
            }
            let avg_old = old0.normal_unnormalized() + old1.normal_unnormalized();
            if g0.normal_unnormalized().dot(&avg_old) <= 0.0
                || g1.normal_unnormalized().dot(&avg_old) <= 0.0
            {
                continue;
            }
            if !envelope.triangle_inside(&g0, state.eps_2, state.sampling_dist)
                || !envelope.triangle_inside(&g1, state.eps_2, state.sampling_dist)
            {
                continue;
            }
            self.replace_face(f0, [a, w1, w0]);
            self.replace_face(f1, [b, w0, w1]);
            count += 1;
        }
        count
    }

    fn remove_face(&mut self, f: u32) {
        if self.f_removed[f as usize] {
            return;
        }
        self.f_removed[f as usize] = true;
        for v in self.faces[f as usize] {
            self.conn[v as usize].remove(&f);
        }
    }

    fn replace_face(&mut self, f: u32, new: [u32; 3]) {
        for v in self.faces[f as usize] {
            self.conn[v as usize].remove(&f);
        }
        self.faces[f as usize] = new;
        for v in new {
            self.conn[v as usize].insert(f);
        }
    }

    /// Drop tombstones and unreferenced vertices.
    fn compact(&self) -> TriangleSoup {
        let mut remap: HashMap<u32, u32> = HashMap::new();
        let mut vertices = Vec::new();
        let mut faces = Vec::new();
        for (f, face) in self.faces.iter().enumerate() {
            if self.f_removed[f] {
                continue;
            }
            let mapped = face.map(|v| {
                *remap.entry(v).or_insert_with(|| {
                    vertices.push(self.vertices[v as usize]);
                    (vertices.len() - 1) as u32
                })
            });
            faces.push(mapped);
        }
        TriangleSoup { vertices, faces }
    }
}

fn opposite_vertex(face: &[u32; 3], a: u32, b: u32) -> Option<u32> {
    face.iter().copied().find(|&w| w != a && w != b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Config;

    fn make_cube() -> TriangleSoup {
        TriangleSoup::from_raw(
            &[
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [1.0, 0.0, 1.0],
                [1.0, 1.0, 1.0],
                [0.0, 1.0, 1.0],
            ],
            &[
                [0, 2, 1],
                [0, 3, 2],
                [4, 5, 6],
                [4, 6, 7],
                [0, 1, 5],
                [0, 5, 4],
                [3, 7, 6],
                [3, 6, 2],
                [0, 4, 7],
                [0, 7, 3],
                [1, 2, 6],
                [1, 6, 5],
            ],
        )
    }

    #[test]
    fn validate_rejects_bad_inputs() {
        let empty = TriangleSoup::from_raw(&[[0.0; 3]], &[]);
        assert!(matches!(
            validate_input(&empty),
            Err(TetError::InvalidInput { .. })
        ));

        let nan = TriangleSoup::from_raw(&[[f64::NAN, 0.0, 0.0]], &[[0, 0, 0]]);
        assert!(validate_input(&nan).is_err());

        let out_of_range = TriangleSoup::from_raw(&[[0.0; 3]], &[[0, 1, 2]]);
        assert!(validate_input(&out_of_range).is_err());

        let flat = TriangleSoup::from_raw(&[[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]], &[[0, 1, 0]]);
        assert!(validate_input(&flat).is_err());

        assert!(validate_input(&make_cube()).is_ok());
    }

    #[test]
    fn clean_welds_and_deduplicates() {
        let soup = TriangleSoup::from_raw(
            &[
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0], // duplicate of vertex 0
            ],
            &[
                [0, 1, 2],
                [3, 1, 2], // same triangle through the duplicate vertex
                [0, 1, 1], // degenerate
            ],
        );
        let cleaned = clean_soup(&soup);
        assert_eq!(cleaned.faces.len(), 1);
        assert_eq!(cleaned.vertices.len(), 3);
    }

    #[test]
    fn closedness_detection() {
        assert!(is_closed(&make_cube()));
        let mut open = make_cube();
        open.faces.pop();
        assert!(!is_closed(&open));
    }

    #[test]
    fn simplify_keeps_cube_within_envelope() {
        let soup = clean_soup(&make_cube());
        let envelope = Envelope::build(&soup);
        let state = RefineState::new(&Config::default(), soup.bbox_diag(), true);
        let result = simplify(&soup, &envelope, &state).unwrap();
        assert!(!result.soup.is_empty());
        assert!(result.is_mesh_closed);
        // A tight envelope cannot merge cube corners away.
        assert_eq!(result.soup.vertices.len(), 8);
        for tri in result.soup.triangles() {
            assert!(envelope.triangle_inside(&tri, state.eps_2, state.sampling_dist));
        }
    }

    #[test]
    fn simplify_contracts_dense_coplanar_patch() {
        // A 4x4 grid on a flat square: interior vertices are redundant at
        // any positive tolerance.
        let n = 4usize;
        let mut vertices = Vec::new();
        for j in 0..=n {
            for i in 0..=n {
                vertices.push([i as f64 / n as f64, j as f64 / n as f64, 0.0]);
            }
        }
        let idx = |i: usize, j: usize| (j * (n + 1) + i) as u32;
        let mut faces = Vec::new();
        for j in 0..n {
            for i in 0..n {
                faces.push([idx(i, j), idx(i + 1, j), idx(i + 1, j + 1)]);
                faces.push([idx(i, j), idx(i + 1, j + 1), idx(i, j + 1)]);
            }
        }
        let soup = TriangleSoup::from_raw(&vertices, &faces);
        let envelope = Envelope::build(&soup);
        let state = RefineState::new(&Config::default(), soup.bbox_diag(), false);
        let result = simplify(&soup, &envelope, &state).unwrap();
        assert!(
            result.soup.faces.len() < faces.len(),
            "expected contraction, got {} of {}",
            result.soup.faces.len(),
            faces.len()
        );
    }
}
