//! Core data types shared across the pipeline.

use hashbrown::HashSet;
use nalgebra::{Point3, Vector3};
use num_rational::BigRational;
use num_traits::ToPrimitive;

use crate::quality::TetQuality;

/// Facet indices opposite each tet vertex, oriented outward for a
/// positively oriented tet `[v0, v1, v2, v3]`.
pub const TET_FACETS: [[usize; 3]; 4] = [[1, 2, 3], [0, 3, 2], [0, 1, 3], [0, 2, 1]];

/// Edge index pairs of a tet.
pub const TET_EDGES: [[usize; 2]; 6] = [[0, 1], [0, 2], [0, 3], [1, 2], [1, 3], [2, 3]];

/// A 3D point with exact rational coordinates.
///
/// Used for vertices produced by plane/edge intersections during BSP
/// subdivision, whose coordinates are not representable as doubles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RationalPoint(pub [BigRational; 3]);

impl RationalPoint {
    /// Convert a double point exactly (every finite double is rational).
    pub fn from_f64(p: &Point3<f64>) -> Self {
        Self([
            BigRational::from_float(p.x).expect("finite coordinate"),
            BigRational::from_float(p.y).expect("finite coordinate"),
            BigRational::from_float(p.z).expect("finite coordinate"),
        ])
    }

    /// Round to the nearest representable double point.
    pub fn to_f64(&self) -> Point3<f64> {
        Point3::new(
            self.0[0].to_f64().unwrap_or(0.0),
            self.0[1].to_f64().unwrap_or(0.0),
            self.0[2].to_f64().unwrap_or(0.0),
        )
    }

    /// True if rounding to double and back is lossless.
    pub fn is_representable(&self) -> bool {
        let f = self.to_f64();
        RationalPoint::from_f64(&f) == *self
    }
}

/// An unordered triangle list with vertex positions. No manifold assumption.
#[derive(Debug, Clone, Default)]
pub struct TriangleSoup {
    pub vertices: Vec<Point3<f64>>,
    pub faces: Vec<[u32; 3]>,
}

impl TriangleSoup {
    pub fn new(vertices: Vec<Point3<f64>>, faces: Vec<[u32; 3]>) -> Self {
        Self { vertices, faces }
    }

    /// Build a soup from raw coordinate and index triples.
    pub fn from_raw(vertices: &[[f64; 3]], faces: &[[u32; 3]]) -> Self {
        Self {
            vertices: vertices
                .iter()
                .map(|v| Point3::new(v[0], v[1], v[2]))
                .collect(),
            faces: faces.to_vec(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Axis-aligned bounding box, or None for an empty vertex set.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = *self.vertices.first()?;
        let mut min = first;
        let mut max = first;
        for p in &self.vertices[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }
        Some((min, max))
    }

    /// Length of the bounding-box diagonal.
    pub fn bbox_diag(&self) -> f64 {
        self.bounds()
            .map(|(min, max)| (max - min).norm())
            .unwrap_or(0.0)
    }

    /// Get a triangle by face index.
    pub fn triangle(&self, face: usize) -> Triangle {
        let [a, b, c] = self.faces[face];
        Triangle::new(
            self.vertices[a as usize],
            self.vertices[b as usize],
            self.vertices[c as usize],
        )
    }

    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        (0..self.faces.len()).map(|f| self.triangle(f))
    }
}

/// A triangle with concrete vertex positions, CCW winding.
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub v0: Point3<f64>,
    pub v1: Point3<f64>,
    pub v2: Point3<f64>,
}

impl Triangle {
    #[inline]
    pub fn new(v0: Point3<f64>, v1: Point3<f64>, v2: Point3<f64>) -> Self {
        Self { v0, v1, v2 }
    }

    /// Unnormalized face normal via cross product.
    #[inline]
    pub fn normal_unnormalized(&self) -> Vector3<f64> {
        (self.v1 - self.v0).cross(&(self.v2 - self.v0))
    }

    /// Unit normal, or None for a degenerate triangle.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        let n = self.normal_unnormalized();
        let len_sq = n.norm_squared();
        if len_sq > f64::EPSILON {
            Some(n / len_sq.sqrt())
        } else {
            None
        }
    }

    #[inline]
    pub fn area(&self) -> f64 {
        self.normal_unnormalized().norm() * 0.5
    }

    #[inline]
    pub fn centroid(&self) -> Point3<f64> {
        Point3::new(
            (self.v0.x + self.v1.x + self.v2.x) / 3.0,
            (self.v0.y + self.v1.y + self.v2.y) / 3.0,
            (self.v0.z + self.v1.z + self.v2.z) / 3.0,
        )
    }

    #[inline]
    pub fn max_edge_length(&self) -> f64 {
        (self.v1 - self.v0)
            .norm()
            .max((self.v2 - self.v1).norm())
            .max((self.v0 - self.v2).norm())
    }
}

/// Per-facet label of a tet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacetTag {
    /// Interior facet, not part of any tracked surface.
    #[default]
    NotSurface,
    /// Facet lies on the tracked input surface; carries the simplified
    /// input triangle id it covers.
    Surface(u32),
    /// Facet lies on the ambient bounding box.
    Bbox,
    /// Facet covers an open hole of a non-closed input.
    Boundary,
}

impl FacetTag {
    #[inline]
    pub fn is_surface(&self) -> bool {
        matches!(self, FacetTag::Surface(_))
    }
}

/// A vertex of the volume mesh.
///
/// The rounded position `posf` is always valid for rendering and distance
/// queries. `pos` holds the exact rational coordinates only while they
/// differ from `posf`; `None` means the vertex is rounded and the double
/// IS the exact position.
#[derive(Debug, Clone)]
pub struct TetVertex {
    pub posf: Point3<f64>,
    pub pos: Option<RationalPoint>,
    /// Indices of tets using this vertex.
    pub conn_tets: HashSet<u32>,
    pub on_surface: bool,
    pub on_bbox: bool,
    pub on_boundary: bool,
}

impl TetVertex {
    pub fn new(posf: Point3<f64>) -> Self {
        Self {
            posf,
            pos: None,
            conn_tets: HashSet::new(),
            on_surface: false,
            on_bbox: false,
            on_boundary: false,
        }
    }

    /// Create a vertex from exact coordinates, dropping the rational part
    /// when the double representation is lossless.
    pub fn from_rational(pos: RationalPoint) -> Self {
        let posf = pos.to_f64();
        let pos = if pos.is_representable() { None } else { Some(pos) };
        Self {
            posf,
            pos,
            conn_tets: HashSet::new(),
            on_surface: false,
            on_bbox: false,
            on_boundary: false,
        }
    }

    #[inline]
    pub fn is_rounded(&self) -> bool {
        self.pos.is_none()
    }

    /// Exact position; materializes the rational view of a rounded vertex.
    pub fn exact(&self) -> RationalPoint {
        match &self.pos {
            Some(p) => p.clone(),
            None => RationalPoint::from_f64(&self.posf),
        }
    }
}

/// The volume mesh mutated in place through refinement.
///
/// Removed tets are tombstoned rather than compacted so indices stay stable
/// across local operations; compaction happens once at pipeline exit.
#[derive(Debug, Clone, Default)]
pub struct TetMesh {
    pub vertices: Vec<TetVertex>,
    pub tets: Vec<[u32; 4]>,
    pub removed: Vec<bool>,
    pub qualities: Vec<TetQuality>,
    pub facet_tags: Vec<[FacetTag; 4]>,
}

impl TetMesh {
    /// Indices of live tets.
    pub fn active_tets(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.tets.len()).filter(|&t| !self.removed[t])
    }

    pub fn active_tet_count(&self) -> usize {
        self.removed.iter().filter(|r| !**r).count()
    }

    /// Number of vertices referenced by at least one live tet.
    pub fn active_vertex_count(&self) -> usize {
        self.vertices
            .iter()
            .filter(|v| !v.conn_tets.is_empty())
            .count()
    }

    /// Positions of a tet's four corners.
    pub fn tet_points(&self, t: usize) -> [Point3<f64>; 4] {
        let tet = self.tets[t];
        [
            self.vertices[tet[0] as usize].posf,
            self.vertices[tet[1] as usize].posf,
            self.vertices[tet[2] as usize].posf,
            self.vertices[tet[3] as usize].posf,
        ]
    }

    /// Vertex ids of facet `f` of tet `t`, outward oriented.
    pub fn facet(&self, t: usize, f: usize) -> [u32; 3] {
        let tet = self.tets[t];
        let [a, b, c] = TET_FACETS[f];
        [tet[a], tet[b], tet[c]]
    }

    /// Barycenter of a tet (rounded coordinates).
    pub fn barycenter(&self, t: usize) -> Point3<f64> {
        let ps = self.tet_points(t);
        Point3::new(
            (ps[0].x + ps[1].x + ps[2].x + ps[3].x) / 4.0,
            (ps[0].y + ps[1].y + ps[2].y + ps[3].y) / 4.0,
            (ps[0].z + ps[1].z + ps[2].z + ps[3].z) / 4.0,
        )
    }

    /// Append a tet and its parallel records, wiring vertex back-references.
    pub fn push_tet(&mut self, tet: [u32; 4], tags: [FacetTag; 4]) -> usize {
        let id = self.tets.len();
        self.tets.push(tet);
        self.removed.push(false);
        self.qualities.push(TetQuality::default());
        self.facet_tags.push(tags);
        for v in tet {
            self.vertices[v as usize].conn_tets.insert(id as u32);
        }
        id
    }

    /// Tombstone a tet and unlink it from its vertices.
    pub fn remove_tet(&mut self, t: usize) {
        debug_assert!(!self.removed[t]);
        self.removed[t] = true;
        for v in self.tets[t] {
            self.vertices[v as usize].conn_tets.remove(&(t as u32));
        }
    }
}

/// Pipeline step, reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Preprocess,
    Delaunay,
    FaceMatching,
    Bsp,
    Tetra,
    Optimize,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::Preprocess => "preprocess",
            Step::Delaunay => "delaunay",
            Step::FaceMatching => "face_matching",
            Step::Bsp => "bsp",
            Step::Tetra => "tetra",
            Step::Optimize => "optimize",
        };
        write!(f, "{name}")
    }
}

/// Per-stage statistics snapshot collected while the pipeline runs.
#[derive(Debug, Clone)]
pub struct StageRecord {
    pub step: Step,
    pub n_vertices: usize,
    pub n_tets: usize,
    pub max_energy: Option<f64>,
    pub avg_energy: Option<f64>,
}

/// Final result of `tetrahedralize`.
#[derive(Debug, Clone)]
pub struct TetMeshOutput {
    /// Output vertex positions (rounded doubles).
    pub vertices: Vec<Point3<f64>>,
    /// Tets as zero-based indices into `vertices`.
    pub tets: Vec<[u32; 4]>,
    /// Minimum dihedral angle per tet, in radians.
    pub min_dihedral_angles: Vec<f64>,
    /// True if refinement stopped on the pass budget before reaching the
    /// energy threshold; the mesh is the best one found.
    pub pass_limit_exceeded: bool,
    /// True if the caller cancelled through the progress callback.
    pub cancelled: bool,
    /// Per-stage statistics, in pipeline order.
    pub stage_records: Vec<StageRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_roundtrip_is_lossless_for_doubles() {
        let p = Point3::new(0.1, -3.75, 1e-9);
        let r = RationalPoint::from_f64(&p);
        assert!(r.is_representable());
        assert_eq!(r.to_f64(), p);
    }

    #[test]
    fn rational_midpoint_of_representable_thirds_is_not() {
        // 1/3 is not a double; a vertex there must stay unrounded.
        let third = BigRational::new(1.into(), 3.into());
        let r = RationalPoint([third.clone(), third.clone(), third]);
        assert!(!r.is_representable());
    }

    #[test]
    fn soup_bounds_and_diag() {
        let soup = TriangleSoup::from_raw(
            &[[0.0, 0.0, 0.0], [1.0, 2.0, 2.0]],
            &[[0, 1, 0]],
        );
        let (min, max) = soup.bounds().unwrap();
        assert_eq!(min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(max, Point3::new(1.0, 2.0, 2.0));
        assert!((soup.bbox_diag() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn facet_orientation_is_outward() {
        // Positive unit tet: facet 0 must face away from vertex 0.
        let mut mesh = TetMesh::default();
        for p in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ] {
            mesh.vertices.push(TetVertex::new(p));
        }
        mesh.push_tet([0, 1, 2, 3], [FacetTag::NotSurface; 4]);
        let [a, b, c] = mesh.facet(0, 0);
        let tri = Triangle::new(
            mesh.vertices[a as usize].posf,
            mesh.vertices[b as usize].posf,
            mesh.vertices[c as usize].posf,
        );
        let to_opposite = mesh.vertices[0].posf - tri.centroid();
        assert!(tri.normal().unwrap().dot(&to_opposite) < 0.0);
    }

    #[test]
    fn push_and_remove_maintain_back_references() {
        let mut mesh = TetMesh::default();
        for p in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ] {
            mesh.vertices.push(TetVertex::new(p));
        }
        let t = mesh.push_tet([0, 1, 2, 3], [FacetTag::NotSurface; 4]);
        assert!(mesh.vertices[2].conn_tets.contains(&(t as u32)));
        mesh.remove_tet(t);
        assert!(mesh.vertices[2].conn_tets.is_empty());
        assert_eq!(mesh.active_tet_count(), 0);
    }
}
