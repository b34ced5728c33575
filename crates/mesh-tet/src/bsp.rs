//! BSP cell complex: conforming the Delaunay mesh to the input triangles.
//!
//! The Delaunay tets become the initial convex cells. Faces already lying
//! on an input triangle are matched directly; every remaining triangle is a
//! cutting constraint, and cells are split by the cutters' planes (with
//! exact rational arithmetic) until every input triangle lies on a union of
//! cell faces.

use hashbrown::{HashMap, HashSet};
use nalgebra::Point3;
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use tracing::debug;

use crate::delaunay::DelaunayMesh;
use crate::envelope::Envelope;
use crate::predicates::{
    orient3d_rational, plane_segment_intersection, segment_intersects_triangle, Orientation,
};
use crate::types::{RationalPoint, Triangle, TriangleSoup, TET_FACETS};

/// Vertex of the cell complex: exact position plus its rounded view.
#[derive(Debug, Clone)]
pub struct BspVertex {
    pub pos: RationalPoint,
    pub posf: Point3<f64>,
}

impl BspVertex {
    fn new(pos: RationalPoint) -> Self {
        let posf = pos.to_f64();
        Self { pos, posf }
    }
}

/// Edge of the complex with its incident faces. Rebuilt after subdivision.
#[derive(Debug, Clone, Default)]
pub struct BspEdge {
    pub vertices: [u32; 2],
    pub conn_faces: HashSet<u32>,
}

/// Planar polygonal face, stored as an ordered vertex loop.
#[derive(Debug, Clone)]
pub struct BspFace {
    pub vertices: Vec<u32>,
    /// The one or two cells this face bounds.
    pub conn_nodes: Vec<u32>,
    /// Input (simplified) triangle this face lies on and is covered by.
    pub matched: Option<u32>,
    pub removed: bool,
}

/// Convex cell.
#[derive(Debug, Clone, Default)]
pub struct BspNode {
    pub faces: Vec<u32>,
    /// Input triangles that still cut through this cell.
    pub cutters: Vec<u32>,
}

/// The whole complex.
#[derive(Debug)]
pub struct BspComplex {
    pub vertices: Vec<BspVertex>,
    pub edges: Vec<BspEdge>,
    pub faces: Vec<BspFace>,
    pub nodes: Vec<BspNode>,
    /// Exact coordinates of the simplified input triangles.
    tri_exact: Vec<[RationalPoint; 3]>,
    /// Triangles sharing a supporting plane share a class id, so coplanar
    /// cutters reuse each other's cut vertices.
    plane_class: Vec<u32>,
}

impl BspComplex {
    /// Wrap a Delaunay mesh as the initial complex: one node per tet, one
    /// face per tet facet.
    pub fn from_delaunay(dt: &DelaunayMesh, soup: &TriangleSoup) -> Self {
        let vertices: Vec<BspVertex> = dt
            .points
            .iter()
            .map(|p| BspVertex::new(RationalPoint::from_f64(p)))
            .collect();

        let mut faces: Vec<BspFace> = Vec::new();
        let mut nodes: Vec<BspNode> = Vec::with_capacity(dt.tets.len());
        let mut facet_ids: HashMap<[u32; 3], u32> = HashMap::new();
        for (t, tet) in dt.tets.iter().enumerate() {
            let mut node = BspNode::default();
            for facet in TET_FACETS {
                let tri = facet.map(|i| tet[i]);
                let mut key = tri;
                key.sort_unstable();
                let fid = *facet_ids.entry(key).or_insert_with(|| {
                    faces.push(BspFace {
                        vertices: tri.to_vec(),
                        conn_nodes: Vec::new(),
                        matched: None,
                        removed: false,
                    });
                    (faces.len() - 1) as u32
                });
                faces[fid as usize].conn_nodes.push(t as u32);
                node.faces.push(fid);
            }
            nodes.push(node);
        }

        let tri_exact: Vec<[RationalPoint; 3]> = soup
            .faces
            .iter()
            .map(|f| f.map(|v| RationalPoint::from_f64(&soup.vertices[v as usize])))
            .collect();
        let plane_class = assign_plane_classes(&tri_exact);

        Self {
            vertices,
            edges: Vec::new(),
            faces,
            nodes,
            tri_exact,
            plane_class,
        }
    }

    /// Match Delaunay faces that already lie on input triangles and record
    /// the remaining triangles as cutting constraints per cell.
    ///
    /// `eps_2` is the squared envelope tolerance used for union coverage
    /// of coplanar triangle patches.
    pub fn conform(&mut self, soup: &TriangleSoup, envelope: &Envelope, eps_2: f64) {
        // Initial face matching.
        let n_faces = self.faces.len();
        for f in 0..n_faces {
            if self.faces[f].matched.is_some() {
                continue;
            }
            let face_bbox = self.face_bbox(f as u32);
            for t in 0..soup.faces.len() {
                let tri = soup.triangle(t);
                if !bbox_overlap(&face_bbox, &triangle_bbox(&tri)) {
                    continue;
                }
                if self.face_covered_by(f as u32, t as u32, envelope, eps_2) {
                    self.faces[f].matched = Some(t as u32);
                    break;
                }
            }
        }

        // Cutter assignment over the initial tets.
        let mut n_cutters = 0usize;
        for n in 0..self.nodes.len() {
            let corners = self.node_corner_points(n as u32);
            let node_bbox = points_bbox(&corners);
            for t in 0..soup.faces.len() {
                let tri = soup.triangle(t);
                if !bbox_overlap(&node_bbox, &triangle_bbox(&tri)) {
                    continue;
                }
                if self.node_matches_triangle(n as u32, t as u32) {
                    continue;
                }
                if corners.len() == 4 && !triangle_intersects_tet(&tri, &corners) {
                    continue;
                }
                self.nodes[n].cutters.push(t as u32);
                n_cutters += 1;
            }
        }
        debug!(
            "conform: {} matched faces, {} cutter assignments",
            self.faces.iter().filter(|f| f.matched.is_some()).count(),
            n_cutters
        );
    }

    /// Split cells until no cutter crosses a cell interior.
    pub fn subdivide(&mut self, envelope: &Envelope, eps_2: f64) {
        let mut worklist: Vec<u32> = (0..self.nodes.len() as u32)
            .filter(|&n| !self.nodes[n as usize].cutters.is_empty())
            .collect();
        // Cut vertices keyed by (cutter, edge): cells sharing an edge must
        // reuse the same intersection vertex, never duplicate it.
        let mut cut_cache: HashMap<(u32, u32, u32), u32> = HashMap::new();

        while let Some(n) = worklist.pop() {
            let Some(t) = self.nodes[n as usize].cutters.pop() else {
                continue;
            };
            let plane = self.tri_exact[t as usize].clone();
            let signs = self.classify_node_vertices(n, &plane);
            let has_pos = signs.values().any(|&s| s == Orientation::Positive);
            let has_neg = signs.values().any(|&s| s == Orientation::Negative);
            if !(has_pos && has_neg) {
                // The plane supports the cell: the triangle can only lie on
                // existing faces. Match any coplanar covered ones.
                self.match_on_plane_faces(n, t, &signs, envelope, eps_2);
            } else {
                let (below, above) =
                    self.split_node(n, t, &plane, &signs, &mut cut_cache, envelope, eps_2);
                if !self.nodes[below as usize].cutters.is_empty() {
                    worklist.push(below);
                }
                if !self.nodes[above as usize].cutters.is_empty() {
                    worklist.push(above);
                }
                continue;
            }
            if !self.nodes[n as usize].cutters.is_empty() {
                worklist.push(n);
            }
        }
        self.rebuild_edges();
        debug!(
            "bsp: {} vertices, {} edges, {} faces, {} nodes",
            self.vertices.len(),
            self.edges.len(),
            self.faces.iter().filter(|f| !f.removed).count(),
            self.nodes.len()
        );
    }

    /// Ids of all vertices used by a node's faces.
    fn node_vertices(&self, n: u32) -> HashSet<u32> {
        let mut out = HashSet::new();
        for &f in &self.nodes[n as usize].faces {
            out.extend(self.faces[f as usize].vertices.iter().copied());
        }
        out
    }

    fn node_corner_points(&self, n: u32) -> Vec<Point3<f64>> {
        self.node_vertices(n)
            .into_iter()
            .map(|v| self.vertices[v as usize].posf)
            .collect()
    }

    fn face_bbox(&self, f: u32) -> (Point3<f64>, Point3<f64>) {
        points_bbox(
            &self.faces[f as usize]
                .vertices
                .iter()
                .map(|&v| self.vertices[v as usize].posf)
                .collect::<Vec<_>>(),
        )
    }

    /// True if some matched face of the node lies on triangle `t`'s plane.
    fn node_matches_triangle(&self, n: u32, t: u32) -> bool {
        let plane = &self.tri_exact[t as usize];
        self.nodes[n as usize].faces.iter().any(|&f| {
            self.faces[f as usize].matched.is_some()
                && self.faces[f as usize].vertices.iter().all(|&v| {
                    orient3d_rational(
                        &plane[0],
                        &plane[1],
                        &plane[2],
                        &self.vertices[v as usize].pos,
                    ) == Orientation::Zero
                })
        })
    }

    /// The face lies on triangle `t`'s plane and is covered by the input
    /// surface: exactly inside `t` itself, or (for faces spanning a
    /// coplanar patch of several triangles) within the envelope.
    fn face_covered_by(&self, f: u32, t: u32, envelope: &Envelope, eps_2: f64) -> bool {
        let [a, b, c] = &self.tri_exact[t as usize];
        let on_plane = self.faces[f as usize].vertices.iter().all(|&v| {
            orient3d_rational(a, b, c, &self.vertices[v as usize].pos) == Orientation::Zero
        });
        if !on_plane {
            return false;
        }
        let exact_cover = self.faces[f as usize].vertices.iter().all(|&v| {
            point_in_triangle_rational(&self.vertices[v as usize].pos, a, b, c)
        });
        if exact_cover {
            return true;
        }
        self.face_within_envelope(f, envelope, eps_2)
    }

    /// Vertices and centroid of the face within the envelope. For a face
    /// already known to lie on an input plane this is a union-coverage
    /// test across the coplanar triangles.
    fn face_within_envelope(&self, f: u32, envelope: &Envelope, eps_2: f64) -> bool {
        let verts = &self.faces[f as usize].vertices;
        let mut centroid = nalgebra::Vector3::zeros();
        for &v in verts.iter() {
            let p = self.vertices[v as usize].posf;
            if !envelope.point_inside(&p, eps_2) {
                return false;
            }
            centroid += p.coords;
        }
        let centroid = Point3::from(centroid / verts.len() as f64);
        envelope.point_inside(&centroid, eps_2)
    }

    fn classify_node_vertices(
        &self,
        n: u32,
        plane: &[RationalPoint; 3],
    ) -> HashMap<u32, Orientation> {
        self.node_vertices(n)
            .into_iter()
            .map(|v| {
                let s = orient3d_rational(
                    &plane[0],
                    &plane[1],
                    &plane[2],
                    &self.vertices[v as usize].pos,
                );
                (v, s)
            })
            .collect()
    }

    /// Match faces lying fully on the plane of `t` and covered by it.
    fn match_on_plane_faces(
        &mut self,
        n: u32,
        t: u32,
        signs: &HashMap<u32, Orientation>,
        envelope: &Envelope,
        eps_2: f64,
    ) {
        let face_ids = self.nodes[n as usize].faces.clone();
        for f in face_ids {
            if self.faces[f as usize].matched.is_some() {
                continue;
            }
            let on_plane = self.faces[f as usize]
                .vertices
                .iter()
                .all(|v| signs.get(v) == Some(&Orientation::Zero));
            if on_plane && self.face_covered_by(f, t, envelope, eps_2) {
                self.faces[f as usize].matched = Some(t);
            }
        }
    }

    /// Split node `n` by the plane of triangle `t`. Returns the two child
    /// node ids (below reuses `n`).
    #[allow(clippy::too_many_arguments)]
    fn split_node(
        &mut self,
        n: u32,
        t: u32,
        plane: &[RationalPoint; 3],
        signs: &HashMap<u32, Orientation>,
        cut_cache: &mut HashMap<(u32, u32, u32), u32>,
        envelope: &Envelope,
        eps_2: f64,
    ) -> (u32, u32) {
        let parent_faces = std::mem::take(&mut self.nodes[n as usize].faces);
        let parent_cutters = std::mem::take(&mut self.nodes[n as usize].cutters);

        let below = n;
        let above = self.nodes.len() as u32;
        self.nodes.push(BspNode::default());

        let mut below_faces: Vec<u32> = Vec::new();
        let mut above_faces: Vec<u32> = Vec::new();
        let mut section_vertices: HashSet<u32> = HashSet::new();

        for &f in &parent_faces {
            let loop_verts = self.faces[f as usize].vertices.clone();
            let has_pos = loop_verts
                .iter()
                .any(|&v| signs.get(&v) == Some(&Orientation::Positive));
            let has_neg = loop_verts
                .iter()
                .any(|&v| signs.get(&v) == Some(&Orientation::Negative));

            if !has_pos && !has_neg {
                // Face on the plane cannot occur here: the node straddles.
                debug_assert!(false, "face on cutting plane inside straddling node");
                below_faces.push(f);
                continue;
            }
            if !has_neg {
                above_faces.push(f);
                self.collect_on_plane(&loop_verts, signs, &mut section_vertices);
                continue;
            }
            if !has_pos {
                below_faces.push(f);
                self.collect_on_plane(&loop_verts, signs, &mut section_vertices);
                continue;
            }

            // Straddling face: walk the loop and split it.
            let mut below_loop: Vec<u32> = Vec::new();
            let mut above_loop: Vec<u32> = Vec::new();
            let k = loop_verts.len();
            for i in 0..k {
                let v = loop_verts[i];
                let w = loop_verts[(i + 1) % k];
                let sv = *signs.get(&v).expect("classified vertex");
                let sw = *signs.get(&w).expect("classified vertex");
                match sv {
                    Orientation::Positive => above_loop.push(v),
                    Orientation::Negative => below_loop.push(v),
                    Orientation::Zero => {
                        above_loop.push(v);
                        below_loop.push(v);
                        section_vertices.insert(v);
                    }
                }
                if (sv == Orientation::Positive && sw == Orientation::Negative)
                    || (sv == Orientation::Negative && sw == Orientation::Positive)
                {
                    let class = self.plane_class[t as usize];
                    let key = if v < w { (class, v, w) } else { (class, w, v) };
                    let cut = *cut_cache.entry(key).or_insert_with(|| {
                        let p = plane_segment_intersection(
                            &plane[0],
                            &plane[1],
                            &plane[2],
                            &self.vertices[v as usize].pos,
                            &self.vertices[w as usize].pos,
                        );
                        self.vertices.push(BspVertex::new(p));
                        (self.vertices.len() - 1) as u32
                    });
                    above_loop.push(cut);
                    below_loop.push(cut);
                    section_vertices.insert(cut);
                }
            }

            let matched = self.faces[f as usize].matched;
            let neighbor = self.other_node(f, n);
            self.faces[f as usize].removed = true;
            let fb = self.push_face(below_loop, matched);
            let fa = self.push_face(above_loop, matched);
            below_faces.push(fb);
            above_faces.push(fa);
            if let Some(nb) = neighbor {
                let list = &mut self.nodes[nb as usize].faces;
                list.retain(|&x| x != f);
                list.push(fb);
                list.push(fa);
                self.faces[fb as usize].conn_nodes.push(nb);
                self.faces[fa as usize].conn_nodes.push(nb);
            }
        }

        // The section polygon closing both children.
        let section = self.build_section_face(&section_vertices, t, envelope, eps_2);
        below_faces.push(section);
        above_faces.push(section);

        // Rewire ownership.
        for &f in &below_faces {
            replace_or_insert(&mut self.faces[f as usize].conn_nodes, n, below);
        }
        for &f in &above_faces {
            if self.faces[f as usize].conn_nodes.contains(&n) && !below_faces.contains(&f) {
                replace_or_insert(&mut self.faces[f as usize].conn_nodes, n, above);
            } else {
                self.faces[f as usize].conn_nodes.push(above);
            }
        }
        self.nodes[below as usize].faces = below_faces;
        self.nodes[above as usize].faces = above_faces;

        // Children inherit the cutters whose support reaches their side.
        for c in parent_cutters {
            let tri = &self.tri_exact[c as usize];
            let mut c_pos = false;
            let mut c_neg = false;
            for p in tri {
                match orient3d_rational(&plane[0], &plane[1], &plane[2], p) {
                    Orientation::Positive => c_pos = true,
                    Orientation::Negative => c_neg = true,
                    Orientation::Zero => {}
                }
            }
            if c_neg || !c_pos {
                self.nodes[below as usize].cutters.push(c);
            }
            if c_pos || !c_neg {
                self.nodes[above as usize].cutters.push(c);
            }
        }

        (below, above)
    }

    fn collect_on_plane(
        &self,
        loop_verts: &[u32],
        signs: &HashMap<u32, Orientation>,
        out: &mut HashSet<u32>,
    ) {
        for &v in loop_verts {
            if signs.get(&v) == Some(&Orientation::Zero) {
                out.insert(v);
            }
        }
    }

    fn push_face(&mut self, vertices: Vec<u32>, matched: Option<u32>) -> u32 {
        debug_assert!(vertices.len() >= 3);
        self.faces.push(BspFace {
            vertices,
            conn_nodes: Vec::new(),
            matched,
            removed: false,
        });
        (self.faces.len() - 1) as u32
    }

    fn other_node(&self, f: u32, n: u32) -> Option<u32> {
        self.faces[f as usize]
            .conn_nodes
            .iter()
            .copied()
            .find(|&x| x != n)
    }

    /// Order the on-plane vertices into a convex loop and create the face.
    /// Tags it with the cutting triangle when covered by the surface.
    fn build_section_face(
        &mut self,
        section: &HashSet<u32>,
        t: u32,
        envelope: &Envelope,
        eps_2: f64,
    ) -> u32 {
        debug_assert!(section.len() >= 3, "section of a straddling cut");
        let mut ids: Vec<u32> = section.iter().copied().collect();
        let centroid = ids
            .iter()
            .fold(nalgebra::Vector3::zeros(), |acc, &v| {
                acc + self.vertices[v as usize].posf.coords
            })
            / ids.len() as f64;
        // Angular sort in the cutting plane; double precision is enough to
        // order distinct points of a convex section.
        let [a, b, c] = &self.tri_exact[t as usize];
        let tri = Triangle::new(a.to_f64(), b.to_f64(), c.to_f64());
        let normal = tri.normal().unwrap_or_else(|| nalgebra::Vector3::z());
        let u_axis = pick_orthogonal(&normal);
        let v_axis = normal.cross(&u_axis);
        ids.sort_by(|&p, &q| {
            let dp = self.vertices[p as usize].posf.coords - centroid;
            let dq = self.vertices[q as usize].posf.coords - centroid;
            let ap = dp.dot(&v_axis).atan2(dp.dot(&u_axis));
            let aq = dq.dot(&v_axis).atan2(dq.dot(&u_axis));
            ap.partial_cmp(&aq).unwrap_or(std::cmp::Ordering::Equal)
        });
        let exact_cover = ids
            .iter()
            .all(|&v| point_in_triangle_rational(&self.vertices[v as usize].pos, a, b, c));
        let face = self.push_face(ids, None);
        if exact_cover || self.face_within_envelope(face, envelope, eps_2) {
            self.faces[face as usize].matched = Some(t);
        }
        face
    }

    /// Recreate the edge array from the live faces.
    pub fn rebuild_edges(&mut self) {
        self.edges.clear();
        let mut ids: HashMap<(u32, u32), u32> = HashMap::new();
        for f in 0..self.faces.len() {
            if self.faces[f].removed {
                continue;
            }
            let loop_verts = self.faces[f].vertices.clone();
            let k = loop_verts.len();
            for i in 0..k {
                let a = loop_verts[i];
                let b = loop_verts[(i + 1) % k];
                let key = if a < b { (a, b) } else { (b, a) };
                let e = *ids.entry(key).or_insert_with(|| {
                    self.edges.push(BspEdge {
                        vertices: [key.0, key.1],
                        conn_faces: HashSet::new(),
                    });
                    (self.edges.len() - 1) as u32
                });
                self.edges[e as usize].conn_faces.insert(f as u32);
            }
        }
    }

    /// Every face must bound one or two nodes, and each node's faces must
    /// close up (each edge used exactly twice within the node).
    #[cfg(test)]
    pub fn check_integrity(&self) {
        for (f, face) in self.faces.iter().enumerate() {
            if face.removed {
                continue;
            }
            assert!(
                !face.conn_nodes.is_empty() && face.conn_nodes.len() <= 2,
                "face {f} bounds {} nodes",
                face.conn_nodes.len()
            );
            assert!(face.vertices.len() >= 3);
        }
        for edge in &self.edges {
            for &f in &edge.conn_faces {
                let vs = &self.faces[f as usize].vertices;
                assert!(
                    vs.contains(&edge.vertices[0]) && vs.contains(&edge.vertices[1]),
                    "edge {:?} lists a face that does not use it",
                    edge.vertices
                );
            }
        }
        for (n, node) in self.nodes.iter().enumerate() {
            let mut edge_use: HashMap<(u32, u32), usize> = HashMap::new();
            for &f in &node.faces {
                assert!(!self.faces[f as usize].removed, "node {n} uses dead face");
                let vs = &self.faces[f as usize].vertices;
                for i in 0..vs.len() {
                    let a = vs[i];
                    let b = vs[(i + 1) % vs.len()];
                    let key = if a < b { (a, b) } else { (b, a) };
                    *edge_use.entry(key).or_insert(0) += 1;
                }
            }
            for (edge, count) in edge_use {
                assert_eq!(count, 2, "node {n} edge {edge:?} used {count} times");
            }
        }
    }
}

/// Group triangles by their exact supporting plane.
///
/// The plane `n . x + d = 0` is canonicalized by dividing through its first
/// nonzero coefficient, which also folds away the two opposite normals.
fn assign_plane_classes(tris: &[[RationalPoint; 3]]) -> Vec<u32> {
    let mut classes: HashMap<[BigRational; 4], u32> = HashMap::new();
    let mut out = Vec::with_capacity(tris.len());
    for tri in tris {
        let n = cross(&sub(&tri[1], &tri[0]), &sub(&tri[2], &tri[0]));
        let d = -dot(&n, &[tri[0].0[0].clone(), tri[0].0[1].clone(), tri[0].0[2].clone()]);
        let mut coeffs = [n[0].clone(), n[1].clone(), n[2].clone(), d];
        if let Some(lead) = coeffs.iter().find(|c| !c.is_zero()).cloned() {
            for c in coeffs.iter_mut() {
                *c = &*c / &lead;
            }
        }
        let next = classes.len() as u32;
        out.push(*classes.entry(coeffs).or_insert(next));
    }
    out
}

fn replace_or_insert(list: &mut Vec<u32>, old: u32, new: u32) {
    if let Some(slot) = list.iter_mut().find(|x| **x == old) {
        *slot = new;
    } else if !list.contains(&new) {
        list.push(new);
    }
}

fn pick_orthogonal(n: &nalgebra::Vector3<f64>) -> nalgebra::Vector3<f64> {
    let candidate = if n.x.abs() <= n.y.abs() && n.x.abs() <= n.z.abs() {
        nalgebra::Vector3::x()
    } else if n.y.abs() <= n.z.abs() {
        nalgebra::Vector3::y()
    } else {
        nalgebra::Vector3::z()
    };
    let ortho = candidate - n * candidate.dot(n) / n.norm_squared();
    ortho.normalize()
}

fn points_bbox(points: &[Point3<f64>]) -> (Point3<f64>, Point3<f64>) {
    let mut min = points[0];
    let mut max = points[0];
    for p in points {
        min = Point3::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
        max = Point3::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
    }
    (min, max)
}

fn triangle_bbox(tri: &Triangle) -> (Point3<f64>, Point3<f64>) {
    points_bbox(&[tri.v0, tri.v1, tri.v2])
}

fn bbox_overlap(a: &(Point3<f64>, Point3<f64>), b: &(Point3<f64>, Point3<f64>)) -> bool {
    a.0.x <= b.1.x
        && a.1.x >= b.0.x
        && a.0.y <= b.1.y
        && a.1.y >= b.0.y
        && a.0.z <= b.1.z
        && a.1.z >= b.0.z
}

/// Conservative triangle/tet overlap test used for cutter assignment.
fn triangle_intersects_tet(tri: &Triangle, corners: &[Point3<f64>]) -> bool {
    use crate::predicates::point_in_tet;
    let [a, b, c, d] = [corners[0], corners[1], corners[2], corners[3]];
    for p in [&tri.v0, &tri.v1, &tri.v2] {
        if point_in_tet(p, &a, &b, &c, &d) {
            return true;
        }
    }
    // Tet edges against the triangle.
    for (i, j) in [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)] {
        if segment_intersects_triangle(&corners[i], &corners[j], tri) {
            return true;
        }
    }
    // Triangle edges against the tet facets.
    let facets = [[a, b, c], [a, b, d], [a, c, d], [b, c, d]];
    for facet in &facets {
        let ft = Triangle::new(facet[0], facet[1], facet[2]);
        for (p, q) in [(tri.v0, tri.v1), (tri.v1, tri.v2), (tri.v2, tri.v0)] {
            if segment_intersects_triangle(&p, &q, &ft) {
                return true;
            }
        }
    }
    false
}

/// Exact point-in-triangle test for a point on the triangle's plane.
fn point_in_triangle_rational(
    p: &RationalPoint,
    a: &RationalPoint,
    b: &RationalPoint,
    c: &RationalPoint,
) -> bool {
    // Signs of ((edge) x (p - start)) . normal must all be >= 0.
    let n = cross(&sub(b, a), &sub(c, a));
    let s0 = dot(&cross(&sub(b, a), &sub(p, a)), &n);
    let s1 = dot(&cross(&sub(c, b), &sub(p, b)), &n);
    let s2 = dot(&cross(&sub(a, c), &sub(p, c)), &n);
    !s0.is_negative() && !s1.is_negative() && !s2.is_negative()
}

type RVec = [BigRational; 3];

fn sub(a: &RationalPoint, b: &RationalPoint) -> RVec {
    [&a.0[0] - &b.0[0], &a.0[1] - &b.0[1], &a.0[2] - &b.0[2]]
}

fn cross(a: &RVec, b: &RVec) -> RVec {
    [
        &a[1] * &b[2] - &a[2] * &b[1],
        &a[2] * &b[0] - &a[0] * &b[2],
        &a[0] * &b[1] - &a[1] * &b[0],
    ]
}

fn dot(a: &RVec, b: &RVec) -> BigRational {
    &a[0] * &b[0] + &a[1] * &b[1] + &a[2] * &b[2]
}

/// True if all live matched faces jointly satisfy: every input triangle's
/// plane no longer crosses any cell interior (used by tests).
#[cfg(test)]
pub fn no_cutters_left(complex: &BspComplex) -> bool {
    complex.nodes.iter().all(|n| n.cutters.is_empty())
}
