//! Envelope predicate: is a point (or a whole triangle) within Hausdorff
//! distance `eps` of the input surface?
//!
//! Backed by an AABB tree over the input triangles, built once after
//! preprocessing and immutable afterwards, so queries are safe to issue
//! from parallel phases.

use nalgebra::Point3;

use crate::predicates::{closest_point_on_triangle, squared_dist_point_triangle};
use crate::types::{Triangle, TriangleSoup};

/// Cap on samples per triangle edge so envelope tests stay bounded on
/// degenerate sampling distances.
const MAX_EDGE_SAMPLES: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min: Point3<f64>,
    max: Point3<f64>,
}

impl Aabb {
    fn from_triangle(tri: &Triangle) -> Self {
        Self {
            min: Point3::new(
                tri.v0.x.min(tri.v1.x).min(tri.v2.x),
                tri.v0.y.min(tri.v1.y).min(tri.v2.y),
                tri.v0.z.min(tri.v1.z).min(tri.v2.z),
            ),
            max: Point3::new(
                tri.v0.x.max(tri.v1.x).max(tri.v2.x),
                tri.v0.y.max(tri.v1.y).max(tri.v2.y),
                tri.v0.z.max(tri.v1.z).max(tri.v2.z),
            ),
        }
    }

    fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: Point3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Point3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }

    /// Squared distance from `p` to this box (0 inside).
    fn squared_distance(&self, p: &Point3<f64>) -> f64 {
        let dx = (self.min.x - p.x).max(0.0).max(p.x - self.max.x);
        let dy = (self.min.y - p.y).max(0.0).max(p.y - self.max.y);
        let dz = (self.min.z - p.z).max(0.0).max(p.z - self.max.z);
        dx * dx + dy * dy + dz * dz
    }
}

#[derive(Debug)]
enum Node {
    Leaf {
        /// Indices into the triangle array.
        start: usize,
        count: usize,
    },
    Inner {
        left: usize,
        right: usize,
    },
}

/// Spatial index over the input surface answering distance queries.
#[derive(Debug)]
pub struct Envelope {
    triangles: Vec<Triangle>,
    /// Leaf-ordered permutation of triangle indices.
    order: Vec<u32>,
    nodes: Vec<Node>,
    boxes: Vec<Aabb>,
    root: usize,
}

impl Envelope {
    const LEAF_SIZE: usize = 4;

    /// Build the tree over all triangles of `soup`.
    pub fn build(soup: &TriangleSoup) -> Self {
        let triangles: Vec<Triangle> = soup.triangles().collect();
        let mut order: Vec<u32> = (0..triangles.len() as u32).collect();
        let mut env = Self {
            triangles,
            order: Vec::new(),
            nodes: Vec::new(),
            boxes: Vec::new(),
            root: 0,
        };
        if env.triangles.is_empty() {
            env.nodes.push(Node::Leaf { start: 0, count: 0 });
            env.boxes.push(Aabb {
                min: Point3::origin(),
                max: Point3::origin(),
            });
            return env;
        }
        let n = order.len();
        env.root = env.build_node(&mut order, 0, n);
        env.order = order;
        env
    }

    fn build_node(&mut self, order: &mut [u32], start: usize, count: usize) -> usize {
        let bbox = order[start..start + count]
            .iter()
            .map(|&t| Aabb::from_triangle(&self.triangles[t as usize]))
            .reduce(|a, b| a.merge(&b))
            .expect("non-empty node");

        if count <= Self::LEAF_SIZE {
            self.nodes.push(Node::Leaf { start, count });
            self.boxes.push(bbox);
            return self.nodes.len() - 1;
        }

        // Median split along the widest axis of the centroid spread.
        let extent = bbox.max - bbox.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };
        let mid = start + count / 2;
        order[start..start + count].select_nth_unstable_by(count / 2, |&a, &b| {
            let ca = self.triangles[a as usize].centroid()[axis];
            let cb = self.triangles[b as usize].centroid()[axis];
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let left = self.build_node(order, start, mid - start);
        let right = self.build_node(order, mid, start + count - mid);
        self.nodes.push(Node::Inner { left, right });
        self.boxes.push(bbox);
        self.nodes.len() - 1
    }

    /// Squared distance from `p` to the input surface.
    pub fn squared_distance(&self, p: &Point3<f64>) -> f64 {
        self.closest(p, f64::INFINITY).1
    }

    /// Closest point on the input surface to `p`.
    pub fn closest_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.closest(p, f64::INFINITY).0
    }

    fn closest(&self, p: &Point3<f64>, prune: f64) -> (Point3<f64>, f64) {
        if self.triangles.is_empty() {
            return (*p, f64::INFINITY);
        }
        let mut best = prune;
        let mut best_point = *p;
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            if self.boxes[node].squared_distance(p) >= best {
                continue;
            }
            match self.nodes[node] {
                Node::Leaf { start, count } => {
                    for &t in &self.order[start..start + count] {
                        let (q, d2) = closest_point_on_triangle(p, &self.triangles[t as usize]);
                        if d2 < best {
                            best = d2;
                            best_point = q;
                        }
                    }
                }
                Node::Inner { left, right } => {
                    // Visit the nearer child first for tighter pruning.
                    let dl = self.boxes[left].squared_distance(p);
                    let dr = self.boxes[right].squared_distance(p);
                    if dl <= dr {
                        stack.push(right);
                        stack.push(left);
                    } else {
                        stack.push(left);
                        stack.push(right);
                    }
                }
            }
        }
        (best_point, best)
    }

    /// True if `p` lies within distance `sqrt(eps_2)` of the surface.
    ///
    /// Monotone in the tolerance: growing `eps_2` never turns an inside
    /// point outside.
    pub fn point_inside(&self, p: &Point3<f64>, eps_2: f64) -> bool {
        if self.triangles.is_empty() {
            return false;
        }
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            if self.boxes[node].squared_distance(p) > eps_2 {
                continue;
            }
            match self.nodes[node] {
                Node::Leaf { start, count } => {
                    for &t in &self.order[start..start + count] {
                        if squared_dist_point_triangle(p, &self.triangles[t as usize]) <= eps_2 {
                            return true;
                        }
                    }
                }
                Node::Inner { left, right } => {
                    stack.push(left);
                    stack.push(right);
                }
            }
        }
        false
    }

    /// True if the whole triangle lies within the envelope.
    ///
    /// The triangle is sampled at density `sampling_dist` with a barycentric
    /// lattice covering its corners, edges and interior; every sample must
    /// be inside.
    pub fn triangle_inside(&self, tri: &Triangle, eps_2: f64, sampling_dist: f64) -> bool {
        for p in sample_triangle(tri, sampling_dist) {
            if !self.point_inside(&p, eps_2) {
                return false;
            }
        }
        true
    }
}

/// Barycentric lattice over a triangle at roughly `sampling_dist` spacing.
///
/// Always yields the three corners; interior rows stratify between the
/// edges so thin triangles still get edge coverage.
pub fn sample_triangle(tri: &Triangle, sampling_dist: f64) -> Vec<Point3<f64>> {
    let longest = tri.max_edge_length();
    let n = if sampling_dist > 0.0 && longest.is_finite() {
        ((longest / sampling_dist).ceil() as usize).clamp(1, MAX_EDGE_SAMPLES)
    } else {
        1
    };
    let mut samples = Vec::with_capacity((n + 1) * (n + 2) / 2);
    let fu = tri.v1 - tri.v0;
    let fv = tri.v2 - tri.v0;
    for i in 0..=n {
        for j in 0..=(n - i) {
            let u = i as f64 / n as f64;
            let v = j as f64 / n as f64;
            samples.push(tri.v0 + fu * u + fv * v);
        }
    }
    samples
}
