//! Decomposing the convex BSP cells into labeled tetrahedra.
//!
//! Each cell is fanned from its lowest-index vertex. Facets lying on a
//! matched cell face inherit the face's surface tag; the ambient hull is
//! tagged as bounding box, and for open inputs the facets around surface
//! holes are tagged so later smoothing can find them.

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::bsp::BspComplex;
use crate::predicates::{orient3d, orient3d_rational, Orientation};
use crate::types::{FacetTag, RationalPoint, TetMesh, TetVertex, TET_FACETS};

/// Build the initial tet mesh from the subdivided complex.
pub fn tetrahedralize_cells(complex: &BspComplex, is_mesh_closed: bool) -> TetMesh {
    let mut mesh = TetMesh::default();

    // Deduplicate by exact position: distinct tet vertices never share a
    // rational point.
    let mut by_pos: HashMap<RationalPoint, u32> = HashMap::new();
    let mut vmap: Vec<u32> = Vec::with_capacity(complex.vertices.len());
    for v in &complex.vertices {
        let id = *by_pos.entry(v.pos.clone()).or_insert_with(|| {
            mesh.vertices.push(TetVertex::from_rational(v.pos.clone()));
            (mesh.vertices.len() - 1) as u32
        });
        vmap.push(id);
    }

    for node in &complex.nodes {
        let node_vertices: HashSet<u32> = node
            .faces
            .iter()
            .flat_map(|&f| complex.faces[f as usize].vertices.iter().copied())
            .map(|v| vmap[v as usize])
            .collect();
        let pivot = *node_vertices.iter().min().expect("non-empty cell");

        // Matched faces of this cell, as vertex sets for facet tagging.
        let matched: Vec<(u32, HashSet<u32>)> = node
            .faces
            .iter()
            .filter_map(|&f| {
                let face = &complex.faces[f as usize];
                face.matched.map(|t| {
                    (
                        t,
                        face.vertices.iter().map(|&v| vmap[v as usize]).collect(),
                    )
                })
            })
            .collect();

        for &f in &node.faces {
            let loop_verts: Vec<u32> = complex.faces[f as usize]
                .vertices
                .iter()
                .map(|&v| vmap[v as usize])
                .collect();
            if loop_verts.contains(&pivot) {
                continue;
            }
            // Fan around the loop's lowest vertex.
            let anchor_pos = loop_verts
                .iter()
                .enumerate()
                .min_by_key(|(_, &v)| v)
                .map(|(i, _)| i)
                .expect("non-empty loop");
            let k = loop_verts.len();
            let a = loop_verts[anchor_pos];
            for step in 1..(k - 1) {
                let b = loop_verts[(anchor_pos + step) % k];
                let c = loop_verts[(anchor_pos + step + 1) % k];
                let tet = match orient_exact(&mesh.vertices, a, b, c, pivot) {
                    Orientation::Positive => [a, b, c, pivot],
                    Orientation::Negative => [a, c, b, pivot],
                    Orientation::Zero => continue,
                };
                let mut tags = [FacetTag::NotSurface; 4];
                for (fi, facet) in TET_FACETS.iter().enumerate() {
                    let tri = [tet[facet[0]], tet[facet[1]], tet[facet[2]]];
                    for (t, verts) in &matched {
                        if tri.iter().all(|v| verts.contains(v)) {
                            tags[fi] = FacetTag::Surface(*t);
                            break;
                        }
                    }
                }
                mesh.push_tet(tet, tags);
            }
        }
    }

    label_bbox_facets(&mut mesh);
    mark_surface_vertices(&mut mesh);
    if !is_mesh_closed {
        label_boundary(&mut mesh);
    }
    debug!(
        "initial tet mesh: {} vertices, {} tets",
        mesh.vertices.len(),
        mesh.tets.len()
    );
    mesh
}

/// Exact orientation over mixed rounded/unrounded vertices.
pub(crate) fn orient_exact(vertices: &[TetVertex], a: u32, b: u32, c: u32, d: u32) -> Orientation {
    let ids = [a, b, c, d];
    if ids.iter().all(|&v| vertices[v as usize].is_rounded()) {
        let [pa, pb, pc, pd] = ids.map(|v| vertices[v as usize].posf);
        orient3d(&pa, &pb, &pc, &pd)
    } else {
        let [pa, pb, pc, pd] = ids.map(|v| vertices[v as usize].exact());
        orient3d_rational(&pa, &pb, &pc, &pd)
    }
}

/// Facets without a neighboring tet form the ambient hull: the inflated
/// bounding box. Tag them and flag their vertices.
fn label_bbox_facets(mesh: &mut TetMesh) {
    let mut counts: HashMap<[u32; 3], u32> = HashMap::new();
    for t in mesh.active_tets() {
        for f in 0..4 {
            let mut key = mesh.facet(t, f);
            key.sort_unstable();
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    for t in 0..mesh.tets.len() {
        if mesh.removed[t] {
            continue;
        }
        for f in 0..4 {
            let facet = mesh.facet(t, f);
            let mut key = facet;
            key.sort_unstable();
            if counts[&key] == 1 && mesh.facet_tags[t][f] == FacetTag::NotSurface {
                mesh.facet_tags[t][f] = FacetTag::Bbox;
                for v in facet {
                    mesh.vertices[v as usize].on_bbox = true;
                }
            }
        }
    }
}

fn mark_surface_vertices(mesh: &mut TetMesh) {
    for t in 0..mesh.tets.len() {
        if mesh.removed[t] {
            continue;
        }
        for f in 0..4 {
            if mesh.facet_tags[t][f].is_surface() {
                for v in mesh.facet(t, f) {
                    mesh.vertices[v as usize].on_surface = true;
                }
            }
        }
    }
}

/// For open inputs, surface facets stop at the hole rims. Flag the rim
/// vertices and tag the untagged facets leaning on a rim edge so the hole
/// covers can be found later.
fn label_boundary(mesh: &mut TetMesh) {
    let mut edge_counts: HashMap<(u32, u32), u32> = HashMap::new();
    for t in mesh.active_tets() {
        for f in 0..4 {
            if !mesh.facet_tags[t][f].is_surface() {
                continue;
            }
            let facet = mesh.facet(t, f);
            for k in 0..3 {
                let a = facet[k];
                let b = facet[(k + 1) % 3];
                let key = if a < b { (a, b) } else { (b, a) };
                *edge_counts.entry(key).or_insert(0) += 1;
            }
        }
    }
    let rim: HashSet<(u32, u32)> = edge_counts
        .into_iter()
        .filter(|&(_, c)| c == 1)
        .map(|(e, _)| e)
        .collect();
    if rim.is_empty() {
        return;
    }
    for &(a, b) in &rim {
        mesh.vertices[a as usize].on_boundary = true;
        mesh.vertices[b as usize].on_boundary = true;
    }
    for t in 0..mesh.tets.len() {
        if mesh.removed[t] {
            continue;
        }
        for f in 0..4 {
            if mesh.facet_tags[t][f] != FacetTag::NotSurface {
                continue;
            }
            let facet = mesh.facet(t, f);
            let touches_rim = (0..3).any(|k| {
                let a = facet[k];
                let b = facet[(k + 1) % 3];
                let key = if a < b { (a, b) } else { (b, a) };
                rim.contains(&key)
            });
            if touches_rim {
                mesh.facet_tags[t][f] = FacetTag::Boundary;
            }
        }
    }
}
