//! Robust tetrahedral meshing of triangle soups with an envelope constraint.
//!
//! This crate turns an arbitrary triangle soup (self-intersecting,
//! non-manifold, holes: all fine) into a valid tetrahedral volume mesh
//! whose boundary stays within a user-chosen Hausdorff distance of the
//! input surface. The output is a simplicial complex with no inverted or
//! degenerate tets, conservatively covering the interior of the input, and
//! with controlled element quality.
//!
//! # Pipeline
//!
//! 1. **Preprocess**: validate, weld, and simplify the input surface while
//!    it stays inside the envelope.
//! 2. **Delaunay**: tetrahedralize the simplified vertices plus an
//!    inflated bounding box (and optional voxel fill).
//! 3. **Face matching**: match cell facets already lying on input
//!    triangles; the rest become cutting constraints.
//! 4. **BSP subdivision**: split cells with exact rational arithmetic
//!    until every input triangle lies on a union of cell faces.
//! 5. **Tetrahedralization**: fan each convex cell into tets and label
//!    surface, bounding-box, and open-boundary facets.
//! 6. **Optimization**: local splits, collapses, swaps, and smoothing
//!    driven by an AMIPS-style energy, under the envelope.
//! 7. **Filtering**: keep the tets inside the input's generalized
//!    winding-number field.
//!
//! # Quick start
//!
//! ```no_run
//! use mesh_tet::{tetrahedralize, Config, TriangleSoup};
//!
//! let soup = TriangleSoup::from_raw(
//!     &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
//!     &[[0, 2, 1], [0, 1, 3], [1, 2, 3], [2, 0, 3]],
//! );
//! let out = tetrahedralize(&soup, &Config::default()).unwrap();
//! println!("{} vertices, {} tets", out.vertices.len(), out.tets.len());
//! for (tet, angle) in out.tets.iter().zip(&out.min_dihedral_angles) {
//!     println!("{tet:?}: min dihedral {angle:.3} rad");
//! }
//! ```
//!
//! # Errors and warnings
//!
//! Fatal conditions surface as [`TetError`]: unusable input coordinates,
//! an input that vanishes during preprocessing, or an envelope that cannot
//! be honored. Running out of optimization passes is *not* an error; the
//! best mesh found is returned with
//! [`TetMeshOutput::pass_limit_exceeded`] set, and the caller may retry
//! with a higher [`Config::stage`].

mod bsp;
mod delaunay;
mod envelope;
mod error;
mod filter;
mod io;
mod predicates;
mod quality;
mod refine;
mod simplify;
mod state;
mod tetra;
mod types;

pub use envelope::Envelope;
pub use error::{TetError, TetResult};
pub use filter::winding_number;
pub use io::{save_mesh_medit, save_msh, save_obj_surface};
pub use quality::{Energy, TetQuality};
pub use state::{Config, ProgressCallback, SizingField};
pub use types::{StageRecord, Step, TetMeshOutput, Triangle, TriangleSoup};

use nalgebra::Point3;
use tracing::info;

use crate::types::TET_FACETS;

/// Tetrahedralize a triangle soup under the envelope constraint.
///
/// Returns the output vertex positions (rounded doubles), the tets as
/// zero-based indices, and the minimum dihedral angle per tet, plus
/// per-stage statistics.
///
/// # Errors
///
/// [`TetError::InvalidInput`] for NaN/Inf coordinates, an empty face list,
/// out-of-range indices, or a degenerate bounding box;
/// [`TetError::EmptyInput`] when preprocessing removes every triangle;
/// [`TetError::EnvelopeInfeasible`] when the tolerance cannot be honored.
pub fn tetrahedralize(soup: &TriangleSoup, config: &Config) -> TetResult<TetMeshOutput> {
    simplify::validate_input(soup)?;
    let mut records = Vec::new();

    // Stage 1: preprocess.
    config.report(Step::Preprocess, 0.0);
    info!("preprocessing {} input triangles", soup.faces.len());
    let cleaned = simplify::clean_soup(soup);
    if cleaned.is_empty() {
        return Err(TetError::EmptyInput);
    }
    let envelope = Envelope::build(&cleaned);
    let is_mesh_closed = simplify::is_closed(&cleaned);
    let mut state = state::RefineState::new(config, cleaned.bbox_diag(), is_mesh_closed);
    let pre = simplify::simplify(&cleaned, &envelope, &state)?;
    records.push(record(Step::Preprocess, pre.soup.vertices.len(), pre.soup.faces.len()));

    // Stage 2: Delaunay tetrahedralization of the simplified vertex set.
    config.report(Step::Delaunay, 0.0);
    let dt = delaunay::tetrahedralize_soup(&pre.soup, &envelope, &state, config.use_voxel_stuffing)?;
    records.push(record(Step::Delaunay, dt.points.len(), dt.tets.len()));

    // Stage 3: match cell facets against the simplified triangles.
    config.report(Step::FaceMatching, 0.0);
    let mut complex = bsp::BspComplex::from_delaunay(&dt, &pre.soup);
    complex.conform(&pre.soup, &envelope, state.eps_2);
    records.push(record(Step::FaceMatching, complex.vertices.len(), complex.nodes.len()));

    // Stage 4: BSP subdivision until the surface lies on cell faces.
    config.report(Step::Bsp, 0.0);
    complex.subdivide(&envelope, state.eps_2);
    records.push(record(Step::Bsp, complex.vertices.len(), complex.nodes.len()));

    // Stage 5: decompose the convex cells.
    config.report(Step::Tetra, 0.0);
    let mut mesh = tetra::tetrahedralize_cells(&complex, pre.is_mesh_closed);
    drop(complex);
    records.push(record(Step::Tetra, mesh.vertices.len(), mesh.active_tet_count()));

    // Stage 6: refinement (reports its own progress per pass).
    let outcome = refine::refine(&mut mesh, &envelope, &mut state, config)?;
    records.push(StageRecord {
        step: Step::Optimize,
        n_vertices: mesh.active_vertex_count(),
        n_tets: mesh.active_tet_count(),
        max_energy: Some(outcome.max_energy),
        avg_energy: Some(outcome.avg_energy),
    });

    // Stage 7: keep the inside.
    filter::filter_outside(&mut mesh, &cleaned);
    quality::log_final_quality(&mesh);

    let (vertices, tets, min_dihedral_angles) = filter::extract_output(&mesh);
    info!(
        "done: {} vertices, {} tets{}",
        vertices.len(),
        tets.len(),
        if outcome.pass_limit_exceeded {
            " (pass limit exceeded)"
        } else {
            ""
        }
    );
    Ok(TetMeshOutput {
        vertices,
        tets,
        min_dihedral_angles,
        pass_limit_exceeded: outcome.pass_limit_exceeded,
        cancelled: outcome.cancelled,
        stage_records: records,
    })
}

fn record(step: Step, n_vertices: usize, n_tets: usize) -> StageRecord {
    StageRecord {
        step,
        n_vertices,
        n_tets,
        max_energy: None,
        avg_energy: None,
    }
}

/// Extract the boundary surface of a tet mesh, dropping unreferenced
/// vertices.
///
/// Boundary facets are the ones used by exactly one tet, oriented
/// outward.
pub fn extract_surface_mesh(
    vertices: &[Point3<f64>],
    tets: &[[u32; 4]],
) -> (Vec<Point3<f64>>, Vec<[u32; 3]>) {
    use hashbrown::HashMap;
    let mut counts: HashMap<[u32; 3], ([u32; 3], u32)> = HashMap::new();
    for tet in tets {
        for facet in TET_FACETS {
            let tri = [tet[facet[0]], tet[facet[1]], tet[facet[2]]];
            let mut key = tri;
            key.sort_unstable();
            counts
                .entry(key)
                .and_modify(|(_, c)| *c += 1)
                .or_insert((tri, 1));
        }
    }
    let mut remap: HashMap<u32, u32> = HashMap::new();
    let mut out_vertices = Vec::new();
    let mut out_faces = Vec::new();
    for (_, (tri, count)) in counts {
        if count != 1 {
            continue;
        }
        let mapped = tri.map(|v| {
            *remap.entry(v).or_insert_with(|| {
                out_vertices.push(vertices[v as usize]);
                (out_vertices.len() - 1) as u32
            })
        });
        out_faces.push(mapped);
    }
    (out_vertices, out_faces)
}
