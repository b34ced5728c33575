//! Inside/outside filtering of the ambient mesh via generalized winding
//! numbers.

use nalgebra::Point3;
use rayon::prelude::*;
use tracing::debug;

use crate::types::{TetMesh, TriangleSoup};

/// Generalized winding number of the soup around `p`.
///
/// Sum of signed solid angles of the triangles, normalized by `4 pi`: 1 in
/// the interior of a closed CCW surface, 0 outside, fractional for open or
/// self-intersecting soups.
pub fn winding_number(soup: &TriangleSoup, p: &Point3<f64>) -> f64 {
    let mut total = 0.0;
    for face in &soup.faces {
        let a = soup.vertices[face[0] as usize] - p;
        let b = soup.vertices[face[1] as usize] - p;
        let c = soup.vertices[face[2] as usize] - p;
        let la = a.norm();
        let lb = b.norm();
        let lc = c.norm();
        let det = a.dot(&b.cross(&c));
        let denom = la * lb * lc + a.dot(&b) * lc + b.dot(&c) * la + c.dot(&a) * lb;
        total += 2.0 * det.atan2(denom);
    }
    total / (4.0 * std::f64::consts::PI)
}

/// Remove every tet whose barycenter has winding number <= 0.5.
///
/// Idempotent: the surviving tets' barycenters keep their winding number,
/// so running the filter again removes nothing.
pub fn filter_outside(mesh: &mut TetMesh, soup: &TriangleSoup) -> usize {
    let outside: Vec<usize> = mesh
        .active_tets()
        .collect::<Vec<_>>()
        .into_par_iter()
        .filter(|&t| winding_number(soup, &mesh.barycenter(t)) <= 0.5)
        .collect();
    for &t in &outside {
        mesh.remove_tet(t);
    }
    debug!(
        "winding filter removed {} tets, {} remain",
        outside.len(),
        mesh.active_tet_count()
    );
    outside.len()
}

/// Compact the surviving mesh into dense output arrays:
/// `(positions, tets, min dihedral angle per tet)`.
pub fn extract_output(mesh: &TetMesh) -> (Vec<Point3<f64>>, Vec<[u32; 4]>, Vec<f64>) {
    let mut remap = vec![u32::MAX; mesh.vertices.len()];
    let mut positions = Vec::new();
    let mut tets = Vec::new();
    let mut angles = Vec::new();
    for t in mesh.active_tets() {
        let mapped = mesh.tets[t].map(|v| {
            if remap[v as usize] == u32::MAX {
                remap[v as usize] = positions.len() as u32;
                positions.push(mesh.vertices[v as usize].posf);
            }
            remap[v as usize]
        });
        tets.push(mapped);
        angles.push(mesh.qualities[t].min_d_angle);
    }
    (positions, tets, angles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::TetQuality;
    use crate::types::{FacetTag, TetVertex};

    fn unit_cube_soup() -> TriangleSoup {
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
    fn winding_number_inside_and_outside() {
        let soup = unit_cube_soup();
        let w_in = winding_number(&soup, &Point3::new(0.5, 0.5, 0.5));
        let w_out = winding_number(&soup, &Point3::new(2.0, 2.0, 2.0));
        assert!((w_in - 1.0).abs() < 1e-9, "inside winding {w_in}");
        assert!(w_out.abs() < 1e-9, "outside winding {w_out}");
    }

    #[test]
    fn winding_number_open_surface_is_fractional() {
        let mut soup = unit_cube_soup();
        soup.faces.truncate(10); // drop one side
        let w = winding_number(&soup, &Point3::new(0.5, 0.5, 0.5));
        assert!(w > 0.5 && w < 1.0, "open winding {w}");
    }

    #[test]
    fn filter_is_idempotent() {
        let soup = unit_cube_soup();
        let mut mesh = TetMesh::default();
        // One tet inside the cube, one far outside.
        for p in [
            Point3::new(0.2, 0.2, 0.2),
            Point3::new(0.8, 0.2, 0.2),
            Point3::new(0.2, 0.8, 0.2),
            Point3::new(0.2, 0.2, 0.8),
            Point3::new(5.0, 5.0, 5.0),
            Point3::new(6.0, 5.0, 5.0),
            Point3::new(5.0, 6.0, 5.0),
            Point3::new(5.0, 5.0, 6.0),
        ] {
            mesh.vertices.push(TetVertex::new(p));
        }
        mesh.push_tet([0, 1, 2, 3], [FacetTag::NotSurface; 4]);
        mesh.push_tet([4, 5, 6, 7], [FacetTag::NotSurface; 4]);

        let removed = filter_outside(&mut mesh, &soup);
        assert_eq!(removed, 1);
        assert_eq!(mesh.active_tet_count(), 1);
        let removed_again = filter_outside(&mut mesh, &soup);
        assert_eq!(removed_again, 0);
    }

    #[test]
    fn extract_remaps_densely() {
        let mut mesh = TetMesh::default();
        for p in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(9.0, 9.0, 9.0), // unreferenced after removal
            Point3::new(8.0, 9.0, 9.0),
            Point3::new(9.0, 8.0, 9.0),
            Point3::new(9.0, 9.0, 8.0),
        ] {
            mesh.vertices.push(TetVertex::new(p));
        }
        let keep = mesh.push_tet([0, 1, 2, 3], [FacetTag::NotSurface; 4]);
        mesh.qualities[keep] = TetQuality {
            min_d_angle: 0.9,
            ..Default::default()
        };
        let drop = mesh.push_tet([4, 5, 6, 7], [FacetTag::NotSurface; 4]);
        mesh.remove_tet(drop);

        let (positions, tets, angles) = extract_output(&mesh);
        assert_eq!(positions.len(), 4);
        assert_eq!(tets, vec![[0, 1, 2, 3]]);
        assert_eq!(angles, vec![0.9]);
    }
}
