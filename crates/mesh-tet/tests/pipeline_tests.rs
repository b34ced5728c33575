//! End-to-end tests for the tetrahedralization pipeline.
//!
//! These exercise the whole chain soup -> simplify -> Delaunay -> BSP ->
//! tets -> refine -> filter on small canonical inputs and check the
//! user-visible guarantees: no inverted tets, sane dihedral angles, no
//! duplicated vertices, and geometry near the input.

use std::sync::Mutex;

use mesh_tet::{tetrahedralize, Config, Step, TetError, TriangleSoup};
use nalgebra::Point3;

/// Config keeping the test meshes small: a coarse target edge length, no
/// voxel fill, and a short optimization budget.
fn test_config() -> Config {
    Config {
        initial_edge_len_rel: 5.0,
        max_num_passes: 5,
        use_voxel_stuffing: false,
        ..Default::default()
    }
}

fn unit_tet_soup() -> TriangleSoup {
    TriangleSoup::from_raw(
        &[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ],
        // Outward-facing triangles of the tetrahedron's surface.
        &[[0, 2, 1], [0, 1, 3], [1, 2, 3], [2, 0, 3]],
    )
}

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

/// Signed volume of a tet given output arrays.
fn tet_volume(vertices: &[Point3<f64>], tet: &[u32; 4]) -> f64 {
    let [a, b, c, d] = tet.map(|v| vertices[v as usize]);
    (b - a).cross(&(c - a)).dot(&(d - a)) / 6.0
}

/// Shared validity checks on any successful output.
fn check_output(out: &mesh_tet::TetMeshOutput) {
    assert_eq!(out.tets.len(), out.min_dihedral_angles.len());
    let mut seen = std::collections::HashSet::new();
    for p in &out.vertices {
        assert!(p.x.is_finite() && p.y.is_finite() && p.z.is_finite());
        assert!(
            seen.insert([p.x.to_bits(), p.y.to_bits(), p.z.to_bits()]),
            "duplicate output vertex {p}"
        );
    }
    for (tet, &angle) in out.tets.iter().zip(&out.min_dihedral_angles) {
        for &v in tet {
            assert!((v as usize) < out.vertices.len(), "index out of range");
        }
        assert!(
            tet_volume(&out.vertices, tet) > 0.0,
            "non-positive tet {tet:?}"
        );
        assert!(
            angle > 0.0 && angle < std::f64::consts::PI,
            "dihedral angle out of range: {angle}"
        );
    }
}

#[test]
fn unit_tetrahedron_is_meshed() {
    let soup = unit_tet_soup();
    let out = tetrahedralize(&soup, &test_config()).unwrap();
    assert!(!out.tets.is_empty(), "expected a non-empty volume mesh");
    check_output(&out);

    // Every output vertex stays near the solid tetrahedron: nonnegative
    // barycentric half-space distances up to the envelope slack.
    for p in &out.vertices {
        let slack = 0.01;
        assert!(p.x > -slack && p.y > -slack && p.z > -slack, "outside: {p}");
        assert!(p.x + p.y + p.z < 1.0 + slack, "outside: {p}");
    }

    // The meshed volume approximates the tetrahedron's 1/6.
    let volume: f64 = out.tets.iter().map(|t| tet_volume(&out.vertices, t)).sum();
    assert!(
        (volume - 1.0 / 6.0).abs() < 0.02,
        "volume {volume} should be near 1/6"
    );
}

#[test]
fn unit_cube_is_meshed_with_full_volume() {
    let soup = unit_cube_soup();
    let out = tetrahedralize(&soup, &test_config()).unwrap();
    check_output(&out);
    assert!(out.tets.len() >= 5, "a cube needs at least 5 tets");

    let volume: f64 = out.tets.iter().map(|t| tet_volume(&out.vertices, t)).sum();
    assert!(
        volume > 0.95 && volume < 1.02,
        "cube volume {volume} out of range"
    );

    // The output stays inside the input box inflated by the envelope.
    for p in &out.vertices {
        for c in [p.x, p.y, p.z] {
            assert!(c > -0.01 && c < 1.01, "vertex outside inflated box: {p}");
        }
    }
}

#[test]
fn single_triangle_yields_empty_volume_without_crashing() {
    let soup = TriangleSoup::from_raw(
        &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        &[[0, 1, 2]],
    );
    match tetrahedralize(&soup, &test_config()) {
        Ok(out) => {
            check_output(&out);
            // A single open triangle encloses (almost) no volume.
            let volume: f64 = out.tets.iter().map(|t| tet_volume(&out.vertices, t)).sum();
            assert!(volume.abs() < 1e-3, "unexpected volume {volume}");
        }
        Err(TetError::EmptyInput) => {}
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[test]
fn bowtie_input_does_not_crash() {
    // Two triangles sharing exactly one vertex.
    let soup = TriangleSoup::from_raw(
        &[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.5, 1.0, 0.0],
            [0.0, 2.0, 0.0],
            [1.0, 2.0, 0.0],
        ],
        &[[0, 1, 2], [2, 4, 3]],
    );
    match tetrahedralize(&soup, &test_config()) {
        Ok(out) => {
            check_output(&out);
            let volume: f64 = out.tets.iter().map(|t| tet_volume(&out.vertices, t)).sum();
            assert!(volume.abs() < 1e-3, "bowtie produced volume {volume}");
        }
        Err(TetError::EmptyInput) => {}
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[test]
fn open_cube_keeps_tagged_holes_or_smooths_them() {
    let mut soup = unit_cube_soup();
    soup.faces.truncate(10); // remove the x = 1 side

    let out = tetrahedralize(&soup, &test_config()).unwrap();
    check_output(&out);

    let smoothed = tetrahedralize(
        &soup,
        &Config {
            smooth_open_boundary: true,
            ..test_config()
        },
    )
    .unwrap();
    check_output(&smoothed);
}

#[test]
fn invalid_inputs_are_rejected() {
    let nan = TriangleSoup::from_raw(
        &[[f64::NAN, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        &[[0, 1, 2]],
    );
    assert!(matches!(
        tetrahedralize(&nan, &test_config()),
        Err(TetError::InvalidInput { .. })
    ));

    let empty = TriangleSoup::from_raw(&[[0.0, 0.0, 0.0]], &[]);
    assert!(matches!(
        tetrahedralize(&empty, &test_config()),
        Err(TetError::InvalidInput { .. })
    ));
}

#[test]
fn progress_reports_every_stage_in_order() {
    let steps: &'static Mutex<Vec<Step>> = Box::leak(Box::new(Mutex::new(Vec::new())));
    let config = Config {
        progress: Some(Box::new(move |step, fraction| {
            assert!((0.0..=1.0).contains(&fraction));
            steps.lock().unwrap().push(step);
            true
        })),
        ..test_config()
    };
    tetrahedralize(&unit_tet_soup(), &config).unwrap();

    let seen = steps.lock().unwrap();
    let expected = [
        Step::Preprocess,
        Step::Delaunay,
        Step::FaceMatching,
        Step::Bsp,
        Step::Tetra,
        Step::Optimize,
    ];
    // Each stage appears, in pipeline order (Optimize repeats per pass).
    let mut cursor = 0;
    for step in seen.iter() {
        if cursor < expected.len() && *step == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(cursor, expected.len(), "stages seen: {seen:?}");
}

#[test]
fn cancellation_returns_last_valid_mesh() {
    let config = Config {
        progress: Some(Box::new(|step, _| step != Step::Optimize)),
        ..test_config()
    };
    let out = tetrahedralize(&unit_tet_soup(), &config).unwrap();
    assert!(out.cancelled);
    check_output(&out);
}

#[test]
fn stage_records_cover_the_pipeline() {
    let out = tetrahedralize(&unit_cube_soup(), &test_config()).unwrap();
    let steps: Vec<Step> = out.stage_records.iter().map(|r| r.step).collect();
    assert_eq!(
        steps,
        vec![
            Step::Preprocess,
            Step::Delaunay,
            Step::FaceMatching,
            Step::Bsp,
            Step::Tetra,
            Step::Optimize,
        ]
    );
    let opt = out.stage_records.last().unwrap();
    assert!(opt.max_energy.is_some() && opt.avg_energy.is_some());
}

#[test]
fn boundary_surface_stays_within_inflated_input_bbox() {
    let soup = unit_cube_soup();
    let out = tetrahedralize(&soup, &test_config()).unwrap();
    let (vs, fs) = mesh_tet::extract_surface_mesh(&out.vertices, &out.tets);
    assert!(!fs.is_empty());
    let eps = soup.bbox_diag() / 1000.0;
    for p in &vs {
        for c in [p.x, p.y, p.z] {
            assert!(c >= -eps - 1e-9 && c <= 1.0 + eps + 1e-9, "vertex {p} escapes");
        }
    }
}
