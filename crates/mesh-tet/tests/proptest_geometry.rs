//! Property-based tests for the geometric foundations.
//!
//! Run with: cargo test -p mesh-tet -- proptest

use mesh_tet::{winding_number, Envelope, TriangleSoup};
use nalgebra::Point3;
use proptest::prelude::*;

/// Random coordinate in a tame range.
fn arb_coord() -> impl Strategy<Value = f64> {
    -10.0..10.0f64
}

fn arb_point() -> impl Strategy<Value = [f64; 3]> {
    prop::array::uniform3(arb_coord())
}

fn cube_soup() -> TriangleSoup {
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

proptest! {
    /// Growing the tolerance never turns an inside point outside.
    #[test]
    fn envelope_is_monotone_in_eps(p in arb_point(), eps1 in 0.01..2.0f64, delta in 0.0..2.0f64) {
        let env = Envelope::build(&cube_soup());
        let p = Point3::new(p[0], p[1], p[2]);
        let eps2 = eps1 + delta;
        if env.point_inside(&p, eps1 * eps1) {
            prop_assert!(env.point_inside(&p, eps2 * eps2));
        }
    }

    /// The envelope test agrees with the exact squared distance.
    #[test]
    fn envelope_matches_brute_force_distance(p in arb_point(), eps in 0.01..3.0f64) {
        let soup = cube_soup();
        let env = Envelope::build(&soup);
        let p = Point3::new(p[0], p[1], p[2]);
        let d2 = env.squared_distance(&p);
        prop_assert_eq!(env.point_inside(&p, eps * eps), d2 <= eps * eps);
        // Closest point actually achieves the distance.
        let q = env.closest_point(&p);
        prop_assert!(((p - q).norm_squared() - d2).abs() < 1e-9);
    }

    /// Winding number of a closed cube is a 0/1 indicator away from the
    /// boundary.
    #[test]
    fn cube_winding_number_is_an_indicator(p in arb_point()) {
        let soup = cube_soup();
        let p = Point3::new(p[0], p[1], p[2]);
        // Stay away from the surface where the value jumps.
        let margin = 1e-3;
        let strictly_inside = p.x > margin && p.x < 1.0 - margin
            && p.y > margin && p.y < 1.0 - margin
            && p.z > margin && p.z < 1.0 - margin;
        let strictly_outside = p.x < -margin || p.x > 1.0 + margin
            || p.y < -margin || p.y > 1.0 + margin
            || p.z < -margin || p.z > 1.0 + margin;
        let w = winding_number(&soup, &p);
        if strictly_inside {
            prop_assert!((w - 1.0).abs() < 1e-6, "inside w = {}", w);
        } else if strictly_outside {
            prop_assert!(w.abs() < 1e-6, "outside w = {}", w);
        }
    }
}
