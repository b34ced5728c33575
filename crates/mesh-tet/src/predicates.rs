//! Exact geometric predicates and small kernel routines.
//!
//! Floating-point queries go through Shewchuk's adaptive predicates (the
//! `robust` crate), which are exact for double inputs. Vertices created by
//! BSP cuts have rational coordinates that doubles cannot represent; those
//! are classified with exact `BigRational` determinants instead.

use nalgebra::Point3;
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use robust::Coord3D;

use crate::types::{RationalPoint, Triangle};

/// Sign of a geometric predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Positive,
    Zero,
    Negative,
}

impl Orientation {
    #[inline]
    pub fn from_sign(v: f64) -> Self {
        if v > 0.0 {
            Orientation::Positive
        } else if v < 0.0 {
            Orientation::Negative
        } else {
            Orientation::Zero
        }
    }

}

#[inline]
fn coord(p: &Point3<f64>) -> Coord3D<f64> {
    Coord3D {
        x: p.x,
        y: p.y,
        z: p.z,
    }
}

/// Orientation of the tetrahedron `(a, b, c, d)`.
///
/// `Positive` means positive signed volume: `d` lies on the side of plane
/// `(a, b, c)` that makes `(a, b, c)` wind counter-clockwise when seen
/// from `d`. Exact for all double inputs.
#[inline]
pub fn orient3d(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>, d: &Point3<f64>) -> Orientation {
    // robust::orient3d computes det(a-d, b-d, c-d), which is the negated
    // signed volume of (a, b, c, d).
    Orientation::from_sign(-robust::orient3d(coord(a), coord(b), coord(c), coord(d)))
}

/// Position of `p` relative to the circumsphere of tet `(a, b, c, d)`.
///
/// `Positive` means strictly inside, independent of the tet's orientation.
/// Degenerate (flat) tets yield `Zero`.
pub fn insphere(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    d: &Point3<f64>,
    p: &Point3<f64>,
) -> Orientation {
    let o = robust::orient3d(coord(a), coord(b), coord(c), coord(d));
    if o == 0.0 {
        return Orientation::Zero;
    }
    let i = robust::insphere(coord(a), coord(b), coord(c), coord(d), coord(p));
    Orientation::from_sign(o.signum() * i)
}

/// Exact signed volume determinant of `(a, b, c, d)` over rationals.
///
/// Positive sign matches [`orient3d`].
pub fn orient3d_rational_value(
    a: &RationalPoint,
    b: &RationalPoint,
    c: &RationalPoint,
    d: &RationalPoint,
) -> BigRational {
    let u = [&b.0[0] - &a.0[0], &b.0[1] - &a.0[1], &b.0[2] - &a.0[2]];
    let v = [&c.0[0] - &a.0[0], &c.0[1] - &a.0[1], &c.0[2] - &a.0[2]];
    let w = [&d.0[0] - &a.0[0], &d.0[1] - &a.0[1], &d.0[2] - &a.0[2]];
    // det [u v w] expanded along the first row of the cross product.
    let cx = &v[1] * &w[2] - &v[2] * &w[1];
    let cy = &v[2] * &w[0] - &v[0] * &w[2];
    let cz = &v[0] * &w[1] - &v[1] * &w[0];
    &u[0] * cx + &u[1] * cy + &u[2] * cz
}

/// Sign-only variant of [`orient3d_rational_value`].
pub fn orient3d_rational(
    a: &RationalPoint,
    b: &RationalPoint,
    c: &RationalPoint,
    d: &RationalPoint,
) -> Orientation {
    let v = orient3d_rational_value(a, b, c, d);
    if v.is_positive() {
        Orientation::Positive
    } else if v.is_negative() {
        Orientation::Negative
    } else {
        Orientation::Zero
    }
}

/// Exact point on segment `(a, b)` where the plane through `(p, q, r)`
/// crosses it. Caller guarantees the segment straddles the plane
/// (endpoint determinants have strictly opposite signs).
pub fn plane_segment_intersection(
    p: &RationalPoint,
    q: &RationalPoint,
    r: &RationalPoint,
    a: &RationalPoint,
    b: &RationalPoint,
) -> RationalPoint {
    let da = orient3d_rational_value(p, q, r, a);
    let db = orient3d_rational_value(p, q, r, b);
    debug_assert!(da.is_positive() != db.is_positive() && !da.is_zero() && !db.is_zero());
    let t = &da / (&da - &db);
    RationalPoint([
        &a.0[0] + &t * (&b.0[0] - &a.0[0]),
        &a.0[1] + &t * (&b.0[1] - &a.0[1]),
        &a.0[2] + &t * (&b.0[2] - &a.0[2]),
    ])
}

/// True if `p` lies inside or on the boundary of tet `(a, b, c, d)`.
///
/// The tet may have either orientation; all four facet orientations must
/// agree (zeros allowed).
pub fn point_in_tet(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    d: &Point3<f64>,
) -> bool {
    let signs = [
        orient3d(a, b, c, p),
        orient3d(a, d, b, p),
        orient3d(a, c, d, p),
        orient3d(b, d, c, p),
    ];
    let tet_sign = orient3d(a, b, c, d);
    if tet_sign == Orientation::Zero {
        return false;
    }
    signs
        .iter()
        .all(|&s| s == tet_sign || s == Orientation::Zero)
}

/// Closest point on a triangle to `p`, with the squared distance.
///
/// Standard Voronoi-region walk over the triangle's vertices, edges and
/// interior.
pub fn closest_point_on_triangle(p: &Point3<f64>, tri: &Triangle) -> (Point3<f64>, f64) {
    let a = tri.v0;
    let b = tri.v1;
    let c = tri.v2;
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return (a, (p - a).norm_squared());
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return (b, (p - b).norm_squared());
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let t = d1 / (d1 - d3);
        let q = a + ab * t;
        return (q, (p - q).norm_squared());
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return (c, (p - c).norm_squared());
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let t = d2 / (d2 - d6);
        let q = a + ac * t;
        return (q, (p - q).norm_squared());
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let t = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        let q = b + (c - b) * t;
        return (q, (p - q).norm_squared());
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    let q = a + ab * v + ac * w;
    (q, (p - q).norm_squared())
}

/// Squared distance from `p` to a triangle.
#[inline]
pub fn squared_dist_point_triangle(p: &Point3<f64>, tri: &Triangle) -> f64 {
    closest_point_on_triangle(p, tri).1
}

/// Conservative segment/triangle intersection test.
///
/// Treats touching configurations (endpoint on the triangle plane,
/// segment grazing an edge) as intersecting, which is the safe direction
/// for cutter assignment.
pub fn segment_intersects_triangle(p: &Point3<f64>, q: &Point3<f64>, tri: &Triangle) -> bool {
    let sp = orient3d(&tri.v0, &tri.v1, &tri.v2, p);
    let sq = orient3d(&tri.v0, &tri.v1, &tri.v2, q);
    if sp == sq && sp != Orientation::Zero {
        return false;
    }
    let s1 = orient3d(p, q, &tri.v0, &tri.v1);
    let s2 = orient3d(p, q, &tri.v1, &tri.v2);
    let s3 = orient3d(p, q, &tri.v2, &tri.v0);
    let any_pos = [s1, s2, s3].iter().any(|&s| s == Orientation::Positive);
    let any_neg = [s1, s2, s3].iter().any(|&s| s == Orientation::Negative);
    !(any_pos && any_neg)
}
