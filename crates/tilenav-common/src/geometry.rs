//! 2-D and 3-D geometric predicates shared by the mesh and cache runtimes.

use crate::math::{vdot, vmad, vsub};

/// Determines whether two axis-aligned bounding boxes overlap.
#[inline]
pub fn overlap_bounds(amin: &[f32; 3], amax: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Determines whether two quantised bounding boxes overlap.
#[inline]
pub fn overlap_quant_bounds(
    amin: &[u16; 3],
    amax: &[u16; 3],
    bmin: &[u16; 3],
    bmax: &[u16; 3],
) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Tests whether the point lies inside the polygon on the xz-plane.
///
/// `verts` is a flat array of float triples; only `nverts` entries are
/// considered. Uses the crossing-number rule, so the polygon does not need
/// to be convex.
pub fn point_in_polygon_2d(pt: &[f32; 3], verts: &[f32], nverts: usize) -> bool {
    let mut inside = false;
    let mut j = nverts - 1;
    for i in 0..nverts {
        let vi = &verts[i * 3..i * 3 + 3];
        let vj = &verts[j * 3..j * 3 + 3];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Squared distance from `pt` to the segment `p`..`q` on the xz-plane.
///
/// Returns the squared distance and the parametric position `t` of the
/// closest point along the segment.
pub fn dist_pt_seg_sqr_2d(pt: &[f32; 3], p: &[f32], q: &[f32]) -> (f32, f32) {
    let pqx = q[0] - p[0];
    let pqz = q[2] - p[2];
    let dx = pt[0] - p[0];
    let dz = pt[2] - p[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let dx = p[0] + t * pqx - pt[0];
    let dz = p[2] + t * pqz - pt[2];
    (dx * dx + dz * dz, t)
}

/// Closest point on triangle `abc` from reference point `p`.
pub fn closest_pt_point_triangle(p: &[f32; 3], a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> [f32; 3] {
    // Check if P in vertex region outside A.
    let ab = vsub(b, a);
    let ac = vsub(c, a);
    let ap = vsub(p, a);

    let d1 = vdot(&ab, &ap);
    let d2 = vdot(&ac, &ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return *a;
    }

    // Check if P in vertex region outside B.
    let bp = vsub(p, b);
    let d3 = vdot(&ab, &bp);
    let d4 = vdot(&ac, &bp);
    if d3 >= 0.0 && d4 <= d3 {
        return *b;
    }

    // Check if P in edge region of AB; if so return projection onto AB.
    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return vmad(a, &ab, v);
    }

    // Check if P in vertex region outside C.
    let cp = vsub(p, c);
    let d5 = vdot(&ab, &cp);
    let d6 = vdot(&ac, &cp);
    if d6 >= 0.0 && d5 <= d6 {
        return *c;
    }

    // Check if P in edge region of AC; if so return projection onto AC.
    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return vmad(a, &ac, w);
    }

    // Check if P in edge region of BC; if so return projection onto BC.
    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        let bc = vsub(c, b);
        return vmad(b, &bc, w);
    }

    // P inside face region; compute Q through barycentric coordinates.
    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    let tmp = vmad(a, &ab, v);
    vmad(&tmp, &ac, w)
}

/// Height of triangle `abc` under point `p`, if `p` projects onto it.
///
/// Returns `None` when the point lies outside the triangle's xz-footprint
/// (within a small tolerance at the edges).
pub fn closest_height_point_triangle(
    p: &[f32; 3],
    a: &[f32; 3],
    b: &[f32; 3],
    c: &[f32; 3],
) -> Option<f32> {
    const EPS: f32 = 1e-6;

    let v0 = vsub(c, a);
    let v1 = vsub(b, a);
    let v2 = vsub(p, a);

    // Compute scaled barycentric coordinates.
    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < EPS {
        return None;
    }

    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];

    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    // If point lies inside the triangle, return the interpolated y-coord.
    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        let h = a[1] + (v0[1] * u + v1[1] * v) / denom;
        return Some(h);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_in_polygon_square() {
        let verts = [0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 10.0, 0.0, 10.0, 0.0, 0.0, 10.0];
        assert!(point_in_polygon_2d(&[5.0, 0.0, 5.0], &verts, 4));
        assert!(!point_in_polygon_2d(&[15.0, 0.0, 5.0], &verts, 4));
        assert!(!point_in_polygon_2d(&[-1.0, 0.0, 5.0], &verts, 4));
    }

    #[test]
    fn dist_pt_seg_clamps_t() {
        let p = [0.0, 0.0, 0.0];
        let q = [10.0, 0.0, 0.0];
        let (d, t) = dist_pt_seg_sqr_2d(&[5.0, 0.0, 3.0], &p, &q);
        assert!((d - 9.0).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);

        let (d, t) = dist_pt_seg_sqr_2d(&[-5.0, 0.0, 0.0], &p, &q);
        assert!((d - 25.0).abs() < 1e-6);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn triangle_height_inside_and_outside() {
        let a = [0.0, 1.0, 0.0];
        let b = [10.0, 1.0, 0.0];
        let c = [0.0, 1.0, 10.0];
        let h = closest_height_point_triangle(&[2.0, 5.0, 2.0], &a, &b, &c);
        assert!((h.unwrap() - 1.0).abs() < 1e-6);
        assert!(closest_height_point_triangle(&[20.0, 5.0, 20.0], &a, &b, &c).is_none());
    }

    #[test]
    fn closest_point_regions() {
        let a = [0.0, 0.0, 0.0];
        let b = [10.0, 0.0, 0.0];
        let c = [0.0, 0.0, 10.0];
        // Inside the face.
        let p = closest_pt_point_triangle(&[2.0, 0.0, 2.0], &a, &b, &c);
        assert!((p[0] - 2.0).abs() < 1e-5 && p[1].abs() < 1e-5 && (p[2] - 2.0).abs() < 1e-5);
        // Outside near vertex A.
        assert_eq!(closest_pt_point_triangle(&[-1.0, 0.0, -1.0], &a, &b, &c), a);
        // Outside near edge AB.
        let p = closest_pt_point_triangle(&[5.0, 0.0, -2.0], &a, &b, &c);
        assert!((p[0] - 5.0).abs() < 1e-6 && p[2].abs() < 1e-6);
    }

    #[test]
    fn quant_bounds_overlap() {
        assert!(overlap_quant_bounds(&[0, 0, 0], &[10, 10, 10], &[5, 5, 5], &[15, 15, 15]));
        assert!(!overlap_quant_bounds(&[0, 0, 0], &[4, 4, 4], &[5, 5, 5], &[15, 15, 15]));
    }
}
