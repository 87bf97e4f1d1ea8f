//! Integer geometry predicates on the XZ-plane.
//!
//! Contour & mesher vertices are voxel coordinates stored in [IVec4]s (`w` carries
//! flags), so every predicate here works on exact integer arithmetic. Only `x` & `z`
//! participate; heights never influence the planar tests.

use bevy::math::IVec4;

/// Twice the signed area of triangle `(a, b, c)` on the XZ-plane.
///
/// Negative when `c` lies to the left of the directed edge `a -> b`, as seen from above
/// with Y up.
#[inline]
pub(crate) fn area2(a: IVec4, b: IVec4, c: IVec4) -> i32 {
    (b.x - a.x) * (c.z - a.z) - (c.x - a.x) * (b.z - a.z)
}

#[inline]
pub(crate) fn left(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) < 0
}

#[inline]
pub(crate) fn left_on(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
pub(crate) fn collinear(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) == 0
}

/// True when `c` lies on the closed segment `a-b`. Assumes the three points are
/// collinear.
pub(crate) fn between(a: IVec4, b: IVec4, c: IVec4) -> bool {
    if !collinear(a, b, c) {
        return false;
    }

    // Test on the axis the segment actually extends along.
    if a.x != b.x {
        (a.x <= c.x && c.x <= b.x) || (b.x <= c.x && c.x <= a.x)
    } else {
        (a.z <= c.z && c.z <= b.z) || (b.z <= c.z && c.z <= a.z)
    }
}

/// Proper intersection of segments `a-b` & `c-d`: the segments cross at a single point
/// interior to both. Shared endpoints and collinear overlaps do not count.
pub(crate) fn intersect_prop(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }

    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// Intersection of segments `a-b` & `c-d`, including endpoint touches and collinear
/// overlap.
pub(crate) fn intersect(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

/// True when the diagonal from `vertices[i]` towards `point` starts inside the polygon's
/// cone at `i`. `vertices` is a closed loop.
pub(crate) fn in_cone(i: usize, vertices: &[IVec4], point: IVec4) -> bool {
    let point_i = vertices[i];
    let point_next = vertices[(i + 1) % vertices.len()];
    let point_prev = vertices[(vertices.len() + i - 1) % vertices.len()];

    if left_on(point_prev, point_i, point_next) {
        // Convex corner.
        return left(point_i, point, point_prev) && left(point, point_i, point_next);
    }

    // Reflex corner.
    !(left_on(point_i, point, point_next) && left_on(point, point_i, point_prev))
}
