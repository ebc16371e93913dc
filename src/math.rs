use bevy::math::{IVec4, UVec4};

/// Twice the signed area of the triangle ``(a, b, c)`` projected onto the XZ-plane.
fn area2(a: IVec4, b: IVec4, c: IVec4) -> i64 {
    i64::from(b.x - a.x) * i64::from(c.z - a.z) - i64::from(c.x - a.x) * i64::from(b.z - a.z)
}

pub(super) fn left(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) < 0
}

pub(super) fn left_on(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) <= 0
}

fn collinear(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) == 0
}

/// Proper intersection of segments ``a-b`` & ``c-d``: they cross at a point interior to both.
pub(super) fn intersect_prop(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }

    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// True when ``c`` is collinear with ``a-b`` and lies within the segment on the XZ-plane.
fn between(a: IVec4, b: IVec4, c: IVec4) -> bool {
    if !collinear(a, b, c) {
        return false;
    }

    if a.x != b.x {
        (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x)
    } else {
        (a.z <= c.z && c.z <= b.z) || (a.z >= c.z && c.z >= b.z)
    }
}

/// Intersection of segments ``a-b`` & ``c-d``, proper or improper.
pub(super) fn intersect(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

/// Whether the diagonal from ``vertices[i]`` to ``point`` lies within the cone
/// formed at vertex ``i`` by its ring neighbours.
pub(super) fn in_cone(i: usize, vertices: &[UVec4], point: UVec4) -> bool {
    let point_i = vertices[i].as_ivec4();
    let point_next = vertices[(i + 1) % vertices.len()].as_ivec4();
    let point_prev = vertices[(vertices.len() + i - 1) % vertices.len()].as_ivec4();
    let point = point.as_ivec4();

    if left_on(point_prev, point_i, point_next) {
        // Convex corner.
        return left(point_i, point, point_prev) && left(point, point_i, point_next);
    }

    // Reflex corner.
    !(left_on(point_i, point, point_next) && left_on(point, point_i, point_prev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::math::IVec4;

    fn p(x: i32, z: i32) -> IVec4 {
        IVec4::new(x, 0, z, 0)
    }

    #[test]
    fn proper_crossing_is_detected() {
        assert!(intersect_prop(p(0, 0), p(4, 4), p(0, 4), p(4, 0)));
        assert!(intersect(p(0, 0), p(4, 4), p(0, 4), p(4, 0)));
    }

    #[test]
    fn shared_endpoint_is_improper() {
        assert!(!intersect_prop(p(0, 0), p(4, 0), p(4, 0), p(4, 4)));
        assert!(intersect(p(0, 0), p(4, 0), p(4, 0), p(4, 4)));
    }

    #[test]
    fn disjoint_segments_do_not_intersect() {
        assert!(!intersect(p(0, 0), p(1, 0), p(3, 3), p(4, 3)));
    }

    #[test]
    fn collinear_overlap_is_improper_only() {
        assert!(!intersect_prop(p(0, 0), p(4, 0), p(2, 0), p(6, 0)));
        assert!(intersect(p(0, 0), p(4, 0), p(2, 0), p(6, 0)));
    }
}
