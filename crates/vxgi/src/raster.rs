//! Conservative triangle rasterization into grid space.
//!
//! Triangles are swept over the plane perpendicular to their dominant axis;
//! for each footprint cell the plane's depth range bounds the voxel run that
//! is then confirmed with an exact triangle/box separating-axis test.

use glam::{UVec3, Vec3};

use crate::core::VoxelBox;

pub(crate) fn triangle_box_overlap(box_center: Vec3, box_half: Vec3, v0: Vec3, v1: Vec3, v2: Vec3) -> bool {
    let v0 = v0 - box_center;
    let v1 = v1 - box_center;
    let v2 = v2 - box_center;

    let e0 = v1 - v0;
    let e1 = v2 - v1;
    let e2 = v0 - v2;

    let axes = [
        Vec3::new(0.0, -e0.z, e0.y),
        Vec3::new(0.0, -e1.z, e1.y),
        Vec3::new(0.0, -e2.z, e2.y),
        Vec3::new(e0.z, 0.0, -e0.x),
        Vec3::new(e1.z, 0.0, -e1.x),
        Vec3::new(e2.z, 0.0, -e2.x),
        Vec3::new(-e0.y, e0.x, 0.0),
        Vec3::new(-e1.y, e1.x, 0.0),
        Vec3::new(-e2.y, e2.x, 0.0),
    ];

    for axis in axes.iter() {
        let p0 = v0.dot(*axis);
        let p1 = v1.dot(*axis);
        let p2 = v2.dot(*axis);
        let min_p = p0.min(p1.min(p2));
        let max_p = p0.max(p1.max(p2));
        let r = box_half.dot(axis.abs());
        if min_p > r || max_p < -r {
            return false;
        }
    }

    let tri_min = v0.min(v1).min(v2);
    let tri_max = v0.max(v1).max(v2);
    if tri_min.cmpgt(box_half).any() || tri_max.cmplt(-box_half).any() {
        return false;
    }

    let normal = e0.cross(e1);
    let d = normal.dot(v0);
    let r = box_half.dot(normal.abs());
    d.abs() <= r
}

/// Index of the normal component with the largest magnitude.
pub fn dominant_axis(normal: Vec3) -> usize {
    let a = normal.abs();
    if a.x >= a.y && a.x >= a.z {
        0
    } else if a.y >= a.z {
        1
    } else {
        2
    }
}

/// Result of rasterizing one triangle.
#[derive(Debug, Clone, PartialEq)]
pub enum Coverage {
    Voxels(Vec<UVec3>),
    /// Zero-area triangle.
    Degenerate,
    /// Triangle bounds miss the clip box entirely.
    Outside,
}

/// Rasterizes a grid-space triangle into the voxels of `clip` it touches.
pub fn rasterize_triangle(tri: [Vec3; 3], clip: VoxelBox, epsilon: f32) -> Coverage {
    let [v0, v1, v2] = tri;
    let normal = (v1 - v0).cross(v2 - v0);
    if !normal.is_finite() || normal.length_squared() <= epsilon * epsilon {
        return Coverage::Degenerate;
    }

    let lo = v0.min(v1).min(v2) - Vec3::splat(epsilon);
    let hi = v0.max(v1).max(v2) + Vec3::splat(epsilon);
    let clip_lo = clip.min.as_vec3();
    let clip_hi = clip.max.as_vec3();
    if clip.is_empty() || hi.cmplt(clip_lo).any() || lo.cmpgt(clip_hi).any() {
        return Coverage::Outside;
    }

    let min = lo.floor().max(clip_lo).as_uvec3();
    let max = hi.floor().min(clip_hi - Vec3::ONE).max(clip_lo).as_uvec3();

    let axis = dominant_axis(normal);
    let (u, v) = match axis {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    let plane_d = normal.dot(v0);
    let half = Vec3::splat(0.5);
    let mut voxels = Vec::new();

    for j in min[v]..=max[v] {
        for i in min[u]..=max[u] {
            // Depth of the plane at the four corners of the footprint cell.
            let mut depth_lo = f32::INFINITY;
            let mut depth_hi = f32::NEG_INFINITY;
            for (cu, cv) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
                let pu = i as f32 + cu;
                let pv = j as f32 + cv;
                let depth = (plane_d - normal[u] * pu - normal[v] * pv) / normal[axis];
                depth_lo = depth_lo.min(depth);
                depth_hi = depth_hi.max(depth);
            }
            let depth_lo = depth_lo.max(lo[axis]);
            let depth_hi = depth_hi.min(hi[axis]);
            if depth_lo > depth_hi {
                continue;
            }
            let k_lo = (depth_lo - epsilon).floor().max(min[axis] as f32) as u32;
            let k_hi = (depth_hi + epsilon).floor().min(max[axis] as f32) as u32;

            for k in k_lo..=k_hi {
                let mut c = UVec3::ZERO;
                c[axis] = k;
                c[u] = i;
                c[v] = j;
                let center = c.as_vec3() + half;
                if triangle_box_overlap(center, half, v0, v1, v2) {
                    voxels.push(c);
                }
            }
        }
    }

    if voxels.is_empty() {
        Coverage::Outside
    } else {
        Coverage::Voxels(voxels)
    }
}

/// Barycentric weights of the point on the triangle closest to `p`'s
/// projection onto the triangle plane, clamped to the triangle.
pub fn clamped_barycentric(p: Vec3, tri: [Vec3; 3]) -> Vec3 {
    let [a, b, c] = tri;
    let v0 = b - a;
    let v1 = c - a;
    let v2 = p - a;
    let d00 = v0.dot(v0);
    let d01 = v0.dot(v1);
    let d11 = v1.dot(v1);
    let d20 = v2.dot(v0);
    let d21 = v2.dot(v1);
    let denom = d00 * d11 - d01 * d01;
    if denom.abs() <= f32::EPSILON {
        return Vec3::splat(1.0 / 3.0);
    }
    let v = (d11 * d20 - d01 * d21) / denom;
    let w = (d00 * d21 - d01 * d20) / denom;
    let bary = Vec3::new(1.0 - v - w, v, w).max(Vec3::ZERO);
    let sum = bary.x + bary.y + bary.z;
    if sum <= f32::EPSILON {
        Vec3::splat(1.0 / 3.0)
    } else {
        bary / sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(n: u32) -> VoxelBox {
        VoxelBox::full([n, n, n])
    }

    #[test]
    fn dominant_axis_picks_largest_component() {
        assert_eq!(dominant_axis(Vec3::new(0.1, -0.9, 0.2)), 1);
        assert_eq!(dominant_axis(Vec3::new(-3.0, 1.0, 2.0)), 0);
        assert_eq!(dominant_axis(Vec3::new(0.0, 0.0, 1.0)), 2);
    }

    #[test]
    fn voxelizes_single_triangle() {
        let tri = [
            Vec3::new(0.1, 0.1, 0.1),
            Vec3::new(1.2, 0.1, 0.1),
            Vec3::new(0.1, 1.2, 0.1),
        ];
        let Coverage::Voxels(voxels) = rasterize_triangle(tri, full(4), 1e-4) else {
            panic!("expected coverage");
        };
        assert!(voxels.contains(&UVec3::new(0, 0, 0)));
        assert!(voxels.iter().all(|c| c.z == 0));
    }

    #[test]
    fn axis_aligned_quad_covers_a_single_layer() {
        let y = 2.5;
        let a = Vec3::new(1.2, y, 1.2);
        let b = Vec3::new(2.8, y, 1.2);
        let c = Vec3::new(2.8, y, 2.8);
        let d = Vec3::new(1.2, y, 2.8);
        let mut covered = Vec::new();
        for tri in [[a, b, c], [a, c, d]] {
            if let Coverage::Voxels(v) = rasterize_triangle(tri, full(8), 1e-4) {
                covered.extend(v);
            }
        }
        covered.sort_by_key(|c| (c.z, c.y, c.x));
        covered.dedup();
        assert_eq!(covered.len(), 4);
        assert!(covered.iter().all(|c| c.y == 2));
    }

    #[test]
    fn slanted_triangle_has_no_gaps() {
        // Every column the triangle spans must receive at least one voxel.
        let tri = [
            Vec3::new(0.5, 0.5, 0.5),
            Vec3::new(7.5, 3.5, 0.5),
            Vec3::new(0.5, 0.5, 7.5),
        ];
        let Coverage::Voxels(voxels) = rasterize_triangle(tri, full(8), 1e-4) else {
            panic!("expected coverage");
        };
        for x in 0..8 {
            assert!(voxels.iter().any(|c| c.x == x), "missing column x={x}");
        }
    }

    #[test]
    fn degenerate_and_outside_triangles_are_reported() {
        let line = [Vec3::ZERO, Vec3::ONE, Vec3::splat(2.0)];
        assert_eq!(rasterize_triangle(line, full(4), 1e-4), Coverage::Degenerate);

        let far = [
            Vec3::new(10.0, 10.0, 10.0),
            Vec3::new(11.0, 10.0, 10.0),
            Vec3::new(10.0, 11.0, 10.0),
        ];
        assert_eq!(rasterize_triangle(far, full(4), 1e-4), Coverage::Outside);

        let nan = [Vec3::new(f32::NAN, 1.0, 1.0), Vec3::new(2.0, 1.0, 1.0), Vec3::new(1.0, 2.0, 1.0)];
        assert_eq!(rasterize_triangle(nan, full(4), 1e-4), Coverage::Degenerate);
        let inf = [Vec3::ONE, Vec3::new(f32::INFINITY, 1.0, 1.0), Vec3::new(1.0, 2.0, 1.0)];
        assert_eq!(rasterize_triangle(inf, full(4), 1e-4), Coverage::Degenerate);
    }

    #[test]
    fn clip_box_restricts_output() {
        let tri = [
            Vec3::new(0.5, 0.5, 0.5),
            Vec3::new(7.5, 0.5, 0.5),
            Vec3::new(0.5, 7.5, 0.5),
        ];
        let clip = VoxelBox {
            min: UVec3::new(4, 0, 0),
            max: UVec3::new(8, 4, 4),
        };
        let Coverage::Voxels(voxels) = rasterize_triangle(tri, clip, 1e-4) else {
            panic!("expected coverage");
        };
        assert!(voxels.iter().all(|c| clip.contains(*c)));
    }

    #[test]
    fn barycentric_of_vertex_and_outside_point() {
        let tri = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let at_b = clamped_barycentric(Vec3::X, tri);
        assert!((at_b - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-5);
        let outside = clamped_barycentric(Vec3::new(-1.0, -1.0, 0.0), tri);
        assert!((outside.x + outside.y + outside.z - 1.0).abs() < 1e-5);
        assert!(outside.min_element() >= 0.0);
    }
}
