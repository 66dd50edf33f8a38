//! Compressed triangle lists per dirty region.

use std::collections::HashMap;

use glam::Vec3;

use crate::core::MeshInput;
use crate::dirty::RegionCoord;
use crate::grid::VoxelGrid;

#[derive(Debug, Clone)]
pub struct RegionTriangleCsr {
    pub regions: Vec<RegionCoord>,
    /// `regions.len() + 1` prefix offsets into `tri_indices`.
    pub region_offsets: Vec<u32>,
    pub tri_indices: Vec<u32>,
}

impl RegionTriangleCsr {
    pub fn triangles_for(&self, slot: usize) -> &[u32] {
        let start = self.region_offsets[slot] as usize;
        let end = self.region_offsets[slot + 1] as usize;
        &self.tri_indices[start..end]
    }
}

fn region_span(
    tri: &[Vec3; 3],
    grid: &VoxelGrid,
    region_dim: u32,
    epsilon: f32,
) -> Option<([u32; 3], [u32; 3])> {
    if tri.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let v0 = grid.world_to_grid(tri[0]);
    let v1 = grid.world_to_grid(tri[1]);
    let v2 = grid.world_to_grid(tri[2]);
    let min_v = v0.min(v1).min(v2) - Vec3::splat(epsilon);
    let max_v = v0.max(v1).max(v2) + Vec3::splat(epsilon);

    let dims = grid.dims();
    let mut lo = [0u32; 3];
    let mut hi = [0u32; 3];
    for axis in 0..3 {
        let last = dims[axis] as f32 - 1.0;
        if max_v[axis] < 0.0 || min_v[axis] > dims[axis] as f32 {
            return None;
        }
        let min_voxel = min_v[axis].floor().clamp(0.0, last) as u32;
        let max_voxel = max_v[axis].floor().clamp(0.0, last) as u32;
        lo[axis] = min_voxel / region_dim;
        hi[axis] = max_voxel / region_dim;
    }
    Some((lo, hi))
}

/// Bins every triangle into the listed regions it may touch.
pub fn build_region_csr(
    mesh: &MeshInput,
    grid: &VoxelGrid,
    regions: &[RegionCoord],
    region_dim: u32,
    epsilon: f32,
) -> RegionTriangleCsr {
    let slots: HashMap<RegionCoord, usize> =
        regions.iter().enumerate().map(|(slot, r)| (*r, slot)).collect();
    let mut counts = vec![0u32; regions.len()];

    let visit = |tri: &[Vec3; 3], f: &mut dyn FnMut(usize)| {
        let Some((lo, hi)) = region_span(tri, grid, region_dim, epsilon) else {
            return;
        };
        for z in lo[2]..=hi[2] {
            for y in lo[1]..=hi[1] {
                for x in lo[0]..=hi[0] {
                    if let Some(&slot) = slots.get(&RegionCoord::new(x, y, z)) {
                        f(slot);
                    }
                }
            }
        }
    };

    for tri in &mesh.triangles {
        visit(tri, &mut |slot| counts[slot] += 1);
    }

    let mut offsets = vec![0u32; regions.len() + 1];
    for i in 0..regions.len() {
        offsets[i + 1] = offsets[i] + counts[i];
    }

    let mut cursor = offsets.clone();
    let mut tri_indices = vec![0u32; offsets[regions.len()] as usize];
    for (tri_index, tri) in mesh.triangles.iter().enumerate() {
        visit(tri, &mut |slot| {
            tri_indices[cursor[slot] as usize] = tri_index as u32;
            cursor[slot] += 1;
        });
    }

    RegionTriangleCsr {
        regions: regions.to_vec(),
        region_offsets: offsets,
        tri_indices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceLimits, WorldBounds};

    #[test]
    fn csr_invariants_hold() {
        let grid = VoxelGrid::allocate(
            [16, 16, 16],
            WorldBounds::new(Vec3::ZERO, Vec3::splat(16.0)),
            &DeviceLimits::default(),
        )
        .expect("grid");
        let mesh = MeshInput::new(vec![
            [Vec3::new(0.1, 0.1, 0.1), Vec3::new(1.2, 0.1, 0.1), Vec3::new(0.1, 1.2, 0.1)],
            [Vec3::new(9.0, 9.0, 9.0), Vec3::new(10.0, 9.0, 9.0), Vec3::new(9.0, 10.0, 9.0)],
            [Vec3::new(6.0, 1.0, 1.0), Vec3::new(10.0, 1.0, 1.0), Vec3::new(6.0, 2.0, 1.0)],
            [Vec3::splat(40.0), Vec3::splat(41.0), Vec3::new(40.0, 41.0, 40.0)],
        ]);
        let regions = [RegionCoord::new(0, 0, 0), RegionCoord::new(1, 0, 0)];
        let csr = build_region_csr(&mesh, &grid, &regions, 8, 1e-4);

        assert_eq!(csr.region_offsets[0], 0);
        for window in csr.region_offsets.windows(2) {
            assert!(window[0] <= window[1]);
        }
        assert_eq!(
            csr.region_offsets.last().copied(),
            Some(csr.tri_indices.len() as u32)
        );
        assert_eq!(csr.triangles_for(0), &[0, 2]);
        assert_eq!(csr.triangles_for(1), &[2]);
    }
}
