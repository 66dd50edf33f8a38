//! Dirty-region tracking for incremental re-voxelization.

use std::collections::HashSet;

use glam::{UVec3, Vec3};

use crate::core::{VoxelBox, WorldBounds};

/// Coordinate of a cubic block of `region_dim³` level-0 voxels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl RegionCoord {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn from_voxel(voxel: UVec3, region_dim: u32) -> Self {
        let r = voxel / region_dim;
        Self::new(r.x, r.y, r.z)
    }

    /// Voxel box covered by this region, clipped to the grid.
    pub fn voxel_box(&self, region_dim: u32, dims: [u32; 3]) -> VoxelBox {
        let min = UVec3::new(self.x, self.y, self.z) * region_dim;
        let max = (min + UVec3::splat(region_dim)).min(UVec3::from_array(dims));
        VoxelBox { min, max }
    }
}

/// Tracks which regions of the grid need re-voxelization.
///
/// A HashSet keeps repeated edits of the same region to one rebuild.
#[derive(Clone, Debug)]
pub struct DirtyRegions {
    region_dim: u32,
    regions: HashSet<RegionCoord>,
}

impl DirtyRegions {
    pub fn new(region_dim: u32) -> Self {
        Self {
            region_dim: region_dim.max(1),
            regions: HashSet::new(),
        }
    }

    pub fn region_dim(&self) -> u32 {
        self.region_dim
    }

    /// Returns true if the region was not already dirty.
    pub fn mark(&mut self, coord: RegionCoord) -> bool {
        self.regions.insert(coord)
    }

    /// Marks every region overlapping `area`. Parts of `area` outside the grid are ignored.
    ///
    /// Returns the number of newly dirty regions.
    pub fn mark_bounds(&mut self, area: &WorldBounds, grid_bounds: &WorldBounds, voxel_size: f32, dims: [u32; 3]) -> usize {
        if !area.intersects(grid_bounds) {
            return 0;
        }
        let last = UVec3::from_array(dims) - UVec3::ONE;
        let to_voxel = |p: Vec3| -> UVec3 {
            ((p - grid_bounds.min) / voxel_size)
                .floor()
                .max(Vec3::ZERO)
                .as_uvec3()
                .min(last)
        };
        let lo = RegionCoord::from_voxel(to_voxel(area.min.max(grid_bounds.min)), self.region_dim);
        let hi = RegionCoord::from_voxel(to_voxel(area.max.min(grid_bounds.max)), self.region_dim);

        let mut added = 0;
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    if self.regions.insert(RegionCoord::new(x, y, z)) {
                        added += 1;
                    }
                }
            }
        }
        added
    }

    pub fn is_dirty(&self, coord: RegionCoord) -> bool {
        self.regions.contains(&coord)
    }

    /// Takes all dirty regions in a stable order, clearing the set.
    pub fn take_sorted(&mut self) -> Vec<RegionCoord> {
        let mut regions: Vec<RegionCoord> = self.regions.drain().collect();
        regions.sort_by_key(|r| (r.z, r.y, r.x));
        regions
    }

    pub fn has_dirty(&self) -> bool {
        !self.regions.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.regions.len()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}
