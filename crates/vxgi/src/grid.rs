//! Dense voxel grid with a radiance/opacity mip pyramid.
//!
//! Level 0 is written by voxelization (opacity, normal, surface attributes)
//! and by light injection (radiance). Higher levels are only ever produced by
//! [`VoxelGrid::generate_mips`], each parent texel being the average of its
//! up to eight children. Radiance is stored premultiplied by opacity so that
//! averaging empty and occupied children stays correct.

use std::fmt;

use glam::{IVec3, UVec3, Vec3};
use rayon::prelude::*;

use crate::core::{validate_dims, voxel_size_for, DeviceLimits, VoxelBox, WorldBounds};
use crate::error::{Result, VxgiError};

/// One sample of the pyramid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Texel {
    pub opacity: f32,
    /// Premultiplied by `opacity`.
    pub radiance: Vec3,
    pub normal: Vec3,
}

impl Texel {
    pub const EMPTY: Texel = Texel {
        opacity: 0.0,
        radiance: Vec3::ZERO,
        normal: Vec3::ZERO,
    };

    pub fn is_empty(&self) -> bool {
        self.opacity == 0.0 && self.radiance == Vec3::ZERO
    }

    fn accumulate(&mut self, other: &Texel, weight: f32) {
        self.opacity += other.opacity * weight;
        self.radiance += other.radiance * weight;
        self.normal += other.normal * weight;
    }
}

/// Level-0 material attributes consumed by light injection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VoxelSurface {
    pub albedo: Vec3,
    pub emission: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MipLevel {
    dims: [u32; 3],
    texels: Vec<Texel>,
}

impl MipLevel {
    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    pub fn texels(&self) -> &[Texel] {
        &self.texels
    }

    pub fn len(&self) -> usize {
        self.texels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texels.is_empty()
    }

    pub fn index(&self, c: UVec3) -> usize {
        linear_index(self.dims, c)
    }

    pub fn coord_of(&self, index: usize) -> UVec3 {
        coord_of(self.dims, index)
    }

    pub fn get(&self, c: UVec3) -> Option<&Texel> {
        if c.cmplt(UVec3::from_array(self.dims)).all() {
            self.texels.get(self.index(c))
        } else {
            None
        }
    }

    fn fetch(&self, c: IVec3) -> Texel {
        let dims = IVec3::new(self.dims[0] as i32, self.dims[1] as i32, self.dims[2] as i32);
        if c.cmplt(IVec3::ZERO).any() || c.cmpge(dims).any() {
            return Texel::EMPTY;
        }
        self.texels[linear_index(self.dims, c.as_uvec3())]
    }
}

pub(crate) fn linear_index(dims: [u32; 3], c: UVec3) -> usize {
    (c.x as usize) + (dims[0] as usize) * ((c.y as usize) + (dims[1] as usize) * (c.z as usize))
}

pub(crate) fn coord_of(dims: [u32; 3], index: usize) -> UVec3 {
    let x = index % dims[0] as usize;
    let y = (index / dims[0] as usize) % dims[1] as usize;
    let z = index / (dims[0] as usize * dims[1] as usize);
    UVec3::new(x as u32, y as u32, z as u32)
}

pub(crate) fn level_dims(dims: [u32; 3], level: u32) -> [u32; 3] {
    [
        (dims[0] >> level).max(1),
        (dims[1] >> level).max(1),
        (dims[2] >> level).max(1),
    ]
}

/// Number of levels down to and including 1×1×1.
pub fn mip_count_for(dims: [u32; 3]) -> u32 {
    let largest = dims.iter().copied().max().unwrap_or(1).max(1);
    32 - largest.leading_zeros()
}

fn alloc_zeroed<T: Clone + Default>(len: usize, label: &str) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|e| VxgiError::Allocation(format!("{label}: {e}")))?;
    data.resize(len, T::default());
    Ok(data)
}

#[derive(Clone, PartialEq)]
pub struct VoxelGrid {
    dims: [u32; 3],
    bounds: WorldBounds,
    voxel_size: f32,
    levels: Vec<MipLevel>,
    surface: Vec<VoxelSurface>,
}

impl fmt::Debug for VoxelGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoxelGrid")
            .field("dims", &self.dims)
            .field("bounds", &self.bounds)
            .field("voxel_size", &self.voxel_size)
            .field("mip_count", &self.levels.len())
            .finish()
    }
}

impl VoxelGrid {
    /// Bytes needed for the pyramid and the level-0 surface attributes.
    pub fn required_bytes(dims: [u32; 3]) -> Option<u64> {
        let texel = std::mem::size_of::<Texel>() as u64;
        let surface = std::mem::size_of::<VoxelSurface>() as u64;
        let mut total = 0u64;
        for level in 0..mip_count_for(dims) {
            let d = level_dims(dims, level);
            let count = (d[0] as u64).checked_mul(d[1] as u64)?.checked_mul(d[2] as u64)?;
            total = total.checked_add(count.checked_mul(texel)?)?;
            if level == 0 {
                total = total.checked_add(count.checked_mul(surface)?)?;
            }
        }
        Some(total)
    }

    pub fn allocate(dims: [u32; 3], bounds: WorldBounds, limits: &DeviceLimits) -> Result<Self> {
        validate_dims(dims)?;
        bounds.validate()?;
        let voxel_size = voxel_size_for(dims, &bounds)?;

        let bytes = Self::required_bytes(dims)
            .ok_or_else(|| VxgiError::Allocation(format!("grid {:?} size overflows", dims)))?;
        if bytes > limits.max_grid_bytes {
            return Err(VxgiError::Allocation(format!(
                "grid {:?} needs {} bytes, limit is {} bytes",
                dims, bytes, limits.max_grid_bytes
            )));
        }

        let mip_count = mip_count_for(dims);
        let mut levels = Vec::with_capacity(mip_count as usize);
        for level in 0..mip_count {
            let d = level_dims(dims, level);
            let len = d[0] as usize * d[1] as usize * d[2] as usize;
            levels.push(MipLevel {
                dims: d,
                texels: alloc_zeroed(len, "mip level")?,
            });
        }
        let surface = alloc_zeroed(levels[0].len(), "surface attributes")?;

        log::info!(
            "voxel grid allocated: dims={:?} voxel_size={} mips={} bytes={}",
            dims,
            voxel_size,
            mip_count,
            bytes
        );

        Ok(Self {
            dims,
            bounds,
            voxel_size,
            levels,
            surface,
        })
    }

    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    pub fn bounds(&self) -> WorldBounds {
        self.bounds
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn mip_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn num_voxels(&self) -> u64 {
        self.dims[0] as u64 * self.dims[1] as u64 * self.dims[2] as u64
    }

    pub fn byte_size(&self) -> u64 {
        Self::required_bytes(self.dims).unwrap_or(u64::MAX)
    }

    pub fn level(&self, level: u32) -> Option<&MipLevel> {
        self.levels.get(level as usize)
    }

    pub fn levels(&self) -> &[MipLevel] {
        &self.levels
    }

    pub fn texel(&self, level: u32, c: UVec3) -> Option<&Texel> {
        self.level(level).and_then(|l| l.get(c))
    }

    pub fn surface(&self, c: UVec3) -> Option<&VoxelSurface> {
        if c.cmplt(UVec3::from_array(self.dims)).all() {
            self.surface.get(linear_index(self.dims, c))
        } else {
            None
        }
    }

    /// Level-0 texels and surface attributes, index-aligned.
    pub(crate) fn base_mut(&mut self) -> (&mut [Texel], &mut [VoxelSurface]) {
        (&mut self.levels[0].texels, &mut self.surface)
    }

    pub fn occupied_voxels(&self) -> usize {
        self.levels[0].texels.iter().filter(|t| t.opacity > 0.0).count()
    }

    /// True when every level and every surface attribute is zero.
    pub fn is_cleared(&self) -> bool {
        self.levels.iter().all(|l| l.texels.iter().all(|t| *t == Texel::EMPTY))
            && self.surface.iter().all(|s| *s == VoxelSurface::default())
    }

    pub fn clear(&mut self) {
        for level in &mut self.levels {
            level.texels.par_iter_mut().for_each(|t| *t = Texel::EMPTY);
        }
        self.surface.par_iter_mut().for_each(|s| *s = VoxelSurface::default());
    }

    /// Zeroes a box of level-0 voxels; higher levels are left for the next mip build.
    pub fn clear_region(&mut self, region: VoxelBox) {
        let max = region.max.min(UVec3::from_array(self.dims));
        for z in region.min.z..max.z {
            for y in region.min.y..max.y {
                for x in region.min.x..max.x {
                    let i = linear_index(self.dims, UVec3::new(x, y, z));
                    self.levels[0].texels[i] = Texel::EMPTY;
                    self.surface[i] = VoxelSurface::default();
                }
            }
        }
    }

    /// Continuous grid-space position in voxel units, unclamped.
    pub fn world_to_grid(&self, p: Vec3) -> Vec3 {
        (p - self.bounds.min) / self.voxel_size
    }

    pub fn grid_to_world(&self, g: Vec3) -> Vec3 {
        self.bounds.min + g * self.voxel_size
    }

    pub fn world_to_voxel(&self, p: Vec3) -> Result<UVec3> {
        if !p.is_finite() || !self.bounds.contains(p) {
            return Err(VxgiError::OutOfBounds(format!(
                "position {:?} outside grid bounds {:?}..{:?}",
                p, self.bounds.min, self.bounds.max
            )));
        }
        let g = self.world_to_grid(p).floor().max(Vec3::ZERO).as_uvec3();
        let last = UVec3::from_array(self.dims) - UVec3::ONE;
        Ok(g.min(last))
    }

    /// World-space center of a level-0 voxel.
    pub fn voxel_to_world(&self, c: UVec3) -> Result<Vec3> {
        if c.cmpge(UVec3::from_array(self.dims)).any() {
            return Err(VxgiError::OutOfBounds(format!(
                "voxel {:?} outside grid {:?}",
                c, self.dims
            )));
        }
        Ok(self.grid_to_world(c.as_vec3() + Vec3::splat(0.5)))
    }

    /// Rebuilds every level above 0 from the level below it.
    pub fn generate_mips(&mut self) {
        for level in 1..self.levels.len() {
            let (lower, upper) = self.levels.split_at_mut(level);
            let src = &lower[level - 1];
            let dst = &mut upper[0];
            let dims = dst.dims;
            dst.texels
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, texel)| *texel = downsample(src, coord_of(dims, i)));
        }
    }

    /// Filtered lookup at a level-0 grid position and fractional level of detail.
    pub fn sample(&self, grid_pos: Vec3, lod: f32) -> Texel {
        let max_lod = (self.levels.len() - 1) as f32;
        let lod = if lod.is_finite() { lod.clamp(0.0, max_lod) } else { 0.0 };
        let lower = lod.floor() as u32;
        let t = lod - lower as f32;

        let a = self.sample_level(lower, grid_pos);
        if t <= 0.0 || lower as usize + 1 >= self.levels.len() {
            return a;
        }
        let b = self.sample_level(lower + 1, grid_pos);
        let mut out = Texel::EMPTY;
        out.accumulate(&a, 1.0 - t);
        out.accumulate(&b, t);
        out
    }

    /// Trilinear lookup inside one level. Outside the grid reads as empty.
    pub fn sample_level(&self, level: u32, grid_pos: Vec3) -> Texel {
        let Some(mip) = self.levels.get(level as usize) else {
            return Texel::EMPTY;
        };
        // Axes clamped to one texel shrink slower than 2^level.
        let scale = Vec3::new(
            mip.dims[0] as f32 / self.dims[0] as f32,
            mip.dims[1] as f32 / self.dims[1] as f32,
            mip.dims[2] as f32 / self.dims[2] as f32,
        );
        let p = grid_pos * scale - Vec3::splat(0.5);
        let base = p.floor();
        let f = p - base;
        let base = base.as_ivec3();

        let mut out = Texel::EMPTY;
        for corner in 0..8 {
            let offset = IVec3::new(corner & 1, (corner >> 1) & 1, (corner >> 2) & 1);
            let wx = if offset.x == 1 { f.x } else { 1.0 - f.x };
            let wy = if offset.y == 1 { f.y } else { 1.0 - f.y };
            let wz = if offset.z == 1 { f.z } else { 1.0 - f.z };
            let w = wx * wy * wz;
            if w > 0.0 {
                out.accumulate(&mip.fetch(base + offset), w);
            }
        }
        out
    }
}

fn downsample(src: &MipLevel, parent: UVec3) -> Texel {
    let mut sum = Texel::EMPTY;
    let mut count = 0u32;
    let mut normal = Vec3::ZERO;
    for dz in 0..2 {
        for dy in 0..2 {
            for dx in 0..2 {
                let child = parent * 2 + UVec3::new(dx, dy, dz);
                if let Some(t) = src.get(child) {
                    sum.opacity += t.opacity;
                    sum.radiance += t.radiance;
                    normal += t.normal * t.opacity;
                    count += 1;
                }
            }
        }
    }
    if count == 0 {
        return Texel::EMPTY;
    }
    let inv = 1.0 / count as f32;
    Texel {
        opacity: sum.opacity * inv,
        radiance: sum.radiance * inv,
        normal: normal.normalize_or_zero(),
    }
}
