//! Upload of the finished radiance pyramid to a wgpu 3D texture.
//!
//! The CPU pipeline produces the grid; a lighting shader on the host side
//! samples it through [`GpuVoxelVolume`] and reads its placement from the
//! [`VolumeUniform`] block.

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::core::VxgiConfig;
use crate::error::{Result, VxgiError};
use crate::grid::{MipLevel, VoxelGrid};

pub const VOLUME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

/// One texel as laid out in the 3D texture.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuTexel {
    /// Premultiplied by opacity, as stored in the grid.
    pub radiance: [f32; 3],
    pub opacity: f32,
}

/// Uniform block describing the volume to a cone tracing shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct VolumeUniform {
    /// xyz = world min, w = voxel size.
    pub bounds_min: [f32; 4],
    /// xyz = world max, w = mip count.
    pub bounds_max: [f32; 4],
    /// xyz = level-0 dims, w = diffuse cone count.
    pub dims: [u32; 4],
    /// diffuse aperture, specular min aperture, step scale, opacity saturation.
    pub cone: [f32; 4],
    /// max trace distance, indirect intensity, specular enabled, unused.
    pub trace: [f32; 4],
}

impl VolumeUniform {
    pub fn new(grid: &VoxelGrid, config: &VxgiConfig) -> Self {
        let b = grid.bounds();
        let d = grid.dims();
        let cones = &config.cones;
        Self {
            bounds_min: [b.min.x, b.min.y, b.min.z, grid.voxel_size()],
            bounds_max: [b.max.x, b.max.y, b.max.z, grid.mip_count() as f32],
            dims: [d[0], d[1], d[2], cones.diffuse_cones],
            cone: [
                cones.diffuse_aperture,
                cones.specular_min_aperture,
                cones.step_scale,
                cones.opacity_saturation,
            ],
            trace: [
                config.max_trace_distance,
                cones.indirect_intensity,
                if cones.specular { 1.0 } else { 0.0 },
                0.0,
            ],
        }
    }
}

/// Converts one mip level to texture order (x fastest, then y, then z).
pub fn pack_level_rgba(level: &MipLevel) -> Vec<GpuTexel> {
    level
        .texels()
        .iter()
        .map(|t| GpuTexel {
            radiance: t.radiance.to_array(),
            opacity: t.opacity,
        })
        .collect()
}

/// 3D texture holding every level of the pyramid plus its uniform buffer.
pub struct GpuVoxelVolume {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    uniform: wgpu::Buffer,
    dims: [u32; 3],
    mip_count: u32,
}

impl GpuVoxelVolume {
    /// Allocates a volume matching `grid`.
    pub fn new(device: &wgpu::Device, grid: &VoxelGrid, config: &VxgiConfig) -> Result<Self> {
        let dims = grid.dims();
        let max_dim = device.limits().max_texture_dimension_3d;
        if dims.iter().any(|&d| d > max_dim) {
            return Err(VxgiError::Allocation(format!(
                "grid {:?} exceeds max 3D texture dimension {}",
                dims, max_dim
            )));
        }

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("vxgi.volume"),
            size: wgpu::Extent3d {
                width: dims[0],
                height: dims[1],
                depth_or_array_layers: dims[2],
            },
            mip_level_count: grid.mip_count(),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: VOLUME_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("vxgi.volume.view"),
            ..Default::default()
        });
        let uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("vxgi.volume.uniform"),
            contents: bytemuck::bytes_of(&VolumeUniform::new(grid, config)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        log::info!("vxgi: allocated {:?} volume texture with {} mips", dims, grid.mip_count());
        Ok(Self {
            texture,
            view,
            uniform,
            dims,
            mip_count: grid.mip_count(),
        })
    }

    /// Writes every level of `grid` and refreshes the uniform block.
    pub fn upload(&self, queue: &wgpu::Queue, grid: &VoxelGrid, config: &VxgiConfig) -> Result<()> {
        if grid.dims() != self.dims || grid.mip_count() != self.mip_count {
            return Err(VxgiError::Configuration(format!(
                "grid {:?} does not match volume {:?}; recreate the volume after a resize",
                grid.dims(),
                self.dims
            )));
        }

        for (mip, level) in grid.levels().iter().enumerate() {
            let [w, h, d] = level.dims();
            let texels = pack_level_rgba(level);
            queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &self.texture,
                    mip_level: mip as u32,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                bytemuck::cast_slice(&texels),
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(w * std::mem::size_of::<GpuTexel>() as u32),
                    rows_per_image: Some(h),
                },
                wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: d,
                },
            );
        }
        queue.write_buffer(&self.uniform, 0, bytemuck::bytes_of(&VolumeUniform::new(grid, config)));
        Ok(())
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn uniform_buffer(&self) -> &wgpu::Buffer {
        &self.uniform
    }

    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }
}
