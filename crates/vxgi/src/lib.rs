//! Voxel cone traced global illumination.
//!
//! Each frame the scene's triangles are voxelized into a dense grid, direct
//! light is injected into the occupied voxels, a mip pyramid is built, and
//! every visible surface fragment cone-traces that pyramid for diffuse and
//! specular indirect light.
//!
//! # Example
//!
//! ```
//! use glam::Vec3;
//! use vxgi::{Camera, GBuffer, HealthyDevice, RenderContext, Scene, VxgiConfig, VxgiPipeline};
//!
//! let config = VxgiConfig { dims: [16, 16, 16], ..VxgiConfig::default() };
//! let mut pipeline = VxgiPipeline::new(config)?;
//!
//! let scene = Scene::default();
//! let gbuffer = GBuffer::new(4, 4);
//! let frame = RenderContext::new(&scene, Camera::new(Vec3::ZERO), &gbuffer, &HealthyDevice);
//! let result = pipeline.render(&frame)?;
//! assert!(result.status.is_complete());
//! # Ok::<(), vxgi::VxgiError>(())
//! ```

pub mod cone;
pub mod core;
pub mod csr;
pub mod dirty;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod grid;
pub mod passes;
pub mod pipeline;
pub mod raster;
pub mod shadow;
pub mod stats;

pub use crate::core::{
    Camera, ConeConfig, DeviceLimits, Light, LightKind, Material, MeshInput, RevoxelizationMode,
    Scene, VoxelBox, VxgiConfig, WorldBounds,
};
pub use crate::error::{Result, VxgiError};
pub use crate::frame::{
    DeviceLostFlag, DeviceProbe, GBuffer, HealthyDevice, RenderContext, ResolvedFrame,
    SurfaceSample,
};
pub use crate::gpu::{GpuVoxelVolume, VolumeUniform};
pub use crate::grid::{MipLevel, Texel, VoxelGrid};
pub use crate::passes::{FrameStage, PassContext, PassKind, VxgiPass};
pub use crate::pipeline::{Fallback, FrameResult, FrameStatus, VxgiPipeline};
pub use crate::shadow::ShadowMap;
pub use crate::stats::{FrameStats, PipelineStats};
