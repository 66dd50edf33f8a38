//! Direct-light injection into occupied voxels, followed by mip generation.

use glam::Vec3;
use rayon::prelude::*;

use crate::core::{Light, VxgiConfig};
use crate::error::Result;
use crate::grid::{coord_of, Texel, VoxelSurface};
use crate::stats::InjectionStats;

use super::{FrameStage, PassContext, PassKind, VxgiPass};

#[derive(Debug, Default)]
pub struct RadianceInjectionPass;

impl RadianceInjectionPass {
    pub fn new() -> Self {
        Self
    }
}

impl VxgiPass for RadianceInjectionPass {
    fn kind(&self) -> PassKind {
        PassKind::RadianceInjection
    }

    fn dependencies(&self) -> &'static [PassKind] {
        &[PassKind::Voxelization]
    }

    fn configure(&mut self, _config: &VxgiConfig) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut PassContext<'_>) -> Result<()> {
        ctx.begin_stage(FrameStage::Injecting)?;
        let lights = &ctx.frame.scene.lights;
        let dims = ctx.grid.dims();
        let origin = ctx.grid.bounds().min;
        let voxel = ctx.grid.voxel_size();

        let (texels, surface) = ctx.grid.base_mut();
        let voxels_lit: usize = texels
            .par_iter_mut()
            .zip(surface.par_iter())
            .enumerate()
            .map(|(i, (texel, surf))| {
                if texel.opacity <= 0.0 {
                    return 0;
                }
                let center = origin + (coord_of(dims, i).as_vec3() + Vec3::splat(0.5)) * voxel;
                texel.radiance = voxel_radiance(texel, surf, center, voxel, lights);
                1
            })
            .sum();

        let stats = InjectionStats {
            lights: lights.len(),
            voxels_lit,
            mip_levels_built: ctx.grid.mip_count() - 1,
        };

        ctx.begin_stage(FrameStage::MipGenerating)?;
        ctx.grid.generate_mips();

        log::debug!(
            "vxgi: injected {} lights into {} voxels",
            stats.lights,
            stats.voxels_lit
        );
        ctx.outputs.stats.injection = stats;
        Ok(())
    }
}

/// Emission plus shadowed diffuse response to every light, premultiplied by opacity.
fn voxel_radiance(texel: &Texel, surface: &VoxelSurface, center: Vec3, voxel: f32, lights: &[Light]) -> Vec3 {
    let mut radiance = surface.emission * texel.opacity;
    let n = texel.normal;
    for light in lights {
        let (to_light, attenuation) = light.incidence(center);
        let n_dot_l = n.dot(to_light).max(0.0);
        if n_dot_l <= 0.0 || attenuation <= 0.0 {
            continue;
        }
        let visibility = light
            .shadow
            .as_ref()
            .map_or(1.0, |map| map.visibility(center + n * voxel));
        radiance += surface.albedo
            * light.color
            * light.intensity
            * n_dot_l
            * attenuation
            * visibility
            * texel.opacity;
    }
    radiance
}
