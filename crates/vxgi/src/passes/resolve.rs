//! Cone-traced indirect lighting for every G-buffer fragment.

use glam::{Mat3, Vec3};
use rayon::prelude::*;

use crate::cone::{specular_aperture, tangent_frame, trace_cone, ConeParams, ConeSet};
use crate::core::{ConeConfig, VxgiConfig};
use crate::error::Result;
use crate::frame::{ResolvedFrame, SurfaceSample};
use crate::grid::VoxelGrid;
use crate::stats::ResolveStats;

use super::{FrameStage, PassContext, PassKind, VxgiPass};

/// What tracing one fragment produced.
#[derive(Clone, Copy, Debug, Default)]
struct FragmentTrace {
    indirect: Vec3,
    cones: usize,
    steps: u64,
    outside: bool,
}

#[derive(Debug, Default)]
pub struct ConeTracingResolvePass {
    cones: ConeSet,
    config: ConeConfig,
    max_distance: f32,
}

impl ConeTracingResolvePass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffuse cones in use after the last `configure`.
    pub fn cone_set(&self) -> &ConeSet {
        &self.cones
    }
}

impl VxgiPass for ConeTracingResolvePass {
    fn kind(&self) -> PassKind {
        PassKind::ConeTracingResolve
    }

    fn dependencies(&self) -> &'static [PassKind] {
        &[PassKind::Voxelization, PassKind::RadianceInjection]
    }

    fn configure(&mut self, config: &VxgiConfig) -> Result<()> {
        config.cones.validate()?;
        self.cones = ConeSet::from_config(&config.cones);
        self.config = config.cones.clone();
        self.max_distance = config.max_trace_distance;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut PassContext<'_>) -> Result<()> {
        ctx.begin_stage(FrameStage::Resolving)?;
        let grid: &VoxelGrid = ctx.grid;
        let gbuffer = ctx.frame.gbuffer;
        let eye = ctx.frame.camera.position;

        let traces: Vec<FragmentTrace> = gbuffer
            .samples()
            .par_iter()
            .map(|sample| match sample {
                Some(s) => self.trace_fragment(grid, eye, s),
                None => FragmentTrace::default(),
            })
            .collect();

        let mut stats = ResolveStats::default();
        for t in &traces {
            if t.outside {
                stats.fragments_outside += 1;
            } else if t.cones > 0 {
                stats.fragments_traced += 1;
            }
            stats.cones_traced += t.cones;
            stats.cone_steps += t.steps;
        }
        if stats.fragments_outside > 0 {
            log::warn!(
                "vxgi: {} fragments outside the voxel grid received no indirect light",
                stats.fragments_outside
            );
        }
        log::debug!(
            "vxgi: traced {} cones for {} fragments",
            stats.cones_traced,
            stats.fragments_traced
        );

        let indirect = traces.into_iter().map(|t| t.indirect).collect();
        ctx.outputs.image = Some(ResolvedFrame::from_indirect(gbuffer, indirect));
        ctx.outputs.stats.resolve = stats;
        Ok(())
    }
}

impl ConeTracingResolvePass {
    fn trace_fragment(&self, grid: &VoxelGrid, eye: Vec3, s: &SurfaceSample) -> FragmentTrace {
        if !grid.bounds().contains(s.position) {
            return FragmentTrace {
                outside: true,
                ..FragmentTrace::default()
            };
        }
        let n = s.normal.normalize_or_zero();
        if n == Vec3::ZERO {
            return FragmentTrace::default();
        }

        let origin = s.position + n * grid.voxel_size();
        let frame: Mat3 = tangent_frame(n);
        let mut out = FragmentTrace::default();

        let mut diffuse = Vec3::ZERO;
        for cone in &self.cones.diffuse {
            let params = ConeParams::from_config(origin, frame * cone.direction, cone.aperture, self.max_distance, &self.config);
            let trace = trace_cone(grid, &params);
            diffuse += cone.weight * trace.radiance;
            out.cones += 1;
            out.steps += trace.steps as u64;
        }

        let roughness = s.roughness.clamp(0.0, 1.0);
        let specular_weight = 1.0 - roughness;
        let mut specular = Vec3::ZERO;
        let incident = (s.position - eye).normalize_or_zero();
        if self.config.specular && specular_weight > 0.0 && incident != Vec3::ZERO {
            let reflected = incident - 2.0 * incident.dot(n) * n;
            let aperture = specular_aperture(roughness, self.config.specular_min_aperture);
            let params = ConeParams::from_config(origin, reflected, aperture, self.max_distance, &self.config);
            let trace = trace_cone(grid, &params);
            specular = trace.radiance;
            out.cones += 1;
            out.steps += trace.steps as u64;
        }

        out.indirect = self.config.indirect_intensity * (s.albedo * diffuse + specular_weight * specular);
        out
    }
}
