//! VxgiPipeline - owns the voxel grid and drives the per-frame passes.

use crate::core::{RevoxelizationMode, VxgiConfig, WorldBounds};
use crate::dirty::DirtyRegions;
use crate::error::{Result, VxgiError};
use crate::frame::{RenderContext, ResolvedFrame};
use crate::grid::VoxelGrid;
use crate::passes::{default_passes, FrameStage, PassContext, PassKind, VoxelizationPlan, VxgiPass};
use crate::stats::{FrameStats, PipelineStats};

/// Where a dropped frame's image came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fallback {
    /// Indirect light of the last completed frame over this frame's direct light.
    PreviousFrame,
    /// Flat ambient term.
    Ambient,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    /// A recoverable failure stopped the frame at `stage`.
    Dropped { stage: FrameStage, fallback: Fallback },
}

impl FrameStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, FrameStatus::Complete)
    }
}

/// Outcome of one [`VxgiPipeline::render`] call.
#[derive(Clone, Debug)]
pub struct FrameResult {
    pub frame_index: u64,
    pub status: FrameStatus,
    pub image: ResolvedFrame,
    pub stats: FrameStats,
    /// Stages entered, in order.
    pub stages: Vec<FrameStage>,
}

/// Voxel cone tracing pipeline.
///
/// Handles:
/// - Grid ownership and reallocation on resize
/// - Ordered pass registration with dependency checks
/// - Full or incremental re-voxelization
/// - Dropped frames and their fallback images
pub struct VxgiPipeline {
    config: VxgiConfig,
    grid: VoxelGrid,
    passes: Vec<Box<dyn VxgiPass>>,
    dirty: DirtyRegions,
    /// Forces the next voxelization to rebuild the whole grid.
    needs_full: bool,
    frame_index: u64,
    last_image: Option<ResolvedFrame>,
    stats: PipelineStats,
}

impl VxgiPipeline {
    /// Create a pipeline with the default voxelize, inject and resolve passes.
    pub fn new(config: VxgiConfig) -> Result<Self> {
        Self::with_passes(config, default_passes())
    }

    /// Create a pipeline with a custom pass list, registered in order.
    pub fn with_passes(config: VxgiConfig, passes: Vec<Box<dyn VxgiPass>>) -> Result<Self> {
        config.validate()?;
        let grid = VoxelGrid::allocate(config.dims, config.bounds, &config.limits)?;
        let mut pipeline = Self {
            dirty: DirtyRegions::new(config.region_dim),
            config,
            grid,
            passes: Vec::with_capacity(passes.len()),
            needs_full: true,
            frame_index: 0,
            last_image: None,
            stats: PipelineStats::default(),
        };
        for pass in passes {
            pipeline.add_pass(pass)?;
        }
        Ok(pipeline)
    }

    // ========================================================================
    // Pass Registration
    // ========================================================================

    /// Register a pass after the existing ones.
    ///
    /// Every dependency must already be registered and each kind may only
    /// appear once.
    pub fn add_pass(&mut self, mut pass: Box<dyn VxgiPass>) -> Result<()> {
        let kind = pass.kind();
        if self.has_pass(kind) {
            return Err(VxgiError::Configuration(format!(
                "pass {:?} is already registered",
                kind
            )));
        }
        if let Some(missing) = pass.dependencies().iter().find(|dep| !self.has_pass(**dep)) {
            return Err(VxgiError::Configuration(format!(
                "pass {:?} depends on {:?}, which must be registered first",
                kind, missing
            )));
        }
        pass.configure(&self.config)?;
        log::debug!("vxgi: registered pass {:?}", kind);
        self.passes.push(pass);
        Ok(())
    }

    fn has_pass(&self, kind: PassKind) -> bool {
        self.passes.iter().any(|p| p.kind() == kind)
    }

    /// Registered pass kinds in execution order.
    pub fn pass_kinds(&self) -> Vec<PassKind> {
        self.passes.iter().map(|p| p.kind()).collect()
    }

    // ========================================================================
    // Frame
    // ========================================================================

    /// Run every pass for one frame.
    ///
    /// Recoverable failures drop the frame and return a fallback image; fatal
    /// ones are returned as errors. Either way the pipeline ends up `Idle`.
    pub fn render(&mut self, frame: &RenderContext<'_>) -> Result<FrameResult> {
        let frame_index = self.frame_index;
        self.frame_index += 1;
        let plan = self.take_plan();
        let full = plan.is_full();

        let mut ctx = PassContext::new(&mut self.grid, *frame, &self.config, plan);
        let mut outcome = Ok(());
        for pass in self.passes.iter_mut() {
            if let Err(err) = pass.execute(&mut ctx) {
                outcome = Err(err);
                break;
            }
        }
        let failed_at = ctx.stage();
        ctx.end_frame();
        let outputs = ctx.into_outputs();
        self.stats.last_frame = outputs.stats.clone();

        match outcome {
            Ok(()) => {
                let image = outputs
                    .image
                    .unwrap_or_else(|| ResolvedFrame::ambient(frame.gbuffer, self.config.ambient));
                self.last_image = Some(image.clone());
                self.needs_full = false;
                self.stats.frames_completed += 1;
                if outputs.stages.contains(&FrameStage::Voxelizing) {
                    if full {
                        self.stats.full_voxelizations += 1;
                    } else {
                        self.stats.incremental_voxelizations += 1;
                    }
                }
                Ok(FrameResult {
                    frame_index,
                    status: FrameStatus::Complete,
                    image,
                    stats: outputs.stats,
                    stages: outputs.stages,
                })
            }
            Err(err) if err.is_frame_recoverable() => {
                let stage = match err {
                    VxgiError::DeviceLost { stage } => stage,
                    _ => failed_at,
                };
                self.needs_full = true;
                self.stats.frames_dropped += 1;
                let (image, fallback) = match self.last_image.as_ref().and_then(|prev| prev.recomposite(frame.gbuffer)) {
                    Some(image) => (image, Fallback::PreviousFrame),
                    None => (ResolvedFrame::ambient(frame.gbuffer, self.config.ambient), Fallback::Ambient),
                };
                log::warn!("vxgi: frame {} dropped at {:?}: {} ({:?} fallback)", frame_index, stage, err, fallback);
                Ok(FrameResult {
                    frame_index,
                    status: FrameStatus::Dropped { stage, fallback },
                    image,
                    stats: outputs.stats,
                    stages: outputs.stages,
                })
            }
            Err(err) => {
                self.needs_full = true;
                log::warn!("vxgi: frame {} failed: {}", frame_index, err);
                Err(err)
            }
        }
    }

    fn take_plan(&mut self) -> VoxelizationPlan {
        if self.needs_full || self.config.revoxelization == RevoxelizationMode::Full {
            self.dirty.clear();
            return VoxelizationPlan::Full;
        }
        VoxelizationPlan::Regions(self.dirty.take_sorted())
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Flag every region overlapping `area` for re-voxelization.
    ///
    /// Returns the number of newly dirty regions.
    pub fn mark_region_dirty(&mut self, area: &WorldBounds) -> usize {
        self.dirty.mark_bounds(area, &self.grid.bounds(), self.grid.voxel_size(), self.grid.dims())
    }

    /// Force a full re-voxelization on the next frame.
    pub fn invalidate(&mut self) {
        self.needs_full = true;
    }

    /// Reallocate the grid. On failure the current grid and config are kept.
    pub fn resize(&mut self, dims: [u32; 3], bounds: WorldBounds) -> Result<()> {
        let config = VxgiConfig {
            dims,
            bounds,
            ..self.config.clone()
        };
        config.validate()?;
        let grid = VoxelGrid::allocate(dims, bounds, &config.limits)?;
        for pass in self.passes.iter_mut() {
            pass.configure(&config)?;
        }
        log::info!("vxgi: resized grid to {:?} over {:?}..{:?}", dims, bounds.min, bounds.max);
        self.grid = grid;
        self.config = config;
        self.dirty = DirtyRegions::new(self.config.region_dim);
        self.needs_full = true;
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Stage the pipeline is in between calls.
    ///
    /// `render` holds `&mut self` for the whole frame and always returns to
    /// `Idle`; the stage of a frame in flight lives on its [`PassContext`].
    pub fn state(&self) -> FrameStage {
        FrameStage::Idle
    }

    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }

    pub fn config(&self) -> &VxgiConfig {
        &self.config
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Number of frames rendered so far, dropped ones included.
    pub fn frame_count(&self) -> u64 {
        self.frame_index
    }

    pub fn dirty_region_count(&self) -> usize {
        self.dirty.dirty_count()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use glam::{UVec3, Vec3};

    use super::*;
    use crate::core::{Camera, Light, Material, MeshInput, Scene};
    use crate::frame::{DeviceLostFlag, DeviceProbe, GBuffer, HealthyDevice, SurfaceSample};
    use crate::passes::{RadianceInjectionPass, VoxelizationPass};

    /// Loses the device the first time `stage` is entered.
    struct LoseOnce {
        stage: FrameStage,
        tripped: Cell<bool>,
    }

    impl LoseOnce {
        fn at(stage: FrameStage) -> Self {
            Self {
                stage,
                tripped: Cell::new(false),
            }
        }
    }

    impl DeviceProbe for LoseOnce {
        fn check(&self, stage: FrameStage) -> Result<()> {
            if stage == self.stage && !self.tripped.replace(true) {
                return Err(VxgiError::DeviceLost { stage });
            }
            Ok(())
        }
    }

    fn quad(center: Vec3, normal: Vec3, half: f32) -> [[Vec3; 3]; 2] {
        let u = normal.any_orthonormal_vector() * half;
        let v = normal.cross(u);
        let a = center - u - v;
        let b = center + u - v;
        let c = center + u + v;
        let d = center - u + v;
        [[a, b, c], [a, c, d]]
    }

    fn unit_cube() -> MeshInput {
        let mut triangles = Vec::new();
        for n in [Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z] {
            triangles.extend(quad(n * 0.5, n, 0.5));
        }
        MeshInput::new(triangles)
    }

    fn cube_config() -> VxgiConfig {
        VxgiConfig {
            dims: [32, 32, 32],
            bounds: WorldBounds::new(Vec3::splat(-4.0), Vec3::splat(4.0)),
            ..VxgiConfig::default()
        }
    }

    fn cube_scene() -> Scene {
        Scene {
            mesh: unit_cube(),
            materials: vec![Material::default()],
            lights: vec![Light::directional(Vec3::NEG_Y, Vec3::ONE, 1.0)],
        }
    }

    fn floor_gbuffer() -> GBuffer {
        let mut gbuffer = GBuffer::new(2, 2);
        let sample = SurfaceSample {
            position: Vec3::new(1.5, -0.5, 0.0),
            normal: Vec3::Y,
            albedo: Vec3::splat(0.5),
            roughness: 0.5,
        };
        gbuffer.set(0, 0, Some(sample), Vec3::splat(0.2));
        gbuffer.set(1, 1, None, Vec3::splat(0.1));
        gbuffer
    }

    fn camera() -> Camera {
        Camera::new(Vec3::new(0.0, 2.0, 3.0))
    }

    #[test]
    fn new_registers_default_passes() {
        let pipeline = VxgiPipeline::new(cube_config()).expect("pipeline");
        assert_eq!(
            pipeline.pass_kinds(),
            vec![
                PassKind::Voxelization,
                PassKind::RadianceInjection,
                PassKind::ConeTracingResolve,
            ]
        );
        assert_eq!(pipeline.state(), FrameStage::Idle);
        assert_eq!(pipeline.grid().mip_count(), 6);
    }

    #[test]
    fn lit_cube_gets_radiance_on_top_only() {
        let mut pipeline = VxgiPipeline::new(cube_config()).expect("pipeline");
        let scene = cube_scene();
        let gbuffer = floor_gbuffer();
        let result = pipeline
            .render(&RenderContext::new(&scene, camera(), &gbuffer, &HealthyDevice))
            .expect("render");

        assert_eq!(result.status, FrameStatus::Complete);
        assert_eq!(
            result.stages,
            vec![
                FrameStage::Voxelizing,
                FrameStage::Injecting,
                FrameStage::MipGenerating,
                FrameStage::Resolving,
            ]
        );
        let grid = pipeline.grid();
        let top = grid.texel(0, UVec3::new(16, 18, 16)).expect("top");
        assert_eq!(top.opacity, 1.0);
        assert!(top.radiance.y > 0.5);
        let bottom = grid.texel(0, UVec3::new(16, 13, 16)).expect("bottom");
        assert_eq!(bottom.opacity, 1.0);
        assert_eq!(bottom.radiance, Vec3::ZERO);
        for c in [UVec3::ZERO, UVec3::new(31, 31, 31), UVec3::new(16, 25, 16)] {
            assert!(grid.texel(0, c).expect("far").is_empty());
        }
        assert!(result.image.indirect[0].y > 0.0);
        assert_eq!(result.image.composite[3], Vec3::splat(0.1));
        assert_eq!(pipeline.state(), FrameStage::Idle);
    }

    #[test]
    fn empty_scene_gives_zero_indirect() {
        let mut pipeline = VxgiPipeline::new(cube_config()).expect("pipeline");
        let scene = Scene::default();
        let gbuffer = floor_gbuffer();
        let result = pipeline
            .render(&RenderContext::new(&scene, camera(), &gbuffer, &HealthyDevice))
            .expect("render");
        assert!(pipeline.grid().is_cleared());
        assert!(result.image.indirect.iter().all(|c| *c == Vec3::ZERO));
        assert_eq!(result.image.composite, gbuffer.direct().to_vec());
    }

    #[test]
    fn non_finite_triangle_is_skipped_not_fatal() {
        let config = VxgiConfig {
            revoxelization: RevoxelizationMode::Incremental,
            ..cube_config()
        };
        let mut pipeline = VxgiPipeline::new(config).expect("pipeline");
        let mut scene = cube_scene();
        scene
            .mesh
            .triangles
            .push([Vec3::new(f32::NAN, 0.0, 0.0), Vec3::X, Vec3::Y]);
        let gbuffer = floor_gbuffer();

        let full = pipeline
            .render(&RenderContext::new(&scene, camera(), &gbuffer, &HealthyDevice))
            .expect("render");
        assert_eq!(full.status, FrameStatus::Complete);
        assert_eq!(full.stats.voxelization.triangles_processed, 12);
        assert_eq!(full.stats.voxelization.degenerate_triangles, 1);

        pipeline.mark_region_dirty(&WorldBounds::new(Vec3::splat(-1.0), Vec3::splat(1.0)));
        let incremental = pipeline
            .render(&RenderContext::new(&scene, camera(), &gbuffer, &HealthyDevice))
            .expect("render");
        assert_eq!(incremental.status, FrameStatus::Complete);
        assert!(!incremental.stats.voxelization.full);
        assert!(incremental.stats.voxelization.triangles_processed >= 12);
        assert_eq!(pipeline.grid().texel(0, UVec3::new(16, 18, 16)).map(|t| t.opacity), Some(1.0));
    }

    #[test]
    fn triangles_outside_bounds_leave_grid_unchanged() {
        let mut pipeline = VxgiPipeline::new(cube_config()).expect("pipeline");
        let far = unit_cube();
        let mut scene = Scene::default();
        scene.mesh = MeshInput::new(far.triangles.iter().map(|t| t.map(|v| v + Vec3::splat(20.0))).collect());
        let gbuffer = GBuffer::new(1, 1);
        let result = pipeline
            .render(&RenderContext::new(&scene, camera(), &gbuffer, &HealthyDevice))
            .expect("render");
        assert!(pipeline.grid().is_cleared());
        assert_eq!(result.stats.voxelization.triangles_out_of_bounds, 12);
    }

    #[test]
    fn device_lost_drops_frame_and_next_frame_is_full() {
        let config = VxgiConfig {
            revoxelization: RevoxelizationMode::Incremental,
            ..cube_config()
        };
        let mut pipeline = VxgiPipeline::new(config).expect("pipeline");
        let scene = cube_scene();
        let gbuffer = floor_gbuffer();
        let healthy = RenderContext::new(&scene, camera(), &gbuffer, &HealthyDevice);

        let first = pipeline.render(&healthy).expect("first");
        assert!(first.stats.voxelization.full);

        let probe = LoseOnce::at(FrameStage::Injecting);
        let lossy = RenderContext::new(&scene, camera(), &gbuffer, &probe);
        let dropped = pipeline.render(&lossy).expect("dropped frame is not an error");
        assert_eq!(
            dropped.status,
            FrameStatus::Dropped {
                stage: FrameStage::Injecting,
                fallback: Fallback::PreviousFrame
            }
        );
        assert!(!dropped.stats.voxelization.full);
        assert_eq!(dropped.image, first.image);
        assert_eq!(pipeline.state(), FrameStage::Idle);

        let recovered = pipeline.render(&lossy).expect("recovered");
        assert!(recovered.status.is_complete());
        assert!(recovered.stats.voxelization.full);
        assert_eq!(pipeline.stats().frames_dropped, 1);
        assert_eq!(pipeline.stats().frames_completed, 2);
        assert_eq!(pipeline.stats().full_voxelizations, 2);
    }

    #[test]
    fn first_frame_loss_falls_back_to_ambient() {
        let mut pipeline = VxgiPipeline::new(cube_config()).expect("pipeline");
        let scene = cube_scene();
        let gbuffer = floor_gbuffer();
        let flag = DeviceLostFlag::new();
        flag.mark_lost();
        let result = pipeline
            .render(&RenderContext::new(&scene, camera(), &gbuffer, &flag))
            .expect("dropped");
        assert_eq!(
            result.status,
            FrameStatus::Dropped {
                stage: FrameStage::Voxelizing,
                fallback: Fallback::Ambient
            }
        );
        assert_eq!(result.image, ResolvedFrame::ambient(&gbuffer, pipeline.config().ambient));
        assert!(result.stages.is_empty());
    }

    #[test]
    fn incremental_mode_only_touches_dirty_regions() {
        let config = VxgiConfig {
            dims: [32, 32, 32],
            bounds: WorldBounds::new(Vec3::ZERO, Vec3::splat(32.0)),
            revoxelization: RevoxelizationMode::Incremental,
            region_dim: 8,
            ..VxgiConfig::default()
        };
        let mut pipeline = VxgiPipeline::new(config).expect("pipeline");
        let gbuffer = GBuffer::new(1, 1);
        let near = [Vec3::new(1.2, 1.2, 1.5), Vec3::new(5.8, 1.2, 1.5), Vec3::new(1.2, 5.8, 1.5)];
        let far = near.map(|v| v + Vec3::splat(16.0));

        let before = Scene {
            mesh: MeshInput::new(vec![near]),
            ..Scene::default()
        };
        pipeline
            .render(&RenderContext::new(&before, camera(), &gbuffer, &HealthyDevice))
            .expect("first");
        let near_voxel = UVec3::new(2, 2, 1);
        let far_voxel = UVec3::new(18, 18, 17);
        assert_eq!(pipeline.grid().texel(0, near_voxel).map(|t| t.opacity), Some(1.0));

        // Move the triangle but only report the destination as dirty.
        let after = Scene {
            mesh: MeshInput::new(vec![far]),
            ..Scene::default()
        };
        let added = pipeline.mark_region_dirty(&WorldBounds::new(Vec3::splat(17.0), Vec3::new(22.0, 22.0, 18.0)));
        assert_eq!(added, 1);
        let result = pipeline
            .render(&RenderContext::new(&after, camera(), &gbuffer, &HealthyDevice))
            .expect("second");
        assert!(!result.stats.voxelization.full);
        assert_eq!(result.stats.voxelization.regions_rebuilt, 1);
        assert_eq!(pipeline.grid().texel(0, far_voxel).map(|t| t.opacity), Some(1.0));
        assert_eq!(pipeline.grid().texel(0, near_voxel).map(|t| t.opacity), Some(1.0));

        pipeline.mark_region_dirty(&WorldBounds::new(Vec3::splat(1.0), Vec3::splat(2.0)));
        pipeline
            .render(&RenderContext::new(&after, camera(), &gbuffer, &HealthyDevice))
            .expect("third");
        assert_eq!(pipeline.grid().texel(0, near_voxel).map(|t| t.opacity), Some(0.0));
        assert_eq!(pipeline.grid().texel(0, far_voxel).map(|t| t.opacity), Some(1.0));
        assert_eq!(pipeline.dirty_region_count(), 0);
        assert_eq!(pipeline.stats().incremental_voxelizations, 2);
    }

    #[test]
    fn invalidate_forces_full_voxelization() {
        let config = VxgiConfig {
            revoxelization: RevoxelizationMode::Incremental,
            ..cube_config()
        };
        let mut pipeline = VxgiPipeline::new(config).expect("pipeline");
        let scene = cube_scene();
        let gbuffer = GBuffer::new(1, 1);
        let ctx = RenderContext::new(&scene, camera(), &gbuffer, &HealthyDevice);
        pipeline.render(&ctx).expect("first");
        assert!(!pipeline.render(&ctx).expect("second").stats.voxelization.full);
        pipeline.invalidate();
        assert!(pipeline.render(&ctx).expect("third").stats.voxelization.full);
    }

    #[test]
    fn dependency_order_is_validated() {
        let err = VxgiPipeline::with_passes(cube_config(), vec![Box::new(RadianceInjectionPass::new())])
            .err()
            .expect("missing dependency");
        assert!(matches!(err, VxgiError::Configuration(_)));

        let mut pipeline = VxgiPipeline::new(cube_config()).expect("pipeline");
        let dup = pipeline.add_pass(Box::new(VoxelizationPass::new()));
        assert!(matches!(dup, Err(VxgiError::Configuration(_))));
        assert_eq!(pipeline.pass_kinds().len(), 3);
    }

    /// Claims to inject but jumps straight to resolving.
    struct SkippingPass;

    impl VxgiPass for SkippingPass {
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
            ctx.begin_stage(FrameStage::Resolving)
        }
    }

    #[test]
    fn skipping_a_stage_is_fatal() {
        let passes: Vec<Box<dyn VxgiPass>> = vec![Box::new(VoxelizationPass::new()), Box::new(SkippingPass)];
        let mut pipeline = VxgiPipeline::with_passes(cube_config(), passes).expect("pipeline");
        let scene = Scene::default();
        let gbuffer = GBuffer::new(1, 1);
        let err = pipeline
            .render(&RenderContext::new(&scene, camera(), &gbuffer, &HealthyDevice))
            .expect_err("stage order");
        assert_eq!(
            err,
            VxgiError::StageOrder {
                from: FrameStage::Voxelizing,
                to: FrameStage::Resolving
            }
        );
        assert!(err.is_fatal());
        assert_eq!(pipeline.state(), FrameStage::Idle);
    }

    #[test]
    fn resize_failure_keeps_old_grid() {
        let mut pipeline = VxgiPipeline::new(cube_config()).expect("pipeline");
        let huge = pipeline.resize([1024, 1024, 1024], WorldBounds::new(Vec3::ZERO, Vec3::splat(1024.0)));
        assert!(matches!(huge, Err(VxgiError::Allocation(_))));
        assert_eq!(pipeline.grid().dims(), [32, 32, 32]);

        let bad = pipeline.resize([16, 16, 16], WorldBounds::new(Vec3::ZERO, Vec3::new(16.0, 8.0, 16.0)));
        assert!(matches!(bad, Err(VxgiError::Configuration(_))));

        pipeline
            .resize([16, 16, 16], WorldBounds::new(Vec3::splat(-2.0), Vec3::splat(2.0)))
            .expect("resize");
        assert_eq!(pipeline.grid().dims(), [16, 16, 16]);
        assert_eq!(pipeline.config().dims, [16, 16, 16]);
        assert_eq!(pipeline.grid().voxel_size(), 0.25);
    }
}
