//! Frame stages and the pass interface the pipeline drives.

pub mod inject;
pub mod resolve;
pub mod voxelize;

pub use inject::RadianceInjectionPass;
pub use resolve::ConeTracingResolvePass;
pub use voxelize::VoxelizationPass;

use crate::core::VxgiConfig;
use crate::dirty::RegionCoord;
use crate::error::{Result, VxgiError};
use crate::frame::{RenderContext, ResolvedFrame};
use crate::grid::VoxelGrid;
use crate::stats::FrameStats;

/// Identity of a pass, used for dependency checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    Voxelization,
    RadianceInjection,
    ConeTracingResolve,
}

/// Where a frame currently is.
///
/// Stages only advance in declaration order and wrap back to `Idle`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrameStage {
    #[default]
    Idle,
    Voxelizing,
    Injecting,
    MipGenerating,
    Resolving,
}

impl FrameStage {
    /// The only stage allowed to follow this one.
    pub fn next(self) -> FrameStage {
        match self {
            FrameStage::Idle => FrameStage::Voxelizing,
            FrameStage::Voxelizing => FrameStage::Injecting,
            FrameStage::Injecting => FrameStage::MipGenerating,
            FrameStage::MipGenerating => FrameStage::Resolving,
            FrameStage::Resolving => FrameStage::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, FrameStage::Idle)
    }
}

/// How much of the grid this frame's voxelization rebuilds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoxelizationPlan {
    Full,
    /// Clear and re-voxelize only these regions.
    Regions(Vec<RegionCoord>),
}

impl VoxelizationPlan {
    pub fn is_full(&self) -> bool {
        matches!(self, VoxelizationPlan::Full)
    }
}

/// What the passes of one frame produce.
#[derive(Clone, Debug, Default)]
pub struct FrameOutputs {
    pub stats: FrameStats,
    /// Set by the resolve pass.
    pub image: Option<ResolvedFrame>,
    /// Stages entered, in order.
    pub stages: Vec<FrameStage>,
}

/// Borrowed view of the pipeline handed to each pass for one frame.
pub struct PassContext<'a> {
    pub grid: &'a mut VoxelGrid,
    pub frame: RenderContext<'a>,
    pub config: &'a VxgiConfig,
    pub plan: VoxelizationPlan,
    pub outputs: FrameOutputs,
    stage: FrameStage,
}

impl<'a> PassContext<'a> {
    pub fn new(
        grid: &'a mut VoxelGrid,
        frame: RenderContext<'a>,
        config: &'a VxgiConfig,
        plan: VoxelizationPlan,
    ) -> Self {
        Self {
            grid,
            frame,
            config,
            plan,
            outputs: FrameOutputs::default(),
            stage: FrameStage::Idle,
        }
    }

    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    /// Enters `stage`. Fails if it does not directly follow the current
    /// stage or if the device was lost.
    pub fn begin_stage(&mut self, stage: FrameStage) -> Result<()> {
        if stage.is_idle() || self.stage.next() != stage {
            return Err(VxgiError::StageOrder {
                from: self.stage,
                to: stage,
            });
        }
        self.frame.device.check(stage)?;
        log::debug!("vxgi: {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
        self.outputs.stages.push(stage);
        Ok(())
    }

    /// Returns to `Idle`. A frame may stop after any stage, but never skip one.
    pub fn end_frame(&mut self) {
        self.stage = FrameStage::Idle;
    }

    pub fn into_outputs(self) -> FrameOutputs {
        self.outputs
    }
}

/// One stage-owning step of a frame.
pub trait VxgiPass {
    fn kind(&self) -> PassKind;

    /// Passes that must be registered before this one.
    fn dependencies(&self) -> &'static [PassKind];

    /// Called once on registration and again after a resize.
    fn configure(&mut self, config: &VxgiConfig) -> Result<()>;

    fn execute(&mut self, ctx: &mut PassContext<'_>) -> Result<()>;
}

/// Voxelization, injection and resolve, in that order.
pub fn default_passes() -> Vec<Box<dyn VxgiPass>> {
    vec![
        Box::new(VoxelizationPass::new()),
        Box::new(RadianceInjectionPass::new()),
        Box::new(ConeTracingResolvePass::new()),
    ]
}
