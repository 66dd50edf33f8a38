//! Statistics structs for pipeline stages.

/// Statistics from one voxelization stage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VoxelizationStats {
    /// Whether the whole grid was rebuilt.
    pub full: bool,
    /// Number of dirty regions rebuilt (incremental mode only).
    pub regions_rebuilt: usize,
    /// Triangles rasterized.
    pub triangles_processed: usize,
    /// Triangles skipped because their bounds miss the grid.
    pub triangles_out_of_bounds: usize,
    /// Zero-area triangles skipped.
    pub degenerate_triangles: usize,
    /// Voxel fragments produced before accumulation.
    pub fragments: usize,
    /// Distinct level-0 voxels written.
    pub voxels_written: usize,
}

impl VoxelizationStats {
    /// Check if any triangle was skipped.
    pub fn any_skipped(&self) -> bool {
        self.triangles_out_of_bounds > 0 || self.degenerate_triangles > 0
    }
}

/// Statistics from light injection and mip generation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InjectionStats {
    /// Lights injected this frame.
    pub lights: usize,
    /// Occupied voxels that received radiance.
    pub voxels_lit: usize,
    /// Mip levels rebuilt above level 0.
    pub mip_levels_built: u32,
}

/// Statistics from the cone tracing resolve.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolveStats {
    /// Fragments that were cone traced.
    pub fragments_traced: usize,
    /// Fragments skipped because they lie outside the grid.
    pub fragments_outside: usize,
    /// Total cones marched.
    pub cones_traced: usize,
    /// Total samples taken across all cones.
    pub cone_steps: u64,
}

impl ResolveStats {
    /// Average samples per cone, zero when nothing was traced.
    pub fn mean_steps_per_cone(&self) -> f32 {
        if self.cones_traced == 0 {
            return 0.0;
        }
        self.cone_steps as f32 / self.cones_traced as f32
    }
}

/// Combined statistics for one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub voxelization: VoxelizationStats,
    pub injection: InjectionStats,
    pub resolve: ResolveStats,
}

/// Running totals over the pipeline's lifetime.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineStats {
    /// Frames that completed every stage.
    pub frames_completed: u64,
    /// Frames dropped after a recoverable failure.
    pub frames_dropped: u64,
    /// Full re-voxelizations performed.
    pub full_voxelizations: u64,
    /// Incremental re-voxelizations performed.
    pub incremental_voxelizations: u64,
    /// Statistics of the most recent frame, complete or not.
    pub last_frame: FrameStats,
}

impl PipelineStats {
    /// Total frames attempted.
    pub fn frames_total(&self) -> u64 {
        self.frames_completed + self.frames_dropped
    }
}
