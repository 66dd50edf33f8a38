//! Triangle voxelization into level 0 of the grid.

use glam::{UVec3, Vec3};
use rayon::prelude::*;

use crate::core::{Scene, VoxelBox, VxgiConfig};
use crate::csr::build_region_csr;
use crate::error::Result;
use crate::grid::{linear_index, Texel, VoxelGrid, VoxelSurface};
use crate::raster::{clamped_barycentric, rasterize_triangle, Coverage};
use crate::stats::VoxelizationStats;

use super::{FrameStage, PassContext, PassKind, VoxelizationPlan, VxgiPass};

/// One covered voxel produced by one triangle.
#[derive(Clone, Copy, Debug)]
struct VoxelFragment {
    index: usize,
    tri: u32,
    normal: Vec3,
    albedo: Vec3,
    emission: Vec3,
}

/// Per-batch counters, merged into [`VoxelizationStats`].
#[derive(Default)]
struct BatchOutcome {
    processed: usize,
    outside: usize,
    degenerate: usize,
    fragments: usize,
    voxels: usize,
}

#[derive(Debug, Default)]
pub struct VoxelizationPass {
    epsilon: f32,
    region_dim: u32,
}

impl VoxelizationPass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VxgiPass for VoxelizationPass {
    fn kind(&self) -> PassKind {
        PassKind::Voxelization
    }

    fn dependencies(&self) -> &'static [PassKind] {
        &[]
    }

    fn configure(&mut self, config: &VxgiConfig) -> Result<()> {
        config.validate()?;
        self.epsilon = config.epsilon;
        self.region_dim = config.region_dim;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut PassContext<'_>) -> Result<()> {
        ctx.begin_stage(FrameStage::Voxelizing)?;
        let scene = ctx.frame.scene;
        scene.mesh.validate()?;

        let mut stats = VoxelizationStats::default();
        match &ctx.plan {
            VoxelizationPlan::Full => {
                stats.full = true;
                ctx.grid.clear();
                let all: Vec<u32> = (0..scene.mesh.triangles.len() as u32).collect();
                let clip = VoxelBox::full(ctx.grid.dims());
                let outcome = voxelize_batch(ctx.grid, scene, &all, clip, self.epsilon);
                stats.triangles_out_of_bounds = outcome.outside;
                merge(&mut stats, &outcome);
            }
            VoxelizationPlan::Regions(regions) => {
                let csr = build_region_csr(&scene.mesh, ctx.grid, regions, self.region_dim, self.epsilon);
                let dims = ctx.grid.dims();
                for (slot, region) in csr.regions.iter().enumerate() {
                    let clip = region.voxel_box(self.region_dim, dims);
                    ctx.grid.clear_region(clip);
                    let outcome = voxelize_batch(ctx.grid, scene, csr.triangles_for(slot), clip, self.epsilon);
                    merge(&mut stats, &outcome);
                }
                stats.regions_rebuilt = csr.regions.len();
            }
        }

        if stats.any_skipped() {
            log::warn!(
                "vxgi: skipped {} out-of-bounds and {} degenerate triangles",
                stats.triangles_out_of_bounds,
                stats.degenerate_triangles
            );
        }
        log::debug!(
            "vxgi: voxelized {} triangles into {} voxels (full: {})",
            stats.triangles_processed,
            stats.voxels_written,
            stats.full
        );
        ctx.outputs.stats.voxelization = stats;
        Ok(())
    }
}

fn merge(stats: &mut VoxelizationStats, outcome: &BatchOutcome) {
    stats.triangles_processed += outcome.processed;
    stats.degenerate_triangles += outcome.degenerate;
    stats.fragments += outcome.fragments;
    stats.voxels_written += outcome.voxels;
}

/// Rasterizes `tris` clipped to `clip` and writes the averaged fragments.
///
/// Fragments are sorted by `(voxel, triangle)` before reduction so the result
/// does not depend on how rayon scheduled the triangles.
fn voxelize_batch(grid: &mut VoxelGrid, scene: &Scene, tris: &[u32], clip: VoxelBox, epsilon: f32) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    let view: &VoxelGrid = grid;
    let dims = view.dims();

    let coverage: Vec<(u32, Coverage)> = tris
        .par_iter()
        .map(|&t| {
            let tri = scene.mesh.triangles[t as usize].map(|v| view.world_to_grid(v));
            (t, rasterize_triangle(tri, clip, epsilon))
        })
        .collect();

    for (_, c) in &coverage {
        match c {
            Coverage::Voxels(_) => outcome.processed += 1,
            Coverage::Outside => outcome.outside += 1,
            Coverage::Degenerate => outcome.degenerate += 1,
        }
    }

    let mut fragments: Vec<VoxelFragment> = coverage
        .par_iter()
        .flat_map_iter(|(t, c)| {
            let voxels: &[UVec3] = match c {
                Coverage::Voxels(v) => v,
                _ => &[],
            };
            let tri_index = *t as usize;
            let world = scene.mesh.triangles[tri_index];
            let grid_tri = world.map(|v| view.world_to_grid(v));
            let face = (world[1] - world[0]).cross(world[2] - world[0]).normalize_or_zero();
            let normals = scene.mesh.normals.as_ref().and_then(|n| n.get(tri_index));
            let material = scene.material_for(tri_index);

            voxels.iter().map(move |&c| {
                let normal = normals
                    .map(|n| {
                        let b = clamped_barycentric(c.as_vec3() + Vec3::splat(0.5), grid_tri);
                        (n[0] * b.x + n[1] * b.y + n[2] * b.z).normalize_or_zero()
                    })
                    .filter(|n| *n != Vec3::ZERO)
                    .unwrap_or(face);
                VoxelFragment {
                    index: linear_index(dims, c),
                    tri: *t,
                    normal,
                    albedo: material.albedo,
                    emission: material.emissive,
                }
            })
        })
        .collect();
    outcome.fragments = fragments.len();

    fragments.par_sort_unstable_by_key(|f| (f.index, f.tri));

    let (texels, surface) = grid.base_mut();
    let mut start = 0;
    while start < fragments.len() {
        let index = fragments[start].index;
        let mut end = start;
        let mut normal = Vec3::ZERO;
        let mut albedo = Vec3::ZERO;
        let mut emission = Vec3::ZERO;
        while end < fragments.len() && fragments[end].index == index {
            normal += fragments[end].normal;
            albedo += fragments[end].albedo;
            emission += fragments[end].emission;
            end += 1;
        }
        let n = (end - start) as f32;
        let emission = emission / n;
        texels[index] = Texel {
            opacity: 1.0,
            radiance: emission,
            normal: normal.normalize_or_zero(),
        };
        surface[index] = VoxelSurface {
            albedo: albedo / n,
            emission,
        };
        outcome.voxels += 1;
        start = end;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Camera, Material, MeshInput, WorldBounds};
    use crate::frame::{GBuffer, HealthyDevice, RenderContext};

    fn config() -> VxgiConfig {
        VxgiConfig {
            dims: [16, 16, 16],
            bounds: WorldBounds::new(Vec3::ZERO, Vec3::splat(16.0)),
            ..VxgiConfig::default()
        }
    }

    fn run(scene: &Scene, config: &VxgiConfig, plan: VoxelizationPlan, grid: &mut VoxelGrid) -> VoxelizationStats {
        let mut pass = VoxelizationPass::new();
        pass.configure(config).expect("configure");
        let gbuffer = GBuffer::new(1, 1);
        let frame = RenderContext::new(scene, Camera::default(), &gbuffer, &HealthyDevice);
        let mut ctx = PassContext::new(grid, frame, config, plan);
        pass.execute(&mut ctx).expect("voxelize");
        ctx.into_outputs().stats.voxelization
    }

    fn flat_triangle(z: f32) -> [Vec3; 3] {
        [
            Vec3::new(2.2, 2.2, z),
            Vec3::new(6.8, 2.2, z),
            Vec3::new(2.2, 6.8, z),
        ]
    }

    #[test]
    fn flat_triangle_fills_one_layer() {
        let config = config();
        let mut grid = VoxelGrid::allocate(config.dims, config.bounds, &config.limits).expect("grid");
        let scene = Scene {
            mesh: MeshInput::new(vec![flat_triangle(3.5)]),
            materials: vec![Material {
                albedo: Vec3::new(0.2, 0.4, 0.6),
                emissive: Vec3::new(1.0, 0.0, 0.0),
            }],
            ..Scene::default()
        };
        let stats = run(&scene, &config, VoxelizationPlan::Full, &mut grid);

        assert!(stats.full);
        assert_eq!(stats.triangles_processed, 1);
        assert_eq!(stats.voxels_written, grid.occupied_voxels());
        let texel = grid.texel(0, UVec3::new(3, 3, 3)).expect("texel");
        assert_eq!(texel.opacity, 1.0);
        assert!((texel.normal - Vec3::Z).length() < 1e-5);
        assert_eq!(texel.radiance, Vec3::new(1.0, 0.0, 0.0));
        let surface = grid.surface(UVec3::new(3, 3, 3)).expect("surface");
        assert_eq!(surface.albedo, Vec3::new(0.2, 0.4, 0.6));
        for c in [UVec3::new(3, 3, 2), UVec3::new(3, 3, 4)] {
            assert_eq!(grid.texel(0, c).map(|t| t.opacity), Some(0.0));
        }
    }

    #[test]
    fn overlapping_triangles_average_their_attributes() {
        let config = config();
        let mut grid = VoxelGrid::allocate(config.dims, config.bounds, &config.limits).expect("grid");
        let mut mesh = MeshInput::new(vec![flat_triangle(3.5), flat_triangle(3.5)]);
        mesh.material_ids = Some(vec![0, 1]);
        let scene = Scene {
            mesh,
            materials: vec![
                Material {
                    albedo: Vec3::ONE,
                    emissive: Vec3::ZERO,
                },
                Material {
                    albedo: Vec3::ZERO,
                    emissive: Vec3::splat(2.0),
                },
            ],
            ..Scene::default()
        };
        run(&scene, &config, VoxelizationPlan::Full, &mut grid);

        let surface = grid.surface(UVec3::new(3, 3, 3)).expect("surface");
        assert_eq!(surface.albedo, Vec3::splat(0.5));
        assert_eq!(surface.emission, Vec3::ONE);
        assert_eq!(grid.texel(0, UVec3::new(3, 3, 3)).map(|t| t.opacity), Some(1.0));
    }

    #[test]
    fn vertex_normals_are_interpolated() {
        let config = config();
        let mut grid = VoxelGrid::allocate(config.dims, config.bounds, &config.limits).expect("grid");
        let mut mesh = MeshInput::new(vec![flat_triangle(3.5)]);
        mesh.normals = Some(vec![[Vec3::Y; 3]]);
        let scene = Scene {
            mesh,
            ..Scene::default()
        };
        run(&scene, &config, VoxelizationPlan::Full, &mut grid);
        let texel = grid.texel(0, UVec3::new(3, 3, 3)).expect("texel");
        assert!((texel.normal - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn skipped_triangles_are_counted() {
        let config = config();
        let mut grid = VoxelGrid::allocate(config.dims, config.bounds, &config.limits).expect("grid");
        let scene = Scene {
            mesh: MeshInput::new(vec![
                [Vec3::splat(40.0), Vec3::new(41.0, 40.0, 40.0), Vec3::new(40.0, 41.0, 40.0)],
                [Vec3::splat(4.0), Vec3::splat(4.0), Vec3::splat(4.0)],
            ]),
            ..Scene::default()
        };
        let stats = run(&scene, &config, VoxelizationPlan::Full, &mut grid);
        assert_eq!(stats.triangles_out_of_bounds, 1);
        assert_eq!(stats.degenerate_triangles, 1);
        assert_eq!(stats.triangles_processed, 0);
        assert!(grid.is_cleared());
    }

    #[test]
    fn non_finite_triangle_does_not_stop_its_neighbours() {
        let config = config();
        let mut grid = VoxelGrid::allocate(config.dims, config.bounds, &config.limits).expect("grid");
        let scene = Scene {
            mesh: MeshInput::new(vec![
                flat_triangle(3.5),
                [Vec3::new(f32::NAN, 8.0, 8.0), Vec3::new(9.0, 8.0, 8.0), Vec3::new(8.0, 9.0, 8.0)],
            ]),
            ..Scene::default()
        };
        let stats = run(&scene, &config, VoxelizationPlan::Full, &mut grid);
        assert_eq!(stats.triangles_processed, 1);
        assert_eq!(stats.degenerate_triangles, 1);
        assert_eq!(grid.texel(0, UVec3::new(3, 3, 3)).map(|t| t.opacity), Some(1.0));
    }

    #[test]
    fn region_plan_leaves_other_regions_alone() {
        let config = config();
        let mut grid = VoxelGrid::allocate(config.dims, config.bounds, &config.limits).expect("grid");
        let old = Scene {
            mesh: MeshInput::new(vec![flat_triangle(3.5)]),
            ..Scene::default()
        };
        run(&old, &config, VoxelizationPlan::Full, &mut grid);
        let before = grid.occupied_voxels();

        let far = flat_triangle(3.5).map(|v| v + Vec3::new(8.0, 8.0, 8.0));
        let new = Scene {
            mesh: MeshInput::new(vec![far]),
            ..Scene::default()
        };
        let plan = VoxelizationPlan::Regions(vec![crate::dirty::RegionCoord::new(1, 1, 1)]);
        let stats = run(&new, &config, plan, &mut grid);

        assert!(!stats.full);
        assert_eq!(stats.regions_rebuilt, 1);
        assert_eq!(grid.texel(0, UVec3::new(3, 3, 3)).map(|t| t.opacity), Some(1.0));
        assert_eq!(grid.texel(0, UVec3::new(11, 11, 11)).map(|t| t.opacity), Some(1.0));
        assert_eq!(grid.occupied_voxels(), before * 2);
    }
}
