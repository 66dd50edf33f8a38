//! Cone descriptors and the cone march through the voxel mip pyramid.

use std::f32::consts::{FRAC_PI_4, TAU};

use glam::{Mat3, Vec3};

use crate::core::ConeConfig;
use crate::grid::VoxelGrid;

/// Elevation of the outer diffuse ring, measured from the normal.
const RING_ELEVATION: f32 = std::f32::consts::FRAC_PI_3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConeDescriptor {
    /// Tangent-space direction, +Z is the surface normal.
    pub direction: Vec3,
    /// Half-angle in radians.
    pub aperture: f32,
    pub weight: f32,
}

/// Diffuse hemisphere cones around a surface normal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConeSet {
    pub diffuse: Vec<ConeDescriptor>,
}

impl ConeSet {
    /// One cone along the normal, the rest evenly spaced on a ring at 60°.
    /// Weights follow the cosine lobe and sum to one.
    pub fn diffuse_hemisphere(count: u32, aperture: f32) -> Self {
        let count = count.max(1);
        let mut diffuse = Vec::with_capacity(count as usize);
        diffuse.push(ConeDescriptor {
            direction: Vec3::Z,
            aperture,
            weight: 1.0,
        });

        let ring = count - 1;
        let (sin_e, cos_e) = RING_ELEVATION.sin_cos();
        for i in 0..ring {
            let azimuth = TAU * i as f32 / ring as f32;
            let (sin_a, cos_a) = azimuth.sin_cos();
            diffuse.push(ConeDescriptor {
                direction: Vec3::new(sin_e * cos_a, sin_e * sin_a, cos_e),
                aperture,
                weight: cos_e,
            });
        }

        let total: f32 = diffuse.iter().map(|c| c.weight).sum();
        for cone in &mut diffuse {
            cone.weight /= total;
        }
        Self { diffuse }
    }

    pub fn from_config(config: &ConeConfig) -> Self {
        Self::diffuse_hemisphere(config.diffuse_cones, config.diffuse_aperture)
    }

    pub fn len(&self) -> usize {
        self.diffuse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffuse.is_empty()
    }
}

/// Half-angle of the specular cone for a given roughness.
pub fn specular_aperture(roughness: f32, min_aperture: f32) -> f32 {
    (roughness.clamp(0.0, 1.0) * FRAC_PI_4).max(min_aperture)
}

/// Rotation taking tangent space (+Z) to world space around `normal`.
pub fn tangent_frame(normal: Vec3) -> Mat3 {
    let n = normal.normalize_or_zero();
    let n = if n == Vec3::ZERO { Vec3::Z } else { n };
    let (t, b) = n.any_orthonormal_pair();
    Mat3::from_cols(t, b, n)
}

/// Parameters of one cone march, in world units.
#[derive(Debug, Clone, Copy)]
pub struct ConeParams {
    pub origin: Vec3,
    pub direction: Vec3,
    pub aperture: f32,
    pub max_distance: f32,
    pub step_scale: f32,
    pub opacity_saturation: f32,
}

impl ConeParams {
    pub fn from_config(origin: Vec3, direction: Vec3, aperture: f32, max_distance: f32, config: &ConeConfig) -> Self {
        Self {
            origin,
            direction,
            aperture,
            max_distance,
            step_scale: config.step_scale,
            opacity_saturation: config.opacity_saturation,
        }
    }
}

/// One sample taken along a cone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConeStep {
    /// World-space distance from the cone origin.
    pub distance: f32,
    pub lod: f32,
    pub sample_opacity: f32,
    pub accumulated_opacity: f32,
    pub accumulated_radiance: Vec3,
}

/// Front-to-back march through the pyramid, one [`ConeStep`] per sample.
///
/// The march ends once accumulated opacity reaches the saturation threshold,
/// the distance exceeds the maximum, or the sample footprint leaves the grid.
pub struct ConeMarch<'g> {
    grid: &'g VoxelGrid,
    origin: Vec3,
    direction: Vec3,
    diameter_per_unit: f32,
    /// Voxel units.
    distance: f32,
    max_distance: f32,
    step_scale: f32,
    saturation: f32,
    max_lod: f32,
    opacity: f32,
    radiance: Vec3,
    done: bool,
}

impl<'g> ConeMarch<'g> {
    pub fn new(grid: &'g VoxelGrid, params: &ConeParams) -> Self {
        let voxel = grid.voxel_size();
        let direction = params.direction.normalize_or_zero();
        Self {
            grid,
            origin: grid.world_to_grid(params.origin),
            direction,
            diameter_per_unit: 2.0 * params.aperture.tan().max(0.0),
            // Callers offset the origin off the surface; the first sample sits on it.
            distance: 0.0,
            max_distance: params.max_distance.max(0.0) / voxel,
            step_scale: params.step_scale.max(1e-3),
            saturation: params.opacity_saturation.clamp(0.0, 1.0),
            max_lod: (grid.mip_count() - 1) as f32,
            opacity: 0.0,
            radiance: Vec3::ZERO,
            done: direction == Vec3::ZERO,
        }
    }
}

impl Iterator for ConeMarch<'_> {
    type Item = ConeStep;

    fn next(&mut self) -> Option<ConeStep> {
        if self.done || self.opacity >= self.saturation || self.distance > self.max_distance {
            self.done = true;
            return None;
        }

        let diameter = (self.diameter_per_unit * self.distance).max(1.0);
        let pos = self.origin + self.direction * self.distance;
        let dims = Vec3::new(
            self.grid.dims()[0] as f32,
            self.grid.dims()[1] as f32,
            self.grid.dims()[2] as f32,
        );
        let reach = diameter * 0.5;
        if (pos + reach).cmplt(Vec3::ZERO).any() || (pos - reach).cmpgt(dims).any() {
            self.done = true;
            return None;
        }

        let lod = diameter.log2().clamp(0.0, self.max_lod);
        let sample = self.grid.sample(pos, lod);
        let sample_opacity = sample.opacity.clamp(0.0, 1.0);
        let transmittance = 1.0 - self.opacity;
        self.radiance += transmittance * sample.radiance.max(Vec3::ZERO);
        self.opacity = (self.opacity + transmittance * sample_opacity).clamp(0.0, 1.0);

        let step = ConeStep {
            distance: self.distance * self.grid.voxel_size(),
            lod,
            sample_opacity,
            accumulated_opacity: self.opacity,
            accumulated_radiance: self.radiance,
        };
        self.distance += diameter * self.step_scale;
        Some(step)
    }
}

/// Final result of a cone march.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConeTrace {
    pub radiance: Vec3,
    pub opacity: f32,
    pub distance: f32,
    pub steps: u32,
}

pub fn trace_cone(grid: &VoxelGrid, params: &ConeParams) -> ConeTrace {
    ConeMarch::new(grid, params).fold(ConeTrace::default(), |acc, step| ConeTrace {
        radiance: step.accumulated_radiance,
        opacity: step.accumulated_opacity,
        distance: step.distance,
        steps: acc.steps + 1,
    })
}
