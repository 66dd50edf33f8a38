use std::f32::consts::FRAC_PI_2;

use glam::{UVec3, Vec3};

use crate::error::{Result, VxgiError};
use crate::shadow::ShadowMap;

/// Axis-aligned world-space region covered by the voxel grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl WorldBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Inclusive on both faces.
    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &WorldBounds) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(VxgiError::Configuration("bounds must be finite".into()));
        }
        if self.extent().cmple(Vec3::ZERO).any() {
            return Err(VxgiError::Configuration(format!(
                "bounds must have positive extent (min {:?}, max {:?})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// How the scene is re-voxelized each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevoxelizationMode {
    /// Clear and rebuild the whole grid every frame.
    #[default]
    Full,
    /// Rebuild only regions flagged dirty since the previous frame.
    Incremental,
}

/// Memory limits the grid has to fit into.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    /// Upper bound for the whole mip pyramid plus level-0 surface attributes.
    pub max_grid_bytes: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_grid_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Cone set and marching parameters for the resolve pass.
#[derive(Debug, Clone)]
pub struct ConeConfig {
    /// Number of diffuse cones spanning the normal hemisphere.
    pub diffuse_cones: u32,
    /// Half-angle of each diffuse cone, radians.
    pub diffuse_aperture: f32,
    /// Narrowest half-angle the specular cone is allowed to take.
    pub specular_min_aperture: f32,
    pub specular: bool,
    /// Step length as a fraction of the current cone diameter.
    pub step_scale: f32,
    /// Accumulated opacity at which a cone stops.
    pub opacity_saturation: f32,
    pub indirect_intensity: f32,
}

impl Default for ConeConfig {
    fn default() -> Self {
        Self {
            diffuse_cones: 6,
            diffuse_aperture: 30f32.to_radians(),
            specular_min_aperture: 0.05,
            specular: true,
            step_scale: 0.5,
            opacity_saturation: 0.99,
            indirect_intensity: 1.0,
        }
    }
}

impl ConeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.diffuse_cones == 0 || self.diffuse_cones > 16 {
            return Err(VxgiError::Configuration(format!(
                "diffuse_cones must be in 1..=16 (got {})",
                self.diffuse_cones
            )));
        }
        let aperture_ok = |a: f32| a.is_finite() && a > 0.0 && a < FRAC_PI_2;
        if !aperture_ok(self.diffuse_aperture) {
            return Err(VxgiError::Configuration(
                "diffuse_aperture must be in (0, pi/2)".into(),
            ));
        }
        if !aperture_ok(self.specular_min_aperture) {
            return Err(VxgiError::Configuration(
                "specular_min_aperture must be in (0, pi/2)".into(),
            ));
        }
        if !self.step_scale.is_finite() || self.step_scale <= 0.0 {
            return Err(VxgiError::Configuration("step_scale must be > 0".into()));
        }
        if !(self.opacity_saturation > 0.0 && self.opacity_saturation <= 1.0) {
            return Err(VxgiError::Configuration(
                "opacity_saturation must be in (0, 1]".into(),
            ));
        }
        if !self.indirect_intensity.is_finite() || self.indirect_intensity < 0.0 {
            return Err(VxgiError::Configuration(
                "indirect_intensity must be finite and >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Everything the pipeline needs at construction time.
#[derive(Debug, Clone)]
pub struct VxgiConfig {
    /// Grid resolution, power of two per axis.
    pub dims: [u32; 3],
    pub bounds: WorldBounds,
    pub cones: ConeConfig,
    /// World-space length after which a cone stops.
    pub max_trace_distance: f32,
    pub revoxelization: RevoxelizationMode,
    /// Edge length in voxels of a dirty region (incremental mode).
    pub region_dim: u32,
    pub limits: DeviceLimits,
    /// Slack added around each triangle's grid-space bounds.
    pub epsilon: f32,
    /// Indirect term used when no resolved frame is available.
    pub ambient: Vec3,
}

impl Default for VxgiConfig {
    fn default() -> Self {
        Self {
            dims: [64, 64, 64],
            bounds: WorldBounds::new(Vec3::splat(-8.0), Vec3::splat(8.0)),
            cones: ConeConfig::default(),
            max_trace_distance: 8.0,
            revoxelization: RevoxelizationMode::Full,
            region_dim: 8,
            limits: DeviceLimits::default(),
            epsilon: 1e-4,
            ambient: Vec3::splat(0.03),
        }
    }
}

impl VxgiConfig {
    pub fn validate(&self) -> Result<()> {
        validate_dims(self.dims)?;
        self.bounds.validate()?;
        voxel_size_for(self.dims, &self.bounds)?;
        self.cones.validate()?;
        if !self.max_trace_distance.is_finite() || self.max_trace_distance <= 0.0 {
            return Err(VxgiError::Configuration(
                "max_trace_distance must be finite and > 0".into(),
            ));
        }
        if self.region_dim == 0 || !self.region_dim.is_power_of_two() {
            return Err(VxgiError::Configuration(format!(
                "region_dim must be a power of two (got {})",
                self.region_dim
            )));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(VxgiError::Configuration("epsilon must be finite and >= 0".into()));
        }
        if !self.ambient.is_finite() {
            return Err(VxgiError::Configuration("ambient must be finite".into()));
        }
        Ok(())
    }

    pub fn voxel_size(&self) -> Result<f32> {
        voxel_size_for(self.dims, &self.bounds)
    }
}

pub(crate) fn validate_dims(dims: [u32; 3]) -> Result<()> {
    if dims.iter().any(|&d| d == 0 || !d.is_power_of_two()) {
        return Err(VxgiError::Configuration(format!(
            "dims must be non-zero powers of two (got {:?})",
            dims
        )));
    }
    Ok(())
}

/// Voxels are cubic, so every axis must agree on the voxel edge length.
pub(crate) fn voxel_size_for(dims: [u32; 3], bounds: &WorldBounds) -> Result<f32> {
    let extent = bounds.extent();
    let sizes = [
        extent.x / dims[0] as f32,
        extent.y / dims[1] as f32,
        extent.z / dims[2] as f32,
    ];
    let size = sizes[0];
    for s in &sizes[1..] {
        if ((s - size) / size).abs() > 1e-4 {
            return Err(VxgiError::Configuration(format!(
                "bounds extent {:?} and dims {:?} do not give cubic voxels",
                extent, dims
            )));
        }
    }
    Ok(size)
}

/// Surface response of a triangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub albedo: Vec3,
    pub emissive: Vec3,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            albedo: Vec3::splat(0.8),
            emissive: Vec3::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeshInput {
    pub triangles: Vec<[Vec3; 3]>,
    /// Optional per-vertex normals, one triple per triangle.
    pub normals: Option<Vec<[Vec3; 3]>>,
    pub material_ids: Option<Vec<u32>>,
}

impl MeshInput {
    pub fn new(triangles: Vec<[Vec3; 3]>) -> Self {
        Self {
            triangles,
            normals: None,
            material_ids: None,
        }
    }

    /// Builds triangles from an indexed vertex list as delivered by the renderer.
    pub fn from_indexed(
        positions: &[Vec3],
        normals: Option<&[Vec3]>,
        indices: &[u32],
        material_id: Option<u32>,
    ) -> Result<Self> {
        if indices.len() % 3 != 0 {
            return Err(VxgiError::Configuration(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(normals) = normals {
            if normals.len() != positions.len() {
                return Err(VxgiError::Configuration(
                    "normals length must match positions length".into(),
                ));
            }
        }

        let fetch = |i: u32| -> Result<usize> {
            let i = i as usize;
            if i >= positions.len() {
                return Err(VxgiError::OutOfBounds(format!(
                    "index {} exceeds vertex count {}",
                    i,
                    positions.len()
                )));
            }
            Ok(i)
        };

        let face_count = indices.len() / 3;
        let mut triangles = Vec::with_capacity(face_count);
        let mut tri_normals = normals.map(|_| Vec::with_capacity(face_count));
        for face in indices.chunks_exact(3) {
            let a = fetch(face[0])?;
            let b = fetch(face[1])?;
            let c = fetch(face[2])?;
            triangles.push([positions[a], positions[b], positions[c]]);
            if let (Some(out), Some(normals)) = (tri_normals.as_mut(), normals) {
                out.push([normals[a], normals[b], normals[c]]);
            }
        }

        Ok(Self {
            material_ids: material_id.map(|id| vec![id; triangles.len()]),
            triangles,
            normals: tri_normals,
        })
    }

    /// Appends another mesh, keeping per-triangle attributes aligned.
    pub fn append(&mut self, other: MeshInput) {
        let existing = self.triangles.len();
        let incoming = other.triangles.len();

        self.normals = match (self.normals.take(), other.normals) {
            (Some(mut mine), Some(theirs)) => {
                mine.extend(theirs);
                Some(mine)
            }
            (Some(mut mine), None) => {
                mine.extend(std::iter::repeat([Vec3::ZERO; 3]).take(incoming));
                Some(mine)
            }
            (None, Some(theirs)) => {
                let mut merged = vec![[Vec3::ZERO; 3]; existing];
                merged.extend(theirs);
                Some(merged)
            }
            (None, None) => None,
        };

        self.material_ids = match (self.material_ids.take(), other.material_ids) {
            (Some(mut mine), Some(theirs)) => {
                mine.extend(theirs);
                Some(mine)
            }
            (Some(mut mine), None) => {
                mine.extend(std::iter::repeat(0).take(incoming));
                Some(mine)
            }
            (None, Some(theirs)) => {
                let mut merged = vec![0; existing];
                merged.extend(theirs);
                Some(merged)
            }
            (None, None) => None,
        };

        self.triangles.extend(other.triangles);
    }

    /// Checks that per-triangle attributes line up with the triangles.
    ///
    /// Vertex values are not inspected; non-finite triangles are skipped as
    /// degenerate during voxelization.
    pub fn validate(&self) -> Result<()> {
        if let Some(ids) = &self.material_ids {
            if ids.len() != self.triangles.len() {
                return Err(VxgiError::Configuration(
                    "material_ids length must match triangles length".into(),
                ));
            }
        }
        if let Some(normals) = &self.normals {
            if normals.len() != self.triangles.len() {
                return Err(VxgiError::Configuration(
                    "normals length must match triangles length".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    /// `direction` points from the light into the scene.
    Directional { direction: Vec3 },
    Point { position: Vec3, range: f32 },
}

#[derive(Debug, Clone)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    pub shadow: Option<ShadowMap>,
}

impl Light {
    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            kind: LightKind::Directional {
                direction: direction.normalize_or_zero(),
            },
            color,
            intensity,
            shadow: None,
        }
    }

    pub fn point(position: Vec3, range: f32, color: Vec3, intensity: f32) -> Self {
        Self {
            kind: LightKind::Point { position, range },
            color,
            intensity,
            shadow: None,
        }
    }

    pub fn with_shadow(mut self, shadow: ShadowMap) -> Self {
        self.shadow = Some(shadow);
        self
    }

    /// Unit vector towards the light and the distance attenuation at `p`.
    pub fn incidence(&self, p: Vec3) -> (Vec3, f32) {
        match self.kind {
            LightKind::Directional { direction } => (-direction, 1.0),
            LightKind::Point { position, range } => {
                let to_light = position - p;
                let dist = to_light.length();
                if dist <= f32::EPSILON || range <= 0.0 {
                    return (Vec3::ZERO, 0.0);
                }
                let ratio = (dist / range).min(1.0);
                let window = (1.0 - ratio.powi(4)).max(0.0).powi(2);
                (to_light / dist, window / (dist * dist + 1.0))
            }
        }
    }
}

/// Scene snapshot handed to the pipeline each frame.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub mesh: MeshInput,
    pub materials: Vec<Material>,
    pub lights: Vec<Light>,
}

impl Scene {
    pub fn material_for(&self, tri_index: usize) -> Material {
        let id = self
            .mesh
            .material_ids
            .as_ref()
            .and_then(|ids| ids.get(tri_index).copied())
            .unwrap_or(0) as usize;
        self.materials.get(id).copied().unwrap_or_default()
    }
}

/// Viewer placement; the eye position drives the specular reflection cone.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Camera {
    pub position: Vec3,
}

impl Camera {
    pub fn new(position: Vec3) -> Self {
        Self { position }
    }
}

/// Integer box of level-0 voxels, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelBox {
    pub min: UVec3,
    pub max: UVec3,
}

impl VoxelBox {
    pub fn full(dims: [u32; 3]) -> Self {
        Self {
            min: UVec3::ZERO,
            max: UVec3::from_array(dims),
        }
    }

    pub fn contains(&self, c: UVec3) -> bool {
        c.cmpge(self.min).all() && c.cmplt(self.max).all()
    }

    pub fn is_empty(&self) -> bool {
        self.max.cmple(self.min).any()
    }

    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let d = self.max - self.min;
        d.x as u64 * d.y as u64 * d.z as u64
    }
}
