//! Shadow-map data consumed by light injection.
//!
//! The renderer normally hands over the depth maps it already rendered for
//! its direct lighting; [`ShadowMap::render_directional`] builds an equivalent
//! orthographic map on the CPU for hosts that do not have one.

use glam::{Mat4, Vec2, Vec3};

use crate::core::{MeshInput, WorldBounds};
use crate::error::{Result, VxgiError};

pub const DEFAULT_DEPTH_BIAS: f32 = 0.002;

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowMap {
    light_view_proj: Mat4,
    resolution: u32,
    /// Normalized light-space depth, row-major, `INFINITY` where nothing was drawn.
    depth: Vec<f32>,
    bias: f32,
}

impl ShadowMap {
    pub fn from_depth(light_view_proj: Mat4, resolution: u32, depth: Vec<f32>, bias: f32) -> Result<Self> {
        if resolution == 0 {
            return Err(VxgiError::Configuration("shadow map resolution must be > 0".into()));
        }
        let expected = resolution as usize * resolution as usize;
        if depth.len() != expected {
            return Err(VxgiError::Configuration(format!(
                "shadow map has {} depth texels, expected {}",
                depth.len(),
                expected
            )));
        }
        if !light_view_proj.is_finite() {
            return Err(VxgiError::Configuration("shadow matrix must be finite".into()));
        }
        Ok(Self {
            light_view_proj,
            resolution,
            depth,
            bias,
        })
    }

    /// Renders an orthographic depth map of `mesh` for a directional light
    /// covering `region`.
    pub fn render_directional(
        mesh: &MeshInput,
        direction: Vec3,
        region: &WorldBounds,
        resolution: u32,
        bias: f32,
    ) -> Result<Self> {
        let dir = direction.normalize_or_zero();
        if dir == Vec3::ZERO {
            return Err(VxgiError::Configuration("light direction must be non-zero".into()));
        }
        region.validate()?;

        let center = region.center();
        let radius = region.extent().length() * 0.5;
        let eye = center - dir * radius * 2.0;
        let up = if dir.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
        let view = Mat4::look_at_rh(eye, center, up);
        let proj = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, radius * 4.0);
        let light_view_proj = proj * view;

        let res = resolution as usize;
        let mut depth = vec![f32::INFINITY; res * res];
        for tri in &mesh.triangles {
            let p = tri.map(|v| light_view_proj.project_point3(v));
            let s = p.map(|v| to_texel_space(v, resolution));
            rasterize_depth(&mut depth, resolution, s, [p[0].z, p[1].z, p[2].z]);
        }

        Self::from_depth(light_view_proj, resolution, depth, bias)
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn light_view_proj(&self) -> Mat4 {
        self.light_view_proj
    }

    pub fn depth_at(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.resolution || y >= self.resolution {
            return None;
        }
        self.depth
            .get(y as usize * self.resolution as usize + x as usize)
            .copied()
    }

    /// Fraction of a 3×3 PCF kernel around `world` that is lit. Points outside
    /// the map are lit.
    pub fn visibility(&self, world: Vec3) -> f32 {
        let ndc = self.light_view_proj.project_point3(world);
        if !ndc.is_finite()
            || ndc.x.abs() > 1.0
            || ndc.y.abs() > 1.0
            || ndc.z < 0.0
            || ndc.z > 1.0
        {
            return 1.0;
        }
        let s = to_texel_space(ndc, self.resolution);
        let last = self.resolution as i32 - 1;
        let cx = s.x.floor() as i32;
        let cy = s.y.floor() as i32;

        let mut lit = 0u32;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let x = (cx + dx).clamp(0, last) as usize;
                let y = (cy + dy).clamp(0, last) as usize;
                let stored = self.depth[y * self.resolution as usize + x];
                if ndc.z - self.bias <= stored {
                    lit += 1;
                }
            }
        }
        lit as f32 / 9.0
    }
}

fn to_texel_space(ndc: Vec3, resolution: u32) -> Vec2 {
    Vec2::new(ndc.x * 0.5 + 0.5, ndc.y * 0.5 + 0.5) * resolution as f32
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b - a).perp_dot(p - a)
}

fn rasterize_depth(depth: &mut [f32], resolution: u32, s: [Vec2; 3], z: [f32; 3]) {
    let area = edge(s[0], s[1], s[2]);
    if area.abs() <= f32::EPSILON || !area.is_finite() {
        return;
    }
    let last = resolution as f32 - 1.0;
    let lo = s[0].min(s[1]).min(s[2]).floor().max(Vec2::ZERO);
    let hi = s[0].max(s[1]).max(s[2]).ceil().min(Vec2::splat(last));
    if lo.x > hi.x || lo.y > hi.y {
        return;
    }

    for y in lo.y as u32..=hi.y as u32 {
        for x in lo.x as u32..=hi.x as u32 {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let w0 = edge(s[1], s[2], p) / area;
            let w1 = edge(s[2], s[0], p) / area;
            let w2 = edge(s[0], s[1], p) / area;
            if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                continue;
            }
            let d = w0 * z[0] + w1 * z[1] + w2 * z[2];
            let texel = &mut depth[y as usize * resolution as usize + x as usize];
            if d < *texel {
                *texel = d;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor_and_blocker() -> MeshInput {
        let quad = |y: f32, h: f32| {
            [
                [Vec3::new(-h, y, -h), Vec3::new(h, y, -h), Vec3::new(h, y, h)],
                [Vec3::new(-h, y, -h), Vec3::new(h, y, h), Vec3::new(-h, y, h)],
            ]
        };
        let mut triangles = Vec::new();
        triangles.extend(quad(-2.0, 4.0));
        triangles.extend(quad(1.0, 1.0));
        MeshInput::new(triangles)
    }

    #[test]
    fn blocker_shadows_floor_below_it() {
        let region = WorldBounds::new(Vec3::splat(-4.0), Vec3::splat(4.0));
        let map = ShadowMap::render_directional(
            &floor_and_blocker(),
            Vec3::NEG_Y,
            &region,
            128,
            DEFAULT_DEPTH_BIAS,
        )
        .expect("shadow map");

        assert_eq!(map.visibility(Vec3::new(0.0, -1.9, 0.0)), 0.0);
        assert_eq!(map.visibility(Vec3::new(3.0, -1.9, 3.0)), 1.0);
        assert_eq!(map.visibility(Vec3::new(0.0, 1.1, 0.0)), 1.0);
    }

    #[test]
    fn points_outside_the_map_are_lit() {
        let region = WorldBounds::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let map = ShadowMap::render_directional(
            &floor_and_blocker(),
            Vec3::NEG_Y,
            &region,
            16,
            DEFAULT_DEPTH_BIAS,
        )
        .expect("shadow map");
        assert_eq!(map.visibility(Vec3::new(50.0, 0.0, 0.0)), 1.0);
    }

    #[test]
    fn from_depth_validates_size() {
        assert!(ShadowMap::from_depth(Mat4::IDENTITY, 4, vec![1.0; 15], 0.0).is_err());
        assert!(ShadowMap::from_depth(Mat4::IDENTITY, 0, vec![], 0.0).is_err());
        let map = ShadowMap::from_depth(Mat4::IDENTITY, 2, vec![0.5; 4], 0.0).expect("map");
        assert_eq!(map.depth_at(1, 1), Some(0.5));
        assert_eq!(map.depth_at(2, 0), None);
    }
}
