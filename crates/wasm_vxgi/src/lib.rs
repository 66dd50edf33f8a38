use std::fmt;

use glam::Vec3;
use js_sys::{Float32Array, Object, Reflect};
use wasm_bindgen::prelude::*;

use vxgi::shadow::DEFAULT_DEPTH_BIAS;
use vxgi::{
    Camera, DeviceLostFlag, Fallback, FrameStatus, GBuffer, Light, LightKind, Material, MeshInput, RenderContext,
    RevoxelizationMode, Scene, ShadowMap, SurfaceSample, VxgiConfig, VxgiPipeline, WorldBounds,
};

thread_local! {
    static LOG_ENABLED: std::cell::Cell<bool> = std::cell::Cell::new(true);
}

fn log(message: &str) {
    if LOG_ENABLED.with(|enabled| enabled.get()) {
        web_sys::console::log_1(&message.into());
    }
}

/// Forwards `log` records from the pipeline to the browser console.
struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level() && LOG_ENABLED.with(|enabled| enabled.get())
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            log(&format_record(record.level(), record.target(), record.args()));
        }
    }

    fn flush(&self) {}
}

fn format_record(level: log::Level, target: &str, args: &fmt::Arguments<'_>) -> String {
    format!("[wasm_vxgi] {} {}: {}", level, target, args)
}

fn parse_level(level: &str) -> Result<log::LevelFilter, String> {
    level
        .parse::<log::LevelFilter>()
        .map_err(|_| format!("unknown log level '{}'", level))
}

#[wasm_bindgen]
pub fn init_logging() {
    console_error_panic_hook::set_once();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

/// Accepts `off`, `error`, `warn`, `info`, `debug` or `trace`.
#[wasm_bindgen]
pub fn set_log_level(level: &str) -> Result<(), JsValue> {
    let filter = parse_level(level).map_err(|e| JsValue::from_str(&e))?;
    log::set_max_level(filter);
    Ok(())
}

#[wasm_bindgen]
pub fn set_log_enabled(enabled: bool) {
    LOG_ENABLED.with(|flag| flag.set(enabled));
    log(&format!(
        "[wasm_vxgi] logging {}",
        if enabled { "on" } else { "off" }
    ));
}

fn to_js(err: vxgi::VxgiError) -> JsValue {
    JsValue::from_str(&err.to_string())
}

fn vec3_at(data: &[f32], i: usize) -> Vec3 {
    Vec3::new(data[i * 3], data[i * 3 + 1], data[i * 3 + 2])
}

fn vec3_arg(data: &[f32], name: &str) -> Result<Vec3, String> {
    if data.len() < 3 {
        return Err(format!("{name} must have length 3"));
    }
    Ok(vec3_at(data, 0))
}

fn flatten(colors: &[Vec3]) -> Vec<f32> {
    let mut flat = Vec::with_capacity(colors.len() * 3);
    for c in colors {
        flat.extend_from_slice(&c.to_array());
    }
    flat
}

/// Builds a mesh from flat xyz positions, optional flat normals and indices.
fn mesh_from_flat(positions: &[f32], normals: &[f32], indices: &[u32], material_id: u32) -> vxgi::Result<MeshInput> {
    let vertices: Vec<Vec3> = (0..positions.len() / 3).map(|i| vec3_at(positions, i)).collect();
    let normals: Option<Vec<Vec3>> = if normals.is_empty() {
        None
    } else {
        Some((0..normals.len() / 3).map(|i| vec3_at(normals, i)).collect())
    };
    MeshInput::from_indexed(&vertices, normals.as_deref(), indices, Some(material_id))
}

/// Flat per-pixel arrays as produced by a JS-side G-buffer readback.
struct FlatGBuffer<'a> {
    positions: &'a [f32],
    normals: &'a [f32],
    albedo: &'a [f32],
    roughness: &'a [f32],
    direct: &'a [f32],
}

/// Pixels with a zero normal are background.
fn gbuffer_from_flat(width: u32, height: u32, flat: &FlatGBuffer<'_>) -> Result<GBuffer, String> {
    let pixels = width as usize * height as usize;
    for (name, len, per_pixel) in [
        ("positions", flat.positions.len(), 3),
        ("normals", flat.normals.len(), 3),
        ("albedo", flat.albedo.len(), 3),
        ("roughness", flat.roughness.len(), 1),
        ("direct", flat.direct.len(), 3),
    ] {
        if len != pixels * per_pixel {
            return Err(format!(
                "{name} has {len} floats, expected {} for {width}x{height}",
                pixels * per_pixel
            ));
        }
    }

    let mut samples = Vec::with_capacity(pixels);
    let mut direct = Vec::with_capacity(pixels);
    for i in 0..pixels {
        let normal = vec3_at(flat.normals, i);
        samples.push(if normal == Vec3::ZERO {
            None
        } else {
            Some(SurfaceSample {
                position: vec3_at(flat.positions, i),
                normal,
                albedo: vec3_at(flat.albedo, i),
                roughness: flat.roughness[i],
            })
        });
        direct.push(vec3_at(flat.direct, i));
    }
    GBuffer::from_parts(width, height, samples, direct).map_err(|e| e.to_string())
}

/// Re-renders the shadow map of every shadowed directional light against the
/// current mesh. `resolutions` runs parallel to `scene.lights`; zero means
/// unshadowed.
fn refresh_shadows(scene: &mut Scene, resolutions: &[u32], bounds: &WorldBounds) -> vxgi::Result<()> {
    for (light, &resolution) in scene.lights.iter_mut().zip(resolutions) {
        let LightKind::Directional { direction } = light.kind else {
            continue;
        };
        if resolution == 0 {
            continue;
        }
        light.shadow = Some(ShadowMap::render_directional(
            &scene.mesh,
            direction,
            bounds,
            resolution,
            DEFAULT_DEPTH_BIAS,
        )?);
    }
    Ok(())
}

#[wasm_bindgen]
pub struct WasmVxgi {
    pipeline: VxgiPipeline,
    scene: Scene,
    /// Shadow map resolution per entry of `scene.lights`.
    shadow_resolutions: Vec<u32>,
    device: DeviceLostFlag,
}

#[wasm_bindgen]
impl WasmVxgi {
    /// Cubic grid of `resolution³` voxels centred on the origin.
    #[wasm_bindgen(constructor)]
    pub fn new(resolution: u32, half_extent: f32, incremental: bool) -> Result<WasmVxgi, JsValue> {
        let config = VxgiConfig {
            dims: [resolution; 3],
            bounds: WorldBounds::from_center_half_extent(Vec3::ZERO, Vec3::splat(half_extent)),
            max_trace_distance: half_extent * 2.0,
            revoxelization: if incremental {
                RevoxelizationMode::Incremental
            } else {
                RevoxelizationMode::Full
            },
            ..VxgiConfig::default()
        };
        let pipeline = VxgiPipeline::new(config).map_err(to_js)?;
        log(&format!(
            "[wasm_vxgi] init resolution={} half_extent={} incremental={}",
            resolution, half_extent, incremental
        ));
        Ok(WasmVxgi {
            pipeline,
            scene: Scene::default(),
            shadow_resolutions: Vec::new(),
            device: DeviceLostFlag::new(),
        })
    }

    /// Replaces the scene geometry with one mesh of a single material.
    pub fn set_mesh(
        &mut self,
        positions: Float32Array,
        indices: js_sys::Uint32Array,
        albedo: Float32Array,
        emissive: Float32Array,
    ) -> Result<(), JsValue> {
        self.scene.mesh = MeshInput::default();
        self.scene.materials.clear();
        self.add_mesh(positions, Float32Array::new_with_length(0), indices, albedo, emissive)
    }

    /// Appends a mesh with its own material. `normals` may be empty.
    pub fn add_mesh(
        &mut self,
        positions: Float32Array,
        normals: Float32Array,
        indices: js_sys::Uint32Array,
        albedo: Float32Array,
        emissive: Float32Array,
    ) -> Result<(), JsValue> {
        let material = Material {
            albedo: vec3_arg(&albedo.to_vec(), "albedo").map_err(|e| JsValue::from_str(&e))?,
            emissive: vec3_arg(&emissive.to_vec(), "emissive").map_err(|e| JsValue::from_str(&e))?,
        };
        let material_id = self.scene.materials.len() as u32;
        let mesh = mesh_from_flat(&positions.to_vec(), &normals.to_vec(), &indices.to_vec(), material_id)
            .map_err(to_js)?;
        log(&format!(
            "[wasm_vxgi] add_mesh triangles={} material={}",
            mesh.triangles.len(),
            material_id
        ));
        self.scene.materials.push(material);
        self.scene.mesh.append(mesh);
        self.pipeline.invalidate();
        refresh_shadows(&mut self.scene, &self.shadow_resolutions, &self.pipeline.config().bounds).map_err(to_js)
    }

    /// Drops all geometry and materials.
    pub fn clear_meshes(&mut self) -> Result<(), JsValue> {
        self.scene.mesh = MeshInput::default();
        self.scene.materials.clear();
        self.pipeline.invalidate();
        refresh_shadows(&mut self.scene, &self.shadow_resolutions, &self.pipeline.config().bounds).map_err(to_js)
    }

    /// `shadow_resolution` of zero leaves the light unshadowed. Shadow maps
    /// are re-rendered whenever the mesh changes.
    pub fn add_directional_light(
        &mut self,
        direction: Float32Array,
        color: Float32Array,
        intensity: f32,
        shadow_resolution: u32,
    ) -> Result<(), JsValue> {
        let direction = vec3_arg(&direction.to_vec(), "direction").map_err(|e| JsValue::from_str(&e))?;
        let color = vec3_arg(&color.to_vec(), "color").map_err(|e| JsValue::from_str(&e))?;
        let mut light = Light::directional(direction, color, intensity);
        if shadow_resolution > 0 {
            let map = ShadowMap::render_directional(
                &self.scene.mesh,
                direction,
                &self.pipeline.config().bounds,
                shadow_resolution,
                DEFAULT_DEPTH_BIAS,
            )
            .map_err(to_js)?;
            light = light.with_shadow(map);
        }
        self.scene.lights.push(light);
        self.shadow_resolutions.push(shadow_resolution);
        Ok(())
    }

    pub fn add_point_light(
        &mut self,
        position: Float32Array,
        range: f32,
        color: Float32Array,
        intensity: f32,
    ) -> Result<(), JsValue> {
        let position = vec3_arg(&position.to_vec(), "position").map_err(|e| JsValue::from_str(&e))?;
        let color = vec3_arg(&color.to_vec(), "color").map_err(|e| JsValue::from_str(&e))?;
        self.scene.lights.push(Light::point(position, range, color, intensity));
        self.shadow_resolutions.push(0);
        Ok(())
    }

    pub fn clear_lights(&mut self) {
        self.scene.lights.clear();
        self.shadow_resolutions.clear();
    }

    /// Returns the number of newly dirty regions.
    pub fn mark_dirty(&mut self, min: Float32Array, max: Float32Array) -> Result<u32, JsValue> {
        let min = vec3_arg(&min.to_vec(), "min").map_err(|e| JsValue::from_str(&e))?;
        let max = vec3_arg(&max.to_vec(), "max").map_err(|e| JsValue::from_str(&e))?;
        Ok(self.pipeline.mark_region_dirty(&WorldBounds::new(min, max)) as u32)
    }

    /// Hook for the host's device-lost callback.
    pub fn notify_device_lost(&self) {
        log("[wasm_vxgi] device lost");
        self.device.mark_lost();
    }

    pub fn notify_device_restored(&self) {
        self.device.reset();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn render(
        &mut self,
        width: u32,
        height: u32,
        positions: Float32Array,
        normals: Float32Array,
        albedo: Float32Array,
        roughness: Float32Array,
        direct: Float32Array,
        camera: Float32Array,
    ) -> Result<Object, JsValue> {
        let positions = positions.to_vec();
        let normals = normals.to_vec();
        let albedo = albedo.to_vec();
        let roughness = roughness.to_vec();
        let direct = direct.to_vec();
        let flat = FlatGBuffer {
            positions: &positions,
            normals: &normals,
            albedo: &albedo,
            roughness: &roughness,
            direct: &direct,
        };
        let gbuffer = gbuffer_from_flat(width, height, &flat).map_err(|e| JsValue::from_str(&e))?;
        let eye = vec3_arg(&camera.to_vec(), "camera").map_err(|e| JsValue::from_str(&e))?;

        let frame = RenderContext::new(&self.scene, Camera::new(eye), &gbuffer, &self.device);
        let result = self.pipeline.render(&frame).map_err(to_js)?;

        let (status, fallback) = match result.status {
            FrameStatus::Complete => ("complete", None),
            FrameStatus::Dropped { fallback, .. } => (
                "dropped",
                Some(match fallback {
                    Fallback::PreviousFrame => "previous",
                    Fallback::Ambient => "ambient",
                }),
            ),
        };
        log(&format!(
            "[wasm_vxgi] frame {} {} voxels={} cones={}",
            result.frame_index,
            status,
            result.stats.voxelization.voxels_written,
            result.stats.resolve.cones_traced
        ));

        let object = Object::new();
        let composite = Float32Array::from(flatten(&result.image.composite).as_slice());
        Reflect::set(&object, &JsValue::from_str("composite"), &composite).ok();
        let indirect = Float32Array::from(flatten(&result.image.indirect).as_slice());
        Reflect::set(&object, &JsValue::from_str("indirect"), &indirect).ok();
        Reflect::set(&object, &JsValue::from_str("status"), &JsValue::from_str(status)).ok();
        if let Some(fallback) = fallback {
            Reflect::set(&object, &JsValue::from_str("fallback"), &JsValue::from_str(fallback)).ok();
        }
        Reflect::set(
            &object,
            &JsValue::from_str("frame_index"),
            &JsValue::from(result.frame_index as f64),
        )
        .ok();
        Reflect::set(
            &object,
            &JsValue::from_str("occupied_voxels"),
            &JsValue::from(self.pipeline.grid().occupied_voxels() as u32),
        )
        .ok();
        Reflect::set(
            &object,
            &JsValue::from_str("full_voxelization"),
            &JsValue::from(result.stats.voxelization.full),
        )
        .ok();
        Ok(object)
    }
}
