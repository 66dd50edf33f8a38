//! Per-frame inputs and outputs exchanged with the host renderer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::Vec3;

use crate::core::{Camera, Scene};
use crate::error::{Result, VxgiError};
use crate::passes::FrameStage;

/// Health check consulted at every stage boundary.
pub trait DeviceProbe {
    fn check(&self, stage: FrameStage) -> Result<()>;
}

/// Probe for hosts without device-loss reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthyDevice;

impl DeviceProbe for HealthyDevice {
    fn check(&self, _stage: FrameStage) -> Result<()> {
        Ok(())
    }
}

/// Shareable flag a device-lost callback can trip from any thread.
#[derive(Debug, Clone, Default)]
pub struct DeviceLostFlag {
    lost: Arc<AtomicBool>,
}

impl DeviceLostFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    /// Call once the host has recreated its device.
    pub fn reset(&self) {
        self.lost.store(false, Ordering::Release);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

impl DeviceProbe for DeviceLostFlag {
    fn check(&self, stage: FrameStage) -> Result<()> {
        if self.is_lost() {
            return Err(VxgiError::DeviceLost { stage });
        }
        Ok(())
    }
}

/// Surface attributes of one visible fragment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceSample {
    pub position: Vec3,
    pub normal: Vec3,
    pub albedo: Vec3,
    pub roughness: f32,
}

/// Screen-space surfaces plus the renderer's direct lighting.
#[derive(Debug, Clone)]
pub struct GBuffer {
    width: u32,
    height: u32,
    samples: Vec<Option<SurfaceSample>>,
    direct: Vec<Vec3>,
}

impl GBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            samples: vec![None; len],
            direct: vec![Vec3::ZERO; len],
        }
    }

    pub fn from_parts(
        width: u32,
        height: u32,
        samples: Vec<Option<SurfaceSample>>,
        direct: Vec<Vec3>,
    ) -> Result<Self> {
        let len = width as usize * height as usize;
        if samples.len() != len || direct.len() != len {
            return Err(VxgiError::Configuration(format!(
                "gbuffer {}x{} needs {} samples, got {} samples and {} direct texels",
                width,
                height,
                len,
                samples.len(),
                direct.len()
            )));
        }
        Ok(Self {
            width,
            height,
            samples,
            direct,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn set(&mut self, x: u32, y: u32, sample: Option<SurfaceSample>, direct: Vec3) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = (y * self.width + x) as usize;
        self.samples[i] = sample;
        self.direct[i] = direct;
    }

    pub fn samples(&self) -> &[Option<SurfaceSample>] {
        &self.samples
    }

    pub fn direct(&self) -> &[Vec3] {
        &self.direct
    }
}

/// Indirect light and the final composite for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFrame {
    pub width: u32,
    pub height: u32,
    pub indirect: Vec<Vec3>,
    pub composite: Vec<Vec3>,
}

impl ResolvedFrame {
    pub fn from_indirect(gbuffer: &GBuffer, indirect: Vec<Vec3>) -> Self {
        let composite = gbuffer
            .direct()
            .iter()
            .zip(&indirect)
            .map(|(direct, indirect)| *direct + *indirect)
            .collect();
        Self {
            width: gbuffer.width(),
            height: gbuffer.height(),
            indirect,
            composite,
        }
    }

    /// Flat ambient term in place of cone-traced light.
    pub fn ambient(gbuffer: &GBuffer, ambient: Vec3) -> Self {
        let indirect = gbuffer
            .samples()
            .iter()
            .map(|s| s.map_or(Vec3::ZERO, |s| s.albedo * ambient))
            .collect();
        Self::from_indirect(gbuffer, indirect)
    }

    /// Reuses this frame's indirect light over a new frame's direct light.
    pub fn recomposite(&self, gbuffer: &GBuffer) -> Option<Self> {
        if self.width != gbuffer.width() || self.height != gbuffer.height() {
            return None;
        }
        Some(Self::from_indirect(gbuffer, self.indirect.clone()))
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Vec3> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.composite.get((y * self.width + x) as usize).copied()
    }
}

/// Everything one frame's stages read from the host.
#[derive(Clone, Copy)]
pub struct RenderContext<'a> {
    pub scene: &'a Scene,
    pub camera: Camera,
    pub gbuffer: &'a GBuffer,
    pub device: &'a dyn DeviceProbe,
}

impl<'a> RenderContext<'a> {
    pub fn new(scene: &'a Scene, camera: Camera, gbuffer: &'a GBuffer, device: &'a dyn DeviceProbe) -> Self {
        Self {
            scene,
            camera,
            gbuffer,
            device,
        }
    }
}
